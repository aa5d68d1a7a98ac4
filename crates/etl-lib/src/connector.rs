//! Connector definitions and the registry that resolves them by id
//!
//! Connectors are loaded once at startup. Duplicate ids are a bootstrap
//! failure; a missing id at lookup time is not an error in itself.

use crate::error::BootstrapError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Default connect/read/write timeout in milliseconds
const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// A secret string that never shows up in logs or serialized output
#[derive(Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Access the raw secret for use on the wire
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Secret(***)")
    }
}

impl Serialize for Secret {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str("***")
    }
}

/// Stored credentials and network parameters for one named endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connector {
    pub id: String,
    pub endpoint: url::Url,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<Secret>,
    #[serde(default)]
    pub proxy_host: Option<String>,
    #[serde(default)]
    pub proxy_port: Option<u16>,
    /// Milliseconds
    #[serde(default = "default_timeout")]
    pub connect_timeout: u64,
    /// Milliseconds
    #[serde(default = "default_timeout")]
    pub read_timeout: u64,
    /// Milliseconds
    #[serde(default = "default_timeout")]
    pub write_timeout: u64,
    #[serde(default)]
    pub keystore_path: Option<PathBuf>,
    #[serde(default)]
    pub keystore_password: Option<Secret>,
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_MS
}

impl PartialEq for Connector {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Connector {}

impl std::hash::Hash for Connector {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl Connector {
    /// Minimal connector used by tests and programmatic wiring
    pub fn new(id: impl Into<String>, endpoint: url::Url) -> Self {
        Self {
            id: id.into(),
            endpoint,
            username: None,
            password: None,
            proxy_host: None,
            proxy_port: None,
            connect_timeout: DEFAULT_TIMEOUT_MS,
            read_timeout: DEFAULT_TIMEOUT_MS,
            write_timeout: DEFAULT_TIMEOUT_MS,
            keystore_path: None,
            keystore_password: None,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout)
    }

    /// Overall request timeout: a request may spend the read and the write budget
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout.max(self.write_timeout))
    }

    /// Proxy URL when both host and port are configured
    pub fn proxy_url(&self) -> Option<String> {
        match (&self.proxy_host, self.proxy_port) {
            (Some(host), Some(port)) => Some(format!("http://{host}:{port}")),
            (Some(host), None) => Some(format!("http://{host}")),
            _ => None,
        }
    }

    /// Check invariants that serde cannot express
    pub fn validate(&self) -> std::result::Result<(), BootstrapError> {
        if self.id.trim().is_empty() {
            return Err(BootstrapError::InvalidConnector {
                id: self.id.clone(),
                reason: "id must not be empty".to_string(),
            });
        }
        if self.keystore_path.is_some() != self.keystore_password.is_some() {
            return Err(BootstrapError::InvalidConnector {
                id: self.id.clone(),
                reason: "keystorePath and keystorePassword must be set together".to_string(),
            });
        }
        if self.proxy_port.is_some() && self.proxy_host.is_none() {
            return Err(BootstrapError::InvalidConnector {
                id: self.id.clone(),
                reason: "proxyPort requires proxyHost".to_string(),
            });
        }
        Ok(())
    }
}

/// One list of connectors and where it came from
#[derive(Debug, Clone)]
pub struct ConnectorSource {
    /// Source type used in error messages, e.g. the file stem
    pub source_type: String,
    pub connectors: Vec<Connector>,
}

impl ConnectorSource {
    pub fn new(source_type: impl Into<String>, connectors: Vec<Connector>) -> Self {
        Self {
            source_type: source_type.into(),
            connectors,
        }
    }
}

/// Immutable id -> connector lookup
#[derive(Debug, Default)]
pub struct ConnectorRegistry {
    connectors: HashMap<String, Connector>,
}

impl ConnectorRegistry {
    /// Build the registry, rejecting duplicate ids across all sources
    pub fn new(sources: Vec<ConnectorSource>) -> std::result::Result<Self, BootstrapError> {
        let mut connectors = HashMap::new();

        for source in sources {
            for connector in source.connectors {
                connector.validate()?;
                if connectors.contains_key(&connector.id) {
                    return Err(BootstrapError::DuplicateConnector {
                        id: connector.id,
                        source_type: source.source_type,
                    });
                }
                debug!(id = %connector.id, source = %source.source_type, "Registered connector");
                connectors.insert(connector.id.clone(), connector);
            }
        }

        info!(connectors = connectors.len(), "Connector registry ready");
        Ok(Self { connectors })
    }

    pub fn find_connector(&self, id: &str) -> Option<&Connector> {
        self.connectors.get(id)
    }

    pub fn len(&self) -> usize {
        self.connectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.connectors.keys().map(String::as_str)
    }
}

/// Load connector sources from a JSON file or a directory of JSON files
///
/// Each file is one source; its stem becomes the source type.
pub fn load_connector_sources(path: &Path) -> Result<Vec<ConnectorSource>> {
    let files = json_files(path)?;
    let mut sources = Vec::with_capacity(files.len());

    for file in files {
        let data = std::fs::read(&file)
            .with_context(|| format!("Failed to read connectors from {:?}", file))?;
        let connectors: Vec<Connector> = serde_json::from_slice(&data)
            .with_context(|| format!("Failed to parse connectors in {:?}", file))?;
        let source_type = file
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "connectors".to_string());
        sources.push(ConnectorSource::new(source_type, connectors));
    }

    Ok(sources)
}

/// List `*.json` files at `path` (the path itself if it is a file), sorted
pub(crate) fn json_files(path: &Path) -> Result<Vec<PathBuf>> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }

    let mut files = Vec::new();
    for entry in
        std::fs::read_dir(path).with_context(|| format!("Failed to read directory {:?}", path))?
    {
        let entry = entry?;
        let p = entry.path();
        if p.is_file() && p.extension().map(|e| e == "json").unwrap_or(false) {
            files.push(p);
        }
    }
    files.sort();
    Ok(files)
}
