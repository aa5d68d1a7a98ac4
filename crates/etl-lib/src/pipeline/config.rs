//! Configuration documents driving the pipeline

use crate::connector::json_files;
use crate::models::SeriesDocument;
use crate::polling::PollingConfig;
use crate::transform::TransformSpec;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// One scheduled extract, transform and load job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Configuration {
    /// Defaults to the file stem when loaded from disk
    #[serde(default)]
    pub name: String,
    pub repeat_interval_millis: u64,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub run_once: bool,
    #[serde(default)]
    pub extract: Vec<ExtractSpec>,
    #[serde(default)]
    pub transform: Vec<TransformSpec>,
    #[serde(default)]
    pub load: Vec<LoadSpec>,
}

impl Configuration {
    pub fn repeat_interval(&self) -> Duration {
        Duration::from_millis(self.repeat_interval_millis)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            bail!("configuration name must not be empty");
        }
        if self.repeat_interval_millis == 0 && !self.run_once {
            bail!("configuration '{}' needs a positive repeatIntervalMillis", self.name);
        }
        for spec in &self.load {
            if let LoadSpec::HttpBulk(bulk) = spec {
                if bulk.batch_size == Some(0) {
                    bail!("configuration '{}': batchSize must be positive", self.name);
                }
            }
        }
        Ok(())
    }
}

/// Extract source, tagged by `_type`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "_type", rename_all = "camelCase")]
pub enum ExtractSpec {
    HttpJson(HttpJsonExtract),
    Static(StaticExtract),
}

impl ExtractSpec {
    /// Connector id this source reads from, if any
    pub fn endpoint(&self) -> Option<&str> {
        match self {
            ExtractSpec::HttpJson(e) => Some(&e.endpoint),
            ExtractSpec::Static(_) => None,
        }
    }
}

/// `GET <endpoint>/<path>?<query>` returning series documents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpJsonExtract {
    pub endpoint: String,
    pub path: String,
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    /// Responses are reused for this long when set
    #[serde(default)]
    pub cache_ttl_millis: Option<u64>,
    /// Retry `202 Accepted` responses with triangular backoff
    #[serde(default)]
    pub polling: Option<PollingConfig>,
}

/// Fixed series embedded in the configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaticExtract {
    pub series: Vec<SeriesDocument>,
}

/// Load destination, tagged by `_type`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "_type", rename_all = "camelCase")]
pub enum LoadSpec {
    Log(LogLoad),
    HttpWebhook(HttpWebhookLoad),
    HttpBulk(HttpBulkLoad),
}

impl LoadSpec {
    pub fn endpoint(&self) -> Option<&str> {
        match self {
            LoadSpec::Log(_) => None,
            LoadSpec::HttpWebhook(l) => Some(&l.endpoint),
            LoadSpec::HttpBulk(l) => Some(&l.endpoint),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogLoad {
    #[serde(default)]
    pub level: LogLevel,
}

/// `POST <endpoint>/<path>` with the whole matrix
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpWebhookLoad {
    pub endpoint: String,
    pub path: String,
}

/// `POST <endpoint>/<path>` with batches of flattened points
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpBulkLoad {
    pub endpoint: String,
    pub path: String,
    #[serde(default)]
    pub batch_size: Option<usize>,
}

/// Parse one configuration document, naming it after `fallback_name` if unnamed
pub fn parse_configuration(data: &[u8], fallback_name: &str) -> Result<Configuration> {
    let mut configuration: Configuration = serde_json::from_slice(data)?;
    if configuration.name.is_empty() {
        configuration.name = fallback_name.to_string();
    }
    configuration.validate()?;
    Ok(configuration)
}

/// Load every configuration from a JSON file or a directory of JSON files
pub fn load_configurations(path: &Path) -> Result<Vec<Configuration>> {
    let mut configurations = Vec::new();
    let mut names = HashSet::new();

    for file in json_files(path)? {
        let data = std::fs::read(&file)
            .with_context(|| format!("Failed to read configuration {:?}", file))?;
        let stem = file
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let configuration = parse_configuration(&data, &stem)
            .with_context(|| format!("Invalid configuration {:?}", file))?;

        if !names.insert(configuration.name.clone()) {
            bail!("duplicate configuration name '{}' in {:?}", configuration.name, file);
        }
        configurations.push(configuration);
    }

    info!(
        path = ?path,
        count = configurations.len(),
        "Loaded configurations"
    );
    Ok(configurations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const CPU: &str = r#"{
        "repeatIntervalMillis": 60000,
        "extract": [
            {"_type": "httpJson", "endpoint": "prom", "path": "/api/series",
             "query": {"metric": "cpu"}, "cacheTtlMillis": 30000,
             "polling": {"intervalMillis": 500, "pollingTimeoutMillis": 5000}},
            {"_type": "static", "series": [{"name": "up", "points": [{"time": "2024-01-01T00:00:00Z", "value": 1}]}]}
        ],
        "transform": [
            {"_type": "threshold", "type": "GREATER_THAN_OR_EQUAL", "criticalThreshold": 90}
        ],
        "load": [
            {"_type": "log"},
            {"_type": "httpWebhook", "endpoint": "alerts", "path": "/hook"},
            {"_type": "httpBulk", "endpoint": "store", "path": "/bulk", "batchSize": 500}
        ]
    }"#;

    #[test]
    fn test_parse_full_document() {
        let c = parse_configuration(CPU.as_bytes(), "cpu").unwrap();

        assert_eq!(c.name, "cpu");
        assert_eq!(c.repeat_interval(), Duration::from_secs(60));
        assert!(!c.disabled);
        assert_eq!(c.extract.len(), 2);
        assert_eq!(c.extract[0].endpoint(), Some("prom"));
        assert_eq!(c.extract[1].endpoint(), None);

        match &c.extract[0] {
            ExtractSpec::HttpJson(e) => {
                assert_eq!(e.query.get("metric").map(String::as_str), Some("cpu"));
                assert_eq!(e.polling.unwrap().interval_millis, 500);
            }
            other => panic!("unexpected extract {other:?}"),
        }

        assert_eq!(c.load[0], LoadSpec::Log(LogLoad::default()));
        assert_eq!(c.load[2].endpoint(), Some("store"));
    }

    #[test]
    fn test_explicit_name_wins() {
        let doc = r#"{"name": "memory", "repeatIntervalMillis": 1000}"#;
        let c = parse_configuration(doc.as_bytes(), "file-stem").unwrap();
        assert_eq!(c.name, "memory");
    }

    #[test]
    fn test_unknown_extract_type_rejected() {
        let doc = r#"{"repeatIntervalMillis": 1000, "extract": [{"_type": "ftp", "endpoint": "x"}]}"#;
        assert!(parse_configuration(doc.as_bytes(), "x").is_err());
    }

    #[test]
    fn test_zero_interval_rejected_unless_run_once() {
        let doc = r#"{"repeatIntervalMillis": 0}"#;
        assert!(parse_configuration(doc.as_bytes(), "x").is_err());

        let doc = r#"{"repeatIntervalMillis": 0, "runOnce": true}"#;
        assert!(parse_configuration(doc.as_bytes(), "x").is_ok());
    }

    #[test]
    fn test_load_directory() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("cpu.json"), CPU).unwrap();
        std::fs::write(
            dir.path().join("disk.json"),
            r#"{"repeatIntervalMillis": 1000, "disabled": true}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("README.md"), "ignored").unwrap();

        let configurations = load_configurations(dir.path()).unwrap();
        let names: Vec<_> = configurations.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["cpu", "disk"]);
        assert!(configurations[1].disabled);
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("a.json"),
            r#"{"name": "same", "repeatIntervalMillis": 1000}"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("b.json"),
            r#"{"name": "same", "repeatIntervalMillis": 1000}"#,
        )
        .unwrap();

        let err = load_configurations(dir.path()).unwrap_err();
        assert!(err.to_string().contains("same"));
    }
}
