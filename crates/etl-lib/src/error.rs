//! Error taxonomy for the ETL engine
//!
//! Bootstrap errors stop the process. Everything else is converted to a
//! metered signal by the scheduler and retried on the next cycle.

use thiserror::Error;

/// Wiring defects detected while assembling the pipeline
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("duplicate connector id '{id}' in {source_type} connectors")]
    DuplicateConnector { id: String, source_type: String },

    #[error("invalid connector '{id}': {reason}")]
    InvalidConnector { id: String, reason: String },

    #[error("no connector registered for endpoint '{0}'")]
    UnknownEndpoint(String),

    #[error("failed to construct client for endpoint '{endpoint}': {reason}")]
    ClientConstruction { endpoint: String, reason: String },
}

/// Errors returned by backend clients
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("unexpected status {status} from {url}")]
    Status { status: u16, url: String },

    #[error("failed to decode response: {0}")]
    Decode(String),

    #[error("timed out after {0} ms")]
    Timeout(u64),

    #[error("shutdown in progress")]
    ShuttingDown,
}

impl ClientError {
    /// True when the failure should be metered as an authentication failure
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ClientError::Unauthorized(_))
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ClientError::Transport(format!("timeout: {err}"))
        } else if err.is_decode() {
            ClientError::Decode(err.to_string())
        } else {
            ClientError::Transport(err.to_string())
        }
    }
}

/// Errors raised by the cluster coordinator
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("cluster coordinator already initialized")]
    AlreadyInitialized,

    #[error("cluster coordinator not initialized")]
    NotInitialized,

    #[error("member '{0}' already joined the cluster")]
    DuplicateMember(String),
}

/// Top-level error surfaced by the scheduler
#[derive(Debug, Error)]
pub enum EtlError {
    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error("configuration error: {0:#}")]
    Configuration(anyhow::Error),
}
