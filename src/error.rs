use thiserror::Error;

/// Errors produced by the device client.
///
/// Every variant is a poll failure; the kind label feeds per-target logging.
/// Retry policy lives in the poller, not here.
#[derive(Debug, Error)]
pub enum ShellyError {
    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("authentication denied (HTTP {0})")]
    AuthDenied(u16),

    #[error("unexpected HTTP status {0}")]
    HttpStatus(u16),

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("rpc error {code}: {message}")]
    RpcError { code: i64, message: String },
}

impl ShellyError {
    /// Short stable label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ShellyError::Timeout => "timeout",
            ShellyError::Connect(_) => "connect",
            ShellyError::AuthDenied(_) => "auth_denied",
            ShellyError::HttpStatus(_) => "http_status",
            ShellyError::MalformedResponse(_) => "malformed_response",
            ShellyError::RpcError { .. } => "rpc_error",
        }
    }
}

/// Configuration loading and validation errors. Fatal at startup; during
/// hot-reload the previous snapshot is retained instead.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file not found: {0}")]
    NotFound(String),

    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T, E = ShellyError> = std::result::Result<T, E>;
