//! Storage farm error types

use thiserror::Error;

/// Result type for storage farm operations
pub type Result<T> = std::result::Result<T, FarmError>;

/// Storage farm errors
#[derive(Debug, Error)]
pub enum FarmError {
    // ==================== Configuration Errors ====================
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    // ==================== Announcement Errors ====================
    #[error("malformed announcement from {server_id}: {reason}")]
    MalformedAnnouncement { server_id: String, reason: String },

    #[error("invalid base32 data: {0}")]
    InvalidBase32(String),

    #[error("invalid FURL: {0}")]
    InvalidFurl(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    // ==================== Plugin Errors ====================
    #[error("storage plugin {plugin} rejected option: {reason}")]
    PluginRejected { plugin: String, reason: String },

    // ==================== Connection Errors ====================
    #[error("connection failed to {endpoint}: {reason}")]
    ConnectionFailed { endpoint: String, reason: String },

    #[error("connection lost")]
    ConnectionLost,

    #[error("remote call failed: {0}")]
    RemoteCall(String),

    // ==================== Lifecycle Errors ====================
    #[error("broker shut down")]
    ShuttingDown,
}

impl FarmError {
    /// Check if this error is recovered by the reconnect loop
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            FarmError::ConnectionFailed { .. }
                | FarmError::ConnectionLost
                | FarmError::RemoteCall(_)
                | FarmError::Io(_)
        )
    }

    /// Check if this error should abort startup
    pub fn is_fatal(&self) -> bool {
        matches!(self, FarmError::Config(_) | FarmError::Yaml(_))
    }

    pub(crate) fn malformed(server_id: impl ToString, reason: impl Into<String>) -> Self {
        FarmError::MalformedAnnouncement {
            server_id: server_id.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for FarmError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        FarmError::ShuttingDown
    }
}
