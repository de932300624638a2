use thiserror::Error;

/// Main error type for the worldkeeper supervisor
#[derive(Debug, Error)]
pub enum KeeperError {
    // Configuration errors
    #[error("Missing required configuration field: {0}")]
    MissingConfigField(String),

    #[error("Invalid value for {key}: {reason}")]
    InvalidConfig { key: String, reason: String },

    // Child process errors
    #[error("Failed to spawn command '{name}': {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to attach output of command '{0}'")]
    Pipe(String),

    #[error("Command '{name}' exited with {status}")]
    CommandFailed { name: String, status: String },

    #[error("Command '{0}' was cancelled")]
    Cancelled(String),

    #[error("Failed to stop command '{0}': {1}")]
    StopError(String, String),

    // Startup errors
    #[error("Bootstrap failed: {0}")]
    Bootstrap(String),

    #[error("Failed to bind metrics listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Signal error: {0}")]
    SignalError(String),

    #[error("HTTP server error: {0}")]
    Http(String),

    // IO errors (automatically converted from std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl KeeperError {
    pub(crate) fn invalid(key: &str, reason: impl Into<String>) -> Self {
        KeeperError::InvalidConfig {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for worldkeeper operations
pub type Result<T> = std::result::Result<T, KeeperError>;
