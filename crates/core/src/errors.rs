use thiserror::Error;

/// Failure reading from a [`PacketSource`](crate::session::PacketSource).
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("packet source closed")]
    Closed,

    #[error("packet source I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("session already running")]
    AlreadyRunning,

    #[error("session not running")]
    NotRunning,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed reading configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed parsing configuration file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}
