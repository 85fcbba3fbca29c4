use thiserror::Error;

/// Errors raised by the link engine and its collaborators.
///
/// Per-message and per-read errors are caught at the task boundary and turned
/// into ack result strings or log lines; only [`LinkError::Cancelled`] is
/// allowed to unwind a task.
#[derive(Error, Debug)]
pub enum LinkError {
    /// Platform I/O failure from a transport.
    #[error("{0}")]
    Io(#[from] std::io::Error),

    /// Endpoint could not establish or keep a connection.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Malformed, unroutable or unbuildable packet.
    #[error("{0}")]
    Protocol(String),

    /// Command flagged hazardous and not confirmed by the operator.
    #[error("Hazardous command rejected: {description}")]
    HazardousCommandRejected { description: String, formatted: String },

    /// Bad link or endpoint parameters.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Dictionary lookup failed.
    #[error("{0}")]
    Dictionary(String),

    /// Message bus failure.
    #[error("Bus error: {0}")]
    Bus(String),

    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Cooperative cancellation; halts the task that observes it.
    #[error("Operation canceled")]
    Cancelled,
}

impl LinkError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        LinkError::Protocol(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        LinkError::Configuration(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        LinkError::Connection(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, LinkError>;
