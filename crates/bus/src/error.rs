use thiserror::Error;

/// Errors that can occur in the bus layer.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("payload encode/decode error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("zeromq error: {0}")]
    Zmq(#[from] zeromq::ZmqError),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("bus unavailable at {endpoint}: {reason}")]
    Unavailable { endpoint: String, reason: String },

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("config error: {0}")]
    Config(String),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
