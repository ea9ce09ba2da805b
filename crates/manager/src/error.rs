//! Error types for the dispatch protocol, one enum per concern.

use std::time::Duration;

use datasource_bus::BusError;
use thiserror::Error;

use crate::protocol::START_DATA_SOURCE;

/// A command arrived but cannot be dispatched.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("malformed command: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("unknown method '{0}', expected '{START_DATA_SOURCE}'")]
    UnknownMethod(String),

    #[error("command field '{0}' must not be empty")]
    EmptyField(&'static str),

    #[error("channel '{0}' is a manager command topic")]
    ReservedChannel(String),
}

/// Raised by a data-source handler.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    #[error("{0}")]
    Failed(String),
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("handler name must not be empty")]
    EmptyName,

    #[error("handler '{0}' is already registered")]
    DuplicateName(String),
}

/// Why a job run did not complete. Each variant maps to a process exit code.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("unknown handler '{0}'")]
    UnknownHandler(String),

    #[error("invalid parameters for '{handler}': {reason}")]
    InvalidParams { handler: String, reason: String },

    #[error("handler '{handler}' failed: {source}")]
    Failed {
        handler: String,
        #[source]
        source: HandlerError,
    },

    #[error("handler '{0}' panicked")]
    Panicked(String),
}

/// The job process could not be started or supervised.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to wait for job process: {0}")]
    Wait(#[source] std::io::Error),

    #[error("failed to encode job parameters: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ClientError {
    /// No response arrived. Distinct from a response whose status is a failure.
    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error("failed to encode command: {0}")]
    Encode(#[source] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error(transparent)]
    Bus(#[from] BusError),
}
