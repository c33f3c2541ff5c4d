//! Error types shared by the capture layer and the frame pipeline

use std::time::Duration;

use thiserror::Error;

/// Failure reported by a hardware collaborator call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HalError {
    /// Bounded wait expired. Always retryable.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Vendor SDK returned a non-success status
    #[error("{call} failed, ret={code:#x}")]
    Status { call: &'static str, code: i32 },
}

impl HalError {
    pub fn status(call: &'static str, code: i32) -> Self {
        Self::Status { call, code }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

pub type HalResult<T> = std::result::Result<T, HalError>;

#[derive(Debug, Error)]
pub enum VinError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to create sensor instance {index}: {reason}")]
    Creation { index: usize, reason: String },

    #[error("failed to initialize sensor instance {index}")]
    Init {
        index: usize,
        #[source]
        source: HalError,
    },

    #[error("sensor {index} {op} failed")]
    Sensor {
        index: usize,
        op: &'static str,
        #[source]
        source: HalError,
    },

    #[error(transparent)]
    Hal(#[from] HalError),

    #[error("in-flight queue [{pipe}][{channel}] is full ({depth}), frame dropped")]
    QueueOverflow { pipe: u8, channel: u8, depth: usize },

    #[error("no sensor instance at index {0}")]
    NoSuchSensor(usize),

    #[error("pipe {0} is not configured on any sensor")]
    UnknownPipe(u8),

    #[error("failed to spawn worker thread {name}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid state: {0}")]
    InvalidState(&'static str),
}

impl From<config::ConfigError> for VinError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

pub type Result<T, E = VinError> = std::result::Result<T, E>;
