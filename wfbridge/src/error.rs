//! Error kinds surfaced by the bridge.

use crate::converter::ConversionError;
use crate::engine::{ApplicationError, EngineError, TaskToken};
use crate::pool::PoolError;

/// The worker and the bridge disagree about the wire. Always fatal to the
/// current exchange.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("expected {expected} result(s), worker returned {actual}")]
    ResultCount { expected: usize, actual: usize },
    #[error("undefined command type: {name}")]
    UndefinedCommand { name: String },
    #[error("worker emitted bridge-only command: {name}")]
    UnexpectedCommand { name: String },
    #[error("payload conversion failed: {0}")]
    Conversion(#[from] ConversionError),
}

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("dispatch failed: {0}")]
    Dispatch(#[from] PoolError),
    #[error("no worker pool generation is active")]
    NoActiveGeneration,
    #[error("activity failed: {0}")]
    Application(ApplicationError),
    #[error("heartbeat on non running activity: {0}")]
    NotRunning(TaskToken),
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
}

impl From<ConversionError> for BridgeError {
    fn from(e: ConversionError) -> Self {
        Self::Protocol(ProtocolError::Conversion(e))
    }
}

impl BridgeError {
    pub fn is_protocol(&self) -> bool {
        matches!(self, Self::Protocol(_))
    }
}
