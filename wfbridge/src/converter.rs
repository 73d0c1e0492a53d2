//! Payload representation and the data converter seam.
//!
//! Workers speak raw JSON values; the engine speaks encoded payloads. Every
//! crossing between the two goes through a [`DataConverter`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bridge::protocol::Failure;
use crate::engine::ApplicationError;

/// Metadata key naming a payload's encoding.
pub const METADATA_ENCODING: &str = "encoding";
pub const ENCODING_JSON: &str = "json/plain";
pub const ENCODING_NULL: &str = "binary/null";

/// One encoded value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    pub metadata: BTreeMap<String, String>,
    #[serde(with = "crate::bridge::protocol::bytes_b64")]
    pub data: Vec<u8>,
}

impl Payload {
    pub fn encoding(&self) -> Option<&str> {
        self.metadata.get(METADATA_ENCODING).map(String::as_str)
    }
}

/// Ordered list of encoded values (arguments, results, heartbeat details).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payloads {
    pub payloads: Vec<Payload>,
}

impl Payloads {
    pub fn new(payloads: Vec<Payload>) -> Self {
        Self { payloads }
    }

    pub fn len(&self) -> usize {
        self.payloads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }

    pub fn extend(&mut self, other: Payloads) {
        self.payloads.extend(other.payloads);
    }
}

impl From<Vec<Payload>> for Payloads {
    fn from(payloads: Vec<Payload>) -> Self {
        Self { payloads }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    #[error("unsupported payload encoding: {0}")]
    UnsupportedEncoding(String),
    #[error("payload has no encoding metadata")]
    MissingEncoding,
    #[error("json conversion failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Converts between worker-side JSON values and engine-side payloads.
pub trait DataConverter: Send + Sync {
    fn to_payload(&self, value: &Value) -> Result<Payload, ConversionError>;

    fn from_payload(&self, payload: &Payload) -> Result<Value, ConversionError>;

    fn to_payloads(&self, values: &[Value]) -> Result<Payloads, ConversionError> {
        values
            .iter()
            .map(|v| self.to_payload(v))
            .collect::<Result<Vec<_>, _>>()
            .map(Payloads::new)
    }

    fn from_payloads(&self, payloads: &Payloads) -> Result<Vec<Value>, ConversionError> {
        payloads
            .payloads
            .iter()
            .map(|p| self.from_payload(p))
            .collect()
    }

    /// Convert a worker failure descriptor into the engine's error type.
    ///
    /// Details that cannot be decoded are dropped with a warning; the
    /// failure itself must always reach the engine.
    fn failure_to_error(&self, failure: &Failure) -> ApplicationError {
        let details = match self.from_payloads(&failure.details) {
            Ok(values) => values,
            Err(e) => {
                tracing::warn!(error = %e, message = %failure.message, "Dropping undecodable failure details");
                Vec::new()
            }
        };

        ApplicationError {
            message: failure.message.clone(),
            kind: failure.kind.clone(),
            non_retryable: failure.non_retryable,
            details,
            cause: failure
                .cause
                .as_deref()
                .map(|cause| Box::new(self.failure_to_error(cause))),
        }
    }

    fn error_to_failure(&self, error: &ApplicationError) -> Result<Failure, ConversionError> {
        Ok(Failure {
            message: error.message.clone(),
            source: String::new(),
            stack_trace: String::new(),
            kind: error.kind.clone(),
            non_retryable: error.non_retryable,
            details: self.to_payloads(&error.details)?,
            cause: match error.cause.as_deref() {
                Some(cause) => Some(Box::new(self.error_to_failure(cause)?)),
                None => None,
            },
        })
    }
}

/// Default converter: JSON text payloads, nulls as empty `binary/null`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonDataConverter;

impl DataConverter for JsonDataConverter {
    fn to_payload(&self, value: &Value) -> Result<Payload, ConversionError> {
        if value.is_null() {
            return Ok(Payload {
                metadata: BTreeMap::from([(METADATA_ENCODING.to_string(), ENCODING_NULL.to_string())]),
                data: Vec::new(),
            });
        }

        Ok(Payload {
            metadata: BTreeMap::from([(METADATA_ENCODING.to_string(), ENCODING_JSON.to_string())]),
            data: serde_json::to_vec(value)?,
        })
    }

    fn from_payload(&self, payload: &Payload) -> Result<Value, ConversionError> {
        match payload.encoding() {
            Some(ENCODING_JSON) => Ok(serde_json::from_slice(&payload.data)?),
            Some(ENCODING_NULL) => Ok(Value::Null),
            Some(other) => Err(ConversionError::UnsupportedEncoding(other.to_string())),
            None => Err(ConversionError::MissingEncoding),
        }
    }
}
