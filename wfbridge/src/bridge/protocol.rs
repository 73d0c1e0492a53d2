//! Wire types exchanged with worker processes.
//!
//! A worker pool moves [`Exchange`]s: a JSON [`Context`] header plus a body
//! holding the ordered [`Frame`] list in the negotiated wire format. Frames
//! are the untyped form of [`Message`]; the codec converts between them.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio_util::bytes::Bytes;

use super::command::Command;
use crate::converter::Payloads;

/// Exchange envelope handed to a worker pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Exchange {
    pub context: Bytes,
    pub body: Bytes,
}

impl Exchange {
    pub fn new(context: impl Into<Bytes>, body: impl Into<Bytes>) -> Self {
        Self {
            context: context.into(),
            body: body.into(),
        }
    }
}

/// Per-exchange header. Always JSON, whatever the body format.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Context {
    pub task_queue: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tick_time: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub replay: bool,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub history_length: i64,
}

fn is_zero(n: &i64) -> bool {
    *n == 0
}

impl Context {
    pub fn for_task_queue(task_queue: impl Into<String>) -> Self {
        Self {
            task_queue: task_queue.into(),
            ..Self::default()
        }
    }
}

/// Failure descriptor reported by a worker (or sent to it).
///
/// Field set is fixed: the compact format cannot skip fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Failure {
    pub message: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub stack_trace: String,
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub non_retryable: bool,
    #[serde(default)]
    pub details: Payloads,
    #[serde(default)]
    pub cause: Option<Box<Failure>>,
}

impl Failure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }
}

/// Untyped message as it appears on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub id: u64,
    /// Command name; empty for results.
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub options: RawOptions,
    #[serde(default)]
    pub failure: Option<Failure>,
    #[serde(default)]
    pub payloads: Payloads,
}

/// Typed message: a command, or a result for the command with the same id.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: u64,
    pub command: Option<Command>,
    pub failure: Option<Failure>,
    pub payloads: Payloads,
}

impl Message {
    pub fn command(id: u64, command: impl Into<Command>, payloads: Payloads) -> Self {
        Self {
            id,
            command: Some(command.into()),
            failure: None,
            payloads,
        }
    }

    pub fn result(id: u64, payloads: Payloads) -> Self {
        Self {
            id,
            command: None,
            failure: None,
            payloads,
        }
    }

    pub fn failure(id: u64, failure: Failure) -> Self {
        Self {
            id,
            command: None,
            failure: Some(failure),
            payloads: Payloads::default(),
        }
    }

    pub fn is_command(&self) -> bool {
        self.command.is_some()
    }
}

/// Command parameters as JSON bytes.
///
/// Embedded as a raw JSON value in human-readable formats and as a byte
/// string in the compact format.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawOptions(pub Vec<u8>);

impl RawOptions {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Serialize for RawOptions {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            if self.0.is_empty() {
                return serializer.serialize_none();
            }
            let value: serde_json::Value =
                serde_json::from_slice(&self.0).map_err(serde::ser::Error::custom)?;
            value.serialize(serializer)
        } else {
            self.0.serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for RawOptions {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            let value = serde_json::Value::deserialize(deserializer)?;
            if value.is_null() {
                return Ok(Self::default());
            }
            serde_json::to_vec(&value)
                .map(Self)
                .map_err(serde::de::Error::custom)
        } else {
            Vec::<u8>::deserialize(deserializer).map(Self)
        }
    }
}

/// Byte fields: base64 text in human-readable formats, raw bytes otherwise.
pub(crate) mod bytes_b64 {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&STANDARD.encode(bytes))
        } else {
            bytes.serialize(serializer)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        if deserializer.is_human_readable() {
            let text = String::deserialize(deserializer)?;
            STANDARD.decode(text).map_err(serde::de::Error::custom)
        } else {
            Vec::<u8>::deserialize(deserializer)
        }
    }
}

/// Durations as integer nanoseconds, the representation workers expect.
pub(crate) mod duration_nanos {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_nanos)
    }
}
