//! Transcoding between typed messages and worker exchanges.
//!
//! Two layers:
//! - [`ExchangeCodec`]: length-delimited framing of whole exchanges over a
//!   byte stream (process pipes).
//! - [`Codec`]: batch encoding in the negotiated [`WireFormat`] plus the
//!   request/result bookkeeping around one pool round trip.

use std::io;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use super::command::parse_command;
use super::protocol::{Context, Exchange, Frame, Message, RawOptions};
use crate::converter::DataConverter;
use crate::error::{BridgeError, ProtocolError};
use crate::pool::WorkerPool;

/// Body encoding, announced to workers before their first exchange.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    /// Self-describing JSON frame list.
    #[default]
    Json,
    /// Compact binary frame list.
    Bincode,
}

impl WireFormat {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Bincode => "bincode",
        }
    }

    pub fn encode_frames(&self, frames: &[Frame]) -> Result<Vec<u8>, ProtocolError> {
        match self {
            Self::Json => serde_json::to_vec(frames)
                .map_err(|e| ProtocolError::Malformed(format!("json encode: {}", e))),
            Self::Bincode => bincode::serialize(frames)
                .map_err(|e| ProtocolError::Malformed(format!("bincode encode: {}", e))),
        }
    }

    pub fn decode_frames(&self, body: &[u8]) -> Result<Vec<Frame>, ProtocolError> {
        match self {
            Self::Json => serde_json::from_slice(body)
                .map_err(|e| ProtocolError::Malformed(format!("json decode: {}", e))),
            Self::Bincode => bincode::deserialize(body)
                .map_err(|e| ProtocolError::Malformed(format!("bincode decode: {}", e))),
        }
    }
}

impl std::str::FromStr for WireFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "bincode" | "binary" => Ok(Self::Bincode),
            _ => Err(format!("unknown wire format: {}", s)),
        }
    }
}

impl std::fmt::Display for WireFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Frames one exchange as `[u32 len][u32 context_len][context][body]`.
pub struct ExchangeCodec {
    inner: LengthDelimitedCodec,
}

impl Default for ExchangeCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl ExchangeCodec {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .max_frame_length(64 * 1024 * 1024)
                .new_codec(),
        }
    }
}

impl Decoder for ExchangeCodec {
    type Item = Exchange;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(mut frame) = self.inner.decode(src)? else {
            return Ok(None);
        };

        if frame.len() < 4 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "exchange frame shorter than its context header",
            ));
        }
        let context_len = frame.get_u32() as usize;
        if context_len > frame.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "context length {} exceeds frame of {} bytes",
                    context_len,
                    frame.len()
                ),
            ));
        }
        let context = frame.split_to(context_len).freeze();
        let body = frame.freeze();

        Ok(Some(Exchange { context, body }))
    }
}

impl Encoder<Exchange> for ExchangeCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Exchange, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let context_len = u32::try_from(item.context.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "context too large"))?;

        let mut buf = BytesMut::with_capacity(4 + item.context.len() + item.body.len());
        buf.put_u32(context_len);
        buf.extend_from_slice(&item.context);
        buf.extend_from_slice(&item.body);

        let len = buf.len();
        tracing::trace!(frame_size_bytes = len, "Encoding exchange");
        if len > 1_000_000 {
            tracing::info!(
                frame_size_bytes = len,
                frame_size_kb = len / 1024,
                "Large exchange being encoded"
            );
        }
        self.inner.encode(buf.freeze(), dst)
    }
}

/// Batch transcoder bound to one wire format and data converter.
///
/// Performs no business logic: message order in equals frame order out.
pub struct Codec {
    format: WireFormat,
    converter: Arc<dyn DataConverter>,
}

impl Codec {
    pub fn new(format: WireFormat, converter: Arc<dyn DataConverter>) -> Self {
        Self { format, converter }
    }

    pub fn format(&self) -> WireFormat {
        self.format
    }

    pub fn converter(&self) -> &dyn DataConverter {
        self.converter.as_ref()
    }

    pub fn encode(&self, ctx: &Context, batch: &[Message]) -> Result<Exchange, ProtocolError> {
        let context = serde_json::to_vec(ctx)
            .map_err(|e| ProtocolError::Malformed(format!("context encode: {}", e)))?;

        let frames = batch
            .iter()
            .map(|msg| {
                let (command, options) = match &msg.command {
                    Some(cmd) => (cmd.name().to_string(), cmd.encode_options()?),
                    None => (String::new(), RawOptions::default()),
                };
                Ok(Frame {
                    id: msg.id,
                    command,
                    options,
                    failure: msg.failure.clone(),
                    payloads: msg.payloads.clone(),
                })
            })
            .collect::<Result<Vec<_>, ProtocolError>>()?;

        let body = self.format.encode_frames(&frames)?;
        Ok(Exchange::new(context, Bytes::from(body)))
    }

    /// Decode a worker response. Any undecodable frame fails the whole batch.
    pub fn decode(&self, exchange: &Exchange) -> Result<Vec<Message>, ProtocolError> {
        self.format
            .decode_frames(&exchange.body)?
            .into_iter()
            .map(|frame| {
                let command = if frame.command.is_empty() {
                    None
                } else {
                    Some(parse_command(
                        self.converter.as_ref(),
                        &frame.command,
                        frame.options.as_bytes(),
                    )?)
                };
                Ok(Message {
                    id: frame.id,
                    command,
                    failure: frame.failure,
                    payloads: frame.payloads,
                })
            })
            .collect()
    }

    /// Round trip where every request gets exactly one aligned result.
    pub async fn execute(
        &self,
        pool: &dyn WorkerPool,
        ctx: &Context,
        batch: Vec<Message>,
    ) -> Result<Vec<Message>, BridgeError> {
        let expected = batch.len();
        let results = self.exchange(pool, ctx, batch).await?;
        if results.len() != expected {
            return Err(ProtocolError::ResultCount {
                expected,
                actual: results.len(),
            }
            .into());
        }
        Ok(results)
    }

    /// Round trip returning whatever the worker emitted (a workflow tick).
    pub async fn exchange(
        &self,
        pool: &dyn WorkerPool,
        ctx: &Context,
        batch: Vec<Message>,
    ) -> Result<Vec<Message>, BridgeError> {
        let request = self.encode(ctx, &batch)?;
        tracing::debug!(
            format = self.format.name(),
            task_queue = %ctx.task_queue,
            messages = batch.len(),
            "Sending batch to worker pool"
        );

        let response = pool.exec(request).await?;
        let results = self.decode(&response)?;
        tracing::debug!(messages = results.len(), "Received batch from worker pool");
        Ok(results)
    }
}
