//! Frame envelope and the per-connection gateway codec.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::error::ProtoError;
use crate::etf;
use crate::inflate::{self, ZlibStream};
use crate::opcode::OpCode;

/// A decoded gateway frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodedEvent {
    /// Frame opcode.
    #[serde(rename = "op")]
    pub opcode: OpCode,
    /// Sequence number, present on dispatches.
    #[serde(rename = "s", default)]
    pub sequence: Option<u64>,
    /// Dispatch event type.
    #[serde(rename = "t", default)]
    pub event_type: Option<String>,
    /// Opaque payload.
    #[serde(rename = "d", default)]
    pub payload: Value,
}

impl DecodedEvent {
    /// Build an event from a decoded envelope value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a record with a numeric `op`.
    pub fn from_value(value: Value) -> Result<Self, ProtoError> {
        let Value::Object(mut fields) = value else {
            return Err(ProtoError::Decoding(format!(
                "frame envelope must be a map, got {}",
                kind(&value)
            )));
        };

        let opcode = fields
            .get("op")
            .and_then(Value::as_u64)
            .ok_or(ProtoError::MissingField("op"))?;
        let opcode = u8::try_from(opcode)
            .map(OpCode::from)
            .map_err(|_| ProtoError::Decoding(format!("opcode {opcode} out of range")))?;

        Ok(Self {
            opcode,
            sequence: fields.get("s").and_then(Value::as_u64),
            event_type: fields
                .get("t")
                .and_then(Value::as_str)
                .map(ToString::to_string),
            payload: fields.remove("d").unwrap_or(Value::Null),
        })
    }

    /// Whether this is a dispatch of the given event type.
    #[must_use]
    pub fn is_dispatch(&self, event_type: &str) -> bool {
        self.opcode == OpCode::Dispatch && self.event_type.as_deref() == Some(event_type)
    }

    /// Encode the full envelope, including `s` and `t`.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be represented as a term.
    pub fn encode(&self) -> Result<Vec<u8>, ProtoError> {
        let mut fields = Map::new();
        fields.insert("op".to_string(), Value::from(self.opcode.as_u8()));
        fields.insert("d".to_string(), self.payload.clone());
        fields.insert(
            "s".to_string(),
            self.sequence.map_or(Value::Null, Value::from),
        );
        fields.insert(
            "t".to_string(),
            self.event_type.clone().map_or(Value::Null, Value::String),
        );
        etf::to_bytes(&Value::Object(fields))
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "map",
    }
}

/// Encode a client request `{op, d}`.
///
/// # Errors
///
/// Returns an error if the payload cannot be represented as a term.
pub fn encode(opcode: OpCode, data: &Value) -> Result<Vec<u8>, ProtoError> {
    etf::to_bytes(&json!({ "op": opcode.as_u8(), "d": data }))
}

/// Decode a single uncompressed term frame.
///
/// # Errors
///
/// Returns an error if the bytes are not a valid term or the term is not a
/// frame envelope.
pub fn decode(bytes: &[u8]) -> Result<DecodedEvent, ProtoError> {
    DecodedEvent::from_value(etf::from_bytes(bytes)?)
}

/// Transport-level compression negotiated in the connection URL.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportCompression {
    /// Frames are plain terms, or individually compressed payloads.
    #[default]
    None,
    /// One zlib context spans the whole connection.
    ZlibStream,
}

impl TransportCompression {
    /// Value for the `compress` query parameter, if any.
    #[must_use]
    pub const fn query_value(self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::ZlibStream => Some("zlib-stream"),
        }
    }
}

impl fmt::Display for TransportCompression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.query_value().unwrap_or("none"))
    }
}

impl FromStr for TransportCompression {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "zlib-stream" => Ok(Self::ZlibStream),
            other => Err(ProtoError::Decoding(format!(
                "unknown compression mode: {other}"
            ))),
        }
    }
}

/// Stateful decoder for one transport connection.
///
/// With [`TransportCompression::ZlibStream`] every frame is fed through one
/// persistent inflate context, so the codec must be [`reset`](Self::reset)
/// whenever a new transport is opened.
#[derive(Debug)]
pub struct GatewayCodec {
    compression: TransportCompression,
    stream: Option<ZlibStream>,
}

impl GatewayCodec {
    /// Create a codec for the given compression mode.
    #[must_use]
    pub fn new(compression: TransportCompression) -> Self {
        Self {
            compression,
            stream: Self::fresh_stream(compression),
        }
    }

    fn fresh_stream(compression: TransportCompression) -> Option<ZlibStream> {
        match compression {
            TransportCompression::None => None,
            TransportCompression::ZlibStream => Some(ZlibStream::new()),
        }
    }

    /// Compression mode this codec was built for.
    #[must_use]
    pub const fn compression(&self) -> TransportCompression {
        self.compression
    }

    /// Discard the inflate context. Call before every new transport.
    pub fn reset(&mut self) {
        self.stream = Self::fresh_stream(self.compression);
    }

    /// Decode one transport frame.
    ///
    /// Returns `None` while a stream-compressed message is still incomplete.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame cannot be inflated or decoded. A term
    /// or payload error applies to that frame only. A
    /// [`ProtoError::Decompression`] in zlib-stream mode resets the inflate
    /// context, so the rest of the current stream is lost and the caller
    /// should open a new transport.
    pub fn decode(&mut self, frame: &[u8]) -> Result<Option<DecodedEvent>, ProtoError> {
        if let Some(stream) = self.stream.as_mut() {
            return match stream.push(frame)? {
                Some(bytes) => decode(&bytes).map(Some),
                None => Ok(None),
            };
        }

        if inflate::is_zlib_payload(frame) {
            let bytes = inflate::inflate_payload(frame)?;
            return decode(&bytes).map(Some);
        }

        decode(frame).map(Some)
    }
}
