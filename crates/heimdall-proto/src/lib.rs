//! Wire codec for the heimdall gateway client.
//!
//! Gateway frames are envelopes `{op, d, s, t}` encoded in the binary term
//! format, optionally compressed either per payload or as one zlib stream
//! spanning the connection. This crate turns raw transport frames into
//! [`DecodedEvent`] records and encodes client requests.
//!
//! # Example
//!
//! ```
//! use heimdall_proto::{GatewayCodec, OpCode, TransportCompression, encode};
//! use serde_json::json;
//!
//! let frame = encode(OpCode::Heartbeat, &json!(7)).unwrap();
//! let mut codec = GatewayCodec::new(TransportCompression::None);
//! let event = codec.decode(&frame).unwrap().unwrap();
//! assert_eq!(event.opcode, OpCode::Heartbeat);
//! assert_eq!(event.payload, json!(7));
//! ```

pub mod close;
pub mod error;
pub mod etf;
pub mod frame;
pub mod inflate;
pub mod opcode;
pub mod payload;

pub use close::{CLOSE_NORMAL, CLOSE_RESUMABLE, CloseCode};
pub use error::ProtoError;
pub use frame::{DecodedEvent, GatewayCodec, TransportCompression, decode, encode};
pub use inflate::{ZLIB_SUFFIX, ZlibStream, inflate_payload};
pub use opcode::OpCode;
pub use payload::{
    ConnectionProperties, HelloPayload, IdentifyPayload, READY, RESUMED, ReadyPayload,
    ResumePayload,
};

/// Result type for codec operations.
pub type Result<T> = std::result::Result<T, ProtoError>;
