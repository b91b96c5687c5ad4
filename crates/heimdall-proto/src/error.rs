//! Error types for the heimdall-proto crate.

use thiserror::Error;

/// Errors that can occur while encoding or decoding gateway frames.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// Failed to encode a value into the term format.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Failed to decode a term.
    #[error("decoding error: {0}")]
    Decoding(String),

    /// Input ended in the middle of a term.
    #[error("unexpected end of input at byte {0}")]
    UnexpectedEof(usize),

    /// The leading format version byte was not recognised.
    #[error("unsupported term format version: {0}")]
    UnsupportedVersion(u8),

    /// A term tag that this codec does not understand.
    #[error("unknown term tag {tag} at byte {offset}")]
    UnknownTag {
        /// The tag byte.
        tag: u8,
        /// Offset of the tag in the input.
        offset: usize,
    },

    /// Inflating a compressed frame failed.
    #[error("decompression error: {0}")]
    Decompression(String),

    /// A frame envelope was missing a required field.
    #[error("missing required field: {0}")]
    MissingField(&'static str),
}
