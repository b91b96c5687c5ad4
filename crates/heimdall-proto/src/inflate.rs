//! Zlib inflation for compressed gateway traffic.

use std::io::Read;

use flate2::read::ZlibDecoder;
use flate2::{Decompress, FlushDecompress, Status};

use crate::error::ProtoError;

/// Trailer the server writes after every complete message in a zlib stream.
pub const ZLIB_SUFFIX: [u8; 4] = [0x00, 0x00, 0xFF, 0xFF];

const CHUNK_SIZE: usize = 128 * 1024;

/// Persistent inflate context for `compress=zlib-stream` connections.
///
/// The compressor's dictionary spans the whole connection, so one context
/// must live exactly as long as one transport and see every frame in order.
/// Frames that do not end with [`ZLIB_SUFFIX`] are fed into the context and
/// their output held until the message completes.
pub struct ZlibStream {
    inflater: Decompress,
    pending: Vec<u8>,
}

impl ZlibStream {
    /// Create a fresh inflate context.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inflater: Decompress::new(true),
            pending: Vec::new(),
        }
    }

    /// Feed one transport frame.
    ///
    /// Returns the inflated message once a frame ends with the flush marker,
    /// `None` while the message is still incomplete.
    ///
    /// # Errors
    ///
    /// Returns an error if the compressed data is corrupt. The context is
    /// then reset to a new stream: buffered output is discarded, and frames
    /// that continue the old stream will fail until the sender starts over.
    pub fn push(&mut self, frame: &[u8]) -> Result<Option<Vec<u8>>, ProtoError> {
        if let Err(e) = self.inflate(frame) {
            self.inflater.reset(true);
            self.pending.clear();
            return Err(e);
        }

        if frame.ends_with(&ZLIB_SUFFIX) {
            Ok(Some(std::mem::take(&mut self.pending)))
        } else {
            Ok(None)
        }
    }

    /// Bytes of output held for an incomplete message.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn inflate(&mut self, mut input: &[u8]) -> Result<(), ProtoError> {
        loop {
            self.pending.reserve(CHUNK_SIZE);
            let before_in = self.inflater.total_in();
            let before_out = self.inflater.total_out();

            let status = self
                .inflater
                .decompress_vec(input, &mut self.pending, FlushDecompress::Sync)
                .map_err(|e| ProtoError::Decompression(e.to_string()))?;

            let consumed = (self.inflater.total_in() - before_in) as usize;
            let produced = self.inflater.total_out() - before_out;
            input = &input[consumed..];

            let output_full = self.pending.len() == self.pending.capacity();
            if status == Status::StreamEnd || (input.is_empty() && !output_full) {
                return Ok(());
            }
            if consumed == 0 && produced == 0 {
                if input.is_empty() {
                    return Ok(());
                }
                return Err(ProtoError::Decompression(
                    "inflate made no progress".to_string(),
                ));
            }
        }
    }
}

impl Default for ZlibStream {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ZlibStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZlibStream")
            .field("total_in", &self.inflater.total_in())
            .field("total_out", &self.inflater.total_out())
            .field("pending", &self.pending.len())
            .finish()
    }
}

/// Whether a frame starts with a zlib header rather than a term version byte.
#[must_use]
pub fn is_zlib_payload(frame: &[u8]) -> bool {
    frame.first() == Some(&0x78)
}

/// Inflate a single independently compressed payload.
///
/// # Errors
///
/// Returns an error if the payload is not a complete zlib stream.
pub fn inflate_payload(frame: &[u8]) -> Result<Vec<u8>, ProtoError> {
    let mut out = Vec::with_capacity(frame.len() * 4);
    ZlibDecoder::new(frame)
        .read_to_end(&mut out)
        .map_err(|e| ProtoError::Decompression(e.to_string()))?;
    Ok(out)
}
