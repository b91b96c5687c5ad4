//! Per-shard identity and resumable session data.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Position of a shard within the sharded session set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardIdentity {
    /// Zero-based shard index.
    pub index: u32,
    /// Total shard count.
    pub count: u32,
}

impl ShardIdentity {
    /// Create a shard identity.
    #[must_use]
    pub const fn new(index: u32, count: u32) -> Self {
        Self { index, count }
    }

    /// `[index, count]` as sent in IDENTIFY.
    #[must_use]
    pub const fn as_pair(self) -> [u32; 2] {
        [self.index, self.count]
    }
}

impl fmt::Display for ShardIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.index, self.count)
    }
}

/// Session state needed to RESUME instead of IDENTIFY.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionCache {
    /// Session id from the last READY.
    pub session_id: Option<String>,
    /// Highest sequence number seen.
    pub last_sequence: Option<u64>,
}

impl SessionCache {
    /// Record a frame's sequence number. Lower or equal values are ignored.
    pub fn observe_sequence(&mut self, sequence: Option<u64>) {
        if let Some(seq) = sequence {
            if self.last_sequence.is_none_or(|last| seq > last) {
                self.last_sequence = Some(seq);
            }
        }
    }

    /// Whether a resume can be attempted.
    #[must_use]
    pub fn is_resumable(&self) -> bool {
        self.session_id.is_some()
    }

    /// Forget the session.
    pub fn clear(&mut self) {
        self.session_id = None;
        self.last_sequence = None;
    }
}
