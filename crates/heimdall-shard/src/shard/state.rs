//! Connection state types.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

/// State of one shard's gateway connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionState {
    /// Created, never connected.
    Idle,
    /// Waiting for the identify window to reset before connecting.
    IdentifyStalled,
    /// Opening the transport and waiting for HELLO.
    Connecting,
    /// Sent IDENTIFY or RESUME, waiting for READY or RESUMED.
    Identifying,
    /// Session established, receiving dispatches.
    Ready,
    /// Transport closed.
    Disconnected,
    /// Closed with a code that rules out reconnecting. Terminal.
    ReconnectionImpossible,
}

impl ConnectionState {
    /// Whether the shard has stopped for good.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::ReconnectionImpossible)
    }

    /// Whether a transport is open or being opened.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Connecting | Self::Identifying | Self::Ready)
    }

    /// Kebab-case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::IdentifyStalled => "identify-stalled",
            Self::Connecting => "connecting",
            Self::Identifying => "identifying",
            Self::Ready => "ready",
            Self::Disconnected => "disconnected",
            Self::ReconnectionImpossible => "reconnection-impossible",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Atomic wrapper for connection state, shared between a shard task and its
/// handles.
#[derive(Debug)]
pub struct AtomicConnectionState(AtomicU8);

impl AtomicConnectionState {
    /// Create a new atomic state.
    #[must_use]
    pub const fn new(state: ConnectionState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    /// Load the current state.
    #[must_use]
    pub fn load(&self) -> ConnectionState {
        match self.0.load(Ordering::SeqCst) {
            0 => ConnectionState::Idle,
            1 => ConnectionState::IdentifyStalled,
            2 => ConnectionState::Connecting,
            3 => ConnectionState::Identifying,
            4 => ConnectionState::Ready,
            5 => ConnectionState::Disconnected,
            _ => ConnectionState::ReconnectionImpossible,
        }
    }

    /// Store a new state.
    pub fn store(&self, state: ConnectionState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }
}
