//! Shard notice types.

use std::time::Duration;

use heimdall_proto::DecodedEvent;

/// Notices published by a shard on its broadcast channel.
#[derive(Debug, Clone)]
pub enum ShardEvent {
    /// A dispatch frame, re-emitted as received.
    Dispatch(DecodedEvent),
    /// Session established.
    Ready {
        /// Whether the session was resumed rather than newly identified.
        resumed: bool,
    },
    /// The transport closed.
    Closed {
        /// Close code.
        code: u16,
        /// Whether the close handshake completed.
        clean: bool,
    },
    /// Opening the transport failed and will be retried.
    Reconnecting {
        /// Retry number.
        attempt: u32,
        /// Delay before the retry.
        delay: Duration,
    },
    /// Diagnostic message.
    Debug(String),
    /// Recoverable problem.
    Warn(String),
    /// Problem the shard could not handle on its own.
    Error(String),
}

impl ShardEvent {
    /// Whether this is a diagnostic signal rather than gateway traffic.
    #[must_use]
    pub const fn is_signal(&self) -> bool {
        matches!(self, Self::Debug(_) | Self::Warn(_) | Self::Error(_))
    }
}
