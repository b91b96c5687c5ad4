//! Shard connections.
//!
//! A shard is one gateway connection responsible for a slice of the event
//! stream. Each runs its own connect, handshake, heartbeat and recovery
//! state machine as an independent task.

mod connection;
mod events;
mod heartbeat;
mod reconnect;
mod session;
mod state;
mod transport;

pub use connection::{
    INVALID_SESSION_BACKOFF, SOCKET_TIMEOUT, ShardConnection, ShardHandle, ShardSettings,
};
pub use events::ShardEvent;
pub use heartbeat::{HeartbeatTick, HeartbeatTracker};
pub use reconnect::ReconnectConfig;
pub use session::{SessionCache, ShardIdentity};
pub use state::{AtomicConnectionState, ConnectionState};
pub use transport::{
    ABNORMAL_CLOSURE, Connector, MemoryConnector, MemoryListener, MemoryServer, NO_STATUS,
    OutboundFrame, TransportEvent, TransportLink, WsConnector,
};
