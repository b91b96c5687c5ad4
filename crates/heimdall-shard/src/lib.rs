//! Heimdall: a sharded gateway client.
//!
//! A [`ShardPool`] opens one persistent binary connection per shard, runs
//! each shard's connect, handshake, heartbeat and recovery state machine as
//! its own task, and rations IDENTIFY attempts across all shards through a
//! shared [`IdentifyGate`]. Decoded dispatches are republished per shard and
//! on one combined channel, which the binary drains into an [`EventSink`].
//!
//! # Modules
//!
//! - [`shard`]: per-shard state machine, transports and notices
//! - [`gate`]: identify admission control
//! - [`pool`]: shard startup, fan-out and status
//! - [`bootstrap`]: gateway URL, shard count and identify budget fetch
//! - [`sink`]: JSON-lines event output
//! - [`config`]: file, flag and environment configuration

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod gate;
pub mod pool;
pub mod shard;
pub mod sink;

pub use bootstrap::{GatewayInfo, SessionStartLimit, fetch_gateway};
pub use config::{ConfigOverrides, ConnectionOptions, HeimdallConfig, SinkConfig};
pub use error::{Result, ShardError};
pub use gate::{IdentifyBudget, IdentifyGate};
pub use pool::{PoolEvent, PoolSettings, ShardPool};
pub use shard::{
    ConnectionState, Connector, MemoryConnector, ShardConnection, ShardEvent, ShardHandle,
    ShardIdentity, ShardSettings, WsConnector,
};
pub use sink::EventSink;
