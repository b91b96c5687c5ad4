//! The shard pool: starts every shard under the identify gate and fans their
//! dispatches out to subscribers.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use heimdall_proto::DecodedEvent;
use serde::Serialize;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bootstrap;
use crate::config::HeimdallConfig;
use crate::error::{Result, ShardError};
use crate::gate::{DEFAULT_IDENTIFY_WINDOW, IdentifyBudget, IdentifyGate};
use crate::shard::{
    ConnectionState, Connector, ShardConnection, ShardEvent, ShardHandle, ShardIdentity,
    ShardSettings, WsConnector,
};

const CHANNEL_BUFFER: usize = 1024;

/// A dispatch tagged with the shard that received it.
#[derive(Debug, Clone, Serialize)]
pub struct PoolEvent {
    /// Shard index.
    pub shard: u32,
    /// When the pool received the event.
    pub received_at: DateTime<Utc>,
    /// The dispatch itself.
    #[serde(flatten)]
    pub event: DecodedEvent,
}

/// Inputs for starting a pool without a bootstrap fetch.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Settings shared by every shard.
    pub shard: ShardSettings,
    /// Number of shards.
    pub shard_count: u32,
    /// Identify allowance.
    pub budget: IdentifyBudget,
    /// Identify window length after the first reset.
    pub identify_window: Duration,
}

impl PoolSettings {
    /// Settings with the default identify window.
    #[must_use]
    pub const fn new(shard: ShardSettings, shard_count: u32, budget: IdentifyBudget) -> Self {
        Self {
            shard,
            shard_count,
            budget,
            identify_window: DEFAULT_IDENTIFY_WINDOW,
        }
    }
}

/// Owns every shard of one sharded session set.
#[derive(Debug)]
pub struct ShardPool {
    shards: BTreeMap<u32, ShardHandle>,
    per_shard: BTreeMap<u32, broadcast::Sender<DecodedEvent>>,
    all: broadcast::Sender<PoolEvent>,
    gate: Arc<IdentifyGate>,
    tasks: Vec<JoinHandle<()>>,
    forwarders: Vec<JoinHandle<()>>,
    stopping: watch::Sender<bool>,
}

impl ShardPool {
    /// Fetch bootstrap data and start a pool over WebSockets.
    ///
    /// # Errors
    ///
    /// Returns an error if the bootstrap fetch fails or a shard cannot be
    /// started.
    pub async fn build(config: &HeimdallConfig) -> Result<Self> {
        let info = bootstrap::fetch_gateway(&config.api_base, &config.token).await?;
        let gateway_url = match &config.gateway_url {
            Some(url) => {
                info!(gateway = %url, "using gateway override");
                url.clone()
            }
            None => info.url,
        };

        let mut shard = ShardSettings::new(config.token.clone(), gateway_url);
        shard.options = config.gateway.clone();

        let settings = PoolSettings {
            shard,
            shard_count: info.shards,
            budget: info.session_start_limit.budget(),
            identify_window: config.identify_window(),
        };
        Self::start(settings, WsConnector::new())
    }

    /// Start every shard. Shards that fit in the identify budget connect
    /// now; the rest are marked identify-stalled and connect when the window
    /// resets.
    ///
    /// # Errors
    ///
    /// Returns an error if the shard count is zero or a shard cannot be
    /// spawned.
    pub fn start<C: Connector>(settings: PoolSettings, connector: C) -> Result<Self> {
        if settings.shard_count == 0 {
            return Err(ShardError::Config("shard count must be greater than 0".to_string()));
        }

        let gate = Arc::new(IdentifyGate::with_window(
            settings.budget,
            settings.identify_window,
        ));
        let (all, _) = broadcast::channel(CHANNEL_BUFFER);
        let (stopping, _) = watch::channel(false);

        let mut pool = Self {
            shards: BTreeMap::new(),
            per_shard: BTreeMap::new(),
            all,
            gate,
            tasks: Vec::new(),
            forwarders: Vec::new(),
            stopping,
        };

        for index in 0..settings.shard_count {
            let identity = ShardIdentity::new(index, settings.shard_count);
            let (handle, task) = ShardConnection::spawn(
                identity,
                &settings.shard,
                Arc::clone(&pool.gate),
                connector.clone(),
            )?;

            let (shard_tx, _) = broadcast::channel(CHANNEL_BUFFER);
            pool.forwarders.push(tokio::spawn(forward(
                index,
                handle.subscribe(),
                shard_tx.clone(),
                pool.all.clone(),
                pool.stopping.subscribe(),
            )));

            if pool.gate.try_acquire() {
                debug!(shard = index, "connecting");
                handle.connect_prepaid()?;
            } else {
                info!(shard = index, "identify budget exhausted, shard stalled until window reset");
                handle.defer_connect(pool.gate.resets_at())?;
            }

            pool.per_shard.insert(index, shard_tx);
            pool.shards.insert(index, handle);
            pool.tasks.push(task);
        }

        info!(shards = settings.shard_count, "shard pool started");
        Ok(pool)
    }

    /// Handle for one shard.
    #[must_use]
    pub fn get_shard(&self, index: u32) -> Option<&ShardHandle> {
        self.shards.get(&index)
    }

    /// Number of shards.
    #[must_use]
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Current state of every shard.
    #[must_use]
    pub fn status(&self) -> BTreeMap<u32, ConnectionState> {
        self.shards
            .iter()
            .map(|(index, handle)| (*index, handle.state()))
            .collect()
    }

    /// The shared identify gate.
    #[must_use]
    pub const fn identify_gate(&self) -> &Arc<IdentifyGate> {
        &self.gate
    }

    /// Dispatches from every shard.
    #[must_use]
    pub fn subscribe_all(&self) -> broadcast::Receiver<PoolEvent> {
        self.all.subscribe()
    }

    /// Dispatches from one shard.
    #[must_use]
    pub fn subscribe_shard(&self, index: u32) -> Option<broadcast::Receiver<DecodedEvent>> {
        self.per_shard.get(&index).map(broadcast::Sender::subscribe)
    }

    /// Close every shard and wait for their tasks to finish. Subscriber
    /// streams end once the remaining dispatches are delivered.
    pub async fn shutdown(self) {
        for handle in self.shards.values() {
            if handle.shutdown().is_err() {
                debug!(shard = handle.id(), "shard already stopped");
            }
        }
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "shard task panicked");
            }
        }

        // Handles cloned by callers keep the shard channels open, so the
        // forwarders are told to drain and stop instead.
        let _ = self.stopping.send(true);
        drop(self.shards);
        drop(self.per_shard);
        drop(self.all);
        for forwarder in self.forwarders {
            let _ = forwarder.await;
        }
        info!("shard pool stopped");
    }
}

async fn forward(
    index: u32,
    mut events: broadcast::Receiver<ShardEvent>,
    shard_tx: broadcast::Sender<DecodedEvent>,
    all_tx: broadcast::Sender<PoolEvent>,
    mut stopping: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            received = events.recv() => match received {
                Ok(event) => route(index, event, &shard_tx, &all_tx),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(shard = index, skipped, "event forwarder lagged");
                }
                Err(RecvError::Closed) => return,
            },
            _ = stopping.wait_for(|stop| *stop) => break,
        }
    }

    loop {
        match events.try_recv() {
            Ok(event) => route(index, event, &shard_tx, &all_tx),
            Err(TryRecvError::Lagged(skipped)) => {
                warn!(shard = index, skipped, "event forwarder lagged");
            }
            Err(TryRecvError::Empty | TryRecvError::Closed) => return,
        }
    }
}

fn route(
    index: u32,
    event: ShardEvent,
    shard_tx: &broadcast::Sender<DecodedEvent>,
    all_tx: &broadcast::Sender<PoolEvent>,
) {
    match event {
        ShardEvent::Dispatch(event) => {
            let _ = shard_tx.send(event.clone());
            let _ = all_tx.send(PoolEvent {
                shard: index,
                received_at: Utc::now(),
                event,
            });
        }
        ShardEvent::Ready { resumed } => debug!(shard = index, resumed, "ready"),
        ShardEvent::Closed { code, clean } => debug!(shard = index, code, clean, "closed"),
        ShardEvent::Reconnecting { attempt, delay } => {
            info!(shard = index, attempt, delay = ?delay, "reconnecting");
        }
        ShardEvent::Debug(msg) => debug!(shard = index, "{msg}"),
        ShardEvent::Warn(msg) => warn!(shard = index, "{msg}"),
        ShardEvent::Error(msg) => error!(shard = index, "{msg}"),
    }
}
