//! The per-shard gateway state machine.
//!
//! Each shard runs as one task that owns its transport, session cache,
//! heartbeat tracker and timers. Everything else talks to it through a
//! [`ShardHandle`]. Timers are plain deadlines checked in the task's select
//! loop; every handler re-checks state and link presence before acting, so a
//! deadline that fires after a teardown does nothing.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use heimdall_proto::{
    CLOSE_NORMAL, CLOSE_RESUMABLE, CloseCode, ConnectionProperties, DecodedEvent, GatewayCodec,
    HelloPayload, IdentifyPayload, OpCode, ProtoError, READY, RESUMED, ReadyPayload,
    ResumePayload, TransportCompression,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, trace, warn};

use crate::config::ConnectionOptions;
use crate::error::{Result, ShardError};
use crate::gate::IdentifyGate;

use super::events::ShardEvent;
use super::heartbeat::{HeartbeatTick, HeartbeatTracker};
use super::reconnect::ReconnectConfig;
use super::session::{SessionCache, ShardIdentity};
use super::state::{AtomicConnectionState, ConnectionState};
use super::transport::{ABNORMAL_CLOSURE, Connector, TransportEvent, TransportLink};

/// Time allowed to open the transport and receive HELLO, and again to
/// complete IDENTIFY or RESUME.
pub const SOCKET_TIMEOUT: Duration = Duration::from_secs(15);

/// Wait before re-identifying after a non-resumable INVALID_SESSION.
pub const INVALID_SESSION_BACKOFF: Duration = Duration::from_millis(2500);

const EVENT_BUFFER: usize = 1024;

type PendingConnect = Pin<Box<dyn Future<Output = Result<TransportLink>> + Send>>;

/// Everything a shard needs besides its identity.
#[derive(Debug, Clone)]
pub struct ShardSettings {
    /// Bot token.
    pub token: String,
    /// Gateway base URL, without query parameters.
    pub gateway_url: String,
    /// Connection options.
    pub options: ConnectionOptions,
    /// Backoff for transports that fail to open.
    pub reconnect: ReconnectConfig,
    /// Client properties sent in IDENTIFY.
    pub properties: ConnectionProperties,
}

impl ShardSettings {
    /// Settings with default options.
    #[must_use]
    pub fn new(token: impl Into<String>, gateway_url: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            gateway_url: gateway_url.into(),
            options: ConnectionOptions::default(),
            reconnect: ReconnectConfig::default(),
            properties: ConnectionProperties::default(),
        }
    }
}

#[derive(Debug)]
enum ShardCommand {
    Connect { prepaid: bool },
    ConnectAt(Instant),
    Send { opcode: OpCode, data: Value },
    Close,
    Reset,
    SoftReset,
    Shutdown,
}

/// Handle to a running shard.
#[derive(Debug, Clone)]
pub struct ShardHandle {
    identity: ShardIdentity,
    commands: mpsc::UnboundedSender<ShardCommand>,
    state: Arc<AtomicConnectionState>,
    latency_ms: Arc<AtomicU64>,
    events: broadcast::Sender<ShardEvent>,
}

impl ShardHandle {
    /// Shard index.
    #[must_use]
    pub const fn id(&self) -> u32 {
        self.identity.index
    }

    /// Shard index and count.
    #[must_use]
    pub const fn identity(&self) -> ShardIdentity {
        self.identity
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state.load()
    }

    /// Last heartbeat round trip, zero if never measured.
    #[must_use]
    pub fn latency(&self) -> Duration {
        Duration::from_millis(self.latency_ms.load(Ordering::SeqCst))
    }

    /// Subscribe to this shard's notices.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ShardEvent> {
        self.events.subscribe()
    }

    fn command(&self, command: ShardCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| ShardError::ShardStopped(self.identity.index))
    }

    /// Open the transport. A no-op while already connecting or connected.
    ///
    /// # Errors
    ///
    /// Returns an error if the shard task has stopped.
    pub fn connect(&self) -> Result<()> {
        self.command(ShardCommand::Connect { prepaid: false })
    }

    /// Connect holding an identify slot the caller already took from the
    /// gate. The first IDENTIFY spends it instead of asking the gate.
    pub(crate) fn connect_prepaid(&self) -> Result<()> {
        self.command(ShardCommand::Connect { prepaid: true })
    }

    /// Mark the shard identify-stalled and connect at `at`.
    ///
    /// # Errors
    ///
    /// Returns an error if the shard task has stopped.
    pub fn defer_connect(&self, at: Instant) -> Result<()> {
        if !self.state.load().is_terminal() {
            self.state.store(ConnectionState::IdentifyStalled);
        }
        self.command(ShardCommand::ConnectAt(at))
    }

    /// Send a request. Dropped silently if the transport is not open.
    ///
    /// # Errors
    ///
    /// Returns an error if the shard task has stopped.
    pub fn send(&self, opcode: OpCode, data: Value) -> Result<()> {
        self.command(ShardCommand::Send { opcode, data })
    }

    /// Close the transport and cancel all timers. The session is kept.
    ///
    /// # Errors
    ///
    /// Returns an error if the shard task has stopped.
    pub fn close(&self) -> Result<()> {
        self.command(ShardCommand::Close)
    }

    /// Close and forget the session.
    ///
    /// # Errors
    ///
    /// Returns an error if the shard task has stopped.
    pub fn reset(&self) -> Result<()> {
        self.command(ShardCommand::Reset)
    }

    /// Forget the session without touching the transport.
    ///
    /// # Errors
    ///
    /// Returns an error if the shard task has stopped.
    pub fn soft_reset(&self) -> Result<()> {
        self.command(ShardCommand::SoftReset)
    }

    /// Close and stop the shard task.
    ///
    /// # Errors
    ///
    /// Returns an error if the shard task has already stopped.
    pub fn shutdown(&self) -> Result<()> {
        self.command(ShardCommand::Shutdown)
    }
}

/// One shard's connection task.
pub struct ShardConnection<C: Connector> {
    identity: ShardIdentity,
    token: String,
    url: String,
    options: ConnectionOptions,
    properties: ConnectionProperties,
    reconnect: ReconnectConfig,
    connector: C,
    gate: Arc<IdentifyGate>,

    codec: GatewayCodec,
    session: SessionCache,
    heartbeat: HeartbeatTracker,
    link: Option<TransportLink>,
    pending_connect: Option<PendingConnect>,
    connect_attempts: u32,
    prepaid: bool,

    heartbeat_at: Option<Instant>,
    handshake_deadline: Option<Instant>,
    identify_at: Option<Instant>,
    connect_at: Option<Instant>,
    retry_at: Option<Instant>,

    state: Arc<AtomicConnectionState>,
    latency_ms: Arc<AtomicU64>,
    events: broadcast::Sender<ShardEvent>,
    commands: mpsc::UnboundedReceiver<ShardCommand>,
}

impl<C: Connector> ShardConnection<C> {
    /// Spawn a shard task in the idle state.
    ///
    /// # Errors
    ///
    /// Returns an error if the gateway URL in `settings` is invalid.
    pub fn spawn(
        identity: ShardIdentity,
        settings: &ShardSettings,
        gate: Arc<IdentifyGate>,
        connector: C,
    ) -> Result<(ShardHandle, JoinHandle<()>)> {
        let url = settings.options.endpoint(&settings.gateway_url)?;
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let state = Arc::new(AtomicConnectionState::new(ConnectionState::Idle));
        let latency_ms = Arc::new(AtomicU64::new(0));

        let handle = ShardHandle {
            identity,
            commands: command_tx,
            state: Arc::clone(&state),
            latency_ms: Arc::clone(&latency_ms),
            events: events.clone(),
        };

        let connection = Self {
            identity,
            token: settings.token.clone(),
            url,
            options: settings.options.clone(),
            properties: settings.properties.clone(),
            reconnect: settings.reconnect.clone(),
            connector,
            gate,
            codec: GatewayCodec::new(settings.options.compression),
            session: SessionCache::default(),
            heartbeat: HeartbeatTracker::new(),
            link: None,
            pending_connect: None,
            connect_attempts: 0,
            prepaid: false,
            heartbeat_at: None,
            handshake_deadline: None,
            identify_at: None,
            connect_at: None,
            retry_at: None,
            state,
            latency_ms,
            events,
            commands: command_rx,
        };

        Ok((handle, tokio::spawn(connection.run())))
    }

    async fn run(mut self) {
        debug!(shard = self.identity.index, url = %self.url, "shard task started");
        loop {
            tokio::select! {
                biased;
                cmd = self.commands.recv() => match cmd {
                    Some(ShardCommand::Shutdown) | None => {
                        self.close();
                        break;
                    }
                    Some(cmd) => self.on_command(cmd),
                },
                event = next_transport_event(&mut self.link) => match event {
                    Some(TransportEvent::Frame(bytes)) => self.on_frame(&bytes),
                    Some(TransportEvent::Closed { code, clean }) => self.on_close(code, clean),
                    None => self.on_close(ABNORMAL_CLOSURE, false),
                },
                opened = pending_connect(&mut self.pending_connect) => {
                    self.pending_connect = None;
                    self.on_transport_opened(opened);
                }
                () = sleep_until_opt(self.heartbeat_at) => self.on_heartbeat_due(),
                () = sleep_until_opt(self.handshake_deadline) => self.on_handshake_timeout(),
                () = sleep_until_opt(self.identify_at) => self.on_identify_due(),
                () = sleep_until_opt(self.retry_at) => self.on_retry_due(),
                () = sleep_until_opt(self.connect_at) => self.on_connect_due(),
            }
        }
        debug!(shard = self.identity.index, "shard task stopped");
    }

    fn on_command(&mut self, cmd: ShardCommand) {
        match cmd {
            ShardCommand::Connect { prepaid } => {
                self.prepaid |= prepaid;
                self.connect();
            }
            ShardCommand::ConnectAt(at) => {
                let state = self.state.load();
                if state.is_terminal() || state.is_active() || self.link.is_some() {
                    return;
                }
                self.set_state(ConnectionState::IdentifyStalled);
                self.connect_at = Some(at);
            }
            ShardCommand::Send { opcode, data } => {
                self.send(opcode, &data);
            }
            ShardCommand::Close => self.close(),
            ShardCommand::Reset => self.reset(),
            ShardCommand::SoftReset => self.soft_reset(),
            ShardCommand::Shutdown => {}
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.load();
        if previous != state {
            trace!(shard = self.identity.index, from = %previous, to = %state, "state change");
            self.state.store(state);
        }
    }

    fn emit(&self, event: ShardEvent) {
        let _ = self.events.send(event);
    }

    fn connect(&mut self) {
        let state = self.state.load();
        if state.is_terminal() {
            self.emit(ShardEvent::Warn(
                "connect ignored: reconnection is impossible".to_string(),
            ));
            return;
        }
        if state.is_active() || self.link.is_some() || self.pending_connect.is_some() {
            return;
        }

        self.connect_at = None;
        self.connect_attempts = 0;
        self.set_state(ConnectionState::Connecting);
        self.open_transport();
    }

    fn open_transport(&mut self) {
        self.retry_at = None;
        self.codec.reset();
        self.handshake_deadline = Some(Instant::now() + SOCKET_TIMEOUT);

        debug!(shard = self.identity.index, url = %self.url, "opening gateway transport");
        let connector = self.connector.clone();
        let url = self.url.clone();
        self.pending_connect = Some(Box::pin(async move { connector.connect(&url).await }));
    }

    fn on_transport_opened(&mut self, opened: Result<TransportLink>) {
        if self.state.load() != ConnectionState::Connecting {
            if let Ok(link) = opened {
                link.close(CLOSE_NORMAL);
            }
            return;
        }

        match opened {
            Ok(link) => {
                debug!(shard = self.identity.index, "transport open, waiting for HELLO");
                self.connect_attempts = 0;
                self.link = Some(link);
            }
            Err(e) => {
                self.connect_attempts += 1;
                self.handshake_deadline = None;
                if !self.reconnect.should_reconnect(self.connect_attempts) {
                    self.set_state(ConnectionState::Disconnected);
                    self.emit(ShardEvent::Error(format!(
                        "giving up after {} failed connection attempts: {e}",
                        self.connect_attempts
                    )));
                    return;
                }
                let delay = self.reconnect.delay_for_attempt(self.connect_attempts);
                self.emit(ShardEvent::Debug(format!("connection failed: {e}")));
                self.emit(ShardEvent::Reconnecting {
                    attempt: self.connect_attempts,
                    delay,
                });
                self.retry_at = Some(Instant::now() + delay);
            }
        }
    }

    fn on_retry_due(&mut self) {
        self.retry_at = None;
        if self.state.load() == ConnectionState::Connecting
            && self.link.is_none()
            && self.pending_connect.is_none()
        {
            self.open_transport();
        }
    }

    fn on_connect_due(&mut self) {
        self.connect_at = None;
        if self.state.load() == ConnectionState::IdentifyStalled {
            info!(shard = self.identity.index, "identify window reset, connecting");
            self.connect();
        }
    }

    fn on_frame(&mut self, bytes: &[u8]) {
        let event = match self.codec.decode(bytes) {
            Ok(Some(event)) => event,
            Ok(None) => return,
            Err(e @ ProtoError::Decompression(_))
                if self.codec.compression() == TransportCompression::ZlibStream =>
            {
                // Later frames depend on the lost inflate state.
                self.emit(ShardEvent::Warn(format!(
                    "zlib stream corrupted, reconnecting: {e}"
                )));
                self.reconnect_resumable();
                return;
            }
            Err(e) => {
                self.emit(ShardEvent::Warn(format!("dropping undecodable frame: {e}")));
                return;
            }
        };

        trace!(
            shard = self.identity.index,
            op = %event.opcode,
            seq = ?event.sequence,
            event_type = ?event.event_type,
            "frame received"
        );
        self.session.observe_sequence(event.sequence);

        match event.opcode {
            OpCode::Dispatch => self.on_dispatch(event),
            OpCode::Heartbeat => {
                self.send_heartbeat();
            }
            OpCode::Hello => self.on_hello(&event.payload),
            OpCode::Reconnect => {
                self.emit(ShardEvent::Debug(
                    "gateway requested a reconnect".to_string(),
                ));
                self.reconnect_resumable();
            }
            OpCode::InvalidSession => {
                self.on_invalid_session(event.payload.as_bool().unwrap_or(false));
            }
            OpCode::HeartbeatAck => self.on_heartbeat_ack(),
            other => {
                debug!(shard = self.identity.index, op = %other, "ignoring opcode");
            }
        }
    }

    fn on_dispatch(&mut self, event: DecodedEvent) {
        if event.is_dispatch(READY) {
            match ReadyPayload::deserialize(&event.payload) {
                Ok(ready) => self.session.session_id = Some(ready.session_id),
                Err(e) => self.emit(ShardEvent::Warn(format!("READY without session id: {e}"))),
            }
        }

        let resumed = event.is_dispatch(RESUMED);
        if resumed || event.is_dispatch(READY) {
            self.handshake_deadline = None;
            self.set_state(ConnectionState::Ready);
            info!(shard = self.identity.index, resumed, "shard ready");
            self.emit(ShardEvent::Ready { resumed });
        }

        self.emit(ShardEvent::Dispatch(event));
    }

    fn on_hello(&mut self, payload: &Value) {
        if self.link.is_none() {
            return;
        }
        let hello = match HelloPayload::deserialize(payload) {
            Ok(hello) => hello,
            Err(e) => {
                self.emit(ShardEvent::Warn(format!("malformed HELLO: {e}")));
                return;
            }
        };

        self.handshake_deadline = None;
        if let Some(trace) = &hello.trace {
            debug!(shard = self.identity.index, trace = ?trace, "gateway trace");
        }

        let interval = Duration::from_millis(hello.heartbeat_interval.max(1));
        self.heartbeat.start(interval);
        self.heartbeat_at = Some(Instant::now() + interval);
        self.identify();
    }

    fn identify(&mut self) {
        if self.link.is_none() {
            return;
        }
        self.identify_at = None;
        self.set_state(ConnectionState::Identifying);

        if let Some(session_id) = self.session.session_id.clone() {
            info!(
                shard = self.identity.index,
                seq = ?self.session.last_sequence,
                "resuming session"
            );
            let resume = ResumePayload {
                token: self.token.clone(),
                session_id,
                seq: self.session.last_sequence,
            };
            self.send_payload(OpCode::Resume, &resume);
        } else {
            if !std::mem::take(&mut self.prepaid) && !self.gate.try_acquire() {
                let at = self.gate.resets_at();
                self.handshake_deadline = None;
                self.identify_at = Some(at);
                self.emit(ShardEvent::Debug(format!(
                    "identify budget exhausted, waiting {:?}",
                    at.saturating_duration_since(Instant::now())
                )));
                return;
            }

            info!(shard = self.identity.index, "identifying");
            let identify = IdentifyPayload {
                token: self.token.clone(),
                properties: self.properties.clone(),
                compress: self.options.payload_compression,
                large_threshold: self.options.large_threshold,
                shard: self.identity.as_pair(),
                guild_subscriptions: self.options.guild_subscriptions,
                intents: self.options.intents,
            };
            self.send_payload(OpCode::Identify, &identify);
        }

        self.handshake_deadline = Some(Instant::now() + SOCKET_TIMEOUT);
    }

    fn on_identify_due(&mut self) {
        self.identify_at = None;
        if self.state.load() == ConnectionState::Identifying {
            self.identify();
        }
    }

    fn on_invalid_session(&mut self, resumable: bool) {
        if resumable {
            self.emit(ShardEvent::Debug(
                "session invalidated, resuming".to_string(),
            ));
            self.identify();
            return;
        }

        self.emit(ShardEvent::Debug(format!(
            "session invalidated, re-identifying in {INVALID_SESSION_BACKOFF:?}"
        )));
        self.handshake_deadline = None;
        self.soft_reset();
        self.set_state(ConnectionState::Identifying);
        self.identify_at = Some(Instant::now() + INVALID_SESSION_BACKOFF);
    }

    fn on_heartbeat_due(&mut self) {
        self.heartbeat_at = None;
        if self.link.is_none() {
            return;
        }
        let Some(interval) = self.heartbeat.interval() else {
            return;
        };

        match self.heartbeat.tick() {
            HeartbeatTick::Missed => {
                self.emit(ShardEvent::Warn(
                    "last heartbeat was not acknowledged, reconnecting".to_string(),
                ));
                self.reconnect_resumable();
            }
            HeartbeatTick::Send => {
                let now = Instant::now();
                if self.send_heartbeat() {
                    self.heartbeat.record_sent(now);
                } else {
                    debug!(
                        shard = self.identity.index,
                        "heartbeat not queued, retrying next interval"
                    );
                }
                self.heartbeat_at = Some(now + interval);
            }
        }
    }

    fn send_heartbeat(&self) -> bool {
        let seq = self.session.last_sequence.map_or(Value::Null, Value::from);
        self.send(OpCode::Heartbeat, &seq)
    }

    fn on_heartbeat_ack(&mut self) {
        if let Some(rtt) = self.heartbeat.record_ack(Instant::now()) {
            let millis = u64::try_from(rtt.as_millis()).unwrap_or(u64::MAX);
            self.latency_ms.store(millis, Ordering::SeqCst);
            trace!(shard = self.identity.index, latency_ms = millis, "heartbeat acknowledged");
        }
    }

    fn on_handshake_timeout(&mut self) {
        self.handshake_deadline = None;
        let state = self.state.load();
        if !matches!(
            state,
            ConnectionState::Connecting | ConnectionState::Identifying
        ) {
            return;
        }

        let stage = if state == ConnectionState::Connecting {
            "connection"
        } else {
            "identify"
        };
        self.emit(ShardEvent::Warn(format!("{stage} timeout")));
        self.reset();
        self.connect();
    }

    fn on_close(&mut self, code: u16, clean: bool) {
        let close = CloseCode::from(code);
        self.teardown(None);
        self.set_state(ConnectionState::Disconnected);
        info!(shard = self.identity.index, code = %close, clean, "gateway connection closed");
        self.emit(ShardEvent::Closed { code, clean });

        if close.is_fatal() {
            self.set_state(ConnectionState::ReconnectionImpossible);
            let err = ShardError::ReconnectionImpossible { code };
            self.emit(ShardEvent::Error(err.to_string()));
            return;
        }

        if close.is_unknown() && !clean {
            self.emit(ShardEvent::Debug(format!(
                "closed with an unknown close code: {code}"
            )));
        }
        self.reset();
        self.connect();
    }

    /// Close with a code that keeps the session alive server side, then
    /// connect again and resume.
    fn reconnect_resumable(&mut self) {
        self.teardown(Some(CLOSE_RESUMABLE));
        self.set_state(ConnectionState::Disconnected);
        self.connect();
    }

    /// Queue a request. Returns whether it reached the outbound queue.
    fn send(&self, opcode: OpCode, data: &Value) -> bool {
        let Some(link) = &self.link else {
            trace!(shard = self.identity.index, op = %opcode, "transport not open, dropping send");
            return false;
        };
        match heimdall_proto::encode(opcode, data) {
            Ok(frame) => {
                trace!(shard = self.identity.index, op = %opcode, len = frame.len(), "frame sent");
                let queued = link.send(frame);
                if !queued {
                    debug!(shard = self.identity.index, op = %opcode, "outbound queue unavailable, dropping send");
                }
                queued
            }
            Err(e) => {
                warn!(shard = self.identity.index, op = %opcode, error = %e, "failed to encode request");
                false
            }
        }
    }

    fn send_payload<T: Serialize>(&self, opcode: OpCode, payload: &T) {
        match serde_json::to_value(payload) {
            Ok(data) => {
                self.send(opcode, &data);
            }
            Err(e) => {
                warn!(shard = self.identity.index, op = %opcode, error = %e, "failed to serialize request");
            }
        }
    }

    /// Drop the transport and every timer as one step.
    fn teardown(&mut self, close_code: Option<u16>) {
        if let Some(link) = self.link.take() {
            if let Some(code) = close_code {
                link.close(code);
            }
        }
        self.pending_connect = None;
        self.heartbeat.stop();
        self.heartbeat_at = None;
        self.handshake_deadline = None;
        self.identify_at = None;
        self.connect_at = None;
        self.retry_at = None;
    }

    fn close(&mut self) {
        self.teardown(Some(CLOSE_NORMAL));
        if !self.state.load().is_terminal() {
            self.set_state(ConnectionState::Disconnected);
        }
    }

    fn reset(&mut self) {
        self.close();
        self.session.clear();
    }

    fn soft_reset(&mut self) {
        self.session.clear();
    }
}

async fn next_transport_event(link: &mut Option<TransportLink>) -> Option<TransportEvent> {
    match link {
        Some(link) => link.recv().await,
        None => std::future::pending().await,
    }
}

async fn pending_connect(slot: &mut Option<PendingConnect>) -> Result<TransportLink> {
    match slot {
        Some(connect) => connect.await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}
