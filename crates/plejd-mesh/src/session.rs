//! Mesh session: the protocol state machine for one gateway link
//!
//! ```text
//! Idle ──► Discovering ──► Connecting ──► Authenticating ──► Ready
//!               ▲              │  ▲              │             │
//!               │              └──┴──────────────┘             │
//!               │           (next candidate)                   │
//!               └────────────── Reconnecting ◄─────────────────┘
//! ```
//!
//! The session runs as its own task and owns the transport. Writes reach it
//! through a [`SessionHandle`]; decoded mesh events and lifecycle changes
//! leave it as [`SessionEvent`]s. While the session is not Ready every
//! write is answered with [`PlejdError::NotConnected`], including while
//! the reconnect loop is running.

use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::codec::{MeshEvent, MeshFrame};
use crate::config::SessionConfig;
use crate::crypto::{challenge_response, encrypt_decrypt, MeshKey};
use crate::error::{PlejdError, Result};
use crate::transport::{
    sort_by_signal, BleAddress, BleTransport, Candidate, GattCharacteristic, NotificationStream,
    PLEJD_SERVICE_UUID,
};

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Not started
    Idle,
    /// Scanning for gateways
    Discovering,
    /// Opening a GATT link to a candidate
    Connecting,
    /// Running the challenge-response handshake
    Authenticating,
    /// Authenticated and subscribed; writes are accepted
    Ready,
    /// Link lost; the reconnect loop owns the session
    Reconnecting,
}

impl SessionState {
    /// Whether `next` is a legal successor of this state
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Idle, Discovering)
                | (Discovering, Connecting)
                | (Connecting, Authenticating)
                | (Authenticating, Connecting)
                | (Authenticating, Ready)
                | (Reconnecting, Discovering)
                | (Idle | Discovering | Connecting | Authenticating | Ready, Reconnecting)
        )
    }
}

/// Events the session reports to the bridge
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The link is Ready
    Connected {
        /// Gateway the session is linked through
        peer: BleAddress,
    },
    /// The link was lost and the reconnect loop started
    Reconnecting,
    /// A decoded inbound mesh event
    Mesh(MeshEvent),
}

/// Session counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Successful data writes
    pub writes: u64,
    /// Failed data writes
    pub write_failures: u64,
    /// Keepalive probes sent
    pub pings: u64,
    /// Keepalive probes that failed or mismatched
    pub ping_failures: u64,
    /// Reconnect loops started
    pub reconnects_requested: u64,
    /// Reconnect iterations run
    pub reconnect_attempts: u64,
    /// Adapter power cycles
    pub power_cycles: u64,
    /// Notifications received
    pub notifications: u64,
    /// Notifications dropped as undersized
    pub dropped_frames: u64,
    /// Current run of write/ping failures
    pub consecutive_failures: u32,
}

/// Request from a [`SessionHandle`]
#[derive(Debug)]
pub struct SessionRequest {
    frame: Vec<u8>,
    reply: oneshot::Sender<Result<()>>,
}

impl SessionRequest {
    fn reject(self) {
        let _ = self.reply.send(Err(PlejdError::NotConnected));
    }
}

/// Handle for writing through a running session
#[derive(Clone)]
pub struct SessionHandle {
    requests: mpsc::Sender<SessionRequest>,
    stats: Arc<Mutex<SessionStats>>,
    state: watch::Receiver<SessionState>,
}

impl SessionHandle {
    /// Encrypt and write a frame to the gateway
    pub async fn write(&self, frame: &MeshFrame) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(SessionRequest {
                frame: frame.encode(),
                reply,
            })
            .await
            .map_err(|_| PlejdError::ChannelClosed)?;
        rx.await.map_err(|_| PlejdError::ChannelClosed)?
    }

    /// Snapshot of the session counters
    pub fn stats(&self) -> SessionStats {
        self.stats.lock().clone()
    }

    /// Current session state
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }
}

/// Protocol state machine over a [`BleTransport`]
pub struct MeshSession<T: BleTransport> {
    transport: T,
    key: MeshKey,
    config: SessionConfig,
    state: SessionState,
    state_tx: watch::Sender<SessionState>,
    peer: Option<BleAddress>,
    notifications: Option<NotificationStream>,
    reconnect_attempts: u32,
    stats: Arc<Mutex<SessionStats>>,
    events: mpsc::UnboundedSender<SessionEvent>,
    requests: Option<mpsc::Receiver<SessionRequest>>,
    gateways: HashMap<BleAddress, u8>,
}

impl<T: BleTransport + 'static> MeshSession<T> {
    /// Create a session
    ///
    /// `gateways` maps gateway BLE addresses to their mesh ids and is only
    /// needed for clock sync.
    pub fn new(
        transport: T,
        key: MeshKey,
        config: SessionConfig,
        gateways: HashMap<BleAddress, u8>,
    ) -> (Self, SessionHandle, mpsc::UnboundedReceiver<SessionEvent>) {
        let (request_tx, request_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let stats = Arc::new(Mutex::new(SessionStats::default()));

        let handle = SessionHandle {
            requests: request_tx,
            stats: stats.clone(),
            state: state_rx,
        };

        let session = Self {
            transport,
            key,
            config,
            state: SessionState::Idle,
            state_tx,
            peer: None,
            notifications: None,
            reconnect_attempts: 0,
            stats,
            events: event_tx,
            requests: Some(request_rx),
            gateways,
        };

        (session, handle, event_rx)
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Run the session until every handle is dropped
    pub async fn run(mut self) {
        let Some(mut requests) = self.requests.take() else {
            warn!("Mesh session already ran");
            return;
        };

        info!(transport = self.transport.name(), "Starting mesh session");

        let ping_period = self.config.ping_interval;
        let mut ping = interval_at(Instant::now() + ping_period, ping_period);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let clock_period = self.config.clock_sync_interval;
        let mut clock = interval_at(Instant::now() + clock_period, clock_period);
        clock.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if self.state != SessionState::Ready {
                if !self.connect_loop(&mut requests).await {
                    break;
                }
                ping.reset();
                clock.reset();
                continue;
            }

            tokio::select! {
                request = requests.recv() => match request {
                    Some(request) => {
                        let result = self.write(&request.frame).await;
                        let _ = request.reply.send(result);
                    }
                    None => break,
                },

                notification = next_notification(&mut self.notifications) => match notification {
                    Some(data) => self.handle_notification(&data).await,
                    None => {
                        warn!("Notification stream ended");
                        self.notifications = None;
                        self.request_reconnect("notification stream ended");
                    }
                },

                _ = ping.tick() => self.keepalive().await,

                _ = clock.tick(), if self.config.sync_clock => self.query_clock().await,
            }
        }

        self.teardown().await;
        info!("Mesh session stopped");
    }

    /// Run connect attempts until the link is Ready; writes are rejected
    /// meanwhile. Returns false once every handle is gone.
    async fn connect_loop(&mut self, requests: &mut mpsc::Receiver<SessionRequest>) -> bool {
        let mut first = self.state == SessionState::Idle;

        loop {
            let outcome = {
                let attempt = self.connect_attempt(first);
                tokio::pin!(attempt);
                loop {
                    tokio::select! {
                        outcome = &mut attempt => break outcome,
                        request = requests.recv() => match request {
                            Some(request) => request.reject(),
                            None => return false,
                        },
                    }
                }
            };
            first = false;

            match outcome {
                Ok(()) => return true,
                Err(e) => {
                    warn!(error = %e, code = e.error_code(), "Connect attempt failed");
                    self.set_state(SessionState::Reconnecting);
                }
            }
        }
    }

    async fn connect_attempt(&mut self, first: bool) -> Result<()> {
        if !first {
            self.teardown().await;
            self.reconnect_attempts += 1;
            self.stats.lock().reconnect_attempts += 1;

            let every = self.config.power_cycle_every;
            if every > 0 && self.reconnect_attempts % every == 0 {
                self.power_cycle().await;
            }

            info!(
                attempt = self.reconnect_attempts,
                delay_ms = self.config.reconnect_delay.as_millis() as u64,
                "Reconnecting to mesh"
            );
            tokio::time::sleep(self.config.reconnect_delay).await;
        }

        bounded(self.config.watchdog_timeout, self.establish()).await
    }

    async fn power_cycle(&mut self) {
        info!(attempt = self.reconnect_attempts, "Power cycling Bluetooth adapter");
        self.stats.lock().power_cycles += 1;

        let limit = self.config.watchdog_timeout;
        if let Err(e) = bounded(limit, self.transport.set_adapter_power(false)).await {
            warn!(error = %e, "Failed to power off adapter");
        }
        tokio::time::sleep(self.config.power_off_wait).await;
        if let Err(e) = bounded(limit, self.transport.set_adapter_power(true)).await {
            warn!(error = %e, "Failed to power on adapter");
        }
        tokio::time::sleep(self.config.power_on_wait).await;
    }

    /// Discover, connect, authenticate and subscribe
    pub async fn establish(&mut self) -> Result<()> {
        self.set_state(SessionState::Discovering);

        let mut candidates = self
            .transport
            .scan(PLEJD_SERVICE_UUID, self.config.discovery_timeout)
            .await?;
        if candidates.is_empty() {
            return Err(PlejdError::NoCandidates {
                window_ms: self.config.discovery_timeout.as_millis() as u64,
            });
        }

        sort_by_signal(&mut candidates);
        info!(count = candidates.len(), "Found mesh gateways");

        for candidate in &candidates {
            self.set_state(SessionState::Connecting);
            debug!(address = %candidate.address, rssi = candidate.rssi, "Trying gateway");

            match self.open_link(candidate).await {
                Ok(stream) => {
                    self.on_ready(candidate.address, stream).await;
                    return Ok(());
                }
                Err(e) => {
                    warn!(address = %candidate.address, error = %e, "Gateway failed");
                    if let Err(e) = self.transport.disconnect().await {
                        debug!(error = %e, "Disconnect after failure");
                    }
                }
            }
        }

        Err(PlejdError::AllCandidatesFailed {
            count: candidates.len(),
        })
    }

    async fn open_link(&mut self, candidate: &Candidate) -> Result<NotificationStream> {
        self.transport.connect(candidate).await?;
        tokio::time::sleep(self.config.connect_settle).await;

        let available = self
            .transport
            .discover_characteristics(PLEJD_SERVICE_UUID)
            .await?;
        GattCharacteristic::bind_all(&available)?;

        self.set_state(SessionState::Authenticating);
        self.authenticate().await?;

        self.transport.subscribe(GattCharacteristic::LastData).await
    }

    async fn authenticate(&mut self) -> Result<()> {
        self.transport
            .write(GattCharacteristic::Auth, &[0x00])
            .await?;
        let challenge = self.transport.read(GattCharacteristic::Auth).await?;
        let response = challenge_response(&self.key, &challenge)
            .map_err(|e| PlejdError::AuthFailed(e.to_string()))?;
        self.transport
            .write(GattCharacteristic::Auth, &response)
            .await
            .map_err(|e| PlejdError::AuthFailed(e.to_string()))
    }

    async fn on_ready(&mut self, peer: BleAddress, stream: NotificationStream) {
        self.set_state(SessionState::Ready);
        self.peer = Some(peer);
        self.notifications = Some(stream);
        self.reconnect_attempts = 0;
        self.stats.lock().consecutive_failures = 0;

        info!(peer = %peer, "Mesh session ready");
        self.emit(SessionEvent::Connected { peer });

        if self.config.sync_clock {
            self.query_clock().await;
        }
    }

    /// Encrypt and write a plain frame to the Data characteristic
    pub async fn write(&mut self, frame: &[u8]) -> Result<()> {
        match self.write_frame(frame).await {
            Ok(()) => {
                let mut stats = self.stats.lock();
                stats.writes += 1;
                stats.consecutive_failures = 0;
                Ok(())
            }
            Err(PlejdError::NotConnected) => Err(PlejdError::NotConnected),
            Err(e) => {
                self.stats.lock().write_failures += 1;
                self.note_failure(&e);
                Err(e)
            }
        }
    }

    async fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        if self.state != SessionState::Ready {
            return Err(PlejdError::NotConnected);
        }
        let peer = self.peer.ok_or(PlejdError::NotConnected)?;

        trace!(frame = %hex::encode(frame), "Writing frame");
        let encrypted = encrypt_decrypt(&self.key, &peer.mesh_address(), frame);
        self.transport
            .write(GattCharacteristic::Data, &encrypted)
            .await
    }

    /// Probe the link through the Ping characteristic
    pub async fn ping(&mut self) -> Result<()> {
        let sent: u8 = rand::random();
        let expected = sent.wrapping_add(1);

        self.transport
            .write(GattCharacteristic::Ping, &[sent])
            .await?;
        let answer = self.transport.read(GattCharacteristic::Ping).await?;

        match answer.first().copied() {
            Some(received) if received == expected => Ok(()),
            received => Err(PlejdError::PingMismatch {
                sent,
                expected,
                received,
            }),
        }
    }

    async fn keepalive(&mut self) {
        self.stats.lock().pings += 1;
        match self.ping().await {
            Ok(()) => {
                trace!("Ping ok");
                self.stats.lock().consecutive_failures = 0;
            }
            Err(e) => {
                self.stats.lock().ping_failures += 1;
                self.note_failure(&e);
            }
        }
    }

    fn note_failure(&mut self, error: &PlejdError) {
        let failures = {
            let mut stats = self.stats.lock();
            stats.consecutive_failures += 1;
            stats.consecutive_failures
        };
        warn!(error = %error, code = error.error_code(), failures, "Link operation failed");

        if error.is_link_down() {
            self.request_reconnect("link down");
        } else if failures >= self.config.failure_threshold {
            self.request_reconnect("too many consecutive failures");
        }
    }

    /// Start the reconnect loop unless it already runs. Returns whether
    /// this call started it.
    pub fn request_reconnect(&mut self, reason: &str) -> bool {
        if self.state == SessionState::Reconnecting {
            debug!(reason, "Reconnect already in progress");
            return false;
        }

        warn!(reason, "Mesh link lost, reconnecting");
        self.set_state(SessionState::Reconnecting);
        self.stats.lock().reconnects_requested += 1;
        self.emit(SessionEvent::Reconnecting);
        true
    }

    async fn handle_notification(&mut self, data: &[u8]) {
        self.stats.lock().notifications += 1;
        let Some(peer) = self.peer else {
            return;
        };

        let decrypted = encrypt_decrypt(&self.key, &peer.mesh_address(), data);
        let frame = match MeshFrame::decode(&decrypted) {
            Ok(frame) => frame,
            Err(e) => {
                self.stats.lock().dropped_frames += 1;
                trace!(error = %e, "Dropping stub frame");
                return;
            }
        };

        trace!(frame = %hex::encode(&decrypted), "Notification");
        match MeshEvent::from_frame(&frame) {
            MeshEvent::TimeUpdated { mesh_seconds, .. } => self.correct_clock(mesh_seconds).await,
            MeshEvent::Unhandled { address, opcode } => {
                debug!(address, opcode = ?opcode, "Ignoring unhandled opcode");
            }
            event => self.emit(SessionEvent::Mesh(event)),
        }
    }

    fn gateway_mesh_address(&self) -> Option<u8> {
        self.peer.and_then(|peer| self.gateways.get(&peer).copied())
    }

    async fn query_clock(&mut self) {
        let Some(gateway) = self.gateway_mesh_address() else {
            debug!("Gateway mesh id unknown, skipping clock sync");
            return;
        };
        if let Err(e) = self.write_frame(&MeshFrame::time_query(gateway).encode()).await {
            warn!(error = %e, "Clock query failed");
        }
    }

    async fn correct_clock(&mut self, mesh_seconds: i64) {
        if !self.config.sync_clock {
            return;
        }
        let Some(gateway) = self.gateway_mesh_address() else {
            debug!("Gateway mesh id unknown, skipping clock sync");
            return;
        };

        let local = local_wall_seconds();
        let drift = local.abs_diff(mesh_seconds);
        if drift <= self.config.clock_drift_tolerance.as_secs() {
            trace!(drift, "Mesh clock within tolerance");
            return;
        }

        info!(drift, gateway, "Correcting mesh clock");
        let frame = MeshFrame::time_set(gateway, local as u32);
        if let Err(e) = self.write_frame(&frame.encode()).await {
            warn!(error = %e, "Clock correction failed");
        }
    }

    async fn teardown(&mut self) {
        self.notifications = None;
        self.peer = None;
        let limit = self.config.watchdog_timeout;
        if let Err(e) = bounded(limit, self.transport.disconnect()).await {
            warn!(error = %e, code = e.error_code(), "Disconnect during teardown");
        }
    }

    fn set_state(&mut self, next: SessionState) {
        if self.state == next {
            return;
        }
        if !self.state.can_transition_to(next) {
            warn!(from = ?self.state, to = ?next, "Unexpected session transition");
        }
        debug!(from = ?self.state, to = ?next, "Session state");

        if self.state == SessionState::Ready {
            self.peer = None;
            self.notifications = None;
        }
        self.state = next;
        self.state_tx.send_replace(next);
    }

    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            trace!("Session event receiver dropped");
        }
    }
}

async fn next_notification(stream: &mut Option<NotificationStream>) -> Option<Vec<u8>> {
    match stream {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

/// Local wall-clock seconds encoded as if UTC, the mesh's time base
fn local_wall_seconds() -> i64 {
    chrono::Local::now().naive_local().and_utc().timestamp()
}

/// Run a transport call under the watchdog; a call that never resolves
/// must not stall the reconnect loop
async fn bounded<T>(limit: Duration, call: impl Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(PlejdError::WatchdogExpired {
            duration_ms: limit.as_millis() as u64,
        }),
    }
}
