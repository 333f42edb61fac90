//! Test utilities: an in-memory BLE transport and site fixtures
//!
//! [`FakeTransport`] stands in for a gateway. It hands out scripted scan
//! results, answers the authentication and ping handshakes, records every
//! write, and lets a test inject encrypted notifications or link failures.
//! Clones share state, so a test keeps one clone while the session owns
//! another.
//!
//! # Example
//!
//! ```rust,ignore
//! use plejd_mesh::test_utils::{test_directory, test_key, FakeTransport};
//!
//! let transport = FakeTransport::new();
//! let bridge = plejd_mesh::start(transport.clone(), test_directory(), test_key(), &Default::default());
//! ```

use async_trait::async_trait;
use futures::channel::mpsc as notify;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::crypto::{encrypt_decrypt, MeshKey};
use crate::directory::{
    DeviceDirectory, DeviceKind, GatewayEntry, InputEntry, OutputEntry, SceneEntry, SiteSnapshot,
};
use crate::error::{PlejdError, Result};
use crate::transport::{
    BleAddress, BleTransport, Candidate, GattCharacteristic, NotificationStream,
};

/// Mesh key of the fixture site
pub const TEST_MESH_KEY: &str = "0123456789abcdef0123456789abcdef";

/// BLE address of the fixture gateway
pub const GATEWAY_ADDRESS: BleAddress = BleAddress([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0x01]);

/// Challenge the fake gateway hands out
pub const TEST_CHALLENGE: [u8; 16] = [
    0x10, 0x32, 0x54, 0x76, 0x98, 0xba, 0xdc, 0xfe, 0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef,
];

/// The fixture site key
pub fn test_key() -> MeshKey {
    // Constant is valid hex of the right length
    MeshKey::from_hex(TEST_MESH_KEY).unwrap_or_else(|_| MeshKey::new([0; 16]))
}

/// A small site: a dimmable light, a relay, a color light, a two-button
/// remote and one scene, reachable through [`GATEWAY_ADDRESS`].
pub fn test_snapshot() -> SiteSnapshot {
    let output = |id: &str, address: u8, kind, dimmable, color| OutputEntry {
        unique_id: id.to_string(),
        name: id.replace('-', " "),
        output_address: address,
        kind,
        dimmable,
        supports_color_temp: color,
    };

    SiteSnapshot {
        mesh_key: Some(TEST_MESH_KEY.to_string()),
        outputs: vec![
            output("light-kitchen", 5, DeviceKind::Light, true, false),
            output("switch-porch", 7, DeviceKind::Switch, false, false),
            output("light-living", 9, DeviceKind::Light, true, true),
        ],
        inputs: (0..2)
            .map(|button| InputEntry {
                unique_id: "remote-hall".to_string(),
                name: "remote hall".to_string(),
                input_address: 0x20,
                button_index: button,
            })
            .collect(),
        scenes: vec![SceneEntry {
            unique_id: "scene-evening".to_string(),
            name: "Evening".to_string(),
            scene_address: 3,
        }],
        gateways: vec![GatewayEntry {
            ble_address: GATEWAY_ADDRESS,
            output_address: 5,
        }],
    }
}

/// Directory built from [`test_snapshot`]
pub fn test_directory() -> DeviceDirectory {
    DeviceDirectory::from_snapshot(&test_snapshot()).unwrap_or_default()
}

struct FakeState {
    candidates: Vec<Candidate>,
    failing_connects: HashSet<BleAddress>,
    characteristics: Vec<Uuid>,
    challenge: Vec<u8>,
    ping_offset: u8,
    data_write_error: Option<String>,
    hang_scan: bool,
    hang_disconnect: bool,
    connected: Option<BleAddress>,
    last_peer: Option<BleAddress>,
    connect_attempts: Vec<BleAddress>,
    scans: usize,
    last_ping: u8,
    writes: Vec<(GattCharacteristic, Vec<u8>)>,
    power_events: Vec<bool>,
    notify_tx: Option<notify::UnboundedSender<Vec<u8>>>,
}

/// In-memory [`BleTransport`]
#[derive(Clone)]
pub struct FakeTransport {
    state: Arc<Mutex<FakeState>>,
}

impl Default for FakeTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeTransport {
    /// One healthy gateway at [`GATEWAY_ADDRESS`] exposing every characteristic
    pub fn new() -> Self {
        let state = FakeState {
            candidates: vec![Candidate {
                address: GATEWAY_ADDRESS,
                rssi: -60,
                name: Some("P mesh".to_string()),
            }],
            failing_connects: HashSet::new(),
            characteristics: GattCharacteristic::ALL.iter().map(|c| c.uuid()).collect(),
            challenge: TEST_CHALLENGE.to_vec(),
            ping_offset: 1,
            data_write_error: None,
            hang_scan: false,
            hang_disconnect: false,
            connected: None,
            last_peer: None,
            connect_attempts: Vec::new(),
            scans: 0,
            last_ping: 0,
            writes: Vec::new(),
            power_events: Vec::new(),
            notify_tx: None,
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Replace the scan results
    pub fn with_candidates(self, candidates: Vec<Candidate>) -> Self {
        self.set_candidates(candidates);
        self
    }

    /// Replace the scan results of later scans
    pub fn set_candidates(&self, candidates: Vec<Candidate>) {
        self.state.lock().candidates = candidates;
    }

    /// Make connecting to `address` fail
    pub fn fail_connect(&self, address: BleAddress) {
        self.state.lock().failing_connects.insert(address);
    }

    /// Replace the characteristics the gateway exposes
    pub fn set_characteristics(&self, uuids: Vec<Uuid>) {
        self.state.lock().characteristics = uuids;
    }

    /// Answer pings with `sent + offset` (1 is correct)
    pub fn set_ping_offset(&self, offset: u8) {
        self.state.lock().ping_offset = offset;
    }

    /// Make data writes fail with a transport message, or succeed again
    pub fn fail_data_writes(&self, message: Option<&str>) {
        self.state.lock().data_write_error = message.map(str::to_string);
    }

    /// Make scans never complete, as a wedged BlueZ discovery does
    pub fn hang_scan(&self, hang: bool) {
        self.state.lock().hang_scan = hang;
    }

    /// Make disconnect never complete
    pub fn hang_disconnect(&self, hang: bool) {
        self.state.lock().hang_disconnect = hang;
    }

    /// Challenge handed out during authentication
    pub fn challenge(&self) -> Vec<u8> {
        self.state.lock().challenge.clone()
    }

    /// Every write, in order
    pub fn writes(&self) -> Vec<(GattCharacteristic, Vec<u8>)> {
        self.state.lock().writes.clone()
    }

    /// Forget recorded writes
    pub fn clear_writes(&self) {
        self.state.lock().writes.clear();
    }

    /// Data writes decrypted with `key` for the most recent peer
    pub fn data_frames(&self, key: &MeshKey) -> Vec<Vec<u8>> {
        let state = self.state.lock();
        let Some(peer) = state.last_peer else {
            return Vec::new();
        };
        state
            .writes
            .iter()
            .filter(|(c, _)| *c == GattCharacteristic::Data)
            .map(|(_, data)| encrypt_decrypt(key, &peer.mesh_address(), data))
            .collect()
    }

    /// Adapter power changes, in order
    pub fn power_events(&self) -> Vec<bool> {
        self.state.lock().power_events.clone()
    }

    /// Addresses connect was called with, in order
    pub fn connect_attempts(&self) -> Vec<BleAddress> {
        self.state.lock().connect_attempts.clone()
    }

    /// Number of scans run
    pub fn scan_count(&self) -> usize {
        self.state.lock().scans
    }

    /// Whether a link is open
    pub fn is_connected(&self) -> bool {
        self.state.lock().connected.is_some()
    }

    /// Whether someone holds the notification stream
    pub fn is_subscribed(&self) -> bool {
        self.state
            .lock()
            .notify_tx
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    /// Encrypt a plain frame for the current peer and deliver it as a
    /// notification. Returns false when nobody is subscribed.
    pub fn notify(&self, key: &MeshKey, plain: &[u8]) -> bool {
        let state = self.state.lock();
        let (Some(peer), Some(tx)) = (state.connected, state.notify_tx.as_ref()) else {
            return false;
        };
        tx.unbounded_send(encrypt_decrypt(key, &peer.mesh_address(), plain))
            .is_ok()
    }

    /// Drop the link as if the gateway vanished
    pub fn drop_link(&self) {
        let mut state = self.state.lock();
        state.connected = None;
        state.notify_tx = None;
    }

    fn require_link(state: &FakeState) -> Result<()> {
        if state.connected.is_some() {
            Ok(())
        } else {
            Err(PlejdError::from_transport_message("Not connected"))
        }
    }
}

#[async_trait]
impl BleTransport for FakeTransport {
    async fn scan(&mut self, _service: Uuid, _window: Duration) -> Result<Vec<Candidate>> {
        let (hang, candidates) = {
            let mut state = self.state.lock();
            state.scans += 1;
            (state.hang_scan, state.candidates.clone())
        };
        if hang {
            futures::future::pending::<()>().await;
        }
        Ok(candidates)
    }

    async fn connect(&mut self, candidate: &Candidate) -> Result<()> {
        let mut state = self.state.lock();
        state.connect_attempts.push(candidate.address);
        if state.failing_connects.contains(&candidate.address) {
            return Err(PlejdError::ConnectFailed {
                address: candidate.address.to_string(),
                reason: "le-connection-abort-by-local".to_string(),
            });
        }
        state.connected = Some(candidate.address);
        state.last_peer = Some(candidate.address);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        let hang = self.state.lock().hang_disconnect;
        if hang {
            futures::future::pending::<()>().await;
        }
        let mut state = self.state.lock();
        state.connected = None;
        state.notify_tx = None;
        Ok(())
    }

    async fn discover_characteristics(&mut self, _service: Uuid) -> Result<Vec<Uuid>> {
        let state = self.state.lock();
        Self::require_link(&state)?;
        Ok(state.characteristics.clone())
    }

    async fn write(&mut self, characteristic: GattCharacteristic, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        Self::require_link(&state)?;

        if characteristic == GattCharacteristic::Data {
            if let Some(message) = &state.data_write_error {
                return Err(PlejdError::from_transport_message(message.clone()));
            }
        }
        if characteristic == GattCharacteristic::Ping {
            state.last_ping = data.first().copied().unwrap_or(0);
        }
        state.writes.push((characteristic, data.to_vec()));
        Ok(())
    }

    async fn read(&mut self, characteristic: GattCharacteristic) -> Result<Vec<u8>> {
        let state = self.state.lock();
        Self::require_link(&state)?;

        Ok(match characteristic {
            GattCharacteristic::Auth => state.challenge.clone(),
            GattCharacteristic::Ping => vec![state.last_ping.wrapping_add(state.ping_offset)],
            GattCharacteristic::Data | GattCharacteristic::LastData => Vec::new(),
        })
    }

    async fn subscribe(&mut self, characteristic: GattCharacteristic) -> Result<NotificationStream> {
        let mut state = self.state.lock();
        Self::require_link(&state)?;
        if characteristic != GattCharacteristic::LastData {
            return Err(PlejdError::Transport(format!(
                "{characteristic} does not notify"
            )));
        }

        let (tx, rx) = notify::unbounded();
        state.notify_tx = Some(tx);
        Ok(rx.boxed())
    }

    async fn set_adapter_power(&mut self, powered: bool) -> Result<()> {
        let mut state = self.state.lock();
        state.power_events.push(powered);
        if !powered {
            state.connected = None;
            state.notify_tx = None;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "fake"
    }
}
