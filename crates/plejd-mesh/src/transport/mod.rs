//! BLE transport implementations for talking to a Plejd mesh gateway
//!
//! The mesh session drives the host Bluetooth stack only through the
//! [`BleTransport`] trait:
//!
//! - [`bluez::BluezTransport`] - BlueZ over D-Bus (requires `bluez` feature)
//! - [`crate::test_utils::FakeTransport`] - in-memory transport for tests
//!
//! # Feature Requirements
//!
//! - `bluez`: Requires the D-Bus development files on Linux
//!   ```bash
//!   apt install libdbus-1-dev pkg-config
//!   ```

#[cfg(feature = "bluez")]
mod bluez;
#[cfg(feature = "bluez")]
pub use bluez::BluezTransport;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::crypto::MESH_ADDRESS_LEN;
use crate::error::{PlejdError, Result};

/// Plejd mesh GATT service, also used as the advertisement filter
pub const PLEJD_SERVICE_UUID: Uuid = Uuid::from_u128(0x31ba0001_6085_4726_be45_040c957391b5);

/// Data characteristic (encrypted command writes)
pub const DATA_UUID: Uuid = Uuid::from_u128(0x31ba0004_6085_4726_be45_040c957391b5);

/// LastData characteristic (encrypted notifications)
pub const LAST_DATA_UUID: Uuid = Uuid::from_u128(0x31ba0005_6085_4726_be45_040c957391b5);

/// Auth characteristic (challenge-response handshake)
pub const AUTH_UUID: Uuid = Uuid::from_u128(0x31ba0009_6085_4726_be45_040c957391b5);

/// Ping characteristic (keepalive)
pub const PING_UUID: Uuid = Uuid::from_u128(0x31ba000a_6085_4726_be45_040c957391b5);

/// Stream of raw characteristic values
pub type NotificationStream = BoxStream<'static, Vec<u8>>;

/// Trait for BLE stacks that can reach a Plejd gateway
///
/// A transport holds at most one live link; `connect` replaces any previous
/// one. All characteristic operations address the link's bound
/// characteristics by role.
#[async_trait]
pub trait BleTransport: Send {
    /// Scan for peripherals advertising `service` for the given window
    async fn scan(&mut self, service: Uuid, window: Duration) -> Result<Vec<Candidate>>;

    /// Open a GATT connection to a candidate
    async fn connect(&mut self, candidate: &Candidate) -> Result<()>;

    /// Close the current link, if any
    async fn disconnect(&mut self) -> Result<()>;

    /// Enumerate the characteristics the linked peer exposes under `service`
    async fn discover_characteristics(&mut self, service: Uuid) -> Result<Vec<Uuid>>;

    /// Write a value to a characteristic
    async fn write(&mut self, characteristic: GattCharacteristic, data: &[u8]) -> Result<()>;

    /// Read a characteristic value
    async fn read(&mut self, characteristic: GattCharacteristic) -> Result<Vec<u8>>;

    /// Subscribe to value notifications of a characteristic
    async fn subscribe(&mut self, characteristic: GattCharacteristic) -> Result<NotificationStream>;

    /// Power the host adapter on or off
    async fn set_adapter_power(&mut self, powered: bool) -> Result<()>;

    /// Get the transport name (for logging)
    fn name(&self) -> &str;
}

/// The four characteristics a session binds on its gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GattCharacteristic {
    /// Encrypted command writes
    Data,
    /// Encrypted inbound notifications
    LastData,
    /// Authentication handshake
    Auth,
    /// Keepalive
    Ping,
}

impl GattCharacteristic {
    /// All characteristics a link needs
    pub const ALL: [GattCharacteristic; 4] = [
        GattCharacteristic::Data,
        GattCharacteristic::LastData,
        GattCharacteristic::Auth,
        GattCharacteristic::Ping,
    ];

    /// The characteristic's UUID
    pub fn uuid(&self) -> Uuid {
        match self {
            GattCharacteristic::Data => DATA_UUID,
            GattCharacteristic::LastData => LAST_DATA_UUID,
            GattCharacteristic::Auth => AUTH_UUID,
            GattCharacteristic::Ping => PING_UUID,
        }
    }

    /// Short name for logs and errors
    pub fn name(&self) -> &'static str {
        match self {
            GattCharacteristic::Data => "data",
            GattCharacteristic::LastData => "last_data",
            GattCharacteristic::Auth => "auth",
            GattCharacteristic::Ping => "ping",
        }
    }

    /// Check that every required characteristic is among `available`
    pub fn bind_all(available: &[Uuid]) -> Result<()> {
        for characteristic in Self::ALL {
            if !available.contains(&characteristic.uuid()) {
                return Err(PlejdError::MissingCharacteristic(characteristic.name()));
            }
        }
        Ok(())
    }
}

impl fmt::Display for GattCharacteristic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// BLE hardware address, most significant byte first (as printed)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BleAddress(pub [u8; MESH_ADDRESS_LEN]);

impl BleAddress {
    /// The reversed byte order the mesh cipher is keyed with
    pub fn mesh_address(&self) -> [u8; MESH_ADDRESS_LEN] {
        let mut reversed = self.0;
        reversed.reverse();
        reversed
    }
}

impl fmt::Display for BleAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

impl FromStr for BleAddress {
    type Err = PlejdError;

    /// Accepts `AA:BB:CC:DD:EE:FF` as well as the bare `AABBCCDDEEFF`
    /// form the cloud API reports device serials in.
    fn from_str(s: &str) -> Result<Self> {
        let hex_digits: String = s.chars().filter(|c| *c != ':' && *c != '-').collect();
        let bytes = hex::decode(&hex_digits)
            .map_err(|e| PlejdError::InvalidConfig(format!("bad BLE address {s:?}: {e}")))?;
        let bytes: [u8; MESH_ADDRESS_LEN] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| PlejdError::InvalidConfig(format!("bad BLE address {s:?}: wrong length")))?;
        Ok(Self(bytes))
    }
}

impl Serialize for BleAddress {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for BleAddress {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A gateway seen during discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// BLE hardware address
    pub address: BleAddress,
    /// Signal strength in dBm
    pub rssi: i16,
    /// Advertised name, if any
    pub name: Option<String>,
}

/// Order candidates strongest signal first
pub fn sort_by_signal(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| b.rssi.cmp(&a.rssi));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ble_address_parse_and_display() {
        let addr: BleAddress = "AA:BB:CC:DD:EE:01".parse().unwrap();
        assert_eq!(addr.0, [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0x01]);
        assert_eq!(addr.to_string(), "AA:BB:CC:DD:EE:01");

        let bare: BleAddress = "aabbccddee01".parse().unwrap();
        assert_eq!(bare, addr);

        assert!("AA:BB".parse::<BleAddress>().is_err());
    }

    #[test]
    fn test_mesh_address_is_reversed() {
        let addr = BleAddress([1, 2, 3, 4, 5, 6]);
        assert_eq!(addr.mesh_address(), [6, 5, 4, 3, 2, 1]);
    }

    #[test]
    fn test_sort_by_signal() {
        let mut candidates = vec![
            Candidate { address: BleAddress([1; 6]), rssi: -80, name: None },
            Candidate { address: BleAddress([2; 6]), rssi: -40, name: None },
            Candidate { address: BleAddress([3; 6]), rssi: -60, name: None },
        ];
        sort_by_signal(&mut candidates);
        let order: Vec<i16> = candidates.iter().map(|c| c.rssi).collect();
        assert_eq!(order, vec![-40, -60, -80]);
    }

    #[test]
    fn test_bind_all_reports_missing() {
        let available = vec![DATA_UUID, LAST_DATA_UUID, AUTH_UUID];
        assert!(matches!(
            GattCharacteristic::bind_all(&available),
            Err(PlejdError::MissingCharacteristic("ping"))
        ));

        let available = vec![PING_UUID, AUTH_UUID, LAST_DATA_UUID, DATA_UUID];
        assert!(GattCharacteristic::bind_all(&available).is_ok());
    }

    #[test]
    fn test_ble_address_serde() {
        let addr = BleAddress([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, "\"AA:BB:CC:DD:EE:FF\"");
        let back: BleAddress = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr);
    }
}
