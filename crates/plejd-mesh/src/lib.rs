//! Plejd BLE mesh bridge
//!
//! This crate talks to a Plejd lighting mesh through one BLE gateway and
//! exposes it as logical devices: commands go in by device id, state
//! changes, scene triggers and button presses come out as typed events.
//!
//! # Architecture
//!
//! The bridge operates in four layers:
//!
//! 1. **Transport** - [`BleTransport`] over BlueZ, or an in-memory fake
//! 2. **Mesh session** - discovery, authentication, keepalive, reconnect
//!    and the encrypted frame codec
//! 3. **Command scheduler** - write queue with latest-wins coalescing,
//!    retries and brightness transitions
//! 4. **Event translation** - address ↔ logical id via the device directory
//!
//! # Quick Start
//!
//! ```rust,ignore
//! // Enable the `bluez` feature to use BluezTransport
//! // Cargo.toml: plejd-mesh = { version = "0.1", features = ["bluez"] }
//!
//! use plejd_mesh::{start, BluezTransport, DeviceDirectory, PlejdConfig, SiteSnapshot};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let snapshot = SiteSnapshot::load("site.json".as_ref())?;
//!     let directory = DeviceDirectory::from_snapshot(&snapshot)?;
//!     let transport = BluezTransport::new(None).await?;
//!
//!     let bridge = start(transport, directory, snapshot.mesh_key()?, &PlejdConfig::default());
//!     let mut events = bridge.subscribe();
//!
//!     bridge.turn_off("light-kitchen", None).await?;
//!     while let Ok(event) = events.recv().await {
//!         println!("{event:?}");
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Features
//!
//! - `bluez` - BlueZ transport over D-Bus (requires `libdbus-1-dev` on Linux)
//!
//! # Message Flow
//!
//! ## Mesh → events
//!
//! 1. The gateway notifies an encrypted frame on LastData
//! 2. The session decrypts and decodes it into a [`MeshEvent`]
//! 3. The translator resolves the address and merges the device state
//! 4. The bridge broadcasts a [`BridgeEvent`]
//!
//! ## Commands → mesh
//!
//! 1. [`BridgeHandle`] sends a logical command to the bridge task
//! 2. The scheduler queues it (or starts a transition)
//! 3. The drain pass resolves the address and builds a [`MeshFrame`]
//! 4. The session encrypts it and writes it to Data

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// Protocol
pub mod codec;
pub mod crypto;
pub mod transport;

// Core modules
pub mod config;
pub mod directory;
pub mod error;

// Session and scheduling
pub mod scheduler;
pub mod session;
pub mod translator;

// Bridge
pub mod bridge;

// Testing utilities
pub mod test_utils;

pub use bridge::{start, BridgeCommand, BridgeHandle, BridgeStats, PlejdBridge};
pub use codec::{MeshEvent, MeshFrame, Opcode, RequestKind};
pub use config::{PlejdConfig, PlejdConfigBuilder, SchedulerConfig, SessionConfig};
pub use crypto::{challenge_response, encrypt_decrypt, MeshKey};
pub use directory::{DeviceDirectory, DeviceKind, DeviceState, LogicalDevice, SiteSnapshot};
pub use error::{PlejdError, Result};
pub use scheduler::{CommandScheduler, MeshCommand, TurnOnOptions};
pub use session::{MeshSession, SessionEvent, SessionHandle, SessionState, SessionStats};
pub use translator::{BridgeEvent, EventTranslator, StateUpdate};
pub use transport::{BleAddress, BleTransport, Candidate, GattCharacteristic};

#[cfg(feature = "bluez")]
pub use transport::BluezTransport;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
