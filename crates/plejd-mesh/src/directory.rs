//! Device directory
//!
//! Resolves protocol addresses to stable logical identities. The directory
//! is built once from a [`SiteSnapshot`] (the resolved view of a site's
//! cloud description) and is read-only afterwards, except for the cached
//! [`DeviceState`] of each output, which only the event translator writes.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::{debug, warn};

use crate::crypto::MeshKey;
use crate::error::{PlejdError, Result};
use crate::transport::BleAddress;

/// Kind of a logical device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    /// Dimmable or color-capable load
    Light,
    /// Plain relay
    Switch,
    /// Stored scene
    Scene,
    /// Wireless button
    InputButton,
}

/// Output entry in a site snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputEntry {
    /// Stable logical id
    pub unique_id: String,
    /// Display name
    pub name: String,
    /// Mesh output address
    pub output_address: u8,
    /// Device kind
    pub kind: DeviceKind,
    /// Accepts dim levels
    #[serde(default)]
    pub dimmable: bool,
    /// Accepts color temperature
    #[serde(default)]
    pub supports_color_temp: bool,
}

/// Input (button) entry in a site snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputEntry {
    /// Stable logical id of the input device
    pub unique_id: String,
    /// Display name
    pub name: String,
    /// Mesh input address
    pub input_address: u8,
    /// Button index on the device
    pub button_index: u8,
}

/// Scene entry in a site snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SceneEntry {
    /// Stable logical id
    pub unique_id: String,
    /// Display name
    pub name: String,
    /// Mesh scene address
    pub scene_address: u8,
}

/// Gateway-capable device in a site snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayEntry {
    /// BLE hardware address
    pub ble_address: BleAddress,
    /// The device's own mesh address
    pub output_address: u8,
}

/// Resolved view of one site
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteSnapshot {
    /// Site mesh key, hex encoded
    #[serde(default)]
    pub mesh_key: Option<String>,
    /// Controllable outputs
    #[serde(default)]
    pub outputs: Vec<OutputEntry>,
    /// Buttons
    #[serde(default)]
    pub inputs: Vec<InputEntry>,
    /// Scenes
    #[serde(default)]
    pub scenes: Vec<SceneEntry>,
    /// Devices a session may connect through
    #[serde(default)]
    pub gateways: Vec<GatewayEntry>,
}

impl SiteSnapshot {
    /// Load a snapshot from a cached site JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// The site's mesh key
    pub fn mesh_key(&self) -> Result<MeshKey> {
        self.mesh_key
            .as_deref()
            .ok_or_else(|| PlejdError::MissingConfig("site snapshot has no mesh key".into()))
            .and_then(MeshKey::from_hex)
    }
}

/// Last known state of an output
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceState {
    /// On or off
    pub on: bool,
    /// Dim level, when known
    pub brightness: Option<u8>,
    /// Color temperature in Kelvin, when known
    pub color_temp: Option<u16>,
}

/// A controllable output or scene with its cached state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalDevice {
    /// Stable logical id
    pub unique_id: String,
    /// Display name
    pub name: String,
    /// Device kind
    pub kind: DeviceKind,
    /// Mesh output address
    pub output_address: u8,
    /// Accepts dim levels
    pub dimmable: bool,
    /// Accepts color temperature
    pub supports_color_temp: bool,
    /// Last confirmed state
    pub state: DeviceState,
}

impl LogicalDevice {
    /// Brightness a transition may start from: only known while the device is on
    pub fn ramp_origin(&self) -> Option<u8> {
        if self.state.on {
            self.state.brightness
        } else {
            None
        }
    }
}

/// A button resolved from an input address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputButton {
    /// Logical id of the input device
    pub unique_id: String,
    /// Display name
    pub name: String,
    /// Button index
    pub button_index: u8,
}

/// A scene resolved from a scene address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scene {
    /// Logical id
    pub unique_id: String,
    /// Display name
    pub name: String,
    /// Scene address
    pub scene_address: u8,
}

/// Address ↔ identity lookups for one site
#[derive(Debug, Clone, Default)]
pub struct DeviceDirectory {
    devices: BTreeMap<String, LogicalDevice>,
    by_output: HashMap<u8, String>,
    inputs: HashMap<(u8, u8), InputButton>,
    scenes: HashMap<u8, Scene>,
    scene_ids: HashMap<String, u8>,
    gateways: HashMap<BleAddress, u8>,
}

impl DeviceDirectory {
    /// Build the directory from a snapshot
    pub fn from_snapshot(snapshot: &SiteSnapshot) -> Result<Self> {
        let mut directory = Self::default();

        for output in &snapshot.outputs {
            if directory.devices.contains_key(&output.unique_id) {
                return Err(PlejdError::InvalidConfig(format!(
                    "duplicate device id {}",
                    output.unique_id
                )));
            }

            match directory.by_output.get(&output.output_address) {
                Some(existing) => warn!(
                    address = output.output_address,
                    kept = %existing,
                    ignored = %output.unique_id,
                    "Duplicate output address"
                ),
                None => {
                    directory
                        .by_output
                        .insert(output.output_address, output.unique_id.clone());
                }
            }

            directory.devices.insert(
                output.unique_id.clone(),
                LogicalDevice {
                    unique_id: output.unique_id.clone(),
                    name: output.name.clone(),
                    kind: output.kind,
                    output_address: output.output_address,
                    dimmable: output.dimmable,
                    supports_color_temp: output.supports_color_temp,
                    state: DeviceState::default(),
                },
            );
        }

        for input in &snapshot.inputs {
            directory.inputs.insert(
                (input.input_address, input.button_index),
                InputButton {
                    unique_id: input.unique_id.clone(),
                    name: input.name.clone(),
                    button_index: input.button_index,
                },
            );
        }

        for scene in &snapshot.scenes {
            if directory.devices.contains_key(&scene.unique_id)
                || directory.scene_ids.contains_key(&scene.unique_id)
            {
                return Err(PlejdError::InvalidConfig(format!(
                    "duplicate scene id {}",
                    scene.unique_id
                )));
            }
            directory
                .scene_ids
                .insert(scene.unique_id.clone(), scene.scene_address);
            directory.scenes.insert(
                scene.scene_address,
                Scene {
                    unique_id: scene.unique_id.clone(),
                    name: scene.name.clone(),
                    scene_address: scene.scene_address,
                },
            );
        }

        for gateway in &snapshot.gateways {
            directory
                .gateways
                .insert(gateway.ble_address, gateway.output_address);
        }

        debug!(
            outputs = directory.devices.len(),
            inputs = directory.inputs.len(),
            scenes = directory.scenes.len(),
            gateways = directory.gateways.len(),
            "Device directory built"
        );
        Ok(directory)
    }

    /// Look up a device by logical id
    pub fn device(&self, unique_id: &str) -> Option<&LogicalDevice> {
        self.devices.get(unique_id)
    }

    /// Look up a device by output address
    pub fn by_output_address(&self, address: u8) -> Option<&LogicalDevice> {
        self.by_output
            .get(&address)
            .and_then(|id| self.devices.get(id))
    }

    /// Look up a button by input address and button index
    pub fn input(&self, input_address: u8, button: u8) -> Option<&InputButton> {
        self.inputs.get(&(input_address, button))
    }

    /// Look up a scene by its address
    pub fn scene_by_address(&self, scene_address: u8) -> Option<&Scene> {
        self.scenes.get(&scene_address)
    }

    /// Scene address for a scene id
    pub fn scene_address(&self, scene_id: &str) -> Option<u8> {
        self.scene_ids.get(scene_id).copied()
    }

    /// Mesh address of a gateway, by BLE address
    pub fn gateway_address(&self, ble_address: &BleAddress) -> Option<u8> {
        self.gateways.get(ble_address).copied()
    }

    /// Gateway table, for the session's clock sync
    pub fn gateways(&self) -> HashMap<BleAddress, u8> {
        self.gateways.clone()
    }

    /// All outputs, ordered by id
    pub fn devices(&self) -> impl Iterator<Item = &LogicalDevice> {
        self.devices.values()
    }

    /// All scenes
    pub fn scenes(&self) -> impl Iterator<Item = &Scene> {
        self.scenes.values()
    }

    /// Replace the cached state of a device, returning the merged state
    pub(crate) fn update_state(
        &mut self,
        unique_id: &str,
        merge: impl FnOnce(&mut DeviceState),
    ) -> Option<DeviceState> {
        let device = self.devices.get_mut(unique_id)?;
        merge(&mut device.state);
        Some(device.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{test_directory, test_snapshot};

    #[test]
    fn test_lookups() {
        let directory = test_directory();

        let light = directory.by_output_address(5).unwrap();
        assert_eq!(light.unique_id, "light-kitchen");
        assert!(light.dimmable);

        assert_eq!(directory.device("switch-porch").unwrap().output_address, 7);
        assert!(directory.by_output_address(99).is_none());

        assert_eq!(directory.input(0x20, 1).unwrap().unique_id, "remote-hall");
        assert!(directory.input(0x20, 9).is_none());

        assert_eq!(directory.scene_address("scene-evening"), Some(3));
        assert_eq!(
            directory.scene_by_address(3).unwrap().unique_id,
            "scene-evening"
        );
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let mut snapshot = test_snapshot();
        let mut dup = snapshot.outputs[0].clone();
        dup.output_address = 200;
        snapshot.outputs.push(dup);

        assert!(matches!(
            DeviceDirectory::from_snapshot(&snapshot),
            Err(PlejdError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_duplicate_address_keeps_first() {
        let mut snapshot = test_snapshot();
        let mut dup = snapshot.outputs[0].clone();
        dup.unique_id = "light-shadow".into();
        snapshot.outputs.push(dup);

        let directory = DeviceDirectory::from_snapshot(&snapshot).unwrap();
        assert_eq!(
            directory.by_output_address(5).unwrap().unique_id,
            "light-kitchen"
        );
        assert!(directory.device("light-shadow").is_some());
    }

    #[test]
    fn test_snapshot_json_and_key() {
        let json = r#"{
            "mesh_key": "000102030405060708090a0b0c0d0e0f",
            "outputs": [
                { "unique_id": "a", "name": "A", "output_address": 11, "kind": "light", "dimmable": true }
            ],
            "gateways": [ { "ble_address": "AA:BB:CC:DD:EE:01", "output_address": 11 } ]
        }"#;
        let snapshot: SiteSnapshot = serde_json::from_str(json).unwrap();
        assert!(snapshot.mesh_key().is_ok());

        let directory = DeviceDirectory::from_snapshot(&snapshot).unwrap();
        let gateway: BleAddress = "AA:BB:CC:DD:EE:01".parse().unwrap();
        assert_eq!(directory.gateway_address(&gateway), Some(11));
        assert!(!directory.device("a").unwrap().supports_color_temp);

        let keyless = SiteSnapshot::default();
        assert!(matches!(
            keyless.mesh_key(),
            Err(PlejdError::MissingConfig(_))
        ));
    }

    #[test]
    fn test_ramp_origin_requires_on() {
        let mut directory = test_directory();
        directory.update_state("light-kitchen", |s| {
            s.on = false;
            s.brightness = Some(80);
        });
        assert_eq!(directory.device("light-kitchen").unwrap().ramp_origin(), None);

        directory.update_state("light-kitchen", |s| s.on = true);
        assert_eq!(
            directory.device("light-kitchen").unwrap().ramp_origin(),
            Some(80)
        );
    }
}
