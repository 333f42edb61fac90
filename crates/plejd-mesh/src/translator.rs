//! Event translation between mesh addresses and logical devices
//!
//! Inbound mesh events are resolved through the [`DeviceDirectory`], merged
//! into the cached device state and forwarded upward as [`BridgeEvent`]s
//! keyed by logical id.
//!
//! Plain switches never report their own changes over the mesh, so commands
//! for them are echoed upward as soon as they are accepted. Dimmable and
//! color devices get no echo; their state arrives from the mesh.

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::codec::MeshEvent;
use crate::directory::{DeviceDirectory, DeviceState, LogicalDevice};
use crate::error::{PlejdError, Result};
use crate::transport::BleAddress;

/// State fields carried by a state-changed event
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateUpdate {
    /// On or off
    pub on: bool,
    /// Dim level, when the mesh reported one
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub brightness: Option<u8>,
    /// Color temperature, when reported
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub color_temp: Option<u16>,
}

/// Logical events published by the bridge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BridgeEvent {
    /// The mesh link is up
    Connected {
        /// Gateway in use
        peer: BleAddress,
    },
    /// The mesh link is down and being re-established
    Reconnecting,
    /// A device changed state
    StateChanged {
        /// Logical device id
        unique_id: String,
        /// Reported fields
        state: StateUpdate,
    },
    /// A scene was triggered on the mesh
    SceneTriggered {
        /// Logical scene id
        scene_id: String,
    },
    /// A wireless button was pressed
    ButtonPressed {
        /// Logical id of the input device
        device_id: String,
        /// Button index
        input_index: u8,
    },
}

/// Translates mesh events using, and updating, the device directory
#[derive(Debug, Clone)]
pub struct EventTranslator {
    directory: DeviceDirectory,
}

impl EventTranslator {
    /// Create a translator over a directory
    pub fn new(directory: DeviceDirectory) -> Self {
        Self { directory }
    }

    /// The directory, with current cached states
    pub fn directory(&self) -> &DeviceDirectory {
        &self.directory
    }

    /// Look up a device by logical id
    pub fn device(&self, unique_id: &str) -> Option<&LogicalDevice> {
        self.directory.device(unique_id)
    }

    /// Translate an inbound mesh event.
    ///
    /// Returns `Ok(None)` for events with no upward counterpart and
    /// [`PlejdError::UnknownAddress`] when the address is not registered.
    pub fn translate(&mut self, event: &MeshEvent) -> Result<Option<BridgeEvent>> {
        match *event {
            MeshEvent::StateChanged { address, on } => {
                let unique_id = self.output_id(address)?;
                self.merge(&unique_id, |state| state.on = on);
                Ok(Some(BridgeEvent::StateChanged {
                    unique_id,
                    state: StateUpdate {
                        on,
                        ..Default::default()
                    },
                }))
            }
            MeshEvent::DimChanged {
                address,
                on,
                brightness,
            } => {
                let unique_id = self.output_id(address)?;
                self.merge(&unique_id, |state| {
                    state.on = on;
                    state.brightness = Some(brightness);
                });
                Ok(Some(BridgeEvent::StateChanged {
                    unique_id,
                    state: StateUpdate {
                        on,
                        brightness: Some(brightness),
                        color_temp: None,
                    },
                }))
            }
            MeshEvent::SceneTriggered { scene_address } => {
                let scene = self
                    .directory
                    .scene_by_address(scene_address)
                    .ok_or(PlejdError::UnknownAddress(scene_address))?;
                Ok(Some(BridgeEvent::SceneTriggered {
                    scene_id: scene.unique_id.clone(),
                }))
            }
            MeshEvent::ButtonClicked {
                input_address,
                button,
            } => {
                let input = self
                    .directory
                    .input(input_address, button)
                    .ok_or(PlejdError::UnknownAddress(input_address))?;
                Ok(Some(BridgeEvent::ButtonPressed {
                    device_id: input.unique_id.clone(),
                    input_index: button,
                }))
            }
            MeshEvent::TimeUpdated { .. } | MeshEvent::Unhandled { .. } => Ok(None),
        }
    }

    /// Echo a command for a plain switch before the mesh write.
    ///
    /// Returns `None` for dimmable or color devices.
    pub fn optimistic_echo(&mut self, unique_id: &str, on: bool) -> Option<BridgeEvent> {
        let device = self.directory.device(unique_id)?;
        if device.dimmable || device.supports_color_temp {
            return None;
        }

        self.merge(unique_id, |state| state.on = on);
        trace!(device = unique_id, on, "Optimistic echo");
        Some(BridgeEvent::StateChanged {
            unique_id: unique_id.to_string(),
            state: StateUpdate {
                on,
                ..Default::default()
            },
        })
    }

    fn output_id(&self, address: u8) -> Result<String> {
        self.directory
            .by_output_address(address)
            .map(|device| device.unique_id.clone())
            .ok_or(PlejdError::UnknownAddress(address))
    }

    fn merge(&mut self, unique_id: &str, merge: impl FnOnce(&mut DeviceState)) {
        self.directory.update_state(unique_id, merge);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{MeshFrame, Opcode};
    use crate::test_utils::test_directory;

    fn translator() -> EventTranslator {
        EventTranslator::new(test_directory())
    }

    #[test]
    fn test_state_change_has_no_brightness() {
        let mut translator = translator();
        let frame = MeshFrame::decode(&hex::decode("050102009701").unwrap()).unwrap();
        let event = translator
            .translate(&MeshEvent::from_frame(&frame))
            .unwrap()
            .unwrap();

        assert_eq!(
            event,
            BridgeEvent::StateChanged {
                unique_id: "light-kitchen".into(),
                state: StateUpdate {
                    on: true,
                    brightness: None,
                    color_temp: None
                }
            }
        );
        assert!(translator.device("light-kitchen").unwrap().state.on);
    }

    #[test]
    fn test_dim_change_merges_state() {
        let mut translator = translator();
        translator
            .translate(&MeshEvent::DimChanged {
                address: 5,
                on: true,
                brightness: 0x80,
            })
            .unwrap();
        translator
            .translate(&MeshEvent::StateChanged {
                address: 5,
                on: false,
            })
            .unwrap();

        let state = translator.device("light-kitchen").unwrap().state;
        assert!(!state.on);
        // A bare on/off report keeps the last dim level
        assert_eq!(state.brightness, Some(0x80));
    }

    #[test]
    fn test_scene_and_button() {
        let mut translator = translator();
        assert_eq!(
            translator
                .translate(&MeshEvent::SceneTriggered { scene_address: 3 })
                .unwrap(),
            Some(BridgeEvent::SceneTriggered {
                scene_id: "scene-evening".into()
            })
        );
        assert_eq!(
            translator
                .translate(&MeshEvent::ButtonClicked {
                    input_address: 0x20,
                    button: 1
                })
                .unwrap(),
            Some(BridgeEvent::ButtonPressed {
                device_id: "remote-hall".into(),
                input_index: 1
            })
        );
    }

    #[test]
    fn test_unknown_addresses() {
        let mut translator = translator();
        assert!(matches!(
            translator.translate(&MeshEvent::StateChanged {
                address: 250,
                on: true
            }),
            Err(PlejdError::UnknownAddress(250))
        ));
        assert!(matches!(
            translator.translate(&MeshEvent::SceneTriggered { scene_address: 77 }),
            Err(PlejdError::UnknownAddress(77))
        ));
        assert_eq!(
            translator
                .translate(&MeshEvent::Unhandled {
                    address: 5,
                    opcode: Opcode::Unknown(0x1234)
                })
                .unwrap(),
            None
        );
    }

    #[test]
    fn test_optimistic_echo_only_for_switches() {
        let mut translator = translator();
        assert_eq!(
            translator.optimistic_echo("switch-porch", false),
            Some(BridgeEvent::StateChanged {
                unique_id: "switch-porch".into(),
                state: StateUpdate::default()
            })
        );
        assert!(translator.optimistic_echo("light-kitchen", true).is_none());
        assert!(translator.optimistic_echo("light-living", true).is_none());
        assert!(translator.optimistic_echo("nope", true).is_none());
    }

    #[test]
    fn test_event_json_shape() {
        let event = BridgeEvent::StateChanged {
            unique_id: "light-kitchen".into(),
            state: StateUpdate {
                on: true,
                brightness: None,
                color_temp: None,
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "state_changed");
        assert_eq!(json["state"], serde_json::json!({ "on": true }));
    }
}
