//! MQTT topics, Home Assistant payloads and command parsing

use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

use plejd_mesh::{BridgeEvent, LogicalDevice, StateUpdate, TurnOnOptions};

use super::MqttConfig;

/// Availability payloads
pub const PAYLOAD_ONLINE: &str = "online";
pub const PAYLOAD_OFFLINE: &str = "offline";

/// Color temperature range of Plejd tunable-white outputs, in Kelvin
const MIN_KELVIN: u32 = 2200;
const MAX_KELVIN: u32 = 4000;

/// Home Assistant entity component
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Light,
    Switch,
    Scene,
}

impl Component {
    pub fn for_device(device: &LogicalDevice) -> Self {
        if device.dimmable || device.supports_color_temp {
            Component::Light
        } else {
            Component::Switch
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Component::Light => "light",
            Component::Switch => "switch",
            Component::Scene => "scene",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "light" => Some(Component::Light),
            "switch" => Some(Component::Switch),
            "scene" => Some(Component::Scene),
            _ => None,
        }
    }
}

/// A message ready to hand to the MQTT client
#[derive(Debug, Clone, PartialEq)]
pub struct Outgoing {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

impl Outgoing {
    fn new(topic: String, payload: impl Into<Vec<u8>>, retain: bool) -> Self {
        Self {
            topic,
            payload: payload.into(),
            retain,
        }
    }
}

/// A command received on a `set` topic
#[derive(Debug, Clone, PartialEq)]
pub enum MqttCommand {
    TurnOn {
        unique_id: String,
        options: TurnOnOptions,
    },
    TurnOff {
        unique_id: String,
        transition: Option<Duration>,
    },
    TriggerScene {
        scene_id: String,
    },
}

/// Topic layout derived from the MQTT config
#[derive(Debug, Clone)]
pub struct Topics {
    discovery_prefix: String,
    base_topic: String,
}

impl Topics {
    pub fn new(config: &MqttConfig) -> Self {
        Self {
            discovery_prefix: config.discovery_prefix.trim_end_matches('/').to_string(),
            base_topic: config.base_topic.trim_end_matches('/').to_string(),
        }
    }

    pub fn availability(&self) -> String {
        format!("{}/availability", self.base_topic)
    }

    pub fn config(&self, component: Component, unique_id: &str) -> String {
        self.entity(component, unique_id, "config")
    }

    pub fn state(&self, component: Component, unique_id: &str) -> String {
        self.entity(component, unique_id, "state")
    }

    pub fn set(&self, component: Component, unique_id: &str) -> String {
        self.entity(component, unique_id, "set")
    }

    /// Wildcard subscriptions for every command topic
    pub fn command_filters(&self) -> Vec<String> {
        [Component::Light, Component::Switch, Component::Scene]
            .iter()
            .map(|component| self.set(*component, "+"))
            .collect()
    }

    pub fn scene_triggered(&self, scene_id: &str) -> String {
        format!("{}/scene/{}/triggered", self.base_topic, scene_id)
    }

    pub fn button(&self, device_id: &str, index: u8) -> String {
        format!("{}/button/{}/{}", self.base_topic, device_id, index)
    }

    fn entity(&self, component: Component, unique_id: &str, leaf: &str) -> String {
        format!(
            "{}/{}/{}/{}",
            self.discovery_prefix,
            component.as_str(),
            unique_id,
            leaf
        )
    }

    /// Split `<discovery>/<component>/<id>/set` into its parts
    fn parse_set<'a>(&self, topic: &'a str) -> Option<(Component, &'a str)> {
        let rest = topic
            .strip_prefix(self.discovery_prefix.as_str())?
            .strip_prefix('/')?;
        let mut parts = rest.split('/');
        let component = Component::parse(parts.next()?)?;
        let unique_id = parts.next().filter(|id| !id.is_empty())?;
        match (parts.next(), parts.next()) {
            (Some("set"), None) => Some((component, unique_id)),
            _ => None,
        }
    }

    /// Retained discovery config for an output
    pub fn device_discovery(&self, device: &LogicalDevice) -> Outgoing {
        let component = Component::for_device(device);
        let mut config = json!({
            "name": device.name,
            "unique_id": device.unique_id,
            "object_id": device.unique_id,
            "command_topic": self.set(component, &device.unique_id),
            "state_topic": self.state(component, &device.unique_id),
            "availability_topic": self.availability(),
            "payload_available": PAYLOAD_ONLINE,
            "payload_not_available": PAYLOAD_OFFLINE,
            "optimistic": false,
            "device": {
                "identifiers": [device.unique_id],
                "name": device.name,
                "manufacturer": "Plejd",
            },
        });

        if component == Component::Light {
            let modes = if device.supports_color_temp {
                json!(["color_temp"])
            } else {
                json!(["brightness"])
            };
            if let Value::Object(map) = &mut config {
                map.insert("schema".into(), json!("json"));
                map.insert("brightness".into(), json!(device.dimmable));
                map.insert("supported_color_modes".into(), modes);
                if device.supports_color_temp {
                    map.insert("min_mireds".into(), json!(kelvin_to_mireds(MAX_KELVIN)));
                    map.insert("max_mireds".into(), json!(kelvin_to_mireds(MIN_KELVIN)));
                }
            }
        }

        Outgoing::new(
            self.config(component, &device.unique_id),
            config.to_string(),
            true,
        )
    }

    /// Retained discovery config for a scene
    pub fn scene_discovery(&self, unique_id: &str, name: &str) -> Outgoing {
        let config = json!({
            "name": name,
            "unique_id": unique_id,
            "command_topic": self.set(Component::Scene, unique_id),
            "availability_topic": self.availability(),
            "payload_on": "ON",
        });
        Outgoing::new(
            self.config(Component::Scene, unique_id),
            config.to_string(),
            true,
        )
    }

    pub fn availability_message(&self, online: bool) -> Outgoing {
        let payload = if online { PAYLOAD_ONLINE } else { PAYLOAD_OFFLINE };
        Outgoing::new(self.availability(), payload, true)
    }

    /// Messages for a bridge event. `component` resolves a device id to its
    /// entity type.
    pub fn event_messages(
        &self,
        event: &BridgeEvent,
        component: impl Fn(&str) -> Option<Component>,
    ) -> Vec<Outgoing> {
        match event {
            BridgeEvent::Connected { .. } => vec![self.availability_message(true)],
            BridgeEvent::Reconnecting => vec![self.availability_message(false)],
            BridgeEvent::StateChanged { unique_id, state } => match component(unique_id) {
                Some(Component::Light) => vec![Outgoing::new(
                    self.state(Component::Light, unique_id),
                    light_state(state).to_string(),
                    true,
                )],
                Some(Component::Switch) => vec![Outgoing::new(
                    self.state(Component::Switch, unique_id),
                    on_off(state.on),
                    true,
                )],
                _ => Vec::new(),
            },
            BridgeEvent::SceneTriggered { scene_id } => vec![Outgoing::new(
                self.scene_triggered(scene_id),
                "triggered",
                false,
            )],
            BridgeEvent::ButtonPressed {
                device_id,
                input_index,
            } => vec![Outgoing::new(
                self.button(device_id, *input_index),
                "pressed",
                false,
            )],
        }
    }

    /// Parse a message received on a command topic
    pub fn parse_command(&self, topic: &str, payload: &[u8]) -> Option<MqttCommand> {
        let (component, unique_id) = self.parse_set(topic)?;
        let unique_id = unique_id.to_string();

        if component == Component::Scene {
            return Some(MqttCommand::TriggerScene {
                scene_id: unique_id,
            });
        }

        let text = std::str::from_utf8(payload).ok()?.trim();
        if text.eq_ignore_ascii_case("ON") {
            return Some(MqttCommand::TurnOn {
                unique_id,
                options: TurnOnOptions::default(),
            });
        }
        if text.eq_ignore_ascii_case("OFF") {
            return Some(MqttCommand::TurnOff {
                unique_id,
                transition: None,
            });
        }

        let set: SetPayload = serde_json::from_str(text).ok()?;
        let transition = set
            .transition
            .filter(|secs| *secs > 0.0)
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok());

        if set.state.eq_ignore_ascii_case("OFF") {
            return Some(MqttCommand::TurnOff {
                unique_id,
                transition,
            });
        }
        Some(MqttCommand::TurnOn {
            unique_id,
            options: TurnOnOptions {
                brightness: set.brightness,
                color_temp: set.color_temp.and_then(mireds_to_kelvin),
                transition,
            },
        })
    }
}

/// Home Assistant JSON-schema command
#[derive(Debug, Deserialize)]
struct SetPayload {
    #[serde(default = "default_state")]
    state: String,
    brightness: Option<i32>,
    color_temp: Option<u32>,
    transition: Option<f64>,
}

fn default_state() -> String {
    "ON".to_string()
}

fn on_off(on: bool) -> &'static str {
    if on {
        "ON"
    } else {
        "OFF"
    }
}

fn light_state(state: &StateUpdate) -> Value {
    let mut value = json!({ "state": on_off(state.on) });
    if let Value::Object(map) = &mut value {
        if let Some(brightness) = state.brightness {
            map.insert("brightness".into(), json!(brightness));
        }
        if let Some(kelvin) = state.color_temp {
            map.insert("color_mode".into(), json!("color_temp"));
            map.insert(
                "color_temp".into(),
                json!(kelvin_to_mireds(u32::from(kelvin))),
            );
        }
    }
    value
}

fn kelvin_to_mireds(kelvin: u32) -> u32 {
    1_000_000 / kelvin.max(1)
}

fn mireds_to_kelvin(mireds: u32) -> Option<u16> {
    if mireds == 0 {
        return None;
    }
    let kelvin = (1_000_000 / mireds).clamp(MIN_KELVIN, MAX_KELVIN);
    u16::try_from(kelvin).ok()
}
