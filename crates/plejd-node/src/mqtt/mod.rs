//! MQTT adapter
//!
//! Publishes Home Assistant discovery, availability and state for the mesh,
//! and forwards commands from `set` topics to the bridge.

pub mod messages;

use anyhow::Context;
use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Packet, QoS};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use plejd_mesh::{BridgeEvent, BridgeHandle, DeviceDirectory};

use messages::{Component, MqttCommand, Outgoing, Topics, PAYLOAD_OFFLINE};

/// Broker connection and topic settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Home Assistant discovery prefix
    pub discovery_prefix: String,
    /// Prefix for availability, scene and button topics
    pub base_topic: String,
    pub keep_alive_secs: u64,
    /// Wait before polling again after a broker error
    pub retry_delay_secs: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "plejd-mesh".to_string(),
            username: None,
            password: None,
            discovery_prefix: "homeassistant".to_string(),
            base_topic: "plejd".to_string(),
            keep_alive_secs: 30,
            retry_delay_secs: 5,
        }
    }
}

/// Glue between the bridge and an MQTT broker
pub struct MqttAdapter {
    config: MqttConfig,
    topics: Topics,
    bridge: BridgeHandle,
    components: HashMap<String, Component>,
    discovery: Vec<Outgoing>,
    link_online: bool,
}

impl MqttAdapter {
    pub fn new(config: MqttConfig, directory: &DeviceDirectory, bridge: BridgeHandle) -> Self {
        let topics = Topics::new(&config);

        let mut components = HashMap::new();
        let mut discovery = Vec::new();
        for device in directory.devices() {
            components.insert(device.unique_id.clone(), Component::for_device(device));
            discovery.push(topics.device_discovery(device));
        }
        for scene in directory.scenes() {
            components.insert(scene.unique_id.clone(), Component::Scene);
            discovery.push(topics.scene_discovery(&scene.unique_id, &scene.name));
        }

        Self {
            config,
            topics,
            bridge,
            components,
            discovery,
            link_online: false,
        }
    }

    fn connect(&self) -> (AsyncClient, EventLoop) {
        let mut options =
            MqttOptions::new(&self.config.client_id, &self.config.host, self.config.port);
        options.set_keep_alive(Duration::from_secs(self.config.keep_alive_secs.max(5)));
        if let Some(user) = &self.config.username {
            options.set_credentials(user, self.config.password.clone().unwrap_or_default());
        }
        options.set_last_will(LastWill::new(
            self.topics.availability(),
            PAYLOAD_OFFLINE,
            QoS::AtLeastOnce,
            true,
        ));

        // Room for the whole discovery burst
        AsyncClient::new(options, self.discovery.len() + 64)
    }

    /// Run until the bridge stops
    pub async fn run(mut self) -> anyhow::Result<()> {
        let (client, mut eventloop) = self.connect();
        let mut events = self.bridge.subscribe();
        let retry_delay = Duration::from_secs(self.config.retry_delay_secs);

        info!(
            host = %self.config.host,
            port = self.config.port,
            entities = self.discovery.len(),
            "Starting MQTT adapter"
        );

        loop {
            tokio::select! {
                notification = eventloop.poll() => match notification {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("Connected to MQTT broker");
                        self.on_broker_connected(&client)?;
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        self.handle_publish(&publish.topic, &publish.payload).await;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "MQTT connection error, retrying");
                        tokio::time::sleep(retry_delay).await;
                    }
                },

                event = events.recv() => match event {
                    Ok(event) => self.publish_event(&client, &event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "MQTT adapter lagging behind bridge events");
                    }
                    Err(RecvError::Closed) => {
                        info!("Bridge stopped, closing MQTT adapter");
                        break;
                    }
                },
            }
        }

        let _ = client.try_publish(
            self.topics.availability(),
            QoS::AtLeastOnce,
            true,
            PAYLOAD_OFFLINE,
        );
        let _ = client.try_disconnect();
        Ok(())
    }

    /// (Re)subscribe and republish retained discovery and availability
    fn on_broker_connected(&self, client: &AsyncClient) -> anyhow::Result<()> {
        for filter in self.topics.command_filters() {
            client
                .try_subscribe(&filter, QoS::AtLeastOnce)
                .with_context(|| format!("failed to subscribe to {filter}"))?;
        }
        for message in &self.discovery {
            send(client, message);
        }
        send(client, &self.topics.availability_message(self.link_online));
        Ok(())
    }

    fn publish_event(&mut self, client: &AsyncClient, event: &BridgeEvent) {
        match event {
            BridgeEvent::Connected { .. } => self.link_online = true,
            BridgeEvent::Reconnecting => self.link_online = false,
            _ => {}
        }

        let components = &self.components;
        for message in self
            .topics
            .event_messages(event, |id| components.get(id).copied())
        {
            send(client, &message);
        }
    }

    async fn handle_publish(&self, topic: &str, payload: &[u8]) {
        let Some(command) = self.topics.parse_command(topic, payload) else {
            debug!(topic, "Ignoring unparsable MQTT command");
            return;
        };
        debug!(?command, "MQTT command");

        let result = match command {
            MqttCommand::TurnOn { unique_id, options } => {
                self.bridge.turn_on(&unique_id, options).await
            }
            MqttCommand::TurnOff {
                unique_id,
                transition,
            } => self.bridge.turn_off(&unique_id, transition).await,
            MqttCommand::TriggerScene { scene_id } => self.bridge.trigger_scene(&scene_id).await,
        };
        if let Err(e) = result {
            warn!(topic, error = %e, "Command rejected");
        }
    }
}

fn send(client: &AsyncClient, message: &Outgoing) {
    if let Err(e) = client.try_publish(
        message.topic.as_str(),
        QoS::AtLeastOnce,
        message.retain,
        message.payload.clone(),
    ) {
        warn!(topic = %message.topic, error = %e, "MQTT publish failed");
    }
}
