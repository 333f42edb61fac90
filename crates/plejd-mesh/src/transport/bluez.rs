//! BlueZ transport for Plejd gateways
//!
//! Talks to the host Bluetooth stack through `bluer` (D-Bus). Discovery
//! is an LE scan filtered on the Plejd service UUID; the GATT tree of the
//! chosen peer is walked once per connection and the characteristics under
//! the Plejd service are cached by UUID.
//!
//! # Requirements
//!
//! Enable the `bluez` feature in Cargo.toml to use this transport.
//!
//! On Linux, you'll also need:
//! ```bash
//! apt install libdbus-1-dev
//! ```

use async_trait::async_trait;
use bluer::gatt::remote::Characteristic;
use bluer::{Adapter, AdapterEvent, Address, Device, DiscoveryFilter, DiscoveryTransport};
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::{BleAddress, BleTransport, Candidate, GattCharacteristic, NotificationStream};
use crate::error::{PlejdError, Result};

/// BlueZ-backed transport
pub struct BluezTransport {
    adapter: Adapter,
    device: Option<Device>,
    characteristics: HashMap<Uuid, Characteristic>,
    name: String,
}

impl BluezTransport {
    /// Open the named adapter, or the default one
    ///
    /// Fails with [`PlejdError::NoAdapter`] when the host has no usable
    /// Bluetooth adapter.
    pub async fn new(adapter_name: Option<&str>) -> Result<Self> {
        let session = bluer::Session::new()
            .await
            .map_err(|e| PlejdError::NoAdapter(format!("BlueZ session unavailable: {e}")))?;

        let adapter = match adapter_name {
            Some(name) => session.adapter(name),
            None => session.default_adapter().await,
        }
        .map_err(|e| PlejdError::NoAdapter(e.to_string()))?;

        adapter
            .set_powered(true)
            .await
            .map_err(|e| PlejdError::NoAdapter(format!("cannot power {}: {e}", adapter.name())))?;

        let name = format!("bluez:{}", adapter.name());
        info!(adapter = %adapter.name(), "Using Bluetooth adapter");

        Ok(Self {
            adapter,
            device: None,
            characteristics: HashMap::new(),
            name,
        })
    }

    fn characteristic(&self, role: GattCharacteristic) -> Result<&Characteristic> {
        self.characteristics
            .get(&role.uuid())
            .ok_or(PlejdError::MissingCharacteristic(role.name()))
    }

    async fn describe(&self, address: Address, service: Uuid) -> Result<Option<Candidate>> {
        let device = self.adapter.device(address)?;
        let uuids = device.uuids().await?.unwrap_or_default();
        if !uuids.contains(&service) {
            trace!(%address, "Skipping peripheral without mesh service");
            return Ok(None);
        }

        Ok(Some(Candidate {
            address: BleAddress(address.0),
            rssi: device.rssi().await?.unwrap_or(i16::MIN),
            name: device.name().await?,
        }))
    }
}

#[async_trait]
impl BleTransport for BluezTransport {
    async fn scan(&mut self, service: Uuid, window: Duration) -> Result<Vec<Candidate>> {
        let filter = DiscoveryFilter {
            uuids: HashSet::from([service]),
            transport: DiscoveryTransport::Le,
            ..Default::default()
        };
        self.adapter.set_discovery_filter(filter).await?;

        let mut seen = HashSet::new();
        {
            let events = self.adapter.discover_devices().await?;
            futures::pin_mut!(events);
            let deadline = tokio::time::sleep(window);
            tokio::pin!(deadline);

            loop {
                tokio::select! {
                    _ = &mut deadline => break,
                    event = events.next() => match event {
                        Some(AdapterEvent::DeviceAdded(address)) => {
                            seen.insert(address);
                        }
                        Some(_) => {}
                        None => break,
                    },
                }
            }
            // Dropping the event stream ends discovery
        }

        let mut candidates = Vec::with_capacity(seen.len());
        for address in seen {
            match self.describe(address, service).await {
                Ok(Some(candidate)) => candidates.push(candidate),
                Ok(None) => {}
                Err(e) => debug!(%address, error = %e, "Ignoring peripheral"),
            }
        }

        debug!(count = candidates.len(), "Discovery window closed");
        Ok(candidates)
    }

    async fn connect(&mut self, candidate: &Candidate) -> Result<()> {
        self.characteristics.clear();
        let device = self.adapter.device(Address::new(candidate.address.0))?;

        if !device.is_connected().await? {
            device
                .connect()
                .await
                .map_err(|e| PlejdError::ConnectFailed {
                    address: candidate.address.to_string(),
                    reason: e.to_string(),
                })?;
        }

        self.device = Some(device);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.characteristics.clear();
        if let Some(device) = self.device.take() {
            if let Err(e) = device.disconnect().await {
                warn!(address = %device.address(), error = %e, "Disconnect failed");
            }
        }
        Ok(())
    }

    async fn discover_characteristics(&mut self, service: Uuid) -> Result<Vec<Uuid>> {
        let device = self.device.as_ref().ok_or(PlejdError::NotConnected)?;

        let mut found = HashMap::new();
        for gatt_service in device.services().await? {
            if gatt_service.uuid().await? != service {
                continue;
            }
            for characteristic in gatt_service.characteristics().await? {
                found.insert(characteristic.uuid().await?, characteristic);
            }
        }

        let uuids = found.keys().copied().collect();
        self.characteristics = found;
        Ok(uuids)
    }

    async fn write(&mut self, characteristic: GattCharacteristic, data: &[u8]) -> Result<()> {
        self.characteristic(characteristic)?
            .write(data)
            .await
            .map_err(|e| PlejdError::from_transport_message(e.to_string()))
    }

    async fn read(&mut self, characteristic: GattCharacteristic) -> Result<Vec<u8>> {
        self.characteristic(characteristic)?
            .read()
            .await
            .map_err(|e| PlejdError::from_transport_message(e.to_string()))
    }

    async fn subscribe(&mut self, characteristic: GattCharacteristic) -> Result<NotificationStream> {
        let stream = self.characteristic(characteristic)?.notify().await?;
        Ok(stream.boxed())
    }

    async fn set_adapter_power(&mut self, powered: bool) -> Result<()> {
        info!(adapter = %self.adapter.name(), powered, "Setting adapter power");
        self.adapter.set_powered(powered).await?;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
