//! Plejd Node - BLE mesh to MQTT bridge
//!
//! This binary runs a full Plejd bridge with:
//! - A mesh session over the local BlueZ adapter
//! - Home Assistant discovery, state and commands over MQTT

mod mqtt;

use anyhow::Context;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use plejd_mesh::{BluezTransport, DeviceDirectory, PlejdConfig, SiteSnapshot};

use mqtt::{MqttAdapter, MqttConfig};

#[derive(Parser)]
#[command(name = "plejd-node")]
#[command(about = "Plejd BLE mesh to MQTT bridge")]
struct Args {
    /// Configuration file (JSON)
    #[arg(long, short, default_value = "plejd.json")]
    config: PathBuf,

    /// Site cache with the mesh key and device list (overrides the config file)
    #[arg(long)]
    site_cache: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(long, short)]
    verbose: bool,
}

/// Process configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct NodeConfig {
    /// Site cache written by the account sync
    site_cache: PathBuf,
    /// BlueZ adapter name, e.g. `hci0`; the default adapter when unset
    adapter: Option<String>,
    mqtt: MqttConfig,
    plejd: PlejdConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            site_cache: PathBuf::from("site.json"),
            adapter: None,
            mqtt: MqttConfig::default(),
            plejd: PlejdConfig::default(),
        }
    }
}

impl NodeConfig {
    fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            warn!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("invalid config {}", path.display()))
    }

    fn parse(text: &str) -> anyhow::Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.plejd.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging; RUST_LOG takes precedence over --verbose
    let level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting Plejd node v{}", plejd_mesh::VERSION);

    let mut config = NodeConfig::load(&args.config)?;
    if let Some(site_cache) = args.site_cache {
        config.site_cache = site_cache;
    }

    let snapshot = SiteSnapshot::load(&config.site_cache)
        .with_context(|| format!("cannot read site cache {}", config.site_cache.display()))?;
    let key = snapshot
        .mesh_key()
        .context("site cache has no usable mesh key")?;
    let directory =
        DeviceDirectory::from_snapshot(&snapshot).context("site cache is inconsistent")?;
    info!(
        devices = directory.devices().count(),
        scenes = directory.scenes().count(),
        gateways = directory.gateways().len(),
        "Device directory loaded"
    );

    let transport = BluezTransport::new(config.adapter.as_deref())
        .await
        .context("no usable Bluetooth adapter")?;

    let bridge = plejd_mesh::start(transport, directory.clone(), key, &config.plejd);
    let adapter = MqttAdapter::new(config.mqtt, &directory, bridge.clone());

    tokio::select! {
        result = adapter.run() => result?,
        _ = tokio::signal::ctrl_c() => info!("Interrupted, shutting down"),
    }

    if bridge.shutdown().await.is_err() {
        warn!("Bridge already stopped");
    }
    Ok(())
}
