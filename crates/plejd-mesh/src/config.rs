//! Configuration types for the Plejd mesh bridge
//!
//! This module provides configuration structures for the mesh session
//! (discovery, keepalive, reconnect and clock sync) and for the command
//! scheduler (write-queue pacing, retries and transitions).

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{PlejdError, Result};

/// Consecutive write failures that force a reconnect
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

/// Retry bound for a single queued command
pub const MAX_RETRY_COUNT: u32 = 10;

/// Upper bound on transition writes per second
pub const MAX_TRANSITION_STEPS_PER_SECOND: u32 = 5;

/// Every Nth reconnect attempt power-cycles the adapter
pub const DEFAULT_POWER_CYCLE_EVERY: u32 = 10;

/// Default pause between write-queue drain passes
pub const DEFAULT_WRITE_QUEUE_WAIT_MS: u64 = 400;

/// Default keepalive interval
pub const DEFAULT_PING_INTERVAL_MS: u64 = 3000;

/// Main configuration for the Plejd mesh bridge
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlejdConfig {
    /// Mesh session settings
    #[serde(default)]
    pub session: SessionConfig,

    /// Command scheduler settings
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

impl PlejdConfig {
    /// Parse a JSON configuration and check it
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the session and scheduler cannot run with.
    ///
    /// Periodic timers need a non-zero period, and a zero watchdog or
    /// discovery window would fail every connect attempt.
    pub fn validate(&self) -> Result<()> {
        let periods = [
            ("session.discovery_timeout", self.session.discovery_timeout),
            ("session.ping_interval", self.session.ping_interval),
            ("session.watchdog_timeout", self.session.watchdog_timeout),
            ("session.clock_sync_interval", self.session.clock_sync_interval),
            ("scheduler.write_queue_wait", self.scheduler.write_queue_wait),
        ];
        if let Some((name, _)) = periods.iter().find(|(_, value)| value.is_zero()) {
            return Err(PlejdError::InvalidConfig(format!("{name} must be non-zero")));
        }
        Ok(())
    }
}

/// Mesh session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// How long to collect advertising gateways per discovery round
    #[serde(with = "humantime_serde", default = "default_discovery_timeout")]
    pub discovery_timeout: Duration,

    /// Pause after connecting before walking the GATT tree
    #[serde(with = "humantime_serde", default = "default_connect_settle")]
    pub connect_settle: Duration,

    /// Keepalive interval while Ready
    #[serde(with = "humantime_serde", default = "default_ping_interval")]
    pub ping_interval: Duration,

    /// Consecutive write failures before a forced reconnect
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Delay before each reconnect iteration
    #[serde(with = "humantime_serde", default = "default_reconnect_delay")]
    pub reconnect_delay: Duration,

    /// Power-cycle the adapter every N reconnect attempts (0 = never)
    #[serde(default = "default_power_cycle_every")]
    pub power_cycle_every: u32,

    /// How long the adapter stays powered off during a power cycle
    #[serde(with = "humantime_serde", default = "default_power_off_wait")]
    pub power_off_wait: Duration,

    /// Settle time after powering the adapter back on
    #[serde(with = "humantime_serde", default = "default_power_on_wait")]
    pub power_on_wait: Duration,

    /// Upper bound for a single reconnect iteration
    #[serde(with = "humantime_serde", default = "default_watchdog_timeout")]
    pub watchdog_timeout: Duration,

    /// Keep the mesh clock in sync with the host clock
    #[serde(default)]
    pub sync_clock: bool,

    /// How often to query the mesh clock while Ready
    #[serde(with = "humantime_serde", default = "default_clock_sync_interval")]
    pub clock_sync_interval: Duration,

    /// Drift tolerated before the mesh clock is corrected
    #[serde(with = "humantime_serde", default = "default_clock_drift_tolerance")]
    pub clock_drift_tolerance: Duration,
}

fn default_discovery_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_connect_settle() -> Duration {
    Duration::from_secs(1)
}

fn default_ping_interval() -> Duration {
    Duration::from_millis(DEFAULT_PING_INTERVAL_MS)
}

fn default_failure_threshold() -> u32 {
    DEFAULT_FAILURE_THRESHOLD
}

fn default_reconnect_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_power_cycle_every() -> u32 {
    DEFAULT_POWER_CYCLE_EVERY
}

fn default_power_off_wait() -> Duration {
    Duration::from_secs(30)
}

fn default_power_on_wait() -> Duration {
    Duration::from_secs(5)
}

fn default_watchdog_timeout() -> Duration {
    Duration::from_secs(120)
}

fn default_clock_sync_interval() -> Duration {
    Duration::from_secs(3600) // hourly
}

fn default_clock_drift_tolerance() -> Duration {
    Duration::from_secs(60)
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            discovery_timeout: default_discovery_timeout(),
            connect_settle: default_connect_settle(),
            ping_interval: default_ping_interval(),
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            reconnect_delay: default_reconnect_delay(),
            power_cycle_every: DEFAULT_POWER_CYCLE_EVERY,
            power_off_wait: default_power_off_wait(),
            power_on_wait: default_power_on_wait(),
            watchdog_timeout: default_watchdog_timeout(),
            sync_clock: false,
            clock_sync_interval: default_clock_sync_interval(),
            clock_drift_tolerance: default_clock_drift_tolerance(),
        }
    }
}

/// Command scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Pause between write-queue drain passes
    #[serde(with = "humantime_serde", default = "default_write_queue_wait")]
    pub write_queue_wait: Duration,

    /// Retry bound per queued command
    #[serde(default = "default_max_retry_count")]
    pub max_retry_count: u32,

    /// Upper bound on transition writes per second
    #[serde(default = "default_max_steps_per_second")]
    pub max_steps_per_second: u32,

    /// Transitions at or below this length are left to the device firmware
    #[serde(with = "humantime_serde", default = "default_transition_threshold")]
    pub transition_threshold: Duration,
}

fn default_write_queue_wait() -> Duration {
    Duration::from_millis(DEFAULT_WRITE_QUEUE_WAIT_MS)
}

fn default_max_retry_count() -> u32 {
    MAX_RETRY_COUNT
}

fn default_max_steps_per_second() -> u32 {
    MAX_TRANSITION_STEPS_PER_SECOND
}

fn default_transition_threshold() -> Duration {
    Duration::from_secs(1)
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            write_queue_wait: default_write_queue_wait(),
            max_retry_count: MAX_RETRY_COUNT,
            max_steps_per_second: MAX_TRANSITION_STEPS_PER_SECOND,
            transition_threshold: default_transition_threshold(),
        }
    }
}

/// Builder for PlejdConfig
#[derive(Debug, Default)]
pub struct PlejdConfigBuilder {
    config: PlejdConfig,
}

impl PlejdConfigBuilder {
    /// Create a new builder with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the discovery window
    pub fn discovery_timeout(mut self, timeout: Duration) -> Self {
        self.config.session.discovery_timeout = timeout;
        self
    }

    /// Set the post-connect settle time
    pub fn connect_settle(mut self, settle: Duration) -> Self {
        self.config.session.connect_settle = settle;
        self
    }

    /// Set the keepalive interval
    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.config.session.ping_interval = interval;
        self
    }

    /// Set the reconnect delay
    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.config.session.reconnect_delay = delay;
        self
    }

    /// Set how often the adapter is power-cycled during reconnects
    pub fn power_cycle_every(mut self, attempts: u32) -> Self {
        self.config.session.power_cycle_every = attempts;
        self
    }

    /// Set the per-iteration reconnect watchdog
    pub fn watchdog_timeout(mut self, timeout: Duration) -> Self {
        self.config.session.watchdog_timeout = timeout;
        self
    }

    /// Enable or disable mesh clock sync
    pub fn sync_clock(mut self, enabled: bool) -> Self {
        self.config.session.sync_clock = enabled;
        self
    }

    /// Set the write-queue drain pause
    pub fn write_queue_wait(mut self, wait: Duration) -> Self {
        self.config.scheduler.write_queue_wait = wait;
        self
    }

    /// Set the per-command retry bound
    pub fn max_retry_count(mut self, retries: u32) -> Self {
        self.config.scheduler.max_retry_count = retries;
        self
    }

    /// Build the configuration
    pub fn build(self) -> PlejdConfig {
        self.config
    }
}

// Custom serde module for Duration with humantime
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
