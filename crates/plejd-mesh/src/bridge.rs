//! PlejdBridge - command scheduling and event fan-out
//!
//! The bridge task owns the event translator (and through it the device
//! directory), the command scheduler and the transition tickers. The mesh
//! session runs as a second task; the two talk through a [`SessionHandle`]
//! and a channel of [`SessionEvent`]s.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         PlejdBridge                          │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                              │
//! │  BridgeHandle ──► CommandScheduler ──drain──► SessionHandle ─┼──► MeshSession
//! │                   (queue, ramps)                             │     (transport)
//! │                                                              │         │
//! │  broadcast ◄───── EventTranslator ◄──── SessionEvent ◄───────┼─────────┘
//! │                   (directory)                                │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use plejd_mesh::{start, PlejdConfig, TurnOnOptions};
//!
//! let bridge = start(transport, directory, key, &PlejdConfig::default());
//! let mut events = bridge.subscribe();
//!
//! bridge.turn_on("light-kitchen", TurnOnOptions { brightness: Some(128), ..Default::default() }).await?;
//! while let Ok(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! ```

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::config::{PlejdConfig, SchedulerConfig};
use crate::crypto::MeshKey;
use crate::directory::{DeviceDirectory, LogicalDevice};
use crate::error::{PlejdError, Result};
use crate::scheduler::{
    CommandScheduler, MeshCommand, Popped, RetryOutcome, Scheduled, TickOutcome, TurnOnOptions,
    WriteQueueItem,
};
use crate::session::{MeshSession, SessionEvent, SessionHandle, SessionStats};
use crate::transport::BleTransport;
use crate::translator::{BridgeEvent, EventTranslator};

/// Commands that can be sent to the bridge
#[derive(Debug)]
pub enum BridgeCommand {
    /// Turn a device on
    TurnOn {
        /// Logical device id
        unique_id: String,
        /// Level, color and transition
        options: TurnOnOptions,
        /// Accepted or rejected
        reply: oneshot::Sender<Result<()>>,
    },
    /// Turn a device off
    TurnOff {
        /// Logical device id
        unique_id: String,
        /// Optional transition
        transition: Option<Duration>,
        /// Accepted or rejected
        reply: oneshot::Sender<Result<()>>,
    },
    /// Trigger a scene
    TriggerScene {
        /// Logical scene id
        scene_id: String,
        /// Accepted or rejected
        reply: oneshot::Sender<Result<()>>,
    },
    /// Get all devices with their cached state
    GetDevices(oneshot::Sender<Vec<LogicalDevice>>),
    /// Get bridge statistics
    GetStats(oneshot::Sender<BridgeStats>),
    /// Shutdown the bridge
    Shutdown,
}

/// Bridge statistics
#[derive(Debug, Clone, Default)]
pub struct BridgeStats {
    /// Logical commands accepted
    pub commands_received: u64,
    /// Frames written to the mesh
    pub writes_sent: u64,
    /// Frame writes that failed
    pub write_failures: u64,
    /// Items requeued for another attempt
    pub retries: u64,
    /// Items dropped (not retriable, exhausted, or unresolvable)
    pub dropped_commands: u64,
    /// Items dropped in favour of a newer one for the same device
    pub superseded: u64,
    /// Events published upward
    pub events_published: u64,
    /// Mesh events for unregistered addresses
    pub unknown_addresses: u64,
    /// Items still queued
    pub pending_writes: usize,
    /// Session counters
    pub session: SessionStats,
}

#[derive(Debug, Clone)]
struct TransitionTick {
    logical_id: String,
    generation: u64,
}

/// Handle for controlling the bridge
#[derive(Clone)]
pub struct BridgeHandle {
    command_tx: mpsc::Sender<BridgeCommand>,
    events: broadcast::Sender<BridgeEvent>,
}

impl BridgeHandle {
    /// Turn a device on
    pub async fn turn_on(&self, unique_id: &str, options: TurnOnOptions) -> Result<()> {
        self.request(|reply| BridgeCommand::TurnOn {
            unique_id: unique_id.to_string(),
            options,
            reply,
        })
        .await?
    }

    /// Turn a device off
    pub async fn turn_off(&self, unique_id: &str, transition: Option<Duration>) -> Result<()> {
        self.request(|reply| BridgeCommand::TurnOff {
            unique_id: unique_id.to_string(),
            transition,
            reply,
        })
        .await?
    }

    /// Trigger a scene
    pub async fn trigger_scene(&self, scene_id: &str) -> Result<()> {
        self.request(|reply| BridgeCommand::TriggerScene {
            scene_id: scene_id.to_string(),
            reply,
        })
        .await?
    }

    /// All devices with their cached state
    pub async fn devices(&self) -> Result<Vec<LogicalDevice>> {
        self.request(BridgeCommand::GetDevices).await
    }

    /// Get bridge statistics
    pub async fn stats(&self) -> Result<BridgeStats> {
        self.request(BridgeCommand::GetStats).await
    }

    /// Subscribe to bridge events
    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.events.subscribe()
    }

    /// Shutdown the bridge (and with it the mesh session)
    pub async fn shutdown(&self) -> Result<()> {
        self.command_tx
            .send(BridgeCommand::Shutdown)
            .await
            .map_err(|_| PlejdError::ChannelClosed)
    }

    async fn request<R>(&self, build: impl FnOnce(oneshot::Sender<R>) -> BridgeCommand) -> Result<R> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(build(tx))
            .await
            .map_err(|_| PlejdError::ChannelClosed)?;
        rx.await.map_err(|_| PlejdError::ChannelClosed)
    }
}

/// Spawn a mesh session over `transport` and a bridge on top of it
pub fn start<T: BleTransport + 'static>(
    transport: T,
    directory: DeviceDirectory,
    key: MeshKey,
    config: &PlejdConfig,
) -> BridgeHandle {
    let (session, session_handle, session_events) = MeshSession::new(
        transport,
        key,
        config.session.clone(),
        directory.gateways(),
    );
    let (bridge, handle) = PlejdBridge::new(
        directory,
        config.scheduler.clone(),
        session_handle,
        session_events,
    );

    tokio::spawn(session.run());
    tokio::spawn(bridge.run());
    handle
}

/// Bridge between logical commands/events and a mesh session
pub struct PlejdBridge {
    translator: EventTranslator,
    scheduler: CommandScheduler,
    session: SessionHandle,
    session_events: mpsc::UnboundedReceiver<SessionEvent>,
    command_rx: mpsc::Receiver<BridgeCommand>,
    events: broadcast::Sender<BridgeEvent>,
    tick_tx: mpsc::UnboundedSender<TransitionTick>,
    tick_rx: mpsc::UnboundedReceiver<TransitionTick>,
    tickers: HashMap<String, (u64, JoinHandle<()>)>,
    write_queue_wait: Duration,
    link_ready: bool,
    stats: BridgeStats,
}

impl PlejdBridge {
    /// Create a bridge over a running session
    pub fn new(
        directory: DeviceDirectory,
        config: SchedulerConfig,
        session: SessionHandle,
        session_events: mpsc::UnboundedReceiver<SessionEvent>,
    ) -> (Self, BridgeHandle) {
        let (command_tx, command_rx) = mpsc::channel(256);
        let (events, _) = broadcast::channel(256);
        let (tick_tx, tick_rx) = mpsc::unbounded_channel();

        let handle = BridgeHandle {
            command_tx,
            events: events.clone(),
        };

        let bridge = Self {
            translator: EventTranslator::new(directory),
            write_queue_wait: config.write_queue_wait,
            scheduler: CommandScheduler::new(config),
            session,
            session_events,
            command_rx,
            events,
            tick_tx,
            tick_rx,
            tickers: HashMap::new(),
            link_ready: false,
            stats: BridgeStats::default(),
        };

        (bridge, handle)
    }

    /// Run the bridge service
    ///
    /// This method runs the main event loop, handling:
    /// - Logical commands from handles
    /// - Session lifecycle and mesh events
    /// - Transition ticks
    /// - Write-queue drain passes while the link is Ready
    pub async fn run(mut self) {
        info!("Starting Plejd bridge");

        let mut drain = interval(self.write_queue_wait);
        drain.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.command_rx.recv() => match command {
                    Some(BridgeCommand::Shutdown) | None => {
                        info!("Bridge shutdown requested");
                        break;
                    }
                    Some(command) => self.handle_command(command),
                },

                event = self.session_events.recv() => match event {
                    Some(event) => self.handle_session_event(event).await,
                    None => {
                        warn!("Mesh session stopped");
                        break;
                    }
                },

                Some(tick) = self.tick_rx.recv() => self.handle_tick(tick),

                _ = drain.tick(), if self.link_ready => self.drain_queue().await,
            }
        }

        for (_, (_, ticker)) in self.tickers.drain() {
            ticker.abort();
        }
        info!("Plejd bridge stopped");
    }

    fn handle_command(&mut self, command: BridgeCommand) {
        match command {
            BridgeCommand::TurnOn {
                unique_id,
                options,
                reply,
            } => {
                let on = MeshCommand::shape(options.brightness, options.color_temp)
                    != MeshCommand::TurnOff;
                let result = self.schedule(&unique_id, on, |scheduler, device, now| {
                    scheduler.turn_on(device, options, now)
                });
                let _ = reply.send(result);
            }
            BridgeCommand::TurnOff {
                unique_id,
                transition,
                reply,
            } => {
                let result = self.schedule(&unique_id, false, |scheduler, device, now| {
                    scheduler.turn_off(device, transition, now)
                });
                let _ = reply.send(result);
            }
            BridgeCommand::TriggerScene { scene_id, reply } => {
                let result = if self.translator.directory().scene_address(&scene_id).is_some() {
                    self.stats.commands_received += 1;
                    self.scheduler.trigger_scene(&scene_id);
                    Ok(())
                } else {
                    Err(PlejdError::UnknownDevice(scene_id))
                };
                let _ = reply.send(result);
            }
            BridgeCommand::GetDevices(tx) => {
                let _ = tx.send(self.translator.directory().devices().cloned().collect());
            }
            BridgeCommand::GetStats(tx) => {
                let mut stats = self.stats.clone();
                stats.pending_writes = self.scheduler.pending();
                stats.session = self.session.stats();
                let _ = tx.send(stats);
            }
            BridgeCommand::Shutdown => {}
        }
    }

    fn schedule(
        &mut self,
        unique_id: &str,
        on: bool,
        schedule: impl FnOnce(&mut CommandScheduler, &LogicalDevice, Instant) -> Scheduled,
    ) -> Result<()> {
        let device = self
            .translator
            .device(unique_id)
            .cloned()
            .ok_or_else(|| PlejdError::UnknownDevice(unique_id.to_string()))?;

        self.stats.commands_received += 1;
        self.stop_ticker(unique_id);

        let scheduled = schedule(&mut self.scheduler, &device, Instant::now());
        if let Some(echo) = self.translator.optimistic_echo(unique_id, on) {
            self.publish(echo);
        }

        if let Scheduled::Transition {
            generation,
            start,
            interval,
        } = scheduled
        {
            self.start_ticker(unique_id, generation, start, interval);
        }
        Ok(())
    }

    fn start_ticker(&mut self, unique_id: &str, generation: u64, start: Instant, period: Duration) {
        let tick_tx = self.tick_tx.clone();
        let logical_id = unique_id.to_string();

        let ticker = tokio::spawn(async move {
            let mut ticks = interval_at(start + period, period);
            loop {
                ticks.tick().await;
                let tick = TransitionTick {
                    logical_id: logical_id.clone(),
                    generation,
                };
                if tick_tx.send(tick).is_err() {
                    break;
                }
            }
        });

        if let Some((_, old)) = self
            .tickers
            .insert(unique_id.to_string(), (generation, ticker))
        {
            old.abort();
        }
    }

    fn stop_ticker(&mut self, unique_id: &str) {
        if let Some((_, ticker)) = self.tickers.remove(unique_id) {
            ticker.abort();
        }
    }

    fn handle_tick(&mut self, tick: TransitionTick) {
        let outcome =
            self.scheduler
                .transition_tick(&tick.logical_id, tick.generation, Instant::now());
        trace!(device = %tick.logical_id, ?outcome, "Transition tick");

        match outcome {
            TickOutcome::Step { .. } => {}
            TickOutcome::Finished { .. } | TickOutcome::Stale => {
                // Ticks of a replaced job may still be in flight
                let current = self
                    .tickers
                    .get(&tick.logical_id)
                    .is_some_and(|(generation, _)| *generation == tick.generation);
                if current {
                    self.stop_ticker(&tick.logical_id);
                }
            }
        }
    }

    async fn handle_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Connected { peer } => {
                info!(peer = %peer, pending = self.scheduler.pending(), "Mesh link ready");
                self.link_ready = true;
                self.publish(BridgeEvent::Connected { peer });
                self.drain_queue().await;
            }
            SessionEvent::Reconnecting => {
                info!("Mesh link lost, pausing write queue");
                self.link_ready = false;
                self.publish(BridgeEvent::Reconnecting);
            }
            SessionEvent::Mesh(mesh_event) => match self.translator.translate(&mesh_event) {
                Ok(Some(event)) => self.publish(event),
                Ok(None) => {}
                Err(PlejdError::UnknownAddress(address)) => {
                    self.stats.unknown_addresses += 1;
                    debug!(address, event = ?mesh_event, "Ignoring event for unknown address");
                }
                Err(e) => debug!(error = %e, "Failed to translate mesh event"),
            },
        }
    }

    /// Send queued items until the queue is empty, the link drops, or a
    /// repeated retry ends the pass
    async fn drain_queue(&mut self) {
        while let Some(popped) = self.scheduler.next_item() {
            let item = match popped {
                Popped::Ready(item) => item,
                Popped::Superseded(item) => {
                    trace!(device = %item.logical_id, command = ?item.command, "Superseded");
                    self.stats.superseded += 1;
                    continue;
                }
            };

            let Some(address) = self.resolve_address(&item) else {
                warn!(device = %item.logical_id, "Dropping command for unknown device");
                self.stats.dropped_commands += 1;
                continue;
            };

            let frame = item.command.to_frame(address);
            match self.session.write(&frame).await {
                Ok(()) => {
                    debug!(device = %item.logical_id, command = ?item.command, "Command sent");
                    self.stats.writes_sent += 1;
                }
                Err(PlejdError::NotConnected) => {
                    debug!("Link not ready, pausing write queue");
                    self.scheduler.requeue_unsent(item);
                    break;
                }
                Err(e) => {
                    self.stats.write_failures += 1;
                    warn!(device = %item.logical_id, error = %e, retries = item.retry_count, "Command write failed");
                    match self.scheduler.record_failure(item) {
                        RetryOutcome::Requeued { end_pass } => {
                            self.stats.retries += 1;
                            if end_pass {
                                break;
                            }
                        }
                        RetryOutcome::Dropped | RetryOutcome::Exhausted => {
                            self.stats.dropped_commands += 1;
                        }
                    }
                }
            }
        }
    }

    fn resolve_address(&self, item: &WriteQueueItem) -> Option<u8> {
        let directory = self.translator.directory();
        match item.command {
            MeshCommand::TriggerScene => directory.scene_address(&item.logical_id),
            _ => directory
                .device(&item.logical_id)
                .map(|device| device.output_address),
        }
    }

    fn publish(&mut self, event: BridgeEvent) {
        self.stats.events_published += 1;
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PlejdConfigBuilder;
    use crate::test_utils::{test_directory, test_key, FakeTransport};

    fn test_bridge() -> (PlejdBridge, BridgeHandle, FakeTransport) {
        let transport = FakeTransport::new();
        let (_session, session_handle, session_events) = MeshSession::new(
            transport.clone(),
            test_key(),
            Default::default(),
            HashMap::new(),
        );
        let (bridge, handle) = PlejdBridge::new(
            test_directory(),
            SchedulerConfig::default(),
            session_handle,
            session_events,
        );
        (bridge, handle, transport)
    }

    #[tokio::test]
    async fn test_bridge_creation() {
        let (bridge, handle, _transport) = test_bridge();
        assert!(!bridge.link_ready);
        assert_eq!(bridge.scheduler.pending(), 0);
        drop(handle);
    }

    #[tokio::test]
    async fn test_unknown_device_rejected() {
        let (mut bridge, _handle, _transport) = test_bridge();
        assert!(matches!(
            bridge.schedule("nope", true, |s, d, now| s.turn_off(d, None, now)),
            Err(PlejdError::UnknownDevice(_))
        ));
        assert_eq!(bridge.stats.commands_received, 0);
    }

    #[tokio::test]
    async fn test_switch_echo_published() {
        let (mut bridge, handle, _transport) = test_bridge();
        let mut events = handle.subscribe();

        bridge
            .schedule("switch-porch", false, |s, d, now| s.turn_off(d, None, now))
            .unwrap();
        bridge
            .schedule("light-kitchen", false, |s, d, now| s.turn_off(d, None, now))
            .unwrap();

        assert!(matches!(
            events.try_recv().unwrap(),
            BridgeEvent::StateChanged { ref unique_id, .. } if unique_id == "switch-porch"
        ));
        assert!(events.try_recv().is_err());
        assert_eq!(bridge.scheduler.pending(), 2);
    }

    #[tokio::test]
    async fn test_drain_retries_once_in_pass() {
        let (mut bridge, _handle, _transport) = test_bridge();
        bridge.scheduler.trigger_scene("scene-evening");

        // The session task never ran, so every write fails: the first
        // retry happens in the same pass, the second ends it
        bridge.drain_queue().await;
        assert_eq!(bridge.stats.write_failures, 2);
        assert_eq!(bridge.stats.retries, 2);
        assert_eq!(bridge.scheduler.pending(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scene_resolution() {
        let (bridge, _handle, _transport) = test_bridge();
        let item = WriteQueueItem {
            logical_id: "scene-evening".into(),
            command: MeshCommand::TriggerScene,
            should_retry: true,
            retry_count: 0,
        };
        assert_eq!(bridge.resolve_address(&item), Some(3));

        let item = WriteQueueItem {
            logical_id: "light-living".into(),
            command: MeshCommand::ColorTemp { kelvin: 3000 },
            should_retry: true,
            retry_count: 0,
        };
        assert_eq!(bridge.resolve_address(&item), Some(9));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_and_shutdown() {
        let config = PlejdConfigBuilder::new()
            .write_queue_wait(Duration::from_millis(100))
            .build();
        let transport = FakeTransport::new();
        let handle = start(transport.clone(), test_directory(), test_key(), &config);
        let mut events = handle.subscribe();

        assert!(matches!(
            events.recv().await.unwrap(),
            BridgeEvent::Connected { .. }
        ));
        assert_eq!(handle.devices().await.unwrap().len(), 3);

        handle.shutdown().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(handle.stats().await.is_err());
    }
}
