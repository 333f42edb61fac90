//! Command scheduler: write queue and brightness transitions
//!
//! The scheduler is plain state; the bridge task owns it, feeds it logical
//! commands and transition ticks, and drains it into the mesh session.
//!
//! # Queue discipline
//!
//! New items enter at the front and the drain takes from the back, so
//! distinct devices are served oldest first. Before an item is sent the
//! rest of the queue is scanned: if a newer item names the same logical id,
//! the taken item is dropped as superseded. Per device the most recent
//! command wins, whatever happened in between.
//!
//! Retries re-enter at the back and are therefore taken next. The first
//! retry of an item happens within the same drain pass; any later retry
//! ends the pass so a failing link is not hammered.
//!
//! # Transitions
//!
//! A ramp re-measures elapsed wall time on every tick rather than counting
//! steps, so timer jitter shifts intermediate levels but never the final
//! one.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, trace};

use crate::codec::MeshFrame;
use crate::config::SchedulerConfig;
use crate::directory::LogicalDevice;

/// Command kinds sent over the mesh
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeshCommand {
    /// Switch on, resuming the device's own last dim level
    TurnOn,
    /// Switch off
    TurnOff,
    /// Set a dim level
    Dim {
        /// Target level
        brightness: u8,
    },
    /// Set a color temperature
    ColorTemp {
        /// Kelvin
        kelvin: u16,
    },
    /// Trigger a scene
    TriggerScene,
}

impl MeshCommand {
    /// Shape a turn-on request into a single mesh command.
    ///
    /// Color and dim are mutually exclusive per write; a color temperature
    /// wins over a brightness.
    pub fn shape(brightness: Option<i32>, color_temp: Option<u16>) -> Self {
        if let Some(kelvin) = color_temp {
            return MeshCommand::ColorTemp { kelvin };
        }
        match brightness {
            None => MeshCommand::TurnOn,
            Some(b) if b <= 0 => MeshCommand::TurnOff,
            Some(b) => MeshCommand::Dim {
                brightness: b.min(i32::from(u8::MAX)) as u8,
            },
        }
    }

    /// Build the wire frame for this command at `address`
    pub fn to_frame(&self, address: u8) -> MeshFrame {
        match *self {
            MeshCommand::TurnOn => MeshFrame::state(address, true),
            MeshCommand::TurnOff => MeshFrame::state(address, false),
            MeshCommand::Dim { brightness } => MeshFrame::dim(address, brightness),
            MeshCommand::ColorTemp { kelvin } => MeshFrame::color_temperature(address, kelvin),
            MeshCommand::TriggerScene => MeshFrame::scene(address),
        }
    }
}

/// One pending write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteQueueItem {
    /// Device or scene id
    pub logical_id: String,
    /// What to send
    pub command: MeshCommand,
    /// Retry on send failure
    pub should_retry: bool,
    /// Failed attempts so far
    pub retry_count: u32,
}

impl WriteQueueItem {
    fn new(logical_id: impl Into<String>, command: MeshCommand, should_retry: bool) -> Self {
        Self {
            logical_id: logical_id.into(),
            command,
            should_retry,
            retry_count: 0,
        }
    }
}

/// Result of taking the next item off the queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Popped {
    /// Send this item
    Ready(WriteQueueItem),
    /// A newer item for the same id is still queued; drop this one
    Superseded(WriteQueueItem),
}

/// Pending writes
#[derive(Debug, Default)]
pub struct WriteQueue {
    items: VecDeque<WriteQueueItem>,
}

impl WriteQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a new command
    pub fn push(&mut self, item: WriteQueueItem) {
        self.items.push_front(item);
    }

    /// Put an item back so it is taken next
    pub fn requeue(&mut self, item: WriteQueueItem) {
        self.items.push_back(item);
    }

    /// Take the next item
    pub fn pop(&mut self) -> Option<Popped> {
        let item = self.items.pop_back()?;
        if self.items.iter().any(|other| other.logical_id == item.logical_id) {
            Some(Popped::Superseded(item))
        } else {
            Some(Popped::Ready(item))
        }
    }

    /// Number of queued items
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Options for a turn-on command
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TurnOnOptions {
    /// Requested dim level; `<= 0` means off, values above 255 are clamped
    pub brightness: Option<i32>,
    /// Requested color temperature in Kelvin
    pub color_temp: Option<u16>,
    /// Requested transition length
    pub transition: Option<Duration>,
}

/// How a command was scheduled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheduled {
    /// A single item was queued
    Queued,
    /// A ramp was started; the caller must deliver ticks
    Transition {
        /// Identifies this job in ticks
        generation: u64,
        /// Ramp start
        start: Instant,
        /// Tick period
        interval: Duration,
    },
}

/// Result of a transition tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// An intermediate level was queued
    Step {
        /// Level queued
        brightness: u8,
    },
    /// The target was queued and the job removed
    Finished {
        /// Level queued
        brightness: u8,
    },
    /// No such job (replaced, cancelled or already finished)
    Stale,
}

/// Result of recording a failed send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Put back for another attempt
    Requeued {
        /// End the current drain pass
        end_pass: bool,
    },
    /// Not retriable; dropped
    Dropped,
    /// Retry bound exceeded; dropped
    Exhausted,
}

#[derive(Debug, Clone)]
struct TransitionJob {
    generation: u64,
    initial: u8,
    target: u8,
    duration: Duration,
    start: Instant,
}

impl TransitionJob {
    fn level_at(&self, elapsed: Duration) -> i32 {
        let delta = f64::from(self.target) - f64::from(self.initial);
        let fraction = elapsed.as_secs_f64() / self.duration.as_secs_f64();
        (f64::from(self.initial) + delta * fraction).round() as i32
    }
}

/// Write queue plus per-device transition jobs
#[derive(Debug)]
pub struct CommandScheduler {
    config: SchedulerConfig,
    queue: WriteQueue,
    transitions: HashMap<String, TransitionJob>,
    next_generation: u64,
}

impl CommandScheduler {
    /// Create a scheduler
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            queue: WriteQueue::new(),
            transitions: HashMap::new(),
            next_generation: 0,
        }
    }

    /// Turn a device on, optionally to a level, color or over a transition
    pub fn turn_on(
        &mut self,
        device: &LogicalDevice,
        options: TurnOnOptions,
        now: Instant,
    ) -> Scheduled {
        let command = MeshCommand::shape(options.brightness, options.color_temp);
        let target = match command {
            MeshCommand::Dim { brightness } => Some(brightness),
            MeshCommand::TurnOff => Some(0),
            _ => None,
        };
        self.schedule(device, command, target, options.transition, now)
    }

    /// Turn a device off, optionally over a transition
    pub fn turn_off(
        &mut self,
        device: &LogicalDevice,
        transition: Option<Duration>,
        now: Instant,
    ) -> Scheduled {
        self.schedule(device, MeshCommand::TurnOff, Some(0), transition, now)
    }

    /// Queue a scene trigger
    pub fn trigger_scene(&mut self, scene_id: &str) {
        self.queue
            .push(WriteQueueItem::new(scene_id, MeshCommand::TriggerScene, true));
    }

    fn schedule(
        &mut self,
        device: &LogicalDevice,
        command: MeshCommand,
        target: Option<u8>,
        transition: Option<Duration>,
        now: Instant,
    ) -> Scheduled {
        self.cancel_transition(&device.unique_id);

        let ramp = match (transition, device.ramp_origin(), target) {
            (Some(duration), Some(initial), Some(target))
                if duration > self.config.transition_threshold
                    && device.dimmable
                    && initial != target =>
            {
                Some((duration, initial, target))
            }
            _ => None,
        };

        let Some((duration, initial, target)) = ramp else {
            self.queue
                .push(WriteQueueItem::new(&device.unique_id, command, true));
            return Scheduled::Queued;
        };

        let delta = u32::from(initial.abs_diff(target));
        let rate_bound =
            (f64::from(self.config.max_steps_per_second) * duration.as_secs_f64()).round() as u32;
        let steps = delta.min(rate_bound).max(1);
        let interval = duration / steps;

        self.next_generation += 1;
        let generation = self.next_generation;
        self.transitions.insert(
            device.unique_id.clone(),
            TransitionJob {
                generation,
                initial,
                target,
                duration,
                start: now,
            },
        );

        debug!(
            device = %device.unique_id,
            initial,
            target,
            steps,
            interval_ms = interval.as_millis() as u64,
            "Starting transition"
        );

        Scheduled::Transition {
            generation,
            start: now,
            interval,
        }
    }

    /// Advance a transition job
    pub fn transition_tick(&mut self, logical_id: &str, generation: u64, now: Instant) -> TickOutcome {
        let Some(job) = self.transitions.get(logical_id) else {
            return TickOutcome::Stale;
        };
        if job.generation != generation {
            return TickOutcome::Stale;
        }

        let elapsed = now.saturating_duration_since(job.start).min(job.duration);
        if elapsed == job.duration {
            let brightness = job.target;
            self.transitions.remove(logical_id);
            self.queue.push(WriteQueueItem::new(
                logical_id,
                MeshCommand::shape(Some(i32::from(brightness)), None),
                true,
            ));
            trace!(device = logical_id, brightness, "Transition finished");
            return TickOutcome::Finished { brightness };
        }

        let level = job.level_at(elapsed);
        let brightness = level.clamp(0, i32::from(u8::MAX)) as u8;
        self.queue.push(WriteQueueItem::new(
            logical_id,
            MeshCommand::shape(Some(level), None),
            false,
        ));
        TickOutcome::Step { brightness }
    }

    /// Drop any running transition for a device
    pub fn cancel_transition(&mut self, logical_id: &str) -> bool {
        self.transitions.remove(logical_id).is_some()
    }

    /// Whether a device has a running transition
    pub fn has_transition(&self, logical_id: &str) -> bool {
        self.transitions.contains_key(logical_id)
    }

    /// Take the next item off the write queue
    pub fn next_item(&mut self) -> Option<Popped> {
        self.queue.pop()
    }

    /// Put back an item that was not attempted
    pub fn requeue_unsent(&mut self, item: WriteQueueItem) {
        self.queue.requeue(item);
    }

    /// Record a failed send of `item`
    pub fn record_failure(&mut self, mut item: WriteQueueItem) -> RetryOutcome {
        if !item.should_retry {
            return RetryOutcome::Dropped;
        }

        item.retry_count += 1;
        if item.retry_count > self.config.max_retry_count {
            error!(
                device = %item.logical_id,
                retries = self.config.max_retry_count,
                "Command dropped after exhausting retries"
            );
            return RetryOutcome::Exhausted;
        }

        let end_pass = item.retry_count > 1;
        self.queue.requeue(item);
        RetryOutcome::Requeued { end_pass }
    }

    /// Number of queued items
    pub fn pending(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{DeviceKind, DeviceState};

    fn light(on: bool, brightness: Option<u8>) -> LogicalDevice {
        LogicalDevice {
            unique_id: "light-1".into(),
            name: "Light".into(),
            kind: DeviceKind::Light,
            output_address: 5,
            dimmable: true,
            supports_color_temp: false,
            state: DeviceState {
                on,
                brightness,
                color_temp: None,
            },
        }
    }

    fn drain_ready(scheduler: &mut CommandScheduler) -> Vec<WriteQueueItem> {
        let mut sent = Vec::new();
        while let Some(popped) = scheduler.next_item() {
            if let Popped::Ready(item) = popped {
                sent.push(item);
            }
        }
        sent
    }

    #[test]
    fn test_command_shaping() {
        assert_eq!(MeshCommand::shape(None, None), MeshCommand::TurnOn);
        assert_eq!(MeshCommand::shape(Some(0), None), MeshCommand::TurnOff);
        assert_eq!(MeshCommand::shape(Some(-4), None), MeshCommand::TurnOff);
        assert_eq!(
            MeshCommand::shape(Some(300), None),
            MeshCommand::Dim { brightness: 255 }
        );
        assert_eq!(
            MeshCommand::shape(Some(128), Some(2700)),
            MeshCommand::ColorTemp { kelvin: 2700 }
        );
    }

    #[test]
    fn test_latest_command_wins() {
        let mut scheduler = CommandScheduler::new(SchedulerConfig::default());
        let device = light(true, Some(10));
        let now = Instant::now();

        let first = TurnOnOptions {
            brightness: Some(100),
            ..Default::default()
        };
        let second = TurnOnOptions {
            brightness: Some(200),
            ..Default::default()
        };
        scheduler.turn_on(&device, first, now);
        scheduler.turn_on(&device, second, now);

        assert!(matches!(scheduler.next_item(), Some(Popped::Superseded(_))));
        let sent = drain_ready(&mut scheduler);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].command, MeshCommand::Dim { brightness: 200 });
    }

    #[test]
    fn test_distinct_devices_oldest_first() {
        let mut queue = WriteQueue::new();
        queue.push(WriteQueueItem::new("a", MeshCommand::TurnOn, true));
        queue.push(WriteQueueItem::new("b", MeshCommand::TurnOn, true));
        queue.push(WriteQueueItem::new("c", MeshCommand::TurnOn, true));

        let order: Vec<String> = std::iter::from_fn(|| queue.pop())
            .map(|p| match p {
                Popped::Ready(item) | Popped::Superseded(item) => item.logical_id,
            })
            .collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_retry_policy() {
        let config = SchedulerConfig {
            max_retry_count: 2,
            ..Default::default()
        };
        let mut scheduler = CommandScheduler::new(config);
        let item = WriteQueueItem::new("light-1", MeshCommand::TurnOn, true);

        assert_eq!(
            scheduler.record_failure(item),
            RetryOutcome::Requeued { end_pass: false }
        );
        let Some(Popped::Ready(item)) = scheduler.next_item() else {
            panic!("retry should be taken next");
        };
        assert_eq!(item.retry_count, 1);

        assert_eq!(
            scheduler.record_failure(item),
            RetryOutcome::Requeued { end_pass: true }
        );
        let Some(Popped::Ready(item)) = scheduler.next_item() else {
            panic!("retry should be taken next");
        };
        assert_eq!(scheduler.record_failure(item), RetryOutcome::Exhausted);
        assert_eq!(scheduler.pending(), 0);

        let step = WriteQueueItem::new("light-1", MeshCommand::Dim { brightness: 3 }, false);
        assert_eq!(scheduler.record_failure(step), RetryOutcome::Dropped);
    }

    #[test]
    fn test_retry_taken_before_older_items() {
        let mut scheduler = CommandScheduler::new(SchedulerConfig::default());
        scheduler.trigger_scene("scene-a");
        scheduler.trigger_scene("scene-b");

        let Some(Popped::Ready(first)) = scheduler.next_item() else {
            panic!("expected an item");
        };
        assert_eq!(first.logical_id, "scene-a");
        scheduler.record_failure(first);

        let order: Vec<String> = drain_ready(&mut scheduler)
            .into_iter()
            .map(|i| i.logical_id)
            .collect();
        assert_eq!(order, vec!["scene-a", "scene-b"]);
    }

    #[test]
    fn test_transition_50_to_200_over_3s() {
        let mut scheduler = CommandScheduler::new(SchedulerConfig::default());
        let device = light(true, Some(50));
        let start = Instant::now();

        let options = TurnOnOptions {
            brightness: Some(200),
            transition: Some(Duration::from_secs(3)),
            ..Default::default()
        };
        let Scheduled::Transition {
            generation,
            interval,
            ..
        } = scheduler.turn_on(&device, options, start)
        else {
            panic!("expected a transition");
        };
        assert_eq!(interval, Duration::from_millis(200));
        assert_eq!(scheduler.pending(), 0);

        let mut writes = Vec::new();
        for tick in 1..=15u32 {
            let outcome = scheduler.transition_tick("light-1", generation, start + interval * tick);
            writes.push(outcome);
            // Drain each tick like the bridge does between ticks
            drain_ready(&mut scheduler);
        }

        assert_eq!(writes.len(), 15);
        assert!(writes[..14]
            .iter()
            .all(|o| matches!(o, TickOutcome::Step { .. })));
        assert_eq!(writes[14], TickOutcome::Finished { brightness: 200 });
        assert_eq!(writes[0], TickOutcome::Step { brightness: 60 });
        assert!(!scheduler.has_transition("light-1"));
        assert_eq!(
            scheduler.transition_tick("light-1", generation, start + Duration::from_secs(4)),
            TickOutcome::Stale
        );
    }

    #[test]
    fn test_late_tick_lands_on_target() {
        let mut scheduler = CommandScheduler::new(SchedulerConfig::default());
        let device = light(true, Some(200));
        let start = Instant::now();

        let Scheduled::Transition { generation, .. } =
            scheduler.turn_off(&device, Some(Duration::from_secs(2)), start)
        else {
            panic!("expected a transition");
        };

        let outcome =
            scheduler.transition_tick("light-1", generation, start + Duration::from_secs(5));
        assert_eq!(outcome, TickOutcome::Finished { brightness: 0 });
        let sent = drain_ready(&mut scheduler);
        assert_eq!(sent[0].command, MeshCommand::TurnOff);
        assert!(sent[0].should_retry);
    }

    #[test]
    fn test_intermediate_steps_not_retried() {
        let mut scheduler = CommandScheduler::new(SchedulerConfig::default());
        let device = light(true, Some(0x10));
        let start = Instant::now();
        let options = TurnOnOptions {
            brightness: Some(0xf0),
            transition: Some(Duration::from_secs(2)),
            ..Default::default()
        };
        let Scheduled::Transition {
            generation,
            interval,
            ..
        } = scheduler.turn_on(&device, options, start)
        else {
            panic!("expected a transition");
        };

        scheduler.transition_tick("light-1", generation, start + interval);
        let sent = drain_ready(&mut scheduler);
        assert_eq!(sent.len(), 1);
        assert!(!sent[0].should_retry);
    }

    #[test]
    fn test_new_command_cancels_transition() {
        let mut scheduler = CommandScheduler::new(SchedulerConfig::default());
        let device = light(true, Some(10));
        let start = Instant::now();
        let ramp = TurnOnOptions {
            brightness: Some(250),
            transition: Some(Duration::from_secs(10)),
            ..Default::default()
        };

        let Scheduled::Transition { generation: old, .. } = scheduler.turn_on(&device, ramp, start)
        else {
            panic!("expected a transition");
        };
        let Scheduled::Transition { generation: new, .. } = scheduler.turn_on(&device, ramp, start)
        else {
            panic!("expected a transition");
        };
        assert_ne!(old, new);
        assert_eq!(
            scheduler.transition_tick("light-1", old, start + Duration::from_secs(1)),
            TickOutcome::Stale
        );

        assert_eq!(scheduler.turn_off(&device, None, start), Scheduled::Queued);
        assert!(!scheduler.has_transition("light-1"));
    }

    #[test]
    fn test_direct_path_conditions() {
        let mut scheduler = CommandScheduler::new(SchedulerConfig::default());
        let now = Instant::now();
        let dim_to = |b| TurnOnOptions {
            brightness: Some(b),
            transition: Some(Duration::from_secs(5)),
            ..Default::default()
        };

        // Off device: origin unknown
        assert_eq!(
            scheduler.turn_on(&light(false, Some(50)), dim_to(200), now),
            Scheduled::Queued
        );
        // Equal endpoints
        assert_eq!(
            scheduler.turn_on(&light(true, Some(200)), dim_to(200), now),
            Scheduled::Queued
        );
        // Short transition left to the firmware
        let short = TurnOnOptions {
            transition: Some(Duration::from_secs(1)),
            ..dim_to(200)
        };
        assert_eq!(
            scheduler.turn_on(&light(true, Some(50)), short, now),
            Scheduled::Queued
        );
        // Not dimmable
        let mut relay = light(true, Some(50));
        relay.dimmable = false;
        assert_eq!(
            scheduler.turn_off(&relay, Some(Duration::from_secs(5)), now),
            Scheduled::Queued
        );
    }

    #[test]
    fn test_command_frames() {
        assert_eq!(
            hex::encode(MeshCommand::TurnOff.to_frame(7).encode()),
            "070110009700"
        );
        assert_eq!(
            hex::encode(MeshCommand::TriggerScene.to_frame(3).encode()),
            "020110002103"
        );
    }
}
