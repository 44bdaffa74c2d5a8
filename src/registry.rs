/*!
 # Channel registry

 The single source of truth for channel state. The registry owns every
 [`Channel`] for the life of the process; the device link and any
 presentation layer only ever see bitmask snapshots or borrowed views.

 Channel ids run 1..N. Handing the registry an id outside that range is a
 programming error and panics; callers validate operator input first.
*/

use tracing::{debug, warn};

use crate::config::{ChannelRecord, ConfigError, MAX_CHANNELS};
use crate::schedule::{self, Phase, Schedule, ScheduleError, TimeOfDay};

/// One addressable relay output.
#[derive(Debug, Clone)]
pub struct Channel {
    /// Channel id, 1..N, fixed at creation
    pub id: u8,
    /// Operator-chosen name
    pub label: String,
    /// Last explicit operator-set on/off value
    pub manual_state: bool,
    /// Daily on/off window, if one has been entered
    pub schedule: Option<Schedule>,
    /// The value actually driving the physical relay
    pub effective_state: bool,
    /// Scheduling status shown to the operator
    pub phase: Phase,
}

impl Channel {
    fn new(id: u8) -> Self {
        Channel {
            id,
            label: String::new(),
            manual_state: false,
            schedule: None,
            effective_state: false,
            phase: Phase::Unset,
        }
    }

    /// Back to defaults, keeping the id.
    fn reset(&mut self) {
        self.label.clear();
        self.manual_state = false;
        self.schedule = None;
        self.effective_state = false;
        self.phase = Phase::Unset;
    }

    fn record(&self) -> ChannelRecord {
        let schedule = self.schedule.unwrap_or_else(Schedule::unset);
        ChannelRecord {
            label: self.label.clone(),
            schedule_enabled: schedule.enabled,
            start_hour: schedule.start.hour,
            start_minute: schedule.start.minute,
            end_hour: schedule.end.hour,
            end_minute: schedule.end.minute,
        }
    }
}

/// Result of one scheduler pass over the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickOutcome {
    /// Bitmask after the pass, channel `i` → bit `i-1`
    pub mask: u8,
    /// Whether the mask differs from before the pass
    pub changed: bool,
}

/// Fixed-size collection of channels, indexed 1..N.
pub struct ChannelRegistry {
    channels: Vec<Channel>,
}

impl ChannelRegistry {
    /// Creates `channel_count` channels in their default state.
    ///
    /// # Panics
    ///
    /// Panics if `channel_count` is outside 1..=8; the configuration layer
    /// clamps operator input before it gets here.
    pub fn new(channel_count: u8) -> Self {
        assert!(
            (1..=MAX_CHANNELS).contains(&channel_count),
            "channel count {channel_count} outside 1..={MAX_CHANNELS}"
        );
        ChannelRegistry {
            channels: (1..=channel_count).map(Channel::new).collect(),
        }
    }

    pub fn channel_count(&self) -> u8 {
        self.channels.len() as u8
    }

    /// Looks up a channel by id; `None` outside 1..N.
    pub fn get(&self, id: u8) -> Option<&Channel> {
        if id == 0 {
            return None;
        }
        self.channels.get(usize::from(id) - 1)
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    fn channel_mut(&mut self, id: u8) -> &mut Channel {
        let count = self.channel_count();
        assert!(
            id >= 1 && id <= count,
            "channel id {id} outside 1..={count}"
        );
        &mut self.channels[usize::from(id) - 1]
    }

    /// Applies an explicit operator toggle and returns the resulting
    /// effective state. Takes effect immediately; an enabled schedule
    /// re-asserts its own state on the next tick.
    pub fn set_manual(&mut self, id: u8, on: bool) -> bool {
        let channel = self.channel_mut(id);
        channel.manual_state = on;
        channel.effective_state = on;
        debug!(channel = id, on, "manual toggle");
        channel.effective_state
    }

    /// Flips a channel relative to its current effective state.
    pub fn toggle(&mut self, id: u8) -> bool {
        let current = self.channel_mut(id).effective_state;
        self.set_manual(id, !current)
    }

    /// Switches every channel at once and returns the new mask.
    pub fn set_all(&mut self, on: bool) -> u8 {
        for channel in &mut self.channels {
            channel.manual_state = on;
            channel.effective_state = on;
        }
        debug!(on, "all channels switched");
        self.snapshot()
    }

    pub fn set_label(&mut self, id: u8, label: impl Into<String>) {
        self.channel_mut(id).label = label.into();
    }

    /// Stores a schedule window for a channel.
    ///
    /// Arming goes through validation: a window that fails keeps its entered
    /// times but has `enabled` forced off, and the specific error is
    /// returned so the operator can be told why.
    pub fn set_schedule(&mut self, id: u8, sched: Schedule) -> Result<(), ScheduleError> {
        let channel = self.channel_mut(id);
        if sched.enabled {
            if let Err(err) = schedule::validate(&sched) {
                channel.schedule = Some(sched.disabled());
                channel.phase = Phase::Unset;
                return Err(err);
            }
            channel.schedule = Some(sched);
            channel.phase = Phase::Armed;
        } else {
            channel.schedule = Some(sched);
            channel.phase = Phase::Unset;
        }
        Ok(())
    }

    /// Runs the schedule evaluator over every channel with an enabled
    /// window. All channels are evaluated before the caller pushes a single
    /// coalesced mask to the device.
    pub fn apply_schedule_tick(&mut self, now: TimeOfDay) -> TickOutcome {
        let before = self.snapshot();
        for channel in &mut self.channels {
            let Some(sched) = channel.schedule else {
                continue;
            };
            if !sched.enabled {
                channel.phase = Phase::Unset;
                continue;
            }
            match schedule::validate(&sched) {
                Ok(valid) => {
                    let (phase, desired_on) = schedule::evaluate(now, &valid);
                    if phase != channel.phase {
                        debug!(
                            channel = channel.id,
                            from = %channel.phase,
                            to = %phase,
                            "schedule phase change"
                        );
                    }
                    channel.phase = phase;
                    channel.effective_state = desired_on;
                }
                Err(err) => {
                    // Enabled schedules are validated at every boundary, so
                    // this only fires if persisted state was tampered with.
                    warn!(channel = channel.id, %err, "disabling invalid schedule");
                    channel.schedule = Some(sched.disabled());
                    channel.phase = Phase::Unset;
                }
            }
        }
        let mask = self.snapshot();
        TickOutcome {
            mask,
            changed: mask != before,
        }
    }

    /// Current effective states as a device bitmask, channel `i` → bit
    /// `i-1`.
    pub fn snapshot(&self) -> u8 {
        self.channels
            .iter()
            .enumerate()
            .fold(0u8, |mask, (index, channel)| {
                if channel.effective_state {
                    mask | 1 << index
                } else {
                    mask
                }
            })
    }

    /// Overwrites on/off state from a device status mask, e.g. to pick up
    /// the hardware's power-on state right after open.
    pub fn adopt_mask(&mut self, mask: u8) {
        for (index, channel) in self.channels.iter_mut().enumerate() {
            let on = mask >> index & 1 == 1;
            channel.manual_state = on;
            channel.effective_state = on;
        }
        debug!(mask = format_args!("{mask:#010b}"), "adopted device mask");
    }

    /// Applies persisted channel records.
    ///
    /// A shorter array leaves the remaining channels at defaults; extra
    /// records are ignored. Every record is applied even when its schedule
    /// is invalid — such a schedule is stored disabled and the first
    /// rejection is returned so the caller can report it.
    pub fn load(&mut self, records: &[ChannelRecord]) -> Result<(), ConfigError> {
        let mut first_rejection = None;
        for channel in &mut self.channels {
            channel.reset();
        }
        for (channel, record) in self.channels.iter_mut().zip(records) {
            channel.label = record.label.clone();
            let sched = Schedule {
                start: TimeOfDay::new(record.start_hour, record.start_minute),
                end: TimeOfDay::new(record.end_hour, record.end_minute),
                enabled: record.schedule_enabled,
            };
            if sched.enabled {
                if let Err(err) = schedule::validate(&sched) {
                    warn!(channel = channel.id, %err, "stored schedule rejected");
                    channel.schedule = Some(sched.disabled());
                    channel.phase = Phase::Unset;
                    first_rejection.get_or_insert(ConfigError::InvalidSchedule {
                        channel: channel.id,
                        source: err,
                    });
                    continue;
                }
                channel.schedule = Some(sched);
                channel.phase = Phase::Armed;
            } else {
                channel.schedule = Some(sched);
            }
        }
        match first_rejection {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// The persisted form of every channel, in id order.
    pub fn records(&self) -> Vec<ChannelRecord> {
        self.channels.iter().map(Channel::record).collect()
    }

    /// Resets every channel to defaults without touching ids.
    pub fn clear_all(&mut self) {
        for channel in &mut self.channels {
            channel.reset();
        }
        debug!("registry cleared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(start: (u8, u8), end: (u8, u8)) -> Schedule {
        Schedule {
            start: TimeOfDay::new(start.0, start.1),
            end: TimeOfDay::new(end.0, end.1),
            enabled: true,
        }
    }

    #[test]
    fn snapshot_maps_channel_to_bit() {
        let mut registry = ChannelRegistry::new(8);
        registry.set_manual(1, true);
        registry.set_manual(3, true);
        assert_eq!(registry.snapshot(), 0b0000_0101);
    }

    #[test]
    fn get_outside_range_is_none() {
        let registry = ChannelRegistry::new(4);
        assert!(registry.get(0).is_none());
        assert!(registry.get(5).is_none());
        assert_eq!(registry.get(4).map(|c| c.id), Some(4));
    }

    #[test]
    #[should_panic(expected = "channel id")]
    fn mutating_outside_range_panics() {
        let mut registry = ChannelRegistry::new(4);
        registry.set_manual(5, true);
    }

    #[test]
    fn scheduled_channel_follows_its_window() {
        let mut registry = ChannelRegistry::new(8);
        registry.set_schedule(3, window((8, 0), (8, 30))).unwrap();

        let outcome = registry.apply_schedule_tick(TimeOfDay::new(8, 0));
        assert!(outcome.changed);
        assert_eq!(outcome.mask, 0b0000_0100);
        let channel = registry.get(3).unwrap();
        assert!(channel.effective_state);
        assert_eq!(channel.phase, Phase::Active);

        let outcome = registry.apply_schedule_tick(TimeOfDay::new(8, 30));
        assert!(outcome.changed);
        assert_eq!(outcome.mask, 0);
        let channel = registry.get(3).unwrap();
        assert!(!channel.effective_state);
        assert_eq!(channel.phase, Phase::Armed);
    }

    #[test]
    fn unscheduled_channel_survives_ticks() {
        let mut registry = ChannelRegistry::new(8);
        registry.set_manual(5, true);
        let outcome = registry.apply_schedule_tick(TimeOfDay::new(12, 0));
        assert!(!outcome.changed);
        assert!(registry.get(5).unwrap().effective_state);
    }

    #[test]
    fn schedule_reasserts_over_manual_toggle_on_tick() {
        let mut registry = ChannelRegistry::new(8);
        registry.set_schedule(2, window((8, 0), (9, 0))).unwrap();
        registry.apply_schedule_tick(TimeOfDay::new(8, 10));
        assert!(registry.get(2).unwrap().effective_state);

        // Manual off takes immediate effect, then the next tick inside the
        // window turns the channel back on.
        assert!(!registry.set_manual(2, false));
        let outcome = registry.apply_schedule_tick(TimeOfDay::new(8, 20));
        assert!(outcome.changed);
        assert!(registry.get(2).unwrap().effective_state);
    }

    #[test]
    fn repeated_ticks_are_idempotent() {
        let mut registry = ChannelRegistry::new(8);
        registry.set_schedule(1, window((10, 0), (11, 0))).unwrap();
        registry.apply_schedule_tick(TimeOfDay::new(10, 30));
        let outcome = registry.apply_schedule_tick(TimeOfDay::new(10, 31));
        assert!(!outcome.changed);
    }

    #[test]
    fn arming_an_invalid_window_is_rejected() {
        let mut registry = ChannelRegistry::new(8);
        let err = registry.set_schedule(1, window((9, 0), (9, 0))).unwrap_err();
        assert_eq!(err, ScheduleError::SameTime);
        let channel = registry.get(1).unwrap();
        assert!(!channel.schedule.unwrap().enabled);
        assert_eq!(channel.phase, Phase::Unset);
    }

    #[test]
    fn set_all_switches_every_channel() {
        let mut registry = ChannelRegistry::new(4);
        assert_eq!(registry.set_all(true), 0b0000_1111);
        assert_eq!(registry.set_all(false), 0);
    }

    #[test]
    fn adopt_mask_overwrites_state() {
        let mut registry = ChannelRegistry::new(8);
        registry.adopt_mask(0b1000_0001);
        assert!(registry.get(1).unwrap().effective_state);
        assert!(registry.get(8).unwrap().effective_state);
        assert!(!registry.get(2).unwrap().effective_state);
        assert_eq!(registry.snapshot(), 0b1000_0001);
    }

    #[test]
    fn records_round_trip_through_load() {
        let mut registry = ChannelRegistry::new(3);
        registry.set_label(1, "pump");
        registry.set_schedule(1, window((8, 0), (8, 30))).unwrap();
        registry.set_schedule(2, window((22, 0), (6, 0)).disabled()).unwrap();
        let records = registry.records();

        let mut reloaded = ChannelRegistry::new(3);
        reloaded.load(&records).unwrap();
        assert_eq!(reloaded.records(), records);
        assert_eq!(reloaded.get(1).unwrap().phase, Phase::Armed);
        assert_eq!(reloaded.get(2).unwrap().phase, Phase::Unset);
    }

    #[test]
    fn short_record_array_leaves_rest_at_defaults() {
        let mut registry = ChannelRegistry::new(8);
        let records = vec![ChannelRecord {
            label: "first".into(),
            ..ChannelRecord::default()
        }];
        registry.load(&records).unwrap();
        assert_eq!(registry.get(1).unwrap().label, "first");
        assert_eq!(registry.get(2).unwrap().label, "");
        assert!(registry.get(8).unwrap().schedule.is_none());
    }

    #[test]
    fn extra_records_are_ignored() {
        let mut registry = ChannelRegistry::new(2);
        let records: Vec<_> = (0..5)
            .map(|i| ChannelRecord {
                label: format!("ch{i}"),
                ..ChannelRecord::default()
            })
            .collect();
        registry.load(&records).unwrap();
        assert_eq!(registry.channel_count(), 2);
        assert_eq!(registry.get(2).unwrap().label, "ch1");
    }

    #[test]
    fn invalid_stored_schedule_is_disabled_and_reported() {
        let mut registry = ChannelRegistry::new(2);
        let records = vec![ChannelRecord {
            label: "broken".into(),
            schedule_enabled: true,
            start_hour: 9,
            start_minute: 0,
            end_hour: 9,
            end_minute: 0,
        }];
        let err = registry.load(&records).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidSchedule {
                channel: 1,
                source: ScheduleError::SameTime
            }
        );
        // Loaded anyway, with the schedule forced off.
        let channel = registry.get(1).unwrap();
        assert_eq!(channel.label, "broken");
        assert!(!channel.schedule.unwrap().enabled);
    }

    #[test]
    fn clear_all_resets_everything_but_ids() {
        let mut registry = ChannelRegistry::new(4);
        registry.set_label(2, "fan");
        registry.set_manual(2, true);
        registry.set_schedule(3, window((8, 0), (9, 0))).unwrap();
        registry.clear_all();
        for channel in registry.channels() {
            assert!(channel.label.is_empty());
            assert!(!channel.manual_state);
            assert!(!channel.effective_state);
            assert!(channel.schedule.is_none());
            assert_eq!(channel.phase, Phase::Unset);
        }
        assert_eq!(registry.get(3).unwrap().id, 3);
    }
}
