/*!
 * Checkpoint Timing
 * When to cut, and where events land relative to the cut
 */

use crate::config::CheckpointConfig;
use crate::events::Event;
use std::time::Instant;

/// Decides when the refinery takes the next consistent cut
#[derive(Debug)]
pub struct CheckpointClock {
    config: CheckpointConfig,
    last_rollover: Instant,
    first: bool,
    events: usize,
}

impl CheckpointClock {
    pub fn new(config: CheckpointConfig, now: Instant) -> Self {
        Self {
            config,
            last_rollover: now,
            first: true,
            events: 0,
        }
    }

    /// Count events accepted since the last rollover
    #[inline]
    pub fn record(&mut self, events: usize) {
        self.events += events;
    }

    /// True once either the duration or the event count is exceeded
    pub fn is_due(&self, now: Instant) -> bool {
        if !self.config.enabled {
            return false;
        }
        let duration = if self.first {
            self.config.initial_duration
        } else {
            self.config.duration
        };
        now.saturating_duration_since(self.last_rollover) >= duration
            || self.events >= self.config.event_count
    }

    /// Restart both windows after a checkpoint
    pub fn rolled_over(&mut self, now: Instant) {
        self.last_rollover = now;
        self.first = false;
        self.events = 0;
    }

    #[inline]
    pub fn pending_events(&self) -> usize {
        self.events
    }
}

/// Stable partition of `events` into those before `cut` and the rest
pub fn split_at_cut(events: Vec<Event>, cut: u64) -> (Vec<Event>, Vec<Event>) {
    events.into_iter().partition(|event| event.nanos < cut)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use proptest::prelude::*;
    use std::time::Duration;

    fn config(initial_ms: u64, ms: u64, count: usize) -> CheckpointConfig {
        CheckpointConfig {
            enabled: true,
            initial_duration: Duration::from_millis(initial_ms),
            duration: Duration::from_millis(ms),
            event_count: count,
        }
    }

    #[test]
    fn test_initial_then_regular_duration() {
        let start = Instant::now();
        let mut clock = CheckpointClock::new(config(100, 300, 1_000), start);

        assert!(!clock.is_due(start + Duration::from_millis(99)));
        assert!(clock.is_due(start + Duration::from_millis(100)));

        let rolled = start + Duration::from_millis(100);
        clock.rolled_over(rolled);
        assert!(!clock.is_due(rolled + Duration::from_millis(200)));
        assert!(clock.is_due(rolled + Duration::from_millis(300)));
    }

    #[test]
    fn test_event_count_triggers() {
        let start = Instant::now();
        let mut clock = CheckpointClock::new(config(60_000, 60_000, 10), start);
        clock.record(9);
        assert!(!clock.is_due(start));
        clock.record(1);
        assert!(clock.is_due(start));
        clock.rolled_over(start);
        assert_eq!(clock.pending_events(), 0);
    }

    #[test]
    fn test_disabled_never_due() {
        let start = Instant::now();
        let mut cfg = config(1, 1, 1);
        cfg.enabled = false;
        let mut clock = CheckpointClock::new(cfg, start);
        clock.record(100);
        assert!(!clock.is_due(start + Duration::from_secs(10)));
    }

    proptest! {
        #[test]
        fn split_is_a_stable_partition(stamps in prop::collection::vec(0u64..1_000, 0..200), cut in 0u64..1_000) {
            let events: Vec<Event> = stamps
                .iter()
                .enumerate()
                .map(|(i, &n)| Event::at(n, EventKind::GarbageCollected { object: crate::core::types::SurrogateId(i as u64) }))
                .collect();

            let (before, after) = split_at_cut(events.clone(), cut);
            prop_assert!(before.iter().all(|e| e.nanos < cut));
            prop_assert!(after.iter().all(|e| e.nanos >= cut));
            prop_assert_eq!(before.len() + after.len(), events.len());

            let expected_before: Vec<&Event> = events.iter().filter(|e| e.nanos < cut).collect();
            prop_assert_eq!(before.iter().collect::<Vec<_>>(), expected_before);
        }
    }
}
