use std::collections::VecDeque;

use shared::protocol::SyncEvent;

pub const DEFAULT_EVENT_LOG_MAX: usize = 500;
pub const DEFAULT_EVENT_LOG_KEEP: usize = 300;

/// Size policy for the event log: once an append pushes the length past
/// `max`, everything but the newest `keep` entries is discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventLogLimits {
    max: usize,
    keep: usize,
}

impl EventLogLimits {
    /// `max` is at least one and `keep` never exceeds `max`.
    pub fn new(max: usize, keep: usize) -> Self {
        let max = max.max(1);
        Self {
            max,
            keep: keep.min(max),
        }
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn keep(&self) -> usize {
        self.keep
    }
}

impl Default for EventLogLimits {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_LOG_MAX, DEFAULT_EVENT_LOG_KEEP)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    Truncated { dropped: usize },
}

/// Append-only, bounded, server-ordered log of sync events.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    entries: VecDeque<SyncEvent>,
    limits: EventLogLimits,
}

impl EventLog {
    pub fn new(limits: EventLogLimits) -> Self {
        Self {
            entries: VecDeque::with_capacity(limits.max() + 1),
            limits,
        }
    }

    pub fn push(&mut self, event: SyncEvent) -> AppendOutcome {
        self.entries.push_back(event);
        if self.entries.len() <= self.limits.max() {
            return AppendOutcome::Appended;
        }
        let dropped = self.entries.len() - self.limits.keep();
        self.entries.drain(..dropped);
        AppendOutcome::Truncated { dropped }
    }

    /// Appends historical events under the same size policy; returns the resulting length.
    pub fn seed(&mut self, events: impl IntoIterator<Item = SyncEvent>) -> usize {
        for event in events {
            self.push(event);
        }
        self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn limits(&self) -> EventLogLimits {
        self.limits
    }

    pub fn iter(&self) -> impl Iterator<Item = &SyncEvent> {
        self.entries.iter()
    }

    pub fn to_vec(&self) -> Vec<SyncEvent> {
        self.entries.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use shared::protocol::EventLevel;

    use super::*;

    fn event(n: usize) -> SyncEvent {
        SyncEvent {
            timestamp: Utc.timestamp_opt(1_700_000_000 + n as i64, 0).unwrap(),
            level: EventLevel::Info,
            message: format!("event {n}"),
            town: None,
            season: None,
            phase: None,
        }
    }

    fn messages(log: &EventLog) -> Vec<String> {
        log.iter().map(|event| event.message.clone()).collect()
    }

    #[test]
    fn keeps_append_order_under_the_cap() {
        let mut log = EventLog::default();
        for n in 1..=5 {
            assert_eq!(log.push(event(n)), AppendOutcome::Appended);
        }
        assert_eq!(
            messages(&log),
            vec!["event 1", "event 2", "event 3", "event 4", "event 5"]
        );
    }

    #[test]
    fn truncates_to_recent_tail_once_max_is_exceeded() {
        let mut log = EventLog::default();
        let mut max_seen = 0;
        let mut truncations = Vec::new();
        for n in 1..=600 {
            if let AppendOutcome::Truncated { dropped } = log.push(event(n)) {
                truncations.push((n, dropped, log.len()));
            }
            max_seen = max_seen.max(log.len());
        }

        assert!(max_seen <= DEFAULT_EVENT_LOG_MAX);
        assert_eq!(truncations, vec![(501, 201, 300)]);
        assert_eq!(log.len(), 399);
        assert_eq!(log.iter().next().map(|e| e.message.as_str()), Some("event 202"));
        let all = messages(&log);
        assert_eq!(all.last().map(String::as_str), Some("event 600"));
        let expected: Vec<String> = (202..=600).map(|n| format!("event {n}")).collect();
        assert_eq!(all, expected);
    }

    #[test]
    fn limits_never_keep_more_than_max() {
        let limits = EventLogLimits::new(10, 50);
        assert_eq!(limits.keep(), 10);
        let limits = EventLogLimits::new(0, 0);
        assert_eq!(limits.max(), 1);
        assert_eq!(limits.keep(), 0);
    }

    #[test]
    fn seeding_applies_the_same_policy() {
        let mut log = EventLog::new(EventLogLimits::new(4, 2));
        let len = log.seed((1..=5).map(event));
        assert_eq!(len, 2);
        assert_eq!(messages(&log), vec!["event 4", "event 5"]);
    }
}
