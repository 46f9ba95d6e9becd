use std::collections::VecDeque;

use crate::types::{EventRecord, NotificationKind};

/// Append-only event history that evicts the oldest record past its capacity.
#[derive(Debug, Clone)]
pub struct EventLog {
    records: VecDeque<EventRecord>,
    capacity: usize,
    next_id: u64,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: VecDeque::with_capacity(capacity),
            capacity,
            next_id: 1,
        }
    }

    /// Append a record, assigning the next local sequence number.
    pub fn push(
        &mut self,
        kind: NotificationKind,
        name: impl Into<String>,
        payload: impl Into<String>,
        received_at_ms: u64,
    ) -> u64 {
        let id = self.next_id;
        self.next_id += 1;

        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(EventRecord {
            id,
            kind,
            name: name.into(),
            payload: payload.into(),
            received_at_ms,
        });
        id
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Records in arrival order, oldest first.
    pub fn to_vec(&self) -> Vec<EventRecord> {
        self.records.iter().cloned().collect()
    }

    pub fn latest(&self) -> Option<&EventRecord> {
        self.records.back()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_the_fifty_most_recent_of_sixty_events() {
        let mut log = EventLog::new(50);
        for i in 0..60u64 {
            log.push(
                NotificationKind::TypingReceived,
                "Typing Indicator Received.",
                format!("{{\"n\":{i}}}"),
                1_700_000_000 + i,
            );
        }

        assert_eq!(log.len(), 50);
        let records = log.to_vec();
        assert_eq!(records[0].id, 11);
        assert_eq!(records[0].payload, "{\"n\":10}");
        assert_eq!(records[49].id, 60);
        assert!(records.windows(2).all(|pair| pair[0].id < pair[1].id));
    }

    #[test]
    fn assigns_monotonic_ids_across_evictions() {
        let mut log = EventLog::new(1);
        let first = log.push(NotificationKind::ConnectionUp, "up", "{}", 1);
        let second = log.push(NotificationKind::ConnectionDown, "down", "{}", 2);

        assert!(second > first);
        assert_eq!(log.len(), 1);
        assert_eq!(log.latest().map(|r| r.kind), Some(NotificationKind::ConnectionDown));
    }

    #[test]
    fn zero_capacity_is_clamped_to_one() {
        let log = EventLog::new(0);
        assert_eq!(log.capacity(), 1);
        assert!(log.is_empty());
    }
}
