use std::collections::HashSet;

use crate::types::Message;

/// In-memory message list ordered by creation time with bounded retention.
#[derive(Debug, Clone)]
pub struct MessageTimeline {
    items: Vec<Message>,
    max_items: usize,
}

impl MessageTimeline {
    /// Create a timeline with an item cap (`max_items >= 1`).
    pub fn new(max_items: usize) -> Self {
        Self {
            items: Vec::new(),
            max_items: max_items.max(1),
        }
    }

    /// Current messages, oldest first.
    pub fn items(&self) -> &[Message] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.items.iter().any(|message| message.id == message_id)
    }

    /// Replace the whole list with an authoritative reload result.
    ///
    /// Input order is irrelevant. Duplicate IDs keep the last occurrence, the
    /// result is sorted by creation time (ties keep input order) and only the
    /// most recent `max_items` are retained.
    pub fn replace_all(&mut self, items: Vec<Message>) {
        let mut seen = HashSet::new();
        let mut deduped: Vec<Message> = items
            .into_iter()
            .rev()
            .filter(|message| seen.insert(message.id.clone()))
            .collect();
        deduped.reverse();
        deduped.sort_by_key(|message| message.created_at_ms);

        self.items = deduped;
        self.trim_to_max();
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    fn trim_to_max(&mut self) {
        if self.items.len() <= self.max_items {
            return;
        }

        let excess = self.items.len() - self.max_items;
        self.items.drain(0..excess);
    }
}
