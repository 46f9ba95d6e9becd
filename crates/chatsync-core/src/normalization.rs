use std::collections::{HashSet, VecDeque};

use serde_json::Value;

use crate::types::{NotificationKind, RawNotification};

/// Number of recent notification keys remembered for deduplication.
pub const DEFAULT_DEDUP_WINDOW: usize = 256;

/// A raw notification mapped onto the fixed notification set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedNotification {
    pub kind: NotificationKind,
    /// Payload serialized for display/audit.
    pub payload: String,
    /// Identity of the notification when the payload carries one.
    pub dedup_key: Option<String>,
}

impl ClassifiedNotification {
    pub fn display_name(&self) -> &'static str {
        self.kind.display_name()
    }
}

/// Classify a raw notification. Returns `None` for unknown event shapes.
pub fn classify_notification(raw: &RawNotification) -> Option<ClassifiedNotification> {
    let kind = NotificationKind::from_wire_name(raw.event_type.trim())?;
    if !(raw.payload.is_object() || raw.payload.is_null()) {
        return None;
    }

    Some(ClassifiedNotification {
        kind,
        payload: raw.payload.to_string(),
        dedup_key: dedup_key(kind, &raw.payload),
    })
}

/// Build a deduplication key from the payload `id` (and `version`, when present).
///
/// Notifications without an `id` are never considered duplicates.
pub fn dedup_key(kind: NotificationKind, payload: &Value) -> Option<String> {
    let id = payload.get("id").and_then(Value::as_str)?;
    let version = payload
        .get("version")
        .map(|version| match version {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        })
        .unwrap_or_default();
    Some(format!("{}:{id}:{version}", kind.wire_name()))
}

/// Sliding window of recently seen notification keys.
#[derive(Debug, Clone)]
pub struct NotificationDeduper {
    order: VecDeque<String>,
    seen: HashSet<String>,
    window: usize,
}

impl Default for NotificationDeduper {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_WINDOW)
    }
}

impl NotificationDeduper {
    pub fn new(window: usize) -> Self {
        Self {
            order: VecDeque::new(),
            seen: HashSet::new(),
            window: window.max(1),
        }
    }

    /// Record `key`; returns `false` when it was already seen inside the window.
    pub fn observe(&mut self, key: &str) -> bool {
        if self.seen.contains(key) {
            return false;
        }

        if self.order.len() == self.window
            && let Some(evicted) = self.order.pop_front()
        {
            self.seen.remove(&evicted);
        }
        self.order.push_back(key.to_owned());
        self.seen.insert(key.to_owned());
        true
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn classifies_known_event_types() {
        let raw = RawNotification::new(
            "chatMessageReceived",
            json!({"id": "m1", "threadId": "t1", "message": "hi", "version": "17"}),
        );

        let classified = classify_notification(&raw).expect("known event should classify");
        assert_eq!(classified.kind, NotificationKind::MessageReceived);
        assert_eq!(classified.display_name(), "Chat Message Received.");
        assert_eq!(
            classified.dedup_key.as_deref(),
            Some("chatMessageReceived:m1:17")
        );
        assert!(classified.payload.contains("\"threadId\":\"t1\""));
    }

    #[test]
    fn drops_unknown_event_types_and_malformed_payloads() {
        assert_eq!(
            classify_notification(&RawNotification::new("chatMessageReacted", json!({}))),
            None
        );
        assert_eq!(
            classify_notification(&RawNotification::new("chatMessageReceived", json!([1, 2]))),
            None
        );
    }

    #[test]
    fn connection_events_classify_without_payload() {
        let classified = classify_notification(&RawNotification::new(
            "realTimeNotificationConnected",
            Value::Null,
        ))
        .expect("connection event should classify");
        assert_eq!(classified.kind, NotificationKind::ConnectionUp);
        assert_eq!(classified.dedup_key, None);
    }

    #[test]
    fn deduper_rejects_repeats_inside_window_only() {
        let mut deduper = NotificationDeduper::new(2);
        assert!(deduper.observe("a"));
        assert!(!deduper.observe("a"));
        assert!(deduper.observe("b"));
        assert!(deduper.observe("c"));
        assert!(deduper.observe("a"));
    }
}
