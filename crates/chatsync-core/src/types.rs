use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// String key/value metadata attached to threads, messages and participants.
pub type Metadata = BTreeMap<String, String>;

/// How the service decides when to delete a thread.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum RetentionKind {
    /// Counted from the thread creation date.
    ThreadCreationDate,
}

/// Thread retention policy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RetentionPolicy {
    pub kind: RetentionKind,
    pub delete_thread_after_days: u32,
}

impl RetentionPolicy {
    /// Retention counted from thread creation.
    pub fn thread_creation_date(days: u32) -> Self {
        Self {
            kind: RetentionKind::ThreadCreationDate,
            delete_thread_after_days: days,
        }
    }
}

/// Conversation container as last acknowledged by the service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Thread {
    /// Service-assigned thread ID.
    pub id: String,
    pub topic: String,
    pub metadata: Metadata,
    /// `None` when the thread has no retention policy.
    pub retention_policy: Option<RetentionPolicy>,
}

/// Caller-side reference to the thread a command targets.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ThreadHandle {
    thread_id: String,
}

impl ThreadHandle {
    pub fn new(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
        }
    }

    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }
}

/// Message kind reported by the service.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum MessageType {
    /// Message sent by a participant.
    Text,
    /// Service-generated message (topic changed, participant added, ...).
    System,
}

/// Chat message as listed by the service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Service-assigned message ID.
    pub id: String,
    pub content: String,
    /// Absent for system messages.
    pub sender_display_name: Option<String>,
    pub message_type: MessageType,
    pub metadata: Metadata,
    /// Creation timestamp in milliseconds since Unix epoch.
    pub created_at_ms: u64,
}

/// Thread participant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    /// Communication identity of the participant.
    pub id: String,
    pub display_name: Option<String>,
    pub metadata: Metadata,
}

/// Three-state field update used by partial thread property updates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Patch<T> {
    /// Leave the field unchanged.
    Keep,
    /// Explicitly clear the field.
    Clear,
    /// Replace the field value.
    Set(T),
}

impl<T> Default for Patch<T> {
    fn default() -> Self {
        Patch::Keep
    }
}

impl<T: Clone> Patch<T> {
    /// Apply this patch to an optional field.
    pub fn apply_to(&self, field: &mut Option<T>) {
        match self {
            Patch::Keep => {}
            Patch::Clear => *field = None,
            Patch::Set(value) => *field = Some(value.clone()),
        }
    }

    pub fn is_keep(&self) -> bool {
        matches!(self, Patch::Keep)
    }
}

/// Partial update of thread properties. Omitted fields stay unchanged server-side.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ThreadPropertiesPatch {
    pub topic: Option<String>,
    pub metadata: Option<Metadata>,
    pub retention_policy: Patch<RetentionPolicy>,
}

impl ThreadPropertiesPatch {
    pub fn topic(topic: impl Into<String>) -> Self {
        Self {
            topic: Some(topic.into()),
            ..Self::default()
        }
    }

    pub fn metadata(metadata: Metadata) -> Self {
        Self {
            metadata: Some(metadata),
            ..Self::default()
        }
    }

    /// `None` clears the policy.
    pub fn retention_policy(policy: Option<RetentionPolicy>) -> Self {
        Self {
            retention_policy: match policy {
                Some(policy) => Patch::Set(policy),
                None => Patch::Clear,
            },
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.topic.is_none() && self.metadata.is_none() && self.retention_policy.is_keep()
    }

    /// Apply the acknowledged patch to local thread state.
    pub fn apply_to(&self, thread: &mut Thread) {
        if let Some(topic) = &self.topic {
            thread.topic = topic.clone();
        }
        if let Some(metadata) = &self.metadata {
            thread.metadata = metadata.clone();
        }
        self.retention_policy.apply_to(&mut thread.retention_policy);
    }
}

/// Resources that can be reloaded from the service.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Messages,
    Participants,
}

/// Fixed set of push notification classes understood by the ingestor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    ConnectionUp,
    ConnectionDown,
    ThreadCreated,
    ThreadPropertiesUpdated,
    ThreadDeleted,
    MessageReceived,
    MessageEdited,
    MessageDeleted,
    TypingReceived,
    ReadReceiptReceived,
    ParticipantsAdded,
    ParticipantsRemoved,
}

impl NotificationKind {
    pub const ALL: [NotificationKind; 12] = [
        NotificationKind::ConnectionUp,
        NotificationKind::ConnectionDown,
        NotificationKind::ThreadCreated,
        NotificationKind::ThreadPropertiesUpdated,
        NotificationKind::ThreadDeleted,
        NotificationKind::MessageReceived,
        NotificationKind::MessageEdited,
        NotificationKind::MessageDeleted,
        NotificationKind::TypingReceived,
        NotificationKind::ReadReceiptReceived,
        NotificationKind::ParticipantsAdded,
        NotificationKind::ParticipantsRemoved,
    ];

    /// Event type name used by the chat service on the wire.
    pub fn wire_name(self) -> &'static str {
        match self {
            NotificationKind::ConnectionUp => "realTimeNotificationConnected",
            NotificationKind::ConnectionDown => "realTimeNotificationDisconnected",
            NotificationKind::ThreadCreated => "chatThreadCreated",
            NotificationKind::ThreadPropertiesUpdated => "chatThreadPropertiesUpdated",
            NotificationKind::ThreadDeleted => "chatThreadDeleted",
            NotificationKind::MessageReceived => "chatMessageReceived",
            NotificationKind::MessageEdited => "chatMessageEdited",
            NotificationKind::MessageDeleted => "chatMessageDeleted",
            NotificationKind::TypingReceived => "typingIndicatorReceived",
            NotificationKind::ReadReceiptReceived => "readReceiptReceived",
            NotificationKind::ParticipantsAdded => "participantsAdded",
            NotificationKind::ParticipantsRemoved => "participantsRemoved",
        }
    }

    pub fn from_wire_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.wire_name() == name)
    }

    /// Human-readable label recorded in the event log.
    pub fn display_name(self) -> &'static str {
        match self {
            NotificationKind::ConnectionUp => "Real-Time Notification Connected",
            NotificationKind::ConnectionDown => "Real-Time Notification Disconnected",
            NotificationKind::ThreadCreated => "Chat Thread Created.",
            NotificationKind::ThreadPropertiesUpdated => "Chat Thread Properties Updated.",
            NotificationKind::ThreadDeleted => "Chat Thread Deleted.",
            NotificationKind::MessageReceived => "Chat Message Received.",
            NotificationKind::MessageEdited => "Chat Message Edited.",
            NotificationKind::MessageDeleted => "Chat Message Deleted.",
            NotificationKind::TypingReceived => "Typing Indicator Received.",
            NotificationKind::ReadReceiptReceived => "Read Receipt Received.",
            NotificationKind::ParticipantsAdded => "Participants Added.",
            NotificationKind::ParticipantsRemoved => "Participants Removed.",
        }
    }

    /// Resource whose authoritative list must be reloaded after this notification.
    pub fn affected_resource(self) -> Option<ResourceKind> {
        match self {
            NotificationKind::MessageReceived
            | NotificationKind::MessageEdited
            | NotificationKind::MessageDeleted => Some(ResourceKind::Messages),
            NotificationKind::ParticipantsAdded | NotificationKind::ParticipantsRemoved => {
                Some(ResourceKind::Participants)
            }
            _ => None,
        }
    }

    /// Connection flag implied by this notification, if any.
    pub fn connection_state(self) -> Option<bool> {
        match self {
            NotificationKind::ConnectionUp => Some(true),
            NotificationKind::ConnectionDown => Some(false),
            _ => None,
        }
    }
}

/// Push notification exactly as delivered by the service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawNotification {
    pub event_type: String,
    pub payload: serde_json::Value,
}

impl RawNotification {
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
        }
    }
}

/// One entry of the bounded event history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventRecord {
    /// Monotonic local sequence number.
    pub id: u64,
    pub kind: NotificationKind,
    pub name: String,
    /// Raw payload serialized as JSON text.
    pub payload: String,
    pub received_at_ms: u64,
}

/// Thread lifecycle phase tracked by the store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ThreadPhase {
    /// No thread exists in this session.
    NoThread,
    /// A create request is pending.
    Creating,
    /// A thread is active and accepts thread-scoped commands.
    Active,
    /// A delete request is pending.
    Deleting,
}

/// Immutable view of the session published after every store mutation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionSnapshot {
    /// Monotonic snapshot version; bumped once per mutation.
    pub version: u64,
    pub connected: bool,
    pub thread_phase: ThreadPhase,
    pub thread: Option<Thread>,
    /// Messages ordered by creation time, oldest first.
    pub messages: Vec<Message>,
    pub participants: Vec<Participant>,
    /// Event history, oldest first.
    pub events: Vec<EventRecord>,
    pub last_added_participant: Option<String>,
    /// Current message targeted by update/delete/read-receipt commands.
    pub message_id: Option<String>,
    /// Sent message not yet observed in a message reload.
    pub pending_message_id: Option<String>,
    pub name_rotation_index: usize,
}

impl SessionSnapshot {
    pub fn thread_handle(&self) -> Option<ThreadHandle> {
        self.thread
            .as_ref()
            .map(|thread| ThreadHandle::new(thread.id.clone()))
    }

    pub fn has_participant(&self, participant_id: &str) -> bool {
        self.participants
            .iter()
            .any(|participant| participant.id == participant_id)
    }
}

/// Tuning values for a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SessionConfig {
    /// Capacity of the event history ring buffer.
    pub event_log_capacity: usize,
    /// Most-recent message count retained in the message list.
    pub message_limit: usize,
    /// Delay applied before post-command and post-event reloads.
    pub refresh_delay_ms: u64,
    /// Ordered name pool used for synthetic participants.
    pub name_pool: Vec<String>,
}

pub const DEFAULT_EVENT_LOG_CAPACITY: usize = 50;
pub const DEFAULT_MESSAGE_LIMIT: usize = 100;
pub const DEFAULT_NAME_POOL: [&str; 5] = ["Sue", "Bob", "Alice", "Carol", "Dave"];

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            event_log_capacity: DEFAULT_EVENT_LOG_CAPACITY,
            message_limit: DEFAULT_MESSAGE_LIMIT,
            refresh_delay_ms: 0,
            name_pool: DEFAULT_NAME_POOL.iter().map(|name| (*name).to_owned()).collect(),
        }
    }
}

/// User intent accepted by the session runtime.
///
/// Thread-scoped commands target the currently active thread.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SessionCommand {
    CreateThread {
        topic: String,
        retention_policy: Option<RetentionPolicy>,
    },
    UpdateTopic {
        topic: String,
    },
    UpdateMetadata {
        metadata: Metadata,
    },
    /// `None` clears the policy.
    UpdateRetentionPolicy {
        retention_policy: Option<RetentionPolicy>,
    },
    DeleteThread,
    SendMessage {
        content: String,
        sender_display_name: String,
        metadata: Metadata,
    },
    UpdateMessage {
        content: Option<String>,
        metadata: Option<Metadata>,
    },
    DeleteMessage,
    SendTypingNotification,
    SendReadReceipt,
    AddParticipant {
        identity: String,
        display_name: Option<String>,
        metadata: Metadata,
    },
    /// Issue a fresh identity and add it under the next rotation name.
    AddSyntheticParticipant,
    RemoveParticipant {
        identity: String,
    },
    RemoveLastParticipant,
}

impl SessionCommand {
    /// Stable label used in logs and command outcomes.
    pub fn label(&self) -> &'static str {
        match self {
            SessionCommand::CreateThread { .. } => "create_thread",
            SessionCommand::UpdateTopic { .. } => "update_topic",
            SessionCommand::UpdateMetadata { .. } => "update_metadata",
            SessionCommand::UpdateRetentionPolicy { .. } => "update_retention_policy",
            SessionCommand::DeleteThread => "delete_thread",
            SessionCommand::SendMessage { .. } => "send_message",
            SessionCommand::UpdateMessage { .. } => "update_message",
            SessionCommand::DeleteMessage => "delete_message",
            SessionCommand::SendTypingNotification => "send_typing_notification",
            SessionCommand::SendReadReceipt => "send_read_receipt",
            SessionCommand::AddParticipant { .. } => "add_participant",
            SessionCommand::AddSyntheticParticipant => "add_synthetic_participant",
            SessionCommand::RemoveParticipant { .. } => "remove_participant",
            SessionCommand::RemoveLastParticipant => "remove_last_participant",
        }
    }
}

/// Successful command result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum CommandOutput {
    Thread(ThreadHandle),
    MessageId(String),
    Participant(Participant),
    Done,
}

/// Completion report for one `SessionCommand`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandOutcome {
    /// Caller-supplied correlation ID.
    pub command_id: u64,
    pub command: String,
    pub result: Result<CommandOutput, SyncError>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names_round_trip_for_every_kind() {
        for kind in NotificationKind::ALL {
            assert_eq!(NotificationKind::from_wire_name(kind.wire_name()), Some(kind));
        }
        assert_eq!(NotificationKind::from_wire_name("chatMessageReacted"), None);
    }

    #[test]
    fn only_message_and_roster_notifications_trigger_reloads() {
        assert_eq!(
            NotificationKind::MessageEdited.affected_resource(),
            Some(ResourceKind::Messages)
        );
        assert_eq!(
            NotificationKind::ParticipantsRemoved.affected_resource(),
            Some(ResourceKind::Participants)
        );
        assert_eq!(NotificationKind::TypingReceived.affected_resource(), None);
        assert_eq!(NotificationKind::ThreadCreated.affected_resource(), None);
    }

    #[test]
    fn retention_patch_distinguishes_clear_from_keep() {
        let mut thread = Thread {
            id: "19:t1@thread.v2".to_owned(),
            topic: "Hello, World!".to_owned(),
            metadata: Metadata::new(),
            retention_policy: Some(RetentionPolicy::thread_creation_date(90)),
        };

        ThreadPropertiesPatch::topic("New Topic").apply_to(&mut thread);
        assert_eq!(thread.topic, "New Topic");
        assert_eq!(
            thread.retention_policy,
            Some(RetentionPolicy::thread_creation_date(90))
        );

        ThreadPropertiesPatch::retention_policy(None).apply_to(&mut thread);
        assert_eq!(thread.retention_policy, None);
    }

    #[test]
    fn empty_patch_is_detected() {
        assert!(ThreadPropertiesPatch::default().is_empty());
        assert!(!ThreadPropertiesPatch::retention_policy(None).is_empty());
    }

    #[test]
    fn session_config_fills_missing_fields_with_defaults() {
        let cfg: SessionConfig =
            serde_json::from_str(r#"{"message_limit": 10}"#).expect("config should parse");
        assert_eq!(cfg.message_limit, 10);
        assert_eq!(cfg.event_log_capacity, DEFAULT_EVENT_LOG_CAPACITY);
        assert_eq!(cfg.name_pool.len(), DEFAULT_NAME_POOL.len());
    }
}
