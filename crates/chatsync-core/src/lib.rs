//! Core session contract shared by the chatsync runtime and its callers.
//!
//! This crate defines the session data model, the snapshot store, the thread
//! lifecycle gate, notification classification and the bounded buffers that
//! back the published snapshot.

/// Async command/outcome channel primitives.
pub mod channel;
/// Stable error type shared by commands and reloads.
pub mod error;
/// Bounded event history.
pub mod event_log;
/// Notification classification and deduplication.
pub mod normalization;
/// Synthetic participant name rotation.
pub mod rotation;
/// Thread create/delete gate.
pub mod state_machine;
/// Snapshot store with synchronous listener fan-out.
pub mod store;
/// Bounded, creation-ordered message list.
pub mod timeline;
/// Session data model, commands and outcomes.
pub mod types;

pub use channel::{CommandEnvelope, OutcomeStream, SessionChannelError, SessionChannels};
pub use error::{SyncError, SyncErrorKind};
pub use event_log::EventLog;
pub use normalization::{
    ClassifiedNotification, DEFAULT_DEDUP_WINDOW, NotificationDeduper, classify_notification,
};
pub use rotation::NameRotation;
pub use state_machine::ThreadLifecycle;
pub use store::{ListenerId, ReloadTicket, SessionStore, SnapshotListener};
pub use timeline::MessageTimeline;
pub use types::{
    CommandOutcome, CommandOutput, DEFAULT_EVENT_LOG_CAPACITY, DEFAULT_MESSAGE_LIMIT,
    DEFAULT_NAME_POOL, EventRecord, Message, MessageType, Metadata, NotificationKind, Participant,
    Patch, RawNotification, ResourceKind, RetentionKind, RetentionPolicy, SessionCommand,
    SessionConfig, SessionSnapshot, Thread, ThreadHandle, ThreadPhase, ThreadPropertiesPatch,
};
