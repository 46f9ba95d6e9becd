//! Session runtime for chatsync.
//!
//! Wires user commands to an external [`ChatService`], folds its push
//! notifications into the [`chatsync_core::SessionStore`] and keeps message
//! and roster lists reconciled through coalesced reloads.

/// Intent-to-request translation with acknowledgement-driven state updates.
pub mod dispatcher;
/// Notification ingestion task.
pub mod ingestor;
/// In-memory chat service used by the demo and tests.
pub mod loopback;
/// Generation-checked resource reloads.
pub mod reload;
/// Command channel runtime.
pub mod runtime;
/// External chat service contract.
pub mod service;

pub use dispatcher::CommandDispatcher;
pub use ingestor::{EventIngestor, IngestorHandle};
pub use loopback::LoopbackChatService;
pub use reload::Reloader;
pub use runtime::{SessionHandle, spawn_session_runtime};
pub use service::{ChatService, RequestEnvelope, ResourceItem, ServiceRequest, ServiceResponse};
