use std::{sync::Arc, time::Duration};

use chatsync_core::{ResourceKind, SessionStore, SyncError};
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::service::{ChatService, ResourceItem};

/// Re-fetches authoritative resource lists into the store.
///
/// Each reload takes a generation ticket from the store before listing, so
/// only the most recently issued reload of a resource is applied.
#[derive(Clone)]
pub struct Reloader {
    service: Arc<dyn ChatService>,
    store: Arc<SessionStore>,
    delay: Duration,
}

impl Reloader {
    pub fn new(service: Arc<dyn ChatService>, store: Arc<SessionStore>, delay: Duration) -> Self {
        Self {
            service,
            store,
            delay,
        }
    }

    /// Spawn a best-effort reload after the configured delay.
    pub fn schedule(&self, resource: ResourceKind) -> JoinHandle<()> {
        let reloader = self.clone();
        tokio::spawn(async move {
            if !reloader.delay.is_zero() {
                tokio::time::sleep(reloader.delay).await;
            }
            if let Err(err) = reloader.reload(resource).await {
                warn!(?resource, code = %err.code, message = %err.message, "reload failed");
            }
        })
    }

    /// Reload `resource` now.
    ///
    /// Returns `Ok(false)` when there was no thread or the result was
    /// superseded by a later reload.
    pub async fn reload(&self, resource: ResourceKind) -> Result<bool, SyncError> {
        let Some(ticket) = self.store.begin_reload(resource) else {
            debug!(?resource, "skipping reload without active thread");
            return Ok(false);
        };

        let mut listing = self.service.list_resource(resource, ticket.thread_id());
        let mut messages = Vec::new();
        let mut participants = Vec::new();
        while let Some(item) = listing.next().await {
            match item.map_err(|err| reload_failed(resource, err))? {
                ResourceItem::Message(message) if resource == ResourceKind::Messages => {
                    messages.push(message)
                }
                ResourceItem::Participant(participant)
                    if resource == ResourceKind::Participants =>
                {
                    participants.push(participant)
                }
                other => warn!(?resource, item = ?other, "ignoring mismatched listing item"),
            }
        }

        let applied = match resource {
            ResourceKind::Messages => self.store.apply_message_reload(&ticket, messages),
            ResourceKind::Participants => {
                self.store.apply_participant_reload(&ticket, participants)
            }
        };
        Ok(applied)
    }
}

fn reload_failed(resource: ResourceKind, err: SyncError) -> SyncError {
    SyncError::service(
        "reload_failed",
        format!("{resource:?} reload failed: {} ({})", err.message, err.code),
    )
}
