use std::{sync::Arc, time::Duration};

use chatsync_core::{
    CommandOutput, Metadata, Participant, ResourceKind, RetentionPolicy, SessionCommand,
    SessionConfig, SessionSnapshot, SessionStore, SyncError, ThreadHandle, ThreadPropertiesPatch,
};
use chatsync_platform::{Clock, ConnectionCredential, IdGenerator, SystemClock, UuidIdGenerator};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    ingestor::{EventIngestor, IngestorHandle},
    reload::Reloader,
    service::{ChatService, RequestEnvelope, ServiceRequest, ServiceResponse},
};

const SYNTHETIC_USER_TYPE_KEY: &str = "userType";
const SYNTHETIC_USER_TYPE: &str = "C2";

/// Translates user intents into service requests and folds acknowledgements
/// into the session store.
///
/// Local state changes only after the service acknowledges a request. Every
/// thread-scoped command schedules a best-effort reload of the resources it
/// touched, whether it succeeded or not.
pub struct CommandDispatcher {
    service: Arc<dyn ChatService>,
    store: Arc<SessionStore>,
    reloader: Reloader,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    ingestor: Mutex<Option<IngestorHandle>>,
}

impl CommandDispatcher {
    pub fn new(service: Arc<dyn ChatService>, config: &SessionConfig) -> Result<Self, SyncError> {
        let store = Arc::new(SessionStore::new(config)?);
        let reloader = Reloader::new(
            Arc::clone(&service),
            Arc::clone(&store),
            Duration::from_millis(config.refresh_delay_ms),
        );
        Ok(Self {
            service,
            store,
            reloader,
            ids: Arc::new(UuidIdGenerator),
            clock: Arc::new(SystemClock),
            ingestor: Mutex::new(None),
        })
    }

    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn snapshot(&self) -> Arc<SessionSnapshot> {
        self.store.snapshot()
    }

    /// Reload `resource` now instead of waiting for a scheduled reload.
    pub async fn reload(&self, resource: ResourceKind) -> Result<bool, SyncError> {
        self.reloader.reload(resource).await
    }

    /// Connect the service and start ingesting its notifications.
    pub async fn connect(&self, credential: &ConnectionCredential) -> Result<(), SyncError> {
        let mut ingestor = self.ingestor.lock().await;
        if let Some(running) = ingestor.take() {
            debug!("restarting event ingestor");
            running.shutdown().await;
        }

        // Subscribe first so the connection notification is not missed.
        let notifications = self.service.subscribe();
        self.service.connect(credential).await?;

        let handle = Arc::new(EventIngestor::new(
            Arc::clone(&self.store),
            self.reloader.clone(),
            Arc::clone(&self.clock),
        ))
        .spawn(notifications);
        *ingestor = Some(handle);
        self.store.set_connected(true);
        info!(
            endpoint = credential.endpoint().unwrap_or("<opaque>"),
            "session connected"
        );
        Ok(())
    }

    /// Stop ingesting notifications and mark the session disconnected.
    pub async fn disconnect(&self) {
        let running = self.ingestor.lock().await.take();
        if let Some(running) = running {
            running.shutdown().await;
        }
        self.store.set_connected(false);
        info!("session disconnected");
    }

    pub async fn create_thread(
        &self,
        topic: &str,
        retention_policy: Option<RetentionPolicy>,
    ) -> Result<ThreadHandle, SyncError> {
        let topic = non_blank(topic, "empty_topic", "thread topic is empty")?;
        validate_retention_policy(retention_policy.as_ref())?;
        if !self.store.snapshot().connected {
            return Err(SyncError::not_connected("create_thread"));
        }

        self.store.begin_thread_creation()?;
        let created = self
            .request(ServiceRequest::CreateThread {
                topic: topic.to_owned(),
                retention_policy,
            })
            .await
            .and_then(ServiceResponse::into_thread);

        match created {
            Ok(thread) => {
                let handle = self.store.complete_thread_creation(thread)?;
                info!(thread_id = handle.thread_id(), "thread created");
                Ok(handle)
            }
            Err(err) => {
                if let Err(abort_err) = self.store.abort_thread_creation() {
                    warn!(code = %abort_err.code, "could not abort thread creation");
                }
                Err(err)
            }
        }
    }

    /// Send a message. The message list is updated by the following reload,
    /// which also makes the returned ID the current message.
    pub async fn send_message(
        &self,
        handle: &ThreadHandle,
        content: &str,
        sender_display_name: &str,
        metadata: Metadata,
    ) -> Result<String, SyncError> {
        non_blank(content, "empty_content", "message content is empty")?;
        let handle = self.store.require_thread(Some(handle), "send_message")?;

        let result = self
            .request(ServiceRequest::SendMessage {
                thread_id: handle.thread_id().to_owned(),
                content: content.to_owned(),
                sender_display_name: sender_display_name.to_owned(),
                metadata,
            })
            .await
            .and_then(ServiceResponse::into_message_id);
        if let Ok(message_id) = &result {
            self.store.record_sent_message(&handle, message_id.clone());
            debug!(%message_id, "message sent");
        }
        self.refresh(&[ResourceKind::Messages]);
        result
    }

    /// Edit the current message.
    pub async fn update_message(
        &self,
        content: Option<&str>,
        metadata: Option<Metadata>,
    ) -> Result<(), SyncError> {
        if content.is_none() && metadata.is_none() {
            return Err(SyncError::validation(
                "empty_update",
                "message update carries neither content nor metadata",
            ));
        }
        if let Some(content) = content {
            non_blank(content, "empty_content", "message content is empty")?;
        }
        let (handle, message_id) = self.store.require_message("update_message")?;

        let result = self
            .request(ServiceRequest::UpdateMessage {
                thread_id: handle.thread_id().to_owned(),
                message_id,
                content: content.map(str::to_owned),
                metadata,
            })
            .await
            .map(|_| ());
        self.refresh(&[ResourceKind::Messages]);
        result
    }

    /// Delete the current message. A message the service no longer has
    /// counts as deleted.
    pub async fn delete_message(&self) -> Result<(), SyncError> {
        let (handle, message_id) = self.store.require_message("delete_message")?;

        let result = ignore_not_found(
            self.request(ServiceRequest::DeleteMessage {
                thread_id: handle.thread_id().to_owned(),
                message_id: message_id.clone(),
            })
            .await,
        );
        if result.is_ok() {
            self.store.clear_message(&message_id);
        }
        self.refresh(&[ResourceKind::Messages]);
        result
    }

    pub async fn add_participant(
        &self,
        handle: &ThreadHandle,
        identity: &str,
        display_name: Option<&str>,
        metadata: Metadata,
    ) -> Result<Participant, SyncError> {
        let identity = non_blank(identity, "empty_identity", "participant identity is empty")?;
        let handle = self.store.require_thread(Some(handle), "add_participant")?;
        self.add_participant_to(
            &handle,
            Participant {
                id: identity.to_owned(),
                display_name: display_name.map(str::to_owned),
                metadata,
            },
        )
        .await
    }

    /// Issue a fresh identity and add it under the next rotation name.
    pub async fn add_synthetic_participant(&self) -> Result<Participant, SyncError> {
        let handle = self
            .store
            .require_thread(None, "add_synthetic_participant")?;
        let identity = self
            .request(ServiceRequest::CreateUser)
            .await
            .and_then(ServiceResponse::into_user_id)?;
        let display_name = self.store.next_participant_name();

        self.add_participant_to(
            &handle,
            Participant {
                id: identity,
                display_name: Some(display_name),
                metadata: Metadata::from([(
                    SYNTHETIC_USER_TYPE_KEY.to_owned(),
                    SYNTHETIC_USER_TYPE.to_owned(),
                )]),
            },
        )
        .await
    }

    /// Remove a participant. Removing someone the service no longer has
    /// succeeds.
    ///
    /// The request is sent even when the local roster lacks `identity`, since
    /// the roster may not have caught up with the service yet.
    pub async fn remove_participant(
        &self,
        handle: &ThreadHandle,
        identity: &str,
    ) -> Result<(), SyncError> {
        let identity = non_blank(identity, "empty_identity", "participant identity is empty")?;
        let handle = self.store.require_thread(Some(handle), "remove_participant")?;

        let result = ignore_not_found(
            self.request(ServiceRequest::RemoveParticipant {
                thread_id: handle.thread_id().to_owned(),
                participant_id: identity.to_owned(),
            })
            .await,
        );
        if result.is_ok() {
            if self.store.participant_removed(&handle, identity) {
                info!(participant_id = %identity, "participant removed");
            } else {
                debug!(participant_id = %identity, "participant was not in the local roster");
            }
        }
        self.refresh(&[ResourceKind::Participants, ResourceKind::Messages]);
        result
    }

    pub async fn remove_last_participant(&self) -> Result<(), SyncError> {
        let handle = self
            .store
            .require_thread(None, "remove_last_participant")?;
        let Some(participant_id) = self.store.snapshot().last_added_participant.clone() else {
            return Err(SyncError::precondition(
                "no_last_participant",
                "no participant has been added to this thread",
            ));
        };
        self.remove_participant(&handle, &participant_id).await
    }

    /// Add a synthetic participant and send a typing indicator as that user.
    pub async fn send_typing_notification(&self) -> Result<Participant, SyncError> {
        let sender = self.add_synthetic_participant().await?;
        let handle = self
            .store
            .require_thread(None, "send_typing_notification")?;
        self.request(ServiceRequest::SendTypingNotification {
            thread_id: handle.thread_id().to_owned(),
            sender_id: sender.id.clone(),
        })
        .await?;
        Ok(sender)
    }

    /// Add a synthetic participant and mark the current message read as that user.
    pub async fn send_read_receipt(&self) -> Result<Participant, SyncError> {
        self.store.require_message("send_read_receipt")?;
        let sender = self.add_synthetic_participant().await?;
        let (handle, message_id) = self.store.require_message("send_read_receipt")?;
        self.request(ServiceRequest::SendReadReceipt {
            thread_id: handle.thread_id().to_owned(),
            sender_id: sender.id.clone(),
            message_id,
        })
        .await?;
        Ok(sender)
    }

    pub async fn update_topic(&self, topic: &str) -> Result<(), SyncError> {
        let topic = non_blank(topic, "empty_topic", "thread topic is empty")?;
        self.update_properties("update_topic", ThreadPropertiesPatch::topic(topic))
            .await
            .map(|_| ())
    }

    pub async fn update_metadata(&self, metadata: Metadata) -> Result<(), SyncError> {
        self.update_properties("update_metadata", ThreadPropertiesPatch::metadata(metadata))
            .await
            .map(|_| ())
    }

    /// Set or clear (`None`) the retention policy, then re-read the thread
    /// properties from the service.
    pub async fn update_retention_policy(
        &self,
        retention_policy: Option<RetentionPolicy>,
    ) -> Result<(), SyncError> {
        validate_retention_policy(retention_policy.as_ref())?;
        let handle = self
            .update_properties(
                "update_retention_policy",
                ThreadPropertiesPatch::retention_policy(retention_policy),
            )
            .await?;

        match self
            .request(ServiceRequest::GetThreadProperties {
                thread_id: handle.thread_id().to_owned(),
            })
            .await
            .and_then(ServiceResponse::into_thread)
        {
            Ok(thread) => {
                debug!(retention_policy = ?thread.retention_policy, "thread properties re-read");
                self.store.replace_thread_properties(thread);
            }
            Err(err) => warn!(code = %err.code, "re-reading thread properties failed"),
        }
        Ok(())
    }

    /// Delete the active thread. Thread, messages, roster and message IDs are
    /// torn down in a single snapshot.
    pub async fn delete_thread(&self) -> Result<(), SyncError> {
        let handle = self.store.begin_thread_deletion()?;
        let result = ignore_not_found(
            self.request(ServiceRequest::DeleteThread {
                thread_id: handle.thread_id().to_owned(),
            })
            .await,
        );

        match result {
            Ok(()) => {
                self.store.complete_thread_deletion()?;
                info!(thread_id = handle.thread_id(), "thread deleted");
                Ok(())
            }
            Err(err) => {
                if let Err(abort_err) = self.store.abort_thread_deletion() {
                    warn!(code = %abort_err.code, "could not abort thread deletion");
                }
                Err(err)
            }
        }
    }

    /// Run one [`SessionCommand`] against the active thread.
    pub async fn execute(&self, command: SessionCommand) -> Result<CommandOutput, SyncError> {
        match command {
            SessionCommand::CreateThread {
                topic,
                retention_policy,
            } => self
                .create_thread(&topic, retention_policy)
                .await
                .map(CommandOutput::Thread),
            SessionCommand::UpdateTopic { topic } => {
                self.update_topic(&topic).await.map(|()| CommandOutput::Done)
            }
            SessionCommand::UpdateMetadata { metadata } => self
                .update_metadata(metadata)
                .await
                .map(|()| CommandOutput::Done),
            SessionCommand::UpdateRetentionPolicy { retention_policy } => self
                .update_retention_policy(retention_policy)
                .await
                .map(|()| CommandOutput::Done),
            SessionCommand::DeleteThread => {
                self.delete_thread().await.map(|()| CommandOutput::Done)
            }
            SessionCommand::SendMessage {
                content,
                sender_display_name,
                metadata,
            } => {
                let handle = self.store.require_thread(None, "send_message")?;
                self.send_message(&handle, &content, &sender_display_name, metadata)
                    .await
                    .map(CommandOutput::MessageId)
            }
            SessionCommand::UpdateMessage { content, metadata } => self
                .update_message(content.as_deref(), metadata)
                .await
                .map(|()| CommandOutput::Done),
            SessionCommand::DeleteMessage => {
                self.delete_message().await.map(|()| CommandOutput::Done)
            }
            SessionCommand::SendTypingNotification => self
                .send_typing_notification()
                .await
                .map(CommandOutput::Participant),
            SessionCommand::SendReadReceipt => self
                .send_read_receipt()
                .await
                .map(CommandOutput::Participant),
            SessionCommand::AddParticipant {
                identity,
                display_name,
                metadata,
            } => {
                let handle = self.store.require_thread(None, "add_participant")?;
                self.add_participant(&handle, &identity, display_name.as_deref(), metadata)
                    .await
                    .map(CommandOutput::Participant)
            }
            SessionCommand::AddSyntheticParticipant => self
                .add_synthetic_participant()
                .await
                .map(CommandOutput::Participant),
            SessionCommand::RemoveParticipant { identity } => {
                let handle = self.store.require_thread(None, "remove_participant")?;
                self.remove_participant(&handle, &identity)
                    .await
                    .map(|()| CommandOutput::Done)
            }
            SessionCommand::RemoveLastParticipant => self
                .remove_last_participant()
                .await
                .map(|()| CommandOutput::Done),
        }
    }

    async fn add_participant_to(
        &self,
        handle: &ThreadHandle,
        participant: Participant,
    ) -> Result<Participant, SyncError> {
        let result = self
            .request(ServiceRequest::AddParticipants {
                thread_id: handle.thread_id().to_owned(),
                participants: vec![participant.clone()],
            })
            .await
            .map(|_| participant);
        if let Ok(participant) = &result {
            self.store.participant_added(handle, participant.clone());
            info!(
                participant_id = %participant.id,
                display_name = participant.display_name.as_deref().unwrap_or(""),
                "participant added"
            );
        }
        self.refresh(&[ResourceKind::Participants, ResourceKind::Messages]);
        result
    }

    async fn update_properties(
        &self,
        action: &str,
        patch: ThreadPropertiesPatch,
    ) -> Result<ThreadHandle, SyncError> {
        let handle = self.store.require_thread(None, action)?;
        let result = self
            .request(ServiceRequest::UpdateThreadProperties {
                thread_id: handle.thread_id().to_owned(),
                patch: patch.clone(),
            })
            .await;
        if result.is_ok() {
            self.store.apply_thread_patch(&handle, &patch);
            debug!(action, "thread properties updated");
        }
        self.refresh(&[ResourceKind::Messages]);
        result.map(|_| handle)
    }

    async fn request(&self, request: ServiceRequest) -> Result<ServiceResponse, SyncError> {
        let request_id = self.ids.next_id();
        let kind = request.kind();
        debug!(%request_id, kind, "sending service request");

        let result = self
            .service
            .request(RequestEnvelope {
                request_id: request_id.clone(),
                request,
            })
            .await;
        if let Err(err) = &result {
            warn!(
                %request_id,
                kind,
                code = %err.code,
                message = %err.message,
                "service request failed"
            );
        }
        result
    }

    fn refresh(&self, resources: &[ResourceKind]) {
        for resource in resources {
            self.reloader.schedule(*resource);
        }
    }
}

fn non_blank<'a>(value: &'a str, code: &str, message: &str) -> Result<&'a str, SyncError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(SyncError::validation(code, message));
    }
    Ok(trimmed)
}

fn validate_retention_policy(policy: Option<&RetentionPolicy>) -> Result<(), SyncError> {
    match policy {
        Some(policy) if policy.delete_thread_after_days == 0 => Err(SyncError::validation(
            "invalid_retention_policy",
            "retention policy must keep threads for at least one day",
        )),
        _ => Ok(()),
    }
}

fn ignore_not_found(result: Result<ServiceResponse, SyncError>) -> Result<(), SyncError> {
    match result {
        Ok(_) => Ok(()),
        Err(err) if err.is_not_found() => {
            debug!(message = %err.message, "resource already gone");
            Ok(())
        }
        Err(err) => Err(err),
    }
}
