//! In-process chat service.
//!
//! Keeps threads, messages and rosters in memory, emits the same camelCase
//! notifications a hosted service would, and replays cached responses for
//! repeated request IDs. Failure injection and listing gates make it usable
//! as a test double.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use chatsync_core::{
    Message, MessageType, Metadata, Participant, RawNotification, ResourceKind, SyncError, Thread,
};
use chatsync_platform::{Clock, ConnectionCredential, SystemClock};
use futures::{
    StreamExt,
    stream::{self, BoxStream},
};
use serde_json::{Value, json};
use tokio::sync::{Semaphore, broadcast};
use tracing::{debug, info, trace};

use crate::service::{ChatService, RequestEnvelope, ResourceItem, ServiceRequest, ServiceResponse};

const NOTIFICATION_BUFFER: usize = 256;
const RESPONSE_CACHE_LIMIT: usize = 1024;

#[derive(Debug)]
struct LoopbackThread {
    thread: Thread,
    messages: Vec<Message>,
    participants: Vec<Participant>,
}

impl LoopbackThread {
    fn push_system_message(&mut self, id: u64, content: &str) {
        self.messages.push(Message {
            id: id.to_string(),
            content: content.to_owned(),
            sender_display_name: None,
            message_type: MessageType::System,
            metadata: Metadata::new(),
            created_at_ms: id,
        });
    }

    fn require_participant(&self, participant_id: &str) -> Result<(), SyncError> {
        if self.participants.iter().any(|p| p.id == participant_id) {
            return Ok(());
        }
        Err(SyncError::service(
            "forbidden",
            format!("{participant_id} is not a participant of {}", self.thread.id),
        ))
    }
}

#[derive(Debug, Default)]
struct LoopbackState {
    connected: bool,
    self_user: Option<String>,
    next_user: u64,
    next_thread: u64,
    last_timestamp_ms: u64,
    threads: HashMap<String, LoopbackThread>,
    responses: HashMap<String, ServiceResponse>,
    response_order: VecDeque<String>,
    injected_failures: VecDeque<SyncError>,
    listing_gate: Option<Arc<Semaphore>>,
    handled_requests: usize,
}

impl LoopbackState {
    /// Strictly increasing timestamp; doubles as message ID and version.
    fn stamp(&mut self, now_ms: u64) -> u64 {
        self.last_timestamp_ms = now_ms.max(self.last_timestamp_ms + 1);
        self.last_timestamp_ms
    }

    fn new_user(&mut self) -> String {
        self.next_user += 1;
        format!("8:acs:loopback-user-{:04}", self.next_user)
    }

    fn thread_mut(&mut self, thread_id: &str) -> Result<&mut LoopbackThread, SyncError> {
        self.threads
            .get_mut(thread_id)
            .ok_or_else(|| SyncError::not_found(format!("thread {thread_id} does not exist")))
    }

    fn remember(&mut self, request_id: String, response: ServiceResponse) {
        if self.response_order.len() == RESPONSE_CACHE_LIMIT
            && let Some(evicted) = self.response_order.pop_front()
        {
            self.responses.remove(&evicted);
        }
        self.response_order.push_back(request_id.clone());
        self.responses.insert(request_id, response);
    }
}

/// In-memory [`ChatService`].
pub struct LoopbackChatService {
    state: Mutex<LoopbackState>,
    notifications: broadcast::Sender<RawNotification>,
    clock: Arc<dyn Clock>,
    required_secret: Option<String>,
}

impl Default for LoopbackChatService {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackChatService {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_BUFFER);
        Self {
            state: Mutex::new(LoopbackState::default()),
            notifications,
            clock,
            required_secret: None,
        }
    }

    /// Only accept connections presenting exactly `secret`.
    pub fn require_credential(mut self, secret: impl Into<String>) -> Self {
        self.required_secret = Some(secret.into());
        self
    }

    /// Make the next uncached request fail with `error`.
    pub fn fail_next_request(&self, error: SyncError) {
        self.lock().injected_failures.push_back(error);
    }

    /// Hold every listing started from now on until a permit is added to the
    /// returned semaphore. Each permit releases one listing.
    pub fn gate_listings(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        self.lock().listing_gate = Some(Arc::clone(&gate));
        gate
    }

    pub fn ungate_listings(&self) {
        self.lock().listing_gate = None;
    }

    /// Drop the connection and notify subscribers.
    pub fn disconnect(&self) {
        self.lock().connected = false;
        self.emit_raw(RawNotification::new(
            "realTimeNotificationDisconnected",
            Value::Null,
        ));
    }

    /// Push an arbitrary notification to subscribers.
    pub fn emit_raw(&self, notification: RawNotification) {
        let _ = self.notifications.send(notification);
    }

    /// Number of requests executed, excluding replays of cached responses.
    pub fn handled_requests(&self) -> usize {
        self.lock().handled_requests
    }

    /// Identity the connected client acts as.
    pub fn self_user(&self) -> Option<String> {
        self.lock().self_user.clone()
    }

    fn lock(&self) -> MutexGuard<'_, LoopbackState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ChatService for LoopbackChatService {
    async fn connect(&self, credential: &ConnectionCredential) -> Result<(), SyncError> {
        tokio::task::yield_now().await;
        if let Some(required) = &self.required_secret
            && credential.expose() != required.as_str()
        {
            return Err(SyncError::service(
                "unauthorized",
                "credential was rejected by the loopback service",
            ));
        }
        {
            let mut state = self.lock();
            state.connected = true;
            if state.self_user.is_none() {
                let user = state.new_user();
                state.self_user = Some(user);
            }
        }
        info!(
            endpoint = credential.endpoint().unwrap_or("loopback"),
            "loopback service connected"
        );
        self.emit_raw(RawNotification::new(
            "realTimeNotificationConnected",
            Value::Null,
        ));
        Ok(())
    }

    async fn request(&self, envelope: RequestEnvelope) -> Result<ServiceResponse, SyncError> {
        tokio::task::yield_now().await;
        let now_ms = self.clock.now_ms();
        let RequestEnvelope {
            request_id,
            request,
        } = envelope;

        let (response, notifications) = {
            let mut state = self.lock();
            if let Some(cached) = state.responses.get(&request_id) {
                trace!(%request_id, kind = request.kind(), "replaying cached response");
                return Ok(cached.clone());
            }
            if let Some(err) = state.injected_failures.pop_front() {
                debug!(%request_id, kind = request.kind(), code = %err.code, "injected failure");
                return Err(err);
            }
            if !state.connected && request != ServiceRequest::CreateUser {
                return Err(SyncError::not_connected(request.kind()));
            }

            let (response, notifications) = execute(&mut state, request, now_ms)?;
            state.handled_requests += 1;
            state.remember(request_id, response.clone());
            (response, notifications)
        };

        for notification in notifications {
            self.emit_raw(notification);
        }
        Ok(response)
    }

    fn subscribe(&self) -> broadcast::Receiver<RawNotification> {
        self.notifications.subscribe()
    }

    fn list_resource(
        &self,
        resource: ResourceKind,
        thread_id: &str,
    ) -> BoxStream<'static, Result<ResourceItem, SyncError>> {
        let (items, gate) = {
            let state = self.lock();
            let items: Vec<Result<ResourceItem, SyncError>> = if !state.connected {
                vec![Err(SyncError::not_connected("list_resource"))]
            } else {
                match state.threads.get(thread_id) {
                    None => vec![Err(SyncError::not_found(format!(
                        "thread {thread_id} does not exist"
                    )))],
                    // Newest first, as the hosted service pages them.
                    Some(thread) => match resource {
                        ResourceKind::Messages => thread
                            .messages
                            .iter()
                            .rev()
                            .cloned()
                            .map(|message| Ok(ResourceItem::Message(message)))
                            .collect(),
                        ResourceKind::Participants => thread
                            .participants
                            .iter()
                            .cloned()
                            .map(|participant| Ok(ResourceItem::Participant(participant)))
                            .collect(),
                    },
                }
            };
            (items, state.listing_gate.clone())
        };

        let items = stream::iter(items);
        match gate {
            None => items.boxed(),
            Some(gate) => stream::once(async move {
                if let Ok(permit) = gate.acquire_owned().await {
                    permit.forget();
                }
                items
            })
            .flatten()
            .boxed(),
        }
    }
}

fn execute(
    state: &mut LoopbackState,
    request: ServiceRequest,
    now_ms: u64,
) -> Result<(ServiceResponse, Vec<RawNotification>), SyncError> {
    match request {
        ServiceRequest::CreateUser => Ok((ServiceResponse::UserId(state.new_user()), Vec::new())),
        ServiceRequest::CreateThread {
            topic,
            retention_policy,
        } => {
            let ts = state.stamp(now_ms);
            state.next_thread += 1;
            let thread = Thread {
                id: format!("19:loopback-{}@thread.v2", state.next_thread),
                topic,
                metadata: Metadata::new(),
                retention_policy,
            };
            let participants: Vec<Participant> = state
                .self_user
                .iter()
                .map(|id| Participant {
                    id: id.clone(),
                    display_name: None,
                    metadata: Metadata::new(),
                })
                .collect();
            let notification = RawNotification::new(
                "chatThreadCreated",
                json!({
                    "threadId": thread.id,
                    "version": ts.to_string(),
                    "createdOn": ts,
                    "properties": { "topic": thread.topic },
                    "participants": participants,
                }),
            );
            state.threads.insert(
                thread.id.clone(),
                LoopbackThread {
                    thread: thread.clone(),
                    messages: Vec::new(),
                    participants,
                },
            );
            Ok((ServiceResponse::Thread(thread), vec![notification]))
        }
        ServiceRequest::GetThreadProperties { thread_id } => {
            let thread = state.thread_mut(&thread_id)?.thread.clone();
            Ok((ServiceResponse::Thread(thread), Vec::new()))
        }
        ServiceRequest::UpdateThreadProperties { thread_id, patch } => {
            if patch.is_empty() {
                return Err(SyncError::validation(
                    "empty_update",
                    "thread property update changes nothing",
                ));
            }
            let ts = state.stamp(now_ms);
            let entry = state.thread_mut(&thread_id)?;
            let previous_topic = entry.thread.topic.clone();
            patch.apply_to(&mut entry.thread);
            if entry.thread.topic != previous_topic {
                entry.push_system_message(ts, "topicUpdated");
            }
            let notification = RawNotification::new(
                "chatThreadPropertiesUpdated",
                json!({
                    "threadId": thread_id,
                    "version": ts.to_string(),
                    "updatedOn": ts,
                    "properties": entry.thread,
                }),
            );
            Ok((ServiceResponse::Ack, vec![notification]))
        }
        ServiceRequest::DeleteThread { thread_id } => {
            let ts = state.stamp(now_ms);
            if state.threads.remove(&thread_id).is_none() {
                return Err(SyncError::not_found(format!(
                    "thread {thread_id} does not exist"
                )));
            }
            let notification = RawNotification::new(
                "chatThreadDeleted",
                json!({ "threadId": thread_id, "version": ts.to_string(), "deletedOn": ts }),
            );
            Ok((ServiceResponse::Ack, vec![notification]))
        }
        ServiceRequest::SendMessage {
            thread_id,
            content,
            sender_display_name,
            metadata,
        } => {
            let ts = state.stamp(now_ms);
            let entry = state.thread_mut(&thread_id)?;
            let message = Message {
                id: ts.to_string(),
                content,
                sender_display_name: Some(sender_display_name),
                message_type: MessageType::Text,
                metadata,
                created_at_ms: ts,
            };
            entry.messages.push(message.clone());
            let notification = RawNotification::new(
                "chatMessageReceived",
                json!({
                    "id": message.id,
                    "threadId": thread_id,
                    "version": message.id,
                    "type": "text",
                    "message": message.content,
                    "senderDisplayName": message.sender_display_name,
                    "metadata": message.metadata,
                    "createdOn": ts,
                }),
            );
            Ok((ServiceResponse::MessageId(message.id), vec![notification]))
        }
        ServiceRequest::UpdateMessage {
            thread_id,
            message_id,
            content,
            metadata,
        } => {
            let ts = state.stamp(now_ms);
            let entry = state.thread_mut(&thread_id)?;
            let message = entry
                .messages
                .iter_mut()
                .find(|message| message.id == message_id)
                .ok_or_else(|| SyncError::not_found(format!("message {message_id} not found")))?;
            if let Some(content) = content {
                message.content = content;
            }
            if let Some(metadata) = metadata {
                message.metadata = metadata;
            }
            let notification = RawNotification::new(
                "chatMessageEdited",
                json!({
                    "id": message_id,
                    "threadId": thread_id,
                    "version": ts.to_string(),
                    "message": message.content,
                    "metadata": message.metadata,
                    "editedOn": ts,
                }),
            );
            Ok((ServiceResponse::Ack, vec![notification]))
        }
        ServiceRequest::DeleteMessage {
            thread_id,
            message_id,
        } => {
            let ts = state.stamp(now_ms);
            let entry = state.thread_mut(&thread_id)?;
            let before = entry.messages.len();
            entry.messages.retain(|message| message.id != message_id);
            if entry.messages.len() == before {
                return Err(SyncError::not_found(format!(
                    "message {message_id} not found"
                )));
            }
            let notification = RawNotification::new(
                "chatMessageDeleted",
                json!({
                    "id": message_id,
                    "threadId": thread_id,
                    "version": ts.to_string(),
                    "deletedOn": ts,
                }),
            );
            Ok((ServiceResponse::Ack, vec![notification]))
        }
        ServiceRequest::AddParticipants {
            thread_id,
            participants,
        } => {
            let ts = state.stamp(now_ms);
            let entry = state.thread_mut(&thread_id)?;
            for participant in &participants {
                match entry.participants.iter_mut().find(|p| p.id == participant.id) {
                    Some(existing) => *existing = participant.clone(),
                    None => entry.participants.push(participant.clone()),
                }
            }
            entry.push_system_message(ts, "participantAdded");
            let notification = RawNotification::new(
                "participantsAdded",
                json!({
                    "threadId": thread_id,
                    "version": ts.to_string(),
                    "addedOn": ts,
                    "participantsAdded": participants,
                }),
            );
            Ok((ServiceResponse::Ack, vec![notification]))
        }
        ServiceRequest::RemoveParticipant {
            thread_id,
            participant_id,
        } => {
            let ts = state.stamp(now_ms);
            let entry = state.thread_mut(&thread_id)?;
            let index = entry
                .participants
                .iter()
                .position(|p| p.id == participant_id)
                .ok_or_else(|| {
                    SyncError::not_found(format!("participant {participant_id} not found"))
                })?;
            let removed = entry.participants.remove(index);
            entry.push_system_message(ts, "participantRemoved");
            let notification = RawNotification::new(
                "participantsRemoved",
                json!({
                    "threadId": thread_id,
                    "version": ts.to_string(),
                    "removedOn": ts,
                    "participantsRemoved": [removed],
                }),
            );
            Ok((ServiceResponse::Ack, vec![notification]))
        }
        ServiceRequest::SendTypingNotification {
            thread_id,
            sender_id,
        } => {
            let ts = state.stamp(now_ms);
            let entry = state.thread_mut(&thread_id)?;
            entry.require_participant(&sender_id)?;
            let notification = RawNotification::new(
                "typingIndicatorReceived",
                json!({
                    "threadId": thread_id,
                    "version": ts.to_string(),
                    "sender": { "communicationUserId": sender_id },
                    "receivedOn": ts,
                }),
            );
            Ok((ServiceResponse::Ack, vec![notification]))
        }
        ServiceRequest::SendReadReceipt {
            thread_id,
            sender_id,
            message_id,
        } => {
            let ts = state.stamp(now_ms);
            let entry = state.thread_mut(&thread_id)?;
            entry.require_participant(&sender_id)?;
            if !entry.messages.iter().any(|message| message.id == message_id) {
                return Err(SyncError::not_found(format!(
                    "message {message_id} not found"
                )));
            }
            let notification = RawNotification::new(
                "readReceiptReceived",
                json!({
                    "threadId": thread_id,
                    "sender": { "communicationUserId": sender_id },
                    "chatMessageId": message_id,
                    "readOn": ts,
                }),
            );
            Ok((ServiceResponse::Ack, vec![notification]))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chatsync_core::{RetentionPolicy, ThreadPropertiesPatch};
    use chatsync_platform::ManualClock;
    use futures::TryStreamExt;
    use tokio::time::timeout;

    use super::*;

    fn envelope(id: &str, request: ServiceRequest) -> RequestEnvelope {
        RequestEnvelope {
            request_id: id.to_owned(),
            request,
        }
    }

    async fn connected_service() -> LoopbackChatService {
        let service = LoopbackChatService::with_clock(Arc::new(ManualClock::new(1_000)));
        let credential = ConnectionCredential::parse("endpoint=https://chat.test;accesskey=k")
            .expect("credential should parse");
        service
            .connect(&credential)
            .await
            .expect("connect should work");
        service
    }

    async fn create_thread(service: &LoopbackChatService) -> Thread {
        service
            .request(envelope(
                "create",
                ServiceRequest::CreateThread {
                    topic: "Hello, World!".into(),
                    retention_policy: Some(RetentionPolicy::thread_creation_date(90)),
                },
            ))
            .await
            .expect("create should work")
            .into_thread()
            .expect("thread response")
    }

    #[tokio::test]
    async fn rejects_requests_before_connect() {
        let service = LoopbackChatService::new();
        let err = service
            .request(envelope(
                "r1",
                ServiceRequest::CreateThread {
                    topic: "t".into(),
                    retention_policy: None,
                },
            ))
            .await
            .expect_err("not connected");
        assert_eq!(err.code, "not_connected");
    }

    #[tokio::test]
    async fn replays_cached_response_for_repeated_request_id() {
        let service = connected_service().await;
        let thread = create_thread(&service).await;
        let send = ServiceRequest::SendMessage {
            thread_id: thread.id.clone(),
            content: "hi".into(),
            sender_display_name: "Jack".into(),
            metadata: Metadata::new(),
        };

        let first = service
            .request(envelope("send-1", send.clone()))
            .await
            .expect("send should work");
        let replay = service
            .request(envelope("send-1", send))
            .await
            .expect("replay should work");

        assert_eq!(first, replay);
        assert_eq!(service.handled_requests(), 2);
        let listed: Vec<ResourceItem> = service
            .list_resource(ResourceKind::Messages, &thread.id)
            .try_collect()
            .await
            .expect("listing should work");
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn lists_messages_newest_first_with_increasing_timestamps() {
        let service = connected_service().await;
        let thread = create_thread(&service).await;
        for (i, content) in ["one", "two"].into_iter().enumerate() {
            service
                .request(envelope(
                    &format!("send-{i}"),
                    ServiceRequest::SendMessage {
                        thread_id: thread.id.clone(),
                        content: content.into(),
                        sender_display_name: "Jack".into(),
                        metadata: Metadata::new(),
                    },
                ))
                .await
                .expect("send should work");
        }

        let listed: Vec<ResourceItem> = service
            .list_resource(ResourceKind::Messages, &thread.id)
            .try_collect()
            .await
            .expect("listing should work");
        let contents: Vec<&str> = listed
            .iter()
            .filter_map(|item| match item {
                ResourceItem::Message(message) => Some(message.content.as_str()),
                ResourceItem::Participant(_) => None,
            })
            .collect();
        assert_eq!(contents, vec!["two", "one"]);
    }

    #[tokio::test]
    async fn emits_notifications_for_acknowledged_requests() {
        let service = connected_service().await;
        let mut notifications = service.subscribe();
        let thread = create_thread(&service).await;

        let created = timeout(Duration::from_secs(2), notifications.recv())
            .await
            .expect("notification timeout")
            .expect("notification receive");
        assert_eq!(created.event_type, "chatThreadCreated");
        assert_eq!(created.payload["threadId"], json!(thread.id));
    }

    #[tokio::test]
    async fn rejects_mismatched_credential() {
        let service = LoopbackChatService::new().require_credential("opaque-token");
        let err = service
            .connect(&ConnectionCredential::parse("other-token").expect("token is valid"))
            .await
            .expect_err("wrong credential");
        assert_eq!(err.code, "unauthorized");
        assert_eq!(service.self_user(), None);

        service
            .connect(&ConnectionCredential::parse("opaque-token").expect("token is valid"))
            .await
            .expect("matching credential should connect");
        assert!(service.self_user().is_some());
    }

    #[tokio::test]
    async fn rejects_property_update_that_changes_nothing() {
        let service = connected_service().await;
        let thread = create_thread(&service).await;
        let handled = service.handled_requests();

        let err = service
            .request(envelope(
                "noop-update",
                ServiceRequest::UpdateThreadProperties {
                    thread_id: thread.id.clone(),
                    patch: ThreadPropertiesPatch::default(),
                },
            ))
            .await
            .expect_err("empty patch");
        assert_eq!(err.code, "empty_update");
        assert_eq!(service.handled_requests(), handled);
    }

    #[tokio::test]
    async fn removing_absent_participant_is_not_found() {
        let service = connected_service().await;
        let thread = create_thread(&service).await;
        let err = service
            .request(envelope(
                "rm",
                ServiceRequest::RemoveParticipant {
                    thread_id: thread.id,
                    participant_id: "8:acs:nobody".into(),
                },
            ))
            .await
            .expect_err("participant is absent");
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn injected_failure_applies_once() {
        let service = connected_service().await;
        service.fail_next_request(SyncError::service("transport", "socket reset"));

        let err = service
            .request(envelope("u1", ServiceRequest::CreateUser))
            .await
            .expect_err("failure injected");
        assert_eq!(err.code, "transport");
        service
            .request(envelope("u2", ServiceRequest::CreateUser))
            .await
            .expect("second request should pass");
    }

    #[tokio::test]
    async fn gated_listing_waits_for_permit() {
        let service = connected_service().await;
        let thread = create_thread(&service).await;
        let gate = service.gate_listings();

        let listing = service
            .list_resource(ResourceKind::Participants, &thread.id)
            .try_collect::<Vec<_>>();
        tokio::pin!(listing);
        assert!(
            timeout(Duration::from_millis(20), &mut listing)
                .await
                .is_err()
        );

        gate.add_permits(1);
        let items = timeout(Duration::from_secs(2), listing)
            .await
            .expect("listing should finish")
            .expect("listing should succeed");
        assert_eq!(items.len(), 1);
    }
}
