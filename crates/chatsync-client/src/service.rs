use async_trait::async_trait;
use chatsync_core::{
    Message, Metadata, Participant, RawNotification, ResourceKind, RetentionPolicy, SyncError,
    Thread, ThreadPropertiesPatch,
};
use chatsync_platform::ConnectionCredential;
use futures::stream::BoxStream;
use tokio::sync::broadcast;

/// Request payloads understood by the chat service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceRequest {
    /// Issue a new communication identity.
    CreateUser,
    CreateThread {
        topic: String,
        retention_policy: Option<RetentionPolicy>,
    },
    GetThreadProperties {
        thread_id: String,
    },
    UpdateThreadProperties {
        thread_id: String,
        patch: ThreadPropertiesPatch,
    },
    DeleteThread {
        thread_id: String,
    },
    SendMessage {
        thread_id: String,
        content: String,
        sender_display_name: String,
        metadata: Metadata,
    },
    UpdateMessage {
        thread_id: String,
        message_id: String,
        content: Option<String>,
        metadata: Option<Metadata>,
    },
    DeleteMessage {
        thread_id: String,
        message_id: String,
    },
    AddParticipants {
        thread_id: String,
        participants: Vec<Participant>,
    },
    RemoveParticipant {
        thread_id: String,
        participant_id: String,
    },
    SendTypingNotification {
        thread_id: String,
        sender_id: String,
    },
    SendReadReceipt {
        thread_id: String,
        sender_id: String,
        message_id: String,
    },
}

impl ServiceRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            ServiceRequest::CreateUser => "create_user",
            ServiceRequest::CreateThread { .. } => "create_thread",
            ServiceRequest::GetThreadProperties { .. } => "get_thread_properties",
            ServiceRequest::UpdateThreadProperties { .. } => "update_thread_properties",
            ServiceRequest::DeleteThread { .. } => "delete_thread",
            ServiceRequest::SendMessage { .. } => "send_message",
            ServiceRequest::UpdateMessage { .. } => "update_message",
            ServiceRequest::DeleteMessage { .. } => "delete_message",
            ServiceRequest::AddParticipants { .. } => "add_participants",
            ServiceRequest::RemoveParticipant { .. } => "remove_participant",
            ServiceRequest::SendTypingNotification { .. } => "send_typing_notification",
            ServiceRequest::SendReadReceipt { .. } => "send_read_receipt",
        }
    }
}

/// A request tagged with a unique ID so retransmissions can be deduplicated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestEnvelope {
    pub request_id: String,
    pub request: ServiceRequest,
}

/// Successful service response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceResponse {
    Ack,
    Thread(Thread),
    MessageId(String),
    UserId(String),
}

impl ServiceResponse {
    pub fn into_thread(self) -> Result<Thread, SyncError> {
        match self {
            ServiceResponse::Thread(thread) => Ok(thread),
            other => Err(unexpected_response("thread", &other)),
        }
    }

    pub fn into_message_id(self) -> Result<String, SyncError> {
        match self {
            ServiceResponse::MessageId(id) => Ok(id),
            other => Err(unexpected_response("message id", &other)),
        }
    }

    pub fn into_user_id(self) -> Result<String, SyncError> {
        match self {
            ServiceResponse::UserId(id) => Ok(id),
            other => Err(unexpected_response("user id", &other)),
        }
    }
}

fn unexpected_response(expected: &str, got: &ServiceResponse) -> SyncError {
    SyncError::service(
        "unexpected_response",
        format!("expected {expected} response, got {got:?}"),
    )
}

/// One element of a resource listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceItem {
    Message(Message),
    Participant(Participant),
}

/// External chat service consumed by the session core.
#[async_trait]
pub trait ChatService: Send + Sync {
    /// Open the connection and start real-time notifications.
    async fn connect(&self, credential: &ConnectionCredential) -> Result<(), SyncError>;

    async fn request(&self, envelope: RequestEnvelope) -> Result<ServiceResponse, SyncError>;

    /// Subscribe to push notifications emitted after this call.
    fn subscribe(&self) -> broadcast::Receiver<RawNotification>;

    /// Authoritative listing of `resource` for a thread.
    fn list_resource(
        &self,
        resource: ResourceKind,
        thread_id: &str,
    ) -> BoxStream<'static, Result<ResourceItem, SyncError>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unwrapping_wrong_response_is_a_service_error() {
        let err = ServiceResponse::Ack
            .into_thread()
            .expect_err("ack is not a thread");
        assert_eq!(err.code, "unexpected_response");

        assert_eq!(
            ServiceResponse::MessageId("m1".into())
                .into_message_id()
                .expect("message id response"),
            "m1"
        );
    }

    #[test]
    fn request_kinds_are_stable() {
        let request = ServiceRequest::RemoveParticipant {
            thread_id: "t1".into(),
            participant_id: "u1".into(),
        };
        assert_eq!(request.kind(), "remove_participant");
        assert_eq!(ServiceRequest::CreateUser.kind(), "create_user");
    }
}
