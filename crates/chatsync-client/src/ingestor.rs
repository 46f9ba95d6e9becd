use std::sync::{Arc, Mutex, PoisonError};

use chatsync_core::{
    NotificationDeduper, RawNotification, ResourceKind, SessionStore, classify_notification,
};
use chatsync_platform::Clock;
use tokio::{
    sync::broadcast::{self, error::RecvError},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::reload::Reloader;

/// Folds push notifications into the session store.
pub struct EventIngestor {
    store: Arc<SessionStore>,
    reloader: Reloader,
    clock: Arc<dyn Clock>,
    deduper: Mutex<NotificationDeduper>,
}

impl EventIngestor {
    pub fn new(store: Arc<SessionStore>, reloader: Reloader, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            reloader,
            clock,
            deduper: Mutex::new(NotificationDeduper::default()),
        }
    }

    /// Classify, deduplicate and record one notification, then schedule the
    /// reload it implies. Returns `false` when the notification was dropped.
    pub fn ingest(&self, raw: &RawNotification) -> bool {
        let Some(notification) = classify_notification(raw) else {
            warn!(event_type = %raw.event_type, "dropping unrecognized notification");
            return false;
        };

        if let Some(key) = &notification.dedup_key
            && !self
                .deduper
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .observe(key)
        {
            debug!(%key, "dropping duplicate notification");
            return false;
        }

        let event_id = self
            .store
            .record_notification(&notification, self.clock.now_ms());
        trace!(event_id, kind = ?notification.kind, "notification recorded");

        if let Some(resource) = notification.kind.affected_resource() {
            self.reloader.schedule(resource);
        }
        true
    }

    /// Consume `notifications` on a background task until shut down.
    pub fn spawn(
        self: Arc<Self>,
        mut notifications: broadcast::Receiver<RawNotification>,
    ) -> IngestorHandle {
        let stop = CancellationToken::new();
        let stop_child = stop.child_token();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop_child.cancelled() => break,
                    received = notifications.recv() => match received {
                        Ok(raw) => {
                            self.ingest(&raw);
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "notification stream lagged, reloading");
                            self.reloader.schedule(ResourceKind::Messages);
                            self.reloader.schedule(ResourceKind::Participants);
                        }
                        Err(RecvError::Closed) => {
                            debug!("notification stream closed");
                            break;
                        }
                    }
                }
            }
            debug!("event ingestor stopped");
        });

        IngestorHandle { stop, task }
    }
}

/// Owner of a running ingestor task.
pub struct IngestorHandle {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl IngestorHandle {
    /// Stop the task and wait for it to exit.
    pub async fn shutdown(self) {
        self.stop.cancel();
        let _ = self.task.await;
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chatsync_core::{Metadata, NotificationKind, SessionConfig};
    use chatsync_platform::{ConnectionCredential, ManualClock};
    use serde_json::{Value, json};
    use tokio::time::timeout;

    use super::*;
    use crate::{
        loopback::LoopbackChatService,
        service::{ChatService, RequestEnvelope, ServiceRequest},
    };

    fn ingestor(clock: ManualClock) -> (Arc<EventIngestor>, Arc<SessionStore>) {
        let store = Arc::new(SessionStore::new(&SessionConfig::default()).expect("valid config"));
        let service = Arc::new(LoopbackChatService::new());
        let reloader = Reloader::new(service, store.clone(), Duration::ZERO);
        (
            Arc::new(EventIngestor::new(store.clone(), reloader, Arc::new(clock))),
            store,
        )
    }

    #[tokio::test]
    async fn records_events_with_display_name_and_clock_time() {
        let (ingestor, store) = ingestor(ManualClock::new(42));
        assert!(ingestor.ingest(&RawNotification::new(
            "chatThreadCreated",
            json!({"threadId": "t1"})
        )));

        let snapshot = store.snapshot();
        let record = snapshot.events.last().expect("event recorded");
        assert_eq!(record.kind, NotificationKind::ThreadCreated);
        assert_eq!(record.name, "Chat Thread Created.");
        assert_eq!(record.received_at_ms, 42);
        assert!(record.payload.contains("\"threadId\":\"t1\""));
    }

    #[tokio::test]
    async fn connection_notifications_toggle_connected() {
        let (ingestor, store) = ingestor(ManualClock::new(1));
        ingestor.ingest(&RawNotification::new(
            "realTimeNotificationConnected",
            Value::Null,
        ));
        assert!(store.snapshot().connected);

        ingestor.ingest(&RawNotification::new(
            "realTimeNotificationDisconnected",
            Value::Null,
        ));
        assert!(!store.snapshot().connected);
    }

    #[tokio::test]
    async fn drops_unknown_and_duplicate_notifications() {
        let (ingestor, store) = ingestor(ManualClock::new(1));
        let received = RawNotification::new(
            "chatMessageReceived",
            json!({"id": "m1", "version": "m1", "threadId": "t1"}),
        );

        assert!(ingestor.ingest(&received));
        assert!(!ingestor.ingest(&received));
        assert!(!ingestor.ingest(&RawNotification::new("chatMessageReacted", json!({}))));
        assert_eq!(store.snapshot().events.len(), 1);
    }

    #[tokio::test]
    async fn history_is_bounded_to_fifty_records() {
        let (ingestor, store) = ingestor(ManualClock::new(1));
        for i in 0..60 {
            ingestor.ingest(&RawNotification::new(
                "typingIndicatorReceived",
                json!({"threadId": "t1", "receivedOn": i}),
            ));
        }

        let events = store.snapshot().events.clone();
        assert_eq!(events.len(), 50);
        assert!(events[0].payload.contains("\"receivedOn\":10"));
    }

    #[tokio::test]
    async fn spawned_ingestor_processes_in_order_and_shuts_down() {
        let (ingestor, store) = ingestor(ManualClock::new(1));
        let (tx, rx) = broadcast::channel(16);
        let handle = ingestor.spawn(rx);

        tx.send(RawNotification::new("realTimeNotificationConnected", Value::Null))
            .expect("send connected");
        tx.send(RawNotification::new(
            "typingIndicatorReceived",
            json!({"threadId": "t1"}),
        ))
        .expect("send typing");

        timeout(Duration::from_secs(2), async {
            while store.snapshot().events.len() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("events should be ingested");

        let kinds: Vec<NotificationKind> =
            store.snapshot().events.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![NotificationKind::ConnectionUp, NotificationKind::TypingReceived]
        );

        timeout(Duration::from_secs(2), handle.shutdown())
            .await
            .expect("shutdown should finish");
    }

    #[tokio::test]
    async fn lagged_stream_reloads_messages_and_roster() {
        let service = Arc::new(LoopbackChatService::new());
        service
            .connect(&ConnectionCredential::parse("token").expect("token is valid"))
            .await
            .expect("connect should work");
        let thread = service
            .request(RequestEnvelope {
                request_id: "create".into(),
                request: ServiceRequest::CreateThread {
                    topic: "Hello, World!".into(),
                    retention_policy: None,
                },
            })
            .await
            .expect("create should work")
            .into_thread()
            .expect("thread response");
        service
            .request(RequestEnvelope {
                request_id: "send".into(),
                request: ServiceRequest::SendMessage {
                    thread_id: thread.id.clone(),
                    content: "hi".into(),
                    sender_display_name: "Jack".into(),
                    metadata: Metadata::new(),
                },
            })
            .await
            .expect("send should work");

        let store = Arc::new(SessionStore::new(&SessionConfig::default()).expect("valid config"));
        store.begin_thread_creation().expect("create should start");
        store
            .complete_thread_creation(thread)
            .expect("create should complete");
        let reloader = Reloader::new(service.clone(), store.clone(), Duration::ZERO);
        let ingestor = Arc::new(EventIngestor::new(
            store.clone(),
            reloader,
            Arc::new(ManualClock::new(1)),
        ));

        let (tx, rx) = broadcast::channel(1);
        for i in 0..3 {
            tx.send(RawNotification::new(
                "typingIndicatorReceived",
                json!({"threadId": "t1", "receivedOn": i}),
            ))
            .expect("send typing");
        }
        let handle = ingestor.spawn(rx);

        let snapshot = timeout(Duration::from_secs(2), async {
            loop {
                let snapshot = store.snapshot();
                if !snapshot.messages.is_empty() && !snapshot.participants.is_empty() {
                    return snapshot;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("lag should reload both resources");

        assert_eq!(snapshot.messages[0].content, "hi");
        assert_eq!(snapshot.participants.len(), 1);
        assert_eq!(snapshot.events.len(), 1);
        assert!(snapshot.events[0].payload.contains("\"receivedOn\":2"));

        timeout(Duration::from_secs(2), handle.shutdown())
            .await
            .expect("shutdown should finish");
        drop(tx);
    }

    #[tokio::test]
    async fn ingestor_exits_when_stream_closes() {
        let (ingestor, _store) = ingestor(ManualClock::new(1));
        let (tx, rx) = broadcast::channel::<RawNotification>(4);
        let handle = ingestor.spawn(rx);
        drop(tx);

        timeout(Duration::from_secs(2), async {
            while !handle.is_finished() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("ingestor should stop on closed stream");
    }
}
