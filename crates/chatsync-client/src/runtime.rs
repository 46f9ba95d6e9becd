use std::sync::Arc;

use chatsync_core::{
    CommandEnvelope, CommandOutcome, OutcomeStream, SessionChannelError, SessionChannels,
    SessionCommand, SessionSnapshot, SessionStore,
};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::dispatcher::CommandDispatcher;

const COMMAND_BUFFER: usize = 128;
const OUTCOME_BUFFER: usize = 512;

/// Caller side of a running session runtime.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    channels: SessionChannels,
    store: Arc<SessionStore>,
}

impl SessionHandle {
    pub async fn send(
        &self,
        command_id: u64,
        command: SessionCommand,
    ) -> Result<(), SessionChannelError> {
        self.channels.send_command(command_id, command).await
    }

    pub fn subscribe(&self) -> OutcomeStream {
        self.channels.subscribe()
    }

    pub fn snapshot(&self) -> Arc<SessionSnapshot> {
        self.store.snapshot()
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }
}

/// Run commands from a channel through `dispatcher`, one at a time, and
/// broadcast an outcome for each.
pub fn spawn_session_runtime(dispatcher: Arc<CommandDispatcher>) -> SessionHandle {
    let (channels, command_rx) = SessionChannels::new(COMMAND_BUFFER, OUTCOME_BUFFER);
    let store = Arc::clone(dispatcher.store());
    let runtime = SessionRuntime {
        channels: channels.clone(),
        command_rx,
        dispatcher,
    };
    tokio::spawn(async move {
        runtime.run().await;
    });

    SessionHandle { channels, store }
}

struct SessionRuntime {
    channels: SessionChannels,
    command_rx: mpsc::Receiver<CommandEnvelope>,
    dispatcher: Arc<CommandDispatcher>,
}

impl SessionRuntime {
    async fn run(mut self) {
        while let Some(CommandEnvelope {
            command_id,
            command,
        }) = self.command_rx.recv().await
        {
            let label = command.label();
            debug!(command_id, command = label, "running session command");
            let result = self.dispatcher.execute(command).await;
            if let Err(err) = &result {
                warn!(
                    command_id,
                    command = label,
                    code = %err.code,
                    message = %err.message,
                    "session command failed"
                );
            }
            self.channels.emit(CommandOutcome {
                command_id,
                command: label.to_owned(),
                result,
            });
        }
        debug!("session runtime stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chatsync_core::{CommandOutput, Metadata, SessionConfig};
    use chatsync_platform::ConnectionCredential;
    use tokio::time::timeout;

    use super::*;
    use crate::loopback::LoopbackChatService;

    async fn next_outcome(outcomes: &mut OutcomeStream) -> CommandOutcome {
        timeout(Duration::from_secs(2), outcomes.recv())
            .await
            .expect("outcome timeout")
            .expect("outcome receive")
    }

    #[tokio::test]
    async fn runtime_reports_precondition_failure_as_outcome() {
        let service = Arc::new(LoopbackChatService::new());
        let dispatcher = Arc::new(
            CommandDispatcher::new(service, &SessionConfig::default()).expect("valid config"),
        );
        let handle = spawn_session_runtime(dispatcher);
        let mut outcomes = handle.subscribe();

        handle
            .send(1, SessionCommand::DeleteThread)
            .await
            .expect("command should enqueue");

        let outcome = next_outcome(&mut outcomes).await;
        assert_eq!(outcome.command_id, 1);
        assert_eq!(outcome.command, "delete_thread");
        let err = outcome.result.expect_err("no thread to delete");
        assert_eq!(err.code, "no_active_thread");
    }

    #[tokio::test]
    async fn runtime_runs_commands_in_order() {
        let service = Arc::new(LoopbackChatService::new());
        let dispatcher = Arc::new(
            CommandDispatcher::new(service, &SessionConfig::default()).expect("valid config"),
        );
        dispatcher
            .connect(&ConnectionCredential::parse("token").expect("token is valid"))
            .await
            .expect("connect should work");
        let handle = spawn_session_runtime(dispatcher);
        let mut outcomes = handle.subscribe();

        handle
            .send(
                1,
                SessionCommand::CreateThread {
                    topic: "Hello, World!".into(),
                    retention_policy: None,
                },
            )
            .await
            .expect("create should enqueue");
        handle
            .send(
                2,
                SessionCommand::SendMessage {
                    content: "hi".into(),
                    sender_display_name: "Jack".into(),
                    metadata: Metadata::new(),
                },
            )
            .await
            .expect("send should enqueue");

        let created = next_outcome(&mut outcomes).await;
        assert!(matches!(created.result, Ok(CommandOutput::Thread(_))));
        let sent = next_outcome(&mut outcomes).await;
        assert_eq!(sent.command_id, 2);
        assert!(matches!(sent.result, Ok(CommandOutput::MessageId(_))));
        assert!(handle.snapshot().thread.is_some());
    }
}
