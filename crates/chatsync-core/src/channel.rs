use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

use crate::types::{CommandOutcome, SessionCommand};

/// Broadcast stream of command outcomes.
pub type OutcomeStream = broadcast::Receiver<CommandOutcome>;

/// Command tagged with the caller's correlation ID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandEnvelope {
    pub command_id: u64,
    pub command: SessionCommand,
}

/// Errors returned by session channel operations.
#[derive(Debug, Error)]
pub enum SessionChannelError {
    /// The command receiver side is closed.
    #[error("command channel is closed")]
    CommandChannelClosed,
}

/// Command/outcome channel pair between callers and the session runtime.
#[derive(Clone, Debug)]
pub struct SessionChannels {
    command_tx: mpsc::Sender<CommandEnvelope>,
    outcome_tx: broadcast::Sender<CommandOutcome>,
}

impl SessionChannels {
    /// Create a new channel set and return it with the command receiver.
    pub fn new(
        command_buffer: usize,
        outcome_buffer: usize,
    ) -> (Self, mpsc::Receiver<CommandEnvelope>) {
        let (command_tx, command_rx) = mpsc::channel(command_buffer.max(1));
        let (outcome_tx, _) = broadcast::channel(outcome_buffer.max(1));

        (
            Self {
                command_tx,
                outcome_tx,
            },
            command_rx,
        )
    }

    /// Subscribe to command outcomes.
    pub fn subscribe(&self) -> OutcomeStream {
        self.outcome_tx.subscribe()
    }

    /// Queue one command for the runtime.
    pub async fn send_command(
        &self,
        command_id: u64,
        command: SessionCommand,
    ) -> Result<(), SessionChannelError> {
        self.command_tx
            .send(CommandEnvelope {
                command_id,
                command,
            })
            .await
            .map_err(|_| SessionChannelError::CommandChannelClosed)
    }

    /// Publish an outcome to all subscribers.
    ///
    /// Best-effort; outcomes with no subscriber are dropped.
    pub fn emit(&self, outcome: CommandOutcome) {
        let _ = self.outcome_tx.send(outcome);
    }
}
