mod config;
mod logging;

use std::{process::ExitCode, sync::Arc, time::Duration};

use chatsync_client::{CommandDispatcher, LoopbackChatService};
use chatsync_core::{Metadata, ResourceKind, RetentionPolicy, SyncError};
use config::DemoConfig;
use tracing::{error, info};

const DEMO_TOPIC: &str = "Hello, World!";
const DEMO_RETENTION_DAYS: u32 = 90;
const SETTLE_ATTEMPTS: usize = 50;
const SETTLE_INTERVAL: Duration = Duration::from_millis(20);

#[tokio::main]
async fn main() -> ExitCode {
    logging::init();
    info!("starting chatsync-demo");

    let config = match DemoConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };
    info!(
        endpoint = config.credential.endpoint().unwrap_or("<opaque token>"),
        refresh_delay_ms = config.session.refresh_delay_ms,
        "configuration loaded"
    );

    let service =
        Arc::new(LoopbackChatService::new().require_credential(config.credential.expose()));
    let dispatcher = match CommandDispatcher::new(service, &config.session) {
        Ok(dispatcher) => dispatcher,
        Err(err) => {
            error!(code = %err.code, message = %err.message, "could not build dispatcher");
            return ExitCode::FAILURE;
        }
    };

    let result = run_scenario(&dispatcher, &config).await;
    dispatcher.disconnect().await;
    match result {
        Ok(()) => {
            info!("chatsync-demo finished");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(code = %err.code, message = %err.message, "scenario failed");
            ExitCode::FAILURE
        }
    }
}

async fn run_scenario(
    dispatcher: &CommandDispatcher,
    config: &DemoConfig,
) -> Result<(), SyncError> {
    dispatcher.connect(&config.credential).await?;

    let handle = dispatcher
        .create_thread(
            DEMO_TOPIC,
            Some(RetentionPolicy::thread_creation_date(DEMO_RETENTION_DAYS)),
        )
        .await?;
    info!(thread_id = handle.thread_id(), "created thread");

    let message_id = dispatcher
        .send_message(&handle, "Hello!", "Jack", attachment_metadata())
        .await?;
    await_current_message(dispatcher).await?;
    info!(%message_id, "sent message");

    dispatcher.update_message(Some("Hello again!"), None).await?;

    let added = dispatcher.add_synthetic_participant().await?;
    info!(participant_id = %added.id, name = ?added.display_name, "added participant");

    let typing = dispatcher.send_typing_notification().await?;
    info!(sender = ?typing.display_name, "sent typing notification");
    let reader = dispatcher.send_read_receipt().await?;
    info!(sender = ?reader.display_name, "sent read receipt");

    dispatcher.update_topic("Updated topic").await?;
    let mut metadata = Metadata::new();
    metadata.insert("purpose".to_owned(), "demo".to_owned());
    dispatcher.update_metadata(metadata).await?;
    dispatcher
        .update_retention_policy(Some(RetentionPolicy::thread_creation_date(30)))
        .await?;

    dispatcher.remove_last_participant().await?;
    dispatcher.delete_message().await?;

    let snapshot = dispatcher.snapshot();
    info!(
        version = snapshot.version,
        messages = snapshot.messages.len(),
        participants = snapshot.participants.len(),
        events = snapshot.events.len(),
        "session state before thread deletion"
    );

    dispatcher.delete_thread().await?;
    info!("deleted thread");
    Ok(())
}

/// Reload messages until the sent message becomes the current one.
async fn await_current_message(dispatcher: &CommandDispatcher) -> Result<(), SyncError> {
    for _ in 0..SETTLE_ATTEMPTS {
        if dispatcher.snapshot().message_id.is_some() {
            return Ok(());
        }
        dispatcher.reload(ResourceKind::Messages).await?;
        tokio::time::sleep(SETTLE_INTERVAL).await;
    }
    Err(SyncError::precondition(
        "no_current_message",
        "sent message did not appear in the message list",
    ))
}

fn attachment_metadata() -> Metadata {
    let mut metadata = Metadata::new();
    metadata.insert("hasAttachment".to_owned(), "true".to_owned());
    metadata.insert(
        "attachmentUrl".to_owned(),
        "https://contoso.com/files/report.pdf".to_owned(),
    );
    metadata
}
