use super::{open_messenger, resolve_conversation};
use crate::config::Config;
use crate::output::Output;
use anyhow::Result;
use courier::{Author, Message, MessageStatus, Messenger, StoreChange};
use serde::Serialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Serialize)]
struct Delivery {
    conversation_id: String,
    message_id: String,
    status: MessageStatus,
}

#[derive(Serialize)]
struct Conversation {
    conversation_id: String,
    unread: usize,
    messages: Vec<Message>,
}

fn is_final(status: MessageStatus) -> bool {
    matches!(status, MessageStatus::Sent | MessageStatus::Failed)
}

/// Waits until the message is sent or failed, or `timeout` passes; returns
/// the last status seen.
async fn wait_for_outcome(
    messenger: &Messenger,
    conversation_id: &str,
    message_id: &str,
    timeout: Duration,
) -> Result<MessageStatus> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let id = message_id.to_string();
    let subscription = messenger.watch_conversation(conversation_id, move |messages| {
        if let Some(message) = messages.iter().find(|m| m.id == id) {
            let _ = tx.send(message.status);
        }
    });

    let mut latest = messenger
        .store()
        .message(conversation_id, message_id)?
        .map(|m| m.status)
        .unwrap_or(MessageStatus::Pending);

    if !is_final(latest) {
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                Some(status) = rx.recv() => {
                    latest = status;
                    if is_final(status) {
                        break;
                    }
                }
                _ = &mut deadline => break,
            }
        }
    }

    messenger.unsubscribe(subscription);
    Ok(latest)
}

async fn report_delivery(
    messenger: &Messenger,
    message: &Message,
    wait: Duration,
    command: &str,
    output: &Output,
) -> Result<()> {
    let status = wait_for_outcome(messenger, &message.conversation_id, &message.id, wait).await?;
    messenger.stop();
    if status == MessageStatus::Failed {
        anyhow::bail!("Message {} could not be delivered", message.id);
    }
    output.success(
        command,
        Delivery {
            conversation_id: message.conversation_id.clone(),
            message_id: message.id.clone(),
            status,
        },
    );
    Ok(())
}

/// Queues the message and waits up to `wait` for delivery. A message still
/// pending at exit stays queued and goes out on the next run.
pub async fn send(
    peer_id: &str,
    text: &str,
    device_id: Option<u32>,
    wait: Duration,
    config: &mut Config,
    data_dir: &Path,
    output: &Output,
) -> Result<()> {
    let messenger = open_messenger(config, data_dir)?;
    messenger.sign_in().await?;

    let message = match device_id {
        Some(device_id) => {
            messenger
                .send_message_to_device(peer_id, device_id, text)
                .await?
        }
        None => messenger.send_message(peer_id, text).await?,
    };
    report_delivery(&messenger, &message, wait, "send", output).await
}

pub async fn retry(
    target: &str,
    message_id: &str,
    wait: Duration,
    config: &mut Config,
    data_dir: &Path,
    output: &Output,
) -> Result<()> {
    let messenger = open_messenger(config, data_dir)?;
    let conversation_id = resolve_conversation(&messenger, target)?;
    let Some(message) = messenger.store().message(&conversation_id, message_id)? else {
        anyhow::bail!("Message {} not found in {}", message_id, conversation_id);
    };

    messenger.sign_in().await?;
    messenger.retry_message(&conversation_id, message_id).await?;
    report_delivery(&messenger, &message, wait, "retry", output).await
}

pub async fn read(
    target: &str,
    limit: usize,
    config: &mut Config,
    data_dir: &Path,
    output: &Output,
) -> Result<()> {
    let messenger = open_messenger(config, data_dir)?;
    let conversation_id = resolve_conversation(&messenger, target)?;
    let mut messages = messenger.messages(&conversation_id)?;
    if messages.len() > limit {
        messages.drain(..messages.len() - limit);
    }

    output.success(
        "read",
        Conversation {
            unread: messenger.unread_count(&conversation_id)?,
            conversation_id,
            messages,
        },
    );
    Ok(())
}

pub async fn mark_read(
    target: &str,
    config: &mut Config,
    data_dir: &Path,
    output: &Output,
) -> Result<()> {
    let messenger = open_messenger(config, data_dir)?;
    let conversation_id = resolve_conversation(&messenger, target)?;
    let changed = messenger.mark_all_as_read(&conversation_id)?;
    output.success(
        "mark-read",
        serde_json::json!({ "conversation_id": conversation_id, "marked": changed }),
    );
    Ok(())
}

/// Stays connected and prints every new inbound message until Ctrl-C.
pub async fn listen(
    target: Option<&str>,
    config: &mut Config,
    data_dir: &Path,
    output: &Output,
) -> Result<()> {
    let messenger = open_messenger(config, data_dir)?;
    let only = target
        .map(|t| resolve_conversation(&messenger, t))
        .transpose()?;

    let mut seen: HashSet<String> = HashSet::new();
    for conversation_id in messenger.store().conversations()? {
        for message in messenger.messages(&conversation_id)? {
            seen.insert(message.id);
        }
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let subscription = messenger.store().subscribe(move |change| {
        if let StoreChange::Messages { conversation_id } = change {
            let _ = tx.send(conversation_id.clone());
        }
    });

    let mut state = messenger.connection_state();
    messenger.sign_in().await?;
    output.success_message("listen", "Listening for messages, Ctrl-C to stop");

    loop {
        tokio::select! {
            Some(conversation_id) = rx.recv() => {
                if only.as_ref().is_some_and(|c| *c != conversation_id) {
                    continue;
                }
                for message in messenger.messages(&conversation_id)? {
                    if message.sender == Author::Them && seen.insert(message.id.clone()) {
                        output.event("message", &message);
                    }
                }
            }
            Ok(()) = state.changed() => {
                let current = format!("{:?}", *state.borrow_and_update());
                output.event("connection", serde_json::json!({ "state": current }));
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    messenger.store().unsubscribe(subscription);
    messenger.stop();
    Ok(())
}
