use crate::directory::{ConversationDirectory, KeyDirectory};
use crate::inbound::InboundProcessor;
use crate::local_store::{LocalStore, SubscriptionId};
use crate::outbox::{Outbox, OutboxItem};
use crate::session_manager::SessionManager;
use crate::transport::{ConnectionState, Link, Transport};
use crate::types::DEFAULT_DEVICE_ID;
use crate::{EngineConfig, Error, Message, Result, StorageAdapter};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Who this client is signed in as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub user_id: String,
    pub device_id: u32,
    #[serde(default)]
    pub auth_token: Option<String>,
}

/// The delivery engine wired together. Construct once and share by `Arc`.
pub struct Messenger {
    account: Account,
    sessions: Arc<SessionManager>,
    store: Arc<LocalStore>,
    outbox: Arc<Outbox>,
    transport: Arc<Transport>,
    inbound: Arc<InboundProcessor>,
    key_directory: Arc<dyn KeyDirectory>,
    conversations: Arc<dyn ConversationDirectory>,
    inbound_task: Mutex<Option<JoinHandle<()>>>,
}

impl Messenger {
    pub fn new(
        account: Account,
        config: &EngineConfig,
        storage: Arc<dyn StorageAdapter>,
        key_directory: Arc<dyn KeyDirectory>,
        conversations: Arc<dyn ConversationDirectory>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let sessions = Arc::new(SessionManager::new(
            account.user_id.clone(),
            account.device_id,
            storage.clone(),
            key_directory.clone(),
            config,
        ));
        let store = Arc::new(LocalStore::new(storage.clone()));
        let (transport, _) = Transport::new(config, account.auth_token.clone());
        let link: Arc<dyn Link> = transport.clone();

        let outbox = Outbox::new(
            storage,
            sessions.clone(),
            link.clone(),
            store.clone(),
            account.user_id.clone(),
            account.device_id,
            config,
        )?;
        let inbound = Arc::new(InboundProcessor::new(
            sessions.clone(),
            store.clone(),
            link,
            account.user_id.clone(),
            account.device_id,
        ));

        Ok(Arc::new(Self {
            account,
            sessions,
            store,
            outbox,
            transport,
            inbound,
            key_directory,
            conversations,
            inbound_task: Mutex::new(None),
        }))
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    pub fn outbox(&self) -> &Arc<Outbox> {
        &self.outbox
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.transport.state()
    }

    pub async fn wait_for_connection(&self, timeout: Duration) -> bool {
        self.transport.wait_for_connection(timeout).await
    }

    /// Makes sure keys exist and are published, then starts the engine.
    pub async fn sign_in(self: &Arc<Self>) -> Result<()> {
        self.sessions.ensure_keys(false, true).await?;
        info!(user = %self.account.user_id, device = self.account.device_id, "signed in");
        self.start();
        Ok(())
    }

    /// Connects, starts the inbound pipeline and resumes queued sends.
    pub fn start(self: &Arc<Self>) {
        {
            let mut task = self.inbound_task.lock().unwrap_or_else(|p| p.into_inner());
            if task.as_ref().map_or(true, |t| t.is_finished()) {
                let events = self.transport.subscribe();
                *task = Some(tokio::spawn(self.inbound.clone().run(events)));
            }
        }
        self.transport.connect();
        self.outbox.start();
    }

    /// Disconnects without wiping anything.
    pub fn stop(&self) {
        self.transport.disconnect();
        self.outbox.stop();
    }

    /// Disconnects and wipes keys, sessions, queued sends and messages.
    pub fn sign_out(&self) -> Result<()> {
        self.transport.disconnect();
        if let Some(task) = self.inbound_task.lock().unwrap_or_else(|p| p.into_inner()).take() {
            task.abort();
        }
        self.outbox.clear()?;
        self.store.clear_all()?;
        self.sessions.clear()?;
        info!(user = %self.account.user_id, "signed out");
        Ok(())
    }

    /// Sends to the peer's lowest published device.
    pub async fn send_message(self: &Arc<Self>, peer_id: &str, text: &str) -> Result<Message> {
        let device_id = self.pick_device(peer_id).await;
        self.send_message_to_device(peer_id, device_id, text).await
    }

    /// Stores the message as pending and queues it. Delivery happens in the
    /// background; watch the conversation for status changes.
    pub async fn send_message_to_device(
        self: &Arc<Self>,
        peer_id: &str,
        device_id: u32,
        text: &str,
    ) -> Result<Message> {
        let conversation_id = self.conversation_for(peer_id).await?;
        let message = Message::outgoing(conversation_id.clone(), text);
        self.store.save_message(&message)?;
        self.outbox.enqueue(OutboxItem::new(
            conversation_id,
            message.id.clone(),
            peer_id,
            device_id,
            text,
        ))?;
        Ok(message)
    }

    /// Requeues one of our messages, typically after it failed.
    pub async fn retry_message(
        self: &Arc<Self>,
        conversation_id: &str,
        message_id: &str,
    ) -> Result<()> {
        let message = self
            .store
            .message(conversation_id, message_id)?
            .ok_or_else(|| Error::Storage(format!("unknown message {}", message_id)))?;
        let peer_id = self
            .store
            .peer_for_conversation(conversation_id)?
            .ok_or_else(|| Error::Storage(format!("no peer for conversation {}", conversation_id)))?;

        let queued = self
            .outbox
            .items()?
            .into_iter()
            .find(|i| i.client_message_id == message.id);
        let item = match queued {
            Some(item) => item,
            None => {
                let device_id = self.pick_device(&peer_id).await;
                OutboxItem::new(conversation_id, message.id.clone(), peer_id, device_id, message.text)
            }
        };
        self.outbox.retry(item)?;
        Ok(())
    }

    pub fn watch_conversation<F>(&self, conversation_id: &str, listener: F) -> SubscriptionId
    where
        F: Fn(&[Message]) + Send + Sync + 'static,
    {
        self.store.watch_conversation(conversation_id, listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.store.unsubscribe(id);
    }

    pub fn messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        self.store.messages(conversation_id)
    }

    pub fn unread_count(&self, conversation_id: &str) -> Result<usize> {
        self.store.unread_count(conversation_id)
    }

    pub fn mark_all_as_read(&self, conversation_id: &str) -> Result<usize> {
        self.store.mark_all_read(conversation_id)
    }

    /// Stored mapping first, then the server. When the server cannot be
    /// reached a local id is used so the message can still be queued.
    pub async fn conversation_for(&self, peer_id: &str) -> Result<String> {
        if let Some(conversation_id) = self.store.conversation_for_peer(peer_id)? {
            return Ok(conversation_id);
        }
        let conversation_id = match self
            .conversations
            .create_or_get_direct(&self.account.user_id, peer_id)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                warn!(peer = %peer_id, error = %e, "conversation lookup failed, using local id");
                uuid::Uuid::new_v4().to_string()
            }
        };
        self.store.map_peer(peer_id, &conversation_id)?;
        Ok(conversation_id)
    }

    async fn pick_device(&self, peer_id: &str) -> u32 {
        match self.key_directory.list_devices(peer_id).await {
            Ok(devices) => devices.into_iter().min().unwrap_or(DEFAULT_DEVICE_ID),
            Err(e) => {
                warn!(peer = %peer_id, error = %e, "device list unavailable, using default device");
                DEFAULT_DEVICE_ID
            }
        }
    }
}
