//! Durable FIFO of outgoing messages.
//!
//! Items are persisted under `outbox/{id}` and processed strictly by
//! enqueue order. One drain runs at a time; a trigger arriving during a drain
//! makes it run once more instead of starting a second one. A failing head
//! item blocks the queue until its retry delay passes, and is dropped as
//! failed once it used up its attempts.

use crate::local_store::LocalStore;
use crate::session_manager::SessionManager;
use crate::transport::{wait_for_connection, ConnectionState, Link};
use crate::utils::now_millis;
use crate::wire::{Frame, SignalMessage};
use crate::{EngineConfig, Error, MessageStatus, ProtocolAddress, Result, StorageAdapter};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

const PREFIX: &str = "outbox/";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxItem {
    pub id: String,
    pub conversation_id: String,
    pub client_message_id: String,
    pub recipient_id: String,
    pub recipient_device_id: u32,
    pub plaintext: String,
    pub retry_count: u32,
    pub enqueued_at: u64,
    /// Queue position; larger is later
    pub seq: u64,
}

impl OutboxItem {
    pub fn new(
        conversation_id: impl Into<String>,
        client_message_id: impl Into<String>,
        recipient_id: impl Into<String>,
        recipient_device_id: u32,
        plaintext: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.into(),
            client_message_id: client_message_id.into(),
            recipient_id: recipient_id.into(),
            recipient_device_id,
            plaintext: plaintext.into(),
            retry_count: 0,
            enqueued_at: 0,
            seq: 0,
        }
    }
}

/// Clears the draining flag even when the drain task is aborted.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct Outbox {
    storage: Arc<dyn StorageAdapter>,
    sessions: Arc<SessionManager>,
    link: Arc<dyn Link>,
    store: Arc<LocalStore>,
    sender_id: String,
    sender_device_id: u32,
    max_retries: u32,
    retry_delay: Duration,
    wait_for_connection: Duration,
    next_seq: AtomicU64,
    draining: AtomicBool,
    dirty: AtomicBool,
    stopped: AtomicBool,
    retry_at: Mutex<Option<Instant>>,
    timer: Mutex<Option<JoinHandle<()>>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl Outbox {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        storage: Arc<dyn StorageAdapter>,
        sessions: Arc<SessionManager>,
        link: Arc<dyn Link>,
        store: Arc<LocalStore>,
        sender_id: impl Into<String>,
        sender_device_id: u32,
        config: &EngineConfig,
    ) -> Result<Arc<Self>> {
        let outbox = Self {
            storage,
            sessions,
            link,
            store,
            sender_id: sender_id.into(),
            sender_device_id,
            max_retries: config.max_retries,
            retry_delay: config.retry_delay(),
            wait_for_connection: config.wait_for_connection(),
            next_seq: AtomicU64::new(0),
            draining: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            retry_at: Mutex::new(None),
            timer: Mutex::new(None),
            watcher: Mutex::new(None),
        };
        let next = outbox.items()?.last().map(|i| i.seq + 1).unwrap_or(1);
        outbox.next_seq.store(next, Ordering::SeqCst);
        Ok(Arc::new(outbox))
    }

    fn key(id: &str) -> String {
        format!("{}{}", PREFIX, id)
    }

    fn persist(&self, item: &OutboxItem) -> Result<()> {
        self.storage.put(&Self::key(&item.id), serde_json::to_string(item)?)
    }

    fn remove(&self, item: &OutboxItem) -> Result<()> {
        self.storage.del(&Self::key(&item.id))
    }

    /// Queued items in send order.
    pub fn items(&self) -> Result<Vec<OutboxItem>> {
        let mut items = Vec::new();
        for key in self.storage.list(PREFIX)? {
            let Some(raw) = self.storage.get(&key)? else {
                continue;
            };
            match serde_json::from_str::<OutboxItem>(&raw) {
                Ok(item) => items.push(item),
                Err(e) => {
                    error!(key = %key, error = %e, "dropping unreadable outbox item");
                    let _ = self.storage.del(&key);
                }
            }
        }
        items.sort_by_key(|i| i.seq);
        Ok(items)
    }

    fn mark(&self, item: &OutboxItem, status: MessageStatus) {
        if let Err(e) =
            self.store
                .update_status(&item.conversation_id, &item.client_message_id, status)
        {
            error!(message_id = %item.client_message_id, error = %e, "failed to update message status");
        }
    }

    /// Persists the item at the tail, marks its message pending and starts a
    /// drain.
    pub fn enqueue(self: &Arc<Self>, mut item: OutboxItem) -> Result<OutboxItem> {
        item.seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        item.enqueued_at = now_millis();
        self.persist(&item)?;
        self.mark(&item, MessageStatus::Pending);
        debug!(message_id = %item.client_message_id, seq = item.seq, "enqueued");
        self.trigger();
        Ok(item)
    }

    /// User-initiated retry: fresh attempt budget, moved to the tail. Works
    /// for items still queued and for ones already dropped as failed.
    pub fn retry(self: &Arc<Self>, mut item: OutboxItem) -> Result<OutboxItem> {
        for queued in self.items()? {
            if queued.client_message_id == item.client_message_id {
                self.remove(&queued)?;
                item.id = queued.id;
            }
        }
        item.retry_count = 0;
        *self.retry_at.lock().unwrap_or_else(|p| p.into_inner()) = None;
        info!(message_id = %item.client_message_id, "manual retry");
        self.enqueue(item)
    }

    /// Starts a drain in the background unless one is already running.
    pub fn trigger(self: &Arc<Self>) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        if self.draining.load(Ordering::SeqCst) {
            self.dirty.store(true, Ordering::SeqCst);
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move { this.drain().await });
    }

    /// Drains the queue. Returns immediately when another drain is running;
    /// that drain picks up whatever was added.
    pub async fn drain(self: &Arc<Self>) {
        loop {
            if self.stopped.load(Ordering::SeqCst) {
                return;
            }
            if self.draining.swap(true, Ordering::SeqCst) {
                self.dirty.store(true, Ordering::SeqCst);
                return;
            }
            {
                let _guard = DrainGuard(&self.draining);
                loop {
                    self.dirty.store(false, Ordering::SeqCst);
                    self.drain_once().await;
                    if !self.dirty.load(Ordering::SeqCst) {
                        break;
                    }
                }
            }
            if !self.dirty.load(Ordering::SeqCst) {
                return;
            }
        }
    }

    async fn drain_once(self: &Arc<Self>) {
        if let Some(at) = *self.retry_at.lock().unwrap_or_else(|p| p.into_inner()) {
            if Instant::now() < at {
                return;
            }
        }

        match self.items() {
            Ok(items) if items.is_empty() => return,
            Ok(_) => {}
            Err(e) => {
                error!(error = %e, "failed to read outbox");
                return;
            }
        }

        if !wait_for_connection(self.link.state(), self.wait_for_connection).await {
            if self.stopped.load(Ordering::SeqCst) {
                return;
            }
            self.handle_offline();
            return;
        }

        loop {
            let head = match self.items() {
                Ok(items) => items.into_iter().next(),
                Err(e) => {
                    error!(error = %e, "failed to read outbox");
                    return;
                }
            };
            let Some(mut item) = head else {
                return;
            };

            self.mark(&item, MessageStatus::Sending);
            match self.attempt(&item).await {
                Ok(()) => {
                    if let Err(e) = self.remove(&item) {
                        error!(message_id = %item.client_message_id, error = %e, "failed to remove sent item");
                        return;
                    }
                    self.mark(&item, MessageStatus::Sent);
                    info!(
                        message_id = %item.client_message_id,
                        peer = %item.recipient_id,
                        device = item.recipient_device_id,
                        "sent"
                    );
                }
                Err(e) => {
                    item.retry_count += 1;
                    if item.retry_count < self.max_retries {
                        warn!(
                            message_id = %item.client_message_id,
                            attempt = item.retry_count,
                            error = %e,
                            "send failed, retrying later"
                        );
                        if let Err(e) = self.persist(&item) {
                            error!(message_id = %item.client_message_id, error = %e, "failed to persist retry count");
                        }
                        self.mark(&item, MessageStatus::Pending);
                        self.schedule(self.retry_delay);
                        return;
                    }

                    let exhausted = Error::RetryBudgetExhausted(item.retry_count);
                    warn!(
                        message_id = %item.client_message_id,
                        error = %e,
                        "{}",
                        exhausted
                    );
                    if let Err(e) = self.remove(&item) {
                        error!(message_id = %item.client_message_id, error = %e, "failed to drop item");
                        return;
                    }
                    self.mark(&item, MessageStatus::Failed);
                }
            }
        }
    }

    async fn attempt(&self, item: &OutboxItem) -> Result<()> {
        let address = ProtocolAddress::new(item.recipient_id.clone(), item.recipient_device_id);
        let payload = self.sessions.encrypt_message(&address, &item.plaintext).await?;
        let frame = Frame::SignalMessage(SignalMessage {
            conversation_id: Some(item.conversation_id.clone()),
            client_message_id: item.client_message_id.clone(),
            sender_id: self.sender_id.clone(),
            sender_device_id: self.sender_device_id,
            recipient_id: item.recipient_id.clone(),
            recipient_device_id: item.recipient_device_id,
            content: payload.content,
            message_type: payload.message_type,
            attachment_url: None,
            reply_to_message_id: None,
        });
        self.link.send(&frame)
    }

    /// Offline: every queued item burns one attempt so long outages surface
    /// as failures instead of messages pending forever.
    fn handle_offline(self: &Arc<Self>) {
        let items = match self.items() {
            Ok(items) => items,
            Err(e) => {
                error!(error = %e, "failed to read outbox");
                return;
            }
        };
        warn!(queued = items.len(), "not connected, deferring outbox");

        let mut remaining = 0;
        for mut item in items {
            item.retry_count += 1;
            let result = if item.retry_count >= self.max_retries {
                warn!(message_id = %item.client_message_id, "{}", Error::RetryBudgetExhausted(item.retry_count));
                self.remove(&item)
                    .map(|_| self.mark(&item, MessageStatus::Failed))
            } else {
                remaining += 1;
                self.persist(&item)
            };
            if let Err(e) = result {
                error!(message_id = %item.client_message_id, error = %e, "failed to update outbox item");
            }
        }

        if remaining > 0 {
            self.schedule(self.retry_delay);
        }
    }

    fn schedule(self: &Arc<Self>, delay: Duration) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        *self.retry_at.lock().unwrap_or_else(|p| p.into_inner()) = Some(Instant::now() + delay);
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.drain().await;
        });
        // A superseded timer finds retry_at moved and returns without work
        *self.timer.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);
    }

    /// Drains whenever the link becomes connected.
    pub fn watch_connection(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let mut state = self.link.state();
        let handle = tokio::spawn(async move {
            while state.changed().await.is_ok() {
                let connected = *state.borrow_and_update() == ConnectionState::Connected;
                if connected {
                    *this.retry_at.lock().unwrap_or_else(|p| p.into_inner()) = None;
                    this.trigger();
                }
            }
        });
        if let Some(previous) = self
            .watcher
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .replace(handle)
        {
            previous.abort();
        }
    }

    /// Resumes after [`Outbox::stop`]: watches the connection and drains.
    pub fn start(self: &Arc<Self>) {
        self.stopped.store(false, Ordering::SeqCst);
        self.watch_connection();
        self.trigger();
    }

    /// Cancels the retry timer and connection watcher. Items stay queued and
    /// keep their attempt counts until [`Outbox::start`].
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        for slot in [&self.timer, &self.watcher] {
            if let Some(handle) = slot.lock().unwrap_or_else(|p| p.into_inner()).take() {
                handle.abort();
            }
        }
    }

    /// Drops every queued item. Used on sign-out.
    pub fn clear(&self) -> Result<()> {
        self.stop();
        *self.retry_at.lock().unwrap_or_else(|p| p.into_inner()) = None;
        self.storage.del_prefix(PREFIX)
    }
}
