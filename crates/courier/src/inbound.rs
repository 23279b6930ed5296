//! Turns inbound frames into stored messages.
//!
//! Live `SignalMessage`s and `SyncResponse` backlogs share one path:
//! normalize ids, skip ids already stored, decrypt, persist as unread. The
//! stored-id check runs before decryption so a redelivered ciphertext never
//! reaches the ratchet.

use crate::local_store::LocalStore;
use crate::session_manager::SessionManager;
use crate::transport::{Link, TransportEvent};
use crate::utils::{message_timestamp, normalize_id};
use crate::wire::{Frame, SignalMessage, SyncMessage};
use crate::{Author, ErrorKind, Message, MessageStatus, ProtocolAddress, Result};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub struct InboundProcessor {
    sessions: Arc<SessionManager>,
    store: Arc<LocalStore>,
    link: Arc<dyn Link>,
    user_id: String,
    device_id: u32,
}

impl InboundProcessor {
    pub fn new(
        sessions: Arc<SessionManager>,
        store: Arc<LocalStore>,
        link: Arc<dyn Link>,
        user_id: impl Into<String>,
        device_id: u32,
    ) -> Self {
        Self {
            sessions,
            store,
            link,
            user_id: user_id.into(),
            device_id,
        }
    }

    /// Processes transport events until the channel closes.
    pub async fn run(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_event(event).await;
        }
        debug!("inbound event stream closed");
    }

    pub async fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => {
                if let Err(e) = self.request_sync() {
                    warn!(error = %e, "failed to request sync");
                }
            }
            TransportEvent::Frame(Frame::SignalMessage(message)) => {
                self.process_live(message).await;
            }
            TransportEvent::Frame(Frame::SyncResponse { messages }) => {
                self.process_backlog(messages).await;
            }
            TransportEvent::Frame(frame) => {
                debug!(frame = frame.name(), "ignoring frame");
            }
        }
    }

    /// Asks the server for everything after the highest stored server id.
    pub fn request_sync(&self) -> Result<()> {
        let cursor = self.store.max_server_id()?;
        info!(cursor = ?cursor, "requesting sync");
        self.link.send(&Frame::SyncRequest {
            last_message_id: cursor,
        })
    }

    pub async fn process_live(&self, message: SignalMessage) -> Option<Message> {
        self.process_logged(message, None, None).await
    }

    /// Handles a backlog in server order, skipping entries at or below the
    /// cursor. Returns how many new messages were stored.
    pub async fn process_backlog(&self, mut messages: Vec<SyncMessage>) -> usize {
        let cursor = match self.store.max_server_id() {
            Ok(cursor) => cursor,
            Err(e) => {
                error!(error = %e, "failed to read sync cursor");
                return 0;
            }
        };
        messages.sort_by_key(|m| m.message_id);

        let total = messages.len();
        let mut stored = 0;
        for entry in messages {
            if cursor.is_some_and(|c| entry.message_id <= c) {
                continue;
            }
            let sent_at = u64::try_from(entry.sent_at).ok();
            if self
                .process_logged(entry.signal(), Some(entry.message_id), sent_at)
                .await
                .is_some()
            {
                stored += 1;
            }
        }
        info!(received = total, stored, "processed sync backlog");
        stored
    }

    async fn process_logged(
        &self,
        message: SignalMessage,
        server_id: Option<i64>,
        sent_at: Option<u64>,
    ) -> Option<Message> {
        let message_id = message.client_message_id.clone();
        let peer = message.sender_id.clone();
        match self.process(message, server_id, sent_at).await {
            Ok(stored) => stored,
            Err(e) if e.kind() == ErrorKind::Storage => {
                error!(peer = %peer, message_id = %message_id, error = %e, "storage failure, dropping message");
                None
            }
            Err(e) => {
                warn!(peer = %peer, message_id = %message_id, error = %e, "dropping undecryptable message");
                None
            }
        }
    }

    async fn process(
        &self,
        signal: SignalMessage,
        server_id: Option<i64>,
        sent_at: Option<u64>,
    ) -> Result<Option<Message>> {
        let sender_id = normalize_id(&signal.sender_id);
        let message_id = normalize_id(&signal.client_message_id);

        if sender_id == self.user_id && signal.sender_device_id == self.device_id {
            debug!(message_id = %message_id, "skipping own message");
            return Ok(None);
        }
        if normalize_id(&signal.recipient_id) != self.user_id
            || signal.recipient_device_id != self.device_id
        {
            debug!(message_id = %message_id, "skipping message for another device");
            return Ok(None);
        }

        let conversation_id = self.resolve_conversation(&sender_id, signal.conversation_id.as_deref())?;

        if let Some(mut existing) = self.store.message(&conversation_id, &message_id)? {
            debug!(conversation = %conversation_id, message_id = %message_id, "already stored, skipping");
            if existing.server_id.is_none() && server_id.is_some() {
                existing.server_id = server_id;
                self.store.save_message(&existing)?;
            }
            return Ok(None);
        }

        let address = ProtocolAddress::new(sender_id, signal.sender_device_id);
        let text = match self
            .sessions
            .decrypt_message(&address, &signal.content, signal.message_type)
            .await
        {
            Ok(text) => text,
            Err(e) if e.is_duplicate() => {
                debug!(peer = %address, message_id = %message_id, "replayed ciphertext, skipping");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let message = Message {
            id: message_id,
            conversation_id,
            text,
            sender: Author::Them,
            status: MessageStatus::Received,
            is_read: false,
            timestamp: sent_at.unwrap_or_else(message_timestamp),
            server_id,
        };
        self.store.save_message(&message)?;
        debug!(conversation = %message.conversation_id, message_id = %message.id, "stored inbound message");
        Ok(Some(message))
    }

    /// Frame's conversation id when present, else the peer's mapped one, else
    /// a fresh id. The peer mapping is recorded the first time.
    fn resolve_conversation(&self, peer_id: &str, given: Option<&str>) -> Result<String> {
        let given = given.map(normalize_id).filter(|c| !c.is_empty());
        let mapped = self.store.conversation_for_peer(peer_id)?;

        match (given, mapped) {
            (Some(cid), Some(_)) => Ok(cid),
            (Some(cid), None) => {
                self.store.map_peer(peer_id, &cid)?;
                Ok(cid)
            }
            (None, Some(mapped)) => Ok(mapped),
            (None, None) => {
                let cid = uuid::Uuid::new_v4().to_string();
                warn!(peer = %peer_id, conversation = %cid, "message without conversation id, generated one");
                self.store.map_peer(peer_id, &cid)?;
                Ok(cid)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::InMemoryDirectory;
    use crate::transport::ConnectionState;
    use crate::{EngineConfig, InMemoryStorage, MessageType};
    use std::sync::Mutex;
    use tokio::sync::watch;

    struct CapturingLink {
        state: watch::Sender<ConnectionState>,
        sent: Mutex<Vec<Frame>>,
    }

    impl Link for CapturingLink {
        fn send(&self, frame: &Frame) -> Result<()> {
            self.sent.lock().unwrap().push(frame.clone());
            Ok(())
        }

        fn state(&self) -> watch::Receiver<ConnectionState> {
            self.state.subscribe()
        }
    }

    struct Fixture {
        alice: SessionManager,
        inbound: InboundProcessor,
        store: Arc<LocalStore>,
        link: Arc<CapturingLink>,
    }

    async fn fixture() -> Fixture {
        let directory = Arc::new(InMemoryDirectory::new());
        let config = EngineConfig {
            prekey_batch_size: 3,
            ..EngineConfig::default()
        };
        let alice = SessionManager::new(
            "alice",
            1,
            Arc::new(InMemoryStorage::new()),
            directory.clone(),
            &config,
        );
        let bob = Arc::new(SessionManager::new(
            "bob",
            1,
            Arc::new(InMemoryStorage::new()),
            directory,
            &config,
        ));
        alice.ensure_keys(false, false).await.unwrap();
        bob.ensure_keys(false, false).await.unwrap();

        let store = Arc::new(LocalStore::new(Arc::new(InMemoryStorage::new())));
        let link = Arc::new(CapturingLink {
            state: watch::channel(ConnectionState::Connected).0,
            sent: Mutex::new(Vec::new()),
        });
        let inbound = InboundProcessor::new(bob, store.clone(), link.clone(), "bob", 1);
        Fixture {
            alice,
            inbound,
            store,
            link,
        }
    }

    async fn from_alice(f: &Fixture, id: &str, text: &str) -> SignalMessage {
        let payload = f
            .alice
            .encrypt_message(&ProtocolAddress::new("bob", 1), text)
            .await
            .unwrap();
        SignalMessage {
            conversation_id: Some("c1".to_string()),
            client_message_id: id.to_string(),
            sender_id: "alice".to_string(),
            sender_device_id: 1,
            recipient_id: "bob".to_string(),
            recipient_device_id: 1,
            content: payload.content,
            message_type: payload.message_type,
            attachment_url: None,
            reply_to_message_id: None,
        }
    }

    fn backlog_entry(signal: &SignalMessage, message_id: i64) -> SyncMessage {
        SyncMessage {
            message_id,
            sent_at: 1_000 + message_id,
            conversation_id: signal.conversation_id.clone(),
            client_message_id: signal.client_message_id.clone(),
            sender_id: signal.sender_id.clone(),
            sender_device_id: signal.sender_device_id,
            recipient_id: signal.recipient_id.clone(),
            recipient_device_id: signal.recipient_device_id,
            content: signal.content.clone(),
            message_type: signal.message_type,
            attachment_url: None,
            reply_to_message_id: None,
        }
    }

    #[tokio::test]
    async fn live_message_is_stored_unread() {
        let f = fixture().await;
        let signal = from_alice(&f, " m1 ", "hi").await;

        let stored = f.inbound.process_live(signal).await.unwrap();

        assert_eq!(stored.id, "m1");
        assert_eq!(stored.text, "hi");
        assert_eq!(stored.sender, Author::Them);
        assert!(!stored.is_read);
        assert_eq!(f.store.unread_count("c1").unwrap(), 1);
        assert_eq!(f.store.conversation_for_peer("alice").unwrap(), Some("c1".to_string()));
    }

    #[tokio::test]
    async fn redelivery_is_skipped_before_decrypt() {
        let f = fixture().await;
        let signal = from_alice(&f, "m1", "hi").await;

        assert!(f.inbound.process_live(signal.clone()).await.is_some());
        assert!(f.inbound.process_live(signal).await.is_none());
        assert_eq!(f.store.messages("c1").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn same_ciphertext_under_new_id_is_swallowed() {
        let f = fixture().await;
        let signal = from_alice(&f, "m1", "hi").await;
        let mut replay = signal.clone();
        replay.client_message_id = "m1-again".to_string();

        f.inbound.process_live(signal).await.unwrap();
        assert!(f.inbound.process_live(replay).await.is_none());
        assert_eq!(f.store.messages("c1").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn garbage_is_dropped_without_stopping_the_batch() {
        let f = fixture().await;
        let good = from_alice(&f, "m2", "still here").await;
        let mut bad = good.clone();
        bad.client_message_id = "m1".to_string();
        bad.content = vec![1, 2, 3];
        bad.message_type = MessageType::Normal;

        let stored = f
            .inbound
            .process_backlog(vec![backlog_entry(&bad, 1), backlog_entry(&good, 2)])
            .await;

        assert_eq!(stored, 1);
        assert_eq!(f.store.messages("c1").unwrap()[0].text, "still here");
    }

    #[tokio::test]
    async fn backlog_is_ordered_and_filtered_by_cursor() {
        let f = fixture().await;
        let m1 = from_alice(&f, "m1", "one").await;
        let m2 = from_alice(&f, "m2", "two").await;
        let m3 = from_alice(&f, "m3", "three").await;

        assert_eq!(f.inbound.process_backlog(vec![backlog_entry(&m1, 5)]).await, 1);

        let stored = f
            .inbound
            .process_backlog(vec![
                backlog_entry(&m3, 7),
                backlog_entry(&m1, 5),
                backlog_entry(&m2, 6),
            ])
            .await;

        assert_eq!(stored, 2);
        let texts: Vec<String> = f.store.messages("c1").unwrap().into_iter().map(|m| m.text).collect();
        assert_eq!(texts, vec!["one", "two", "three"]);
        assert_eq!(f.store.max_server_id().unwrap(), Some(7));
    }

    #[tokio::test]
    async fn live_copy_gets_server_id_from_backlog() {
        let f = fixture().await;
        let m1 = from_alice(&f, "m1", "one").await;
        f.inbound.process_live(m1.clone()).await.unwrap();
        assert_eq!(f.store.max_server_id().unwrap(), None);

        assert_eq!(f.inbound.process_backlog(vec![backlog_entry(&m1, 3)]).await, 0);
        assert_eq!(f.store.max_server_id().unwrap(), Some(3));
    }

    #[tokio::test]
    async fn connect_requests_sync_from_cursor() {
        let f = fixture().await;
        let m1 = from_alice(&f, "m1", "one").await;
        f.inbound.process_backlog(vec![backlog_entry(&m1, 11)]).await;

        f.inbound.handle_event(TransportEvent::Connected).await;

        assert_eq!(
            f.link.sent.lock().unwrap().last(),
            Some(&Frame::SyncRequest {
                last_message_id: Some(11)
            })
        );
    }

    #[tokio::test]
    async fn missing_conversation_id_uses_peer_mapping() {
        let f = fixture().await;
        f.store.map_peer("alice", "known").unwrap();
        let mut signal = from_alice(&f, "m1", "hi").await;
        signal.conversation_id = None;

        let stored = f.inbound.process_live(signal).await.unwrap();
        assert_eq!(stored.conversation_id, "known");
    }

    #[tokio::test]
    async fn own_echo_is_skipped() {
        let f = fixture().await;
        let mut signal = from_alice(&f, "m1", "hi").await;
        signal.sender_id = "bob".to_string();

        assert!(f.inbound.process_live(signal).await.is_none());
    }
}
