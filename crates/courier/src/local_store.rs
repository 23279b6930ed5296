//! Per-conversation message log with peer mapping and change notification.
//!
//! Layout in the backing storage:
//!
//! - `conversation/{cid}/message/{id}` → JSON [`Message`]
//! - `peer/{peer}` → conversation id
//! - `conversation-peer/{cid}` → peer id
//!
//! Subscribers run synchronously on the writing thread, after the write
//! succeeded and with no store lock held, so they may read the store.

use crate::storage::parse_record;
use crate::{Author, Message, MessageStatus, Result, StorageAdapter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

pub type SubscriptionId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreChange {
    Messages { conversation_id: String },
    ConversationCleared { conversation_id: String },
    PeerMapped { peer_id: String, conversation_id: String },
    AllCleared,
}

type ChangeListener = Arc<dyn Fn(&StoreChange) + Send + Sync>;
type ConversationListener = Arc<dyn Fn(&[Message]) + Send + Sync>;

#[derive(Clone)]
enum Subscriber {
    Changes(ChangeListener),
    Conversation(String, ConversationListener),
}

pub struct LocalStore {
    storage: Arc<dyn StorageAdapter>,
    write_lock: Mutex<()>,
    subscribers: Mutex<Vec<(SubscriptionId, Subscriber)>>,
    next_subscription: AtomicU64,
}

fn message_key(conversation_id: &str, message_id: &str) -> String {
    format!("conversation/{}/message/{}", conversation_id, message_id)
}

fn conversation_prefix(conversation_id: &str) -> String {
    format!("conversation/{}/message/", conversation_id)
}

impl LocalStore {
    pub fn new(storage: Arc<dyn StorageAdapter>) -> Self {
        Self {
            storage,
            write_lock: Mutex::new(()),
            subscribers: Mutex::new(Vec::new()),
            next_subscription: AtomicU64::new(1),
        }
    }

    fn writing(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Inserts or replaces by id. Saving an id twice never yields two records.
    pub fn save_message(&self, message: &Message) -> Result<()> {
        {
            let _guard = self.writing();
            self.put(message)?;
        }
        self.notify(StoreChange::Messages {
            conversation_id: message.conversation_id.clone(),
        });
        Ok(())
    }

    pub fn save_messages(&self, messages: &[Message]) -> Result<()> {
        let mut touched: Vec<String> = Vec::new();
        {
            let _guard = self.writing();
            for message in messages {
                self.put(message)?;
                if !touched.contains(&message.conversation_id) {
                    touched.push(message.conversation_id.clone());
                }
            }
        }
        for conversation_id in touched {
            self.notify(StoreChange::Messages { conversation_id });
        }
        Ok(())
    }

    fn put(&self, message: &Message) -> Result<()> {
        self.storage.put(
            &message_key(&message.conversation_id, &message.id),
            serde_json::to_string(message)?,
        )
    }

    pub fn message(&self, conversation_id: &str, message_id: &str) -> Result<Option<Message>> {
        let key = message_key(conversation_id, message_id);
        match self.storage.get(&key)? {
            Some(raw) => Ok(Some(parse_record(&key, &raw)?)),
            None => Ok(None),
        }
    }

    /// Messages of a conversation, oldest first. Ties on timestamp are broken
    /// by id so the order is stable.
    pub fn messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let mut messages = self.load_prefix(&conversation_prefix(conversation_id))?;
        messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        Ok(messages)
    }

    fn load_prefix(&self, prefix: &str) -> Result<Vec<Message>> {
        let mut messages = Vec::new();
        for key in self.storage.list(prefix)? {
            let Some(raw) = self.storage.get(&key)? else {
                continue;
            };
            messages.push(parse_record::<Message>(&key, &raw)?);
        }
        Ok(messages)
    }

    pub fn last_message(&self, conversation_id: &str) -> Result<Option<Message>> {
        Ok(self.messages(conversation_id)?.pop())
    }

    pub fn unread_count(&self, conversation_id: &str) -> Result<usize> {
        Ok(self
            .load_prefix(&conversation_prefix(conversation_id))?
            .iter()
            .filter(|m| m.sender == Author::Them && !m.is_read)
            .count())
    }

    /// Returns how many messages changed.
    pub fn mark_all_read(&self, conversation_id: &str) -> Result<usize> {
        let changed = {
            let _guard = self.writing();
            let mut changed = 0;
            for mut message in self.load_prefix(&conversation_prefix(conversation_id))? {
                if !message.is_read {
                    message.is_read = true;
                    self.put(&message)?;
                    changed += 1;
                }
            }
            changed
        };
        if changed > 0 {
            self.notify(StoreChange::Messages {
                conversation_id: conversation_id.to_string(),
            });
        }
        Ok(changed)
    }

    /// Returns `false` when the message is not stored.
    pub fn update_status(
        &self,
        conversation_id: &str,
        message_id: &str,
        status: MessageStatus,
    ) -> Result<bool> {
        {
            let _guard = self.writing();
            let Some(mut message) = self.message(conversation_id, message_id)? else {
                return Ok(false);
            };
            if message.status == status {
                return Ok(true);
            }
            message.status = status;
            self.put(&message)?;
        }
        self.notify(StoreChange::Messages {
            conversation_id: conversation_id.to_string(),
        });
        Ok(true)
    }

    /// Highest server id across every stored message; the sync cursor.
    pub fn max_server_id(&self) -> Result<Option<i64>> {
        Ok(self
            .load_prefix("conversation/")?
            .iter()
            .filter_map(|m| m.server_id)
            .max())
    }

    pub fn conversation_for_peer(&self, peer_id: &str) -> Result<Option<String>> {
        self.storage.get(&format!("peer/{}", peer_id))
    }

    pub fn peer_for_conversation(&self, conversation_id: &str) -> Result<Option<String>> {
        self.storage.get(&format!("conversation-peer/{}", conversation_id))
    }

    pub fn map_peer(&self, peer_id: &str, conversation_id: &str) -> Result<()> {
        {
            let _guard = self.writing();
            self.storage
                .put(&format!("peer/{}", peer_id), conversation_id.to_string())?;
            self.storage.put(
                &format!("conversation-peer/{}", conversation_id),
                peer_id.to_string(),
            )?;
        }
        self.notify(StoreChange::PeerMapped {
            peer_id: peer_id.to_string(),
            conversation_id: conversation_id.to_string(),
        });
        Ok(())
    }

    pub fn conversations(&self) -> Result<Vec<String>> {
        Ok(self
            .storage
            .list("conversation-peer/")?
            .into_iter()
            .filter_map(|k| k.strip_prefix("conversation-peer/").map(str::to_string))
            .collect())
    }

    /// Removes a conversation's messages. The peer mapping is kept.
    pub fn clear_conversation(&self, conversation_id: &str) -> Result<()> {
        {
            let _guard = self.writing();
            self.storage.del_prefix(&conversation_prefix(conversation_id))?;
        }
        self.notify(StoreChange::ConversationCleared {
            conversation_id: conversation_id.to_string(),
        });
        Ok(())
    }

    pub fn clear_all(&self) -> Result<()> {
        {
            let _guard = self.writing();
            self.storage.del_prefix("conversation/")?;
            self.storage.del_prefix("conversation-peer/")?;
            self.storage.del_prefix("peer/")?;
        }
        self.notify(StoreChange::AllCleared);
        Ok(())
    }

    fn add_subscriber(&self, subscriber: Subscriber) -> SubscriptionId {
        let id = self.next_subscription.fetch_add(1, Ordering::SeqCst);
        self.subscribers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push((id, subscriber));
        id
    }

    /// Called once for every mutation.
    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&StoreChange) + Send + Sync + 'static,
    {
        self.add_subscriber(Subscriber::Changes(Arc::new(listener)))
    }

    /// Called with the ordered message list after each mutation touching
    /// `conversation_id`.
    pub fn watch_conversation<F>(&self, conversation_id: &str, listener: F) -> SubscriptionId
    where
        F: Fn(&[Message]) + Send + Sync + 'static,
    {
        self.add_subscriber(Subscriber::Conversation(
            conversation_id.to_string(),
            Arc::new(listener),
        ))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .retain(|(sub_id, _)| *sub_id != id);
    }

    fn notify(&self, change: StoreChange) {
        let subscribers: Vec<Subscriber> = self
            .subscribers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .map(|(_, s)| s.clone())
            .collect();

        for subscriber in subscribers {
            match subscriber {
                Subscriber::Changes(listener) => listener(&change),
                Subscriber::Conversation(conversation_id, listener) => {
                    let touches = match &change {
                        StoreChange::Messages { conversation_id: c }
                        | StoreChange::ConversationCleared { conversation_id: c } => {
                            *c == conversation_id
                        }
                        StoreChange::PeerMapped { .. } => false,
                        StoreChange::AllCleared => true,
                    };
                    if !touches {
                        continue;
                    }
                    match self.messages(&conversation_id) {
                        Ok(messages) => listener(&messages),
                        Err(e) => tracing::error!(
                            conversation = %conversation_id,
                            error = %e,
                            "failed to load messages for watcher"
                        ),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryStorage;

    fn store() -> LocalStore {
        LocalStore::new(Arc::new(InMemoryStorage::new()))
    }

    fn incoming(cid: &str, id: &str, timestamp: u64, server_id: Option<i64>) -> Message {
        Message {
            id: id.to_string(),
            conversation_id: cid.to_string(),
            text: format!("text {}", id),
            sender: Author::Them,
            status: MessageStatus::Received,
            is_read: false,
            timestamp,
            server_id,
        }
    }

    #[test]
    fn saving_same_id_twice_keeps_one_record() {
        let store = store();
        let mut message = incoming("c1", "m1", 10, Some(1));
        store.save_message(&message).unwrap();
        message.text = "edited".to_string();
        store.save_messages(&[message.clone(), message]).unwrap();

        let messages = store.messages("c1").unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text, "edited");
    }

    #[test]
    fn lists_by_timestamp_then_id() {
        let store = store();
        store.save_message(&incoming("c1", "b", 20, None)).unwrap();
        store.save_message(&incoming("c1", "c", 10, None)).unwrap();
        store.save_message(&incoming("c1", "a", 20, None)).unwrap();

        let ids: Vec<String> = store.messages("c1").unwrap().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
        assert_eq!(store.last_message("c1").unwrap().unwrap().id, "b");
    }

    #[test]
    fn unread_counts_only_their_messages() {
        let store = store();
        store.save_message(&incoming("c1", "m1", 1, None)).unwrap();
        store.save_message(&incoming("c1", "m2", 2, None)).unwrap();
        store.save_message(&Message::outgoing("c1", "mine")).unwrap();

        assert_eq!(store.unread_count("c1").unwrap(), 2);
        assert_eq!(store.mark_all_read("c1").unwrap(), 2);
        assert_eq!(store.unread_count("c1").unwrap(), 0);
        assert_eq!(store.mark_all_read("c1").unwrap(), 0);
    }

    #[test]
    fn cursor_is_max_server_id_across_conversations() {
        let store = store();
        assert_eq!(store.max_server_id().unwrap(), None);
        store.save_message(&incoming("c1", "m1", 1, Some(4))).unwrap();
        store.save_message(&incoming("c2", "m2", 2, Some(9))).unwrap();
        store.save_message(&incoming("c2", "m3", 3, None)).unwrap();
        assert_eq!(store.max_server_id().unwrap(), Some(9));
    }

    #[test]
    fn status_updates_missing_message_are_reported() {
        let store = store();
        let message = Message::outgoing("c1", "hi");
        store.save_message(&message).unwrap();

        assert!(store.update_status("c1", &message.id, MessageStatus::Sent).unwrap());
        assert!(!store.update_status("c1", "nope", MessageStatus::Sent).unwrap());
        assert_eq!(
            store.message("c1", &message.id).unwrap().unwrap().status,
            MessageStatus::Sent
        );
    }

    #[test]
    fn peer_mapping_is_bidirectional() {
        let store = store();
        store.map_peer("bob", "c1").unwrap();
        assert_eq!(store.conversation_for_peer("bob").unwrap(), Some("c1".to_string()));
        assert_eq!(store.peer_for_conversation("c1").unwrap(), Some("bob".to_string()));
        assert_eq!(store.conversations().unwrap(), vec!["c1".to_string()]);
    }

    #[test]
    fn each_mutation_notifies_each_subscriber_once() {
        let store = store();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let id = store.subscribe(move |change| sink.lock().unwrap().push(change.clone()));

        store.map_peer("bob", "c1").unwrap();
        store.save_message(&incoming("c1", "m1", 1, None)).unwrap();
        store.mark_all_read("c1").unwrap();
        store.clear_conversation("c1").unwrap();
        store.unsubscribe(id);
        store.save_message(&incoming("c1", "m2", 2, None)).unwrap();
        store.map_peer("carol", "c2").unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 4);
        assert_eq!(
            seen[0],
            StoreChange::PeerMapped {
                peer_id: "bob".to_string(),
                conversation_id: "c1".to_string()
            }
        );
        assert_eq!(
            seen[3],
            StoreChange::ConversationCleared {
                conversation_id: "c1".to_string()
            }
        );
    }

    #[test]
    fn conversation_watch_receives_ordered_list() {
        let store = Arc::new(store());
        let lengths = Arc::new(Mutex::new(Vec::new()));
        let sink = lengths.clone();
        store.watch_conversation("c1", move |messages| {
            sink.lock().unwrap().push(messages.len());
        });

        store.save_message(&incoming("c1", "m1", 1, None)).unwrap();
        store.save_message(&incoming("c2", "x", 1, None)).unwrap();
        store.save_message(&incoming("c1", "m2", 2, None)).unwrap();

        assert_eq!(*lengths.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn clear_all_removes_messages_and_mappings() {
        let store = store();
        store.map_peer("bob", "c1").unwrap();
        store.save_message(&incoming("c1", "m1", 1, Some(3))).unwrap();

        store.clear_all().unwrap();

        assert!(store.messages("c1").unwrap().is_empty());
        assert!(store.conversation_for_peer("bob").unwrap().is_none());
        assert_eq!(store.max_server_id().unwrap(), None);
    }
}
