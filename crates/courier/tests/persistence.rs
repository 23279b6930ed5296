mod common;

use common::{eventually, fast_config, in_memory_messenger, messenger, LocalServer};
use courier::{EncryptedStorage, FileStorageAdapter, InMemoryDirectory, MessageStatus, StorageAdapter};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn open_storage(path: &Path) -> Arc<dyn StorageAdapter> {
    Arc::new(EncryptedStorage::new(
        FileStorageAdapter::new(path.to_path_buf()).unwrap(),
        [7u8; 32],
    ))
}

fn any_file_contains(path: &Path, needle: &str) -> bool {
    std::fs::read_dir(path).unwrap().any(|entry| {
        let contents = std::fs::read(entry.unwrap().path()).unwrap();
        String::from_utf8_lossy(&contents).contains(needle)
    })
}

#[tokio::test]
async fn queued_send_survives_restart() {
    let server = LocalServer::start().await;
    server.set_accepting(false);
    let dir = tempfile::tempdir().unwrap();
    let directory = Arc::new(InMemoryDirectory::new());
    let config = fast_config(&server.url());

    let bob = in_memory_messenger("bob", &config, &directory);
    bob.sign_in().await.unwrap();

    let alice = messenger("alice", &config, &directory, open_storage(dir.path()));
    alice.sign_in().await.unwrap();
    let identity = alice.sessions().identity_key().unwrap();
    assert!(identity.is_some());

    let sent = alice.send_message("bob", "written before restart").await.unwrap();
    assert_eq!(sent.status, MessageStatus::Pending);
    alice.stop();
    drop(alice);
    assert!(!any_file_contains(dir.path(), "written before restart"));

    let alice = messenger("alice", &config, &directory, open_storage(dir.path()));
    let queued = alice.outbox().items().unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].client_message_id, sent.id);
    assert_eq!(
        alice.store().message(&sent.conversation_id, &sent.id).unwrap().map(|m| m.text),
        Some("written before restart".to_string())
    );

    alice.sign_in().await.unwrap();
    assert_eq!(alice.sessions().identity_key().unwrap(), identity);
    server.set_accepting(true);

    eventually(|| {
        alice
            .store()
            .message(&sent.conversation_id, &sent.id)
            .unwrap()
            .is_some_and(|m| m.status == MessageStatus::Sent)
    })
    .await;
    eventually(|| bob.unread_count(&sent.conversation_id).unwrap() == 1).await;
}

#[tokio::test]
async fn session_state_survives_restart() {
    let server = LocalServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let directory = Arc::new(InMemoryDirectory::new());
    let config = fast_config(&server.url());

    let bob = messenger("bob", &config, &directory, open_storage(dir.path()));
    let alice = in_memory_messenger("alice", &config, &directory);
    bob.sign_in().await.unwrap();
    alice.sign_in().await.unwrap();

    let first = alice.send_message("bob", "before").await.unwrap();
    eventually(|| bob.unread_count(&first.conversation_id).unwrap() == 1).await;
    bob.stop();
    drop(bob);

    let bob = messenger("bob", &config, &directory, open_storage(dir.path()));
    bob.sign_in().await.unwrap();
    assert!(bob.wait_for_connection(Duration::from_secs(5)).await);

    alice.send_message("bob", "after").await.unwrap();
    eventually(|| bob.unread_count(&first.conversation_id).unwrap() == 2).await;
    let texts: Vec<String> = bob
        .messages(&first.conversation_id)
        .unwrap()
        .into_iter()
        .map(|m| m.text)
        .collect();
    assert_eq!(texts, vec!["before", "after"]);

    bob.send_message("alice", "reply").await.unwrap();
    eventually(|| alice.unread_count(&first.conversation_id).unwrap() == 1).await;
}
