//! Test utilities: a local message server speaking the binary frame
//! protocol, and polling helpers.

#![allow(dead_code)]

use courier::wire::{self, Frame, SyncMessage};
use courier::{Account, EngineConfig, InMemoryDirectory, InMemoryStorage, Messenger, StorageAdapter};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;

type Clients = Mutex<HashMap<u64, (String, mpsc::UnboundedSender<Message>)>>;

struct ServerState {
    accepting: AtomicBool,
    live_delivery: AtomicBool,
    next_message_id: AtomicI64,
    next_connection: AtomicU64,
    stored: Mutex<Vec<SyncMessage>>,
    clients: Clients,
    pings: AtomicUsize,
    sync_requests: Mutex<Vec<(String, Option<i64>)>>,
}

/// Routes `SignalMessage`s to the recipient's open connections, keeps every
/// message for `SyncRequest`s, and authenticates by bearer token = user id.
pub struct LocalServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
}

impl LocalServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(ServerState {
            accepting: AtomicBool::new(true),
            live_delivery: AtomicBool::new(true),
            next_message_id: AtomicI64::new(1),
            next_connection: AtomicU64::new(1),
            stored: Mutex::new(Vec::new()),
            clients: Mutex::new(HashMap::new()),
            pings: AtomicUsize::new(0),
            sync_requests: Mutex::new(Vec::new()),
        });

        let server_state = state.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                if !server_state.accepting.load(Ordering::SeqCst) {
                    drop(stream);
                    continue;
                }
                let state = server_state.clone();
                tokio::spawn(async move {
                    if let Err(e) = Self::handle_connection(stream, state).await {
                        eprintln!("local server connection error: {}", e);
                    }
                });
            }
        });

        Self { addr, state }
    }

    pub fn url(&self) -> String {
        format!("ws://127.0.0.1:{}", self.addr.port())
    }

    /// Refused connections are accepted at TCP level and dropped before the
    /// WebSocket handshake.
    pub fn set_accepting(&self, accepting: bool) {
        self.state.accepting.store(accepting, Ordering::SeqCst);
    }

    /// When off, messages are only kept for sync.
    pub fn set_live_delivery(&self, live: bool) {
        self.state.live_delivery.store(live, Ordering::SeqCst);
    }

    pub fn kick_all(&self) {
        let clients: Vec<_> = self.state.clients.lock().unwrap().drain().collect();
        for (_, (_, tx)) in clients {
            let _ = tx.send(Message::Close(None));
        }
    }

    pub fn connections(&self) -> usize {
        self.state.clients.lock().unwrap().len()
    }

    pub fn stored(&self) -> Vec<SyncMessage> {
        self.state.stored.lock().unwrap().clone()
    }

    pub fn pings(&self) -> usize {
        self.state.pings.load(Ordering::SeqCst)
    }

    pub fn sync_requests(&self, user: &str) -> Vec<Option<i64>> {
        self.state
            .sync_requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(u, _)| u == user)
            .map(|(_, cursor)| *cursor)
            .collect()
    }

    /// Pushes raw bytes to every connection of `user`.
    pub fn push_raw(&self, user: &str, bytes: Vec<u8>) {
        for (owner, tx) in self.state.clients.lock().unwrap().values() {
            if owner == user {
                let _ = tx.send(Message::Binary(bytes.clone()));
            }
        }
    }

    pub fn push_frame(&self, user: &str, frame: &Frame) {
        self.push_raw(user, wire::encode(frame).unwrap());
    }

    async fn handle_connection(
        stream: TcpStream,
        state: Arc<ServerState>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut user = None;
        let ws = tokio_tungstenite::accept_hdr_async(stream, |request: &Request, response: Response| {
            user = request
                .headers()
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .map(str::to_string);
            Ok(response)
        })
        .await?;
        let user = user.ok_or("missing bearer token")?;

        let (mut write, mut read) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let connection_id = state.next_connection.fetch_add(1, Ordering::SeqCst);
        state
            .clients
            .lock()
            .unwrap()
            .insert(connection_id, (user.clone(), tx.clone()));

        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if write.send(message).await.is_err() || closing {
                    break;
                }
            }
        });

        while let Some(Ok(message)) = read.next().await {
            let Message::Binary(data) = message else {
                continue;
            };
            let Ok(frame) = wire::decode(&data) else {
                continue;
            };
            match frame {
                Frame::Ping {} => {
                    state.pings.fetch_add(1, Ordering::SeqCst);
                }
                Frame::SyncRequest { last_message_id } => {
                    state
                        .sync_requests
                        .lock()
                        .unwrap()
                        .push((user.clone(), last_message_id));
                    let messages: Vec<SyncMessage> = state
                        .stored
                        .lock()
                        .unwrap()
                        .iter()
                        .filter(|m| m.recipient_id == user)
                        .filter(|m| last_message_id.map_or(true, |c| m.message_id > c))
                        .cloned()
                        .collect();
                    let bytes = wire::encode(&Frame::SyncResponse { messages }).unwrap();
                    let _ = tx.send(Message::Binary(bytes));
                }
                Frame::SignalMessage(signal) => {
                    let message_id = state.next_message_id.fetch_add(1, Ordering::SeqCst);
                    state.stored.lock().unwrap().push(SyncMessage {
                        message_id,
                        sent_at: 1_700_000_000_000 + message_id,
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
                    });
                    if state.live_delivery.load(Ordering::SeqCst) {
                        let bytes = wire::encode(&Frame::SignalMessage(signal.clone())).unwrap();
                        for (owner, client) in state.clients.lock().unwrap().values() {
                            if *owner == signal.recipient_id {
                                let _ = client.send(Message::Binary(bytes.clone()));
                            }
                        }
                    }
                }
                Frame::SyncResponse { .. } => {}
            }
        }

        state.clients.lock().unwrap().remove(&connection_id);
        Ok(())
    }
}

/// Short timeouts so reconnect and retry paths run in test time.
pub fn fast_config(url: &str) -> EngineConfig {
    EngineConfig {
        server_url: url.to_string(),
        connect_timeout_ms: 500,
        heartbeat_interval_ms: 100,
        reconnect_base_ms: 50,
        reconnect_max_ms: 200,
        wait_for_connection_ms: 1_000,
        retry_delay_ms: 200,
        max_retries: 3,
        prekey_batch_size: 5,
        ..EngineConfig::default()
    }
}

pub fn account(user: &str) -> Account {
    Account {
        user_id: user.to_string(),
        device_id: 1,
        auth_token: Some(user.to_string()),
    }
}

pub fn messenger(
    user: &str,
    config: &EngineConfig,
    directory: &Arc<InMemoryDirectory>,
    storage: Arc<dyn StorageAdapter>,
) -> Arc<Messenger> {
    Messenger::new(
        account(user),
        config,
        storage,
        directory.clone(),
        directory.clone(),
    )
    .unwrap()
}

pub fn in_memory_messenger(
    user: &str,
    config: &EngineConfig,
    directory: &Arc<InMemoryDirectory>,
) -> Arc<Messenger> {
    messenger(user, config, directory, Arc::new(InMemoryStorage::new()))
}

/// Polls `check` for up to five seconds.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 5s");
}
