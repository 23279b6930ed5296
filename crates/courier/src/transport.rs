use crate::wire::{self, Frame};
use crate::{EngineConfig, Error, Result};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Dropped unexpectedly; the next attempt starts after `delay`
    Reconnecting { attempt: u32, delay: Duration },
    /// Closed on request; nothing reconnects until `connect` is called again
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    Frame(Frame),
}

/// The sending half of a connection as seen by the outbox and the inbound
/// pipeline.
pub trait Link: Send + Sync {
    /// Hands the frame to the connection without waiting. Fails when not
    /// connected; never retries.
    fn send(&self, frame: &Frame) -> Result<()>;

    fn state(&self) -> watch::Receiver<ConnectionState>;
}

/// Resolves to `true` once `state` reports `Connected`, or `false` after
/// `timeout`.
pub async fn wait_for_connection(
    mut state: watch::Receiver<ConnectionState>,
    timeout: Duration,
) -> bool {
    matches!(
        tokio::time::timeout(
            timeout,
            state.wait_for(|s| *s == ConnectionState::Connected)
        )
        .await,
        Ok(Ok(_))
    )
}

/// Exponential reconnect delay with a ceiling.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            current: base,
            attempt: 0,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        self.attempt += 1;
        delay
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.current = self.base;
        self.attempt = 0;
    }
}

/// One authenticated WebSocket connection to the message server, kept alive
/// with heartbeats and re-established with backoff after drops.
pub struct Transport {
    url: String,
    auth_token: Option<String>,
    connect_timeout: Duration,
    heartbeat_interval: Duration,
    reconnect_base: Duration,
    reconnect_max: Duration,
    state_tx: watch::Sender<ConnectionState>,
    outgoing: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    events: Mutex<mpsc::UnboundedSender<TransportEvent>>,
    task: Mutex<Option<JoinHandle<()>>>,
    manual_close: AtomicBool,
}

impl Transport {
    pub fn new(
        config: &EngineConfig,
        auth_token: Option<String>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let transport = Arc::new(Self {
            url: config.server_url.clone(),
            auth_token,
            connect_timeout: config.connect_timeout(),
            heartbeat_interval: config.heartbeat_interval(),
            reconnect_base: config.reconnect_base(),
            reconnect_max: config.reconnect_max(),
            state_tx,
            outgoing: Mutex::new(None),
            events: Mutex::new(events),
            task: Mutex::new(None),
            manual_close: AtomicBool::new(false),
        });
        (transport, events_rx)
    }

    /// Replaces the event channel. Events from then on go to the returned
    /// receiver only.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<TransportEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.events.lock().unwrap_or_else(|p| p.into_inner()) = tx;
        rx
    }

    fn emit(&self, event: TransportEvent) {
        let events = self.events.lock().unwrap_or_else(|p| p.into_inner());
        if events.send(event).is_err() {
            debug!("no event receiver, dropping event");
        }
    }

    pub fn current_state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    /// Starts the connection loop unless it is already running.
    pub fn connect(self: &Arc<Self>) {
        self.manual_close.store(false, Ordering::SeqCst);
        let mut task = self.task.lock().unwrap_or_else(|p| p.into_inner());
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let this = Arc::clone(self);
        *task = Some(tokio::spawn(async move { this.supervise().await }));
    }

    pub fn ensure_connected(self: &Arc<Self>) {
        self.connect();
    }

    /// Closes the connection and cancels heartbeat and reconnect timers.
    pub fn disconnect(&self) {
        self.manual_close.store(true, Ordering::SeqCst);
        if let Some(task) = self.task.lock().unwrap_or_else(|p| p.into_inner()).take() {
            task.abort();
        }
        self.set_outgoing(None);
        self.set_state(ConnectionState::Closed);
    }

    pub async fn wait_for_connection(&self, timeout: Duration) -> bool {
        wait_for_connection(self.state_tx.subscribe(), timeout).await
    }

    fn set_state(&self, state: ConnectionState) {
        // A task being aborted must not overwrite Closed
        if state != ConnectionState::Closed && self.manual_close.load(Ordering::SeqCst) {
            return;
        }
        debug!(?state, "transport state");
        self.state_tx.send_replace(state);
    }

    fn set_outgoing(&self, sender: Option<mpsc::UnboundedSender<Vec<u8>>>) {
        *self.outgoing.lock().unwrap_or_else(|p| p.into_inner()) = sender;
    }

    async fn supervise(self: Arc<Self>) {
        let mut backoff = Backoff::new(self.reconnect_base, self.reconnect_max);

        loop {
            self.set_state(ConnectionState::Connecting);
            match self.open_with_timeout().await {
                Ok(stream) => {
                    backoff.reset();
                    info!(url = %self.url, "connected");
                    self.run_connection(stream).await;
                    warn!("connection lost");
                }
                Err(e) => warn!(error = %e, "connect failed"),
            }

            if self.manual_close.load(Ordering::SeqCst) {
                self.set_state(ConnectionState::Closed);
                return;
            }

            let delay = backoff.next_delay();
            info!(
                attempt = backoff.attempt(),
                delay_ms = delay.as_millis() as u64,
                "reconnect scheduled"
            );
            self.set_state(ConnectionState::Reconnecting {
                attempt: backoff.attempt(),
                delay,
            });
            tokio::time::sleep(delay).await;
        }
    }

    async fn open_with_timeout(
        &self,
    ) -> Result<
        tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    > {
        tokio::time::timeout(self.connect_timeout, self.open())
            .await
            .map_err(|_| Error::ConnectTimeout)?
    }

    async fn open(
        &self,
    ) -> Result<
        tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    > {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| Error::Connection(e.to_string()))?;
        if let Some(token) = &self.auth_token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| Error::Connection(e.to_string()))?;
            request.headers_mut().insert("Authorization", value);
        }

        let (stream, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;
        Ok(stream)
    }

    async fn run_connection(
        &self,
        stream: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    ) {
        let (mut write, mut read) = stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        self.set_outgoing(Some(tx));
        self.set_state(ConnectionState::Connected);
        self.emit(TransportEvent::Connected);

        let mut heartbeat = tokio::time::interval_at(
            tokio::time::Instant::now() + self.heartbeat_interval,
            self.heartbeat_interval,
        );

        loop {
            tokio::select! {
                Some(bytes) = rx.recv() => {
                    if let Err(e) = write.send(Message::Binary(bytes)).await {
                        warn!(error = %e, "write failed");
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    match wire::encode(&Frame::Ping {}) {
                        Ok(bytes) => {
                            if let Err(e) = write.send(Message::Binary(bytes)).await {
                                warn!(error = %e, "heartbeat failed");
                                break;
                            }
                        }
                        Err(e) => warn!(error = %e, "failed to encode heartbeat"),
                    }
                }
                incoming = read.next() => match incoming {
                    Some(Ok(Message::Binary(data))) => match wire::decode(&data) {
                        Ok(Frame::Ping {}) => {}
                        Ok(frame) => {
                            debug!(frame = frame.name(), "received frame");
                            self.emit(TransportEvent::Frame(frame));
                        }
                        Err(e) => warn!(error = %e, "dropping undecodable frame"),
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "read failed");
                        break;
                    }
                }
            }
        }

        self.set_outgoing(None);
        self.set_state(ConnectionState::Disconnected);
    }
}

impl Link for Transport {
    fn send(&self, frame: &Frame) -> Result<()> {
        if *self.state_tx.borrow() != ConnectionState::Connected {
            return Err(Error::NotConnected);
        }
        let bytes = wire::encode(frame)?;
        let outgoing = self.outgoing.lock().unwrap_or_else(|p| p.into_inner());
        match outgoing.as_ref() {
            Some(tx) => tx.send(bytes).map_err(|_| Error::NotConnected),
            None => Err(Error::NotConnected),
        }
    }

    fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }
}
