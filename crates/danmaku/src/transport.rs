//! Transport connector: one live connection per session.
//!
//! The connector spawns a single background task per session. That task owns
//! the connection, the codec buffer, the heartbeat timer and the reconnect
//! loop. Callers only talk to it through channels:
//!
//! - commands (`mpsc`) for raw frames and chat messages,
//! - state (`watch`) for observing the lifecycle,
//! - a [`CancellationToken`] for shutdown.
//!
//! ```text
//! Idle -> Connecting -> Connected -> Disconnecting -> Disconnected
//!                          |  ^
//!                          v  |
//!                      Reconnecting
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::chat::{ChatSender, OutboundChat};
use crate::codec::{FrameCodec, Operation};
use crate::config::ClientConfig;
use crate::credentials::Credentials;
use crate::dispatcher::Dispatcher;
use crate::error::{DanmakuError, Result};
use crate::http;
use crate::protocol::{self, Endpoint, EndpointResolver};

/// Lifecycle of a session's connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    /// Waiting to retry after losing the connection.
    Reconnecting { attempt: u32 },
    Disconnecting,
    /// Terminal. `reason` is set when the session ended on its own
    /// (auth rejected, retries exhausted) rather than through `disconnect()`.
    Disconnected { reason: Option<String> },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(self, Self::Disconnected { .. })
    }
}

/// A bidirectional message connection carrying binary frames.
#[async_trait]
pub trait Connection: Send {
    async fn send(&mut self, data: Bytes) -> Result<()>;

    /// Next binary payload. `Ok(None)` when the peer closed the connection.
    async fn recv(&mut self) -> Result<Option<Bytes>>;

    async fn close(&mut self) -> Result<()>;
}

pub type BoxConnection = Box<dyn Connection>;

/// Opens connections to a resolved endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &Endpoint) -> Result<BoxConnection>;
}

/// WebSocket connector.
#[derive(Debug, Clone)]
pub struct WsConnector {
    headers: Vec<(String, String)>,
}

impl WsConnector {
    pub fn new(config: &ClientConfig) -> Self {
        http::install_rustls_provider();
        Self {
            headers: protocol::upgrade_headers(config),
        }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<BoxConnection> {
        let mut request = endpoint
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| DanmakuError::network(format!("invalid endpoint {}: {}", endpoint.url, e)))?;

        for (name, value) in &self.headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    request.headers_mut().insert(name, value);
                }
                _ => warn!(header = %name, "Skipping invalid upgrade header"),
            }
        }

        info!("Connecting to WebSocket: {}", endpoint.url);
        let (stream, _) = connect_async(request).await?;
        Ok(Box::new(WsConnection { stream }))
    }
}

struct WsConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Connection for WsConnection {
    async fn send(&mut self, data: Bytes) -> Result<()> {
        self.stream.send(Message::Binary(data)).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<Bytes>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Binary(data))) => return Ok(Some(data)),
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "WebSocket closed by peer");
                    return Ok(None);
                }
                // Pings are answered by tungstenite itself.
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(None),
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.stream.close(None).await?;
        Ok(())
    }
}

/// Work handed from callers to the background task.
enum Command {
    SendRaw {
        data: Bytes,
        reply: oneshot::Sender<Result<()>>,
    },
    SendChat {
        text: String,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Bookkeeping for the running background task.
struct ActiveSession {
    room_id: u64,
    command_tx: mpsc::Sender<Command>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Owns at most one live connection and its background task.
pub struct TransportConnector {
    config: ClientConfig,
    resolver: Arc<dyn EndpointResolver>,
    connector: Arc<dyn Connector>,
    chat_sender: Arc<dyn ChatSender>,
    dispatcher: Dispatcher,
    state_tx: watch::Sender<ConnectionState>,
    sequence: Arc<AtomicU32>,
    active: Mutex<Option<ActiveSession>>,
}

impl TransportConnector {
    pub fn new(
        config: ClientConfig,
        resolver: Arc<dyn EndpointResolver>,
        connector: Arc<dyn Connector>,
        chat_sender: Arc<dyn ChatSender>,
        dispatcher: Dispatcher,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        Self {
            config,
            resolver,
            connector,
            chat_sender,
            dispatcher,
            state_tx,
            sequence: Arc::new(AtomicU32::new(1)),
            active: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Room id of the running session, if any.
    pub fn room_id(&self) -> Option<u64> {
        self.active.lock().as_ref().map(|a| a.room_id)
    }

    /// Start a session and wait until it is connected.
    ///
    /// Calling this again for the room that is already running just waits
    /// for that session; a different room replaces it.
    pub async fn connect(&self, room_id: u64, credentials: Credentials) -> Result<()> {
        if let Err(e) = credentials.validate() {
            warn!(room_id, error = %e, "Refusing to connect without credentials");
            self.state_tx.send_replace(ConnectionState::Disconnected {
                reason: Some(e.to_string()),
            });
            return Err(e);
        }

        let ready_rx = loop {
            let switch_from = {
                let mut active = self.active.lock();
                // A session that already published Disconnected is finished even
                // if its task has not returned yet.
                let ended = self.state_tx.borrow().is_disconnected();
                match active.as_ref().filter(|a| !ended && !a.task.is_finished()) {
                    Some(a) if a.room_id == room_id => None,
                    Some(a) => Some(a.room_id),
                    None => {
                        if let Some(stale) = active.take() {
                            stale.cancel.cancel();
                        }
                        let (session, ready_rx) = self.spawn_session(room_id, credentials.clone());
                        *active = Some(session);
                        break Some(ready_rx);
                    }
                }
            };
            match switch_from {
                None => break None,
                Some(current) => {
                    info!(from = current, to = room_id, "Switching danmaku room");
                    self.disconnect().await;
                }
            }
        };

        let Some(ready_rx) = ready_rx else {
            return self.wait_connected().await;
        };

        // A connect interrupted by disconnect() reports a network failure.
        match ready_rx.await {
            Ok(Err(DanmakuError::Cancelled)) | Err(_) => Err(DanmakuError::network("cancelled")),
            Ok(result) => result,
        }
    }

    fn spawn_session(
        &self,
        room_id: u64,
        credentials: Credentials,
    ) -> (ActiveSession, oneshot::Receiver<Result<()>>) {
        let (command_tx, command_rx) = mpsc::channel(self.config.command_capacity.max(1));
        let (ready_tx, ready_rx) = oneshot::channel();
        let cancel = CancellationToken::new();

        self.state_tx.send_replace(ConnectionState::Connecting);

        let task = SessionTask {
            ctx: SessionContext {
                room_id,
                credentials,
                config: self.config.clone(),
                resolver: self.resolver.clone(),
                connector: self.connector.clone(),
                chat_sender: self.chat_sender.clone(),
                dispatcher: self.dispatcher.clone(),
                sequence: self.sequence.clone(),
            },
            state_tx: self.state_tx.clone(),
            command_rx,
            cancel: cancel.clone(),
            chat_tasks: JoinSet::new(),
        };
        let task = tokio::spawn(task.run(ready_tx));

        let session = ActiveSession {
            room_id,
            command_tx,
            cancel,
            task,
        };
        (session, ready_rx)
    }

    async fn wait_connected(&self) -> Result<()> {
        let mut rx = self.state_tx.subscribe();
        let state = rx
            .wait_for(|s| s.is_connected() || s.is_disconnected())
            .await
            .map_err(|_| DanmakuError::network("cancelled"))?
            .clone();
        match state {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Disconnected { reason } => Err(DanmakuError::network(
                reason.unwrap_or_else(|| "cancelled".to_string()),
            )),
            _ => Err(DanmakuError::network("cancelled")),
        }
    }

    /// Stop the session. Idempotent and bounded by the drain timeout.
    pub async fn disconnect(&self) {
        let Some(active) = self.active.lock().take() else {
            return;
        };

        if !self.state_tx.borrow().is_disconnected() {
            self.state_tx.send_replace(ConnectionState::Disconnecting);
        }
        active.cancel.cancel();

        let mut task = active.task;
        if tokio::time::timeout(self.config.drain_timeout(), &mut task)
            .await
            .is_err()
        {
            warn!(room_id = active.room_id, "Session task did not stop in time, aborting");
            task.abort();
        }

        self.state_tx.send_if_modified(|state| {
            if state.is_disconnected() {
                false
            } else {
                *state = ConnectionState::Disconnected { reason: None };
                true
            }
        });
        debug!(room_id = active.room_id, "Session disconnected");
    }

    fn command_sender(&self) -> Result<mpsc::Sender<Command>> {
        if !self.state_tx.borrow().is_connected() {
            return Err(DanmakuError::NotConnected);
        }
        self.active
            .lock()
            .as_ref()
            .map(|a| a.command_tx.clone())
            .ok_or(DanmakuError::NotConnected)
    }

    /// Write a raw, already encoded frame on the open connection.
    pub async fn send(&self, data: Bytes) -> Result<()> {
        let tx = self.command_sender()?;
        let (reply, rx) = oneshot::channel();
        tx.send(Command::SendRaw { data, reply })
            .await
            .map_err(|_| DanmakuError::NotConnected)?;
        rx.await.map_err(|_| DanmakuError::NotConnected)?
    }

    /// Queue a chat message without waiting. The returned receiver yields
    /// the outcome once the background task has tried to send it.
    pub fn send_chat(&self, text: String) -> Result<oneshot::Receiver<Result<()>>> {
        let tx = self.command_sender()?;
        let (reply, rx) = oneshot::channel();
        tx.try_send(Command::SendChat { text, reply })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    DanmakuError::network("command queue is full")
                }
                mpsc::error::TrySendError::Closed(_) => DanmakuError::NotConnected,
            })?;
        Ok(rx)
    }
}

impl Drop for TransportConnector {
    fn drop(&mut self) {
        if let Some(active) = self.active.get_mut().take() {
            active.cancel.cancel();
        }
    }
}

/// An authenticated connection plus its read buffer.
struct Live {
    endpoint: Endpoint,
    conn: BoxConnection,
    codec: FrameCodec,
    buffer: BytesMut,
}

/// Why the read loop returned.
enum PumpExit {
    Cancelled,
    Lost(DanmakuError),
}

/// Read-only parts of a session, shared by reference across awaits.
struct SessionContext {
    room_id: u64,
    credentials: Credentials,
    config: ClientConfig,
    resolver: Arc<dyn EndpointResolver>,
    connector: Arc<dyn Connector>,
    chat_sender: Arc<dyn ChatSender>,
    dispatcher: Dispatcher,
    sequence: Arc<AtomicU32>,
}

/// The background task of one session.
struct SessionTask {
    ctx: SessionContext,
    state_tx: watch::Sender<ConnectionState>,
    command_rx: mpsc::Receiver<Command>,
    cancel: CancellationToken,
    chat_tasks: JoinSet<()>,
}

impl SessionContext {
    fn next_sequence(&self) -> u32 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    /// Resolve, connect and authenticate.
    async fn establish(&self) -> Result<Live> {
        let endpoint = self
            .resolver
            .resolve(self.room_id, &self.credentials)
            .await?;
        let mut conn = self.connector.connect(&endpoint).await?;

        let auth = protocol::auth_frame(&endpoint, &self.credentials, self.next_sequence())?;
        conn.send(auth.to_bytes()).await?;

        let mut codec = FrameCodec::new();
        let mut buffer = BytesMut::new();
        let handshake = self.await_auth_reply(&mut conn, &mut codec, &mut buffer);
        let outcome = match tokio::time::timeout(self.config.handshake_timeout(), handshake).await {
            Ok(result) => result,
            Err(_) => Err(DanmakuError::network("handshake timed out")),
        };
        if let Err(e) = outcome {
            let _ = tokio::time::timeout(self.config.drain_timeout(), conn.close()).await;
            return Err(e);
        }

        Ok(Live {
            endpoint,
            conn,
            codec,
            buffer,
        })
    }

    async fn await_auth_reply(
        &self,
        conn: &mut BoxConnection,
        codec: &mut FrameCodec,
        buffer: &mut BytesMut,
    ) -> Result<()> {
        loop {
            match codec.decode(buffer) {
                Ok(Some(frame)) if frame.operation == Operation::AuthReply => {
                    protocol::check_auth_reply(&frame.body)?;
                    self.dispatcher.dispatch_frame(&frame);
                    return Ok(());
                }
                Ok(Some(frame)) => {
                    self.dispatcher.dispatch_frame(&frame);
                }
                Ok(None) => match conn.recv().await? {
                    Some(data) => buffer.extend_from_slice(&data),
                    None => return Err(DanmakuError::network("connection closed during handshake")),
                },
                Err(e) => warn!(error = %e, "Dropping malformed frame during handshake"),
            }
        }
    }

    fn drain_frames(&self, live: &mut Live) {
        loop {
            match live.codec.decode(&mut live.buffer) {
                Ok(Some(frame)) => {
                    self.dispatcher.dispatch_frame(&frame);
                }
                Ok(None) => break,
                Err(e) => warn!(error = %e, "Dropping malformed frame"),
            }
        }
    }
}

impl SessionTask {
    async fn run(mut self, ready: oneshot::Sender<Result<()>>) {
        let mut ready = Some(ready);
        let mut attempt: u32 = 0;
        let mut reason: Option<String> = None;

        loop {
            let established = tokio::select! {
                _ = self.cancel.cancelled() => Err(DanmakuError::Cancelled),
                result = self.ctx.establish() => result,
            };

            match established {
                Ok(mut live) => {
                    attempt = 0;
                    info!(room_id = live.endpoint.room_id, "Danmaku session connected");
                    self.state_tx.send_replace(ConnectionState::Connected);
                    if let Some(tx) = ready.take() {
                        let _ = tx.send(Ok(()));
                    }

                    match self.pump(&mut live).await {
                        PumpExit::Cancelled => break,
                        PumpExit::Lost(e) => {
                            warn!(room_id = self.ctx.room_id, error = %e, "Connection lost");
                            reason = Some(e.to_string());
                        }
                    }
                }
                Err(DanmakuError::Cancelled) => {
                    if let Some(tx) = ready.take() {
                        let _ = tx.send(Err(DanmakuError::Cancelled));
                    }
                    break;
                }
                Err(e) if ready.is_some() || !e.is_retryable() => {
                    error!(room_id = self.ctx.room_id, error = %e, "Danmaku session failed");
                    self.state_tx.send_replace(ConnectionState::Disconnected {
                        reason: Some(e.to_string()),
                    });
                    if let Some(tx) = ready.take() {
                        let _ = tx.send(Err(e));
                    }
                    return;
                }
                Err(e) => {
                    warn!(room_id = self.ctx.room_id, attempt, error = %e, "Reconnect attempt failed");
                    reason = Some(e.to_string());
                }
            }

            attempt += 1;
            if !self.ctx.config.reconnect.should_retry(attempt) {
                let last = reason.take().unwrap_or_default();
                error!(
                    room_id = self.ctx.room_id,
                    attempts = attempt - 1,
                    "Max reconnect attempts reached"
                );
                self.state_tx.send_replace(ConnectionState::Disconnected {
                    reason: Some(format!("reconnect attempts exhausted: {}", last)),
                });
                return;
            }

            self.state_tx
                .send_replace(ConnectionState::Reconnecting { attempt });
            let delay = self.ctx.config.reconnect.delay_for_attempt(attempt);
            debug!(room_id = self.ctx.room_id, attempt, delay_ms = delay.as_millis() as u64, "Reconnecting");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.cancel.cancelled() => break,
            }
        }

        debug!("Danmaku task for {} stopped", self.ctx.room_id);
    }

    async fn pump(&mut self, live: &mut Live) -> PumpExit {
        let mut heartbeat = tokio::time::interval(self.ctx.config.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        // Frames that arrived together with the auth reply.
        self.ctx.drain_frames(live);

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    self.state_tx.send_replace(ConnectionState::Disconnecting);
                    let _ = tokio::time::timeout(self.ctx.config.drain_timeout(), live.conn.close()).await;
                    return PumpExit::Cancelled;
                }

                _ = heartbeat.tick() => {
                    let frame = protocol::heartbeat_frame(self.ctx.next_sequence());
                    if let Err(e) = live.conn.send(frame.to_bytes()).await {
                        return PumpExit::Lost(e);
                    }
                    trace!("Sent heartbeat for {}", self.ctx.room_id);
                }

                Some(command) = self.command_rx.recv() => {
                    if let Err(e) = self.handle_command(command, live).await {
                        return PumpExit::Lost(e);
                    }
                }

                Some(_) = self.chat_tasks.join_next(), if !self.chat_tasks.is_empty() => {}

                received = live.conn.recv() => {
                    match received {
                        Ok(Some(data)) => {
                            live.buffer.extend_from_slice(&data);
                            self.ctx.drain_frames(live);
                        }
                        Ok(None) => return PumpExit::Lost(DanmakuError::network("connection closed by peer")),
                        Err(e) => return PumpExit::Lost(e),
                    }
                }
            }
        }
    }

    /// Returns an error only when the connection itself failed.
    async fn handle_command(&mut self, command: Command, live: &mut Live) -> Result<()> {
        match command {
            Command::SendRaw { data, reply } => match live.conn.send(data).await {
                Ok(()) => {
                    let _ = reply.send(Ok(()));
                    Ok(())
                }
                Err(e) => {
                    let _ = reply.send(Err(DanmakuError::network(e.to_string())));
                    Err(e)
                }
            },
            Command::SendChat { text, reply } => {
                let chat = match OutboundChat::new(live.endpoint.room_id, text, &self.ctx.credentials) {
                    Ok(chat) => chat,
                    Err(e) => {
                        let _ = reply.send(Err(e));
                        return Ok(());
                    }
                };

                // Posting must not stall the read loop.
                let sender = self.ctx.chat_sender.clone();
                let credentials = self.ctx.credentials.clone();
                self.chat_tasks.spawn(async move {
                    let result = sender.send(&chat, &credentials).await;
                    match &result {
                        Ok(()) => info!(room_id = chat.room_id, "Chat message sent"),
                        Err(e) => warn!(room_id = chat.room_id, error = %e, "Failed to send chat message"),
                    }
                    let _ = reply.send(result);
                });
                Ok(())
            }
        }
    }
}
