//! In-memory stand-ins for the network seams.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use danmaku::codec::{self, Frame, Operation};
use danmaku::{
    BoxConnection, ChatSender, ClientConfig, Connection, Connector, Credentials, DanmakuError,
    Endpoint, EndpointResolver, OutboundChat, ReconnectPolicy, Result, SessionClient,
};
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc;

pub const REAL_ROOM_OFFSET: u64 = 1000;

pub fn credentials() -> Credentials {
    Credentials::new("sessdata-value", "jct-value", "buvid3-value", "42")
}

pub fn fast_config() -> ClientConfig {
    ClientConfig::default().with_reconnect(ReconnectPolicy {
        max_attempts: 5,
        base_delay_ms: 100,
        max_delay_ms: 1_000,
        jitter: false,
    })
}

pub fn chat_frame(sender: &str, text: &str) -> Frame {
    let body = json!({
        "cmd": "DANMU_MSG",
        "info": [[0, 1, 25, 16777215, 1700000000000u64], text, [7, sender, 0, 0]],
    });
    Frame::new(Operation::Notification, body.to_string().into_bytes()).with_version(
        danmaku::ProtocolVersion::RawJson,
    )
}

pub fn heartbeat_reply_frame(popularity: u32) -> Frame {
    Frame::new(Operation::HeartbeatReply, popularity.to_be_bytes().to_vec())
}

/// How the next `connect()` on the mock behaves.
#[derive(Debug, Clone, Copy)]
pub enum Script {
    /// Accept and answer the handshake with this code.
    Accept { auth_code: i64 },
    Refuse,
    /// Accept but never answer the handshake.
    Silent,
    /// Never complete the connect.
    Hang,
    /// Complete the handshake, then never finish another write or a close.
    Unresponsive,
}

/// Server side of one accepted connection.
#[derive(Clone)]
pub struct ServerConn {
    inbound: mpsc::UnboundedSender<Option<Bytes>>,
    sent: Arc<Mutex<Vec<Frame>>>,
    closed: Arc<AtomicBool>,
}

impl ServerConn {
    pub fn push(&self, frame: Frame) {
        let _ = self.inbound.send(Some(frame.to_bytes()));
    }

    pub fn push_raw(&self, bytes: Bytes) {
        let _ = self.inbound.send(Some(bytes));
    }

    pub fn close(&self) {
        let _ = self.inbound.send(None);
    }

    /// Whether the client called `close()`.
    pub fn was_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Frames the client wrote, in order.
    pub fn sent(&self) -> Vec<Frame> {
        self.sent.lock().clone()
    }
}

struct MockConnection {
    auth_code: Option<i64>,
    stall: bool,
    closed: Arc<AtomicBool>,
    inbound_tx: mpsc::UnboundedSender<Option<Bytes>>,
    inbound_rx: mpsc::UnboundedReceiver<Option<Bytes>>,
    sent: Arc<Mutex<Vec<Frame>>>,
}

#[async_trait]
impl Connection for MockConnection {
    async fn send(&mut self, data: Bytes) -> Result<()> {
        let (frame, _) = codec::decode(&data)?;
        if self.stall && frame.operation != Operation::Auth {
            futures::future::pending::<()>().await;
        }
        if frame.operation == Operation::Auth {
            if let Some(code) = self.auth_code {
                let reply = Frame::new(
                    Operation::AuthReply,
                    json!({ "code": code }).to_string().into_bytes(),
                );
                let _ = self.inbound_tx.send(Some(reply.to_bytes()));
            }
        }
        self.sent.lock().push(frame);
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<Bytes>> {
        match self.inbound_rx.recv().await {
            Some(Some(bytes)) => Ok(Some(bytes)),
            Some(None) | None => Ok(None),
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        if self.stall {
            futures::future::pending::<()>().await;
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MockServer {
    script: Mutex<VecDeque<Script>>,
    connects: AtomicUsize,
    resolves: AtomicUsize,
    conns: Mutex<Vec<ServerConn>>,
}

impl MockServer {
    pub fn new(script: impl IntoIterator<Item = Script>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into_iter().collect()),
            ..Default::default()
        })
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn resolve_count(&self) -> usize {
        self.resolves.load(Ordering::SeqCst)
    }

    /// Most recently accepted connection.
    pub fn latest(&self) -> ServerConn {
        self.conns
            .lock()
            .last()
            .cloned()
            .expect("no connection accepted yet")
    }
}

#[async_trait]
impl Connector for MockServer {
    async fn connect(&self, _endpoint: &Endpoint) -> Result<BoxConnection> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let script = self
            .script
            .lock()
            .pop_front()
            .unwrap_or(Script::Accept { auth_code: 0 });

        let (auth_code, stall) = match script {
            Script::Accept { auth_code } => (Some(auth_code), false),
            Script::Unresponsive => (Some(0), true),
            Script::Silent => (None, false),
            Script::Refuse => return Err(DanmakuError::network("connection refused")),
            Script::Hang => {
                futures::future::pending::<()>().await;
                return Err(DanmakuError::network("unreachable"));
            }
        };

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let sent = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(AtomicBool::new(false));
        self.conns.lock().push(ServerConn {
            inbound: inbound_tx.clone(),
            sent: sent.clone(),
            closed: closed.clone(),
        });

        Ok(Box::new(MockConnection {
            auth_code,
            stall,
            closed,
            inbound_tx,
            inbound_rx,
            sent,
        }))
    }
}

#[async_trait]
impl EndpointResolver for MockServer {
    async fn resolve(&self, room_id: u64, _credentials: &Credentials) -> Result<Endpoint> {
        self.resolves.fetch_add(1, Ordering::SeqCst);
        Ok(Endpoint {
            url: "wss://mock.invalid/sub".to_string(),
            token: "token".to_string(),
            room_id: room_id + REAL_ROOM_OFFSET,
        })
    }
}

/// Records posted chat and answers with a fixed outcome.
#[derive(Default)]
pub struct RecordingSender {
    pub sent: Mutex<Vec<(OutboundChat, Credentials)>>,
    pub reject_with: Option<i64>,
}

impl RecordingSender {
    pub fn count(&self) -> usize {
        self.sent.lock().len()
    }
}

#[async_trait]
impl ChatSender for RecordingSender {
    async fn send(&self, chat: &OutboundChat, credentials: &Credentials) -> Result<()> {
        self.sent.lock().push((chat.clone(), credentials.clone()));
        match self.reject_with {
            Some(code) => Err(DanmakuError::Send {
                code,
                message: "rejected".to_string(),
            }),
            None => Ok(()),
        }
    }
}

/// Route library logs to the test output; filter with `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn client(
    config: ClientConfig,
    server: &Arc<MockServer>,
    sender: &Arc<RecordingSender>,
) -> SessionClient {
    init_tracing();
    SessionClient::builder(config)
        .resolver(server.clone())
        .connector(server.clone())
        .chat_sender(sender.clone())
        .build()
        .expect("client with mock seams")
}
