//! Session client: the public face of one danmaku session.
//!
//! All I/O runs on the transport's background task. Methods here only touch
//! channels and the handler registry, so they are safe to call from a UI
//! thread or any async task.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::{mpsc, oneshot, watch};
use tracing::debug;

use crate::chat::{ChatSender, HttpChatSender};
use crate::config::ClientConfig;
use crate::credentials::Credentials;
use crate::dispatcher::{self, ChatEvent, DanmuEvent, Dispatcher, EventKind, HandlerRegistry};
use crate::error::{DanmakuError, Result};
use crate::http;
use crate::protocol::{BilibiliResolver, EndpointResolver};
use crate::transport::{ConnectionState, Connector, TransportConnector, WsConnector};

/// Resolves to the outcome of one `send_chat_message` call.
#[derive(Debug)]
#[must_use = "a receipt does nothing unless awaited"]
pub struct SendReceipt {
    rx: oneshot::Receiver<Result<()>>,
}

impl Future for SendReceipt {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // The sender is dropped when the session stops before sending.
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(DanmakuError::NotConnected)))
    }
}

/// Builder for [`SessionClient`]. Any seam left unset uses the live
/// Bilibili implementation.
pub struct SessionClientBuilder {
    config: ClientConfig,
    resolver: Option<Arc<dyn EndpointResolver>>,
    connector: Option<Arc<dyn Connector>>,
    chat_sender: Option<Arc<dyn ChatSender>>,
}

impl SessionClientBuilder {
    pub fn resolver(mut self, resolver: Arc<dyn EndpointResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn chat_sender(mut self, chat_sender: Arc<dyn ChatSender>) -> Self {
        self.chat_sender = Some(chat_sender);
        self
    }

    pub fn build(self) -> Result<SessionClient> {
        // Only the live seams need an HTTP client.
        let client = match (&self.resolver, &self.chat_sender) {
            (Some(_), Some(_)) => None,
            _ => Some(http::build_client(&self.config)?),
        };

        let resolver: Arc<dyn EndpointResolver> = match self.resolver {
            Some(resolver) => resolver,
            None => Arc::new(BilibiliResolver::new(
                client.clone().unwrap_or_default(),
                &self.config,
            )),
        };
        let chat_sender: Arc<dyn ChatSender> = match self.chat_sender {
            Some(sender) => sender,
            None => Arc::new(HttpChatSender::new(
                client.unwrap_or_default(),
                &self.config,
            )),
        };
        let connector: Arc<dyn Connector> = match self.connector {
            Some(connector) => connector,
            None => Arc::new(WsConnector::new(&self.config)),
        };

        let registry = HandlerRegistry::new();
        let transport = TransportConnector::new(
            self.config,
            resolver,
            connector,
            chat_sender,
            Dispatcher::new(registry.clone()),
        );

        Ok(SessionClient {
            transport,
            registry,
        })
    }
}

/// One authenticated danmaku session.
pub struct SessionClient {
    transport: TransportConnector,
    registry: HandlerRegistry,
}

impl SessionClient {
    /// Client talking to the live Bilibili services.
    pub fn new(config: ClientConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn builder(config: ClientConfig) -> SessionClientBuilder {
        SessionClientBuilder {
            config,
            resolver: None,
            connector: None,
            chat_sender: None,
        }
    }

    /// Connect to `room_id` and wait until the handshake succeeds.
    pub async fn connect(&self, room_id: u64, credentials: Credentials) -> Result<()> {
        debug!(room_id, "Connecting danmaku session");
        self.transport.connect(room_id, credentials).await
    }

    /// Stop the session. Safe to call at any time, any number of times.
    pub async fn disconnect(&self) {
        self.transport.disconnect().await;
    }

    /// Register a chat handler. Handlers run on the background task.
    pub fn on_chat_message<F>(&self, handler: F)
    where
        F: Fn(&ChatEvent) + Send + Sync + 'static,
    {
        self.registry.on_chat(handler);
    }

    pub fn on_event<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(&DanmuEvent) + Send + Sync + 'static,
    {
        self.registry.register(kind, Arc::new(handler));
    }

    /// A fresh queue receiving every chat event from now on, for consumers
    /// that drain messages on their own task.
    pub fn chat_events(&self) -> mpsc::UnboundedReceiver<ChatEvent> {
        dispatcher::chat_queue(&self.registry)
    }

    /// Queue a chat message for the connected room.
    ///
    /// Fails immediately with [`DanmakuError::NotConnected`] when there is no
    /// live connection, and with [`DanmakuError::InvalidMessage`] for empty
    /// text. Otherwise the send happens in the background and the receipt
    /// resolves to its result.
    pub fn send_chat_message(&self, text: impl Into<String>) -> Result<SendReceipt> {
        let text = text.into();
        if !self.transport.state().is_connected() {
            return Err(DanmakuError::NotConnected);
        }
        if text.trim().is_empty() {
            return Err(DanmakuError::InvalidMessage("message is empty".to_string()));
        }
        let rx = self.transport.send_chat(text)?;
        Ok(SendReceipt { rx })
    }

    pub fn state(&self) -> ConnectionState {
        self.transport.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.transport.subscribe_state()
    }

    /// Room requested by the current session, if any.
    pub fn room_id(&self) -> Option<u64> {
        self.transport.room_id()
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.registry.handler_count(kind)
    }
}
