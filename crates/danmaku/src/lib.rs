//! Danmaku: authenticated Bilibili live chat sessions.
//!
//! A [`SessionClient`] connects to a room's message endpoint, keeps the
//! connection alive with heartbeats, reconnects with backoff on transient
//! failures and fans decoded events out to registered handlers. Chat can be
//! sent on behalf of the logged-in user.
//!
//! ## Layers
//!
//! - [`codec`] - the 16-byte framed binary protocol, including zlib and
//!   brotli batches
//! - [`dispatcher`] - frame to event decoding and handler fan-out
//! - [`transport`] - connection lifecycle, heartbeat and reconnect loop
//! - [`session`] - the public client API
//!
//! ## Collaborators
//!
//! - [`credentials`] - cookie set and its JSON store
//! - [`protocol`] - handshake payloads and endpoint discovery
//! - [`chat`] - outbound chat over the HTTP API
//! - [`stream_url`] - playable stream URL lookup
//!
//! ## Example
//!
//! ```no_run
//! use danmaku::{ClientConfig, CredentialStore, SessionClient};
//!
//! # async fn run() -> danmaku::Result<()> {
//! let credentials = CredentialStore::new("credentials.json").load_or_create().await?;
//! let client = SessionClient::new(ClientConfig::default())?;
//! client.on_chat_message(|chat| println!("{}: {}", chat.sender, chat.text));
//! client.connect(21452505, credentials).await?;
//! client.send_chat_message("hello")?.await?;
//! client.disconnect().await;
//! # Ok(())
//! # }
//! ```

pub mod chat;
pub mod codec;
pub mod config;
pub mod credentials;
pub mod dispatcher;
pub mod error;
pub mod http;
pub mod protocol;
pub mod retry;
pub mod session;
pub mod stream_url;
pub mod transport;

pub use chat::{ChatSender, HttpChatSender, OutboundChat};
pub use codec::{Frame, FrameCodec, Operation, ProtocolVersion, decode, encode};
pub use config::ClientConfig;
pub use credentials::{CredentialStore, Credentials};
pub use dispatcher::{
    ChatEvent, DanmuEvent, Dispatcher, EventKind, Handler, HandlerRegistry, RoomNotice,
    RoomNoticeKind,
};
pub use error::{DanmakuError, Result};
pub use protocol::{BilibiliResolver, Endpoint, EndpointResolver};
pub use retry::ReconnectPolicy;
pub use session::{SendReceipt, SessionClient, SessionClientBuilder};
pub use stream_url::StreamUrlResolver;
pub use transport::{
    BoxConnection, Connection, ConnectionState, Connector, TransportConnector, WsConnector,
};
