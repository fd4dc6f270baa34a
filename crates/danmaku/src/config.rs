//! Session client configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::ReconnectPolicy;

/// Default browser User-Agent sent to every Bilibili endpoint.
pub const DEFAULT_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36";

/// Fallback WebSocket endpoint when discovery yields no host.
pub const DEFAULT_WS_URL: &str = "wss://broadcastlv.chat.bilibili.com/sub";

/// Base URL of the live HTTP API.
pub const DEFAULT_LIVE_API: &str = "https://api.live.bilibili.com";

/// Origin/Referer used for live requests.
pub const LIVE_ORIGIN: &str = "https://live.bilibili.com";

/// Configuration for a [`SessionClient`](crate::SessionClient).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Seconds between heartbeat frames.
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// How long to wait for the auth reply after sending the handshake.
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// Upper bound on how long `disconnect()` waits for the background task.
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
    /// Capacity of the command channel between callers and the background task.
    #[serde(default = "default_command_capacity")]
    pub command_capacity: usize,
    /// Reconnect behaviour after transient network loss.
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
    /// Live API base URL.
    #[serde(default = "default_live_api")]
    pub live_api: String,
    /// WebSocket URL used when discovery returns no host.
    #[serde(default = "default_ws_url")]
    pub fallback_ws_url: String,
    /// User-Agent header.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Optional proxy for HTTP calls (discovery, chat sending, stream URL).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_proxy: Option<String>,
    /// Per-request HTTP timeout in milliseconds.
    #[serde(default = "default_http_timeout_ms")]
    pub http_timeout_ms: u64,
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}

fn default_handshake_timeout_ms() -> u64 {
    10_000
}

fn default_drain_timeout_ms() -> u64 {
    2_000
}

fn default_command_capacity() -> usize {
    64
}

fn default_live_api() -> String {
    DEFAULT_LIVE_API.to_string()
}

fn default_ws_url() -> String {
    DEFAULT_WS_URL.to_string()
}

fn default_user_agent() -> String {
    DEFAULT_UA.to_string()
}

fn default_http_timeout_ms() -> u64 {
    10_000
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            drain_timeout_ms: default_drain_timeout_ms(),
            command_capacity: default_command_capacity(),
            reconnect: ReconnectPolicy::default(),
            live_api: default_live_api(),
            fallback_ws_url: default_ws_url(),
            user_agent: default_user_agent(),
            http_proxy: None,
            http_timeout_ms: default_http_timeout_ms(),
        }
    }
}

impl ClientConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval_secs = interval.as_secs();
        self
    }
}
