//! Bilibili live message endpoint: handshake payloads and endpoint discovery.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::codec::{Frame, Operation};
use crate::config::{ClientConfig, LIVE_ORIGIN};
use crate::credentials::Credentials;
use crate::error::{DanmakuError, Result};

/// Body of the heartbeat frame, as sent by the web player.
pub const HEARTBEAT_BODY: &[u8] = b"[object Object]";

/// Compression requested in the handshake (3 = brotli).
const PROTOVER_BROTLI: u8 = 3;

/// Where and how to open the message connection for one room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// WebSocket URL.
    pub url: String,
    /// Token from discovery, sent as the handshake `key`.
    pub token: String,
    /// Real (long) room id.
    pub room_id: u64,
}

/// Resolves the endpoint for a room. Network lookups live behind this trait
/// so the transport can be driven without them.
#[async_trait]
pub trait EndpointResolver: Send + Sync {
    async fn resolve(&self, room_id: u64, credentials: &Credentials) -> Result<Endpoint>;
}

/// Authentication data sent in the handshake frame.
#[derive(Debug, Serialize)]
struct AuthData<'a> {
    uid: u64,
    roomid: u64,
    protover: u8,
    buvid: &'a str,
    platform: &'static str,
    #[serde(rename = "type")]
    auth_type: u8,
    key: &'a str,
}

/// Handshake reply body.
#[derive(Debug, Deserialize)]
struct AuthReply {
    code: i64,
}

/// Build the handshake frame for `endpoint`.
pub fn auth_frame(endpoint: &Endpoint, credentials: &Credentials, sequence: u32) -> Result<Frame> {
    let buvid = credentials.buvid3_or_generate();
    let auth = AuthData {
        uid: credentials.uid().unwrap_or(0),
        roomid: endpoint.room_id,
        protover: PROTOVER_BROTLI,
        buvid: &buvid,
        platform: "web",
        auth_type: 2,
        key: &endpoint.token,
    };
    let body = serde_json::to_vec(&auth)?;
    Ok(Frame::new(Operation::Auth, body).with_sequence(sequence))
}

/// Build a heartbeat frame.
pub fn heartbeat_frame(sequence: u32) -> Frame {
    Frame::new(Operation::Heartbeat, HEARTBEAT_BODY).with_sequence(sequence)
}

/// Check an auth reply body. A non-zero `code` means the credentials or
/// token were rejected.
pub fn check_auth_reply(body: &[u8]) -> Result<()> {
    let reply: AuthReply = serde_json::from_slice(body)
        .map_err(|e| DanmakuError::network(format!("unreadable auth reply: {}", e)))?;
    match reply.code {
        0 => Ok(()),
        code => Err(DanmakuError::auth(format!(
            "handshake rejected with code {}",
            code
        ))),
    }
}

/// Headers sent with the WebSocket upgrade request.
pub fn upgrade_headers(config: &ClientConfig) -> Vec<(String, String)> {
    vec![
        ("User-Agent".to_string(), config.user_agent.clone()),
        ("Origin".to_string(), LIVE_ORIGIN.to_string()),
        ("Referer".to_string(), LIVE_ORIGIN.to_string()),
    ]
}

/// Room init API response
#[derive(Debug, Deserialize)]
struct RoomInitResponse {
    code: i64,
    #[serde(default)]
    message: Option<String>,
    data: Option<RoomInitData>,
}

#[derive(Debug, Deserialize)]
struct RoomInitData {
    room_id: u64,
}

/// Discovery through the live HTTP API.
#[derive(Debug, Clone)]
pub struct BilibiliResolver {
    client: Client,
    live_api: String,
    fallback_ws_url: String,
}

impl BilibiliResolver {
    pub fn new(client: Client, config: &ClientConfig) -> Self {
        Self {
            client,
            live_api: config.live_api.trim_end_matches('/').to_string(),
            fallback_ws_url: config.fallback_ws_url.clone(),
        }
    }

    /// Get real room ID from short ID.
    async fn real_room_id(&self, room_id: u64) -> Result<u64> {
        let url = format!("{}/room/v1/Room/room_init?id={}", self.live_api, room_id);

        let resp: RoomInitResponse = self
            .client
            .get(&url)
            .header(reqwest::header::REFERER, LIVE_ORIGIN)
            .send()
            .await
            .map_err(|e| DanmakuError::network(format!("Failed to get room info: {}", e)))?
            .json()
            .await
            .map_err(|e| DanmakuError::network(format!("Failed to parse room info: {}", e)))?;

        if resp.code != 0 {
            return Err(DanmakuError::network(format!(
                "room_init returned code {}: {}",
                resp.code,
                resp.message.unwrap_or_default()
            )));
        }

        resp.data
            .map(|d| d.room_id)
            .ok_or_else(|| DanmakuError::network("No room data in response"))
    }

    /// Get WebSocket URL and token for the real room id.
    async fn danmu_info(&self, room_id: u64, credentials: &Credentials) -> Result<(String, String)> {
        let url = format!(
            "{}/xlive/web-room/v1/index/getDanmuInfo?id={}&type=0",
            self.live_api, room_id
        );

        let response = self
            .client
            .get(&url)
            .header(reqwest::header::REFERER, LIVE_ORIGIN)
            .header(reqwest::header::COOKIE, credentials.cookie_header())
            .send()
            .await
            .map_err(|e| DanmakuError::network(format!("Failed to get danmu info: {}", e)))?
            .text()
            .await
            .map_err(|e| DanmakuError::network(format!("Failed to read response: {}", e)))?;

        Ok(parse_danmu_info(&response, &self.fallback_ws_url))
    }
}

/// Extract `(ws_url, token)` from a getDanmuInfo body, falling back to the
/// default host with an empty token when the API reports an error.
fn parse_danmu_info(body: &str, fallback_ws_url: &str) -> (String, String) {
    let fallback = || (fallback_ws_url.to_string(), String::new());

    let Ok(json) = serde_json::from_str::<Value>(body) else {
        debug!("getDanmuInfo returned invalid JSON, using default WebSocket URL");
        return fallback();
    };

    let code = json.get("code").and_then(|v| v.as_i64()).unwrap_or(-1);
    if code != 0 {
        let msg = json
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        debug!(
            "getDanmuInfo returned error code {}: {}, using default WebSocket URL",
            code, msg
        );
        return fallback();
    }

    let Some(data) = json.get("data") else {
        return fallback();
    };

    let token = data
        .get("token")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();

    let ws_url = data
        .get("host_list")
        .and_then(|v| v.as_array())
        .and_then(|list| list.first())
        .and_then(|host| {
            let h = host.get("host")?.as_str()?;
            let p = host.get("wss_port")?.as_u64()?;
            Some(format!("wss://{}:{}/sub", h, p))
        })
        .unwrap_or_else(|| fallback_ws_url.to_string());

    (ws_url, token)
}

#[async_trait]
impl EndpointResolver for BilibiliResolver {
    async fn resolve(&self, room_id: u64, credentials: &Credentials) -> Result<Endpoint> {
        let real_room_id = self.real_room_id(room_id).await?;
        let (url, token) = self.danmu_info(real_room_id, credentials).await?;
        debug!(room_id, real_room_id, url = %url, "Resolved danmu endpoint");
        Ok(Endpoint {
            url,
            token,
            room_id: real_room_id,
        })
    }
}
