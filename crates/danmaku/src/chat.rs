//! Outbound chat messages.
//!
//! The live endpoint only pushes; chat is posted to the HTTP `msg/send` API
//! using the session's cookies and CSRF token. The session hands the request
//! to its background task, which calls the configured [`ChatSender`].

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{ClientConfig, LIVE_ORIGIN};
use crate::credentials::Credentials;
use crate::error::{DanmakuError, Result};

/// Default chat color (white).
pub const DEFAULT_COLOR: u32 = 0xFF_FFFF;

/// Default font size used by the web player.
pub const DEFAULT_FONT_SIZE: u32 = 25;

/// Scrolling display mode.
pub const MODE_SCROLL: u32 = 1;

/// A chat message ready to be posted for a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutboundChat {
    pub room_id: u64,
    pub text: String,
    /// CSRF token (`bili_jct`) of the authenticated session.
    pub csrf: String,
    pub color: u32,
    pub font_size: u32,
    pub mode: u32,
    /// Client nonce, seconds since epoch.
    pub rnd: i64,
}

impl OutboundChat {
    pub fn new(room_id: u64, text: impl Into<String>, credentials: &Credentials) -> Result<Self> {
        let text = text.into();
        if text.trim().is_empty() {
            return Err(DanmakuError::InvalidMessage("message is empty".to_string()));
        }
        if credentials.csrf().is_empty() {
            return Err(DanmakuError::auth("bili_jct is empty, cannot send chat"));
        }
        Ok(Self {
            room_id,
            text,
            csrf: credentials.csrf().to_string(),
            color: DEFAULT_COLOR,
            font_size: DEFAULT_FONT_SIZE,
            mode: MODE_SCROLL,
            rnd: chrono::Utc::now().timestamp(),
        })
    }

    /// Form fields expected by `msg/send`.
    pub fn form(&self) -> Vec<(&'static str, String)> {
        vec![
            ("bubble", "0".to_string()),
            ("msg", self.text.clone()),
            ("color", self.color.to_string()),
            ("mode", self.mode.to_string()),
            ("fontsize", self.font_size.to_string()),
            ("rnd", self.rnd.to_string()),
            ("roomid", self.room_id.to_string()),
            ("csrf", self.csrf.clone()),
            ("csrf_token", self.csrf.clone()),
        ]
    }
}

/// Performs the actual send. Runs on the session's background task.
#[async_trait]
pub trait ChatSender: Send + Sync {
    async fn send(&self, chat: &OutboundChat, credentials: &Credentials) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    code: i64,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    msg: Option<String>,
}

/// Posts chat through the live HTTP API.
#[derive(Debug, Clone)]
pub struct HttpChatSender {
    client: Client,
    live_api: String,
}

impl HttpChatSender {
    pub fn new(client: Client, config: &ClientConfig) -> Self {
        Self {
            client,
            live_api: config.live_api.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl ChatSender for HttpChatSender {
    async fn send(&self, chat: &OutboundChat, credentials: &Credentials) -> Result<()> {
        let url = format!("{}/msg/send", self.live_api);

        let resp: SendResponse = self
            .client
            .post(&url)
            .header(reqwest::header::REFERER, LIVE_ORIGIN)
            .header(reqwest::header::ORIGIN, LIVE_ORIGIN)
            .header(reqwest::header::COOKIE, credentials.cookie_header())
            .form(&chat.form())
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        check_send_response(resp)?;
        debug!(room_id = chat.room_id, "Chat message accepted");
        Ok(())
    }
}

fn check_send_response(resp: SendResponse) -> Result<()> {
    if resp.code == 0 {
        return Ok(());
    }
    let message = resp
        .message
        .filter(|m| !m.is_empty())
        .or(resp.msg)
        .unwrap_or_else(|| "unknown".to_string());
    if resp.code == -101 {
        return Err(DanmakuError::auth(format!("not logged in: {}", message)));
    }
    Err(DanmakuError::Send {
        code: resp.code,
        message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> Credentials {
        Credentials::new("sess", "csrf-token", "buvid", "1")
    }

    #[test]
    fn test_outbound_chat_carries_csrf_and_room() {
        let chat = OutboundChat::new(21452505, "hello", &creds()).unwrap();
        let form = chat.form();
        let get = |k: &str| form.iter().find(|(key, _)| *key == k).map(|(_, v)| v.as_str());

        assert_eq!(get("msg"), Some("hello"));
        assert_eq!(get("roomid"), Some("21452505"));
        assert_eq!(get("csrf"), Some("csrf-token"));
        assert_eq!(get("csrf_token"), Some("csrf-token"));
        assert_eq!(get("color"), Some("16777215"));
        assert_eq!(get("fontsize"), Some("25"));
    }

    #[test]
    fn test_outbound_chat_rejects_empty_text() {
        assert!(matches!(
            OutboundChat::new(1, "   ", &creds()),
            Err(DanmakuError::InvalidMessage(_))
        ));
    }

    #[test]
    fn test_outbound_chat_requires_csrf() {
        let creds = Credentials::new("sess", "", "", "1");
        assert!(matches!(
            OutboundChat::new(1, "hi", &creds),
            Err(DanmakuError::Auth(_))
        ));
    }

    #[test]
    fn test_check_send_response() {
        let ok: SendResponse = serde_json::from_str(r#"{"code":0,"message":""}"#).unwrap();
        assert!(check_send_response(ok).is_ok());

        let rejected: SendResponse =
            serde_json::from_str(r#"{"code":10030,"message":"","msg":"too fast"}"#).unwrap();
        match check_send_response(rejected) {
            Err(DanmakuError::Send { code, message }) => {
                assert_eq!(code, 10030);
                assert_eq!(message, "too fast");
            }
            other => panic!("Unexpected result: {other:?}"),
        }

        let logged_out: SendResponse =
            serde_json::from_str(r#"{"code":-101,"message":"账号未登录"}"#).unwrap();
        assert!(matches!(
            check_send_response(logged_out),
            Err(DanmakuError::Auth(_))
        ));
    }
}
