//! Turns decoded frames into typed events and fans them out to handlers.
//!
//! Handlers are kept per [`EventKind`] in registration order. Each call is
//! isolated: a panicking handler is logged and the remaining handlers still
//! run. Handlers execute on the session's background task, so anything that
//! belongs to a UI thread should go through a [`chat_queue`] instead.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

use crate::codec::{Frame, Operation};
use crate::error::{DanmakuError, Result};

/// A chat message from the room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatEvent {
    /// Sender display name (`info[2][1]`).
    pub sender: String,
    /// Message text (`info[1]`).
    pub text: String,
    /// Display color as 0xRRGGBB (`info[0][3]`).
    pub color: u32,
    /// Sender uid (`info[2][0]`), 0 when hidden.
    pub uid: u64,
    pub received_at: DateTime<Utc>,
}

impl ChatEvent {
    pub fn new(sender: impl Into<String>, text: impl Into<String>, color: u32) -> Self {
        Self {
            sender: sender.into(),
            text: text.into(),
            color,
            uid: 0,
            received_at: Utc::now(),
        }
    }

    /// Split the color into RGB components.
    pub fn rgb(&self) -> (u8, u8, u8) {
        (
            ((self.color >> 16) & 0xFF) as u8,
            ((self.color >> 8) & 0xFF) as u8,
            (self.color & 0xFF) as u8,
        )
    }
}

/// Classification of non-chat notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomNoticeKind {
    /// The stream went live.
    Live,
    /// The stream ended normally.
    Preparing,
    /// Title or area changed.
    RoomChange,
    /// The stream was cut off or the room locked.
    StreamClosed,
    Other,
}

impl RoomNoticeKind {
    fn from_cmd(cmd: &str) -> Self {
        match cmd {
            "LIVE" => Self::Live,
            "PREPARING" => Self::Preparing,
            "ROOM_CHANGE" => Self::RoomChange,
            "CUT_OFF" | "ROOM_LOCK" => Self::StreamClosed,
            _ => Self::Other,
        }
    }
}

/// A room notification other than chat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomNotice {
    /// Base command, with any `:suffix` stripped.
    pub cmd: String,
    pub kind: RoomNoticeKind,
    /// Full notification payload.
    pub payload: Value,
}

/// A single decoded event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DanmuEvent {
    Chat(ChatEvent),
    Notice(RoomNotice),
    HeartbeatAck { popularity: u32 },
    AuthAck,
}

/// Tag used to register handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ChatMessage,
    RoomNotice,
    HeartbeatAck,
    AuthAck,
}

impl DanmuEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Chat(_) => EventKind::ChatMessage,
            Self::Notice(_) => EventKind::RoomNotice,
            Self::HeartbeatAck { .. } => EventKind::HeartbeatAck,
            Self::AuthAck => EventKind::AuthAck,
        }
    }
}

/// Parse a `DANMU_MSG` payload.
///
/// The `info` indexing is fixed by the remote service:
/// `info[0][3]` color, `info[1]` text, `info[2][0]` uid, `info[2][1]` name.
pub fn parse_chat(json: &Value) -> Result<ChatEvent> {
    let info = json
        .get("info")
        .and_then(|v| v.as_array())
        .ok_or_else(|| DanmakuError::decode("DANMU_MSG without info array"))?;

    let text = info
        .get(1)
        .and_then(|v| v.as_str())
        .ok_or_else(|| DanmakuError::decode("DANMU_MSG info[1] is not a string"))?;

    let user = info
        .get(2)
        .and_then(|v| v.as_array())
        .ok_or_else(|| DanmakuError::decode("DANMU_MSG info[2] is not an array"))?;
    let sender = user
        .get(1)
        .and_then(|v| v.as_str())
        .ok_or_else(|| DanmakuError::decode("DANMU_MSG info[2][1] is not a string"))?;
    let uid = user.first().and_then(|v| v.as_u64()).unwrap_or(0);

    let color = info
        .first()
        .and_then(|v| v.as_array())
        .and_then(|meta| meta.get(3))
        .and_then(|v| v.as_u64())
        .and_then(|c| u32::try_from(c).ok())
        .ok_or_else(|| DanmakuError::decode("DANMU_MSG info[0][3] is not a color"))?;

    Ok(ChatEvent {
        sender: sender.to_string(),
        text: text.to_string(),
        color,
        uid,
        received_at: Utc::now(),
    })
}

/// Parse an operation 5 body.
pub fn parse_notification(body: &[u8]) -> Result<DanmuEvent> {
    let json: Value = serde_json::from_slice(body)
        .map_err(|e| DanmakuError::decode(format!("notification is not JSON: {}", e)))?;
    let cmd = json
        .get("cmd")
        .and_then(|v| v.as_str())
        .ok_or_else(|| DanmakuError::decode("notification without cmd"))?;

    // Variants such as "DANMU_MSG:4:0:2:2:2:0" share the base layout.
    let cmd_base = cmd.split(':').next().unwrap_or(cmd);

    match cmd_base {
        "DANMU_MSG" | "DANMU_MSG_MIRROR" => parse_chat(&json).map(DanmuEvent::Chat),
        _ => Ok(DanmuEvent::Notice(RoomNotice {
            cmd: cmd_base.to_string(),
            kind: RoomNoticeKind::from_cmd(cmd_base),
            payload: json,
        })),
    }
}

/// Map one decoded frame to an event.
pub fn event_from_frame(frame: &Frame) -> Result<DanmuEvent> {
    match frame.operation {
        Operation::Notification => parse_notification(&frame.body),
        Operation::HeartbeatReply => {
            if frame.body.len() < 4 {
                return Err(DanmakuError::decode("heartbeat reply shorter than 4 bytes"));
            }
            Ok(DanmuEvent::HeartbeatAck {
                popularity: BigEndian::read_u32(&frame.body[..4]),
            })
        }
        Operation::AuthReply => Ok(DanmuEvent::AuthAck),
        op @ (Operation::Heartbeat | Operation::Auth) => Err(DanmakuError::decode(format!(
            "unexpected client operation {:?} from server",
            op
        ))),
    }
}

/// Callback invoked for every event of the kind it was registered for.
pub type Handler = Arc<dyn Fn(&DanmuEvent) + Send + Sync>;

/// Event tag to ordered callback list. Registration is additive only.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Arc<RwLock<HashMap<EventKind, Vec<Handler>>>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handlers = self.handlers.read();
        let counts: HashMap<_, _> = handlers.iter().map(|(k, v)| (*k, v.len())).collect();
        f.debug_struct("HandlerRegistry")
            .field("handlers", &counts)
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, kind: EventKind, handler: Handler) {
        self.handlers.write().entry(kind).or_default().push(handler);
    }

    /// Register a handler that only sees chat messages.
    pub fn on_chat<F>(&self, handler: F)
    where
        F: Fn(&ChatEvent) + Send + Sync + 'static,
    {
        self.register(
            EventKind::ChatMessage,
            Arc::new(move |event| {
                if let DanmuEvent::Chat(chat) = event {
                    handler(chat);
                }
            }),
        );
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.handlers.read().get(&kind).map_or(0, Vec::len)
    }

    /// Snapshot, so no lock is held while handlers run.
    fn handlers_for(&self, kind: EventKind) -> Vec<Handler> {
        self.handlers.read().get(&kind).cloned().unwrap_or_default()
    }
}

/// Demultiplexes frames into events and invokes registered handlers.
#[derive(Debug, Clone, Default)]
pub struct Dispatcher {
    registry: HandlerRegistry,
}

impl Dispatcher {
    pub fn new(registry: HandlerRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Decode and dispatch one frame. Undecodable frames are logged and dropped.
    pub fn dispatch_frame(&self, frame: &Frame) -> Option<EventKind> {
        match event_from_frame(frame) {
            Ok(event) => {
                let kind = event.kind();
                self.dispatch(&event);
                Some(kind)
            }
            Err(e) => {
                warn!(operation = ?frame.operation, error = %e, "Dropping undecodable frame");
                None
            }
        }
    }

    /// Invoke every handler registered for the event's kind, in order.
    /// Returns how many handlers completed without panicking.
    pub fn dispatch(&self, event: &DanmuEvent) -> usize {
        let handlers = self.registry.handlers_for(event.kind());
        if handlers.is_empty() {
            trace!(kind = ?event.kind(), "No handlers registered");
            return 0;
        }

        let mut completed = 0;
        for (index, handler) in handlers.iter().enumerate() {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(()) => completed += 1,
                Err(panic) => {
                    let reason = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    error!(kind = ?event.kind(), handler = index, reason = %reason, "Event handler panicked");
                }
            }
        }
        completed
    }
}

/// Register a forwarding handler and return the receiving end.
///
/// The background task only enqueues; the consumer drains on its own task.
pub fn chat_queue(registry: &HandlerRegistry) -> mpsc::UnboundedReceiver<ChatEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    registry.on_chat(move |chat| {
        if tx.send(chat.clone()).is_err() {
            debug!("Chat queue receiver dropped");
        }
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ProtocolVersion;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn danmu_json() -> Value {
        serde_json::json!({
            "cmd": "DANMU_MSG:4:0:2:2:2:0",
            "info": [
                [0, 1, 25, 16772431, 1700000000000_i64, 0, 0, "", 0, 0, 0, "", 0, "{}", "{}", {"extra": "{}"}],
                "Hello World",
                [12345, "TestUser", 0, 0, 0, 10000, 1, ""]
            ]
        })
    }

    fn notification_frame(json: &Value) -> Frame {
        Frame::new(Operation::Notification, serde_json::to_vec(json).unwrap())
            .with_version(ProtocolVersion::RawJson)
    }

    #[test]
    fn test_parse_chat_uses_fixed_indexing() {
        let chat = parse_chat(&danmu_json()).unwrap();
        assert_eq!(chat.sender, "TestUser");
        assert_eq!(chat.text, "Hello World");
        assert_eq!(chat.color, 16772431);
        assert_eq!(chat.uid, 12345);
        assert_eq!(chat.rgb(), (0xFF, 0xED, 0x4F));
    }

    #[test]
    fn test_parse_chat_rejects_missing_fields() {
        let json = serde_json::json!({"cmd": "DANMU_MSG", "info": [[0, 1, 25], "hi"]});
        assert!(matches!(parse_chat(&json), Err(DanmakuError::Decode(_))));

        let json = serde_json::json!({"cmd": "DANMU_MSG"});
        assert!(parse_chat(&json).is_err());
    }

    #[test]
    fn test_parse_notification_room_notices() {
        let body = br#"{"cmd":"ROOM_CHANGE","data":{"title":"New"}}"#;
        match parse_notification(body).unwrap() {
            DanmuEvent::Notice(notice) => {
                assert_eq!(notice.cmd, "ROOM_CHANGE");
                assert_eq!(notice.kind, RoomNoticeKind::RoomChange);
                assert_eq!(notice.payload["data"]["title"], "New");
            }
            other => panic!("Unexpected event: {other:?}"),
        }

        let body = br#"{"cmd":"CUT_OFF","msg":"cut"}"#;
        match parse_notification(body).unwrap() {
            DanmuEvent::Notice(notice) => assert_eq!(notice.kind, RoomNoticeKind::StreamClosed),
            other => panic!("Unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_event_from_heartbeat_reply() {
        let frame = Frame::new(Operation::HeartbeatReply, vec![0, 0, 0x30, 0x39]);
        assert_eq!(
            event_from_frame(&frame).unwrap(),
            DanmuEvent::HeartbeatAck { popularity: 12345 }
        );
    }

    #[test]
    fn test_dispatch_invokes_handlers_in_order() {
        let registry = HandlerRegistry::new();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        for id in 0..3 {
            let order = order.clone();
            registry.on_chat(move |_| order.lock().push(id));
        }

        let dispatcher = Dispatcher::new(registry);
        let kind = dispatcher.dispatch_frame(&notification_frame(&danmu_json()));

        assert_eq!(kind, Some(EventKind::ChatMessage));
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn test_heartbeat_ack_does_not_reach_chat_handlers() {
        let registry = HandlerRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        registry.on_chat(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        let dispatcher = Dispatcher::new(registry);
        let frame = Frame::new(Operation::HeartbeatReply, vec![0, 0, 0, 1]);
        assert_eq!(dispatcher.dispatch_frame(&frame), Some(EventKind::HeartbeatAck));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_panicking_handler_is_isolated() {
        let registry = HandlerRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));

        registry.on_chat(|_| panic!("handler exploded"));
        let c = calls.clone();
        registry.on_chat(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        let dispatcher = Dispatcher::new(registry);
        let event = DanmuEvent::Chat(ChatEvent::new("a", "b", 0xFFFFFF));

        assert_eq!(dispatcher.dispatch(&event), 1);
        assert_eq!(dispatcher.dispatch(&event), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_malformed_payload_is_dropped() {
        let registry = HandlerRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        registry.on_chat(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let dispatcher = Dispatcher::new(registry);

        let garbage = Frame::new(Operation::Notification, b"not json".to_vec());
        assert_eq!(dispatcher.dispatch_frame(&garbage), None);

        let client_op = Frame::new(Operation::Heartbeat, b"[object Object]".to_vec());
        assert_eq!(dispatcher.dispatch_frame(&client_op), None);

        assert_eq!(
            dispatcher.dispatch_frame(&notification_frame(&danmu_json())),
            Some(EventKind::ChatMessage)
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_chat_queue_receives_events() {
        let registry = HandlerRegistry::new();
        let mut rx = chat_queue(&registry);
        assert_eq!(registry.handler_count(EventKind::ChatMessage), 1);

        Dispatcher::new(registry).dispatch_frame(&notification_frame(&danmu_json()));

        let chat = rx.recv().await.unwrap();
        assert_eq!((chat.sender.as_str(), chat.text.as_str()), ("TestUser", "Hello World"));
    }
}
