#[cfg(feature = "colored-output")]
use colored::*;
use danmaku::{ChatEvent, ConnectionState};

/// Formats what the terminal shows.
pub struct OutputManager {
    colored: bool,
    json: bool,
}

impl OutputManager {
    pub fn new(colored: bool, json: bool) -> Self {
        Self { colored, json }
    }

    pub fn chat_line(&self, chat: &ChatEvent) -> String {
        if self.json {
            return serde_json::to_string(chat).unwrap_or_default();
        }
        let time = chat
            .received_at
            .with_timezone(&chrono::Local)
            .format("%H:%M:%S");
        format!(
            "[{}] {}: {}",
            time,
            self.sender(&chat.sender, chat.rgb()),
            chat.text
        )
    }

    pub fn state_line(&self, state: &ConnectionState) -> String {
        let text = match state {
            ConnectionState::Idle => "idle".to_string(),
            ConnectionState::Connecting => "connecting...".to_string(),
            ConnectionState::Connected => "connected".to_string(),
            ConnectionState::Reconnecting { attempt } => format!("reconnecting (attempt {attempt})"),
            ConnectionState::Disconnecting => "disconnecting...".to_string(),
            ConnectionState::Disconnected { reason: None } => "disconnected".to_string(),
            ConnectionState::Disconnected { reason: Some(reason) } => {
                format!("disconnected: {reason}")
            }
        };
        self.status(&format!("* {text}"))
    }

    pub fn status(&self, text: &str) -> String {
        #[cfg(feature = "colored-output")]
        {
            if self.colored {
                return text.dimmed().to_string();
            }
        }
        text.to_string()
    }

    pub fn error(&self, text: &str) -> String {
        #[cfg(feature = "colored-output")]
        {
            if self.colored {
                return format!("{} {}", "Error:".red().bold(), text);
            }
        }
        format!("Error: {text}")
    }

    fn sender(&self, name: &str, (r, g, b): (u8, u8, u8)) -> String {
        #[cfg(feature = "colored-output")]
        {
            if self.colored {
                // White is the default chat color; keep names readable.
                let colored_name = if (r, g, b) == (0xFF, 0xFF, 0xFF) {
                    name.cyan()
                } else {
                    name.truecolor(r, g, b)
                };
                return colored_name.bold().to_string();
            }
        }
        let _ = (r, g, b);
        name.to_string()
    }
}
