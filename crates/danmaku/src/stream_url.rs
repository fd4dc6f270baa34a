//! Playable stream URL lookup for a room.

use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use crate::config::{ClientConfig, LIVE_ORIGIN};

#[derive(Debug, Deserialize)]
struct PlayUrlResponse {
    code: i64,
    #[serde(default)]
    message: Option<String>,
    data: Option<PlayUrlData>,
}

#[derive(Debug, Deserialize)]
struct PlayUrlData {
    #[serde(default)]
    durl: Vec<Durl>,
}

#[derive(Debug, Deserialize)]
struct Durl {
    url: String,
}

/// Resolves a direct stream URL through the `playUrl` API.
#[derive(Debug, Clone)]
pub struct StreamUrlResolver {
    client: Client,
    live_api: String,
}

impl StreamUrlResolver {
    pub fn new(client: Client, config: &ClientConfig) -> Self {
        Self {
            client,
            live_api: config.live_api.trim_end_matches('/').to_string(),
        }
    }

    /// First stream URL for `room_id`, or `None` when the room is offline or
    /// the lookup fails for any reason.
    pub async fn resolve(&self, room_id: u64) -> Option<String> {
        let url = format!(
            "{}/xlive/web-room/v1/playUrl/playUrl?cid={}&platform=web",
            self.live_api, room_id
        );

        let response = self
            .client
            .get(&url)
            .header(reqwest::header::REFERER, LIVE_ORIGIN)
            .header(reqwest::header::ORIGIN, LIVE_ORIGIN)
            .header(reqwest::header::ACCEPT, "application/json, text/plain, */*")
            .header(reqwest::header::ACCEPT_LANGUAGE, "zh-CN,zh;q=0.9,en;q=0.8")
            .send()
            .await;

        let body = match response {
            Ok(resp) => match resp.text().await {
                Ok(body) => body,
                Err(e) => {
                    debug!(room_id, error = %e, "Failed to read playUrl response");
                    return None;
                }
            },
            Err(e) => {
                debug!(room_id, error = %e, "playUrl request failed");
                return None;
            }
        };

        parse_play_url(&body)
    }
}

fn parse_play_url(body: &str) -> Option<String> {
    let resp: PlayUrlResponse = match serde_json::from_str(body) {
        Ok(resp) => resp,
        Err(e) => {
            debug!(error = %e, "Unreadable playUrl response");
            return None;
        }
    };

    if resp.code != 0 {
        debug!(
            code = resp.code,
            message = resp.message.as_deref().unwrap_or_default(),
            "playUrl returned an error"
        );
        return None;
    }

    resp.data?.durl.into_iter().next().map(|d| d.url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_play_url_picks_first_entry() {
        let body = r#"{"code":0,"data":{"durl":[
            {"url":"https://cn-gotcha.bilivideo.com/live/a.flv","order":1},
            {"url":"https://cn-gotcha.bilivideo.com/live/b.flv","order":2}
        ]}}"#;
        assert_eq!(
            parse_play_url(body).as_deref(),
            Some("https://cn-gotcha.bilivideo.com/live/a.flv")
        );
    }

    #[test]
    fn test_parse_play_url_failures_are_none() {
        assert_eq!(parse_play_url(r#"{"code":19002005,"message":"offline"}"#), None);
        assert_eq!(parse_play_url(r#"{"code":0,"data":{"durl":[]}}"#), None);
        assert_eq!(parse_play_url(r#"{"code":0,"data":null}"#), None);
        assert_eq!(parse_play_url("<html>"), None);
    }
}
