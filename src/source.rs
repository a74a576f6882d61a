use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};
use url::Url;

use crate::types::{LiveEvent, SessionInfo};

/// Buffered events per session before the reader applies backpressure.
const EVENT_BUFFER: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("no handshake within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("source closed before the handshake")]
    ClosedDuringHandshake,

    #[error("connection rejected: {0}")]
    Rejected(String),

    #[error("unexpected handshake frame: {0}")]
    BadHandshake(String),
}

/// An established subscription: the session descriptor plus the event feed.
///
/// The receiver yields `LiveEvent::Disconnected` (or closes) when the
/// session ends.
pub struct LiveSession {
    pub info: SessionInfo,
    pub events: mpsc::Receiver<LiveEvent>,
}

/// External live-event source.
#[async_trait]
pub trait LiveSource: Send + Sync {
    async fn connect(&self, channel: &str) -> Result<LiveSession, SourceError>;
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    event: String,
    #[serde(default)]
    data: Value,
}

/// One decoded text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Connected(SessionInfo),
    ConnectFailed(String),
    Event(LiveEvent),
    /// Event name this client does not handle (likes, shares, room stats...).
    Ignored(String),
}

fn error_message(data: &Value) -> String {
    for key in ["message", "error", "reason"] {
        if let Some(msg) = data.get(key).and_then(Value::as_str) {
            return msg.to_string();
        }
    }
    match data {
        Value::String(s) => s.clone(),
        Value::Null => "unknown error".to_string(),
        other => other.to_string(),
    }
}

/// Decode a `{"event": ..., "data": {...}}` text frame.
pub fn parse_frame(text: &str) -> Result<Frame, serde_json::Error> {
    let raw: RawFrame = serde_json::from_str(text)?;
    let frame = match raw.event.as_str() {
        "connected" => match SessionInfo::from_handshake(raw.data) {
            Some(info) => Frame::Connected(info),
            None => Frame::ConnectFailed("handshake without roomId".to_string()),
        },
        "connectFailed" | "streamEnd" => Frame::ConnectFailed(error_message(&raw.data)),
        "gift" => Frame::Event(LiveEvent::Gift(serde_json::from_value(raw.data)?)),
        "chat" => Frame::Event(LiveEvent::Chat(serde_json::from_value(raw.data)?)),
        "member" => Frame::Event(LiveEvent::Member(serde_json::from_value(raw.data)?)),
        "follow" => Frame::Event(LiveEvent::Follow(serde_json::from_value(raw.data)?)),
        "error" => Frame::Event(LiveEvent::Error {
            message: error_message(&raw.data),
        }),
        "disconnected" => Frame::Event(LiveEvent::Disconnected),
        other => Frame::Ignored(other.to_string()),
    };
    Ok(frame)
}

/// Live source behind a WebSocket relay that speaks JSON event frames.
///
/// The relay is addressed as `<url>?uniqueId=<channel>` and must send a
/// `connected` frame with the room id first.
pub struct WsLiveSource {
    url: Url,
    handshake_timeout: Duration,
}

impl WsLiveSource {
    pub fn new(url: Url, handshake_timeout: Duration) -> Self {
        Self {
            url,
            handshake_timeout,
        }
    }

    pub fn channel_url(&self, channel: &str) -> Url {
        let mut url = self.url.clone();
        url.query_pairs_mut().append_pair("uniqueId", channel);
        url
    }
}

#[async_trait]
impl LiveSource for WsLiveSource {
    async fn connect(&self, channel: &str) -> Result<LiveSession, SourceError> {
        let url = self.channel_url(channel);
        debug!("Connecting to {url}");
        let (ws, _) = connect_async(url.as_str()).await?;
        let (_write, mut read) = ws.split();

        let info = tokio::time::timeout(self.handshake_timeout, async {
            while let Some(msg) = read.next().await {
                let msg = match msg {
                    Ok(msg) => msg,
                    Err(e) => return Err(SourceError::from(e)),
                };
                let text = match msg {
                    Message::Text(text) => text,
                    Message::Close(Some(frame)) if !frame.reason.is_empty() => {
                        return Err(SourceError::Rejected(frame.reason.as_str().to_string()));
                    }
                    Message::Close(_) => return Err(SourceError::ClosedDuringHandshake),
                    _ => continue,
                };
                match parse_frame(text.as_str()) {
                    Ok(Frame::Connected(info)) => return Ok(info),
                    Ok(Frame::ConnectFailed(msg)) => return Err(SourceError::Rejected(msg)),
                    Ok(Frame::Event(LiveEvent::Error { message })) => {
                        return Err(SourceError::Rejected(message));
                    }
                    Ok(other) => return Err(SourceError::BadHandshake(format!("{other:?}"))),
                    Err(e) => return Err(SourceError::BadHandshake(e.to_string())),
                }
            }
            Err(SourceError::ClosedDuringHandshake)
        })
        .await
        .map_err(|_| SourceError::HandshakeTimeout(self.handshake_timeout))??;

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        tokio::spawn(async move {
            // The relay never expects client frames; pings are answered by
            // tungstenite while reading.
            while let Some(msg) = read.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("Live source read error: {e}");
                        break;
                    }
                };
                match parse_frame(text.as_str()) {
                    Ok(Frame::Event(event)) => {
                        let last = event == LiveEvent::Disconnected;
                        if tx.send(event).await.is_err() || last {
                            return;
                        }
                    }
                    Ok(Frame::ConnectFailed(reason)) => {
                        debug!("Session ended by source: {reason}");
                        break;
                    }
                    Ok(Frame::Ignored(name)) => debug!("Ignoring {name} event"),
                    Ok(Frame::Connected(info)) => {
                        debug!("Repeated handshake for room {}", info.room_id)
                    }
                    Err(e) => warn!("Undecodable live frame: {e}"),
                }
            }
            let _ = tx.send(LiveEvent::Disconnected).await;
        });

        Ok(LiveSession { info, events: rx })
    }
}
