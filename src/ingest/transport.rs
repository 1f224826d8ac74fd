//! WebSocket chat transport (spec.md §4.1). One connection per configured
//! source; text frames are handed upward as `RawTransportMessage` and the
//! reconnect/backoff policy lives one layer up in `run_source`. Grounded on
//! the reconnect-and-stream shape used for market-data websocket feeds
//! elsewhere in this stack, simplified: this transport carries arbitrary
//! chat text rather than a fixed order schema, so there is no typed
//! subscribe/update protocol to model.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;

use crate::model::Entity;

/// A chat source connection. `run` drives one connection attempt end to
/// end: connect, stream until closed, and forward every message to `tx`.
/// Reconnection and backoff are the caller's responsibility so the same
/// policy governs every source kind uniformly.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn run(&self, tx: mpsc::Sender<RawTransportMessage>) -> Result<(), TransportError>;
}

/// One inbound chat message as the transport sees it, before `RawMessage`
/// wraps it with source metadata and receive timestamps.
#[derive(Debug, Clone)]
pub struct RawTransportMessage {
    pub text: String,
    pub entities: Vec<Entity>,
    pub thread_id: Option<String>,
}

#[derive(Debug, Clone)]
pub enum TransportError {
    /// Credential rejected outright; retrying would not help (spec.md §4.1).
    AuthFailed(String),
    /// Network hiccup, server-side close, or similar; safe to retry.
    Transient(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::AuthFailed(r) => write!(f, "auth failed: {r}"),
            TransportError::Transient(r) => write!(f, "transient: {r}"),
        }
    }
}

static URL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"https?://\S+").unwrap());

/// Pulls bare URLs out of message text as entities with no anchor text,
/// since raw websocket chat frames carry no rich-text markup.
fn extract_entities(text: &str) -> Vec<Entity> {
    URL_RE
        .find_iter(text)
        .map(|m| Entity {
            url: m.as_str().to_string(),
            anchor_text: String::new(),
        })
        .collect()
}

/// Default `ChatTransport`: connects to `endpoint` over `wss`/`ws`, sends the
/// credential (if any) as a bearer `Authorization` header, and forwards every
/// text frame verbatim. A close frame or stream end is a clean `Ok(())`
/// return so the caller reconnects with a reset backoff.
pub struct WebSocketTransport {
    endpoint: String,
    credential: Option<String>,
}

impl WebSocketTransport {
    pub fn new(endpoint: String, credential: Option<String>) -> Self {
        Self { endpoint, credential }
    }
}

#[async_trait]
impl ChatTransport for WebSocketTransport {
    async fn run(&self, tx: mpsc::Sender<RawTransportMessage>) -> Result<(), TransportError> {
        let mut request = self
            .endpoint
            .clone()
            .into_client_request()
            .map_err(|e| TransportError::Transient(format!("bad endpoint: {e}")))?;

        if let Some(cred) = &self.credential {
            if let Ok(hv) = format!("Bearer {cred}").parse() {
                request.headers_mut().insert("Authorization", hv);
            }
        }

        let (ws_stream, response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| classify_connect_error(&e))?;

        if response.status().as_u16() == 401 || response.status().as_u16() == 403 {
            return Err(TransportError::AuthFailed(format!(
                "handshake rejected with status {}",
                response.status()
            )));
        }

        tracing::info!(endpoint = %self.endpoint, "websocket connected");
        let (mut write, mut read) = ws_stream.split();

        while let Some(message) = read.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    let entities = extract_entities(&text);
                    let raw = RawTransportMessage {
                        text,
                        entities,
                        thread_id: None,
                    };
                    if tx.send(raw).await.is_err() {
                        return Ok(());
                    }
                }
                Ok(Message::Ping(payload)) => {
                    if write.send(Message::Pong(payload)).await.is_err() {
                        return Err(TransportError::Transient("failed to send pong".into()));
                    }
                }
                Ok(Message::Pong(_)) => {}
                Ok(Message::Close(frame)) => {
                    tracing::info!(?frame, "websocket closed by server");
                    return Ok(());
                }
                Ok(Message::Binary(data)) => {
                    tracing::warn!(bytes = data.len(), "unexpected binary frame, ignoring");
                }
                Ok(Message::Frame(_)) => {}
                Err(e) => return Err(TransportError::Transient(e.to_string())),
            }
        }

        Ok(())
    }
}

fn classify_connect_error(e: &tokio_tungstenite::tungstenite::Error) -> TransportError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match e {
        WsError::Http(response) if matches!(response.status().as_u16(), 401 | 403) => {
            TransportError::AuthFailed(format!("connect rejected with status {}", response.status()))
        }
        other => TransportError::Transient(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_bare_urls_as_entities() {
        let entities = extract_entities("check this out https://example.com/token/ABC and more text");
        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].url, "https://example.com/token/ABC");
        assert!(entities[0].anchor_text.is_empty());
    }

    #[test]
    fn no_urls_yields_empty_entities() {
        assert!(extract_entities("just plain chat text").is_empty());
    }

    #[test]
    fn transport_error_display_distinguishes_kinds() {
        let auth = TransportError::AuthFailed("bad token".into());
        let transient = TransportError::Transient("timeout".into());
        assert!(auth.to_string().contains("auth failed"));
        assert!(transient.to_string().contains("transient"));
    }
}
