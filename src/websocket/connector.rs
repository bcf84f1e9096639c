//! Streaming transport
//! `StreamConnector` opens sessions; the Kalshi implementation speaks tokio-tungstenite.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::api::auth::RequestSigner;
use crate::websocket::messages::{
    parse_message, subscribe_command, update_subscription_command, InboundMessage, QuoteUpdate,
};
use crate::websocket::FeedError;

/// One decoded stream event
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Quote(QuoteUpdate),
    /// Control or unrelated frame
    Ignored,
}

/// Opens stream sessions
#[async_trait]
pub trait StreamConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn StreamSession>, FeedError>;
}

/// A connected quote stream
#[async_trait]
pub trait StreamSession: Send {
    async fn subscribe(&mut self, markets: &[String]) -> Result<(), FeedError>;

    async fn unsubscribe(&mut self, markets: &[String]) -> Result<(), FeedError>;

    /// Next event; `None` once the stream has ended. Must be cancel-safe.
    async fn next_event(&mut self) -> Option<Result<StreamEvent, FeedError>>;

    async fn ping(&mut self) -> Result<(), FeedError> {
        Ok(())
    }

    async fn close(&mut self) {}
}

/// Kalshi market-data WebSocket
pub struct KalshiStreamConnector {
    url: String,
    signer: Arc<dyn RequestSigner>,
    connect_timeout: Duration,
}

impl KalshiStreamConnector {
    pub fn new(url: &str, signer: Arc<dyn RequestSigner>, connect_timeout: Duration) -> Self {
        Self {
            url: url.to_string(),
            signer,
            connect_timeout,
        }
    }
}

#[async_trait]
impl StreamConnector for KalshiStreamConnector {
    async fn connect(&self) -> Result<Box<dyn StreamSession>, FeedError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| FeedError::Connect(format!("bad url: {}", e)))?;

        let path = request.uri().path().to_string();
        let headers = self
            .signer
            .headers("GET", &path)
            .map_err(|e| FeedError::Auth(e.to_string()))?;
        for (name, value) in headers {
            let value = HeaderValue::from_str(&value)
                .map_err(|e| FeedError::Auth(format!("bad header {}: {}", name, e)))?;
            let name = tungstenite::http::HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| FeedError::Auth(format!("bad header name: {}", e)))?;
            request.headers_mut().insert(name, value);
        }

        let (stream, _) = tokio::time::timeout(self.connect_timeout, connect_async(request))
            .await
            .map_err(|_| FeedError::Connect("connection timeout".into()))?
            .map_err(|e| match e {
                tungstenite::Error::Http(response)
                    if response.status().as_u16() == 401 || response.status().as_u16() == 403 =>
                {
                    FeedError::Auth(format!("handshake rejected: {}", response.status()))
                }
                other => FeedError::Connect(other.to_string()),
            })?;

        info!("🔌 WebSocket connected to {}", self.url);
        Ok(Box::new(KalshiSession {
            stream,
            next_id: 1,
            ticker_sid: None,
        }))
    }
}

struct KalshiSession {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    next_id: u64,
    /// Subscription id of the ticker channel once acknowledged
    ticker_sid: Option<u64>,
}

impl KalshiSession {
    async fn send_text(&mut self, text: String) -> Result<(), FeedError> {
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| FeedError::Connect(e.to_string()))
    }

    fn take_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

#[async_trait]
impl StreamSession for KalshiSession {
    async fn subscribe(&mut self, markets: &[String]) -> Result<(), FeedError> {
        if markets.is_empty() {
            return Ok(());
        }
        let id = self.take_id();
        let command = match self.ticker_sid {
            Some(sid) => update_subscription_command(id, sid, markets, true),
            None => subscribe_command(id, markets),
        };
        debug!("📡 Subscribing to {} markets", markets.len());
        self.send_text(command).await
    }

    async fn unsubscribe(&mut self, markets: &[String]) -> Result<(), FeedError> {
        // Without a sid there is nothing server-side to shrink; updates for the
        // market simply stop mattering.
        let Some(sid) = self.ticker_sid else {
            return Ok(());
        };
        if markets.is_empty() {
            return Ok(());
        }
        let id = self.take_id();
        self.send_text(update_subscription_command(id, sid, markets, false))
            .await
    }

    async fn next_event(&mut self) -> Option<Result<StreamEvent, FeedError>> {
        let frame = self.stream.next().await?;
        let message = match frame {
            Ok(message) => message,
            Err(e) => return Some(Err(FeedError::Connect(e.to_string()))),
        };

        match message {
            Message::Text(text) => Some(match parse_message(&text) {
                Ok(InboundMessage::Ticker(update)) => Ok(StreamEvent::Quote(update)),
                Ok(InboundMessage::Subscribed { channel, sid }) => {
                    if channel == "ticker" || channel.is_empty() {
                        self.ticker_sid = Some(sid);
                    }
                    Ok(StreamEvent::Ignored)
                }
                Ok(InboundMessage::Error { code, message }) => {
                    let lowered = message.to_ascii_lowercase();
                    if lowered.contains("auth") || lowered.contains("unauthorized") {
                        Err(FeedError::Auth(message))
                    } else {
                        Err(FeedError::Protocol(format!("server error {:?}: {}", code, message)))
                    }
                }
                Ok(InboundMessage::Other(_)) => Ok(StreamEvent::Ignored),
                Err(e) => Err(e),
            }),
            Message::Close(frame) => {
                warn!("WebSocket closed by server: {:?}", frame);
                None
            }
            // tungstenite answers pings itself
            _ => Some(Ok(StreamEvent::Ignored)),
        }
    }

    async fn ping(&mut self) -> Result<(), FeedError> {
        self.stream
            .send(Message::Ping(Vec::new()))
            .await
            .map_err(|e| FeedError::Connect(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}
