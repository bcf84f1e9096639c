//! Kalshi WebSocket message formats

use serde::{Deserialize, Serialize};

use crate::api::kalshi::normalize_price;
use crate::websocket::FeedError;

/// Quote pushed by the stream, on the YES scale
#[derive(Debug, Clone, PartialEq)]
pub struct QuoteUpdate {
    pub market_id: String,
    pub yes_bid: Option<f64>,
    pub yes_ask: Option<f64>,
}

/// Parsed inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Ticker(QuoteUpdate),
    Subscribed { channel: String, sid: u64 },
    Error { code: Option<i64>, message: String },
    Other(String),
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    msg: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct TickerMsg {
    market_ticker: String,
    #[serde(default)]
    yes_bid: Option<f64>,
    #[serde(default)]
    yes_ask: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct SubscribedMsg {
    #[serde(default)]
    channel: String,
    sid: u64,
}

#[derive(Debug, Deserialize)]
struct ErrorMsg {
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    msg: String,
}

/// Parse one text frame. Anything unusable is a `Protocol` error for the caller to drop.
pub fn parse_message(text: &str) -> Result<InboundMessage, FeedError> {
    let envelope: Envelope = serde_json::from_str(text)
        .map_err(|e| FeedError::Protocol(format!("bad frame: {}", e)))?;

    match envelope.kind.as_str() {
        // ticker_v2 deltas omit unchanged fields; only full snapshots update the cache
        "ticker" => {
            let msg: TickerMsg = serde_json::from_value(envelope.msg)
                .map_err(|e| FeedError::Protocol(format!("bad ticker: {}", e)))?;
            if msg.market_ticker.is_empty() {
                return Err(FeedError::Protocol("ticker without market".into()));
            }
            Ok(InboundMessage::Ticker(QuoteUpdate {
                market_id: msg.market_ticker,
                yes_bid: normalize_price(msg.yes_bid),
                yes_ask: normalize_price(msg.yes_ask),
            }))
        }
        "subscribed" => {
            let msg: SubscribedMsg = serde_json::from_value(envelope.msg)
                .map_err(|e| FeedError::Protocol(format!("bad subscribed ack: {}", e)))?;
            Ok(InboundMessage::Subscribed {
                channel: msg.channel,
                sid: msg.sid,
            })
        }
        "error" => {
            let msg: ErrorMsg = serde_json::from_value(envelope.msg).unwrap_or(ErrorMsg {
                code: None,
                msg: "unknown error".to_string(),
            });
            Ok(InboundMessage::Error {
                code: msg.code,
                message: msg.msg,
            })
        }
        other => Ok(InboundMessage::Other(other.to_string())),
    }
}

#[derive(Debug, Serialize)]
struct Command<'a> {
    id: u64,
    cmd: &'static str,
    params: CommandParams<'a>,
}

#[derive(Debug, Serialize)]
struct CommandParams<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    channels: Option<[&'static str; 1]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sids: Option<[u64; 1]>,
    market_tickers: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    action: Option<&'static str>,
}

/// `{"id","cmd":"subscribe","params":{"channels":["ticker"],"market_tickers":[..]}}`
pub fn subscribe_command(id: u64, markets: &[String]) -> String {
    let command = Command {
        id,
        cmd: "subscribe",
        params: CommandParams {
            channels: Some(["ticker"]),
            sids: None,
            market_tickers: markets,
            action: None,
        },
    };
    serde_json::to_string(&command).unwrap_or_default()
}

/// Add or remove markets on an existing subscription
pub fn update_subscription_command(id: u64, sid: u64, markets: &[String], add: bool) -> String {
    let command = Command {
        id,
        cmd: "update_subscription",
        params: CommandParams {
            channels: None,
            sids: Some([sid]),
            market_tickers: markets,
            action: Some(if add { "add_markets" } else { "delete_markets" }),
        },
    };
    serde_json::to_string(&command).unwrap_or_default()
}
