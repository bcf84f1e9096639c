//! Kalshi REST client
//! Order placement, order status, portfolio positions and market quotes

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::api::auth::RequestSigner;
use crate::api::venue::{
    LivePosition, OrderAck, OrderRequest, OrderSnapshot, OrderState, Quote, Side, Venue,
};
use crate::api::{sanitize_api_error, ApiError};
use crate::utils::RateLimiter;

pub const KALSHI_API_URL: &str = "https://api.elections.kalshi.com/trade-api/v2";

/// Convert a wire price in cents to the 0-1 scale.
/// Zero means "no price" on the wire.
pub fn normalize_price(raw: Option<f64>) -> Option<f64> {
    let cents = raw?;
    if !cents.is_finite() || cents <= 0.0 {
        return None;
    }
    Some((cents / 100.0).clamp(0.0, 1.0))
}

/// Probability to integer cents, clamped to the tradable 1-99 range
pub fn to_cents(price: f64) -> u32 {
    (price * 100.0).round().clamp(1.0, 99.0) as u32
}

#[derive(Debug, Serialize)]
struct CreateOrderBody<'a> {
    ticker: &'a str,
    client_order_id: &'a str,
    side: &'static str,
    action: &'static str,
    count: u64,
    #[serde(rename = "type")]
    order_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    yes_price: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    no_price: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct OrderEnvelope {
    order: WireOrder,
}

#[derive(Debug, Deserialize)]
struct WireOrder {
    order_id: String,
    #[serde(default)]
    client_order_id: Option<String>,
    #[serde(default)]
    status: String,
    #[serde(default, alias = "filled_count")]
    fill_count: Option<u64>,
    #[serde(default)]
    remaining_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct PositionsPage {
    #[serde(default)]
    market_positions: Vec<WireMarketPosition>,
    #[serde(default)]
    cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireMarketPosition {
    ticker: String,
    /// Signed: positive YES, negative NO
    #[serde(default)]
    position: i64,
}

#[derive(Debug, Deserialize)]
struct MarketEnvelope {
    market: WireMarket,
}

#[derive(Debug, Deserialize)]
struct WireMarket {
    ticker: String,
    #[serde(default)]
    yes_bid: Option<f64>,
    #[serde(default)]
    yes_ask: Option<f64>,
}

/// Kalshi REST API client
pub struct KalshiClient {
    client: Client,
    base_url: String,
    signer: Arc<dyn RequestSigner>,
    rate_limiter: RateLimiter,
}

impl KalshiClient {
    /// Create new client with request timeouts
    pub fn new(
        base_url: &str,
        signer: Arc<dyn RequestSigner>,
        timeout: Duration,
        min_request_spacing_ms: u64,
    ) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            signer,
            rate_limiter: RateLimiter::new(min_request_spacing_ms),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn send<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<T, ApiError> {
        let url = format!("{}{}", self.base_url, path);
        let sign_path = reqwest::Url::parse(&url)
            .map(|u| u.path().to_string())
            .unwrap_or_else(|_| path.to_string());

        self.rate_limiter.wait().await;

        let mut request = self.client.request(method.clone(), &url);
        for (name, value) in self.signer.headers(method.as_str(), &sign_path)? {
            request = request.header(name, value);
        }
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(sanitize_api_error(status.as_u16(), text));
        }

        debug!(%method, path, status = status.as_u16(), "kalshi request ok");

        if text.trim().is_empty() {
            return Ok(serde_json::from_str("null")?);
        }
        Ok(serde_json::from_str(&text)?)
    }
}

#[async_trait]
impl Venue for KalshiClient {
    async fn submit_order(&self, order: OrderRequest) -> Result<OrderAck, ApiError> {
        if order.quantity == 0 {
            return Err(ApiError::Malformed("order quantity must be positive".into()));
        }

        let cents = to_cents(order.contract_price());
        let body = CreateOrderBody {
            ticker: &order.market_id,
            client_order_id: &order.client_order_id,
            side: order.side.as_str(),
            action: order.action.as_str(),
            count: order.quantity,
            order_type: "limit",
            yes_price: (order.side == Side::Yes).then_some(cents),
            no_price: (order.side == Side::No).then_some(cents),
        };

        let envelope: OrderEnvelope = self
            .send(Method::POST, "/portfolio/orders", Some(serde_json::to_value(&body)?))
            .await?;

        Ok(OrderAck {
            order_id: envelope.order.order_id,
            client_order_id: envelope.order.client_order_id,
            status: OrderState::parse(&envelope.order.status),
        })
    }

    async fn get_order_status(&self, order_id: &str) -> Result<OrderSnapshot, ApiError> {
        let envelope: OrderEnvelope = self
            .send(Method::GET, &format!("/portfolio/orders/{}", order_id), None)
            .await?;

        let order = envelope.order;
        Ok(OrderSnapshot {
            order_id: order.order_id,
            filled_count: order.fill_count.unwrap_or(0),
            remaining_count: order.remaining_count.unwrap_or(0),
            status: OrderState::parse(&order.status),
        })
    }

    async fn get_live_positions(&self) -> Result<Vec<LivePosition>, ApiError> {
        let mut positions = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let path = match &cursor {
                Some(c) => format!("/portfolio/positions?limit=200&cursor={}", c),
                None => "/portfolio/positions?limit=200".to_string(),
            };
            let page: PositionsPage = self.send(Method::GET, &path, None).await?;

            for mp in page.market_positions {
                if mp.ticker.is_empty() || mp.position == 0 {
                    continue;
                }
                positions.push(LivePosition {
                    market_id: mp.ticker,
                    side: if mp.position > 0 { Side::Yes } else { Side::No },
                    quantity: mp.position.unsigned_abs(),
                });
            }

            match page.cursor {
                Some(next) if !next.is_empty() && cursor.as_deref() != Some(next.as_str()) => {
                    cursor = Some(next);
                }
                _ => break,
            }
        }

        Ok(positions)
    }

    async fn get_quote(&self, market_id: &str) -> Result<Quote, ApiError> {
        let envelope: MarketEnvelope = self
            .send(Method::GET, &format!("/markets/{}", market_id), None)
            .await?;

        Ok(Quote {
            market_id: envelope.market.ticker,
            yes_bid: normalize_price(envelope.market.yes_bid),
            yes_ask: normalize_price(envelope.market.yes_ask),
        })
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), ApiError> {
        let _: serde_json::Value = self
            .send(Method::DELETE, &format!("/portfolio/orders/{}", order_id), None)
            .await?;
        Ok(())
    }
}
