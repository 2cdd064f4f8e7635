//! CLOB order client.
//!
//! The execution engine talks to the venue through the `ClobApi` trait:
//! a live HMAC-signed REST client for production and a deterministic paper
//! client for dry runs and tests. Order statuses are normalized to
//! `{live, filled, canceled, rejected}` regardless of vendor spelling.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::{STANDARD as BASE64, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Tif {
    Gtc,
    Ioc,
    Fok,
}

impl Tif {
    fn as_str(&self) -> &'static str {
        match self {
            Tif::Gtc => "GTC",
            Tif::Ioc => "IOC",
            Tif::Fok => "FOK",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    Live,
    Filled,
    Canceled,
    Rejected,
}

impl OrderStatus {
    fn parse(s: &str) -> OrderStatus {
        match s.to_ascii_lowercase().as_str() {
            "live" | "open" | "active" | "pending" => OrderStatus::Live,
            "filled" | "matched" | "complete" => OrderStatus::Filled,
            "canceled" | "cancelled" => OrderStatus::Canceled,
            _ => OrderStatus::Rejected,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub client_order_id: String,
    pub token_id: String,
    /// Limit price in (0, 1).
    pub price: f64,
    /// Shares, not notional.
    pub size: f64,
    pub tif: Tif,
}

#[derive(Debug, Clone)]
pub struct OrderState {
    pub status: OrderStatus,
    pub filled_size: f64,
    pub avg_price: f64,
}

#[derive(Debug, Clone)]
pub struct OrderAck {
    pub order_id: String,
    pub state: OrderState,
    pub latency_ms: u64,
}

#[async_trait]
pub trait ClobApi: Send + Sync {
    async fn place_order(&self, req: &OrderRequest) -> Result<OrderAck>;
    async fn cancel_order(&self, order_id: &str) -> Result<()>;
    async fn order_state(&self, order_id: &str) -> Result<OrderState>;
}

#[derive(Debug, Clone)]
pub struct ClobCredentials {
    pub api_key: String,
    pub secret: String,
    pub passphrase: String,
}

/// Live HMAC-signed REST client.
pub struct HttpClobClient {
    client: reqwest::Client,
    host: String,
    creds: ClobCredentials,
    wallet: String,
}

#[derive(Debug, Serialize)]
struct OrderPayload<'a> {
    #[serde(rename = "tokenID")]
    token_id: &'a str,
    price: String,
    size: String,
    side: &'static str,
    #[serde(rename = "orderType")]
    order_type: &'static str,
    #[serde(rename = "timeInForce")]
    time_in_force: &'static str,
    #[serde(rename = "clientOrderId")]
    client_order_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    #[serde(rename = "orderID", alias = "orderId", alias = "order_id")]
    order_id: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(rename = "errorMsg", alias = "error", default)]
    error_msg: Option<String>,
    #[serde(rename = "filledSize", alias = "filled_size", default)]
    filled_size: Option<serde_json::Value>,
    #[serde(rename = "avgPrice", alias = "avg_price", default)]
    avg_price: Option<serde_json::Value>,
}

fn value_f64(v: &Option<serde_json::Value>) -> Option<f64> {
    match v {
        Some(serde_json::Value::Number(n)) => n.as_f64(),
        Some(serde_json::Value::String(s)) => s.parse().ok(),
        _ => None,
    }
}

impl HttpClobClient {
    pub fn new(host: String, wallet: String, creds: ClobCredentials) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build CLOB HTTP client")?;
        Ok(Self {
            client,
            host,
            creds,
            wallet,
        })
    }

    /// L2 request signature: HMAC-SHA256 over `timestamp+method+path+body`,
    /// URL-safe base64 output.
    fn sign(&self, method: &str, path: &str, body: &str, timestamp: i64) -> Result<String> {
        let message = format!("{timestamp}{method}{path}{body}");
        let secret = URL_SAFE
            .decode(&self.creds.secret)
            .or_else(|_| URL_SAFE_NO_PAD.decode(&self.creds.secret))
            .or_else(|_| BASE64.decode(&self.creds.secret))
            .context("failed to decode CLOB secret")?;
        let mut mac =
            HmacSha256::new_from_slice(&secret).map_err(|e| anyhow!("HMAC key error: {e}"))?;
        mac.update(message.as_bytes());
        Ok(URL_SAFE.encode(mac.finalize().into_bytes()))
    }

    fn auth_headers(&self, method: &str, path: &str, body: &str) -> Result<Vec<(String, String)>> {
        let timestamp = chrono::Utc::now().timestamp();
        let signature = self.sign(method, path, body, timestamp)?;
        Ok(vec![
            ("POLY_ADDRESS".into(), self.wallet.clone()),
            ("POLY_API_KEY".into(), self.creds.api_key.clone()),
            ("POLY_SIGNATURE".into(), signature),
            ("POLY_TIMESTAMP".into(), timestamp.to_string()),
            ("POLY_PASSPHRASE".into(), self.creds.passphrase.clone()),
        ])
    }
}

#[async_trait]
impl ClobApi for HttpClobClient {
    async fn place_order(&self, req: &OrderRequest) -> Result<OrderAck> {
        let started = std::time::Instant::now();
        if !(req.price.is_finite() && req.price > 0.0 && req.price < 1.0) {
            return Err(anyhow!("invalid price: {}", req.price));
        }
        if !(req.size.is_finite() && req.size > 0.0) {
            return Err(anyhow!("invalid size: {}", req.size));
        }

        let payload = OrderPayload {
            token_id: &req.token_id,
            price: format!("{:.4}", req.price),
            size: format!("{:.6}", req.size),
            side: "BUY",
            order_type: "LIMIT",
            time_in_force: req.tif.as_str(),
            client_order_id: &req.client_order_id,
        };
        let body = serde_json::to_string(&payload).context("serialize order")?;
        let path = "/order";
        let headers = self.auth_headers("POST", path, &body)?;

        debug!(
            token = %req.token_id,
            price = req.price,
            size = req.size,
            tif = payload.time_in_force,
            "placing order"
        );
        let mut request = self
            .client
            .post(format!("{}{}", self.host, path))
            .header("Content-Type", "application/json");
        for (k, v) in headers {
            request = request.header(&k, &v);
        }
        let response = request.body(body).send().await.context("order request failed")?;
        let status = response.status();
        let latency_ms = started.elapsed().as_millis() as u64;
        let text = response.text().await.unwrap_or_default();

        if !status.is_success() {
            warn!(status = %status, body = %text, latency_ms, "order rejected by venue");
            return Err(anyhow!("order rejected ({status}): {text}"));
        }
        let parsed: OrderResponse =
            serde_json::from_str(&text).context("unparseable order response")?;
        if let Some(err) = parsed.error_msg.filter(|e| !e.is_empty()) {
            return Err(anyhow!("order error: {err}"));
        }
        let order_id = parsed
            .order_id
            .unwrap_or_else(|| format!("clob:{}", req.client_order_id));
        let state = OrderState {
            status: parsed
                .status
                .as_deref()
                .map(OrderStatus::parse)
                .unwrap_or(OrderStatus::Live),
            filled_size: value_f64(&parsed.filled_size).unwrap_or(0.0),
            avg_price: value_f64(&parsed.avg_price).unwrap_or(req.price),
        };
        info!(order_id = %order_id, status = ?state.status, latency_ms, "order placed");
        Ok(OrderAck {
            order_id,
            state,
            latency_ms,
        })
    }

    async fn cancel_order(&self, order_id: &str) -> Result<()> {
        let path = format!("/order/{order_id}");
        let headers = self.auth_headers("DELETE", &path, "")?;
        let mut request = self.client.delete(format!("{}{}", self.host, path));
        for (k, v) in headers {
            request = request.header(&k, &v);
        }
        let response = request.send().await.context("cancel request failed")?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            // Cancel racing a fill is expected; the caller re-polls state.
            warn!(order_id = %order_id, status = %status, body = %text, "cancel not confirmed");
        }
        Ok(())
    }

    async fn order_state(&self, order_id: &str) -> Result<OrderState> {
        let path = format!("/order/{order_id}");
        let headers = self.auth_headers("GET", &path, "")?;
        let mut request = self.client.get(format!("{}{}", self.host, path));
        for (k, v) in headers {
            request = request.header(&k, &v);
        }
        let response = request.send().await.context("order state request failed")?;
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(anyhow!("order state failed ({status}): {text}"));
        }
        let parsed: OrderResponse =
            serde_json::from_str(&text).context("unparseable order state")?;
        Ok(OrderState {
            status: parsed
                .status
                .as_deref()
                .map(OrderStatus::parse)
                .unwrap_or(OrderStatus::Live),
            filled_size: value_f64(&parsed.filled_size).unwrap_or(0.0),
            avg_price: value_f64(&parsed.avg_price).unwrap_or(0.0),
        })
    }
}

/// Deterministic paper client for dry runs and tests.
pub struct PaperClob {
    /// Maker orders fill after this many state polls; `None` never fills.
    pub maker_fills_after: Option<u32>,
    /// FOK/IOC orders are rejected instead of filled.
    pub reject_takers: bool,
    orders: Mutex<HashMap<String, PaperOrder>>,
    counter: Mutex<u64>,
}

struct PaperOrder {
    req: OrderRequest,
    polls: u32,
    canceled: bool,
}

impl PaperClob {
    pub fn new(maker_fills_after: Option<u32>, reject_takers: bool) -> Self {
        Self {
            maker_fills_after,
            reject_takers,
            orders: Mutex::new(HashMap::new()),
            counter: Mutex::new(0),
        }
    }
}

#[async_trait]
impl ClobApi for PaperClob {
    async fn place_order(&self, req: &OrderRequest) -> Result<OrderAck> {
        let order_id = {
            let mut c = self.counter.lock();
            *c += 1;
            format!("paper:{}", *c)
        };
        match req.tif {
            Tif::Fok | Tif::Ioc => {
                if self.reject_takers {
                    return Err(anyhow!("paper taker rejected"));
                }
                Ok(OrderAck {
                    order_id,
                    state: OrderState {
                        status: OrderStatus::Filled,
                        filled_size: req.size,
                        avg_price: req.price,
                    },
                    latency_ms: 1,
                })
            }
            Tif::Gtc => {
                self.orders.lock().insert(
                    order_id.clone(),
                    PaperOrder {
                        req: req.clone(),
                        polls: 0,
                        canceled: false,
                    },
                );
                Ok(OrderAck {
                    order_id,
                    state: OrderState {
                        status: OrderStatus::Live,
                        filled_size: 0.0,
                        avg_price: req.price,
                    },
                    latency_ms: 1,
                })
            }
        }
    }

    async fn cancel_order(&self, order_id: &str) -> Result<()> {
        if let Some(order) = self.orders.lock().get_mut(order_id) {
            order.canceled = true;
        }
        Ok(())
    }

    async fn order_state(&self, order_id: &str) -> Result<OrderState> {
        let mut orders = self.orders.lock();
        let Some(order) = orders.get_mut(order_id) else {
            return Err(anyhow!("unknown paper order {order_id}"));
        };
        if order.canceled {
            return Ok(OrderState {
                status: OrderStatus::Canceled,
                filled_size: 0.0,
                avg_price: order.req.price,
            });
        }
        order.polls += 1;
        match self.maker_fills_after {
            Some(n) if order.polls >= n => Ok(OrderState {
                status: OrderStatus::Filled,
                filled_size: order.req.size,
                avg_price: order.req.price,
            }),
            _ => Ok(OrderState {
                status: OrderStatus::Live,
                filled_size: 0.0,
                avg_price: order.req.price,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_normalization() {
        assert_eq!(OrderStatus::parse("LIVE"), OrderStatus::Live);
        assert_eq!(OrderStatus::parse("open"), OrderStatus::Live);
        assert_eq!(OrderStatus::parse("matched"), OrderStatus::Filled);
        assert_eq!(OrderStatus::parse("Cancelled"), OrderStatus::Canceled);
        assert_eq!(OrderStatus::parse("weird"), OrderStatus::Rejected);
    }

    #[test]
    fn signature_is_deterministic() {
        let client = HttpClobClient::new(
            "https://clob.example".into(),
            "0xwallet".into(),
            ClobCredentials {
                api_key: "k".into(),
                secret: BASE64.encode(b"super-secret"),
                passphrase: "p".into(),
            },
        )
        .unwrap();
        let a = client.sign("POST", "/order", "{}", 1_700_000_000).unwrap();
        let b = client.sign("POST", "/order", "{}", 1_700_000_000).unwrap();
        assert_eq!(a, b);
        let c = client.sign("POST", "/order", "{}", 1_700_000_001).unwrap();
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn paper_maker_fills_after_polls() {
        let clob = PaperClob::new(Some(2), false);
        let ack = clob
            .place_order(&OrderRequest {
                client_order_id: "c1".into(),
                token_id: "t".into(),
                price: 0.55,
                size: 10.0,
                tif: Tif::Gtc,
            })
            .await
            .unwrap();
        assert_eq!(ack.state.status, OrderStatus::Live);
        assert_eq!(
            clob.order_state(&ack.order_id).await.unwrap().status,
            OrderStatus::Live
        );
        let second = clob.order_state(&ack.order_id).await.unwrap();
        assert_eq!(second.status, OrderStatus::Filled);
        assert_eq!(second.filled_size, 10.0);
    }

    #[tokio::test]
    async fn paper_cancel_wins_race_when_unfilled() {
        let clob = PaperClob::new(Some(10), false);
        let ack = clob
            .place_order(&OrderRequest {
                client_order_id: "c2".into(),
                token_id: "t".into(),
                price: 0.40,
                size: 5.0,
                tif: Tif::Gtc,
            })
            .await
            .unwrap();
        clob.cancel_order(&ack.order_id).await.unwrap();
        assert_eq!(
            clob.order_state(&ack.order_id).await.unwrap().status,
            OrderStatus::Canceled
        );
    }
}
