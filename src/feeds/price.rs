//! Price websocket feed.
//!
//! Tick-by-tick asset prices over a topic-subscribe websocket. Each tick
//! updates the in-memory quote, a bounded history ring, time-weighted EMAs
//! at fixed half-lives, a constant-velocity Kalman filter and an EWMA
//! variance of per-second log returns (realized vol proxy).

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, trace, warn};

use super::analytics;
use crate::models::{Asset, Side};

pub const EMA_HALF_LIVES_S: [f64; 4] = [5.0, 30.0, 60.0, 180.0];

const SECS_PER_YEAR: f64 = 31_536_000.0;

#[derive(Debug, Clone, Copy)]
pub struct PricePoint {
    pub ts: i64,
    pub price: f64,
}

/// Broadcast event for reactive consumers (snapshot builder, scan loop).
#[derive(Debug, Clone)]
pub struct PriceTick {
    pub asset: Asset,
    pub price: f64,
    pub ts_ms: i64,
}

/// Constant-velocity Kalman filter state (level + velocity per second).
#[derive(Debug, Clone, Copy)]
struct Kalman {
    level: f64,
    vel: f64,
    p: [[f64; 2]; 2],
    last_ts_ms: i64,
    ready: bool,
}

impl Kalman {
    fn new() -> Self {
        Self {
            level: 0.0,
            vel: 0.0,
            p: [[1.0, 0.0], [0.0, 1.0]],
            last_ts_ms: 0,
            ready: false,
        }
    }

    fn update(&mut self, price: f64, ts_ms: i64, q: f64, r: f64) {
        if !self.ready {
            self.level = price;
            self.vel = 0.0;
            self.last_ts_ms = ts_ms;
            self.ready = true;
            return;
        }
        let dt = ((ts_ms - self.last_ts_ms).max(1) as f64) / 1000.0;
        self.last_ts_ms = ts_ms;

        // Predict.
        let level_pred = self.level + self.vel * dt;
        let p00 = self.p[0][0] + dt * (self.p[1][0] + self.p[0][1]) + dt * dt * self.p[1][1]
            + q * dt;
        let p01 = self.p[0][1] + dt * self.p[1][1];
        let p10 = self.p[1][0] + dt * self.p[1][1];
        let p11 = self.p[1][1] + q * dt;

        // Update with measurement `price`.
        let innov = price - level_pred;
        let s = p00 + r;
        let k0 = p00 / s;
        let k1 = p10 / s;
        self.level = level_pred + k0 * innov;
        self.vel += k1 * innov;
        self.p = [
            [(1.0 - k0) * p00, (1.0 - k0) * p01],
            [p10 - k1 * p00, p11 - k1 * p01],
        ];
    }
}

#[derive(Debug, Clone)]
struct SymbolState {
    latest: Option<PricePoint>,
    received: Option<Instant>,
    history: VecDeque<PricePoint>,
    emas: [Option<f64>; 4],
    ema_ts_ms: i64,
    kalman: Kalman,
    ewma_var: Option<f64>,
    last_price: Option<f64>,
    last_ts: Option<i64>,
}

impl SymbolState {
    fn new() -> Self {
        Self {
            latest: None,
            received: None,
            history: VecDeque::new(),
            emas: [None; 4],
            ema_ts_ms: 0,
            kalman: Kalman::new(),
            ewma_var: None,
            last_price: None,
            last_ts: None,
        }
    }
}

/// Snapshot of the per-asset technical state, consumed by the scorer.
#[derive(Debug, Clone, Copy)]
pub struct AssetTech {
    pub mom_5s: f64,
    pub mom_30s: f64,
    pub mom_180s: f64,
    pub mom_kalman: f64,
    pub ema_5s: Option<f64>,
    pub ema_60s: Option<f64>,
    pub kalman_vel: Option<f64>,
    pub sigma_per_sqrt_s: Option<f64>,
    pub annual_vol: f64,
    pub rsi: f64,
    pub williams_r: f64,
    pub variance_ratio: f64,
    pub autocorr: f64,
    pub jump_z: f64,
    pub jump_dir: Option<Side>,
    pub last_price: Option<f64>,
}

impl AssetTech {
    pub fn neutral(asset: Asset) -> Self {
        Self {
            mom_5s: 0.5,
            mom_30s: 0.5,
            mom_180s: 0.5,
            mom_kalman: 0.5,
            ema_5s: None,
            ema_60s: None,
            kalman_vel: None,
            sigma_per_sqrt_s: None,
            annual_vol: asset.default_annual_vol(),
            rsi: 50.0,
            williams_r: -50.0,
            variance_ratio: 1.0,
            autocorr: 0.0,
            jump_z: 0.0,
            jump_dir: None,
            last_price: None,
        }
    }
}

pub struct PriceFeed {
    inner: RwLock<HashMap<Asset, SymbolState>>,
    history_len: usize,
    ewma_lambda: f64,
    update_tx: broadcast::Sender<PriceTick>,
}

impl PriceFeed {
    pub fn new(history_len: usize) -> Arc<Self> {
        let (update_tx, _) = broadcast::channel(1024);
        Arc::new(Self {
            inner: RwLock::new(HashMap::new()),
            history_len: history_len.max(16),
            ewma_lambda: 0.97,
            update_tx,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PriceTick> {
        self.update_tx.subscribe()
    }

    pub fn latest(&self, asset: Asset) -> Option<(f64, f64)> {
        let map = self.inner.read();
        let s = map.get(&asset)?;
        let p = s.latest?;
        let age_ms = s
            .received
            .map(|r| r.elapsed().as_secs_f64() * 1000.0)
            .unwrap_or(f64::MAX);
        Some((p.price, age_ms))
    }

    pub fn sigma_per_sqrt_s(&self, asset: Asset) -> Option<f64> {
        let map = self.inner.read();
        let v = map.get(&asset)?.ewma_var?;
        if v.is_finite() && v > 0.0 {
            Some(v.sqrt())
        } else {
            None
        }
    }

    pub fn annual_vol(&self, asset: Asset) -> f64 {
        self.sigma_per_sqrt_s(asset)
            .map(|s| s * SECS_PER_YEAR.sqrt())
            .filter(|v| v.is_finite() && *v > 0.01 && *v < 5.0)
            .unwrap_or_else(|| asset.default_annual_vol())
    }

    /// Price point closest to `target_ts` within `max_skew_s`.
    pub fn price_near(&self, asset: Asset, target_ts: i64, max_skew_s: i64) -> Option<PricePoint> {
        let map = self.inner.read();
        let s = map.get(&asset)?;
        let mut best: Option<PricePoint> = None;
        let mut best_abs = i64::MAX;
        for p in s.history.iter() {
            let abs = (p.ts - target_ts).abs();
            if abs <= max_skew_s && abs < best_abs {
                best_abs = abs;
                best = Some(*p);
            }
        }
        best.or_else(|| {
            s.latest
                .filter(|p| (p.ts - target_ts).abs() <= max_skew_s)
        })
    }

    /// Direction hint from 30s momentum, used for cross-asset consensus.
    pub fn direction_hint(&self, asset: Asset, up_thr: f64, dn_thr: f64) -> Option<Side> {
        let tech = self.tech(asset);
        if tech.mom_30s > up_thr {
            Some(Side::Up)
        } else if tech.mom_30s < dn_thr {
            Some(Side::Down)
        } else {
            None
        }
    }

    /// Lagged leader probability: the leader's short-horizon momentum, used
    /// as a predictive signal for follower assets.
    pub fn lead_prob(&self, leader: Asset) -> f64 {
        self.tech(leader).mom_30s
    }

    pub fn tech(&self, asset: Asset) -> AssetTech {
        let map = self.inner.read();
        let Some(s) = map.get(&asset) else {
            return AssetTech::neutral(asset);
        };
        let Some(latest) = s.latest else {
            return AssetTech::neutral(asset);
        };

        let sigma = s.ewma_var.filter(|v| *v > 0.0).map(f64::sqrt);
        let price = latest.price;

        let mom = |idx: usize, horizon_s: f64| -> f64 {
            match (s.emas[idx], sigma) {
                (Some(ema), Some(sig)) if ema > 0.0 && price > 0.0 => {
                    let rel = (price / ema).ln();
                    let scale = (sig * horizon_s.sqrt()).max(1e-9);
                    analytics::logistic(rel / scale)
                }
                (Some(ema), None) if ema > 0.0 && price > 0.0 => {
                    analytics::logistic((price / ema).ln() * 2_000.0)
                }
                _ => 0.5,
            }
        };

        let mom_kalman = match sigma {
            Some(sig) if s.kalman.ready && price > 0.0 => {
                let vel_rel = s.kalman.vel / price.max(1e-9);
                analytics::logistic(vel_rel / sig.max(1e-9))
            }
            _ => 0.5,
        };

        let closes: Vec<f64> = s.history.iter().map(|p| p.price).collect();
        let (jz, jsign) = analytics::jump_z(&closes, 3);
        let jump_dir = if jz >= 3.0 {
            if jsign > 0.0 {
                Some(Side::Up)
            } else {
                Some(Side::Down)
            }
        } else {
            None
        };

        AssetTech {
            mom_5s: mom(0, 5.0),
            mom_30s: mom(1, 30.0),
            mom_180s: mom(3, 180.0),
            mom_kalman,
            ema_5s: s.emas[0],
            ema_60s: s.emas[2],
            kalman_vel: s.kalman.ready.then_some(s.kalman.vel),
            sigma_per_sqrt_s: sigma,
            annual_vol: sigma
                .map(|x| x * SECS_PER_YEAR.sqrt())
                .filter(|v| v.is_finite() && *v > 0.01 && *v < 5.0)
                .unwrap_or_else(|| asset.default_annual_vol()),
            rsi: analytics::rsi(&closes, 14),
            williams_r: analytics::williams_r(&closes, 14),
            variance_ratio: analytics::variance_ratio(&closes, 4),
            autocorr: analytics::autocorr_lag1(&closes),
            jump_z: jz,
            jump_dir,
            last_price: Some(price),
        }
    }

    /// Apply one tick. Public so tests and replay can drive the feed.
    pub fn apply_tick(&self, asset: Asset, price: f64, ts_ms: i64) {
        if !(price.is_finite() && price > 0.0) {
            return;
        }
        let ts = ts_ms / 1000;
        {
            let mut map = self.inner.write();
            let s = map.entry(asset).or_insert_with(SymbolState::new);

            // EWMA variance of per-second log returns.
            if let (Some(prev_p), Some(prev_ts)) = (s.last_price, s.last_ts) {
                let dt = (ts - prev_ts).max(1) as f64;
                if prev_p > 0.0 {
                    let r = (price / prev_p).ln() / dt;
                    let obs = r * r;
                    let next = match s.ewma_var {
                        Some(v) => self.ewma_lambda * v + (1.0 - self.ewma_lambda) * obs,
                        None => obs,
                    };
                    if next.is_finite() {
                        s.ewma_var = Some(next);
                    }
                }
            }
            s.last_price = Some(price);
            s.last_ts = Some(ts);

            // Time-weighted EMAs.
            let dt_s = if s.ema_ts_ms > 0 {
                ((ts_ms - s.ema_ts_ms).max(1) as f64) / 1000.0
            } else {
                1.0
            };
            s.ema_ts_ms = ts_ms;
            for (i, hl) in EMA_HALF_LIVES_S.iter().enumerate() {
                let w = 0.5_f64.powf(dt_s / hl);
                s.emas[i] = Some(match s.emas[i] {
                    Some(prev) => w * prev + (1.0 - w) * price,
                    None => price,
                });
            }

            // Kalman: process noise scaled to the asset's price level.
            let q = (price * 1e-5).powi(2);
            let r = (price * 5e-5).powi(2);
            s.kalman.update(price, ts_ms, q, r);

            s.latest = Some(PricePoint { ts, price });
            s.received = Some(Instant::now());

            // Downsample the ring to ~1Hz.
            let push = match s.history.back() {
                Some(last) => last.ts != ts,
                None => true,
            };
            if push {
                s.history.push_back(PricePoint { ts, price });
                while s.history.len() > self.history_len {
                    s.history.pop_front();
                }
            } else if let Some(last) = s.history.back_mut() {
                last.price = price;
            }
        }

        let _ = self.update_tx.send(PriceTick { asset, price, ts_ms });
    }

    /// Supervised loop body: connect, subscribe all topics, pump ticks.
    /// Exponential backoff capped by config; idle silence forces reconnect.
    pub async fn run_ws(
        self: Arc<Self>,
        ws_url: String,
        idle_timeout: Duration,
        backoff_cap: Duration,
    ) -> Result<()> {
        let mut attempt: u32 = 0;
        loop {
            match self.connect_once(&ws_url, idle_timeout).await {
                Ok(()) => attempt = 0,
                Err(e) => {
                    attempt = attempt.saturating_add(1);
                    let base = Duration::from_millis(500 * 2u64.saturating_pow(attempt.min(7)));
                    let delay = base.min(backoff_cap);
                    warn!(error = %format!("{e:#}"), attempt, delay_ms = delay.as_millis() as u64, "price ws reconnecting");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn connect_once(&self, ws_url: &str, idle_timeout: Duration) -> Result<()> {
        let (ws, _) = connect_async(ws_url)
            .await
            .context("price ws connect failed")?;
        let (mut write, mut read) = ws.split();

        let topics: Vec<String> = Asset::ALL
            .iter()
            .map(|a| format!("{}@trade", a.price_topic().to_ascii_lowercase()))
            .collect();
        let sub = serde_json::json!({
            "method": "SUBSCRIBE",
            "params": topics,
            "id": 1,
        });
        write
            .send(Message::Text(sub.to_string()))
            .await
            .context("price ws subscribe failed")?;
        debug!(url = %ws_url, "price ws subscribed");

        loop {
            let msg = match tokio::time::timeout(idle_timeout, read.next()).await {
                Ok(Some(Ok(m))) => m,
                Ok(Some(Err(e))) => return Err(e).context("price ws read error"),
                Ok(None) => anyhow::bail!("price ws closed"),
                Err(_) => anyhow::bail!("price ws idle for {}s", idle_timeout.as_secs()),
            };
            match msg {
                Message::Text(text) => {
                    if let Some((asset, price, ts_ms)) = parse_price_message(&text) {
                        self.apply_tick(asset, price, ts_ms);
                    } else {
                        trace!(len = text.len(), "unparsed price ws frame");
                    }
                }
                Message::Ping(p) => {
                    let _ = write.send(Message::Pong(p)).await;
                }
                Message::Close(_) => anyhow::bail!("price ws close frame"),
                _ => {}
            }
        }
    }
}

/// Messages carry `{symbol, value, ts}` in vendor-specific spellings.
fn parse_price_message(text: &str) -> Option<(Asset, f64, i64)> {
    let v: Value = serde_json::from_str(text).ok()?;
    let symbol = v
        .get("symbol")
        .or_else(|| v.get("s"))
        .and_then(Value::as_str)?;
    let asset = Asset::ALL
        .iter()
        .copied()
        .find(|a| symbol.eq_ignore_ascii_case(a.price_topic()) || symbol.eq_ignore_ascii_case(a.as_str()))?;
    let price = match v.get("value").or_else(|| v.get("p")).or_else(|| v.get("price"))? {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.parse().ok()?,
        _ => return None,
    };
    let ts_ms = v
        .get("ts")
        .or_else(|| v.get("T"))
        .or_else(|| v.get("t"))
        .and_then(Value::as_i64)
        .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());
    Some((asset, price, ts_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_vendor_frames() {
        let (a, p, t) =
            parse_price_message(r#"{"s":"BTCUSDT","p":"60123.5","T":1700000000000}"#).unwrap();
        assert_eq!(a, Asset::Btc);
        assert!((p - 60123.5).abs() < 1e-9);
        assert_eq!(t, 1_700_000_000_000);

        let (a2, p2, _) =
            parse_price_message(r#"{"symbol":"ETH","value":3000.25,"ts":1700000001000}"#).unwrap();
        assert_eq!(a2, Asset::Eth);
        assert!((p2 - 3000.25).abs() < 1e-9);
    }

    #[test]
    fn uptrend_pushes_momentum_above_half() {
        let feed = PriceFeed::new(300);
        let mut ts = 1_700_000_000_000_i64;
        let mut px = 60_000.0;
        for _ in 0..240 {
            ts += 1_000;
            px *= 1.0002;
            feed.apply_tick(Asset::Btc, px, ts);
        }
        let tech = feed.tech(Asset::Btc);
        assert!(tech.mom_5s > 0.5, "mom_5s={}", tech.mom_5s);
        assert!(tech.mom_30s > 0.5, "mom_30s={}", tech.mom_30s);
        assert!(tech.mom_kalman > 0.5, "kalman={}", tech.mom_kalman);
        assert!(tech.rsi > 60.0);
        assert!(tech.sigma_per_sqrt_s.is_some());
    }

    #[test]
    fn history_ring_is_bounded() {
        let feed = PriceFeed::new(50);
        let mut ts = 1_700_000_000_000_i64;
        for i in 0..200 {
            ts += 1_000;
            feed.apply_tick(Asset::Sol, 100.0 + i as f64 * 0.01, ts);
        }
        let map = feed.inner.read();
        assert_eq!(map.get(&Asset::Sol).unwrap().history.len(), 50);
    }

    #[test]
    fn price_near_finds_window_open() {
        let feed = PriceFeed::new(300);
        let base_ts = 1_700_000_000_i64;
        for i in 0..60 {
            feed.apply_tick(Asset::Eth, 3000.0 + i as f64, (base_ts + i) * 1000);
        }
        let p = feed.price_near(Asset::Eth, base_ts + 30, 3).unwrap();
        assert!((p.price - 3030.0).abs() < 1.5);
        assert!(feed.price_near(Asset::Eth, base_ts - 500, 3).is_none());
    }
}
