//! Perpetual-derivatives intelligence feed.
//!
//! Maintains, per asset: futures depth (for the depth-weighted book
//! imbalance), an aggregate-trade ring (taker flow, order-flow imbalance,
//! VWAP), liquidation bursts keyed by side, and polled mark/index/funding,
//! open interest and long/short account ratio.

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

use crate::http::HttpService;
use crate::models::{Asset, Side};

#[derive(Debug, Clone, Copy)]
struct AggTrade {
    ts: i64,
    price: f64,
    qty: f64,
    /// True when the buyer was the maker, i.e. an aggressive sell.
    buyer_is_maker: bool,
}

#[derive(Debug, Clone, Copy)]
struct Liquidation {
    ts: i64,
    notional: f64,
    /// Side that got liquidated: Up = longs, Down = shorts.
    side: Side,
}

#[derive(Debug, Clone, Default)]
struct DepthSide {
    levels: Vec<(f64, f64)>,
}

#[derive(Default)]
struct AssetState {
    bids: DepthSide,
    asks: DepthSide,
    trades: VecDeque<AggTrade>,
    liqs: VecDeque<Liquidation>,
    /// Rolling 1-minute taker volume history, newest last (30 entries).
    minute_volumes: VecDeque<(i64, f64)>,
    mark: f64,
    index: f64,
    funding_rate: f64,
    oi_prev: f64,
    oi_cur: f64,
    ls_ratio: f64,
}

/// Per-asset derivatives view captured into the snapshot.
#[derive(Debug, Clone, Copy)]
pub struct DerivsView {
    /// Depth-weighted imbalance in [-1, 1]; positive = bid pressure.
    pub ob_imbalance: f64,
    /// Taker buy fraction of volume over the flow window, in [0, 1].
    pub taker_ratio: f64,
    /// Last-minute volume vs the 30-minute average.
    pub vol_ratio: f64,
    /// Size multiplier derived from volume expansion.
    pub vol_mult: f64,
    /// (mark - index) / index.
    pub perp_basis: f64,
    pub funding_rate: f64,
    /// Relative open-interest change since the previous poll.
    pub oi_delta: Option<f64>,
    pub ls_ratio: f64,
    /// (last trade price - round VWAP) / VWAP; 0 when unknown.
    pub vwap_dev: f64,
    /// Signed aggregate-trade order-flow imbalance over the OFI window.
    pub ofi: f64,
    /// Liquidated notional over the flow window, by wiped side.
    pub liq_long_notional: f64,
    pub liq_short_notional: f64,
    /// Depth + recent volume are both present.
    pub volume_ready: bool,
}

impl DerivsView {
    pub fn neutral() -> Self {
        Self {
            ob_imbalance: 0.0,
            taker_ratio: 0.5,
            vol_ratio: 1.0,
            vol_mult: 1.0,
            perp_basis: 0.0,
            funding_rate: 0.0,
            oi_delta: None,
            ls_ratio: 1.0,
            vwap_dev: 0.0,
            ofi: 0.0,
            liq_long_notional: 0.0,
            liq_short_notional: 0.0,
            volume_ready: false,
        }
    }
}

pub struct DerivsFeed {
    state: RwLock<HashMap<Asset, AssetState>>,
    flow_window_s: i64,
    ofi_window_s: i64,
}

impl DerivsFeed {
    pub fn new(ofi_window_s: i64) -> Arc<Self> {
        Arc::new(Self {
            state: RwLock::new(HashMap::new()),
            flow_window_s: 60,
            ofi_window_s: ofi_window_s.max(5),
        })
    }

    pub fn apply_depth(&self, asset: Asset, bids: Vec<(f64, f64)>, asks: Vec<(f64, f64)>) {
        let mut map = self.state.write();
        let s = map.entry(asset).or_default();
        s.bids = DepthSide { levels: bids };
        s.asks = DepthSide { levels: asks };
    }

    pub fn apply_trade(&self, asset: Asset, ts: i64, price: f64, qty: f64, buyer_is_maker: bool) {
        if !(price > 0.0 && qty > 0.0) {
            return;
        }
        let mut map = self.state.write();
        let s = map.entry(asset).or_default();
        s.trades.push_back(AggTrade {
            ts,
            price,
            qty,
            buyer_is_maker,
        });
        let horizon = ts - 1_200; // keep 20 minutes for VWAP over a round
        while s.trades.front().map(|t| t.ts < horizon).unwrap_or(false) {
            s.trades.pop_front();
        }

        // Fold into per-minute volume baseline.
        let minute = ts - ts % 60;
        match s.minute_volumes.back_mut() {
            Some((m, v)) if *m == minute => *v += qty * price,
            _ => {
                s.minute_volumes.push_back((minute, qty * price));
                while s.minute_volumes.len() > 30 {
                    s.minute_volumes.pop_front();
                }
            }
        }
    }

    pub fn apply_liquidation(&self, asset: Asset, ts: i64, notional: f64, wiped: Side) {
        let mut map = self.state.write();
        let s = map.entry(asset).or_default();
        s.liqs.push_back(Liquidation {
            ts,
            notional,
            side: wiped,
        });
        while s.liqs.len() > 256 {
            s.liqs.pop_front();
        }
    }

    pub fn apply_mark_index_funding(&self, asset: Asset, mark: f64, index: f64, funding: f64) {
        let mut map = self.state.write();
        let s = map.entry(asset).or_default();
        s.mark = mark;
        s.index = index;
        s.funding_rate = funding;
    }

    pub fn apply_open_interest(&self, asset: Asset, oi: f64) {
        let mut map = self.state.write();
        let s = map.entry(asset).or_default();
        if s.oi_cur > 0.0 {
            s.oi_prev = s.oi_cur;
        }
        s.oi_cur = oi;
    }

    pub fn apply_ls_ratio(&self, asset: Asset, ratio: f64) {
        let mut map = self.state.write();
        map.entry(asset).or_default().ls_ratio = ratio;
    }

    /// Capture the current derivatives view for one asset. `round_start_ts`
    /// scopes the VWAP to the active round; `now_ts` bounds the flow window.
    pub fn view(&self, asset: Asset, round_start_ts: i64, now_ts: i64) -> DerivsView {
        let map = self.state.read();
        let Some(s) = map.get(&asset) else {
            return DerivsView::neutral();
        };

        // Depth-weighted 1/rank imbalance.
        let ob_imbalance = depth_weighted_imbalance(&s.bids.levels, &s.asks.levels);

        // Taker flow over the flow window.
        let flow_from = now_ts - self.flow_window_s;
        let mut buy = 0.0;
        let mut sell = 0.0;
        for t in s.trades.iter().filter(|t| t.ts >= flow_from) {
            if t.buyer_is_maker {
                sell += t.qty * t.price;
            } else {
                buy += t.qty * t.price;
            }
        }
        let taker_ratio = if buy + sell > 0.0 {
            buy / (buy + sell)
        } else {
            0.5
        };

        // Last-minute volume vs 30-minute average.
        let (vol_ratio, have_baseline) = {
            let n = s.minute_volumes.len();
            if n >= 5 {
                let last = s.minute_volumes.back().map(|(_, v)| *v).unwrap_or(0.0);
                let avg: f64 =
                    s.minute_volumes.iter().map(|(_, v)| *v).sum::<f64>() / n as f64;
                if avg > 0.0 {
                    (last / avg, true)
                } else {
                    (1.0, false)
                }
            } else {
                (1.0, false)
            }
        };
        let vol_mult = vol_ratio.sqrt().clamp(0.80, 1.30);

        // VWAP over the active round.
        let mut pv = 0.0;
        let mut vol = 0.0;
        let mut last_price = 0.0;
        for t in s.trades.iter().filter(|t| t.ts >= round_start_ts) {
            pv += t.price * t.qty;
            vol += t.qty;
            last_price = t.price;
        }
        let vwap_dev = if vol > 0.0 && last_price > 0.0 {
            let vwap = pv / vol;
            (last_price - vwap) / vwap
        } else {
            0.0
        };

        // Signed OFI over the (shorter) OFI window.
        let ofi_from = now_ts - self.ofi_window_s;
        let mut signed = 0.0;
        let mut total = 0.0;
        for t in s.trades.iter().filter(|t| t.ts >= ofi_from) {
            let notional = t.qty * t.price;
            total += notional;
            signed += if t.buyer_is_maker { -notional } else { notional };
        }
        let ofi = if total > 0.0 { signed / total } else { 0.0 };

        // Liquidations over the flow window.
        let mut liq_long = 0.0;
        let mut liq_short = 0.0;
        for l in s.liqs.iter().filter(|l| l.ts >= flow_from) {
            match l.side {
                Side::Up => liq_long += l.notional,
                Side::Down => liq_short += l.notional,
            }
        }

        let perp_basis = if s.index > 0.0 && s.mark > 0.0 {
            (s.mark - s.index) / s.index
        } else {
            0.0
        };

        let oi_delta = if s.oi_prev > 0.0 && s.oi_cur > 0.0 {
            Some((s.oi_cur - s.oi_prev) / s.oi_prev)
        } else {
            None
        };

        DerivsView {
            ob_imbalance,
            taker_ratio,
            vol_ratio,
            vol_mult,
            perp_basis,
            funding_rate: s.funding_rate,
            oi_delta,
            ls_ratio: if s.ls_ratio > 0.0 { s.ls_ratio } else { 1.0 },
            vwap_dev,
            ofi,
            liq_long_notional: liq_long,
            liq_short_notional: liq_short,
            volume_ready: have_baseline
                && !s.bids.levels.is_empty()
                && !s.asks.levels.is_empty(),
        }
    }

    /// Supervised loop body: combined aggTrade + depth + liquidation stream.
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
                    let delay = Duration::from_millis(500 * 2u64.saturating_pow(attempt.min(7)))
                        .min(backoff_cap);
                    warn!(error = %format!("{e:#}"), delay_ms = delay.as_millis() as u64, "derivs ws reconnecting");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn connect_once(&self, ws_url: &str, idle_timeout: Duration) -> Result<()> {
        let (ws, _) = connect_async(ws_url)
            .await
            .context("derivs ws connect failed")?;
        let (mut write, mut read) = ws.split();

        let mut params = Vec::new();
        for asset in Asset::ALL {
            let sym = asset.price_topic().to_ascii_lowercase();
            params.push(format!("{sym}@aggTrade"));
            params.push(format!("{sym}@depth20@500ms"));
            params.push(format!("{sym}@forceOrder"));
        }
        let sub = serde_json::json!({
            "method": "SUBSCRIBE",
            "params": params,
            "id": 1,
        });
        write
            .send(Message::Text(sub.to_string()))
            .await
            .context("derivs ws subscribe failed")?;
        debug!(url = %ws_url, "derivs ws subscribed");

        loop {
            let msg = match tokio::time::timeout(idle_timeout, read.next()).await {
                Ok(Some(Ok(m))) => m,
                Ok(Some(Err(e))) => return Err(e).context("derivs ws read error"),
                Ok(None) => anyhow::bail!("derivs ws closed"),
                Err(_) => anyhow::bail!("derivs ws idle for {}s", idle_timeout.as_secs()),
            };
            match msg {
                Message::Text(text) => self.handle_frame(&text),
                Message::Ping(p) => {
                    let _ = write.send(Message::Pong(p)).await;
                }
                Message::Close(_) => anyhow::bail!("derivs ws close frame"),
                _ => {}
            }
        }
    }

    fn handle_frame(&self, text: &str) {
        let Ok(v) = serde_json::from_str::<Value>(text) else {
            return;
        };
        let event = v.get("e").and_then(Value::as_str).unwrap_or("");
        match event {
            "aggTrade" => {
                let Some(asset) = asset_from_symbol(&v, "s") else {
                    return;
                };
                let ts = v.get("T").and_then(Value::as_i64).unwrap_or(0) / 1000;
                let price = num(&v, "p").unwrap_or(0.0);
                let qty = num(&v, "q").unwrap_or(0.0);
                let maker = v.get("m").and_then(Value::as_bool).unwrap_or(false);
                self.apply_trade(asset, ts, price, qty, maker);
            }
            "depthUpdate" | "depth" => {
                let Some(asset) = asset_from_symbol(&v, "s") else {
                    return;
                };
                let bids = levels(&v, "b").or_else(|| levels(&v, "bids"));
                let asks = levels(&v, "a").or_else(|| levels(&v, "asks"));
                if let (Some(bids), Some(asks)) = (bids, asks) {
                    self.apply_depth(asset, bids, asks);
                }
            }
            "forceOrder" => {
                let Some(order) = v.get("o") else { return };
                let Some(asset) = asset_from_symbol(order, "s") else {
                    return;
                };
                let ts = order.get("T").and_then(Value::as_i64).unwrap_or(0) / 1000;
                let price = num(order, "ap").or_else(|| num(order, "p")).unwrap_or(0.0);
                let qty = num(order, "q").unwrap_or(0.0);
                // A SELL force order wipes longs.
                let wiped = match order.get("S").and_then(Value::as_str) {
                    Some("SELL") => Side::Up,
                    _ => Side::Down,
                };
                self.apply_liquidation(asset, ts, price * qty, wiped);
            }
            _ => {}
        }
    }

    /// Supervised loop body: poll mark/funding, open interest and L/S ratio.
    pub async fn run_rest_poller(
        self: Arc<Self>,
        http: Arc<HttpService>,
        rest_url: String,
        interval: Duration,
    ) -> Result<()> {
        loop {
            for asset in Asset::ALL {
                let sym = asset.price_topic();
                if let Err(e) = self.poll_asset(&http, &rest_url, asset, sym).await {
                    debug!(asset = %asset, error = %format!("{e:#}"), "derivs rest poll failed");
                }
            }
            tokio::time::sleep(interval).await;
        }
    }

    async fn poll_asset(
        &self,
        http: &HttpService,
        rest_url: &str,
        asset: Asset,
        symbol: &str,
    ) -> Result<()> {
        let premium = http
            .get_json(
                &format!("{rest_url}/fapi/v1/premiumIndex"),
                &[("symbol", symbol.to_string())],
                None,
                None,
            )
            .await?;
        let mark = num(&premium, "markPrice").unwrap_or(0.0);
        let index = num(&premium, "indexPrice").unwrap_or(0.0);
        let funding = num(&premium, "lastFundingRate").unwrap_or(0.0);
        if mark > 0.0 && index > 0.0 {
            self.apply_mark_index_funding(asset, mark, index, funding);
        }

        let oi = http
            .get_json(
                &format!("{rest_url}/fapi/v1/openInterest"),
                &[("symbol", symbol.to_string())],
                None,
                None,
            )
            .await?;
        if let Some(v) = num(&oi, "openInterest") {
            self.apply_open_interest(asset, v);
        }

        let ls = http
            .get_json(
                &format!("{rest_url}/futures/data/globalLongShortAccountRatio"),
                &[
                    ("symbol", symbol.to_string()),
                    ("period", "5m".to_string()),
                    ("limit", "1".to_string()),
                ],
                None,
                None,
            )
            .await?;
        if let Some(row) = ls.as_array().and_then(|a| a.last()) {
            if let Some(ratio) = num(row, "longShortRatio") {
                self.apply_ls_ratio(asset, ratio);
            }
        }
        Ok(())
    }
}

fn depth_weighted_imbalance(bids: &[(f64, f64)], asks: &[(f64, f64)]) -> f64 {
    let mut num_sum = 0.0;
    let mut den_sum = 0.0;
    for (rank, (_, qty)) in bids.iter().enumerate() {
        let w = 1.0 / (rank + 1) as f64;
        num_sum += w * qty;
        den_sum += w * qty;
    }
    for (rank, (_, qty)) in asks.iter().enumerate() {
        let w = 1.0 / (rank + 1) as f64;
        num_sum -= w * qty;
        den_sum += w * qty;
    }
    if den_sum > 0.0 {
        (num_sum / den_sum).clamp(-1.0, 1.0)
    } else {
        0.0
    }
}

fn num(v: &Value, key: &str) -> Option<f64> {
    match v.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn asset_from_symbol(v: &Value, key: &str) -> Option<Asset> {
    let sym = v.get(key)?.as_str()?;
    Asset::ALL
        .iter()
        .copied()
        .find(|a| sym.eq_ignore_ascii_case(a.price_topic()))
}

fn levels(v: &Value, key: &str) -> Option<Vec<(f64, f64)>> {
    let arr = v.get(key)?.as_array()?;
    Some(
        arr.iter()
            .filter_map(|l| {
                let pair = l.as_array()?;
                let price: f64 = match pair.first()? {
                    Value::Number(n) => n.as_f64()?,
                    Value::String(s) => s.parse().ok()?,
                    _ => return None,
                };
                let qty: f64 = match pair.get(1)? {
                    Value::Number(n) => n.as_f64()?,
                    Value::String(s) => s.parse().ok()?,
                    _ => return None,
                };
                Some((price, qty))
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn imbalance_favors_heavier_side() {
        let bids = vec![(100.0, 10.0), (99.9, 8.0)];
        let asks = vec![(100.1, 2.0), (100.2, 1.0)];
        assert!(depth_weighted_imbalance(&bids, &asks) > 0.5);
        assert!(depth_weighted_imbalance(&asks, &bids) < 0.0);
        assert_eq!(depth_weighted_imbalance(&[], &[]), 0.0);
    }

    #[test]
    fn taker_flow_and_ofi_from_trades() {
        let feed = DerivsFeed::new(20);
        let now = 1_700_000_600;
        // Heavy aggressive buying.
        for i in 0..30 {
            feed.apply_trade(Asset::Btc, now - 30 + i, 60_000.0, 2.0, false);
        }
        for i in 0..5 {
            feed.apply_trade(Asset::Btc, now - 30 + i, 60_000.0, 1.0, true);
        }
        let view = feed.view(Asset::Btc, now - 300, now);
        assert!(view.taker_ratio > 0.8);
        assert!(view.ofi > 0.5);
    }

    #[test]
    fn vwap_deviation_is_scoped_to_round() {
        let feed = DerivsFeed::new(20);
        let start = 1_700_000_000;
        // Old trades before the round at a much lower price.
        feed.apply_trade(Asset::Eth, start - 100, 2_000.0, 50.0, false);
        // Round trades around 3000 then a push to 3030.
        feed.apply_trade(Asset::Eth, start + 10, 3_000.0, 10.0, false);
        feed.apply_trade(Asset::Eth, start + 20, 3_030.0, 10.0, false);
        let view = feed.view(Asset::Eth, start, start + 30);
        assert!(view.vwap_dev > 0.0);
        assert!(view.vwap_dev < 0.01);
    }

    #[test]
    fn liquidations_bucketed_by_wiped_side() {
        let feed = DerivsFeed::new(20);
        let now = 1_700_000_000;
        feed.apply_liquidation(Asset::Sol, now - 10, 50_000.0, Side::Up);
        feed.apply_liquidation(Asset::Sol, now - 5, 20_000.0, Side::Down);
        let view = feed.view(Asset::Sol, now - 300, now);
        assert_eq!(view.liq_long_notional, 50_000.0);
        assert_eq!(view.liq_short_notional, 20_000.0);
    }

    #[test]
    fn frame_parsing_handles_agg_trade() {
        let feed = DerivsFeed::new(20);
        feed.handle_frame(
            r#"{"e":"aggTrade","s":"BTCUSDT","p":"60000.5","q":"0.8","T":1700000000000,"m":false}"#,
        );
        let view = feed.view(Asset::Btc, 1_699_999_000, 1_700_000_010);
        assert!(view.taker_ratio > 0.5);
    }

    #[test]
    fn oi_delta_requires_two_polls() {
        let feed = DerivsFeed::new(20);
        feed.apply_open_interest(Asset::Xrp, 1_000.0);
        let v1 = feed.view(Asset::Xrp, 0, 0);
        assert!(v1.oi_delta.is_none());
        feed.apply_open_interest(Asset::Xrp, 1_050.0);
        let v2 = feed.view(Asset::Xrp, 0, 0);
        assert!((v2.oi_delta.unwrap() - 0.05).abs() < 1e-9);
    }
}
