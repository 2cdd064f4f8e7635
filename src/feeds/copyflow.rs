//! Copy-flow aggregator.
//!
//! Periodically pulls recent trades for each active round, weights them by
//! an externally-ranked leader score per wallet, and produces a per-round
//! directional bias `{up_conf, down_conf, n, avg_entry, recency}`. Degraded
//! or missing flow never hard-gates the scorer; it only shifts tier and
//! size downstream.

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::http::HttpService;
use crate::models::Side;

/// Weight assigned to wallets absent from the leader ranking.
const UNRANKED_WEIGHT: f64 = 0.05;
/// Recency half-life for trade weighting.
const RECENCY_HALF_LIFE_S: f64 = 120.0;

#[derive(Debug, Clone)]
pub struct FlowView {
    pub up_conf: f64,
    pub down_conf: f64,
    pub sample_n: u32,
    /// Weighted average entry in cents.
    pub avg_entry_c: f64,
    /// Share of weighted notional at cheap entries (≤ 35c).
    pub low_c_share: f64,
    /// Share of weighted notional at expensive entries (≥ 55c).
    pub high_c_share: f64,
    pub age_s: f64,
}

struct FlowEntry {
    view: FlowView,
    refreshed: Instant,
}

pub struct CopyFlow {
    leaders: HashMap<String, f64>,
    flows: RwLock<HashMap<String, FlowEntry>>,
    active_cids: RwLock<Vec<String>>,
    ondemand_last: RwLock<HashMap<String, Instant>>,
    ondemand_cooldown: Duration,
}

impl CopyFlow {
    pub fn new(leaders: HashMap<String, f64>, ondemand_cooldown: Duration) -> Arc<Self> {
        Arc::new(Self {
            leaders,
            flows: RwLock::new(HashMap::new()),
            active_cids: RwLock::new(Vec::new()),
            ondemand_last: RwLock::new(HashMap::new()),
            ondemand_cooldown,
        })
    }

    pub fn set_active_cids(&self, cids: Vec<String>) {
        *self.active_cids.write() = cids;
        // Drop flows for rounds no longer active.
        let active: std::collections::HashSet<String> =
            self.active_cids.read().iter().cloned().collect();
        self.flows.write().retain(|cid, _| active.contains(cid));
    }

    pub fn get(&self, cid: &str) -> Option<FlowView> {
        let flows = self.flows.read();
        let entry = flows.get(cid)?;
        let mut view = entry.view.clone();
        view.age_s = entry.refreshed.elapsed().as_secs_f64();
        Some(view)
    }

    /// Refresh one round's flow immediately, respecting a per-cid cooldown.
    /// Used by the scorer when it finds flow missing or stale mid-decision.
    pub async fn refresh_on_demand(
        &self,
        http: &HttpService,
        data_api_url: &str,
        cid: &str,
    ) -> Result<bool> {
        {
            let mut last = self.ondemand_last.write();
            if let Some(at) = last.get(cid) {
                if at.elapsed() < self.ondemand_cooldown {
                    return Ok(false);
                }
            }
            last.insert(cid.to_string(), Instant::now());
            if last.len() > 512 {
                let cutoff = self.ondemand_cooldown * 4;
                last.retain(|_, at| at.elapsed() < cutoff);
            }
        }
        self.refresh_cid(http, data_api_url, cid).await?;
        Ok(true)
    }

    pub async fn refresh_cid(
        &self,
        http: &HttpService,
        data_api_url: &str,
        cid: &str,
    ) -> Result<()> {
        let url = format!("{data_api_url}/trades");
        let data = http
            .get_json(
                &url,
                &[
                    ("market", cid.to_string()),
                    ("limit", "120".to_string()),
                ],
                Some(Duration::from_secs(2)),
                None,
            )
            .await
            .context("trades fetch failed")?;

        let rows = data.as_array().cloned().unwrap_or_default();
        let now_ts = chrono::Utc::now().timestamp();
        let view = self.aggregate(&rows, now_ts);
        self.flows.write().insert(
            cid.to_string(),
            FlowEntry {
                view,
                refreshed: Instant::now(),
            },
        );
        Ok(())
    }

    /// Fold raw trade rows into a directional flow view.
    fn aggregate(&self, rows: &[Value], now_ts: i64) -> FlowView {
        let mut up_w = 0.0;
        let mut down_w = 0.0;
        let mut entry_w = 0.0;
        let mut entry_sum_c = 0.0;
        let mut low_c = 0.0;
        let mut high_c = 0.0;
        let mut n: u32 = 0;

        for row in rows {
            let Some(outcome) = row
                .get("outcome")
                .and_then(Value::as_str)
                .and_then(Side::parse)
            else {
                continue;
            };
            // Only aggress-side buys express direction.
            let is_buy = row
                .get("side")
                .and_then(Value::as_str)
                .map(|s| s.eq_ignore_ascii_case("buy"))
                .unwrap_or(true);
            if !is_buy {
                continue;
            }
            let price = match row.get("price") {
                Some(Value::Number(x)) => x.as_f64().unwrap_or(0.0),
                Some(Value::String(s)) => s.parse().unwrap_or(0.0),
                _ => 0.0,
            };
            let size = match row.get("size") {
                Some(Value::Number(x)) => x.as_f64().unwrap_or(0.0),
                Some(Value::String(s)) => s.parse().unwrap_or(0.0),
                _ => 0.0,
            };
            if !(price > 0.0 && price < 1.0 && size > 0.0) {
                continue;
            }
            let wallet = row
                .get("proxyWallet")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_ascii_lowercase();
            let leader_score = self.leaders.get(&wallet).copied().unwrap_or(UNRANKED_WEIGHT);
            let ts = row.get("timestamp").and_then(Value::as_i64).unwrap_or(now_ts);
            let age = (now_ts - ts).max(0) as f64;
            let recency = (-age / RECENCY_HALF_LIFE_S * std::f64::consts::LN_2).exp();
            let weight = leader_score * recency * (price * size);

            match outcome {
                Side::Up => up_w += weight,
                Side::Down => down_w += weight,
            }
            entry_w += weight;
            entry_sum_c += weight * price * 100.0;
            if price <= 0.35 {
                low_c += weight;
            }
            if price >= 0.55 {
                high_c += weight;
            }
            n += 1;
        }

        let total = up_w + down_w;
        if total <= 0.0 {
            return FlowView {
                up_conf: 0.0,
                down_conf: 0.0,
                sample_n: 0,
                avg_entry_c: 0.0,
                low_c_share: 0.0,
                high_c_share: 0.0,
                age_s: 0.0,
            };
        }
        FlowView {
            up_conf: up_w / total,
            down_conf: down_w / total,
            sample_n: n,
            avg_entry_c: if entry_w > 0.0 { entry_sum_c / entry_w } else { 0.0 },
            low_c_share: if entry_w > 0.0 { low_c / entry_w } else { 0.0 },
            high_c_share: if entry_w > 0.0 { high_c / entry_w } else { 0.0 },
            age_s: 0.0,
        }
    }

    /// Supervised loop body: refresh flow for every active round, bounded
    /// by the shared inflight semaphore.
    pub async fn run_refresh_loop(
        self: Arc<Self>,
        http: Arc<HttpService>,
        data_api_url: String,
        interval: Duration,
    ) -> Result<()> {
        loop {
            let cids: Vec<String> = self.active_cids.read().clone();
            for cid in cids {
                let _permit = http.acquire().await;
                if let Err(e) = self.refresh_cid(&http, &data_api_url, &cid).await {
                    debug!(cid = %cid, error = %format!("{e:#}"), "copyflow refresh failed");
                }
            }
            tokio::time::sleep(interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn flow_with_leader() -> Arc<CopyFlow> {
        let mut leaders = HashMap::new();
        leaders.insert("0xleader".to_string(), 1.0);
        CopyFlow::new(leaders, Duration::from_secs(5))
    }

    #[test]
    fn leader_buys_dominate_unranked_flow() {
        let cf = flow_with_leader();
        let now = 1_700_000_000;
        let rows = vec![
            json!({"proxyWallet":"0xLEADER","outcome":"Up","side":"BUY",
                   "price":0.55,"size":200.0,"timestamp":now - 5}),
            json!({"proxyWallet":"0xnobody","outcome":"Down","side":"BUY",
                   "price":0.45,"size":200.0,"timestamp":now - 5}),
        ];
        let view = cf.aggregate(&rows, now);
        assert!(view.up_conf > 0.85, "up_conf={}", view.up_conf);
        assert_eq!(view.sample_n, 2);
        assert!(view.high_c_share > 0.5);
    }

    #[test]
    fn sells_and_bad_rows_are_ignored() {
        let cf = flow_with_leader();
        let now = 1_700_000_000;
        let rows = vec![
            json!({"proxyWallet":"0xleader","outcome":"Up","side":"SELL",
                   "price":0.55,"size":100.0,"timestamp":now}),
            json!({"proxyWallet":"0xleader","outcome":"Sideways","side":"BUY",
                   "price":0.55,"size":100.0,"timestamp":now}),
            json!({"outcome":"Up","side":"BUY","price":1.5,"size":100.0,"timestamp":now}),
        ];
        let view = cf.aggregate(&rows, now);
        assert_eq!(view.sample_n, 0);
        assert_eq!(view.up_conf, 0.0);
    }

    #[test]
    fn recency_decay_discounts_old_trades() {
        let cf = flow_with_leader();
        let now = 1_700_000_000;
        let rows = vec![
            // Old Up trade, fresh Down trade, same wallet and notional.
            json!({"proxyWallet":"0xleader","outcome":"Up","side":"BUY",
                   "price":0.50,"size":100.0,"timestamp":now - 600}),
            json!({"proxyWallet":"0xleader","outcome":"Down","side":"BUY",
                   "price":0.50,"size":100.0,"timestamp":now - 1}),
        ];
        let view = cf.aggregate(&rows, now);
        assert!(view.down_conf > view.up_conf);
    }

    #[test]
    fn inactive_rounds_are_dropped() {
        let cf = flow_with_leader();
        cf.flows.write().insert(
            "old".to_string(),
            FlowEntry {
                view: FlowView {
                    up_conf: 1.0,
                    down_conf: 0.0,
                    sample_n: 1,
                    avg_entry_c: 50.0,
                    low_c_share: 0.0,
                    high_c_share: 0.0,
                    age_s: 0.0,
                },
                refreshed: Instant::now(),
            },
        );
        cf.set_active_cids(vec!["new".to_string()]);
        assert!(cf.get("old").is_none());
    }
}
