//! Decision-time snapshots.
//!
//! The feed manager publishes an immutable view per active round into a
//! copy-on-write map; the scorer reads whole snapshots by value and never
//! touches feed internals. Every field carries its own age so staleness is
//! explicit at decision time.

use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::FeedConfig;
use crate::feeds::book::{BookCache, BookView};
use crate::feeds::copyflow::{CopyFlow, FlowView};
use crate::feeds::derivs::{DerivsFeed, DerivsView};
use crate::feeds::oracle::OracleFeed;
use crate::feeds::price::{AssetTech, PriceFeed};
use crate::markets::MarketCatalog;
use crate::models::{Asset, DecisionSource, OpenPriceSource, Round, Side};

#[derive(Debug, Clone, Copy)]
pub struct Quote {
    pub price: f64,
    pub age_ms: f64,
}

/// Immutable per-round view handed to the scorer.
#[derive(Debug, Clone)]
pub struct RoundSnapshot {
    pub round: Round,
    pub now_ts: i64,
    pub quote: Option<Quote>,
    pub oracle_price: Option<f64>,
    pub oracle_age_s: Option<f64>,
    pub open_price: Option<f64>,
    pub open_source: OpenPriceSource,
    pub prev_open: Option<f64>,
    pub book_up: Option<BookView>,
    pub book_down: Option<BookView>,
    /// Adaptive strict freshness cap in effect when the snapshot was built.
    pub book_strict_cap_ms: f64,
    pub tech: AssetTech,
    pub derivs: DerivsView,
    pub flow: Option<FlowView>,
    /// Short-horizon direction hints for the other three assets.
    pub cross_hints: Vec<(Asset, Option<Side>)>,
    /// Leader-asset momentum probability (BTC lead for altcoins).
    pub btc_lead_prob: f64,
}

impl RoundSnapshot {
    pub fn book_for(&self, side: Side) -> Option<&BookView> {
        match side {
            Side::Up => self.book_up.as_ref(),
            Side::Down => self.book_down.as_ref(),
        }
    }

    /// Decision-price arbitration:
    /// fresh oracle → fresh price-stream quote → freshest available, tagged
    /// stale. Returns `(price, source, quote_age_ms)`.
    pub fn decision_price(&self, cfg: &FeedConfig) -> Option<(f64, DecisionSource, f64)> {
        let oracle_fresh = self
            .oracle_age_s
            .map(|a| a <= cfg.oracle_fresh_s)
            .unwrap_or(false);
        if oracle_fresh {
            if let Some(p) = self.oracle_price.filter(|p| *p > 0.0) {
                // The oracle resolves the market; quote staleness is moot.
                return Some((p, DecisionSource::Oracle, 0.0));
            }
        }
        if let Some(q) = self.quote.filter(|q| q.price > 0.0) {
            if q.age_ms <= cfg.quote_fresh_ms {
                return Some((q.price, DecisionSource::PriceWs, q.age_ms));
            }
        }
        if let Some(p) = self.oracle_price.filter(|p| *p > 0.0) {
            return Some((p, DecisionSource::OracleStale, 0.0));
        }
        if let Some(q) = self.quote.filter(|q| q.price > 0.0) {
            return Some((q.price, DecisionSource::PriceWsStale, q.age_ms));
        }
        None
    }
}

/// Copy-on-write snapshot map keyed by cid. Writers publish whole new maps;
/// readers are wait-free.
pub struct SnapshotStore {
    map: ArcSwap<HashMap<String, Arc<RoundSnapshot>>>,
}

impl SnapshotStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            map: ArcSwap::from_pointee(HashMap::new()),
        })
    }

    pub fn get(&self, cid: &str) -> Option<Arc<RoundSnapshot>> {
        self.map.load().get(cid).cloned()
    }

    pub fn all(&self) -> Vec<Arc<RoundSnapshot>> {
        self.map.load().values().cloned().collect()
    }

    pub fn publish(&self, snapshots: Vec<RoundSnapshot>) {
        let mut next = HashMap::with_capacity(snapshots.len());
        for s in snapshots {
            next.insert(s.round.cid.clone(), Arc::new(s));
        }
        self.map.store(Arc::new(next));
    }
}

/// Builds snapshots from the live feeds.
pub struct SnapshotBuilder {
    pub catalog: Arc<MarketCatalog>,
    pub prices: Arc<PriceFeed>,
    pub oracle: Arc<OracleFeed>,
    pub books: Arc<BookCache>,
    pub derivs: Arc<DerivsFeed>,
    pub copyflow: Arc<CopyFlow>,
    pub feed_cfg: FeedConfig,
}

impl SnapshotBuilder {
    pub fn build(&self, round: &Round, now_ts: i64) -> RoundSnapshot {
        let asset = round.asset;
        let quote = self
            .prices
            .latest(asset)
            .map(|(price, age_ms)| Quote { price, age_ms });
        let oracle_obs = self.oracle.latest(asset);
        let oracle_age_s = self.oracle.age_s(asset, now_ts);

        let open = self.catalog.open_price(&round.cid);
        let strict_cap = self.books.adaptive_strict_cap_ms(
            self.feed_cfg.book_strict_age_ms_min,
            self.feed_cfg.book_strict_age_ms_max,
        );

        let cross_hints = Asset::ALL
            .iter()
            .copied()
            .filter(|a| *a != asset)
            .map(|a| (a, self.prices.direction_hint(a, 0.55, 0.45)))
            .collect();

        RoundSnapshot {
            now_ts,
            quote,
            oracle_price: oracle_obs.map(|o| o.price),
            oracle_age_s,
            open_price: open.as_ref().map(|o| o.price),
            open_source: open
                .as_ref()
                .map(|o| o.source)
                .unwrap_or(OpenPriceSource::Unknown),
            prev_open: self.catalog.prev_open(asset, round.duration),
            book_up: self
                .books
                .get(&round.token_up, self.feed_cfg.book_soft_age_ms),
            book_down: self
                .books
                .get(&round.token_down, self.feed_cfg.book_soft_age_ms),
            book_strict_cap_ms: strict_cap,
            tech: self.prices.tech(asset),
            derivs: self.derivs.view(asset, round.start_ts, now_ts),
            flow: self.copyflow.get(&round.cid),
            cross_hints,
            btc_lead_prob: self.prices.lead_prob(Asset::Btc),
            round: round.clone(),
        }
    }

    /// Supervised loop body: publish fresh snapshots for all active rounds.
    pub async fn run_publish_loop(
        self: Arc<Self>,
        store: Arc<SnapshotStore>,
        interval: Duration,
    ) -> anyhow::Result<()> {
        loop {
            let now_ts = chrono::Utc::now().timestamp();
            let rounds = self.catalog.active_rounds(now_ts);
            let snapshots: Vec<RoundSnapshot> =
                rounds.iter().map(|r| self.build(r, now_ts)).collect();
            if !snapshots.is_empty() {
                debug!(n = snapshots.len(), "snapshots published");
            }
            store.publish(snapshots);
            tokio::time::sleep(interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RoundDuration;

    fn base_snapshot() -> RoundSnapshot {
        RoundSnapshot {
            round: Round {
                cid: "c".into(),
                asset: Asset::Btc,
                duration: RoundDuration::M15,
                start_ts: 0,
                end_ts: 900,
                question: "q".into(),
                token_up: "u".into(),
                token_down: "d".into(),
                up_price: 0.5,
            },
            now_ts: 450,
            quote: None,
            oracle_price: None,
            oracle_age_s: None,
            open_price: Some(60_000.0),
            open_source: OpenPriceSource::OracleExact,
            prev_open: None,
            book_up: None,
            book_down: None,
            book_strict_cap_ms: 2_000.0,
            tech: AssetTech::neutral(Asset::Btc),
            derivs: DerivsView::neutral(),
            flow: None,
            cross_hints: vec![],
            btc_lead_prob: 0.5,
        }
    }

    fn feed_cfg() -> FeedConfig {
        FeedConfig {
            oracle_fresh_s: 15.0,
            quote_fresh_ms: 2_500.0,
            oracle_age_warn_s: 45.0,
            oracle_age_max_skip_s: 90.0,
            oracle_poll_ms: 1_500,
            book_strict_age_ms_min: 900.0,
            book_strict_age_ms_max: 4_000.0,
            book_soft_age_ms: 8_000.0,
            book_rest_fresh_ms: 1_800.0,
            book_fallback_age_ms: 5_000.0,
            price_history_len: 300,
            stale_ticks_reconnect: 4,
            ws_idle_timeout_s: 30,
            reconnect_backoff_cap_s: 60,
            copyflow_refresh_s: 6,
            copyflow_live_max_age_s: 25.0,
            copyflow_fallback_max_age_s: 120.0,
            copyflow_ondemand_cooldown_s: 8.0,
            ofi_window_s: 20,
            derivs_poll_s: 10,
        }
    }

    #[test]
    fn fresh_oracle_wins_arbitration() {
        let mut s = base_snapshot();
        s.oracle_price = Some(60_100.0);
        s.oracle_age_s = Some(3.0);
        s.quote = Some(Quote {
            price: 60_200.0,
            age_ms: 100.0,
        });
        let (p, src, age) = s.decision_price(&feed_cfg()).unwrap();
        assert_eq!(src, DecisionSource::Oracle);
        assert!((p - 60_100.0).abs() < 1e-9);
        assert_eq!(age, 0.0);
    }

    #[test]
    fn fresh_quote_beats_stale_oracle() {
        let mut s = base_snapshot();
        s.oracle_price = Some(60_100.0);
        s.oracle_age_s = Some(40.0);
        s.quote = Some(Quote {
            price: 60_200.0,
            age_ms: 500.0,
        });
        let (p, src, _) = s.decision_price(&feed_cfg()).unwrap();
        assert_eq!(src, DecisionSource::PriceWs);
        assert!((p - 60_200.0).abs() < 1e-9);
    }

    #[test]
    fn stale_sources_are_tagged() {
        let mut s = base_snapshot();
        s.oracle_price = Some(60_100.0);
        s.oracle_age_s = Some(120.0);
        s.quote = Some(Quote {
            price: 60_200.0,
            age_ms: 60_000.0,
        });
        let (_, src, _) = s.decision_price(&feed_cfg()).unwrap();
        assert!(src.is_stale());
        assert_eq!(src, DecisionSource::OracleStale);

        s.oracle_price = None;
        let (_, src2, _) = s.decision_price(&feed_cfg()).unwrap();
        assert_eq!(src2, DecisionSource::PriceWsStale);

        s.quote = None;
        assert!(s.decision_price(&feed_cfg()).is_none());
    }

    #[test]
    fn store_publish_is_atomic_per_map() {
        let store = SnapshotStore::new();
        store.publish(vec![base_snapshot()]);
        assert!(store.get("c").is_some());
        store.publish(vec![]);
        assert!(store.get("c").is_none());
    }
}
