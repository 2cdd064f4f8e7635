//! Portfolio reconciler — the single authority on open exposure.
//!
//! Every cycle it re-derives truth from the chain and the positions
//! indexer, merges in local fills still inside their grace window, and
//! publishes an immutable copy-on-write view for the scorer and
//! diagnostics. Exposure gates run against that view before any candidate
//! signal becomes an order.

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::RiskConfig;
use crate::feeds::price::PriceFeed;
use crate::http::HttpService;
use crate::markets::MarketCatalog;
use crate::models::{Asset, Position, Round, RoundDuration, Side, Signal, SkipReason};
use crate::persist::StateStore;
use crate::settlement::chain::ChainClient;

/// In-flight notional reserved by the execution engine; subtracted from the
/// bankroll the sizer sees so concurrent entries cannot double-spend.
#[derive(Default)]
pub struct ReservedBankroll {
    amount: Mutex<f64>,
}

impl ReservedBankroll {
    pub fn reserve(&self, usdc: f64) {
        let mut a = self.amount.lock();
        *a += usdc.max(0.0);
    }

    pub fn release(&self, usdc: f64) {
        let mut a = self.amount.lock();
        *a = (*a - usdc.max(0.0)).max(0.0);
    }

    pub fn amount(&self) -> f64 {
        *self.amount.lock()
    }
}

/// A redeemable balance the settlement manager should claim.
#[derive(Debug, Clone)]
pub struct SettlingClaim {
    pub cid: String,
    pub side: Side,
    pub claim_value_usdc: f64,
}

#[derive(Debug, Clone, Default)]
pub struct PortfolioView {
    pub updated_ts: i64,
    pub wallet_usdc: f64,
    pub open_stake_total: f64,
    pub open_mark_value: f64,
    pub settling_claim_total: f64,
    pub total_equity: f64,
    pub baseline_equity: Option<f64>,
    pub drawdown_pct: f64,
    pub choppy_regime: bool,
    pub reserved_usdc: f64,
    /// Open positions keyed by cid (on-chain truth + graced local fills).
    pub positions: HashMap<String, Position>,
    /// Redeemable claims awaiting settlement.
    pub settling: Vec<SettlingClaim>,
}

impl PortfolioView {
    /// Capital available to the sizer right now.
    pub fn bankroll(&self) -> f64 {
        (self.wallet_usdc - self.reserved_usdc).max(0.0)
    }

    pub fn side_stake(&self, side: Side) -> f64 {
        self.positions
            .values()
            .filter(|p| p.side == side)
            .map(|p| p.cost_usdc)
            .sum()
    }

    pub fn stake_on_cid(&self, cid: &str) -> f64 {
        self.positions.get(cid).map(|p| p.cost_usdc).unwrap_or(0.0)
    }

    /// Legs already open in the same round: `(total, same_side)`.
    pub fn same_round_legs(&self, fingerprint: &str, side: Side) -> (u32, u32) {
        let mut total = 0;
        let mut same = 0;
        for p in self.positions.values() {
            if p.round_key().fingerprint() == fingerprint {
                total += 1;
                if p.side == side {
                    same += 1;
                }
            }
        }
        (total, same)
    }

    pub fn roi(&self) -> Option<f64> {
        let base = self.baseline_equity?;
        if base <= 0.0 {
            return None;
        }
        Some((self.total_equity - base) / base)
    }
}

/// Exposure gates, in rejection-priority order. Pure function of the view.
pub fn enforce_exposure(
    view: &PortfolioView,
    signal: &Signal,
    round: &Round,
    cfg: &RiskConfig,
) -> Result<(), SkipReason> {
    let fingerprint = round.fingerprint();

    // Opposite sides of the same round are never held simultaneously,
    // whether keyed by exact cid or by round fingerprint.
    for p in view.positions.values() {
        let same_round = p.cid == signal.cid || p.round_key().fingerprint() == fingerprint;
        if same_round && p.side != signal.side {
            return Err(SkipReason::OppositeSideSameRound);
        }
    }

    let is_add_on = view.positions.contains_key(&signal.cid);
    if !is_add_on && view.positions.len() >= cfg.max_open_positions {
        return Err(SkipReason::MaxOpenPositions);
    }

    let equity_base = view.total_equity.max(1e-9);
    let side_cap = if view.choppy_regime {
        cfg.side_cap_pct_choppy
    } else {
        cfg.side_cap_pct
    };
    if (view.side_stake(signal.side) + signal.notional_usdc) / equity_base > side_cap {
        return Err(SkipReason::SideCapExceeded);
    }
    if (view.stake_on_cid(&signal.cid) + signal.notional_usdc) / equity_base > cfg.cid_cap_pct {
        return Err(SkipReason::CidCapExceeded);
    }
    if signal.notional_usdc > view.bankroll() {
        return Err(SkipReason::InsufficientBankroll);
    }
    Ok(())
}

struct LocalPending {
    position: Position,
    filled_ts: i64,
    absent_cycles: u32,
}

pub struct Reconciler {
    http: Arc<HttpService>,
    chain: Arc<ChainClient>,
    catalog: Arc<MarketCatalog>,
    prices: Arc<PriceFeed>,
    store: Arc<StateStore>,
    reserved: Arc<ReservedBankroll>,
    cfg: RiskConfig,
    data_api_url: String,
    markets_rest_url: String,
    wallet: String,
    view: ArcSwap<PortfolioView>,
    local_pending: RwLock<HashMap<String, LocalPending>>,
    high_water: Mutex<f64>,
}

impl Reconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        http: Arc<HttpService>,
        chain: Arc<ChainClient>,
        catalog: Arc<MarketCatalog>,
        prices: Arc<PriceFeed>,
        store: Arc<StateStore>,
        reserved: Arc<ReservedBankroll>,
        cfg: RiskConfig,
        data_api_url: String,
        markets_rest_url: String,
        wallet: String,
    ) -> Arc<Self> {
        Arc::new(Self {
            http,
            chain,
            catalog,
            prices,
            store,
            reserved,
            cfg,
            data_api_url,
            markets_rest_url,
            wallet,
            view: ArcSwap::from_pointee(PortfolioView::default()),
            local_pending: RwLock::new(HashMap::new()),
            high_water: Mutex::new(0.0),
        })
    }

    pub fn view(&self) -> Arc<PortfolioView> {
        self.view.load_full()
    }

    /// Execution reports a confirmed local fill; it stays authoritative
    /// until the indexer shows it (or the prune grace expires).
    pub fn record_local_fill(&self, position: Position, now_ts: i64) {
        let mut pending = self.local_pending.write();
        match pending.get_mut(&position.cid) {
            Some(existing) => {
                existing.position.shares += position.shares;
                existing.position.cost_usdc += position.cost_usdc;
                existing.position.add_on_count += 1;
                existing.filled_ts = now_ts;
                existing.absent_cycles = 0;
            }
            None => {
                pending.insert(
                    position.cid.clone(),
                    LocalPending {
                        position,
                        filled_ts: now_ts,
                        absent_cycles: 0,
                    },
                );
            }
        }
    }

    /// Round metadata for an indexer row, from the catalog cache first and
    /// the markets API as fallback. Successful lookups repopulate the
    /// catalog so restarts stay cheap.
    async fn round_meta(&self, cid: &str) -> Option<Round> {
        if let Some(r) = self.catalog.get(cid) {
            return Some(r);
        }
        let url = format!("{}/markets", self.markets_rest_url);
        let data = self
            .http
            .get_json(
                &url,
                &[("condition_ids", cid.to_string())],
                Some(Duration::from_secs(30)),
                None,
            )
            .await
            .ok()?;
        let rows = match &data {
            Value::Array(rows) => rows.clone(),
            other => vec![other.clone()],
        };
        let round = rows.iter().find_map(crate::markets::parse_market_row)?;
        self.catalog.upsert(round.clone());
        Some(round)
    }

    async fn fetch_position_rows(&self) -> Result<Vec<Value>> {
        let url = format!("{}/positions", self.data_api_url);
        let data = self
            .http
            .get_json(
                &url,
                &[("user", self.wallet.clone()), ("limit", "200".to_string())],
                Some(Duration::from_millis(900)),
                None,
            )
            .await
            .context("positions fetch failed")?;
        Ok(data.as_array().cloned().unwrap_or_default())
    }

    /// One reconcile pass. Factored out of the loop for tests.
    pub async fn reconcile_once(&self, now_ts: i64) -> Result<()> {
        let wallet_usdc = self
            .chain
            .collateral_balance()
            .await
            .context("wallet balance fetch failed")?;

        let rows = self.fetch_position_rows().await?;
        let mut open: HashMap<String, Position> = HashMap::new();
        let mut settling: Vec<SettlingClaim> = Vec::new();
        let mut open_mark_value = 0.0;
        let mut settling_total = 0.0;

        for row in &rows {
            let Some(cid) = row
                .get("conditionId")
                .or_else(|| row.get("condition_id"))
                .and_then(Value::as_str)
            else {
                continue;
            };
            let Some(side) = row
                .get("outcome")
                .and_then(Value::as_str)
                .and_then(Side::parse)
            else {
                continue;
            };
            let shares = field_f64(row, "size").unwrap_or(0.0);
            let avg_price = field_f64(row, "avgPrice").unwrap_or(0.0);
            let value_now = field_f64(row, "currentValue").unwrap_or(0.0);
            let redeemable = row
                .get("redeemable")
                .and_then(Value::as_bool)
                .unwrap_or(false);

            if redeemable {
                if value_now > self.cfg.presence_threshold_usdc {
                    settling_total += value_now;
                    settling.push(SettlingClaim {
                        cid: cid.to_string(),
                        side,
                        claim_value_usdc: value_now,
                    });
                }
                // Redeemable with zero value: expired worthless, drop.
                continue;
            }
            if shares <= 0.0 && value_now <= self.cfg.presence_threshold_usdc {
                continue;
            }

            let meta = self.round_meta(cid).await;
            let (asset, duration, start_ts, end_ts) = match &meta {
                Some(r) => (r.asset, r.duration, r.start_ts, r.end_ts),
                None => {
                    // Metadata gap: keep exposure visible under conservative
                    // defaults rather than dropping it.
                    warn!(cid = %cid, "no round metadata for open position");
                    (Asset::Btc, RoundDuration::M15, 0, 0)
                }
            };

            open_mark_value += value_now;
            open.insert(
                cid.to_string(),
                Position {
                    cid: cid.to_string(),
                    asset,
                    duration,
                    side,
                    shares,
                    cost_usdc: shares * avg_price,
                    value_now_usdc: value_now,
                    avg_price,
                    opened_ts: now_ts,
                    start_ts,
                    end_ts,
                    add_on_count: 0,
                    core_position: true,
                },
            );
        }

        // Merge local fills the indexer has not reported yet; prune entries
        // absent for `prune_absent_cycles` consecutive cycles after grace.
        {
            let mut pending = self.local_pending.write();
            pending.retain(|cid, lp| {
                if open.contains_key(cid) {
                    return false; // confirmed on-chain, local copy done
                }
                let in_grace = now_ts - lp.filled_ts < self.cfg.prune_min_grace_s;
                if in_grace {
                    lp.absent_cycles = 0;
                } else {
                    lp.absent_cycles += 1;
                    if lp.absent_cycles >= self.cfg.prune_absent_cycles {
                        info!(cid = %cid, "pruning ghost local fill");
                        return false;
                    }
                }
                true
            });
            for (cid, lp) in pending.iter() {
                open_mark_value += lp.position.value_now_usdc;
                open.insert(cid.clone(), lp.position.clone());
            }
        }

        let open_stake_total: f64 = open.values().map(|p| p.cost_usdc).sum();
        let total_equity = wallet_usdc + open_mark_value + settling_total;

        // P&L baseline locks on the first successful snapshot and persists.
        let baseline = match self.store.load_baseline() {
            Some(b) => Some(b),
            None => {
                self.store.save_baseline(total_equity)?;
                info!(baseline = total_equity, "P&L baseline locked");
                Some(total_equity)
            }
        };

        let drawdown_pct = {
            let mut hw = self.high_water.lock();
            if total_equity > *hw {
                *hw = total_equity;
            }
            if *hw > 0.0 {
                ((*hw - total_equity) / *hw).max(0.0)
            } else {
                0.0
            }
        };

        // Choppy regime: mean-reverting variance ratio across majors.
        let choppy = {
            let vr_btc = self.prices.tech(Asset::Btc).variance_ratio;
            let vr_eth = self.prices.tech(Asset::Eth).variance_ratio;
            (vr_btc + vr_eth) / 2.0 < 0.90
        };

        let next = PortfolioView {
            updated_ts: now_ts,
            wallet_usdc,
            open_stake_total,
            open_mark_value,
            settling_claim_total: settling_total,
            total_equity,
            baseline_equity: baseline,
            drawdown_pct,
            choppy_regime: choppy,
            reserved_usdc: self.reserved.amount(),
            positions: open,
            settling,
        };
        debug!(
            wallet = next.wallet_usdc,
            open = next.open_stake_total,
            settling = next.settling_claim_total,
            equity = next.total_equity,
            "portfolio reconciled"
        );
        self.view.store(Arc::new(next));
        Ok(())
    }

    /// Supervised loop body.
    pub async fn run_loop(self: Arc<Self>, interval: Duration) -> Result<()> {
        loop {
            let now_ts = chrono::Utc::now().timestamp();
            if let Err(e) = self.reconcile_once(now_ts).await {
                warn!(error = %format!("{e:#}"), "reconcile cycle failed");
            }
            tokio::time::sleep(interval).await;
        }
    }
}

fn field_f64(v: &Value, key: &str) -> Option<f64> {
    match v.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ExecutionMode, OpenPriceSource, DecisionSource, SignalTier};

    fn view_with_position(side: Side, cost: f64) -> PortfolioView {
        let mut positions = HashMap::new();
        positions.insert(
            "cid1".to_string(),
            Position {
                cid: "cid1".into(),
                asset: Asset::Btc,
                duration: RoundDuration::M15,
                side,
                shares: cost / 0.5,
                cost_usdc: cost,
                value_now_usdc: cost,
                avg_price: 0.5,
                opened_ts: 0,
                start_ts: 1_700_000_100,
                end_ts: 1_700_001_000,
                add_on_count: 0,
                core_position: true,
            },
        );
        PortfolioView {
            updated_ts: 0,
            wallet_usdc: 500.0,
            open_stake_total: cost,
            open_mark_value: cost,
            settling_claim_total: 0.0,
            total_equity: 500.0 + cost,
            baseline_equity: Some(500.0),
            drawdown_pct: 0.0,
            choppy_regime: false,
            reserved_usdc: 0.0,
            positions,
            settling: vec![],
        }
    }

    fn round() -> Round {
        Round {
            cid: "cid1".into(),
            asset: Asset::Btc,
            duration: RoundDuration::M15,
            start_ts: 1_700_000_100,
            end_ts: 1_700_001_000,
            question: "q".into(),
            token_up: "u".into(),
            token_down: "d".into(),
            up_price: 0.5,
        }
    }

    fn signal(cid: &str, side: Side, notional: f64) -> Signal {
        Signal {
            cid: cid.into(),
            asset: Asset::Btc,
            duration: RoundDuration::M15,
            side,
            token_id: "t".into(),
            score: 12,
            true_prob: 0.62,
            edge: 0.08,
            entry: 0.54,
            notional_usdc: notional,
            mode: ExecutionMode::Maker,
            tier: SignalTier::TierB,
            source: "test".into(),
            ev_net: 0.06,
            execution_ev: 0.05,
            payout_mult: 1.85,
            min_payout_req: 1.72,
            max_entry_allowed: 0.56,
            min_entry_allowed: 0.01,
            analysis_quality: 0.8,
            analysis_conviction: 0.6,
            open_price: 60_000.0,
            open_price_source: OpenPriceSource::Indexer,
            decision_price: 60_100.0,
            decision_source: DecisionSource::Oracle,
            oracle_age_s: Some(3.0),
            oracle_agrees: true,
            mins_left: 7.0,
            booster: false,
            contrarian_tail: false,
            reasons: vec![],
        }
    }

    #[test]
    fn opposite_side_same_round_is_blocked() {
        let view = view_with_position(Side::Up, 20.0);
        let cfg = test_risk_cfg();
        let err = enforce_exposure(&view, &signal("cid1", Side::Down, 5.0), &round(), &cfg)
            .unwrap_err();
        assert_eq!(err, SkipReason::OppositeSideSameRound);

        // Same fingerprint under a different cid is still blocked.
        let mut r2 = round();
        r2.cid = "cid2".into();
        let err2 = enforce_exposure(&view, &signal("cid2", Side::Down, 5.0), &r2, &cfg)
            .unwrap_err();
        assert_eq!(err2, SkipReason::OppositeSideSameRound);

        // Same side passes.
        assert!(enforce_exposure(&view, &signal("cid1", Side::Up, 5.0), &round(), &cfg).is_ok());
    }

    fn test_risk_cfg() -> RiskConfig {
        RiskConfig {
            reconcile_interval: Duration::from_secs(2),
            max_open_positions: 10,
            side_cap_pct: 0.22,
            side_cap_pct_choppy: 0.14,
            cid_cap_pct: 0.06,
            presence_threshold_usdc: 0.25,
            prune_absent_cycles: 3,
            prune_min_grace_s: 90,
        }
    }

    #[test]
    fn caps_enforced_in_order() {
        let mut view = view_with_position(Side::Up, 100.0);
        let cfg = test_risk_cfg();

        // Side cap: 100 existing + 40 new on 600 equity > 22%.
        let err = enforce_exposure(&view, &signal("cid9", Side::Up, 40.0), &other_round("cid9"), &cfg)
            .unwrap_err();
        assert_eq!(err, SkipReason::SideCapExceeded);

        // Choppy regime tightens the cap further.
        view.choppy_regime = true;
        let err = enforce_exposure(&view, &signal("cid9", Side::Up, 1.0), &other_round("cid9"), &cfg)
            .unwrap_err();
        assert_eq!(err, SkipReason::SideCapExceeded);
    }

    fn other_round(cid: &str) -> Round {
        let mut r = round();
        r.cid = cid.into();
        r.start_ts = 1_700_002_000;
        r.end_ts = 1_700_002_900;
        r
    }

    #[test]
    fn cid_cap_and_bankroll_checks() {
        let view = view_with_position(Side::Up, 10.0);
        let cfg = test_risk_cfg();
        // cid cap: 10 + 25 on cid1 over 510 equity > 6%.
        let err = enforce_exposure(&view, &signal("cid1", Side::Up, 25.0), &round(), &cfg)
            .unwrap_err();
        assert_eq!(err, SkipReason::CidCapExceeded);

        // Insufficient bankroll once reserved eats the wallet.
        let mut broke = view_with_position(Side::Up, 10.0);
        broke.reserved_usdc = 499.0;
        let err = enforce_exposure(&broke, &signal("cid3", Side::Up, 5.0), &other_round("cid3"), &cfg)
            .unwrap_err();
        assert_eq!(err, SkipReason::InsufficientBankroll);
    }

    #[test]
    fn max_open_positions_allows_add_ons() {
        let mut view = view_with_position(Side::Up, 5.0);
        let mut cfg = test_risk_cfg();
        cfg.max_open_positions = 1;
        // New cid blocked.
        let err = enforce_exposure(&view, &signal("cid7", Side::Up, 2.0), &other_round("cid7"), &cfg)
            .unwrap_err();
        assert_eq!(err, SkipReason::MaxOpenPositions);
        // Add-on to the existing cid allowed.
        assert!(enforce_exposure(&view, &signal("cid1", Side::Up, 2.0), &round(), &cfg).is_ok());
        view.positions.clear();
        assert!(
            enforce_exposure(&view, &signal("cid7", Side::Up, 2.0), &other_round("cid7"), &cfg)
                .is_ok()
        );
    }

    #[test]
    fn equity_identity_holds() {
        let view = view_with_position(Side::Up, 42.0);
        let lhs = view.wallet_usdc + view.open_mark_value + view.settling_claim_total;
        assert!((lhs - view.total_equity).abs() < 1e-9);
    }

    #[test]
    fn reserved_bankroll_is_subtracted() {
        let r = ReservedBankroll::default();
        r.reserve(30.0);
        r.reserve(12.5);
        assert!((r.amount() - 42.5).abs() < 1e-9);
        r.release(30.0);
        assert!((r.amount() - 12.5).abs() < 1e-9);
        r.release(100.0);
        assert_eq!(r.amount(), 0.0);
    }
}
