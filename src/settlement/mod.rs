//! Settlement manager.
//!
//! Three cooperating loops: discovery (reconciled redeemable claims →
//! redemption queue), the executor (preflight → EIP-1559 submit with the
//! serialized nonce → receipt → realized-P&L attribution), and a backfill
//! sweep over historical activity for claims the main path missed. The
//! finalized-CID cache is persisted so restarts never double-count wins.

pub mod chain;
pub mod nonce;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::http::HttpService;
use crate::journal::{EventKind, JournalRow, MetricsJournal};
use crate::models::{RedeemStage, RedemptionTask, Side};
use crate::persist::StateStore;
use crate::portfolio::Reconciler;
use crate::stats::{StatsEngine, TradeOutcome};
use chain::{ChainClient, PayoutState};

pub struct SettlementManager {
    cfg: Arc<Config>,
    chain: Arc<ChainClient>,
    reconciler: Arc<Reconciler>,
    journal: Arc<MetricsJournal>,
    stats: Arc<parking_lot::RwLock<StatsEngine>>,
    store: Arc<StateStore>,
    http: Arc<HttpService>,
    queue: Mutex<VecDeque<RedemptionTask>>,
    queued: Mutex<HashSet<String>>,
    finalized: Mutex<HashMap<String, i64>>,
    backfill_cids: Mutex<HashSet<String>>,
    /// Entry metadata for P&L attribution, persisted across restarts.
    entry_meta: Mutex<HashMap<String, TradeOutcome>>,
    /// One in-flight redeem submission at a time, independent of the nonce
    /// manager's own serialization.
    submit_lock: tokio::sync::Mutex<()>,
}

impl SettlementManager {
    pub fn new(
        cfg: Arc<Config>,
        chain: Arc<ChainClient>,
        reconciler: Arc<Reconciler>,
        journal: Arc<MetricsJournal>,
        stats: Arc<parking_lot::RwLock<StatsEngine>>,
        store: Arc<StateStore>,
        http: Arc<HttpService>,
    ) -> Arc<Self> {
        let now_ts = chrono::Utc::now().timestamp();
        let finalized = store.load_settled(cfg.settlement.settled_retention_s, now_ts);
        let entry_meta = store.load_entry_meta();
        Arc::new(Self {
            cfg,
            chain,
            reconciler,
            journal,
            stats,
            store,
            http,
            queue: Mutex::new(VecDeque::new()),
            queued: Mutex::new(HashSet::new()),
            finalized: Mutex::new(finalized),
            backfill_cids: Mutex::new(HashSet::new()),
            entry_meta: Mutex::new(entry_meta),
            submit_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// The scan loop registers entry metadata at fill time so settlement
    /// can attribute realized P&L into the right bucket later. Add-on fills
    /// on the same condition accumulate stake under the original entry.
    pub fn note_entry(&self, outcome: TradeOutcome) {
        let mut meta = self.entry_meta.lock();
        match meta.get_mut(&outcome.cid) {
            Some(existing) if existing.side == outcome.side => {
                existing.stake += outcome.stake;
                existing.ts = outcome.ts;
            }
            _ => {
                meta.insert(outcome.cid.clone(), outcome);
            }
        }
        if let Err(e) = self.store.save_entry_meta(&meta) {
            warn!(error = %format!("{e:#}"), "entry meta persist failed");
        }
    }

    pub fn is_finalized(&self, cid: &str) -> bool {
        self.finalized.lock().contains_key(cid)
    }

    fn enqueue(&self, task: RedemptionTask, backfill: bool) {
        let mut queued = self.queued.lock();
        if queued.contains(&task.cid) || self.is_finalized(&task.cid) {
            return;
        }
        queued.insert(task.cid.clone());
        if backfill {
            self.backfill_cids.lock().insert(task.cid.clone());
        }
        let mut row = JournalRow::new(task.queued_ts, EventKind::QueueRedeem, task.cid.clone());
        row.side = Some(task.winning_side);
        row.size_usdc = Some(task.claim_value_usdc);
        self.journal.emit(&row);
        info!(
            cid = %task.cid,
            side = %task.winning_side,
            claim = task.claim_value_usdc,
            backfill,
            "redemption queued"
        );
        self.queue.lock().push_back(task);
    }

    fn mark_finalized(&self, cid: &str, now_ts: i64) {
        let mut finalized = self.finalized.lock();
        finalized.insert(cid.to_string(), now_ts);
        finalized.retain(|_, ts| now_ts - *ts <= self.cfg.settlement.settled_retention_s);
        if let Err(e) = self.store.save_settled(&finalized) {
            warn!(error = %format!("{e:#}"), "settled cache persist failed");
        }
        self.queued.lock().remove(cid);
    }

    /// Supervised loop body: move reconciled redeemable claims into the
    /// redemption queue.
    pub async fn run_discovery(self: Arc<Self>) -> Result<()> {
        loop {
            let now_ts = chrono::Utc::now().timestamp();
            let view = self.reconciler.view();
            for claim in &view.settling {
                if claim.claim_value_usdc <= self.cfg.settlement.dust_usdc {
                    continue;
                }
                self.enqueue(
                    RedemptionTask::new(
                        claim.cid.clone(),
                        claim.side,
                        claim.claim_value_usdc,
                        now_ts,
                    ),
                    false,
                );
            }
            tokio::time::sleep(Duration::from_secs(self.cfg.settlement.scan_interval_s)).await;
        }
    }

    /// Supervised loop body: drain the queue one task at a time.
    pub async fn run_executor(self: Arc<Self>) -> Result<()> {
        loop {
            let task = self.queue.lock().pop_front();
            let Some(task) = task else {
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            };
            if let Err(e) = self.process_task(task).await {
                warn!(error = %format!("{e:#}"), "redemption task errored");
            }
        }
    }

    async fn process_task(&self, mut task: RedemptionTask) -> Result<()> {
        let now_ts = chrono::Utc::now().timestamp();

        // Preflight: a revert means not claimable yet (or never).
        if let Err(e) = self
            .chain
            .preflight_redeem(&task.cid, task.winning_side)
            .await
        {
            task.verify_attempts += 1;
            if task.verify_attempts >= self.cfg.settlement.max_verify_attempts {
                warn!(
                    cid = %task.cid,
                    attempts = task.verify_attempts,
                    "redemption never became claimable, closing task"
                );
                self.queued.lock().remove(&task.cid);
                return Ok(());
            }
            debug!(cid = %task.cid, error = %format!("{e:#}"), "preflight revert, requeueing");
            self.queue.lock().push_back(task);
            tokio::time::sleep(Duration::from_secs(2)).await;
            return Ok(());
        }
        task.stage = RedeemStage::PreflightOk;

        if !self.chain.can_sign() || self.cfg.dry_run {
            info!(cid = %task.cid, "dry run: skipping redemption submit");
            self.mark_finalized(&task.cid, now_ts);
            return Ok(());
        }

        // Serialized submission path.
        let receipt = {
            let _submit = self.submit_lock.lock().await;
            let tx_hash = self
                .chain
                .submit_redeem(
                    &task.cid,
                    task.winning_side,
                    self.cfg.settlement.gas_limit,
                    self.cfg.settlement.priority_fee_gwei,
                )
                .await;
            let tx_hash = match tx_hash {
                Ok(h) => h,
                Err(e) => {
                    return self.retry_or_fail(task, format!("submit failed: {e:#}")).await;
                }
            };
            task.stage = RedeemStage::TxSubmitted;
            task.tx_hash = Some(format!("{tx_hash:#x}"));

            match self
                .chain
                .wait_receipt(
                    tx_hash,
                    Duration::from_secs(self.cfg.settlement.receipt_timeout_s),
                )
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    return self.retry_or_fail(task, format!("receipt wait failed: {e:#}")).await;
                }
            }
        };

        if !receipt.status() {
            return self.retry_or_fail(task, "receipt status != 1".to_string()).await;
        }
        task.stage = RedeemStage::TxConfirmed;

        // Realized proceeds from the collateral Transfer back to the wallet.
        let realized = self.chain.realized_credit(&receipt);
        self.finalize(task, realized, now_ts);
        Ok(())
    }

    async fn retry_or_fail(&self, mut task: RedemptionTask, reason: String) -> Result<()> {
        task.submit_attempts += 1;
        if task.submit_attempts >= self.cfg.settlement.max_submit_attempts {
            warn!(cid = %task.cid, reason = %reason, "redemption abandoned after retries");
            self.queued.lock().remove(&task.cid);
            return Ok(());
        }
        let backoff = Duration::from_secs(2u64.saturating_pow(task.submit_attempts.min(5)));
        warn!(
            cid = %task.cid,
            attempt = task.submit_attempts,
            reason = %reason,
            backoff_s = backoff.as_secs(),
            "redemption retry scheduled"
        );
        tokio::time::sleep(backoff).await;
        self.queue.lock().push_back(task);
        Ok(())
    }

    fn finalize(&self, mut task: RedemptionTask, realized_usdc: f64, now_ts: i64) {
        task.stage = RedeemStage::Finalized;
        let is_backfill = self.backfill_cids.lock().remove(&task.cid);

        let meta = self.entry_meta.lock().get(&task.cid).cloned();
        let (pnl, stake) = match &meta {
            Some(m) => (realized_usdc - m.stake, m.stake),
            None => (realized_usdc, 0.0),
        };

        let mut row = JournalRow::new(
            now_ts,
            if is_backfill {
                EventKind::ResolveBackfill
            } else {
                EventKind::Resolve
            },
            task.cid.clone(),
        );
        row.side = Some(task.winning_side);
        row.pnl = Some(pnl);
        row.size_usdc = Some(stake);
        row.result = Some(if pnl >= 0.0 { "WIN" } else { "LOSS" }.into());
        row.tx_hash = task.tx_hash.clone();
        if let Some(m) = &meta {
            row.asset = Some(m.asset);
            row.duration = Some(m.duration);
            row.score = Some(m.score);
            row.entry_price = Some(m.entry);
        }
        self.journal.emit(&row);

        // Feed every adaptive layer and persist.
        if let Some(mut outcome) = meta {
            outcome.ts = now_ts;
            outcome.pnl = pnl;
            outcome.win = pnl >= 0.0;
            let mut stats = self.stats.write();
            stats.record_outcome(
                outcome,
                self.cfg.settlement.settled_retention_s,
                self.cfg.booster.loss_streak_lock,
                (self.cfg.booster.lock_hours * 3600.0) as i64,
            );
            if let Err(e) = self.store.save_stats(&stats) {
                warn!(error = %format!("{e:#}"), "stats persist failed");
            }
            let mut entry_meta = self.entry_meta.lock();
            entry_meta.remove(&task.cid);
            let _ = self.store.save_entry_meta(&entry_meta);
        }

        info!(
            cid = %task.cid,
            realized = realized_usdc,
            pnl,
            tx = task.tx_hash.as_deref().unwrap_or("-"),
            "redemption finalized"
        );
        self.mark_finalized(&task.cid, now_ts);
    }

    /// Supervised loop body: sweep historical activity for redeemable CIDs
    /// the main path missed and feed them through the same executor queue.
    pub async fn run_backfill(self: Arc<Self>) -> Result<()> {
        loop {
            if let Err(e) = self.backfill_once().await {
                warn!(error = %format!("{e:#}"), "backfill sweep failed");
            }
            tokio::time::sleep(Duration::from_secs(
                self.cfg.settlement.backfill_interval_s,
            ))
            .await;
        }
    }

    async fn backfill_once(&self) -> Result<()> {
        let wallet = &self.cfg.endpoints.wallet_address;
        if wallet.is_empty() {
            return Ok(());
        }
        let url = format!("{}/activity", self.cfg.endpoints.data_api_url);
        let mut by_cid: HashMap<String, HashSet<Side>> = HashMap::new();

        for page in 0..self.cfg.settlement.backfill_pages {
            let offset = (page * 100).to_string();
            let data = self
                .http
                .get_json(
                    &url,
                    &[
                        ("user", wallet.clone()),
                        ("limit", "100".to_string()),
                        ("offset", offset),
                    ],
                    Some(Duration::from_secs(60)),
                    None,
                )
                .await
                .context("activity fetch failed")?;
            let Some(rows) = data.as_array() else { break };
            if rows.is_empty() {
                break;
            }
            for row in rows {
                let kind = row
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_ascii_uppercase();
                if !matches!(kind.as_str(), "BUY" | "TRADE" | "PURCHASE") {
                    continue;
                }
                let Some(cid) = row.get("conditionId").and_then(Value::as_str) else {
                    continue;
                };
                let Some(side) = row
                    .get("outcome")
                    .and_then(Value::as_str)
                    .and_then(Side::parse)
                else {
                    continue;
                };
                by_cid.entry(cid.to_string()).or_default().insert(side);
            }
            if rows.len() < 100 {
                break;
            }
        }

        debug!(cids = by_cid.len(), "backfill universe");
        for (cid, sides) in by_cid {
            if self.is_finalized(&cid) || self.queued.lock().contains(&cid) {
                continue;
            }
            let state = match self.chain.payout_state(&cid).await {
                Ok(s) => s,
                Err(e) => {
                    debug!(cid = %cid, error = %format!("{e:#}"), "payout state lookup failed");
                    continue;
                }
            };
            let winner = match state {
                PayoutState::UpWins => Side::Up,
                PayoutState::DownWins => Side::Down,
                PayoutState::Unresolved => continue,
            };
            if !sides.contains(&winner) {
                continue;
            }
            let balance = match self.chain.position_balance(&cid, winner).await {
                Ok(b) => b,
                Err(e) => {
                    debug!(cid = %cid, error = %format!("{e:#}"), "position balance lookup failed");
                    continue;
                }
            };
            if balance * 1.0 <= self.cfg.settlement.dust_usdc {
                continue;
            }
            let now_ts = chrono::Utc::now().timestamp();
            // Winner shares pay out 1 USDC each.
            self.enqueue(RedemptionTask::new(cid, winner, balance, now_ts), true);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Asset, RoundDuration};

    fn manager() -> (tempfile::TempDir, Arc<SettlementManager>) {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Arc::new(Config::from_env());
        let store = StateStore::new(dir.path()).unwrap();
        let http = Arc::new(HttpService::new(cfg.http.clone()).unwrap());
        let rpc = crate::rpc_pool::RpcPool::new(&["http://127.0.0.1:1".to_string()]).unwrap();
        let nonce = Arc::new(nonce::NonceManager::new());
        let chain = Arc::new(
            ChainClient::new(
                rpc.clone(),
                "0x0000000000000000000000000000000000000001",
                "0x2791Bca1f2de4661ED88A30C99A7a9449Aa84174",
                "0x4D97DCd97eC945f40cF65F87097ACe5EA0476045",
                None,
                nonce,
            )
            .unwrap(),
        );
        let prices = crate::feeds::price::PriceFeed::new(16);
        let catalog = crate::markets::MarketCatalog::new();
        let reserved = Arc::new(crate::portfolio::ReservedBankroll::default());
        let reconciler = Reconciler::new(
            http.clone(),
            chain.clone(),
            catalog,
            prices,
            store.clone(),
            reserved,
            cfg.risk.clone(),
            cfg.endpoints.data_api_url.clone(),
            cfg.endpoints.markets_rest_url.clone(),
            "0x1".into(),
        );
        let journal = MetricsJournal::open(dir.path()).unwrap();
        let stats = Arc::new(parking_lot::RwLock::new(StatsEngine::new()));
        let mgr = SettlementManager::new(
            cfg, chain, reconciler, journal, stats, store, http,
        );
        (dir, mgr)
    }

    fn outcome(cid: &str, stake: f64) -> TradeOutcome {
        TradeOutcome {
            ts: 1_700_000_000,
            cid: cid.into(),
            asset: Asset::Btc,
            duration: RoundDuration::M15,
            side: Side::Up,
            entry: 0.55,
            score: 12,
            stake,
            pnl: 0.0,
            win: false,
        }
    }

    #[test]
    fn enqueue_guards_against_duplicates_and_finalized() {
        let (_d, mgr) = manager();
        let now = 1_700_000_000;
        mgr.enqueue(RedemptionTask::new("cid1".into(), Side::Up, 4.2, now), false);
        mgr.enqueue(RedemptionTask::new("cid1".into(), Side::Up, 4.2, now), false);
        assert_eq!(mgr.queue.lock().len(), 1);

        mgr.mark_finalized("cid2", now);
        mgr.enqueue(RedemptionTask::new("cid2".into(), Side::Up, 1.0, now), false);
        assert_eq!(mgr.queue.lock().len(), 1);
    }

    #[test]
    fn finalize_attributes_pnl_from_entry_meta() {
        let (_d, mgr) = manager();
        let now = 1_700_000_500;
        mgr.note_entry(outcome("cidX", 2.31));
        let mut task = RedemptionTask::new("cidX".into(), Side::Up, 4.20, now);
        task.tx_hash = Some("0xabc".into());
        // S6: receipt credited 4.19 USDC against a 2.31 stake.
        mgr.finalize(task, 4.19, now);

        assert!(mgr.is_finalized("cidX"));
        let stats = mgr.stats.read();
        assert_eq!(stats.total_wins, 1);
        assert!((stats.total_pnl - (4.19 - 2.31)).abs() < 1e-9);
        // Entry meta consumed.
        assert!(mgr.entry_meta.lock().get("cidX").is_none());
    }

    #[test]
    fn finalized_cache_survives_restart_shape() {
        let (dir, mgr) = manager();
        let now = chrono::Utc::now().timestamp();
        mgr.mark_finalized("cidZ", now);
        drop(mgr);
        let store = StateStore::new(dir.path()).unwrap();
        let reloaded = store.load_settled(36 * 3600, now);
        assert!(reloaded.contains_key("cidZ"));
    }

    #[test]
    fn journal_rows_tag_backfill_resolves() {
        let (_d, mgr) = manager();
        let now = 1_700_000_000;
        mgr.enqueue(
            RedemptionTask::new("cidB".into(), Side::Down, 3.0, now),
            true,
        );
        let task = mgr.queue.lock().pop_front().unwrap();
        mgr.finalize(task, 3.0, now);
        let rows = mgr.journal.read_all().unwrap();
        assert!(rows
            .iter()
            .any(|r| r.event == EventKind::ResolveBackfill && r.cid == "cidB"));
    }
}
