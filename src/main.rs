//! roundbot — automated trader for short-duration on-chain up/down rounds.
//!
//! Boot order: config, persistence, feeds, reconciler, scorer, execution,
//! settlement — then every loop runs under the supervisor and the process
//! never exits on a single subsystem crash.

mod config;
mod exec;
mod feeds;
mod http;
mod journal;
mod markets;
mod models;
mod persist;
mod portfolio;
mod rpc_pool;
mod scorer;
mod settlement;
mod snapshot;
mod stats;
mod supervisor;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use config::Config;
use exec::clob::{ClobApi, ClobCredentials, HttpClobClient, PaperClob};
use exec::{ExecPhase, ExecutionEngine};
use journal::{EventKind, JournalRow, MetricsJournal};
use models::Position;
use persist::StateStore;
use portfolio::{enforce_exposure, Reconciler, ReservedBankroll};
use scorer::{Decision, Scorer};
use settlement::chain::ChainClient;
use settlement::nonce::NonceManager;
use settlement::SettlementManager;
use snapshot::{SnapshotBuilder, SnapshotStore};
use stats::{StatsEngine, TradeOutcome};
use supervisor::Supervisor;

const ZERO_ADDRESS: &str = "0x0000000000000000000000000000000000000000";

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = Arc::new(Config::from_env());
    info!(
        dry_run = cfg.dry_run,
        data_dir = %cfg.data_dir,
        enable_5m = cfg.enable_5m,
        enable_15m = cfg.enable_15m,
        "starting roundbot"
    );

    // Persistence and journal.
    let store = StateStore::new(&cfg.data_dir)?;
    let metrics = MetricsJournal::open(&cfg.data_dir)?;
    let http = Arc::new(http::HttpService::new(cfg.http.clone())?);

    // Chain plumbing.
    let rpc = rpc_pool::RpcPool::new(&cfg.endpoints.rpc_urls)?;
    let nonce = Arc::new(NonceManager::new());
    let wallet_address = if cfg.endpoints.wallet_address.is_empty() {
        warn!("no wallet address configured; on-chain writes disabled");
        ZERO_ADDRESS.to_string()
    } else {
        cfg.endpoints.wallet_address.clone()
    };
    let signing_key = if cfg.endpoints.wallet_address.is_empty() {
        None
    } else {
        cfg.endpoints.wallet_private_key.as_deref()
    };
    let chain = Arc::new(ChainClient::new(
        rpc.clone(),
        &wallet_address,
        &cfg.endpoints.collateral_address,
        &cfg.endpoints.conditional_tokens_address,
        signing_key,
        nonce,
    )?);

    // Feeds.
    let prices = feeds::price::PriceFeed::new(cfg.feeds.price_history_len);
    let books = feeds::book::BookCache::new();
    let oracle = feeds::oracle::OracleFeed::new(&cfg.endpoints.oracle_aggregators, rpc.clone())?;
    let derivs = feeds::derivs::DerivsFeed::new(cfg.feeds.ofi_window_s);
    let copyflow = feeds::copyflow::CopyFlow::new(
        store.load_leaders(),
        Duration::from_secs_f64(cfg.feeds.copyflow_ondemand_cooldown_s),
    );

    // Markets and snapshots.
    let catalog = markets::MarketCatalog::new();
    catalog.seed(store.load_market_cache());
    let snapshots = SnapshotStore::new();
    let builder = Arc::new(SnapshotBuilder {
        catalog: catalog.clone(),
        prices: prices.clone(),
        oracle: oracle.clone(),
        books: books.clone(),
        derivs: derivs.clone(),
        copyflow: copyflow.clone(),
        feed_cfg: cfg.feeds.clone(),
    });

    // Portfolio truth.
    let reserved = Arc::new(ReservedBankroll::default());
    let reconciler = Reconciler::new(
        http.clone(),
        chain.clone(),
        catalog.clone(),
        prices.clone(),
        store.clone(),
        reserved.clone(),
        cfg.risk.clone(),
        cfg.endpoints.data_api_url.clone(),
        cfg.endpoints.markets_rest_url.clone(),
        wallet_address.clone(),
    );

    // Adaptive stats (restored) and the scorer.
    let stats = Arc::new(RwLock::new(store.load_stats()));
    let scorer = Arc::new(Scorer::new(cfg.clone()));
    scorer.restore_seen(store.load_seen());

    // Execution.
    let clob: Arc<dyn ClobApi> = match (
        cfg.dry_run,
        cfg.endpoints.clob_api_key.clone(),
        cfg.endpoints.clob_api_secret.clone(),
        cfg.endpoints.clob_passphrase.clone(),
    ) {
        (false, Some(api_key), Some(secret), Some(passphrase)) => Arc::new(
            HttpClobClient::new(
                cfg.endpoints.clob_rest_url.clone(),
                wallet_address.clone(),
                ClobCredentials {
                    api_key,
                    secret,
                    passphrase,
                },
            )
            .context("cannot build live CLOB client")?,
        ),
        _ => {
            info!("paper execution active (dry run or missing CLOB credentials)");
            Arc::new(PaperClob::new(Some(3), false))
        }
    };
    let engine = ExecutionEngine::new(cfg.clone(), clob, reserved.clone(), metrics.clone());

    // Settlement.
    let settlement = SettlementManager::new(
        cfg.clone(),
        chain.clone(),
        reconciler.clone(),
        metrics.clone(),
        stats.clone(),
        store.clone(),
        http.clone(),
    );

    // Supervisor wiring.
    let sup = Supervisor::new();
    sup.spawn_health_reporter(Duration::from_secs(30));

    {
        let prices = prices.clone();
        let url = cfg.endpoints.price_ws_url.clone();
        let idle = Duration::from_secs(cfg.feeds.ws_idle_timeout_s);
        let cap = Duration::from_secs(cfg.feeds.reconnect_backoff_cap_s);
        sup.spawn("price-ws", move || {
            prices.clone().run_ws(url.clone(), idle, cap)
        });
    }
    for (i, url) in cfg.endpoints.book_ws_urls.iter().enumerate() {
        let books = books.clone();
        let url = url.clone();
        let idle = Duration::from_secs(cfg.feeds.ws_idle_timeout_s);
        let cap = Duration::from_secs(cfg.feeds.reconnect_backoff_cap_s);
        let name: &'static str = match i {
            0 => "book-ws-0",
            1 => "book-ws-1",
            _ => "book-ws-n",
        };
        sup.spawn(name, move || books.clone().run_ws(url.clone(), idle, cap));
    }
    {
        // Book freshness health: after N consecutive all-stale ticks beyond
        // the adaptive cap, force the book websockets to resubscribe.
        let books2 = books.clone();
        let feed_cfg = cfg.feeds.clone();
        sup.spawn("book-health", move || {
            let books = books2.clone();
            let feed_cfg = feed_cfg.clone();
            async move {
                loop {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    let cap = books.adaptive_strict_cap_ms(
                        feed_cfg.book_strict_age_ms_min,
                        feed_cfg.book_strict_age_ms_max,
                    );
                    if books.note_health_tick(cap, feed_cfg.stale_ticks_reconnect) {
                        warn!("all book feeds stale, forcing websocket resubscribe");
                    }
                }
            }
        });
    }
    {
        let oracle = oracle.clone();
        let poll = Duration::from_millis(cfg.feeds.oracle_poll_ms);
        sup.spawn("oracle-poll", move || oracle.clone().run_poller(poll));
    }
    if let Some(ws_url) = cfg.endpoints.oracle_ws_url.clone() {
        let oracle = oracle.clone();
        sup.spawn("oracle-ws", move || oracle.clone().run_ws(ws_url.clone()));
    }
    {
        let derivs = derivs.clone();
        let url = cfg.endpoints.derivs_ws_url.clone();
        let idle = Duration::from_secs(cfg.feeds.ws_idle_timeout_s);
        let cap = Duration::from_secs(cfg.feeds.reconnect_backoff_cap_s);
        sup.spawn("derivs-ws", move || {
            derivs.clone().run_ws(url.clone(), idle, cap)
        });
    }
    {
        let derivs = derivs.clone();
        let http = http.clone();
        let url = cfg.endpoints.derivs_rest_url.clone();
        let interval = Duration::from_secs(cfg.feeds.derivs_poll_s);
        sup.spawn("derivs-rest", move || {
            derivs
                .clone()
                .run_rest_poller(http.clone(), url.clone(), interval)
        });
    }
    {
        let copyflow = copyflow.clone();
        let http = http.clone();
        let url = cfg.endpoints.data_api_url.clone();
        let interval = Duration::from_secs(cfg.feeds.copyflow_refresh_s);
        sup.spawn("copyflow", move || {
            copyflow
                .clone()
                .run_refresh_loop(http.clone(), url.clone(), interval)
        });
    }
    {
        let catalog = catalog.clone();
        let http = http.clone();
        let oracle = oracle.clone();
        let books = books.clone();
        let copyflow = copyflow.clone();
        let url = cfg.endpoints.markets_rest_url.clone();
        let enable_5m = cfg.enable_5m;
        let enable_15m = cfg.enable_15m;
        sup.spawn("discovery", move || {
            markets::run_discovery_loop(
                catalog.clone(),
                http.clone(),
                oracle.clone(),
                books.clone(),
                copyflow.clone(),
                url.clone(),
                enable_5m,
                enable_15m,
                Duration::from_secs(2),
            )
        });
    }
    {
        let builder = builder.clone();
        let snapshots = snapshots.clone();
        sup.spawn("snapshots", move || {
            builder
                .clone()
                .run_publish_loop(snapshots.clone(), Duration::from_millis(250))
        });
    }
    {
        let reconciler = reconciler.clone();
        let interval = cfg.risk.reconcile_interval;
        sup.spawn("reconciler", move || reconciler.clone().run_loop(interval));
    }
    {
        let settlement2 = settlement.clone();
        sup.spawn("redeem-discovery", move || settlement2.clone().run_discovery());
    }
    {
        let settlement2 = settlement.clone();
        sup.spawn("redeem-executor", move || settlement2.clone().run_executor());
    }
    {
        let settlement2 = settlement.clone();
        sup.spawn("redeem-backfill", move || settlement2.clone().run_backfill());
    }
    {
        let rpc = rpc.clone();
        let interval = Duration::from_secs(cfg.rpc_probe_interval_s);
        let margin = cfg.rpc_swap_margin_ms;
        sup.spawn("rpc-optimizer", move || {
            rpc.clone().probe_loop(interval, margin)
        });
    }
    {
        // Periodic state persistence: seen ring, market metadata cache.
        let scorer2 = scorer.clone();
        let catalog2 = catalog.clone();
        let store2 = store.clone();
        sup.spawn("persistence", move || {
            let scorer = scorer2.clone();
            let catalog = catalog2.clone();
            let store = store2.clone();
            async move {
                loop {
                    if let Err(e) = store.save_seen(&scorer.seen_cids()) {
                        warn!(error = %format!("{e:#}"), "seen ring persist failed");
                    }
                    if let Err(e) = store.save_market_cache(&catalog.all_rounds()) {
                        warn!(error = %format!("{e:#}"), "market cache persist failed");
                    }
                    tokio::time::sleep(Duration::from_secs(30)).await;
                }
            }
        });
    }
    {
        // Diagnostics: publish skip-reason top-N.
        let scorer2 = scorer.clone();
        sup.spawn("skip-diagnostics", move || {
            let scorer = scorer2.clone();
            async move {
                loop {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    let top = scorer.skip_top(5);
                    if !top.is_empty() {
                        let summary: Vec<String> = top
                            .iter()
                            .map(|(r, n)| format!("{}={n}", r.as_str()))
                            .collect();
                        info!(skips = %summary.join(" "), "skip reasons (rolling window)");
                    }
                }
            }
        });
    }
    {
        // The scan loop: snapshots → scorer → risk gates → execution.
        let scan = ScanLoop {
            cfg: cfg.clone(),
            snapshots: snapshots.clone(),
            scorer: scorer.clone(),
            reconciler: reconciler.clone(),
            stats: stats.clone(),
            engine: engine.clone(),
            settlement: settlement.clone(),
            metrics: metrics.clone(),
            copyflow: copyflow.clone(),
            books: books.clone(),
            http: http.clone(),
            store: store.clone(),
        };
        let scan = Arc::new(scan);
        sup.spawn("scan", move || scan.clone().run());
    }

    info!("all loops started");
    // The supervisor keeps everything alive; park the main task forever.
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}

struct ScanLoop {
    cfg: Arc<Config>,
    snapshots: Arc<SnapshotStore>,
    scorer: Arc<Scorer>,
    reconciler: Arc<Reconciler>,
    stats: Arc<RwLock<StatsEngine>>,
    engine: Arc<ExecutionEngine>,
    settlement: Arc<SettlementManager>,
    metrics: Arc<MetricsJournal>,
    copyflow: Arc<feeds::copyflow::CopyFlow>,
    books: Arc<feeds::book::BookCache>,
    http: Arc<http::HttpService>,
    store: Arc<StateStore>,
}

impl ScanLoop {
    async fn run(self: Arc<Self>) -> Result<()> {
        loop {
            let now_ts = chrono::Utc::now().timestamp();
            let view = self.reconciler.view();
            for snap in self.snapshots.all() {
                // Missing or stale leader flow triggers a bounded on-demand
                // refresh; the next snapshot pass picks up the result.
                let flow_stale = snap
                    .flow
                    .as_ref()
                    .map(|f| f.age_s > self.cfg.feeds.copyflow_live_max_age_s)
                    .unwrap_or(true);
                if flow_stale {
                    let _ = self
                        .copyflow
                        .refresh_on_demand(
                            &self.http,
                            &self.cfg.endpoints.data_api_url,
                            &snap.round.cid,
                        )
                        .await;
                }

                // Websocket book gone stale: pull a REST book so the scorer
                // can degrade gracefully instead of skipping outright.
                for token in [&snap.round.token_up, &snap.round.token_down] {
                    let age = self.books.age_ms(token);
                    if age.map(|a| a > self.cfg.feeds.book_fallback_age_ms).unwrap_or(true) {
                        if let Err(e) = self
                            .books
                            .fetch_rest(&self.http, &self.cfg.endpoints.clob_rest_url, token)
                            .await
                        {
                            tracing::debug!(token = %token, error = %format!("{e:#}"), "rest book fetch failed");
                        }
                    }
                }

                // Must-fire relaxation in the final stretch of unentered
                // rounds.
                let late_relax = snap.round.mins_left(now_ts) <= 2.5
                    && !view.positions.contains_key(&snap.round.cid);

                let decision = {
                    let stats = self.stats.read();
                    self.scorer.decide(&snap, &view, &stats, late_relax)
                };
                let Decision::Emit(signal) = decision else {
                    continue;
                };

                // Exposure gates between candidate and order.
                if let Err(reason) = enforce_exposure(&view, &signal, &snap.round, &self.cfg.risk)
                {
                    let mut row = JournalRow::new(now_ts, EventKind::Skip, signal.cid.clone());
                    row.reason = Some(reason.as_str().to_string());
                    row.asset = Some(signal.asset);
                    row.side = Some(signal.side);
                    self.metrics.emit(&row);
                    continue;
                }

                let mut row = JournalRow::new(now_ts, EventKind::Entry, signal.cid.clone());
                row.asset = Some(signal.asset);
                row.side = Some(signal.side);
                row.duration = Some(signal.duration);
                row.score = Some(signal.score);
                row.entry_price = Some(signal.entry);
                row.size_usdc = Some(signal.notional_usdc);
                row.round_key = Some(snap.round.fingerprint());
                row.open_price_source = Some(signal.open_price_source.as_str().to_string());
                row.oracle_age_s = signal.oracle_age_s;
                row.reason = Some(signal.mode.as_str().to_string());
                self.metrics.emit(&row);

                // Mark the round at placement time, not at fill time: the
                // only legitimate re-entry afterwards is the booster path.
                if signal.booster {
                    self.scorer.mark_booster_used(&signal.cid);
                } else {
                    self.scorer.mark_entered(&signal.cid);
                }

                // Execute off the scan loop; a parked pullback limit may
                // rest for minutes and must not stall other rounds. The
                // per-cid execution lock guards against duplicates.
                let this = self.clone();
                let round = snap.round.clone();
                let book = snap.book_for(signal.side).cloned();
                tokio::spawn(async move {
                    let placed_ts = chrono::Utc::now().timestamp();
                    let report = this
                        .engine
                        .execute(&signal, book.as_ref(), round.end_ts, placed_ts)
                        .await;
                    if report.phase == ExecPhase::Filled {
                        this.on_fill(&signal, &round, &report, placed_ts);
                    }
                });
            }
            tokio::time::sleep(Duration::from_millis(400)).await;
        }
    }

    fn on_fill(
        &self,
        signal: &models::Signal,
        round: &models::Round,
        report: &exec::ExecReport,
        now_ts: i64,
    ) {
        let mut row = JournalRow::new(now_ts, EventKind::Fill, signal.cid.clone());
        row.asset = Some(signal.asset);
        row.side = Some(signal.side);
        row.duration = Some(signal.duration);
        row.score = Some(signal.score);
        row.entry_price = Some(signal.entry);
        row.size_usdc = Some(report.filled_notional);
        row.fill_price = Some(report.fill_price);
        row.slip_bps = Some(report.slip_bps);
        row.latency_ms = Some(report.latency_ms);
        row.round_key = Some(round.fingerprint());
        row.reason = Some(report.reason.clone());
        self.metrics.emit(&row);

        self.reconciler.record_local_fill(
            Position {
                cid: signal.cid.clone(),
                asset: signal.asset,
                duration: signal.duration,
                side: signal.side,
                shares: report.filled_size,
                cost_usdc: report.filled_notional,
                value_now_usdc: report.filled_notional,
                avg_price: report.fill_price,
                opened_ts: now_ts,
                start_ts: round.start_ts,
                end_ts: round.end_ts,
                add_on_count: if signal.booster { 1 } else { 0 },
                core_position: !signal.booster,
            },
            now_ts,
        );

        {
            let mut stats = self.stats.write();
            stats.record_fill(
                models::BucketKey::new(signal.duration, signal.score, signal.entry),
                report.slip_bps.max(0.0),
            );
            if signal.reasons.iter().any(|r| r == "superbet_floor") {
                stats.note_superbet(now_ts);
            }
            if let Err(e) = self.store.save_stats(&stats) {
                warn!(error = %format!("{e:#}"), "stats persist failed");
            }
        }

        let fill_entry = if report.fill_price > 0.0 {
            report.fill_price
        } else {
            signal.entry
        };
        self.settlement.note_entry(TradeOutcome {
            ts: now_ts,
            cid: signal.cid.clone(),
            asset: signal.asset,
            duration: signal.duration,
            side: signal.side,
            entry: fill_entry,
            score: signal.score,
            stake: report.filled_notional,
            pnl: 0.0,
            win: false,
        });

        info!(
            cid = %signal.cid,
            side = %signal.side,
            notional = report.filled_notional,
            price = report.fill_price,
            mode = signal.mode.as_str(),
            "position opened"
        );
    }
}
