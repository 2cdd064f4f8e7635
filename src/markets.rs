//! Round discovery and round-open reference prices.
//!
//! Rounds are slotted to wall-clock boundaries, so the active slug for each
//! `(asset, duration)` pair is derived from the clock and resolved through
//! the markets REST API. The catalog also owns the "price to beat" per
//! round: the indexer value when it reports one, otherwise the oracle
//! observation nearest the round-open boundary.

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::feeds::book::BookCache;
use crate::feeds::copyflow::CopyFlow;
use crate::feeds::oracle::OracleFeed;
use crate::http::HttpService;
use crate::models::{Asset, OpenPriceSource, Round, RoundDuration};

/// Tolerance for matching an oracle observation to the round boundary.
const OPEN_ORACLE_TOLERANCE_S: i64 = 90;
/// Rounds are kept in the catalog for a short grace after close so late
/// fills and settlement lookups still resolve metadata.
const RETIRE_GRACE_S: i64 = 30 * 60;

#[derive(Debug, Clone)]
pub struct OpenPrice {
    pub price: f64,
    pub source: OpenPriceSource,
}

pub struct MarketCatalog {
    rounds: RwLock<HashMap<String, Round>>,
    open_prices: RwLock<HashMap<String, OpenPrice>>,
    /// Previous round-open price per (asset, duration), for continuation.
    prev_opens: RwLock<HashMap<(Asset, RoundDuration), f64>>,
}

impl MarketCatalog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            rounds: RwLock::new(HashMap::new()),
            open_prices: RwLock::new(HashMap::new()),
            prev_opens: RwLock::new(HashMap::new()),
        })
    }

    pub fn get(&self, cid: &str) -> Option<Round> {
        self.rounds.read().get(cid).cloned()
    }

    pub fn active_rounds(&self, now_ts: i64) -> Vec<Round> {
        self.rounds
            .read()
            .values()
            .filter(|r| r.start_ts <= now_ts && now_ts < r.end_ts)
            .cloned()
            .collect()
    }

    pub fn open_price(&self, cid: &str) -> Option<OpenPrice> {
        self.open_prices.read().get(cid).cloned()
    }

    pub fn prev_open(&self, asset: Asset, duration: RoundDuration) -> Option<f64> {
        self.prev_opens.read().get(&(asset, duration)).copied()
    }

    /// Seed metadata restored from the persistent market cache.
    pub fn seed(&self, rounds: Vec<Round>) {
        let mut map = self.rounds.write();
        for r in rounds {
            map.entry(r.cid.clone()).or_insert(r);
        }
    }

    pub fn upsert(&self, round: Round) {
        self.rounds.write().insert(round.cid.clone(), round);
    }

    fn retire_stale(&self, now_ts: i64) {
        let mut rounds = self.rounds.write();
        let before = rounds.len();
        rounds.retain(|_, r| r.end_ts + RETIRE_GRACE_S > now_ts);
        let removed = before - rounds.len();
        if removed > 0 {
            let live: std::collections::HashSet<String> = rounds.keys().cloned().collect();
            drop(rounds);
            self.open_prices.write().retain(|cid, _| live.contains(cid));
            debug!(removed, "retired stale rounds");
        }
    }

    /// Resolve the open reference price for every active round that lacks
    /// one, and roll the per-asset previous-open when a new round begins.
    pub fn resolve_open_prices(&self, oracle: &OracleFeed, now_ts: i64) {
        let active = self.active_rounds(now_ts);
        for round in active {
            if self.open_price(&round.cid).is_some() {
                continue;
            }
            let Some((price, exact)) =
                oracle.observation_near(round.asset, round.start_ts, OPEN_ORACLE_TOLERANCE_S)
            else {
                continue;
            };
            let source = if exact {
                OpenPriceSource::OracleExact
            } else {
                OpenPriceSource::OracleNearest
            };
            info!(
                cid = %round.cid,
                asset = %round.asset,
                price,
                source = source.as_str(),
                "round open price resolved"
            );
            // Previous-window open for the continuation signal.
            if let Some((prev, _)) = oracle.observation_near(
                round.asset,
                round.start_ts - round.duration.secs(),
                OPEN_ORACLE_TOLERANCE_S,
            ) {
                self.prev_opens
                    .write()
                    .insert((round.asset, round.duration), prev);
            }
            self.open_prices
                .write()
                .insert(round.cid.clone(), OpenPrice { price, source });
        }
    }

    pub fn set_open_price(&self, cid: &str, price: f64, source: OpenPriceSource) {
        self.open_prices
            .write()
            .insert(cid.to_string(), OpenPrice { price, source });
    }

    pub fn all_rounds(&self) -> Vec<Round> {
        self.rounds.read().values().cloned().collect()
    }
}

/// Wall-clock slot boundary for the round containing `now_ts`.
pub fn slot_start(now_ts: i64, duration: RoundDuration) -> i64 {
    let span = duration.secs();
    now_ts - now_ts.rem_euclid(span)
}

/// Venue slug for a round, e.g. `btc-updown-15m-1700000100`.
pub fn round_slug(asset: Asset, duration: RoundDuration, start_ts: i64) -> String {
    format!(
        "{}-updown-{}m-{}",
        asset.as_str().to_ascii_lowercase(),
        duration.minutes(),
        start_ts
    )
}

/// Parse a venue slug back into `(asset, duration, start_ts)`.
pub fn parse_round_slug(slug: &str) -> Option<(Asset, RoundDuration, i64)> {
    let lower = slug.to_ascii_lowercase();
    for asset in Asset::ALL {
        for duration in [RoundDuration::M5, RoundDuration::M15] {
            let prefix = format!(
                "{}-updown-{}m-",
                asset.as_str().to_ascii_lowercase(),
                duration.minutes()
            );
            if let Some(rest) = lower.strip_prefix(&prefix) {
                let ts_str = rest.split('-').next().unwrap_or("");
                if let Ok(start_ts) = ts_str.parse::<i64>() {
                    return Some((asset, duration, start_ts));
                }
            }
        }
    }
    None
}

fn string_array(v: &Value) -> Vec<String> {
    match v {
        Value::Array(arr) => arr
            .iter()
            .filter_map(|x| match x {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect(),
        // Some indexer responses return JSON arrays as a string.
        Value::String(s) => serde_json::from_str::<Vec<String>>(s).unwrap_or_default(),
        _ => Vec::new(),
    }
}

fn num_field(v: &Value, key: &str) -> Option<f64> {
    match v.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Parse one markets-REST row into a Round. The slug is authoritative for
/// asset/duration/bounds; ISO dates are the fallback.
pub fn parse_market_row(row: &Value) -> Option<Round> {
    let cid = row
        .get("conditionId")
        .or_else(|| row.get("condition_id"))
        .and_then(Value::as_str)?
        .to_string();
    let slug = row.get("slug").and_then(Value::as_str).unwrap_or("");
    let question = row
        .get("question")
        .or_else(|| row.get("title"))
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();

    let (asset, duration, start_ts) = match parse_round_slug(slug) {
        Some(parsed) => parsed,
        None => {
            // Fallback: infer from the question text plus ISO dates.
            let asset = Asset::ALL
                .into_iter()
                .find(|a| question.to_ascii_uppercase().contains(a.as_str()))?;
            let start = row
                .get("startDate")
                .or_else(|| row.get("start"))
                .and_then(Value::as_str)
                .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                .map(|d| d.timestamp())?;
            let end = row
                .get("endDate")
                .or_else(|| row.get("end"))
                .and_then(Value::as_str)
                .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                .map(|d| d.timestamp())?;
            let duration = RoundDuration::from_minutes(((end - start) / 60) as u32)?;
            (asset, duration, start)
        }
    };
    let end_ts = start_ts + duration.secs();

    let outcomes = row
        .get("outcomes")
        .map(string_array)
        .unwrap_or_default();
    let tokens = row
        .get("clobTokenIds")
        .or_else(|| row.get("clob_token_ids"))
        .map(string_array)
        .unwrap_or_default();
    if tokens.len() < 2 {
        return None;
    }
    // Map outcome labels onto token ids; default order is [Up, Down].
    let (token_up, token_down) = {
        let up_idx = outcomes
            .iter()
            .position(|o| o.eq_ignore_ascii_case("up"))
            .unwrap_or(0);
        let down_idx = if up_idx == 0 { 1 } else { 0 };
        (tokens[up_idx].clone(), tokens[down_idx].clone())
    };

    let up_price = row
        .get("outcomePrices")
        .map(string_array)
        .and_then(|prices| {
            let up_idx = outcomes
                .iter()
                .position(|o| o.eq_ignore_ascii_case("up"))
                .unwrap_or(0);
            prices.get(up_idx).and_then(|p| p.parse::<f64>().ok())
        })
        .filter(|p| *p > 0.0 && *p < 1.0)
        .unwrap_or(0.5);

    Some(Round {
        cid,
        asset,
        duration,
        start_ts,
        end_ts,
        question,
        token_up,
        token_down,
        up_price,
    })
}

/// Supervised loop body: discover the current round per enabled
/// `(asset, duration)`, resolve open prices, and keep the book watch list
/// and copy-flow active set in sync.
#[allow(clippy::too_many_arguments)]
pub async fn run_discovery_loop(
    catalog: Arc<MarketCatalog>,
    http: Arc<HttpService>,
    oracle: Arc<OracleFeed>,
    books: Arc<BookCache>,
    copyflow: Arc<CopyFlow>,
    markets_rest_url: String,
    enable_5m: bool,
    enable_15m: bool,
    interval: Duration,
) -> Result<()> {
    let mut durations = Vec::new();
    if enable_5m {
        durations.push(RoundDuration::M5);
    }
    if enable_15m {
        durations.push(RoundDuration::M15);
    }
    anyhow::ensure!(!durations.is_empty(), "no round durations enabled");

    loop {
        let now_ts = chrono::Utc::now().timestamp();
        for asset in Asset::ALL {
            for duration in &durations {
                let start_ts = slot_start(now_ts, *duration);
                let slug = round_slug(asset, *duration, start_ts);
                let known = catalog
                    .all_rounds()
                    .into_iter()
                    .any(|r| r.asset == asset && r.duration == *duration && r.start_ts == start_ts);
                if known {
                    continue;
                }
                match fetch_round(&http, &markets_rest_url, &slug).await {
                    Ok(Some((mut round, indexer_open))) => {
                        info!(cid = %round.cid, slug = %slug, "round discovered");
                        round.start_ts = start_ts;
                        round.end_ts = start_ts + duration.secs();
                        // The indexer-reported reference is authoritative
                        // when present; otherwise the oracle capture below
                        // fills it in.
                        if let Some(open) = indexer_open.filter(|p| *p > 0.0) {
                            catalog.set_open_price(&round.cid, open, OpenPriceSource::Indexer);
                        }
                        catalog.upsert(round);
                    }
                    Ok(None) => debug!(slug = %slug, "round not listed yet"),
                    Err(e) => warn!(slug = %slug, error = %format!("{e:#}"), "round discovery failed"),
                }
            }
        }

        catalog.retire_stale(now_ts);
        catalog.resolve_open_prices(&oracle, now_ts);

        let active = catalog.active_rounds(now_ts);
        let mut tokens = Vec::with_capacity(active.len() * 2);
        let mut cids = Vec::with_capacity(active.len());
        for r in &active {
            tokens.push(r.token_up.clone());
            tokens.push(r.token_down.clone());
            cids.push(r.cid.clone());
        }
        books.set_watched(tokens);
        copyflow.set_active_cids(cids);

        tokio::time::sleep(interval).await;
    }
}

async fn fetch_round(
    http: &HttpService,
    markets_rest_url: &str,
    slug: &str,
) -> Result<Option<(Round, Option<f64>)>> {
    let url = format!("{markets_rest_url}/markets");
    let data = http
        .get_json(
            &url,
            &[("slug", slug.to_string())],
            Some(Duration::from_secs(2)),
            None,
        )
        .await
        .context("markets fetch failed")?;
    let rows = match &data {
        Value::Array(rows) => rows.clone(),
        other => vec![other.clone()],
    };
    let round = rows.iter().find_map(parse_market_row);
    let indexer_open = rows.iter().find_map(|row| num_field(row, "priceToBeat"));
    Ok(round.map(|r| (r, indexer_open)))
}
