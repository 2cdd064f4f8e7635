//! CLOB orderbook cache.
//!
//! Per-token best bid/ask plus top ask levels, fed by one websocket loop per
//! configured endpoint (racing: newest server timestamp wins) with a REST
//! fallback path. Every read carries an age; the strict freshness cap is
//! adaptive, derived from the rolling median age of recent updates.

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, trace, warn};

use crate::http::HttpService;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum BookSource {
    Ws,
    Rest,
}

#[derive(Debug, Clone, Copy)]
pub struct BookLevel {
    pub price: f64,
    pub size: f64,
}

#[derive(Debug, Clone)]
struct StoredBook {
    best_bid: f64,
    best_ask: f64,
    asks: Vec<BookLevel>,
    bids: Vec<BookLevel>,
    tick_size: f64,
    server_ts_ms: i64,
    source: BookSource,
    received: Instant,
}

/// Value view handed to the snapshot builder.
#[derive(Debug, Clone)]
pub struct BookView {
    pub token_id: String,
    pub best_bid: f64,
    pub best_ask: f64,
    pub asks: Vec<(f64, f64)>,
    pub tick_size: f64,
    pub age_ms: f64,
    pub source: BookSource,
}

pub struct BookCache {
    books: RwLock<HashMap<String, StoredBook>>,
    watched: RwLock<HashSet<String>>,
    /// Bumped when the watch list changes so WS loops resubscribe.
    generation: AtomicU64,
    /// Rolling update ages feeding the adaptive strict cap.
    recent_ages_ms: RwLock<VecDeque<f64>>,
    stale_ticks: AtomicU64,
}

impl BookCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            books: RwLock::new(HashMap::new()),
            watched: RwLock::new(HashSet::new()),
            generation: AtomicU64::new(0),
            recent_ages_ms: RwLock::new(VecDeque::new()),
            stale_ticks: AtomicU64::new(0),
        })
    }

    /// Replace the set of tokens the websocket loops subscribe to.
    pub fn set_watched(&self, tokens: impl IntoIterator<Item = String>) {
        let next: HashSet<String> = tokens.into_iter().filter(|t| !t.is_empty()).collect();
        let mut watched = self.watched.write();
        if *watched != next {
            *watched = next;
            self.generation.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn upsert(
        &self,
        token_id: &str,
        best_bid: f64,
        best_ask: f64,
        asks: Vec<BookLevel>,
        bids: Vec<BookLevel>,
        tick_size: f64,
        server_ts_ms: i64,
        source: BookSource,
    ) {
        let mut books = self.books.write();
        if let Some(existing) = books.get(token_id) {
            // Racing endpoints: keep the newer server timestamp.
            if existing.server_ts_ms > server_ts_ms {
                return;
            }
        }
        books.insert(
            token_id.to_string(),
            StoredBook {
                best_bid,
                best_ask,
                asks,
                bids,
                tick_size: if tick_size > 0.0 { tick_size } else { 0.01 },
                server_ts_ms,
                source,
                received: Instant::now(),
            },
        );
        drop(books);

        if source == BookSource::Ws {
            let mut ages = self.recent_ages_ms.write();
            let age = (chrono::Utc::now().timestamp_millis() - server_ts_ms).max(0) as f64;
            ages.push_back(age);
            while ages.len() > 256 {
                ages.pop_front();
            }
        }
    }

    pub fn age_ms(&self, token_id: &str) -> Option<f64> {
        let books = self.books.read();
        books
            .get(token_id)
            .map(|b| b.received.elapsed().as_secs_f64() * 1000.0)
    }

    pub fn get(&self, token_id: &str, max_age_ms: f64) -> Option<BookView> {
        let books = self.books.read();
        let b = books.get(token_id)?;
        let age_ms = b.received.elapsed().as_secs_f64() * 1000.0;
        if age_ms > max_age_ms {
            return None;
        }
        Some(BookView {
            token_id: token_id.to_string(),
            best_bid: b.best_bid,
            best_ask: b.best_ask,
            asks: b.asks.iter().map(|l| (l.price, l.size)).collect(),
            tick_size: b.tick_size,
            age_ms,
            source: b.source,
        })
    }

    /// Strict freshness cap: median recent delivery age times a headroom
    /// factor, clamped into `[min_ms, max_ms]`.
    pub fn adaptive_strict_cap_ms(&self, min_ms: f64, max_ms: f64) -> f64 {
        let ages = self.recent_ages_ms.read();
        if ages.len() < 16 {
            return max_ms;
        }
        let mut sorted: Vec<f64> = ages.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let median = sorted[sorted.len() / 2];
        (median * 3.0).clamp(min_ms, max_ms)
    }

    /// Health check: count consecutive ticks where every watched token is
    /// stale beyond `cap_ms`. Returns true when a forced reconnect is due.
    pub fn note_health_tick(&self, cap_ms: f64, reconnect_after: u32) -> bool {
        let watched = self.watched.read();
        if watched.is_empty() {
            self.stale_ticks.store(0, Ordering::SeqCst);
            return false;
        }
        let all_stale = watched
            .iter()
            .all(|t| self.age_ms(t).map(|a| a > cap_ms).unwrap_or(true));
        if !all_stale {
            self.stale_ticks.store(0, Ordering::SeqCst);
            return false;
        }
        let n = self.stale_ticks.fetch_add(1, Ordering::SeqCst) + 1;
        if n >= reconnect_after as u64 {
            self.stale_ticks.store(0, Ordering::SeqCst);
            self.generation.fetch_add(1, Ordering::SeqCst);
            return true;
        }
        false
    }

    /// REST fallback for a single token book.
    pub async fn fetch_rest(
        &self,
        http: &HttpService,
        clob_rest_url: &str,
        token_id: &str,
    ) -> Result<()> {
        let url = format!("{clob_rest_url}/book");
        let data = http
            .get_json(
                &url,
                &[("token_id", token_id.to_string())],
                Some(Duration::from_millis(300)),
                None,
            )
            .await
            .context("clob rest book fetch failed")?;

        let parse_side = |key: &str| -> Vec<BookLevel> {
            data.get(key)
                .and_then(Value::as_array)
                .map(|arr| {
                    arr.iter()
                        .filter_map(|l| {
                            let price = str_or_num(l.get("price")?)?;
                            let size = str_or_num(l.get("size")?)?;
                            Some(BookLevel { price, size })
                        })
                        .collect()
                })
                .unwrap_or_default()
        };

        let mut bids = parse_side("bids");
        let mut asks = parse_side("asks");
        bids.sort_by(|a, b| b.price.partial_cmp(&a.price).unwrap_or(std::cmp::Ordering::Equal));
        asks.sort_by(|a, b| a.price.partial_cmp(&b.price).unwrap_or(std::cmp::Ordering::Equal));

        let best_bid = bids.first().map(|l| l.price).unwrap_or(0.0);
        let best_ask = asks.first().map(|l| l.price).unwrap_or(0.0);
        let tick = data
            .get("tick_size")
            .and_then(str_or_num_ref)
            .unwrap_or(0.01);
        let ts = data
            .get("timestamp")
            .and_then(str_or_num_ref)
            .map(|t| t as i64)
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());

        self.upsert(token_id, best_bid, best_ask, asks, bids, tick, ts, BookSource::Rest);
        Ok(())
    }

    /// Supervised loop body for one websocket endpoint. Reconnects when the
    /// watch list changes, on idle silence, and on transport errors.
    pub async fn run_ws(
        self: Arc<Self>,
        ws_url: String,
        idle_timeout: Duration,
        backoff_cap: Duration,
    ) -> Result<()> {
        let mut attempt: u32 = 0;
        loop {
            let gen_at_connect = self.generation.load(Ordering::SeqCst);
            let tokens: Vec<String> = self.watched.read().iter().cloned().collect();
            if tokens.is_empty() {
                tokio::time::sleep(Duration::from_millis(500)).await;
                continue;
            }
            match self
                .connect_once(&ws_url, &tokens, gen_at_connect, idle_timeout)
                .await
            {
                Ok(()) => attempt = 0, // clean resubscribe cycle
                Err(e) => {
                    attempt = attempt.saturating_add(1);
                    let base = Duration::from_millis(500 * 2u64.saturating_pow(attempt.min(7)));
                    let delay = base.min(backoff_cap);
                    warn!(error = %format!("{e:#}"), url = %ws_url, delay_ms = delay.as_millis() as u64, "book ws reconnecting");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn connect_once(
        &self,
        ws_url: &str,
        tokens: &[String],
        gen_at_connect: u64,
        idle_timeout: Duration,
    ) -> Result<()> {
        let (ws, _) = connect_async(ws_url).await.context("book ws connect failed")?;
        let (mut write, mut read) = ws.split();

        let sub = serde_json::json!({
            "type": "market",
            "assets_ids": tokens,
        });
        write
            .send(Message::Text(sub.to_string()))
            .await
            .context("book ws subscribe failed")?;
        debug!(url = %ws_url, n = tokens.len(), "book ws subscribed");

        loop {
            if self.generation.load(Ordering::SeqCst) != gen_at_connect {
                // Watch list changed; exit cleanly to resubscribe.
                return Ok(());
            }
            let msg = match tokio::time::timeout(idle_timeout, read.next()).await {
                Ok(Some(Ok(m))) => m,
                Ok(Some(Err(e))) => return Err(e).context("book ws read error"),
                Ok(None) => anyhow::bail!("book ws closed"),
                Err(_) => anyhow::bail!("book ws idle for {}s", idle_timeout.as_secs()),
            };
            match msg {
                Message::Text(text) => self.handle_frame(&text),
                Message::Ping(p) => {
                    let _ = write.send(Message::Pong(p)).await;
                }
                Message::Close(_) => anyhow::bail!("book ws close frame"),
                _ => {}
            }
        }
    }

    fn handle_frame(&self, text: &str) {
        let Ok(v) = serde_json::from_str::<Value>(text) else {
            return;
        };
        // Frames may be a single event or a batch.
        match &v {
            Value::Array(events) => {
                for e in events {
                    self.handle_event(e);
                }
            }
            _ => self.handle_event(&v),
        }
    }

    fn handle_event(&self, v: &Value) {
        let Some(token_id) = v
            .get("asset_id")
            .or_else(|| v.get("token_id"))
            .and_then(Value::as_str)
        else {
            trace!("book event without asset id");
            return;
        };
        let parse_side = |key: &str| -> Vec<BookLevel> {
            v.get(key)
                .and_then(Value::as_array)
                .map(|arr| {
                    arr.iter()
                        .filter_map(|l| {
                            let price = str_or_num(l.get("price")?)?;
                            let size = str_or_num(l.get("size")?)?;
                            Some(BookLevel { price, size })
                        })
                        .collect()
                })
                .unwrap_or_default()
        };
        let mut bids = parse_side("bids");
        let mut asks = parse_side("asks");
        if bids.is_empty() && asks.is_empty() {
            return;
        }
        bids.sort_by(|a, b| b.price.partial_cmp(&a.price).unwrap_or(std::cmp::Ordering::Equal));
        asks.sort_by(|a, b| a.price.partial_cmp(&b.price).unwrap_or(std::cmp::Ordering::Equal));
        let best_bid = bids.first().map(|l| l.price).unwrap_or(0.0);
        let best_ask = asks.first().map(|l| l.price).unwrap_or(0.0);
        let tick = v.get("tick_size").and_then(str_or_num_ref).unwrap_or(0.01);
        let ts = v
            .get("timestamp")
            .or_else(|| v.get("ts"))
            .and_then(str_or_num_ref)
            .map(|t| t as i64)
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());
        self.upsert(token_id, best_bid, best_ask, asks, bids, tick, ts, BookSource::Ws);
    }
}

fn str_or_num(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn str_or_num_ref(v: &Value) -> Option<f64> {
    str_or_num(v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newer_server_ts_wins_across_endpoints() {
        let cache = BookCache::new();
        cache.upsert("tok", 0.55, 0.57, vec![], vec![], 0.01, 2_000, BookSource::Ws);
        cache.upsert("tok", 0.50, 0.52, vec![], vec![], 0.01, 1_000, BookSource::Ws);
        let view = cache.get("tok", 10_000.0).unwrap();
        assert!((view.best_ask - 0.57).abs() < 1e-9);
    }

    #[test]
    fn stale_books_are_filtered_by_age() {
        let cache = BookCache::new();
        cache.upsert("tok", 0.40, 0.42, vec![], vec![], 0.01, 1, BookSource::Rest);
        assert!(cache.get("tok", 10_000.0).is_some());
        assert!(cache.get("tok", 0.0).is_none());
    }

    #[test]
    fn watch_list_changes_bump_generation() {
        let cache = BookCache::new();
        let g0 = cache.generation.load(Ordering::SeqCst);
        cache.set_watched(vec!["a".to_string(), "b".to_string()]);
        let g1 = cache.generation.load(Ordering::SeqCst);
        assert!(g1 > g0);
        // Same set: no bump.
        cache.set_watched(vec!["b".to_string(), "a".to_string()]);
        assert_eq!(cache.generation.load(Ordering::SeqCst), g1);
    }

    #[test]
    fn health_tick_counts_consecutive_stale() {
        let cache = BookCache::new();
        cache.set_watched(vec!["tok".to_string()]);
        // No book at all counts as stale.
        assert!(!cache.note_health_tick(1_000.0, 3));
        assert!(!cache.note_health_tick(1_000.0, 3));
        assert!(cache.note_health_tick(1_000.0, 3));
        // Counter resets after the forced reconnect.
        assert!(!cache.note_health_tick(1_000.0, 3));
    }

    #[test]
    fn ws_frame_parsing_upserts_book() {
        let cache = BookCache::new();
        cache.handle_frame(
            r#"{"event_type":"book","asset_id":"tok1",
                "bids":[{"price":"0.55","size":"120"}],
                "asks":[{"price":"0.58","size":"80"},{"price":"0.59","size":"50"}],
                "tick_size":"0.01","timestamp":"1700000000000"}"#,
        );
        let view = cache.get("tok1", 10_000.0).unwrap();
        assert!((view.best_bid - 0.55).abs() < 1e-9);
        assert!((view.best_ask - 0.58).abs() < 1e-9);
        assert_eq!(view.asks.len(), 2);
    }
}
