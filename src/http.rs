//! Centralized HTTP layer: per-host pacing, bounded retries, 429 backoff
//! honoring `Retry-After`, and a short-TTL response cache with stale
//! fallback. Rate-limited upstreams never hard-fail the scan loops — the
//! caller gets the freshest cached payload within the stale TTL instead.

use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use rand::Rng;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::config::HttpConfig;

struct CacheEntry {
    at: Instant,
    data: Value,
}

struct HostState {
    last_request: Option<Instant>,
    backoff_until: Option<Instant>,
}

pub struct HttpService {
    client: reqwest::Client,
    cfg: HttpConfig,
    hosts: Mutex<HashMap<String, HostState>>,
    cache: Mutex<HashMap<String, CacheEntry>>,
    inflight: Arc<Semaphore>,
}

impl HttpService {
    pub fn new(cfg: HttpConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_s))
            .pool_max_idle_per_host(4)
            .user_agent("roundbot/0.1")
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            client,
            inflight: Arc::new(Semaphore::new(cfg.bounded_inflight.max(1))),
            cfg,
            hosts: Mutex::new(HashMap::new()),
            cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Permit-bounded concurrency for fan-out calls.
    pub async fn acquire(&self) -> tokio::sync::OwnedSemaphorePermit {
        self.inflight
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore closed")
    }

    fn cache_key(url: &str, params: &[(&str, String)]) -> String {
        let mut key = String::from(url);
        for (k, v) in params {
            key.push('&');
            key.push_str(k);
            key.push('=');
            key.push_str(v);
        }
        key
    }

    fn host_of(url: &str) -> String {
        reqwest::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_string()))
            .unwrap_or_else(|| url.to_string())
    }

    fn cached_within(&self, key: &str, ttl: Duration) -> Option<Value> {
        let cache = self.cache.lock();
        cache
            .get(key)
            .filter(|e| e.at.elapsed() <= ttl)
            .map(|e| e.data.clone())
    }

    fn store_cache(&self, key: String, data: Value) {
        let mut cache = self.cache.lock();
        // Bounded: drop the oldest half when the map grows past 2k entries.
        if cache.len() > 2048 {
            let mut ages: Vec<(String, Instant)> =
                cache.iter().map(|(k, e)| (k.clone(), e.at)).collect();
            ages.sort_by_key(|(_, at)| *at);
            for (k, _) in ages.into_iter().take(1024) {
                cache.remove(&k);
            }
        }
        cache.insert(key, CacheEntry { at: Instant::now(), data });
    }

    /// Wait out the per-host minimum request gap; returns the active host
    /// backoff deadline, if any.
    async fn pace_host(&self, host: &str) -> Option<Instant> {
        let min_gap = Duration::from_millis(self.cfg.min_gap_ms);
        loop {
            let wait = {
                let mut hosts = self.hosts.lock();
                let state = hosts.entry(host.to_string()).or_insert(HostState {
                    last_request: None,
                    backoff_until: None,
                });
                if let Some(until) = state.backoff_until {
                    if until > Instant::now() {
                        return Some(until);
                    }
                    state.backoff_until = None;
                }
                match state.last_request {
                    Some(last) if last.elapsed() < min_gap => Some(min_gap - last.elapsed()),
                    _ => {
                        state.last_request = Some(Instant::now());
                        None
                    }
                }
            };
            match wait {
                Some(d) => tokio::time::sleep(d).await,
                None => return None,
            }
        }
    }

    fn escalate_host_backoff(&self, host: &str, backoff: Duration) {
        let mut hosts = self.hosts.lock();
        let state = hosts.entry(host.to_string()).or_insert(HostState {
            last_request: None,
            backoff_until: None,
        });
        let candidate = Instant::now() + backoff;
        state.backoff_until = Some(match state.backoff_until {
            Some(existing) if existing > candidate => existing,
            _ => candidate,
        });
    }

    /// GET a JSON payload with pacing, retries and stale-cache fallback.
    pub async fn get_json(
        &self,
        url: &str,
        params: &[(&str, String)],
        cache_ttl: Option<Duration>,
        stale_ttl: Option<Duration>,
    ) -> Result<Value> {
        let cache_ttl =
            cache_ttl.unwrap_or_else(|| Duration::from_secs_f64(self.cfg.cache_ttl_s));
        let stale_ttl =
            stale_ttl.unwrap_or_else(|| Duration::from_secs_f64(self.cfg.stale_ttl_s));
        let key = Self::cache_key(url, params);

        if let Some(v) = self.cached_within(&key, cache_ttl) {
            return Ok(v);
        }

        let host = Self::host_of(url);
        if let Some(until) = self.pace_host(&host).await {
            if let Some(v) = self.cached_within(&key, stale_ttl) {
                debug!(host = %host, "host backoff active, serving stale cache");
                return Ok(v);
            }
            return Err(anyhow!(
                "host backoff active for {} ({}s left)",
                host,
                until.saturating_duration_since(Instant::now()).as_secs()
            ));
        }

        let attempts = self.cfg.retries_429.max(self.cfg.retries_5xx) + 1;
        let mut last_err: Option<anyhow::Error> = None;

        for attempt in 0..attempts {
            let request = self.client.get(url).query(
                &params
                    .iter()
                    .map(|(k, v)| (*k, v.as_str()))
                    .collect::<Vec<_>>(),
            );
            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.as_u16() == 429 {
                        let retry_after = resp
                            .headers()
                            .get("retry-after")
                            .and_then(|h| h.to_str().ok())
                            .and_then(|s| s.parse::<f64>().ok())
                            .unwrap_or(2.0)
                            .max(1.0);
                        let jitter: f64 = rand::thread_rng().gen_range(0.05..0.35);
                        let backoff = Duration::from_secs_f64(
                            (retry_after + 0.35 * attempt as f64 + jitter).min(90.0),
                        );
                        self.escalate_host_backoff(&host, backoff);
                        if attempt + 1 < attempts && attempt < self.cfg.retries_429 {
                            tokio::time::sleep(backoff).await;
                            continue;
                        }
                        if let Some(v) = self.cached_within(&key, stale_ttl) {
                            warn!(host = %host, "429, serving stale cache");
                            return Ok(v);
                        }
                        return Err(anyhow!("http 429 {url}"));
                    }
                    if status.is_server_error() && attempt < self.cfg.retries_5xx {
                        tokio::time::sleep(Duration::from_millis(250 + 250 * attempt as u64))
                            .await;
                        continue;
                    }
                    if !status.is_success() {
                        if let Some(v) = self.cached_within(&key, stale_ttl) {
                            return Ok(v);
                        }
                        return Err(anyhow!("http {} {}", status, url));
                    }
                    let data: Value = resp
                        .json()
                        .await
                        .with_context(|| format!("invalid JSON from {url}"))?;
                    self.store_cache(key, data.clone());
                    return Ok(data);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    if attempt + 1 < attempts {
                        tokio::time::sleep(Duration::from_millis(200 + 150 * attempt as u64))
                            .await;
                        continue;
                    }
                }
            }
        }

        if let Some(v) = self.cached_within(&key, stale_ttl) {
            return Ok(v);
        }
        Err(anyhow!(
            "http get failed: {url} err={:?}",
            last_err.map(|e| e.to_string())
        ))
    }
}

/// Run futures with at most `limit` in flight, preserving input order.
pub async fn gather_bounded<T, Fut>(futs: Vec<Fut>, limit: usize) -> Vec<T>
where
    Fut: std::future::Future<Output = T>,
{
    use futures_util::stream::{self, StreamExt};
    stream::iter(futs)
        .buffered(limit.max(1))
        .collect::<Vec<T>>()
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cfg() -> HttpConfig {
        HttpConfig {
            min_gap_ms: 0,
            retries_429: 1,
            retries_5xx: 1,
            cache_ttl_s: 1.0,
            stale_ttl_s: 30.0,
            timeout_s: 2,
            bounded_inflight: 4,
        }
    }

    #[test]
    fn cache_key_includes_params() {
        let a = HttpService::cache_key("https://x/y", &[("u", "1".into())]);
        let b = HttpService::cache_key("https://x/y", &[("u", "2".into())]);
        assert_ne!(a, b);
    }

    #[test]
    fn host_extraction() {
        assert_eq!(
            HttpService::host_of("https://data-api.example.com/positions?user=0x1"),
            "data-api.example.com"
        );
    }

    #[tokio::test]
    async fn gather_bounded_preserves_order() {
        let futs: Vec<_> = (0..10)
            .map(|i| async move {
                tokio::time::sleep(Duration::from_millis((10 - i) as u64)).await;
                i
            })
            .collect();
        let out = gather_bounded(futs, 3).await;
        assert_eq!(out, (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn stale_cache_survives_backoff() {
        let svc = HttpService::new(test_cfg()).unwrap();
        svc.store_cache("k".into(), serde_json::json!({"v": 1}));
        let v = svc.cached_within("k", Duration::from_secs(30)).unwrap();
        assert_eq!(v["v"], 1);
        assert!(svc.cached_within("k", Duration::from_millis(0)).is_none());
    }
}
