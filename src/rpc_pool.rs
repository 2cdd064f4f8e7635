//! RPC endpoint pool with latency-based selection.
//!
//! Holds one HTTP provider per configured endpoint and keeps the fastest as
//! the active one. A periodic prober measures median request latency per
//! endpoint and atomically swaps the active provider when an alternative
//! beats it by a configured margin.

use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

struct Endpoint {
    url: String,
    provider: DynProvider,
}

pub struct RpcPool {
    endpoints: Vec<Endpoint>,
    active_idx: ArcSwap<usize>,
}

impl RpcPool {
    pub fn new(urls: &[String]) -> Result<Arc<Self>> {
        anyhow::ensure!(!urls.is_empty(), "at least one RPC url required");
        let mut endpoints = Vec::with_capacity(urls.len());
        for url in urls {
            let parsed: reqwest::Url = url.parse().with_context(|| format!("invalid RPC url {url}"))?;
            let provider = ProviderBuilder::new().connect_http(parsed).erased();
            endpoints.push(Endpoint {
                url: url.clone(),
                provider,
            });
        }
        Ok(Arc::new(Self {
            endpoints,
            active_idx: ArcSwap::from_pointee(0),
        }))
    }

    pub fn provider(&self) -> DynProvider {
        let idx = **self.active_idx.load();
        self.endpoints[idx].provider.clone()
    }

    pub fn active_url(&self) -> &str {
        let idx = **self.active_idx.load();
        &self.endpoints[idx].url
    }

    /// Median of `samples` block-number round trips; None when every probe
    /// fails.
    async fn probe(&self, idx: usize, samples: usize) -> Option<f64> {
        let mut latencies = Vec::with_capacity(samples);
        for _ in 0..samples {
            let started = Instant::now();
            match tokio::time::timeout(
                Duration::from_secs(4),
                self.endpoints[idx].provider.get_block_number(),
            )
            .await
            {
                Ok(Ok(_)) => latencies.push(started.elapsed().as_secs_f64() * 1000.0),
                _ => {}
            }
        }
        if latencies.is_empty() {
            return None;
        }
        latencies.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        Some(latencies[latencies.len() / 2])
    }

    /// Supervised loop body: probe all endpoints, swap the active one when a
    /// candidate is faster by `swap_margin_ms`.
    pub async fn probe_loop(
        self: Arc<Self>,
        interval: Duration,
        swap_margin_ms: f64,
    ) -> Result<()> {
        if self.endpoints.len() < 2 {
            // Nothing to optimize; park forever so the supervisor stays quiet.
            loop {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
        }
        let mut tick = tokio::time::interval(interval);
        loop {
            tick.tick().await;
            let current = **self.active_idx.load();
            let mut best_idx = current;
            let mut best_ms = f64::MAX;
            let mut current_ms = f64::MAX;
            for idx in 0..self.endpoints.len() {
                match self.probe(idx, 3).await {
                    Some(ms) => {
                        debug!(url = %self.endpoints[idx].url, ms, "rpc probe");
                        if idx == current {
                            current_ms = ms;
                        }
                        if ms < best_ms {
                            best_ms = ms;
                            best_idx = idx;
                        }
                    }
                    None => warn!(url = %self.endpoints[idx].url, "rpc probe failed"),
                }
            }
            if best_idx != current && best_ms + swap_margin_ms < current_ms {
                info!(
                    from = %self.endpoints[current].url,
                    to = %self.endpoints[best_idx].url,
                    best_ms,
                    current_ms,
                    "swapping active RPC endpoint"
                );
                self.active_idx.store(Arc::new(best_idx));
            }
        }
    }
}
