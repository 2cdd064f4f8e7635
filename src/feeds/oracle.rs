//! Settlement-oracle price feed.
//!
//! The venue resolves rounds against an on-chain price oracle, so this feed
//! is authoritative for direction and for the round-open reference price.
//! Two transports run in parallel: a websocket log subscription on the
//! aggregator contracts and a polled `latestRoundData` RPC call. Whichever
//! observation carries the newer `updated_at` wins.

use alloy::primitives::Address;
use alloy::providers::{Provider, ProviderBuilder, WsConnect};
use alloy::rpc::types::Filter;
use alloy::sol;
use alloy::sol_types::SolEvent;
use anyhow::{Context, Result};
use futures_util::StreamExt;
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::models::Asset;
use crate::rpc_pool::RpcPool;

sol! {
    #[sol(rpc)]
    interface IAggregator {
        event AnswerUpdated(int256 indexed current, uint256 indexed roundId, uint256 updatedAt);

        function latestRoundData()
            external
            view
            returns (uint80 roundId, int256 answer, uint256 startedAt, uint256 updatedAt, uint80 answeredInRound);
    }
}

/// USD aggregators report 8 decimals.
const ANSWER_DECIMALS: f64 = 1e8;

#[derive(Debug, Clone, Copy)]
pub struct OracleObs {
    pub price: f64,
    pub updated_at: i64,
    pub round_id: u128,
}

#[derive(Debug, Clone)]
pub struct OracleUpdate {
    pub asset: Asset,
    pub obs: OracleObs,
}

#[derive(Default)]
struct AssetState {
    latest: Option<OracleObs>,
    /// (updated_at, price) ring for round-open reference lookups.
    history: VecDeque<(i64, f64)>,
}

pub struct OracleFeed {
    aggregators: Vec<(Asset, Address)>,
    rpc: Arc<RpcPool>,
    state: RwLock<HashMap<Asset, AssetState>>,
    update_tx: broadcast::Sender<OracleUpdate>,
}

impl OracleFeed {
    pub fn new(aggregators: &[(Asset, String)], rpc: Arc<RpcPool>) -> Result<Arc<Self>> {
        let mut parsed = Vec::with_capacity(aggregators.len());
        for (asset, addr) in aggregators {
            let address: Address = addr
                .parse()
                .with_context(|| format!("invalid aggregator address for {asset}: {addr}"))?;
            parsed.push((*asset, address));
        }
        let (update_tx, _) = broadcast::channel(256);
        Ok(Arc::new(Self {
            aggregators: parsed,
            rpc,
            state: RwLock::new(HashMap::new()),
            update_tx,
        }))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OracleUpdate> {
        self.update_tx.subscribe()
    }

    pub fn latest(&self, asset: Asset) -> Option<OracleObs> {
        self.state.read().get(&asset)?.latest
    }

    /// Age in seconds of the freshest observation, by oracle timestamp.
    pub fn age_s(&self, asset: Asset, now_ts: i64) -> Option<f64> {
        let obs = self.latest(asset)?;
        Some((now_ts - obs.updated_at).max(0) as f64)
    }

    /// Oracle observation closest to `target_ts`.
    /// Returns `(price, is_exact)`; exact means within 2s of the boundary.
    pub fn observation_near(
        &self,
        asset: Asset,
        target_ts: i64,
        tolerance_s: i64,
    ) -> Option<(f64, bool)> {
        let state = self.state.read();
        let s = state.get(&asset)?;
        let mut best: Option<(i64, f64)> = None;
        let mut best_abs = i64::MAX;
        for (ts, price) in s.history.iter() {
            let abs = (ts - target_ts).abs();
            if abs <= tolerance_s && abs < best_abs {
                best_abs = abs;
                best = Some((*ts, *price));
            }
        }
        best.map(|(_, price)| (price, best_abs <= 2))
    }

    /// Newer-wins merge from either transport.
    pub fn apply_obs(&self, asset: Asset, obs: OracleObs) {
        let accepted = {
            let mut state = self.state.write();
            let s = state.entry(asset).or_default();
            let newer = s
                .latest
                .map(|prev| obs.updated_at > prev.updated_at)
                .unwrap_or(true);
            if newer {
                s.latest = Some(obs);
                let push = match s.history.back() {
                    Some((ts, _)) => *ts != obs.updated_at,
                    None => true,
                };
                if push {
                    s.history.push_back((obs.updated_at, obs.price));
                    while s.history.len() > 900 {
                        s.history.pop_front();
                    }
                }
            }
            newer
        };
        if accepted {
            let _ = self.update_tx.send(OracleUpdate { asset, obs });
        }
    }

    async fn poll_once(&self, asset: Asset, address: Address) -> Result<()> {
        let provider = self.rpc.provider();
        let agg = IAggregator::new(address, provider);
        let ret = agg
            .latestRoundData()
            .call()
            .await
            .with_context(|| format!("latestRoundData failed for {asset}"))?;

        let answer: i128 = i128::try_from(ret.answer).unwrap_or(0);
        let price = answer as f64 / ANSWER_DECIMALS;
        if !(price.is_finite() && price > 0.0) {
            anyhow::bail!("non-positive oracle answer for {asset}");
        }
        let updated_at = u64::try_from(ret.updatedAt).unwrap_or(0) as i64;
        let round_id: u128 = ret.roundId.to::<u128>();

        self.apply_obs(
            asset,
            OracleObs {
                price,
                updated_at,
                round_id,
            },
        );
        Ok(())
    }

    /// Supervised loop body: poll every aggregator on a fixed cadence.
    pub async fn run_poller(self: Arc<Self>, poll_interval: Duration) -> Result<()> {
        loop {
            for (asset, address) in self.aggregators.clone() {
                if let Err(e) = self.poll_once(asset, address).await {
                    warn!(asset = %asset, error = %format!("{e:#}"), "oracle poll failed");
                }
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Supervised loop body: websocket log subscription on `AnswerUpdated`.
    /// Errors bubble to the supervisor which restarts after cooldown.
    pub async fn run_ws(self: Arc<Self>, ws_url: String) -> Result<()> {
        let provider = ProviderBuilder::new()
            .connect_ws(WsConnect::new(ws_url.clone()))
            .await
            .context("oracle ws connect failed")?;

        let addresses: Vec<Address> = self.aggregators.iter().map(|(_, a)| *a).collect();
        let by_address: HashMap<Address, Asset> =
            self.aggregators.iter().map(|(a, addr)| (*addr, *a)).collect();

        let filter = Filter::new()
            .address(addresses)
            .event(IAggregator::AnswerUpdated::SIGNATURE);
        let sub = provider
            .subscribe_logs(&filter)
            .await
            .context("oracle log subscription failed")?;
        let mut stream = sub.into_stream();
        debug!(url = %ws_url, "oracle ws subscribed");

        while let Some(log) = stream.next().await {
            let Some(asset) = by_address.get(&log.address()).copied() else {
                continue;
            };
            match IAggregator::AnswerUpdated::decode_log(&log.inner) {
                Ok(ev) => {
                    let answer: i128 = i128::try_from(ev.current).unwrap_or(0);
                    let price = answer as f64 / ANSWER_DECIMALS;
                    if !(price.is_finite() && price > 0.0) {
                        continue;
                    }
                    let updated_at = u64::try_from(ev.updatedAt).unwrap_or(0) as i64;
                    let round_id: u128 = ev.roundId.to::<u128>();
                    self.apply_obs(
                        asset,
                        OracleObs {
                            price,
                            updated_at,
                            round_id,
                        },
                    );
                }
                Err(e) => warn!(error = %e, "undecodable oracle log"),
            }
        }
        anyhow::bail!("oracle ws stream ended")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed() -> Arc<OracleFeed> {
        let rpc = RpcPool::new(&["http://127.0.0.1:1".to_string()]).unwrap();
        OracleFeed::new(
            &[(Asset::Btc, "0xc907E116054Ad103354f2D350FD2514433D57F6f".to_string())],
            rpc,
        )
        .unwrap()
    }

    #[test]
    fn newer_updated_at_wins() {
        let f = feed();
        f.apply_obs(
            Asset::Btc,
            OracleObs {
                price: 60_000.0,
                updated_at: 100,
                round_id: 1,
            },
        );
        f.apply_obs(
            Asset::Btc,
            OracleObs {
                price: 59_000.0,
                updated_at: 90,
                round_id: 2,
            },
        );
        let latest = f.latest(Asset::Btc).unwrap();
        assert_eq!(latest.updated_at, 100);
        assert!((latest.price - 60_000.0).abs() < 1e-9);
    }

    #[test]
    fn observation_near_reports_exactness() {
        let f = feed();
        for ts in [95_i64, 100, 107] {
            f.apply_obs(
                Asset::Btc,
                OracleObs {
                    price: 60_000.0 + ts as f64,
                    updated_at: ts,
                    round_id: ts as u128,
                },
            );
        }
        let (price, exact) = f.observation_near(Asset::Btc, 100, 10).unwrap();
        assert!((price - 60_100.0).abs() < 1e-9);
        assert!(exact);

        let (price2, exact2) = f.observation_near(Asset::Btc, 104, 10).unwrap();
        assert!((price2 - 60_107.0).abs() < 1e-9);
        assert!(!exact2);

        assert!(f.observation_near(Asset::Btc, 500, 10).is_none());
    }

    #[test]
    fn age_is_measured_from_oracle_timestamp() {
        let f = feed();
        f.apply_obs(
            Asset::Btc,
            OracleObs {
                price: 60_000.0,
                updated_at: 1_000,
                round_id: 1,
            },
        );
        assert_eq!(f.age_s(Asset::Btc, 1_012).unwrap(), 12.0);
    }
}
