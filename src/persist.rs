//! Overwrite-style persisted state.
//!
//! Small JSON files under the data dir, written atomically (temp file +
//! rename). These are what make restarts idempotent: pending fills, the
//! seen-CID ring, adaptive stats, finalized settlements and the market
//! metadata cache all survive the process.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::models::{Position, Round};
use crate::stats::{StatsEngine, TradeOutcome};

pub struct StateStore {
    dir: PathBuf,
    io: Mutex<()>,
}

impl StateStore {
    pub fn new(dir: impl AsRef<Path>) -> Result<std::sync::Arc<Self>> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("cannot create data dir {}", dir.display()))?;
        Ok(std::sync::Arc::new(Self {
            dir,
            io: Mutex::new(()),
        }))
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    fn write_json<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        let _guard = self.io.lock();
        let path = self.path(name);
        let tmp = self.path(&format!("{name}.tmp"));
        let data = serde_json::to_vec_pretty(value).context("serialize state")?;
        std::fs::write(&tmp, data)
            .with_context(|| format!("write {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
        Ok(())
    }

    fn read_json<T: DeserializeOwned>(&self, name: &str) -> Option<T> {
        let path = self.path(name);
        let data = std::fs::read(&path).ok()?;
        match serde_json::from_slice(&data) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(file = %path.display(), error = %e, "corrupt state file ignored");
                None
            }
        }
    }

    // -- pending positions (cid -> position) --------------------------------

    pub fn save_pending(&self, pending: &HashMap<String, Position>) -> Result<()> {
        self.write_json("pending.json", pending)
    }

    pub fn load_pending(&self) -> HashMap<String, Position> {
        self.read_json("pending.json").unwrap_or_default()
    }

    // -- seen-CID ring ------------------------------------------------------

    pub fn save_seen(&self, seen: &[String]) -> Result<()> {
        self.write_json("seen_cids.json", &seen)
    }

    pub fn load_seen(&self) -> Vec<String> {
        self.read_json("seen_cids.json").unwrap_or_default()
    }

    // -- adaptive stats -----------------------------------------------------

    pub fn save_stats(&self, stats: &StatsEngine) -> Result<()> {
        self.write_json("stats.json", stats)
    }

    pub fn load_stats(&self) -> StatsEngine {
        self.read_json("stats.json").unwrap_or_default()
    }

    // -- settled outcomes (cid -> finalized ts), rolling window -------------

    pub fn save_settled(&self, settled: &HashMap<String, i64>) -> Result<()> {
        self.write_json("settled.json", settled)
    }

    pub fn load_settled(&self, retention_s: i64, now_ts: i64) -> HashMap<String, i64> {
        let mut map: HashMap<String, i64> = self.read_json("settled.json").unwrap_or_default();
        let before = map.len();
        map.retain(|_, ts| now_ts - *ts <= retention_s);
        if map.len() != before {
            debug!(pruned = before - map.len(), "settled cache pruned on load");
        }
        map
    }

    // -- P&L baseline -------------------------------------------------------

    pub fn save_baseline(&self, equity: f64) -> Result<()> {
        self.write_json("baseline.json", &equity)
    }

    pub fn load_baseline(&self) -> Option<f64> {
        self.read_json("baseline.json")
    }

    // -- market metadata cache ---------------------------------------------

    pub fn save_market_cache(&self, rounds: &[Round]) -> Result<()> {
        self.write_json("markets_cache.json", &rounds)
    }

    pub fn load_market_cache(&self) -> Vec<Round> {
        self.read_json("markets_cache.json").unwrap_or_default()
    }

    // -- per-entry trade metadata (cid -> outcome skeleton) -----------------
    //
    // Settlement needs the original score/entry/stake to attribute realized
    // P&L into the right adaptive bucket after a restart.

    pub fn save_entry_meta(&self, meta: &HashMap<String, TradeOutcome>) -> Result<()> {
        self.write_json("entry_meta.json", meta)
    }

    pub fn load_entry_meta(&self) -> HashMap<String, TradeOutcome> {
        self.read_json("entry_meta.json").unwrap_or_default()
    }

    // -- leader ranking (read-only input) -----------------------------------

    pub fn load_leaders(&self) -> HashMap<String, f64> {
        self.read_json("leaders.json").unwrap_or_default()
    }
}
