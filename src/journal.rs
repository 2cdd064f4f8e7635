//! Metrics journal: append-only JSONL for every lifecycle event, plus a
//! SQLite (WAL) mirror of RESOLVE rows for efficient dashboard queries.
//! Replaying the JSONL through the stats engine reproduces live counters.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

use crate::models::{Asset, RoundDuration, Side};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "ENTRY")]
    Entry,
    #[serde(rename = "FILL")]
    Fill,
    #[serde(rename = "RESOLVE")]
    Resolve,
    #[serde(rename = "RESOLVE-BACKFILL")]
    ResolveBackfill,
    #[serde(rename = "QUEUE_REDEEM")]
    QueueRedeem,
    #[serde(rename = "SKIP")]
    Skip,
    #[serde(rename = "EXEC")]
    Exec,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Entry => "ENTRY",
            EventKind::Fill => "FILL",
            EventKind::Resolve => "RESOLVE",
            EventKind::ResolveBackfill => "RESOLVE-BACKFILL",
            EventKind::QueueRedeem => "QUEUE_REDEEM",
            EventKind::Skip => "SKIP",
            EventKind::Exec => "EXEC",
        }
    }

    pub fn is_resolve(&self) -> bool {
        matches!(self, EventKind::Resolve | EventKind::ResolveBackfill)
    }
}

/// One journal row. Optional fields stay out of the JSONL when unset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalRow {
    pub ts: i64,
    pub event: EventKind,
    pub cid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub asset: Option<Asset>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub side: Option<Side>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<RoundDuration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_usdc: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fill_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slip_bps: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pnl: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub round_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub open_price_source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oracle_age_s: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
}

impl JournalRow {
    pub fn new(ts: i64, event: EventKind, cid: impl Into<String>) -> Self {
        Self {
            ts,
            event,
            cid: cid.into(),
            asset: None,
            side: None,
            duration: None,
            score: None,
            entry_price: None,
            size_usdc: None,
            fill_price: None,
            slip_bps: None,
            latency_ms: None,
            pnl: None,
            result: None,
            reason: None,
            round_key: None,
            open_price_source: None,
            oracle_age_s: None,
            tx_hash: None,
        }
    }
}

pub struct MetricsJournal {
    jsonl_path: PathBuf,
    file: Mutex<std::fs::File>,
    db: Mutex<Connection>,
}

impl MetricsJournal {
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Arc<Self>> {
        let dir = data_dir.as_ref();
        std::fs::create_dir_all(dir).context("cannot create data dir")?;
        let jsonl_path = dir.join("metrics.jsonl");
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&jsonl_path)
            .with_context(|| format!("cannot open {}", jsonl_path.display()))?;

        let db = Connection::open(dir.join("metrics.db")).context("cannot open metrics db")?;
        db.pragma_update(None, "journal_mode", "WAL")
            .context("cannot enable WAL")?;
        db.execute_batch(
            "CREATE TABLE IF NOT EXISTS resolves (
                ts INTEGER NOT NULL,
                event TEXT NOT NULL,
                condition_id TEXT NOT NULL,
                asset TEXT,
                side TEXT,
                duration INTEGER,
                score INTEGER,
                entry_price REAL,
                size_usdc REAL,
                pnl REAL,
                result TEXT,
                round_key TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_resolves_ts ON resolves(ts);
            CREATE INDEX IF NOT EXISTS idx_resolves_cid ON resolves(condition_id);
            CREATE INDEX IF NOT EXISTS idx_resolves_event ON resolves(event);",
        )
        .context("cannot create resolves schema")?;

        Ok(Arc::new(Self {
            jsonl_path,
            file: Mutex::new(file),
            db: Mutex::new(db),
        }))
    }

    /// Append one event. RESOLVE rows are mirrored into SQLite.
    pub fn emit(&self, row: &JournalRow) {
        match serde_json::to_string(row) {
            Ok(line) => {
                let mut file = self.file.lock();
                if let Err(e) = writeln!(file, "{line}") {
                    warn!(error = %e, "journal append failed");
                }
            }
            Err(e) => warn!(error = %e, "journal serialize failed"),
        }

        if row.event.is_resolve() {
            let db = self.db.lock();
            let res = db.execute(
                "INSERT INTO resolves
                 (ts, event, condition_id, asset, side, duration, score,
                  entry_price, size_usdc, pnl, result, round_key)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                rusqlite::params![
                    row.ts,
                    row.event.as_str(),
                    row.cid,
                    row.asset.map(|a| a.as_str()),
                    row.side.map(|s| s.as_str()),
                    row.duration.map(|d| d.minutes()),
                    row.score,
                    row.entry_price,
                    row.size_usdc,
                    row.pnl,
                    row.result,
                    row.round_key,
                ],
            );
            if let Err(e) = res {
                warn!(error = %e, "resolve db insert failed");
            }
        }
    }

    /// Read every journal row back, skipping unparseable lines. Used for
    /// stats replay on restart and in tests.
    pub fn read_all(&self) -> Result<Vec<JournalRow>> {
        let file = std::fs::File::open(&self.jsonl_path)
            .with_context(|| format!("cannot read {}", self.jsonl_path.display()))?;
        let reader = std::io::BufReader::new(file);
        let mut rows = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<JournalRow>(&line) {
                Ok(row) => rows.push(row),
                Err(e) => warn!(error = %e, "skipping bad journal line"),
            }
        }
        Ok(rows)
    }

    pub fn resolve_count(&self) -> Result<i64> {
        let db = self.db.lock();
        let n: i64 = db.query_row("SELECT COUNT(*) FROM resolves", [], |r| r.get(0))?;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn journal() -> (tempfile::TempDir, Arc<MetricsJournal>) {
        let dir = tempfile::tempdir().unwrap();
        let j = MetricsJournal::open(dir.path()).unwrap();
        (dir, j)
    }

    fn resolve_row(ts: i64, pnl: f64) -> JournalRow {
        let mut row = JournalRow::new(ts, EventKind::Resolve, format!("cid{ts}"));
        row.asset = Some(Asset::Btc);
        row.side = Some(Side::Up);
        row.duration = Some(RoundDuration::M15);
        row.score = Some(12);
        row.entry_price = Some(0.55);
        row.size_usdc = Some(10.0);
        row.pnl = Some(pnl);
        row.result = Some(if pnl > 0.0 { "WIN" } else { "LOSS" }.into());
        row
    }

    #[test]
    fn jsonl_round_trips() {
        let (_dir, j) = journal();
        j.emit(&resolve_row(1_000, 8.2));
        let mut entry = JournalRow::new(1_001, EventKind::Entry, "cid-e");
        entry.reason = Some("maker".into());
        j.emit(&entry);

        let rows = j.read_all().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].event, EventKind::Resolve);
        assert_eq!(rows[1].cid, "cid-e");
    }

    #[test]
    fn resolves_mirrored_to_sqlite() {
        let (_dir, j) = journal();
        j.emit(&resolve_row(1_000, 8.2));
        j.emit(&resolve_row(1_001, -5.0));
        // Non-resolve events do not land in the DB.
        j.emit(&JournalRow::new(1_002, EventKind::Skip, "cid-s"));
        assert_eq!(j.resolve_count().unwrap(), 2);
    }

    #[test]
    fn replay_through_stats_matches_live() {
        let (_dir, j) = journal();
        for i in 0..10 {
            j.emit(&resolve_row(1_000 + i, if i % 2 == 0 { 9.0 } else { -10.0 }));
        }
        let rows = j.read_all().unwrap();
        let mut replayed = crate::stats::StatsEngine::new();
        for row in rows.iter().filter(|r| r.event.is_resolve()) {
            replayed.record_outcome(
                crate::stats::TradeOutcome {
                    ts: row.ts,
                    cid: row.cid.clone(),
                    asset: row.asset.unwrap(),
                    duration: row.duration.unwrap(),
                    side: row.side.unwrap(),
                    entry: row.entry_price.unwrap(),
                    score: row.score.unwrap(),
                    stake: row.size_usdc.unwrap(),
                    pnl: row.pnl.unwrap(),
                    win: row.pnl.unwrap() > 0.0,
                },
                36 * 3600,
                3,
                3600,
            );
        }
        assert_eq!(replayed.total_wins, 5);
        assert_eq!(replayed.total_losses, 5);
    }

    #[test]
    fn corrupt_lines_are_skipped() {
        let (dir, j) = journal();
        j.emit(&resolve_row(1_000, 1.0));
        std::fs::OpenOptions::new()
            .append(true)
            .open(dir.path().join("metrics.jsonl"))
            .unwrap()
            .write_all(b"{garbage\n")
            .unwrap();
        j.emit(&resolve_row(1_001, 1.0));
        assert_eq!(j.read_all().unwrap().len(), 2);
    }
}
