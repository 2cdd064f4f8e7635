//! Adaptive learning state: bucket counters, rolling outcome rings and the
//! derived scalers the scorer consumes (probability shrinkage, Kelly
//! scaling, adaptive EV/payout floors, side and entry-band priors).
//!
//! All mutation funnels through `record_fill` / `record_outcome`, so
//! replaying the resolve journal reproduces identical counters.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

use crate::models::{Asset, BucketKey, BucketStat, RoundDuration, Side};

/// Wilson score lower bound at z=1.96 (95%).
pub fn wilson_lower_bound(wins: u64, n: u64) -> f64 {
    if n == 0 {
        return 0.5;
    }
    let z = 1.96_f64;
    let n_f = n as f64;
    let p = wins as f64 / n_f;
    let z2 = z * z;
    let denom = 1.0 + z2 / n_f;
    let center = p + z2 / (2.0 * n_f);
    let margin = z * ((p * (1.0 - p) + z2 / (4.0 * n_f)) / n_f).sqrt();
    ((center - margin) / denom).clamp(0.0, 1.0)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeOutcome {
    pub ts: i64,
    pub cid: String,
    pub asset: Asset,
    pub duration: RoundDuration,
    pub side: Side,
    pub entry: f64,
    pub score: i32,
    pub stake: f64,
    pub pnl: f64,
    pub win: bool,
}

/// Per-(asset, duration, side) prior derived from recent settled outcomes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SideProfile {
    pub n: u32,
    pub expectancy: f64,
    pub wr_lb: f64,
    pub score_adj: i32,
    pub edge_adj: f64,
    pub prob_adj: f64,
}

/// Per-(asset, duration, side, entry-band) quality profile.
#[derive(Debug, Clone, Copy, Default)]
pub struct EntryBandProfile {
    pub n: u32,
    pub expectancy: f64,
    pub wr_lb: f64,
    pub profit_factor: f64,
    pub score_adj: i32,
    pub edge_adj: f64,
    pub prob_adj: f64,
    pub size_mult: f64,
}

/// Rolling per-duration profile feeding the dynamic 15m floors.
#[derive(Debug, Clone, Copy)]
pub struct RollingProfile {
    pub n: u32,
    pub expectancy: f64,
    pub wr_lb: f64,
    pub prob_add: f64,
    pub ev_add: f64,
    pub size_mult: f64,
}

impl Default for RollingProfile {
    fn default() -> Self {
        Self {
            n: 0,
            expectancy: 0.0,
            wr_lb: 0.5,
            prob_add: 0.0,
            ev_add: 0.0,
            size_mult: 1.0,
        }
    }
}

/// Cold-start execution penalty defaults, per duration.
const COLD_SLIP_BPS_5M: f64 = 60.0;
const COLD_SLIP_BPS_15M: f64 = 40.0;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatsEngine {
    pub buckets: HashMap<String, BucketStat>,
    /// Recent win/loss ring, newest last.
    pub recent_wins: VecDeque<bool>,
    /// Settled outcomes within the retention window.
    pub outcomes: VecDeque<TradeOutcome>,
    pub consecutive_losses: u32,
    pub last_superbet_ts: i64,
    pub booster_lock_until_ts: i64,
    pub total_wins: u64,
    pub total_losses: u64,
    pub total_pnl: f64,
}

impl StatsEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_fill(&mut self, key: BucketKey, slip_bps: f64) {
        let b = self.buckets.entry(key.label()).or_default();
        b.fills += 1;
        b.slip_bps_sum += slip_bps.max(0.0);
    }

    /// Fold one settled outcome into every adaptive layer. Also drives the
    /// booster loss-streak lock.
    pub fn record_outcome(
        &mut self,
        outcome: TradeOutcome,
        retention_s: i64,
        booster_loss_streak_lock: u32,
        booster_lock_s: i64,
    ) {
        let key = BucketKey::new(outcome.duration, outcome.score, outcome.entry);
        let b = self.buckets.entry(key.label()).or_default();
        b.outcomes += 1;
        b.pnl += outcome.pnl;
        if outcome.win {
            b.wins += 1;
            b.gross_win += outcome.pnl.max(0.0);
        } else {
            b.gross_loss += (-outcome.pnl).max(0.0);
        }

        if outcome.win {
            self.total_wins += 1;
            self.consecutive_losses = 0;
        } else {
            self.total_losses += 1;
            self.consecutive_losses += 1;
            if booster_loss_streak_lock > 0
                && self.consecutive_losses >= booster_loss_streak_lock
            {
                self.booster_lock_until_ts = outcome.ts + booster_lock_s;
            }
        }
        self.total_pnl += outcome.pnl;

        self.recent_wins.push_back(outcome.win);
        while self.recent_wins.len() > 200 {
            self.recent_wins.pop_front();
        }

        let horizon = outcome.ts - retention_s;
        self.outcomes.push_back(outcome);
        while self
            .outcomes
            .front()
            .map(|o| o.ts < horizon)
            .unwrap_or(false)
        {
            self.outcomes.pop_front();
        }
    }

    pub fn bucket(&self, key: &BucketKey) -> Option<&BucketStat> {
        self.buckets.get(&key.label())
    }

    pub fn last3_wins(&self) -> Option<u32> {
        if self.recent_wins.len() < 3 {
            return None;
        }
        Some(
            self.recent_wins
                .iter()
                .rev()
                .take(3)
                .filter(|w| **w)
                .count() as u32,
        )
    }

    fn recent_stats(&self, n: usize) -> (usize, f64) {
        let take = self.recent_wins.len().min(n);
        if take == 0 {
            return (0, 0.5);
        }
        let wins = self
            .recent_wins
            .iter()
            .rev()
            .take(take)
            .filter(|w| **w)
            .count();
        (take, wins as f64 / take as f64)
    }

    /// Online-calibration shrink toward 0.5 driven by recent realized win
    /// rate. 1.0 = no shrink.
    pub fn prob_shrink_factor(&self) -> f64 {
        let (n, wr) = self.recent_stats(30);
        if n < 15 {
            return 1.0;
        }
        (0.6 + 0.8 * wr).clamp(0.72, 1.0)
    }

    /// Kelly scale from recent realized win rate.
    pub fn wr_bet_scale(&self) -> f64 {
        let (n, wr) = self.recent_stats(30);
        if n < 10 {
            return 1.0;
        }
        if wr >= 0.60 {
            1.15
        } else if wr >= 0.50 {
            1.0
        } else if wr >= 0.40 {
            0.80
        } else {
            0.60
        }
    }

    /// Bucket-quality size scale; 1.0 for cold buckets.
    pub fn bucket_size_scale(&self, duration: RoundDuration, score: i32, entry: f64) -> f64 {
        let key = BucketKey::new(duration, score, entry);
        let Some(b) = self.bucket(&key) else {
            return 1.0;
        };
        if b.outcomes < 8 {
            return 1.0;
        }
        let wr = b.win_rate().unwrap_or(0.5);
        let pf = b.profit_factor();
        if pf > 1.3 && wr > 0.55 {
            1.20
        } else if pf < 0.8 || wr < 0.40 {
            0.60
        } else {
            1.0
        }
    }

    /// Expected execution penalties `(slip_cost, nofill_penalty, fill_ratio)`
    /// in EV units, from bucket history with cold-start defaults.
    pub fn execution_penalties(
        &self,
        duration: RoundDuration,
        score: i32,
        entry: f64,
    ) -> (f64, f64, f64) {
        let key = BucketKey::new(duration, score, entry);
        let cold_slip = match duration {
            RoundDuration::M5 => COLD_SLIP_BPS_5M,
            RoundDuration::M15 => COLD_SLIP_BPS_15M,
        };
        let slip_bps = self
            .bucket(&key)
            .and_then(|b| b.avg_slip_bps())
            .unwrap_or(cold_slip);
        // Price slippage scaled to EV-at-entry terms.
        let slip_cost = (slip_bps / 10_000.0) / entry.max(0.05);

        let fills = self.bucket(&key).map(|b| b.fills).unwrap_or(0);
        let fill_ratio = 0.85 + 0.10 * ((fills as f64 / 20.0).min(1.0));
        let nofill_penalty = (1.0 - fill_ratio) * 0.06;
        (slip_cost, nofill_penalty, fill_ratio)
    }

    /// Adaptive `(min_payout_add, min_ev_add, entry_hard_cap)` drift from
    /// recent realized performance.
    pub fn adaptive_thresholds(&self, base_entry_cap: f64) -> (f64, f64, f64) {
        let (n, wr) = self.recent_stats(20);
        if n < 12 {
            return (0.0, 0.0, base_entry_cap);
        }
        if wr < 0.42 {
            (0.08, 0.008, (base_entry_cap - 0.03).max(0.40))
        } else if wr < 0.50 {
            (0.04, 0.004, (base_entry_cap - 0.015).max(0.40))
        } else if wr > 0.62 {
            (-0.03, -0.003, (base_entry_cap + 0.02).min(0.62))
        } else {
            (0.0, 0.0, base_entry_cap)
        }
    }

    fn outcome_iter<'a>(
        &'a self,
        asset: Asset,
        duration: RoundDuration,
        side: Option<Side>,
    ) -> impl Iterator<Item = &'a TradeOutcome> {
        self.outcomes.iter().filter(move |o| {
            o.asset == asset && o.duration == duration && side.map(|s| o.side == s).unwrap_or(true)
        })
    }

    /// Recent on-chain side prior for `(asset, duration, side)`.
    pub fn side_profile(&self, asset: Asset, duration: RoundDuration, side: Side) -> SideProfile {
        let rows: Vec<&TradeOutcome> = self.outcome_iter(asset, duration, Some(side)).collect();
        let n = rows.len() as u32;
        if n < 6 {
            return SideProfile {
                n,
                wr_lb: 0.5,
                ..SideProfile::default()
            };
        }
        let wins = rows.iter().filter(|o| o.win).count() as u64;
        let stake: f64 = rows.iter().map(|o| o.stake).sum();
        let pnl: f64 = rows.iter().map(|o| o.pnl).sum();
        let expectancy = if stake > 0.0 { pnl / stake } else { 0.0 };
        let wr_lb = wilson_lower_bound(wins, n as u64);

        let (score_adj, edge_adj, prob_adj) = if wr_lb < 0.40 && expectancy < 0.0 {
            (-1, -0.008, -0.020)
        } else if wr_lb < 0.46 {
            (0, -0.004, -0.010)
        } else if wr_lb > 0.58 && expectancy > 0.0 {
            (1, 0.004, 0.015)
        } else {
            (0, 0.0, 0.0)
        };
        SideProfile {
            n,
            expectancy,
            wr_lb,
            score_adj,
            edge_adj,
            prob_adj,
        }
    }

    /// Asset + entry-band quality from settled outcomes.
    pub fn entry_band_profile(
        &self,
        asset: Asset,
        duration: RoundDuration,
        side: Side,
        entry: f64,
    ) -> EntryBandProfile {
        let band = crate::models::EntryBand::from_price(entry);
        let rows: Vec<&TradeOutcome> = self
            .outcome_iter(asset, duration, Some(side))
            .filter(|o| crate::models::EntryBand::from_price(o.entry) == band)
            .collect();
        let n = rows.len() as u32;
        if n < 5 {
            return EntryBandProfile {
                n,
                wr_lb: 0.5,
                profit_factor: 1.0,
                size_mult: 1.0,
                ..EntryBandProfile::default()
            };
        }
        let wins = rows.iter().filter(|o| o.win).count() as u64;
        let stake: f64 = rows.iter().map(|o| o.stake).sum();
        let pnl: f64 = rows.iter().map(|o| o.pnl).sum();
        let gross_win: f64 = rows.iter().filter(|o| o.pnl > 0.0).map(|o| o.pnl).sum();
        let gross_loss: f64 = rows.iter().filter(|o| o.pnl < 0.0).map(|o| -o.pnl).sum();
        let expectancy = if stake > 0.0 { pnl / stake } else { 0.0 };
        let wr_lb = wilson_lower_bound(wins, n as u64);
        let pf = if gross_loss > 0.0 {
            gross_win / gross_loss
        } else if gross_win > 0.0 {
            99.0
        } else {
            1.0
        };

        let (score_adj, edge_adj, prob_adj, size_mult) = if wr_lb < 0.40 && pf < 0.8 {
            (-2, -0.010, -0.025, 0.55)
        } else if wr_lb < 0.46 || pf < 0.95 {
            (-1, -0.005, -0.012, 0.80)
        } else if wr_lb > 0.58 && pf > 1.25 {
            (1, 0.004, 0.012, 1.15)
        } else {
            (0, 0.0, 0.0, 1.0)
        };
        EntryBandProfile {
            n,
            expectancy,
            wr_lb,
            profit_factor: pf,
            score_adj,
            edge_adj,
            prob_adj,
            size_mult,
        }
    }

    /// Rolling per-duration profile for dynamic 15m floors.
    pub fn rolling_profile(&self, duration: RoundDuration) -> RollingProfile {
        let rows: Vec<&TradeOutcome> = self
            .outcomes
            .iter()
            .filter(|o| o.duration == duration)
            .collect();
        let n = rows.len() as u32;
        if n < 8 {
            return RollingProfile::default();
        }
        let wins = rows.iter().filter(|o| o.win).count() as u64;
        let stake: f64 = rows.iter().map(|o| o.stake).sum();
        let pnl: f64 = rows.iter().map(|o| o.pnl).sum();
        let expectancy = if stake > 0.0 { pnl / stake } else { 0.0 };
        let wr_lb = wilson_lower_bound(wins, n as u64);

        let (prob_add, ev_add, size_mult) = if expectancy <= -0.05 || wr_lb < 0.45 {
            (0.020, 0.008, 0.70)
        } else if expectancy >= 0.05 && wr_lb >= 0.55 {
            (0.0, -0.004, 1.10)
        } else {
            (0.0, 0.0, 1.0)
        };
        RollingProfile {
            n,
            expectancy,
            wr_lb,
            prob_add,
            ev_add,
            size_mult,
        }
    }

    pub fn can_superbet(&self, now_ts: i64, cooldown_s: f64) -> bool {
        (now_ts - self.last_superbet_ts) as f64 >= cooldown_s
    }

    pub fn note_superbet(&mut self, ts: i64) {
        self.last_superbet_ts = ts;
    }

    pub fn booster_locked(&self, now_ts: i64) -> bool {
        now_ts < self.booster_lock_until_ts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(ts: i64, win: bool, pnl: f64, entry: f64, score: i32) -> TradeOutcome {
        TradeOutcome {
            ts,
            cid: format!("c{ts}"),
            asset: Asset::Btc,
            duration: RoundDuration::M15,
            side: Side::Up,
            entry,
            score,
            stake: 10.0,
            pnl,
            win,
        }
    }

    #[test]
    fn wilson_bound_behaves() {
        assert!(wilson_lower_bound(0, 0) == 0.5);
        assert!(wilson_lower_bound(9, 10) > 0.55);
        assert!(wilson_lower_bound(1, 10) < 0.10);
        assert!(wilson_lower_bound(50, 100) < 0.5);
    }

    #[test]
    fn outcome_accrual_updates_buckets_and_rings() {
        let mut s = StatsEngine::new();
        for i in 0..10 {
            s.record_outcome(
                outcome(1_000 + i, i % 2 == 0, if i % 2 == 0 { 8.0 } else { -10.0 }, 0.55, 10),
                36 * 3600,
                3,
                3600,
            );
        }
        let key = BucketKey::new(RoundDuration::M15, 10, 0.55);
        let b = s.bucket(&key).unwrap();
        assert_eq!(b.outcomes, 10);
        assert_eq!(b.wins, 5);
        assert_eq!(s.recent_wins.len(), 10);
        assert_eq!(s.total_wins, 5);
    }

    #[test]
    fn loss_streak_arms_booster_lock() {
        let mut s = StatsEngine::new();
        for i in 0..3 {
            s.record_outcome(outcome(1_000 + i, false, -10.0, 0.5, 10), 36 * 3600, 3, 3600);
        }
        assert!(s.booster_locked(1_500));
        assert!(!s.booster_locked(1_002 + 3601));
        // A win clears the streak counter.
        s.record_outcome(outcome(6_000, true, 8.0, 0.5, 10), 36 * 3600, 3, 3600);
        assert_eq!(s.consecutive_losses, 0);
    }

    #[test]
    fn shrink_factor_tracks_win_rate() {
        let mut s = StatsEngine::new();
        assert_eq!(s.prob_shrink_factor(), 1.0);
        for i in 0..30 {
            s.record_outcome(outcome(1_000 + i, i % 4 == 0, -5.0, 0.5, 10), 36 * 3600, 0, 0);
        }
        // ~25% win rate: strong shrink.
        assert!(s.prob_shrink_factor() < 0.85);
        assert!(s.wr_bet_scale() < 0.9);
    }

    #[test]
    fn retention_prunes_old_outcomes() {
        let mut s = StatsEngine::new();
        s.record_outcome(outcome(1_000, true, 5.0, 0.5, 10), 100, 0, 0);
        s.record_outcome(outcome(1_200, true, 5.0, 0.5, 10), 100, 0, 0);
        assert_eq!(s.outcomes.len(), 1);
    }

    #[test]
    fn replay_reproduces_counters() {
        let rows: Vec<TradeOutcome> = (0..20)
            .map(|i| outcome(1_000 + i, i % 3 == 0, if i % 3 == 0 { 9.0 } else { -10.0 }, 0.48, 12))
            .collect();
        let mut live = StatsEngine::new();
        let mut replay = StatsEngine::new();
        for r in &rows {
            live.record_outcome(r.clone(), 36 * 3600, 3, 3600);
        }
        for r in &rows {
            replay.record_outcome(r.clone(), 36 * 3600, 3, 3600);
        }
        let key = BucketKey::new(RoundDuration::M15, 12, 0.48);
        assert_eq!(live.bucket(&key).unwrap().outcomes, replay.bucket(&key).unwrap().outcomes);
        assert_eq!(live.bucket(&key).unwrap().wins, replay.bucket(&key).unwrap().wins);
        assert!((live.total_pnl - replay.total_pnl).abs() < 1e-9);
    }

    #[test]
    fn cold_buckets_use_default_penalties() {
        let s = StatsEngine::new();
        let (slip, nofill, fill_ratio) = s.execution_penalties(RoundDuration::M15, 10, 0.55);
        assert!(slip > 0.0);
        assert!(nofill > 0.0);
        assert!(fill_ratio >= 0.85 && fill_ratio <= 0.95);
    }
}
