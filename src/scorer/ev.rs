//! Execution-aware expected value and the entry/payout gate window.
//!
//! The venue fee is parabolic in price, `p·(1−p)·fee_coeff`, so flat fee
//! estimates overtax high-payout entries. The gate window (min/max entry,
//! payout floor, EV floor) starts from static config and is then relaxed
//! or tightened by setup quality, window phase, and realized performance.

use crate::config::ScorerConfig;
use crate::models::RoundDuration;
use crate::stats::RollingProfile;

/// Venue fee at a given entry price.
pub fn fee(entry: f64, coeff: f64) -> f64 {
    (entry * (1.0 - entry) * coeff).max(0.001)
}

/// Net EV per unit staked, after fees, before execution penalties.
pub fn ev_net(true_prob: f64, entry: f64, coeff: f64) -> f64 {
    true_prob / entry.max(1e-9) - 1.0 - fee(entry, coeff)
}

/// Entry-aware minimum probability: breakeven plus a safety margin that
/// grows with expensive entries.
pub fn frontier_required_prob(cfg: &ScorerConfig, entry: f64) -> f64 {
    entry * (1.0 + fee(entry, cfg.fee_coeff))
        + cfg.ev_frontier_margin_base
        + (entry - 0.50).max(0.0) * cfg.ev_frontier_margin_high_entry
}

#[derive(Debug, Clone, Copy)]
pub struct EntryWindow {
    pub min_entry: f64,
    pub max_entry: f64,
    pub min_payout: f64,
    pub min_ev: f64,
}

/// Inputs that shift the gate window away from its static base.
#[derive(Debug, Clone, Copy)]
pub struct WindowContext {
    pub duration: RoundDuration,
    pub score: i32,
    pub true_prob: f64,
    pub edge: f64,
    /// Blend of analysis quality and conviction in [0, 1].
    pub setup_quality: f64,
    pub oracle_agrees: bool,
    /// Binary time-lock model probability for the chosen side.
    pub binary_model_prob: f64,
    pub move_pct: f64,
    pub pct_remaining: f64,
    pub mins_left: f64,
    /// Chosen side currently on the winning side of the reference.
    pub side_leading: bool,
    /// All primary feeds fresh (book + oracle + volume).
    pub feeds_fresh: bool,
    /// Adaptive drift from recent realized performance.
    pub adaptive_payout_add: f64,
    pub adaptive_ev_add: f64,
    pub adaptive_entry_cap: f64,
}

pub fn entry_window(
    cfg: &ScorerConfig,
    ctx: &WindowContext,
    rolling: &RollingProfile,
) -> EntryWindow {
    let is_core = ctx.duration.is_core();

    // Score slack widens the ceiling slightly for high-conviction setups.
    let score_slack = if ctx.score >= 12 {
        0.03
    } else if ctx.score >= 9 {
        0.015
    } else {
        0.0
    };
    let mut max_entry = (cfg.max_entry_price + cfg.max_entry_tol + score_slack).min(0.97);

    // Model-consistent cap: as long as EV after fees stays positive, high
    // conviction may pay up.
    let min_ev_base = if is_core { cfg.min_ev_net } else { cfg.min_ev_net_5m };
    let model_cap = ctx.true_prob
        / (1.0 + fee(cfg.max_entry_price, cfg.fee_coeff) + min_ev_base.max(0.003)).max(1e-9);
    if ctx.score >= 9 {
        max_entry = max_entry.max(model_cap.min(0.85));
    }

    // Payout floor with its relaxation ladder.
    let mut min_payout = if is_core {
        cfg.min_payout_15m
    } else {
        cfg.min_payout_5m
    } + ctx.adaptive_payout_add;

    let q_relax = (ctx.setup_quality - 0.55).max(0.0);
    min_payout = (min_payout - 0.20 * q_relax).max(1.55);

    if is_core
        && ctx.score >= 13
        && ctx.true_prob >= 0.64
        && ctx.setup_quality >= 0.60
        && ctx.oracle_agrees
    {
        let extra = ((ctx.setup_quality - 0.60) * 0.50).min(0.10);
        min_payout = (min_payout - extra).max(1.70);
    }

    // Data-driven 15m floor from the rolling on-chain profile.
    if is_core {
        let dyn_floor = if rolling.n >= 8 {
            if rolling.expectancy >= 0.05 && rolling.wr_lb >= 0.55 {
                1.50
            } else if rolling.expectancy <= -0.05 || rolling.wr_lb < 0.45 {
                1.78
            } else {
                1.62
            }
        } else {
            1.62
        };
        min_payout = min_payout.max(dyn_floor);
    }

    // Late-window locked direction: aligned entries late in the window win
    // often enough that a lower payout is still +EV.
    if is_core
        && ctx.pct_remaining <= cfg.late_relax_pct_left
        && ctx.move_pct >= cfg.late_relax_min_move
        && ctx.side_leading
    {
        min_payout = min_payout.min(cfg.late_relax_payout_floor);
    }

    // Trend-confirmed relax throughout the window.
    if is_core
        && ctx.oracle_agrees
        && ctx.binary_model_prob >= 0.54
        && ctx.move_pct >= cfg.late_relax_min_move
    {
        min_payout = min_payout.min(1.72);
    }

    // Strong-setup unlock for the 1.8x dead zone.
    if is_core
        && ctx.score >= 14
        && ctx.true_prob >= 0.66
        && ctx.edge >= 0.10
        && ctx.setup_quality >= 0.60
        && ctx.oracle_agrees
    {
        min_payout = min_payout.min(1.80);
    }

    // EV floor.
    let mut min_ev = (min_ev_base + ctx.adaptive_ev_add - 0.012 * q_relax).max(0.005);
    if is_core {
        min_ev = (min_ev + rolling.ev_add).max(0.005);
    }

    // Fresh-feed entry relaxation early in the window.
    if ctx.feeds_fresh {
        let min_left = if is_core { 5.0 } else { 2.0 };
        if ctx.mins_left >= min_left {
            max_entry = (max_entry + 0.01).min(0.60);
        }
    }
    max_entry = max_entry.min(ctx.adaptive_entry_cap);

    // Hard ceiling: 15m keeps the strict cap, with a sliver of relief for
    // exceptional setups.
    if is_core {
        let strong_relax = if ctx.true_prob >= 0.72 && ctx.score >= 14 && ctx.edge >= 0.14 {
            0.02
        } else {
            0.0
        };
        max_entry = max_entry.min((cfg.entry_hard_cap_15m + strong_relax).min(0.90));
    } else {
        max_entry = max_entry.min(ctx.adaptive_entry_cap.max(0.60));
    }

    // Dynamic minimum entry.
    let base_min = if is_core { cfg.min_entry_price_15m } else { 0.01 };
    let mut min_entry = base_min;
    if ctx.setup_quality >= 0.70 {
        min_entry = (min_entry - (ctx.setup_quality - 0.70) * 0.20).max(0.01);
    } else if ctx.setup_quality <= 0.40 {
        min_entry = (min_entry + (0.40 - ctx.setup_quality) * 0.30).min(0.45);
    }
    // Near expiry, ultra-low entries are mostly noise fills.
    let near_end = if is_core { 3.5 } else { 1.8 };
    if ctx.mins_left <= near_end || !ctx.feeds_fresh {
        min_entry = (min_entry + 0.04).min(0.45);
    }
    min_entry = min_entry.min(max_entry - 0.01).max(0.01);

    EntryWindow {
        min_entry,
        max_entry,
        min_payout,
        min_ev,
    }
}
