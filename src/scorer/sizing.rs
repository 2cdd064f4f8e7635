//! Position sizing: entry-tier fractional Kelly, a stack of multiplicative
//! scalers, hard caps, conviction floors, and the super-bet floor/ceiling
//! for cheap high-payout tails. Correlated exposure in the same round
//! decays the size of every additional leg.

use crate::config::SizingConfig;
use crate::models::RoundDuration;

/// Full Kelly fraction for a binary contract bought at `entry` with win
/// probability `p`. Odds are `b = (1 - entry) / entry`.
pub fn kelly_raw(p: f64, entry: f64) -> f64 {
    let entry = entry.clamp(1e-6, 1.0 - 1e-6);
    let b = (1.0 - entry) / entry;
    let q = 1.0 - p;
    ((p * b - q) / b).clamp(0.0, 1.0)
}

/// Entry-tier table: cheaper tokens with stronger scores earn a larger
/// Kelly fraction and bankroll allotment.
pub fn tier_params(cfg: &SizingConfig, entry: f64, score: i32) -> (f64, f64) {
    let hi = score >= cfg.tier_score_high;
    let mid = score >= cfg.tier_score_mid;
    if entry <= 0.20 {
        if hi {
            (0.20, 0.10)
        } else if mid {
            (0.16, 0.08)
        } else {
            (0.12, 0.06)
        }
    } else if entry <= 0.30 {
        if hi {
            (0.16, 0.08)
        } else if mid {
            (0.12, 0.06)
        } else {
            (0.10, 0.05)
        }
    } else if entry <= 0.40 {
        if hi {
            (0.12, 0.06)
        } else if mid {
            (0.10, 0.05)
        } else {
            (0.08, 0.04)
        }
    } else if entry <= 0.55 {
        if hi {
            (0.08, 0.04)
        } else if mid {
            (0.06, 0.03)
        } else {
            (0.05, 0.025)
        }
    } else if hi {
        (0.04, 0.02)
    } else if mid {
        (0.03, 0.015)
    } else {
        (0.02, 0.010)
    }
}

/// Everything the sizer needs to turn a scored candidate into notional.
#[derive(Debug, Clone, Copy)]
pub struct SizeContext {
    pub duration: RoundDuration,
    pub entry: f64,
    pub score: i32,
    pub true_prob: f64,
    pub execution_ev: f64,
    pub mins_left: f64,
    pub bankroll: f64,
    pub oracle_agrees: bool,
    /// Oracle disagrees while fresh: the most dangerous disagreement.
    pub oracle_fresh_disagree: bool,
    pub leader_size_scale: f64,
    pub band_size_mult: f64,
    pub vol_mult: f64,
    pub wr_scale: f64,
    pub bucket_scale: f64,
    pub rolling_size_mult: f64,
    pub drawdown_pct: f64,
    pub contrarian_tail: bool,
    pub contrarian_size_mult: f64,
    /// Open legs already in this round: (total, same side).
    pub round_legs_total: u32,
    pub round_legs_same_side: u32,
    /// Super-bet cooldown satisfied.
    pub can_superbet: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SizeResult {
    pub notional: f64,
    pub hard_cap: f64,
    pub superbet_floor_applied: bool,
}

pub fn compute_notional(cfg: &SizingConfig, ctx: &SizeContext) -> SizeResult {
    let (kelly_frac, bankroll_pct) = tier_params(cfg, ctx.entry, ctx.score);
    let raw = kelly_raw(ctx.true_prob, ctx.entry) * kelly_frac * ctx.bankroll;

    // Hard cap stack: absolute, per-tier bankroll, per-cid, global.
    let max_single = cfg.max_single_abs_cap.min(ctx.bankroll * bankroll_pct);
    let cid_cap = (ctx.bankroll * cfg.max_cid_exposure_pct).max(cfg.min_hard_cap_usdc);
    let mut hard_cap = max_single
        .min(cid_cap)
        .min(ctx.bankroll * cfg.max_bankroll_pct)
        .max(cfg.min_hard_cap_usdc);

    // Tail entries look high-multiple but fill poorly; cap them tighter.
    if ctx.entry <= cfg.tail_cap_entry_1 {
        hard_cap = hard_cap.min((ctx.bankroll * cfg.tail_cap_pct_1).max(cfg.min_bet_abs));
    } else if ctx.entry <= cfg.tail_cap_entry_2 {
        hard_cap = hard_cap.min((ctx.bankroll * cfg.tail_cap_pct_2).max(cfg.min_bet_abs));
    }

    // Scaler stack.
    let oracle_scale = if ctx.oracle_fresh_disagree {
        cfg.oracle_scale_disagree_fresh
    } else if !ctx.oracle_agrees {
        cfg.oracle_scale_disagree_stale
    } else {
        1.0
    };
    let cents_scale = if ctx.entry <= 0.03 {
        cfg.cents_scale_3c
    } else if ctx.entry <= 0.05 {
        cfg.cents_scale_5c
    } else if ctx.entry <= 0.10 {
        cfg.cents_scale_10c
    } else if ctx.entry <= 0.20 {
        cfg.cents_scale_20c
    } else {
        1.0
    };
    let time_scale = if ctx.duration.is_core() {
        if ctx.mins_left <= 2.5 {
            cfg.time_scale_late_2_5
        } else if ctx.mins_left <= 3.5 {
            cfg.time_scale_late_3_5
        } else if ctx.mins_left <= 5.0 {
            cfg.time_scale_late_5_0
        } else {
            1.0
        }
    } else {
        1.0
    };
    let drawdown_scale = if ctx.drawdown_pct >= 0.15 {
        0.50
    } else if ctx.drawdown_pct >= 0.08 {
        0.70
    } else {
        1.0
    };

    let mut size = raw
        * ctx.vol_mult
        * ctx.wr_scale
        * oracle_scale
        * ctx.bucket_scale
        * cents_scale
        * time_scale
        * ctx.leader_size_scale
        * ctx.band_size_mult
        * ctx.rolling_size_mult
        * drawdown_scale;
    size = size.min(hard_cap);

    // Dynamic floor so solid setups never shrink to dust, except on
    // ultra-cheap tails and near expiry.
    let mut floor = (ctx.bankroll * cfg.min_bet_pct).max(cfg.min_bet_abs).min(hard_cap);
    let tail_or_late = ctx.entry <= 0.06 || (ctx.duration.is_core() && ctx.mins_left <= 3.0);
    if tail_or_late {
        floor = floor.min(cfg.min_bet_abs);
    }
    size = size.max(floor);

    if ctx.contrarian_tail {
        size = (size * ctx.contrarian_size_mult).min(hard_cap);
    }

    // Correlated decay for additional legs in the same round.
    if ctx.round_legs_same_side > 0 {
        let mult = cfg
            .round_stack_decay
            .powi(ctx.round_legs_same_side as i32)
            .max(cfg.round_stack_min);
        size *= mult;
        let corr = cfg
            .round_corr_decay
            .powi(ctx.round_legs_same_side as i32)
            .max(cfg.round_corr_min);
        size *= corr;
    }
    if ctx.round_legs_total > 0 {
        let mult = cfg
            .round_total_decay
            .powi(ctx.round_legs_total as i32)
            .max(cfg.round_total_min);
        size *= mult;
    }

    // Super-bet floor: cheap, high-payout, high-quality setups get a
    // meaningful minimum notional, gated by the cooldown.
    let payout = 1.0 / ctx.entry.max(1e-9);
    let mut superbet_floor_applied = false;
    if cfg.super_bet_floor_enabled
        && ctx.duration.is_core()
        && ctx.entry <= cfg.super_bet_entry_max
        && payout >= cfg.super_bet_min_payout
        && ctx.score >= cfg.super_bet_min_score
        && ctx.execution_ev >= cfg.super_bet_min_ev
        && ctx.can_superbet
        && size < cfg.super_bet_min_size
    {
        size = cfg.super_bet_min_size.min(hard_cap);
        superbet_floor_applied = true;
    }

    // Super-bet ceiling: tails never over-allocate regardless of floors.
    if cfg.super_bet_cap_enabled
        && ctx.duration.is_core()
        && ctx.entry <= cfg.super_bet_entry_max
        && payout >= cfg.super_bet_min_payout
    {
        let cap = cfg
            .super_bet_max_size
            .min(ctx.bankroll * cfg.super_bet_max_bankroll_pct)
            .max(cfg.min_bet_abs);
        size = size.min(cap);
    }

    SizeResult {
        notional: (size.min(hard_cap) * 100.0).round() / 100.0,
        hard_cap,
        superbet_floor_applied,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> SizingConfig {
        crate::config::Config::from_env().sizing
    }

    fn ctx() -> SizeContext {
        SizeContext {
            duration: RoundDuration::M15,
            entry: 0.55,
            score: 12,
            true_prob: 0.62,
            execution_ev: 0.04,
            mins_left: 8.0,
            bankroll: 500.0,
            oracle_agrees: true,
            oracle_fresh_disagree: false,
            leader_size_scale: 1.0,
            band_size_mult: 1.0,
            vol_mult: 1.0,
            wr_scale: 1.0,
            bucket_scale: 1.0,
            rolling_size_mult: 1.0,
            drawdown_pct: 0.0,
            contrarian_tail: false,
            contrarian_size_mult: 1.0,
            round_legs_total: 0,
            round_legs_same_side: 0,
            can_superbet: true,
        }
    }

    #[test]
    fn kelly_raw_is_sane() {
        // Fair coin at fair price: zero.
        assert!(kelly_raw(0.5, 0.5).abs() < 1e-12);
        // Edge on cheap entry: positive, bounded.
        let k = kelly_raw(0.35, 0.25);
        assert!(k > 0.0 && k < 1.0);
        // No edge: zero.
        assert_eq!(kelly_raw(0.40, 0.50), 0.0);
    }

    #[test]
    fn tier_table_monotone_in_entry_and_score() {
        let c = cfg();
        let (k_cheap_hi, p_cheap_hi) = tier_params(&c, 0.15, 14);
        let (k_mid_hi, _) = tier_params(&c, 0.50, 14);
        let (k_cheap_lo, p_cheap_lo) = tier_params(&c, 0.15, 4);
        assert!(k_cheap_hi > k_mid_hi);
        assert!(k_cheap_hi > k_cheap_lo);
        assert!(p_cheap_hi > p_cheap_lo);
    }

    #[test]
    fn bankroll_cap_never_exceeded() {
        let c = cfg();
        let mut x = ctx();
        x.true_prob = 0.90;
        x.entry = 0.30;
        let r = compute_notional(&c, &x);
        assert!(r.notional <= x.bankroll * c.max_bankroll_pct + 1e-9);
        assert!(r.notional <= r.hard_cap + 1e-9);
    }

    #[test]
    fn s1_sizing_lands_in_two_to_four_percent() {
        // The clear-uptrend scenario: strong 15m setup at 58c.
        let c = cfg();
        let mut x = ctx();
        x.entry = 0.58;
        x.score = 13;
        x.true_prob = 0.62;
        let r = compute_notional(&c, &x);
        let pct = r.notional / x.bankroll;
        assert!(pct >= 0.015 && pct <= 0.045, "pct={pct}");
    }

    #[test]
    fn fresh_oracle_disagreement_halves_size() {
        let c = cfg();
        let base = compute_notional(&c, &ctx()).notional;
        let mut x = ctx();
        x.oracle_agrees = false;
        x.oracle_fresh_disagree = true;
        let cut = compute_notional(&c, &x).notional;
        assert!(cut < base * 0.6, "base={base} cut={cut}");
    }

    #[test]
    fn round_stack_decay_shrinks_additional_legs() {
        let c = cfg();
        let base = compute_notional(&c, &ctx()).notional;
        let mut x = ctx();
        x.round_legs_total = 1;
        x.round_legs_same_side = 1;
        let stacked = compute_notional(&c, &x).notional;
        assert!(stacked < base, "base={base} stacked={stacked}");
    }

    #[test]
    fn superbet_floor_and_cap_bracket_tails() {
        let c = cfg();
        let mut x = ctx();
        x.entry = 0.12;
        x.score = 13;
        x.execution_ev = 0.08;
        x.true_prob = 0.20; // tiny kelly => floor applies
        let r = compute_notional(&c, &x);
        assert!(r.superbet_floor_applied);
        assert!(r.notional >= c.super_bet_min_size.min(r.hard_cap) - 1e-9);

        // Cooldown active: floor disabled.
        x.can_superbet = false;
        let r2 = compute_notional(&c, &x);
        assert!(!r2.superbet_floor_applied);

        // Ceiling binds when Kelly is big on a tail.
        x.can_superbet = true;
        x.true_prob = 0.45;
        let r3 = compute_notional(&c, &x);
        let cap = c
            .super_bet_max_size
            .min(x.bankroll * c.super_bet_max_bankroll_pct);
        assert!(r3.notional <= cap + 1e-9);
    }

    #[test]
    fn drawdown_throttles_size() {
        let c = cfg();
        let base = compute_notional(&c, &ctx()).notional;
        let mut x = ctx();
        x.drawdown_pct = 0.20;
        let throttled = compute_notional(&c, &x).notional;
        assert!(throttled <= base);
    }
}
