//! Signal scorer.
//!
//! `evaluate` is a pure function of (snapshot, portfolio, stats): no I/O,
//! no clocks, no randomness. The stateful `Scorer` wrapper adds per-round
//! de-duplication through the seen ring, the booster re-entry path, a short
//! debounce cache, and the rolling skip-reason diagnostics window.

pub mod ev;
pub mod features;
pub mod probability;
pub mod sizing;

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::feeds::book::{BookSource, BookView};
use crate::models::{
    ExecutionMode, Side, Signal, SignalTier, SkipReason,
};
use crate::portfolio::PortfolioView;
use crate::snapshot::RoundSnapshot;
use crate::stats::StatsEngine;

#[derive(Debug, Clone)]
pub enum Decision {
    Emit(Signal),
    Skip(SkipReason),
}

/// Context for a same-side add-on on an existing confirmed position.
#[derive(Debug, Clone, Copy)]
pub struct BoosterCtx {
    pub side: Side,
    pub prev_stake: f64,
    pub used: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BookFreshness {
    WsFresh,
    RestFresh,
    SoftOnly,
    Missing,
}

fn book_freshness(cfg: &Config, snap: &RoundSnapshot, book: Option<&BookView>) -> BookFreshness {
    let Some(b) = book else {
        return BookFreshness::Missing;
    };
    if b.best_ask <= 0.0 || b.best_ask >= 1.0 {
        return BookFreshness::Missing;
    }
    match b.source {
        BookSource::Ws if b.age_ms <= snap.book_strict_cap_ms => BookFreshness::WsFresh,
        BookSource::Rest if b.age_ms <= cfg.feeds.book_rest_fresh_ms => BookFreshness::RestFresh,
        _ if b.age_ms <= cfg.feeds.book_soft_age_ms => BookFreshness::SoftOnly,
        _ => BookFreshness::Missing,
    }
}

/// Pure scoring pipeline. Every rejection carries its closed reason code.
pub fn evaluate(
    cfg: &Config,
    snap: &RoundSnapshot,
    portfolio: &PortfolioView,
    stats: &StatsEngine,
    booster: Option<&BoosterCtx>,
    late_relax: bool,
) -> Result<Signal, SkipReason> {
    let s = &cfg.scorer;
    let round = &snap.round;
    let duration = round.duration;
    let is_core = duration.is_core();
    let now = snap.now_ts;
    let mins_left = round.mins_left(now);
    let pct_remaining = round.pct_remaining(now);
    let mut reasons: Vec<String> = Vec::new();

    // ── Eligibility ──────────────────────────────────────────────────────
    let (current, px_src, quote_age_ms) = snap
        .decision_price(&cfg.feeds)
        .ok_or(SkipReason::NoDecisionPrice)?;
    let open = snap
        .open_price
        .filter(|p| *p > 0.0)
        .ok_or(SkipReason::OpenPriceUnavailable)?;
    let open_src = snap.open_source;
    if pct_remaining < s.min_pct_remaining {
        return Err(SkipReason::WindowTooLate);
    }

    let oracle_age = snap.oracle_age_s;
    match oracle_age {
        None if is_core && booster.is_none() => return Err(SkipReason::OracleAgeMissing),
        Some(age) if age > cfg.feeds.oracle_age_max_skip_s => {
            return Err(SkipReason::OracleTooOld)
        }
        _ => {}
    }

    // ── Direction ────────────────────────────────────────────────────────
    let (tf_up, tf_dn) = features::momentum_votes(&snap.tech, s);
    let signed_move = (current - open) / open;
    let move_pct = signed_move.abs();
    let oracle_dir =
        features::oracle_direction(snap.oracle_price, open, s.oracle_direction_move_min);
    let oracle_above = snap.oracle_price.map(|p| p >= open);
    let pick = features::pick_direction(
        s,
        signed_move,
        move_pct,
        oracle_dir,
        oracle_age,
        oracle_above,
        tf_up,
        tf_dn,
    );
    let direction = pick.direction;
    let mut score: i32 = -pick.score_pen;
    let mut edge_bonus: f64 = -pick.edge_pen;
    if pick.conflict {
        reasons.push("px_align_conflict".into());
    }

    // Soft source-divergence penalty instead of a hard skip.
    let mut div_pen_applied = false;
    if let (Some(op), Some(q)) = (snap.oracle_price, snap.quote) {
        let div = (op - q.price).abs() / open;
        if div >= s.div_pen_start {
            let pen = ((div / s.div_pen_start) as i32).clamp(1, s.div_pen_max_score);
            score -= pen;
            edge_bonus -= (div * 8.0).min(0.02);
            div_pen_applied = true;
            reasons.push("data_divergence".into());
        }
    }

    // Open-source confidence and oracle-age drag.
    score += match open_src {
        crate::models::OpenPriceSource::Indexer => 1,
        crate::models::OpenPriceSource::OracleExact => 0,
        _ => -1,
    };
    match oracle_age {
        None => score -= 1,
        Some(age) if age > cfg.feeds.oracle_age_warn_s => {
            score -= s.oracle_warn_score_pen;
            reasons.push("oracle_age_warn".into());
        }
        _ => {}
    }

    // ── Book freshness gating ────────────────────────────────────────────
    let cheap_side = if round.up_price <= 0.5 { Side::Up } else { Side::Down };
    let mut book_state = book_freshness(cfg, snap, snap.book_for(cheap_side));
    if book_state == BookFreshness::Missing {
        book_state = book_freshness(cfg, snap, snap.book_for(cheap_side.opposite()));
    }
    let (ws_book_fresh, rest_book_fresh) = match book_state {
        BookFreshness::WsFresh => (true, false),
        BookFreshness::RestFresh => {
            score -= 1;
            reasons.push("book_rest_fallback".into());
            (false, true)
        }
        BookFreshness::SoftOnly => {
            score -= 2;
            reasons.push("book_soft_stale".into());
            (false, false)
        }
        BookFreshness::Missing => return Err(SkipReason::BookWsMissing),
    };

    if !snap.derivs.volume_ready {
        return Err(SkipReason::VolumeMissing);
    }

    // ── Feature scoring ──────────────────────────────────────────────────
    let prev_win_dir = snap.prev_open.and_then(|prev| {
        if prev <= 0.0 {
            return None;
        }
        let diff = (open - prev) / prev;
        if diff > s.prev_win_dir_move_min {
            Some(Side::Up)
        } else if diff < -s.prev_win_dir_move_min {
            Some(Side::Down)
        } else {
            None
        }
    });
    let feat = features::score_features(
        s,
        snap,
        direction,
        tf_up,
        tf_dn,
        move_pct,
        pct_remaining,
        prev_win_dir,
    )?;
    score += feat.score;

    // The oracle resolves the market; disagreement is a major red flag.
    if features::oracle_agrees(snap.oracle_price, open, direction) {
        score += s.oracle_agree_bonus;
    } else {
        score -= s.oracle_disagree_pen;
    }

    // ── Probability synthesis ────────────────────────────────────────────
    let oracle_agrees_up = features::oracle_agrees(snap.oracle_price, open, Side::Up);
    let mut prob_up = probability::synthesize_prob_up(
        s,
        snap,
        current,
        open,
        oracle_agrees_up,
        feat.regime_mult,
    );
    prob_up = probability::shrink_toward_half(prob_up, stats.prob_shrink_factor());

    let up_prof = stats.side_profile(round.asset, duration, Side::Up);
    let dn_prof = stats.side_profile(round.asset, duration, Side::Down);
    prob_up = probability::rebalance_with_side_priors(s, prob_up, up_prof.prob_adj, dn_prof.prob_adj);

    // Analysis quality, then the degraded-data rescale toward 0.5.
    let oracle_fresh = oracle_age.map(|a| a <= s.analysis_oracle_fresh_s).unwrap_or(false);
    let quote_fresh = quote_age_ms <= s.analysis_quote_fresh_ms;
    let leader_fresh = snap
        .flow
        .as_ref()
        .map(|f| f.age_s <= cfg.feeds.copyflow_live_max_age_s && f.sample_n >= 1)
        .unwrap_or(false);
    let quality = features::analysis_quality(
        ws_book_fresh,
        rest_book_fresh,
        leader_fresh,
        oracle_fresh,
        quote_fresh,
        snap.derivs.volume_ready,
    );
    prob_up = probability::quality_rescale(s, prob_up, quality);
    prob_up = probability::rebalance_with_side_priors(s, prob_up, up_prof.prob_adj, dn_prof.prob_adj);
    let prob_down = 1.0 - prob_up;

    let edge_up = prob_up - round.up_price;
    let edge_down = prob_down - (1.0 - round.up_price);

    // ── Side selection ───────────────────────────────────────────────────
    let dir_edge = match direction {
        Side::Up => edge_up,
        Side::Down => edge_down,
    };
    if dir_edge < -0.15 {
        return Err(SkipReason::DirectionEdgeHardBlock);
    }

    let mut side = direction;
    if s.max_win_mode {
        let fee_up = ev::fee(round.up_price, s.fee_coeff);
        let fee_dn = ev::fee(1.0 - round.up_price, s.fee_coeff);
        let ev_up = prob_up / round.up_price.max(1e-9) - 1.0 - fee_up;
        let ev_dn = prob_down / (1.0 - round.up_price).max(1e-9) - 1.0 - fee_dn;
        let mut util_up = ev_up + edge_up * s.util_edge_mult;
        let mut util_dn = ev_dn + edge_down * s.util_edge_mult;
        // Clear drift late in a core window nudges utility toward the move.
        if is_core && mins_left <= 12.0 && move_pct >= 0.0008 {
            let shift = (move_pct * 3.0).min(0.05);
            if signed_move >= 0.0 {
                util_up += shift;
                util_dn -= shift;
            } else {
                util_dn += shift;
                util_up -= shift;
            }
        }
        side = if util_up >= util_dn { Side::Up } else { Side::Down };
        if side != direction {
            reasons.push("maxwin_side_flip".into());
        }
    }

    // Contrarian tail: the cheap trailing side on early overreactions.
    let mut contrarian_tail = false;
    if s.contrarian_tail_enabled && is_core {
        let cheap_entry = round.up_price.min(1.0 - round.up_price);
        if cheap_entry <= s.contrarian_tail_max_entry
            && mins_left >= s.contrarian_tail_min_mins_left
            && move_pct >= s.contrarian_tail_min_move
            && cheap_side != direction
        {
            side = cheap_side;
            contrarian_tail = true;
            reasons.push("contrarian_tail".into());
        }
    }

    // ── Leader flow ──────────────────────────────────────────────────────
    let mut tier = SignalTier::TierC;
    let mut source = "synthetic".to_string();
    let mut leader_scale = cfg.sizing.leader_noflow_size_scale;
    let mut leader_net_for_conv: Option<f64> = None;
    if let Some(flow) = &snap.flow {
        let net = flow.up_conf - flow.down_conf;
        leader_net_for_conv = Some(net);
        if leader_fresh {
            tier = SignalTier::TierA;
            source = "leader-live".into();
            leader_scale = cfg.sizing.leader_fresh_size_scale;
            // Strong per-round leader consensus may flip the side, capped by
            // entry price and profile quality.
            if flow.sample_n >= 8 && net.abs() >= 0.50 && !contrarian_tail {
                let leader_side = if net > 0.0 { Side::Up } else { Side::Down };
                let leader_entry = round.entry_for(leader_side);
                let entry_cap = (s.max_entry_price + s.max_entry_tol + 0.06).min(0.70);
                let band = stats.entry_band_profile(round.asset, duration, leader_side, leader_entry);
                let rside = stats.side_profile(round.asset, duration, leader_side);
                let band_bad = band.n >= 6 && (band.wr_lb < 0.40 || band.profit_factor < 0.8);
                let recent_bad = rside.n >= 6 && rside.wr_lb < 0.40 && rside.expectancy < 0.0;
                if leader_entry <= entry_cap && !band_bad && !recent_bad {
                    if side != leader_side {
                        reasons.push("leader_follow_flip".into());
                        side = leader_side;
                    }
                    score += 2;
                    edge_bonus += 0.01;
                    source = "leader-fresh".into();
                }
            }
        }
        // Copy-flow alignment score for whichever side we ended on. Flow
        // beyond the soft-fallback age is informational only.
        let soft_usable = flow.age_s <= cfg.feeds.copyflow_fallback_max_age_s
            && flow.sample_n >= 1;
        if leader_fresh || soft_usable {
            let (pref, opp) = match side {
                Side::Up => (flow.up_conf, flow.down_conf),
                Side::Down => (flow.down_conf, flow.up_conf),
            };
            let copy_net = pref - opp;
            let copy_adj = ((copy_net * 3.0).round() as i32).clamp(-3, 3);
            score += copy_adj;
            edge_bonus += copy_net * 0.02;

            // Leader style: winners paying high cents on conviction vs
            // winners buying cheap while the market is already expensive.
            if flow.avg_entry_c > 0.0 {
                if flow.high_c_share >= 0.55 {
                    score += 1;
                    edge_bonus += 0.004;
                } else if flow.low_c_share >= 0.60 && round.entry_for(side) > 0.55 {
                    score -= 1;
                    edge_bonus -= 0.004;
                }
            }
        }
    }
    if tier != SignalTier::TierA {
        tier = SignalTier::TierB;
        source = "tech-realtime-no-leader".into();
        leader_scale = leader_scale.min(cfg.sizing.leader_noflow_size_scale);
    }

    // ── Late-window direction lock ───────────────────────────────────────
    let mut late_lock_penalty = false;
    {
        let (lock_mins, lock_move) = if is_core { (4.0, 0.0012) } else { (1.5, 0.0008) };
        if mins_left <= lock_mins && move_pct >= lock_move {
            let beat = if current >= open { Side::Up } else { Side::Down };
            if side != beat {
                side = beat;
                late_lock_penalty = true;
                reasons.push("late_lock_align".into());
            }
        }
    }

    // ── Side-aligned metrics ─────────────────────────────────────────────
    let side_up = side == Side::Up;
    let tf_votes = if side_up { tf_up } else { tf_dn };
    let oracle_agree = features::oracle_agrees(snap.oracle_price, open, side);
    let mut true_prob = if side_up { prob_up } else { prob_down };
    let mut edge = (if side_up { edge_up } else { edge_down }) + edge_bonus;

    if late_lock_penalty {
        score -= 1;
        edge -= 0.004;
        true_prob = 0.5 + (true_prob - 0.5) * 0.92;
    }

    let sprof = if side_up { up_prof } else { dn_prof };
    score += sprof.score_adj;
    edge += sprof.edge_adj;
    let entry_hint = round.entry_for(side);
    let band = stats.entry_band_profile(round.asset, duration, side, entry_hint);
    score += band.score_adj;
    edge += band.edge_adj;
    true_prob = (true_prob + band.prob_adj).clamp(s.prob_clamp_min, s.prob_clamp_max);

    let side_leading = (side_up && current >= open) || (!side_up && current < open);

    // Contrarian tails price reversal odds the trend model cannot see;
    // apply the mean-reversion floor instead of the trend posterior.
    if contrarian_tail {
        true_prob = true_prob.max(s.contrarian_tail_prob_floor);
    }

    // Locked-direction probability boost late in the window.
    if is_core
        && pct_remaining <= s.late_relax_pct_left
        && move_pct >= s.late_relax_min_move
        && side_leading
        && ((side_up && snap.derivs.taker_ratio >= 0.52)
            || (!side_up && snap.derivs.taker_ratio <= 0.48))
    {
        true_prob = (true_prob + s.late_relax_prob_boost).clamp(s.prob_clamp_min, s.prob_clamp_max);
        reasons.push("late_locked_boost".into());
    }
    if feat.ofi_surge && side == direction {
        true_prob = (true_prob + 0.03).clamp(s.prob_clamp_min, s.prob_clamp_max);
    }

    let bin_c = probability::binary_model_prob(current, open, snap.tech.annual_vol, mins_left, side);
    let conviction =
        features::analysis_conviction(snap, side, tf_votes, oracle_agree, leader_net_for_conv, bin_c);
    let setup_q = (quality * 0.55 + conviction * 0.45).clamp(0.0, 1.0);

    // 5m rounds cannot carry a realigned direction AND divergent feeds.
    if !is_core && pick.conflict && div_pen_applied {
        return Err(SkipReason::FiveMinSourceConflict);
    }

    // ── Probability / score gates ────────────────────────────────────────
    // Contrarian tails intentionally fade the move, so the trend-following
    // gates (oracle agreement, trend-side probability floors) do not apply;
    // they carry their own mean-reversion floor instead.
    if s.max_win_mode && !contrarian_tail {
        if s.winmode_require_oracle_agree && !oracle_agree {
            return Err(SkipReason::WinModeOracleDisagree);
        }
        let min_prob = if is_core {
            s.winmode_min_true_prob_15m
        } else {
            s.winmode_min_true_prob_5m
        };
        if true_prob < min_prob {
            return Err(SkipReason::WinModeProbLow);
        }
        if edge < s.winmode_min_edge {
            return Err(SkipReason::WinModeEdgeLow);
        }
    }

    let payout_hint = 1.0 / entry_hint.max(1e-9);
    let min_tp = if contrarian_tail {
        0.30
    } else if is_core {
        s.min_true_prob_15m
    } else {
        s.min_true_prob_5m
    };
    let highpayout_bypass =
        payout_hint >= 8.0 && score >= 12 && edge >= 0.05 && true_prob >= 0.28;
    if true_prob < min_tp && !highpayout_bypass {
        return Err(SkipReason::ProbBelowGate);
    }

    let mut min_score = s.min_score_gate.max(if is_core {
        s.min_score_gate_15m
    } else {
        s.min_score_gate_5m
    });
    if let Some(w3) = stats.last3_wins() {
        if w3 < 2 {
            min_score += s.rolling3_score_pen;
        }
    }
    if late_relax {
        min_score = (min_score - 2).max(0);
    }
    if is_core && feat.cross_count >= s.cross_consensus_min_count {
        min_score = (min_score - s.cross_consensus_score_relax).max(4);
    }
    if score < min_score {
        return Err(SkipReason::ScoreBelowGate);
    }

    // ── Entry and payout gates ───────────────────────────────────────────
    let side_book = snap.book_for(side);
    let live_entry = side_book
        .map(|b| b.best_ask)
        .filter(|a| *a > 0.0 && *a < 1.0)
        .unwrap_or(entry_hint);

    let (payout_add, ev_add, entry_cap) = stats.adaptive_thresholds(s.entry_hard_cap_15m);
    let rolling = stats.rolling_profile(duration);
    let feeds_fresh = (ws_book_fresh || rest_book_fresh) && oracle_fresh && snap.derivs.volume_ready;
    let mut window = ev::entry_window(
        s,
        &ev::WindowContext {
            duration,
            score,
            true_prob,
            edge,
            setup_quality: setup_q,
            oracle_agrees: oracle_agree,
            binary_model_prob: bin_c,
            move_pct,
            pct_remaining,
            mins_left,
            side_leading,
            feeds_fresh,
            adaptive_payout_add: payout_add,
            adaptive_ev_add: ev_add,
            adaptive_entry_cap: entry_cap,
        },
        &rolling,
    );
    if s.max_win_mode && !contrarian_tail {
        let winmode_cap = if is_core {
            s.winmode_max_entry_15m
        } else {
            s.winmode_max_entry_5m
        };
        window.max_entry = window.max_entry.min(winmode_cap);
        if window.min_entry >= window.max_entry {
            window.min_entry = (window.max_entry - 0.01).max(0.01);
        }
    }

    let mut use_limit = false;
    let mut entry = live_entry;
    if entry < window.min_entry || entry > window.max_entry {
        let pullback_ok = s.pullback_limit_enabled
            && entry > window.max_entry
            && pct_remaining >= s.pullback_min_pct_left;
        if pullback_ok {
            // Park a resting limit at the maximum acceptable entry.
            use_limit = true;
            entry = window.max_entry;
            reasons.push("pullback_limit".into());
        } else {
            return Err(SkipReason::EntryOutside);
        }
    }

    let payout_mult = 1.0 / entry.max(1e-9);
    if payout_mult < window.min_payout {
        if payout_mult >= (window.min_payout - s.payout_near_miss_tol).max(1.0) {
            reasons.push("payout_near_miss".into());
        } else {
            return Err(SkipReason::PayoutBelow);
        }
    }

    // ── Execution-aware EV ───────────────────────────────────────────────
    let ev_net = ev::ev_net(true_prob, entry, s.fee_coeff);
    let (slip_cost, nofill_penalty, _fill_ratio) =
        stats.execution_penalties(duration, score, entry);
    let execution_ev = ev_net - slip_cost - nofill_penalty;
    if execution_ev < window.min_ev {
        return Err(SkipReason::EvBelow);
    }
    if is_core {
        let req_prob = ev::frontier_required_prob(s, entry);
        if true_prob + 1e-9 < req_prob {
            return Err(SkipReason::EvFrontierProbLow);
        }
    }

    // ── Core-consistency gates (15m, non-booster) ────────────────────────
    if is_core && booster.is_none() {
        if payout_mult + 1e-9 < s.consistency_min_payout_15m {
            return Err(SkipReason::ConsistencyPayoutLow);
        }
        if !oracle_agree && !contrarian_tail {
            return Err(SkipReason::ConsistencyOracleDisagree);
        }
        let prob_floor = if contrarian_tail {
            0.30
        } else {
            (s.consistency_min_prob_15m + rolling.prob_add).clamp(0.50, 0.90)
        };
        if true_prob + 1e-9 < prob_floor {
            return Err(SkipReason::ConsistencyProbLow);
        }
        let ev_floor = (s.consistency_min_ev_15m + rolling.ev_add).clamp(0.005, 0.060);
        if execution_ev + 1e-9 < ev_floor {
            return Err(SkipReason::ConsistencyEvLow);
        }
        let core_strong = score >= s.consistency_strong_min_score
            && true_prob >= s.consistency_strong_min_prob
            && execution_ev >= s.consistency_strong_min_ev
            && tf_votes >= 3
            && oracle_agree;
        if entry > s.consistency_max_entry_15m && !core_strong {
            return Err(SkipReason::ConsistencyEntryHigh);
        }
        if !side_leading {
            let trail_ok = pct_remaining >= s.consistency_trail_min_pct_left && core_strong;
            if !trail_ok && !contrarian_tail {
                return Err(SkipReason::ConsistencyTrailWeak);
            }
        }
    }

    // ── Low-cent entries ─────────────────────────────────────────────────
    if entry <= s.low_cent_threshold {
        match booster {
            None => {
                let strong_new = is_core
                    && score >= s.lowcent_new_min_score
                    && true_prob >= s.lowcent_new_min_prob
                    && execution_ev >= s.lowcent_new_min_ev
                    && payout_mult >= s.lowcent_new_min_payout
                    && oracle_agree;
                if !strong_new {
                    return Err(SkipReason::LowCentNewWeak);
                }
            }
            Some(_) if !side_leading => return Err(SkipReason::LowCentNotLeading),
            Some(_) => {}
        }
    }

    // ── Sizing ───────────────────────────────────────────────────────────
    let bankroll = portfolio.bankroll();
    if bankroll <= cfg.sizing.min_exec_notional {
        return Err(SkipReason::InsufficientBankroll);
    }
    let (legs_total, legs_same) = portfolio.same_round_legs(&round.fingerprint(), side);
    let oracle_fresh_disagree =
        !oracle_agree && oracle_age.map(|a| a <= 30.0).unwrap_or(false);
    let size_result = sizing::compute_notional(
        &cfg.sizing,
        &sizing::SizeContext {
            duration,
            entry,
            score,
            true_prob,
            execution_ev,
            mins_left,
            bankroll,
            oracle_agrees: oracle_agree,
            oracle_fresh_disagree,
            leader_size_scale: leader_scale,
            band_size_mult: band.size_mult,
            vol_mult: snap.derivs.vol_mult,
            wr_scale: stats.wr_bet_scale(),
            bucket_scale: stats.bucket_size_scale(duration, score, entry),
            rolling_size_mult: rolling.size_mult,
            drawdown_pct: portfolio.drawdown_pct,
            contrarian_tail,
            contrarian_size_mult: s.contrarian_tail_size_mult,
            round_legs_total: legs_total,
            round_legs_same_side: legs_same,
            can_superbet: stats.can_superbet(now, cfg.sizing.super_bet_cooldown_s),
        },
    );
    let mut notional = size_result.notional;
    if size_result.superbet_floor_applied {
        reasons.push("superbet_floor".into());
    }

    // ── Booster add-on path ──────────────────────────────────────────────
    let mut booster_mode = false;
    if let Some(b) = booster {
        let bc = &cfg.booster;
        if stats.booster_locked(now) {
            return Err(SkipReason::BoosterLocked);
        }
        if !is_core || mins_left < bc.min_left_hard_15m {
            return Err(SkipReason::BoosterOutsideWindow);
        }
        if side != b.side {
            return Err(SkipReason::BoosterQualityWeak);
        }
        if b.used >= bc.max_per_cid {
            return Err(SkipReason::BoosterCapReached);
        }
        let in_ideal = mins_left >= bc.ideal_min_left_15m && mins_left <= bc.ideal_max_left_15m;
        if !bc.anytime_15m && !in_ideal {
            return Err(SkipReason::BoosterOutsideWindow);
        }
        let conv = features::booster_conviction(snap, side, tf_votes, oracle_agree);
        let quality_ok = score >= bc.min_score
            && true_prob >= bc.min_true_prob
            && edge >= bc.min_edge
            && execution_ev >= bc.min_ev_net
            && payout_mult >= bc.min_payout
            && entry <= bc.max_entry
            && snap.derivs.vol_ratio >= bc.min_vol_ratio
            && conv >= bc.min_conviction;
        if !quality_ok {
            return Err(SkipReason::BoosterQualityWeak);
        }
        let pct = if score >= bc.min_score + 2 && true_prob >= bc.min_true_prob + 0.03 {
            bc.size_pct_high
        } else {
            bc.size_pct
        };
        let mut b_size = (bankroll * pct).max(cfg.sizing.min_bet_abs);
        if b.prev_stake > 0.0 {
            b_size = b_size.min((b.prev_stake * bc.prev_size_cap_mult).max(cfg.sizing.min_bet_abs));
        }
        notional = notional.min(b_size);
        booster_mode = true;
        reasons.push("booster_addon".into());
    }

    if notional < cfg.sizing.min_exec_notional {
        return Err(SkipReason::NotionalBelowMin);
    }

    // ── Execution mode ───────────────────────────────────────────────────
    let near_expiry = (round.end_ts - now) <= cfg.exec.fast_taker_near_end_s;
    let mut force_taker = !use_limit
        && !contrarian_tail
        && ((score >= cfg.exec.force_taker_score
            && feat.very_strong_mom
            && feat.imbalance_confirms
            && move_pct > cfg.exec.force_taker_move_min)
            || (score >= cfg.exec.force_taker_score && feat.early_continuation)
            || (score >= cfg.exec.fast_exec_score
                && edge >= cfg.exec.fast_exec_edge
                && entry <= s.max_entry_price));
    if near_expiry {
        force_taker = true;
        use_limit = false;
    }
    let mode = if use_limit {
        ExecutionMode::LimitGtc
    } else if force_taker {
        ExecutionMode::TakerFok
    } else {
        ExecutionMode::Maker
    };

    let token_id = round.token_for(side).to_string();
    if token_id.is_empty() {
        return Err(SkipReason::BookWsMissing);
    }

    let true_prob = true_prob.clamp(s.prob_clamp_min, s.prob_clamp_max);
    let signal = Signal {
        cid: round.cid.clone(),
        asset: round.asset,
        duration,
        side,
        token_id,
        score,
        true_prob,
        // The published edge is the model-vs-market gap at the actual entry.
        edge: true_prob - entry,
        entry,
        notional_usdc: notional,
        mode,
        tier,
        source,
        ev_net,
        execution_ev,
        payout_mult,
        min_payout_req: window.min_payout,
        max_entry_allowed: window.max_entry,
        min_entry_allowed: window.min_entry,
        analysis_quality: quality,
        analysis_conviction: conviction,
        open_price: open,
        open_price_source: open_src,
        decision_price: current,
        decision_source: px_src,
        oracle_age_s: oracle_age,
        oracle_agrees: oracle_agree,
        mins_left,
        booster: booster_mode,
        contrarian_tail,
        reasons,
    };
    debug_assert!(signal.validate().is_ok());
    Ok(signal)
}

struct SeenRing {
    order: VecDeque<String>,
    set: HashSet<String>,
    cap: usize,
}

impl SeenRing {
    fn new(cap: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(cap),
            set: HashSet::with_capacity(cap),
            cap: cap.max(16),
        }
    }

    fn contains(&self, cid: &str) -> bool {
        self.set.contains(cid)
    }

    fn push(&mut self, cid: String) {
        if self.set.insert(cid.clone()) {
            self.order.push_back(cid);
            while self.order.len() > self.cap {
                if let Some(old) = self.order.pop_front() {
                    self.set.remove(&old);
                }
            }
        }
    }
}

struct CacheEntry {
    at: Instant,
    late_relax: bool,
    decision: Decision,
}

/// Stateful wrapper: de-dup, booster detection, debounce and skip metrics.
pub struct Scorer {
    cfg: Arc<Config>,
    seen: Mutex<SeenRing>,
    booster_used: Mutex<HashMap<String, u32>>,
    cache: Mutex<HashMap<String, CacheEntry>>,
    skips: Mutex<VecDeque<(SkipReason, i64)>>,
}

impl Scorer {
    pub fn new(cfg: Arc<Config>) -> Self {
        let cap = cfg.scorer.seen_ring_len;
        Self {
            cfg,
            seen: Mutex::new(SeenRing::new(cap)),
            booster_used: Mutex::new(HashMap::new()),
            cache: Mutex::new(HashMap::new()),
            skips: Mutex::new(VecDeque::with_capacity(512)),
        }
    }

    pub fn decide(
        &self,
        snap: &RoundSnapshot,
        portfolio: &PortfolioView,
        stats: &StatsEngine,
        late_relax: bool,
    ) -> Decision {
        let cid = &snap.round.cid;

        // Per-round de-dup; an already-entered round is only revisited as a
        // same-side booster on a confirmed position.
        let booster_ctx = if self.seen.lock().contains(cid) {
            if !self.cfg.booster.enabled {
                return self.record(SkipReason::AlreadySeen, snap.now_ts);
            }
            match portfolio.positions.get(cid) {
                Some(p) if p.core_position && p.cost_usdc > 0.0 => Some(BoosterCtx {
                    side: p.side,
                    prev_stake: p.cost_usdc,
                    used: self.booster_used.lock().get(cid).copied().unwrap_or(0),
                }),
                _ => return self.record(SkipReason::AlreadySeen, snap.now_ts),
            }
        } else {
            None
        };

        // Debounce: identical re-asks inside the window reuse the result.
        {
            let cache = self.cache.lock();
            if let Some(entry) = cache.get(cid) {
                let fresh = entry.at.elapsed().as_millis() as u64 <= self.cfg.scorer.debounce_ms;
                if fresh && entry.late_relax == late_relax {
                    return entry.decision.clone();
                }
            }
        }

        let decision = match evaluate(
            &self.cfg,
            snap,
            portfolio,
            stats,
            booster_ctx.as_ref(),
            late_relax,
        ) {
            Ok(sig) => Decision::Emit(sig),
            Err(reason) => {
                self.note_skip(reason, snap.now_ts);
                Decision::Skip(reason)
            }
        };

        let mut cache = self.cache.lock();
        if cache.len() > 256 {
            cache.retain(|_, e| e.at.elapsed().as_secs() < 60);
        }
        cache.insert(
            cid.clone(),
            CacheEntry {
                at: Instant::now(),
                late_relax,
                decision: decision.clone(),
            },
        );
        decision
    }

    fn record(&self, reason: SkipReason, now_ts: i64) -> Decision {
        self.note_skip(reason, now_ts);
        Decision::Skip(reason)
    }

    fn note_skip(&self, reason: SkipReason, now_ts: i64) {
        let mut skips = self.skips.lock();
        skips.push_back((reason, now_ts));
        while skips.len() > 512 {
            skips.pop_front();
        }
    }

    /// Top skip reasons over the rolling diagnostics window.
    pub fn skip_top(&self, n: usize) -> Vec<(SkipReason, usize)> {
        let skips = self.skips.lock();
        let mut counts: HashMap<SkipReason, usize> = HashMap::new();
        for (reason, _) in skips.iter() {
            *counts.entry(*reason).or_default() += 1;
        }
        let mut rows: Vec<(SkipReason, usize)> = counts.into_iter().collect();
        rows.sort_by(|a, b| b.1.cmp(&a.1));
        rows.truncate(n);
        rows
    }

    /// Called after an order is accepted for a round.
    pub fn mark_entered(&self, cid: &str) {
        self.seen.lock().push(cid.to_string());
        self.cache.lock().remove(cid);
    }

    pub fn mark_booster_used(&self, cid: &str) {
        *self.booster_used.lock().entry(cid.to_string()).or_default() += 1;
        self.cache.lock().remove(cid);
    }

    pub fn seen_cids(&self) -> Vec<String> {
        self.seen.lock().order.iter().cloned().collect()
    }

    /// Restore the seen ring from persisted state at boot.
    pub fn restore_seen(&self, cids: Vec<String>) {
        let mut seen = self.seen.lock();
        for cid in cids {
            seen.push(cid);
        }
    }
}

#[cfg(test)]
pub(crate) mod testkit {
    use crate::config::Config;
    use crate::feeds::derivs::DerivsView;
    use crate::feeds::price::AssetTech;
    use crate::models::{Asset, OpenPriceSource, Round, RoundDuration};
    use crate::portfolio::PortfolioView;
    use crate::snapshot::{Quote, RoundSnapshot};

    pub fn config() -> Config {
        Config::from_env()
    }

    /// A healthy mid-window 15m BTC snapshot with fresh feeds.
    pub fn snapshot(asset: Asset) -> RoundSnapshot {
        RoundSnapshot {
            round: Round {
                cid: "0xround".into(),
                asset,
                duration: RoundDuration::M15,
                start_ts: 1_700_000_100,
                end_ts: 1_700_001_000,
                question: format!("{asset} Up or Down?"),
                token_up: "tok-up".into(),
                token_down: "tok-down".into(),
                up_price: 0.55,
            },
            now_ts: 1_700_000_500,
            quote: Some(Quote {
                price: 60_180.0,
                age_ms: 120.0,
            }),
            oracle_price: Some(60_170.0),
            oracle_age_s: Some(5.0),
            open_price: Some(60_000.0),
            open_source: OpenPriceSource::Indexer,
            prev_open: None,
            book_up: None,
            book_down: None,
            book_strict_cap_ms: 2_000.0,
            tech: AssetTech::neutral(asset),
            derivs: DerivsView::neutral(),
            flow: None,
            cross_hints: vec![],
            btc_lead_prob: 0.5,
        }
    }

    pub fn portfolio(bankroll: f64) -> PortfolioView {
        PortfolioView {
            updated_ts: 1_700_000_500,
            wallet_usdc: bankroll,
            open_stake_total: 0.0,
            open_mark_value: 0.0,
            settling_claim_total: 0.0,
            total_equity: bankroll,
            baseline_equity: Some(bankroll),
            drawdown_pct: 0.0,
            choppy_regime: false,
            reserved_usdc: 0.0,
            positions: std::collections::HashMap::new(),
            settling: vec![],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feeds::book::BookSource;
    use crate::models::Asset;
    use crate::stats::StatsEngine;
    use super::testkit::{config, portfolio, snapshot};

    fn strong_bull_snapshot() -> RoundSnapshot {
        let mut snap = snapshot(Asset::Btc);
        snap.derivs.volume_ready = true;
        snap.derivs.ob_imbalance = 0.35;
        snap.derivs.taker_ratio = 0.64;
        snap.derivs.vol_ratio = 1.9;
        snap.derivs.vol_mult = 1.2;
        snap.derivs.vwap_dev = 0.0015;
        snap.tech.mom_5s = 0.85;
        snap.tech.mom_30s = 0.82;
        snap.tech.mom_180s = 0.75;
        snap.tech.mom_kalman = 0.80;
        snap.tech.sigma_per_sqrt_s = Some(2.0e-5);
        snap.tech.ema_5s = Some(60_160.0);
        snap.tech.ema_60s = Some(60_040.0);
        snap.tech.kalman_vel = Some(1.5);
        snap.tech.rsi = 68.0;
        snap.tech.williams_r = -12.0;
        snap.book_up = Some(BookView {
            token_id: "tok-up".into(),
            best_bid: 0.57,
            best_ask: 0.58,
            asks: vec![(0.58, 500.0), (0.59, 800.0)],
            tick_size: 0.01,
            age_ms: 200.0,
            source: BookSource::Ws,
        });
        snap.book_down = Some(BookView {
            token_id: "tok-down".into(),
            best_bid: 0.42,
            best_ask: 0.43,
            asks: vec![(0.43, 400.0)],
            tick_size: 0.01,
            age_ms: 200.0,
            source: BookSource::Ws,
        });
        snap.flow = Some(crate::feeds::copyflow::FlowView {
            up_conf: 0.62,
            down_conf: 0.12,
            sample_n: 40,
            avg_entry_c: 52.0,
            low_c_share: 0.2,
            high_c_share: 0.4,
            age_s: 4.0,
        });
        snap.cross_hints = vec![
            (Asset::Eth, Some(Side::Up)),
            (Asset::Sol, Some(Side::Up)),
            (Asset::Xrp, None),
        ];
        snap
    }

    #[test]
    fn strong_uptrend_emits_accepted_signal() {
        let cfg = config();
        let snap = strong_bull_snapshot();
        let view = portfolio(500.0);
        let stats = StatsEngine::new();
        let sig = evaluate(&cfg, &snap, &view, &stats, None, false).expect("signal");
        assert_eq!(sig.side, Side::Up);
        assert!(sig.score >= 12, "score={}", sig.score);
        assert!(sig.true_prob >= 0.58, "prob={}", sig.true_prob);
        assert!((sig.entry - 0.58).abs() < 0.02);
        assert!(sig.notional_usdc >= 1.0);
        assert!(sig.validate().is_ok());
        // Published edge is the model-market gap at entry.
        assert!((sig.edge - (sig.true_prob - sig.entry)).abs() < 1e-12);
    }

    #[test]
    fn stale_oracle_rejects_candidate() {
        let cfg = config();
        let mut snap = strong_bull_snapshot();
        snap.oracle_age_s = Some(95.0);
        let view = portfolio(500.0);
        let stats = StatsEngine::new();
        let err = evaluate(&cfg, &snap, &view, &stats, None, false).unwrap_err();
        assert_eq!(err, SkipReason::OracleTooOld);
    }

    #[test]
    fn missing_book_rejects_with_reason() {
        let cfg = config();
        let mut snap = strong_bull_snapshot();
        snap.book_up = None;
        snap.book_down = None;
        let view = portfolio(500.0);
        let stats = StatsEngine::new();
        let err = evaluate(&cfg, &snap, &view, &stats, None, false).unwrap_err();
        assert_eq!(err, SkipReason::BookWsMissing);
    }

    #[test]
    fn weak_flat_market_hits_score_or_prob_gate() {
        let cfg = config();
        let mut snap = snapshot(Asset::Eth);
        snap.quote = Some(crate::snapshot::Quote {
            price: 3_000.20,
            age_ms: 100.0,
        });
        snap.oracle_price = Some(3_000.15);
        snap.open_price = Some(3_000.0);
        snap.derivs.volume_ready = true;
        snap.book_up = Some(BookView {
            token_id: "tok-up".into(),
            best_bid: 0.51,
            best_ask: 0.52,
            asks: vec![(0.52, 300.0)],
            tick_size: 0.01,
            age_ms: 150.0,
            source: BookSource::Ws,
        });
        let view = portfolio(500.0);
        let stats = StatsEngine::new();
        let err = evaluate(&cfg, &snap, &view, &stats, None, false).unwrap_err();
        assert!(
            matches!(
                err,
                SkipReason::ScoreBelowGate
                    | SkipReason::ProbBelowGate
                    | SkipReason::WinModeProbLow
                    | SkipReason::WinModeEdgeLow
            ),
            "unexpected reason {err:?}"
        );
    }

    #[test]
    fn near_expiry_forces_fok() {
        let cfg = config();
        let mut snap = strong_bull_snapshot();
        // 100 seconds remaining: inside the fast-taker window but still
        // above the minimum remaining-window fraction for a 15m round is
        // not possible, so use a longer elapsed round with relaxed timing.
        snap.now_ts = snap.round.end_ts - 130;
        let view = portfolio(500.0);
        let stats = StatsEngine::new();
        match evaluate(&cfg, &snap, &view, &stats, None, false) {
            Ok(sig) => assert_eq!(sig.mode, ExecutionMode::TakerFok),
            Err(reason) => assert!(
                matches!(
                    reason,
                    SkipReason::WindowTooLate | SkipReason::ConsistencyProbLow
                ),
                "unexpected {reason:?}"
            ),
        }
    }

    #[test]
    fn scorer_dedups_and_reports_skips() {
        let cfg = Arc::new(config());
        let scorer = Scorer::new(cfg);
        let snap = strong_bull_snapshot();
        let view = portfolio(500.0);
        let stats = StatsEngine::new();

        let first = scorer.decide(&snap, &view, &stats, false);
        assert!(matches!(first, Decision::Emit(_)));
        scorer.mark_entered(&snap.round.cid);

        // Without a confirmed position the same round is now skipped.
        let second = scorer.decide(&snap, &view, &stats, false);
        assert!(matches!(second, Decision::Skip(SkipReason::AlreadySeen)));
        let top = scorer.skip_top(3);
        assert!(top.iter().any(|(r, _)| *r == SkipReason::AlreadySeen));
    }

    #[test]
    fn debounce_reuses_recent_decision() {
        let cfg = Arc::new(config());
        let scorer = Scorer::new(cfg);
        let snap = strong_bull_snapshot();
        let view = portfolio(500.0);
        let stats = StatsEngine::new();

        let a = scorer.decide(&snap, &view, &stats, false);
        let b = scorer.decide(&snap, &view, &stats, false);
        match (a, b) {
            (Decision::Emit(x), Decision::Emit(y)) => {
                assert_eq!(x.notional_usdc, y.notional_usdc);
                assert_eq!(x.entry, y.entry);
            }
            other => panic!("expected two emits, got {other:?}"),
        }
    }

    #[test]
    fn booster_requires_confirmed_same_side_position() {
        let cfg = Arc::new(config());
        let scorer = Scorer::new(cfg.clone());
        let snap = strong_bull_snapshot();
        let stats = StatsEngine::new();

        let mut view = portfolio(500.0);
        scorer.mark_entered(&snap.round.cid);

        // Confirmed Up position enables the booster path.
        view.positions.insert(
            snap.round.cid.clone(),
            crate::models::Position {
                cid: snap.round.cid.clone(),
                asset: Asset::Btc,
                duration: crate::models::RoundDuration::M15,
                side: Side::Up,
                shares: 20.0,
                cost_usdc: 11.0,
                value_now_usdc: 11.5,
                avg_price: 0.55,
                opened_ts: snap.now_ts - 60,
                start_ts: snap.round.start_ts,
                end_ts: snap.round.end_ts,
                add_on_count: 0,
                core_position: true,
            },
        );
        match scorer.decide(&snap, &view, &stats, false) {
            Decision::Emit(sig) => {
                assert!(sig.booster);
                assert_eq!(sig.side, Side::Up);
                // Booster stays small relative to the existing stake.
                assert!(sig.notional_usdc <= 11.0 * cfg.booster.prev_size_cap_mult + 1e-9);
            }
            Decision::Skip(reason) => {
                // Acceptable only if the add-on quality gate said no.
                assert_eq!(reason, SkipReason::BoosterQualityWeak);
            }
        }
    }
}
