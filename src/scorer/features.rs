//! Direction selection and integer feature scoring.
//!
//! Each feature adds or removes whole points from the candidate score, with
//! two hard blocks (extreme opposite book imbalance, jump against the
//! chosen direction). Direction itself prefers realized price movement,
//! then the oracle, then momentum consensus, with the `≥` tie resolving Up
//! to match on-chain settlement.

use crate::config::ScorerConfig;
use crate::feeds::derivs::DerivsView;
use crate::feeds::price::AssetTech;
use crate::models::{Side, SkipReason};
use crate::snapshot::RoundSnapshot;

/// Momentum votes per side from the multi-horizon EMA probs + Kalman.
pub fn momentum_votes(tech: &AssetTech, cfg: &ScorerConfig) -> (u32, u32) {
    let probs = [tech.mom_5s, tech.mom_30s, tech.mom_180s, tech.mom_kalman];
    let up = probs.iter().filter(|p| **p > cfg.mom_thresh_up).count() as u32;
    let dn = probs.iter().filter(|p| **p < cfg.mom_thresh_dn).count() as u32;
    (up, dn)
}

#[derive(Debug, Clone, Copy)]
pub struct DirectionPick {
    pub direction: Side,
    pub score_pen: i32,
    pub edge_pen: f64,
    /// Price-derived direction conflicted with the oracle and was realigned.
    pub conflict: bool,
}

/// Oracle direction from its own move off the reference price.
pub fn oracle_direction(
    oracle_price: Option<f64>,
    open_price: f64,
    min_move: f64,
) -> Option<Side> {
    let op = oracle_price?;
    if open_price <= 0.0 || op <= 0.0 {
        return None;
    }
    let move_pct = (op - open_price).abs() / open_price;
    if move_pct < min_move {
        return None;
    }
    Some(if op > open_price { Side::Up } else { Side::Down })
}

#[allow(clippy::too_many_arguments)]
pub fn pick_direction(
    cfg: &ScorerConfig,
    signed_move: f64,
    move_pct: f64,
    oracle_dir: Option<Side>,
    oracle_age_s: Option<f64>,
    oracle_above_or_at_open: Option<bool>,
    tf_up: u32,
    tf_dn: u32,
) -> DirectionPick {
    if move_pct >= cfg.dir_move_min {
        let mut direction = if signed_move > 0.0 { Side::Up } else { Side::Down };
        // Small move that disagrees with the oracle: realign to the oracle
        // and penalize rather than skipping.
        if let Some(od) = oracle_dir {
            if od != direction && move_pct < cfg.dir_conflict_move_max {
                let oracle_fresh = oracle_age_s.map(|a| a <= 30.0).unwrap_or(false);
                if oracle_fresh {
                    direction = od;
                }
                return DirectionPick {
                    direction,
                    score_pen: cfg.dir_conflict_score_pen,
                    edge_pen: cfg.dir_conflict_edge_pen,
                    conflict: true,
                };
            }
        }
        return DirectionPick {
            direction,
            score_pen: 0,
            edge_pen: 0.0,
            conflict: false,
        };
    }
    if let Some(od) = oracle_dir {
        return DirectionPick {
            direction: od,
            score_pen: 0,
            edge_pen: 0.0,
            conflict: false,
        };
    }
    let direction = if tf_up > tf_dn {
        Side::Up
    } else if tf_dn > tf_up {
        Side::Down
    } else {
        // Flat everything: the `≥` resolution rule makes Up the default.
        match oracle_above_or_at_open {
            Some(false) => Side::Down,
            _ => Side::Up,
        }
    };
    DirectionPick {
        direction,
        score_pen: 0,
        edge_pen: 0.0,
        conflict: false,
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FeatureScore {
    pub score: i32,
    pub regime_mult: f64,
    pub cross_count: u32,
    pub cross_contra: u32,
    pub ofi_surge: bool,
    pub imbalance_confirms: bool,
    pub very_strong_mom: bool,
    pub early_continuation: bool,
}

/// Signed book imbalance for a side.
pub fn ob_signal(derivs: &DerivsView, side: Side) -> f64 {
    match side {
        Side::Up => derivs.ob_imbalance,
        Side::Down => -derivs.ob_imbalance,
    }
}

/// Whether the oracle currently agrees with a side, under the `≥` tie rule.
pub fn oracle_agrees(oracle_price: Option<f64>, open_price: f64, side: Side) -> bool {
    match oracle_price {
        Some(op) if op > 0.0 && open_price > 0.0 => match side {
            Side::Up => op >= open_price,
            Side::Down => op < open_price,
        },
        _ => true,
    }
}

/// The full additive feature pass for a chosen direction. Hard blocks
/// surface as skip reasons.
#[allow(clippy::too_many_arguments)]
pub fn score_features(
    cfg: &ScorerConfig,
    snap: &RoundSnapshot,
    direction: Side,
    tf_up: u32,
    tf_dn: u32,
    move_pct: f64,
    pct_remaining: f64,
    prev_win_dir: Option<Side>,
) -> Result<FeatureScore, SkipReason> {
    let derivs = &snap.derivs;
    let tech = &snap.tech;
    let is_up = direction == Side::Up;
    let tf_votes = if is_up { tf_up } else { tf_dn };
    let mut out = FeatureScore {
        regime_mult: 1.0,
        ..FeatureScore::default()
    };
    let mut score: i32 = 0;

    // Entry timing: earlier in the window the book has repriced less.
    if pct_remaining >= cfg.timing_pct_2 {
        score += 2;
    } else if pct_remaining >= cfg.timing_pct_1 {
        score += 1;
    }

    // Move magnitude buckets; a flat tape is still tradeable on momentum.
    if move_pct >= cfg.move_t3 {
        score += 3;
    } else if move_pct >= cfg.move_t2 {
        score += 2;
    } else if move_pct >= cfg.move_t1 {
        score += 1;
    }

    // Multi-horizon momentum + Kalman votes.
    score += match tf_votes {
        4 => 4,
        3 => 3,
        2 => 1,
        _ => 0,
    };
    out.very_strong_mom = tf_votes >= 3;

    // Jump detection: a sudden move against the direction is a hard abort.
    if let Some(jdir) = tech.jump_dir {
        if jdir != direction {
            return Err(SkipReason::JumpAgainstDirection);
        }
        score += cfg.jump_confirm_score;
    }

    // Depth-weighted book imbalance with a hard block on extreme contra.
    let ob_sig = ob_signal(derivs, direction);
    if ob_sig < cfg.ob_hard_block {
        return Err(SkipReason::BookHardBlock);
    }
    if ob_sig > cfg.ob_t3 {
        score += 3;
    } else if ob_sig > cfg.ob_t2 {
        score += 2;
    } else if ob_sig > cfg.ob_t1 {
        score += 1;
    } else {
        score -= 1;
    }
    out.imbalance_confirms = ob_sig > cfg.imbalance_confirm_min;

    // Taker flow and volume expansion vs baseline.
    let tk = derivs.taker_ratio;
    if (is_up && tk > cfg.taker_t3) || (!is_up && tk < 1.0 - cfg.taker_t3) {
        score += 3;
    } else if (is_up && tk > cfg.taker_t2) || (!is_up && tk < 1.0 - cfg.taker_t2) {
        score += 2;
    } else if (tk - 0.5).abs() < cfg.taker_neutral_band {
        score += 1;
    } else {
        score -= 1;
    }
    if derivs.vol_ratio > cfg.vol_t2 {
        score += 2;
    } else if derivs.vol_ratio > cfg.vol_t1 {
        score += 1;
    }

    // Perp basis: premium = crowded leveraged longs.
    let basis = derivs.perp_basis;
    let basis_confirms = (is_up && basis > cfg.perp_confirm) || (!is_up && basis < -cfg.perp_confirm);
    let basis_strong = (is_up && basis > cfg.perp_strong) || (!is_up && basis < -cfg.perp_strong);
    let basis_contra = (is_up && basis < -cfg.perp_confirm) || (!is_up && basis > cfg.perp_confirm);
    if basis_strong {
        score += 2;
    } else if basis_confirms {
        score += 1;
    } else if basis_contra {
        score -= 1;
    }

    // Funding extremes: crowding is contrarian.
    let f = derivs.funding_rate;
    if !is_up && f > cfg.funding_pos_strong {
        score += 1;
    } else if is_up && f < cfg.funding_neg_confirm {
        score += 1;
    } else if is_up && f > cfg.funding_pos_extreme {
        score -= 1;
    } else if !is_up && f < cfg.funding_neg_strong {
        score -= 1;
    }

    // Liquidations on the opposing side confirm the move.
    let opposing_liq = if is_up {
        derivs.liq_short_notional
    } else {
        derivs.liq_long_notional
    };
    let supporting_liq = if is_up {
        derivs.liq_long_notional
    } else {
        derivs.liq_short_notional
    };
    if opposing_liq > 100_000.0 && opposing_liq > supporting_liq * 2.0 {
        score += 2;
    } else if opposing_liq > 25_000.0 && opposing_liq > supporting_liq {
        score += 1;
    }

    // Open-interest delta confirms momentum.
    if let Some(oi) = derivs.oi_delta {
        if (is_up && oi > cfg.oi_delta_up) || (!is_up && oi < cfg.oi_delta_dn) {
            score += 1;
        } else if (is_up && oi < cfg.oi_delta_dn) || (!is_up && oi > cfg.oi_delta_up) {
            score -= 1;
        }
    }

    // Long/short crowding extremes.
    if is_up && derivs.ls_ratio > cfg.ls_long_extreme {
        score -= 1;
    } else if !is_up && derivs.ls_ratio < cfg.ls_short_extreme {
        score -= 1;
    }

    // VWAP deviation in the bet direction.
    let vwap_net = if is_up { derivs.vwap_dev } else { -derivs.vwap_dev };
    if vwap_net > cfg.vwap_t2 {
        score += 2;
    } else if vwap_net > cfg.vwap_t1 {
        score += 1;
    } else if vwap_net < -cfg.vwap_t2 {
        score -= 2;
    } else if vwap_net < -cfg.vwap_t1 {
        score -= 1;
    }

    // Vol-normalized displacement from the reference price.
    if let (Some(open), Some(sigma)) = (snap.open_price, tech.sigma_per_sqrt_s) {
        if open > 0.0 && sigma > 0.0 {
            let window_sigma = sigma * (snap.round.duration.secs() as f64).sqrt();
            if let Some(px) = tech.last_price {
                let disp = (px - open) / open * if is_up { 1.0 } else { -1.0 };
                if disp > window_sigma * cfg.disp_sigma_strong {
                    score += 2;
                } else if disp > window_sigma * cfg.disp_sigma_mid {
                    score += 1;
                } else if disp < -window_sigma * cfg.disp_sigma_strong {
                    score -= 2;
                } else if disp < -window_sigma * cfg.disp_sigma_mid {
                    score -= 1;
                }
            }
        }
    }

    // Cross-asset consensus.
    let mut cross_count = 0u32;
    let mut cross_contra = 0u32;
    for (_, hint) in &snap.cross_hints {
        match hint {
            Some(h) if *h == direction => cross_count += 1,
            Some(_) => cross_contra += 1,
            None => {}
        }
    }
    if cross_count == 3 {
        score += 2;
    } else if cross_count >= 2 {
        score += 1;
    } else if cross_contra == 3 {
        score -= 2;
    } else if cross_contra >= 2 {
        score -= 1;
    }
    out.cross_count = cross_count;
    out.cross_contra = cross_contra;

    // Window-open OFI surge on core rounds.
    if snap.round.duration.is_core() && pct_remaining >= 0.70 {
        let surge = derivs.ofi;
        let confirms = (is_up && surge >= 0.45) || (!is_up && surge <= -0.45);
        if confirms {
            score += 2;
            out.ofi_surge = true;
        }
    }

    // BTC-lead signal for altcoins.
    if snap.round.asset != crate::models::Asset::Btc {
        let lead = snap.btc_lead_prob;
        if (is_up && lead > cfg.btc_lead_t2) || (!is_up && lead < 1.0 - cfg.btc_lead_t2) {
            score += 2;
        } else if (is_up && lead > cfg.btc_lead_t1) || (!is_up && lead < 1.0 - cfg.btc_lead_t1) {
            score += 1;
        } else if (is_up && lead < 1.0 - cfg.btc_lead_t1) || (!is_up && lead > cfg.btc_lead_t1) {
            score -= 1;
        }
    }

    // Previous-round continuation needs realtime corroboration.
    if let Some(prev) = prev_win_dir {
        if prev == direction {
            let mut hits = 0;
            if tf_votes >= 3 {
                hits += 1;
            }
            if (is_up && tk > 0.54) || (!is_up && tk < 0.46) {
                hits += 1;
            }
            if ob_sig > 0.15 {
                hits += 1;
            }
            if hits >= 2 {
                score += if pct_remaining > 0.60 { 2 } else { 1 };
                out.early_continuation = pct_remaining > 0.60;
            }
        } else {
            score -= 1;
        }
    }

    // Regime detection: trending regimes make momentum more reliable.
    if tech.variance_ratio > cfg.regime_vr_trend && tech.autocorr > cfg.regime_ac_trend {
        score += 1;
        out.regime_mult = cfg.regime_mult_trend;
    } else if tech.variance_ratio < cfg.regime_vr_mr && tech.autocorr < cfg.regime_ac_mr {
        score -= 1;
        out.regime_mult = cfg.regime_mult_mr;
    }

    // Oscillator confirmation: RSI + Williams %R.
    let rsi = tech.rsi;
    let wr = tech.williams_r;
    if is_up && rsi >= cfg.rsi_overbought && wr >= cfg.wr_overbought {
        score += 2;
    } else if !is_up && rsi <= cfg.rsi_oversold && wr <= cfg.wr_oversold {
        score += 2;
    } else if is_up && (rsi >= cfg.rsi_overbought - 5.0 || wr >= cfg.wr_overbought + 5.0) {
        score += 1;
    } else if !is_up && (rsi <= cfg.rsi_oversold + 5.0 || wr <= cfg.wr_oversold - 5.0) {
        score += 1;
    }

    out.score = score;
    Ok(out)
}

/// Composite data-freshness quality in [0, 1] used to shrink the posterior.
#[allow(clippy::too_many_arguments)]
pub fn analysis_quality(
    ws_book_fresh: bool,
    rest_book_fresh: bool,
    leader_fresh: bool,
    oracle_fresh: bool,
    quote_fresh: bool,
    volume_ready: bool,
) -> f64 {
    let book = if ws_book_fresh {
        0.30
    } else if rest_book_fresh {
        0.18
    } else {
        0.0
    };
    let mut q: f64 = book;
    if leader_fresh {
        q += 0.15;
    }
    if oracle_fresh {
        q += 0.25;
    }
    if quote_fresh {
        q += 0.15;
    }
    if volume_ready {
        q += 0.15;
    }
    q.clamp(0.0, 1.0)
}

/// Signal-conviction composite in [0, 1] mixing microstructure alignment.
#[allow(clippy::too_many_arguments)]
pub fn analysis_conviction(
    snap: &RoundSnapshot,
    side: Side,
    tf_votes: u32,
    oracle_agree: bool,
    leader_net: Option<f64>,
    binary_model_prob: f64,
) -> f64 {
    let derivs = &snap.derivs;
    let sign = if side == Side::Up { 1.0 } else { -1.0 };
    let ob_c = ((ob_signal(derivs, side) + 0.3) / 0.9).clamp(0.0, 1.0);
    let tk_c = (((derivs.taker_ratio - 0.5) * sign + 0.12) / 0.24).clamp(0.0, 1.0);
    let tf_c = (tf_votes as f64 / 4.0).clamp(0.0, 1.0);
    let basis_c = ((sign * derivs.perp_basis + 0.001) / 0.002).clamp(0.0, 1.0);
    let vwap_c = ((sign * derivs.vwap_dev + 0.001) / 0.002).clamp(0.0, 1.0);
    let oracle_c = if oracle_agree { 1.0 } else { 0.0 };
    let leader_c = leader_net
        .map(|n| ((n + 1.0) / 2.0).clamp(0.0, 1.0))
        .unwrap_or(0.4);
    0.18 * ob_c
        + 0.16 * tk_c
        + 0.16 * tf_c
        + 0.08 * basis_c
        + 0.08 * vwap_c
        + 0.14 * oracle_c
        + 0.08 * leader_c
        + 0.12 * binary_model_prob.clamp(0.0, 1.0)
}

/// Booster conviction: stricter side-aligned composite for add-ons.
pub fn booster_conviction(snap: &RoundSnapshot, side: Side, tf_votes: u32, oracle_agree: bool) -> f64 {
    let derivs = &snap.derivs;
    let sign = if side == Side::Up { 1.0 } else { -1.0 };
    let ob_c = (ob_signal(derivs, side) / 0.5).clamp(-1.0, 1.0);
    let tf_c = ((tf_votes as f64 - 1.0) / 3.0).clamp(0.0, 1.0);
    let flow_c = (((derivs.taker_ratio - 0.5) * sign) * 8.0).clamp(-1.0, 1.0);
    let vol_c = ((derivs.vol_ratio - 0.8) / 1.2).clamp(0.0, 1.0);
    let basis_c = ((sign * derivs.perp_basis) / 0.0015).clamp(-1.0, 1.0);
    let vwap_c = ((sign * derivs.vwap_dev) / 0.0015).clamp(-1.0, 1.0);
    let oracle_c: f64 = if oracle_agree { 1.0 } else { -1.0 };
    0.26 * tf_c
        + 0.18 * ob_c.max(0.0)
        + 0.16 * flow_c.max(0.0)
        + 0.12 * vol_c
        + 0.10 * basis_c.max(0.0)
        + 0.08 * vwap_c.max(0.0)
        + 0.10 * oracle_c.max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Asset;
    use crate::scorer::testkit::snapshot;

    fn scorer_cfg() -> ScorerConfig {
        // Defaults from the environment-free constructor.
        crate::config::Config::from_env().scorer
    }

    #[test]
    fn direction_prefers_price_move() {
        let cfg = scorer_cfg();
        let pick = pick_direction(&cfg, 0.003, 0.003, Some(Side::Down), Some(5.0), Some(true), 0, 0);
        // Big move: price wins even against the oracle.
        assert_eq!(pick.direction, Side::Up);
        assert!(!pick.conflict);
    }

    #[test]
    fn small_conflicting_move_realigns_to_oracle() {
        let cfg = scorer_cfg();
        let pick = pick_direction(
            &cfg,
            0.0008,
            0.0008,
            Some(Side::Down),
            Some(5.0),
            Some(false),
            0,
            0,
        );
        assert_eq!(pick.direction, Side::Down);
        assert!(pick.conflict);
        assert!(pick.score_pen > 0);
    }

    #[test]
    fn flat_tape_defaults_up_on_tie() {
        let cfg = scorer_cfg();
        let pick = pick_direction(&cfg, 0.0, 0.0, None, None, Some(true), 1, 1);
        assert_eq!(pick.direction, Side::Up);
        let pick_dn = pick_direction(&cfg, 0.0, 0.0, None, None, Some(false), 1, 1);
        assert_eq!(pick_dn.direction, Side::Down);
    }

    #[test]
    fn extreme_contra_book_hard_blocks() {
        let cfg = scorer_cfg();
        let mut snap = snapshot(Asset::Btc);
        snap.derivs.ob_imbalance = -0.6; // against Up
        let err = score_features(&cfg, &snap, Side::Up, 4, 0, 0.003, 0.5, None).unwrap_err();
        assert_eq!(err, SkipReason::BookHardBlock);
    }

    #[test]
    fn jump_against_direction_blocks() {
        let cfg = scorer_cfg();
        let mut snap = snapshot(Asset::Btc);
        snap.tech.jump_dir = Some(Side::Down);
        snap.tech.jump_z = 4.0;
        let err = score_features(&cfg, &snap, Side::Up, 4, 0, 0.003, 0.5, None).unwrap_err();
        assert_eq!(err, SkipReason::JumpAgainstDirection);
    }

    #[test]
    fn aligned_bull_setup_scores_high() {
        let cfg = scorer_cfg();
        let mut snap = snapshot(Asset::Btc);
        snap.derivs.ob_imbalance = 0.4;
        snap.derivs.taker_ratio = 0.65;
        snap.derivs.vol_ratio = 2.0;
        snap.derivs.vwap_dev = 0.002;
        snap.tech.rsi = 70.0;
        snap.tech.williams_r = -10.0;
        let fs = score_features(&cfg, &snap, Side::Up, 4, 0, 0.003, 0.5, None).unwrap();
        assert!(fs.score >= 12, "score={}", fs.score);
        assert!(fs.imbalance_confirms);
        assert!(fs.very_strong_mom);
    }

    #[test]
    fn quality_composite_is_bounded() {
        let full = analysis_quality(true, false, true, true, true, true);
        assert!(full <= 1.0 && full > 0.9);
        let none = analysis_quality(false, false, false, false, false, false);
        assert_eq!(none, 0.0);
    }

    #[test]
    fn oracle_tie_counts_as_up_agreement() {
        assert!(oracle_agrees(Some(100.0), 100.0, Side::Up));
        assert!(!oracle_agrees(Some(100.0), 100.0, Side::Down));
        assert!(oracle_agrees(None, 100.0, Side::Down));
    }
}
