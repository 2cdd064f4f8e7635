//! Probability synthesis.
//!
//! Independent signals are combined as a log-likelihood ratio, squashed
//! through a logistic, biased for the `≥` tie rule, then shrunk by the
//! online calibration factor and rebalanced by per-side priors. A final
//! rescale toward 0.5 applies under degraded analysis quality.

use statrs::distribution::{ContinuousCDF, Normal};

use crate::config::ScorerConfig;
use crate::feeds::analytics::logistic;
use crate::models::Side;
use crate::snapshot::RoundSnapshot;

/// Log-likelihood combination of the snapshot's directional evidence into
/// P(Up). The caller applies calibration shrinks afterwards.
pub fn synthesize_prob_up(
    cfg: &ScorerConfig,
    snap: &RoundSnapshot,
    decision_price: f64,
    open_price: f64,
    oracle_agrees_up: bool,
    regime_mult: f64,
) -> f64 {
    let tech = &snap.tech;
    let derivs = &snap.derivs;
    let mut llr = 0.0;

    // 1. Price displacement z-score over the round's horizon.
    if open_price > 0.0 {
        if let Some(sigma) = tech.sigma_per_sqrt_s {
            let window_sigma = (sigma * (snap.round.duration.secs() as f64).sqrt()).max(1e-9);
            llr += (decision_price - open_price) / open_price / window_sigma * cfg.llr_price_mult;
        }
    }

    // 2. Short vs long EMA cross.
    if let (Some(ema5), Some(ema60)) = (tech.ema_5s, tech.ema_60s) {
        if ema60 > 0.0 {
            llr += (ema5 / ema60 - 1.0) * cfg.llr_ema_mult;
        }
    }

    // 3. Kalman velocity, normalized by per-second vol.
    if let (Some(vel), Some(sigma)) = (tech.kalman_vel, tech.sigma_per_sqrt_s) {
        if decision_price > 0.0 && sigma > 0.0 {
            llr += (vel / decision_price) / sigma * cfg.llr_kalman_mult;
        }
    }

    // 4. Depth-weighted book imbalance.
    llr += derivs.ob_imbalance * cfg.llr_ob_mult;

    // 5. Taker flow.
    llr += (derivs.taker_ratio - 0.5) * cfg.llr_taker_mult;

    // 6. Perp basis, capped.
    if derivs.perp_basis.abs() > 1e-7 {
        let scaled = (derivs.perp_basis.abs() * cfg.llr_perp_mult).min(cfg.llr_perp_cap);
        llr += scaled.copysign(derivs.perp_basis);
    }

    // 7. Oracle agreement.
    if oracle_agrees_up {
        llr += cfg.llr_oracle_agree;
    } else {
        llr -= cfg.llr_oracle_disagree;
    }

    // 8. BTC lead for altcoins.
    if snap.round.asset != crate::models::Asset::Btc {
        llr += (snap.btc_lead_prob - 0.5) * cfg.llr_btc_lead_mult;
    }

    // 9. Regime scale.
    llr *= regime_mult;

    let p = logistic(llr.clamp(-cfg.llr_clamp, cfg.llr_clamp));
    // Structural tie bias: exact oracle tie resolves Up.
    (p + cfg.tie_bias_up).min(1.0)
}

pub fn shrink_toward_half(p: f64, factor: f64) -> f64 {
    0.5 + (p - 0.5) * factor.clamp(0.0, 1.0)
}

/// Rebalance P(Up) with per-side prior adjustments so the pair still sums
/// to one after clamping.
pub fn rebalance_with_side_priors(
    cfg: &ScorerConfig,
    prob_up: f64,
    up_adj: f64,
    dn_adj: f64,
) -> f64 {
    if up_adj.abs() < 1e-9 && dn_adj.abs() < 1e-9 {
        return prob_up.clamp(cfg.prob_clamp_min, cfg.prob_clamp_max);
    }
    let pu = (prob_up + up_adj).clamp(0.02, 0.98);
    let pd = ((1.0 - prob_up) + dn_adj).clamp(0.02, 0.98);
    let z = pu + pd;
    if z <= 0.0 {
        return prob_up.clamp(cfg.prob_clamp_min, cfg.prob_clamp_max);
    }
    (pu / z).clamp(cfg.prob_clamp_min, cfg.prob_clamp_max)
}

/// Quality rescale toward 0.5: weak data cannot carry a strong posterior.
pub fn quality_rescale(cfg: &ScorerConfig, prob_up: f64, analysis_quality: f64) -> f64 {
    let scale_min = 0.55;
    let scale_max = 1.0;
    let scale = scale_min + (scale_max - scale_min) * analysis_quality.clamp(0.0, 1.0);
    shrink_toward_half(prob_up, scale).clamp(cfg.prob_clamp_min, cfg.prob_clamp_max)
}

/// Binary-option time-lock probability: chance the price finishes on
/// `side` of the reference at window close, from N(d2) under driftless
/// lognormal dynamics. Neutral 0.5 when inputs are unusable.
pub fn binary_model_prob(
    current: f64,
    open_price: f64,
    sigma_annual: f64,
    mins_left: f64,
    side: Side,
) -> f64 {
    if !(current > 0.0 && open_price > 0.0 && sigma_annual > 0.0 && mins_left > 0.0) {
        return 0.5;
    }
    let t_years = (mins_left / 525_600.0).max(1e-9);
    let vol_sqrt_t = sigma_annual * t_years.sqrt();
    if vol_sqrt_t <= 0.0 {
        return 0.5;
    }
    let d2 = ((current / open_price).ln() - 0.5 * sigma_annual * sigma_annual * t_years) / vol_sqrt_t;
    let Ok(n) = Normal::new(0.0, 1.0) else {
        return 0.5;
    };
    let p_up = n.cdf(d2);
    let p = match side {
        Side::Up => p_up,
        Side::Down => 1.0 - p_up,
    };
    if p.is_finite() {
        p.clamp(0.0001, 0.9999)
    } else {
        0.5
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Asset;
    use crate::scorer::testkit::snapshot;

    fn cfg() -> ScorerConfig {
        crate::config::Config::from_env().scorer
    }

    #[test]
    fn bullish_evidence_raises_prob_up() {
        let cfg = cfg();
        let mut snap = snapshot(Asset::Btc);
        snap.tech.sigma_per_sqrt_s = Some(2e-5);
        snap.tech.ema_5s = Some(60_170.0);
        snap.tech.ema_60s = Some(60_050.0);
        snap.tech.kalman_vel = Some(2.0);
        snap.derivs.ob_imbalance = 0.35;
        snap.derivs.taker_ratio = 0.62;
        let p = synthesize_prob_up(&cfg, &snap, 60_180.0, 60_000.0, true, 1.0);
        assert!(p > 0.60, "p={p}");
    }

    #[test]
    fn oracle_disagreement_drags_prob_down() {
        let cfg = cfg();
        let snap = snapshot(Asset::Btc);
        let agree = synthesize_prob_up(&cfg, &snap, 60_000.0, 60_000.0, true, 1.0);
        let disagree = synthesize_prob_up(&cfg, &snap, 60_000.0, 60_000.0, false, 1.0);
        assert!(agree > disagree);
    }

    #[test]
    fn shrink_moves_toward_half() {
        assert!((shrink_toward_half(0.8, 0.5) - 0.65).abs() < 1e-12);
        assert_eq!(shrink_toward_half(0.8, 1.0), 0.8);
        assert_eq!(shrink_toward_half(0.3, 0.0), 0.5);
    }

    #[test]
    fn side_prior_rebalance_keeps_range() {
        let cfg = cfg();
        let p = rebalance_with_side_priors(&cfg, 0.60, 0.03, -0.02);
        assert!(p > 0.60 && p < 0.70);
        let unchanged = rebalance_with_side_priors(&cfg, 0.60, 0.0, 0.0);
        assert!((unchanged - 0.60).abs() < 1e-9);
    }

    #[test]
    fn degraded_quality_flattens_posterior() {
        let cfg = cfg();
        let strong = quality_rescale(&cfg, 0.75, 1.0);
        let weak = quality_rescale(&cfg, 0.75, 0.0);
        assert!(strong > weak);
        assert!(weak < 0.65);
    }

    #[test]
    fn binary_model_follows_displacement() {
        // Price above the reference with little time left: strong Up prob.
        let p = binary_model_prob(60_300.0, 60_000.0, 0.55, 2.0, Side::Up);
        assert!(p > 0.9, "p={p}");
        let p_dn = binary_model_prob(60_300.0, 60_000.0, 0.55, 2.0, Side::Down);
        assert!((p + p_dn - 1.0).abs() < 1e-9);
        assert_eq!(binary_model_prob(0.0, 60_000.0, 0.55, 2.0, Side::Up), 0.5);
    }
}
