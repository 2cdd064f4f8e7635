//! End-to-end scorer scenarios over constructed snapshots, mirroring the
//! behaviors the system must exhibit live: clear trends fire aggressively,
//! weak tapes are skipped with reasons, contrarian tails size differently,
//! stale oracles reject, and the exposure rules hold.

use std::collections::HashMap;

use roundbot::config::Config;
use roundbot::feeds::book::{BookSource, BookView};
use roundbot::feeds::copyflow::FlowView;
use roundbot::feeds::derivs::DerivsView;
use roundbot::feeds::price::AssetTech;
use roundbot::models::{
    Asset, ExecutionMode, OpenPriceSource, Position, Round, RoundDuration, Side, SkipReason,
};
use roundbot::portfolio::{enforce_exposure, PortfolioView};
use roundbot::scorer;
use roundbot::snapshot::{Quote, RoundSnapshot};
use roundbot::stats::StatsEngine;

fn base_round(asset: Asset, up_price: f64) -> Round {
    Round {
        cid: "0xcond".into(),
        asset,
        duration: RoundDuration::M15,
        start_ts: 1_700_000_100,
        end_ts: 1_700_001_000,
        question: format!("{asset} Up or Down?"),
        token_up: "token-up".into(),
        token_down: "token-down".into(),
        up_price,
    }
}

fn fresh_book(token: &str, ask: f64) -> BookView {
    BookView {
        token_id: token.into(),
        best_bid: ask - 0.01,
        best_ask: ask,
        asks: vec![(ask, 600.0), (ask + 0.01, 900.0)],
        tick_size: 0.01,
        age_ms: 180.0,
        source: BookSource::Ws,
    }
}

fn portfolio(bankroll: f64) -> PortfolioView {
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
        positions: HashMap::new(),
        settling: vec![],
    }
}

/// S1 inputs: reference 60000, current 60180 (+0.30%), oracle 12s old,
/// ask 0.58, strong leader flow, 4/4 momentum votes, RSI 68, +0.35 book
/// imbalance, 6.5 minutes left of 15.
fn s1_snapshot() -> RoundSnapshot {
    let round = base_round(Asset::Btc, 0.55);
    let mut tech = AssetTech::neutral(Asset::Btc);
    tech.mom_5s = 0.86;
    tech.mom_30s = 0.83;
    tech.mom_180s = 0.78;
    tech.mom_kalman = 0.81;
    tech.rsi = 68.0;
    tech.williams_r = -12.0;
    tech.sigma_per_sqrt_s = Some(2.0e-5);
    tech.ema_5s = Some(60_165.0);
    tech.ema_60s = Some(60_050.0);
    tech.kalman_vel = Some(1.8);

    let mut derivs = DerivsView::neutral();
    derivs.volume_ready = true;
    derivs.ob_imbalance = 0.35;
    derivs.taker_ratio = 0.64;
    derivs.vol_ratio = 1.9;
    derivs.vol_mult = 1.2;
    derivs.vwap_dev = 0.0016;

    RoundSnapshot {
        now_ts: round.end_ts - 390, // 6.5 minutes remaining
        quote: Some(Quote {
            price: 60_180.0,
            age_ms: 120.0,
        }),
        oracle_price: Some(60_172.0),
        oracle_age_s: Some(12.0),
        open_price: Some(60_000.0),
        open_source: OpenPriceSource::Indexer,
        prev_open: None,
        book_up: Some(fresh_book(&round.token_up, 0.58)),
        book_down: Some(fresh_book(&round.token_down, 0.43)),
        book_strict_cap_ms: 2_000.0,
        tech,
        derivs,
        flow: Some(FlowView {
            up_conf: 0.62,
            down_conf: 0.12,
            sample_n: 40,
            avg_entry_c: 56.0,
            low_c_share: 0.15,
            high_c_share: 0.58,
            age_s: 5.0,
        }),
        cross_hints: vec![
            (Asset::Eth, Some(Side::Up)),
            (Asset::Sol, Some(Side::Up)),
            (Asset::Xrp, None),
        ],
        btc_lead_prob: 0.62,
        round,
    }
}

#[test]
fn s1_clear_uptrend_fires_taker_fok() {
    let cfg = Config::from_env();
    let snap = s1_snapshot();
    let view = portfolio(500.0);
    let stats = StatsEngine::new();

    let sig = scorer::evaluate(&cfg, &snap, &view, &stats, None, false).expect("accepted");
    assert_eq!(sig.side, Side::Up);
    assert!(sig.score >= 12, "score={}", sig.score);
    assert!(sig.true_prob >= 0.60, "true_prob={}", sig.true_prob);
    assert!((sig.entry - 0.58).abs() < 1e-9, "entry={}", sig.entry);
    assert_eq!(sig.mode, ExecutionMode::TakerFok);
    // Notional between 2% and 4% of bankroll.
    let pct = sig.notional_usdc / 500.0;
    assert!(pct >= 0.02 && pct <= 0.04, "pct={pct}");
    // Invariants.
    assert!(sig.entry > 0.0 && sig.entry < 1.0);
    assert!(sig.true_prob > 0.0 && sig.true_prob < 1.0);
    assert!((sig.edge - (sig.true_prob - sig.entry)).abs() < 1e-12);
    assert!(sig.payout_mult >= sig.min_payout_req - cfg.scorer.payout_near_miss_tol);
}

#[test]
fn s2_flat_market_rejects_with_gate_reason() {
    let cfg = Config::from_env();
    let round = base_round(Asset::Eth, 0.52);
    let mut derivs = DerivsView::neutral();
    derivs.volume_ready = true;
    derivs.ob_imbalance = 0.05;
    let snap = RoundSnapshot {
        now_ts: round.end_ts - 390,
        quote: Some(Quote {
            price: 3_000.20,
            age_ms: 150.0,
        }),
        oracle_price: Some(3_000.18),
        oracle_age_s: Some(8.0),
        open_price: Some(3_000.0),
        open_source: OpenPriceSource::Indexer,
        prev_open: None,
        book_up: Some(fresh_book(&round.token_up, 0.52)),
        book_down: Some(fresh_book(&round.token_down, 0.49)),
        book_strict_cap_ms: 2_000.0,
        tech: AssetTech::neutral(Asset::Eth),
        derivs,
        flow: None,
        cross_hints: vec![],
        btc_lead_prob: 0.5,
        round,
    };
    let err = scorer::evaluate(&cfg, &snap, &portfolio(500.0), &StatsEngine::new(), None, false)
        .unwrap_err();
    assert!(
        matches!(
            err,
            SkipReason::ScoreBelowGate
                | SkipReason::ProbBelowGate
                | SkipReason::WinModeProbLow
                | SkipReason::WinModeEdgeLow
        ),
        "reason={err:?}"
    );
}

#[test]
fn s3_contrarian_tail_takes_cheap_side_with_scaled_size() {
    let cfg = Config::from_env();
    assert!(cfg.scorer.contrarian_tail_enabled);

    // A strong down move has made Up the cheap trailing side at 22c with
    // 8 minutes left. The tape confirms the move (which is what scores),
    // while the tail mode fades it.
    let round = base_round(Asset::Btc, 0.22);
    let mut tech = AssetTech::neutral(Asset::Btc);
    tech.sigma_per_sqrt_s = Some(1.0e-4);
    tech.mom_5s = 0.15;
    tech.mom_30s = 0.18;
    tech.mom_180s = 0.22;
    tech.mom_kalman = 0.17;
    tech.rsi = 32.0;
    tech.williams_r = -88.0;
    let mut derivs = DerivsView::neutral();
    derivs.volume_ready = true;
    derivs.ob_imbalance = -0.35; // bid/ask pressure confirms the down move
    derivs.taker_ratio = 0.36;
    derivs.vol_ratio = 1.9;
    derivs.vwap_dev = -0.0016;
    let snap = RoundSnapshot {
        now_ts: round.end_ts - 480, // 8 minutes left
        quote: Some(Quote {
            price: 59_928.0, // -0.12% against the cheap Up side
            age_ms: 150.0,
        }),
        oracle_price: Some(59_930.0),
        oracle_age_s: Some(6.0),
        open_price: Some(60_000.0),
        open_source: OpenPriceSource::Indexer,
        prev_open: None,
        book_up: Some(fresh_book(&round.token_up, 0.22)),
        book_down: Some(fresh_book(&round.token_down, 0.79)),
        book_strict_cap_ms: 2_000.0,
        tech,
        derivs,
        flow: None,
        cross_hints: vec![
            (Asset::Eth, Some(Side::Down)),
            (Asset::Sol, Some(Side::Down)),
            (Asset::Xrp, None),
        ],
        btc_lead_prob: 0.35,
        round,
    };

    let sig = scorer::evaluate(&cfg, &snap, &portfolio(500.0), &StatsEngine::new(), None, false)
        .expect("contrarian tail fires");
    assert_eq!(sig.side, Side::Up, "expected the cheap side");
    assert!(sig.contrarian_tail);
    // Patient execution: maker path, never forced FOK.
    assert_eq!(sig.mode, ExecutionMode::Maker);
    assert!(sig.entry <= cfg.scorer.contrarian_tail_max_entry + 1e-9);
    assert!(sig.true_prob >= cfg.scorer.contrarian_tail_prob_floor - 1e-9);
    assert!(sig.notional_usdc >= 1.0);
}

#[test]
fn s4_stale_oracle_rejects() {
    let cfg = Config::from_env();
    let mut snap = s1_snapshot();
    snap.oracle_age_s = Some(95.0);
    let err = scorer::evaluate(&cfg, &snap, &portfolio(500.0), &StatsEngine::new(), None, false)
        .unwrap_err();
    assert_eq!(err, SkipReason::OracleTooOld);
}

#[test]
fn s5_opposite_side_same_round_blocked_by_exposure() {
    let cfg = Config::from_env();
    let snap = s1_snapshot();
    let stats = StatsEngine::new();
    let mut view = portfolio(500.0);
    // Pending Up position on the same condition id.
    view.positions.insert(
        snap.round.cid.clone(),
        Position {
            cid: snap.round.cid.clone(),
            asset: Asset::Btc,
            duration: RoundDuration::M15,
            side: Side::Down,
            shares: 10.0,
            cost_usdc: 5.0,
            value_now_usdc: 5.0,
            avg_price: 0.5,
            opened_ts: snap.now_ts - 60,
            start_ts: snap.round.start_ts,
            end_ts: snap.round.end_ts,
            add_on_count: 0,
            core_position: true,
        },
    );
    // A fresh Up candidate for the same round must be rejected by the
    // exposure rule even though the signal itself is strong.
    let sig = scorer::evaluate(&cfg, &snap, &portfolio(500.0), &stats, None, false)
        .expect("signal for exposure check");
    assert_eq!(sig.side, Side::Up);
    let err = enforce_exposure(&view, &sig, &snap.round, &cfg.risk).unwrap_err();
    assert_eq!(err, SkipReason::OppositeSideSameRound);
}

#[test]
fn book_missing_with_fresh_rest_applies_penalty_not_skip() {
    let cfg = Config::from_env();
    let mut snap = s1_snapshot();
    // Replace both WS books with a fresh REST book on the traded side.
    let mut rest_book = fresh_book("token-up", 0.58);
    rest_book.source = BookSource::Rest;
    rest_book.age_ms = 900.0;
    snap.book_up = Some(rest_book);
    snap.book_down = None;

    let baseline = scorer::evaluate(
        &cfg,
        &s1_snapshot(),
        &portfolio(500.0),
        &StatsEngine::new(),
        None,
        false,
    )
    .expect("baseline");
    let with_rest =
        scorer::evaluate(&cfg, &snap, &portfolio(500.0), &StatsEngine::new(), None, false)
            .expect("rest fallback still trades");
    assert!(with_rest.score < baseline.score);
    assert!(with_rest
        .reasons
        .iter()
        .any(|r| r == "book_rest_fallback"));
}

#[test]
fn book_fully_missing_skips_with_reason() {
    let cfg = Config::from_env();
    let mut snap = s1_snapshot();
    snap.book_up = None;
    snap.book_down = None;
    let err = scorer::evaluate(&cfg, &snap, &portfolio(500.0), &StatsEngine::new(), None, false)
        .unwrap_err();
    assert_eq!(err, SkipReason::BookWsMissing);
}

#[test]
fn degraded_quality_shrinks_probability() {
    let cfg = Config::from_env();
    let fresh = s1_snapshot();
    let mut degraded = s1_snapshot();
    degraded.oracle_age_s = Some(40.0); // stale for analysis, not a skip
    degraded.flow = None;
    degraded.quote = Some(Quote {
        price: 60_180.0,
        age_ms: 2_400.0,
    });

    let sig_fresh = scorer::evaluate(
        &cfg,
        &fresh,
        &portfolio(500.0),
        &StatsEngine::new(),
        None,
        false,
    )
    .expect("fresh signal");
    match scorer::evaluate(
        &cfg,
        &degraded,
        &portfolio(500.0),
        &StatsEngine::new(),
        None,
        false,
    ) {
        Ok(sig) => {
            assert!(sig.analysis_quality < sig_fresh.analysis_quality);
            assert!(sig.true_prob <= sig_fresh.true_prob + 1e-9);
        }
        Err(reason) => {
            // Shrinking toward 0.5 may push it under the probability gate.
            assert!(
                matches!(
                    reason,
                    SkipReason::ProbBelowGate
                        | SkipReason::WinModeProbLow
                        | SkipReason::ConsistencyProbLow
                        | SkipReason::WinModeEdgeLow
                ),
                "reason={reason:?}"
            );
        }
    }
}

#[test]
fn bankroll_cap_invariant_holds_across_setups() {
    let cfg = Config::from_env();
    let stats = StatsEngine::new();
    for bankroll in [50.0, 500.0, 5_000.0] {
        let view = portfolio(bankroll);
        if let Ok(sig) = scorer::evaluate(&cfg, &s1_snapshot(), &view, &stats, None, false) {
            assert!(
                sig.notional_usdc <= bankroll * cfg.sizing.max_bankroll_pct + 1e-6,
                "bankroll={bankroll} notional={}",
                sig.notional_usdc
            );
        }
    }
}

#[test]
fn restart_with_persisted_seen_ring_prevents_reentry() {
    let cfg = std::sync::Arc::new(Config::from_env());
    let snap = s1_snapshot();
    let stats = StatsEngine::new();
    let view = portfolio(500.0);

    let scorer1 = scorer::Scorer::new(cfg.clone());
    match scorer1.decide(&snap, &view, &stats, false) {
        scorer::Decision::Emit(_) => scorer1.mark_entered(&snap.round.cid),
        scorer::Decision::Skip(r) => panic!("expected emit, got {r:?}"),
    }
    let persisted = scorer1.seen_cids();

    // A new process restores the ring and refuses to re-enter the round.
    let scorer2 = scorer::Scorer::new(cfg);
    scorer2.restore_seen(persisted);
    match scorer2.decide(&snap, &view, &stats, false) {
        scorer::Decision::Skip(SkipReason::AlreadySeen) => {}
        other => panic!("expected AlreadySeen, got {other:?}"),
    }
}
