//! Core domain types shared across feeds, scorer, execution and settlement.

use serde::{Deserialize, Serialize};

/// Assets with short-duration up/down rounds on the venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Asset {
    Btc,
    Eth,
    Sol,
    Xrp,
}

impl Asset {
    pub const ALL: [Asset; 4] = [Asset::Btc, Asset::Eth, Asset::Sol, Asset::Xrp];

    pub fn as_str(&self) -> &'static str {
        match self {
            Asset::Btc => "BTC",
            Asset::Eth => "ETH",
            Asset::Sol => "SOL",
            Asset::Xrp => "XRP",
        }
    }

    /// Topic used on the price websocket (spot symbol).
    pub fn price_topic(&self) -> &'static str {
        match self {
            Asset::Btc => "BTCUSDT",
            Asset::Eth => "ETHUSDT",
            Asset::Sol => "SOLUSDT",
            Asset::Xrp => "XRPUSDT",
        }
    }

    pub fn parse(s: &str) -> Option<Asset> {
        match s.to_ascii_uppercase().as_str() {
            "BTC" => Some(Asset::Btc),
            "ETH" => Some(Asset::Eth),
            "SOL" => Some(Asset::Sol),
            "XRP" => Some(Asset::Xrp),
            _ => None,
        }
    }

    /// Annualized volatility fallback used before the feed warms up.
    pub fn default_annual_vol(&self) -> f64 {
        match self {
            Asset::Btc => 0.55,
            Asset::Eth => 0.70,
            Asset::Sol => 0.95,
            Asset::Xrp => 0.90,
        }
    }
}

impl std::fmt::Display for Asset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome side of a binary round. On-chain index sets: Up=1, Down=2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Up,
    Down,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Up => "Up",
            Side::Down => "Down",
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Up => Side::Down,
            Side::Down => Side::Up,
        }
    }

    /// Conditional-tokens index set for this outcome.
    pub fn index_set(&self) -> u64 {
        match self {
            Side::Up => 1,
            Side::Down => 2,
        }
    }

    pub fn parse(s: &str) -> Option<Side> {
        match s.trim().to_ascii_lowercase().as_str() {
            "up" => Some(Side::Up),
            "down" => Some(Side::Down),
            _ => None,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Round duration. Only 5m and 15m rounds exist on this venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RoundDuration {
    M5,
    M15,
}

impl RoundDuration {
    pub fn minutes(&self) -> u32 {
        match self {
            RoundDuration::M5 => 5,
            RoundDuration::M15 => 15,
        }
    }

    pub fn secs(&self) -> i64 {
        self.minutes() as i64 * 60
    }

    pub fn from_minutes(m: u32) -> Option<RoundDuration> {
        match m {
            5 => Some(RoundDuration::M5),
            15 => Some(RoundDuration::M15),
            _ => None,
        }
    }

    pub fn is_core(&self) -> bool {
        matches!(self, RoundDuration::M15)
    }
}

impl std::fmt::Display for RoundDuration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}m", self.minutes())
    }
}

/// Wall-clock identity of a round. Two markets with the same key are the
/// same round even if discovered through different endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoundKey {
    pub asset: Asset,
    pub duration: RoundDuration,
    pub start_ts: i64,
    pub end_ts: i64,
}

impl RoundKey {
    pub fn fingerprint(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.asset,
            self.duration.minutes(),
            self.start_ts,
            self.end_ts
        )
    }
}

/// A discovered binary market ("round") with its two outcome tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Round {
    pub cid: String,
    pub asset: Asset,
    pub duration: RoundDuration,
    pub start_ts: i64,
    pub end_ts: i64,
    pub question: String,
    pub token_up: String,
    pub token_down: String,
    /// Last indexer price for the Up token (implied probability).
    pub up_price: f64,
}

impl Round {
    pub fn key(&self) -> RoundKey {
        RoundKey {
            asset: self.asset,
            duration: self.duration,
            start_ts: self.start_ts,
            end_ts: self.end_ts,
        }
    }

    /// Exact round fingerprint; falls back to the question text when the
    /// wall-clock bounds are unavailable.
    pub fn fingerprint(&self) -> String {
        if self.start_ts > 0 && self.end_ts > self.start_ts {
            self.key().fingerprint()
        } else {
            format!(
                "{}|{}|q:{}",
                self.asset,
                self.duration.minutes(),
                self.question.trim().to_ascii_lowercase()
            )
        }
    }

    pub fn token_for(&self, side: Side) -> &str {
        match side {
            Side::Up => &self.token_up,
            Side::Down => &self.token_down,
        }
    }

    pub fn entry_for(&self, side: Side) -> f64 {
        match side {
            Side::Up => self.up_price,
            Side::Down => 1.0 - self.up_price,
        }
    }

    pub fn mins_left(&self, now_ts: i64) -> f64 {
        ((self.end_ts - now_ts) as f64 / 60.0).max(0.0)
    }

    pub fn pct_remaining(&self, now_ts: i64) -> f64 {
        let life = (self.end_ts - self.start_ts).max(1) as f64;
        (((self.end_ts - now_ts) as f64) / life).clamp(0.0, 1.0)
    }
}

/// Where the decision price came from, with staleness tagging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecisionSource {
    Oracle,
    PriceWs,
    OracleStale,
    PriceWsStale,
}

impl DecisionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionSource::Oracle => "oracle",
            DecisionSource::PriceWs => "price-ws",
            DecisionSource::OracleStale => "oracle-stale",
            DecisionSource::PriceWsStale => "price-ws-stale",
        }
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, DecisionSource::OracleStale | DecisionSource::PriceWsStale)
    }
}

/// Provenance of the round-open reference price ("price to beat").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpenPriceSource {
    /// Authoritative: reported by the markets indexer.
    Indexer,
    /// Oracle observation exactly at the round boundary.
    OracleExact,
    /// Nearest oracle observation to the boundary.
    OracleNearest,
    Unknown,
}

impl OpenPriceSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpenPriceSource::Indexer => "indexer",
            OpenPriceSource::OracleExact => "oracle-exact",
            OpenPriceSource::OracleNearest => "oracle-nearest",
            OpenPriceSource::Unknown => "unknown",
        }
    }

    pub fn confidence(&self) -> f64 {
        match self {
            OpenPriceSource::Indexer => 1.0,
            OpenPriceSource::OracleExact => 0.9,
            OpenPriceSource::OracleNearest => 0.6,
            OpenPriceSource::Unknown => 0.5,
        }
    }
}

/// How the execution layer should work the order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionMode {
    /// Rest one tick inside the book, fall back to taker on timeout.
    Maker,
    TakerFok,
    TakerIoc,
    /// Pullback limit parked at the max acceptable entry.
    LimitGtc,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Maker => "maker",
            ExecutionMode::TakerFok => "taker_fok",
            ExecutionMode::TakerIoc => "taker_ioc",
            ExecutionMode::LimitGtc => "limit_gtc",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalTier {
    /// Fresh leader flow corroborates the setup.
    TierA,
    /// Technical stack only, no fresh leader flow.
    TierB,
    TierC,
}

impl SignalTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalTier::TierA => "tier-a",
            SignalTier::TierB => "tier-b",
            SignalTier::TierC => "tier-c",
        }
    }
}

/// Score tier used for bucket keys and tier gates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScoreTier {
    S0_8,
    S9_11,
    S12Plus,
}

impl ScoreTier {
    pub fn from_score(score: i32) -> ScoreTier {
        if score >= 12 {
            ScoreTier::S12Plus
        } else if score >= 9 {
            ScoreTier::S9_11
        } else {
            ScoreTier::S0_8
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ScoreTier::S0_8 => "s0-8",
            ScoreTier::S9_11 => "s9-11",
            ScoreTier::S12Plus => "s12+",
        }
    }
}

/// Entry price band (tens of cents) used for bucket keys and profiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntryBand(pub u8);

impl EntryBand {
    pub fn from_price(entry: f64) -> EntryBand {
        let cents = (entry * 100.0).clamp(0.0, 99.0) as u8;
        EntryBand(cents / 10)
    }

    pub fn label(&self) -> String {
        let lo = self.0 as u32 * 10;
        format!("{:02}-{:02}c", lo, lo + 9)
    }
}

/// Every way the scorer or risk gates can decline a candidate.
///
/// Closed set: exhaustive matching in tests and diagnostics; each skip is
/// recorded `(reason, ts)` into the rolling diagnostics window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SkipReason {
    AlreadySeen,
    NoDecisionPrice,
    OpenPriceUnavailable,
    WindowTooLate,
    OracleAgeMissing,
    OracleTooOld,
    BookWsMissing,
    VolumeMissing,
    JumpAgainstDirection,
    BookHardBlock,
    DirectionEdgeHardBlock,
    FiveMinSourceConflict,
    WinModeOracleDisagree,
    WinModeProbLow,
    WinModeEdgeLow,
    ProbBelowGate,
    ScoreBelowGate,
    EntryOutside,
    PayoutBelow,
    EvBelow,
    EvFrontierProbLow,
    ConsistencyPayoutLow,
    ConsistencyOracleDisagree,
    ConsistencyProbLow,
    ConsistencyEvLow,
    ConsistencyEntryHigh,
    ConsistencyTrailWeak,
    LowCentNotLeading,
    LowCentNewWeak,
    NotionalBelowMin,
    BoosterLocked,
    BoosterOutsideWindow,
    BoosterCapReached,
    BoosterQualityWeak,
    // Exposure gates applied after scoring.
    OppositeSideSameRound,
    MaxOpenPositions,
    SideCapExceeded,
    CidCapExceeded,
    InsufficientBankroll,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::AlreadySeen => "already_seen",
            SkipReason::NoDecisionPrice => "no_decision_price",
            SkipReason::OpenPriceUnavailable => "open_price_unavailable",
            SkipReason::WindowTooLate => "window_too_late",
            SkipReason::OracleAgeMissing => "oracle_age_missing",
            SkipReason::OracleTooOld => "oracle_age_too_old",
            SkipReason::BookWsMissing => "book_ws_missing",
            SkipReason::VolumeMissing => "volume_missing",
            SkipReason::JumpAgainstDirection => "jump_against_direction",
            SkipReason::BookHardBlock => "book_hard_block",
            SkipReason::DirectionEdgeHardBlock => "direction_edge_hard_block",
            SkipReason::FiveMinSourceConflict => "5m_source_conflict",
            SkipReason::WinModeOracleDisagree => "winmode_oracle_disagree",
            SkipReason::WinModeProbLow => "winmode_prob_low",
            SkipReason::WinModeEdgeLow => "winmode_edge_low",
            SkipReason::ProbBelowGate => "prob_below_gate",
            SkipReason::ScoreBelowGate => "score_below_gate",
            SkipReason::EntryOutside => "entry_outside",
            SkipReason::PayoutBelow => "payout_below",
            SkipReason::EvBelow => "ev_below",
            SkipReason::EvFrontierProbLow => "ev_frontier_prob_low",
            SkipReason::ConsistencyPayoutLow => "consistency_payout_low",
            SkipReason::ConsistencyOracleDisagree => "consistency_oracle_disagree",
            SkipReason::ConsistencyProbLow => "consistency_prob_low",
            SkipReason::ConsistencyEvLow => "consistency_ev_low",
            SkipReason::ConsistencyEntryHigh => "consistency_entry_high",
            SkipReason::ConsistencyTrailWeak => "consistency_trail_weak",
            SkipReason::LowCentNotLeading => "lowcent_not_leading",
            SkipReason::LowCentNewWeak => "lowcent_new_weak",
            SkipReason::NotionalBelowMin => "notional_below_min",
            SkipReason::BoosterLocked => "booster_locked",
            SkipReason::BoosterOutsideWindow => "booster_outside_window",
            SkipReason::BoosterCapReached => "booster_cap_reached",
            SkipReason::BoosterQualityWeak => "booster_quality_weak",
            SkipReason::OppositeSideSameRound => "opposite_side_same_cid",
            SkipReason::MaxOpenPositions => "max_open_positions",
            SkipReason::SideCapExceeded => "side_cap_exceeded",
            SkipReason::CidCapExceeded => "cid_cap_exceeded",
            SkipReason::InsufficientBankroll => "insufficient_bankroll",
        }
    }
}

/// Scorer output for an accepted candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub cid: String,
    pub asset: Asset,
    pub duration: RoundDuration,
    pub side: Side,
    pub token_id: String,
    pub score: i32,
    pub true_prob: f64,
    pub edge: f64,
    /// Limit entry price in (0, 1).
    pub entry: f64,
    pub notional_usdc: f64,
    pub mode: ExecutionMode,
    pub tier: SignalTier,
    pub source: String,
    /// Net EV after the parabolic fee, before execution penalties.
    pub ev_net: f64,
    /// EV after expected slippage and no-fill penalty.
    pub execution_ev: f64,
    pub payout_mult: f64,
    pub min_payout_req: f64,
    pub max_entry_allowed: f64,
    pub min_entry_allowed: f64,
    pub analysis_quality: f64,
    pub analysis_conviction: f64,
    pub open_price: f64,
    pub open_price_source: OpenPriceSource,
    pub decision_price: f64,
    pub decision_source: DecisionSource,
    pub oracle_age_s: Option<f64>,
    pub oracle_agrees: bool,
    pub mins_left: f64,
    pub booster: bool,
    pub contrarian_tail: bool,
    /// Adjustments applied along the pipeline, for diagnostics.
    pub reasons: Vec<String>,
}

impl Signal {
    pub fn validate(&self) -> Result<(), String> {
        if !(self.entry > 0.0 && self.entry < 1.0) {
            return Err(format!("entry out of range: {}", self.entry));
        }
        if !(self.true_prob > 0.0 && self.true_prob < 1.0) {
            return Err(format!("true_prob out of range: {}", self.true_prob));
        }
        if self.notional_usdc < 0.0 {
            return Err(format!("negative notional: {}", self.notional_usdc));
        }
        Ok(())
    }
}

/// Open exposure on one condition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub cid: String,
    pub asset: Asset,
    pub duration: RoundDuration,
    pub side: Side,
    pub shares: f64,
    pub cost_usdc: f64,
    pub value_now_usdc: f64,
    pub avg_price: f64,
    pub opened_ts: i64,
    pub start_ts: i64,
    pub end_ts: i64,
    pub add_on_count: u32,
    /// False for booster add-ons layered on an existing core position.
    pub core_position: bool,
}

impl Position {
    pub fn round_key(&self) -> RoundKey {
        RoundKey {
            asset: self.asset,
            duration: self.duration,
            start_ts: self.start_ts,
            end_ts: self.end_ts,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RedeemStage {
    Discovered,
    PreflightOk,
    TxSubmitted,
    TxConfirmed,
    Finalized,
}

/// One queued on-chain redemption.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedemptionTask {
    pub cid: String,
    pub winning_side: Side,
    pub claim_value_usdc: f64,
    pub queued_ts: i64,
    pub verify_attempts: u32,
    pub submit_attempts: u32,
    pub tx_hash: Option<String>,
    pub stage: RedeemStage,
}

impl RedemptionTask {
    pub fn new(cid: String, winning_side: Side, claim_value_usdc: f64, now_ts: i64) -> Self {
        Self {
            cid,
            winning_side,
            claim_value_usdc,
            queued_ts: now_ts,
            verify_attempts: 0,
            submit_attempts: 0,
            tx_hash: None,
            stage: RedeemStage::Discovered,
        }
    }
}

/// Adaptive-learning bucket key: `(duration, score tier, entry band)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BucketKey {
    pub duration: RoundDuration,
    pub score_tier: ScoreTier,
    pub entry_band: EntryBand,
}

impl BucketKey {
    pub fn new(duration: RoundDuration, score: i32, entry: f64) -> BucketKey {
        BucketKey {
            duration,
            score_tier: ScoreTier::from_score(score),
            entry_band: EntryBand::from_price(entry),
        }
    }

    pub fn label(&self) -> String {
        format!(
            "{}|{}|{}",
            self.duration.minutes(),
            self.score_tier.as_str(),
            self.entry_band.label()
        )
    }
}

/// Accumulated per-bucket execution and outcome counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BucketStat {
    pub fills: u64,
    pub outcomes: u64,
    pub wins: u64,
    pub gross_win: f64,
    pub gross_loss: f64,
    pub slip_bps_sum: f64,
    pub pnl: f64,
}

impl BucketStat {
    pub fn win_rate(&self) -> Option<f64> {
        if self.outcomes == 0 {
            None
        } else {
            Some(self.wins as f64 / self.outcomes as f64)
        }
    }

    pub fn profit_factor(&self) -> f64 {
        if self.gross_loss <= 0.0 {
            if self.gross_win > 0.0 {
                99.0
            } else {
                1.0
            }
        } else {
            self.gross_win / self.gross_loss
        }
    }

    pub fn avg_slip_bps(&self) -> Option<f64> {
        if self.fills == 0 {
            None
        } else {
            Some(self.slip_bps_sum / self.fills as f64)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_fingerprint_prefers_exact_bounds() {
        let r = Round {
            cid: "0xabc".into(),
            asset: Asset::Btc,
            duration: RoundDuration::M15,
            start_ts: 1_700_000_000,
            end_ts: 1_700_000_900,
            question: "BTC up or down?".into(),
            token_up: "1".into(),
            token_down: "2".into(),
            up_price: 0.55,
        };
        assert_eq!(r.fingerprint(), "BTC|15|1700000000|1700000900");

        let mut no_bounds = r.clone();
        no_bounds.start_ts = 0;
        no_bounds.end_ts = 0;
        assert!(no_bounds.fingerprint().contains("q:btc up or down?"));
    }

    #[test]
    fn score_tiers_and_entry_bands() {
        assert_eq!(ScoreTier::from_score(14), ScoreTier::S12Plus);
        assert_eq!(ScoreTier::from_score(9), ScoreTier::S9_11);
        assert_eq!(ScoreTier::from_score(3), ScoreTier::S0_8);
        assert_eq!(EntryBand::from_price(0.58).label(), "50-59c");
        assert_eq!(EntryBand::from_price(0.03).label(), "00-09c");
        assert_eq!(EntryBand::from_price(0.999).label(), "90-99c");
    }

    #[test]
    fn signal_validation_rejects_out_of_range() {
        let sig = Signal {
            cid: "x".into(),
            asset: Asset::Eth,
            duration: RoundDuration::M5,
            side: Side::Up,
            token_id: "t".into(),
            score: 10,
            true_prob: 1.2,
            edge: 0.1,
            entry: 0.5,
            notional_usdc: 5.0,
            mode: ExecutionMode::Maker,
            tier: SignalTier::TierB,
            source: "test".into(),
            ev_net: 0.05,
            execution_ev: 0.04,
            payout_mult: 2.0,
            min_payout_req: 1.72,
            max_entry_allowed: 0.56,
            min_entry_allowed: 0.01,
            analysis_quality: 0.8,
            analysis_conviction: 0.6,
            open_price: 100.0,
            open_price_source: OpenPriceSource::Indexer,
            decision_price: 100.5,
            decision_source: DecisionSource::Oracle,
            oracle_age_s: Some(2.0),
            oracle_agrees: true,
            mins_left: 7.0,
            booster: false,
            contrarian_tail: false,
            reasons: vec![],
        };
        assert!(sig.validate().is_err());
    }

    #[test]
    fn side_index_sets_match_resolution_rule() {
        assert_eq!(Side::Up.index_set(), 1);
        assert_eq!(Side::Down.index_set(), 2);
        assert_eq!(Side::Up.opposite(), Side::Down);
    }
}
