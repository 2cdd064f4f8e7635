//! Typed runtime configuration.
//!
//! Every bounded parameter is read from the environment exactly once at boot
//! (`Config::from_env`) and carried by value afterwards. No module reads an
//! environment variable after startup; hot reload is intentionally absent.

use std::time::Duration;

fn env_str(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "y" | "on"
        ),
        Err(_) => default,
    }
}

fn env_f64(name: &str, default: f64) -> f64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_u32(name: &str, default: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_i64(name: &str, default: i64) -> i64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// External endpoints and credentials. Concrete vendors are injected here;
/// the rest of the code only sees the shapes.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub price_ws_url: String,
    pub book_ws_urls: Vec<String>,
    pub clob_rest_url: String,
    pub markets_rest_url: String,
    pub data_api_url: String,
    pub derivs_rest_url: String,
    pub derivs_ws_url: String,
    pub rpc_urls: Vec<String>,
    pub oracle_ws_url: Option<String>,
    pub wallet_address: String,
    pub wallet_private_key: Option<String>,
    pub clob_api_key: Option<String>,
    pub clob_api_secret: Option<String>,
    pub clob_passphrase: Option<String>,
    pub collateral_address: String,
    pub conditional_tokens_address: String,
    pub oracle_aggregators: Vec<(crate::models::Asset, String)>,
}

#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// Oracle price considered authoritative below this age.
    pub oracle_fresh_s: f64,
    /// Price-stream quotes considered fresh below this age.
    pub quote_fresh_ms: f64,
    /// Warn-level oracle staleness: score penalty applied.
    pub oracle_age_warn_s: f64,
    /// Hard oracle staleness: candidate rejected.
    pub oracle_age_max_skip_s: f64,
    pub oracle_poll_ms: u64,
    /// Strict websocket book age cap bounds (adaptive between these).
    pub book_strict_age_ms_min: f64,
    pub book_strict_age_ms_max: f64,
    pub book_soft_age_ms: f64,
    pub book_rest_fresh_ms: f64,
    pub book_fallback_age_ms: f64,
    pub price_history_len: usize,
    /// Consecutive all-stale health ticks before a forced reconnect.
    pub stale_ticks_reconnect: u32,
    pub ws_idle_timeout_s: u64,
    pub reconnect_backoff_cap_s: u64,
    pub copyflow_refresh_s: u64,
    pub copyflow_live_max_age_s: f64,
    pub copyflow_fallback_max_age_s: f64,
    pub copyflow_ondemand_cooldown_s: f64,
    pub ofi_window_s: i64,
    pub derivs_poll_s: u64,
}

#[derive(Debug, Clone)]
pub struct ScorerConfig {
    pub min_pct_remaining: f64,
    pub dir_move_min: f64,
    pub dir_conflict_move_max: f64,
    pub dir_conflict_score_pen: i32,
    pub dir_conflict_edge_pen: f64,
    pub oracle_direction_move_min: f64,
    pub prev_win_dir_move_min: f64,
    // Feature-score thresholds.
    pub timing_pct_2: f64,
    pub timing_pct_1: f64,
    pub move_t1: f64,
    pub move_t2: f64,
    pub move_t3: f64,
    pub mom_thresh_up: f64,
    pub mom_thresh_dn: f64,
    pub ob_hard_block: f64,
    pub ob_t1: f64,
    pub ob_t2: f64,
    pub ob_t3: f64,
    pub imbalance_confirm_min: f64,
    pub taker_t2: f64,
    pub taker_t3: f64,
    pub taker_neutral_band: f64,
    pub vol_t1: f64,
    pub vol_t2: f64,
    pub perp_confirm: f64,
    pub perp_strong: f64,
    pub funding_pos_strong: f64,
    pub funding_pos_extreme: f64,
    pub funding_neg_confirm: f64,
    pub funding_neg_strong: f64,
    pub oi_delta_up: f64,
    pub oi_delta_dn: f64,
    pub ls_long_extreme: f64,
    pub ls_short_extreme: f64,
    pub vwap_t1: f64,
    pub vwap_t2: f64,
    pub disp_sigma_mid: f64,
    pub disp_sigma_strong: f64,
    pub jump_confirm_score: i32,
    pub regime_vr_trend: f64,
    pub regime_ac_trend: f64,
    pub regime_vr_mr: f64,
    pub regime_ac_mr: f64,
    pub regime_mult_trend: f64,
    pub regime_mult_mr: f64,
    pub rsi_overbought: f64,
    pub rsi_oversold: f64,
    pub wr_overbought: f64,
    pub wr_oversold: f64,
    pub btc_lead_t1: f64,
    pub btc_lead_t2: f64,
    pub oracle_agree_bonus: i32,
    pub oracle_disagree_pen: i32,
    pub div_pen_start: f64,
    pub div_pen_max_score: i32,
    pub oracle_warn_score_pen: i32,
    // Log-likelihood weights.
    pub llr_price_mult: f64,
    pub llr_ema_mult: f64,
    pub llr_kalman_mult: f64,
    pub llr_ob_mult: f64,
    pub llr_taker_mult: f64,
    pub llr_perp_mult: f64,
    pub llr_perp_cap: f64,
    pub llr_oracle_agree: f64,
    pub llr_oracle_disagree: f64,
    pub llr_btc_lead_mult: f64,
    pub llr_clamp: f64,
    pub tie_bias_up: f64,
    pub prob_clamp_min: f64,
    pub prob_clamp_max: f64,
    // Gates.
    pub min_score_gate: i32,
    pub min_score_gate_5m: i32,
    pub min_score_gate_15m: i32,
    pub min_true_prob_5m: f64,
    pub min_true_prob_15m: f64,
    pub rolling3_score_pen: i32,
    pub max_win_mode: bool,
    pub winmode_require_oracle_agree: bool,
    pub winmode_min_true_prob_5m: f64,
    pub winmode_min_true_prob_15m: f64,
    pub winmode_min_edge: f64,
    pub winmode_max_entry_5m: f64,
    pub winmode_max_entry_15m: f64,
    pub util_edge_mult: f64,
    // Entry / payout.
    pub max_entry_price: f64,
    pub max_entry_tol: f64,
    pub min_entry_price_15m: f64,
    pub entry_hard_cap_15m: f64,
    pub min_payout_15m: f64,
    pub min_payout_5m: f64,
    pub payout_near_miss_tol: f64,
    pub min_ev_net: f64,
    pub min_ev_net_5m: f64,
    pub fee_coeff: f64,
    pub ev_frontier_margin_base: f64,
    pub ev_frontier_margin_high_entry: f64,
    pub pullback_limit_enabled: bool,
    pub pullback_min_pct_left: f64,
    pub late_relax_pct_left: f64,
    pub late_relax_min_move: f64,
    pub late_relax_payout_floor: f64,
    pub late_relax_prob_boost: f64,
    pub analysis_oracle_fresh_s: f64,
    pub analysis_quote_fresh_ms: f64,
    // Contrarian tail.
    pub contrarian_tail_enabled: bool,
    pub contrarian_tail_max_entry: f64,
    pub contrarian_tail_min_mins_left: f64,
    pub contrarian_tail_min_move: f64,
    pub contrarian_tail_size_mult: f64,
    /// Mean-reversion probability floor for tail entries: overreactions
    /// carry more reversal odds than the tail price implies.
    pub contrarian_tail_prob_floor: f64,
    // Cross-asset consensus.
    pub cross_consensus_min_count: u32,
    pub cross_consensus_score_relax: i32,
    // Low-cent entries.
    pub low_cent_threshold: f64,
    pub lowcent_new_min_score: i32,
    pub lowcent_new_min_prob: f64,
    pub lowcent_new_min_ev: f64,
    pub lowcent_new_min_payout: f64,
    // Consistency core (15m).
    pub consistency_min_payout_15m: f64,
    pub consistency_min_prob_15m: f64,
    pub consistency_min_ev_15m: f64,
    pub consistency_max_entry_15m: f64,
    pub consistency_strong_min_score: i32,
    pub consistency_strong_min_prob: f64,
    pub consistency_strong_min_ev: f64,
    pub consistency_trail_min_pct_left: f64,
    // Debounce.
    pub debounce_ms: u64,
    pub seen_ring_len: usize,
}

#[derive(Debug, Clone)]
pub struct SizingConfig {
    pub tier_score_high: i32,
    pub tier_score_mid: i32,
    pub max_single_abs_cap: f64,
    pub min_hard_cap_usdc: f64,
    pub max_bankroll_pct: f64,
    pub max_cid_exposure_pct: f64,
    pub min_bet_abs: f64,
    pub min_bet_pct: f64,
    pub min_exec_notional: f64,
    pub tail_cap_entry_1: f64,
    pub tail_cap_pct_1: f64,
    pub tail_cap_entry_2: f64,
    pub tail_cap_pct_2: f64,
    pub time_scale_late_2_5: f64,
    pub time_scale_late_3_5: f64,
    pub time_scale_late_5_0: f64,
    pub cents_scale_3c: f64,
    pub cents_scale_5c: f64,
    pub cents_scale_10c: f64,
    pub cents_scale_20c: f64,
    pub leader_fresh_size_scale: f64,
    pub leader_noflow_size_scale: f64,
    pub super_bet_floor_enabled: bool,
    pub super_bet_cap_enabled: bool,
    pub super_bet_entry_max: f64,
    pub super_bet_min_payout: f64,
    pub super_bet_min_size: f64,
    pub super_bet_max_size: f64,
    pub super_bet_max_bankroll_pct: f64,
    pub super_bet_min_score: i32,
    pub super_bet_min_ev: f64,
    pub super_bet_cooldown_s: f64,
    pub round_stack_decay: f64,
    pub round_stack_min: f64,
    pub round_total_decay: f64,
    pub round_total_min: f64,
    pub round_corr_decay: f64,
    pub round_corr_min: f64,
    pub oracle_scale_disagree_fresh: f64,
    pub oracle_scale_disagree_stale: f64,
}

#[derive(Debug, Clone)]
pub struct BoosterConfig {
    pub enabled: bool,
    pub max_per_cid: u32,
    pub min_left_hard_15m: f64,
    pub ideal_min_left_15m: f64,
    pub ideal_max_left_15m: f64,
    pub anytime_15m: bool,
    pub min_score: i32,
    pub min_true_prob: f64,
    pub min_edge: f64,
    pub min_ev_net: f64,
    pub min_payout: f64,
    pub max_entry: f64,
    pub min_vol_ratio: f64,
    pub min_conviction: f64,
    pub size_pct: f64,
    pub size_pct_high: f64,
    pub prev_size_cap_mult: f64,
    pub loss_streak_lock: u32,
    pub lock_hours: f64,
}

#[derive(Debug, Clone)]
pub struct ExecConfig {
    pub maker_hold_5m: Duration,
    pub maker_hold_15m: Duration,
    pub fast_taker_near_end_s: i64,
    pub tick_tolerance: f64,
    pub default_tick: f64,
    pub min_partial_track_usdc: f64,
    pub max_attempts: u32,
    pub retry_base_ms: u64,
    pub retry_jitter_ms: u64,
    pub taker_slip_cap_bps_5m: f64,
    pub taker_slip_cap_bps_15m: f64,
    pub order_poll_ms: u64,
    pub force_taker_score: i32,
    pub force_taker_move_min: f64,
    pub fast_exec_score: i32,
    pub fast_exec_edge: f64,
}

#[derive(Debug, Clone)]
pub struct RiskConfig {
    pub reconcile_interval: Duration,
    pub max_open_positions: usize,
    pub side_cap_pct: f64,
    pub side_cap_pct_choppy: f64,
    pub cid_cap_pct: f64,
    pub presence_threshold_usdc: f64,
    pub prune_absent_cycles: u32,
    pub prune_min_grace_s: i64,
}

#[derive(Debug, Clone)]
pub struct SettlementConfig {
    pub scan_interval_s: u64,
    pub dust_usdc: f64,
    pub max_verify_attempts: u32,
    pub max_submit_attempts: u32,
    pub receipt_timeout_s: u64,
    pub gas_limit: u64,
    pub priority_fee_gwei: u64,
    pub backfill_interval_s: u64,
    pub backfill_pages: u32,
    pub settled_retention_s: i64,
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub min_gap_ms: u64,
    pub retries_429: u32,
    pub retries_5xx: u32,
    pub cache_ttl_s: f64,
    pub stale_ttl_s: f64,
    pub timeout_s: u64,
    pub bounded_inflight: usize,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub dry_run: bool,
    pub data_dir: String,
    pub enable_5m: bool,
    pub enable_15m: bool,
    pub initial_bankroll: f64,
    pub endpoints: EndpointConfig,
    pub feeds: FeedConfig,
    pub scorer: ScorerConfig,
    pub sizing: SizingConfig,
    pub booster: BoosterConfig,
    pub exec: ExecConfig,
    pub risk: RiskConfig,
    pub settlement: SettlementConfig,
    pub http: HttpConfig,
    pub rpc_probe_interval_s: u64,
    pub rpc_swap_margin_ms: f64,
}

impl Config {
    pub fn from_env() -> Config {
        let rpc_urls: Vec<String> = env_str(
            "CHAIN_RPC_URLS",
            "https://polygon-bor-rpc.publicnode.com",
        )
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

        let book_ws_urls: Vec<String> = env_str(
            "BOOK_WS_URLS",
            "wss://ws-subscriptions-clob.polymarket.com/ws/market",
        )
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

        use crate::models::Asset;
        let oracle_aggregators = vec![
            (
                Asset::Btc,
                env_str(
                    "ORACLE_FEED_BTC",
                    "0xc907E116054Ad103354f2D350FD2514433D57F6f",
                ),
            ),
            (
                Asset::Eth,
                env_str(
                    "ORACLE_FEED_ETH",
                    "0xF9680D99D6C9589e2a93a78A04A279e509205945",
                ),
            ),
            (
                Asset::Sol,
                env_str(
                    "ORACLE_FEED_SOL",
                    "0x10C8264C0935b3B9870013e057f330Ff3e9C56dC",
                ),
            ),
            (
                Asset::Xrp,
                env_str(
                    "ORACLE_FEED_XRP",
                    "0x785ba89291f676b5386652eB12b30cF361020694",
                ),
            ),
        ];

        Config {
            dry_run: env_bool("DRY_RUN", true),
            data_dir: env_str("DATA_DIR", "./data"),
            enable_5m: env_bool("ENABLE_5M", false),
            enable_15m: env_bool("ENABLE_15M", true),
            initial_bankroll: env_f64("INITIAL_BANKROLL_USDC", 500.0),
            endpoints: EndpointConfig {
                price_ws_url: env_str("PRICE_WS_URL", "wss://stream.binance.com:9443/ws"),
                book_ws_urls,
                clob_rest_url: env_str("CLOB_REST_URL", "https://clob.polymarket.com"),
                markets_rest_url: env_str("MARKETS_REST_URL", "https://gamma-api.polymarket.com"),
                data_api_url: env_str("DATA_API_URL", "https://data-api.polymarket.com"),
                derivs_rest_url: env_str("DERIVS_REST_URL", "https://fapi.binance.com"),
                derivs_ws_url: env_str("DERIVS_WS_URL", "wss://fstream.binance.com/ws"),
                rpc_urls,
                oracle_ws_url: env_opt("ORACLE_WS_URL"),
                wallet_address: env_str("WALLET_ADDRESS", ""),
                wallet_private_key: env_opt("WALLET_PRIVATE_KEY"),
                clob_api_key: env_opt("CLOB_API_KEY"),
                clob_api_secret: env_opt("CLOB_API_SECRET"),
                clob_passphrase: env_opt("CLOB_PASSPHRASE"),
                collateral_address: env_str(
                    "COLLATERAL_ADDRESS",
                    "0x2791Bca1f2de4661ED88A30C99A7a9449Aa84174",
                ),
                conditional_tokens_address: env_str(
                    "CONDITIONAL_TOKENS_ADDRESS",
                    "0x4D97DCd97eC945f40cF65F87097ACe5EA0476045",
                ),
                oracle_aggregators,
            },
            feeds: FeedConfig {
                oracle_fresh_s: env_f64("ORACLE_FRESH_S", 15.0),
                quote_fresh_ms: env_f64("QUOTE_FRESH_MS", 2_500.0),
                oracle_age_warn_s: env_f64("ORACLE_AGE_WARN_S", 45.0),
                oracle_age_max_skip_s: env_f64("ORACLE_AGE_MAX_SKIP_S", 90.0),
                oracle_poll_ms: env_u64("ORACLE_POLL_MS", 1_500),
                book_strict_age_ms_min: env_f64("BOOK_STRICT_AGE_MS_MIN", 900.0),
                book_strict_age_ms_max: env_f64("BOOK_STRICT_AGE_MS_MAX", 4_000.0),
                book_soft_age_ms: env_f64("BOOK_SOFT_AGE_MS", 8_000.0),
                book_rest_fresh_ms: env_f64("CLOB_REST_FRESH_MS", 1_800.0),
                book_fallback_age_ms: env_f64("BOOK_FALLBACK_AGE_MS", 5_000.0),
                price_history_len: env_u64("PRICE_HISTORY_LEN", 300) as usize,
                stale_ticks_reconnect: env_u32("STALE_TICKS_RECONNECT", 4),
                ws_idle_timeout_s: env_u64("WS_IDLE_TIMEOUT_S", 30),
                reconnect_backoff_cap_s: env_u64("RECONNECT_BACKOFF_CAP_S", 60),
                copyflow_refresh_s: env_u64("COPYFLOW_REFRESH_S", 6),
                copyflow_live_max_age_s: env_f64("COPYFLOW_LIVE_MAX_AGE_S", 25.0),
                copyflow_fallback_max_age_s: env_f64("COPYFLOW_FALLBACK_MAX_AGE_S", 120.0),
                copyflow_ondemand_cooldown_s: env_f64("COPYFLOW_ONDEMAND_COOLDOWN_S", 8.0),
                ofi_window_s: env_i64("OFI_WINDOW_S", 20),
                derivs_poll_s: env_u64("DERIVS_POLL_S", 10),
            },
            scorer: ScorerConfig {
                min_pct_remaining: env_f64("MIN_PCT_REMAINING", 0.12),
                dir_move_min: env_f64("DIR_MOVE_MIN", 0.0006),
                dir_conflict_move_max: env_f64("DIR_CONFLICT_MOVE_MAX", 0.0016),
                dir_conflict_score_pen: env_i64("DIR_CONFLICT_SCORE_PEN", 2) as i32,
                dir_conflict_edge_pen: env_f64("DIR_CONFLICT_EDGE_PEN", 0.01),
                oracle_direction_move_min: env_f64("ORACLE_DIRECTION_MOVE_MIN", 0.0003),
                prev_win_dir_move_min: env_f64("PREV_WIN_DIR_MOVE_MIN", 0.0005),
                timing_pct_2: env_f64("TIMING_PCT_2", 0.70),
                timing_pct_1: env_f64("TIMING_PCT_1", 0.45),
                move_t1: env_f64("MOVE_T1", 0.0008),
                move_t2: env_f64("MOVE_T2", 0.0018),
                move_t3: env_f64("MOVE_T3", 0.0035),
                mom_thresh_up: env_f64("MOM_THRESH_UP", 0.55),
                mom_thresh_dn: env_f64("MOM_THRESH_DN", 0.45),
                ob_hard_block: env_f64("OB_HARD_BLOCK", -0.45),
                ob_t1: env_f64("OB_T1", 0.08),
                ob_t2: env_f64("OB_T2", 0.20),
                ob_t3: env_f64("OB_T3", 0.35),
                imbalance_confirm_min: env_f64("IMBALANCE_CONFIRM_MIN", 0.10),
                taker_t2: env_f64("TAKER_T2", 0.56),
                taker_t3: env_f64("TAKER_T3", 0.62),
                taker_neutral_band: env_f64("TAKER_NEUTRAL_BAND", 0.03),
                vol_t1: env_f64("VOL_T1", 1.25),
                vol_t2: env_f64("VOL_T2", 1.80),
                perp_confirm: env_f64("PERP_CONFIRM", 0.0004),
                perp_strong: env_f64("PERP_STRONG", 0.0012),
                funding_pos_strong: env_f64("FUNDING_POS_STRONG", 0.0004),
                funding_pos_extreme: env_f64("FUNDING_POS_EXTREME", 0.0010),
                funding_neg_confirm: env_f64("FUNDING_NEG_CONFIRM", -0.0004),
                funding_neg_strong: env_f64("FUNDING_NEG_STRONG", -0.0010),
                oi_delta_up: env_f64("OI_DELTA_UP", 0.004),
                oi_delta_dn: env_f64("OI_DELTA_DN", -0.004),
                ls_long_extreme: env_f64("LS_LONG_EXTREME", 2.6),
                ls_short_extreme: env_f64("LS_SHORT_EXTREME", 0.45),
                vwap_t1: env_f64("VWAP_T1", 0.0004),
                vwap_t2: env_f64("VWAP_T2", 0.0012),
                disp_sigma_mid: env_f64("DISP_SIGMA_MID", 0.45),
                disp_sigma_strong: env_f64("DISP_SIGMA_STRONG", 0.95),
                jump_confirm_score: env_i64("JUMP_CONFIRM_SCORE", 2) as i32,
                regime_vr_trend: env_f64("REGIME_VR_TREND", 1.18),
                regime_ac_trend: env_f64("REGIME_AC_TREND", 0.08),
                regime_vr_mr: env_f64("REGIME_VR_MR", 0.85),
                regime_ac_mr: env_f64("REGIME_AC_MR", -0.08),
                regime_mult_trend: env_f64("REGIME_MULT_TREND", 1.20),
                regime_mult_mr: env_f64("REGIME_MULT_MR", 0.78),
                rsi_overbought: env_f64("RSI_OVERBOUGHT", 64.0),
                rsi_oversold: env_f64("RSI_OVERSOLD", 36.0),
                wr_overbought: env_f64("WR_OVERBOUGHT", -25.0),
                wr_oversold: env_f64("WR_OVERSOLD", -75.0),
                btc_lead_t1: env_f64("BTC_LEAD_T1", 0.57),
                btc_lead_t2: env_f64("BTC_LEAD_T2", 0.64),
                oracle_agree_bonus: env_i64("ORACLE_AGREE_BONUS", 1) as i32,
                oracle_disagree_pen: env_i64("ORACLE_DISAGREE_PEN", 3) as i32,
                div_pen_start: env_f64("DIV_PEN_START", 0.0006),
                div_pen_max_score: env_i64("DIV_PEN_MAX_SCORE", 3) as i32,
                oracle_warn_score_pen: env_i64("ORACLE_WARN_SCORE_PEN", 1) as i32,
                llr_price_mult: env_f64("LLR_PRICE_MULT", 1.35),
                llr_ema_mult: env_f64("LLR_EMA_MULT", 220.0),
                llr_kalman_mult: env_f64("LLR_KALMAN_MULT", 0.55),
                llr_ob_mult: env_f64("LLR_OB_MULT", 0.85),
                llr_taker_mult: env_f64("LLR_TAKER_MULT", 2.4),
                llr_perp_mult: env_f64("LLR_PERP_MULT", 380.0),
                llr_perp_cap: env_f64("LLR_PERP_CAP", 0.55),
                llr_oracle_agree: env_f64("LLR_ORACLE_AGREE", 0.22),
                llr_oracle_disagree: env_f64("LLR_ORACLE_DISAGREE", 0.60),
                llr_btc_lead_mult: env_f64("LLR_BTC_LEAD_MULT", 0.9),
                llr_clamp: env_f64("LLR_CLAMP", 3.0),
                tie_bias_up: env_f64("TIE_BIAS_UP", 0.012),
                prob_clamp_min: env_f64("PROB_CLAMP_MIN", 0.05),
                prob_clamp_max: env_f64("PROB_CLAMP_MAX", 0.95),
                min_score_gate: env_i64("MIN_SCORE_GATE", 6) as i32,
                min_score_gate_5m: env_i64("MIN_SCORE_GATE_5M", 8) as i32,
                min_score_gate_15m: env_i64("MIN_SCORE_GATE_15M", 6) as i32,
                min_true_prob_5m: env_f64("MIN_TRUE_PROB_5M", 0.60),
                min_true_prob_15m: env_f64("MIN_TRUE_PROB_15M", 0.58),
                rolling3_score_pen: env_i64("ROLLING3_SCORE_PEN", 2) as i32,
                max_win_mode: env_bool("MAX_WIN_MODE", true),
                winmode_require_oracle_agree: env_bool("WINMODE_REQUIRE_ORACLE_AGREE", true),
                winmode_min_true_prob_5m: env_f64("WINMODE_MIN_TRUE_PROB_5M", 0.62),
                winmode_min_true_prob_15m: env_f64("WINMODE_MIN_TRUE_PROB_15M", 0.58),
                winmode_min_edge: env_f64("WINMODE_MIN_EDGE", 0.015),
                winmode_max_entry_5m: env_f64("WINMODE_MAX_ENTRY_5M", 0.57),
                winmode_max_entry_15m: env_f64("WINMODE_MAX_ENTRY_15M", 0.585),
                util_edge_mult: env_f64("UTIL_EDGE_MULT", 0.35),
                max_entry_price: env_f64("MAX_ENTRY_PRICE", 0.54),
                max_entry_tol: env_f64("MAX_ENTRY_TOL", 0.02),
                min_entry_price_15m: env_f64("MIN_ENTRY_PRICE_15M", 0.06),
                entry_hard_cap_15m: env_f64("ENTRY_HARD_CAP_15M", 0.585),
                min_payout_15m: env_f64("MIN_PAYOUT_MULT", 1.72),
                min_payout_5m: env_f64("MIN_PAYOUT_MULT_5M", 1.75),
                payout_near_miss_tol: env_f64("PAYOUT_NEAR_MISS_TOL", 0.06),
                min_ev_net: env_f64("MIN_EV_NET", 0.018),
                min_ev_net_5m: env_f64("MIN_EV_NET_5M", 0.025),
                fee_coeff: env_f64("FEE_COEFF", 0.0624),
                ev_frontier_margin_base: env_f64("EV_FRONTIER_MARGIN_BASE", 0.015),
                ev_frontier_margin_high_entry: env_f64("EV_FRONTIER_MARGIN_HIGH_ENTRY", 0.10),
                pullback_limit_enabled: env_bool("PULLBACK_LIMIT_ENABLED", true),
                pullback_min_pct_left: env_f64("PULLBACK_MIN_PCT_LEFT", 0.45),
                late_relax_pct_left: env_f64("LATE_RELAX_PCT_LEFT", 0.45),
                late_relax_min_move: env_f64("LATE_RELAX_MIN_MOVE", 0.0010),
                late_relax_payout_floor: env_f64("LATE_RELAX_PAYOUT_FLOOR", 1.65),
                late_relax_prob_boost: env_f64("LATE_RELAX_PROB_BOOST", 0.04),
                analysis_oracle_fresh_s: env_f64("ANALYSIS_ORACLE_FRESH_S", 20.0),
                analysis_quote_fresh_ms: env_f64("ANALYSIS_QUOTE_FRESH_MS", 1_500.0),
                contrarian_tail_enabled: env_bool("CONTRARIAN_TAIL_ENABLED", true),
                contrarian_tail_max_entry: env_f64("CONTRARIAN_TAIL_MAX_ENTRY", 0.28),
                contrarian_tail_min_mins_left: env_f64("CONTRARIAN_TAIL_MIN_MINS_LEFT", 7.0),
                contrarian_tail_min_move: env_f64("CONTRARIAN_TAIL_MIN_MOVE", 0.0010),
                contrarian_tail_size_mult: env_f64("CONTRARIAN_TAIL_SIZE_MULT", 1.25),
                contrarian_tail_prob_floor: env_f64("CONTRARIAN_TAIL_PROB_FLOOR", 0.34),
                cross_consensus_min_count: env_u32("CROSS_CONSENSUS_MIN_COUNT", 3),
                cross_consensus_score_relax: env_i64("CROSS_CONSENSUS_SCORE_RELAX", 2) as i32,
                low_cent_threshold: env_f64("LOW_CENT_THRESHOLD", 0.12),
                lowcent_new_min_score: env_i64("LOWCENT_NEW_MIN_SCORE", 12) as i32,
                lowcent_new_min_prob: env_f64("LOWCENT_NEW_MIN_PROB", 0.30),
                lowcent_new_min_ev: env_f64("LOWCENT_NEW_MIN_EV", 0.06),
                lowcent_new_min_payout: env_f64("LOWCENT_NEW_MIN_PAYOUT", 6.0),
                consistency_min_payout_15m: env_f64("CONSISTENCY_MIN_PAYOUT_15M", 1.55),
                consistency_min_prob_15m: env_f64("CONSISTENCY_MIN_PROB_15M", 0.56),
                consistency_min_ev_15m: env_f64("CONSISTENCY_MIN_EV_15M", 0.012),
                consistency_max_entry_15m: env_f64("CONSISTENCY_MAX_ENTRY_15M", 0.62),
                consistency_strong_min_score: env_i64("CONSISTENCY_STRONG_MIN_SCORE", 13) as i32,
                consistency_strong_min_prob: env_f64("CONSISTENCY_STRONG_MIN_PROB", 0.64),
                consistency_strong_min_ev: env_f64("CONSISTENCY_STRONG_MIN_EV", 0.035),
                consistency_trail_min_pct_left: env_f64("CONSISTENCY_TRAIL_MIN_PCT_LEFT", 0.55),
                debounce_ms: env_u64("SCORER_DEBOUNCE_MS", 400),
                seen_ring_len: env_u64("SEEN_RING_LEN", 4096) as usize,
            },
            sizing: SizingConfig {
                tier_score_high: env_i64("TIER_SCORE_HIGH", 12) as i32,
                tier_score_mid: env_i64("TIER_SCORE_MID", 9) as i32,
                max_single_abs_cap: env_f64("MAX_SINGLE_ABS_CAP", 120.0),
                min_hard_cap_usdc: env_f64("MIN_HARD_CAP_USDC", 2.0),
                max_bankroll_pct: env_f64("MAX_BANKROLL_PCT", 0.08),
                max_cid_exposure_pct: env_f64("MAX_CID_EXPOSURE_PCT", 0.06),
                min_bet_abs: env_f64("MIN_BET_ABS", 1.0),
                min_bet_pct: env_f64("MIN_BET_PCT", 0.004),
                min_exec_notional: env_f64("MIN_EXEC_NOTIONAL_USDC", 1.0),
                tail_cap_entry_1: env_f64("TAIL_CAP_ENTRY_1", 0.08),
                tail_cap_pct_1: env_f64("TAIL_CAP_PCT_1", 0.012),
                tail_cap_entry_2: env_f64("TAIL_CAP_ENTRY_2", 0.16),
                tail_cap_pct_2: env_f64("TAIL_CAP_PCT_2", 0.020),
                time_scale_late_2_5: env_f64("TIME_SCALE_LATE_2_5", 0.45),
                time_scale_late_3_5: env_f64("TIME_SCALE_LATE_3_5", 0.65),
                time_scale_late_5_0: env_f64("TIME_SCALE_LATE_5_0", 0.85),
                cents_scale_3c: env_f64("CENTS_SCALE_3C", 0.25),
                cents_scale_5c: env_f64("CENTS_SCALE_5C", 0.40),
                cents_scale_10c: env_f64("CENTS_SCALE_10C", 0.60),
                cents_scale_20c: env_f64("CENTS_SCALE_20C", 0.80),
                leader_fresh_size_scale: env_f64("LEADER_FRESH_SIZE_SCALE", 1.0),
                leader_noflow_size_scale: env_f64("LEADER_NOFLOW_SIZE_SCALE", 0.70),
                super_bet_floor_enabled: env_bool("SUPER_BET_FLOOR_ENABLED", true),
                super_bet_cap_enabled: env_bool("SUPER_BET_CAP_ENABLED", true),
                super_bet_entry_max: env_f64("SUPER_BET_ENTRY_MAX", 0.25),
                super_bet_min_payout: env_f64("SUPER_BET_MIN_PAYOUT", 4.0),
                super_bet_min_size: env_f64("SUPER_BET_MIN_SIZE", 8.0),
                super_bet_max_size: env_f64("SUPER_BET_MAX_SIZE", 25.0),
                super_bet_max_bankroll_pct: env_f64("SUPER_BET_MAX_BANKROLL_PCT", 0.04),
                super_bet_min_score: env_i64("SUPER_BET_MIN_SCORE", 11) as i32,
                super_bet_min_ev: env_f64("SUPER_BET_MIN_EV", 0.05),
                super_bet_cooldown_s: env_f64("SUPER_BET_COOLDOWN_S", 420.0),
                round_stack_decay: env_f64("ROUND_STACK_DECAY", 0.55),
                round_stack_min: env_f64("ROUND_STACK_MIN", 0.20),
                round_total_decay: env_f64("ROUND_TOTAL_DECAY", 0.80),
                round_total_min: env_f64("ROUND_TOTAL_MIN", 0.40),
                round_corr_decay: env_f64("ROUND_CORR_DECAY", 0.70),
                round_corr_min: env_f64("ROUND_CORR_MIN", 0.30),
                oracle_scale_disagree_fresh: env_f64("ORACLE_SCALE_DISAGREE_FRESH", 0.40),
                oracle_scale_disagree_stale: env_f64("ORACLE_SCALE_DISAGREE_STALE", 0.65),
            },
            booster: BoosterConfig {
                enabled: env_bool("BOOSTER_ENABLED", true),
                max_per_cid: env_u32("BOOSTER_MAX_PER_CID", 1),
                min_left_hard_15m: env_f64("BOOSTER_MIN_LEFT_HARD_15M", 3.0),
                ideal_min_left_15m: env_f64("BOOSTER_IDEAL_MIN_LEFT_15M", 5.0),
                ideal_max_left_15m: env_f64("BOOSTER_IDEAL_MAX_LEFT_15M", 11.0),
                anytime_15m: env_bool("BOOSTER_ANYTIME_15M", false),
                min_score: env_i64("BOOSTER_MIN_SCORE", 11) as i32,
                min_true_prob: env_f64("BOOSTER_MIN_TRUE_PROB", 0.62),
                min_edge: env_f64("BOOSTER_MIN_EDGE", 0.06),
                min_ev_net: env_f64("BOOSTER_MIN_EV_NET", 0.035),
                min_payout: env_f64("BOOSTER_MIN_PAYOUT", 1.55),
                max_entry: env_f64("BOOSTER_MAX_ENTRY", 0.66),
                min_vol_ratio: env_f64("BOOSTER_MIN_VOL_RATIO", 0.90),
                min_conviction: env_f64("BOOSTER_MIN_CONVICTION", 0.52),
                size_pct: env_f64("BOOSTER_SIZE_PCT", 0.010),
                size_pct_high: env_f64("BOOSTER_SIZE_PCT_HIGH", 0.016),
                prev_size_cap_mult: env_f64("BOOSTER_PREV_SIZE_CAP_MULT", 0.60),
                loss_streak_lock: env_u32("BOOSTER_LOSS_STREAK_LOCK", 3),
                lock_hours: env_f64("BOOSTER_LOCK_HOURS", 6.0),
            },
            exec: ExecConfig {
                maker_hold_5m: Duration::from_millis(env_u64("MAKER_HOLD_5M_MS", 2_500)),
                maker_hold_15m: Duration::from_millis(env_u64("MAKER_HOLD_15M_MS", 6_000)),
                fast_taker_near_end_s: env_i64("FAST_TAKER_NEAR_END_S", 150),
                tick_tolerance: env_f64("TICK_TOLERANCE", 0.01),
                default_tick: env_f64("DEFAULT_TICK", 0.01),
                min_partial_track_usdc: env_f64("MIN_PARTIAL_TRACK_USDC", 0.50),
                max_attempts: env_u32("EXEC_MAX_ATTEMPTS", 3),
                retry_base_ms: env_u64("EXEC_RETRY_BASE_MS", 250),
                retry_jitter_ms: env_u64("EXEC_RETRY_JITTER_MS", 200),
                taker_slip_cap_bps_5m: env_f64("TAKER_SLIP_CAP_BPS_5M", 180.0),
                taker_slip_cap_bps_15m: env_f64("TAKER_SLIP_CAP_BPS_15M", 260.0),
                order_poll_ms: env_u64("ORDER_POLL_MS", 350),
                force_taker_score: env_i64("FORCE_TAKER_SCORE", 12) as i32,
                force_taker_move_min: env_f64("FORCE_TAKER_MOVE_MIN", 0.0012),
                fast_exec_score: env_i64("FAST_EXEC_SCORE", 14) as i32,
                fast_exec_edge: env_f64("FAST_EXEC_EDGE", 0.10),
            },
            risk: RiskConfig {
                reconcile_interval: Duration::from_millis(env_u64("RECONCILE_INTERVAL_MS", 2_000)),
                max_open_positions: env_u64("MAX_OPEN_POSITIONS", 10) as usize,
                side_cap_pct: env_f64("SIDE_CAP_PCT", 0.22),
                side_cap_pct_choppy: env_f64("SIDE_CAP_PCT_CHOPPY", 0.14),
                cid_cap_pct: env_f64("CID_CAP_PCT", 0.06),
                presence_threshold_usdc: env_f64("PRESENCE_THRESHOLD_USDC", 0.25),
                prune_absent_cycles: env_u32("PRUNE_ABSENT_CYCLES", 3),
                prune_min_grace_s: env_i64("PRUNE_MIN_GRACE_S", 90),
            },
            settlement: SettlementConfig {
                scan_interval_s: env_u64("REDEEM_SCAN_INTERVAL_S", 5),
                dust_usdc: env_f64("REDEEM_DUST_USDC", 0.05),
                max_verify_attempts: env_u32("REDEEM_MAX_VERIFY_ATTEMPTS", 30),
                max_submit_attempts: env_u32("REDEEM_MAX_SUBMIT_ATTEMPTS", 5),
                receipt_timeout_s: env_u64("REDEEM_RECEIPT_TIMEOUT_S", 120),
                gas_limit: env_u64("REDEEM_GAS_LIMIT", 240_000),
                priority_fee_gwei: env_u64("REDEEM_PRIORITY_FEE_GWEI", 40),
                backfill_interval_s: env_u64("REDEEM_BACKFILL_INTERVAL_S", 900),
                backfill_pages: env_u32("REDEEM_BACKFILL_PAGES", 10),
                settled_retention_s: env_i64("SETTLED_RETENTION_S", 36 * 3600),
            },
            http: HttpConfig {
                min_gap_ms: env_u64("HTTP_MIN_GAP_MS", 120),
                retries_429: env_u32("HTTP_RETRIES_429", 2),
                retries_5xx: env_u32("HTTP_RETRIES_5XX", 2),
                cache_ttl_s: env_f64("HTTP_CACHE_TTL_S", 0.8),
                stale_ttl_s: env_f64("HTTP_STALE_TTL_S", 30.0),
                timeout_s: env_u64("HTTP_TIMEOUT_S", 8),
                bounded_inflight: env_u64("HTTP_BOUNDED_INFLIGHT", 8) as usize,
            },
            rpc_probe_interval_s: env_u64("RPC_PROBE_INTERVAL_S", 120),
            rpc_swap_margin_ms: env_f64("RPC_SWAP_MARGIN_MS", 40.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::from_env();
        assert!(cfg.scorer.min_payout_15m >= 1.0);
        assert!(cfg.scorer.fee_coeff > 0.0 && cfg.scorer.fee_coeff < 1.0);
        assert!(cfg.scorer.prob_clamp_min < cfg.scorer.prob_clamp_max);
        assert!(cfg.sizing.max_bankroll_pct <= 1.0);
        assert!(cfg.exec.maker_hold_5m < cfg.exec.maker_hold_15m);
        assert!(!cfg.endpoints.rpc_urls.is_empty());
        assert_eq!(cfg.scorer.seen_ring_len, 4096);
    }
}
