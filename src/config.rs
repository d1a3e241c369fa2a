//! Engine configuration.
//!
//! All knobs are read once from environment variables into a plain
//! `Config` value that the supervisor constructs and passes down. Invalid
//! values fall back to the default with a warning rather than aborting.
//!
//! Environment variables mirror the field names in SCREAMING_SNAKE_CASE,
//! e.g. `SCAN_INTERVAL_MS`, `IMMEDIATE_MIN_EDGE_PCT`, `OPINION_MAX_RPS`.

use std::time::Duration;
use tracing::warn;

/// Opinion REST API base URL
pub const OPINION_API_BASE: &str = "https://proxy.opinion.trade:8443";

/// Polymarket CLOB REST API base URL
pub const POLYMARKET_API_BASE: &str = "https://clob.polymarket.com";

/// Orders on Opinion below this notional (quote units) are rejected locally.
pub const OPINION_MIN_NOTIONAL: f64 = 1.3;

/// Consecutive adapter failures before a venue is marked degraded.
pub const DEGRADED_AFTER_FAILURES: u32 = 5;

fn env_parse<T: std::str::FromStr + std::fmt::Display + Copy>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.parse::<T>() {
            Ok(v) => v,
            Err(_) => {
                warn!("Failed to parse {}='{}', using default {}", key, raw, default);
                default
            }
        },
        Err(_) => default,
    }
}

fn env_flag(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"),
        Err(_) => default,
    }
}

/// Complete engine configuration with the documented defaults.
#[derive(Debug, Clone)]
pub struct Config {
    // === Cadence ===
    /// Time between opportunity scans.
    pub scan_interval: Duration,
    /// Market re-discovery cadence.
    pub matcher_refresh: Duration,
    /// Order poll tick while waiting for terminal state.
    pub order_poll_interval: Duration,

    // === Strategy thresholds ===
    /// Effective edge (percent) at or above which the immediate strategy fires.
    pub immediate_min_edge_pct: f64,
    /// Above this effective edge (percent) an opportunity is skipped as suspicious.
    pub immediate_max_edge_pct: f64,
    /// Annualized return (percent) threshold for the liquidity strategy.
    pub liquidity_min_annualized_pct: f64,
    /// Edge collapse exit: liquidity tickets cancel once the raw edge drops
    /// this many percentage points below the entry threshold.
    pub liquidity_exit_slack_pct: f64,
    /// Shares per resting liquidity order.
    pub liquidity_target_size: f64,
    /// Minimum seconds between reprices of a single liquidity ticket.
    pub liquidity_reprice_interval: Duration,

    // === Sizing ===
    /// Hard cap on a single opportunity's size in shares.
    pub max_per_trade_shares: f64,
    /// Hard cap on a single opportunity's notional in quote units.
    pub max_notional: f64,
    /// First-leg fills below this are abandoned rather than hedged.
    pub min_hedge_size: f64,
    /// Hedge IOC may be priced up to this many ticks worse than scanned.
    pub slippage_cap_ticks: u32,
    /// Maximum hedge attempts before residual exposure is surfaced.
    pub max_hedge_attempts: u32,

    // === Concurrency ===
    /// Parallel immediate executions.
    pub max_concurrent_immediate: usize,
    /// Maximum concurrently tracked liquidity tickets.
    pub max_liquidity_tickets: usize,

    // === Book fetching ===
    /// Tokens per batch book request.
    pub orderbook_batch_size: usize,
    /// Rate limit for Opinion book fetches, requests per second.
    pub opinion_max_rps: u32,
    /// Rate limit for Polymarket book fetches, requests per second.
    pub polymarket_max_rps: u32,
    /// Snapshots older than this are dropped from the scan frame.
    pub max_book_age: Duration,
    /// Per-request book fetch timeout.
    pub book_fetch_timeout: Duration,

    // === Fees ===
    /// Quadratic coefficient of the Opinion fee curve.
    pub fee_curve_a: f64,
    /// Constant term of the Opinion fee curve.
    pub fee_curve_c: f64,
    /// Minimum fee per Opinion taker order, quote units.
    pub opinion_min_fee: f64,

    // === Matching ===
    /// Normalized title similarity required to bind a pair.
    pub title_similarity_threshold: f64,
    /// Resolution dates must fall within this window to bind a pair.
    pub max_resolution_date_delta_hours: i64,

    // === Operations ===
    /// Scan and log only; never place orders.
    pub dry_run: bool,
    /// Halt once both venues have been unavailable this long.
    pub both_venues_down_limit: Duration,
    /// Timeouts for venue calls.
    pub order_place_timeout: Duration,
    pub order_poll_timeout: Duration,
    pub cancel_timeout: Duration,
    /// Directory for the append-only trade log.
    pub trade_log_dir: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_millis(500),
            matcher_refresh: Duration::from_secs(300),
            order_poll_interval: Duration::from_millis(100),
            immediate_min_edge_pct: 2.0,
            immediate_max_edge_pct: 50.0,
            liquidity_min_annualized_pct: 20.0,
            liquidity_exit_slack_pct: 0.5,
            liquidity_target_size: 250.0,
            liquidity_reprice_interval: Duration::from_secs(5),
            max_per_trade_shares: 1000.0,
            max_notional: 1000.0,
            min_hedge_size: 1.0,
            slippage_cap_ticks: 2,
            max_hedge_attempts: 5,
            max_concurrent_immediate: 2,
            max_liquidity_tickets: 20,
            orderbook_batch_size: 20,
            opinion_max_rps: 15,
            polymarket_max_rps: 20,
            max_book_age: Duration::from_secs(2),
            book_fetch_timeout: Duration::from_secs(2),
            fee_curve_a: 0.06,
            fee_curve_c: 0.0025,
            opinion_min_fee: 0.50,
            title_similarity_threshold: 0.85,
            max_resolution_date_delta_hours: 48,
            dry_run: true,
            both_venues_down_limit: Duration::from_secs(30 * 60),
            order_place_timeout: Duration::from_secs(5),
            order_poll_timeout: Duration::from_secs(2),
            cancel_timeout: Duration::from_secs(5),
            trade_log_dir: "./data".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables, falling back to the
    /// documented defaults field by field.
    pub fn from_env() -> Self {
        let d = Config::default();
        Self {
            scan_interval: Duration::from_millis(env_parse("SCAN_INTERVAL_MS", 500u64)),
            matcher_refresh: Duration::from_secs(env_parse("MATCHER_REFRESH_S", 300u64)),
            order_poll_interval: Duration::from_millis(env_parse("ORDER_POLL_MS", 100u64)),
            immediate_min_edge_pct: env_parse("IMMEDIATE_MIN_EDGE_PCT", d.immediate_min_edge_pct),
            immediate_max_edge_pct: env_parse("IMMEDIATE_MAX_EDGE_PCT", d.immediate_max_edge_pct),
            liquidity_min_annualized_pct: env_parse(
                "LIQUIDITY_MIN_ANNUALIZED_PCT",
                d.liquidity_min_annualized_pct,
            ),
            liquidity_exit_slack_pct: env_parse(
                "LIQUIDITY_EXIT_SLACK_PCT",
                d.liquidity_exit_slack_pct,
            ),
            liquidity_target_size: env_parse("LIQUIDITY_TARGET_SIZE", d.liquidity_target_size),
            liquidity_reprice_interval: Duration::from_secs(env_parse(
                "LIQUIDITY_REPRICE_INTERVAL_S",
                5u64,
            )),
            max_per_trade_shares: env_parse("MAX_PER_TRADE_SHARES", d.max_per_trade_shares),
            max_notional: env_parse("MAX_NOTIONAL", d.max_notional),
            min_hedge_size: env_parse("MIN_HEDGE_SIZE", d.min_hedge_size),
            slippage_cap_ticks: env_parse("SLIPPAGE_CAP_TICKS", d.slippage_cap_ticks),
            max_hedge_attempts: env_parse("MAX_HEDGE_ATTEMPTS", d.max_hedge_attempts),
            max_concurrent_immediate: env_parse(
                "MAX_CONCURRENT_IMMEDIATE",
                d.max_concurrent_immediate,
            ),
            max_liquidity_tickets: env_parse("MAX_LIQUIDITY_TICKETS", d.max_liquidity_tickets),
            orderbook_batch_size: env_parse("ORDERBOOK_BATCH_SIZE", d.orderbook_batch_size).max(1),
            opinion_max_rps: env_parse("OPINION_MAX_RPS", d.opinion_max_rps).max(1),
            polymarket_max_rps: env_parse("POLYMARKET_MAX_RPS", d.polymarket_max_rps).max(1),
            max_book_age: Duration::from_millis(env_parse("MAX_BOOK_AGE_MS", 2000u64)),
            book_fetch_timeout: Duration::from_millis(env_parse("BOOK_FETCH_TIMEOUT_MS", 2000u64)),
            fee_curve_a: env_parse("FEE_CURVE_A", d.fee_curve_a),
            fee_curve_c: env_parse("FEE_CURVE_C", d.fee_curve_c),
            opinion_min_fee: env_parse("OPINION_MIN_FEE", d.opinion_min_fee),
            title_similarity_threshold: env_parse(
                "TITLE_SIMILARITY_THRESHOLD",
                d.title_similarity_threshold,
            ),
            max_resolution_date_delta_hours: env_parse(
                "MAX_RESOLUTION_DATE_DELTA_HOURS",
                d.max_resolution_date_delta_hours,
            ),
            dry_run: env_flag("DRY_RUN", true),
            both_venues_down_limit: Duration::from_secs(env_parse(
                "BOTH_VENUES_DOWN_LIMIT_S",
                30 * 60u64,
            )),
            order_place_timeout: Duration::from_secs(env_parse("ORDER_PLACE_TIMEOUT_S", 5u64)),
            order_poll_timeout: Duration::from_secs(env_parse("ORDER_POLL_TIMEOUT_S", 2u64)),
            cancel_timeout: Duration::from_secs(env_parse("CANCEL_TIMEOUT_S", 5u64)),
            trade_log_dir: std::env::var("TRADE_LOG_DIR").unwrap_or(d.trade_log_dir),
        }
    }

    /// The liquidity exit threshold: entry threshold minus the slack.
    pub fn liquidity_exit_annualized_pct(&self) -> f64 {
        self.liquidity_min_annualized_pct - self.liquidity_exit_slack_pct
    }

    /// Validate cross-field consistency. Returns a description of the first
    /// problem found; a failed validation is a configuration error (exit 1).
    pub fn validate(&self) -> Result<(), String> {
        if self.immediate_min_edge_pct >= self.immediate_max_edge_pct {
            return Err(format!(
                "IMMEDIATE_MIN_EDGE_PCT ({}) must be below IMMEDIATE_MAX_EDGE_PCT ({})",
                self.immediate_min_edge_pct, self.immediate_max_edge_pct
            ));
        }
        if !(0.0..=1.0).contains(&self.title_similarity_threshold) {
            return Err(format!(
                "TITLE_SIMILARITY_THRESHOLD ({}) must lie in [0, 1]",
                self.title_similarity_threshold
            ));
        }
        if self.fee_curve_a < 0.0 || self.fee_curve_c < 0.0 {
            return Err("fee curve coefficients must be non-negative".to_string());
        }
        if self.max_per_trade_shares <= 0.0 {
            return Err("MAX_PER_TRADE_SHARES must be positive".to_string());
        }
        Ok(())
    }
}

/// Format a percentage for display in logs.
pub fn format_pct(value: f64) -> String {
    format!("{:.2}%", value)
}
