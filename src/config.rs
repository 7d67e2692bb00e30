// =============================================================================
// Runtime Configuration — Hot-reloadable engine settings with atomic save
// =============================================================================
//
// Every tunable parameter of the engine lives here. Persistence uses an
// atomic tmp + rename pattern to prevent corruption on crash, and all fields
// carry serde defaults so that adding new fields never breaks loading an
// older config file.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::{AccountMode, TradingMode};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_instruments() -> Vec<String> {
    vec![
        "EUR_USD".to_string(),
        "GBP_USD".to_string(),
        "USD_JPY".to_string(),
    ]
}

fn default_futures_map() -> HashMap<String, String> {
    let mut map = HashMap::new();
    map.insert("EUR_USD".to_string(), "6E".to_string());
    map.insert("GBP_USD".to_string(), "6B".to_string());
    map.insert("USD_JPY".to_string(), "6J".to_string());
    map.insert("AUD_USD".to_string(), "6A".to_string());
    map.insert("USD_CHF".to_string(), "6S".to_string());
    map.insert("USD_CAD".to_string(), "6C".to_string());
    map
}

fn default_db_path() -> String {
    "meridian.db".to_string()
}

fn default_tick_ttl_secs() -> u64 {
    2
}

fn default_candle_ttl_secs() -> u64 {
    120
}

fn default_of_ttl_secs() -> u64 {
    5
}

fn default_ta_ttl_secs() -> u64 {
    600
}

fn default_max_candles() -> usize {
    100
}

fn default_max_spread_pips() -> f64 {
    1.5
}

fn default_atr_fast_bars() -> usize {
    7
}

fn default_atr_slow_bars() -> usize {
    28
}

fn default_min_atr_ratio() -> f64 {
    0.6
}

fn default_min_atr_pips() -> f64 {
    5.5
}

fn default_min_htf_distance_pips() -> f64 {
    6.0
}

fn default_sessions() -> Vec<SessionWindow> {
    vec![
        SessionWindow {
            name: "London".to_string(),
            start: "07:00".to_string(),
            end: "10:30".to_string(),
            jpy_only: false,
        },
        SessionWindow {
            name: "NewYork".to_string(),
            start: "13:30".to_string(),
            end: "16:00".to_string(),
            jpy_only: false,
        },
        SessionWindow {
            name: "Tokyo".to_string(),
            start: "00:00".to_string(),
            end: "02:00".to_string(),
            jpy_only: true,
        },
    ]
}

fn default_cycle_interval_secs() -> u64 {
    60
}

fn default_cycle_soft_budget_secs() -> u64 {
    10
}

fn default_cycle_hard_budget_secs() -> u64 {
    30
}

fn default_worker_concurrency() -> usize {
    3
}

fn default_min_pattern_score() -> f64 {
    60.0
}

fn default_validate_pattern_score() -> f64 {
    70.0
}

fn default_auto_approve_score() -> f64 {
    85.0
}

fn default_default_tp_pips() -> f64 {
    10.0
}

fn default_default_sl_pips() -> f64 {
    6.0
}

fn default_min_risk_reward() -> f64 {
    1.5
}

fn default_order_retry_attempts() -> u32 {
    2
}

fn default_max_open_positions() -> usize {
    2
}

fn default_max_trades_per_day() -> u32 {
    40
}

fn default_duration_cap_secs() -> i64 {
    1200
}

fn default_monitor_interval_secs() -> u64 {
    30
}

fn default_max_consecutive_losses() -> u32 {
    5
}

fn default_loss_cooldown_secs() -> i64 {
    1800
}

fn default_max_daily_loss_pct() -> f64 {
    3.0
}

fn default_base_size_lots() -> f64 {
    0.1
}

fn default_news_refresh_secs() -> u64 {
    60
}

fn default_pre_event_secs() -> i64 {
    900
}

fn default_post_event_secs() -> i64 {
    600
}

fn default_close_positions_offset_secs() -> i64 {
    600
}

fn default_ta_poll_interval_secs() -> u64 {
    120
}

fn default_ta_budget_per_minute() -> f64 {
    10.0
}

fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_llm_max_tokens() -> u32 {
    700
}

fn default_llm_timeout_secs() -> u64 {
    60
}

fn default_llm_retries() -> u32 {
    2
}

fn default_llm_calls_per_minute() -> f64 {
    20.0
}

fn default_sweep_levels() -> usize {
    3
}

fn default_vpin_buckets() -> usize {
    50
}

fn default_vpin_bucket_volume() -> f64 {
    500.0
}

fn default_friday_close() -> String {
    "21:00".to_string()
}

fn default_sunday_open() -> String {
    "21:05".to_string()
}

fn default_hub_bind_addr() -> String {
    "127.0.0.1:7878".to_string()
}

fn default_backoff_initial_ms() -> u64 {
    500
}

fn default_backoff_cap_ms() -> u64 {
    30_000
}

// =============================================================================
// Sub-structures
// =============================================================================

/// One UTC intraday trading window. `jpy_only` windows apply only to pairs
/// quoted in or against JPY.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionWindow {
    pub name: String,
    /// "HH:MM" UTC.
    pub start: String,
    /// "HH:MM" UTC.
    pub end: String,
    #[serde(default)]
    pub jpy_only: bool,
}

impl SessionWindow {
    /// True when the time-of-day of `now` falls inside [start, end).
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        let (Some(start), Some(end)) = (parse_hhmm(&self.start), parse_hhmm(&self.end)) else {
            return false;
        };
        let t = now.time();
        t >= start && t < end
    }
}

/// Parse "HH:MM" into a `NaiveTime`. Returns `None` on malformed input.
pub fn parse_hhmm(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M").ok()
}

/// Hub freshness TTLs and window sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubParams {
    #[serde(default = "default_tick_ttl_secs")]
    pub tick_ttl_secs: u64,
    #[serde(default = "default_candle_ttl_secs")]
    pub candle_ttl_secs: u64,
    #[serde(default = "default_of_ttl_secs")]
    pub order_flow_ttl_secs: u64,
    #[serde(default = "default_ta_ttl_secs")]
    pub ta_ttl_secs: u64,
    /// Rolling candle window per (instrument, timeframe); clamped to 200.
    #[serde(default = "default_max_candles")]
    pub max_candles: usize,
}

impl Default for HubParams {
    fn default() -> Self {
        Self {
            tick_ttl_secs: default_tick_ttl_secs(),
            candle_ttl_secs: default_candle_ttl_secs(),
            order_flow_ttl_secs: default_of_ttl_secs(),
            ta_ttl_secs: default_ta_ttl_secs(),
            max_candles: default_max_candles(),
        }
    }
}

/// Pre-trade gate thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateParams {
    #[serde(default = "default_max_spread_pips")]
    pub max_spread_pips: f64,
    #[serde(default = "default_atr_fast_bars")]
    pub atr_fast_bars: usize,
    #[serde(default = "default_atr_slow_bars")]
    pub atr_slow_bars: usize,
    /// Reject when ATR_fast / ATR_slow drops below this.
    #[serde(default = "default_min_atr_ratio")]
    pub min_atr_ratio: f64,
    #[serde(default = "default_min_atr_pips")]
    pub min_atr_pips: f64,
    #[serde(default = "default_min_htf_distance_pips")]
    pub min_htf_distance_pips: f64,
    #[serde(default = "default_sessions")]
    pub sessions: Vec<SessionWindow>,
}

impl Default for GateParams {
    fn default() -> Self {
        Self {
            max_spread_pips: default_max_spread_pips(),
            atr_fast_bars: default_atr_fast_bars(),
            atr_slow_bars: default_atr_slow_bars(),
            min_atr_ratio: default_min_atr_ratio(),
            min_atr_pips: default_min_atr_pips(),
            min_htf_distance_pips: default_min_htf_distance_pips(),
            sessions: default_sessions(),
        }
    }
}

/// Decision-engine cadence, tier cutoffs and order sizing knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineParams {
    #[serde(default = "default_cycle_interval_secs")]
    pub cycle_interval_secs: u64,
    #[serde(default = "default_cycle_soft_budget_secs")]
    pub cycle_soft_budget_secs: u64,
    #[serde(default = "default_cycle_hard_budget_secs")]
    pub cycle_hard_budget_secs: u64,
    /// Bounded concurrency for per-instrument cycles (LLM rate discipline).
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,
    #[serde(default = "default_min_pattern_score")]
    pub min_pattern_score: f64,
    /// Scores in [min, validate) are logged as shadow candidates and rejected.
    #[serde(default = "default_validate_pattern_score")]
    pub validate_pattern_score: f64,
    #[serde(default = "default_auto_approve_score")]
    pub auto_approve_score: f64,
    #[serde(default = "default_default_tp_pips")]
    pub default_tp_pips: f64,
    #[serde(default = "default_default_sl_pips")]
    pub default_sl_pips: f64,
    #[serde(default = "default_min_risk_reward")]
    pub min_risk_reward: f64,
    #[serde(default = "default_order_retry_attempts")]
    pub order_retry_attempts: u32,
    #[serde(default = "default_base_size_lots")]
    pub base_size_lots: f64,
    /// "HH:MM" UTC Friday boundary after which no new cycles run.
    #[serde(default = "default_friday_close")]
    pub friday_close_utc: String,
    /// "HH:MM" UTC Sunday boundary at which cycles resume.
    #[serde(default = "default_sunday_open")]
    pub sunday_open_utc: String,
}

impl Default for EngineParams {
    fn default() -> Self {
        Self {
            cycle_interval_secs: default_cycle_interval_secs(),
            cycle_soft_budget_secs: default_cycle_soft_budget_secs(),
            cycle_hard_budget_secs: default_cycle_hard_budget_secs(),
            worker_concurrency: default_worker_concurrency(),
            min_pattern_score: default_min_pattern_score(),
            validate_pattern_score: default_validate_pattern_score(),
            auto_approve_score: default_auto_approve_score(),
            default_tp_pips: default_default_tp_pips(),
            default_sl_pips: default_default_sl_pips(),
            min_risk_reward: default_min_risk_reward(),
            order_retry_attempts: default_order_retry_attempts(),
            base_size_lots: default_base_size_lots(),
            friday_close_utc: default_friday_close(),
            sunday_open_utc: default_sunday_open(),
        }
    }
}

impl EngineParams {
    /// Spot forex closes for the weekend. True between the Friday close and
    /// the Sunday open boundaries (both configurable to absorb DST shifts).
    pub fn is_weekend_closed(&self, now: DateTime<Utc>) -> bool {
        let close = parse_hhmm(&self.friday_close_utc).unwrap_or(NaiveTime::MIN);
        let open = parse_hhmm(&self.sunday_open_utc).unwrap_or(NaiveTime::MIN);
        match now.weekday() {
            Weekday::Sat => true,
            Weekday::Fri => now.time() >= close,
            Weekday::Sun => now.time() < open,
            _ => false,
        }
    }
}

/// Position-lifecycle limits and circuit breakers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleParams {
    #[serde(default = "default_max_open_positions")]
    pub max_open_positions: usize,
    #[serde(default = "default_max_trades_per_day")]
    pub max_trades_per_day: u32,
    #[serde(default = "default_duration_cap_secs")]
    pub duration_cap_secs: i64,
    #[serde(default = "default_monitor_interval_secs")]
    pub monitor_interval_secs: u64,
    #[serde(default = "default_max_consecutive_losses")]
    pub max_consecutive_losses: u32,
    #[serde(default = "default_loss_cooldown_secs")]
    pub loss_cooldown_secs: i64,
    #[serde(default = "default_max_daily_loss_pct")]
    pub max_daily_loss_pct: f64,
    /// Reject a new position when another open position already shares a
    /// currency with it. Off by default.
    #[serde(default)]
    pub currency_exposure_filter: bool,
}

impl Default for LifecycleParams {
    fn default() -> Self {
        Self {
            max_open_positions: default_max_open_positions(),
            max_trades_per_day: default_max_trades_per_day(),
            duration_cap_secs: default_duration_cap_secs(),
            monitor_interval_secs: default_monitor_interval_secs(),
            max_consecutive_losses: default_max_consecutive_losses(),
            loss_cooldown_secs: default_loss_cooldown_secs(),
            max_daily_loss_pct: default_max_daily_loss_pct(),
            currency_exposure_filter: false,
        }
    }
}

/// News gating window geometry and refresh cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewsParams {
    #[serde(default = "default_news_refresh_secs")]
    pub refresh_secs: u64,
    /// Window opens this many seconds before the event.
    #[serde(default = "default_pre_event_secs")]
    pub pre_event_secs: i64,
    /// Window closes this many seconds after the event.
    #[serde(default = "default_post_event_secs")]
    pub post_event_secs: i64,
    /// Open positions must be flat this many seconds before the event.
    #[serde(default = "default_close_positions_offset_secs")]
    pub close_positions_offset_secs: i64,
}

impl Default for NewsParams {
    fn default() -> Self {
        Self {
            refresh_secs: default_news_refresh_secs(),
            pre_event_secs: default_pre_event_secs(),
            post_event_secs: default_post_event_secs(),
            close_positions_offset_secs: default_close_positions_offset_secs(),
        }
    }
}

/// TA aggregator polling cadence and API budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaParams {
    #[serde(default = "default_ta_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Global token-bucket budget shared across instruments.
    #[serde(default = "default_ta_budget_per_minute")]
    pub budget_per_minute: f64,
}

impl Default for TaParams {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_ta_poll_interval_secs(),
            budget_per_minute: default_ta_budget_per_minute(),
        }
    }
}

/// LLM completion settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmParams {
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_llm_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_llm_retries")]
    pub max_retries: u32,
    #[serde(default = "default_llm_calls_per_minute")]
    pub calls_per_minute: f64,
}

impl Default for LlmParams {
    fn default() -> Self {
        Self {
            model: default_llm_model(),
            max_tokens: default_llm_max_tokens(),
            timeout_secs: default_llm_timeout_secs(),
            max_retries: default_llm_retries(),
            calls_per_minute: default_llm_calls_per_minute(),
        }
    }
}

/// Order-flow window computation knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderFlowParams {
    /// Book levels a single aggressive trade must consume within one second
    /// for the sweep flag.
    #[serde(default = "default_sweep_levels")]
    pub sweep_levels: usize,
    #[serde(default = "default_vpin_buckets")]
    pub vpin_buckets: usize,
    #[serde(default = "default_vpin_bucket_volume")]
    pub vpin_bucket_volume: f64,
}

impl Default for OrderFlowParams {
    fn default() -> Self {
        Self {
            sweep_levels: default_sweep_levels(),
            vpin_buckets: default_vpin_buckets(),
            vpin_bucket_volume: default_vpin_bucket_volume(),
        }
    }
}

/// Stream reconnection backoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffParams {
    #[serde(default = "default_backoff_initial_ms")]
    pub initial_ms: u64,
    #[serde(default = "default_backoff_cap_ms")]
    pub cap_ms: u64,
}

impl Default for BackoffParams {
    fn default() -> Self {
        Self {
            initial_ms: default_backoff_initial_ms(),
            cap_ms: default_backoff_cap_ms(),
        }
    }
}

impl BackoffParams {
    /// `min(initial * 2^attempt, cap)` without jitter; callers add jitter.
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        let exp = self.initial_ms.saturating_mul(1u64 << attempt.min(20));
        exp.min(self.cap_ms)
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration for the Meridian engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Operational modes ---------------------------------------------------
    #[serde(default)]
    pub trading_mode: TradingMode,
    #[serde(default)]
    pub account_mode: AccountMode,

    // --- Universe ------------------------------------------------------------
    #[serde(default = "default_instruments")]
    pub instruments: Vec<String>,
    /// Spot pair -> futures root used by the order-flow stream.
    #[serde(default = "default_futures_map")]
    pub futures_symbols: HashMap<String, String>,

    // --- Persistence ---------------------------------------------------------
    #[serde(default = "default_db_path")]
    pub db_path: String,

    // --- Hub RPC -------------------------------------------------------------
    #[serde(default = "default_hub_bind_addr")]
    pub hub_bind_addr: String,

    // --- Subsystems ----------------------------------------------------------
    #[serde(default)]
    pub hub: HubParams,
    #[serde(default)]
    pub gates: GateParams,
    #[serde(default)]
    pub engine: EngineParams,
    #[serde(default)]
    pub lifecycle: LifecycleParams,
    #[serde(default)]
    pub news: NewsParams,
    #[serde(default)]
    pub ta: TaParams,
    #[serde(default)]
    pub llm: LlmParams,
    #[serde(default)]
    pub order_flow: OrderFlowParams,
    #[serde(default)]
    pub backoff: BackoffParams,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            trading_mode: TradingMode::Paused,
            account_mode: AccountMode::Demo,
            instruments: default_instruments(),
            futures_symbols: default_futures_map(),
            db_path: default_db_path(),
            hub_bind_addr: default_hub_bind_addr(),
            hub: HubParams::default(),
            gates: GateParams::default(),
            engine: EngineParams::default(),
            lifecycle: LifecycleParams::default(),
            news: NewsParams::default(),
            ta: TaParams::default(),
            llm: LlmParams::default(),
            order_flow: OrderFlowParams::default(),
            backoff: BackoffParams::default(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            instruments = ?config.instruments,
            trading_mode = %config.trading_mode,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }

    /// Session windows applicable to `instrument_id` (JPY-only windows are
    /// filtered for non-JPY pairs).
    pub fn sessions_for(&self, instrument_id: &str) -> Vec<&SessionWindow> {
        let is_jpy = instrument_id.contains("JPY");
        self.gates
            .sessions
            .iter()
            .filter(|w| !w.jpy_only || is_jpy)
            .collect()
    }

}
