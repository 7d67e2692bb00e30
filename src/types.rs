// =============================================================================
// Shared types used across the Meridian FX engine
// =============================================================================
//
// Everything here is keyed by the canonical pair id (e.g. "EUR_USD"). Price
// deltas are converted to pips through the per-instrument pip size; JPY-quoted
// pairs quote to 2 decimals, everything else to 4.
// =============================================================================

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Instrument
// ---------------------------------------------------------------------------

/// Immutable identity of a tradable pair. Built once at startup and cached in
/// the instrument registry; every other type refers to it by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instrument {
    /// Canonical id, e.g. "EUR_USD".
    pub id: String,
    pub base: String,
    pub quote: String,
    /// Quote-dependent price increment (0.0001, or 0.01 for JPY quotes).
    pub pip_size: f64,
    /// Scaling factor used when a feed reports spreads in raw scaled ticks.
    pub decimal_places_factor: f64,
}

impl Instrument {
    /// Parse a canonical pair id like "EUR_USD" into an instrument with
    /// pip metadata derived from the quote currency.
    pub fn parse(id: &str) -> Result<Self> {
        let (base, quote) = id
            .split_once('_')
            .with_context(|| format!("instrument id '{id}' is not of the form BASE_QUOTE"))?;
        if base.len() != 3 || quote.len() != 3 {
            bail!("instrument id '{id}' has malformed currency codes");
        }

        let (pip_size, decimal_places_factor) = if quote == "JPY" {
            (0.01, 100.0)
        } else {
            (0.0001, 100_000.0)
        };

        Ok(Self {
            id: id.to_string(),
            base: base.to_string(),
            quote: quote.to_string(),
            pip_size,
            decimal_places_factor,
        })
    }

    /// Convert a price delta into pips.
    pub fn to_pips(&self, price_delta: f64) -> f64 {
        price_delta / self.pip_size
    }

    /// Convert pips into a price delta.
    pub fn from_pips(&self, pips: f64) -> f64 {
        pips * self.pip_size
    }

    /// True when either side of the pair is `currency`.
    pub fn involves(&self, currency: &str) -> bool {
        self.base == currency || self.quote == currency
    }
}

impl std::fmt::Display for Instrument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id)
    }
}

// ---------------------------------------------------------------------------
// Direction
// ---------------------------------------------------------------------------

/// Trade direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// +1.0 for long, -1.0 for short. Used in PnL math.
    pub fn sign(&self) -> f64 {
        match self {
            Self::Long => 1.0,
            Self::Short => -1.0,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "long"),
            Self::Short => write!(f, "short"),
        }
    }
}

impl std::str::FromStr for Direction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "long" | "buy" => Ok(Self::Long),
            "short" | "sell" => Ok(Self::Short),
            other => bail!("unknown direction '{other}'"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tick
// ---------------------------------------------------------------------------

/// A single top-of-book quote update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tick {
    pub instrument: String,
    pub event_time: DateTime<Utc>,
    pub bid: f64,
    pub ask: f64,
    pub mid: f64,
}

impl Tick {
    pub fn new(instrument: impl Into<String>, event_time: DateTime<Utc>, bid: f64, ask: f64) -> Self {
        Self {
            instrument: instrument.into(),
            event_time,
            bid,
            ask,
            mid: (bid + ask) / 2.0,
        }
    }

    /// Spread in pips for the given instrument. A crossed book reports its raw
    /// (negative) value so the spread gate can reject it.
    pub fn spread_pips(&self, instrument: &Instrument) -> f64 {
        instrument.to_pips(self.ask - self.bid)
    }
}

// ---------------------------------------------------------------------------
// Candle
// ---------------------------------------------------------------------------

/// Composite key identifying a unique candle series in the hub.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct CandleKey {
    pub instrument: String,
    pub timeframe: String,
}

impl CandleKey {
    pub fn new(instrument: impl Into<String>, timeframe: impl Into<String>) -> Self {
        Self {
            instrument: instrument.into(),
            timeframe: timeframe.into(),
        }
    }
}

impl std::fmt::Display for CandleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.instrument, self.timeframe)
    }
}

/// One OHLCV bar. The in-progress bar for the current minute carries
/// `finalized = false` and is replaced in the hub's forming slot on every
/// tick; on minute rollover it is frozen, persisted once, and appended to the
/// rolling window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub instrument: String,
    pub timeframe: String,
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub finalized: bool,
}

impl Candle {
    /// Open a new bar from the first tick of its minute.
    pub fn from_mid(
        instrument: impl Into<String>,
        timeframe: impl Into<String>,
        open_time: DateTime<Utc>,
        mid: f64,
    ) -> Self {
        Self {
            instrument: instrument.into(),
            timeframe: timeframe.into(),
            open_time,
            open: mid,
            high: mid,
            low: mid,
            close: mid,
            volume: 1.0,
            finalized: false,
        }
    }

    /// Fold another tick mid into the bar.
    pub fn apply_mid(&mut self, mid: f64) {
        if mid > self.high {
            self.high = mid;
        }
        if mid < self.low {
            self.low = mid;
        }
        self.close = mid;
        self.volume += 1.0;
    }

    /// OHLC sanity check. Violations are treated as invariant failures and
    /// must never reach the store.
    pub fn validate(&self) -> Result<()> {
        if !(self.open.is_finite()
            && self.high.is_finite()
            && self.low.is_finite()
            && self.close.is_finite())
        {
            bail!("candle {}@{} has non-finite prices", self.instrument, self.open_time);
        }
        if self.open > self.high
            || self.close > self.high
            || self.low > self.open
            || self.low > self.close
        {
            bail!(
                "candle {}@{} violates OHLC ordering (o={} h={} l={} c={})",
                self.instrument,
                self.open_time,
                self.open,
                self.high,
                self.low,
                self.close
            );
        }
        if self.volume < 0.0 {
            bail!("candle {}@{} has negative volume", self.instrument, self.open_time);
        }
        Ok(())
    }

    pub fn range(&self) -> f64 {
        self.high - self.low
    }

    pub fn body(&self) -> f64 {
        (self.close - self.open).abs()
    }

    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }
}

// ---------------------------------------------------------------------------
// Order flow
// ---------------------------------------------------------------------------

/// Rolling order-flow metrics derived from the futures MBP/trade stream.
/// One snapshot per instrument; overwritten on every window computation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderFlowMetrics {
    pub instrument: String,
    pub compute_time: DateTime<Utc>,
    pub ofi_60s: f64,
    pub volume_delta: f64,
    pub buy_volume: f64,
    pub sell_volume: f64,
    pub vwap: f64,
    pub sweep_flag: bool,
    pub vpin: f64,
}

// ---------------------------------------------------------------------------
// TA aggregate snapshot
// ---------------------------------------------------------------------------

/// Directional consensus of the external indicator aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Consensus {
    Bullish,
    Bearish,
    Neutral,
}

impl std::fmt::Display for Consensus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bullish => write!(f, "bullish"),
            Self::Bearish => write!(f, "bearish"),
            Self::Neutral => write!(f, "neutral"),
        }
    }
}

/// Aggregate technical-indicator snapshot from the external API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaSnapshot {
    pub instrument: String,
    pub compute_time: DateTime<Utc>,
    pub buy_count: u32,
    pub sell_count: u32,
    pub neutral_count: u32,
    pub consensus: Consensus,
    /// Confidence in [0, 1].
    pub confidence: f64,
}

impl TaSnapshot {
    /// Derive consensus and confidence from raw indicator counts.
    pub fn from_counts(
        instrument: impl Into<String>,
        compute_time: DateTime<Utc>,
        buy_count: u32,
        sell_count: u32,
        neutral_count: u32,
    ) -> Self {
        let total = (buy_count + sell_count + neutral_count).max(1) as f64;
        let (consensus, dominant) = if buy_count > sell_count && buy_count > neutral_count {
            (Consensus::Bullish, buy_count)
        } else if sell_count > buy_count && sell_count > neutral_count {
            (Consensus::Bearish, sell_count)
        } else {
            (Consensus::Neutral, neutral_count.max(buy_count).max(sell_count))
        };

        Self {
            instrument: instrument.into(),
            compute_time,
            buy_count,
            sell_count,
            neutral_count,
            consensus,
            confidence: (dominant as f64 / total).clamp(0.0, 1.0),
        }
    }
}

// ---------------------------------------------------------------------------
// Economic calendar / gating
// ---------------------------------------------------------------------------

/// Scheduled-event importance from the calendar provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Importance {
    Low,
    Medium,
    High,
}

/// A scheduled macro event from the news calendar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EconomicEvent {
    pub event_id: String,
    pub scheduled_time: DateTime<Utc>,
    pub country: String,
    pub currency: String,
    pub importance: Importance,
    pub event_name: String,
}

/// Lifecycle state of a news gating window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateState {
    Scheduled,
    Active,
    Cleared,
}

impl std::fmt::Display for GateState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Scheduled => write!(f, "scheduled"),
            Self::Active => write!(f, "active"),
            Self::Cleared => write!(f, "cleared"),
        }
    }
}

/// A trading blackout window derived from a high-impact event whose currency
/// matches the instrument's base or quote.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatingWindow {
    pub instrument: String,
    pub state: GateState,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    /// Open positions must be flat by this time (before the event fires).
    pub close_positions_at: DateTime<Utc>,
    pub reason: String,
    pub linked_event_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Decision pipeline outcomes
// ---------------------------------------------------------------------------

/// Discrete processing bucket chosen by the tiering step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    AutoApprove,
    LlmValidate,
    Reject,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AutoApprove => "auto_approve",
            Self::LlmValidate => "llm_validate",
            Self::Reject => "reject",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Audit record emitted by every engine cycle: either an approved, sized
/// order proposal or a structured rejection. Persisted unconditionally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub instrument: String,
    pub cycle_id: String,
    pub generated_at: DateTime<Utc>,
    pub direction: Option<Direction>,
    pub entry_price: Option<f64>,
    pub tp: Option<f64>,
    pub sl: Option<f64>,
    pub size_lots: f64,
    pub confidence: f64,
    pub pattern: Option<String>,
    pub pattern_score: Option<f64>,
    pub tier: Tier,
    /// "ok" for approvals, otherwise a structured rejection code.
    pub reason: String,
    /// Full serialized agent debate for after-the-fact audit.
    pub agent_trace: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Trades
// ---------------------------------------------------------------------------

/// Why a position was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseReason {
    TpHit,
    SlHit,
    MaxDuration,
    NewsGate,
    Manual,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TpHit => "TP_HIT",
            Self::SlHit => "SL_HIT",
            Self::MaxDuration => "MAX_DURATION",
            Self::NewsGate => "NEWS_GATE",
            Self::Manual => "MANUAL",
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An open position. Exactly one per instrument at any time; mutated only by
/// the trade lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveTrade {
    /// Stable UUID carried through order submission so broker-side retries
    /// stay idempotent.
    pub trade_id: String,
    pub instrument: String,
    pub direction: Direction,
    pub size_lots: f64,
    pub entry_time: DateTime<Utc>,
    pub entry_price: f64,
    pub tp: f64,
    pub sl: f64,
    pub duration_cap_secs: i64,
    /// Broker deal reference once the order is confirmed.
    pub deal_ref: Option<String>,
}

impl ActiveTrade {
    /// Check the long/short TP-SL ordering invariant.
    pub fn validate(&self) -> Result<()> {
        let ok = match self.direction {
            Direction::Long => self.sl < self.entry_price && self.entry_price < self.tp,
            Direction::Short => self.tp < self.entry_price && self.entry_price < self.sl,
        };
        if !ok {
            bail!(
                "trade {} violates tp/sl ordering ({} entry={} tp={} sl={})",
                self.trade_id,
                self.direction,
                self.entry_price,
                self.tp,
                self.sl
            );
        }
        Ok(())
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.entry_time + chrono::Duration::seconds(self.duration_cap_secs)
    }
}

/// Terminal record of a finished trade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub trade_id: String,
    pub instrument: String,
    pub direction: Direction,
    pub size_lots: f64,
    pub entry_time: DateTime<Utc>,
    pub entry_price: f64,
    pub tp: f64,
    pub sl: f64,
    pub exit_time: DateTime<Utc>,
    pub exit_price: f64,
    pub pnl_pips: f64,
    pub pnl_cash: f64,
    pub exit_reason: CloseReason,
}

/// Whether the engine is actively trading or paused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradingMode {
    Live,
    Paused,
}

impl Default for TradingMode {
    fn default() -> Self {
        Self::Paused
    }
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "Live"),
            Self::Paused => write!(f, "Paused"),
        }
    }
}

/// Whether orders route to the simulation broker or the real one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountMode {
    Demo,
    Live,
}

impl Default for AccountMode {
    fn default() -> Self {
        Self::Demo
    }
}

impl std::fmt::Display for AccountMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Demo => write!(f, "Demo"),
            Self::Live => write!(f, "Live"),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn instrument_parse_majors() {
        let eur = Instrument::parse("EUR_USD").unwrap();
        assert_eq!(eur.base, "EUR");
        assert_eq!(eur.quote, "USD");
        assert!((eur.pip_size - 0.0001).abs() < f64::EPSILON);
        assert!((eur.decimal_places_factor - 100_000.0).abs() < f64::EPSILON);

        let jpy = Instrument::parse("USD_JPY").unwrap();
        assert!((jpy.pip_size - 0.01).abs() < f64::EPSILON);
        assert!((jpy.decimal_places_factor - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn instrument_parse_rejects_garbage() {
        assert!(Instrument::parse("EURUSD").is_err());
        assert!(Instrument::parse("EU_USD").is_err());
    }

    #[test]
    fn pip_conversion_round_trip() {
        for id in ["EUR_USD", "USD_JPY", "GBP_USD", "EUR_JPY"] {
            let inst = Instrument::parse(id).unwrap();
            for pips in [0.1, 0.9, 6.0, 10.0, 123.4] {
                let back = inst.to_pips(inst.from_pips(pips));
                assert!(
                    (back - pips).abs() < 1e-9,
                    "{id}: {pips} -> {back} round trip drifted"
                );
            }
        }
    }

    #[test]
    fn tick_mid_and_spread() {
        let inst = Instrument::parse("EUR_USD").unwrap();
        let t = Tick::new("EUR_USD", Utc::now(), 1.08341, 1.08350);
        assert!((t.mid - 1.083455).abs() < 1e-9);
        assert!((t.spread_pips(&inst) - 0.9).abs() < 1e-6);
    }

    #[test]
    fn candle_aggregation_from_ticks() {
        let open_time = Utc.with_ymd_and_hms(2025, 3, 3, 10, 0, 0).unwrap();
        let mut c = Candle::from_mid("EUR_USD", "1m", open_time, 1.0850);
        for mid in [1.0853, 1.0851, 1.0852, 1.0849] {
            c.apply_mid(mid);
        }
        assert!((c.open - 1.0850).abs() < 1e-9);
        assert!((c.high - 1.0853).abs() < 1e-9);
        assert!((c.low - 1.0849).abs() < 1e-9);
        assert!((c.close - 1.0852).abs() < 1e-9);
        assert!((c.volume - 5.0).abs() < f64::EPSILON);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn candle_validate_rejects_bad_ohlc() {
        let open_time = Utc.with_ymd_and_hms(2025, 3, 3, 10, 0, 0).unwrap();
        let mut c = Candle::from_mid("EUR_USD", "1m", open_time, 1.0);
        c.high = 0.5; // below open
        assert!(c.validate().is_err());

        let mut c2 = Candle::from_mid("EUR_USD", "1m", open_time, 1.0);
        c2.volume = -1.0;
        assert!(c2.validate().is_err());
    }

    #[test]
    fn trade_tp_sl_ordering() {
        let base = ActiveTrade {
            trade_id: "t1".into(),
            instrument: "EUR_USD".into(),
            direction: Direction::Long,
            size_lots: 0.1,
            entry_time: Utc::now(),
            entry_price: 1.0850,
            tp: 1.0860,
            sl: 1.0844,
            duration_cap_secs: 1200,
            deal_ref: None,
        };
        assert!(base.validate().is_ok());

        let mut inverted = base.clone();
        inverted.direction = Direction::Short;
        assert!(inverted.validate().is_err());

        let short = ActiveTrade {
            direction: Direction::Short,
            tp: 1.0840,
            sl: 1.0856,
            ..base
        };
        assert!(short.validate().is_ok());
    }

    #[test]
    fn ta_snapshot_consensus_from_counts() {
        let now = Utc::now();
        let bull = TaSnapshot::from_counts("EUR_USD", now, 14, 3, 5);
        assert_eq!(bull.consensus, Consensus::Bullish);
        assert!(bull.confidence > 0.5);

        let bear = TaSnapshot::from_counts("EUR_USD", now, 2, 15, 5);
        assert_eq!(bear.consensus, Consensus::Bearish);

        let flat = TaSnapshot::from_counts("EUR_USD", now, 5, 5, 5);
        assert_eq!(flat.consensus, Consensus::Neutral);
    }

    #[test]
    fn direction_parse_and_sign() {
        assert_eq!("BUY".parse::<Direction>().unwrap(), Direction::Long);
        assert_eq!("short".parse::<Direction>().unwrap(), Direction::Short);
        assert!((Direction::Long.sign() - 1.0).abs() < f64::EPSILON);
        assert!((Direction::Short.sign() + 1.0).abs() < f64::EPSILON);
    }
}
