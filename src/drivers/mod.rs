// =============================================================================
// External driver seams — broker, streams, TA aggregator, calendar, LLM
// =============================================================================
//
// Production protocol clients live behind these traits. The engine only ever
// talks to the traits, so every external collaborator can be swapped for a
// fake in tests and for the simulation broker in demo mode.
// =============================================================================

pub mod http;
pub mod llm;
pub mod sim;
pub mod ws_feed;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::types::{Candle, Direction, EconomicEvent, TaSnapshot, Tick};

// ---------------------------------------------------------------------------
// Feed events and errors
// ---------------------------------------------------------------------------

/// Why a feed run ended. `AuthExpired` triggers a session refresh before the
/// next reconnect attempt; everything else is a plain transient failure.
#[derive(Debug)]
pub enum FeedError {
    AuthExpired,
    Stream(anyhow::Error),
}

impl std::fmt::Display for FeedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AuthExpired => write!(f, "session token expired"),
            Self::Stream(e) => write!(f, "stream error: {e}"),
        }
    }
}

impl std::error::Error for FeedError {}

impl From<anyhow::Error> for FeedError {
    fn from(e: anyhow::Error) -> Self {
        Self::Stream(e)
    }
}

/// One message from the futures market-by-price stream, already mapped to
/// futures symbol space (the ingestor maps it back to the spot instrument).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowEvent {
    pub futures_symbol: String,
    pub event_time: DateTime<Utc>,
    pub kind: FlowEventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowEventKind {
    /// Aggressor trade. `levels_consumed` counts how many book levels the
    /// fill walked through (sweep detection input).
    Trade {
        price: f64,
        size: f64,
        buy_aggressor: bool,
        levels_consumed: usize,
    },
    /// Best-level book update.
    Book {
        bid: f64,
        ask: f64,
        bid_size: f64,
        ask_size: f64,
    },
}

/// Spot tick stream. `run` pushes ticks into `sink` until the connection
/// drops; the ingestor owns reconnect/backoff policy.
#[async_trait]
pub trait TickFeed: Send + Sync {
    async fn run(
        &self,
        instruments: &[String],
        sink: mpsc::Sender<Tick>,
    ) -> std::result::Result<(), FeedError>;
}

/// Futures MBP/trade stream, same contract as [`TickFeed`].
#[async_trait]
pub trait OrderFlowFeed: Send + Sync {
    async fn run(
        &self,
        futures_symbols: &[String],
        sink: mpsc::Sender<FlowEvent>,
    ) -> std::result::Result<(), FeedError>;
}

// ---------------------------------------------------------------------------
// Broker
// ---------------------------------------------------------------------------

/// A market order ready for submission. The trade id is stable across
/// retries so the broker can de-duplicate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub trade_id: String,
    pub instrument: String,
    pub direction: Direction,
    pub size_lots: f64,
    pub entry_price: f64,
    pub sl_distance_pips: f64,
    pub tp_distance_pips: f64,
}

/// Broker-side reference of a filled deal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DealRef(pub String);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub deal_ref: String,
    pub instrument: String,
    pub direction: Direction,
    pub size_lots: f64,
    pub entry_price: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseConfirmation {
    pub deal_ref: String,
    pub close_price: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub balance: f64,
    pub equity: f64,
    pub margin_available: f64,
    pub currency: String,
}

/// Order submission failure, classified so the engine knows whether to
/// retry, abort, or refresh the session.
#[derive(Debug)]
pub enum OrderError {
    /// Transient failure (network, throttling). One bounded retry is safe
    /// because the trade id de-duplicates.
    Retryable(String),
    /// Terminal broker-side rejection.
    Rejected(String),
    /// Session invalid; refresh and retry once.
    AuthExpired,
}

impl std::fmt::Display for OrderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Retryable(msg) => write!(f, "retryable order failure: {msg}"),
            Self::Rejected(msg) => write!(f, "order rejected by broker: {msg}"),
            Self::AuthExpired => write!(f, "broker session expired"),
        }
    }
}

impl std::error::Error for OrderError {}

/// REST-side broker surface consumed by the engine and trade lifecycle.
#[async_trait]
pub trait BrokerDriver: Send + Sync {
    async fn open_session(&self) -> Result<()>;
    async fn refresh_session_if_expired(&self) -> Result<()>;
    /// Bootstrap/fallback candle fetch only — steady state comes from the
    /// tick stream.
    async fn fetch_candles(
        &self,
        instrument: &str,
        timeframe: &str,
        count: usize,
    ) -> Result<Vec<Candle>>;
    async fn fetch_open_positions(&self) -> Result<Vec<BrokerPosition>>;
    async fn place_market_order(
        &self,
        request: &OrderRequest,
    ) -> std::result::Result<DealRef, OrderError>;
    async fn close_position(&self, deal_ref: &str) -> Result<CloseConfirmation>;
    async fn account_snapshot(&self) -> Result<AccountSnapshot>;
}

// ---------------------------------------------------------------------------
// TA aggregator, calendar, LLM
// ---------------------------------------------------------------------------

/// External technical-indicator consensus API.
#[async_trait]
pub trait TaProvider: Send + Sync {
    async fn fetch_aggregate_indicators(&self, instrument: &str) -> Result<TaSnapshot>;
}

/// Economic calendar API.
#[async_trait]
pub trait CalendarProvider: Send + Sync {
    async fn fetch_calendar(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<EconomicEvent>>;
}

/// One chat message for the LLM driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }
}

/// LLM completion driver. Implementations enforce their own per-call timeout
/// and transport retries; callers handle JSON repair.
#[async_trait]
pub trait LlmDriver: Send + Sync {
    async fn complete(&self, messages: &[ChatMessage], max_tokens: u32) -> Result<String>;
}
