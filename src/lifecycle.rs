// =============================================================================
// Trade Lifecycle — one position per instrument, hard caps, timed exits
// =============================================================================
//
// Creation path enforces, in order: position-count cap, risk breakers and the
// daily trade cap, the one-trade-per-instrument rule, the news gate, the
// optional currency-exposure filter, and an account margin sanity check.
//
// The monitor loop runs every 30 seconds over open trades and closes on the
// first of: TP hit, SL hit, duration cap (20 minutes by default), or a news
// gate whose close-positions deadline has passed. Longs price against the
// bid, shorts against the ask.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::config::LifecycleParams;
use crate::drivers::{AccountSnapshot, BrokerDriver};
use crate::hub::MarketDataHub;
use crate::news::NewsGater;
use crate::risk::RiskEngine;
use crate::status::{StatusRegistry, TaskState};
use crate::store::Store;
use crate::types::{ActiveTrade, CloseReason, ClosedTrade, Direction, Instrument};

const TASK_NAME: &str = "trade_monitor";
/// Units per standard lot for cash PnL.
const UNITS_PER_LOT: f64 = 100_000.0;
/// Closed-trade ring kept in memory for the control surface.
const MAX_CLOSED_RETAINED: usize = 200;

/// Why a new position was refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpenError {
    PositionCapReached(String),
    RiskBlocked(String),
    DuplicatePosition(String),
    NewsGated(String),
    ExposureOverlap(String),
    MarginUnavailable(String),
    InvalidLevels(String),
}

impl std::fmt::Display for OpenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PositionCapReached(m) => write!(f, "position cap reached: {m}"),
            Self::RiskBlocked(m) => write!(f, "risk engine blocked: {m}"),
            Self::DuplicatePosition(m) => write!(f, "duplicate position: {m}"),
            Self::NewsGated(m) => write!(f, "news gated: {m}"),
            Self::ExposureOverlap(m) => write!(f, "currency exposure overlap: {m}"),
            Self::MarginUnavailable(m) => write!(f, "margin unavailable: {m}"),
            Self::InvalidLevels(m) => write!(f, "invalid levels: {m}"),
        }
    }
}

impl std::error::Error for OpenError {}

/// Everything needed to open a position. The trade id comes from the cycle
/// so broker retries stay idempotent.
#[derive(Debug, Clone)]
pub struct OpenRequest {
    pub trade_id: String,
    pub instrument: String,
    pub direction: Direction,
    pub size_lots: f64,
    pub entry_price: f64,
    pub tp: f64,
    pub sl: f64,
}

/// A pending exit decision from one monitor pass.
#[derive(Debug, Clone)]
pub struct ExitDecision {
    pub trade: ActiveTrade,
    pub exit_price: f64,
    pub reason: CloseReason,
}

pub struct TradeLifecycle {
    params: LifecycleParams,
    instruments: HashMap<String, Instrument>,
    risk: Arc<RiskEngine>,
    trades: RwLock<HashMap<String, ActiveTrade>>,
    closed: RwLock<Vec<ClosedTrade>>,
}

impl TradeLifecycle {
    pub fn new(
        params: LifecycleParams,
        instruments: HashMap<String, Instrument>,
        risk: Arc<RiskEngine>,
    ) -> Self {
        Self {
            params,
            instruments,
            risk,
            trades: RwLock::new(HashMap::new()),
            closed: RwLock::new(Vec::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Creation path
    // -------------------------------------------------------------------------

    /// Enforce all pre-open limits and register the trade. The broker order
    /// is submitted by the caller afterwards; on terminal submission failure
    /// call [`abort`] to roll back.
    pub fn open(
        &self,
        request: OpenRequest,
        now: DateTime<Utc>,
        news: &NewsGater,
        account: Option<&AccountSnapshot>,
    ) -> Result<ActiveTrade, OpenError> {
        let mut trades = self.trades.write();

        if trades.len() >= self.params.max_open_positions {
            return Err(OpenError::PositionCapReached(format!(
                "{} of {}",
                trades.len(),
                self.params.max_open_positions
            )));
        }

        let (allowed, reason) = self.risk.can_open(now);
        if !allowed {
            return Err(OpenError::RiskBlocked(
                reason.unwrap_or_else(|| "unspecified".into()),
            ));
        }

        if trades.contains_key(&request.instrument) {
            return Err(OpenError::DuplicatePosition(request.instrument.clone()));
        }

        if let Some(window) = news.is_gated(&request.instrument, now) {
            return Err(OpenError::NewsGated(window.reason));
        }

        if self.params.currency_exposure_filter {
            if let Some(new_inst) = self.instruments.get(&request.instrument) {
                let overlap = trades.keys().find(|open_id| {
                    self.instruments.get(*open_id).is_some_and(|open_inst| {
                        open_inst.involves(&new_inst.base) || open_inst.involves(&new_inst.quote)
                    })
                });
                if let Some(conflicting) = overlap {
                    return Err(OpenError::ExposureOverlap(format!(
                        "{} shares a currency with open {}",
                        request.instrument, conflicting
                    )));
                }
            }
        }

        if let Some(snapshot) = account {
            if snapshot.margin_available <= 0.0 || snapshot.equity <= 0.0 {
                return Err(OpenError::MarginUnavailable(format!(
                    "equity {:.2}, margin {:.2}",
                    snapshot.equity, snapshot.margin_available
                )));
            }
        }

        let trade = ActiveTrade {
            trade_id: request.trade_id,
            instrument: request.instrument.clone(),
            direction: request.direction,
            size_lots: request.size_lots,
            entry_time: now,
            entry_price: request.entry_price,
            tp: request.tp,
            sl: request.sl,
            duration_cap_secs: self.params.duration_cap_secs,
            deal_ref: None,
        };
        trade
            .validate()
            .map_err(|e| OpenError::InvalidLevels(e.to_string()))?;

        info!(
            trade_id = %trade.trade_id,
            instrument = %trade.instrument,
            direction = %trade.direction,
            size_lots = trade.size_lots,
            entry = trade.entry_price,
            tp = trade.tp,
            sl = trade.sl,
            "position opened"
        );

        trades.insert(request.instrument, trade.clone());
        Ok(trade)
    }

    /// Attach the broker deal reference after a confirmed fill.
    pub fn attach_deal(&self, instrument: &str, deal_ref: String) {
        if let Some(trade) = self.trades.write().get_mut(instrument) {
            trade.deal_ref = Some(deal_ref);
        }
    }

    /// Remove a just-opened trade whose broker submission failed terminally.
    /// No closed record is produced.
    pub fn abort(&self, instrument: &str, trade_id: &str) {
        let mut trades = self.trades.write();
        if trades
            .get(instrument)
            .is_some_and(|t| t.trade_id == trade_id)
        {
            warn!(instrument, trade_id, "aborting unconfirmed position");
            trades.remove(instrument);
        }
    }

    // -------------------------------------------------------------------------
    // Exit path
    // -------------------------------------------------------------------------

    /// Evaluate all open trades against the latest hub ticks. Pure decision
    /// pass; the caller applies the closes.
    pub fn check_exits(
        &self,
        hub: &MarketDataHub,
        news: &NewsGater,
        now: DateTime<Utc>,
    ) -> Vec<ExitDecision> {
        let trades = self.trades.read();
        let mut decisions = Vec::new();

        for trade in trades.values() {
            let Some(tick) = hub.get_latest_tick(&trade.instrument) else {
                debug!(instrument = %trade.instrument, "no tick for open trade — skipping exit check");
                continue;
            };
            let exit_price = match trade.direction {
                Direction::Long => tick.bid,
                Direction::Short => tick.ask,
            };

            let reason = if matches!(trade.direction, Direction::Long) && tick.bid >= trade.tp {
                Some(CloseReason::TpHit)
            } else if matches!(trade.direction, Direction::Long) && tick.bid <= trade.sl {
                Some(CloseReason::SlHit)
            } else if matches!(trade.direction, Direction::Short) && tick.ask <= trade.tp {
                Some(CloseReason::TpHit)
            } else if matches!(trade.direction, Direction::Short) && tick.ask >= trade.sl {
                Some(CloseReason::SlHit)
            } else if now >= trade.expires_at() {
                Some(CloseReason::MaxDuration)
            } else if news.must_close(&trade.instrument, now).is_some() {
                Some(CloseReason::NewsGate)
            } else {
                None
            };

            if let Some(reason) = reason {
                decisions.push(ExitDecision {
                    trade: trade.clone(),
                    exit_price,
                    reason,
                });
            }
        }

        decisions
    }

    /// Close an open trade, realize PnL, and feed the risk engine. Returns
    /// `None` when no trade (or a different trade) is open for the
    /// instrument.
    pub fn close(
        &self,
        instrument: &str,
        trade_id: &str,
        exit_price: f64,
        reason: CloseReason,
        now: DateTime<Utc>,
    ) -> Option<ClosedTrade> {
        let trade = {
            let mut trades = self.trades.write();
            match trades.get(instrument) {
                Some(t) if t.trade_id == trade_id => trades.remove(instrument)?,
                _ => return None,
            }
        };

        let pip_size = self
            .instruments
            .get(instrument)
            .map(|i| i.pip_size)
            .unwrap_or(0.0001);

        let signed_move = trade.direction.sign() * (exit_price - trade.entry_price);
        let pnl_pips = signed_move / pip_size;
        let pnl_cash = signed_move * trade.size_lots * UNITS_PER_LOT;

        let closed = ClosedTrade {
            trade_id: trade.trade_id.clone(),
            instrument: trade.instrument.clone(),
            direction: trade.direction,
            size_lots: trade.size_lots,
            entry_time: trade.entry_time,
            entry_price: trade.entry_price,
            tp: trade.tp,
            sl: trade.sl,
            exit_time: now,
            exit_price,
            pnl_pips,
            pnl_cash,
            exit_reason: reason,
        };

        info!(
            trade_id = %closed.trade_id,
            instrument = %closed.instrument,
            reason = %reason,
            pnl_pips = format!("{pnl_pips:.1}"),
            pnl_cash = format!("{pnl_cash:.2}"),
            "position closed"
        );

        self.risk.record_trade_result(pnl_cash, now);

        let mut ring = self.closed.write();
        ring.push(closed.clone());
        while ring.len() > MAX_CLOSED_RETAINED {
            ring.remove(0);
        }

        Some(closed)
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn open_trades(&self) -> Vec<ActiveTrade> {
        self.trades.read().values().cloned().collect()
    }

    pub fn open_count(&self) -> usize {
        self.trades.read().len()
    }

    pub fn trade_for(&self, instrument: &str) -> Option<ActiveTrade> {
        self.trades.read().get(instrument).cloned()
    }

    pub fn recent_closed(&self, count: usize) -> Vec<ClosedTrade> {
        let ring = self.closed.read();
        ring.iter().rev().take(count).cloned().collect()
    }
}

// -------------------------------------------------------------------------
// Monitor loop
// -------------------------------------------------------------------------

/// Run the exit monitor until shutdown. Each pass applies the decisions from
/// [`TradeLifecycle::check_exits`]: broker close first (when a deal ref is
/// attached), then local close + persistence.
pub async fn run_trade_monitor(
    lifecycle: Arc<TradeLifecycle>,
    hub: Arc<MarketDataHub>,
    news: Arc<NewsGater>,
    broker: Arc<dyn BrokerDriver>,
    store: Arc<Store>,
    status: Arc<StatusRegistry>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(
        interval_secs = lifecycle.params.monitor_interval_secs,
        "trade monitor started"
    );
    status.set_state(TASK_NAME, TaskState::Running);

    let mut ticker = interval(std::time::Duration::from_secs(
        lifecycle.params.monitor_interval_secs,
    ));

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                let now = Utc::now();
                for decision in lifecycle.check_exits(&hub, &news, now) {
                    apply_exit(&lifecycle, broker.as_ref(), &store, &status, decision, now).await;
                }
                status.record_event(TASK_NAME);
                status.set_backlog(TASK_NAME, lifecycle.open_count() as u64);
            }
        }
    }

    status.set_state(TASK_NAME, TaskState::Stopped);
    info!("trade monitor stopped");
}

async fn apply_exit(
    lifecycle: &TradeLifecycle,
    broker: &dyn BrokerDriver,
    store: &Store,
    status: &StatusRegistry,
    decision: ExitDecision,
    now: DateTime<Utc>,
) {
    let ExitDecision {
        trade,
        mut exit_price,
        reason,
    } = decision;

    if let Some(deal_ref) = &trade.deal_ref {
        match broker.close_position(deal_ref).await {
            Ok(confirmation) => {
                if let Some(price) = confirmation.close_price {
                    exit_price = price;
                }
            }
            Err(e) => {
                // Keep the local book consistent with the broker: retry on
                // the next monitor pass rather than closing blind.
                error!(
                    trade_id = %trade.trade_id,
                    error = %e,
                    "broker close failed — will retry next pass"
                );
                status.record_error(TASK_NAME);
                return;
            }
        }
    }

    if let Some(closed) =
        lifecycle.close(&trade.instrument, &trade.trade_id, exit_price, reason, now)
    {
        if let Err(e) = store.insert_closed_trade(&closed) {
            error!(trade_id = %closed.trade_id, error = %e, "failed to persist closed trade");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HubParams, NewsParams};
    use crate::types::{EconomicEvent, Importance, Tick};
    use chrono::{Duration, TimeZone};

    fn instruments() -> HashMap<String, Instrument> {
        ["EUR_USD", "GBP_USD", "USD_JPY"]
            .iter()
            .map(|id| (id.to_string(), Instrument::parse(id).unwrap()))
            .collect()
    }

    fn risk() -> Arc<RiskEngine> {
        Arc::new(RiskEngine::new(1000.0, 0.03, 5, 40, Duration::minutes(30)))
    }

    fn lifecycle() -> TradeLifecycle {
        TradeLifecycle::new(LifecycleParams::default(), instruments(), risk())
    }

    fn empty_news() -> NewsGater {
        NewsGater::new(
            NewsParams::default(),
            instruments().into_values().collect(),
        )
    }

    fn long_request(instrument: &str, trade_id: &str) -> OpenRequest {
        OpenRequest {
            trade_id: trade_id.into(),
            instrument: instrument.into(),
            direction: Direction::Long,
            size_lots: 0.1,
            entry_price: 1.0850,
            tp: 1.0860,
            sl: 1.0844,
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 3, 8, 0, 0).unwrap()
    }

    #[test]
    fn one_position_per_instrument() {
        let lc = lifecycle();
        let news = empty_news();
        lc.open(long_request("EUR_USD", "t-1"), t0(), &news, None)
            .unwrap();

        let err = lc
            .open(long_request("EUR_USD", "t-2"), t0(), &news, None)
            .unwrap_err();
        assert!(matches!(err, OpenError::DuplicatePosition(_)));
        assert_eq!(lc.open_count(), 1);
    }

    #[test]
    fn position_cap_enforced() {
        let lc = lifecycle(); // default cap = 2
        let news = empty_news();
        lc.open(long_request("EUR_USD", "t-1"), t0(), &news, None).unwrap();
        lc.open(long_request("GBP_USD", "t-2"), t0(), &news, None).unwrap();

        let err = lc
            .open(long_request("USD_JPY", "t-3"), t0(), &news, None)
            .unwrap_err();
        assert!(matches!(err, OpenError::PositionCapReached(_)));
    }

    #[test]
    fn news_gate_blocks_open() {
        let lc = lifecycle();
        let news = empty_news();
        let event_time = Utc.with_ymd_and_hms(2025, 3, 3, 8, 10, 0).unwrap();
        news.apply_events(&[EconomicEvent {
            event_id: "e1".into(),
            scheduled_time: event_time,
            country: "US".into(),
            currency: "USD".into(),
            importance: Importance::High,
            event_name: "CPI".into(),
        }]);
        news.transition(t0()); // 08:00 >= 07:55 window start -> active

        let err = lc
            .open(long_request("EUR_USD", "t-1"), t0(), &news, None)
            .unwrap_err();
        assert!(matches!(err, OpenError::NewsGated(_)));
    }

    #[test]
    fn margin_check_blocks_empty_account() {
        let lc = lifecycle();
        let news = empty_news();
        let broke = AccountSnapshot {
            balance: 0.0,
            equity: 0.0,
            margin_available: 0.0,
            currency: "USD".into(),
        };
        let err = lc
            .open(long_request("EUR_USD", "t-1"), t0(), &news, Some(&broke))
            .unwrap_err();
        assert!(matches!(err, OpenError::MarginUnavailable(_)));
    }

    #[test]
    fn exposure_filter_blocks_shared_currency_when_enabled() {
        let params = LifecycleParams {
            currency_exposure_filter: true,
            ..LifecycleParams::default()
        };
        let lc = TradeLifecycle::new(params, instruments(), risk());
        let news = empty_news();
        lc.open(long_request("EUR_USD", "t-1"), t0(), &news, None).unwrap();

        // GBP_USD shares USD with the open EUR_USD position.
        let err = lc
            .open(long_request("GBP_USD", "t-2"), t0(), &news, None)
            .unwrap_err();
        assert!(matches!(err, OpenError::ExposureOverlap(_)));
    }

    #[test]
    fn invalid_levels_rejected() {
        let lc = lifecycle();
        let news = empty_news();
        let mut bad = long_request("EUR_USD", "t-1");
        bad.sl = 1.0870; // sl above entry on a long
        let err = lc.open(bad, t0(), &news, None).unwrap_err();
        assert!(matches!(err, OpenError::InvalidLevels(_)));
        assert_eq!(lc.open_count(), 0);
    }

    #[test]
    fn close_realizes_pnl_and_records_risk() {
        let lc = lifecycle();
        let news = empty_news();
        lc.open(long_request("EUR_USD", "t-1"), t0(), &news, None).unwrap();

        let closed = lc
            .close("EUR_USD", "t-1", 1.0860, CloseReason::TpHit, t0() + Duration::minutes(5))
            .unwrap();
        assert!((closed.pnl_pips - 10.0).abs() < 1e-6);
        assert!((closed.pnl_cash - 100.0).abs() < 1e-6); // 10 pips * 0.1 lots
        assert_eq!(closed.exit_reason, CloseReason::TpHit);
        assert!(closed.exit_price >= closed.tp);
        assert_eq!(lc.open_count(), 0);
        assert_eq!(lc.recent_closed(10).len(), 1);

        let state = lc.risk.get_state(t0() + Duration::minutes(5));
        assert_eq!(state.daily_trades, 1);
        assert!((state.daily_pnl - 100.0).abs() < 1e-6);
    }

    #[test]
    fn close_with_wrong_trade_id_is_noop() {
        let lc = lifecycle();
        let news = empty_news();
        lc.open(long_request("EUR_USD", "t-1"), t0(), &news, None).unwrap();
        assert!(lc
            .close("EUR_USD", "other", 1.0860, CloseReason::Manual, t0())
            .is_none());
        assert_eq!(lc.open_count(), 1);
    }

    fn hub_with_tick(bid: f64, ask: f64, at: DateTime<Utc>) -> MarketDataHub {
        let hub = MarketDataHub::new(&HubParams::default());
        hub.update_tick(Tick::new("EUR_USD", at, bid, ask));
        hub
    }

    #[test]
    fn monitor_detects_tp_on_long_via_bid() {
        let lc = lifecycle();
        let news = empty_news();
        lc.open(long_request("EUR_USD", "t-1"), t0(), &news, None).unwrap();

        let now = t0() + Duration::minutes(2);
        let hub = hub_with_tick(1.0861, 1.0862, now);
        let decisions = lc.check_exits(&hub, &news, now);
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].reason, CloseReason::TpHit);
        assert!((decisions[0].exit_price - 1.0861).abs() < 1e-9);
    }

    #[test]
    fn monitor_detects_sl_on_long_via_bid() {
        let lc = lifecycle();
        let news = empty_news();
        lc.open(long_request("EUR_USD", "t-1"), t0(), &news, None).unwrap();

        let now = t0() + Duration::minutes(2);
        let hub = hub_with_tick(1.0843, 1.0845, now);
        let decisions = lc.check_exits(&hub, &news, now);
        assert_eq!(decisions[0].reason, CloseReason::SlHit);
    }

    #[test]
    fn monitor_enforces_duration_cap() {
        // Trade opened 08:00 with a 20-minute cap, price pinned inside
        // [sl, tp]. At 08:20 the monitor closes with MAX_DURATION.
        let lc = lifecycle();
        let news = empty_news();
        lc.open(long_request("EUR_USD", "t-1"), t0(), &news, None).unwrap();

        let before = t0() + Duration::minutes(19);
        let hub = hub_with_tick(1.0851, 1.0852, before);
        assert!(lc.check_exits(&hub, &news, before).is_empty());

        let at_cap = t0() + Duration::minutes(20);
        let hub = hub_with_tick(1.0851, 1.0852, at_cap);
        let decisions = lc.check_exits(&hub, &news, at_cap);
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].reason, CloseReason::MaxDuration);
        assert!((decisions[0].exit_price - 1.0851).abs() < 1e-9);
    }

    #[test]
    fn monitor_force_closes_on_news_deadline() {
        // 13:30 USD event. Long opened 13:10; at 13:20 the close deadline
        // passes and the position is flattened regardless of PnL.
        let lc = lifecycle();
        let news = empty_news();
        let event_time = Utc.with_ymd_and_hms(2025, 3, 3, 13, 30, 0).unwrap();
        news.apply_events(&[EconomicEvent {
            event_id: "e1".into(),
            scheduled_time: event_time,
            country: "US".into(),
            currency: "USD".into(),
            importance: Importance::High,
            event_name: "FOMC".into(),
        }]);

        let opened_at = Utc.with_ymd_and_hms(2025, 3, 3, 13, 10, 0).unwrap();
        lc.open(long_request("EUR_USD", "t-1"), opened_at, &news, None).unwrap();

        // 13:15: window activates but the deadline (13:20) has not passed.
        let at_13_15 = event_time - Duration::minutes(15);
        news.transition(at_13_15);
        let hub = hub_with_tick(1.0851, 1.0852, at_13_15);
        assert!(lc.check_exits(&hub, &news, at_13_15).is_empty());

        let at_13_20 = event_time - Duration::minutes(10);
        let hub = hub_with_tick(1.0846, 1.0847, at_13_20); // losing, still closes
        let decisions = lc.check_exits(&hub, &news, at_13_20);
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].reason, CloseReason::NewsGate);
    }

    #[tokio::test]
    async fn apply_exit_persists_and_clears() {
        let lc = Arc::new(lifecycle());
        let news = empty_news();
        lc.open(long_request("EUR_USD", "t-1"), t0(), &news, None).unwrap();

        let store = Store::open_in_memory().unwrap();
        let broker = crate::drivers::sim::SimBroker::new(1000.0);
        let status = StatusRegistry::new();

        let decision = ExitDecision {
            trade: lc.trade_for("EUR_USD").unwrap(),
            exit_price: 1.0860,
            reason: CloseReason::TpHit,
        };
        apply_exit(&lc, &broker, &store, &status, decision, t0()).await;

        assert_eq!(lc.open_count(), 0);
        assert_eq!(store.count_rows("closed_trades").unwrap(), 1);
    }
}
