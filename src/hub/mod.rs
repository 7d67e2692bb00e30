// =============================================================================
// MarketDataHub — the only consumer-facing view of current market state
// =============================================================================
//
// Producers (tick/order-flow ingestors, TA poller) write; the engine reads.
// One RwLock guards the four maps; reads dominate by a wide margin. Each
// category carries its own freshness TTL and the staleness check is the
// engine's authority for "is this data usable".
//
// Candle windows are bounded deques, strictly increasing in open_time. Only
// finalized candles enter the window; the current forming candle sits in a
// separate slot so readers never see a half-built bar inside the window.
// =============================================================================

pub mod remote;

use std::collections::HashMap;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::HubParams;
use crate::types::{Candle, CandleKey, OrderFlowMetrics, TaSnapshot, Tick};

/// Hard ceiling on the candle window regardless of configuration.
const MAX_CANDLE_WINDOW: usize = 200;

/// Per-category freshness flags for one instrument.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StalenessReport {
    pub tick_stale: bool,
    pub candle_stale: bool,
    pub order_flow_stale: bool,
    pub ta_stale: bool,
}

struct CandleWindow {
    window: std::collections::VecDeque<Candle>,
    forming: Option<Candle>,
}

impl CandleWindow {
    fn new(capacity: usize) -> Self {
        Self {
            window: std::collections::VecDeque::with_capacity(capacity + 1),
            forming: None,
        }
    }
}

struct HubInner {
    ticks: HashMap<String, Tick>,
    candles: HashMap<CandleKey, CandleWindow>,
    order_flow: HashMap<String, OrderFlowMetrics>,
    ta: HashMap<String, TaSnapshot>,
}

/// Thread-safe in-memory market cache. Cheap to share via `Arc`.
pub struct MarketDataHub {
    inner: RwLock<HubInner>,
    max_candles: usize,
    tick_ttl: Duration,
    candle_ttl: Duration,
    order_flow_ttl: Duration,
    ta_ttl: Duration,
}

impl MarketDataHub {
    pub fn new(params: &HubParams) -> Self {
        Self {
            inner: RwLock::new(HubInner {
                ticks: HashMap::new(),
                candles: HashMap::new(),
                order_flow: HashMap::new(),
                ta: HashMap::new(),
            }),
            max_candles: params.max_candles.min(MAX_CANDLE_WINDOW),
            tick_ttl: Duration::seconds(params.tick_ttl_secs as i64),
            candle_ttl: Duration::seconds(params.candle_ttl_secs as i64),
            order_flow_ttl: Duration::seconds(params.order_flow_ttl_secs as i64),
            ta_ttl: Duration::seconds(params.ta_ttl_secs as i64),
        }
    }

    // -------------------------------------------------------------------------
    // Producer side
    // -------------------------------------------------------------------------

    /// Overwrite the latest tick for an instrument.
    pub fn update_tick(&self, tick: Tick) {
        self.inner.write().ticks.insert(tick.instrument.clone(), tick);
    }

    /// Insert a candle.
    ///
    /// * Finalized candles append to the window in strictly increasing
    ///   `open_time` order. Re-delivery of an already-present `open_time`
    ///   replaces that bar in place (idempotent); an older out-of-order bar
    ///   is dropped with a warning.
    /// * In-progress candles only ever occupy the forming slot.
    pub fn update_candle(&self, candle: Candle) {
        let key = CandleKey::new(candle.instrument.clone(), candle.timeframe.clone());
        let mut inner = self.inner.write();
        let entry = inner
            .candles
            .entry(key)
            .or_insert_with(|| CandleWindow::new(self.max_candles));

        if !candle.finalized {
            entry.forming = Some(candle);
            return;
        }

        // Clear the forming slot once its minute is finalized.
        if entry
            .forming
            .as_ref()
            .is_some_and(|f| f.open_time <= candle.open_time)
        {
            entry.forming = None;
        }

        match entry.window.back() {
            None => entry.window.push_back(candle),
            Some(last) if candle.open_time > last.open_time => {
                entry.window.push_back(candle);
            }
            Some(last) if candle.open_time == last.open_time => {
                *entry.window.back_mut().unwrap() = candle;
            }
            Some(_) => {
                // Replace in place when the bar exists; otherwise it arrived
                // too late to keep the window monotonic.
                if let Some(slot) = entry
                    .window
                    .iter_mut()
                    .find(|c| c.open_time == candle.open_time)
                {
                    *slot = candle;
                } else {
                    warn!(
                        instrument = %candle.instrument,
                        timeframe = %candle.timeframe,
                        open_time = %candle.open_time,
                        "out-of-order finalized candle dropped"
                    );
                }
            }
        }

        while entry.window.len() > self.max_candles {
            entry.window.pop_front();
        }
    }

    /// Overwrite the order-flow snapshot for an instrument.
    pub fn update_order_flow(&self, metrics: OrderFlowMetrics) {
        self.inner
            .write()
            .order_flow
            .insert(metrics.instrument.clone(), metrics);
    }

    /// Overwrite the TA snapshot for an instrument.
    pub fn update_ta(&self, snapshot: TaSnapshot) {
        self.inner.write().ta.insert(snapshot.instrument.clone(), snapshot);
    }

    // -------------------------------------------------------------------------
    // Consumer side
    // -------------------------------------------------------------------------

    pub fn get_latest_tick(&self, instrument: &str) -> Option<Tick> {
        self.inner.read().ticks.get(instrument).cloned()
    }

    /// Up to `limit` most-recent finalized candles, oldest first.
    pub fn get_latest_candles(&self, instrument: &str, timeframe: &str, limit: usize) -> Vec<Candle> {
        let inner = self.inner.read();
        let key = CandleKey::new(instrument, timeframe);
        match inner.candles.get(&key) {
            Some(entry) => {
                let start = entry.window.len().saturating_sub(limit);
                entry.window.iter().skip(start).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    /// The in-progress bar for the current minute, if any.
    pub fn get_forming_candle(&self, instrument: &str, timeframe: &str) -> Option<Candle> {
        let inner = self.inner.read();
        inner
            .candles
            .get(&CandleKey::new(instrument, timeframe))
            .and_then(|e| e.forming.clone())
    }

    pub fn get_latest_order_flow(&self, instrument: &str) -> Option<OrderFlowMetrics> {
        self.inner.read().order_flow.get(instrument).cloned()
    }

    pub fn get_latest_ta(&self, instrument: &str) -> Option<TaSnapshot> {
        self.inner.read().ta.get(instrument).cloned()
    }

    /// Per-category freshness for one instrument at `now`. A missing entry is
    /// stale by definition.
    pub fn check_staleness(&self, instrument: &str, now: DateTime<Utc>) -> StalenessReport {
        let inner = self.inner.read();

        let tick_stale = inner
            .ticks
            .get(instrument)
            .map_or(true, |t| now - t.event_time > self.tick_ttl);

        let candle_stale = inner
            .candles
            .get(&CandleKey::new(instrument, "1m"))
            .and_then(|e| e.window.back())
            .map_or(true, |c| now - c.open_time > self.candle_ttl);

        let order_flow_stale = inner
            .order_flow
            .get(instrument)
            .map_or(true, |m| now - m.compute_time > self.order_flow_ttl);

        let ta_stale = inner
            .ta
            .get(instrument)
            .map_or(true, |s| now - s.compute_time > self.ta_ttl);

        StalenessReport {
            tick_stale,
            candle_stale,
            order_flow_stale,
            ta_stale,
        }
    }

    // -------------------------------------------------------------------------
    // Warm start
    // -------------------------------------------------------------------------

    /// Synchronously populate each instrument's 1-minute window from the
    /// store before any consumer runs. `fetch` returns candles oldest first.
    pub fn warm_start<F>(&self, instruments: &[String], fetch: F, limit: usize) -> Result<()>
    where
        F: Fn(&str, &str, usize) -> Result<Vec<Candle>>,
    {
        for instrument in instruments {
            let candles = fetch(instrument, "1m", limit)?;
            let count = candles.len();
            for candle in candles {
                self.update_candle(candle);
            }
            if count == 0 {
                debug!(instrument = %instrument, "warm start found no stored candles");
            } else {
                info!(instrument = %instrument, candles = count, "hub warm-started");
            }
        }
        Ok(())
    }
}
