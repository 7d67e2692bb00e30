// =============================================================================
// Unified Data Fetcher — the one read path for decision cycles
// =============================================================================
//
// Assembles everything a cycle needs from the hub, with a store fallback for
// candles only. Pure reads; the warnings list tells the caller exactly which
// parts of the view are degraded instead of silently handing over stale data.
// =============================================================================

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::hub::MarketDataHub;
use crate::store::Store;
use crate::types::{Candle, Instrument, OrderFlowMetrics, TaSnapshot};

/// Candle count requested per view.
const CANDLE_LIMIT: usize = 100;
/// Below this many candles the view is flagged unusable for analysis.
const MIN_CANDLES: usize = 20;

pub const WARN_INSUFFICIENT_CANDLES: &str = "insufficient_candles";
pub const WARN_SPREAD_UNAVAILABLE: &str = "spread_unavailable";
pub const WARN_TA_STALE: &str = "ta_stale";
pub const WARN_OF_STALE: &str = "of_stale";

/// Ephemeral assembled market view. Built per request, never stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketView {
    pub candles: Vec<Candle>,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub spread_pips: Option<f64>,
    pub ta: Option<TaSnapshot>,
    pub order_flow: Option<OrderFlowMetrics>,
    pub warnings: Vec<String>,
}

impl MarketView {
    pub fn has_warning(&self, code: &str) -> bool {
        self.warnings.iter().any(|w| w == code)
    }
}

pub struct UnifiedDataFetcher {
    hub: Arc<MarketDataHub>,
    store: Arc<Store>,
}

impl UnifiedDataFetcher {
    pub fn new(hub: Arc<MarketDataHub>, store: Arc<Store>) -> Self {
        Self { hub, store }
    }

    /// Build the view for one instrument at `now`.
    pub fn fetch(&self, instrument: &Instrument, now: DateTime<Utc>) -> MarketView {
        let mut warnings = Vec::new();
        let staleness = self.hub.check_staleness(&instrument.id, now);

        // ── 1-2. Candles, store fallback when the hub window is thin ─────
        let mut candles = self
            .hub
            .get_latest_candles(&instrument.id, "1m", CANDLE_LIMIT);
        if candles.len() < MIN_CANDLES {
            match self
                .store
                .fetch_last_candles(&instrument.id, "1m", CANDLE_LIMIT)
            {
                Ok(stored) if stored.len() > candles.len() => {
                    debug!(
                        instrument = %instrument.id,
                        hub = candles.len(),
                        store = stored.len(),
                        "hub candle window thin — using store fallback"
                    );
                    candles = stored;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(instrument = %instrument.id, error = %e, "store candle fallback failed");
                }
            }
        }
        if candles.len() < MIN_CANDLES {
            warnings.push(WARN_INSUFFICIENT_CANDLES.to_string());
        }

        // ── 3. Spread from the latest fresh tick ─────────────────────────
        let tick = self.hub.get_latest_tick(&instrument.id);
        let (bid, ask, spread_pips) = match tick {
            Some(ref t) if !staleness.tick_stale => {
                (Some(t.bid), Some(t.ask), Some(t.spread_pips(instrument)))
            }
            _ => {
                warnings.push(WARN_SPREAD_UNAVAILABLE.to_string());
                (None, None, None)
            }
        };

        // ── 4. TA snapshot (included even when stale, but flagged) ───────
        let ta = self.hub.get_latest_ta(&instrument.id);
        if ta.is_some() && staleness.ta_stale {
            warnings.push(WARN_TA_STALE.to_string());
        }

        // ── 5. Order flow, same contract as TA ───────────────────────────
        let order_flow = self.hub.get_latest_order_flow(&instrument.id);
        if order_flow.is_some() && staleness.order_flow_stale {
            warnings.push(WARN_OF_STALE.to_string());
        }

        MarketView {
            candles,
            bid,
            ask,
            spread_pips,
            ta,
            order_flow,
            warnings,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HubParams;
    use crate::store::Row;
    use crate::types::{Consensus, Tick};
    use chrono::{Duration, TimeZone};

    fn fixture() -> (UnifiedDataFetcher, Arc<MarketDataHub>, Arc<Store>, Instrument) {
        let hub = Arc::new(MarketDataHub::new(&HubParams::default()));
        let store = Arc::new(Store::open_in_memory().unwrap());
        let fetcher = UnifiedDataFetcher::new(hub.clone(), store.clone());
        (fetcher, hub, store, Instrument::parse("EUR_USD").unwrap())
    }

    fn minute_candle(minute: u32, close: f64) -> Candle {
        Candle {
            instrument: "EUR_USD".into(),
            timeframe: "1m".into(),
            open_time: Utc.with_ymd_and_hms(2025, 3, 3, 9, minute, 0).unwrap(),
            open: close - 0.0001,
            high: close + 0.0002,
            low: close - 0.0002,
            close,
            volume: 20.0,
            finalized: true,
        }
    }

    #[test]
    fn empty_everything_yields_warnings() {
        let (fetcher, _, _, inst) = fixture();
        let view = fetcher.fetch(&inst, Utc::now());
        assert!(view.candles.is_empty());
        assert!(view.has_warning(WARN_INSUFFICIENT_CANDLES));
        assert!(view.has_warning(WARN_SPREAD_UNAVAILABLE));
        assert!(view.spread_pips.is_none());
    }

    #[test]
    fn store_fallback_fills_thin_hub_window() {
        let (fetcher, _, store, inst) = fixture();
        let rows: Vec<Row> = (0..40)
            .map(|i| Row::Candle(minute_candle(i, 1.08 + i as f64 * 1e-4)))
            .collect();
        store.apply_batch(&rows).unwrap();

        let now = Utc.with_ymd_and_hms(2025, 3, 3, 9, 40, 30).unwrap();
        let view = fetcher.fetch(&inst, now);
        assert_eq!(view.candles.len(), 40);
        assert!(!view.has_warning(WARN_INSUFFICIENT_CANDLES));
    }

    #[test]
    fn fresh_tick_produces_spread() {
        let (fetcher, hub, _, inst) = fixture();
        let now = Utc.with_ymd_and_hms(2025, 3, 3, 9, 40, 0).unwrap();
        hub.update_tick(Tick::new("EUR_USD", now - Duration::seconds(1), 1.08341, 1.08350));

        let view = fetcher.fetch(&inst, now);
        assert!((view.spread_pips.unwrap() - 0.9).abs() < 1e-6);
        assert!(!view.has_warning(WARN_SPREAD_UNAVAILABLE));
    }

    #[test]
    fn stale_tick_withholds_spread() {
        let (fetcher, hub, _, inst) = fixture();
        let now = Utc.with_ymd_and_hms(2025, 3, 3, 9, 40, 0).unwrap();
        hub.update_tick(Tick::new("EUR_USD", now - Duration::seconds(10), 1.08341, 1.08350));

        let view = fetcher.fetch(&inst, now);
        assert!(view.spread_pips.is_none());
        assert!(view.has_warning(WARN_SPREAD_UNAVAILABLE));
    }

    #[test]
    fn stale_ta_and_flow_included_but_flagged() {
        let (fetcher, hub, _, inst) = fixture();
        let now = Utc.with_ymd_and_hms(2025, 3, 3, 9, 40, 0).unwrap();

        hub.update_ta(crate::types::TaSnapshot {
            instrument: "EUR_USD".into(),
            compute_time: now - Duration::seconds(3600),
            buy_count: 10,
            sell_count: 2,
            neutral_count: 2,
            consensus: Consensus::Bullish,
            confidence: 0.7,
        });
        hub.update_order_flow(OrderFlowMetrics {
            instrument: "EUR_USD".into(),
            compute_time: now - Duration::seconds(30),
            ofi_60s: 0.2,
            volume_delta: 5.0,
            buy_volume: 10.0,
            sell_volume: 5.0,
            vwap: 1.0850,
            sweep_flag: false,
            vpin: 0.3,
        });

        let view = fetcher.fetch(&inst, now);
        assert!(view.ta.is_some());
        assert!(view.has_warning(WARN_TA_STALE));
        assert!(view.order_flow.is_some());
        assert!(view.has_warning(WARN_OF_STALE));
    }
}
