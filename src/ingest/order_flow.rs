// =============================================================================
// Order Flow Ingestor — futures MBP/trade stream -> rolling flow metrics
// =============================================================================
//
// Futures events arrive in futures-symbol space; a static map translates
// them to the spot instrument they proxy. Each instrument keeps a 60-second
// rolling window of trades and best-level book updates from which we derive:
//
//   volume_delta  buy aggressor volume minus sell aggressor volume
//   ofi_60s       net imbalance in [-1, 1] from trades + best-level pressure
//   vwap          volume-weighted average trade price over the window
//   sweep_flag    a single aggressive trade consumed >= K book levels within
//                 the last second
//   vpin          volume-clock toxicity over fixed-volume buckets
//
// Snapshots overwrite the hub entry per instrument and are persisted; raw
// events and trades are batched to the store for audit.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::config::{BackoffParams, OrderFlowParams};
use crate::drivers::{FeedError, FlowEvent, FlowEventKind, OrderFlowFeed};
use crate::hub::MarketDataHub;
use crate::status::{StatusRegistry, TaskState};
use crate::store::batch::BatchWriter;
use crate::store::{FlowEventRow, FlowTradeRow, Row};
use crate::types::OrderFlowMetrics;

const TASK_NAME: &str = "order_flow_ingestor";
/// Rolling window length.
const WINDOW_SECS: i64 = 60;
/// Sweep recency: the flag reports sweeps seen within this span.
const SWEEP_RECENCY_SECS: i64 = 1;

// ---------------------------------------------------------------------------
// VPIN volume clock
// ---------------------------------------------------------------------------

/// Fixed-volume bucket clock. Trades fill the current bucket; full buckets
/// roll into the ring and VPIN is the mean absolute buy/sell imbalance over
/// the retained buckets.
struct VolumeClock {
    bucket_volume: f64,
    max_buckets: usize,
    current_buy: f64,
    current_sell: f64,
    buckets: VecDeque<(f64, f64)>,
}

impl VolumeClock {
    fn new(bucket_volume: f64, max_buckets: usize) -> Self {
        Self {
            bucket_volume: bucket_volume.max(1e-9),
            max_buckets: max_buckets.max(1),
            current_buy: 0.0,
            current_sell: 0.0,
            buckets: VecDeque::with_capacity(max_buckets),
        }
    }

    fn add_trade(&mut self, mut size: f64, buy_aggressor: bool) {
        while size > 0.0 {
            let filled = self.current_buy + self.current_sell;
            let room = self.bucket_volume - filled;
            let take = size.min(room);

            if buy_aggressor {
                self.current_buy += take;
            } else {
                self.current_sell += take;
            }
            size -= take;

            if self.current_buy + self.current_sell >= self.bucket_volume - 1e-12 {
                self.buckets.push_back((self.current_buy, self.current_sell));
                if self.buckets.len() > self.max_buckets {
                    self.buckets.pop_front();
                }
                self.current_buy = 0.0;
                self.current_sell = 0.0;
            }
        }
    }

    fn vpin(&self) -> f64 {
        if self.buckets.is_empty() {
            return 0.0;
        }
        let imbalance: f64 = self.buckets.iter().map(|(b, s)| (b - s).abs()).sum();
        let volume: f64 = self.buckets.iter().map(|(b, s)| b + s).sum();
        if volume > 0.0 {
            imbalance / volume
        } else {
            0.0
        }
    }
}

// ---------------------------------------------------------------------------
// Rolling flow window
// ---------------------------------------------------------------------------

struct TradeEntry {
    at: DateTime<Utc>,
    price: f64,
    size: f64,
    buy_aggressor: bool,
    levels_consumed: usize,
}

struct BookPressureEntry {
    at: DateTime<Utc>,
    pressure: f64,
}

/// Per-instrument rolling window state.
pub struct FlowWindow {
    instrument: String,
    sweep_levels: usize,
    trades: VecDeque<TradeEntry>,
    book_pressure: VecDeque<BookPressureEntry>,
    prev_best: Option<(f64, f64, f64, f64)>,
    vpin_clock: VolumeClock,
}

impl FlowWindow {
    pub fn new(instrument: impl Into<String>, params: &OrderFlowParams) -> Self {
        Self {
            instrument: instrument.into(),
            sweep_levels: params.sweep_levels,
            trades: VecDeque::new(),
            book_pressure: VecDeque::new(),
            prev_best: None,
            vpin_clock: VolumeClock::new(params.vpin_bucket_volume, params.vpin_buckets),
        }
    }

    pub fn add_trade(
        &mut self,
        at: DateTime<Utc>,
        price: f64,
        size: f64,
        buy_aggressor: bool,
        levels_consumed: usize,
    ) {
        self.vpin_clock.add_trade(size, buy_aggressor);
        self.trades.push_back(TradeEntry {
            at,
            price,
            size,
            buy_aggressor,
            levels_consumed,
        });
    }

    /// Best-level update. Pressure follows the usual order-flow-imbalance
    /// increments: rising bid size pushes up, rising ask size pushes down.
    pub fn add_book(&mut self, at: DateTime<Utc>, bid: f64, ask: f64, bid_size: f64, ask_size: f64) {
        if let Some((prev_bid, prev_ask, prev_bid_size, prev_ask_size)) = self.prev_best {
            let bid_pressure = if bid > prev_bid {
                bid_size
            } else if bid < prev_bid {
                -prev_bid_size
            } else {
                bid_size - prev_bid_size
            };
            let ask_pressure = if ask < prev_ask {
                ask_size
            } else if ask > prev_ask {
                -prev_ask_size
            } else {
                ask_size - prev_ask_size
            };
            self.book_pressure.push_back(BookPressureEntry {
                at,
                pressure: bid_pressure - ask_pressure,
            });
        }
        self.prev_best = Some((bid, ask, bid_size, ask_size));
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now - Duration::seconds(WINDOW_SECS);
        while self.trades.front().is_some_and(|t| t.at < cutoff) {
            self.trades.pop_front();
        }
        while self.book_pressure.front().is_some_and(|b| b.at < cutoff) {
            self.book_pressure.pop_front();
        }
    }

    /// Compute the snapshot for `now`. Returns `None` when the window holds
    /// no events at all (nothing meaningful to publish).
    pub fn compute(&mut self, now: DateTime<Utc>) -> Option<OrderFlowMetrics> {
        self.prune(now);
        if self.trades.is_empty() && self.book_pressure.is_empty() {
            return None;
        }

        let buy_volume: f64 = self
            .trades
            .iter()
            .filter(|t| t.buy_aggressor)
            .map(|t| t.size)
            .sum();
        let sell_volume: f64 = self
            .trades
            .iter()
            .filter(|t| !t.buy_aggressor)
            .map(|t| t.size)
            .sum();
        let volume_delta = buy_volume - sell_volume;

        let traded: f64 = buy_volume + sell_volume;
        let vwap = if traded > 0.0 {
            self.trades.iter().map(|t| t.price * t.size).sum::<f64>() / traded
        } else {
            0.0
        };

        let pressure: f64 = self.book_pressure.iter().map(|b| b.pressure).sum();
        let scale = traded + pressure.abs();
        let ofi_60s = if scale > 0.0 {
            ((volume_delta + pressure) / scale).clamp(-1.0, 1.0)
        } else {
            0.0
        };

        let sweep_cutoff = now - Duration::seconds(SWEEP_RECENCY_SECS);
        let sweep_flag = self
            .trades
            .iter()
            .rev()
            .take_while(|t| t.at >= sweep_cutoff)
            .any(|t| t.levels_consumed >= self.sweep_levels);

        Some(OrderFlowMetrics {
            instrument: self.instrument.clone(),
            compute_time: now,
            ofi_60s,
            volume_delta,
            buy_volume,
            sell_volume,
            vwap,
            sweep_flag,
            vpin: self.vpin_clock.vpin(),
        })
    }
}

// ---------------------------------------------------------------------------
// Ingestor task
// ---------------------------------------------------------------------------

pub struct OrderFlowIngestor {
    /// futures symbol -> spot instrument.
    symbol_map: HashMap<String, String>,
    backoff: BackoffParams,
    hub: Arc<MarketDataHub>,
    writer: BatchWriter,
    feed: Arc<dyn OrderFlowFeed>,
    status: Arc<StatusRegistry>,
    windows: Mutex<HashMap<String, FlowWindow>>,
    params: OrderFlowParams,
}

impl OrderFlowIngestor {
    pub fn new(
        spot_to_futures: &HashMap<String, String>,
        instruments: &[String],
        params: OrderFlowParams,
        backoff: BackoffParams,
        hub: Arc<MarketDataHub>,
        writer: BatchWriter,
        feed: Arc<dyn OrderFlowFeed>,
        status: Arc<StatusRegistry>,
    ) -> Self {
        let symbol_map: HashMap<String, String> = instruments
            .iter()
            .filter_map(|inst| {
                spot_to_futures
                    .get(inst)
                    .map(|fut| (fut.clone(), inst.clone()))
            })
            .collect();

        Self {
            symbol_map,
            backoff,
            hub,
            writer,
            feed,
            status,
            windows: Mutex::new(HashMap::new()),
            params,
        }
    }

    pub fn futures_symbols(&self) -> Vec<String> {
        self.symbol_map.keys().cloned().collect()
    }

    /// Apply one stream event to the matching instrument window and batch the
    /// raw row. Unknown futures symbols are dropped and counted.
    pub fn on_event(&self, event: FlowEvent) {
        let Some(instrument) = self.symbol_map.get(&event.futures_symbol).cloned() else {
            warn!(symbol = %event.futures_symbol, "flow event for unmapped futures symbol dropped");
            self.status.record_error(TASK_NAME);
            return;
        };

        let mut windows = self.windows.lock();
        let window = windows
            .entry(instrument.clone())
            .or_insert_with(|| FlowWindow::new(instrument.clone(), &self.params));

        match &event.kind {
            FlowEventKind::Trade {
                price,
                size,
                buy_aggressor,
                levels_consumed,
            } => {
                window.add_trade(event.event_time, *price, *size, *buy_aggressor, *levels_consumed);
                self.writer.push(Row::FlowTrade(FlowTradeRow {
                    instrument: instrument.clone(),
                    event_time: event.event_time,
                    price: *price,
                    size: *size,
                    buy_aggressor: *buy_aggressor,
                }));
            }
            FlowEventKind::Book {
                bid,
                ask,
                bid_size,
                ask_size,
            } => {
                window.add_book(event.event_time, *bid, *ask, *bid_size, *ask_size);
            }
        }

        self.writer.push(Row::FlowEvent(FlowEventRow {
            instrument,
            event_time: event.event_time,
            kind: match event.kind {
                FlowEventKind::Trade { .. } => "trade".to_string(),
                FlowEventKind::Book { .. } => "book".to_string(),
            },
            payload: serde_json::to_value(&event.kind).unwrap_or(serde_json::Value::Null),
        }));

        self.status.record_event(TASK_NAME);
    }

    /// Recompute and publish every instrument's snapshot.
    pub fn publish_snapshots(&self, now: DateTime<Utc>) {
        let mut windows = self.windows.lock();
        for window in windows.values_mut() {
            if let Some(metrics) = window.compute(now) {
                debug!(
                    instrument = %metrics.instrument,
                    ofi = metrics.ofi_60s,
                    delta = metrics.volume_delta,
                    vpin = metrics.vpin,
                    sweep = metrics.sweep_flag,
                    "order-flow snapshot"
                );
                self.hub.update_order_flow(metrics.clone());
                self.writer.push(Row::FlowSnapshot(metrics));
            }
        }
    }

    /// Run until shutdown, reconnecting with backoff like the tick stream.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let futures_symbols = self.futures_symbols();
        if futures_symbols.is_empty() {
            warn!("no futures symbols mapped — order flow ingestor idle");
            self.status.set_state(TASK_NAME, TaskState::Stopped);
            return;
        }

        let (tx, mut rx) = mpsc::channel::<FlowEvent>(4096);

        let consumer = {
            let me = self.clone();
            let mut consumer_shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut compute_ticker = interval(std::time::Duration::from_secs(1));
                loop {
                    tokio::select! {
                        _ = consumer_shutdown.changed() => {
                            if *consumer_shutdown.borrow() {
                                return;
                            }
                        }
                        maybe_event = rx.recv() => {
                            match maybe_event {
                                Some(event) => me.on_event(event),
                                None => return,
                            }
                        }
                        _ = compute_ticker.tick() => {
                            me.publish_snapshots(Utc::now());
                            me.status.set_backlog(TASK_NAME, me.writer.backlog() as u64);
                        }
                    }
                }
            })
        };

        let mut attempt: u32 = 0;
        loop {
            if *shutdown.borrow() {
                break;
            }

            self.status.set_state(TASK_NAME, TaskState::Running);
            let run = self.feed.run(&futures_symbols, tx.clone());

            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                result = run => {
                    match result {
                        Ok(()) => {
                            info!("order-flow stream disconnected cleanly — resubscribing");
                            attempt = 0;
                        }
                        Err(FeedError::AuthExpired) => {
                            // Flow provider tokens are static; expiry is terminal.
                            error!("order-flow stream auth expired — halting");
                            self.status.set_state(TASK_NAME, TaskState::Failed);
                            return;
                        }
                        Err(FeedError::Stream(e)) => {
                            error!(error = %e, attempt, "order-flow stream error");
                            self.status.record_error(TASK_NAME);
                            self.status.set_state(TASK_NAME, TaskState::Degraded);
                        }
                    }
                }
            }

            attempt = attempt.saturating_add(1);
            tokio::time::sleep(super::reconnect_delay(&self.backoff, attempt)).await;
        }

        drop(tx);
        let _ = consumer.await;
        self.status.set_state(TASK_NAME, TaskState::Stopped);
        info!("order flow ingestor stopped");
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 3, 10, 1, 0).unwrap()
    }

    fn window() -> FlowWindow {
        FlowWindow::new("EUR_USD", &OrderFlowParams::default())
    }

    #[test]
    fn volume_delta_and_vwap() {
        let mut w = window();
        let t = now();
        w.add_trade(t - Duration::seconds(10), 1.0850, 30.0, true, 1);
        w.add_trade(t - Duration::seconds(5), 1.0852, 10.0, false, 1);

        let m = w.compute(t).unwrap();
        assert!((m.buy_volume - 30.0).abs() < 1e-9);
        assert!((m.sell_volume - 10.0).abs() < 1e-9);
        assert!((m.volume_delta - 20.0).abs() < 1e-9);
        let expected_vwap = (1.0850 * 30.0 + 1.0852 * 10.0) / 40.0;
        assert!((m.vwap - expected_vwap).abs() < 1e-9);
        assert!(m.ofi_60s > 0.0);
    }

    #[test]
    fn window_prunes_old_trades() {
        let mut w = window();
        let t = now();
        w.add_trade(t - Duration::seconds(120), 1.0850, 50.0, true, 1);
        w.add_trade(t - Duration::seconds(10), 1.0851, 5.0, false, 1);

        let m = w.compute(t).unwrap();
        assert!((m.buy_volume - 0.0).abs() < 1e-9, "2-minute-old trade pruned");
        assert!((m.sell_volume - 5.0).abs() < 1e-9);
    }

    #[test]
    fn sweep_flag_requires_levels_and_recency() {
        let t = now();

        let mut recent = window();
        recent.add_trade(t, 1.0850, 20.0, true, 4);
        assert!(recent.compute(t).unwrap().sweep_flag);

        let mut shallow = window();
        shallow.add_trade(t, 1.0850, 20.0, true, 2);
        assert!(!shallow.compute(t).unwrap().sweep_flag);

        let mut old = window();
        old.add_trade(t - Duration::seconds(30), 1.0850, 20.0, true, 4);
        assert!(!old.compute(t).unwrap().sweep_flag);
    }

    #[test]
    fn empty_window_produces_no_snapshot() {
        assert!(window().compute(now()).is_none());
    }

    #[test]
    fn vpin_rises_with_one_sided_flow() {
        let params = OrderFlowParams {
            vpin_bucket_volume: 10.0,
            vpin_buckets: 5,
            ..OrderFlowParams::default()
        };
        let mut balanced = FlowWindow::new("EUR_USD", &params);
        let mut toxic = FlowWindow::new("EUR_USD", &params);
        let t = now();

        for i in 0..10 {
            balanced.add_trade(t, 1.0850, 5.0, i % 2 == 0, 1);
            toxic.add_trade(t, 1.0850, 5.0, true, 1);
        }

        let balanced_vpin = balanced.compute(t).unwrap().vpin;
        let toxic_vpin = toxic.compute(t).unwrap().vpin;
        assert!(balanced_vpin < 0.2, "balanced flow is not toxic: {balanced_vpin}");
        assert!((toxic_vpin - 1.0).abs() < 1e-9, "one-sided flow maxes VPIN: {toxic_vpin}");
    }

    #[test]
    fn volume_clock_splits_large_trades_across_buckets() {
        let mut clock = VolumeClock::new(10.0, 4);
        clock.add_trade(25.0, true);
        // 25 volume fills two complete buckets and half of a third.
        assert_eq!(clock.buckets.len(), 2);
        assert!((clock.current_buy - 5.0).abs() < 1e-9);
    }

    #[test]
    fn book_pressure_moves_ofi() {
        let mut w = window();
        let t = now();
        // Bid size builds while ask thins: bullish pressure, no trades.
        w.add_book(t - Duration::seconds(3), 1.0850, 1.0851, 10.0, 20.0);
        w.add_book(t - Duration::seconds(2), 1.0850, 1.0851, 30.0, 12.0);
        let m = w.compute(t).unwrap();
        assert!(m.ofi_60s > 0.0, "building bid should be positive OFI, got {}", m.ofi_60s);
    }

    #[test]
    fn ingestor_maps_futures_to_spot() {
        let mut spot_to_fut = HashMap::new();
        spot_to_fut.insert("EUR_USD".to_string(), "6E".to_string());

        struct NoFeed;
        #[async_trait::async_trait]
        impl OrderFlowFeed for NoFeed {
            async fn run(
                &self,
                _symbols: &[String],
                _sink: mpsc::Sender<FlowEvent>,
            ) -> std::result::Result<(), FeedError> {
                Ok(())
            }
        }

        let hub = Arc::new(MarketDataHub::new(&crate::config::HubParams::default()));
        let ingestor = OrderFlowIngestor::new(
            &spot_to_fut,
            &["EUR_USD".to_string()],
            OrderFlowParams::default(),
            BackoffParams::default(),
            hub.clone(),
            BatchWriter::new(),
            Arc::new(NoFeed),
            Arc::new(StatusRegistry::new()),
        );

        assert_eq!(ingestor.futures_symbols(), vec!["6E".to_string()]);

        let t = now();
        ingestor.on_event(FlowEvent {
            futures_symbol: "6E".into(),
            event_time: t,
            kind: FlowEventKind::Trade {
                price: 1.0850,
                size: 12.0,
                buy_aggressor: true,
                levels_consumed: 1,
            },
        });
        ingestor.publish_snapshots(t);

        let snapshot = hub.get_latest_order_flow("EUR_USD").unwrap();
        assert!((snapshot.buy_volume - 12.0).abs() < 1e-9);
    }
}
