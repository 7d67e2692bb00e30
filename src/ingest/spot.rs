// =============================================================================
// Spot Tick Ingestor — broker stream -> hub ticks + 1-minute OHLC candles
// =============================================================================
//
// One minute bucket per instrument, keyed by the tick's UTC minute:
//   * same minute  -> fold the mid into the forming bar, publish to the hub's
//     forming slot
//   * later minute -> finalize the old bar (hub window + store), open a new
//     one from this tick
//   * earlier minute -> late arrival, dropped and counted
//
// The raw tick is always published to the hub and appended to the tick batch
// regardless of bucketing.
//
// Reconnection: exponential backoff with jitter, reset on a successful
// connect. An AUTH_EXPIRED stream error triggers one session refresh; if the
// refresh itself fails the ingestor halts with a fatal status.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, DurationRound, Utc};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::config::{BackoffParams, SessionWindow};
use crate::drivers::{BrokerDriver, FeedError, TickFeed};
use crate::hub::MarketDataHub;
use crate::status::{StatusRegistry, TaskState};
use crate::store::batch::BatchWriter;
use crate::store::Row;
use crate::types::{Candle, Tick};

const TASK_NAME: &str = "spot_ingestor";
/// No ticks for this long during session hours -> feed-stale warning.
const GAP_WARN_SECS: i64 = 60;

// ---------------------------------------------------------------------------
// Minute aggregation
// ---------------------------------------------------------------------------

/// Result of folding one tick into the per-instrument minute buckets.
#[derive(Debug, Clone)]
pub enum Aggregation {
    /// Forming bar updated (and possibly a previous bar finalized first).
    Updated {
        finalized: Option<Candle>,
        forming: Candle,
    },
    /// Tick belongs to an already-finalized minute.
    Late,
}

/// Pure tick -> 1-minute OHLC state machine, one bucket per instrument.
#[derive(Default)]
pub struct MinuteAggregator {
    buckets: HashMap<String, Candle>,
}

impl MinuteAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, tick: &Tick) -> Aggregation {
        let minute = tick
            .event_time
            .duration_trunc(Duration::minutes(1))
            .unwrap_or(tick.event_time);

        match self.buckets.get_mut(&tick.instrument) {
            None => {
                let forming = Candle::from_mid(&tick.instrument, "1m", minute, tick.mid);
                self.buckets.insert(tick.instrument.clone(), forming.clone());
                Aggregation::Updated {
                    finalized: None,
                    forming,
                }
            }
            Some(bucket) if minute == bucket.open_time => {
                bucket.apply_mid(tick.mid);
                Aggregation::Updated {
                    finalized: None,
                    forming: bucket.clone(),
                }
            }
            Some(bucket) if minute > bucket.open_time => {
                let mut done = bucket.clone();
                done.finalized = true;
                let forming = Candle::from_mid(&tick.instrument, "1m", minute, tick.mid);
                *bucket = forming.clone();
                Aggregation::Updated {
                    finalized: Some(done),
                    forming,
                }
            }
            Some(_) => Aggregation::Late,
        }
    }
}

// ---------------------------------------------------------------------------
// Ingestor task
// ---------------------------------------------------------------------------

pub struct SpotTickIngestor {
    instruments: Vec<String>,
    sessions: Vec<SessionWindow>,
    backoff: BackoffParams,
    hub: Arc<MarketDataHub>,
    writer: BatchWriter,
    feed: Arc<dyn TickFeed>,
    broker: Arc<dyn BrokerDriver>,
    status: Arc<StatusRegistry>,
    aggregator: Mutex<MinuteAggregator>,
    last_tick_at: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl SpotTickIngestor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        instruments: Vec<String>,
        sessions: Vec<SessionWindow>,
        backoff: BackoffParams,
        hub: Arc<MarketDataHub>,
        writer: BatchWriter,
        feed: Arc<dyn TickFeed>,
        broker: Arc<dyn BrokerDriver>,
        status: Arc<StatusRegistry>,
    ) -> Self {
        Self {
            instruments,
            sessions,
            backoff,
            hub,
            writer,
            feed,
            broker,
            status,
            aggregator: Mutex::new(MinuteAggregator::new()),
            last_tick_at: Mutex::new(HashMap::new()),
        }
    }

    /// Fold one tick into hub + store. Public so tests can drive the
    /// ingestor without a live stream.
    pub fn on_tick(&self, tick: Tick) {
        // Raw tick goes to the hub and the batch unconditionally.
        self.hub.update_tick(tick.clone());
        self.writer.push(Row::Tick(tick.clone()));
        self.last_tick_at
            .lock()
            .insert(tick.instrument.clone(), tick.event_time);

        match self.aggregator.lock().apply(&tick) {
            Aggregation::Updated { finalized, forming } => {
                if let Some(done) = finalized {
                    debug!(
                        instrument = %done.instrument,
                        open_time = %done.open_time,
                        close = done.close,
                        volume = done.volume,
                        "minute candle finalized"
                    );
                    self.hub.update_candle(done.clone());
                    self.writer.push(Row::Candle(done));
                }
                self.hub.update_candle(forming);
                self.status.record_event(TASK_NAME);
            }
            Aggregation::Late => {
                warn!(
                    instrument = %tick.instrument,
                    event_time = %tick.event_time,
                    "late tick dropped (earlier than current minute bucket)"
                );
                self.status.record_error(TASK_NAME);
            }
        }
    }

    /// Warn for any instrument silent for more than [`GAP_WARN_SECS`] during
    /// session hours. The engine independently rejects on staleness; this is
    /// operator signal only.
    pub fn check_gaps(&self, now: DateTime<Utc>) {
        if !self.sessions.iter().any(|w| w.contains(now)) {
            return;
        }
        let last = self.last_tick_at.lock();
        for instrument in &self.instruments {
            match last.get(instrument) {
                Some(seen) if (now - *seen).num_seconds() > GAP_WARN_SECS => {
                    warn!(
                        instrument = %instrument,
                        silent_secs = (now - *seen).num_seconds(),
                        "feed stale during session hours"
                    );
                }
                None => {
                    warn!(instrument = %instrument, "no ticks received yet during session hours");
                }
                _ => {}
            }
        }
    }

    /// Run until shutdown. Owns reconnect/backoff and the session-refresh
    /// path; subscriptions are rebuilt from scratch on every reconnect.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let (tx, mut rx) = mpsc::channel::<Tick>(2048);

        // Consumer half: drains the channel and runs the gap detector.
        let consumer = {
            let me = self.clone();
            let mut consumer_shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut gap_ticker = interval(std::time::Duration::from_secs(30));
                loop {
                    tokio::select! {
                        _ = consumer_shutdown.changed() => {
                            if *consumer_shutdown.borrow() {
                                return;
                            }
                        }
                        maybe_tick = rx.recv() => {
                            match maybe_tick {
                                Some(tick) => me.on_tick(tick),
                                None => return,
                            }
                        }
                        _ = gap_ticker.tick() => {
                            me.check_gaps(Utc::now());
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
            let run = self.feed.run(&self.instruments, tx.clone());

            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                result = run => {
                    match result {
                        Ok(()) => {
                            info!("tick stream disconnected cleanly — resubscribing");
                            attempt = 0;
                        }
                        Err(FeedError::AuthExpired) => {
                            warn!("tick stream session expired — refreshing");
                            if let Err(e) = self.broker.refresh_session_if_expired().await {
                                error!(error = %e, "session refresh failed — halting tick ingestor");
                                self.status.set_state(TASK_NAME, TaskState::Failed);
                                return;
                            }
                        }
                        Err(FeedError::Stream(e)) => {
                            error!(error = %e, attempt, "tick stream error");
                            self.status.record_error(TASK_NAME);
                            self.status.set_state(TASK_NAME, TaskState::Degraded);
                        }
                    }
                }
            }

            attempt = attempt.saturating_add(1);
            let delay = super::reconnect_delay(&self.backoff, attempt);
            debug!(attempt, delay_ms = delay.as_millis() as u64, "tick stream backoff");
            tokio::time::sleep(delay).await;
        }

        drop(tx);
        let _ = consumer.await;
        self.status.set_state(TASK_NAME, TaskState::Stopped);
        info!("spot tick ingestor stopped");
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HubParams;
    use crate::drivers::sim::SimBroker;
    use async_trait::async_trait;
    use chrono::TimeZone;

    fn tick_at(sec_offset: i64, mid: f64) -> Tick {
        let t = Utc.with_ymd_and_hms(2025, 3, 3, 10, 0, 0).unwrap() + Duration::seconds(sec_offset);
        Tick::new("EUR_USD", t, mid, mid)
    }

    #[test]
    fn aggregator_builds_expected_candle() {
        // Mids within minute 10:00, then the first tick of 10:01 finalizes.
        let mut agg = MinuteAggregator::new();
        for (i, mid) in [1.0850, 1.0853, 1.0851, 1.0852, 1.0849].iter().enumerate() {
            match agg.apply(&tick_at(i as i64 * 10, *mid)) {
                Aggregation::Updated { finalized, forming } => {
                    assert!(finalized.is_none());
                    assert!(!forming.finalized);
                }
                Aggregation::Late => panic!("unexpected late tick"),
            }
        }

        let Aggregation::Updated { finalized, forming } = agg.apply(&tick_at(60, 1.0851)) else {
            panic!("rollover tick must update");
        };
        let done = finalized.expect("minute rollover finalizes the previous bar");

        assert_eq!(
            done.open_time,
            Utc.with_ymd_and_hms(2025, 3, 3, 10, 0, 0).unwrap()
        );
        assert!(done.finalized);
        assert!((done.open - 1.0850).abs() < 1e-9);
        assert!((done.high - 1.0853).abs() < 1e-9);
        assert!((done.low - 1.0849).abs() < 1e-9);
        assert!((done.close - 1.0852).abs() < 1e-9);
        assert!((done.volume - 5.0).abs() < f64::EPSILON);

        assert_eq!(
            forming.open_time,
            Utc.with_ymd_and_hms(2025, 3, 3, 10, 1, 0).unwrap()
        );
        assert!((forming.volume - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn aggregator_drops_late_ticks() {
        let mut agg = MinuteAggregator::new();
        agg.apply(&tick_at(0, 1.0850));
        agg.apply(&tick_at(60, 1.0851)); // now in minute 10:01
        assert!(matches!(agg.apply(&tick_at(30, 1.0852)), Aggregation::Late));
    }

    #[test]
    fn aggregator_tracks_instruments_independently() {
        let mut agg = MinuteAggregator::new();
        let t = Utc.with_ymd_and_hms(2025, 3, 3, 10, 0, 0).unwrap();
        agg.apply(&Tick::new("EUR_USD", t, 1.0850, 1.0850));
        agg.apply(&Tick::new("USD_JPY", t, 150.10, 150.10));

        let Aggregation::Updated { forming, .. } =
            agg.apply(&Tick::new("EUR_USD", t + Duration::seconds(5), 1.0860, 1.0860))
        else {
            panic!()
        };
        assert!((forming.volume - 2.0).abs() < f64::EPSILON);
        assert_eq!(forming.instrument, "EUR_USD");
    }

    struct NullFeed;

    #[async_trait]
    impl TickFeed for NullFeed {
        async fn run(
            &self,
            _instruments: &[String],
            _sink: mpsc::Sender<Tick>,
        ) -> std::result::Result<(), FeedError> {
            Ok(())
        }
    }

    fn test_ingestor() -> (SpotTickIngestor, Arc<MarketDataHub>, BatchWriter) {
        let hub = Arc::new(MarketDataHub::new(&HubParams::default()));
        let writer = BatchWriter::new();
        let ingestor = SpotTickIngestor::new(
            vec!["EUR_USD".into()],
            Vec::new(),
            BackoffParams::default(),
            hub.clone(),
            writer.clone(),
            Arc::new(NullFeed),
            Arc::new(SimBroker::new(1000.0)),
            Arc::new(StatusRegistry::new()),
        );
        (ingestor, hub, writer)
    }

    #[test]
    fn on_tick_publishes_tick_forming_and_finalized() {
        let (ingestor, hub, writer) = test_ingestor();

        for (i, mid) in [1.0850, 1.0853, 1.0851, 1.0852, 1.0849].iter().enumerate() {
            ingestor.on_tick(tick_at(i as i64 * 10, *mid));
        }

        // Raw tick visible, forming bar in its slot, window still empty.
        assert!(hub.get_latest_tick("EUR_USD").is_some());
        let forming = hub.get_forming_candle("EUR_USD", "1m").unwrap();
        assert!((forming.volume - 5.0).abs() < f64::EPSILON);
        assert!(hub.get_latest_candles("EUR_USD", "1m", 10).is_empty());

        // Rollover: the finalized bar lands in the window and the batch.
        ingestor.on_tick(tick_at(60, 1.0851));
        let window = hub.get_latest_candles("EUR_USD", "1m", 10);
        assert_eq!(window.len(), 1);
        assert!((window[0].close - 1.0852).abs() < 1e-9);

        // 6 ticks + 1 finalized candle buffered for the store.
        assert_eq!(writer.backlog(), 7);
    }
}
