// =============================================================================
// News Gater — trading blackouts around scheduled high-impact events
// =============================================================================
//
// Every high-impact calendar event spawns one gating window per instrument
// whose base or quote matches the event currency:
//
//   [event - pre_event, event + post_event], close_positions_at = event - offset
//
// Window states move scheduled -> active -> cleared on a one-minute
// transition task; every transition is persisted. Queries are all-of: an
// instrument is gated while ANY of its windows is active.
// =============================================================================

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::config::NewsParams;
use crate::drivers::CalendarProvider;
use crate::status::{StatusRegistry, TaskState};
use crate::store::Store;
use crate::types::{EconomicEvent, GateState, GatingWindow, Importance, Instrument};

const TASK_NAME: &str = "news_gater";
/// Calendar look-ahead per refresh.
const CALENDAR_HORIZON_HOURS: i64 = 24;

pub struct NewsGater {
    params: NewsParams,
    instruments: Vec<Instrument>,
    windows: RwLock<Vec<GatingWindow>>,
}

impl NewsGater {
    pub fn new(params: NewsParams, instruments: Vec<Instrument>) -> Self {
        Self {
            params,
            instruments,
            windows: RwLock::new(Vec::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Window derivation
    // -------------------------------------------------------------------------

    /// Create scheduled windows for newly observed high-impact events.
    /// Returns the windows created by this call (for persistence).
    pub fn apply_events(&self, events: &[EconomicEvent]) -> Vec<GatingWindow> {
        let mut created = Vec::new();
        let mut windows = self.windows.write();

        for event in events {
            if event.importance != Importance::High {
                continue;
            }
            for instrument in &self.instruments {
                if !instrument.involves(&event.currency) {
                    continue;
                }
                let already_known = windows.iter().any(|w| {
                    w.instrument == instrument.id
                        && w.linked_event_id.as_deref() == Some(event.event_id.as_str())
                });
                if already_known {
                    continue;
                }

                let window = GatingWindow {
                    instrument: instrument.id.clone(),
                    state: GateState::Scheduled,
                    window_start: event.scheduled_time
                        - Duration::seconds(self.params.pre_event_secs),
                    window_end: event.scheduled_time
                        + Duration::seconds(self.params.post_event_secs),
                    close_positions_at: event.scheduled_time
                        - Duration::seconds(self.params.close_positions_offset_secs),
                    reason: format!("{} {}", event.currency, event.event_name),
                    linked_event_id: Some(event.event_id.clone()),
                };
                debug!(
                    instrument = %window.instrument,
                    start = %window.window_start,
                    end = %window.window_end,
                    reason = %window.reason,
                    "gating window scheduled"
                );
                windows.push(window.clone());
                created.push(window);
            }
        }

        created
    }

    // -------------------------------------------------------------------------
    // State transitions
    // -------------------------------------------------------------------------

    /// Promote scheduled windows whose start has passed, clear active windows
    /// whose end has passed, and drop cleared windows from the working set.
    /// Returns every window that changed state (for persistence).
    pub fn transition(&self, now: DateTime<Utc>) -> Vec<GatingWindow> {
        let mut changed = Vec::new();
        let mut windows = self.windows.write();

        for window in windows.iter_mut() {
            match window.state {
                GateState::Scheduled if now >= window.window_start => {
                    window.state = GateState::Active;
                    info!(
                        instrument = %window.instrument,
                        reason = %window.reason,
                        until = %window.window_end,
                        "news gate ACTIVE"
                    );
                    changed.push(window.clone());
                }
                GateState::Active if now > window.window_end => {
                    window.state = GateState::Cleared;
                    info!(
                        instrument = %window.instrument,
                        reason = %window.reason,
                        "news gate cleared"
                    );
                    changed.push(window.clone());
                }
                _ => {}
            }
        }

        windows.retain(|w| w.state != GateState::Cleared);
        changed
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// First active window covering `now` for the instrument, if any.
    pub fn is_gated(&self, instrument: &str, now: DateTime<Utc>) -> Option<GatingWindow> {
        self.windows
            .read()
            .iter()
            .find(|w| {
                w.instrument == instrument
                    && w.state == GateState::Active
                    && w.window_start <= now
                    && now <= w.window_end
            })
            .cloned()
    }

    /// Active window whose close-positions deadline has passed: open trades
    /// on this instrument must be flattened immediately.
    pub fn must_close(&self, instrument: &str, now: DateTime<Utc>) -> Option<GatingWindow> {
        self.windows
            .read()
            .iter()
            .find(|w| {
                w.instrument == instrument
                    && w.state == GateState::Active
                    && w.close_positions_at <= now
                    && now <= w.window_end
            })
            .cloned()
    }

    /// Number of windows currently tracked (scheduled + active).
    pub fn window_count(&self) -> usize {
        self.windows.read().len()
    }
}

// -------------------------------------------------------------------------
// Refresh + transition task
// -------------------------------------------------------------------------

/// Run the calendar refresh and the per-minute transition pass until
/// shutdown. Calendar failures degrade (stale windows still transition).
pub async fn run_news_gater(
    gater: Arc<NewsGater>,
    calendar: Arc<dyn CalendarProvider>,
    store: Arc<Store>,
    status: Arc<StatusRegistry>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(refresh_secs = gater.params.refresh_secs, "news gater started");
    status.set_state(TASK_NAME, TaskState::Running);

    let mut refresh_ticker = interval(std::time::Duration::from_secs(gater.params.refresh_secs));
    let mut transition_ticker = interval(std::time::Duration::from_secs(60));

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            _ = refresh_ticker.tick() => {
                let now = Utc::now();
                match calendar
                    .fetch_calendar(now, now + Duration::hours(CALENDAR_HORIZON_HOURS))
                    .await
                {
                    Ok(events) => {
                        if let Err(e) = store.upsert_economic_events(&events) {
                            error!(error = %e, "failed to persist calendar events");
                        }
                        // Derive from the store so windows survive restarts.
                        let known = store
                            .fetch_high_impact_events(
                                now - Duration::hours(1),
                                now + Duration::hours(CALENDAR_HORIZON_HOURS),
                            )
                            .unwrap_or_default();
                        for window in gater.apply_events(&known) {
                            if let Err(e) = store.record_gating_transition(&window) {
                                error!(error = %e, "failed to persist gating window");
                            }
                        }
                        status.record_event(TASK_NAME);
                    }
                    Err(e) => {
                        warn!(error = %e, "calendar refresh failed");
                        status.record_error(TASK_NAME);
                        status.set_state(TASK_NAME, TaskState::Degraded);
                    }
                }
            }
            _ = transition_ticker.tick() => {
                for window in gater.transition(Utc::now()) {
                    if let Err(e) = store.record_gating_transition(&window) {
                        error!(error = %e, "failed to persist gating transition");
                    }
                }
            }
        }
    }

    status.set_state(TASK_NAME, TaskState::Stopped);
    info!("news gater stopped");
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn instruments() -> Vec<Instrument> {
        ["EUR_USD", "GBP_USD", "USD_JPY"]
            .iter()
            .map(|id| Instrument::parse(id).unwrap())
            .collect()
    }

    fn usd_event(at: DateTime<Utc>) -> EconomicEvent {
        EconomicEvent {
            event_id: "nfp-1".into(),
            scheduled_time: at,
            country: "US".into(),
            currency: "USD".into(),
            importance: Importance::High,
            event_name: "Non-Farm Payrolls".into(),
        }
    }

    fn gater() -> NewsGater {
        NewsGater::new(NewsParams::default(), instruments())
    }

    #[test]
    fn high_impact_event_gates_matching_instruments() {
        let g = gater();
        let event_time = Utc.with_ymd_and_hms(2025, 3, 7, 13, 30, 0).unwrap();

        let created = g.apply_events(&[usd_event(event_time)]);
        // USD touches all three configured pairs.
        assert_eq!(created.len(), 3);
        assert!(created.iter().all(|w| w.state == GateState::Scheduled));
        assert_eq!(
            created[0].window_start,
            event_time - Duration::minutes(15)
        );
        assert_eq!(created[0].window_end, event_time + Duration::minutes(10));
        assert_eq!(
            created[0].close_positions_at,
            event_time - Duration::minutes(10)
        );
    }

    #[test]
    fn low_impact_and_unrelated_currency_create_nothing() {
        let g = gater();
        let at = Utc.with_ymd_and_hms(2025, 3, 7, 13, 30, 0).unwrap();

        let mut low = usd_event(at);
        low.importance = Importance::Medium;
        assert!(g.apply_events(&[low]).is_empty());

        let mut chf = usd_event(at);
        chf.event_id = "chf-1".into();
        chf.currency = "CHF".into();
        assert!(g.apply_events(&[chf]).is_empty());
    }

    #[test]
    fn duplicate_events_do_not_duplicate_windows() {
        let g = gater();
        let at = Utc.with_ymd_and_hms(2025, 3, 7, 13, 30, 0).unwrap();
        g.apply_events(&[usd_event(at)]);
        let again = g.apply_events(&[usd_event(at)]);
        assert!(again.is_empty());
        assert_eq!(g.window_count(), 3);
    }

    #[test]
    fn transitions_follow_the_clock() {
        let g = gater();
        let event_time = Utc.with_ymd_and_hms(2025, 3, 7, 13, 30, 0).unwrap();
        g.apply_events(&[usd_event(event_time)]);

        // Before the window: nothing is gated.
        let before = event_time - Duration::minutes(30);
        assert!(g.transition(before).is_empty());
        assert!(g.is_gated("EUR_USD", before).is_none());

        // 13:15: scheduled -> active, gating answers yes.
        let at_start = event_time - Duration::minutes(15);
        let activated = g.transition(at_start);
        assert_eq!(activated.len(), 3);
        assert!(activated.iter().all(|w| w.state == GateState::Active));
        assert!(g.is_gated("EUR_USD", at_start).is_some());
        assert!(g.is_gated("USD_JPY", at_start).is_some());

        // 13:41: past window_end, active -> cleared and dropped.
        let after = event_time + Duration::minutes(11);
        let cleared = g.transition(after);
        assert_eq!(cleared.len(), 3);
        assert!(cleared.iter().all(|w| w.state == GateState::Cleared));
        assert_eq!(g.window_count(), 0);
        assert!(g.is_gated("EUR_USD", after).is_none());
    }

    #[test]
    fn must_close_fires_at_the_offset_not_window_start() {
        let g = gater();
        let event_time = Utc.with_ymd_and_hms(2025, 3, 7, 13, 30, 0).unwrap();
        g.apply_events(&[usd_event(event_time)]);

        // Window active at 13:15 but close deadline is 13:20.
        let at_start = event_time - Duration::minutes(15);
        g.transition(at_start);
        assert!(g.is_gated("EUR_USD", at_start).is_some());
        assert!(g.must_close("EUR_USD", at_start).is_none());

        let at_deadline = event_time - Duration::minutes(10);
        assert!(g.must_close("EUR_USD", at_deadline).is_some());

        // 13:20 scenario from a 13:15 activation: an open EUR_USD long must
        // be flattened regardless of PnL.
        let at_13_20 = Utc.with_ymd_and_hms(2025, 3, 7, 13, 20, 0).unwrap();
        assert!(g.must_close("EUR_USD", at_13_20).is_some());
    }
}
