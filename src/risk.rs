// =============================================================================
// Risk Engine — circuit breakers protecting capital
// =============================================================================
//
// Breakers:
//   1. Daily Loss          — halts new opens for the rest of the day once
//                            cumulative daily PnL loss breaches the limit.
//   2. Consecutive Losses  — pauses new opens for a cooldown after a losing
//                            streak; the streak counter restarts afterwards.
//   3. Trade Limit         — daily trade-count cap.
//
// Daily statistics reset automatically when the UTC date rolls over. Every
// method takes `now` explicitly so the monitor loop and tests share one
// clock.
// =============================================================================

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Snapshot of a single breaker for the control surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerInfo {
    pub name: String,
    pub current: f64,
    pub limit: f64,
    pub tripped: bool,
}

/// Serializable snapshot of the full risk state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskState {
    pub daily_pnl: f64,
    pub daily_pnl_pct: f64,
    pub consecutive_losses: u32,
    pub daily_trades: u32,
    pub daily_wins: u32,
    pub daily_losses: u32,
    pub halted_for_day: bool,
    pub paused_until: Option<DateTime<Utc>>,
    pub breakers: Vec<BreakerInfo>,
    pub current_date: String,
}

struct Inner {
    daily_pnl: f64,
    consecutive_losses: u32,
    daily_trades: u32,
    daily_wins: u32,
    daily_losses: u32,
    current_date: String,
    paused_until: Option<DateTime<Utc>>,
    halted_for_day: bool,
}

pub struct RiskEngine {
    state: RwLock<Inner>,
    /// Session starting equity for percentage math.
    capital: f64,
    /// Daily loss limit as a fraction (0.03 = 3 %).
    max_daily_loss_pct: f64,
    max_consecutive_losses: u32,
    max_daily_trades: u32,
    cooldown: Duration,
}

impl RiskEngine {
    pub fn new(
        capital: f64,
        max_daily_loss_pct: f64,
        max_consecutive_losses: u32,
        max_daily_trades: u32,
        cooldown: Duration,
    ) -> Self {
        info!(
            capital,
            max_daily_loss_pct,
            max_consecutive_losses,
            max_daily_trades,
            cooldown_secs = cooldown.num_seconds(),
            "risk engine initialised"
        );

        Self {
            state: RwLock::new(Inner {
                daily_pnl: 0.0,
                consecutive_losses: 0,
                daily_trades: 0,
                daily_wins: 0,
                daily_losses: 0,
                current_date: String::new(),
                paused_until: None,
                halted_for_day: false,
            }),
            capital,
            max_daily_loss_pct,
            max_consecutive_losses,
            max_daily_trades,
            cooldown,
        }
    }

    // -------------------------------------------------------------------------
    // Trade recording
    // -------------------------------------------------------------------------

    /// Record the realized PnL of a completed trade.
    pub fn record_trade_result(&self, pnl: f64, now: DateTime<Utc>) {
        self.maybe_reset_daily(now);
        let mut s = self.state.write();

        s.daily_pnl += pnl;
        s.daily_trades += 1;

        if pnl >= 0.0 {
            s.daily_wins += 1;
            s.consecutive_losses = 0;
        } else {
            s.daily_losses += 1;
            s.consecutive_losses += 1;
        }

        if s.consecutive_losses >= self.max_consecutive_losses {
            let until = now + self.cooldown;
            warn!(
                losses = s.consecutive_losses,
                until = %until,
                "consecutive-loss breaker tripped — pausing new opens"
            );
            s.paused_until = Some(until);
            s.consecutive_losses = 0;
        }

        let loss_limit = self.max_daily_loss_pct * self.capital;
        if -s.daily_pnl >= loss_limit && !s.halted_for_day {
            warn!(
                daily_pnl = s.daily_pnl,
                limit = loss_limit,
                "daily-loss breaker tripped — halting opens until next session"
            );
            s.halted_for_day = true;
        }

        debug!(
            pnl,
            daily_pnl = s.daily_pnl,
            consecutive_losses = s.consecutive_losses,
            daily_trades = s.daily_trades,
            "trade result recorded"
        );
    }

    // -------------------------------------------------------------------------
    // Pre-open gate
    // -------------------------------------------------------------------------

    /// Whether a new position may be opened at `now`. Returns `(false,
    /// Some(reason))` when a breaker blocks.
    pub fn can_open(&self, now: DateTime<Utc>) -> (bool, Option<String>) {
        self.maybe_reset_daily(now);
        let s = self.state.read();

        if s.halted_for_day {
            return (
                false,
                Some(format!(
                    "daily loss limit reached ({:.2} against {:.2})",
                    s.daily_pnl,
                    -self.max_daily_loss_pct * self.capital
                )),
            );
        }

        if let Some(until) = s.paused_until {
            if now < until {
                return (
                    false,
                    Some(format!("loss-streak cooldown active until {until}")),
                );
            }
        }

        if s.daily_trades >= self.max_daily_trades {
            return (
                false,
                Some(format!(
                    "daily trade cap reached ({} of {})",
                    s.daily_trades, self.max_daily_trades
                )),
            );
        }

        (true, None)
    }

    // -------------------------------------------------------------------------
    // Snapshot
    // -------------------------------------------------------------------------

    pub fn get_state(&self, now: DateTime<Utc>) -> RiskState {
        self.maybe_reset_daily(now);
        let s = self.state.read();

        let daily_loss_pct = if self.capital > 0.0 {
            ((-s.daily_pnl).max(0.0) / self.capital) * 100.0
        } else {
            0.0
        };

        let breakers = vec![
            BreakerInfo {
                name: "Daily Loss".into(),
                current: daily_loss_pct,
                limit: self.max_daily_loss_pct * 100.0,
                tripped: s.halted_for_day,
            },
            BreakerInfo {
                name: "Loss Streak".into(),
                current: s.consecutive_losses as f64,
                limit: self.max_consecutive_losses as f64,
                tripped: s.paused_until.is_some_and(|until| now < until),
            },
            BreakerInfo {
                name: "Trade Limit".into(),
                current: s.daily_trades as f64,
                limit: self.max_daily_trades as f64,
                tripped: s.daily_trades >= self.max_daily_trades,
            },
        ];

        RiskState {
            daily_pnl: s.daily_pnl,
            daily_pnl_pct: if self.capital > 0.0 {
                (s.daily_pnl / self.capital) * 100.0
            } else {
                0.0
            },
            consecutive_losses: s.consecutive_losses,
            daily_trades: s.daily_trades,
            daily_wins: s.daily_wins,
            daily_losses: s.daily_losses,
            halted_for_day: s.halted_for_day,
            paused_until: s.paused_until,
            breakers,
            current_date: s.current_date.clone(),
        }
    }

    // -------------------------------------------------------------------------
    // Daily reset
    // -------------------------------------------------------------------------

    fn maybe_reset_daily(&self, now: DateTime<Utc>) {
        let today = now.format("%Y-%m-%d").to_string();
        {
            let s = self.state.read();
            if s.current_date == today {
                return;
            }
        }
        let mut s = self.state.write();
        // Re-check under the write lock; another thread may have reset.
        if s.current_date != today {
            if !s.current_date.is_empty() {
                info!(
                    old_date = %s.current_date,
                    new_date = %today,
                    "date rolled — resetting daily risk counters"
                );
            }
            s.daily_pnl = 0.0;
            s.consecutive_losses = 0;
            s.daily_trades = 0;
            s.daily_wins = 0;
            s.daily_losses = 0;
            s.halted_for_day = false;
            s.paused_until = None;
            s.current_date = today;
        }
    }
}

impl std::fmt::Debug for RiskEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiskEngine")
            .field("capital", &self.capital)
            .field("max_daily_loss_pct", &self.max_daily_loss_pct)
            .field("max_consecutive_losses", &self.max_consecutive_losses)
            .field("max_daily_trades", &self.max_daily_trades)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn engine() -> RiskEngine {
        RiskEngine::new(1000.0, 0.03, 5, 40, Duration::minutes(30))
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 3, 9, 0, 0).unwrap()
    }

    #[test]
    fn fresh_engine_allows_opens() {
        let (ok, reason) = engine().can_open(t0());
        assert!(ok, "{reason:?}");
    }

    #[test]
    fn loss_streak_pauses_then_recovers() {
        let risk = engine();
        let now = t0();
        for _ in 0..5 {
            risk.record_trade_result(-2.0, now);
        }

        let (ok, reason) = risk.can_open(now + Duration::minutes(1));
        assert!(!ok);
        assert!(reason.unwrap().contains("cooldown"));

        // After the 30-minute cooldown, opens resume.
        let (ok, _) = risk.can_open(now + Duration::minutes(31));
        assert!(ok);
    }

    #[test]
    fn win_resets_streak() {
        let risk = engine();
        let now = t0();
        for _ in 0..4 {
            risk.record_trade_result(-2.0, now);
        }
        risk.record_trade_result(5.0, now);
        risk.record_trade_result(-2.0, now);

        let (ok, _) = risk.can_open(now + Duration::minutes(1));
        assert!(ok, "streak of 1 after a win must not trip");
    }

    #[test]
    fn daily_loss_halts_until_next_day() {
        let risk = engine();
        let now = t0();
        risk.record_trade_result(-31.0, now); // > 3% of 1000

        let (ok, reason) = risk.can_open(now + Duration::hours(1));
        assert!(!ok);
        assert!(reason.unwrap().contains("daily loss"));

        // Next UTC day: counters reset, trading resumes.
        let tomorrow = now + Duration::days(1);
        let (ok, _) = risk.can_open(tomorrow);
        assert!(ok);
        assert!((risk.get_state(tomorrow).daily_pnl - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn trade_cap_blocks_after_limit() {
        let risk = RiskEngine::new(1000.0, 0.5, 50, 3, Duration::minutes(30));
        let now = t0();
        for _ in 0..3 {
            risk.record_trade_result(0.5, now);
        }
        let (ok, reason) = risk.can_open(now);
        assert!(!ok);
        assert!(reason.unwrap().contains("trade cap"));
    }

    #[test]
    fn snapshot_reports_breakers() {
        let risk = engine();
        let now = t0();
        risk.record_trade_result(-10.0, now);

        let state = risk.get_state(now);
        assert_eq!(state.daily_trades, 1);
        assert_eq!(state.daily_losses, 1);
        assert!((state.daily_pnl + 10.0).abs() < f64::EPSILON);
        assert_eq!(state.breakers.len(), 3);
        assert!(!state.breakers[0].tripped);
        assert!((state.daily_pnl_pct + 1.0).abs() < 1e-9);
    }
}
