// =============================================================================
// Pre-Trade Gates — five hard filters ahead of any pattern work
// =============================================================================
//
// Evaluated in order: spread, volatility regime, session window, distance to
// the nearest higher-timeframe level, news blackout. Any failure rejects the
// cycle, but every gate is always evaluated so the audit record carries the
// complete picture, not just the first failure.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use crate::config::{GateParams, SessionWindow};
use crate::fetcher::MarketView;
use crate::indicators;
use crate::types::Instrument;

/// A raw-spread reading above this many pips is treated as a feed scaling
/// problem and logged, not trusted silently.
const RAW_SPREAD_SANITY_PIPS: f64 = 50.0;

/// Verdict of a single gate.
#[derive(Debug, Clone, Serialize)]
pub struct GateOutcome {
    pub name: &'static str,
    pub passed: bool,
    pub reason: String,
    pub metric: f64,
}

impl GateOutcome {
    fn pass(name: &'static str, reason: impl Into<String>, metric: f64) -> Self {
        Self {
            name,
            passed: true,
            reason: reason.into(),
            metric,
        }
    }

    fn fail(name: &'static str, reason: impl Into<String>, metric: f64) -> Self {
        Self {
            name,
            passed: false,
            reason: reason.into(),
            metric,
        }
    }
}

/// All five gate verdicts for one cycle.
#[derive(Debug, Clone, Serialize)]
pub struct GateReport {
    pub outcomes: Vec<GateOutcome>,
}

impl GateReport {
    pub fn all_passed(&self) -> bool {
        self.outcomes.iter().all(|g| g.passed)
    }

    pub fn failures(&self) -> Vec<&GateOutcome> {
        self.outcomes.iter().filter(|g| !g.passed).collect()
    }

    /// Compact "name: reason" list of every failed gate.
    pub fn failure_summary(&self) -> String {
        self.failures()
            .iter()
            .map(|g| format!("{}: {}", g.name, g.reason))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Everything the gates need for one evaluation.
pub struct GateContext<'a> {
    pub instrument: &'a Instrument,
    pub view: &'a MarketView,
    pub now: DateTime<Utc>,
    pub params: &'a GateParams,
    pub sessions: &'a [&'a SessionWindow],
    /// Active news gating window for this instrument right now?
    pub news_gated: bool,
    /// Raw scaled-ticks spread from the feed, used only when the view has no
    /// bid/ask spread.
    pub raw_spread: Option<f64>,
}

/// Run all five gates. Order is fixed; all verdicts are produced.
pub fn run_gates(ctx: &GateContext<'_>) -> GateReport {
    let outcomes = vec![
        spread_gate(ctx),
        volatility_gate(ctx),
        session_gate(ctx),
        htf_distance_gate(ctx),
        news_gate(ctx),
    ];
    GateReport { outcomes }
}

// ---------------------------------------------------------------------------
// 1. Spread
// ---------------------------------------------------------------------------

fn spread_gate(ctx: &GateContext<'_>) -> GateOutcome {
    const NAME: &str = "spread";

    let spread_pips = match (ctx.view.spread_pips, ctx.raw_spread) {
        (Some(pips), _) => pips,
        (None, Some(raw)) => {
            // Fallback conversion from scaled feed units.
            let pips = raw
                / (ctx.instrument.decimal_places_factor * ctx.instrument.pip_size);
            if pips > RAW_SPREAD_SANITY_PIPS {
                warn!(
                    instrument = %ctx.instrument.id,
                    raw,
                    pips,
                    "raw spread conversion produced an implausible value"
                );
            }
            pips
        }
        (None, None) => {
            return GateOutcome::fail(NAME, "spread_unavailable", f64::NAN);
        }
    };

    if spread_pips < 0.0 {
        return GateOutcome::fail(NAME, "crossed_book", spread_pips);
    }
    if spread_pips > ctx.params.max_spread_pips {
        return GateOutcome::fail(
            NAME,
            format!(
                "spread_too_wide ({spread_pips:.2} > {:.2} pips)",
                ctx.params.max_spread_pips
            ),
            spread_pips,
        );
    }
    GateOutcome::pass(NAME, format!("{spread_pips:.2} pips"), spread_pips)
}

// ---------------------------------------------------------------------------
// 2. Volatility regime
// ---------------------------------------------------------------------------

fn volatility_gate(ctx: &GateContext<'_>) -> GateOutcome {
    const NAME: &str = "volatility";

    let candles = &ctx.view.candles;
    let fast = indicators::atr(candles, ctx.params.atr_fast_bars);
    let slow = indicators::atr(candles, ctx.params.atr_slow_bars);

    let (Some(fast), Some(slow)) = (fast, slow) else {
        return GateOutcome::fail(NAME, "atr_unavailable (insufficient candles)", f64::NAN);
    };

    let fast_pips = ctx.instrument.to_pips(fast);
    if slow <= 0.0 {
        return GateOutcome::fail(NAME, "flat_slow_atr", 0.0);
    }

    let ratio = fast / slow;
    if ratio < ctx.params.min_atr_ratio {
        return GateOutcome::fail(
            NAME,
            format!(
                "contracting_volatility (ratio {ratio:.2} < {:.2})",
                ctx.params.min_atr_ratio
            ),
            ratio,
        );
    }
    if fast_pips < ctx.params.min_atr_pips {
        return GateOutcome::fail(
            NAME,
            format!(
                "dead_market (ATR {fast_pips:.1} < {:.1} pips)",
                ctx.params.min_atr_pips
            ),
            fast_pips,
        );
    }

    GateOutcome::pass(NAME, format!("ATR {fast_pips:.1} pips, ratio {ratio:.2}"), ratio)
}

// ---------------------------------------------------------------------------
// 3. Session window
// ---------------------------------------------------------------------------

fn session_gate(ctx: &GateContext<'_>) -> GateOutcome {
    const NAME: &str = "session";

    match ctx.sessions.iter().find(|w| w.contains(ctx.now)) {
        Some(window) => GateOutcome::pass(NAME, window.name.clone(), 1.0),
        None => GateOutcome::fail(NAME, "outside_session_windows", 0.0),
    }
}

// ---------------------------------------------------------------------------
// 4. Higher-timeframe level distance
// ---------------------------------------------------------------------------

fn htf_distance_gate(ctx: &GateContext<'_>) -> GateOutcome {
    const NAME: &str = "htf_distance";

    let Some(last) = ctx.view.candles.last() else {
        return GateOutcome::fail(NAME, "no_candles", f64::NAN);
    };

    let levels = indicators::htf_levels(&ctx.view.candles);
    let Some(distance) = indicators::nearest_level_distance(last.close, &levels) else {
        // No levels detected in the window: nothing nearby to reverse off.
        return GateOutcome::pass(NAME, "no_htf_levels_in_window", f64::MAX);
    };

    let distance_pips = ctx.instrument.to_pips(distance);
    if distance_pips < ctx.params.min_htf_distance_pips {
        GateOutcome::fail(
            NAME,
            format!(
                "too_close_to_level ({distance_pips:.1} < {:.1} pips)",
                ctx.params.min_htf_distance_pips
            ),
            distance_pips,
        )
    } else {
        GateOutcome::pass(NAME, format!("{distance_pips:.1} pips clear"), distance_pips)
    }
}

// ---------------------------------------------------------------------------
// 5. News blackout
// ---------------------------------------------------------------------------

fn news_gate(ctx: &GateContext<'_>) -> GateOutcome {
    const NAME: &str = "news";

    if ctx.news_gated {
        GateOutcome::fail(NAME, "news_blackout_active", 1.0)
    } else {
        GateOutcome::pass(NAME, "clear", 0.0)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Candle;
    use chrono::{Duration, TimeZone};

    fn instrument() -> Instrument {
        Instrument::parse("EUR_USD").unwrap()
    }

    fn sessions() -> Vec<SessionWindow> {
        vec![SessionWindow {
            name: "London".into(),
            start: "07:00".into(),
            end: "10:30".into(),
            jpy_only: false,
        }]
    }

    /// Candles with a lively ~8-pip ATR in recent bars.
    fn lively_candles() -> Vec<Candle> {
        let start = Utc.with_ymd_and_hms(2025, 3, 3, 7, 0, 0).unwrap();
        (0..60)
            .map(|i| {
                let base = 1.0850 + (i as f64 * 0.7).sin() * 0.0015;
                Candle {
                    instrument: "EUR_USD".into(),
                    timeframe: "1m".into(),
                    open_time: start + Duration::minutes(i),
                    open: base,
                    high: base + 0.0005,
                    low: base - 0.0004,
                    close: base + 0.0002,
                    volume: 40.0,
                    finalized: true,
                }
            })
            .collect()
    }

    fn view(spread_pips: Option<f64>, candles: Vec<Candle>) -> MarketView {
        MarketView {
            candles,
            bid: spread_pips.map(|_| 1.08341),
            ask: spread_pips.map(|s| 1.08341 + s * 0.0001),
            spread_pips,
            ta: None,
            order_flow: None,
            warnings: Vec::new(),
        }
    }

    fn run<'a>(
        inst: &'a Instrument,
        v: &'a MarketView,
        sessions: &'a [SessionWindow],
        now: DateTime<Utc>,
        news_gated: bool,
        raw_spread: Option<f64>,
    ) -> GateReport {
        let params = GateParams::default();
        let session_refs: Vec<&SessionWindow> = sessions.iter().collect();
        // GateContext borrows; build inline.
        run_gates(&GateContext {
            instrument: inst,
            view: v,
            now,
            params: &params,
            sessions: &session_refs,
            news_gated,
            raw_spread,
        })
    }

    #[test]
    fn all_gates_reported_even_when_multiple_fail() {
        let inst = instrument();
        let v = view(Some(9.0), Vec::new()); // wide spread, no candles
        let sessions = sessions();
        let now = Utc.with_ymd_and_hms(2025, 3, 3, 23, 0, 0).unwrap(); // outside session

        let report = run(&inst, &v, &sessions, now, true, None);
        assert_eq!(report.outcomes.len(), 5);
        assert!(!report.all_passed());
        // spread, volatility, session, news all failed and are all present.
        assert!(report.failures().len() >= 4);
        let summary = report.failure_summary();
        assert!(summary.contains("spread"));
        assert!(summary.contains("news"));
    }

    #[test]
    fn spread_gate_passes_from_bid_ask() {
        let inst = instrument();
        let v = view(Some(0.9), lively_candles());
        let report = run(
            &inst,
            &v,
            &sessions(),
            Utc.with_ymd_and_hms(2025, 3, 3, 8, 0, 0).unwrap(),
            false,
            None,
        );
        let spread = &report.outcomes[0];
        assert!(spread.passed, "{}", spread.reason);
        assert!((spread.metric - 0.9).abs() < 1e-9);
    }

    #[test]
    fn raw_spread_fallback_converts_and_fails_wide() {
        // raw 60 / (100000 * 0.0001) = 6.0 pips > 1.5 default.
        let inst = instrument();
        let v = view(None, lively_candles());
        let report = run(
            &inst,
            &v,
            &sessions(),
            Utc.with_ymd_and_hms(2025, 3, 3, 8, 0, 0).unwrap(),
            false,
            Some(60.0),
        );
        let spread = &report.outcomes[0];
        assert!(!spread.passed);
        assert!((spread.metric - 6.0).abs() < 1e-9);
        assert!(spread.reason.contains("spread_too_wide"));
    }

    #[test]
    fn missing_spread_fails_gate() {
        let inst = instrument();
        let v = view(None, lively_candles());
        let report = run(
            &inst,
            &v,
            &sessions(),
            Utc.with_ymd_and_hms(2025, 3, 3, 8, 0, 0).unwrap(),
            false,
            None,
        );
        assert!(!report.outcomes[0].passed);
        assert_eq!(report.outcomes[0].reason, "spread_unavailable");
    }

    #[test]
    fn volatility_gate_rejects_dead_market() {
        let inst = instrument();
        // 0.2-pip ranges: ATR far below the 5.5-pip floor.
        let start = Utc.with_ymd_and_hms(2025, 3, 3, 7, 0, 0).unwrap();
        let candles: Vec<Candle> = (0..60)
            .map(|i| Candle {
                instrument: "EUR_USD".into(),
                timeframe: "1m".into(),
                open_time: start + Duration::minutes(i),
                open: 1.0850,
                high: 1.08501,
                low: 1.08499,
                close: 1.0850,
                volume: 5.0,
                finalized: true,
            })
            .collect();
        let v = view(Some(0.9), candles);
        let report = run(
            &inst,
            &v,
            &sessions(),
            Utc.with_ymd_and_hms(2025, 3, 3, 8, 0, 0).unwrap(),
            false,
            None,
        );
        let vol = &report.outcomes[1];
        assert!(!vol.passed);
        assert!(vol.reason.contains("dead_market"), "{}", vol.reason);
    }

    #[test]
    fn session_gate_passes_inside_london() {
        let inst = instrument();
        let v = view(Some(0.9), lively_candles());
        let report = run(
            &inst,
            &v,
            &sessions(),
            Utc.with_ymd_and_hms(2025, 3, 3, 9, 0, 0).unwrap(),
            false,
            None,
        );
        let session = &report.outcomes[2];
        assert!(session.passed);
        assert_eq!(session.reason, "London");
    }

    #[test]
    fn news_gate_blocks_when_window_active() {
        let inst = instrument();
        let v = view(Some(0.9), lively_candles());
        let report = run(
            &inst,
            &v,
            &sessions(),
            Utc.with_ymd_and_hms(2025, 3, 3, 8, 0, 0).unwrap(),
            true,
            None,
        );
        assert!(!report.outcomes[4].passed);
        assert_eq!(report.outcomes[4].reason, "news_blackout_active");
    }
}
