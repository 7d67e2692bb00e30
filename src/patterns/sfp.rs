// =============================================================================
// Sweep / Failed Pattern (SFP)
// =============================================================================
//
// A liquidity sweep: one bar pierces a prior swing pivot by at least
// max(0.3 x ATR, 0.6 pips) and price reclaims the pivot within 1-3 bars.
// A swept low that reclaims is a long signal; a swept high, a short.
//
// Score weights the sweeping bar's wick/body ratio (a long rejection wick is
// the point of the pattern) and how quickly and cleanly the reclaim printed.
// =============================================================================

use serde::Serialize;

use super::{PatternContext, PatternKind, PatternSignal};
use crate::indicators;
use crate::types::Direction;

/// Pivot lookback window (bars before the sweep candidate).
const PIVOT_LOOKBACK: usize = 30;
/// Pivot dominance window on each side.
const PIVOT_WING: usize = 3;
/// Pierce margin: max of this ATR fraction and the pip floor.
const PIERCE_ATR: f64 = 0.3;
const PIERCE_FLOOR_PIPS: f64 = 0.6;
/// Bars allowed for the reclaim.
const RECLAIM_BARS: usize = 3;

#[derive(Debug, Serialize)]
struct SfpMeta {
    pivot_price: f64,
    pivot_is_high: bool,
    sweep_index: usize,
    reclaim_index: usize,
    wick_body_ratio: f64,
}

pub fn detect(ctx: &PatternContext<'_>) -> PatternSignal {
    let none = PatternSignal::none(PatternKind::Sfp);
    let candles = ctx.candles;
    if candles.len() < PIVOT_LOOKBACK + RECLAIM_BARS + 2 {
        return none;
    }

    let margin = (PIERCE_ATR * ctx.atr).max(PIERCE_FLOOR_PIPS * ctx.pip_size);

    // Walk sweep candidates newest-first so the most recent setup wins.
    let mut found: Option<(usize, usize, indicators::Pivot, Direction, f64)> = None;

    'candidates: for sweep_idx in (PIVOT_LOOKBACK..candles.len() - 1).rev() {
        let history_start = sweep_idx - PIVOT_LOOKBACK;
        let pivots = indicators::swing_pivots(
            &candles[history_start..sweep_idx],
            PIVOT_WING,
            PIVOT_WING,
        );

        let sweep = &candles[sweep_idx];

        for pivot in pivots.iter().rev() {
            let (pierced, direction) = if pivot.is_high {
                (sweep.high >= pivot.price + margin, Direction::Short)
            } else {
                (sweep.low <= pivot.price - margin, Direction::Long)
            };
            if !pierced {
                continue;
            }

            // The sweep bar itself must close back on the safe side of the
            // pivot, or the reclaim must print within the next 1-3 bars.
            let reclaim_end = (sweep_idx + RECLAIM_BARS).min(candles.len() - 1);
            let reclaimed = (sweep_idx..=reclaim_end).find(|&r| {
                let close = candles[r].close;
                match direction {
                    Direction::Long => close > pivot.price,
                    Direction::Short => close < pivot.price,
                }
            });

            if let Some(reclaim_idx) = reclaimed {
                let wick = match direction {
                    Direction::Long => sweep.open.min(sweep.close) - sweep.low,
                    Direction::Short => sweep.high - sweep.open.max(sweep.close),
                };
                let body = sweep.body().max(ctx.pip_size * 0.1);
                found = Some((
                    sweep_idx,
                    reclaim_idx,
                    *pivot,
                    direction,
                    wick / body,
                ));
                break 'candidates;
            }
        }
    }

    let Some((sweep_index, reclaim_index, pivot, direction, wick_body_ratio)) = found else {
        return none;
    };

    // ── Scoring ──────────────────────────────────────────────────────────
    // Wick dominance (55): ratio of rejection wick to body, saturating at 3.
    let wick_score = 55.0 * (wick_body_ratio / 3.0).min(1.0);

    // Reclaim speed and cleanness (45): same-bar or next-bar reclaims that
    // close well clear of the pivot score highest.
    let lag = reclaim_index - sweep_index;
    let speed_score = match lag {
        0 => 1.0,
        1 => 0.85,
        2 => 0.6,
        _ => 0.4,
    };
    let reclaim_close = ctx.candles[reclaim_index].close;
    let clearance = ((reclaim_close - pivot.price).abs() / ctx.atr).min(1.0);
    let reclaim_score = 45.0 * (0.7 * speed_score + 0.3 * clearance);

    let score = (wick_score + reclaim_score).clamp(0.0, 100.0);

    PatternSignal {
        kind: PatternKind::Sfp,
        detected: true,
        direction: Some(direction),
        score,
        metadata: serde_json::to_value(SfpMeta {
            pivot_price: pivot.price,
            pivot_is_high: pivot.is_high,
            sweep_index,
            reclaim_index,
            wick_body_ratio,
        })
        .unwrap_or(serde_json::Value::Null),
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::patterns::tests::bar;
    use crate::types::{Candle, Instrument};

    /// Gently rising bars (strictly increasing lows, so no incidental pivot
    /// lows), one deep pivot low at minute 20, then a bar that sweeps it with
    /// a long lower wick.
    fn sfp_fixture(wick_depth: f64, reclaim_same_bar: bool) -> Vec<Candle> {
        let mut candles = Vec::new();
        for i in 0..36 {
            let base = 1.0850 + i as f64 * 0.00001;
            let low = if i == 20 { 1.0838 } else { base - 0.0004 };
            candles.push(bar(i, base, base + 0.0004, low, base, 50.0));
        }
        // Sweep bar at minute 36: pierces 1.0838 by wick_depth, long tail.
        let sweep_low = 1.0838 - wick_depth;
        let sweep_close = if reclaim_same_bar { 1.0850 } else { 1.0837 };
        candles.push(bar(36, 1.0852, 1.0853, sweep_low, sweep_close, 90.0));
        if !reclaim_same_bar {
            // Reclaim on the next bar.
            candles.push(bar(37, 1.0837, 1.0852, 1.0837, 1.0850, 80.0));
        }
        // Trailing bar so the sweep is not the final candle.
        let last_minute = if reclaim_same_bar { 37 } else { 38 };
        candles.push(bar(last_minute, 1.0850, 1.0854, 1.0848, 1.0851, 55.0));
        candles
    }

    fn ctx_for(candles: &[Candle]) -> PatternContext<'_> {
        let inst = Instrument::parse("EUR_USD").unwrap();
        PatternContext::prepare(&inst, candles, None).unwrap()
    }

    #[test]
    fn detects_swept_low_reclaimed_as_long() {
        let candles = sfp_fixture(0.0008, true);
        let signal = detect(&ctx_for(&candles));
        assert!(signal.detected, "metadata: {}", signal.metadata);
        assert_eq!(signal.direction, Some(Direction::Long));
        assert!(signal.score > 50.0, "score {}", signal.score);
    }

    #[test]
    fn next_bar_reclaim_also_detects() {
        let candles = sfp_fixture(0.0008, false);
        let signal = detect(&ctx_for(&candles));
        assert!(signal.detected);
        assert_eq!(signal.direction, Some(Direction::Long));
    }

    #[test]
    fn shallow_pierce_is_ignored() {
        // 0.5-pip pierce against an ~8-pip ATR: below max(0.3*ATR, 0.6 pips).
        let candles = sfp_fixture(0.00005, true);
        assert!(!detect(&ctx_for(&candles)).detected);
    }

    #[test]
    fn same_bar_reclaim_outscores_slow_reclaim() {
        let fast = detect(&ctx_for(&sfp_fixture(0.0008, true)));
        let slow = detect(&ctx_for(&sfp_fixture(0.0008, false)));
        assert!(fast.detected && slow.detected);
        assert!(fast.score > slow.score);
    }

    #[test]
    fn short_history_is_ignored() {
        let candles: Vec<Candle> = (0..10)
            .map(|i| bar(i, 1.085, 1.0855, 1.0845, 1.085, 10.0))
            .collect();
        let inst = Instrument::parse("EUR_USD").unwrap();
        // Not enough bars for ATR either; prepare fails upstream.
        assert!(PatternContext::prepare(&inst, &candles, None).is_none());
    }
}
