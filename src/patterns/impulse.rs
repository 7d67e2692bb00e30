// =============================================================================
// Impulse-Pullback
// =============================================================================
//
// Trend continuation: a directional impulse (3-bar true-range sum >= 1.6 x
// ATR, or a single bar >= 1.2 x ATR), a pullback retracing 15-38% of the
// impulse range, and a rejection candle (wick pointing with the impulse) at
// the pullback terminus.
// =============================================================================

use serde::Serialize;

use super::{PatternContext, PatternKind, PatternSignal};
use crate::indicators::true_range;
use crate::types::Direction;

/// 3-bar impulse threshold.
const IMPULSE_3BAR_ATR: f64 = 1.6;
/// Single-bar impulse threshold.
const IMPULSE_1BAR_ATR: f64 = 1.2;
/// Pullback retracement bounds (fraction of impulse range).
const MIN_RETRACE: f64 = 0.15;
const MAX_RETRACE: f64 = 0.38;
/// Longest pullback considered.
const MAX_PULLBACK_BARS: usize = 5;
/// Rejection wick floor as an ATR fraction.
const MIN_REJECTION_WICK_ATR: f64 = 0.25;

#[derive(Debug, Serialize)]
struct ImpulseMeta {
    impulse_end: usize,
    impulse_range_atr: f64,
    retrace_fraction: f64,
    rejection_wick_atr: f64,
}

pub fn detect(ctx: &PatternContext<'_>) -> PatternSignal {
    let none = PatternSignal::none(PatternKind::Impulse);
    let candles = ctx.candles;
    if candles.len() < 10 {
        return none;
    }

    let last = candles.len() - 1;

    // The pullback runs from just after the impulse to the latest bar. Try
    // the shortest pullback first so a fresh setup wins over an old one.
    for pullback_len in 1..=MAX_PULLBACK_BARS.min(last.saturating_sub(4)) {
        let e = last - pullback_len; // impulse end index
        if e < 3 {
            break;
        }

        // ── Impulse qualification ────────────────────────────────────────
        let single_range = candles[e].range();
        let three_sum: f64 = (e - 2..=e)
            .map(|i| true_range(&candles[i], candles[i - 1].close))
            .sum();

        let (qualified, impulse_start) = if single_range >= IMPULSE_1BAR_ATR * ctx.atr {
            (true, e)
        } else if three_sum >= IMPULSE_3BAR_ATR * ctx.atr {
            (true, e - 2)
        } else {
            (false, e)
        };
        if !qualified {
            continue;
        }

        // One direction across the impulse.
        let net = candles[e].close - candles[impulse_start].open;
        let direction = if net > 0.0 {
            Direction::Long
        } else {
            Direction::Short
        };
        // Every impulse bar's body must point the same way; dojis break the
        // "one direction" requirement.
        let consistent = (impulse_start..=e).all(|i| match direction {
            Direction::Long => candles[i].close > candles[i].open,
            Direction::Short => candles[i].close < candles[i].open,
        });
        if !consistent {
            continue;
        }

        let (impulse_range, extreme) = match direction {
            Direction::Long => (
                candles[e].high - candles[impulse_start].low,
                candles[e].high,
            ),
            Direction::Short => (
                candles[impulse_start].high - candles[e].low,
                candles[e].low,
            ),
        };
        if impulse_range <= 0.0 {
            continue;
        }

        // ── Pullback depth ───────────────────────────────────────────────
        let pullback = &candles[e + 1..=last];
        let (terminus_extreme, retrace) = match direction {
            Direction::Long => {
                let low = pullback.iter().map(|c| c.low).fold(f64::MAX, f64::min);
                (low, (extreme - low) / impulse_range)
            }
            Direction::Short => {
                let high = pullback.iter().map(|c| c.high).fold(f64::MIN, f64::max);
                (high, (high - extreme) / impulse_range)
            }
        };
        if !(MIN_RETRACE..=MAX_RETRACE).contains(&retrace) {
            continue;
        }

        // ── Rejection at the terminus ────────────────────────────────────
        // The bar that printed the pullback extreme must reject it with a
        // wick pointing back in the impulse direction.
        let terminus_bar = pullback
            .iter()
            .find(|c| match direction {
                Direction::Long => (c.low - terminus_extreme).abs() < f64::EPSILON,
                Direction::Short => (c.high - terminus_extreme).abs() < f64::EPSILON,
            })
            .unwrap_or(&candles[last]);

        let wick = match direction {
            Direction::Long => terminus_bar.open.min(terminus_bar.close) - terminus_bar.low,
            Direction::Short => terminus_bar.high - terminus_bar.open.max(terminus_bar.close),
        };
        if wick < MIN_REJECTION_WICK_ATR * ctx.atr || wick < 0.8 * terminus_bar.body() {
            continue;
        }

        // ── Scoring ──────────────────────────────────────────────────────
        let impulse_range_atr = impulse_range / ctx.atr;
        let strength = 40.0 * (impulse_range_atr / 2.2).min(1.0);

        let retrace_center = (MIN_RETRACE + MAX_RETRACE) / 2.0;
        let retrace_half_band = (MAX_RETRACE - MIN_RETRACE) / 2.0;
        let retrace_quality =
            35.0 * (1.0 - (retrace - retrace_center).abs() / retrace_half_band).clamp(0.0, 1.0);

        let wick_atr = wick / ctx.atr;
        let rejection = 25.0 * (wick_atr / 0.75).min(1.0);

        let score = (strength + retrace_quality + rejection).clamp(0.0, 100.0);

        return PatternSignal {
            kind: PatternKind::Impulse,
            detected: true,
            direction: Some(direction),
            score,
            metadata: serde_json::to_value(ImpulseMeta {
                impulse_end: e,
                impulse_range_atr,
                retrace_fraction: retrace,
                rejection_wick_atr: wick_atr,
            })
            .unwrap_or(serde_json::Value::Null),
        };
    }

    none
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::patterns::tests::bar;
    use crate::types::{Candle, Instrument};

    /// Quiet baseline, one strong bullish bar, then a shallow pullback ending
    /// in a lower-wick rejection candle.
    fn impulse_fixture(retrace_fraction: f64, with_rejection_wick: bool) -> Vec<Candle> {
        let mut candles = Vec::new();
        for i in 0..30 {
            let base = 1.0850 + (i as f64 * 0.6).sin() * 0.0002;
            candles.push(bar(i, base, base + 0.0004, base - 0.0004, base, 50.0));
        }
        // Impulse bar (minute 30): 1.0850 -> 1.0870, ~20 pips vs ~8-pip ATR.
        candles.push(bar(30, 1.0851, 1.0870, 1.0850, 1.0869, 200.0));
        // Pullback terminus (minute 31): retraces the requested fraction.
        let impulse_high = 1.0870;
        let impulse_range = impulse_high - 1.0850;
        let terminus_low = impulse_high - impulse_range * retrace_fraction;
        let (open, close) = if with_rejection_wick {
            // Small body near the top of the bar, long lower tail.
            (1.08685, 1.08680)
        } else {
            // Full-body bear bar: close sits on the low, no tail.
            (1.08685, terminus_low)
        };
        candles.push(bar(31, open, 1.0869, terminus_low, close, 70.0));
        candles
    }

    fn ctx_for(candles: &[Candle]) -> PatternContext<'_> {
        let inst = Instrument::parse("EUR_USD").unwrap();
        PatternContext::prepare(&inst, candles, None).unwrap()
    }

    #[test]
    fn detects_bullish_impulse_with_shallow_pullback() {
        let candles = impulse_fixture(0.25, true);
        let signal = detect(&ctx_for(&candles));
        assert!(signal.detected, "metadata: {}", signal.metadata);
        assert_eq!(signal.direction, Some(Direction::Long));
        assert!(signal.score > 55.0, "score {}", signal.score);
    }

    #[test]
    fn deep_retrace_is_rejected() {
        // 60% retrace kills the continuation premise.
        let candles = impulse_fixture(0.60, true);
        assert!(!detect(&ctx_for(&candles)).detected);
    }

    #[test]
    fn tiny_retrace_is_rejected() {
        let candles = impulse_fixture(0.05, true);
        assert!(!detect(&ctx_for(&candles)).detected);
    }

    #[test]
    fn missing_rejection_wick_is_rejected() {
        let candles = impulse_fixture(0.25, false);
        assert!(!detect(&ctx_for(&candles)).detected);
    }

    #[test]
    fn quiet_tape_detects_nothing() {
        let candles: Vec<Candle> = (0..40)
            .map(|i| {
                let base = 1.0850 + (i as f64 * 0.6).sin() * 0.0002;
                bar(i, base, base + 0.0004, base - 0.0004, base, 50.0)
            })
            .collect();
        assert!(!detect(&ctx_for(&candles)).detected);
    }
}
