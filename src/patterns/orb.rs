// =============================================================================
// Opening-Range Breakout (ORB)
// =============================================================================
//
// The opening range is the first 10 one-minute bars of the current session.
// A valid setup needs:
//   * OR width within [1.2, 4.0] x ATR (too tight = noise, too wide = spent)
//   * a close beyond the OR boundary by max(0.5 x ATR, 0.8 pips)
//   * a retest of the boundary within the next 3 bars
//   * volume z-score >= 1.0 over the trailing 60 bars
//
// Score = pattern quality (40) + structure/location (35) + activity (25).
// =============================================================================

use serde::Serialize;

use super::{PatternContext, PatternKind, PatternSignal};
use crate::types::Direction;

/// Bars in the opening range.
const OR_BARS: usize = 10;
/// OR width bounds as ATR multiples.
const MIN_WIDTH_ATR: f64 = 1.2;
const MAX_WIDTH_ATR: f64 = 4.0;
/// Breakout margin: max of this ATR fraction and the pip floor.
const BREAKOUT_ATR: f64 = 0.5;
const BREAKOUT_FLOOR_PIPS: f64 = 0.8;
/// Bars allowed between breakout and retest.
const RETEST_BARS: usize = 3;
/// Minimum volume z-score.
const MIN_VOLUME_Z: f64 = 1.0;

#[derive(Debug, Serialize)]
struct OrbMeta {
    or_high: f64,
    or_low: f64,
    width_atr: f64,
    breakout_index: usize,
    retest_index: usize,
    volume_z: f64,
}

pub fn detect(ctx: &PatternContext<'_>) -> PatternSignal {
    let none = PatternSignal::none(PatternKind::Orb);

    let Some(session_start) = ctx.session_start else {
        return none;
    };
    let Some(start) = ctx
        .candles
        .iter()
        .position(|c| c.open_time >= session_start)
    else {
        return none;
    };
    if ctx.candles.len() < start + OR_BARS + 2 {
        return none;
    }

    let or = &ctx.candles[start..start + OR_BARS];
    let or_high = or.iter().map(|c| c.high).fold(f64::MIN, f64::max);
    let or_low = or.iter().map(|c| c.low).fold(f64::MAX, f64::min);
    let width = or_high - or_low;
    let width_atr = width / ctx.atr;

    if !(MIN_WIDTH_ATR..=MAX_WIDTH_ATR).contains(&width_atr) {
        return none;
    }

    let margin = (BREAKOUT_ATR * ctx.atr).max(BREAKOUT_FLOOR_PIPS * ctx.pip_size);

    // Latest qualifying breakout-with-retest wins. Volume expansion is
    // measured on the breakout bar itself.
    let mut best: Option<(usize, usize, Direction, f64, f64)> = None;
    for b in (start + OR_BARS)..ctx.candles.len() {
        let bar = &ctx.candles[b];

        let (direction, boundary, beyond) = if bar.close > or_high + margin {
            (Direction::Long, or_high, bar.close - or_high)
        } else if bar.close < or_low - margin {
            (Direction::Short, or_low, or_low - bar.close)
        } else {
            continue;
        };

        let Some(z) = crate::indicators::volume_zscore_at(ctx.candles, b, super::VOLUME_Z_LOOKBACK)
        else {
            continue;
        };
        if z < MIN_VOLUME_Z {
            continue;
        }

        let retest_end = (b + RETEST_BARS).min(ctx.candles.len() - 1);
        let retest = (b + 1..=retest_end).find(|&r| match direction {
            Direction::Long => ctx.candles[r].low <= boundary,
            Direction::Short => ctx.candles[r].high >= boundary,
        });

        if let Some(r) = retest {
            best = Some((b, r, direction, beyond, z));
        }
    }

    let Some((breakout_index, retest_index, direction, beyond, volume_z)) = best else {
        return none;
    };

    // ── Scoring ──────────────────────────────────────────────────────────
    // Quality (40): breakout conviction and a width sweet spot mid-band.
    let beyond_score = ((beyond - margin).max(0.0) / (0.5 * ctx.atr)).min(1.0);
    let width_center = (MIN_WIDTH_ATR + MAX_WIDTH_ATR) / 2.0;
    let width_score = (1.0 - (width_atr - width_center).abs() / (width_center - MIN_WIDTH_ATR))
        .clamp(0.0, 1.0);
    let quality = 40.0 * (0.55 * beyond_score + 0.45 * width_score);

    // Structure (35): the retest should hold the boundary, not slice through.
    let retest_bar = &ctx.candles[retest_index];
    let held = match direction {
        Direction::Long => retest_bar.close >= or_high,
        Direction::Short => retest_bar.close <= or_low,
    };
    let structure = 35.0 * if held { 1.0 } else { 0.6 };

    // Activity (25): scaled volume expansion.
    let activity = 25.0 * (volume_z / 3.0).min(1.0);

    let score = (quality + structure + activity).clamp(0.0, 100.0);

    PatternSignal {
        kind: PatternKind::Orb,
        detected: true,
        direction: Some(direction),
        score,
        metadata: serde_json::to_value(OrbMeta {
            or_high,
            or_low,
            width_atr,
            breakout_index,
            retest_index,
            volume_z,
        })
        .unwrap_or(serde_json::Value::Null),
    }
}
