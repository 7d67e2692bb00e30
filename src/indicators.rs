// =============================================================================
// Indicator math shared by gates and pattern detectors
// =============================================================================
//
// True Range (TR) for each bar:
//   TR = max(H - L, |H - prevClose|, |L - prevClose|)
//
// ATR is the smoothed average of TR using Wilder's method:
//   ATR_0   = SMA of first `period` TR values
//   ATR_t   = (ATR_{t-1} * (period - 1) + TR_t) / period
//
// All thresholds downstream are ATR-normalized so they generalise across
// instruments.
// =============================================================================

use chrono::{Duration, DurationRound};

use crate::types::Candle;

/// Compute the most recent ATR value from a slice of OHLCV candles (oldest
/// first) using Wilder's smoothing method.
///
/// Returns `None` when `period` is zero, there are fewer than `period + 1`
/// candles, or any intermediate value is non-finite.
pub fn atr(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < period + 1 {
        return None;
    }

    let mut tr_values: Vec<f64> = Vec::with_capacity(candles.len() - 1);
    for i in 1..candles.len() {
        tr_values.push(true_range(&candles[i], candles[i - 1].close));
    }

    if tr_values.len() < period {
        return None;
    }

    let seed: f64 = tr_values[..period].iter().sum::<f64>() / period as f64;
    if !seed.is_finite() {
        return None;
    }

    let period_f = period as f64;
    let mut atr = seed;
    for &tr in &tr_values[period..] {
        atr = (atr * (period_f - 1.0) + tr) / period_f;
        if !atr.is_finite() {
            return None;
        }
    }

    atr.is_finite().then_some(atr)
}

/// Single-bar true range against the previous close.
pub fn true_range(candle: &Candle, prev_close: f64) -> f64 {
    let hl = candle.high - candle.low;
    let hc = (candle.high - prev_close).abs();
    let lc = (candle.low - prev_close).abs();
    hl.max(hc).max(lc)
}

/// Z-score of the bar at `index` against the trailing `lookback` bars before
/// it. Returns `None` when there is not enough history or the baseline has
/// zero variance.
pub fn volume_zscore_at(candles: &[Candle], index: usize, lookback: usize) -> Option<f64> {
    if index < lookback || index >= candles.len() || lookback < 2 {
        return None;
    }

    let base = &candles[index - lookback..index];

    let mean = base.iter().map(|c| c.volume).sum::<f64>() / base.len() as f64;
    let var = base
        .iter()
        .map(|c| (c.volume - mean).powi(2))
        .sum::<f64>()
        / base.len() as f64;
    let std = var.sqrt();

    if std <= f64::EPSILON {
        return None;
    }

    Some((candles[index].volume - mean) / std)
}

/// Z-score of the most recent bar's volume (see [`volume_zscore_at`]).
pub fn volume_zscore(candles: &[Candle], lookback: usize) -> Option<f64> {
    if candles.is_empty() {
        return None;
    }
    volume_zscore_at(candles, candles.len() - 1, lookback)
}

// ---------------------------------------------------------------------------
// Pivots and higher-timeframe levels
// ---------------------------------------------------------------------------

/// A swing pivot: a bar whose high (or low) dominates `left` bars before and
/// `right` bars after it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pivot {
    pub index: usize,
    pub price: f64,
    pub is_high: bool,
}

/// Scan for swing pivots using a left/right dominance window.
pub fn swing_pivots(candles: &[Candle], left: usize, right: usize) -> Vec<Pivot> {
    let mut pivots = Vec::new();
    if candles.len() < left + right + 1 {
        return pivots;
    }

    for i in left..candles.len() - right {
        let high = candles[i].high;
        let low = candles[i].low;

        let is_pivot_high = candles[i - left..i].iter().all(|c| c.high < high)
            && candles[i + 1..=i + right].iter().all(|c| c.high <= high);
        let is_pivot_low = candles[i - left..i].iter().all(|c| c.low > low)
            && candles[i + 1..=i + right].iter().all(|c| c.low >= low);

        if is_pivot_high {
            pivots.push(Pivot {
                index: i,
                price: high,
                is_high: true,
            });
        }
        if is_pivot_low {
            pivots.push(Pivot {
                index: i,
                price: low,
                is_high: false,
            });
        }
    }

    pivots
}

/// Aggregate 1-minute candles into `minutes`-minute bars. Partial trailing
/// buckets are kept (they still carry usable extremes for level detection).
pub fn aggregate_candles(candles: &[Candle], minutes: i64) -> Vec<Candle> {
    let mut out: Vec<Candle> = Vec::new();
    let span = Duration::minutes(minutes);

    for c in candles {
        let bucket = c
            .open_time
            .duration_trunc(span)
            .unwrap_or(c.open_time);

        match out.last_mut() {
            Some(last) if last.open_time == bucket => {
                if c.high > last.high {
                    last.high = c.high;
                }
                if c.low < last.low {
                    last.low = c.low;
                }
                last.close = c.close;
                last.volume += c.volume;
            }
            _ => {
                let mut agg = c.clone();
                agg.open_time = bucket;
                agg.timeframe = format!("{minutes}m");
                out.push(agg);
            }
        }
    }

    out
}

/// Support/resistance levels from a higher timeframe: aggregate the 1-minute
/// window to 15-minute bars, then collect 2-left/2-right swing pivot prices.
pub fn htf_levels(candles_1m: &[Candle]) -> Vec<f64> {
    let htf = aggregate_candles(candles_1m, 15);
    swing_pivots(&htf, 2, 2).into_iter().map(|p| p.price).collect()
}

/// Distance from `price` to the nearest level, or `None` when no levels
/// exist.
pub fn nearest_level_distance(price: f64, levels: &[f64]) -> Option<f64> {
    levels
        .iter()
        .map(|l| (price - l).abs())
        .min_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
}
