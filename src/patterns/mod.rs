// =============================================================================
// Price-action pattern detectors
// =============================================================================
//
// Three independent detectors over the last N one-minute candles. Each
// returns a 0-100 score; the cycle's final pattern score is the max across
// detected patterns. Thresholds are ATR-normalized so the same detector
// works on EUR_USD and USD_JPY alike.
// =============================================================================

pub mod impulse;
pub mod orb;
pub mod sfp;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::indicators;
use crate::types::{Candle, Direction, Instrument};

/// ATR period shared by all detectors.
pub const ATR_PERIOD: usize = 14;
/// Volume z-score lookback shared by all detectors.
pub const VOLUME_Z_LOOKBACK: usize = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PatternKind {
    Orb,
    Sfp,
    Impulse,
}

impl PatternKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Orb => "ORB",
            Self::Sfp => "SFP",
            Self::Impulse => "IMPULSE",
        }
    }
}

impl std::fmt::Display for PatternKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One detector's verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternSignal {
    pub kind: PatternKind,
    pub detected: bool,
    pub direction: Option<Direction>,
    /// 0-100.
    pub score: f64,
    pub metadata: serde_json::Value,
}

impl PatternSignal {
    pub fn none(kind: PatternKind) -> Self {
        Self {
            kind,
            detected: false,
            direction: None,
            score: 0.0,
            metadata: serde_json::Value::Null,
        }
    }
}

/// Shared inputs prepared once per cycle.
pub struct PatternContext<'a> {
    pub candles: &'a [Candle],
    /// ATR(14) over the window, in price units.
    pub atr: f64,
    /// 60-bar volume z-score of the latest bar.
    pub volume_z: Option<f64>,
    /// Open of the current trading session, when known.
    pub session_start: Option<DateTime<Utc>>,
    pub pip_size: f64,
}

impl<'a> PatternContext<'a> {
    /// Build the context from a candle window. Returns `None` when ATR is
    /// not computable (detectors are meaningless without it).
    pub fn prepare(
        instrument: &Instrument,
        candles: &'a [Candle],
        session_start: Option<DateTime<Utc>>,
    ) -> Option<Self> {
        let atr = indicators::atr(candles, ATR_PERIOD)?;
        if atr <= 0.0 {
            return None;
        }
        Some(Self {
            candles,
            atr,
            volume_z: indicators::volume_zscore(candles, VOLUME_Z_LOOKBACK),
            session_start,
            pip_size: instrument.pip_size,
        })
    }
}

/// Results of running every detector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternScan {
    pub signals: Vec<PatternSignal>,
}

impl PatternScan {
    /// Highest-scoring detected pattern, if any.
    pub fn best(&self) -> Option<&PatternSignal> {
        self.signals
            .iter()
            .filter(|s| s.detected)
            .max_by(|a, b| a.score.partial_cmp(&b.score).unwrap_or(std::cmp::Ordering::Equal))
    }

    /// Blended score: max across detected patterns, 0 when nothing fired.
    pub fn final_score(&self) -> f64 {
        self.best().map(|s| s.score).unwrap_or(0.0)
    }
}

/// Run all three detectors over the prepared context.
pub fn detect_all(ctx: &PatternContext<'_>) -> PatternScan {
    PatternScan {
        signals: vec![orb::detect(ctx), sfp::detect(ctx), impulse::detect(ctx)],
    }
}
