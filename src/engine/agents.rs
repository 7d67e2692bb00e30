// =============================================================================
// Tiered agent debate — two analysts + validator, two risk agents + judge
// =============================================================================
//
// Every agent speaks strict JSON; replies are validated into typed structs
// (with repair re-prompting in the LLM layer) before anything downstream
// reads them. The full exchange is captured in an AgentTrace for the signal
// audit log.
//
// Analyst tier:
//   fast-momentum  — candles + order flow        -> setup / direction / strength
//   technical      — candles + TA consensus      -> support or reject
//   validator      — merges both + pattern       -> approved / levels / confidence
//
// Risk tier (runs for every approval so sizing lives in one place):
//   aggressive     — the case for full size
//   conservative   — concerns and size reduction
//   risk judge     — execute + confidence tier (1 = full, 2 = 0.75x, 3 = skip)
// =============================================================================

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::drivers::llm::complete_typed;
use crate::drivers::{ChatMessage, LlmDriver};
use crate::fetcher::MarketView;
use crate::patterns::PatternSignal;
use crate::types::{Direction, Instrument};

/// Tier-2 size haircut applied by the risk judge.
const TIER2_SIZE_FACTOR: f64 = 0.75;

// ---------------------------------------------------------------------------
// Typed agent outputs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MomentumView {
    pub setup: String,
    /// "long", "short", or "none".
    pub direction: String,
    /// [0, 1].
    pub strength: f64,
    pub reasoning: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TechnicalView {
    /// "support" or "reject".
    pub stance: String,
    /// [0, 1].
    pub confidence: f64,
    pub reasoning: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorVerdict {
    pub approved: bool,
    /// "long" or "short"; meaningful only when approved.
    pub direction: String,
    /// [0, 1].
    pub confidence: f64,
    pub tp_pips: f64,
    pub sl_pips: f64,
    pub reasoning: String,
}

impl ValidatorVerdict {
    pub fn parsed_direction(&self) -> Option<Direction> {
        self.direction.parse().ok()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskCase {
    /// Proposed multiplier on the base size.
    pub size_multiplier: f64,
    pub concerns: Vec<String>,
    pub reasoning: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskVerdict {
    pub execute: bool,
    /// Confidence tier: 1 = full size, 2 = reduced, 3 = skip.
    pub tier: u8,
    pub reasoning: String,
}

impl RiskVerdict {
    /// Final lot size for the given base. Tier 3 (or a non-execute verdict)
    /// sizes to zero.
    pub fn size_for(&self, base_size_lots: f64) -> f64 {
        if !self.execute {
            return 0.0;
        }
        match self.tier {
            1 => base_size_lots,
            2 => base_size_lots * TIER2_SIZE_FACTOR,
            _ => 0.0,
        }
    }
}

/// Full debate transcript persisted with the signal.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentTrace {
    pub momentum: Option<MomentumView>,
    pub technical: Option<TechnicalView>,
    pub validator: Option<ValidatorVerdict>,
    pub aggressive: Option<RiskCase>,
    pub conservative: Option<RiskCase>,
    pub risk_judge: Option<RiskVerdict>,
}

impl AgentTrace {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

// ---------------------------------------------------------------------------
// Prompt assembly
// ---------------------------------------------------------------------------

/// Compact plain-text market brief shared by all prompts.
fn market_brief(instrument: &Instrument, view: &MarketView) -> String {
    let mut brief = format!("Instrument: {}\n", instrument.id);

    if let (Some(bid), Some(ask), Some(spread)) = (view.bid, view.ask, view.spread_pips) {
        brief.push_str(&format!(
            "Quote: bid {bid:.5} / ask {ask:.5} (spread {spread:.2} pips)\n"
        ));
    }

    let recent: Vec<String> = view
        .candles
        .iter()
        .rev()
        .take(10)
        .rev()
        .map(|c| {
            format!(
                "{} o={:.5} h={:.5} l={:.5} c={:.5} v={:.0}",
                c.open_time.format("%H:%M"),
                c.open,
                c.high,
                c.low,
                c.close,
                c.volume
            )
        })
        .collect();
    brief.push_str("Last 1m candles:\n");
    brief.push_str(&recent.join("\n"));
    brief.push('\n');

    if let Some(flow) = &view.order_flow {
        brief.push_str(&format!(
            "Order flow (60s): OFI {:.2}, volume delta {:.1}, buy {:.1} / sell {:.1}, \
             VWAP {:.5}, sweep {}, VPIN {:.2}\n",
            flow.ofi_60s,
            flow.volume_delta,
            flow.buy_volume,
            flow.sell_volume,
            flow.vwap,
            flow.sweep_flag,
            flow.vpin
        ));
    }

    if let Some(ta) = &view.ta {
        brief.push_str(&format!(
            "Indicator consensus: {} (buy {} / sell {} / neutral {}, confidence {:.2})\n",
            ta.consensus, ta.buy_count, ta.sell_count, ta.neutral_count, ta.confidence
        ));
    }

    if !view.warnings.is_empty() {
        brief.push_str(&format!("Data warnings: {}\n", view.warnings.join(", ")));
    }

    brief
}

fn pattern_brief(pattern: Option<&PatternSignal>) -> String {
    match pattern {
        Some(p) if p.detected => format!(
            "Detected pattern: {} score {:.0} direction {} metadata {}",
            p.kind,
            p.score,
            p.direction.map(|d| d.to_string()).unwrap_or_else(|| "?".into()),
            p.metadata
        ),
        _ => "Detected pattern: none".to_string(),
    }
}

// ---------------------------------------------------------------------------
// Debate pipeline
// ---------------------------------------------------------------------------

pub struct DebatePipeline {
    llm: std::sync::Arc<dyn LlmDriver>,
    max_tokens: u32,
}

impl DebatePipeline {
    pub fn new(llm: std::sync::Arc<dyn LlmDriver>, max_tokens: u32) -> Self {
        Self { llm, max_tokens }
    }

    /// Analyst tier. Returns the three typed outputs; any LLM failure
    /// propagates so the cycle can reject on the safe side.
    pub async fn run_analysts(
        &self,
        instrument: &Instrument,
        view: &MarketView,
        pattern: Option<&PatternSignal>,
    ) -> Result<(MomentumView, TechnicalView, ValidatorVerdict)> {
        let brief = market_brief(instrument, view);

        let momentum: MomentumView = complete_typed(
            self.llm.as_ref(),
            vec![
                ChatMessage::system(
                    "You are a fast-momentum scalping analyst. Judge only the immediate \
                     tape: candles and order flow. Reply with strict JSON: \
                     {\"setup\": string, \"direction\": \"long\"|\"short\"|\"none\", \
                      \"strength\": number 0..1, \"reasoning\": string}",
                ),
                ChatMessage::user(format!("{brief}\nWhat is the momentum setup right now?")),
            ],
            self.max_tokens,
        )
        .await
        .context("fast-momentum agent failed")?;

        let technical: TechnicalView = complete_typed(
            self.llm.as_ref(),
            vec![
                ChatMessage::system(
                    "You are a technical analyst. Weigh the candle structure against the \
                     aggregate indicator consensus. Reply with strict JSON: \
                     {\"stance\": \"support\"|\"reject\", \"confidence\": number 0..1, \
                      \"reasoning\": string}",
                ),
                ChatMessage::user(format!(
                    "{brief}\n{}\nDo the technicals support a trade here?",
                    pattern_brief(pattern)
                )),
            ],
            self.max_tokens,
        )
        .await
        .context("technical agent failed")?;

        let validator: ValidatorVerdict = complete_typed(
            self.llm.as_ref(),
            vec![
                ChatMessage::system(
                    "You are the validating judge of a trading desk. Merge the two \
                     analyst opinions with the detected pattern and decide. Reply with \
                     strict JSON: {\"approved\": bool, \"direction\": \"long\"|\"short\", \
                     \"confidence\": number 0..1, \"tp_pips\": number, \"sl_pips\": number, \
                     \"reasoning\": string}",
                ),
                ChatMessage::user(format!(
                    "{brief}\n{}\nMomentum analyst: {}\nTechnical analyst: {}\nVerdict?",
                    pattern_brief(pattern),
                    serde_json::to_string(&momentum).unwrap_or_default(),
                    serde_json::to_string(&technical).unwrap_or_default(),
                )),
            ],
            self.max_tokens,
        )
        .await
        .context("validator judge failed")?;

        debug!(
            instrument = %instrument.id,
            approved = validator.approved,
            confidence = validator.confidence,
            "analyst debate complete"
        );

        Ok((momentum, technical, validator))
    }

    /// Risk tier. Runs for every approval, auto-approved or validated.
    pub async fn run_risk(
        &self,
        instrument: &Instrument,
        verdict: &ValidatorVerdict,
        open_positions: usize,
        daily_pnl: f64,
    ) -> Result<(RiskCase, RiskCase, RiskVerdict)> {
        let situation = format!(
            "Instrument: {}\nProposed: {} tp {:.1} pips / sl {:.1} pips, confidence {:.2}\n\
             Open positions: {open_positions}\nDaily PnL: {daily_pnl:.2}\nValidator reasoning: {}",
            instrument.id,
            verdict.direction,
            verdict.tp_pips,
            verdict.sl_pips,
            verdict.confidence,
            verdict.reasoning,
        );

        let aggressive: RiskCase = complete_typed(
            self.llm.as_ref(),
            vec![
                ChatMessage::system(
                    "You argue FOR taking this trade at full size. Reply with strict \
                     JSON: {\"size_multiplier\": number 0..1.5, \"concerns\": [string], \
                     \"reasoning\": string}",
                ),
                ChatMessage::user(situation.clone()),
            ],
            self.max_tokens,
        )
        .await
        .context("aggressive risk agent failed")?;

        let conservative: RiskCase = complete_typed(
            self.llm.as_ref(),
            vec![
                ChatMessage::system(
                    "You argue for caution on this trade. List concrete concerns and a \
                     reduced size if warranted. Reply with strict JSON: \
                     {\"size_multiplier\": number 0..1, \"concerns\": [string], \
                      \"reasoning\": string}",
                ),
                ChatMessage::user(situation.clone()),
            ],
            self.max_tokens,
        )
        .await
        .context("conservative risk agent failed")?;

        let judge: RiskVerdict = complete_typed(
            self.llm.as_ref(),
            vec![
                ChatMessage::system(
                    "You are the risk judge. Weigh both risk cases and assign a \
                     confidence tier: 1 = execute full size, 2 = execute reduced, \
                     3 = skip. Reply with strict JSON: {\"execute\": bool, \
                     \"tier\": 1|2|3, \"reasoning\": string}",
                ),
                ChatMessage::user(format!(
                    "{situation}\nAggressive case: {}\nConservative case: {}",
                    serde_json::to_string(&aggressive).unwrap_or_default(),
                    serde_json::to_string(&conservative).unwrap_or_default(),
                )),
            ],
            self.max_tokens,
        )
        .await
        .context("risk judge failed")?;

        debug!(
            instrument = %instrument.id,
            execute = judge.execute,
            tier = judge.tier,
            "risk debate complete"
        );

        Ok((aggressive, conservative, judge))
    }
}
