// =============================================================================
// Persistence Store — append-only time-series tables + decision logs
// =============================================================================
//
// SQLite via rusqlite with WAL mode so producers keep writing while the
// engine reads. A single writer connection sits behind a parking_lot Mutex;
// batched rows are applied inside one transaction per flush.
//
// Candle writes are idempotent upserts keyed (instrument, timeframe,
// open_time): a finalized candle overwrites any in-progress row.
// =============================================================================

pub mod batch;

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::types::{
    Candle, ClosedTrade, Direction, EconomicEvent, GatingWindow, Importance, Instrument,
    OrderFlowMetrics, Signal, TaSnapshot, Tick, Tier,
};

/// Raw order-flow book/trade message retained for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowEventRow {
    pub instrument: String,
    pub event_time: DateTime<Utc>,
    /// "book" or "trade".
    pub kind: String,
    pub payload: serde_json::Value,
}

/// Individual aggressor trade from the futures stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowTradeRow {
    pub instrument: String,
    pub event_time: DateTime<Utc>,
    pub price: f64,
    pub size: f64,
    /// true when the aggressor bought.
    pub buy_aggressor: bool,
}

/// One row for the batched writer. Everything durable that producers emit
/// goes through this.
#[derive(Debug, Clone)]
pub enum Row {
    Tick(Tick),
    Candle(Candle),
    FlowSnapshot(OrderFlowMetrics),
    FlowEvent(FlowEventRow),
    FlowTrade(FlowTradeRow),
    Ta(TaSnapshot),
}

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS instruments (
    id TEXT PRIMARY KEY,
    base TEXT NOT NULL,
    quote TEXT NOT NULL,
    pip_size REAL NOT NULL,
    decimal_places_factor REAL NOT NULL
);

CREATE TABLE IF NOT EXISTS spot_ticks (
    instrument TEXT NOT NULL,
    event_time INTEGER NOT NULL,
    bid REAL NOT NULL,
    ask REAL NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_spot_ticks_time
    ON spot_ticks(instrument, event_time DESC);

CREATE TABLE IF NOT EXISTS candles (
    instrument TEXT NOT NULL,
    timeframe TEXT NOT NULL,
    open_time INTEGER NOT NULL,
    o REAL NOT NULL,
    h REAL NOT NULL,
    l REAL NOT NULL,
    c REAL NOT NULL,
    v REAL NOT NULL,
    finalized INTEGER NOT NULL,
    UNIQUE (instrument, timeframe, open_time)
);
CREATE INDEX IF NOT EXISTS idx_candles_time
    ON candles(instrument, timeframe, open_time DESC);

CREATE TABLE IF NOT EXISTS order_flow_events (
    instrument TEXT NOT NULL,
    event_time INTEGER NOT NULL,
    kind TEXT NOT NULL,
    payload_json TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_of_events_time
    ON order_flow_events(instrument, event_time DESC);

CREATE TABLE IF NOT EXISTS order_flow_trades (
    instrument TEXT NOT NULL,
    event_time INTEGER NOT NULL,
    price REAL NOT NULL,
    size REAL NOT NULL,
    buy_aggressor INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_of_trades_time
    ON order_flow_trades(instrument, event_time DESC);

CREATE TABLE IF NOT EXISTS order_flow_snapshots (
    instrument TEXT NOT NULL,
    compute_time INTEGER NOT NULL,
    ofi_60s REAL NOT NULL,
    volume_delta REAL NOT NULL,
    buy_volume REAL NOT NULL,
    sell_volume REAL NOT NULL,
    vwap REAL NOT NULL,
    sweep_flag INTEGER NOT NULL,
    vpin REAL NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_of_snapshots_time
    ON order_flow_snapshots(instrument, compute_time DESC);

CREATE TABLE IF NOT EXISTS ta_snapshots (
    instrument TEXT NOT NULL,
    compute_time INTEGER NOT NULL,
    buy_count INTEGER NOT NULL,
    sell_count INTEGER NOT NULL,
    neutral_count INTEGER NOT NULL,
    consensus TEXT NOT NULL,
    confidence REAL NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_ta_snapshots_time
    ON ta_snapshots(instrument, compute_time DESC);

CREATE TABLE IF NOT EXISTS economic_events (
    event_id TEXT PRIMARY KEY,
    scheduled_time INTEGER NOT NULL,
    country TEXT NOT NULL,
    currency TEXT NOT NULL,
    importance TEXT NOT NULL,
    event_name TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_economic_events_time
    ON economic_events(scheduled_time DESC);

CREATE TABLE IF NOT EXISTS gating_states (
    instrument TEXT NOT NULL,
    state TEXT NOT NULL,
    window_start INTEGER NOT NULL,
    window_end INTEGER NOT NULL,
    close_positions_at INTEGER NOT NULL,
    reason TEXT NOT NULL,
    linked_event_id TEXT,
    recorded_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_gating_states_time
    ON gating_states(instrument, recorded_at DESC);

CREATE TABLE IF NOT EXISTS signals (
    cycle_id TEXT PRIMARY KEY,
    instrument TEXT NOT NULL,
    generated_at INTEGER NOT NULL,
    direction TEXT,
    entry_price REAL,
    tp REAL,
    sl REAL,
    size_lots REAL NOT NULL,
    confidence REAL NOT NULL,
    pattern TEXT,
    pattern_score REAL,
    tier TEXT NOT NULL,
    reason TEXT NOT NULL,
    agent_trace_json TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_signals_time
    ON signals(instrument, generated_at DESC);

CREATE TABLE IF NOT EXISTS agent_decisions (
    cycle_id TEXT NOT NULL,
    agent TEXT NOT NULL,
    recorded_at INTEGER NOT NULL,
    payload_json TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_agent_decisions_cycle
    ON agent_decisions(cycle_id);

CREATE TABLE IF NOT EXISTS closed_trades (
    trade_id TEXT PRIMARY KEY,
    instrument TEXT NOT NULL,
    direction TEXT NOT NULL,
    size_lots REAL NOT NULL,
    entry_time INTEGER NOT NULL,
    entry_price REAL NOT NULL,
    tp REAL NOT NULL,
    sl REAL NOT NULL,
    exit_time INTEGER NOT NULL,
    exit_price REAL NOT NULL,
    pnl_pips REAL NOT NULL,
    pnl_cash REAL NOT NULL,
    exit_reason TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_closed_trades_time
    ON closed_trades(instrument, exit_time DESC);
"#;

/// SQLite-backed store. Cheap to share via `Arc`; all methods lock the single
/// connection for the duration of the statement.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database at `path` and apply the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite db at {}", path.display()))?;
        let store = Self::from_connection(conn)?;
        info!(path = %path.display(), "persistence store opened");
        Ok(store)
    }

    /// In-memory database, used by tests and the demo mode smoke path.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.execute_batch(SCHEMA_SQL)
            .context("failed to apply store schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // -------------------------------------------------------------------------
    // Instruments
    // -------------------------------------------------------------------------

    pub fn upsert_instrument(&self, inst: &Instrument) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO instruments (id, base, quote, pip_size, decimal_places_factor)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
               base = excluded.base,
               quote = excluded.quote,
               pip_size = excluded.pip_size,
               decimal_places_factor = excluded.decimal_places_factor",
            params![
                inst.id,
                inst.base,
                inst.quote,
                inst.pip_size,
                inst.decimal_places_factor
            ],
        )?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Batched rows
    // -------------------------------------------------------------------------

    /// Apply a batch of producer rows inside one transaction. Candle rows are
    /// validated before touching the database; a violation aborts the whole
    /// batch (fail fast on corrupt data).
    pub fn apply_batch(&self, rows: &[Row]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        for row in rows {
            if let Row::Candle(c) = row {
                c.validate()?;
            }
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        for row in rows {
            match row {
                Row::Tick(t) => {
                    tx.execute(
                        "INSERT INTO spot_ticks (instrument, event_time, bid, ask)
                         VALUES (?1, ?2, ?3, ?4)",
                        params![t.instrument, t.event_time.timestamp_millis(), t.bid, t.ask],
                    )?;
                }
                Row::Candle(c) => {
                    tx.execute(
                        "INSERT INTO candles
                           (instrument, timeframe, open_time, o, h, l, c, v, finalized)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                         ON CONFLICT(instrument, timeframe, open_time) DO UPDATE SET
                           o = excluded.o, h = excluded.h, l = excluded.l,
                           c = excluded.c, v = excluded.v, finalized = excluded.finalized",
                        params![
                            c.instrument,
                            c.timeframe,
                            c.open_time.timestamp_millis(),
                            c.open,
                            c.high,
                            c.low,
                            c.close,
                            c.volume,
                            c.finalized as i64
                        ],
                    )?;
                }
                Row::FlowSnapshot(m) => {
                    tx.execute(
                        "INSERT INTO order_flow_snapshots
                           (instrument, compute_time, ofi_60s, volume_delta, buy_volume,
                            sell_volume, vwap, sweep_flag, vpin)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                        params![
                            m.instrument,
                            m.compute_time.timestamp_millis(),
                            m.ofi_60s,
                            m.volume_delta,
                            m.buy_volume,
                            m.sell_volume,
                            m.vwap,
                            m.sweep_flag as i64,
                            m.vpin
                        ],
                    )?;
                }
                Row::FlowEvent(e) => {
                    tx.execute(
                        "INSERT INTO order_flow_events (instrument, event_time, kind, payload_json)
                         VALUES (?1, ?2, ?3, ?4)",
                        params![
                            e.instrument,
                            e.event_time.timestamp_millis(),
                            e.kind,
                            e.payload.to_string()
                        ],
                    )?;
                }
                Row::FlowTrade(t) => {
                    tx.execute(
                        "INSERT INTO order_flow_trades
                           (instrument, event_time, price, size, buy_aggressor)
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                        params![
                            t.instrument,
                            t.event_time.timestamp_millis(),
                            t.price,
                            t.size,
                            t.buy_aggressor as i64
                        ],
                    )?;
                }
                Row::Ta(s) => {
                    tx.execute(
                        "INSERT INTO ta_snapshots
                           (instrument, compute_time, buy_count, sell_count, neutral_count,
                            consensus, confidence)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                        params![
                            s.instrument,
                            s.compute_time.timestamp_millis(),
                            s.buy_count,
                            s.sell_count,
                            s.neutral_count,
                            s.consensus.to_string(),
                            s.confidence
                        ],
                    )?;
                }
            }
        }

        tx.commit()?;
        debug!(rows = rows.len(), "store batch committed");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Candles (warm start / fallback reads)
    // -------------------------------------------------------------------------

    /// Fetch the last `limit` finalized candles for a series, oldest first.
    pub fn fetch_last_candles(
        &self,
        instrument: &str,
        timeframe: &str,
        limit: usize,
    ) -> Result<Vec<Candle>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT open_time, o, h, l, c, v
             FROM candles
             WHERE instrument = ?1 AND timeframe = ?2 AND finalized = 1
             ORDER BY open_time DESC
             LIMIT ?3",
        )?;

        let mut out: Vec<Candle> = stmt
            .query_map(params![instrument, timeframe, limit as i64], |row| {
                let open_time_ms: i64 = row.get(0)?;
                Ok(Candle {
                    instrument: instrument.to_string(),
                    timeframe: timeframe.to_string(),
                    open_time: Utc
                        .timestamp_millis_opt(open_time_ms)
                        .single()
                        .unwrap_or_else(Utc::now),
                    open: row.get(1)?,
                    high: row.get(2)?,
                    low: row.get(3)?,
                    close: row.get(4)?,
                    volume: row.get(5)?,
                    finalized: true,
                })
            })?
            .collect::<rusqlite::Result<_>>()?;

        out.reverse();
        Ok(out)
    }

    // -------------------------------------------------------------------------
    // Economic events / gating
    // -------------------------------------------------------------------------

    pub fn upsert_economic_events(&self, events: &[EconomicEvent]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for e in events {
            tx.execute(
                "INSERT INTO economic_events
                   (event_id, scheduled_time, country, currency, importance, event_name)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(event_id) DO UPDATE SET
                   scheduled_time = excluded.scheduled_time,
                   importance = excluded.importance,
                   event_name = excluded.event_name",
                params![
                    e.event_id,
                    e.scheduled_time.timestamp_millis(),
                    e.country,
                    e.currency,
                    importance_str(e.importance),
                    e.event_name
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// High-impact events scheduled inside [from, to].
    pub fn fetch_high_impact_events(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<EconomicEvent>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT event_id, scheduled_time, country, currency, importance, event_name
             FROM economic_events
             WHERE importance = 'high' AND scheduled_time BETWEEN ?1 AND ?2
             ORDER BY scheduled_time ASC",
        )?;

        let events = stmt
            .query_map(
                params![from.timestamp_millis(), to.timestamp_millis()],
                |row| {
                    let ts: i64 = row.get(1)?;
                    let importance: String = row.get(4)?;
                    Ok(EconomicEvent {
                        event_id: row.get(0)?,
                        scheduled_time: Utc
                            .timestamp_millis_opt(ts)
                            .single()
                            .unwrap_or_else(Utc::now),
                        country: row.get(2)?,
                        currency: row.get(3)?,
                        importance: parse_importance(&importance),
                        event_name: row.get(5)?,
                    })
                },
            )?
            .collect::<rusqlite::Result<_>>()?;

        Ok(events)
    }

    /// Append one gating-window state transition.
    pub fn record_gating_transition(&self, window: &GatingWindow) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO gating_states
               (instrument, state, window_start, window_end, close_positions_at,
                reason, linked_event_id, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                window.instrument,
                window.state.to_string(),
                window.window_start.timestamp_millis(),
                window.window_end.timestamp_millis(),
                window.close_positions_at.timestamp_millis(),
                window.reason,
                window.linked_event_id,
                Utc::now().timestamp_millis()
            ],
        )?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Signals / decisions / trades
    // -------------------------------------------------------------------------

    pub fn insert_signal(&self, signal: &Signal) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO signals
               (cycle_id, instrument, generated_at, direction, entry_price, tp, sl,
                size_lots, confidence, pattern, pattern_score, tier, reason,
                agent_trace_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
             ON CONFLICT(cycle_id) DO NOTHING",
            params![
                signal.cycle_id,
                signal.instrument,
                signal.generated_at.timestamp_millis(),
                signal.direction.map(|d| d.to_string()),
                signal.entry_price,
                signal.tp,
                signal.sl,
                signal.size_lots,
                signal.confidence,
                signal.pattern,
                signal.pattern_score,
                signal.tier.as_str(),
                signal.reason,
                signal.agent_trace.to_string()
            ],
        )?;
        Ok(())
    }

    pub fn insert_agent_decision(
        &self,
        cycle_id: &str,
        agent: &str,
        payload: &serde_json::Value,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO agent_decisions (cycle_id, agent, recorded_at, payload_json)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                cycle_id,
                agent,
                Utc::now().timestamp_millis(),
                payload.to_string()
            ],
        )?;
        Ok(())
    }

    pub fn insert_closed_trade(&self, trade: &ClosedTrade) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO closed_trades
               (trade_id, instrument, direction, size_lots, entry_time, entry_price,
                tp, sl, exit_time, exit_price, pnl_pips, pnl_cash, exit_reason)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
             ON CONFLICT(trade_id) DO NOTHING",
            params![
                trade.trade_id,
                trade.instrument,
                trade.direction.to_string(),
                trade.size_lots,
                trade.entry_time.timestamp_millis(),
                trade.entry_price,
                trade.tp,
                trade.sl,
                trade.exit_time.timestamp_millis(),
                trade.exit_price,
                trade.pnl_pips,
                trade.pnl_cash,
                trade.exit_reason.as_str()
            ],
        )?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Diagnostic counts (tests and status endpoints)
    // -------------------------------------------------------------------------

    pub fn count_rows(&self, table: &str) -> Result<i64> {
        let conn = self.conn.lock();
        let count = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
            row.get(0)
        })?;
        Ok(count)
    }

    /// Most recent signals for an instrument, newest first.
    pub fn fetch_recent_signals(&self, instrument: &str, limit: usize) -> Result<Vec<Signal>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT cycle_id, generated_at, direction, entry_price, tp, sl, size_lots,
                    confidence, pattern, pattern_score, tier, reason, agent_trace_json
             FROM signals
             WHERE instrument = ?1
             ORDER BY generated_at DESC
             LIMIT ?2",
        )?;

        let signals = stmt
            .query_map(params![instrument, limit as i64], |row| {
                let generated_ms: i64 = row.get(1)?;
                let direction: Option<String> = row.get(2)?;
                let tier: String = row.get(10)?;
                let trace: String = row.get(12)?;
                Ok(Signal {
                    instrument: instrument.to_string(),
                    cycle_id: row.get(0)?,
                    generated_at: Utc
                        .timestamp_millis_opt(generated_ms)
                        .single()
                        .unwrap_or_else(Utc::now),
                    direction: direction.and_then(|d| d.parse::<Direction>().ok()),
                    entry_price: row.get(3)?,
                    tp: row.get(4)?,
                    sl: row.get(5)?,
                    size_lots: row.get(6)?,
                    confidence: row.get(7)?,
                    pattern: row.get(8)?,
                    pattern_score: row.get(9)?,
                    tier: parse_tier(&tier),
                    reason: row.get(11)?,
                    agent_trace: serde_json::from_str(&trace)
                        .unwrap_or(serde_json::Value::Null),
                })
            })?
            .collect::<rusqlite::Result<_>>()?;

        Ok(signals)
    }
}

fn importance_str(i: Importance) -> &'static str {
    match i {
        Importance::Low => "low",
        Importance::Medium => "medium",
        Importance::High => "high",
    }
}

fn parse_importance(s: &str) -> Importance {
    match s {
        "high" => Importance::High,
        "medium" => Importance::Medium,
        _ => Importance::Low,
    }
}

fn parse_tier(s: &str) -> Tier {
    match s {
        "auto_approve" => Tier::AutoApprove,
        "llm_validate" => Tier::LlmValidate,
        _ => Tier::Reject,
    }
}
