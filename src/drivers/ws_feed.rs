// =============================================================================
// WebSocket feed driver — spot ticks and futures order flow
// =============================================================================
//
// Speaks the broker's streaming JSON protocol: connect, send one subscribe
// frame, then read until the connection drops. The function returns on any
// terminal condition so the owning ingestor can apply its reconnect policy.
//
// Message shapes:
//   { "type": "tick",  "instrument": "EUR_USD", "time": "...", "bid": "1.08341", "ask": "1.08350" }
//   { "type": "trade", "symbol": "6E", "time": "...", "price": "1.0851", "size": "3", "side": "buy", "levels": 2 }
//   { "type": "book",  "symbol": "6E", "time": "...", "bid": "1.0850", "ask": "1.0851", "bid_size": "40", "ask_size": "35" }
//   { "type": "error", "code": "AUTH_EXPIRED" }
// =============================================================================

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::{FeedError, FlowEvent, FlowEventKind, OrderFlowFeed, TickFeed};
use crate::types::Tick;

/// Idle cutoff: if the socket produces nothing for this long the run ends so
/// the ingestor reconnects.
const IDLE_TIMEOUT_SECS: u64 = 60;
/// Connect handshake budget.
const CONNECT_TIMEOUT_SECS: u64 = 10;

/// A single streaming endpoint plus its access token provider.
pub struct WsFeed {
    url: String,
    token: String,
}

impl WsFeed {
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: token.into(),
        }
    }

    /// Connect, subscribe to `channel` for `symbols`, and forward each parsed
    /// message to `handle` until the stream ends.
    async fn run_channel<F>(
        &self,
        channel: &str,
        symbols: &[String],
        mut handle: F,
    ) -> std::result::Result<(), FeedError>
    where
        F: FnMut(serde_json::Value) -> std::result::Result<(), FeedError> + Send,
    {
        let connect = tokio::time::timeout(
            std::time::Duration::from_secs(CONNECT_TIMEOUT_SECS),
            connect_async(&self.url),
        )
        .await
        .map_err(|_| FeedError::Stream(anyhow::anyhow!("connect timed out")))?
        .context("failed to connect to stream endpoint")?;

        let (ws_stream, _response) = connect;
        info!(url = %self.url, channel, symbols = symbols.len(), "stream connected");

        let (mut write, mut read) = ws_stream.split();

        let subscribe = serde_json::json!({
            "op": "subscribe",
            "channel": channel,
            "symbols": symbols,
            "token": self.token,
        });
        write
            .send(Message::Text(subscribe.to_string()))
            .await
            .context("failed to send subscribe frame")?;

        loop {
            let next = tokio::time::timeout(
                std::time::Duration::from_secs(IDLE_TIMEOUT_SECS),
                read.next(),
            )
            .await;

            let msg = match next {
                Err(_) => {
                    warn!(channel, "stream idle for {IDLE_TIMEOUT_SECS}s — reconnecting");
                    return Ok(());
                }
                Ok(None) => {
                    warn!(channel, "stream ended");
                    return Ok(());
                }
                Ok(Some(Err(e))) => {
                    return Err(FeedError::Stream(anyhow::Error::from(e).context("read error")));
                }
                Ok(Some(Ok(msg))) => msg,
            };

            if let Message::Text(text) = msg {
                let value: serde_json::Value = match serde_json::from_str(&text) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(channel, error = %e, "unparseable stream frame dropped");
                        continue;
                    }
                };

                if value["type"].as_str() == Some("error") {
                    let code = value["code"].as_str().unwrap_or("");
                    if code == "AUTH_EXPIRED" {
                        return Err(FeedError::AuthExpired);
                    }
                    return Err(FeedError::Stream(anyhow::anyhow!(
                        "stream error frame: {value}"
                    )));
                }

                handle(value)?;
            }
            // Ping/pong/binary frames are handled by tungstenite.
        }
    }
}

#[async_trait]
impl TickFeed for WsFeed {
    async fn run(
        &self,
        instruments: &[String],
        sink: mpsc::Sender<Tick>,
    ) -> std::result::Result<(), FeedError> {
        self.run_channel("ticks", instruments, move |value| {
            match parse_tick(&value) {
                Ok(tick) => {
                    debug!(instrument = %tick.instrument, bid = tick.bid, ask = tick.ask, "tick");
                    if sink.try_send(tick).is_err() {
                        warn!("tick sink full or closed — dropping tick");
                    }
                }
                Err(e) => warn!(error = %e, "failed to parse tick message"),
            }
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl OrderFlowFeed for WsFeed {
    async fn run(
        &self,
        futures_symbols: &[String],
        sink: mpsc::Sender<FlowEvent>,
    ) -> std::result::Result<(), FeedError> {
        self.run_channel("order_flow", futures_symbols, move |value| {
            match parse_flow_event(&value) {
                Ok(event) => {
                    if sink.try_send(event).is_err() {
                        warn!("flow sink full or closed — dropping event");
                    }
                }
                Err(e) => warn!(error = %e, "failed to parse flow message"),
            }
            Ok(())
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Feeds quote numeric values as JSON strings; accept either form.
fn field_f64(value: &serde_json::Value, name: &str) -> Result<f64> {
    match &value[name] {
        serde_json::Value::String(s) => s
            .parse::<f64>()
            .with_context(|| format!("failed to parse {name} as f64: {s}")),
        serde_json::Value::Number(n) => n
            .as_f64()
            .with_context(|| format!("field {name} is not a valid f64")),
        _ => bail!("field {name} missing or has unexpected JSON type"),
    }
}

fn field_time(value: &serde_json::Value, name: &str) -> Result<DateTime<Utc>> {
    let raw = value[name]
        .as_str()
        .with_context(|| format!("missing field {name}"))?;
    Ok(raw
        .parse::<DateTime<Utc>>()
        .with_context(|| format!("failed to parse {name} as RFC 3339: {raw}"))?)
}

fn parse_tick(value: &serde_json::Value) -> Result<Tick> {
    if value["type"].as_str() != Some("tick") {
        bail!("not a tick frame");
    }
    let instrument = value["instrument"]
        .as_str()
        .context("missing field instrument")?
        .to_string();
    let event_time = field_time(value, "time")?;
    let bid = field_f64(value, "bid")?;
    let ask = field_f64(value, "ask")?;
    Ok(Tick::new(instrument, event_time, bid, ask))
}

fn parse_flow_event(value: &serde_json::Value) -> Result<FlowEvent> {
    let symbol = value["symbol"]
        .as_str()
        .context("missing field symbol")?
        .to_string();
    let event_time = field_time(value, "time")?;

    let kind = match value["type"].as_str() {
        Some("trade") => FlowEventKind::Trade {
            price: field_f64(value, "price")?,
            size: field_f64(value, "size")?,
            buy_aggressor: value["side"].as_str() == Some("buy"),
            levels_consumed: value["levels"].as_u64().unwrap_or(1) as usize,
        },
        Some("book") => FlowEventKind::Book {
            bid: field_f64(value, "bid")?,
            ask: field_f64(value, "ask")?,
            bid_size: field_f64(value, "bid_size")?,
            ask_size: field_f64(value, "ask_size")?,
        },
        other => bail!("unknown flow frame type {other:?}"),
    };

    Ok(FlowEvent {
        futures_symbol: symbol,
        event_time,
        kind,
    })
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_tick_ok() {
        let json: serde_json::Value = serde_json::from_str(
            r#"{
                "type": "tick",
                "instrument": "EUR_USD",
                "time": "2025-03-03T10:00:00Z",
                "bid": "1.08341",
                "ask": "1.08350"
            }"#,
        )
        .unwrap();
        let tick = parse_tick(&json).unwrap();
        assert_eq!(tick.instrument, "EUR_USD");
        assert!((tick.bid - 1.08341).abs() < 1e-9);
        assert!((tick.mid - 1.083455).abs() < 1e-9);
    }

    #[test]
    fn parse_tick_rejects_missing_fields() {
        let json: serde_json::Value =
            serde_json::from_str(r#"{ "type": "tick", "instrument": "EUR_USD" }"#).unwrap();
        assert!(parse_tick(&json).is_err());
    }

    #[test]
    fn parse_trade_event() {
        let json: serde_json::Value = serde_json::from_str(
            r#"{
                "type": "trade",
                "symbol": "6E",
                "time": "2025-03-03T10:00:01Z",
                "price": 1.0851,
                "size": "5",
                "side": "sell",
                "levels": 4
            }"#,
        )
        .unwrap();
        let event = parse_flow_event(&json).unwrap();
        assert_eq!(event.futures_symbol, "6E");
        match event.kind {
            FlowEventKind::Trade {
                size,
                buy_aggressor,
                levels_consumed,
                ..
            } => {
                assert!((size - 5.0).abs() < 1e-9);
                assert!(!buy_aggressor);
                assert_eq!(levels_consumed, 4);
            }
            _ => panic!("expected trade"),
        }
    }

    #[test]
    fn parse_book_event() {
        let json: serde_json::Value = serde_json::from_str(
            r#"{
                "type": "book",
                "symbol": "6E",
                "time": "2025-03-03T10:00:01Z",
                "bid": "1.0850",
                "ask": "1.0851",
                "bid_size": "40",
                "ask_size": "35"
            }"#,
        )
        .unwrap();
        let event = parse_flow_event(&json).unwrap();
        assert!(matches!(event.kind, FlowEventKind::Book { .. }));
    }

    #[test]
    fn unknown_frame_type_is_error() {
        let json: serde_json::Value = serde_json::from_str(
            r#"{ "type": "heartbeat", "symbol": "6E", "time": "2025-03-03T10:00:01Z" }"#,
        )
        .unwrap();
        assert!(parse_flow_event(&json).is_err());
    }
}
