// =============================================================================
// HTTP driver adapters — TA aggregator and economic calendar
// =============================================================================
//
// Thin JSON clients for the two polled external APIs. Both tolerate numeric
// fields arriving as strings, time out at 30 s, and leave retry/skip policy
// to their callers (the TA poller skips a cycle, the news gater degrades).
//
// Expected shapes:
//   GET {base}/v1/indicators/{instrument}
//     -> { "buy": 12, "sell": 4, "neutral": 6 }
//   GET {base}/v1/calendar?from=...&to=...
//     -> [ { "id": "...", "time": "...", "country": "US", "currency": "USD",
//            "importance": "high", "name": "Non-Farm Payrolls" } ]
// =============================================================================

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use tracing::{debug, warn};

use super::{CalendarProvider, TaProvider};
use crate::types::{EconomicEvent, Importance, TaSnapshot};

/// Request timeout for both clients.
const REQUEST_TIMEOUT_SECS: u64 = 30;
/// Transport retries per fetch.
const MAX_RETRIES: u32 = 2;

fn build_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
        .build()
        .expect("failed to build reqwest client")
}

/// GET `url` as JSON with bounded retries and jittered exponential backoff.
async fn get_json_with_retries(
    client: &reqwest::Client,
    url: &str,
    api_key: &str,
) -> Result<serde_json::Value> {
    let mut last_err = None;

    for attempt in 0..=MAX_RETRIES {
        if attempt > 0 {
            let jitter = rand::thread_rng().gen_range(0..250);
            let delay = 200u64 * (1 << attempt) + jitter;
            tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
        }

        let result = async {
            let resp = client
                .get(url)
                .bearer_auth(api_key)
                .send()
                .await
                .context("request failed")?;
            let status = resp.status();
            let body: serde_json::Value =
                resp.json().await.context("failed to parse response body")?;
            if !status.is_success() {
                bail!("endpoint returned {status}: {body}");
            }
            Ok(body)
        }
        .await;

        match result {
            Ok(body) => return Ok(body),
            Err(e) => {
                warn!(attempt, url, error = %e, "HTTP fetch failed");
                last_err = Some(e);
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("fetch failed with no attempts")))
}

fn count_field(value: &serde_json::Value, name: &str) -> Result<u32> {
    match &value[name] {
        serde_json::Value::Number(n) => n
            .as_u64()
            .map(|v| v as u32)
            .with_context(|| format!("field {name} is not a count")),
        serde_json::Value::String(s) => s
            .parse::<u32>()
            .with_context(|| format!("failed to parse {name}: {s}")),
        _ => bail!("field {name} missing"),
    }
}

// ---------------------------------------------------------------------------
// TA aggregator
// ---------------------------------------------------------------------------

pub struct HttpTaProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpTaProvider {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: build_client(),
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    fn parse_snapshot(instrument: &str, body: &serde_json::Value) -> Result<TaSnapshot> {
        let buy = count_field(body, "buy")?;
        let sell = count_field(body, "sell")?;
        let neutral = count_field(body, "neutral")?;
        Ok(TaSnapshot::from_counts(instrument, Utc::now(), buy, sell, neutral))
    }
}

#[async_trait]
impl TaProvider for HttpTaProvider {
    async fn fetch_aggregate_indicators(&self, instrument: &str) -> Result<TaSnapshot> {
        let url = format!("{}/v1/indicators/{instrument}", self.base_url);
        let body = get_json_with_retries(&self.client, &url, &self.api_key)
            .await
            .context("TA aggregator fetch failed")?;

        let snapshot = Self::parse_snapshot(instrument, &body)?;
        debug!(instrument, consensus = %snapshot.consensus, "TA indicators fetched");
        Ok(snapshot)
    }
}

// ---------------------------------------------------------------------------
// Economic calendar
// ---------------------------------------------------------------------------

pub struct HttpCalendarProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpCalendarProvider {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: build_client(),
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    fn parse_event(entry: &serde_json::Value) -> Result<EconomicEvent> {
        let importance = match entry["importance"].as_str().unwrap_or("low") {
            "high" => Importance::High,
            "medium" | "med" => Importance::Medium,
            _ => Importance::Low,
        };
        let time_raw = entry["time"].as_str().context("event missing time")?;

        Ok(EconomicEvent {
            event_id: entry["id"]
                .as_str()
                .context("event missing id")?
                .to_string(),
            scheduled_time: time_raw
                .parse::<DateTime<Utc>>()
                .with_context(|| format!("failed to parse event time: {time_raw}"))?,
            country: entry["country"].as_str().unwrap_or("").to_string(),
            currency: entry["currency"]
                .as_str()
                .context("event missing currency")?
                .to_string(),
            importance,
            event_name: entry["name"].as_str().unwrap_or("").to_string(),
        })
    }
}

#[async_trait]
impl CalendarProvider for HttpCalendarProvider {
    async fn fetch_calendar(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<EconomicEvent>> {
        let url = format!(
            "{}/v1/calendar?from={}&to={}",
            self.base_url,
            from.to_rfc3339(),
            to.to_rfc3339()
        );
        let body = get_json_with_retries(&self.client, &url, &self.api_key)
            .await
            .context("calendar fetch failed")?;

        let entries = body.as_array().context("calendar response is not an array")?;
        let mut events = Vec::with_capacity(entries.len());
        for entry in entries {
            match Self::parse_event(entry) {
                Ok(event) => events.push(event),
                Err(e) => {
                    // One malformed entry must not sink the refresh.
                    tracing::warn!(error = %e, "skipping malformed calendar entry");
                }
            }
        }

        debug!(count = events.len(), "calendar fetched");
        Ok(events)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Consensus;

    #[test]
    fn ta_snapshot_parses_numbers_and_strings() {
        let body = serde_json::json!({ "buy": 14, "sell": "3", "neutral": 5 });
        let snap = HttpTaProvider::parse_snapshot("EUR_USD", &body).unwrap();
        assert_eq!(snap.buy_count, 14);
        assert_eq!(snap.sell_count, 3);
        assert_eq!(snap.consensus, Consensus::Bullish);
    }

    #[test]
    fn ta_snapshot_missing_field_errors() {
        let body = serde_json::json!({ "buy": 14, "sell": 3 });
        assert!(HttpTaProvider::parse_snapshot("EUR_USD", &body).is_err());
    }

    #[test]
    fn calendar_event_parses() {
        let entry = serde_json::json!({
            "id": "nfp-2025-03",
            "time": "2025-03-07T13:30:00Z",
            "country": "US",
            "currency": "USD",
            "importance": "high",
            "name": "Non-Farm Payrolls"
        });
        let event = HttpCalendarProvider::parse_event(&entry).unwrap();
        assert_eq!(event.currency, "USD");
        assert_eq!(event.importance, Importance::High);
        assert_eq!(
            event.scheduled_time,
            "2025-03-07T13:30:00Z".parse::<DateTime<Utc>>().unwrap()
        );
    }

    #[test]
    fn calendar_event_requires_currency_and_time() {
        let entry = serde_json::json!({ "id": "x", "time": "2025-03-07T13:30:00Z" });
        assert!(HttpCalendarProvider::parse_event(&entry).is_err());

        let entry = serde_json::json!({ "id": "x", "currency": "USD" });
        assert!(HttpCalendarProvider::parse_event(&entry).is_err());
    }
}
