// =============================================================================
// LLM completion client — chat-completions JSON over HTTPS
// =============================================================================
//
// The API key is never logged. Each call is bounded by the configured
// timeout and retried on transport failure; the shared token bucket caps the
// fleet-wide call rate regardless of how many cycles run concurrently.
//
// Agents require strictly JSON outputs: `complete_typed` parses the reply
// into the caller's type and re-prompts up to two times with the parse error
// before giving up. Callers treat a final failure as a rejection.
// =============================================================================

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::{ChatMessage, LlmDriver};
use crate::config::LlmParams;
use crate::ratelimit::TokenBucket;

/// Repair re-prompts after a non-JSON reply.
const JSON_REPAIR_ATTEMPTS: u32 = 2;

/// HTTPS chat-completions client.
pub struct LlmClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    max_retries: u32,
    bucket: Arc<TokenBucket>,
}

impl LlmClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        params: &LlmParams,
        bucket: Arc<TokenBucket>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(params.timeout_secs))
            .build()
            .expect("failed to build reqwest client");

        Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: params.model.clone(),
            max_retries: params.max_retries,
            bucket,
        }
    }

    async fn request_once(&self, messages: &[ChatMessage], max_tokens: u32) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": max_tokens,
            "temperature": 0.2,
        });

        let resp = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .context("LLM completion request failed")?;

        let status = resp.status();
        let payload: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse LLM response body")?;

        if !status.is_success() {
            bail!("LLM endpoint returned {status}: {payload}");
        }

        let text = payload["choices"][0]["message"]["content"]
            .as_str()
            .context("LLM response missing choices[0].message.content")?;

        Ok(text.to_string())
    }
}

#[async_trait]
impl LlmDriver for LlmClient {
    async fn complete(&self, messages: &[ChatMessage], max_tokens: u32) -> Result<String> {
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            self.bucket.acquire().await;

            match self.request_once(messages, max_tokens).await {
                Ok(text) => {
                    debug!(attempt, chars = text.len(), "LLM completion ok");
                    return Ok(text);
                }
                Err(e) => {
                    warn!(attempt, error = %e, "LLM completion failed");
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("LLM call failed with no attempts")))
    }
}

impl std::fmt::Debug for LlmClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmClient")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .field("model", &self.model)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Typed JSON completions
// ---------------------------------------------------------------------------

/// Strip a Markdown code fence if the model wrapped its JSON in one.
fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.strip_suffix("```").unwrap_or(inner).trim()
}

/// Complete and parse into `T`, re-prompting with the parse error up to
/// [`JSON_REPAIR_ATTEMPTS`] times when the reply is not valid JSON for `T`.
pub async fn complete_typed<T: DeserializeOwned>(
    driver: &dyn LlmDriver,
    mut messages: Vec<ChatMessage>,
    max_tokens: u32,
) -> Result<T> {
    for attempt in 0..=JSON_REPAIR_ATTEMPTS {
        let reply = driver.complete(&messages, max_tokens).await?;
        let cleaned = strip_code_fence(&reply);

        match serde_json::from_str::<T>(cleaned) {
            Ok(parsed) => return Ok(parsed),
            Err(e) if attempt < JSON_REPAIR_ATTEMPTS => {
                warn!(attempt, error = %e, "LLM reply was not valid JSON — re-prompting");
                messages.push(ChatMessage {
                    role: "assistant".into(),
                    content: reply.clone(),
                });
                messages.push(ChatMessage::user(format!(
                    "Your previous reply was not valid JSON ({e}). \
                     Respond again with ONLY the JSON object, no prose, no code fences."
                )));
            }
            Err(e) => {
                bail!("LLM reply failed JSON validation after repairs: {e}");
            }
        }
    }

    unreachable!("repair loop always returns or bails");
}
