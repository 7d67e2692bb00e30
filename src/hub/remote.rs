// =============================================================================
// Hub RPC — loopback surface sharing the hub across processes
// =============================================================================
//
// Producer processes POST updates, consumer processes GET reads; the hub's
// get/update contracts and staleness TTLs hold unchanged across the
// boundary. The same router carries the runtime control surface (task
// status, pause/resume).
//
// Authentication: shared secret from MERIDIAN_HUB_SECRET. Each request
// carries `X-Auth-Timestamp` and `Authorization: Bearer <hex hmac-sha256 of
// the timestamp>`; signatures are recomputed server-side and compared in
// constant time, and timestamps older than 30 s are refused.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{FromRequestParts, Path, Query, State},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::sync::watch;
use tracing::{info, warn};

use super::{MarketDataHub, StalenessReport};
use crate::status::StatusRegistry;
use crate::types::{Candle, OrderFlowMetrics, TaSnapshot, Tick, TradingMode};

type HmacSha256 = Hmac<Sha256>;

/// Environment variable holding the shared secret.
pub const SECRET_ENV: &str = "MERIDIAN_HUB_SECRET";
/// Maximum accepted age of a request timestamp, in seconds.
const MAX_TIMESTAMP_SKEW_SECS: i64 = 30;

// ---------------------------------------------------------------------------
// Signing helpers (shared by server and client)
// ---------------------------------------------------------------------------

/// Hex HMAC-SHA256 signature of `timestamp` under `secret`.
pub fn sign_timestamp(secret: &str, timestamp: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(timestamp.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time byte comparison; examines every byte even after the first
/// mismatch.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

/// Validate a presented signature + timestamp against the secret at `now`.
pub fn validate_signature(secret: &str, timestamp: &str, signature: &str, now_unix: i64) -> bool {
    let Ok(ts) = timestamp.parse::<i64>() else {
        return false;
    };
    if (now_unix - ts).abs() > MAX_TIMESTAMP_SKEW_SECS {
        return false;
    }
    let expected = sign_timestamp(secret, timestamp);
    constant_time_eq(expected.as_bytes(), signature.as_bytes())
}

// ---------------------------------------------------------------------------
// Extractor
// ---------------------------------------------------------------------------

/// Axum extractor enforcing the signed-timestamp handshake. The secret is
/// read from the environment on every request so rotation does not require
/// a restart.
pub struct HubAuth;

pub struct AuthRejection {
    message: &'static str,
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.message });
        (StatusCode::FORBIDDEN, Json(body)).into_response()
    }
}

impl<S> FromRequestParts<S> for HubAuth
where
    S: Send + Sync,
{
    type Rejection = AuthRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let secret = std::env::var(SECRET_ENV).unwrap_or_default();
        if secret.is_empty() {
            warn!("{SECRET_ENV} is not set — all hub RPC requests will be rejected");
            return Err(AuthRejection {
                message: "hub authentication not configured",
            });
        }

        let timestamp = parts
            .headers
            .get("x-auth-timestamp")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();

        let signature = match parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
        {
            Some(value) if value.starts_with("Bearer ") => &value[7..],
            _ => {
                warn!("missing or malformed Authorization header on hub RPC");
                return Err(AuthRejection {
                    message: "missing or invalid authorization",
                });
            }
        };

        if !validate_signature(&secret, timestamp, signature, Utc::now().timestamp()) {
            warn!("invalid hub RPC signature presented");
            return Err(AuthRejection {
                message: "invalid authorization",
            });
        }

        Ok(HubAuth)
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Shared state behind the RPC and control routes.
pub struct RpcState {
    pub hub: Arc<MarketDataHub>,
    pub status: Arc<StatusRegistry>,
    pub trading_mode: Arc<RwLock<TradingMode>>,
}

pub fn router(state: Arc<RpcState>) -> Router {
    Router::new()
        // ── Public ───────────────────────────────────────────────────
        .route("/hub/v1/health", get(health))
        // ── Hub reads ────────────────────────────────────────────────
        .route("/hub/v1/tick/{instrument}", get(get_tick))
        .route("/hub/v1/candles/{instrument}/{timeframe}", get(get_candles))
        .route("/hub/v1/order_flow/{instrument}", get(get_order_flow))
        .route("/hub/v1/ta/{instrument}", get(get_ta))
        .route("/hub/v1/staleness/{instrument}", get(get_staleness))
        // ── Hub writes (producer side) ───────────────────────────────
        .route("/hub/v1/tick", post(put_tick))
        .route("/hub/v1/candle", post(put_candle))
        .route("/hub/v1/order_flow", post(put_order_flow))
        .route("/hub/v1/ta", post(put_ta))
        // ── Control surface ──────────────────────────────────────────
        .route("/hub/v1/status", get(get_status))
        .route("/hub/v1/control/pause", post(control_pause))
        .route("/hub/v1/control/resume", post(control_resume))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "server_time": Utc::now().timestamp_millis(),
    }))
}

async fn get_tick(
    _auth: HubAuth,
    State(state): State<Arc<RpcState>>,
    Path(instrument): Path<String>,
) -> Json<Option<Tick>> {
    Json(state.hub.get_latest_tick(&instrument))
}

#[derive(Debug, Deserialize)]
struct LimitQuery {
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    100
}

async fn get_candles(
    _auth: HubAuth,
    State(state): State<Arc<RpcState>>,
    Path((instrument, timeframe)): Path<(String, String)>,
    Query(query): Query<LimitQuery>,
) -> Json<Vec<Candle>> {
    Json(state.hub.get_latest_candles(&instrument, &timeframe, query.limit))
}

async fn get_order_flow(
    _auth: HubAuth,
    State(state): State<Arc<RpcState>>,
    Path(instrument): Path<String>,
) -> Json<Option<OrderFlowMetrics>> {
    Json(state.hub.get_latest_order_flow(&instrument))
}

async fn get_ta(
    _auth: HubAuth,
    State(state): State<Arc<RpcState>>,
    Path(instrument): Path<String>,
) -> Json<Option<TaSnapshot>> {
    Json(state.hub.get_latest_ta(&instrument))
}

async fn get_staleness(
    _auth: HubAuth,
    State(state): State<Arc<RpcState>>,
    Path(instrument): Path<String>,
) -> Json<StalenessReport> {
    Json(state.hub.check_staleness(&instrument, Utc::now()))
}

async fn put_tick(
    _auth: HubAuth,
    State(state): State<Arc<RpcState>>,
    Json(tick): Json<Tick>,
) -> StatusCode {
    state.hub.update_tick(tick);
    StatusCode::NO_CONTENT
}

async fn put_candle(
    _auth: HubAuth,
    State(state): State<Arc<RpcState>>,
    Json(candle): Json<Candle>,
) -> Response {
    if let Err(e) = candle.validate() {
        return (StatusCode::BAD_REQUEST, Json(serde_json::json!({ "error": e.to_string() })))
            .into_response();
    }
    state.hub.update_candle(candle);
    StatusCode::NO_CONTENT.into_response()
}

async fn put_order_flow(
    _auth: HubAuth,
    State(state): State<Arc<RpcState>>,
    Json(metrics): Json<OrderFlowMetrics>,
) -> StatusCode {
    state.hub.update_order_flow(metrics);
    StatusCode::NO_CONTENT
}

async fn put_ta(
    _auth: HubAuth,
    State(state): State<Arc<RpcState>>,
    Json(snapshot): Json<TaSnapshot>,
) -> StatusCode {
    state.hub.update_ta(snapshot);
    StatusCode::NO_CONTENT
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    trading_mode: String,
    tasks: Vec<crate::status::TaskStatus>,
    server_time: i64,
}

async fn get_status(
    _auth: HubAuth,
    State(state): State<Arc<RpcState>>,
) -> Json<StatusResponse> {
    Json(StatusResponse {
        trading_mode: state.trading_mode.read().to_string(),
        tasks: state.status.snapshot(),
        server_time: Utc::now().timestamp_millis(),
    })
}

async fn control_pause(
    _auth: HubAuth,
    State(state): State<Arc<RpcState>>,
) -> Json<serde_json::Value> {
    *state.trading_mode.write() = TradingMode::Paused;
    info!("trading paused via control surface");
    Json(serde_json::json!({ "trading_mode": "Paused" }))
}

async fn control_resume(
    _auth: HubAuth,
    State(state): State<Arc<RpcState>>,
) -> Json<serde_json::Value> {
    *state.trading_mode.write() = TradingMode::Live;
    info!("trading resumed via control surface");
    Json(serde_json::json!({ "trading_mode": "Live" }))
}

/// Serve the RPC router until shutdown.
pub async fn serve(
    bind_addr: String,
    state: Arc<RpcState>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind hub RPC listener on {bind_addr}"))?;
    info!(addr = %bind_addr, "hub RPC listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
        .context("hub RPC server failed")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Consumer-side client preserving the hub method contracts over the RPC
/// boundary. Staleness is still answered by the owning process's hub, so the
/// TTL semantics are identical on both sides.
pub struct RemoteHub {
    client: reqwest::Client,
    base_url: String,
    secret: String,
}

impl RemoteHub {
    pub fn new(base_url: impl Into<String>, secret: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(5))
            .build()
            .expect("failed to build reqwest client");
        Self {
            client,
            base_url: base_url.into(),
            secret: secret.into(),
        }
    }

    fn auth_headers(&self) -> (String, String) {
        let timestamp = Utc::now().timestamp().to_string();
        let signature = sign_timestamp(&self.secret, &timestamp);
        (timestamp, format!("Bearer {signature}"))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let (timestamp, authorization) = self.auth_headers();
        let resp = self
            .client
            .get(format!("{}{path}", self.base_url))
            .header("x-auth-timestamp", timestamp)
            .header(axum::http::header::AUTHORIZATION, authorization)
            .send()
            .await
            .with_context(|| format!("hub RPC GET {path} failed"))?;

        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("hub RPC GET {path} returned {status}");
        }
        resp.json()
            .await
            .with_context(|| format!("failed to decode hub RPC response for {path}"))
    }

    async fn post_json<B: Serialize>(&self, path: &str, body: &B) -> Result<()> {
        let (timestamp, authorization) = self.auth_headers();
        let resp = self
            .client
            .post(format!("{}{path}", self.base_url))
            .header("x-auth-timestamp", timestamp)
            .header(axum::http::header::AUTHORIZATION, authorization)
            .json(body)
            .send()
            .await
            .with_context(|| format!("hub RPC POST {path} failed"))?;

        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("hub RPC POST {path} returned {status}");
        }
        Ok(())
    }

    pub async fn get_latest_tick(&self, instrument: &str) -> Result<Option<Tick>> {
        self.get_json(&format!("/hub/v1/tick/{instrument}")).await
    }

    pub async fn get_latest_candles(
        &self,
        instrument: &str,
        timeframe: &str,
        limit: usize,
    ) -> Result<Vec<Candle>> {
        self.get_json(&format!(
            "/hub/v1/candles/{instrument}/{timeframe}?limit={limit}"
        ))
        .await
    }

    pub async fn get_latest_order_flow(&self, instrument: &str) -> Result<Option<OrderFlowMetrics>> {
        self.get_json(&format!("/hub/v1/order_flow/{instrument}")).await
    }

    pub async fn get_latest_ta(&self, instrument: &str) -> Result<Option<TaSnapshot>> {
        self.get_json(&format!("/hub/v1/ta/{instrument}")).await
    }

    pub async fn check_staleness(&self, instrument: &str) -> Result<StalenessReport> {
        self.get_json(&format!("/hub/v1/staleness/{instrument}")).await
    }

    pub async fn update_tick(&self, tick: &Tick) -> Result<()> {
        self.post_json("/hub/v1/tick", tick).await
    }

    pub async fn update_candle(&self, candle: &Candle) -> Result<()> {
        self.post_json("/hub/v1/candle", candle).await
    }

    pub async fn update_order_flow(&self, metrics: &OrderFlowMetrics) -> Result<()> {
        self.post_json("/hub/v1/order_flow", metrics).await
    }

    pub async fn update_ta(&self, snapshot: &TaSnapshot) -> Result<()> {
        self.post_json("/hub/v1/ta", snapshot).await
    }
}

impl std::fmt::Debug for RemoteHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteHub")
            .field("base_url", &self.base_url)
            .field("secret", &"<redacted>")
            .finish()
    }
}
