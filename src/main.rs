// =============================================================================
// Meridian FX — Main Entry Point
// =============================================================================
//
// The engine starts Paused on a Demo account for safety; trading is enabled
// through the control surface. Warm start populates the hub from the store
// before any consumer task runs.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Duration;
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use meridian_fx::config::RuntimeConfig;
use meridian_fx::drivers::http::{HttpCalendarProvider, HttpTaProvider};
use meridian_fx::drivers::llm::LlmClient;
use meridian_fx::drivers::sim::SimBroker;
use meridian_fx::drivers::ws_feed::WsFeed;
use meridian_fx::drivers::BrokerDriver;
use meridian_fx::engine::agents::DebatePipeline;
use meridian_fx::engine::DecisionEngine;
use meridian_fx::fetcher::UnifiedDataFetcher;
use meridian_fx::hub::remote::RpcState;
use meridian_fx::hub::MarketDataHub;
use meridian_fx::ingest::order_flow::OrderFlowIngestor;
use meridian_fx::ingest::spot::SpotTickIngestor;
use meridian_fx::ingest::ta_poller::IndicatorPoller;
use meridian_fx::lifecycle::{run_trade_monitor, TradeLifecycle};
use meridian_fx::news::{run_news_gater, NewsGater};
use meridian_fx::ratelimit::TokenBucket;
use meridian_fx::risk::RiskEngine;
use meridian_fx::status::StatusRegistry;
use meridian_fx::store::batch::{run_batch_writer, BatchWriter};
use meridian_fx::store::Store;
use meridian_fx::hub;
use meridian_fx::types::{AccountMode, Instrument, TradingMode};

const CONFIG_PATH: &str = "runtime_config.json";
/// Candles loaded per instrument at warm start.
const WARM_START_CANDLES: usize = 100;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Meridian FX starting up");

    let mut config = RuntimeConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        RuntimeConfig::default()
    });

    // SAFETY: always come up Paused on a Demo account.
    config.trading_mode = TradingMode::Paused;
    config.account_mode = AccountMode::Demo;

    if let Ok(pairs) = std::env::var("MERIDIAN_INSTRUMENTS") {
        config.instruments = pairs
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
    }

    let instruments: Vec<Instrument> = config
        .instruments
        .iter()
        .map(|id| Instrument::parse(id))
        .collect::<anyhow::Result<_>>()?;
    let registry: HashMap<String, Instrument> = instruments
        .iter()
        .map(|i| (i.id.clone(), i.clone()))
        .collect();

    info!(instruments = ?config.instruments, "configured trading pairs");
    info!(
        trading_mode = %config.trading_mode,
        account_mode = %config.account_mode,
        "engine starting in SAFE mode (Demo + Paused)"
    );

    // ── 2. Store, hub, warm start ────────────────────────────────────────
    let store = Arc::new(Store::open(&config.db_path)?);
    for instrument in &instruments {
        store.upsert_instrument(instrument)?;
    }

    let hub = Arc::new(MarketDataHub::new(&config.hub));
    hub.warm_start(
        &config.instruments,
        |instrument, timeframe, limit| store.fetch_last_candles(instrument, timeframe, limit),
        WARM_START_CANDLES,
    )?;

    // ── 3. Shared plumbing ───────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let status = Arc::new(StatusRegistry::new());
    let trading_mode = Arc::new(RwLock::new(config.trading_mode));
    let writer = BatchWriter::new();

    let mut tasks = Vec::new();

    tasks.push(tokio::spawn(run_batch_writer(
        writer.clone(),
        store.clone(),
        shutdown_rx.clone(),
    )));

    // ── 4. Ingestion pipelines ───────────────────────────────────────────
    let feed_token = std::env::var("MERIDIAN_FEED_TOKEN").unwrap_or_default();

    let broker: Arc<dyn BrokerDriver> = match config.account_mode {
        AccountMode::Demo => Arc::new(SimBroker::with_hub(10_000.0, hub.clone())),
        AccountMode::Live => {
            // The live REST driver plugs in here; until it is configured the
            // simulation broker keeps the engine runnable.
            warn!("live broker driver not configured — routing orders to simulation");
            Arc::new(SimBroker::with_hub(10_000.0, hub.clone()))
        }
    };
    broker.open_session().await?;

    match std::env::var("MERIDIAN_TICK_WS_URL") {
        Ok(url) if !url.is_empty() => {
            let ingestor = Arc::new(SpotTickIngestor::new(
                config.instruments.clone(),
                config.gates.sessions.clone(),
                config.backoff.clone(),
                hub.clone(),
                writer.clone(),
                Arc::new(WsFeed::new(url, feed_token.clone())),
                broker.clone(),
                status.clone(),
            ));
            tasks.push(tokio::spawn(ingestor.run(shutdown_rx.clone())));
        }
        _ => warn!("MERIDIAN_TICK_WS_URL not set — spot tick ingestor disabled"),
    }

    match std::env::var("MERIDIAN_FLOW_WS_URL") {
        Ok(url) if !url.is_empty() => {
            let ingestor = Arc::new(OrderFlowIngestor::new(
                &config.futures_symbols,
                &config.instruments,
                config.order_flow.clone(),
                config.backoff.clone(),
                hub.clone(),
                writer.clone(),
                Arc::new(WsFeed::new(url, feed_token)),
                status.clone(),
            ));
            tasks.push(tokio::spawn(ingestor.run(shutdown_rx.clone())));
        }
        _ => warn!("MERIDIAN_FLOW_WS_URL not set — order flow ingestor disabled"),
    }

    match std::env::var("MERIDIAN_TA_BASE_URL") {
        Ok(url) if !url.is_empty() => {
            let api_key = std::env::var("MERIDIAN_TA_API_KEY").unwrap_or_default();
            let poller = Arc::new(IndicatorPoller::new(
                config.instruments.clone(),
                config.ta.poll_interval_secs,
                Arc::new(HttpTaProvider::new(url, api_key)),
                Arc::new(TokenBucket::per_minute(config.ta.budget_per_minute)),
                hub.clone(),
                writer.clone(),
                status.clone(),
            ));
            tasks.push(tokio::spawn(poller.run(shutdown_rx.clone())));
        }
        _ => warn!("MERIDIAN_TA_BASE_URL not set — indicator poller disabled"),
    }

    // ── 5. News gater ────────────────────────────────────────────────────
    let news = Arc::new(NewsGater::new(config.news.clone(), instruments.clone()));
    match std::env::var("MERIDIAN_NEWS_BASE_URL") {
        Ok(url) if !url.is_empty() => {
            let api_key = std::env::var("MERIDIAN_NEWS_API_KEY").unwrap_or_default();
            tasks.push(tokio::spawn(run_news_gater(
                news.clone(),
                Arc::new(HttpCalendarProvider::new(url, api_key)),
                store.clone(),
                status.clone(),
                shutdown_rx.clone(),
            )));
        }
        _ => warn!("MERIDIAN_NEWS_BASE_URL not set — news calendar refresh disabled"),
    }

    // ── 6. Risk + lifecycle ──────────────────────────────────────────────
    let starting_capital = broker
        .account_snapshot()
        .await
        .map(|a| a.equity)
        .unwrap_or(10_000.0);
    let risk = Arc::new(RiskEngine::new(
        starting_capital,
        config.lifecycle.max_daily_loss_pct / 100.0,
        config.lifecycle.max_consecutive_losses,
        config.lifecycle.max_trades_per_day,
        Duration::seconds(config.lifecycle.loss_cooldown_secs),
    ));
    let lifecycle = Arc::new(TradeLifecycle::new(
        config.lifecycle.clone(),
        registry,
        risk.clone(),
    ));

    tasks.push(tokio::spawn(run_trade_monitor(
        lifecycle.clone(),
        hub.clone(),
        news.clone(),
        broker.clone(),
        store.clone(),
        status.clone(),
        shutdown_rx.clone(),
    )));

    // ── 7. Decision engine ───────────────────────────────────────────────
    let llm_base = std::env::var("MERIDIAN_LLM_BASE_URL")
        .unwrap_or_else(|_| "https://api.openai.com".into());
    let llm_key = std::env::var("MERIDIAN_LLM_API_KEY").unwrap_or_default();
    let llm_bucket = Arc::new(TokenBucket::per_minute(config.llm.calls_per_minute));
    let llm = Arc::new(LlmClient::new(llm_base, llm_key, &config.llm, llm_bucket));
    let debate = Arc::new(DebatePipeline::new(llm, config.llm.max_tokens));

    let fetcher = Arc::new(UnifiedDataFetcher::new(hub.clone(), store.clone()));
    let decision_engine = Arc::new(DecisionEngine::new(
        config.clone(),
        instruments,
        fetcher,
        hub.clone(),
        store.clone(),
        lifecycle,
        news,
        risk,
        debate,
        broker,
        status.clone(),
        trading_mode.clone(),
    ));
    tasks.push(tokio::spawn(decision_engine.run(shutdown_rx.clone())));

    // ── 8. Hub RPC + control surface ─────────────────────────────────────
    let rpc_state = Arc::new(RpcState {
        hub,
        status,
        trading_mode,
    });
    let rpc_addr = config.hub_bind_addr.clone();
    let rpc_shutdown = shutdown_rx.clone();
    tasks.push(tokio::spawn(async move {
        if let Err(e) = hub::remote::serve(rpc_addr, rpc_state, rpc_shutdown).await {
            error!(error = %e, "hub RPC server exited");
        }
    }));

    info!("all subsystems running — press Ctrl+C to stop");

    // ── 9. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping gracefully");
    let _ = shutdown_tx.send(true);

    let drain = tokio::time::timeout(
        std::time::Duration::from_secs(10),
        futures_util::future::join_all(tasks),
    );
    if drain.await.is_err() {
        warn!("shutdown budget exceeded — some tasks did not drain");
    }

    if let Err(e) = config.save(CONFIG_PATH) {
        error!(error = %e, "failed to save runtime config on shutdown");
    }

    info!("Meridian FX shut down complete");
    Ok(())
}
