// =============================================================================
// Indicator Poller — periodic TA aggregator fetch under a global budget
// =============================================================================
//
// One poll loop covers every instrument. Each pass asks the shared token
// bucket before touching the external API; an exhausted budget skips that
// instrument for the cycle without failing the task.
// =============================================================================

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::drivers::TaProvider;
use crate::hub::MarketDataHub;
use crate::ratelimit::TokenBucket;
use crate::status::{StatusRegistry, TaskState};
use crate::store::batch::BatchWriter;
use crate::store::Row;

const TASK_NAME: &str = "ta_poller";

pub struct IndicatorPoller {
    instruments: Vec<String>,
    poll_interval_secs: u64,
    provider: Arc<dyn TaProvider>,
    bucket: Arc<TokenBucket>,
    hub: Arc<MarketDataHub>,
    writer: BatchWriter,
    status: Arc<StatusRegistry>,
}

impl IndicatorPoller {
    pub fn new(
        instruments: Vec<String>,
        poll_interval_secs: u64,
        provider: Arc<dyn TaProvider>,
        bucket: Arc<TokenBucket>,
        hub: Arc<MarketDataHub>,
        writer: BatchWriter,
        status: Arc<StatusRegistry>,
    ) -> Self {
        Self {
            instruments,
            poll_interval_secs,
            provider,
            bucket,
            hub,
            writer,
            status,
        }
    }

    /// One pass over all instruments. Budget exhaustion skips, fetch errors
    /// are logged and counted; neither fails the pass.
    pub async fn poll_once(&self) {
        for instrument in &self.instruments {
            if !self.bucket.try_acquire() {
                debug!(instrument = %instrument, "TA budget exhausted — skipping this cycle");
                continue;
            }

            match self.provider.fetch_aggregate_indicators(instrument).await {
                Ok(snapshot) => {
                    debug!(
                        instrument = %instrument,
                        consensus = %snapshot.consensus,
                        confidence = snapshot.confidence,
                        "TA snapshot fetched"
                    );
                    self.hub.update_ta(snapshot.clone());
                    self.writer.push(Row::Ta(snapshot));
                    self.status.record_event(TASK_NAME);
                }
                Err(e) => {
                    warn!(instrument = %instrument, error = %e, "TA fetch failed");
                    self.status.record_error(TASK_NAME);
                }
            }
        }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.poll_interval_secs,
            instruments = self.instruments.len(),
            "indicator poller started"
        );
        self.status.set_state(TASK_NAME, TaskState::Running);

        let mut ticker = interval(std::time::Duration::from_secs(self.poll_interval_secs));

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.poll_once().await;
                }
            }
        }

        self.status.set_state(TASK_NAME, TaskState::Stopped);
        info!("indicator poller stopped");
    }
}
