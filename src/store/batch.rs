// =============================================================================
// Batch Writer — bounded queue between producers and the store
// =============================================================================
//
// Producers must never block on database I/O: rows are pushed into a bounded
// in-memory queue and flushed by a dedicated task either every second or as
// soon as the buffer reaches the flush threshold. When the store is down and
// the queue overflows, the oldest rows are dropped and counted.
// =============================================================================

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tokio::time::{interval, Duration};
use tracing::{error, info, warn};

use super::{Row, Store};

/// Flush when this many rows are buffered, even if the 1 s tick has not fired.
const FLUSH_THRESHOLD: usize = 1000;
/// Hard queue bound; beyond this, oldest rows are dropped.
const QUEUE_CAP: usize = 4096;
/// Flush cadence.
const FLUSH_INTERVAL_MS: u64 = 1000;

/// Cloneable handle used by producers to enqueue rows.
#[derive(Clone)]
pub struct BatchWriter {
    queue: Arc<Mutex<VecDeque<Row>>>,
    notify: Arc<Notify>,
    dropped: Arc<AtomicU64>,
}

impl BatchWriter {
    pub fn new() -> Self {
        Self {
            queue: Arc::new(Mutex::new(VecDeque::with_capacity(QUEUE_CAP))),
            notify: Arc::new(Notify::new()),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Enqueue a row without blocking. Drops the oldest buffered row when the
    /// queue is at capacity (producers never stall on store outages).
    pub fn push(&self, row: Row) {
        let len = {
            let mut queue = self.queue.lock();
            if queue.len() >= QUEUE_CAP {
                queue.pop_front();
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped % 1000 == 1 {
                    warn!(dropped, "batch queue overflow — dropping oldest rows");
                }
            }
            queue.push_back(row);
            queue.len()
        };

        if len >= FLUSH_THRESHOLD {
            self.notify.notify_one();
        }
    }

    /// Rows dropped due to overflow since startup.
    pub fn dropped_rows(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Rows currently waiting to be flushed.
    pub fn backlog(&self) -> usize {
        self.queue.lock().len()
    }

    fn drain(&self) -> Vec<Row> {
        let mut queue = self.queue.lock();
        queue.drain(..).collect()
    }

    /// Synchronously flush everything buffered (used at shutdown and in
    /// tests).
    pub fn flush_now(&self, store: &Store) -> anyhow::Result<()> {
        let rows = self.drain();
        store.apply_batch(&rows)
    }
}

impl Default for BatchWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Run the flush loop. Spawned once at startup; exits when the shutdown
/// signal flips, after a final drain.
pub async fn run_batch_writer(
    writer: BatchWriter,
    store: Arc<Store>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(
        flush_interval_ms = FLUSH_INTERVAL_MS,
        flush_threshold = FLUSH_THRESHOLD,
        "batch writer started"
    );

    let mut ticker = interval(Duration::from_millis(FLUSH_INTERVAL_MS));

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = writer.notify.notified() => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    if let Err(e) = writer.flush_now(&store) {
                        error!(error = %e, "final batch flush failed");
                    }
                    info!("batch writer stopped");
                    return;
                }
            }
        }

        let rows = writer.drain();
        if rows.is_empty() {
            continue;
        }
        if let Err(e) = store.apply_batch(&rows) {
            error!(error = %e, rows = rows.len(), "batch flush failed — rows lost");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Tick;
    use chrono::Utc;

    #[test]
    fn push_and_flush_now() {
        let store = Store::open_in_memory().unwrap();
        let writer = BatchWriter::new();

        for _ in 0..10 {
            writer.push(Row::Tick(Tick::new("EUR_USD", Utc::now(), 1.0850, 1.0851)));
        }
        assert_eq!(writer.backlog(), 10);

        writer.flush_now(&store).unwrap();
        assert_eq!(writer.backlog(), 0);
        assert_eq!(store.count_rows("spot_ticks").unwrap(), 10);
    }

    #[test]
    fn overflow_drops_oldest_and_counts() {
        let writer = BatchWriter::new();
        for i in 0..(QUEUE_CAP + 100) {
            writer.push(Row::Tick(Tick::new(
                "EUR_USD",
                Utc::now(),
                1.0 + i as f64 * 1e-6,
                1.0001 + i as f64 * 1e-6,
            )));
        }
        assert_eq!(writer.backlog(), QUEUE_CAP);
        assert_eq!(writer.dropped_rows(), 100);
    }

    #[tokio::test]
    async fn writer_task_flushes_on_shutdown() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let writer = BatchWriter::new();
        let (tx, rx) = watch::channel(false);

        writer.push(Row::Tick(Tick::new("EUR_USD", Utc::now(), 1.0850, 1.0851)));

        let task = tokio::spawn(run_batch_writer(writer.clone(), store.clone(), rx));
        tx.send(true).unwrap();
        task.await.unwrap();

        assert_eq!(store.count_rows("spot_ticks").unwrap(), 1);
    }
}
