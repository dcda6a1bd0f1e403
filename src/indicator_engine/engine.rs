// =============================================================================
// Indicator Engine — bounded worker pool over per-symbol suite computation
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::Semaphore;
use tracing::{instrument, warn};

use crate::errors::{EngineError, EngineResult};
use crate::market_data::Candle;

use super::composite::top_n;
use super::suite::{compute_suite, IndicatorSuite};

const DEFAULT_BATCH_SIZE: usize = 10;
const DEFAULT_MAX_QUEUE_DEPTH: usize = 1000;
const DEFAULT_WORKER_TIMEOUT: Duration = Duration::from_secs(30);

/// Worker count per §4.4: `min(2 * hardware_parallelism, 16)`, minimum 4.
pub fn default_worker_count() -> usize {
    let cores = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4);
    (2 * cores).clamp(4, 16)
}

#[derive(Debug, Clone)]
pub struct EngineStats {
    pub active_workers: usize,
    pub queue_depth: usize,
    pub throughput: u64,
    pub avg_processing_time_ms: f64,
}

struct QueuedJob {
    symbol: String,
    candles: Vec<Candle>,
}

struct Shared {
    results: RwLock<HashMap<String, IndicatorSuite>>,
    queue: RwLock<VecDeque<QueuedJob>>,
    semaphore: Semaphore,
    worker_count: usize,
    max_queue_depth: usize,
    worker_timeout: Duration,
    active_workers: AtomicUsize,
    completed_jobs: AtomicU64,
    total_processing_ms: AtomicU64,
}

/// Computes and ranks the indicator suite for each tracked symbol using a
/// bounded pool of async workers. Enqueued jobs are drained in FIFO batches;
/// no job occupies a worker beyond `worker_timeout`.
pub struct IndicatorEngine {
    shared: Arc<Shared>,
}

impl IndicatorEngine {
    pub fn new() -> Self {
        Self::with_config(default_worker_count(), DEFAULT_WORKER_TIMEOUT, DEFAULT_MAX_QUEUE_DEPTH)
    }

    pub fn with_config(worker_count: usize, worker_timeout: Duration, max_queue_depth: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                results: RwLock::new(HashMap::new()),
                queue: RwLock::new(VecDeque::new()),
                semaphore: Semaphore::new(worker_count),
                worker_count,
                max_queue_depth,
                worker_timeout,
                active_workers: AtomicUsize::new(0),
                completed_jobs: AtomicU64::new(0),
                total_processing_ms: AtomicU64::new(0),
            }),
        }
    }

    /// Submit a symbol's candle buffer for suite computation. Fails fast
    /// with `Overloaded` if the queue is already at capacity.
    #[instrument(skip(self, candles), fields(symbol = %symbol, bars = candles.len()))]
    pub fn enqueue(&self, symbol: impl Into<String>, candles: Vec<Candle>) -> EngineResult<()> {
        let mut queue = self.shared.queue.write();
        if queue.len() >= self.shared.max_queue_depth {
            return Err(EngineError::Overloaded {
                depth: queue.len(),
                max: self.shared.max_queue_depth,
            });
        }
        queue.push_back(QueuedJob {
            symbol: symbol.into(),
            candles,
        });
        Ok(())
    }

    /// Drain up to `batch_size` queued jobs and run them concurrently,
    /// bounded by the worker-pool semaphore. Intended to be called on a
    /// fixed cadence (e.g. every 100 ms) by the data orchestrator's loop.
    pub async fn drain_batch(&self, batch_size: usize) -> EngineResult<usize> {
        let jobs: Vec<QueuedJob> = {
            let mut queue = self.shared.queue.write();
            let n = batch_size.min(queue.len());
            queue.drain(..n).collect()
        };
        if jobs.is_empty() {
            return Ok(0);
        }

        let shared = Arc::clone(&self.shared);
        let deadline = shared.worker_timeout;

        let handles: Vec<_> = jobs
            .into_iter()
            .map(|job| {
                let shared = Arc::clone(&shared);
                tokio::spawn(async move { run_job(shared, job, deadline).await })
            })
            .collect();

        let mut completed = 0;
        for handle in handles {
            match handle.await {
                Ok(Ok(())) => completed += 1,
                Ok(Err(err)) => warn!(error = %err, "indicator worker job failed"),
                Err(join_err) => warn!(error = %join_err, "indicator worker task panicked"),
            }
        }
        Ok(completed)
    }

    /// Run the default batch size once. Convenience for callers that don't
    /// need a custom batch size.
    pub async fn drain(&self) -> EngineResult<usize> {
        self.drain_batch(DEFAULT_BATCH_SIZE).await
    }

    pub fn composite(&self, symbol: &str) -> Option<IndicatorSuite> {
        self.shared.results.read().get(symbol).cloned()
    }

    pub fn results(&self, symbol: &str) -> Option<IndicatorSuite> {
        self.composite(symbol)
    }

    pub fn top(&self, n: usize, min_confidence: f64) -> Vec<(String, IndicatorSuite)> {
        let snapshot: Vec<(String, IndicatorSuite)> = self
            .shared
            .results
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        top_n(&snapshot, n, min_confidence)
    }

    pub fn stats(&self) -> EngineStats {
        let completed = self.shared.completed_jobs.load(Ordering::Relaxed);
        let total_ms = self.shared.total_processing_ms.load(Ordering::Relaxed);
        let avg = if completed > 0 {
            total_ms as f64 / completed as f64
        } else {
            0.0
        };
        EngineStats {
            active_workers: self.shared.active_workers.load(Ordering::Relaxed),
            queue_depth: self.shared.queue.read().len(),
            throughput: completed,
            avg_processing_time_ms: avg,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.shared.worker_count
    }
}

impl Default for IndicatorEngine {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_job(shared: Arc<Shared>, job: QueuedJob, timeout: Duration) -> EngineResult<()> {
    let permit = shared
        .semaphore
        .acquire()
        .await
        .expect("semaphore is never closed");
    shared.active_workers.fetch_add(1, Ordering::Relaxed);

    let started = Instant::now();
    let candles = job.candles;
    let compute = tokio::task::spawn_blocking(move || compute_suite(&candles));

    let result = tokio::time::timeout(timeout, compute).await;
    shared.active_workers.fetch_sub(1, Ordering::Relaxed);
    drop(permit);

    match result {
        Ok(Ok(suite)) => {
            shared.results.write().insert(job.symbol, suite);
            shared.completed_jobs.fetch_add(1, Ordering::Relaxed);
            shared
                .total_processing_ms
                .fetch_add(started.elapsed().as_millis() as u64, Ordering::Relaxed);
            Ok(())
        }
        Ok(Err(join_err)) => {
            warn!(error = %join_err, symbol = %job.symbol, "suite computation panicked");
            Err(EngineError::WorkerTimeout(timeout))
        }
        Err(_elapsed) => Err(EngineError::WorkerTimeout(timeout)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(i: usize, base: f64) -> Candle {
        Candle::new(
            i as i64 * 60_000,
            i as i64 * 60_000 + 59_999,
            base,
            base + 1.0,
            base - 1.0,
            base,
            100.0,
            0.0,
            10,
            0.0,
            0.0,
            true,
        )
    }

    fn candles(n: usize) -> Vec<Candle> {
        (0..n).map(|i| candle(i, 100.0 + i as f64)).collect()
    }

    #[test]
    fn default_worker_count_is_within_bounds() {
        let n = default_worker_count();
        assert!((4..=16).contains(&n));
    }

    #[tokio::test]
    async fn enqueue_and_drain_populates_results() {
        let engine = IndicatorEngine::new();
        engine.enqueue("BTCUSDT", candles(60)).unwrap();
        let completed = engine.drain_batch(10).await.unwrap();
        assert_eq!(completed, 1);
        assert!(engine.composite("BTCUSDT").is_some());
    }

    #[tokio::test]
    async fn drain_with_empty_queue_is_noop() {
        let engine = IndicatorEngine::new();
        let completed = engine.drain_batch(10).await.unwrap();
        assert_eq!(completed, 0);
    }

    #[test]
    fn enqueue_rejects_beyond_max_queue_depth() {
        let engine = IndicatorEngine::with_config(4, Duration::from_secs(1), 2);
        engine.enqueue("A", candles(30)).unwrap();
        engine.enqueue("B", candles(30)).unwrap();
        let err = engine.enqueue("C", candles(30)).unwrap_err();
        assert!(matches!(err, EngineError::Overloaded { .. }));
    }

    #[tokio::test]
    async fn stats_reflect_completed_throughput() {
        let engine = IndicatorEngine::new();
        engine.enqueue("BTCUSDT", candles(60)).unwrap();
        engine.enqueue("ETHUSDT", candles(60)).unwrap();
        engine.drain_batch(10).await.unwrap();
        let stats = engine.stats();
        assert_eq!(stats.throughput, 2);
        assert_eq!(stats.queue_depth, 0);
    }

    #[tokio::test]
    async fn top_filters_by_confidence_and_sorts() {
        let engine = IndicatorEngine::new();
        engine.enqueue("BTCUSDT", candles(60)).unwrap();
        engine.drain_batch(10).await.unwrap();
        let ranked = engine.top(5, -1.0);
        assert_eq!(ranked.len(), 1);
    }
}
