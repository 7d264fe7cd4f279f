//! Bounded stream processor with load-based backpressure.
//!
//! Records enter through `offer`, queue in a bounded buffer, and are cut
//! into batches for the async handler, which runs under a concurrency
//! budget, a per-batch deadline, and a circuit breaker. A batch that errors
//! marks every record errored and routes them to the attached dead-letter
//! channel; errors never take the pipeline down.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::config::{BackpressureStrategy, ProcessorConfig};
use super::metrics::{resident_memory_mb, MetricsRecorder};
use crate::kernel::breaker::CircuitBreaker;

/// Consecutive batch failures before the process breaker opens.
const BREAKER_THRESHOLD: u32 = 5;
/// How long the process breaker stays open.
const BREAKER_COOLDOWN: Duration = Duration::from_secs(30);
/// Intake pause under the circuit-breaker backpressure strategy.
const INTAKE_PAUSE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipeline is closed")]
    Closed,
}

/// What happened to an offered record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferOutcome {
    Accepted,
    /// Discarded by the drop backpressure strategy.
    Dropped,
}

type BatchFn<T> =
    Arc<dyn Fn(Vec<T>) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> + Send + Sync>;

pub struct StreamProcessor<T> {
    config: ProcessorConfig,
    metrics: Arc<MetricsRecorder>,
    breaker: Arc<CircuitBreaker>,
    ingress: Mutex<Option<mpsc::Sender<T>>>,
    pending: Arc<AtomicUsize>,
    paused_until: Arc<Mutex<Option<Instant>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    monitor_cancel: CancellationToken,
}

impl<T: Clone + Send + 'static> StreamProcessor<T> {
    pub fn new<F, Fut>(config: ProcessorConfig, handler: F) -> Self
    where
        F: Fn(Vec<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self::with_dead_letter(config, handler, None)
    }

    /// Build with a dead-letter channel receiving records from errored
    /// batches.
    pub fn with_dead_letter<F, Fut>(
        config: ProcessorConfig,
        handler: F,
        dead_letter: Option<mpsc::Sender<T>>,
    ) -> Self
    where
        F: Fn(Vec<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler: BatchFn<T> = Arc::new(move |batch| Box::pin(handler(batch)));
        let metrics = Arc::new(MetricsRecorder::new());
        let breaker = Arc::new(CircuitBreaker::new(BREAKER_THRESHOLD, BREAKER_COOLDOWN));
        let pending = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel(config.buffer_size.max(1));
        let monitor_cancel = CancellationToken::new();

        let worker = tokio::spawn(run_loop(
            rx,
            handler,
            dead_letter,
            config.clone(),
            metrics.clone(),
            breaker.clone(),
            pending.clone(),
        ));

        if config.monitoring.enabled {
            let metrics = metrics.clone();
            let interval = Duration::from_millis(config.monitoring.metrics_interval_ms.max(100));
            let capacity = config.buffer_size;
            let cancel = monitor_cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(interval) => {
                            metrics.snapshot(capacity);
                        }
                    }
                }
            });
        }

        Self {
            config,
            metrics,
            breaker,
            ingress: Mutex::new(Some(tx)),
            pending,
            paused_until: Arc::new(Mutex::new(None)),
            worker: Mutex::new(Some(worker)),
            monitor_cancel,
        }
    }

    /// Current load: the worst of buffer fill, in-flight work against the
    /// concurrency budget, and process heap against a 1 GiB ceiling.
    pub fn load(&self) -> f64 {
        let buffer_fill = self.metrics.buffered() as f64 / self.config.buffer_size.max(1) as f64;
        let pending =
            self.pending.load(Ordering::Relaxed) as f64 / self.config.max_concurrency.max(1) as f64;
        let heap = resident_memory_mb() / 1024.0;
        buffer_fill.max(pending).max(heap)
    }

    fn backpressure_active(&self) -> bool {
        self.load() > self.config.backpressure_threshold
    }

    /// Offer one record to the pipeline, applying the configured
    /// backpressure strategy when overloaded.
    pub async fn offer(&self, record: T) -> Result<OfferOutcome, PipelineError> {
        let sender = self
            .ingress
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(PipelineError::Closed)?;

        // A previous circuit-breaker activation may still hold the intake.
        let pause = *self.paused_until.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(until) = pause {
            if Instant::now() < until {
                tokio::time::sleep_until(until).await;
            }
        }

        if self.backpressure_active() {
            self.metrics.record_backpressure();
            match self.config.backpressure_strategy {
                BackpressureStrategy::Drop => {
                    self.metrics.record_dropped(1);
                    return Ok(OfferOutcome::Dropped);
                }
                BackpressureStrategy::Buffer => {
                    // Blocking send below is the wait.
                }
                BackpressureStrategy::Throttle => {
                    let millis = (self.load() * 100.0).min(1000.0);
                    tokio::time::sleep(Duration::from_millis(millis as u64)).await;
                }
                BackpressureStrategy::CircuitBreaker => {
                    let until = Instant::now() + INTAKE_PAUSE;
                    *self.paused_until.lock().unwrap_or_else(|e| e.into_inner()) = Some(until);
                    tokio::time::sleep_until(until).await;
                }
            }
        }

        // Count before sending so the consumer side never decrements first.
        self.metrics.add_buffered(1);
        if sender.send(record).await.is_err() {
            self.metrics.sub_buffered(1);
            return Err(PipelineError::Closed);
        }
        Ok(OfferOutcome::Accepted)
    }

    /// Close the intake; buffered records still drain through the handler.
    pub fn close(&self) {
        self.ingress
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }

    /// Wait for the drain after `close`.
    pub async fn join(&self) {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
        self.monitor_cancel.cancel();
    }

    pub fn metrics(&self) -> Arc<MetricsRecorder> {
        self.metrics.clone()
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    pub fn breaker_open(&self) -> bool {
        self.breaker.is_open()
    }
}

impl<T> Drop for StreamProcessor<T> {
    fn drop(&mut self) {
        self.monitor_cancel.cancel();
    }
}

async fn run_loop<T: Clone + Send + 'static>(
    mut rx: mpsc::Receiver<T>,
    handler: BatchFn<T>,
    dead_letter: Option<mpsc::Sender<T>>,
    config: ProcessorConfig,
    metrics: Arc<MetricsRecorder>,
    breaker: Arc<CircuitBreaker>,
    pending: Arc<AtomicUsize>,
) {
    let batch_size = config.batch_size.max(1);
    let max_concurrency = config.max_concurrency.max(1);
    let semaphore = Arc::new(Semaphore::new(max_concurrency));
    let timeout = Duration::from_millis(config.timeout_ms.max(1));
    let mut batch: Vec<T> = Vec::with_capacity(batch_size);

    while let Some(record) = rx.recv().await {
        metrics.sub_buffered(1);
        batch.push(record);
        if batch.len() >= batch_size {
            let full = std::mem::replace(&mut batch, Vec::with_capacity(batch_size));
            dispatch_batch(
                full,
                &handler,
                &dead_letter,
                &semaphore,
                timeout,
                &metrics,
                &breaker,
                &pending,
            )
            .await;
        }
    }

    // Flush-on-close.
    if !batch.is_empty() {
        dispatch_batch(
            batch,
            &handler,
            &dead_letter,
            &semaphore,
            timeout,
            &metrics,
            &breaker,
            &pending,
        )
        .await;
    }

    // Wait for in-flight batches before reporting the drain complete.
    let _ = semaphore.acquire_many(max_concurrency as u32).await;
}

#[allow(clippy::too_many_arguments)]
async fn dispatch_batch<T: Clone + Send + 'static>(
    batch: Vec<T>,
    handler: &BatchFn<T>,
    dead_letter: &Option<mpsc::Sender<T>>,
    semaphore: &Arc<Semaphore>,
    timeout: Duration,
    metrics: &Arc<MetricsRecorder>,
    breaker: &Arc<CircuitBreaker>,
    pending: &Arc<AtomicUsize>,
) {
    let permit = semaphore
        .clone()
        .acquire_owned()
        .await
        .expect("processor semaphore never closes");
    let count = batch.len();
    pending.fetch_add(count, Ordering::Relaxed);

    let handler = handler.clone();
    let dead_letter = dead_letter.clone();
    let metrics = metrics.clone();
    let breaker = breaker.clone();
    let pending = pending.clone();

    tokio::spawn(async move {
        let _permit = permit;

        if breaker.is_open() {
            tracing::warn!(records = count, "breaker open, failing batch fast");
            metrics.record_errored(count as u64);
            route_dead_letters(&dead_letter, batch).await;
            pending.fetch_sub(count, Ordering::Relaxed);
            return;
        }

        let started = Instant::now();
        let outcome = tokio::time::timeout(timeout, handler(batch.clone())).await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        match outcome {
            Ok(Ok(())) => {
                breaker.record_success();
                metrics.record_processed(count as u64, elapsed_ms);
            }
            Ok(Err(error)) => {
                tracing::warn!(records = count, error = %error, "batch handler failed");
                breaker.record_failure();
                metrics.record_errored(count as u64);
                route_dead_letters(&dead_letter, batch).await;
            }
            Err(_) => {
                tracing::warn!(
                    records = count,
                    timeout_ms = timeout.as_millis() as u64,
                    "batch deadline exceeded"
                );
                breaker.record_failure();
                metrics.record_errored(count as u64);
                route_dead_letters(&dead_letter, batch).await;
            }
        }

        pending.fetch_sub(count, Ordering::Relaxed);
    });
}

async fn route_dead_letters<T>(dead_letter: &Option<mpsc::Sender<T>>, batch: Vec<T>) {
    let Some(sender) = dead_letter else {
        return;
    };
    for record in batch {
        if sender.send(record).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn config() -> ProcessorConfig {
        let mut config = ProcessorConfig::default();
        config.monitoring.enabled = false;
        config
    }

    #[tokio::test]
    async fn records_flow_through_in_batches() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in_handler = seen.clone();

        let mut cfg = config();
        cfg.batch_size = 3;
        let processor = StreamProcessor::new(cfg, move |batch: Vec<i32>| {
            let seen = seen_in_handler.clone();
            async move {
                seen.lock().unwrap().push(batch);
                Ok(())
            }
        });

        for n in 0..7 {
            assert_eq!(processor.offer(n).await.unwrap(), OfferOutcome::Accepted);
        }
        processor.close();
        processor.join().await;

        let batches = seen.lock().unwrap().clone();
        let mut sizes: Vec<usize> = batches.iter().map(|b| b.len()).collect();
        sizes.sort();
        assert_eq!(sizes, vec![1, 3, 3]); // two full cuts plus the close flush
        let mut all: Vec<i32> = batches.into_iter().flatten().collect();
        all.sort();
        assert_eq!(all, (0..7).collect::<Vec<_>>());
        assert_eq!(processor.metrics().processed(), 7);
    }

    #[tokio::test]
    async fn drop_strategy_accounts_for_every_record() {
        let mut cfg = config();
        cfg.buffer_size = 4;
        cfg.batch_size = 2;
        cfg.max_concurrency = 1;
        cfg.backpressure_threshold = 0.5;
        cfg.backpressure_strategy = BackpressureStrategy::Drop;

        let processor = StreamProcessor::new(cfg, |_batch: Vec<i32>| async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(())
        });

        let offered = 50u64;
        let mut dropped_signals = 0u64;
        for n in 0..offered {
            if processor.offer(n as i32).await.unwrap() == OfferOutcome::Dropped {
                dropped_signals += 1;
            }
        }
        processor.close();
        processor.join().await;

        let metrics = processor.metrics();
        assert_eq!(metrics.dropped(), dropped_signals);
        assert_eq!(
            metrics.processed() + metrics.dropped() + metrics.errored(),
            offered
        );
        assert!(metrics.dropped() >= 1, "expected at least one drop");
        assert!(metrics.backpressure_events() >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_strategy_delivers_everything() {
        let mut cfg = config();
        cfg.buffer_size = 10;
        cfg.batch_size = 1;
        cfg.max_concurrency = 1;
        cfg.backpressure_threshold = 0.8;
        cfg.backpressure_strategy = BackpressureStrategy::Throttle;

        let processor = StreamProcessor::new(cfg, |_batch: Vec<i32>| async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(())
        });

        for n in 0..100 {
            assert_eq!(processor.offer(n).await.unwrap(), OfferOutcome::Accepted);
        }
        processor.close();
        processor.join().await;

        let metrics = processor.metrics();
        assert_eq!(metrics.processed(), 100);
        assert_eq!(metrics.dropped(), 0);
        assert!(metrics.backpressure_events() >= 1);
    }

    #[tokio::test]
    async fn errored_batches_route_to_dead_letter() {
        let (dlq_tx, mut dlq_rx) = mpsc::channel(16);
        let mut cfg = config();
        cfg.batch_size = 2;

        let processor = StreamProcessor::with_dead_letter(
            cfg,
            |_batch: Vec<i32>| async { anyhow::bail!("handler broken") },
            Some(dlq_tx),
        );

        for n in 0..4 {
            processor.offer(n).await.unwrap();
        }
        processor.close();
        processor.join().await;

        let mut dead = Vec::new();
        while let Ok(record) = dlq_rx.try_recv() {
            dead.push(record);
        }
        dead.sort();
        assert_eq!(dead, vec![0, 1, 2, 3]);
        assert_eq!(processor.metrics().errored(), 4);
        assert_eq!(processor.metrics().processed(), 0);
    }

    #[tokio::test]
    async fn breaker_opens_and_fails_fast_without_invoking_handler() {
        let invocations = Arc::new(AtomicU32::new(0));
        let invocations_in_handler = invocations.clone();

        let (dlq_tx, mut dlq_rx) = mpsc::channel(32);
        let mut cfg = config();
        cfg.batch_size = 1;
        cfg.max_concurrency = 1;

        let processor = StreamProcessor::with_dead_letter(
            cfg,
            move |_batch: Vec<i32>| {
                let invocations = invocations_in_handler.clone();
                async move {
                    invocations.fetch_add(1, Ordering::SeqCst);
                    anyhow::bail!("always failing")
                }
            },
            Some(dlq_tx),
        );

        for n in 0..8 {
            processor.offer(n).await.unwrap();
        }
        processor.close();
        processor.join().await;

        // Five failures open the breaker; the rest fail fast.
        assert_eq!(invocations.load(Ordering::SeqCst), 5);
        assert!(processor.breaker_open());
        assert_eq!(processor.metrics().errored(), 8);

        let mut dead = 0;
        while dlq_rx.try_recv().is_ok() {
            dead += 1;
        }
        assert_eq!(dead, 8);
    }

    #[tokio::test(start_paused = true)]
    async fn batch_deadline_marks_batch_errored() {
        let (dlq_tx, mut dlq_rx) = mpsc::channel(16);
        let mut cfg = config();
        cfg.batch_size = 2;
        cfg.timeout_ms = 10;

        let processor = StreamProcessor::with_dead_letter(
            cfg,
            |_batch: Vec<i32>| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            },
            Some(dlq_tx),
        );

        processor.offer(1).await.unwrap();
        processor.offer(2).await.unwrap();
        processor.close();
        processor.join().await;

        assert_eq!(processor.metrics().errored(), 2);
        assert_eq!(dlq_rx.recv().await, Some(1));
        assert_eq!(dlq_rx.recv().await, Some(2));
    }

    #[tokio::test]
    async fn offer_after_close_is_an_error() {
        let processor = StreamProcessor::new(config(), |_batch: Vec<i32>| async { Ok(()) });
        processor.close();
        assert!(matches!(
            processor.offer(1).await,
            Err(PipelineError::Closed)
        ));
    }
}
