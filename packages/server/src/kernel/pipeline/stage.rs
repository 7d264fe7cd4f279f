//! Pipeline stage operators.
//!
//! Each stage is a task owning a bounded input receiver and an output
//! sender; backpressure is implicit in channel capacity. Stages exit when
//! the input closes (flushing whatever they hold) or when the output side
//! hangs up.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::config::RetryConfig;

// ============================================================================
// Token bucket
// ============================================================================

/// Token bucket: refills `rate` tokens per second up to `capacity`.
/// `acquire` suspends until a token is available.
pub struct RateLimiter {
    rate: f64,
    capacity: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    refilled_at: Instant,
}

impl RateLimiter {
    pub fn new(max_rate: f64) -> Self {
        Self::with_burst(max_rate, max_rate.max(1.0))
    }

    pub fn with_burst(max_rate: f64, burst: f64) -> Self {
        Self {
            rate: max_rate.max(f64::MIN_POSITIVE),
            capacity: burst.max(1.0),
            state: Mutex::new(BucketState {
                tokens: burst.max(1.0),
                refilled_at: Instant::now(),
            }),
        }
    }

    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                let now = Instant::now();
                let elapsed = now.duration_since(state.refilled_at).as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.rate).min(self.capacity);
                state.refilled_at = now;

                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - state.tokens) / self.rate)
            };
            tokio::time::sleep(wait).await;
        }
    }
}

// ============================================================================
// Stage spawners
// ============================================================================

/// Drop records failing the predicate.
pub fn spawn_filter<T, P>(
    mut rx: mpsc::Receiver<T>,
    tx: mpsc::Sender<T>,
    predicate: P,
) -> JoinHandle<()>
where
    T: Send + 'static,
    P: Fn(&T) -> bool + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(record) = rx.recv().await {
            if predicate(&record) && tx.send(record).await.is_err() {
                break;
            }
        }
    })
}

/// Map each record through an async function.
pub fn spawn_transform<T, U, F, Fut>(
    mut rx: mpsc::Receiver<T>,
    tx: mpsc::Sender<U>,
    mut transform: F,
) -> JoinHandle<()>
where
    T: Send + 'static,
    U: Send + 'static,
    F: FnMut(T) -> Fut + Send + 'static,
    Fut: Future<Output = U> + Send,
{
    tokio::spawn(async move {
        while let Some(record) = rx.recv().await {
            let mapped = transform(record).await;
            if tx.send(mapped).await.is_err() {
                break;
            }
        }
    })
}

/// Accumulate records and emit lists of `batch_size`; the remainder is
/// flushed when the input closes.
pub fn spawn_batch<T>(
    mut rx: mpsc::Receiver<T>,
    tx: mpsc::Sender<Vec<T>>,
    batch_size: usize,
) -> JoinHandle<()>
where
    T: Send + 'static,
{
    let batch_size = batch_size.max(1);
    tokio::spawn(async move {
        let mut batch = Vec::with_capacity(batch_size);
        while let Some(record) = rx.recv().await {
            batch.push(record);
            if batch.len() >= batch_size {
                let full = std::mem::replace(&mut batch, Vec::with_capacity(batch_size));
                if tx.send(full).await.is_err() {
                    return;
                }
            }
        }
        if !batch.is_empty() {
            let _ = tx.send(batch).await;
        }
    })
}

/// Pass records through a shared token bucket.
pub fn spawn_throttle<T>(
    mut rx: mpsc::Receiver<T>,
    tx: mpsc::Sender<T>,
    limiter: std::sync::Arc<RateLimiter>,
) -> JoinHandle<()>
where
    T: Send + 'static,
{
    tokio::spawn(async move {
        while let Some(record) = rx.recv().await {
            limiter.acquire().await;
            if tx.send(record).await.is_err() {
                break;
            }
        }
    })
}

/// Coalesce same-key updates within `window`; only the latest value per key
/// is emitted, when its deadline passes. Everything held is flushed on close.
pub fn spawn_debounce<T, K, KF>(
    mut rx: mpsc::Receiver<T>,
    tx: mpsc::Sender<T>,
    window: Duration,
    key_of: KF,
) -> JoinHandle<()>
where
    T: Send + 'static,
    K: Eq + Hash + Clone + Send + 'static,
    KF: Fn(&T) -> K + Send + 'static,
{
    tokio::spawn(async move {
        let mut held: HashMap<K, (T, Instant)> = HashMap::new();
        let mut input_open = true;

        while input_open || !held.is_empty() {
            let next_deadline = held.values().map(|(_, deadline)| *deadline).min();
            let sleep_target =
                next_deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                received = rx.recv(), if input_open => match received {
                    Some(record) => {
                        held.insert(key_of(&record), (record, Instant::now() + window));
                    }
                    None => input_open = false,
                },
                _ = tokio::time::sleep_until(sleep_target), if next_deadline.is_some() => {
                    let now = Instant::now();
                    let due: Vec<K> = held
                        .iter()
                        .filter(|(_, (_, deadline))| *deadline <= now)
                        .map(|(key, _)| key.clone())
                        .collect();
                    for key in due {
                        if let Some((record, _)) = held.remove(&key) {
                            if tx.send(record).await.is_err() {
                                return;
                            }
                        }
                    }
                }
                else => break,
            }

            // Input closed: emit what remains immediately.
            if !input_open {
                for (_, (record, _)) in held.drain() {
                    if tx.send(record).await.is_err() {
                        return;
                    }
                }
            }
        }
    })
}

/// Per-record retry delay for attempt `attempt` (0-based).
pub fn retry_delay(config: &RetryConfig, attempt: u32) -> Duration {
    const BASE_MS: f64 = 100.0;
    let ms = BASE_MS * config.backoff_multiplier.powi(attempt as i32);
    Duration::from_millis(ms.min(config.max_backoff_ms as f64) as u64)
}

/// Retry each record against `attempt_fn` with exponential backoff; records
/// that exhaust the budget are emitted on the dead-letter channel.
pub fn spawn_dead_letter<T, F, Fut>(
    mut rx: mpsc::Receiver<T>,
    out: mpsc::Sender<T>,
    dead_letter: mpsc::Sender<T>,
    config: RetryConfig,
    attempt_fn: F,
) -> JoinHandle<()>
where
    T: Clone + Send + Sync + 'static,
    F: Fn(T) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    tokio::spawn(async move {
        while let Some(record) = rx.recv().await {
            let mut delivered = false;
            for attempt in 0..=config.max {
                match attempt_fn(record.clone()).await {
                    Ok(()) => {
                        delivered = true;
                        break;
                    }
                    Err(error) => {
                        if attempt < config.max {
                            let delay = retry_delay(&config, attempt);
                            tracing::debug!(
                                attempt,
                                delay_ms = delay.as_millis() as u64,
                                error = %error,
                                "record attempt failed, backing off"
                            );
                            tokio::time::sleep(delay).await;
                        }
                    }
                }
            }

            let target = if delivered { &out } else { &dead_letter };
            if target.send(record).await.is_err() {
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn filter_drops_failing_records() {
        let (in_tx, in_rx) = mpsc::channel(16);
        let (out_tx, mut out_rx) = mpsc::channel(16);
        spawn_filter(in_rx, out_tx, |n: &i32| n % 2 == 0);

        for n in 0..6 {
            in_tx.send(n).await.unwrap();
        }
        drop(in_tx);

        let mut seen = Vec::new();
        while let Some(n) = out_rx.recv().await {
            seen.push(n);
        }
        assert_eq!(seen, vec![0, 2, 4]);
    }

    #[tokio::test]
    async fn transform_maps_asynchronously() {
        let (in_tx, in_rx) = mpsc::channel(16);
        let (out_tx, mut out_rx) = mpsc::channel(16);
        spawn_transform(in_rx, out_tx, |n: i32| async move { n * 10 });

        in_tx.send(3).await.unwrap();
        drop(in_tx);
        assert_eq!(out_rx.recv().await, Some(30));
        assert_eq!(out_rx.recv().await, None);
    }

    #[tokio::test]
    async fn batch_cuts_at_size_and_flushes_remainder() {
        let (in_tx, in_rx) = mpsc::channel(16);
        let (out_tx, mut out_rx) = mpsc::channel(16);
        spawn_batch(in_rx, out_tx, 3);

        for n in 0..7 {
            in_tx.send(n).await.unwrap();
        }
        drop(in_tx);

        assert_eq!(out_rx.recv().await.unwrap(), vec![0, 1, 2]);
        assert_eq!(out_rx.recv().await.unwrap(), vec![3, 4, 5]);
        assert_eq!(out_rx.recv().await.unwrap(), vec![6]);
        assert_eq!(out_rx.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_ceiling_holds_over_window() {
        let (in_tx, in_rx) = mpsc::channel(64);
        let (out_tx, mut out_rx) = mpsc::channel(64);
        // Steady bucket (burst 1) at 10 records/second.
        let limiter = Arc::new(RateLimiter::with_burst(10.0, 1.0));
        spawn_throttle(in_rx, out_tx, limiter);

        let total = 25;
        for n in 0..total {
            in_tx.send(n).await.unwrap();
        }
        drop(in_tx);

        let started = Instant::now();
        let mut received = 0;
        while out_rx.recv().await.is_some() {
            received += 1;
        }
        let elapsed = started.elapsed().as_secs_f64();

        assert_eq!(received, total);
        assert!(elapsed >= 2.0, "window too short: {elapsed}");
        let observed_rate = (total - 1) as f64 / elapsed;
        assert!(observed_rate <= 10.0 * 1.05, "rate too high: {observed_rate}");
    }

    #[tokio::test(start_paused = true)]
    async fn debounce_emits_only_latest_per_key() {
        let (in_tx, in_rx) = mpsc::channel(16);
        let (out_tx, mut out_rx) = mpsc::channel(16);
        spawn_debounce(
            in_rx,
            out_tx,
            Duration::from_millis(100),
            |record: &(&'static str, i32)| record.0,
        );

        in_tx.send(("a", 1)).await.unwrap();
        in_tx.send(("a", 2)).await.unwrap();
        in_tx.send(("b", 7)).await.unwrap();
        in_tx.send(("a", 3)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;

        let mut seen = vec![
            out_rx.recv().await.unwrap(),
            out_rx.recv().await.unwrap(),
        ];
        seen.sort();
        assert_eq!(seen, vec![("a", 3), ("b", 7)]);
        drop(in_tx);
    }

    #[tokio::test]
    async fn debounce_flushes_on_close() {
        let (in_tx, in_rx) = mpsc::channel(16);
        let (out_tx, mut out_rx) = mpsc::channel(16);
        spawn_debounce(in_rx, out_tx, Duration::from_secs(60), |r: &(&'static str, i32)| r.0);

        in_tx.send(("a", 1)).await.unwrap();
        drop(in_tx);

        assert_eq!(out_rx.recv().await, Some(("a", 1)));
        assert_eq!(out_rx.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn dead_letter_retries_then_gives_up() {
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_in_fn = attempts.clone();

        let (in_tx, in_rx) = mpsc::channel(4);
        let (out_tx, mut out_rx) = mpsc::channel::<i32>(4);
        let (dlq_tx, mut dlq_rx) = mpsc::channel(4);
        let config = RetryConfig {
            max: 2,
            backoff_multiplier: 2.0,
            max_backoff_ms: 1_000,
        };
        spawn_dead_letter(in_rx, out_tx, dlq_tx, config, move |_record| {
            let attempts = attempts_in_fn.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("still broken")
            }
        });

        in_tx.send(41).await.unwrap();
        drop(in_tx);

        assert_eq!(dlq_rx.recv().await, Some(41));
        assert_eq!(attempts.load(Ordering::SeqCst), 3); // max + 1
        assert_eq!(out_rx.recv().await, None);
    }

    #[tokio::test]
    async fn dead_letter_forwards_on_success() {
        let (in_tx, in_rx) = mpsc::channel(4);
        let (out_tx, mut out_rx) = mpsc::channel(4);
        let (dlq_tx, mut dlq_rx) = mpsc::channel::<i32>(4);
        spawn_dead_letter(in_rx, out_tx, dlq_tx, RetryConfig::default(), |_record| async {
            Ok(())
        });

        in_tx.send(7).await.unwrap();
        drop(in_tx);
        assert_eq!(out_rx.recv().await, Some(7));
        assert_eq!(dlq_rx.recv().await, None);
    }

    #[test]
    fn retry_delay_multiplies_and_caps() {
        let config = RetryConfig {
            max: 5,
            backoff_multiplier: 2.0,
            max_backoff_ms: 500,
        };
        assert_eq!(retry_delay(&config, 0), Duration::from_millis(100));
        assert_eq!(retry_delay(&config, 1), Duration::from_millis(200));
        assert_eq!(retry_delay(&config, 2), Duration::from_millis(400));
        assert_eq!(retry_delay(&config, 3), Duration::from_millis(500));
        assert_eq!(retry_delay(&config, 10), Duration::from_millis(500));
    }
}
