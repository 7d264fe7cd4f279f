//! Processor metrics: atomic counters plus bounded snapshot history.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Rolling window for average processing time.
const DURATION_WINDOW: usize = 100;
/// Bounded snapshot history.
const HISTORY_LIMIT: usize = 1000;

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub records_processed: u64,
    pub records_dropped: u64,
    pub records_buffered: u64,
    pub records_errored: u64,
    pub avg_processing_time_ms: f64,
    pub buffer_utilisation: f64,
    pub throughput_per_second: f64,
    pub error_rate: f64,
    pub backpressure_events: u64,
    pub memory_mb: f64,
    pub cpu_pct: f64,
}

#[derive(Default)]
struct ThroughputWindow {
    last_at: Option<std::time::Instant>,
    last_processed: u64,
}

pub struct MetricsRecorder {
    processed: AtomicU64,
    dropped: AtomicU64,
    errored: AtomicU64,
    backpressure_events: AtomicU64,
    buffered: AtomicUsize,
    durations_ms: Mutex<VecDeque<f64>>,
    history: Mutex<VecDeque<MetricsSnapshot>>,
    throughput: Mutex<ThroughputWindow>,
    cpu: Mutex<CpuWindow>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self {
            processed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            errored: AtomicU64::new(0),
            backpressure_events: AtomicU64::new(0),
            buffered: AtomicUsize::new(0),
            durations_ms: Mutex::new(VecDeque::with_capacity(DURATION_WINDOW)),
            history: Mutex::new(VecDeque::with_capacity(64)),
            throughput: Mutex::new(ThroughputWindow::default()),
            cpu: Mutex::new(CpuWindow::default()),
        }
    }

    pub fn record_processed(&self, count: u64, elapsed_ms: f64) {
        self.processed.fetch_add(count, Ordering::Relaxed);
        let mut durations = self.durations_ms.lock().unwrap_or_else(|e| e.into_inner());
        if durations.len() == DURATION_WINDOW {
            durations.pop_front();
        }
        durations.push_back(elapsed_ms);
    }

    pub fn record_dropped(&self, count: u64) {
        self.dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_errored(&self, count: u64) {
        self.errored.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_backpressure(&self) {
        self.backpressure_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_buffered(&self, count: usize) {
        self.buffered.fetch_add(count, Ordering::Relaxed);
    }

    pub fn sub_buffered(&self, count: usize) {
        let mut current = self.buffered.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_sub(count);
            match self.buffered.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn errored(&self) -> u64 {
        self.errored.load(Ordering::Relaxed)
    }

    pub fn backpressure_events(&self) -> u64 {
        self.backpressure_events.load(Ordering::Relaxed)
    }

    pub fn buffered(&self) -> usize {
        self.buffered.load(Ordering::Relaxed)
    }

    /// Capture a snapshot and append it to the bounded history.
    pub fn snapshot(&self, buffer_capacity: usize) -> MetricsSnapshot {
        let processed = self.processed();
        let errored = self.errored();
        let buffered = self.buffered() as u64;

        let avg_processing_time_ms = {
            let durations = self.durations_ms.lock().unwrap_or_else(|e| e.into_inner());
            if durations.is_empty() {
                0.0
            } else {
                durations.iter().sum::<f64>() / durations.len() as f64
            }
        };

        let throughput_per_second = {
            let mut window = self.throughput.lock().unwrap_or_else(|e| e.into_inner());
            let now = std::time::Instant::now();
            let rate = match window.last_at {
                Some(last_at) => {
                    let elapsed = now.duration_since(last_at).as_secs_f64();
                    if elapsed > 0.0 {
                        (processed - window.last_processed) as f64 / elapsed
                    } else {
                        0.0
                    }
                }
                None => 0.0,
            };
            window.last_at = Some(now);
            window.last_processed = processed;
            rate
        };

        let attempted = processed + errored;
        let error_rate = if attempted > 0 {
            errored as f64 / attempted as f64
        } else {
            0.0
        };

        let snapshot = MetricsSnapshot {
            timestamp: Utc::now(),
            records_processed: processed,
            records_dropped: self.dropped(),
            records_buffered: buffered,
            records_errored: errored,
            avg_processing_time_ms,
            buffer_utilisation: if buffer_capacity > 0 {
                (buffered as f64 / buffer_capacity as f64).min(1.0)
            } else {
                0.0
            },
            throughput_per_second,
            error_rate,
            backpressure_events: self.backpressure_events(),
            memory_mb: resident_memory_mb(),
            cpu_pct: self.cpu.lock().unwrap_or_else(|e| e.into_inner()).sample(),
        };

        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        if history.len() == HISTORY_LIMIT {
            history.pop_front();
        }
        history.push_back(snapshot.clone());

        snapshot
    }

    pub fn history(&self) -> Vec<MetricsSnapshot> {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new()
    }
}

/// Resident set size in MiB, best effort (0 where /proc is unavailable).
pub fn resident_memory_mb() -> f64 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(statm) = std::fs::read_to_string("/proc/self/statm") {
            if let Some(resident_pages) = statm
                .split_whitespace()
                .nth(1)
                .and_then(|v| v.parse::<f64>().ok())
            {
                return resident_pages * 4096.0 / (1024.0 * 1024.0);
            }
        }
    }
    0.0
}

#[derive(Default)]
struct CpuWindow {
    last_at: Option<std::time::Instant>,
    last_cpu_ticks: u64,
}

impl CpuWindow {
    /// Process CPU percentage since the previous sample, best effort.
    fn sample(&mut self) -> f64 {
        #[cfg(target_os = "linux")]
        {
            let Ok(stat) = std::fs::read_to_string("/proc/self/stat") else {
                return 0.0;
            };
            // utime and stime are fields 14 and 15 (after the parenthesised
            // command, which may itself contain spaces).
            let Some(rest) = stat.rsplit(')').next() else {
                return 0.0;
            };
            let fields: Vec<&str> = rest.split_whitespace().collect();
            let ticks = match (
                fields.get(11).and_then(|v| v.parse::<u64>().ok()),
                fields.get(12).and_then(|v| v.parse::<u64>().ok()),
            ) {
                (Some(utime), Some(stime)) => utime + stime,
                _ => return 0.0,
            };

            let now = std::time::Instant::now();
            let pct = match self.last_at {
                Some(last_at) => {
                    let elapsed = now.duration_since(last_at).as_secs_f64();
                    let tick_hz = 100.0;
                    if elapsed > 0.0 {
                        ((ticks - self.last_cpu_ticks) as f64 / tick_hz) / elapsed * 100.0
                    } else {
                        0.0
                    }
                }
                None => 0.0,
            };
            self.last_at = Some(now);
            self.last_cpu_ticks = ticks;
            return pct.clamp(0.0, 100.0 * num_cpus_estimate());
        }
        #[cfg(not(target_os = "linux"))]
        {
            0.0
        }
    }
}

#[cfg(target_os = "linux")]
fn num_cpus_estimate() -> f64 {
    std::thread::available_parallelism()
        .map(|n| n.get() as f64)
        .unwrap_or(1.0)
}
