//! Stream processor configuration.

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

/// What the ingress does with new records while the pipeline is overloaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum BackpressureStrategy {
    /// Discard the record and tell the caller.
    Drop,
    /// Block the producer until the buffer drains.
    #[default]
    Buffer,
    /// Slow the producer proportionally to load before accepting.
    Throttle,
    /// Pause intake entirely for a cool-down.
    CircuitBreaker,
}

#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
pub struct RetryConfig {
    #[builder(default = 3)]
    pub max: u32,
    #[builder(default = 2.0)]
    pub backoff_multiplier: f64,
    #[builder(default = 10_000)]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max: 3,
            backoff_multiplier: 2.0,
            max_backoff_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
pub struct AlertThresholds {
    #[builder(default = 0.9)]
    pub buffer_utilisation: f64,
    #[builder(default = 5_000.0)]
    pub processing_latency_ms: f64,
    #[builder(default = 0.1)]
    pub error_rate: f64,
    #[builder(default = 0.0)]
    pub throughput: f64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            buffer_utilisation: 0.9,
            processing_latency_ms: 5_000.0,
            error_rate: 0.1,
            throughput: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
pub struct MonitoringConfig {
    #[builder(default = true)]
    pub enabled: bool,
    #[builder(default = 5_000)]
    pub metrics_interval_ms: u64,
    #[builder(default)]
    pub alert_thresholds: AlertThresholds,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            metrics_interval_ms: 5_000,
            alert_thresholds: AlertThresholds::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
pub struct ProcessorConfig {
    /// Batch cut threshold for the process stage.
    #[builder(default = 50)]
    pub batch_size: usize,
    /// Capacity of the ingress queue.
    #[builder(default = 1000)]
    pub buffer_size: usize,
    /// Parallelism budget for batch processing.
    #[builder(default = 4)]
    pub max_concurrency: usize,
    /// Load fraction in [0, 1] above which backpressure activates.
    #[builder(default = 0.8)]
    pub backpressure_threshold: f64,
    #[builder(default)]
    pub backpressure_strategy: BackpressureStrategy,
    /// Per-batch deadline for the handler.
    #[builder(default = 30_000)]
    pub timeout_ms: u64,
    #[builder(default)]
    pub retry: RetryConfig,
    #[builder(default)]
    pub monitoring: MonitoringConfig,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}
