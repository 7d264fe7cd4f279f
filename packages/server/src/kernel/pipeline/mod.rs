//! Stream processing core: bounded stage operators, a backpressure-aware
//! processor, and per-processor metrics.

pub mod config;
pub mod metrics;
pub mod processor;
pub mod stage;

pub use config::{
    AlertThresholds, BackpressureStrategy, MonitoringConfig, ProcessorConfig, RetryConfig,
};
pub use metrics::{MetricsRecorder, MetricsSnapshot};
pub use processor::{OfferOutcome, PipelineError, StreamProcessor};
pub use stage::{
    retry_delay, spawn_batch, spawn_dead_letter, spawn_debounce, spawn_filter, spawn_throttle,
    spawn_transform, RateLimiter,
};
