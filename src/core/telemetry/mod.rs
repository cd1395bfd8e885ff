// src/core/telemetry/mod.rs

//! Observability that never blocks the request path: sampled metrics with
//! unbiased estimates, and bounded asynchronous log delivery.

pub mod collector;
pub mod exporter;
pub mod layer;
pub mod log_delivery;
pub mod log_sampler;
pub mod sample;
pub mod sampler;
pub mod sink;

pub use collector::{
    AggregatedMetrics, CollectorStats, MetricAggregate, MetricsCollector, MetricsPublisher,
};
pub use exporter::{DaemonMetrics, PrometheusPublisher};
pub use layer::DeliveryLayer;
pub use log_delivery::{AsyncLogDelivery, DeliveryStats, DrainReport, EnqueueOutcome, LogEvent, LogLevel};
pub use log_sampler::LogSampler;
pub use sample::{MetricSample, MetricType};
pub use sampler::AdaptiveSampler;
pub use sink::{FileSink, LogSink, StderrSink, sink_from_config};
