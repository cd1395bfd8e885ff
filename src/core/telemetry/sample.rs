// src/core/telemetry/sample.rs

use crate::core::types::Origin;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumCount, EnumIter, IntoStaticStr};
use tokio::time::Instant;

/// The kinds of events the daemon measures.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumCount,
    EnumIter,
    IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MetricType {
    RequestCompleted,
    RequestFailed,
    /// Value is the end-to-end dispatch latency in milliseconds.
    RequestLatency,
    RequestRetried,
    RequestCancelled,
    CircuitOpened,
    CircuitRejected,
    QueueOverflow,
    DuplicateSuppressed,
    FrameSent,
    FrameReceived,
    WriteFailure,
    ConnectionOpened,
    ConnectionClosed,
    SessionCreated,
    SessionResumed,
    SessionExpired,
    SessionClosed,
    /// Value is the number of sessions removed by one sweep.
    SessionSweep,
    SessionLimitRejected,
    InFlightLimitRejected,
    LogDropped,
    LogSinkFailure,
}

impl MetricType {
    /// Types that describe failures or resource exhaustion. Samples of these
    /// types are never subject to sampling.
    pub fn is_critical(self) -> bool {
        matches!(
            self,
            MetricType::RequestFailed
                | MetricType::RequestCancelled
                | MetricType::CircuitOpened
                | MetricType::CircuitRejected
                | MetricType::QueueOverflow
                | MetricType::WriteFailure
                | MetricType::SessionSweep
                | MetricType::SessionLimitRejected
                | MetricType::InFlightLimitRejected
                | MetricType::LogDropped
                | MetricType::LogSinkFailure
        )
    }

    pub fn as_str(self) -> &'static str {
        self.into()
    }

    /// Dense index for per-type arrays.
    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

/// One immutable measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricSample {
    pub timestamp: Instant,
    pub metric_type: MetricType,
    pub value: f64,
    pub origin: Origin,
    pub is_critical: bool,
}

impl MetricSample {
    /// A sample whose criticality follows its type.
    pub fn new(metric_type: MetricType, value: f64, origin: Origin) -> Self {
        Self {
            timestamp: Instant::now(),
            metric_type,
            value,
            origin,
            is_critical: metric_type.is_critical(),
        }
    }

    /// A sample of value `1` originating from the daemon itself.
    pub fn count(metric_type: MetricType) -> Self {
        Self::new(metric_type, 1.0, Origin::Daemon)
    }

    /// Forces the sample past the sampler.
    pub fn critical(mut self) -> Self {
        self.is_critical = true;
        self
    }
}
