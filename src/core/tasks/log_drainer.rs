// src/core/tasks/log_drainer.rs

use crate::core::telemetry::AsyncLogDelivery;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Moves queued log events to the sink. Wakes on a timer and whenever an
/// event is enqueued, then drains until the queue is empty or one period's
/// worth of time is spent. Sink I/O runs on the blocking pool so a slow sink
/// never stalls the runtime.
///
/// This task does not log through `tracing` itself: every line it emitted
/// would land back in the queue it is draining.
pub struct LogDrainer {
    delivery: Arc<AsyncLogDelivery>,
    period: Duration,
}

impl LogDrainer {
    pub fn new(delivery: Arc<AsyncLogDelivery>, period: Duration) -> Self {
        Self { delivery, period }
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.delivery.notified() => {}
                _ = shutdown_rx.recv() => return,
            }
            let delivery = Arc::clone(&self.delivery);
            let budget = self.period;
            if let Err(e) =
                tokio::task::spawn_blocking(move || delivery.drain_pending(budget)).await
            {
                eprintln!("tidegate: log drain worker failed: {e}");
            }
        }
    }
}
