// src/core/telemetry/layer.rs

//! A `tracing` layer that routes every event into `AsyncLogDelivery`.

use super::log_delivery::{AsyncLogDelivery, LogEvent, LogLevel};
use std::fmt::{self, Write as _};
use std::sync::Arc;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::registry::LookupSpan;

/// Field name that overrides an event's sample key.
pub const SAMPLE_KEY_FIELD: &str = "sample_key";
/// Boolean field that upgrades an `error!` event to the critical level.
pub const CRITICAL_FIELD: &str = "critical";

pub struct DeliveryLayer {
    delivery: Arc<AsyncLogDelivery>,
}

impl DeliveryLayer {
    pub fn new(delivery: Arc<AsyncLogDelivery>) -> Self {
        Self { delivery }
    }
}

#[derive(Default)]
struct EventVisitor {
    message: String,
    fields: String,
    sample_key: Option<String>,
    critical: bool,
}

impl EventVisitor {
    fn push_field(&mut self, name: &str, value: fmt::Arguments<'_>) {
        if !self.fields.is_empty() {
            self.fields.push(' ');
        }
        let _ = write!(self.fields, "{name}={value}");
    }
}

impl Visit for EventVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message = value.to_string(),
            SAMPLE_KEY_FIELD => self.sample_key = Some(value.to_string()),
            name => self.push_field(name, format_args!("{value:?}")),
        }
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        match field.name() {
            CRITICAL_FIELD => self.critical = value,
            name => self.push_field(name, format_args!("{value}")),
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        match field.name() {
            "message" => self.message = format!("{value:?}"),
            SAMPLE_KEY_FIELD => self.sample_key = Some(format!("{value:?}")),
            name => self.push_field(name, format_args!("{value:?}")),
        }
    }
}

impl<S> Layer<S> for DeliveryLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let mut visitor = EventVisitor::default();
        event.record(&mut visitor);

        let mut level = LogLevel::from(metadata.level());
        if visitor.critical && level == LogLevel::Error {
            level = LogLevel::Critical;
        }

        let mut message = String::new();
        if let Some(scope) = ctx.event_scope(event) {
            for span in scope.from_root() {
                message.push_str(span.name());
                message.push(':');
            }
            if !message.is_empty() {
                message.push(' ');
            }
        }
        message.push_str(&visitor.message);
        if !visitor.fields.is_empty() {
            message.push(' ');
            message.push_str(&visitor.fields);
        }

        let sample_key = visitor
            .sample_key
            .unwrap_or_else(|| metadata.name().to_string());
        self.delivery
            .enqueue(LogEvent::new(level, metadata.target(), message).with_sample_key(sample_key));
    }
}
