//! Tracing utilities for asserting on what keybox logs.
//!
//! Only events whose target starts with `keybox` are captured.

use std::sync::{Arc, Mutex, PoisonError};

use tracing::dispatcher::DefaultGuard;
use tracing::{Dispatch, Event, Level, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::Registry;
use tracing_subscriber::layer::{Context, SubscriberExt};

/// Captured event information for testing.
#[derive(Debug, Clone)]
pub struct CapturedEvent {
    pub level: Level,
    /// The event target (e.g., "keybox::rate_limit")
    pub target: String,
    /// The `message` field.
    pub message: String,
    /// Remaining field values as strings
    pub fields: Vec<(String, String)>,
}

impl CapturedEvent {
    /// Value of field `name`, if recorded.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

/// A tracing layer that captures keybox events.
struct EventCaptureLayer {
    events: Arc<Mutex<Vec<CapturedEvent>>>,
}

/// Visitor to capture event field values.
#[derive(Default)]
struct FieldVisitor {
    message: String,
    fields: Vec<(String, String)>,
}

impl FieldVisitor {
    fn push(&mut self, field: &tracing::field::Field, value: String) {
        if field.name() == "message" {
            self.message = value;
        } else {
            self.fields.push((field.name().to_string(), value));
        }
    }
}

impl tracing::field::Visit for FieldVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        self.push(field, format!("{:?}", value));
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.push(field, value.to_string());
    }

    fn record_i64(&mut self, field: &tracing::field::Field, value: i64) {
        self.push(field, value.to_string());
    }

    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        self.push(field, value.to_string());
    }

    fn record_bool(&mut self, field: &tracing::field::Field, value: bool) {
        self.push(field, value.to_string());
    }
}

impl<S: Subscriber> Layer<S> for EventCaptureLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if !metadata.target().starts_with("keybox") {
            return;
        }

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(CapturedEvent {
                level: *metadata.level(),
                target: metadata.target().to_string(),
                message: visitor.message,
                fields: visitor.fields,
            });
    }
}

/// Collector for captured events.
#[derive(Clone)]
pub struct EventCollector {
    events: Arc<Mutex<Vec<CapturedEvent>>>,
    dispatch: Dispatch,
}

/// Create a new event collector with its associated dispatch.
pub fn create_event_collector() -> EventCollector {
    let events = Arc::new(Mutex::new(Vec::new()));
    let layer = EventCaptureLayer {
        events: events.clone(),
    };
    let dispatch = Dispatch::new(Registry::default().with(layer));
    EventCollector { events, dispatch }
}

/// Capture events on the current thread until the guard is dropped.
///
/// Use with a current-thread runtime so every task polls on this thread.
///
/// ```ignore
/// let (collector, _guard) = capture_events();
/// limiter.is_request_allowed("alice", "api", 1, window).await?;
/// assert!(collector.has_event(Level::ERROR, "Rate limit evaluation failed, denying request"));
/// ```
pub fn capture_events() -> (EventCollector, DefaultGuard) {
    let collector = create_event_collector();
    let guard = tracing::dispatcher::set_default(collector.dispatch());
    (collector, guard)
}

impl EventCollector {
    /// Get the dispatch for use with spawned tasks.
    pub fn dispatch(&self) -> &Dispatch {
        &self.dispatch
    }

    /// Get all captured events.
    pub fn events(&self) -> Vec<CapturedEvent> {
        self.lock().clone()
    }

    /// Messages logged at `level`, in order.
    pub fn messages(&self, level: Level) -> Vec<String> {
        self.lock()
            .iter()
            .filter(|event| event.level == level)
            .map(|event| event.message.clone())
            .collect()
    }

    /// Check if an event with the given level and message was captured.
    pub fn has_event(&self, level: Level, message: &str) -> bool {
        self.lock()
            .iter()
            .any(|event| event.level == level && event.message == message)
    }

    /// Number of events with the given message.
    pub fn count(&self, message: &str) -> usize {
        self.lock()
            .iter()
            .filter(|event| event.message == message)
            .count()
    }

    /// Clear all captured events.
    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<CapturedEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_capture() {
        let collector = create_event_collector();
        tracing::dispatcher::with_default(collector.dispatch(), || {
            tracing::warn!(target: "keybox::cache", key = "user:1", "Cache operation degraded");
            tracing::warn!(target: "other", "ignored");
        });

        let events = collector.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].message, "Cache operation degraded");
        assert_eq!(events[0].field("key"), Some("user:1"));
        assert!(collector.has_event(Level::WARN, "Cache operation degraded"));
    }

    #[test]
    fn test_messages_by_level() {
        let collector = create_event_collector();
        tracing::dispatcher::with_default(collector.dispatch(), || {
            tracing::error!(target: "keybox::connection", "Retries exhausted");
            tracing::debug!(target: "keybox::connection", "Dropped database handle");
        });

        assert_eq!(collector.messages(Level::ERROR), ["Retries exhausted"]);
        assert_eq!(collector.count("Dropped database handle"), 1);
        collector.clear();
        assert!(collector.events().is_empty());
    }
}
