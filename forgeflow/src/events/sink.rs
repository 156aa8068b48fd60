//! Event sink trait and implementations.

use super::{EventStatus, ProgressEvent};
use async_trait::async_trait;
use tracing::{debug, info, warn, Level};

/// Receiver of progress events.
///
/// Sinks must never fail the pipeline: errors are logged and swallowed.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Emits an event, waiting for capacity if the sink is bounded.
    async fn emit(&self, event: ProgressEvent);

    /// Emits an event without waiting; may drop it.
    fn try_emit(&self, event: ProgressEvent);
}

/// A sink that discards all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _event: ProgressEvent) {}

    fn try_emit(&self, _event: ProgressEvent) {}
}

/// A sink that mirrors events into tracing.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingEventSink {
    /// Creates a logging sink at the given level.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level logging sink.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }

    fn log_event(&self, event: &ProgressEvent) {
        let stage = event.stage.map_or("-", |s| s.as_str());
        if event.status == EventStatus::Error {
            warn!(
                task_id = %event.task_id,
                stage,
                status = %event.status,
                "{}", event.message
            );
        } else if self.level == Level::DEBUG {
            debug!(
                task_id = %event.task_id,
                stage,
                status = %event.status,
                "{}", event.message
            );
        } else {
            info!(
                task_id = %event.task_id,
                stage,
                status = %event.status,
                "{}", event.message
            );
        }
    }
}

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn emit(&self, event: ProgressEvent) {
        self.log_event(&event);
    }

    fn try_emit(&self, event: ProgressEvent) {
        self.log_event(&event);
    }
}

/// A sink that keeps every event, for tests and in-process observers.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: parking_lot::RwLock<Vec<ProgressEvent>>,
}

impl CollectingEventSink {
    /// Creates a new collecting sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events.
    #[must_use]
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.read().clone()
    }

    /// Returns the events of one task.
    #[must_use]
    pub fn events_for(&self, task_id: &str) -> Vec<ProgressEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.task_id == task_id)
            .cloned()
            .collect()
    }

    /// Returns the events with a given status.
    #[must_use]
    pub fn events_with_status(&self, status: EventStatus) -> Vec<ProgressEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.status == status)
            .cloned()
            .collect()
    }

    /// Returns the number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if no events have been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Clears all collected events.
    pub fn clear(&self) {
        self.events.write().clear();
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn emit(&self, event: ProgressEvent) {
        self.events.write().push(event);
    }

    fn try_emit(&self, event: ProgressEvent) {
        self.events.write().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StageName;

    #[test]
    fn test_noop_and_logging_sinks() {
        tokio_test::block_on(async {
            NoOpEventSink.emit(ProgressEvent::start("t", StageName::Plan)).await;
            let sink = LoggingEventSink::default();
            sink.emit(ProgressEvent::start("t", StageName::Plan)).await;
            sink.try_emit(ProgressEvent::stage_error("t", StageName::Plan, "boom"));
        });
    }

    #[tokio::test]
    async fn test_collecting_sink() {
        let sink = CollectingEventSink::new();
        assert!(sink.is_empty());

        sink.emit(ProgressEvent::start("a", StageName::Intent)).await;
        sink.try_emit(ProgressEvent::start("b", StageName::Intent));
        sink.emit(ProgressEvent::end("a", StageName::Intent, serde_json::json!({})))
            .await;

        assert_eq!(sink.len(), 3);
        assert_eq!(sink.events_for("a").len(), 2);
        assert_eq!(sink.events_with_status(EventStatus::Start).len(), 2);

        sink.clear();
        assert!(sink.is_empty());
    }
}
