//! Bounded channel between the engine and a progress observer.
//!
//! The engine writes, the transport drains. Events are delivered in the order
//! they were written. When the observer falls behind, `emit` waits up to the
//! send timeout and then drops a stage event; `try_emit` drops immediately.
//! Terminal events wait for capacity until the receiver is gone.

use super::{EventSink, ProgressEvent};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::warn;

/// Delivery counters for a channel sink.
#[derive(Debug, Default)]
pub struct ChannelMetrics {
    emitted: AtomicU64,
    dropped: AtomicU64,
}

impl ChannelMetrics {
    fn record_emit(&self) {
        self.emitted.fetch_add(1, Ordering::Relaxed);
    }

    fn record_drop(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the number of delivered events.
    #[must_use]
    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    /// Returns the number of dropped events.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Converts metrics to a dictionary.
    #[must_use]
    pub fn to_dict(&self) -> serde_json::Value {
        serde_json::json!({
            "emitted": self.emitted(),
            "dropped": self.dropped(),
        })
    }
}

/// Writing half of a progress channel.
#[derive(Debug, Clone)]
pub struct ChannelEventSink {
    tx: mpsc::Sender<ProgressEvent>,
    send_timeout: Duration,
    metrics: Arc<ChannelMetrics>,
}

impl ChannelEventSink {
    /// Sets how long `emit` waits for capacity before dropping.
    #[must_use]
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Returns the delivery counters.
    #[must_use]
    pub fn metrics(&self) -> &ChannelMetrics {
        &self.metrics
    }

    /// Returns true once the receiver is gone.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn dropped(&self, event: &ProgressEvent, reason: &str) {
        self.metrics.record_drop();
        warn!(
            task_id = %event.task_id,
            status = %event.status,
            dropped_total = self.metrics.dropped(),
            reason,
            "Progress event dropped"
        );
    }
}

#[async_trait]
impl EventSink for ChannelEventSink {
    async fn emit(&self, event: ProgressEvent) {
        // A stream must end with its terminal event, so that one waits.
        if event.is_terminal() {
            match self.tx.send(event).await {
                Ok(()) => self.metrics.record_emit(),
                Err(mpsc::error::SendError(event)) => self.dropped(&event, "closed"),
            }
            return;
        }

        match self.tx.send_timeout(event, self.send_timeout).await {
            Ok(()) => self.metrics.record_emit(),
            Err(mpsc::error::SendTimeoutError::Timeout(event)) => self.dropped(&event, "timeout"),
            Err(mpsc::error::SendTimeoutError::Closed(event)) => self.dropped(&event, "closed"),
        }
    }

    fn try_emit(&self, event: ProgressEvent) {
        match self.tx.try_send(event) {
            Ok(()) => self.metrics.record_emit(),
            Err(mpsc::error::TrySendError::Full(event)) => self.dropped(&event, "full"),
            Err(mpsc::error::TrySendError::Closed(event)) => self.dropped(&event, "closed"),
        }
    }
}

/// Reading half of a progress channel.
#[derive(Debug)]
pub struct ProgressReceiver {
    rx: mpsc::Receiver<ProgressEvent>,
}

impl ProgressReceiver {
    /// Waits for the next event. Returns `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        self.rx.recv().await
    }

    /// Returns the next event if one is ready.
    pub fn try_recv(&mut self) -> Option<ProgressEvent> {
        self.rx.try_recv().ok()
    }

    /// Receives events until a terminal event arrives or the channel closes.
    pub async fn collect_until_terminal(&mut self) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.rx.recv().await {
            let terminal = event.is_terminal();
            events.push(event);
            if terminal {
                break;
            }
        }
        events
    }
}

/// Creates a bounded progress channel.
#[must_use]
pub fn progress_channel(capacity: usize) -> (ChannelEventSink, ProgressReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let sink = ChannelEventSink {
        tx,
        send_timeout: Duration::from_secs(1),
        metrics: Arc::new(ChannelMetrics::default()),
    };
    (sink, ProgressReceiver { rx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{StageName, TaskStatus, WorkflowState};

    #[tokio::test]
    async fn test_preserves_order() {
        let (sink, mut rx) = progress_channel(8);
        sink.emit(ProgressEvent::start("t", StageName::Intent)).await;
        sink.emit(ProgressEvent::start("t", StageName::Plan)).await;
        sink.emit(ProgressEvent::complete(&WorkflowState::new("x"), TaskStatus::Completed))
            .await;

        let events = rx.collect_until_terminal().await;
        let stages: Vec<_> = events.iter().map(|e| e.stage).collect();
        assert_eq!(stages, vec![Some(StageName::Intent), Some(StageName::Plan), None]);
        assert_eq!(sink.metrics().emitted(), 3);
    }

    #[tokio::test]
    async fn test_full_channel_drops() {
        let (sink, _rx) = progress_channel(1);
        let sink = sink.with_send_timeout(Duration::from_millis(10));

        sink.try_emit(ProgressEvent::start("t", StageName::Intent));
        sink.try_emit(ProgressEvent::start("t", StageName::Plan));
        sink.emit(ProgressEvent::start("t", StageName::Research)).await;

        assert_eq!(sink.metrics().emitted(), 1);
        assert_eq!(sink.metrics().dropped(), 2);
    }

    #[tokio::test]
    async fn test_terminal_event_waits_for_capacity() {
        let (sink, mut rx) = progress_channel(1);
        let sink = sink.with_send_timeout(Duration::from_millis(5));

        sink.emit(ProgressEvent::start("t", StageName::Intent)).await;
        sink.emit(ProgressEvent::end("t", StageName::Intent, serde_json::json!({})))
            .await;
        assert_eq!(sink.metrics().dropped(), 1);

        let state = WorkflowState::new("x");
        let reader = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            rx.collect_until_terminal().await
        };
        let ((), events) = tokio::join!(
            sink.emit(ProgressEvent::complete(&state, TaskStatus::Completed)),
            reader
        );

        assert_eq!(events.len(), 2);
        assert!(events[1].is_terminal());
        assert_eq!(sink.metrics().emitted(), 2);
        assert_eq!(sink.metrics().dropped(), 1);
    }

    #[tokio::test]
    async fn test_closed_receiver_drops() {
        let (sink, rx) = progress_channel(4);
        drop(rx);

        sink.emit(ProgressEvent::start("t", StageName::Intent)).await;
        assert!(sink.is_closed());
        assert_eq!(sink.metrics().dropped(), 1);
        assert_eq!(sink.metrics().to_dict()["dropped"], 1);
    }
}
