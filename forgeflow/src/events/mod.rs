//! Progress events for streaming observers.
//!
//! Each task produces an ordered sequence of stage events terminated by one
//! `complete` or one task-level `error` event. Sinks are passed to the engine
//! explicitly; there is no process-wide sink.

mod channel;
mod progress;
mod sink;

pub use channel::{progress_channel, ChannelEventSink, ChannelMetrics, ProgressReceiver};
pub use progress::{EventStatus, ProgressEvent};
pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
