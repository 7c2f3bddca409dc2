//! Event sinks used as the injected logger of every adapter.
//!
//! There is no process-wide sink: the driver or CLI creates one and passes
//! it to each adapter it builds.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

use std::sync::Arc;

/// Shared handle to an event sink.
pub type SharedEventSink = Arc<dyn EventSink>;

/// Returns a sink that discards every event.
#[must_use]
pub fn noop_sink() -> SharedEventSink {
    Arc::new(NoOpEventSink)
}

/// Returns a sink that forwards events to `tracing` at info level.
#[must_use]
pub fn logging_sink() -> SharedEventSink {
    Arc::new(LoggingEventSink::info())
}
