//! Structured motion events and the sinks that receive them.
//!
//! Channels, controllers and the supervisor receive an `Arc<dyn EventSink>`
//! at construction and report what they do as [`MotionEvent`] records (axis
//! or port id, event kind, named numeric values). The library never owns
//! formatting or storage: [`TracingSink`] forwards to `tracing`, and
//! [`EventBuffer`] keeps a bounded in-memory history for tests and session
//! summaries.

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

const MAX_EVENT_ENTRIES: usize = 1000;

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A register operation failed and will be retried.
    RetryAttempt,
    /// A register operation failed on every attempt.
    RetriesExhausted,
    /// Target register written.
    TargetSet,
    /// Start bit pulsed 0 -> 1.
    MoveStarted,
    /// Start pulse resent after a poll showed no progress.
    StartPulseResent,
    /// Axis was already within tolerance; no motion commanded.
    AlreadyAtTarget,
    /// Move confirmed by position.
    MoveComplete,
    /// Position stopped changing before the target.
    Stalled,
    /// Arrived, but the confirming read was outside tolerance.
    Drifted,
    /// Wall-clock budget exceeded.
    TimedOut,
    /// Limit switch tripped during motion.
    LimitFault,
    /// Move abandoned after a communication failure.
    CommFailed,
    /// Move interrupted by a stop request.
    Cancelled,
    /// Start bit cleared.
    StopIssued,
    /// Location register redefined.
    Calibrated,
    /// Calibration read-back mismatch.
    CalibrationFailed,
    /// Speed register written.
    SpeedSet,
    /// Jog coil asserted.
    Jog,
    /// Supervisor began an axis move in a sequence.
    SequenceStep,
    /// Supervisor aborted a sequence.
    SequenceAborted,
    /// A teardown step failed and was skipped.
    CleanupFailed,
    /// Channel released.
    ChannelClosed,
}

impl EventKind {
    /// True for events that describe a failure.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            EventKind::RetriesExhausted
                | EventKind::Stalled
                | EventKind::Drifted
                | EventKind::TimedOut
                | EventKind::LimitFault
                | EventKind::CommFailed
                | EventKind::CalibrationFailed
                | EventKind::SequenceAborted
                | EventKind::CleanupFailed
        )
    }
}

/// One structured event.
#[derive(Debug, Clone)]
pub struct MotionEvent {
    /// Local wall-clock time of the event.
    pub timestamp: DateTime<Local>,
    /// Axis id (`ANT_ROLL`, ...) or port name.
    pub source: String,
    /// Event kind.
    pub kind: EventKind,
    /// Named numeric values.
    pub values: Vec<(&'static str, f64)>,
    /// Optional human-readable detail.
    pub detail: Option<String>,
}

impl MotionEvent {
    /// Create an event with no values.
    pub fn new(source: impl Into<String>, kind: EventKind) -> Self {
        Self {
            timestamp: Local::now(),
            source: source.into(),
            kind,
            values: Vec::new(),
            detail: None,
        }
    }

    /// Attach a named value.
    pub fn with(mut self, name: &'static str, value: f64) -> Self {
        self.values.push((name, value));
        self
    }

    /// Attach a detail message.
    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Look up a named value.
    pub fn value(&self, name: &str) -> Option<f64> {
        self.values
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| *v)
    }
}

impl fmt::Display for MotionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {:?}",
            self.timestamp.format("%H:%M:%S%.3f"),
            self.source,
            self.kind
        )?;
        for (name, value) in &self.values {
            write!(f, " {}={:.3}", name, value)?;
        }
        if let Some(detail) = &self.detail {
            write!(f, " ({})", detail)?;
        }
        Ok(())
    }
}

/// Receiver of structured events.
pub trait EventSink: Send + Sync {
    /// Record one event. Must not block for long.
    fn record(&self, event: MotionEvent);
}

/// Forwards events to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn record(&self, event: MotionEvent) {
        let values = format!("{:?}", event.values);
        let detail = event.detail.as_deref().unwrap_or("");
        if event.kind.is_failure() {
            tracing::warn!(source = %event.source, kind = ?event.kind, %values, detail, "motion event");
        } else if matches!(event.kind, EventKind::RetryAttempt) {
            tracing::debug!(source = %event.source, kind = ?event.kind, %values, detail, "motion event");
        } else {
            tracing::info!(source = %event.source, kind = ?event.kind, %values, detail, "motion event");
        }
    }
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn record(&self, _event: MotionEvent) {}
}

/// A thread-safe, fixed-capacity event history.
#[derive(Clone)]
pub struct EventBuffer(Arc<Mutex<VecDeque<MotionEvent>>>);

impl Default for EventBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(VecDeque::with_capacity(
            MAX_EVENT_ENTRIES,
        ))))
    }

    /// Copy of all buffered events, oldest first.
    pub fn events(&self) -> Vec<MotionEvent> {
        self.0.lock().iter().cloned().collect()
    }

    /// Events of one kind.
    pub fn of_kind(&self, kind: EventKind) -> Vec<MotionEvent> {
        self.0
            .lock()
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }

    /// Number of events of one kind.
    pub fn count(&self, kind: EventKind) -> usize {
        self.0.lock().iter().filter(|e| e.kind == kind).count()
    }

    /// Number of buffered events.
    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    /// True when nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }

    /// Drop all buffered events.
    pub fn clear(&self) {
        self.0.lock().clear();
    }
}

impl EventSink for EventBuffer {
    fn record(&self, event: MotionEvent) {
        let mut buffer = self.0.lock();
        if buffer.len() >= MAX_EVENT_ENTRIES {
            buffer.pop_front();
        }
        buffer.push_back(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn buffer_keeps_most_recent_events() {
        let buffer = EventBuffer::new();
        for i in 0..(MAX_EVENT_ENTRIES + 5) {
            buffer.record(MotionEvent::new("TT_ROLL", EventKind::TargetSet).with("i", i as f64));
        }
        assert_eq!(buffer.len(), MAX_EVENT_ENTRIES);
        assert_eq!(buffer.events()[0].value("i"), Some(5.0));
    }

    #[test]
    fn counts_by_kind() {
        let buffer = EventBuffer::new();
        buffer.record(MotionEvent::new("ANT_ROLL", EventKind::StopIssued));
        buffer.record(MotionEvent::new("ANT_ROLL", EventKind::MoveStarted));
        buffer.record(MotionEvent::new("EUT_ROLL", EventKind::StopIssued));
        assert_eq!(buffer.count(EventKind::StopIssued), 2);
        assert_eq!(buffer.of_kind(EventKind::MoveStarted)[0].source, "ANT_ROLL");
    }

    #[test]
    fn display_includes_values_and_detail() {
        let event = MotionEvent::new("ANT_HEIGHT", EventKind::Stalled)
            .with("position", 1600.0)
            .detail("no progress");
        let text = event.to_string();
        assert!(text.contains("ANT_HEIGHT Stalled position=1600.000 (no progress)"));
    }

    #[test]
    #[traced_test]
    fn tracing_sink_forwards_events() {
        TracingSink.record(MotionEvent::new("TT_ROLL", EventKind::LimitFault).detail("cw"));
        TracingSink.record(MotionEvent::new("TT_ROLL", EventKind::MoveComplete));
        assert!(logs_contain("kind=LimitFault"));
        assert!(logs_contain("kind=MoveComplete"));
        assert!(logs_contain("WARN"));
    }
}
