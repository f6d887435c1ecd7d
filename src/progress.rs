//! # Progress Reporting
//!
//! Purge and compact report progress as a fractional value in
//! `[offset, offset + span]`, apportioned per fileset (spec.md §4.7). Progress
//! is pushed onto an async channel rather than coupled to any particular UI;
//! the CLI layer is just one subscriber that happens to render with
//! `indicatif`.

use tokio::sync::mpsc;

/// Which phase of purge/compact a progress event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Verify,
    Purge,
    Compact,
    Restore,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Verify => write!(f, "verify"),
            Phase::Purge => write!(f, "purge"),
            Phase::Compact => write!(f, "compact"),
            Phase::Restore => write!(f, "restore"),
        }
    }
}

/// A single progress update: phase and a fraction complete in `[0.0, 1.0]`.
#[derive(Debug, Clone, Copy)]
pub struct ProgressEvent {
    pub phase: Phase,
    pub fraction: f64,
}

/// The sending half of the progress channel, held by the engine doing the work.
#[derive(Clone)]
pub struct ProgressSink(mpsc::UnboundedSender<ProgressEvent>);

impl ProgressSink {
    pub fn emit(&self, phase: Phase, fraction: f64) {
        let _ = self.0.send(ProgressEvent {
            phase,
            fraction: fraction.clamp(0.0, 1.0),
        });
    }

    /// A sink that discards every event, for callers that don't want progress.
    pub fn discard() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        ProgressSink(tx)
    }
}

/// Creates a connected sink/stream pair.
pub fn channel() -> (ProgressSink, mpsc::UnboundedReceiver<ProgressEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ProgressSink(tx), rx)
}

/// Computes the `[offset, offset + span]` sub-range progress for one item out
/// of `total` within an overall `[overall_offset, overall_offset + overall_span]`
/// window. When compact runs as a post-step of purge, it receives the
/// trailing 25% of the span (spec.md §4.7).
pub fn sub_span(overall_offset: f64, overall_span: f64, index: usize, total: usize) -> (f64, f64) {
    if total == 0 {
        return (overall_offset, overall_offset + overall_span);
    }
    let step = overall_span / total as f64;
    let offset = overall_offset + step * index as f64;
    (offset, step)
}

/// The fixed trailing fraction of a purge's span reserved for an auto-compact
/// post-step.
pub const COMPACT_TRAILING_SPAN: f64 = 0.25;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sub_span_divides_evenly() {
        let (offset, span) = sub_span(0.0, 1.0, 1, 4);
        assert!((offset - 0.25).abs() < 1e-9);
        assert!((span - 0.25).abs() < 1e-9);
    }

    #[test]
    fn emit_clamps_fraction() {
        let (sink, mut rx) = channel();
        sink.emit(Phase::Purge, 1.5);
        let ev = rx.try_recv().unwrap();
        assert_eq!(ev.fraction, 1.0);
    }
}
