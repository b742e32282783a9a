//! Progress reporting and cooperative cancellation.
//!
//! Long-running phases (path probing, prefix rewriting, ingestion) report at a
//! fixed cadence rather than per item. Cancellation is advisory and only
//! observed at those checkpoints.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

/// Default pause taken at each checkpoint so a host UI stays responsive.
pub const DEFAULT_BACKOFF: Duration = Duration::from_millis(25);

/// One progress notification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProgressUpdate {
    /// 0..=100
    pub percent: u8,
    pub message: String,
    /// Whether the host should offer a cancel control for this phase.
    pub cancellable: bool,
    /// Whether `percent` is meaningful.
    pub indeterminate: bool,
}

impl ProgressUpdate {
    pub fn new(percent: u8, message: impl Into<String>, cancellable: bool) -> Self {
        Self {
            percent: percent.min(100),
            message: message.into(),
            cancellable,
            indeterminate: false,
        }
    }

    pub fn indeterminate(message: impl Into<String>, cancellable: bool) -> Self {
        Self {
            percent: 0,
            message: message.into(),
            cancellable,
            indeterminate: true,
        }
    }
}

pub trait ProgressSink {
    fn report(&self, update: ProgressUpdate);
}

impl<F> ProgressSink for F
where
    F: Fn(ProgressUpdate),
{
    fn report(&self, update: ProgressUpdate) {
        self(update)
    }
}

/// Sink that drops every update.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&self, _update: ProgressUpdate) {}
}

/// Shared cancellation flag.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Clear a previous cancellation so the token can be reused for the next run.
    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }
}

/// Result of an operation that may stop early at a checkpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancelStatus {
    Completed,
    Cancelled,
}

/// How often a loop reaches a checkpoint, and how long it pauses there.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Cadence {
    pub every: usize,
    pub backoff: Duration,
}

impl Cadence {
    /// Ingestion progress cadence.
    pub const INGEST: Cadence = Cadence::new(5_000);
    /// Path probing checkpoint cadence.
    pub const PATH_CHECK: Cadence = Cadence::new(10_000);
    /// Prefix rewrite checkpoint cadence.
    pub const PREFIX_REWRITE: Cadence = Cadence::new(30_000);
    /// Cadence used while deleting superseded detections during a merge.
    pub const MERGE_SCAN: Cadence = Cadence::new(1_000);

    pub const fn new(every: usize) -> Self {
        Self {
            every,
            backoff: DEFAULT_BACKOFF,
        }
    }

    pub const fn with_backoff(self, backoff: Duration) -> Self {
        Self {
            every: self.every,
            backoff,
        }
    }

    /// True when iteration `i` is a checkpoint. A zero cadence never fires.
    pub fn is_due(&self, i: usize) -> bool {
        self.every != 0 && i % self.every == 0
    }

    /// Yield briefly to the host.
    pub fn pause(&self) {
        if !self.backoff.is_zero() {
            std::thread::sleep(self.backoff);
        }
    }
}

/// Integer percentage of `done` out of `total`, rounded to nearest.
pub fn percent(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    let pct = (done as f64 * 100.0 / total as f64).round();
    pct.clamp(0.0, 100.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn percent_rounds_and_clamps() {
        assert_eq!(percent(0, 10), 0);
        assert_eq!(percent(1, 3), 33);
        assert_eq!(percent(2, 3), 67);
        assert_eq!(percent(15, 10), 100);
        assert_eq!(percent(0, 0), 100);
    }

    #[test]
    fn cadence_fires_on_multiples_only() {
        let cadence = Cadence::new(3);
        let due: Vec<usize> = (0..10).filter(|i| cadence.is_due(*i)).collect();
        assert_eq!(due, vec![0, 3, 6, 9]);
        assert!(!Cadence::new(0).is_due(0));
    }

    #[test]
    fn cancel_token_is_shared_between_clones() {
        let token = CancelToken::new();
        let observer = token.clone();
        assert!(!observer.is_cancelled());
        token.cancel();
        assert!(observer.is_cancelled());
        observer.reset();
        assert!(!token.is_cancelled());
    }

    #[test]
    fn closures_act_as_sinks() {
        let seen = RefCell::new(Vec::new());
        let sink = |update: ProgressUpdate| seen.borrow_mut().push(update.percent);
        sink.report(ProgressUpdate::new(250, "over", false));
        sink.report(ProgressUpdate::indeterminate("busy", true));
        assert_eq!(*seen.borrow(), vec![100, 0]);
    }
}
