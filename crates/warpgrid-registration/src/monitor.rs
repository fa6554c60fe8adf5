//! Run-level observation and cooperative cancellation.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::error::{RegistrationError, Result};
use crate::progress::ProgressTracker;

const IDLE: usize = usize::MAX;

/// Cooperative cancellation flag.
///
/// Clones share the flag. A cancelled run stops at the next iteration or
/// level boundary with [`RegistrationError::Cancelled`].
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Clear the flag so the token can be reused for another run.
    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }
}

/// Read-only view of the level a scheduler is currently processing.
#[derive(Debug, Clone)]
pub struct LevelHandle {
    level: Arc<AtomicUsize>,
}

impl Default for LevelHandle {
    fn default() -> Self {
        Self {
            level: Arc::new(AtomicUsize::new(IDLE)),
        }
    }
}

impl LevelHandle {
    /// Current level, or `None` while no run is in progress.
    pub fn current(&self) -> Option<usize> {
        match self.level.load(Ordering::SeqCst) {
            IDLE => None,
            level => Some(level),
        }
    }

    pub(crate) fn set(&self, level: usize) {
        self.level.store(level, Ordering::SeqCst);
    }

    pub(crate) fn clear(&self) {
        self.level.store(IDLE, Ordering::SeqCst);
    }
}

/// What a solver may observe while it runs one level.
#[derive(Debug, Clone, Copy, Default)]
pub struct SolveMonitor<'a> {
    level: usize,
    cancel: Option<&'a CancellationToken>,
    progress: Option<&'a ProgressTracker>,
}

impl<'a> SolveMonitor<'a> {
    /// Monitor for a solve outside any scheduler: no cancellation, no progress.
    pub fn detached() -> Self {
        Self::default()
    }

    pub fn new(level: usize, cancel: Option<&'a CancellationToken>, progress: Option<&'a ProgressTracker>) -> Self {
        Self { level, cancel, progress }
    }

    pub fn level(&self) -> usize {
        self.level
    }

    /// Fail with [`RegistrationError::Cancelled`] once cancellation was requested.
    pub fn check_cancelled(&self) -> Result<()> {
        match self.cancel {
            Some(token) if token.is_cancelled() => Err(RegistrationError::Cancelled { level: self.level }),
            _ => Ok(()),
        }
    }

    /// Report a finished iteration (1-based) with named solver quantities.
    pub fn report(&self, iteration: usize, total_iterations: usize, energy: f64, metrics: &[(&str, f64)]) {
        if let Some(progress) = self.progress {
            progress.update(self.level, iteration, total_iterations, energy, metrics);
        }
    }
}
