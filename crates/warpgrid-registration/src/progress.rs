//! Progress tracking and callbacks for registration runs.
//!
//! Solvers report one [`ProgressInfo`] per iteration through a
//! [`ProgressTracker`]; callbacks receive the pyramid level alongside the
//! iteration so coarse-to-fine runs can be followed level by level.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Progress information for one solver iteration.
#[derive(Debug, Clone)]
pub struct ProgressInfo {
    /// Pyramid level being solved (0 = coarsest).
    pub level: usize,
    /// Iteration within the level, starting at 1.
    pub iteration: usize,
    /// Iteration budget of the level.
    pub total_iterations: usize,
    /// Solver energy after the iteration.
    pub energy: f64,
    /// Time elapsed since the run started.
    pub elapsed: Duration,
    /// Estimated time left in the current level.
    pub estimated_remaining: Option<Duration>,
    /// Additional named quantities reported by the solver.
    pub metrics: Vec<(String, f64)>,
}

impl ProgressInfo {
    pub fn new(level: usize, iteration: usize, total_iterations: usize, energy: f64, elapsed: Duration) -> Self {
        Self {
            level,
            iteration,
            total_iterations,
            energy,
            elapsed,
            estimated_remaining: None,
            metrics: Vec::new(),
        }
    }

    /// Percentage of the level's budget completed.
    pub fn progress_percent(&self) -> f64 {
        if self.total_iterations == 0 {
            return 100.0;
        }
        (self.iteration as f64 / self.total_iterations as f64) * 100.0
    }

    /// Estimate the remaining time of the level from the time per iteration
    /// so far. `level_elapsed` is the time spent in the current level.
    pub fn calculate_remaining(&mut self, level_elapsed: Duration) {
        if self.iteration > 0 {
            let per_iteration = level_elapsed.as_secs_f64() / self.iteration as f64;
            let left = self.total_iterations.saturating_sub(self.iteration);
            self.estimated_remaining = Some(Duration::from_secs_f64(per_iteration * left as f64));
        }
    }

    /// Add a custom metric.
    pub fn add_metric(&mut self, name: impl Into<String>, value: f64) {
        self.metrics.push((name.into(), value));
    }
}

/// Receives progress notifications from a registration run.
pub trait ProgressCallback: Send + Sync {
    /// Called after every solver iteration.
    fn on_progress(&self, info: &ProgressInfo);

    /// Called when the run starts.
    fn on_start(&self) {}

    /// Called when a pyramid level starts.
    fn on_level_start(&self, _level: usize, _levels: usize, _shape: &[usize]) {}

    /// Called when the run completes successfully.
    fn on_complete(&self, _elapsed: Duration) {}

    /// Called when the run fails.
    fn on_error(&self, _error: &str) {}
}

/// Logs progress through `tracing`.
#[derive(Debug, Clone)]
pub struct ConsoleProgressCallback {
    /// Log every `log_interval` iterations (and always the last one).
    pub log_interval: usize,
}

impl Default for ConsoleProgressCallback {
    fn default() -> Self {
        Self { log_interval: 10 }
    }
}

impl ConsoleProgressCallback {
    pub fn new(log_interval: usize) -> Self {
        Self {
            log_interval: log_interval.max(1),
        }
    }
}

impl ProgressCallback for ConsoleProgressCallback {
    fn on_progress(&self, info: &ProgressInfo) {
        if info.iteration % self.log_interval == 0 || info.iteration == info.total_iterations {
            let remaining = info
                .estimated_remaining
                .map(|d| format!("{:.2}s", d.as_secs_f64()))
                .unwrap_or_else(|| "N/A".to_string());

            tracing::info!(
                "Level {} iter {}/{} ({:.1}%) | Energy: {:.6} | Elapsed: {:.2}s | ETA: {}",
                info.level,
                info.iteration,
                info.total_iterations,
                info.progress_percent(),
                info.energy,
                info.elapsed.as_secs_f64(),
                remaining
            );

            for (name, value) in &info.metrics {
                tracing::info!("  {}: {:.6}", name, value);
            }
        }
    }

    fn on_start(&self) {
        tracing::info!("Registration started");
    }

    fn on_level_start(&self, level: usize, levels: usize, shape: &[usize]) {
        tracing::info!("Starting level {}/{} on grid {:?}", level + 1, levels, shape);
    }

    fn on_complete(&self, elapsed: Duration) {
        tracing::info!("Registration completed in {:.2}s", elapsed.as_secs_f64());
    }

    fn on_error(&self, error: &str) {
        tracing::error!("Registration failed: {}", error);
    }
}

/// Records every progress notification.
#[derive(Debug, Clone, Default)]
pub struct HistoryCallback {
    history: Arc<Mutex<Vec<ProgressInfo>>>,
}

impl HistoryCallback {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the recorded history.
    pub fn get_history(&self) -> Vec<ProgressInfo> {
        lock(&self.history).clone()
    }

    /// Energies recorded for one level, in iteration order.
    pub fn energies(&self, level: usize) -> Vec<f64> {
        lock(&self.history)
            .iter()
            .filter(|info| info.level == level)
            .map(|info| info.energy)
            .collect()
    }

    pub fn clear(&self) {
        lock(&self.history).clear();
    }
}

impl ProgressCallback for HistoryCallback {
    fn on_progress(&self, info: &ProgressInfo) {
        lock(&self.history).push(info.clone());
    }
}

/// Fans progress out to a set of callbacks and keeps run/level timers.
#[derive(Clone, Default)]
pub struct ProgressTracker {
    callbacks: Vec<Arc<dyn ProgressCallback>>,
    start_time: Arc<Mutex<Option<Instant>>>,
    level_start: Arc<Mutex<Option<Instant>>>,
}

impl std::fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("callbacks", &self.callbacks.len())
            .finish()
    }
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_callback(&mut self, callback: Arc<dyn ProgressCallback>) {
        self.callbacks.push(callback);
    }

    pub fn has_callbacks(&self) -> bool {
        !self.callbacks.is_empty()
    }

    /// Start tracking a run.
    pub fn start(&self) {
        *lock(&self.start_time) = Some(Instant::now());
        for callback in &self.callbacks {
            callback.on_start();
        }
    }

    /// Mark the start of a pyramid level.
    pub fn start_level(&self, level: usize, levels: usize, shape: &[usize]) {
        *lock(&self.level_start) = Some(Instant::now());
        for callback in &self.callbacks {
            callback.on_level_start(level, levels, shape);
        }
    }

    /// Report one finished iteration along with solver-specific quantities.
    pub fn update(
        &self,
        level: usize,
        iteration: usize,
        total_iterations: usize,
        energy: f64,
        metrics: &[(&str, f64)],
    ) {
        if self.callbacks.is_empty() {
            return;
        }
        let elapsed = Self::since(&self.start_time);
        let mut info = ProgressInfo::new(level, iteration, total_iterations, energy, elapsed);
        info.calculate_remaining(Self::since(&self.level_start));
        for (name, value) in metrics {
            info.add_metric(*name, *value);
        }

        for callback in &self.callbacks {
            callback.on_progress(&info);
        }
    }

    /// Complete tracking.
    pub fn complete(&self) {
        let elapsed = Self::since(&self.start_time);
        for callback in &self.callbacks {
            callback.on_complete(elapsed);
        }
    }

    /// Report a failed run.
    pub fn error(&self, error: &str) {
        for callback in &self.callbacks {
            callback.on_error(error);
        }
    }

    fn since(timer: &Mutex<Option<Instant>>) -> Duration {
        lock(timer).map(|t| t.elapsed()).unwrap_or(Duration::ZERO)
    }
}

// A panicking callback must not take progress reporting down with it.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_info() {
        let info = ProgressInfo::new(1, 10, 100, 0.5, Duration::from_secs(10));
        assert_eq!(info.level, 1);
        assert_eq!(info.iteration, 10);
        assert_eq!(info.energy, 0.5);
        assert_eq!(info.progress_percent(), 10.0);
    }

    #[test]
    fn test_progress_info_remaining() {
        let mut info = ProgressInfo::new(0, 10, 100, 0.5, Duration::from_secs(10));
        info.calculate_remaining(Duration::from_secs(10));
        assert_eq!(info.estimated_remaining, Some(Duration::from_secs(90)));

        let mut first = ProgressInfo::new(0, 0, 100, 0.5, Duration::ZERO);
        first.calculate_remaining(Duration::ZERO);
        assert!(first.estimated_remaining.is_none());
    }

    #[test]
    fn test_history_callback() {
        let callback = HistoryCallback::new();
        callback.on_progress(&ProgressInfo::new(0, 1, 2, 0.5, Duration::ZERO));
        callback.on_progress(&ProgressInfo::new(0, 2, 2, 0.4, Duration::ZERO));
        callback.on_progress(&ProgressInfo::new(1, 1, 5, 0.3, Duration::ZERO));

        let history = callback.get_history();
        assert_eq!(history.len(), 3);
        assert_eq!(history[1].iteration, 2);
        assert_eq!(callback.energies(0), vec![0.5, 0.4]);
        assert_eq!(callback.energies(1), vec![0.3]);

        callback.clear();
        assert!(callback.get_history().is_empty());
    }

    #[test]
    fn test_progress_tracker_fans_out() {
        let history = HistoryCallback::new();
        let mut tracker = ProgressTracker::new();
        assert!(!tracker.has_callbacks());
        tracker.add_callback(Arc::new(history.clone()));
        tracker.add_callback(Arc::new(ConsoleProgressCallback::new(1)));

        tracker.start();
        tracker.start_level(0, 2, &[8, 8]);
        tracker.update(0, 1, 2, 0.5, &[]);
        tracker.update(0, 2, 2, 0.4, &[]);
        tracker.complete();

        let recorded = history.get_history();
        assert_eq!(recorded.len(), 2);
        assert_eq!(recorded[1].total_iterations, 2);
        assert!(recorded[0].metrics.is_empty());
    }

    #[test]
    fn test_progress_tracker_forwards_metrics() {
        let history = HistoryCallback::new();
        let mut tracker = ProgressTracker::new();
        tracker.add_callback(Arc::new(history.clone()));

        tracker.start_level(1, 2, &[4, 4]);
        tracker.update(1, 1, 3, 0.25, &[("inside", 16.0), ("increment", 0.5)]);

        let recorded = history.get_history();
        assert_eq!(recorded[0].level, 1);
        assert_eq!(
            recorded[0].metrics,
            vec![("inside".to_string(), 16.0), ("increment".to_string(), 0.5)]
        );
        assert!(recorded[0].estimated_remaining.is_some());
    }
}
