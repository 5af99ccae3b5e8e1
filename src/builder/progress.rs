//! Background progress monitor for batch runs.
//!
//! Periodically logs how many instances have started, finished and
//! succeeded so long batches can be followed without reading every
//! per-instance log line.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;

/// Snapshot of the batch counters at a point in time.
#[derive(Debug, Clone)]
pub struct ProgressSnapshot {
    pub started: usize,
    pub finished: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Validation rounds run across all instances.
    pub rounds: usize,
    /// Instances whose first round reused a memory-pool entry.
    pub cache_hits: usize,
    /// Sandboxes (probe sessions and validation runs) currently live.
    pub sandboxes_active: usize,
    pub elapsed: Duration,
}

/// Shared atomic counters, cloned into every instance task.
#[derive(Debug, Clone)]
pub struct ProgressCounters {
    pub started: Arc<AtomicUsize>,
    pub finished: Arc<AtomicUsize>,
    pub succeeded: Arc<AtomicUsize>,
    pub failed: Arc<AtomicUsize>,
    pub rounds: Arc<AtomicUsize>,
    pub cache_hits: Arc<AtomicUsize>,
    pub sandboxes_active: Arc<AtomicUsize>,
}

impl Default for ProgressCounters {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressCounters {
    pub fn new() -> Self {
        Self {
            started: Arc::new(AtomicUsize::new(0)),
            finished: Arc::new(AtomicUsize::new(0)),
            succeeded: Arc::new(AtomicUsize::new(0)),
            failed: Arc::new(AtomicUsize::new(0)),
            rounds: Arc::new(AtomicUsize::new(0)),
            cache_hits: Arc::new(AtomicUsize::new(0)),
            sandboxes_active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Count one instance as finished with the given result.
    pub fn record_finished(&self, success: bool) {
        self.finished.fetch_add(1, Ordering::Relaxed);
        if success {
            self.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Mark a sandbox live until the returned guard drops.
    pub fn sandbox_guard(&self) -> SandboxGuard {
        self.sandboxes_active.fetch_add(1, Ordering::Relaxed);
        SandboxGuard {
            counter: self.sandboxes_active.clone(),
        }
    }

    pub fn snapshot(&self, start: Instant) -> ProgressSnapshot {
        ProgressSnapshot {
            started: self.started.load(Ordering::Relaxed),
            finished: self.finished.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            rounds: self.rounds.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            sandboxes_active: self.sandboxes_active.load(Ordering::Relaxed),
            elapsed: start.elapsed(),
        }
    }
}

/// Decrements the active-sandbox gauge on drop.
pub struct SandboxGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for SandboxGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}

/// A background task that periodically logs batch progress.
///
/// Call [`ProgressMonitor::stop`] to cancel.
pub struct ProgressMonitor {
    stop_flag: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ProgressMonitor {
    /// Start a monitor that logs every `interval`.
    ///
    /// # Arguments
    ///
    /// * `counters` - Shared counters incremented by the instance tasks
    /// * `total` - Number of instances in the batch (used for the percentage)
    /// * `interval` - How often to emit progress logs
    pub fn start(counters: ProgressCounters, total: usize, interval: Duration) -> Self {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let flag = stop_flag.clone();
        let start = Instant::now();

        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.tick().await; // skip the immediate first tick

            loop {
                tick.tick().await;
                if flag.load(Ordering::Relaxed) {
                    break;
                }

                let snap = counters.snapshot(start);
                let pct = if total > 0 {
                    (snap.finished as f64 / total as f64 * 100.0).min(100.0)
                } else {
                    0.0
                };
                let elapsed_secs = snap.elapsed.as_secs_f64();
                let finished_per_min = if elapsed_secs > 0.0 {
                    snap.finished as f64 / elapsed_secs * 60.0
                } else {
                    0.0
                };

                tracing::info!(
                    started = snap.started,
                    finished = snap.finished,
                    succeeded = snap.succeeded,
                    failed = snap.failed,
                    rounds = snap.rounds,
                    cache_hits = snap.cache_hits,
                    sandboxes_active = snap.sandboxes_active,
                    total = total,
                    progress_pct = format!("{:.1}%", pct),
                    elapsed_secs = snap.elapsed.as_secs(),
                    finished_per_min = format!("{:.2}", finished_per_min),
                    "Batch progress"
                );
            }
        });

        Self {
            stop_flag,
            handle: Some(handle),
        }
    }

    /// Signal the monitor to stop and wait for it to finish.
    pub async fn stop(mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for ProgressMonitor {
    fn drop(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
    }
}
