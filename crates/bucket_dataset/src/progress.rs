//! Observational progress sinks. Implementations must never block processing.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

pub(crate) const DEFAULT_LOG_EVERY_SAMPLES: usize = 1000;

pub trait ProgressSink: Send + Sync {
    fn set_stage(&self, description: &str);
    fn reset(&self, total: usize);
    /// One or more samples processed.
    fn advance(&self, n: usize);
    fn write_line(&self, line: &str);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn set_stage(&self, _description: &str) {}
    fn reset(&self, _total: usize) {}
    fn advance(&self, _n: usize) {}
    fn write_line(&self, _line: &str) {}
}

/// Logs stage changes, breakdown lines and every N processed samples through `tracing`.
#[derive(Debug)]
pub struct TracingProgress {
    stage: Mutex<String>,
    total: AtomicUsize,
    done: AtomicUsize,
    log_every: usize,
}

impl Default for TracingProgress {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_EVERY_SAMPLES)
    }
}

impl TracingProgress {
    pub fn new(log_every: usize) -> Self {
        Self {
            stage: Mutex::new(String::new()),
            total: AtomicUsize::new(0),
            done: AtomicUsize::new(0),
            log_every: log_every.max(1),
        }
    }

    pub fn processed(&self) -> usize {
        self.done.load(Ordering::Relaxed)
    }
}

impl ProgressSink for TracingProgress {
    fn set_stage(&self, description: &str) {
        if let Ok(mut stage) = self.stage.try_lock() {
            *stage = description.to_string();
        }
        tracing::info!("{description}");
    }

    fn reset(&self, total: usize) {
        self.total.store(total, Ordering::Relaxed);
        self.done.store(0, Ordering::Relaxed);
    }

    fn advance(&self, n: usize) {
        let before = self.done.fetch_add(n, Ordering::Relaxed);
        let after = before + n;
        if after / self.log_every > before / self.log_every {
            let stage = self
                .stage
                .try_lock()
                .map(|s| s.clone())
                .unwrap_or_default();
            tracing::info!(
                "{stage}: {after}/{} samples",
                self.total.load(Ordering::Relaxed)
            );
        }
    }

    fn write_line(&self, line: &str) {
        tracing::info!("{line}");
    }
}
