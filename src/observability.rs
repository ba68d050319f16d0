use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{info, warn};

/// Workflow counters, shared by the engine and its notification dispatcher
#[derive(Debug, Default)]
pub struct WorkflowMetrics {
    pub transitions_executed: AtomicU64,
    pub transitions_rejected: AtomicU64,
    pub cascades_applied: AtomicU64,
    pub conflicts_retried: AtomicU64,
    pub notifications_sent: AtomicU64,
    pub notification_failures: AtomicU64,
}

impl WorkflowMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_transition(&self) {
        self.transitions_executed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejection(&self) {
        self.transitions_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cascade(&self) {
        self.cascades_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_conflict_retry(&self) {
        self.conflicts_retried.fetch_add(1, Ordering::Relaxed);
        warn!("Work order changed concurrently, retrying");
    }

    pub fn record_notification_sent(&self) {
        self.notifications_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_notification_failure(&self) {
        self.notification_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_stats(&self) -> WorkflowStats {
        WorkflowStats {
            transitions_executed: self.transitions_executed.load(Ordering::Relaxed),
            transitions_rejected: self.transitions_rejected.load(Ordering::Relaxed),
            cascades_applied: self.cascades_applied.load(Ordering::Relaxed),
            conflicts_retried: self.conflicts_retried.load(Ordering::Relaxed),
            notifications_sent: self.notifications_sent.load(Ordering::Relaxed),
            notification_failures: self.notification_failures.load(Ordering::Relaxed),
        }
    }

    pub fn log_stats(&self) {
        let stats = self.get_stats();
        info!(
            "Workflow metrics: transitions={}, rejected={}, cascades={}, conflicts={}, notified={}, notify_failures={}",
            stats.transitions_executed,
            stats.transitions_rejected,
            stats.cascades_applied,
            stats.conflicts_retried,
            stats.notifications_sent,
            stats.notification_failures
        );
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowStats {
    pub transitions_executed: u64,
    pub transitions_rejected: u64,
    pub cascades_applied: u64,
    pub conflicts_retried: u64,
    pub notifications_sent: u64,
    pub notification_failures: u64,
}

/// Time an operation and log its duration when finished
pub struct OperationTimer {
    operation: String,
    start: Instant,
}

impl OperationTimer {
    pub fn new(operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            start: Instant::now(),
        }
    }

    pub fn finish(self) {
        let duration = self.start.elapsed();
        info!(
            operation = %self.operation,
            duration_ms = duration.as_millis(),
            "Operation completed"
        );
    }
}
