use super::PassReport;
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Debug)]
pub struct ReconcileStats {
    pub passes_completed: AtomicU64,
    pub passes_skipped: AtomicU64,
    pub passes_aborted: AtomicU64,
    pub last_pass_unix_ms: AtomicU64,
    pub clusters_merged_total: AtomicU64,
    pub fields_backfilled_total: AtomicU64,
    pub last_error: Mutex<Option<String>>,
}

impl ReconcileStats {
    pub fn new() -> Self {
        Self {
            passes_completed: AtomicU64::new(0),
            passes_skipped: AtomicU64::new(0),
            passes_aborted: AtomicU64::new(0),
            last_pass_unix_ms: AtomicU64::new(0),
            clusters_merged_total: AtomicU64::new(0),
            fields_backfilled_total: AtomicU64::new(0),
            last_error: Mutex::new(None),
        }
    }

    pub fn record_pass(&self, report: &PassReport) {
        self.passes_completed.fetch_add(1, Ordering::Relaxed);
        if report.aborted {
            self.passes_aborted.fetch_add(1, Ordering::Relaxed);
        } else if report.errors == 0 {
            self.clear_error();
        }
        self.clusters_merged_total
            .fetch_add(report.clusters_merged, Ordering::Relaxed);
        self.fields_backfilled_total
            .fetch_add(report.fields_backfilled, Ordering::Relaxed);
        let now = Utc::now().timestamp_millis() as u64;
        self.last_pass_unix_ms.store(now, Ordering::Relaxed);
    }

    pub fn record_skipped(&self) {
        self.passes_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self, err: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }

    pub fn clear_error(&self) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = None;
        }
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|guard| guard.clone())
    }
}

impl Default for ReconcileStats {
    fn default() -> Self {
        Self::new()
    }
}
