mod stats;


pub use stats::ReconcileStats;

use crate::cluster::{self, Granularity, DEFAULT_MAX_CLUSTERS_PER_PASS};
use crate::fetch::{fetch_window, Window, DEFAULT_WINDOW_SIZE};
use crate::gapfill::{GapFillResolver, DEFAULT_PROXIMITY_TOLERANCE_SECONDS};
use crate::merge::{self, CommitError};
use crate::select::select_best;
use crate::store::{RecordStore, StoreError};
use futures::FutureExt;
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    pub window_size: usize,
    pub max_clusters_per_pass: usize,
    pub granularity: Granularity,
    pub proximity_tolerance: Duration,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            window_size: DEFAULT_WINDOW_SIZE,
            max_clusters_per_pass: DEFAULT_MAX_CLUSTERS_PER_PASS,
            granularity: Granularity::Minute,
            proximity_tolerance: Duration::from_secs(DEFAULT_PROXIMITY_TOLERANCE_SECONDS as u64),
        }
    }
}

/// Counts for one pass. `errors` covers per-cluster and per-record failures that the pass
/// stepped over; `aborted` means the store went away and remaining steps were skipped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub clusters_merged: u64,
    pub fields_backfilled: u64,
    pub records_backfilled: u64,
    pub records_deleted: u64,
    pub malformed_skipped: u64,
    pub errors: u64,
    pub aborted: bool,
}

impl PassReport {
    pub fn is_noop(&self) -> bool {
        self.clusters_merged == 0 && self.fields_backfilled == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    Completed(PassReport),
    /// Another pass held the run lock; this trigger was dropped.
    Skipped,
}

enum Step {
    Continue,
    Abort,
}

pub struct Reconciler {
    store: Arc<dyn RecordStore>,
    settings: ReconcilerSettings,
    gap_fill: GapFillResolver,
    run_lock: Mutex<()>,
    stats: Arc<ReconcileStats>,
    shutdown: CancellationToken,
}

impl Reconciler {
    pub fn new(store: Arc<dyn RecordStore>, settings: ReconcilerSettings) -> Self {
        let gap_fill = GapFillResolver::new(settings.proximity_tolerance);
        Self {
            store,
            settings,
            gap_fill,
            run_lock: Mutex::new(()),
            stats: Arc::new(ReconcileStats::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// In-flight passes stop at the next commit boundary once `token` is cancelled.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn stats(&self) -> Arc<ReconcileStats> {
        self.stats.clone()
    }

    /// Runs one cluster-then-gap-fill pass unless one is already running. Never fails:
    /// store errors and panics end the pass early with whatever was committed so far.
    pub async fn run_pass(&self) -> PassOutcome {
        let Ok(_guard) = self.run_lock.try_lock() else {
            self.stats.record_skipped();
            tracing::debug!("reconciliation pass already running; trigger dropped");
            return PassOutcome::Skipped;
        };

        let started = Instant::now();
        let mut report = PassReport::default();
        let result = AssertUnwindSafe(self.execute(&mut report))
            .catch_unwind()
            .await;
        if result.is_err() {
            report.errors += 1;
            report.aborted = true;
            self.stats.record_error("reconciliation pass panicked");
            tracing::error!("reconciliation pass panicked; partial results kept");
        }

        self.stats.record_pass(&report);
        let elapsed_ms = started.elapsed().as_millis() as u64;
        if report.is_noop() && !report.aborted {
            tracing::info!(elapsed_ms, "no reconciliation needed; data is optimal");
        } else {
            tracing::info!(
                clusters_merged = report.clusters_merged,
                records_deleted = report.records_deleted,
                fields_backfilled = report.fields_backfilled,
                records_backfilled = report.records_backfilled,
                malformed_skipped = report.malformed_skipped,
                errors = report.errors,
                aborted = report.aborted,
                elapsed_ms,
                "reconciliation pass finished"
            );
        }
        PassOutcome::Completed(report)
    }

    async fn execute(&self, report: &mut PassReport) {
        let Some(window) = self.fetch(report).await else {
            return;
        };
        report.malformed_skipped = window.malformed as u64;
        if let Step::Abort = self.merge_clusters(&window, report).await {
            return;
        }
        if self.shutdown.is_cancelled() {
            return;
        }

        // Deleted siblings must not donate or receive values, so read the window again.
        let Some(window) = self.fetch(report).await else {
            return;
        };
        self.backfill(&window, report).await;
    }

    async fn fetch(&self, report: &mut PassReport) -> Option<Window> {
        match fetch_window(self.store.as_ref(), self.settings.window_size).await {
            Ok(window) => Some(window),
            Err(err) => {
                self.abort(report, &err, "failed to fetch sensor window");
                None
            }
        }
    }

    async fn merge_clusters(&self, window: &Window, report: &mut PassReport) -> Step {
        let clusters = cluster::group(&window.records, self.settings.granularity);
        let targets =
            cluster::reconciliation_targets(&clusters, self.settings.max_clusters_per_pass);
        if clusters.len() > targets.len() {
            tracing::info!(
                pending = clusters.len() - targets.len(),
                "deferring older duplicate clusters to the next pass"
            );
        }

        for cluster in targets {
            if self.shutdown.is_cancelled() {
                tracing::info!("shutdown requested; stopping after last committed cluster");
                return Step::Abort;
            }
            let Some(canonical) = select_best(cluster) else {
                continue;
            };
            let result = merge::merge(cluster, canonical);
            match merge::commit(self.store.as_ref(), &result).await {
                Ok(outcome) => {
                    report.clusters_merged += 1;
                    report.records_deleted += outcome.deleted;
                    tracing::info!(
                        bucket = %cluster.key,
                        members = cluster.members.len(),
                        survivor = %result.survivor,
                        adopted = result.adopted_fields(),
                        "merged duplicate records"
                    );
                }
                Err(err) => {
                    if err.store_error().is_unavailable() {
                        self.abort(report, err.store_error(), "store lost during cluster merge");
                        return Step::Abort;
                    }
                    report.errors += 1;
                    self.stats.record_error(err.to_string());
                    match &err {
                        CommitError::PartialCommit { .. } => tracing::warn!(
                            error = %err,
                            bucket = %cluster.key,
                            "partial cluster commit; leftovers retried next pass"
                        ),
                        CommitError::Update { .. } => tracing::warn!(
                            error = %err,
                            bucket = %cluster.key,
                            "cluster merge failed"
                        ),
                    }
                }
            }
        }
        Step::Continue
    }

    async fn backfill(&self, window: &Window, report: &mut PassReport) {
        let clusters = cluster::group(&window.records, self.settings.granularity);
        let clustered = cluster::clustered_ids(&clusters);
        let plan = self.gap_fill.plan(&window.records, &clustered);

        for backfill in plan {
            if self.shutdown.is_cancelled() {
                tracing::info!("shutdown requested; stopping after last backfilled record");
                return;
            }
            match self
                .store
                .update_fields(backfill.record_id, &backfill.patch)
                .await
            {
                Ok(0) => {
                    tracing::debug!(record = %backfill.record_id, "record vanished before backfill");
                }
                Ok(_) => {
                    let fields = backfill.patch.fields.len() as u64;
                    report.records_backfilled += 1;
                    report.fields_backfilled += fields;
                    tracing::info!(record = %backfill.record_id, fields, "backfilled N/A fields");
                }
                Err(err) if err.is_unavailable() => {
                    self.abort(report, &err, "store lost during backfill");
                    return;
                }
                Err(err) => {
                    report.errors += 1;
                    self.stats.record_error(err.to_string());
                    tracing::warn!(error = %err, record = %backfill.record_id, "failed to backfill record");
                }
            }
        }
    }

    fn abort(&self, report: &mut PassReport, err: &StoreError, message: &str) {
        report.errors += 1;
        report.aborted = true;
        self.stats.record_error(err.to_string());
        tracing::warn!(error = %err, "{message}; retrying on next trigger");
    }
}
