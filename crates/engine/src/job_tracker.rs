//! Owner of the `Job Tracking` table: one aggregate row per run.

use std::sync::Arc;

use leadrun_core::run_id;
use leadrun_storage::{
    ClientRunMetrics, JobRunPatch, JobStatus, JobTrackingRecord, OrchestratorStorage,
    StorageError,
};
use tokio::sync::Mutex;

use crate::clock::Clock;
use crate::error::TrackerError;

/// What a finished client contributes to the aggregate row.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientOutcome {
    pub client_id: String,
    pub succeeded: bool,
    pub metrics: ClientRunMetrics,
}

impl ClientOutcome {
    /// A client that failed before any of its work was recorded.
    pub fn failed(client_id: impl Into<String>) -> Self {
        ClientOutcome {
            client_id: client_id.into(),
            succeeded: false,
            metrics: ClientRunMetrics::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FinishOutcome {
    Finished(JobTrackingRecord),
    /// The row already carried the requested terminal status.
    AlreadyFinished(JobTrackingRecord),
}

impl FinishOutcome {
    pub fn record(&self) -> &JobTrackingRecord {
        match self {
            FinishOutcome::Finished(r) | FinishOutcome::AlreadyFinished(r) => r,
        }
    }
}

/// Pick the terminal status of a run from its client counters.
pub fn select_terminal_status(
    eligible: usize,
    processed: u32,
    succeeded: u32,
    failed: u32,
) -> JobStatus {
    if processed == 0 {
        return if eligible == 0 {
            JobStatus::NoLeadsToScore
        } else {
            // Clients were waiting but none ran.
            JobStatus::Failed
        };
    }
    match (succeeded, failed) {
        (_, 0) => JobStatus::Completed,
        (0, _) => JobStatus::Failed,
        _ => JobStatus::CompletedWithErrors,
    }
}

pub struct JobTracker {
    storage: Arc<dyn OrchestratorStorage>,
    clock: Arc<dyn Clock>,
    /// Serialises read-modify-write sequences on aggregate rows.
    write_lock: Mutex<()>,
}

impl JobTracker {
    pub fn new(storage: Arc<dyn OrchestratorStorage>, clock: Arc<dyn Clock>) -> Self {
        JobTracker {
            storage,
            clock,
            write_lock: Mutex::new(()),
        }
    }

    /// Open the aggregate row for a run. An existing row is returned
    /// unchanged, whatever its state.
    pub async fn begin_run(
        &self,
        rid: &str,
        stream: u8,
        notes: &str,
    ) -> Result<JobTrackingRecord, TrackerError> {
        let rid = run_id::require_base(rid)?;
        let _guard = self.write_lock.lock().await;

        if let Some(existing) = self.storage.find_job_run(rid).await? {
            tracing::info!(run_id = %rid, status = %existing.status, "reusing job tracking row");
            return Ok(existing);
        }

        let record = JobTrackingRecord {
            record_id: String::new(),
            run_id: rid.to_string(),
            status: JobStatus::Running,
            stream,
            start_time: self.clock.timestamp(),
            end_time: None,
            clients_processed: 0,
            clients_succeeded: 0,
            clients_failed: 0,
            profiles_scored: 0,
            posts_harvested: 0,
            posts_scored: 0,
            tokens_used: 0,
            system_notes: notes.to_string(),
            error_summary: String::new(),
        };
        match self.storage.create_job_run(record).await {
            Ok(created) => {
                tracing::info!(run_id = %rid, stream, "job run started");
                Ok(created)
            }
            // Another process won the race; use its row.
            Err(StorageError::AlreadyExists { .. }) => self
                .storage
                .find_job_run(rid)
                .await?
                .ok_or_else(|| TrackerError::RunNotFound {
                    run_id: rid.to_string(),
                }),
            Err(e) => Err(e.into()),
        }
    }

    /// Count one finished client and roll its metrics into the totals.
    pub async fn record_client_outcome(
        &self,
        rid: &str,
        outcome: &ClientOutcome,
    ) -> Result<JobTrackingRecord, TrackerError> {
        let _guard = self.write_lock.lock().await;
        let row = self.open_row(rid).await?;
        if row.status.is_terminal() {
            return Err(TrackerError::RunClosed {
                run_id: row.run_id,
                status: row.status,
            });
        }

        let m = &outcome.metrics;
        let patch = JobRunPatch {
            clients_processed: Some(row.clients_processed.saturating_add(1)),
            clients_succeeded: outcome
                .succeeded
                .then(|| row.clients_succeeded.saturating_add(1)),
            clients_failed: (!outcome.succeeded).then(|| row.clients_failed.saturating_add(1)),
            profiles_scored: Some(row.profiles_scored.saturating_add(m.profiles_scored)),
            posts_harvested: Some(row.posts_harvested.saturating_add(m.posts_harvested)),
            posts_scored: Some(row.posts_scored.saturating_add(m.posts_scored)),
            tokens_used: Some(row.tokens_used.saturating_add(m.tokens())),
            ..JobRunPatch::default()
        };
        let updated = self.storage.update_job_run(&row.record_id, &patch).await?;
        tracing::debug!(
            run_id = %updated.run_id,
            client_id = %outcome.client_id,
            succeeded = outcome.succeeded,
            processed = updated.clients_processed,
            "client outcome recorded"
        );
        Ok(updated)
    }

    /// Move the row to a terminal status, exactly once.
    ///
    /// Finishing again with the same status is a no-op; a different status
    /// is rejected with [`TrackerError::TerminalStateAlreadySet`].
    pub async fn finish(
        &self,
        rid: &str,
        status: JobStatus,
        summary: Option<&str>,
    ) -> Result<FinishOutcome, TrackerError> {
        if !status.is_terminal() {
            return Err(TrackerError::NotTerminal {
                status: status.to_string(),
            });
        }
        let _guard = self.write_lock.lock().await;
        let row = self.open_row(rid).await?;

        if row.status.is_terminal() {
            if row.status == status {
                tracing::debug!(run_id = %row.run_id, %status, "run already finished");
                return Ok(FinishOutcome::AlreadyFinished(row));
            }
            tracing::warn!(
                run_id = %row.run_id,
                current = %row.status,
                requested = %status,
                "terminal state already set"
            );
            return Err(TrackerError::TerminalStateAlreadySet {
                run_id: row.run_id,
                current: row.status,
                requested: status,
            });
        }

        let patch = JobRunPatch {
            status: Some(status),
            end_time: Some(self.clock.timestamp()),
            system_notes: summary.map(|s| append_line(&row.system_notes, s)),
            ..JobRunPatch::default()
        };
        let updated = self.storage.update_job_run(&row.record_id, &patch).await?;
        tracing::info!(
            run_id = %updated.run_id,
            %status,
            processed = updated.clients_processed,
            succeeded = updated.clients_succeeded,
            failed = updated.clients_failed,
            "job run finished"
        );
        Ok(FinishOutcome::Finished(updated))
    }

    /// Append to the error summary. Allowed in every state.
    pub async fn append_error_summary(
        &self,
        rid: &str,
        text: &str,
    ) -> Result<JobTrackingRecord, TrackerError> {
        let _guard = self.write_lock.lock().await;
        let row = self.open_row(rid).await?;
        let patch = JobRunPatch {
            error_summary: Some(append_line(&row.error_summary, text)),
            ..JobRunPatch::default()
        };
        Ok(self.storage.update_job_run(&row.record_id, &patch).await?)
    }

    pub async fn get_run(&self, rid: &str) -> Result<Option<JobTrackingRecord>, TrackerError> {
        let rid = run_id::require_base(rid)?;
        Ok(self.storage.find_job_run(rid).await?)
    }

    async fn open_row(&self, rid: &str) -> Result<JobTrackingRecord, TrackerError> {
        let rid = run_id::require_base(rid)?;
        self.storage
            .find_job_run(rid)
            .await?
            .ok_or_else(|| TrackerError::RunNotFound {
                run_id: rid.to_string(),
            })
    }
}

/// Append a line to a multi-line text field.
pub(crate) fn append_line(existing: &str, line: &str) -> String {
    if existing.is_empty() {
        line.to_string()
    } else {
        format!("{}\n{}", existing, line)
    }
}
