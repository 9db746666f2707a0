//! The smart-resume driver: one entry point per run.

use std::sync::Arc;

use leadrun_core::run_id;
use leadrun_storage::{JobStatus, OrchestratorStorage};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::cache::RecordCache;
use crate::client_run_tracker::ClientRunTracker;
use crate::clock::Clock;
use crate::config::OrchestratorConfig;
use crate::dispatcher::{DispatchRequest, DispatchSummary, Dispatcher};
use crate::error::{DriverError, TrackerError};
use crate::issues::{IssueRecorder, IssueReport};
use crate::job_tracker::{select_terminal_status, FinishOutcome, JobTracker};
use crate::lock::{Acquisition, AdvisoryLock, LockHolder, LockStatus, ResetOutcome};
use crate::stage::StageInvoker;

/// Parameters of one run, as accepted by the trigger endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    pub stream: Option<i64>,
    pub client_filter: Option<String>,
    pub lead_scoring_limit: Option<u32>,
    pub post_scoring_limit: Option<u32>,
    /// Base run id to reuse; never taken from HTTP bodies.
    #[serde(skip)]
    pub run_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStarted {
    pub job_id: String,
    pub stream: u8,
    pub run_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub job_id: String,
    pub run_id: String,
    pub stream: u8,
    pub status: JobStatus,
    pub summary: DispatchSummary,
}

struct Prepared {
    started: RunStarted,
    dispatch: DispatchRequest,
}

struct DriverInner {
    config: OrchestratorConfig,
    jobs: Arc<JobTracker>,
    client_runs: Arc<ClientRunTracker>,
    issues: Arc<IssueRecorder>,
    dispatcher: Dispatcher,
    lock: AdvisoryLock,
    clock: Arc<dyn Clock>,
}

/// Cheap to clone; clones share the lock, cache and trackers.
#[derive(Clone)]
pub struct SmartResumeDriver {
    inner: Arc<DriverInner>,
}

impl SmartResumeDriver {
    pub fn new(
        config: OrchestratorConfig,
        storage: Arc<dyn OrchestratorStorage>,
        stages: Arc<dyn StageInvoker>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let cache = Arc::new(RecordCache::new());
        let jobs = Arc::new(JobTracker::new(storage.clone(), clock.clone()));
        let client_runs = Arc::new(ClientRunTracker::new(
            storage.clone(),
            cache,
            clock.clone(),
        ));
        let issues = Arc::new(IssueRecorder::new(storage.clone(), clock.clone()));
        let dispatcher = Dispatcher::new(
            storage,
            jobs.clone(),
            client_runs.clone(),
            issues.clone(),
            stages,
            config.min_service_level,
        );
        let lock = AdvisoryLock::new(clock.clone(), config.stuck_lock_minutes);
        SmartResumeDriver {
            inner: Arc::new(DriverInner {
                config,
                jobs,
                client_runs,
                issues,
                dispatcher,
                lock,
                clock,
            }),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    pub fn issues(&self) -> &Arc<IssueRecorder> {
        &self.inner.issues
    }

    pub fn jobs(&self) -> &Arc<JobTracker> {
        &self.inner.jobs
    }

    pub fn client_runs(&self) -> &Arc<ClientRunTracker> {
        &self.inner.client_runs
    }

    /// Start a run in the background and return as soon as the lock is held.
    pub fn start(&self, request: RunRequest) -> Result<RunStarted, DriverError> {
        self.spawn(request).map(|(started, _)| started)
    }

    /// Like [`start`](Self::start), also handing back the run's task.
    pub fn spawn(
        &self,
        request: RunRequest,
    ) -> Result<(RunStarted, JoinHandle<Result<RunReport, DriverError>>), DriverError> {
        let (prepared, acquisition) = self.prepare(request)?;
        let started = prepared.started.clone();
        let driver = self.clone();
        let handle = tokio::spawn(async move {
            let result = driver.execute(prepared, acquisition).await;
            if let Err(ref e) = result {
                tracing::error!(error = %e, "smart-resume run failed");
            }
            result
        });
        Ok((started, handle))
    }

    /// Run to completion.
    pub async fn run(&self, request: RunRequest) -> Result<RunReport, DriverError> {
        let (prepared, acquisition) = self.prepare(request)?;
        self.execute(prepared, acquisition).await
    }

    pub fn status(&self) -> LockStatus {
        self.inner.lock.status()
    }

    pub fn reset(&self, force_terminate: bool) -> ResetOutcome {
        self.inner.lock.reset(force_terminate)
    }

    /// Validate the request and take the lock. No storage I/O happens here,
    /// so contention is answered immediately.
    fn prepare(&self, request: RunRequest) -> Result<(Prepared, Acquisition), DriverError> {
        let config = &self.inner.config;
        let stream = config.resolve_stream(request.stream)?;
        let rid = match request.run_id.or_else(|| config.run_id_override.clone()) {
            Some(rid) => run_id::require_base(&rid)?.to_string(),
            None => run_id::mint_at(self.inner.clock.now()),
        };
        let job_id = format!("smart_resume_{}_stream{}", rid, stream);

        let acquisition = self
            .inner
            .lock
            .try_acquire(&job_id, &rid, stream)
            .map_err(|c| {
                tracing::info!(holder = %c.job_id, age_minutes = c.age_minutes, "smart resume already running");
                DriverError::AlreadyRunning {
                    job_id: c.job_id,
                    age_minutes: c.age_minutes,
                }
            })?;

        let prepared = Prepared {
            started: RunStarted {
                job_id,
                stream,
                run_id: rid.clone(),
            },
            dispatch: DispatchRequest {
                run_id: rid,
                stream,
                client_filter: request.client_filter.filter(|c| !c.trim().is_empty()),
                lead_scoring_limit: request.lead_scoring_limit.or(config.lead_scoring_limit),
                post_scoring_limit: request.post_scoring_limit.or(config.post_scoring_limit),
            },
        };
        Ok((prepared, acquisition))
    }

    async fn execute(&self, prepared: Prepared, acquisition: Acquisition) -> Result<RunReport, DriverError> {
        // Dropping the guard at the end of this function releases the lock
        // on every path.
        let Acquisition { guard, reclaimed } = acquisition;
        let Prepared { started, dispatch } = prepared;
        let rid = dispatch.run_id.as_str();

        if let Some(stale) = reclaimed {
            self.recover_stale(&stale).await;
        }

        let notes = format!("Smart resume {} on stream {}", started.job_id, started.stream);
        let row = self.inner.jobs.begin_run(rid, dispatch.stream, &notes).await?;
        if row.status.is_terminal() {
            return Err(DriverError::RunAlreadyFinished {
                run_id: row.run_id,
                status: row.status,
            });
        }

        let summary = match self
            .inner
            .dispatcher
            .dispatch(&dispatch, guard.cancellation_token())
            .await
        {
            Ok(summary) => summary,
            Err(e) => {
                self.abort_run(rid, &e).await;
                return Err(e.into());
            }
        };

        let (status, note) = if summary.cancelled {
            (
                JobStatus::Failed,
                format!(
                    "Terminated: cancellation observed after {} of {} clients",
                    summary.processed, summary.eligible
                ),
            )
        } else {
            let totals = self.inner.jobs.get_run(rid).await?;
            let (processed, succeeded, failed) = totals
                .map(|r| (r.clients_processed, r.clients_succeeded, r.clients_failed))
                .unwrap_or((summary.processed, summary.succeeded, summary.failed));
            let status = select_terminal_status(summary.eligible, processed, succeeded, failed);
            (
                status,
                format!(
                    "{} of {} clients succeeded, {} failed, {} skipped",
                    succeeded, processed, failed, summary.skipped
                ),
            )
        };

        self.close_leftover_rows(rid).await;
        let status = match self.inner.jobs.finish(rid, status, Some(&note)).await {
            Ok(outcome) => outcome_status(&outcome),
            Err(TrackerError::TerminalStateAlreadySet { current, .. }) => current,
            Err(e) => return Err(e.into()),
        };

        Ok(RunReport {
            job_id: started.job_id,
            run_id: started.run_id,
            stream: started.stream,
            status,
            summary,
        })
    }

    /// Close out the run of a holder whose lock was reclaimed.
    async fn recover_stale(&self, stale: &LockHolder) {
        let age = (self.inner.clock.now() - stale.acquired_at).whole_minutes();
        let note = format!(
            "Terminated: smart-resume lock held by {} for {} minutes was reclaimed",
            stale.job_id, age
        );
        match self
            .inner
            .jobs
            .finish(&stale.run_id, JobStatus::Failed, Some(&note))
            .await
        {
            Ok(_) | Err(TrackerError::TerminalStateAlreadySet { .. }) | Err(TrackerError::RunNotFound { .. }) => {}
            Err(e) => tracing::warn!(run_id = %stale.run_id, error = %e, "could not finish stale run"),
        }
        if let Err(e) = self.inner.client_runs.close_stale_runs(&stale.run_id, &note).await {
            tracing::warn!(run_id = %stale.run_id, error = %e, "could not close stale client runs");
        }
    }

    async fn abort_run(&self, rid: &str, error: &TrackerError) {
        self.close_leftover_rows(rid).await;
        let message = error.to_string();
        if let Err(e) = self
            .inner
            .jobs
            .finish(rid, JobStatus::Failed, Some(&format!("Aborted: {}", message)))
            .await
        {
            tracing::warn!(run_id = %rid, error = %e, "could not finish aborted run");
        }
        let report = IssueReport::new("smart-resume", rid, message);
        if let Err(e) = self.inner.issues.record(report).await {
            tracing::warn!(run_id = %rid, error = %e, "could not record production issue");
        }
    }

    /// Fail client rows of `rid` that are still `Running` when the run ends.
    async fn close_leftover_rows(&self, rid: &str) {
        let note = "Terminated: client run still open when its job run ended";
        if let Err(e) = self.inner.client_runs.close_stale_runs(rid, note).await {
            tracing::warn!(run_id = %rid, error = %e, "could not close leftover client runs");
        }
    }
}

fn outcome_status(outcome: &FinishOutcome) -> JobStatus {
    outcome.record().status
}
