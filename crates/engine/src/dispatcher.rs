//! Walks one stream's clients through the pipeline stages.
//!
//! One client at a time, stages strictly in order. Cancellation is only
//! observed between clients, so a client is either fully processed or not
//! touched at all.

use std::sync::Arc;

use leadrun_core::run_id;
use leadrun_storage::{ClientRecord, ClientRunStatus, OrchestratorStorage, Severity};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::client_run_tracker::ClientRunTracker;
use crate::error::TrackerError;
use crate::issues::{IssueRecorder, IssueReport};
use crate::job_tracker::{ClientOutcome, JobTracker};
use crate::partition;
use crate::stage::{Stage, StageInvoker, StageRequest};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchRequest {
    /// Base run id.
    pub run_id: String,
    pub stream: u8,
    /// Restrict the run to a single client.
    pub client_filter: Option<String>,
    pub lead_scoring_limit: Option<u32>,
    pub post_scoring_limit: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchSummary {
    /// Clients on this stream that were due to run.
    pub eligible: usize,
    pub processed: u32,
    pub succeeded: u32,
    pub failed: u32,
    /// Clients whose row in this run was already terminal.
    pub skipped: u32,
    pub cancelled: bool,
}

pub struct Dispatcher {
    storage: Arc<dyn OrchestratorStorage>,
    jobs: Arc<JobTracker>,
    client_runs: Arc<ClientRunTracker>,
    issues: Arc<IssueRecorder>,
    stages: Arc<dyn StageInvoker>,
    min_service_level: u8,
}

impl Dispatcher {
    pub fn new(
        storage: Arc<dyn OrchestratorStorage>,
        jobs: Arc<JobTracker>,
        client_runs: Arc<ClientRunTracker>,
        issues: Arc<IssueRecorder>,
        stages: Arc<dyn StageInvoker>,
        min_service_level: u8,
    ) -> Self {
        Dispatcher {
            storage,
            jobs,
            client_runs,
            issues,
            stages,
            min_service_level,
        }
    }

    /// The clients this request would process, in processing order.
    pub async fn clients_for(
        &self,
        request: &DispatchRequest,
    ) -> Result<Vec<ClientRecord>, TrackerError> {
        let clients = self.storage.list_clients(None).await?;
        let mut eligible = partition::eligible(&clients, self.min_service_level);
        if let Some(ref only) = request.client_filter {
            eligible.retain(|c| c.client_id == *only);
        }
        Ok(partition::partition(eligible, request.stream))
    }

    /// Process every client of the stream.
    ///
    /// Client-level failures are recorded and counted, never returned. An
    /// error here means the run's own bookkeeping is unreachable.
    pub async fn dispatch(
        &self,
        request: &DispatchRequest,
        cancel: &CancellationToken,
    ) -> Result<DispatchSummary, TrackerError> {
        let clients = self.clients_for(request).await?;
        let mut summary = DispatchSummary {
            eligible: clients.len(),
            ..DispatchSummary::default()
        };
        tracing::info!(
            run_id = %request.run_id,
            stream = request.stream,
            clients = clients.len(),
            "dispatching stream"
        );

        for client in &clients {
            if cancel.is_cancelled() {
                tracing::warn!(run_id = %request.run_id, "cancellation observed, stopping dispatch");
                summary.cancelled = true;
                break;
            }

            let outcome = match self.process_client(request, client).await {
                Some(outcome) => outcome,
                None => {
                    summary.skipped += 1;
                    continue;
                }
            };

            match self.jobs.record_client_outcome(&request.run_id, &outcome).await {
                Ok(_) => {}
                // Someone else closed the run underneath us.
                Err(TrackerError::RunClosed { status, .. }) => {
                    tracing::warn!(run_id = %request.run_id, %status, "run closed during dispatch");
                    summary.cancelled = true;
                    break;
                }
                Err(e) => return Err(e),
            }
            summary.processed += 1;
            if outcome.succeeded {
                summary.succeeded += 1;
            } else {
                summary.failed += 1;
            }
        }

        Ok(summary)
    }

    /// Run one client. `None` when the client already finished in this run.
    async fn process_client(
        &self,
        request: &DispatchRequest,
        client: &ClientRecord,
    ) -> Option<ClientOutcome> {
        let client_id = client.client_id.as_str();
        let compound = run_id::with_client(&request.run_id, client_id);

        let row = match self.client_runs.ensure_client_run(&compound, client).await {
            Ok(row) => row,
            Err(e) => {
                self.client_fatal(request, &compound, client_id, &e, false).await;
                return Some(ClientOutcome::failed(client_id));
            }
        };
        if row.status.is_terminal() {
            tracing::info!(run_id = %compound, client_id, status = %row.status, "client already finished, skipping");
            return None;
        }

        let status = match self.run_stages(request, &compound, client).await {
            Ok(status) => status,
            Err(e) => {
                self.client_fatal(request, &compound, client_id, &e, true).await;
                return Some(ClientOutcome::failed(client_id));
            }
        };

        match self
            .client_runs
            .complete_client_run(&compound, client_id, status, None)
            .await
        {
            Ok(row) => Some(ClientOutcome {
                client_id: client_id.to_string(),
                succeeded: status == ClientRunStatus::Completed,
                metrics: row.metrics,
            }),
            Err(e) => {
                self.client_fatal(request, &compound, client_id, &e, true).await;
                Some(ClientOutcome::failed(client_id))
            }
        }
    }

    /// Invoke the stages in order and work out the client's status.
    ///
    /// A failed stage skips the rest: `Failed` when it was the first stage
    /// invoked, `CompletedWithErrors` otherwise.
    async fn run_stages(
        &self,
        request: &DispatchRequest,
        compound: &str,
        client: &ClientRecord,
    ) -> Result<ClientRunStatus, TrackerError> {
        let client_id = client.client_id.as_str();
        let stages = Stage::ALL
            .into_iter()
            .filter(|s| client.service_level >= s.min_service_level());

        for (index, stage) in stages.enumerate() {
            let limit = match stage {
                Stage::LeadScoring => request.lead_scoring_limit,
                Stage::PostScoring => request.post_scoring_limit,
                Stage::PostHarvesting => None,
            };
            let stage_request = StageRequest {
                stage,
                run_id: compound.to_string(),
                client_id: client_id.to_string(),
                stream: request.stream,
                limit,
            };

            match self.stages.invoke(&stage_request).await {
                Ok(report) => {
                    tracing::info!(run_id = %compound, client_id, %stage, job_id = %report.job_id, "stage accepted");
                    self.client_runs
                        .merge_stage_report(compound, client_id, &report)
                        .await?;
                }
                Err(failure) => {
                    tracing::error!(run_id = %compound, client_id, %stage, error = %failure, "stage failed");
                    self.client_runs
                        .record_error(compound, client_id, stage, &failure.message)
                        .await?;
                    let report =
                        IssueReport::from_stage_failure(&failure, compound, client_id, request.stream);
                    if let Err(e) = self.issues.record(report).await {
                        tracing::warn!(run_id = %compound, error = %e, "could not record production issue");
                    }
                    return Ok(if index == 0 {
                        ClientRunStatus::Failed
                    } else {
                        ClientRunStatus::CompletedWithErrors
                    });
                }
            }
        }
        Ok(ClientRunStatus::Completed)
    }

    /// Report a client that could not be processed. When its row exists
    /// it is failed so no later run picks it up as live.
    async fn client_fatal(
        &self,
        request: &DispatchRequest,
        compound: &str,
        client_id: &str,
        error: &TrackerError,
        row_open: bool,
    ) {
        tracing::error!(run_id = %compound, client_id, error = %error, "client skipped");
        if row_open {
            let note = format!("Failed: {}", error);
            match self
                .client_runs
                .complete_client_run(compound, client_id, ClientRunStatus::Failed, Some(&note))
                .await
            {
                Ok(_) | Err(TrackerError::ClientRunCompleted { .. }) => {}
                Err(e) => {
                    tracing::warn!(run_id = %compound, client_id, error = %e, "could not fail client run");
                }
            }
        }
        let report = IssueReport::new("smart-resume", compound, error.to_string())
            .with_client(client_id)
            .with_stream(request.stream)
            .with_severity(Severity::Critical);
        if let Err(e) = self.issues.record(report).await {
            tracing::warn!(run_id = %compound, error = %e, "could not record production issue");
        }
    }
}
