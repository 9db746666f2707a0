//! Pipeline stage contracts.
//!
//! The three stages (lead scoring, post harvesting, post scoring) are
//! external collaborators reached over HTTP. A stage call never raises:
//! it resolves to a [`StageOutcome`], and a failure is a value the
//! dispatcher records and moves past.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use leadrun_storage::{ClientRunMetrics, RetryPolicy, RetryableError};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    LeadScoring,
    PostHarvesting,
    PostScoring,
}

impl Stage {
    /// Execution order within one client.
    pub const ALL: [Stage; 3] = [Stage::LeadScoring, Stage::PostHarvesting, Stage::PostScoring];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::LeadScoring => "lead-scoring",
            Stage::PostHarvesting => "post-harvesting",
            Stage::PostScoring => "post-scoring",
        }
    }

    /// Endpoint path on the service that runs the stage.
    pub fn path(self) -> &'static str {
        match self {
            Stage::LeadScoring => "/run-batch-score-v2",
            Stage::PostHarvesting => "/api/apify/process-level2-v2",
            Stage::PostScoring => "/run-post-batch-score-v2",
        }
    }

    /// Post stages only run for clients at service level 2 or above.
    pub fn min_service_level(self) -> u8 {
        match self {
            Stage::LeadScoring => 1,
            Stage::PostHarvesting | Stage::PostScoring => 2,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One stage call for one client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageRequest {
    #[serde(skip)]
    pub stage: Stage,
    /// Compound run id, passed through verbatim.
    pub run_id: String,
    pub client_id: String,
    pub stream: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

/// Accepted response of a stage endpoint.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageReport {
    #[serde(default)]
    pub job_id: String,
    /// Counters the stage already knows at acceptance time.
    #[serde(default)]
    pub metrics: Option<ClientRunMetrics>,
    #[serde(default)]
    pub harvest_actor_run_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Rate limit, 5xx or timeout; retried before it is reported.
    Transient,
    Unauthorized,
    /// The stage refused the request (4xx).
    Rejected,
    /// Connection-level failure.
    Transport,
    /// 2xx with a body that does not decode.
    InvalidResponse,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageFailure {
    pub stage: Stage,
    pub kind: FailureKind,
    pub message: String,
    pub stack: Option<String>,
}

impl StageFailure {
    pub fn new(stage: Stage, kind: FailureKind, message: impl Into<String>) -> Self {
        StageFailure {
            stage,
            kind,
            message: message.into(),
            stack: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {}", self.stage, self.message)
    }
}

impl RetryableError for StageFailure {
    fn is_transient(&self) -> bool {
        matches!(self.kind, FailureKind::Transient | FailureKind::Transport)
    }

    // The stage is a placeholder here; `HttpStageInvoker::invoke` restamps
    // every failure with the stage it was asked to run.
    fn timed_out(_operation: &str, after: Duration) -> Self {
        StageFailure::new(
            Stage::LeadScoring,
            FailureKind::Transient,
            format!("timeout after {}s", after.as_secs()),
        )
    }
}

pub type StageOutcome = Result<StageReport, StageFailure>;

/// Something that can run a stage for a client.
#[async_trait]
pub trait StageInvoker: Send + Sync + 'static {
    async fn invoke(&self, request: &StageRequest) -> StageOutcome;
}

/// Calls stage endpoints on the service at `base_url`.
///
/// Sends the shared secret both as a bearer token and as
/// `x-webhook-secret`, since stage endpoints accept either.
pub struct HttpStageInvoker {
    base_url: String,
    secret: String,
    agent: ureq::Agent,
    retry: RetryPolicy,
}

impl HttpStageInvoker {
    pub fn new(base_url: impl Into<String>, secret: impl Into<String>, retry: RetryPolicy) -> Self {
        let agent = ureq::Agent::new_with_config(
            ureq::Agent::config_builder()
                .timeout_global(Some(retry.call_timeout))
                .build(),
        );
        HttpStageInvoker {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            secret: secret.into(),
            agent,
            retry,
        }
    }

    pub fn url_for(&self, stage: Stage) -> String {
        format!("{}{}", self.base_url, stage.path())
    }
}

#[async_trait]
impl StageInvoker for HttpStageInvoker {
    async fn invoke(&self, request: &StageRequest) -> StageOutcome {
        let stage = request.stage;
        let url = self.url_for(stage);
        let body = serde_json::to_value(request).map_err(|e| {
            StageFailure::new(stage, FailureKind::Rejected, format!("unencodable request: {}", e))
        })?;
        self.retry
            .run(stage.path(), || {
                let agent = self.agent.clone();
                let url = url.clone();
                let secret = self.secret.clone();
                let body = body.clone();
                async move {
                    tokio::task::spawn_blocking(move || post_stage(&agent, &url, &secret, stage, &body))
                        .await
                        .map_err(|e| {
                            StageFailure::new(stage, FailureKind::Transport, format!("task join error: {}", e))
                        })?
                }
            })
            .await
            .map_err(|failure| StageFailure { stage, ..failure })
    }
}

fn post_stage(
    agent: &ureq::Agent,
    url: &str,
    secret: &str,
    stage: Stage,
    body: &serde_json::Value,
) -> StageOutcome {
    let response = agent
        .post(url)
        .header("Authorization", &format!("Bearer {}", secret))
        .header("x-webhook-secret", secret)
        .send_json(body)
        .map_err(|e| classify_stage_error(stage, url, e))?;

    response
        .into_body()
        .read_json::<StageReport>()
        .map_err(|e| {
            StageFailure::new(
                stage,
                FailureKind::InvalidResponse,
                format!("failed to parse response as JSON: {}", e),
            )
        })
}

fn classify_stage_error(stage: Stage, url: &str, err: ureq::Error) -> StageFailure {
    let kind = match err {
        ureq::Error::StatusCode(429) | ureq::Error::StatusCode(500..=599) => FailureKind::Transient,
        ureq::Error::StatusCode(401 | 403) => FailureKind::Unauthorized,
        ureq::Error::StatusCode(_) => FailureKind::Rejected,
        ureq::Error::Timeout(_) => FailureKind::Transient,
        _ => FailureKind::Transport,
    };
    StageFailure::new(stage, kind, format!("POST {}: {}", url, err))
        .with_stack(format!("{:?}", err))
}
