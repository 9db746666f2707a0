use std::fmt;
use std::ops::{Add, AddAssign};

use serde::{Deserialize, Serialize};

/// Client account status. Only `Active` clients take part in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClientStatus {
    Active,
    Inactive,
    Suspended,
}

impl ClientStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ClientStatus::Active => "Active",
            ClientStatus::Inactive => "Inactive",
            ClientStatus::Suspended => "Suspended",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Active" => Some(ClientStatus::Active),
            "Inactive" => Some(ClientStatus::Inactive),
            "Suspended" => Some(ClientStatus::Suspended),
            _ => None,
        }
    }
}

/// Lifecycle of a `Job Tracking` row. Everything except `Running` is
/// terminal and absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
    #[serde(rename = "Completed with Errors")]
    CompletedWithErrors,
    #[serde(rename = "No Leads To Score")]
    NoLeadsToScore,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Running => "Running",
            JobStatus::Completed => "Completed",
            JobStatus::Failed => "Failed",
            JobStatus::CompletedWithErrors => "Completed with Errors",
            JobStatus::NoLeadsToScore => "No Leads To Score",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Running" => Some(JobStatus::Running),
            "Completed" => Some(JobStatus::Completed),
            "Failed" => Some(JobStatus::Failed),
            "Completed with Errors" => Some(JobStatus::CompletedWithErrors),
            "No Leads To Score" => Some(JobStatus::NoLeadsToScore),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        self != JobStatus::Running
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a `Client Run Results` row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClientRunStatus {
    Running,
    Completed,
    #[serde(rename = "Completed with Errors")]
    CompletedWithErrors,
    Failed,
}

impl ClientRunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ClientRunStatus::Running => "Running",
            ClientRunStatus::Completed => "Completed",
            ClientRunStatus::CompletedWithErrors => "Completed with Errors",
            ClientRunStatus::Failed => "Failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Running" => Some(ClientRunStatus::Running),
            "Completed" => Some(ClientRunStatus::Completed),
            "Completed with Errors" => Some(ClientRunStatus::CompletedWithErrors),
            "Failed" => Some(ClientRunStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        self != ClientRunStatus::Running
    }
}

impl fmt::Display for ClientRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Production issue state: `OPEN` until a commit resolves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IssueStatus {
    #[serde(rename = "OPEN")]
    Open,
    #[serde(rename = "FIXED")]
    Fixed,
}

impl IssueStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            IssueStatus::Open => "OPEN",
            IssueStatus::Fixed => "FIXED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "OPEN" => Some(IssueStatus::Open),
            "FIXED" => Some(IssueStatus::Fixed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Severity {
    #[serde(rename = "CRITICAL")]
    Critical,
    #[serde(rename = "ERROR")]
    Error,
    #[serde(rename = "WARNING")]
    Warning,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Critical => "CRITICAL",
            Severity::Error => "ERROR",
            Severity::Warning => "WARNING",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CRITICAL" => Some(Severity::Critical),
            "ERROR" => Some(Severity::Error),
            "WARNING" => Some(Severity::Warning),
            _ => None,
        }
    }
}

fn default_service_level() -> u8 {
    1
}

/// A tenant as read from the `Clients` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientRecord {
    /// Backing-store record id. Empty for records not yet stored.
    #[serde(default)]
    pub record_id: String,
    pub client_id: String,
    pub client_name: String,
    pub status: ClientStatus,
    /// 2 and above enables the post harvesting and post scoring stages.
    #[serde(default = "default_service_level")]
    pub service_level: u8,
    /// Stream partition. `None` is treated as stream 1.
    #[serde(default)]
    pub stream: Option<u8>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub last_lead_scoring: Option<String>,
    #[serde(default)]
    pub last_post_harvest: Option<String>,
    #[serde(default)]
    pub last_post_scoring: Option<String>,
    #[serde(default)]
    pub feature_flags: Vec<String>,
}

/// Additive per-client counters.
///
/// Writers contribute deltas which are summed into the stored totals, so
/// updates from independent stages compose in any order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientRunMetrics {
    pub profiles_examined: u64,
    pub profiles_scored: u64,
    pub profile_scoring_tokens: u64,
    pub posts_harvested: u64,
    pub harvest_actor_cost: f64,
    pub posts_examined: u64,
    pub posts_scored: u64,
    pub post_scoring_tokens: u64,
    pub errors: u32,
    pub post_scoring_errors: u32,
}

impl ClientRunMetrics {
    pub fn is_empty(&self) -> bool {
        *self == ClientRunMetrics::default()
    }

    /// Tokens spent across both scoring stages.
    pub fn tokens(&self) -> u64 {
        self.profile_scoring_tokens
            .saturating_add(self.post_scoring_tokens)
    }
}

impl AddAssign<&ClientRunMetrics> for ClientRunMetrics {
    fn add_assign(&mut self, rhs: &ClientRunMetrics) {
        self.profiles_examined = self.profiles_examined.saturating_add(rhs.profiles_examined);
        self.profiles_scored = self.profiles_scored.saturating_add(rhs.profiles_scored);
        self.profile_scoring_tokens = self
            .profile_scoring_tokens
            .saturating_add(rhs.profile_scoring_tokens);
        self.posts_harvested = self.posts_harvested.saturating_add(rhs.posts_harvested);
        self.harvest_actor_cost += rhs.harvest_actor_cost;
        self.posts_examined = self.posts_examined.saturating_add(rhs.posts_examined);
        self.posts_scored = self.posts_scored.saturating_add(rhs.posts_scored);
        self.post_scoring_tokens = self
            .post_scoring_tokens
            .saturating_add(rhs.post_scoring_tokens);
        self.errors = self.errors.saturating_add(rhs.errors);
        self.post_scoring_errors = self
            .post_scoring_errors
            .saturating_add(rhs.post_scoring_errors);
    }
}

impl AddAssign for ClientRunMetrics {
    fn add_assign(&mut self, rhs: ClientRunMetrics) {
        *self += &rhs;
    }
}

impl Add for ClientRunMetrics {
    type Output = ClientRunMetrics;

    fn add(mut self, rhs: ClientRunMetrics) -> ClientRunMetrics {
        self += &rhs;
        self
    }
}

/// One row per (run, client) in `Client Run Results`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientRunRecord {
    #[serde(default)]
    pub record_id: String,
    /// Compound run id (`YYMMDD-HHMMSS-<clientId>`).
    pub run_id: String,
    pub client_id: String,
    pub client_name: String,
    pub status: ClientRunStatus,
    /// RFC 3339 timestamp string.
    pub start_time: String,
    /// RFC 3339 timestamp string. Set exactly once, on completion.
    pub end_time: Option<String>,
    #[serde(flatten)]
    pub metrics: ClientRunMetrics,
    pub harvest_actor_run_id: Option<String>,
    pub system_notes: String,
    pub error_details: String,
}

/// The aggregate `Job Tracking` row of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobTrackingRecord {
    #[serde(default)]
    pub record_id: String,
    /// Base run id; never carries a client suffix.
    pub run_id: String,
    pub status: JobStatus,
    pub stream: u8,
    /// RFC 3339 timestamp string.
    pub start_time: String,
    /// RFC 3339 timestamp string. Set exactly once, on the terminal transition.
    pub end_time: Option<String>,
    pub clients_processed: u32,
    pub clients_succeeded: u32,
    pub clients_failed: u32,
    pub profiles_scored: u64,
    pub posts_harvested: u64,
    pub posts_scored: u64,
    pub tokens_used: u64,
    pub system_notes: String,
    pub error_summary: String,
}

/// A recorded failure awaiting remediation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductionIssueRecord {
    #[serde(default)]
    pub record_id: String,
    pub timestamp: String,
    pub severity: Severity,
    pub pattern: String,
    pub error_message: String,
    /// Record id of the linked `Stack Traces` row.
    pub stack_trace_id: Option<String>,
    /// Compound run id of the failing client run.
    pub run_id: String,
    pub client_id: Option<String>,
    pub stream: Option<u8>,
    pub run_type: String,
    pub status: IssueStatus,
    pub commit_hash: Option<String>,
    pub fix_notes: Option<String>,
    pub occurrences: u32,
}

/// Large-text companion row for a production issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackTraceRecord {
    #[serde(default)]
    pub record_id: String,
    pub timestamp: String,
    pub run_id: String,
    pub client_id: Option<String>,
    pub error_message: String,
    pub stack_trace: String,
}
