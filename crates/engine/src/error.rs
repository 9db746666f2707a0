use leadrun_core::RunIdError;
use leadrun_storage::{ClientRunStatus, JobStatus, StorageError};

/// Configuration problems, always raised before any row is written.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid value for {var}: {message}")]
    Invalid { var: &'static str, message: String },

    #[error("stream {stream} is out of range (expected 1..={max})")]
    StreamOutOfRange { stream: i64, max: u8 },
}

/// Errors from the job and client-run trackers.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TrackerError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    InvalidRunId(#[from] RunIdError),

    #[error("no job tracking row for run {run_id}")]
    RunNotFound { run_id: String },

    /// The aggregate row is terminal; only error-summary appends are allowed.
    #[error("run {run_id} is closed ({status})")]
    RunClosed { run_id: String, status: JobStatus },

    #[error("run {run_id} already finished as {current}, refusing {requested}")]
    TerminalStateAlreadySet {
        run_id: String,
        current: JobStatus,
        requested: JobStatus,
    },

    #[error("{status} is not a terminal status")]
    NotTerminal { status: String },

    #[error("no client run row for {client_id} in run {run_id}")]
    ClientRunNotFound { run_id: String, client_id: String },

    #[error("client run {run_id} for {client_id} already completed ({status})")]
    ClientRunCompleted {
        run_id: String,
        client_id: String,
        status: ClientRunStatus,
    },
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum IssueError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("production issue {record_id} not found")]
    NotFound { record_id: String },

    #[error("production issue {record_id} is already fixed")]
    AlreadyFixed {
        record_id: String,
        commit_hash: Option<String>,
    },
}

/// Errors surfaced by the smart-resume driver to its callers.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DriverError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    InvalidRunId(#[from] RunIdError),

    /// Another run holds the advisory lock.
    #[error("smart resume already running as {job_id} ({age_minutes} min)")]
    AlreadyRunning { job_id: String, age_minutes: u64 },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error("run {run_id} already finished as {status}")]
    RunAlreadyFinished { run_id: String, status: JobStatus },
}
