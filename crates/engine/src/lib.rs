//! Orchestration engine for multi-tenant lead processing runs.
//!
//! A run is driven by [`SmartResumeDriver`]: it takes the advisory lock,
//! opens one `Job Tracking` row under a freshly minted base run id, and
//! hands the stream's clients to the [`Dispatcher`], which walks them in
//! `clientId` order through lead scoring, post harvesting and post scoring.
//! Per-client progress lands in `Client Run Results` through the
//! [`ClientRunTracker`]; failures become `Production Issues` through the
//! [`IssueRecorder`].
//!
//! Nothing in this crate is process-global. The record cache, the advisory
//! lock and the clock are owned by the driver and passed down explicitly.

pub mod cache;
pub mod client_run_tracker;
pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod driver;
pub mod error;
pub mod issues;
pub mod job_tracker;
pub mod lock;
pub mod partition;
pub mod stage;

pub use cache::RecordCache;
pub use client_run_tracker::ClientRunTracker;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::OrchestratorConfig;
pub use dispatcher::{DispatchRequest, DispatchSummary, Dispatcher};
pub use driver::{RunReport, RunRequest, RunStarted, SmartResumeDriver};
pub use error::{ConfigError, DriverError, IssueError, TrackerError};
pub use issues::{IssueRecorder, IssueReport};
pub use job_tracker::{select_terminal_status, ClientOutcome, FinishOutcome, JobTracker};
pub use lock::{AdvisoryLock, LockStatus, ResetOutcome};
pub use stage::{
    FailureKind, HttpStageInvoker, Stage, StageFailure, StageInvoker, StageOutcome, StageReport,
    StageRequest,
};
