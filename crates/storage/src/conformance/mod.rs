//! Conformance test suite for `OrchestratorStorage` implementations.
//!
//! A backend-agnostic suite any `OrchestratorStorage` implementation can
//! run to verify it behaves the way the trackers expect. It covers:
//!
//! - **Job runs**: single aggregate row per run id, patches, status listing
//! - **Client runs**: compound run ids, `Running` lookup, base-prefix listing,
//!   batched updates
//! - **Issues**: open-issue dedup lookup, fix transitions, stack traces
//! - **Errors**: unknown record ids and duplicate keys map onto the right
//!   `StorageError` variants
//!
//! # Usage
//!
//! Backend crates call [`run_conformance_suite`] with a factory that creates
//! a fresh, empty storage instance for each test:
//!
//! ```ignore
//! use leadrun_storage::conformance::run_conformance_suite;
//!
//! #[tokio::test]
//! async fn memory_conformance() {
//!     let report = run_conformance_suite(|| async { InMemoryStorage::new() }).await;
//!     assert!(report.failed == 0, "{report}");
//! }
//! ```

mod client_runs;
mod errors;
mod issues;
mod job_runs;

use std::fmt;
use std::future::Future;

use crate::record::{
    ClientRunMetrics, ClientRunRecord, ClientRunStatus, IssueStatus, JobStatus,
    JobTrackingRecord, ProductionIssueRecord, Severity,
};
use crate::OrchestratorStorage;

/// Result of a single conformance test.
#[derive(Debug, Clone)]
pub struct TestResult {
    /// Test category (e.g. "job_runs", "issues").
    pub category: String,
    pub name: String,
    pub passed: bool,
    /// Error message if the test failed.
    pub message: Option<String>,
}

impl TestResult {
    fn from_result(category: &str, name: &str, result: Result<(), String>) -> Self {
        let (passed, message) = match result {
            Ok(()) => (true, None),
            Err(msg) => (false, Some(msg)),
        };
        Self {
            category: category.to_string(),
            name: name.to_string(),
            passed,
            message,
        }
    }
}

/// Aggregated report from a full conformance suite run.
#[derive(Debug, Clone)]
pub struct ConformanceReport {
    pub results: Vec<TestResult>,
    pub passed: usize,
    pub failed: usize,
    pub total: usize,
}

impl fmt::Display for ConformanceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Conformance: {}/{} passed ({} failed)",
            self.passed, self.total, self.failed
        )?;
        for r in &self.results {
            if !r.passed {
                writeln!(
                    f,
                    "  FAIL [{}/{}]: {}",
                    r.category,
                    r.name,
                    r.message.as_deref().unwrap_or("(no message)")
                )?;
            }
        }
        Ok(())
    }
}

/// Run the full conformance suite against a storage backend.
///
/// The `factory` function is called once per test to create a fresh, empty
/// storage instance, ensuring test isolation.
pub async fn run_conformance_suite<S, F, Fut>(factory: F) -> ConformanceReport
where
    S: OrchestratorStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.extend(job_runs::run_job_run_tests(&factory).await);
    results.extend(client_runs::run_client_run_tests(&factory).await);
    results.extend(issues::run_issue_tests(&factory).await);
    results.extend(errors::run_error_tests(&factory).await);

    let passed = results.iter().filter(|r| r.passed).count();
    let total = results.len();

    ConformanceReport {
        results,
        passed,
        failed: total - passed,
        total,
    }
}

// ── Helpers: record constructors with sensible defaults ──────────────────────

fn make_job_run(run_id: &str, stream: u8) -> JobTrackingRecord {
    JobTrackingRecord {
        record_id: String::new(),
        run_id: run_id.to_string(),
        status: JobStatus::Running,
        stream,
        start_time: "2025-01-01T12:00:00Z".to_string(),
        end_time: None,
        clients_processed: 0,
        clients_succeeded: 0,
        clients_failed: 0,
        profiles_scored: 0,
        posts_harvested: 0,
        posts_scored: 0,
        tokens_used: 0,
        system_notes: String::new(),
        error_summary: String::new(),
    }
}

fn make_client_run(run_id: &str, client_id: &str) -> ClientRunRecord {
    ClientRunRecord {
        record_id: String::new(),
        run_id: run_id.to_string(),
        client_id: client_id.to_string(),
        client_name: client_id.to_uppercase(),
        status: ClientRunStatus::Running,
        start_time: "2025-01-01T12:00:01Z".to_string(),
        end_time: None,
        metrics: ClientRunMetrics::default(),
        harvest_actor_run_id: None,
        system_notes: String::new(),
        error_details: String::new(),
    }
}

fn make_issue(run_id: &str, pattern: &str) -> ProductionIssueRecord {
    ProductionIssueRecord {
        record_id: String::new(),
        timestamp: "2025-01-01T12:00:02Z".to_string(),
        severity: Severity::Error,
        pattern: pattern.to_string(),
        error_message: "boom".to_string(),
        stack_trace_id: None,
        run_id: run_id.to_string(),
        client_id: None,
        stream: Some(1),
        run_type: "smart-resume".to_string(),
        status: IssueStatus::Open,
        commit_hash: None,
        fix_notes: None,
        occurrences: 1,
    }
}
