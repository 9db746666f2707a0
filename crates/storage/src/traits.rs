use async_trait::async_trait;

use crate::error::StorageError;
use crate::patch::{ClientRunPatch, IssuePatch, JobRunPatch};
use crate::record::{
    ClientRecord, ClientRunRecord, ClientStatus, IssueStatus, JobStatus, JobTrackingRecord,
    ProductionIssueRecord, StackTraceRecord,
};

/// Maximum number of records per batched write.
pub const MAX_BATCH: usize = 10;

/// The storage trait behind the orchestrator.
///
/// An `OrchestratorStorage` implementation provides typed access to the
/// five orchestrator tables: `Clients` (read-only), `Job Tracking`,
/// `Client Run Results`, `Production Issues` and `Stack Traces`.
///
/// ## Domain-shaped operations
///
/// Callers never poke raw records. Reads are keyed by the domain's own
/// identifiers (run id, client id, pattern) and writes go through typed
/// patches, which backends encode against the field catalogue. Any
/// backend that serialises field names must pass them through
/// [`validate_write`](crate::fields::validate_write) first.
///
/// ## Read-modify-write
///
/// Patches carry absolute values. Owners of a table (the job and client
/// run trackers) serialise their own read-modify-write sequences; the
/// storage layer does not provide compare-and-swap.
///
/// ## Thread Safety
///
/// Implementations must be `Send + Sync + 'static` to live in axum state
/// and to cross `tokio::spawn` boundaries. The trait is object safe and is
/// normally used as `Arc<dyn OrchestratorStorage>`.
#[async_trait]
pub trait OrchestratorStorage: Send + Sync + 'static {
    // ── Clients (read-only) ──────────────────────────────────────────────────

    /// List clients, optionally restricted to one status.
    async fn list_clients(
        &self,
        status: Option<ClientStatus>,
    ) -> Result<Vec<ClientRecord>, StorageError>;

    /// Look up a client by its external `clientId`.
    async fn get_client(&self, client_id: &str) -> Result<Option<ClientRecord>, StorageError>;

    // ── Job Tracking ─────────────────────────────────────────────────────────

    /// Find the aggregate row for a base run id.
    async fn find_job_run(&self, run_id: &str) -> Result<Option<JobTrackingRecord>, StorageError>;

    /// Insert a new aggregate row and return it with its record id.
    ///
    /// Returns `Err(StorageError::AlreadyExists)` if a row with the same run
    /// id exists.
    async fn create_job_run(
        &self,
        record: JobTrackingRecord,
    ) -> Result<JobTrackingRecord, StorageError>;

    /// Apply a patch to an aggregate row, returning the updated row.
    async fn update_job_run(
        &self,
        record_id: &str,
        patch: &JobRunPatch,
    ) -> Result<JobTrackingRecord, StorageError>;

    /// List aggregate rows in the given state.
    async fn list_job_runs(
        &self,
        status: JobStatus,
    ) -> Result<Vec<JobTrackingRecord>, StorageError>;

    // ── Client Run Results ───────────────────────────────────────────────────

    /// Find a `Running` row for the client, regardless of run id.
    async fn find_running_client_run(
        &self,
        client_id: &str,
    ) -> Result<Option<ClientRunRecord>, StorageError>;

    /// Find the row with exactly this compound run id and client.
    async fn find_client_run(
        &self,
        run_id: &str,
        client_id: &str,
    ) -> Result<Option<ClientRunRecord>, StorageError>;

    /// Read a row by backing record id.
    ///
    /// Returns `Err(StorageError::NotFound)` if it does not exist.
    async fn get_client_run(&self, record_id: &str) -> Result<ClientRunRecord, StorageError>;

    async fn create_client_run(
        &self,
        record: ClientRunRecord,
    ) -> Result<ClientRunRecord, StorageError>;

    async fn update_client_run(
        &self,
        record_id: &str,
        patch: &ClientRunPatch,
    ) -> Result<ClientRunRecord, StorageError>;

    /// Apply several patches. Backends with batch endpoints send at most
    /// [`MAX_BATCH`] records per request.
    async fn update_client_runs(
        &self,
        updates: &[(String, ClientRunPatch)],
    ) -> Result<Vec<ClientRunRecord>, StorageError>;

    /// All rows whose compound run id starts with the given base run id.
    async fn list_client_runs(
        &self,
        base_run_id: &str,
    ) -> Result<Vec<ClientRunRecord>, StorageError>;

    // ── Production Issues / Stack Traces ─────────────────────────────────────

    /// Find an `OPEN` issue with this pattern recorded against any client
    /// run of the given base run id.
    async fn find_open_issue(
        &self,
        pattern: &str,
        base_run_id: &str,
    ) -> Result<Option<ProductionIssueRecord>, StorageError>;

    async fn create_issue(
        &self,
        record: ProductionIssueRecord,
    ) -> Result<ProductionIssueRecord, StorageError>;

    async fn update_issue(
        &self,
        record_id: &str,
        patch: &IssuePatch,
    ) -> Result<ProductionIssueRecord, StorageError>;

    async fn list_issues(
        &self,
        status: Option<IssueStatus>,
    ) -> Result<Vec<ProductionIssueRecord>, StorageError>;

    /// Store a large stack trace and return its record id.
    async fn create_stack_trace(&self, record: StackTraceRecord) -> Result<String, StorageError>;
}
