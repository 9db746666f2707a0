//! In-process storage backend.
//!
//! Used for tests and dry runs. Writes are validated against the field
//! catalogue exactly like the hosted backend, so a payload that passes here
//! will not be rejected for its field names over the wire.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;

use leadrun_core::run_id;

use crate::codec::RowCodec;
use crate::error::StorageError;
use crate::fields::{validate_write, Table};
use crate::patch::{ClientRunPatch, IssuePatch, JobRunPatch};
use crate::record::{
    ClientRecord, ClientRunRecord, ClientRunStatus, ClientStatus, IssueStatus, JobStatus,
    JobTrackingRecord, ProductionIssueRecord, StackTraceRecord,
};
use crate::traits::OrchestratorStorage;

#[derive(Default)]
struct Tables {
    clients: Vec<ClientRecord>,
    job_runs: Vec<JobTrackingRecord>,
    client_runs: Vec<ClientRunRecord>,
    issues: Vec<ProductionIssueRecord>,
    stack_traces: Vec<StackTraceRecord>,
    /// Clients whose client-run rows cannot be created (failure injection).
    rejected_clients: HashSet<String>,
    /// Client-run updates still to fail (failure injection).
    failing_client_run_updates: usize,
}

/// Seed document accepted by [`InMemoryStorage::from_seed_json`].
#[derive(Debug, Deserialize)]
struct Seed {
    #[serde(default)]
    clients: Vec<ClientRecord>,
}

/// `OrchestratorStorage` backed by process memory.
#[derive(Default)]
pub struct InMemoryStorage {
    tables: Mutex<Tables>,
    next_id: AtomicU64,
    writes: AtomicUsize,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with clients.
    pub fn with_clients(clients: Vec<ClientRecord>) -> Self {
        let storage = Self::new();
        let clients = clients
            .into_iter()
            .map(|mut c| {
                if c.record_id.is_empty() {
                    c.record_id = storage.allocate_id();
                }
                c
            })
            .collect();
        InMemoryStorage {
            tables: Mutex::new(Tables {
                clients,
                ..Tables::default()
            }),
            ..storage
        }
    }

    /// Create a store from a JSON document of the form `{"clients": [...]}`.
    pub fn from_seed_json(json: &str) -> Result<Self, StorageError> {
        let seed: Seed = serde_json::from_str(json).map_err(|e| StorageError::Decode {
            table: Table::Clients,
            message: format!("invalid seed document: {}", e),
        })?;
        Ok(Self::with_clients(seed.clients))
    }

    /// Add or replace a client.
    pub async fn upsert_client(&self, mut client: ClientRecord) {
        let mut tables = self.tables.lock().await;
        if let Some(existing) = tables
            .clients
            .iter_mut()
            .find(|c| c.client_id == client.client_id)
        {
            client.record_id = existing.record_id.clone();
            *existing = client;
        } else {
            if client.record_id.is_empty() {
                client.record_id = self.allocate_id();
            }
            tables.clients.push(client);
        }
    }

    /// Make every `create_client_run` for this client fail with a 503.
    pub async fn reject_client_runs_for(&self, client_id: &str) {
        self.tables
            .lock()
            .await
            .rejected_clients
            .insert(client_id.to_string());
    }

    /// Make the next `count` client-run updates fail with a 503. Zero
    /// restores normal service.
    pub async fn fail_client_run_updates(&self, count: usize) {
        self.tables.lock().await.failing_client_run_updates = count;
    }

    /// Number of successful write operations so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Every `Job Tracking` row, in creation order.
    pub async fn job_runs(&self) -> Vec<JobTrackingRecord> {
        self.tables.lock().await.job_runs.clone()
    }

    /// Every `Client Run Results` row, in creation order.
    pub async fn client_runs(&self) -> Vec<ClientRunRecord> {
        self.tables.lock().await.client_runs.clone()
    }

    /// Every `Stack Traces` row, in creation order.
    pub async fn stack_traces(&self) -> Vec<StackTraceRecord> {
        self.tables.lock().await.stack_traces.clone()
    }

    fn allocate_id(&self) -> String {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        format!("rec{:014}", n)
    }

    fn wrote(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }
}

fn not_found(table: Table, key: &str) -> StorageError {
    StorageError::NotFound {
        table,
        key: key.to_string(),
    }
}

#[async_trait]
impl OrchestratorStorage for InMemoryStorage {
    async fn list_clients(
        &self,
        status: Option<ClientStatus>,
    ) -> Result<Vec<ClientRecord>, StorageError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .clients
            .iter()
            .filter(|c| status.map_or(true, |s| c.status == s))
            .cloned()
            .collect())
    }

    async fn get_client(&self, client_id: &str) -> Result<Option<ClientRecord>, StorageError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .clients
            .iter()
            .find(|c| c.client_id == client_id)
            .cloned())
    }

    async fn find_job_run(&self, run_id: &str) -> Result<Option<JobTrackingRecord>, StorageError> {
        let tables = self.tables.lock().await;
        Ok(tables.job_runs.iter().find(|r| r.run_id == run_id).cloned())
    }

    async fn create_job_run(
        &self,
        mut record: JobTrackingRecord,
    ) -> Result<JobTrackingRecord, StorageError> {
        validate_write(Table::JobTracking, record.encode())?;
        let mut tables = self.tables.lock().await;
        if tables.job_runs.iter().any(|r| r.run_id == record.run_id) {
            return Err(StorageError::AlreadyExists {
                table: Table::JobTracking,
                key: record.run_id,
            });
        }
        record.record_id = self.allocate_id();
        tables.job_runs.push(record.clone());
        self.wrote();
        Ok(record)
    }

    async fn update_job_run(
        &self,
        record_id: &str,
        patch: &JobRunPatch,
    ) -> Result<JobTrackingRecord, StorageError> {
        validate_write(Table::JobTracking, patch.to_fields())?;
        let mut tables = self.tables.lock().await;
        let record = tables
            .job_runs
            .iter_mut()
            .find(|r| r.record_id == record_id)
            .ok_or_else(|| not_found(Table::JobTracking, record_id))?;
        patch.apply(record);
        let updated = record.clone();
        self.wrote();
        Ok(updated)
    }

    async fn list_job_runs(
        &self,
        status: JobStatus,
    ) -> Result<Vec<JobTrackingRecord>, StorageError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .job_runs
            .iter()
            .filter(|r| r.status == status)
            .cloned()
            .collect())
    }

    async fn find_running_client_run(
        &self,
        client_id: &str,
    ) -> Result<Option<ClientRunRecord>, StorageError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .client_runs
            .iter()
            .find(|r| r.client_id == client_id && r.status == ClientRunStatus::Running)
            .cloned())
    }

    async fn find_client_run(
        &self,
        run_id: &str,
        client_id: &str,
    ) -> Result<Option<ClientRunRecord>, StorageError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .client_runs
            .iter()
            .find(|r| r.run_id == run_id && r.client_id == client_id)
            .cloned())
    }

    async fn get_client_run(&self, record_id: &str) -> Result<ClientRunRecord, StorageError> {
        let tables = self.tables.lock().await;
        tables
            .client_runs
            .iter()
            .find(|r| r.record_id == record_id)
            .cloned()
            .ok_or_else(|| not_found(Table::ClientRunResults, record_id))
    }

    async fn create_client_run(
        &self,
        mut record: ClientRunRecord,
    ) -> Result<ClientRunRecord, StorageError> {
        validate_write(Table::ClientRunResults, record.encode())?;
        let mut tables = self.tables.lock().await;
        if tables.rejected_clients.contains(&record.client_id) {
            return Err(StorageError::Unavailable {
                status: 503,
                message: format!("client run rows rejected for '{}'", record.client_id),
            });
        }
        if tables
            .client_runs
            .iter()
            .any(|r| r.run_id == record.run_id && r.client_id == record.client_id)
        {
            return Err(StorageError::AlreadyExists {
                table: Table::ClientRunResults,
                key: record.run_id,
            });
        }
        record.record_id = self.allocate_id();
        tables.client_runs.push(record.clone());
        self.wrote();
        Ok(record)
    }

    async fn update_client_run(
        &self,
        record_id: &str,
        patch: &ClientRunPatch,
    ) -> Result<ClientRunRecord, StorageError> {
        validate_write(Table::ClientRunResults, patch.to_fields())?;
        let mut tables = self.tables.lock().await;
        if tables.failing_client_run_updates > 0 {
            tables.failing_client_run_updates -= 1;
            return Err(StorageError::Unavailable {
                status: 503,
                message: format!("client run update rejected for '{}'", record_id),
            });
        }
        let record = tables
            .client_runs
            .iter_mut()
            .find(|r| r.record_id == record_id)
            .ok_or_else(|| not_found(Table::ClientRunResults, record_id))?;
        patch.apply(record);
        let updated = record.clone();
        self.wrote();
        Ok(updated)
    }

    async fn update_client_runs(
        &self,
        updates: &[(String, ClientRunPatch)],
    ) -> Result<Vec<ClientRunRecord>, StorageError> {
        let mut out = Vec::with_capacity(updates.len());
        for (record_id, patch) in updates {
            out.push(self.update_client_run(record_id, patch).await?);
        }
        Ok(out)
    }

    async fn list_client_runs(
        &self,
        base_run_id: &str,
    ) -> Result<Vec<ClientRunRecord>, StorageError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .client_runs
            .iter()
            .filter(|r| run_id::strip_client(&r.run_id) == base_run_id)
            .cloned()
            .collect())
    }

    async fn find_open_issue(
        &self,
        pattern: &str,
        base_run_id: &str,
    ) -> Result<Option<ProductionIssueRecord>, StorageError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .issues
            .iter()
            .find(|i| {
                i.status == IssueStatus::Open
                    && i.pattern == pattern
                    && run_id::strip_client(&i.run_id) == base_run_id
            })
            .cloned())
    }

    async fn create_issue(
        &self,
        mut record: ProductionIssueRecord,
    ) -> Result<ProductionIssueRecord, StorageError> {
        validate_write(Table::ProductionIssues, record.encode())?;
        let mut tables = self.tables.lock().await;
        record.record_id = self.allocate_id();
        tables.issues.push(record.clone());
        self.wrote();
        Ok(record)
    }

    async fn update_issue(
        &self,
        record_id: &str,
        patch: &IssuePatch,
    ) -> Result<ProductionIssueRecord, StorageError> {
        validate_write(Table::ProductionIssues, patch.to_fields())?;
        let mut tables = self.tables.lock().await;
        let record = tables
            .issues
            .iter_mut()
            .find(|i| i.record_id == record_id)
            .ok_or_else(|| not_found(Table::ProductionIssues, record_id))?;
        patch.apply(record);
        let updated = record.clone();
        self.wrote();
        Ok(updated)
    }

    async fn list_issues(
        &self,
        status: Option<IssueStatus>,
    ) -> Result<Vec<ProductionIssueRecord>, StorageError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .issues
            .iter()
            .filter(|i| status.map_or(true, |s| i.status == s))
            .cloned()
            .collect())
    }

    async fn create_stack_trace(
        &self,
        mut record: StackTraceRecord,
    ) -> Result<String, StorageError> {
        validate_write(Table::StackTraces, record.encode())?;
        let mut tables = self.tables.lock().await;
        record.record_id = self.allocate_id();
        let id = record.record_id.clone();
        tables.stack_traces.push(record);
        self.wrote();
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(id: &str, status: ClientStatus) -> ClientRecord {
        ClientRecord {
            record_id: String::new(),
            client_id: id.to_string(),
            client_name: id.to_uppercase(),
            status,
            service_level: 2,
            stream: None,
            email: None,
            last_lead_scoring: None,
            last_post_harvest: None,
            last_post_scoring: None,
            feature_flags: Vec::new(),
        }
    }

    #[tokio::test]
    async fn seeded_clients_get_record_ids() {
        let storage = InMemoryStorage::with_clients(vec![
            client("a", ClientStatus::Active),
            client("b", ClientStatus::Inactive),
        ]);
        let all = storage.list_clients(None).await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.iter().all(|c| c.record_id.starts_with("rec")));
        let active = storage
            .list_clients(Some(ClientStatus::Active))
            .await
            .unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(storage.write_count(), 0);
    }

    #[tokio::test]
    async fn seed_json_is_parsed() {
        let storage = InMemoryStorage::from_seed_json(
            r#"{"clients": [{"clientId": "acme", "clientName": "Acme", "status": "Active", "stream": 2}]}"#,
        )
        .unwrap();
        let acme = storage.get_client("acme").await.unwrap().unwrap();
        assert_eq!(acme.stream, Some(2));
    }

    #[tokio::test]
    async fn bad_seed_json_is_a_decode_error() {
        let err = InMemoryStorage::from_seed_json("{not json").err().unwrap();
        assert!(matches!(err, StorageError::Decode { .. }));
    }

    #[tokio::test]
    async fn injected_update_failures_run_out() {
        let storage = InMemoryStorage::new();
        let row = storage
            .create_client_run(ClientRunRecord {
                record_id: String::new(),
                run_id: "250101-120000-a".to_string(),
                client_id: "a".to_string(),
                client_name: "A".to_string(),
                status: ClientRunStatus::Running,
                start_time: "2025-01-01T12:00:00.000Z".to_string(),
                end_time: None,
                metrics: Default::default(),
                harvest_actor_run_id: None,
                system_notes: String::new(),
                error_details: String::new(),
            })
            .await
            .unwrap();
        storage.fail_client_run_updates(1).await;
        let patch = ClientRunPatch {
            status: Some(ClientRunStatus::Failed),
            ..ClientRunPatch::default()
        };
        let err = storage.update_client_run(&row.record_id, &patch).await.unwrap_err();
        assert!(matches!(err, StorageError::Unavailable { status: 503, .. }));
        let updated = storage.update_client_run(&row.record_id, &patch).await.unwrap();
        assert_eq!(updated.status, ClientRunStatus::Failed);
    }

    #[tokio::test]
    async fn upsert_replaces_by_client_id() {
        let storage = InMemoryStorage::with_clients(vec![client("a", ClientStatus::Active)]);
        storage.upsert_client(client("a", ClientStatus::Suspended)).await;
        let all = storage.list_clients(None).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status, ClientStatus::Suspended);
    }
}
