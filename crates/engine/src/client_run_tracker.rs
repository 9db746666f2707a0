//! Owner of the `Client Run Results` table.
//!
//! Rows are located client-first: an existing `Running` row for the
//! client is reused whatever run id it carries while that run is still
//! live, so one client never has two live rows. A `Running` row whose run
//! has finished is failed and replaced. Metric writes are additive; the tracker serialises its
//! own read-modify-write sequences so concurrent reporters compose.

use std::sync::Arc;

use leadrun_core::run_id;
use leadrun_storage::{
    ClientRecord, ClientRunMetrics, ClientRunPatch, ClientRunRecord, ClientRunStatus, JobStatus,
    OrchestratorStorage, StorageError,
};
use tokio::sync::Mutex;

use crate::cache::RecordCache;
use crate::clock::Clock;
use crate::error::TrackerError;
use crate::job_tracker::append_line;
use crate::stage::{Stage, StageReport};

pub struct ClientRunTracker {
    storage: Arc<dyn OrchestratorStorage>,
    cache: Arc<RecordCache>,
    clock: Arc<dyn Clock>,
    write_lock: Mutex<()>,
}

impl ClientRunTracker {
    pub fn new(
        storage: Arc<dyn OrchestratorStorage>,
        cache: Arc<RecordCache>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        ClientRunTracker {
            storage,
            cache,
            clock,
            write_lock: Mutex::new(()),
        }
    }

    /// Find or create the row for `client` in this run.
    ///
    /// Lookup order: record cache, any `Running` row for the client whose
    /// run is still live, the exact compound run id. Only when all three
    /// miss is a row created.
    pub async fn ensure_client_run(
        &self,
        rid: &str,
        client: &ClientRecord,
    ) -> Result<ClientRunRecord, TrackerError> {
        run_id::parse(rid)?;
        let client_id = client.client_id.as_str();
        let compound = run_id::with_client(rid, client_id);
        let _guard = self.write_lock.lock().await;

        if let Some(row) = self.cached_row(&compound, client_id).await? {
            return Ok(row);
        }

        if let Some(row) = self.storage.find_running_client_run(client_id).await? {
            let own_run = run_id::strip_client(&row.run_id) == run_id::strip_client(&compound);
            if own_run || self.run_is_live(&row.run_id).await? {
                if !own_run {
                    tracing::warn!(
                        run_id = %compound,
                        client_id,
                        existing = %row.run_id,
                        "reusing running client row from another run"
                    );
                }
                self.cache.insert(&compound, client_id, &row.record_id);
                return Ok(row);
            }
            self.supersede(row, &compound).await?;
        }

        if let Some(row) = self.storage.find_client_run(&compound, client_id).await? {
            self.cache.insert(&compound, client_id, &row.record_id);
            return Ok(row);
        }

        let created = self
            .storage
            .create_client_run(ClientRunRecord {
                record_id: String::new(),
                run_id: compound.clone(),
                client_id: client_id.to_string(),
                client_name: client.client_name.clone(),
                status: ClientRunStatus::Running,
                start_time: self.clock.timestamp(),
                end_time: None,
                metrics: ClientRunMetrics::default(),
                harvest_actor_run_id: None,
                system_notes: String::new(),
                error_details: String::new(),
            })
            .await?;
        self.cache.insert(&compound, client_id, &created.record_id);
        tracing::info!(run_id = %compound, client_id, "client run started");
        Ok(created)
    }

    /// Add counters to the row's totals.
    pub async fn add_metrics(
        &self,
        rid: &str,
        client_id: &str,
        delta: &ClientRunMetrics,
    ) -> Result<ClientRunRecord, TrackerError> {
        self.mutate(rid, client_id, |row| ClientRunPatch {
            metrics: Some(row.metrics.clone() + delta.clone()),
            ..ClientRunPatch::default()
        })
        .await
    }

    pub async fn add_profiles_scored(
        &self,
        rid: &str,
        client_id: &str,
        count: u64,
        tokens: u64,
    ) -> Result<ClientRunRecord, TrackerError> {
        let delta = ClientRunMetrics {
            profiles_examined: count,
            profiles_scored: count,
            profile_scoring_tokens: tokens,
            ..ClientRunMetrics::default()
        };
        self.add_metrics(rid, client_id, &delta).await
    }

    pub async fn add_posts_harvested(
        &self,
        rid: &str,
        client_id: &str,
        count: u64,
    ) -> Result<ClientRunRecord, TrackerError> {
        let delta = ClientRunMetrics {
            posts_harvested: count,
            ..ClientRunMetrics::default()
        };
        self.add_metrics(rid, client_id, &delta).await
    }

    pub async fn add_posts_scored(
        &self,
        rid: &str,
        client_id: &str,
        count: u64,
        tokens: u64,
    ) -> Result<ClientRunRecord, TrackerError> {
        let delta = ClientRunMetrics {
            posts_examined: count,
            posts_scored: count,
            post_scoring_tokens: tokens,
            ..ClientRunMetrics::default()
        };
        self.add_metrics(rid, client_id, &delta).await
    }

    /// Record the harvest actor run. The cost accumulates; the id is
    /// last-writer-wins.
    pub async fn set_harvest_run(
        &self,
        rid: &str,
        client_id: &str,
        actor_run_id: &str,
        cost: f64,
    ) -> Result<ClientRunRecord, TrackerError> {
        self.mutate(rid, client_id, |row| {
            let mut metrics = row.metrics.clone();
            metrics.harvest_actor_cost += cost;
            ClientRunPatch {
                metrics: Some(metrics),
                harvest_actor_run_id: Some(actor_run_id.to_string()),
                ..ClientRunPatch::default()
            }
        })
        .await
    }

    /// Merge what a stage reported on acceptance into the row, in one write.
    pub async fn merge_stage_report(
        &self,
        rid: &str,
        client_id: &str,
        report: &StageReport,
    ) -> Result<ClientRunRecord, TrackerError> {
        self.mutate(rid, client_id, |row| ClientRunPatch {
            metrics: report
                .metrics
                .as_ref()
                .map(|delta| row.metrics.clone() + delta.clone()),
            harvest_actor_run_id: report.harvest_actor_run_id.clone(),
            ..ClientRunPatch::default()
        })
        .await
    }

    /// Count a stage error against the client and keep its message.
    pub async fn record_error(
        &self,
        rid: &str,
        client_id: &str,
        stage: Stage,
        message: &str,
    ) -> Result<ClientRunRecord, TrackerError> {
        self.mutate(rid, client_id, |row| {
            let mut metrics = row.metrics.clone();
            metrics.errors = metrics.errors.saturating_add(1);
            if stage == Stage::PostScoring {
                metrics.post_scoring_errors = metrics.post_scoring_errors.saturating_add(1);
            }
            ClientRunPatch {
                metrics: Some(metrics),
                error_details: Some(append_line(
                    &row.error_details,
                    &format!("[{}] {}", stage, message),
                )),
                ..ClientRunPatch::default()
            }
        })
        .await
    }

    /// Append to the error details. Allowed in every state.
    pub async fn append_error_details(
        &self,
        rid: &str,
        client_id: &str,
        text: &str,
    ) -> Result<ClientRunRecord, TrackerError> {
        self.mutate_any(rid, client_id, |row| ClientRunPatch {
            error_details: Some(append_line(&row.error_details, text)),
            ..ClientRunPatch::default()
        })
        .await
    }

    /// Move the row to a terminal status and stamp its end time, once.
    pub async fn complete_client_run(
        &self,
        rid: &str,
        client_id: &str,
        status: ClientRunStatus,
        notes: Option<&str>,
    ) -> Result<ClientRunRecord, TrackerError> {
        if !status.is_terminal() {
            return Err(TrackerError::NotTerminal {
                status: status.to_string(),
            });
        }
        let _guard = self.write_lock.lock().await;
        let row = self.resolve(rid, client_id).await?;
        if row.status.is_terminal() {
            return Err(already_completed(row, client_id));
        }
        let patch = ClientRunPatch {
            status: Some(status),
            end_time: Some(self.clock.timestamp()),
            system_notes: notes.map(|n| append_line(&row.system_notes, n)),
            ..ClientRunPatch::default()
        };
        let updated = self.storage.update_client_run(&row.record_id, &patch).await?;
        tracing::info!(run_id = %updated.run_id, client_id, %status, "client run completed");
        Ok(updated)
    }

    pub async fn get_client_run(
        &self,
        rid: &str,
        client_id: &str,
    ) -> Result<Option<ClientRunRecord>, TrackerError> {
        match self.resolve(rid, client_id).await {
            Ok(row) => Ok(Some(row)),
            Err(TrackerError::ClientRunNotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Fail every `Running` row of an abandoned run. Returns how many rows
    /// were closed.
    pub async fn close_stale_runs(&self, base_rid: &str, note: &str) -> Result<usize, TrackerError> {
        let base = run_id::require_base(run_id::strip_client(base_rid))?;
        let _guard = self.write_lock.lock().await;
        let end_time = self.clock.timestamp();
        let updates: Vec<(String, ClientRunPatch)> = self
            .storage
            .list_client_runs(base)
            .await?
            .into_iter()
            .filter(|row| row.status == ClientRunStatus::Running)
            .map(|row| {
                self.cache.remove(&row.run_id, &row.client_id);
                let patch = ClientRunPatch {
                    status: Some(ClientRunStatus::Failed),
                    end_time: Some(end_time.clone()),
                    system_notes: Some(append_line(&row.system_notes, note)),
                    ..ClientRunPatch::default()
                };
                (row.record_id, patch)
            })
            .collect();
        if updates.is_empty() {
            return Ok(0);
        }
        let closed = self.storage.update_client_runs(&updates).await?.len();
        tracing::warn!(run_id = %base, closed, "stale client runs failed");
        Ok(closed)
    }

    /// Whether the job run that owns `row_run_id` is still `Running`.
    async fn run_is_live(&self, row_run_id: &str) -> Result<bool, TrackerError> {
        let base = run_id::strip_client(row_run_id);
        Ok(self
            .storage
            .find_job_run(base)
            .await?
            .is_some_and(|job| job.status == JobStatus::Running))
    }

    /// Fail a `Running` row left behind by a run that has already finished.
    async fn supersede(&self, row: ClientRunRecord, by: &str) -> Result<(), TrackerError> {
        let note = format!("Superseded by run {}: left running by a finished run", by);
        let patch = ClientRunPatch {
            status: Some(ClientRunStatus::Failed),
            end_time: Some(self.clock.timestamp()),
            system_notes: Some(append_line(&row.system_notes, &note)),
            ..ClientRunPatch::default()
        };
        self.storage.update_client_run(&row.record_id, &patch).await?;
        self.cache.remove(&row.run_id, &row.client_id);
        tracing::warn!(run_id = %by, client_id = %row.client_id, orphan = %row.run_id, "orphaned client run failed");
        Ok(())
    }

    /// Patch a live row. Terminal rows only take error details.
    async fn mutate<F>(&self, rid: &str, client_id: &str, build: F) -> Result<ClientRunRecord, TrackerError>
    where
        F: FnOnce(&ClientRunRecord) -> ClientRunPatch,
    {
        let _guard = self.write_lock.lock().await;
        let row = self.resolve(rid, client_id).await?;
        if row.status.is_terminal() {
            return Err(already_completed(row, client_id));
        }
        self.apply(row, build).await
    }

    async fn mutate_any<F>(&self, rid: &str, client_id: &str, build: F) -> Result<ClientRunRecord, TrackerError>
    where
        F: FnOnce(&ClientRunRecord) -> ClientRunPatch,
    {
        let _guard = self.write_lock.lock().await;
        let row = self.resolve(rid, client_id).await?;
        self.apply(row, build).await
    }

    async fn apply<F>(&self, row: ClientRunRecord, build: F) -> Result<ClientRunRecord, TrackerError>
    where
        F: FnOnce(&ClientRunRecord) -> ClientRunPatch,
    {
        let patch = build(&row);
        if patch.is_empty() {
            return Ok(row);
        }
        Ok(self.storage.update_client_run(&row.record_id, &patch).await?)
    }

    /// Locate the row for updates: cache, exact id, then running row.
    async fn resolve(&self, rid: &str, client_id: &str) -> Result<ClientRunRecord, TrackerError> {
        run_id::parse(rid)?;
        let compound = run_id::with_client(rid, client_id);
        if let Some(row) = self.cached_row(&compound, client_id).await? {
            return Ok(row);
        }
        let found = match self.storage.find_client_run(&compound, client_id).await? {
            Some(row) => Some(row),
            None => self.storage.find_running_client_run(client_id).await?,
        };
        match found {
            Some(row) => {
                self.cache.insert(&compound, client_id, &row.record_id);
                Ok(row)
            }
            None => Err(TrackerError::ClientRunNotFound {
                run_id: compound,
                client_id: client_id.to_string(),
            }),
        }
    }

    async fn cached_row(
        &self,
        compound: &str,
        client_id: &str,
    ) -> Result<Option<ClientRunRecord>, TrackerError> {
        let Some(record_id) = self.cache.get(compound, client_id) else {
            return Ok(None);
        };
        match self.storage.get_client_run(&record_id).await {
            Ok(row) => Ok(Some(row)),
            Err(StorageError::NotFound { .. }) => {
                self.cache.remove(compound, client_id);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn already_completed(row: ClientRunRecord, client_id: &str) -> TrackerError {
    TrackerError::ClientRunCompleted {
        run_id: row.run_id,
        client_id: client_id.to_string(),
        status: row.status,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use leadrun_storage::{ClientStatus, InMemoryStorage, JobTrackingRecord};
    use time::macros::datetime;

    const RID: &str = "250101-120000";

    fn client(id: &str) -> ClientRecord {
        ClientRecord {
            record_id: String::new(),
            client_id: id.to_string(),
            client_name: id.to_uppercase(),
            status: ClientStatus::Active,
            service_level: 2,
            stream: None,
            email: None,
            last_lead_scoring: None,
            last_post_harvest: None,
            last_post_scoring: None,
            feature_flags: Vec::new(),
        }
    }

    fn tracker() -> (Arc<InMemoryStorage>, Arc<RecordCache>, ClientRunTracker) {
        let storage = Arc::new(InMemoryStorage::new());
        let cache = Arc::new(RecordCache::new());
        let clock = Arc::new(ManualClock::new(datetime!(2025-01-01 12:00:00 UTC)));
        (
            storage.clone(),
            cache.clone(),
            ClientRunTracker::new(storage, cache, clock),
        )
    }

    #[tokio::test]
    async fn ensure_creates_once_with_compound_id() {
        let (storage, cache, runs) = tracker();
        let a = runs.ensure_client_run(RID, &client("acme")).await.unwrap();
        let b = runs
            .ensure_client_run("250101-120000-acme", &client("acme"))
            .await
            .unwrap();
        assert_eq!(a.record_id, b.record_id);
        assert_eq!(a.run_id, "250101-120000-acme");
        assert_eq!(storage.client_runs().await.len(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn running_row_is_reused_across_code_paths() {
        let (storage, cache, runs) = tracker();
        let first = runs.ensure_client_run(RID, &client("acme")).await.unwrap();
        // A second entry point with a cold cache still finds the live row.
        cache.clear();
        let second = runs.ensure_client_run(RID, &client("acme")).await.unwrap();
        assert_eq!(first.record_id, second.record_id);
        assert_eq!(storage.client_runs().await.len(), 1);
    }

    async fn job_row(storage: &InMemoryStorage, rid: &str, status: JobStatus) {
        storage
            .create_job_run(JobTrackingRecord {
                record_id: String::new(),
                run_id: rid.to_string(),
                status,
                stream: 1,
                start_time: "2025-01-01T12:00:00.000Z".to_string(),
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
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn running_row_of_a_finished_run_is_failed_and_replaced() {
        let (storage, cache, runs) = tracker();
        job_row(&storage, RID, JobStatus::Failed).await;
        let orphan = runs.ensure_client_run(RID, &client("acme")).await.unwrap();
        cache.clear();

        let next = runs
            .ensure_client_run("250101-130000", &client("acme"))
            .await
            .unwrap();
        assert_ne!(next.record_id, orphan.record_id);
        assert_eq!(next.run_id, "250101-130000-acme");
        assert_eq!(next.status, ClientRunStatus::Running);

        let old = storage.get_client_run(&orphan.record_id).await.unwrap();
        assert_eq!(old.status, ClientRunStatus::Failed);
        assert!(old.end_time.is_some());
        assert!(old.system_notes.contains("Superseded by run 250101-130000-acme"));
    }

    #[tokio::test]
    async fn running_row_of_a_live_run_is_shared() {
        let (storage, _, runs) = tracker();
        job_row(&storage, RID, JobStatus::Running).await;
        let first = runs.ensure_client_run(RID, &client("acme")).await.unwrap();
        let second = runs
            .ensure_client_run("250101-130000", &client("acme"))
            .await
            .unwrap();
        assert_eq!(first.record_id, second.record_id);
        assert_eq!(storage.client_runs().await.len(), 1);
    }

    #[tokio::test]
    async fn metric_updates_are_additive_and_order_free() {
        let (_, _, runs) = tracker();
        runs.ensure_client_run(RID, &client("acme")).await.unwrap();
        let compound = "250101-120000-acme";
        runs.add_profiles_scored(compound, "acme", 4, 40).await.unwrap();
        runs.add_posts_scored(compound, "acme", 3, 30).await.unwrap();
        runs.add_profiles_scored(compound, "acme", 1, 10).await.unwrap();
        runs.add_posts_harvested(RID, "acme", 7).await.unwrap();
        let row = runs.get_client_run(RID, "acme").await.unwrap().unwrap();
        assert_eq!(row.metrics.profiles_scored, 5);
        assert_eq!(row.metrics.profile_scoring_tokens, 50);
        assert_eq!(row.metrics.posts_scored, 3);
        assert_eq!(row.metrics.posts_harvested, 7);
    }

    #[tokio::test]
    async fn harvest_cost_accumulates_and_id_is_replaced() {
        let (_, _, runs) = tracker();
        runs.ensure_client_run(RID, &client("acme")).await.unwrap();
        runs.set_harvest_run(RID, "acme", "act_1", 0.25).await.unwrap();
        let row = runs.set_harvest_run(RID, "acme", "act_2", 0.5).await.unwrap();
        assert_eq!(row.harvest_actor_run_id.as_deref(), Some("act_2"));
        assert!((row.metrics.harvest_actor_cost - 0.75).abs() < 1e-9);
    }

    #[tokio::test]
    async fn errors_are_counted_per_stage() {
        let (_, _, runs) = tracker();
        runs.ensure_client_run(RID, &client("acme")).await.unwrap();
        runs.record_error(RID, "acme", Stage::LeadScoring, "bad input")
            .await
            .unwrap();
        let row = runs
            .record_error(RID, "acme", Stage::PostScoring, "model down")
            .await
            .unwrap();
        assert_eq!(row.metrics.errors, 2);
        assert_eq!(row.metrics.post_scoring_errors, 1);
        assert_eq!(
            row.error_details,
            "[lead-scoring] bad input\n[post-scoring] model down"
        );
    }

    #[tokio::test]
    async fn completion_is_once_but_details_still_append() {
        let (_, _, runs) = tracker();
        runs.ensure_client_run(RID, &client("acme")).await.unwrap();
        let done = runs
            .complete_client_run(RID, "acme", ClientRunStatus::Completed, Some("ok"))
            .await
            .unwrap();
        assert!(done.end_time.is_some());

        let again = runs
            .complete_client_run(RID, "acme", ClientRunStatus::Failed, None)
            .await;
        assert!(matches!(again, Err(TrackerError::ClientRunCompleted { .. })));

        let row = runs
            .append_error_details(RID, "acme", "late stage error")
            .await
            .unwrap();
        assert_eq!(row.status, ClientRunStatus::Completed);
        assert_eq!(row.error_details, "late stage error");
    }

    #[tokio::test]
    async fn completed_rows_reject_metric_and_error_writes() {
        let (storage, _, runs) = tracker();
        runs.ensure_client_run(RID, &client("acme")).await.unwrap();
        runs.add_profiles_scored(RID, "acme", 2, 20).await.unwrap();
        runs.complete_client_run(RID, "acme", ClientRunStatus::Completed, None)
            .await
            .unwrap();
        let writes = storage.write_count();

        let report = StageReport {
            job_id: "job_late".to_string(),
            metrics: Some(ClientRunMetrics {
                posts_scored: 9,
                ..ClientRunMetrics::default()
            }),
            harvest_actor_run_id: None,
        };
        let rejected = [
            runs.add_profiles_scored(RID, "acme", 5, 50).await,
            runs.add_posts_harvested(RID, "acme", 3).await,
            runs.set_harvest_run(RID, "acme", "act_late", 1.0).await,
            runs.merge_stage_report(RID, "acme", &report).await,
            runs.record_error(RID, "acme", Stage::PostScoring, "late failure").await,
        ];
        for result in rejected {
            assert!(
                matches!(
                    result,
                    Err(TrackerError::ClientRunCompleted { status: ClientRunStatus::Completed, .. })
                ),
                "{:?}",
                result
            );
        }
        assert_eq!(storage.write_count(), writes);

        let row = runs
            .append_error_details(RID, "acme", "late stage error")
            .await
            .unwrap();
        assert_eq!(row.error_details, "late stage error");
        assert_eq!(row.metrics.profiles_scored, 2);
        assert_eq!(row.metrics.errors, 0);
        assert_eq!(row.metrics.posts_scored, 0);
        assert!(row.harvest_actor_run_id.is_none());
    }

    #[tokio::test]
    async fn unknown_client_is_not_found() {
        let (_, _, runs) = tracker();
        assert!(runs.get_client_run(RID, "ghost").await.unwrap().is_none());
        assert!(matches!(
            runs.add_posts_harvested(RID, "ghost", 1).await,
            Err(TrackerError::ClientRunNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn stale_rows_are_failed_in_bulk() {
        let (storage, cache, runs) = tracker();
        for id in ["a", "b", "c"] {
            runs.ensure_client_run(RID, &client(id)).await.unwrap();
        }
        runs.complete_client_run(RID, "a", ClientRunStatus::Completed, None)
            .await
            .unwrap();
        let closed = runs.close_stale_runs(RID, "lock reclaimed").await.unwrap();
        assert_eq!(closed, 2);
        let rows = storage.client_runs().await;
        assert!(rows.iter().all(|r| r.status != ClientRunStatus::Running));
        assert_eq!(cache.len(), 1);
    }
}
