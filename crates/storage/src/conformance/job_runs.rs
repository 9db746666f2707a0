use std::future::Future;

use super::{make_job_run, TestResult};
use crate::{JobRunPatch, JobStatus, OrchestratorStorage};

pub(super) async fn run_job_run_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: OrchestratorStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "job_runs",
            "create_assigns_record_id",
            create_assigns_record_id(factory).await,
        ),
        TestResult::from_result(
            "job_runs",
            "find_by_run_id_after_create",
            find_by_run_id_after_create(factory).await,
        ),
        TestResult::from_result(
            "job_runs",
            "find_unknown_run_id_is_none",
            find_unknown_run_id_is_none(factory).await,
        ),
        TestResult::from_result(
            "job_runs",
            "patch_sets_only_given_fields",
            patch_sets_only_given_fields(factory).await,
        ),
        TestResult::from_result(
            "job_runs",
            "list_filters_by_status",
            list_filters_by_status(factory).await,
        ),
    ]
}

// ── Test implementations ──────────────────────────────────────────────────────

/// A created row comes back with a non-empty backing record id.
async fn create_assigns_record_id<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: OrchestratorStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let rec = s
        .create_job_run(make_job_run("250101-120000", 1))
        .await
        .map_err(|e| e.to_string())?;
    if rec.record_id.is_empty() {
        return Err("expected a record id".to_string());
    }
    if rec.status != JobStatus::Running {
        return Err(format!("expected Running, got {}", rec.status));
    }
    Ok(())
}

async fn find_by_run_id_after_create<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: OrchestratorStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let created = s
        .create_job_run(make_job_run("250101-120000", 2))
        .await
        .map_err(|e| e.to_string())?;
    let found = s
        .find_job_run("250101-120000")
        .await
        .map_err(|e| e.to_string())?
        .ok_or("row not found after create")?;
    if found.record_id != created.record_id || found.stream != 2 {
        return Err(format!(
            "expected {} on stream 2, got {} on stream {}",
            created.record_id, found.record_id, found.stream
        ));
    }
    Ok(())
}

async fn find_unknown_run_id_is_none<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: OrchestratorStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let found = s
        .find_job_run("250101-120000")
        .await
        .map_err(|e| e.to_string())?;
    if found.is_some() {
        return Err("expected no row in an empty store".to_string());
    }
    Ok(())
}

/// Fields absent from the patch keep their stored values.
async fn patch_sets_only_given_fields<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: OrchestratorStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut rec = make_job_run("250101-120000", 1);
    rec.system_notes = "started".to_string();
    let created = s.create_job_run(rec).await.map_err(|e| e.to_string())?;

    let patch = JobRunPatch {
        clients_processed: Some(3),
        profiles_scored: Some(42),
        ..JobRunPatch::default()
    };
    let updated = s
        .update_job_run(&created.record_id, &patch)
        .await
        .map_err(|e| e.to_string())?;
    if updated.clients_processed != 3 || updated.profiles_scored != 42 {
        return Err(format!(
            "patch not applied: processed={} scored={}",
            updated.clients_processed, updated.profiles_scored
        ));
    }
    if updated.system_notes != "started" || updated.status != JobStatus::Running {
        return Err("untouched fields changed".to_string());
    }
    Ok(())
}

async fn list_filters_by_status<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: OrchestratorStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let a = s
        .create_job_run(make_job_run("250101-120000", 1))
        .await
        .map_err(|e| e.to_string())?;
    s.create_job_run(make_job_run("250101-130000", 2))
        .await
        .map_err(|e| e.to_string())?;
    s.update_job_run(
        &a.record_id,
        &JobRunPatch {
            status: Some(JobStatus::Completed),
            end_time: Some("2025-01-01T12:30:00Z".to_string()),
            ..JobRunPatch::default()
        },
    )
    .await
    .map_err(|e| e.to_string())?;

    let running = s
        .list_job_runs(JobStatus::Running)
        .await
        .map_err(|e| e.to_string())?;
    if running.len() != 1 || running[0].run_id != "250101-130000" {
        return Err(format!("expected one running row, got {}", running.len()));
    }
    let completed = s
        .list_job_runs(JobStatus::Completed)
        .await
        .map_err(|e| e.to_string())?;
    if completed.len() != 1 || completed[0].end_time.is_none() {
        return Err("expected one completed row with an end time".to_string());
    }
    Ok(())
}
