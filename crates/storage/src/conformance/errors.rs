use std::future::Future;

use super::{make_client_run, make_job_run, TestResult};
use crate::{ClientRunPatch, JobRunPatch, JobStatus, OrchestratorStorage, StorageError};

pub(super) async fn run_error_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: OrchestratorStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "errors",
            "duplicate_job_run_is_already_exists",
            duplicate_job_run_is_already_exists(factory).await,
        ),
        TestResult::from_result(
            "errors",
            "update_unknown_job_run_is_not_found",
            update_unknown_job_run_is_not_found(factory).await,
        ),
        TestResult::from_result(
            "errors",
            "get_unknown_client_run_is_not_found",
            get_unknown_client_run_is_not_found(factory).await,
        ),
        TestResult::from_result(
            "errors",
            "update_unknown_client_run_is_not_found",
            update_unknown_client_run_is_not_found(factory).await,
        ),
    ]
}

// ── Test implementations ──────────────────────────────────────────────────────

/// Two aggregate rows may never share a run id.
async fn duplicate_job_run_is_already_exists<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: OrchestratorStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    s.create_job_run(make_job_run("250101-120000", 1))
        .await
        .map_err(|e| e.to_string())?;
    match s.create_job_run(make_job_run("250101-120000", 2)).await {
        Err(StorageError::AlreadyExists { .. }) => Ok(()),
        Err(other) => Err(format!("expected AlreadyExists, got {}", other)),
        Ok(_) => Err("duplicate run id accepted".to_string()),
    }
}

async fn update_unknown_job_run_is_not_found<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: OrchestratorStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let patch = JobRunPatch {
        status: Some(JobStatus::Failed),
        ..JobRunPatch::default()
    };
    match s.update_job_run("recMISSING", &patch).await {
        Err(StorageError::NotFound { .. }) => Ok(()),
        Err(other) => Err(format!("expected NotFound, got {}", other)),
        Ok(_) => Err("update of a missing row succeeded".to_string()),
    }
}

async fn get_unknown_client_run_is_not_found<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: OrchestratorStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    s.create_client_run(make_client_run("250101-120000-acme", "acme"))
        .await
        .map_err(|e| e.to_string())?;
    match s.get_client_run("recMISSING").await {
        Err(StorageError::NotFound { .. }) => Ok(()),
        Err(other) => Err(format!("expected NotFound, got {}", other)),
        Ok(_) => Err("read of a missing row succeeded".to_string()),
    }
}

async fn update_unknown_client_run_is_not_found<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: OrchestratorStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    match s
        .update_client_run("recMISSING", &ClientRunPatch::default())
        .await
    {
        Err(StorageError::NotFound { .. }) => Ok(()),
        Err(other) => Err(format!("expected NotFound, got {}", other)),
        Ok(_) => Err("update of a missing row succeeded".to_string()),
    }
}
