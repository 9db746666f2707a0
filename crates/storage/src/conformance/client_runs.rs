use std::future::Future;

use super::{make_client_run, TestResult};
use crate::{ClientRunMetrics, ClientRunPatch, ClientRunStatus, OrchestratorStorage};

pub(super) async fn run_client_run_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: OrchestratorStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "client_runs",
            "find_by_compound_run_id",
            find_by_compound_run_id(factory).await,
        ),
        TestResult::from_result(
            "client_runs",
            "running_lookup_ignores_run_id",
            running_lookup_ignores_run_id(factory).await,
        ),
        TestResult::from_result(
            "client_runs",
            "running_lookup_skips_finished_rows",
            running_lookup_skips_finished_rows(factory).await,
        ),
        TestResult::from_result(
            "client_runs",
            "list_matches_base_prefix",
            list_matches_base_prefix(factory).await,
        ),
        TestResult::from_result(
            "client_runs",
            "metrics_patch_is_absolute",
            metrics_patch_is_absolute(factory).await,
        ),
        TestResult::from_result(
            "client_runs",
            "batched_update_more_than_one_batch",
            batched_update_more_than_one_batch(factory).await,
        ),
    ]
}

// ── Test implementations ──────────────────────────────────────────────────────

async fn find_by_compound_run_id<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: OrchestratorStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    s.create_client_run(make_client_run("250101-120000-acme", "acme"))
        .await
        .map_err(|e| e.to_string())?;
    let found = s
        .find_client_run("250101-120000-acme", "acme")
        .await
        .map_err(|e| e.to_string())?;
    if found.is_none() {
        return Err("row not found by (run id, client)".to_string());
    }
    let other = s
        .find_client_run("250101-120000-acme", "globex")
        .await
        .map_err(|e| e.to_string())?;
    if other.is_some() {
        return Err("lookup matched the wrong client".to_string());
    }
    Ok(())
}

/// A `Running` row is found for the client whatever run created it.
async fn running_lookup_ignores_run_id<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: OrchestratorStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    s.create_client_run(make_client_run("241231-235959-acme", "acme"))
        .await
        .map_err(|e| e.to_string())?;
    let found = s
        .find_running_client_run("acme")
        .await
        .map_err(|e| e.to_string())?
        .ok_or("expected the running row")?;
    if found.run_id != "241231-235959-acme" {
        return Err(format!("unexpected run id {}", found.run_id));
    }
    Ok(())
}

async fn running_lookup_skips_finished_rows<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: OrchestratorStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let rec = s
        .create_client_run(make_client_run("250101-120000-acme", "acme"))
        .await
        .map_err(|e| e.to_string())?;
    s.update_client_run(
        &rec.record_id,
        &ClientRunPatch {
            status: Some(ClientRunStatus::Completed),
            end_time: Some("2025-01-01T12:10:00Z".to_string()),
            ..ClientRunPatch::default()
        },
    )
    .await
    .map_err(|e| e.to_string())?;
    let found = s
        .find_running_client_run("acme")
        .await
        .map_err(|e| e.to_string())?;
    if found.is_some() {
        return Err("completed row returned as running".to_string());
    }
    Ok(())
}

async fn list_matches_base_prefix<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: OrchestratorStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    for (run_id, client) in [
        ("250101-120000-acme", "acme"),
        ("250101-120000-globex", "globex"),
        ("250101-130000-acme", "acme"),
    ] {
        s.create_client_run(make_client_run(run_id, client))
            .await
            .map_err(|e| e.to_string())?;
    }
    let rows = s
        .list_client_runs("250101-120000")
        .await
        .map_err(|e| e.to_string())?;
    if rows.len() != 2 {
        return Err(format!("expected 2 rows for the base run, got {}", rows.len()));
    }
    if rows.iter().any(|r| !r.run_id.starts_with("250101-120000-")) {
        return Err("row from another run listed".to_string());
    }
    Ok(())
}

/// Metric patches replace stored values rather than adding to them.
async fn metrics_patch_is_absolute<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: OrchestratorStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let rec = s
        .create_client_run(make_client_run("250101-120000-acme", "acme"))
        .await
        .map_err(|e| e.to_string())?;
    let metrics = ClientRunMetrics {
        profiles_scored: 5,
        ..ClientRunMetrics::default()
    };
    for _ in 0..2 {
        s.update_client_run(
            &rec.record_id,
            &ClientRunPatch {
                metrics: Some(metrics.clone()),
                ..ClientRunPatch::default()
            },
        )
        .await
        .map_err(|e| e.to_string())?;
    }
    let stored = s
        .get_client_run(&rec.record_id)
        .await
        .map_err(|e| e.to_string())?;
    if stored.metrics.profiles_scored != 5 {
        return Err(format!(
            "expected 5 profiles scored, got {}",
            stored.metrics.profiles_scored
        ));
    }
    Ok(())
}

async fn batched_update_more_than_one_batch<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: OrchestratorStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut updates = Vec::new();
    for i in 0..(crate::MAX_BATCH + 3) {
        let client = format!("client{}", i);
        let rec = s
            .create_client_run(make_client_run(
                &format!("250101-120000-{}", client),
                &client,
            ))
            .await
            .map_err(|e| e.to_string())?;
        updates.push((
            rec.record_id,
            ClientRunPatch {
                status: Some(ClientRunStatus::Failed),
                ..ClientRunPatch::default()
            },
        ));
    }
    let updated = s
        .update_client_runs(&updates)
        .await
        .map_err(|e| e.to_string())?;
    if updated.len() != updates.len() {
        return Err(format!(
            "expected {} updated rows, got {}",
            updates.len(),
            updated.len()
        ));
    }
    let rows = s
        .list_client_runs("250101-120000")
        .await
        .map_err(|e| e.to_string())?;
    if rows.iter().any(|r| r.status != ClientRunStatus::Failed) {
        return Err("a row kept its old status".to_string());
    }
    Ok(())
}
