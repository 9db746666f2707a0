use std::future::Future;

use super::{make_issue, TestResult};
use crate::{IssuePatch, IssueStatus, OrchestratorStorage, StackTraceRecord};

pub(super) async fn run_issue_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: OrchestratorStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "issues",
            "open_issue_found_by_pattern_and_base_run",
            open_issue_found_by_pattern_and_base_run(factory).await,
        ),
        TestResult::from_result(
            "issues",
            "fixed_issue_not_returned_as_open",
            fixed_issue_not_returned_as_open(factory).await,
        ),
        TestResult::from_result(
            "issues",
            "list_filters_by_status",
            list_filters_by_status(factory).await,
        ),
        TestResult::from_result(
            "issues",
            "stack_trace_returns_record_id",
            stack_trace_returns_record_id(factory).await,
        ),
    ]
}

// ── Test implementations ──────────────────────────────────────────────────────

/// An issue recorded against a client run id matches its base run id.
async fn open_issue_found_by_pattern_and_base_run<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: OrchestratorStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    s.create_issue(make_issue("250101-120000-acme", "Timeout"))
        .await
        .map_err(|e| e.to_string())?;
    let found = s
        .find_open_issue("Timeout", "250101-120000")
        .await
        .map_err(|e| e.to_string())?;
    if found.is_none() {
        return Err("open issue not found by base run id".to_string());
    }
    let other = s
        .find_open_issue("Timeout", "250101-130000")
        .await
        .map_err(|e| e.to_string())?;
    if other.is_some() {
        return Err("issue matched another run".to_string());
    }
    let other_pattern = s
        .find_open_issue("Rate limit", "250101-120000")
        .await
        .map_err(|e| e.to_string())?;
    if other_pattern.is_some() {
        return Err("issue matched another pattern".to_string());
    }
    Ok(())
}

async fn fixed_issue_not_returned_as_open<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: OrchestratorStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let issue = s
        .create_issue(make_issue("250101-120000", "Timeout"))
        .await
        .map_err(|e| e.to_string())?;
    let fixed = s
        .update_issue(
            &issue.record_id,
            &IssuePatch {
                status: Some(IssueStatus::Fixed),
                commit_hash: Some("abc123".to_string()),
                fix_notes: Some("raised timeout".to_string()),
                occurrences: None,
            },
        )
        .await
        .map_err(|e| e.to_string())?;
    if fixed.status != IssueStatus::Fixed || fixed.commit_hash.as_deref() != Some("abc123") {
        return Err("fix not recorded".to_string());
    }
    let found = s
        .find_open_issue("Timeout", "250101-120000")
        .await
        .map_err(|e| e.to_string())?;
    if found.is_some() {
        return Err("fixed issue returned as open".to_string());
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
        .create_issue(make_issue("250101-120000", "Timeout"))
        .await
        .map_err(|e| e.to_string())?;
    s.create_issue(make_issue("250101-120000", "Rate limit"))
        .await
        .map_err(|e| e.to_string())?;
    s.update_issue(
        &a.record_id,
        &IssuePatch {
            status: Some(IssueStatus::Fixed),
            ..IssuePatch::default()
        },
    )
    .await
    .map_err(|e| e.to_string())?;

    let all = s.list_issues(None).await.map_err(|e| e.to_string())?;
    let open = s
        .list_issues(Some(IssueStatus::Open))
        .await
        .map_err(|e| e.to_string())?;
    if all.len() != 2 || open.len() != 1 || open[0].pattern != "Rate limit" {
        return Err(format!(
            "expected 2 issues with 1 open, got {} with {} open",
            all.len(),
            open.len()
        ));
    }
    Ok(())
}

async fn stack_trace_returns_record_id<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: OrchestratorStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let id = s
        .create_stack_trace(StackTraceRecord {
            record_id: String::new(),
            timestamp: "2025-01-01T12:00:02Z".to_string(),
            run_id: "250101-120000-acme".to_string(),
            client_id: Some("acme".to_string()),
            error_message: "boom".to_string(),
            stack_trace: "at stage::invoke\nat driver::run".to_string(),
        })
        .await
        .map_err(|e| e.to_string())?;
    if id.is_empty() {
        return Err("expected a stack trace record id".to_string());
    }
    Ok(())
}
