//! Production issue recording with per-run dedup.

use std::sync::Arc;

use leadrun_core::run_id;
use leadrun_storage::{
    IssuePatch, IssueStatus, OrchestratorStorage, ProductionIssueRecord, Severity,
    StackTraceRecord,
};
use tokio::sync::Mutex;

use crate::clock::Clock;
use crate::error::IssueError;
use crate::stage::{FailureKind, StageFailure};

/// Longest error message stored on the issue row itself.
pub const MAX_MESSAGE_BYTES: usize = 1024;
/// Longest pattern derived from a message's first line.
pub const MAX_PATTERN_CHARS: usize = 120;

/// A caught error, ready to be recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueReport {
    pub severity: Severity,
    pub message: String,
    pub stack: Option<String>,
    /// Compound run id where a client is involved.
    pub run_id: String,
    pub client_id: Option<String>,
    pub stream: Option<u8>,
    pub run_type: String,
}

impl IssueReport {
    pub fn new(run_type: impl Into<String>, run_id: impl Into<String>, message: impl Into<String>) -> Self {
        IssueReport {
            severity: Severity::Error,
            message: message.into(),
            stack: None,
            run_id: run_id.into(),
            client_id: None,
            stream: None,
            run_type: run_type.into(),
        }
    }

    /// Report for a failed stage call.
    pub fn from_stage_failure(failure: &StageFailure, run_id: &str, client_id: &str, stream: u8) -> Self {
        let severity = match failure.kind {
            FailureKind::Unauthorized => Severity::Critical,
            _ => Severity::Error,
        };
        IssueReport {
            severity,
            message: failure.to_string(),
            stack: failure.stack.clone(),
            run_id: run_id.to_string(),
            client_id: Some(client_id.to_string()),
            stream: Some(stream),
            run_type: failure.stage.as_str().to_string(),
        }
    }

    pub fn with_client(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn with_stream(mut self, stream: u8) -> Self {
        self.stream = Some(stream);
        self
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }
}

/// True when `code` appears as a whole token, so ids and counts that merely
/// contain the digits do not match.
fn has_code(lower: &str, code: &str) -> bool {
    lower
        .split(|c: char| !c.is_ascii_alphanumeric())
        .any(|token| token == code)
}

/// Classification tag for a message, or its first line.
pub fn classify(message: &str) -> String {
    let lower = message.to_ascii_lowercase();
    let tag = if has_code(&lower, "429") || lower.contains("rate limit") || lower.contains("too many requests") {
        Some("rate-limit")
    } else if lower.contains("timeout") || lower.contains("timed out") {
        Some("timeout")
    } else if has_code(&lower, "401")
        || has_code(&lower, "403")
        || lower.contains("unauthori")
        || lower.contains("forbidden")
    {
        Some("auth")
    } else if has_code(&lower, "404") || lower.contains("not found") {
        Some("not-found")
    } else if lower.contains("connection") || lower.contains("econnre") || lower.contains("dns") {
        Some("connection")
    } else {
        None
    };
    match tag {
        Some(tag) => tag.to_string(),
        None => message
            .lines()
            .next()
            .unwrap_or("")
            .trim()
            .chars()
            .take(MAX_PATTERN_CHARS)
            .collect(),
    }
}

/// Cut `s` to at most `max` bytes without splitting a character.
pub fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

pub struct IssueRecorder {
    storage: Arc<dyn OrchestratorStorage>,
    clock: Arc<dyn Clock>,
    /// Keeps find-then-increment atomic within the process.
    write_lock: Mutex<()>,
}

impl IssueRecorder {
    pub fn new(storage: Arc<dyn OrchestratorStorage>, clock: Arc<dyn Clock>) -> Self {
        IssueRecorder {
            storage,
            clock,
            write_lock: Mutex::new(()),
        }
    }

    /// Record an issue, or bump the occurrence count of the open issue with
    /// the same pattern in the same run.
    pub async fn record(&self, report: IssueReport) -> Result<ProductionIssueRecord, IssueError> {
        let pattern = classify(&report.message);
        let base = run_id::strip_client(&report.run_id).to_string();
        let _guard = self.write_lock.lock().await;

        if let Some(open) = self.storage.find_open_issue(&pattern, &base).await? {
            let patch = IssuePatch {
                occurrences: Some(open.occurrences.saturating_add(1)),
                ..IssuePatch::default()
            };
            let updated = self.storage.update_issue(&open.record_id, &patch).await?;
            tracing::debug!(
                issue = %updated.record_id,
                %pattern,
                occurrences = updated.occurrences,
                "production issue repeated"
            );
            return Ok(updated);
        }

        let timestamp = self.clock.timestamp();
        let message = truncate(&report.message, MAX_MESSAGE_BYTES).to_string();
        let stack_trace_id = match report.stack {
            Some(stack) if !stack.is_empty() => Some(
                self.storage
                    .create_stack_trace(StackTraceRecord {
                        record_id: String::new(),
                        timestamp: timestamp.clone(),
                        run_id: report.run_id.clone(),
                        client_id: report.client_id.clone(),
                        error_message: message.clone(),
                        stack_trace: stack,
                    })
                    .await?,
            ),
            _ => None,
        };

        let created = self
            .storage
            .create_issue(ProductionIssueRecord {
                record_id: String::new(),
                timestamp,
                severity: report.severity,
                pattern: pattern.clone(),
                error_message: message,
                stack_trace_id,
                run_id: report.run_id,
                client_id: report.client_id,
                stream: report.stream,
                run_type: report.run_type,
                status: IssueStatus::Open,
                commit_hash: None,
                fix_notes: None,
                occurrences: 1,
            })
            .await?;
        tracing::info!(
            issue = %created.record_id,
            %pattern,
            run_id = %created.run_id,
            severity = created.severity.as_str(),
            "production issue recorded"
        );
        Ok(created)
    }

    /// Record a failure raised while serving an HTTP route.
    pub async fn record_route_error(
        &self,
        path: &str,
        run_id: Option<&str>,
        message: &str,
    ) -> Result<ProductionIssueRecord, IssueError> {
        self.record(IssueReport::new(
            format!("route:{}", path),
            run_id.unwrap_or_default(),
            message,
        ))
        .await
    }

    /// OPEN → FIXED, recording the resolving commit.
    pub async fn mark_fixed(
        &self,
        record_id: &str,
        commit_hash: &str,
        notes: Option<&str>,
    ) -> Result<ProductionIssueRecord, IssueError> {
        let _guard = self.write_lock.lock().await;
        let issue = self
            .storage
            .list_issues(None)
            .await?
            .into_iter()
            .find(|i| i.record_id == record_id)
            .ok_or_else(|| IssueError::NotFound {
                record_id: record_id.to_string(),
            })?;
        if issue.status == IssueStatus::Fixed {
            return Err(IssueError::AlreadyFixed {
                record_id: issue.record_id,
                commit_hash: issue.commit_hash,
            });
        }
        let patch = IssuePatch {
            status: Some(IssueStatus::Fixed),
            commit_hash: Some(commit_hash.to_string()),
            fix_notes: notes.map(str::to_string),
            occurrences: None,
        };
        let fixed = self.storage.update_issue(record_id, &patch).await?;
        tracing::info!(issue = %record_id, commit = %commit_hash, "production issue fixed");
        Ok(fixed)
    }

    pub async fn list(
        &self,
        status: Option<IssueStatus>,
    ) -> Result<Vec<ProductionIssueRecord>, IssueError> {
        Ok(self.storage.list_issues(status).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::stage::Stage;
    use leadrun_storage::InMemoryStorage;
    use time::macros::datetime;

    fn recorder() -> (Arc<InMemoryStorage>, IssueRecorder) {
        let storage = Arc::new(InMemoryStorage::new());
        let clock = Arc::new(ManualClock::new(datetime!(2025-01-01 12:00:00 UTC)));
        (storage.clone(), IssueRecorder::new(storage, clock))
    }

    #[test]
    fn classification_tags() {
        assert_eq!(classify("HTTP 429 Too Many Requests"), "rate-limit");
        assert_eq!(classify("request timed out after 30s"), "timeout");
        assert_eq!(classify("HTTP 401 from stage"), "auth");
        assert_eq!(classify("record not found"), "not-found");
        assert_eq!(classify("Connection refused (os error 111)"), "connection");
        assert_eq!(classify("Scoring model returned garbage\nat line 3"), "Scoring model returned garbage");
    }

    #[test]
    fn status_codes_must_stand_alone() {
        assert_eq!(classify("scored 4040 leads for recA4291"), "scored 4040 leads for recA4291");
        assert_eq!(classify("job 14031 stalled"), "job 14031 stalled");
        assert_eq!(classify("POST /run-batch-score-v2: http status: 404"), "not-found");
        assert_eq!(classify("upstream said 403."), "auth");
        assert_eq!(classify("status=429"), "rate-limit");
    }

    #[test]
    fn long_first_lines_are_capped() {
        let message = "x".repeat(500);
        assert_eq!(classify(&message).chars().count(), MAX_PATTERN_CHARS);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let s = "é".repeat(600); // 1200 bytes
        let t = truncate(&s, MAX_MESSAGE_BYTES);
        assert!(t.len() <= MAX_MESSAGE_BYTES);
        assert_eq!(t.len(), 1024);
        let odd = format!("a{}", s);
        assert_eq!(truncate(&odd, MAX_MESSAGE_BYTES).len(), 1023);
        assert_eq!(truncate("short", MAX_MESSAGE_BYTES), "short");
    }

    #[tokio::test]
    async fn repeats_in_the_same_run_increment_occurrences() {
        let (_, issues) = recorder();
        let first = issues
            .record(IssueReport::new("lead-scoring", "250101-120000-acme", "boom"))
            .await
            .unwrap();
        let second = issues
            .record(IssueReport::new("lead-scoring", "250101-120000-globex", "boom"))
            .await
            .unwrap();
        assert_eq!(first.record_id, second.record_id);
        assert_eq!(second.occurrences, 2);

        let other_run = issues
            .record(IssueReport::new("lead-scoring", "250101-130000-acme", "boom"))
            .await
            .unwrap();
        assert_ne!(other_run.record_id, first.record_id);
        assert_eq!(issues.list(None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn stack_goes_to_its_own_row_and_message_is_truncated() {
        let (storage, issues) = recorder();
        let failure = StageFailure::new(Stage::PostScoring, FailureKind::Rejected, "y".repeat(3000))
            .with_stack("frame 1\nframe 2");
        let issue = issues
            .record(IssueReport::from_stage_failure(&failure, "250101-120000-acme", "acme", 2))
            .await
            .unwrap();
        assert!(issue.error_message.len() <= MAX_MESSAGE_BYTES);
        assert_eq!(issue.client_id.as_deref(), Some("acme"));
        assert_eq!(issue.stream, Some(2));
        assert_eq!(issue.run_type, "post-scoring");
        let traces = storage.stack_traces().await;
        assert_eq!(traces.len(), 1);
        assert_eq!(issue.stack_trace_id.as_deref(), Some(traces[0].record_id.as_str()));
        assert_eq!(traces[0].stack_trace, "frame 1\nframe 2");
    }

    #[tokio::test]
    async fn mark_fixed_once() {
        let (_, issues) = recorder();
        let issue = issues
            .record(IssueReport::new("lead-scoring", "250101-120000", "boom"))
            .await
            .unwrap();
        let fixed = issues
            .mark_fixed(&issue.record_id, "abc123", Some("guard added"))
            .await
            .unwrap();
        assert_eq!(fixed.status, IssueStatus::Fixed);
        assert_eq!(fixed.fix_notes.as_deref(), Some("guard added"));

        let again = issues.mark_fixed(&issue.record_id, "def456", None).await;
        assert!(matches!(again, Err(IssueError::AlreadyFixed { .. })));
        let missing = issues.mark_fixed("recNOPE", "abc", None).await;
        assert!(matches!(missing, Err(IssueError::NotFound { .. })));

        // A fixed issue no longer absorbs repeats.
        let fresh = issues
            .record(IssueReport::new("lead-scoring", "250101-120000", "boom"))
            .await
            .unwrap();
        assert_ne!(fresh.record_id, issue.record_id);
        assert_eq!(issues.list(Some(IssueStatus::Open)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn route_errors_carry_the_path() {
        let (_, issues) = recorder();
        let issue = issues
            .record_route_error("/smart-resume-client-by-client", None, "storage unavailable")
            .await
            .unwrap();
        assert_eq!(issue.run_type, "route:/smart-resume-client-by-client");
        assert_eq!(issue.run_id, "");
    }
}
