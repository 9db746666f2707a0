//! Typed partial updates.
//!
//! A patch names the fields to overwrite with absolute values. Trackers
//! compute those values (for example summing metric deltas) while holding
//! their own write lock; backends only apply them. Each patch encodes to a
//! catalogued [`FieldMap`] for row-oriented backends, and applies directly
//! to a record for in-process ones.

use crate::fields::{put, ClientRunField, FieldMap, IssueField, JobTrackingField};
use crate::record::{
    ClientRunMetrics, ClientRunRecord, ClientRunStatus, IssueStatus, JobStatus,
    JobTrackingRecord, ProductionIssueRecord,
};

/// Partial update of a `Job Tracking` row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobRunPatch {
    pub status: Option<JobStatus>,
    pub end_time: Option<String>,
    pub clients_processed: Option<u32>,
    pub clients_succeeded: Option<u32>,
    pub clients_failed: Option<u32>,
    pub profiles_scored: Option<u64>,
    pub posts_harvested: Option<u64>,
    pub posts_scored: Option<u64>,
    pub tokens_used: Option<u64>,
    pub system_notes: Option<String>,
    pub error_summary: Option<String>,
}

impl JobRunPatch {
    pub fn is_empty(&self) -> bool {
        *self == JobRunPatch::default()
    }

    pub fn to_fields(&self) -> FieldMap {
        let mut map = FieldMap::new();
        if let Some(status) = self.status {
            put(&mut map, JobTrackingField::Status, status.as_str());
        }
        if let Some(ref end) = self.end_time {
            put(&mut map, JobTrackingField::EndTime, end.as_str());
        }
        if let Some(n) = self.clients_processed {
            put(&mut map, JobTrackingField::ClientsProcessed, n);
        }
        if let Some(n) = self.clients_succeeded {
            put(&mut map, JobTrackingField::ClientsSucceeded, n);
        }
        if let Some(n) = self.clients_failed {
            put(&mut map, JobTrackingField::ClientsFailed, n);
        }
        if let Some(n) = self.profiles_scored {
            put(&mut map, JobTrackingField::ProfilesScored, n);
        }
        if let Some(n) = self.posts_harvested {
            put(&mut map, JobTrackingField::PostsHarvested, n);
        }
        if let Some(n) = self.posts_scored {
            put(&mut map, JobTrackingField::PostsScored, n);
        }
        if let Some(n) = self.tokens_used {
            put(&mut map, JobTrackingField::TokensUsed, n);
        }
        if let Some(ref notes) = self.system_notes {
            put(&mut map, JobTrackingField::SystemNotes, notes.as_str());
        }
        if let Some(ref summary) = self.error_summary {
            put(&mut map, JobTrackingField::ErrorSummary, summary.as_str());
        }
        map
    }

    pub fn apply(&self, record: &mut JobTrackingRecord) {
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(ref end) = self.end_time {
            record.end_time = Some(end.clone());
        }
        if let Some(n) = self.clients_processed {
            record.clients_processed = n;
        }
        if let Some(n) = self.clients_succeeded {
            record.clients_succeeded = n;
        }
        if let Some(n) = self.clients_failed {
            record.clients_failed = n;
        }
        if let Some(n) = self.profiles_scored {
            record.profiles_scored = n;
        }
        if let Some(n) = self.posts_harvested {
            record.posts_harvested = n;
        }
        if let Some(n) = self.posts_scored {
            record.posts_scored = n;
        }
        if let Some(n) = self.tokens_used {
            record.tokens_used = n;
        }
        if let Some(ref notes) = self.system_notes {
            record.system_notes = notes.clone();
        }
        if let Some(ref summary) = self.error_summary {
            record.error_summary = summary.clone();
        }
    }
}

/// Partial update of a `Client Run Results` row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientRunPatch {
    pub status: Option<ClientRunStatus>,
    pub end_time: Option<String>,
    /// Absolute metric totals.
    pub metrics: Option<ClientRunMetrics>,
    pub harvest_actor_run_id: Option<String>,
    pub system_notes: Option<String>,
    pub error_details: Option<String>,
}

impl ClientRunPatch {
    pub fn is_empty(&self) -> bool {
        *self == ClientRunPatch::default()
    }

    pub fn to_fields(&self) -> FieldMap {
        let mut map = FieldMap::new();
        if let Some(status) = self.status {
            put(&mut map, ClientRunField::Status, status.as_str());
        }
        if let Some(ref end) = self.end_time {
            put(&mut map, ClientRunField::EndTime, end.as_str());
        }
        if let Some(ref m) = self.metrics {
            put(&mut map, ClientRunField::ProfilesExamined, m.profiles_examined);
            put(&mut map, ClientRunField::ProfilesScored, m.profiles_scored);
            put(&mut map, ClientRunField::ProfileScoringTokens, m.profile_scoring_tokens);
            put(&mut map, ClientRunField::PostsHarvested, m.posts_harvested);
            put(&mut map, ClientRunField::HarvestActorCost, m.harvest_actor_cost);
            put(&mut map, ClientRunField::PostsExamined, m.posts_examined);
            put(&mut map, ClientRunField::PostsScored, m.posts_scored);
            put(&mut map, ClientRunField::PostScoringTokens, m.post_scoring_tokens);
            put(&mut map, ClientRunField::Errors, m.errors);
            put(&mut map, ClientRunField::PostScoringErrors, m.post_scoring_errors);
        }
        if let Some(ref id) = self.harvest_actor_run_id {
            put(&mut map, ClientRunField::HarvestActorRunId, id.as_str());
        }
        if let Some(ref notes) = self.system_notes {
            put(&mut map, ClientRunField::SystemNotes, notes.as_str());
        }
        if let Some(ref details) = self.error_details {
            put(&mut map, ClientRunField::ErrorDetails, details.as_str());
        }
        map
    }

    pub fn apply(&self, record: &mut ClientRunRecord) {
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(ref end) = self.end_time {
            record.end_time = Some(end.clone());
        }
        if let Some(ref m) = self.metrics {
            record.metrics = m.clone();
        }
        if let Some(ref id) = self.harvest_actor_run_id {
            record.harvest_actor_run_id = Some(id.clone());
        }
        if let Some(ref notes) = self.system_notes {
            record.system_notes = notes.clone();
        }
        if let Some(ref details) = self.error_details {
            record.error_details = details.clone();
        }
    }
}

/// Partial update of a `Production Issues` row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IssuePatch {
    pub status: Option<IssueStatus>,
    pub commit_hash: Option<String>,
    pub fix_notes: Option<String>,
    pub occurrences: Option<u32>,
}

impl IssuePatch {
    pub fn to_fields(&self) -> FieldMap {
        let mut map = FieldMap::new();
        if let Some(status) = self.status {
            put(&mut map, IssueField::Status, status.as_str());
        }
        if let Some(ref hash) = self.commit_hash {
            put(&mut map, IssueField::CommitHash, hash.as_str());
        }
        if let Some(ref notes) = self.fix_notes {
            put(&mut map, IssueField::FixNotes, notes.as_str());
        }
        if let Some(n) = self.occurrences {
            put(&mut map, IssueField::Occurrences, n);
        }
        map
    }

    pub fn apply(&self, record: &mut ProductionIssueRecord) {
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(ref hash) = self.commit_hash {
            record.commit_hash = Some(hash.clone());
        }
        if let Some(ref notes) = self.fix_notes {
            record.fix_notes = Some(notes.clone());
        }
        if let Some(n) = self.occurrences {
            record.occurrences = n;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::{validate_write, Table};

    #[test]
    fn job_patch_encodes_only_set_fields() {
        let patch = JobRunPatch {
            status: Some(JobStatus::Completed),
            clients_processed: Some(3),
            ..Default::default()
        };
        let fields = patch.to_fields();
        assert_eq!(fields.len(), 2);
        assert_eq!(fields["Status"], "Completed");
        assert_eq!(fields["Clients Processed"], 3);
    }

    #[test]
    fn encoded_patches_pass_catalogue_validation() {
        let patch = ClientRunPatch {
            status: Some(ClientRunStatus::Failed),
            end_time: Some("2025-01-01T00:00:00Z".into()),
            metrics: Some(ClientRunMetrics::default()),
            harvest_actor_run_id: Some("actor-1".into()),
            system_notes: Some("n".into()),
            error_details: Some("d".into()),
        };
        let fields = patch.to_fields();
        let n = fields.len();
        assert_eq!(validate_write(Table::ClientRunResults, fields).unwrap().len(), n);

        let job = JobRunPatch {
            status: Some(JobStatus::Failed),
            end_time: Some("t".into()),
            clients_processed: Some(1),
            clients_succeeded: Some(0),
            clients_failed: Some(1),
            profiles_scored: Some(0),
            posts_harvested: Some(0),
            posts_scored: Some(0),
            tokens_used: Some(0),
            system_notes: Some(String::new()),
            error_summary: Some(String::new()),
        };
        assert!(validate_write(Table::JobTracking, job.to_fields()).is_ok());
        assert!(validate_write(
            Table::ProductionIssues,
            IssuePatch {
                status: Some(IssueStatus::Fixed),
                commit_hash: Some("abc123".into()),
                fix_notes: Some("n".into()),
                occurrences: Some(2),
            }
            .to_fields()
        )
        .is_ok());
    }

    #[test]
    fn client_patch_applies_absolute_metrics() {
        let mut record = ClientRunRecord {
            record_id: "rec1".into(),
            run_id: "250101-120000-acme".into(),
            client_id: "acme".into(),
            client_name: "Acme".into(),
            status: ClientRunStatus::Running,
            start_time: "2025-01-01T12:00:00Z".into(),
            end_time: None,
            metrics: ClientRunMetrics {
                profiles_scored: 2,
                ..Default::default()
            },
            harvest_actor_run_id: None,
            system_notes: String::new(),
            error_details: String::new(),
        };
        ClientRunPatch {
            metrics: Some(ClientRunMetrics {
                profiles_scored: 9,
                ..Default::default()
            }),
            ..Default::default()
        }
        .apply(&mut record);
        assert_eq!(record.metrics.profiles_scored, 9);
        assert_eq!(record.status, ClientRunStatus::Running);
    }
}
