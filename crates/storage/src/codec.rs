//! Conversion between domain records and catalogued row field maps.

use serde_json::Value;

use crate::error::StorageError;
use crate::fields::{
    put, CatalogueField, ClientField, ClientRunField, FieldMap, IssueField, JobTrackingField,
    StackTraceField, Table,
};
use crate::record::{
    ClientRecord, ClientRunMetrics, ClientRunRecord, ClientRunStatus, ClientStatus, IssueStatus,
    JobStatus, JobTrackingRecord, ProductionIssueRecord, Severity, StackTraceRecord,
};

/// A record type stored as one row of a catalogued table.
pub trait RowCodec: Sized {
    const TABLE: Table;

    /// Encode every writable field. Formula fields are never produced.
    fn encode(&self) -> FieldMap;

    fn decode(record_id: &str, fields: &FieldMap) -> Result<Self, StorageError>;
}

/// Typed reader over a row's fields.
struct Row<'a> {
    table: Table,
    fields: &'a FieldMap,
}

impl<'a> Row<'a> {
    fn new(table: Table, fields: &'a FieldMap) -> Self {
        Row { table, fields }
    }

    fn get<F: CatalogueField>(&self, field: F) -> Option<&'a Value> {
        self.fields.get(field.name()).filter(|v| !v.is_null())
    }

    fn opt_str<F: CatalogueField>(&self, field: F) -> Option<String> {
        match self.get(field)? {
            Value::String(s) if s.is_empty() => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    fn string<F: CatalogueField>(&self, field: F) -> String {
        self.opt_str(field).unwrap_or_default()
    }

    fn required<F: CatalogueField>(&self, field: F) -> Result<String, StorageError> {
        self.opt_str(field).ok_or_else(|| StorageError::Decode {
            table: self.table,
            message: format!("missing required field '{}'", field.name()),
        })
    }

    fn u64<F: CatalogueField>(&self, field: F) -> u64 {
        match self.get(field) {
            Some(Value::Number(n)) => n
                .as_u64()
                .or_else(|| n.as_f64().map(|f| f.max(0.0) as u64))
                .unwrap_or(0),
            Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
            _ => 0,
        }
    }

    fn u32<F: CatalogueField>(&self, field: F) -> u32 {
        u32::try_from(self.u64(field)).unwrap_or(u32::MAX)
    }

    fn f64<F: CatalogueField>(&self, field: F) -> f64 {
        match self.get(field) {
            Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
            Some(Value::String(s)) => s.trim().parse().unwrap_or(0.0),
            _ => 0.0,
        }
    }

    fn opt_u8<F: CatalogueField>(&self, field: F) -> Option<u8> {
        self.get(field)?;
        u8::try_from(self.u64(field)).ok().filter(|n| *n > 0)
    }

    fn parsed<F: CatalogueField, T>(
        &self,
        field: F,
        parse: impl Fn(&str) -> Option<T>,
    ) -> Result<T, StorageError> {
        let raw = self.required(field)?;
        parse(&raw).ok_or_else(|| StorageError::Decode {
            table: self.table,
            message: format!("unrecognised value '{}' for field '{}'", raw, field.name()),
        })
    }
}

impl RowCodec for ClientRecord {
    const TABLE: Table = Table::Clients;

    fn encode(&self) -> FieldMap {
        let mut map = FieldMap::new();
        put(&mut map, ClientField::ClientId, self.client_id.as_str());
        put(&mut map, ClientField::ClientName, self.client_name.as_str());
        put(&mut map, ClientField::Status, self.status.as_str());
        put(&mut map, ClientField::ServiceLevel, self.service_level);
        if let Some(stream) = self.stream {
            put(&mut map, ClientField::Stream, stream);
        }
        if let Some(ref email) = self.email {
            put(&mut map, ClientField::Email, email.as_str());
        }
        if let Some(ref t) = self.last_lead_scoring {
            put(&mut map, ClientField::LastLeadScoring, t.as_str());
        }
        if let Some(ref t) = self.last_post_harvest {
            put(&mut map, ClientField::LastPostHarvest, t.as_str());
        }
        if let Some(ref t) = self.last_post_scoring {
            put(&mut map, ClientField::LastPostScoring, t.as_str());
        }
        if !self.feature_flags.is_empty() {
            put(&mut map, ClientField::FeatureFlags, self.feature_flags.clone());
        }
        map
    }

    fn decode(record_id: &str, fields: &FieldMap) -> Result<Self, StorageError> {
        let row = Row::new(Self::TABLE, fields);
        // Service level is stored as a single-select like "2-Lead Scoring + Posts".
        let service_level = match row.get(ClientField::ServiceLevel) {
            Some(Value::String(s)) => s
                .chars()
                .take_while(char::is_ascii_digit)
                .collect::<String>()
                .parse()
                .unwrap_or(1),
            Some(_) => u8::try_from(row.u64(ClientField::ServiceLevel)).unwrap_or(1),
            None => 1,
        };
        let feature_flags = match row.get(ClientField::FeatureFlags) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            Some(Value::String(s)) => s
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        };
        Ok(ClientRecord {
            record_id: record_id.to_string(),
            client_id: row.required(ClientField::ClientId)?,
            client_name: row.string(ClientField::ClientName),
            status: row.parsed(ClientField::Status, ClientStatus::parse)?,
            service_level,
            stream: row.opt_u8(ClientField::Stream),
            email: row.opt_str(ClientField::Email),
            last_lead_scoring: row.opt_str(ClientField::LastLeadScoring),
            last_post_harvest: row.opt_str(ClientField::LastPostHarvest),
            last_post_scoring: row.opt_str(ClientField::LastPostScoring),
            feature_flags,
        })
    }
}

impl RowCodec for JobTrackingRecord {
    const TABLE: Table = Table::JobTracking;

    fn encode(&self) -> FieldMap {
        let mut map = FieldMap::new();
        put(&mut map, JobTrackingField::RunId, self.run_id.as_str());
        put(&mut map, JobTrackingField::Status, self.status.as_str());
        put(&mut map, JobTrackingField::Stream, self.stream);
        put(&mut map, JobTrackingField::StartTime, self.start_time.as_str());
        if let Some(ref end) = self.end_time {
            put(&mut map, JobTrackingField::EndTime, end.as_str());
        }
        put(&mut map, JobTrackingField::ClientsProcessed, self.clients_processed);
        put(&mut map, JobTrackingField::ClientsSucceeded, self.clients_succeeded);
        put(&mut map, JobTrackingField::ClientsFailed, self.clients_failed);
        put(&mut map, JobTrackingField::ProfilesScored, self.profiles_scored);
        put(&mut map, JobTrackingField::PostsHarvested, self.posts_harvested);
        put(&mut map, JobTrackingField::PostsScored, self.posts_scored);
        put(&mut map, JobTrackingField::TokensUsed, self.tokens_used);
        put(&mut map, JobTrackingField::SystemNotes, self.system_notes.as_str());
        put(&mut map, JobTrackingField::ErrorSummary, self.error_summary.as_str());
        map
    }

    fn decode(record_id: &str, fields: &FieldMap) -> Result<Self, StorageError> {
        let row = Row::new(Self::TABLE, fields);
        Ok(JobTrackingRecord {
            record_id: record_id.to_string(),
            run_id: row.required(JobTrackingField::RunId)?,
            status: row.parsed(JobTrackingField::Status, JobStatus::parse)?,
            stream: row.opt_u8(JobTrackingField::Stream).unwrap_or(1),
            start_time: row.string(JobTrackingField::StartTime),
            end_time: row.opt_str(JobTrackingField::EndTime),
            clients_processed: row.u32(JobTrackingField::ClientsProcessed),
            clients_succeeded: row.u32(JobTrackingField::ClientsSucceeded),
            clients_failed: row.u32(JobTrackingField::ClientsFailed),
            profiles_scored: row.u64(JobTrackingField::ProfilesScored),
            posts_harvested: row.u64(JobTrackingField::PostsHarvested),
            posts_scored: row.u64(JobTrackingField::PostsScored),
            tokens_used: row.u64(JobTrackingField::TokensUsed),
            system_notes: row.string(JobTrackingField::SystemNotes),
            error_summary: row.string(JobTrackingField::ErrorSummary),
        })
    }
}

impl RowCodec for ClientRunRecord {
    const TABLE: Table = Table::ClientRunResults;

    fn encode(&self) -> FieldMap {
        let mut map = FieldMap::new();
        put(&mut map, ClientRunField::RunId, self.run_id.as_str());
        put(&mut map, ClientRunField::ClientId, self.client_id.as_str());
        put(&mut map, ClientRunField::ClientName, self.client_name.as_str());
        put(&mut map, ClientRunField::Status, self.status.as_str());
        put(&mut map, ClientRunField::StartTime, self.start_time.as_str());
        if let Some(ref end) = self.end_time {
            put(&mut map, ClientRunField::EndTime, end.as_str());
        }
        let m = &self.metrics;
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
        if let Some(ref id) = self.harvest_actor_run_id {
            put(&mut map, ClientRunField::HarvestActorRunId, id.as_str());
        }
        put(&mut map, ClientRunField::SystemNotes, self.system_notes.as_str());
        put(&mut map, ClientRunField::ErrorDetails, self.error_details.as_str());
        map
    }

    fn decode(record_id: &str, fields: &FieldMap) -> Result<Self, StorageError> {
        let row = Row::new(Self::TABLE, fields);
        Ok(ClientRunRecord {
            record_id: record_id.to_string(),
            run_id: row.required(ClientRunField::RunId)?,
            client_id: row.required(ClientRunField::ClientId)?,
            client_name: row.string(ClientRunField::ClientName),
            status: row.parsed(ClientRunField::Status, ClientRunStatus::parse)?,
            start_time: row.string(ClientRunField::StartTime),
            end_time: row.opt_str(ClientRunField::EndTime),
            metrics: ClientRunMetrics {
                profiles_examined: row.u64(ClientRunField::ProfilesExamined),
                profiles_scored: row.u64(ClientRunField::ProfilesScored),
                profile_scoring_tokens: row.u64(ClientRunField::ProfileScoringTokens),
                posts_harvested: row.u64(ClientRunField::PostsHarvested),
                harvest_actor_cost: row.f64(ClientRunField::HarvestActorCost),
                posts_examined: row.u64(ClientRunField::PostsExamined),
                posts_scored: row.u64(ClientRunField::PostsScored),
                post_scoring_tokens: row.u64(ClientRunField::PostScoringTokens),
                errors: row.u32(ClientRunField::Errors),
                post_scoring_errors: row.u32(ClientRunField::PostScoringErrors),
            },
            harvest_actor_run_id: row.opt_str(ClientRunField::HarvestActorRunId),
            system_notes: row.string(ClientRunField::SystemNotes),
            error_details: row.string(ClientRunField::ErrorDetails),
        })
    }
}

impl RowCodec for ProductionIssueRecord {
    const TABLE: Table = Table::ProductionIssues;

    fn encode(&self) -> FieldMap {
        let mut map = FieldMap::new();
        put(&mut map, IssueField::Timestamp, self.timestamp.as_str());
        put(&mut map, IssueField::Severity, self.severity.as_str());
        put(&mut map, IssueField::Pattern, self.pattern.as_str());
        put(&mut map, IssueField::ErrorMessage, self.error_message.as_str());
        if let Some(ref id) = self.stack_trace_id {
            put(&mut map, IssueField::StackTraceId, id.as_str());
        }
        put(&mut map, IssueField::RunId, self.run_id.as_str());
        if let Some(ref client) = self.client_id {
            put(&mut map, IssueField::ClientId, client.as_str());
        }
        if let Some(stream) = self.stream {
            put(&mut map, IssueField::Stream, stream);
        }
        put(&mut map, IssueField::RunType, self.run_type.as_str());
        put(&mut map, IssueField::Status, self.status.as_str());
        if let Some(ref hash) = self.commit_hash {
            put(&mut map, IssueField::CommitHash, hash.as_str());
        }
        if let Some(ref notes) = self.fix_notes {
            put(&mut map, IssueField::FixNotes, notes.as_str());
        }
        put(&mut map, IssueField::Occurrences, self.occurrences);
        map
    }

    fn decode(record_id: &str, fields: &FieldMap) -> Result<Self, StorageError> {
        let row = Row::new(Self::TABLE, fields);
        Ok(ProductionIssueRecord {
            record_id: record_id.to_string(),
            timestamp: row.string(IssueField::Timestamp),
            severity: row.parsed(IssueField::Severity, Severity::parse)?,
            pattern: row.string(IssueField::Pattern),
            error_message: row.string(IssueField::ErrorMessage),
            stack_trace_id: row.opt_str(IssueField::StackTraceId),
            run_id: row.string(IssueField::RunId),
            client_id: row.opt_str(IssueField::ClientId),
            stream: row.opt_u8(IssueField::Stream),
            run_type: row.string(IssueField::RunType),
            status: row.parsed(IssueField::Status, IssueStatus::parse)?,
            commit_hash: row.opt_str(IssueField::CommitHash),
            fix_notes: row.opt_str(IssueField::FixNotes),
            occurrences: row.u32(IssueField::Occurrences).max(1),
        })
    }
}

impl RowCodec for StackTraceRecord {
    const TABLE: Table = Table::StackTraces;

    fn encode(&self) -> FieldMap {
        let mut map = FieldMap::new();
        put(&mut map, StackTraceField::Timestamp, self.timestamp.as_str());
        put(&mut map, StackTraceField::RunId, self.run_id.as_str());
        if let Some(ref client) = self.client_id {
            put(&mut map, StackTraceField::ClientId, client.as_str());
        }
        put(&mut map, StackTraceField::ErrorMessage, self.error_message.as_str());
        put(&mut map, StackTraceField::StackTrace, self.stack_trace.as_str());
        map
    }

    fn decode(record_id: &str, fields: &FieldMap) -> Result<Self, StorageError> {
        let row = Row::new(Self::TABLE, fields);
        Ok(StackTraceRecord {
            record_id: record_id.to_string(),
            timestamp: row.string(StackTraceField::Timestamp),
            run_id: row.string(StackTraceField::RunId),
            client_id: row.opt_str(StackTraceField::ClientId),
            error_message: row.string(StackTraceField::ErrorMessage),
            stack_trace: row.string(StackTraceField::StackTrace),
        })
    }
}
