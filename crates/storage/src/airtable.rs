//! Hosted row-store backend (Airtable REST API).
//!
//! Uses `ureq` (sync) wrapped in `tokio::task::spawn_blocking` so the async
//! runtime never blocks. Every call goes through [`RetryPolicy::run`]:
//! rate limits and 5xx responses back off exponentially, schema and
//! authorisation failures surface immediately.
//!
//! - Lists follow the `offset` cursor returned by the API; there is no
//!   manual page arithmetic.
//! - Creates and updates are sent in batches of at most [`MAX_BATCH`].
//! - Every outgoing field map passes [`validate_write`] first.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use leadrun_core::run_id;

use crate::codec::RowCodec;
use crate::error::StorageError;
use crate::fields::{
    validate_write, CatalogueField, ClientField, ClientRunField, FieldMap, IssueField,
    JobTrackingField, Table,
};
use crate::patch::{ClientRunPatch, IssuePatch, JobRunPatch};
use crate::record::{
    ClientRecord, ClientRunRecord, ClientRunStatus, ClientStatus, IssueStatus, JobStatus,
    JobTrackingRecord, ProductionIssueRecord, StackTraceRecord,
};
use crate::retry::RetryPolicy;
use crate::traits::{OrchestratorStorage, MAX_BATCH};

/// Default REST endpoint of the hosted store.
pub const DEFAULT_API_URL: &str = "https://api.airtable.com/v0";

/// Connection settings for [`AirtableStorage`].
#[derive(Debug, Clone)]
pub struct AirtableConfig {
    pub api_url: String,
    pub base_id: String,
    pub api_key: String,
    pub retry: RetryPolicy,
}

impl AirtableConfig {
    pub fn new(base_id: impl Into<String>, api_key: impl Into<String>) -> Self {
        AirtableConfig {
            api_url: DEFAULT_API_URL.to_string(),
            base_id: base_id.into(),
            api_key: api_key.into(),
            retry: RetryPolicy::default(),
        }
    }
}

/// A record as returned by the REST API.
#[derive(Debug, Clone, Deserialize)]
struct RawRecord {
    id: String,
    #[serde(default)]
    fields: FieldMap,
}

#[derive(Debug, Deserialize)]
struct ListPage {
    #[serde(default)]
    records: Vec<RawRecord>,
    offset: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RecordBatch {
    #[serde(default)]
    records: Vec<RawRecord>,
}

#[derive(Debug, Clone)]
enum Request {
    Get { query: Vec<(String, String)> },
    Post(Value),
    Patch(Value),
}

/// `OrchestratorStorage` over the hosted row store.
pub struct AirtableStorage {
    config: AirtableConfig,
    agent: ureq::Agent,
}

impl AirtableStorage {
    pub fn new(config: AirtableConfig) -> Self {
        let agent = ureq::Agent::new_with_config(
            ureq::Agent::config_builder()
                .timeout_global(Some(config.retry.call_timeout))
                .build(),
        );
        AirtableStorage { config, agent }
    }

    fn table_url(&self, table: Table) -> String {
        format!(
            "{}/{}/{}",
            self.config.api_url.trim_end_matches('/'),
            self.config.base_id,
            encode_path_segment(table.name())
        )
    }

    async fn send(
        &self,
        table: Table,
        operation: &str,
        url: String,
        request: Request,
    ) -> Result<Value, StorageError> {
        let auth = format!("Bearer {}", self.config.api_key);
        self.config
            .retry
            .run(operation, || {
                let agent = self.agent.clone();
                let url = url.clone();
                let auth = auth.clone();
                let request = request.clone();
                async move {
                    tokio::task::spawn_blocking(move || {
                        blocking_send(&agent, &url, &auth, table, request)
                    })
                    .await
                    .map_err(|e| StorageError::Backend(format!("task join error: {}", e)))?
                }
            })
            .await
    }

    /// List every record matching the formula, following the offset cursor.
    async fn list<R: RowCodec>(&self, formula: Option<String>) -> Result<Vec<R>, StorageError> {
        let mut out = Vec::new();
        let mut offset: Option<String> = None;
        loop {
            let mut query = vec![("pageSize".to_string(), "100".to_string())];
            if let Some(ref f) = formula {
                query.push(("filterByFormula".to_string(), f.clone()));
            }
            if let Some(ref o) = offset {
                query.push(("offset".to_string(), o.clone()));
            }
            let value = self
                .send(
                    R::TABLE,
                    "list",
                    self.table_url(R::TABLE),
                    Request::Get { query },
                )
                .await?;
            let page: ListPage = decode_body(R::TABLE, value)?;
            for raw in &page.records {
                out.push(R::decode(&raw.id, &raw.fields)?);
            }
            match page.offset {
                Some(next) => offset = Some(next),
                None => return Ok(out),
            }
        }
    }

    async fn first<R: RowCodec>(&self, formula: String) -> Result<Option<R>, StorageError> {
        Ok(self.list::<R>(Some(formula)).await?.into_iter().next())
    }

    async fn get<R: RowCodec>(&self, record_id: &str) -> Result<R, StorageError> {
        let url = format!("{}/{}", self.table_url(R::TABLE), record_id);
        let value = self
            .send(R::TABLE, "get", url, Request::Get { query: Vec::new() })
            .await
            .map_err(|e| match e {
                StorageError::NotFound { table, .. } => StorageError::NotFound {
                    table,
                    key: record_id.to_string(),
                },
                other => other,
            })?;
        let raw: RawRecord = decode_body(R::TABLE, value)?;
        R::decode(&raw.id, &raw.fields)
    }

    async fn create<R: RowCodec>(&self, records: Vec<FieldMap>) -> Result<Vec<R>, StorageError> {
        let mut validated = Vec::with_capacity(records.len());
        for fields in records {
            validated.push(validate_write(R::TABLE, fields)?);
        }
        let mut out = Vec::with_capacity(validated.len());
        for chunk in validated.chunks(MAX_BATCH) {
            let body = json!({
                "records": chunk.iter().map(|f| json!({ "fields": f })).collect::<Vec<_>>(),
                "typecast": true,
            });
            let value = self
                .send(R::TABLE, "create", self.table_url(R::TABLE), Request::Post(body))
                .await?;
            let batch: RecordBatch = decode_body(R::TABLE, value)?;
            for raw in &batch.records {
                out.push(R::decode(&raw.id, &raw.fields)?);
            }
        }
        Ok(out)
    }

    async fn create_one<R: RowCodec>(&self, fields: FieldMap) -> Result<R, StorageError> {
        self.create::<R>(vec![fields])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| StorageError::Backend("create returned no records".to_string()))
    }

    async fn update<R: RowCodec>(
        &self,
        updates: Vec<(String, FieldMap)>,
    ) -> Result<Vec<R>, StorageError> {
        let mut validated = Vec::with_capacity(updates.len());
        for (id, fields) in updates {
            validated.push((id, validate_write(R::TABLE, fields)?));
        }
        let mut out = Vec::with_capacity(validated.len());
        for chunk in validated.chunks(MAX_BATCH) {
            let body = json!({
                "records": chunk
                    .iter()
                    .map(|(id, f)| json!({ "id": id, "fields": f }))
                    .collect::<Vec<_>>(),
                "typecast": true,
            });
            let value = self
                .send(R::TABLE, "update", self.table_url(R::TABLE), Request::Patch(body))
                .await?;
            let batch: RecordBatch = decode_body(R::TABLE, value)?;
            for raw in &batch.records {
                out.push(R::decode(&raw.id, &raw.fields)?);
            }
        }
        Ok(out)
    }

    async fn update_one<R: RowCodec>(
        &self,
        record_id: &str,
        fields: FieldMap,
    ) -> Result<R, StorageError> {
        self.update::<R>(vec![(record_id.to_string(), fields)])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| StorageError::NotFound {
                table: R::TABLE,
                key: record_id.to_string(),
            })
    }
}

fn blocking_send(
    agent: &ureq::Agent,
    url: &str,
    auth: &str,
    table: Table,
    request: Request,
) -> Result<Value, StorageError> {
    let response = match request {
        Request::Get { query } => {
            let mut builder = agent.get(url).header("Authorization", auth);
            for (key, value) in &query {
                builder = builder.query(key, value);
            }
            builder.call()
        }
        Request::Post(body) => agent
            .post(url)
            .header("Authorization", auth)
            .send_json(&body),
        Request::Patch(body) => agent
            .patch(url)
            .header("Authorization", auth)
            .send_json(&body),
    }
    .map_err(|e| classify_http_error(e, table, url))?;

    response
        .into_body()
        .read_json::<Value>()
        .map_err(|e| StorageError::Decode {
            table,
            message: format!("failed to parse response as JSON: {}", e),
        })
}

fn decode_body<T: serde::de::DeserializeOwned>(table: Table, value: Value) -> Result<T, StorageError> {
    serde_json::from_value(value).map_err(|e| StorageError::Decode {
        table,
        message: e.to_string(),
    })
}

/// Map a transport or status failure onto the storage taxonomy.
fn classify_http_error(err: ureq::Error, table: Table, url: &str) -> StorageError {
    match err {
        ureq::Error::StatusCode(429) => StorageError::RateLimited(format!("HTTP 429 from {}", url)),
        ureq::Error::StatusCode(code @ (401 | 403)) => {
            StorageError::Unauthorized(format!("HTTP {} from {}", code, url))
        }
        ureq::Error::StatusCode(404) => StorageError::NotFound {
            table,
            key: url.to_string(),
        },
        ureq::Error::StatusCode(code @ 500..=599) => StorageError::Unavailable {
            status: code,
            message: url.to_string(),
        },
        ureq::Error::StatusCode(code) => {
            StorageError::Schema(format!("HTTP {} from {} ({})", code, url, table.name()))
        }
        ureq::Error::Timeout(_) => StorageError::Timeout {
            operation: url.to_string(),
            seconds: 0,
        },
        other => StorageError::Backend(other.to_string()),
    }
}

/// Quote a string literal for use inside a filter formula.
pub fn formula_literal(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

fn field_ref<F: CatalogueField>(field: F) -> String {
    format!("{{{}}}", field.name())
}

fn field_equals<F: CatalogueField>(field: F, value: &str) -> String {
    format!("{}={}", field_ref(field), formula_literal(value))
}

fn base_run_prefix<F: CatalogueField>(field: F, base_run_id: &str) -> String {
    format!(
        "LEFT({},{})={}",
        field_ref(field),
        run_id::BASE_LEN,
        formula_literal(base_run_id)
    )
}

/// Percent-encode one URL path segment (table names contain spaces).
fn encode_path_segment(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

#[async_trait]
impl OrchestratorStorage for AirtableStorage {
    async fn list_clients(
        &self,
        status: Option<ClientStatus>,
    ) -> Result<Vec<ClientRecord>, StorageError> {
        let formula = status.map(|s| field_equals(ClientField::Status, s.as_str()));
        self.list(formula).await
    }

    async fn get_client(&self, client_id: &str) -> Result<Option<ClientRecord>, StorageError> {
        self.first(field_equals(ClientField::ClientId, client_id)).await
    }

    async fn find_job_run(&self, run_id: &str) -> Result<Option<JobTrackingRecord>, StorageError> {
        self.first(field_equals(JobTrackingField::RunId, run_id)).await
    }

    async fn create_job_run(
        &self,
        record: JobTrackingRecord,
    ) -> Result<JobTrackingRecord, StorageError> {
        if self.find_job_run(&record.run_id).await?.is_some() {
            return Err(StorageError::AlreadyExists {
                table: Table::JobTracking,
                key: record.run_id,
            });
        }
        self.create_one(record.encode()).await
    }

    async fn update_job_run(
        &self,
        record_id: &str,
        patch: &JobRunPatch,
    ) -> Result<JobTrackingRecord, StorageError> {
        self.update_one(record_id, patch.to_fields()).await
    }

    async fn list_job_runs(
        &self,
        status: JobStatus,
    ) -> Result<Vec<JobTrackingRecord>, StorageError> {
        self.list(Some(field_equals(JobTrackingField::Status, status.as_str())))
            .await
    }

    async fn find_running_client_run(
        &self,
        client_id: &str,
    ) -> Result<Option<ClientRunRecord>, StorageError> {
        self.first(format!(
            "AND({},{})",
            field_equals(ClientRunField::ClientId, client_id),
            field_equals(ClientRunField::Status, ClientRunStatus::Running.as_str())
        ))
        .await
    }

    async fn find_client_run(
        &self,
        run_id: &str,
        client_id: &str,
    ) -> Result<Option<ClientRunRecord>, StorageError> {
        self.first(format!(
            "AND({},{})",
            field_equals(ClientRunField::RunId, run_id),
            field_equals(ClientRunField::ClientId, client_id)
        ))
        .await
    }

    async fn get_client_run(&self, record_id: &str) -> Result<ClientRunRecord, StorageError> {
        self.get(record_id).await
    }

    async fn create_client_run(
        &self,
        record: ClientRunRecord,
    ) -> Result<ClientRunRecord, StorageError> {
        self.create_one(record.encode()).await
    }

    async fn update_client_run(
        &self,
        record_id: &str,
        patch: &ClientRunPatch,
    ) -> Result<ClientRunRecord, StorageError> {
        self.update_one(record_id, patch.to_fields()).await
    }

    async fn update_client_runs(
        &self,
        updates: &[(String, ClientRunPatch)],
    ) -> Result<Vec<ClientRunRecord>, StorageError> {
        self.update(
            updates
                .iter()
                .map(|(id, patch)| (id.clone(), patch.to_fields()))
                .collect(),
        )
        .await
    }

    async fn list_client_runs(
        &self,
        base_run_id: &str,
    ) -> Result<Vec<ClientRunRecord>, StorageError> {
        self.list(Some(base_run_prefix(ClientRunField::RunId, base_run_id)))
            .await
    }

    async fn find_open_issue(
        &self,
        pattern: &str,
        base_run_id: &str,
    ) -> Result<Option<ProductionIssueRecord>, StorageError> {
        self.first(format!(
            "AND({},{},{})",
            field_equals(IssueField::Status, IssueStatus::Open.as_str()),
            field_equals(IssueField::Pattern, pattern),
            base_run_prefix(IssueField::RunId, base_run_id)
        ))
        .await
    }

    async fn create_issue(
        &self,
        record: ProductionIssueRecord,
    ) -> Result<ProductionIssueRecord, StorageError> {
        self.create_one(record.encode()).await
    }

    async fn update_issue(
        &self,
        record_id: &str,
        patch: &IssuePatch,
    ) -> Result<ProductionIssueRecord, StorageError> {
        self.update_one(record_id, patch.to_fields()).await
    }

    async fn list_issues(
        &self,
        status: Option<IssueStatus>,
    ) -> Result<Vec<ProductionIssueRecord>, StorageError> {
        let formula = status.map(|s| field_equals(IssueField::Status, s.as_str()));
        self.list(formula).await
    }

    async fn create_stack_trace(&self, record: StackTraceRecord) -> Result<String, StorageError> {
        let created: StackTraceRecord = self.create_one(record.encode()).await?;
        Ok(created.record_id)
    }
}

impl AirtableStorage {
    /// Shorten the per-call deadline (mostly for tests and dry runs).
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.config.retry = self.config.retry.with_call_timeout(timeout);
        self
    }
}
