mod airtable;
mod codec;
mod error;
mod fields;
mod memory;
mod patch;
mod record;
mod retry;
mod traits;

pub mod conformance;

pub use airtable::{formula_literal, AirtableConfig, AirtableStorage, DEFAULT_API_URL};
pub use codec::RowCodec;
pub use error::StorageError;
pub use fields::{
    validate_write, CatalogueField, ClientField, ClientRunField, FieldMap, IssueField,
    JobTrackingField, StackTraceField, Table,
};
pub use memory::InMemoryStorage;
pub use patch::{ClientRunPatch, IssuePatch, JobRunPatch};
pub use record::{
    ClientRecord, ClientRunMetrics, ClientRunRecord, ClientRunStatus, ClientStatus, IssueStatus,
    JobStatus, JobTrackingRecord, ProductionIssueRecord, Severity, StackTraceRecord,
};
pub use retry::{RetryPolicy, RetryableError};
pub use traits::{OrchestratorStorage, MAX_BATCH};
