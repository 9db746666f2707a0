//! leadrun-core: the run-identifier vocabulary shared by every leadrun crate.
//!
//! A run is identified by a canonical `YYMMDD-HHMMSS` timestamp (the base
//! RID). Per-client child records use the compound form
//! `YYMMDD-HHMMSS-<clientId>`. Everything that needs to mint, split or
//! validate a run identifier goes through [`run_id`].

pub mod run_id;

pub use run_id::{NormalizeOptions, ParsedRunId, RunIdError};
