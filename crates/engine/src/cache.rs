//! `(base run id, client id) → record id` cache for client run rows.

use std::collections::HashMap;

use leadrun_core::run_id;
use parking_lot::RwLock;

/// Remembers which `Client Run Results` row belongs to a client in a run.
///
/// Keys are canonicalised through [`run_id::strip_client`], so the base and
/// compound spellings of one run share a single entry. Reads vastly
/// outnumber writes, hence the `RwLock`.
#[derive(Debug, Default)]
pub struct RecordCache {
    entries: RwLock<HashMap<(String, String), String>>,
}

impl RecordCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(rid: &str, client_id: &str) -> (String, String) {
        (
            run_id::strip_client(rid).to_string(),
            client_id.trim().to_string(),
        )
    }

    pub fn get(&self, rid: &str, client_id: &str) -> Option<String> {
        self.entries.read().get(&Self::key(rid, client_id)).cloned()
    }

    /// Returns the previous record id, if any.
    pub fn insert(&self, rid: &str, client_id: &str, record_id: &str) -> Option<String> {
        self.entries
            .write()
            .insert(Self::key(rid, client_id), record_id.to_string())
    }

    pub fn remove(&self, rid: &str, client_id: &str) -> Option<String> {
        self.entries.write().remove(&Self::key(rid, client_id))
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
