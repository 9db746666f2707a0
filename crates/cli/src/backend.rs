//! Storage backend and stage invoker selection.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use clap::ValueEnum;
use leadrun_engine::{
    ConfigError, HttpStageInvoker, OrchestratorConfig, StageInvoker, StageOutcome, StageReport,
    StageRequest,
};
use leadrun_storage::{AirtableStorage, InMemoryStorage, OrchestratorStorage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum BackendKind {
    /// Process-local tables, optionally seeded from a JSON file
    Memory,
    /// The hosted row store named by MASTER_CLIENTS_BASE_ID
    Airtable,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum SetupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("cannot read seed file '{}': {message}", path.display())]
    Seed { path: PathBuf, message: String },

    #[error("--seed is only valid with --backend memory")]
    SeedWithoutMemory,
}

pub(crate) fn open_storage(
    kind: BackendKind,
    seed: Option<&Path>,
    config: &OrchestratorConfig,
) -> Result<Arc<dyn OrchestratorStorage>, SetupError> {
    match (kind, seed) {
        (BackendKind::Memory, None) => Ok(Arc::new(InMemoryStorage::new())),
        (BackendKind::Memory, Some(path)) => {
            let json = std::fs::read_to_string(path).map_err(|e| SetupError::Seed {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
            let storage = InMemoryStorage::from_seed_json(&json).map_err(|e| SetupError::Seed {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
            Ok(Arc::new(storage))
        }
        (BackendKind::Airtable, Some(_)) => Err(SetupError::SeedWithoutMemory),
        (BackendKind::Airtable, None) => Ok(Arc::new(AirtableStorage::new(config.airtable()?))),
    }
}

/// Stage invoker for a run. `dry_run` accepts every stage locally.
pub(crate) fn stage_invoker(
    config: &OrchestratorConfig,
    dry_run: bool,
) -> Result<Arc<dyn StageInvoker>, ConfigError> {
    if dry_run {
        return Ok(Arc::new(DryRunStages));
    }
    let base_url = config
        .public_base_url
        .as_deref()
        .ok_or(ConfigError::Missing("API_PUBLIC_BASE_URL"))?;
    let secret = config.require_webhook_secret()?;
    Ok(Arc::new(HttpStageInvoker::new(
        base_url,
        secret,
        config.retry_policy(),
    )))
}

struct DryRunStages;

#[async_trait]
impl StageInvoker for DryRunStages {
    async fn invoke(&self, request: &StageRequest) -> StageOutcome {
        tracing::info!(
            run_id = %request.run_id,
            client_id = %request.client_id,
            stage = %request.stage,
            "dry run: stage accepted without dispatch"
        );
        Ok(StageReport {
            job_id: format!("dry-run_{}_{}", request.stage, request.client_id),
            metrics: None,
            harvest_actor_run_id: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn airtable_requires_credentials() {
        let err = open_storage(BackendKind::Airtable, None, &OrchestratorConfig::default())
            .err()
            .unwrap();
        assert!(matches!(
            err,
            SetupError::Config(ConfigError::Missing("MASTER_CLIENTS_BASE_ID"))
        ));
    }

    #[test]
    fn seed_needs_memory_backend() {
        let err = open_storage(
            BackendKind::Airtable,
            Some(Path::new("clients.json")),
            &OrchestratorConfig::default(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, SetupError::SeedWithoutMemory));
    }

    #[test]
    fn http_stages_need_public_url() {
        let err = stage_invoker(&OrchestratorConfig::default(), false)
            .err()
            .unwrap();
        assert_eq!(err, ConfigError::Missing("API_PUBLIC_BASE_URL"));
        assert!(stage_invoker(&OrchestratorConfig::default(), true).is_ok());
    }
}
