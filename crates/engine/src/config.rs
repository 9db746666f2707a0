//! Process configuration read from the environment.
//!
//! Everything is parsed and validated up front by
//! [`OrchestratorConfig::from_env`]; a bad value is a [`ConfigError`]
//! before any storage call is made.

use std::time::Duration;

use leadrun_core::run_id;
use leadrun_storage::{AirtableConfig, RetryPolicy, DEFAULT_API_URL};

use crate::error::ConfigError;
use crate::partition;

pub const DEFAULT_STUCK_LOCK_MINUTES: u64 = 30;
pub const DEFAULT_MAX_STREAMS: u8 = 3;
pub const DEFAULT_MIN_SERVICE_LEVEL: u8 = 1;
pub const DEFAULT_STORAGE_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Shared secret for the HTTP surface and for stage calls.
    pub webhook_secret: Option<String>,
    pub base_id: Option<String>,
    pub api_key: Option<String>,
    pub api_url: String,
    /// Stream used when a request does not name one.
    pub default_stream: u8,
    /// Base run id to use instead of minting one.
    pub run_id_override: Option<String>,
    pub lead_scoring_limit: Option<u32>,
    pub post_scoring_limit: Option<u32>,
    /// External URL of this service, used to reach the stage endpoints.
    pub public_base_url: Option<String>,
    pub stuck_lock_minutes: u64,
    pub min_service_level: u8,
    pub max_streams: u8,
    pub storage_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        OrchestratorConfig {
            webhook_secret: None,
            base_id: None,
            api_key: None,
            api_url: DEFAULT_API_URL.to_string(),
            default_stream: 1,
            run_id_override: None,
            lead_scoring_limit: None,
            post_scoring_limit: None,
            public_base_url: None,
            stuck_lock_minutes: DEFAULT_STUCK_LOCK_MINUTES,
            min_service_level: DEFAULT_MIN_SERVICE_LEVEL,
            max_streams: DEFAULT_MAX_STREAMS,
            storage_timeout: Duration::from_secs(DEFAULT_STORAGE_TIMEOUT_SECS),
        }
    }
}

impl OrchestratorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let defaults = OrchestratorConfig::default();

        let max_streams = parse_var(&get, "MAX_STREAMS")?.unwrap_or(defaults.max_streams);
        if max_streams == 0 {
            return Err(ConfigError::Invalid {
                var: "MAX_STREAMS",
                message: "must be at least 1".to_string(),
            });
        }
        let default_stream = match parse_var::<i64, _>(&get, "BATCH_PROCESSING_STREAM")? {
            Some(stream) => partition::validate_stream(stream, max_streams)?,
            None => defaults.default_stream,
        };

        let run_id_override = match get("SMART_RESUME_RUN_ID") {
            Some(rid) => {
                run_id::require_base(&rid).map_err(|e| ConfigError::Invalid {
                    var: "SMART_RESUME_RUN_ID",
                    message: e.to_string(),
                })?;
                Some(rid)
            }
            None => None,
        };

        let public_base_url = get("API_PUBLIC_BASE_URL");
        if let Some(ref url) = public_base_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(ConfigError::Invalid {
                    var: "API_PUBLIC_BASE_URL",
                    message: format!("'{}' is not an http(s) URL", url),
                });
            }
        }

        let storage_timeout_secs: u64 =
            parse_var(&get, "STORAGE_TIMEOUT_SECS")?.unwrap_or(DEFAULT_STORAGE_TIMEOUT_SECS);
        if storage_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                var: "STORAGE_TIMEOUT_SECS",
                message: "must be at least 1".to_string(),
            });
        }

        Ok(OrchestratorConfig {
            webhook_secret: get("WEBHOOK_SECRET"),
            base_id: get("MASTER_CLIENTS_BASE_ID"),
            api_key: get("AIRTABLE_API_KEY"),
            api_url: get("AIRTABLE_API_URL").unwrap_or(defaults.api_url),
            default_stream,
            run_id_override,
            lead_scoring_limit: parse_var(&get, "LEAD_SCORING_LIMIT")?,
            post_scoring_limit: parse_var(&get, "POST_SCORING_LIMIT")?,
            public_base_url,
            stuck_lock_minutes: parse_var(&get, "STUCK_LOCK_MINUTES")?
                .unwrap_or(defaults.stuck_lock_minutes),
            min_service_level: parse_var(&get, "MIN_SERVICE_LEVEL")?
                .unwrap_or(defaults.min_service_level),
            max_streams,
            storage_timeout: Duration::from_secs(storage_timeout_secs),
        })
    }

    /// The stream to process: the requested one, else the configured default.
    pub fn resolve_stream(&self, requested: Option<i64>) -> Result<u8, ConfigError> {
        match requested {
            Some(stream) => partition::validate_stream(stream, self.max_streams),
            None => Ok(self.default_stream),
        }
    }

    pub fn require_webhook_secret(&self) -> Result<&str, ConfigError> {
        self.webhook_secret
            .as_deref()
            .ok_or(ConfigError::Missing("WEBHOOK_SECRET"))
    }

    /// Retry policy for storage and stage calls.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default().with_call_timeout(self.storage_timeout)
    }

    /// Connection settings for the hosted row store.
    pub fn airtable(&self) -> Result<AirtableConfig, ConfigError> {
        let base_id = self
            .base_id
            .clone()
            .ok_or(ConfigError::Missing("MASTER_CLIENTS_BASE_ID"))?;
        let api_key = self
            .api_key
            .clone()
            .ok_or(ConfigError::Missing("AIRTABLE_API_KEY"))?;
        Ok(AirtableConfig {
            api_url: self.api_url.clone(),
            base_id,
            api_key,
            retry: self.retry_policy(),
        })
    }
}

fn parse_var<T, G>(get: &G, var: &'static str) -> Result<Option<T>, ConfigError>
where
    G: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match get(var) {
        Some(raw) => raw.parse().map(Some).map_err(|e: T::Err| ConfigError::Invalid {
            var,
            message: format!("'{}': {}", raw, e),
        }),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<OrchestratorConfig, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        OrchestratorConfig::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn defaults_when_environment_is_empty() {
        let cfg = config(&[]).unwrap();
        assert_eq!(cfg, OrchestratorConfig::default());
        assert_eq!(cfg.default_stream, 1);
        assert_eq!(cfg.stuck_lock_minutes, 30);
        assert_eq!(cfg.storage_timeout, Duration::from_secs(30));
    }

    #[test]
    fn reads_every_variable() {
        let cfg = config(&[
            ("WEBHOOK_SECRET", "s3cret"),
            ("MASTER_CLIENTS_BASE_ID", "appXYZ"),
            ("AIRTABLE_API_KEY", "key"),
            ("BATCH_PROCESSING_STREAM", "2"),
            ("SMART_RESUME_RUN_ID", "250101-120000"),
            ("LEAD_SCORING_LIMIT", "50"),
            ("POST_SCORING_LIMIT", "20"),
            ("API_PUBLIC_BASE_URL", "https://leads.example.com"),
            ("STUCK_LOCK_MINUTES", "45"),
            ("MIN_SERVICE_LEVEL", "2"),
        ])
        .unwrap();
        assert_eq!(cfg.require_webhook_secret().unwrap(), "s3cret");
        assert_eq!(cfg.default_stream, 2);
        assert_eq!(cfg.run_id_override.as_deref(), Some("250101-120000"));
        assert_eq!(cfg.lead_scoring_limit, Some(50));
        assert_eq!(cfg.post_scoring_limit, Some(20));
        assert_eq!(cfg.stuck_lock_minutes, 45);
        assert_eq!(cfg.min_service_level, 2);
        let airtable = cfg.airtable().unwrap();
        assert_eq!(airtable.base_id, "appXYZ");
    }

    #[test]
    fn rejects_stream_outside_range() {
        let err = config(&[("BATCH_PROCESSING_STREAM", "4")]).unwrap_err();
        assert_eq!(err, ConfigError::StreamOutOfRange { stream: 4, max: 3 });
        let err = config(&[("BATCH_PROCESSING_STREAM", "0")]).unwrap_err();
        assert!(matches!(err, ConfigError::StreamOutOfRange { .. }));
    }

    #[test]
    fn rejects_legacy_run_id_override() {
        let err = config(&[("SMART_RESUME_RUN_ID", "SR-250101-001-T1-S1")]).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                var: "SMART_RESUME_RUN_ID",
                ..
            }
        ));
    }

    #[test]
    fn rejects_non_numeric_limits() {
        let err = config(&[("LEAD_SCORING_LIMIT", "lots")]).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                var: "LEAD_SCORING_LIMIT",
                ..
            }
        ));
    }

    #[test]
    fn missing_credentials_are_reported_by_name() {
        let cfg = config(&[("MASTER_CLIENTS_BASE_ID", "appXYZ")]).unwrap();
        assert_eq!(
            cfg.airtable().unwrap_err(),
            ConfigError::Missing("AIRTABLE_API_KEY")
        );
        assert_eq!(
            cfg.require_webhook_secret().unwrap_err(),
            ConfigError::Missing("WEBHOOK_SECRET")
        );
    }

    #[test]
    fn request_stream_overrides_default() {
        let cfg = config(&[("BATCH_PROCESSING_STREAM", "2")]).unwrap();
        assert_eq!(cfg.resolve_stream(None).unwrap(), 2);
        assert_eq!(cfg.resolve_stream(Some(3)).unwrap(), 3);
        assert!(cfg.resolve_stream(Some(-1)).is_err());
    }
}
