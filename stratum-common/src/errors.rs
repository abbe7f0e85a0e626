use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;

/// Error returned by a cloud provider call.
///
/// `transient` errors (network, auth hiccups, throttling, 5xx) are retried by the
/// provider client; everything else (quota, invalid image, bad request) surfaces
/// on the first attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[error("provider error [{code}]: {message}")]
pub struct ProviderError {
    pub code: String,
    pub message: String,
    pub transient: bool,
}

impl ProviderError {
    pub fn transient(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            transient: true,
        }
    }

    pub fn permanent(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            transient: false,
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::permanent("not_found", what)
    }

    pub fn is_not_found(&self) -> bool {
        self.code == "not_found"
    }
}

/// Aggregate of per-instance failures. Successful siblings are not rolled back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[error("{} instance(s) failed to apply: {}", .failures.len(), failed_keys(.failures))]
pub struct PartialApplyError {
    /// instance key -> "<stage>: <error>"
    pub failures: BTreeMap<String, String>,
}

impl PartialApplyError {
    pub fn keys(&self) -> Vec<&str> {
        self.failures.keys().map(String::as_str).collect()
    }
}

fn failed_keys(failures: &BTreeMap<String, String>) -> String {
    failures.keys().cloned().collect::<Vec<_>>().join(", ")
}

#[derive(Debug, Error)]
pub enum StratumError {
    /// `keys` are the declared keys, or the observed instance ids when the provider holds duplicates.
    #[error("plan conflict: name '{name}' claimed by {}", .keys.join(", "))]
    PlanConflict { name: String, keys: Vec<String> },

    #[error("invalid spec for '{key}': {reason}")]
    InvalidSpec { key: String, reason: String },

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    PartialApply(#[from] PartialApplyError),

    #[error("instance '{key}' unreachable at {address}:{port} after {waited_ms}ms")]
    Unreachable {
        key: String,
        address: String,
        port: u16,
        waited_ms: u128,
    },

    #[error("configuration run failed with exit code {code}")]
    ConfigurationFailed { code: i32 },

    #[error("configuration run timed out after {after_secs}s")]
    ConfigurationTimedOut { after_secs: u64 },

    #[error("manifest error: {0}")]
    Manifest(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl StratumError {
    /// Fatal errors abort the run before (or instead of) touching provider state.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StratumError::PlanConflict { .. }
                | StratumError::InvalidSpec { .. }
                | StratumError::Manifest(_)
                | StratumError::Provider(_)
                | StratumError::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_error_classes() {
        let t = ProviderError::transient("http_503", "unavailable");
        assert!(t.transient);
        let p = ProviderError::permanent("quotas_exceeded", "too many servers");
        assert!(!p.transient);
        assert_eq!(p.to_string(), "provider error [quotas_exceeded]: too many servers");
        assert!(ProviderError::not_found("server srv-1").is_not_found());
    }

    #[test]
    fn partial_apply_lists_failed_keys() {
        let err = PartialApplyError {
            failures: BTreeMap::from([
                ("web2".to_string(), "instance: boom".to_string()),
                ("db1".to_string(), "floating_ip: boom".to_string()),
            ]),
        };
        assert_eq!(err.keys(), vec!["db1", "web2"]);
        assert_eq!(err.to_string(), "2 instance(s) failed to apply: db1, web2");
    }

    #[test]
    fn fatal_classification() {
        let conflict = StratumError::PlanConflict {
            name: "web".to_string(),
            keys: vec!["a".to_string(), "b".to_string()],
        };
        assert!(conflict.is_fatal());
        assert_eq!(conflict.to_string(), "plan conflict: name 'web' claimed by a, b");
        assert!(!StratumError::ConfigurationFailed { code: 2 }.is_fatal());
        assert!(!StratumError::PartialApply(PartialApplyError {
            failures: BTreeMap::new()
        })
        .is_fatal());
    }
}
