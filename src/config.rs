//! Resolver configuration (§9 design note "Global registries", §6
//! configuration options table).
//!
//! A single injected configuration object rather than the source's
//! process-wide class-level accessors: `available_deployments`, the
//! `validate_*_network` toggles, the `on_error` failure policy, and the
//! `keep_internal_data_structures` debug flag all live here. The five
//! ordered hook lists (§9) are *not* part of this struct: hooks are
//! executable callbacks, not serializable data, so they are injected into
//! [`crate::pipeline::Pipeline`] separately via [`crate::hooks::HookChain`].

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{NetgenError, Result};

/// Post-failure disposition of the staging transaction (§4.8 failure
/// policy).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
    /// Dump dataflow and hierarchy dot files, then discard.
    Save,
    /// Commit the staging state anyway, for debugging.
    Commit,
    /// Discard silently.
    Drop,
}

impl Default for OnError {
    fn default() -> Self {
        OnError::Save
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// host -> deployment model names runnable on that host (§4.4).
    pub available_deployments: BTreeMap<String, Vec<String>>,
    pub compute_deployments: bool,
    pub compute_policies: bool,
    pub garbage_collect: bool,
    pub save_plans: bool,
    pub on_error: OnError,
    pub validate_abstract_network: bool,
    pub validate_generated_network: bool,
    pub validate_deployed_network: bool,
    pub validate_final_network: bool,
    /// Debug flag: retain `required_instances`/merge-graph state across
    /// `resolve` calls instead of clearing it at finalize (§5).
    pub keep_internal_data_structures: bool,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            available_deployments: BTreeMap::new(),
            compute_deployments: true,
            compute_policies: true,
            garbage_collect: true,
            save_plans: false,
            on_error: OnError::Save,
            validate_abstract_network: true,
            validate_generated_network: true,
            validate_deployed_network: true,
            validate_final_network: true,
            keep_internal_data_structures: false,
        }
    }
}

impl ResolverConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| NetgenError::ConfigParse { reason: e.to_string() })
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_enables_all_validators_and_saves_on_error() {
        let config = ResolverConfig::default();
        assert!(config.validate_abstract_network);
        assert!(config.validate_generated_network);
        assert!(config.validate_deployed_network);
        assert!(config.validate_final_network);
        assert_eq!(config.on_error, OnError::Save);
    }

    #[test]
    fn parses_available_deployments_from_toml() {
        let text = r#"
            [available_deployments]
            host1 = ["D1", "D2"]
        "#;
        let config = ResolverConfig::from_toml_str(text).unwrap();
        assert_eq!(config.available_deployments["host1"], vec!["D1", "D2"]);
    }

    #[test]
    fn rejects_malformed_toml() {
        let err = ResolverConfig::from_toml_str("not valid = = toml").unwrap_err();
        assert!(matches!(err, NetgenError::ConfigParse { .. }));
    }
}
