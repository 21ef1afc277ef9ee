//! Sync rule records, consumed read-only by the engine.
//!
//! Rules are produced elsewhere (config files, an aggregated API); the
//! engine only diffs them against the running state and restarts syncers
//! whose applied rule drifted.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::selector::SelectorSpec;
use crate::ResourceTypeKey;

fn default_workers() -> usize {
    10
}

/// Desired synchronization of one resource type in one cluster.
/// Identity is the (apiVersion, kind) pair; any other field change
/// triggers a stop/start of the resource type's syncer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSyncRule {
    pub api_version: String,
    pub kind: String,
    /// Restrict the watch to one namespace; absent = all namespaces.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Forced relist interval in seconds; absent = transport default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resync_secs: Option<u64>,
    #[serde(default = "default_workers")]
    pub max_concurrent_workers: usize,
    /// Entries are ORed; see the selector module for pushdown rules.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub selectors: Vec<SelectorSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<TransformSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trim: Option<TrimSpec>,
}

impl ResourceSyncRule {
    pub fn new(api_version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
            namespace: None,
            resync_secs: None,
            max_concurrent_workers: default_workers(),
            selectors: Vec::new(),
            transform: None,
            trim: None,
        }
    }

    pub fn key(&self) -> ResourceTypeKey {
        ResourceTypeKey::new(self.api_version.clone(), self.kind.clone())
    }
}

/// Named, template-driven mutation applied before persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformSpec {
    /// Registered transformer name: `patch` or `replace`.
    #[serde(rename = "type")]
    pub kind: String,
    pub template: String,
}

/// Whitelist of field paths retained before caching/persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrimSpec {
    pub retain: Vec<String>,
}

/// Reject desired sets that define the same resource type twice; rules with
/// the same key are mutually exclusive by design.
pub fn validate_rules(rules: &[ResourceSyncRule]) -> Result<()> {
    let mut seen: HashSet<ResourceTypeKey> = HashSet::new();
    for rule in rules {
        if rule.api_version.is_empty() || rule.kind.is_empty() {
            bail!("sync rule with empty apiVersion or kind");
        }
        if rule.max_concurrent_workers == 0 {
            bail!("sync rule {} sets zero workers", rule.key());
        }
        let key = rule.key();
        if !seen.insert(key.clone()) {
            bail!("duplicate sync rule for resource type {}", key);
        }
    }
    Ok(())
}
