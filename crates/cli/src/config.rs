//! argusd config file: storage backend, clusters, and the sync rules
//! applied to every connected cluster.

use anyhow::{Context, Result};
use argus_core::rule::{validate_rules, ResourceSyncRule};
use argus_core::CompiledSelectors;
use argus_kubehub::ClusterCredentials;
use argus_transform::{TransformRegistry, Transformer, Trimmer};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StorageConfig {
    #[default]
    Memory,
    Sqlite {
        path: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    pub clusters: Vec<ClusterCredentials>,
    #[serde(default)]
    pub rules: Vec<ResourceSyncRule>,
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let raw = std::fs::read_to_string(path).with_context(|| format!("reading config at {path}"))?;
        let cfg: Config = serde_yaml::from_str(&raw).context("parsing config YAML")?;
        Ok(cfg)
    }

    /// Everything that would be a configuration error at syncer start,
    /// checked offline: duplicate rules, selector/trim/transform compiles,
    /// duplicate cluster names.
    pub fn validate(&self) -> Result<()> {
        validate_rules(&self.rules)?;
        let mut names = std::collections::HashSet::new();
        for cluster in &self.clusters {
            if !names.insert(cluster.name.as_str()) {
                anyhow::bail!("duplicate cluster name {:?}", cluster.name);
            }
        }
        let funcs = TransformRegistry::default();
        for rule in &self.rules {
            let key = rule.key();
            CompiledSelectors::compile(&rule.selectors)
                .with_context(|| format!("rule {key}: selector spec"))?;
            if let Some(trim) = &rule.trim {
                Trimmer::compile(trim).map_err(|e| anyhow::anyhow!("rule {key}: trim spec: {e}"))?;
            }
            if let Some(transform) = &rule.transform {
                Transformer::compile("validate", transform, None, &funcs)
                    .map_err(|e| anyhow::anyhow!("rule {key}: transform spec: {e}"))?;
            }
        }
        Ok(())
    }
}
