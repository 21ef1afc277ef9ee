//! Label and field selectors, kube ListParams style.
//!
//! One [`SelectorSpec`] ANDs its label and field requirements; multiple
//! specs on a rule are ORed. Pushdown to the server happens only when a
//! rule carries at most one spec; otherwise every received object is
//! filtered client-side before it reaches the cache.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::{meta, RawObject};

/// One selector entry as written in a sync rule.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectorSpec {
    /// Label selector, e.g. `app=nginx,tier!=frontend,env`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<String>,
    /// Field selector, e.g. `metadata.namespace=default,status.phase!=Failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum LabelOp {
    Eq,
    Ne,
    Exists,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct LabelRequirement {
    key: String,
    op: LabelOp,
    value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct FieldRequirement {
    path: String,
    negated: bool,
    value: String,
}

/// A parsed selector entry ready for per-object evaluation.
#[derive(Debug, Clone, Default)]
pub struct CompiledSelector {
    labels: Vec<LabelRequirement>,
    fields: Vec<FieldRequirement>,
}

fn parse_label_selector(s: &str) -> Result<Vec<LabelRequirement>> {
    let mut out = Vec::new();
    for part in s.split(',') {
        let part = part.trim();
        if part.is_empty() {
            bail!("empty requirement in label selector {:?}", s);
        }
        if let Some((k, v)) = part.split_once("!=") {
            out.push(LabelRequirement { key: k.trim().to_string(), op: LabelOp::Ne, value: v.trim().to_string() });
        } else if let Some((k, v)) = part.split_once("==") {
            out.push(LabelRequirement { key: k.trim().to_string(), op: LabelOp::Eq, value: v.trim().to_string() });
        } else if let Some((k, v)) = part.split_once('=') {
            out.push(LabelRequirement { key: k.trim().to_string(), op: LabelOp::Eq, value: v.trim().to_string() });
        } else {
            out.push(LabelRequirement { key: part.to_string(), op: LabelOp::Exists, value: String::new() });
        }
    }
    for r in &out {
        if r.key.is_empty() {
            bail!("empty key in label selector {:?}", s);
        }
    }
    Ok(out)
}

fn parse_field_selector(s: &str) -> Result<Vec<FieldRequirement>> {
    let mut out = Vec::new();
    for part in s.split(',') {
        let part = part.trim();
        if part.is_empty() {
            bail!("empty requirement in field selector {:?}", s);
        }
        let (path, negated, value) = if let Some((p, v)) = part.split_once("!=") {
            (p, true, v)
        } else if let Some((p, v)) = part.split_once("==") {
            (p, false, v)
        } else if let Some((p, v)) = part.split_once('=') {
            (p, false, v)
        } else {
            bail!("field selector requirement {:?} lacks an operator", part);
        };
        let path = path.trim();
        if path.is_empty() {
            bail!("empty path in field selector {:?}", s);
        }
        out.push(FieldRequirement { path: path.to_string(), negated, value: value.trim().to_string() });
    }
    Ok(out)
}

impl CompiledSelector {
    pub fn compile(spec: &SelectorSpec) -> Result<Self> {
        let labels = match spec.labels.as_deref() {
            Some(s) if !s.is_empty() => parse_label_selector(s)?,
            _ => Vec::new(),
        };
        let fields = match spec.fields.as_deref() {
            Some(s) if !s.is_empty() => parse_field_selector(s)?,
            _ => Vec::new(),
        };
        Ok(Self { labels, fields })
    }

    pub fn matches(&self, obj: &RawObject) -> bool {
        for r in &self.labels {
            let value = meta::labels(obj)
                .and_then(|m| m.get(&r.key))
                .and_then(|v| v.as_str());
            let ok = match r.op {
                LabelOp::Exists => value.is_some(),
                LabelOp::Eq => value == Some(r.value.as_str()),
                LabelOp::Ne => value != Some(r.value.as_str()),
            };
            if !ok {
                return false;
            }
        }
        for r in &self.fields {
            let actual = meta::field_by_path(obj, &r.path).and_then(meta::scalar_to_string);
            let eq = actual.as_deref() == Some(r.value.as_str());
            if eq == r.negated {
                return false;
            }
        }
        true
    }
}

/// The full selector set of one rule: entries ORed, empty set matches all.
#[derive(Debug, Clone, Default)]
pub struct CompiledSelectors {
    entries: Vec<CompiledSelector>,
}

impl CompiledSelectors {
    pub fn compile(specs: &[SelectorSpec]) -> Result<Self> {
        let entries = specs.iter().map(CompiledSelector::compile).collect::<Result<Vec<_>>>()?;
        Ok(Self { entries })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn matches(&self, obj: &RawObject) -> bool {
        self.entries.is_empty() || self.entries.iter().any(|e| e.matches(obj))
    }
}

/// Server-side pushdown: possible only for zero or one selector entry
/// (multiple entries OR, which list options cannot express).
/// Returns `(label_selector, field_selector)` for the transport, or `None`
/// when filtering has to stay client-side.
pub fn server_side(specs: &[SelectorSpec]) -> Option<(Option<String>, Option<String>)> {
    match specs {
        [] => Some((None, None)),
        [one] => Some((one.labels.clone(), one.fields.clone())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pod(labels: serde_json::Value, phase: &str) -> RawObject {
        json!({"metadata": {"name": "p", "labels": labels}, "status": {"phase": phase}})
    }

    #[test]
    fn label_selector_ops() {
        let sel = CompiledSelector::compile(&SelectorSpec {
            labels: Some("app=nginx,tier!=frontend,env".into()),
            fields: None,
        })
        .unwrap();
        assert!(sel.matches(&pod(json!({"app": "nginx", "env": "prod"}), "Running")));
        assert!(!sel.matches(&pod(json!({"app": "nginx", "tier": "frontend", "env": "prod"}), "Running")));
        assert!(!sel.matches(&pod(json!({"app": "nginx"}), "Running")));
        assert!(!sel.matches(&pod(json!({"app": "apache", "env": "prod"}), "Running")));
    }

    #[test]
    fn field_selector_ops() {
        let sel = CompiledSelector::compile(&SelectorSpec {
            labels: None,
            fields: Some("status.phase!=Failed".into()),
        })
        .unwrap();
        assert!(sel.matches(&pod(json!({}), "Running")));
        assert!(!sel.matches(&pod(json!({}), "Failed")));
    }

    #[test]
    fn entries_are_ored() {
        let sels = CompiledSelectors::compile(&[
            SelectorSpec { labels: Some("app=a".into()), fields: None },
            SelectorSpec { labels: Some("app=b".into()), fields: None },
        ])
        .unwrap();
        assert!(sels.matches(&pod(json!({"app": "a"}), "Running")));
        assert!(sels.matches(&pod(json!({"app": "b"}), "Running")));
        assert!(!sels.matches(&pod(json!({"app": "c"}), "Running")));
    }

    #[test]
    fn empty_set_matches_all() {
        let sels = CompiledSelectors::compile(&[]).unwrap();
        assert!(sels.matches(&pod(json!({}), "Running")));
    }

    #[test]
    fn pushdown_only_below_two_entries() {
        assert_eq!(server_side(&[]), Some((None, None)));
        let one = vec![SelectorSpec { labels: Some("a=b".into()), fields: None }];
        assert_eq!(server_side(&one), Some((Some("a=b".into()), None)));
        let two = vec![SelectorSpec::default(), SelectorSpec::default()];
        assert_eq!(server_side(&two), None);
    }

    #[test]
    fn parse_errors_surface() {
        assert!(CompiledSelector::compile(&SelectorSpec { labels: Some(",".into()), fields: None }).is_err());
        assert!(CompiledSelector::compile(&SelectorSpec { labels: None, fields: Some("status.phase".into()) }).is_err());
    }
}
