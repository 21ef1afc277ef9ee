//! Argus transform/trim pipeline.
//!
//! Transformers are named functions driven by a text template rendered per
//! object. Template compilation happens once per rule and a compile failure
//! is fatal to starting that rule's syncer; per-object render or apply
//! failures are logged and the object passes through unchanged, so one bad
//! object never blocks the pipeline.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use argus_core::{rule::TransformSpec, RawObject};
use handlebars::{
    Context, Handlebars, Helper, HelperDef, RenderContext, RenderError, RenderErrorReason,
    ScopedJson,
};
use serde_json::Value;
use tracing::warn;

mod trim;

pub use trim::Trimmer;

#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("unknown transformer {0:?}")]
    UnknownTransformer(String),
    #[error("template compile: {0}")]
    TemplateCompile(String),
    #[error("template render: {0}")]
    Render(String),
    #[error("apply: {0}")]
    Apply(String),
}

/// Cross-object lookup a cluster injects into its templates: resolves
/// `(apiVersion, kind, namespace, name)` against objects currently cached
/// for that cluster.
pub type ClusterObjectLookup =
    Arc<dyn Fn(&str, &str, Option<&str>, &str) -> Option<RawObject> + Send + Sync>;

/// One registered transform function: `(original, rendered_text) -> target`.
pub type TransformFunc = fn(&RawObject, &str) -> Result<RawObject, TransformError>;

/// Closed set of named transformers, dispatched by the rule's `type`.
pub struct TransformRegistry {
    funcs: HashMap<&'static str, TransformFunc>,
}

impl Default for TransformRegistry {
    fn default() -> Self {
        let mut funcs: HashMap<&'static str, TransformFunc> = HashMap::new();
        funcs.insert("patch", apply_merge_patch);
        funcs.insert("replace", replace_object);
        Self { funcs }
    }
}

impl TransformRegistry {
    pub fn get(&self, name: &str) -> Result<TransformFunc, TransformError> {
        self.funcs
            .get(name)
            .copied()
            .ok_or_else(|| TransformError::UnknownTransformer(name.to_string()))
    }
}

/// Apply the rendered text as a merge patch document: maps merge
/// recursively, explicit nulls delete, everything else replaces.
fn apply_merge_patch(original: &RawObject, rendered: &str) -> Result<RawObject, TransformError> {
    let patch: Value = serde_json::from_str(rendered)
        .map_err(|e| TransformError::Apply(format!("patch document is not valid JSON: {e}")))?;
    Ok(merge_patch(original.clone(), patch))
}

fn merge_patch(target: Value, patch: Value) -> Value {
    match patch {
        Value::Object(patch) => {
            let mut map = match target {
                Value::Object(map) => map,
                _ => serde_json::Map::new(),
            };
            for (k, v) in patch {
                if v.is_null() {
                    map.remove(&k);
                } else {
                    let base = map.remove(&k).unwrap_or(Value::Null);
                    map.insert(k, merge_patch(base, v));
                }
            }
            Value::Object(map)
        }
        other => other,
    }
}

/// Decode the rendered text directly as the new object.
fn replace_object(_original: &RawObject, rendered: &str) -> Result<RawObject, TransformError> {
    serde_json::from_str(rendered)
        .map_err(|e| TransformError::Apply(format!("replacement is not valid JSON: {e}")))
}

const TEMPLATE_NAME: &str = "transform";

/// `objectRef apiVersion kind namespace name`: dereference another object
/// already being synced in the same cluster; renders as null when absent.
struct ObjectRefHelper {
    lookup: ClusterObjectLookup,
}

impl HelperDef for ObjectRefHelper {
    fn call_inner<'reg: 'rc, 'rc>(
        &self,
        h: &Helper<'rc>,
        _: &'reg Handlebars<'reg>,
        _: &'rc Context,
        _: &mut RenderContext<'reg, 'rc>,
    ) -> Result<ScopedJson<'rc>, RenderError> {
        let arg = |i: usize| -> Result<&str, RenderError> {
            h.param(i)
                .and_then(|p| p.value().as_str())
                .ok_or_else(|| RenderErrorReason::ParamNotFoundForIndex("objectRef", i).into())
        };
        let api_version = arg(0)?;
        let kind = arg(1)?;
        let namespace = arg(2)?;
        let name = arg(3)?;
        let namespace = if namespace.is_empty() { None } else { Some(namespace) };
        let resolved = (self.lookup)(api_version, kind, namespace, name).unwrap_or(Value::Null);
        Ok(ScopedJson::Derived(resolved))
    }
}

handlebars::handlebars_helper!(JsonHelper: |v: Json| v.to_string());

/// A rule's compiled transform: one template plus one named function.
pub struct Transformer {
    registry: Handlebars<'static>,
    func: TransformFunc,
    func_name: String,
    cluster: String,
}

impl Transformer {
    /// Compile a transform spec for one cluster. Errors here are
    /// configuration errors and fatal to starting the rule's syncer.
    pub fn compile(
        cluster: &str,
        spec: &TransformSpec,
        lookup: Option<ClusterObjectLookup>,
        funcs: &TransformRegistry,
    ) -> Result<Self, TransformError> {
        let func = funcs.get(&spec.kind)?;
        let mut registry = Handlebars::new();
        // Templates emit JSON, not HTML.
        registry.register_escape_fn(handlebars::no_escape);
        registry.register_helper("json", Box::new(JsonHelper));
        if let Some(lookup) = lookup {
            registry.register_helper("objectRef", Box::new(ObjectRefHelper { lookup }));
        }
        registry
            .register_template_string(TEMPLATE_NAME, &spec.template)
            .map_err(|e| TransformError::TemplateCompile(e.to_string()))?;
        Ok(Self { registry, func, func_name: spec.kind.clone(), cluster: cluster.to_string() })
    }

    fn render_and_apply(&self, obj: &RawObject) -> Result<RawObject, TransformError> {
        let ctx = serde_json::json!({ "object": obj, "cluster": self.cluster });
        let rendered = self
            .registry
            .render(TEMPLATE_NAME, &ctx)
            .map_err(|e| TransformError::Render(e.to_string()))?;
        (self.func)(obj, &rendered)
    }

    /// Render and apply; on failure the original passes through unchanged.
    pub fn apply(&self, obj: &RawObject) -> RawObject {
        match self.render_and_apply(obj) {
            Ok(out) => out,
            Err(e) => {
                warn!(
                    cluster = %self.cluster,
                    transformer = %self.func_name,
                    error = %e,
                    "transform failed; object passes through untransformed"
                );
                obj.clone()
            }
        }
    }
}
