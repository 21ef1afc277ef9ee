//! Argus field path expressions.
//!
//! A path expression selects parts of a JSON object and yields them as a
//! *fragment*: the selected values together with their full upstream
//! structure, so `.spec.containers[*].name` extracts
//! `{"spec":{"containers":[{"name":...}]}}` and fragments from independent
//! expressions can be merged without any path bookkeeping.
//!
//! Two strategies back [`FieldPath::extract`]: pure map-key chains
//! (`metadata.labels.name`) walk maps directly; anything with wildcards,
//! recursive descent, slices, filters, unions, or `range…end` goes through
//! the general evaluator.

#![forbid(unsafe_code)]

mod eval;
mod merge;
mod parse;

pub use merge::merge;

use parse::Segment;

#[derive(Debug, thiserror::Error)]
pub enum FieldPathError {
    #[error("parse error in {expr:?}: {msg}")]
    Parse { expr: String, msg: String },
    #[error("index {index} out of bounds for array of length {len}")]
    OutOfBounds { index: i64, len: usize },
    #[error("bad slice: start {start} greater than end {end}")]
    BadSlice { start: i64, end: i64 },
    #[error("bad slice step {0}")]
    BadStep(i64),
    #[error("path {expr:?} resolved nothing")]
    Unresolved { expr: String },
}

#[derive(Debug, Clone)]
enum Strategy {
    /// Pure sequence of map-key accesses.
    Nested(Vec<String>),
    /// Everything else.
    Expr(Vec<Segment>),
}

/// One compiled path expression.
#[derive(Debug, Clone)]
pub struct FieldPath {
    source: String,
    strategy: Strategy,
}

impl FieldPath {
    pub fn parse(expr: &str) -> Result<Self, FieldPathError> {
        let segments = parse::parse(expr)?;
        let nested = segments
            .iter()
            .map(|s| match s {
                Segment::Field(f) => Some(f.clone()),
                _ => None,
            })
            .collect::<Option<Vec<_>>>();
        let strategy = match nested {
            Some(fields) if !fields.is_empty() => Strategy::Nested(fields),
            _ => Strategy::Expr(segments),
        };
        Ok(Self { source: expr.to_string(), strategy })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// True when the fast nested-field extractor backs this expression.
    pub fn is_nested(&self) -> bool {
        matches!(self.strategy, Strategy::Nested(_))
    }

    /// Extract the fragment this expression selects, with upstream
    /// structure. `Ok(None)` when nothing matched.
    pub fn extract(&self, obj: &serde_json::Value) -> Result<Option<serde_json::Value>, FieldPathError> {
        match &self.strategy {
            Strategy::Nested(fields) => Ok(extract_nested(obj, fields)),
            Strategy::Expr(segments) => eval::extract(obj, segments),
        }
    }
}

fn extract_nested(obj: &serde_json::Value, fields: &[String]) -> Option<serde_json::Value> {
    let mut cur = obj;
    for f in fields {
        cur = cur.as_object()?.get(f)?;
    }
    let mut out = cur.clone();
    for f in fields.iter().rev() {
        let mut map = serde_json::Map::new();
        map.insert(f.clone(), out);
        out = serde_json::Value::Object(map);
    }
    Some(out)
}

/// Extract every path and merge the fragments into one object.
///
/// With `allow_missing` unset, any expression that resolves nothing is a
/// hard error; set, unresolved sub-paths are simply omitted.
pub fn extract_all(
    paths: &[FieldPath],
    obj: &serde_json::Value,
    allow_missing: bool,
) -> Result<serde_json::Value, FieldPathError> {
    let mut fragments = Vec::with_capacity(paths.len());
    for p in paths {
        match p.extract(obj)? {
            Some(frag) => fragments.push(frag),
            None if allow_missing => {}
            None => return Err(FieldPathError::Unresolved { expr: p.source.clone() }),
        }
    }
    Ok(merge(fragments))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn extract(expr: &str, obj: &serde_json::Value) -> Option<serde_json::Value> {
        FieldPath::parse(expr).unwrap().extract(obj).unwrap()
    }

    #[test]
    fn strategy_selection() {
        assert!(FieldPath::parse("metadata.labels.name").unwrap().is_nested());
        assert!(FieldPath::parse(".spec.replicas").unwrap().is_nested());
        assert!(!FieldPath::parse(".spec.containers[*].name").unwrap().is_nested());
        assert!(!FieldPath::parse("..name").unwrap().is_nested());
    }

    #[test]
    fn nested_and_general_agree_on_plain_paths() {
        let obj = json!({"metadata": {"labels": {"name": "pause", "app": "pause"}}});
        let fast = extract("metadata.labels.name", &obj);
        // Force the general evaluator with an equivalent union form.
        let slow = extract("metadata.labels['name']", &obj);
        assert_eq!(fast, slow);
        assert_eq!(fast, Some(json!({"metadata": {"labels": {"name": "pause"}}})));
    }

    #[test]
    fn trim_scenario_from_two_paths() {
        let obj = json!({
            "kind": "Pod",
            "metadata": {"labels": {"name": "pause", "app": "pause"}},
            "spec": {"containers": [{"name": "pause", "image": "pause:3.9"}]}
        });
        let paths = vec![
            FieldPath::parse("kind").unwrap(),
            FieldPath::parse("metadata.labels.name").unwrap(),
        ];
        let out = extract_all(&paths, &obj, false).unwrap();
        assert_eq!(out, json!({"kind": "Pod", "metadata": {"labels": {"name": "pause"}}}));
    }

    #[test]
    fn wildcard_keeps_upstream_structure() {
        let obj = json!({"spec": {"containers": [
            {"name": "a", "image": "x"},
            {"name": "b", "image": "y"}
        ]}});
        let out = extract(".spec.containers[*].name", &obj);
        assert_eq!(out, Some(json!({"spec": {"containers": [{"name": "a"}, {"name": "b"}]}})));
    }

    #[test]
    fn missing_path_behavior() {
        let obj = json!({"kind": "Pod"});
        let paths = vec![FieldPath::parse("spec.replicas").unwrap()];
        assert!(extract_all(&paths, &obj, false).is_err());
        assert_eq!(extract_all(&paths, &obj, true).unwrap(), json!({}));
    }

    #[test]
    fn disjoint_fragments_union_roundtrip() {
        let obj = json!({
            "kind": "Pod",
            "metadata": {"name": "x", "labels": {"a": "1"}},
            "spec": {"nodeName": "n1", "hostNetwork": true}
        });
        let a = extract("metadata.name", &obj).unwrap();
        let b = extract("spec.nodeName", &obj).unwrap();
        let merged = merge(vec![a.clone(), b.clone()]);
        assert_eq!(merged, json!({"metadata": {"name": "x"}, "spec": {"nodeName": "n1"}}));
        // Idempotent: merging a fragment twice changes nothing.
        assert_eq!(merge(vec![a.clone(), b, a]), merged);
    }
}
