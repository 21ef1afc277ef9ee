//! General expression evaluator.
//!
//! Evaluation walks the object collecting `(trace, value)` matches, where a
//! trace is the concrete key/index path to the match; the fragment is then
//! rebuilt from the traces so upstream structure is preserved and array
//! positions stay in document order (compacted, not padded).

use serde_json::Value;
use std::collections::BTreeMap;

use crate::parse::{PredOp, PredValue, Predicate, Segment};
use crate::FieldPathError;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Step {
    Key(String),
    Index(usize),
}

pub(crate) fn extract(root: &Value, segs: &[Segment]) -> Result<Option<Value>, FieldPathError> {
    let mut matches: Vec<(Vec<Step>, &Value)> = Vec::new();
    let mut trace = Vec::new();
    walk(root, segs, &mut trace, &mut matches)?;
    if matches.is_empty() {
        return Ok(None);
    }
    Ok(Some(rebuild(matches)))
}

fn walk<'a>(
    v: &'a Value,
    segs: &[Segment],
    trace: &mut Vec<Step>,
    out: &mut Vec<(Vec<Step>, &'a Value)>,
) -> Result<(), FieldPathError> {
    let Some((seg, rest)) = segs.split_first() else {
        out.push((trace.clone(), v));
        return Ok(());
    };
    match seg {
        Segment::Field(name) => {
            if let Some(child) = v.as_object().and_then(|m| m.get(name)) {
                trace.push(Step::Key(name.clone()));
                walk(child, rest, trace, out)?;
                trace.pop();
            }
        }
        Segment::Union(names) => {
            for name in names {
                if let Some(child) = v.as_object().and_then(|m| m.get(name)) {
                    trace.push(Step::Key(name.clone()));
                    walk(child, rest, trace, out)?;
                    trace.pop();
                }
            }
        }
        Segment::Wildcard => match v {
            Value::Object(map) => {
                for (k, child) in map {
                    trace.push(Step::Key(k.clone()));
                    walk(child, rest, trace, out)?;
                    trace.pop();
                }
            }
            Value::Array(arr) => {
                for (i, child) in arr.iter().enumerate() {
                    trace.push(Step::Index(i));
                    walk(child, rest, trace, out)?;
                    trace.pop();
                }
            }
            _ => {}
        },
        Segment::Descent => {
            walk(v, rest, trace, out)?;
            match v {
                Value::Object(map) => {
                    for (k, child) in map {
                        trace.push(Step::Key(k.clone()));
                        walk(child, segs, trace, out)?;
                        trace.pop();
                    }
                }
                Value::Array(arr) => {
                    for (i, child) in arr.iter().enumerate() {
                        trace.push(Step::Index(i));
                        walk(child, segs, trace, out)?;
                        trace.pop();
                    }
                }
                _ => {}
            }
        }
        Segment::Index(raw) => {
            if let Some(arr) = v.as_array() {
                let idx = resolve_index(*raw, arr.len())?;
                trace.push(Step::Index(idx));
                walk(&arr[idx], rest, trace, out)?;
                trace.pop();
            }
        }
        Segment::Slice { start, end, step } => {
            if let Some(arr) = v.as_array() {
                for idx in resolve_slice(*start, *end, *step, arr.len())? {
                    trace.push(Step::Index(idx));
                    walk(&arr[idx], rest, trace, out)?;
                    trace.pop();
                }
            }
        }
        Segment::Filter(pred) => {
            if let Some(arr) = v.as_array() {
                for (i, el) in arr.iter().enumerate() {
                    if eval_predicate(el, pred) {
                        trace.push(Step::Index(i));
                        walk(el, rest, trace, out)?;
                        trace.pop();
                    }
                }
            }
        }
        // The parser only emits Ranged last; the matched prefix element is
        // the current value, so the body simply continues from here.
        Segment::Ranged(inner) => {
            walk(v, inner, trace, out)?;
        }
    }
    Ok(())
}

fn resolve_index(raw: i64, len: usize) -> Result<usize, FieldPathError> {
    let idx = if raw < 0 { raw + len as i64 } else { raw };
    if idx < 0 || idx >= len as i64 {
        return Err(FieldPathError::OutOfBounds { index: raw, len });
    }
    Ok(idx as usize)
}

fn resolve_slice(
    start: Option<i64>,
    end: Option<i64>,
    step: Option<i64>,
    len: usize,
) -> Result<Vec<usize>, FieldPathError> {
    let step = step.unwrap_or(1);
    if step <= 0 {
        return Err(FieldPathError::BadStep(step));
    }
    let wrap = |e: i64| if e < 0 { e + len as i64 } else { e };
    let s = start.map(wrap).unwrap_or(0);
    let e = end.map(wrap).unwrap_or(len as i64);
    if s > e {
        return Err(FieldPathError::BadSlice { start: s, end: e });
    }
    if s < 0 || e > len as i64 {
        return Err(FieldPathError::OutOfBounds { index: if s < 0 { s } else { e }, len });
    }
    Ok((s..e).step_by(step as usize).map(|x| x as usize).collect())
}

fn lookup<'a>(el: &'a Value, path: &[String]) -> Option<&'a Value> {
    let mut cur = el;
    for p in path {
        cur = cur.as_object()?.get(p)?;
    }
    Some(cur)
}

fn eval_predicate(el: &Value, pred: &Predicate) -> bool {
    let lhs = lookup(el, &pred.path);
    match pred.op {
        PredOp::Exists => lhs.is_some(),
        op => {
            let Some(lhs) = lhs else { return false };
            match &pred.value {
                PredValue::Num(rhs) => {
                    let Some(l) = lhs.as_f64() else { return false };
                    cmp(l.partial_cmp(rhs), op)
                }
                PredValue::Str(rhs) => {
                    let Some(l) = lhs.as_str() else { return false };
                    cmp(l.partial_cmp(rhs.as_str()), op)
                }
                PredValue::Bool(rhs) => match op {
                    PredOp::Eq => lhs.as_bool() == Some(*rhs),
                    PredOp::Ne => lhs.as_bool().is_some() && lhs.as_bool() != Some(*rhs),
                    _ => false,
                },
                PredValue::None => false,
            }
        }
    }
}

fn cmp(ord: Option<std::cmp::Ordering>, op: PredOp) -> bool {
    use std::cmp::Ordering::*;
    let Some(ord) = ord else { return false };
    match op {
        PredOp::Eq => ord == Equal,
        PredOp::Ne => ord != Equal,
        PredOp::Lt => ord == Less,
        PredOp::Le => ord != Greater,
        PredOp::Gt => ord == Greater,
        PredOp::Ge => ord != Less,
        PredOp::Exists => true,
    }
}

// ---- fragment rebuild ----

enum Node {
    Map(BTreeMap<String, Node>),
    Arr(BTreeMap<usize, Node>),
    Leaf(Value),
}

fn insert(node: &mut Node, steps: &[Step], value: &Value) {
    let Some((step, rest)) = steps.split_first() else {
        // Keep structure accumulated from longer traces over a leaf copy.
        if matches!(node, Node::Leaf(_)) {
            *node = Node::Leaf(value.clone());
        }
        return;
    };
    match step {
        Step::Key(k) => {
            if !matches!(node, Node::Map(_)) {
                *node = Node::Map(BTreeMap::new());
            }
            if let Node::Map(map) = node {
                let child = map.entry(k.clone()).or_insert_with(|| Node::Leaf(Value::Null));
                insert(child, rest, value);
            }
        }
        Step::Index(i) => {
            if !matches!(node, Node::Arr(_)) {
                *node = Node::Arr(BTreeMap::new());
            }
            if let Node::Arr(arr) = node {
                let child = arr.entry(*i).or_insert_with(|| Node::Leaf(Value::Null));
                insert(child, rest, value);
            }
        }
    }
}

fn to_value(node: Node) -> Value {
    match node {
        Node::Leaf(v) => v,
        Node::Map(map) => {
            let mut out = serde_json::Map::new();
            for (k, child) in map {
                out.insert(k, to_value(child));
            }
            Value::Object(out)
        }
        // Compacted: matched elements in document order, holes dropped.
        Node::Arr(arr) => Value::Array(arr.into_values().map(to_value).collect()),
    }
}

fn rebuild(matches: Vec<(Vec<Step>, &Value)>) -> Value {
    let mut root = Node::Leaf(Value::Null);
    for (trace, value) in &matches {
        insert(&mut root, trace, value);
    }
    to_value(root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::parse;
    use serde_json::json;

    fn run(expr: &str, obj: &Value) -> Result<Option<Value>, FieldPathError> {
        extract(obj, &parse(expr).unwrap())
    }

    #[test]
    fn slice_wraparound_and_errors() {
        let obj = json!({"a": [10, 20, 30, 40]});
        assert_eq!(run(".a[1:3]", &obj).unwrap(), Some(json!({"a": [20, 30]})));
        assert_eq!(run(".a[-1]", &obj).unwrap(), Some(json!({"a": [40]})));
        assert_eq!(run(".a[-2:]", &obj).unwrap(), Some(json!({"a": [30, 40]})));
        assert_eq!(run(".a[::2]", &obj).unwrap(), Some(json!({"a": [10, 30]})));
        assert!(matches!(run(".a[7]", &obj), Err(FieldPathError::OutOfBounds { .. })));
        assert!(matches!(run(".a[3:1]", &obj), Err(FieldPathError::BadSlice { .. })));
        assert!(matches!(run(".a[0:9]", &obj), Err(FieldPathError::OutOfBounds { .. })));
    }

    #[test]
    fn filter_predicates() {
        let obj = json!({"items": [
            {"name": "a", "phase": "Running", "restarts": 0},
            {"name": "b", "phase": "Failed", "restarts": 3},
            {"name": "c", "phase": "Running", "restarts": 5, "note": "flaky"}
        ]});
        assert_eq!(
            run(".items[?(@.phase=='Running')].name", &obj).unwrap(),
            Some(json!({"items": [{"name": "a"}, {"name": "c"}]}))
        );
        assert_eq!(
            run(".items[?(@.restarts>2)].name", &obj).unwrap(),
            Some(json!({"items": [{"name": "b"}, {"name": "c"}]}))
        );
        assert_eq!(
            run(".items[?(@.note)].name", &obj).unwrap(),
            Some(json!({"items": [{"name": "c"}]}))
        );
        assert_eq!(run(".items[?(@.phase=='Pending')].name", &obj).unwrap(), None);
    }

    #[test]
    fn recursive_descent_collects_all_depths() {
        let obj = json!({
            "name": "top",
            "child": {"name": "mid", "leaf": {"name": "deep"}}
        });
        let out = run("..name", &obj).unwrap().unwrap();
        assert_eq!(
            out,
            json!({"name": "top", "child": {"name": "mid", "leaf": {"name": "deep"}}})
        );
    }

    #[test]
    fn union_merges_shallowly() {
        let obj = json!({"metadata": {"name": "x", "namespace": "ns", "labels": {"a": "1"}}});
        let out = run(".metadata['name','namespace']", &obj).unwrap().unwrap();
        assert_eq!(out, json!({"metadata": {"name": "x", "namespace": "ns"}}));
    }

    #[test]
    fn range_concatenates_per_element() {
        let obj = json!({"spec": {"containers": [
            {"name": "a", "ports": [{"port": 80}]},
            {"name": "b", "ports": [{"port": 443}]}
        ]}});
        let out = run("{range .spec.containers[*]}{.name}{end}", &obj).unwrap().unwrap();
        assert_eq!(out, json!({"spec": {"containers": [{"name": "a"}, {"name": "b"}]}}));
    }

    #[test]
    fn wildcard_over_map_values() {
        let obj = json!({"data": {"k1": "v1", "k2": "v2"}});
        let out = run(".data.*", &obj).unwrap().unwrap();
        assert_eq!(out, json!({"data": {"k1": "v1", "k2": "v2"}}));
    }
}
