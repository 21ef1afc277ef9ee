//! Fragment merge: maps merge recursively, lists are replaced wholesale by
//! the later fragment, scalars are overwritten by the later fragment.

use serde_json::Value;

/// Merge an ordered list of fragments into one object.
/// An empty list merges to the empty object.
pub fn merge<I>(fragments: I) -> Value
where
    I: IntoIterator<Item = Value>,
{
    let mut acc = Value::Object(serde_json::Map::new());
    for frag in fragments {
        acc = merge_values(acc, frag);
    }
    acc
}

fn merge_values(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut a), Value::Object(b)) => {
            for (k, v) in b {
                let merged = match a.remove(&k) {
                    Some(prev) => merge_values(prev, v),
                    None => v,
                };
                a.insert(k, merged);
            }
            Value::Object(a)
        }
        // Lists are never deep-merged; scalars always yield to the overlay.
        (_, overlay) => overlay,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn nested_maps_merge_recursively() {
        let a = json!({"metadata": {"name": "x"}});
        let b = json!({"metadata": {"labels": {"app": "web"}}});
        assert_eq!(
            merge(vec![a, b]),
            json!({"metadata": {"name": "x", "labels": {"app": "web"}}})
        );
    }

    #[test]
    fn lists_replaced_wholesale() {
        let a = json!({"spec": {"containers": [{"name": "a"}, {"name": "b"}]}});
        let b = json!({"spec": {"containers": [{"image": "z"}]}});
        assert_eq!(merge(vec![a, b]), json!({"spec": {"containers": [{"image": "z"}]}}));
    }

    #[test]
    fn scalars_overwritten_by_later() {
        let a = json!({"kind": "Pod"});
        let b = json!({"kind": "Deployment"});
        assert_eq!(merge(vec![a, b]), json!({"kind": "Deployment"}));
    }

    #[test]
    fn empty_input_is_empty_object() {
        assert_eq!(merge(Vec::<Value>::new()), json!({}));
    }

    #[test]
    fn merge_is_idempotent_per_fragment() {
        let a = json!({"metadata": {"labels": {"x": "1"}}});
        let once = merge(vec![a.clone()]);
        let twice = merge(vec![a.clone(), a]);
        assert_eq!(once, twice);
    }
}
