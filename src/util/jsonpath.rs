//! Dotted-path resolution over `serde_json::Value`.
//!
//! Supports `a.b.c` key traversal and `a.0` / `a[0]` numeric-index
//! traversal into arrays, mirroring the nested-path walk the expression
//! layer performs when resolving `a.b.c` identifiers against a scope.

use serde_json::Value;

/// Resolve a dotted path against a JSON value. Each segment is either a
/// map key or, if the current value is an array and the segment parses
/// as an integer, an index.
pub fn resolve<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for raw_segment in path.split('.') {
        let segment = raw_segment
            .trim_end_matches(']')
            .split('[')
            .next()
            .unwrap_or(raw_segment);
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => {
                let idx: usize = segment.parse().ok()?;
                items.get(idx)?
            }
            _ => return None,
        };
        // Handle a trailing `[n]` index suffix on the same segment, e.g. `xs[0]`.
        if let Some(bracket) = raw_segment.find('[') {
            let idx_str = &raw_segment[bracket + 1..raw_segment.len() - 1];
            if let Ok(idx) = idx_str.parse::<usize>() {
                if let Value::Array(items) = current {
                    current = items.get(idx)?;
                }
            }
        }
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resolves_nested_keys() {
        let v = json!({"a": {"b": {"c": 42}}});
        assert_eq!(resolve(&v, "a.b.c"), Some(&json!(42)));
    }

    #[test]
    fn resolves_array_index_by_dot() {
        let v = json!({"a": [10, 20, 30]});
        assert_eq!(resolve(&v, "a.1"), Some(&json!(20)));
    }

    #[test]
    fn resolves_array_index_by_bracket() {
        let v = json!({"a": [10, 20, 30]});
        assert_eq!(resolve(&v, "a[2]"), Some(&json!(30)));
    }

    #[test]
    fn missing_path_resolves_to_none() {
        let v = json!({"a": 1});
        assert_eq!(resolve(&v, "a.b"), None);
        assert_eq!(resolve(&v, "z"), None);
    }
}
