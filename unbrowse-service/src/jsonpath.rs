//! Dot-path addressing for JSON bodies
//!
//! Paths look like `security.tokens[].csrf`: fields separated by dots, `[]`
//! marking "any array item". Used by the correlation engine to address leaves
//! and by the replay preparer to inject values back.

use serde_json::Value;

/// One step of a parsed path
#[derive(Debug, Clone, PartialEq, Eq)]
enum Step {
    Field(String),
    AnyItem,
}

fn parse_path(path: &str) -> Vec<Step> {
    let mut steps = Vec::new();
    for token in path.split('.') {
        let mut rest = token;
        let mut brackets = 0;
        while let Some(stripped) = rest.strip_suffix("[]") {
            rest = stripped;
            brackets += 1;
        }
        if !rest.is_empty() {
            steps.push(Step::Field(rest.to_string()));
        }
        for _ in 0..brackets {
            steps.push(Step::AnyItem);
        }
    }
    steps
}

/// Collect every leaf value (strings and numbers) with its dot path.
///
/// Numbers are stringified: numeric IDs flow between requests as path
/// segments and query values.
pub fn leaves(value: &Value) -> Vec<(String, String)> {
    let mut out = Vec::new();
    collect_leaves(value, String::new(), &mut out);
    out
}

fn collect_leaves(value: &Value, prefix: String, out: &mut Vec<(String, String)>) {
    match value {
        Value::String(s) => out.push((prefix, s.clone())),
        Value::Number(n) => out.push((prefix, n.to_string())),
        Value::Object(map) => {
            for (key, child) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", prefix, key)
                };
                collect_leaves(child, path, out);
            }
        }
        Value::Array(items) => {
            let path = format!("{}[]", prefix);
            for child in items {
                collect_leaves(child, path.clone(), out);
            }
        }
        Value::Bool(_) | Value::Null => {}
    }
}

/// Resolve a path; `[]` tries array items in order, first hit wins.
pub fn resolve<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    resolve_steps(value, &parse_path(path))
}

fn resolve_steps<'a>(value: &'a Value, steps: &[Step]) -> Option<&'a Value> {
    let Some((step, rest)) = steps.split_first() else {
        return Some(value);
    };
    match step {
        Step::Field(name) => resolve_steps(value.get(name.as_str())?, rest),
        Step::AnyItem => value
            .as_array()?
            .iter()
            .find_map(|item| resolve_steps(item, rest)),
    }
}

/// Resolve to a string, stringifying numeric leaves.
pub fn resolve_string(value: &Value, path: &str) -> Option<String> {
    match resolve(value, path)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Set a path to a new value; `[]` applies to every array item carrying the
/// remaining path. Returns true when at least one slot was written.
pub fn set(value: &mut Value, path: &str, new_value: Value) -> bool {
    set_steps(value, &parse_path(path), &new_value)
}

fn set_steps(value: &mut Value, steps: &[Step], new_value: &Value) -> bool {
    let Some((step, rest)) = steps.split_first() else {
        *value = new_value.clone();
        return true;
    };
    match step {
        Step::Field(name) => match value.get_mut(name.as_str()) {
            Some(child) => set_steps(child, rest, new_value),
            None => false,
        },
        Step::AnyItem => match value.as_array_mut() {
            Some(items) => {
                let mut any = false;
                for item in items {
                    any |= set_steps(item, rest, new_value);
                }
                any
            }
            None => false,
        },
    }
}

/// As `set`, but missing object fields are created along the way. Arrays are
/// never invented. Used for nested injection into JSON-in-query values.
pub fn set_creating(value: &mut Value, path: &str, new_value: Value) -> bool {
    set_creating_steps(value, &parse_path(path), &new_value)
}

fn set_creating_steps(value: &mut Value, steps: &[Step], new_value: &Value) -> bool {
    let Some((step, rest)) = steps.split_first() else {
        *value = new_value.clone();
        return true;
    };
    match step {
        Step::Field(name) => {
            if value.is_null() {
                *value = Value::Object(serde_json::Map::new());
            }
            match value.as_object_mut() {
                Some(map) => {
                    let child = map.entry(name.clone()).or_insert(Value::Null);
                    set_creating_steps(child, rest, new_value)
                }
                None => false,
            }
        }
        Step::AnyItem => match value.as_array_mut() {
            Some(items) => {
                let mut any = false;
                for item in items {
                    any |= set_creating_steps(item, rest, new_value);
                }
                any
            }
            None => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_leaves_cover_strings_and_numbers() {
        let value = json!({"id": 11111111, "user": {"name": "alice"}, "tags": ["a", "b"], "ok": true});
        let mut got = leaves(&value);
        got.sort();
        assert_eq!(
            got,
            vec![
                ("id".to_string(), "11111111".to_string()),
                ("tags[]".to_string(), "a".to_string()),
                ("tags[]".to_string(), "b".to_string()),
                ("user.name".to_string(), "alice".to_string()),
            ]
        );
    }

    #[test]
    fn test_leaves_of_top_level_array() {
        let value = json!([11111111, 22222222]);
        let got = leaves(&value);
        assert_eq!(got[0], ("[]".to_string(), "11111111".to_string()));
        assert_eq!(got[1], ("[]".to_string(), "22222222".to_string()));
    }

    #[test]
    fn test_resolve_with_array_wildcard() {
        let value = json!({"items": [{"id": "a"}, {"id": "b", "extra": 1}]});
        assert_eq!(resolve_string(&value, "items[].id").as_deref(), Some("a"));
        assert_eq!(resolve_string(&value, "items[].extra").as_deref(), Some("1"));
        assert_eq!(resolve_string(&value, "items[].missing"), None);
        assert_eq!(resolve_string(&value, "[]"), None);
    }

    #[test]
    fn test_resolve_top_level_array() {
        let value = json!([5, 6]);
        assert_eq!(resolve_string(&value, "[]").as_deref(), Some("5"));
    }

    #[test]
    fn test_set_nested_and_wildcard() {
        let mut value = json!({"a": {"b": "old"}, "items": [{"v": 1}, {"v": 2}, {"other": 3}]});
        assert!(set(&mut value, "a.b", json!("new")));
        assert_eq!(value["a"]["b"], "new");

        assert!(set(&mut value, "items[].v", json!(9)));
        assert_eq!(value["items"][0]["v"], 9);
        assert_eq!(value["items"][1]["v"], 9);
        assert_eq!(value["items"][2], json!({"other": 3}));

        assert!(!set(&mut value, "missing.path", json!(0)));
    }

    #[test]
    fn test_set_creating_builds_missing_objects() {
        let mut value = json!({});
        assert!(set_creating(&mut value, "filter.userId", json!("u1")));
        assert_eq!(value, json!({"filter": {"userId": "u1"}}));

        // Existing scalars are not clobbered into objects.
        let mut value = json!({"filter": 3});
        assert!(!set_creating(&mut value, "filter.userId", json!("u1")));
    }
}
