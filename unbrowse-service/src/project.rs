//! Projection and recipe engine
//!
//! Turns a raw skill response into the shape the caller wants: a source
//! path walk (`data.items[]` flattens arrays), field extraction with
//! aliases, a row limit, plus the stored-recipe refinements (filter,
//! require, compact). Pure over its input.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Equality filter from a stored recipe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecipeFilter {
    pub field: String,
    pub equals: Value,
}

/// A stored extraction recipe or an ad-hoc projection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectionSpec {
    /// Source path, e.g. `data.items[]`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// Field mapping, e.g. `name:user.name,text:text`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extract: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<RecipeFilter>,

    /// Fields that must be non-null and non-empty on every row
    #[serde(skip_serializing_if = "Option::is_none")]
    pub require: Option<Vec<String>>,

    /// Recursively strip null, empty strings, empty arrays, empty objects
    pub compact: bool,
}

impl ProjectionSpec {
    /// True when applying this spec would change nothing
    pub fn is_empty(&self) -> bool {
        self.path.is_none()
            && self.extract.is_none()
            && self.limit.is_none()
            && self.filter.is_none()
            && self.require.is_none()
            && !self.compact
    }
}

/// Apply a projection to a raw result.
pub fn apply_projection(result: &Value, spec: &ProjectionSpec) -> Value {
    let mut current = result.clone();

    if let Some(path) = &spec.path {
        current = walk_path(&current, path).unwrap_or(Value::Null);
    }

    if let Some(extract) = &spec.extract {
        current = apply_extract(&current, extract);
    }

    if let Some(limit) = spec.limit {
        if let Value::Array(items) = &current {
            current = Value::Array(items.iter().take(limit).cloned().collect());
        }
    }

    if let Some(filter) = &spec.filter {
        if let Value::Array(items) = &current {
            current = Value::Array(
                items
                    .iter()
                    .filter(|item| item.get(&filter.field) == Some(&filter.equals))
                    .cloned()
                    .collect(),
            );
        }
    }

    if let Some(required) = &spec.require {
        if let Value::Array(items) = &current {
            current = Value::Array(
                items
                    .iter()
                    .filter(|item| {
                        required.iter().all(|field| {
                            !matches!(
                                item.get(field),
                                None | Some(Value::Null)
                            ) && item.get(field) != Some(&Value::String(String::new()))
                        })
                    })
                    .cloned()
                    .collect(),
            );
        }
    }

    if spec.compact {
        current = compact(&current).unwrap_or(Value::Null);
    }

    current
}

#[derive(Debug, Clone, PartialEq)]
enum Step {
    Field(String),
    Flatten,
}

fn parse_steps(path: &str) -> Vec<Step> {
    let mut steps = Vec::new();
    for token in path.split('.') {
        let mut rest = token;
        let mut flattens = 0;
        while let Some(stripped) = rest.strip_suffix("[]") {
            rest = stripped;
            flattens += 1;
        }
        if !rest.is_empty() {
            steps.push(Step::Field(rest.to_string()));
        }
        for _ in 0..flattens {
            steps.push(Step::Flatten);
        }
    }
    steps
}

/// Walk a source path: fields descend, `[]` flattens the current array and
/// applies the remaining steps to each element, dropping misses.
fn walk_path(value: &Value, path: &str) -> Option<Value> {
    walk_steps(value, &parse_steps(path))
}

fn walk_steps(value: &Value, steps: &[Step]) -> Option<Value> {
    let Some((step, rest)) = steps.split_first() else {
        return Some(value.clone());
    };
    match step {
        Step::Field(name) => walk_steps(value.get(name.as_str())?, rest),
        Step::Flatten => {
            let items = value.as_array()?;
            let nested_flatten = rest.contains(&Step::Flatten);
            let mut out = Vec::new();
            for item in items {
                match walk_steps(item, rest) {
                    None => continue,
                    Some(Value::Array(inner)) if nested_flatten => out.extend(inner),
                    Some(v) => out.push(v),
                }
            }
            Some(Value::Array(out))
        }
    }
}

/// `alias:path,alias:path` -> per-row objects. For arrays, rows where every
/// extracted field is missing are dropped (decorator-pattern APIs mix
/// heterogeneous items in one list).
fn apply_extract(value: &Value, extract: &str) -> Value {
    let fields: Vec<(String, String)> = extract
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .map(|spec| {
            let spec = spec.trim();
            match spec.split_once(':') {
                Some((alias, path)) => (alias.trim().to_string(), path.trim().to_string()),
                None => {
                    let alias = spec.rsplit('.').next().unwrap_or(spec).to_string();
                    (alias, spec.to_string())
                }
            }
        })
        .collect();

    let extract_row = |row: &Value| -> (Value, bool) {
        let mut out = Map::new();
        let mut any_present = false;
        for (alias, path) in &fields {
            let resolved = walk_path(row, path).unwrap_or(Value::Null);
            if !resolved.is_null() {
                any_present = true;
            }
            out.insert(alias.clone(), resolved);
        }
        (Value::Object(out), any_present)
    };

    match value {
        Value::Array(rows) => Value::Array(
            rows.iter()
                .map(|row| extract_row(row))
                .filter(|(_, any)| *any)
                .map(|(row, _)| row)
                .collect(),
        ),
        other => extract_row(other).0,
    }
}

/// Recursively strip null, empty strings, empty arrays, and empty objects.
/// Returns None when the value itself compacts away.
fn compact(value: &Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        Value::Array(items) => {
            let kept: Vec<Value> = items.iter().filter_map(compact).collect();
            if kept.is_empty() {
                None
            } else {
                Some(Value::Array(kept))
            }
        }
        Value::Object(map) => {
            let mut kept = Map::new();
            for (key, child) in map {
                if let Some(child) = compact(child) {
                    kept.insert(key.clone(), child);
                }
            }
            if kept.is_empty() {
                None
            } else {
                Some(Value::Object(kept))
            }
        }
        other => Some(other.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ad_hoc_projection_path_extract_limit() {
        let raw = json!({
            "data": {"items": [
                {"user": {"name": "a"}, "text": "t1"},
                {"user": {"name": "b"}, "text": "t2"}
            ]}
        });
        let spec = ProjectionSpec {
            path: Some("data.items[]".into()),
            extract: Some("name:user.name,text:text".into()),
            limit: Some(1),
            ..Default::default()
        };
        assert_eq!(
            apply_projection(&raw, &spec),
            json!([{"name": "a", "text": "t1"}])
        );
    }

    #[test]
    fn test_path_flattens_nested_arrays() {
        let raw = json!({"pages": [{"rows": [1, 2]}, {"rows": [3]}]});
        let spec = ProjectionSpec {
            path: Some("pages[].rows[]".into()),
            ..Default::default()
        };
        assert_eq!(apply_projection(&raw, &spec), json!([1, 2, 3]));
    }

    #[test]
    fn test_path_drops_missing_branches() {
        let raw = json!({"items": [{"v": 1}, {"other": 2}, {"v": 3}]});
        let spec = ProjectionSpec {
            path: Some("items[].v".into()),
            ..Default::default()
        };
        assert_eq!(apply_projection(&raw, &spec), json!([1, 3]));
    }

    #[test]
    fn test_extract_drops_all_null_rows() {
        // Heterogeneous list: decorator items carry none of the fields.
        let raw = json!([
            {"user": {"name": "a"}},
            {"ad": {"campaign": "x"}},
            {"user": {"name": "b"}}
        ]);
        let spec = ProjectionSpec {
            extract: Some("name:user.name".into()),
            ..Default::default()
        };
        assert_eq!(
            apply_projection(&raw, &spec),
            json!([{"name": "a"}, {"name": "b"}])
        );
    }

    #[test]
    fn test_extract_alias_defaults_to_last_segment() {
        let raw = json!({"user": {"name": "a"}});
        let spec = ProjectionSpec {
            extract: Some("user.name".into()),
            ..Default::default()
        };
        assert_eq!(apply_projection(&raw, &spec), json!({"name": "a"}));
    }

    #[test]
    fn test_filter_and_require() {
        let raw = json!([
            {"kind": "story", "title": "x"},
            {"kind": "job", "title": "y"},
            {"kind": "story", "title": null},
            {"kind": "story", "title": ""}
        ]);
        let spec = ProjectionSpec {
            filter: Some(RecipeFilter {
                field: "kind".into(),
                equals: json!("story"),
            }),
            require: Some(vec!["title".into()]),
            ..Default::default()
        };
        assert_eq!(
            apply_projection(&raw, &spec),
            json!([{"kind": "story", "title": "x"}])
        );
    }

    #[test]
    fn test_compact_strips_empty_values() {
        let raw = json!({
            "keep": "x",
            "n": null,
            "empty": "",
            "arr": [],
            "obj": {},
            "nested": {"a": null, "b": "y"}
        });
        let spec = ProjectionSpec {
            compact: true,
            ..Default::default()
        };
        assert_eq!(
            apply_projection(&raw, &spec),
            json!({"keep": "x", "nested": {"b": "y"}})
        );
    }

    #[test]
    fn test_projection_is_pure() {
        // Same input, same output; the input is never mutated.
        let raw = json!({"data": {"items": [{"user": {"name": "a"}, "text": "t"}]}});
        let spec = ProjectionSpec {
            path: Some("data.items[]".into()),
            extract: Some("name:user.name".into()),
            ..Default::default()
        };
        let first = apply_projection(&raw, &spec);
        let second = apply_projection(&raw, &spec);
        assert_eq!(first, second);
        assert_eq!(raw["data"]["items"][0]["text"], "t");
    }

    #[test]
    fn test_empty_spec_is_identity() {
        let raw = json!({"anything": [1, 2, 3]});
        let spec = ProjectionSpec::default();
        assert!(spec.is_empty());
        assert_eq!(apply_projection(&raw, &spec), raw);
    }
}
