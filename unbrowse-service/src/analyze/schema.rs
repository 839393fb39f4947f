//! Lightweight body schema inference
//!
//! Endpoint documentation needs field-to-type maps and one-line shape
//! summaries, not full JSON Schema. Conflicting samples collapse to the more
//! general tag.

use serde_json::Value;
use std::collections::BTreeMap;

/// Parse JSON without ever panicking or erroring
pub fn safe_parse_json(text: &str) -> Option<Value> {
    serde_json::from_str(text.trim()).ok()
}

fn type_tag(value: &Value) -> &'static str {
    match value {
        Value::String(_) => "string",
        Value::Number(_) => "number",
        Value::Bool(_) => "boolean",
        Value::Null => "null",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn merge_tag(a: &str, b: &str) -> &'static str {
    match (a, b) {
        (a, b) if a == b => leak_tag(a),
        ("null", other) | (other, "null") => leak_tag(other),
        // Any remaining scalar or container conflict widens to string.
        _ => "string",
    }
}

fn leak_tag(tag: &str) -> &'static str {
    match tag {
        "string" => "string",
        "number" => "number",
        "boolean" => "boolean",
        "null" => "null",
        "array" => "array",
        _ => "object",
    }
}

/// Infer a field-name to type-tag map from one or more body samples.
///
/// Non-object samples contribute nothing; array samples contribute the
/// fields of their object elements.
pub fn infer_schema<'a, I>(samples: I) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = &'a Value>,
{
    let mut schema: BTreeMap<String, String> = BTreeMap::new();
    for sample in samples {
        let objects: Vec<&serde_json::Map<String, Value>> = match sample {
            Value::Object(map) => vec![map],
            Value::Array(items) => items
                .iter()
                .filter_map(|v| v.as_object())
                .collect(),
            _ => Vec::new(),
        };
        for object in objects {
            for (field, value) in object {
                let tag = type_tag(value);
                schema
                    .entry(field.clone())
                    .and_modify(|existing| *existing = merge_tag(existing, tag).to_string())
                    .or_insert_with(|| tag.to_string());
            }
        }
    }
    schema
}

/// Human-readable shape string, e.g. `array[2]<object{id,name}>`
pub fn summarize_body(value: &Value) -> String {
    const MAX_KEYS: usize = 6;
    match value {
        Value::Array(items) => match items.first() {
            Some(first) => format!("array[{}]<{}>", items.len(), summarize_body(first)),
            None => "array[0]".to_string(),
        },
        Value::Object(map) => {
            let mut keys: Vec<&str> = map.keys().map(|k| k.as_str()).take(MAX_KEYS).collect();
            if map.len() > MAX_KEYS {
                keys.push("..");
            }
            format!("object{{{}}}", keys.join(","))
        }
        other => type_tag(other).to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_safe_parse_json_never_errors() {
        assert_eq!(safe_parse_json("{\"a\": 1}"), Some(json!({"a": 1})));
        assert_eq!(safe_parse_json("  [1,2] "), Some(json!([1, 2])));
        assert_eq!(safe_parse_json("not json"), None);
        assert_eq!(safe_parse_json(""), None);
    }

    #[test]
    fn test_infer_schema_single_sample() {
        let sample = json!({"id": "abc", "count": 3, "active": true, "tags": [], "meta": {}});
        let schema = infer_schema([&sample]);
        assert_eq!(schema["id"], "string");
        assert_eq!(schema["count"], "number");
        assert_eq!(schema["active"], "boolean");
        assert_eq!(schema["tags"], "array");
        assert_eq!(schema["meta"], "object");
    }

    #[test]
    fn test_infer_schema_widens_conflicts() {
        let a = json!({"id": 1, "note": null});
        let b = json!({"id": "two", "note": "hi"});
        let schema = infer_schema([&a, &b]);
        assert_eq!(schema["id"], "string", "number+string widens to string");
        assert_eq!(schema["note"], "string", "null defers to the observed type");
    }

    #[test]
    fn test_infer_schema_all_null_stays_null() {
        let a = json!({"gone": null});
        let b = json!({"gone": null});
        let schema = infer_schema([&a, &b]);
        assert_eq!(schema["gone"], "null");
    }

    #[test]
    fn test_infer_schema_array_of_objects() {
        let sample = json!([{"id": 1}, {"id": 2, "name": "x"}]);
        let schema = infer_schema([&sample]);
        assert_eq!(schema["id"], "number");
        assert_eq!(schema["name"], "string");
    }

    #[test]
    fn test_summarize_body() {
        let value = json!([{"id": 1, "name": "a"}, {"id": 2, "name": "b"}]);
        assert_eq!(summarize_body(&value), "array[2]<object{id,name}>");
        assert_eq!(summarize_body(&json!([])), "array[0]");
        assert_eq!(summarize_body(&json!("hi")), "string");
        assert_eq!(summarize_body(&json!({"a": 1})), "object{a}");
    }
}
