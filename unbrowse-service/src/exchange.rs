//! Captured HTTP exchange model
//!
//! Typed representation of observed request/response pairs. Capture logs
//! arrive in loose HAR-like shapes (header objects, header record arrays,
//! numeric values); everything is repaired into typed maps at this edge so
//! the rest of the pipeline never touches untyped JSON headers.

use serde::de::{MapAccess, SeqAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;

/// Case-preserving, insertion-ordered header map
///
/// Lookup is case-insensitive; the name as first written is preserved for
/// replay. Duplicate inserts update the value in place and keep the original
/// casing and position.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    /// Create an empty header map
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Insert a header, updating in place if the name is already present
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(&name))
        {
            entry.1 = value;
        } else {
            self.entries.push((name, value));
        }
    }

    /// Case-insensitive lookup
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Remove a header by case-insensitive name, returning its value
    pub fn remove(&mut self, name: &str) -> Option<String> {
        let pos = self
            .entries
            .iter()
            .position(|(n, _)| n.eq_ignore_ascii_case(name))?;
        Some(self.entries.remove(pos).1)
    }

    /// True if the header is present (case-insensitive)
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Iterate entries in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Number of headers
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no headers are present
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(String, String)> for HeaderMap {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        let mut map = Self::new();
        for (n, v) in iter {
            map.insert(n, v);
        }
        map
    }
}

impl Serialize for HeaderMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, value) in &self.entries {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for HeaderMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(LooseMapVisitor).map(|pairs| {
            let mut map = HeaderMap::new();
            for (n, v) in pairs {
                map.insert(n, v);
            }
            map
        })
    }
}

/// Case-sensitive, insertion-ordered parameter map
///
/// Used for query parameters and cookies. Repeated keys are preserved;
/// lookup returns the first occurrence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParamMap {
    pairs: Vec<(String, String)>,
}

impl ParamMap {
    /// Create an empty parameter map
    pub fn new() -> Self {
        Self { pairs: Vec::new() }
    }

    /// Append a pair, keeping any existing occurrence of the key
    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.pairs.push((key.into(), value.into()));
    }

    /// Set a key: update the first occurrence, or append
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        if let Some(entry) = self.pairs.iter_mut().find(|(k, _)| *k == key) {
            entry.1 = value;
        } else {
            self.pairs.push((key, value));
        }
    }

    /// First occurrence of the key
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Iterate pairs in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of pairs (repeated keys count individually)
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// True when no pairs are present
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

impl FromIterator<(String, String)> for ParamMap {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        let mut map = Self::new();
        for (k, v) in iter {
            map.push(k, v);
        }
        map
    }
}

impl Serialize for ParamMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.pairs.len()))?;
        for (key, value) in &self.pairs {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for ParamMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(LooseMapVisitor).map(|pairs| {
            let mut map = ParamMap::new();
            for (k, v) in pairs {
                map.push(k, v);
            }
            map
        })
    }
}

/// Visitor that accepts both header shapes seen in capture logs:
/// a plain object, or a HAR-style array of `{name, value}` records.
struct LooseMapVisitor;

impl<'de> Visitor<'de> for LooseMapVisitor {
    type Value = Vec<(String, String)>;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a map of names to values, or a list of name/value records")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
        let mut pairs = Vec::new();
        while let Some((name, value)) = access.next_entry::<String, Value>()? {
            if let Some(s) = coerce_value(&value) {
                pairs.push((name, s));
            }
        }
        Ok(pairs)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
        #[derive(Deserialize)]
        struct Record {
            name: String,
            value: Value,
        }
        let mut pairs = Vec::new();
        while let Some(record) = access.next_element::<Record>()? {
            if let Some(s) = coerce_value(&record.value) {
                pairs.push((record.name, s));
            }
        }
        Ok(pairs)
    }
}

/// Coerce a loose JSON value into a header/parameter string.
/// Objects and nulls are dropped rather than stringified.
fn coerce_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().filter_map(coerce_value).collect();
            if parts.is_empty() {
                None
            } else {
                Some(parts.join(", "))
            }
        }
        Value::Null | Value::Object(_) => None,
    }
}

/// Body encoding observed on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyFormat {
    Json,
    Form,
    Multipart,
    Text,
    Binary,
}

impl BodyFormat {
    /// Infer the body format from a content type
    pub fn from_content_type(content_type: &str) -> Self {
        let ct = content_type.to_ascii_lowercase();
        if ct.contains("json") {
            Self::Json
        } else if ct.contains("x-www-form-urlencoded") {
            Self::Form
        } else if ct.contains("multipart/") {
            Self::Multipart
        } else if ct.starts_with("text/") || ct.contains("xml") || ct.contains("javascript") {
            Self::Text
        } else {
            Self::Binary
        }
    }
}

/// Captured request half of an exchange
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CapturedRequest {
    /// HTTP method as observed (normalized to uppercase during analysis)
    pub method: String,

    /// Full request URL
    pub url: String,

    /// Request headers, order and casing preserved
    pub headers: HeaderMap,

    /// Cookies sent with the request
    pub cookies: ParamMap,

    /// Query parameters decoded from the URL
    pub query_params: ParamMap,

    /// Parsed body when the payload was inferable as JSON
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,

    /// Original body text, preserved exactly for non-binary payloads
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_raw: Option<String>,

    /// Body encoding
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_format: Option<BodyFormat>,

    /// Content-Type as observed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

/// Captured response half of an exchange
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CapturedResponse {
    /// HTTP status code
    pub status: u16,

    /// Response headers, order and casing preserved
    pub headers: HeaderMap,

    /// Cookies set by the response
    pub cookies: ParamMap,

    /// Parsed body when the payload was inferable as JSON
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,

    /// Original body text, preserved exactly for non-binary payloads
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_raw: Option<String>,

    /// Body encoding
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_format: Option<BodyFormat>,

    /// Content-Type as observed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

/// One observed request/response pair
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturedExchange {
    /// 0-based insertion order within the capture session, unique and stable
    pub index: usize,

    /// Logical ordinal (milliseconds since session start or epoch)
    pub timestamp: i64,

    pub request: CapturedRequest,
    pub response: CapturedResponse,
}

impl CapturedExchange {
    /// Non-empty path segments of the request URL (percent-decoding left intact)
    pub fn path_segments(&self) -> Vec<String> {
        path_segments_of(&self.request.url)
    }

    /// Host of the request URL, when parseable
    pub fn domain(&self) -> Option<String> {
        url::Url::parse(&self.request.url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_string()))
    }
}

/// Non-empty path segments of a URL, tolerating bare paths
pub fn path_segments_of(raw: &str) -> Vec<String> {
    let path = match url::Url::parse(raw) {
        Ok(u) => u.path().to_string(),
        Err(_) => raw.split(['?', '#']).next().unwrap_or(raw).to_string(),
    };
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

/// Decode query parameters from a URL into an ordered pair list
pub fn query_params_of(raw: &str) -> ParamMap {
    match url::Url::parse(raw) {
        Ok(u) => u
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect(),
        Err(_) => ParamMap::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_header_map_preserves_case_and_order() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Csrf-Token", "abc");
        headers.insert("Accept", "application/json");
        headers.insert("x-csrf-token", "def");

        assert_eq!(headers.len(), 2);
        assert_eq!(headers.get("X-CSRF-TOKEN"), Some("def"));
        let names: Vec<&str> = headers.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["X-Csrf-Token", "Accept"]);
    }

    #[test]
    fn test_header_map_accepts_object_shape() {
        let headers: HeaderMap =
            serde_json::from_value(json!({"Accept": "text/html", "DNT": 1})).unwrap();
        assert_eq!(headers.get("accept"), Some("text/html"));
        assert_eq!(headers.get("dnt"), Some("1"));
    }

    #[test]
    fn test_header_map_accepts_har_record_array() {
        let headers: HeaderMap = serde_json::from_value(json!([
            {"name": "Authorization", "value": "Bearer tok"},
            {"name": "Accept", "value": "*/*"}
        ]))
        .unwrap();
        assert_eq!(headers.get("authorization"), Some("Bearer tok"));
        assert_eq!(headers.len(), 2);
    }

    #[test]
    fn test_header_map_drops_null_and_object_values() {
        let headers: HeaderMap =
            serde_json::from_value(json!({"a": null, "b": {"nested": 1}, "c": "kept"})).unwrap();
        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get("c"), Some("kept"));
    }

    #[test]
    fn test_param_map_repeated_keys() {
        let mut params = ParamMap::new();
        params.push("tag", "a");
        params.push("tag", "b");
        assert_eq!(params.len(), 2);
        assert_eq!(params.get("tag"), Some("a"));
    }

    #[test]
    fn test_param_map_is_case_sensitive() {
        let mut params = ParamMap::new();
        params.push("sessionId", "s1");
        assert_eq!(params.get("sessionid"), None);
        assert_eq!(params.get("sessionId"), Some("s1"));
    }

    #[test]
    fn test_body_format_from_content_type() {
        assert_eq!(
            BodyFormat::from_content_type("application/json; charset=utf-8"),
            BodyFormat::Json
        );
        assert_eq!(
            BodyFormat::from_content_type("application/x-www-form-urlencoded"),
            BodyFormat::Form
        );
        assert_eq!(
            BodyFormat::from_content_type("multipart/form-data; boundary=x"),
            BodyFormat::Multipart
        );
        assert_eq!(BodyFormat::from_content_type("text/plain"), BodyFormat::Text);
        assert_eq!(
            BodyFormat::from_content_type("application/octet-stream"),
            BodyFormat::Binary
        );
    }

    #[test]
    fn test_path_segments_and_query_params() {
        let url = "https://api.example.com/v2/users/42?limit=10&tag=a&tag=b";
        assert_eq!(path_segments_of(url), vec!["v2", "users", "42"]);
        let params = query_params_of(url);
        assert_eq!(params.get("limit"), Some("10"));
        assert_eq!(params.len(), 3);
    }

    #[test]
    fn test_exchange_round_trips_through_json() {
        let exchange = CapturedExchange {
            index: 3,
            timestamp: 1700000000000,
            request: CapturedRequest {
                method: "GET".into(),
                url: "https://api.example.com/v1/items".into(),
                headers: [("Accept".to_string(), "application/json".to_string())]
                    .into_iter()
                    .collect(),
                ..Default::default()
            },
            response: CapturedResponse {
                status: 200,
                body_raw: Some("[]".into()),
                body_format: Some(BodyFormat::Json),
                ..Default::default()
            },
        };

        let json = serde_json::to_string(&exchange).unwrap();
        let back: CapturedExchange = serde_json::from_str(&json).unwrap();
        assert_eq!(back.index, 3);
        assert_eq!(back.request.headers.get("accept"), Some("application/json"));
        assert_eq!(back.response.body_raw.as_deref(), Some("[]"));
    }
}
