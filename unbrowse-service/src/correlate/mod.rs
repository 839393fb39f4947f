//! Correlation engine
//!
//! Finds data flow between captured exchanges: a value produced by response
//! N (header, cookie, body leaf, URL segment, query value) that reappears in
//! a later request M. Each reuse becomes a link; the links form a DAG over
//! exchange indices that the replay preparer walks to inject fresh values.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};

use crate::analyze::schema::safe_parse_json;
use crate::exchange::CapturedExchange;
use crate::jsonpath;

/// Values shorter than this are never linked
pub const MIN_LINK_VALUE_LEN: usize = 8;

/// Non-numeric values need more than this many distinct characters
const MIN_DISTINCT_CHARS: usize = 4;

/// Where a correlated value lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueLocation {
    Header,
    Body,
    Cookie,
    Url,
    Query,
}

/// One observed value reuse
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CorrelationLinkV1 {
    pub source_request_index: usize,
    pub source_location: ValueLocation,
    pub source_path: String,
    pub target_request_index: usize,
    pub target_location: ValueLocation,
    pub target_path: String,
    /// SHA-256 hex of the exact source value as captured
    pub value_hash: String,
}

/// Versioned link collection; links always point forward in capture order
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CorrelationGraphV1 {
    pub version: u32,
    pub links: Vec<CorrelationLinkV1>,
}

impl CorrelationGraphV1 {
    pub fn new(links: Vec<CorrelationLinkV1>) -> Self {
        Self { version: 1, links }
    }

    /// Links pointing at a step
    pub fn incoming(&self, target_index: usize) -> impl Iterator<Item = &CorrelationLinkV1> {
        self.links
            .iter()
            .filter(move |l| l.target_request_index == target_index)
    }

    /// Transitive source set of a target, including the target itself,
    /// ascending. The forward-only link property makes this a topological
    /// order.
    pub fn execution_order(&self, target_index: usize) -> Vec<usize> {
        let mut needed: HashSet<usize> = HashSet::new();
        let mut stack = vec![target_index];
        while let Some(index) = stack.pop() {
            if !needed.insert(index) {
                continue;
            }
            for link in self.incoming(index) {
                stack.push(link.source_request_index);
            }
        }
        let mut order: Vec<usize> = needed.into_iter().collect();
        order.sort_unstable();
        order
    }
}

/// SHA-256 hex digest of a string
pub fn sha256_hex(value: &str) -> String {
    hex::encode(Sha256::digest(value.as_bytes()))
}

/// A value some earlier exchange produced
#[derive(Debug, Clone)]
struct SourceRef {
    index: usize,
    location: ValueLocation,
    path: String,
    hash: String,
}

/// Significance filter. Numeric IDs pass on length alone; everything else
/// also needs enough distinct characters to not be noise ("true", "nullnull").
fn value_is_significant(value: &str) -> bool {
    if value.len() < MIN_LINK_VALUE_LEN {
        return false;
    }
    if value.chars().all(|c| c.is_ascii_digit()) {
        return true;
    }
    let distinct: HashSet<char> = value.chars().collect();
    distinct.len() >= MIN_DISTINCT_CHARS
}

const STRIPPED_EXTENSIONS: &[&str] = &["json", "xml", "csv", "txt", "html"];

fn strip_known_extension(segment: &str) -> Option<&str> {
    let dot = segment.rfind('.')?;
    let ext = &segment[dot + 1..];
    if STRIPPED_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()) {
        Some(&segment[..dot])
    } else {
        None
    }
}

/// Response body as JSON, tolerating `+json` subtypes and loose payloads
/// that merely look like JSON.
pub fn response_body_json(exchange: &CapturedExchange) -> Option<serde_json::Value> {
    if let Some(body) = &exchange.response.body {
        return Some(body.clone());
    }
    let raw = exchange.response.body_raw.as_deref()?;
    let jsonish = exchange
        .response
        .content_type
        .as_deref()
        .is_some_and(|ct| ct.to_ascii_lowercase().contains("json"))
        || raw.trim_start().starts_with('{')
        || raw.trim_start().starts_with('[');
    if jsonish {
        safe_parse_json(raw)
    } else {
        None
    }
}

struct ValueIndex {
    by_value: HashMap<String, Vec<SourceRef>>,
}

impl ValueIndex {
    fn new() -> Self {
        Self {
            by_value: HashMap::new(),
        }
    }

    fn add(&mut self, index: usize, location: ValueLocation, path: &str, raw_value: &str) {
        let trimmed = raw_value.trim();
        let mut forms: Vec<&str> = Vec::with_capacity(2);
        if value_is_significant(trimmed) {
            forms.push(trimmed);
        }
        // Bearer-prefixed tokens are indexed in stripped form too, so a bare
        // token in a later request still matches.
        if let Some(stripped) = trimmed
            .to_ascii_lowercase()
            .starts_with("bearer ")
            .then(|| trimmed[7..].trim())
        {
            if value_is_significant(stripped) {
                forms.push(stripped);
            }
        }
        for form in forms {
            self.by_value
                .entry(form.to_string())
                .or_default()
                .push(SourceRef {
                    index,
                    location,
                    path: path.to_string(),
                    hash: sha256_hex(form),
                });
        }
    }

    fn lookup(&self, value: &str) -> Option<&Vec<SourceRef>> {
        self.by_value.get(value.trim())
    }

    /// Every value an exchange produces, indexed for later targets.
    fn add_exchange(&mut self, exchange: &CapturedExchange) {
        let i = exchange.index;
        for (name, value) in exchange.response.headers.iter() {
            self.add(i, ValueLocation::Header, name, value);
        }
        for (name, value) in exchange.response.cookies.iter() {
            self.add(i, ValueLocation::Cookie, name, value);
        }
        if let Some(body) = response_body_json(exchange) {
            for (path, value) in jsonpath::leaves(&body) {
                if !path.is_empty() {
                    self.add(i, ValueLocation::Body, &path, &value);
                }
            }
        }
        for (seg_index, segment) in exchange.path_segments().iter().enumerate() {
            self.add(
                i,
                ValueLocation::Url,
                &format!("url.path.{}", seg_index),
                segment,
            );
        }
        for (name, value) in exchange.request.query_params.iter() {
            self.add(i, ValueLocation::Query, &format!("query.{}", name), value);
        }
    }
}

/// Infer the correlation graph for a sealed exchange sequence.
pub fn infer_correlation_graph(exchanges: &[CapturedExchange]) -> CorrelationGraphV1 {
    let mut index = ValueIndex::new();
    let mut links = Vec::new();
    let mut seen: HashSet<(usize, usize, ValueLocation, String, ValueLocation, String)> =
        HashSet::new();

    let mut ordered: Vec<&CapturedExchange> = exchanges.iter().collect();
    ordered.sort_by_key(|e| e.index);

    for exchange in ordered {
        scan_targets(exchange, &index, &mut links, &mut seen);
        // Sources become visible only to later exchanges.
        index.add_exchange(exchange);
    }

    CorrelationGraphV1::new(links)
}

fn scan_targets(
    exchange: &CapturedExchange,
    index: &ValueIndex,
    links: &mut Vec<CorrelationLinkV1>,
    seen: &mut HashSet<(usize, usize, ValueLocation, String, ValueLocation, String)>,
) {
    let target_index = exchange.index;
    let mut push = |matches: &Vec<SourceRef>,
                    target_location: ValueLocation,
                    target_path: &str,
                    needle_hash: Option<&str>| {
        for source in matches {
            if source.index >= target_index {
                continue;
            }
            let key = (
                source.index,
                target_index,
                source.location,
                source.path.clone(),
                target_location,
                target_path.to_string(),
            );
            if !seen.insert(key) {
                continue;
            }
            links.push(CorrelationLinkV1 {
                source_request_index: source.index,
                source_location: source.location,
                source_path: source.path.clone(),
                target_request_index: target_index,
                target_location,
                target_path: target_path.to_string(),
                value_hash: needle_hash.map(|h| h.to_string()).unwrap_or_else(|| source.hash.clone()),
            });
        }
    };

    for (name, value) in exchange.request.headers.iter() {
        if let Some(matches) = index.lookup(value) {
            push(matches, ValueLocation::Header, name, None);
        }
        // "Bearer X" matches a source that produced the bare token.
        if value.to_ascii_lowercase().starts_with("bearer ") {
            if let Some(matches) = index.lookup(value[7..].trim()) {
                push(matches, ValueLocation::Header, name, None);
            }
        }
    }

    for (seg_index, segment) in exchange.path_segments().iter().enumerate() {
        let target_path = format!("url.path.{}", seg_index);
        if let Some(matches) = index.lookup(segment) {
            push(matches, ValueLocation::Url, &target_path, None);
        } else if let Some(stem) = strip_known_extension(segment) {
            // Substring containment: `abc123.json` reuses `abc123`. The hash
            // pins the needle so the replay preparer can rebuild the segment.
            if let Some(matches) = index.lookup(stem) {
                let needle_hash = sha256_hex(stem.trim());
                push(matches, ValueLocation::Url, &target_path, Some(&needle_hash));
            }
        }
    }

    for (name, value) in exchange.request.query_params.iter() {
        if let Some(matches) = index.lookup(value) {
            push(matches, ValueLocation::Query, &format!("query.{}", name), None);
        }
    }

    if let Some(body) = &exchange.request.body {
        for (path, value) in jsonpath::leaves(body) {
            if path.is_empty() {
                continue;
            }
            if let Some(matches) = index.lookup(&value) {
                push(matches, ValueLocation::Body, &format!("body.{}", path), None);
            }
        }
    }

    for (name, value) in exchange.request.cookies.iter() {
        if let Some(matches) = index.lookup(value) {
            push(matches, ValueLocation::Cookie, &format!("cookie.{}", name), None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{CapturedRequest, CapturedResponse};
    use serde_json::json;

    fn get_exchange(index: usize, url: &str, response_body: serde_json::Value) -> CapturedExchange {
        CapturedExchange {
            index,
            timestamp: index as i64,
            request: CapturedRequest {
                method: "GET".into(),
                url: url.into(),
                query_params: crate::exchange::query_params_of(url),
                ..Default::default()
            },
            response: CapturedResponse {
                status: 200,
                body: Some(response_body),
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_hn_chain_links() {
        // topstories -> item -> user, ids flowing through URL segments.
        let exchanges = vec![
            get_exchange(0, "https://hn.test/v0/topstories.json", json!([11111111, 22222222])),
            get_exchange(
                1,
                "https://hn.test/v0/item/11111111.json",
                json!({"by": "alice_long", "id": 11111111}),
            ),
            get_exchange(2, "https://hn.test/v0/user/alice_long.json", json!({"id": "alice_long"})),
        ];

        let graph = infer_correlation_graph(&exchanges);

        // id 11111111 from the story list into the item URL (extension-stripped).
        let item_link = graph
            .links
            .iter()
            .find(|l| l.target_request_index == 1 && l.target_location == ValueLocation::Url)
            .expect("item link");
        assert_eq!(item_link.source_request_index, 0);
        assert_eq!(item_link.source_location, ValueLocation::Body);
        assert_eq!(item_link.source_path, "[]");
        assert_eq!(item_link.target_path, "url.path.2");
        assert_eq!(item_link.value_hash, sha256_hex("11111111"));

        // username from the item body into the user URL.
        let user_link = graph
            .links
            .iter()
            .find(|l| l.target_request_index == 2 && l.target_location == ValueLocation::Url)
            .expect("user link");
        assert_eq!(user_link.source_request_index, 1);
        assert_eq!(user_link.source_path, "by");
        assert_eq!(user_link.value_hash, sha256_hex("alice_long"));
    }

    #[test]
    fn test_csrf_header_link() {
        let start = get_exchange(0, "https://x.test/start", json!({"csrfToken": "csrf-token-value"}));
        let mut submit = get_exchange(1, "https://x.test/submit", json!({"ok": true}));
        submit.request.method = "POST".into();
        submit
            .request
            .headers
            .insert("x-csrf-token", "csrf-token-value");

        let graph = infer_correlation_graph(&[start, submit]);
        let link = graph
            .links
            .iter()
            .find(|l| l.target_location == ValueLocation::Header)
            .expect("csrf link");
        assert_eq!(link.source_location, ValueLocation::Body);
        assert_eq!(link.source_path, "csrfToken");
        assert_eq!(link.target_path, "x-csrf-token");
    }

    #[test]
    fn test_links_always_point_forward() {
        // Same value in both responses: only the earlier one may be a source.
        let exchanges = vec![
            get_exchange(0, "https://x.test/a", json!({"token": "shared-value-1"})),
            get_exchange(1, "https://x.test/b?t=shared-value-1", json!({"token": "shared-value-1"})),
        ];
        let graph = infer_correlation_graph(&exchanges);
        assert!(!graph.links.is_empty());
        for link in &graph.links {
            assert!(link.target_request_index > link.source_request_index);
            assert!(!link.value_hash.is_empty());
        }
    }

    #[test]
    fn test_short_values_are_never_linked() {
        // Boundary: 7 characters skipped, 8 characters linked.
        let exchanges = vec![
            get_exchange(0, "https://x.test/a", json!({"seven": "abcdefg", "eight": "abcdefgh"})),
            get_exchange(1, "https://x.test/b?s=abcdefg&e=abcdefgh", json!({})),
        ];
        let graph = infer_correlation_graph(&exchanges);
        assert!(graph.links.iter().all(|l| l.source_path != "seven"));
        assert!(graph.links.iter().any(|l| l.source_path == "eight"));
    }

    #[test]
    fn test_low_entropy_text_skipped_numeric_ids_kept() {
        let exchanges = vec![
            get_exchange(0, "https://x.test/a", json!({"noise": "aaaabbbb", "id": 11111111})),
            get_exchange(1, "https://x.test/b?n=aaaabbbb&i=11111111", json!({})),
        ];
        let graph = infer_correlation_graph(&exchanges);
        assert!(graph.links.iter().all(|l| l.source_path != "noise"));
        assert!(graph.links.iter().any(|l| l.source_path == "id"));
    }

    #[test]
    fn test_bearer_tokens_match_in_both_forms() {
        let mut login = get_exchange(0, "https://x.test/auth/login", json!({"token": "tok-abc-123-xyz"}));
        login.request.method = "POST".into();
        let mut call = get_exchange(1, "https://x.test/api/data", json!({}));
        call.request
            .headers
            .insert("Authorization", "Bearer tok-abc-123-xyz");

        let graph = infer_correlation_graph(&[login, call]);
        let link = graph
            .links
            .iter()
            .find(|l| l.target_path == "Authorization")
            .expect("bearer link");
        assert_eq!(link.source_path, "token");
    }

    #[test]
    fn test_value_hash_matches_sha256_of_raw_value() {
        let exchanges = vec![
            get_exchange(0, "https://x.test/a", json!({"sessionId": "session-12345"})),
            get_exchange(1, "https://x.test/b?sessionId=session-12345", json!({})),
        ];
        let graph = infer_correlation_graph(&exchanges);
        let link = &graph.links[0];
        assert_eq!(link.value_hash, sha256_hex("session-12345"));
        assert_eq!(link.value_hash.len(), 64);
    }

    #[test]
    fn test_execution_order_is_ascending_transitive_closure() {
        let exchanges = vec![
            get_exchange(0, "https://x.test/a", json!({"k1": "value-one-long"})),
            get_exchange(1, "https://x.test/b?k=value-one-long", json!({"k2": "value-two-long"})),
            get_exchange(2, "https://x.test/c?k=value-two-long", json!({})),
            get_exchange(3, "https://x.test/unrelated", json!({})),
        ];
        let graph = infer_correlation_graph(&exchanges);
        assert_eq!(graph.execution_order(2), vec![0, 1, 2]);
        assert_eq!(graph.execution_order(3), vec![3]);
    }

    #[test]
    fn test_duplicate_links_are_deduplicated() {
        // The same value twice in one response body, same paths: one link.
        let exchanges = vec![
            get_exchange(0, "https://x.test/a", json!({"items": ["dup-value-1", "dup-value-1"]})),
            get_exchange(1, "https://x.test/b?d=dup-value-1", json!({})),
        ];
        let graph = infer_correlation_graph(&exchanges);
        let count = graph
            .links
            .iter()
            .filter(|l| l.source_path == "items[]" && l.target_path == "query.d")
            .count();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_graph_serialization_shape() {
        let graph = CorrelationGraphV1::new(vec![]);
        let value = serde_json::to_value(&graph).unwrap();
        assert_eq!(value["version"], 1);
        assert!(value["links"].as_array().unwrap().is_empty());
    }
}
