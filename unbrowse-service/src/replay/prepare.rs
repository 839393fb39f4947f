//! Replay request preparation
//!
//! Rebuilds a captured request for re-execution, splicing in values produced
//! by the prerequisite steps that already ran. URL edits go through a real
//! URL parser; an unparseable URL is left untouched rather than mangled.

use serde_json::Value;
use std::collections::HashMap;

use crate::analyze::schema::safe_parse_json;
use crate::correlate::{sha256_hex, CorrelationGraphV1, CorrelationLinkV1, ValueLocation};
use crate::exchange::{path_segments_of, CapturedExchange, HeaderMap};
use crate::jsonpath;

/// Headers the replay client must regenerate itself
const DROPPED_HEADERS: &[&str] = &["host", "connection", "content-length", "transfer-encoding", "cookie"];

const STRIPPED_EXTENSIONS: &[&str] = &["json", "xml", "csv", "txt", "html"];

/// A request ready to hand to a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedRequest {
    pub method: String,
    pub url: String,
    pub headers: HeaderMap,
    pub body_text: Option<String>,
}

/// What a finished step produced, keyed by step index in the runtime map
#[derive(Debug, Clone, Default)]
pub struct StepResponseRuntime {
    pub status: u16,
    pub headers: HeaderMap,
    pub body_text: String,
    pub content_type: Option<String>,
    pub body_json: Option<Value>,
}

impl StepResponseRuntime {
    /// Body as JSON, parsing lazily and tolerating `+json` subtypes and
    /// loose payloads that merely look like JSON.
    pub fn json(&self) -> Option<Value> {
        if let Some(parsed) = &self.body_json {
            return Some(parsed.clone());
        }
        let jsonish = self
            .content_type
            .as_deref()
            .is_some_and(|ct| ct.to_ascii_lowercase().contains("json"))
            || self.body_text.trim_start().starts_with('{')
            || self.body_text.trim_start().starts_with('[');
        if jsonish {
            safe_parse_json(&self.body_text)
        } else {
            None
        }
    }
}

/// Caller-supplied adjustments for one prepared step
#[derive(Debug, Clone, Default)]
pub struct PrepareOptions {
    /// Headers overlaid after filtering (auth state, profile headers)
    pub session_headers: HeaderMap,
    /// Replacement body, e.g. caller-provided parameters
    pub body_override_text: Option<String>,
}

/// Build the replayable request for `step_index`, injecting values from the
/// runtime responses of its prerequisite steps. Returns None when no
/// exchange carries that index.
pub fn prepare_request_for_step(
    exchanges: &[CapturedExchange],
    graph: &CorrelationGraphV1,
    step_index: usize,
    runtime: &HashMap<usize, StepResponseRuntime>,
    opts: Option<&PrepareOptions>,
) -> Option<PreparedRequest> {
    let exchange = exchanges.iter().find(|e| e.index == step_index)?;
    let request = &exchange.request;

    let mut headers: HeaderMap = request
        .headers
        .iter()
        .filter(|(name, _)| {
            !name.starts_with(':')
                && !DROPPED_HEADERS
                    .iter()
                    .any(|d| name.eq_ignore_ascii_case(d))
        })
        .map(|(n, v)| (n.to_string(), v.to_string()))
        .collect();
    if let Some(opts) = opts {
        for (name, value) in opts.session_headers.iter() {
            headers.insert(name, value);
        }
    }

    let mut url = request.url.clone();
    let mut body_text = opts
        .and_then(|o| o.body_override_text.clone())
        .or_else(|| request.body_raw.clone())
        .or_else(|| request.body.as_ref().map(|b| b.to_string()));

    for link in graph.incoming(step_index) {
        let Some(value) = extract_from_runtime(runtime, exchanges, link) else {
            // Missing source value: the step runs without this injection and
            // the mismatch surfaces in the trace.
            continue;
        };
        match link.target_location {
            ValueLocation::Header => inject_header(&mut headers, &link.target_path, &value),
            ValueLocation::Url => {
                url = inject_url_segment(&url, &link.target_path, link, &value);
            }
            ValueLocation::Query => {
                url = inject_query(&url, &link.target_path, &value);
            }
            ValueLocation::Body => {
                body_text = inject_body(body_text, &link.target_path, &value);
            }
            ValueLocation::Cookie => {
                // Cookies replay through the session Cookie header.
            }
        }
    }

    Some(PreparedRequest {
        method: request.method.to_ascii_uppercase(),
        url,
        headers,
        body_text,
    })
}

/// Pull the source value of a link out of the runtime responses (or, for
/// deterministic request-side sources, the captured exchange).
pub fn extract_from_runtime(
    runtime: &HashMap<usize, StepResponseRuntime>,
    exchanges: &[CapturedExchange],
    link: &CorrelationLinkV1,
) -> Option<String> {
    let source_index = link.source_request_index;
    match link.source_location {
        ValueLocation::Header => runtime
            .get(&source_index)?
            .headers
            .get(&link.source_path)
            .map(|v| v.to_string()),
        ValueLocation::Body => {
            let body = runtime.get(&source_index)?.json()?;
            jsonpath::resolve_string(&body, &link.source_path)
        }
        ValueLocation::Cookie => {
            // Prefer the fresh Set-Cookie header; fall back to the captured
            // cookie value.
            let fresh = runtime.get(&source_index).and_then(|r| {
                r.headers
                    .get("set-cookie")
                    .and_then(|raw| cookie_from_set_cookie(raw, &link.source_path))
            });
            fresh.or_else(|| {
                exchanges
                    .iter()
                    .find(|e| e.index == source_index)?
                    .response
                    .cookies
                    .get(&link.source_path)
                    .map(|v| v.to_string())
            })
        }
        ValueLocation::Url => {
            let exchange = exchanges.iter().find(|e| e.index == source_index)?;
            let seg_index: usize = link.source_path.strip_prefix("url.path.")?.parse().ok()?;
            exchange.path_segments().get(seg_index).cloned()
        }
        ValueLocation::Query => {
            let exchange = exchanges.iter().find(|e| e.index == source_index)?;
            let key = link.source_path.strip_prefix("query.")?;
            exchange.request.query_params.get(key).map(|v| v.to_string())
        }
    }
}

fn cookie_from_set_cookie(raw: &str, name: &str) -> Option<String> {
    for clause in raw.split(',') {
        let pair = clause.split(';').next()?.trim();
        let mut parts = pair.splitn(2, '=');
        if parts.next()? == name {
            return parts.next().map(|v| v.to_string());
        }
    }
    None
}

fn inject_header(headers: &mut HeaderMap, header_name: &str, value: &str) {
    let final_value = if header_name.eq_ignore_ascii_case("authorization")
        && !value.to_ascii_lowercase().starts_with("bearer")
    {
        format!("Bearer {}", value)
    } else {
        value.to_string()
    };
    headers.insert(header_name, final_value);
}

fn inject_url_segment(
    url: &str,
    target_path: &str,
    link: &CorrelationLinkV1,
    value: &str,
) -> String {
    let Some(seg_index) = target_path
        .strip_prefix("url.path.")
        .and_then(|s| s.parse::<usize>().ok())
    else {
        return url.to_string();
    };
    let Ok(mut parsed) = url::Url::parse(url) else {
        return url.to_string();
    };
    let mut segments = path_segments_of(url);
    let Some(segment) = segments.get(seg_index).cloned() else {
        return url.to_string();
    };

    // The hash pins which part of the segment was the correlated needle:
    // the extension-stripped stem, or the segment as a whole.
    let stem = strip_known_extension(&segment);
    let replaced = match stem {
        Some(stem) if sha256_hex(stem) == link.value_hash => {
            format!("{}{}", value, &segment[stem.len()..])
        }
        _ => value.to_string(),
    };
    segments[seg_index] = replaced;
    parsed.set_path(&format!("/{}", segments.join("/")));
    parsed.to_string()
}

fn strip_known_extension(segment: &str) -> Option<&str> {
    let dot = segment.rfind('.')?;
    let ext = &segment[dot + 1..];
    if STRIPPED_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()) {
        Some(&segment[..dot])
    } else {
        None
    }
}

fn inject_query(url: &str, target_path: &str, value: &str) -> String {
    let Some(rest) = target_path.strip_prefix("query.") else {
        return url.to_string();
    };
    let Ok(mut parsed) = url::Url::parse(url) else {
        return url.to_string();
    };

    let (key, nested) = match rest.split_once('.') {
        Some((key, nested)) => (key, Some(nested)),
        None => (rest, None),
    };

    let mut pairs: Vec<(String, String)> = parsed
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    let new_value = match nested {
        None => value.to_string(),
        Some(nested_path) => {
            // Structural nested injection: parse the existing JSON value,
            // patch the path, re-serialize.
            let existing = pairs
                .iter()
                .find(|(k, _)| k == key)
                .and_then(|(_, v)| safe_parse_json(v))
                .unwrap_or_else(|| Value::Object(serde_json::Map::new()));
            let mut patched = existing;
            if !jsonpath::set_creating(&mut patched, nested_path, Value::String(value.to_string()))
            {
                return url.to_string();
            }
            patched.to_string()
        }
    };

    match pairs.iter_mut().find(|(k, _)| k == key) {
        Some(pair) => pair.1 = new_value,
        None => pairs.push((key.to_string(), new_value)),
    }

    parsed.set_query(None);
    if !pairs.is_empty() {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .finish();
        parsed.set_query(Some(&query));
    }
    parsed.to_string()
}

fn inject_body(body_text: Option<String>, target_path: &str, value: &str) -> Option<String> {
    let text = body_text?;
    let Some(path) = target_path.strip_prefix("body.") else {
        return Some(text);
    };
    let Some(mut parsed) = safe_parse_json(&text) else {
        return Some(text);
    };
    if jsonpath::set(&mut parsed, path, Value::String(value.to_string())) {
        Some(parsed.to_string())
    } else {
        Some(text)
    }
}
