//! CSRF token provenance
//!
//! Replay needs to know where a CSRF header value originally came from so a
//! fresh one can be minted the same way. The first matching source wins, in
//! the order a browser would surface them.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::exchange::{CapturedExchange, ParamMap};

/// Where a CSRF token value was found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CsrfSource {
    Cookie,
    LocalStorage,
    SessionStorage,
    Meta,
    ResponseBody,
    Unknown,
}

/// Provenance record attached to the session auth state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CsrfProvenance {
    pub source: CsrfSource,

    /// Cookie name, storage key, meta name, or response body path
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    /// Header the token travels under at replay time
    pub header_name: String,
}

/// Find the first source whose value equals the CSRF token.
pub fn infer_csrf_provenance(
    csrf_value: &str,
    header_name: &str,
    cookies: &ParamMap,
    local_storage: &BTreeMap<String, String>,
    session_storage: &BTreeMap<String, String>,
    meta_tokens: &BTreeMap<String, String>,
    prior_exchanges: &[CapturedExchange],
) -> CsrfProvenance {
    let provenance = |source, key: Option<String>| CsrfProvenance {
        source,
        key,
        header_name: header_name.to_string(),
    };

    if let Some((name, _)) = cookies.iter().find(|(_, v)| *v == csrf_value) {
        return provenance(CsrfSource::Cookie, Some(name.to_string()));
    }
    if let Some((key, _)) = local_storage.iter().find(|(_, v)| *v == csrf_value) {
        return provenance(CsrfSource::LocalStorage, Some(key.clone()));
    }
    if let Some((key, _)) = session_storage.iter().find(|(_, v)| *v == csrf_value) {
        return provenance(CsrfSource::SessionStorage, Some(key.clone()));
    }
    if let Some((name, _)) = meta_tokens.iter().find(|(_, v)| *v == csrf_value) {
        return provenance(CsrfSource::Meta, Some(name.clone()));
    }
    for exchange in prior_exchanges {
        if let Some(body) = &exchange.response.body {
            if let Some(path) = find_value_path(body, csrf_value, String::new()) {
                return provenance(CsrfSource::ResponseBody, Some(path));
            }
        }
    }
    provenance(CsrfSource::Unknown, None)
}

/// Depth-first search for a string leaf equal to `needle`; returns its dot path.
fn find_value_path(value: &Value, needle: &str, prefix: String) -> Option<String> {
    match value {
        Value::String(s) if s == needle => Some(prefix),
        Value::Object(map) => map.iter().find_map(|(k, v)| {
            let path = if prefix.is_empty() {
                k.clone()
            } else {
                format!("{}.{}", prefix, k)
            };
            find_value_path(v, needle, path)
        }),
        Value::Array(items) => items
            .iter()
            .find_map(|v| find_value_path(v, needle, format!("{}[]", prefix))),
        _ => None,
    }
}
