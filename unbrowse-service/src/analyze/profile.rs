//! Per-domain header profiles
//!
//! A profile summarizes which headers should travel with every replayed
//! request to a domain. Secrets (auth, cookies) are never profiled; they come
//! from the persisted auth state at replay time.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use super::classify::{classify_header, is_profile_excluded, HeaderCategory};
use crate::error::Result;
use crate::exchange::{path_segments_of, CapturedExchange, HeaderMap, ParamMap};

/// Fraction of requests a header value must appear on to be profiled
const COMMON_HEADER_THRESHOLD_PCT: usize = 80;

/// Frequency-based header summary for one domain
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HeaderProfile {
    /// Domain the profile was built for
    pub domain: String,

    /// Headers (lowercased name) appearing with a stable value on >= 80% of requests
    pub common_headers: BTreeMap<String, String>,

    /// Per-endpoint deviations, keyed by `"METHOD path"`
    #[serde(default)]
    pub endpoint_overrides: BTreeMap<String, BTreeMap<String, String>>,

    /// Number of requests observed for the domain
    pub request_count: usize,

    /// When the profile was captured
    pub captured_at: DateTime<Utc>,
}

/// Replay environment the resolved headers are destined for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveMode {
    /// Headless HTTP client: only app-category headers are safe to replay
    Node,
    /// Browser-adjacent client: app plus context headers
    Browser,
}

/// Source of a fresh live header snapshot, implemented by the browser channel
#[async_trait]
pub trait HeaderCapturer: Send + Sync {
    /// Current header values the browser would send to the given URL
    async fn live_headers(&self, url: &str) -> Result<HeaderMap>;
}

/// Build one profile per target domain from a sealed exchange sequence.
///
/// Pure function of its input: same exchanges, same profiles (up to
/// `captured_at`).
pub fn build_profiles(
    exchanges: &[CapturedExchange],
    domains: &[String],
) -> BTreeMap<String, HeaderProfile> {
    let mut profiles = BTreeMap::new();
    for domain in domains {
        let requests: Vec<&CapturedExchange> = exchanges
            .iter()
            .filter(|e| e.domain().as_deref() == Some(domain.as_str()))
            .collect();
        if requests.is_empty() {
            continue;
        }
        profiles.insert(domain.clone(), build_domain_profile(domain, &requests));
    }
    profiles
}

fn build_domain_profile(domain: &str, requests: &[&CapturedExchange]) -> HeaderProfile {
    // name -> value -> occurrence count
    let mut value_counts: HashMap<String, HashMap<String, usize>> = HashMap::new();
    for exchange in requests {
        for (name, value) in exchange.request.headers.iter() {
            let name = name.to_ascii_lowercase();
            *value_counts
                .entry(name)
                .or_default()
                .entry(value.to_string())
                .or_insert(0) += 1;
        }
    }

    let request_count = requests.len();
    let mut common_headers = BTreeMap::new();
    for (name, values) in &value_counts {
        if is_profile_excluded(classify_header(name)) {
            continue;
        }
        let Some((best_value, best_count)) = values
            .iter()
            .max_by_key(|(_, count)| *count)
            .map(|(v, c)| (v.clone(), *c))
        else {
            continue;
        };
        if best_count * 100 >= COMMON_HEADER_THRESHOLD_PCT * request_count {
            common_headers.insert(name.clone(), best_value);
        }
    }

    // Record endpoint-local values that differ from the domain-common value.
    let mut endpoint_overrides: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
    for exchange in requests {
        let endpoint_key = format!(
            "{} /{}",
            exchange.request.method.to_ascii_uppercase(),
            path_segments_of(&exchange.request.url).join("/")
        );
        for (name, value) in exchange.request.headers.iter() {
            let name = name.to_ascii_lowercase();
            if is_profile_excluded(classify_header(&name)) {
                continue;
            }
            if let Some(common) = common_headers.get(&name) {
                if common != value {
                    endpoint_overrides
                        .entry(endpoint_key.clone())
                        .or_default()
                        .insert(name, value.to_string());
                }
            }
        }
    }

    HeaderProfile {
        domain: domain.to_string(),
        common_headers,
        endpoint_overrides,
        request_count,
        captured_at: Utc::now(),
    }
}

/// Headers to send with a replayed request against `method` + `path`.
///
/// Auth headers always win over profiled values; cookies are folded into a
/// single `Cookie` header in insertion order.
pub fn resolve_headers(
    profile: &HeaderProfile,
    method: &str,
    path: &str,
    auth_headers: &HeaderMap,
    cookies: &ParamMap,
    mode: ResolveMode,
) -> HeaderMap {
    let keep = |name: &str| -> bool {
        match classify_header(name) {
            HeaderCategory::App => true,
            HeaderCategory::Context => mode == ResolveMode::Browser,
            _ => false,
        }
    };

    let mut headers = HeaderMap::new();
    for (name, value) in &profile.common_headers {
        if keep(name) {
            headers.insert(name.clone(), value.clone());
        }
    }

    let endpoint_key = format!("{} {}", method.to_ascii_uppercase(), path);
    if let Some(overrides) = profile.endpoint_overrides.get(&endpoint_key) {
        for (name, value) in overrides {
            if keep(name) {
                headers.insert(name.clone(), value.clone());
            }
        }
    }

    for (name, value) in auth_headers.iter() {
        headers.insert(name, value);
    }

    if !cookies.is_empty() {
        let cookie_line = cookies
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect::<Vec<_>>()
            .join("; ");
        headers.insert("Cookie", cookie_line);
    }

    headers
}

/// Copy of the profile with every auth-category value blanked.
///
/// Idempotent; only auth values change.
pub fn sanitize_header_profile(profile: &HeaderProfile) -> HeaderProfile {
    let mut sanitized = profile.clone();
    for (name, value) in sanitized.common_headers.iter_mut() {
        if classify_header(name) == HeaderCategory::Auth {
            value.clear();
        }
    }
    for overrides in sanitized.endpoint_overrides.values_mut() {
        for (name, value) in overrides.iter_mut() {
            if classify_header(name) == HeaderCategory::Auth {
                value.clear();
            }
        }
    }
    sanitized
}

/// Refresh profiled values from a live browser snapshot.
///
/// For each profiled key, the live value wins; the profiled sample remains
/// as the fallback when the snapshot does not carry the header.
pub async fn prime_headers(
    url: &str,
    profile: &HeaderProfile,
    capturer: &dyn HeaderCapturer,
) -> Result<BTreeMap<String, String>> {
    let live = capturer.live_headers(url).await?;
    let mut primed = BTreeMap::new();
    for (name, sample) in &profile.common_headers {
        let value = live.get(name).map(|v| v.to_string());
        primed.insert(name.clone(), value.unwrap_or_else(|| sample.clone()));
    }
    Ok(primed)
}
