//! Capture analysis: header classification, profiles, route normalization,
//! endpoint grouping, and schema inference

pub mod classify;
pub mod endpoints;
pub mod normalize;
pub mod profile;
pub mod schema;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::auth::csrf::infer_csrf_provenance;
use crate::auth::extract::{build_auth_state, AuthMethod, AuthState};
use crate::exchange::{CapturedExchange, ParamMap};

pub use classify::{classify_header, HeaderCategory};
pub use endpoints::{analyze_endpoints, EndpointCategory, EndpointGroup};
pub use normalize::{normalize_url_path, NormalizedPath};
pub use profile::{
    build_profiles, resolve_headers, sanitize_header_profile, HeaderProfile, ResolveMode,
};

/// A sealed capture session, analyzed and ready for skill generation.
///
/// Built once the session is over; immutable afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzedExchangeSet {
    pub exchanges: Vec<CapturedExchange>,
    pub auth: AuthState,
    pub auth_method: AuthMethod,
    pub endpoint_groups: Vec<EndpointGroup>,
    /// Scheme+host roots observed, insertion order
    pub base_urls: Vec<String>,
    pub domains: Vec<String>,
}

impl AnalyzedExchangeSet {
    /// Analyze a sealed exchange sequence plus the browser-side auth state.
    pub fn build(
        exchanges: Vec<CapturedExchange>,
        cookies: ParamMap,
        local_storage: BTreeMap<String, String>,
        session_storage: BTreeMap<String, String>,
        meta_tokens: BTreeMap<String, String>,
    ) -> Self {
        let mut auth = build_auth_state(
            &exchanges,
            cookies,
            local_storage,
            session_storage,
            meta_tokens,
        );

        // Where did the CSRF token come from, if one travels on requests?
        if let Some(csrf_value) = auth.auth_headers.get("x-csrf-token").map(|v| v.to_string()) {
            auth.csrf_provenance = Some(infer_csrf_provenance(
                &csrf_value,
                "x-csrf-token",
                &auth.cookies,
                &auth.local_storage,
                &auth.session_storage,
                &auth.meta_tokens,
                &exchanges,
            ));
        }

        let mut base_urls = Vec::new();
        let mut seen_bases = BTreeSet::new();
        let mut domains = Vec::new();
        let mut seen_domains = BTreeSet::new();
        for exchange in &exchanges {
            if let Ok(parsed) = url::Url::parse(&exchange.request.url) {
                if let Some(host) = parsed.host_str() {
                    let base = format!("{}://{}", parsed.scheme(), host);
                    if seen_bases.insert(base.clone()) {
                        base_urls.push(base);
                    }
                    if seen_domains.insert(host.to_string()) {
                        domains.push(host.to_string());
                    }
                }
            }
        }

        let endpoint_groups = analyze_endpoints(&exchanges);
        let auth_method = auth.auth_method();

        Self {
            exchanges,
            auth,
            auth_method,
            endpoint_groups,
            base_urls,
            domains,
        }
    }

    /// Primary base URL (first observed)
    pub fn base_url(&self) -> Option<&str> {
        self.base_urls.first().map(|s| s.as_str())
    }

    /// Primary domain (first observed)
    pub fn domain(&self) -> Option<&str> {
        self.domains.first().map(|s| s.as_str())
    }
}
