//! Skill manifest model
//!
//! The marketplace-facing description of a learned skill: endpoints with
//! schemas, auth method, lifecycle, and the capture cost that produced it.
//! Field names are the wire format; renames need a `schema_version` bump.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::analyze::endpoints::{PathParamSpec, QueryParamSpec};
use crate::auth::extract::AuthMethod;
use crate::auth::refresh::RefreshConfig;

/// Current manifest schema version
pub const SCHEMA_VERSION: u32 = 2;

/// How a skill is executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionType {
    Api,
    BrowserCapture,
    DomExtraction,
}

/// Publication lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
    Draft,
    Active,
    Deprecated,
}

/// Endpoint probe status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationStatus {
    Unverified,
    Verified,
    Failing,
}

/// One callable endpoint of a skill
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillEndpoint {
    pub endpoint_id: String,
    pub method: String,
    /// Absolute URL template, e.g. `https://api.x.com/v2/{year}/modules/{moduleId}.json`
    pub url_template: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub path_params: Vec<PathParamSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub query_params: Vec<QueryParamSpec>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub request_body_schema: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub response_schema: BTreeMap<String, String>,
    /// ID-like fields this endpoint yields / needs; drives replay ordering
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub produces: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub consumes: Vec<String>,
    pub reliability_score: f64,
    pub verification_status: VerificationStatus,
    /// DOM extraction recipe for skills that never found a clean API
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dom_extraction: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_config: Option<RefreshConfig>,
    /// Number of captured examples behind this endpoint
    #[serde(default)]
    pub example_count: usize,
}

/// What the originating capture cost; baselines for token-savings accounting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryCost {
    pub capture_ms: u64,
    pub capture_tokens: u64,
    pub response_bytes: u64,
    pub captured_at: DateTime<Utc>,
}

/// A reproducible, parametrized set of HTTP endpoints with auth hooks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillManifest {
    pub skill_id: String,
    /// Content hash over the stable fields; recomputed on every change
    pub version: String,
    pub schema_version: u32,
    pub name: String,
    /// Natural-language sentence used as the semantic search key
    pub intent_signature: String,
    pub domain: String,
    pub description: String,
    pub owner_type: String,
    pub execution_type: ExecutionType,
    pub endpoints: Vec<SkillEndpoint>,
    pub auth_method: AuthMethod,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub base_urls: Vec<String>,
    pub lifecycle: Lifecycle,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discovery_cost: Option<DiscoveryCost>,
    /// Set when the refresh config kept failing; the skill still works until
    /// its current token expires
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_degraded: Option<bool>,
}

impl SkillManifest {
    /// Filesystem slug, e.g. `api-nusmods-com`
    pub fn slug(&self) -> String {
        slugify(&self.domain)
    }

    /// Mean endpoint reliability, 0.5 when the skill has no endpoints
    pub fn avg_reliability(&self) -> f64 {
        if self.endpoints.is_empty() {
            return 0.5;
        }
        let total: f64 = self.endpoints.iter().map(|e| e.reliability_score).sum();
        total / self.endpoints.len() as f64
    }

    /// 1.0 when every endpoint verified, 0.5 when some, 0.0 when none
    pub fn verification_bonus(&self) -> f64 {
        let verified = self
            .endpoints
            .iter()
            .filter(|e| e.verification_status == VerificationStatus::Verified)
            .count();
        if self.endpoints.is_empty() || verified == 0 {
            0.0
        } else if verified == self.endpoints.len() {
            1.0
        } else {
            0.5
        }
    }

    /// Endpoint lookup by id
    pub fn endpoint(&self, endpoint_id: &str) -> Option<&SkillEndpoint> {
        self.endpoints.iter().find(|e| e.endpoint_id == endpoint_id)
    }

    /// True when the skill relies on DOM extraction instead of an API
    pub fn uses_dom_extraction(&self) -> bool {
        self.execution_type == ExecutionType::DomExtraction
            || self.endpoints.iter().any(|e| e.dom_extraction.is_some())
    }
}

/// Lowercase, dot/slash-free identifier for directories and ids
pub fn slugify(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut last_dash = true;
    for c in input.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    out
}
