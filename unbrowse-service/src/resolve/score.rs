//! Candidate scoring
//!
//! Marketplace candidates are ranked by a composite of semantic similarity,
//! endpoint reliability, freshness, and verification coverage. Learned
//! endpoints are ranked against the intent for the auto-execute decision.

use chrono::Utc;

use crate::skill::manifest::{SkillEndpoint, SkillManifest};

/// Auto-execute needs the top endpoint at or above this score
pub const AUTO_EXECUTE_MIN_SCORE: i64 = 15;

/// ... and this far ahead of the runner-up
pub const AUTO_EXECUTE_MIN_LEAD: i64 = 3;

/// Composite candidate score in [0, 1]
pub fn composite_score(embedding_score: f64, manifest: &SkillManifest) -> f64 {
    0.40 * embedding_score.clamp(0.0, 1.0)
        + 0.30 * manifest.avg_reliability()
        + 0.15 * freshness_score(manifest)
        + 0.15 * manifest.verification_bonus()
}

/// 1 at the moment of update, halving every 30 days
fn freshness_score(manifest: &SkillManifest) -> f64 {
    let days = (Utc::now() - manifest.updated_at).num_days().max(0) as f64;
    1.0 / (1.0 + days / 30.0)
}

/// Registrable-domain suffix, naive eTLD+1: `app.example.co.uk` ->
/// `example.co.uk`, `api.example.com` -> `example.com`.
pub fn registrable_suffix(domain: &str) -> String {
    const SECOND_LEVEL: &[&str] = &["co", "com", "org", "net", "ac", "gov", "edu"];
    let labels: Vec<&str> = domain.split('.').filter(|l| !l.is_empty()).collect();
    let n = labels.len();
    if n <= 2 {
        return labels.join(".");
    }
    let tld = labels[n - 1];
    let second = labels[n - 2];
    if tld.len() == 2 && SECOND_LEVEL.contains(&second) {
        labels[n - 3..].join(".")
    } else {
        labels[n - 2..].join(".")
    }
}

/// True when both hosts share a registrable domain
pub fn same_registrable_domain(a: &str, b: &str) -> bool {
    let a = registrable_suffix(&a.to_ascii_lowercase());
    !a.is_empty() && a == registrable_suffix(&b.to_ascii_lowercase())
}

/// Intent affinity of a learned endpoint, for the post-capture decision.
pub fn endpoint_intent_score(endpoint: &SkillEndpoint, intent: &str) -> i64 {
    let haystack = format!("{} {}", endpoint.url_template, endpoint.method).to_ascii_lowercase();
    let mut score: i64 = 0;
    for token in intent
        .to_ascii_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| t.len() > 2)
    {
        if haystack.contains(token) {
            score += 6;
        }
    }
    if endpoint.method == "GET" {
        score += 6;
    }
    if !endpoint.response_schema.is_empty() {
        score += 4;
    }
    // Templated endpoints need witness values; concrete ones replay as-is.
    if !endpoint.url_template.contains('{') {
        score += 2;
    }
    score
}

/// Pick the endpoint to auto-execute, if the ranking is decisive enough.
pub fn auto_execute_choice<'a>(
    endpoints: &'a [SkillEndpoint],
    intent: &str,
    auth_required: bool,
) -> Option<&'a SkillEndpoint> {
    if auth_required {
        return None;
    }
    let mut ranked: Vec<(i64, &SkillEndpoint)> = endpoints
        .iter()
        .map(|e| (endpoint_intent_score(e, intent), e))
        .collect();
    ranked.sort_by(|a, b| b.0.cmp(&a.0));

    let (top_score, top) = ranked.first()?;
    let runner_up = ranked.get(1).map(|(s, _)| *s).unwrap_or(0);
    if *top_score >= AUTO_EXECUTE_MIN_SCORE
        && top_score - runner_up >= AUTO_EXECUTE_MIN_LEAD
        && !top.response_schema.is_empty()
    {
        Some(top)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::skill::manifest::{ExecutionType, Lifecycle, VerificationStatus, SCHEMA_VERSION};
    use chrono::Duration;
    use std::collections::BTreeMap;

    fn endpoint(method: &str, url: &str, with_schema: bool) -> SkillEndpoint {
        let mut response_schema = BTreeMap::new();
        if with_schema {
            response_schema.insert("id".to_string(), "string".to_string());
        }
        SkillEndpoint {
            endpoint_id: crate::skill::slugify(&format!("{} {}", method, url)),
            method: method.into(),
            url_template: url.into(),
            path_params: Vec::new(),
            query_params: Vec::new(),
            request_body_schema: BTreeMap::new(),
            response_schema,
            produces: Vec::new(),
            consumes: Vec::new(),
            reliability_score: 0.5,
            verification_status: VerificationStatus::Unverified,
            dom_extraction: None,
            refresh_config: None,
            example_count: 1,
        }
    }

    fn manifest(endpoints: Vec<SkillEndpoint>, age_days: i64) -> SkillManifest {
        SkillManifest {
            skill_id: "s".into(),
            version: "v".into(),
            schema_version: SCHEMA_VERSION,
            name: "n".into(),
            intent_signature: "i".into(),
            domain: "x.test".into(),
            description: "d".into(),
            owner_type: "user".into(),
            execution_type: ExecutionType::Api,
            endpoints,
            auth_method: crate::auth::AuthMethod::None,
            base_urls: Vec::new(),
            lifecycle: Lifecycle::Active,
            created_at: Utc::now() - Duration::days(age_days),
            updated_at: Utc::now() - Duration::days(age_days),
            discovery_cost: None,
            refresh_degraded: None,
        }
    }

    #[test]
    fn test_composite_score_weights() {
        // Fresh skill, all verified, reliability 1.0, perfect embedding.
        let mut perfect = manifest(vec![endpoint("GET", "https://x.test/a", true)], 0);
        perfect.endpoints[0].reliability_score = 1.0;
        perfect.endpoints[0].verification_status = VerificationStatus::Verified;
        let score = composite_score(1.0, &perfect);
        assert!((score - 1.0).abs() < 1e-9);

        // Zero embedding, no endpoints: reliability midpoint plus freshness.
        let empty = manifest(Vec::new(), 0);
        let score = composite_score(0.0, &empty);
        assert!((score - (0.30 * 0.5 + 0.15)).abs() < 1e-9);
    }

    #[test]
    fn test_freshness_decays() {
        let fresh = manifest(Vec::new(), 0);
        let month_old = manifest(Vec::new(), 30);
        let stale = manifest(Vec::new(), 300);
        assert!(composite_score(0.5, &fresh) > composite_score(0.5, &month_old));
        assert!(composite_score(0.5, &month_old) > composite_score(0.5, &stale));
        // 30 days old halves the freshness term.
        let s = composite_score(0.0, &month_old) - 0.30 * 0.5;
        assert!((s - 0.075).abs() < 1e-3);
    }

    #[test]
    fn test_registrable_suffix() {
        assert_eq!(registrable_suffix("api.example.com"), "example.com");
        assert_eq!(registrable_suffix("example.com"), "example.com");
        assert_eq!(registrable_suffix("app.example.co.uk"), "example.co.uk");
        assert_eq!(registrable_suffix("deep.sub.example.org"), "example.org");
    }

    #[test]
    fn test_same_registrable_domain() {
        assert!(same_registrable_domain("api.example.com", "www.example.com"));
        assert!(same_registrable_domain("example.com", "example.com"));
        assert!(!same_registrable_domain("example.com", "example.org"));
        assert!(!same_registrable_domain("evil-example.com", "example.com"));
    }

    #[test]
    fn test_auto_execute_requires_decisive_lead() {
        let endpoints = vec![
            endpoint("GET", "https://x.test/api/stories", true),
            endpoint("POST", "https://x.test/api/submit", false),
        ];
        let choice = auto_execute_choice(&endpoints, "list the stories", false);
        assert!(choice.is_some());
        assert_eq!(choice.unwrap().method, "GET");

        // Two equally plausible GETs: no decisive lead, defer to the agent.
        let tied = vec![
            endpoint("GET", "https://x.test/api/stories", true),
            endpoint("GET", "https://x.test/api/stories2", true),
        ];
        assert!(auto_execute_choice(&tied, "list the stories", false).is_none());
    }

    #[test]
    fn test_auto_execute_blocked_by_auth_or_missing_schema() {
        let endpoints = vec![endpoint("GET", "https://x.test/api/stories", true)];
        assert!(auto_execute_choice(&endpoints, "list the stories", true).is_none());

        let schemaless = vec![endpoint("GET", "https://x.test/api/stories", false)];
        assert!(auto_execute_choice(&schemaless, "list the stories", false).is_none());
    }
}
