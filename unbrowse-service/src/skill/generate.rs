//! Skill generation
//!
//! Deterministic given the analyzed exchange set and the clock: the same
//! capture always yields the same endpoints and the same content-hash
//! version. Merging folds a later capture into an existing skill without
//! losing verified state.

use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::BTreeMap;

use super::manifest::{
    slugify, DiscoveryCost, ExecutionType, Lifecycle, SkillEndpoint, SkillManifest,
    VerificationStatus, SCHEMA_VERSION,
};
use crate::analyze::endpoints::EndpointCategory;
use crate::analyze::AnalyzedExchangeSet;
use crate::auth::refresh::extract_refresh_config;
use crate::correlate::sha256_hex;

/// Starting reliability for a freshly learned endpoint
const INITIAL_RELIABILITY: f64 = 0.5;

/// Generate a skill manifest from a sealed, analyzed capture.
pub fn generate_skill(
    set: &AnalyzedExchangeSet,
    discovery_cost: Option<DiscoveryCost>,
    now: DateTime<Utc>,
) -> SkillManifest {
    let domain = set.domain().unwrap_or("unknown").to_string();
    let base_url = set.base_url().unwrap_or_default().to_string();

    let mut endpoints: Vec<SkillEndpoint> = Vec::with_capacity(set.endpoint_groups.len());
    for group in &set.endpoint_groups {
        let url_template = format!("{}{}", base_url, group.normalized_path);

        // Auth endpoints that look like token refreshes carry their config so
        // the scheduler can keep the skill alive.
        let refresh_config = (group.category == EndpointCategory::Auth)
            .then(|| {
                group.example_indices.iter().find_map(|&i| {
                    set.exchanges
                        .iter()
                        .find(|e| e.index == i)
                        .and_then(extract_refresh_config)
                })
            })
            .flatten();

        endpoints.push(SkillEndpoint {
            endpoint_id: endpoint_id_for(&group.method, &group.normalized_path),
            method: group.method.clone(),
            url_template,
            path_params: group.path_params.clone(),
            query_params: group.query_params.clone(),
            request_body_schema: group.request_body_schema.clone(),
            response_schema: group.response_body_schema.clone(),
            produces: group.produces.clone(),
            consumes: group.consumes.clone(),
            reliability_score: INITIAL_RELIABILITY,
            verification_status: VerificationStatus::Unverified,
            dom_extraction: None,
            refresh_config,
            example_count: group.example_count,
        });
    }

    let intent_signature = intent_signature_for(&domain, set);
    let skill_id = format!(
        "skill_{}",
        &sha256_hex(&format!("{}|{}", domain, intent_signature))[..16]
    );

    let mut manifest = SkillManifest {
        skill_id,
        version: String::new(),
        schema_version: SCHEMA_VERSION,
        name: slugify(&domain),
        intent_signature,
        domain,
        description: format!(
            "Learned API surface with {} endpoint(s), captured from live browsing",
            endpoints.len()
        ),
        owner_type: "user".to_string(),
        execution_type: ExecutionType::Api,
        endpoints,
        auth_method: set.auth_method,
        base_urls: set.base_urls.clone(),
        lifecycle: Lifecycle::Active,
        created_at: now,
        updated_at: now,
        discovery_cost,
        refresh_degraded: None,
    };
    manifest.version = version_hash(&manifest);
    manifest
}

fn endpoint_id_for(method: &str, normalized_path: &str) -> String {
    slugify(&format!("{} {}", method, normalized_path))
}

/// One natural-language sentence describing what the skill does; the
/// semantic search key in the marketplace index.
fn intent_signature_for(domain: &str, set: &AnalyzedExchangeSet) -> String {
    let mut verbs: Vec<String> = Vec::new();
    for group in set.endpoint_groups.iter().take(3) {
        verbs.push(group.description.to_ascii_lowercase());
    }
    if verbs.is_empty() {
        format!("Call the {} API", domain)
    } else {
        format!("Use {} to {}", domain, verbs.join("; "))
    }
}

/// Content hash over the stable fields: sorted endpoints, auth method, and
/// base URLs. Timestamps and scores never participate, so regenerating from
/// the same capture reproduces the hash.
pub fn version_hash(manifest: &SkillManifest) -> String {
    let mut endpoints: Vec<serde_json::Value> = manifest
        .endpoints
        .iter()
        .map(|e| {
            json!({
                "method": e.method,
                "url_template": e.url_template,
                "request_body_schema": e.request_body_schema,
                "response_schema": e.response_schema,
            })
        })
        .collect();
    endpoints.sort_by_key(|v| {
        format!(
            "{} {}",
            v["method"].as_str().unwrap_or_default(),
            v["url_template"].as_str().unwrap_or_default()
        )
    });

    let mut bases = manifest.base_urls.clone();
    bases.sort();

    let stable = json!({
        "auth_method": manifest.auth_method,
        "base_urls": bases,
        "endpoints": endpoints,
    });
    sha256_hex(&stable.to_string())
}

/// Fold a later capture into an existing skill.
///
/// Endpoints union by (method, url_template); verified state and the higher
/// reliability survive; parameter examples stay from the first source.
pub fn merge_skills(base: &SkillManifest, update: &SkillManifest, now: DateTime<Utc>) -> SkillManifest {
    let mut merged = base.clone();
    let mut by_key: BTreeMap<(String, String), usize> = merged
        .endpoints
        .iter()
        .enumerate()
        .map(|(i, e)| ((e.method.clone(), e.url_template.clone()), i))
        .collect();

    for incoming in &update.endpoints {
        let key = (incoming.method.clone(), incoming.url_template.clone());
        match by_key.get(&key) {
            Some(&i) => {
                let existing = &mut merged.endpoints[i];
                if incoming.verification_status == VerificationStatus::Verified {
                    existing.verification_status = VerificationStatus::Verified;
                }
                existing.reliability_score =
                    existing.reliability_score.max(incoming.reliability_score);
                existing.example_count += incoming.example_count;
                for (field, tag) in &incoming.request_body_schema {
                    existing
                        .request_body_schema
                        .entry(field.clone())
                        .or_insert_with(|| tag.clone());
                }
                for (field, tag) in &incoming.response_schema {
                    existing
                        .response_schema
                        .entry(field.clone())
                        .or_insert_with(|| tag.clone());
                }
                for name in &incoming.produces {
                    if !existing.produces.contains(name) {
                        existing.produces.push(name.clone());
                    }
                }
                for name in &incoming.consumes {
                    if !existing.consumes.contains(name) {
                        existing.consumes.push(name.clone());
                    }
                }
                if existing.refresh_config.is_none() {
                    existing.refresh_config = incoming.refresh_config.clone();
                }
            }
            None => {
                by_key.insert(key, merged.endpoints.len());
                merged.endpoints.push(incoming.clone());
            }
        }
    }

    merged.updated_at = now;
    merged.version = version_hash(&merged);
    merged
}

/// Human-readable endpoint delta between two manifests.
pub fn diff_skills(before: &SkillManifest, after: &SkillManifest) -> String {
    let key = |e: &SkillEndpoint| (e.method.clone(), e.url_template.clone());
    let before_map: BTreeMap<_, &SkillEndpoint> =
        before.endpoints.iter().map(|e| (key(e), e)).collect();
    let after_map: BTreeMap<_, &SkillEndpoint> =
        after.endpoints.iter().map(|e| (key(e), e)).collect();

    let added = after_map.keys().filter(|k| !before_map.contains_key(*k)).count();
    let removed = before_map.keys().filter(|k| !after_map.contains_key(*k)).count();
    let changed = after_map
        .iter()
        .filter(|(k, e)| {
            before_map.get(*k).is_some_and(|old| {
                old.request_body_schema != e.request_body_schema
                    || old.response_schema != e.response_schema
                    || old.verification_status != e.verification_status
            })
        })
        .count();

    format!("{} added, {} changed, {} removed", added, changed, removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{CapturedExchange, CapturedRequest, CapturedResponse, ParamMap};
    use serde_json::json;

    fn sample_set() -> AnalyzedExchangeSet {
        let exchanges = vec![
            CapturedExchange {
                index: 0,
                timestamp: 0,
                request: CapturedRequest {
                    method: "GET".into(),
                    url: "https://api.nusmods.com/v2/2024-2025/modules/CS2030S.json".into(),
                    ..Default::default()
                },
                response: CapturedResponse {
                    status: 200,
                    body: Some(json!({"moduleCode": "CS2030S", "title": "Programming"})),
                    ..Default::default()
                },
            },
            CapturedExchange {
                index: 1,
                timestamp: 1,
                request: CapturedRequest {
                    method: "GET".into(),
                    url: "https://api.nusmods.com/v2/2024-2025/modules/MA2001.json".into(),
                    ..Default::default()
                },
                response: CapturedResponse {
                    status: 200,
                    body: Some(json!({"moduleCode": "MA2001", "title": "Linear Algebra"})),
                    ..Default::default()
                },
            },
        ];
        AnalyzedExchangeSet::build(
            exchanges,
            ParamMap::new(),
            Default::default(),
            Default::default(),
            Default::default(),
        )
    }

    #[test]
    fn test_generate_produces_absolute_templates() {
        let skill = generate_skill(&sample_set(), None, Utc::now());
        assert_eq!(skill.domain, "api.nusmods.com");
        assert_eq!(skill.endpoints.len(), 1);
        assert_eq!(
            skill.endpoints[0].url_template,
            "https://api.nusmods.com/v2/{year}/modules/{moduleId}.json"
        );
        assert_eq!(skill.endpoints[0].example_count, 2);
        assert_eq!(skill.execution_type, ExecutionType::Api);
        assert!(!skill.version.is_empty());
    }

    #[test]
    fn test_version_hash_round_trip_is_stable() {
        // Serialize, reload, regenerate: same version hash.
        let skill = generate_skill(&sample_set(), None, Utc::now());
        let serialized = serde_json::to_string(&skill).unwrap();
        let reloaded: SkillManifest = serde_json::from_str(&serialized).unwrap();
        assert_eq!(version_hash(&reloaded), skill.version);

        // Regenerating from the same capture at a different time too.
        let again = generate_skill(&sample_set(), None, Utc::now());
        assert_eq!(again.version, skill.version);
    }

    #[test]
    fn test_version_hash_ignores_reliability_but_sees_schema() {
        let skill = generate_skill(&sample_set(), None, Utc::now());
        let mut tweaked = skill.clone();
        tweaked.endpoints[0].reliability_score = 0.99;
        assert_eq!(version_hash(&tweaked), skill.version);

        tweaked.endpoints[0]
            .response_schema
            .insert("newField".into(), "string".into());
        assert_ne!(version_hash(&tweaked), skill.version);
    }

    #[test]
    fn test_merge_prefers_verified_and_max_reliability() {
        let base = generate_skill(&sample_set(), None, Utc::now());
        let mut update = base.clone();
        update.endpoints[0].verification_status = VerificationStatus::Verified;
        update.endpoints[0].reliability_score = 0.9;
        update.endpoints[0].query_params = vec![crate::analyze::endpoints::QueryParamSpec {
            name: "expand".into(),
            required: false,
            example: "second-capture".into(),
        }];

        let merged = merge_skills(&base, &update, Utc::now());
        assert_eq!(merged.endpoints.len(), 1);
        assert_eq!(
            merged.endpoints[0].verification_status,
            VerificationStatus::Verified
        );
        assert_eq!(merged.endpoints[0].reliability_score, 0.9);
        // First source keeps its parameter examples.
        assert!(merged.endpoints[0].query_params.is_empty());
    }

    #[test]
    fn test_merge_unions_new_endpoints() {
        let base = generate_skill(&sample_set(), None, Utc::now());
        let mut update = base.clone();
        let mut extra = update.endpoints[0].clone();
        extra.method = "POST".into();
        extra.url_template = "https://api.nusmods.com/v2/feedback".into();
        update.endpoints.push(extra);

        let merged = merge_skills(&base, &update, Utc::now());
        assert_eq!(merged.endpoints.len(), 2);
        assert_ne!(merged.version, base.version);
    }

    #[test]
    fn test_diff_counts() {
        let base = generate_skill(&sample_set(), None, Utc::now());
        let mut after = base.clone();
        let mut extra = after.endpoints[0].clone();
        extra.url_template = "https://api.nusmods.com/v2/venues".into();
        after.endpoints.push(extra);
        after.endpoints[0]
            .response_schema
            .insert("injected".into(), "string".into());

        assert_eq!(diff_skills(&base, &after), "1 added, 1 changed, 0 removed");
        assert_eq!(diff_skills(&after, &base), "0 added, 1 changed, 1 removed");
    }
}
