//! Endpoint verification
//!
//! Freshly learned GET endpoints get one probe each. Concrete paths that
//! answer 2xx are marked verified; failures are pruned from the skill.
//! Templated paths cannot be probed without witness values and are counted
//! as not testable rather than removed.

use crate::analyze::classify::{classify_header, HeaderCategory};
use crate::analyze::profile::HeaderProfile;
use crate::exchange::{HeaderMap, ParamMap};
use crate::replay::{PreparedRequest, Transport};
use crate::skill::manifest::{SkillManifest, VerificationStatus};

/// Outcome of a verification pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerificationSummary {
    pub tested: usize,
    pub passed: usize,
    /// endpoint_ids pruned after a failed probe
    pub removed: Vec<String>,
    /// Templated or non-GET endpoints, left untouched
    pub skipped: usize,
}

/// Probe every concrete GET endpoint of the skill, pruning failures.
pub async fn verify_endpoints(
    manifest: &mut SkillManifest,
    profile: Option<&HeaderProfile>,
    cookies: &ParamMap,
    transport: &dyn Transport,
) -> VerificationSummary {
    let mut summary = VerificationSummary::default();

    // Probes carry only app-category headers plus the session cookies.
    let mut headers = HeaderMap::new();
    if let Some(profile) = profile {
        for (name, value) in &profile.common_headers {
            if classify_header(name) == HeaderCategory::App {
                headers.insert(name.clone(), value.clone());
            }
        }
    }
    if !cookies.is_empty() {
        let cookie_line = cookies
            .iter()
            .map(|(n, v)| format!("{}={}", n, v))
            .collect::<Vec<_>>()
            .join("; ");
        headers.insert("Cookie", cookie_line);
    }

    let mut failed: Vec<String> = Vec::new();
    for endpoint in manifest.endpoints.iter_mut() {
        if endpoint.method != "GET" || endpoint.url_template.contains('{') {
            summary.skipped += 1;
            continue;
        }
        summary.tested += 1;

        let request = PreparedRequest {
            method: "GET".to_string(),
            url: endpoint.url_template.clone(),
            headers: headers.clone(),
            body_text: None,
        };
        let ok = match transport.execute(&request).await {
            Ok(response) => (200..300).contains(&response.status),
            Err(e) => {
                tracing::warn!(endpoint = %endpoint.endpoint_id, "Verification probe failed: {}", e);
                false
            }
        };

        if ok {
            summary.passed += 1;
            endpoint.verification_status = VerificationStatus::Verified;
        } else {
            endpoint.verification_status = VerificationStatus::Failing;
            failed.push(endpoint.endpoint_id.clone());
        }
    }

    manifest
        .endpoints
        .retain(|e| e.verification_status != VerificationStatus::Failing);
    summary.removed = failed;
    summary
}
