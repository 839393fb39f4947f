//! Marketplace HTTP client
//!
//! Thin client over the index API (search, domain search, fetch, publish)
//! with a status-aware backoff guard: a rejected or failing index is left
//! alone for a while instead of being hammered on every resolve.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::manifest::SkillManifest;
use super::store::MarketplaceRef;
use crate::analyze::profile::HeaderProfile;
use crate::error::{Error, Result};

/// One search result from the index
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: String,
    pub score: f64,
    #[serde(default)]
    pub metadata: Value,
}

/// Backoff window for a failing index, by failure class
pub fn backoff_for_status(status: u16) -> Duration {
    match status {
        // Quality-gate rejection: resubmitting the same skill will not help.
        422 => Duration::hours(24),
        401 | 403 => Duration::minutes(30),
        500..=599 => Duration::minutes(10),
        _ => Duration::minutes(5),
    }
}

pub struct MarketplaceClient {
    base_url: String,
    http: reqwest::Client,
    /// base URL -> retry-after instant
    backoff: DashMap<String, DateTime<Utc>>,
    search_timeout: std::time::Duration,
    download_timeout: std::time::Duration,
    health_timeout: std::time::Duration,
}

impl MarketplaceClient {
    pub fn new(
        base_url: impl Into<String>,
        search_timeout: std::time::Duration,
        download_timeout: std::time::Duration,
        health_timeout: std::time::Duration,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
            backoff: DashMap::new(),
            search_timeout,
            download_timeout,
            health_timeout,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn check_backoff(&self) -> Result<()> {
        if let Some(until) = self.backoff.get(&self.base_url) {
            if *until > Utc::now() {
                return Err(Error::Upstream(format!(
                    "marketplace {} backing off until {}",
                    self.base_url,
                    until.to_rfc3339()
                )));
            }
        }
        self.backoff.remove(&self.base_url);
        Ok(())
    }

    fn record_failure(&self, status: u16) {
        let until = Utc::now() + backoff_for_status(status);
        tracing::warn!(
            status,
            until = %until.to_rfc3339(),
            "Marketplace call failed, backing off"
        );
        self.backoff.insert(self.base_url.clone(), until);
    }

    /// Liveness probe with a short timeout; never backs the index off
    pub async fn health(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        matches!(
            self.http.get(&url).timeout(self.health_timeout).send().await,
            Ok(response) if response.status().is_success()
        )
    }

    /// Global semantic search
    pub async fn search(&self, intent: &str, k: usize) -> Result<Vec<SearchHit>> {
        self.post_search("/skills/search", json!({"intent": intent, "k": k}))
            .await
    }

    /// Domain-scoped semantic search
    pub async fn search_domain(
        &self,
        intent: &str,
        domain: &str,
        k: usize,
    ) -> Result<Vec<SearchHit>> {
        self.post_search(
            "/skills/search/domain",
            json!({"intent": intent, "domain": domain, "k": k}),
        )
        .await
    }

    async fn post_search(&self, path: &str, body: Value) -> Result<Vec<SearchHit>> {
        self.check_backoff()?;
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http
            .post(&url)
            .timeout(self.search_timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                self.record_failure(0);
                Error::Upstream(format!("marketplace search failed: {}", e))
            })?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            self.record_failure(status);
            return Err(Error::Upstream(format!("marketplace search returned {}", status)));
        }
        response
            .json()
            .await
            .map_err(|e| Error::Upstream(format!("marketplace search response corrupt: {}", e)))
    }

    /// Download a skill manifest by id
    pub async fn get_skill(&self, skill_id: &str) -> Result<SkillManifest> {
        self.check_backoff()?;
        let url = format!("{}/skills/{}", self.base_url, skill_id);
        let response = self
            .http
            .get(&url)
            .timeout(self.download_timeout)
            .send()
            .await
            .map_err(|e| {
                self.record_failure(0);
                Error::Upstream(format!("skill download failed: {}", e))
            })?;
        match response.status().as_u16() {
            200..=299 => response
                .json()
                .await
                .map_err(|e| Error::Upstream(format!("skill manifest corrupt: {}", e))),
            404 => Err(Error::NotFound(format!("skill {} not in the index", skill_id))),
            status => {
                self.record_failure(status);
                Err(Error::Upstream(format!("skill download returned {}", status)))
            }
        }
    }

    /// Publish a skill with its sanitized header profile
    pub async fn publish(
        &self,
        manifest: &SkillManifest,
        profile: Option<&HeaderProfile>,
        signature: Option<&str>,
    ) -> Result<MarketplaceRef> {
        self.check_backoff()?;
        let url = format!("{}/skills/publish", self.base_url);
        let body = json!({
            "skill": manifest,
            "header_profile": profile,
            "signature": signature,
        });
        let response = self
            .http
            .post(&url)
            .timeout(self.download_timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                self.record_failure(0);
                Error::Upstream(format!("publish failed: {}", e))
            })?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            self.record_failure(status);
            return Err(Error::Upstream(format!("publish returned {}", status)));
        }

        #[derive(Deserialize)]
        struct PublishResponse {
            skill_id: String,
        }
        let parsed: PublishResponse = response
            .json()
            .await
            .map_err(|e| Error::Upstream(format!("publish response corrupt: {}", e)))?;
        Ok(MarketplaceRef {
            skill_id: parsed.skill_id,
            index_url: self.base_url.clone(),
            name: manifest.name.clone(),
        })
    }
}
