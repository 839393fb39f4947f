//! Resolver / orchestrator
//!
//! Route cache, then local disk, then a parallel marketplace search with a
//! ranked candidate race, then live capture as the last resort. Every branch
//! produces an `OrchestrationTiming` and ships it fire-and-forget.

pub mod cache;
pub mod score;

use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::auth::credentials::CredentialProvider;
use crate::auth::scheduler::RefreshScheduler;
use crate::browser::BrowserControl;
use crate::error::{Error, Result};
use crate::exchange::HeaderMap;
use crate::replay::{
    execute_capture_chain, ChainOptions, PreparedRequest, StepResponseRuntime, Transport,
};
use crate::session::{run_capture_session, CaptureOutcome, SessionRegistry};
use crate::skill::store::AuthFile;
use crate::skill::{MarketplaceClient, SearchHit, SkillEndpoint, SkillManifest, SkillStore};
use crate::telemetry::{
    savings, ExecutionTrace, OrchestrationTiming, ResolveSource, TelemetrySink,
};

pub use cache::{CaptureGuard, ResolverCaches, RouteCacheEntry};
pub use score::{auto_execute_choice, composite_score, same_registrable_domain};

const DOMAIN_SEARCH_K: usize = 5;
const GLOBAL_SEARCH_K: usize = 10;

/// Caller-provided context for a resolve
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ResolveContext {
    pub url: Option<String>,
    pub domain: Option<String>,
}

impl ResolveContext {
    /// Target domain, from the explicit field or the context URL
    pub fn target_domain(&self) -> Option<String> {
        if let Some(domain) = &self.domain {
            return Some(domain.clone());
        }
        self.url
            .as_deref()
            .and_then(|u| url::Url::parse(u).ok())
            .and_then(|u| u.host_str().map(|h| h.to_string()))
    }
}

/// Per-call switches
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ResolveOptions {
    pub dry_run: bool,
    pub force_capture: bool,
    pub endpoint_id: Option<String>,
    pub confirm_unsafe: bool,
}

/// Endpoint menu returned when the resolver defers the choice
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointSummary {
    pub endpoint_id: String,
    pub method: String,
    pub url_template: String,
}

/// What a resolve produced
#[derive(Debug)]
pub struct ResolveOutcome {
    pub result: Option<Value>,
    pub trace: Option<ExecutionTrace>,
    pub skill: Option<SkillManifest>,
    pub source: ResolveSource,
    pub timing: OrchestrationTiming,
    pub available_endpoints: Option<Vec<EndpointSummary>>,
    pub message: Option<String>,
}

/// Stage timings accumulated along a resolve
#[derive(Default)]
struct StageClock {
    search_ms: u64,
    get_skill_ms: u64,
    execute_ms: u64,
}

pub struct Resolver {
    store: Arc<SkillStore>,
    market: Arc<MarketplaceClient>,
    caches: Arc<ResolverCaches>,
    browser: Arc<dyn BrowserControl>,
    scheduler: Arc<RefreshScheduler>,
    telemetry: Arc<TelemetrySink>,
    sessions: Arc<SessionRegistry>,
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialProvider>,
    candidate_timeout: Duration,
    capture_timeout: Duration,
    max_candidates: usize,
    confidence_threshold: f64,
}

impl Resolver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<SkillStore>,
        market: Arc<MarketplaceClient>,
        caches: Arc<ResolverCaches>,
        browser: Arc<dyn BrowserControl>,
        scheduler: Arc<RefreshScheduler>,
        telemetry: Arc<TelemetrySink>,
        sessions: Arc<SessionRegistry>,
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn CredentialProvider>,
        candidate_timeout: Duration,
        capture_timeout: Duration,
        max_candidates: usize,
        confidence_threshold: f64,
    ) -> Self {
        Self {
            store,
            market,
            caches,
            browser,
            scheduler,
            telemetry,
            sessions,
            transport,
            credentials,
            candidate_timeout,
            capture_timeout,
            max_candidates,
            confidence_threshold,
        }
    }

    /// The full pipeline: cache, disk, marketplace, live capture.
    pub async fn resolve_and_execute(
        &self,
        intent: &str,
        params: &Value,
        context: &ResolveContext,
        options: &ResolveOptions,
    ) -> Result<ResolveOutcome> {
        if intent.trim().is_empty() {
            return Err(Error::Input("intent must not be empty".to_string()));
        }
        let total_start = Instant::now();
        let mut clock = StageClock::default();
        let domain = context.target_domain();
        let route_key = ResolverCaches::route_key(intent, domain.as_deref());

        if !options.force_capture {
            // 1. Route cache.
            if let Some(entry) = self.caches.route.get(&route_key) {
                match self.fetch_skill(&entry.skill_id, &mut clock).await {
                    Ok(skill) => {
                        match self
                            .try_execute(&skill, intent, params, options, &mut clock)
                            .await
                        {
                            Ok(Some((trace, response))) => {
                                return Ok(self.finish(
                                    skill,
                                    trace,
                                    response,
                                    ResolveSource::RouteCache,
                                    true,
                                    0,
                                    0,
                                    clock,
                                    total_start,
                                ));
                            }
                            Ok(None) | Err(_) => self.caches.route.remove(&route_key),
                        }
                    }
                    Err(_) => self.caches.route.remove(&route_key),
                }
            }

            // 2. Local disk cache.
            if let Some(domain) = domain.as_deref() {
                if let Ok(Some(skill)) = self.store.skill_for_domain(domain) {
                    if !skill.endpoints.is_empty() {
                        if let Ok(Some((trace, response))) = self
                            .try_execute(&skill, intent, params, options, &mut clock)
                            .await
                        {
                            self.caches.route.insert(
                                route_key.as_str(),
                                RouteCacheEntry {
                                    skill_id: skill.skill_id.clone(),
                                    domain: Some(domain.to_string()),
                                },
                            );
                            return Ok(self.finish(
                                skill,
                                trace,
                                response,
                                ResolveSource::RouteCache,
                                false,
                                0,
                                0,
                                clock,
                                total_start,
                            ));
                        }
                    }
                }
            }

            // 3 + 4. Marketplace search and candidate race.
            let (candidates, found) = self
                .marketplace_candidates(intent, domain.as_deref(), &mut clock)
                .await;
            if !candidates.is_empty() {
                let (winner, tried) = self
                    .race_candidates(candidates, intent, params, options, &mut clock)
                    .await;
                if let Some((skill, trace, response)) = winner {
                    self.caches.route.insert(
                        route_key.as_str(),
                        RouteCacheEntry {
                            skill_id: skill.skill_id.clone(),
                            domain: domain.clone(),
                        },
                    );
                    return Ok(self.finish(
                        skill,
                        trace,
                        response,
                        ResolveSource::Marketplace,
                        false,
                        found,
                        tried,
                        clock,
                        total_start,
                    ));
                }
            }
        }

        // 5 + 6. Live capture fallback.
        self.live_capture(intent, params, context, options, clock, total_start)
            .await
    }

    /// Execute a specific skill endpoint by id, for `/v1/skills/:id/execute`.
    pub async fn execute_skill_by_id(
        &self,
        skill_id: &str,
        endpoint_id: Option<&str>,
        params: &Value,
        confirm_unsafe: bool,
    ) -> Result<(SkillManifest, ExecutionTrace, StepResponseRuntime)> {
        let mut clock = StageClock::default();
        let skill = self.fetch_skill(skill_id, &mut clock).await?;
        let endpoint = match endpoint_id {
            Some(id) => skill
                .endpoint(id)
                .ok_or_else(|| Error::NotFound(format!("endpoint {} not on skill {}", id, skill_id)))?,
            None => skill
                .endpoints
                .first()
                .ok_or_else(|| Error::NotFound(format!("skill {} has no endpoints", skill_id)))?,
        };
        let (trace, response) = self
            .execute_endpoint(&skill, endpoint, params, confirm_unsafe)
            .await?;
        Ok((skill.clone(), trace, response))
    }

    async fn fetch_skill(&self, skill_id: &str, clock: &mut StageClock) -> Result<SkillManifest> {
        let start = Instant::now();
        let result = match self.store.load_skill_by_id(skill_id)? {
            Some(skill) => Ok(skill),
            None => self.market.get_skill(skill_id).await,
        };
        clock.get_skill_ms += start.elapsed().as_millis() as u64;
        result
    }

    /// Execute the best endpoint of a skill for this intent; Ok(None) means
    /// nothing executable (e.g. mutation without confirmation on a cached path).
    async fn try_execute(
        &self,
        skill: &SkillManifest,
        intent: &str,
        params: &Value,
        options: &ResolveOptions,
        clock: &mut StageClock,
    ) -> Result<Option<(ExecutionTrace, StepResponseRuntime)>> {
        let endpoint = match options.endpoint_id.as_deref() {
            Some(id) => skill.endpoint(id),
            None => {
                let auth_required = skill.auth_method != crate::auth::AuthMethod::None
                    && self.store.load_auth(&skill.slug()).ok().flatten().is_none();
                auto_execute_choice(&skill.endpoints, intent, auth_required)
                    .or_else(|| skill.endpoints.iter().find(|e| e.method == "GET"))
            }
        };
        let Some(endpoint) = endpoint else {
            return Ok(None);
        };
        let start = Instant::now();
        let result = self
            .execute_endpoint(skill, endpoint, params, options.confirm_unsafe)
            .await;
        clock.execute_ms += start.elapsed().as_millis() as u64;
        result.map(Some)
    }

    /// Build and send one endpoint request with the persisted auth state.
    async fn execute_endpoint(
        &self,
        skill: &SkillManifest,
        endpoint: &SkillEndpoint,
        params: &Value,
        confirm_unsafe: bool,
    ) -> Result<(ExecutionTrace, StepResponseRuntime)> {
        if !matches!(endpoint.method.as_str(), "GET" | "HEAD" | "OPTIONS") && !confirm_unsafe {
            return Err(Error::ConfirmRequired(format!(
                "{} {} mutates state; pass confirm_unsafe",
                endpoint.method, endpoint.url_template
            )));
        }

        let url = self.build_url(endpoint, params)?;
        let auth = self.store.load_auth(&skill.slug()).ok().flatten();
        let headers = self.build_headers(skill, auth.as_ref());
        let body_text = params
            .get("body")
            .filter(|_| !endpoint.request_body_schema.is_empty() || endpoint.method != "GET")
            .map(|b| b.to_string());

        let request = PreparedRequest {
            method: endpoint.method.clone(),
            url,
            headers,
            body_text,
        };

        let trace = ExecutionTrace::begin(&skill.skill_id, &endpoint.endpoint_id);
        let mut response = self.transport.execute(&request).await?;

        // Synchronous refresh-on-401 recovery, one attempt.
        if response.status == 401 {
            if let Ok(info) = self.scheduler.refresh_now(&skill.skill_id).await {
                if let Some(access) = info.access_token {
                    let mut retried = request.clone();
                    retried
                        .headers
                        .insert("Authorization", format!("Bearer {}", access));
                    response = self.transport.execute(&retried).await?;
                }
            }
        }

        let success = (200..300).contains(&response.status);
        let trace = trace.finish(success, Some(response.status));
        self.telemetry.emit_trace(&trace);
        if !success {
            return Err(Error::Upstream(format!(
                "{} {} returned {}",
                endpoint.method, request.url, response.status
            )));
        }
        Ok((trace, response))
    }

    fn build_url(&self, endpoint: &SkillEndpoint, params: &Value) -> Result<String> {
        let mut url = endpoint.url_template.clone();
        for param in &endpoint.path_params {
            let placeholder = format!("{{{}}}", param.name);
            if !url.contains(&placeholder) {
                continue;
            }
            let value = params
                .get(&param.name)
                .and_then(|v| match v {
                    Value::String(s) => Some(s.clone()),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                })
                .unwrap_or_else(|| param.example.clone());
            if value.is_empty() {
                return Err(Error::Input(format!("missing path parameter {}", param.name)));
            }
            url = url.replace(&placeholder, &value);
        }
        if url.contains('{') {
            return Err(Error::Input(format!("unresolved parameters in {}", url)));
        }

        let mut parsed = url::Url::parse(&url)
            .map_err(|e| Error::Input(format!("bad endpoint URL {}: {}", url, e)))?;
        let required: Vec<_> = endpoint.query_params.iter().filter(|p| p.required).collect();
        if !required.is_empty() {
            let mut query = parsed.query_pairs_mut();
            for param in required {
                let value = params
                    .get(&param.name)
                    .and_then(|v| match v {
                        Value::String(s) => Some(s.clone()),
                        Value::Number(n) => Some(n.to_string()),
                        _ => None,
                    })
                    .unwrap_or_else(|| param.example.clone());
                query.append_pair(&param.name, &value);
            }
        }
        Ok(parsed.to_string())
    }

    fn build_headers(&self, skill: &SkillManifest, auth: Option<&AuthFile>) -> HeaderMap {
        let profile = self.store.load_profile(&skill.domain).ok().flatten();
        let (auth_headers, cookies) = match auth {
            Some(auth) => (auth.headers.clone(), auth.cookies.clone()),
            None => (HeaderMap::new(), Default::default()),
        };
        match profile {
            Some(profile) => crate::analyze::profile::resolve_headers(
                &profile,
                "GET",
                "/",
                &auth_headers,
                &cookies,
                crate::analyze::profile::ResolveMode::Node,
            ),
            None => {
                let mut headers = auth_headers;
                if !cookies.is_empty() {
                    let line = cookies
                        .iter()
                        .map(|(n, v)| format!("{}={}", n, v))
                        .collect::<Vec<_>>()
                        .join("; ");
                    headers.insert("Cookie", line);
                }
                headers
            }
        }
    }

    /// Parallel domain + global search, merged domain-first, fetched,
    /// quality-gated, and scored.
    async fn marketplace_candidates(
        &self,
        intent: &str,
        domain: Option<&str>,
        clock: &mut StageClock,
    ) -> (Vec<(f64, SkillManifest)>, usize) {
        let start = Instant::now();
        let (domain_hits, global_hits) = match domain {
            Some(domain) => tokio::join!(
                self.market.search_domain(intent, domain, DOMAIN_SEARCH_K),
                self.market.search(intent, GLOBAL_SEARCH_K),
            ),
            None => (
                Ok(Vec::new()),
                self.market.search(intent, GLOBAL_SEARCH_K).await,
            ),
        };
        clock.search_ms += start.elapsed().as_millis() as u64;

        // Domain-scoped precision beats global recall on ties.
        let mut merged: Vec<SearchHit> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        for hit in domain_hits
            .unwrap_or_default()
            .into_iter()
            .chain(global_hits.unwrap_or_default())
        {
            if seen.insert(hit.id.clone()) {
                merged.push(hit);
            }
        }
        let found = merged.len();
        if merged.is_empty() {
            return (Vec::new(), 0);
        }

        let fetch_start = Instant::now();
        let fetched: Vec<(f64, SkillManifest)> = futures::future::join_all(
            merged
                .iter()
                .map(|hit| async move { (hit.score, self.market.get_skill(&hit.id).await) }),
        )
        .await
        .into_iter()
        .filter_map(|(score, result)| result.ok().map(|skill| (score, skill)))
        .collect();
        clock.get_skill_ms += fetch_start.elapsed().as_millis() as u64;

        let candidates: Vec<(f64, SkillManifest)> = fetched
            .into_iter()
            .filter(|(_, skill)| skill.lifecycle == crate::skill::Lifecycle::Active)
            .filter(|(_, skill)| candidate_quality_gate(skill, domain))
            .collect();
        (candidates, found)
    }

    /// Race the top candidates; first success wins, losers are cancelled.
    /// Returns the winner (if any) and how many candidates entered the race.
    async fn race_candidates(
        &self,
        candidates: Vec<(f64, SkillManifest)>,
        intent: &str,
        params: &Value,
        options: &ResolveOptions,
        clock: &mut StageClock,
    ) -> (
        Option<(SkillManifest, ExecutionTrace, StepResponseRuntime)>,
        usize,
    ) {
        let mut scored: Vec<(f64, SkillManifest)> = candidates
            .into_iter()
            .map(|(embedding, skill)| (composite_score(embedding, &skill), skill))
            .filter(|(score, _)| *score >= self.confidence_threshold)
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(self.max_candidates);
        if scored.is_empty() {
            return (None, 0);
        }
        let tried = scored.len();

        let start = Instant::now();
        let mut races: FuturesUnordered<_> = scored
            .into_iter()
            .map(|(_, skill)| {
                let params = params.clone();
                let options = options.clone();
                async move {
                    let mut local_clock = StageClock::default();
                    let result = tokio::time::timeout(
                        self.candidate_timeout,
                        self.try_execute(&skill, intent, &params, &options, &mut local_clock),
                    )
                    .await;
                    match result {
                        Ok(Ok(Some((trace, response)))) => Some((skill, trace, response)),
                        _ => None,
                    }
                }
            })
            .collect();

        let mut winner = None;
        while let Some(outcome) = races.next().await {
            if outcome.is_some() {
                winner = outcome;
                break;
            }
        }
        drop(races);
        clock.execute_ms += start.elapsed().as_millis() as u64;
        (winner, tried)
    }

    /// Live capture: exclusive per domain, bounded, learns and persists a
    /// skill, then auto-executes or defers.
    async fn live_capture(
        &self,
        intent: &str,
        params: &Value,
        context: &ResolveContext,
        options: &ResolveOptions,
        mut clock: StageClock,
        total_start: Instant,
    ) -> Result<ResolveOutcome> {
        let Some(url) = context.url.as_deref() else {
            return Err(Error::Input(
                "no skill matched and no context.url was provided for live capture".to_string(),
            ));
        };
        let domain = context.target_domain().unwrap_or_else(|| "unknown".to_string());
        let route_key = ResolverCaches::route_key(intent, Some(&domain));

        // A fresh capture for this domain may already be cached.
        if !options.force_capture {
            if let Some(skill) = self.caches.captured.get(&domain) {
                if let Ok(Some((trace, response))) = self
                    .try_execute(&skill, intent, params, options, &mut clock)
                    .await
                {
                    return Ok(self.finish(
                        skill,
                        trace,
                        response,
                        ResolveSource::LiveCapture,
                        true,
                        0,
                        0,
                        clock,
                        total_start,
                    ));
                }
            }
        }

        let Some(_guard) = CaptureGuard::acquire(&self.caches, &domain) else {
            return Err(Error::CaptureInFlight(format!(
                "a capture for {} is already running; retry shortly",
                domain
            )));
        };

        // Stored credentials surface here; the external browser skill uses
        // them when the site puts up a login wall mid-capture.
        match self.credentials.lookup(&domain, "login").await {
            Ok(Some(_)) => {
                tracing::info!(domain = %domain, "Stored credentials available for capture login")
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(domain = %domain, "Credential lookup failed: {}", e),
        }

        let capture_start = Instant::now();
        let mut outcome = run_capture_session(
            self.browser.as_ref(),
            url,
            &[],
            self.capture_timeout,
            CancellationToken::new(),
            Some(&self.sessions),
        )
        .await?;
        clock.execute_ms += capture_start.elapsed().as_millis() as u64;

        // Probe concrete GET endpoints before the skill is persisted or
        // offered; failing ones leave the manifest now.
        let profile = crate::analyze::build_profiles(&outcome.set.exchanges, &outcome.set.domains)
            .remove(&domain);
        let verification = crate::skill::verify_endpoints(
            &mut outcome.skill,
            profile.as_ref(),
            &outcome.set.auth.cookies,
            self.transport.as_ref(),
        )
        .await;
        tracing::info!(
            tested = verification.tested,
            passed = verification.passed,
            pruned = verification.removed.len(),
            skipped = verification.skipped,
            "Endpoint verification finished"
        );

        self.persist_capture(&outcome);
        self.caches
            .captured
            .insert(domain.as_str(), outcome.skill.clone());

        // Post-capture decision.
        let skill = outcome.skill.clone();
        if skill.uses_dom_extraction() {
            let timing = self.timing_for(
                &skill,
                ResolveSource::DomFallback,
                false,
                0,
                0,
                &clock,
                total_start,
                outcome.response_bytes,
            );
            return Ok(ResolveOutcome {
                result: None,
                trace: None,
                skill: Some(skill),
                source: ResolveSource::DomFallback,
                timing,
                available_endpoints: None,
                message: Some("data extracted during capture".to_string()),
            });
        }

        let chosen = match options.endpoint_id.as_deref() {
            Some(id) => skill.endpoint(id),
            None => {
                let auth_required =
                    skill.auth_method != crate::auth::AuthMethod::None && outcome.set.auth.is_empty();
                auto_execute_choice(&skill.endpoints, intent, auth_required)
            }
        };

        let Some(endpoint) = chosen else {
            // Defer: hand the menu back to the agent.
            let menu: Vec<EndpointSummary> = skill
                .endpoints
                .iter()
                .map(|e| EndpointSummary {
                    endpoint_id: e.endpoint_id.clone(),
                    method: e.method.clone(),
                    url_template: e.url_template.clone(),
                })
                .collect();
            let timing = self.timing_for(
                &skill,
                ResolveSource::LiveCapture,
                false,
                0,
                0,
                &clock,
                total_start,
                outcome.response_bytes,
            );
            return Ok(ResolveOutcome {
                result: None,
                trace: None,
                skill: Some(skill),
                source: ResolveSource::LiveCapture,
                timing,
                available_endpoints: Some(menu),
                message: Some(
                    "skill learned; pick an endpoint_id to execute".to_string(),
                ),
            });
        };

        let execute_start = Instant::now();
        let (trace, response) = self.execute_learned(&outcome, endpoint).await?;
        clock.execute_ms += execute_start.elapsed().as_millis() as u64;

        self.caches.route.insert(
            route_key.as_str(),
            RouteCacheEntry {
                skill_id: skill.skill_id.clone(),
                domain: Some(domain.clone()),
            },
        );
        Ok(self.finish(
            skill,
            trace,
            response,
            ResolveSource::LiveCapture,
            false,
            0,
            0,
            clock,
            total_start,
        ))
    }

    /// Replay a learned endpoint through its prerequisite chain using the
    /// just-captured exchanges and graph.
    async fn execute_learned(
        &self,
        outcome: &CaptureOutcome,
        endpoint: &SkillEndpoint,
    ) -> Result<(ExecutionTrace, StepResponseRuntime)> {
        let group = outcome
            .set
            .endpoint_groups
            .iter()
            .find(|g| {
                g.method == endpoint.method && endpoint.url_template.ends_with(&g.normalized_path)
            })
            .ok_or_else(|| {
                Error::Internal(format!(
                    "no captured group behind endpoint {}",
                    endpoint.endpoint_id
                ))
            })?;
        let target = *group
            .example_indices
            .last()
            .ok_or_else(|| Error::Internal("endpoint group has no examples".to_string()))?;

        let mut session_headers = outcome.set.auth.auth_headers.clone();
        if !outcome.set.auth.cookies.is_empty() {
            let line = outcome
                .set
                .auth
                .cookies
                .iter()
                .map(|(n, v)| format!("{}={}", n, v))
                .collect::<Vec<_>>()
                .join("; ");
            session_headers.insert("Cookie", line);
        }

        let trace = ExecutionTrace::begin(&outcome.skill.skill_id, &endpoint.endpoint_id);
        let chain = execute_capture_chain(
            &outcome.set.exchanges,
            &outcome.graph,
            target,
            self.transport.as_ref(),
            ChainOptions {
                session_headers,
                body_override_text: None,
                refresh: Some((self.scheduler.clone(), outcome.skill.skill_id.clone())),
            },
        )
        .await?;

        let response = chain
            .final_response
            .ok_or_else(|| Error::Internal("chain produced no final response".to_string()))?;
        let success = (200..300).contains(&response.status);
        let trace = trace.finish(success, Some(response.status));
        self.telemetry.emit_trace(&trace);
        if !success {
            return Err(Error::Upstream(format!(
                "learned endpoint returned {}",
                response.status
            )));
        }
        Ok((trace, response))
    }

    fn persist_capture(&self, outcome: &CaptureOutcome) {
        let auth_file = AuthFile::from_state(
            outcome.set.base_url().unwrap_or_default(),
            &outcome.set.auth,
            outcome
                .skill
                .endpoints
                .iter()
                .find_map(|e| e.refresh_config.clone()),
        );
        if let Err(e) = self
            .store
            .save_skill(&outcome.skill, &auth_file, Some(&outcome.graph))
        {
            tracing::warn!("Failed to persist learned skill: {}", e);
        }
        for profile in
            crate::analyze::build_profiles(&outcome.set.exchanges, &outcome.set.domains).values()
        {
            if let Err(e) = self.store.save_profile(profile) {
                tracing::warn!(domain = %profile.domain, "Failed to persist header profile: {}", e);
            }
        }
        if let Some(config) = &auth_file.refresh_config {
            self.scheduler
                .register(outcome.skill.skill_id.clone(), config.clone());
        }
    }

    /// Assemble the outcome and ship telemetry.
    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        skill: SkillManifest,
        trace: ExecutionTrace,
        response: StepResponseRuntime,
        source: ResolveSource,
        cache_hit: bool,
        candidates_found: usize,
        candidates_tried: usize,
        clock: StageClock,
        total_start: Instant,
    ) -> ResolveOutcome {
        let result = response
            .json()
            .unwrap_or_else(|| Value::String(response.body_text.clone()));
        let timing = self.timing_for(
            &skill,
            source,
            cache_hit,
            candidates_found,
            candidates_tried,
            &clock,
            total_start,
            response.body_text.len() as u64,
        );
        ResolveOutcome {
            result: Some(result),
            trace: Some(trace),
            skill: Some(skill),
            source,
            timing,
            available_endpoints: None,
            message: None,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn timing_for(
        &self,
        skill: &SkillManifest,
        source: ResolveSource,
        cache_hit: bool,
        candidates_found: usize,
        candidates_tried: usize,
        clock: &StageClock,
        total_start: Instant,
        response_bytes: u64,
    ) -> OrchestrationTiming {
        let total_ms = total_start.elapsed().as_millis() as u64;
        let (tokens_saved, tokens_saved_pct, time_saved_pct) =
            savings(skill.discovery_cost.as_ref(), response_bytes, total_ms);
        let timing = OrchestrationTiming {
            search_ms: clock.search_ms,
            get_skill_ms: clock.get_skill_ms,
            execute_ms: clock.execute_ms,
            total_ms,
            source,
            cache_hit,
            candidates_found,
            candidates_tried,
            tokens_saved,
            response_bytes,
            tokens_saved_pct,
            time_saved_pct,
            skill_id: Some(skill.skill_id.clone()),
        };
        self.telemetry.emit_timing(&timing);
        timing
    }
}

/// Marketplace candidate gate: active skills whose endpoints plausibly serve
/// the target domain and carry enough structure to execute.
fn candidate_quality_gate(skill: &SkillManifest, target_domain: Option<&str>) -> bool {
    if let Some(target) = target_domain {
        // With a target domain, the skill must share the registrable domain.
        if !same_registrable_domain(&skill.domain, target) {
            return false;
        }
        let any_on_domain = skill.endpoints.iter().any(|e| {
            url::Url::parse(&e.url_template)
                .ok()
                .and_then(|u| u.host_str().map(|h| same_registrable_domain(h, target)))
                .unwrap_or(false)
        });
        if !skill.endpoints.is_empty() && !any_on_domain {
            return false;
        }
    }

    let has_structure = skill.endpoints.iter().any(|e| {
        !e.response_schema.is_empty() || e.url_template.contains("/api/")
    });
    let has_dom = skill.endpoints.iter().any(|e| e.dom_extraction.is_some());
    has_structure || has_dom
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::skill::manifest::{ExecutionType, Lifecycle, VerificationStatus, SCHEMA_VERSION};
    use chrono::Utc;
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

    fn manifest(domain: &str, endpoints: Vec<SkillEndpoint>) -> SkillManifest {
        SkillManifest {
            skill_id: format!("skill-{}", domain),
            version: "v".into(),
            schema_version: SCHEMA_VERSION,
            name: domain.into(),
            intent_signature: "i".into(),
            domain: domain.into(),
            description: "d".into(),
            owner_type: "user".into(),
            execution_type: ExecutionType::Api,
            endpoints,
            auth_method: crate::auth::AuthMethod::None,
            base_urls: Vec::new(),
            lifecycle: Lifecycle::Active,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            discovery_cost: None,
            refresh_degraded: None,
        }
    }

    #[test]
    fn test_quality_gate_domain_scoped() {
        let on_domain = manifest(
            "api.example.com",
            vec![endpoint("GET", "https://api.example.com/api/items", true)],
        );
        assert!(candidate_quality_gate(&on_domain, Some("example.com")));
        assert!(!candidate_quality_gate(&on_domain, Some("other.org")));
        // Domain-free intents accept cross-domain candidates.
        assert!(candidate_quality_gate(&on_domain, None));
    }

    #[test]
    fn test_quality_gate_requires_structure_or_dom() {
        let schemaless = manifest(
            "x.test",
            vec![endpoint("GET", "https://x.test/page", false)],
        );
        assert!(!candidate_quality_gate(&schemaless, None));

        let api_path = manifest(
            "x.test",
            vec![endpoint("GET", "https://x.test/api/items", false)],
        );
        assert!(candidate_quality_gate(&api_path, None));

        let mut dom = manifest("x.test", vec![endpoint("GET", "https://x.test/page", false)]);
        dom.endpoints[0].dom_extraction = Some(serde_json::json!({"selector": ".items"}));
        assert!(candidate_quality_gate(&dom, None));
    }

    #[test]
    fn test_resolve_context_target_domain() {
        let from_url = ResolveContext {
            url: Some("https://news.ycombinator.com/item?id=1".into()),
            domain: None,
        };
        assert_eq!(
            from_url.target_domain().as_deref(),
            Some("news.ycombinator.com")
        );

        let explicit = ResolveContext {
            url: Some("https://a.test/".into()),
            domain: Some("b.test".into()),
        };
        assert_eq!(explicit.target_domain().as_deref(), Some("b.test"));
        assert_eq!(ResolveContext::default().target_domain(), None);
    }

    use crate::auth::credentials::NoneProvider;
    use crate::auth::scheduler::{RefreshScheduler, RefreshSink};
    use crate::auth::refresh::{RefreshConfig, TokenInfo};
    use crate::browser::{
        ActResult, BrowserAction, Snapshot, StorageKind, WaitOptions, WireRequest,
    };
    use crate::exchange::ParamMap;
    use async_trait::async_trait;
    use serde_json::json;

    struct NullSink;

    #[async_trait]
    impl RefreshSink for NullSink {
        async fn apply_refreshed(
            &self,
            _skill_id: &str,
            _info: &TokenInfo,
            _config: &RefreshConfig,
        ) -> crate::error::Result<()> {
            Ok(())
        }
        async fn mark_degraded(&self, _skill_id: &str) -> crate::error::Result<()> {
            Ok(())
        }
    }

    /// Browser that saw one JSON API call during the page visit.
    struct ScriptedBrowser;

    #[async_trait]
    impl BrowserControl for ScriptedBrowser {
        async fn is_available(&self) -> bool {
            true
        }
        async fn ensure_running(&self) -> crate::error::Result<bool> {
            Ok(true)
        }
        async fn navigate(&self, _url: &str) -> crate::error::Result<bool> {
            Ok(true)
        }
        async fn wait(&self, _options: &WaitOptions) -> crate::error::Result<bool> {
            Ok(true)
        }
        async fn snapshot(&self) -> crate::error::Result<Snapshot> {
            Ok(Snapshot::default())
        }
        async fn act(&self, _action: &BrowserAction) -> crate::error::Result<ActResult> {
            Ok(ActResult {
                ok: true,
                error: None,
            })
        }
        async fn requests(&self, _clear: bool) -> crate::error::Result<Vec<WireRequest>> {
            Ok(vec![WireRequest {
                method: "GET".into(),
                url: "https://api.x.test/api/items".into(),
                status: 200,
                resource_type: "fetch".into(),
                headers: None,
                response_headers: serde_json::from_value(
                    json!({"content-type": "application/json"}),
                )
                .ok(),
                post_data: None,
                response_body: Some(json!([{"itemId": "captured-item-1"}]).to_string()),
            }])
        }
        async fn cookies(&self) -> crate::error::Result<ParamMap> {
            Ok(ParamMap::new())
        }
        async fn storage(
            &self,
            _kind: StorageKind,
        ) -> crate::error::Result<std::collections::BTreeMap<String, String>> {
            Ok(Default::default())
        }
        async fn evaluate(&self, _js: &str) -> crate::error::Result<serde_json::Value> {
            Ok(serde_json::Value::Null)
        }
    }

    /// Serves the learned API for verification probes and replays alike.
    struct ApiTransport;

    #[async_trait]
    impl Transport for ApiTransport {
        async fn execute(
            &self,
            request: &PreparedRequest,
        ) -> crate::error::Result<StepResponseRuntime> {
            assert!(request.url.contains("api.x.test"));
            Ok(StepResponseRuntime {
                status: 200,
                headers: HeaderMap::new(),
                body_text: json!([{"itemId": "fresh-item-9"}]).to_string(),
                content_type: Some("application/json".into()),
                body_json: None,
            })
        }
    }

    fn test_resolver(dir: &tempfile::TempDir) -> Resolver {
        let store = Arc::new(SkillStore::new(dir.path()).unwrap());
        let market = Arc::new(MarketplaceClient::new(
            "http://127.0.0.1:9",
            Duration::from_millis(200),
            Duration::from_millis(200),
            Duration::from_millis(200),
        ));
        let caches = Arc::new(ResolverCaches::new(
            Duration::from_secs(300),
            Duration::from_secs(300),
        ));
        let scheduler = Arc::new(RefreshScheduler::new(
            Arc::new(NullSink),
            5,
            Duration::from_secs(60),
            3,
        ));
        Resolver::new(
            store,
            market,
            caches,
            Arc::new(ScriptedBrowser),
            scheduler,
            Arc::new(TelemetrySink::disabled()),
            Arc::new(SessionRegistry::new()),
            Arc::new(ApiTransport),
            Arc::new(NoneProvider),
            Duration::from_secs(30),
            Duration::from_secs(30),
            3,
            0.3,
        )
    }

    #[tokio::test]
    async fn test_resolve_learns_then_serves_from_route_cache() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = test_resolver(&dir);
        let context = ResolveContext {
            url: Some("https://api.x.test/".into()),
            domain: None,
        };
        let options = ResolveOptions::default();
        let params = json!({});

        // First resolve: nothing cached, marketplace unreachable, so the
        // browser captures, the skill is learned and auto-executed.
        let outcome = resolver
            .resolve_and_execute("fetch the items", &params, &context, &options)
            .await
            .unwrap();
        assert_eq!(outcome.source, ResolveSource::LiveCapture);
        assert_eq!(outcome.result.unwrap()[0]["itemId"], "fresh-item-9");
        let skill = outcome.skill.unwrap();
        assert_eq!(skill.domain, "api.x.test");
        assert_eq!(
            skill.endpoints[0].verification_status,
            crate::skill::VerificationStatus::Verified
        );
        assert!(skill.discovery_cost.is_some());

        // Second resolve answers from the route cache, never the browser.
        let outcome = resolver
            .resolve_and_execute("fetch the items", &params, &context, &options)
            .await
            .unwrap();
        assert_eq!(outcome.source, ResolveSource::RouteCache);
        assert!(outcome.timing.cache_hit);
        assert_eq!(outcome.result.unwrap()[0]["itemId"], "fresh-item-9");
    }

    #[tokio::test]
    async fn test_capture_requires_context_url() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = test_resolver(&dir);
        let err = resolver
            .resolve_and_execute(
                "do something",
                &json!({}),
                &ResolveContext::default(),
                &ResolveOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Input(_)));
    }

    #[tokio::test]
    async fn test_parallel_capture_rejected_for_same_domain() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = test_resolver(&dir);
        let caches = resolver.caches.clone();
        assert!(caches.try_begin_capture("api.x.test"));

        let err = resolver
            .resolve_and_execute(
                "fetch the items",
                &json!({}),
                &ResolveContext {
                    url: Some("https://api.x.test/".into()),
                    domain: None,
                },
                &ResolveOptions {
                    force_capture: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CaptureInFlight(_)));
        caches.end_capture("api.x.test");
    }

    /// The candidate race in isolation: slow-eventual-success, fast success,
    /// and fast failure. The fast success must win and losers be cancelled.
    #[tokio::test(start_paused = true)]
    async fn test_race_returns_first_success() {
        async fn candidate(
            delay_ms: u64,
            succeed: bool,
            label: &'static str,
        ) -> Option<&'static str> {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            succeed.then_some(label)
        }

        let mut races: FuturesUnordered<_> = vec![
            candidate(25_000, true, "slow"),
            candidate(200, true, "fast"),
            candidate(500, false, "failing"),
        ]
        .into_iter()
        .collect();
        // All three enter the race; that is what timing reports as tried.
        let entered = races.len();

        let mut winner = None;
        let mut completions = 0;
        while let Some(outcome) = races.next().await {
            completions += 1;
            if outcome.is_some() {
                winner = outcome;
                break;
            }
        }
        drop(races);
        assert_eq!(entered, 3);
        assert_eq!(winner, Some("fast"));
        // The fast candidate answered before the others resolved; dropping
        // the stream cancelled them.
        assert_eq!(completions, 1);
    }
}
