//! Capture sessions
//!
//! A capture session drives the external browser against a target URL,
//! drains the observed network traffic, and seals it into an analyzed
//! exchange set plus correlation graph plus generated skill. One explicit
//! state machine per session; captures are exclusive per domain (the
//! orchestrator holds the in-flight lock).

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::analyze::AnalyzedExchangeSet;
use crate::browser::{BrowserAction, BrowserControl, StorageKind, WaitOptions, WireRequest};
use crate::correlate::{infer_correlation_graph, CorrelationGraphV1};
use crate::error::{Error, Result};
use crate::exchange::{
    query_params_of, BodyFormat, CapturedExchange, CapturedRequest, CapturedResponse, ParamMap,
};
use crate::skill::manifest::DiscoveryCost;
use crate::skill::{generate_skill, SkillManifest};
use crate::telemetry::estimate_tokens;

/// Captured-request buffer bound; oldest entries are evicted beyond this
pub const MAX_CAPTURED_REQUESTS: usize = 500;

/// Detailed session records kept per domain
const MAX_DETAIL_RECORDS: usize = 15;

/// Compressed summaries kept per domain after detail eviction
const MAX_SUMMARIES: usize = 5;

/// Session state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Navigating,
    Snapshotting,
    Acting,
    Capturing,
    Finalizing,
    Error,
}

/// Everything a finished capture produced
pub struct CaptureOutcome {
    pub set: AnalyzedExchangeSet,
    pub graph: CorrelationGraphV1,
    pub skill: SkillManifest,
    pub capture_ms: u64,
    pub response_bytes: u64,
}

/// Debug record of one session, served by `/v1/sessions/:domain`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: String,
    pub domain: String,
    pub url: String,
    pub state: SessionState,
    pub started_at: DateTime<Utc>,
    pub exchange_count: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainSessions {
    pub records: VecDeque<SessionRecord>,
    pub summaries: VecDeque<String>,
}

/// Per-domain ring of recent capture sessions
#[derive(Default)]
pub struct SessionRegistry {
    inner: DashMap<String, DomainSessions>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, record: SessionRecord) {
        let mut entry = self.inner.entry(record.domain.clone()).or_default();
        entry.records.push_back(record);
        while entry.records.len() > MAX_DETAIL_RECORDS {
            // Evicted detail collapses into a one-line summary.
            if let Some(old) = entry.records.pop_front() {
                entry.summaries.push_back(format!(
                    "{} {} ({} exchanges, {:?})",
                    old.started_at.to_rfc3339(),
                    old.url,
                    old.exchange_count,
                    old.state
                ));
            }
            while entry.summaries.len() > MAX_SUMMARIES {
                entry.summaries.pop_front();
            }
        }
    }

    pub fn for_domain(&self, domain: &str, limit: usize) -> DomainSessions {
        match self.inner.get(domain) {
            Some(entry) => {
                let records = entry
                    .records
                    .iter()
                    .rev()
                    .take(limit)
                    .cloned()
                    .collect::<Vec<_>>()
                    .into_iter()
                    .rev()
                    .collect();
                DomainSessions {
                    records,
                    summaries: entry.summaries.clone(),
                }
            }
            None => DomainSessions::default(),
        }
    }
}

/// Resource types that carry API traffic
fn is_api_request(wire: &WireRequest) -> bool {
    matches!(wire.resource_type.as_str(), "xhr" | "fetch")
        || wire
            .response_headers
            .as_ref()
            .and_then(|h| h.get("content-type"))
            .is_some_and(|ct| ct.to_ascii_lowercase().contains("json"))
}

/// Repair a wire request into the typed exchange model.
fn wire_to_exchange(index: usize, timestamp: i64, wire: &WireRequest) -> CapturedExchange {
    let headers = wire.headers.clone().unwrap_or_default();
    let cookies: ParamMap = headers
        .get("cookie")
        .map(|raw| {
            raw.split(';')
                .filter_map(|pair| {
                    let (name, value) = pair.trim().split_once('=')?;
                    Some((name.to_string(), value.to_string()))
                })
                .collect()
        })
        .unwrap_or_default();

    let content_type = headers.get("content-type").map(|s| s.to_string());
    let body_format = content_type.as_deref().map(BodyFormat::from_content_type);
    let body = wire
        .post_data
        .as_deref()
        .filter(|_| body_format == Some(BodyFormat::Json))
        .and_then(crate::analyze::schema::safe_parse_json);

    let response_headers = wire.response_headers.clone().unwrap_or_default();
    let response_content_type = response_headers.get("content-type").map(|s| s.to_string());
    let response_format = response_content_type
        .as_deref()
        .map(BodyFormat::from_content_type);
    let response_body = wire
        .response_body
        .as_deref()
        .filter(|_| response_format == Some(BodyFormat::Json))
        .and_then(crate::analyze::schema::safe_parse_json);

    CapturedExchange {
        index,
        timestamp,
        request: CapturedRequest {
            method: wire.method.to_ascii_uppercase(),
            url: wire.url.clone(),
            query_params: query_params_of(&wire.url),
            cookies,
            body,
            body_raw: wire.post_data.clone(),
            body_format,
            content_type,
            headers,
        },
        response: CapturedResponse {
            status: wire.status,
            headers: response_headers,
            cookies: ParamMap::new(),
            body: response_body,
            body_raw: wire.response_body.clone(),
            body_format: response_format,
            content_type: response_content_type,
        },
    }
}

/// Drive one capture session to completion.
pub async fn run_capture_session(
    browser: &dyn BrowserControl,
    url: &str,
    actions: &[BrowserAction],
    timeout: std::time::Duration,
    cancel: CancellationToken,
    registry: Option<&SessionRegistry>,
) -> Result<CaptureOutcome> {
    let started = Instant::now();
    let session_id = Uuid::new_v4().to_string();
    let domain = url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_string()))
        .unwrap_or_else(|| "unknown".to_string());

    let mut state = SessionState::Idle;
    let result = tokio::select! {
        _ = cancel.cancelled() => Err(Error::Upstream("capture cancelled".to_string())),
        result = tokio::time::timeout(
            timeout,
            drive_session(browser, url, actions, &mut state),
        ) => match result {
            Ok(inner) => inner,
            Err(_) => Err(Error::Upstream(format!(
                "capture of {} exceeded {}s",
                url,
                timeout.as_secs()
            ))),
        },
    };

    let drive = match result {
        Ok(drive) => drive,
        Err(e) => {
            state = SessionState::Error;
            if let Some(registry) = registry {
                registry.record(SessionRecord {
                    id: session_id,
                    domain,
                    url: url.to_string(),
                    state,
                    started_at: Utc::now(),
                    exchange_count: 0,
                });
            }
            return Err(e);
        }
    };

    let capture_ms = started.elapsed().as_millis() as u64;
    if let Some(registry) = registry {
        registry.record(SessionRecord {
            id: session_id,
            domain,
            url: url.to_string(),
            state: SessionState::Finalizing,
            started_at: Utc::now(),
            exchange_count: drive.set.exchanges.len(),
        });
    }

    let discovery = DiscoveryCost {
        capture_ms,
        capture_tokens: estimate_tokens(drive.response_bytes),
        response_bytes: drive.response_bytes,
        captured_at: Utc::now(),
    };
    let skill = generate_skill(&drive.set, Some(discovery), Utc::now());

    Ok(CaptureOutcome {
        skill,
        set: drive.set,
        graph: drive.graph,
        capture_ms,
        response_bytes: drive.response_bytes,
    })
}

/// Partial outcome from the driving loop, before skill generation
struct DriveOutcome {
    set: AnalyzedExchangeSet,
    graph: CorrelationGraphV1,
    response_bytes: u64,
}

async fn drive_session(
    browser: &dyn BrowserControl,
    url: &str,
    actions: &[BrowserAction],
    state: &mut SessionState,
) -> Result<DriveOutcome> {
    *state = SessionState::Navigating;
    if !browser.ensure_running().await? {
        return Err(Error::Upstream("browser is not available".to_string()));
    }
    if !browser.navigate(url).await? {
        return Err(Error::Upstream(format!("navigation to {} failed", url)));
    }
    browser
        .wait(&WaitOptions {
            load_state: Some("networkidle".to_string()),
            timeout_ms: 15_000,
            ..Default::default()
        })
        .await?;

    if !actions.is_empty() {
        *state = SessionState::Acting;
        for action in actions {
            *state = SessionState::Snapshotting;
            let _ = browser.snapshot().await;
            *state = SessionState::Acting;
            let outcome = browser.act(action).await?;
            if !outcome.ok {
                tracing::warn!(
                    error = outcome.error.as_deref().unwrap_or("unknown"),
                    "Scripted action failed, continuing capture"
                );
            }
        }
        browser
            .wait(&WaitOptions {
                load_state: Some("networkidle".to_string()),
                timeout_ms: 10_000,
                ..Default::default()
            })
            .await?;
    }

    *state = SessionState::Capturing;
    let wire = browser.requests(true).await?;
    let mut exchanges: Vec<CapturedExchange> = Vec::new();
    let mut response_bytes: u64 = 0;
    let mut next_index = 0usize;
    for request in wire.iter().filter(|w| is_api_request(w)) {
        response_bytes += request.response_body.as_deref().map(|b| b.len() as u64).unwrap_or(0);
        exchanges.push(wire_to_exchange(next_index, next_index as i64, request));
        next_index += 1;
    }
    // Bounded buffer: newest requests win.
    if exchanges.len() > MAX_CAPTURED_REQUESTS {
        let excess = exchanges.len() - MAX_CAPTURED_REQUESTS;
        exchanges.drain(..excess);
    }

    let cookies = browser.cookies().await.unwrap_or_default();
    let local_storage = browser
        .storage(StorageKind::Local)
        .await
        .unwrap_or_default();
    let session_storage = browser
        .storage(StorageKind::Session)
        .await
        .unwrap_or_default();
    let meta_tokens = read_meta_tokens(browser).await;

    *state = SessionState::Finalizing;
    let graph = infer_correlation_graph(&exchanges);
    let set = AnalyzedExchangeSet::build(
        exchanges,
        cookies,
        local_storage,
        session_storage,
        meta_tokens,
    );

    Ok(DriveOutcome {
        set,
        graph,
        response_bytes,
    })
}

/// `<meta name=... content=...>` tags, fetched in one evaluate round trip
async fn read_meta_tokens(browser: &dyn BrowserControl) -> BTreeMap<String, String> {
    const JS: &str = "Object.fromEntries([...document.querySelectorAll('meta[name]')].map(m => [m.name, m.content]))";
    match browser.evaluate(JS).await {
        Ok(serde_json::Value::Object(map)) => map
            .into_iter()
            .filter_map(|(k, v)| v.as_str().map(|s| (k, s.to_string())))
            .collect(),
        _ => BTreeMap::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::{ActResult, Snapshot};
    use async_trait::async_trait;
    use serde_json::json;

    struct ScriptedBrowser {
        requests: Vec<WireRequest>,
    }

    #[async_trait]
    impl BrowserControl for ScriptedBrowser {
        async fn is_available(&self) -> bool {
            true
        }
        async fn ensure_running(&self) -> Result<bool> {
            Ok(true)
        }
        async fn navigate(&self, _url: &str) -> Result<bool> {
            Ok(true)
        }
        async fn wait(&self, _options: &WaitOptions) -> Result<bool> {
            Ok(true)
        }
        async fn snapshot(&self) -> Result<Snapshot> {
            Ok(Snapshot::default())
        }
        async fn act(&self, _action: &BrowserAction) -> Result<ActResult> {
            Ok(ActResult {
                ok: true,
                error: None,
            })
        }
        async fn requests(&self, _clear: bool) -> Result<Vec<WireRequest>> {
            Ok(self.requests.clone())
        }
        async fn cookies(&self) -> Result<ParamMap> {
            let mut cookies = ParamMap::new();
            cookies.push("sid", "cookie-session-1");
            Ok(cookies)
        }
        async fn storage(&self, _kind: StorageKind) -> Result<BTreeMap<String, String>> {
            Ok(BTreeMap::new())
        }
        async fn evaluate(&self, _js: &str) -> Result<serde_json::Value> {
            Ok(json!({"csrf-token": "meta-token-12345"}))
        }
    }

    fn wire(method: &str, url: &str, body: serde_json::Value) -> WireRequest {
        WireRequest {
            method: method.into(),
            url: url.into(),
            status: 200,
            resource_type: "fetch".into(),
            headers: None,
            response_headers: serde_json::from_value(
                json!({"content-type": "application/json"}),
            )
            .ok(),
            post_data: None,
            response_body: Some(body.to_string()),
        }
    }

    #[tokio::test]
    async fn test_capture_session_end_to_end() {
        let browser = ScriptedBrowser {
            requests: vec![
                wire("GET", "https://api.x.test/v1/items", json!([{"itemId": "long-item-1"}])),
                WireRequest {
                    resource_type: "image".into(),
                    url: "https://cdn.x.test/logo.png".into(),
                    method: "GET".into(),
                    status: 200,
                    ..Default::default()
                },
            ],
        };
        let registry = SessionRegistry::new();

        let outcome = run_capture_session(
            &browser,
            "https://api.x.test/",
            &[],
            std::time::Duration::from_secs(30),
            CancellationToken::new(),
            Some(&registry),
        )
        .await
        .unwrap();

        // The image request is filtered out of the exchange set.
        assert_eq!(outcome.set.exchanges.len(), 1);
        assert_eq!(outcome.skill.domain, "api.x.test");
        assert!(outcome.skill.discovery_cost.is_some());
        // Meta token promoted into the auth state.
        assert_eq!(
            outcome.set.auth.auth_headers.get("x-csrf-token"),
            Some("meta-token-12345")
        );

        let sessions = registry.for_domain("api.x.test", 10);
        assert_eq!(sessions.records.len(), 1);
        assert_eq!(sessions.records[0].exchange_count, 1);
    }

    #[test]
    fn test_wire_to_exchange_parses_cookies_and_body() {
        let mut wire = wire("POST", "https://x.test/submit?a=1", json!({"ok": true}));
        wire.headers = serde_json::from_value(json!({
            "cookie": "sid=abc; theme=dark",
            "content-type": "application/json"
        }))
        .ok();
        wire.post_data = Some(r#"{"field": "value"}"#.into());

        let exchange = wire_to_exchange(3, 3, &wire);
        assert_eq!(exchange.index, 3);
        assert_eq!(exchange.request.cookies.get("sid"), Some("abc"));
        assert_eq!(exchange.request.cookies.get("theme"), Some("dark"));
        assert_eq!(exchange.request.query_params.get("a"), Some("1"));
        assert_eq!(exchange.request.body.as_ref().unwrap()["field"], "value");
        assert_eq!(exchange.response.body.as_ref().unwrap()["ok"], true);
        assert_eq!(exchange.request.body_format, Some(BodyFormat::Json));
    }

    #[test]
    fn test_buffer_bound_keeps_newest() {
        let mut exchanges: Vec<CapturedExchange> = (0..MAX_CAPTURED_REQUESTS + 20)
            .map(|i| wire_to_exchange(i, i as i64, &wire("GET", "https://x.test/a", json!({}))))
            .collect();
        let excess = exchanges.len() - MAX_CAPTURED_REQUESTS;
        exchanges.drain(..excess);
        assert_eq!(exchanges.len(), MAX_CAPTURED_REQUESTS);
        assert_eq!(exchanges[0].index, 20, "oldest entries evicted");
    }

    #[test]
    fn test_registry_detail_and_summary_bounds() {
        let registry = SessionRegistry::new();
        for i in 0..30 {
            registry.record(SessionRecord {
                id: format!("s{}", i),
                domain: "x.test".into(),
                url: "https://x.test/".into(),
                state: SessionState::Finalizing,
                started_at: Utc::now(),
                exchange_count: i,
            });
        }
        let sessions = registry.for_domain("x.test", 100);
        assert_eq!(sessions.records.len(), MAX_DETAIL_RECORDS);
        assert!(sessions.summaries.len() <= MAX_SUMMARIES);
        // Newest record survived.
        assert_eq!(sessions.records.back().unwrap().exchange_count, 29);
    }
}
