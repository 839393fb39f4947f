//! Capture chain execution
//!
//! Runs a target step's prerequisite chain in capture order, threading each
//! response into the runtime map so later preparations can inject fresh
//! values. Non-2xx steps are recorded and execution continues; retry policy
//! belongs to the orchestrator.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::prepare::{
    prepare_request_for_step, PrepareOptions, PreparedRequest, StepResponseRuntime,
};
use crate::auth::scheduler::RefreshScheduler;
use crate::correlate::CorrelationGraphV1;
use crate::error::{Error, Result};
use crate::exchange::{CapturedExchange, HeaderMap};

/// Executes one prepared request
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, request: &PreparedRequest) -> Result<StepResponseRuntime>;
}

/// reqwest-backed transport with a per-call timeout
pub struct HttpTransport {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn execute(&self, request: &PreparedRequest) -> Result<StepResponseRuntime> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|e| Error::Input(format!("bad method {}: {}", request.method, e)))?;
        let mut builder = self
            .client
            .request(method, &request.url)
            .timeout(self.timeout);
        for (name, value) in request.headers.iter() {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body_text {
            builder = builder.body(body.clone());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Error::Upstream(format!("request to {} failed: {}", request.url, e)))?;

        let status = response.status().as_u16();
        let mut headers = HeaderMap::new();
        let mut content_type = None;
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                if name.as_str().eq_ignore_ascii_case("content-type") {
                    content_type = Some(value.to_string());
                }
                headers.insert(name.as_str(), value);
            }
        }
        let body_text = response
            .text()
            .await
            .map_err(|e| Error::Upstream(format!("response from {} unreadable: {}", request.url, e)))?;

        Ok(StepResponseRuntime {
            status,
            headers,
            body_text,
            content_type,
            body_json: None,
        })
    }
}

/// One executed step of a chain
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub index: usize,
    pub prepared: PreparedRequest,
    pub response: StepResponseRuntime,
    /// Incoming links whose source value was missing at preparation time
    pub missing_injections: usize,
}

/// Full chain result
#[derive(Debug, Clone)]
pub struct ChainResult {
    pub final_response: Option<StepResponseRuntime>,
    pub steps: Vec<StepOutcome>,
}

impl ChainResult {
    /// True when the target step itself came back 2xx
    pub fn succeeded(&self) -> bool {
        self.final_response
            .as_ref()
            .is_some_and(|r| (200..300).contains(&r.status))
    }
}

/// Chain-wide execution options
#[derive(Clone, Default)]
pub struct ChainOptions {
    /// Session headers overlaid on every step (auth state, profile headers)
    pub session_headers: HeaderMap,
    /// Body override for the target step only
    pub body_override_text: Option<String>,
    /// Synchronous refresh-on-401 recovery
    pub refresh: Option<(Arc<RefreshScheduler>, String)>,
}

/// Execute the prerequisite chain for `target_index`, target included.
pub async fn execute_capture_chain(
    exchanges: &[CapturedExchange],
    graph: &CorrelationGraphV1,
    target_index: usize,
    transport: &dyn Transport,
    options: ChainOptions,
) -> Result<ChainResult> {
    if !exchanges.iter().any(|e| e.index == target_index) {
        return Err(Error::NotFound(format!(
            "no captured exchange with index {}",
            target_index
        )));
    }

    let needed = graph.execution_order(target_index);
    let mut runtime: HashMap<usize, StepResponseRuntime> = HashMap::new();
    let mut steps = Vec::with_capacity(needed.len());
    let mut session_headers = options.session_headers.clone();
    let mut refresh_spent = false;

    for index in needed {
        let opts = PrepareOptions {
            session_headers: session_headers.clone(),
            body_override_text: if index == target_index {
                options.body_override_text.clone()
            } else {
                None
            },
        };
        let Some(prepared) = prepare_request_for_step(exchanges, graph, index, &runtime, Some(&opts))
        else {
            tracing::warn!(step = index, "Chain references an exchange that was never captured");
            continue;
        };
        let missing_injections = graph
            .incoming(index)
            .filter(|link| {
                super::prepare::extract_from_runtime(&runtime, exchanges, link).is_none()
            })
            .count();
        if missing_injections > 0 {
            tracing::warn!(
                step = index,
                missing = missing_injections,
                "Replay proceeding without some correlated values"
            );
        }

        let mut response = transport.execute(&prepared).await?;

        // One synchronous token refresh per chain when a step comes back 401.
        if response.status == 401 && !refresh_spent {
            if let Some((scheduler, skill_id)) = &options.refresh {
                refresh_spent = true;
                match scheduler.refresh_now(skill_id).await {
                    Ok(info) => {
                        if let Some(access) = info.access_token {
                            session_headers
                                .insert("Authorization", format!("Bearer {}", access));
                            let retry_opts = PrepareOptions {
                                session_headers: session_headers.clone(),
                                body_override_text: opts.body_override_text.clone(),
                            };
                            if let Some(retried) = prepare_request_for_step(
                                exchanges,
                                graph,
                                index,
                                &runtime,
                                Some(&retry_opts),
                            ) {
                                tracing::info!(step = index, "Retrying step after token refresh");
                                response = transport.execute(&retried).await?;
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!(step = index, "Refresh-on-401 failed: {}", e);
                    }
                }
            }
        }

        if !(200..300).contains(&response.status) {
            tracing::warn!(step = index, status = response.status, "Chain step returned non-2xx");
        }

        response.body_json = response.json();
        runtime.insert(index, response.clone());
        steps.push(StepOutcome {
            index,
            prepared,
            response,
            missing_injections,
        });
    }

    Ok(ChainResult {
        final_response: runtime.remove(&target_index),
        steps,
    })
}
