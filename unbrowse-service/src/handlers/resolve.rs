//! `/v1/intent/resolve`

use axum::{extract::State, Json};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::project::{apply_projection, ProjectionSpec};
use crate::resolve::{ResolveContext, ResolveOptions, ResolveOutcome};
use crate::state::AppState;
use crate::telemetry::slim_trace;

#[derive(Debug, Deserialize)]
pub struct ResolveRequest {
    pub intent: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(default)]
    pub context: Option<ResolveContext>,
    #[serde(default)]
    pub projection: Option<ProjectionSpec>,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub force_capture: bool,
    #[serde(default)]
    pub endpoint_id: Option<String>,
    #[serde(default)]
    pub confirm_unsafe: bool,
}

pub async fn resolve_intent(
    State(state): State<AppState>,
    Json(request): Json<ResolveRequest>,
) -> Result<Json<Value>> {
    let intent = request
        .intent
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::Input("intent is required".to_string()))?;

    let context = request.context.unwrap_or_default();
    let params = request.params.unwrap_or_else(|| json!({}));

    if request.dry_run {
        return dry_run(&state, intent, &context).await;
    }

    let options = ResolveOptions {
        dry_run: false,
        force_capture: request.force_capture,
        endpoint_id: request.endpoint_id,
        confirm_unsafe: request.confirm_unsafe,
    };

    match state
        .resolver()
        .resolve_and_execute(intent, &params, &context, &options)
        .await
    {
        Ok(outcome) => Ok(Json(render_outcome(outcome, request.projection.as_ref()))),
        // Auth failures come back as a 200 payload so agents can react by
        // opening an interactive login.
        Err(Error::Upstream(message)) if message.contains("401") => Ok(Json(json!({
            "error": message,
            "auth_recommended": true,
            "auth_hint": "/v1/auth/login",
        }))),
        Err(e) => Err(e),
    }
}

async fn dry_run(state: &AppState, intent: &str, context: &ResolveContext) -> Result<Json<Value>> {
    let domain = context.target_domain();
    let skill = match domain.as_deref() {
        Some(domain) => state.store().skill_for_domain(domain)?,
        None => None,
    };
    Ok(Json(json!({
        "dry_run": true,
        "intent": intent,
        "domain": domain,
        "skill": skill,
        "message": match &skill {
            Some(_) => "a learned skill would serve this intent",
            None => "no local skill; resolve would search the marketplace or capture",
        },
    })))
}

fn render_outcome(outcome: ResolveOutcome, projection: Option<&ProjectionSpec>) -> Value {
    let mut trace = outcome
        .trace
        .as_ref()
        .and_then(|t| serde_json::to_value(t).ok());

    let result = match (&outcome.result, projection) {
        (Some(result), Some(spec)) if !spec.is_empty() => {
            // A transform ran: the trace payload slims down with it.
            trace = trace.as_ref().map(slim_trace);
            Some(apply_projection(result, spec))
        }
        (result, _) => result.clone(),
    };

    let mut body = json!({
        "result": result,
        "trace": trace,
        "skill": outcome.skill,
        "source": outcome.source,
        "timing": outcome.timing,
    });
    if let Some(endpoints) = &outcome.available_endpoints {
        body["available_endpoints"] = json!(endpoints);
    }
    if let Some(message) = &outcome.message {
        body["message"] = json!(message);
    }
    body
}
