//! `/v1/skills` handlers: list, get, execute, recipe, publish

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::analyze::profile::sanitize_header_profile;
use crate::error::{Error, Result};
use crate::project::{apply_projection, ProjectionSpec};
use crate::skill::SkillManifest;
use crate::state::AppState;
use crate::telemetry::slim_trace;

pub async fn list_skills(State(state): State<AppState>) -> Result<Json<Vec<SkillManifest>>> {
    Ok(Json(state.store().list_skills()?))
}

pub async fn get_skill(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SkillManifest>> {
    if let Some(skill) = state.store().load_skill_by_id(&id)? {
        return Ok(Json(skill));
    }
    // Slugs work too for local lookups.
    if let Some(skill) = state.store().load_skill(&id)? {
        return Ok(Json(skill));
    }
    state.market().get_skill(&id).await.map(Json)
}

#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(default)]
    pub endpoint_id: Option<String>,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub confirm_unsafe: bool,
    #[serde(default)]
    pub projection: Option<ProjectionSpec>,
}

pub async fn execute_skill(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<ExecuteRequest>,
) -> Result<Json<Value>> {
    let params = request.params.unwrap_or_else(|| json!({}));

    if request.dry_run {
        let skill = state
            .store()
            .load_skill_by_id(&id)?
            .ok_or_else(|| Error::NotFound(format!("unknown skill {}", id)))?;
        return Ok(Json(json!({
            "dry_run": true,
            "skill": skill,
            "message": "dry run; nothing executed",
        })));
    }

    let (skill, trace, response) = state
        .resolver()
        .execute_skill_by_id(
            &id,
            request.endpoint_id.as_deref(),
            &params,
            request.confirm_unsafe,
        )
        .await?;

    let raw_result = response
        .json()
        .unwrap_or_else(|| Value::String(response.body_text.clone()));
    let mut trace_value = serde_json::to_value(&trace).ok();

    // A stored recipe applies when the caller sent no ad-hoc projection.
    let endpoint_id = trace.endpoint_id.clone();
    let effective = match &request.projection {
        Some(spec) if !spec.is_empty() => Some(spec.clone()),
        _ => state
            .store()
            .load_recipe(&skill.slug(), &endpoint_id)?
            .filter(|spec| !spec.is_empty()),
    };
    let result = match effective {
        Some(spec) => {
            trace_value = trace_value.as_ref().map(slim_trace);
            apply_projection(&raw_result, &spec)
        }
        None => raw_result,
    };

    Ok(Json(json!({
        "result": result,
        "trace": trace_value,
        "skill": skill,
    })))
}

pub async fn store_recipe(
    State(state): State<AppState>,
    Path((id, endpoint_id)): Path<(String, String)>,
    Json(recipe): Json<ProjectionSpec>,
) -> Result<Json<Value>> {
    let skill = state
        .store()
        .load_skill_by_id(&id)?
        .ok_or_else(|| Error::NotFound(format!("unknown skill {}", id)))?;
    if skill.endpoint(&endpoint_id).is_none() {
        return Err(Error::NotFound(format!(
            "endpoint {} not on skill {}",
            endpoint_id, id
        )));
    }
    state.store().save_recipe(&skill.slug(), &endpoint_id, &recipe)?;
    Ok(Json(json!({})))
}

pub async fn publish_skill(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    let skill = state
        .store()
        .load_skill_by_id(&id)?
        .ok_or_else(|| Error::NotFound(format!("unknown skill {}", id)))?;

    // Published profiles never carry auth values.
    let profile = state
        .store()
        .load_profile(&skill.domain)?
        .map(|p| sanitize_header_profile(&p));

    let signature = match state.wallet() {
        Some(wallet) if wallet.can_sign() => Some(wallet.sign(skill.version.as_bytes())?),
        _ => None,
    };

    let reference = state
        .market()
        .publish(&skill, profile.as_ref(), signature.as_deref())
        .await?;
    state.store().save_marketplace_ref(&skill.slug(), &reference)?;

    Ok(Json(json!({
        "skill_id": reference.skill_id,
        "index_url": reference.index_url,
    })))
}
