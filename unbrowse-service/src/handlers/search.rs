//! `/v1/search` and `/v1/search/domain`: marketplace search proxy

use axum::{extract::State, Json};
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::skill::SearchHit;
use crate::state::AppState;

const DEFAULT_K: usize = 10;

#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    pub intent: Option<String>,
    #[serde(default)]
    pub k: Option<usize>,
    #[serde(default)]
    pub domain: Option<String>,
}

fn require_intent(request: &SearchRequest) -> Result<&str> {
    request
        .intent
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::Input("intent is required".to_string()))
}

pub async fn search_global(
    State(state): State<AppState>,
    Json(request): Json<SearchRequest>,
) -> Result<Json<Vec<SearchHit>>> {
    let intent = require_intent(&request)?;
    let k = request.k.unwrap_or(DEFAULT_K);
    Ok(Json(state.market().search(intent, k).await?))
}

pub async fn search_domain(
    State(state): State<AppState>,
    Json(request): Json<SearchRequest>,
) -> Result<Json<Vec<SearchHit>>> {
    let intent = require_intent(&request)?;
    let domain = request
        .domain
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::Input("domain is required".to_string()))?;
    let k = request.k.unwrap_or(DEFAULT_K);
    Ok(Json(state.market().search_domain(intent, domain, k).await?))
}
