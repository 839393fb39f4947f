//! `/v1/sessions/{domain}`: capture session debugging

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;

use crate::error::Result;
use crate::session::DomainSessions;
use crate::state::AppState;

const DEFAULT_LIMIT: usize = 20;

#[derive(Debug, Deserialize)]
pub struct SessionsQuery {
    #[serde(default)]
    pub limit: Option<usize>,
}

pub async fn domain_sessions(
    State(state): State<AppState>,
    Path(domain): Path<String>,
    Query(query): Query<SessionsQuery>,
) -> Result<Json<DomainSessions>> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT);
    Ok(Json(state.sessions().for_domain(&domain, limit)))
}
