//! `/v1/feedback`: execution ratings feed endpoint reliability

use axum::{extract::State, Json};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::state::AppState;

/// Exponential moving average weight of the newest rating
const RATING_WEIGHT: f64 = 0.3;

#[derive(Debug, Deserialize)]
pub struct FeedbackRequest {
    pub skill_id: Option<String>,
    pub endpoint_id: Option<String>,
    pub rating: Option<u8>,
    #[serde(default)]
    pub outcome: Option<String>,
    #[serde(default)]
    pub diagnostics: Option<Value>,
}

pub async fn submit_feedback(
    State(state): State<AppState>,
    Json(request): Json<FeedbackRequest>,
) -> Result<Json<Value>> {
    let skill_id = request
        .skill_id
        .as_deref()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::Input("skill_id is required".to_string()))?;
    let endpoint_id = request
        .endpoint_id
        .as_deref()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::Input("endpoint_id is required".to_string()))?;
    let rating = request
        .rating
        .filter(|r| (1..=5).contains(r))
        .ok_or_else(|| Error::Input("rating must be between 1 and 5".to_string()))?;

    let skill = state
        .store()
        .load_skill_by_id(skill_id)?
        .ok_or_else(|| Error::Input(format!("unknown skill {}", skill_id)))?;
    if skill.endpoint(endpoint_id).is_none() {
        return Err(Error::Input(format!(
            "endpoint {} not on skill {}",
            endpoint_id, skill_id
        )));
    }

    if let Some(outcome) = &request.outcome {
        tracing::info!(skill = skill_id, endpoint = endpoint_id, rating, outcome, "Feedback received");
    }
    if let Some(diagnostics) = &request.diagnostics {
        tracing::debug!(skill = skill_id, "Feedback diagnostics: {}", diagnostics);
    }

    let endpoint_id = endpoint_id.to_string();
    state.store().update_skill(&skill.slug(), move |skill| {
        if let Some(endpoint) = skill
            .endpoints
            .iter_mut()
            .find(|e| e.endpoint_id == endpoint_id)
        {
            endpoint.reliability_score =
                blend_reliability(endpoint.reliability_score, rating);
        }
    })?;

    Ok(Json(json!({})))
}

/// Fold a 1-5 rating into the running reliability score.
fn blend_reliability(current: f64, rating: u8) -> f64 {
    let normalized = (rating - 1) as f64 / 4.0;
    ((1.0 - RATING_WEIGHT) * current + RATING_WEIGHT * normalized).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blend_reliability_moves_toward_rating() {
        // A 5 pulls the score up, a 1 pulls it down, both stay in [0, 1].
        let up = blend_reliability(0.5, 5);
        assert!(up > 0.5 && up <= 1.0);
        let down = blend_reliability(0.5, 1);
        assert!(down < 0.5 && down >= 0.0);
        // A neutral 3 converges on 0.5.
        let neutral = blend_reliability(0.5, 3);
        assert!((neutral - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_blend_reliability_is_bounded() {
        assert!(blend_reliability(1.0, 5) <= 1.0);
        assert!(blend_reliability(0.0, 1) >= 0.0);
    }
}
