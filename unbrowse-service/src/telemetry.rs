//! Execution traces and orchestration timing
//!
//! Every execution produces a trace; every resolve produces a timing record
//! with token-savings accounting against the skill's discovery cost. Both
//! ship to the telemetry endpoint fire-and-forget.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::skill::manifest::DiscoveryCost;

/// Trace schema version carried on every record
pub const TRACE_VERSION: u32 = 1;

/// Baselines when the skill carries no discovery cost
pub const DEFAULT_BASELINE_MS: u64 = 22_000;
pub const DEFAULT_BASELINE_TOKENS: u64 = 30_000;

/// Which path answered a resolve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolveSource {
    Marketplace,
    LiveCapture,
    DomFallback,
    RouteCache,
}

/// Record of one endpoint execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionTrace {
    pub trace_id: String,
    pub skill_id: String,
    pub endpoint_id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_saved: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_saved_pct: Option<f64>,
    #[serde(default = "default_trace_version")]
    pub trace_version: u32,
}

fn default_trace_version() -> u32 {
    TRACE_VERSION
}

impl ExecutionTrace {
    pub fn begin(skill_id: &str, endpoint_id: &str) -> Self {
        let now = Utc::now();
        Self {
            trace_id: Uuid::new_v4().to_string(),
            skill_id: skill_id.to_string(),
            endpoint_id: endpoint_id.to_string(),
            started_at: now,
            completed_at: now,
            success: false,
            status_code: None,
            tokens_used: None,
            tokens_saved: None,
            tokens_saved_pct: None,
            trace_version: TRACE_VERSION,
        }
    }

    pub fn finish(mut self, success: bool, status_code: Option<u16>) -> Self {
        self.completed_at = Utc::now();
        self.success = success;
        self.status_code = status_code;
        self
    }
}

/// End-to-end accounting for one resolve
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationTiming {
    pub search_ms: u64,
    pub get_skill_ms: u64,
    pub execute_ms: u64,
    pub total_ms: u64,
    pub source: ResolveSource,
    pub cache_hit: bool,
    pub candidates_found: usize,
    pub candidates_tried: usize,
    pub tokens_saved: u64,
    pub response_bytes: u64,
    pub tokens_saved_pct: f64,
    pub time_saved_pct: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skill_id: Option<String>,
}

/// Rough token estimate for a response payload
pub fn estimate_tokens(bytes: u64) -> u64 {
    bytes / 4
}

/// Token/time savings against the skill's capture cost (or defaults).
pub fn savings(
    discovery: Option<&DiscoveryCost>,
    response_bytes: u64,
    total_ms: u64,
) -> (u64, f64, f64) {
    let baseline_tokens = discovery
        .map(|d| d.capture_tokens)
        .filter(|&t| t > 0)
        .unwrap_or(DEFAULT_BASELINE_TOKENS);
    let baseline_ms = discovery
        .map(|d| d.capture_ms)
        .filter(|&m| m > 0)
        .unwrap_or(DEFAULT_BASELINE_MS);

    let response_tokens = estimate_tokens(response_bytes);
    let tokens_saved = baseline_tokens.saturating_sub(response_tokens);
    let tokens_saved_pct = if baseline_tokens > 0 {
        tokens_saved as f64 * 100.0 / baseline_tokens as f64
    } else {
        0.0
    };
    let time_saved_pct = if baseline_ms > 0 {
        baseline_ms.saturating_sub(total_ms) as f64 * 100.0 / baseline_ms as f64
    } else {
        0.0
    };
    (tokens_saved, tokens_saved_pct, time_saved_pct)
}

/// Slimmed trace payload attached to projected responses
pub fn slim_trace(trace: &Value) -> Value {
    let mut out = serde_json::Map::new();
    for key in [
        "trace_id",
        "skill_id",
        "endpoint_id",
        "success",
        "status_code",
        "trace_version",
    ] {
        if let Some(value) = trace.get(key) {
            out.insert(key.to_string(), value.clone());
        }
    }
    Value::Object(out)
}

/// Fire-and-forget telemetry shipper
pub struct TelemetrySink {
    http: reqwest::Client,
    endpoint: Option<String>,
}

impl TelemetrySink {
    pub fn new(index_url: Option<&str>) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: index_url.map(|base| format!("{}/telemetry/perf", base.trim_end_matches('/'))),
        }
    }

    /// Disabled sink for tests and offline runs
    pub fn disabled() -> Self {
        Self::new(None)
    }

    pub fn emit_timing(&self, timing: &OrchestrationTiming) {
        self.post(json!({"kind": "timing", "payload": timing}));
    }

    pub fn emit_trace(&self, trace: &ExecutionTrace) {
        self.post(json!({"kind": "trace", "payload": trace}));
    }

    fn post(&self, body: Value) {
        let Some(endpoint) = self.endpoint.clone() else {
            return;
        };
        let http = self.http.clone();
        tokio::spawn(async move {
            let result = http
                .post(&endpoint)
                .timeout(std::time::Duration::from_secs(5))
                .json(&body)
                .send()
                .await;
            if let Err(e) = result {
                tracing::debug!("Telemetry drop: {}", e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_savings_with_discovery_cost() {
        let discovery = DiscoveryCost {
            capture_ms: 10_000,
            capture_tokens: 8_000,
            response_bytes: 0,
            captured_at: Utc::now(),
        };
        // 4000 bytes -> ~1000 tokens; 8000 - 1000 = 7000 saved.
        let (saved, saved_pct, time_pct) = savings(Some(&discovery), 4_000, 2_500);
        assert_eq!(saved, 7_000);
        assert!((saved_pct - 87.5).abs() < 1e-9);
        assert!((time_pct - 75.0).abs() < 1e-9);
    }

    #[test]
    fn test_savings_fall_back_to_defaults() {
        let (saved, _, _) = savings(None, 4_000, 1_000);
        assert_eq!(saved, DEFAULT_BASELINE_TOKENS - 1_000);
    }

    #[test]
    fn test_savings_never_negative() {
        let discovery = DiscoveryCost {
            capture_ms: 100,
            capture_tokens: 10,
            response_bytes: 0,
            captured_at: Utc::now(),
        };
        let (saved, _, _) = savings(Some(&discovery), 1_000_000, 60_000);
        assert_eq!(saved, 0);
    }

    #[test]
    fn test_slim_trace_keeps_only_slim_fields() {
        let trace = ExecutionTrace::begin("skill-1", "ep-1").finish(true, Some(200));
        let full = serde_json::to_value(&trace).unwrap();
        let slim = slim_trace(&full);
        assert_eq!(slim["skill_id"], "skill-1");
        assert_eq!(slim["success"], true);
        assert_eq!(slim["status_code"], 200);
        assert_eq!(slim["trace_version"], 1);
        assert!(slim.get("started_at").is_none());
        assert!(slim.get("completed_at").is_none());
    }

    #[test]
    fn test_trace_lifecycle() {
        let trace = ExecutionTrace::begin("s", "e");
        assert!(!trace.success);
        let done = trace.finish(true, Some(201));
        assert!(done.success);
        assert!(done.completed_at >= done.started_at);
    }
}
