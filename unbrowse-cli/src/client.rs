//! HTTP client for the local control service
//!
//! Exit-code contract: 0 success, 1 generic failure, 2 bad arguments
//! (clap's own exit), 3 upstream unavailable, 4 capture in flight.

use serde_json::Value;

/// CLI-facing failure with its process exit code
#[derive(Debug)]
pub struct CliError {
    pub message: String,
    pub exit_code: i32,
}

impl CliError {
    pub fn generic(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            exit_code: 1,
        }
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            exit_code: 3,
        }
    }

    pub fn capture_in_flight(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            exit_code: 4,
        }
    }
}

pub type CliResult<T> = Result<T, CliError>;

pub struct ControlClient {
    base_url: String,
    http: reqwest::Client,
}

impl ControlClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    pub async fn post(&self, path: &str, body: &Value) -> CliResult<Value> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| CliError::upstream(format!("control service unreachable: {}", e)))?;
        Self::handle(response).await
    }

    pub async fn get(&self, path: &str) -> CliResult<Value> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| CliError::upstream(format!("control service unreachable: {}", e)))?;
        Self::handle(response).await
    }

    async fn handle(response: reqwest::Response) -> CliResult<Value> {
        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|e| CliError::generic(format!("malformed response: {}", e)))?;

        if status.is_success() {
            return Ok(body);
        }

        let message = body
            .get("error")
            .and_then(|e| e.as_str())
            .unwrap_or("request failed")
            .to_string();
        match status.as_u16() {
            409 => Err(CliError::capture_in_flight(message)),
            502 | 504 => Err(CliError::upstream(message)),
            _ => Err(CliError::generic(message)),
        }
    }
}
