//! Browser control capability
//!
//! The browser driver lives outside this process; the core only depends on
//! this narrow contract. The HTTP implementation talks to the local control
//! channel (gateway port + 2). Everything else in the system takes the
//! trait, so tests script a browser in memory.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

use crate::analyze::profile::HeaderCapturer;
use crate::error::{Error, Result};
use crate::exchange::{HeaderMap, ParamMap};

/// Which browser storage to read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Local,
    Session,
}

/// Wait condition for page readiness
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WaitOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load_state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_ms: Option<u64>,
    pub timeout_ms: u64,
}

/// One interactive element in a snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SnapshotElement {
    #[serde(rename = "ref")]
    pub element_ref: String,
    pub tag: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

/// Page snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Snapshot {
    pub url: String,
    pub title: String,
    pub snapshot: String,
    #[serde(default)]
    pub elements: Vec<SnapshotElement>,
}

/// Scripted interaction kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Click,
    Type,
    Press,
    Select,
}

/// One scripted interaction
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserAction {
    pub kind: ActionKind,
    #[serde(rename = "ref", skip_serializing_if = "Option::is_none")]
    pub element_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

/// Interaction outcome
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One request observed by the browser
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WireRequest {
    pub method: String,
    pub url: String,
    pub status: u16,
    pub resource_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<HeaderMap>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_headers: Option<HeaderMap>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_body: Option<String>,
}

/// The browser driver contract the core depends on
#[async_trait]
pub trait BrowserControl: Send + Sync {
    async fn is_available(&self) -> bool;
    async fn ensure_running(&self) -> Result<bool>;
    async fn navigate(&self, url: &str) -> Result<bool>;
    async fn wait(&self, options: &WaitOptions) -> Result<bool>;
    async fn snapshot(&self) -> Result<Snapshot>;
    async fn act(&self, action: &BrowserAction) -> Result<ActResult>;
    /// Captured network requests; `clear` drains the browser-side buffer
    async fn requests(&self, clear: bool) -> Result<Vec<WireRequest>>;
    async fn cookies(&self) -> Result<ParamMap>;
    async fn storage(&self, kind: StorageKind) -> Result<BTreeMap<String, String>>;
    async fn evaluate(&self, js: &str) -> Result<Value>;
}

/// HTTP client against the local browser control channel
pub struct HttpBrowserControl {
    base_url: String,
    http: reqwest::Client,
}

impl HttpBrowserControl {
    /// Control channel listens at gateway port + 2
    pub fn from_gateway_port(gateway_port: u16) -> Self {
        Self::new(format!("http://127.0.0.1:{}", gateway_port + 2))
    }

    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    async fn call<T: serde::de::DeserializeOwned>(&self, op: &str, body: Value) -> Result<T> {
        let url = format!("{}/{}", self.base_url, op);
        let response = self
            .http
            .post(&url)
            .timeout(std::time::Duration::from_secs(30))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Upstream(format!("browser control {} failed: {}", op, e)))?;
        if !response.status().is_success() {
            return Err(Error::Upstream(format!(
                "browser control {} returned {}",
                op,
                response.status().as_u16()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| Error::Upstream(format!("browser control {} response corrupt: {}", op, e)))
    }
}

#[async_trait]
impl BrowserControl for HttpBrowserControl {
    async fn is_available(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        matches!(
            self.http
                .get(&url)
                .timeout(std::time::Duration::from_secs(2))
                .send()
                .await,
            Ok(response) if response.status().is_success()
        )
    }

    async fn ensure_running(&self) -> Result<bool> {
        self.call("ensure-running", json!({})).await
    }

    async fn navigate(&self, url: &str) -> Result<bool> {
        self.call("navigate", json!({"url": url})).await
    }

    async fn wait(&self, options: &WaitOptions) -> Result<bool> {
        self.call("wait", serde_json::to_value(options).unwrap_or_default())
            .await
    }

    async fn snapshot(&self) -> Result<Snapshot> {
        self.call(
            "snapshot",
            json!({"format": "aria", "mode": "full", "refs": true, "interactive": true, "labels": true}),
        )
        .await
    }

    async fn act(&self, action: &BrowserAction) -> Result<ActResult> {
        self.call("act", serde_json::to_value(action).unwrap_or_default())
            .await
    }

    async fn requests(&self, clear: bool) -> Result<Vec<WireRequest>> {
        self.call("requests", json!({"clear": clear})).await
    }

    async fn cookies(&self) -> Result<ParamMap> {
        self.call("cookies", json!({})).await
    }

    async fn storage(&self, kind: StorageKind) -> Result<BTreeMap<String, String>> {
        self.call("storage", json!({"kind": kind})).await
    }

    async fn evaluate(&self, js: &str) -> Result<Value> {
        self.call("evaluate", json!({"js": js})).await
    }
}

#[async_trait]
impl HeaderCapturer for HttpBrowserControl {
    /// Fresh header values for a domain: the latest captured request wins.
    async fn live_headers(&self, url: &str) -> Result<HeaderMap> {
        let domain = url::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_string()));
        let requests = self.requests(false).await?;
        let latest = requests.iter().rev().find(|r| {
            domain.as_deref().is_none_or(|d| {
                url::Url::parse(&r.url)
                    .ok()
                    .and_then(|u| u.host_str().map(|h| h == d))
                    .unwrap_or(false)
            })
        });
        Ok(latest
            .and_then(|r| r.headers.clone())
            .unwrap_or_default())
    }
}
