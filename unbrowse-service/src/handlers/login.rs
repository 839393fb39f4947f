//! `/v1/auth/login`: interactive login through the controlled browser
//!
//! Opens the target URL in the real browser, then polls the cookie jar
//! until the user finishes logging in (the jar changes) or the window
//! closes on a timeout. The captured auth state comes back to the caller
//! and lands in the skill's auth file when one exists for the domain.

use axum::{extract::State, Json};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

use crate::browser::StorageKind;
use crate::error::{Error, Result};
use crate::state::AppState;

const POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub url: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

pub async fn interactive_login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<Value>> {
    let url = request
        .url
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::Input("url is required".to_string()))?;
    let timeout = Duration::from_secs(
        request
            .timeout_secs
            .unwrap_or(state.config().capture.session_timeout_secs),
    );

    let browser = state.browser();
    if !browser.ensure_running().await? {
        return Err(Error::Upstream("browser is not available".to_string()));
    }
    let baseline = browser.cookies().await.unwrap_or_default();
    if !browser.navigate(url).await? {
        return Err(Error::Upstream(format!("navigation to {} failed", url)));
    }

    // The user drives the login; completion shows up as a changed jar.
    let deadline = tokio::time::Instant::now() + timeout;
    let cookies = loop {
        if tokio::time::Instant::now() >= deadline {
            return Err(Error::LoginTimeout(format!(
                "no login detected on {} within {}s",
                url,
                timeout.as_secs()
            )));
        }
        tokio::time::sleep(POLL_INTERVAL).await;
        let current = browser.cookies().await.unwrap_or_default();
        if !current.is_empty() && current != baseline {
            break current;
        }
    };

    let local_storage = browser.storage(StorageKind::Local).await.unwrap_or_default();
    let session_storage = browser
        .storage(StorageKind::Session)
        .await
        .unwrap_or_default();

    // A learned skill for this domain inherits the fresh session.
    if let Some(domain) = url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_string()))
    {
        let slug = crate::skill::slugify(&domain);
        if state.store().load_skill(&slug).ok().flatten().is_some() {
            let cookies = cookies.clone();
            let local = local_storage.clone();
            let session = session_storage.clone();
            if let Err(e) = state.store().update_auth(&slug, move |auth| {
                auth.cookies = cookies;
                auth.local_storage = local;
                auth.session_storage = session;
                auth.last_open_claw_browse_at = Some(chrono::Utc::now());
            }) {
                tracing::warn!(domain = %domain, "Failed to persist login state: {}", e);
            }
        }
    }

    Ok(Json(json!({
        "cookies": cookies,
        "localStorage": local_storage,
        "sessionStorage": session_storage,
    })))
}
