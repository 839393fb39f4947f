//! Background token refresh
//!
//! A single loop ticks every minute, re-executes stored refresh configs
//! whose tokens expire within the buffer window, and pushes new tokens into
//! the in-memory entry and the persisted skill auth through a sink. The
//! replay executor reuses the same machinery for synchronous
//! refresh-on-401 recovery.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::refresh::{needs_refresh, RefreshConfig, TokenInfo};
use crate::error::{Error, Result};

/// Receives refreshed tokens for persistence
#[async_trait]
pub trait RefreshSink: Send + Sync {
    /// A refresh succeeded; persist the new tokens for the skill
    async fn apply_refreshed(
        &self,
        skill_id: &str,
        info: &TokenInfo,
        config: &RefreshConfig,
    ) -> Result<()>;

    /// Refreshes kept failing; annotate the skill as degraded
    async fn mark_degraded(&self, skill_id: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
struct RefreshEntry {
    config: RefreshConfig,
    failures: u32,
    degraded: bool,
}

/// Scheduler state shared between the loop and on-demand callers
pub struct RefreshScheduler {
    entries: DashMap<String, RefreshEntry>,
    http: reqwest::Client,
    sink: Arc<dyn RefreshSink>,
    buffer_minutes: i64,
    tick: Duration,
    max_failures: u32,
}

impl RefreshScheduler {
    pub fn new(
        sink: Arc<dyn RefreshSink>,
        buffer_minutes: i64,
        tick: Duration,
        max_failures: u32,
    ) -> Self {
        Self {
            entries: DashMap::new(),
            http: reqwest::Client::new(),
            sink,
            buffer_minutes,
            tick,
            max_failures,
        }
    }

    /// Track a refresh config for a skill, replacing any previous one
    pub fn register(&self, skill_id: impl Into<String>, config: RefreshConfig) {
        self.entries.insert(
            skill_id.into(),
            RefreshEntry {
                config,
                failures: 0,
                degraded: false,
            },
        );
    }

    /// Stop tracking a skill
    pub fn unregister(&self, skill_id: &str) {
        self.entries.remove(skill_id);
    }

    /// Number of tracked configs (degraded ones included)
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Skill ids whose token expires within the buffer window
    fn due(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| !e.degraded && needs_refresh(&e.config, self.buffer_minutes))
            .map(|e| e.key().clone())
            .collect()
    }

    /// Drive the scheduler until cancelled
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Refresh scheduler stopped");
                    break;
                }
                _ = interval.tick() => {
                    self.sweep().await;
                }
            }
        }
    }

    async fn sweep(&self) {
        for skill_id in self.due() {
            match self.refresh_now(&skill_id).await {
                Ok(_) => {
                    tracing::info!(skill_id = %skill_id, "Token refreshed ahead of expiry");
                }
                Err(e) => {
                    tracing::warn!(skill_id = %skill_id, "Token refresh failed: {}", e);
                }
            }
        }
    }

    /// Refresh a skill's token immediately. Used by the scheduler sweep and
    /// by the replay executor's 401 recovery path.
    pub async fn refresh_now(&self, skill_id: &str) -> Result<TokenInfo> {
        let config = self
            .entries
            .get(skill_id)
            .map(|e| e.config.clone())
            .ok_or_else(|| Error::NotFound(format!("no refresh config for skill {}", skill_id)))?;

        match self.execute(&config).await {
            Ok(info) => {
                if let Some(mut entry) = self.entries.get_mut(skill_id) {
                    entry.failures = 0;
                    apply_token_info(&mut entry.config, &info);
                }
                if let Err(e) = self.sink.apply_refreshed(skill_id, &info, &config).await {
                    tracing::warn!(skill_id = %skill_id, "Failed to persist refreshed token: {}", e);
                }
                Ok(info)
            }
            Err(e) => {
                let mut now_degraded = false;
                if let Some(mut entry) = self.entries.get_mut(skill_id) {
                    entry.failures += 1;
                    if entry.failures >= self.max_failures && !entry.degraded {
                        entry.degraded = true;
                        now_degraded = true;
                    }
                }
                if now_degraded {
                    tracing::warn!(skill_id = %skill_id, "Refresh config degraded after repeated failures");
                    if let Err(sink_err) = self.sink.mark_degraded(skill_id).await {
                        tracing::warn!(skill_id = %skill_id, "Failed to annotate degraded skill: {}", sink_err);
                    }
                }
                Err(e)
            }
        }
    }

    async fn execute(&self, config: &RefreshConfig) -> Result<TokenInfo> {
        let method = reqwest::Method::from_bytes(config.method.as_bytes())
            .map_err(|e| Error::Schedule(format!("bad refresh method: {}", e)))?;
        let mut request = self.http.request(method, &config.url);

        let mut is_form = false;
        for (name, value) in config.headers.iter() {
            if name.eq_ignore_ascii_case("content-type") {
                is_form = value.contains("x-www-form-urlencoded");
            }
            request = request.header(name, value);
        }

        request = match &config.body {
            Some(Value::Object(map)) if is_form => {
                let pairs: Vec<(String, String)> = map
                    .iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect();
                request.form(&pairs)
            }
            Some(body @ Value::Object(_)) => request.json(body),
            Some(Value::String(raw)) => request.body(raw.clone()),
            _ => request,
        };

        let response = request
            .send()
            .await
            .map_err(|e| Error::Schedule(format!("refresh request failed: {}", e)))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| Error::Schedule(format!("refresh response unreadable: {}", e)))?;

        if !status.is_success() {
            return Err(Error::Schedule(format!(
                "refresh endpoint returned {}",
                status.as_u16()
            )));
        }
        let info = super::refresh::extract_token_info(&text)
            .ok_or_else(|| Error::Schedule("refresh response carried no tokens".to_string()))?;
        if info.access_token.is_none() {
            return Err(Error::Schedule(
                "refresh response carried no access token".to_string(),
            ));
        }
        Ok(info)
    }
}

/// Fold refreshed tokens back into the stored config so the next cycle
/// uses the rotated refresh token and the new expiry.
fn apply_token_info(config: &mut RefreshConfig, info: &TokenInfo) {
    if let Some(expires_in) = info.expires_in {
        config.expires_in_seconds = Some(expires_in);
        config.expires_at = Some(Utc::now() + ChronoDuration::seconds(expires_in));
    }
    if let Some(new_refresh) = &info.refresh_token {
        config.refresh_token = Some(new_refresh.clone());
        if let Some(Value::Object(map)) = config.body.as_mut() {
            for key in ["refresh_token", "refreshToken"] {
                if map.contains_key(key) {
                    map.insert(key.to_string(), Value::String(new_refresh.clone()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::refresh::RefreshProvider;
    use crate::exchange::HeaderMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSink {
        applied: AtomicUsize,
        degraded: AtomicUsize,
    }

    #[async_trait]
    impl RefreshSink for CountingSink {
        async fn apply_refreshed(
            &self,
            _skill_id: &str,
            _info: &TokenInfo,
            _config: &RefreshConfig,
        ) -> Result<()> {
            self.applied.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn mark_degraded(&self, _skill_id: &str) -> Result<()> {
            self.degraded.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn expired_config(url: &str) -> RefreshConfig {
        RefreshConfig {
            url: url.into(),
            method: "POST".into(),
            headers: HeaderMap::new(),
            body: None,
            provider: RefreshProvider::Generic,
            client_id: None,
            client_secret: None,
            scope: None,
            refresh_token: Some("tok".into()),
            expires_in_seconds: Some(0),
            expires_at: Some(Utc::now()),
        }
    }

    #[test]
    fn test_due_selection_respects_expiry_and_degraded() {
        let sink = Arc::new(CountingSink {
            applied: AtomicUsize::new(0),
            degraded: AtomicUsize::new(0),
        });
        let scheduler = RefreshScheduler::new(sink, 5, Duration::from_secs(60), 3);

        scheduler.register("expiring", expired_config("http://127.0.0.1:9/oauth/token"));
        let mut fresh = expired_config("http://127.0.0.1:9/oauth/token");
        fresh.expires_at = Some(Utc::now() + ChronoDuration::hours(2));
        scheduler.register("fresh", fresh);
        let mut no_expiry = expired_config("http://127.0.0.1:9/oauth/token");
        no_expiry.expires_at = None;
        scheduler.register("opaque", no_expiry);

        let due = scheduler.due();
        assert_eq!(due, vec!["expiring".to_string()]);
    }

    #[tokio::test]
    async fn test_repeated_failures_degrade_the_config() {
        let sink = Arc::new(CountingSink {
            applied: AtomicUsize::new(0),
            degraded: AtomicUsize::new(0),
        });
        let scheduler =
            RefreshScheduler::new(sink.clone(), 5, Duration::from_secs(60), 3);
        // Unroutable target: every attempt fails fast.
        scheduler.register("skill", expired_config("http://127.0.0.1:9/oauth/token"));

        for _ in 0..3 {
            assert!(scheduler.refresh_now("skill").await.is_err());
        }
        assert_eq!(sink.degraded.load(Ordering::SeqCst), 1);
        assert!(scheduler.due().is_empty(), "degraded entries leave the rotation");
    }

    #[test]
    fn test_apply_token_info_rotates_refresh_token_in_body() {
        let mut config = expired_config("http://x/oauth/token");
        config.body = Some(serde_json::json!({"refresh_token": "old"}));
        let info = TokenInfo {
            access_token: Some("A".into()),
            refresh_token: Some("new".into()),
            expires_in: Some(3600),
            ..Default::default()
        };
        apply_token_info(&mut config, &info);
        assert_eq!(config.refresh_token.as_deref(), Some("new"));
        assert_eq!(config.body.unwrap()["refresh_token"], "new");
        assert!(config.expires_at.unwrap() > Utc::now());
    }

    #[test]
    fn test_unregister_stops_tracking() {
        let sink = Arc::new(CountingSink {
            applied: AtomicUsize::new(0),
            degraded: AtomicUsize::new(0),
        });
        let scheduler = RefreshScheduler::new(sink, 5, Duration::from_secs(60), 3);
        scheduler.register("skill", expired_config("http://127.0.0.1:9/x"));
        assert_eq!(scheduler.len(), 1);
        scheduler.unregister("skill");
        assert!(scheduler.is_empty());
    }
}
