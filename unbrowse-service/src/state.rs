//! Application state management

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::auth::credentials::{provider_for, CredentialProvider};
use crate::auth::scheduler::RefreshScheduler;
use crate::auth::wallet::Wallet;
use crate::browser::{BrowserControl, HttpBrowserControl};
use crate::config::Config;
use crate::error::Result;
use crate::replay::{HttpTransport, Transport};
use crate::resolve::{Resolver, ResolverCaches};
use crate::session::SessionRegistry;
use crate::skill::store::{SkillStore, StoreLock, StoreRefreshSink};
use crate::skill::MarketplaceClient;
use crate::telemetry::TelemetrySink;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    store: Arc<SkillStore>,
    market: Arc<MarketplaceClient>,
    caches: Arc<ResolverCaches>,
    scheduler: Arc<RefreshScheduler>,
    telemetry: Arc<TelemetrySink>,
    sessions: Arc<SessionRegistry>,
    resolver: Arc<Resolver>,
    browser: Arc<dyn BrowserControl>,
    credentials: Arc<dyn CredentialProvider>,
    wallet: Arc<Option<Wallet>>,
    shutdown: CancellationToken,
    _lock: Arc<StoreLock>,
}

impl AppState {
    /// Build the full state with the real browser channel and transport.
    pub fn build(config: Config) -> Result<Self> {
        let browser: Arc<dyn BrowserControl> = Arc::new(HttpBrowserControl::from_gateway_port(
            config.capture.gateway_port,
        ));
        // Replay and verification probes run under the tool timeout.
        let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(Duration::from_secs(
            config.capture.tool_timeout_secs,
        )));
        Self::build_with(config, browser, transport)
    }

    /// Build with explicit browser and transport seams (tests script both).
    pub fn build_with(
        config: Config,
        browser: Arc<dyn BrowserControl>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        let store = Arc::new(SkillStore::new(config.storage.skills_dir.clone())?);
        // One control service per skills directory.
        let lock = Arc::new(store.lock()?);

        let market = Arc::new(MarketplaceClient::new(
            config.marketplace.index_url.clone(),
            Duration::from_secs(config.marketplace.search_timeout_secs),
            Duration::from_secs(config.marketplace.download_timeout_secs),
            Duration::from_secs(config.marketplace.health_timeout_secs),
        ));
        let caches = Arc::new(ResolverCaches::new(
            Duration::from_secs(config.resolver.route_cache_ttl_secs),
            Duration::from_secs(config.resolver.captured_domain_ttl_secs),
        ));
        let telemetry = Arc::new(TelemetrySink::new(Some(&config.marketplace.index_url)));
        let sessions = Arc::new(SessionRegistry::new());

        let scheduler = Arc::new(RefreshScheduler::new(
            Arc::new(StoreRefreshSink::new(store.clone())),
            config.refresh.buffer_minutes,
            Duration::from_secs(config.refresh.tick_secs),
            config.refresh.max_failures,
        ));

        // Skills learned in earlier runs re-enter the refresh rotation.
        match store.list_skills() {
            Ok(skills) => {
                for skill in skills {
                    if let Ok(Some(auth)) = store.load_auth(&skill.slug()) {
                        if let Some(refresh) = auth.refresh_config {
                            scheduler.register(skill.skill_id.clone(), refresh);
                        }
                    }
                }
            }
            Err(e) => tracing::warn!("Failed to scan skills for refresh configs: {}", e),
        }

        let credentials = provider_for(config.credentials.source, config.storage.vault_path());

        let wallet = match Wallet::load(&config.storage.skills_dir) {
            Ok(wallet) => wallet,
            Err(e) => {
                tracing::warn!("Wallet unavailable: {}", e);
                None
            }
        };

        let resolver = Arc::new(Resolver::new(
            store.clone(),
            market.clone(),
            caches.clone(),
            browser.clone(),
            scheduler.clone(),
            telemetry.clone(),
            sessions.clone(),
            transport,
            credentials.clone(),
            Duration::from_secs(config.resolver.candidate_timeout_secs),
            Duration::from_secs(config.capture.session_timeout_secs),
            config.resolver.max_candidates,
            config.resolver.confidence_threshold,
        ));

        Ok(Self {
            config: Arc::new(config),
            store,
            market,
            caches,
            scheduler,
            telemetry,
            sessions,
            resolver,
            browser,
            credentials,
            wallet: Arc::new(wallet),
            shutdown: CancellationToken::new(),
            _lock: lock,
        })
    }

    /// Start the refresh scheduler and the cache sweeper.
    pub fn spawn_background(&self) {
        tokio::spawn(self.scheduler.clone().run(self.shutdown.clone()));
        tokio::spawn(
            self.caches
                .clone()
                .run_sweeper(self.shutdown.clone(), Duration::from_secs(60)),
        );
    }

    /// Cancel background loops; called from the shutdown path.
    pub fn begin_shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<SkillStore> {
        &self.store
    }

    pub fn market(&self) -> &Arc<MarketplaceClient> {
        &self.market
    }

    pub fn caches(&self) -> &Arc<ResolverCaches> {
        &self.caches
    }

    pub fn scheduler(&self) -> &Arc<RefreshScheduler> {
        &self.scheduler
    }

    pub fn telemetry(&self) -> &Arc<TelemetrySink> {
        &self.telemetry
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn resolver(&self) -> &Arc<Resolver> {
        &self.resolver
    }

    pub fn browser(&self) -> &Arc<dyn BrowserControl> {
        &self.browser
    }

    pub fn credentials(&self) -> &Arc<dyn CredentialProvider> {
        &self.credentials
    }

    pub fn wallet(&self) -> Option<&Wallet> {
        self.wallet.as_ref().as_ref()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}
