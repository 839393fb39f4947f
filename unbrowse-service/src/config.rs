//! Configuration management using Figment
//!
//! Configuration is loaded from multiple sources with the following precedence (highest to lowest):
//! 1. Environment variables (prefix: UNBROWSE_, nested with __)
//! 2. Current working directory: ./unbrowse.toml
//! 3. XDG config directory: ~/.config/unbrowse/config.toml
//! 4. Default values
//!
//! A handful of flat environment variables predate the nested scheme
//! (`UNBROWSE_SKILLS_DIR`, `UNBROWSE_TOOL_TIMEOUT`, ...) and are applied on
//! top for compatibility.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::auth::credentials::CredentialSource;
use crate::error::Result;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub service: ServiceConfig,
    pub storage: StorageConfig,
    pub marketplace: MarketplaceConfig,
    pub capture: CaptureConfig,
    pub refresh: RefreshSchedulerConfig,
    pub resolver: ResolverConfig,
    pub credentials: CredentialsConfig,
    pub wallet: WalletConfig,

    /// Non-empty accepts the terms of service without the first-run prompt
    pub tos_accepted: Option<String>,
}

/// Service-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Service name
    pub name: String,

    /// Port to listen on
    pub port: u16,

    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,

    /// Request timeout in seconds
    pub timeout_secs: u64,

    /// Environment (dev, staging, production)
    pub environment: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "unbrowse".to_string(),
            port: 8787,
            log_level: "info".to_string(),
            timeout_secs: 120,
            environment: "dev".to_string(),
        }
    }
}

/// On-disk state locations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Skill storage root
    pub skills_dir: PathBuf,

    /// Credential vault path; defaults to `<skills_dir>/vault.db`
    pub vault_path: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            skills_dir: default_skills_dir(),
            vault_path: None,
        }
    }
}

impl StorageConfig {
    pub fn vault_path(&self) -> PathBuf {
        self.vault_path
            .clone()
            .unwrap_or_else(|| self.skills_dir.join("vault.db"))
    }
}

fn default_skills_dir() -> PathBuf {
    dirs_home().join(".unbrowse")
}

fn dirs_home() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Marketplace index configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketplaceConfig {
    pub index_url: String,
    pub search_timeout_secs: u64,
    pub download_timeout_secs: u64,
    pub health_timeout_secs: u64,
}

impl Default for MarketplaceConfig {
    fn default() -> Self {
        Self {
            index_url: "https://index.unbrowse.ai".to_string(),
            search_timeout_secs: 15,
            download_timeout_secs: 30,
            health_timeout_secs: 2,
        }
    }
}

/// Live-capture configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Outer tool timeout in seconds
    pub tool_timeout_secs: u64,

    /// Upper bound for one capture session
    pub session_timeout_secs: u64,

    /// Gateway port; the browser control channel listens at gateway + 2
    pub gateway_port: u16,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            tool_timeout_secs: 60,
            session_timeout_secs: 120,
            gateway_port: 18789,
        }
    }
}

/// Token refresh scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshSchedulerConfig {
    /// Refresh this many minutes before expiry
    pub buffer_minutes: i64,

    /// Scheduler tick interval
    pub tick_secs: u64,

    /// Consecutive failures before a config is marked degraded
    pub max_failures: u32,
}

impl Default for RefreshSchedulerConfig {
    fn default() -> Self {
        Self {
            buffer_minutes: 5,
            tick_secs: 60,
            max_failures: 3,
        }
    }
}

/// Resolver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    pub route_cache_ttl_secs: u64,
    pub captured_domain_ttl_secs: u64,
    pub candidate_timeout_secs: u64,

    /// How many marketplace candidates enter the race
    pub max_candidates: usize,

    /// Composite score a candidate needs to race at all
    pub confidence_threshold: f64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            route_cache_ttl_secs: 300,
            captured_domain_ttl_secs: 300,
            candidate_timeout_secs: 30,
            max_candidates: 3,
            confidence_threshold: 0.3,
        }
    }
}

/// Credential lookup configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialsConfig {
    pub source: CredentialSource,
}

/// Wallet configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WalletConfig {
    /// Public wallet address
    pub creator_wallet: Option<String>,
}

impl Config {
    /// Load configuration from all sources
    pub fn load() -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));

        if let Some(xdg_config) = xdg::BaseDirectories::with_prefix("unbrowse").get_config_file("config.toml")
        {
            if xdg_config.exists() {
                figment = figment.merge(Toml::file(xdg_config));
            }
        }

        let config: Config = figment
            .merge(Toml::file("unbrowse.toml"))
            .merge(Env::prefixed("UNBROWSE_").split("__"))
            .extract()?;

        Ok(config.apply_flat_env())
    }

    /// Flat environment variables that override the nested scheme
    fn apply_flat_env(mut self) -> Self {
        if let Ok(dir) = std::env::var("UNBROWSE_SKILLS_DIR") {
            self.storage.skills_dir = PathBuf::from(dir);
        } else if let Ok(dir) = std::env::var("OPENCLAW_SKILLS_DIR") {
            self.storage.skills_dir = PathBuf::from(dir);
        }
        if let Ok(url) = std::env::var("UNBROWSE_INDEX_URL") {
            self.marketplace.index_url = url;
        }
        if let Ok(wallet) = std::env::var("UNBROWSE_CREATOR_WALLET") {
            self.wallet.creator_wallet = Some(wallet);
        }
        if let Ok(source) = std::env::var("UNBROWSE_CREDENTIAL_SOURCE") {
            if let Ok(parsed) =
                serde_json::from_value(serde_json::Value::String(source.to_ascii_lowercase()))
            {
                self.credentials.source = parsed;
            }
        }
        if let Ok(timeout) = std::env::var("UNBROWSE_TOOL_TIMEOUT") {
            if let Ok(secs) = timeout.parse() {
                self.capture.tool_timeout_secs = secs;
            }
        }
        if let Ok(accepted) = std::env::var("UNBROWSE_TOS_ACCEPTED") {
            if !accepted.is_empty() {
                self.tos_accepted = Some(accepted);
            }
        }
        if let Ok(port) = std::env::var("OPENCLAW_GATEWAY_PORT") {
            if let Ok(port) = port.parse() {
                self.capture.gateway_port = port;
            }
        }
        self
    }

    /// True once the user accepted the terms of service
    pub fn tos_accepted(&self) -> bool {
        self.tos_accepted.as_deref().is_some_and(|v| !v.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment mutation must not interleave across tests.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.service.name, "unbrowse");
        assert_eq!(config.service.port, 8787);
        assert_eq!(config.marketplace.index_url, "https://index.unbrowse.ai");
        assert_eq!(config.capture.tool_timeout_secs, 60);
        assert_eq!(config.refresh.buffer_minutes, 5);
        assert_eq!(config.refresh.tick_secs, 60);
        assert_eq!(config.resolver.route_cache_ttl_secs, 300);
        assert_eq!(config.resolver.candidate_timeout_secs, 30);
        assert_eq!(config.resolver.max_candidates, 3);
        assert!((config.resolver.confidence_threshold - 0.3).abs() < 1e-9);
        assert_eq!(config.credentials.source, CredentialSource::None);
        assert!(!config.tos_accepted());
        assert!(config.storage.skills_dir.ends_with(".unbrowse"));
        assert_eq!(
            config.storage.vault_path(),
            config.storage.skills_dir.join("vault.db")
        );
    }

    #[test]
    fn test_flat_env_overrides() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("UNBROWSE_SKILLS_DIR", "/tmp/unbrowse-test-skills");
        std::env::set_var("UNBROWSE_INDEX_URL", "https://index.test.local");
        std::env::set_var("UNBROWSE_TOOL_TIMEOUT", "90");
        std::env::set_var("UNBROWSE_CREDENTIAL_SOURCE", "env");
        std::env::set_var("UNBROWSE_TOS_ACCEPTED", "yes");

        let config = Config::default().apply_flat_env();
        assert_eq!(config.storage.skills_dir, PathBuf::from("/tmp/unbrowse-test-skills"));
        assert_eq!(config.marketplace.index_url, "https://index.test.local");
        assert_eq!(config.capture.tool_timeout_secs, 90);
        assert_eq!(config.credentials.source, CredentialSource::Env);
        assert!(config.tos_accepted());

        for var in [
            "UNBROWSE_SKILLS_DIR",
            "UNBROWSE_INDEX_URL",
            "UNBROWSE_TOOL_TIMEOUT",
            "UNBROWSE_CREDENTIAL_SOURCE",
            "UNBROWSE_TOS_ACCEPTED",
        ] {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn test_openclaw_fallbacks() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::remove_var("UNBROWSE_SKILLS_DIR");
        std::env::set_var("OPENCLAW_SKILLS_DIR", "/tmp/openclaw-skills");
        std::env::set_var("OPENCLAW_GATEWAY_PORT", "19000");

        let config = Config::default().apply_flat_env();
        assert_eq!(config.storage.skills_dir, PathBuf::from("/tmp/openclaw-skills"));
        assert_eq!(config.capture.gateway_port, 19000);

        std::env::remove_var("OPENCLAW_SKILLS_DIR");
        std::env::remove_var("OPENCLAW_GATEWAY_PORT");
    }
}
