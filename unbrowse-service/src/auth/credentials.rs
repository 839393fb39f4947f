//! Credential providers
//!
//! Live capture sometimes needs to log in. Credentials come from exactly one
//! user-configured source; explicit per-call credentials always work
//! regardless of the configured source.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

use super::vault::CredentialVault;
use crate::error::{Error, Result};

/// A username/password pair for a site login
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginCredential {
    pub username: String,
    pub password: String,
}

/// Where credentials are looked up
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialSource {
    /// Lookups disabled; only explicit per-call credentials work
    #[default]
    None,
    /// `UNBROWSE_CRED_<DOMAIN>_{USERNAME,PASSWORD}` environment variables
    Env,
    /// On-disk encrypted vault
    Vault,
    /// OS secret store under `unbrowse/<domain>`
    Keychain,
}

/// Credential lookup seam consulted during live capture and replay
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Credentials for a domain, or None when the source has nothing
    async fn lookup(&self, domain: &str, purpose: &str) -> Result<Option<LoginCredential>>;
}

/// Disabled provider
pub struct NoneProvider;

#[async_trait]
impl CredentialProvider for NoneProvider {
    async fn lookup(&self, _domain: &str, _purpose: &str) -> Result<Option<LoginCredential>> {
        Ok(None)
    }
}

/// Environment-variable provider
pub struct EnvProvider;

/// `app.example.com` -> `APP_EXAMPLE_COM`
fn env_domain_key(domain: &str) -> String {
    domain
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

#[async_trait]
impl CredentialProvider for EnvProvider {
    async fn lookup(&self, domain: &str, _purpose: &str) -> Result<Option<LoginCredential>> {
        let key = env_domain_key(domain);
        let username = std::env::var(format!("UNBROWSE_CRED_{}_USERNAME", key)).ok();
        let password = std::env::var(format!("UNBROWSE_CRED_{}_PASSWORD", key)).ok();
        match (username, password) {
            (Some(username), Some(password)) => Ok(Some(LoginCredential { username, password })),
            _ => Ok(None),
        }
    }
}

/// On-disk encrypted vault provider; the vault is opened read-only per lookup
pub struct VaultProvider {
    path: PathBuf,
}

impl VaultProvider {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl CredentialProvider for VaultProvider {
    async fn lookup(&self, domain: &str, _purpose: &str) -> Result<Option<LoginCredential>> {
        let vault = CredentialVault::open(self.path.clone())?;
        vault.get(domain)
    }
}

/// OS keychain provider under the `unbrowse/<domain>` namespace
pub struct KeychainProvider;

impl KeychainProvider {
    fn entry(domain: &str, field: &str) -> Result<keyring::Entry> {
        keyring::Entry::new(&format!("unbrowse/{}", domain), field)
            .map_err(|e| Error::Credential(format!("keychain unavailable: {}", e)))
    }

    fn read(domain: &str, field: &str) -> Result<Option<String>> {
        match Self::entry(domain, field)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(Error::Credential(format!(
                "keychain read failed for {}: {}",
                domain, e
            ))),
        }
    }
}

#[async_trait]
impl CredentialProvider for KeychainProvider {
    async fn lookup(&self, domain: &str, _purpose: &str) -> Result<Option<LoginCredential>> {
        let username = Self::read(domain, "username")?;
        let password = Self::read(domain, "password")?;
        match (username, password) {
            (Some(username), Some(password)) => Ok(Some(LoginCredential { username, password })),
            _ => Ok(None),
        }
    }
}

/// Build the provider for the configured source
pub fn provider_for(source: CredentialSource, vault_path: PathBuf) -> Arc<dyn CredentialProvider> {
    match source {
        CredentialSource::None => Arc::new(NoneProvider),
        CredentialSource::Env => Arc::new(EnvProvider),
        CredentialSource::Vault => Arc::new(VaultProvider::new(vault_path)),
        CredentialSource::Keychain => Arc::new(KeychainProvider),
    }
}
