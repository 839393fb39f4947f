//! Creator wallet
//!
//! The wallet signs marketplace publishes. The public address lives in
//! `wallet.json`; the private key lives in the OS keychain. Older installs
//! kept the key in the file, so the first load migrates it into the keychain
//! and rewrites the file without it. Read-only at runtime after that.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

const KEYCHAIN_SERVICE: &str = "unbrowse";
const KEYCHAIN_WALLET_ENTRY: &str = "creator-wallet-key";

/// On-disk wallet file. `private_key` only appears in legacy files and is
/// removed on migration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WalletFile {
    creator_wallet: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    private_key: Option<String>,
}

/// Storage slot for the private key
pub trait KeySlot: Send + Sync {
    fn get(&self) -> Result<Option<String>>;
    fn set(&self, value: &str) -> Result<()>;
}

/// OS keychain slot
pub struct KeychainSlot;

impl KeySlot for KeychainSlot {
    fn get(&self) -> Result<Option<String>> {
        let entry = keyring::Entry::new(KEYCHAIN_SERVICE, KEYCHAIN_WALLET_ENTRY)
            .map_err(|e| Error::Credential(format!("keychain unavailable: {}", e)))?;
        match entry.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(Error::Credential(format!("keychain read failed: {}", e))),
        }
    }

    fn set(&self, value: &str) -> Result<()> {
        let entry = keyring::Entry::new(KEYCHAIN_SERVICE, KEYCHAIN_WALLET_ENTRY)
            .map_err(|e| Error::Credential(format!("keychain unavailable: {}", e)))?;
        entry
            .set_password(value)
            .map_err(|e| Error::Credential(format!("keychain write failed: {}", e)))
    }
}

/// Loaded wallet, read-only after startup migration
pub struct Wallet {
    address: String,
    private_key: Option<String>,
}

impl Wallet {
    /// Load the wallet from `<base_dir>/wallet.json`, migrating a legacy
    /// on-disk private key into the keychain.
    pub fn load(base_dir: &Path) -> Result<Option<Wallet>> {
        Self::load_with_slot(base_dir, &KeychainSlot)
    }

    /// As `load`, with an explicit key slot
    pub fn load_with_slot(base_dir: &Path, slot: &dyn KeySlot) -> Result<Option<Wallet>> {
        let path = wallet_path(base_dir);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::Io(e)),
        };
        let mut file: WalletFile = serde_json::from_str(&raw)
            .map_err(|e| Error::Credential(format!("wallet.json corrupt: {}", e)))?;

        if let Some(key) = file.private_key.take() {
            // One-time migration: keychain gets the key, the file loses it.
            slot.set(&key)?;
            write_wallet_file(&path, &file)?;
            tracing::info!("Migrated wallet private key from disk into the keychain");
            return Ok(Some(Wallet {
                address: file.creator_wallet,
                private_key: Some(key),
            }));
        }

        let private_key = slot.get()?;
        Ok(Some(Wallet {
            address: file.creator_wallet,
            private_key,
        }))
    }

    /// Create the wallet file for a configured address (no private key yet)
    pub fn init(base_dir: &Path, address: &str) -> Result<()> {
        let file = WalletFile {
            creator_wallet: address.to_string(),
            private_key: None,
        };
        write_wallet_file(&wallet_path(base_dir), &file)
    }

    /// Public wallet address
    pub fn address(&self) -> &str {
        &self.address
    }

    /// True when a private key is available for signing
    pub fn can_sign(&self) -> bool {
        self.private_key.is_some()
    }

    /// Opaque signature over a payload; the marketplace verifies it
    pub fn sign(&self, payload: &[u8]) -> Result<String> {
        let key = self
            .private_key
            .as_ref()
            .ok_or_else(|| Error::Credential("wallet has no signing key".to_string()))?;
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        hasher.update(payload);
        Ok(hex::encode(hasher.finalize()))
    }
}

fn wallet_path(base_dir: &Path) -> PathBuf {
    base_dir.join("wallet.json")
}

fn write_wallet_file(path: &Path, file: &WalletFile) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(
        &tmp,
        serde_json::to_vec_pretty(file)
            .map_err(|e| Error::Internal(format!("wallet serialization failed: {}", e)))?,
    )?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
