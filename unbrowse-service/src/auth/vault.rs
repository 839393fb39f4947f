//! Encrypted on-disk credential vault
//!
//! A single file holding a domain-to-credential map, sealed with
//! ChaCha20-Poly1305. The data key never touches disk; it lives in the OS
//! keychain and is minted on first use. File layout: 12-byte nonce followed
//! by the ciphertext.

use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;

use super::credentials::LoginCredential;
use crate::error::{Error, Result};

const NONCE_LEN: usize = 12;
const KEYCHAIN_SERVICE: &str = "unbrowse";
const KEYCHAIN_KEY_ENTRY: &str = "vault-key";

/// Encrypted key-value credential store
pub struct CredentialVault {
    path: PathBuf,
    key: Key,
}

impl CredentialVault {
    /// Open the vault at `path`, fetching (or minting) the data key from the
    /// OS keychain.
    pub fn open(path: PathBuf) -> Result<Self> {
        let key = load_or_create_key()?;
        Ok(Self { path, key })
    }

    /// Open with an explicit key; keychain never consulted
    pub fn with_key(path: PathBuf, key_bytes: [u8; 32]) -> Self {
        Self {
            path,
            key: *Key::from_slice(&key_bytes),
        }
    }

    /// Credentials stored for a domain
    pub fn get(&self, domain: &str) -> Result<Option<LoginCredential>> {
        Ok(self.load_entries()?.remove(domain))
    }

    /// Store credentials for a domain, replacing any previous entry
    pub fn put(&self, domain: &str, credential: LoginCredential) -> Result<()> {
        let mut entries = self.load_entries()?;
        entries.insert(domain.to_string(), credential);
        self.save_entries(&entries)
    }

    /// Remove a domain's credentials; true when something was deleted
    pub fn delete(&self, domain: &str) -> Result<bool> {
        let mut entries = self.load_entries()?;
        let removed = entries.remove(domain).is_some();
        if removed {
            self.save_entries(&entries)?;
        }
        Ok(removed)
    }

    fn load_entries(&self) -> Result<BTreeMap<String, LoginCredential>> {
        let raw = match std::fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(Error::Io(e)),
        };
        if raw.len() < NONCE_LEN {
            return Err(Error::Credential("vault file truncated".to_string()));
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        let cipher = ChaCha20Poly1305::new(&self.key);
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| Error::Credential("vault decryption failed".to_string()))?;
        serde_json::from_slice(&plaintext)
            .map_err(|e| Error::Credential(format!("vault contents corrupt: {}", e)))
    }

    fn save_entries(&self, entries: &BTreeMap<String, LoginCredential>) -> Result<()> {
        let plaintext = serde_json::to_vec(entries)
            .map_err(|e| Error::Internal(format!("vault serialization failed: {}", e)))?;
        let cipher = ChaCha20Poly1305::new(&self.key);
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_slice())
            .map_err(|_| Error::Credential("vault encryption failed".to_string()))?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // Atomic replace; the temp file gets owner-only permissions first.
        let tmp = self.path.with_extension("db.tmp");
        {
            let mut file = std::fs::File::create(&tmp)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
            }
            file.write_all(&nonce)?;
            file.write_all(&ciphertext)?;
            file.flush()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

fn load_or_create_key() -> Result<Key> {
    use base64::Engine;
    let entry = keyring::Entry::new(KEYCHAIN_SERVICE, KEYCHAIN_KEY_ENTRY)
        .map_err(|e| Error::Credential(format!("keychain unavailable: {}", e)))?;

    match entry.get_password() {
        Ok(encoded) => {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .map_err(|e| Error::Credential(format!("stored vault key corrupt: {}", e)))?;
            if bytes.len() != 32 {
                return Err(Error::Credential("stored vault key has wrong length".into()));
            }
            Ok(*Key::from_slice(&bytes))
        }
        Err(keyring::Error::NoEntry) => {
            let key = ChaCha20Poly1305::generate_key(&mut OsRng);
            let encoded = base64::engine::general_purpose::STANDARD.encode(key.as_slice());
            entry
                .set_password(&encoded)
                .map_err(|e| Error::Credential(format!("failed to store vault key: {}", e)))?;
            Ok(key)
        }
        Err(e) => Err(Error::Credential(format!("keychain read failed: {}", e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_vault(dir: &tempfile::TempDir) -> CredentialVault {
        CredentialVault::with_key(dir.path().join("vault.db"), [7u8; 32])
    }

    #[test]
    fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let vault = test_vault(&dir);

        assert!(vault.get("example.com").unwrap().is_none());
        vault
            .put(
                "example.com",
                LoginCredential {
                    username: "alice".into(),
                    password: "s3cret".into(),
                },
            )
            .unwrap();

        let cred = vault.get("example.com").unwrap().unwrap();
        assert_eq!(cred.username, "alice");
        assert_eq!(cred.password, "s3cret");
    }

    #[test]
    fn test_ciphertext_hides_plaintext() {
        let dir = tempfile::tempdir().unwrap();
        let vault = test_vault(&dir);
        vault
            .put(
                "example.com",
                LoginCredential {
                    username: "alice".into(),
                    password: "hunter2-hunter2".into(),
                },
            )
            .unwrap();

        let raw = std::fs::read(dir.path().join("vault.db")).unwrap();
        let raw_text = String::from_utf8_lossy(&raw);
        assert!(!raw_text.contains("hunter2"));
        assert!(!raw_text.contains("alice"));
    }

    #[test]
    fn test_wrong_key_fails_closed() {
        let dir = tempfile::tempdir().unwrap();
        let vault = test_vault(&dir);
        vault
            .put(
                "example.com",
                LoginCredential {
                    username: "a".into(),
                    password: "b".into(),
                },
            )
            .unwrap();

        let other = CredentialVault::with_key(dir.path().join("vault.db"), [8u8; 32]);
        assert!(other.get("example.com").is_err());
    }

    #[test]
    fn test_delete() {
        let dir = tempfile::tempdir().unwrap();
        let vault = test_vault(&dir);
        vault
            .put(
                "example.com",
                LoginCredential {
                    username: "a".into(),
                    password: "b".into(),
                },
            )
            .unwrap();
        assert!(vault.delete("example.com").unwrap());
        assert!(!vault.delete("example.com").unwrap());
        assert!(vault.get("example.com").unwrap().is_none());
    }
}
