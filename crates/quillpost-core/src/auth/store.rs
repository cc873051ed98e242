use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use super::cipher::SessionCipher;
use super::session::SessionData;
use crate::config::{Config, Persistence};
use crate::utils::lock;

/// Logical key the serialized session is stored under
const SESSION_KEY: &str = "session";

/// Fallback home of the generated encryption key, next to the session file
const KEY_FILE: &str = "session.key";

/// Key/value surface the credential store persists through.
pub trait StorageBackend: Send + Sync {
    fn get_item(&self, key: &str) -> Result<Option<String>>;
    fn set_item(&self, key: &str, value: &str) -> Result<()>;
    fn remove_item(&self, key: &str) -> Result<()>;
}

/// Durable storage: one file per key in a directory.
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn item_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.dat", key))
    }
}

impl StorageBackend for FileStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>> {
        let path = self.item_path(key);
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Ok(Some(contents))
    }

    fn set_item(&self, key: &str, value: &str) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;
        let path = self.item_path(key);
        std::fs::write(&path, value)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<()> {
        let path = self.item_path(key);
        if path.exists() {
            std::fs::remove_file(&path)
                .with_context(|| format!("Failed to remove {}", path.display()))?;
        }
        Ok(())
    }
}

/// Process-scoped storage, gone when the client exits.
#[derive(Default)]
pub struct MemoryStorage {
    items: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageBackend for MemoryStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>> {
        Ok(lock(&self.items).get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<()> {
        lock(&self.items).insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<()> {
        lock(&self.items).remove(key);
        Ok(())
    }
}

/// Persists the session under a single key, optionally encrypted.
pub struct CredentialStore {
    backend: Box<dyn StorageBackend>,
    cipher: Option<SessionCipher>,
}

impl CredentialStore {
    pub fn new(backend: Box<dyn StorageBackend>, cipher: Option<SessionCipher>) -> Self {
        Self { backend, cipher }
    }

    /// Pick the backend and encryption from config.
    pub fn from_config(config: &Config) -> Result<Self> {
        match config.persistence {
            Persistence::Durable => Ok(Self::durable(config, config.data_dir()?)),
            Persistence::Session => {
                // Nothing outlives the process, so neither does the key
                let cipher = if !config.encryption_enabled {
                    None
                } else {
                    match config.encryption_key {
                        Some(ref passphrase) => Some(SessionCipher::from_passphrase(passphrase)?),
                        None => Some(SessionCipher::ephemeral()),
                    }
                };
                Ok(Self::new(Box::new(MemoryStorage::new()), cipher))
            }
        }
    }

    /// File-backed store in `dir`. Without a passphrase the key comes from
    /// an existing `session.key` in `dir`, then the OS keychain, then a newly
    /// written `session.key`.
    pub fn durable(config: &Config, dir: PathBuf) -> Self {
        let cipher = if !config.encryption_enabled {
            None
        } else {
            let cipher = match config.encryption_key {
                Some(ref passphrase) => SessionCipher::from_passphrase(passphrase),
                None => Self::stored_key(&dir.join(KEY_FILE)),
            };
            Some(cipher.unwrap_or_else(|e| {
                warn!(error = %e, "No persistent session key; the session will not survive a restart");
                SessionCipher::ephemeral()
            }))
        };
        Self::new(Box::new(FileStorage::new(dir)), cipher)
    }

    fn stored_key(key_file: &Path) -> Result<SessionCipher> {
        if !key_file.exists() {
            match SessionCipher::from_keyring() {
                Ok(cipher) => return Ok(cipher),
                Err(e) => warn!(error = %e, "OS keychain unusable, keeping the session key in a file"),
            }
        }
        SessionCipher::from_key_file(key_file)
    }

    /// Load the stored session. Data that cannot be decrypted or parsed is
    /// discarded and reported as no session.
    pub fn load(&self) -> Result<Option<SessionData>> {
        let Some(raw) = self.backend.get_item(SESSION_KEY)? else {
            return Ok(None);
        };

        let json = match self.cipher {
            Some(ref cipher) => match cipher.decrypt(&raw) {
                Ok(json) => json,
                Err(e) => {
                    warn!(error = %e, "Discarding stored session that could not be decrypted");
                    self.clear()?;
                    return Ok(None);
                }
            },
            None => raw,
        };

        match serde_json::from_str::<SessionData>(&json) {
            Ok(data) => Ok(Some(data)),
            Err(e) => {
                warn!(error = %e, "Discarding stored session that could not be parsed");
                self.clear()?;
                Ok(None)
            }
        }
    }

    pub fn save(&self, data: &SessionData) -> Result<()> {
        let json = serde_json::to_string(data).context("Failed to serialize session")?;
        let value = match self.cipher {
            Some(ref cipher) => cipher.encrypt(&json)?,
            None => json,
        };
        self.backend.set_item(SESSION_KEY, &value)?;
        debug!(user_id = data.user_id, "Session persisted");
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        self.backend.remove_item(SESSION_KEY)
    }
}

// ============================================================================
// Tests
// ============================================================================
