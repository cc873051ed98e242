use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use argon2::{Algorithm, Argon2, Params, Version};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use keyring::Entry;
use rand::RngCore;
use tracing::info;

use crate::config::APP_NAME;

/// Keychain account holding the generated key when no passphrase is configured
const KEYRING_ACCOUNT: &str = "session-encryption-key";

/// Fixed KDF salt. The passphrase is the secret; the salt only separates this
/// use of it from any other.
const KDF_SALT: &[u8] = b"quillpost.session.v1";

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// Argon2id cost: 8 MiB, 2 passes. The derivation runs once per client.
const KDF_MEMORY_KIB: u32 = 8 * 1024;
const KDF_ITERATIONS: u32 = 2;

/// Reversible transform applied to the serialized session before storage.
pub struct SessionCipher {
    cipher: ChaCha20Poly1305,
}

impl SessionCipher {
    /// Derive the encryption key from a passphrase.
    pub fn from_passphrase(passphrase: &str) -> Result<Self> {
        let params = Params::new(KDF_MEMORY_KIB, KDF_ITERATIONS, 1, Some(KEY_LEN))
            .map_err(|e| anyhow!("Invalid key derivation parameters: {}", e))?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let mut key = [0u8; KEY_LEN];
        argon2
            .hash_password_into(passphrase.as_bytes(), KDF_SALT, &mut key)
            .map_err(|e| anyhow!("Failed to derive encryption key: {}", e))?;

        Ok(Self::from_key(&key))
    }

    /// Use the key stored in the OS keychain, generating one on first use.
    ///
    /// Fails when the keychain is unavailable or does not keep a newly stored
    /// key, so a key that would be lost on exit is never handed out.
    pub fn from_keyring() -> Result<Self> {
        let entry = Entry::new(APP_NAME, KEYRING_ACCOUNT)
            .context("Failed to create keyring entry")?;

        let key = match entry.get_password() {
            Ok(encoded) => decode_key(&encoded)?,
            Err(keyring::Error::NoEntry) => {
                let key = random_key();
                let encoded = STANDARD.encode(key);
                entry
                    .set_password(&encoded)
                    .context("Failed to store encryption key in keychain")?;

                let stored = Entry::new(APP_NAME, KEYRING_ACCOUNT)
                    .and_then(|e| e.get_password())
                    .ok();
                if stored.as_deref() != Some(encoded.as_str()) {
                    bail!("Keychain did not keep the encryption key");
                }
                info!("Generated new session encryption key in keychain");
                key.to_vec()
            }
            Err(e) => return Err(e).context("Failed to read encryption key from keychain"),
        };
        Ok(Self::from_key(&key))
    }

    /// Use the key kept in `path`, creating the file on first use.
    pub fn from_key_file(path: &Path) -> Result<Self> {
        if path.exists() {
            let encoded = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            return Ok(Self::from_key(&decode_key(&encoded)?));
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let key = random_key();
        std::fs::write(path, STANDARD.encode(key))
            .with_context(|| format!("Failed to write {}", path.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
                .with_context(|| format!("Failed to restrict {}", path.display()))?;
        }
        info!(path = %path.display(), "Generated new session encryption key file");
        Ok(Self::from_key(&key))
    }

    /// A key that lives only as long as this value.
    pub fn ephemeral() -> Self {
        Self::from_key(&random_key())
    }

    fn from_key(key: &[u8]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }

    /// Encrypt and encode as base64(`nonce || ciphertext`).
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| anyhow!("Failed to encrypt session data"))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(out))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<String> {
        let raw = STANDARD
            .decode(encoded.trim())
            .context("Encrypted session is not valid base64")?;
        if raw.len() < NONCE_LEN {
            return Err(anyhow!("Encrypted session is truncated"));
        }

        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| anyhow!("Failed to decrypt session data (wrong key?)"))?;

        String::from_utf8(plaintext).context("Decrypted session is not UTF-8")
    }
}

fn random_key() -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

fn decode_key(encoded: &str) -> Result<Vec<u8>> {
    let key = STANDARD
        .decode(encoded.trim())
        .context("Stored encryption key is not valid base64")?;
    if key.len() != KEY_LEN {
        bail!("Stored encryption key has wrong length: {} bytes", key.len());
    }
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt() {
        let cipher = SessionCipher::from_passphrase("correct horse").unwrap();
        let sealed = cipher.encrypt(r#"{"token":"abc"}"#).unwrap();
        assert!(!sealed.contains("abc"));
        assert_eq!(cipher.decrypt(&sealed).unwrap(), r#"{"token":"abc"}"#);
    }

    #[test]
    fn test_nonce_differs_per_write() {
        let cipher = SessionCipher::from_passphrase("correct horse").unwrap();
        let a = cipher.encrypt("same").unwrap();
        let b = cipher.encrypt("same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = SessionCipher::from_passphrase("one")
            .unwrap()
            .encrypt("secret")
            .unwrap();
        let other = SessionCipher::from_passphrase("two").unwrap();
        assert!(other.decrypt(&sealed).is_err());
    }

    #[test]
    fn test_garbage_input_fails() {
        let cipher = SessionCipher::from_passphrase("k").unwrap();
        assert!(cipher.decrypt("not base64 !!").is_err());
        assert!(cipher.decrypt(&STANDARD.encode([1u8, 2, 3])).is_err());
    }

    #[test]
    fn test_key_file_reused_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("session.key");

        let sealed = SessionCipher::from_key_file(&path).unwrap().encrypt("kept").unwrap();
        assert!(path.exists());

        let reopened = SessionCipher::from_key_file(&path).unwrap();
        assert_eq!(reopened.decrypt(&sealed).unwrap(), "kept");
    }

    #[cfg(unix)]
    #[test]
    fn test_key_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.key");
        SessionCipher::from_key_file(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_corrupt_key_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.key");
        std::fs::write(&path, STANDARD.encode([0u8; 5])).unwrap();
        assert!(SessionCipher::from_key_file(&path).is_err());
    }

    #[test]
    fn test_ephemeral_keys_differ() {
        let sealed = SessionCipher::ephemeral().encrypt("x").unwrap();
        assert!(SessionCipher::ephemeral().decrypt(&sealed).is_err());
    }
}
