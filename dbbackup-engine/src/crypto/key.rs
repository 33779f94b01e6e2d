//! Key material and PBKDF2-HMAC-SHA-256 derivation.

use crate::utils::errors::{EngineError, Result};
use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use std::fmt;
use std::path::Path;

pub const KEY_SIZE: usize = 32;
pub const SALT_SIZE: usize = 32;

/// Iterations for backup artifact keys
pub const ARTIFACT_KDF_ITERATIONS: u32 = 100_000;

/// Iterations for WAL keys
pub const WAL_KDF_ITERATIONS: u32 = 600_000;

/// A 256-bit AES key
#[derive(Clone)]
pub struct EncryptionKey([u8; KEY_SIZE]);

impl EncryptionKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let key: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| {
            EngineError::Config(format!(
                "invalid key size: expected {} bytes, got {}",
                KEY_SIZE,
                bytes.len()
            ))
        })?;
        Ok(Self(key))
    }

    /// Read a raw key file. Accepts 32 raw bytes or 64 hex characters.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read(path)?;
        if content.len() == KEY_SIZE {
            return Self::from_bytes(&content);
        }
        let text = String::from_utf8_lossy(&content);
        let decoded = hex::decode(text.trim())
            .map_err(|e| EngineError::Config(format!("key file {} is not 32 bytes or hex: {}", path.display(), e)))?;
        Self::from_bytes(&decoded)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey(..)")
    }
}

/// Where an artifact key comes from
#[derive(Clone)]
pub enum KeySource {
    /// Derived with PBKDF2 from the salt stored in the container header
    Passphrase(String),
    Raw(EncryptionKey),
}

impl fmt::Debug for KeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeySource::Passphrase(_) => f.write_str("KeySource::Passphrase(..)"),
            KeySource::Raw(_) => f.write_str("KeySource::Raw(..)"),
        }
    }
}

impl KeySource {
    /// Resolve to a concrete key for the given header salt
    pub fn resolve(&self, salt: &[u8]) -> EncryptionKey {
        match self {
            KeySource::Passphrase(passphrase) => derive_key(passphrase, salt, ARTIFACT_KDF_ITERATIONS),
            KeySource::Raw(key) => key.clone(),
        }
    }
}

pub fn derive_key(passphrase: &str, salt: &[u8], iterations: u32) -> EncryptionKey {
    let mut out = [0u8; KEY_SIZE];
    pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, iterations, &mut out);
    EncryptionKey(out)
}

pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_key_size_enforced() {
        assert!(EncryptionKey::from_bytes(&[0u8; 32]).is_ok());
        assert!(matches!(
            EncryptionKey::from_bytes(&[0u8; 16]),
            Err(EngineError::Config(_))
        ));
    }

    #[test]
    fn test_derivation_is_deterministic_per_salt() {
        let a = derive_key("pw", &[1u8; SALT_SIZE], 1_000);
        let b = derive_key("pw", &[1u8; SALT_SIZE], 1_000);
        let c = derive_key("pw", &[2u8; SALT_SIZE], 1_000);
        assert_eq!(a.as_bytes(), b.as_bytes());
        assert_ne!(a.as_bytes(), c.as_bytes());
    }

    #[test]
    fn test_key_file_hex() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("wal.key");
        std::fs::write(&path, format!("{}\n", "ab".repeat(32)))?;
        let key = EncryptionKey::from_file(&path)?;
        assert_eq!(key.as_bytes(), &[0xab; 32]);
        Ok(())
    }
}
