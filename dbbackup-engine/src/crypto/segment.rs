//! WAL segment container: `WALENC01` magic, then the AEAD body whose first
//! 12 bytes are the nonce. A segment is sealed as a single message.

use super::key::{random_bytes, EncryptionKey};
use crate::utils::errors::{EngineError, Result};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};

pub const SEGMENT_MAGIC: &[u8; 8] = b"WALENC01";
const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;

pub fn encrypt_segment(plaintext: &[u8], key: &EncryptionKey) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    let nonce = random_bytes::<NONCE_SIZE>();
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|e| EngineError::Integrity(format!("segment encryption failed: {}", e)))?;

    let mut out = Vec::with_capacity(SEGMENT_MAGIC.len() + NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(SEGMENT_MAGIC);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

pub fn decrypt_segment(sealed: &[u8], key: &EncryptionKey) -> Result<Vec<u8>> {
    if sealed.len() < SEGMENT_MAGIC.len() + NONCE_SIZE + TAG_SIZE {
        return Err(EngineError::Integrity("encrypted WAL segment too short".to_string()));
    }
    if !is_encrypted_segment(sealed) {
        return Err(EngineError::Integrity("invalid WAL encryption header".to_string()));
    }
    let body = &sealed[SEGMENT_MAGIC.len()..];
    let (nonce, ciphertext) = body.split_at(NONCE_SIZE);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    cipher.decrypt(Nonce::from_slice(nonce), ciphertext).map_err(|_| {
        EngineError::Authentication("WAL segment decryption failed: wrong key or corrupted data".to_string())
    })
}

pub fn is_encrypted_segment(data: &[u8]) -> bool {
    data.len() >= SEGMENT_MAGIC.len() && &data[..SEGMENT_MAGIC.len()] == SEGMENT_MAGIC
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(byte: u8) -> EncryptionKey {
        EncryptionKey::from_bytes(&[byte; 32]).unwrap()
    }

    #[test]
    fn test_segment_round_trip() {
        let segment = vec![0x5au8; 16 * 1024];
        let sealed = encrypt_segment(&segment, &key(9)).unwrap();
        assert!(is_encrypted_segment(&sealed));
        assert_eq!(sealed.len(), 8 + 12 + segment.len() + 16);
        assert_eq!(decrypt_segment(&sealed, &key(9)).unwrap(), segment);
    }

    #[test]
    fn test_segment_wrong_key() {
        let sealed = encrypt_segment(b"wal bytes", &key(1)).unwrap();
        assert!(matches!(
            decrypt_segment(&sealed, &key(2)),
            Err(EngineError::Authentication(_))
        ));
    }

    #[test]
    fn test_segment_tamper_detected() {
        let mut sealed = encrypt_segment(b"wal bytes", &key(1)).unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(decrypt_segment(&sealed, &key(1)).is_err());
    }
}
