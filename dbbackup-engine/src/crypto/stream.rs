//! Chunked AES-256-GCM container for backup artifacts.
//!
//! Layout: a 100-byte header (22-byte magic `DBBACKUP_ENCRYPTED_V1\0`,
//! version, algorithm, 32-byte salt, 12-byte initial nonce, 32 reserved
//! bytes) followed by `u32be length || ciphertext` chunks and a zero-length
//! terminator. Each chunk holds up to 64 KiB of plaintext; the nonce is a
//! big-endian counter incremented once per chunk.

use super::key::{random_bytes, KeySource, SALT_SIZE};
use crate::utils::errors::{EngineError, Result};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

pub const MAGIC: &[u8; 22] = b"DBBACKUP_ENCRYPTED_V1\0";
pub const FORMAT_VERSION: u8 = 1;
pub const ALGORITHM_AES_256_GCM: u8 = 1;
pub const ENCRYPTION_ALGORITHM: &str = "AES-256-GCM";
pub const HEADER_SIZE: usize = 100;
pub const NONCE_SIZE: usize = 12;
pub const CHUNK_SIZE: usize = 64 * 1024;
const TAG_SIZE: usize = 16;
const RESERVED_SIZE: usize = 32;

struct Header {
    salt: [u8; SALT_SIZE],
    nonce: [u8; NONCE_SIZE],
}

impl Header {
    fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[..22].copy_from_slice(MAGIC);
        out[22] = FORMAT_VERSION;
        out[23] = ALGORITHM_AES_256_GCM;
        out[24..56].copy_from_slice(&self.salt);
        out[56..68].copy_from_slice(&self.nonce);
        // 68..100 reserved
        debug_assert_eq!(68 + RESERVED_SIZE, HEADER_SIZE);
        out
    }

    fn decode(raw: &[u8; HEADER_SIZE]) -> Result<Self> {
        if &raw[..22] != MAGIC {
            return Err(EngineError::Integrity("not an encrypted backup (bad magic)".to_string()));
        }
        if raw[22] != FORMAT_VERSION {
            return Err(EngineError::Integrity(format!(
                "unsupported encryption format version {}",
                raw[22]
            )));
        }
        if raw[23] != ALGORITHM_AES_256_GCM {
            return Err(EngineError::Integrity(format!(
                "unsupported encryption algorithm id {}",
                raw[23]
            )));
        }
        let mut salt = [0u8; SALT_SIZE];
        salt.copy_from_slice(&raw[24..56]);
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&raw[56..68]);
        Ok(Self { salt, nonce })
    }
}

fn increment_nonce(nonce: &mut [u8; NONCE_SIZE]) {
    for byte in nonce.iter_mut().rev() {
        let (next, overflow) = byte.overflowing_add(1);
        *byte = next;
        if !overflow {
            break;
        }
    }
}

/// Fill `buf` as far as the reader allows; returns bytes read (short only at EOF)
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn cipher_for(key: &KeySource, salt: &[u8]) -> Aes256Gcm {
    let resolved = key.resolve(salt);
    Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(resolved.as_bytes()))
}

/// Encrypt everything from `reader` into `writer`. Returns plaintext bytes.
pub fn encrypt_stream<R: Read, W: Write>(mut reader: R, mut writer: W, key: &KeySource) -> Result<u64> {
    let header = Header {
        salt: random_bytes::<SALT_SIZE>(),
        nonce: random_bytes::<NONCE_SIZE>(),
    };
    writer.write_all(&header.encode())?;

    let cipher = cipher_for(key, &header.salt);
    let mut nonce = header.nonce;
    let mut chunk = vec![0u8; CHUNK_SIZE];
    let mut total = 0u64;

    loop {
        let read = read_full(&mut reader, &mut chunk)?;
        if read == 0 {
            break;
        }
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), &chunk[..read])
            .map_err(|e| EngineError::Integrity(format!("encryption failed: {}", e)))?;
        writer.write_all(&(ciphertext.len() as u32).to_be_bytes())?;
        writer.write_all(&ciphertext)?;
        increment_nonce(&mut nonce);
        total += read as u64;
        if read < CHUNK_SIZE {
            break;
        }
    }

    writer.write_all(&0u32.to_be_bytes())?;
    writer.flush()?;
    Ok(total)
}

/// Decrypt a container from `reader` into `writer`. Returns plaintext bytes.
pub fn decrypt_stream<R: Read, W: Write>(mut reader: R, mut writer: W, key: &KeySource) -> Result<u64> {
    let mut raw = [0u8; HEADER_SIZE];
    if read_full(&mut reader, &mut raw)? != HEADER_SIZE {
        return Err(EngineError::Integrity("encrypted file truncated inside header".to_string()));
    }
    let header = Header::decode(&raw)?;
    let cipher = cipher_for(key, &header.salt);
    let mut nonce = header.nonce;
    let mut total = 0u64;
    let mut chunk = Vec::with_capacity(CHUNK_SIZE + TAG_SIZE);

    loop {
        let mut len_bytes = [0u8; 4];
        if read_full(&mut reader, &mut len_bytes)? != 4 {
            return Err(EngineError::Integrity(
                "encrypted file truncated: missing end-of-stream marker".to_string(),
            ));
        }
        let len = u32::from_be_bytes(len_bytes) as usize;
        if len == 0 {
            break;
        }
        if len > CHUNK_SIZE + TAG_SIZE {
            return Err(EngineError::Integrity(format!("invalid chunk length {}", len)));
        }
        chunk.resize(len, 0);
        if read_full(&mut reader, &mut chunk)? != len {
            return Err(EngineError::Integrity("encrypted file truncated inside a chunk".to_string()));
        }
        let plaintext = cipher.decrypt(Nonce::from_slice(&nonce), chunk.as_slice()).map_err(|_| {
            EngineError::Authentication("decryption failed: wrong key or corrupted data".to_string())
        })?;
        writer.write_all(&plaintext)?;
        increment_nonce(&mut nonce);
        total += plaintext.len() as u64;
    }

    writer.flush()?;
    Ok(total)
}

pub fn encrypt_file(src: &Path, dst: &Path, key: &KeySource) -> Result<u64> {
    let reader = BufReader::new(File::open(src)?);
    let mut writer = BufWriter::new(File::create(dst)?);
    let total = encrypt_stream(reader, &mut writer, key)?;
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    Ok(total)
}

pub fn decrypt_file(src: &Path, dst: &Path, key: &KeySource) -> Result<u64> {
    let reader = BufReader::new(File::open(src)?);
    let mut writer = BufWriter::new(File::create(dst)?);
    let result = decrypt_stream(reader, &mut writer, key);
    drop(writer);
    if result.is_err() {
        let _ = fs::remove_file(dst);
    }
    result
}

/// Replace `path` with its encrypted form via a sibling temp file and rename
pub fn encrypt_in_place(path: &Path, key: &KeySource) -> Result<u64> {
    let tmp = path.with_file_name(format!(
        ".{}.encrypting",
        path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default()
    ));
    match encrypt_file(path, &tmp, key) {
        Ok(total) => {
            fs::rename(&tmp, path)?;
            Ok(total)
        }
        Err(e) => {
            let _ = fs::remove_file(&tmp);
            Err(e)
        }
    }
}

/// True when the file starts with the container magic
pub fn is_encrypted_file(path: &Path) -> io::Result<bool> {
    let mut file = File::open(path)?;
    let mut magic = [0u8; 22];
    Ok(read_full(&mut file, &mut magic)? == magic.len() && &magic == MAGIC)
}
