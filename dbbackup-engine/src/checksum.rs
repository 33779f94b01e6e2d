//! SHA-256 over artifact files, streamed in fixed-size blocks.

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Lowercase hex SHA-256 of a file's bytes
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let file = File::open(path)?;
    sha256_reader(file)
}

/// Lowercase hex SHA-256 of everything `reader` yields
pub fn sha256_reader<R: Read>(mut reader: R) -> io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

pub fn sha256_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Hash a file on the blocking pool
pub async fn sha256_file_async(path: PathBuf) -> io::Result<String> {
    tokio::task::spawn_blocking(move || sha256_file(&path))
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
}
