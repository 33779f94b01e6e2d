//! AES-256-GCM encryption for backup artifacts and WAL segments.
//!
//! Two containers are supported:
//! - the chunked artifact container (`DBBACKUP_ENCRYPTED_V1`), streamed so
//!   dumps of any size never sit in memory;
//! - the WAL segment container (`WALENC01`), a single AEAD message since a
//!   segment is at most 16 MiB.

pub mod key;
pub mod segment;
pub mod stream;

pub use key::{derive_key, EncryptionKey, KeySource, KEY_SIZE, SALT_SIZE};
pub use segment::{decrypt_segment, encrypt_segment, is_encrypted_segment};
pub use stream::{
    decrypt_file, decrypt_stream, encrypt_file, encrypt_in_place, encrypt_stream, is_encrypted_file,
    ENCRYPTION_ALGORITHM,
};
