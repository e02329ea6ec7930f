//! Optional archive of original inputs, encrypted at rest when a password is set.
//!
//! Encrypted layout: `b"VEL1" | salt (16) | nonce (12) | AES-256-GCM ciphertext + tag`.
//! The key is derived from the password and salt with Argon2id.

use crate::config::Config;
use crate::placement;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use argon2::Argon2;
use rand::RngCore;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const ENCRYPTED_MAGIC: &[u8; 4] = b"VEL1";
pub const ENCRYPTED_SUFFIX: &str = ".enc";
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;
const HEADER_LEN: usize = ENCRYPTED_MAGIC.len() + SALT_LEN + NONCE_LEN;

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed (wrong password or damaged file)")]
    Decrypt,
    #[error("not an encrypted archive file")]
    NotEncrypted,
}

/// Where originals are kept, and how.
#[derive(Debug, Clone)]
pub struct OriginalArchive {
    dir: PathBuf,
    password: Option<String>,
}

impl OriginalArchive {
    pub fn new(dir: PathBuf, password: Option<String>) -> Self {
        Self { dir, password }
    }

    /// The configured archive, or `None` when archiving is disabled.
    pub fn from_config(config: &Config) -> Option<Self> {
        let dir = config.originals_archive_dir.clone()?;
        Some(Self::new(dir, config.encryption_password.clone()))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn encrypts(&self) -> bool {
        self.password.is_some()
    }

    /// Archive file name for an input file name.
    pub fn archive_name(&self, file_name: &str) -> String {
        if self.encrypts() {
            format!("original_{file_name}{ENCRYPTED_SUFFIX}")
        } else {
            format!("original_{file_name}")
        }
    }

    /// Store a copy of the original input bytes.
    pub fn store(&self, file_name: &str, bytes: &[u8]) -> Result<PathBuf, ArchiveError> {
        let name = self.archive_name(file_name);
        let path = match &self.password {
            Some(password) => {
                let sealed = encrypt(password, bytes)?;
                placement::write_atomic(&self.dir, &name, &sealed)?
            }
            None => placement::write_atomic(&self.dir, &name, bytes)?,
        };
        tracing::debug!(file = file_name, archive = %path.display(), "original archived");
        Ok(path)
    }
}

fn derive_key(password: &str, salt: &[u8]) -> Result<[u8; KEY_LEN], ArchiveError> {
    let mut key = [0u8; KEY_LEN];
    Argon2::default()
        .hash_password_into(password.as_bytes(), salt, &mut key)
        .map_err(|e| ArchiveError::KeyDerivation(e.to_string()))?;
    Ok(key)
}

/// Encrypt `plaintext` under a key derived from `password`.
pub fn encrypt(password: &str, plaintext: &[u8]) -> Result<Vec<u8>, ArchiveError> {
    let mut salt = [0u8; SALT_LEN];
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    rand::thread_rng().fill_bytes(&mut nonce);

    let key = derive_key(password, &salt)?;
    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| ArchiveError::Encrypt)?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| ArchiveError::Encrypt)?;

    let mut out = Vec::with_capacity(HEADER_LEN + ciphertext.len());
    out.extend_from_slice(ENCRYPTED_MAGIC);
    out.extend_from_slice(&salt);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Reverse [`encrypt`].
pub fn decrypt(password: &str, sealed: &[u8]) -> Result<Vec<u8>, ArchiveError> {
    if sealed.len() < HEADER_LEN || !sealed.starts_with(ENCRYPTED_MAGIC) {
        return Err(ArchiveError::NotEncrypted);
    }
    let (salt, rest) = sealed[ENCRYPTED_MAGIC.len()..].split_at(SALT_LEN);
    let (nonce, ciphertext) = rest.split_at(NONCE_LEN);

    let key = derive_key(password, salt)?;
    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| ArchiveError::Decrypt)?;
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| ArchiveError::Decrypt)
}
