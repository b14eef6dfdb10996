//! File storage sealed with ChaCha20-Poly1305.
//!
//! The key is derived once per store from a passphrase with Argon2id and a
//! random salt kept next to the slots. Each slot is `nonce || ciphertext`,
//! with a fresh 96-bit nonce per write.

use std::path::{Path, PathBuf};

use argon2::Argon2;
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;
use tracing::debug;

use super::file::write_atomic;
use super::{validate_key, KeyValueStore, StorageError, StorageResult};

const SALT_FILE: &str = "storage.salt";
const SALT_LENGTH: usize = 16;
const KEY_LENGTH: usize = 32;
const NONCE_LENGTH: usize = 12;

pub struct EncryptedFileStore {
    dir: PathBuf,
    cipher: ChaCha20Poly1305,
}

impl EncryptedFileStore {
    /// Open (or create) a sealed store in `dir`.
    ///
    /// # Errors
    /// Fails if the directory cannot be created, the salt is corrupt, or key
    /// derivation fails. A wrong passphrase is only detected on the first read.
    pub fn open(dir: impl Into<PathBuf>, passphrase: &str) -> StorageResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let salt = load_or_create_salt(&dir)?;
        let mut key = [0u8; KEY_LENGTH];
        Argon2::default()
            .hash_password_into(passphrase.as_bytes(), &salt, &mut key)
            .map_err(|e| StorageError::Crypto(format!("key derivation failed: {}", e)))?;

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
        key.fill(0);

        Ok(Self { dir, cipher })
    }

    fn slot_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.sealed", key))
    }

    fn seal(&self, plaintext: &[u8]) -> StorageResult<Vec<u8>> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| StorageError::Crypto(format!("encryption failed: {}", e)))?;

        let mut sealed = Vec::with_capacity(NONCE_LENGTH + ciphertext.len());
        sealed.extend_from_slice(nonce.as_slice());
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    fn open_sealed(&self, sealed: &[u8]) -> StorageResult<Vec<u8>> {
        if sealed.len() < NONCE_LENGTH {
            return Err(StorageError::Crypto("sealed slot is truncated".to_string()));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LENGTH);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| StorageError::Crypto("decryption failed (wrong passphrase or tampered slot)".to_string()))
    }
}

fn load_or_create_salt(dir: &Path) -> StorageResult<Vec<u8>> {
    let path = dir.join(SALT_FILE);
    if path.exists() {
        let salt = std::fs::read(&path)?;
        if salt.len() != SALT_LENGTH {
            return Err(StorageError::Crypto(format!(
                "invalid salt length: expected {} bytes, got {}",
                SALT_LENGTH,
                salt.len()
            )));
        }
        return Ok(salt);
    }

    let mut salt = vec![0u8; SALT_LENGTH];
    rand::thread_rng().fill_bytes(&mut salt);
    write_atomic(&path, &salt)?;
    debug!(?path, "Generated storage salt");
    Ok(salt)
}

impl KeyValueStore for EncryptedFileStore {
    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        validate_key(key)?;
        let path = self.slot_path(key);
        if !path.exists() {
            return Ok(None);
        }
        let sealed = std::fs::read(&path)?;
        self.open_sealed(&sealed).map(Some)
    }

    fn set(&self, key: &str, value: &[u8]) -> StorageResult<()> {
        validate_key(key)?;
        let sealed = self.seal(value)?;
        write_atomic(&self.slot_path(key), &sealed)
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        validate_key(key)?;
        let path = self.slot_path(key);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }
}
