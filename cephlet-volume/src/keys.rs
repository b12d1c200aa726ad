//! Data encryption key management.
//!
//! Every encrypted volume gets its own data encryption key (DEK). The DEK is
//! only ever stored wrapped by the key-encryption-key (KEK), which is loaded
//! once from a file at startup and kept in memory.
//!
//! Wrapped layout (AES-256-GCM):
//! ```text
//! [ nonce (12 bytes) ][ ciphertext + GCM tag ]
//! ```

use std::path::Path;

use ring::aead::{self, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use sha2::{Digest, Sha256};
use tracing::info;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Result, VolumeError};

/// Size of a DEK in bytes, the key length of AES-256.
pub const DEK_LEN: usize = 32;

/// Wraps and unwraps per-volume data encryption keys.
pub trait KeyManager: Send + Sync {
    /// Generate a fresh random DEK.
    fn generate_dek(&self) -> Result<Vec<u8>>;

    /// Encrypt a DEK under the KEK.
    fn wrap_dek(&self, dek: &[u8]) -> Result<Vec<u8>>;

    /// Decrypt a DEK previously returned by `wrap_dek`.
    fn unwrap_dek(&self, wrapped: &[u8]) -> Result<Vec<u8>>;
}

#[derive(Zeroize, ZeroizeOnDrop)]
struct Kek([u8; DEK_LEN]);

/// Key manager backed by a KEK file.
pub struct FileKeyManager {
    kek: Kek,
    rng: SystemRandom,
}

impl FileKeyManager {
    /// Load the KEK file.
    ///
    /// The key is the SHA-256 digest of the file contents with trailing
    /// whitespace removed, so any non-empty secret yields an AES-256 key.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut contents = std::fs::read(path).map_err(|e| {
            VolumeError::KeyUnavailable(format!("failed to read {}: {}", path.display(), e))
        })?;

        let manager = Self::from_secret(trim_end(&contents));
        contents.zeroize();
        let manager = manager.map_err(|_| {
            VolumeError::KeyUnavailable(format!("key file {} is empty", path.display()))
        })?;

        info!(path = %path.display(), "Key encryption key loaded");
        Ok(manager)
    }

    /// Derive the KEK from raw secret bytes.
    pub fn from_secret(secret: &[u8]) -> Result<Self> {
        if secret.is_empty() {
            return Err(VolumeError::KeyUnavailable("empty key-encryption secret".into()));
        }
        let mut kek = [0u8; DEK_LEN];
        kek.copy_from_slice(&Sha256::digest(secret));
        Ok(Self {
            kek: Kek(kek),
            rng: SystemRandom::new(),
        })
    }

    fn key(&self) -> Result<LessSafeKey> {
        let unbound = UnboundKey::new(&AES_256_GCM, &self.kek.0)
            .map_err(|_| VolumeError::CryptoFailure("invalid key-encryption key".into()))?;
        Ok(LessSafeKey::new(unbound))
    }
}

impl KeyManager for FileKeyManager {
    fn generate_dek(&self) -> Result<Vec<u8>> {
        let mut dek = vec![0u8; DEK_LEN];
        self.rng
            .fill(&mut dek)
            .map_err(|_| VolumeError::CryptoFailure("random source failed".into()))?;
        Ok(dek)
    }

    fn wrap_dek(&self, dek: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce)
            .map_err(|_| VolumeError::CryptoFailure("random source failed".into()))?;

        let mut output = Vec::with_capacity(NONCE_LEN + dek.len() + AES_256_GCM.tag_len());
        output.extend_from_slice(&nonce);
        output.extend_from_slice(dek);

        let tag = self
            .key()?
            .seal_in_place_separate_tag(
                Nonce::assume_unique_for_key(nonce),
                aead::Aad::empty(),
                &mut output[NONCE_LEN..],
            )
            .map_err(|_| VolumeError::CryptoFailure("failed to wrap key".into()))?;
        output.extend_from_slice(tag.as_ref());

        Ok(output)
    }

    fn unwrap_dek(&self, wrapped: &[u8]) -> Result<Vec<u8>> {
        if wrapped.len() < NONCE_LEN + AES_256_GCM.tag_len() {
            return Err(VolumeError::CryptoFailure("wrapped key too short".into()));
        }

        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&wrapped[..NONCE_LEN]);
        let mut payload = wrapped[NONCE_LEN..].to_vec();

        let dek = self
            .key()?
            .open_in_place(
                Nonce::assume_unique_for_key(nonce),
                aead::Aad::empty(),
                &mut payload,
            )
            .map_err(|_| VolumeError::CryptoFailure("failed to unwrap key".into()))?;

        Ok(dek.to_vec())
    }
}

/// Deterministic key manager for tests and development.
///
/// Provides no protection at all: the "wrapped" key is the DEK xored with a
/// fixed byte.
#[derive(Debug, Clone)]
pub struct StaticKeyManager {
    mask: u8,
}

impl StaticKeyManager {
    pub fn new(mask: u8) -> Self {
        Self { mask }
    }
}

impl Default for StaticKeyManager {
    fn default() -> Self {
        Self::new(0x5a)
    }
}

impl KeyManager for StaticKeyManager {
    fn generate_dek(&self) -> Result<Vec<u8>> {
        Ok((0..DEK_LEN as u8).collect())
    }

    fn wrap_dek(&self, dek: &[u8]) -> Result<Vec<u8>> {
        Ok(dek.iter().map(|b| b ^ self.mask).collect())
    }

    fn unwrap_dek(&self, wrapped: &[u8]) -> Result<Vec<u8>> {
        if wrapped.len() != DEK_LEN {
            return Err(VolumeError::CryptoFailure("wrapped key has wrong length".into()));
        }
        Ok(wrapped.iter().map(|b| b ^ self.mask).collect())
    }
}

fn trim_end(bytes: &[u8]) -> &[u8] {
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(0, |i| i + 1);
    &bytes[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn kek_file(contents: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents).unwrap();
        file
    }

    #[test]
    fn test_wrap_unwrap() {
        let file = kek_file(b"abcjdkekakakakakakakkadfkkasfdks");
        let keys = FileKeyManager::load(file.path()).unwrap();

        let dek = keys.generate_dek().unwrap();
        assert_eq!(dek.len(), DEK_LEN);

        let wrapped = keys.wrap_dek(&dek).unwrap();
        assert_ne!(&wrapped[NONCE_LEN..NONCE_LEN + DEK_LEN], dek.as_slice());
        assert_eq!(keys.unwrap_dek(&wrapped).unwrap(), dek);
    }

    #[test]
    fn test_fresh_nonce_per_wrap() {
        let keys = FileKeyManager::from_secret(b"secret").unwrap();
        let dek = keys.generate_dek().unwrap();
        assert_ne!(keys.wrap_dek(&dek).unwrap(), keys.wrap_dek(&dek).unwrap());
        assert_ne!(dek, keys.generate_dek().unwrap());
    }

    #[test]
    fn test_trailing_newline_is_ignored() {
        let a = FileKeyManager::load(kek_file(b"secret\n").path()).unwrap();
        let b = FileKeyManager::from_secret(b"secret").unwrap();
        let wrapped = a.wrap_dek(b"0123456789abcdef0123456789abcdef").unwrap();
        assert!(b.unwrap_dek(&wrapped).is_ok());
    }

    #[test]
    fn test_wrong_kek_fails() {
        let a = FileKeyManager::from_secret(b"first").unwrap();
        let b = FileKeyManager::from_secret(b"second").unwrap();
        let wrapped = a.wrap_dek(&a.generate_dek().unwrap()).unwrap();
        assert!(matches!(b.unwrap_dek(&wrapped), Err(VolumeError::CryptoFailure(_))));
    }

    #[test]
    fn test_tampered_blob_fails() {
        let keys = FileKeyManager::from_secret(b"secret").unwrap();
        let mut wrapped = keys.wrap_dek(&keys.generate_dek().unwrap()).unwrap();
        let last = wrapped.len() - 1;
        wrapped[last] ^= 0xff;
        assert!(matches!(keys.unwrap_dek(&wrapped), Err(VolumeError::CryptoFailure(_))));
        assert!(keys.unwrap_dek(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_missing_or_empty_key_file() {
        assert!(matches!(
            FileKeyManager::load("/nonexistent/kek"),
            Err(VolumeError::KeyUnavailable(_))
        ));
        assert!(matches!(
            FileKeyManager::load(kek_file(b"\n").path()),
            Err(VolumeError::KeyUnavailable(_))
        ));
    }

    #[test]
    fn test_static_key_manager() {
        let keys = StaticKeyManager::default();
        let dek = keys.generate_dek().unwrap();
        let wrapped = keys.wrap_dek(&dek).unwrap();
        assert_ne!(wrapped, dek);
        assert_eq!(keys.unwrap_dek(&wrapped).unwrap(), dek);
    }
}
