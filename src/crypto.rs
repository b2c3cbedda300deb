//! Key derivation and AES-CBC/PKCS7 body encryption (spec 4.2, spec 9
//! "Password-derived keys and zeroing").
//!
//! Grounded on the teacher's `encryption.rs` for the Argon2 password-based
//! derivation shape, and on `ziXnOrg-ORCA/crates/blob_store`'s `KeyProvider`
//! trait for the key-supply idiom. The AEAD cipher the teacher wires
//! (`aes-gcm`) is dropped in favor of `aes`+`cbc`, because the on-wire
//! format is explicitly CBC with an external IV (spec 4.2).

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use argon2::password_hash::SaltString;
use argon2::{Argon2, PasswordHasher};
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{EncryptionError, EncryptionResult};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Length in bytes of the AES-256 key and the CBC IV.
pub const KEY_LEN: usize = 32;
pub const IV_LEN: usize = 16;

/// A 256-bit key that zeroes its backing memory when dropped.
#[derive(Clone, ZeroizeOnDrop)]
pub struct MasterKey([u8; KEY_LEN]);

impl MasterKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey(..)")
    }
}

/// Supplies the master key for a backup/restore session. Implementations
/// may read from a password prompt, a keyring, or (in tests) a fixed key;
/// the broader credential UX is out of scope here (spec 1).
pub trait KeyProvider: Send + Sync {
    fn master_key(&self) -> EncryptionResult<MasterKey>;
}

/// A `KeyProvider` that derives its key from a password via Argon2id, with
/// the salt persisted alongside the backup storage definition.
pub struct PasswordKeyProvider {
    password: String,
    salt: SaltString,
}

impl PasswordKeyProvider {
    pub fn new(password: impl Into<String>, salt: SaltString) -> Self {
        Self {
            password: password.into(),
            salt,
        }
    }

    /// Generate a fresh random salt suitable for a new backup storage
    /// definition.
    pub fn random_salt() -> SaltString {
        SaltString::generate(&mut rand::thread_rng())
    }
}

impl KeyProvider for PasswordKeyProvider {
    fn master_key(&self) -> EncryptionResult<MasterKey> {
        let argon2 = Argon2::default();
        let hash = argon2
            .hash_password(self.password.as_bytes(), &self.salt)
            .map_err(|e| EncryptionError::KeyDerivationFailed(e.to_string()))?;
        let output = hash
            .hash
            .ok_or_else(|| EncryptionError::KeyDerivationFailed("no hash output".to_string()))?;
        let bytes = output.as_bytes();
        if bytes.len() < KEY_LEN {
            return Err(EncryptionError::KeyDerivationFailed(format!(
                "argon2 output too short: {} bytes",
                bytes.len()
            )));
        }
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&bytes[..KEY_LEN]);
        let master = MasterKey::from_bytes(key);
        Ok(master)
    }
}

/// A fixed-key provider for tests and non-interactive pipelines.
pub struct StaticKeyProvider(MasterKey);

impl StaticKeyProvider {
    pub fn new(key: [u8; KEY_LEN]) -> Self {
        Self(MasterKey::from_bytes(key))
    }
}

impl KeyProvider for StaticKeyProvider {
    fn master_key(&self) -> EncryptionResult<MasterKey> {
        Ok(self.0.clone())
    }
}

/// Generate a fresh random 16-byte IV for a new object.
pub fn random_iv() -> [u8; IV_LEN] {
    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);
    iv
}

/// Encrypt `plaintext` under `key`/`iv` with AES-256-CBC/PKCS7.
pub fn encrypt(key: &MasterKey, iv: &[u8; IV_LEN], plaintext: &[u8]) -> EncryptionResult<Vec<u8>> {
    let encryptor = Aes256CbcEnc::new(key.as_bytes().into(), iv.into());
    Ok(encryptor.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
}

/// Decrypt `ciphertext` under `key`/`iv`, validating PKCS7 padding.
pub fn decrypt(key: &MasterKey, iv: &[u8; IV_LEN], ciphertext: &[u8]) -> EncryptionResult<Vec<u8>> {
    let decryptor = Aes256CbcDec::new(key.as_bytes().into(), iv.into());
    decryptor
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| EncryptionError::PaddingError)
}

/// Zero a byte buffer in place. Used on intermediate plaintext buffers once
/// they have been written through to their destination.
pub fn zero(buf: &mut [u8]) {
    buf.zeroize();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_round_trip() {
        let key = MasterKey::from_bytes([9u8; KEY_LEN]);
        let iv = random_iv();
        let plaintext = b"the quick brown fox jumps over the lazy dog";
        let ciphertext = encrypt(&key, &iv, plaintext).unwrap();
        assert_ne!(ciphertext, plaintext);
        let decrypted = decrypt(&key, &iv, &ciphertext).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn decrypt_rejects_corrupted_padding() {
        let key = MasterKey::from_bytes([3u8; KEY_LEN]);
        let iv = random_iv();
        let mut ciphertext = encrypt(&key, &iv, b"hello").unwrap();
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0xFF;
        assert!(decrypt(&key, &iv, &ciphertext).is_err());
    }

    #[test]
    fn static_key_provider_returns_fixed_key() {
        let provider = StaticKeyProvider::new([1u8; KEY_LEN]);
        let key = provider.master_key().unwrap();
        assert_eq!(key.as_bytes(), &[1u8; KEY_LEN]);
    }

    #[test]
    fn password_provider_is_deterministic_for_same_salt() {
        let salt = PasswordKeyProvider::random_salt();
        let p1 = PasswordKeyProvider::new("hunter2", salt.clone());
        let p2 = PasswordKeyProvider::new("hunter2", salt);
        let k1 = p1.master_key().unwrap();
        let k2 = p2.master_key().unwrap();
        assert_eq!(k1.as_bytes(), k2.as_bytes());
    }
}
