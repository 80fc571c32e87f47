//! Password-based secret encryption and password hashing.
//!
//! Secrets are sealed with AES-256-GCM under a key stretched from the
//! password by Argon2id. A second, independent Argon2id hash (PHC string,
//! its own salt) is stored for fast password rejection.
//!
//! # Wire format
//! ```text
//! salt (16 bytes) || nonce (12 bytes) || auth_tag (16 bytes) || ciphertext
//! ```

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::WalletError;

/// Associated data bound into every sealed secret.
const KEYSTORE_AAD: &[u8] = b"strongbox-keystore-secret-v1";

/// Salt length in bytes.
pub const SALT_LEN: usize = 16;

/// AES-GCM nonce length in bytes.
pub const NONCE_LEN: usize = 12;

/// AES-GCM authentication tag length in bytes.
pub const TAG_LEN: usize = 16;

/// Minimum encrypted payload size (salt + nonce + auth tag).
const MIN_ENCRYPTED_LEN: usize = SALT_LEN + NONCE_LEN + TAG_LEN;

/// Argon2id cost parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KdfParams {
    /// Memory cost in KiB.
    pub memory_kib: u32,
    /// Number of passes.
    pub iterations: u32,
    /// Degree of parallelism.
    pub parallelism: u32,
}

impl KdfParams {
    /// Cheap parameters for tests and benchmarks. Not for real keystores.
    pub const fn light() -> Self {
        Self {
            memory_kib: 1024,
            iterations: 1,
            parallelism: 1,
        }
    }

    fn argon2(&self) -> Result<Argon2<'static>, WalletError> {
        let params = Params::new(self.memory_kib, self.iterations, self.parallelism, Some(32))
            .map_err(|e| WalletError::Encryption(format!("argon2 params: {e}")))?;
        Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: 19 * 1024,
            iterations: 2,
            parallelism: 1,
        }
    }
}

/// Stretch a password and salt into a 256-bit encryption key.
pub fn derive_key(
    password: &[u8],
    salt: &[u8],
    params: &KdfParams,
) -> Result<Zeroizing<[u8; 32]>, WalletError> {
    let mut key = Zeroizing::new([0u8; 32]);
    params
        .argon2()?
        .hash_password_into(password, salt, key.as_mut())
        .map_err(|e| WalletError::Encryption(format!("argon2: {e}")))?;
    Ok(key)
}

/// Encrypt plaintext with a password.
///
/// Generates a random salt and nonce and returns
/// `salt || nonce || tag || ciphertext`.
pub fn encrypt(plaintext: &[u8], password: &[u8], params: &KdfParams) -> Result<Vec<u8>, WalletError> {
    use rand::RngCore;
    let mut salt = [0u8; SALT_LEN];
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);

    let key = derive_key(password, &salt, params)?;
    let cipher = Aes256Gcm::new_from_slice(key.as_ref())
        .map_err(|e| WalletError::Encryption(e.to_string()))?;

    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(&nonce_bytes), KEYSTORE_AAD, &mut buffer)
        .map_err(|e| WalletError::Encryption(e.to_string()))?;

    let mut result = Vec::with_capacity(MIN_ENCRYPTED_LEN + buffer.len());
    result.extend_from_slice(&salt);
    result.extend_from_slice(&nonce_bytes);
    result.extend_from_slice(tag.as_slice());
    result.extend_from_slice(&buffer);
    Ok(result)
}

/// Decrypt data produced by [`encrypt`].
///
/// Any authentication failure is reported as [`WalletError::IntegrityError`];
/// password correctness is checked separately by [`verify_password`].
pub fn decrypt(
    encrypted: &[u8],
    password: &[u8],
    params: &KdfParams,
) -> Result<Zeroizing<Vec<u8>>, WalletError> {
    if encrypted.len() < MIN_ENCRYPTED_LEN {
        return Err(WalletError::IntegrityError(format!(
            "encrypted data too short: {} < {MIN_ENCRYPTED_LEN}",
            encrypted.len()
        )));
    }

    let (salt, rest) = encrypted.split_at(SALT_LEN);
    let (nonce_bytes, rest) = rest.split_at(NONCE_LEN);
    let (tag, ciphertext) = rest.split_at(TAG_LEN);

    let key = derive_key(password, salt, params)?;
    let cipher = Aes256Gcm::new_from_slice(key.as_ref())
        .map_err(|e| WalletError::Encryption(e.to_string()))?;

    let mut buffer = Zeroizing::new(ciphertext.to_vec());
    cipher
        .decrypt_in_place_detached(
            Nonce::from_slice(nonce_bytes),
            KEYSTORE_AAD,
            buffer.as_mut_slice(),
            GenericArray::from_slice(tag),
        )
        .map_err(|_| WalletError::IntegrityError("authentication tag mismatch".into()))?;
    Ok(buffer)
}

/// Hash a password into a PHC string with a fresh random salt.
pub fn hash_password(password: &[u8], params: &KdfParams) -> Result<String, WalletError> {
    use rand::RngCore;
    let mut salt_bytes = [0u8; SALT_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt_bytes);
    let salt = SaltString::encode_b64(&salt_bytes)
        .map_err(|e| WalletError::Encryption(format!("salt: {e}")))?;
    let hash = params
        .argon2()?
        .hash_password(password, &salt)
        .map_err(|e| WalletError::Encryption(format!("password hash: {e}")))?;
    Ok(hash.to_string())
}

/// Check a password against a PHC string.
///
/// The comparison inside the verifier is constant time.
pub fn verify_password(password: &[u8], phc: &str) -> Result<(), WalletError> {
    let parsed = PasswordHash::new(phc)
        .map_err(|e| WalletError::IntegrityError(format!("password hash: {e}")))?;
    match Argon2::default().verify_password(password, &parsed) {
        Ok(()) => Ok(()),
        Err(argon2::password_hash::Error::Password) => Err(WalletError::BadPassword),
        Err(e) => Err(WalletError::IntegrityError(format!("password hash: {e}"))),
    }
}
