//! Cryptographic primitives behind the storage and protocol layers.
//!
//! - AES-256-GCM-SIV for authenticated encryption, laid out as
//!   `nonce(12) ‖ ciphertext ‖ tag(16)`
//! - SHA-256 for hashing
//! - HKDF-SHA256 for session-key derivation
//! - OS randomness via `rand`
//!
//! # Security Properties
//!
//! - **Zeroize on drop**: `MasterKey` and `SessionKey` implement
//!   `ZeroizeOnDrop` to securely clear key material from memory
//! - **Stable overhead**: `encrypted_length(n)` is always `n + ENCRYPTION_OVERHEAD`,
//!   so callers can size blocks before encrypting
//! - **Distinguishable failures**: a malformed ciphertext reports
//!   `CouldNotDecrypt`, a failed tag check reports `CouldNotVerify`

use aes_gcm_siv::aead::{Aead, KeyInit};
use aes_gcm_siv::{Aes256GcmSiv, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::cipher;

/// Error types for crypto operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    #[error("Could not decrypt")]
    CouldNotDecrypt,
    #[error("Could not verify")]
    CouldNotVerify,
    #[error("Encryption failed")]
    EncryptionFailed,
    #[error("Invalid key length {0}")]
    InvalidKeyLength(usize),
    #[error("Invalid data length {0}")]
    InvalidLength(usize),
    #[error("Key service not ready")]
    KeyServiceNotReady,
}

// ============================================================
// CONSTANTS
// ============================================================

/// Symmetric key size (AES-256)
pub const KEY_SIZE: usize = 32;

/// AEAD nonce size, stored in front of every ciphertext
pub const NONCE_SIZE: usize = 12;

/// AEAD authentication tag size, stored after every ciphertext
pub const TAG_SIZE: usize = 16;

/// Bytes added by `encrypt_with_key`
pub const ENCRYPTION_OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;

/// AES block size
pub const AES_BLOCK_SIZE: usize = 16;

/// SHA-256 digest size
pub const HASH_SIZE: usize = 32;

const SESSION_KDF_INFO: &[u8] = b"sms-vault-session-v1";

// ============================================================
// KEY TYPES
// ============================================================

/// Long-term key protecting everything at rest.
/// Automatically zeroized on drop
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey([u8; KEY_SIZE]);

impl MasterKey {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let key: [u8; KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength(bytes.len()))?;
        Ok(Self(key))
    }

    /// Fresh random key
    #[must_use]
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_SIZE];
        rand::rng().fill_bytes(&mut key);
        Self(key)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey(..)")
    }
}

/// Per-conversation symmetric key agreed through the key exchange
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; KEY_SIZE]);

impl SessionKey {
    #[must_use]
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

// ============================================================
// PRIMITIVES
// ============================================================

/// `n` bytes from the OS RNG
#[must_use]
pub fn random_bytes(n: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; n];
    rand::rng().fill_bytes(&mut bytes);
    bytes
}

/// SHA-256 digest
#[must_use]
pub fn hash(data: &[u8]) -> [u8; HASH_SIZE] {
    Sha256::digest(data).into()
}

/// Length of the ciphertext produced for `n` bytes of plaintext
#[must_use]
pub const fn encrypted_length(n: usize) -> usize {
    n + ENCRYPTION_OVERHEAD
}

/// `n` rounded up to a whole number of AES blocks
#[must_use]
pub const fn aligned_length(n: usize) -> usize {
    n.div_ceil(AES_BLOCK_SIZE) * AES_BLOCK_SIZE
}

/// Authenticated encryption under `key` with a fresh random nonce
pub fn encrypt_with_key(plaintext: &[u8], key: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher =
        Aes256GcmSiv::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength(key.len()))?;

    let mut nonce = [0u8; NONCE_SIZE];
    rand::rng().fill_bytes(&mut nonce);

    let sealed = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut out = Vec::with_capacity(encrypted_length(plaintext.len()));
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Reverse of `encrypt_with_key`
pub fn decrypt_with_key(ciphertext: &[u8], key: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < ENCRYPTION_OVERHEAD {
        return Err(CryptoError::CouldNotDecrypt);
    }
    let cipher =
        Aes256GcmSiv::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength(key.len()))?;

    let (nonce, sealed) = ciphertext.split_at(NONCE_SIZE);
    cipher
        .decrypt(Nonce::from_slice(nonce), sealed)
        .map_err(|_| CryptoError::CouldNotVerify)
}

/// Derive a session key from a Diffie-Hellman secret, bound to both
/// public keys (order-independent)
pub fn derive_session_key(
    shared_secret: &[u8],
    public_a: &[u8; 32],
    public_b: &[u8; 32],
) -> Result<SessionKey, CryptoError> {
    let (first, second) = if public_a <= public_b {
        (public_a, public_b)
    } else {
        (public_b, public_a)
    };
    let mut info = Vec::with_capacity(SESSION_KDF_INFO.len() + 64);
    info.extend_from_slice(SESSION_KDF_INFO);
    info.extend_from_slice(first);
    info.extend_from_slice(second);

    let hk = Hkdf::<Sha256>::new(None, shared_secret);
    let mut okm = [0u8; KEY_SIZE];
    hk.expand(&info, &mut okm)
        .map_err(|_| CryptoError::InvalidLength(KEY_SIZE))?;
    Ok(SessionKey(okm))
}

/// Known-answer and round-trip checks of the primitives
#[must_use]
pub fn self_test() -> bool {
    // FIPS-197 / SP800-38A F.1.1
    const KEY: [u8; 16] = [
        0x2b, 0x7e, 0x15, 0x16, 0x28, 0xae, 0xd2, 0xa6, 0xab, 0xf7, 0x15, 0x88, 0x09, 0xcf, 0x4f, 0x3c,
    ];
    const PLAIN: [u8; 16] = [
        0x6b, 0xc1, 0xbe, 0xe2, 0x2e, 0x40, 0x9f, 0x96, 0xe9, 0x3d, 0x7e, 0x11, 0x73, 0x93, 0x17, 0x2a,
    ];
    const ECB: [u8; 16] = [
        0x3a, 0xd7, 0x7b, 0xb4, 0x0d, 0x7a, 0x36, 0x60, 0xa8, 0x9e, 0xca, 0xf3, 0x24, 0x66, 0xef, 0x97,
    ];

    match cipher::ecb_encrypt(&KEY, &PLAIN) {
        Ok(ct) if ct == ECB => {}
        _ => return false,
    }

    let key = random_bytes(KEY_SIZE);
    let data = random_bytes(100);
    let Ok(mut sealed) = encrypt_with_key(&data, &key) else {
        return false;
    };
    if sealed.len() != encrypted_length(data.len()) {
        return false;
    }
    match decrypt_with_key(&sealed, &key) {
        Ok(plain) if plain == data => {}
        _ => return false,
    }
    let last = sealed.len() - 1;
    sealed[last] ^= 1;
    decrypt_with_key(&sealed, &key) == Err(CryptoError::CouldNotVerify)
}

// ============================================================
// TESTS
// ============================================================
