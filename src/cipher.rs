//! Raw AES block modes (ECB, CBC) over the `aes` block cipher.
//!
//! These carry no padding and no authentication: input must be a whole
//! number of AES blocks. They exist to validate the underlying cipher
//! against the published FIPS-197 / SP800-38A vectors (see
//! `crypto::self_test`); data at rest always goes through the AEAD in
//! `crypto`.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::{Aes128, Aes192, Aes256};

use crate::crypto::{CryptoError, AES_BLOCK_SIZE};

/// AES with a 128, 192 or 256-bit key
enum AesCipher {
    Aes128(Aes128),
    Aes192(Aes192),
    Aes256(Aes256),
}

impl AesCipher {
    fn new(key: &[u8]) -> Result<Self, CryptoError> {
        let invalid = |_| CryptoError::InvalidKeyLength(key.len());
        match key.len() {
            16 => Ok(Self::Aes128(Aes128::new_from_slice(key).map_err(invalid)?)),
            24 => Ok(Self::Aes192(Aes192::new_from_slice(key).map_err(invalid)?)),
            32 => Ok(Self::Aes256(Aes256::new_from_slice(key).map_err(invalid)?)),
            n => Err(CryptoError::InvalidKeyLength(n)),
        }
    }

    fn encrypt_block(&self, block: &mut [u8]) {
        let block = GenericArray::from_mut_slice(block);
        match self {
            Self::Aes128(c) => c.encrypt_block(block),
            Self::Aes192(c) => c.encrypt_block(block),
            Self::Aes256(c) => c.encrypt_block(block),
        }
    }

    fn decrypt_block(&self, block: &mut [u8]) {
        let block = GenericArray::from_mut_slice(block);
        match self {
            Self::Aes128(c) => c.decrypt_block(block),
            Self::Aes192(c) => c.decrypt_block(block),
            Self::Aes256(c) => c.decrypt_block(block),
        }
    }
}

fn check_blocks(data: &[u8]) -> Result<(), CryptoError> {
    if data.len() % AES_BLOCK_SIZE != 0 {
        return Err(CryptoError::InvalidLength(data.len()));
    }
    Ok(())
}

fn check_iv(iv: &[u8]) -> Result<(), CryptoError> {
    if iv.len() != AES_BLOCK_SIZE {
        return Err(CryptoError::InvalidLength(iv.len()));
    }
    Ok(())
}

pub fn ecb_encrypt(key: &[u8], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = AesCipher::new(key)?;
    check_blocks(data)?;
    let mut out = data.to_vec();
    for block in out.chunks_exact_mut(AES_BLOCK_SIZE) {
        cipher.encrypt_block(block);
    }
    Ok(out)
}

pub fn ecb_decrypt(key: &[u8], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = AesCipher::new(key)?;
    check_blocks(data)?;
    let mut out = data.to_vec();
    for block in out.chunks_exact_mut(AES_BLOCK_SIZE) {
        cipher.decrypt_block(block);
    }
    Ok(out)
}

pub fn cbc_encrypt(key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = AesCipher::new(key)?;
    check_iv(iv)?;
    check_blocks(data)?;

    let mut out = data.to_vec();
    let mut previous = [0u8; AES_BLOCK_SIZE];
    previous.copy_from_slice(iv);
    for block in out.chunks_exact_mut(AES_BLOCK_SIZE) {
        for (b, p) in block.iter_mut().zip(previous.iter()) {
            *b ^= p;
        }
        cipher.encrypt_block(block);
        previous.copy_from_slice(block);
    }
    Ok(out)
}

pub fn cbc_decrypt(key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = AesCipher::new(key)?;
    check_iv(iv)?;
    check_blocks(data)?;

    let mut out = data.to_vec();
    let mut previous = [0u8; AES_BLOCK_SIZE];
    previous.copy_from_slice(iv);
    for block in out.chunks_exact_mut(AES_BLOCK_SIZE) {
        let mut current = [0u8; AES_BLOCK_SIZE];
        current.copy_from_slice(block);
        cipher.decrypt_block(block);
        for (b, p) in block.iter_mut().zip(previous.iter()) {
            *b ^= p;
        }
        previous = current;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_partial_block() {
        let key = [0u8; 16];
        assert_eq!(
            ecb_encrypt(&key, &[0u8; 15]),
            Err(CryptoError::InvalidLength(15))
        );
    }

    #[test]
    fn test_rejects_bad_key_size() {
        assert_eq!(
            ecb_encrypt(&[0u8; 20], &[0u8; 16]),
            Err(CryptoError::InvalidKeyLength(20))
        );
    }

    #[test]
    fn test_rejects_bad_iv() {
        assert_eq!(
            cbc_encrypt(&[0u8; 16], &[0u8; 8], &[0u8; 16]),
            Err(CryptoError::InvalidLength(8))
        );
    }

    #[test]
    fn test_cbc_chains_blocks() {
        let key = [7u8; 32];
        let iv = [1u8; 16];
        let data = [0u8; 32];
        let ct = cbc_encrypt(&key, &iv, &data).unwrap();
        // Identical plaintext blocks must not produce identical ciphertext
        assert_ne!(ct[..16], ct[16..]);
        assert_eq!(cbc_decrypt(&key, &iv, &ct).unwrap(), data);
    }
}
