//! Per-chunk ChaCha20-Poly1305 encryption/decryption
//!
//! Encrypted chunk format (binary):
//! ```text
//! [N bytes: ciphertext][16 bytes: Poly1305 tag]
//! nonce = chunk_index (8 bytes, little-endian) || 0x00000000
//! AAD   = 0x01 for the final chunk, 0x00 otherwise
//! ```
//!
//! The nonce is never stored: both sides derive it from the chunk position,
//! so reordering chunks breaks authentication. The final-chunk flag in the
//! AAD makes dropping trailing chunks detectable.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};

use sealpack_core::{SealError, SealResult};

use crate::keys::DataKey;
use crate::{NONCE_SIZE, TAG_SIZE};

/// One sealed chunk of the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedChunk {
    pub index: u64,
    /// Ciphertext followed by the 16-byte tag
    pub sealed: Vec<u8>,
}

impl EncryptedChunk {
    pub fn ciphertext(&self) -> &[u8] {
        &self.sealed[..self.sealed.len() - TAG_SIZE]
    }

    pub fn tag(&self) -> &[u8] {
        &self.sealed[self.sealed.len() - TAG_SIZE..]
    }

    pub fn plaintext_len(&self) -> usize {
        self.sealed.len() - TAG_SIZE
    }
}

/// Derive the nonce for a chunk position.
pub fn chunk_nonce(chunk_index: u64) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[..8].copy_from_slice(&chunk_index.to_le_bytes());
    nonce
}

fn build_aad(is_final: bool) -> [u8; 1] {
    [u8::from(is_final)]
}

/// Encrypt a single chunk.
///
/// - `data_key`: the per-file data key
/// - `chunk_index`: zero-based position of this chunk in the body
/// - `is_final`: whether this is the last chunk of the body
/// - `plaintext`: at most `chunk_size` bytes
pub fn encrypt_chunk(
    data_key: &DataKey,
    chunk_index: u64,
    is_final: bool,
    plaintext: &[u8],
) -> SealResult<EncryptedChunk> {
    let cipher = ChaCha20Poly1305::new(data_key.as_bytes().into());
    let nonce = chunk_nonce(chunk_index);

    let sealed = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad: &build_aad(is_final),
            },
        )
        .map_err(|e| SealError::Authentication(format!("chunk {chunk_index} encryption failed: {e}")))?;

    Ok(EncryptedChunk {
        index: chunk_index,
        sealed,
    })
}

/// Decrypt a single chunk.
///
/// `sealed` is `[ciphertext][16-byte tag]` as read from the body. Fails with
/// [`SealError::Authentication`] when the tag does not verify, including
/// when the chunk was moved, or its final flag does not match its position.
pub fn decrypt_chunk(
    data_key: &DataKey,
    chunk_index: u64,
    is_final: bool,
    sealed: &[u8],
) -> SealResult<Vec<u8>> {
    if sealed.len() < TAG_SIZE {
        return Err(SealError::Format(format!(
            "chunk {chunk_index} too short: {} bytes (minimum {TAG_SIZE})",
            sealed.len()
        )));
    }

    let cipher = ChaCha20Poly1305::new(data_key.as_bytes().into());
    let nonce = chunk_nonce(chunk_index);

    cipher
        .decrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: sealed,
                aad: &build_aad(is_final),
            },
        )
        .map_err(|_| {
            SealError::Authentication(format!(
                "chunk {chunk_index}: invalid key, corrupted data, reordered or truncated body"
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::generate_data_key;
    use std::collections::HashSet;

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = generate_data_key();
        let plaintext = b"hello, encrypted world!";

        let encrypted = encrypt_chunk(&key, 0, true, plaintext).unwrap();
        let decrypted = decrypt_chunk(&key, 0, true, &encrypted.sealed).unwrap();

        assert_eq!(&decrypted, plaintext);
    }

    #[test]
    fn test_encrypt_decrypt_empty() {
        let key = generate_data_key();

        let encrypted = encrypt_chunk(&key, 0, true, b"").unwrap();
        assert_eq!(encrypted.sealed.len(), TAG_SIZE);
        let decrypted = decrypt_chunk(&key, 0, true, &encrypted.sealed).unwrap();

        assert_eq!(decrypted, b"");
    }

    #[test]
    fn test_decrypt_wrong_key() {
        let key1 = generate_data_key();
        let key2 = generate_data_key();

        let encrypted = encrypt_chunk(&key1, 0, false, b"secret data").unwrap();
        let result = decrypt_chunk(&key2, 0, false, &encrypted.sealed);

        assert!(matches!(result, Err(SealError::Authentication(_))));
    }

    #[test]
    fn test_decrypt_wrong_chunk_index() {
        let key = generate_data_key();

        let encrypted = encrypt_chunk(&key, 0, false, b"secret data").unwrap();
        let result = decrypt_chunk(&key, 1, false, &encrypted.sealed);

        assert!(
            matches!(result, Err(SealError::Authentication(_))),
            "wrong chunk_index must fail (nonce mismatch)"
        );
    }

    #[test]
    fn test_decrypt_wrong_final_flag() {
        let key = generate_data_key();

        let encrypted = encrypt_chunk(&key, 3, false, b"middle chunk").unwrap();
        let result = decrypt_chunk(&key, 3, true, &encrypted.sealed);

        assert!(
            matches!(result, Err(SealError::Authentication(_))),
            "a non-final chunk presented as final must fail (AAD mismatch)"
        );
    }

    #[test]
    fn test_encrypted_size() {
        let key = generate_data_key();
        let plaintext = vec![0u8; 1000];

        let encrypted = encrypt_chunk(&key, 0, true, &plaintext).unwrap();

        // plaintext (1000) + tag (16) = 1016, nonce is not stored
        assert_eq!(encrypted.sealed.len(), 1000 + TAG_SIZE);
        assert_eq!(encrypted.ciphertext().len(), 1000);
        assert_eq!(encrypted.tag().len(), TAG_SIZE);
        assert_eq!(encrypted.plaintext_len(), 1000);
    }

    #[test]
    fn test_tampered_ciphertext() {
        let key = generate_data_key();

        let mut encrypted = encrypt_chunk(&key, 0, true, b"secret data").unwrap();
        encrypted.sealed[2] ^= 0x01;

        let result = decrypt_chunk(&key, 0, true, &encrypted.sealed);
        assert!(matches!(result, Err(SealError::Authentication(_))));
    }

    #[test]
    fn test_tampered_tag() {
        let key = generate_data_key();

        let mut encrypted = encrypt_chunk(&key, 0, true, b"secret data").unwrap();
        let last = encrypted.sealed.len() - 1;
        encrypted.sealed[last] ^= 0x80;

        let result = decrypt_chunk(&key, 0, true, &encrypted.sealed);
        assert!(matches!(result, Err(SealError::Authentication(_))));
    }

    #[test]
    fn test_short_input_is_format_error() {
        let key = generate_data_key();
        let result = decrypt_chunk(&key, 0, true, &[0u8; TAG_SIZE - 1]);
        assert!(matches!(result, Err(SealError::Format(_))));
    }

    #[test]
    fn test_nonces_unique_across_indices() {
        let nonces: HashSet<[u8; NONCE_SIZE]> = (0..10_000u64).map(chunk_nonce).collect();
        assert_eq!(nonces.len(), 10_000);
        assert_eq!(chunk_nonce(0), [0u8; NONCE_SIZE]);
        assert_ne!(chunk_nonce(u64::MAX), chunk_nonce(u64::MAX - 1));
    }
}
