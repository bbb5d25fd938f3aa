//! Key derivation: Argon2id passphrase → private-key wrapping key
//!
//! Only private key files use this. The cost parameters are written into
//! each key file next to its salt, so loading a key re-derives with the
//! stored values, which are untrusted input and bounded by
//! [`KdfParams::check_stored`] before any work is done.

use argon2::{Algorithm, Argon2, Params, Version};
use secrecy::{ExposeSecret, SecretString};
use zeroize::Zeroize;

use sealpack_core::config::CryptoConfig;
use sealpack_core::{SealError, SealResult};

use crate::KEY_SIZE;

/// Size of the random salt stored next to a wrapped private key
pub const SALT_SIZE: usize = 16;

/// XChaCha20-Poly1305 key that seals a private scalar inside a key file.
/// Zeroized on drop.
pub struct WrappingKey {
    bytes: [u8; KEY_SIZE],
}

impl WrappingKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for WrappingKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for WrappingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WrappingKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Largest memory cost accepted from a key file (1 GiB)
pub const MAX_STORED_MEM_COST_KIB: u32 = 1024 * 1024;

/// Largest time cost accepted from a key file
pub const MAX_STORED_TIME_COST: u32 = 64;

/// Largest parallelism accepted from a key file
pub const MAX_STORED_PARALLELISM: u32 = 64;

/// Argon2id cost parameters. Taken from `[crypto]` when a key file is
/// written, read back from the file when it is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    /// Memory cost in KiB (default: 65536 = 64 MiB)
    pub mem_cost_kib: u32,
    /// Time cost / iterations (default: 3)
    pub time_cost: u32,
    /// Parallelism (default: 4)
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            mem_cost_kib: 65536,
            time_cost: 3,
            parallelism: 4,
        }
    }
}

impl KdfParams {
    /// Reject parameters read from a key file that would make unwrapping
    /// hang or allocate unbounded memory.
    pub fn check_stored(&self) -> SealResult<()> {
        if self.mem_cost_kib == 0 || self.mem_cost_kib > MAX_STORED_MEM_COST_KIB {
            return Err(SealError::KeyFormat(format!(
                "argon2id memory cost {} KiB out of range (max {MAX_STORED_MEM_COST_KIB})",
                self.mem_cost_kib
            )));
        }
        if self.time_cost == 0 || self.time_cost > MAX_STORED_TIME_COST {
            return Err(SealError::KeyFormat(format!(
                "argon2id time cost {} out of range (max {MAX_STORED_TIME_COST})",
                self.time_cost
            )));
        }
        if self.parallelism == 0 || self.parallelism > MAX_STORED_PARALLELISM {
            return Err(SealError::KeyFormat(format!(
                "argon2id parallelism {} out of range (max {MAX_STORED_PARALLELISM})",
                self.parallelism
            )));
        }
        Ok(())
    }
}

impl From<&CryptoConfig> for KdfParams {
    fn from(config: &CryptoConfig) -> Self {
        Self {
            mem_cost_kib: config.argon2_mem_cost_kib,
            time_cost: config.argon2_time_cost,
            parallelism: config.argon2_parallelism,
        }
    }
}

/// Derive a 256-bit wrapping key from a passphrase and salt using Argon2id.
///
/// The salt is random per key file and stored in the clear next to the
/// wrapped scalar. The parameters travel with it so a key file stays
/// readable after the defaults change.
pub fn derive_wrapping_key(
    passphrase: &SecretString,
    salt: &[u8; SALT_SIZE],
    params: &KdfParams,
) -> SealResult<WrappingKey> {
    let argon2_params = Params::new(
        params.mem_cost_kib,
        params.time_cost,
        params.parallelism,
        Some(KEY_SIZE),
    )
    .map_err(|e| SealError::KeyFormat(format!("invalid Argon2id params: {e}")))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params);

    let mut key = [0u8; KEY_SIZE];
    argon2
        .hash_password_into(passphrase.expose_secret().as_bytes(), salt, &mut key)
        .map_err(|e| SealError::KeyFormat(format!("Argon2id KDF failed: {e}")))?;

    Ok(WrappingKey::from_bytes(key))
}

#[cfg(test)]
pub(crate) fn test_params() -> KdfParams {
    KdfParams {
        mem_cost_kib: 1024,
        time_cost: 1,
        parallelism: 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kdf_deterministic() {
        let passphrase = SecretString::from("test-passphrase-123");
        let salt = [1u8; SALT_SIZE];

        let key1 = derive_wrapping_key(&passphrase, &salt, &test_params()).unwrap();
        let key2 = derive_wrapping_key(&passphrase, &salt, &test_params()).unwrap();

        assert_eq!(
            key1.as_bytes(),
            key2.as_bytes(),
            "KDF must be deterministic"
        );
    }

    #[test]
    fn test_kdf_different_passphrases() {
        let salt = [1u8; SALT_SIZE];

        let key1 = derive_wrapping_key(&SecretString::from("passphrase-a"), &salt, &test_params()).unwrap();
        let key2 = derive_wrapping_key(&SecretString::from("passphrase-b"), &salt, &test_params()).unwrap();

        assert_ne!(
            key1.as_bytes(),
            key2.as_bytes(),
            "different passphrases must produce different keys"
        );
    }

    #[test]
    fn test_kdf_different_salts() {
        let passphrase = SecretString::from("same-passphrase");

        let key1 = derive_wrapping_key(&passphrase, &[1u8; SALT_SIZE], &test_params()).unwrap();
        let key2 = derive_wrapping_key(&passphrase, &[2u8; SALT_SIZE], &test_params()).unwrap();

        assert_ne!(
            key1.as_bytes(),
            key2.as_bytes(),
            "different salts must produce different keys"
        );
    }

    #[test]
    fn test_kdf_rejects_invalid_params() {
        let params = KdfParams {
            mem_cost_kib: 1,
            time_cost: 0,
            parallelism: 0,
        };
        let result = derive_wrapping_key(&SecretString::from("x"), &[0u8; SALT_SIZE], &params);
        assert!(matches!(result, Err(SealError::KeyFormat(_))));
    }

    #[test]
    fn test_check_stored_bounds() {
        assert!(KdfParams::default().check_stored().is_ok());
        assert!(test_params().check_stored().is_ok());

        let hostile = [
            KdfParams { time_cost: u32::MAX, ..test_params() },
            KdfParams { mem_cost_kib: u32::MAX, ..test_params() },
            KdfParams { parallelism: 1000, ..test_params() },
            KdfParams { time_cost: 0, ..test_params() },
        ];
        for params in hostile {
            assert!(
                matches!(params.check_stored(), Err(SealError::KeyFormat(_))),
                "{params:?} must be rejected"
            );
        }
    }

    #[test]
    fn test_params_from_config() {
        let config = CryptoConfig {
            argon2_mem_cost_kib: 2048,
            argon2_time_cost: 2,
            argon2_parallelism: 1,
            ..CryptoConfig::default()
        };
        let params = KdfParams::from(&config);
        assert_eq!(params.mem_cost_kib, 2048);
        assert_eq!(params.time_cost, 2);
        assert_eq!(params.parallelism, 1);
    }
}
