//! Key files: armored public keys and (optionally passphrase-wrapped) private keys
//!
//! Public key file:
//! ```text
//! -----BEGIN CRYPT4GH PUBLIC KEY-----
//! <base64 of the 32-byte point>
//! -----END CRYPT4GH PUBLIC KEY-----
//! ```
//!
//! Private key file, armored as `CRYPT4GH ENCRYPTED PRIVATE KEY`, base64 of:
//! ```text
//! "c4gh-v1" | string kdf_name | [string kdf_options] | string cipher_name | string blob
//! string      = u16 BE length || bytes
//! kdf_name    = "none" | "argon2id"
//! kdf_options = mem_cost_kib u32 BE || time_cost u32 BE || parallelism u32 BE || salt[16]
//! cipher_name = "none" | "xchacha20_poly1305"
//! blob        = scalar[32]  |  nonce[24] || XChaCha20-Poly1305(wrapping_key, scalar)
//! ```
//!
//! A trailing comment string is tolerated on read and never written.

use std::io::Write;
use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use pem::{EncodeConfig, LineEnding, Pem};
use rand::rngs::OsRng;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use zeroize::{Zeroize, Zeroizing};

use sealpack_core::{SealError, SealResult};

use crate::kdf::{derive_wrapping_key, KdfParams, SALT_SIZE};
use crate::keys::{PrivateKey, PublicKey};
use crate::{KEY_SIZE, TAG_SIZE, XNONCE_SIZE};

const PUBLIC_KEY_LABEL: &str = "CRYPT4GH PUBLIC KEY";
const PRIVATE_KEY_LABEL: &str = "CRYPT4GH ENCRYPTED PRIVATE KEY";
const PRIVATE_KEY_LABEL_PLAIN: &str = "CRYPT4GH PRIVATE KEY";

const PRIVATE_KEY_MAGIC: &[u8] = b"c4gh-v1";

const KDF_NONE: &str = "none";
const KDF_ARGON2ID: &str = "argon2id";
const CIPHER_NONE: &str = "none";
const CIPHER_XCHACHA20_POLY1305: &str = "xchacha20_poly1305";

const KDF_OPTIONS_LEN: usize = 12 + SALT_SIZE;
const WRAPPED_BLOB_LEN: usize = XNONCE_SIZE + KEY_SIZE + TAG_SIZE;

// ── Public keys ───────────────────────────────────────────────────────────────

pub fn encode_public_key(key: &PublicKey) -> String {
    armor(PUBLIC_KEY_LABEL, key.as_bytes().to_vec())
}

/// Parse an armored public key, or a single bare base64 line.
pub fn decode_public_key(text: &str) -> SealResult<PublicKey> {
    let trimmed = text.trim();
    let bytes = if trimmed.starts_with("-----BEGIN ") {
        dearmor(trimmed, &[PUBLIC_KEY_LABEL])?.to_vec()
    } else {
        STANDARD
            .decode(trimmed)
            .map_err(|e| SealError::KeyFormat(format!("public key is not valid base64: {e}")))?
    };

    let array: [u8; KEY_SIZE] = bytes.as_slice().try_into().map_err(|_| {
        SealError::KeyFormat(format!(
            "public key has wrong size: {} bytes (expected {KEY_SIZE})",
            bytes.len()
        ))
    })?;
    Ok(PublicKey::from_bytes(array))
}

pub fn load_public_key(path: &Path) -> SealResult<PublicKey> {
    let text = read_key_file(path)?;
    decode_public_key(&text).map_err(|e| with_path(e, path))
}

pub fn save_public_key(path: &Path, key: &PublicKey) -> SealResult<()> {
    write_key_file(path, encode_public_key(key).as_bytes(), false)
}

// ── Private keys ──────────────────────────────────────────────────────────────

/// Serialize a private key into the binary container, wrapping the scalar
/// when a non-empty passphrase is given.
pub fn wrap_private_key(
    key: &PrivateKey,
    passphrase: Option<&SecretString>,
    params: &KdfParams,
) -> SealResult<Vec<u8>> {
    let passphrase = passphrase.filter(|p| !p.expose_secret().is_empty());
    let scalar = Zeroizing::new(key.to_bytes());

    let mut out = Vec::with_capacity(PRIVATE_KEY_MAGIC.len() + 128);
    out.extend_from_slice(PRIVATE_KEY_MAGIC);

    match passphrase {
        None => {
            write_string(&mut out, KDF_NONE.as_bytes());
            write_string(&mut out, CIPHER_NONE.as_bytes());
            write_string(&mut out, scalar.as_slice());
        }
        Some(passphrase) => {
            params.check_stored()?;
            let mut salt = [0u8; SALT_SIZE];
            OsRng.fill_bytes(&mut salt);
            let wrapping_key = derive_wrapping_key(passphrase, &salt, params)?;

            let mut nonce = [0u8; XNONCE_SIZE];
            OsRng.fill_bytes(&mut nonce);
            let cipher = XChaCha20Poly1305::new(wrapping_key.as_bytes().into());
            let ciphertext = cipher
                .encrypt(XNonce::from_slice(&nonce), scalar.as_slice())
                .map_err(|e| SealError::KeyFormat(format!("private key wrapping failed: {e}")))?;

            let mut options = Vec::with_capacity(KDF_OPTIONS_LEN);
            options.extend_from_slice(&params.mem_cost_kib.to_be_bytes());
            options.extend_from_slice(&params.time_cost.to_be_bytes());
            options.extend_from_slice(&params.parallelism.to_be_bytes());
            options.extend_from_slice(&salt);

            let mut blob = Vec::with_capacity(WRAPPED_BLOB_LEN);
            blob.extend_from_slice(&nonce);
            blob.extend_from_slice(&ciphertext);

            write_string(&mut out, KDF_ARGON2ID.as_bytes());
            write_string(&mut out, &options);
            write_string(&mut out, CIPHER_XCHACHA20_POLY1305.as_bytes());
            write_string(&mut out, &blob);
        }
    }

    Ok(out)
}

/// Parse the binary container and recover the private key.
///
/// `passphrase` is only invoked for wrapped keys, and at most once.
pub fn unwrap_private_key<F>(bytes: &[u8], passphrase: F) -> SealResult<PrivateKey>
where
    F: FnOnce() -> Option<SecretString>,
{
    let mut reader = Fields::new(bytes);
    if reader.take(PRIVATE_KEY_MAGIC.len())? != PRIVATE_KEY_MAGIC {
        return Err(SealError::KeyFormat("not a c4gh-v1 private key".into()));
    }

    let kdf_name = reader.string_utf8("kdf name")?;
    match kdf_name.as_str() {
        KDF_NONE => {
            let cipher_name = reader.string_utf8("cipher name")?;
            if cipher_name != CIPHER_NONE {
                return Err(SealError::KeyFormat(format!(
                    "unencrypted key with unexpected cipher {cipher_name:?}"
                )));
            }
            let blob = reader.string("key blob")?;
            let scalar: [u8; KEY_SIZE] = blob.try_into().map_err(|_| {
                SealError::KeyFormat(format!(
                    "private key has wrong size: {} bytes (expected {KEY_SIZE})",
                    blob.len()
                ))
            })?;
            Ok(PrivateKey::from_bytes(scalar))
        }
        KDF_ARGON2ID => {
            let options = reader.string("kdf options")?;
            if options.len() != KDF_OPTIONS_LEN {
                return Err(SealError::KeyFormat(format!(
                    "argon2id options have wrong size: {} bytes",
                    options.len()
                )));
            }
            let params = KdfParams {
                mem_cost_kib: be_u32(&options[0..4]),
                time_cost: be_u32(&options[4..8]),
                parallelism: be_u32(&options[8..12]),
            };
            params.check_stored()?;
            let mut salt = [0u8; SALT_SIZE];
            salt.copy_from_slice(&options[12..]);

            let cipher_name = reader.string_utf8("cipher name")?;
            if cipher_name != CIPHER_XCHACHA20_POLY1305 {
                return Err(SealError::KeyFormat(format!(
                    "unsupported private key cipher {cipher_name:?}"
                )));
            }
            let blob = reader.string("key blob")?;
            if blob.len() != WRAPPED_BLOB_LEN {
                return Err(SealError::KeyFormat(format!(
                    "wrapped private key has wrong size: {} bytes (expected {WRAPPED_BLOB_LEN})",
                    blob.len()
                )));
            }

            let passphrase = passphrase().ok_or_else(|| {
                SealError::Configuration(
                    "private key is passphrase-protected but no passphrase was provided".into(),
                )
            })?;
            let wrapping_key = derive_wrapping_key(&passphrase, &salt, &params)?;
            drop(passphrase);

            let (nonce, ciphertext) = blob.split_at(XNONCE_SIZE);
            let cipher = XChaCha20Poly1305::new(wrapping_key.as_bytes().into());
            let mut plaintext = cipher
                .decrypt(XNonce::from_slice(nonce), ciphertext)
                .map_err(|_| {
                    SealError::Authentication(
                        "private key unwrapping failed: wrong passphrase or corrupted key file".into(),
                    )
                })?;

            if plaintext.len() != KEY_SIZE {
                plaintext.zeroize();
                return Err(SealError::KeyFormat(format!(
                    "unwrapped key has wrong size (expected {KEY_SIZE})"
                )));
            }
            let mut scalar = [0u8; KEY_SIZE];
            scalar.copy_from_slice(&plaintext);
            plaintext.zeroize();

            Ok(PrivateKey::from_bytes(scalar))
        }
        other => Err(SealError::KeyFormat(format!(
            "unsupported private key KDF {other:?} (supported: none, argon2id)"
        ))),
    }
}

pub fn encode_private_key(
    key: &PrivateKey,
    passphrase: Option<&SecretString>,
    params: &KdfParams,
) -> SealResult<String> {
    Ok(armor(PRIVATE_KEY_LABEL, wrap_private_key(key, passphrase, params)?))
}

pub fn decode_private_key<F>(text: &str, passphrase: F) -> SealResult<PrivateKey>
where
    F: FnOnce() -> Option<SecretString>,
{
    let blob = dearmor(text.trim(), &[PRIVATE_KEY_LABEL, PRIVATE_KEY_LABEL_PLAIN])?;
    unwrap_private_key(&blob, passphrase)
}

pub fn load_private_key<F>(path: &Path, passphrase: F) -> SealResult<PrivateKey>
where
    F: FnOnce() -> Option<SecretString>,
{
    let text = Zeroizing::new(read_key_file(path)?);
    decode_private_key(&text, passphrase).map_err(|e| with_path(e, path))
}

/// Write a private key file (mode 0600 on Unix). Never overwrites.
pub fn save_private_key(
    path: &Path,
    key: &PrivateKey,
    passphrase: Option<&SecretString>,
    params: &KdfParams,
) -> SealResult<()> {
    let text = Zeroizing::new(encode_private_key(key, passphrase, params)?);
    write_key_file(path, text.as_bytes(), true)
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// PEM-armor `contents`; the buffer is scrubbed once encoded.
fn armor(label: &str, contents: Vec<u8>) -> String {
    let pem = Pem::new(label, contents);
    let text = pem::encode_config(&pem, EncodeConfig::new().set_line_ending(LineEnding::LF));
    pem.into_contents().zeroize();
    text
}

fn dearmor(text: &str, labels: &[&str]) -> SealResult<Zeroizing<Vec<u8>>> {
    let pem = pem::parse(text)
        .map_err(|e| SealError::KeyFormat(format!("key file is not valid PEM: {e}")))?;
    let tag = pem.tag().to_owned();
    let contents = Zeroizing::new(pem.into_contents());
    if !labels.contains(&tag.as_str()) {
        return Err(SealError::KeyFormat(format!("unexpected key armor: {tag}")));
    }
    Ok(contents)
}

fn write_string(out: &mut Vec<u8>, bytes: &[u8]) {
    // Every field written here is far below u16::MAX.
    out.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    out.extend_from_slice(bytes);
}

fn be_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    u32::from_be_bytes(buf)
}

/// Cursor over the length-prefixed fields of a private key container.
struct Fields<'a> {
    bytes: &'a [u8],
}

impl<'a> Fields<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    fn take(&mut self, n: usize) -> SealResult<&'a [u8]> {
        if self.bytes.len() < n {
            return Err(SealError::KeyFormat("private key container is truncated".into()));
        }
        let (head, tail) = self.bytes.split_at(n);
        self.bytes = tail;
        Ok(head)
    }

    fn string(&mut self, what: &str) -> SealResult<&'a [u8]> {
        let len = self
            .take(2)
            .map_err(|_| SealError::KeyFormat(format!("private key truncated before {what}")))?;
        let len = u16::from_be_bytes([len[0], len[1]]) as usize;
        self.take(len)
            .map_err(|_| SealError::KeyFormat(format!("private key truncated inside {what}")))
    }

    fn string_utf8(&mut self, what: &str) -> SealResult<String> {
        let raw = self.string(what)?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| SealError::KeyFormat(format!("{what} is not UTF-8")))
    }
}

fn read_key_file(path: &Path) -> SealResult<String> {
    match std::fs::read(path) {
        Ok(bytes) => String::from_utf8(bytes)
            .map_err(|_| SealError::KeyFormat(format!("{}: key file is not text", path.display()))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(SealError::Configuration(
            format!("key file not found: {}", path.display()),
        )),
        Err(e) => Err(SealError::Io(e)),
    }
}

fn write_key_file(path: &Path, contents: &[u8], private: bool) -> SealResult<()> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(if private { 0o600 } else { 0o644 });
    }
    #[cfg(not(unix))]
    let _ = private;

    let mut file = options.open(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::AlreadyExists {
            SealError::Configuration(format!("refusing to overwrite {}", path.display()))
        } else {
            SealError::Io(e)
        }
    })?;
    file.write_all(contents)?;
    file.sync_all()?;
    tracing::debug!(path = %path.display(), private, "key file written");
    Ok(())
}

fn with_path(e: SealError, path: &Path) -> SealError {
    match e {
        SealError::KeyFormat(msg) => SealError::KeyFormat(format!("{}: {msg}", path.display())),
        other => other,
    }
}
