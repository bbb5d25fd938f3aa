//! sealpack-crypto: multi-recipient envelope encryption for files
//!
//! Architecture: one random data key per file, sealed once per recipient.
//!
//! Envelope layout:
//! ```text
//! magic "sealpack" | version | packet count
//!   ├── Header packet per recipient
//!   │   └── X25519(writer, recipient) → HKDF-SHA256 → ChaCha20-Poly1305(data key, chunk size)
//!   └── Body: ChaCha20-Poly1305 chunks under the data key
//!       (nonce = chunk index, AAD = final-chunk flag)
//! ```
//!
//! Private keys at rest are wrapped with XChaCha20-Poly1305 under an
//! Argon2id passphrase-derived key.

pub mod chunk;
pub mod container;
pub mod header;
pub mod kdf;
pub mod keyfile;
pub mod keys;
pub mod pipeline;

pub use chunk::{chunk_nonce, decrypt_chunk, encrypt_chunk, EncryptedChunk};
pub use container::{inspect_header, read_header, write_header, EnvelopeHeader, HeaderSummary};
pub use header::{find_session_secret, seal_for_recipient, unseal_as_recipient, HeaderPacket, SessionSecret};
pub use kdf::{derive_wrapping_key, KdfParams, WrappingKey};
pub use keyfile::{
    decode_private_key, decode_public_key, encode_private_key, encode_public_key,
    load_private_key, load_public_key, save_private_key, save_public_key, unwrap_private_key,
    wrap_private_key,
};
pub use keys::{generate_data_key, DataKey, KeyPair, PrivateKey, PublicKey};
pub use pipeline::{
    ByteRange, DecryptOptions, EncryptOptions, Pipeline, PipelineState, ProgressFn,
    ReencryptOptions,
};

/// Size of a symmetric key or X25519 key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of a ChaCha20-Poly1305 (IETF) nonce (96-bit)
pub const NONCE_SIZE: usize = 12;

/// Size of an XChaCha20-Poly1305 nonce (192-bit), used for key wrapping
pub const XNONCE_SIZE: usize = 24;

/// Size of a Poly1305 authentication tag
pub const TAG_SIZE: usize = 16;
