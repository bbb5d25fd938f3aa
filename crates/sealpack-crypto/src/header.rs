//! Header packets: the per-file session secret sealed for each recipient
//!
//! Sealing (writer side):
//! ```text
//! shared  = X25519(writer_secret, recipient_pk)
//! key     = HKDF-SHA256(ikm = shared, info = label || recipient_pk || writer_pk)
//! packet  = writer_pk || nonce(12, random) || ChaCha20-Poly1305(key, nonce, payload)
//! payload = packet_type u32 LE (0) || data_method u32 LE (0) || data_key[32] || chunk_size u32 LE
//! ```
//!
//! Without a sender key the writer secret is a fresh ephemeral key per
//! recipient. Binding both public keys into the KDF input ties the derived
//! key to this exact (writer, recipient) pair.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, SharedSecret};
use zeroize::Zeroizing;

use sealpack_core::config::MAX_CHUNK_SIZE;
use sealpack_core::{SealError, SealResult};

use crate::keys::{DataKey, PrivateKey, PublicKey};
use crate::{KEY_SIZE, NONCE_SIZE, TAG_SIZE};

/// HKDF info prefix for header packet keys
const HEADER_KDF_LABEL: &[u8] = b"sealpack-v1 header x25519-chacha20poly1305";

/// Packet type for data encryption parameters
const PACKET_TYPE_DATA_ENC: u32 = 0;

/// Body cipher identifier: ChaCha20-Poly1305 (IETF)
const DATA_METHOD_CHACHA20_POLY1305: u32 = 0;

/// Plaintext payload size: type + method + key + chunk size
pub const PAYLOAD_SIZE: usize = 4 + 4 + KEY_SIZE + 4;

/// Sealed payload size on the wire (payload + tag)
pub const SEALED_PAYLOAD_SIZE: usize = PAYLOAD_SIZE + TAG_SIZE;

/// How a header packet was sealed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketMethod {
    /// X25519 key agreement + ChaCha20-Poly1305
    X25519ChaCha20Poly1305,
}

impl PacketMethod {
    pub fn code(self) -> u32 {
        match self {
            PacketMethod::X25519ChaCha20Poly1305 => 0,
        }
    }

    pub fn from_code(code: u32) -> SealResult<Self> {
        match code {
            0 => Ok(PacketMethod::X25519ChaCha20Poly1305),
            other => Err(SealError::Format(format!(
                "unsupported header packet method: {other}"
            ))),
        }
    }
}

/// The secret shared by every header packet of one envelope.
#[derive(Debug, Clone)]
pub struct SessionSecret {
    pub data_key: DataKey,
    pub chunk_size: u32,
}

impl SessionSecret {
    pub fn new(data_key: DataKey, chunk_size: u32) -> Self {
        Self {
            data_key,
            chunk_size,
        }
    }

    fn to_payload(&self) -> Zeroizing<Vec<u8>> {
        let mut payload = Zeroizing::new(Vec::with_capacity(PAYLOAD_SIZE));
        payload.extend_from_slice(&PACKET_TYPE_DATA_ENC.to_le_bytes());
        payload.extend_from_slice(&DATA_METHOD_CHACHA20_POLY1305.to_le_bytes());
        payload.extend_from_slice(self.data_key.as_bytes());
        payload.extend_from_slice(&self.chunk_size.to_le_bytes());
        payload
    }

    fn from_payload(payload: &[u8]) -> SealResult<Self> {
        if payload.len() != PAYLOAD_SIZE {
            return Err(SealError::Format(format!(
                "header payload has wrong size: {} bytes (expected {PAYLOAD_SIZE})",
                payload.len()
            )));
        }

        let packet_type = read_u32_le(&payload[0..4]);
        if packet_type != PACKET_TYPE_DATA_ENC {
            return Err(SealError::Format(format!(
                "unsupported header packet type: {packet_type}"
            )));
        }
        let method = read_u32_le(&payload[4..8]);
        if method != DATA_METHOD_CHACHA20_POLY1305 {
            return Err(SealError::Format(format!(
                "unsupported body encryption method: {method}"
            )));
        }
        let chunk_size = read_u32_le(&payload[8 + KEY_SIZE..]);
        if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
            return Err(SealError::Format(format!(
                "implausible chunk size in header: {chunk_size}"
            )));
        }

        let mut key_bytes = [0u8; KEY_SIZE];
        key_bytes.copy_from_slice(&payload[8..8 + KEY_SIZE]);

        Ok(Self {
            data_key: DataKey::from_bytes(key_bytes),
            chunk_size,
        })
    }
}

/// One recipient's sealed copy of the [`SessionSecret`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderPacket {
    pub method: PacketMethod,
    /// Ephemeral public key (anonymous mode) or the sender's public key
    pub writer_public_key: PublicKey,
    pub nonce: [u8; NONCE_SIZE],
    /// Encrypted payload followed by the 16-byte tag
    pub sealed_payload: Vec<u8>,
}

/// Seal the session secret for one recipient.
///
/// With `sender = None` a fresh ephemeral key pair is generated for this
/// packet and its secret half is dropped when the function returns.
pub fn seal_for_recipient(
    recipient: &PublicKey,
    sender: Option<&PrivateKey>,
    secret: &SessionSecret,
) -> SealResult<HeaderPacket> {
    let (writer_public_key, shared) = match sender {
        Some(sender) => (sender.public_key(), sender.diffie_hellman(recipient)),
        None => {
            let ephemeral = EphemeralSecret::random_from_rng(OsRng);
            let public = PublicKey::from(x25519_dalek::PublicKey::from(&ephemeral));
            (public, ephemeral.diffie_hellman(recipient.as_dalek()))
        }
    };

    if !shared.was_contributory() {
        return Err(SealError::KeyFormat(format!(
            "recipient public key {recipient} is a low-order point"
        )));
    }

    let key = derive_packet_key(&shared, recipient, &writer_public_key)?;
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_slice()));

    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);

    let payload = secret.to_payload();
    let sealed_payload = cipher
        .encrypt(Nonce::from_slice(&nonce), payload.as_slice())
        .map_err(|e| SealError::Authentication(format!("header packet sealing failed: {e}")))?;

    Ok(HeaderPacket {
        method: PacketMethod::X25519ChaCha20Poly1305,
        writer_public_key,
        nonce,
        sealed_payload,
    })
}

/// Open a header packet with the recipient's private key.
///
/// Fails with [`SealError::Authentication`] when the packet was sealed for
/// someone else or has been tampered with.
pub fn unseal_as_recipient(
    private_key: &PrivateKey,
    packet: &HeaderPacket,
) -> SealResult<SessionSecret> {
    let shared = private_key.diffie_hellman(&packet.writer_public_key);
    if !shared.was_contributory() {
        return Err(SealError::Authentication(
            "header packet writer key is a low-order point".into(),
        ));
    }

    let key = derive_packet_key(&shared, &private_key.public_key(), &packet.writer_public_key)?;
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_slice()));

    let payload = Zeroizing::new(
        cipher
            .decrypt(Nonce::from_slice(&packet.nonce), packet.sealed_payload.as_slice())
            .map_err(|_| {
                SealError::Authentication(
                    "header packet: not sealed for this key, or corrupted".into(),
                )
            })?,
    );

    SessionSecret::from_payload(&payload)
}

/// Try every packet in order until one opens with `private_key`.
///
/// A tag failure means "not for me" and the search continues; running out
/// of packets is [`SealError::NoMatchingRecipient`]. When `expected_sender`
/// is given, packets written by any other key are skipped, which turns the
/// header into a sender-authenticated one.
pub fn find_session_secret(
    private_key: &PrivateKey,
    packets: &[HeaderPacket],
    expected_sender: Option<&PublicKey>,
) -> SealResult<SessionSecret> {
    for (index, packet) in packets.iter().enumerate() {
        if let Some(sender) = expected_sender {
            if packet.writer_public_key != *sender {
                tracing::trace!(packet = index, "skipping packet from another writer");
                continue;
            }
        }
        match unseal_as_recipient(private_key, packet) {
            Ok(secret) => {
                tracing::debug!(packet = index, chunk_size = secret.chunk_size, "header packet unlocked");
                return Ok(secret);
            }
            Err(SealError::Authentication(_)) => {
                tracing::trace!(packet = index, "header packet not for this key");
            }
            Err(e) => return Err(e),
        }
    }
    Err(SealError::NoMatchingRecipient)
}

fn derive_packet_key(
    shared: &SharedSecret,
    recipient: &PublicKey,
    writer: &PublicKey,
) -> SealResult<Zeroizing<[u8; KEY_SIZE]>> {
    let mut info = Vec::with_capacity(HEADER_KDF_LABEL.len() + 2 * KEY_SIZE);
    info.extend_from_slice(HEADER_KDF_LABEL);
    info.extend_from_slice(recipient.as_bytes());
    info.extend_from_slice(writer.as_bytes());

    let hkdf = Hkdf::<Sha256>::new(None, shared.as_bytes());
    let mut okm = Zeroizing::new([0u8; KEY_SIZE]);
    hkdf.expand(&info, &mut okm[..])
        .map_err(|e| SealError::Authentication(format!("HKDF expand failed: {e}")))?;
    Ok(okm)
}

fn read_u32_le(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{generate_data_key, KeyPair};

    fn test_secret() -> SessionSecret {
        SessionSecret::new(generate_data_key(), 65536)
    }

    #[test]
    fn test_seal_unseal_anonymous() {
        let recipient = KeyPair::generate();
        let secret = test_secret();

        let packet = seal_for_recipient(&recipient.public, None, &secret).unwrap();
        let opened = unseal_as_recipient(&recipient.private, &packet).unwrap();

        assert_eq!(opened.data_key.as_bytes(), secret.data_key.as_bytes());
        assert_eq!(opened.chunk_size, 65536);
        assert_eq!(packet.sealed_payload.len(), SEALED_PAYLOAD_SIZE);
    }

    #[test]
    fn test_anonymous_packets_use_fresh_ephemeral_keys() {
        let recipient = KeyPair::generate();
        let secret = test_secret();

        let p1 = seal_for_recipient(&recipient.public, None, &secret).unwrap();
        let p2 = seal_for_recipient(&recipient.public, None, &secret).unwrap();

        assert_ne!(p1.writer_public_key, p2.writer_public_key);
        assert_ne!(p1.writer_public_key, recipient.public);
    }

    #[test]
    fn test_seal_with_sender_embeds_sender_key() {
        let sender = KeyPair::generate();
        let recipient = KeyPair::generate();
        let secret = test_secret();

        let packet = seal_for_recipient(&recipient.public, Some(&sender.private), &secret).unwrap();
        assert_eq!(packet.writer_public_key, sender.public);

        let opened = unseal_as_recipient(&recipient.private, &packet).unwrap();
        assert_eq!(opened.data_key.as_bytes(), secret.data_key.as_bytes());
    }

    #[test]
    fn test_unseal_wrong_recipient() {
        let recipient = KeyPair::generate();
        let stranger = KeyPair::generate();

        let packet = seal_for_recipient(&recipient.public, None, &test_secret()).unwrap();
        let result = unseal_as_recipient(&stranger.private, &packet);

        assert!(matches!(result, Err(SealError::Authentication(_))));
    }

    #[test]
    fn test_unseal_tampered_tag() {
        let recipient = KeyPair::generate();
        let mut packet = seal_for_recipient(&recipient.public, None, &test_secret()).unwrap();
        let last = packet.sealed_payload.len() - 1;
        packet.sealed_payload[last] ^= 0x01;

        let result = unseal_as_recipient(&recipient.private, &packet);
        assert!(matches!(result, Err(SealError::Authentication(_))));
    }

    #[test]
    fn test_unseal_swapped_writer_key() {
        let recipient = KeyPair::generate();
        let mut packet = seal_for_recipient(&recipient.public, None, &test_secret()).unwrap();
        packet.writer_public_key = KeyPair::generate().public;

        let result = unseal_as_recipient(&recipient.private, &packet);
        assert!(matches!(result, Err(SealError::Authentication(_))));
    }

    #[test]
    fn test_seal_rejects_low_order_recipient() {
        let identity_point = PublicKey::from_bytes([0u8; KEY_SIZE]);
        let result = seal_for_recipient(&identity_point, None, &test_secret());
        assert!(matches!(result, Err(SealError::KeyFormat(_))));
    }

    #[test]
    fn test_find_skips_foreign_packets() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let secret = test_secret();

        let packets = vec![
            seal_for_recipient(&alice.public, None, &secret).unwrap(),
            seal_for_recipient(&bob.public, None, &secret).unwrap(),
        ];

        let for_bob = find_session_secret(&bob.private, &packets, None).unwrap();
        let for_alice = find_session_secret(&alice.private, &packets, None).unwrap();
        assert_eq!(for_bob.data_key.as_bytes(), secret.data_key.as_bytes());
        assert_eq!(for_alice.data_key.as_bytes(), secret.data_key.as_bytes());
    }

    #[test]
    fn test_find_no_matching_recipient() {
        let alice = KeyPair::generate();
        let mallory = KeyPair::generate();
        let packets = vec![seal_for_recipient(&alice.public, None, &test_secret()).unwrap()];

        let result = find_session_secret(&mallory.private, &packets, None);
        assert!(matches!(result, Err(SealError::NoMatchingRecipient)));
    }

    #[test]
    fn test_find_with_expected_sender() {
        let sender = KeyPair::generate();
        let recipient = KeyPair::generate();
        let secret = test_secret();

        let anonymous = vec![seal_for_recipient(&recipient.public, None, &secret).unwrap()];
        let result = find_session_secret(&recipient.private, &anonymous, Some(&sender.public));
        assert!(matches!(result, Err(SealError::NoMatchingRecipient)));

        let signed = vec![
            seal_for_recipient(&recipient.public, Some(&sender.private), &secret).unwrap(),
        ];
        let opened = find_session_secret(&recipient.private, &signed, Some(&sender.public)).unwrap();
        assert_eq!(opened.data_key.as_bytes(), secret.data_key.as_bytes());
    }

    #[test]
    fn test_payload_rejects_bad_chunk_size() {
        let mut payload = test_secret().to_payload();
        payload[8 + KEY_SIZE..].copy_from_slice(&0u32.to_le_bytes());
        let result = SessionSecret::from_payload(&payload);
        assert!(matches!(result, Err(SealError::Format(_))));
    }

    #[test]
    fn test_packet_method_codes() {
        assert_eq!(PacketMethod::X25519ChaCha20Poly1305.code(), 0);
        assert!(PacketMethod::from_code(0).is_ok());
        assert!(matches!(PacketMethod::from_code(7), Err(SealError::Format(_))));
    }
}
