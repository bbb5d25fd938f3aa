//! Envelope (de)serialization
//!
//! Binary layout, integers little-endian:
//! ```text
//! [8 bytes: magic "sealpack"][4: version = 1][4: packet count]
//! packet × count:
//!   [4: packet length, including this field][4: method]
//!   [32: writer public key][12: nonce][N: sealed payload (payload || tag)]
//! chunk × M (M >= 1):
//!   [chunk_size + 16 bytes: ciphertext || tag], the last chunk may be shorter
//! ```
//!
//! The header is parsed and validated before any key agreement runs. The
//! body carries no length fields: the final chunk is whatever remains at
//! end of stream.

use std::io::{Read, Write};

use serde::Serialize;

use sealpack_core::{SealError, SealResult};

use crate::chunk::EncryptedChunk;
use crate::header::{HeaderPacket, PacketMethod};
use crate::keys::PublicKey;
use crate::{KEY_SIZE, NONCE_SIZE, TAG_SIZE};

/// Envelope magic bytes
pub const MAGIC: &[u8; 8] = b"sealpack";

/// Current (and only) envelope version
pub const VERSION: u32 = 1;

/// Upper bound on recipients per envelope
pub const MAX_PACKETS: u32 = 1024;

/// Fixed part of a packet: length + method + writer key + nonce
const PACKET_FIXED_LEN: usize = 4 + 4 + KEY_SIZE + NONCE_SIZE;

/// Upper bound on a single packet, so hostile input cannot force large allocations
const MAX_PACKET_LEN: usize = 64 * 1024;

/// The parsed envelope header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvelopeHeader {
    pub version: u32,
    pub packets: Vec<HeaderPacket>,
}

/// Human/JSON-friendly view of an envelope header.
#[derive(Debug, Clone, Serialize)]
pub struct HeaderSummary {
    pub version: u32,
    pub packet_count: usize,
    pub packets: Vec<PacketSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PacketSummary {
    pub method: String,
    pub writer_public_key: String,
    pub sealed_len: usize,
}

/// Write magic, version, packet count and every packet. Returns bytes written.
pub fn write_header<W: Write>(out: &mut W, packets: &[HeaderPacket]) -> SealResult<u64> {
    if packets.is_empty() {
        return Err(SealError::Configuration(
            "an envelope needs at least one header packet".into(),
        ));
    }
    let count = u32::try_from(packets.len())
        .ok()
        .filter(|c| *c <= MAX_PACKETS)
        .ok_or_else(|| {
            SealError::Configuration(format!(
                "too many recipients: {} (maximum {MAX_PACKETS})",
                packets.len()
            ))
        })?;

    out.write_all(MAGIC)?;
    out.write_all(&VERSION.to_le_bytes())?;
    out.write_all(&count.to_le_bytes())?;
    let mut written = (MAGIC.len() + 8) as u64;

    for packet in packets {
        let len = PACKET_FIXED_LEN + packet.sealed_payload.len();
        let len_u32 = u32::try_from(len)
            .map_err(|_| SealError::Format(format!("header packet too large: {len} bytes")))?;
        out.write_all(&len_u32.to_le_bytes())?;
        out.write_all(&packet.method.code().to_le_bytes())?;
        out.write_all(packet.writer_public_key.as_bytes())?;
        out.write_all(&packet.nonce)?;
        out.write_all(&packet.sealed_payload)?;
        written += len as u64;
    }

    Ok(written)
}

/// Read and validate the envelope header.
pub fn read_header<R: Read>(input: &mut R) -> SealResult<EnvelopeHeader> {
    let magic: [u8; 8] = read_array(input, "magic")?;
    if &magic != MAGIC {
        return Err(SealError::Format("not a sealpack envelope (bad magic)".into()));
    }

    let version = u32::from_le_bytes(read_array(input, "version")?);
    if version != VERSION {
        return Err(SealError::Format(format!(
            "unsupported envelope version: {version} (supported: {VERSION})"
        )));
    }

    let count = u32::from_le_bytes(read_array(input, "packet count")?);
    if count == 0 || count > MAX_PACKETS {
        return Err(SealError::Format(format!(
            "implausible header packet count: {count}"
        )));
    }

    let mut packets = Vec::with_capacity(count as usize);
    for index in 0..count {
        packets.push(read_packet(input, index)?);
    }

    tracing::debug!(version, packets = packets.len(), "envelope header parsed");
    Ok(EnvelopeHeader { version, packets })
}

fn read_packet<R: Read>(input: &mut R, index: u32) -> SealResult<HeaderPacket> {
    let len = u32::from_le_bytes(read_array(input, "packet length")?) as usize;
    if len < PACKET_FIXED_LEN + TAG_SIZE || len > MAX_PACKET_LEN {
        return Err(SealError::Format(format!(
            "header packet {index} has implausible length {len}"
        )));
    }

    let method = PacketMethod::from_code(u32::from_le_bytes(read_array(input, "packet method")?))?;
    let writer_public_key = PublicKey::from_bytes(read_array(input, "writer public key")?);
    let nonce: [u8; NONCE_SIZE] = read_array(input, "packet nonce")?;

    let mut sealed_payload = vec![0u8; len - PACKET_FIXED_LEN];
    input
        .read_exact(&mut sealed_payload)
        .map_err(|e| SealError::from_read(e, "header packet payload"))?;

    Ok(HeaderPacket {
        method,
        writer_public_key,
        nonce,
        sealed_payload,
    })
}

/// Parse a header and describe it without attempting any decryption.
pub fn inspect_header<R: Read>(input: &mut R) -> SealResult<HeaderSummary> {
    let header = read_header(input)?;
    let packets = header
        .packets
        .iter()
        .map(|p| PacketSummary {
            method: match p.method {
                PacketMethod::X25519ChaCha20Poly1305 => "x25519_chacha20_poly1305".into(),
            },
            writer_public_key: p.writer_public_key.to_base64(),
            sealed_len: p.sealed_payload.len(),
        })
        .collect::<Vec<_>>();
    Ok(HeaderSummary {
        version: header.version,
        packet_count: packets.len(),
        packets,
    })
}

/// Writes body chunks, enforcing strict index order.
pub struct ChunkWriter<W> {
    out: W,
    next_index: u64,
    finished: bool,
    bytes_written: u64,
}

impl<W: Write> ChunkWriter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            next_index: 0,
            finished: false,
            bytes_written: 0,
        }
    }

    pub fn write_chunk(&mut self, chunk: &EncryptedChunk, is_final: bool) -> SealResult<()> {
        if self.finished {
            return Err(SealError::Format(format!(
                "chunk {} written after the final chunk",
                chunk.index
            )));
        }
        if chunk.index != self.next_index {
            return Err(SealError::Format(format!(
                "chunk {} written out of order (expected {})",
                chunk.index, self.next_index
            )));
        }
        self.out.write_all(&chunk.sealed)?;
        self.bytes_written += chunk.sealed.len() as u64;
        self.next_index += 1;
        self.finished = is_final;
        Ok(())
    }

    pub fn chunks_written(&self) -> u64 {
        self.next_index
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

/// A sealed chunk as read from the body, with its derived position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedChunk {
    pub index: u64,
    pub is_final: bool,
    pub sealed: Vec<u8>,
}

/// Reads body chunks with one chunk of lookahead, so the final chunk is
/// recognised at end of stream even when it is full-sized.
pub struct ChunkReader<R> {
    input: R,
    sealed_len: usize,
    next_index: u64,
    pending: Option<Vec<u8>>,
    primed: bool,
}

impl<R: Read> ChunkReader<R> {
    pub fn new(input: R, chunk_size: u32) -> Self {
        Self {
            input,
            sealed_len: chunk_size as usize + TAG_SIZE,
            next_index: 0,
            pending: None,
            primed: false,
        }
    }

    pub fn next_chunk(&mut self) -> SealResult<Option<SealedChunk>> {
        if !self.primed {
            self.primed = true;
            self.pending = self.read_sealed()?;
            if self.pending.is_none() {
                return Err(SealError::Format("envelope has no body chunks".into()));
            }
        }

        let Some(current) = self.pending.take() else {
            return Ok(None);
        };

        if current.len() < TAG_SIZE {
            return Err(SealError::Format(format!(
                "trailing body fragment of {} bytes is shorter than a tag",
                current.len()
            )));
        }

        // A short read already hit end of stream.
        let next = if current.len() < self.sealed_len {
            None
        } else {
            self.read_sealed()?
        };
        let is_final = next.is_none();
        self.pending = next;

        let index = self.next_index;
        self.next_index = self
            .next_index
            .checked_add(1)
            .ok_or_else(|| SealError::Format("chunk index overflow".into()))?;

        Ok(Some(SealedChunk {
            index,
            is_final,
            sealed: current,
        }))
    }

    fn read_sealed(&mut self) -> SealResult<Option<Vec<u8>>> {
        let mut buf = vec![0u8; self.sealed_len];
        let n = read_full(&mut self.input, &mut buf)?;
        if n == 0 {
            return Ok(None);
        }
        buf.truncate(n);
        Ok(Some(buf))
    }
}

/// Fill `buf` from `input` until it is full or the stream ends.
pub(crate) fn read_full<R: Read>(input: &mut R, buf: &mut [u8]) -> SealResult<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match input.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(SealError::Io(e)),
        }
    }
    Ok(filled)
}

fn read_array<R: Read, const N: usize>(input: &mut R, what: &str) -> SealResult<[u8; N]> {
    let mut buf = [0u8; N];
    input
        .read_exact(&mut buf)
        .map_err(|e| SealError::from_read(e, what))?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::encrypt_chunk;
    use crate::header::{seal_for_recipient, SessionSecret};
    use crate::keys::{generate_data_key, KeyPair};
    use std::io::Cursor;

    fn packets(n: usize) -> Vec<HeaderPacket> {
        let secret = SessionSecret::new(generate_data_key(), 65536);
        (0..n)
            .map(|_| seal_for_recipient(&KeyPair::generate().public, None, &secret).unwrap())
            .collect()
    }

    #[test]
    fn test_header_roundtrip() {
        let original = packets(3);
        let mut buf = Vec::new();
        let written = write_header(&mut buf, &original).unwrap();
        assert_eq!(written as usize, buf.len());

        let header = read_header(&mut Cursor::new(&buf)).unwrap();
        assert_eq!(header.version, VERSION);
        assert_eq!(header.packets, original);
    }

    #[test]
    fn test_header_layout() {
        let original = packets(1);
        let mut buf = Vec::new();
        write_header(&mut buf, &original).unwrap();

        assert_eq!(&buf[..8], MAGIC);
        assert_eq!(&buf[8..12], &1u32.to_le_bytes());
        assert_eq!(&buf[12..16], &1u32.to_le_bytes());
        let packet_len = u32::from_le_bytes(buf[16..20].try_into().unwrap()) as usize;
        assert_eq!(packet_len, buf.len() - 16);
        assert_eq!(packet_len, PACKET_FIXED_LEN + crate::header::SEALED_PAYLOAD_SIZE);
    }

    #[test]
    fn test_bad_magic() {
        let mut buf = Vec::new();
        write_header(&mut buf, &packets(1)).unwrap();
        buf[0] = b'X';

        let result = read_header(&mut Cursor::new(&buf));
        assert!(matches!(result, Err(SealError::Format(_))));
    }

    #[test]
    fn test_unsupported_version() {
        let mut buf = Vec::new();
        write_header(&mut buf, &packets(1)).unwrap();
        buf[8..12].copy_from_slice(&2u32.to_le_bytes());

        let result = read_header(&mut Cursor::new(&buf));
        assert!(matches!(result, Err(SealError::Format(_))));
    }

    #[test]
    fn test_zero_packets_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&VERSION.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());

        let result = read_header(&mut Cursor::new(&buf));
        assert!(matches!(result, Err(SealError::Format(_))));

        let result = write_header(&mut Vec::new(), &[]);
        assert!(matches!(result, Err(SealError::Configuration(_))));
    }

    #[test]
    fn test_truncated_header() {
        let mut buf = Vec::new();
        write_header(&mut buf, &packets(2)).unwrap();
        buf.truncate(buf.len() - 5);

        let result = read_header(&mut Cursor::new(&buf));
        assert!(matches!(result, Err(SealError::Format(_))));
    }

    #[test]
    fn test_implausible_packet_length() {
        let mut buf = Vec::new();
        write_header(&mut buf, &packets(1)).unwrap();
        buf[16..20].copy_from_slice(&u32::MAX.to_le_bytes());

        let result = read_header(&mut Cursor::new(&buf));
        assert!(matches!(result, Err(SealError::Format(_))));
    }

    #[test]
    fn test_not_an_envelope() {
        let result = read_header(&mut Cursor::new(b"plain text file\n"));
        assert!(matches!(result, Err(SealError::Format(_))));
    }

    #[test]
    fn test_inspect_header() {
        let original = packets(2);
        let mut buf = Vec::new();
        write_header(&mut buf, &original).unwrap();

        let summary = inspect_header(&mut Cursor::new(&buf)).unwrap();
        assert_eq!(summary.version, 1);
        assert_eq!(summary.packet_count, 2);
        assert_eq!(
            summary.packets[1].writer_public_key,
            original[1].writer_public_key.to_base64()
        );
        assert_eq!(summary.packets[0].method, "x25519_chacha20_poly1305");
    }

    #[test]
    fn test_chunk_writer_enforces_order() {
        let key = generate_data_key();
        let mut writer = ChunkWriter::new(Vec::new());

        let c0 = encrypt_chunk(&key, 0, false, b"a").unwrap();
        let c2 = encrypt_chunk(&key, 2, true, b"c").unwrap();
        writer.write_chunk(&c0, false).unwrap();
        assert!(matches!(writer.write_chunk(&c2, true), Err(SealError::Format(_))));

        let c1 = encrypt_chunk(&key, 1, true, b"b").unwrap();
        writer.write_chunk(&c1, true).unwrap();
        assert_eq!(writer.chunks_written(), 2);
        assert_eq!(writer.bytes_written(), 2 * (1 + TAG_SIZE) as u64);
        assert!(writer.write_chunk(&c2, true).is_err());
    }

    #[test]
    fn test_chunk_reader_detects_final_full_chunk() {
        // Two full chunks of 4 plaintext bytes each.
        let body = vec![0u8; 2 * (4 + TAG_SIZE)];
        let mut reader = ChunkReader::new(Cursor::new(body), 4);

        let first = reader.next_chunk().unwrap().unwrap();
        assert_eq!((first.index, first.is_final), (0, false));
        let second = reader.next_chunk().unwrap().unwrap();
        assert_eq!((second.index, second.is_final), (1, true));
        assert!(reader.next_chunk().unwrap().is_none());
    }

    #[test]
    fn test_chunk_reader_short_tail() {
        let body = vec![0u8; (4 + TAG_SIZE) + (1 + TAG_SIZE)];
        let mut reader = ChunkReader::new(Cursor::new(body), 4);

        assert!(!reader.next_chunk().unwrap().unwrap().is_final);
        let tail = reader.next_chunk().unwrap().unwrap();
        assert!(tail.is_final);
        assert_eq!(tail.sealed.len(), 1 + TAG_SIZE);
    }

    #[test]
    fn test_chunk_reader_rejects_empty_body() {
        let mut reader = ChunkReader::new(Cursor::new(Vec::new()), 4);
        assert!(matches!(reader.next_chunk(), Err(SealError::Format(_))));
    }

    #[test]
    fn test_chunk_reader_rejects_fragment() {
        let body = vec![0u8; (4 + TAG_SIZE) + 3];
        let mut reader = ChunkReader::new(Cursor::new(body), 4);

        reader.next_chunk().unwrap();
        assert!(matches!(reader.next_chunk(), Err(SealError::Format(_))));
    }
}
