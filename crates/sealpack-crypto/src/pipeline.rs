//! End-to-end encrypt / decrypt / re-encrypt over injected streams
//!
//! ```text
//! Idle ──► HeaderPhase ──► BodyPhase ──► Done
//!               │               │
//!               └──────► Failed ◄┘
//! ```
//!
//! A `Pipeline` runs exactly one operation. Only authenticated plaintext is
//! ever written to the output, but a failure part-way through the body
//! leaves a prefix behind: callers must discard the output on any error.

use std::io::{Read, Write};

use rayon::prelude::*;
use tokio_util::sync::CancellationToken;

use sealpack_core::config::{CryptoConfig, DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE};
use sealpack_core::{SealError, SealResult};

use crate::chunk::{decrypt_chunk, encrypt_chunk, EncryptedChunk};
use crate::container::{read_full, read_header, write_header, ChunkReader, ChunkWriter};
use crate::header::{find_session_secret, seal_for_recipient, HeaderPacket, SessionSecret};
use crate::keys::{generate_data_key, DataKey, PrivateKey, PublicKey};
use crate::TAG_SIZE;

/// Progress callback: (bytes done, bytes total if known else 0, message)
pub type ProgressFn = Box<dyn Fn(u64, u64, &str) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    HeaderPhase,
    BodyPhase,
    Done,
    Failed,
}

#[derive(Debug, Clone)]
pub struct EncryptOptions {
    /// Plaintext bytes per chunk
    pub chunk_size: u32,
    /// Threads for chunk encryption; 0 or 1 encrypts on the calling thread
    pub workers: usize,
    /// Sender key for authenticated-sender mode; `None` = anonymous
    pub sender: Option<PrivateKey>,
}

impl Default for EncryptOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            workers: 1,
            sender: None,
        }
    }
}

impl From<&CryptoConfig> for EncryptOptions {
    fn from(config: &CryptoConfig) -> Self {
        Self {
            chunk_size: config.chunk_size,
            workers: config.workers,
            sender: None,
        }
    }
}

/// A plaintext window: `offset` bytes are skipped, then at most `span`
/// bytes are emitted (everything to the end when `span` is `None`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub offset: u64,
    pub span: Option<u64>,
}

impl ByteRange {
    fn end(&self) -> u64 {
        match self.span {
            Some(span) => self.offset.saturating_add(span),
            None => u64::MAX,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DecryptOptions {
    /// Only accept header packets written by this key
    pub expected_sender: Option<PublicKey>,
    /// Emit only this plaintext window
    pub range: Option<ByteRange>,
}

#[derive(Debug, Clone, Default)]
pub struct ReencryptOptions {
    /// Sender key for the new header packets; `None` = anonymous
    pub sender: Option<PrivateKey>,
    /// Only accept existing header packets written by this key
    pub expected_sender: Option<PublicKey>,
}

pub struct Pipeline {
    state: PipelineState,
    progress: Option<ProgressFn>,
    cancel: CancellationToken,
    size_hint: u64,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Pipeline {
    pub fn new() -> Self {
        Self {
            state: PipelineState::Idle,
            progress: None,
            cancel: CancellationToken::new(),
            size_hint: 0,
        }
    }

    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Observed between chunks: before each chunk write when encrypting,
    /// before each chunk decryption when decrypting.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Total input size, only used for progress reporting.
    pub fn with_size_hint(mut self, bytes: u64) -> Self {
        self.size_hint = bytes;
        self
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Encrypt `input` for every recipient. Returns plaintext bytes consumed.
    pub fn encrypt<R: Read, W: Write>(
        &mut self,
        input: R,
        output: W,
        recipients: &[PublicKey],
        opts: &EncryptOptions,
    ) -> SealResult<u64> {
        self.begin()?;
        let result = self.run_encrypt(input, output, recipients, opts);
        self.finish(result, "encrypt")
    }

    /// Decrypt an envelope with `private_key`. Returns plaintext bytes emitted.
    pub fn decrypt<R: Read, W: Write>(
        &mut self,
        input: R,
        output: W,
        private_key: &PrivateKey,
        opts: &DecryptOptions,
    ) -> SealResult<u64> {
        self.begin()?;
        let result = self.run_decrypt(input, output, private_key, opts);
        self.finish(result, "decrypt")
    }

    /// Build a new envelope with the same body, sealed for `recipients`.
    ///
    /// The body is copied verbatim and is not authenticated here; it still
    /// has to pass decryption later. Returns body bytes copied.
    pub fn reencrypt<R: Read, W: Write>(
        &mut self,
        input: R,
        output: W,
        private_key: &PrivateKey,
        recipients: &[PublicKey],
        opts: &ReencryptOptions,
    ) -> SealResult<u64> {
        self.begin()?;
        let result = self.run_reencrypt(input, output, private_key, recipients, opts);
        self.finish(result, "reencrypt")
    }

    fn run_encrypt<R: Read, W: Write>(
        &mut self,
        input: R,
        mut output: W,
        recipients: &[PublicKey],
        opts: &EncryptOptions,
    ) -> SealResult<u64> {
        if opts.chunk_size == 0 || opts.chunk_size > MAX_CHUNK_SIZE {
            return Err(SealError::Configuration(format!(
                "chunk size must be between 1 and {MAX_CHUNK_SIZE}, got {}",
                opts.chunk_size
            )));
        }

        self.transition(PipelineState::HeaderPhase);
        let secret = SessionSecret::new(generate_data_key(), opts.chunk_size);
        let packets = seal_all(recipients, opts.sender.as_ref(), &secret)?;
        write_header(&mut output, &packets)?;

        self.transition(PipelineState::BodyPhase);
        let mut chunker = PlainChunker::new(input, opts.chunk_size);
        let mut writer = ChunkWriter::new(output);
        let mut processed = 0u64;

        if opts.workers <= 1 {
            while let Some(plain) = chunker.next_chunk()? {
                let sealed = encrypt_chunk(&secret.data_key, plain.index, plain.is_final, &plain.data)?;
                self.write_sealed(&mut writer, &sealed, &plain, &mut processed)?;
            }
        } else {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(opts.workers)
                .build()
                .map_err(|e| SealError::Configuration(format!("building worker pool: {e}")))?;

            loop {
                let mut batch = Vec::with_capacity(opts.workers);
                while batch.len() < opts.workers {
                    match chunker.next_chunk()? {
                        Some(plain) => batch.push(plain),
                        None => break,
                    }
                }
                if batch.is_empty() {
                    break;
                }

                let sealed: Vec<SealResult<EncryptedChunk>> = pool.install(|| {
                    batch
                        .par_iter()
                        .map(|plain| encrypt_in_batch(&secret.data_key, plain))
                        .collect()
                });
                tracing::trace!(chunks = batch.len(), "encrypted batch");

                for (plain, sealed) in batch.iter().zip(sealed) {
                    self.write_sealed(&mut writer, &sealed?, plain, &mut processed)?;
                }
            }
        }

        let chunks = writer.chunks_written();
        let sealed_bytes = writer.bytes_written();
        let mut output = writer.into_inner();
        output.flush()?;

        tracing::info!(
            recipients = recipients.len(),
            chunks,
            bytes = processed,
            sealed_bytes,
            chunk_size = opts.chunk_size,
            authenticated_sender = opts.sender.is_some(),
            "envelope written"
        );
        Ok(processed)
    }

    fn run_decrypt<R: Read, W: Write>(
        &mut self,
        mut input: R,
        mut output: W,
        private_key: &PrivateKey,
        opts: &DecryptOptions,
    ) -> SealResult<u64> {
        self.transition(PipelineState::HeaderPhase);
        let header = read_header(&mut input)?;
        let secret = find_session_secret(private_key, &header.packets, opts.expected_sender.as_ref())?;

        self.transition(PipelineState::BodyPhase);
        let (start, end) = match opts.range {
            Some(range) => (range.offset, range.end()),
            None => (0, u64::MAX),
        };

        let mut reader = ChunkReader::new(input, secret.chunk_size);
        let mut position = 0u64;
        let mut emitted = 0u64;

        while let Some(chunk) = reader.next_chunk()? {
            let chunk_start = position;
            let chunk_end = chunk_start + (chunk.sealed.len() - TAG_SIZE) as u64;
            position = chunk_end;

            if start > 0 && chunk_end <= start {
                tracing::trace!(chunk = chunk.index, "chunk before range, skipped");
                continue;
            }

            self.check_cancelled()?;
            let plain = decrypt_chunk(&secret.data_key, chunk.index, chunk.is_final, &chunk.sealed)?;

            let lo = start.saturating_sub(chunk_start).min(plain.len() as u64) as usize;
            let hi = end.saturating_sub(chunk_start).min(plain.len() as u64) as usize;
            if hi > lo {
                output.write_all(&plain[lo..hi])?;
                emitted += (hi - lo) as u64;
            }
            tracing::trace!(chunk = chunk.index, is_final = chunk.is_final, "chunk decrypted");
            self.report(position, "decrypting");

            if chunk_end >= end {
                tracing::debug!(chunk = chunk.index, "requested range satisfied");
                break;
            }
        }

        output.flush()?;
        tracing::info!(
            packets = header.packets.len(),
            bytes = emitted,
            ranged = opts.range.is_some(),
            "envelope decrypted"
        );
        Ok(emitted)
    }

    fn run_reencrypt<R: Read, W: Write>(
        &mut self,
        mut input: R,
        mut output: W,
        private_key: &PrivateKey,
        recipients: &[PublicKey],
        opts: &ReencryptOptions,
    ) -> SealResult<u64> {
        self.transition(PipelineState::HeaderPhase);
        let header = read_header(&mut input)?;
        let secret = find_session_secret(private_key, &header.packets, opts.expected_sender.as_ref())?;
        let packets = seal_all(recipients, opts.sender.as_ref(), &secret)?;
        write_header(&mut output, &packets)?;

        self.transition(PipelineState::BodyPhase);
        let mut buf = vec![0u8; secret.chunk_size as usize + TAG_SIZE];
        let mut copied = 0u64;
        loop {
            let n = read_full(&mut input, &mut buf)?;
            if n == 0 {
                break;
            }
            self.check_cancelled()?;
            output.write_all(&buf[..n])?;
            copied += n as u64;
            self.report(copied, "re-encrypting");
        }
        if copied == 0 {
            return Err(SealError::Format("envelope has no body chunks".into()));
        }

        output.flush()?;
        tracing::info!(
            old_packets = header.packets.len(),
            new_packets = packets.len(),
            bytes = copied,
            "envelope re-encrypted"
        );
        Ok(copied)
    }

    fn write_sealed<W: Write>(
        &self,
        writer: &mut ChunkWriter<W>,
        sealed: &EncryptedChunk,
        plain: &PlainChunk,
        processed: &mut u64,
    ) -> SealResult<()> {
        self.check_cancelled()?;
        writer.write_chunk(sealed, plain.is_final)?;
        *processed += plain.data.len() as u64;
        tracing::trace!(chunk = plain.index, is_final = plain.is_final, "chunk written");
        self.report(*processed, "encrypting");
        Ok(())
    }

    fn begin(&mut self) -> SealResult<()> {
        if self.state != PipelineState::Idle {
            return Err(SealError::Configuration(format!(
                "pipeline already used (state: {:?})",
                self.state
            )));
        }
        Ok(())
    }

    fn finish(&mut self, result: SealResult<u64>, op: &str) -> SealResult<u64> {
        match &result {
            Ok(bytes) => {
                self.transition(PipelineState::Done);
                tracing::debug!(op, bytes, "pipeline done");
            }
            Err(e) => {
                tracing::warn!(op, phase = ?self.state, kind = %e.kind(), "pipeline failed: {e}");
                self.transition(PipelineState::Failed);
            }
        }
        result
    }

    fn transition(&mut self, next: PipelineState) {
        tracing::debug!(from = ?self.state, to = ?next, "pipeline state");
        self.state = next;
    }

    fn check_cancelled(&self) -> SealResult<()> {
        if self.cancel.is_cancelled() {
            return Err(SealError::Cancelled);
        }
        Ok(())
    }

    fn report(&self, done: u64, msg: &str) {
        if let Some(progress) = &self.progress {
            progress(done, self.size_hint, msg);
        }
    }
}

fn seal_all(
    recipients: &[PublicKey],
    sender: Option<&PrivateKey>,
    secret: &SessionSecret,
) -> SealResult<Vec<HeaderPacket>> {
    if recipients.is_empty() {
        return Err(SealError::Configuration(
            "at least one recipient public key is required".into(),
        ));
    }
    recipients
        .iter()
        .map(|recipient| seal_for_recipient(recipient, sender, secret))
        .collect()
}

fn encrypt_in_batch(data_key: &DataKey, plain: &PlainChunk) -> SealResult<EncryptedChunk> {
    encrypt_chunk(data_key, plain.index, plain.is_final, &plain.data)
}

/// One plaintext chunk with its position in the body.
struct PlainChunk {
    index: u64,
    is_final: bool,
    data: Vec<u8>,
}

/// Splits a plaintext stream into `chunk_size` pieces with one chunk of
/// lookahead. Empty input yields exactly one empty final chunk.
struct PlainChunker<R> {
    input: R,
    chunk_size: usize,
    next_index: u64,
    pending: Option<Vec<u8>>,
    primed: bool,
}

impl<R: Read> PlainChunker<R> {
    fn new(input: R, chunk_size: u32) -> Self {
        Self {
            input,
            chunk_size: chunk_size as usize,
            next_index: 0,
            pending: None,
            primed: false,
        }
    }

    fn next_chunk(&mut self) -> SealResult<Option<PlainChunk>> {
        if !self.primed {
            self.primed = true;
            self.pending = Some(self.read_block()?);
        }

        let Some(data) = self.pending.take() else {
            return Ok(None);
        };

        let next = if data.len() < self.chunk_size {
            None
        } else {
            Some(self.read_block()?).filter(|block| !block.is_empty())
        };
        let is_final = next.is_none();
        self.pending = next;

        let index = self.next_index;
        self.next_index = self
            .next_index
            .checked_add(1)
            .ok_or_else(|| SealError::Format("chunk index overflow".into()))?;

        Ok(Some(PlainChunk {
            index,
            is_final,
            data,
        }))
    }

    fn read_block(&mut self) -> SealResult<Vec<u8>> {
        let mut buf = vec![0u8; self.chunk_size];
        let n = read_full(&mut self.input, &mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }
}
