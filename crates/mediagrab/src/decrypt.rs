// Segment decryption: AES-128-CBC with per-segment IV derivation and strict PKCS#7.

use std::path::{Path, PathBuf};

use aes::Aes128;
use cipher::generic_array::GenericArray;
use cipher::{BlockDecryptMut, KeyIvInit};
use media_types::{DecryptionKey, KeyMethod};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::config::DEFAULT_MAX_IN_MEMORY;
use crate::error::DownloadError;

type Aes128CbcDec = cbc::Decryptor<Aes128>;

pub const BLOCK_SIZE: usize = 16;

const STREAM_BUFFER_SIZE: usize = 64 * 1024;

/// Add `sequence` to the big-endian 128-bit `base_iv`, carrying into the
/// higher bytes.
pub fn derive_iv(base_iv: &[u8; 16], sequence: u64) -> [u8; 16] {
    u128::from_be_bytes(*base_iv)
        .wrapping_add(u128::from(sequence))
        .to_be_bytes()
}

/// Validate and strip PKCS#7 padding.
pub fn strip_pkcs7(data: &[u8]) -> Result<&[u8], DownloadError> {
    let Some(&pad) = data.last() else {
        return Err(DownloadError::corrupt("empty plaintext has no padding"));
    };
    let pad_len = usize::from(pad);
    if pad_len == 0 || pad_len > BLOCK_SIZE || pad_len > data.len() {
        return Err(DownloadError::corrupt(format!(
            "invalid PKCS#7 padding length {pad_len}"
        )));
    }
    let (plain, padding) = data.split_at(data.len() - pad_len);
    if padding.iter().any(|&b| b != pad) {
        return Err(DownloadError::corrupt("inconsistent PKCS#7 padding bytes"));
    }
    Ok(plain)
}

fn decrypt_blocks(cipher: &mut Aes128CbcDec, data: &mut [u8]) {
    for block in data.chunks_exact_mut(BLOCK_SIZE) {
        cipher.decrypt_block_mut(GenericArray::from_mut_slice(block));
    }
}

fn to_block(bytes: &[u8], what: &str) -> Result<[u8; 16], DownloadError> {
    bytes.try_into().map_err(|_| {
        DownloadError::invalid_input(format!(
            "AES-128 {what} must be 16 bytes, got {}",
            bytes.len()
        ))
    })
}

/// Decrypts AES-128 HLS segments.
///
/// Every operation takes the segment's sequence number; the IV used is
/// `derive_iv(base_iv, sequence)`.
#[derive(Debug, Clone)]
pub struct SegmentDecryptor {
    key: [u8; 16],
    base_iv: [u8; 16],
    base_sequence: u64,
    in_memory_limit: u64,
}

impl SegmentDecryptor {
    pub fn new(key: &[u8], base_iv: &[u8]) -> Result<Self, DownloadError> {
        Ok(Self {
            key: to_block(key, "key")?,
            base_iv: to_block(base_iv, "IV")?,
            base_sequence: 0,
            in_memory_limit: DEFAULT_MAX_IN_MEMORY,
        })
    }

    /// Build a decryptor from format key material. Only `AES-128` is supported.
    pub fn from_key(key: &DecryptionKey) -> Result<Self, DownloadError> {
        if key.method != KeyMethod::Aes128 {
            return Err(DownloadError::invalid_input(format!(
                "unsupported encryption method {}",
                key.method.as_str()
            )));
        }
        let mut decryptor = Self::new(&key.key, &key.iv)?;
        decryptor.base_sequence = key.media_sequence;
        Ok(decryptor)
    }

    /// Files at or below `limit` bytes are decrypted in memory, larger ones are streamed.
    pub fn with_in_memory_limit(mut self, limit: u64) -> Self {
        self.in_memory_limit = limit;
        self
    }

    /// Sequence number of the first media segment.
    pub fn base_sequence(&self) -> u64 {
        self.base_sequence
    }

    fn cipher(&self, sequence: u64) -> Aes128CbcDec {
        let iv = derive_iv(&self.base_iv, sequence);
        Aes128CbcDec::new(&self.key.into(), &iv.into())
    }

    pub fn decrypt_buffer(&self, data: &[u8], sequence: u64) -> Result<Vec<u8>, DownloadError> {
        if data.len() % BLOCK_SIZE != 0 {
            return Err(DownloadError::corrupt(format!(
                "ciphertext length {} is not a multiple of {BLOCK_SIZE}",
                data.len()
            )));
        }
        let mut buffer = data.to_vec();
        decrypt_blocks(&mut self.cipher(sequence), &mut buffer);
        let plain_len = strip_pkcs7(&buffer)?.len();
        buffer.truncate(plain_len);
        Ok(buffer)
    }

    /// Decrypt `reader` into `writer`, holding back the final block until EOF
    /// so the padding can be validated. Returns the plaintext length.
    pub async fn decrypt_stream<R, W>(
        &self,
        reader: &mut R,
        writer: &mut W,
        sequence: u64,
    ) -> Result<u64, DownloadError>
    where
        R: AsyncRead + Unpin + ?Sized,
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut cipher = self.cipher(sequence);
        let mut pending: Vec<u8> = Vec::with_capacity(STREAM_BUFFER_SIZE + BLOCK_SIZE);
        let mut buf = vec![0u8; STREAM_BUFFER_SIZE];
        let mut written = 0u64;

        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            pending.extend_from_slice(&buf[..n]);

            let whole = pending.len() / BLOCK_SIZE * BLOCK_SIZE;
            if whole > BLOCK_SIZE {
                let ready = whole - BLOCK_SIZE;
                decrypt_blocks(&mut cipher, &mut pending[..ready]);
                writer.write_all(&pending[..ready]).await?;
                written += ready as u64;
                pending.drain(..ready);
            }
        }

        if pending.len() % BLOCK_SIZE != 0 {
            return Err(DownloadError::corrupt(format!(
                "ciphertext length {} is not a multiple of {BLOCK_SIZE}",
                written as usize + pending.len()
            )));
        }
        decrypt_blocks(&mut cipher, &mut pending);
        let tail = strip_pkcs7(&pending)?;
        writer.write_all(tail).await?;
        writer.flush().await?;
        Ok(written + tail.len() as u64)
    }

    pub async fn decrypt_to_file(
        &self,
        source: &Path,
        destination: &Path,
        sequence: u64,
    ) -> Result<u64, DownloadError> {
        let mut reader = tokio::fs::File::open(source).await?;
        let mut writer = tokio::io::BufWriter::new(tokio::fs::File::create(destination).await?);
        match self.decrypt_stream(&mut reader, &mut writer, sequence).await {
            Ok(len) => Ok(len),
            Err(err) => {
                drop(writer);
                if let Err(e) = tokio::fs::remove_file(destination).await {
                    warn!(path = %destination.display(), error = %e, "Failed to remove partial decrypted file");
                }
                Err(err)
            }
        }
    }

    /// Replace the ciphertext at `path` with its plaintext.
    pub async fn decrypt_in_place(&self, path: &Path, sequence: u64) -> Result<u64, DownloadError> {
        let size = tokio::fs::metadata(path).await?.len();

        if size <= self.in_memory_limit {
            let data = tokio::fs::read(path).await?;
            let this = self.clone();
            let plain = tokio::task::spawn_blocking(move || this.decrypt_buffer(&data, sequence))
                .await
                .map_err(|e| DownloadError::Decryption {
                    reason: format!("decryption task failed: {e}"),
                })??;
            tokio::fs::write(path, &plain).await?;
            return Ok(plain.len() as u64);
        }

        let mut staging = path.as_os_str().to_owned();
        staging.push(".dec");
        let staging = PathBuf::from(staging);
        let len = self.decrypt_to_file(path, &staging, sequence).await?;
        tokio::fs::rename(&staging, path).await?;
        debug!(path = %path.display(), size, "Stream-decrypted segment");
        Ok(len)
    }

    /// Decrypt each file in place using consecutive sequence numbers.
    pub async fn decrypt_files_sequential(
        &self,
        paths: &[PathBuf],
        starting_sequence: u64,
    ) -> Result<(), DownloadError> {
        for (offset, path) in paths.iter().enumerate() {
            self.decrypt_in_place(path, starting_sequence + offset as u64)
                .await?;
        }
        Ok(())
    }

    pub async fn decrypt_files_with_sequences(
        &self,
        paths: &[PathBuf],
        sequences: &[u64],
    ) -> Result<(), DownloadError> {
        if paths.len() != sequences.len() {
            return Err(DownloadError::invalid_input(format!(
                "{} files but {} sequence numbers",
                paths.len(),
                sequences.len()
            )));
        }
        for (path, &sequence) in paths.iter().zip(sequences) {
            self.decrypt_in_place(path, sequence).await?;
        }
        Ok(())
    }
}
