//! Streaming encryption for backup containers.
//!
//! AES-256-GCM over fixed-size chunks so memory stays bounded regardless of
//! database size. The per-file key is derived with HMAC-SHA256 from the
//! operator secret and a random salt stored in the header.
//!
//! Layout:
//!
//! ```text
//! header: magic(8) || version(1) || salt(16) || nonce_prefix(7) || chunk_size(u32 BE)
//! chunk*: len(u32 BE, high bit = last chunk) || ciphertext+tag
//! ```
//!
//! Chunk nonce: nonce_prefix(7) || counter(u32 BE) || last(1). The header is
//! bound to every chunk as associated data, so a wrong key, a reordered or
//! truncated stream, or a tampered header all fail authentication.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;
use thiserror::Error;

use crate::error::AppError;

type HmacSha256 = Hmac<Sha256>;

const MAGIC: &[u8; 8] = b"BKPCNT01";
const FORMAT_VERSION: u8 = 1;
const HEADER_LEN: usize = 8 + 1 + 16 + 7 + 4;
const TAG_LEN: usize = 16;
const LAST_CHUNK_FLAG: u32 = 1 << 31;
const KEY_CONTEXT: &[u8] = b"backup-orchestrator/container/aes-256-gcm/v1";

/// Plaintext bytes per encrypted chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Shortest operator secret accepted.
pub const MIN_SECRET_LEN: usize = 16;

/// Errors that can occur during container encryption
#[derive(Error, Debug)]
pub enum EncryptionError {
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Not an encrypted backup container")]
    InvalidHeader,

    #[error("Container is truncated")]
    Truncated,

    #[error("Decryption failed: wrong key or corrupted data")]
    DecryptionFailed,

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl From<EncryptionError> for AppError {
    fn from(e: EncryptionError) -> Self {
        match e {
            EncryptionError::InvalidKey(msg) => AppError::InvalidEncryptionKey(msg),
            EncryptionError::EncryptionFailed(msg) => AppError::Encryption(msg),
            EncryptionError::Io(e) => AppError::Io(e),
            other => AppError::Decrypt(other.to_string()),
        }
    }
}

/// Derive a 32-byte container key from the operator secret and a file salt.
fn derive_key(secret: &str, salt: &[u8]) -> [u8; 32] {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret.as_bytes())
        .expect("HMAC-SHA256 accepts any key length");
    mac.update(KEY_CONTEXT);
    mac.update(salt);
    mac.finalize().into_bytes().into()
}

fn chunk_nonce(prefix: &[u8; 7], counter: u32, last: bool) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[..7].copy_from_slice(prefix);
    nonce[7..11].copy_from_slice(&counter.to_be_bytes());
    nonce[11] = u8::from(last);
    nonce
}

/// Read until `buf` is full or the reader is exhausted.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Chunked AES-256-GCM cipher keyed from an operator secret.
pub struct ContainerCipher {
    secret: String,
    chunk_size: usize,
}

redacted_debug!(ContainerCipher {
    redact secret,
    show chunk_size,
});

impl ContainerCipher {
    /// Build a cipher from the operator secret.
    pub fn from_secret(secret: &str) -> Result<Self, EncryptionError> {
        if secret.trim().is_empty() {
            return Err(EncryptionError::InvalidKey("encryption key is not configured".into()));
        }
        if secret.len() < MIN_SECRET_LEN {
            return Err(EncryptionError::InvalidKey(format!(
                "encryption key must be at least {} bytes",
                MIN_SECRET_LEN
            )));
        }
        Ok(Self {
            secret: secret.to_string(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        })
    }

    /// Override the chunk size (clamped to 1 byte .. 16 MiB).
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.clamp(1, 16 * 1024 * 1024);
        self
    }

    /// Encrypt everything from `reader` into `writer`. Returns bytes written.
    pub fn encrypt_stream<R: Read, W: Write>(
        &self,
        mut reader: R,
        mut writer: W,
    ) -> Result<u64, EncryptionError> {
        let salt: [u8; 16] = rand::random();
        let nonce_prefix: [u8; 7] = rand::random();

        let mut header = Vec::with_capacity(HEADER_LEN);
        header.extend_from_slice(MAGIC);
        header.push(FORMAT_VERSION);
        header.extend_from_slice(&salt);
        header.extend_from_slice(&nonce_prefix);
        header.extend_from_slice(&(self.chunk_size as u32).to_be_bytes());

        let key = derive_key(&self.secret, &salt);
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| EncryptionError::EncryptionFailed(e.to_string()))?;

        writer.write_all(&header)?;
        let mut written = header.len() as u64;

        let mut current = vec![0u8; self.chunk_size];
        let mut next = vec![0u8; self.chunk_size];
        let mut current_len = read_full(&mut reader, &mut current)?;
        let mut counter: u32 = 0;

        loop {
            // A full chunk may still be the last one; look ahead to find out.
            let next_len = if current_len == self.chunk_size {
                read_full(&mut reader, &mut next)?
            } else {
                0
            };
            let last = next_len == 0;

            let nonce = chunk_nonce(&nonce_prefix, counter, last);
            let ciphertext = cipher
                .encrypt(
                    Nonce::from_slice(&nonce),
                    Payload {
                        msg: &current[..current_len],
                        aad: &header,
                    },
                )
                .map_err(|_| EncryptionError::EncryptionFailed("AES-GCM seal failed".into()))?;

            let mut len_field = ciphertext.len() as u32;
            if last {
                len_field |= LAST_CHUNK_FLAG;
            }
            writer.write_all(&len_field.to_be_bytes())?;
            writer.write_all(&ciphertext)?;
            written += 4 + ciphertext.len() as u64;

            if last {
                break;
            }
            counter = counter
                .checked_add(1)
                .ok_or_else(|| EncryptionError::EncryptionFailed("too many chunks".into()))?;
            std::mem::swap(&mut current, &mut next);
            current_len = next_len;
        }

        writer.flush()?;
        Ok(written)
    }

    /// Decrypt a container from `reader` into `writer`. Returns plaintext bytes.
    pub fn decrypt_stream<R: Read, W: Write>(
        &self,
        mut reader: R,
        mut writer: W,
    ) -> Result<u64, EncryptionError> {
        let mut header = [0u8; HEADER_LEN];
        if read_full(&mut reader, &mut header)? != HEADER_LEN
            || &header[..8] != MAGIC
            || header[8] != FORMAT_VERSION
        {
            return Err(EncryptionError::InvalidHeader);
        }

        let salt = &header[9..25];
        let mut nonce_prefix = [0u8; 7];
        nonce_prefix.copy_from_slice(&header[25..32]);
        let chunk_size = u32::from_be_bytes([header[32], header[33], header[34], header[35]]) as usize;
        if chunk_size == 0 || chunk_size > 16 * 1024 * 1024 {
            return Err(EncryptionError::InvalidHeader);
        }

        let key = derive_key(&self.secret, salt);
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| EncryptionError::EncryptionFailed(e.to_string()))?;

        let mut plaintext_len = 0u64;
        let mut counter: u32 = 0;
        let mut buf = vec![0u8; chunk_size + TAG_LEN];

        loop {
            let mut len_bytes = [0u8; 4];
            if read_full(&mut reader, &mut len_bytes)? != 4 {
                return Err(EncryptionError::Truncated);
            }
            let len_field = u32::from_be_bytes(len_bytes);
            let last = len_field & LAST_CHUNK_FLAG != 0;
            let len = (len_field & !LAST_CHUNK_FLAG) as usize;
            if len < TAG_LEN || len > chunk_size + TAG_LEN {
                return Err(EncryptionError::DecryptionFailed);
            }
            if read_full(&mut reader, &mut buf[..len])? != len {
                return Err(EncryptionError::Truncated);
            }

            let nonce = chunk_nonce(&nonce_prefix, counter, last);
            let plaintext = cipher
                .decrypt(
                    Nonce::from_slice(&nonce),
                    Payload {
                        msg: &buf[..len],
                        aad: &header,
                    },
                )
                .map_err(|_| EncryptionError::DecryptionFailed)?;
            writer.write_all(&plaintext)?;
            plaintext_len += plaintext.len() as u64;

            if last {
                break;
            }
            counter = counter.checked_add(1).ok_or(EncryptionError::DecryptionFailed)?;
        }

        let mut trailing = [0u8; 1];
        if read_full(&mut reader, &mut trailing)? != 0 {
            return Err(EncryptionError::DecryptionFailed);
        }

        writer.flush()?;
        Ok(plaintext_len)
    }

    /// Encrypt `src` into a new file at `dst`.
    pub fn encrypt_file(&self, src: &Path, dst: &Path) -> Result<u64, EncryptionError> {
        let reader = BufReader::new(File::open(src)?);
        let file = File::create(dst)?;
        let written = self.encrypt_stream(reader, BufWriter::new(&file))?;
        file.sync_all()?;
        Ok(written)
    }

    /// Decrypt `src` into a new file at `dst`.
    pub fn decrypt_file(&self, src: &Path, dst: &Path) -> Result<u64, EncryptionError> {
        let reader = BufReader::new(File::open(src)?);
        let file = File::create(dst)?;
        self.decrypt_stream(reader, BufWriter::new(&file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const SECRET: &str = "operator-secret-for-tests";

    fn encrypt(cipher: &ContainerCipher, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        cipher.encrypt_stream(Cursor::new(data), &mut out).unwrap();
        out
    }

    fn decrypt(cipher: &ContainerCipher, data: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        let mut out = Vec::new();
        cipher.decrypt_stream(Cursor::new(data), &mut out)?;
        Ok(out)
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip_across_chunk_boundaries() {
        let cipher = ContainerCipher::from_secret(SECRET).unwrap().with_chunk_size(64);
        for len in [0usize, 1, 63, 64, 65, 128, 1000] {
            let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let sealed = encrypt(&cipher, &payload);
            assert_eq!(decrypt(&cipher, &sealed).unwrap(), payload, "len {}", len);
        }
    }

    #[test]
    fn test_wrong_key_fails() {
        let cipher = ContainerCipher::from_secret(SECRET).unwrap();
        let other = ContainerCipher::from_secret("a-completely-different-key").unwrap();

        let sealed = encrypt(&cipher, b"pg dump bytes");
        let err = decrypt(&other, &sealed).unwrap_err();
        assert!(matches!(err, EncryptionError::DecryptionFailed));
    }

    #[test]
    fn test_truncated_stream_fails() {
        let cipher = ContainerCipher::from_secret(SECRET).unwrap().with_chunk_size(16);
        let sealed = encrypt(&cipher, &[7u8; 100]);

        // Drop the final chunk entirely: the stream ends before a last-chunk marker.
        let first_chunk_end = HEADER_LEN + 4 + 16 + TAG_LEN;
        assert!(decrypt(&cipher, &sealed[..first_chunk_end]).is_err());
        assert!(decrypt(&cipher, &sealed[..sealed.len() - 1]).is_err());
    }

    #[test]
    fn test_tampered_byte_fails() {
        let cipher = ContainerCipher::from_secret(SECRET).unwrap();
        let mut sealed = encrypt(&cipher, b"some archive payload");
        let idx = sealed.len() - 5;
        sealed[idx] ^= 0x01;
        assert!(decrypt(&cipher, &sealed).is_err());
    }

    #[test]
    fn test_garbage_is_rejected_as_invalid_header() {
        let cipher = ContainerCipher::from_secret(SECRET).unwrap();
        let err = decrypt(&cipher, b"plainly not a container at all, sorry").unwrap_err();
        assert!(matches!(err, EncryptionError::InvalidHeader));
    }

    #[test]
    fn test_short_or_missing_secret_rejected() {
        assert!(matches!(
            ContainerCipher::from_secret(""),
            Err(EncryptionError::InvalidKey(_))
        ));
        assert!(matches!(
            ContainerCipher::from_secret("short"),
            Err(EncryptionError::InvalidKey(_))
        ));
        let app: AppError = ContainerCipher::from_secret("short").unwrap_err().into();
        assert_eq!(app.code(), crate::error::ErrorCode::InvalidEncryptionKey);
    }

    #[test]
    fn test_same_plaintext_encrypts_differently() {
        let cipher = ContainerCipher::from_secret(SECRET).unwrap();
        assert_ne!(encrypt(&cipher, b"same"), encrypt(&cipher, b"same"));
    }
}
