//! Chunked AES-256-GCM envelope.
//!
//! Layout: `MAGIC`, a big-endian u32 header length, the JSON [`EnvelopeHeader`],
//! then a sequence of chunks. Each chunk is a big-endian u32 ciphertext length,
//! a 12 byte nonce and the ciphertext. The chunk index and a final-chunk flag
//! are bound in as associated data, so reordering or truncation fails to
//! decrypt.

use crate::error::{BackupError, Result};
use aes_gcm::aead::{rand_core::RngCore, Aead, KeyInit, OsRng, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

pub const MAGIC: &[u8; 6] = b"DBENC1";
pub const CHUNK_SIZE: usize = 1024 * 1024;
const NONCE_LEN: usize = 12;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeHeader {
    pub algorithm: String,
    pub key_id: String,
    /// Data key as returned by the key service, base64.
    pub wrapped_key: String,
    pub chunk_size: usize,
}

impl EnvelopeHeader {
    pub fn new(key_id: &str, wrapped_key: &[u8]) -> Self {
        Self {
            algorithm: "AES-256-GCM".to_string(),
            key_id: key_id.to_string(),
            wrapped_key: STANDARD.encode(wrapped_key),
            chunk_size: CHUNK_SIZE,
        }
    }

    #[cfg(test)]
    pub fn wrapped_key_bytes(&self) -> Result<Vec<u8>> {
        STANDARD
            .decode(&self.wrapped_key)
            .map_err(|e| BackupError::Encryption(format!("bad wrapped key: {}", e)))
    }
}

fn cipher(key_bytes: &[u8]) -> Result<Aes256Gcm> {
    if key_bytes.len() != 32 {
        return Err(BackupError::Encryption(format!(
            "data key must be 32 bytes, got {}",
            key_bytes.len()
        )));
    }
    Ok(Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key_bytes)))
}

fn chunk_aad(index: u64, last: bool) -> [u8; 9] {
    let mut aad = [0u8; 9];
    aad[..8].copy_from_slice(&index.to_be_bytes());
    aad[8] = last as u8;
    aad
}

/// Fills `buf` as far as the reader allows; returns bytes read.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

pub fn seal_file(
    key_bytes: &[u8],
    header: &EnvelopeHeader,
    source: &Path,
    dest: &Path,
) -> Result<()> {
    let cipher = cipher(key_bytes)?;
    let mut reader = BufReader::new(File::open(source)?);
    let mut writer = BufWriter::new(File::create(dest)?);

    let header_bytes = serde_json::to_vec(header)?;
    writer.write_all(MAGIC)?;
    writer.write_all(&(header_bytes.len() as u32).to_be_bytes())?;
    writer.write_all(&header_bytes)?;

    let mut current = vec![0u8; CHUNK_SIZE];
    let mut next = vec![0u8; CHUNK_SIZE];
    let mut current_len = read_full(&mut reader, &mut current)?;
    let mut index: u64 = 0;

    loop {
        let next_len = if current_len == CHUNK_SIZE {
            read_full(&mut reader, &mut next)?
        } else {
            0
        };
        let last = next_len == 0;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let aad = chunk_aad(index, last);
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: &current[..current_len],
                    aad: &aad,
                },
            )
            .map_err(|_| BackupError::Encryption("chunk encryption failed".to_string()))?;

        writer.write_all(&(ciphertext.len() as u32).to_be_bytes())?;
        writer.write_all(&nonce_bytes)?;
        writer.write_all(&ciphertext)?;

        if last {
            break;
        }
        std::mem::swap(&mut current, &mut next);
        current_len = next_len;
        index += 1;
    }

    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(())
}

pub fn read_header(source: &Path) -> Result<EnvelopeHeader> {
    let mut reader = BufReader::new(File::open(source)?);
    read_header_from(&mut reader)
}

fn read_header_from<R: Read>(reader: &mut R) -> Result<EnvelopeHeader> {
    let mut magic = [0u8; 6];
    reader.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(BackupError::Encryption("not an encrypted artifact".to_string()));
    }
    let mut len = [0u8; 4];
    reader.read_exact(&mut len)?;
    let mut header = vec![0u8; u32::from_be_bytes(len) as usize];
    reader.read_exact(&mut header)?;
    Ok(serde_json::from_slice(&header)?)
}

#[cfg(test)]
type Frame = ([u8; NONCE_LEN], Vec<u8>);

#[cfg(test)]
/// Reads one chunk frame; `None` at a clean end of input.
fn read_frame<R: Read>(reader: &mut R) -> Result<Option<Frame>> {
    let mut len = [0u8; 4];
    match read_full(reader, &mut len)? {
        0 => return Ok(None),
        4 => {}
        _ => return Err(BackupError::Encryption("envelope truncated".to_string())),
    }
    let mut nonce = [0u8; NONCE_LEN];
    let mut ciphertext = vec![0u8; u32::from_be_bytes(len) as usize];
    reader
        .read_exact(&mut nonce)
        .and_then(|_| reader.read_exact(&mut ciphertext))
        .map_err(|_| BackupError::Encryption("envelope truncated".to_string()))?;
    Ok(Some((nonce, ciphertext)))
}

/// Inverse of [`seal_file`] given the unwrapped data key.
#[cfg(test)]
pub fn open_file(key_bytes: &[u8], source: &Path, dest: &Path) -> Result<EnvelopeHeader> {
    let cipher = cipher(key_bytes)?;
    let mut reader = BufReader::new(File::open(source)?);
    let header = read_header_from(&mut reader)?;
    let mut writer = BufWriter::new(File::create(dest)?);

    let mut pending = read_frame(&mut reader)?
        .ok_or_else(|| BackupError::Encryption("envelope has no chunks".to_string()))?;
    let mut index: u64 = 0;

    loop {
        let next = read_frame(&mut reader)?;
        let aad = chunk_aad(index, next.is_none());
        let (nonce, ciphertext) = &pending;
        let plaintext = cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| BackupError::Encryption(format!("chunk {} failed to decrypt", index)))?;
        writer.write_all(&plaintext)?;

        match next {
            Some(frame) => {
                pending = frame;
                index += 1;
            }
            None => break,
        }
    }

    writer.flush()?;
    Ok(header)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const KEY: [u8; 32] = [7u8; 32];

    fn seal(plaintext: &[u8]) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempdir().unwrap();
        let src = dir.path().join("plain");
        let dst = dir.path().join("sealed");
        std::fs::write(&src, plaintext).unwrap();
        seal_file(&KEY, &EnvelopeHeader::new("alias/backups", b"wrapped"), &src, &dst).unwrap();
        (dir, dst)
    }

    #[test]
    fn test_multi_chunk_roundtrip() {
        let plaintext: Vec<u8> = (0..CHUNK_SIZE * 2 + 17).map(|i| (i % 251) as u8).collect();
        let (dir, sealed) = seal(&plaintext);
        let out = dir.path().join("opened");

        let header = open_file(&KEY, &sealed, &out).unwrap();
        assert_eq!(header.key_id, "alias/backups");
        assert_eq!(header.wrapped_key_bytes().unwrap(), b"wrapped");
        assert_eq!(std::fs::read(&out).unwrap(), plaintext);
    }

    #[test]
    fn test_ciphertext_does_not_contain_plaintext() {
        let plaintext = b"CREATE TABLE secrets (token text);".repeat(10);
        let (_dir, sealed) = seal(&plaintext);
        let bytes = std::fs::read(&sealed).unwrap();
        assert!(bytes.starts_with(MAGIC));
        assert!(!bytes
            .windows(b"CREATE TABLE".len())
            .any(|w| w == b"CREATE TABLE"));
    }

    #[test]
    fn test_dropped_final_chunk_is_detected() {
        let plaintext = vec![1u8; CHUNK_SIZE + 10];
        let (dir, sealed) = seal(&plaintext);
        let bytes = std::fs::read(&sealed).unwrap();
        // Final chunk: 4 byte length + nonce + 10 bytes + 16 byte tag.
        let cut = bytes.len() - (4 + NONCE_LEN + 10 + 16);
        std::fs::write(&sealed, &bytes[..cut]).unwrap();

        assert!(open_file(&KEY, &sealed, &dir.path().join("opened")).is_err());
    }

    #[test]
    fn test_wrong_key_fails() {
        let (dir, sealed) = seal(b"data");
        assert!(open_file(&[9u8; 32], &sealed, &dir.path().join("opened")).is_err());
    }
}
