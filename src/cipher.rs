//! Streaming AES-256-CTR encryption.
//!
//! Ciphertext layout: `iv (16 bytes) || keystream XOR plaintext`.
//! A fresh random IV is drawn for every call to [`encrypt`], so a key is never
//! paired with the same IV twice. Data is processed in `CHUNK_SIZE` pieces,
//! so memory use does not grow with the input.

use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher};
use rand::RngCore;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{CHUNK_SIZE, IV_SIZE, KEY_SIZE};

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

#[derive(Error, Debug)]
pub enum CipherError {
    #[error("invalid key length: expected 32 bytes, got {0}")]
    InvalidKey(usize),
    #[error("ciphertext ended before the 16-byte IV")]
    MissingIv,
    #[error("I/O error during stream cipher: {0}")]
    Io(#[from] std::io::Error),
}

/// Generate a random 256-bit key. Held for the lifetime of a node.
pub fn new_encryption_key() -> [u8; KEY_SIZE] {
    let mut key = [0u8; KEY_SIZE];
    rand::rng().fill_bytes(&mut key);
    key
}

/// Reject keys of the wrong length before any bytes move.
pub fn check_key(key: &[u8]) -> Result<(), CipherError> {
    if key.len() != KEY_SIZE {
        return Err(CipherError::InvalidKey(key.len()));
    }
    Ok(())
}

fn keystream(key: &[u8], iv: &[u8; IV_SIZE]) -> Result<Aes256Ctr, CipherError> {
    Aes256Ctr::new_from_slices(key, iv).map_err(|_| CipherError::InvalidKey(key.len()))
}

/// Encrypt everything `src` yields into `dst`.
///
/// Returns the number of bytes written to `dst`, IV included.
pub async fn encrypt<R, W>(key: &[u8], mut src: R, mut dst: W) -> Result<u64, CipherError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    check_key(key)?;

    let mut iv = [0u8; IV_SIZE];
    rand::rng().fill_bytes(&mut iv);
    let mut stream = keystream(key, &iv)?;

    dst.write_all(&iv).await?;
    let written = apply_keystream(&mut stream, &mut src, &mut dst).await?;

    Ok(IV_SIZE as u64 + written)
}

/// Decrypt an `iv || ciphertext` stream into `dst`.
///
/// Returns the number of plaintext bytes written.
pub async fn decrypt<R, W>(key: &[u8], mut src: R, mut dst: W) -> Result<u64, CipherError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    check_key(key)?;

    let mut iv = [0u8; IV_SIZE];
    if let Err(e) = src.read_exact(&mut iv).await {
        return Err(match e.kind() {
            std::io::ErrorKind::UnexpectedEof => CipherError::MissingIv,
            _ => CipherError::Io(e),
        });
    }
    let mut stream = keystream(key, &iv)?;

    Ok(apply_keystream(&mut stream, &mut src, &mut dst).await?)
}

async fn apply_keystream<R, W>(
    stream: &mut Aes256Ctr,
    src: &mut R,
    dst: &mut W,
) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut total: u64 = 0;

    loop {
        let n = src.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        stream.apply_keystream(&mut buffer[..n]);
        dst.write_all(&buffer[..n]).await?;
        total += n as u64;
    }
    dst.flush().await?;

    Ok(total)
}
