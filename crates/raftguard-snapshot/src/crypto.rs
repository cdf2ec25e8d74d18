//! Snapshot stream encryption
//!
//! AES-256 in counter mode over a byte stream. The container format is
//!
//! ```text
//! [ IV: 16 bytes, plaintext ][ ciphertext: same length as the plaintext ]
//! ```
//!
//! There is no padding and no authentication tag, so the adapters work on
//! arbitrarily sized writes and reads. The session key and the IV live in
//! `Zeroizing` buffers and are wiped on every exit path.
//!
//! Warning: [`CipherWriter::write_in_place`] is fast because it encrypts the
//! caller's buffer in place. After the call the buffer holds ciphertext.

use std::fmt;
use std::io::{self, Read, Write};

use aes::Aes256;
use ctr::Ctr128BE;
use ctr::cipher::{KeyIvInit, StreamCipher};
use rand::TryRngCore;
use rand::rngs::OsRng;
use sha2::digest::generic_array::GenericArray;
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::Zeroizing;

/// AES block size, which is also the IV length
pub const BLOCK_SIZE: usize = 16;

/// AES-256 key length
pub const KEY_SIZE: usize = 32;

type Aes256Ctr = Ctr128BE<Aes256>;

/// Error types for stream encryption
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("random source failure: {0}")]
    Random(String),

    #[error("truncated stream: expected a {expected} byte IV prefix")]
    Truncated { expected: usize },

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Result type for crypto operations
pub type CryptoResult<T> = Result<T, CryptoError>;

/// Per-call AES-256 key, zeroed when dropped
pub struct SessionKey(Zeroizing<[u8; KEY_SIZE]>);

impl SessionKey {
    /// Derive the key from the shared token alone (SHA-256 of the token)
    pub fn from_token(token: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(token.as_bytes());
        Self::finalize(hasher)
    }

    /// Derive a key diversified by snapshot position (SHA-256 over token, index and term)
    pub fn for_snapshot(token: &str, index: u64, term: u64) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(token.as_bytes());
        hasher.update(index.to_be_bytes());
        hasher.update(term.to_be_bytes());
        Self::finalize(hasher)
    }

    fn finalize(hasher: Sha256) -> Self {
        let mut key = Zeroizing::new([0u8; KEY_SIZE]);
        hasher.finalize_into(GenericArray::from_mut_slice(&mut key[..]));
        Self(key)
    }

    fn keystream(&self, iv: &[u8]) -> CryptoResult<Aes256Ctr> {
        Aes256Ctr::new_from_slices(&self.0[..], iv)
            .map_err(|_| CryptoError::InvalidKey("unexpected key or IV length".to_string()))
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// Encrypting adapter over a write-only sink
pub struct CipherWriter<W> {
    sink: W,
    keystream: Aes256Ctr,
    scratch: Vec<u8>,
}

impl<W: Write> CipherWriter<W> {
    /// Write a fresh random IV to `sink` and return the encrypting adapter.
    ///
    /// Any error from the sink while writing the IV aborts construction.
    pub fn new(key: &SessionKey, sink: W) -> CryptoResult<Self> {
        Self::try_new(key, sink).map_err(|(err, _sink)| err)
    }

    /// Like [`CipherWriter::new`], but hands the sink back on failure so the
    /// caller can discard whatever was partially written to it.
    pub fn try_new(key: &SessionKey, mut sink: W) -> Result<Self, (CryptoError, W)> {
        let mut iv = Zeroizing::new([0u8; BLOCK_SIZE]);
        if let Err(e) = OsRng.try_fill_bytes(&mut iv[..]) {
            return Err((CryptoError::Random(e.to_string()), sink));
        }

        let keystream = match key.keystream(&iv[..]) {
            Ok(keystream) => keystream,
            Err(e) => return Err((e, sink)),
        };
        if let Err(e) = sink.write_all(&iv[..]) {
            return Err((e.into(), sink));
        }

        Ok(Self {
            sink,
            keystream,
            scratch: Vec::new(),
        })
    }

    /// Encrypt `buf` in place and forward it to the sink.
    ///
    /// `buf` holds ciphertext when this returns, whether or not the sink
    /// accepted it. Returns the number of bytes written, always `buf.len()`
    /// on success.
    pub fn write_in_place(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.keystream.apply_keystream(buf);
        self.sink.write_all(buf)?;
        Ok(buf.len())
    }

    pub fn get_ref(&self) -> &W {
        &self.sink
    }

    pub fn into_inner(self) -> W {
        self.sink
    }
}

impl<W: Write> Write for CipherWriter<W> {
    // Copying path for callers that only hold a shared slice. The keystream
    // advances for the whole buffer, so partial sink writes are not surfaced
    // as short counts.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.scratch.clear();
        self.scratch.extend_from_slice(buf);
        self.keystream.apply_keystream(&mut self.scratch);
        self.sink.write_all(&self.scratch)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.sink.flush()
    }
}

/// Decrypting adapter over a read-only source
pub struct CipherReader<R> {
    source: R,
    keystream: Aes256Ctr,
}

impl<R: Read> CipherReader<R> {
    /// Consume the IV prefix from `source` and return the decrypting adapter.
    ///
    /// A source shorter than one block fails with [`CryptoError::Truncated`].
    pub fn new(key: &SessionKey, mut source: R) -> CryptoResult<Self> {
        let mut iv = Zeroizing::new([0u8; BLOCK_SIZE]);
        source.read_exact(&mut iv[..]).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                CryptoError::Truncated {
                    expected: BLOCK_SIZE,
                }
            } else {
                CryptoError::Io(e)
            }
        })?;

        let keystream = key.keystream(&iv[..])?;
        Ok(Self { source, keystream })
    }

    pub fn into_inner(self) -> R {
        self.source
    }
}

impl<R: Read> Read for CipherReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.source.read(buf)?;
        self.keystream.apply_keystream(&mut buf[..n]);
        Ok(n)
    }
}
