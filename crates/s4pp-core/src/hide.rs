//! HIDE confidentiality framer
//!
//! Optional client-to-server encryption negotiated after authentication.
//! Outbound lines are concatenated into a plaintext stream and encrypted in
//! whole cipher blocks; when a boundary must be forced, the stream is padded
//! with LF bytes, which decrypt into empty no-op lines at the peer. There is
//! no server-to-client leg.

use crate::crypto::cipher::{CbcDecryptor, CbcEncryptor, CipherAlgorithm, CipherError};
use crate::secure_memory::SecureBytes;

/// HIDE negotiation and framing errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HideError {
    /// HIDE before successful AUTH
    NotAuthenticated,
    /// HIDE while a sequence is open
    InsideSequence,
    /// Second HIDE in one session
    AlreadyActive,
    UnknownCipher(String),
    /// Explicit blocksize parameter disagrees with the cipher
    BlockSizeMismatch,
    /// Salt line may not contain CR or LF
    BadSalt,
    Cipher(CipherError),
}

impl std::fmt::Display for HideError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotAuthenticated => write!(f, "HIDE requires authentication"),
            Self::InsideSequence => write!(f, "HIDE inside an open sequence"),
            Self::AlreadyActive => write!(f, "HIDE already active"),
            Self::UnknownCipher(name) => write!(f, "unknown hide cipher '{}'", name),
            Self::BlockSizeMismatch => write!(f, "blocksize does not match cipher"),
            Self::BadSalt => write!(f, "salt contains framing bytes"),
            Self::Cipher(e) => write!(f, "cipher failure: {}", e),
        }
    }
}

impl std::error::Error for HideError {}

impl From<CipherError> for HideError {
    fn from(e: CipherError) -> Self {
        Self::Cipher(e)
    }
}

/// Derive the HIDE session key.
///
/// The first `block_size` raw bytes of the challenge token, right-padded
/// with LF if shorter, encrypted as one block under the shared key; the
/// ciphertext is the session key.
pub fn derive_session_key(
    algorithm: CipherAlgorithm,
    shared_key: &[u8],
    token_raw: &[u8],
) -> Result<SecureBytes, CipherError> {
    let block_size = algorithm.block_size();
    let mut block = vec![0x0Au8; block_size];
    let n = token_raw.len().min(block_size);
    block[..n].copy_from_slice(&token_raw[..n]);
    let session_key = algorithm.encrypt_block(shared_key, &block)?;
    Ok(SecureBytes::new(session_key))
}

/// Client-side HIDE half: encrypts outbound lines.
pub struct HideWriter {
    enc: CbcEncryptor,
    pending: Vec<u8>,
}

impl HideWriter {
    pub fn new(algorithm: CipherAlgorithm, session_key: &SecureBytes) -> Self {
        Self {
            enc: CbcEncryptor::new(algorithm, session_key.as_slice()),
            pending: Vec::new(),
        }
    }

    /// Append one line (without LF) to the plaintext stream and return
    /// whatever whole-block ciphertext that releases. Remainder bytes stay
    /// buffered for the next line or the next flush.
    pub fn write_line(&mut self, line: &[u8]) -> Result<Vec<u8>, CipherError> {
        self.pending.extend_from_slice(line);
        self.pending.push(b'\n');
        self.drain_whole_blocks()
    }

    /// Force a block boundary: pad the buffered remainder with LF bytes and
    /// return the ciphertext plus how many padding LFs were added. The
    /// padding decodes as that many empty lines at the server.
    pub fn pad_flush(&mut self) -> Result<(Vec<u8>, usize), CipherError> {
        let block_size = self.enc.block_size();
        let rem = self.pending.len() % block_size;
        let pad = if rem == 0 { 0 } else { block_size - rem };
        self.pending.resize(self.pending.len() + pad, b'\n');
        let ct = self.drain_whole_blocks()?;
        Ok((ct, pad))
    }

    fn drain_whole_blocks(&mut self) -> Result<Vec<u8>, CipherError> {
        let block_size = self.enc.block_size();
        let whole = self.pending.len() - self.pending.len() % block_size;
        let mut out: Vec<u8> = self.pending.drain(..whole).collect();
        self.enc.encrypt_blocks(&mut out)?;
        Ok(out)
    }
}

/// Server-side HIDE half: decrypts inbound bytes into plaintext for the
/// line framer. Partial blocks are buffered until completed.
pub struct HideReader {
    dec: CbcDecryptor,
    pending: Vec<u8>,
}

impl HideReader {
    pub fn new(algorithm: CipherAlgorithm, session_key: &SecureBytes) -> Self {
        Self {
            dec: CbcDecryptor::new(algorithm, session_key.as_slice()),
            pending: Vec::new(),
        }
    }

    /// Decrypt all whole blocks available after appending `input`.
    pub fn decrypt(&mut self, input: &[u8]) -> Result<Vec<u8>, CipherError> {
        self.pending.extend_from_slice(input);
        let block_size = self.dec.block_size();
        let whole = self.pending.len() - self.pending.len() % block_size;
        let mut out: Vec<u8> = self.pending.drain(..whole).collect();
        self.dec.decrypt_blocks(&mut out)?;
        Ok(out)
    }
}
