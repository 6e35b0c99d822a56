//! Named block ciphers for the HIDE confidentiality layer
//!
//! AES-128-CBC is mandatory whenever HIDE is advertised. The adapter exposes
//! a one-shot single-block encrypt (used for session key derivation) and
//! streaming CBC halves with explicit chain state. IV convention: all-zero
//! IV for the first block, then ciphertext chaining; acceptable here because
//! the first encrypted line of a HIDE stream is random filler.

use aes::cipher::{generic_array::GenericArray, BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;

use crate::secure_memory::SecureBytes;

/// Cipher capability errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CipherError {
    /// Algorithm name not implemented here
    UnknownAlgorithm(String),
    /// Input not aligned to the cipher block size
    BlockAlignment,
}

impl std::fmt::Display for CipherError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownAlgorithm(name) => write!(f, "unknown cipher algorithm '{}'", name),
            Self::BlockAlignment => write!(f, "input is not a whole number of cipher blocks"),
        }
    }
}

impl std::error::Error for CipherError {}

/// Block ciphers this implementation speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherAlgorithm {
    Aes128Cbc,
}

impl CipherAlgorithm {
    /// All supported algorithms in preference order.
    pub const SUPPORTED: &'static [CipherAlgorithm] = &[CipherAlgorithm::Aes128Cbc];

    pub fn from_wire(name: &str) -> Option<Self> {
        match name {
            "AES-128-CBC" => Some(Self::Aes128Cbc),
            _ => None,
        }
    }

    pub fn wire_name(self) -> &'static str {
        match self {
            Self::Aes128Cbc => "AES-128-CBC",
        }
    }

    pub fn block_size(self) -> usize {
        match self {
            Self::Aes128Cbc => 16,
        }
    }

    pub fn key_len(self) -> usize {
        match self {
            Self::Aes128Cbc => 16,
        }
    }

    /// Fit shared key material to the cipher key length: truncate if longer,
    /// right-pad with zeros if shorter.
    fn fit_key(self, key: &[u8]) -> SecureBytes {
        let mut fitted = vec![0u8; self.key_len()];
        let n = key.len().min(fitted.len());
        fitted[..n].copy_from_slice(&key[..n]);
        SecureBytes::new(fitted)
    }

    /// Encrypt a single block (ECB-style), used to derive the HIDE session
    /// key from the challenge token.
    pub fn encrypt_block(self, key: &[u8], block: &[u8]) -> Result<Vec<u8>, CipherError> {
        if block.len() != self.block_size() {
            return Err(CipherError::BlockAlignment);
        }
        match self {
            Self::Aes128Cbc => {
                let fitted = self.fit_key(key);
                let cipher = Aes128::new(GenericArray::from_slice(fitted.as_slice()));
                let mut buf = GenericArray::clone_from_slice(block);
                cipher.encrypt_block(&mut buf);
                Ok(buf.to_vec())
            }
        }
    }
}

enum EncInner {
    Aes128 { cipher: Aes128, chain: [u8; 16] },
}

/// Streaming CBC encryptor with explicit chain state.
pub struct CbcEncryptor(EncInner);

impl CbcEncryptor {
    /// Chain state starts at the all-zero IV.
    pub fn new(algorithm: CipherAlgorithm, key: &[u8]) -> Self {
        match algorithm {
            CipherAlgorithm::Aes128Cbc => {
                let fitted = algorithm.fit_key(key);
                let cipher = Aes128::new(GenericArray::from_slice(fitted.as_slice()));
                Self(EncInner::Aes128 {
                    cipher,
                    chain: [0u8; 16],
                })
            }
        }
    }

    pub fn block_size(&self) -> usize {
        match &self.0 {
            EncInner::Aes128 { .. } => 16,
        }
    }

    /// Encrypt whole blocks in place. Chain state carries over between
    /// calls, so a stream may be encrypted in arbitrary block-aligned chunks.
    pub fn encrypt_blocks(&mut self, data: &mut [u8]) -> Result<(), CipherError> {
        match &mut self.0 {
            EncInner::Aes128 { cipher, chain } => {
                if data.len() % 16 != 0 {
                    return Err(CipherError::BlockAlignment);
                }
                for block in data.chunks_exact_mut(16) {
                    for (b, c) in block.iter_mut().zip(chain.iter()) {
                        *b ^= c;
                    }
                    let buf = GenericArray::from_mut_slice(block);
                    cipher.encrypt_block(buf);
                    chain.copy_from_slice(block);
                }
                Ok(())
            }
        }
    }
}

enum DecInner {
    Aes128 { cipher: Aes128, chain: [u8; 16] },
}

/// Streaming CBC decryptor with explicit chain state.
pub struct CbcDecryptor(DecInner);

impl CbcDecryptor {
    /// Chain state starts at the all-zero IV.
    pub fn new(algorithm: CipherAlgorithm, key: &[u8]) -> Self {
        match algorithm {
            CipherAlgorithm::Aes128Cbc => {
                let fitted = algorithm.fit_key(key);
                let cipher = Aes128::new(GenericArray::from_slice(fitted.as_slice()));
                Self(DecInner::Aes128 {
                    cipher,
                    chain: [0u8; 16],
                })
            }
        }
    }

    pub fn block_size(&self) -> usize {
        match &self.0 {
            DecInner::Aes128 { .. } => 16,
        }
    }

    /// Decrypt whole blocks in place. Chain state carries over between calls.
    pub fn decrypt_blocks(&mut self, data: &mut [u8]) -> Result<(), CipherError> {
        match &mut self.0 {
            DecInner::Aes128 { cipher, chain } => {
                if data.len() % 16 != 0 {
                    return Err(CipherError::BlockAlignment);
                }
                let mut next_chain = [0u8; 16];
                for block in data.chunks_exact_mut(16) {
                    next_chain.copy_from_slice(block);
                    let buf = GenericArray::from_mut_slice(block);
                    cipher.decrypt_block(buf);
                    for (b, c) in block.iter_mut().zip(chain.iter()) {
                        *b ^= c;
                    }
                    chain.copy_from_slice(&next_chain);
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_algorithm_names() {
        assert_eq!(
            CipherAlgorithm::from_wire("AES-128-CBC"),
            Some(CipherAlgorithm::Aes128Cbc)
        );
        assert_eq!(CipherAlgorithm::from_wire("DES"), None);
        assert_eq!(CipherAlgorithm::Aes128Cbc.block_size(), 16);
    }

    // FIPS-197 appendix C.1
    #[test]
    fn test_aes128_known_answer() {
        let key = hex::decode("000102030405060708090a0b0c0d0e0f").unwrap();
        let plaintext = hex::decode("00112233445566778899aabbccddeeff").unwrap();
        let ct = CipherAlgorithm::Aes128Cbc
            .encrypt_block(&key, &plaintext)
            .unwrap();
        assert_eq!(hex::encode(ct), "69c4e0d86a7b0430d8cdb78070b4c55a");
    }

    #[test]
    fn test_encrypt_block_rejects_partial_block() {
        let err = CipherAlgorithm::Aes128Cbc.encrypt_block(b"key", b"short");
        assert_eq!(err, Err(CipherError::BlockAlignment));
    }

    #[test]
    fn test_cbc_roundtrip() {
        let key = b"sixteen-byte-key";
        let mut data = b"SEQ:0,1513833032,1,0\nDICT:0,C,100,".to_vec();
        data.resize(48, b'\n');

        let mut enc = CbcEncryptor::new(CipherAlgorithm::Aes128Cbc, key);
        let mut ct = data.clone();
        enc.encrypt_blocks(&mut ct).unwrap();
        assert_ne!(ct, data);

        let mut dec = CbcDecryptor::new(CipherAlgorithm::Aes128Cbc, key);
        dec.decrypt_blocks(&mut ct).unwrap();
        assert_eq!(ct, data);
    }

    #[test]
    fn test_cbc_chain_state_spans_calls() {
        let key = b"k";
        let mut whole = vec![0xabu8; 64];

        let mut enc = CbcEncryptor::new(CipherAlgorithm::Aes128Cbc, key);
        enc.encrypt_blocks(&mut whole).unwrap();

        let mut split = vec![0xabu8; 64];
        let mut enc2 = CbcEncryptor::new(CipherAlgorithm::Aes128Cbc, key);
        let (first, second) = split.split_at_mut(16);
        enc2.encrypt_blocks(first).unwrap();
        enc2.encrypt_blocks(second).unwrap();

        assert_eq!(whole, split);
    }

    #[test]
    fn test_cbc_alignment_enforced() {
        let mut enc = CbcEncryptor::new(CipherAlgorithm::Aes128Cbc, b"k");
        let mut data = vec![0u8; 17];
        assert_eq!(
            enc.encrypt_blocks(&mut data),
            Err(CipherError::BlockAlignment)
        );
    }
}
