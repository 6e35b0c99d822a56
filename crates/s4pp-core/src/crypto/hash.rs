//! Named hash algorithms and HMAC over them
//!
//! Thin capability adapter over the RustCrypto digest crates. Algorithms are
//! negotiated by wire name at session setup and resolved into concrete
//! contexts held on the session; unknown names on receipt surface as rejects
//! at the engine layer.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

/// Hash capability errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashError {
    /// Algorithm name not implemented here
    UnknownAlgorithm(String),
    /// The primitive rejected the key material
    InvalidKey,
}

impl std::fmt::Display for HashError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownAlgorithm(name) => write!(f, "unknown hash algorithm '{}'", name),
            Self::InvalidKey => write!(f, "key rejected by HMAC primitive"),
        }
    }
}

impl std::error::Error for HashError {}

/// Hash algorithms this implementation speaks. SHA256 is mandatory per
/// protocol; the enum leaves room for negotiating others.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha256,
}

impl HashAlgorithm {
    /// All supported algorithms in preference order.
    pub const SUPPORTED: &'static [HashAlgorithm] = &[HashAlgorithm::Sha256];

    /// Resolve a wire algorithm name. Matching is exact; the protocol
    /// transmits algorithm names case-sensitively.
    pub fn from_wire(name: &str) -> Option<Self> {
        match name {
            "SHA256" => Some(Self::Sha256),
            _ => None,
        }
    }

    pub fn wire_name(self) -> &'static str {
        match self {
            Self::Sha256 => "SHA256",
        }
    }

    pub fn digest_len(self) -> usize {
        match self {
            Self::Sha256 => 32,
        }
    }
}

enum HashInner {
    Sha256(Sha256),
}

/// Incremental hash context
pub struct HashCtx(HashInner);

impl HashCtx {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        match algorithm {
            HashAlgorithm::Sha256 => Self(HashInner::Sha256(Sha256::new())),
        }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        match &mut self.0 {
            HashInner::Sha256(ctx) => ctx.update(bytes),
        }
    }

    pub fn finalize(self) -> Vec<u8> {
        match self.0 {
            HashInner::Sha256(ctx) => ctx.finalize().to_vec(),
        }
    }
}

enum HmacInner {
    Sha256(Hmac<Sha256>),
}

/// Incremental HMAC context
///
/// Owned exclusively by one session; never shared across sessions.
pub struct HmacCtx(HmacInner);

impl HmacCtx {
    pub fn new(algorithm: HashAlgorithm, key: &[u8]) -> Result<Self, HashError> {
        match algorithm {
            HashAlgorithm::Sha256 => {
                let mac =
                    <Hmac<Sha256> as Mac>::new_from_slice(key).map_err(|_| HashError::InvalidKey)?;
                Ok(Self(HmacInner::Sha256(mac)))
            }
        }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        match &mut self.0 {
            HmacInner::Sha256(mac) => mac.update(bytes),
        }
    }

    pub fn finalize(self) -> Vec<u8> {
        match self.0 {
            HmacInner::Sha256(mac) => mac.finalize().into_bytes().to_vec(),
        }
    }
}
