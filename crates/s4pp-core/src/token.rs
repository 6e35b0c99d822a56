//! Challenge token handling
//!
//! The server issues one challenge token per session as hex-encoded ASCII.
//! Both forms matter downstream: the transmitted ASCII (case preserved) is
//! part of the `AUTH` proof, while the raw decoded bytes seed every sequence
//! MAC and the HIDE key derivation.

/// Raw token length bounds in bytes
pub const MIN_TOKEN_BYTES: usize = 1;
pub const MAX_TOKEN_BYTES: usize = 127;

/// Token validation errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenError {
    Empty,
    TooLong,
    OddLength,
    NotHex,
}

impl std::fmt::Display for TokenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "challenge token is empty"),
            Self::TooLong => write!(f, "challenge token exceeds {} bytes", MAX_TOKEN_BYTES),
            Self::OddLength => write!(f, "challenge token has odd hex length"),
            Self::NotHex => write!(f, "challenge token contains non-hex characters"),
        }
    }
}

impl std::error::Error for TokenError {}

/// A validated challenge token, carrying both wire forms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeToken {
    ascii: String,
    raw: Vec<u8>,
}

impl ChallengeToken {
    /// Parse the hex payload of a `TOK:` line. Hex digits are accepted in
    /// either case; the transmitted form is preserved verbatim because the
    /// `AUTH` proof covers it as sent.
    pub fn from_wire(payload: &str) -> Result<Self, TokenError> {
        if payload.is_empty() {
            return Err(TokenError::Empty);
        }
        if payload.len() % 2 != 0 {
            return Err(TokenError::OddLength);
        }
        if payload.len() > MAX_TOKEN_BYTES * 2 {
            return Err(TokenError::TooLong);
        }
        if !payload.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(TokenError::NotHex);
        }

        let raw = hex::decode(payload).map_err(|_| TokenError::NotHex)?;
        Ok(Self {
            ascii: payload.to_string(),
            raw,
        })
    }

    /// The token exactly as transmitted.
    pub fn ascii(&self) -> &str {
        &self.ascii
    }

    /// The decoded raw bytes.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }
}
