//! Protocol error taxonomy
//!
//! Umbrella over the per-module errors, carrying the two policy decisions
//! the role engines need: whether the condition kills the session or only
//! the in-flight sequence, and what detail string a `REJ` should carry.

use crate::crypto::hash::HashError;
use crate::framing::FramingError;
use crate::hide::HideError;
use crate::sequence::SequenceError;
use crate::token::TokenError;
use crate::wire::WireError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    Framing(FramingError),
    Wire(WireError),
    Token(TokenError),
    /// A command arrived in a session state that does not admit it
    OutOfOrder(&'static str),
    /// No hash algorithm shared with the peer; terminate without exchange
    NoCommonAlgorithm,
    /// AUTH named an algorithm this side does not speak
    UnknownAlgorithm(String),
    /// Unknown keyid or HMAC mismatch
    AuthFailed,
    Sequence(SequenceError),
    /// SIG did not match the computed sequence MAC
    BadSignature,
    Hide(HideError),
    Hash(HashError),
    /// The session is closed; no further exchange is possible
    Closed,
}

impl ProtocolError {
    /// Fatal errors close the session; the rest abort at most the in-flight
    /// sequence.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Framing(_)
            | Self::Wire(_)
            | Self::Token(_)
            | Self::OutOfOrder(_)
            | Self::NoCommonAlgorithm
            | Self::UnknownAlgorithm(_)
            | Self::AuthFailed
            | Self::Hash(_)
            | Self::Closed => true,
            Self::Sequence(e) => matches!(e, SequenceError::MalformedSample),
            Self::BadSignature | Self::Hide(_) => false,
        }
    }

    /// The detail string for the `REJ` line, when one is emitted at all.
    /// A missing common algorithm terminates without further exchange.
    pub fn reject_reason(&self) -> Option<String> {
        match self {
            Self::Framing(_) | Self::Wire(_) | Self::Token(_) | Self::OutOfOrder(_) => {
                Some("malformed".into())
            }
            Self::NoCommonAlgorithm | Self::Closed => None,
            Self::UnknownAlgorithm(_) | Self::AuthFailed | Self::Hash(_) => Some("auth".into()),
            Self::Sequence(e) => Some(match e {
                SequenceError::NotMonotonic(seqid) => seqid.to_string(),
                SequenceError::ZeroTimeDivisor | SequenceError::ZeroUnitDivisor => {
                    "divisor".into()
                }
                SequenceError::EmptyName | SequenceError::UnknownDictIndex(_) => "dict".into(),
                SequenceError::UnknownDataFormat(_) => "format".into(),
                SequenceError::NegativeSpan => "span".into(),
                SequenceError::TooManySamples => "too many samples".into(),
                SequenceError::MalformedSample => "malformed".into(),
                SequenceError::TimestampOverflow => "overflow".into(),
            }),
            Self::BadSignature => Some("bad signature".into()),
            Self::Hide(_) => Some("hide".into()),
        }
    }
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Framing(e) => write!(f, "framing error: {}", e),
            Self::Wire(e) => write!(f, "wire error: {}", e),
            Self::Token(e) => write!(f, "token error: {}", e),
            Self::OutOfOrder(what) => write!(f, "command out of order: {}", what),
            Self::NoCommonAlgorithm => write!(f, "no common hash algorithm"),
            Self::UnknownAlgorithm(name) => write!(f, "unsupported algorithm '{}'", name),
            Self::AuthFailed => write!(f, "authentication failed"),
            Self::Sequence(e) => write!(f, "sequence error: {}", e),
            Self::BadSignature => write!(f, "sequence signature mismatch"),
            Self::Hide(e) => write!(f, "hide error: {}", e),
            Self::Hash(e) => write!(f, "hash error: {}", e),
            Self::Closed => write!(f, "session is closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<FramingError> for ProtocolError {
    fn from(e: FramingError) -> Self {
        Self::Framing(e)
    }
}

impl From<WireError> for ProtocolError {
    fn from(e: WireError) -> Self {
        Self::Wire(e)
    }
}

impl From<TokenError> for ProtocolError {
    fn from(e: TokenError) -> Self {
        Self::Token(e)
    }
}

impl From<SequenceError> for ProtocolError {
    fn from(e: SequenceError) -> Self {
        Self::Sequence(e)
    }
}

impl From<HideError> for ProtocolError {
    fn from(e: HideError) -> Self {
        Self::Hide(e)
    }
}

impl From<HashError> for ProtocolError {
    fn from(e: HashError) -> Self {
        Self::Hash(e)
    }
}
