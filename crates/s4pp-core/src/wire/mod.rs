//! Wire-level grammar for S4PP lines

pub mod command;

pub use command::{Command, HelloLine, Version, WireError};

/// Maximum accepted line length in bytes (the protocol mandates no limit;
/// overruns surface as a reject)
pub const MAX_LINE_LEN: usize = 8192;

/// Default raw length of generated challenge tokens (bytes)
pub const DEFAULT_TOKEN_BYTES: usize = 16;

/// Default cap on samples per sequence advertised by the server
pub const DEFAULT_MAX_SAMPLES: u32 = 2000;
