//! LF line framing for the S4PP byte stream
//!
//! Slices an incoming byte stream into LF-delimited lines. CR is forbidden
//! anywhere in the stream and surfaces as a framing error.

/// Framing errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingError {
    /// A CR (0x0D) byte appeared in the stream
    CarriageReturn,
    /// More bytes buffered without an LF than the configured line limit
    LineTooLong,
}

impl std::fmt::Display for FramingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CarriageReturn => write!(f, "carriage return in stream"),
            Self::LineTooLong => write!(f, "line exceeds maximum length"),
        }
    }
}

impl std::error::Error for FramingError {}

/// Incremental LF line framer.
///
/// Feed arbitrary byte chunks with [`extend`](Self::extend), then drain
/// complete lines with [`next_line`](Self::next_line). Lines are returned
/// without their terminating LF. The framer is restartable at any byte
/// boundary: buffered bytes that have not yet formed a line can be pulled
/// back out with [`take_unparsed`](Self::take_unparsed), which is how the
/// server re-frames the stream when HIDE activates mid-chunk.
#[derive(Debug)]
pub struct LineFramer {
    buf: Vec<u8>,
    /// Bytes of `buf` already scanned for CR/LF.
    scanned: usize,
    max_line: usize,
}

impl LineFramer {
    pub fn new(max_line: usize) -> Self {
        Self {
            buf: Vec::new(),
            scanned: 0,
            max_line,
        }
    }

    /// Append raw bytes to the framing buffer.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pop the next complete line, if one is buffered.
    ///
    /// Returns `Ok(None)` when more bytes are needed. Once an error is
    /// returned the session is expected to tear down; the framer does not
    /// resynchronise past a CR.
    pub fn next_line(&mut self) -> Result<Option<Vec<u8>>, FramingError> {
        for i in self.scanned..self.buf.len() {
            match self.buf[i] {
                b'\r' => return Err(FramingError::CarriageReturn),
                b'\n' => {
                    if i > self.max_line {
                        return Err(FramingError::LineTooLong);
                    }
                    let line = self.buf[..i].to_vec();
                    self.buf.drain(..=i);
                    self.scanned = 0;
                    return Ok(Some(line));
                }
                _ => {}
            }
        }

        self.scanned = self.buf.len();
        if self.buf.len() > self.max_line {
            return Err(FramingError::LineTooLong);
        }
        Ok(None)
    }

    /// Drain the bytes that have not yet formed a complete line.
    ///
    /// Used when the byte stream changes framing mid-session: after a `HIDE`
    /// command is accepted, everything already buffered past that line is
    /// ciphertext and must go through the HIDE framer instead.
    pub fn take_unparsed(&mut self) -> Vec<u8> {
        self.scanned = 0;
        std::mem::take(&mut self.buf)
    }

    /// Number of buffered bytes not yet emitted as lines.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}
