//! Line grammar: `TAG:payload` commands, hello lines and data lines
//!
//! Parsing here is strict on shape (arity, integer syntax, UTF-8) and
//! permissive on semantics: a `SEQ` with a zero divisor parses fine and is
//! rejected by the sequence model, while a line with the wrong field count
//! is malformed and fatal to the session.

/// Wire parse errors; all of them surface as `REJ:malformed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    NotUtf8,
    UnknownTag(String),
    Malformed(&'static str),
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotUtf8 => write!(f, "line is not valid UTF-8"),
            Self::UnknownTag(tag) => write!(f, "unknown command tag '{}'", tag),
            Self::Malformed(what) => write!(f, "malformed line: {}", what),
        }
    }
}

impl std::error::Error for WireError {}

/// Protocol version as carried in hello lines (`S4PP/<major>.<minor>`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

impl Version {
    pub const V1_0: Version = Version { major: 1, minor: 0 };
    pub const V1_2: Version = Version { major: 1, minor: 2 };

    pub fn parse(s: &str) -> Option<Self> {
        let (major, minor) = s.split_once('.')?;
        Some(Self {
            major: major.parse().ok()?,
            minor: minor.parse().ok()?,
        })
    }

    /// Hide algorithm lists appear in hellos from 1.2 on.
    pub fn has_hide_field(self) -> bool {
        self >= Self::V1_2
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// A raw hello line: version plus the remaining space-separated fields.
///
/// Server and client hellos share the `S4PP/<ver>` shape but differ in field
/// count, and 1.0/1.1 hellos omit the hide list, so interpretation is left
/// to the role engines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloLine {
    pub version: Version,
    pub fields: Vec<String>,
}

/// One parsed wire line, either direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Hello(HelloLine),
    Token(String),
    Auth {
        algorithm: String,
        keyid: String,
        mac_hex: String,
    },
    Seq {
        seqid: u64,
        basetime: i64,
        time_divisor: i64,
        data_format: u32,
    },
    Dict {
        idx: u32,
        unit: String,
        unit_divisor: i64,
        name: String,
    },
    /// A sample line: dictionary index plus the format-specific fields
    /// (delta, optional span, values) left uninterpreted.
    Data { idx: u32, rest: Vec<String> },
    Sig(String),
    Hide {
        algorithm: String,
        block_size: Option<usize>,
    },
    Ok(u64),
    Nok(u64),
    Rej(String),
    Ntfy(String),
    /// Zero bytes before the LF; a no-op outside special contexts.
    Empty,
}

impl Command {
    /// Parse one framed line (without its LF).
    pub fn parse(line: &[u8]) -> Result<Command, WireError> {
        if line.is_empty() {
            return Ok(Command::Empty);
        }
        let text = std::str::from_utf8(line).map_err(|_| WireError::NotUtf8)?;

        // Data lines lead with the dictionary index, so a leading digit is
        // enough to classify before any tag handling.
        if text.as_bytes()[0].is_ascii_digit() {
            return parse_data(text);
        }

        if let Some(rest) = text.strip_prefix("S4PP/") {
            return parse_hello(rest);
        }

        let (tag, payload) = text
            .split_once(':')
            .ok_or(WireError::Malformed("missing command separator"))?;

        match tag {
            "TOK" => Ok(Command::Token(payload.to_string())),
            "AUTH" => parse_auth(payload),
            "SEQ" => parse_seq(payload),
            "DICT" => parse_dict(payload),
            "SIG" => {
                if payload.is_empty() {
                    return Err(WireError::Malformed("empty signature"));
                }
                Ok(Command::Sig(payload.to_string()))
            }
            "HIDE" => parse_hide(payload),
            "OK" => Ok(Command::Ok(parse_int(payload)?)),
            "NOK" => Ok(Command::Nok(parse_int(payload)?)),
            "REJ" => Ok(Command::Rej(payload.to_string())),
            "NTFY" => Ok(Command::Ntfy(payload.to_string())),
            _ => Err(WireError::UnknownTag(tag.to_string())),
        }
    }
}

fn parse_int<T: std::str::FromStr>(s: &str) -> Result<T, WireError> {
    s.parse().map_err(|_| WireError::Malformed("bad integer"))
}

fn parse_hello(rest: &str) -> Result<Command, WireError> {
    let mut parts = rest.split(' ');
    let version = parts
        .next()
        .and_then(Version::parse)
        .ok_or(WireError::Malformed("bad hello version"))?;
    let fields: Vec<String> = parts.map(str::to_string).collect();
    if fields.is_empty() {
        return Err(WireError::Malformed("hello without algorithm list"));
    }
    Ok(Command::Hello(HelloLine { version, fields }))
}

fn parse_auth(payload: &str) -> Result<Command, WireError> {
    let mut parts = payload.splitn(3, ',');
    let (algorithm, keyid, mac_hex) = match (parts.next(), parts.next(), parts.next()) {
        (Some(a), Some(k), Some(m)) => (a, k, m),
        _ => return Err(WireError::Malformed("AUTH needs algo,keyid,hmac")),
    };
    if algorithm.is_empty() || keyid.is_empty() || mac_hex.is_empty() {
        return Err(WireError::Malformed("AUTH field empty"));
    }
    Ok(Command::Auth {
        algorithm: algorithm.to_string(),
        keyid: keyid.to_string(),
        mac_hex: mac_hex.to_string(),
    })
}

fn parse_seq(payload: &str) -> Result<Command, WireError> {
    let parts: Vec<&str> = payload.split(',').collect();
    if parts.len() != 4 {
        return Err(WireError::Malformed("SEQ needs 4 fields"));
    }
    Ok(Command::Seq {
        seqid: parse_int(parts[0])?,
        basetime: parse_int(parts[1])?,
        time_divisor: parse_int(parts[2])?,
        data_format: parse_int(parts[3])?,
    })
}

fn parse_dict(payload: &str) -> Result<Command, WireError> {
    // Names and units must not contain commas, so the arity check doubles as
    // the comma rule.
    let parts: Vec<&str> = payload.split(',').collect();
    if parts.len() != 4 {
        return Err(WireError::Malformed("DICT needs 4 fields"));
    }
    Ok(Command::Dict {
        idx: parse_int(parts[0])?,
        unit: parts[1].to_string(),
        unit_divisor: parse_int(parts[2])?,
        name: parts[3].to_string(),
    })
}

fn parse_data(text: &str) -> Result<Command, WireError> {
    let mut parts = text.split(',');
    let idx = parts
        .next()
        .and_then(|p| p.parse().ok())
        .ok_or(WireError::Malformed("bad sample index"))?;
    let rest: Vec<String> = parts.map(str::to_string).collect();
    if rest.len() < 2 {
        return Err(WireError::Malformed("sample line too short"));
    }
    Ok(Command::Data { idx, rest })
}

fn parse_hide(payload: &str) -> Result<Command, WireError> {
    let parts: Vec<&str> = payload.split(',').collect();
    match parts.as_slice() {
        [algorithm] if !algorithm.is_empty() => Ok(Command::Hide {
            algorithm: algorithm.to_string(),
            block_size: None,
        }),
        [algorithm, block] if !algorithm.is_empty() => Ok(Command::Hide {
            algorithm: algorithm.to_string(),
            block_size: Some(parse_int(block)?),
        }),
        _ => Err(WireError::Malformed("HIDE needs algo[,blocksize]")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_server_hello_1_2() {
        let cmd = Command::parse(b"S4PP/1.2 SHA256 2000 -").unwrap();
        match cmd {
            Command::Hello(h) => {
                assert_eq!(h.version, Version::V1_2);
                assert_eq!(h.fields, vec!["SHA256", "2000", "-"]);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_server_hello_1_0_short_form() {
        let cmd = Command::parse(b"S4PP/1.0 SHA256 2000").unwrap();
        match cmd {
            Command::Hello(h) => {
                assert_eq!(h.version, Version::V1_0);
                assert!(!h.version.has_hide_field());
                assert_eq!(h.fields.len(), 2);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_auth() {
        let cmd = Command::parse(b"AUTH:SHA256,1234,deadbeef").unwrap();
        assert_eq!(
            cmd,
            Command::Auth {
                algorithm: "SHA256".into(),
                keyid: "1234".into(),
                mac_hex: "deadbeef".into(),
            }
        );
    }

    #[test]
    fn test_parse_seq() {
        let cmd = Command::parse(b"SEQ:0,1513833032,1,0").unwrap();
        assert_eq!(
            cmd,
            Command::Seq {
                seqid: 0,
                basetime: 1513833032,
                time_divisor: 1,
                data_format: 0,
            }
        );
    }

    #[test]
    fn test_parse_seq_zero_divisor_is_shape_valid() {
        // Semantic rejection happens in the sequence model, not the parser
        assert!(Command::parse(b"SEQ:1,0,0,0").is_ok());
    }

    #[test]
    fn test_parse_dict_empty_unit_ok() {
        let cmd = Command::parse(b"DICT:0,,1,count").unwrap();
        assert_eq!(
            cmd,
            Command::Dict {
                idx: 0,
                unit: String::new(),
                unit_divisor: 1,
                name: "count".into(),
            }
        );
    }

    #[test]
    fn test_parse_dict_comma_in_name_is_malformed() {
        assert!(matches!(
            Command::parse(b"DICT:0,C,100,temp,erature"),
            Err(WireError::Malformed(_))
        ));
    }

    #[test]
    fn test_parse_data_format0() {
        let cmd = Command::parse(b"0,0,2561").unwrap();
        assert_eq!(
            cmd,
            Command::Data {
                idx: 0,
                rest: vec!["0".into(), "2561".into()],
            }
        );
    }

    #[test]
    fn test_parse_data_negative_delta_and_nan() {
        let cmd = Command::parse(b"3,-5,NaN,+Inf").unwrap();
        assert_eq!(
            cmd,
            Command::Data {
                idx: 3,
                rest: vec!["-5".into(), "NaN".into(), "+Inf".into()],
            }
        );
    }

    #[test]
    fn test_parse_hide_forms() {
        assert_eq!(
            Command::parse(b"HIDE:AES-128-CBC").unwrap(),
            Command::Hide {
                algorithm: "AES-128-CBC".into(),
                block_size: None,
            }
        );
        assert_eq!(
            Command::parse(b"HIDE:AES-128-CBC,16").unwrap(),
            Command::Hide {
                algorithm: "AES-128-CBC".into(),
                block_size: Some(16),
            }
        );
    }

    #[test]
    fn test_parse_replies() {
        assert_eq!(Command::parse(b"OK:7").unwrap(), Command::Ok(7));
        assert_eq!(Command::parse(b"NOK:7").unwrap(), Command::Nok(7));
        assert_eq!(
            Command::parse(b"REJ:bad signature").unwrap(),
            Command::Rej("bad signature".into())
        );
    }

    #[test]
    fn test_empty_line() {
        assert_eq!(Command::parse(b"").unwrap(), Command::Empty);
    }

    #[test]
    fn test_unknown_tag() {
        assert_eq!(
            Command::parse(b"FOO:bar"),
            Err(WireError::UnknownTag("FOO".into()))
        );
    }

    #[test]
    fn test_not_utf8() {
        assert_eq!(Command::parse(b"SEQ:\xff\xfe"), Err(WireError::NotUtf8));
    }
}
