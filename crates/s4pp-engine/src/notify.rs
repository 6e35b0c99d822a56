//! Notification subsystem
//!
//! Server-originated, one-way, best-effort advisories. Codes 0 (time
//! service), 1 (firmware advisory) and 2 (flag bitfields) are allocated;
//! 3-99 are reserved and 100 up are vendor space. Receivers drop codes they
//! do not recognise without any state change. Only the comma form is ever
//! emitted.

use serde::{Deserialize, Serialize};

use s4pp_sdk::WallClock;

/// A recognised notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Notification {
    /// `NTFY:0,<utc_sec>[,<utc_ms>]`; the seconds field may instead carry a
    /// decimal fraction when the millisecond field is omitted.
    Time { utc_sec: u64, utc_ms: u32 },
    /// `NTFY:1,<version>[,<url>]`
    Firmware { version: String, url: Option<String> },
    /// `NTFY:2,<setflags>,<clearflags>`, lowercase hex, up to 128 bits
    Flags { set: u128, clear: u128 },
}

impl Notification {
    /// Current time from a wall clock.
    pub fn time_now(clock: &dyn WallClock) -> Self {
        let (utc_sec, utc_ms) = clock.now_utc();
        Self::Time { utc_sec, utc_ms }
    }

    /// Parse an `NTFY` payload. Returns `None` for unknown codes and for
    /// recognised codes whose arguments do not decode; either way the
    /// receiver carries on unchanged.
    pub fn parse(payload: &str) -> Option<Self> {
        let mut parts = payload.split(',');
        let code: u32 = parts.next()?.parse().ok()?;
        let args: Vec<&str> = parts.collect();
        match code {
            0 => parse_time(&args),
            1 => parse_firmware(&args),
            2 => parse_flags(&args),
            _ => None,
        }
    }

    /// Render the payload in the canonical comma form (without the `NTFY:`
    /// prefix or LF).
    pub fn encode(&self) -> String {
        match self {
            Self::Time { utc_sec, utc_ms } => format!("0,{},{}", utc_sec, utc_ms),
            Self::Firmware { version, url } => match url {
                Some(url) => format!("1,{},{}", version, url),
                None => format!("1,{}", version),
            },
            Self::Flags { set, clear } => format!("2,{:x},{:x}", set, clear),
        }
    }
}

fn parse_time(args: &[&str]) -> Option<Notification> {
    match args {
        [sec] => {
            // Fractional-seconds form: "1234.5" carries the milliseconds in
            // the fraction.
            if let Some((whole, frac)) = sec.split_once('.') {
                if frac.is_empty() || frac.len() > 9 || !frac.bytes().all(|b| b.is_ascii_digit()) {
                    return None;
                }
                let mut ms_digits = frac.to_string();
                ms_digits.truncate(3);
                while ms_digits.len() < 3 {
                    ms_digits.push('0');
                }
                Some(Notification::Time {
                    utc_sec: whole.parse().ok()?,
                    utc_ms: ms_digits.parse().ok()?,
                })
            } else {
                Some(Notification::Time {
                    utc_sec: sec.parse().ok()?,
                    utc_ms: 0,
                })
            }
        }
        [sec, ms] => Some(Notification::Time {
            utc_sec: sec.parse().ok()?,
            utc_ms: ms.parse().ok()?,
        }),
        _ => None,
    }
}

fn parse_firmware(args: &[&str]) -> Option<Notification> {
    match args {
        [version] if !version.is_empty() => Some(Notification::Firmware {
            version: (*version).to_string(),
            url: None,
        }),
        [version, url] if !version.is_empty() => Some(Notification::Firmware {
            version: (*version).to_string(),
            url: Some((*url).to_string()),
        }),
        _ => None,
    }
}

fn parse_flags(args: &[&str]) -> Option<Notification> {
    match args {
        [set, clear] => Some(Notification::Flags {
            set: parse_bits(set)?,
            clear: parse_bits(clear)?,
        }),
        _ => None,
    }
}

/// Up to 128 bits of lowercase hex, no sign, no prefix.
fn parse_bits(field: &str) -> Option<u128> {
    if field.is_empty() || field.len() > 32 {
        return None;
    }
    if !field
        .bytes()
        .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    {
        return None;
    }
    u128::from_str_radix(field, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_forms() {
        assert_eq!(
            Notification::parse("0,1513833032"),
            Some(Notification::Time { utc_sec: 1513833032, utc_ms: 0 })
        );
        assert_eq!(
            Notification::parse("0,1513833032,250"),
            Some(Notification::Time { utc_sec: 1513833032, utc_ms: 250 })
        );
        assert_eq!(
            Notification::parse("0,1513833032.5"),
            Some(Notification::Time { utc_sec: 1513833032, utc_ms: 500 })
        );
    }

    #[test]
    fn test_time_encode_is_comma_form() {
        let n = Notification::Time { utc_sec: 10, utc_ms: 5 };
        assert_eq!(n.encode(), "0,10,5");
    }

    #[test]
    fn test_firmware() {
        assert_eq!(
            Notification::parse("1,2.4.1"),
            Some(Notification::Firmware { version: "2.4.1".into(), url: None })
        );
        assert_eq!(
            Notification::parse("1,7,https://example.com/fw.bin"),
            Some(Notification::Firmware {
                version: "7".into(),
                url: Some("https://example.com/fw.bin".into()),
            })
        );
    }

    #[test]
    fn test_flags() {
        assert_eq!(
            Notification::parse("2,1b,4"),
            Some(Notification::Flags { set: 0x1b, clear: 0x4 })
        );
        // Emitted without zero padding, lowercase
        let n = Notification::Flags { set: 0x1b, clear: 0x4 };
        assert_eq!(n.encode(), "2,1b,4");
        // Uppercase hex is not the wire form
        assert_eq!(Notification::parse("2,1B,4"), None);
        // More than 128 bits cannot be represented
        assert_eq!(Notification::parse(&format!("2,{},0", "f".repeat(33))), None);
    }

    #[test]
    fn test_unknown_codes_dropped() {
        assert_eq!(Notification::parse("9999,whatever"), None);
        assert_eq!(Notification::parse("3,reserved"), None);
        assert_eq!(Notification::parse("100,vendor,stuff"), None);
        assert_eq!(Notification::parse("junk"), None);
    }
}
