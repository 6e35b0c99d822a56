//! Session negotiation model shared by both roles
//!
//! Hello lines carry the negotiated parameters: protocol version, hash
//! algorithm list, the server's per-sequence sample cap and (from 1.2) the
//! hide cipher list. 1.0/1.1 hellos omit the hide field; both forms parse.

use s4pp_core::crypto::hash::HashAlgorithm;
use s4pp_core::wire::{HelloLine, Version, WireError};

/// The protocol version this implementation speaks.
pub const PROTOCOL_VERSION: Version = Version::V1_2;

/// Render an algorithm list for a hello line: comma-separated, or a single
/// `-` when empty.
pub fn algo_csv<I: IntoIterator<Item = &'static str>>(names: I) -> String {
    let joined: Vec<&str> = names.into_iter().collect();
    if joined.is_empty() {
        "-".to_string()
    } else {
        joined.join(",")
    }
}

/// Parse an algorithm list field; `-` means empty.
pub fn parse_algo_csv(field: &str) -> Vec<String> {
    if field == "-" {
        Vec::new()
    } else {
        field.split(',').map(str::to_string).collect()
    }
}

/// Negotiated parameters from a server hello.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHello {
    pub version: Version,
    pub hash_algos: Vec<String>,
    pub max_samples: u32,
    pub hide_algos: Vec<String>,
}

impl ServerHello {
    /// Interpret a raw hello line as a server hello:
    /// `S4PP/<ver> <hash-csv> <max-samples>[ <hide-csv-or-dash>]`.
    pub fn from_hello_line(hello: &HelloLine) -> Result<Self, WireError> {
        let expected = if hello.version.has_hide_field() { 3 } else { 2 };
        if hello.fields.len() != expected {
            return Err(WireError::Malformed("server hello field count"));
        }
        let max_samples = hello.fields[1]
            .parse()
            .map_err(|_| WireError::Malformed("bad max-samples"))?;
        let hide_algos = if hello.version.has_hide_field() {
            parse_algo_csv(&hello.fields[2])
        } else {
            Vec::new()
        };
        Ok(Self {
            version: hello.version,
            hash_algos: parse_algo_csv(&hello.fields[0]),
            max_samples,
            hide_algos,
        })
    }
}

/// Parameters from an optional client hello.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHello {
    pub version: Version,
    pub hash_algos: Vec<String>,
    pub hide_algos: Vec<String>,
}

impl ClientHello {
    /// Interpret a raw hello line as a client hello:
    /// `S4PP/<ver> <hash-csv>[ <hide-csv-or-dash>]` (no max-samples field).
    pub fn from_hello_line(hello: &HelloLine) -> Result<Self, WireError> {
        let expected = if hello.version.has_hide_field() { 2 } else { 1 };
        if hello.fields.len() != expected {
            return Err(WireError::Malformed("client hello field count"));
        }
        let hide_algos = if hello.version.has_hide_field() {
            parse_algo_csv(&hello.fields[1])
        } else {
            Vec::new()
        };
        Ok(Self {
            version: hello.version,
            hash_algos: parse_algo_csv(&hello.fields[0]),
            hide_algos,
        })
    }
}

/// Pick the first of `ours` (in preference order) that the peer also lists.
pub fn choose_hash(ours: &[HashAlgorithm], peer: &[String]) -> Option<HashAlgorithm> {
    ours.iter()
        .copied()
        .find(|algo| peer.iter().any(|name| name == algo.wire_name()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use s4pp_core::wire::Command;

    fn hello_line(bytes: &[u8]) -> HelloLine {
        match Command::parse(bytes).unwrap() {
            Command::Hello(h) => h,
            other => panic!("not a hello: {:?}", other),
        }
    }

    #[test]
    fn test_server_hello_1_2() {
        let h = ServerHello::from_hello_line(&hello_line(b"S4PP/1.2 SHA256 2000 AES-128-CBC")).unwrap();
        assert_eq!(h.version, Version::V1_2);
        assert_eq!(h.hash_algos, vec!["SHA256"]);
        assert_eq!(h.max_samples, 2000);
        assert_eq!(h.hide_algos, vec!["AES-128-CBC"]);
    }

    #[test]
    fn test_server_hello_1_2_no_hide() {
        let h = ServerHello::from_hello_line(&hello_line(b"S4PP/1.2 SHA256 2000 -")).unwrap();
        assert!(h.hide_algos.is_empty());
    }

    #[test]
    fn test_server_hello_1_0() {
        let h = ServerHello::from_hello_line(&hello_line(b"S4PP/1.0 SHA256,SHA3 500")).unwrap();
        assert_eq!(h.hash_algos, vec!["SHA256", "SHA3"]);
        assert_eq!(h.max_samples, 500);
        assert!(h.hide_algos.is_empty());
    }

    #[test]
    fn test_server_hello_field_count_enforced() {
        assert!(ServerHello::from_hello_line(&hello_line(b"S4PP/1.2 SHA256 2000")).is_err());
        assert!(ServerHello::from_hello_line(&hello_line(b"S4PP/1.0 SHA256 2000 -")).is_err());
    }

    #[test]
    fn test_client_hello_forms() {
        let h = ClientHello::from_hello_line(&hello_line(b"S4PP/1.2 SHA256 -")).unwrap();
        assert_eq!(h.hash_algos, vec!["SHA256"]);
        assert!(h.hide_algos.is_empty());

        let h = ClientHello::from_hello_line(&hello_line(b"S4PP/1.1 SHA256")).unwrap();
        assert_eq!(h.hash_algos, vec!["SHA256"]);
    }

    #[test]
    fn test_algo_csv() {
        assert_eq!(algo_csv(["SHA256"]), "SHA256");
        assert_eq!(algo_csv([]), "-");
        assert_eq!(parse_algo_csv("-"), Vec::<String>::new());
        assert_eq!(parse_algo_csv("A,B"), vec!["A", "B"]);
    }

    #[test]
    fn test_choose_hash() {
        let ours = [HashAlgorithm::Sha256];
        assert_eq!(
            choose_hash(&ours, &["SHA256".into()]),
            Some(HashAlgorithm::Sha256)
        );
        assert_eq!(choose_hash(&ours, &["SHA3".into()]), None);
        assert_eq!(choose_hash(&ours, &[]), None);
    }
}
