//! Client role engine
//!
//! Sans-I/O state machine for the device side of a session. Each call that
//! emits protocol lines returns the exact bytes to hand to the transport;
//! once HIDE is active those bytes come out encrypted. The engine is
//! pipelined by design: after the token arrives nothing requires waiting
//! for the server, so `authenticate` plus a whole signed sequence can go
//! out in one transport write.

use s4pp_core::crypto::cipher::CipherAlgorithm;
use s4pp_core::crypto::hash::{HashAlgorithm, HmacCtx};
use s4pp_core::error::ProtocolError;
use s4pp_core::framing::LineFramer;
use s4pp_core::hide::{derive_session_key, HideError, HideWriter};
use s4pp_core::secure_memory::SecureBytes;
use s4pp_core::sequence::{Sequence, SequenceError, SequenceMac};
use s4pp_core::token::ChallengeToken;
use s4pp_core::wire::{self, Command, Version, WireError};

use crate::notify::Notification;
use crate::session::{algo_csv, choose_hash, ServerHello, PROTOCOL_VERSION};

/// Client-side identity and policy.
#[derive(Debug)]
pub struct ClientConfig {
    pub keyid: String,
    pub key: SecureBytes,
    /// Hash algorithms we speak, preference order
    pub hash_algos: Vec<HashAlgorithm>,
    /// Hide ciphers we are willing to use
    pub hide_algos: Vec<CipherAlgorithm>,
    pub max_line_len: usize,
}

impl ClientConfig {
    pub fn new(keyid: impl Into<String>, key: &[u8]) -> Self {
        Self {
            keyid: keyid.into(),
            key: SecureBytes::from_slice(key),
            hash_algos: HashAlgorithm::SUPPORTED.to_vec(),
            hide_algos: CipherAlgorithm::SUPPORTED.to_vec(),
            max_line_len: wire::MAX_LINE_LEN,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientState {
    AwaitingHello,
    AwaitingToken,
    /// Token cached; AUTH not yet emitted
    Ready,
    Authenticated,
    InSequence,
    Closed,
}

/// Something the server told us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    HelloReceived { version: Version, max_samples: u32 },
    TokenReceived,
    /// `OK:<seqid>`
    Committed(u64),
    /// `NOK:<seqid>`; the data was authentic but the collector could not
    /// store it, so the same id may be retried
    CommitFailed(u64),
    /// `REJ:<reason>`; the session is over
    Rejected(String),
    Notification(Notification),
}

struct InFlight {
    /// Client-side mirror of the sequence model, used to validate lines
    /// before they go on the wire.
    seq: Sequence,
    mac: SequenceMac,
}

/// One client session.
pub struct ClientEngine {
    config: ClientConfig,
    state: ClientState,
    framer: LineFramer,
    server: Option<ServerHello>,
    token: Option<ChallengeToken>,
    chosen_hash: Option<HashAlgorithm>,
    last_committed: Option<u64>,
    seq: Option<InFlight>,
    hide: Option<HideWriter>,
    hide_used: bool,
}

impl ClientEngine {
    pub fn new(config: ClientConfig) -> Self {
        let max_line = config.max_line_len;
        Self {
            config,
            state: ClientState::AwaitingHello,
            framer: LineFramer::new(max_line),
            server: None,
            token: None,
            chosen_hash: None,
            last_committed: None,
            seq: None,
            hide: None,
            hide_used: false,
        }
    }

    /// The optional client hello. If sent at all, send it first.
    pub fn client_hello(&self) -> Vec<u8> {
        let hashes = algo_csv(self.config.hash_algos.iter().map(|a| a.wire_name()));
        let hides = algo_csv(self.config.hide_algos.iter().map(|a| a.wire_name()));
        format!("S4PP/{} {} {}\n", PROTOCOL_VERSION, hashes, hides).into_bytes()
    }

    /// Feed received transport bytes, collecting server events.
    ///
    /// A missing common hash algorithm is an `Err`: the session must
    /// terminate immediately without further exchange.
    pub fn receive(&mut self, bytes: &[u8]) -> Result<Vec<ClientEvent>, ProtocolError> {
        if self.state == ClientState::Closed {
            return Err(ProtocolError::Closed);
        }
        self.framer.extend(bytes);

        let mut events = Vec::new();
        loop {
            let line = match self.framer.next_line() {
                Ok(Some(line)) => line,
                Ok(None) => return Ok(events),
                Err(e) => {
                    self.state = ClientState::Closed;
                    return Err(e.into());
                }
            };
            match self.handle_line(&line, &mut events) {
                Ok(()) => {}
                Err(e) => {
                    self.state = ClientState::Closed;
                    return Err(e);
                }
            }
            if self.state == ClientState::Closed {
                return Ok(events);
            }
        }
    }

    fn handle_line(
        &mut self,
        line: &[u8],
        events: &mut Vec<ClientEvent>,
    ) -> Result<(), ProtocolError> {
        match Command::parse(line)? {
            Command::Empty => Ok(()),
            Command::Hello(hello) => {
                if self.state != ClientState::AwaitingHello {
                    return Err(ProtocolError::OutOfOrder("repeated server hello"));
                }
                let hello = ServerHello::from_hello_line(&hello)?;
                let chosen = choose_hash(&self.config.hash_algos, &hello.hash_algos)
                    .ok_or(ProtocolError::NoCommonAlgorithm)?;
                tracing::debug!(version = %hello.version, algo = chosen.wire_name(), "server hello");
                events.push(ClientEvent::HelloReceived {
                    version: hello.version,
                    max_samples: hello.max_samples,
                });
                self.server = Some(hello);
                self.chosen_hash = Some(chosen);
                self.state = ClientState::AwaitingToken;
                Ok(())
            }
            Command::Token(payload) => {
                if self.state != ClientState::AwaitingToken {
                    return Err(ProtocolError::OutOfOrder("unexpected TOK"));
                }
                self.token = Some(ChallengeToken::from_wire(&payload)?);
                self.state = ClientState::Ready;
                events.push(ClientEvent::TokenReceived);
                Ok(())
            }
            Command::Ok(seqid) => {
                self.last_committed = Some(seqid);
                events.push(ClientEvent::Committed(seqid));
                Ok(())
            }
            Command::Nok(seqid) => {
                events.push(ClientEvent::CommitFailed(seqid));
                Ok(())
            }
            Command::Rej(reason) => {
                tracing::warn!(%reason, "server rejected session");
                events.push(ClientEvent::Rejected(reason));
                self.state = ClientState::Closed;
                Ok(())
            }
            Command::Ntfy(payload) => {
                match Notification::parse(&payload) {
                    Some(n) => events.push(ClientEvent::Notification(n)),
                    // Unknown codes are dropped without any state change
                    None => tracing::debug!(%payload, "ignoring unknown notification"),
                }
                Ok(())
            }
            Command::Auth { .. }
            | Command::Seq { .. }
            | Command::Dict { .. }
            | Command::Data { .. }
            | Command::Sig(_)
            | Command::Hide { .. } => Err(ProtocolError::OutOfOrder(
                "client-directional command from server",
            )),
        }
    }

    /// Build and emit the `AUTH` proof: HMAC over the keyid followed by the
    /// token in its transmitted ASCII form.
    pub fn authenticate(&mut self) -> Result<Vec<u8>, ProtocolError> {
        if self.state != ClientState::Ready {
            return Err(ProtocolError::OutOfOrder("AUTH without token"));
        }
        let algo = self
            .chosen_hash
            .ok_or(ProtocolError::NoCommonAlgorithm)?;
        let token = self
            .token
            .as_ref()
            .ok_or(ProtocolError::OutOfOrder("AUTH before TOK"))?;

        let mut mac = HmacCtx::new(algo, self.config.key.as_slice())?;
        mac.update(self.config.keyid.as_bytes());
        mac.update(token.ascii().as_bytes());
        let tag = mac.finalize();

        let line = format!(
            "AUTH:{},{},{}",
            algo.wire_name(),
            self.config.keyid,
            hex::encode(tag)
        );
        self.state = ClientState::Authenticated;
        self.emit(&line)
    }

    /// Open a sequence. The local model enforces the same rules the server
    /// will, so a sequence that leaves here is at least shape-valid.
    pub fn begin_sequence(
        &mut self,
        seqid: u64,
        basetime: i64,
        time_divisor: i64,
        data_format: u32,
    ) -> Result<Vec<u8>, ProtocolError> {
        if self.state != ClientState::Authenticated {
            return Err(ProtocolError::OutOfOrder("SEQ in wrong state"));
        }
        let algo = self
            .chosen_hash
            .ok_or(ProtocolError::NoCommonAlgorithm)?;
        let token = self
            .token
            .as_ref()
            .ok_or(ProtocolError::OutOfOrder("SEQ before TOK"))?;
        let max_samples = self.server.as_ref().map(|s| s.max_samples);

        let seq = Sequence::begin(
            seqid,
            basetime,
            time_divisor,
            data_format,
            self.last_committed,
            max_samples,
            false,
        )?;
        let mut mac = SequenceMac::begin(algo, self.config.key.as_slice(), token.raw())?;

        let line = format!("SEQ:{},{},{},{}", seqid, basetime, time_divisor, data_format);
        mac.feed_line(line.as_bytes());

        self.seq = Some(InFlight { seq, mac });
        self.state = ClientState::InSequence;
        self.emit(&line)
    }

    /// Define or redefine a dictionary entry for the open sequence.
    pub fn dict_entry(
        &mut self,
        idx: u32,
        unit: &str,
        unit_divisor: i64,
        name: &str,
    ) -> Result<Vec<u8>, ProtocolError> {
        field_ok(unit)?;
        field_ok(name)?;
        let inflight = self
            .seq
            .as_mut()
            .ok_or(ProtocolError::OutOfOrder("DICT outside sequence"))?;
        inflight
            .seq
            .put_dict_entry(idx, unit.to_string(), unit_divisor, name.to_string())?;

        let line = format!("DICT:{},{},{},{}", idx, unit, unit_divisor, name);
        inflight.mac.feed_line(line.as_bytes());
        self.emit(&line)
    }

    /// Emit one format-0 sample: `idx,delta_t,value`.
    pub fn sample(&mut self, idx: u32, delta_t: i64, value: &str) -> Result<Vec<u8>, ProtocolError> {
        field_ok(value)?;
        self.data_line(idx, &[delta_t.to_string(), value.to_string()])
    }

    /// Emit one format-1 sample: `idx,delta_t,span,value1[,value2...]`.
    pub fn span_sample(
        &mut self,
        idx: u32,
        delta_t: i64,
        span: i64,
        values: &[&str],
    ) -> Result<Vec<u8>, ProtocolError> {
        if values.is_empty() {
            return Err(SequenceError::MalformedSample.into());
        }
        for value in values {
            field_ok(value)?;
        }
        let mut fields = vec![delta_t.to_string(), span.to_string()];
        fields.extend(values.iter().map(|v| (*v).to_string()));
        self.data_line(idx, &fields)
    }

    fn data_line(&mut self, idx: u32, rest: &[String]) -> Result<Vec<u8>, ProtocolError> {
        let inflight = self
            .seq
            .as_mut()
            .ok_or(ProtocolError::OutOfOrder("sample outside sequence"))?;
        inflight.seq.ingest_sample(idx, rest)?;

        let line = format!("{},{}", idx, rest.join(","));
        inflight.mac.feed_line(line.as_bytes());
        self.emit(&line)
    }

    /// Close the open sequence with its `SIG` line. The SIG line is not fed
    /// to the sequence MAC; under HIDE the stream is padded out so the
    /// server sees the signature promptly.
    pub fn end_sequence(&mut self) -> Result<Vec<u8>, ProtocolError> {
        let inflight = self
            .seq
            .take()
            .ok_or(ProtocolError::OutOfOrder("SIG outside sequence"))?;
        self.state = ClientState::Authenticated;

        let tag = inflight.mac.finalize();
        let line = format!("SIG:{}", hex::encode(tag));
        let mut out = self.emit(&line)?;
        if let Some(writer) = &mut self.hide {
            let (ct, _pad) = writer.pad_flush().map_err(HideError::Cipher)?;
            out.extend(ct);
        }
        Ok(out)
    }

    /// Switch the outbound direction to HIDE.
    ///
    /// `salt` becomes the first encrypted line, which the server discards
    /// unparsed; it must not contain framing bytes. Random filler of about
    /// one block is the intended use.
    pub fn activate_hide(
        &mut self,
        algorithm: CipherAlgorithm,
        salt: &[u8],
    ) -> Result<Vec<u8>, ProtocolError> {
        if self.state == ClientState::InSequence {
            return Err(HideError::InsideSequence.into());
        }
        if self.state != ClientState::Authenticated {
            return Err(HideError::NotAuthenticated.into());
        }
        if self.hide_used {
            return Err(HideError::AlreadyActive.into());
        }
        if salt.iter().any(|&b| b == b'\n' || b == b'\r') {
            return Err(HideError::BadSalt.into());
        }
        let server = self
            .server
            .as_ref()
            .ok_or(ProtocolError::OutOfOrder("HIDE before hello"))?;
        if !server
            .hide_algos
            .iter()
            .any(|name| name == algorithm.wire_name())
        {
            return Err(HideError::UnknownCipher(algorithm.wire_name().to_string()).into());
        }
        let token = self
            .token
            .as_ref()
            .ok_or(ProtocolError::OutOfOrder("HIDE before TOK"))?;

        let session_key = derive_session_key(algorithm, self.config.key.as_slice(), token.raw())
            .map_err(HideError::Cipher)?;
        let mut writer = HideWriter::new(algorithm, &session_key);

        // The HIDE line itself travels in the clear; everything after is
        // ciphertext, starting with the salt line.
        let mut out = format!("HIDE:{}\n", algorithm.wire_name()).into_bytes();
        out.extend(writer.write_line(salt).map_err(HideError::Cipher)?);
        let (ct, _pad) = writer.pad_flush().map_err(HideError::Cipher)?;
        out.extend(ct);

        self.hide = Some(writer);
        self.hide_used = true;
        tracing::debug!(cipher = algorithm.wire_name(), "hide active");
        Ok(out)
    }

    /// Convenience for constrained uplinks: one buffer holding AUTH plus an
    /// entire signed format-0 sequence, pipelined without waiting for any
    /// server response.
    pub fn upload_batch(
        &mut self,
        seqid: u64,
        basetime: i64,
        time_divisor: i64,
        dict: &[(u32, &str, i64, &str)],
        samples: &[(u32, i64, &str)],
    ) -> Result<Vec<u8>, ProtocolError> {
        let mut out = self.authenticate()?;
        out.extend(self.begin_sequence(seqid, basetime, time_divisor, 0)?);
        for (idx, unit, unit_divisor, name) in dict {
            out.extend(self.dict_entry(*idx, unit, *unit_divisor, name)?);
        }
        for (idx, delta_t, value) in samples {
            out.extend(self.sample(*idx, *delta_t, value)?);
        }
        out.extend(self.end_sequence()?);
        Ok(out)
    }

    pub fn is_closed(&self) -> bool {
        self.state == ClientState::Closed
    }

    fn emit(&mut self, line: &str) -> Result<Vec<u8>, ProtocolError> {
        match &mut self.hide {
            Some(writer) => writer
                .write_line(line.as_bytes())
                .map_err(|e| HideError::Cipher(e).into()),
            None => {
                let mut bytes = line.as_bytes().to_vec();
                bytes.push(b'\n');
                Ok(bytes)
            }
        }
    }
}

/// Wire fields are comma-separated within LF-framed lines, so user-supplied
/// text must stay clear of both.
fn field_ok(field: &str) -> Result<(), ProtocolError> {
    if field.bytes().any(|b| b == b',' || b == b'\n' || b == b'\r') {
        return Err(WireError::Malformed("field contains framing bytes").into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOKEN_HEX: &str = "f8763c330bf5ed2feafaf56c484649bf";

    fn ready_client() -> ClientEngine {
        let mut client = ClientEngine::new(ClientConfig::new("1234", b"secret"));
        let events = client
            .receive(format!("S4PP/1.2 SHA256 2000 AES-128-CBC\nTOK:{}\n", TOKEN_HEX).as_bytes())
            .unwrap();
        assert_eq!(
            events,
            vec![
                ClientEvent::HelloReceived {
                    version: Version::V1_2,
                    max_samples: 2000,
                },
                ClientEvent::TokenReceived,
            ]
        );
        client
    }

    #[test]
    fn test_client_hello_shape() {
        let client = ClientEngine::new(ClientConfig::new("1234", b"secret"));
        assert_eq!(client.client_hello(), b"S4PP/1.2 SHA256 AES-128-CBC\n");
    }

    #[test]
    fn test_no_common_hash_terminates() {
        let mut client = ClientEngine::new(ClientConfig::new("1234", b"secret"));
        let err = client.receive(b"S4PP/1.2 SHA3 2000 -\n").unwrap_err();
        assert_eq!(err, ProtocolError::NoCommonAlgorithm);
        assert!(client.is_closed());
    }

    #[test]
    fn test_auth_line_format() {
        let mut client = ready_client();
        let auth = String::from_utf8(client.authenticate().unwrap()).unwrap();
        assert!(auth.starts_with("AUTH:SHA256,1234,"));
        assert!(auth.ends_with('\n'));
        // 32-byte tag in lowercase hex
        let mac_hex = auth.trim_end().rsplit(',').next().unwrap();
        assert_eq!(mac_hex.len(), 64);
        assert!(mac_hex.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_authenticate_needs_token() {
        let mut client = ClientEngine::new(ClientConfig::new("1234", b"secret"));
        assert!(client.authenticate().is_err());
    }

    #[test]
    fn test_sequence_lines_and_local_validation() {
        let mut client = ready_client();
        client.authenticate().unwrap();
        let seq = client.begin_sequence(0, 1513833032, 1, 0).unwrap();
        assert_eq!(seq, b"SEQ:0,1513833032,1,0\n");

        let dict = client.dict_entry(0, "C", 100, "temperature").unwrap();
        assert_eq!(dict, b"DICT:0,C,100,temperature\n");

        let data = client.sample(0, 0, "2561").unwrap();
        assert_eq!(data, b"0,0,2561\n");

        // Unknown dictionary index is caught before it leaves the device
        assert!(matches!(
            client.sample(7, 0, "1"),
            Err(ProtocolError::Sequence(SequenceError::UnknownDictIndex(7)))
        ));

        let sig = String::from_utf8(client.end_sequence().unwrap()).unwrap();
        assert!(sig.starts_with("SIG:"));
    }

    #[test]
    fn test_comma_in_field_refused() {
        let mut client = ready_client();
        client.authenticate().unwrap();
        client.begin_sequence(0, 0, 1, 0).unwrap();
        assert!(client.dict_entry(0, "C", 100, "temp,erature").is_err());
    }

    #[test]
    fn test_local_monotonicity_mirrors_server() {
        let mut client = ready_client();
        client.authenticate().unwrap();
        client.begin_sequence(3, 0, 1, 0).unwrap();
        client.dict_entry(0, "", 1, "x").unwrap();
        client.end_sequence().unwrap();

        client.receive(b"OK:3\n").unwrap();
        assert!(matches!(
            client.begin_sequence(3, 0, 1, 0),
            Err(ProtocolError::Sequence(SequenceError::NotMonotonic(3)))
        ));
        assert!(client.begin_sequence(4, 0, 1, 0).is_ok());
    }

    #[test]
    fn test_unknown_notification_is_silently_dropped() {
        let mut client = ready_client();
        let events = client.receive(b"NTFY:9999,whatever\n").unwrap();
        assert!(events.is_empty());
        // State unchanged: the session continues normally
        assert!(client.authenticate().is_ok());
    }

    #[test]
    fn test_known_notification_surfaces() {
        let mut client = ready_client();
        let events = client.receive(b"NTFY:0,1513833032,250\n").unwrap();
        assert_eq!(
            events,
            vec![ClientEvent::Notification(Notification::Time {
                utc_sec: 1513833032,
                utc_ms: 250,
            })]
        );
    }

    #[test]
    fn test_upload_batch_is_one_pipelined_buffer() {
        let mut client = ready_client();
        let wire = client
            .upload_batch(
                0,
                1513833032,
                1,
                &[(0, "C", 100, "temperature")],
                &[(0, 0, "2561"), (0, 30, "2570")],
            )
            .unwrap();
        let text = String::from_utf8(wire).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 6);
        assert!(lines[0].starts_with("AUTH:SHA256,1234,"));
        assert_eq!(lines[1], "SEQ:0,1513833032,1,0");
        assert_eq!(lines[2], "DICT:0,C,100,temperature");
        assert_eq!(lines[3], "0,0,2561");
        assert_eq!(lines[4], "0,30,2570");
        assert!(lines[5].starts_with("SIG:"));
    }

    #[test]
    fn test_rej_closes_session() {
        let mut client = ready_client();
        let events = client.receive(b"REJ:auth\n").unwrap();
        assert_eq!(events, vec![ClientEvent::Rejected("auth".into())]);
        assert!(client.is_closed());
    }

    #[test]
    fn test_hide_requires_auth() {
        let mut client = ready_client();
        assert!(matches!(
            client.activate_hide(CipherAlgorithm::Aes128Cbc, b"salt"),
            Err(ProtocolError::Hide(HideError::NotAuthenticated))
        ));
    }

    #[test]
    fn test_hide_only_once() {
        let mut client = ready_client();
        client.authenticate().unwrap();
        client
            .activate_hide(CipherAlgorithm::Aes128Cbc, b"0123456789abcde")
            .unwrap();
        assert!(matches!(
            client.activate_hide(CipherAlgorithm::Aes128Cbc, b"salt"),
            Err(ProtocolError::Hide(HideError::AlreadyActive))
        ));
    }

    #[test]
    fn test_hide_refused_when_server_does_not_offer() {
        let mut client = ClientEngine::new(ClientConfig::new("1234", b"secret"));
        client
            .receive(format!("S4PP/1.2 SHA256 2000 -\nTOK:{}\n", TOKEN_HEX).as_bytes())
            .unwrap();
        client.authenticate().unwrap();
        assert!(matches!(
            client.activate_hide(CipherAlgorithm::Aes128Cbc, b"salt"),
            Err(ProtocolError::Hide(HideError::UnknownCipher(_)))
        ));
    }

    #[test]
    fn test_hide_output_is_block_aligned_ciphertext() {
        let mut client = ready_client();
        client.authenticate().unwrap();
        let out = client
            .activate_hide(CipherAlgorithm::Aes128Cbc, b"randomrandomrand")
            .unwrap();
        // "HIDE:AES-128-CBC\n" then whole blocks
        let header = b"HIDE:AES-128-CBC\n";
        assert!(out.starts_with(header));
        assert_eq!((out.len() - header.len()) % 16, 0);
        assert!(out.len() > header.len());

        let seq = client.begin_sequence(0, 0, 1, 0).unwrap();
        assert_eq!(seq.len() % 16, 0);
    }
}
