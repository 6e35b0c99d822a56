//! Server role engine
//!
//! Sans-I/O state machine for the collector side of a session. The
//! transport binding calls [`hello`](ServerEngine::hello) once when the
//! connection is up, then pumps every received chunk through
//! [`receive`](ServerEngine::receive) and writes whatever bytes come back.
//! Protocol failures answer with `REJ` on the returned bytes; fatal ones
//! additionally close the engine, which the binding observes via
//! [`is_closed`](ServerEngine::is_closed).

use s4pp_core::constant_time::constant_time_compare;
use s4pp_core::crypto::cipher::CipherAlgorithm;
use s4pp_core::crypto::hash::{HashAlgorithm, HmacCtx};
use s4pp_core::error::ProtocolError;
use s4pp_core::framing::LineFramer;
use s4pp_core::hide::{derive_session_key, HideError, HideReader};
use s4pp_core::secure_memory::SecureBytes;
use s4pp_core::sequence::{Sequence, SequenceMac};
use s4pp_core::token::ChallengeToken;
use s4pp_core::wire::{self, Command};

use s4pp_sdk::{EntropySource, KeyStore, SampleSink};

use crate::notify::Notification;
use crate::session::{algo_csv, ClientHello, PROTOCOL_VERSION};

/// Server-side session policy.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Advertised hash algorithms, preference order
    pub hash_algos: Vec<HashAlgorithm>,
    /// Advertised hide ciphers; empty list advertises `-`
    pub hide_algos: Vec<CipherAlgorithm>,
    /// Per-sequence sample cap advertised in the hello
    pub max_samples: u32,
    /// Line-length cap; overruns reject the session
    pub max_line_len: usize,
    /// Raw length of the generated challenge token (1..=127 bytes)
    pub token_bytes: usize,
    /// Reject format-1 samples with negative spans
    pub reject_negative_span: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hash_algos: HashAlgorithm::SUPPORTED.to_vec(),
            hide_algos: CipherAlgorithm::SUPPORTED.to_vec(),
            max_samples: wire::DEFAULT_MAX_SAMPLES,
            max_line_len: wire::MAX_LINE_LEN,
            token_bytes: wire::DEFAULT_TOKEN_BYTES,
            reject_negative_span: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServerState {
    /// Hello sent, client may still send its own hello
    AwaitingClientHelloOrAuth,
    /// Client hello consumed, AUTH outstanding
    AwaitingAuth,
    Authenticated,
    InSequence,
    Closed,
}

struct AuthInfo {
    keyid: String,
    key: SecureBytes,
    algorithm: HashAlgorithm,
}

struct InFlight {
    seq: Sequence,
    mac: SequenceMac,
    /// The sink failed begin/emit; swallow the rest of the body and answer
    /// NOK instead of committing.
    doomed: bool,
}

/// One server session.
pub struct ServerEngine {
    config: ServerConfig,
    keys: Box<dyn KeyStore>,
    sink: Box<dyn SampleSink>,
    state: ServerState,
    framer: LineFramer,
    token: Option<ChallengeToken>,
    auth: Option<AuthInfo>,
    seq: Option<InFlight>,
    last_committed: Option<u64>,
    hide: Option<HideReader>,
    hide_used: bool,
    /// The next decrypted line is HIDE salt; drop it unparsed.
    discard_next_line: bool,
    hello_sent: bool,
}

impl ServerEngine {
    pub fn new(config: ServerConfig, keys: Box<dyn KeyStore>, sink: Box<dyn SampleSink>) -> Self {
        let max_line = config.max_line_len;
        Self {
            config,
            keys,
            sink,
            state: ServerState::AwaitingClientHelloOrAuth,
            framer: LineFramer::new(max_line),
            token: None,
            auth: None,
            seq: None,
            last_committed: None,
            hide: None,
            hide_used: false,
            discard_next_line: false,
            hello_sent: false,
        }
    }

    /// Emit the server hello and challenge token. Call once, when the
    /// transport is ready.
    pub fn hello(&mut self, entropy: &dyn EntropySource) -> Result<Vec<u8>, ProtocolError> {
        if self.hello_sent {
            return Err(ProtocolError::OutOfOrder("hello already sent"));
        }
        let token_hex = entropy.token(self.config.token_bytes.clamp(1, 127));
        let token = ChallengeToken::from_wire(&token_hex)?;

        let hashes = algo_csv(self.config.hash_algos.iter().map(|a| a.wire_name()));
        let hides = algo_csv(self.config.hide_algos.iter().map(|a| a.wire_name()));
        let out = format!(
            "S4PP/{} {} {} {}\nTOK:{}\n",
            PROTOCOL_VERSION,
            hashes,
            self.config.max_samples,
            hides,
            token.ascii()
        );

        self.token = Some(token);
        self.hello_sent = true;
        Ok(out.into_bytes())
    }

    /// Feed received transport bytes; returns the bytes to send back.
    ///
    /// All protocol failures are answered in-band (`REJ`, `NOK`) and
    /// recorded; only calling into an already-closed engine is an `Err`.
    pub fn receive(&mut self, bytes: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        if self.state == ServerState::Closed {
            return Err(ProtocolError::Closed);
        }

        let mut out = Vec::new();
        if let Err(e) = self.ingest(bytes, &mut out) {
            self.fail(e, &mut out);
        }
        Ok(out)
    }

    fn ingest(&mut self, bytes: &[u8], out: &mut Vec<u8>) -> Result<(), ProtocolError> {
        match &mut self.hide {
            Some(reader) => {
                let plain = reader.decrypt(bytes).map_err(HideError::Cipher)?;
                self.framer.extend(&plain);
            }
            None => self.framer.extend(bytes),
        }

        loop {
            if self.state == ServerState::Closed {
                return Ok(());
            }
            let line = match self.framer.next_line()? {
                Some(line) => line,
                None => return Ok(()),
            };
            if self.discard_next_line {
                // HIDE salt, opaque by design
                self.discard_next_line = false;
                continue;
            }
            if let Err(e) = self.handle_line(&line, out) {
                self.fail(e, out);
            }
        }
    }

    fn handle_line(&mut self, line: &[u8], out: &mut Vec<u8>) -> Result<(), ProtocolError> {
        match Command::parse(line)? {
            Command::Empty => {
                // Inside a sequence body the empty line's LF is covered by
                // the signature; elsewhere it is a no-op (HIDE padding).
                if let Some(inflight) = &mut self.seq {
                    inflight.mac.feed_line(b"");
                }
                Ok(())
            }
            Command::Hello(hello) => {
                if self.state != ServerState::AwaitingClientHelloOrAuth {
                    return Err(ProtocolError::OutOfOrder("late client hello"));
                }
                let hello = ClientHello::from_hello_line(&hello)?;
                let ours_named: Vec<&str> = self
                    .config
                    .hash_algos
                    .iter()
                    .map(|a| a.wire_name())
                    .collect();
                if !hello
                    .hash_algos
                    .iter()
                    .any(|name| ours_named.contains(&name.as_str()))
                {
                    return Err(ProtocolError::NoCommonAlgorithm);
                }
                tracing::debug!(version = %hello.version, "client hello");
                self.state = ServerState::AwaitingAuth;
                Ok(())
            }
            Command::Auth {
                algorithm,
                keyid,
                mac_hex,
            } => self.handle_auth(&algorithm, keyid, &mac_hex),
            Command::Seq {
                seqid,
                basetime,
                time_divisor,
                data_format,
            } => self.handle_seq(line, seqid, basetime, time_divisor, data_format),
            Command::Dict {
                idx,
                unit,
                unit_divisor,
                name,
            } => {
                let inflight = match &mut self.seq {
                    Some(inflight) => inflight,
                    None => return Err(ProtocolError::OutOfOrder("DICT outside sequence")),
                };
                inflight.mac.feed_line(line);
                inflight.seq.put_dict_entry(idx, unit, unit_divisor, name)?;
                Ok(())
            }
            Command::Data { idx, rest } => {
                let inflight = match &mut self.seq {
                    Some(inflight) => inflight,
                    None => return Err(ProtocolError::OutOfOrder("sample outside sequence")),
                };
                inflight.mac.feed_line(line);
                if inflight.doomed {
                    return Ok(());
                }
                let sample = inflight.seq.ingest_sample(idx, &rest)?;
                if let Err(reason) = self.sink.emit(&sample) {
                    tracing::warn!(seqid = sample.seqid, %reason, "sink emit failed");
                    inflight.doomed = true;
                }
                Ok(())
            }
            Command::Sig(mac_hex) => self.handle_sig(&mac_hex, out),
            Command::Hide {
                algorithm,
                block_size,
            } => self.handle_hide(&algorithm, block_size),
            Command::Rej(reason) => {
                // Peer gave up; nothing sensible to answer.
                tracing::debug!(%reason, "client rejected session");
                self.close();
                Ok(())
            }
            Command::Token(_) | Command::Ok(_) | Command::Nok(_) | Command::Ntfy(_) => Err(
                ProtocolError::OutOfOrder("server-directional command from client"),
            ),
        }
    }

    fn handle_auth(
        &mut self,
        algorithm: &str,
        keyid: String,
        mac_hex: &str,
    ) -> Result<(), ProtocolError> {
        match self.state {
            ServerState::AwaitingClientHelloOrAuth | ServerState::AwaitingAuth => {}
            _ => return Err(ProtocolError::OutOfOrder("repeated AUTH")),
        }
        let token = self
            .token
            .as_ref()
            .ok_or(ProtocolError::OutOfOrder("AUTH before hello"))?;

        let algo = HashAlgorithm::from_wire(algorithm)
            .filter(|a| self.config.hash_algos.contains(a))
            .ok_or_else(|| ProtocolError::UnknownAlgorithm(algorithm.to_string()))?;

        let key = self.keys.lookup(&keyid).ok_or(ProtocolError::AuthFailed)?;

        // AUTH covers the keyid and the token in its transmitted ASCII form.
        let mut mac = HmacCtx::new(algo, key.as_slice())?;
        mac.update(keyid.as_bytes());
        mac.update(token.ascii().as_bytes());
        let expected = mac.finalize();

        let presented = hex::decode(mac_hex).map_err(|_| ProtocolError::AuthFailed)?;
        if !constant_time_compare(&expected, &presented) {
            return Err(ProtocolError::AuthFailed);
        }

        tracing::debug!(%keyid, "authenticated");
        self.auth = Some(AuthInfo {
            keyid,
            key,
            algorithm: algo,
        });
        // Success is silent; the client is free to pipeline already.
        self.state = ServerState::Authenticated;
        Ok(())
    }

    fn handle_seq(
        &mut self,
        line: &[u8],
        seqid: u64,
        basetime: i64,
        time_divisor: i64,
        data_format: u32,
    ) -> Result<(), ProtocolError> {
        if self.state != ServerState::Authenticated {
            return Err(ProtocolError::OutOfOrder("SEQ in wrong state"));
        }
        let auth = self
            .auth
            .as_ref()
            .ok_or(ProtocolError::OutOfOrder("SEQ before AUTH"))?;
        let token = self
            .token
            .as_ref()
            .ok_or(ProtocolError::OutOfOrder("SEQ before hello"))?;

        let seq = Sequence::begin(
            seqid,
            basetime,
            time_divisor,
            data_format,
            self.last_committed,
            Some(self.config.max_samples),
            self.config.reject_negative_span,
        )?;

        let mut mac = SequenceMac::begin(auth.algorithm, auth.key.as_slice(), token.raw())?;
        mac.feed_line(line);

        // A failed begin dooms the batch but the answer still waits for the
        // SIG line, keeping responses in SIG order.
        let doomed = match self.sink.begin(seqid) {
            Ok(()) => false,
            Err(reason) => {
                tracing::warn!(seqid, %reason, "sink begin failed");
                true
            }
        };

        self.seq = Some(InFlight { seq, mac, doomed });
        self.state = ServerState::InSequence;
        Ok(())
    }

    fn handle_sig(&mut self, mac_hex: &str, out: &mut Vec<u8>) -> Result<(), ProtocolError> {
        let inflight = match self.seq.take() {
            Some(inflight) => inflight,
            None => return Err(ProtocolError::OutOfOrder("SIG outside sequence")),
        };
        self.state = ServerState::Authenticated;
        let seqid = inflight.seq.seqid();

        // The SIG line itself is outside the covered byte range.
        let computed = inflight.mac.finalize();
        let presented = match hex::decode(mac_hex) {
            Ok(bytes) => bytes,
            Err(_) => {
                self.sink.abort(seqid);
                return Err(ProtocolError::BadSignature);
            }
        };
        if !constant_time_compare(&computed, &presented) {
            self.sink.abort(seqid);
            return Err(ProtocolError::BadSignature);
        }

        if inflight.doomed {
            // Body was authentic but the sink already failed it.
            self.sink.abort(seqid);
            out.extend_from_slice(format!("NOK:{}\n", seqid).as_bytes());
            return Ok(());
        }

        match self.sink.commit(seqid) {
            Ok(()) => {
                self.last_committed = Some(seqid);
                tracing::debug!(seqid, "sequence committed");
                out.extend_from_slice(format!("OK:{}\n", seqid).as_bytes());
            }
            Err(reason) => {
                tracing::warn!(seqid, %reason, "sink commit failed");
                self.sink.abort(seqid);
                out.extend_from_slice(format!("NOK:{}\n", seqid).as_bytes());
            }
        }
        Ok(())
    }

    fn handle_hide(
        &mut self,
        algorithm: &str,
        block_size: Option<usize>,
    ) -> Result<(), ProtocolError> {
        if self.state == ServerState::InSequence {
            return Err(HideError::InsideSequence.into());
        }
        if self.state != ServerState::Authenticated {
            return Err(HideError::NotAuthenticated.into());
        }
        if self.hide_used {
            return Err(HideError::AlreadyActive.into());
        }

        let algo = CipherAlgorithm::from_wire(algorithm)
            .filter(|a| self.config.hide_algos.contains(a))
            .ok_or_else(|| HideError::UnknownCipher(algorithm.to_string()))?;
        if let Some(requested) = block_size {
            if requested != algo.block_size() {
                return Err(HideError::BlockSizeMismatch.into());
            }
        }

        let auth = self
            .auth
            .as_ref()
            .ok_or(ProtocolError::OutOfOrder("HIDE before AUTH"))?;
        let token = self
            .token
            .as_ref()
            .ok_or(ProtocolError::OutOfOrder("HIDE before hello"))?;

        let session_key =
            derive_session_key(algo, auth.key.as_slice(), token.raw()).map_err(HideError::Cipher)?;
        let mut reader = HideReader::new(algo, &session_key);

        // Everything buffered past the HIDE line is already ciphertext;
        // pull it back out of the framer and re-frame the plaintext.
        let leftover = self.framer.take_unparsed();
        let plain = reader.decrypt(&leftover).map_err(HideError::Cipher)?;
        self.framer.extend(&plain);

        self.hide = Some(reader);
        self.hide_used = true;
        self.discard_next_line = true;
        tracing::debug!(cipher = algo.wire_name(), "hide active");
        Ok(())
    }

    /// Emit a notification line, if the session can still carry one.
    /// Notifications are whole lines and never split an in-progress write.
    pub fn notify(&mut self, notification: &Notification) -> Option<Vec<u8>> {
        if !self.hello_sent || self.state == ServerState::Closed {
            return None;
        }
        Some(format!("NTFY:{}\n", notification.encode()).into_bytes())
    }

    /// Idle-abort hook for the transport's timeout policy: aborts any
    /// in-flight sequence without a response and closes the session.
    pub fn idle_abort(&mut self) {
        tracing::debug!("idle abort");
        self.close();
    }

    pub fn is_closed(&self) -> bool {
        self.state == ServerState::Closed
    }

    /// Last successfully committed sequence id.
    pub fn last_committed(&self) -> Option<u64> {
        self.last_committed
    }

    fn close(&mut self) {
        if let Some(inflight) = self.seq.take() {
            self.sink.abort(inflight.seq.seqid());
        }
        self.state = ServerState::Closed;
    }

    fn fail(&mut self, error: ProtocolError, out: &mut Vec<u8>) {
        tracing::warn!(error = %error, fatal = error.is_fatal(), "protocol failure");
        if let Some(inflight) = self.seq.take() {
            self.sink.abort(inflight.seq.seqid());
            if self.state == ServerState::InSequence {
                self.state = ServerState::Authenticated;
            }
        }
        if let Some(reason) = error.reject_reason() {
            out.extend_from_slice(format!("REJ:{}\n", reason).as_bytes());
        }
        if error.is_fatal() {
            self.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use s4pp_sdk::{MemoryKeyStore, MemorySink, NoKeyStore};

    struct FixedEntropy(&'static str);

    impl EntropySource for FixedEntropy {
        fn token(&self, _len: usize) -> String {
            self.0.to_string()
        }
    }

    const TOKEN_HEX: &str = "f8763c330bf5ed2feafaf56c484649bf";

    fn engine() -> (ServerEngine, MemorySink) {
        let mut keys = MemoryKeyStore::new();
        keys.insert("1234", b"secret");
        let sink = MemorySink::new();
        let engine = ServerEngine::new(
            ServerConfig::default(),
            Box::new(keys),
            Box::new(sink.clone()),
        );
        (engine, sink)
    }

    fn started_engine() -> (ServerEngine, MemorySink) {
        let (mut engine, sink) = engine();
        let hello = engine.hello(&FixedEntropy(TOKEN_HEX)).unwrap();
        let text = String::from_utf8(hello).unwrap();
        assert_eq!(
            text,
            format!("S4PP/1.2 SHA256 2000 AES-128-CBC\nTOK:{}\n", TOKEN_HEX)
        );
        (engine, sink)
    }

    #[test]
    fn test_hello_only_once() {
        let (mut engine, _) = started_engine();
        assert!(engine.hello(&FixedEntropy(TOKEN_HEX)).is_err());
    }

    #[test]
    fn test_crlf_is_rejected_and_fatal() {
        let (mut engine, _) = started_engine();
        let out = engine.receive(b"AUTH:SHA256,1234,00\r\n").unwrap();
        assert_eq!(out, b"REJ:malformed\n");
        assert!(engine.is_closed());
    }

    #[test]
    fn test_unknown_key_rejects_auth() {
        let sink = MemorySink::new();
        let mut engine = ServerEngine::new(
            ServerConfig::default(),
            Box::new(NoKeyStore),
            Box::new(sink),
        );
        engine.hello(&FixedEntropy(TOKEN_HEX)).unwrap();
        let out = engine.receive(b"AUTH:SHA256,1234,00\n").unwrap();
        assert_eq!(out, b"REJ:auth\n");
        assert!(engine.is_closed());
    }

    #[test]
    fn test_unknown_hash_algorithm_rejects_auth() {
        let (mut engine, _) = started_engine();
        let out = engine.receive(b"AUTH:MD5,1234,00\n").unwrap();
        assert_eq!(out, b"REJ:auth\n");
        assert!(engine.is_closed());
    }

    #[test]
    fn test_client_hello_without_common_hash_terminates_silently() {
        let (mut engine, _) = started_engine();
        let out = engine.receive(b"S4PP/1.2 SHA3 -\n").unwrap();
        assert!(out.is_empty());
        assert!(engine.is_closed());
    }

    #[test]
    fn test_seq_before_auth_is_malformed() {
        let (mut engine, _) = started_engine();
        let out = engine.receive(b"SEQ:0,0,1,0\n").unwrap();
        assert_eq!(out, b"REJ:malformed\n");
        assert!(engine.is_closed());
    }

    #[test]
    fn test_notify_emits_whole_line() {
        let (mut engine, _) = started_engine();
        let n = Notification::Flags { set: 0x1b, clear: 0x4 };
        assert_eq!(engine.notify(&n).unwrap(), b"NTFY:2,1b,4\n");
    }

    #[test]
    fn test_notify_suppressed_when_closed() {
        let (mut engine, _) = started_engine();
        engine.idle_abort();
        assert!(engine
            .notify(&Notification::Time { utc_sec: 1, utc_ms: 0 })
            .is_none());
    }

    #[test]
    fn test_receive_after_close_is_an_error() {
        let (mut engine, _) = started_engine();
        engine.idle_abort();
        assert!(matches!(engine.receive(b"\n"), Err(ProtocolError::Closed)));
    }
}
