// Copyright (c) 2025-2026 the s4pp-rs developers.
// SPDX-License-Identifier: MIT
//
// This file is part of s4pp-rs, a Rust implementation of S4PP
// (Simple Sensor Sample Streaming Push Protocol).

//! S4PP collaborator SDK
//!
//! **Extension points the protocol engines consume.**
//!
//! The engines are sans-I/O and take their external collaborators as trait
//! objects: key lookup, sample persistence, challenge-token entropy and the
//! wall clock. This crate defines those traits plus ready-made
//! implementations for the common cases (in-memory key store, in-memory
//! sink, JSON-lines file sink, OS entropy, system clock).
//!
//! ## Core traits
//!
//! - [`KeyStore`]: map a key identifier to shared-key bytes
//! - [`SampleSink`]: transactional persistence for committed sequences
//! - [`EntropySource`]: random challenge tokens (server only)
//! - [`WallClock`]: current UTC time for time-service notifications
//!
//! Key material crosses this boundary as
//! [`SecureBytes`](s4pp_core::secure_memory::SecureBytes) so it stays out of
//! logs and is zeroed on drop.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use rand::RngCore;

use s4pp_core::secure_memory::SecureBytes;
use s4pp_core::sequence::Sample;

/// Shared-key lookup by key identifier.
///
/// # Contract
///
/// - MUST return `None` for unknown identifiers (the engine answers
///   `REJ:auth` without distinguishing unknown-key from bad-MAC)
/// - Lookups are read-only and may be called from many sessions at once
pub trait KeyStore: Send + Sync {
    fn lookup(&self, keyid: &str) -> Option<SecureBytes>;
}

/// Transactional sample persistence.
///
/// One sink instance serves one session; sequences arrive strictly in
/// order. `begin`/`emit` stage data, `commit` makes sequence `seqid`
/// durable, `abort` discards the staging.
///
/// # Errors
///
/// A failed `commit` surfaces as `NOK:<seqid>` on the wire; the session
/// continues and the client may retry the same sequence id.
pub trait SampleSink: Send {
    fn begin(&mut self, seqid: u64) -> Result<(), String>;
    fn emit(&mut self, sample: &Sample) -> Result<(), String>;
    fn commit(&mut self, seqid: u64) -> Result<(), String>;
    fn abort(&mut self, seqid: u64);
}

/// Random token generation for the server hello.
///
/// Returns `len` random bytes as lowercase hex.
pub trait EntropySource: Send + Sync {
    fn token(&self, len: usize) -> String;
}

/// UTC time source for `NTFY:0`.
pub trait WallClock: Send + Sync {
    /// (seconds since the epoch, milliseconds within the second)
    fn now_utc(&self) -> (u64, u32);
}

//
// ──────────────────────────────────────────────
//   Ready-made implementations
// ──────────────────────────────────────────────
//

/// In-memory key store backed by a map.
#[derive(Default)]
pub struct MemoryKeyStore {
    keys: HashMap<String, SecureBytes>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, keyid: impl Into<String>, key: &[u8]) {
        self.keys.insert(keyid.into(), SecureBytes::from_slice(key));
    }
}

impl KeyStore for MemoryKeyStore {
    fn lookup(&self, keyid: &str) -> Option<SecureBytes> {
        self.keys.get(keyid).cloned()
    }
}

// One store typically serves every session on a collector.
impl<T: KeyStore + ?Sized> KeyStore for Arc<T> {
    fn lookup(&self, keyid: &str) -> Option<SecureBytes> {
        (**self).lookup(keyid)
    }
}

/// Key store that knows no keys; every AUTH fails.
pub struct NoKeyStore;

impl KeyStore for NoKeyStore {
    fn lookup(&self, _keyid: &str) -> Option<SecureBytes> {
        None
    }
}

#[derive(Default)]
struct MemorySinkState {
    staged: HashMap<u64, Vec<Sample>>,
    committed: Vec<Sample>,
    committed_seqids: Vec<u64>,
}

/// In-memory sink with a shared inspection handle.
///
/// Cloning yields another handle onto the same storage, so a test or
/// embedding application can keep one handle while the engine owns the
/// other.
#[derive(Clone, Default)]
pub struct MemorySink {
    state: Arc<Mutex<MemorySinkState>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All samples from committed sequences, in commit order.
    pub fn committed(&self) -> Vec<Sample> {
        self.state.lock().committed.clone()
    }

    /// Sequence ids in commit order.
    pub fn committed_seqids(&self) -> Vec<u64> {
        self.state.lock().committed_seqids.clone()
    }
}

impl SampleSink for MemorySink {
    fn begin(&mut self, seqid: u64) -> Result<(), String> {
        self.state.lock().staged.insert(seqid, Vec::new());
        Ok(())
    }

    fn emit(&mut self, sample: &Sample) -> Result<(), String> {
        let mut state = self.state.lock();
        match state.staged.get_mut(&sample.seqid) {
            Some(batch) => {
                batch.push(sample.clone());
                Ok(())
            }
            None => Err(format!("no staged sequence {}", sample.seqid)),
        }
    }

    fn commit(&mut self, seqid: u64) -> Result<(), String> {
        let mut state = self.state.lock();
        let batch = state
            .staged
            .remove(&seqid)
            .ok_or_else(|| format!("no staged sequence {}", seqid))?;
        state.committed.extend(batch);
        state.committed_seqids.push(seqid);
        Ok(())
    }

    fn abort(&mut self, seqid: u64) {
        self.state.lock().staged.remove(&seqid);
    }
}

/// Sink that discards everything but reports success.
pub struct NoOpSink;

impl SampleSink for NoOpSink {
    fn begin(&mut self, _seqid: u64) -> Result<(), String> {
        Ok(())
    }

    fn emit(&mut self, _sample: &Sample) -> Result<(), String> {
        Ok(())
    }

    fn commit(&mut self, _seqid: u64) -> Result<(), String> {
        Ok(())
    }

    fn abort(&mut self, _seqid: u64) {}
}

/// Append-only JSON-lines sink.
///
/// Samples are staged in memory and written to the file one JSON object
/// per line when their sequence commits, so aborted sequences never touch
/// disk.
pub struct JsonLinesSink {
    file: File,
    staged: HashMap<u64, Vec<Sample>>,
}

impl JsonLinesSink {
    pub fn create(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file,
            staged: HashMap::new(),
        })
    }
}

impl SampleSink for JsonLinesSink {
    fn begin(&mut self, seqid: u64) -> Result<(), String> {
        self.staged.insert(seqid, Vec::new());
        Ok(())
    }

    fn emit(&mut self, sample: &Sample) -> Result<(), String> {
        match self.staged.get_mut(&sample.seqid) {
            Some(batch) => {
                batch.push(sample.clone());
                Ok(())
            }
            None => Err(format!("no staged sequence {}", sample.seqid)),
        }
    }

    fn commit(&mut self, seqid: u64) -> Result<(), String> {
        let batch = self
            .staged
            .remove(&seqid)
            .ok_or_else(|| format!("no staged sequence {}", seqid))?;
        for sample in &batch {
            let line = serde_json::to_string(sample).map_err(|e| e.to_string())?;
            writeln!(self.file, "{}", line).map_err(|e| e.to_string())?;
        }
        self.file.flush().map_err(|e| e.to_string())
    }

    fn abort(&mut self, seqid: u64) {
        self.staged.remove(&seqid);
    }
}

/// Challenge tokens from the operating system RNG.
pub struct OsEntropy;

impl EntropySource for OsEntropy {
    fn token(&self, len: usize) -> String {
        let mut bytes = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut bytes);
        hex::encode(bytes)
    }
}

/// System wall clock.
pub struct SystemClock;

impl WallClock for SystemClock {
    fn now_utc(&self) -> (u64, u32) {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(elapsed) => (elapsed.as_secs(), elapsed.subsec_millis()),
            // Clock before the epoch; report the epoch itself
            Err(_) => (0, 0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use s4pp_core::sequence::ScaledTime;

    fn sample(seqid: u64) -> Sample {
        Sample {
            seqid,
            dict_idx: 0,
            time: ScaledTime { numer: 100, divisor: 1 },
            span: 0,
            values: vec!["1".into()],
            unit: "C".into(),
            unit_divisor: 100,
            name: "temperature".into(),
        }
    }

    #[test]
    fn test_memory_keystore() {
        let mut store = MemoryKeyStore::new();
        store.insert("1234", b"secret");
        assert_eq!(store.lookup("1234").unwrap().as_slice(), b"secret");
        assert!(store.lookup("other").is_none());
    }

    #[test]
    fn test_no_keystore() {
        assert!(NoKeyStore.lookup("1234").is_none());
    }

    #[test]
    fn test_memory_sink_commit() {
        let mut sink = MemorySink::new();
        let handle = sink.clone();

        sink.begin(0).unwrap();
        sink.emit(&sample(0)).unwrap();
        sink.commit(0).unwrap();

        assert_eq!(handle.committed_seqids(), vec![0]);
        assert_eq!(handle.committed().len(), 1);
    }

    #[test]
    fn test_memory_sink_abort_discards() {
        let mut sink = MemorySink::new();
        let handle = sink.clone();

        sink.begin(3).unwrap();
        sink.emit(&sample(3)).unwrap();
        sink.abort(3);

        assert!(handle.committed().is_empty());
        // A later commit of the aborted id fails: nothing is staged
        assert!(sink.commit(3).is_err());
    }

    #[test]
    fn test_memory_sink_emit_without_begin() {
        let mut sink = MemorySink::new();
        assert!(sink.emit(&sample(9)).is_err());
    }

    #[test]
    fn test_os_entropy_token_shape() {
        let token = OsEntropy.token(16);
        assert_eq!(token.len(), 32);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_jsonl_sink_writes_on_commit_only() {
        let path = std::env::temp_dir().join("s4pp_sdk_test_sink.jsonl");
        let _ = std::fs::remove_file(&path);

        let mut sink = JsonLinesSink::create(&path).unwrap();
        sink.begin(1).unwrap();
        sink.emit(&sample(1)).unwrap();
        sink.abort(1);

        sink.begin(2).unwrap();
        sink.emit(&sample(2)).unwrap();
        sink.commit(2).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let _ = std::fs::remove_file(&path);
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 1);
        let parsed: Sample = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed.seqid, 2);
    }
}
