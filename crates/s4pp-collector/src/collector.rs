//! TCP listener and per-session plumbing
//!
//! One thread per session, each owning its engine; sessions share only the
//! key store (read-only) and the JSONL sample file (behind a lock). A
//! session tracker caps concurrency and feeds read timeouts into the
//! engine's idle-abort hook.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;

use s4pp_core::sequence::Sample;
use s4pp_engine::{Notification, ServerConfig, ServerEngine};
use s4pp_sdk::{JsonLinesSink, MemoryKeyStore, OsEntropy, SampleSink, SystemClock};

/// Collector runtime configuration, assembled from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: String,
    pub key_file: String,
    pub samples_path: String,
    pub max_sessions: usize,
    pub max_samples: u32,
    pub idle_timeout_ms: u64,
    pub reject_negative_span: bool,
}

/// Global session slot and byte accounting.
#[derive(Debug)]
pub struct SessionTracker {
    active_sessions: AtomicUsize,
    total_bytes_sent: AtomicU64,
    total_bytes_received: AtomicU64,
    max_sessions: usize,
}

impl SessionTracker {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            active_sessions: AtomicUsize::new(0),
            total_bytes_sent: AtomicU64::new(0),
            total_bytes_received: AtomicU64::new(0),
            max_sessions,
        }
    }

    /// Try to claim a session slot.
    pub fn try_acquire(self: &Arc<Self>) -> Option<SessionGuard> {
        let current = self.active_sessions.load(Ordering::Relaxed);
        if current >= self.max_sessions {
            return None;
        }
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
        Some(SessionGuard {
            tracker: Arc::clone(self),
        })
    }

    pub fn active(&self) -> usize {
        self.active_sessions.load(Ordering::Relaxed)
    }

    pub fn totals(&self) -> (u64, u64) {
        (
            self.total_bytes_sent.load(Ordering::Relaxed),
            self.total_bytes_received.load(Ordering::Relaxed),
        )
    }
}

/// RAII guard for one session slot.
pub struct SessionGuard {
    tracker: Arc<SessionTracker>,
}

impl SessionGuard {
    pub fn record_sent(&self, bytes: u64) {
        self.tracker
            .total_bytes_sent
            .fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_received(&self, bytes: u64) {
        self.tracker
            .total_bytes_received
            .fetch_add(bytes, Ordering::Relaxed);
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.tracker.active_sessions.fetch_sub(1, Ordering::Relaxed);
    }
}

/// All sessions append to one JSONL file; the lock keeps whole sequences
/// from interleaving mid-commit.
struct SharedJsonSink {
    inner: Arc<Mutex<JsonLinesSink>>,
}

impl SampleSink for SharedJsonSink {
    fn begin(&mut self, seqid: u64) -> Result<(), String> {
        self.inner.lock().begin(seqid)
    }

    fn emit(&mut self, sample: &Sample) -> Result<(), String> {
        self.inner.lock().emit(sample)
    }

    fn commit(&mut self, seqid: u64) -> Result<(), String> {
        self.inner.lock().commit(seqid)
    }

    fn abort(&mut self, seqid: u64) {
        self.inner.lock().abort(seqid)
    }
}

pub fn run_collector(config: Config, keys: Arc<MemoryKeyStore>) -> Result<()> {
    let listener = TcpListener::bind(&config.listen_addr)
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    let tracker = Arc::new(SessionTracker::new(config.max_sessions));
    let sink = Arc::new(Mutex::new(
        JsonLinesSink::create(&config.samples_path)
            .with_context(|| format!("failed to open {}", config.samples_path))?,
    ));

    for stream in listener.incoming() {
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                continue;
            }
        };
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        let guard = match tracker.try_acquire() {
            Some(guard) => guard,
            None => {
                tracing::warn!(%peer, "session limit reached, refusing");
                continue;
            }
        };
        tracing::info!(%peer, active = tracker.active(), "session accepted");

        let config = config.clone();
        let keys = Arc::clone(&keys);
        let sink = SharedJsonSink {
            inner: Arc::clone(&sink),
        };
        thread::spawn(move || {
            if let Err(e) = handle_session(stream, guard, &config, keys, sink) {
                tracing::warn!(%peer, error = %e, "session ended with error");
            } else {
                tracing::info!(%peer, "session closed");
            }
        });
    }
    Ok(())
}

fn handle_session(
    mut stream: TcpStream,
    guard: SessionGuard,
    config: &Config,
    keys: Arc<MemoryKeyStore>,
    sink: SharedJsonSink,
) -> Result<()> {
    stream.set_read_timeout(Some(Duration::from_millis(config.idle_timeout_ms.max(1))))?;

    let server_config = ServerConfig {
        max_samples: config.max_samples,
        reject_negative_span: config.reject_negative_span,
        ..ServerConfig::default()
    };
    let mut engine = ServerEngine::new(server_config, Box::new(keys), Box::new(sink));

    let hello = engine
        .hello(&OsEntropy)
        .map_err(|e| anyhow::anyhow!("hello failed: {}", e))?;
    stream.write_all(&hello)?;
    guard.record_sent(hello.len() as u64);

    // Time service for clock-less sensors
    if let Some(ntfy) = engine.notify(&Notification::time_now(&SystemClock)) {
        stream.write_all(&ntfy)?;
        guard.record_sent(ntfy.len() as u64);
    }

    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                guard.record_received(n as u64);
                let out = match engine.receive(&buf[..n]) {
                    Ok(out) => out,
                    Err(_) => break,
                };
                if !out.is_empty() {
                    stream.write_all(&out)?;
                    guard.record_sent(out.len() as u64);
                }
                if engine.is_closed() {
                    break;
                }
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                engine.idle_abort();
                break;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
