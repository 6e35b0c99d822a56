// Copyright (c) 2025-2026 the s4pp-rs developers.
// SPDX-License-Identifier: MIT
//
// This file is part of s4pp-rs, a Rust implementation of S4PP
// (Simple Sensor Sample Streaming Push Protocol).

mod collector;

use std::fs;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::collector::{run_collector, Config};
use s4pp_sdk::MemoryKeyStore;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = build_collector_configuration();
    tracing::info!(listen = %config.listen_addr, "starting collector");

    let keys = load_key_file(&config.key_file)
        .with_context(|| format!("failed to load key file {}", config.key_file))?;

    run_collector(config, Arc::new(keys))
}

/// Key files hold one `keyid=secret` pair per line; blank lines and lines
/// starting with `#` are skipped. The secret is taken verbatim as bytes.
fn load_key_file(path: &str) -> Result<MemoryKeyStore> {
    let contents = fs::read_to_string(path)?;
    let mut store = MemoryKeyStore::new();
    let mut count = 0usize;
    for (lineno, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (keyid, secret) = line
            .split_once('=')
            .with_context(|| format!("line {}: expected keyid=secret", lineno + 1))?;
        store.insert(keyid, secret.as_bytes());
        count += 1;
    }
    tracing::info!(count, "loaded keys");
    Ok(store)
}

fn build_collector_configuration() -> Config {
    Config {
        listen_addr: read_listen_address(),
        key_file: read_env_string("S4PP_KEY_FILE", "s4pp-keys.conf"),
        samples_path: read_env_string("S4PP_SAMPLES_OUT", "samples.jsonl"),
        max_sessions: read_env_number("S4PP_MAX_SESSIONS", 256),
        max_samples: read_env_number("S4PP_MAX_SAMPLES", 2000),
        idle_timeout_ms: read_env_number("S4PP_IDLE_TIMEOUT_MS", 30_000),
        reject_negative_span: std::env::var("S4PP_REJECT_NEGATIVE_SPAN")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false),
    }
}

fn read_listen_address() -> String {
    read_env_string("S4PP_LISTEN", "127.0.0.1:22226")
}

fn read_env_string(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn read_env_number<T: std::str::FromStr + Copy>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_key_file() {
        let path = std::env::temp_dir().join("s4pp_collector_test_keys.conf");
        fs::write(&path, "# devices\n1234=secret\n\nlab-7=hunter2\n").unwrap();

        let store = load_key_file(path.to_str().unwrap()).unwrap();
        let _ = fs::remove_file(&path);

        use s4pp_sdk::KeyStore;
        assert_eq!(store.lookup("1234").unwrap().as_slice(), b"secret");
        assert_eq!(store.lookup("lab-7").unwrap().as_slice(), b"hunter2");
        assert!(store.lookup("nobody").is_none());
    }

    #[test]
    fn test_load_key_file_rejects_bad_lines() {
        let path = std::env::temp_dir().join("s4pp_collector_test_badkeys.conf");
        fs::write(&path, "not a pair\n").unwrap();
        let result = load_key_file(path.to_str().unwrap());
        let _ = fs::remove_file(&path);
        assert!(result.is_err());
    }
}
