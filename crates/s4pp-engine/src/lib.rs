// Copyright (c) 2025-2026 the s4pp-rs developers.
// SPDX-License-Identifier: MIT
//
// This file is part of s4pp-rs, a Rust implementation of S4PP
// (Simple Sensor Sample Streaming Push Protocol).

// S4PP role engines
// Sans-I/O state machines for both peer roles: feed received bytes in,
// get outbound bytes (and, on the client, events) back out.

pub mod client;
pub mod notify;
pub mod server;
pub mod session;

pub use client::{ClientConfig, ClientEngine, ClientEvent};
pub use notify::Notification;
pub use server::{ServerConfig, ServerEngine};
