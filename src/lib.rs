//! # sockstun
//!
//! A multi-node encrypted TCP/UDP relay that accounts every relayed
//! connection in InfluxDB.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │  Orchestrator (config, recorder, one listener per node)  │
//! ├─────────────────────────────────────────────────────────┤
//! │  Listener Set (TCP accept loop, UDP NAT relay)           │
//! ├─────────────────────────────────────────────────────────┤
//! │  Relay Engine (address exchange, bidirectional copy)     │
//! ├─────────────────────────────────────────────────────────┤
//! │  Crypto Layer (Shadowsocks AEAD stream and packets)      │
//! └─────────────────────────────────────────────────────────┘
//!            │ ConnectionRecord
//!            ▼
//!  Metrics Pipeline (bounded queue, batched InfluxDB writes)
//! ```
//!
//! ## Ciphers
//!
//! `AEAD_CHACHA20_POLY1305`, `AEAD_AES_128_GCM`, `AEAD_AES_256_GCM` and the
//! pass-through `DUMMY`, selected per node by name.

#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

pub mod crypto;
pub mod error;
pub mod proxy;
pub mod server;

pub use error::{Error, Result};

/// Default configuration file path.
pub const DEFAULT_CONFIG_PATH: &str = "config.json";

/// Default PID file path.
pub const DEFAULT_PID_FILE: &str = "sockstun.pid";
