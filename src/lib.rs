//! # Phantom
//!
//! An encrypted tunneling proxy that terminates an obfuscated, authenticated
//! transport carrying a lightweight CONNECT/DATA/CLOSE protocol, and relays
//! bytes between each authorized peer and arbitrary target hosts. Everything
//! on the wire is opaque, high-entropy ciphertext: no handshake banner, no
//! cleartext header, no stable signature byte outside the outer framing.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │  Proxy Fabric (per-request target sockets, relay)       │
//! ├─────────────────────────────────────────────────────────┤
//! │  Session Manager (per-peer state, dispatch, reaping)    │
//! ├─────────────────────────────────────────────────────────┤
//! │  Control Protocol (CONNECT / DATA / CLOSE)              │
//! ├─────────────────────────────────────────────────────────┤
//! │  ARQ Engine (sliding window, retransmit, keepalive)     │
//! ├─────────────────────────────────────────────────────────┤
//! │  Crypto Envelope (windowed subkeys, replay defense)     │
//! ├─────────────────────────────────────────────────────────┤
//! │  Substrates (UDP datagrams / length-prefixed TCP)       │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! Two substrates share one server core: the UDP substrate runs the ARQ
//! reliability layer end-to-end, while the TCP substrate relies on the stream
//! itself and only adds length-prefixed framing. Both share the envelope, the
//! control protocol, and the session/proxy logic.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod arq;
pub mod config;
pub mod crypto;
pub mod error;
pub mod protocol;
pub mod proxy;
pub mod server;
pub mod session;
pub mod share;
pub mod transport;

pub use config::Config;
pub use error::{Error, Result};

/// Protocol version carried in share URLs.
pub const PROTOCOL_VERSION: u8 = 3;
