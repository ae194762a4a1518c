//! # sstunnel
//!
//! An encrypted SOCKS5 tunneling proxy built on a single-threaded readiness
//! reactor.
//!
//! ## Architecture Overview
//!
//! ```text
//! application ──SOCKS5──▶ local endpoint ══encrypted tunnel══▶ remote endpoint ──▶ destination
//!                              │
//!                              └── direct_hosts ──────────────────────────────────▶ destination
//! ```
//!
//! Both endpoints run the same [`Engine`]: an arena of connection handlers
//! driven by `mio` readiness events. What the handshake bytes mean is decided
//! by a [`Role`](proxy::Role): [`LocalRole`] speaks SOCKS5 to applications,
//! [`RemoteRole`] reads destination headers out of the tunnel.
//!
//! ## Layers
//!
//! - [`engine`]: reactor, handler arena, chunked buffers, async DNS
//! - [`proxy`]: endpoint roles and the SOCKS5 wire format
//! - [`crypto`]: transport codec (ChaCha20-Poly1305 chunked stream)
//! - [`config`]: configuration files and the runtime snapshot

#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod proxy;

pub use config::Config;
pub use engine::{Engine, Reactor};
pub use error::{Error, Result};
pub use proxy::{LocalRole, RemoteRole};

/// Size of the stack buffer used for one socket read.
pub const BUF_SIZE: usize = 32 * 1024;

/// Listen backlog for endpoint listeners.
pub const BACKLOG: i32 = 1024;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants() {
        assert!(BUF_SIZE >= crypto::MAX_CHUNK);
        assert_eq!(BACKLOG, 1024);
    }
}
