//! Portable classification of socket errors.
//!
//! Non-blocking sockets report "try again later" and "the other side went
//! away" through a handful of platform-specific errno values. The engine only
//! needs to know which bucket an error falls into:
//!
//! - [`ErrorClass::Transient`]: wait for the next readiness event.
//! - [`ErrorClass::PeerReset`]: the connection is gone; tear down quietly.
//! - [`ErrorClass::Fatal`]: unexpected; tear down and log loudly.

use std::io;

/// Bucket a socket error falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Would-block, interrupted or connect-in-progress
    Transient,
    /// Reset, aborted, broken pipe or timed out
    PeerReset,
    /// Anything else
    Fatal,
}

/// Classify an I/O error.
pub fn classify(err: &io::Error) -> ErrorClass {
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => return ErrorClass::Transient,
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::TimedOut => return ErrorClass::PeerReset,
        _ => {}
    }

    match err.raw_os_error() {
        Some(code) if is_in_progress(code) || is_would_block(code) => ErrorClass::Transient,
        Some(code) if is_conn_reset(code) => ErrorClass::PeerReset,
        _ => ErrorClass::Fatal,
    }
}

/// Shorthand for `classify(err) == ErrorClass::Transient`.
pub fn is_transient(err: &io::Error) -> bool {
    classify(err) == ErrorClass::Transient
}

#[cfg(unix)]
fn is_would_block(code: i32) -> bool {
    code == libc::EAGAIN || code == libc::EWOULDBLOCK
}

#[cfg(unix)]
fn is_in_progress(code: i32) -> bool {
    code == libc::EINPROGRESS
}

#[cfg(unix)]
fn is_conn_reset(code: i32) -> bool {
    // send(2) on Apple platforms can fail with EPROTOTYPE while the socket is
    // being torn down.
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    {
        if code == libc::EPROTOTYPE {
            return true;
        }
    }

    matches!(
        code,
        libc::ECONNRESET | libc::ECONNABORTED | libc::EPIPE | libc::ETIMEDOUT
    )
}

#[cfg(windows)]
mod wsa {
    pub(super) const WSAEWOULDBLOCK: i32 = 10035;
    pub(super) const WSAEINPROGRESS: i32 = 10036;
    pub(super) const WSAECONNABORTED: i32 = 10053;
    pub(super) const WSAECONNRESET: i32 = 10054;
    pub(super) const WSAETIMEDOUT: i32 = 10060;
}

#[cfg(windows)]
fn is_would_block(code: i32) -> bool {
    code == wsa::WSAEWOULDBLOCK
}

#[cfg(windows)]
fn is_in_progress(code: i32) -> bool {
    code == wsa::WSAEINPROGRESS
}

#[cfg(windows)]
fn is_conn_reset(code: i32) -> bool {
    matches!(
        code,
        wsa::WSAECONNRESET | wsa::WSAECONNABORTED | wsa::WSAETIMEDOUT
    )
}
