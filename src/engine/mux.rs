//! Readiness multiplexer capability.
//!
//! Handlers never talk to `mio` directly; they register through the
//! [`Multiplexer`] trait so tests can observe registrations without a poller.

use std::io;

use mio::event::{Event, Source};
use mio::{Interest, Registry, Token};

/// Register, modify and unregister sockets with a readiness source.
///
/// Error readiness is always reported; interests only select read/write.
pub trait Multiplexer {
    /// Start watching `source` under `token`.
    fn register(&self, source: &mut dyn Source, token: Token, interest: Interest) -> io::Result<()>;

    /// Change the interest set of an already registered source.
    fn modify(&self, source: &mut dyn Source, token: Token, interest: Interest) -> io::Result<()>;

    /// Stop watching `source`.
    fn unregister(&self, source: &mut dyn Source) -> io::Result<()>;
}

impl Multiplexer for Registry {
    fn register(&self, source: &mut dyn Source, token: Token, interest: Interest) -> io::Result<()> {
        Registry::register(self, source, token, interest)
    }

    fn modify(&self, source: &mut dyn Source, token: Token, interest: Interest) -> io::Result<()> {
        Registry::reregister(self, source, token, interest)
    }

    fn unregister(&self, source: &mut dyn Source) -> io::Result<()> {
        Registry::deregister(self, source)
    }
}

/// Readiness reported for one handler in one poll round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    /// Data (or EOF) can be read
    pub readable: bool,
    /// The send buffer has room, or a pending connect finished
    pub writable: bool,
    /// The socket has a pending error
    pub error: bool,
    /// The peer shut down its write half
    pub read_closed: bool,
}

impl Readiness {
    /// Readable only.
    pub const READABLE: Readiness = Readiness {
        readable: true,
        writable: false,
        error: false,
        read_closed: false,
    };

    /// Writable only.
    pub const WRITABLE: Readiness = Readiness {
        readable: false,
        writable: true,
        error: false,
        read_closed: false,
    };

    /// Error only.
    pub const ERROR: Readiness = Readiness {
        readable: false,
        writable: false,
        error: true,
        read_closed: false,
    };
}

impl From<&Event> for Readiness {
    fn from(event: &Event) -> Self {
        Self {
            readable: event.is_readable(),
            writable: event.is_writable(),
            error: event.is_error(),
            read_closed: event.is_read_closed(),
        }
    }
}
