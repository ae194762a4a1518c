//! Connection handlers.
//!
//! A [`Handler`] owns one non-blocking socket plus its read and write
//! buffers. Handlers live in the engine's arena and refer to each other only
//! by [`HandlerId`], so a partner that has already been destroyed simply
//! fails to look up.

use std::fmt;
use std::io::{self, Read};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use mio::event::Source;
use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Token};
use socket2::{Domain, Protocol, Socket as RawSocket, Type};

use crate::config::Config;
use crate::crypto::Codec;
use crate::engine::buffer::ChunkBuffer;
use crate::engine::errno;
use crate::engine::mux::Multiplexer;
use crate::error::{Error, Result};
use crate::{BACKLOG, BUF_SIZE};

/// Arena handle of a handler. Never reused within one engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

impl HandlerId {
    /// Wrap a raw id.
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Multiplexer token for this handler.
    pub fn token(&self) -> Token {
        Token(self.0 as usize)
    }

    /// Handler a multiplexer token refers to.
    pub fn from_token(token: Token) -> Self {
        Self(token.0 as u64)
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// How the socket came to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    /// Outbound connection opened by the engine
    Positive,
    /// Inbound connection accepted from a listener
    Negative,
    /// Listening socket
    Listen,
}

/// Handshake progress. Ordered; a handler only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Status {
    /// Awaiting the SOCKS5 greeting
    Init,
    /// Greeting answered, awaiting the request (or tunnel header)
    Negotiated,
    /// Request consumed, DNS answer outstanding
    Requested,
    /// Address known, peer socket being opened
    Resolved,
    /// Paired with a peer handler
    PeerConnected,
    /// Torn down
    Closed,
}

/// Socket owned by a handler.
#[derive(Debug)]
pub enum Socket {
    /// Connected (or connecting) TCP stream
    Stream(TcpStream),
    /// Listening TCP socket
    Listener(TcpListener),
}

/// One socket with its buffers and handshake state.
pub struct Handler {
    id: HandlerId,
    tag: Tag,
    status: Status,
    socket: Option<Socket>,
    addr: SocketAddr,
    peer_target: Option<(String, u16)>,
    read_buf: ChunkBuffer,
    write_buf: ChunkBuffer,
    paired: Option<HandlerId>,
    direct_connect: bool,
    config: Arc<Config>,
    codec: Option<Codec>,
    registered: bool,
    interest: Option<Interest>,
    connected: bool,
    eof: bool,
    read_paused: bool,
    last_activity: Instant,
}

impl Handler {
    /// Wrap a stream.
    ///
    /// Positive handlers start unconnected: nothing is written until the
    /// connect has been confirmed by [`Handler::check_connect`].
    pub fn new_stream(
        id: HandlerId,
        tag: Tag,
        status: Status,
        stream: TcpStream,
        addr: SocketAddr,
        config: Arc<Config>,
        codec: Option<Codec>,
    ) -> Self {
        Self {
            id,
            tag,
            status,
            socket: Some(Socket::Stream(stream)),
            addr,
            peer_target: None,
            read_buf: ChunkBuffer::new(),
            write_buf: ChunkBuffer::new(),
            paired: None,
            direct_connect: false,
            config,
            codec,
            registered: false,
            interest: None,
            connected: tag != Tag::Positive,
            eof: false,
            read_paused: false,
            last_activity: Instant::now(),
        }
    }

    /// Create an unbound listening handler for `addr`.
    pub fn new_listener(id: HandlerId, addr: SocketAddr, config: Arc<Config>) -> Self {
        Self {
            id,
            tag: Tag::Listen,
            status: Status::Init,
            socket: None,
            addr,
            peer_target: None,
            read_buf: ChunkBuffer::new(),
            write_buf: ChunkBuffer::new(),
            paired: None,
            direct_connect: false,
            config,
            codec: None,
            registered: false,
            interest: None,
            connected: true,
            eof: false,
            read_paused: false,
            last_activity: Instant::now(),
        }
    }

    /// Bind and listen with `SO_REUSEADDR`. Returns the bound address.
    pub fn bind(&mut self) -> Result<SocketAddr> {
        if self.tag != Tag::Listen || self.socket.is_some() {
            return Err(Error::AlreadyRegistered(self.id));
        }

        let socket = RawSocket::new(Domain::for_address(self.addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&self.addr.into())?;
        socket.listen(BACKLOG)?;

        let listener = TcpListener::from_std(socket.into());
        self.addr = listener.local_addr()?;
        self.socket = Some(Socket::Listener(listener));
        Ok(self.addr)
    }

    pub fn id(&self) -> HandlerId {
        self.id
    }

    pub fn tag(&self) -> Tag {
        self.tag
    }

    pub fn status(&self) -> Status {
        self.status
    }

    /// Move to `status`. Backward moves are ignored.
    pub fn set_status(&mut self, status: Status) {
        if status < self.status {
            tracing::warn!(
                "handler {} refusing status change {:?} -> {:?}",
                self.id,
                self.status,
                status
            );
            return;
        }
        self.status = status;
    }

    /// Remote endpoint, or bind address for a listener.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// Host and port the engine must connect to once known.
    pub fn peer_target(&self) -> Option<(&str, u16)> {
        self.peer_target
            .as_ref()
            .map(|(host, port)| (host.as_str(), *port))
    }

    pub fn set_peer_target(&mut self, host: impl Into<String>, port: u16) {
        self.peer_target = Some((host.into(), port));
    }

    pub fn paired(&self) -> Option<HandlerId> {
        self.paired
    }

    /// Pair with `other`. Pairing is permanent; a second call is ignored.
    pub fn relate(&mut self, other: HandlerId) {
        if let Some(existing) = self.paired {
            tracing::warn!(
                "handler {} already paired with {}, ignoring {}",
                self.id,
                existing,
                other
            );
            return;
        }
        self.paired = Some(other);
    }

    pub fn direct_connect(&self) -> bool {
        self.direct_connect
    }

    /// Bypass the transport codec for everything read from now on.
    pub fn set_direct_connect(&mut self, direct: bool) {
        self.direct_connect = direct;
        if direct {
            self.codec = None;
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_closed(&self) -> bool {
        self.status == Status::Closed
    }

    /// Current interest set, if registered.
    pub fn interest(&self) -> Option<Interest> {
        self.interest
    }

    /// Peer half-closed while the partner still drains.
    pub fn is_eof(&self) -> bool {
        self.eof
    }

    pub fn mark_eof(&mut self) {
        self.eof = true;
    }

    /// Whether reading is suspended until the partner drains.
    pub fn is_read_paused(&self) -> bool {
        self.read_paused
    }

    /// Suspend or resume reading. Takes effect on the next interest update.
    pub fn set_read_paused(&mut self, paused: bool) {
        self.read_paused = paused;
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    /// Time since the last readiness event or read.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    fn source(&mut self) -> Option<&mut dyn Source> {
        match self.socket.as_mut()? {
            Socket::Stream(stream) => Some(stream),
            Socket::Listener(listener) => Some(listener),
        }
    }

    fn desired_interest(&self) -> Interest {
        let wants_write = self.tag != Tag::Listen && (!self.connected || !self.write_buf.is_empty());
        match (self.read_paused, wants_write) {
            // mio rejects an empty interest set.
            (true, _) => Interest::WRITABLE,
            (false, true) => Interest::READABLE | Interest::WRITABLE,
            (false, false) => Interest::READABLE,
        }
    }

    /// Register with the multiplexer under this handler's token.
    ///
    /// # Errors
    ///
    /// [`Error::AlreadyRegistered`] on a second call and [`Error::Closed`]
    /// once torn down. Both are caller bugs.
    pub fn register(&mut self, mux: &dyn Multiplexer) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed(self.id));
        }
        if self.registered {
            return Err(Error::AlreadyRegistered(self.id));
        }

        let id = self.id;
        let interest = self.desired_interest();
        let source = self.source().ok_or(Error::Closed(id))?;
        let token = id.token();
        mux.register(source, token, interest)?;

        self.registered = true;
        self.interest = Some(interest);
        Ok(())
    }

    /// Bring the registered interest in line with the buffers.
    pub fn update_interest(&mut self, mux: &dyn Multiplexer) -> Result<()> {
        if !self.registered || self.is_closed() {
            return Ok(());
        }

        let interest = self.desired_interest();
        if self.interest == Some(interest) {
            return Ok(());
        }

        let token = self.id.token();
        if let Some(source) = self.source() {
            mux.modify(source, token, interest)?;
        }
        self.interest = Some(interest);
        Ok(())
    }

    /// Unregister, close the socket and drop buffered data.
    ///
    /// Returns false if the handler was already closed.
    pub fn teardown(&mut self, mux: &dyn Multiplexer) -> bool {
        if self.is_closed() {
            return false;
        }

        if self.registered {
            let id = self.id;
            if let Some(source) = self.source() {
                if let Err(e) = mux.unregister(source) {
                    tracing::debug!("unregister {} failed: {}", id, e);
                }
            }
        }

        self.socket = None;
        self.registered = false;
        self.interest = None;
        self.status = Status::Closed;
        self.read_buf.clear();
        self.write_buf.clear();
        self.codec = None;
        true
    }

    /// Append to the read buffer, through the codec when asked and present.
    pub fn append_to_read_buffer(&mut self, data: &[u8], apply_codec: bool) -> Result<()> {
        let bytes = match (&mut self.codec, apply_codec) {
            (Some(codec), true) => codec.apply(data)?,
            _ => Bytes::copy_from_slice(data),
        };
        self.read_buf.push(bytes);
        Ok(())
    }

    /// Remove the first `min(n, len)` buffered bytes as one chunk.
    pub fn consume_from_read_buffer(&mut self, n: usize) -> Bytes {
        self.read_buf.consume(n)
    }

    /// Borrow the first `min(n, len)` buffered bytes contiguously.
    pub fn peek_read_buffer(&mut self, n: usize) -> &[u8] {
        self.read_buf.peek(n)
    }

    /// Take the whole read buffer, leaving it empty.
    pub fn take_read_buffer(&mut self) -> ChunkBuffer {
        std::mem::take(&mut self.read_buf)
    }

    pub fn read_len(&self) -> usize {
        self.read_buf.len()
    }

    pub fn write_len(&self) -> usize {
        self.write_buf.len()
    }

    /// Queue bytes for the socket.
    pub fn queue_write(&mut self, data: impl Into<Bytes>) {
        self.write_buf.push(data);
    }

    /// Queue every chunk of `data` for the socket.
    pub fn append_to_write_buffer(&mut self, data: &mut ChunkBuffer) {
        self.write_buf.append(data);
    }

    /// Read until the socket would block.
    ///
    /// Returns the number of bytes read and whether the peer closed its
    /// write half.
    pub fn read_available(&mut self, apply_codec: bool) -> Result<(usize, bool)> {
        self.read_up_to(apply_codec, usize::MAX)
    }

    /// Read until the socket would block or `limit` bytes have been read.
    ///
    /// Stopping at the limit leaves data in the socket; with edge-triggered
    /// readiness the caller has to come back for it without a new event.
    pub fn read_up_to(&mut self, apply_codec: bool, limit: usize) -> Result<(usize, bool)> {
        let mut buf = [0u8; BUF_SIZE];
        let mut total = 0;

        while total < limit {
            let want = (limit - total).min(BUF_SIZE);
            let read = match self.socket.as_mut() {
                Some(Socket::Stream(stream)) => stream.read(&mut buf[..want]),
                _ => return Err(Error::Closed(self.id)),
            };
            match read {
                Ok(0) => return Ok((total, true)),
                Ok(n) => {
                    total += n;
                    self.last_activity = Instant::now();
                    self.append_to_read_buffer(&buf[..n], apply_codec)?;
                }
                Err(e) if errno::is_transient(&e) => return Ok((total, false)),
                Err(e) => return Err(e.into()),
            }
        }
        Ok((total, false))
    }

    /// Write queued bytes until the socket would block.
    ///
    /// Does nothing before a positive handler's connect is confirmed.
    pub fn flush(&mut self) -> Result<usize> {
        if !self.connected || self.write_buf.is_empty() {
            return Ok(0);
        }
        match self.socket.as_mut() {
            Some(Socket::Stream(stream)) => Ok(self.write_buf.write_to(stream)?),
            _ => Err(Error::Closed(self.id)),
        }
    }

    /// Confirm a pending connect after a writable event.
    ///
    /// Returns `Ok(false)` when the connect is still in flight.
    pub fn check_connect(&mut self) -> Result<bool> {
        if self.connected {
            return Ok(true);
        }
        let stream = match self.socket.as_ref() {
            Some(Socket::Stream(stream)) => stream,
            _ => return Err(Error::Closed(self.id)),
        };

        if let Some(e) = stream.take_error()? {
            return Err(e.into());
        }
        match stream.peer_addr() {
            Ok(_) => {
                self.connected = true;
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotConnected || errno::is_transient(&e) => {
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Pending socket error, if any.
    pub fn take_socket_error(&self) -> Option<io::Error> {
        let result = match self.socket.as_ref()? {
            Socket::Stream(stream) => stream.take_error(),
            Socket::Listener(listener) => listener.take_error(),
        };
        match result {
            Ok(err) => err,
            Err(e) => Some(e),
        }
    }

    /// Address this handler's socket is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        match self.socket.as_ref() {
            Some(Socket::Stream(stream)) => Ok(stream.local_addr()?),
            Some(Socket::Listener(listener)) => Ok(listener.local_addr()?),
            None => Err(Error::Closed(self.id)),
        }
    }

    /// Accept one pending connection. `Ok(None)` once the backlog is empty.
    pub fn accept(&mut self) -> Result<Option<(TcpStream, SocketAddr)>> {
        let listener = match self.socket.as_ref() {
            Some(Socket::Listener(listener)) => listener,
            _ => return Err(Error::Closed(self.id)),
        };
        match listener.accept() {
            Ok(accepted) => Ok(Some(accepted)),
            Err(e) if errno::is_transient(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler")
            .field("id", &self.id)
            .field("tag", &self.tag)
            .field("status", &self.status)
            .field("addr", &self.addr)
            .field("paired", &self.paired)
            .field("direct_connect", &self.direct_connect)
            .field("read_len", &self.read_buf.len())
            .field("write_len", &self.write_buf.len())
            .finish()
    }
}

/// Open a non-blocking TCP connection to `addr` with `TCP_NODELAY` set.
///
/// A connect that is still in progress counts as success.
pub fn connect_nonblocking(addr: SocketAddr) -> Result<TcpStream> {
    let socket = RawSocket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    socket.set_nodelay(true)?;

    match socket.connect(&addr.into()) {
        Ok(()) => {}
        Err(e) if errno::is_transient(&e) => {}
        Err(e) => return Err(e.into()),
    }

    Ok(TcpStream::from_std(socket.into()))
}
