//! The event loop.
//!
//! [`Reactor`] owns the `mio` poller and an [`Engine`] wired to the real
//! registry and the background [`DnsResolver`]. Each round polls for
//! readiness, dispatches events, feeds DNS answers back to the engine and
//! runs the periodic hook once per [`TICK`].

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::{Events, Poll, Registry, Token, Waker};

use super::dns::DnsResolver;
use super::handler::HandlerId;
use super::mux::Readiness;
use super::Engine;
use crate::config::Config;
use crate::error::Result;
use crate::proxy::role::Role;

/// Token reserved for the DNS waker. Handler ids never reach it.
pub const WAKER_TOKEN: Token = Token(usize::MAX);

/// Interval of the periodic hook.
pub const TICK: Duration = Duration::from_secs(1);

const EVENT_CAPACITY: usize = 1024;

/// Single-threaded event loop driving one endpoint.
pub struct Reactor<R> {
    poll: Poll,
    events: Events,
    engine: Engine<R, Registry, DnsResolver>,
    last_tick: Instant,
}

impl<R: Role> Reactor<R> {
    /// Create the poller, the resolver and an engine for `role`.
    pub fn new(role: R, config: Arc<Config>) -> Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let resolver =
            DnsResolver::new(config.dns_timeout, config.dns_cache_ttl)?.with_waker(waker);
        let registry = poll.registry().try_clone()?;

        Ok(Self {
            poll,
            events: Events::with_capacity(EVENT_CAPACITY),
            engine: Engine::new(role, registry, resolver, config),
            last_tick: Instant::now(),
        })
    }

    pub fn engine(&self) -> &Engine<R, Registry, DnsResolver> {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut Engine<R, Registry, DnsResolver> {
        &mut self.engine
    }

    /// Start listening on `addr`. Returns the bound address.
    pub fn listen(&mut self, addr: SocketAddr) -> Result<SocketAddr> {
        self.engine.listen(addr)
    }

    /// Run one poll round, waiting at most `timeout`.
    ///
    /// Returns the number of socket events dispatched.
    pub fn run_once(&mut self, timeout: Option<Duration>) -> Result<usize> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(0),
            Err(e) => return Err(e.into()),
        }

        let mut dispatched = 0;
        for event in self.events.iter() {
            if event.token() == WAKER_TOKEN {
                continue;
            }
            self.engine
                .handle_events(HandlerId::from_token(event.token()), Readiness::from(event));
            dispatched += 1;
        }

        self.engine.process_resolutions();

        let now = Instant::now();
        if now.saturating_duration_since(self.last_tick) >= TICK {
            self.last_tick = now;
            self.engine.handle_periodic(now);
        }

        Ok(dispatched)
    }

    /// Run until polling fails.
    pub fn run(&mut self) -> Result<()> {
        tracing::info!("{} reactor started", self.engine.role().name());
        loop {
            self.run_once(Some(TICK))?;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::{TcpListener as StdListener, TcpStream as StdStream};
    use std::thread;

    use super::*;
    use crate::crypto::Method;
    use crate::proxy::local::LocalRole;
    use crate::proxy::remote::RemoteRole;

    /// Echo every byte back until the client closes.
    fn spawn_echo_server() -> SocketAddr {
        let listener = StdListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 4096];
            loop {
                match stream.read(&mut buf) {
                    Ok(0) | Err(_) => return,
                    Ok(n) => {
                        if stream.write_all(&buf[..n]).is_err() {
                            return;
                        }
                    }
                }
            }
        });
        addr
    }

    fn connect_request(target: SocketAddr) -> Vec<u8> {
        let SocketAddr::V4(target) = target else {
            panic!("IPv4 target expected");
        };
        let mut wire = vec![5, 1, 0, 5, 1, 0, 1];
        wire.extend_from_slice(&target.ip().octets());
        wire.extend_from_slice(&target.port().to_be_bytes());
        wire
    }

    fn client(addr: SocketAddr) -> StdStream {
        let client = StdStream::connect(addr).unwrap();
        client.set_read_timeout(Some(Duration::from_millis(2))).unwrap();
        client
    }

    /// Read `n` bytes from `client`, running `pump` between attempts.
    fn read_pumping(client: &mut StdStream, n: usize, mut pump: impl FnMut()) -> Vec<u8> {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut out = Vec::with_capacity(n);
        let mut buf = vec![0u8; 16 * 1024];

        while out.len() < n {
            assert!(Instant::now() < deadline, "expected {} bytes, got {}", n, out.len());
            pump();
            let want = (n - out.len()).min(buf.len());
            match client.read(&mut buf[..want]) {
                Ok(0) => panic!("connection closed after {} bytes", out.len()),
                Ok(k) => out.extend_from_slice(&buf[..k]),
                Err(_) => {}
            }
        }
        out
    }

    fn pump<R: Role>(reactor: &mut Reactor<R>) {
        reactor.run_once(Some(Duration::from_millis(1))).unwrap();
    }

    #[test]
    fn test_direct_flow_end_to_end() {
        let echo = spawn_echo_server();

        let mut config = Config::new("127.0.0.1", 8388, "pw").unwrap();
        config.method = Method::Plain;
        config.direct_hosts = vec!["127.0.0.1".into()];
        let role = LocalRole::new(&config);
        let mut local = Reactor::new(role, Arc::new(config)).unwrap();
        let addr = local.listen("127.0.0.1:0".parse().unwrap()).unwrap();

        let mut client = client(addr);
        client.write_all(&connect_request(echo)).unwrap();

        let reply = read_pumping(&mut client, 12, || pump(&mut local));
        assert_eq!(reply[..2], [5, 0]);
        assert_eq!(reply[2..6], [5, 0, 0, 1]);

        client.write_all(b"hello").unwrap();
        let echoed = read_pumping(&mut client, 5, || pump(&mut local));
        assert_eq!(echoed, b"hello");

        let stats = local.engine().stats().snapshot();
        assert_eq!(stats.peer_connections, 1);
        assert_eq!(stats.bytes_relayed, 10);

        drop(client);
        let deadline = Instant::now() + Duration::from_secs(5);
        while local.engine().connection_count() > 0 {
            assert!(Instant::now() < deadline, "pair was not torn down");
            pump(&mut local);
        }
    }

    #[test]
    fn test_tunneled_flow_end_to_end() {
        let echo = spawn_echo_server();

        let remote_config = Config::new("127.0.0.1", 8388, "tunnel secret").unwrap();
        let mut remote = Reactor::new(RemoteRole::new(), Arc::new(remote_config)).unwrap();
        let remote_addr = remote.listen("127.0.0.1:0".parse().unwrap()).unwrap();

        let local_config = Config::new("127.0.0.1", remote_addr.port(), "tunnel secret").unwrap();
        assert_eq!(local_config.method, Method::ChaCha20IetfPoly1305);
        let role = LocalRole::new(&local_config);
        let mut local = Reactor::new(role, Arc::new(local_config)).unwrap();
        let local_addr = local.listen("127.0.0.1:0".parse().unwrap()).unwrap();

        let mut client = client(local_addr);
        client.write_all(&connect_request(echo)).unwrap();
        client.write_all(b"ping").unwrap();

        let mut pump_both = || {
            pump(&mut local);
            pump(&mut remote);
        };
        let reply = read_pumping(&mut client, 12, &mut pump_both);
        assert_eq!(reply[..2], [5, 0]);
        let echoed = read_pumping(&mut client, 4, &mut pump_both);
        assert_eq!(echoed, b"ping");

        // Large enough to span several codec chunks.
        let payload: Vec<u8> = (0..40_000u32).map(|i| (i % 251) as u8).collect();
        client.write_all(&payload).unwrap();
        let echoed = read_pumping(&mut client, payload.len(), &mut pump_both);
        assert_eq!(echoed, payload);
    }

    #[test]
    fn test_run_once_without_events() {
        let config = Config::new("127.0.0.1", 8388, "pw").unwrap();
        let mut reactor = Reactor::new(RemoteRole::new(), Arc::new(config)).unwrap();
        reactor.listen("127.0.0.1:0".parse().unwrap()).unwrap();

        assert_eq!(reactor.run_once(Some(Duration::from_millis(1))).unwrap(), 0);
        assert_eq!(reactor.engine().connection_count(), 0);
    }
}
