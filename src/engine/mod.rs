//! The connection engine.
//!
//! [`Engine`] owns every [`Handler`] in an arena keyed by [`HandlerId`] and
//! turns readiness events into handshake steps, relaying and teardown. It is
//! single-threaded: the reactor thread is the only one that ever touches a
//! handler. The pieces it depends on are injected:
//!
//! - a [`Role`] deciding what handshake bytes mean (local or remote endpoint)
//! - a [`Multiplexer`] sockets are registered with
//! - a [`Resolver`] whose answers are fed back through
//!   [`Engine::process_resolutions`]
//!
//! Teardown always goes through [`Engine::destroy`], which is idempotent and
//! takes the partner handler down with it.

pub mod buffer;
pub mod dns;
pub mod errno;
pub mod handler;
pub mod mux;
pub mod reactor;
pub mod stats;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::net::TcpStream;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::proxy::role::{Role, RoleContext};

pub use dns::{DnsResolver, Resolution, Resolver};
pub use handler::{connect_nonblocking, Handler, HandlerId, Status, Tag};
pub use mux::{Multiplexer, Readiness};
pub use reactor::Reactor;
pub use stats::{EngineStats, StatsSnapshot};

/// How often the periodic hook logs statistics and purges the DNS cache.
const REPORT_INTERVAL: Duration = Duration::from_secs(60);

/// A handler stops reading once its partner has this much queued to write.
pub const RELAY_HIGH_WATER: usize = 4 * crate::BUF_SIZE;

/// A paused handler resumes once its partner's queue drops below this.
pub const RELAY_LOW_WATER: usize = crate::BUF_SIZE;

/// Handler arena plus the event dispatch around it.
pub struct Engine<R, M, D> {
    role: R,
    mux: M,
    resolver: D,
    config: Arc<Config>,
    handlers: HashMap<HandlerId, Handler>,
    next_id: u64,
    listener: Option<HandlerId>,
    stats: Arc<EngineStats>,
    last_report: Instant,
}

impl<R: Role, M: Multiplexer, D: Resolver> Engine<R, M, D> {
    /// Create an engine with no handlers.
    pub fn new(role: R, mux: M, resolver: D, config: Arc<Config>) -> Self {
        Self {
            role,
            mux,
            resolver,
            config,
            handlers: HashMap::new(),
            next_id: 0,
            listener: None,
            stats: Arc::new(EngineStats::new()),
            last_report: Instant::now(),
        }
    }

    pub fn role(&self) -> &R {
        &self.role
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn multiplexer(&self) -> &M {
        &self.mux
    }

    pub fn resolver_mut(&mut self) -> &mut D {
        &mut self.resolver
    }

    /// Shared statistics counters.
    pub fn stats(&self) -> Arc<EngineStats> {
        Arc::clone(&self.stats)
    }

    pub fn handler(&self, id: HandlerId) -> Option<&Handler> {
        self.handlers.get(&id)
    }

    pub fn handler_mut(&mut self, id: HandlerId) -> Option<&mut Handler> {
        self.handlers.get_mut(&id)
    }

    /// Status of `id`; destroyed handlers report [`Status::Closed`].
    pub fn status(&self, id: HandlerId) -> Status {
        self.handlers
            .get(&id)
            .map_or(Status::Closed, |handler| handler.status())
    }

    pub fn is_alive(&self, id: HandlerId) -> bool {
        self.handlers.contains_key(&id)
    }

    /// Ids of every live handler, oldest first.
    pub fn handler_ids(&self) -> Vec<HandlerId> {
        let mut ids: Vec<HandlerId> = self.handlers.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Number of live non-listening handlers.
    pub fn connection_count(&self) -> usize {
        self.handlers
            .values()
            .filter(|handler| handler.tag() != Tag::Listen)
            .count()
    }

    pub fn listener_id(&self) -> Option<HandlerId> {
        self.listener
    }

    /// Address the listening handler is bound to.
    pub fn listener_addr(&self) -> Option<SocketAddr> {
        self.listener
            .and_then(|id| self.handlers.get(&id))
            .map(|handler| handler.addr())
    }

    fn alloc_id(&mut self) -> HandlerId {
        self.next_id += 1;
        HandlerId::new(self.next_id)
    }

    /// Bind the listening handler and register it. Returns the bound address.
    pub fn listen(&mut self, addr: SocketAddr) -> Result<SocketAddr> {
        if let Some(id) = self.listener {
            return Err(Error::AlreadyRegistered(id));
        }

        let id = self.alloc_id();
        let mut handler = Handler::new_listener(id, addr, Arc::clone(&self.config));
        let bound = handler.bind()?;
        handler.register(&self.mux)?;

        self.handlers.insert(id, handler);
        self.listener = Some(id);
        tracing::info!("{} endpoint listening on {}", self.role.name(), bound);
        Ok(bound)
    }

    /// Dispatch one readiness report for `id`.
    pub fn handle_events(&mut self, id: HandlerId, readiness: Readiness) {
        let tag = match self.handlers.get_mut(&id) {
            Some(handler) => {
                handler.touch(Instant::now());
                handler.tag()
            }
            None => {
                tracing::debug!("event for destroyed handler {}", id);
                return;
            }
        };

        if tag == Tag::Listen {
            if readiness.error {
                if let Some(e) = self.handlers.get(&id).and_then(|h| h.take_socket_error()) {
                    tracing::error!("listener {} error: {}", id, e);
                }
            }
            if readiness.readable {
                self.accept(id);
            }
            return;
        }

        if readiness.error {
            self.on_sock_error(id);
            return;
        }
        if readiness.writable {
            self.on_writable(id);
        }
        if (readiness.readable || readiness.read_closed) && self.is_alive(id) {
            self.on_readable(id);
        }
    }

    /// Dispatch every DNS answer that has arrived.
    pub fn process_resolutions(&mut self) {
        for resolution in self.resolver.drain() {
            self.on_dns_resolved(resolution);
        }
    }

    /// Continue a handler's setup with its DNS answer.
    ///
    /// Failures destroy the handler; success opens the peer socket on the
    /// port recorded with the request.
    pub fn on_dns_resolved(&mut self, resolution: Resolution) {
        let Resolution { id, host, result } = resolution;

        let port = match self.handlers.get(&id) {
            Some(handler) if handler.status() == Status::Requested => {
                handler.peer_target().map(|(_, port)| port)
            }
            Some(handler) => {
                tracing::debug!("ignoring DNS answer for {} in {:?}", id, handler.status());
                return;
            }
            None => {
                tracing::debug!("DNS answer for {} arrived after teardown", id);
                return;
            }
        };

        let (ip, port) = match (result, port) {
            (Ok(ip), Some(port)) => (ip, port),
            (Err(e), _) => return self.fail(id, e),
            (Ok(_), None) => return self.fail(id, Error::resolve(host, "no peer target recorded")),
        };

        if let Some(handler) = self.handlers.get_mut(&id) {
            handler.set_status(Status::Resolved);
        }
        tracing::debug!("{} resolved {} to {}", id, host, ip);
        self.create_peer_socket(id, SocketAddr::new(ip, port));
    }

    /// Periodic hook: reap idle handlers and report statistics.
    pub fn handle_periodic(&mut self, now: Instant) {
        let timeout = self.config.timeout;
        let idle: Vec<HandlerId> = self
            .handlers
            .values()
            .filter(|handler| handler.tag() != Tag::Listen && handler.idle_for(now) > timeout)
            .map(|handler| handler.id())
            .collect();

        for id in idle {
            if self.is_alive(id) {
                tracing::debug!("{} idle for more than {}s, closing", id, timeout.as_secs());
                self.destroy(id);
            }
        }

        if now.saturating_duration_since(self.last_report) >= REPORT_INTERVAL {
            self.last_report = now;
            self.resolver.purge();

            let s = self.stats.snapshot();
            tracing::debug!(
                "{} stats: active={} total={} peers={} dns_failures={} protocol_errors={} relayed={}B ({:.0}B/s)",
                self.role.name(),
                s.active_connections,
                s.total_connections,
                s.peer_connections,
                s.dns_failures,
                s.protocol_errors,
                s.bytes_relayed,
                s.throughput_bps()
            );
        }
    }

    /// Tear down `id` and its partner. Unknown ids are ignored.
    pub fn destroy(&mut self, id: HandlerId) {
        let Some(mut handler) = self.handlers.remove(&id) else {
            return;
        };
        handler.teardown(&self.mux);

        if handler.tag() == Tag::Listen {
            self.listener = None;
            tracing::info!("{} listener {} closed", self.role.name(), id);
        } else {
            self.stats.connection_closed();
            tracing::debug!("destroyed {} ({})", id, handler.addr());
        }

        if let Some(partner) = handler.paired() {
            self.destroy(partner);
        }
    }

    fn fail(&mut self, id: HandlerId, err: Error) {
        let name = self.role.name();
        if err.is_quiet() {
            tracing::debug!("{} {} closed: {}", name, id, err);
        } else if err.is_protocol_violation() {
            self.stats.protocol_error();
            tracing::error!("{} {} protocol violation: {}", name, id, err);
        } else if err.is_programming_error() {
            tracing::warn!("{} {} misused: {}", name, id, err);
        } else if matches!(err, Error::Resolve { .. }) {
            self.stats.dns_failed();
            tracing::error!("{} {} {}", name, id, err);
        } else {
            tracing::error!("{} {} failed: {}", name, id, err);
        }
        self.destroy(id);
    }

    fn accept(&mut self, listener: HandlerId) {
        loop {
            let accepted = match self.handlers.get_mut(&listener) {
                Some(handler) => handler.accept(),
                None => return,
            };

            match accepted {
                Ok(Some((stream, addr))) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!("cannot set TCP_NODELAY for {}: {}", addr, e);
                    }
                    let status = self.role.initial_status();
                    match self.spawn_handler(Tag::Negative, status, stream, addr, false) {
                        Ok(id) => tracing::debug!("{} accepted {} as {}", self.role.name(), addr, id),
                        Err(e) => tracing::error!("cannot register connection from {}: {}", addr, e),
                    }
                }
                Ok(None) => return,
                Err(e) => {
                    tracing::error!("accept on {} failed: {}", listener, e);
                    return;
                }
            }
        }
    }

    fn spawn_handler(
        &mut self,
        tag: Tag,
        status: Status,
        stream: TcpStream,
        addr: SocketAddr,
        direct: bool,
    ) -> Result<HandlerId> {
        let id = self.alloc_id();
        let codec = if direct {
            None
        } else {
            self.role.codec_direction(tag).map(|dir| self.config.codec(dir))
        };

        let mut handler =
            Handler::new_stream(id, tag, status, stream, addr, Arc::clone(&self.config), codec);
        handler.set_direct_connect(direct);
        handler.register(&self.mux)?;

        self.handlers.insert(id, handler);
        self.stats.connection_opened();
        Ok(id)
    }

    /// Open the peer socket for `id`, pair the two handlers and hand the
    /// initiator's buffered payload to the peer.
    fn create_peer_socket(&mut self, id: HandlerId, addr: SocketAddr) {
        let (direct, target) = match self.handlers.get(&id) {
            Some(handler) => (
                handler.direct_connect(),
                handler
                    .peer_target()
                    .map(|(host, port)| format!("{}:{}", host, port))
                    .unwrap_or_default(),
            ),
            None => return,
        };

        let stream = match connect_nonblocking(addr) {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!("{} {} cannot connect to {}: {}", self.role.name(), id, addr, e);
                self.destroy(id);
                return;
            }
        };

        let peer_id = match self.spawn_handler(Tag::Positive, Status::PeerConnected, stream, addr, direct) {
            Ok(peer_id) => peer_id,
            Err(e) => return self.fail(id, e),
        };

        let mut pending = match self.handlers.get_mut(&id) {
            Some(handler) => {
                handler.relate(peer_id);
                handler.set_status(Status::PeerConnected);
                handler.take_read_buffer()
            }
            None => return self.destroy(peer_id),
        };
        if let Some(peer) = self.handlers.get_mut(&peer_id) {
            peer.relate(id);
            self.stats.add_relayed(pending.len() as u64);
            peer.append_to_write_buffer(&mut pending);
        }
        self.stats.peer_opened();

        tracing::info!(
            "{} {} connecting to {} via {} ({})",
            self.role.name(),
            id,
            target,
            addr,
            if direct { "direct" } else { "tunnel" }
        );
        self.flush(id);
    }

    fn on_sock_error(&mut self, id: HandlerId) {
        match self.handlers.get(&id).and_then(|h| h.take_socket_error()) {
            Some(e) => self.fail(id, e.into()),
            None => {
                tracing::debug!("{} reported an error without a pending socket error", id);
                self.destroy(id);
            }
        }
    }

    fn on_writable(&mut self, id: HandlerId) {
        let Some(handler) = self.handlers.get_mut(&id) else {
            return;
        };

        if !handler.is_connected() {
            match handler.check_connect() {
                Ok(true) => tracing::debug!("{} connected to {}", id, handler.addr()),
                Ok(false) => return,
                Err(e) => {
                    tracing::warn!("{} connect to {} failed: {}", id, handler.addr(), e);
                    self.destroy(id);
                    return;
                }
            }
        }
        self.flush(id);
    }

    fn on_readable(&mut self, id: HandlerId) {
        match self.status(id) {
            status @ (Status::Init | Status::Negotiated) => self.on_handshake_readable(id, status),
            Status::Requested | Status::Resolved | Status::PeerConnected => self.on_relay_readable(id),
            Status::Closed => {}
        }
    }

    fn on_handshake_readable(&mut self, id: HandlerId, status: Status) {
        let Some(handler) = self.handlers.get_mut(&id) else {
            return;
        };
        let mut ctx = RoleContext {
            resolver: &mut self.resolver,
        };

        let result = match status {
            Status::Init => self.role.on_receive_negotiation(handler, &mut ctx),
            _ => self.role.on_receive_syn(handler, &mut ctx),
        };
        match result {
            Ok(()) => self.flush(id),
            Err(e) => self.fail(id, e),
        }
    }

    /// Bytes `id` may still read before its partner's queue is full.
    ///
    /// Unpaired handlers are bounded by their own read buffer instead.
    fn relay_room(&self, id: HandlerId) -> usize {
        let Some(handler) = self.handlers.get(&id) else {
            return 0;
        };
        let queued = match handler.paired().and_then(|p| self.handlers.get(&p)) {
            Some(partner) => partner.write_len(),
            None => handler.read_len(),
        };
        RELAY_HIGH_WATER.saturating_sub(queued)
    }

    fn on_relay_readable(&mut self, id: HandlerId) {
        loop {
            let room = self.relay_room(id);
            let Some(handler) = self.handlers.get_mut(&id) else {
                return;
            };
            if room == 0 {
                if !handler.is_read_paused() {
                    tracing::debug!("{} pausing reads until its partner drains", id);
                    handler.set_read_paused(true);
                    if let Err(e) = handler.update_interest(&self.mux) {
                        self.fail(id, e);
                    }
                }
                return;
            }

            let (read, eof) = match handler.read_up_to(true, room) {
                Ok(outcome) => outcome,
                Err(e) => return self.fail(id, e),
            };
            if read > 0 {
                self.forward(id);
            }
            if eof {
                if self.is_alive(id) {
                    self.on_eof(id);
                }
                return;
            }
            // Short of the limit means the socket would block.
            if read < room || !self.is_alive(id) {
                return;
            }
        }
    }

    /// Let the partner of `id` read again once `id` has drained enough.
    fn resume_partner(&mut self, id: HandlerId) {
        let partner = match self.handlers.get(&id) {
            Some(handler) if handler.write_len() < RELAY_LOW_WATER => handler.paired(),
            _ => None,
        };
        let Some(partner) = partner else {
            return;
        };
        let Some(handler) = self.handlers.get_mut(&partner) else {
            return;
        };
        if !handler.is_read_paused() {
            return;
        }

        handler.set_read_paused(false);
        if let Err(e) = handler.update_interest(&self.mux) {
            return self.fail(partner, e);
        }
        tracing::debug!("{} resuming reads", partner);
        // Data left in the socket raises no new edge.
        self.on_relay_readable(partner);
    }

    /// Move `id`'s read buffer to its partner's write buffer and flush it.
    fn forward(&mut self, id: HandlerId) {
        let (partner, mut data) = match self.handlers.get_mut(&id) {
            Some(handler) => match handler.paired() {
                Some(partner) => (partner, handler.take_read_buffer()),
                None => return,
            },
            None => return,
        };
        if data.is_empty() {
            return;
        }

        match self.handlers.get_mut(&partner) {
            Some(peer) => {
                self.stats.add_relayed(data.len() as u64);
                peer.touch(Instant::now());
                peer.append_to_write_buffer(&mut data);
            }
            None => return self.destroy(id),
        }
        self.flush(partner);
    }

    /// Peer closed its write half: linger while the partner drains, otherwise
    /// tear the pair down.
    fn on_eof(&mut self, id: HandlerId) {
        let partner = self.handlers.get(&id).and_then(|h| h.paired());
        let draining = partner
            .and_then(|p| self.handlers.get(&p))
            .map_or(false, |p| p.write_len() > 0);

        if draining {
            tracing::debug!("{} reached EOF, waiting for partner to drain", id);
            if let Some(handler) = self.handlers.get_mut(&id) {
                handler.mark_eof();
            }
        } else {
            tracing::debug!("{} reached EOF", id);
            self.destroy(id);
        }
    }

    fn flush(&mut self, id: HandlerId) {
        let Some(handler) = self.handlers.get_mut(&id) else {
            return;
        };

        let written = match handler.flush() {
            Ok(written) => written,
            Err(e) => return self.fail(id, e),
        };
        let drained = handler.write_len() == 0;
        let partner = handler.paired();
        if let Err(e) = handler.update_interest(&self.mux) {
            return self.fail(id, e);
        }

        // A paused partner sees no events of its own while we drain for it.
        let now = Instant::now();
        let partner_done = match partner.and_then(|p| self.handlers.get_mut(&p)) {
            Some(p) => {
                if written > 0 {
                    p.touch(now);
                }
                p.is_eof()
            }
            None => false,
        };
        if drained && partner_done {
            tracing::debug!("{} drained after partner EOF", id);
            self.destroy(id);
            return;
        }
        self.resume_partner(id);
    }
}


#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::{IpAddr, Ipv4Addr, TcpListener as StdListener};

    use mio::Interest;

    use super::testing::*;
    use super::*;
    use crate::crypto::Method;
    use crate::proxy::local::LocalRole;

    fn direct_config() -> Config {
        let mut config = Config::new("127.0.0.1", 8388, "pw").unwrap();
        config.method = Method::Plain;
        config.direct_hosts = vec!["127.0.0.1".into()];
        config
    }

    fn local_engine(config: Config) -> TestEngine<LocalRole> {
        test_engine(LocalRole::new(&config), config)
    }

    fn connect_request(port: u16) -> Vec<u8> {
        let mut req = vec![5, 1, 0, 1, 127, 0, 0, 1];
        req.extend_from_slice(&port.to_be_bytes());
        req
    }

    /// Bring a client to `Requested` for a direct CONNECT to `port` with `payload`.
    fn requested(engine: &mut TestEngine<LocalRole>, port: u16, payload: &[u8]) -> (std::net::TcpStream, HandlerId) {
        let (mut client, id) = accept_client(engine);
        let mut wire = vec![5, 1, 0];
        wire.extend_from_slice(&connect_request(port));
        wire.extend_from_slice(payload);
        client.write_all(&wire).unwrap();

        drive(engine, id, |e| e.status(id) == Status::Requested);
        assert_eq!(read_exact(&mut client, 12)[..4], [5, 0, 5, 0]);
        (client, id)
    }

    #[test]
    fn test_listen_registers_once() {
        let mut engine = local_engine(direct_config());
        let addr = engine.listen("127.0.0.1:0".parse().unwrap()).unwrap();

        assert_eq!(engine.listener_addr(), Some(addr));
        assert!(matches!(
            engine.listen("127.0.0.1:0".parse().unwrap()),
            Err(Error::AlreadyRegistered(_))
        ));
        assert_eq!(engine.connection_count(), 0);
    }

    #[test]
    fn test_accept_registers_negative_handler() {
        let mut engine = local_engine(direct_config());
        let (_client, id) = accept_client(&mut engine);

        let handler = engine.handler(id).unwrap();
        assert_eq!(handler.tag(), Tag::Negative);
        assert_eq!(handler.status(), Status::Init);
        assert_eq!(handler.interest(), Some(Interest::READABLE));
        assert_eq!(engine.multiplexer().registrations(id.token()), 1);
        assert_eq!(engine.stats().snapshot().active_connections, 1);
    }

    #[test]
    fn test_destroy_twice_is_noop() {
        let mut engine = local_engine(direct_config());
        let (mut client, id) = accept_client(&mut engine);

        engine.destroy(id);
        engine.destroy(id);

        assert!(!engine.is_alive(id));
        assert_eq!(engine.status(id), Status::Closed);
        assert_eq!(engine.stats().snapshot().active_connections, 0);

        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_events_for_destroyed_handler_are_ignored() {
        let mut engine = local_engine(direct_config());
        let (_client, id) = accept_client(&mut engine);
        engine.destroy(id);

        engine.handle_events(id, Readiness::READABLE);
        engine.handle_events(id, Readiness::ERROR);
        assert!(!engine.is_alive(id));
    }

    #[test]
    fn test_dns_failure_destroys() {
        let mut engine = local_engine(direct_config());
        let (_client, id) = requested(&mut engine, 9, b"");

        engine
            .resolver_mut()
            .answer(id, "127.0.0.1", Err(Error::resolve("127.0.0.1", "refused")));
        engine.process_resolutions();

        assert!(!engine.is_alive(id));
        assert_eq!(engine.stats().snapshot().dns_failures, 1);
    }

    #[test]
    fn test_late_dns_answer_is_ignored() {
        let mut engine = local_engine(direct_config());
        let (_client, id) = requested(&mut engine, 9, b"");
        engine.destroy(id);

        engine
            .resolver_mut()
            .answer(id, "127.0.0.1", Ok(IpAddr::V4(Ipv4Addr::LOCALHOST)));
        engine.process_resolutions();
        assert_eq!(engine.connection_count(), 0);
    }

    #[test]
    fn test_resolution_pairs_handlers() {
        let target = StdListener::bind("127.0.0.1:0").unwrap();
        let port = target.local_addr().unwrap().port();

        let mut engine = local_engine(direct_config());
        let (_client, id) = requested(&mut engine, port, b"abc");

        engine
            .resolver_mut()
            .answer(id, "127.0.0.1", Ok(IpAddr::V4(Ipv4Addr::LOCALHOST)));
        engine.process_resolutions();

        assert_eq!(engine.status(id), Status::PeerConnected);
        let peer_id = engine.handler(id).unwrap().paired().unwrap();
        let peer = engine.handler(peer_id).unwrap();
        assert_eq!(peer.tag(), Tag::Positive);
        assert_eq!(peer.status(), Status::PeerConnected);
        assert_eq!(peer.paired(), Some(id));
        assert!(peer.direct_connect());
        assert_eq!(peer.write_len(), 3);
        assert_eq!(peer.interest(), Some(Interest::READABLE | Interest::WRITABLE));
        assert_eq!(engine.handler(id).unwrap().read_len(), 0);
        assert_eq!(engine.stats().snapshot().peer_connections, 1);

        // Connect completion lets the buffered payload through.
        let (mut upstream, _) = target.accept().unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while engine.handler(peer_id).unwrap().write_len() > 0 {
            assert!(Instant::now() < deadline);
            engine.handle_events(peer_id, Readiness::WRITABLE);
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(read_exact(&mut upstream, 3), b"abc");
    }

    #[test]
    fn test_destroy_propagates_to_partner() {
        let target = StdListener::bind("127.0.0.1:0").unwrap();
        let port = target.local_addr().unwrap().port();

        let mut engine = local_engine(direct_config());
        let (_client, id) = requested(&mut engine, port, b"");
        engine
            .resolver_mut()
            .answer(id, "127.0.0.1", Ok(IpAddr::V4(Ipv4Addr::LOCALHOST)));
        engine.process_resolutions();
        let peer_id = engine.handler(id).unwrap().paired().unwrap();

        engine.destroy(peer_id);
        assert!(!engine.is_alive(peer_id));
        assert!(!engine.is_alive(id));
        assert_eq!(engine.connection_count(), 0);

        engine.destroy(id);
        assert_eq!(engine.stats().snapshot().active_connections, 0);
    }

    #[test]
    fn test_idle_handlers_are_reaped() {
        let mut engine = local_engine(direct_config());
        let (_client, id) = accept_client(&mut engine);
        let timeout = engine.config().timeout;

        engine.handle_periodic(Instant::now());
        assert!(engine.is_alive(id));

        engine.handle_periodic(Instant::now() + timeout + Duration::from_secs(1));
        assert!(!engine.is_alive(id));
        assert!(engine.listener_id().is_some());
    }

    /// Pair a direct request with a listening upstream and wait for the
    /// connect to complete.
    fn connected_pair(
        engine: &mut TestEngine<LocalRole>,
    ) -> (std::net::TcpStream, HandlerId, HandlerId, std::net::TcpStream) {
        let target = StdListener::bind("127.0.0.1:0").unwrap();
        let port = target.local_addr().unwrap().port();
        let (client, id) = requested(engine, port, b"");

        engine
            .resolver_mut()
            .answer(id, "127.0.0.1", Ok(IpAddr::V4(Ipv4Addr::LOCALHOST)));
        engine.process_resolutions();
        let peer_id = engine.handler(id).unwrap().paired().unwrap();

        let (upstream, _) = target.accept().unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while !engine.handler(peer_id).unwrap().is_connected() {
            assert!(Instant::now() < deadline, "connect was not confirmed");
            engine.handle_events(peer_id, Readiness::WRITABLE);
            std::thread::sleep(Duration::from_millis(1));
        }
        (client, id, peer_id, upstream)
    }

    #[test]
    fn test_relay_pauses_for_slow_reader() {
        const TOTAL: usize = 16 * 1024 * 1024;

        let mut engine = local_engine(direct_config());
        let (mut client, id, peer_id, mut upstream) = connected_pair(&mut engine);

        let writer = std::thread::spawn(move || {
            let data: Vec<u8> = (0..TOTAL).map(|i| (i % 251) as u8).collect();
            let _ = upstream.write_all(&data);
        });

        // The client reads nothing until the upstream handler backs off.
        let mut peak = 0;
        let deadline = Instant::now() + Duration::from_secs(5);
        while !engine.handler(peer_id).unwrap().is_read_paused() {
            assert!(Instant::now() < deadline, "reads were never paused");
            engine.handle_events(peer_id, Readiness::READABLE);
            engine.handle_events(id, Readiness::WRITABLE);
            peak = peak.max(engine.handler(id).unwrap().write_len());
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(engine.handler(peer_id).unwrap().interest(), Some(Interest::WRITABLE));

        engine.handle_events(peer_id, Readiness::READABLE);
        peak = peak.max(engine.handler(id).unwrap().write_len());
        assert!(peak <= RELAY_HIGH_WATER, "client queue reached {} bytes", peak);

        // Draining the client resumes the upstream side, in order.
        client.set_read_timeout(Some(Duration::from_millis(1))).unwrap();
        let mut received = 0usize;
        let mut buf = vec![0u8; 64 * 1024];
        let deadline = Instant::now() + Duration::from_secs(30);
        while received < TOTAL {
            assert!(Instant::now() < deadline, "received {} of {} bytes", received, TOTAL);
            if engine.is_alive(id) {
                engine.handle_events(id, Readiness::WRITABLE);
            }
            if engine.is_alive(peer_id) {
                engine.handle_events(peer_id, Readiness::READABLE);
            }
            if let Some(handler) = engine.handler(id) {
                peak = peak.max(handler.write_len());
            }
            match client.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    for (k, byte) in buf[..n].iter().enumerate() {
                        assert_eq!(*byte, ((received + k) % 251) as u8);
                    }
                    received += n;
                }
                Err(_) => {}
            }
        }

        writer.join().unwrap();
        assert_eq!(received, TOTAL);
        assert!(peak <= RELAY_HIGH_WATER, "client queue reached {} bytes", peak);
    }

    #[test]
    fn test_connect_failure_tears_down_pair() {
        // Grab a free port, then close it so nothing listens there.
        let port = StdListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();

        let mut engine = local_engine(direct_config());
        let (_client, id) = requested(&mut engine, port, b"abc");
        engine
            .resolver_mut()
            .answer(id, "127.0.0.1", Ok(IpAddr::V4(Ipv4Addr::LOCALHOST)));
        engine.process_resolutions();

        // Loopback refuses either at connect time or on the next writable event.
        if let Some(peer_id) = engine.handler(id).and_then(|h| h.paired()) {
            let deadline = Instant::now() + Duration::from_secs(2);
            while engine.is_alive(peer_id) {
                assert!(Instant::now() < deadline, "failed connect was not noticed");
                engine.handle_events(peer_id, Readiness::WRITABLE);
                std::thread::sleep(Duration::from_millis(1));
            }
        }

        assert!(!engine.is_alive(id));
        assert_eq!(engine.connection_count(), 0);
        assert_eq!(engine.stats().snapshot().active_connections, 0);
    }

    #[test]
    fn test_error_on_peer_tears_down_pair() {
        let mut engine = local_engine(direct_config());
        let (_client, id, peer_id, _upstream) = connected_pair(&mut engine);

        engine.handle_events(peer_id, Readiness::ERROR);

        assert!(!engine.is_alive(peer_id));
        assert!(!engine.is_alive(id));
        assert_eq!(engine.stats().snapshot().active_connections, 0);
    }

    #[test]
    fn test_socket_error_destroys_live_handler() {
        let mut engine = local_engine(direct_config());
        let (client, id) = accept_client(&mut engine);

        // Linger zero turns the close into a reset.
        socket2::SockRef::from(&client)
            .set_linger(Some(Duration::ZERO))
            .unwrap();
        drop(client);
        std::thread::sleep(Duration::from_millis(20));

        engine.handle_events(id, Readiness::ERROR);
        assert!(!engine.is_alive(id));
        assert_eq!(engine.stats().snapshot().active_connections, 0);
        assert!(engine.listener_id().is_some());
    }

    #[test]
    fn test_client_eof_before_pairing_destroys() {
        let mut engine = local_engine(direct_config());
        let (client, id) = requested(&mut engine, 9, b"");

        drop(client);
        drive(&mut engine, id, |e| !e.is_alive(id));
    }
}
