//! Local endpoint: SOCKS5 front end.
//!
//! Accepts SOCKS5 clients, answers the greeting and the request, then either
//! tunnels the connection to the remote endpoint or connects directly when
//! the destination matches the configured `direct_hosts`.
//!
//! Negotiation is deliberately permissive: any greeting is answered with
//! "no authentication" without looking at the offered methods.

use std::collections::HashSet;
use std::net::IpAddr;

use crate::config::Config;
use crate::crypto::Direction;
use crate::engine::handler::{Handler, Status, Tag};
use crate::error::{Error, Result};
use crate::proxy::role::{Role, RoleContext};
use crate::proxy::socks5::{
    build_reply, greeting_len, parse_header, Command, NEGOTIATION_REPLY, REP_SUCCEEDED,
    REQUEST_PREFIX_LEN,
};

/// Destinations reached without the tunnel.
///
/// Entries are IP literals (exact match) or domain suffixes: `example.com`
/// matches `example.com` and `www.example.com` but not `badexample.com`.
#[derive(Debug, Clone, Default)]
pub struct HostPolicy {
    ips: HashSet<IpAddr>,
    suffixes: Vec<String>,
}

impl HostPolicy {
    /// Build a policy from configuration entries.
    pub fn new<S: AsRef<str>>(entries: &[S]) -> Self {
        let mut policy = Self::default();
        for entry in entries {
            let entry = entry.as_ref().trim();
            match entry.parse::<IpAddr>() {
                Ok(ip) => {
                    policy.ips.insert(ip);
                }
                Err(_) => {
                    let suffix = entry.trim_start_matches('.').to_ascii_lowercase();
                    if !suffix.is_empty() {
                        policy.suffixes.push(suffix);
                    }
                }
            }
        }
        policy
    }

    /// Whether `host` bypasses the tunnel.
    pub fn is_direct(&self, host: &str) -> bool {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return self.ips.contains(&ip);
        }

        let host = host.trim_end_matches('.').to_ascii_lowercase();
        self.suffixes.iter().any(|suffix| {
            host == *suffix
                || (host.ends_with(suffix.as_str())
                    && host.as_bytes()[host.len() - suffix.len() - 1] == b'.')
        })
    }

    pub fn is_empty(&self) -> bool {
        self.ips.is_empty() && self.suffixes.is_empty()
    }
}

/// SOCKS5-facing role.
#[derive(Debug, Clone)]
pub struct LocalRole {
    policy: HostPolicy,
}

impl LocalRole {
    pub fn new(config: &Config) -> Self {
        Self {
            policy: HostPolicy::new(&config.direct_hosts),
        }
    }

    /// Handle the request at the head of the read buffer, if complete.
    fn process_request(&self, handler: &mut Handler, ctx: &mut RoleContext<'_>) -> Result<()> {
        let available = handler.read_len();
        if available < REQUEST_PREFIX_LEN {
            return Ok(());
        }

        let command = Command::from_byte(handler.peek_read_buffer(REQUEST_PREFIX_LEN)[1])?;
        let header = match parse_header(&handler.peek_read_buffer(available)[REQUEST_PREFIX_LEN..])? {
            Some(header) => header,
            None => return Ok(()),
        };
        let bound = handler.local_addr()?;

        match command {
            Command::UdpAssociate => {
                handler.consume_from_read_buffer(REQUEST_PREFIX_LEN + header.len);
                handler.queue_write(build_reply(REP_SUCCEEDED, bound));
                tracing::debug!("{} UDP associate, replied with {}", handler.id(), bound);
                Ok(())
            }
            Command::Connect => {
                handler.queue_write(build_reply(REP_SUCCEEDED, bound));
                handler.set_status(Status::Requested);

                let host = header.addr.host();
                if self.is_host_excluded(&host) {
                    // The remote endpoint needs the address header, so it
                    // travels through the codec with the payload behind it.
                    handler.consume_from_read_buffer(REQUEST_PREFIX_LEN);
                    let rest = handler.take_read_buffer().take_all();
                    handler.append_to_read_buffer(&rest, true)?;

                    let config = std::sync::Arc::clone(handler.config());
                    handler.set_peer_target(config.server.as_str(), config.server_port);
                    tracing::debug!("{} tunneling to {}", handler.id(), header);
                    ctx.resolver.resolve(&config.server, handler.id())
                } else {
                    handler.consume_from_read_buffer(REQUEST_PREFIX_LEN + header.len);
                    handler.set_direct_connect(true);
                    handler.set_peer_target(host.as_str(), header.port);
                    tracing::debug!("{} connecting directly to {}", handler.id(), header);
                    ctx.resolver.resolve(&host, handler.id())
                }
            }
        }
    }
}

impl Role for LocalRole {
    fn name(&self) -> &'static str {
        "local"
    }

    fn initial_status(&self) -> Status {
        Status::Init
    }

    fn codec_direction(&self, tag: Tag) -> Option<Direction> {
        match tag {
            Tag::Negative => Some(Direction::Encode),
            Tag::Positive => Some(Direction::Decode),
            Tag::Listen => None,
        }
    }

    fn is_host_excluded(&self, host: &str) -> bool {
        !self.policy.is_direct(host)
    }

    fn on_receive_negotiation(&self, handler: &mut Handler, ctx: &mut RoleContext<'_>) -> Result<()> {
        let (_, eof) = handler.read_available(false)?;
        if eof {
            return Err(Error::PeerClosed);
        }
        let available = handler.read_len();
        if available == 0 {
            return Ok(());
        }

        let greeting = greeting_len(handler.peek_read_buffer(2)).unwrap_or(available);
        handler.consume_from_read_buffer(greeting.min(available));
        handler.queue_write(NEGOTIATION_REPLY.to_vec());
        handler.set_status(Status::Negotiated);

        // A request pipelined behind the greeting is already here.
        self.process_request(handler, ctx)
    }

    fn on_receive_syn(&self, handler: &mut Handler, ctx: &mut RoleContext<'_>) -> Result<()> {
        let (_, eof) = handler.read_available(false)?;
        if eof {
            return Err(Error::PeerClosed);
        }
        self.process_request(handler, ctx)
    }
}
