//! Remote endpoint: tunnel exit.
//!
//! Accepted connections carry no SOCKS5 greeting. The first decoded bytes are
//! a destination header; anything behind it is payload for the destination.

use crate::crypto::Direction;
use crate::engine::handler::{Handler, Status, Tag};
use crate::error::{Error, Result};
use crate::proxy::role::{Role, RoleContext};
use crate::proxy::socks5::parse_header;

/// Tunnel-facing role.
#[derive(Debug, Clone, Copy, Default)]
pub struct RemoteRole;

impl RemoteRole {
    pub fn new() -> Self {
        Self
    }
}

impl Role for RemoteRole {
    fn name(&self) -> &'static str {
        "remote"
    }

    fn initial_status(&self) -> Status {
        Status::Negotiated
    }

    fn codec_direction(&self, tag: Tag) -> Option<Direction> {
        match tag {
            Tag::Negative => Some(Direction::Decode),
            Tag::Positive => Some(Direction::Encode),
            Tag::Listen => None,
        }
    }

    fn is_host_excluded(&self, _host: &str) -> bool {
        false
    }

    fn on_receive_negotiation(&self, handler: &mut Handler, ctx: &mut RoleContext<'_>) -> Result<()> {
        self.on_receive_syn(handler, ctx)
    }

    fn on_receive_syn(&self, handler: &mut Handler, ctx: &mut RoleContext<'_>) -> Result<()> {
        let (_, eof) = handler.read_available(true)?;
        if eof {
            return Err(Error::PeerClosed);
        }

        let available = handler.read_len();
        let header = match parse_header(handler.peek_read_buffer(available))? {
            Some(header) => header,
            None => return Ok(()),
        };
        handler.consume_from_read_buffer(header.len);

        let host = header.addr.host();
        handler.set_peer_target(host.as_str(), header.port);
        handler.set_status(Status::Requested);
        tracing::debug!("{} tunnel request for {}", handler.id(), header);
        ctx.resolver.resolve(&host, handler.id())
    }
}
