//! Role contract shared by the local and remote endpoints.
//!
//! The engine owns sockets, pairing and teardown; a [`Role`] only decides
//! what the handshake bytes mean. Any error a role returns tears the
//! handler down.

use crate::crypto::Direction;
use crate::engine::dns::Resolver;
use crate::engine::handler::{Handler, Status, Tag};
use crate::error::Result;

/// Engine facilities a role may use while handling a handshake step.
pub struct RoleContext<'a> {
    /// Asynchronous resolver; answers come back through the engine
    pub resolver: &'a mut dyn Resolver,
}

/// Endpoint behaviour plugged into the engine.
pub trait Role {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Status of a freshly accepted handler.
    fn initial_status(&self) -> Status;

    /// How a handler with `tag` transforms what it reads, if at all.
    fn codec_direction(&self, tag: Tag) -> Option<Direction>;

    /// Whether `host` must go through the tunnel.
    fn is_host_excluded(&self, host: &str) -> bool;

    /// Readable event in [`Status::Init`].
    fn on_receive_negotiation(&self, handler: &mut Handler, ctx: &mut RoleContext<'_>) -> Result<()>;

    /// Readable event in [`Status::Negotiated`].
    fn on_receive_syn(&self, handler: &mut Handler, ctx: &mut RoleContext<'_>) -> Result<()>;
}
