//! Endpoint roles.
//!
//! The local endpoint speaks SOCKS5 to applications and tunnels to the remote
//! endpoint, which connects to destinations on their behalf. Both share the
//! SOCKS5 address header codec in [`socks5`].

pub mod local;
pub mod remote;
pub mod role;
pub mod socks5;

pub use local::{HostPolicy, LocalRole};
pub use remote::RemoteRole;
pub use role::{Role, RoleContext};
