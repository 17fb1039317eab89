//! Relay engine and the SOCKS5 plumbing around it.
//!
//! Remote side: decrypt, read the destination address, dial, relay.
//! Local side: take the destination from a SOCKS5 handshake or a fixed
//! tunnel target, dial a remote node, send the address, relay.

pub mod relay;
pub mod socks5;
pub mod tcp;
pub mod udp;

pub use relay::{relay, RelayOutcome};
pub use socks5::{handshake, Address};
pub use tcp::{serve_local, serve_remote, socks_local, tcp_tun, RemoteContext, TargetSource};
