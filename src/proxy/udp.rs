//! UDP relay.
//!
//! The remote side decrypts `[address][payload]` datagrams and forwards the
//! payload from a per-client NAT socket; replies travel back prefixed with
//! their source address. The local side is a SOCKS5 UDP relay that strips
//! the SOCKS header and tunnels datagrams through a remote node.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::crypto::Cipher;
use crate::error::{Error, Result};
use crate::proxy::socks5::Address;

/// Maximum datagram size handled.
pub const MAX_PACKET_SIZE: usize = 64 * 1024;

/// SOCKS5 UDP request header: RSV(2) + FRAG(1).
const SOCKS_UDP_HEADER: [u8; 3] = [0, 0, 0];

/// Which way replies are transformed on their way back to the client.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Role {
    /// Encrypt `[source][payload]` for a remote client.
    Remote,
    /// Decrypt a server reply and prepend the SOCKS UDP header.
    SocksLocal,
}

/// Per-client NAT table.
#[derive(Clone, Default)]
struct NatMap {
    entries: Arc<Mutex<HashMap<SocketAddr, Arc<UdpSocket>>>>,
}

impl NatMap {
    fn get(&self, peer: &SocketAddr) -> Option<Arc<UdpSocket>> {
        self.entries.lock().get(peer).cloned()
    }

    fn insert(&self, peer: SocketAddr, socket: Arc<UdpSocket>) {
        self.entries.lock().insert(peer, socket);
    }

    fn remove(&self, peer: &SocketAddr) {
        self.entries.lock().remove(peer);
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

struct Relay {
    listener: Arc<UdpSocket>,
    cipher: Cipher,
    idle_timeout: Duration,
    role: Role,
    nat: NatMap,
}

impl Relay {
    /// Get or create the NAT socket for `peer`.
    async fn nat_socket(&self, peer: SocketAddr, dest: &SocketAddr) -> Result<Arc<UdpSocket>> {
        if let Some(socket) = self.nat.get(&peer) {
            return Ok(socket);
        }

        let bind: SocketAddr = if dest.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = Arc::new(UdpSocket::bind(bind).await?);
        self.nat.insert(peer, socket.clone());

        tokio::spawn(reply_loop(
            socket.clone(),
            self.listener.clone(),
            peer,
            self.cipher.clone(),
            self.role,
            self.idle_timeout,
            self.nat.clone(),
        ));
        Ok(socket)
    }
}

/// Copy replies from a NAT socket back to `peer` until idle.
async fn reply_loop(
    nat_socket: Arc<UdpSocket>,
    listener: Arc<UdpSocket>,
    peer: SocketAddr,
    cipher: Cipher,
    role: Role,
    idle_timeout: Duration,
    nat: NatMap,
) {
    let mut buf = vec![0u8; MAX_PACKET_SIZE];

    loop {
        let (n, src) = match tokio::time::timeout(idle_timeout, nat_socket.recv_from(&mut buf)).await {
            Ok(Ok(received)) => received,
            Ok(Err(e)) => {
                debug!(client = %peer, "UDP reply read failed: {}", e);
                break;
            }
            Err(_) => break,
        };

        let packet = match wrap_reply(&cipher, role, src, &buf[..n]) {
            Ok(packet) => packet,
            Err(e) => {
                debug!(client = %peer, "dropping UDP reply: {}", e);
                continue;
            }
        };

        if let Err(e) = listener.send_to(&packet, peer).await {
            debug!(client = %peer, "UDP reply write failed: {}", e);
            break;
        }
    }

    nat.remove(&peer);
    debug!(client = %peer, "UDP NAT entry expired");
}

fn wrap_reply(cipher: &Cipher, role: Role, src: SocketAddr, data: &[u8]) -> Result<Vec<u8>> {
    match role {
        Role::Remote => {
            let mut plain = Address::from(src).to_bytes()?;
            plain.extend_from_slice(data);
            cipher.seal_packet(&plain)
        }
        Role::SocksLocal => {
            let plain = cipher.open_packet(data)?;
            let mut packet = Vec::with_capacity(SOCKS_UDP_HEADER.len() + plain.len());
            packet.extend_from_slice(&SOCKS_UDP_HEADER);
            packet.extend_from_slice(&plain);
            Ok(packet)
        }
    }
}

/// Resolve an address to the first socket address it names.
pub async fn resolve(addr: &Address) -> Result<SocketAddr> {
    match addr {
        Address::Socket(sa) => Ok(*sa),
        Address::Domain(host, port) => tokio::net::lookup_host((host.as_str(), *port))
            .await?
            .next()
            .ok_or_else(|| Error::address(format!("cannot resolve {}", addr))),
    }
}

/// Serve the UDP side of a node on `socket` forever.
pub async fn udp_remote(socket: UdpSocket, cipher: Cipher, idle_timeout: Duration) {
    let relay = Relay {
        listener: Arc::new(socket),
        cipher,
        idle_timeout,
        role: Role::Remote,
        nat: NatMap::default(),
    };
    if let Ok(addr) = relay.listener.local_addr() {
        info!("UDP listening on {}", addr);
    }

    let mut buf = vec![0u8; MAX_PACKET_SIZE];
    loop {
        let (n, peer) = match relay.listener.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                warn!("UDP remote read error: {}", e);
                continue;
            }
        };

        if let Err(e) = forward_remote(&relay, peer, &buf[..n]).await {
            debug!(client = %peer, "UDP remote: {}", e);
        }
    }
}

async fn forward_remote(relay: &Relay, peer: SocketAddr, packet: &[u8]) -> Result<()> {
    let plain = relay.cipher.open_packet(packet)?;
    let (target, used) = Address::decode(&plain)?;
    let dest = resolve(&target).await?;

    let socket = relay.nat_socket(peer, &dest).await?;
    socket.send_to(&plain[used..], dest).await?;
    Ok(())
}

/// Serve a SOCKS5 UDP relay on `socket`, tunnelling through `server`.
pub async fn udp_socks_local(
    socket: UdpSocket,
    server: SocketAddr,
    cipher: Cipher,
    idle_timeout: Duration,
) {
    let relay = Relay {
        listener: Arc::new(socket),
        cipher,
        idle_timeout,
        role: Role::SocksLocal,
        nat: NatMap::default(),
    };
    if let Ok(addr) = relay.listener.local_addr() {
        info!("SOCKS UDP relay listening on {}", addr);
    }

    let mut buf = vec![0u8; MAX_PACKET_SIZE];
    loop {
        let (n, peer) = match relay.listener.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                warn!("UDP local read error: {}", e);
                continue;
            }
        };

        if let Err(e) = forward_local(&relay, peer, server, &buf[..n]).await {
            debug!(client = %peer, "UDP local: {}", e);
        }
    }
}

async fn forward_local(
    relay: &Relay,
    peer: SocketAddr,
    server: SocketAddr,
    packet: &[u8],
) -> Result<()> {
    if packet.len() < SOCKS_UDP_HEADER.len() {
        return Err(Error::Buffer {
            expected: SOCKS_UDP_HEADER.len(),
            actual: packet.len(),
        });
    }
    if packet[2] != 0 {
        return Err(Error::address("fragmented SOCKS UDP datagrams are not supported"));
    }

    let body = &packet[SOCKS_UDP_HEADER.len()..];
    // Validate the address before spending a NAT entry on it.
    Address::decode(body)?;
    let sealed = relay.cipher.seal_packet(body)?;

    let socket = relay.nat_socket(peer, &server).await?;
    socket.send_to(&sealed, server).await?;
    Ok(())
}
