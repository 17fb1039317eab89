//! TCP roles: the remote (server) side of a node and the local SOCKS5 and
//! tunnel clients that feed it.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;

use chrono::Utc;
use socket2::SockRef;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::crypto::Cipher;
use crate::error::Result;
use crate::proxy::relay::relay;
use crate::proxy::socks5::{self, Address};
use crate::server::metrics::{ConnectionRecord, Recorder};

/// Everything a remote relay task needs about the node serving it.
#[derive(Clone)]
pub struct RemoteContext {
    pub listen_host: String,
    pub listen_port: u16,
    pub cipher: Cipher,
    pub recorder: Recorder,
}

pub(crate) fn set_keepalive(stream: &TcpStream) {
    if let Err(e) = SockRef::from(stream).set_keepalive(true) {
        debug!("set keepalive failed: {}", e);
    }
}

/// Serve one inbound connection on a node.
///
/// Decrypts the stream, reads the destination, dials it and relays until
/// either side closes. A [`ConnectionRecord`] is queued whenever a relay ran,
/// including forced teardown.
pub async fn serve_remote(conn: TcpStream, peer: SocketAddr, ctx: &RemoteContext) -> Result<()> {
    set_keepalive(&conn);
    let mut conn = ctx.cipher.wrap_stream(conn);

    let target = Address::read_from(&mut conn).await?;
    let remote = TcpStream::connect(target.to_string()).await?;
    set_keepalive(&remote);

    debug!(client = %peer, target = %target, port = ctx.listen_port, "proxy");

    let outcome = relay(conn, remote).await;
    if let Some(e) = outcome.failure() {
        warn!(client = %peer, target = %target, "relay error: {}", e);
    }

    ctx.recorder
        .record(ConnectionRecord {
            listen_host: ctx.listen_host.clone(),
            listen_port: ctx.listen_port,
            client_addr: peer.to_string(),
            target_addr: target.to_string(),
            bytes_client_to_target: outcome.left_to_right,
            bytes_target_to_client: outcome.right_to_left,
            timestamp: Utc::now(),
        })
        .await;

    Ok(())
}

/// Where a local connection should be forwarded.
#[derive(Debug, Clone)]
pub enum TargetSource {
    /// Ask the client with a SOCKS5 handshake. UDP ASSOCIATE is answered
    /// with `udp_bind` when set.
    Socks { udp_bind: Option<SocketAddr> },
    /// Always forward to this address.
    Fixed(Address),
}

/// Serve one local client connection.
pub async fn serve_local(
    mut conn: TcpStream,
    server: &str,
    cipher: &Cipher,
    source: &TargetSource,
) -> Result<()> {
    set_keepalive(&conn);

    let target = match source {
        TargetSource::Fixed(target) => target.clone(),
        TargetSource::Socks { udp_bind } => match socks5::handshake(&mut conn, *udp_bind).await {
            Ok(target) => target,
            Err(e) if e.is_udp_associate() => {
                hold_association(&mut conn).await;
                return Ok(());
            }
            Err(e) => return Err(e),
        },
    };

    let remote = TcpStream::connect(server).await?;
    set_keepalive(&remote);
    let mut remote = cipher.wrap_stream(remote);
    remote.write_all(&target.to_bytes()?).await?;
    remote.flush().await?;

    debug!(server = %server, target = %target, "proxy");

    let outcome = relay(conn, remote).await;
    if let Some(e) = outcome.failure() {
        warn!(target = %target, "relay error: {}", e);
    }
    Ok(())
}

/// Keep a UDP ASSOCIATE control connection open until the client hangs up.
async fn hold_association(conn: &mut TcpStream) {
    let mut buf = [0u8; 1];
    loop {
        match conn.read(&mut buf).await {
            Ok(0) => break,
            Ok(_) => continue,
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => continue,
            Err(_) => break,
        }
    }
    debug!("UDP associate end");
}

/// Accept local clients forever and forward each through `server`.
pub async fn run_local(
    listener: TcpListener,
    server: String,
    cipher: Cipher,
    source: TargetSource,
) {
    let shared = Arc::new((server, cipher, source));
    if let Ok(addr) = listener.local_addr() {
        info!("local TCP listening on {}", addr);
    }

    loop {
        let (conn, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("accept failed: {}", e);
                continue;
            }
        };

        let shared = shared.clone();
        tokio::spawn(async move {
            let (server, cipher, source) = &*shared;
            if let Err(e) = serve_local(conn, server, cipher, source).await {
                warn!(client = %peer, "local connection failed: {}", e);
            }
        });
    }
}

/// Bind `listen` and serve SOCKS5 clients.
pub async fn socks_local(
    listen: &str,
    server: String,
    cipher: Cipher,
    udp_bind: Option<SocketAddr>,
) -> Result<()> {
    let listener = TcpListener::bind(listen).await?;
    run_local(listener, server, cipher, TargetSource::Socks { udp_bind }).await;
    Ok(())
}

/// Bind `listen` and forward every connection to `target`.
pub async fn tcp_tun(listen: &str, server: String, target: Address, cipher: Cipher) -> Result<()> {
    let listener = TcpListener::bind(listen).await?;
    run_local(listener, server, cipher, TargetSource::Fixed(target)).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::pick_cipher;
    use crate::server::influx::{FieldValue, MemoryWriter};
    use crate::server::metrics::PipelineSettings;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut conn, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut rd, mut wr) = conn.split();
                    let _ = tokio::io::copy(&mut rd, &mut wr).await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_serve_remote_records_traffic() {
        let echo = echo_server().await;
        let cipher = pick_cipher("AEAD_AES_256_GCM", "secret").unwrap();
        let writer = Arc::new(MemoryWriter::new());
        let settings = PipelineSettings {
            capacity: 2,
            flush_interval: None,
        };
        let ctx = RemoteContext {
            listen_host: "127.0.0.1".into(),
            listen_port: 18388,
            cipher: cipher.clone(),
            recorder: Recorder::start(writer.clone(), settings).await,
        };

        let node = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let node_addr = node.local_addr().unwrap();
        tokio::spawn(async move {
            let (conn, peer) = node.accept().await.unwrap();
            serve_remote(conn, peer, &ctx).await.unwrap();
        });

        let mut client = cipher.wrap_stream(TcpStream::connect(node_addr).await.unwrap());
        client.write_all(&Address::from(echo).to_bytes().unwrap()).await.unwrap();
        client.write_all(b"hello").await.unwrap();
        client.flush().await.unwrap();

        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        drop(client);

        timeout(Duration::from_secs(5), async {
            while writer.point_count() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let point = &writer.batches()[0][0];
        assert_eq!(point.get_tag("port"), Some("18388"));
        assert_eq!(point.get_field("saddr"), Some(&FieldValue::Str(echo.to_string())));
        assert_eq!(point.get_field("rlen"), Some(&FieldValue::Int(5)));
        assert_eq!(point.get_field("wlen"), Some(&FieldValue::Int(5)));
    }

    #[tokio::test]
    async fn test_tunnel_through_remote() {
        let echo = echo_server().await;
        let cipher = pick_cipher("chacha20-ietf-poly1305", "tunnel").unwrap();

        let node = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let node_addr = node.local_addr().unwrap();
        let ctx = RemoteContext {
            listen_host: "127.0.0.1".into(),
            listen_port: node_addr.port(),
            cipher: cipher.clone(),
            recorder: Recorder::disabled(),
        };
        tokio::spawn(async move {
            while let Ok((conn, peer)) = node.accept().await {
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    let _ = serve_remote(conn, peer, &ctx).await;
                });
            }
        });

        let local = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local_addr = local.local_addr().unwrap();
        tokio::spawn(run_local(
            local,
            node_addr.to_string(),
            cipher,
            TargetSource::Fixed(Address::from(echo)),
        ));

        let mut client = TcpStream::connect(local_addr).await.unwrap();
        client.write_all(b"through the tunnel").await.unwrap();
        let mut buf = [0u8; 18];
        timeout(Duration::from_secs(5), client.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"through the tunnel");
    }

    #[tokio::test]
    async fn test_udp_associate_holds_until_close() {
        let local = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local_addr = local.local_addr().unwrap();
        let cipher = pick_cipher("dummy", "").unwrap();

        let handle = tokio::spawn(async move {
            let (conn, _) = local.accept().await.unwrap();
            let source = TargetSource::Socks {
                udp_bind: Some(local_addr),
            };
            // The server address is never dialed on this path.
            serve_local(conn, "127.0.0.1:1", &cipher, &source).await
        });

        let mut client = TcpStream::connect(local_addr).await.unwrap();
        client.write_all(&[5, 1, 0]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        client
            .write_all(&[5, 3, 0, 1, 0, 0, 0, 0, 0, 0])
            .await
            .unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], 0);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());

        drop(client);
        let result = timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert!(result.is_ok());
    }
}
