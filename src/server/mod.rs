//! Relay daemon.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          Server                               │
//! │                                                               │
//! │  ┌──────────────┐  ┌──────────────┐        ┌──────────────┐  │
//! │  │ NodeListener │  │ NodeListener │  ...   │ local roles  │  │
//! │  │  TCP + UDP   │  │  TCP + UDP   │        │ SOCKS / tun  │  │
//! │  └──────┬───────┘  └──────┬───────┘        └──────────────┘  │
//! │         │ one task per    │                                   │
//! │         ▼ connection      ▼                                   │
//! │  ┌──────────────────────────────────┐                        │
//! │  │ relay → ConnectionRecord          │                        │
//! │  └──────────────┬───────────────────┘                        │
//! │                 ▼                                             │
//! │  ┌──────────────────────────────────┐    ┌───────────────┐   │
//! │  │ Recorder (bounded queue)          │───▶│ flush task    │──▶ InfluxDB
//! │  └──────────────────────────────────┘    └───────────────┘   │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod influx;
pub mod metrics;

pub use config::{Config, InfluxConfig, LocalConfig, NodeConfig, TunnelConfig};
pub use influx::{InfluxClient, MemoryWriter, Point, PointWriter};
pub use metrics::{ConnectionRecord, PipelineSettings, Recorder, RecorderSlot};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::crypto::{pick_cipher, Cipher};
use crate::error::{Error, Result};
use crate::proxy::socks5::Address;
use crate::proxy::tcp::{self, RemoteContext, TargetSource};
use crate::proxy::udp;

static RECORDER: RecorderSlot = RecorderSlot::new();

/// The process-wide recorder slot.
pub fn recorder_slot() -> &'static RecorderSlot {
    &RECORDER
}

/// One node: a TCP listener and a UDP socket on the same port.
pub struct NodeListener {
    tcp: TcpListener,
    udp: UdpSocket,
    ctx: RemoteContext,
    udp_timeout: Duration,
    limit: Option<Arc<Semaphore>>,
}

impl NodeListener {
    /// Bind TCP and UDP for `node` on `host`.
    ///
    /// With port 0 the UDP socket takes whatever port TCP was given.
    pub async fn bind(
        host: &str,
        node: &NodeConfig,
        cipher: Cipher,
        recorder: Recorder,
        udp_timeout: Duration,
    ) -> Result<Self> {
        let tcp = TcpListener::bind((host, node.port)).await?;
        let port = tcp.local_addr()?.port();
        let udp = UdpSocket::bind((host, port)).await?;

        Ok(Self {
            tcp,
            udp,
            ctx: RemoteContext {
                listen_host: host.to_string(),
                listen_port: port,
                cipher,
                recorder,
            },
            udp_timeout,
            limit: node.max_connections.map(|n| Arc::new(Semaphore::new(n))),
        })
    }

    /// Address the TCP side is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.tcp.local_addr()?)
    }

    /// Serve both sockets forever.
    pub async fn run(self) {
        let Self {
            tcp,
            udp,
            ctx,
            udp_timeout,
            limit,
        } = self;

        info!(
            port = ctx.listen_port,
            cipher = ctx.cipher.name(),
            "listening on TCP and UDP {}:{}",
            ctx.listen_host,
            ctx.listen_port
        );

        let _udp_task = AbortOnDrop(tokio::spawn(udp::udp_remote(
            udp,
            ctx.cipher.clone(),
            udp_timeout,
        )));
        let ctx = Arc::new(ctx);

        loop {
            let permit = match &limit {
                Some(sem) => match sem.clone().acquire_owned().await {
                    Ok(permit) => Some(permit),
                    Err(_) => break,
                },
                None => None,
            };

            let (conn, peer) = match tcp.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(port = ctx.listen_port, "accept failed: {}", e);
                    continue;
                }
            };

            let ctx = ctx.clone();
            tokio::spawn(async move {
                match tcp::serve_remote(conn, peer, &ctx).await {
                    Ok(()) => {}
                    Err(e) if e.is_timeout() => {
                        debug!(client = %peer, port = ctx.listen_port, "connection ended: {}", e);
                    }
                    Err(e) => {
                        warn!(client = %peer, port = ctx.listen_port, "connection failed: {}", e);
                    }
                }
                drop(permit);
            });
        }
    }
}

/// Aborts the task when dropped, so the UDP side of a node goes away with
/// its accept loop.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Tasks started by [`Server::start`]. Dropping the handle stops them and
/// releases every listening socket.
pub struct ServerHandle {
    nodes: Vec<SocketAddr>,
    tasks: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    /// Bound TCP address of every node that started, in config order.
    pub fn node_addrs(&self) -> &[SocketAddr] {
        &self.nodes
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Orchestrator: validated config with every cipher resolved.
pub struct Server {
    config: Config,
    nodes: Vec<(NodeConfig, Cipher)>,
    local: Option<Cipher>,
}

impl Server {
    /// Validate `config` and resolve every cipher.
    ///
    /// # Errors
    ///
    /// Fails on invalid configuration or an unknown cipher, before anything
    /// is bound.
    pub fn new(config: Config) -> Result<Self> {
        config.validate().map_err(Error::config)?;

        let mut nodes = Vec::with_capacity(config.nodes.len());
        for node in &config.nodes {
            let cipher = pick_cipher(&node.cipher, &node.password)?;
            nodes.push((node.clone(), cipher));
        }

        let local = match &config.local {
            Some(local) => Some(pick_cipher(&local.cipher, &local.password)?),
            None => None,
        };

        Ok(Self {
            config,
            nodes,
            local,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Start the process-wide recorder, then every node and local role.
    pub async fn start(&self) -> Result<ServerHandle> {
        let recorder = recorder_slot()
            .get_or_start(self.config.influxdb.as_ref())
            .await?;
        Ok(self.start_with(recorder).await)
    }

    /// Start every node and local role feeding `recorder`.
    ///
    /// A node that fails to bind is logged and skipped.
    pub async fn start_with(&self, recorder: Recorder) -> ServerHandle {
        let mut handle = ServerHandle {
            nodes: Vec::new(),
            tasks: Vec::new(),
        };

        for (node, cipher) in &self.nodes {
            match NodeListener::bind(
                &self.config.server,
                node,
                cipher.clone(),
                recorder.clone(),
                self.config.udp_timeout(),
            )
            .await
            {
                Ok(listener) => {
                    if let Ok(addr) = listener.local_addr() {
                        handle.nodes.push(addr);
                    }
                    handle.tasks.push(tokio::spawn(listener.run()));
                }
                Err(e) => error!(port = node.port, "bind failed: {}", e),
            }
        }

        if let (Some(local), Some(cipher)) = (&self.config.local, &self.local) {
            self.start_local(local, cipher, &mut handle).await;
        }

        handle
    }

    async fn start_local(&self, local: &LocalConfig, cipher: &Cipher, handle: &mut ServerHandle) {
        if let Some(listen) = &local.socks {
            match TcpListener::bind(listen.as_str()).await {
                Ok(listener) => {
                    let udp_bind = self.start_socks_udp(listen, local, cipher, handle).await;
                    handle.tasks.push(tokio::spawn(tcp::run_local(
                        listener,
                        local.server.clone(),
                        cipher.clone(),
                        TargetSource::Socks { udp_bind },
                    )));
                }
                Err(e) => error!("SOCKS bind on {} failed: {}", listen, e),
            }
        }

        for tunnel in &local.tunnels {
            let Some(target) = Address::parse(&tunnel.target) else {
                error!("invalid tunnel target {:?}", tunnel.target);
                continue;
            };
            match TcpListener::bind(tunnel.listen.as_str()).await {
                Ok(listener) => {
                    info!("tunnel {} -> {} via {}", tunnel.listen, target, local.server);
                    handle.tasks.push(tokio::spawn(tcp::run_local(
                        listener,
                        local.server.clone(),
                        cipher.clone(),
                        TargetSource::Fixed(target),
                    )));
                }
                Err(e) => error!("tunnel bind on {} failed: {}", tunnel.listen, e),
            }
        }
    }

    /// Start the SOCKS UDP relay next to the SOCKS listener. Returns the
    /// address advertised to UDP ASSOCIATE requests.
    async fn start_socks_udp(
        &self,
        listen: &str,
        local: &LocalConfig,
        cipher: &Cipher,
        handle: &mut ServerHandle,
    ) -> Option<SocketAddr> {
        let server = match Address::parse(&local.server) {
            Some(addr) => match udp::resolve(&addr).await {
                Ok(resolved) => resolved,
                Err(e) => {
                    warn!("SOCKS UDP disabled: {}", e);
                    return None;
                }
            },
            None => {
                warn!("SOCKS UDP disabled: invalid server address {:?}", local.server);
                return None;
            }
        };

        match UdpSocket::bind(listen).await {
            Ok(socket) => {
                let bind = socket.local_addr().ok();
                handle.tasks.push(tokio::spawn(udp::udp_socks_local(
                    socket,
                    server,
                    cipher.clone(),
                    self.config.udp_timeout(),
                )));
                bind
            }
            Err(e) => {
                warn!("SOCKS UDP bind on {} failed: {}", listen, e);
                None
            }
        }
    }

    /// Start everything and block until SIGINT or SIGTERM.
    pub async fn run(&self) -> Result<()> {
        let handle = self.start().await?;
        shutdown_signal().await;
        info!("shutting down");
        drop(handle);
        Ok(())
    }
}

/// Resolve when the process receives SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!("cannot install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(json: &str) -> Config {
        Config::from_json(json).unwrap()
    }

    #[test]
    fn test_unknown_cipher_rejected_up_front() {
        let cfg = config(
            r#"{"nodes": [
                {"port": 1, "cipher": "dummy", "password": ""},
                {"port": 2, "cipher": "rc4-md5", "password": "x"}
            ]}"#,
        );
        assert!(matches!(Server::new(cfg), Err(Error::UnsupportedCipher(_))));
    }

    #[test]
    fn test_local_cipher_checked() {
        let cfg = config(
            r#"{"local": {"server": "127.0.0.1:1", "cipher": "nope", "password": "",
                          "socks": "127.0.0.1:0"}}"#,
        );
        assert!(Server::new(cfg).is_err());
    }

    #[tokio::test]
    async fn test_bind_failure_skips_node() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let cfg = config(&format!(
            r#"{{"server": "127.0.0.1", "nodes": [
                {{"port": {}, "cipher": "dummy", "password": ""}},
                {{"port": 0, "cipher": "dummy", "password": ""}}
            ]}}"#,
            port
        ));
        let server = Server::new(cfg).unwrap();
        let handle = server.start_with(Recorder::disabled()).await;

        assert_eq!(handle.node_addrs().len(), 1);
        assert_ne!(handle.node_addrs()[0].port(), port);
    }

    #[tokio::test]
    async fn test_node_limit_admits_up_to_max() {
        let node = NodeConfig {
            port: 0,
            cipher: "dummy".into(),
            password: String::new(),
            max_connections: Some(1),
        };
        let listener = NodeListener::bind(
            "127.0.0.1",
            &node,
            pick_cipher("dummy", "").unwrap(),
            Recorder::disabled(),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert_eq!(listener.limit.as_ref().map(|s| s.available_permits()), Some(1));
        assert_eq!(listener.ctx.listen_port, listener.local_addr().unwrap().port());
    }

    #[tokio::test]
    async fn test_dropping_handle_releases_ports() {
        let cfg = config(
            r#"{"server": "127.0.0.1", "nodes": [
                {"port": 0, "cipher": "dummy", "password": ""}
            ]}"#,
        );
        let server = Server::new(cfg).unwrap();
        let handle = server.start_with(Recorder::disabled()).await;
        let port = handle.node_addrs()[0].port();

        // Let the node reach its accept loop.
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(handle);
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(TcpListener::bind(("127.0.0.1", port)).await.is_ok());
        assert!(UdpSocket::bind(("127.0.0.1", port)).await.is_ok());
    }

    #[derive(Clone, Default)]
    struct LogCapture(Arc<parking_lot::Mutex<Vec<u8>>>);

    impl std::io::Write for LogCapture {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_dial_failure_logged_as_warning() {
        use tokio::io::AsyncWriteExt;

        let logs = LogCapture::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::WARN)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let closed_addr = closed.local_addr().unwrap();
        drop(closed);

        let node = NodeConfig {
            port: 0,
            cipher: "dummy".into(),
            password: String::new(),
            max_connections: None,
        };
        let listener = NodeListener::bind(
            "127.0.0.1",
            &node,
            pick_cipher("dummy", "").unwrap(),
            Recorder::disabled(),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        let node_addr = listener.local_addr().unwrap();
        let task = AbortOnDrop(tokio::spawn(listener.run()));

        let mut client = tokio::net::TcpStream::connect(node_addr).await.unwrap();
        client
            .write_all(&Address::from(closed_addr).to_bytes().unwrap())
            .await
            .unwrap();

        let seen = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let text = String::from_utf8_lossy(&logs.0.lock()).into_owned();
                if text.contains("connection failed") {
                    return text;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("dial failure reaches the warn log");
        assert!(seen.contains("WARN"));

        drop(task);
    }
}
