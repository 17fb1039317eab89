//! End-to-end scenarios over loopback sockets.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use sockstun::crypto::{pick_cipher, Cipher};
use sockstun::proxy::Address;
use sockstun::server::influx::FieldValue;
use sockstun::server::{Config, MemoryWriter, PipelineSettings, Recorder, Server};
use sockstun::Error;

/// Target that answers `PING` with `PONG`.
async fn pong_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut conn, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 4];
                if conn.read_exact(&mut buf).await.is_ok() && &buf == b"PING" {
                    let _ = conn.write_all(b"PONG").await;
                }
                // Hold the socket until the relay tears down.
                let _ = conn.read(&mut buf).await;
            });
        }
    });
    addr
}

async fn ping(node: SocketAddr, cipher: &Cipher, target: SocketAddr) -> [u8; 4] {
    let mut conn = cipher.wrap_stream(TcpStream::connect(node).await.unwrap());
    conn.write_all(&Address::from(target).to_bytes().unwrap()).await.unwrap();
    conn.write_all(b"PING").await.unwrap();
    conn.flush().await.unwrap();

    let mut reply = [0u8; 4];
    timeout(Duration::from_secs(5), conn.read_exact(&mut reply))
        .await
        .expect("reply in time")
        .unwrap();
    reply
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    timeout(Duration::from_secs(10), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached");
}

fn two_node_config() -> Config {
    Config::from_json(
        r#"{
            "server": "127.0.0.1",
            "nodes": [
                {"port": 0, "cipher": "AEAD_CHACHA20_POLY1305", "password": "node-a"},
                {"port": 0, "cipher": "AEAD_AES_128_GCM", "password": "node-b"}
            ]
        }"#,
    )
    .unwrap()
}

#[tokio::test]
async fn test_two_nodes_ping_pong_records_node_one() {
    let target = pong_server().await;
    let writer = Arc::new(MemoryWriter::new());
    let settings = PipelineSettings {
        capacity: 2,
        flush_interval: None,
    };
    let recorder = Recorder::start(writer.clone(), settings).await;

    let server = Server::new(two_node_config()).unwrap();
    let handle = server.start_with(recorder).await;
    assert_eq!(handle.node_addrs().len(), 2);
    let node_a = handle.node_addrs()[0];

    let cipher_a = pick_cipher("AEAD_CHACHA20_POLY1305", "node-a").unwrap();
    assert_eq!(&ping(node_a, &cipher_a, target).await, b"PONG");

    wait_until(|| writer.point_count() == 1).await;
    let point = &writer.batches()[0][0];
    assert_eq!(point.measurement, "flow");
    assert_eq!(point.get_tag("port"), Some(node_a.port().to_string().as_str()));
    assert_eq!(point.get_field("saddr"), Some(&FieldValue::Str(target.to_string())));
    assert_eq!(point.get_field("rlen"), Some(&FieldValue::Int(4)));
    assert_eq!(point.get_field("wlen"), Some(&FieldValue::Int(4)));
}

#[tokio::test]
async fn test_wrong_cipher_gets_nothing() {
    let target = pong_server().await;
    let server = Server::new(two_node_config()).unwrap();
    let handle = server.start_with(Recorder::disabled()).await;
    let node_b = handle.node_addrs()[1];

    // Node B speaks AES-128-GCM with a different password.
    let wrong = pick_cipher("AEAD_AES_128_GCM", "node-a").unwrap();
    let mut conn = wrong.wrap_stream(TcpStream::connect(node_b).await.unwrap());
    conn.write_all(&Address::from(target).to_bytes().unwrap()).await.unwrap();
    conn.write_all(b"PING").await.unwrap();
    conn.flush().await.unwrap();

    let mut reply = [0u8; 4];
    let result = timeout(Duration::from_secs(5), conn.read_exact(&mut reply))
        .await
        .expect("node closes the connection");
    assert!(result.is_err());
}

#[tokio::test]
async fn test_sixty_connections_one_batch() {
    let target = pong_server().await;
    let writer = Arc::new(MemoryWriter::new());
    let recorder = Recorder::start(writer.clone(), PipelineSettings::default()).await;

    let server = Server::new(two_node_config()).unwrap();
    let handle = server.start_with(recorder.clone()).await;
    let node_a = handle.node_addrs()[0];
    let cipher_a = pick_cipher("AEAD_CHACHA20_POLY1305", "node-a").unwrap();

    for _ in 0..60 {
        assert_eq!(&ping(node_a, &cipher_a, target).await, b"PONG");
    }

    wait_until(|| writer.point_count() == 50 && recorder.buffered() == 10).await;
    let batches = writer.batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].len(), 50);
}

#[tokio::test]
async fn test_unknown_cipher_fails_before_bind() {
    let reserved = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = reserved.local_addr().unwrap().port();
    drop(reserved);

    let config = Config::from_json(&format!(
        r#"{{
            "server": "127.0.0.1",
            "nodes": [
                {{"port": {}, "cipher": "AEAD_AES_256_GCM", "password": "ok"}},
                {{"port": 0, "cipher": "RC4-MD5", "password": "legacy"}}
            ]
        }}"#,
        port
    ))
    .unwrap();

    match Server::new(config) {
        Err(Error::UnsupportedCipher(name)) => assert_eq!(name, "RC4-MD5"),
        Err(other) => panic!("unexpected error: {}", other),
        Ok(_) => panic!("unknown cipher accepted"),
    }

    // Nothing was bound for the valid node either.
    assert!(TcpListener::bind(("127.0.0.1", port)).await.is_ok());
}
