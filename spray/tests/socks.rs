//! End-to-end SOCKS5 tests over loopback. The egress pool is 127.0.0.0/8,
//! which every Linux host already routes locally, so sprayed source binds
//! work without any route setup.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use egress::cyclic::AddressPool;
use egress::subnet::SubnetEgress;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

use spray::server::SocksServer;
use spray::socks::Credentials;

struct TestProxy {
    addr: SocketAddr,
    _shutdown: watch::Sender<bool>,
}

async fn spawn_proxy(credentials: Option<Credentials>) -> TestProxy {
    let pool = AddressPool::parse("127.0.0.0/8").unwrap();
    let egress = Arc::new(SubnetEgress::new(pool, "lo", HashSet::new()));
    let server = SocksServer::bind("127.0.0.1:0".parse().unwrap(), egress, credentials)
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(server.serve(shutdown_rx));
    TestProxy {
        addr,
        _shutdown: shutdown_tx,
    }
}

/// Echo server that reports each accepted peer address.
async fn spawn_echo() -> (SocketAddr, mpsc::Receiver<SocketAddr>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (peer_tx, peer_rx) = mpsc::channel(4);
    tokio::spawn(async move {
        while let Ok((mut stream, peer)) = listener.accept().await {
            let _ = peer_tx.send(peer).await;
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    (addr, peer_rx)
}

async fn greet_no_auth(stream: &mut TcpStream) {
    stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x05, 0x00]);
}

async fn connect_ipv4(stream: &mut TcpStream, target: SocketAddr) -> [u8; 10] {
    let SocketAddr::V4(v4) = target else {
        panic!("expected a v4 target");
    };
    let mut request = vec![0x05, 0x01, 0x00, 0x01];
    request.extend_from_slice(&v4.ip().octets());
    request.extend_from_slice(&v4.port().to_be_bytes());
    stream.write_all(&request).await.unwrap();
    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).await.unwrap();
    reply
}

#[tokio::test]
async fn echo_round_trip_with_sprayed_source() {
    let (echo_addr, mut peers) = spawn_echo().await;
    let proxy = spawn_proxy(None).await;

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    greet_no_auth(&mut client).await;
    let reply = connect_ipv4(&mut client, echo_addr).await;
    assert_eq!(&reply[..4], &[0x05, 0x00, 0x00, 0x01]);
    // Address field wire-carries the client ATYP code.
    assert_eq!(&reply[4..8], &[0, 0, 0, 0x01]);

    client.write_all(b"ping").await.unwrap();
    let mut echoed = [0u8; 4];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"ping");

    let peer = peers.recv().await.unwrap();
    match peer.ip() {
        std::net::IpAddr::V4(ip) => {
            assert_eq!(ip.octets()[0], 127, "source {ip} not sprayed from 127.0.0.0/8");
        }
        other => panic!("unexpected source family: {other}"),
    }
}

#[tokio::test]
async fn sources_vary_across_sessions() {
    let (echo_addr, mut peers) = spawn_echo().await;
    let proxy = spawn_proxy(None).await;

    let mut seen = HashSet::new();
    for _ in 0..5 {
        let mut client = TcpStream::connect(proxy.addr).await.unwrap();
        greet_no_auth(&mut client).await;
        let reply = connect_ipv4(&mut client, echo_addr).await;
        assert_eq!(reply[1], 0x00);
        seen.insert(peers.recv().await.unwrap().ip());
    }
    assert!(
        seen.len() > 1,
        "five sessions reused a single source address: {seen:?}"
    );
}

#[tokio::test]
async fn wrong_version_greeting_closes_without_reply() {
    let proxy = spawn_proxy(None).await;
    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    client.write_all(&[0x04, 0x01]).await.unwrap();
    let mut leftover = Vec::new();
    client.read_to_end(&mut leftover).await.unwrap();
    assert!(leftover.is_empty(), "server replied: {leftover:?}");
}

#[tokio::test]
async fn unknown_hostname_gets_refused_reply() {
    let proxy = spawn_proxy(None).await;
    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    greet_no_auth(&mut client).await;

    let host = b"no.such.host.invalid";
    let mut request = vec![0x05, 0x01, 0x00, 0x03, host.len() as u8];
    request.extend_from_slice(host);
    request.extend_from_slice(&80u16.to_be_bytes());
    client.write_all(&request).await.unwrap();

    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x05, 0x05, 0x00, 0x03, 0, 0, 0, 0, 0, 0]);

    let mut leftover = Vec::new();
    client.read_to_end(&mut leftover).await.unwrap();
    assert!(leftover.is_empty());
}

#[tokio::test]
async fn refused_upstream_gets_failure_reply() {
    let proxy = spawn_proxy(None).await;

    // Grab a port that nothing listens on.
    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let closed_addr = closed.local_addr().unwrap();
    drop(closed);

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    greet_no_auth(&mut client).await;
    let reply = connect_ipv4(&mut client, closed_addr).await;
    assert_eq!(reply[0], 0x05);
    assert_eq!(reply[1], 0x05);
    assert_eq!(reply[3], 0x01);
}

#[tokio::test]
async fn auth_required_accepts_valid_credentials() {
    let (echo_addr, _peers) = spawn_echo().await;
    let proxy = spawn_proxy(Some(Credentials {
        username: "scanner".to_string(),
        password: "sekrit".to_string(),
    }))
    .await;

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    client.write_all(&[0x05, 0x02, 0x00, 0x02]).await.unwrap();
    let mut method = [0u8; 2];
    client.read_exact(&mut method).await.unwrap();
    assert_eq!(method, [0x05, 0x02]);

    client.write_all(&[0x01, 7]).await.unwrap();
    client.write_all(b"scanner").await.unwrap();
    client.write_all(&[6]).await.unwrap();
    client.write_all(b"sekrit").await.unwrap();
    let mut status = [0u8; 2];
    client.read_exact(&mut status).await.unwrap();
    assert_eq!(status, [0x01, 0x00]);

    let reply = connect_ipv4(&mut client, echo_addr).await;
    assert_eq!(reply[1], 0x00);

    client.write_all(b"auth").await.unwrap();
    let mut echoed = [0u8; 4];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"auth");
}

#[tokio::test]
async fn auth_required_rejects_bad_credentials() {
    let proxy = spawn_proxy(Some(Credentials {
        username: "scanner".to_string(),
        password: "sekrit".to_string(),
    }))
    .await;

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
    let mut method = [0u8; 2];
    client.read_exact(&mut method).await.unwrap();
    assert_eq!(method, [0x05, 0x02]);

    client.write_all(&[0x01, 7]).await.unwrap();
    client.write_all(b"scanner").await.unwrap();
    client.write_all(&[5]).await.unwrap();
    client.write_all(b"wrong").await.unwrap();
    let mut status = [0u8; 2];
    client.read_exact(&mut status).await.unwrap();
    assert_eq!(status, [0x01, 0xFF]);

    let mut leftover = Vec::new();
    client.read_to_end(&mut leftover).await.unwrap();
    assert!(leftover.is_empty());
}

#[tokio::test]
async fn no_auth_honored_when_credentials_absent() {
    let (echo_addr, _peers) = spawn_echo().await;
    let proxy = spawn_proxy(None).await;

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    // Client offers both no-auth and user/pass; server picks no-auth.
    client.write_all(&[0x05, 0x02, 0x00, 0x02]).await.unwrap();
    let mut method = [0u8; 2];
    client.read_exact(&mut method).await.unwrap();
    assert_eq!(method, [0x05, 0x00]);

    let reply = connect_ipv4(&mut client, echo_addr).await;
    assert_eq!(reply[1], 0x00);
}
