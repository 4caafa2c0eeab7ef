//! Test utilities and mocks for Sockspool
//!
//! This module provides common test utilities used across integration tests.

use sockspool::connector::UpstreamConnector;
use sockspool::pool::{channel, ProxyPool};
use sockspool::server;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Spawn a mock SOCKS5 upstream proxy on an ephemeral port.
///
/// The mock accepts the no-auth method and then either grants the CONNECT
/// and echoes every byte back (standing in for proxy plus target at once),
/// or refuses it with "connection refused".
pub async fn spawn_socks5_proxy(grant: bool) -> SocketAddrV4 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = match listener.local_addr().unwrap() {
        SocketAddr::V4(v4) => v4,
        other => panic!("unexpected listener address {other}"),
    };

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut greeting = [0u8; 3];
                if stream.read_exact(&mut greeting).await.is_err() {
                    return;
                }
                if stream.write_all(&[0x05, 0x00]).await.is_err() {
                    return;
                }

                let mut request = [0u8; 10];
                if stream.read_exact(&mut request).await.is_err() {
                    return;
                }
                let status = if grant { 0x00 } else { 0x05 };
                let reply = [0x05, status, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
                if stream.write_all(&reply).await.is_err() {
                    return;
                }
                if !grant {
                    return;
                }

                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });

    addr
}

/// Spawn the gateway (traffic serve loop plus SOCKS5 front end) on an
/// ephemeral port and return its address.
pub async fn spawn_gateway(pool: &Arc<ProxyPool>) -> SocketAddr {
    let (traffic_tx, traffic_rx) = channel::request_channel();
    tokio::spawn(pool.clone().serve_traffic(traffic_rx));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server::serve(listener, traffic_tx, UpstreamConnector::new()));

    addr
}

/// Run the client half of a SOCKS5 CONNECT handshake and return the
/// gateway's ten-byte reply frame.
pub async fn client_handshake(stream: &mut TcpStream, request: &[u8]) -> [u8; 10] {
    stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await.unwrap();
    assert_eq!(method, [0x05, 0x00], "gateway must choose no-auth");

    stream.write_all(request).await.unwrap();
    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).await.unwrap();
    reply
}
