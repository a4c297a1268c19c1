//! UDP echo server.

use super::listen_addr;
use std::io;
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
#[allow(unused)]
use tracing::{info, trace, warn};

/// Starts a UDP echo server: each datagram is sent back to its sender.
pub async fn serve_udp_echo(addr: &str) -> io::Result<(SocketAddr, JoinHandle<()>)> {
    let socket = UdpSocket::bind(listen_addr(addr)).await?;
    let local = socket.local_addr()?;
    info!(%local, "udp-echo server listening");
    let handle = tokio::spawn(async move {
        let mut buf = vec![0u8; 65536];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((n, peer)) => {
                    trace!(%peer, bytes = n, "udp-echo");
                    if let Err(err) = socket.send_to(&buf[..n], peer).await {
                        warn!(%peer, "udp-echo send error: {err}");
                    }
                }
                Err(err) => {
                    warn!("udp-echo recv error: {err}");
                    break;
                }
            }
        }
    });
    Ok((local, handle))
}
