//! TCP echo server and byte-relay proxy.

use super::listen_addr;
use std::io;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
#[allow(unused)]
use tracing::{debug, error, info, trace, warn};

/// Starts a TCP echo server: every byte received on a connection is
/// written straight back until the peer closes.
pub async fn serve_tcp_echo(addr: &str) -> io::Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind(listen_addr(addr)).await?;
    let local = listener.local_addr()?;
    info!(%local, "tcp-echo server listening");
    let handle = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut stream, peer)) => {
                    trace!(%peer, "tcp-echo connection");
                    tokio::spawn(async move {
                        let (mut rd, mut wr) = stream.split();
                        match tokio::io::copy(&mut rd, &mut wr).await {
                            Ok(n) => trace!(%peer, bytes = n, "tcp-echo done"),
                            Err(err) => trace!(%peer, "tcp-echo error: {err}"),
                        }
                    });
                }
                Err(err) => {
                    warn!("tcp-echo accept error: {err}");
                    break;
                }
            }
        }
    });
    Ok((local, handle))
}

/// Starts a TCP proxy relaying bytes in both directions between each
/// accepted connection and a fresh connection to `destination`, until
/// either side closes.
pub async fn serve_tcp_proxy(
    addr: &str,
    destination: String,
) -> io::Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind(listen_addr(addr)).await?;
    let local = listener.local_addr()?;
    info!(%local, %destination, "tcp-proxy listening");
    let handle = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut inbound, peer)) => {
                    let destination = destination.clone();
                    tokio::spawn(async move {
                        let mut outbound = match TcpStream::connect(&destination).await {
                            Ok(stream) => stream,
                            Err(err) => {
                                warn!("tcp-proxy dial {destination} failed: {err}");
                                return;
                            }
                        };
                        match tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await
                        {
                            Ok((up, down)) => {
                                trace!(%peer, up, down, "tcp-proxy relay done")
                            }
                            Err(err) => trace!(%peer, "tcp-proxy relay error: {err}"),
                        }
                    });
                }
                Err(err) => {
                    warn!("tcp-proxy accept error: {err}");
                    break;
                }
            }
        }
    });
    Ok((local, handle))
}
