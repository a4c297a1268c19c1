//! TCP call adapter: write a fixed payload, read the echo back, compare
//! byte for byte. Connections are established before the run starts and
//! re-dialed after a failure, counting every socket opened.

use crate::runner::{self, CallOutcome, Caller, Interrupt, RunnerError, RunnerOptions, RunnerResult};
use serde::Serialize;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
#[allow(unused)]
use tracing::{debug, info, trace, warn};

pub const TCP_URL_PREFIX: &str = "tcp://";
pub const DEFAULT_TCP_PAYLOAD: &[u8] = b"pacer tcp ping";

#[derive(Debug, Clone)]
pub struct TcpRunnerOptions {
    pub runner: RunnerOptions,
    /// `tcp://host:port` or bare `host:port`.
    pub destination: String,
    /// Bytes written per call; the echo must return exactly these.
    pub payload: Vec<u8>,
    pub timeout: Duration,
    /// Abort the run on socket errors (CLI `-abort-on -1`).
    pub abort_on_socket: bool,
}

impl Default for TcpRunnerOptions {
    fn default() -> Self {
        Self {
            runner: RunnerOptions::default(),
            destination: String::new(),
            payload: DEFAULT_TCP_PAYLOAD.to_vec(),
            timeout: Duration::from_secs(3),
            abort_on_socket: false,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct TcpRunnerResult {
    #[serde(flatten)]
    pub result: RunnerResult,
    /// Total sockets opened across workers, including re-dials.
    pub socket_count: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

pub struct TcpCaller {
    addr: SocketAddr,
    stream: Option<TcpStream>,
    payload: Vec<u8>,
    readback: Vec<u8>,
    timeout: Duration,
    abort_on_socket: bool,
    socket_count: u64,
    bytes_sent: u64,
    bytes_received: u64,
}

impl Caller for TcpCaller {
    fn call(&mut self) -> impl Future<Output = CallOutcome> + Send {
        async move {
            if self.stream.is_none() {
                match TcpStream::connect(self.addr).await {
                    Ok(stream) => {
                        self.socket_count += 1;
                        self.stream = Some(stream);
                    }
                    Err(err) => {
                        trace!("reconnect to {} failed: {err}", self.addr);
                        return CallOutcome::failure(self.abort_on_socket);
                    }
                }
            }
            let stream = self.stream.as_mut().expect("stream established above");
            let exchange = async {
                stream.write_all(&self.payload).await?;
                stream.read_exact(&mut self.readback).await?;
                Ok::<(), std::io::Error>(())
            };
            match tokio::time::timeout(self.timeout, exchange).await {
                Ok(Ok(())) if self.readback == self.payload => {
                    self.bytes_sent += self.payload.len() as u64;
                    self.bytes_received += self.payload.len() as u64;
                    CallOutcome::success()
                }
                Ok(Ok(())) => {
                    trace!("echo mismatch from {}", self.addr);
                    self.stream = None;
                    CallOutcome::failure(self.abort_on_socket)
                }
                Ok(Err(err)) => {
                    trace!("socket error from {}: {err}", self.addr);
                    self.stream = None;
                    CallOutcome::failure(self.abort_on_socket)
                }
                Err(_) => {
                    trace!("timeout after {:?} from {}", self.timeout, self.addr);
                    self.stream = None;
                    CallOutcome::failure(self.abort_on_socket)
                }
            }
        }
    }
}

/// Strips the scheme prefix and resolves the destination, preferring the
/// first address returned.
pub async fn resolve(destination: &str, prefix: &str) -> Result<SocketAddr, RunnerError> {
    let hostport = destination
        .strip_prefix(prefix)
        .unwrap_or(destination)
        .trim_end_matches('/');
    tokio::net::lookup_host(hostport)
        .await
        .map_err(|e| RunnerError::Setup(format!("cannot resolve {hostport:?}: {e}")))?
        .next()
        .ok_or_else(|| RunnerError::Setup(format!("no address for {hostport:?}")))
}

/// Runs a TCP echo load test; every worker connects before the first call
/// or the run fails.
pub async fn run(
    opts: &TcpRunnerOptions,
    interrupt: Interrupt,
) -> Result<TcpRunnerResult, RunnerError> {
    let addr = resolve(&opts.destination, TCP_URL_PREFIX).await?;
    let payload = if opts.payload.is_empty() {
        DEFAULT_TCP_PAYLOAD.to_vec()
    } else {
        opts.payload.clone()
    };
    let workers = opts.runner.num_workers.max(1);
    let mut callers = Vec::with_capacity(workers);
    for _ in 0..workers {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| RunnerError::Setup(format!("unable to connect to {addr}: {e}")))?;
        callers.push(TcpCaller {
            addr,
            stream: Some(stream),
            payload: payload.clone(),
            readback: vec![0; payload.len()],
            timeout: opts.timeout,
            abort_on_socket: opts.abort_on_socket,
            socket_count: 1,
            bytes_sent: 0,
            bytes_received: 0,
        });
    }
    let mut runner_opts = opts.runner.clone();
    runner_opts.num_workers = workers;
    let out = runner::run(&runner_opts, callers, "TCP", interrupt).await?;

    let mut socket_count = 0;
    let mut bytes_sent = 0;
    let mut bytes_received = 0;
    for caller in &out.callers {
        socket_count += caller.socket_count;
        bytes_sent += caller.bytes_sent;
        bytes_received += caller.bytes_received;
    }
    Ok(TcpRunnerResult {
        result: out.result,
        socket_count,
        bytes_sent,
        bytes_received,
    })
}

/// Single raw connection relaying stdin to the destination and the
/// destination to stdout (the `nc` command). With `stop_on_eof` the relay
/// ends as soon as the remote side closes.
pub async fn netcat(destination: &str, stop_on_eof: bool) -> Result<(), RunnerError> {
    let addr = resolve(destination, TCP_URL_PREFIX).await?;
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| RunnerError::Setup(format!("unable to connect to {addr}: {e}")))?;
    info!(%addr, "connected");
    let (mut rd, mut wr) = stream.into_split();
    let to_remote = tokio::spawn(async move {
        let mut stdin = tokio::io::stdin();
        let _ = tokio::io::copy(&mut stdin, &mut wr).await;
        let _ = wr.shutdown().await;
    });
    let mut stdout = tokio::io::stdout();
    tokio::io::copy(&mut rd, &mut stdout).await?;
    if stop_on_eof {
        to_remote.abort();
    } else {
        let _ = to_remote.await;
    }
    Ok(())
}
