//! UDP call adapter: one bound+connected socket per worker, send the
//! payload and wait for the echo within the configured timeout.

use crate::runner::{self, CallOutcome, Caller, Interrupt, RunnerError, RunnerOptions, RunnerResult};
use crate::tcp::resolve;
use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use tokio::net::UdpSocket;
#[allow(unused)]
use tracing::{debug, trace, warn};

pub const UDP_URL_PREFIX: &str = "udp://";
pub const DEFAULT_UDP_PAYLOAD: &[u8] = b"pacer udp ping";
pub const UDP_TIMEOUT_DEFAULT: Duration = Duration::from_millis(750);

#[derive(Debug, Clone)]
pub struct UdpRunnerOptions {
    pub runner: RunnerOptions,
    /// `udp://host:port` or bare `host:port`.
    pub destination: String,
    pub payload: Vec<u8>,
    pub timeout: Duration,
    pub abort_on_socket: bool,
}

impl Default for UdpRunnerOptions {
    fn default() -> Self {
        Self {
            runner: RunnerOptions::default(),
            destination: String::new(),
            payload: DEFAULT_UDP_PAYLOAD.to_vec(),
            timeout: UDP_TIMEOUT_DEFAULT,
            abort_on_socket: false,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct UdpRunnerResult {
    #[serde(flatten)]
    pub result: RunnerResult,
    pub socket_count: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

pub struct UdpCaller {
    socket: UdpSocket,
    payload: Vec<u8>,
    readback: Vec<u8>,
    timeout: Duration,
    abort_on_socket: bool,
    bytes_sent: u64,
    bytes_received: u64,
}

impl Caller for UdpCaller {
    fn call(&mut self) -> impl Future<Output = CallOutcome> + Send {
        async move {
            if let Err(err) = self.socket.send(&self.payload).await {
                trace!("udp send error: {err}");
                return CallOutcome::failure(self.abort_on_socket);
            }
            self.bytes_sent += self.payload.len() as u64;
            match tokio::time::timeout(self.timeout, self.socket.recv(&mut self.readback)).await
            {
                Ok(Ok(n)) if self.readback[..n] == self.payload[..] => {
                    self.bytes_received += n as u64;
                    CallOutcome::success()
                }
                Ok(Ok(n)) => {
                    trace!("udp echo mismatch, {n} bytes");
                    CallOutcome::failure(self.abort_on_socket)
                }
                Ok(Err(err)) => {
                    trace!("udp recv error: {err}");
                    CallOutcome::failure(self.abort_on_socket)
                }
                Err(_) => {
                    trace!("udp timeout after {:?}", self.timeout);
                    CallOutcome::failure(self.abort_on_socket)
                }
            }
        }
    }
}

/// Runs a UDP echo load test; sockets are bound and connected before the
/// first call or the run fails.
pub async fn run(
    opts: &UdpRunnerOptions,
    interrupt: Interrupt,
) -> Result<UdpRunnerResult, RunnerError> {
    let addr = resolve(&opts.destination, UDP_URL_PREFIX).await?;
    let payload = if opts.payload.is_empty() {
        DEFAULT_UDP_PAYLOAD.to_vec()
    } else {
        opts.payload.clone()
    };
    let workers = opts.runner.num_workers.max(1);
    let mut callers = Vec::with_capacity(workers);
    for _ in 0..workers {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| RunnerError::Setup(format!("unable to bind udp socket: {e}")))?;
        socket
            .connect(addr)
            .await
            .map_err(|e| RunnerError::Setup(format!("unable to connect to {addr}: {e}")))?;
        callers.push(UdpCaller {
            socket,
            payload: payload.clone(),
            readback: vec![0; 65536],
            timeout: opts.timeout,
            abort_on_socket: opts.abort_on_socket,
            bytes_sent: 0,
            bytes_received: 0,
        });
    }
    let mut runner_opts = opts.runner.clone();
    runner_opts.num_workers = workers;
    let out = runner::run(&runner_opts, callers, "UDP", interrupt).await?;

    let socket_count = out.callers.len() as u64;
    let mut bytes_sent = 0;
    let mut bytes_received = 0;
    for caller in &out.callers {
        bytes_sent += caller.bytes_sent;
        bytes_received += caller.bytes_received;
    }
    Ok(UdpRunnerResult {
        result: out.result,
        socket_count,
        bytes_sent,
        bytes_received,
    })
}
