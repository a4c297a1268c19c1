//! gRPC call adapter and ping/health server.
//!
//! Each worker holds one channel carrying `streams` logical clients used
//! round-robin, so one `call` issues one RPC on the next stream. Two
//! probe modes: the standard health-checking protocol, or the unary ping
//! echo with an optional server-side delay.

use crate::proto::ping_client::PingClient;
use crate::proto::{ping_server, PingMessage};
use crate::runner::{self, CallOutcome, Caller, Interrupt, RunnerError, RunnerOptions, RunnerResult};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::{Channel, Endpoint};
use tonic::{Request, Response, Status};
use tonic_health::pb::health_check_response::ServingStatus;
use tonic_health::pb::health_client::HealthClient;
use tonic_health::pb::HealthCheckRequest;
#[allow(unused)]
use tracing::{debug, error, info, trace, warn};

pub const DEFAULT_GRPC_PORT: u16 = 8079;

#[derive(Debug, Clone)]
pub struct GrpcRunnerOptions {
    pub runner: RunnerOptions,
    /// `host:port`, `http://…` or `https://…`.
    pub destination: String,
    /// Logical streams per worker connection.
    pub streams: usize,
    /// Ping echo instead of the default health probe.
    pub use_ping: bool,
    /// Service name passed to the health check.
    pub service: String,
    /// Ping payload.
    pub payload: String,
    /// Server-side response delay requested by pings.
    pub ping_delay: Duration,
}

impl Default for GrpcRunnerOptions {
    fn default() -> Self {
        Self {
            runner: RunnerOptions::default(),
            destination: String::new(),
            streams: 1,
            use_ping: false,
            service: String::new(),
            payload: String::new(),
            ping_delay: Duration::ZERO,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct GrpcRunnerResult {
    #[serde(flatten)]
    pub result: RunnerResult,
    /// gRPC status (or serving status) to count of responses.
    pub ret_codes: BTreeMap<String, u64>,
    pub streams: usize,
}

enum StreamClient {
    Health(HealthClient<Channel>),
    Ping(PingClient<Channel>),
}

pub struct GrpcCaller {
    streams: Vec<StreamClient>,
    next: usize,
    service: String,
    payload: String,
    delay_nanos: i64,
    seq: i64,
    ret_codes: HashMap<String, u64>,
}

impl Caller for GrpcCaller {
    fn call(&mut self) -> impl Future<Output = CallOutcome> + Send {
        let idx = self.next;
        self.next = (self.next + 1) % self.streams.len();
        async move {
            match &mut self.streams[idx] {
                StreamClient::Health(client) => {
                    let req = HealthCheckRequest {
                        service: self.service.clone(),
                    };
                    match client.check(req).await {
                        Ok(resp) => {
                            let status = resp.into_inner().status();
                            let key = format!("{status:?}").to_uppercase();
                            *self.ret_codes.entry(key).or_insert(0) += 1;
                            CallOutcome {
                                ok: status == ServingStatus::Serving,
                                abort: false,
                            }
                        }
                        Err(status) => {
                            *self
                                .ret_codes
                                .entry(format!("{:?}", status.code()))
                                .or_insert(0) += 1;
                            CallOutcome::failure(false)
                        }
                    }
                }
                StreamClient::Ping(client) => {
                    self.seq += 1;
                    let req = PingMessage {
                        seq: self.seq,
                        ts: 0,
                        payload: self.payload.clone(),
                        delay_nanos: self.delay_nanos,
                    };
                    match client.ping(req).await {
                        Ok(_) => {
                            *self.ret_codes.entry("OK".to_string()).or_insert(0) += 1;
                            CallOutcome::success()
                        }
                        Err(status) => {
                            *self
                                .ret_codes
                                .entry(format!("{:?}", status.code()))
                                .or_insert(0) += 1;
                            CallOutcome::failure(false)
                        }
                    }
                }
            }
        }
    }
}

/// Prefixes a scheme when the destination is a bare `host:port`.
pub fn normalize_destination(dest: &str) -> String {
    if dest.starts_with("http://") || dest.starts_with("https://") {
        dest.to_string()
    } else if let Some(rest) = dest.strip_prefix("grpcs://") {
        format!("https://{rest}")
    } else {
        format!("http://{dest}")
    }
}

async fn connect_channel(destination: &str) -> Result<Channel, RunnerError> {
    let endpoint = Endpoint::from_shared(normalize_destination(destination))
        .map_err(|e| RunnerError::Setup(format!("invalid destination {destination:?}: {e}")))?
        .connect_timeout(Duration::from_secs(5));
    endpoint
        .connect()
        .await
        .map_err(|e| RunnerError::Setup(format!("unable to connect to {destination}: {e}")))
}

async fn new_caller(opts: &GrpcRunnerOptions) -> Result<GrpcCaller, RunnerError> {
    let channel = connect_channel(&opts.destination).await?;
    let streams = (0..opts.streams.max(1))
        .map(|_| {
            if opts.use_ping {
                StreamClient::Ping(PingClient::new(channel.clone()))
            } else {
                StreamClient::Health(HealthClient::new(channel.clone()))
            }
        })
        .collect();
    Ok(GrpcCaller {
        streams,
        next: 0,
        service: opts.service.clone(),
        payload: opts.payload.clone(),
        delay_nanos: opts.ping_delay.as_nanos().min(i64::MAX as u128) as i64,
        seq: 0,
        ret_codes: HashMap::new(),
    })
}

/// Runs a gRPC load test; all worker connections are established before
/// the first call or the run fails.
pub async fn run(
    opts: &GrpcRunnerOptions,
    interrupt: Interrupt,
) -> Result<GrpcRunnerResult, RunnerError> {
    let workers = opts.runner.num_workers.max(1);
    let mut callers = Vec::with_capacity(workers);
    for _ in 0..workers {
        callers.push(new_caller(opts).await?);
    }
    let mut runner_opts = opts.runner.clone();
    runner_opts.num_workers = workers;
    let out = runner::run(&runner_opts, callers, "GRPC", interrupt).await?;

    let mut ret_codes = BTreeMap::new();
    for caller in &out.callers {
        for (code, count) in &caller.ret_codes {
            *ret_codes.entry(code.clone()).or_insert(0) += count;
        }
    }
    Ok(GrpcRunnerResult {
        result: out.result,
        ret_codes,
        streams: opts.streams.max(1),
    })
}

/// One-shot pings for the `grpcping` command; returns per-ping round trip
/// times.
pub async fn ping_client_call(
    destination: &str,
    count: usize,
    payload: &str,
    delay: Duration,
) -> Result<Vec<Duration>, RunnerError> {
    let channel = connect_channel(destination).await?;
    let mut client = PingClient::new(channel);
    let mut rtts = Vec::with_capacity(count);
    for seq in 0..count {
        let req = PingMessage {
            seq: seq as i64,
            ts: 0,
            payload: payload.to_string(),
            delay_nanos: delay.as_nanos().min(i64::MAX as u128) as i64,
        };
        let start = Instant::now();
        client
            .ping(req)
            .await
            .map_err(|e| RunnerError::Setup(format!("ping failed: {e}")))?;
        rtts.push(start.elapsed());
    }
    Ok(rtts)
}

/// One-shot health check for the `grpcping -health` mode.
pub async fn health_check(destination: &str, service: &str) -> Result<bool, RunnerError> {
    let channel = connect_channel(destination).await?;
    let mut client = HealthClient::new(channel);
    let resp = client
        .check(HealthCheckRequest {
            service: service.to_string(),
        })
        .await
        .map_err(|e| RunnerError::Setup(format!("health check failed: {e}")))?;
    Ok(resp.into_inner().status() == ServingStatus::Serving)
}

struct PingService;

#[tonic::async_trait]
impl ping_server::Ping for PingService {
    async fn ping(
        &self,
        request: Request<PingMessage>,
    ) -> Result<Response<PingMessage>, Status> {
        let mut msg = request.into_inner();
        trace!(seq = msg.seq, "ping");
        if msg.delay_nanos > 0 {
            tokio::time::sleep(Duration::from_nanos(msg.delay_nanos as u64)).await;
        }
        msg.ts = chrono::Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_default();
        Ok(Response::new(msg))
    }
}

/// Starts the gRPC ping + health server and returns the bound address.
pub async fn serve(addr: &str) -> Result<(SocketAddr, JoinHandle<()>), RunnerError> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    let (mut health_reporter, health_service) = tonic_health::server::health_reporter();
    health_reporter
        .set_serving::<ping_server::PingServer<PingService>>()
        .await;
    info!(%local, "grpc server listening");
    let handle = tokio::spawn(async move {
        let res = tonic::transport::Server::builder()
            .add_service(health_service)
            .add_service(ping_server::PingServer::new(PingService))
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await;
        if let Err(e) = res {
            error!("grpc server error: {e}");
        }
    });
    Ok((local, handle))
}
