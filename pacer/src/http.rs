//! HTTP call adapter: one `reqwest` client per worker so connection reuse
//! stays per-worker, with status tallies and a response-size histogram.

use crate::runner::{self, CallOutcome, Caller, Interrupt, RunnerError, RunnerOptions, RunnerResult};
use bytes::Bytes;
use pacer_core::{DistributionReport, Histogram};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, Method, StatusCode};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::time::Duration;
#[allow(unused)]
use tracing::{debug, trace, warn};

#[derive(Debug, Clone)]
pub struct HttpRunnerOptions {
    pub runner: RunnerOptions,
    pub url: String,
    pub method: Method,
    /// Extra `Key: Value` request headers.
    pub headers: Vec<(String, String)>,
    pub payload: Option<Vec<u8>>,
    pub content_type: Option<String>,
    /// Per-call timeout; an expired call fails with its elapsed time
    /// capped at this value.
    pub timeout: Duration,
    pub disable_keepalive: bool,
    /// HTTP status that aborts the whole run, or -1 to abort on socket
    /// errors.
    pub abort_on: Option<i32>,
}

impl Default for HttpRunnerOptions {
    fn default() -> Self {
        Self {
            runner: RunnerOptions::default(),
            url: String::new(),
            method: Method::GET,
            headers: Vec::new(),
            payload: None,
            content_type: None,
            timeout: Duration::from_secs(15),
            disable_keepalive: false,
            abort_on: None,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct HttpRunnerResult {
    #[serde(flatten)]
    pub result: RunnerResult,
    /// Status code (as string) to count of responses.
    pub ret_codes: BTreeMap<String, u64>,
    /// Response body sizes in bytes.
    pub sizes: DistributionReport,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub socket_errors: u64,
}

pub struct HttpCaller {
    client: Client,
    url: String,
    method: Method,
    headers: HeaderMap,
    body: Option<Bytes>,
    abort_on: Option<i32>,
    ret_codes: HashMap<u16, u64>,
    sizes: Histogram,
    bytes_sent: u64,
    bytes_received: u64,
    socket_errors: u64,
}

impl Caller for HttpCaller {
    fn call(&mut self) -> impl Future<Output = CallOutcome> + Send {
        async move {
            let mut req = self
                .client
                .request(self.method.clone(), &self.url)
                .headers(self.headers.clone());
            let sent = self.body.as_ref().map_or(0, |b| b.len() as u64);
            if let Some(body) = &self.body {
                req = req.body(body.clone());
            }
            match req.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    match resp.bytes().await {
                        Ok(body) => {
                            self.bytes_sent += sent;
                            self.bytes_received += body.len() as u64;
                            let _ = self.sizes.record(body.len() as f64);
                            *self.ret_codes.entry(status.as_u16()).or_insert(0) += 1;
                            let ok = status.is_success();
                            let abort =
                                !ok && self.abort_on == Some(i32::from(status.as_u16()));
                            CallOutcome { ok, abort }
                        }
                        Err(err) => {
                            trace!("error reading response body: {err}");
                            self.socket_errors += 1;
                            CallOutcome::failure(self.abort_on == Some(-1))
                        }
                    }
                }
                Err(err) => {
                    trace!("request error: {err}");
                    self.socket_errors += 1;
                    CallOutcome::failure(self.abort_on == Some(-1))
                }
            }
        }
    }
}

fn build_client(opts: &HttpRunnerOptions) -> Result<Client, RunnerError> {
    let mut builder = Client::builder()
        .timeout(opts.timeout)
        .pool_max_idle_per_host(1);
    if opts.disable_keepalive {
        builder = builder.pool_max_idle_per_host(0);
    }
    builder
        .build()
        .map_err(|e| RunnerError::Setup(format!("unable to build http client: {e}")))
}

fn build_headers(opts: &HttpRunnerOptions) -> Result<HeaderMap, RunnerError> {
    let mut headers = HeaderMap::new();
    if let Some(ct) = &opts.content_type {
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_str(ct)
                .map_err(|e| RunnerError::Setup(format!("invalid content type: {e}")))?,
        );
    }
    for (name, value) in &opts.headers {
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|e| RunnerError::Setup(format!("invalid header name {name:?}: {e}")))?;
        let value = HeaderValue::from_str(value.trim())
            .map_err(|e| RunnerError::Setup(format!("invalid header value: {e}")))?;
        headers.append(name, value);
    }
    Ok(headers)
}

fn new_caller(opts: &HttpRunnerOptions, headers: HeaderMap) -> Result<HttpCaller, RunnerError> {
    Ok(HttpCaller {
        client: build_client(opts)?,
        url: opts.url.clone(),
        method: opts.method.clone(),
        headers,
        body: opts.payload.clone().map(Bytes::from),
        abort_on: opts.abort_on,
        ret_codes: HashMap::new(),
        sizes: Histogram::new(0.0, 1.0),
        bytes_sent: 0,
        bytes_received: 0,
        socket_errors: 0,
    })
}

/// Runs an HTTP load test described by `opts`.
pub async fn run(
    opts: &HttpRunnerOptions,
    interrupt: Interrupt,
) -> Result<HttpRunnerResult, RunnerError> {
    let headers = build_headers(opts)?;
    let workers = opts.runner.num_workers.max(1);
    let mut callers = Vec::with_capacity(workers);
    for _ in 0..workers {
        callers.push(new_caller(opts, headers.clone())?);
    }
    let mut runner_opts = opts.runner.clone();
    runner_opts.num_workers = workers;
    let out = runner::run(&runner_opts, callers, "HTTP", interrupt).await?;

    let mut ret_codes = BTreeMap::new();
    let mut sizes = Histogram::new(0.0, 1.0);
    let mut bytes_sent = 0;
    let mut bytes_received = 0;
    let mut socket_errors = 0;
    for caller in &out.callers {
        for (code, count) in &caller.ret_codes {
            *ret_codes.entry(code.to_string()).or_insert(0) += count;
        }
        sizes
            .merge(&caller.sizes)
            .expect("size histograms share one schedule");
        bytes_sent += caller.bytes_sent;
        bytes_received += caller.bytes_received;
        socket_errors += caller.socket_errors;
    }
    Ok(HttpRunnerResult {
        result: out.result,
        ret_codes,
        sizes: sizes.export(&runner_opts.percentiles),
        bytes_sent,
        bytes_received,
        socket_errors,
    })
}

/// Fetches the target once; used by the `curl` command.
pub async fn fetch(
    opts: &HttpRunnerOptions,
) -> Result<(StatusCode, HeaderMap, Bytes), RunnerError> {
    let headers = build_headers(opts)?;
    let client = build_client(opts)?;
    let mut req = client.request(opts.method.clone(), &opts.url).headers(headers);
    if let Some(body) = &opts.payload {
        req = req.body(body.clone());
    }
    let resp = req
        .send()
        .await
        .map_err(|e| RunnerError::Setup(format!("fetch failed: {e}")))?;
    let status = resp.status();
    let resp_headers = resp.headers().clone();
    let body = resp
        .bytes()
        .await
        .map_err(|e| RunnerError::Setup(format!("error reading response: {e}")))?;
    Ok((status, resp_headers, body))
}
