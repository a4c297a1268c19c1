//! HTTP echo server with response shaping knobs, a debug handler, the
//! https redirector and the N-way fan-out proxy.
//!
//! Echo knobs (query parameters, with an atomically updatable default
//! query applied when a request has none):
//! - `status`: numeric code or weighted spec `code:weight,...`
//! - `delay`: duration or weighted spec `duration:weight,...`
//! - `size`: response of N payload bytes instead of the echoed body
//! - `header`: repeatable `Key: Value` response headers
//! - `close`: ask for connection close after the response

use super::listen_addr;
use arc_swap::ArcSwap;
use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::{CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, HOST, TRANSFER_ENCODING};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::any;
use axum::Router;
use bytes::Bytes;
use lazy_static::lazy_static;
use pacer_core::{parse_delay_distribution, parse_status_distribution};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
#[allow(unused)]
use tracing::{debug, error, info, trace, warn};

/// Upper bound for the `delay` knob so a stray parameter cannot park
/// server tasks for minutes.
const MAX_ECHO_DELAY: Duration = Duration::from_millis(1500);

lazy_static! {
    static ref DEFAULT_ECHO_PARAMS: ArcSwap<String> = ArcSwap::from_pointee(String::new());
}

static PROXY_ALL_HEADERS: AtomicBool = AtomicBool::new(true);

/// Default query string applied to echo requests that carry none.
/// Runtime tunable: an external config watcher may call this at any time.
pub fn set_default_echo_params(params: &str) {
    DEFAULT_ECHO_PARAMS.store(Arc::new(params.to_string()));
}

/// Whether the fan-out proxy forwards all request headers or only adds
/// its own. Runtime tunable like [`set_default_echo_params`].
pub fn set_proxy_all_headers(value: bool) {
    PROXY_ALL_HEADERS.store(value, Ordering::Relaxed);
}

fn echo_params(uri: &Uri) -> Vec<(String, String)> {
    let query = match uri.query() {
        Some(q) => q.to_string(),
        None => DEFAULT_ECHO_PARAMS.load().as_ref().clone(),
    };
    url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect()
}

fn first_param<'a>(params: &'a [(String, String)], key: &str) -> Option<&'a str> {
    params
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

async fn echo_handler(req: Request) -> Response {
    if cfg!(feature = "metrics") {
        metrics::counter!("pacer_echo_requests").increment(1);
    }
    let (parts, body) = req.into_parts();
    let data = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(data) => data,
        Err(err) => {
            return (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    };
    trace!(method = %parts.method, uri = %parts.uri, bytes = data.len(), "echo");
    let params = echo_params(&parts.uri);
    let mut rng = SmallRng::from_entropy();

    if let Some(spec) = first_param(&params, "delay") {
        if let Ok(dist) = parse_delay_distribution(spec) {
            let delay = dist.pick(&mut rng).min(MAX_ECHO_DELAY);
            if delay > Duration::ZERO {
                tokio::time::sleep(delay).await;
            }
        } else {
            warn!("ignoring invalid delay spec {spec:?}");
        }
    }

    let status = match first_param(&params, "status") {
        Some(spec) => match parse_status_distribution(spec) {
            Ok(dist) => dist.pick(&mut rng),
            Err(_) => {
                warn!("ignoring invalid status spec {spec:?}");
                200
            }
        },
        None => 200,
    };

    let mut headers = HeaderMap::new();
    if first_param(&params, "close").is_some() {
        headers.insert(CONNECTION, HeaderValue::from_static("close"));
    }
    for (key, value) in &params {
        if key != "header" {
            continue;
        }
        let Some((name, val)) = value.split_once(':') else {
            warn!("invalid extra header {value:?}, expecting Key: Value");
            continue;
        };
        match (
            HeaderName::from_bytes(name.trim().as_bytes()),
            HeaderValue::from_str(val.trim()),
        ) {
            (Ok(name), Ok(val)) => {
                headers.append(name, val);
            }
            _ => warn!("invalid extra header {value:?}"),
        }
    }

    let body = match first_param(&params, "size").and_then(|s| s.parse::<usize>().ok()) {
        Some(size) => {
            let slice = pacer_core::payload(size);
            headers.insert(
                CONTENT_TYPE,
                HeaderValue::from_static("application/octet-stream"),
            );
            Bytes::from_static(slice)
        }
        None => {
            // Echo the request's Content-Type and Content-Length back.
            for key in [CONTENT_TYPE, CONTENT_LENGTH] {
                if let Some(value) = parts.headers.get(&key) {
                    headers.insert(key, value.clone());
                }
            }
            data
        }
    };

    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
    (status, headers, body).into_response()
}

/// Plain-text request dump, served on the configured debug path.
async fn debug_handler(
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    req: Request,
) -> Response {
    let (parts, body) = req.into_parts();
    let data = axum::body::to_bytes(body, usize::MAX)
        .await
        .unwrap_or_default();
    let mut out = format!(
        "pacer {} echo debug server - request from {peer}\n\n{} {} {:?}\n\nheaders:\n\n",
        env!("CARGO_PKG_VERSION"),
        parts.method,
        parts.uri,
        parts.version,
    );
    let mut names: Vec<&HeaderName> = parts.headers.keys().collect();
    names.sort_by(|a, b| a.as_str().cmp(b.as_str()));
    for name in names {
        let values: Vec<&str> = parts
            .headers
            .get_all(name)
            .iter()
            .map(|v| v.to_str().unwrap_or("<binary>"))
            .collect();
        out.push_str(&format!("{}: {}\n", name, values.join(",")));
    }
    out.push_str("\nbody:\n\n");
    if data.len() <= 512 {
        out.push_str(&String::from_utf8_lossy(&data));
    } else {
        out.push_str(&String::from_utf8_lossy(&data[..512]));
        out.push_str(&format!("\n... ({} bytes total)", data.len()));
    }
    out.push('\n');
    ([(CONTENT_TYPE, "text/plain; charset=utf-8")], out).into_response()
}

async fn redirect_handler(req: Request) -> Response {
    let host = req
        .headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("localhost");
    let dest = format!("https://{host}{}", req.uri());
    trace!("redirecting to {dest}");
    Redirect::to(&dest).into_response()
}

async fn bind_and_serve(
    addr: &str,
    router: Router,
    name: &'static str,
) -> io::Result<(SocketAddr, JoinHandle<()>)> {
    let listener = tokio::net::TcpListener::bind(listen_addr(addr)).await?;
    let local = listener.local_addr()?;
    info!(%local, "{name} server listening");
    let handle = tokio::spawn(async move {
        let service = router.into_make_service_with_connect_info::<SocketAddr>();
        if let Err(err) = axum::serve(listener, service).await {
            error!("{name} server error: {err}");
        }
    });
    Ok((local, handle))
}

/// Starts the HTTP echo server; `debug_path` adds the request-dump
/// handler (empty/None turns it off).
pub async fn serve_echo(
    addr: &str,
    debug_path: Option<&str>,
) -> io::Result<(SocketAddr, JoinHandle<()>)> {
    let mut router = Router::new();
    if let Some(path) = debug_path.filter(|p| !p.is_empty()) {
        router = router.route(path, any(debug_handler));
    }
    let router = router
        .fallback(echo_handler)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()));
    bind_and_serve(addr, router, "http-echo").await
}

/// Starts the https redirector.
pub async fn serve_redirect(addr: &str) -> io::Result<(SocketAddr, JoinHandle<()>)> {
    let router = Router::new()
        .fallback(redirect_handler)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()));
    bind_and_serve(addr, router, "https-redirector").await
}

/// One fan-out destination.
#[derive(Debug, Clone)]
pub struct TargetConf {
    /// Base URL the incoming request is forwarded to.
    pub destination: String,
    /// Append the incoming path and query to the base URL.
    pub mirror_origin: bool,
}

#[derive(Debug, Clone)]
pub struct MultiProxyConfig {
    /// Forward one target at a time and return the last response, instead
    /// of racing all targets and returning the first one.
    pub serial: bool,
    pub targets: Vec<TargetConf>,
}

struct MultiState {
    cfg: MultiProxyConfig,
    client: reqwest::Client,
}

/// Starts the N-way HTTP fan-out proxy.
pub async fn serve_multi(
    addr: &str,
    cfg: MultiProxyConfig,
) -> io::Result<(SocketAddr, JoinHandle<()>)> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .map_err(io::Error::other)?;
    let state = Arc::new(MultiState { cfg, client });
    let router = Router::new()
        .fallback(multi_handler)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state);
    bind_and_serve(addr, router, "multi-proxy").await
}

async fn multi_handler(
    State(state): State<Arc<MultiState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    req: Request,
) -> Response {
    let (parts, body) = req.into_parts();
    let data = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(data) => data,
        Err(err) => {
            return (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    };
    let path_and_query = parts
        .uri
        .path_and_query()
        .map_or_else(|| "/".to_string(), |pq| pq.as_str().to_string());

    if state.cfg.serial {
        let mut last = None;
        for (idx, target) in state.cfg.targets.iter().enumerate() {
            let resp = forward(
                &state,
                idx,
                target,
                &parts.method,
                &parts.headers,
                peer,
                &path_and_query,
                data.clone(),
            )
            .await;
            last = Some(match resp {
                Ok(resp) => resp,
                Err(err) => {
                    warn!("multi target {} failed: {err}", target.destination);
                    (StatusCode::BAD_GATEWAY, err.to_string()).into_response()
                }
            });
        }
        last.unwrap_or_else(|| StatusCode::BAD_GATEWAY.into_response())
    } else {
        // All targets fire concurrently; the first completed response goes
        // back to the client while the other tasks drain on their own.
        let (tx, mut rx) = mpsc::channel(state.cfg.targets.len().max(1));
        for (idx, target) in state.cfg.targets.iter().cloned().enumerate() {
            let state = state.clone();
            let method = parts.method.clone();
            let headers = parts.headers.clone();
            let path_and_query = path_and_query.clone();
            let data = data.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let resp = forward(
                    &state,
                    idx,
                    &target,
                    &method,
                    &headers,
                    peer,
                    &path_and_query,
                    data,
                )
                .await;
                match resp {
                    Ok(resp) => {
                        let _ = tx.send(resp).await;
                    }
                    Err(err) => {
                        warn!("multi target {} failed: {err}", target.destination);
                    }
                }
            });
        }
        drop(tx);
        match rx.recv().await {
            Some(resp) => resp,
            None => StatusCode::BAD_GATEWAY.into_response(),
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn forward(
    state: &MultiState,
    idx: usize,
    target: &TargetConf,
    method: &Method,
    headers: &HeaderMap,
    peer: SocketAddr,
    path_and_query: &str,
    body: Bytes,
) -> Result<Response, reqwest::Error> {
    let mut url = target.destination.trim_end_matches('/').to_string();
    if target.mirror_origin {
        url.push_str(path_and_query);
    }
    let mut req = state.client.request(method.clone(), &url).body(body);
    if PROXY_ALL_HEADERS.load(Ordering::Relaxed) {
        for (name, value) in headers {
            if *name == HOST || *name == CONTENT_LENGTH {
                continue;
            }
            req = req.header(name, value);
        }
    }
    req = req
        .header("X-On-Behalf-Of", peer.to_string())
        .header("X-Proxy-Id", idx.to_string());
    let resp = req.send().await?;
    let status = resp.status();
    let resp_headers = resp.headers().clone();
    let bytes = resp.bytes().await?;
    trace!(%url, %status, bytes = bytes.len(), "forwarded");

    let mut out = HeaderMap::new();
    for (name, value) in &resp_headers {
        if *name == CONNECTION || *name == TRANSFER_ENCODING || *name == CONTENT_LENGTH {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    Ok((status, out, bytes).into_response())
}
