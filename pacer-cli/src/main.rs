//! pacer command line: `load` drives the periodic runner against a
//! target, the server commands host echo/proxy endpoints, and the small
//! client commands (`curl`, `nc`, `grpcping`) debug single calls.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use pacer::grpc::{self, GrpcRunnerOptions};
use pacer::http::{self, HttpRunnerOptions};
use pacer::report::{self, OutputSink};
use pacer::runner::{Interrupt, RunnerOptions, RunnerResult};
use pacer::server;
use pacer::tcp::{self, TcpRunnerOptions, TCP_URL_PREFIX};
use pacer::udp::{self, UdpRunnerOptions, UDP_URL_PREFIX};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DISABLED: &str = "disabled";

#[derive(Parser, Debug)]
#[command(
    name = "pacer",
    version,
    about = "Paced load generation with latency histograms, plus echo and proxy servers"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a load test against a URL (http/https), tcp://, udp:// or a
    /// gRPC host:port (with --grpc)
    Load(LoadArgs),
    /// Start the http echo, tcp/udp echo, grpc and redirect servers plus
    /// any configured proxies
    Server(ServerArgs),
    /// Start only the TCP echo server (and any -P/-M proxies)
    TcpEcho(TcpEchoArgs),
    /// Start only the UDP echo server
    UdpEcho(UdpEchoArgs),
    /// Start only the https redirector
    Redirect(RedirectArgs),
    /// Serve saved JSON results from the data directory
    Report(ReportArgs),
    /// Start only the -P and -M configured proxies
    Proxies(ProxyArgs),
    /// Fetch the target once and print the response
    Curl(CurlArgs),
    /// Relay stdin/stdout over a single TCP connection
    Nc(NcArgs),
    /// Send gRPC pings (or health checks) to a server
    Grpcping(GrpcPingArgs),
    /// Print the version
    Version,
}

/// `-t` accepts `0` (use `-n`), a negative value (run until
/// interrupted) or a duration like `30s`.
#[derive(Clone, Debug)]
struct RunLength(Option<Duration>);

fn parse_run_length(s: &str) -> Result<RunLength, String> {
    let s = s.trim();
    if s == "0" || s == "0s" {
        return Ok(RunLength(Some(Duration::ZERO)));
    }
    if s.starts_with('-') {
        return Ok(RunLength(None));
    }
    humantime::parse_duration(s)
        .map(|d| RunLength(Some(d)))
        .map_err(|e| e.to_string())
}

#[derive(Args, Debug, Clone)]
struct HttpClientArgs {
    /// Per-call timeout
    #[arg(long, value_parser = humantime::parse_duration, default_value = "15s")]
    timeout: Duration,

    /// HTTP method
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,

    /// Extra request header, repeatable ("Key: Value")
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,

    /// Request body
    #[arg(long)]
    payload: Option<String>,

    /// Content type of the request body
    #[arg(long = "content-type")]
    content_type: Option<String>,

    /// Open a fresh connection for every request
    #[arg(long = "disable-keepalive")]
    disable_keepalive: bool,
}

#[derive(Args, Debug)]
struct LoadArgs {
    /// Queries per second across all workers; 0 for unthrottled
    #[arg(long, default_value_t = 8.0)]
    qps: f64,

    /// Number of workers (connections)
    #[arg(short = 'c', long = "connections", default_value_t = 4)]
    connections: usize,

    /// How long to run; 0 to use -n, negative to run until interrupted
    #[arg(
        short = 't',
        long = "duration",
        value_parser = parse_run_length,
        default_value = "5s",
        allow_hyphen_values = true
    )]
    duration: RunLength,

    /// Run for exactly this number of calls instead of a duration
    #[arg(short = 'n', long = "exactly", default_value_t = 0)]
    exactly: u64,

    /// Comma separated list of percentiles to report
    #[arg(short = 'p', long = "percentiles", default_value = "50,75,90,99,99.9")]
    percentiles: String,

    /// Resolution of the histogram's finest buckets, in seconds
    #[arg(short = 'r', long = "resolution", default_value_t = 0.001)]
    resolution: f64,

    /// Offset of the histogram bucket schedule
    #[arg(long, value_parser = humantime::parse_duration, default_value = "0s")]
    offset: Duration,

    /// De-synchronize workers by randomizing each call instant
    #[arg(long)]
    jitter: bool,

    /// Labels added to the result (defaults to target and hostname)
    #[arg(long)]
    labels: Option<String>,

    /// Opaque run identifier carried into the result
    #[arg(long = "run-id", default_value = "")]
    run_id: String,

    /// Use gRPC for the load test (health checks; add --ping for pings)
    #[arg(long)]
    grpc: bool,

    /// Number of gRPC streams per connection
    #[arg(short = 's', long = "streams", default_value_t = 1)]
    streams: usize,

    /// gRPC: ping echo instead of health checks
    #[arg(long)]
    ping: bool,

    /// Service name passed to gRPC health checks
    #[arg(long = "healthservice", default_value = "")]
    health_service: String,

    /// gRPC: server-side ping response delay
    #[arg(long = "grpc-ping-delay", value_parser = humantime::parse_duration, default_value = "0s")]
    grpc_ping_delay: Duration,

    /// Reply timeout for udp:// targets
    #[arg(long = "udp-timeout", value_parser = humantime::parse_duration, default_value = "750ms")]
    udp_timeout: Duration,

    /// HTTP status that aborts the run; -1 aborts on socket errors
    #[arg(long = "abort-on", allow_hyphen_values = true)]
    abort_on: Option<i32>,

    /// Don't trigger abort-on during each worker's warmup call
    #[arg(long = "allow-initial-errors")]
    allow_initial_errors: bool,

    /// Auto-save the JSON result, named from labels and timestamp
    #[arg(short = 'a')]
    auto_save: bool,

    /// JSON output file path, or '-' for stdout
    #[arg(long)]
    json: Option<String>,

    /// Directory for auto-saved results
    #[arg(long = "data-dir", default_value = ".")]
    data_dir: PathBuf,

    #[command(flatten)]
    client: HttpClientArgs,

    /// URL or destination to load test
    target: String,
}

#[derive(Args, Debug)]
struct ServerArgs {
    /// HTTP echo server port ("disabled" turns it off)
    #[arg(long = "http-port", default_value = "8080")]
    http_port: String,

    /// TCP echo server port ("disabled" turns it off)
    #[arg(long = "tcp-port", default_value = "8078")]
    tcp_port: String,

    /// UDP echo server port ("disabled" turns it off)
    #[arg(long = "udp-port", default_value = "8078")]
    udp_port: String,

    /// gRPC ping/health server port ("disabled" turns it off)
    #[arg(long = "grpc-port", default_value = "8079")]
    grpc_port: String,

    /// https redirector port ("disabled" turns it off)
    #[arg(long = "redirect-port", default_value = "8081")]
    redirect_port: String,

    /// Echo server debug handler path (empty turns it off)
    #[arg(long = "echo-debug-path", default_value = "/debug")]
    echo_debug_path: String,

    /// Default query parameters applied to echo requests without one,
    /// e.g. "status=404&delay=3s"
    #[arg(long = "echo-server-default-params", default_value = "")]
    echo_default_params: String,

    /// Maximum size generated by the echo size= parameter, in KiB
    #[arg(long = "maxpayloadsizekb", default_value_t = 256)]
    max_payload_size_kb: usize,

    /// Copy all incoming headers onto fan-out proxy requests
    #[arg(long = "proxy-all-headers", default_value_t = true, action = clap::ArgAction::Set)]
    proxy_all_headers: bool,

    #[command(flatten)]
    proxies: ProxyArgs,
}

#[derive(Args, Debug)]
struct TcpEchoArgs {
    /// Port to listen on
    #[arg(long = "tcp-port", default_value = "8078")]
    tcp_port: String,

    #[command(flatten)]
    proxies: ProxyArgs,
}

#[derive(Args, Debug)]
struct UdpEchoArgs {
    /// Port to listen on
    #[arg(long = "udp-port", default_value = "8078")]
    udp_port: String,

    #[command(flatten)]
    proxies: ProxyArgs,
}

#[derive(Args, Debug)]
struct RedirectArgs {
    /// Port to listen on
    #[arg(long = "redirect-port", default_value = "8081")]
    redirect_port: String,
}

#[derive(Args, Debug)]
struct ReportArgs {
    /// Port to serve the report data on
    #[arg(long = "http-port", default_value = "8080")]
    http_port: String,

    /// Directory where JSON results are stored
    #[arg(long = "data-dir", default_value = ".")]
    data_dir: PathBuf,
}

#[derive(Args, Debug, Clone)]
struct ProxyArgs {
    /// TCP proxy "localAddr destHost:destPort", repeatable
    #[arg(short = 'P', long = "proxy")]
    tcp_proxies: Vec<String>,

    /// HTTP fan-out proxy "localAddr destURL1 destURL2 ...", repeatable
    #[arg(short = 'M', long = "multi")]
    multi_proxies: Vec<String>,

    /// Fan-out one target at a time, returning the last response
    #[arg(long = "multi-serial-mode")]
    multi_serial: bool,

    /// Mirror the incoming request path onto fan-out targets
    #[arg(long = "multi-mirror-origin", default_value_t = true, action = clap::ArgAction::Set)]
    multi_mirror_origin: bool,
}

#[derive(Args, Debug)]
struct CurlArgs {
    #[command(flatten)]
    client: HttpClientArgs,

    /// URL to fetch
    target: String,
}

#[derive(Args, Debug)]
struct NcArgs {
    /// Don't stop when the remote side closes the connection
    #[arg(long = "nc-dont-stop-on-eof")]
    dont_stop_on_eof: bool,

    /// Destination host:port (or tcp://host:port)
    target: String,
}

#[derive(Args, Debug)]
struct GrpcPingArgs {
    /// Number of pings to send
    #[arg(short = 'n', long = "exactly", default_value_t = 1)]
    count: usize,

    /// Ping payload
    #[arg(long, default_value = "")]
    payload: String,

    /// Server-side response delay
    #[arg(long = "grpc-ping-delay", value_parser = humantime::parse_duration, default_value = "0s")]
    delay: Duration,

    /// Health check instead of ping
    #[arg(long)]
    health: bool,

    /// Service name passed to the health check
    #[arg(long = "healthservice", default_value = "")]
    health_service: String,

    /// Destination host, host:port or ip:port
    target: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            std::process::exit(1);
        }
    };

    if let Err(err) = dispatch(cli).await {
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}

async fn dispatch(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Load(args) => load(args).await,
        Command::Server(args) => server_cmd(args).await,
        Command::TcpEcho(args) => {
            server::serve_tcp_echo(&args.tcp_port).await?;
            let started = start_proxies(&args.proxies).await?;
            info!(proxies = started, "tcp-echo up");
            wait_forever().await
        }
        Command::UdpEcho(args) => {
            server::serve_udp_echo(&args.udp_port).await?;
            let started = start_proxies(&args.proxies).await?;
            info!(proxies = started, "udp-echo up");
            wait_forever().await
        }
        Command::Redirect(args) => {
            if args.redirect_port == DISABLED {
                bail!("redirect command needs an enabled -redirect-port");
            }
            server::serve_redirect(&args.redirect_port).await?;
            wait_forever().await
        }
        Command::Report(args) => report_cmd(args).await,
        Command::Proxies(args) => {
            let started = start_proxies(&args).await?;
            if started == 0 {
                bail!("proxies command needs at least one -P or -M flag");
            }
            wait_forever().await
        }
        Command::Curl(args) => curl(args).await,
        Command::Nc(args) => {
            tcp::netcat(&args.target, !args.dont_stop_on_eof).await?;
            Ok(())
        }
        Command::Grpcping(args) => grpcping(args).await,
        Command::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

async fn wait_forever() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("waiting for interrupt")?;
    info!("interrupted, shutting down");
    Ok(())
}

fn watch_interrupt() -> Interrupt {
    let interrupt = Interrupt::new();
    let trigger = interrupt.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupting run");
            trigger.trigger();
        }
    });
    interrupt
}

fn default_labels(target: &str) -> String {
    let short = target
        .strip_prefix("https://")
        .or_else(|| target.strip_prefix("http://"))
        .unwrap_or(target);
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    let host = host.split('.').next().unwrap_or(&host).to_string();
    format!("{short} , {host}")
}

fn runner_options(args: &LoadArgs) -> Result<RunnerOptions> {
    let percentiles = pacer_core::parse_percentiles(&args.percentiles)
        .context("unable to parse -p percentile list")?;
    let labels = args
        .labels
        .clone()
        .unwrap_or_else(|| default_labels(&args.target));
    Ok(RunnerOptions {
        qps: args.qps,
        num_workers: args.connections,
        duration: args.duration.0,
        exactly: args.exactly,
        percentiles,
        resolution: args.resolution,
        offset: args.offset,
        jitter: args.jitter,
        run_id: args.run_id.clone(),
        labels,
        allow_initial_errors: args.allow_initial_errors,
    })
}

fn http_options(args: &LoadArgs, runner: RunnerOptions) -> Result<HttpRunnerOptions> {
    Ok(HttpRunnerOptions {
        runner,
        url: args.target.clone(),
        method: args
            .client
            .method
            .parse()
            .with_context(|| format!("invalid method {:?}", args.client.method))?,
        headers: parse_headers(&args.client.headers)?,
        payload: args.client.payload.clone().map(String::into_bytes),
        content_type: args.client.content_type.clone(),
        timeout: args.client.timeout,
        disable_keepalive: args.client.disable_keepalive,
        abort_on: args.abort_on,
    })
}

fn parse_headers(headers: &[String]) -> Result<Vec<(String, String)>> {
    headers
        .iter()
        .map(|h| {
            h.split_once(':')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                .with_context(|| format!("invalid header {h:?}, expecting Key: Value"))
        })
        .collect()
}

async fn load(args: LoadArgs) -> Result<()> {
    let runner = runner_options(&args)?;
    let interrupt = watch_interrupt();
    let qps_banner = if runner.qps <= 0.0 {
        "max".to_string()
    } else {
        format!("{}", runner.qps)
    };
    let length_banner = if args.exactly > 0 {
        format!("for {} calls", args.exactly)
    } else {
        match args.duration.0 {
            Some(d) => format!("for {}", humantime::format_duration(d)),
            None => "until interrupted".to_string(),
        }
    };
    eprintln!(
        "pacer {} running at {qps_banner} queries per second, {} workers, {length_banner}: {}",
        env!("CARGO_PKG_VERSION"),
        runner.num_workers,
        args.target
    );

    if args.grpc {
        let opts = GrpcRunnerOptions {
            runner,
            destination: args.target.clone(),
            streams: args.streams,
            use_ping: args.ping,
            service: args.health_service.clone(),
            payload: args.client.payload.clone().unwrap_or_default(),
            ping_delay: args.grpc_ping_delay,
        };
        let res = grpc::run(&opts, interrupt).await?;
        finish(&res, res.result.clone(), &args)
    } else if args.target.starts_with(TCP_URL_PREFIX) {
        let opts = TcpRunnerOptions {
            runner,
            destination: args.target.clone(),
            payload: args
                .client
                .payload
                .clone()
                .map(String::into_bytes)
                .unwrap_or_default(),
            timeout: args.client.timeout,
            abort_on_socket: args.abort_on == Some(-1),
        };
        let res = tcp::run(&opts, interrupt).await?;
        finish(&res, res.result.clone(), &args)
    } else if args.target.starts_with(UDP_URL_PREFIX) {
        let opts = UdpRunnerOptions {
            runner,
            destination: args.target.clone(),
            payload: args
                .client
                .payload
                .clone()
                .map(String::into_bytes)
                .unwrap_or_default(),
            timeout: args.udp_timeout,
            abort_on_socket: args.abort_on == Some(-1),
        };
        let res = udp::run(&opts, interrupt).await?;
        finish(&res, res.result.clone(), &args)
    } else {
        let opts = http_options(&args, runner)?;
        let res = http::run(&opts, interrupt).await?;
        finish(&res, res.result.clone(), &args)
    }
}

/// Prints the run summary, writes the JSON document when requested and
/// maps aborted runs to a non-zero exit.
fn finish<T: Serialize>(res: &T, base: RunnerResult, args: &LoadArgs) -> Result<()> {
    let hist = &base.duration_histogram;
    let warmup = if base.exactly > 0 {
        0
    } else {
        base.num_threads as u64
    };
    eprintln!(
        "All done {} calls (plus {} warmup) {:.3} ms avg, {:.1} qps",
        hist.count,
        warmup,
        hist.avg * 1000.0,
        base.actual_qps
    );
    for row in &hist.percentiles {
        eprintln!("# p{} {:.3} ms", row.percentile, row.value * 1000.0);
    }
    if base.error_count > 0 {
        eprintln!("{} calls failed", base.error_count);
    }

    let sink = match (&args.json, args.auto_save) {
        (Some(spec), _) => Some(OutputSink::parse(spec)),
        (None, true) => Some(OutputSink::File(report::auto_save_path(
            &args.data_dir,
            &base.labels,
            base.start_time,
        ))),
        (None, false) => None,
    };
    if let Some(sink) = sink {
        let written = report::write_json(res, &sink).context("unable to write JSON result")?;
        eprintln!("Successfully wrote JSON result to {written}");
    }

    if base.aborted {
        bail!("run aborted by abort-on condition");
    }
    Ok(())
}

async fn server_cmd(args: ServerArgs) -> Result<()> {
    pacer_core::init_max_payload_size(args.max_payload_size_kb * pacer_core::KILOBYTE);
    if !args.echo_default_params.is_empty() {
        server::set_default_echo_params(&args.echo_default_params);
    }
    server::set_proxy_all_headers(args.proxy_all_headers);
    if args.tcp_port != DISABLED {
        server::serve_tcp_echo(&args.tcp_port).await?;
    }
    if args.udp_port != DISABLED {
        server::serve_udp_echo(&args.udp_port).await?;
    }
    if args.grpc_port != DISABLED {
        grpc::serve(&server::listen_addr(&args.grpc_port)).await?;
    }
    if args.redirect_port != DISABLED {
        server::serve_redirect(&args.redirect_port).await?;
    }
    if args.http_port != DISABLED {
        let debug_path = if args.echo_debug_path.is_empty() {
            None
        } else {
            Some(args.echo_debug_path.as_str())
        };
        server::serve_echo(&args.http_port, debug_path).await?;
    }
    start_proxies(&args.proxies).await?;
    info!("all pacer servers started");
    wait_forever().await
}

async fn start_proxies(args: &ProxyArgs) -> Result<usize> {
    let mut started = 0;
    for spec in &args.tcp_proxies {
        let (local, dest) = server::parse_tcp_proxy_spec(spec)?;
        server::serve_tcp_proxy(&local, dest).await?;
        started += 1;
    }
    for spec in &args.multi_proxies {
        let (local, cfg) =
            server::parse_multi_spec(spec, args.multi_serial, args.multi_mirror_origin)?;
        server::serve_multi(&local, cfg).await?;
        started += 1;
    }
    Ok(started)
}

async fn report_cmd(args: ReportArgs) -> Result<()> {
    use tower_http::services::ServeDir;
    let listener =
        tokio::net::TcpListener::bind(server::listen_addr(&args.http_port)).await?;
    let local = listener.local_addr()?;
    info!(%local, dir = %args.data_dir.display(), "report server listening");
    let router = axum::Router::new().fallback_service(ServeDir::new(&args.data_dir));
    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, router).await {
            tracing::error!("report server error: {err}");
        }
    });
    wait_forever().await
}

async fn curl(args: CurlArgs) -> Result<()> {
    let opts = HttpRunnerOptions {
        url: args.target.clone(),
        method: args
            .client
            .method
            .parse()
            .with_context(|| format!("invalid method {:?}", args.client.method))?,
        headers: parse_headers(&args.client.headers)?,
        payload: args.client.payload.clone().map(String::into_bytes),
        content_type: args.client.content_type.clone(),
        timeout: args.client.timeout,
        ..Default::default()
    };
    let (status, headers, body) = http::fetch(&opts).await?;
    println!("HTTP {status}");
    for (name, value) in &headers {
        println!("{}: {}", name, value.to_str().unwrap_or("<binary>"));
    }
    println!();
    use std::io::Write;
    std::io::stdout().write_all(&body)?;
    Ok(())
}

async fn grpcping(args: GrpcPingArgs) -> Result<()> {
    if args.health {
        let serving = grpc::health_check(&args.target, &args.health_service).await?;
        println!(
            "{}: {}",
            args.target,
            if serving { "SERVING" } else { "NOT SERVING" }
        );
        if !serving {
            bail!("service is not serving");
        }
        return Ok(());
    }
    let rtts = grpc::ping_client_call(&args.target, args.count, &args.payload, args.delay).await?;
    for (i, rtt) in rtts.iter().enumerate() {
        println!("ping {} rtt {:.3} ms", i, rtt.as_secs_f64() * 1000.0);
    }
    let avg = rtts.iter().map(Duration::as_secs_f64).sum::<f64>() / rtts.len().max(1) as f64;
    println!("avg rtt {:.3} ms over {} pings", avg * 1000.0, rtts.len());
    Ok(())
}
