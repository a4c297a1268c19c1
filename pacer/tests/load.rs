//! End-to-end runs against in-process servers bound to port 0.

use pacer::grpc::{self, GrpcRunnerOptions};
use pacer::http::{self, HttpRunnerOptions};
use pacer::runner::{Interrupt, RunnerOptions};
use pacer::server;
use pacer::tcp::{self, TcpRunnerOptions};
use pacer::udp::{self, UdpRunnerOptions};
use std::time::Duration;

fn exact_runner(exactly: u64, workers: usize) -> RunnerOptions {
    RunnerOptions {
        qps: 0.0,
        num_workers: workers,
        duration: None,
        exactly,
        ..Default::default()
    }
}

#[tokio::test]
async fn http_exact_count_run() {
    let (addr, _server) = server::serve_echo("127.0.0.1:0", None).await.unwrap();
    let opts = HttpRunnerOptions {
        runner: exact_runner(10, 2),
        url: format!("http://{addr}/"),
        ..Default::default()
    };
    let res = http::run(&opts, Interrupt::new()).await.unwrap();
    assert_eq!(res.result.duration_histogram.count, 10);
    assert_eq!(res.result.error_count, 0);
    assert_eq!(res.ret_codes.get("200"), Some(&10));
    assert_eq!(res.result.run_type, "HTTP");
    // Exact mode reports zero warmup.
    assert_eq!(opts.runner.warmup(), 0);
}

#[tokio::test]
async fn http_paced_run_roughly_matches_qps() {
    let (addr, _server) = server::serve_echo("127.0.0.1:0", None).await.unwrap();
    let opts = HttpRunnerOptions {
        runner: RunnerOptions {
            qps: 80.0,
            num_workers: 4,
            duration: Some(Duration::from_secs(2)),
            ..Default::default()
        },
        url: format!("http://{addr}/"),
        ..Default::default()
    };
    let res = http::run(&opts, Interrupt::new()).await.unwrap();
    let count = res.result.duration_histogram.count;
    // 80 qps for 2s, with slack for loaded CI machines.
    assert!((110..=200).contains(&count), "count was {count}");
    assert!(res.result.actual_qps > 50.0);
    let percentiles = &res.result.duration_histogram.percentiles;
    let ps: Vec<f64> = percentiles.iter().map(|p| p.percentile).collect();
    assert_eq!(ps, vec![50.0, 75.0, 90.0, 99.0, 99.9]);
}

#[tokio::test]
async fn http_abort_on_status_stops_run() {
    let (addr, _server) = server::serve_echo("127.0.0.1:0", None).await.unwrap();
    let opts = HttpRunnerOptions {
        runner: RunnerOptions {
            qps: 0.0,
            num_workers: 2,
            duration: Some(Duration::from_secs(30)),
            ..Default::default()
        },
        url: format!("http://{addr}/?status=503"),
        abort_on: Some(503),
        ..Default::default()
    };
    let start = std::time::Instant::now();
    let res = http::run(&opts, Interrupt::new()).await.unwrap();
    assert!(res.result.aborted);
    assert!(start.elapsed() < Duration::from_secs(10));
    assert!(*res.ret_codes.get("503").unwrap() >= 1);
    assert!(res.result.error_count >= 1);
}

#[tokio::test]
async fn http_result_serializes_contract_keys() {
    let (addr, _server) = server::serve_echo("127.0.0.1:0", None).await.unwrap();
    let opts = HttpRunnerOptions {
        runner: exact_runner(3, 1),
        url: format!("http://{addr}/"),
        ..Default::default()
    };
    let res = http::run(&opts, Interrupt::new()).await.unwrap();
    let json = serde_json::to_value(&res).unwrap();
    for key in [
        "RunType",
        "Labels",
        "RunID",
        "StartTime",
        "RequestedQPS",
        "RequestedDuration",
        "ActualQPS",
        "ActualDuration",
        "NumThreads",
        "DurationHistogram",
        "RetCodes",
        "Sizes",
        "BytesSent",
        "BytesReceived",
    ] {
        assert!(json.get(key).is_some(), "missing key {key}");
    }
    assert_eq!(json["RequestedQPS"], "max");
    assert_eq!(json["DurationHistogram"]["Count"], 3);
}

#[tokio::test]
async fn echo_size_knob_returns_exact_body() {
    let (addr, _server) = server::serve_echo("127.0.0.1:0", None).await.unwrap();
    let client = reqwest::Client::new();
    let resp = client
        .get(format!("http://{addr}/?size=100"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.content_length(), Some(100));
    let body = resp.bytes().await.unwrap();
    assert_eq!(body.len(), 100);

    // Oversized requests clamp to the configured maximum.
    let resp = client
        .get(format!("http://{addr}/?size=99999999999"))
        .send()
        .await
        .unwrap();
    let body = resp.bytes().await.unwrap();
    assert_eq!(body.len(), pacer_core::max_payload_size());
}

#[tokio::test]
async fn echo_status_header_and_body() {
    let (addr, _server) = server::serve_echo("127.0.0.1:0", None).await.unwrap();
    let client = reqwest::Client::new();
    let resp = client
        .post(format!(
            "http://{addr}/?status=418&header=X-Load-Test:+yes&header=X-Other:+2"
        ))
        .header("Content-Type", "text/plain")
        .body("hello there")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 418);
    assert_eq!(resp.headers()["X-Load-Test"].to_str().unwrap(), "yes");
    assert_eq!(resp.headers()["X-Other"].to_str().unwrap(), "2");
    assert_eq!(
        resp.headers()["Content-Type"].to_str().unwrap(),
        "text/plain"
    );
    assert_eq!(resp.text().await.unwrap(), "hello there");
}

#[tokio::test]
async fn echo_close_knob_closes_connection() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    let (addr, _server) = server::serve_echo("127.0.0.1:0", None).await.unwrap();
    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /?close=1 HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();
    // With close requested the server must tear the connection down after
    // the response, so reading to EOF finishes instead of hanging on a
    // kept-alive socket.
    let mut response = Vec::new();
    tokio::time::timeout(
        Duration::from_secs(5),
        stream.read_to_end(&mut response),
    )
    .await
    .expect("server kept the connection open")
    .unwrap();
    let text = String::from_utf8_lossy(&response);
    assert!(text.starts_with("HTTP/1.1 200"));
    assert!(text.to_ascii_lowercase().contains("connection: close"));
}

#[tokio::test]
async fn echo_weighted_status_distribution() {
    let (addr, _server) = server::serve_echo("127.0.0.1:0", None).await.unwrap();
    let client = reqwest::Client::new();
    let mut ok = 0u32;
    const N: u32 = 200;
    for _ in 0..N {
        let resp = client
            .get(format!("http://{addr}/?status=200:3,500:1"))
            .send()
            .await
            .unwrap();
        if resp.status() == 200 {
            ok += 1;
        }
    }
    let share = f64::from(ok) / f64::from(N);
    // ~75% with wide tolerance: N is small to keep the test quick.
    assert!((0.55..0.95).contains(&share), "200 share was {share}");
}

#[tokio::test]
async fn multi_proxy_serial_returns_last_response() {
    let (echo1, _s1) = server::serve_echo("127.0.0.1:0", None).await.unwrap();
    let (echo2, _s2) = server::serve_echo("127.0.0.1:0", None).await.unwrap();
    let cfg = server::MultiProxyConfig {
        serial: true,
        targets: vec![
            server::TargetConf {
                destination: format!("http://{echo1}/"),
                mirror_origin: true,
            },
            server::TargetConf {
                destination: format!("http://{echo2}/"),
                mirror_origin: true,
            },
        ],
    };
    let (proxy, _p) = server::serve_multi("127.0.0.1:0", cfg).await.unwrap();
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("http://{proxy}/"))
        .body("hi")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "hi");
}

#[tokio::test]
async fn multi_proxy_parallel_returns_first_response() {
    let (echo1, _s1) = server::serve_echo("127.0.0.1:0", None).await.unwrap();
    let (echo2, _s2) = server::serve_echo("127.0.0.1:0", None).await.unwrap();
    let cfg = server::MultiProxyConfig {
        serial: false,
        targets: vec![
            server::TargetConf {
                destination: format!("http://{echo1}/"),
                mirror_origin: true,
            },
            // Second target answers slowly; the fast one should win.
            server::TargetConf {
                destination: format!("http://{echo2}/?delay=1s"),
                mirror_origin: false,
            },
        ],
    };
    let (proxy, _p) = server::serve_multi("127.0.0.1:0", cfg).await.unwrap();
    let client = reqwest::Client::new();
    let start = std::time::Instant::now();
    let resp = client
        .post(format!("http://{proxy}/"))
        .body("fan-out")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "fan-out");
    assert!(start.elapsed() < Duration::from_millis(900));
}

#[tokio::test]
async fn echo_debug_handler_dumps_request() {
    let (addr, _server) = server::serve_echo("127.0.0.1:0", Some("/debug")).await.unwrap();
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("http://{addr}/debug"))
        .header("X-Probe", "1")
        .body("ping body")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let text = resp.text().await.unwrap();
    assert!(text.contains("POST"));
    assert!(text.contains("x-probe: 1"));
    assert!(text.contains("ping body"));
}

#[tokio::test]
async fn redirector_sends_https_location() {
    let (addr, _server) = server::serve_redirect("127.0.0.1:0").await.unwrap();
    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap();
    let resp = client
        .get(format!("http://{addr}/some/path?x=1"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 303);
    let location = resp.headers()["Location"].to_str().unwrap();
    assert!(location.starts_with("https://"));
    assert!(location.ends_with("/some/path?x=1"));
}

#[tokio::test]
async fn tcp_echo_round_trip() {
    let (addr, _server) = server::serve_tcp_echo("127.0.0.1:0").await.unwrap();
    let opts = TcpRunnerOptions {
        runner: exact_runner(20, 2),
        destination: format!("tcp://{addr}"),
        ..Default::default()
    };
    let res = tcp::run(&opts, Interrupt::new()).await.unwrap();
    assert_eq!(res.result.duration_histogram.count, 20);
    assert_eq!(res.result.error_count, 0);
    assert_eq!(res.socket_count, 2);
    assert_eq!(res.bytes_sent, res.bytes_received);
    assert!(res.bytes_sent > 0);
}

#[tokio::test]
async fn tcp_proxy_relays_both_ways() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    let (echo, _e) = server::serve_tcp_echo("127.0.0.1:0").await.unwrap();
    let (proxy, _p) = server::serve_tcp_proxy("127.0.0.1:0", echo.to_string())
        .await
        .unwrap();
    let mut stream = tokio::net::TcpStream::connect(proxy).await.unwrap();
    stream.write_all(b"through the proxy").await.unwrap();
    let mut buf = [0u8; 17];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"through the proxy");
}

#[tokio::test]
async fn udp_echo_round_trip() {
    let (addr, _server) = server::serve_udp_echo("127.0.0.1:0").await.unwrap();
    let opts = UdpRunnerOptions {
        runner: exact_runner(15, 3),
        destination: format!("udp://{addr}"),
        ..Default::default()
    };
    let res = udp::run(&opts, Interrupt::new()).await.unwrap();
    assert_eq!(res.result.duration_histogram.count, 15);
    assert_eq!(res.result.error_count, 0);
    assert_eq!(res.socket_count, 3);
}

#[tokio::test]
async fn udp_unanswered_calls_count_as_errors() {
    // A bound socket that never replies: calls fail (by timeout) but are
    // still recorded and counted.
    let silent = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = silent.local_addr().unwrap();
    let opts = UdpRunnerOptions {
        runner: exact_runner(3, 1),
        destination: format!("udp://{addr}"),
        timeout: Duration::from_millis(100),
        ..Default::default()
    };
    let res = udp::run(&opts, Interrupt::new()).await.unwrap();
    drop(silent);
    assert_eq!(res.result.duration_histogram.count, 3);
    assert_eq!(res.result.error_count, 3);
    // Elapsed time of timed out calls is capped near the timeout.
    assert!(res.result.duration_histogram.max >= 0.09);
    assert!(res.result.duration_histogram.max < 1.0);
}

#[tokio::test]
async fn grpc_health_run() {
    let (addr, _server) = grpc::serve("127.0.0.1:0").await.unwrap();
    let opts = GrpcRunnerOptions {
        runner: exact_runner(8, 2),
        destination: addr.to_string(),
        streams: 2,
        ..Default::default()
    };
    let res = grpc::run(&opts, Interrupt::new()).await.unwrap();
    assert_eq!(res.result.duration_histogram.count, 8);
    assert_eq!(res.result.error_count, 0);
    assert_eq!(res.streams, 2);
    assert_eq!(res.ret_codes.get("SERVING"), Some(&8));
}

#[tokio::test]
async fn grpc_ping_run_and_client() {
    let (addr, _server) = grpc::serve("127.0.0.1:0").await.unwrap();
    let opts = GrpcRunnerOptions {
        runner: exact_runner(6, 1),
        destination: addr.to_string(),
        streams: 1,
        use_ping: true,
        payload: "abcdef".to_string(),
        ..Default::default()
    };
    let res = grpc::run(&opts, Interrupt::new()).await.unwrap();
    assert_eq!(res.result.duration_histogram.count, 6);
    assert_eq!(res.ret_codes.get("OK"), Some(&6));

    let rtts = grpc::ping_client_call(&addr.to_string(), 3, "x", Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(rtts.len(), 3);
    assert!(grpc::health_check(&addr.to_string(), "").await.unwrap());
}
