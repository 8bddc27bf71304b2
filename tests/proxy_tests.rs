//! End-to-end forwarding tests
//!
//! Verification is disabled here; these exercise the dispatcher:
//! - Method, path, query and status relay
//! - Round-robin target selection
//! - Body re-encoding and Content-Length
//! - Host/Origin handling and X-Forwarded-* headers
//! - Upstream failures, timeouts and the connection limit

mod common;

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::http::{Request, StatusCode, header};
use certgate::config::Config;
use common::*;
use pretty_assertions::assert_eq;
use tokio::net::TcpListener;

/// An address nothing is listening on.
async fn closed_port() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}")
}

/// Serve the gateway on an ephemeral port with peer addresses available.
async fn serve(config: Config) -> SocketAddr {
    let app = router(config);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    addr
}

/// Poll `/health` until the free upstream slot count equals `expected`.
async fn wait_for_free_slots(app: &axum::Router, expected: u64) {
    for _ in 0..100 {
        if send(app, get("/health")).await.json()["upstream_slots_free"] == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("upstream_slots_free never reached {expected}");
}

#[tokio::test]
async fn method_path_and_query_are_preserved() {
    let app = router(open_config(vec![spawn_echo("a").await]));

    let res = send(
        &app,
        Request::builder()
            .method("PUT")
            .uri("/v1/items/42?expand=owner&q=a%20b")
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(res.status, StatusCode::OK);
    let echoed = res.json();
    assert_eq!(echoed["method"], "PUT");
    assert_eq!(echoed["path"], "/v1/items/42");
    assert_eq!(echoed["query"], "expand=owner&q=a%20b");
}

#[tokio::test]
async fn non_get_on_local_routes_is_forwarded() {
    let app = router(open_config(vec![spawn_echo("a").await]));

    let res = send(
        &app,
        Request::builder().method("POST").uri("/").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(res.json()["method"], "POST");
}

#[tokio::test]
async fn target_base_path_is_prefixed() {
    let base = format!("{}/backend", spawn_echo("a").await);
    let app = router(open_config(vec![base]));

    let res = send(&app, get("/orders")).await;
    assert_eq!(res.json()["path"], "/backend/orders");
}

#[tokio::test]
async fn upstream_status_and_headers_are_relayed() {
    let app = router(open_config(vec![spawn_echo("a").await]));

    let res = send(&app, get("/status/418")).await;
    assert_eq!(res.status, StatusCode::IM_A_TEAPOT);
    assert_eq!(res.headers["x-upstream-status"], "418");
    assert_eq!(res.text(), "from upstream");
}

#[tokio::test]
async fn multiple_targets_are_round_robined() {
    let a = spawn_echo("a").await;
    let b = spawn_echo("b").await;
    let app = router(open_config(vec![a, b]));

    let mut seen = Vec::new();
    for _ in 0..4 {
        seen.push(send(&app, get("/who")).await.json()["upstream"].as_str().unwrap().to_string());
    }
    assert_eq!(seen, ["a", "b", "a", "b"]);
}

#[tokio::test]
async fn raw_body_is_forwarded_byte_for_byte() {
    let app = router(open_config(vec![spawn_echo("a").await]));
    let payload = r#"{ "spaced" :  true }"#;

    let res = send(
        &app,
        Request::builder()
            .method("POST")
            .uri("/raw")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(payload))
            .unwrap(),
    )
    .await;

    let echoed = res.json();
    assert_eq!(echoed["body"], payload);
    assert_eq!(echoed["headers"]["content-length"], payload.len().to_string());
}

#[tokio::test]
async fn parsed_json_body_is_reencoded_with_matching_length() {
    let mut config = open_config(vec![spawn_echo("a").await]);
    config.forwarding.parse_bodies = true;
    let app = router(config);

    let res = send(
        &app,
        Request::builder()
            .method("POST")
            .uri("/json")
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::CONTENT_LENGTH, "7")
            .body(Body::from(r#"{"a":1}"#))
            .unwrap(),
    )
    .await;

    let echoed = res.json();
    assert_eq!(echoed["body"], r#"{"a":1}"#);
    assert_eq!(echoed["headers"]["content-length"], "7");
}

#[tokio::test]
async fn parsed_form_body_is_reencoded_with_matching_length() {
    let mut config = open_config(vec![spawn_echo("a").await]);
    config.forwarding.parse_bodies = true;
    let app = router(config);

    let res = send(
        &app,
        Request::builder()
            .method("POST")
            .uri("/form")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from("a=1&b=two"))
            .unwrap(),
    )
    .await;

    let echoed = res.json();
    assert_eq!(echoed["body"], "a=1&b=two");
    assert_eq!(echoed["headers"]["content-length"], "9");
}

#[tokio::test]
async fn parsing_never_alters_bodies_it_cannot_reproduce() {
    let mut config = open_config(vec![spawn_echo("a").await]);
    config.forwarding.parse_bodies = true;
    let app = router(config);

    for (content_type, payload) in [
        ("application/x-www-form-urlencoded", "sig=%FF%FE&a=1"),
        ("application/json", r#"{"id":123456789012345678901234567890}"#),
    ] {
        let res = send(
            &app,
            Request::builder()
                .method("POST")
                .uri("/exact")
                .header(header::CONTENT_TYPE, content_type)
                .body(Body::from(payload))
                .unwrap(),
        )
        .await;

        let echoed = res.json();
        assert_eq!(echoed["body"], payload);
        assert_eq!(echoed["headers"]["content-length"], payload.len().to_string());
    }
}

#[tokio::test]
async fn oversized_body_is_rejected() {
    let mut config = open_config(vec![spawn_echo("a").await]);
    config.forwarding.max_body_bytes = 16;
    let app = router(config);

    let res = send(
        &app,
        Request::builder()
            .method("POST")
            .uri("/upload")
            .body(Body::from(vec![b'x'; 64]))
            .unwrap(),
    )
    .await;
    assert_eq!(res.status, StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn oversized_body_with_declared_length_is_rejected_up_front() {
    let mut config = open_config(vec![spawn_echo("a").await]);
    config.forwarding.max_body_bytes = 16;
    let app = router(config);

    let res = send(
        &app,
        Request::builder()
            .method("POST")
            .uri("/upload")
            .header(header::CONTENT_LENGTH, "64")
            .body(Body::from(vec![b'x'; 64]))
            .unwrap(),
    )
    .await;
    assert_eq!(res.status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(res.json()["error"]["status"], 413);
}

#[tokio::test]
async fn failed_body_stream_is_bad_request() {
    let app = router(open_config(vec![spawn_echo("a").await]));

    let chunks: Vec<Result<Bytes, io::Error>> = vec![
        Ok(Bytes::from_static(b"partial")),
        Err(io::Error::new(io::ErrorKind::ConnectionReset, "client went away")),
    ];
    let res = send(
        &app,
        Request::builder()
            .method("POST")
            .uri("/upload")
            .body(Body::from_stream(futures::stream::iter(chunks)))
            .unwrap(),
    )
    .await;

    assert_eq!(res.status, StatusCode::BAD_REQUEST);
    assert_eq!(res.json()["error"]["status"], 400);
}

#[tokio::test]
async fn host_is_preserved_unless_change_origin() {
    let upstream = spawn_echo("a").await;
    let upstream_host = upstream.trim_start_matches("http://").to_string();

    let request = || {
        Request::builder()
            .uri("/host")
            .header(header::HOST, "api.example.com")
            .header(header::ORIGIN, "https://app.example.com")
            .body(Body::empty())
            .unwrap()
    };

    let app = router(open_config(vec![upstream.clone()]));
    let res = send(&app, request()).await;
    assert_eq!(res.upstream_header("host").as_deref(), Some("api.example.com"));
    assert_eq!(res.upstream_header("origin").as_deref(), Some("https://app.example.com"));

    let mut config = open_config(vec![upstream.clone()]);
    config.forwarding.change_origin = true;
    let app = router(config);
    let res = send(&app, request()).await;
    assert_eq!(res.upstream_header("host"), Some(upstream_host));
    assert_eq!(res.upstream_header("origin"), Some(upstream));
}

#[tokio::test]
async fn hop_by_hop_headers_are_not_forwarded() {
    let app = router(open_config(vec![spawn_echo("a").await]));

    let res = send(
        &app,
        Request::builder()
            .uri("/hop")
            .header(header::CONNECTION, "x-trace-hint")
            .header("x-trace-hint", "drop-me")
            .header("proxy-authorization", "Basic Zm9vOmJhcg==")
            .header("x-request-id", "keep-me")
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(res.upstream_header("x-trace-hint"), None);
    assert_eq!(res.upstream_header("proxy-authorization"), None);
    assert_eq!(res.upstream_header("x-request-id").as_deref(), Some("keep-me"));
}

#[tokio::test]
async fn xfwd_reports_the_peer_address() {
    let mut config = open_config(vec![spawn_echo("a").await]);
    config.forwarding.xfwd = true;
    let addr = serve(config).await;

    let echoed: serde_json::Value = reqwest::get(format!("http://{addr}/xfwd"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(echoed["headers"]["x-forwarded-for"], "127.0.0.1");
    assert_eq!(echoed["headers"]["x-forwarded-host"], addr.to_string());
    assert_eq!(echoed["headers"]["x-forwarded-proto"], "http");
}

#[tokio::test]
async fn unreachable_upstream_is_bad_gateway() {
    let app = router(open_config(vec![closed_port().await]));

    let res = send(&app, get("/anything")).await;
    assert_eq!(res.status, StatusCode::BAD_GATEWAY);
    assert_eq!(res.json()["error"]["status"], 502);
}

#[tokio::test]
async fn one_dead_target_does_not_stop_the_rotation() {
    let live = spawn_echo("live").await;
    let app = router(open_config(vec![closed_port().await, live]));

    assert_eq!(send(&app, get("/x")).await.status, StatusCode::BAD_GATEWAY);
    assert_eq!(send(&app, get("/x")).await.json()["upstream"], "live");
}

#[tokio::test]
async fn silent_upstream_is_gateway_timeout() {
    let mut config = open_config(vec![spawn_echo("a").await]);
    config.forwarding.read_timeout = Duration::from_millis(300);
    let app = router(config);

    let started = std::time::Instant::now();
    let res = send(&app, get("/hang")).await;

    assert_eq!(res.status, StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(res.json()["error"]["status"], 504);
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn slow_stream_outlasting_read_timeout_is_relayed_whole() {
    let mut config = open_config(vec![spawn_echo("a").await]);
    // Each gap is shorter than this; the whole stream is much longer.
    config.forwarding.read_timeout = Duration::from_millis(600);
    let app = router(config);

    let started = std::time::Instant::now();
    let res = send(&app, get("/drip")).await;

    assert_eq!(res.status, StatusCode::OK);
    let expected: String = (0..DRIP_CHUNKS).map(drip_chunk).collect();
    assert_eq!(res.text(), expected);
    assert!(started.elapsed() > Duration::from_millis(600));

    // The slot is returned once the body has been relayed
    wait_for_free_slots(&app, 40).await;
}

#[tokio::test]
async fn connection_limit_rejects_requests_that_cannot_get_a_slot() {
    let mut config = open_config(vec![spawn_echo("a").await]);
    config.forwarding.max_connections = 1;
    config.forwarding.connect_timeout = Duration::from_millis(200);
    let app = router(config);

    let holder = {
        let app = app.clone();
        tokio::spawn(async move { send(&app, get("/hang")).await })
    };
    wait_for_free_slots(&app, 0).await;

    let res = send(&app, get("/second")).await;
    assert_eq!(res.status, StatusCode::BAD_GATEWAY);
    assert_eq!(
        res.json()["error"]["message"],
        "Upstream unreachable: Concurrency limit reached"
    );

    // Dropping the in-flight exchange frees its slot
    holder.abort();
    wait_for_free_slots(&app, 1).await;
    assert_eq!(send(&app, get("/second")).await.json()["path"], "/second");
}
