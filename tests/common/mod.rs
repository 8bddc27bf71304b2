//! Shared fixtures: echo upstreams and gateway builders

use std::time::Duration;

use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::Path,
    http::{HeaderMap, Method, Request, StatusCode, Uri},
    response::IntoResponse,
    routing::any,
};
use certgate::config::Config;
use certgate::gateway::Gateway;
use serde_json::{Map, Value, json};
use tokio::net::TcpListener;
use tower::ServiceExt;

/// Chunks sent by `/drip`, one per `DRIP_INTERVAL`.
pub const DRIP_CHUNKS: u8 = 10;
pub const DRIP_INTERVAL: Duration = Duration::from_millis(150);

// ─────────────────────────────────────────────────────────────────────────────
// Upstreams
// ─────────────────────────────────────────────────────────────────────────────

/// Start an upstream that answers every request with a JSON description of it.
///
/// - `/status/{code}` answers with that status instead
/// - `/hang` sends nothing for 30 seconds
/// - `/drip` streams `DRIP_CHUNKS` chunks, `DRIP_INTERVAL` apart
pub async fn spawn_echo(name: &'static str) -> String {
    let echo = move |method: Method, uri: Uri, headers: HeaderMap, body: Bytes| async move {
        let headers: Map<String, Value> = headers
            .iter()
            .map(|(k, v)| {
                (
                    k.as_str().to_string(),
                    Value::String(v.to_str().unwrap_or_default().to_string()),
                )
            })
            .collect();
        Json(json!({
            "upstream": name,
            "method": method.as_str(),
            "path": uri.path(),
            "query": uri.query(),
            "headers": headers,
            "body": String::from_utf8_lossy(&body),
        }))
    };

    let app = Router::new()
        .route("/status/{code}", any(status_handler))
        .route("/hang", any(hang_handler))
        .route("/drip", any(drip_handler))
        .fallback(echo);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

async fn status_handler(Path(code): Path<u16>) -> impl IntoResponse {
    let status = StatusCode::from_u16(code).unwrap_or(StatusCode::BAD_REQUEST);
    (status, [("x-upstream-status", code.to_string())], "from upstream")
}

async fn hang_handler() -> &'static str {
    tokio::time::sleep(Duration::from_secs(30)).await;
    "too late"
}

async fn drip_handler() -> Body {
    let chunks = futures::stream::unfold(0u8, |n| async move {
        if n == DRIP_CHUNKS {
            return None;
        }
        tokio::time::sleep(DRIP_INTERVAL).await;
        Some((Ok::<_, std::io::Error>(Bytes::from(drip_chunk(n))), n + 1))
    });
    Body::from_stream(chunks)
}

/// The `n`th chunk `/drip` sends.
pub fn drip_chunk(n: u8) -> String {
    format!("chunk-{n};")
}

// ─────────────────────────────────────────────────────────────────────────────
// Gateway
// ─────────────────────────────────────────────────────────────────────────────

/// Config with verification off, forwarding to `targets`.
pub fn open_config(targets: Vec<String>) -> Config {
    let mut config = Config::default();
    config.gate.enabled = false;
    config.forwarding.targets = targets;
    config
}

pub fn router(config: Config) -> Router {
    Gateway::new(config).unwrap().router()
}

pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl TestResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap()
    }

    /// A header the echo upstream received.
    pub fn upstream_header(&self, name: &str) -> Option<String> {
        self.json()["headers"][name].as_str().map(str::to_string)
    }
}

pub async fn send(app: &Router, request: Request<Body>) -> TestResponse {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    TestResponse {
        status,
        headers,
        body,
    }
}

pub fn get(path: &str) -> Request<Body> {
    Request::builder().uri(path).body(Body::empty()).unwrap()
}
