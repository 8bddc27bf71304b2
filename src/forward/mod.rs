//! Forwarding dispatcher
//!
//! Sends accepted requests to an upstream over a pooled keep-alive client and
//! streams the upstream response back.
//!
//! The upstream call runs inside the request's own future. When the client
//! disconnects, axum drops that future, which drops the in-flight reqwest call
//! and closes its connection.
//!
//! At most `max_connections` upstream exchanges are in flight. A slot is held
//! from send until the relayed response body has been fully streamed or
//! dropped.

pub mod selector;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{ConnectInfo, Request},
    http::{
        HeaderMap, HeaderName, HeaderValue, Uri,
        header::{CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, HOST, ORIGIN},
        request::Parts,
    },
    response::Response,
};
use futures::StreamExt;
use http_body_util::LengthLimitError;
use reqwest::Client;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};
use url::Url;

pub use selector::TargetSelector;

use crate::body::{self, BufferedBody};
use crate::config::ForwardingConfig;
use crate::{Error, Result};

/// Headers that describe a single connection and must not be forwarded.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");

/// Reverse-proxy dispatcher: one pooled client, one target selector.
pub struct Dispatcher {
    client: Client,
    selector: TargetSelector,
    slots: Arc<Semaphore>,
    slot_timeout: Duration,
    change_origin: bool,
    xfwd: bool,
    parse_bodies: bool,
    max_body_bytes: usize,
}

impl Dispatcher {
    /// Build the dispatcher and its connection pool.
    pub fn new(config: &ForwardingConfig) -> Result<Self> {
        let selector = TargetSelector::new(config.target_urls()?)?;

        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .read_timeout(config.read_timeout)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .pool_idle_timeout(config.pool_idle_timeout)
            .tcp_keepalive(config.tcp_keepalive)
            .tcp_nodelay(true)
            // Redirects belong to the client, not the proxy.
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| Error::Config(format!("Failed to build upstream client: {e}")))?;

        Ok(Self {
            client,
            selector,
            slots: Arc::new(Semaphore::new(config.max_connections)),
            slot_timeout: config.connect_timeout,
            change_origin: config.change_origin,
            xfwd: config.xfwd,
            parse_bodies: config.parse_bodies,
            max_body_bytes: config.max_body_bytes,
        })
    }

    /// The target selector in use
    pub fn selector(&self) -> &TargetSelector {
        &self.selector
    }

    /// Forward `request` to the next target and relay the response.
    pub async fn forward(&self, request: Request) -> Result<Response> {
        let (parts, body) = request.into_parts();
        let target = self.selector.next();
        let url = upstream_url(target, &parts.uri);

        let declared = parts
            .headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<usize>().ok());
        if declared.is_some_and(|len| len > self.max_body_bytes) {
            return Err(Error::BodyTooLarge {
                limit: self.max_body_bytes,
            });
        }

        let bytes = axum::body::to_bytes(body, self.max_body_bytes)
            .await
            .map_err(|e| {
                if exceeds_limit(&e) {
                    Error::BodyTooLarge {
                        limit: self.max_body_bytes,
                    }
                } else {
                    debug!(error = %e, "Failed to read request body");
                    Error::BodyRead(e.to_string())
                }
            })?;

        let buffered = if self.parse_bodies {
            let content_type = parts.headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok());
            body::parse_body(content_type, bytes)
        } else if bytes.is_empty() {
            BufferedBody::Empty
        } else {
            BufferedBody::Raw(bytes)
        };

        let mut headers = self.outbound_headers(&parts, target);
        let outbound = body::prepare_outbound(&mut headers, buffered)?;

        let slot = self.acquire_slot().await?;

        debug!(method = %parts.method, upstream = %url, "Forwarding request");

        let upstream = self
            .client
            .request(parts.method.clone(), url.clone())
            .headers(headers)
            .body(outbound)
            .send()
            .await
            .map_err(|e| {
                warn!(upstream = %url, error = %e, "Upstream request failed");
                Error::from_upstream(&e)
            })?;

        Ok(relay_response(upstream, slot))
    }

    /// Free upstream slots right now
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    async fn acquire_slot(&self) -> Result<OwnedSemaphorePermit> {
        let acquire = Arc::clone(&self.slots).acquire_owned();
        match tokio::time::timeout(self.slot_timeout, acquire).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(Error::Internal("upstream slots closed".to_string())),
            Err(_) => {
                warn!(timeout = ?self.slot_timeout, "Upstream connection limit reached");
                Err(Error::UpstreamUnreachable(
                    "Concurrency limit reached".to_string(),
                ))
            }
        }
    }

    fn outbound_headers(&self, parts: &Parts, target: &Url) -> HeaderMap {
        let mut headers = strip_hop_by_hop(&parts.headers);

        if self.change_origin {
            // Let the client derive Host from the target URL.
            headers.remove(HOST);
            if headers.contains_key(ORIGIN) {
                if let Ok(origin) = HeaderValue::from_str(&target.origin().ascii_serialization())
                {
                    headers.insert(ORIGIN, origin);
                }
            }
        }

        if self.xfwd {
            if let Some(ConnectInfo(peer)) = parts.extensions.get::<ConnectInfo<SocketAddr>>() {
                let ip = peer.ip().to_string();
                let forwarded_for = match headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok())
                {
                    Some(existing) => format!("{existing}, {ip}"),
                    None => ip,
                };
                if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
                    headers.insert(X_FORWARDED_FOR, value);
                }
            }
            if let Some(host) = parts.headers.get(HOST) {
                headers
                    .entry(X_FORWARDED_HOST)
                    .or_insert_with(|| host.clone());
            }
            headers
                .entry(X_FORWARDED_PROTO)
                .or_insert(HeaderValue::from_static("http"));
        }

        headers
    }
}

/// Join the target's base path with the inbound path and query.
#[must_use]
pub fn upstream_url(target: &Url, uri: &Uri) -> Url {
    let mut url = target.clone();
    let base = target.path().trim_end_matches('/');
    url.set_path(&format!("{base}{}", uri.path()));
    url.set_query(uri.query());
    url
}

/// Copy `headers` without hop-by-hop entries, including any named in `Connection`.
#[must_use]
pub fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let listed: Vec<String> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();

    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let name_str = name.as_str();
        if HOP_BY_HOP.contains(&name_str) || listed.iter().any(|l| l == name_str) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

fn relay_response(upstream: reqwest::Response, slot: OwnedSemaphorePermit) -> Response {
    let status = upstream.status();
    let headers = strip_hop_by_hop(upstream.headers());

    // The stream owns the slot, so it is released with the body.
    let stream = upstream.bytes_stream().map(move |chunk| {
        let _held = &slot;
        chunk
    });
    let mut response = Response::new(Body::from_stream(stream));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

/// Whether a body read failed on the size limit rather than on I/O.
fn exceeds_limit(err: &axum::Error) -> bool {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = current {
        if e.is::<LengthLimitError>() {
            return true;
        }
        current = e.source();
    }
    false
}
