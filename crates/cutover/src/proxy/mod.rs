// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Reverse proxy routing all traffic to one upstream at a time.
//!
//! The upstream is held as an `Arc<Route>` behind a lock and replaced
//! wholesale by [`Proxy::update`]; every request clones the current route
//! once, so it sees either the old or the new upstream in full. An `update`
//! takes effect for the next request without restarting anything.

pub mod server;
pub mod stats;

pub use server::serve;
pub use stats::{ConnState, RequestTotals, StatsRecorder};

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{self, HeaderMap, HeaderName, HeaderValue};
use hyper::{Request, Response, StatusCode, Uri, Version};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioIo};
use serde::Serialize;
use tracing::{debug, info, warn};

/// Body served by the proxy.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Served when the maintenance page cannot be fetched.
pub const FALLBACK_MAINTENANCE_PAGE: &str = "Page down, we're working on it.";

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

/// Current upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// `host:port` requests are forwarded to.
    pub address: String,
    /// Path of the upstream's maintenance page.
    pub maintenance_path: String,
}

/// Proxy statistics since the last upstream change.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProxyStats {
    /// Current upstream address.
    pub address: Option<String>,
    /// Requests served.
    pub requests: u64,
    /// Cumulative request time in seconds.
    pub total_time: f64,
    /// Whether maintenance mode is on.
    pub maintenance_mode: bool,
    /// Live connections per state.
    pub states: BTreeMap<String, usize>,
}

/// Identity of the client connection a request arrived on.
#[derive(Debug, Clone, Copy)]
pub struct ConnMeta {
    /// Connection id assigned by the accept loop.
    pub id: u64,
    /// Remote address.
    pub peer: SocketAddr,
}

struct ProxyInner {
    route: RwLock<Option<Arc<Route>>>,
    update_lock: tokio::sync::Mutex<()>,
    maintenance_mode: AtomicBool,
    maintenance_cache: RwLock<Option<Bytes>>,
    stats: StatsRecorder,
    client: Client<HttpConnector, Incoming>,
    http: reqwest::Client,
}

/// Reverse proxy handle. Cheap to clone.
#[derive(Clone)]
pub struct Proxy {
    inner: Arc<ProxyInner>,
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("route", &self.route())
            .field("maintenance_mode", &self.maintenance_mode())
            .finish_non_exhaustive()
    }
}

impl Proxy {
    /// Create a proxy without an upstream. Must be called inside a Tokio runtime.
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            inner: Arc::new(ProxyInner {
                route: RwLock::new(None),
                update_lock: tokio::sync::Mutex::new(()),
                maintenance_mode: AtomicBool::new(false),
                maintenance_cache: RwLock::new(None),
                stats: StatsRecorder::spawn(),
                client: Client::builder(TokioExecutor::new()).build_http(),
                http,
            }),
        }
    }

    /// Current upstream, if any.
    pub fn route(&self) -> Option<Arc<Route>> {
        self.inner
            .route
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Current upstream address, if any.
    pub fn address(&self) -> Option<String> {
        self.route().map(|r| r.address.clone())
    }

    /// Whether maintenance mode is on.
    pub fn maintenance_mode(&self) -> bool {
        self.inner.maintenance_mode.load(Ordering::SeqCst)
    }

    /// Stats recorder shared with the accept loop.
    pub fn recorder(&self) -> &StatsRecorder {
        &self.inner.stats
    }

    /// Point the proxy at a new upstream.
    ///
    /// The new upstream's maintenance page is fetched first; the route and
    /// the page are then installed together and request totals are reset.
    pub async fn update(&self, address: impl Into<String>, maintenance_path: impl Into<String>) {
        let _guard = self.inner.update_lock.lock().await;

        let route = Arc::new(Route {
            address: address.into(),
            maintenance_path: maintenance_path.into(),
        });
        let page = self.fetch_maintenance_page(&route).await;

        let previous = {
            let mut current = self
                .inner
                .route
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            let mut cache = self
                .inner
                .maintenance_cache
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            *cache = Some(page);
            current.replace(route.clone())
        };
        self.inner.stats.reset();

        info!(
            address = %route.address,
            previous = previous.as_ref().map(|r| r.address.as_str()).unwrap_or("none"),
            "Switched upstream"
        );
    }

    /// Serve the maintenance page to every request.
    pub async fn maintenance_up(&self) {
        let cached = self
            .inner
            .maintenance_cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some();
        if !cached {
            let page = match self.route() {
                Some(route) => self.fetch_maintenance_page(&route).await,
                None => Bytes::from_static(FALLBACK_MAINTENANCE_PAGE.as_bytes()),
            };
            *self
                .inner
                .maintenance_cache
                .write()
                .unwrap_or_else(PoisonError::into_inner) = Some(page);
        }
        if !self.inner.maintenance_mode.swap(true, Ordering::SeqCst) {
            info!("Maintenance mode on");
        }
    }

    /// Resume forwarding.
    pub fn maintenance_down(&self) {
        if self.inner.maintenance_mode.swap(false, Ordering::SeqCst) {
            info!("Maintenance mode off");
        }
    }

    /// Current statistics.
    pub async fn stats(&self) -> ProxyStats {
        let totals = self.inner.stats.request_totals().await;
        let states = self.inner.stats.conn_states().await;
        ProxyStats {
            address: self.address(),
            requests: totals.requests,
            total_time: totals.total_time.as_secs_f64(),
            maintenance_mode: self.maintenance_mode(),
            states,
        }
    }

    async fn fetch_maintenance_page(&self, route: &Route) -> Bytes {
        let url = format!(
            "http://{}/{}",
            route.address,
            route.maintenance_path.trim_start_matches('/')
        );
        let result = async {
            let response = self.inner.http.get(&url).send().await?;
            response.bytes().await
        }
        .await;

        match result {
            Ok(page) => {
                debug!(url = %url, bytes = page.len(), "Cached maintenance page");
                page
            }
            Err(e) => {
                warn!(url = %url, error = %e, "Failed to cache maintenance page");
                Bytes::from_static(FALLBACK_MAINTENANCE_PAGE.as_bytes())
            }
        }
    }

    fn maintenance_page(&self) -> Bytes {
        self.inner
            .maintenance_cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or_else(|| Bytes::from_static(FALLBACK_MAINTENANCE_PAGE.as_bytes()))
    }

    /// Handle one request from a client connection.
    pub async fn handle(
        &self,
        req: Request<Incoming>,
        conn: ConnMeta,
    ) -> Result<Response<ProxyBody>, Infallible> {
        let started = Instant::now();
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        let Some(route) = self.route() else {
            debug!(method = %method, path = %path, "No upstream configured");
            return Ok(text_response(StatusCode::NOT_FOUND, "404 page not found\n"));
        };

        let response = if self.maintenance_mode() {
            let mut response =
                full_response(StatusCode::INTERNAL_SERVER_ERROR, self.maintenance_page());
            response
                .headers_mut()
                .insert(header::CONTENT_TYPE, HeaderValue::from_static("text/html"));
            response
        } else {
            self.forward(req, &route, conn).await
        };

        let elapsed = started.elapsed();
        self.inner.stats.record_request(elapsed);
        info!(
            method = %method,
            url = %path,
            status = response.status().as_u16(),
            total_time = %format_total_time(elapsed.as_secs_f64()),
            "request"
        );
        Ok(response)
    }

    async fn forward(
        &self,
        mut req: Request<Incoming>,
        route: &Route,
        conn: ConnMeta,
    ) -> Response<ProxyBody> {
        let path_and_query = req
            .uri()
            .path_and_query()
            .map_or("/", |pq| pq.as_str());
        let uri: Uri = match format!("http://{}{}", route.address, path_and_query).parse() {
            Ok(uri) => uri,
            Err(e) => {
                warn!(address = %route.address, error = %e, "Invalid upstream URI");
                return text_response(StatusCode::BAD_GATEWAY, "502 bad gateway\n");
            }
        };

        let upgrade = upgrade_protocol(req.headers());
        let client_upgrade = upgrade.is_some().then(|| hyper::upgrade::on(&mut req));

        *req.uri_mut() = uri;
        *req.version_mut() = Version::HTTP_11;
        strip_hop_by_hop(req.headers_mut());
        if let Some(protocol) = upgrade {
            req.headers_mut()
                .insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
            req.headers_mut().insert(header::UPGRADE, protocol);
        }
        append_forwarded_for(req.headers_mut(), conn.peer);

        let mut response = match self.inner.client.request(req).await {
            Ok(response) => response,
            Err(e) => {
                warn!(address = %route.address, error = %e, "Upstream request failed");
                return text_response(StatusCode::BAD_GATEWAY, "502 bad gateway\n");
            }
        };

        if response.status() == StatusCode::SWITCHING_PROTOCOLS {
            if let Some(client_upgrade) = client_upgrade {
                let upstream_upgrade = hyper::upgrade::on(&mut response);
                let stats = self.inner.stats.clone();
                tokio::spawn(async move {
                    let (client_io, upstream_io) =
                        match tokio::try_join!(client_upgrade, upstream_upgrade) {
                            Ok(pair) => pair,
                            Err(e) => {
                                debug!(conn_id = conn.id, error = %e, "Upgrade failed");
                                return;
                            }
                        };
                    stats.conn_state(conn.id, ConnState::Hijacked);
                    let mut client_io = TokioIo::new(client_io);
                    let mut upstream_io = TokioIo::new(upstream_io);
                    if let Err(e) =
                        tokio::io::copy_bidirectional(&mut client_io, &mut upstream_io).await
                    {
                        debug!(conn_id = conn.id, error = %e, "Upgraded connection ended");
                    }
                });
            }
            return response.map(|body| body.boxed());
        }

        strip_hop_by_hop(response.headers_mut());
        response.map(|body| body.boxed())
    }
}

impl Default for Proxy {
    fn default() -> Self {
        Self::new()
    }
}

/// Human readable request duration in seconds: sub-millisecond values in `ms`, the rest in `s`.
pub fn format_total_time(secs: f64) -> String {
    if secs < 1e-3 {
        format!("{:.6}ms", secs * 1000.0)
    } else {
        format!("{:.6}s", secs)
    }
}

fn upgrade_protocol(headers: &HeaderMap) -> Option<HeaderValue> {
    let wants_upgrade = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    if wants_upgrade {
        headers.get(header::UPGRADE).cloned()
    } else {
        None
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    // Headers named in Connection are hop-by-hop as well.
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();
    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, peer: SocketAddr) {
    let ip = peer.ip().to_string();
    let value = match headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        Some(prior) => format!("{}, {}", prior, ip),
        None => ip,
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert("x-forwarded-for", value);
    }
}

fn full_response(status: StatusCode, body: Bytes) -> Response<ProxyBody> {
    let mut response = Response::new(Full::new(body).map_err(|never| match never {}).boxed());
    *response.status_mut() = status;
    response
}

fn text_response(status: StatusCode, body: &'static str) -> Response<ProxyBody> {
    let mut response = full_response(status, Bytes::from_static(body.as_bytes()));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_total_time() {
        let cases = [
            (1.0, "1.000000s"),
            (0.1, "0.100000s"),
            (0.01, "0.010000s"),
            (0.001, "0.001000s"),
            (0.0001, "0.100000ms"),
            (0.0002, "0.200000ms"),
            (0.00099, "0.990000ms"),
            (0.00001, "0.010000ms"),
        ];
        for (secs, expected) in cases {
            assert_eq!(
                format_total_time(secs),
                expected,
                "{} seconds",
                secs
            );
        }
    }

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, x-trace"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-trace", HeaderValue::from_static("1"));
        headers.insert(header::HOST, HeaderValue::from_static("app.example.com"));
        headers.insert(header::ACCEPT, HeaderValue::from_static("*/*"));

        strip_hop_by_hop(&mut headers);
        assert_eq!(headers.len(), 2);
        assert!(headers.contains_key(header::HOST));
        assert!(headers.contains_key(header::ACCEPT));
    }

    #[test]
    fn test_upgrade_protocol() {
        let mut headers = HeaderMap::new();
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        assert!(upgrade_protocol(&headers).is_none());

        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, Upgrade"));
        assert_eq!(upgrade_protocol(&headers).unwrap(), "websocket");
    }

    #[test]
    fn test_append_forwarded_for() {
        let peer: SocketAddr = "10.0.0.7:5555".parse().unwrap();
        let mut headers = HeaderMap::new();
        append_forwarded_for(&mut headers, peer);
        assert_eq!(headers["x-forwarded-for"], "10.0.0.7");

        append_forwarded_for(&mut headers, "10.0.0.8:1".parse().unwrap());
        assert_eq!(headers["x-forwarded-for"], "10.0.0.7, 10.0.0.8");
    }
}
