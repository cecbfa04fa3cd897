//! Routing engine
//! Resolves `<subdomain>.<baseDomain>` to a local backend and forwards HTTP and
//! WebSocket traffic to it

use crate::error::{Error, Result};
use crate::events::{EventHub, LogCategory};
use crate::registry::{HostRegistry, ProxyConfig};
use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1 as client_http1;
use hyper::header::{HeaderValue, CONTENT_TYPE, HOST, LOCATION, UPGRADE};
use hyper::{Request, Response, StatusCode, Uri, Version};
use hyper_util::rt::TokioIo;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, warn};

pub type BoxBody = http_body_util::combinators::UnsyncBoxBody<Bytes, hyper::Error>;

/// Resolved backend for one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendTarget {
    pub subdomain: String,
    pub port: u16,
}

impl BackendTarget {
    pub fn url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    fn socket_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, self.port))
    }
}

/// Drop a trailing `:<port>` from a Host header value
fn strip_port(host: &str) -> &str {
    match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}

/// Map a Host header to the enabled backend registered for its subdomain
pub fn resolve_target(
    host_header: &str,
    config: &ProxyConfig,
    registry: &dyn HostRegistry,
) -> Result<BackendTarget> {
    let host = strip_port(host_header.trim()).to_ascii_lowercase();
    let suffix = format!(".{}", config.base_domain.to_ascii_lowercase());

    let subdomain = match host.strip_suffix(&suffix) {
        Some(sub) if !sub.is_empty() => sub,
        _ => return Err(Error::InvalidHost),
    };

    let entry = registry
        .find_enabled_by_subdomain(subdomain)?
        .ok_or_else(|| Error::UnknownHost(subdomain.to_string()))?;

    if entry.target_port == 0 {
        return Err(Error::InvalidPort(0));
    }

    Ok(BackendTarget {
        subdomain: entry.subdomain,
        port: entry.target_port,
    })
}

/// Resolve when the lifecycle signals shutdown (or the signal goes away)
pub(crate) async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Check if request is WebSocket upgrade
pub fn is_websocket_upgrade<T>(req: &Request<T>) -> bool {
    req.headers()
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

/// Routes TLS-listener traffic; reads the registry afresh for every request
#[derive(Clone)]
pub struct RoutingEngine {
    registry: Arc<dyn HostRegistry>,
    events: EventHub,
}

impl RoutingEngine {
    pub fn new(registry: Arc<dyn HostRegistry>, events: EventHub) -> Self {
        Self { registry, events }
    }

    fn resolve<T>(&self, req: &Request<T>) -> Result<BackendTarget> {
        let config = self.registry.config()?;
        resolve_target(host_of(req), &config, self.registry.as_ref())
    }

    /// Entry point for the TLS listener. An `Err` means the connection is
    /// dropped without a response (failed upgrade).
    pub async fn serve(
        &self,
        req: Request<Incoming>,
        remote_addr: SocketAddr,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Response<BoxBody>> {
        if is_websocket_upgrade(&req) {
            self.handle_upgrade(req, remote_addr, shutdown).await
        } else {
            Ok(self.handle_http(req, remote_addr).await)
        }
    }

    /// Forward a plain HTTP request; every failure becomes a response
    pub async fn handle_http(&self, req: Request<Incoming>, remote_addr: SocketAddr) -> Response<BoxBody> {
        let target = match self.resolve(&req) {
            Ok(target) => target,
            Err(e) => return self.routing_failure(host_of(&req), e),
        };

        let url = target.url();
        let path = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        self.events.log(
            LogCategory::Http,
            format!("{} {}", req.method(), path),
            Some(target.subdomain.as_str()),
            Some(url.as_str()),
        );

        match forward(req, &target, remote_addr).await {
            Ok(response) => response.map(|body| body.boxed_unsync()),
            Err(e) => {
                self.events.log(
                    LogCategory::Error,
                    e.to_string(),
                    Some(target.subdomain.as_str()),
                    Some(url.as_str()),
                );
                text_response(StatusCode::BAD_GATEWAY, &e.to_string())
            }
        }
    }

    /// Relay a WebSocket handshake and then the raw duplex stream
    pub async fn handle_upgrade(
        &self,
        mut req: Request<Incoming>,
        remote_addr: SocketAddr,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<Response<BoxBody>> {
        let target = match self.resolve(&req) {
            Ok(target) => target,
            Err(e) => {
                debug!("Dropping upgrade for host {:?}: {}", host_of(&req), e);
                return Err(e);
            }
        };
        let url = target.url();

        let client_upgrade = hyper::upgrade::on(&mut req);

        let mut response = match forward(req, &target, remote_addr).await {
            Ok(response) => response,
            Err(e) => {
                self.events.log(
                    LogCategory::Error,
                    format!("WebSocket proxy error: {}", e),
                    Some(target.subdomain.as_str()),
                    Some(url.as_str()),
                );
                return Err(e);
            }
        };

        if response.status() != StatusCode::SWITCHING_PROTOCOLS {
            debug!("Backend {} declined upgrade: {}", url, response.status());
            return Ok(response.map(|body| body.boxed_unsync()));
        }

        self.events.log(
            LogCategory::Ws,
            "WebSocket upgrade",
            Some(target.subdomain.as_str()),
            Some(url.as_str()),
        );

        let backend_upgrade = hyper::upgrade::on(&mut response);
        tokio::spawn(async move {
            match tokio::try_join!(client_upgrade, backend_upgrade) {
                Ok((client, backend)) => {
                    let mut client = TokioIo::new(client);
                    let mut backend = TokioIo::new(backend);
                    tokio::select! {
                        result = tokio::io::copy_bidirectional(&mut client, &mut backend) => {
                            if let Err(e) = result {
                                debug!("WebSocket tunnel closed: {}", e);
                            }
                        }
                        _ = wait_for_shutdown(&mut shutdown) => {
                            debug!("Closing WebSocket tunnel for shutdown");
                        }
                    }
                }
                Err(e) => warn!("Failed to upgrade connections: {}", e),
            }
        });

        Ok(response.map(|body| body.boxed_unsync()))
    }

    fn routing_failure(&self, host: &str, error: Error) -> Response<BoxBody> {
        let status = match &error {
            Error::InvalidHost => {
                self.events.error(format!("Invalid subdomain: {}", host));
                StatusCode::BAD_REQUEST
            }
            Error::UnknownHost(subdomain) => {
                self.events.error(format!("Host not registered: {}", subdomain));
                StatusCode::NOT_FOUND
            }
            other => {
                self.events.error(format!("Routing failed for {}: {}", host, other));
                StatusCode::BAD_GATEWAY
            }
        };
        text_response(status, &error.to_string())
    }
}

fn host_of<T>(req: &Request<T>) -> &str {
    req.headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("")
}

/// Send `req` to the backend over a fresh connection, streaming both bodies.
/// The Host header is left untouched.
async fn forward(
    req: Request<Incoming>,
    target: &BackendTarget,
    remote_addr: SocketAddr,
) -> Result<Response<Incoming>> {
    let stream = TcpStream::connect(target.socket_addr())
        .await
        .map_err(|e| Error::BackendUnreachable(e.to_string()))?;

    let (mut sender, conn) = client_http1::Builder::new()
        .preserve_header_case(true)
        .handshake(TokioIo::new(stream))
        .await
        .map_err(|e| Error::BackendUnreachable(e.to_string()))?;

    tokio::spawn(async move {
        if let Err(e) = conn.with_upgrades().await {
            debug!("Backend connection error: {}", e);
        }
    });

    let (mut parts, body) = req.into_parts();
    parts.uri = parts
        .uri
        .path_and_query()
        .cloned()
        .map(Uri::from)
        .unwrap_or_else(|| Uri::from_static("/"));
    parts.version = Version::HTTP_11;

    if let Some(host) = parts.headers.get(HOST).cloned() {
        parts.headers.insert("x-forwarded-host", host);
    }
    if let Ok(ip) = HeaderValue::from_str(&remote_addr.ip().to_string()) {
        parts.headers.append("x-forwarded-for", ip);
    }
    parts
        .headers
        .insert("x-forwarded-proto", HeaderValue::from_static("https"));

    sender
        .send_request(Request::from_parts(parts, body))
        .await
        .map_err(|e| Error::BackendUnreachable(e.to_string()))
}

/// 301 to the same host and path over HTTPS
pub fn https_redirect<T>(req: &Request<T>) -> Response<BoxBody> {
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let location = format!("https://{}{}", host_of(req), path);

    match HeaderValue::from_str(&location) {
        Ok(value) => {
            let mut response = Response::new(empty_body());
            *response.status_mut() = StatusCode::MOVED_PERMANENTLY;
            response.headers_mut().insert(LOCATION, value);
            response
        }
        Err(_) => text_response(StatusCode::BAD_REQUEST, "Invalid Host header"),
    }
}

/// Create text response
pub fn text_response(status: StatusCode, body: &str) -> Response<BoxBody> {
    let mut response = Response::new(full_body(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}

fn full_body(bytes: Bytes) -> BoxBody {
    Full::new(bytes).map_err(|never| match never {}).boxed_unsync()
}

fn empty_body() -> BoxBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed_unsync()
}
