//! Integration tests for devproxy
//!
//! Tests the running proxy end to end:
//! - Subdomain routing over TLS
//! - Error responses (400/404/502)
//! - HTTP -> HTTPS redirect
//! - WebSocket relaying, declined and failed upgrades
//! - Streaming of chunked responses
//! - Lifecycle start/stop/restart against real sockets

use devproxy::{
    CertificateProvisioner, ConfigUpdate, Error, EventHub, HostRegistry, HostUpdate, LogCategory,
    LogEntry, NewHost, ProxyLifecycle, ProxyState, SqliteRegistry,
};
use futures_util::{SinkExt, StreamExt};
use rcgen::generate_simple_self_signed;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::{tempdir, TempDir};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, oneshot};
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use wiremock::matchers::{body_string, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const BASE_DOMAIN: &str = "dev.test";

// Counter for unique port allocation
static PORT_COUNTER: AtomicU16 = AtomicU16::new(29000);

fn get_unique_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

struct TestProxy {
    _dir: TempDir,
    registry: Arc<SqliteRegistry>,
    lifecycle: ProxyLifecycle,
    cert_pem: String,
    http_port: u16,
    https_port: u16,
}

impl TestProxy {
    fn add_host(&self, subdomain: &str, port: u16, enabled: bool) -> String {
        self.registry
            .add(NewHost {
                subdomain: subdomain.to_string(),
                target_port: port,
                enabled,
            })
            .unwrap()
            .id
    }

    fn https_addr(&self) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], self.https_port))
    }

    fn url(&self, host: &str, path: &str) -> String {
        format!("https://{}:{}{}", host, self.https_port, path)
    }

    /// Client trusting the test CA, with every given host resolved to the proxy
    fn client(&self, hosts: &[&str]) -> reqwest::Client {
        let mut builder = reqwest::Client::builder()
            .add_root_certificate(reqwest::Certificate::from_pem(self.cert_pem.as_bytes()).unwrap())
            .redirect(reqwest::redirect::Policy::none());
        for host in hosts {
            builder = builder.resolve(host, self.https_addr());
        }
        builder.build().unwrap()
    }

    async fn tls_connect(&self, host: &str) -> tokio_rustls::client::TlsStream<TcpStream> {
        let der = rustls_pemfile::certs(&mut self.cert_pem.as_bytes())
            .next()
            .unwrap()
            .unwrap();
        let mut roots = rustls::RootCertStore::empty();
        roots.add(der).unwrap();

        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(config));
        let server_name = rustls::pki_types::ServerName::try_from(host.to_string()).unwrap();

        let tcp = TcpStream::connect(self.https_addr()).await.unwrap();
        connector.connect(server_name, tcp).await.unwrap()
    }
}

/// Write a self-signed `*.<domain>` bundle where mkcert would put it
fn write_wildcard_cert(certs_dir: &Path, domain: &str) -> String {
    std::fs::create_dir_all(certs_dir).unwrap();
    let cert = generate_simple_self_signed(vec![format!("*.{}", domain)]).unwrap();
    let cert_pem = cert.serialize_pem().unwrap();

    std::fs::write(certs_dir.join(format!("_wildcard.{}.pem", domain)), &cert_pem).unwrap();
    std::fs::write(
        certs_dir.join(format!("_wildcard.{}-key.pem", domain)),
        cert.serialize_private_key_pem(),
    )
    .unwrap();

    cert_pem
}

/// Create test proxy with a certificate in place (not started)
fn setup_proxy() -> TestProxy {
    let dir = tempdir().unwrap();
    let http_port = get_unique_port();
    let https_port = get_unique_port();

    let registry = Arc::new(SqliteRegistry::new(dir.path().join("test.db")).unwrap());
    registry
        .set_config(ConfigUpdate {
            base_domain: Some(BASE_DOMAIN.to_string()),
            http_port: Some(http_port),
            https_port: Some(https_port),
            auto_launch: None,
        })
        .unwrap();

    let certs_dir = dir.path().join("certs");
    let cert_pem = write_wildcard_cert(&certs_dir, BASE_DOMAIN);
    let certificates = Arc::new(CertificateProvisioner::with_system_executor(
        &certs_dir, "mkcert",
    ));

    let lifecycle = ProxyLifecycle::new(registry.clone(), certificates, EventHub::new());

    TestProxy {
        _dir: dir,
        registry,
        lifecycle,
        cert_pem,
        http_port,
        https_port,
    }
}

async fn started_proxy() -> TestProxy {
    let proxy = setup_proxy();
    proxy.lifecycle.start().await.unwrap();
    proxy
}

async fn next_log(rx: &mut broadcast::Receiver<LogEntry>, category: LogCategory) -> LogEntry {
    timeout(Duration::from_secs(2), async {
        loop {
            let entry = rx.recv().await.unwrap();
            if entry.category == category {
                return entry;
            }
        }
    })
    .await
    .expect("log entry")
}

/// WebSocket backend echoing every data frame; returns its port
async fn run_echo_backend() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::spawn(async move {
                let mut ws = match tokio_tungstenite::accept_async(stream).await {
                    Ok(ws) => ws,
                    Err(_) => return,
                };
                while let Some(Ok(msg)) = ws.next().await {
                    if msg.is_text() || msg.is_binary() {
                        if ws.send(msg).await.is_err() {
                            break;
                        }
                    }
                }
            });
        }
    });

    port
}

/// Read a request head off a raw backend socket
async fn read_request_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut buf).await.unwrap();
        assert!(n > 0, "connection closed before the request head");
        head.extend_from_slice(&buf[..n]);
    }
    String::from_utf8_lossy(&head).into_owned()
}

#[tokio::test]
async fn test_start_is_idempotent() {
    let proxy = setup_proxy();
    let mut logs = proxy.lifecycle.events().subscribe_logs();

    proxy.lifecycle.start().await.unwrap();
    assert_eq!(proxy.lifecycle.status().state, ProxyState::Running);

    let started = next_log(&mut logs, LogCategory::Info).await;
    assert_eq!(
        started.message,
        format!("Proxy started. HTTP:{} HTTPS:{}", proxy.http_port, proxy.https_port)
    );

    proxy.lifecycle.start().await.unwrap();
    assert!(logs.try_recv().is_err());

    let (http_addr, https_addr) = proxy.lifecycle.bound_addrs().unwrap();
    assert_eq!(http_addr.port(), proxy.http_port);
    assert_eq!(https_addr.port(), proxy.https_port);

    proxy.lifecycle.stop().await;
}

#[tokio::test]
async fn test_stop_releases_ports() {
    let proxy = started_proxy().await;
    assert!(!devproxy::ports::probe(proxy.https_port).await);

    let mut logs = proxy.lifecycle.events().subscribe_logs();
    proxy.lifecycle.stop().await;

    assert_eq!(proxy.lifecycle.status().state, ProxyState::Stopped);
    assert_eq!(next_log(&mut logs, LogCategory::Info).await.message, "Proxy stopped");
    assert!(devproxy::ports::probe(proxy.http_port).await);
    assert!(devproxy::ports::probe(proxy.https_port).await);
}

#[tokio::test]
async fn test_proxy_end_to_end() {
    let backend = MockServer::start().await;
    let backend_port = backend.address().port();

    Mock::given(method("GET"))
        .and(path("/x"))
        .respond_with(ResponseTemplate::new(200).set_body_string("BACKEND_RESPONSE"))
        .mount(&backend)
        .await;

    let proxy = started_proxy().await;
    proxy.add_host("app", backend_port, true);
    let mut logs = proxy.lifecycle.events().subscribe_logs();

    let response = proxy
        .client(&["app.dev.test"])
        .get(proxy.url("app.dev.test", "/x"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.text().await.unwrap(), "BACKEND_RESPONSE");

    let entry = next_log(&mut logs, LogCategory::Http).await;
    assert_eq!(entry.message, "GET /x");
    assert_eq!(entry.subdomain.as_deref(), Some("app"));
    assert_eq!(
        entry.target,
        Some(format!("http://127.0.0.1:{}", backend_port))
    );

    proxy.lifecycle.stop().await;
}

#[tokio::test]
async fn test_host_header_forwarded_unchanged() {
    let backend = MockServer::start().await;
    let proxy = started_proxy().await;
    let original_host = format!("app.dev.test:{}", proxy.https_port);

    Mock::given(method("GET"))
        .and(header("host", original_host.as_str()))
        .and(header("x-forwarded-proto", "https"))
        .respond_with(ResponseTemplate::new(200).set_body_string("HOST_OK"))
        .mount(&backend)
        .await;

    proxy.add_host("app", backend.address().port(), true);

    let response = proxy
        .client(&["app.dev.test"])
        .get(proxy.url("app.dev.test", "/"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.text().await.unwrap(), "HOST_OK");
    proxy.lifecycle.stop().await;
}

#[tokio::test]
async fn test_proxy_post_and_query() {
    let backend = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/data"))
        .and(body_string("test body content"))
        .respond_with(ResponseTemplate::new(201))
        .mount(&backend)
        .await;

    let proxy = started_proxy().await;
    proxy.add_host("app", backend.address().port(), true);

    let response = proxy
        .client(&["app.dev.test"])
        .post(proxy.url("app.dev.test", "/api/data?foo=bar"))
        .body("test body content")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 201);

    let received = backend.received_requests().await.unwrap();
    assert_eq!(received[0].url.query(), Some("foo=bar"));
    proxy.lifecycle.stop().await;
}

#[tokio::test]
async fn test_unknown_host_404() {
    let proxy = started_proxy().await;
    let mut logs = proxy.lifecycle.events().subscribe_logs();

    let response = proxy
        .client(&["ghost.dev.test"])
        .get(proxy.url("ghost.dev.test", "/"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 404);
    assert_eq!(response.text().await.unwrap(), "Host not found: ghost");
    assert_eq!(
        next_log(&mut logs, LogCategory::Error).await.message,
        "Host not registered: ghost"
    );
    proxy.lifecycle.stop().await;
}

#[tokio::test]
async fn test_invalid_host_400() {
    let proxy = started_proxy().await;

    // The wildcard certificate does not cover these names
    let client = reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .resolve("dev.test", proxy.https_addr())
        .resolve("app.other.test", proxy.https_addr())
        .build()
        .unwrap();

    for host in ["dev.test", "app.other.test"] {
        let response = client.get(proxy.url(host, "/")).send().await.unwrap();
        assert_eq!(response.status().as_u16(), 400);
        assert_eq!(response.text().await.unwrap(), "Invalid subdomain");
    }
    proxy.lifecycle.stop().await;
}

#[tokio::test]
async fn test_registry_changes_apply_without_restart() {
    let backend = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("LIVE"))
        .mount(&backend)
        .await;

    let proxy = started_proxy().await;
    let id = proxy.add_host("app", backend.address().port(), false);
    let client = proxy.client(&["app.dev.test"]);

    let response = client.get(proxy.url("app.dev.test", "/")).send().await.unwrap();
    assert_eq!(response.status().as_u16(), 404);

    proxy
        .registry
        .update(
            &id,
            HostUpdate {
                enabled: Some(true),
                ..Default::default()
            },
        )
        .unwrap();

    let response = client.get(proxy.url("app.dev.test", "/")).send().await.unwrap();
    assert_eq!(response.text().await.unwrap(), "LIVE");
    proxy.lifecycle.stop().await;
}

#[tokio::test]
async fn test_backend_unreachable_502() {
    let proxy = started_proxy().await;
    // No server running on this port
    proxy.add_host("app", get_unique_port(), true);
    let mut logs = proxy.lifecycle.events().subscribe_logs();

    let response = proxy
        .client(&["app.dev.test"])
        .get(proxy.url("app.dev.test", "/"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 502);
    assert!(response.text().await.unwrap().starts_with("Proxy Error:"));
    assert_eq!(next_log(&mut logs, LogCategory::Error).await.subdomain.as_deref(), Some("app"));

    // the listener survives the failure
    assert_eq!(proxy.lifecycle.status().state, ProxyState::Running);
    proxy.lifecycle.stop().await;
}

#[tokio::test]
async fn test_http_listener_redirects() {
    let proxy = started_proxy().await;

    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap();
    let response = client
        .get(format!("http://127.0.0.1:{}/path?q=1", proxy.http_port))
        .header("Host", "app.dev.test")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 301);
    assert_eq!(
        response.headers().get("location").unwrap(),
        "https://app.dev.test/path?q=1"
    );
    proxy.lifecycle.stop().await;
}

#[tokio::test]
async fn test_websocket_echo() {
    let backend_port = run_echo_backend().await;
    let proxy = started_proxy().await;
    proxy.add_host("app", backend_port, true);
    let mut logs = proxy.lifecycle.events().subscribe_logs();

    let tls = proxy.tls_connect("app.dev.test").await;
    let (mut ws, response) =
        tokio_tungstenite::client_async(proxy.url("app.dev.test", "/socket").replace("https", "wss"), tls)
            .await
            .unwrap();
    assert_eq!(response.status().as_u16(), 101);

    ws.send(Message::Text("ping".to_string())).await.unwrap();
    let echoed = timeout(Duration::from_secs(2), ws.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(echoed, Message::Text("ping".to_string()));

    let entry = next_log(&mut logs, LogCategory::Ws).await;
    assert_eq!(entry.subdomain.as_deref(), Some("app"));
    assert_eq!(entry.target, Some(format!("http://127.0.0.1:{}", backend_port)));

    proxy.lifecycle.stop().await;
}

#[tokio::test]
async fn test_websocket_unknown_host_is_dropped() {
    let proxy = started_proxy().await;
    let mut logs = proxy.lifecycle.events().subscribe_logs();

    let tls = proxy.tls_connect("ghost.dev.test").await;
    let result = tokio_tungstenite::client_async(
        proxy.url("ghost.dev.test", "/socket").replace("https", "wss"),
        tls,
    )
    .await;
    assert!(result.is_err());

    // no ws entry for a failed upgrade
    while let Ok(entry) = logs.try_recv() {
        assert_ne!(entry.category, LogCategory::Ws);
    }
    proxy.lifecycle.stop().await;
}

#[tokio::test]
async fn test_websocket_declined_by_backend() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        read_request_head(&mut stream).await;
        stream
            .write_all(b"HTTP/1.1 400 Bad Request\r\nContent-Length: 4\r\nConnection: close\r\n\r\nnope")
            .await
            .unwrap();
    });

    let proxy = started_proxy().await;
    proxy.add_host("app", backend_port, true);
    let mut logs = proxy.lifecycle.events().subscribe_logs();

    let tls = proxy.tls_connect("app.dev.test").await;
    let result =
        tokio_tungstenite::client_async(proxy.url("app.dev.test", "/socket").replace("https", "wss"), tls)
            .await;

    match result {
        Err(WsError::Http(response)) => assert_eq!(response.status().as_u16(), 400),
        other => panic!("expected the backend's 400, got {:?}", other.map(|_| ())),
    }

    while let Ok(entry) = logs.try_recv() {
        assert_ne!(entry.category, LogCategory::Ws);
    }
    proxy.lifecycle.stop().await;
}

#[tokio::test]
async fn test_websocket_backend_unreachable() {
    let proxy = started_proxy().await;
    // No server running on this port
    proxy.add_host("app", get_unique_port(), true);
    let mut logs = proxy.lifecycle.events().subscribe_logs();

    let tls = proxy.tls_connect("app.dev.test").await;
    let result =
        tokio_tungstenite::client_async(proxy.url("app.dev.test", "/socket").replace("https", "wss"), tls)
            .await;
    assert!(result.is_err());

    let entry = next_log(&mut logs, LogCategory::Error).await;
    assert!(entry.message.starts_with("WebSocket proxy error"), "{}", entry.message);
    assert_eq!(entry.subdomain.as_deref(), Some("app"));
    assert_eq!(proxy.lifecycle.status().state, ProxyState::Running);

    proxy.lifecycle.stop().await;
}

#[tokio::test]
async fn test_chunked_response_is_streamed() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_port = listener.local_addr().unwrap().port();
    let (finish_tx, finish_rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        read_request_head(&mut stream).await;
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n")
            .await
            .unwrap();
        // the response stays open until the client has seen the first chunk
        let _ = finish_rx.await;
        stream.write_all(b"6\r\n world\r\n0\r\n\r\n").await.unwrap();
    });

    let proxy = started_proxy().await;
    proxy.add_host("app", backend_port, true);

    let mut response = proxy
        .client(&["app.dev.test"])
        .get(proxy.url("app.dev.test", "/stream"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert!(response.content_length().is_none());

    let first = timeout(Duration::from_secs(2), response.chunk())
        .await
        .expect("first chunk while the backend is still writing")
        .unwrap()
        .unwrap();
    assert_eq!(&first[..], b"hello");

    finish_tx.send(()).unwrap();
    let mut rest = Vec::new();
    while let Some(chunk) = response.chunk().await.unwrap() {
        rest.extend_from_slice(&chunk);
    }
    assert_eq!(rest, b" world");

    proxy.lifecycle.stop().await;
}

#[tokio::test]
async fn test_stop_closes_open_tunnels() {
    let backend_port = run_echo_backend().await;
    let proxy = started_proxy().await;
    proxy.add_host("app", backend_port, true);

    let tls = proxy.tls_connect("app.dev.test").await;
    let (mut ws, _) =
        tokio_tungstenite::client_async(proxy.url("app.dev.test", "/").replace("https", "wss"), tls)
            .await
            .unwrap();

    let started = Instant::now();
    proxy.lifecycle.stop().await;
    assert!(started.elapsed() < Duration::from_secs(2));

    let next = timeout(Duration::from_secs(2), ws.next()).await.unwrap();
    assert!(matches!(next, None | Some(Err(_))));
}

#[tokio::test]
async fn test_bind_failure_sets_error() {
    let proxy = setup_proxy();
    let _occupied = std::net::TcpListener::bind(("127.0.0.1", proxy.https_port)).unwrap();

    let err = proxy.lifecycle.start().await.unwrap_err();
    assert!(matches!(err, Error::BindFailed { port, .. } if port == proxy.https_port));

    let status = proxy.lifecycle.status();
    assert_eq!(status.state, ProxyState::Error);
    assert!(status.error_message.is_some());
    assert!(proxy.lifecycle.bound_addrs().is_none());

    // the plain listener bound first must have been released
    assert!(devproxy::ports::probe(proxy.http_port).await);
}

#[tokio::test]
async fn test_restart_picks_up_new_ports() {
    let proxy = started_proxy().await;
    let new_https_port = get_unique_port();

    proxy
        .registry
        .set_config(ConfigUpdate {
            https_port: Some(new_https_port),
            ..Default::default()
        })
        .unwrap();

    proxy.lifecycle.restart().await.unwrap();

    assert_eq!(proxy.lifecycle.status().state, ProxyState::Running);
    let (_, https_addr) = proxy.lifecycle.bound_addrs().unwrap();
    assert_eq!(https_addr.port(), new_https_port);
    assert!(devproxy::ports::probe(proxy.https_port).await);

    proxy.lifecycle.stop().await;
}

#[tokio::test]
async fn test_restart_into_missing_certificate() {
    let proxy = started_proxy().await;

    proxy
        .registry
        .set_config(ConfigUpdate {
            base_domain: Some("other.test".to_string()),
            ..Default::default()
        })
        .unwrap();

    let err = proxy.lifecycle.restart().await.unwrap_err();
    assert!(matches!(err, Error::CertificateMissing { .. }));
    assert_eq!(proxy.lifecycle.status().state, ProxyState::Error);
    assert!(proxy.lifecycle.bound_addrs().is_none());
}

#[tokio::test]
async fn test_overlapping_calls_are_serialized() {
    let proxy = setup_proxy();
    let lifecycle = &proxy.lifecycle;

    let (a, b) = tokio::join!(lifecycle.start(), lifecycle.start());
    a.unwrap();
    b.unwrap();

    tokio::join!(lifecycle.stop(), lifecycle.stop());
    assert_eq!(lifecycle.status().state, ProxyState::Stopped);
    assert!(devproxy::ports::probe(proxy.https_port).await);
}
