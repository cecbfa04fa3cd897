//! Proxy lifecycle: owns the redirect and TLS listeners
//!
//! `start`, `stop` and `restart` are serialized per instance, and `restart`
//! holds the operation lock across both halves.

use crate::certificate::{load_server_config, CertificateProvisioner};
use crate::error::{Error, Result};
use crate::events::{EventHub, ProxyState, ProxyStatus};
use crate::proxy::{https_redirect, wait_for_shutdown, RoutingEngine};
use crate::registry::HostRegistry;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use std::convert::Infallible;
use std::future::Future;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex as TokioMutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Address both listeners bind to
    pub bind_ip: IpAddr,
    /// Upper bound on how long `stop` waits for the listeners to wind down
    pub drain_timeout: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            drain_timeout: Duration::from_secs(1),
        }
    }
}

/// Live listener handles; present exactly while the proxy is running
struct Listeners {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    http_addr: SocketAddr,
    https_addr: SocketAddr,
}

struct Inner {
    status: ProxyStatus,
    listeners: Option<Listeners>,
}

pub struct ProxyLifecycle {
    registry: Arc<dyn HostRegistry>,
    certificates: Arc<CertificateProvisioner>,
    events: EventHub,
    options: LifecycleOptions,
    inner: Mutex<Inner>,
    op_lock: TokioMutex<()>,
}

impl ProxyLifecycle {
    pub fn new(
        registry: Arc<dyn HostRegistry>,
        certificates: Arc<CertificateProvisioner>,
        events: EventHub,
    ) -> Self {
        Self::with_options(registry, certificates, events, LifecycleOptions::default())
    }

    pub fn with_options(
        registry: Arc<dyn HostRegistry>,
        certificates: Arc<CertificateProvisioner>,
        events: EventHub,
        options: LifecycleOptions,
    ) -> Self {
        Self {
            registry,
            certificates,
            events,
            options,
            inner: Mutex::new(Inner {
                status: ProxyStatus::stopped(),
                listeners: None,
            }),
            op_lock: TokioMutex::new(()),
        }
    }

    pub fn events(&self) -> &EventHub {
        &self.events
    }

    pub fn status(&self) -> ProxyStatus {
        self.inner.lock().status.clone()
    }

    /// Bound (http, https) addresses while running
    pub fn bound_addrs(&self) -> Option<(SocketAddr, SocketAddr)> {
        self.inner
            .lock()
            .listeners
            .as_ref()
            .map(|l| (l.http_addr, l.https_addr))
    }

    pub async fn start(&self) -> Result<()> {
        let _op = self.op_lock.lock().await;
        self.start_locked().await
    }

    /// Always completes and always ends in `Stopped`
    pub async fn stop(&self) {
        let _op = self.op_lock.lock().await;
        self.stop_locked().await;
    }

    pub async fn restart(&self) -> Result<()> {
        let _op = self.op_lock.lock().await;
        self.stop_locked().await;
        self.start_locked().await
    }

    fn set_status(&self, status: ProxyStatus) {
        self.inner.lock().status = status.clone();
        self.events.status(status);
    }

    async fn start_locked(&self) -> Result<()> {
        if self.inner.lock().status.state == ProxyState::Running {
            return Ok(());
        }

        match self.bind_listeners().await {
            Ok(listeners) => {
                let message = format!(
                    "Proxy started. HTTP:{} HTTPS:{}",
                    listeners.http_addr.port(),
                    listeners.https_addr.port()
                );
                self.inner.lock().listeners = Some(listeners);
                self.set_status(ProxyStatus::running());
                self.events.info(message);
                Ok(())
            }
            Err(e) => {
                self.set_status(ProxyStatus::error(e.to_string()));
                self.events.error(format!("Failed to start: {}", e));
                Err(e)
            }
        }
    }

    async fn bind_listeners(&self) -> Result<Listeners> {
        let config = self.registry.config()?;

        let bundle = self
            .certificates
            .check_exists(&config.base_domain)
            .ok_or_else(|| {
                let expected = self.certificates.bundle_paths(&config.base_domain);
                Error::CertificateMissing {
                    domain: config.base_domain.clone(),
                    cert_path: expected.cert_path.display().to_string(),
                    key_path: expected.key_path.display().to_string(),
                }
            })?;
        let acceptor = TlsAcceptor::from(Arc::new(load_server_config(&bundle)?));

        let http_listener = bind(self.options.bind_ip, config.http_port).await?;
        let https_listener = bind(self.options.bind_ip, config.https_port).await?;
        let http_addr = http_listener.local_addr()?;
        let https_addr = https_listener.local_addr()?;

        let (shutdown, _) = watch::channel(false);
        let router = RoutingEngine::new(self.registry.clone(), self.events.clone());

        let tasks = vec![
            tokio::spawn(run_redirect_listener(http_listener, shutdown.subscribe())),
            tokio::spawn(run_tls_listener(
                https_listener,
                acceptor,
                router,
                shutdown.subscribe(),
            )),
        ];

        info!("Listening on {} (redirect) and {} (TLS)", http_addr, https_addr);

        Ok(Listeners {
            shutdown,
            tasks,
            http_addr,
            https_addr,
        })
    }

    async fn stop_locked(&self) {
        let listeners = self.inner.lock().listeners.take();

        let Some(listeners) = listeners else {
            if self.inner.lock().status.state != ProxyState::Stopped {
                self.set_status(ProxyStatus::stopped());
            }
            return;
        };

        // Connections observe this and drop their sockets immediately
        listeners.shutdown.send_replace(true);

        let mut tasks = listeners.tasks;
        let drained = tokio::time::timeout(self.options.drain_timeout, async {
            for task in tasks.iter_mut() {
                let _ = task.await;
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                "Listeners did not close within {:?}; forcing stop",
                self.options.drain_timeout
            );
            for task in &tasks {
                task.abort();
            }
        }

        self.set_status(ProxyStatus::stopped());
        self.events.info("Proxy stopped");
    }
}

async fn bind(ip: IpAddr, port: u16) -> Result<TcpListener> {
    TcpListener::bind(SocketAddr::new(ip, port))
        .await
        .map_err(|e| Error::BindFailed {
            port,
            reason: e.to_string(),
        })
}

/// Resolve an accept. Errors such as EMFILE tend to persist, so a failure
/// pauses before the loop tries again.
async fn accept_with_backoff<T>(
    accept: impl Future<Output = io::Result<T>>,
    listener_name: &str,
) -> Option<T> {
    match accept.await {
        Ok(accepted) => Some(accepted),
        Err(e) => {
            warn!("{} accept failed: {}", listener_name, e);
            tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            None
        }
    }
}

/// Plain listener: every request is answered with a 301 to HTTPS
async fn run_redirect_listener(listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => break,
            accepted = accept_with_backoff(listener.accept(), "HTTP") => {
                if let Some((stream, remote_addr)) = accepted {
                    connections.spawn(serve_redirect(stream, remote_addr, shutdown.clone()));
                }
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    drop(listener);
    while connections.join_next().await.is_some() {}
}

async fn serve_redirect(
    stream: TcpStream,
    remote_addr: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) {
    let service = service_fn(|req| async move { Ok::<_, Infallible>(https_redirect(&req)) });
    let conn = http1::Builder::new().serve_connection(TokioIo::new(stream), service);

    tokio::select! {
        result = conn => {
            if let Err(e) = result {
                debug!("HTTP connection error from {}: {}", remote_addr, e);
            }
        }
        _ = wait_for_shutdown(&mut shutdown) => {}
    }
}

/// TLS listener wired to the routing engine
async fn run_tls_listener(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    router: RoutingEngine,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => break,
            accepted = accept_with_backoff(listener.accept(), "HTTPS") => {
                if let Some((stream, remote_addr)) = accepted {
                    connections.spawn(serve_tls(
                        stream,
                        remote_addr,
                        acceptor.clone(),
                        router.clone(),
                        shutdown.clone(),
                    ));
                }
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    drop(listener);
    while connections.join_next().await.is_some() {}
}

async fn serve_tls(
    stream: TcpStream,
    remote_addr: SocketAddr,
    acceptor: TlsAcceptor,
    router: RoutingEngine,
    mut shutdown: watch::Receiver<bool>,
) {
    let tls_stream = tokio::select! {
        accepted = acceptor.accept(stream) => match accepted {
            Ok(tls_stream) => tls_stream,
            Err(e) => {
                debug!("TLS handshake with {} failed: {}", remote_addr, e);
                return;
            }
        },
        _ = wait_for_shutdown(&mut shutdown) => return,
    };

    let service_shutdown = shutdown.clone();
    let service = service_fn(move |req| {
        let router = router.clone();
        let shutdown = service_shutdown.clone();
        async move { router.serve(req, remote_addr, shutdown).await }
    });

    let conn = http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(false)
        .serve_connection(TokioIo::new(tls_stream), service)
        .with_upgrades();

    tokio::select! {
        result = conn => {
            if let Err(e) = result {
                debug!("HTTPS connection error from {}: {}", remote_addr, e);
            }
        }
        _ = wait_for_shutdown(&mut shutdown) => {
            debug!("Closing connection from {} for shutdown", remote_addr);
        }
    }
}
