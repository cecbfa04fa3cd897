//! devproxy - local development HTTPS reverse proxy
//!
//! Routes `https://<project>.<baseDomain>` to `http://127.0.0.1:<port>`:
//! - Subdomain routing backed by a live host registry
//! - HTTP and WebSocket forwarding over a TLS listener, 301 redirect on plain HTTP
//! - Wildcard certificates from a trusted local CA (mkcert)
//! - pf redirection of ports 80/443 to the proxy's own ports
//! - Free port suggestions for new projects

pub mod certificate;
pub mod error;
pub mod events;
pub mod exec;
pub mod lifecycle;
pub mod port_forward;
pub mod ports;
pub mod proxy;
pub mod registry;

pub use certificate::{CertificateBundle, CertificateProvisioner};
pub use error::{Error, Result};
pub use events::{EventHub, LogCategory, LogEntry, ProxyState, ProxyStatus};
pub use exec::{CommandExecutor, CommandOutput, SystemExecutor};
pub use lifecycle::{LifecycleOptions, ProxyLifecycle};
pub use port_forward::{PortForwardManager, PortForwardStatus};
pub use proxy::{resolve_target, BackendTarget, RoutingEngine};
pub use registry::{
    ConfigUpdate, HostEntry, HostRegistry, HostUpdate, NewHost, ProxyConfig, SqliteRegistry,
};
