//! devproxy - Main entry point
//!
//! Runs the proxy and the operator actions around it (certificates, port
//! forwarding, free port lookup)

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use devproxy::ports::{self, DEFAULT_SUGGEST_END, DEFAULT_SUGGEST_START};
use devproxy::events::forward_json;
use devproxy::{
    CertificateProvisioner, EventHub, HostRegistry, LifecycleOptions, PortForwardManager,
    ProxyLifecycle, SqliteRegistry,
};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// devproxy - HTTPS reverse proxy for local development
#[derive(Parser, Debug)]
#[command(name = "devproxy")]
#[command(version)]
#[command(about = "Route https://<project>.<domain> to local development servers")]
struct Args {
    /// Registry database path
    #[arg(long, env = "DB_PATH", default_value = "./data/devproxy.db", global = true)]
    db_path: PathBuf,

    /// Certificates directory
    #[arg(long, env = "CERTS_DIR", default_value = "./certs", global = true)]
    certs_dir: PathBuf,

    /// mkcert binary
    #[arg(long, env = "MKCERT_PATH", default_value = "mkcert", global = true)]
    mkcert: String,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the proxy until Ctrl-C
    Run {
        /// Address to bind both listeners to
        #[arg(long, env = "BIND_ADDRESS", default_value = "127.0.0.1")]
        bind: IpAddr,

        /// Provision the wildcard certificate first if it is missing
        #[arg(long)]
        ensure_cert: bool,
    },

    /// Manage the wildcard certificate for the configured base domain
    Cert {
        #[command(subcommand)]
        action: CertAction,
    },

    /// Manage pf redirection of ports 80/443
    PortForward {
        #[command(subcommand)]
        action: PortForwardAction,
    },

    /// Check or suggest local ports
    Port {
        #[command(subcommand)]
        action: PortAction,
    },
}

#[derive(Subcommand, Debug)]
enum CertAction {
    /// Install the local CA if needed and mint the wildcard certificate
    Ensure,
    /// Show whether the certificate exists and the CA is trusted
    Status,
}

#[derive(Subcommand, Debug)]
enum PortForwardAction {
    /// Show which redirect rules are active
    Check,
    /// Install both rules (prompts for administrator password)
    Enable,
    /// Install the rules unless they are already active
    Ensure,
}

#[derive(Subcommand, Debug)]
enum PortAction {
    /// Check whether a port is free
    Check { port: u16 },
    /// Find the first free port in a range
    Suggest {
        #[arg(long, default_value_t = DEFAULT_SUGGEST_START)]
        start: u16,
        #[arg(long, default_value_t = DEFAULT_SUGGEST_END)]
        end: u16,
    },
}

const PRINTER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

fn init_logging(level: &str) {
    let log_level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    match args.command {
        Commands::Run { bind, ensure_cert } => {
            let registry = open_registry(&args.db_path)?;
            let certificates = Arc::new(CertificateProvisioner::with_system_executor(
                &args.certs_dir,
                args.mkcert,
            ));
            run(registry, certificates, bind, ensure_cert).await?;
        }

        Commands::Cert { action } => {
            let registry = open_registry(&args.db_path)?;
            let domain = registry.config()?.base_domain;
            let certificates =
                CertificateProvisioner::with_system_executor(&args.certs_dir, args.mkcert);

            match action {
                CertAction::Ensure => {
                    let bundle = certificates.ensure_certificate(&domain).await?;
                    println!("Certificate for *.{}:", domain);
                    println!("  Cert: {}", bundle.cert_path.display());
                    println!("  Key:  {}", bundle.key_path.display());
                }
                CertAction::Status => {
                    let trusted = certificates.is_ca_trusted().await;
                    println!("Local CA trusted: {}", if trusted { "yes" } else { "no" });
                    match certificates.check_exists(&domain) {
                        Some(bundle) => {
                            println!("Certificate for *.{}: {}", domain, bundle.cert_path.display())
                        }
                        None => println!("Certificate for *.{}: missing", domain),
                    }
                }
            }
        }

        Commands::PortForward { action } => {
            let registry = open_registry(&args.db_path)?;
            let config = registry.config()?;
            let manager =
                PortForwardManager::with_system_executor(config.http_port, config.https_port)?;

            match action {
                PortForwardAction::Check => {
                    let status = manager.check_rules().await;
                    println!("80  -> {}: {}", config.http_port, on_off(status.http_enabled));
                    println!("443 -> {}: {}", config.https_port, on_off(status.https_enabled));
                }
                PortForwardAction::Enable => manager.enable().await?,
                PortForwardAction::Ensure => manager.ensure().await?,
            }
        }

        Commands::Port { action } => match action {
            PortAction::Check { port } => {
                let available = ports::probe(port).await;
                println!(
                    "Port {} is {}",
                    port,
                    if available { "available" } else { "in use" }
                );
            }
            PortAction::Suggest { start, end } => {
                println!("{}", ports::suggest(start, end).await?);
            }
        },
    }

    Ok(())
}

fn open_registry(db_path: &PathBuf) -> Result<Arc<SqliteRegistry>> {
    let registry = SqliteRegistry::new(db_path)
        .with_context(|| format!("failed to open registry at {}", db_path.display()))?;
    Ok(Arc::new(registry))
}

fn on_off(enabled: bool) -> &'static str {
    if enabled {
        "enabled"
    } else {
        "disabled"
    }
}

async fn run(
    registry: Arc<SqliteRegistry>,
    certificates: Arc<CertificateProvisioner>,
    bind: IpAddr,
    ensure_cert: bool,
) -> Result<()> {
    let config = registry.config()?;
    info!("Base domain: {}", config.base_domain);

    if ensure_cert {
        certificates.ensure_certificate(&config.base_domain).await?;
    }

    let events = EventHub::new();
    let logs_printer = tokio::spawn(forward_json(events.subscribe_logs(), std::io::stdout()));
    let status_printer = tokio::spawn(forward_json(events.subscribe_status(), std::io::stdout()));

    let lifecycle = ProxyLifecycle::with_options(
        registry,
        certificates,
        events,
        LifecycleOptions {
            bind_ip: bind,
            ..Default::default()
        },
    );

    let started = lifecycle.start().await;
    if started.is_ok() {
        info!(
            "Ready: https://<project>.{} -> http://127.0.0.1:<port>",
            config.base_domain
        );

        tokio::signal::ctrl_c().await?;
        info!("Received shutdown signal");
        lifecycle.stop().await;
    }

    // Printers finish once the last EventHub sender is gone
    drop(lifecycle);
    let drained = tokio::time::timeout(PRINTER_DRAIN_TIMEOUT, async {
        let _ = logs_printer.await;
        let _ = status_printer.await;
    })
    .await;
    if drained.is_err() {
        warn!("Event output did not drain within {:?}", PRINTER_DRAIN_TIMEOUT);
    }

    started.context("failed to start proxy")
}
