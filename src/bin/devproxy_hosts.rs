//! CLI tool for managing registered hosts and the proxy config
//!
//! Usage:
//!   devproxy-hosts add <subdomain> [port] [--disabled]
//!   devproxy-hosts update <id> [--subdomain <name>] [--port <port>] [--enable|--disable]
//!   devproxy-hosts delete <id>
//!   devproxy-hosts list [--json]
//!   devproxy-hosts config get [--json]
//!   devproxy-hosts config set [--base-domain <domain>] [--http-port <port>] ...

use anyhow::Result;
use clap::{Parser, Subcommand};
use devproxy::ports::{self, DEFAULT_SUGGEST_END, DEFAULT_SUGGEST_START};
use devproxy::{ConfigUpdate, HostEntry, HostRegistry, HostUpdate, NewHost, SqliteRegistry};
use std::path::PathBuf;

/// CLI tool for managing devproxy hosts
#[derive(Parser, Debug)]
#[command(name = "devproxy-hosts")]
#[command(version)]
#[command(about = "Manage host mappings for devproxy")]
struct Args {
    /// Registry database path
    #[arg(long, env = "DB_PATH", default_value = "./data/devproxy.db")]
    db_path: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Register a new host
    Add {
        /// Subdomain label (e.g. `app` for app.<baseDomain>)
        subdomain: String,

        /// Backend port; a free port is suggested when omitted
        port: Option<u16>,

        /// Register without routing to it yet
        #[arg(long)]
        disabled: bool,
    },

    /// Update an existing host
    Update {
        /// Host id
        id: String,

        #[arg(short = 's', long)]
        subdomain: Option<String>,

        #[arg(short = 'p', long)]
        port: Option<u16>,

        #[arg(long, conflicts_with = "disable")]
        enable: bool,

        #[arg(long)]
        disable: bool,
    },

    /// Delete a host
    Delete {
        /// Host id
        id: String,
    },

    /// List all hosts
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Read or change the proxy configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    Get {
        #[arg(long)]
        json: bool,
    },
    Set {
        #[arg(long)]
        base_domain: Option<String>,

        #[arg(long)]
        http_port: Option<u16>,

        #[arg(long)]
        https_port: Option<u16>,

        #[arg(long)]
        auto_launch: Option<bool>,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    let registry = SqliteRegistry::new(&args.db_path)?;

    match args.command {
        Commands::Add {
            subdomain,
            port,
            disabled,
        } => {
            let target_port = match port {
                Some(port) => port,
                None => ports::suggest(DEFAULT_SUGGEST_START, DEFAULT_SUGGEST_END).await?,
            };

            let host = registry.add(NewHost {
                subdomain,
                target_port,
                enabled: !disabled,
            })?;

            println!("Added host:");
            print_host(&host);
        }

        Commands::Update {
            id,
            subdomain,
            port,
            enable,
            disable,
        } => {
            let enabled = match (enable, disable) {
                (true, _) => Some(true),
                (_, true) => Some(false),
                _ => None,
            };

            let host = registry.update(
                &id,
                HostUpdate {
                    subdomain,
                    target_port: port,
                    enabled,
                },
            )?;

            println!("Updated host:");
            print_host(&host);
        }

        Commands::Delete { id } => {
            if registry.remove(&id)? {
                println!("Deleted host {}", id);
            } else {
                eprintln!("No host found with id {}", id);
                std::process::exit(1);
            }
        }

        Commands::List { json } => {
            let hosts = registry.list()?;

            if json {
                println!("{}", serde_json::to_string_pretty(&hosts)?);
                return Ok(());
            }

            if hosts.is_empty() {
                println!("No hosts registered");
                return Ok(());
            }

            let base_domain = registry.config()?.base_domain;
            println!("{:<38} {:<40} {:<8} {:<8}", "ID", "HOST", "PORT", "ENABLED");
            println!("{}", "-".repeat(96));

            for host in &hosts {
                println!(
                    "{:<38} {:<40} {:<8} {:<8}",
                    host.id,
                    format!("{}.{}", host.subdomain, base_domain),
                    host.target_port,
                    if host.enabled { "yes" } else { "no" }
                );
            }

            println!("\nTotal: {} host(s)", hosts.len());
        }

        Commands::Config { action } => match action {
            ConfigAction::Get { json } => {
                let config = registry.config()?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&config)?);
                } else {
                    println!("  Base domain: {}", config.base_domain);
                    println!("  HTTP port:   {}", config.http_port);
                    println!("  HTTPS port:  {}", config.https_port);
                    println!("  Auto launch: {}", config.auto_launch);
                }
            }
            ConfigAction::Set {
                base_domain,
                http_port,
                https_port,
                auto_launch,
            } => {
                registry.set_config(ConfigUpdate {
                    base_domain,
                    http_port,
                    https_port,
                    auto_launch,
                })?;
                println!("Configuration saved; restart the proxy to apply domain or port changes");
            }
        },
    }

    Ok(())
}

fn print_host(host: &HostEntry) {
    println!("  ID:         {}", host.id);
    println!("  Subdomain:  {}", host.subdomain);
    println!("  Port:       {}", host.target_port);
    println!("  Enabled:    {}", host.enabled);
}
