//! Host registry: subdomain -> port mappings plus the global proxy config
//!
//! The routing engine only depends on the [`HostRegistry`] trait. The bundled
//! [`SqliteRegistry`] keeps everything in a single SQLite file.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::Path;
use uuid::Uuid;

/// A registered project: `<subdomain>.<baseDomain>` -> `127.0.0.1:<target_port>`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostEntry {
    pub id: String,
    pub subdomain: String,
    pub target_port: u16,
    pub enabled: bool,
}

/// Host entry before the registry assigns an id
#[derive(Debug, Clone)]
pub struct NewHost {
    pub subdomain: String,
    pub target_port: u16,
    pub enabled: bool,
}

#[derive(Debug, Clone, Default)]
pub struct HostUpdate {
    pub subdomain: Option<String>,
    pub target_port: Option<u16>,
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    pub base_domain: String,
    pub http_port: u16,
    pub https_port: u16,
    pub auto_launch: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            base_domain: "localhost".to_string(),
            http_port: 8080,
            https_port: 8443,
            auto_launch: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConfigUpdate {
    pub base_domain: Option<String>,
    pub http_port: Option<u16>,
    pub https_port: Option<u16>,
    pub auto_launch: Option<bool>,
}

/// CRUD contract consumed by the routing engine and the front ends
pub trait HostRegistry: Send + Sync {
    fn list(&self) -> Result<Vec<HostEntry>>;

    fn add(&self, host: NewHost) -> Result<HostEntry>;

    /// Fails with [`Error::NotFound`] when `id` is unknown
    fn update(&self, id: &str, update: HostUpdate) -> Result<HostEntry>;

    /// Returns whether an entry was removed
    fn remove(&self, id: &str) -> Result<bool>;

    /// First enabled entry, in insertion order, whose subdomain matches
    fn find_enabled_by_subdomain(&self, subdomain: &str) -> Result<Option<HostEntry>>;

    fn config(&self) -> Result<ProxyConfig>;

    fn set_config(&self, update: ConfigUpdate) -> Result<ProxyConfig>;
}

/// Validate and normalize a DNS label
pub fn normalize_subdomain(subdomain: &str) -> Result<String> {
    let label = subdomain.trim().to_ascii_lowercase();
    let valid = !label.is_empty()
        && label.len() <= 63
        && !label.starts_with('-')
        && !label.ends_with('-')
        && label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-');

    if valid {
        Ok(label)
    } else {
        Err(Error::InvalidSubdomain(subdomain.to_string()))
    }
}

/// Validate a base domain label by label, e.g. `Dev.Test.` -> `dev.test`
pub fn normalize_base_domain(domain: &str) -> Result<String> {
    let trimmed = domain.trim().trim_end_matches('.');
    if trimmed.is_empty() {
        return Err(Error::InvalidDomain(domain.to_string()));
    }

    let labels = trimmed
        .split('.')
        .map(normalize_subdomain)
        .collect::<Result<Vec<_>>>()
        .map_err(|_| Error::InvalidDomain(domain.to_string()))?;
    Ok(labels.join("."))
}

fn validate_port(port: u16) -> Result<u16> {
    if port == 0 {
        return Err(Error::InvalidPort(0));
    }
    Ok(port)
}

/// SQLite-backed registry
pub struct SqliteRegistry {
    conn: Mutex<Connection>,
}

impl SqliteRegistry {
    /// Open (or create) the registry database at `db_path`
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        if let Some(parent) = db_path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&db_path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let registry = Self {
            conn: Mutex::new(conn),
        };
        registry.initialize()?;
        Ok(registry)
    }

    fn initialize(&self) -> Result<()> {
        let conn = self.conn.lock();
        let defaults = ProxyConfig::default();

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS hosts (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                subdomain TEXT NOT NULL,
                target_port INTEGER NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );
            CREATE INDEX IF NOT EXISTS idx_hosts_subdomain ON hosts(subdomain);
            CREATE TABLE IF NOT EXISTS config (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                base_domain TEXT NOT NULL,
                http_port INTEGER NOT NULL,
                https_port INTEGER NOT NULL,
                auto_launch INTEGER NOT NULL
            );",
        )?;

        conn.execute(
            "INSERT OR IGNORE INTO config (id, base_domain, http_port, https_port, auto_launch)
             VALUES (1, ?1, ?2, ?3, ?4)",
            params![
                defaults.base_domain,
                defaults.http_port,
                defaults.https_port,
                defaults.auto_launch
            ],
        )?;

        Ok(())
    }

    fn row_to_host(row: &Row<'_>) -> rusqlite::Result<HostEntry> {
        Ok(HostEntry {
            id: row.get(0)?,
            subdomain: row.get(1)?,
            target_port: row.get(2)?,
            enabled: row.get(3)?,
        })
    }

    fn get_locked(conn: &Connection, id: &str) -> Result<Option<HostEntry>> {
        let host = conn
            .query_row(
                "SELECT id, subdomain, target_port, enabled FROM hosts WHERE id = ?1",
                params![id],
                Self::row_to_host,
            )
            .optional()?;
        Ok(host)
    }

    fn config_locked(conn: &Connection) -> Result<ProxyConfig> {
        let config = conn.query_row(
            "SELECT base_domain, http_port, https_port, auto_launch FROM config WHERE id = 1",
            [],
            |row| {
                Ok(ProxyConfig {
                    base_domain: row.get(0)?,
                    http_port: row.get(1)?,
                    https_port: row.get(2)?,
                    auto_launch: row.get(3)?,
                })
            },
        )?;
        Ok(config)
    }
}

impl HostRegistry for SqliteRegistry {
    fn list(&self) -> Result<Vec<HostEntry>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT id, subdomain, target_port, enabled FROM hosts ORDER BY seq")?;
        let hosts = stmt
            .query_map([], Self::row_to_host)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(hosts)
    }

    fn add(&self, host: NewHost) -> Result<HostEntry> {
        let subdomain = normalize_subdomain(&host.subdomain)?;
        let target_port = validate_port(host.target_port)?;
        let id = Uuid::new_v4().to_string();

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO hosts (id, subdomain, target_port, enabled) VALUES (?1, ?2, ?3, ?4)",
            params![id, subdomain, target_port, host.enabled],
        )?;

        Ok(HostEntry {
            id,
            subdomain,
            target_port,
            enabled: host.enabled,
        })
    }

    fn update(&self, id: &str, update: HostUpdate) -> Result<HostEntry> {
        let subdomain = update.subdomain.as_deref().map(normalize_subdomain).transpose()?;
        let target_port = update.target_port.map(validate_port).transpose()?;

        let conn = self.conn.lock();
        let existing =
            Self::get_locked(&conn, id)?.ok_or_else(|| Error::NotFound(id.to_string()))?;

        let updated = HostEntry {
            id: existing.id,
            subdomain: subdomain.unwrap_or(existing.subdomain),
            target_port: target_port.unwrap_or(existing.target_port),
            enabled: update.enabled.unwrap_or(existing.enabled),
        };

        conn.execute(
            "UPDATE hosts SET subdomain = ?1, target_port = ?2, enabled = ?3,
                updated_at = CURRENT_TIMESTAMP
             WHERE id = ?4",
            params![updated.subdomain, updated.target_port, updated.enabled, updated.id],
        )?;

        Ok(updated)
    }

    fn remove(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let affected = conn.execute("DELETE FROM hosts WHERE id = ?1", params![id])?;
        Ok(affected > 0)
    }

    fn find_enabled_by_subdomain(&self, subdomain: &str) -> Result<Option<HostEntry>> {
        let conn = self.conn.lock();
        let host = conn
            .query_row(
                "SELECT id, subdomain, target_port, enabled FROM hosts
                 WHERE subdomain = ?1 AND enabled = 1
                 ORDER BY seq
                 LIMIT 1",
                params![subdomain],
                Self::row_to_host,
            )
            .optional()?;
        Ok(host)
    }

    fn config(&self) -> Result<ProxyConfig> {
        let conn = self.conn.lock();
        Self::config_locked(&conn)
    }

    fn set_config(&self, update: ConfigUpdate) -> Result<ProxyConfig> {
        let base_domain = update
            .base_domain
            .as_deref()
            .map(normalize_base_domain)
            .transpose()?;
        let http_port = update.http_port.map(validate_port).transpose()?;
        let https_port = update.https_port.map(validate_port).transpose()?;

        let conn = self.conn.lock();
        let current = Self::config_locked(&conn)?;
        let config = ProxyConfig {
            base_domain: base_domain.unwrap_or(current.base_domain),
            http_port: http_port.unwrap_or(current.http_port),
            https_port: https_port.unwrap_or(current.https_port),
            auto_launch: update.auto_launch.unwrap_or(current.auto_launch),
        };

        conn.execute(
            "UPDATE config SET base_domain = ?1, http_port = ?2, https_port = ?3, auto_launch = ?4
             WHERE id = 1",
            params![
                config.base_domain,
                config.http_port,
                config.https_port,
                config.auto_launch
            ],
        )?;

        Ok(config)
    }
}
