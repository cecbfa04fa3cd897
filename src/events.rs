//! Log and status event streams
//!
//! Logs and status changes travel on two independent broadcast channels, so a
//! subscriber must not assume any ordering between a status event and the log
//! entry describing the same transition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{error, info, warn};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogCategory {
    Http,
    Ws,
    Error,
    Info,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub category: LogCategory,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subdomain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyState {
    Stopped,
    Running,
    Error,
}

/// Status payload; `error_message` is present exactly when `state` is `Error`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyStatus {
    pub state: ProxyState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl ProxyStatus {
    pub fn stopped() -> Self {
        Self { state: ProxyState::Stopped, error_message: None }
    }

    pub fn running() -> Self {
        Self { state: ProxyState::Running, error_message: None }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self { state: ProxyState::Error, error_message: Some(message.into()) }
    }
}

/// Fan-out point for log and status events
#[derive(Clone)]
pub struct EventHub {
    logs: broadcast::Sender<LogEntry>,
    status: broadcast::Sender<ProxyStatus>,
    counter: Arc<AtomicU64>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHub {
    pub fn new() -> Self {
        let (logs, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (status, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            logs,
            status,
            counter: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn subscribe_logs(&self) -> broadcast::Receiver<LogEntry> {
        self.logs.subscribe()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<ProxyStatus> {
        self.status.subscribe()
    }

    /// Emit a log entry and mirror it to tracing
    pub fn log(
        &self,
        category: LogCategory,
        message: impl Into<String>,
        subdomain: Option<&str>,
        target: Option<&str>,
    ) {
        let timestamp = Utc::now();
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        let entry = LogEntry {
            id: format!("{}-{}", timestamp.timestamp_millis(), seq),
            timestamp,
            category,
            message: message.into(),
            subdomain: subdomain.map(str::to_string),
            target: target.map(str::to_string),
        };

        match category {
            LogCategory::Error => error!(subdomain = ?entry.subdomain, "{}", entry.message),
            _ => info!(
                category = ?category,
                subdomain = ?entry.subdomain,
                target = ?entry.target,
                "{}",
                entry.message
            ),
        }

        // No subscribers is fine: retention is the observer's concern.
        let _ = self.logs.send(entry);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(LogCategory::Info, message, None, None);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(LogCategory::Error, message, None, None);
    }

    pub fn status(&self, status: ProxyStatus) {
        let _ = self.status.send(status);
    }
}

/// Write every event from `rx` to `sink` as one JSON line until all senders
/// are dropped, then hand the sink back
pub async fn forward_json<T, W>(mut rx: broadcast::Receiver<T>, mut sink: W) -> W
where
    T: Serialize + Clone,
    W: Write,
{
    loop {
        match rx.recv().await {
            Ok(event) => match serde_json::to_string(&event) {
                Ok(line) => {
                    if writeln!(sink, "{}", line).and_then(|_| sink.flush()).is_err() {
                        break;
                    }
                }
                Err(e) => warn!("Failed to encode event: {}", e),
            },
            Err(RecvError::Lagged(skipped)) => warn!("Event output lagged, {} events skipped", skipped),
            Err(RecvError::Closed) => break,
        }
    }
    sink
}
