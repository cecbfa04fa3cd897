//! Local TCP port availability checks

use crate::error::{Error, Result};
use std::net::Ipv4Addr;
use tokio::net::TcpListener;
use tracing::debug;

pub const DEFAULT_SUGGEST_START: u16 = 3000;
pub const DEFAULT_SUGGEST_END: u16 = 9999;

/// Whether `127.0.0.1:<port>` can be bound right now.
///
/// The probe listener is dropped before returning on every path. Port 0 is
/// never reported as available since it names no concrete port.
pub async fn probe(port: u16) -> bool {
    if port == 0 {
        return false;
    }

    match TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await {
        Ok(listener) => {
            drop(listener);
            true
        }
        Err(e) => {
            debug!("port {} unavailable: {}", port, e);
            false
        }
    }
}

/// First available port in `start..=end`, scanned in ascending order
pub async fn suggest(start: u16, end: u16) -> Result<u16> {
    for port in start..=end {
        if probe(port).await {
            return Ok(port);
        }
    }
    Err(Error::NoPortAvailable { start, end })
}
