//! pf redirection of the privileged ports 80/443 to the proxy's own ports
//!
//! Rules are never stored; their state is always read back from `pfctl`.

use crate::error::{Error, Result};
use crate::exec::{CommandExecutor, SystemExecutor};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const STANDARD_HTTP_PORT: u16 = 80;
pub const STANDARD_HTTPS_PORT: u16 = 443;

const PF_ANCHOR: &str = "com.apple/250.ApplicationFirewall";
const USER_CANCELED_MARKER: &str = "User canceled";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortForwardStatus {
    pub http_enabled: bool,
    pub https_enabled: bool,
    pub all_enabled: bool,
}

/// `rdr` rule redirecting `from` on loopback to `127.0.0.1:<to>`
pub fn redirect_rule(from: u16, to: u16) -> String {
    format!(
        "rdr pass on lo0 inet proto tcp from any to any port {} -> 127.0.0.1 port {}",
        from, to
    )
}

pub struct PortForwardManager {
    http_port: u16,
    https_port: u16,
    executor: Arc<dyn CommandExecutor>,
}

impl PortForwardManager {
    pub fn new(http_port: u16, https_port: u16, executor: Arc<dyn CommandExecutor>) -> Result<Self> {
        for port in [http_port, https_port] {
            if port == 0 {
                return Err(Error::InvalidPort(u32::from(port)));
            }
        }

        Ok(Self {
            http_port,
            https_port,
            executor,
        })
    }

    pub fn with_system_executor(http_port: u16, https_port: u16) -> Result<Self> {
        Self::new(http_port, https_port, Arc::new(SystemExecutor))
    }

    pub fn http_rule(&self) -> String {
        redirect_rule(STANDARD_HTTP_PORT, self.http_port)
    }

    pub fn https_rule(&self) -> String {
        redirect_rule(STANDARD_HTTPS_PORT, self.https_port)
    }

    /// Dump the active rule table: unprivileged first, then non-interactive
    /// sudo, then nothing
    async fn query_rules(&self) -> String {
        let attempts: [(&str, &[&str]); 2] = [("pfctl", &["-sr"]), ("sudo", &["-n", "pfctl", "-sr"])];

        for (program, args) in attempts {
            let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
            match self.executor.run(program, &args, None).await {
                Ok(output) if output.success => return output.stdout,
                Ok(output) => debug!("{} {:?} failed: {}", program, args, output.stderr.trim()),
                Err(e) => debug!("{} {:?} failed: {}", program, args, e),
            }
        }

        warn!("Failed to read pf rules; treating port forwarding as disabled");
        String::new()
    }

    /// Never fails: an unreadable rule table reports everything disabled
    pub async fn check_rules(&self) -> PortForwardStatus {
        let rules = self.query_rules().await;

        let http_enabled = rules.contains(&self.http_rule());
        let https_enabled = rules.contains(&self.https_rule());

        PortForwardStatus {
            http_enabled,
            https_enabled,
            all_enabled: http_enabled && https_enabled,
        }
    }

    /// AppleScript that loads both rules into the anchor and enables pf
    fn enable_script(&self) -> String {
        let rules = format!("{}\n{}", self.http_rule(), self.https_rule());
        format!(
            "do shell script \"\necho '{}' | pfctl -a '{}' -f - 2>/dev/null\npfctl -e 2>/dev/null || true\n\" with administrator privileges",
            rules, PF_ANCHOR
        )
    }

    /// Install the rules in one elevated invocation (shows the OS password dialog)
    pub async fn enable(&self) -> Result<()> {
        let args = vec!["-e".to_string(), self.enable_script()];
        let output = self
            .executor
            .run("osascript", &args, None)
            .await
            .map_err(|e| Error::PortForwardFailed(e.to_string()))?;

        if output.success {
            info!("Port forwarding enabled");
            return Ok(());
        }

        if output.stderr.contains(USER_CANCELED_MARKER) {
            info!("Port forwarding setup cancelled by user");
            return Err(Error::UserCancelled);
        }

        Err(Error::PortForwardFailed(output.stderr.trim().to_string()))
    }

    pub async fn ensure(&self) -> Result<()> {
        if self.check_rules().await.all_enabled {
            info!("Port forwarding rules already configured");
            return Ok(());
        }

        info!("Port forwarding rules not found, enabling");
        self.enable().await
    }
}
