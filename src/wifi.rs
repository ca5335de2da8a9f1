//! Wifi station control via wpa_supplicant
//!
//! Joins and leaves the device's access point by driving `wpa_cli` against
//! the supplicant control socket, then pins the static rig address with
//! `ip`. The control-socket wire protocol stays inside wpa_cli; this module
//! only sequences commands and checks replies.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::common::{Error, Result};

/// Parameters for joining the device's access point
#[derive(Debug, Clone)]
pub struct StationParams {
    /// wpa_supplicant control socket directory
    pub ctrl: PathBuf,
    /// Wireless interface to join with
    pub netif: String,
    pub ssid: String,
    pub passphrase: String,
    /// Static local address in `addr/prefix` form
    pub local_ip: String,
}

/// Narrow interface the orchestrator needs from a wifi station
#[async_trait]
pub trait WifiStation: Send {
    /// Join the network described by `params` and take the local address
    async fn connect(&mut self, params: &StationParams) -> Result<()>;

    /// Leave the network; no-op when never connected
    async fn disconnect(&mut self) -> Result<()>;
}

/// Poll interval while waiting for the supplicant to associate
const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// The network this station registered with the supplicant
struct JoinedNetwork {
    params: StationParams,
    network_id: String,
}

/// Wifi station driving `wpa_cli` and `ip`
pub struct WpaCliStation {
    wpa_cli: PathBuf,
    ip: PathBuf,
    connect_timeout: Duration,
    joined: Option<JoinedNetwork>,
}

impl WpaCliStation {
    pub fn new(wpa_cli: PathBuf, ip: PathBuf, connect_timeout: Duration) -> Self {
        Self {
            wpa_cli,
            ip,
            connect_timeout,
            joined: None,
        }
    }

    /// Run one wpa_cli command and return its trimmed reply
    async fn wpa(&self, ctrl: &Path, netif: &str, args: &[&str]) -> Result<String> {
        let output = Command::new(&self.wpa_cli)
            .arg("-p")
            .arg(ctrl)
            .arg("-i")
            .arg(netif)
            .args(args)
            .output()
            .await
            .map_err(|e| Error::station(args[0], e.to_string()))?;
        if !output.status.success() {
            return Err(Error::station(
                args[0],
                format!("wpa_cli exited with {}", output.status),
            ));
        }
        let reply = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if reply == "FAIL" || reply.ends_with("\nFAIL") {
            return Err(Error::station(args[0], "wpa_cli replied FAIL"));
        }
        Ok(reply)
    }

    /// Run one `ip` command, discarding output
    async fn ip_cmd(&self, args: &[&str]) -> Result<()> {
        let output = Command::new(&self.ip)
            .args(args)
            .output()
            .await
            .map_err(|e| Error::station("ip", e.to_string()))?;
        if !output.status.success() {
            return Err(Error::station(
                "ip",
                format!(
                    "'ip {}' exited with {}: {}",
                    args.join(" "),
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }
        Ok(())
    }

    /// Poll supplicant status until the association completes
    async fn wait_associated(&self, ctrl: &Path, netif: &str) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.connect_timeout;
        loop {
            let status = self.wpa(ctrl, netif, &["status"]).await?;
            if is_associated(&status) {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::station(
                    "connect",
                    format!(
                        "association timed out after {} seconds",
                        self.connect_timeout.as_secs()
                    ),
                ));
            }
            tokio::time::sleep(STATUS_POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl WifiStation for WpaCliStation {
    async fn connect(&mut self, params: &StationParams) -> Result<()> {
        let ctrl = params.ctrl.clone();
        let netif = params.netif.clone();

        let reply = self.wpa(&ctrl, &netif, &["add_network"]).await?;
        // wpa_cli may print an interface banner before the network id
        let network_id = reply.lines().last().unwrap_or_default().to_string();

        self.wpa(
            &ctrl,
            &netif,
            &["set_network", &network_id, "ssid", &quoted(&params.ssid)],
        )
        .await?;
        self.wpa(
            &ctrl,
            &netif,
            &["set_network", &network_id, "psk", &quoted(&params.passphrase)],
        )
        .await?;
        self.wpa(&ctrl, &netif, &["select_network", &network_id]).await?;

        // Registered from here on, so a failed association still gets torn
        // down by disconnect
        self.joined = Some(JoinedNetwork {
            params: params.clone(),
            network_id,
        });

        self.wait_associated(&ctrl, &netif).await?;
        self.ip_cmd(&["addr", "replace", &params.local_ip, "dev", &netif])
            .await?;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        let Some(net) = self.joined.take() else {
            return Ok(());
        };
        let ctrl = net.params.ctrl.as_path();
        let netif = net.params.netif.as_str();

        // The address may never have been assigned if connect failed midway
        let _ = self
            .ip_cmd(&["addr", "del", &net.params.local_ip, "dev", netif])
            .await;

        self.wpa(ctrl, netif, &["disconnect"]).await?;
        self.wpa(ctrl, netif, &["remove_network", &net.network_id])
            .await?;
        Ok(())
    }
}

/// Whether a `wpa_cli status` reply reports a completed association
fn is_associated(status: &str) -> bool {
    status.lines().any(|line| line.trim() == "wpa_state=COMPLETED")
}

/// wpa_cli passes string values through to the supplicant config, so they
/// need embedded quotes
fn quoted(value: &str) -> String {
    format!("\"{value}\"")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quoted_embeds_quotes() {
        assert_eq!(quoted("lab-direct"), "\"lab-direct\"");
    }

    #[test]
    fn test_is_associated() {
        let connected = "bssid=aa:bb:cc:dd:ee:ff\nssid=lab-direct\nwpa_state=COMPLETED\n";
        let scanning = "wpa_state=SCANNING\n";
        assert!(is_associated(connected));
        assert!(!is_associated(scanning));
        assert!(!is_associated(""));
    }
}
