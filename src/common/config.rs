//! Configuration file handling
//!
//! The rig reads one toml file describing the device under test, the two
//! wireless networks, the credential store, and the external tools. Every
//! field has a default matching the reference lab setup, so a partial file
//! only needs to override what differs.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::paths::config_path;
use super::{Error, Result};

/// PATH name of the authenticator binary when not configured explicitly
const AUTHENTICATOR_BIN: &str = "onboard-authenticator";

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Device under test
    #[serde(default)]
    pub device: DeviceConfig,

    /// The device-hosted network used before provisioning
    #[serde(default)]
    pub direct_wifi: DirectWifiConfig,

    /// The target network the device joins after provisioning
    #[serde(default)]
    pub infra_wifi: InfraWifiConfig,

    /// Credential store and naming
    #[serde(default)]
    pub keychain: KeychainConfig,

    /// External tool path overrides
    #[serde(default)]
    pub tools: ToolsConfig,

    /// Timeout settings
    #[serde(default)]
    pub timeouts: Timeouts,
}

/// Device under test
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeviceConfig {
    /// Serial port the device console is attached to
    #[serde(default = "default_serial")]
    pub serial: String,

    /// Console command; `{serial}` is replaced with the serial port
    #[serde(default = "default_console")]
    pub console: Vec<String>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            serial: default_serial(),
            console: default_console(),
        }
    }
}

impl DeviceConfig {
    /// Console command with the serial port substituted in
    pub fn console_argv(&self) -> Vec<String> {
        self.console
            .iter()
            .map(|arg| arg.replace("{serial}", &self.serial))
            .collect()
    }
}

fn default_serial() -> String {
    "/dev/ttyUSB0".to_string()
}

fn default_console() -> Vec<String> {
    ["socat", "-u", "open:{serial},rawer,b115200", "-"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// The device-hosted network used before provisioning
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DirectWifiConfig {
    /// wpa_supplicant control socket directory for the direct interface
    #[serde(default = "default_direct_ctrl")]
    pub ctrl: PathBuf,

    /// Wireless interface facing the device's access point
    #[serde(default = "default_direct_netif")]
    pub netif: String,

    /// SSID the device advertises
    #[serde(default = "default_direct_ssid")]
    pub ssid: String,

    #[serde(default = "default_direct_passphrase")]
    pub passphrase: String,

    /// Static address the rig takes on the direct link
    #[serde(default = "default_auth_ip")]
    pub auth_ip: String,

    /// Prefix length for `auth_ip`
    #[serde(default = "default_subnet")]
    pub subnet: u8,

    /// The device's own address on its access point
    #[serde(default = "default_device_ip")]
    pub device_ip: String,
}

impl Default for DirectWifiConfig {
    fn default() -> Self {
        Self {
            ctrl: default_direct_ctrl(),
            netif: default_direct_netif(),
            ssid: default_direct_ssid(),
            passphrase: default_direct_passphrase(),
            auth_ip: default_auth_ip(),
            subnet: default_subnet(),
            device_ip: default_device_ip(),
        }
    }
}

fn default_direct_ctrl() -> PathBuf {
    PathBuf::from("/var/run/wpa_supplicant")
}
fn default_direct_netif() -> String {
    "wlan1".to_string()
}
fn default_direct_ssid() -> String {
    "onboard-direct".to_string()
}
fn default_direct_passphrase() -> String {
    "onboard-direct-pass".to_string()
}
fn default_auth_ip() -> String {
    "192.168.33.2".to_string()
}
fn default_subnet() -> u8 {
    24
}
fn default_device_ip() -> String {
    "192.168.33.1".to_string()
}

/// The target network the device joins after provisioning
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InfraWifiConfig {
    /// Wireless interface attached to the infrastructure network
    #[serde(default = "default_infra_netif")]
    pub netif: String,

    #[serde(default = "default_infra_ssid")]
    pub ssid: String,

    #[serde(default = "default_infra_passphrase")]
    pub passphrase: String,

    /// Gateway address handed to the device as part of its credential
    #[serde(default = "default_gateway_ip")]
    pub gateway_ip: String,
}

impl Default for InfraWifiConfig {
    fn default() -> Self {
        Self {
            netif: default_infra_netif(),
            ssid: default_infra_ssid(),
            passphrase: default_infra_passphrase(),
            gateway_ip: default_gateway_ip(),
        }
    }
}

fn default_infra_netif() -> String {
    "wlan0".to_string()
}
fn default_infra_ssid() -> String {
    "onboard-infra".to_string()
}
fn default_infra_passphrase() -> String {
    "onboard-infra-pass".to_string()
}
fn default_gateway_ip() -> String {
    "192.168.1.1".to_string()
}

/// Credential store and naming
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KeychainConfig {
    /// Credential store the authenticator signs with
    #[serde(default = "default_keychain_locator")]
    pub locator: String,

    /// CA profile reference handed to the authenticator
    #[serde(default = "default_ca_profile")]
    pub ca_profile: String,

    /// Name prefix under which provisioned devices are enrolled
    #[serde(default = "default_network_prefix")]
    pub network_prefix: String,
}

impl Default for KeychainConfig {
    fn default() -> Self {
        Self {
            locator: default_keychain_locator(),
            ca_profile: default_ca_profile(),
            network_prefix: default_network_prefix(),
        }
    }
}

fn default_keychain_locator() -> String {
    "/var/lib/onboard-rig/keychain".to_string()
}
fn default_ca_profile() -> String {
    "/var/lib/onboard-rig/ca-profile.data".to_string()
}
fn default_network_prefix() -> String {
    "/example/onboard".to_string()
}

/// External tool path overrides
///
/// Unset tools are looked up on PATH.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ToolsConfig {
    pub authenticator: Option<PathBuf>,
    pub dumpcap: Option<PathBuf>,
    pub wpa_cli: Option<PathBuf>,
    pub ip: Option<PathBuf>,
}

/// Timeout settings in seconds
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Timeouts {
    /// How long to wait for the station to associate with an access point
    #[serde(default = "default_station_connect")]
    pub station_connect_secs: u64,

    /// Grace period for dumpcap to flush and exit after SIGINT
    #[serde(default = "default_capture_stop")]
    pub capture_stop_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            station_connect_secs: default_station_connect(),
            capture_stop_secs: default_capture_stop(),
        }
    }
}

fn default_station_connect() -> u64 {
    30
}
fn default_capture_stop() -> u64 {
    5
}

impl Config {
    /// Load configuration from `path`, or from the default config file
    ///
    /// Returns default configuration if no file exists at the default
    /// location; an explicit `path` must be readable.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => Some(path.to_path_buf()),
            None => config_path().filter(|p| p.exists()),
        };
        match path {
            Some(path) => {
                let content =
                    std::fs::read_to_string(&path).map_err(|e| Error::FileRead {
                        path: path.display().to_string(),
                        error: e.to_string(),
                    })?;
                toml::from_str(&content).map_err(|e| Error::ConfigParse(e.to_string()))
            }
            None => Ok(Self::default()),
        }
    }

    /// Resolve an external tool path
    ///
    /// Explicit configuration wins; otherwise the tool is searched on PATH.
    pub fn resolve_tool(&self, name: &str) -> Result<PathBuf> {
        let (configured, binary) = match name {
            "authenticator" => (self.tools.authenticator.as_ref(), AUTHENTICATOR_BIN),
            "dumpcap" => (self.tools.dumpcap.as_ref(), "dumpcap"),
            "wpa_cli" => (self.tools.wpa_cli.as_ref(), "wpa_cli"),
            "ip" => (self.tools.ip.as_ref(), "ip"),
            other => return Err(Error::Internal(format!("unknown tool '{other}'"))),
        };
        if let Some(path) = configured {
            return Ok(path.clone());
        }
        which::which(binary).map_err(|_| Error::ToolNotFound {
            name: binary.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.device.serial, "/dev/ttyUSB0");
        assert_eq!(config.direct_wifi.subnet, 24);
        assert_eq!(config.infra_wifi.netif, "wlan0");
        assert_eq!(config.timeouts.station_connect_secs, 30);
    }

    #[test]
    fn test_partial_config_overrides() {
        let config: Config = toml::from_str(
            r#"
            [direct_wifi]
            ssid = "lab-direct"

            [infra_wifi]
            gateway_ip = "10.0.0.1"
            "#,
        )
        .unwrap();
        assert_eq!(config.direct_wifi.ssid, "lab-direct");
        assert_eq!(config.direct_wifi.netif, "wlan1");
        assert_eq!(config.infra_wifi.gateway_ip, "10.0.0.1");
    }

    #[test]
    fn test_console_argv_substitutes_serial() {
        let mut config = DeviceConfig::default();
        config.serial = "/dev/ttyACM3".to_string();
        let argv = config.console_argv();
        assert!(argv.iter().any(|a| a.contains("/dev/ttyACM3")));
        assert!(!argv.iter().any(|a| a.contains("{serial}")));
    }

    #[test]
    fn test_resolve_tool_prefers_override() {
        let mut config = Config::default();
        config.tools.dumpcap = Some(PathBuf::from("/opt/wireshark/bin/dumpcap"));
        let path = config.resolve_tool("dumpcap").unwrap();
        assert_eq!(path, PathBuf::from("/opt/wireshark/bin/dumpcap"));
    }

    #[test]
    fn test_resolve_unknown_tool_is_an_error() {
        let config = Config::default();
        assert!(config.resolve_tool("tcpdump").is_err());
    }
}
