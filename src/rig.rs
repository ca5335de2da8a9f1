//! Collaborator factories
//!
//! The orchestrator constructs its collaborators lazily as the protocol
//! advances; this trait is the seam where those constructors live, so tests
//! can substitute scripted collaborators for the host tools.

use std::time::Duration;

use crate::authenticator::{Authenticator, AuthenticatorOptions, CliAuthenticator};
use crate::capture::{Capture, DumpcapCapture};
use crate::common::{config::Config, Result};
use crate::device::{ConsoleDevice, DeviceLink};
use crate::wifi::{WifiStation, WpaCliStation};

/// Factory for the collaborators a run constructs
pub trait Rig: Send + Sync {
    /// Open the device link
    fn open_device(&self) -> Result<Box<dyn DeviceLink>>;

    /// Create an unconnected wifi station
    fn new_station(&self) -> Result<Box<dyn WifiStation>>;

    /// Start the PAKE authenticator
    fn new_authenticator(&self, options: AuthenticatorOptions) -> Result<Box<dyn Authenticator>>;

    /// Start a packet capture on `netif`
    fn start_capture(&self, netif: &str) -> Result<Box<dyn Capture>>;
}

/// Rig wiring the real host tools from the loaded configuration
pub struct HostRig {
    config: Config,
}

impl HostRig {
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

impl Rig for HostRig {
    fn open_device(&self) -> Result<Box<dyn DeviceLink>> {
        Ok(Box::new(ConsoleDevice::open(&self.config.device)?))
    }

    fn new_station(&self) -> Result<Box<dyn WifiStation>> {
        let wpa_cli = self.config.resolve_tool("wpa_cli")?;
        let ip = self.config.resolve_tool("ip")?;
        Ok(Box::new(WpaCliStation::new(
            wpa_cli,
            ip,
            Duration::from_secs(self.config.timeouts.station_connect_secs),
        )))
    }

    fn new_authenticator(&self, options: AuthenticatorOptions) -> Result<Box<dyn Authenticator>> {
        let bin = self.config.resolve_tool("authenticator")?;
        Ok(Box::new(CliAuthenticator::spawn(&bin, &options)?))
    }

    fn start_capture(&self, netif: &str) -> Result<Box<dyn Capture>> {
        let dumpcap = self.config.resolve_tool("dumpcap")?;
        Ok(Box::new(DumpcapCapture::start(
            &dumpcap,
            netif,
            Duration::from_secs(self.config.timeouts.capture_stop_secs),
        )?))
    }
}
