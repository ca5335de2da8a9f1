//! Run orchestrator
//!
//! One run steps the device from direct-link establishment through the PAKE
//! exchange to the infrastructure handoff, capturing traffic on both
//! interfaces. The device console drives everything: each lifecycle
//! checkpoint triggers exactly one action here, and whichever way the run
//! ends — final state, action failure, or a collaborator fault — the same
//! cleanup releases every resource the run acquired before the caller sees
//! the outcome.

use std::io::Write;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::authenticator::{AuthEvent, Authenticator, AuthenticatorOptions};
use crate::capture::Capture;
use crate::common::{config::Config, Error, Result};
use crate::device::{AppState, DeviceEvent, DeviceLink};
use crate::rig::Rig;
use crate::wifi::{StationParams, WifiStation};

/// Protocol port the authenticator dials on the device's direct address
const DEVICE_PORT: u16 = 6363;

/// Settle time for the device's access point after it comes up
const AP_SETTLE: Duration = Duration::from_millis(1000);

/// Settle time for the capture interface before the station joins
const CAPTURE_SETTLE: Duration = Duration::from_millis(500);

/// Options for a run
#[derive(Default)]
pub struct RunOptions {
    /// Sink for device and authenticator console lines; stderr when unset
    pub logger: Option<Box<dyn Write + Send>>,
}

/// Outcome of a successful run
#[derive(Debug, Serialize)]
pub struct RunReport {
    /// Capability tags the device declared
    pub program: Vec<String>,
    /// Device-side result payload
    pub device: Value,
    /// Authenticator result payload, when an authenticator was started
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authenticator: Option<Value>,
    /// Base64 capture of the direct link
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direct_dump: Option<String>,
    /// Base64 capture of the infrastructure link
    #[serde(skip_serializing_if = "Option::is_none")]
    pub infra_dump: Option<String>,
}

/// Everything the run loop reacts to, funneled into one channel
enum RunEvent {
    Device(DeviceEvent),
    Authenticator(AuthEvent),
}

/// A single provisioning run
///
/// Single-use: `run` consumes the orchestrator, and every collaborator
/// handle it creates stays owned here until cleanup.
pub struct Run {
    config: Config,
    rig: Box<dyn Rig>,
    log: Box<dyn Write + Send>,
    device: Option<Box<dyn DeviceLink>>,
    authenticator: Option<Box<dyn Authenticator>>,
    direct_wifi: Option<Box<dyn WifiStation>>,
    direct_dump: Option<Box<dyn Capture>>,
    infra_dump: Option<Box<dyn Capture>>,
    listeners: Vec<JoinHandle<()>>,
    last_state: Option<AppState>,
    cleaned: bool,
}

impl Run {
    pub fn new(config: Config, rig: Box<dyn Rig>) -> Self {
        Self {
            config,
            rig,
            log: Box::new(std::io::stderr()),
            device: None,
            authenticator: None,
            direct_wifi: None,
            direct_dump: None,
            infra_dump: None,
            listeners: Vec::new(),
            last_state: None,
            cleaned: false,
        }
    }

    /// Perform the run
    ///
    /// Settles exactly once, and cleanup has run by the time this returns,
    /// on the success and failure paths alike.
    pub async fn run(mut self, options: RunOptions) -> Result<RunReport> {
        if let Some(logger) = options.logger {
            self.log = logger;
        }

        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut device = self.rig.open_device()?;
        let events = device
            .take_events()
            .ok_or_else(|| Error::Internal("device event stream already taken".to_string()))?;
        self.listeners.push(forward_device(events, tx.clone()));
        self.device = Some(device);

        let outcome = loop {
            let Some(event) = rx.recv().await else {
                break Err(Error::DeviceLinkClosed);
            };
            match event {
                RunEvent::Device(DeviceEvent::State(state)) => {
                    match self.on_state(state, &tx).await {
                        Ok(Some(report)) => break Ok(report),
                        Ok(None) => {}
                        Err(err) => break Err(err),
                    }
                }
                RunEvent::Device(DeviceEvent::Line(line)) => self.log_line("device", &line),
                RunEvent::Device(DeviceEvent::Fault(err)) => break Err(err),
                RunEvent::Authenticator(AuthEvent::Line(line)) => {
                    self.log_line("authenticator", &line)
                }
                RunEvent::Authenticator(AuthEvent::Fault(err)) => break Err(err),
            }
        };

        let outcome = match outcome {
            Ok(report) => Ok(report),
            Err(err) => {
                // First error wins; a cleanup failure here is secondary
                if let Err(cleanup_err) = self.cleanup().await {
                    tracing::warn!(error = %cleanup_err, "cleanup failed after run error");
                }
                Err(err)
            }
        };

        for listener in &self.listeners {
            listener.abort();
        }
        outcome
    }

    /// Dispatch one device state to its action
    async fn on_state(
        &mut self,
        state: AppState,
        tx: &mpsc::UnboundedSender<RunEvent>,
    ) -> Result<Option<RunReport>> {
        tracing::debug!(%state, "device state");
        if is_checkpoint(state) {
            if self.last_state.is_some_and(|prev| prev >= state) {
                return Err(Error::ProtocolViolation {
                    state: state.to_string(),
                });
            }
            self.last_state = Some(state);
        }
        match state {
            AppState::WaitDirectConnect => self.direct_connect().await?,
            AppState::WaitPake => self.start_authenticator(tx)?,
            AppState::WaitDirectDisconnect => self.direct_disconnect().await?,
            AppState::WaitInfraConnect => self.start_infra_dump()?,
            AppState::Final => return self.finish().await.map(Some),
            _ => {}
        }
        Ok(None)
    }

    /// Join the device's direct link, capturing it from the first beacon
    async fn direct_connect(&mut self) -> Result<()> {
        let program = match &self.device {
            Some(device) => device.program(),
            None => return Err(Error::Internal("device link missing".to_string())),
        };

        if program.iter().any(|tag| tag == "direct-wifi") {
            // The device's access point needs a moment to come up, and the
            // capture another before packets land reliably
            tokio::time::sleep(AP_SETTLE).await;
            self.direct_dump = Some(self.rig.start_capture(&self.config.direct_wifi.netif)?);
            tokio::time::sleep(CAPTURE_SETTLE).await;

            let direct = &self.config.direct_wifi;
            let params = StationParams {
                ctrl: direct.ctrl.clone(),
                netif: direct.netif.clone(),
                ssid: direct.ssid.clone(),
                passphrase: direct.passphrase.clone(),
                local_ip: format!("{}/{}", direct.auth_ip, direct.subnet),
            };

            let mut station = self.rig.new_station()?;
            let connected = station.connect(&params).await;
            // Keep the handle even on failure so cleanup can tear it down
            self.direct_wifi = Some(station);
            connected
        } else if program.iter().any(|tag| tag == "direct-ble") {
            Err(Error::NotImplemented("direct-ble".to_string()))
        } else {
            Err(Error::UnknownDirectMethod {
                program: program.join(","),
            })
        }
    }

    /// Start the PAKE exchange
    ///
    /// Its conclusion is observed through the device reaching the final
    /// state, never awaited here.
    fn start_authenticator(&mut self, tx: &mpsc::UnboundedSender<RunEvent>) -> Result<()> {
        let password = match &self.device {
            Some(device) => device.password(),
            None => return Err(Error::Internal("device link missing".to_string())),
        };

        let options = AuthenticatorOptions {
            device_ip: self.config.direct_wifi.device_ip.clone(),
            device_port: DEVICE_PORT,
            mtu: None,
            keychain: self.config.keychain.locator.clone(),
            ca_profile: self.config.keychain.ca_profile.clone(),
            device_name: device_name(&self.config.keychain.network_prefix),
            // Exact on-wire payload: three fields, two separators, no
            // trailing newline
            network_credential: format!(
                "{}\n{}\n{}",
                self.config.infra_wifi.ssid,
                self.config.infra_wifi.passphrase,
                self.config.infra_wifi.gateway_ip
            ),
            pake_password: password,
        };

        let mut authenticator = self.rig.new_authenticator(options)?;
        if let Some(events) = authenticator.take_events() {
            self.listeners.push(forward_authenticator(events, tx.clone()));
        }
        self.authenticator = Some(authenticator);
        Ok(())
    }

    /// Leave the device's access point before it tears the link down
    async fn direct_disconnect(&mut self) -> Result<()> {
        if let Some(station) = &mut self.direct_wifi {
            station.disconnect().await?;
        }
        Ok(())
    }

    /// Start capturing the infrastructure interface
    fn start_infra_dump(&mut self) -> Result<()> {
        self.infra_dump = Some(self.rig.start_capture(&self.config.infra_wifi.netif)?);
        Ok(())
    }

    /// Assemble the report
    ///
    /// Resources are released first so the captures are complete when they
    /// land in the report; a cleanup failure here fails the run.
    async fn finish(&mut self) -> Result<RunReport> {
        self.cleanup().await?;

        let device = match &self.device {
            Some(device) => device,
            None => return Err(Error::Internal("device link missing".to_string())),
        };
        Ok(RunReport {
            program: device.program(),
            device: device.result(),
            authenticator: self.authenticator.as_ref().and_then(|a| a.result()),
            direct_dump: self
                .direct_dump
                .as_ref()
                .and_then(|c| c.pcap())
                .map(|bytes| BASE64.encode(bytes)),
            infra_dump: self
                .infra_dump
                .as_ref()
                .and_then(|c| c.pcap())
                .map(|bytes| BASE64.encode(bytes)),
        })
    }

    /// Release everything the run acquired; runs exactly once
    ///
    /// Handles that were never constructed are skipped. Every step is
    /// attempted even after one fails; the first failure is the one
    /// reported.
    async fn cleanup(&mut self) -> Result<()> {
        if std::mem::replace(&mut self.cleaned, true) {
            return Ok(());
        }

        if let Some(device) = &mut self.device {
            device.close();
        }
        if let Some(authenticator) = &mut self.authenticator {
            authenticator.close();
        }

        let mut first_err = None;
        if let Some(station) = &mut self.direct_wifi {
            if let Err(err) = station.disconnect().await {
                first_err.get_or_insert(err);
            }
        }
        if let Some(dump) = &mut self.direct_dump {
            if let Err(err) = dump.close().await {
                first_err.get_or_insert(err);
            }
        }
        if let Some(dump) = &mut self.infra_dump {
            if let Err(err) = dump.close().await {
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn log_line(&mut self, origin: &str, line: &str) {
        let _ = writeln!(self.log, "{origin} {line}");
    }
}

/// Whether the orchestrator acts on this state
fn is_checkpoint(state: AppState) -> bool {
    matches!(
        state,
        AppState::WaitDirectConnect
            | AppState::WaitPake
            | AppState::WaitDirectDisconnect
            | AppState::WaitInfraConnect
            | AppState::Final
    )
}

/// Name the device is enrolled under: the network prefix plus a time-based
/// unique suffix
fn device_name(network_prefix: &str) -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    format!("{network_prefix}/d{millis}")
}

/// Funnel device events into the run loop
fn forward_device(
    mut events: mpsc::UnboundedReceiver<DeviceEvent>,
    tx: mpsc::UnboundedSender<RunEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if tx.send(RunEvent::Device(event)).is_err() {
                break;
            }
        }
    })
}

/// Funnel authenticator events into the run loop
fn forward_authenticator(
    mut events: mpsc::UnboundedReceiver<AuthEvent>,
    tx: mpsc::UnboundedSender<RunEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if tx.send(RunEvent::Authenticator(event)).is_err() {
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoints_are_the_five_dispatched_states() {
        assert!(is_checkpoint(AppState::WaitDirectConnect));
        assert!(is_checkpoint(AppState::WaitPake));
        assert!(is_checkpoint(AppState::WaitDirectDisconnect));
        assert!(is_checkpoint(AppState::WaitInfraConnect));
        assert!(is_checkpoint(AppState::Final));
        assert!(!is_checkpoint(AppState::Idle));
        assert!(!is_checkpoint(AppState::WaitCredential));
        assert!(!is_checkpoint(AppState::WaitPing));
    }

    #[test]
    fn test_device_name_carries_prefix_and_marker() {
        let name = device_name("/example/onboard");
        assert!(name.starts_with("/example/onboard/d"));
        assert!(name.len() > "/example/onboard/d".len());
    }
}
