//! Device link over the serial console
//!
//! The device under test announces its lifecycle on its serial console as
//! `key=value` lines:
//!
//! ```text
//! program=direct-wifi,infra-wifi
//! password=481263
//! state=wait-direct-connect
//! result={"pakeOk":true}
//! ```
//!
//! This module spawns the configured console command, parses those lines
//! into lifecycle events on a background task, and records the identifying
//! fields the orchestrator reads back later (program, PAKE password, result
//! payload). Anything that is not part of the key-value protocol is
//! forwarded verbatim as a log line.

use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

use crate::common::{config::DeviceConfig, Error, Result};

/// Device lifecycle checkpoints, in protocol order
///
/// The orchestrator acts on five of these (direct connect, pake, direct
/// disconnect, infra connect, final); the rest are bookkeeping states the
/// device passes through between checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AppState {
    Idle,
    WaitDirectConnect,
    WaitPake,
    WaitCredential,
    WaitDirectDisconnect,
    WaitInfraConnect,
    WaitPing,
    Final,
}

impl AppState {
    /// Parse a state name as printed by the device console
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "idle" => Some(Self::Idle),
            "wait-direct-connect" => Some(Self::WaitDirectConnect),
            "wait-pake" => Some(Self::WaitPake),
            "wait-credential" => Some(Self::WaitCredential),
            "wait-direct-disconnect" => Some(Self::WaitDirectDisconnect),
            "wait-infra-connect" => Some(Self::WaitInfraConnect),
            "wait-ping" => Some(Self::WaitPing),
            "final" => Some(Self::Final),
            _ => None,
        }
    }
}

impl std::fmt::Display for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::WaitDirectConnect => write!(f, "wait-direct-connect"),
            Self::WaitPake => write!(f, "wait-pake"),
            Self::WaitCredential => write!(f, "wait-credential"),
            Self::WaitDirectDisconnect => write!(f, "wait-direct-disconnect"),
            Self::WaitInfraConnect => write!(f, "wait-infra-connect"),
            Self::WaitPing => write!(f, "wait-ping"),
            Self::Final => write!(f, "final"),
        }
    }
}

/// Event emitted by a device link
#[derive(Debug)]
pub enum DeviceEvent {
    /// The device reached a lifecycle state
    State(AppState),
    /// A console line that is not part of the key-value protocol
    Line(String),
    /// Terminal failure; no further events follow
    Fault(Error),
}

/// Narrow interface the orchestrator needs from a device link
pub trait DeviceLink: Send {
    /// Capability tags declared by the device, in announcement order
    fn program(&self) -> Vec<String>;

    /// PAKE password shown by the device
    fn password(&self) -> String;

    /// Device-side result payload; JSON null until announced
    fn result(&self) -> Value;

    /// Take the event stream (can only be taken once)
    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<DeviceEvent>>;

    /// Stop the console reader; idempotent
    fn close(&mut self);
}

/// Fields the device announces about itself during a run
#[derive(Default)]
struct DeviceInfo {
    program: Vec<String>,
    password: String,
    result: Option<Value>,
}

/// Device link reading the serial console through a subprocess
pub struct ConsoleDevice {
    child: Child,
    info: Arc<Mutex<DeviceInfo>>,
    events: Option<mpsc::UnboundedReceiver<DeviceEvent>>,
}

impl ConsoleDevice {
    /// Spawn the console command for the configured device
    pub fn open(config: &DeviceConfig) -> Result<Self> {
        let argv = config.console_argv();
        let (bin, args) = argv
            .split_first()
            .ok_or_else(|| Error::Config("device console command is empty".to_string()))?;

        let mut child = Command::new(bin)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| Error::device(format!("failed to spawn console '{bin}': {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::device("failed to get console stdout"))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let info = Arc::new(Mutex::new(DeviceInfo::default()));
        tokio::spawn(read_console(BufReader::new(stdout), tx, Arc::clone(&info)));

        Ok(Self {
            child,
            info,
            events: Some(rx),
        })
    }

    fn info(&self) -> std::sync::MutexGuard<'_, DeviceInfo> {
        self.info.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl DeviceLink for ConsoleDevice {
    fn program(&self) -> Vec<String> {
        self.info().program.clone()
    }

    fn password(&self) -> String {
        self.info().password.clone()
    }

    fn result(&self) -> Value {
        self.info().result.clone().unwrap_or(Value::Null)
    }

    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<DeviceEvent>> {
        self.events.take()
    }

    fn close(&mut self) {
        let _ = self.child.start_kill();
    }
}

impl Drop for ConsoleDevice {
    fn drop(&mut self) {
        // Best-effort since we can't await in drop
        let _ = self.child.start_kill();
    }
}

/// Pump console lines into events until EOF or a read error
async fn read_console<R: AsyncBufRead + Unpin>(
    reader: R,
    tx: mpsc::UnboundedSender<DeviceEvent>,
    info: Arc<Mutex<DeviceInfo>>,
) {
    let mut lines = reader.lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if let Some(event) = parse_line(line.trim_end(), &info) {
                    if tx.send(event).is_err() {
                        break;
                    }
                }
            }
            Ok(None) => {
                let _ = tx.send(DeviceEvent::Fault(Error::DeviceLinkClosed));
                break;
            }
            Err(e) => {
                let _ = tx.send(DeviceEvent::Fault(Error::device(format!(
                    "console read failed: {e}"
                ))));
                break;
            }
        }
    }
}

/// Parse one console line; identity lines update `info` and produce no event
fn parse_line(line: &str, info: &Mutex<DeviceInfo>) -> Option<DeviceEvent> {
    if line.is_empty() {
        return None;
    }
    let mut info = info.lock().unwrap_or_else(PoisonError::into_inner);

    if let Some(name) = line.strip_prefix("state=") {
        return match AppState::parse(name.trim()) {
            Some(state) => Some(DeviceEvent::State(state)),
            // A state this rig doesn't know about; surface it as a log line
            None => Some(DeviceEvent::Line(line.to_string())),
        };
    }
    if let Some(tags) = line.strip_prefix("program=") {
        info.program = tags
            .split(',')
            .map(|tag| tag.trim().to_string())
            .filter(|tag| !tag.is_empty())
            .collect();
        return None;
    }
    if let Some(password) = line.strip_prefix("password=") {
        info.password = password.trim().to_string();
        return None;
    }
    if let Some(json) = line.strip_prefix("result=") {
        return match serde_json::from_str(json) {
            Ok(value) => {
                info.result = Some(value);
                None
            }
            Err(e) => Some(DeviceEvent::Line(format!("bad result line: {e}"))),
        };
    }
    Some(DeviceEvent::Line(line.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str, info: &Mutex<DeviceInfo>) -> Option<DeviceEvent> {
        parse_line(line, info)
    }

    #[test]
    fn test_state_names_round_trip() {
        for state in [
            AppState::Idle,
            AppState::WaitDirectConnect,
            AppState::WaitPake,
            AppState::WaitCredential,
            AppState::WaitDirectDisconnect,
            AppState::WaitInfraConnect,
            AppState::WaitPing,
            AppState::Final,
        ] {
            assert_eq!(AppState::parse(&state.to_string()), Some(state));
        }
        assert_eq!(AppState::parse("wait-unknown"), None);
    }

    #[test]
    fn test_states_are_ordered() {
        assert!(AppState::WaitDirectConnect < AppState::WaitPake);
        assert!(AppState::WaitPake < AppState::WaitDirectDisconnect);
        assert!(AppState::WaitDirectDisconnect < AppState::WaitInfraConnect);
        assert!(AppState::WaitInfraConnect < AppState::Final);
    }

    #[test]
    fn test_parse_state_line() {
        let info = Mutex::new(DeviceInfo::default());
        match parse("state=wait-pake", &info) {
            Some(DeviceEvent::State(AppState::WaitPake)) => {}
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_state_becomes_log_line() {
        let info = Mutex::new(DeviceInfo::default());
        match parse("state=wait-frobnicate", &info) {
            Some(DeviceEvent::Line(line)) => assert_eq!(line, "state=wait-frobnicate"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_identity_lines_update_info() {
        let info = Mutex::new(DeviceInfo::default());
        assert!(parse("program=direct-wifi, infra-wifi", &info).is_none());
        assert!(parse("password=481263", &info).is_none());
        assert!(parse(r#"result={"ok":true}"#, &info).is_none());

        let info = info.lock().unwrap();
        assert_eq!(info.program, vec!["direct-wifi", "infra-wifi"]);
        assert_eq!(info.password, "481263");
        assert_eq!(info.result.as_ref().unwrap()["ok"], true);
    }

    #[test]
    fn test_other_lines_are_forwarded() {
        let info = Mutex::new(DeviceInfo::default());
        match parse("booting radio firmware", &info) {
            Some(DeviceEvent::Line(line)) => assert_eq!(line, "booting radio firmware"),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(parse("", &info).is_none());
    }
}
