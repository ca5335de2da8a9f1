//! Authenticator subprocess wrapper
//!
//! The PAKE exchange itself runs in an external authenticator tool; this
//! module hands it its options, streams its log output, and picks up the
//! result payload it prints when the exchange concludes. The orchestrator
//! never waits on the authenticator directly — the device reaching its
//! final state is what signals conclusion.

use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

use crate::common::{Error, Result};

/// Options for one authenticator invocation
///
/// `network_credential` is the exact payload forwarded to the device: SSID,
/// passphrase, and gateway address joined by `\n` in that order, with no
/// trailing newline.
#[derive(Debug, Clone)]
pub struct AuthenticatorOptions {
    pub device_ip: String,
    pub device_port: u16,
    /// Link MTU override; the tool's own default applies when unset
    pub mtu: Option<u16>,
    pub keychain: String,
    pub ca_profile: String,
    /// Name the device is enrolled under
    pub device_name: String,
    pub network_credential: String,
    pub pake_password: String,
}

/// Event emitted by an authenticator
#[derive(Debug)]
pub enum AuthEvent {
    /// A log line from the authenticator
    Line(String),
    /// Terminal failure; no further events follow
    Fault(Error),
}

/// Narrow interface the orchestrator needs from an authenticator
pub trait Authenticator: Send {
    /// Result payload, available once the exchange has concluded
    fn result(&self) -> Option<Value>;

    /// Take the event stream (can only be taken once)
    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<AuthEvent>>;

    /// Stop the authenticator process; idempotent
    fn close(&mut self);
}

/// Authenticator backed by the external authenticator binary
pub struct CliAuthenticator {
    child: Child,
    result: Arc<Mutex<Option<Value>>>,
    events: Option<mpsc::UnboundedReceiver<AuthEvent>>,
}

impl CliAuthenticator {
    /// Spawn the authenticator with `options`
    ///
    /// Non-secret options go on the command line; the PAKE password and the
    /// network credential are written to stdin (password line first, then
    /// the credential blob, then EOF) so they never appear in argv.
    pub fn spawn(bin: &Path, options: &AuthenticatorOptions) -> Result<Self> {
        let mut cmd = Command::new(bin);
        cmd.arg("--device-ip")
            .arg(&options.device_ip)
            .arg("--device-port")
            .arg(options.device_port.to_string())
            .arg("--keychain")
            .arg(&options.keychain)
            .arg("--ca-profile")
            .arg(&options.ca_profile)
            .arg("--device-name")
            .arg(&options.device_name)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        if let Some(mtu) = options.mtu {
            cmd.arg("--mtu").arg(mtu.to_string());
        }

        let mut child = cmd.spawn().map_err(|e| {
            Error::authenticator(format!("failed to start {}: {e}", bin.display()))
        })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::authenticator("failed to get authenticator stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::authenticator("failed to get authenticator stdout"))?;

        let secrets = format!("{}\n{}", options.pake_password, options.network_credential);
        tokio::spawn(async move {
            let _ = stdin.write_all(secrets.as_bytes()).await;
            let _ = stdin.shutdown().await;
        });

        let (tx, rx) = mpsc::unbounded_channel();
        let result = Arc::new(Mutex::new(None));
        tokio::spawn(read_output(BufReader::new(stdout), tx, Arc::clone(&result)));

        Ok(Self {
            child,
            result,
            events: Some(rx),
        })
    }
}

impl Authenticator for CliAuthenticator {
    fn result(&self) -> Option<Value> {
        self.result
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<AuthEvent>> {
        self.events.take()
    }

    fn close(&mut self) {
        let _ = self.child.start_kill();
    }
}

impl Drop for CliAuthenticator {
    fn drop(&mut self) {
        // Best-effort since we can't await in drop
        let _ = self.child.start_kill();
    }
}

/// Pump authenticator output into events until EOF
///
/// A `result=` line records the exchange result; EOF without one means the
/// tool died before finishing, which is terminal for the run.
async fn read_output<R: AsyncBufRead + Unpin>(
    reader: R,
    tx: mpsc::UnboundedSender<AuthEvent>,
    result: Arc<Mutex<Option<Value>>>,
) {
    let mut lines = reader.lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim_end();
                if let Some(json) = line.strip_prefix("result=") {
                    match serde_json::from_str(json) {
                        Ok(value) => {
                            *result.lock().unwrap_or_else(PoisonError::into_inner) = Some(value);
                        }
                        Err(e) => {
                            let _ = tx.send(AuthEvent::Fault(Error::authenticator(format!(
                                "bad result line: {e}"
                            ))));
                            break;
                        }
                    }
                } else if !line.is_empty() && tx.send(AuthEvent::Line(line.to_string())).is_err() {
                    break;
                }
            }
            Ok(None) => {
                let concluded = result
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .is_some();
                if !concluded {
                    let _ = tx.send(AuthEvent::Fault(Error::authenticator(
                        "exited before the run completed",
                    )));
                }
                break;
            }
            Err(e) => {
                let _ = tx.send(AuthEvent::Fault(Error::authenticator(format!(
                    "output read failed: {e}"
                ))));
                break;
            }
        }
    }
}
