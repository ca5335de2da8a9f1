//! Packet capture subprocess wrapper
//!
//! Wraps a `dumpcap` child writing to a scratch file. Capturing starts at
//! construction; closing stops the child and loads the captured bytes into
//! memory so they survive the scratch file's removal.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempPath;
use tokio::process::{Child, Command};

use crate::common::{Error, Result};

/// Narrow interface the orchestrator needs from a capture session
#[async_trait]
pub trait Capture: Send {
    /// Stop capturing and load the captured bytes; idempotent
    async fn close(&mut self) -> Result<()>;

    /// Captured traffic, available after `close`
    fn pcap(&self) -> Option<&[u8]>;
}

/// Capture session backed by a dumpcap child process
pub struct DumpcapCapture {
    netif: String,
    child: Option<Child>,
    file: TempPath,
    stop_timeout: Duration,
    pcap: Option<Vec<u8>>,
}

impl DumpcapCapture {
    /// Start capturing on `netif`
    pub fn start(dumpcap: &Path, netif: &str, stop_timeout: Duration) -> Result<Self> {
        let file = tempfile::Builder::new()
            .prefix("onboard-rig-")
            .suffix(".pcapng")
            .tempfile()
            .map_err(|e| Error::capture(netif, format!("failed to create capture file: {e}")))?
            .into_temp_path();

        let child = Command::new(dumpcap)
            .arg("-i")
            .arg(netif)
            .arg("-w")
            .arg(file.as_os_str())
            .arg("-q")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| Error::capture(netif, format!("failed to start dumpcap: {e}")))?;

        Ok(Self {
            netif: netif.to_string(),
            child: Some(child),
            file,
            stop_timeout,
            pcap: None,
        })
    }
}

#[async_trait]
impl Capture for DumpcapCapture {
    async fn close(&mut self) -> Result<()> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };

        // SIGINT lets dumpcap flush a well-formed capture before exiting
        #[cfg(unix)]
        if let Some(pid) = child.id() {
            unsafe { libc::kill(pid as i32, libc::SIGINT) };
        }

        match tokio::time::timeout(self.stop_timeout, child.wait()).await {
            Ok(Ok(_status)) => {}
            Ok(Err(e)) => {
                return Err(Error::capture(
                    &self.netif,
                    format!("failed to reap dumpcap: {e}"),
                ));
            }
            Err(_) => {
                child.kill().await.map_err(|e| {
                    Error::capture(&self.netif, format!("failed to kill dumpcap: {e}"))
                })?;
            }
        }

        let bytes = tokio::fs::read(&self.file).await.map_err(|e| {
            Error::capture(&self.netif, format!("failed to read capture file: {e}"))
        })?;
        self.pcap = Some(bytes);
        Ok(())
    }

    fn pcap(&self) -> Option<&[u8]> {
        self.pcap.as_deref()
    }
}

impl Drop for DumpcapCapture {
    fn drop(&mut self) {
        // Best-effort since we can't await in drop
        if let Some(child) = &mut self.child {
            let _ = child.start_kill();
        }
    }
}
