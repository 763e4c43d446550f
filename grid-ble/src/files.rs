//! File-backed collaborators for running the gateway standalone

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;

use grid_ble_controller::{DeviceDirectory, Reading, RegisteredDevice, TelemetrySink};

pub const DEVICES_FILE: &str = "devices.json";

/// Registered nodes from a JSON array on disk, re-read on every lookup so
/// edits take effect on the next scan cycle.
pub struct JsonDeviceDirectory {
    path: PathBuf,
}

impl JsonDeviceDirectory {
    pub fn new(home: &Path) -> Self {
        Self {
            path: home.join(DEVICES_FILE),
        }
    }
}

#[async_trait]
impl DeviceDirectory for JsonDeviceDirectory {
    async fn registered_devices(&self) -> anyhow::Result<Vec<RegisteredDevice>> {
        if !tokio::fs::try_exists(&self.path).await.unwrap_or(false) {
            log::debug!("{} not found, no registered devices", self.path.display());
            return Ok(Vec::new());
        }
        let data = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading {}", self.path.display()))?;
        serde_json::from_str(&data).with_context(|| format!("parsing {}", self.path.display()))
    }
}

/// Readings as JSON lines on stdout
pub struct StdoutSink;

#[async_trait]
impl TelemetrySink for StdoutSink {
    async fn ingest(&self, reading: Reading) -> anyhow::Result<()> {
        let line = serde_json::to_string(&reading)?;
        let mut out = std::io::stdout().lock();
        writeln!(out, "{line}")?;
        Ok(())
    }
}

/// WiFi credentials file: SSID on line 1, password on line 2
pub fn read_wifi_credentials(path: &Path) -> anyhow::Result<(String, String)> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let mut lines = content.lines();
    let ssid = lines
        .next()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .context("missing SSID in credentials file")?;
    let password = lines
        .next()
        .map(str::trim)
        .context("missing password in credentials file")?;
    Ok((ssid.to_string(), password.to_string()))
}
