//! Interfaces to the rest of the gateway: the registered-node list,
//! telemetry ingestion and connection status

use async_trait::async_trait;

use crate::identity::{DeviceIdentity, MacAddress};

/// A node the gateway knows about
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredDevice {
    pub node_id: String,
    #[serde(default)]
    pub ble_device_name: Option<String>,
    #[serde(default)]
    pub ble_mac_address: Option<String>,
}

impl RegisteredDevice {
    /// Registered MAC, if present and well-formed. A malformed address is
    /// logged and the device can then only match by name.
    pub fn mac(&self) -> Option<MacAddress> {
        match self.ble_mac_address.as_deref()?.parse() {
            Ok(mac) => Some(mac),
            Err(e) => {
                log::warn!("node {}: ignoring bleMacAddress: {e}", self.node_id);
                None
            }
        }
    }

    pub fn matches(&self, identity: &DeviceIdentity) -> bool {
        if self.mac() == Some(identity.mac()) {
            return true;
        }
        match (&self.ble_device_name, identity.advertised_name()) {
            (Some(registered), Some(advertised)) => registered == advertised,
            _ => false,
        }
    }
}

/// One measurement handed to ingestion
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Reading {
    pub device_id: String,
    pub measurement_type: String,
    pub value: f64,
    pub unit: String,
    /// Unix seconds
    pub timestamp: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum ConnectionStatus {
    Active,
    Inactive,
}

#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    async fn registered_devices(&self) -> anyhow::Result<Vec<RegisteredDevice>>;
}

#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn ingest(&self, reading: Reading) -> anyhow::Result<()>;
}

#[async_trait]
pub trait StatusReporter: Send + Sync {
    async fn report(&self, device_id: &str, status: ConnectionStatus) -> anyhow::Result<()>;
}

/// Fixed registered-node list
#[async_trait]
impl DeviceDirectory for Vec<RegisteredDevice> {
    async fn registered_devices(&self) -> anyhow::Result<Vec<RegisteredDevice>> {
        Ok(self.clone())
    }
}

/// Status reporter that only logs
pub struct LogStatus;

#[async_trait]
impl StatusReporter for LogStatus {
    async fn report(&self, device_id: &str, status: ConnectionStatus) -> anyhow::Result<()> {
        log::info!("node {device_id} is now {status:?}");
        Ok(())
    }
}
