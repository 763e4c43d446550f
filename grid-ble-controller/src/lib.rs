//! myIoTGrid BLE controller
//!
//! Gateway side of the sensor-node BLE link: scanning, per-device sessions
//! speaking the config protocol, provisioning, and relaying sensor data.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use grid_ble_controller::{ConnectionRegistry, GatewayConfig, LogStatus, Scanner, grid_home};
//! use grid_ble_controller::ble::BtleAdapter;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = GatewayConfig::load_or_init(&grid_home()?)?;
//!     let adapter = Arc::new(BtleAdapter::first(config.adapter.as_deref()).await?);
//!     let scanner = Scanner::new(
//!         adapter,
//!         Arc::new(ConnectionRegistry::new()),
//!         Arc::new(my_directory),
//!         Arc::new(my_sink),
//!         Arc::new(LogStatus),
//!         config.scanner_settings(),
//!     );
//!     scanner.run(tokio_util::sync::CancellationToken::new()).await;
//!     Ok(())
//! }
//! ```

#[cfg(feature = "native")]
pub mod ble;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod fake;
pub mod identity;
pub mod provision;
pub mod registry;
pub mod relay;
pub mod scanner;
pub mod session;
pub mod transport;

pub use collaborators::{
    ConnectionStatus, DeviceDirectory, LogStatus, Reading, RegisteredDevice, StatusReporter,
    TelemetrySink,
};
pub use config::{GatewayConfig, ScannerSettings, SessionSettings, grid_home};
pub use error::{ConfigError, Phase, SessionError, TransportError};
pub use identity::{DeviceIdentity, MacAddress};
pub use provision::{ProvisioningFailure, ProvisioningReport, ProvisioningRequest, ProvisioningStep, provision};
pub use registry::ConnectionRegistry;
pub use relay::{RelayExit, RelayOutcome, RelayStats};
pub use scanner::{CycleReport, DeviceMatch, Scanner, match_device};
pub use session::{DeviceSession, SETTLE_DELAY, SessionHandle, SessionState, SessionStatus};
pub use transport::{Advertisement, BleAdapter, GattLink, GattService, NotificationStream};
