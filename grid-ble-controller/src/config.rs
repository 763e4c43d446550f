//! Gateway BLE configuration, stored as `ble.json` in the gateway home

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

pub const CONFIG_FILE: &str = "ble.json";

/// Gateway home: `$GRID_HOME`, else `~/.grid`
pub fn grid_home() -> Result<PathBuf, ConfigError> {
    if let Ok(home) = std::env::var("GRID_HOME") {
        return Ok(PathBuf::from(home));
    }
    dirs::home_dir()
        .map(|home| home.join(".grid"))
        .ok_or(ConfigError::NoHome)
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Pause between scanner cycles
    pub scan_interval_secs: u64,
    /// How long each cycle listens for advertisements
    pub scan_duration_secs: u64,
    pub connect_timeout_ms: u64,
    /// Bound on each discover, write and read
    pub operation_timeout_ms: u64,
    /// How often the relay checks that an idle link is still up
    pub liveness_interval_secs: u64,
    /// Advertised-name prefixes that mark a device as one of ours
    pub name_prefixes: Vec<String>,
    /// Substring of the adapter name to use; first adapter if unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adapter: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            scan_interval_secs: 30,
            scan_duration_secs: 5,
            connect_timeout_ms: 15_000,
            operation_timeout_ms: 5_000,
            liveness_interval_secs: 10,
            name_prefixes: vec![grid_proto::ble::NODE_NAME_PREFIX.to_string()],
            adapter: None,
        }
    }
}

impl GatewayConfig {
    /// Load `ble.json` from `home`, writing the defaults if it does not exist.
    pub fn load_or_init(home: &Path) -> Result<Self, ConfigError> {
        let path = home.join(CONFIG_FILE);
        if !path.exists() {
            let config = Self::default();
            std::fs::create_dir_all(home).map_err(|source| ConfigError::Io {
                path: home.to_path_buf(),
                source,
            })?;
            let data = serde_json::to_string_pretty(&config).map_err(|source| {
                ConfigError::Parse {
                    path: path.clone(),
                    source,
                }
            })?;
            std::fs::write(&path, data).map_err(|source| ConfigError::Io {
                path: path.clone(),
                source,
            })?;
            return Ok(config);
        }
        Self::load(&path)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&data).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scan_duration_secs == 0 {
            return Err(ConfigError::Invalid("scan_duration_secs must be positive".into()));
        }
        if self.connect_timeout_ms == 0 || self.operation_timeout_ms == 0 {
            return Err(ConfigError::Invalid("timeouts must be positive".into()));
        }
        if self.liveness_interval_secs == 0 {
            return Err(ConfigError::Invalid("liveness_interval_secs must be positive".into()));
        }
        Ok(())
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            operation_timeout: Duration::from_millis(self.operation_timeout_ms),
        }
    }

    pub fn scanner_settings(&self) -> ScannerSettings {
        ScannerSettings {
            interval: Duration::from_secs(self.scan_interval_secs),
            scan_duration: Duration::from_secs(self.scan_duration_secs),
            liveness_interval: Duration::from_secs(self.liveness_interval_secs),
            name_prefixes: self.name_prefixes.clone(),
            session: self.session_settings(),
        }
    }
}

/// Step timeouts for a device session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    pub connect_timeout: Duration,
    pub operation_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        GatewayConfig::default().session_settings()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannerSettings {
    pub interval: Duration,
    pub scan_duration: Duration,
    pub liveness_interval: Duration,
    pub name_prefixes: Vec<String>,
    pub session: SessionSettings,
}

impl Default for ScannerSettings {
    fn default() -> Self {
        GatewayConfig::default().scanner_settings()
    }
}
