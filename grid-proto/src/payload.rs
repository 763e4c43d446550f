//! Sensor data notification payloads

use serde::Deserialize;

/// One notification from the sensor data characteristic
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorPayload {
    pub node_id: String,
    /// Unix seconds as measured by the node, if it has a clock
    #[serde(default)]
    pub timestamp: Option<f64>,
    pub sensors: Vec<SensorValue>,
    #[serde(default)]
    pub gps: Option<GpsFix>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SensorValue {
    #[serde(rename = "type")]
    pub sensor_type: String,
    pub value: f64,
    #[serde(default)]
    pub unit: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GpsFix {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub altitude: Option<f64>,
    #[serde(default)]
    pub satellites: Option<u32>,
    #[serde(default)]
    pub speed: Option<f64>,
    #[serde(default)]
    pub hdop: Option<f64>,
}

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("empty payload")]
    Empty,
    #[error("payload is not UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("invalid sensor payload: {0}")]
    Json(#[from] serde_json::Error),
}

impl SensorPayload {
    /// Parse a raw notification. Trailing NUL padding and whitespace are
    /// ignored; anything else malformed is an error, never a panic.
    pub fn parse(data: &[u8]) -> Result<Self, PayloadError> {
        let end = data
            .iter()
            .rposition(|b| *b != 0 && !b.is_ascii_whitespace())
            .map_or(0, |i| i + 1);
        let data = &data[..end];
        if data.is_empty() {
            return Err(PayloadError::Empty);
        }
        let text = std::str::from_utf8(data)?;
        Ok(serde_json::from_str(text)?)
    }

    /// Timestamp as whole unix seconds, if present and sane.
    pub fn timestamp_secs(&self) -> Option<u64> {
        self.timestamp
            .filter(|t| t.is_finite() && *t >= 0.0)
            .map(|t| t as u64)
    }
}
