//! Device identity: MAC address plus whatever name the node advertises

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// 6-byte BLE MAC address. Displays as upper-case colon-hex, parses either
/// case with `:` or `-` separators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddress([u8; 6]);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid MAC address: {0:?}")]
pub struct ParseMacError(String);

impl MacAddress {
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    pub fn bytes(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

impl FromStr for MacAddress {
    type Err = ParseMacError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let parts: Vec<&str> = s.split([':', '-']).collect();
        if parts.len() != 6 {
            return Err(ParseMacError(s.to_string()));
        }
        let mut bytes = [0u8; 6];
        for (byte, part) in bytes.iter_mut().zip(parts) {
            if part.len() != 2 {
                return Err(ParseMacError(s.to_string()));
            }
            *byte = u8::from_str_radix(part, 16).map_err(|_| ParseMacError(s.to_string()))?;
        }
        Ok(Self(bytes))
    }
}

/// Who a discovered node is. Equality and hashing only look at the MAC; the
/// advertised name is informational and may change between scans.
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    mac: MacAddress,
    advertised_name: Option<String>,
}

impl DeviceIdentity {
    pub fn new(mac: MacAddress, advertised_name: Option<String>) -> Self {
        Self {
            mac,
            advertised_name,
        }
    }

    pub fn mac(&self) -> MacAddress {
        self.mac
    }

    pub fn advertised_name(&self) -> Option<&str> {
        self.advertised_name.as_deref()
    }
}

impl PartialEq for DeviceIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.mac == other.mac
    }
}

impl Eq for DeviceIdentity {}

impl Hash for DeviceIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.mac.hash(state);
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.advertised_name {
            Some(name) => write!(f, "{} ({name})", self.mac),
            None => write!(f, "{}", self.mac),
        }
    }
}
