//! myIoTGrid BLE config protocol - command framing and response codes
//!
//! Everything here is pure: the codec never touches a transport. Frames must
//! stay byte-exact with the node firmware.

pub mod ble;
mod payload;

pub use payload::{GpsFix, PayloadError, SensorPayload, SensorValue};

use ble::{opcodes, responses};

/// Largest value a 1-byte length prefix can describe
pub const MAX_FIELD_LEN: usize = u8::MAX as usize;

/// Command written to the config write characteristic
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Authenticate([u8; 4]),
    SetWifi { ssid: String, password: String },
    SetHubUrl { url: String, port: u16 },
    SetNodeId(String),
    SetInterval(u32),
    FactoryReset,
    Reboot,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("{field} is {len} bytes, the protocol allows at most {MAX_FIELD_LEN}")]
    FieldTooLong { field: &'static str, len: usize },
}

impl Command {
    /// Authenticate with the hash of `node_id`.
    pub fn authenticate(node_id: &str) -> Self {
        Self::Authenticate(node_id_hash(node_id))
    }

    pub fn opcode(&self) -> u8 {
        match self {
            Command::Authenticate(_) => opcodes::AUTHENTICATE,
            Command::SetWifi { .. } => opcodes::SET_WIFI,
            Command::SetHubUrl { .. } => opcodes::SET_HUB_URL,
            Command::SetNodeId(_) => opcodes::SET_NODE_ID,
            Command::SetInterval(_) => opcodes::SET_INTERVAL,
            Command::FactoryReset => opcodes::FACTORY_RESET,
            Command::Reboot => opcodes::REBOOT,
        }
    }

    /// Short name used in logs and error messages
    pub fn name(&self) -> &'static str {
        match self {
            Command::Authenticate(_) => "authenticate",
            Command::SetWifi { .. } => "set_wifi",
            Command::SetHubUrl { .. } => "set_hub_url",
            Command::SetNodeId(_) => "set_node_id",
            Command::SetInterval(_) => "set_interval",
            Command::FactoryReset => "factory_reset",
            Command::Reboot => "reboot",
        }
    }

    /// Check that every length-prefixed field fits its 1-byte prefix.
    pub fn validate(&self) -> Result<(), CommandError> {
        match self {
            Command::SetWifi { ssid, password } => {
                check_len("ssid", ssid)?;
                check_len("password", password)
            }
            Command::SetHubUrl { url, .. } => check_len("url", url),
            Command::SetNodeId(node_id) => check_len("node_id", node_id),
            _ => Ok(()),
        }
    }

    /// Encode the command. The command must have passed [`Command::validate`];
    /// encoding itself never fails.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![self.opcode()];
        match self {
            Command::Authenticate(hash) => buf.extend_from_slice(hash),
            Command::SetWifi { ssid, password } => {
                push_prefixed(&mut buf, ssid);
                push_prefixed(&mut buf, password);
            }
            Command::SetHubUrl { url, port } => {
                push_prefixed(&mut buf, url);
                buf.extend_from_slice(&port.to_le_bytes());
            }
            Command::SetNodeId(node_id) => push_prefixed(&mut buf, node_id),
            Command::SetInterval(seconds) => buf.extend_from_slice(&seconds.to_le_bytes()),
            Command::FactoryReset | Command::Reboot => {}
        }
        buf
    }
}

fn check_len(field: &'static str, value: &str) -> Result<(), CommandError> {
    if value.len() > MAX_FIELD_LEN {
        return Err(CommandError::FieldTooLong {
            field,
            len: value.len(),
        });
    }
    Ok(())
}

fn push_prefixed(buf: &mut Vec<u8>, value: &str) {
    let bytes = &value.as_bytes()[..value.len().min(MAX_FIELD_LEN)];
    buf.push(bytes.len() as u8);
    buf.extend_from_slice(bytes);
}

/// Response code read back after a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCode {
    Ok,
    NotAuthenticated,
    /// Any other code, or an empty/garbled read. Holds the raw byte when
    /// there was one.
    Error(Option<u8>),
}

impl ResponseCode {
    /// Decode the first byte of a response. Total: empty buffers decode as
    /// `Error(None)`.
    pub fn from_bytes(data: &[u8]) -> Self {
        match data.first() {
            Some(&responses::OK) => ResponseCode::Ok,
            Some(&responses::NOT_AUTHENTICATED) => ResponseCode::NotAuthenticated,
            Some(&other) => ResponseCode::Error(Some(other)),
            None => ResponseCode::Error(None),
        }
    }

    pub fn is_ok(self) -> bool {
        self == ResponseCode::Ok
    }
}

impl std::fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResponseCode::Ok => f.write_str("ok"),
            ResponseCode::NotAuthenticated => f.write_str("not authenticated"),
            ResponseCode::Error(Some(code)) => write!(f, "error (0x{code:02x})"),
            ResponseCode::Error(None) => f.write_str("error (empty response)"),
        }
    }
}

/// Authentication credential for a node: `h = h * 31 + unit` over the UTF-16
/// code units of `node_id`, wrapping at 32 bits, big-endian.
///
/// For ASCII node ids the UTF-16 units equal the UTF-8 bytes.
pub fn node_id_hash(node_id: &str) -> [u8; 4] {
    node_id
        .encode_utf16()
        .fold(0u32, |h, unit| h.wrapping_mul(31).wrapping_add(u32::from(unit)))
        .to_be_bytes()
}
