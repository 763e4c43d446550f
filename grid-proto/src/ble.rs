//! BLE GATT Service Protocol Constants for myIoTGrid sensor nodes
//!
//! The UUIDs below are baked into the node firmware. Changing any of them
//! makes every deployed node invisible to the gateway.

/// Config Service UUID: 4d7f1000-9c3b-4f5e-a1d2-6b8e0c7a5f10
pub const CONFIG_SERVICE_UUID: u128 = 0x4d7f1000_9c3b_4f5e_a1d2_6b8e0c7a5f10;

/// Config Write Characteristic UUID (write, read back for the response code)
pub const CONFIG_WRITE_UUID: u128 = 0x4d7f1001_9c3b_4f5e_a1d2_6b8e0c7a5f10;

/// Config Read Characteristic UUID (read)
pub const CONFIG_READ_UUID: u128 = 0x4d7f1002_9c3b_4f5e_a1d2_6b8e0c7a5f10;

/// Sensor Data Characteristic UUID (notify)
pub const SENSOR_DATA_UUID: u128 = 0x4d7f1003_9c3b_4f5e_a1d2_6b8e0c7a5f10;

/// Advertised name prefix of unprovisioned and provisioned nodes, e.g.
/// `myIoTGrid-92CC` where the suffix is the tail of the MAC address.
pub const NODE_NAME_PREFIX: &str = "myIoTGrid-";

/// Command opcodes (first byte of every config write)
pub mod opcodes {
    /// Authenticate with the 4-byte node-id hash
    pub const AUTHENTICATE: u8 = 0x00;

    pub const SET_WIFI: u8 = 0x01;

    pub const SET_HUB_URL: u8 = 0x02;

    pub const SET_NODE_ID: u8 = 0x03;

    /// Sampling interval in seconds, u32 little-endian
    pub const SET_INTERVAL: u8 = 0x04;

    /// Wipe WiFi, hub and identity settings
    pub const FACTORY_RESET: u8 = 0x05;

    /// Restart the node; the link drops shortly after the ack
    pub const REBOOT: u8 = 0x06;
}

/// Response codes (first byte read back from the config write characteristic)
pub mod responses {
    pub const OK: u8 = 0x00;
    pub const NOT_AUTHENTICATED: u8 = 0x01;
}

/// Returns true if the advertised name follows the node naming convention.
pub fn is_node_name(name: &str) -> bool {
    name.starts_with(NODE_NAME_PREFIX)
}
