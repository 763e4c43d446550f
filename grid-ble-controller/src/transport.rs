//! Capability interface over the platform Bluetooth stack
//!
//! The session, registry and scanner only talk to these traits, so the
//! protocol logic runs the same against btleplug and the in-memory fake.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use uuid::Uuid;

use crate::error::TransportError;
use crate::identity::DeviceIdentity;

/// Raw notification values from one characteristic, in delivery order
pub type NotificationStream = Pin<Box<dyn Stream<Item = Vec<u8>> + Send>>;

/// A device seen during a scan (advertising, or already known to the stack)
#[derive(Debug, Clone)]
pub struct Advertisement {
    pub identity: DeviceIdentity,
    pub rssi: Option<i16>,
}

/// A discovered GATT service and the UUIDs of its characteristics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<Uuid>,
}

/// The radio: scanning and opening links. Shared by every session and the
/// scanner.
#[async_trait]
pub trait BleAdapter: Send + Sync {
    /// Scan for `duration` and return everything seen, including devices the
    /// stack already knows about (paired or previously connected).
    async fn scan(&self, duration: Duration) -> Result<Vec<Advertisement>, TransportError>;

    /// Open a link to `identity`. Callers bound this with their own timeout.
    async fn connect(&self, identity: &DeviceIdentity) -> Result<Box<dyn GattLink>, TransportError>;
}

/// One open BLE connection.
#[async_trait]
pub trait GattLink: Send + Sync {
    async fn discover(&self) -> Result<Vec<GattService>, TransportError>;

    async fn write(&self, characteristic: Uuid, data: &[u8]) -> Result<(), TransportError>;

    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>, TransportError>;

    async fn subscribe(&self, characteristic: Uuid) -> Result<NotificationStream, TransportError>;

    async fn unsubscribe(&self, characteristic: Uuid) -> Result<(), TransportError>;

    async fn is_connected(&self) -> bool;

    /// Must be safe to call more than once.
    async fn disconnect(&self) -> Result<(), TransportError>;
}
