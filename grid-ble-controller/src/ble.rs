//! btleplug transport: BlueZ on linux, CoreBluetooth on macos, WinRT on windows

use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use log::{debug, info};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::TransportError;
use crate::identity::{DeviceIdentity, MacAddress};
use crate::transport::{Advertisement, BleAdapter, GattLink, GattService, NotificationStream};

pub struct BtleAdapter {
    adapter: Adapter,
    /// Scanning and connecting share the radio; many stacks misbehave when
    /// both run at once.
    radio: Mutex<()>,
}

impl BtleAdapter {
    /// First adapter whose name contains `name_filter`, or the first adapter.
    pub async fn first(name_filter: Option<&str>) -> Result<Self, TransportError> {
        let manager = Manager::new().await?;
        for adapter in manager.adapters().await? {
            let info = adapter.adapter_info().await?;
            if name_filter.is_none_or(|filter| info.contains(filter)) {
                info!("using bluetooth adapter {info}");
                return Ok(Self {
                    adapter,
                    radio: Mutex::new(()),
                });
            }
        }
        Err(TransportError::NotFound("bluetooth adapter".to_string()))
    }

    async fn find(&self, mac: MacAddress) -> Result<Peripheral, TransportError> {
        for peripheral in self.adapter.peripherals().await? {
            if MacAddress::new(peripheral.address().into_inner()) == mac {
                return Ok(peripheral);
            }
        }
        Err(TransportError::NotFound(mac.to_string()))
    }
}

#[async_trait]
impl BleAdapter for BtleAdapter {
    async fn scan(&self, duration: Duration) -> Result<Vec<Advertisement>, TransportError> {
        let _radio = self.radio.lock().await;
        self.adapter.start_scan(ScanFilter::default()).await?;
        tokio::time::sleep(duration).await;

        // includes devices the stack already knows (paired, connected)
        let peripherals = self.adapter.peripherals().await;
        self.adapter.stop_scan().await?;

        let mut seen = Vec::new();
        for peripheral in peripherals? {
            let Some(props) = peripheral.properties().await? else {
                continue;
            };
            seen.push(Advertisement {
                identity: DeviceIdentity::new(
                    MacAddress::new(props.address.into_inner()),
                    props.local_name,
                ),
                rssi: props.rssi,
            });
        }
        debug!("scan saw {} devices", seen.len());
        Ok(seen)
    }

    async fn connect(&self, identity: &DeviceIdentity) -> Result<Box<dyn GattLink>, TransportError> {
        let _radio = self.radio.lock().await;
        let peripheral = self.find(identity.mac()).await?;
        if !peripheral.is_connected().await? {
            peripheral.connect().await?;
        }
        Ok(Box::new(BtleLink { peripheral }))
    }
}

struct BtleLink {
    peripheral: Peripheral,
}

impl BtleLink {
    fn characteristic(&self, uuid: Uuid) -> Result<Characteristic, TransportError> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or_else(|| TransportError::NotFound(format!("characteristic {uuid}")))
    }
}

#[async_trait]
impl GattLink for BtleLink {
    async fn discover(&self) -> Result<Vec<GattService>, TransportError> {
        self.peripheral.discover_services().await?;
        Ok(self
            .peripheral
            .services()
            .into_iter()
            .map(|service| GattService {
                uuid: service.uuid,
                characteristics: service.characteristics.iter().map(|c| c.uuid).collect(),
            })
            .collect())
    }

    async fn write(&self, characteristic: Uuid, data: &[u8]) -> Result<(), TransportError> {
        let characteristic = self.characteristic(characteristic)?;
        self.peripheral
            .write(&characteristic, data, WriteType::WithResponse)
            .await?;
        Ok(())
    }

    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>, TransportError> {
        let characteristic = self.characteristic(characteristic)?;
        Ok(self.peripheral.read(&characteristic).await?)
    }

    async fn subscribe(&self, characteristic: Uuid) -> Result<NotificationStream, TransportError> {
        let uuid = characteristic;
        let characteristic = self.characteristic(uuid)?;
        let notifications = self.peripheral.notifications().await?;
        self.peripheral.subscribe(&characteristic).await?;
        Ok(Box::pin(notifications.filter_map(move |n| async move {
            (n.uuid == uuid).then_some(n.value)
        })))
    }

    async fn unsubscribe(&self, characteristic: Uuid) -> Result<(), TransportError> {
        let characteristic = self.characteristic(characteristic)?;
        self.peripheral.unsubscribe(&characteristic).await?;
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.peripheral.is_connected().await.unwrap_or(false)
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        if self.peripheral.is_connected().await? {
            self.peripheral.disconnect().await?;
        }
        Ok(())
    }
}
