//! In-memory BLE adapter for tests and dry runs
//!
//! A [`FakeNode`] behaves like the node firmware as seen through GATT:
//! commands are written to the config write characteristic and the response
//! code is read back from it, authentication is checked against the node-id
//! hash, and sensor data is pushed through notification streams.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc;
use uuid::Uuid;

use grid_proto::ble::{
    CONFIG_READ_UUID, CONFIG_SERVICE_UUID, CONFIG_WRITE_UUID, SENSOR_DATA_UUID, opcodes, responses,
};

use crate::collaborators::{ConnectionStatus, Reading, StatusReporter, TelemetrySink};
use crate::error::TransportError;
use crate::identity::{DeviceIdentity, MacAddress};
use crate::transport::{Advertisement, BleAdapter, GattLink, GattService, NotificationStream};

/// Fake radio holding a set of scripted nodes
#[derive(Default)]
pub struct FakeAdapter {
    nodes: Mutex<Vec<Arc<FakeNode>>>,
    scans: Mutex<usize>,
    fail_scans: Mutex<bool>,
}

impl FakeAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&self, node: Arc<FakeNode>) {
        lock(&self.nodes).push(node);
    }

    pub fn scan_count(&self) -> usize {
        *lock(&self.scans)
    }

    /// Make every following scan fail with a backend error.
    pub fn fail_scans(&self, fail: bool) {
        *lock(&self.fail_scans) = fail;
    }

    fn find(&self, mac: MacAddress) -> Option<Arc<FakeNode>> {
        lock(&self.nodes)
            .iter()
            .find(|node| node.identity.mac() == mac)
            .cloned()
    }
}

#[async_trait]
impl BleAdapter for FakeAdapter {
    async fn scan(&self, duration: Duration) -> Result<Vec<Advertisement>, TransportError> {
        tokio::time::sleep(duration).await;
        *lock(&self.scans) += 1;
        if *lock(&self.fail_scans) {
            return Err(TransportError::Backend("adapter powered off".to_string()));
        }

        Ok(lock(&self.nodes)
            .iter()
            .filter(|node| node.state().advertising)
            .map(|node| Advertisement {
                identity: node.identity.clone(),
                rssi: Some(-60),
            })
            .collect())
    }

    async fn connect(&self, identity: &DeviceIdentity) -> Result<Box<dyn GattLink>, TransportError> {
        let node = self
            .find(identity.mac())
            .ok_or_else(|| TransportError::NotFound(identity.mac().to_string()))?;

        let behavior = node.state().connect;
        match behavior {
            ConnectBehavior::Accept => {}
            ConnectBehavior::Refuse => {
                return Err(TransportError::Backend("connection refused".to_string()));
            }
            ConnectBehavior::Hang => std::future::pending::<()>().await,
        }

        let generation = {
            let mut state = node.state();
            state.generation += 1;
            state.connected = true;
            state.authenticated = false;
            state.connect_count += 1;
            state.generation
        };
        Ok(Box::new(FakeLink { node, generation }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectBehavior {
    Accept,
    Refuse,
    Hang,
}

/// GATT operations a node can be told to never answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stall {
    Discover,
    Write(u8),
    ResponseRead,
    LinkCheck,
}

struct NodeState {
    services: Vec<GattService>,
    advertising: bool,
    connect: ConnectBehavior,
    stalls: Vec<Stall>,
    connected: bool,
    generation: u64,
    expected_hash: Option<[u8; 4]>,
    authenticated: bool,
    overrides: HashMap<u8, Vec<u8>>,
    response: Option<Vec<u8>>,
    reboot_pending: bool,
    config_blob: Vec<u8>,
    written: Vec<Vec<u8>>,
    subscribers: Vec<mpsc::UnboundedSender<Vec<u8>>>,
    connect_count: usize,
    disconnect_count: usize,
}

/// Scripted sensor node
pub struct FakeNode {
    identity: DeviceIdentity,
    state: Mutex<NodeState>,
}

impl FakeNode {
    /// A well-behaved node with the full config service that accepts any
    /// node-id hash.
    pub fn new(mac: MacAddress, name: Option<&str>) -> Self {
        let service = GattService {
            uuid: Uuid::from_u128(CONFIG_SERVICE_UUID),
            characteristics: vec![
                Uuid::from_u128(CONFIG_WRITE_UUID),
                Uuid::from_u128(CONFIG_READ_UUID),
                Uuid::from_u128(SENSOR_DATA_UUID),
            ],
        };
        Self {
            identity: DeviceIdentity::new(mac, name.map(str::to_string)),
            state: Mutex::new(NodeState {
                services: vec![service],
                advertising: true,
                connect: ConnectBehavior::Accept,
                stalls: Vec::new(),
                connected: false,
                generation: 0,
                expected_hash: None,
                authenticated: false,
                overrides: HashMap::new(),
                response: None,
                reboot_pending: false,
                config_blob: Vec::new(),
                written: Vec::new(),
                subscribers: Vec::new(),
                connect_count: 0,
                disconnect_count: 0,
            }),
        }
    }

    /// Only accept authentication with the hash of `node_id`.
    pub fn expect_node_id(self, node_id: &str) -> Self {
        self.state().expected_hash = Some(grid_proto::node_id_hash(node_id));
        self
    }

    /// Always answer `opcode` with `response`, whatever the auth state.
    pub fn respond(self, opcode: u8, response: &[u8]) -> Self {
        self.state().overrides.insert(opcode, response.to_vec());
        self
    }

    pub fn without_characteristic(self, uuid: u128) -> Self {
        let uuid = Uuid::from_u128(uuid);
        for service in &mut self.state().services {
            service.characteristics.retain(|c| *c != uuid);
        }
        self
    }

    /// Some other vendor's device with an unrelated service.
    pub fn foreign(self) -> Self {
        self.state().services = vec![GattService {
            uuid: Uuid::from_u128(0x0000180f_0000_1000_8000_00805f9b34fb),
            characteristics: vec![Uuid::from_u128(0x00002a19_0000_1000_8000_00805f9b34fb)],
        }];
        self
    }

    pub fn refuse_connections(self) -> Self {
        self.state().connect = ConnectBehavior::Refuse;
        self
    }

    /// Never complete a connection attempt.
    pub fn hang_on_connect(self) -> Self {
        self.state().connect = ConnectBehavior::Hang;
        self
    }

    pub fn hang_on_discover(self) -> Self {
        self.state().stalls.push(Stall::Discover);
        self
    }

    /// Accept the link but never complete a write of a frame with `opcode`.
    pub fn hang_on_write(self, opcode: u8) -> Self {
        self.state().stalls.push(Stall::Write(opcode));
        self
    }

    /// Take every command but never return its response code.
    pub fn hang_on_response_read(self) -> Self {
        self.state().stalls.push(Stall::ResponseRead);
        self
    }

    /// Connection state queries never return.
    pub fn hang_on_link_check(self) -> Self {
        self.state().stalls.push(Stall::LinkCheck);
        self
    }

    pub fn with_config_blob(self, blob: &[u8]) -> Self {
        self.state().config_blob = blob.to_vec();
        self
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn set_advertising(&self, advertising: bool) {
        self.state().advertising = advertising;
    }

    /// Every frame written to the config write characteristic, in order.
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.state().written.clone()
    }

    pub fn written_opcodes(&self) -> Vec<u8> {
        self.state()
            .written
            .iter()
            .filter_map(|frame| frame.first().copied())
            .collect()
    }

    pub fn is_connected(&self) -> bool {
        self.state().connected
    }

    pub fn connect_count(&self) -> usize {
        self.state().connect_count
    }

    pub fn disconnect_count(&self) -> usize {
        self.state().disconnect_count
    }

    pub fn subscriber_count(&self) -> usize {
        let mut state = self.state();
        state.subscribers.retain(|tx| !tx.is_closed());
        state.subscribers.len()
    }

    /// Deliver a sensor data notification to every subscriber. Returns how
    /// many subscribers received it.
    pub fn notify(&self, value: &[u8]) -> usize {
        let mut state = self.state();
        state
            .subscribers
            .retain(|tx| tx.unbounded_send(value.to_vec()).is_ok());
        state.subscribers.len()
    }

    /// Simulate the radio link going away (out of range, power loss).
    pub fn drop_link(&self) {
        let mut state = self.state();
        state.connected = false;
        state.authenticated = false;
        state.response = None;
        state.subscribers.clear();
    }

    fn state(&self) -> MutexGuard<'_, NodeState> {
        lock(&self.state)
    }

    fn handle_write(&self, frame: &[u8]) -> Vec<u8> {
        let mut state = self.state();
        state.written.push(frame.to_vec());

        let Some(&opcode) = frame.first() else {
            return vec![0xff];
        };
        if let Some(response) = state.overrides.get(&opcode) {
            return response.clone();
        }

        if opcode == opcodes::AUTHENTICATE {
            let accepted = match (state.expected_hash, frame.get(1..5)) {
                (None, Some(_)) => true,
                (Some(expected), Some(hash)) => expected.as_slice() == hash,
                (_, None) => false,
            };
            state.authenticated = accepted;
            return vec![if accepted {
                responses::OK
            } else {
                responses::NOT_AUTHENTICATED
            }];
        }

        if !state.authenticated {
            return vec![responses::NOT_AUTHENTICATED];
        }
        if opcode == opcodes::SET_NODE_ID {
            if let Some(node_id) = frame.get(2..).and_then(|b| std::str::from_utf8(b).ok()) {
                state.expected_hash = Some(grid_proto::node_id_hash(node_id));
            }
        }
        if opcode == opcodes::REBOOT {
            state.reboot_pending = true;
        }
        vec![responses::OK]
    }
}

struct FakeLink {
    node: Arc<FakeNode>,
    generation: u64,
}

impl FakeLink {
    fn live(&self) -> Result<MutexGuard<'_, NodeState>, TransportError> {
        let state = self.node.state();
        if state.connected && state.generation == self.generation {
            Ok(state)
        } else {
            Err(TransportError::Disconnected)
        }
    }

    async fn stall(&self, at: Stall) {
        let stalled = self.node.state().stalls.contains(&at);
        if stalled {
            std::future::pending::<()>().await;
        }
    }

    fn has_characteristic(state: &NodeState, uuid: Uuid) -> bool {
        state
            .services
            .iter()
            .any(|service| service.characteristics.contains(&uuid))
    }
}

#[async_trait]
impl GattLink for FakeLink {
    async fn discover(&self) -> Result<Vec<GattService>, TransportError> {
        self.live()?;
        self.stall(Stall::Discover).await;
        Ok(self.live()?.services.clone())
    }

    async fn write(&self, characteristic: Uuid, data: &[u8]) -> Result<(), TransportError> {
        {
            let state = self.live()?;
            if !Self::has_characteristic(&state, characteristic) {
                return Err(TransportError::NotFound(characteristic.to_string()));
            }
        }
        if characteristic == Uuid::from_u128(CONFIG_WRITE_UUID) {
            if let Some(&opcode) = data.first() {
                self.stall(Stall::Write(opcode)).await;
            }
            let response = self.node.handle_write(data);
            self.node.state().response = Some(response);
        }
        Ok(())
    }

    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>, TransportError> {
        if characteristic == Uuid::from_u128(CONFIG_WRITE_UUID) {
            self.live()?;
            self.stall(Stall::ResponseRead).await;
        }
        let mut state = self.live()?;
        if characteristic == Uuid::from_u128(CONFIG_WRITE_UUID) {
            let response = state.response.take().unwrap_or_default();
            if std::mem::take(&mut state.reboot_pending) {
                drop(state);
                self.node.drop_link();
            }
            return Ok(response);
        }
        if characteristic == Uuid::from_u128(CONFIG_READ_UUID) {
            return Ok(state.config_blob.clone());
        }
        Err(TransportError::NotFound(characteristic.to_string()))
    }

    async fn subscribe(&self, characteristic: Uuid) -> Result<NotificationStream, TransportError> {
        let mut state = self.live()?;
        if characteristic != Uuid::from_u128(SENSOR_DATA_UUID)
            || !Self::has_characteristic(&state, characteristic)
        {
            return Err(TransportError::NotFound(characteristic.to_string()));
        }
        let (tx, rx) = mpsc::unbounded();
        state.subscribers.push(tx);
        Ok(Box::pin(rx))
    }

    async fn unsubscribe(&self, _characteristic: Uuid) -> Result<(), TransportError> {
        self.live()?.subscribers.clear();
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.stall(Stall::LinkCheck).await;
        self.live().is_ok()
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        if self.live().is_ok() {
            self.node.drop_link();
            self.node.state().disconnect_count += 1;
        }
        Ok(())
    }
}

/// Telemetry sink that keeps every reading in memory
#[derive(Default)]
pub struct MemorySink {
    readings: Mutex<Vec<Reading>>,
    reject: Mutex<bool>,
}

impl MemorySink {
    pub fn readings(&self) -> Vec<Reading> {
        lock(&self.readings).clone()
    }

    /// Make ingestion fail until switched back.
    pub fn reject(&self, reject: bool) {
        *lock(&self.reject) = reject;
    }
}

#[async_trait]
impl TelemetrySink for MemorySink {
    async fn ingest(&self, reading: Reading) -> anyhow::Result<()> {
        if *lock(&self.reject) {
            anyhow::bail!("ingestion unavailable");
        }
        lock(&self.readings).push(reading);
        Ok(())
    }
}

/// Status reporter that records every report in order
#[derive(Default)]
pub struct MemoryStatus {
    reports: Mutex<Vec<(String, ConnectionStatus)>>,
}

impl MemoryStatus {
    pub fn reports(&self) -> Vec<(String, ConnectionStatus)> {
        lock(&self.reports).clone()
    }
}

#[async_trait]
impl StatusReporter for MemoryStatus {
    async fn report(&self, device_id: &str, status: ConnectionStatus) -> anyhow::Result<()> {
        lock(&self.reports).push((device_id.to_string(), status));
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
