//! Device session: one BLE link to one node and its protocol state machine
//!
//! ```text
//! Disconnected -> Connecting -> ServicesDiscovering -> Ready
//!     -> Authenticating -> Authenticated -> Disconnected
//! ```
//!
//! Every command is write, settle, read back the response code from the
//! config write characteristic. A session is always used through
//! [`SessionHandle`], so there is never more than one command in flight.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{Mutex, watch};
use tokio::time::Instant;
use uuid::Uuid;

use grid_proto::ble::{CONFIG_READ_UUID, CONFIG_SERVICE_UUID, CONFIG_WRITE_UUID, SENSOR_DATA_UUID};
use grid_proto::{Command, ResponseCode};

use crate::config::SessionSettings;
use crate::error::{Phase, SessionError, TransportError};
use crate::identity::DeviceIdentity;
use crate::transport::{BleAdapter, GattLink, NotificationStream};

/// Time the firmware needs between receiving a command and having the
/// response code ready to read. Protocol constant, not a tuning knob.
pub const SETTLE_DELAY: Duration = Duration::from_millis(100);

pub type SessionHandle = Arc<Mutex<DeviceSession>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    ServicesDiscovering,
    Ready,
    Authenticating,
    Authenticated,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::ServicesDiscovering => "discovering services",
            SessionState::Ready => "ready",
            SessionState::Authenticating => "authenticating",
            SessionState::Authenticated => "authenticated",
        })
    }
}

/// Published on every state change; readable without locking the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStatus {
    pub state: SessionState,
    /// A connection has been attempted at least once
    pub opened: bool,
}

impl SessionStatus {
    /// Fresh sessions count as live until their first attempt ends.
    pub fn is_live(&self) -> bool {
        self.state != SessionState::Disconnected || !self.opened
    }
}

#[derive(Debug, Clone, Copy)]
struct ConfigCharacteristics {
    config_write: Uuid,
    config_read: Uuid,
    sensor_data: Option<Uuid>,
}

pub struct DeviceSession {
    identity: DeviceIdentity,
    settings: SessionSettings,
    state: SessionState,
    opened: bool,
    node_id: Option<String>,
    last_activity_at: Instant,
    link: Option<Box<dyn GattLink>>,
    characteristics: Option<ConfigCharacteristics>,
    subscribed: bool,
    status: watch::Sender<SessionStatus>,
}

impl DeviceSession {
    pub fn new(identity: DeviceIdentity, settings: SessionSettings) -> Self {
        let (status, _) = watch::channel(SessionStatus {
            state: SessionState::Disconnected,
            opened: false,
        });
        Self {
            identity,
            settings,
            state: SessionState::Disconnected,
            opened: false,
            node_id: None,
            last_activity_at: Instant::now(),
            link: None,
            characteristics: None,
            subscribed: false,
            status,
        }
    }

    pub fn into_handle(self) -> SessionHandle {
        Arc::new(Mutex::new(self))
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn node_id(&self) -> Option<&str> {
        self.node_id.as_deref()
    }

    pub fn last_activity_at(&self) -> Instant {
        self.last_activity_at
    }

    pub fn watch(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    /// Whether the node exposes the sensor data characteristic
    pub fn has_telemetry(&self) -> bool {
        self.characteristics
            .is_some_and(|chars| chars.sensor_data.is_some())
    }

    /// Connect and discover the config service. Failures leave the session
    /// `Disconnected`; retrying is up to the caller.
    pub async fn open(&mut self, adapter: &dyn BleAdapter) -> Result<(), SessionError> {
        if self.state != SessionState::Disconnected {
            return Err(SessionError::InvalidState {
                state: self.state,
                expected: SessionState::Disconnected,
            });
        }

        self.opened = true;
        self.set_state(SessionState::Connecting);
        info!("{}: connecting", self.identity);
        let link = match bounded(self.settings.connect_timeout, adapter.connect(&self.identity)).await
        {
            Ok(link) => link,
            Err(e) => return Err(self.fail(Phase::Connect, e).await),
        };
        self.link = Some(link);
        self.touch();

        self.set_state(SessionState::ServicesDiscovering);
        let limit = self.settings.operation_timeout;
        let result = match self.link() {
            Ok(link) => bounded(limit, link.discover()).await,
            Err(e) => Err(e),
        };
        let services = match result {
            Ok(services) => services,
            Err(e) => return Err(self.fail(Phase::Discover, e).await),
        };

        let Some(service) = services
            .iter()
            .find(|s| s.uuid == Uuid::from_u128(CONFIG_SERVICE_UUID))
        else {
            warn!("{}: config service missing", self.identity);
            self.teardown().await;
            return Err(SessionError::MissingService);
        };
        let find = |uuid: u128| {
            let uuid = Uuid::from_u128(uuid);
            service.characteristics.contains(&uuid).then_some(uuid)
        };
        let characteristics = match (find(CONFIG_WRITE_UUID), find(CONFIG_READ_UUID)) {
            (Some(config_write), Some(config_read)) => ConfigCharacteristics {
                config_write,
                config_read,
                sensor_data: find(SENSOR_DATA_UUID),
            },
            (None, _) => {
                self.teardown().await;
                return Err(SessionError::MissingCharacteristic("config write"));
            }
            (_, None) => {
                self.teardown().await;
                return Err(SessionError::MissingCharacteristic("config read"));
            }
        };
        if characteristics.sensor_data.is_none() {
            warn!("{}: no sensor data characteristic, telemetry disabled", self.identity);
        }

        self.characteristics = Some(characteristics);
        self.touch();
        self.set_state(SessionState::Ready);
        info!("{}: services discovered, ready", self.identity);
        Ok(())
    }

    /// Authenticate with the hash of `node_id`. A non-`Ok` response leaves
    /// the session `Ready` so the caller can try another node id. The node id
    /// is only recorded once the node accepts it.
    pub async fn authenticate(&mut self, node_id: &str) -> Result<ResponseCode, SessionError> {
        self.run_authenticate(Command::authenticate(node_id), Some(node_id))
            .await
    }

    async fn run_authenticate(
        &mut self,
        command: Command,
        node_id: Option<&str>,
    ) -> Result<ResponseCode, SessionError> {
        if self.state != SessionState::Ready && self.state != SessionState::Authenticated {
            return Err(SessionError::InvalidState {
                state: self.state,
                expected: SessionState::Ready,
            });
        }

        self.set_state(SessionState::Authenticating);
        let code = self.exchange(&command).await?;
        if code.is_ok() {
            if let Some(node_id) = node_id {
                self.node_id = Some(node_id.to_string());
            }
            self.set_state(SessionState::Authenticated);
            info!(
                "{}: authenticated as {}",
                self.identity,
                node_id.unwrap_or("<hash>")
            );
        } else {
            self.set_state(SessionState::Ready);
            warn!("{}: authentication rejected: {code}", self.identity);
        }
        Ok(code)
    }

    /// Send one command and return the node's response code.
    ///
    /// Anything but `Authenticate` needs an authenticated session and is
    /// rejected without touching the wire otherwise.
    pub async fn execute(&mut self, command: Command) -> Result<ResponseCode, SessionError> {
        if let Command::Authenticate(_) = command {
            return self.run_authenticate(command, None).await;
        }

        self.check_link().await;
        if self.state != SessionState::Authenticated {
            return Err(SessionError::NotAuthenticated {
                command: command.name(),
                state: self.state,
            });
        }
        command.validate()?;

        let code = self.exchange(&command).await?;
        match (&command, code) {
            (_, ResponseCode::NotAuthenticated) => {
                warn!(
                    "{}: {} answered not authenticated, back to ready",
                    self.identity,
                    command.name()
                );
                self.set_state(SessionState::Ready);
            }
            (Command::SetNodeId(node_id), ResponseCode::Ok) => {
                self.node_id = Some(node_id.clone());
            }
            (Command::Reboot, ResponseCode::Ok) => {
                info!("{}: rebooting, closing session", self.identity);
                self.teardown().await;
            }
            _ => {}
        }
        Ok(code)
    }

    pub async fn set_wifi(&mut self, ssid: &str, password: &str) -> Result<ResponseCode, SessionError> {
        self.execute(Command::SetWifi {
            ssid: ssid.to_string(),
            password: password.to_string(),
        })
        .await
    }

    pub async fn set_hub_url(&mut self, url: &str, port: u16) -> Result<ResponseCode, SessionError> {
        self.execute(Command::SetHubUrl {
            url: url.to_string(),
            port,
        })
        .await
    }

    pub async fn set_node_id(&mut self, node_id: &str) -> Result<ResponseCode, SessionError> {
        self.execute(Command::SetNodeId(node_id.to_string())).await
    }

    pub async fn set_interval(&mut self, seconds: u32) -> Result<ResponseCode, SessionError> {
        self.execute(Command::SetInterval(seconds)).await
    }

    pub async fn factory_reset(&mut self) -> Result<ResponseCode, SessionError> {
        self.execute(Command::FactoryReset).await
    }

    pub async fn reboot(&mut self) -> Result<ResponseCode, SessionError> {
        self.execute(Command::Reboot).await
    }

    /// Raw contents of the config read characteristic.
    pub async fn read_config(&mut self) -> Result<Vec<u8>, SessionError> {
        let chars = self.require_authenticated("read_config")?;
        let limit = self.settings.operation_timeout;
        let result = match self.link() {
            Ok(link) => bounded(limit, link.read(chars.config_read)).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(data) => {
                self.touch();
                Ok(data)
            }
            Err(e) => Err(self.fail(Phase::Read, e).await),
        }
    }

    pub async fn subscribe_sensor_data(&mut self) -> Result<NotificationStream, SessionError> {
        let chars = self.require_authenticated("subscribe")?;
        let Some(sensor_data) = chars.sensor_data else {
            return Err(SessionError::TelemetryUnavailable);
        };
        let limit = self.settings.operation_timeout;
        let result = match self.link() {
            Ok(link) => bounded(limit, link.subscribe(sensor_data)).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(stream) => {
                self.subscribed = true;
                self.touch();
                debug!("{}: subscribed to sensor data", self.identity);
                Ok(stream)
            }
            Err(e) => Err(self.fail(Phase::Subscribe, e).await),
        }
    }

    /// Best effort: a link that is already gone has nothing to unsubscribe.
    pub async fn unsubscribe_sensor_data(&mut self) {
        if !std::mem::take(&mut self.subscribed) {
            return;
        }
        let Some(sensor_data) = self.characteristics.and_then(|c| c.sensor_data) else {
            return;
        };
        if let Ok(link) = self.link() {
            if let Err(e) = bounded(self.settings.operation_timeout, link.unsubscribe(sensor_data)).await {
                debug!("{}: unsubscribe failed: {e}", self.identity);
            }
        }
    }

    /// Poll the transport. A lost link forces `Disconnected`. Returns whether
    /// the session is still connected.
    pub async fn check_link(&mut self) -> bool {
        // a stalled stack counts as a lost link
        let limit = self.settings.operation_timeout;
        let connected = match self.link() {
            Ok(link) => tokio::time::timeout(limit, link.is_connected())
                .await
                .unwrap_or(false),
            Err(_) => return false,
        };
        if !connected {
            info!("{}: link lost", self.identity);
            self.teardown().await;
        }
        connected
    }

    /// Close the link from any state. Idempotent.
    pub async fn disconnect(&mut self) {
        if self.link.is_some() {
            info!("{}: disconnecting", self.identity);
        }
        self.teardown().await;
    }

    fn require_authenticated(&self, command: &'static str) -> Result<ConfigCharacteristics, SessionError> {
        match (self.state, self.characteristics) {
            (SessionState::Authenticated, Some(chars)) => Ok(chars),
            (state, _) => Err(SessionError::NotAuthenticated { command, state }),
        }
    }

    async fn exchange(&mut self, command: &Command) -> Result<ResponseCode, SessionError> {
        let Some(chars) = self.characteristics else {
            return Err(SessionError::InvalidState {
                state: self.state,
                expected: SessionState::Ready,
            });
        };
        let frame = command.to_bytes();
        let limit = self.settings.operation_timeout;
        debug!(
            "{}: -> {} (opcode 0x{:02x}, {} bytes)",
            self.identity,
            command.name(),
            command.opcode(),
            frame.len()
        );

        let result = match self.link() {
            Ok(link) => bounded(limit, link.write(chars.config_write, &frame)).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            return Err(self.fail(Phase::Write, e).await);
        }

        tokio::time::sleep(SETTLE_DELAY).await;

        let result = match self.link() {
            Ok(link) => bounded(limit, link.read(chars.config_write)).await,
            Err(e) => Err(e),
        };
        let data = match result {
            Ok(data) => data,
            Err(e) => return Err(self.fail(Phase::Read, e).await),
        };
        self.touch();

        let code = ResponseCode::from_bytes(&data);
        debug!("{}: <- {} {code}", self.identity, command.name());
        Ok(code)
    }

    fn link(&self) -> Result<&dyn GattLink, TransportError> {
        self.link.as_deref().ok_or(TransportError::Disconnected)
    }

    async fn fail(&mut self, phase: Phase, e: TransportError) -> SessionError {
        warn!("{}: {phase} failed: {e}", self.identity);
        self.teardown().await;
        SessionError::transport(phase, e)
    }

    async fn teardown(&mut self) {
        if let Some(link) = self.link.take() {
            let limit = self.settings.operation_timeout;
            if std::mem::take(&mut self.subscribed) {
                if let Some(sensor_data) = self.characteristics.and_then(|c| c.sensor_data) {
                    let _ = bounded(limit, link.unsubscribe(sensor_data)).await;
                }
            }
            if let Err(e) = bounded(limit, link.disconnect()).await {
                debug!("{}: disconnect failed: {e}", self.identity);
            }
        }
        self.characteristics = None;
        self.subscribed = false;
        self.set_state(SessionState::Disconnected);
    }

    fn touch(&mut self) {
        self.last_activity_at = Instant::now();
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            debug!("{}: {} -> {}", self.identity, self.state, state);
            self.state = state;
        }
        self.status.send_replace(SessionStatus {
            state,
            opened: self.opened,
        });
    }
}

async fn bounded<T>(
    limit: Duration,
    fut: impl Future<Output = Result<T, TransportError>>,
) -> Result<T, TransportError> {
    tokio::time::timeout(limit, fut)
        .await
        .unwrap_or(Err(TransportError::Timeout(limit)))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use grid_proto::ble::opcodes;

    use super::*;
    use crate::fake::{FakeAdapter, FakeNode};
    use crate::identity::MacAddress;

    const MAC: MacAddress = MacAddress::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01]);

    fn setup(node: FakeNode) -> (FakeAdapter, Arc<FakeNode>, DeviceSession) {
        let node = Arc::new(node);
        let adapter = FakeAdapter::new();
        adapter.add_node(node.clone());
        let session = DeviceSession::new(node.identity().clone(), SessionSettings::default());
        (adapter, node, session)
    }

    fn all_commands() -> Vec<Command> {
        vec![
            Command::SetWifi {
                ssid: "Home".to_string(),
                password: "secret123".to_string(),
            },
            Command::SetHubUrl {
                url: "http://hub.local".to_string(),
                port: 5001,
            },
            Command::SetNodeId("garden-01".to_string()),
            Command::SetInterval(60),
            Command::FactoryReset,
            Command::Reboot,
        ]
    }

    #[tokio::test(start_paused = true)]
    async fn open_reaches_ready() {
        let (adapter, node, mut session) = setup(FakeNode::new(MAC, Some("myIoTGrid-EE01")));
        let mut status = session.watch();

        session.open(&adapter).await.unwrap();

        assert_eq!(session.state(), SessionState::Ready);
        assert!(session.has_telemetry());
        assert!(node.is_connected());
        assert!(node.written().is_empty());
        assert!(status.has_changed().unwrap());
        assert_eq!(
            *status.borrow_and_update(),
            SessionStatus {
                state: SessionState::Ready,
                opened: true
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn foreign_device_is_terminal() {
        let (adapter, node, mut session) = setup(FakeNode::new(MAC, None).foreign());
        let err = session.open(&adapter).await.unwrap_err();
        assert!(matches!(err, SessionError::MissingService));
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(!node.is_connected());
        assert!(!session.watch().borrow().is_live());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_config_characteristics_are_terminal() {
        let (adapter, _, mut session) =
            setup(FakeNode::new(MAC, None).without_characteristic(CONFIG_READ_UUID));
        assert!(matches!(
            session.open(&adapter).await,
            Err(SessionError::MissingCharacteristic("config read"))
        ));
        assert_eq!(session.state(), SessionState::Disconnected);

        let (adapter, _, mut session) =
            setup(FakeNode::new(MAC, None).without_characteristic(CONFIG_WRITE_UUID));
        assert!(matches!(
            session.open(&adapter).await,
            Err(SessionError::MissingCharacteristic("config write"))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_sensor_data_only_disables_telemetry() {
        let (adapter, _, mut session) =
            setup(FakeNode::new(MAC, None).without_characteristic(SENSOR_DATA_UUID));
        session.open(&adapter).await.unwrap();
        assert!(!session.has_telemetry());
        session.authenticate("garden-01").await.unwrap();
        assert!(matches!(
            session.subscribe_sensor_data().await,
            Err(SessionError::TelemetryUnavailable)
        ));
        assert_eq!(session.state(), SessionState::Authenticated);
    }

    #[tokio::test(start_paused = true)]
    async fn refused_connection_is_reported_not_retried() {
        let (adapter, node, mut session) = setup(FakeNode::new(MAC, None).refuse_connections());
        let err = session.open(&adapter).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Transport {
                phase: Phase::Connect,
                ..
            }
        ));
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(node.connect_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_connect_times_out() {
        let (adapter, _, mut session) = setup(FakeNode::new(MAC, None).hang_on_connect());
        let started = Instant::now();
        let err = session.open(&adapter).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Transport {
                phase: Phase::Connect,
                source: TransportError::Timeout(_),
            }
        ));
        assert!(started.elapsed() >= SessionSettings::default().connect_timeout);
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_discovery_times_out_and_closes_the_link() {
        let (adapter, node, mut session) = setup(FakeNode::new(MAC, None).hang_on_discover());
        let err = session.open(&adapter).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Transport {
                phase: Phase::Discover,
                source: TransportError::Timeout(_),
            }
        ));
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(node.disconnect_count(), 1);
        assert!(!node.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_write_times_out_and_closes_the_link() {
        let (adapter, node, mut session) =
            setup(FakeNode::new(MAC, None).hang_on_write(opcodes::SET_INTERVAL));
        session.open(&adapter).await.unwrap();
        session.authenticate("garden-01").await.unwrap();

        let started = Instant::now();
        let err = session.set_interval(60).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Transport {
                phase: Phase::Write,
                source: TransportError::Timeout(_),
            }
        ));
        assert!(started.elapsed() >= SessionSettings::default().operation_timeout);
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(node.disconnect_count(), 1);
        assert_eq!(node.written_opcodes(), vec![opcodes::AUTHENTICATE]);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_response_read_times_out_and_closes_the_link() {
        let (adapter, node, mut session) = setup(FakeNode::new(MAC, None).hang_on_response_read());
        session.open(&adapter).await.unwrap();

        let err = session.authenticate("garden-01").await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Transport {
                phase: Phase::Read,
                source: TransportError::Timeout(_),
            }
        ));
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(session.node_id(), None);
        assert_eq!(node.disconnect_count(), 1);
        assert_eq!(node.written_opcodes(), vec![opcodes::AUTHENTICATE]);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_link_check_counts_as_lost() {
        let (adapter, node, mut session) = setup(FakeNode::new(MAC, None).hang_on_link_check());
        session.open(&adapter).await.unwrap();
        session.authenticate("garden-01").await.unwrap();

        let started = Instant::now();
        assert!(!session.check_link().await);
        assert!(started.elapsed() >= SessionSettings::default().operation_timeout);
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(node.disconnect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn open_twice_is_a_precondition_error() {
        let (adapter, _, mut session) = setup(FakeNode::new(MAC, None));
        session.open(&adapter).await.unwrap();
        let err = session.open(&adapter).await.unwrap_err();
        assert!(err.is_precondition());
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn unauthenticated_sessions_reject_every_command() {
        let (adapter, node, mut session) = setup(FakeNode::new(MAC, None));

        for command in all_commands() {
            let err = session.execute(command).await.unwrap_err();
            assert!(matches!(
                err,
                SessionError::NotAuthenticated {
                    state: SessionState::Disconnected,
                    ..
                }
            ));
        }

        session.open(&adapter).await.unwrap();
        for command in all_commands() {
            let name = command.name();
            match session.execute(command).await {
                Err(SessionError::NotAuthenticated {
                    command,
                    state: SessionState::Ready,
                }) => assert_eq!(command, name),
                other => panic!("{name}: expected precondition failure, got {other:?}"),
            }
        }
        assert!(matches!(
            session.read_config().await,
            Err(SessionError::NotAuthenticated { .. })
        ));
        assert!(matches!(
            session.subscribe_sensor_data().await,
            Err(SessionError::NotAuthenticated { .. })
        ));
        assert!(node.written().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn wrong_node_id_stays_ready_and_can_retry() {
        let (adapter, node, mut session) =
            setup(FakeNode::new(MAC, None).expect_node_id("garden-01"));
        session.open(&adapter).await.unwrap();

        let code = session.authenticate("garden-02").await.unwrap();
        assert_eq!(code, ResponseCode::NotAuthenticated);
        assert_eq!(session.state(), SessionState::Ready);

        let code = session.authenticate("garden-01").await.unwrap();
        assert_eq!(code, ResponseCode::Ok);
        assert_eq!(session.state(), SessionState::Authenticated);
        assert_eq!(session.node_id(), Some("garden-01"));
        assert_eq!(node.written_opcodes(), vec![opcodes::AUTHENTICATE; 2]);
        assert_eq!(node.written()[1], vec![0x00, 0x42, 0xc7, 0xa0, 0x99]);
    }

    #[tokio::test(start_paused = true)]
    async fn authenticate_before_open_records_no_node_id() {
        let (_, node, mut session) = setup(FakeNode::new(MAC, None));
        let err = session.authenticate("before-open").await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::InvalidState {
                state: SessionState::Disconnected,
                ..
            }
        ));
        assert_eq!(session.node_id(), None);
        assert!(node.written().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_reauthentication_keeps_the_accepted_node_id() {
        let (adapter, _, mut session) = setup(FakeNode::new(MAC, None).expect_node_id("good"));
        session.open(&adapter).await.unwrap();
        assert_eq!(session.authenticate("good").await.unwrap(), ResponseCode::Ok);

        let code = session.authenticate("wrong").await.unwrap();
        assert_eq!(code, ResponseCode::NotAuthenticated);
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(session.node_id(), Some("good"));
    }

    #[tokio::test(start_paused = true)]
    async fn commands_wait_for_the_settle_delay() {
        let (adapter, _, mut session) = setup(FakeNode::new(MAC, None));
        session.open(&adapter).await.unwrap();
        let started = Instant::now();
        session.authenticate("n").await.unwrap();
        session.set_interval(30).await.unwrap();
        assert!(started.elapsed() >= SETTLE_DELAY * 2);
    }

    #[tokio::test(start_paused = true)]
    async fn set_wifi_frame_on_the_wire() {
        let (adapter, node, mut session) = setup(FakeNode::new(MAC, None));
        session.open(&adapter).await.unwrap();
        session.authenticate("garden-01").await.unwrap();

        let code = session.set_wifi("Home", "secret123").await.unwrap();

        assert_eq!(code, ResponseCode::Ok);
        let expected: Vec<u8> = [&[0x01, 0x04][..], b"Home", &[0x09], b"secret123"].concat();
        assert_eq!(node.written().last(), Some(&expected));
    }

    #[tokio::test(start_paused = true)]
    async fn reboot_ack_closes_the_session() {
        let (adapter, node, mut session) = setup(FakeNode::new(MAC, None));
        session.open(&adapter).await.unwrap();
        session.authenticate("garden-01").await.unwrap();

        assert_eq!(session.reboot().await.unwrap(), ResponseCode::Ok);
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(!node.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn not_authenticated_response_drops_back_to_ready() {
        let (adapter, _, mut session) =
            setup(FakeNode::new(MAC, None).respond(opcodes::SET_INTERVAL, &[0x01]));
        session.open(&adapter).await.unwrap();
        session.authenticate("garden-01").await.unwrap();

        assert_eq!(
            session.set_interval(60).await.unwrap(),
            ResponseCode::NotAuthenticated
        );
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn error_and_empty_responses_keep_the_session() {
        let (adapter, _, mut session) = setup(
            FakeNode::new(MAC, None)
                .respond(opcodes::SET_WIFI, &[0x07])
                .respond(opcodes::FACTORY_RESET, &[]),
        );
        session.open(&adapter).await.unwrap();
        session.authenticate("garden-01").await.unwrap();

        assert_eq!(
            session.set_wifi("Home", "pw").await.unwrap(),
            ResponseCode::Error(Some(0x07))
        );
        assert_eq!(
            session.factory_reset().await.unwrap(),
            ResponseCode::Error(None)
        );
        assert_eq!(session.state(), SessionState::Authenticated);
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_fields_are_not_sent() {
        let (adapter, node, mut session) = setup(FakeNode::new(MAC, None));
        session.open(&adapter).await.unwrap();
        session.authenticate("garden-01").await.unwrap();

        let err = session.set_wifi(&"s".repeat(300), "pw").await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidCommand(_)));
        assert_eq!(node.written().len(), 1);
        assert_eq!(session.state(), SessionState::Authenticated);
    }

    #[tokio::test(start_paused = true)]
    async fn lost_link_turns_commands_into_precondition_failures() {
        let (adapter, node, mut session) = setup(FakeNode::new(MAC, None));
        session.open(&adapter).await.unwrap();
        session.authenticate("garden-01").await.unwrap();
        node.drop_link();

        let err = session.set_wifi("Home", "secret123").await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::NotAuthenticated {
                command: "set_wifi",
                state: SessionState::Disconnected,
            }
        ));
        assert_eq!(node.written().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn config_blob_is_readable_once_authenticated() {
        let (adapter, _, mut session) =
            setup(FakeNode::new(MAC, None).with_config_blob(br#"{"interval":60}"#));
        session.open(&adapter).await.unwrap();
        session.authenticate("garden-01").await.unwrap();
        assert_eq!(session.read_config().await.unwrap(), br#"{"interval":60}"#.to_vec());
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_is_idempotent() {
        let (adapter, node, mut session) = setup(FakeNode::new(MAC, None));
        session.open(&adapter).await.unwrap();
        session.authenticate("garden-01").await.unwrap();
        let _stream = session.subscribe_sensor_data().await.unwrap();
        assert_eq!(node.subscriber_count(), 1);

        session.disconnect().await;
        session.disconnect().await;

        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(node.disconnect_count(), 1);
        assert_eq!(node.subscriber_count(), 0);
        assert!(!session.check_link().await);
    }
}
