//! Scanner/reconciler: periodically scan, match advertisements against the
//! registered nodes, and run one task per matched device

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use log::{error, info, warn};
use tokio::sync::Mutex;
use tokio::task::{self, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::collaborators::{
    ConnectionStatus, DeviceDirectory, RegisteredDevice, StatusReporter, TelemetrySink,
};
use crate::config::ScannerSettings;
use crate::identity::DeviceIdentity;
use crate::registry::ConnectionRegistry;
use crate::relay::relay;
use crate::session::SessionHandle;
use crate::transport::{BleAdapter, NotificationStream};

/// Why a scanned device is worth connecting to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceMatch {
    /// Registered node, by MAC or by registered BLE name
    Registered { node_id: String },
    /// Only the advertised name prefix matched; no node id to authenticate with
    Prefix,
}

/// Match by registered MAC first, then registered BLE name, then name prefix.
pub fn match_device(
    identity: &DeviceIdentity,
    registered: &[RegisteredDevice],
    prefixes: &[String],
) -> Option<DeviceMatch> {
    let by_mac = registered
        .iter()
        .find(|device| device.mac() == Some(identity.mac()));
    let by_name = || {
        let name = identity.advertised_name()?;
        registered
            .iter()
            .find(|device| device.ble_device_name.as_deref() == Some(name))
    };
    if let Some(device) = by_mac.or_else(by_name) {
        return Some(DeviceMatch::Registered {
            node_id: device.node_id.clone(),
        });
    }

    let name = identity.advertised_name()?;
    prefixes
        .iter()
        .any(|prefix| name.starts_with(prefix.as_str()))
        .then_some(DeviceMatch::Prefix)
}

/// What one scan cycle did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub discovered: usize,
    pub matched: usize,
    pub started: usize,
    pub already_active: usize,
    /// Device tasks that ended in an error or panic since the previous cycle
    pub failed: usize,
}

#[derive(Clone)]
struct Shared {
    adapter: Arc<dyn BleAdapter>,
    registry: Arc<ConnectionRegistry>,
    sink: Arc<dyn TelemetrySink>,
    status: Arc<dyn StatusReporter>,
    settings: ScannerSettings,
}

#[derive(Default)]
struct DeviceTasks {
    set: JoinSet<anyhow::Result<()>>,
    identities: HashMap<task::Id, DeviceIdentity>,
}

pub struct Scanner {
    shared: Shared,
    directory: Arc<dyn DeviceDirectory>,
    tasks: Mutex<DeviceTasks>,
    stop: CancellationToken,
}

impl Scanner {
    pub fn new(
        adapter: Arc<dyn BleAdapter>,
        registry: Arc<ConnectionRegistry>,
        directory: Arc<dyn DeviceDirectory>,
        sink: Arc<dyn TelemetrySink>,
        status: Arc<dyn StatusReporter>,
        settings: ScannerSettings,
    ) -> Self {
        Self {
            shared: Shared {
                adapter,
                registry,
                sink,
                status,
                settings,
            },
            directory,
            tasks: Mutex::new(DeviceTasks::default()),
            stop: CancellationToken::new(),
        }
    }

    /// Scan every interval until `cancel` fires, then stop every device task
    /// and disconnect whatever is left in the registry.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            "scanner started: every {:?}, scanning {:?}",
            self.shared.settings.interval, self.shared.settings.scan_duration
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.run_cycle() => match result {
                    Ok(report) => info!(
                        "scan cycle: {} discovered, {} matched, {} started, {} already active, {} failed",
                        report.discovered,
                        report.matched,
                        report.started,
                        report.already_active,
                        report.failed
                    ),
                    Err(e) => warn!("scan cycle failed: {e:#}"),
                },
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.shared.settings.interval) => {}
            }
        }
        self.shutdown().await;
    }

    /// One scan/match/start pass. A failed scan or directory lookup fails the
    /// cycle; per-device failures never do.
    pub async fn run_cycle(&self) -> anyhow::Result<CycleReport> {
        if self.stop.is_cancelled() {
            bail!("scanner is shut down");
        }
        let mut report = CycleReport {
            failed: self.reap().await,
            ..CycleReport::default()
        };

        let advertisements = self
            .shared
            .adapter
            .scan(self.shared.settings.scan_duration)
            .await
            .context("scan")?;
        report.discovered = advertisements.len();
        let registered = self
            .directory
            .registered_devices()
            .await
            .context("fetching registered devices")?;

        for advertisement in advertisements {
            let identity = advertisement.identity;
            let Some(found) =
                match_device(&identity, &registered, &self.shared.settings.name_prefixes)
            else {
                continue;
            };
            report.matched += 1;

            let (session, fresh) = self
                .shared
                .registry
                .get_or_create(&identity, self.shared.settings.session)
                .await;
            if !fresh {
                report.already_active += 1;
                continue;
            }

            let node_id = match found {
                DeviceMatch::Registered { node_id } => Some(node_id),
                DeviceMatch::Prefix => None,
            };
            info!(
                "{identity}: starting device task ({})",
                node_id.as_deref().unwrap_or("unregistered")
            );
            let shared = self.shared.clone();
            let cancel = self.stop.child_token();
            let mut tasks = self.tasks.lock().await;
            let handle = tasks.set.spawn(serve_device(
                shared,
                identity.clone(),
                node_id,
                session,
                cancel,
            ));
            tasks.identities.insert(handle.id(), identity);
            report.started += 1;
        }
        Ok(report)
    }

    /// Cancel every device task, wait for them, and disconnect what is left.
    pub async fn shutdown(&self) {
        self.stop.cancel();
        let mut tasks = self.tasks.lock().await;
        info!("scanner stopping, waiting for {} device tasks", tasks.set.len());
        while let Some(joined) = tasks.set.join_next_with_id().await {
            self.finish(&mut tasks, joined).await;
        }
        self.shared.registry.disconnect_all().await;
        info!("scanner stopped");
    }

    /// Collect finished device tasks; returns how many failed.
    async fn reap(&self) -> usize {
        let mut tasks = self.tasks.lock().await;
        let mut failed = 0;
        while let Some(joined) = tasks.set.try_join_next_with_id() {
            if !self.finish(&mut tasks, joined).await {
                failed += 1;
            }
        }
        failed
    }

    async fn finish(
        &self,
        tasks: &mut DeviceTasks,
        joined: Result<(task::Id, anyhow::Result<()>), task::JoinError>,
    ) -> bool {
        match joined {
            Ok((id, result)) => {
                let identity = tasks.identities.remove(&id);
                match (result, identity) {
                    (Ok(()), _) => true,
                    (Err(e), Some(identity)) => {
                        warn!("{identity}: {e:#}");
                        false
                    }
                    (Err(e), None) => {
                        warn!("device task failed: {e:#}");
                        false
                    }
                }
            }
            Err(e) => {
                let identity = tasks.identities.remove(&e.id());
                match identity {
                    Some(identity) => {
                        error!("{identity}: device task panicked: {e}");
                        // the task never reached its own cleanup
                        if let Some(session) = self.shared.registry.remove(&identity).await {
                            session.lock().await.disconnect().await;
                        }
                    }
                    None => error!("device task panicked: {e}"),
                }
                false
            }
        }
    }
}

/// Lifetime of one device: connect, authenticate, relay, always clean up.
async fn serve_device(
    shared: Shared,
    identity: DeviceIdentity,
    node_id: Option<String>,
    session: SessionHandle,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let mut active = false;
    let result = connect_and_relay(&shared, &session, node_id.as_deref(), &cancel, &mut active).await;

    session.lock().await.disconnect().await;
    if let (true, Some(node_id)) = (active, node_id.as_deref()) {
        if let Err(e) = shared.status.report(node_id, ConnectionStatus::Inactive).await {
            warn!("{identity}: failed to report {node_id} inactive: {e:#}");
        }
    }
    shared.registry.release(&identity, &session).await;
    result
}

/// Where a device task stands once set up
enum Attached {
    /// Prefix match with no node id; verified and let go
    Unregistered,
    /// Authenticated, but the node has no sensor data characteristic
    Silent,
    Streaming(NotificationStream),
}

async fn connect_and_relay(
    shared: &Shared,
    session: &SessionHandle,
    node_id: Option<&str>,
    cancel: &CancellationToken,
    active: &mut bool,
) -> anyhow::Result<()> {
    let attached = tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        attached = attach(shared, session, node_id, active) => attached?,
    };

    match attached {
        Attached::Unregistered => {}
        Attached::Silent => hold(session, shared.settings.liveness_interval, cancel).await,
        Attached::Streaming(stream) => {
            relay(
                session,
                stream,
                shared.sink.as_ref(),
                shared.settings.liveness_interval,
                cancel,
            )
            .await;
        }
    }
    Ok(())
}

/// Open, authenticate and subscribe, holding the session lock throughout.
async fn attach(
    shared: &Shared,
    session: &SessionHandle,
    node_id: Option<&str>,
    active: &mut bool,
) -> anyhow::Result<Attached> {
    let mut session = session.lock().await;
    let identity = session.identity().clone();
    session.open(shared.adapter.as_ref()).await?;

    let Some(node_id) = node_id else {
        info!("{identity}: node not registered, releasing");
        return Ok(Attached::Unregistered);
    };
    let code = session.authenticate(node_id).await?;
    if !code.is_ok() {
        bail!("node rejected authentication as {node_id}: {code}");
    }

    *active = true;
    if let Err(e) = shared.status.report(node_id, ConnectionStatus::Active).await {
        warn!("{identity}: failed to report {node_id} active: {e:#}");
    }
    if !session.has_telemetry() {
        info!("{identity}: no sensor data from {node_id}, holding the link");
        return Ok(Attached::Silent);
    }
    Ok(Attached::Streaming(session.subscribe_sensor_data().await?))
}

/// Keep an authenticated link open until it drops or we are cancelled.
async fn hold(session: &SessionHandle, liveness_interval: Duration, cancel: &CancellationToken) {
    let mut liveness = tokio::time::interval(liveness_interval);
    liveness.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    liveness.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = liveness.tick() => {
                if !session.lock().await.check_link().await {
                    break;
                }
            }
        }
    }
}
