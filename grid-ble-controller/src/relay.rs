//! Sensor data relay: notification stream in, readings out

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::StreamExt;
use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;

use grid_proto::SensorPayload;

use crate::collaborators::{Reading, TelemetrySink};
use crate::session::SessionHandle;
use crate::transport::NotificationStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayExit {
    Cancelled,
    StreamEnded,
    LinkLost,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Readings accepted by the sink
    pub forwarded: u64,
    /// Notifications that failed to parse plus readings the sink rejected
    pub dropped: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayOutcome {
    pub exit: RelayExit,
    pub stats: RelayStats,
}

/// Flatten one payload into readings. `fallback_device_id` is used when the
/// node left its id empty, `now` when it sent no timestamp.
pub fn readings(payload: &SensorPayload, fallback_device_id: &str, now: u64) -> Vec<Reading> {
    let device_id = if payload.node_id.is_empty() {
        fallback_device_id
    } else {
        payload.node_id.as_str()
    };
    let timestamp = payload.timestamp_secs().unwrap_or(now);
    let reading = |measurement_type: &str, value: f64, unit: &str| Reading {
        device_id: device_id.to_string(),
        measurement_type: measurement_type.to_string(),
        value,
        unit: unit.to_string(),
        timestamp,
    };

    let mut out: Vec<Reading> = payload
        .sensors
        .iter()
        .map(|s| reading(&s.sensor_type, s.value, s.unit.as_deref().unwrap_or("")))
        .collect();
    if let Some(gps) = &payload.gps {
        out.push(reading("latitude", gps.latitude, "deg"));
        out.push(reading("longitude", gps.longitude, "deg"));
        if let Some(altitude) = gps.altitude {
            out.push(reading("altitude", altitude, "m"));
        }
    }
    out
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Forward notifications from `stream` to `sink` until cancelled, the stream
/// ends, or a liveness check finds the link gone. The session lock is only
/// taken for liveness checks and the final unsubscribe.
pub async fn relay(
    session: &SessionHandle,
    mut stream: NotificationStream,
    sink: &dyn TelemetrySink,
    liveness_interval: Duration,
    cancel: &CancellationToken,
) -> RelayOutcome {
    let (identity, node_id) = {
        let session = session.lock().await;
        (
            session.identity().clone(),
            session.node_id().unwrap_or_default().to_string(),
        )
    };
    let mut stats = RelayStats::default();
    let mut liveness = tokio::time::interval(liveness_interval);
    liveness.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // first tick completes immediately
    liveness.tick().await;

    info!("{identity}: relaying sensor data for {node_id}");
    let exit = loop {
        tokio::select! {
            _ = cancel.cancelled() => break RelayExit::Cancelled,
            _ = liveness.tick() => {
                if !session.lock().await.check_link().await {
                    break RelayExit::LinkLost;
                }
            }
            value = stream.next() => {
                let Some(value) = value else {
                    // a closed stream usually means the link went with it
                    session.lock().await.check_link().await;
                    break RelayExit::StreamEnded;
                };
                let payload = match SensorPayload::parse(&value) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!("{identity}: dropping notification: {e}");
                        stats.dropped += 1;
                        continue;
                    }
                };
                for reading in readings(&payload, &node_id, unix_now()) {
                    debug!(
                        "{identity}: {} {} = {}{}",
                        reading.device_id, reading.measurement_type, reading.value, reading.unit
                    );
                    match sink.ingest(reading).await {
                        Ok(()) => stats.forwarded += 1,
                        Err(e) => {
                            warn!("{identity}: telemetry sink rejected reading: {e:#}");
                            stats.dropped += 1;
                        }
                    }
                }
            }
        }
    };

    session.lock().await.unsubscribe_sensor_data().await;
    info!(
        "{identity}: relay stopped ({exit:?}), {} forwarded, {} dropped",
        stats.forwarded, stats.dropped
    );
    RelayOutcome { exit, stats }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::SessionSettings;
    use crate::fake::{FakeAdapter, FakeNode, MemorySink};
    use crate::identity::MacAddress;
    use crate::session::{DeviceSession, SessionState};

    async fn subscribed() -> (Arc<FakeNode>, SessionHandle, NotificationStream) {
        let node = Arc::new(FakeNode::new(
            MacAddress::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x10]),
            Some("myIoTGrid-EE10"),
        ));
        let adapter = FakeAdapter::new();
        adapter.add_node(node.clone());
        let session =
            DeviceSession::new(node.identity().clone(), SessionSettings::default()).into_handle();
        let stream = {
            let mut s = session.lock().await;
            s.open(&adapter).await.unwrap();
            s.authenticate("garden-01").await.unwrap();
            s.subscribe_sensor_data().await.unwrap()
        };
        (node, session, stream)
    }

    #[test]
    fn readings_fill_in_defaults() {
        let payload = SensorPayload::parse(
            br#"{"nodeId":"","sensors":[{"type":"temperature","value":21.5,"unit":"C"},{"type":"battery","value":87}]}"#,
        )
        .unwrap();
        let out = readings(&payload, "garden-01", 1_700_000_000);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].device_id, "garden-01");
        assert_eq!(out[0].unit, "C");
        assert_eq!(out[1].unit, "");
        assert!(out.iter().all(|r| r.timestamp == 1_700_000_000));
    }

    #[test]
    fn gps_block_adds_position_readings() {
        let payload = SensorPayload::parse(
            br#"{"nodeId":"field-3","timestamp":1700000123,"sensors":[],"gps":{"latitude":48.1,"longitude":11.5,"altitude":520.0,"satellites":7}}"#,
        )
        .unwrap();
        let out = readings(&payload, "ignored", 0);
        let types: Vec<_> = out.iter().map(|r| r.measurement_type.as_str()).collect();
        assert_eq!(types, ["latitude", "longitude", "altitude"]);
        assert!(out.iter().all(|r| r.device_id == "field-3"));
        assert!(out.iter().all(|r| r.timestamp == 1_700_000_123));
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_payloads_do_not_stop_the_relay() {
        let (node, session, stream) = subscribed().await;
        let sink = Arc::new(MemorySink::default());
        let cancel = CancellationToken::new();

        let task = {
            let (session, sink, cancel) = (session.clone(), sink.clone(), cancel.clone());
            tokio::spawn(async move {
                relay(&session, stream, sink.as_ref(), Duration::from_secs(10), &cancel).await
            })
        };

        node.notify(b"{not json");
        node.notify(&[0xff, 0xfe, 0x00]);
        node.notify(br#"{"nodeId":"garden-01","sensors":[{"type":"humidity","value":55.0,"unit":"%"}]}"#);
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let outcome = task.await.unwrap();
        assert_eq!(outcome.exit, RelayExit::Cancelled);
        assert_eq!(outcome.stats, RelayStats { forwarded: 1, dropped: 2 });
        let readings = sink.readings();
        assert_eq!(readings[0].measurement_type, "humidity");
        assert_eq!(node.subscriber_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn sink_failures_are_counted_and_skipped() {
        let (node, session, stream) = subscribed().await;
        let sink = Arc::new(MemorySink::default());
        sink.reject(true);
        let cancel = CancellationToken::new();

        let task = {
            let (session, sink, cancel) = (session.clone(), sink.clone(), cancel.clone());
            tokio::spawn(async move {
                relay(&session, stream, sink.as_ref(), Duration::from_secs(10), &cancel).await
            })
        };
        node.notify(br#"{"nodeId":"garden-01","sensors":[{"type":"co2","value":410}]}"#);
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let outcome = task.await.unwrap();
        assert_eq!(outcome.stats, RelayStats { forwarded: 0, dropped: 1 });
    }

    #[tokio::test(start_paused = true)]
    async fn lost_link_ends_the_relay() {
        let (node, session, stream) = subscribed().await;
        let sink = MemorySink::default();
        node.drop_link();

        let outcome = relay(
            &session,
            stream,
            &sink,
            Duration::from_secs(10),
            &CancellationToken::new(),
        )
        .await;

        // dropping the link also closes the notification channel
        assert!(matches!(outcome.exit, RelayExit::LinkLost | RelayExit::StreamEnded));
        assert_eq!(outcome.stats, RelayStats::default());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_link_is_polled_until_it_drops() {
        let (node, session, stream) = subscribed().await;
        let sink = Arc::new(MemorySink::default());
        let cancel = CancellationToken::new();

        let task = {
            let (session, sink, cancel) = (session.clone(), sink.clone(), cancel.clone());
            tokio::spawn(async move {
                relay(&session, stream, sink.as_ref(), Duration::from_secs(10), &cancel).await
            })
        };
        tokio::time::sleep(Duration::from_secs(35)).await;
        assert!(!task.is_finished());

        node.drop_link();
        let outcome = task.await.unwrap();
        assert!(matches!(outcome.exit, RelayExit::LinkLost | RelayExit::StreamEnded));
        assert_eq!(session.lock().await.state(), SessionState::Disconnected);
        drop(cancel);
    }
}
