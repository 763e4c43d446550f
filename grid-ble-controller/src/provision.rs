//! Provisioning: push node id, WiFi and hub settings to a node, then reboot it

use std::fmt;

use log::{info, warn};

use grid_proto::ResponseCode;

use crate::session::DeviceSession;

/// Everything a node needs to join the grid
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisioningRequest {
    /// Node id to assign
    pub node_id: String,
    /// Node id the device currently authenticates with, if it differs from
    /// `node_id` (re-provisioning a node under a new id)
    pub auth_node_id: Option<String>,
    pub ssid: String,
    pub password: String,
    pub hub_url: String,
    pub hub_port: u16,
    /// Sensor reporting interval in seconds; left unchanged if unset
    pub interval: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisioningStep {
    Authenticate,
    SetNodeId,
    SetWifi,
    SetHubUrl,
    SetInterval,
    Reboot,
}

impl fmt::Display for ProvisioningStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProvisioningStep::Authenticate => "authenticate",
            ProvisioningStep::SetNodeId => "set node id",
            ProvisioningStep::SetWifi => "set WiFi credentials",
            ProvisioningStep::SetHubUrl => "set hub URL",
            ProvisioningStep::SetInterval => "set interval",
            ProvisioningStep::Reboot => "reboot",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisioningReport {
    pub completed: Vec<ProvisioningStep>,
}

/// Where provisioning stopped. Steps already acknowledged stay applied on
/// the node.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("provisioning failed at {step}: {reason}")]
pub struct ProvisioningFailure {
    pub step: ProvisioningStep,
    pub reason: String,
    pub completed: Vec<ProvisioningStep>,
}

/// Run the provisioning sequence on an open (`Ready`) session.
pub async fn provision(
    session: &mut DeviceSession,
    request: &ProvisioningRequest,
) -> Result<ProvisioningReport, ProvisioningFailure> {
    let identity = session.identity().clone();
    let auth_node_id = request.auth_node_id.as_deref().unwrap_or(&request.node_id);
    let mut completed = Vec::new();

    let mut steps = vec![
        ProvisioningStep::Authenticate,
        ProvisioningStep::SetNodeId,
        ProvisioningStep::SetWifi,
        ProvisioningStep::SetHubUrl,
    ];
    if request.interval.is_some() {
        steps.push(ProvisioningStep::SetInterval);
    }
    steps.push(ProvisioningStep::Reboot);

    for step in steps {
        let result = match step {
            ProvisioningStep::Authenticate => session.authenticate(auth_node_id).await,
            ProvisioningStep::SetNodeId => session.set_node_id(&request.node_id).await,
            ProvisioningStep::SetWifi => session.set_wifi(&request.ssid, &request.password).await,
            ProvisioningStep::SetHubUrl => {
                session.set_hub_url(&request.hub_url, request.hub_port).await
            }
            ProvisioningStep::SetInterval => {
                session.set_interval(request.interval.unwrap_or_default()).await
            }
            ProvisioningStep::Reboot => session.reboot().await,
        };

        let reason = match result {
            Ok(ResponseCode::Ok) => {
                info!("{identity}: {step} ok");
                completed.push(step);
                continue;
            }
            Ok(ResponseCode::NotAuthenticated) if step == ProvisioningStep::Authenticate => {
                format!("node rejected node id {auth_node_id:?}")
            }
            Ok(ResponseCode::NotAuthenticated) => "node dropped the authentication".to_string(),
            Ok(ResponseCode::Error(Some(code))) => format!("node answered error 0x{code:02x}"),
            Ok(ResponseCode::Error(None)) => "node sent an empty response".to_string(),
            Err(e) => e.to_string(),
        };
        warn!("{identity}: provisioning stopped at {step}: {reason}");
        return Err(ProvisioningFailure {
            step,
            reason,
            completed,
        });
    }

    info!("{identity}: provisioned as {}", request.node_id);
    Ok(ProvisioningReport { completed })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use grid_proto::ble::opcodes;

    use super::*;
    use crate::config::SessionSettings;
    use crate::fake::{FakeAdapter, FakeNode};
    use crate::identity::MacAddress;
    use crate::session::SessionState;

    fn request() -> ProvisioningRequest {
        ProvisioningRequest {
            node_id: "garden-01".to_string(),
            auth_node_id: None,
            ssid: "Home".to_string(),
            password: "secret123".to_string(),
            hub_url: "http://hub.local".to_string(),
            hub_port: 5001,
            interval: None,
        }
    }

    async fn open(node: FakeNode) -> (Arc<FakeNode>, DeviceSession) {
        let node = Arc::new(node);
        let adapter = FakeAdapter::new();
        adapter.add_node(node.clone());
        let mut session = DeviceSession::new(node.identity().clone(), SessionSettings::default());
        session.open(&adapter).await.unwrap();
        (node, session)
    }

    fn mac() -> MacAddress {
        MacAddress::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x20])
    }

    #[tokio::test(start_paused = true)]
    async fn full_sequence_in_order() {
        let (node, mut session) = open(FakeNode::new(mac(), None)).await;
        let request = ProvisioningRequest {
            interval: Some(60),
            ..request()
        };

        let report = provision(&mut session, &request).await.unwrap();

        assert_eq!(report.completed.len(), 6);
        assert_eq!(
            node.written_opcodes(),
            vec![
                opcodes::AUTHENTICATE,
                opcodes::SET_NODE_ID,
                opcodes::SET_WIFI,
                opcodes::SET_HUB_URL,
                opcodes::SET_INTERVAL,
                opcodes::REBOOT,
            ]
        );
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(node.written()[3], {
            let mut frame = vec![opcodes::SET_HUB_URL, 16];
            frame.extend_from_slice(b"http://hub.local");
            frame.extend_from_slice(&[0x89, 0x13]);
            frame
        });
    }

    #[tokio::test(start_paused = true)]
    async fn stops_at_rejected_wifi() {
        let (node, mut session) =
            open(FakeNode::new(mac(), None).respond(opcodes::SET_WIFI, &[0x02])).await;

        let failure = provision(&mut session, &request()).await.unwrap_err();

        assert_eq!(failure.step, ProvisioningStep::SetWifi);
        assert_eq!(
            failure.completed,
            vec![ProvisioningStep::Authenticate, ProvisioningStep::SetNodeId]
        );
        assert!(failure.reason.contains("0x02"));
        assert!(!node.written_opcodes().contains(&opcodes::SET_HUB_URL));
        assert!(!node.written_opcodes().contains(&opcodes::REBOOT));
        assert_eq!(session.state(), SessionState::Authenticated);
    }

    #[tokio::test(start_paused = true)]
    async fn reprovisioning_authenticates_with_the_old_id() {
        let (node, mut session) =
            open(FakeNode::new(mac(), None).expect_node_id("old-node")).await;
        let request = ProvisioningRequest {
            auth_node_id: Some("old-node".to_string()),
            ..request()
        };

        provision(&mut session, &request).await.unwrap();
        assert_eq!(&node.written()[0][1..], grid_proto::node_id_hash("old-node"));
    }

    #[tokio::test(start_paused = true)]
    async fn wrong_node_id_fails_before_anything_is_written() {
        let (node, mut session) =
            open(FakeNode::new(mac(), None).expect_node_id("someone-else")).await;

        let failure = provision(&mut session, &request()).await.unwrap_err();

        assert_eq!(failure.step, ProvisioningStep::Authenticate);
        assert!(failure.completed.is_empty());
        assert_eq!(node.written_opcodes(), vec![opcodes::AUTHENTICATE]);
        assert!(failure.to_string().contains("garden-01"));
    }

    #[tokio::test(start_paused = true)]
    async fn link_loss_midway_is_reported_as_a_precondition() {
        let (node, mut session) = open(FakeNode::new(mac(), None)).await;
        session.authenticate("garden-01").await.unwrap();
        session.set_node_id("garden-01").await.unwrap();
        node.drop_link();

        let err = session.set_wifi("Home", "secret123").await.unwrap_err();
        assert!(err.is_precondition());

        let failure = provision(&mut session, &request()).await.unwrap_err();
        assert_eq!(failure.step, ProvisioningStep::Authenticate);
    }
}
