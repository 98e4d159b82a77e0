//! Reconnection after provisioning
//!
//! A freshly provisioned node drops the provisioning bearer and comes back as a
//! proxy node advertising its node identity, often under a new Bluetooth
//! address. The supervisor waits a grace period, scans for that identity, and
//! reattaches with a bounded number of connection attempts. It owns no timers;
//! it asks the provisioner to schedule them.

use crate::config::ProvisionerSettings;
use crate::events::ReconnectOutcome;
use crate::model::{DeviceRef, NodeRecord};
use crate::transport::{Advertisement, MeshCodec, MESH_PROXY_SERVICE_UUID};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Timers the supervisor asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReconnectTimer {
    Grace,
    ScanTimeout,
    PreConnect,
    Retry,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectAction {
    Schedule(ReconnectTimer, Duration),
    Cancel(ReconnectTimer),
    StartScan(Uuid),
    StopScan,
    /// First matching advertisement; the node now lives at `address`
    Matched { address: String },
    Connect(DeviceRef),
    Finished(ReconnectOutcome),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectPhase {
    Idle,
    Grace,
    Scanning,
    /// Waiting out the pre-connect delay
    Matched,
    Connecting { attempt: u32 },
    Retrying { attempt: u32 },
    Connected,
    TimedOut,
    Failed,
}

/// Timing taken from the settings when the supervisor is created
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub grace: Duration,
    pub scan_timeout: Duration,
    pub pre_connect_delay: Duration,
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

impl From<&ProvisionerSettings> for ReconnectPolicy {
    fn from(settings: &ProvisionerSettings) -> Self {
        Self {
            grace: settings.reconnect_grace(),
            scan_timeout: settings.reconnect_scan_timeout(),
            pre_connect_delay: settings.pre_connect_delay(),
            max_attempts: settings.connect_attempts.max(1),
            retry_delay: settings.connect_retry_delay(),
        }
    }
}

#[derive(Debug)]
pub struct ReconnectionSupervisor {
    policy: ReconnectPolicy,
    phase: ReconnectPhase,
    node: Option<NodeRecord>,
    device: Option<DeviceRef>,
}

impl ReconnectionSupervisor {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            phase: ReconnectPhase::Idle,
            node: None,
            device: None,
        }
    }

    pub fn phase(&self) -> &ReconnectPhase {
        &self.phase
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    pub fn set_policy(&mut self, policy: ReconnectPolicy) {
        self.policy = policy;
    }

    /// Device handle with the address the node was last seen at
    pub fn device(&self) -> Option<&DeviceRef> {
        self.device.as_ref()
    }

    /// Scanning or connecting; a reset has to stop something
    pub fn is_active(&self) -> bool {
        matches!(
            self.phase,
            ReconnectPhase::Grace
                | ReconnectPhase::Scanning
                | ReconnectPhase::Matched
                | ReconnectPhase::Connecting { .. }
                | ReconnectPhase::Retrying { .. }
        )
    }

    pub fn is_connecting(&self) -> bool {
        matches!(self.phase, ReconnectPhase::Connecting { .. })
    }

    /// Start looking for `node`. Ignored unless idle.
    pub fn trigger(&mut self, node: NodeRecord, device: DeviceRef) -> Vec<ReconnectAction> {
        if self.phase != ReconnectPhase::Idle {
            warn!("Reconnect already triggered ({:?}), ignoring", self.phase);
            return Vec::new();
        }
        info!(
            identity = %node.identity,
            grace_ms = self.policy.grace.as_millis() as u64,
            "Reconnect scheduled"
        );
        self.node = Some(node);
        self.device = Some(device);
        self.phase = ReconnectPhase::Grace;
        vec![ReconnectAction::Schedule(ReconnectTimer::Grace, self.policy.grace)]
    }

    /// Back to idle. Returns the scan stop if a scan was running.
    pub fn reset(&mut self) -> Vec<ReconnectAction> {
        let scanning = self.phase == ReconnectPhase::Scanning;
        self.phase = ReconnectPhase::Idle;
        self.node = None;
        self.device = None;
        if scanning {
            vec![ReconnectAction::StopScan]
        } else {
            Vec::new()
        }
    }

    pub fn on_timer(&mut self, timer: ReconnectTimer) -> Vec<ReconnectAction> {
        match (timer, self.phase.clone()) {
            (ReconnectTimer::Grace, ReconnectPhase::Grace) => {
                debug!("Grace period over, scanning for proxy");
                self.phase = ReconnectPhase::Scanning;
                vec![
                    ReconnectAction::StartScan(MESH_PROXY_SERVICE_UUID),
                    ReconnectAction::Schedule(ReconnectTimer::ScanTimeout, self.policy.scan_timeout),
                ]
            }
            (ReconnectTimer::ScanTimeout, ReconnectPhase::Scanning) => {
                warn!("Reconnecting failed: node not found");
                self.phase = ReconnectPhase::TimedOut;
                vec![
                    ReconnectAction::StopScan,
                    ReconnectAction::Finished(ReconnectOutcome::Timeout),
                ]
            }
            (ReconnectTimer::PreConnect, ReconnectPhase::Matched) => self.connect(1),
            (ReconnectTimer::Retry, ReconnectPhase::Retrying { attempt }) => self.connect(attempt + 1),
            (timer, phase) => {
                debug!("Stale reconnect timer {:?} in {:?}", timer, phase);
                Vec::new()
            }
        }
    }

    /// Scan callback. Only the first advertisement carrying the node's
    /// identity counts; everything else is dropped.
    pub fn on_advertisement(
        &mut self,
        advertisement: &Advertisement,
        codec: &dyn MeshCodec,
    ) -> Vec<ReconnectAction> {
        if self.phase != ReconnectPhase::Scanning {
            debug!("Advertisement from {} ignored in {:?}", advertisement.address, self.phase);
            return Vec::new();
        }
        let Some(node) = &self.node else {
            return Vec::new();
        };
        if !advertisement.advertises(&MESH_PROXY_SERVICE_UUID)
            || !codec.identity_matches(node, &advertisement.service_data)
        {
            debug!("Advertisement from {} does not match {}", advertisement.address, node.identity);
            return Vec::new();
        }

        info!(
            identity = %node.identity,
            address = %advertisement.address,
            rssi = advertisement.rssi,
            "Node identity matched"
        );
        if let Some(device) = &self.device {
            self.device = Some(device.with_address(advertisement.address.as_str()));
        }
        self.phase = ReconnectPhase::Matched;

        let mut actions = vec![
            ReconnectAction::StopScan,
            ReconnectAction::Cancel(ReconnectTimer::ScanTimeout),
            ReconnectAction::Matched {
                address: advertisement.address.clone(),
            },
        ];
        if self.policy.pre_connect_delay.is_zero() {
            actions.extend(self.connect(1));
        } else {
            actions.push(ReconnectAction::Schedule(
                ReconnectTimer::PreConnect,
                self.policy.pre_connect_delay,
            ));
        }
        actions
    }

    /// The proxy link is ready
    pub fn on_connected(&mut self) -> Vec<ReconnectAction> {
        let ReconnectPhase::Connecting { attempt } = self.phase else {
            return Vec::new();
        };
        let address = self
            .device
            .as_ref()
            .map(|d| d.address.clone())
            .unwrap_or_default();
        info!(address = %address, attempt, "Reconnected to node");
        self.phase = ReconnectPhase::Connected;
        vec![ReconnectAction::Finished(ReconnectOutcome::Found { address })]
    }

    /// A connection attempt failed or dropped before the link was ready
    pub fn on_connect_failed(&mut self) -> Vec<ReconnectAction> {
        let ReconnectPhase::Connecting { attempt } = self.phase else {
            return Vec::new();
        };
        if attempt < self.policy.max_attempts {
            info!(
                attempt,
                max_attempts = self.policy.max_attempts,
                "Connection attempt failed, retrying"
            );
            self.phase = ReconnectPhase::Retrying { attempt };
            vec![ReconnectAction::Schedule(ReconnectTimer::Retry, self.policy.retry_delay)]
        } else {
            warn!(attempts = attempt, "Connection attempts exhausted");
            self.phase = ReconnectPhase::Failed;
            vec![ReconnectAction::Finished(ReconnectOutcome::ConnectFailed {
                attempts: attempt,
            })]
        }
    }

    fn connect(&mut self, attempt: u32) -> Vec<ReconnectAction> {
        let Some(device) = self.device.clone() else {
            return Vec::new();
        };
        debug!("Connect attempt {} to {}", attempt, device);
        self.phase = ReconnectPhase::Connecting { attempt };
        vec![ReconnectAction::Connect(device)]
    }
}
