//! Provisioning session
//!
//! One attempt to take a device from "discovered" to "configured member". The
//! session is owned by the provisioner and is the only place provisioning
//! progress lives.

use super::state::{Direction, ProvisioningState, StateError, StateLog};
use crate::model::{
    AuthMethod, AuthValue, DeviceIdentity, DeviceRef, NodeRecord, ProvisioningCapabilities,
    UnicastRange,
};
use crate::transport::MeshMessage;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use thiserror::Error;
use tracing::info;

/// Post-provisioning configuration steps, in the order they are issued
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ConfigStep {
    CompositionData,
    DefaultTtl,
    NetworkTransmit,
    AppKeyAdd,
}

impl ConfigStep {
    pub const ALL: [ConfigStep; 4] = [
        ConfigStep::CompositionData,
        ConfigStep::DefaultTtl,
        ConfigStep::NetworkTransmit,
        ConfigStep::AppKeyAdd,
    ];

    /// State the session is in while this step is outstanding
    pub fn requested_state(&self) -> ProvisioningState {
        match self {
            ConfigStep::CompositionData => ProvisioningState::CompositionDataRequested,
            ConfigStep::DefaultTtl => ProvisioningState::DefaultTtlRequested,
            ConfigStep::NetworkTransmit => ProvisioningState::NetworkTransmitRequested,
            ConfigStep::AppKeyAdd => ProvisioningState::AppKeyAddRequested,
        }
    }

    pub fn request_opcode(&self) -> u32 {
        match self {
            ConfigStep::CompositionData => 0x8008,
            ConfigStep::DefaultTtl => 0x800C,
            ConfigStep::NetworkTransmit => 0x8024,
            ConfigStep::AppKeyAdd => 0x00,
        }
    }

    pub fn response_opcode(&self) -> u32 {
        match self {
            ConfigStep::CompositionData => 0x02,
            ConfigStep::DefaultTtl => 0x800E,
            ConfigStep::NetworkTransmit => 0x8025,
            ConfigStep::AppKeyAdd => 0x8003,
        }
    }

    /// Whether `message` is the status this step waits for
    pub fn is_response(&self, message: &MeshMessage) -> bool {
        matches!(
            (self, message),
            (ConfigStep::CompositionData, MeshMessage::CompositionDataStatus { .. })
                | (ConfigStep::DefaultTtl, MeshMessage::DefaultTtlStatus { .. })
                | (ConfigStep::NetworkTransmit, MeshMessage::NetworkTransmitStatus { .. })
                | (ConfigStep::AppKeyAdd, MeshMessage::AppKeyStatus { .. })
        )
    }
}

impl fmt::Display for ConfigStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigStep::CompositionData => write!(f, "Composition Data Get"),
            ConfigStep::DefaultTtl => write!(f, "Default TTL Get"),
            ConfigStep::NetworkTransmit => write!(f, "Network Transmit Set"),
            ConfigStep::AppKeyAdd => write!(f, "App Key Add"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StepError {
    #[error("{step} completed before {expected}")]
    OutOfOrder { step: ConfigStep, expected: ConfigStep },
    #[error("Configuration already finished")]
    AlreadyFinished,
}

/// Completed configuration steps.
///
/// Steps complete strictly in order, so progress is a single position rather
/// than four independent flags; "app key added but TTL never received" cannot
/// be expressed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigProgress {
    last_completed: Option<ConfigStep>,
    app_key_skipped: bool,
}

impl ConfigProgress {
    /// The step that must complete next, if any
    pub fn next_expected(&self) -> Option<ConfigStep> {
        if self.app_key_skipped {
            return None;
        }
        match self.last_completed {
            None => Some(ConfigStep::CompositionData),
            Some(ConfigStep::CompositionData) => Some(ConfigStep::DefaultTtl),
            Some(ConfigStep::DefaultTtl) => Some(ConfigStep::NetworkTransmit),
            Some(ConfigStep::NetworkTransmit) => Some(ConfigStep::AppKeyAdd),
            Some(ConfigStep::AppKeyAdd) => None,
        }
    }

    pub fn complete(&mut self, step: ConfigStep) -> Result<(), StepError> {
        match self.next_expected() {
            Some(expected) if expected == step => {
                self.last_completed = Some(step);
                Ok(())
            }
            Some(expected) => Err(StepError::OutOfOrder { step, expected }),
            None => Err(StepError::AlreadyFinished),
        }
    }

    /// Finish without App Key Add (no application keys in the network)
    pub fn skip_app_key(&mut self) -> Result<(), StepError> {
        match self.next_expected() {
            Some(ConfigStep::AppKeyAdd) => {
                self.app_key_skipped = true;
                Ok(())
            }
            Some(expected) => Err(StepError::OutOfOrder {
                step: ConfigStep::AppKeyAdd,
                expected,
            }),
            None => Err(StepError::AlreadyFinished),
        }
    }

    pub fn is_completed(&self, step: ConfigStep) -> bool {
        self.last_completed.map_or(false, |last| step <= last)
    }

    pub fn is_composition_data_received(&self) -> bool {
        self.is_completed(ConfigStep::CompositionData)
    }

    pub fn is_default_ttl_received(&self) -> bool {
        self.is_completed(ConfigStep::DefaultTtl)
    }

    pub fn is_network_transmit_set(&self) -> bool {
        self.is_completed(ConfigStep::NetworkTransmit)
    }

    pub fn is_app_key_added(&self) -> bool {
        self.is_completed(ConfigStep::AppKeyAdd)
    }

    pub fn is_app_key_skipped(&self) -> bool {
        self.app_key_skipped
    }

    pub fn is_finished(&self) -> bool {
        self.next_expected().is_none()
    }
}

/// One provisioning attempt
#[derive(Debug, Clone)]
pub struct Session {
    device: DeviceRef,
    state: ProvisioningState,
    log: StateLog,
    pub capabilities: Option<ProvisioningCapabilities>,
    pub method: Option<AuthMethod>,
    /// Value shown to the user for Input OOB
    pub input_oob_value: Option<AuthValue>,
    /// Our Provisioning Confirmation is on the air
    pub confirmation_sent: bool,
    pub unicast_range: Option<UnicastRange>,
    /// Set once provisioning completes
    pub node: Option<NodeRecord>,
    pub progress: ConfigProgress,
    /// Configuration steps not yet issued, in order
    pub pending_steps: VecDeque<ConfigStep>,
    /// Step whose request is on the air
    pub active_step: Option<ConfigStep>,
    /// Step given up on after a timeout or link loss
    pub abandoned_step: Option<ConfigStep>,
    pub composition_data: Option<Vec<u8>>,
    pub default_ttl: Option<u8>,
    pub failure_reason: Option<String>,
}

impl Session {
    /// New session for `device`, starting in `Discovered`
    pub fn new(device: DeviceRef, now_ms: u64) -> Self {
        let mut log = StateLog::new();
        // an empty log accepts any first entry
        let _ = log.append(ProvisioningState::Discovered, Direction::Local, now_ms);
        Self {
            device,
            state: ProvisioningState::Discovered,
            log,
            capabilities: None,
            method: None,
            input_oob_value: None,
            confirmation_sent: false,
            unicast_range: None,
            node: None,
            progress: ConfigProgress::default(),
            pending_steps: VecDeque::new(),
            active_step: None,
            abandoned_step: None,
            composition_data: None,
            default_ttl: None,
            failure_reason: None,
        }
    }

    pub fn device(&self) -> &DeviceRef {
        &self.device
    }

    pub fn identity(&self) -> DeviceIdentity {
        self.device.identity
    }

    /// Follow the node to a new Bluetooth address; the identity never changes
    pub fn update_device_address(&mut self, address: &str) {
        self.device = self.device.with_address(address);
    }

    pub fn state(&self) -> ProvisioningState {
        self.state
    }

    pub fn log(&self) -> &StateLog {
        &self.log
    }

    pub fn transition(
        &mut self,
        to: ProvisioningState,
        direction: Direction,
        now_ms: u64,
    ) -> Result<(), StateError> {
        self.log.append(to, direction, now_ms)?;
        info!("Session {}: {} -> {}", self.device.identity, self.state, to);
        self.state = to;
        Ok(())
    }

    /// Enter `ProvisioningFailed` with a reason
    pub fn fail(
        &mut self,
        reason: impl Into<String>,
        direction: Direction,
        now_ms: u64,
    ) -> Result<(), StateError> {
        self.transition(ProvisioningState::ProvisioningFailed, direction, now_ms)?;
        self.failure_reason = Some(reason.into());
        Ok(())
    }

    /// Queue the configuration sequence issued after provisioning
    pub fn queue_configuration(&mut self, include_app_key: bool) {
        self.pending_steps.clear();
        self.pending_steps.extend(
            ConfigStep::ALL
                .iter()
                .copied()
                .filter(|step| include_app_key || *step != ConfigStep::AppKeyAdd),
        );
    }

    /// Drop queued configuration work (transaction failure)
    pub fn clear_pending_steps(&mut self) {
        self.pending_steps.clear();
    }

    /// Re-queue `step` and everything after it
    pub fn requeue_from(&mut self, step: ConfigStep, include_app_key: bool) {
        self.pending_steps.clear();
        self.pending_steps.extend(
            ConfigStep::ALL
                .iter()
                .copied()
                .filter(|s| *s >= step)
                .filter(|s| include_app_key || *s != ConfigStep::AppKeyAdd),
        );
    }

    /// Provisioned but configuration did not finish
    pub fn is_partial(&self) -> bool {
        self.state.is_provisioned() && self.state != ProvisioningState::ConfigurationComplete
    }
}
