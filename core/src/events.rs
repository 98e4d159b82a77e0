//! Outbound side of the core: commands for the platform and notifications for the UI

use crate::bookkeeping::TransactionFailure;
use crate::model::{AuthMethod, AuthMethodKind, AuthValue, MeshAddress, ProvisioningCapabilities};
use crate::provisioning::{ConfigStep, LogEntry, ProvisioningState};
use crate::proxy::FilterType;
use crate::transport::{LinkCommand, MeshMessage, ScanCommand};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Error taxonomy carried by failure notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    /// Authentication rejected, invalid capabilities, malformed or unexpected PDU
    Protocol,
    /// Disconnect or link loss
    Transport,
    /// Transaction or reconnect-scan deadline
    Timeout,
    /// Input rejected at the API boundary
    Validation,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Protocol => write!(f, "protocol"),
            FailureKind::Transport => write!(f, "transport"),
            FailureKind::Timeout => write!(f, "timeout"),
            FailureKind::Validation => write!(f, "validation"),
        }
    }
}

/// Result of the post-provisioning reconnection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReconnectOutcome {
    /// Node found advertising its identity at `address`
    Found { address: String },
    /// No matching advertisement inside the scan window
    Timeout,
    /// Node found but every connection attempt failed
    ConnectFailed { attempts: u32 },
}

/// Notifications for the UI layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoreEvent {
    ProvisioningStateChanged {
        state: ProvisioningState,
        log: Vec<LogEntry>,
    },
    CapabilitiesReceived {
        capabilities: ProvisioningCapabilities,
        supported: Vec<AuthMethodKind>,
    },
    /// The user has to act: type the value shown by the device, or enter
    /// `input_value` on the device (Input OOB)
    AuthenticationRequired {
        method: AuthMethod,
        input_value: Option<AuthValue>,
    },
    ConfigurationStepCompleted { step: ConfigStep },
    ConfigurationStepFailed { step: ConfigStep, status: u8 },
    /// The link dropped while a step was outstanding
    ConfigurationInterrupted { step: ConfigStep },
    ProxyFilterChanged {
        filter_type: Option<FilterType>,
        addresses: Vec<MeshAddress>,
    },
    ConnectedProxyAddress { address: MeshAddress },
    TransactionFailed {
        dst: MeshAddress,
        step: Option<ConfigStep>,
        reason: TransactionFailure,
    },
    ReconnectOutcome(ReconnectOutcome),
    Failure { kind: FailureKind, message: String },
    /// Every decoded message, for screens that show raw node state
    MeshMessageReceived { src: MeshAddress, message: MeshMessage },
    SessionClosed,
}

/// Everything the core asks the outside world to do, in order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Output {
    Link(LinkCommand),
    Scan(ScanCommand),
    Notify(CoreEvent),
}

impl Output {
    pub fn as_event(&self) -> Option<&CoreEvent> {
        match self {
            Output::Notify(event) => Some(event),
            _ => None,
        }
    }

    pub fn as_link(&self) -> Option<&LinkCommand> {
        match self {
            Output::Link(command) => Some(command),
            _ => None,
        }
    }
}
