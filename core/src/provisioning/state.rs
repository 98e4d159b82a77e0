/// Provisioning states and the append-only transition log
///
/// The states form a line with a four-way branch for the authentication method.
/// Two terminal states sit outside the line: `ProvisioningFailed` and
/// `ProvisionerUnassigned`. The log records every transition with its direction
/// and never rewrites an entry.

use crate::model::AuthMethodKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("Transition {from} -> {to} goes backwards")]
    Backwards {
        from: ProvisioningState,
        to: ProvisioningState,
    },
    #[error("Session is in terminal state {0}")]
    Terminal(ProvisioningState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProvisioningState {
    Discovered,
    Inviting,
    CapabilitiesReceived,
    NoOob,
    StaticOob,
    OutputOob,
    InputOob,
    PublicKeyExchanged,
    AuthenticationWaiting,
    AuthenticationConfirmed,
    RandomExchanged,
    DataSent,
    ProvisioningComplete,
    Reconnecting,
    CompositionDataRequested,
    DefaultTtlRequested,
    NetworkTransmitRequested,
    AppKeyAddRequested,
    ConfigurationComplete,
    ProvisioningFailed,
    ProvisionerUnassigned,
}

impl ProvisioningState {
    /// Position on the line; the four branch states share one rank
    pub fn rank(&self) -> u8 {
        match self {
            ProvisioningState::Discovered => 0,
            ProvisioningState::Inviting => 1,
            ProvisioningState::CapabilitiesReceived => 2,
            ProvisioningState::NoOob
            | ProvisioningState::StaticOob
            | ProvisioningState::OutputOob
            | ProvisioningState::InputOob => 3,
            ProvisioningState::PublicKeyExchanged => 4,
            ProvisioningState::AuthenticationWaiting => 5,
            ProvisioningState::AuthenticationConfirmed => 6,
            ProvisioningState::RandomExchanged => 7,
            ProvisioningState::DataSent => 8,
            ProvisioningState::ProvisioningComplete => 9,
            ProvisioningState::Reconnecting => 10,
            ProvisioningState::CompositionDataRequested => 11,
            ProvisioningState::DefaultTtlRequested => 12,
            ProvisioningState::NetworkTransmitRequested => 13,
            ProvisioningState::AppKeyAddRequested => 14,
            ProvisioningState::ConfigurationComplete => 15,
            ProvisioningState::ProvisioningFailed | ProvisioningState::ProvisionerUnassigned => {
                u8::MAX
            }
        }
    }

    /// Branch state entered for an authentication method
    pub fn for_method(kind: AuthMethodKind) -> Self {
        match kind {
            AuthMethodKind::NoOob => ProvisioningState::NoOob,
            AuthMethodKind::StaticOob => ProvisioningState::StaticOob,
            AuthMethodKind::OutputOob => ProvisioningState::OutputOob,
            AuthMethodKind::InputOob => ProvisioningState::InputOob,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProvisioningState::ProvisioningFailed
                | ProvisioningState::ProvisionerUnassigned
                | ProvisioningState::ConfigurationComplete
        )
    }

    /// Provisioning has not finished yet; transport loss here is fatal
    pub fn is_pre_complete(&self) -> bool {
        self.rank() < ProvisioningState::ProvisioningComplete.rank()
    }

    /// The device is a provisioned node (possibly not yet configured)
    pub fn is_provisioned(&self) -> bool {
        let rank = self.rank();
        rank >= ProvisioningState::ProvisioningComplete.rank()
            && rank <= ProvisioningState::ConfigurationComplete.rank()
    }

    /// One of the four authentication branch states
    pub fn is_oob_branch(&self) -> bool {
        self.rank() == 3
    }
}

impl fmt::Display for ProvisioningState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ProvisioningState::Discovered => "Discovered",
            ProvisioningState::Inviting => "Inviting",
            ProvisioningState::CapabilitiesReceived => "Capabilities received",
            ProvisioningState::NoOob => "No OOB",
            ProvisioningState::StaticOob => "Static OOB",
            ProvisioningState::OutputOob => "Output OOB",
            ProvisioningState::InputOob => "Input OOB",
            ProvisioningState::PublicKeyExchanged => "Public key exchanged",
            ProvisioningState::AuthenticationWaiting => "Waiting for authentication",
            ProvisioningState::AuthenticationConfirmed => "Authentication confirmed",
            ProvisioningState::RandomExchanged => "Random exchanged",
            ProvisioningState::DataSent => "Provisioning data sent",
            ProvisioningState::ProvisioningComplete => "Provisioning complete",
            ProvisioningState::Reconnecting => "Reconnecting",
            ProvisioningState::CompositionDataRequested => "Composition data requested",
            ProvisioningState::DefaultTtlRequested => "Default TTL requested",
            ProvisioningState::NetworkTransmitRequested => "Network transmit requested",
            ProvisioningState::AppKeyAddRequested => "App key add requested",
            ProvisioningState::ConfigurationComplete => "Configuration complete",
            ProvisioningState::ProvisioningFailed => "Provisioning failed",
            ProvisioningState::ProvisionerUnassigned => "Provisioner unassigned",
        };
        f.write_str(text)
    }
}

/// Who caused a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// We sent a PDU
    Sending,
    /// The device sent a PDU
    Received,
    /// Timer, link event or local decision
    Local,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub sequence: u32,
    pub state: ProvisioningState,
    pub direction: Direction,
    pub timestamp_ms: u64,
}

/// Append-only transition log
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateLog {
    entries: Vec<LogEntry>,
}

impl StateLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a transition. Entries never move backwards along the line and
    /// nothing follows a failure.
    pub fn append(
        &mut self,
        state: ProvisioningState,
        direction: Direction,
        timestamp_ms: u64,
    ) -> Result<&LogEntry, StateError> {
        let timestamp_ms = match self.entries.last() {
            Some(last) => {
                if matches!(
                    last.state,
                    ProvisioningState::ProvisioningFailed | ProvisioningState::ProvisionerUnassigned
                ) {
                    return Err(StateError::Terminal(last.state));
                }
                if state.rank() < last.state.rank() {
                    return Err(StateError::Backwards {
                        from: last.state,
                        to: state,
                    });
                }
                timestamp_ms.max(last.timestamp_ms)
            }
            None => timestamp_ms,
        };

        let sequence = self.entries.len() as u32;
        self.entries.push(LogEntry {
            sequence,
            state,
            direction,
            timestamp_ms,
        });
        Ok(&self.entries[sequence as usize])
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn last(&self) -> Option<&LogEntry> {
        self.entries.last()
    }

    pub fn contains(&self, state: ProvisioningState) -> bool {
        self.entries.iter().any(|e| e.state == state)
    }

    /// States in the order they were entered
    pub fn states(&self) -> Vec<ProvisioningState> {
        self.entries.iter().map(|e| e.state).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
