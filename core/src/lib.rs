// Mesh provisioning core
//
// Takes an unprovisioned Bluetooth mesh device through provisioning and its
// first configuration over a GATT link, then manages the proxy filter of the
// node it is attached to. The protocol logic is sans-IO; `runtime` drives it
// on tokio against platform transport and scanner implementations.

pub mod bookkeeping;
pub mod config;
pub mod events;
pub mod model;
pub mod provisioner;
pub mod provisioning;
pub mod proxy;
pub mod reconnect;
pub mod runtime;
pub mod transport;

use thiserror::Error;

pub use config::{ProvisionerSettings, SettingsError};
pub use events::{CoreEvent, FailureKind, Output, ReconnectOutcome};
pub use model::{
    AuthMethod, AuthMethodKind, AuthValue, DeviceIdentity, DeviceRef, MeshAddress, MeshNetwork,
    ProvisioningCapabilities,
};
pub use provisioner::{Bearer, Input, LinkState, MeshProvisioner};
pub use provisioning::{ConfigStep, ProvisioningState};
pub use proxy::FilterType;
pub use runtime::{spawn, EventSink, ProvisionerHandle, Snapshot};
pub use transport::{JsonCodec, LinkEvent, MeshCodec, Scanner, TransportLink};

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Errors returned synchronously by provisioner intents
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("No provisioning session")]
    NoSession,
    #[error("A provisioning session is already active")]
    SessionActive,
    #[error("Cannot {operation} in state {state}")]
    InvalidState {
        state: ProvisioningState,
        operation: &'static str,
    },
    #[error("Provisioner has no unicast address")]
    ProvisionerUnassigned,
    #[error("Network has no network key")]
    NoNetworkKey,
    #[error("Link is busy")]
    LinkBusy,
    #[error("Not connected to a proxy node")]
    NotConnected,
    #[error("No abandoned configuration step to resume")]
    NothingToResume,
    #[error("Invalid settings: {0}")]
    Settings(String),
    #[error("Provisioner task stopped")]
    Stopped,
    #[error(transparent)]
    Capability(#[from] model::CapabilityError),
    #[error(transparent)]
    Filter(#[from] proxy::FilterError),
    #[error(transparent)]
    Address(#[from] model::AddressError),
    #[error(transparent)]
    Codec(#[from] transport::CodecError),
}

impl CoreError {
    /// Caller input rejected before anything was sent
    pub fn is_validation(&self) -> bool {
        match self {
            CoreError::Capability(_) | CoreError::Address(_) | CoreError::Settings(_) => true,
            CoreError::Filter(e) => !matches!(e, proxy::FilterError::NotConnected),
            _ => false,
        }
    }
}

impl From<SettingsError> for CoreError {
    fn from(err: SettingsError) -> Self {
        CoreError::Settings(err.to_string())
    }
}

/// Install the default `tracing` subscriber (idempotent).
///
/// Honors `RUST_LOG`, falling back to `info`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
}
