//! Mesh data model used by the provisioning core
//!
//! Addresses, device identities, the capability snapshot and the read-only
//! network model.

pub mod address;
pub mod capabilities;
pub mod identity;
pub mod network;

pub use address::{AddressError, AddressKind, MeshAddress, UnicastRange};
pub use capabilities::{
    AuthMethod, AuthMethodKind, AuthValue, CapabilityError, InputAction, OutputAction,
    ProvisioningCapabilities,
};
pub use identity::{DeviceIdentity, DeviceRef};
pub use network::{ApplicationKey, MeshNetwork, NetworkKey, NodeRecord};
