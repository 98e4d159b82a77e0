//! Device identity
//!
//! A physical node is known by its device UUID. The Bluetooth address it
//! advertises under is not stable: once provisioned, the node switches from the
//! unprovisioned beacon to node-identity advertising and may rotate its address.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Stable identifier of a physical node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceIdentity(pub Uuid);

impl DeviceIdentity {
    pub fn new(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle the transport uses to reach a device
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceRef {
    /// Platform Bluetooth address (may rotate)
    pub address: String,
    /// Advertised local name, if any
    pub name: Option<String>,
    /// Identity the device is known under
    pub identity: DeviceIdentity,
}

impl DeviceRef {
    pub fn new(address: impl Into<String>, identity: DeviceIdentity) -> Self {
        Self {
            address: address.into(),
            name: None,
            identity,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Same device reached under a different Bluetooth address
    pub fn with_address(&self, address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            name: self.name.clone(),
            identity: self.identity,
        }
    }
}

impl fmt::Display for DeviceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} ({}, {})", name, self.address, self.identity),
            None => write!(f, "{} ({})", self.address, self.identity),
        }
    }
}
