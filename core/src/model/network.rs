/// Read-only snapshot of the mesh network model
///
/// The network database (keys, node list, provisioner ranges) is owned by the
/// layer above. The provisioning core only reads it: to pick the next free
/// unicast range, to find the keys handed to a new node, and to know which
/// address the local provisioner transmits from.

use super::address::{MeshAddress, UnicastRange, MAX_UNICAST_ADDRESS};
use super::identity::DeviceIdentity;
use serde::{Deserialize, Serialize};

/// Network key as stored in the network database
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkKey {
    pub index: u16,
    pub name: String,
    pub key: Vec<u8>,
}

/// Application key, bound to exactly one network key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationKey {
    pub index: u16,
    pub bound_net_key_index: u16,
    pub name: String,
    pub key: Vec<u8>,
}

/// A node already present in the network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub identity: DeviceIdentity,
    pub name: String,
    pub range: UnicastRange,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshNetwork {
    /// Unicast address of the local provisioner, if one has been assigned
    pub provisioner_address: Option<MeshAddress>,
    pub net_keys: Vec<NetworkKey>,
    pub app_keys: Vec<ApplicationKey>,
    pub nodes: Vec<NodeRecord>,
    pub iv_index: u32,
}

impl MeshNetwork {
    pub fn primary_net_key(&self) -> Option<&NetworkKey> {
        self.net_keys.first()
    }

    /// Application key handed to newly provisioned nodes
    pub fn selected_app_key(&self) -> Option<&ApplicationKey> {
        self.app_keys.first()
    }

    pub fn net_key(&self, index: u16) -> Option<&NetworkKey> {
        self.net_keys.iter().find(|k| k.index == index)
    }

    pub fn node(&self, identity: &DeviceIdentity) -> Option<&NodeRecord> {
        self.nodes.iter().find(|n| n.identity == *identity)
    }

    /// Lowest free contiguous unicast range for `element_count` elements.
    ///
    /// Skips the ranges of existing nodes and the provisioner's own address.
    pub fn allocate_unicast(&self, element_count: u8) -> Option<UnicastRange> {
        if element_count == 0 {
            return None;
        }

        let mut occupied: Vec<(u16, u16)> = self
            .nodes
            .iter()
            .map(|n| (n.range.low.value(), n.range.high.value()))
            .collect();
        if let Some(addr) = self.provisioner_address {
            occupied.push((addr.value(), addr.value()));
        }
        occupied.sort_unstable();

        let needed = element_count as u32;
        let mut candidate: u32 = 1;
        for (low, high) in occupied {
            if candidate + needed - 1 < low as u32 {
                break;
            }
            candidate = candidate.max(high as u32 + 1);
        }

        if candidate + needed - 1 > MAX_UNICAST_ADDRESS as u32 {
            return None;
        }
        UnicastRange::for_elements(MeshAddress(candidate as u16), element_count).ok()
    }
}
