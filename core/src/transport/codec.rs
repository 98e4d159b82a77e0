//! Mesh codec and crypto engine boundary
//!
//! PDU layout, segmentation and the provisioning cryptography live behind
//! [`MeshCodec`]. The state machine exchanges the logical messages defined here
//! and never looks inside the bytes.

use crate::model::{AuthMethod, AuthValue, MeshAddress, NodeRecord, ProvisioningCapabilities};
use crate::proxy::FilterType;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors for codec operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Malformed PDU: {0}")]
    Malformed(String),
    #[error("Encoding failed: {0}")]
    EncodingFailed(String),
    #[error("Crypto failure: {0}")]
    Crypto(String),
}

/// Outbound provisioning PDUs (provisioner -> device)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProvisioningRequest {
    Invite { attention_duration: u8 },
    Start { method: AuthMethod, public_key_oob: bool },
    PublicKey,
    Confirmation { auth_value: Option<AuthValue> },
    Random,
    Data {
        unicast: MeshAddress,
        net_key_index: u16,
        iv_index: u32,
    },
}

impl ProvisioningRequest {
    pub fn name(&self) -> &'static str {
        match self {
            ProvisioningRequest::Invite { .. } => "Provisioning Invite",
            ProvisioningRequest::Start { .. } => "Provisioning Start",
            ProvisioningRequest::PublicKey => "Provisioning Public Key",
            ProvisioningRequest::Confirmation { .. } => "Provisioning Confirmation",
            ProvisioningRequest::Random => "Provisioning Random",
            ProvisioningRequest::Data { .. } => "Provisioning Data",
        }
    }
}

/// Inbound provisioning PDUs (device -> provisioner)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProvisioningPdu {
    Capabilities(ProvisioningCapabilities),
    PublicKey,
    InputComplete,
    Confirmation,
    /// Device random; the crypto engine has already checked it against the confirmation
    Random,
    Complete,
    Failed { code: u8 },
}

impl ProvisioningPdu {
    pub fn name(&self) -> &'static str {
        match self {
            ProvisioningPdu::Capabilities(_) => "Provisioning Capabilities",
            ProvisioningPdu::PublicKey => "Provisioning Public Key",
            ProvisioningPdu::InputComplete => "Provisioning Input Complete",
            ProvisioningPdu::Confirmation => "Provisioning Confirmation",
            ProvisioningPdu::Random => "Provisioning Random",
            ProvisioningPdu::Complete => "Provisioning Complete",
            ProvisioningPdu::Failed { .. } => "Provisioning Failed",
        }
    }
}

/// Configuration and proxy configuration messages handled by the core
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MeshMessage {
    CompositionDataGet { page: u8 },
    CompositionDataStatus { page: u8, data: Vec<u8> },
    DefaultTtlGet,
    DefaultTtlStatus { ttl: u8 },
    NetworkTransmitSet { count: u8, interval_steps: u8 },
    NetworkTransmitStatus { count: u8, interval_steps: u8 },
    AppKeyAdd {
        net_key_index: u16,
        app_key_index: u16,
        key: Vec<u8>,
    },
    AppKeyStatus {
        status: u8,
        net_key_index: u16,
        app_key_index: u16,
    },
    ProxySetFilterType { filter_type: FilterType },
    ProxyAddAddresses { addresses: Vec<MeshAddress> },
    ProxyRemoveAddresses { addresses: Vec<MeshAddress> },
    ProxyFilterStatus { filter_type: FilterType, list_size: u16 },
    /// Anything else the codec decoded; passed through to observers
    Other { opcode: u32, parameters: Vec<u8> },
}

impl MeshMessage {
    pub fn opcode(&self) -> u32 {
        match self {
            MeshMessage::CompositionDataGet { .. } => 0x8008,
            MeshMessage::CompositionDataStatus { .. } => 0x02,
            MeshMessage::DefaultTtlGet => 0x800C,
            MeshMessage::DefaultTtlStatus { .. } => 0x800E,
            MeshMessage::NetworkTransmitSet { .. } => 0x8024,
            MeshMessage::NetworkTransmitStatus { .. } => 0x8025,
            MeshMessage::AppKeyAdd { .. } => 0x00,
            MeshMessage::AppKeyStatus { .. } => 0x8003,
            MeshMessage::ProxySetFilterType { .. } => 0x00,
            MeshMessage::ProxyAddAddresses { .. } => 0x01,
            MeshMessage::ProxyRemoveAddresses { .. } => 0x02,
            MeshMessage::ProxyFilterStatus { .. } => 0x03,
            MeshMessage::Other { opcode, .. } => *opcode,
        }
    }

    /// Proxy configuration messages travel on the proxy bearer, not the mesh
    pub fn is_proxy_configuration(&self) -> bool {
        matches!(
            self,
            MeshMessage::ProxySetFilterType { .. }
                | MeshMessage::ProxyAddAddresses { .. }
                | MeshMessage::ProxyRemoveAddresses { .. }
                | MeshMessage::ProxyFilterStatus { .. }
        )
    }
}

impl fmt::Display for MeshMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeshMessage::CompositionDataGet { page } => write!(f, "Config Composition Data Get (page {})", page),
            MeshMessage::CompositionDataStatus { page, data } => {
                write!(f, "Config Composition Data Status (page {}, {} bytes)", page, data.len())
            }
            MeshMessage::DefaultTtlGet => write!(f, "Config Default TTL Get"),
            MeshMessage::DefaultTtlStatus { ttl } => write!(f, "Config Default TTL Status ({})", ttl),
            MeshMessage::NetworkTransmitSet { count, interval_steps } => {
                write!(f, "Config Network Transmit Set ({}, {})", count, interval_steps)
            }
            MeshMessage::NetworkTransmitStatus { count, interval_steps } => {
                write!(f, "Config Network Transmit Status ({}, {})", count, interval_steps)
            }
            MeshMessage::AppKeyAdd { app_key_index, .. } => write!(f, "Config AppKey Add ({})", app_key_index),
            MeshMessage::AppKeyStatus { status, .. } => write!(f, "Config AppKey Status (0x{:02X})", status),
            MeshMessage::ProxySetFilterType { filter_type } => write!(f, "Set Filter Type ({})", filter_type),
            MeshMessage::ProxyAddAddresses { addresses } => write!(f, "Add Addresses ({})", addresses.len()),
            MeshMessage::ProxyRemoveAddresses { addresses } => {
                write!(f, "Remove Addresses ({})", addresses.len())
            }
            MeshMessage::ProxyFilterStatus { filter_type, list_size } => {
                write!(f, "Filter Status ({}, {})", filter_type, list_size)
            }
            MeshMessage::Other { opcode, .. } => write!(f, "Opcode 0x{:04X}", opcode),
        }
    }
}

/// A decoded access or proxy configuration message with its addressing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshPdu {
    pub src: MeshAddress,
    pub dst: MeshAddress,
    pub message: MeshMessage,
}

/// Result of feeding one inbound network PDU to the codec
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decoded {
    /// A complete message
    Message(MeshPdu),
    /// One segment of a segmented message; more are expected
    Segment { src: MeshAddress, dst: MeshAddress },
    /// Valid PDU with nothing for the core (beacons, relayed traffic for others)
    Ignored,
}

/// Codec / crypto engine used by the state machine
pub trait MeshCodec: Send + Sync {
    fn encode_provisioning(&self, request: &ProvisioningRequest) -> Result<Vec<u8>, CodecError>;

    fn decode_provisioning(&self, pdu: &[u8]) -> Result<ProvisioningPdu, CodecError>;

    /// Encode a message to `dst`; proxy configuration messages use the unassigned address
    fn encode_mesh(&self, dst: MeshAddress, message: &MeshMessage) -> Result<Vec<u8>, CodecError>;

    fn decode_mesh(&self, pdu: &[u8]) -> Result<Decoded, CodecError>;

    /// Whether node-identity service data was produced by `node`
    fn identity_matches(&self, node: &NodeRecord, service_data: &[u8]) -> bool;

    /// Human readable text for a Provisioning Failed error code
    fn failure_reason(&self, code: u8) -> String {
        provisioning_failure_reason(code).to_string()
    }
}

/// Error codes carried by the Provisioning Failed PDU
pub fn provisioning_failure_reason(code: u8) -> &'static str {
    match code {
        0x00 => "Prohibited",
        0x01 => "Invalid PDU",
        0x02 => "Invalid format",
        0x03 => "Unexpected PDU",
        0x04 => "Confirmation failed",
        0x05 => "Out of resources",
        0x06 => "Decryption failed",
        0x07 => "Unexpected error",
        0x08 => "Cannot assign addresses",
        0x09 => "Invalid data",
        _ => "Reserved for future use",
    }
}

/// Loopback codec that carries logical messages as JSON.
///
/// Used by simulators and tests in place of the real crypto engine: every
/// outbound request is serialized as-is and inbound bytes are parsed back into
/// logical PDUs. Node identity advertisements are the raw device UUID bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl JsonCodec {
    pub fn new() -> Self {
        Self
    }

    /// Bytes a device would send for `pdu`
    pub fn provisioning_pdu(pdu: &ProvisioningPdu) -> Vec<u8> {
        serde_json::to_vec(pdu).unwrap_or_default()
    }

    /// Bytes a node would send for a complete message
    pub fn mesh_pdu(src: MeshAddress, dst: MeshAddress, message: MeshMessage) -> Vec<u8> {
        serde_json::to_vec(&Decoded::Message(MeshPdu { src, dst, message })).unwrap_or_default()
    }

    /// Bytes of a lone segment of a segmented message
    pub fn segment(src: MeshAddress, dst: MeshAddress) -> Vec<u8> {
        serde_json::to_vec(&Decoded::Segment { src, dst }).unwrap_or_default()
    }

    /// Node identity service data for `node`
    pub fn node_identity_data(node: &NodeRecord) -> Vec<u8> {
        node.identity.uuid().as_bytes().to_vec()
    }

    /// Parse bytes produced by `encode_provisioning`
    pub fn parse_request(bytes: &[u8]) -> Result<ProvisioningRequest, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Malformed(e.to_string()))
    }

    /// Parse bytes produced by `encode_mesh`
    pub fn parse_outbound(bytes: &[u8]) -> Result<(MeshAddress, MeshMessage), CodecError> {
        let frame: OutboundFrame =
            serde_json::from_slice(bytes).map_err(|e| CodecError::Malformed(e.to_string()))?;
        Ok((frame.dst, frame.message))
    }
}

#[derive(Serialize, Deserialize)]
struct OutboundFrame {
    dst: MeshAddress,
    message: MeshMessage,
}

impl MeshCodec for JsonCodec {
    fn encode_provisioning(&self, request: &ProvisioningRequest) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(request).map_err(|e| CodecError::EncodingFailed(e.to_string()))
    }

    fn decode_provisioning(&self, pdu: &[u8]) -> Result<ProvisioningPdu, CodecError> {
        serde_json::from_slice(pdu).map_err(|e| CodecError::Malformed(e.to_string()))
    }

    fn encode_mesh(&self, dst: MeshAddress, message: &MeshMessage) -> Result<Vec<u8>, CodecError> {
        let frame = OutboundFrame {
            dst,
            message: message.clone(),
        };
        serde_json::to_vec(&frame).map_err(|e| CodecError::EncodingFailed(e.to_string()))
    }

    fn decode_mesh(&self, pdu: &[u8]) -> Result<Decoded, CodecError> {
        serde_json::from_slice(pdu).map_err(|e| CodecError::Malformed(e.to_string()))
    }

    fn identity_matches(&self, node: &NodeRecord, service_data: &[u8]) -> bool {
        service_data == node.identity.uuid().as_bytes()
    }
}
