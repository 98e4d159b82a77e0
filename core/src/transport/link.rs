//! Transport link abstraction
//!
//! The platform owns the GATT connection and the radio scanner. The core only
//! sees the events they produce and issues the commands defined here.

use crate::model::DeviceRef;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Mesh Provisioning Service (0x1827)
pub const MESH_PROVISIONING_SERVICE_UUID: Uuid =
    Uuid::from_u128(0x0000_1827_0000_1000_8000_0080_5F9B_34FB);

/// Mesh Proxy Service (0x1828)
pub const MESH_PROXY_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_1828_0000_1000_8000_0080_5F9B_34FB);

/// Errors surfaced by platform transport implementations
#[derive(Error, Debug, Clone)]
pub enum LinkError {
    #[error("Not connected")]
    NotConnected,
    #[error("Connect failed: {0}")]
    ConnectFailed(String),
    #[error("Write failed: {0}")]
    WriteFailed(String),
    #[error("Scan failed: {0}")]
    ScanFailed(String),
    #[error("Platform error: {0}")]
    Platform(String),
}

/// Events from the GATT link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkEvent {
    Connecting,
    Connected,
    ServicesDiscovered,
    /// Notifications enabled, link usable
    Ready,
    Disconnecting,
    Disconnected,
    /// Link dropped without a local request
    LinkLoss,
    /// Connection attempt did not succeed
    ConnectFailed { reason: String },
    MtuNegotiated(u16),
    DataReceived(Vec<u8>),
    DataSent(Vec<u8>),
}

impl LinkEvent {
    /// Whether the link is gone after this event
    pub fn is_disconnect(&self) -> bool {
        matches!(self, LinkEvent::Disconnected | LinkEvent::LinkLoss)
    }
}

impl fmt::Display for LinkEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkEvent::Connecting => write!(f, "Connecting"),
            LinkEvent::Connected => write!(f, "Connected"),
            LinkEvent::ServicesDiscovered => write!(f, "ServicesDiscovered"),
            LinkEvent::Ready => write!(f, "Ready"),
            LinkEvent::Disconnecting => write!(f, "Disconnecting"),
            LinkEvent::Disconnected => write!(f, "Disconnected"),
            LinkEvent::LinkLoss => write!(f, "LinkLoss"),
            LinkEvent::ConnectFailed { reason } => write!(f, "ConnectFailed {{ reason: {} }}", reason),
            LinkEvent::MtuNegotiated(mtu) => write!(f, "MtuNegotiated {{ mtu: {} }}", mtu),
            LinkEvent::DataReceived(data) => write!(f, "DataReceived {{ data_len: {} }}", data.len()),
            LinkEvent::DataSent(data) => write!(f, "DataSent {{ data_len: {} }}", data.len()),
        }
    }
}

/// Commands to the GATT link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkCommand {
    Connect(DeviceRef),
    Disconnect,
    Send(Vec<u8>),
}

impl fmt::Display for LinkCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkCommand::Connect(device) => write!(f, "Connect {{ device: {} }}", device),
            LinkCommand::Disconnect => write!(f, "Disconnect"),
            LinkCommand::Send(data) => write!(f, "Send {{ data_len: {} }}", data.len()),
        }
    }
}

/// Commands to the radio scanner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanCommand {
    Start { service: Uuid },
    Stop,
}

/// One advertisement delivered by the scanner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Advertisement {
    /// Bluetooth address the packet was received from
    pub address: String,
    pub name: Option<String>,
    pub rssi: i16,
    pub service_uuids: Vec<Uuid>,
    /// Service data attached to the first advertised service
    pub service_data: Vec<u8>,
}

impl Advertisement {
    pub fn advertises(&self, service: &Uuid) -> bool {
        self.service_uuids.contains(service)
    }
}

/// Platform GATT client
///
/// Completion and incoming data are reported back as [`LinkEvent`]s; these
/// calls only start the operation.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TransportLink: Send + Sync {
    async fn connect(&self, device: &DeviceRef) -> Result<(), LinkError>;
    async fn disconnect(&self) -> Result<(), LinkError>;
    async fn send(&self, data: Vec<u8>) -> Result<(), LinkError>;
}

/// Platform BLE scanner; results are reported back as [`Advertisement`]s
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Scanner: Send + Sync {
    async fn start_scan(&self, service: Uuid) -> Result<(), LinkError>;
    async fn stop_scan(&self) -> Result<(), LinkError>;
}
