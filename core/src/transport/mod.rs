// Transport module: GATT link, scanner and codec boundaries

pub mod codec;
pub mod link;

pub use codec::{
    provisioning_failure_reason, CodecError, Decoded, JsonCodec, MeshCodec, MeshMessage, MeshPdu,
    ProvisioningPdu, ProvisioningRequest,
};
pub use link::{
    Advertisement, LinkCommand, LinkError, LinkEvent, ScanCommand, Scanner, TransportLink,
    MESH_PROVISIONING_SERVICE_UUID, MESH_PROXY_SERVICE_UUID,
};
