//! Bodies and header strings of the slave-provider RPC protocol.
//!
//! The protocol identifier is `"DSSPI"`, version 0. Requests carry one of
//! two header strings; replies answer with `OK` plus a body, or `ERROR`
//! plus an [`ErrorReply`] body.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use coral_net::SlaveLocator;
use coral_types::SlaveTypeDescription;

use crate::error::ProtocolResult;

/// Protocol identifier of the slave-provider RPC protocol.
pub const PROTOCOL_ID: &str = "DSSPI";

/// Version of the slave-provider RPC protocol.
pub const PROTOCOL_VERSION: u16 = 0;

/// Request header: list the slave types this provider offers.
pub const GET_SLAVE_TYPES: &str = "GET_SLAVE_TYPES";

/// Request header: spawn one slave of a given type.
pub const INSTANTIATE_SLAVE: &str = "INSTANTIATE_SLAVE";

/// Reply header for success.
pub const OK: &str = "OK";

/// Reply header for failure.
pub const ERROR: &str = "ERROR";

/// The service type announced in provider beacons.
pub const SERVICE_TYPE: &str = "coral.provider";

/// Body of an `OK` reply to `GET_SLAVE_TYPES`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlaveTypeList {
    pub slave_types: Vec<SlaveTypeDescription>,
}

/// Body of an `INSTANTIATE_SLAVE` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstantiateSlaveRequest {
    /// UUID of the slave type to instantiate.
    pub type_uuid: Uuid,
    /// How long the provider may spend starting the slave, in
    /// milliseconds.
    pub instantiation_timeout_ms: u32,
}

/// Body of an `OK` reply to `INSTANTIATE_SLAVE`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstantiateSlaveReply {
    /// Where the newborn slave can be reached.
    pub slave_locator: SlaveLocator,
}

/// Body of an `ERROR` reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub detail: String,
}

/// Encodes any provider-protocol body.
pub fn encode_body<T: Serialize>(body: &T) -> ProtocolResult<Vec<u8>> {
    Ok(postcard::to_allocvec(body)?)
}

/// Decodes any provider-protocol body.
pub fn decode_body<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> ProtocolResult<T> {
    Ok(postcard::from_bytes(bytes)?)
}

/// Encodes a provider beacon payload: the RPC port, `u16` little-endian.
pub fn encode_beacon_payload(rpc_port: u16) -> Vec<u8> {
    rpc_port.to_le_bytes().to_vec()
}

/// Decodes a provider beacon payload.
pub fn decode_beacon_payload(payload: &[u8]) -> Option<u16> {
    let bytes: [u8; 2] = payload.get(..2)?.try_into().ok()?;
    Some(u16::from_le_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use coral_net::Endpoint;

    #[test]
    fn instantiate_request_round_trips() {
        let request = InstantiateSlaveRequest {
            type_uuid: Uuid::from_u128(0xDEAD_BEEF),
            instantiation_timeout_ms: 30_000,
        };
        let bytes = encode_body(&request).unwrap();
        let decoded: InstantiateSlaveRequest = decode_body(&bytes).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn locator_reply_round_trips() {
        let reply = InstantiateSlaveReply {
            slave_locator: SlaveLocator::new(
                Endpoint::new("10.0.0.3", 51000),
                Endpoint::new("10.0.0.3", 51001),
            ),
        };
        let bytes = encode_body(&reply).unwrap();
        let decoded: InstantiateSlaveReply = decode_body(&bytes).unwrap();
        assert_eq!(decoded, reply);
    }

    #[test]
    fn beacon_payload_is_the_rpc_port() {
        let payload = encode_beacon_payload(0x3039);
        assert_eq!(payload, vec![0x39, 0x30]);
        assert_eq!(decode_beacon_payload(&payload), Some(0x3039));
        assert_eq!(decode_beacon_payload(&[1]), None);
    }
}
