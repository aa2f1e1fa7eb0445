//! The UDP beacon datagram.
//!
//! Layout: `magic(4) ∥ partition_id(u32 LE) ∥ st_len(u8) ∥ service_type ∥
//! sid_len(u8) ∥ service_id ∥ payload`. Datagrams with a foreign magic or
//! partition are silently dropped by the receiver; both are validated
//! before anything else is looked at.

use bytes::{BufMut, BytesMut};

use crate::error::{ProtocolError, ProtocolResult};

/// Magic bytes opening every beacon datagram.
pub const BEACON_MAGIC: &[u8; 4] = b"DSSD";

/// Maximum length of the service-type and service-id fields.
pub const MAX_NAME_LEN: usize = 255;

/// A decoded beacon datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeaconPing {
    /// Divides coexisting Coral networks on the same LAN.
    pub partition_id: u32,
    pub service_type: String,
    pub service_id: String,
    /// Service-specific payload; for slave providers this is the RPC port
    /// as `u16` little-endian.
    pub payload: Vec<u8>,
}

impl BeaconPing {
    pub fn new(
        partition_id: u32,
        service_type: impl Into<String>,
        service_id: impl Into<String>,
        payload: Vec<u8>,
    ) -> ProtocolResult<Self> {
        let ping = Self {
            partition_id,
            service_type: service_type.into(),
            service_id: service_id.into(),
            payload,
        };
        if ping.service_type.len() > MAX_NAME_LEN {
            return Err(ProtocolError::Malformed(
                "service type exceeds 255 bytes".to_string(),
            ));
        }
        if ping.service_id.len() > MAX_NAME_LEN {
            return Err(ProtocolError::Malformed(
                "service id exceeds 255 bytes".to_string(),
            ));
        }
        Ok(ping)
    }

    /// Encodes the datagram.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = BytesMut::with_capacity(
            BEACON_MAGIC.len() + 4 + 2 + self.service_type.len() + self.service_id.len()
                + self.payload.len(),
        );
        out.put_slice(BEACON_MAGIC);
        out.put_u32_le(self.partition_id);
        out.put_u8(self.service_type.len() as u8);
        out.put_slice(self.service_type.as_bytes());
        out.put_u8(self.service_id.len() as u8);
        out.put_slice(self.service_id.as_bytes());
        out.put_slice(&self.payload);
        out.to_vec()
    }

    /// Decodes a datagram addressed to the given partition.
    ///
    /// Returns `Ok(None)` for datagrams that carry the right magic but a
    /// different partition ID; those are someone else's traffic, not an
    /// error.
    pub fn decode(datagram: &[u8], partition_id: u32) -> ProtocolResult<Option<Self>> {
        if datagram.len() < BEACON_MAGIC.len() + 4 + 2 {
            return Err(ProtocolError::Malformed("beacon datagram too short".to_string()));
        }
        if &datagram[..4] != BEACON_MAGIC {
            return Err(ProtocolError::WrongProtocol);
        }
        let partition = u32::from_le_bytes([datagram[4], datagram[5], datagram[6], datagram[7]]);
        if partition != partition_id {
            return Ok(None);
        }

        let mut pos = 8;
        let st_len = datagram[pos] as usize;
        pos += 1;
        if datagram.len() < pos + st_len + 1 {
            return Err(ProtocolError::Malformed(
                "beacon service type truncated".to_string(),
            ));
        }
        let service_type = std::str::from_utf8(&datagram[pos..pos + st_len])
            .map_err(|_| ProtocolError::Malformed("service type is not UTF-8".to_string()))?
            .to_string();
        pos += st_len;

        let sid_len = datagram[pos] as usize;
        pos += 1;
        if datagram.len() < pos + sid_len {
            return Err(ProtocolError::Malformed(
                "beacon service id truncated".to_string(),
            ));
        }
        let service_id = std::str::from_utf8(&datagram[pos..pos + sid_len])
            .map_err(|_| ProtocolError::Malformed("service id is not UTF-8".to_string()))?
            .to_string();
        pos += sid_len;

        Ok(Some(Self {
            partition_id: partition,
            service_type,
            service_id,
            payload: datagram[pos..].to_vec(),
        }))
    }
}
