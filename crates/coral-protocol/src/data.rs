//! Timestamped variable samples on the publish/subscribe fabric.
//!
//! A sample is two frames. Frame 1 is an 8-byte binary header:
//! `slave_id(u16) ∥ variable_id(u16) ∥ step_id(u32)`, all little-endian,
//! so that the leading 4 bytes identify the publishing variable and serve
//! as the subscription prefix. Frame 2 is a postcard-encoded
//! [`TimestampedValue`].

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use coral_net::Message;
use coral_types::{ScalarValue, SlaveId, StepId, Variable, VariableId};

use crate::error::{ProtocolError, ProtocolResult};

/// Size of the binary sample header.
pub const DATA_HEADER_SIZE: usize = 8;

/// Size of the subscription prefix (the variable-identity half of the
/// header).
pub const SUBSCRIPTION_PREFIX_SIZE: usize = 4;

/// The body frame of a sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimestampedValue {
    pub step_id: StepId,
    pub value: ScalarValue,
}

/// One published variable sample.
#[derive(Debug, Clone, PartialEq)]
pub struct DataMessage {
    /// The variable the sample belongs to.
    pub variable: Variable,
    /// The step the sample was produced in.
    pub step_id: StepId,
    pub value: ScalarValue,
}

/// The 4-byte subscription prefix matching all samples of one variable.
pub fn subscription_prefix(variable: Variable) -> [u8; SUBSCRIPTION_PREFIX_SIZE] {
    let mut prefix = [0u8; SUBSCRIPTION_PREFIX_SIZE];
    prefix[..2].copy_from_slice(&u16::from(variable.slave).to_le_bytes());
    prefix[2..].copy_from_slice(&u16::from(variable.id).to_le_bytes());
    prefix
}

/// Encodes a sample into a two-frame message.
pub fn encode(sample: &DataMessage) -> ProtocolResult<Message> {
    let mut header = BytesMut::with_capacity(DATA_HEADER_SIZE);
    header.put_slice(&subscription_prefix(sample.variable));
    header.put_u32_le(u32::from(sample.step_id));

    let body = postcard::to_allocvec(&TimestampedValue {
        step_id: sample.step_id,
        value: sample.value.clone(),
    })?;

    Ok(vec![header.freeze(), Bytes::from(body)])
}

/// Decodes only the header of a sample, enough to route or discard it
/// without touching the body.
pub fn decode_header(message: &Message) -> ProtocolResult<(Variable, StepId)> {
    let header = message
        .first()
        .ok_or_else(|| ProtocolError::Malformed("empty sample".to_string()))?;
    if header.len() != DATA_HEADER_SIZE {
        return Err(ProtocolError::Malformed(format!(
            "sample header must be {DATA_HEADER_SIZE} bytes, got {}",
            header.len()
        )));
    }
    let slave = SlaveId::new(u16::from_le_bytes([header[0], header[1]]));
    let id = VariableId::new(u16::from_le_bytes([header[2], header[3]]));
    let step_id = StepId::new(u32::from_le_bytes([
        header[4], header[5], header[6], header[7],
    ]));
    Ok((Variable::new(slave, id), step_id))
}

/// Decodes a complete sample, cross-checking the step IDs of header and
/// body.
pub fn decode(message: &Message) -> ProtocolResult<DataMessage> {
    let (variable, step_id) = decode_header(message)?;
    let body = message
        .get(1)
        .ok_or_else(|| ProtocolError::Malformed("sample is missing its body frame".to_string()))?;
    let timestamped: TimestampedValue = postcard::from_bytes(body)?;
    if timestamped.step_id != step_id {
        return Err(ProtocolError::Malformed(format!(
            "sample header step {step_id} disagrees with body step {}",
            timestamped.step_id
        )));
    }
    Ok(DataMessage {
        variable,
        step_id,
        value: timestamped.value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample(slave: u16, var: u16, step: u32, value: ScalarValue) -> DataMessage {
        DataMessage {
            variable: Variable::new(SlaveId::new(slave), VariableId::new(var)),
            step_id: StepId::new(step),
            value,
        }
    }

    #[test]
    fn prefix_is_first_four_header_bytes() {
        let s = sample(0x0102, 0x0304, 9, ScalarValue::Real(1.0));
        let encoded = encode(&s).unwrap();
        assert_eq!(
            &encoded[0][..SUBSCRIPTION_PREFIX_SIZE],
            &subscription_prefix(s.variable)
        );
        // Little-endian layout, slave first.
        assert_eq!(&encoded[0][..4], &[0x02, 0x01, 0x04, 0x03]);
    }

    #[test]
    fn header_decode_skips_body() {
        let s = sample(1, 2, 3, ScalarValue::String("long".repeat(100)));
        let encoded = encode(&s).unwrap();
        let (variable, step) = decode_header(&encoded).unwrap();
        assert_eq!(variable, s.variable);
        assert_eq!(step, StepId::new(3));
    }

    #[test]
    fn mismatched_step_ids_are_rejected() {
        let s = sample(1, 2, 3, ScalarValue::Boolean(true));
        let mut encoded = encode(&s).unwrap();
        // Corrupt the header's step field only.
        let mut header = encoded[0].to_vec();
        header[4] = 0xFF;
        encoded[0] = Bytes::from(header);
        assert!(decode(&encoded).is_err());
    }

    proptest! {
        #[test]
        fn samples_round_trip(slave in 1u16.., var: u16, step: u32, real in proptest::num::f64::NORMAL) {
            let s = sample(slave, var, step, ScalarValue::Real(real));
            let decoded = decode(&encode(&s).unwrap()).unwrap();
            prop_assert_eq!(decoded, s);
        }

        #[test]
        fn all_value_kinds_round_trip(which in 0..4, n: i32, b: bool, text in ".{0,40}") {
            let value = match which {
                0 => ScalarValue::Real(f64::from(n)),
                1 => ScalarValue::Integer(n),
                2 => ScalarValue::Boolean(b),
                _ => ScalarValue::String(text),
            };
            let s = sample(1, 2, 3, value);
            prop_assert_eq!(decode(&encode(&s).unwrap()).unwrap(), s);
        }
    }
}
