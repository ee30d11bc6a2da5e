//! Bit-precise DSDL wire codec and type-model access.
//!
//! This crate is the bottom layer of the Cyphal protocol stack. It provides:
//!
//! - [`Serializer`] / [`Deserializer`] — the alignment-aware bitwise codec
//!   for the DSDL wire format, including the implicit zero extension and
//!   implicit truncation rules and the fork-based framing of delimited
//!   (extensible) composite types;
//! - the generated-type contract ([`Serializable`], [`Message`],
//!   [`Service`]) and the [`TypeModel`] introspection surface consumed by
//!   the transport and presentation layers;
//! - the builtin-form [`Value`] bridge for JSON/YAML/CBOR tooling;
//! - top-level [`serialize`] and [`deserialize`] entry points.
//!
//! The wire format is little-endian with LSB-first bit filling; the codec
//! performs explicit byte-order conversions so the host byte order never
//! leaks into serialized representations.

mod builtin;
mod deserializer;
mod error;
mod model;
mod primitive;
mod serializer;

#[cfg(any(test, feature = "sample-types"))]
pub mod sample;

use bytes::Bytes;

pub use crate::{
    builtin::{Builtin, Value},
    deserializer::Deserializer,
    error::CodecError,
    model::{
        Message, Serializable, Service, TypeKind, TypeModel, Version, ensure_model_matches,
        get_extent_bytes, get_fixed_port_id, get_model, is_message_type, is_service_type,
    },
    primitive::StdPrimitive,
    serializer::{EXTRA_BUFFER_CAPACITY_BYTES, Serializer},
};

/// Serializes a value into its wire representation.
///
/// The returned buffer is sized to the bits actually written, not to the
/// extent; an empty type yields an empty buffer. Errors indicate misuse of
/// the codec by the serialization routine of `T` (e.g. an over-long
/// variable-length array), never a property of well-formed input.
pub fn serialize<T: Serializable>(value: &T) -> Result<Bytes, CodecError> {
    let mut buf = vec![0_u8; T::model().extent_bytes + EXTRA_BUFFER_CAPACITY_BYTES];
    let mut serializer = Serializer::new(&mut buf);
    value.serialize_value(&mut serializer)?;
    let len = serializer.current_bit_length().div_ceil(8);
    buf.truncate(len);
    Ok(Bytes::from(buf))
}

/// Deserializes a value from a fragmented wire representation.
///
/// Returns `Ok(None)` if the representation is not valid for `T`; that
/// outcome is logged at a low severity and is an expected runtime condition
/// on any real network, not an error. Arbitrary input bytes never produce
/// anything beyond the absent result.
///
/// An `Err` is only possible when the deserialization routine of `T`
/// misuses the codec API — a defect in the routine itself, never a property
/// of the input data — and therefore propagates instead of being converted
/// to an absent result.
pub fn deserialize<T: Serializable>(fragmented_buffer: &[Bytes]) -> Result<Option<T>, CodecError> {
    let mut deserializer = Deserializer::new(fragmented_buffer);
    match T::deserialize_value(&mut deserializer) {
        Ok(value) => Ok(Some(value)),
        Err(CodecError::Format(reason)) => {
            tracing::info!(dtype = %T::model(), %reason, "invalid serialized representation");
            Ok(None)
        }
        Err(error) => Err(error),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use proptest::prelude::*;

    use super::*;
    use crate::sample::{
        Command, Coordinates, Integer64, Position, SampleSet, ScalarRecord, Status,
    };

    #[test]
    fn scalar_record_wire_image() {
        let record = ScalarRecord {
            a: 0xA7,
            b: 0x1234_5678_90AB_CDEF,
            c: -0x1234_5678,
            d: -2,
            e: 127,
            f: 1.0,
            g: 1.0,
            h: 99999.9,
        };
        let wire = serialize(&record).unwrap();
        assert_eq!(
            wire.as_ref(),
            [
                0xA7, 0xEF, 0xCD, 0xAB, 0x90, 0x78, 0x56, 0x34, 0x12, 0x88, 0xA9, 0xCB, 0xED,
                0xFE, 0xFF, 0x00, 0x7F, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xF0, 0x3F, 0x00,
                0x00, 0x80, 0x3F, 0x00, 0x7C,
            ]
        );

        let decoded: ScalarRecord = deserialize(&[wire]).unwrap().unwrap();
        assert_eq!(decoded, ScalarRecord { h: f32::INFINITY, ..record });
    }

    #[test]
    fn sub_byte_fields_round_trip() {
        let command = Command { mode: 0b111, data: [0x12, 0x34, 0x56], flags: 0b10101 };
        let wire = serialize(&command).unwrap();
        assert_eq!(wire.len(), 4);
        assert_eq!(deserialize::<Command>(&[wire]), Ok(Some(command)));
    }

    #[test]
    fn variable_length_fields_round_trip() {
        let set = SampleSet {
            mask: [true, false, true, false, false, false, true, true, true, true, true],
            readings: vec![0xDEAD, 0xBEEF],
            label: b"boom arm".to_vec(),
        };
        let wire = serialize(&set).unwrap();
        assert_eq!(deserialize::<SampleSet>(&[wire]), Ok(Some(set)));
    }

    #[test]
    fn delimited_nested_value_round_trip() {
        let position =
            Position { coordinates: Coordinates { x: 1.5, y: -2.5, z: 1e9 }, quality: 3 };
        let wire = serialize(&position).unwrap();
        // Delimiter header declares the nested length of 24 bytes.
        assert_eq!(&wire[..4], &[24, 0, 0, 0]);
        assert_eq!(wire.len(), 4 + 24 + 1);
        assert_eq!(deserialize::<Position>(&[wire]), Ok(Some(position)));
    }

    #[test]
    fn delimited_decoding_tolerates_length_variation() {
        // A shorter-than-current nested value, as an older sender would
        // produce: the absent trailing field reads as zero.
        let mut shorter = vec![16_u8, 0, 0, 0];
        shorter.extend_from_slice(&1.5_f64.to_le_bytes());
        shorter.extend_from_slice(&(-2.5_f64).to_le_bytes());
        shorter.push(7); // quality
        let decoded: Position = deserialize(&[Bytes::from(shorter)]).unwrap().unwrap();
        assert_eq!(decoded.coordinates, Coordinates { x: 1.5, y: -2.5, z: 0.0 });
        assert_eq!(decoded.quality, 7);

        // A longer-than-current nested value, as a newer sender would
        // produce: the extra bytes are skipped.
        let mut longer = vec![32_u8, 0, 0, 0];
        for coord in [1.0_f64, 2.0, 3.0, 4.0] {
            longer.extend_from_slice(&coord.to_le_bytes());
        }
        longer.push(9);
        let decoded: Position = deserialize(&[Bytes::from(longer)]).unwrap().unwrap();
        assert_eq!(decoded.coordinates, Coordinates { x: 1.0, y: 2.0, z: 3.0 });
        assert_eq!(decoded.quality, 9);
    }

    #[test]
    fn truncated_input_is_zero_extended() {
        let decoded: Status = deserialize(&[Bytes::from_static(&[0x2A])]).unwrap().unwrap();
        assert_eq!(decoded, Status { uptime: 0x2A, health: 0 });
        let decoded: Status = deserialize(&[]).unwrap().unwrap();
        assert_eq!(decoded, Status::default());
    }

    #[test]
    fn invalid_representation_is_an_absent_result() {
        // A readings length prefix beyond the array capacity.
        let wire = Bytes::from_static(&[0x00, 0x00, 0xFF, 0x00]);
        assert_eq!(deserialize::<SampleSet>(&[wire]), Ok(None));
    }

    proptest! {
        #[test]
        fn integer_round_trip(value in any::<i64>()) {
            let message = Integer64 { value };
            let wire = serialize(&message).unwrap();
            prop_assert_eq!(deserialize::<Integer64>(&[wire]), Ok(Some(message)));
        }

        #[test]
        fn arbitrary_bytes_never_fail(raw in proptest::collection::vec(any::<u8>(), 0..64)) {
            // Any byte sequence either decodes or yields an absent result;
            // codec misuse cannot be triggered from the input side.
            let fragments = [Bytes::from(raw)];
            prop_assert!(deserialize::<SampleSet>(&fragments).is_ok());
            prop_assert!(deserialize::<Position>(&fragments).is_ok());
            prop_assert!(deserialize::<ScalarRecord>(&fragments).is_ok());
        }

        #[test]
        fn fork_then_skip_equals_direct_write(payload in proptest::collection::vec(any::<u8>(), 1..16)) {
            let mut direct_buf = vec![0_u8; 32];
            let mut direct = Serializer::new(&mut direct_buf);
            direct.add_aligned_bytes(&payload).unwrap();

            let mut forked_buf = vec![0_u8; 32];
            let mut forked = Serializer::new(&mut forked_buf);
            {
                let mut fork = forked.fork_bytes(payload.len()).unwrap();
                fork.add_aligned_bytes(&payload).unwrap();
            }
            forked.skip_bits(payload.len() * 8);

            prop_assert_eq!(direct.buffer(), forked.buffer());
        }
    }
}
