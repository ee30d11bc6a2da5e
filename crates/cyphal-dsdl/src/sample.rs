//! Hand-written stand-ins for code-generator output.
//!
//! Real deployments feed the stack with classes emitted by the DSDL code
//! generator; these types implement the exact same contract by hand so the
//! test suites of this workspace can exercise the full stack without a
//! generator run. They are compiled only for tests and under the
//! `sample-types` feature.

use crate::{
    Builtin, CodecError, Deserializer, Message, Serializable, Serializer, Service, TypeKind,
    TypeModel, Value, Version,
    builtin::{positional_to_named, shape_mismatch, unknown_field},
};

/// A single 64-bit signed integer, like `uavcan.primitive.scalar.Integer64`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Integer64 {
    /// The payload.
    pub value: i64,
}

static INTEGER64_MODEL: TypeModel = TypeModel {
    full_name: "example.primitive.Integer64",
    version: Version { major: 1, minor: 0 },
    extent_bytes: 8,
    sealed: true,
    fixed_port_id: None,
    kind: TypeKind::Message,
};

impl Serializable for Integer64 {
    fn model() -> &'static TypeModel {
        &INTEGER64_MODEL
    }

    fn serialize_value(&self, serializer: &mut Serializer<'_>) -> Result<(), CodecError> {
        serializer.add_aligned_i64(self.value)
    }

    fn deserialize_value(deserializer: &mut Deserializer) -> Result<Self, CodecError> {
        Ok(Self { value: deserializer.fetch_aligned_i64() })
    }
}

impl Message for Integer64 {}

impl Builtin for Integer64 {
    fn to_builtin(&self) -> Value {
        Value::Map(vec![("value".into(), Value::Integer(self.value))])
    }

    fn update_from_builtin(&mut self, source: &Value) -> Result<(), CodecError> {
        let named = positional_to_named("Integer64", &["value"], false, source)?;
        let source = named.as_ref().unwrap_or(source);
        let Some(entries) = source.as_map() else {
            return Err(shape_mismatch("Integer64", "<self>", source));
        };
        for (name, value) in entries {
            match name.as_str() {
                "value" => {
                    self.value =
                        value.as_i64().ok_or_else(|| shape_mismatch("Integer64", name, value))?;
                }
                _ => return Err(unknown_field("Integer64", name)),
            }
        }
        Ok(())
    }
}

/// A single bit, like `uavcan.primitive.scalar.Bit`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Bit {
    /// The payload.
    pub value: bool,
}

static BIT_MODEL: TypeModel = TypeModel {
    full_name: "example.primitive.Bit",
    version: Version { major: 1, minor: 0 },
    extent_bytes: 1,
    sealed: true,
    fixed_port_id: None,
    kind: TypeKind::Message,
};

impl Serializable for Bit {
    fn model() -> &'static TypeModel {
        &BIT_MODEL
    }

    fn serialize_value(&self, serializer: &mut Serializer<'_>) -> Result<(), CodecError> {
        serializer.add_unaligned_bit(self.value)
    }

    fn deserialize_value(deserializer: &mut Deserializer) -> Result<Self, CodecError> {
        Ok(Self { value: deserializer.fetch_unaligned_bit() })
    }
}

impl Message for Bit {}

/// Periodic node status with a fixed subject-ID, shaped after
/// `uavcan.node.Heartbeat`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Status {
    /// Seconds since the node started.
    pub uptime: u32,
    /// Coarse health code.
    pub health: u8,
}

static STATUS_MODEL: TypeModel = TypeModel {
    full_name: "example.telemetry.Status",
    version: Version { major: 1, minor: 0 },
    extent_bytes: 12,
    sealed: true,
    fixed_port_id: Some(7509),
    kind: TypeKind::Message,
};

impl Serializable for Status {
    fn model() -> &'static TypeModel {
        &STATUS_MODEL
    }

    fn serialize_value(&self, serializer: &mut Serializer<'_>) -> Result<(), CodecError> {
        serializer.add_aligned_u32(self.uptime)?;
        serializer.add_aligned_u8(self.health)
    }

    fn deserialize_value(deserializer: &mut Deserializer) -> Result<Self, CodecError> {
        Ok(Self {
            uptime: deserializer.fetch_aligned_u32(),
            health: deserializer.fetch_aligned_u8(),
        })
    }
}

impl Message for Status {}

impl Builtin for Status {
    fn to_builtin(&self) -> Value {
        Value::Map(vec![
            ("uptime".into(), Value::Integer(i64::from(self.uptime))),
            ("health".into(), Value::Integer(i64::from(self.health))),
        ])
    }

    fn update_from_builtin(&mut self, source: &Value) -> Result<(), CodecError> {
        let named = positional_to_named("Status", &["uptime", "health"], false, source)?;
        let source = named.as_ref().unwrap_or(source);
        let Some(entries) = source.as_map() else {
            return Err(shape_mismatch("Status", "<self>", source));
        };
        for (name, value) in entries {
            let narrow = |limit: u64| {
                value
                    .as_u64()
                    .filter(|&x| x <= limit)
                    .ok_or_else(|| shape_mismatch("Status", name, value))
            };
            match name.as_str() {
                "uptime" => self.uptime = narrow(u64::from(u32::MAX))? as u32,
                "health" => self.health = narrow(u64::from(u8::MAX))? as u8,
                _ => return Err(unknown_field("Status", name)),
            }
        }
        Ok(())
    }
}

/// One field of every standard scalar category, all byte-aligned.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ScalarRecord {
    /// 8-bit unsigned.
    pub a: u8,
    /// 64-bit signed.
    pub b: i64,
    /// 32-bit signed.
    pub c: i32,
    /// 16-bit signed; followed by an 8-bit padding field on the wire.
    pub d: i16,
    /// 8-bit signed.
    pub e: i8,
    /// binary64.
    pub f: f64,
    /// binary32.
    pub g: f32,
    /// binary16; out-of-range values saturate to infinity on the wire.
    pub h: f32,
}

static SCALAR_RECORD_MODEL: TypeModel = TypeModel {
    full_name: "example.telemetry.ScalarRecord",
    version: Version { major: 1, minor: 0 },
    extent_bytes: 31,
    sealed: true,
    fixed_port_id: None,
    kind: TypeKind::Message,
};

impl Serializable for ScalarRecord {
    fn model() -> &'static TypeModel {
        &SCALAR_RECORD_MODEL
    }

    fn serialize_value(&self, serializer: &mut Serializer<'_>) -> Result<(), CodecError> {
        serializer.add_aligned_u8(self.a)?;
        serializer.add_aligned_i64(self.b)?;
        serializer.add_aligned_i32(self.c)?;
        serializer.add_aligned_i16(self.d)?;
        serializer.skip_bits(8);
        serializer.add_aligned_i8(self.e)?;
        serializer.add_aligned_f64(self.f)?;
        serializer.add_aligned_f32(self.g)?;
        serializer.add_aligned_f16(self.h)
    }

    fn deserialize_value(deserializer: &mut Deserializer) -> Result<Self, CodecError> {
        let a = deserializer.fetch_aligned_u8();
        let b = deserializer.fetch_aligned_i64();
        let c = deserializer.fetch_aligned_i32();
        let d = deserializer.fetch_aligned_i16();
        deserializer.skip_bits(8);
        Ok(Self {
            a,
            b,
            c,
            d,
            e: deserializer.fetch_aligned_i8(),
            f: deserializer.fetch_aligned_f64(),
            g: deserializer.fetch_aligned_f32(),
            h: deserializer.fetch_aligned_f16(),
        })
    }
}

impl Message for ScalarRecord {}

/// A densely packed command with sub-byte fields around a byte array.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Command {
    /// 3-bit operating mode selector.
    pub mode: u8,
    /// Opaque argument bytes.
    pub data: [u8; 3],
    /// 5-bit status flags.
    pub flags: u8,
}

static COMMAND_MODEL: TypeModel = TypeModel {
    full_name: "example.actuator.Command",
    version: Version { major: 1, minor: 0 },
    extent_bytes: 4,
    sealed: true,
    fixed_port_id: None,
    kind: TypeKind::Message,
};

impl Serializable for Command {
    fn model() -> &'static TypeModel {
        &COMMAND_MODEL
    }

    fn serialize_value(&self, serializer: &mut Serializer<'_>) -> Result<(), CodecError> {
        serializer.add_aligned_unsigned(u64::from(self.mode), 3)?;
        serializer.add_unaligned_bytes(&self.data)?;
        serializer.add_unaligned_unsigned(u64::from(self.flags), 5)
    }

    fn deserialize_value(deserializer: &mut Deserializer) -> Result<Self, CodecError> {
        let mode = deserializer.fetch_aligned_unsigned(3) as u8;
        let raw = deserializer.fetch_unaligned_bytes(3);
        let mut data = [0_u8; 3];
        data.copy_from_slice(&raw);
        let flags = deserializer.fetch_unaligned_unsigned(5) as u8;
        Ok(Self { mode, data, flags })
    }
}

impl Message for Command {}

/// Maximum element count of [`SampleSet::readings`].
pub const SAMPLE_SET_READINGS_CAPACITY: usize = 4;
/// Maximum byte length of [`SampleSet::label`].
pub const SAMPLE_SET_LABEL_CAPACITY: usize = 16;

/// A bit mask, a variable-length primitive array, and a string-like label.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SampleSet {
    /// Per-channel validity flags, packed one bit per element.
    pub mask: [bool; 11],
    /// Raw readings, up to [`SAMPLE_SET_READINGS_CAPACITY`] elements.
    pub readings: Vec<u16>,
    /// Human-readable label, up to [`SAMPLE_SET_LABEL_CAPACITY`] bytes.
    pub label: Vec<u8>,
}

static SAMPLE_SET_MODEL: TypeModel = TypeModel {
    full_name: "example.telemetry.SampleSet",
    version: Version { major: 1, minor: 0 },
    extent_bytes: 28,
    sealed: true,
    fixed_port_id: None,
    kind: TypeKind::Message,
};

impl Serializable for SampleSet {
    fn model() -> &'static TypeModel {
        &SAMPLE_SET_MODEL
    }

    fn serialize_value(&self, serializer: &mut Serializer<'_>) -> Result<(), CodecError> {
        if self.readings.len() > SAMPLE_SET_READINGS_CAPACITY {
            return Err(CodecError::InvalidValue(format!(
                "readings has {} elements, the limit is {SAMPLE_SET_READINGS_CAPACITY}",
                self.readings.len()
            )));
        }
        if self.label.len() > SAMPLE_SET_LABEL_CAPACITY {
            return Err(CodecError::InvalidValue(format!(
                "label has {} bytes, the limit is {SAMPLE_SET_LABEL_CAPACITY}",
                self.label.len()
            )));
        }
        serializer.add_aligned_array_of_bits(&self.mask)?;
        serializer.add_unaligned_unsigned(self.readings.len() as u64, 8)?;
        serializer.add_unaligned_array_of_standard_bit_length_primitives(&self.readings)?;
        serializer.add_unaligned_unsigned(self.label.len() as u64, 8)?;
        serializer.add_unaligned_bytes(&self.label)
    }

    fn deserialize_value(deserializer: &mut Deserializer) -> Result<Self, CodecError> {
        let mask_vec = deserializer.fetch_aligned_array_of_bits(11);
        let mut mask = [false; 11];
        mask.copy_from_slice(&mask_vec);
        let readings_len = deserializer.fetch_unaligned_unsigned(8) as usize;
        if readings_len > SAMPLE_SET_READINGS_CAPACITY {
            return Err(CodecError::Format(format!(
                "readings length prefix {readings_len} exceeds {SAMPLE_SET_READINGS_CAPACITY}"
            )));
        }
        let readings =
            deserializer.fetch_unaligned_array_of_standard_bit_length_primitives(readings_len);
        let label_len = deserializer.fetch_unaligned_unsigned(8) as usize;
        if label_len > SAMPLE_SET_LABEL_CAPACITY {
            return Err(CodecError::Format(format!(
                "label length prefix {label_len} exceeds {SAMPLE_SET_LABEL_CAPACITY}"
            )));
        }
        let label = deserializer.fetch_unaligned_bytes(label_len).to_vec();
        Ok(Self { mask, readings, label })
    }
}

impl Message for SampleSet {}

impl Builtin for SampleSet {
    fn to_builtin(&self) -> Value {
        Value::Map(vec![
            ("mask".into(), Value::Sequence(self.mask.iter().map(|&b| Value::Bool(b)).collect())),
            (
                "readings".into(),
                Value::Sequence(
                    self.readings.iter().map(|&x| Value::Integer(i64::from(x))).collect(),
                ),
            ),
            ("label".into(), Value::from_string_like(&self.label)),
        ])
    }

    fn update_from_builtin(&mut self, source: &Value) -> Result<(), CodecError> {
        // The leading mask field is an array, so overflowing positional
        // values are handed down to it.
        let named = positional_to_named("SampleSet", &["mask", "readings", "label"], true, source)?;
        let source = named.as_ref().unwrap_or(source);
        let Some(entries) = source.as_map() else {
            return Err(shape_mismatch("SampleSet", "<self>", source));
        };
        for (name, value) in entries {
            match name.as_str() {
                "mask" => {
                    let items = value
                        .as_sequence()
                        .filter(|items| items.len() == self.mask.len())
                        .ok_or_else(|| shape_mismatch("SampleSet", name, value))?;
                    for (slot, item) in self.mask.iter_mut().zip(items) {
                        *slot =
                            item.as_bool().ok_or_else(|| shape_mismatch("SampleSet", name, item))?;
                    }
                }
                "readings" => {
                    let items = value
                        .as_sequence()
                        .ok_or_else(|| shape_mismatch("SampleSet", name, value))?;
                    self.readings = items
                        .iter()
                        .map(|item| {
                            item.as_u64()
                                .and_then(|x| u16::try_from(x).ok())
                                .ok_or_else(|| shape_mismatch("SampleSet", name, item))
                        })
                        .collect::<Result<_, _>>()?;
                }
                "label" => {
                    self.label = match value {
                        Value::String(s) => s.clone().into_bytes(),
                        other => other
                            .as_sequence()
                            .ok_or_else(|| shape_mismatch("SampleSet", name, other))?
                            .iter()
                            .map(|item| {
                                item.as_u64()
                                    .and_then(|x| u8::try_from(x).ok())
                                    .ok_or_else(|| shape_mismatch("SampleSet", name, item))
                            })
                            .collect::<Result<_, _>>()?,
                    };
                }
                _ => return Err(unknown_field("SampleSet", name)),
            }
        }
        Ok(())
    }
}

/// A non-sealed composite serialized behind a delimiter header.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Coordinates {
    /// North, meters.
    pub x: f64,
    /// East, meters.
    pub y: f64,
    /// Down, meters.
    pub z: f64,
}

static COORDINATES_MODEL: TypeModel = TypeModel {
    full_name: "example.geo.Coordinates",
    version: Version { major: 1, minor: 0 },
    extent_bytes: 48,
    sealed: false,
    fixed_port_id: None,
    kind: TypeKind::Message,
};

impl Serializable for Coordinates {
    fn model() -> &'static TypeModel {
        &COORDINATES_MODEL
    }

    fn serialize_value(&self, serializer: &mut Serializer<'_>) -> Result<(), CodecError> {
        serializer.add_aligned_f64(self.x)?;
        serializer.add_aligned_f64(self.y)?;
        serializer.add_aligned_f64(self.z)
    }

    fn deserialize_value(deserializer: &mut Deserializer) -> Result<Self, CodecError> {
        Ok(Self {
            x: deserializer.fetch_aligned_f64(),
            y: deserializer.fetch_aligned_f64(),
            z: deserializer.fetch_aligned_f64(),
        })
    }
}

impl Message for Coordinates {}

impl Builtin for Coordinates {
    fn to_builtin(&self) -> Value {
        Value::Map(vec![
            ("x".into(), Value::Float(self.x)),
            ("y".into(), Value::Float(self.y)),
            ("z".into(), Value::Float(self.z)),
        ])
    }

    fn update_from_builtin(&mut self, source: &Value) -> Result<(), CodecError> {
        let named = positional_to_named("Coordinates", &["x", "y", "z"], false, source)?;
        let source = named.as_ref().unwrap_or(source);
        let Some(entries) = source.as_map() else {
            return Err(shape_mismatch("Coordinates", "<self>", source));
        };
        for (name, value) in entries {
            let slot = match name.as_str() {
                "x" => &mut self.x,
                "y" => &mut self.y,
                "z" => &mut self.z,
                _ => return Err(unknown_field("Coordinates", name)),
            };
            *slot = value.as_f64().ok_or_else(|| shape_mismatch("Coordinates", name, value))?;
        }
        Ok(())
    }
}

/// A sealed container holding a delimited nested composite.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Position {
    /// The delimited nested value.
    pub coordinates: Coordinates,
    /// Fix quality indicator.
    pub quality: u8,
}

static POSITION_MODEL: TypeModel = TypeModel {
    full_name: "example.geo.Position",
    version: Version { major: 1, minor: 0 },
    extent_bytes: 53,
    sealed: true,
    fixed_port_id: None,
    kind: TypeKind::Message,
};

impl Serializable for Position {
    fn model() -> &'static TypeModel {
        &POSITION_MODEL
    }

    fn serialize_value(&self, serializer: &mut Serializer<'_>) -> Result<(), CodecError> {
        serializer.add_delimited(Coordinates::model().extent_bytes, |nested| {
            self.coordinates.serialize_value(nested)
        })?;
        serializer.add_aligned_u8(self.quality)
    }

    fn deserialize_value(deserializer: &mut Deserializer) -> Result<Self, CodecError> {
        let mut nested = deserializer.fork_delimited()?;
        let coordinates = Coordinates::deserialize_value(&mut nested)?;
        Ok(Self { coordinates, quality: deserializer.fetch_aligned_u8() })
    }
}

impl Message for Position {}

impl Builtin for Position {
    fn to_builtin(&self) -> Value {
        Value::Map(vec![
            ("coordinates".into(), self.coordinates.to_builtin()),
            ("quality".into(), Value::Integer(i64::from(self.quality))),
        ])
    }

    fn update_from_builtin(&mut self, source: &Value) -> Result<(), CodecError> {
        // The leading field is a nested composite, so positional values
        // that do not fit here propagate down into it.
        let named = positional_to_named("Position", &["coordinates", "quality"], true, source)?;
        let source = named.as_ref().unwrap_or(source);
        let Some(entries) = source.as_map() else {
            return Err(shape_mismatch("Position", "<self>", source));
        };
        for (name, value) in entries {
            match name.as_str() {
                "coordinates" => self.coordinates.update_from_builtin(value)?,
                "quality" => {
                    self.quality = value
                        .as_u64()
                        .and_then(|x| u8::try_from(x).ok())
                        .ok_or_else(|| shape_mismatch("Position", name, value))?;
                }
                _ => return Err(unknown_field("Position", name)),
            }
        }
        Ok(())
    }
}

/// Maximum byte length of an [`Echo`] payload in either direction.
pub const ECHO_PAYLOAD_CAPACITY: usize = 255;

/// Request half of [`Echo`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EchoRequest {
    /// Bytes to be echoed back.
    pub payload: Vec<u8>,
}

/// Response half of [`Echo`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EchoResponse {
    /// The echoed bytes.
    pub payload: Vec<u8>,
}

static ECHO_REQUEST_MODEL: TypeModel = TypeModel {
    full_name: "example.util.Echo.Request",
    version: Version { major: 1, minor: 0 },
    extent_bytes: 256,
    sealed: true,
    fixed_port_id: None,
    kind: TypeKind::ServiceRequest,
};

static ECHO_RESPONSE_MODEL: TypeModel = TypeModel {
    full_name: "example.util.Echo.Response",
    version: Version { major: 1, minor: 0 },
    extent_bytes: 256,
    sealed: true,
    fixed_port_id: None,
    kind: TypeKind::ServiceResponse,
};

static ECHO_MODEL: TypeModel = TypeModel {
    full_name: "example.util.Echo",
    version: Version { major: 1, minor: 0 },
    extent_bytes: 0,
    sealed: true,
    fixed_port_id: None,
    kind: TypeKind::Service,
};

fn serialize_echo_payload(
    payload: &[u8],
    serializer: &mut Serializer<'_>,
) -> Result<(), CodecError> {
    if payload.len() > ECHO_PAYLOAD_CAPACITY {
        return Err(CodecError::InvalidValue(format!(
            "payload has {} bytes, the limit is {ECHO_PAYLOAD_CAPACITY}",
            payload.len()
        )));
    }
    serializer.add_aligned_u8(payload.len() as u8)?;
    serializer.add_aligned_bytes(payload)
}

fn deserialize_echo_payload(deserializer: &mut Deserializer) -> Vec<u8> {
    let len = usize::from(deserializer.fetch_aligned_u8());
    deserializer.fetch_aligned_bytes(len).to_vec()
}

impl Serializable for EchoRequest {
    fn model() -> &'static TypeModel {
        &ECHO_REQUEST_MODEL
    }

    fn serialize_value(&self, serializer: &mut Serializer<'_>) -> Result<(), CodecError> {
        serialize_echo_payload(&self.payload, serializer)
    }

    fn deserialize_value(deserializer: &mut Deserializer) -> Result<Self, CodecError> {
        Ok(Self { payload: deserialize_echo_payload(deserializer) })
    }
}

impl Serializable for EchoResponse {
    fn model() -> &'static TypeModel {
        &ECHO_RESPONSE_MODEL
    }

    fn serialize_value(&self, serializer: &mut Serializer<'_>) -> Result<(), CodecError> {
        serialize_echo_payload(&self.payload, serializer)
    }

    fn deserialize_value(deserializer: &mut Deserializer) -> Result<Self, CodecError> {
        Ok(Self { payload: deserialize_echo_payload(deserializer) })
    }
}

/// A byte-echo service without a fixed service-ID.
#[derive(Debug)]
pub struct Echo;

impl Service for Echo {
    type Request = EchoRequest;
    type Response = EchoResponse;

    fn model() -> &'static TypeModel {
        &ECHO_MODEL
    }
}

/// Request half of [`GetStatus`]; empty.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GetStatusRequest;

/// Response half of [`GetStatus`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GetStatusResponse {
    /// Status of the responding node.
    pub status: Status,
}

static GET_STATUS_REQUEST_MODEL: TypeModel = TypeModel {
    full_name: "example.telemetry.GetStatus.Request",
    version: Version { major: 1, minor: 0 },
    extent_bytes: 0,
    sealed: true,
    fixed_port_id: None,
    kind: TypeKind::ServiceRequest,
};

static GET_STATUS_RESPONSE_MODEL: TypeModel = TypeModel {
    full_name: "example.telemetry.GetStatus.Response",
    version: Version { major: 1, minor: 0 },
    extent_bytes: 12,
    sealed: true,
    fixed_port_id: None,
    kind: TypeKind::ServiceResponse,
};

static GET_STATUS_MODEL: TypeModel = TypeModel {
    full_name: "example.telemetry.GetStatus",
    version: Version { major: 1, minor: 0 },
    extent_bytes: 0,
    sealed: true,
    fixed_port_id: Some(430),
    kind: TypeKind::Service,
};

impl Serializable for GetStatusRequest {
    fn model() -> &'static TypeModel {
        &GET_STATUS_REQUEST_MODEL
    }

    fn serialize_value(&self, _serializer: &mut Serializer<'_>) -> Result<(), CodecError> {
        Ok(())
    }

    fn deserialize_value(_deserializer: &mut Deserializer) -> Result<Self, CodecError> {
        Ok(Self)
    }
}

impl Serializable for GetStatusResponse {
    fn model() -> &'static TypeModel {
        &GET_STATUS_RESPONSE_MODEL
    }

    fn serialize_value(&self, serializer: &mut Serializer<'_>) -> Result<(), CodecError> {
        self.status.serialize_value(serializer)
    }

    fn deserialize_value(deserializer: &mut Deserializer) -> Result<Self, CodecError> {
        Ok(Self { status: Status::deserialize_value(deserializer)? })
    }
}

/// A status-query service with a fixed service-ID.
#[derive(Debug)]
pub struct GetStatus;

impl Service for GetStatus {
    type Request = GetStatusRequest;
    type Response = GetStatusResponse;

    fn model() -> &'static TypeModel {
        &GET_STATUS_MODEL
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn builtin_rendering_preserves_field_order() {
        let status = Status { uptime: 90, health: 2 };
        let rendered = status.to_builtin();
        let names: Vec<_> =
            rendered.as_map().unwrap().iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, ["uptime", "health"]);
        assert_eq!(rendered.get("uptime").and_then(Value::as_u64), Some(90));
    }

    #[test]
    fn builtin_update_is_partial() {
        let mut status = Status { uptime: 1, health: 7 };
        status
            .update_from_builtin(&Value::Map(vec![("uptime".into(), Value::Integer(44))]))
            .unwrap();
        assert_eq!(status, Status { uptime: 44, health: 7 });
    }

    #[test]
    fn builtin_update_rejects_unknown_fields_and_bad_shapes() {
        let mut status = Status::default();
        let unknown = Value::Map(vec![("uptme".into(), Value::Integer(1))]);
        assert!(status.update_from_builtin(&unknown).is_err());

        let out_of_range = Value::Map(vec![("health".into(), Value::Integer(1000))]);
        assert!(status.update_from_builtin(&out_of_range).is_err());

        // More positional values than fields, with no array or composite
        // first field to hand them down to.
        let overfull =
            Value::Sequence(vec![Value::Integer(1), Value::Integer(2), Value::Integer(3)]);
        assert!(status.update_from_builtin(&overfull).is_err());
    }

    #[test]
    fn builtin_update_accepts_positional_forms() {
        // A bare scalar is a positional singleton for the first field.
        let mut message = Integer64::default();
        message.update_from_builtin(&Value::Integer(5)).unwrap();
        assert_eq!(message.value, 5);

        // A sequence supplies field values in declaration order;
        // unmentioned trailing fields keep their values.
        let mut status = Status { uptime: 0, health: 7 };
        status
            .update_from_builtin(&Value::Sequence(vec![Value::Integer(44)]))
            .unwrap();
        assert_eq!(status, Status { uptime: 44, health: 7 });
        status
            .update_from_builtin(&Value::Sequence(vec![Value::Integer(45), Value::Integer(2)]))
            .unwrap();
        assert_eq!(status, Status { uptime: 45, health: 2 });
    }

    #[test]
    fn builtin_update_propagates_positional_values_downward() {
        // A positional singleton reaches into the nested composite.
        let mut position = Position::default();
        position.update_from_builtin(&Value::Float(4.5)).unwrap();
        assert_eq!(position.coordinates, Coordinates { x: 4.5, y: 0.0, z: 0.0 });

        // Three values cannot fit the two fields, but the leading nested
        // composite accepts them positionally.
        let mut position = Position { quality: 9, ..Position::default() };
        position
            .update_from_builtin(&Value::Sequence(vec![
                Value::Float(1.0),
                Value::Float(2.0),
                Value::Float(3.0),
            ]))
            .unwrap();
        assert_eq!(position.coordinates, Coordinates { x: 1.0, y: 2.0, z: 3.0 });
        assert_eq!(position.quality, 9);

        // Mixed form: a nested positional sequence plus a trailing scalar.
        let mut position = Position::default();
        position
            .update_from_builtin(&Value::Sequence(vec![
                Value::Sequence(vec![Value::Float(7.0), Value::Float(8.0), Value::Float(9.0)]),
                Value::Integer(3),
            ]))
            .unwrap();
        assert_eq!(position.coordinates, Coordinates { x: 7.0, y: 8.0, z: 9.0 });
        assert_eq!(position.quality, 3);

        // Eleven booleans overflow the three fields and land in the
        // leading bit-mask array.
        let mut set = SampleSet::default();
        let bits: Vec<Value> = (0..11).map(|i| Value::Bool(i % 2 == 0)).collect();
        set.update_from_builtin(&Value::Sequence(bits)).unwrap();
        let expected = [
            true, false, true, false, true, false, true, false, true, false, true,
        ];
        assert_eq!(set.mask, expected);
        assert!(set.readings.is_empty());
    }

    #[test]
    fn builtin_string_like_label() {
        let set = SampleSet { label: b"boom arm".to_vec(), ..SampleSet::default() };
        assert_eq!(set.to_builtin().get("label"), Some(&Value::String("boom arm".into())));

        let mut decoded = SampleSet::default();
        decoded
            .update_from_builtin(&Value::Map(vec![(
                "label".into(),
                Value::String("boom arm".into()),
            )]))
            .unwrap();
        assert_eq!(decoded.label, b"boom arm");
    }
}
