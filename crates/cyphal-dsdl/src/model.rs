//! Type-model access API.
//!
//! Generated data-type code embeds a [`TypeModel`] describing the DSDL
//! definition it was produced from. The presentation and transport layers
//! use this module to obtain schema information (extent, fixed port-ID,
//! message/service kind) without depending on the code generator itself.

use core::fmt;

use crate::{CodecError, Deserializer, Serializer};

/// DSDL data-type version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Version {
    /// Major version; breaking changes only.
    pub major: u8,
    /// Minor version; wire-compatible extensions.
    pub minor: u8,
}

/// What role a data type plays in the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeKind {
    /// A subject (broadcast message) type.
    Message,
    /// The request half of a service type.
    ServiceRequest,
    /// The response half of a service type.
    ServiceResponse,
    /// A service type; carries the two halves as nested types.
    Service,
}

/// Compile-time description of a generated data type.
///
/// The model of every generated type is available through
/// [`Serializable::model`] (or [`Service::model`] for service types); the
/// fields mirror what the DSDL processor knows about the definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeModel {
    /// Full dotted DSDL name, e.g. `uavcan.node.Heartbeat`.
    pub full_name: &'static str,
    /// Data-type version.
    pub version: Version,
    /// Upper bound on the serialized size of any value of this type,
    /// in bytes.
    pub extent_bytes: usize,
    /// Sealed types have a frozen layout; non-sealed (delimited) types are
    /// serialized behind a delimiter header.
    pub sealed: bool,
    /// The fixed port-ID from the definition, if one is assigned.
    pub fixed_port_id: Option<u16>,
    /// Message or service role.
    pub kind: TypeKind,
}

impl fmt::Display for TypeModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.full_name, self.version.major, self.version.minor)
    }
}

/// The contract between generated data-type code and the rest of the stack.
///
/// A generated message or service-half class provides its model, a
/// serialization routine writing the value through a [`Serializer`], and a
/// deserialization routine reconstructing a value from a [`Deserializer`].
/// The deserialization routine reports invalid representations with
/// [`CodecError::Format`].
pub trait Serializable: Sized + Send + 'static {
    /// The embedded type model.
    fn model() -> &'static TypeModel;

    /// Writes this value into the serializer.
    fn serialize_value(&self, serializer: &mut Serializer<'_>) -> Result<(), CodecError>;

    /// Reads a value from the deserializer.
    fn deserialize_value(deserializer: &mut Deserializer) -> Result<Self, CodecError>;
}

/// Marker for message (subject) types.
pub trait Message: Serializable {}

/// A service type: a pair of message-like request and response types.
pub trait Service: Send + 'static {
    /// The request half.
    type Request: Serializable;
    /// The response half.
    type Response: Serializable;

    /// The embedded service type model.
    fn model() -> &'static TypeModel;
}

/// The model of `T`. Mirrors the models embedded in generated classes.
#[must_use]
pub fn get_model<T: Serializable>() -> &'static TypeModel {
    T::model()
}

/// The extent of `T` in bytes: the size of the buffer that fits the
/// serialized representation of any value of the type.
#[must_use]
pub fn get_extent_bytes<T: Serializable>() -> usize {
    T::model().extent_bytes
}

/// The fixed port-ID of `T`, absent if the definition does not assign one.
#[must_use]
pub fn get_fixed_port_id<T: Serializable>() -> Option<u16> {
    T::model().fixed_port_id
}

/// Whether the model describes a message (subject) type.
#[must_use]
pub fn is_message_type(model: &TypeModel) -> bool {
    model.kind == TypeKind::Message
}

/// Whether the model describes a service type.
#[must_use]
pub fn is_service_type(model: &TypeModel) -> bool {
    model.kind == TypeKind::Service
}

/// Verifies that a model obtained at runtime (e.g. from a registry or a
/// configuration channel) matches the model embedded in the generated type
/// `T`. A mismatch means the generated code is stale relative to the source
/// definition the runtime model came from.
pub fn ensure_model_matches<T: Serializable>(model: &TypeModel) -> Result<(), CodecError> {
    let embedded = T::model();
    if embedded == model {
        Ok(())
    } else {
        Err(CodecError::InvalidValue(format!(
            "type model mismatch: generated code describes {embedded}, runtime model is {model}; \
             the generated code may be stale"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample;

    #[test]
    fn model_rendering() {
        let model = get_model::<sample::Status>();
        assert_eq!(model.to_string(), "example.telemetry.Status.1.0");
        assert_eq!(get_extent_bytes::<sample::Status>(), 12);
        assert_eq!(get_fixed_port_id::<sample::Status>(), Some(7509));
    }

    #[test]
    fn kind_predicates() {
        assert!(is_message_type(get_model::<sample::Integer64>()));
        assert!(!is_service_type(get_model::<sample::Integer64>()));
        assert!(is_service_type(<sample::Echo as Service>::model()));
    }

    #[test]
    fn stale_model_is_detected() {
        let mut altered = *get_model::<sample::Integer64>();
        assert!(ensure_model_matches::<sample::Integer64>(&altered).is_ok());
        altered.extent_bytes += 1;
        assert!(ensure_model_matches::<sample::Integer64>(&altered).is_err());
    }
}
