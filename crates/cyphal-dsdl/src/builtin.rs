//! Builtin-form representation of DSDL values.
//!
//! The builtin form expresses any DSDL object through a small recursive
//! vocabulary of maps, sequences, and scalars, which plugs directly into
//! JSON/YAML/CBOR tooling via `serde`. Map entries preserve the field
//! ordering of the source definition and use the original unstropped field
//! names.

use core::fmt;

use serde::{
    Deserialize, Serialize,
    de::{MapAccess, SeqAccess, Visitor},
    ser::{SerializeMap, SerializeSeq},
};

use crate::CodecError;

/// A DSDL value rendered with builtin vocabulary only.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Boolean scalar.
    Bool(bool),
    /// Signed integer scalar.
    Integer(i64),
    /// Unsigned integer scalar that does not fit `i64`.
    Unsigned(u64),
    /// Floating-point scalar.
    Float(f64),
    /// Text; the decoded form of string-like byte arrays.
    String(String),
    /// Array field.
    Sequence(Vec<Value>),
    /// Composite field: ordered `(field name, value)` pairs.
    Map(Vec<(String, Value)>),
}

impl Value {
    /// Decodes a byte array the way string-like DSDL arrays are rendered:
    /// as text when every byte is printable, as a sequence of integers
    /// otherwise.
    #[must_use]
    pub fn from_string_like(bytes: &[u8]) -> Self {
        if !bytes.is_empty() && bytes.iter().all(|&b| is_printable(b)) {
            if let Ok(s) = String::from_utf8(bytes.to_vec()) {
                return Self::String(s);
            }
        }
        Self::Sequence(bytes.iter().map(|&b| Self::Integer(i64::from(b))).collect())
    }

    /// The entries of a composite, if this is one.
    #[must_use]
    pub fn as_map(&self) -> Option<&[(String, Value)]> {
        match self {
            Self::Map(entries) => Some(entries),
            _ => None,
        }
    }

    /// Looks up a composite field by its unstropped name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.as_map()?.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    /// The elements of an array, if this is one.
    #[must_use]
    pub fn as_sequence(&self) -> Option<&[Value]> {
        match self {
            Self::Sequence(items) => Some(items),
            _ => None,
        }
    }

    /// Boolean view.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(x) => Some(*x),
            _ => None,
        }
    }

    /// Signed integer view; unsigned values are narrowed when they fit.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(x) => Some(*x),
            Self::Unsigned(x) => i64::try_from(*x).ok(),
            _ => None,
        }
    }

    /// Unsigned integer view; signed values are accepted when non-negative.
    #[must_use]
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::Unsigned(x) => Some(*x),
            Self::Integer(x) => u64::try_from(*x).ok(),
            _ => None,
        }
    }

    /// Floating-point view; integers are widened.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(x) => Some(*x),
            Self::Integer(x) => Some(*x as f64),
            Self::Unsigned(x) => Some(*x as f64),
            _ => None,
        }
    }

    /// Text view.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}

/// Conversion between generated objects and the builtin form.
///
/// `to_builtin` renders the object for JSON/YAML bridges;
/// `update_from_builtin` applies a builtin-form patch onto an existing
/// object, leaving unmentioned fields at their current values and failing
/// with [`CodecError::InvalidValue`] on unknown field names, shape
/// mismatches, or positional arity mismatches.
///
/// The source may be given in the named form (a map keyed by the original
/// DSDL field names) or in the positional form: a sequence supplies field
/// values in declaration order, and a bare scalar acts as a positional
/// singleton for the first field. Positional values that do not fit the
/// field count are propagated down into the first field when it is an
/// array or a nested composite that can accept them.
pub trait Builtin {
    /// Renders this object using builtin vocabulary only.
    fn to_builtin(&self) -> Value;

    /// Updates this object in place from a builtin-form representation.
    fn update_from_builtin(&mut self, source: &Value) -> Result<(), CodecError>;
}

/// Normalizes a positional builtin-form source into the named form.
///
/// Returns `Ok(None)` when the source is already named (a map). Otherwise
/// the source values — the elements of a sequence, or a bare scalar as a
/// one-element singleton — are zipped with `field_names` in declaration
/// order. When there are more values than fields and the first field is an
/// array or nested composite (`first_field_accepts_sequence`), the whole
/// sequence is handed down to that field instead; a residual arity
/// mismatch is an error.
pub(crate) fn positional_to_named(
    type_name: &str,
    field_names: &[&str],
    first_field_accepts_sequence: bool,
    source: &Value,
) -> Result<Option<Value>, CodecError> {
    let mut values = match source {
        Value::Map(_) => return Ok(None),
        Value::Sequence(items) => items.clone(),
        scalar => vec![scalar.clone()],
    };
    if first_field_accepts_sequence && values.len() > field_names.len() {
        values = vec![Value::Sequence(values)];
    }
    if values.len() > field_names.len() {
        return Err(CodecError::InvalidValue(format!(
            "cannot apply {} values to the {} fields of {type_name}",
            values.len(),
            field_names.len()
        )));
    }
    Ok(Some(Value::Map(
        field_names.iter().zip(values).map(|(name, value)| ((*name).to_owned(), value)).collect(),
    )))
}

/// Reports a field name that the destination type does not define.
pub(crate) fn unknown_field(type_name: &str, field: &str) -> CodecError {
    CodecError::InvalidValue(format!("{type_name} has no field named {field:?}"))
}

/// Reports a builtin value whose shape does not fit the destination field.
pub(crate) fn shape_mismatch(type_name: &str, field: &str, value: &Value) -> CodecError {
    CodecError::InvalidValue(format!("cannot assign {value:?} to {type_name}.{field}"))
}

// Matches the printable character set used for string-likeness detection:
// the visible ASCII range plus conventional whitespace.
fn is_printable(b: u8) -> bool {
    (0x20..=0x7E).contains(&b) || matches!(b, b'\t' | b'\n' | b'\r' | 0x0B | 0x0C)
}

impl Serialize for Value {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Bool(x) => serializer.serialize_bool(*x),
            Self::Integer(x) => serializer.serialize_i64(*x),
            Self::Unsigned(x) => serializer.serialize_u64(*x),
            Self::Float(x) => serializer.serialize_f64(*x),
            Self::String(s) => serializer.serialize_str(s),
            Self::Sequence(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Self::Map(entries) => {
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (k, v) in entries {
                    map.serialize_entry(k, v)?;
                }
                map.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ValueVisitor;

        impl<'de> Visitor<'de> for ValueVisitor {
            type Value = Value;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a builtin-form DSDL value")
            }

            fn visit_bool<E: serde::de::Error>(self, x: bool) -> Result<Value, E> {
                Ok(Value::Bool(x))
            }

            fn visit_i64<E: serde::de::Error>(self, x: i64) -> Result<Value, E> {
                Ok(Value::Integer(x))
            }

            fn visit_u64<E: serde::de::Error>(self, x: u64) -> Result<Value, E> {
                Ok(i64::try_from(x).map_or(Value::Unsigned(x), Value::Integer))
            }

            fn visit_f64<E: serde::de::Error>(self, x: f64) -> Result<Value, E> {
                Ok(Value::Float(x))
            }

            fn visit_str<E: serde::de::Error>(self, s: &str) -> Result<Value, E> {
                Ok(Value::String(s.to_owned()))
            }

            fn visit_string<E: serde::de::Error>(self, s: String) -> Result<Value, E> {
                Ok(Value::String(s))
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Value, A::Error> {
                let mut items = Vec::new();
                while let Some(item) = seq.next_element()? {
                    items.push(item);
                }
                Ok(Value::Sequence(items))
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Value, A::Error> {
                let mut entries = Vec::new();
                while let Some(entry) = map.next_entry()? {
                    entries.push(entry);
                }
                Ok(Value::Map(entries))
            }
        }

        deserializer.deserialize_any(ValueVisitor)
    }
}
