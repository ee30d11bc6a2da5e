//! Codec error types.

use thiserror::Error;

/// Errors reported by the wire codec.
///
/// The two variants have very different audiences:
///
/// - [`CodecError::Format`] means the *input data* is not a valid serialized
///   representation of its type. This is an expected runtime condition on any
///   real network; it is intercepted by [`crate::deserialize`] which converts
///   it into an absent result. It never indicates a bug.
///
/// - [`CodecError::InvalidValue`] means the *caller* misused the codec API:
///   forking at an unaligned offset, forking past the end of the buffer,
///   writing past the declared extent, or passing a meaningless bit length.
///   Hand-written serialization routines may trigger it; correct generated
///   code never does.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// The input is not a valid serialized representation of the data type.
    #[error("invalid serialized representation: {0}")]
    Format(String),

    /// The codec API was misused by the caller.
    #[error("codec misuse: {0}")]
    InvalidValue(String),
}

impl CodecError {
    /// `true` if this error indicates invalid input data rather than API
    /// misuse.
    #[must_use]
    pub fn is_format(&self) -> bool {
        matches!(self, Self::Format(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_predicate() {
        assert!(CodecError::Format("x".into()).is_format());
        assert!(!CodecError::InvalidValue("x".into()).is_format());
    }

    #[test]
    fn display_carries_reason() {
        let e = CodecError::Format("delimiter header exceeds buffer".into());
        assert!(e.to_string().contains("delimiter header"));
    }
}
