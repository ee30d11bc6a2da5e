//! Presentation-layer error types.

use cyphal_dsdl::CodecError;
use cyphal_transport::TransportError;
use thiserror::Error;

/// Errors reported by the presentation layer.
#[derive(Debug, Clone, Error)]
pub enum PresentationError {
    /// The port (or its underlying implementation) has been closed.
    #[error("the port is closed: {0}")]
    PortClosed(String),

    /// An error surfaced from the underlying transport.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// An error surfaced from the wire codec; indicates a defect in the
    /// serialization routine of the user-supplied object, not a network
    /// condition.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Too many concurrent requests on a transport with a small
    /// transfer-ID modulus: every modulo-reduced transfer-ID value already
    /// has a pending request.
    #[error("request transfer-ID variability exhausted: {0}")]
    RequestTransferIdVariabilityExhausted(String),

    /// A port for this session specifier already exists with a different
    /// data type.
    #[error("data type mismatch on {port}: registered {registered}, requested {requested}")]
    DataTypeMismatch {
        /// The contested port.
        port: String,
        /// The data type the existing port was created with.
        registered: String,
        /// The data type of the rejected request.
        requested: String,
    },

    /// The data type does not define a fixed port-ID.
    #[error("{0} has no fixed port-ID")]
    NoFixedPortId(String),
}

impl PresentationError {
    /// `true` if the error means the port or its transport resources are
    /// closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        match self {
            Self::PortClosed(_) => true,
            Self::Transport(e) => e.is_closed(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_predicate_spans_both_layers() {
        assert!(PresentationError::PortClosed("p".into()).is_closed());
        assert!(
            PresentationError::Transport(TransportError::ResourceClosed("t".into())).is_closed()
        );
        assert!(!PresentationError::NoFixedPortId("x".into()).is_closed());
    }
}
