//! Transport error types.

use thiserror::Error;

/// Errors reported by transports and their sessions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The transport or session has been closed; the instance is
    /// permanently unusable.
    #[error("the resource is closed: {0}")]
    ResourceClosed(String),

    /// The requested operation requires a local node-ID, which this
    /// (anonymous) transport instance does not have.
    #[error("not defined for an anonymous node: {0}")]
    OperationNotDefinedForAnonymousNode(String),

    /// The underlying medium cannot satisfy the requested configuration.
    #[error("invalid media configuration: {0}")]
    InvalidMediaConfiguration(String),
}

impl TransportError {
    /// `true` for [`TransportError::ResourceClosed`].
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::ResourceClosed(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_predicate() {
        assert!(TransportError::ResourceClosed("x".into()).is_closed());
        assert!(!TransportError::InvalidMediaConfiguration("x".into()).is_closed());
    }
}
