//! The contract every concrete transport satisfies.

use core::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::{
    AlienTransfer, Capture, InputSessionSpecifier, NodeId, OutputSessionSpecifier,
    PayloadMetadata, ProtocolParameters, Transfer, TransferFrom, TransportError,
};

/// Cumulative per-session traffic counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStatistics {
    /// Transfers moved through the session.
    pub transfers: u64,
    /// Link-layer frames moved through the session.
    pub frames: u64,
    /// Payload bytes moved through the session.
    pub payload_bytes: u64,
    /// Transfers lost to timeouts or send failures.
    pub drops: u64,
}

/// A receiving endpoint bound to one input session specifier.
#[async_trait]
pub trait InputSession: Send + Sync + fmt::Debug {
    /// The session identity.
    fn specifier(&self) -> &InputSessionSpecifier;

    /// The payload description the session was opened with.
    fn payload_metadata(&self) -> &PayloadMetadata;

    /// Suspends until a transfer arrives or the deadline expires; an
    /// expired deadline yields `Ok(None)`. A deadline in the past polls
    /// without suspending. Fails with [`TransportError::ResourceClosed`]
    /// once the session is closed.
    async fn receive(
        &self,
        monotonic_deadline: Instant,
    ) -> Result<Option<TransferFrom>, TransportError>;

    /// Samples the traffic counters.
    fn sample_statistics(&self) -> SessionStatistics;

    /// Closes the session; idempotent.
    fn close(&self);
}

/// A sending endpoint bound to one output session specifier.
#[async_trait]
pub trait OutputSession: Send + Sync + fmt::Debug {
    /// The session identity.
    fn specifier(&self) -> &OutputSessionSpecifier;

    /// The payload description the session was opened with.
    fn payload_metadata(&self) -> &PayloadMetadata;

    /// Suspends until the transfer is handed to the medium or the deadline
    /// expires. A send timeout is a non-error outcome reported as
    /// `Ok(false)`. Fails with [`TransportError::ResourceClosed`] once the
    /// session is closed.
    async fn send(
        &self,
        transfer: Transfer,
        monotonic_deadline: Instant,
    ) -> Result<bool, TransportError>;

    /// Samples the traffic counters.
    fn sample_statistics(&self) -> SessionStatistics;

    /// Closes the session; idempotent.
    fn close(&self);
}

/// Observer of wire-level [`Capture`] events.
pub type CaptureHandler = Box<dyn Fn(&Capture) + Send + Sync>;

/// A concrete transport: a factory of input and output sessions over one
/// network attachment.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// The local node-ID, absent if this instance is anonymous.
    fn local_node_id(&self) -> Option<NodeId>;

    /// Capabilities of this transport.
    fn protocol_parameters(&self) -> ProtocolParameters;

    /// Returns the input session for the specifier, creating it on first
    /// use; repeated calls with the same specifier return the same session.
    fn input_session(
        &self,
        specifier: InputSessionSpecifier,
        payload_metadata: PayloadMetadata,
    ) -> Result<Arc<dyn InputSession>, TransportError>;

    /// Returns the output session for the specifier, creating it on first
    /// use; repeated calls with the same specifier return the same session.
    ///
    /// Fails with [`TransportError::OperationNotDefinedForAnonymousNode`]
    /// if the local node is anonymous and the transport is not configured
    /// to emit anonymous transfers (services always require a node-ID).
    fn output_session(
        &self,
        specifier: OutputSessionSpecifier,
        payload_metadata: PayloadMetadata,
    ) -> Result<Arc<dyn OutputSession>, TransportError>;

    /// Closes every session and invalidates the transport; idempotent.
    fn close(&self);

    /// Registers a wire-level observer. Capture handlers cannot be
    /// removed; closing the transport stops event delivery.
    fn begin_capture(&self, handler: CaptureHandler);

    /// Injects an arbitrary (possibly spoofed) transfer directly into the
    /// wire. Testing and diagnostics facility; concrete transports may not
    /// support it.
    async fn spoof(
        &self,
        transfer: AlienTransfer,
        monotonic_deadline: Instant,
    ) -> Result<bool, TransportError>;
}
