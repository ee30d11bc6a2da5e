//! Transport-layer abstractions of the Cyphal protocol stack.
//!
//! This crate defines the contract every concrete transport satisfies —
//! [`Transport`] as a factory of deadline-driven [`InputSession`] /
//! [`OutputSession`] endpoints — together with the vocabulary types that
//! cross the layer boundary: transfers, session specifiers, protocol
//! parameters, and the wire-level capture surface.
//!
//! Two reference transports are included:
//!
//! - [`loopback::LoopbackTransport`] — fully in-memory, used for tests and
//!   demos; the conformance reference for the contract;
//! - [`redundant::RedundantTransport`] — aggregates homogeneous transports
//!   for interface redundancy.

pub mod loopback;
pub mod redundant;

mod capture;
mod error;
mod session;
mod specifier;
mod timestamp;
mod transfer;

pub use crate::{
    capture::{
        AlienSessionSpecifier, AlienTransfer, AlienTransferMetadata, Capture, Tracer,
        TransferTrace,
    },
    error::TransportError,
    session::{CaptureHandler, InputSession, OutputSession, SessionStatistics, Transport},
    specifier::{
        DataSpecifier, InputSessionSpecifier, NodeId, OutputSessionSpecifier, PayloadMetadata,
        ProtocolParameters, ServiceId, ServiceRole, SubjectId, UNSET_PORT_ID,
    },
    timestamp::Timestamp,
    transfer::{Priority, Transfer, TransferFrom},
};
