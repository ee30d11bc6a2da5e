//! Wire-level observation: capture events and trace reconstruction.
//!
//! A capture handler registered via
//! [`Transport::begin_capture`](crate::Transport::begin_capture) observes
//! every transfer that crosses the wire, including traffic of other nodes
//! on promiscuous media. Captured transfers are "alien": they carry full
//! addressing metadata instead of being scoped to a local session.

use core::fmt;
use std::time::Duration;

use bytes::Bytes;

use crate::{DataSpecifier, NodeId, Priority, Timestamp};

/// Addressing of a captured transfer, as seen on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AlienSessionSpecifier {
    /// The sending node, absent for anonymous transfers.
    pub source_node_id: Option<NodeId>,
    /// The destination node, absent for broadcast.
    pub destination_node_id: Option<NodeId>,
    /// What data the transfer carries.
    pub data_specifier: DataSpecifier,
}

impl fmt::Display for AlienSessionSpecifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fmt_node = |n: Option<NodeId>| n.map_or_else(|| "*".to_owned(), |v| v.to_string());
        write!(
            f,
            "{}->{} {}",
            fmt_node(self.source_node_id),
            fmt_node(self.destination_node_id),
            self.data_specifier
        )
    }
}

/// Metadata of a captured transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlienTransferMetadata {
    /// Priority level observed on the wire.
    pub priority: Priority,
    /// The modulo-reduced transfer-ID.
    pub transfer_id: u64,
    /// Full addressing.
    pub session_specifier: AlienSessionSpecifier,
}

/// A transfer observed on (or injected into) the wire, not scoped to any
/// local session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlienTransfer {
    /// Addressing and priority.
    pub metadata: AlienTransferMetadata,
    /// The serialized payload.
    pub fragmented_payload: Vec<Bytes>,
}

/// A single capture event delivered to capture handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capture {
    /// When the event was observed.
    pub timestamp: Timestamp,
    /// The observed transfer.
    pub transfer: AlienTransfer,
}

/// A fully reconstructed transfer produced by a [`Tracer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferTrace {
    /// When the first constituent event was observed.
    pub timestamp: Timestamp,
    /// The reconstructed transfer.
    pub transfer: AlienTransfer,
    /// The transfer-ID timeout the reconstruction assumed.
    pub transfer_id_timeout: Duration,
}

/// Reassembles a stream of low-level capture events into high-level
/// transfer traces. Stateful; one instance per captured stream.
pub trait Tracer: Send {
    /// Consumes one capture event; yields a trace when one is completed by
    /// this event.
    fn update(&mut self, capture: &Capture) -> Option<TransferTrace>;
}
