//! Transfer objects: the atomic unit of communication.

use bytes::Bytes;

use crate::{NodeId, Timestamp};

/// Transfer priority, highest first. Seven levels per the protocol
/// specification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    /// Time-critical exception reporting.
    Exceptional,
    /// Hard real-time control.
    Immediate,
    /// Fast periodic data.
    Fast,
    /// High-priority periodic data.
    High,
    /// Regular traffic; the default.
    #[default]
    Nominal,
    /// Background telemetry.
    Low,
    /// Bulk transfers that tolerate arbitrary delays.
    Slow,
}

/// An outgoing transfer.
///
/// The payload is an ordered sequence of byte fragments; its semantic
/// content is the concatenation of the fragments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    /// When the transfer was created.
    pub timestamp: Timestamp,
    /// Priority level for the link layer.
    pub priority: Priority,
    /// Monotonically assigned per-session counter value. The transport
    /// reduces it modulo its transfer-ID modulus at send time.
    pub transfer_id: u64,
    /// The serialized payload.
    pub fragmented_payload: Vec<Bytes>,
}

impl Transfer {
    /// Total payload size across all fragments, in bytes.
    #[must_use]
    pub fn payload_size_bytes(&self) -> usize {
        self.fragmented_payload.iter().map(Bytes::len).sum()
    }
}

/// A received transfer; like [`Transfer`] plus the source node-ID, which is
/// absent for transfers received from anonymous nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferFrom {
    /// Reception timestamp of the first frame of the transfer.
    pub timestamp: Timestamp,
    /// Priority level the sender used.
    pub priority: Priority,
    /// The modulo-reduced transfer-ID.
    pub transfer_id: u64,
    /// The serialized payload.
    pub fragmented_payload: Vec<Bytes>,
    /// The sending node, absent for anonymous transfers.
    pub source_node_id: Option<NodeId>,
}

impl TransferFrom {
    /// Total payload size across all fragments, in bytes.
    #[must_use]
    pub fn payload_size_bytes(&self) -> usize {
        self.fragmented_payload.iter().map(Bytes::len).sum()
    }
}

impl From<TransferFrom> for Transfer {
    fn from(t: TransferFrom) -> Self {
        Self {
            timestamp: t.timestamp,
            priority: t.priority,
            transfer_id: t.transfer_id,
            fragmented_payload: t.fragmented_payload,
        }
    }
}
