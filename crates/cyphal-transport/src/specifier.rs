//! Session identities: data specifiers and session specifiers.

use core::fmt;

/// Transport-scoped node identifier.
pub type NodeId = u16;
/// Message subject identifier.
pub type SubjectId = u16;
/// Service identifier.
pub type ServiceId = u16;

/// The reserved "unconfigured" port-ID sentinel. Higher layers treat a
/// port-ID of this value as absent.
pub const UNSET_PORT_ID: u16 = 65535;

/// Which half of a service exchange a session carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceRole {
    /// Client-to-server transfers.
    Request,
    /// Server-to-client transfers.
    Response,
}

/// What kind of data flows through a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataSpecifier {
    /// Broadcast messages on a subject.
    Message {
        /// The subject-ID.
        subject_id: SubjectId,
    },
    /// One half of a service exchange.
    Service {
        /// The service-ID.
        service_id: ServiceId,
        /// Request or response half.
        role: ServiceRole,
    },
}

impl DataSpecifier {
    /// The subject- or service-ID, whichever applies.
    #[must_use]
    pub fn port_id(&self) -> u16 {
        match self {
            Self::Message { subject_id } => *subject_id,
            Self::Service { service_id, .. } => *service_id,
        }
    }
}

impl fmt::Display for DataSpecifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Message { subject_id } => write!(f, "message:{subject_id}"),
            Self::Service { service_id, role: ServiceRole::Request } => {
                write!(f, "service:{service_id}.request")
            }
            Self::Service { service_id, role: ServiceRole::Response } => {
                write!(f, "service:{service_id}.response")
            }
        }
    }
}

/// Identity of an input (receiving) session.
///
/// An absent remote node-ID makes the session promiscuous: transfers are
/// accepted from any source. A present remote node-ID makes it selective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InputSessionSpecifier {
    /// What data flows through the session.
    pub data_specifier: DataSpecifier,
    /// The only accepted source node, or `None` for promiscuous.
    pub remote_node_id: Option<NodeId>,
}

impl fmt::Display for InputSessionSpecifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.remote_node_id {
            Some(nid) => write!(f, "in:{}<-{nid}", self.data_specifier),
            None => write!(f, "in:{}<-*", self.data_specifier),
        }
    }
}

/// Identity of an output (sending) session.
///
/// An absent remote node-ID means broadcast. Service outputs always address
/// a specific remote node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OutputSessionSpecifier {
    /// What data flows through the session.
    pub data_specifier: DataSpecifier,
    /// The destination node, or `None` for broadcast.
    pub remote_node_id: Option<NodeId>,
}

impl fmt::Display for OutputSessionSpecifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.remote_node_id {
            Some(nid) => write!(f, "out:{}->{nid}", self.data_specifier),
            None => write!(f, "out:{}->*", self.data_specifier),
        }
    }
}

/// Per-port payload description supplied when a session is opened; the
/// transport uses it to size reassembly buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadMetadata {
    /// Upper bound on the serialized size of the exchanged values, in bytes.
    pub extent_bytes: usize,
}

/// Capabilities of a concrete transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolParameters {
    /// Outgoing transfer-ID values are reduced modulo this at send time.
    pub transfer_id_modulo: u64,
    /// How many nodes the transport can address.
    pub max_nodes: u64,
    /// Maximum single-frame payload size in bytes.
    pub mtu: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rendering() {
        let promiscuous = InputSessionSpecifier {
            data_specifier: DataSpecifier::Message { subject_id: 42 },
            remote_node_id: None,
        };
        assert_eq!(promiscuous.to_string(), "in:message:42<-*");

        let unicast = OutputSessionSpecifier {
            data_specifier: DataSpecifier::Service {
                service_id: 430,
                role: ServiceRole::Response,
            },
            remote_node_id: Some(7),
        };
        assert_eq!(unicast.to_string(), "out:service:430.response->7");
    }

    #[test]
    fn port_id_projection() {
        assert_eq!(DataSpecifier::Message { subject_id: 9 }.port_id(), 9);
        let ds = DataSpecifier::Service { service_id: 11, role: ServiceRole::Request };
        assert_eq!(ds.port_id(), 11);
    }
}
