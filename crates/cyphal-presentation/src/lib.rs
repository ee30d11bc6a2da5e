//! Presentation layer of the Cyphal protocol stack: typed ports over a
//! transport.
//!
//! The [`Presentation`] controller owns one transport instance and hands
//! out four kinds of typed ports:
//!
//! - [`Publisher`] / [`Subscriber`] for subjects (broadcast messages);
//! - [`Client`] / [`Server`] for services (request/response exchanges).
//!
//! Ports with the same session specifier share one reference-counted
//! implementation: the implementation (and its transport sessions) is
//! created when the first proxy is opened and destroyed when the last
//! proxy is dropped. Outgoing transfer-ID counters live in the controller
//! and survive port close/reopen cycles, preserving the transfer-ID
//! continuity the protocol requires.
//!
//! The [`synchronizer`] module composes several subscribers into one
//! synchronized multi-subject stream.

mod controller;
mod error;
mod port;
pub mod synchronizer;

pub use crate::{
    controller::Presentation,
    error::PresentationError,
    port::{
        Client, ClientStatistics, DEFAULT_PRIORITY, DEFAULT_SEND_TIMEOUT,
        DEFAULT_SERVICE_REQUEST_TIMEOUT, OutgoingTransferIdCounter, Publisher, Server,
        ServerStatistics, ServiceRequestMetadata, Subscriber, SubscriberStatistics,
    },
};
