//! Typed ports: the user-facing handles of the presentation layer.
//!
//! Every port kind splits into a cheap user-facing proxy and a shared
//! implementation keyed by session specifier. Proxies hold the
//! implementation through `Arc`; the drop of the last proxy finalizes the
//! implementation, which closes its transport sessions and removes itself
//! from the controller registry.

pub(crate) mod client;
pub(crate) mod publisher;
pub(crate) mod server;
pub(crate) mod subscriber;

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use cyphal_transport::Priority;

pub use self::{
    client::{Client, ClientStatistics},
    publisher::Publisher,
    server::{Server, ServiceRequestMetadata, ServerStatistics},
    subscriber::{Subscriber, SubscriberStatistics},
};

/// Default priority of outgoing transfers. An implementation detail, not
/// mandated by the protocol specification.
pub const DEFAULT_PRIORITY: Priority = Priority::Nominal;

/// Default send timeout of publishers.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// Default service call/response timeout, as recommended by the protocol
/// specification.
pub const DEFAULT_SERVICE_REQUEST_TIMEOUT: Duration = Duration::from_secs(1);

/// How long port background tasks wait per receive attempt. Bounds how
/// quickly they notice that the underlying session is closed.
pub(crate) const RECEIVE_SLICE: Duration = Duration::from_secs(1);

/// A member of the output transfer-ID map: a shared monotonic counter.
///
/// The value increases from zero and is never decremented; the
/// transport-specific modulus is applied at send time. Counters are shared
/// by all ports with the same output session specifier and survive port
/// close/reopen cycles for the lifetime of the presentation controller.
#[derive(Debug, Default)]
pub struct OutgoingTransferIdCounter {
    value: AtomicU64,
}

impl OutgoingTransferIdCounter {
    /// A counter starting at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Samples the counter with post-increment.
    pub fn get_then_increment(&self) -> u64 {
        self.value.fetch_add(1, Ordering::Relaxed)
    }

    /// The next value to be returned, without consuming it.
    #[must_use]
    pub fn peek(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Replaces the counter value.
    pub fn override_value(&self, value: u64) {
        self.value.store(value, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_post_increments() {
        let counter = OutgoingTransferIdCounter::new();
        assert_eq!(counter.get_then_increment(), 0);
        assert_eq!(counter.get_then_increment(), 1);
        assert_eq!(counter.peek(), 2);
        counter.override_value(40);
        assert_eq!(counter.get_then_increment(), 40);
    }
}
