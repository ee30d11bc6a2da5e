//! Loopback output session.

use core::fmt;
use std::{
    sync::{
        Mutex, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::time::Instant;

use crate::{
    AlienSessionSpecifier, AlienTransfer, AlienTransferMetadata, Capture, OutputSession,
    OutputSessionSpecifier, PayloadMetadata, SessionStatistics, Transfer, TransferFrom,
    TransportError,
};

/// Sending end of the loopback short circuit. Carries per-session test
/// rigging: an injected error, a forced-timeout flag, and an extra delay.
pub struct LoopbackOutputSession {
    specifier: OutputSessionSpecifier,
    payload_metadata: PayloadMetadata,
    transport: Weak<super::State>,
    statistics: Mutex<SessionStatistics>,
    injected_error: Mutex<Option<TransportError>>,
    should_timeout: AtomicBool,
    extra_delay: Mutex<Duration>,
}

impl LoopbackOutputSession {
    pub(super) fn new(
        specifier: OutputSessionSpecifier,
        payload_metadata: PayloadMetadata,
        transport: Weak<super::State>,
    ) -> Self {
        Self {
            specifier,
            payload_metadata,
            transport,
            statistics: Mutex::new(SessionStatistics::default()),
            injected_error: Mutex::new(None),
            should_timeout: AtomicBool::new(false),
            extra_delay: Mutex::new(Duration::ZERO),
        }
    }

    /// Test rigging: makes every subsequent send fail with this error.
    pub fn set_injected_error(&self, error: Option<TransportError>) {
        *lock(&self.injected_error) = error;
    }

    /// Test rigging: makes every subsequent send report a timeout.
    pub fn set_should_timeout(&self, value: bool) {
        self.should_timeout.store(value, Ordering::Release);
    }

    /// Test rigging: inserts this delay before every send.
    pub fn set_extra_delay(&self, value: Duration) {
        *lock(&self.extra_delay) = value;
    }

    /// Routes the transfer into every matching input session of the owning
    /// transport and fires the capture handlers.
    async fn route(
        &self,
        transfer: Transfer,
        monotonic_deadline: Instant,
    ) -> Result<bool, TransportError> {
        let transport = self
            .transport
            .upgrade()
            .ok_or_else(|| TransportError::ResourceClosed(format!("{self:?}")))?;

        let send_delay = transport.send_delay();
        if send_delay > Duration::ZERO {
            tokio::time::sleep(send_delay).await;
            if Instant::now() > monotonic_deadline {
                return Ok(false);
            }
        }

        let local_node_id = transport.local_node_id();
        if self.specifier.remote_node_id.is_some()
            && self.specifier.remote_node_id != local_node_id
        {
            // Addressed to a node that does not exist on a loopback wire.
            return Ok(true);
        }

        let received = TransferFrom {
            timestamp: transfer.timestamp,
            priority: transfer.priority,
            transfer_id: transfer.transfer_id % transport.transfer_id_modulo(),
            fragmented_payload: transfer.fragmented_payload,
            source_node_id: local_node_id,
        };

        let (capture_handlers, destinations) =
            transport.delivery_plan(self.specifier.data_specifier);
        if !capture_handlers.is_empty() {
            let capture = Capture {
                timestamp: received.timestamp,
                transfer: AlienTransfer {
                    metadata: AlienTransferMetadata {
                        priority: received.priority,
                        transfer_id: received.transfer_id,
                        session_specifier: AlienSessionSpecifier {
                            source_node_id: local_node_id,
                            destination_node_id: self.specifier.remote_node_id,
                            data_specifier: self.specifier.data_specifier,
                        },
                    },
                    fragmented_payload: received.fragmented_payload.clone(),
                },
            };
            for handler in capture_handlers {
                handler(&capture);
            }
        }
        for destination in destinations {
            destination.push(received.clone());
        }
        Ok(true)
    }
}

#[async_trait]
impl OutputSession for LoopbackOutputSession {
    fn specifier(&self) -> &OutputSessionSpecifier {
        &self.specifier
    }

    fn payload_metadata(&self) -> &PayloadMetadata {
        &self.payload_metadata
    }

    async fn send(
        &self,
        transfer: Transfer,
        monotonic_deadline: Instant,
    ) -> Result<bool, TransportError> {
        if let Some(error) = lock(&self.injected_error).clone() {
            return Err(error);
        }
        let extra_delay = *lock(&self.extra_delay);
        if extra_delay > Duration::ZERO {
            tokio::time::sleep(extra_delay).await;
        }
        let payload_bytes = transfer.payload_size_bytes() as u64;
        let accepted = if self.should_timeout.load(Ordering::Acquire) {
            false
        } else {
            self.route(transfer, monotonic_deadline).await?
        };
        let mut stats = lock(&self.statistics);
        if accepted {
            stats.transfers += 1;
            stats.frames += 1;
            stats.payload_bytes += payload_bytes;
        } else {
            stats.drops += 1;
        }
        Ok(accepted)
    }

    fn sample_statistics(&self) -> SessionStatistics {
        *lock(&self.statistics)
    }

    fn close(&self) {
        *lock(&self.injected_error) =
            Some(TransportError::ResourceClosed(format!("{self:?}")));
        if let Some(transport) = self.transport.upgrade() {
            transport.remove_output_session(&self.specifier);
        }
    }
}

impl fmt::Debug for LoopbackOutputSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackOutputSession")
            .field("specifier", &self.specifier)
            .field("payload_metadata", &self.payload_metadata)
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
