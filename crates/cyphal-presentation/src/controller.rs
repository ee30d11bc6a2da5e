//! The presentation-layer controller.

use core::fmt;
use std::{
    any::Any,
    collections::HashMap,
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicBool, Ordering},
    },
};

use cyphal_dsdl::{Message, Serializable, Service, TypeModel};
use cyphal_transport::{
    DataSpecifier, InputSessionSpecifier, NodeId, OutputSessionSpecifier, PayloadMetadata,
    ServiceId, ServiceRole, SubjectId, Transport, TransportError,
};

use crate::{
    PresentationError,
    port::{
        Client, OutgoingTransferIdCounter, Publisher, Server, Subscriber,
        client::ClientImpl, publisher::PublisherImpl, server::ServerImpl,
        subscriber::SubscriberImpl,
    },
};

/// Registry key: one implementation per `(port kind, session specifier)`.
///
/// Service ports are keyed by their input session specifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum PortKey {
    Publisher(OutputSessionSpecifier),
    Subscriber(InputSessionSpecifier),
    Client(InputSessionSpecifier),
    Server(InputSessionSpecifier),
}

/// The registry-facing face of a shared port implementation.
pub(crate) trait PortImpl: Any + Send + Sync {
    /// Stops port activity and closes the owned transport sessions.
    /// Idempotent; invoked when the controller is closed.
    fn shut_down(&self);

    /// The rendered data-type model, for diagnostics.
    fn dtype_name(&self) -> String;
}

pub(crate) struct Shared {
    pub(crate) transport: Arc<dyn Transport>,
    registry: Mutex<HashMap<PortKey, Weak<dyn PortImpl>>>,
    transfer_id_map: Mutex<HashMap<OutputSessionSpecifier, Arc<OutgoingTransferIdCounter>>>,
    closed: AtomicBool,
}

impl Shared {
    fn ensure_open(&self) -> Result<(), PresentationError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::ResourceClosed("the presentation layer is closed".into())
                .into());
        }
        Ok(())
    }

    /// The transfer-ID counter for an output session specifier, created on
    /// first use and retained for the lifetime of the controller.
    pub(crate) fn counter_for(
        &self,
        specifier: OutputSessionSpecifier,
    ) -> Arc<OutgoingTransferIdCounter> {
        let mut map = lock(&self.transfer_id_map);
        Arc::clone(map.entry(specifier).or_default())
    }

    /// Looks up the implementation for `key`, verifying its data type, or
    /// creates and registers a new one.
    fn get_or_create<I, F>(
        &self,
        key: PortKey,
        requested: &'static TypeModel,
        create: F,
    ) -> Result<Arc<I>, PresentationError>
    where
        I: PortImpl,
        F: FnOnce() -> Result<Arc<I>, PresentationError>,
    {
        let existing = {
            let mut registry = lock(&self.registry);
            if let Some(existing) = registry.get(&key).and_then(Weak::upgrade) {
                existing
            } else {
                let created = create()?;
                let as_port: Arc<dyn PortImpl> = Arc::clone(&created) as Arc<dyn PortImpl>;
                registry.insert(key, Arc::downgrade(&as_port));
                return Ok(created);
            }
        };
        // The registry lock is released at this point: if this turns out to
        // be the last reference, dropping it runs the implementation
        // finalizer, which takes the lock again.
        let registered = existing.dtype_name();
        let as_any: Arc<dyn Any + Send + Sync> = existing;
        as_any.downcast::<I>().map_err(|_| PresentationError::DataTypeMismatch {
            port: format!("{key:?}"),
            registered,
            requested: requested.to_string(),
        })
    }

    /// Removes the registry entry for `key` if its implementation is gone.
    /// Invoked by implementation finalizers; the liveness check prevents a
    /// finalizer from evicting a successor that already took the slot.
    pub(crate) fn deregister(&self, key: &PortKey) {
        let mut registry = lock(&self.registry);
        if let Some(weak) = registry.get(key) {
            if weak.upgrade().is_none() {
                registry.remove(key);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn is_registered(&self, key: &PortKey) -> bool {
        lock(&self.registry).get(key).is_some_and(|w| w.upgrade().is_some())
    }
}

/// The presentation-layer controller: a factory of typed ports over one
/// transport instance, which it owns.
///
/// `make_*` methods return a new proxy on every call; proxies for the same
/// session specifier share one reference-counted implementation that is
/// destroyed together with its transport sessions when the last proxy is
/// dropped. `get_server` returns the same server instance on repeated
/// calls.
///
/// Port factories start background receive tasks, so they must be invoked
/// from within a Tokio runtime.
pub struct Presentation {
    shared: Arc<Shared>,
}

impl Presentation {
    /// Takes ownership of the transport. Closing the presentation
    /// controller closes the transport and all its sessions.
    pub fn new(transport: impl Transport + 'static) -> Self {
        Self {
            shared: Arc::new(Shared {
                transport: Arc::new(transport),
                registry: Mutex::new(HashMap::new()),
                transfer_id_map: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Direct reference to the underlying transport instance.
    #[must_use]
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.shared.transport
    }

    /// Creates a new publisher proxy for the subject.
    pub fn make_publisher<T: Message>(
        &self,
        subject_id: SubjectId,
    ) -> Result<Publisher<T>, PresentationError> {
        self.shared.ensure_open()?;
        let specifier = OutputSessionSpecifier {
            data_specifier: DataSpecifier::Message { subject_id },
            remote_node_id: None,
        };
        let key = PortKey::Publisher(specifier);
        let shared = Arc::clone(&self.shared);
        let imp = self.shared.get_or_create(key, T::model(), move || {
            tracing::debug!(dtype = %T::model(), subject_id, "constructing new publisher");
            let session = shared.transport.output_session(specifier, payload_metadata::<T>())?;
            let counter = shared.counter_for(specifier);
            Ok(Arc::new(PublisherImpl::new(session, counter, shared, key)))
        })?;
        Ok(Publisher::from_impl(imp))
    }

    /// [`Presentation::make_publisher`] at the type's fixed subject-ID.
    pub fn make_publisher_with_fixed_subject_id<T: Message>(
        &self,
    ) -> Result<Publisher<T>, PresentationError> {
        self.make_publisher(fixed_port_id_of(T::model())?)
    }

    /// Creates a new subscriber proxy for the subject.
    ///
    /// With a bounded `queue_capacity`, messages that arrive while the
    /// queue is full are counted as overruns and dropped for this proxy
    /// only; `None` means unbounded.
    pub fn make_subscriber<T: Message + Clone>(
        &self,
        subject_id: SubjectId,
        queue_capacity: Option<usize>,
    ) -> Result<Subscriber<T>, PresentationError> {
        self.shared.ensure_open()?;
        let specifier = InputSessionSpecifier {
            data_specifier: DataSpecifier::Message { subject_id },
            remote_node_id: None,
        };
        let key = PortKey::Subscriber(specifier);
        let shared = Arc::clone(&self.shared);
        let imp = self.shared.get_or_create(key, T::model(), move || {
            tracing::debug!(
                dtype = %T::model(),
                subject_id,
                ?queue_capacity,
                "constructing new subscriber"
            );
            let session = shared.transport.input_session(specifier, payload_metadata::<T>())?;
            Ok(Arc::new(SubscriberImpl::new(session, shared, key)))
        })?;
        Ok(Subscriber::from_impl(&imp, queue_capacity))
    }

    /// [`Presentation::make_subscriber`] at the type's fixed subject-ID.
    pub fn make_subscriber_with_fixed_subject_id<T: Message + Clone>(
        &self,
        queue_capacity: Option<usize>,
    ) -> Result<Subscriber<T>, PresentationError> {
        self.make_subscriber(fixed_port_id_of(T::model())?, queue_capacity)
    }

    /// Creates a new client proxy for the service on the given server
    /// node. Clients of the same service and server share one
    /// implementation and one transfer-ID counter.
    pub fn make_client<C: Service>(
        &self,
        service_id: ServiceId,
        server_node_id: NodeId,
    ) -> Result<Client<C>, PresentationError> {
        self.shared.ensure_open()?;
        let input_specifier = InputSessionSpecifier {
            data_specifier: DataSpecifier::Service { service_id, role: ServiceRole::Response },
            remote_node_id: Some(server_node_id),
        };
        let output_specifier = OutputSessionSpecifier {
            data_specifier: DataSpecifier::Service { service_id, role: ServiceRole::Request },
            remote_node_id: Some(server_node_id),
        };
        let key = PortKey::Client(input_specifier);
        let shared = Arc::clone(&self.shared);
        let imp = self.shared.get_or_create(key, C::model(), move || {
            tracing::debug!(
                dtype = %C::model(),
                service_id,
                server_node_id,
                "constructing new client"
            );
            let output_session = shared
                .transport
                .output_session(output_specifier, payload_metadata::<C::Request>())?;
            let input_session = shared
                .transport
                .input_session(input_specifier, payload_metadata::<C::Response>())?;
            let counter = shared.counter_for(output_specifier);
            Ok(Arc::new(ClientImpl::new(input_session, output_session, counter, shared, key)))
        })?;
        Ok(Client::from_impl(imp))
    }

    /// [`Presentation::make_client`] at the type's fixed service-ID.
    pub fn make_client_with_fixed_service_id<C: Service>(
        &self,
        server_node_id: NodeId,
    ) -> Result<Client<C>, PresentationError> {
        self.make_client(fixed_port_id_of(C::model())?, server_node_id)
    }

    /// Returns the server for the service, creating it on first use; the
    /// same instance is returned on repeated calls while it is alive.
    pub fn get_server<C: Service>(
        &self,
        service_id: ServiceId,
    ) -> Result<Server<C>, PresentationError> {
        self.shared.ensure_open()?;
        let input_specifier = InputSessionSpecifier {
            data_specifier: DataSpecifier::Service { service_id, role: ServiceRole::Request },
            remote_node_id: None,
        };
        let key = PortKey::Server(input_specifier);
        let shared = Arc::clone(&self.shared);
        let imp = self.shared.get_or_create(key, C::model(), move || {
            tracing::debug!(dtype = %C::model(), service_id, "providing server");
            let input_session = shared
                .transport
                .input_session(input_specifier, payload_metadata::<C::Request>())?;
            Ok(Arc::new(ServerImpl::new(input_session, service_id, shared, key)))
        })?;
        Ok(Server::from_impl(imp))
    }

    /// [`Presentation::get_server`] at the type's fixed service-ID.
    pub fn get_server_with_fixed_service_id<C: Service>(
        &self,
    ) -> Result<Server<C>, PresentationError> {
        self.get_server(fixed_port_id_of(C::model())?)
    }

    /// Snapshot of the output transfer-ID map.
    ///
    /// Intended for very short-lived processes: persisting the map across
    /// restarts lets a process that reuses its node-ID keep the
    /// transfer-ID continuity required by the protocol. Restore a
    /// previously saved snapshot with
    /// [`Presentation::restore_output_transfer_id_map`] right after
    /// construction.
    #[must_use]
    pub fn output_transfer_id_map(&self) -> Vec<(OutputSessionSpecifier, u64)> {
        lock(&self.shared.transfer_id_map)
            .iter()
            .map(|(specifier, counter)| (*specifier, counter.peek()))
            .collect()
    }

    /// Seeds the output transfer-ID map from a snapshot taken by
    /// [`Presentation::output_transfer_id_map`].
    pub fn restore_output_transfer_id_map(
        &self,
        entries: impl IntoIterator<Item = (OutputSessionSpecifier, u64)>,
    ) {
        let mut map = lock(&self.shared.transfer_id_map);
        for (specifier, value) in entries {
            map.entry(specifier).or_default().override_value(value);
        }
    }

    /// Closes every registered port implementation and then the transport.
    /// The application does not have to close each port explicitly.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        let live: Vec<_> =
            lock(&self.shared.registry).values().filter_map(Weak::upgrade).collect();
        for imp in live {
            imp.shut_down();
        }
        self.shared.transport.close();
    }

    #[cfg(test)]
    pub(crate) fn is_registered(&self, key: &PortKey) -> bool {
        self.shared.is_registered(key)
    }
}

impl fmt::Debug for Presentation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Presentation")
            .field("transport", &self.shared.transport)
            .field("ports", &lock(&self.shared.registry).len())
            .finish_non_exhaustive()
    }
}

fn payload_metadata<T: Serializable>() -> PayloadMetadata {
    PayloadMetadata { extent_bytes: T::model().extent_bytes }
}

fn fixed_port_id_of(model: &TypeModel) -> Result<u16, PresentationError> {
    model.fixed_port_id.ok_or_else(|| PresentationError::NoFixedPortId(model.to_string()))
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use cyphal_dsdl::sample::{Bit, Integer64, Status};
    use cyphal_transport::loopback::LoopbackTransport;

    use super::*;

    fn publisher_key(subject_id: SubjectId) -> PortKey {
        PortKey::Publisher(OutputSessionSpecifier {
            data_specifier: DataSpecifier::Message { subject_id },
            remote_node_id: None,
        })
    }

    #[tokio::test]
    async fn registry_entry_lives_as_long_as_the_last_proxy() {
        let presentation = Presentation::new(LoopbackTransport::new(Some(1)));
        let key = publisher_key(100);

        let first = presentation.make_publisher::<Integer64>(100).unwrap();
        assert!(presentation.is_registered(&key));
        let second = presentation.make_publisher::<Integer64>(100).unwrap();

        drop(first);
        assert!(presentation.is_registered(&key));
        drop(second);
        assert!(!presentation.is_registered(&key));

        // A fresh proxy after full finalization re-creates the entry.
        let _third = presentation.make_publisher::<Integer64>(100).unwrap();
        assert!(presentation.is_registered(&key));
    }

    #[tokio::test]
    async fn conflicting_data_types_are_rejected() {
        let presentation = Presentation::new(LoopbackTransport::new(Some(1)));
        let _keeper = presentation.make_publisher::<Integer64>(7).unwrap();
        let result = presentation.make_publisher::<Bit>(7);
        assert!(matches!(result, Err(PresentationError::DataTypeMismatch { .. })));
    }

    #[tokio::test]
    async fn fixed_port_id_factories() {
        let presentation = Presentation::new(LoopbackTransport::new(Some(1)));
        let publisher = presentation.make_publisher_with_fixed_subject_id::<Status>().unwrap();
        assert_eq!(publisher.subject_id(), 7509);
        assert!(matches!(
            presentation.make_publisher_with_fixed_subject_id::<Integer64>(),
            Err(PresentationError::NoFixedPortId(_))
        ));
    }

    #[tokio::test]
    async fn transfer_id_map_snapshot_and_restore() {
        let presentation = Presentation::new(LoopbackTransport::new(Some(1)));
        let publisher = presentation.make_publisher::<Integer64>(33).unwrap();
        publisher.transfer_id_counter().override_value(17);

        let snapshot = presentation.output_transfer_id_map();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].1, 17);

        let successor = Presentation::new(LoopbackTransport::new(Some(1)));
        successor.restore_output_transfer_id_map(snapshot);
        let restored = successor.make_publisher::<Integer64>(33).unwrap();
        assert_eq!(restored.transfer_id_counter().peek(), 17);
    }
}
