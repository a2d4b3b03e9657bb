//! # Service registry
//!
//! Services are published with a name, [`Properties`] and a shared object.
//! Every mutation (register, modify, unregister, listener changes) is applied
//! as an event on the [`EventExecutor`], so all listeners observe mutations in
//! one global order. Readers never lock: the table of registered services is
//! a versioned copy-on-write snapshot swapped by the event loop.
//!
//! A registration is destroyed only once it is unregistering and no consumer
//! holds a use of it (`get_service` / `unget_service`).

mod event;
mod registration;
mod types;

use std::{
    collections::BTreeMap,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Arc,
    },
};

use arc_swap::ArcSwap;
use dashmap::DashMap;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::{
    event::{EventBus, EventKind},
    executor::{panic_message, EventExecutor, EventHandle},
    filter::{escape_value, Filter},
    properties::{Properties, SERVICE_BUNDLE_ID, SERVICE_ID, SERVICE_NAME, SERVICE_VERSION},
    version::VersionRange,
    Error, MusubiResult,
};

pub use event::{
    FnServiceListener, ListenerId, MockServiceListener, ServiceEvent, ServiceEventKind,
    ServiceListener,
};
pub use registration::{RegistrationState, ServiceRegistrationOptions, UnregisteredCallback};
pub use types::{BundleId, ServiceId, ServiceObject, ServiceRanking, ServiceReference};

use event::ListenerEntry;
use registration::Registration;

/// One registered service as seen by readers.
pub(crate) struct ServiceEntry {
    pub(crate) registration: Arc<Registration>,
    pub(crate) properties: Properties,
    pub(crate) ranking: ServiceRanking,
}

#[derive(Default)]
struct RegistryTable {
    version: u64,
    entries: BTreeMap<ServiceId, Arc<ServiceEntry>>,
}

struct RegistryInner {
    id: Uuid,
    executor: EventExecutor,
    events: Arc<EventBus>,
    table: ArcSwap<RegistryTable>,
    /// Registrations that are not destroyed yet, including unregistering ones.
    registrations: DashMap<ServiceId, Arc<Registration>>,
    next_service_id: AtomicI64,
    listeners: ArcSwap<Vec<Arc<ListenerEntry>>>,
    next_listener_id: AtomicU64,
}

#[derive(Clone)]
pub struct ServiceRegistry {
    inner: Arc<RegistryInner>,
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("id", &self.inner.id)
            .field("version", &self.version())
            .field("services", &self.service_count())
            .finish()
    }
}

impl ServiceRegistry {
    pub fn new(executor: EventExecutor, events: Arc<EventBus>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                id: Uuid::new_v4(),
                executor,
                events,
                table: ArcSwap::from_pointee(RegistryTable::default()),
                registrations: DashMap::new(),
                next_service_id: AtomicI64::new(1),
                listeners: ArcSwap::from_pointee(Vec::new()),
                next_listener_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn executor(&self) -> &EventExecutor {
        &self.inner.executor
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.inner.events
    }

    /// Version of the registration table, bumped on every applied mutation.
    pub fn version(&self) -> u64 {
        self.inner.table.load().version
    }

    /// Number of registered services.
    pub fn service_count(&self) -> usize {
        self.inner.table.load().entries.len()
    }

    /// Registers a service and waits until the registration was applied.
    #[tracing::instrument(skip(self, options), fields(name = %options.name), level = "debug")]
    pub fn register(&self, options: ServiceRegistrationOptions) -> MusubiResult<ServiceReference> {
        let (reference, registration, properties) = self.prepare(options)?;
        let inner = self.inner.clone();
        let id = reference.service_id;
        match self
            .inner
            .executor
            .execute("register_service", move || {
                inner.apply_register(registration, properties)
            }) {
            Ok(()) => Ok(reference),
            Err(Error::FrameworkShutdown) => {
                self.inner.registrations.remove(&id);
                Err(Error::FrameworkShutdown)
            }
            Err(e) => Err(e),
        }
    }

    /// Registers a service without waiting; the id is assigned immediately.
    pub fn register_async(
        &self,
        options: ServiceRegistrationOptions,
    ) -> MusubiResult<ServiceReference> {
        let (reference, registration, properties) = self.prepare(options)?;
        let inner = self.inner.clone();
        let id = reference.service_id;
        if let Err(e) = self.inner.executor.submit("register_service", move || {
            inner.apply_register(registration, properties)
        }) {
            self.inner.registrations.remove(&id);
            return Err(e);
        }
        Ok(reference)
    }

    /// Shorthand for [`ServiceRegistry::register`] owned by the framework.
    pub fn register_service<S: ?Sized + Send + Sync + 'static>(
        &self,
        name: &str,
        service: Arc<S>,
        properties: Properties,
    ) -> MusubiResult<ServiceReference> {
        self.register(ServiceRegistrationOptions::new(name, service).properties(properties))
    }

    fn prepare(
        &self,
        options: ServiceRegistrationOptions,
    ) -> MusubiResult<(ServiceReference, Arc<Registration>, Properties)> {
        if options.name.trim().is_empty() {
            return Err(Error::illegal_argument("service name must not be empty"));
        }
        if self.inner.executor.is_shutdown() {
            return Err(Error::FrameworkShutdown);
        }
        let id = ServiceId(self.inner.next_service_id.fetch_add(1, Ordering::SeqCst));
        let properties = stamp(&options.properties, &options.name, id, options.owner);
        let registration = Arc::new(Registration::new(
            id,
            options.name,
            options.owner,
            options.object,
            options.on_unregistered,
        ));
        self.inner.registrations.insert(id, registration.clone());
        Ok((self.reference(id), registration, properties))
    }

    /// Replaces the properties of a registered service.
    ///
    /// Reserved keys (`objectClass`, `service.id`, `service.bundleid`) keep
    /// their registry assigned values.
    #[tracing::instrument(skip(self, properties), level = "debug")]
    pub fn update_properties(
        &self,
        reference: ServiceReference,
        properties: Properties,
    ) -> MusubiResult<()> {
        self.check_registered(reference)?;
        let inner = self.inner.clone();
        self.inner
            .executor
            .execute("update_properties", move || {
                inner.apply_update(reference.service_id, properties)
            })
    }

    pub fn update_properties_async(
        &self,
        reference: ServiceReference,
        properties: Properties,
    ) -> MusubiResult<EventHandle> {
        self.check_registered(reference)?;
        let inner = self.inner.clone();
        self.inner
            .executor
            .submit("update_properties", move || {
                inner.apply_update(reference.service_id, properties)
            })
    }

    /// Unregisters a service and waits until listeners observed it.
    ///
    /// The object itself is destroyed once the last consumer released it,
    /// which may be after this call returns.
    #[tracing::instrument(skip(self), level = "debug")]
    pub fn unregister(&self, reference: ServiceReference) -> MusubiResult<()> {
        let registration = self.begin_unregister(reference)?;
        let inner = self.inner.clone();
        let pending = registration.clone();
        match self
            .inner
            .executor
            .execute("unregister_service", move || inner.apply_unregister(pending))
        {
            Err(Error::FrameworkShutdown) => {
                self.inner.discard(&registration);
                Err(Error::FrameworkShutdown)
            }
            result => result,
        }
    }

    pub fn unregister_async(&self, reference: ServiceReference) -> MusubiResult<EventHandle> {
        let registration = self.begin_unregister(reference)?;
        let inner = self.inner.clone();
        let pending = registration.clone();
        self.inner
            .executor
            .submit("unregister_service", move || inner.apply_unregister(pending))
            .inspect_err(|_| self.inner.discard(&registration))
    }

    fn begin_unregister(&self, reference: ServiceReference) -> MusubiResult<Arc<Registration>> {
        let registration = self.registration(reference)?;
        if !registration.mark_unregistering() {
            return Err(Error::ServiceUnregistering {
                service_id: reference.service_id,
            });
        }
        debug!(service_id = %reference.service_id, name = %registration.name, "unregistering service");
        Ok(registration)
    }

    /// Takes a use of the service object; `None` once it is unregistering.
    ///
    /// Every successful call must be paired with [`ServiceRegistry::unget_service`].
    pub fn get_service_object(&self, reference: ServiceReference) -> Option<ServiceObject> {
        if reference.registry != self.inner.id {
            warn!(%reference, "reference from another registry");
            return None;
        }
        if !self
            .inner
            .table
            .load()
            .entries
            .contains_key(&reference.service_id)
        {
            return None;
        }
        let registration = self
            .inner
            .registrations
            .get(&reference.service_id)
            .map(|r| r.value().clone())?;
        registration.acquire()
    }

    /// Typed [`ServiceRegistry::get_service_object`].
    ///
    /// Returns `None` without keeping a use when the service is not an `S`.
    pub fn get_service<S: ?Sized + Send + Sync + 'static>(
        &self,
        reference: ServiceReference,
    ) -> Option<Arc<S>> {
        let object = self.get_service_object(reference)?;
        match object.downcast::<S>() {
            Some(service) => Some(service),
            None => {
                warn!(
                    %reference,
                    "service is not a {}",
                    std::any::type_name::<S>()
                );
                self.unget_service(reference);
                None
            }
        }
    }

    /// Takes another use of a service the caller already holds a use of.
    ///
    /// Unlike `get_service_object` this also works once the service started
    /// unregistering; it fails only when the service was destroyed.
    pub(crate) fn retain_service(&self, reference: ServiceReference) -> bool {
        self.inner
            .registrations
            .get(&reference.service_id)
            .map(|r| r.value().clone())
            .is_some_and(|registration| registration.retain())
    }

    /// Releases a use taken by `get_service`; destroys the registration when
    /// it was the last use of an unregistering service.
    pub fn unget_service(&self, reference: ServiceReference) {
        let Some(registration) = self
            .inner
            .registrations
            .get(&reference.service_id)
            .map(|r| r.value().clone())
        else {
            warn!(%reference, "unget of an unknown service");
            return;
        };
        registration.release();
        self.inner.forget_if_destroyed(&registration);
    }

    /// Gets the service, calls `f` with it and releases it again.
    pub fn use_service<S, R, F>(&self, reference: ServiceReference, f: F) -> Option<R>
    where
        S: ?Sized + Send + Sync + 'static,
        F: FnOnce(&S) -> R,
    {
        let service = self.get_service::<S>(reference)?;
        let result = f(&service);
        drop(service);
        self.unget_service(reference);
        Some(result)
    }

    /// [`ServiceRegistry::use_service`] on the highest ranked match of `filter`.
    pub fn use_highest<S, R, F>(&self, filter: &Filter, f: F) -> Option<R>
    where
        S: ?Sized + Send + Sync + 'static,
        F: FnOnce(&S) -> R,
    {
        let reference = self.find_services(filter).into_iter().next()?;
        self.use_service(reference, f)
    }

    /// Matching services, preferred first.
    pub fn find_services(&self, filter: &Filter) -> Vec<ServiceReference> {
        let table = self.inner.table.load();
        let mut matches: Vec<ServiceRanking> = table
            .entries
            .values()
            .filter(|entry| filter.matches(&entry.properties))
            .map(|entry| entry.ranking)
            .collect();
        matches.sort();
        matches
            .into_iter()
            .map(|ranking| self.reference(ranking.service_id))
            .collect()
    }

    pub fn find_services_str(&self, filter: &str) -> MusubiResult<Vec<ServiceReference>> {
        let filter = Filter::parse(filter)?;
        Ok(self.find_services(&filter))
    }

    /// Highest ranked service registered under `name`.
    pub fn find_service(&self, name: &str) -> Option<ServiceReference> {
        self.find_services(&Filter::for_service(name))
            .into_iter()
            .next()
    }

    pub fn get_properties(&self, reference: ServiceReference) -> Option<Properties> {
        self.entry(reference).map(|entry| entry.properties.clone())
    }

    pub fn service_name(&self, reference: ServiceReference) -> Option<String> {
        self.entry(reference)
            .map(|entry| entry.registration.name.clone())
    }

    pub fn is_registered(&self, reference: ServiceReference) -> bool {
        self.entry(reference)
            .is_some_and(|entry| entry.registration.is_registered())
    }

    pub fn registration_state(&self, reference: ServiceReference) -> Option<RegistrationState> {
        self.inner
            .registrations
            .get(&reference.service_id)
            .map(|r| r.state())
    }

    pub fn usage_count(&self, reference: ServiceReference) -> Option<usize> {
        self.inner
            .registrations
            .get(&reference.service_id)
            .map(|r| r.usage_count())
    }

    /// Registered services owned by `bundle`, in id order.
    pub fn list_service_ids_for_bundle(&self, bundle: BundleId) -> Vec<ServiceId> {
        self.inner
            .table
            .load()
            .entries
            .values()
            .filter(|entry| entry.registration.owner == bundle)
            .map(|entry| entry.registration.id)
            .collect()
    }

    /// Unregisters everything `bundle` still has registered.
    pub fn unregister_services_for_bundle(&self, bundle: BundleId) -> MusubiResult<usize> {
        let mut count = 0;
        for id in self.list_service_ids_for_bundle(bundle) {
            match self.unregister(self.reference(id)) {
                Ok(()) => count += 1,
                Err(Error::ServiceUnregistering { .. }) | Err(Error::IllegalState { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        if count > 0 {
            info!(%bundle, count, "unregistered services of bundle");
        }
        Ok(count)
    }

    /// Adds a listener for events on services matching `filter`.
    ///
    /// Services registered at that moment are replayed as `Registered`
    /// events within the same event, so the listener sees no gap.
    #[tracing::instrument(skip(self, listener), level = "debug")]
    pub fn add_service_listener(
        &self,
        filter: Filter,
        listener: Arc<dyn ServiceListener>,
    ) -> MusubiResult<ListenerId> {
        let entry = self.listener_entry(filter, listener);
        let id = entry.id;
        let inner = self.inner.clone();
        self.inner
            .executor
            .execute("add_service_listener", move || inner.apply_add_listener(entry))?;
        Ok(id)
    }

    pub fn add_service_listener_async(
        &self,
        filter: Filter,
        listener: Arc<dyn ServiceListener>,
    ) -> MusubiResult<ListenerId> {
        let entry = self.listener_entry(filter, listener);
        let id = entry.id;
        let inner = self.inner.clone();
        self.inner
            .executor
            .submit("add_service_listener", move || inner.apply_add_listener(entry))?;
        Ok(id)
    }

    fn listener_entry(&self, filter: Filter, listener: Arc<dyn ServiceListener>) -> ListenerEntry {
        let id = ListenerId(self.inner.next_listener_id.fetch_add(1, Ordering::SeqCst));
        ListenerEntry::new(id, filter, listener)
    }

    /// Removes a listener; after this returns it receives no more events.
    pub fn remove_service_listener(&self, id: ListenerId) -> MusubiResult<bool> {
        let inner = self.inner.clone();
        self.inner
            .executor
            .execute("remove_service_listener", move || inner.apply_remove_listener(id))
    }

    /// Stops delivery to the listener at once and removes it asynchronously.
    pub fn remove_service_listener_async(&self, id: ListenerId) -> MusubiResult<EventHandle> {
        if let Some(entry) = self.inner.listeners.load().iter().find(|l| l.id == id) {
            entry.deactivate();
        }
        let inner = self.inner.clone();
        self.inner
            .executor
            .submit("remove_service_listener", move || {
                inner.apply_remove_listener(id);
            })
    }

    /// Filter for services named `name`, optionally within a version range and
    /// narrowed by an extra filter expression.
    ///
    /// ```rust
    /// use musubi::registry::ServiceRegistry;
    ///
    /// let filter = ServiceRegistry::create_filter_for("greeter", Some("[1.0.0,2.0.0)"), None).unwrap();
    /// assert_eq!(
    ///     filter.to_string(),
    ///     "(&(objectClass=greeter)(&(service.version>=1.0.0)(service.version<2.0.0)))"
    /// );
    /// ```
    pub fn create_filter_for(
        service_name: &str,
        version_range: Option<&str>,
        extra_filter: Option<&str>,
    ) -> MusubiResult<Filter> {
        if service_name.trim().is_empty() {
            return Err(Error::illegal_argument("service name must not be empty"));
        }
        let mut text = format!("(&({}={})", SERVICE_NAME, escape_value(service_name));
        if let Some(range) = version_range.map(str::trim).filter(|r| !r.is_empty()) {
            let range: VersionRange = range.parse()?;
            text.push_str(&range.to_filter(SERVICE_VERSION));
        }
        if let Some(extra) = extra_filter.map(str::trim).filter(|f| !f.is_empty()) {
            text.push_str(extra);
        }
        text.push(')');
        Ok(Filter::parse(&text)?)
    }

    /// Reference to `id` in this registry, whether or not it is registered.
    pub fn reference(&self, id: ServiceId) -> ServiceReference {
        ServiceReference {
            service_id: id,
            registry: self.inner.id,
        }
    }

    fn entry(&self, reference: ServiceReference) -> Option<Arc<ServiceEntry>> {
        if reference.registry != self.inner.id {
            return None;
        }
        self.inner
            .table
            .load()
            .entries
            .get(&reference.service_id)
            .cloned()
    }

    fn registration(&self, reference: ServiceReference) -> MusubiResult<Arc<Registration>> {
        if reference.registry != self.inner.id {
            return Err(Error::illegal_argument(format!(
                "{} belongs to another registry",
                reference
            )));
        }
        self.inner
            .registrations
            .get(&reference.service_id)
            .map(|r| r.value().clone())
            .ok_or_else(|| Error::illegal_state(format!("{} is not registered", reference)))
    }

    fn check_registered(&self, reference: ServiceReference) -> MusubiResult<()> {
        let registration = self.registration(reference)?;
        if !registration.is_registered() {
            return Err(Error::ServiceUnregistering {
                service_id: reference.service_id,
            });
        }
        Ok(())
    }
}

fn stamp(properties: &Properties, name: &str, id: ServiceId, owner: BundleId) -> Properties {
    properties.merged(
        &Properties::builder()
            .set(SERVICE_NAME, name)
            .set(SERVICE_ID, id.0)
            .set(SERVICE_BUNDLE_ID, owner.0)
            .build(),
    )
}

// Everything below runs on the event loop thread.
impl RegistryInner {
    fn reference(&self, id: ServiceId) -> ServiceReference {
        ServiceReference {
            service_id: id,
            registry: self.id,
        }
    }

    fn store_table(&self, entries: BTreeMap<ServiceId, Arc<ServiceEntry>>) {
        let version = self.table.load().version + 1;
        self.table.store(Arc::new(RegistryTable { version, entries }));
    }

    fn apply_register(&self, registration: Arc<Registration>, properties: Properties) {
        let id = registration.id;
        if !registration.is_registered() {
            debug!(service_id = %id, "service unregistered before its registration was applied");
            return;
        }
        let ranking = ServiceRanking::from_properties(id, &properties);
        let entry = Arc::new(ServiceEntry {
            registration: registration.clone(),
            properties: properties.clone(),
            ranking,
        });
        let mut entries = self.table.load().entries.clone();
        entries.insert(id, entry);
        self.store_table(entries);
        debug!(service_id = %id, name = %registration.name, rank = ranking.rank, "service registered");

        let published = self.events.publish(EventKind::Registered(id));
        let event = ServiceEvent {
            seq: published.seq,
            kind: ServiceEventKind::Registered,
            reference: self.reference(id),
            name: registration.name.clone(),
            properties,
            previous: None,
            ranking,
        };
        self.dispatch(&event, |listener| {
            listener
                .filter
                .matches(&event.properties)
                .then_some(ServiceEventKind::Registered)
        });
    }

    fn apply_update(&self, id: ServiceId, properties: Properties) {
        let table = self.table.load_full();
        let Some(current) = table.entries.get(&id).cloned() else {
            debug!(service_id = %id, "properties update for a service that is gone");
            return;
        };
        if !current.registration.is_registered() {
            return;
        }
        let registration = current.registration.clone();
        let properties = stamp(&properties, &registration.name, id, registration.owner);
        let ranking = ServiceRanking::from_properties(id, &properties);
        let mut entries = table.entries.clone();
        entries.insert(
            id,
            Arc::new(ServiceEntry {
                registration: registration.clone(),
                properties: properties.clone(),
                ranking,
            }),
        );
        self.store_table(entries);
        debug!(service_id = %id, "service properties modified");

        let published = self.events.publish(EventKind::Modified(id));
        let previous = current.properties.clone();
        let event = ServiceEvent {
            seq: published.seq,
            kind: ServiceEventKind::Modified,
            reference: self.reference(id),
            name: registration.name.clone(),
            properties,
            previous: Some(previous.clone()),
            ranking,
        };
        self.dispatch(&event, |listener| {
            listener.modification_kind(&previous, &event.properties)
        });
    }

    fn apply_unregister(&self, registration: Arc<Registration>) {
        let id = registration.id;
        let table = self.table.load_full();
        if let Some(entry) = table.entries.get(&id).cloned() {
            let mut entries = table.entries.clone();
            entries.remove(&id);
            self.store_table(entries);

            let published = self.events.publish(EventKind::Unregistering(id));
            let event = ServiceEvent {
                seq: published.seq,
                kind: ServiceEventKind::Unregistering,
                reference: self.reference(id),
                name: registration.name.clone(),
                properties: entry.properties.clone(),
                previous: None,
                ranking: entry.ranking,
            };
            self.dispatch(&event, |listener| {
                listener
                    .filter
                    .matches(&event.properties)
                    .then_some(ServiceEventKind::Unregistering)
            });
        }
        registration.finish_unregister();
        self.forget_if_destroyed(&registration);
    }

    /// Drops a registration without notifying anyone; only used once the
    /// event loop is gone.
    fn discard(&self, registration: &Arc<Registration>) {
        let table = self.table.load_full();
        if table.entries.contains_key(&registration.id) {
            let mut entries = table.entries.clone();
            entries.remove(&registration.id);
            self.store_table(entries);
        }
        registration.mark_unregistering();
        registration.finish_unregister();
        self.forget_if_destroyed(registration);
    }

    fn forget_if_destroyed(&self, registration: &Registration) {
        if registration.state() == RegistrationState::Unregistered {
            self.registrations.remove(&registration.id);
        }
    }

    fn apply_add_listener(&self, entry: ListenerEntry) {
        let entry = Arc::new(entry);
        let mut listeners = (*self.listeners.load_full()).clone();
        listeners.push(entry.clone());
        self.listeners.store(Arc::new(listeners));
        debug!(listener = %entry.id, filter = %entry.filter, "service listener added");

        let table = self.table.load_full();
        let mut matching: Vec<&Arc<ServiceEntry>> = table
            .entries
            .values()
            .filter(|service| entry.filter.matches(&service.properties))
            .collect();
        matching.sort_by(|a, b| a.ranking.cmp(&b.ranking));
        let seq = self.events.last_seq();
        for service in matching {
            if !entry.is_active() {
                break;
            }
            let event = ServiceEvent {
                seq,
                kind: ServiceEventKind::Registered,
                reference: self.reference(service.registration.id),
                name: service.registration.name.clone(),
                properties: service.properties.clone(),
                previous: None,
                ranking: service.ranking,
            };
            notify(&entry, &event);
        }
    }

    fn apply_remove_listener(&self, id: ListenerId) -> bool {
        let current = self.listeners.load_full();
        let Some(entry) = current.iter().find(|l| l.id == id) else {
            return false;
        };
        entry.deactivate();
        let listeners: Vec<_> = current.iter().filter(|l| l.id != id).cloned().collect();
        self.listeners.store(Arc::new(listeners));
        debug!(listener = %id, "service listener removed");
        true
    }

    /// Delivers `event` to every active listener `select` picks a kind for.
    fn dispatch<F>(&self, event: &ServiceEvent, select: F)
    where
        F: Fn(&ListenerEntry) -> Option<ServiceEventKind>,
    {
        let listeners = self.listeners.load_full();
        for listener in listeners.iter() {
            if !listener.is_active() {
                continue;
            }
            let Some(kind) = select(listener) else {
                continue;
            };
            if kind == event.kind {
                notify(listener, event);
            } else {
                let mut event = event.clone();
                event.kind = kind;
                notify(listener, &event);
            }
        }
    }
}

fn notify(listener: &ListenerEntry, event: &ServiceEvent) {
    trace!(listener = %listener.id, %event, seq = event.seq, "notifying service listener");
    if let Err(panic) = catch_unwind(AssertUnwindSafe(|| {
        listener.listener.service_changed(event)
    })) {
        error!(
            listener = %listener.id,
            %event,
            "service listener panicked: {}",
            panic_message(&panic)
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::FrameworkConfig, properties::SERVICE_RANKING, version::Version, ErrorKind,
    };
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;

    trait Greeter: Send + Sync {
        fn greet(&self) -> String;
    }

    struct Named(&'static str);

    impl Greeter for Named {
        fn greet(&self) -> String {
            format!("hello from {}", self.0)
        }
    }

    fn registry() -> ServiceRegistry {
        let executor = EventExecutor::new(&FrameworkConfig::default()).unwrap();
        ServiceRegistry::new(executor, Arc::new(EventBus::new(64)))
    }

    fn greeter(registry: &ServiceRegistry, name: &'static str, rank: i64) -> ServiceReference {
        registry
            .register_service::<dyn Greeter>(
                "greeter",
                Arc::new(Named(name)),
                Properties::new().with(SERVICE_RANKING, rank),
            )
            .unwrap()
    }

    fn recorder(registry: &ServiceRegistry, filter: &str) -> Arc<Mutex<Vec<(ServiceEventKind, ServiceId)>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        registry
            .add_service_listener(
                Filter::parse(filter).unwrap(),
                Arc::new(FnServiceListener(move |event: &ServiceEvent| {
                    sink.lock().push((event.kind, event.service_id()))
                })),
            )
            .unwrap();
        seen
    }

    #[test]
    fn test_register_stamps_reserved_properties() {
        let registry = registry();
        let reference = registry
            .register(
                ServiceRegistrationOptions::new("greeter", Arc::new(Named("a")) as Arc<dyn Greeter>)
                    .owner(BundleId(7))
                    .properties(Properties::new().with(SERVICE_ID, 999)),
            )
            .unwrap();
        let props = registry.get_properties(reference).unwrap();
        assert_eq!(props.get_as_string(SERVICE_NAME).as_deref(), Some("greeter"));
        assert_eq!(props.get_as_long(SERVICE_ID), Some(reference.service_id().0));
        assert_eq!(props.get_as_long(SERVICE_BUNDLE_ID), Some(7));
        assert_eq!(registry.list_service_ids_for_bundle(BundleId(7)), vec![reference.service_id()]);
        registry.executor().shutdown().unwrap();
    }

    #[test]
    fn test_service_ids_are_never_reused() {
        let registry = registry();
        let first = greeter(&registry, "a", 0);
        registry.unregister(first).unwrap();
        let second = greeter(&registry, "b", 0);
        assert!(second.service_id() > first.service_id());
        registry.executor().shutdown().unwrap();
    }

    #[test]
    fn test_find_services_orders_by_rank_then_id() {
        let registry = registry();
        let s1 = greeter(&registry, "s1", 5);
        let s2 = greeter(&registry, "s2", 10);
        let s3 = greeter(&registry, "s3", 10);
        let found = registry.find_services_str("(objectClass=greeter)").unwrap();
        assert_eq!(found, vec![s2, s3, s1]);
        assert_eq!(registry.find_service("greeter"), Some(s2));
        assert_eq!(
            registry.use_highest::<dyn Greeter, _, _>(&Filter::for_service("greeter"), |g| g.greet()),
            Some("hello from s2".to_string())
        );
        assert!(registry.find_services_str("(objectClass=greeter").is_err());
        registry.executor().shutdown().unwrap();
    }

    #[test]
    fn test_get_service_downcasts_and_counts_usage() {
        let registry = registry();
        let reference = greeter(&registry, "a", 0);
        let service = registry.get_service::<dyn Greeter>(reference).unwrap();
        assert_eq!(service.greet(), "hello from a");
        assert_eq!(registry.usage_count(reference), Some(1));
        assert!(registry.get_service::<Named>(reference).is_none());
        assert_eq!(registry.usage_count(reference), Some(1));
        registry.unget_service(reference);
        assert_eq!(registry.usage_count(reference), Some(0));
        registry.executor().shutdown().unwrap();
    }

    #[test]
    fn test_unregister_defers_destruction_until_unget() {
        let registry = registry();
        let destroyed = Arc::new(AtomicUsize::new(0));
        let counter = destroyed.clone();
        let reference = registry
            .register(
                ServiceRegistrationOptions::new("greeter", Arc::new(Named("a")) as Arc<dyn Greeter>)
                    .on_unregistered(move |_| {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }),
            )
            .unwrap();
        let service = registry.get_service::<dyn Greeter>(reference).unwrap();
        registry.unregister(reference).unwrap();

        assert!(registry.find_service("greeter").is_none());
        assert!(registry.get_service_object(reference).is_none());
        assert_eq!(
            registry.registration_state(reference),
            Some(RegistrationState::Unregistering)
        );
        assert_eq!(destroyed.load(Ordering::SeqCst), 0);
        assert_eq!(service.greet(), "hello from a");

        registry.unget_service(reference);
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(registry.registration_state(reference), None);
        registry.executor().shutdown().unwrap();
    }

    #[test]
    fn test_unget_while_unregister_is_queued_destroys_after_listeners() {
        let registry = registry();
        let order = Arc::new(Mutex::new(Vec::new()));
        let destroyed_order = order.clone();
        let reference = registry
            .register(
                ServiceRegistrationOptions::new("greeter", Arc::new(Named("a")) as Arc<dyn Greeter>)
                    .on_unregistered(move |_| destroyed_order.lock().push("destroyed")),
            )
            .unwrap();
        let listener_order = order.clone();
        registry
            .add_service_listener(
                Filter::for_service("greeter"),
                Arc::new(FnServiceListener(move |event: &ServiceEvent| {
                    if event.kind == ServiceEventKind::Unregistering {
                        listener_order.lock().push("unregistering");
                    }
                })),
            )
            .unwrap();
        let service = registry.get_service::<dyn Greeter>(reference).unwrap();

        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        registry
            .executor()
            .submit("blocker", move || {
                let _ = release_rx.recv();
            })
            .unwrap();
        let handle = registry.unregister_async(reference).unwrap();
        drop(service);
        registry.unget_service(reference);
        assert!(order.lock().is_empty());
        assert_eq!(
            registry.registration_state(reference),
            Some(RegistrationState::Unregistering)
        );

        release_tx.send(()).unwrap();
        assert!(handle.wait(Some(std::time::Duration::from_secs(5))));
        assert_eq!(*order.lock(), vec!["unregistering", "destroyed"]);
        assert_eq!(registry.registration_state(reference), None);
        registry.executor().shutdown().unwrap();
    }

    #[test]
    fn test_double_unregister_is_illegal_state() {
        let registry = registry();
        let reference = greeter(&registry, "a", 0);
        registry.unregister(reference).unwrap();
        let err = registry.unregister(reference).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IllegalState);
        let err = registry
            .update_properties(reference, Properties::new())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IllegalState);
        registry.executor().shutdown().unwrap();
    }

    #[test]
    fn test_listener_sees_replay_and_modifications() {
        let registry = registry();
        let reference = registry
            .register_service::<dyn Greeter>(
                "greeter",
                Arc::new(Named("a")),
                Properties::new().with("lang", "en"),
            )
            .unwrap();
        let seen = recorder(&registry, "(&(objectClass=greeter)(lang=en))");
        let id = reference.service_id();

        registry
            .update_properties(reference, Properties::new().with("lang", "en").with("x", 1))
            .unwrap();
        registry
            .update_properties(reference, Properties::new().with("lang", "nl"))
            .unwrap();
        registry
            .update_properties(reference, Properties::new().with("lang", "de"))
            .unwrap();
        registry
            .update_properties(reference, Properties::new().with("lang", "en"))
            .unwrap();
        registry.unregister(reference).unwrap();

        assert_eq!(
            *seen.lock(),
            vec![
                (ServiceEventKind::Registered, id),
                (ServiceEventKind::Modified, id),
                (ServiceEventKind::ModifiedEndMatch, id),
                (ServiceEventKind::Modified, id),
                (ServiceEventKind::Unregistering, id),
            ]
        );
        registry.executor().shutdown().unwrap();
    }

    #[test]
    fn test_removed_listener_receives_nothing() {
        let registry = registry();
        let mut mock = MockServiceListener::new();
        mock.expect_service_changed()
            .withf(|event| event.kind == ServiceEventKind::Registered)
            .times(1)
            .return_const(());
        let listener: Arc<dyn ServiceListener> = Arc::new(mock);

        let id = registry
            .add_service_listener(Filter::for_service("greeter"), listener.clone())
            .unwrap();
        greeter(&registry, "a", 0);
        assert!(registry.remove_service_listener(id).unwrap());
        assert!(!registry.remove_service_listener(id).unwrap());
        greeter(&registry, "b", 0);
        registry.executor().shutdown().unwrap();
        drop(registry);
        drop(listener);
    }

    #[test]
    fn test_panicking_listener_does_not_break_dispatch() {
        let registry = registry();
        registry
            .add_service_listener(
                Filter::match_all(),
                Arc::new(FnServiceListener(|_: &ServiceEvent| panic!("listener failure"))),
            )
            .unwrap();
        let seen = recorder(&registry, "(objectClass=greeter)");
        greeter(&registry, "a", 0);
        assert_eq!(seen.lock().len(), 1);
        registry.executor().shutdown().unwrap();
    }

    #[test]
    fn test_unregister_services_for_bundle() {
        let registry = registry();
        for name in ["a", "b"] {
            registry
                .register(
                    ServiceRegistrationOptions::new("greeter", Arc::new(Named(name)) as Arc<dyn Greeter>)
                        .owner(BundleId(3)),
                )
                .unwrap();
        }
        let kept = greeter(&registry, "framework", 0);
        assert_eq!(registry.unregister_services_for_bundle(BundleId(3)).unwrap(), 2);
        assert_eq!(registry.find_services(&Filter::for_service("greeter")), vec![kept]);
        registry.executor().shutdown().unwrap();
    }

    #[test]
    fn test_create_filter_for() {
        let filter = ServiceRegistry::create_filter_for("greeter", None, Some("(lang=en)")).unwrap();
        assert_eq!(filter.to_string(), "(&(objectClass=greeter)(lang=en))");
        let versioned = ServiceRegistry::create_filter_for("greeter", Some("1.2"), None).unwrap();
        assert!(versioned.matches(
            &Properties::new()
                .with(SERVICE_NAME, "greeter")
                .with(SERVICE_VERSION, Version::new(1, 3, 0))
        ));
        assert!(ServiceRegistry::create_filter_for("", None, None).is_err());
        assert!(ServiceRegistry::create_filter_for("greeter", Some("[1,"), None).is_err());
    }

    #[test]
    fn test_register_after_shutdown_fails() {
        let registry = registry();
        registry.executor().shutdown().unwrap();
        let err = registry
            .register_service::<dyn Greeter>("greeter", Arc::new(Named("late")), Properties::new())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FrameworkShutdown);
    }
}
