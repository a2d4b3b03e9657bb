//! # Service tracker
//!
//! A [`ServiceTracker`] keeps a ranked, versioned snapshot of the services
//! matching a filter. It is a service listener: membership is recomputed on
//! the event loop thread while the triggering registry event is applied, and
//! the tracker's own callbacks run right there, in global event order.
//!
//! Every tracked service holds one use (`get_service`) until it leaves the
//! snapshot, so a tracked object is never destroyed under its consumers.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use musubi::{config::FrameworkConfig, framework::Framework, filter::Filter, tracker::ServiceTracker};
//!
//! let framework = Framework::new(FrameworkConfig::default()).unwrap();
//! let tracker = ServiceTracker::builder(framework.registry(), Filter::for_service("greeter"))
//!     .on_set(|highest| println!("now using {:?}", highest.map(|s| s.reference)))
//!     .open()
//!     .unwrap();
//! println!("{} greeters", tracker.tracked_count());
//! ```

use std::{
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::{Duration, Instant},
};

use arc_swap::ArcSwap;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, trace};

use crate::{
    executor::panic_message,
    filter::Filter,
    properties::Properties,
    registry::{
        ListenerId, ServiceEvent, ServiceEventKind, ServiceId, ServiceListener, ServiceObject,
        ServiceRanking, ServiceReference, ServiceRegistry,
    },
    Error, MusubiResult,
};

/// A service as held by a tracker.
#[derive(Debug, Clone)]
pub struct TrackedService {
    pub reference: ServiceReference,
    pub properties: Properties,
    pub ranking: ServiceRanking,
    pub object: ServiceObject,
}

impl TrackedService {
    pub fn service_id(&self) -> ServiceId {
        self.reference.service_id()
    }

    /// The tracked object as `Arc<S>`, if it was registered as one.
    pub fn service<S: ?Sized + Send + Sync + 'static>(&self) -> Option<Arc<S>> {
        self.object.downcast::<S>()
    }
}

/// Struct-based tracker callbacks. All of them run on the event loop thread.
#[mockall::automock]
pub trait TrackerListener: Send + Sync {
    fn added(&self, _service: &TrackedService) {}
    fn removed(&self, _service: &TrackedService) {}
    /// The highest ranked service changed.
    fn set(&self, _highest: Option<TrackedService>) {}
    fn modified(&self, _service: &TrackedService) {}
}

type ServiceCallback = Box<dyn Fn(&TrackedService) + Send + Sync>;
type SetCallback = Box<dyn Fn(Option<&TrackedService>) + Send + Sync>;

#[derive(Default)]
struct ClosureListener {
    on_add: Option<ServiceCallback>,
    on_remove: Option<ServiceCallback>,
    on_set: Option<SetCallback>,
    on_modified: Option<ServiceCallback>,
}

impl ClosureListener {
    fn is_empty(&self) -> bool {
        self.on_add.is_none()
            && self.on_remove.is_none()
            && self.on_set.is_none()
            && self.on_modified.is_none()
    }
}

impl TrackerListener for ClosureListener {
    fn added(&self, service: &TrackedService) {
        if let Some(f) = &self.on_add {
            f(service)
        }
    }

    fn removed(&self, service: &TrackedService) {
        if let Some(f) = &self.on_remove {
            f(service)
        }
    }

    fn set(&self, highest: Option<TrackedService>) {
        if let Some(f) = &self.on_set {
            f(highest.as_ref())
        }
    }

    fn modified(&self, service: &TrackedService) {
        if let Some(f) = &self.on_modified {
            f(service)
        }
    }
}

pub struct ServiceTrackerBuilder {
    registry: ServiceRegistry,
    filter: Filter,
    closures: ClosureListener,
    listeners: Vec<Arc<dyn TrackerListener>>,
}

impl ServiceTrackerBuilder {
    pub fn on_add<F: Fn(&TrackedService) + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.closures.on_add = Some(Box::new(f));
        self
    }

    pub fn on_remove<F: Fn(&TrackedService) + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.closures.on_remove = Some(Box::new(f));
        self
    }

    pub fn on_set<F: Fn(Option<&TrackedService>) + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.closures.on_set = Some(Box::new(f));
        self
    }

    pub fn on_modified<F: Fn(&TrackedService) + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.closures.on_modified = Some(Box::new(f));
        self
    }

    pub fn listener(mut self, listener: Arc<dyn TrackerListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Starts tracking. Services matching at this moment are added before
    /// this returns.
    pub fn open(self) -> MusubiResult<ServiceTracker> {
        let mut listeners = self.listeners;
        if !self.closures.is_empty() {
            listeners.insert(0, Arc::new(self.closures));
        }
        let inner = Arc::new(TrackerInner {
            registry: self.registry.clone(),
            filter: self.filter.clone(),
            listeners,
            snapshot: ArcSwap::from_pointee(TrackedSnapshot::default()),
            count: Mutex::new(0),
            count_changed: Condvar::new(),
            listener_id: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        let adapter = Arc::new(TrackerAdapter(Arc::downgrade(&inner)));
        let id = self.registry.add_service_listener(self.filter, adapter)?;
        *inner.listener_id.lock() = Some(id);
        debug!(filter = %inner.filter, listener = %id, "service tracker opened");
        Ok(ServiceTracker { inner })
    }
}

#[derive(Debug, Default)]
struct TrackedSnapshot {
    version: u64,
    /// Preferred first.
    entries: Vec<TrackedService>,
}

impl TrackedSnapshot {
    fn highest_id(&self) -> Option<ServiceId> {
        self.entries.first().map(|s| s.service_id())
    }

    fn position(&self, id: ServiceId) -> Option<usize> {
        self.entries.iter().position(|s| s.service_id() == id)
    }
}

struct TrackerInner {
    registry: ServiceRegistry,
    filter: Filter,
    listeners: Vec<Arc<dyn TrackerListener>>,
    snapshot: ArcSwap<TrackedSnapshot>,
    count: Mutex<usize>,
    count_changed: Condvar,
    listener_id: Mutex<Option<ListenerId>>,
    closed: AtomicBool,
}

struct TrackerAdapter(Weak<TrackerInner>);

impl ServiceListener for TrackerAdapter {
    fn service_changed(&self, event: &ServiceEvent) {
        if let Some(inner) = self.0.upgrade() {
            inner.handle(event);
        }
    }
}

// Runs on the event loop thread.
impl TrackerInner {
    fn handle(&self, event: &ServiceEvent) {
        trace!(filter = %self.filter, %event, "tracker event");
        let tracked = self.snapshot.load().position(event.service_id()).is_some();
        match event.kind {
            ServiceEventKind::Registered | ServiceEventKind::Modified if tracked => {
                self.modify(event)
            }
            ServiceEventKind::Registered | ServiceEventKind::Modified => self.add(event),
            ServiceEventKind::ModifiedEndMatch | ServiceEventKind::Unregistering => {
                self.remove(event.service_id())
            }
        }
    }

    fn add(&self, event: &ServiceEvent) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let Some(object) = self.registry.get_service_object(event.reference) else {
            debug!(reference = %event.reference, "not tracking a service that is going away");
            return;
        };
        let service = TrackedService {
            reference: event.reference,
            properties: event.properties.clone(),
            ranking: event.ranking,
            object,
        };
        let previous = self.snapshot.load_full();
        let mut entries = previous.entries.clone();
        entries.push(service.clone());
        entries.sort_by(|a, b| a.ranking.cmp(&b.ranking));
        let current = self.store(&previous, entries);

        self.each_listener("added", |l| l.added(&service));
        self.notify_set_if_changed(&previous, &current);
    }

    fn modify(&self, event: &ServiceEvent) {
        let previous = self.snapshot.load_full();
        let Some(index) = previous.position(event.service_id()) else {
            return;
        };
        let mut entries = previous.entries.clone();
        entries[index].properties = event.properties.clone();
        entries[index].ranking = event.ranking;
        let service = entries[index].clone();
        entries.sort_by(|a, b| a.ranking.cmp(&b.ranking));
        let current = self.store(&previous, entries);

        self.each_listener("modified", |l| l.modified(&service));
        self.notify_set_if_changed(&previous, &current);
    }

    fn remove(&self, id: ServiceId) {
        let previous = self.snapshot.load_full();
        let Some(index) = previous.position(id) else {
            return;
        };
        let mut entries = previous.entries.clone();
        let service = entries.remove(index);
        let current = self.store(&previous, entries);

        self.each_listener("removed", |l| l.removed(&service));
        self.notify_set_if_changed(&previous, &current);
        self.registry.unget_service(service.reference);
    }

    fn close(&self) {
        let previous = self.snapshot.load_full();
        if previous.entries.is_empty() {
            return;
        }
        self.store(&previous, Vec::new());
        self.each_listener("set", |l| l.set(None));
        for service in previous.entries.iter() {
            self.each_listener("removed", |l| l.removed(service));
            self.registry.unget_service(service.reference);
        }
    }

    /// Releases every tracked use without callbacks; the event loop is gone.
    fn release_all(&self) {
        let previous = self.snapshot.load_full();
        self.store(&previous, Vec::new());
        for service in previous.entries.iter() {
            self.registry.unget_service(service.reference);
        }
    }

    fn store(&self, previous: &TrackedSnapshot, entries: Vec<TrackedService>) -> Arc<TrackedSnapshot> {
        let len = entries.len();
        let current = Arc::new(TrackedSnapshot {
            version: previous.version + 1,
            entries,
        });
        self.snapshot.store(current.clone());
        *self.count.lock() = len;
        self.count_changed.notify_all();
        current
    }

    fn notify_set_if_changed(&self, previous: &TrackedSnapshot, current: &TrackedSnapshot) {
        if previous.highest_id() != current.highest_id() {
            let highest = current.entries.first().cloned();
            self.each_listener("set", |l| l.set(highest.clone()));
        }
    }

    fn each_listener<F: Fn(&dyn TrackerListener)>(&self, callback: &'static str, f: F) {
        for listener in &self.listeners {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| f(listener.as_ref()))) {
                error!(
                    filter = %self.filter,
                    callback,
                    "tracker callback panicked: {}",
                    panic_message(&panic)
                );
            }
        }
    }
}

/// Ranked view on the services matching a filter.
///
/// Closed on drop.
pub struct ServiceTracker {
    inner: Arc<TrackerInner>,
}

impl ServiceTracker {
    pub fn builder(registry: &ServiceRegistry, filter: Filter) -> ServiceTrackerBuilder {
        ServiceTrackerBuilder {
            registry: registry.clone(),
            filter,
            closures: ClosureListener::default(),
            listeners: Vec::new(),
        }
    }

    /// Tracks services registered under `name` without callbacks.
    pub fn for_service(registry: &ServiceRegistry, name: &str) -> MusubiResult<Self> {
        Self::builder(registry, Filter::for_service(name)).open()
    }

    pub fn filter(&self) -> &Filter {
        &self.inner.filter
    }

    pub fn is_open(&self) -> bool {
        !self.inner.closed.load(Ordering::SeqCst)
    }

    /// Bumped on every membership or ranking change.
    pub fn version(&self) -> u64 {
        self.inner.snapshot.load().version
    }

    pub fn tracked_count(&self) -> usize {
        self.inner.snapshot.load().entries.len()
    }

    /// Highest ranked service that is still registered.
    pub fn highest(&self) -> Option<ServiceReference> {
        self.highest_service().map(|s| s.reference)
    }

    pub fn highest_service(&self) -> Option<TrackedService> {
        self.inner
            .snapshot
            .load()
            .entries
            .iter()
            .find(|s| self.inner.registry.is_registered(s.reference))
            .cloned()
    }

    /// Tracked references, preferred first.
    pub fn all(&self) -> Vec<ServiceReference> {
        self.services().into_iter().map(|s| s.reference).collect()
    }

    pub fn services(&self) -> Vec<TrackedService> {
        self.inner
            .snapshot
            .load()
            .entries
            .iter()
            .filter(|s| self.inner.registry.is_registered(s.reference))
            .cloned()
            .collect()
    }

    /// Calls `f` with the highest ranked service, if there is one of type `S`.
    pub fn use_highest<S, R, F>(&self, f: F) -> Option<R>
    where
        S: ?Sized + Send + Sync + 'static,
        F: FnOnce(&S) -> R,
    {
        let service = self.highest_service()?.service::<S>()?;
        Some(f(&service))
    }

    /// Blocks until at least `count` services are tracked.
    ///
    /// On the event loop thread this only checks, since nothing can change
    /// while the caller occupies the loop.
    pub fn wait_for(&self, count: usize, timeout: Option<Duration>) -> bool {
        if self.inner.registry.executor().is_executor_thread() {
            return self.tracked_count() >= count;
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut current = self.inner.count.lock();
        while *current < count {
            match deadline {
                None => self.inner.count_changed.wait(&mut current),
                Some(deadline) => {
                    if self
                        .inner
                        .count_changed
                        .wait_until(&mut current, deadline)
                        .timed_out()
                    {
                        return *current >= count;
                    }
                }
            }
        }
        true
    }

    /// Stops tracking; removal callbacks run for every tracked service.
    #[tracing::instrument(skip(self), fields(filter = %self.inner.filter), level = "debug")]
    pub fn close(&self) -> MusubiResult<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let listener_id = self.inner.listener_id.lock().take();
        let inner = self.inner.clone();
        let registry = self.inner.registry.clone();
        let closed = self
            .inner
            .registry
            .executor()
            .execute("close_tracker", move || -> MusubiResult<()> {
                if let Some(id) = listener_id {
                    registry.remove_service_listener(id)?;
                }
                inner.close();
                Ok(())
            });
        match closed {
            Ok(result) => result,
            Err(Error::FrameworkShutdown) => {
                self.inner.release_all();
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

impl Drop for ServiceTracker {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!(filter = %self.inner.filter, "failed to close tracker: {}", e);
        }
    }
}

impl fmt::Debug for ServiceTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceTracker")
            .field("filter", &self.inner.filter.to_string())
            .field("tracked", &self.tracked_count())
            .field("version", &self.version())
            .finish()
    }
}
