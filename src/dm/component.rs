//! Component state machine.
//!
//! ```text
//!            enable                      all required bound
//!  Created ─────────> WaitingForRequired ─────────────────> Started
//!     │                  │      ^        init(), start(),      │  │
//!     │ disable          │      │        register provided     │  │ SUSPEND swap:
//!     │                  │      └──────────────────────────────┘  │ stop(), swap, start()
//!     v          disable │      required lost / disable:          v
//!  Destroyed <───────────┘      unregister provided,          Suspended
//!                               stop(), deinit()
//! ```
//!
//! All transitions and callbacks run on the event loop thread. Dependency
//! events that arrive while the component is in the middle of a transition
//! (for example because `start()` registered a service the component itself
//! tracks) are queued and handled right after it, never nested.

use std::{
    any::type_name,
    collections::VecDeque,
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, AtomicUsize, Ordering},
        Arc, Weak,
    },
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    error::CallbackResult,
    event::EventKind,
    executor::{panic_message, EventHandle},
    filter::Filter,
    properties::Properties,
    registry::{
        BundleId, ServiceId, ServiceObject, ServiceReference, ServiceRegistrationOptions,
        ServiceRegistry,
    },
    tracker::{ServiceTracker, TrackedService, TrackerListener},
    Error, MusubiResult,
};

use super::{
    dependency::{Cardinality, DependencyCallbacks, DependencyId, ServiceDependency},
    info::{ComponentInfo, DependencyInfo, ProvidedServiceInfo},
    strategy::{Suspendable, UpdateStrategy},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ComponentId(pub Uuid);

impl ComponentId {
    pub(crate) fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, strum::Display)]
pub enum ComponentState {
    Created,
    WaitingForRequired,
    Started,
    /// Stopped for a SUSPEND swap; only observable from inside callbacks.
    Suspended,
    Destroyed,
}

impl ComponentState {
    fn as_u8(self) -> u8 {
        match self {
            ComponentState::Created => 0,
            ComponentState::WaitingForRequired => 1,
            ComponentState::Started => 2,
            ComponentState::Suspended => 3,
            ComponentState::Destroyed => 4,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => ComponentState::Created,
            1 => ComponentState::WaitingForRequired,
            2 => ComponentState::Started,
            3 => ComponentState::Suspended,
            _ => ComponentState::Destroyed,
        }
    }
}

#[derive(Debug, Clone, Copy, strum::Display)]
#[strum(serialize_all = "lowercase")]
enum LifecycleCallback {
    Init,
    Start,
    Stop,
    Deinit,
}

type LifecycleFn<T> = Box<dyn FnMut(&mut T) -> CallbackResult + Send>;

struct Lifecycle<T> {
    init: Option<LifecycleFn<T>>,
    start: Option<LifecycleFn<T>>,
    stop: Option<LifecycleFn<T>>,
    deinit: Option<LifecycleFn<T>>,
}

impl<T> Lifecycle<T> {
    fn get_mut(&mut self, callback: LifecycleCallback) -> Option<&mut LifecycleFn<T>> {
        match callback {
            LifecycleCallback::Init => self.init.as_mut(),
            LifecycleCallback::Start => self.start.as_mut(),
            LifecycleCallback::Stop => self.stop.as_mut(),
            LifecycleCallback::Deinit => self.deinit.as_mut(),
        }
    }
}

/// A service a component registers while it is started.
pub struct ProvidedService {
    name: String,
    object: ServiceObject,
    properties: Properties,
    rebind_on: Vec<DependencyId>,
}

impl ProvidedService {
    pub fn new<S: ?Sized + Send + Sync + 'static>(name: &str, service: Arc<S>) -> Self {
        Self {
            name: name.to_string(),
            object: ServiceObject::new(service),
            properties: Properties::new(),
            rebind_on: Vec::new(),
        }
    }

    pub fn properties(mut self, properties: Properties) -> Self {
        self.properties = properties;
        self
    }

    /// Marks the service as built on `dependency`: a SUSPEND swap of that
    /// dependency unregisters it before `stop()` and registers it again
    /// after `start()`. Other provided services stay registered.
    pub fn rebind_on(mut self, dependency: DependencyId) -> Self {
        self.rebind_on.push(dependency);
        self
    }
}

impl fmt::Debug for ProvidedService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvidedService")
            .field("name", &self.name)
            .field("properties", &self.properties)
            .field("rebind_on", &self.rebind_on)
            .finish()
    }
}

/// Declarative description of a component, handed to the dependency manager.
pub struct Component<T> {
    id: ComponentId,
    name: String,
    bundle: BundleId,
    implementation: T,
    lifecycle: Lifecycle<T>,
    dependencies: Vec<ServiceDependency<T>>,
    provided: Vec<ProvidedService>,
}

impl<T: Send + 'static> Component<T> {
    /// A component named after the implementation type.
    pub fn new(implementation: T) -> Self {
        let full = type_name::<T>();
        let name = full.rsplit("::").next().unwrap_or(full).to_string();
        Self {
            id: ComponentId::generate(),
            name,
            bundle: BundleId::FRAMEWORK,
            implementation,
            lifecycle: Lifecycle {
                init: None,
                start: None,
                stop: None,
                deinit: None,
            },
            dependencies: Vec::new(),
            provided: Vec::new(),
        }
    }

    pub fn id(&self) -> ComponentId {
        self.id
    }

    pub fn name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = name.into();
        self
    }

    /// Owner of the services the component provides.
    pub fn bundle(mut self, bundle: BundleId) -> Self {
        self.bundle = bundle;
        self
    }

    pub fn set_callbacks(
        mut self,
        init: Option<fn(&mut T) -> CallbackResult>,
        start: Option<fn(&mut T) -> CallbackResult>,
        stop: Option<fn(&mut T) -> CallbackResult>,
        deinit: Option<fn(&mut T) -> CallbackResult>,
    ) -> Self {
        let boxed = |f: fn(&mut T) -> CallbackResult| Box::new(f) as LifecycleFn<T>;
        self.lifecycle = Lifecycle {
            init: init.map(boxed),
            start: start.map(boxed),
            stop: stop.map(boxed),
            deinit: deinit.map(boxed),
        };
        self
    }

    pub fn on_init<F: FnMut(&mut T) -> CallbackResult + Send + 'static>(mut self, f: F) -> Self {
        self.lifecycle.init = Some(Box::new(f));
        self
    }

    pub fn on_start<F: FnMut(&mut T) -> CallbackResult + Send + 'static>(mut self, f: F) -> Self {
        self.lifecycle.start = Some(Box::new(f));
        self
    }

    pub fn on_stop<F: FnMut(&mut T) -> CallbackResult + Send + 'static>(mut self, f: F) -> Self {
        self.lifecycle.stop = Some(Box::new(f));
        self
    }

    pub fn on_deinit<F: FnMut(&mut T) -> CallbackResult + Send + 'static>(mut self, f: F) -> Self {
        self.lifecycle.deinit = Some(Box::new(f));
        self
    }

    pub fn add_service_dependency(&mut self, dependency: ServiceDependency<T>) -> DependencyId {
        self.dependencies.push(dependency);
        DependencyId(self.dependencies.len() - 1)
    }

    pub fn add_provided_service(&mut self, service: ProvidedService) {
        self.provided.push(service);
    }
}

/// One use of a service, given back on drop.
#[derive(Debug)]
struct HeldUse {
    registry: ServiceRegistry,
    reference: ServiceReference,
}

impl Drop for HeldUse {
    fn drop(&mut self) {
        self.registry.unget_service(self.reference);
    }
}

/// A service as bound by a component.
///
/// The binding keeps the service alive on its own, so an unregistered
/// service outlives its tracker until the component let go of it. Clones
/// share the use.
#[derive(Debug, Clone)]
pub(crate) struct BoundService {
    service: TrackedService,
    _held: Option<Arc<HeldUse>>,
}

impl BoundService {
    /// Must be called while the tracker still holds its use of `service`.
    fn retain(registry: &ServiceRegistry, service: &TrackedService) -> Self {
        let held = registry.retain_service(service.reference).then(|| {
            Arc::new(HeldUse {
                registry: registry.clone(),
                reference: service.reference,
            })
        });
        if held.is_none() {
            warn!(reference = %service.reference, "binding a service that is already destroyed");
        }
        Self {
            service: service.clone(),
            _held: held,
        }
    }

    fn service_id(&self) -> ServiceId {
        self.service.service_id()
    }
}

#[derive(Debug, Clone)]
pub(crate) enum DependencyEvent {
    Set(Option<BoundService>),
    Add(BoundService),
    Remove(TrackedService),
    Update(TrackedService),
}

impl DependencyEvent {
    fn is_detach(&self) -> bool {
        matches!(self, DependencyEvent::Remove(_) | DependencyEvent::Set(None))
    }

    fn callback_name(&self) -> &'static str {
        match self {
            DependencyEvent::Set(_) => "set",
            DependencyEvent::Add(_) => "add",
            DependencyEvent::Remove(_) => "remove",
            DependencyEvent::Update(_) => "update",
        }
    }
}

enum Command {
    Enable,
    Disable,
    Dependency {
        id: DependencyId,
        event: DependencyEvent,
    },
}

/// Immutable description plus lock-free status of one dependency.
struct DependencyStatus {
    service_name: String,
    filter: Filter,
    required: bool,
    cardinality: Cardinality,
    strategy: UpdateStrategy,
    available: AtomicBool,
    tracked: AtomicUsize,
}

struct ProvidedStatus {
    name: String,
    properties: String,
    service_id: AtomicI64,
}

struct DependencySlot<T> {
    callbacks: DependencyCallbacks<T>,
    tracker: Option<ServiceTracker>,
    current: Option<BoundService>,
    bound: Vec<BoundService>,
}

impl<T> DependencySlot<T> {
    fn has_callback(&self, event: &DependencyEvent) -> bool {
        match event {
            DependencyEvent::Set(_) => self.callbacks.set.is_some(),
            DependencyEvent::Add(_) => self.callbacks.add.is_some(),
            DependencyEvent::Remove(_) => self.callbacks.remove.is_some(),
            DependencyEvent::Update(_) => self.callbacks.update.is_some(),
        }
    }

    fn binds(&self, service: &TrackedService) -> bool {
        let id = service.service_id();
        self.current.as_ref().is_some_and(|s| s.service_id() == id)
            || self.bound.iter().any(|s| s.service_id() == id)
    }

    fn is_available(&self) -> bool {
        self.current.is_some() || !self.bound.is_empty()
    }
}

struct ProvidedSlot {
    service: ProvidedService,
    registered: Option<ServiceReference>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wanted {
    Idle,
    Enabled,
    Disabled,
}

/// Mutable component state; only touched on the event loop thread.
struct Machine<T> {
    wanted: Wanted,
    lifecycle: Lifecycle<T>,
    dependencies: Vec<DependencySlot<T>>,
    provided: Vec<ProvidedSlot>,
    /// Set after a failed init/start so the component does not retry until
    /// one of its dependencies changes.
    retry_blocked: bool,
}

const REQUEST_NONE: u8 = 0;
const REQUEST_ENABLE: u8 = 1;
const REQUEST_DISABLE: u8 = 2;

pub(crate) struct ComponentCore<T> {
    id: ComponentId,
    name: String,
    bundle: BundleId,
    registry: ServiceRegistry,
    log_transitions: bool,
    this: Weak<ComponentCore<T>>,
    implementation: Arc<Mutex<T>>,
    state: AtomicU8,
    request: AtomicU8,
    times_started: AtomicU64,
    times_resumed: AtomicU64,
    last_transition: Mutex<DateTime<Utc>>,
    dependencies: Vec<DependencyStatus>,
    provided: Vec<ProvidedStatus>,
    machine: Mutex<Machine<T>>,
    pending: Mutex<VecDeque<Command>>,
    in_transition: AtomicBool,
    teardown_errors: Mutex<Vec<Error>>,
}

struct TransitionGuard<'a>(&'a AtomicBool);

impl Drop for TransitionGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn guarded<F: FnOnce() -> CallbackResult>(f: F) -> Result<(), String> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.message),
        Err(panic) => Err(format!("panicked: {}", panic_message(&panic))),
    }
}

impl<T: Send + 'static> ComponentCore<T> {
    pub(crate) fn new(
        component: Component<T>,
        registry: ServiceRegistry,
        log_transitions: bool,
    ) -> MusubiResult<Arc<Self>> {
        let mut statuses = Vec::with_capacity(component.dependencies.len());
        let mut slots = Vec::with_capacity(component.dependencies.len());
        for dependency in component.dependencies {
            let filter = dependency.build_filter()?;
            statuses.push(DependencyStatus {
                service_name: dependency.service_name,
                filter,
                required: dependency.required,
                cardinality: dependency.cardinality,
                strategy: dependency.strategy,
                available: AtomicBool::new(false),
                tracked: AtomicUsize::new(0),
            });
            slots.push(DependencySlot {
                callbacks: dependency.callbacks,
                tracker: None,
                current: None,
                bound: Vec::new(),
            });
        }
        for service in &component.provided {
            if let Some(unknown) = service.rebind_on.iter().find(|d| d.0 >= statuses.len()) {
                return Err(Error::illegal_argument(format!(
                    "provided service `{}` rebinds on unknown dependency {}",
                    service.name, unknown
                )));
            }
        }
        let provided_statuses = component
            .provided
            .iter()
            .map(|service| ProvidedStatus {
                name: service.name.clone(),
                properties: service.properties.to_string(),
                service_id: AtomicI64::new(-1),
            })
            .collect();
        let provided_slots = component
            .provided
            .into_iter()
            .map(|service| ProvidedSlot {
                service,
                registered: None,
            })
            .collect();

        Ok(Arc::new_cyclic(|this| ComponentCore {
            id: component.id,
            name: component.name,
            bundle: component.bundle,
            registry,
            log_transitions,
            this: this.clone(),
            implementation: Arc::new(Mutex::new(component.implementation)),
            state: AtomicU8::new(ComponentState::Created.as_u8()),
            request: AtomicU8::new(REQUEST_NONE),
            times_started: AtomicU64::new(0),
            times_resumed: AtomicU64::new(0),
            last_transition: Mutex::new(Utc::now()),
            dependencies: statuses,
            provided: provided_statuses,
            machine: Mutex::new(Machine {
                wanted: Wanted::Idle,
                lifecycle: component.lifecycle,
                dependencies: slots,
                provided: provided_slots,
                retry_blocked: false,
            }),
            pending: Mutex::new(VecDeque::new()),
            in_transition: AtomicBool::new(false),
            teardown_errors: Mutex::new(Vec::new()),
        }))
    }

    pub(crate) fn state(&self) -> ComponentState {
        ComponentState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn request_enable(&self) -> MusubiResult<()> {
        if let Err(current) = self.request.compare_exchange(
            REQUEST_NONE,
            REQUEST_ENABLE,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            let message = if current == REQUEST_ENABLE {
                format!("component {} is already enabled", self.name)
            } else {
                format!("component {} is disabled", self.name)
            };
            warn!(component = %self.name, uuid = %self.id, "{}", message);
            return Err(Error::illegal_state(message));
        }
        Ok(())
    }

    fn request_disable(&self) -> MusubiResult<()> {
        if self.request.swap(REQUEST_DISABLE, Ordering::SeqCst) == REQUEST_DISABLE {
            let message = format!("component {} is already disabled", self.name);
            warn!(component = %self.name, uuid = %self.id, "{}", message);
            return Err(Error::illegal_state(message));
        }
        Ok(())
    }

    pub(crate) fn is_enable_requested(&self) -> bool {
        self.request.load(Ordering::SeqCst) == REQUEST_ENABLE
    }

    pub(crate) fn is_disable_requested(&self) -> bool {
        self.request.load(Ordering::SeqCst) == REQUEST_DISABLE
    }

    pub(crate) fn enable(self: &Arc<Self>) -> MusubiResult<()> {
        self.request_enable()?;
        let core = self.clone();
        self.registry
            .executor()
            .execute("enable_component", move || core.submit(Command::Enable))
    }

    pub(crate) fn enable_async(self: &Arc<Self>) -> MusubiResult<EventHandle> {
        self.request_enable()?;
        let core = self.clone();
        self.registry
            .executor()
            .submit("enable_component", move || core.submit(Command::Enable))
    }

    /// Disables the component; a failing `stop()` or `deinit()` is reported
    /// after the teardown completed anyway.
    pub(crate) fn disable(self: &Arc<Self>) -> MusubiResult<()> {
        self.request_disable()?;
        let core = self.clone();
        let errors = self
            .registry
            .executor()
            .execute("disable_component", move || {
                core.submit(Command::Disable);
                std::mem::take(&mut *core.teardown_errors.lock())
            })?;
        match errors.into_iter().next() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    pub(crate) fn disable_async(self: &Arc<Self>) -> MusubiResult<EventHandle> {
        self.request_disable()?;
        let core = self.clone();
        self.registry
            .executor()
            .submit("disable_component", move || core.submit(Command::Disable))
    }

    pub(crate) fn info(&self) -> ComponentInfo {
        let state = self.state();
        ComponentInfo {
            id: self.id,
            name: self.name.clone(),
            bundle_id: self.bundle.0,
            state,
            active: state == ComponentState::Started,
            times_started: self.times_started.load(Ordering::SeqCst),
            times_resumed: self.times_resumed.load(Ordering::SeqCst),
            last_transition: *self.last_transition.lock(),
            dependencies: self
                .dependencies
                .iter()
                .enumerate()
                .map(|(index, status)| DependencyInfo {
                    id: DependencyId(index),
                    service_name: status.service_name.clone(),
                    filter: status.filter.to_string(),
                    required: status.required,
                    cardinality: status.cardinality,
                    strategy: status.strategy,
                    available: status.available.load(Ordering::SeqCst),
                    tracked: status.tracked.load(Ordering::SeqCst),
                })
                .collect(),
            provided_services: self
                .provided
                .iter()
                .map(|status| ProvidedServiceInfo {
                    name: status.name.clone(),
                    properties: status.properties.clone(),
                    service_id: match status.service_id.load(Ordering::SeqCst) {
                        -1 => None,
                        id => Some(id),
                    },
                })
                .collect(),
        }
    }

    // Everything below runs on the event loop thread.

    fn submit(&self, command: Command) {
        self.pending.lock().push_back(command);
        if self.in_transition.swap(true, Ordering::SeqCst) {
            // handled by the frame already processing this component
            return;
        }
        let _guard = TransitionGuard(&self.in_transition);
        loop {
            let next = self.pending.lock().pop_front();
            let Some(command) = next else {
                break;
            };
            let mut machine = self.machine.lock();
            self.handle(&mut machine, command);
        }
    }

    fn handle(&self, machine: &mut Machine<T>, command: Command) {
        match command {
            Command::Enable => {
                machine.wanted = Wanted::Enabled;
                self.registry
                    .events()
                    .publish(EventKind::ComponentEnable(self.id));
                self.handle_change(machine);
            }
            Command::Disable => {
                self.teardown_errors.lock().clear();
                machine.wanted = Wanted::Disabled;
                self.registry
                    .events()
                    .publish(EventKind::ComponentDisable(self.id));
                self.handle_change(machine);
            }
            Command::Dependency { id, event } => self.handle_dependency(machine, id, event),
        }
    }

    fn handle_dependency(&self, machine: &mut Machine<T>, id: DependencyId, event: DependencyEvent) {
        if let DependencyEvent::Update(service) = &event {
            if !machine.dependencies[id.0].binds(service) {
                return;
            }
        }
        machine.retry_blocked = false;
        if event.is_detach() {
            // tear down first so stop() still sees the old binding
            let released = self.record(machine, id, &event);
            self.handle_change(machine);
            self.apply_update(machine, id, &event);
            drop(released);
        } else {
            self.apply_update(machine, id, &event);
            self.handle_change(machine);
        }
    }

    fn apply_update(&self, machine: &mut Machine<T>, id: DependencyId, event: &DependencyEvent) {
        let strategy = self.dependencies[id.0].strategy;
        let suspend = !matches!(event, DependencyEvent::Update(_))
            && machine.dependencies[id.0].has_callback(event);
        let mut transition = Transition {
            core: self,
            machine,
        };
        if suspend {
            strategy.apply(&mut transition, id, |t| t.swap(id, event));
        } else {
            transition.swap(id, event);
        }
    }

    /// Applies `event` to the bindings and returns the binding it displaced.
    ///
    /// The caller drops the returned binding once the callbacks ran; that
    /// gives back the component's use of the service.
    fn record(
        &self,
        machine: &mut Machine<T>,
        id: DependencyId,
        event: &DependencyEvent,
    ) -> Option<BoundService> {
        let slot = &mut machine.dependencies[id.0];
        let released = match event {
            DependencyEvent::Set(service) => std::mem::replace(&mut slot.current, service.clone()),
            DependencyEvent::Add(service) => {
                if !slot.binds(&service.service) {
                    slot.bound.push(service.clone());
                }
                None
            }
            DependencyEvent::Remove(service) => {
                let removed = service.service_id();
                slot.bound
                    .iter()
                    .position(|s| s.service_id() == removed)
                    .map(|index| slot.bound.remove(index))
            }
            DependencyEvent::Update(service) => {
                let updated = service.service_id();
                if let Some(current) = slot.current.as_mut().filter(|s| s.service_id() == updated) {
                    current.service = service.clone();
                }
                if let Some(bound) = slot.bound.iter_mut().find(|s| s.service_id() == updated) {
                    bound.service = service.clone();
                }
                None
            }
        };
        self.dependencies[id.0]
            .available
            .store(slot.is_available(), Ordering::SeqCst);
        released
    }

    fn invoke_dependency(&self, machine: &mut Machine<T>, id: DependencyId, event: &DependencyEvent) {
        let slot = &mut machine.dependencies[id.0];
        let outcome = {
            let mut guard = self.implementation.lock();
            let implementation = &mut *guard;
            match event {
                DependencyEvent::Set(service) => slot
                    .callbacks
                    .set
                    .as_mut()
                    .map(|f| guarded(|| f(implementation, service.as_ref().map(|s| &s.service)))),
                DependencyEvent::Add(service) => slot
                    .callbacks
                    .add
                    .as_mut()
                    .map(|f| guarded(|| f(implementation, &service.service))),
                DependencyEvent::Remove(service) => slot
                    .callbacks
                    .remove
                    .as_mut()
                    .map(|f| guarded(|| f(implementation, service))),
                DependencyEvent::Update(service) => slot
                    .callbacks
                    .update
                    .as_mut()
                    .map(|f| guarded(|| f(implementation, service))),
            }
        };
        if let Some(Err(message)) = outcome {
            error!(
                component = %self.name,
                uuid = %self.id,
                dependency = %id,
                service = %self.dependencies[id.0].service_name,
                callback = event.callback_name(),
                "dependency callback failed: {}",
                message
            );
        }
    }

    fn invoke_lifecycle(&self, machine: &mut Machine<T>, callback: LifecycleCallback) -> MusubiResult<()> {
        let Some(f) = machine.lifecycle.get_mut(callback) else {
            return Ok(());
        };
        let outcome = {
            let mut guard = self.implementation.lock();
            guarded(|| f(&mut *guard))
        };
        outcome.map_err(|message| {
            error!(
                component = %self.name,
                uuid = %self.id,
                %callback,
                "lifecycle callback failed: {}",
                message
            );
            Error::ServiceCallbackFailed {
                component: self.name.clone(),
                callback: callback.to_string(),
                message,
            }
        })
    }

    fn all_required_resolved(&self, machine: &Machine<T>) -> bool {
        machine
            .dependencies
            .iter()
            .zip(&self.dependencies)
            .all(|(slot, status)| slot.tracker.is_some() && (!status.required || slot.is_available()))
    }

    fn handle_change(&self, machine: &mut Machine<T>) {
        loop {
            let current = self.state();
            let resolved = self.all_required_resolved(machine);
            let next = match (current, machine.wanted) {
                (ComponentState::Created, Wanted::Enabled) => ComponentState::WaitingForRequired,
                (ComponentState::Created, Wanted::Disabled) => ComponentState::Destroyed,
                (ComponentState::WaitingForRequired, Wanted::Disabled) => ComponentState::Destroyed,
                (ComponentState::WaitingForRequired, Wanted::Enabled)
                    if resolved && !machine.retry_blocked =>
                {
                    ComponentState::Started
                }
                (ComponentState::Started, Wanted::Disabled) => ComponentState::WaitingForRequired,
                (ComponentState::Started, _) if !resolved => ComponentState::WaitingForRequired,
                _ => return,
            };
            if !self.perform_transition(machine, current, next) {
                return;
            }
        }
    }

    fn perform_transition(
        &self,
        machine: &mut Machine<T>,
        from: ComponentState,
        to: ComponentState,
    ) -> bool {
        match (from, to) {
            (ComponentState::Created, ComponentState::WaitingForRequired) => {
                self.open_trackers(machine);
            }
            (ComponentState::Created, ComponentState::Destroyed) => {}
            (ComponentState::WaitingForRequired, ComponentState::Started) => {
                if self.invoke_lifecycle(machine, LifecycleCallback::Init).is_err() {
                    machine.retry_blocked = true;
                    return false;
                }
                if self.invoke_lifecycle(machine, LifecycleCallback::Start).is_err() {
                    let _ = self.invoke_lifecycle(machine, LifecycleCallback::Deinit);
                    machine.retry_blocked = true;
                    return false;
                }
                self.times_started.fetch_add(1, Ordering::SeqCst);
                self.set_state(from, to);
                self.register_provided(machine, None);
                return true;
            }
            (ComponentState::Started, ComponentState::WaitingForRequired) => {
                self.unregister_provided(machine, None);
                for callback in [LifecycleCallback::Stop, LifecycleCallback::Deinit] {
                    if let Err(e) = self.invoke_lifecycle(machine, callback) {
                        if machine.wanted == Wanted::Disabled {
                            self.teardown_errors.lock().push(e);
                        }
                    }
                }
            }
            (ComponentState::WaitingForRequired, ComponentState::Destroyed) => {
                self.close_trackers(machine);
            }
            (from, to) => {
                error!(component = %self.name, uuid = %self.id, %from, %to, "invalid component transition");
                return false;
            }
        }
        self.set_state(from, to);
        true
    }

    fn set_state(&self, from: ComponentState, to: ComponentState) {
        self.state.store(to.as_u8(), Ordering::SeqCst);
        *self.last_transition.lock() = Utc::now();
        if self.log_transitions {
            info!(component = %self.name, uuid = %self.id, "{} -> {}", from, to);
        } else {
            debug!(component = %self.name, uuid = %self.id, "{} -> {}", from, to);
        }
    }

    fn open_trackers(&self, machine: &mut Machine<T>) {
        for (index, status) in self.dependencies.iter().enumerate() {
            let bridge = Arc::new(DependencyBridge {
                core: self.this.clone(),
                id: DependencyId(index),
            });
            match ServiceTracker::builder(&self.registry, status.filter.clone())
                .listener(bridge)
                .open()
            {
                Ok(tracker) => machine.dependencies[index].tracker = Some(tracker),
                Err(e) => error!(
                    component = %self.name,
                    uuid = %self.id,
                    dependency = %DependencyId(index),
                    "failed to track dependency: {}",
                    e
                ),
            }
        }
    }

    fn close_trackers(&self, machine: &mut Machine<T>) {
        for (index, slot) in machine.dependencies.iter_mut().enumerate() {
            if let Some(tracker) = slot.tracker.take() {
                if let Err(e) = tracker.close() {
                    warn!(
                        component = %self.name,
                        dependency = %DependencyId(index),
                        "failed to close dependency tracker: {}",
                        e
                    );
                }
            }
        }
    }

    /// Registers provided services that are not registered; with `only`,
    /// just the ones rebinding on that dependency.
    fn register_provided(&self, machine: &mut Machine<T>, only: Option<DependencyId>) {
        for (index, slot) in machine.provided.iter_mut().enumerate() {
            if slot.registered.is_some() {
                continue;
            }
            if only.is_some_and(|dependency| !slot.service.rebind_on.contains(&dependency)) {
                continue;
            }
            let options =
                ServiceRegistrationOptions::from_object(&slot.service.name, slot.service.object.clone())
                    .owner(self.bundle)
                    .properties(slot.service.properties.clone());
            match self.registry.register(options) {
                Ok(reference) => {
                    debug!(component = %self.name, service = %slot.service.name, %reference, "provided service registered");
                    self.provided[index]
                        .service_id
                        .store(reference.service_id().0, Ordering::SeqCst);
                    slot.registered = Some(reference);
                }
                Err(e) => error!(
                    component = %self.name,
                    uuid = %self.id,
                    service = %slot.service.name,
                    "failed to register provided service: {}",
                    e
                ),
            }
        }
    }

    fn unregister_provided(&self, machine: &mut Machine<T>, only: Option<DependencyId>) {
        for (index, slot) in machine.provided.iter_mut().enumerate() {
            if only.is_some_and(|dependency| !slot.service.rebind_on.contains(&dependency)) {
                continue;
            }
            let Some(reference) = slot.registered.take() else {
                continue;
            };
            self.provided[index].service_id.store(-1, Ordering::SeqCst);
            if let Err(e) = self.registry.unregister(reference) {
                warn!(
                    component = %self.name,
                    service = %slot.service.name,
                    %reference,
                    "failed to unregister provided service: {}",
                    e
                );
            }
        }
    }
}

/// Borrow of a component in the middle of a dependency update.
struct Transition<'a, T> {
    core: &'a ComponentCore<T>,
    machine: &'a mut Machine<T>,
}

impl<T: Send + 'static> Transition<'_, T> {
    fn swap(&mut self, id: DependencyId, event: &DependencyEvent) {
        let released = self.core.record(self.machine, id, event);
        self.core.invoke_dependency(self.machine, id, event);
        drop(released);
    }
}

impl<T: Send + 'static> Suspendable for Transition<'_, T> {
    fn is_started(&self) -> bool {
        self.core.state() == ComponentState::Started
    }

    fn suspend(&mut self, dependency: DependencyId) {
        self.core
            .set_state(ComponentState::Started, ComponentState::Suspended);
        self.core.unregister_provided(self.machine, Some(dependency));
        // a failing stop() does not block the swap
        let _ = self
            .core
            .invoke_lifecycle(self.machine, LifecycleCallback::Stop);
    }

    fn resume(&mut self, dependency: DependencyId) {
        if self
            .core
            .invoke_lifecycle(self.machine, LifecycleCallback::Start)
            .is_ok()
        {
            self.core.times_resumed.fetch_add(1, Ordering::SeqCst);
            self.core
                .set_state(ComponentState::Suspended, ComponentState::Started);
            self.core.register_provided(self.machine, Some(dependency));
            return;
        }
        self.core.unregister_provided(self.machine, None);
        let _ = self
            .core
            .invoke_lifecycle(self.machine, LifecycleCallback::Deinit);
        self.machine.retry_blocked = true;
        self.core
            .set_state(ComponentState::Suspended, ComponentState::WaitingForRequired);
    }
}

/// Feeds tracker callbacks of one dependency into its component.
struct DependencyBridge<T> {
    core: Weak<ComponentCore<T>>,
    id: DependencyId,
}

impl<T: Send + 'static> DependencyBridge<T> {
    fn dispatch(&self, core: &ComponentCore<T>, event: DependencyEvent) {
        core.submit(Command::Dependency { id: self.id, event });
    }
}

impl<T: Send + 'static> TrackerListener for DependencyBridge<T> {
    fn added(&self, service: &TrackedService) {
        let Some(core) = self.core.upgrade() else {
            return;
        };
        let status = &core.dependencies[self.id.0];
        status.tracked.fetch_add(1, Ordering::SeqCst);
        if status.cardinality == Cardinality::Many {
            let bound = BoundService::retain(&core.registry, service);
            self.dispatch(&core, DependencyEvent::Add(bound));
        }
    }

    fn removed(&self, service: &TrackedService) {
        let Some(core) = self.core.upgrade() else {
            return;
        };
        let status = &core.dependencies[self.id.0];
        let _ = status
            .tracked
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if status.cardinality == Cardinality::Many {
            self.dispatch(&core, DependencyEvent::Remove(service.clone()));
        }
    }

    fn set(&self, highest: Option<TrackedService>) {
        let Some(core) = self.core.upgrade() else {
            return;
        };
        if core.dependencies[self.id.0].cardinality == Cardinality::Single {
            let bound = highest.map(|service| BoundService::retain(&core.registry, &service));
            self.dispatch(&core, DependencyEvent::Set(bound));
        }
    }

    fn modified(&self, service: &TrackedService) {
        if let Some(core) = self.core.upgrade() {
            self.dispatch(&core, DependencyEvent::Update(service.clone()));
        }
    }
}

/// Handle to a component owned by a dependency manager.
pub struct ComponentHandle<T> {
    pub(crate) core: Arc<ComponentCore<T>>,
}

impl<T> Clone for ComponentHandle<T> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

impl<T: Send + 'static> ComponentHandle<T> {
    pub fn id(&self) -> ComponentId {
        self.core.id
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn bundle(&self) -> BundleId {
        self.core.bundle
    }

    pub fn state(&self) -> ComponentState {
        self.core.state()
    }

    pub fn is_active(&self) -> bool {
        self.state() == ComponentState::Started
    }

    /// Enables the component and waits until the resulting transitions ran.
    ///
    /// Enabling twice is an `IllegalState` error and otherwise a no-op.
    pub fn enable(&self) -> MusubiResult<()> {
        self.core.enable()
    }

    pub fn enable_async(&self) -> MusubiResult<EventHandle> {
        self.core.enable_async()
    }

    /// Disables the component for good: provided services are unregistered,
    /// `stop()` and `deinit()` run and the dependency trackers are closed.
    pub fn disable(&self) -> MusubiResult<()> {
        self.core.disable()
    }

    pub fn disable_async(&self) -> MusubiResult<EventHandle> {
        self.core.disable_async()
    }

    pub fn info(&self) -> ComponentInfo {
        self.core.info()
    }

    /// The user implementation; lock it to use it from other threads.
    pub fn implementation(&self) -> Arc<Mutex<T>> {
        self.core.implementation.clone()
    }
}

impl<T> fmt::Debug for ComponentHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentHandle")
            .field("id", &self.core.id)
            .field("name", &self.core.name)
            .field("state", &ComponentState::from_u8(self.core.state.load(Ordering::SeqCst)))
            .finish()
    }
}

/// Type-erased view the dependency manager keeps of its components.
pub(crate) trait ManagedComponent: Send + Sync {
    fn id(&self) -> ComponentId;
    fn name(&self) -> &str;
    fn state(&self) -> ComponentState;
    fn is_enable_requested(&self) -> bool;
    fn is_disable_requested(&self) -> bool;
    fn enable(&self) -> MusubiResult<()>;
    fn enable_async(&self) -> MusubiResult<()>;
    fn disable(&self) -> MusubiResult<()>;
    fn disable_async(&self) -> MusubiResult<()>;
    fn info(&self) -> ComponentInfo;
}

impl<T: Send + 'static> ManagedComponent for ComponentHandle<T> {
    fn id(&self) -> ComponentId {
        self.core.id
    }

    fn name(&self) -> &str {
        &self.core.name
    }

    fn state(&self) -> ComponentState {
        self.core.state()
    }

    fn is_enable_requested(&self) -> bool {
        self.core.is_enable_requested()
    }

    fn is_disable_requested(&self) -> bool {
        self.core.is_disable_requested()
    }

    fn enable(&self) -> MusubiResult<()> {
        self.core.enable()
    }

    fn enable_async(&self) -> MusubiResult<()> {
        self.core.enable_async().map(|_| ())
    }

    fn disable(&self) -> MusubiResult<()> {
        self.core.disable()
    }

    fn disable_async(&self) -> MusubiResult<()> {
        self.core.disable_async().map(|_| ())
    }

    fn info(&self) -> ComponentInfo {
        self.core.info()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::FrameworkConfig, event::EventBus, executor::EventExecutor, properties::SERVICE_RANKING};
    use pretty_assertions::assert_eq;

    trait Store: Send + Sync {
        fn label(&self) -> &'static str;
    }

    struct Named(&'static str);

    impl Store for Named {
        fn label(&self) -> &'static str {
            self.0
        }
    }

    #[derive(Default)]
    struct Recorder {
        log: Vec<String>,
        store: Option<Arc<dyn Store>>,
    }

    fn registry() -> ServiceRegistry {
        let executor = EventExecutor::new(&FrameworkConfig::default()).unwrap();
        ServiceRegistry::new(executor, Arc::new(EventBus::new(64)))
    }

    fn recorder(required: bool, strategy: UpdateStrategy) -> Component<Recorder> {
        let mut component = Component::new(Recorder::default())
            .on_init(|r| {
                r.log.push("init".into());
                Ok(())
            })
            .on_start(|r| {
                r.log.push("start".into());
                Ok(())
            })
            .on_stop(|r| {
                r.log.push("stop".into());
                Ok(())
            })
            .on_deinit(|r| {
                r.log.push("deinit".into());
                Ok(())
            });
        component.add_service_dependency(
            ServiceDependency::new("store")
                .required(required)
                .strategy(strategy)
                .on_set::<dyn Store, _>(|r: &mut Recorder, store| {
                    r.log.push(format!("set {:?}", store.as_ref().map(|s| s.label())));
                    r.store = store;
                    Ok(())
                }),
        );
        component
    }

    fn register(registry: &ServiceRegistry, label: &'static str, rank: i64) -> ServiceReference {
        registry
            .register_service::<dyn Store>(
                "store",
                Arc::new(Named(label)),
                Properties::new().with(SERVICE_RANKING, rank),
            )
            .unwrap()
    }

    fn log(handle: &ComponentHandle<Recorder>) -> Vec<String> {
        handle.implementation().lock().log.clone()
    }

    fn handle(component: Component<Recorder>, registry: &ServiceRegistry) -> ComponentHandle<Recorder> {
        ComponentHandle {
            core: ComponentCore::new(component, registry.clone(), false).unwrap(),
        }
    }

    #[test]
    fn test_component_name_defaults_to_type() {
        let component = Component::new(Recorder::default());
        assert_eq!(component.name, "Recorder");
    }

    #[test]
    fn test_required_dependency_drives_start_and_stop() {
        let registry = registry();
        let handle = handle(recorder(true, UpdateStrategy::Suspend), &registry);
        assert_eq!(handle.state(), ComponentState::Created);

        handle.enable().unwrap();
        assert_eq!(handle.state(), ComponentState::WaitingForRequired);
        assert!(log(&handle).is_empty());

        let store = register(&registry, "a", 0);
        assert_eq!(handle.state(), ComponentState::Started);
        assert_eq!(log(&handle), vec!["set Some(\"a\")", "init", "start"]);

        registry.unregister(store).unwrap();
        assert_eq!(handle.state(), ComponentState::WaitingForRequired);
        assert_eq!(
            log(&handle),
            vec!["set Some(\"a\")", "init", "start", "stop", "deinit", "set None"]
        );
        assert_eq!(handle.info().times_started, 1);
        registry.executor().shutdown().unwrap();
    }

    #[test]
    fn test_suspend_swap_stops_before_rebinding() {
        let registry = registry();
        let handle = handle(recorder(true, UpdateStrategy::Suspend), &registry);
        handle.enable().unwrap();
        register(&registry, "a", 0);
        handle.implementation().lock().log.clear();

        register(&registry, "b", 10);
        assert_eq!(log(&handle), vec!["stop", "set Some(\"b\")", "start"]);
        assert_eq!(handle.state(), ComponentState::Started);
        assert_eq!(handle.info().times_resumed, 1);
        registry.executor().shutdown().unwrap();
    }

    #[test]
    fn test_locking_swap_keeps_component_started() {
        let registry = registry();
        let handle = handle(recorder(true, UpdateStrategy::Locking), &registry);
        handle.enable().unwrap();
        register(&registry, "a", 0);
        handle.implementation().lock().log.clear();

        let b = register(&registry, "b", 10);
        registry.unregister(b).unwrap();
        assert_eq!(log(&handle), vec!["set Some(\"b\")", "set Some(\"a\")"]);
        assert_eq!(handle.info().times_resumed, 0);
        registry.executor().shutdown().unwrap();
    }

    #[test]
    fn test_double_enable_is_illegal_state() {
        let registry = registry();
        let handle = handle(recorder(false, UpdateStrategy::Suspend), &registry);
        handle.enable().unwrap();
        assert_eq!(handle.state(), ComponentState::Started);
        let err = handle.enable().unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::IllegalState);
        assert_eq!(handle.state(), ComponentState::Started);

        handle.disable().unwrap();
        assert_eq!(handle.state(), ComponentState::Destroyed);
        assert_eq!(
            handle.disable().unwrap_err().kind(),
            crate::ErrorKind::IllegalState
        );
        assert!(handle.enable().is_err());
        registry.executor().shutdown().unwrap();
    }

    #[test]
    fn test_failed_start_rolls_back() {
        let registry = registry();
        let mut component = Component::new(Recorder::default())
            .on_init(|r| {
                r.log.push("init".into());
                Ok(())
            })
            .on_start(|_| Err("no disk".into()))
            .on_deinit(|r| {
                r.log.push("deinit".into());
                Ok(())
            });
        component.add_provided_service(ProvidedService::new("provided", Arc::new(Named("p")) as Arc<dyn Store>));
        let handle = handle(component, &registry);
        handle.enable().unwrap();
        assert_eq!(handle.state(), ComponentState::WaitingForRequired);
        assert_eq!(log(&handle), vec!["init", "deinit"]);
        assert!(registry.find_service("provided").is_none());
        registry.executor().shutdown().unwrap();
    }

    #[test]
    fn test_failed_stop_is_reported_by_disable() {
        let registry = registry();
        let component = Component::new(Recorder::default())
            .on_stop(|_| Err("stuck".into()))
            .on_deinit(|r| {
                r.log.push("deinit".into());
                Ok(())
            });
        let handle = handle(component, &registry);
        handle.enable().unwrap();
        let err = handle.disable().unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::ServiceCallbackFailed);
        assert_eq!(handle.state(), ComponentState::Destroyed);
        assert_eq!(log(&handle), vec!["deinit"]);
        registry.executor().shutdown().unwrap();
    }

    #[test]
    fn test_provided_service_rebinds_on_dependency() {
        let registry = registry();
        let mut component = recorder(true, UpdateStrategy::Suspend);
        component.add_provided_service(
            ProvidedService::new("cache", Arc::new(Named("cache")) as Arc<dyn Store>)
                .rebind_on(DependencyId(0)),
        );
        component.add_provided_service(ProvidedService::new(
            "metrics",
            Arc::new(Named("metrics")) as Arc<dyn Store>,
        ));
        let handle = handle(component, &registry);
        handle.enable().unwrap();
        register(&registry, "a", 0);
        let cache = registry.find_service("cache").unwrap();
        let metrics = registry.find_service("metrics").unwrap();

        register(&registry, "b", 5);
        let rebound = registry.find_service("cache").unwrap();
        assert_ne!(rebound, cache);
        assert_eq!(registry.find_service("metrics"), Some(metrics));

        let info = handle.info();
        assert_eq!(info.provided_services[0].service_id, Some(rebound.service_id().0));
        registry.executor().shutdown().unwrap();
    }

    #[test]
    fn test_unknown_rebind_dependency_is_rejected() {
        let registry = registry();
        let mut component = Component::new(Recorder::default());
        component.add_provided_service(
            ProvidedService::new("cache", Arc::new(Named("cache")) as Arc<dyn Store>)
                .rebind_on(DependencyId(3)),
        );
        let err = ComponentCore::new(component, registry.clone(), false).err().unwrap();
        assert_eq!(err.kind(), crate::ErrorKind::IllegalArgument);
        registry.executor().shutdown().unwrap();
    }
}
