//! Dependency manager: owns components and drives their lifecycle from the
//! services their dependencies track.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use musubi::{config::FrameworkConfig, dm::ServiceDependency, framework::Framework};
//!
//! trait Clock: Send + Sync {
//!     fn now(&self) -> u64;
//! }
//!
//! #[derive(Default)]
//! struct Scheduler {
//!     clock: Option<Arc<dyn Clock>>,
//! }
//!
//! # fn main() -> musubi::MusubiResult<()> {
//! let framework = Framework::new(FrameworkConfig::default())?;
//! let dm = framework.dependency_manager();
//!
//! let mut component = dm.create_component(Scheduler::default());
//! component.add_service_dependency(
//!     ServiceDependency::new("clock")
//!         .required(true)
//!         .on_set::<dyn Clock, _>(|scheduler: &mut Scheduler, clock| {
//!             scheduler.clock = clock;
//!             Ok(())
//!         }),
//! );
//! let handle = dm.add(component)?;
//! framework.start()?;
//! assert!(!handle.is_active()); // waits for a clock
//! # Ok(())
//! # }
//! ```

mod component;
mod dependency;
mod info;
mod strategy;

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::{
    config::FrameworkConfig,
    registry::{BundleId, ServiceRegistry},
    Error, MusubiResult,
};

use component::{ComponentCore, ManagedComponent};

pub use component::{Component, ComponentHandle, ComponentId, ComponentState, ProvidedService};
pub use dependency::{Cardinality, DependencyId, ServiceDependency};
pub use info::{ComponentInfo, DependencyInfo, ProvidedServiceInfo};
pub use strategy::UpdateStrategy;

struct ManagerInner {
    registry: ServiceRegistry,
    log_transitions: bool,
    components: DashMap<ComponentId, Arc<dyn ManagedComponent>>,
    /// Creation order; components are removed in reverse.
    order: Mutex<Vec<ComponentId>>,
    started: AtomicBool,
}

#[derive(Clone)]
pub struct DependencyManager {
    inner: Arc<ManagerInner>,
}

impl DependencyManager {
    pub fn new(registry: ServiceRegistry, config: &FrameworkConfig) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                registry,
                log_transitions: config.log_component_transitions,
                components: DashMap::new(),
                order: Mutex::new(Vec::new()),
                started: AtomicBool::new(false),
            }),
        }
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.inner.registry
    }

    pub fn create_component<T: Send + 'static>(&self, implementation: T) -> Component<T> {
        Component::new(implementation)
    }

    pub fn create_component_for_bundle<T: Send + 'static>(
        &self,
        bundle: BundleId,
        implementation: T,
    ) -> Component<T> {
        Component::new(implementation).bundle(bundle)
    }

    fn insert<T: Send + 'static>(&self, component: Component<T>) -> MusubiResult<ComponentHandle<T>> {
        let core = ComponentCore::new(
            component,
            self.inner.registry.clone(),
            self.inner.log_transitions,
        )?;
        let handle = ComponentHandle { core };
        let id = handle.id();
        self.inner
            .components
            .insert(id, Arc::new(handle.clone()) as Arc<dyn ManagedComponent>);
        self.inner.order.lock().push(id);
        debug!(component = %handle.name(), uuid = %id, "component added");
        Ok(handle)
    }

    /// Adds a component; it is enabled right away once the manager is started.
    #[tracing::instrument(skip(self, component), level = "debug")]
    pub fn add<T: Send + 'static>(&self, component: Component<T>) -> MusubiResult<ComponentHandle<T>> {
        let handle = self.insert(component)?;
        if self.is_started() {
            handle.enable()?;
        }
        Ok(handle)
    }

    pub fn add_async<T: Send + 'static>(
        &self,
        component: Component<T>,
    ) -> MusubiResult<ComponentHandle<T>> {
        let handle = self.insert(component)?;
        if self.is_started() {
            handle.enable_async()?;
        }
        Ok(handle)
    }

    fn take(&self, id: ComponentId) -> MusubiResult<Arc<dyn ManagedComponent>> {
        let (_, component) = self
            .inner
            .components
            .remove(&id)
            .ok_or_else(|| Error::illegal_argument(format!("unknown component {}", id)))?;
        self.inner.order.lock().retain(|c| *c != id);
        Ok(component)
    }

    /// Removes and disables a component, waiting for its teardown.
    #[tracing::instrument(skip(self), level = "debug")]
    pub fn remove(&self, id: ComponentId) -> MusubiResult<()> {
        let component = self.take(id)?;
        if component.is_disable_requested() {
            return Ok(());
        }
        component.disable()
    }

    pub fn remove_async(&self, id: ComponentId) -> MusubiResult<()> {
        let component = self.take(id)?;
        if component.is_disable_requested() {
            return Ok(());
        }
        component.disable_async()
    }

    /// Removes every component, newest first. Teardown continues past
    /// failures; the first one is returned.
    pub fn remove_all(&self) -> MusubiResult<()> {
        let ids: Vec<ComponentId> = self.inner.order.lock().iter().rev().copied().collect();
        let mut first_error = None;
        for id in ids {
            if let Err(e) = self.remove(id) {
                warn!(uuid = %id, "failed to remove component: {}", e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Enables every component that was added but never enabled.
    #[tracing::instrument(skip(self), level = "debug")]
    pub fn start(&self) -> MusubiResult<()> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(components = self.component_count(), "starting dependency manager");
        let mut first_error = None;
        for component in self.components() {
            if component.is_enable_requested() || component.is_disable_requested() {
                continue;
            }
            if let Err(e) = component.enable() {
                warn!(component = %component.name(), "failed to enable component: {}", e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    #[tracing::instrument(skip(self), level = "debug")]
    pub fn stop(&self) -> MusubiResult<()> {
        self.inner.started.store(false, Ordering::SeqCst);
        info!(components = self.component_count(), "stopping dependency manager");
        self.remove_all()
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    pub fn component_count(&self) -> usize {
        self.inner.components.len()
    }

    fn components(&self) -> Vec<Arc<dyn ManagedComponent>> {
        self.inner
            .order
            .lock()
            .iter()
            .filter_map(|id| self.inner.components.get(id).map(|c| c.value().clone()))
            .collect()
    }

    /// Snapshots of all components in creation order.
    pub fn infos(&self) -> Vec<ComponentInfo> {
        self.components().iter().map(|c| c.info()).collect()
    }

    pub fn info(&self, id: ComponentId) -> Option<ComponentInfo> {
        self.inner.components.get(&id).map(|c| c.info())
    }

    pub fn state(&self, id: ComponentId) -> Option<ComponentState> {
        self.inner.components.get(&id).map(|c| c.state())
    }

    pub fn all_components_active(&self) -> bool {
        self.components()
            .iter()
            .all(|c| c.state() == ComponentState::Started)
    }

    /// Waits until every queued event, component transitions included, ran.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        self.inner.registry.executor().wait_for_events(timeout)
    }
}

impl std::fmt::Debug for DependencyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyManager")
            .field("components", &self.component_count())
            .field("started", &self.is_started())
            .finish()
    }
}
