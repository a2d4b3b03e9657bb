use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use tracing::{info, warn};

use crate::{
    config::FrameworkConfig,
    dm::{Component, DependencyManager},
    event::EventBus,
    executor::{EventExecutor, ScheduledEventId, ScheduledEventOptions},
    filter::Filter,
    properties::Properties,
    registry::{BundleId, ServiceReference, ServiceRegistrationOptions, ServiceRegistry},
    tracker::ServiceTrackerBuilder,
    Error, MusubiResult,
};

/// One framework instance: event loop, registry and dependency manager.
///
/// Nothing is process-global; two frameworks in one process are independent.
pub struct Framework {
    config: FrameworkConfig,
    executor: EventExecutor,
    events: Arc<EventBus>,
    registry: ServiceRegistry,
    dependency_manager: DependencyManager,
    stopped: AtomicBool,
}

impl Framework {
    pub fn new(config: FrameworkConfig) -> MusubiResult<Self> {
        let executor = EventExecutor::new(&config)?;
        let events = Arc::new(EventBus::new(config.event_buffer_size));
        let registry = ServiceRegistry::new(executor.clone(), events.clone());
        let dependency_manager = DependencyManager::new(registry.clone(), &config);
        info!(registry = %registry.id(), "framework created");
        Ok(Self {
            config,
            executor,
            events,
            registry,
            dependency_manager,
            stopped: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &FrameworkConfig {
        &self.config
    }

    pub fn executor(&self) -> &EventExecutor {
        &self.executor
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    pub fn dependency_manager(&self) -> &DependencyManager {
        &self.dependency_manager
    }

    pub fn bundle_context(&self, bundle: BundleId) -> BundleContext {
        BundleContext {
            bundle,
            registry: self.registry.clone(),
            dependency_manager: self.dependency_manager.clone(),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Starts the dependency manager, enabling every added component.
    pub fn start(&self) -> MusubiResult<()> {
        if self.is_stopped() {
            return Err(Error::FrameworkShutdown);
        }
        self.dependency_manager.start()
    }

    /// Disables all components newest first, unregisters what is left in
    /// the registry and shuts the event loop down after it drained.
    ///
    /// Teardown runs to the end; the first failure is returned.
    pub fn stop(&self) -> MusubiResult<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(registry = %self.registry.id(), "framework stopping");
        let mut first_error = self.dependency_manager.stop().err();

        let remaining = self.registry.find_services(&Filter::match_all());
        for reference in remaining {
            if let Err(e) = self.registry.unregister(reference) {
                warn!(%reference, "failed to unregister service at shutdown: {}", e);
            }
        }

        if let Err(e) = self.executor.shutdown() {
            first_error.get_or_insert(e);
        }
        info!(registry = %self.registry.id(), "framework stopped");
        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for Framework {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("framework shutdown on drop failed: {}", e);
        }
    }
}

impl std::fmt::Debug for Framework {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Framework")
            .field("registry", &self.registry.id())
            .field("services", &self.registry.service_count())
            .field("dependency_manager", &self.dependency_manager)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// A bundle's view on the framework: everything it registers or schedules
/// is owned by its bundle id.
#[derive(Clone, Debug)]
pub struct BundleContext {
    bundle: BundleId,
    registry: ServiceRegistry,
    dependency_manager: DependencyManager,
}

impl BundleContext {
    pub fn bundle_id(&self) -> BundleId {
        self.bundle
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    pub fn dependency_manager(&self) -> &DependencyManager {
        &self.dependency_manager
    }

    pub fn register_service<S: ?Sized + Send + Sync + 'static>(
        &self,
        name: &str,
        service: Arc<S>,
        properties: Properties,
    ) -> MusubiResult<ServiceReference> {
        self.register(ServiceRegistrationOptions::new(name, service).properties(properties))
    }

    pub fn register(&self, options: ServiceRegistrationOptions) -> MusubiResult<ServiceReference> {
        self.registry.register(options.owner(self.bundle))
    }

    pub fn track_services(&self, filter: &str) -> MusubiResult<ServiceTrackerBuilder> {
        let filter = Filter::parse(filter)?;
        Ok(crate::tracker::ServiceTracker::builder(&self.registry, filter))
    }

    pub fn schedule_event(&self, options: ScheduledEventOptions) -> MusubiResult<ScheduledEventId> {
        self.registry.executor().schedule(options.bundle(self.bundle))
    }

    pub fn create_component<T: Send + 'static>(&self, implementation: T) -> Component<T> {
        self.dependency_manager
            .create_component_for_bundle(self.bundle, implementation)
    }

    /// Releases what the bundle left behind: scheduled events and services.
    /// Returns the number of unregistered services.
    pub fn stop(&self) -> MusubiResult<usize> {
        let removed = self
            .registry
            .executor()
            .remove_scheduled_for_bundle(self.bundle)?;
        let unregistered = self.registry.unregister_services_for_bundle(self.bundle)?;
        info!(bundle = %self.bundle, removed, unregistered, "bundle released");
        Ok(unregistered)
    }
}
