use std::{any::type_name, fmt, sync::Arc};

use serde::Serialize;

use crate::{
    error::{CallbackError, CallbackResult},
    filter::Filter,
    properties::Properties,
    registry::ServiceRegistry,
    tracker::TrackedService,
    MusubiResult,
};

use super::strategy::UpdateStrategy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, strum::Display)]
pub enum Cardinality {
    /// One binding: the highest ranked match, delivered through `set`.
    #[default]
    Single,
    /// Every match, delivered through `add` / `remove`.
    Many,
}

/// Index of a dependency within its component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct DependencyId(pub usize);

impl fmt::Display for DependencyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dep#{}", self.0)
    }
}

pub(crate) type SetCallback<T> =
    Box<dyn FnMut(&mut T, Option<&TrackedService>) -> CallbackResult + Send>;
pub(crate) type ServiceCallback<T> =
    Box<dyn FnMut(&mut T, &TrackedService) -> CallbackResult + Send>;

pub(crate) struct DependencyCallbacks<T> {
    pub(crate) set: Option<SetCallback<T>>,
    pub(crate) add: Option<ServiceCallback<T>>,
    pub(crate) remove: Option<ServiceCallback<T>>,
    pub(crate) update: Option<ServiceCallback<T>>,
}

impl<T> Default for DependencyCallbacks<T> {
    fn default() -> Self {
        Self {
            set: None,
            add: None,
            remove: None,
            update: None,
        }
    }
}

/// A component's need for services registered under one name.
///
/// Defaults: optional, [`Cardinality::Single`], [`UpdateStrategy::Suspend`].
///
/// ```rust
/// use std::sync::Arc;
/// use musubi::dm::{Cardinality, ServiceDependency, UpdateStrategy};
///
/// trait Logger: Send + Sync {
///     fn log(&self, line: &str);
/// }
///
/// #[derive(Default)]
/// struct Worker {
///     logger: Option<Arc<dyn Logger>>,
/// }
///
/// let dependency = ServiceDependency::<Worker>::new("logger")
///     .required(true)
///     .cardinality(Cardinality::Single)
///     .strategy(UpdateStrategy::Locking)
///     .on_set::<dyn Logger, _>(|worker, logger| {
///         worker.logger = logger;
///         Ok(())
///     });
/// ```
pub struct ServiceDependency<T> {
    pub(crate) service_name: String,
    pub(crate) version_range: Option<String>,
    pub(crate) extra_filter: Option<String>,
    pub(crate) required: bool,
    pub(crate) cardinality: Cardinality,
    pub(crate) strategy: UpdateStrategy,
    pub(crate) callbacks: DependencyCallbacks<T>,
}

impl<T: 'static> ServiceDependency<T> {
    pub fn new(service_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            version_range: None,
            extra_filter: None,
            required: false,
            cardinality: Cardinality::default(),
            strategy: UpdateStrategy::default(),
            callbacks: DependencyCallbacks::default(),
        }
    }

    /// Only services whose `service.version` lies in `range`, e.g. `[1.0.0,2.0.0)`.
    pub fn version_range(mut self, range: &str) -> Self {
        self.version_range = Some(range.to_string());
        self
    }

    /// Extra filter expression the services must match.
    pub fn filter(mut self, filter: &str) -> Self {
        self.extra_filter = Some(filter.to_string());
        self
    }

    pub fn required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }

    pub fn cardinality(mut self, cardinality: Cardinality) -> Self {
        self.cardinality = cardinality;
        self
    }

    pub fn strategy(mut self, strategy: UpdateStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Called with the new highest ranked service, `None` when there is none.
    pub fn on_set<S, F>(mut self, mut f: F) -> Self
    where
        S: ?Sized + Send + Sync + 'static,
        F: FnMut(&mut T, Option<Arc<S>>) -> CallbackResult + Send + 'static,
    {
        self.callbacks.set = Some(Box::new(move |component, service| {
            let typed = service.map(typed_service::<S>).transpose()?;
            f(component, typed)
        }));
        self
    }

    pub fn on_add<S, F>(mut self, f: F) -> Self
    where
        S: ?Sized + Send + Sync + 'static,
        F: FnMut(&mut T, Arc<S>, &Properties) -> CallbackResult + Send + 'static,
    {
        self.callbacks.add = Some(typed_callback(f));
        self
    }

    pub fn on_remove<S, F>(mut self, f: F) -> Self
    where
        S: ?Sized + Send + Sync + 'static,
        F: FnMut(&mut T, Arc<S>, &Properties) -> CallbackResult + Send + 'static,
    {
        self.callbacks.remove = Some(typed_callback(f));
        self
    }

    /// Called when the properties of a bound service change.
    pub fn on_update<S, F>(mut self, f: F) -> Self
    where
        S: ?Sized + Send + Sync + 'static,
        F: FnMut(&mut T, Arc<S>, &Properties) -> CallbackResult + Send + 'static,
    {
        self.callbacks.update = Some(typed_callback(f));
        self
    }

    pub(crate) fn build_filter(&self) -> MusubiResult<Filter> {
        ServiceRegistry::create_filter_for(
            &self.service_name,
            self.version_range.as_deref(),
            self.extra_filter.as_deref(),
        )
    }
}

fn typed_service<S: ?Sized + Send + Sync + 'static>(
    service: &TrackedService,
) -> Result<Arc<S>, CallbackError> {
    service.service::<S>().ok_or_else(|| {
        CallbackError::new(format!(
            "{} is not a {}",
            service.reference,
            type_name::<S>()
        ))
    })
}

fn typed_callback<T, S, F>(mut f: F) -> ServiceCallback<T>
where
    T: 'static,
    S: ?Sized + Send + Sync + 'static,
    F: FnMut(&mut T, Arc<S>, &Properties) -> CallbackResult + Send + 'static,
{
    Box::new(move |component, service| {
        let typed = typed_service::<S>(service)?;
        f(component, typed, &service.properties)
    })
}

impl<T> fmt::Debug for ServiceDependency<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceDependency")
            .field("service_name", &self.service_name)
            .field("version_range", &self.version_range)
            .field("filter", &self.extra_filter)
            .field("required", &self.required)
            .field("cardinality", &self.cardinality)
            .field("strategy", &self.strategy)
            .finish()
    }
}
