use std::{any::Any, cmp::Ordering, fmt, sync::Arc};

use uuid::Uuid;

use crate::properties::{Properties, PropertyValue, SERVICE_RANKING};

/// Registry assigned service id; never reused within a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceId(pub i64);

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of the bundle owning a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BundleId(pub i64);

impl BundleId {
    /// The framework itself.
    pub const FRAMEWORK: BundleId = BundleId(0);
}

impl fmt::Display for BundleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Copyable handle to a registration. Does not keep the service alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceReference {
    pub(crate) service_id: ServiceId,
    pub(crate) registry: Uuid,
}

impl ServiceReference {
    pub fn service_id(&self) -> ServiceId {
        self.service_id
    }

    /// Identity of the registry instance that issued this reference.
    pub fn registry_id(&self) -> Uuid {
        self.registry
    }
}

impl fmt::Display for ServiceReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "service#{}", self.service_id)
    }
}

/// Type-erased service object.
///
/// Wraps an `Arc<S>` for any `S`, including trait objects, so consumers can
/// recover the exact shared handle that was registered.
#[derive(Clone)]
pub struct ServiceObject(Arc<dyn Any + Send + Sync>);

impl ServiceObject {
    pub fn new<S: ?Sized + Send + Sync + 'static>(service: Arc<S>) -> Self {
        Self(Arc::new(service))
    }

    /// The registered `Arc<S>`, if `S` is the registered type.
    pub fn downcast<S: ?Sized + Send + Sync + 'static>(&self) -> Option<Arc<S>> {
        self.0.downcast_ref::<Arc<S>>().cloned()
    }

    pub fn is<S: ?Sized + Send + Sync + 'static>(&self) -> bool {
        self.0.is::<Arc<S>>()
    }
}

impl fmt::Debug for ServiceObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ServiceObject(..)")
    }
}

/// Ordering key among matching services.
///
/// Sorts preferred first: higher rank before lower, and on equal rank the
/// lower (older) service id first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceRanking {
    pub rank: i64,
    pub service_id: ServiceId,
}

impl ServiceRanking {
    pub fn new(rank: i64, service_id: ServiceId) -> Self {
        Self { rank, service_id }
    }

    /// Rank from the `service.ranking` property; `0` when absent or not numeric.
    pub fn from_properties(service_id: ServiceId, properties: &Properties) -> Self {
        let rank = match properties.get(SERVICE_RANKING) {
            Some(PropertyValue::Long(rank)) => *rank,
            Some(PropertyValue::Double(rank)) if rank.is_finite() => *rank as i64,
            Some(PropertyValue::String(rank)) => rank.trim().parse().unwrap_or(0),
            _ => 0,
        };
        Self::new(rank, service_id)
    }

    /// Whether `self` is preferred over `other`.
    pub fn outranks(&self, other: &ServiceRanking) -> bool {
        self < other
    }
}

impl Ord for ServiceRanking {
    fn cmp(&self, other: &Self) -> Ordering {
        if self.service_id == other.service_id {
            return Ordering::Equal;
        }
        other
            .rank
            .cmp(&self.rank)
            .then(self.service_id.cmp(&other.service_id))
    }
}

impl PartialOrd for ServiceRanking {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
