use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use crate::{filter::Filter, properties::Properties};

use super::types::{ServiceId, ServiceRanking, ServiceReference};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum ServiceEventKind {
    Registered,
    /// Properties replaced and the new snapshot still matches.
    Modified,
    /// Properties replaced and the new snapshot no longer matches.
    ModifiedEndMatch,
    Unregistering,
}

/// Notification delivered to service listeners on the event loop thread.
#[derive(Debug, Clone)]
pub struct ServiceEvent {
    /// Causal sequence number from the framework event bus.
    pub seq: u64,
    pub kind: ServiceEventKind,
    pub reference: ServiceReference,
    pub name: String,
    pub properties: Properties,
    /// Snapshot before the change, set for modifications.
    pub previous: Option<Properties>,
    pub ranking: ServiceRanking,
}

impl ServiceEvent {
    pub fn service_id(&self) -> ServiceId {
        self.reference.service_id
    }
}

impl fmt::Display for ServiceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({} {})", self.kind, self.name, self.reference)
    }
}

#[mockall::automock]
pub trait ServiceListener: Send + Sync {
    fn service_changed(&self, event: &ServiceEvent);
}

/// Adapts a closure to [`ServiceListener`].
pub struct FnServiceListener<F>(pub F);

impl<F> ServiceListener for FnServiceListener<F>
where
    F: Fn(&ServiceEvent) + Send + Sync,
{
    fn service_changed(&self, event: &ServiceEvent) {
        (self.0)(event)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener#{}", self.0)
    }
}

pub(crate) struct ListenerEntry {
    pub(crate) id: ListenerId,
    pub(crate) filter: Filter,
    pub(crate) listener: Arc<dyn ServiceListener>,
    active: AtomicBool,
}

impl ListenerEntry {
    pub(crate) fn new(id: ListenerId, filter: Filter, listener: Arc<dyn ServiceListener>) -> Self {
        Self {
            id,
            filter,
            listener,
            active: AtomicBool::new(true),
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub(crate) fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    /// The event kind this listener observes for a change of properties, if any.
    pub(crate) fn modification_kind(
        &self,
        previous: &Properties,
        current: &Properties,
    ) -> Option<ServiceEventKind> {
        match (self.filter.matches(previous), self.filter.matches(current)) {
            (_, true) => Some(ServiceEventKind::Modified),
            (true, false) => Some(ServiceEventKind::ModifiedEndMatch),
            (false, false) => None,
        }
    }
}
