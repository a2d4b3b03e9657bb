use serde::Serialize;

use super::dependency::DependencyId;

/// How a started component observes a change of one of its dependencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, strum::Display)]
pub enum UpdateStrategy {
    /// Stop the component, swap the binding, start it again.
    #[default]
    Suspend,
    /// Swap the binding while holding the component lock; no stop/start.
    Locking,
}

/// What a strategy needs from the component it updates.
pub(crate) trait Suspendable {
    fn is_started(&self) -> bool;
    /// Unregisters services built on `dependency`, then stops the component.
    fn suspend(&mut self, dependency: DependencyId);
    /// Starts the component again and re-registers what `suspend` took down.
    fn resume(&mut self, dependency: DependencyId);
}

impl UpdateStrategy {
    /// Performs `swap` on `component` the way this strategy prescribes.
    pub(crate) fn apply<C, F>(self, component: &mut C, dependency: DependencyId, swap: F)
    where
        C: Suspendable + ?Sized,
        F: FnOnce(&mut C),
    {
        match self {
            UpdateStrategy::Suspend if component.is_started() => {
                component.suspend(dependency);
                swap(component);
                component.resume(dependency);
            }
            UpdateStrategy::Suspend | UpdateStrategy::Locking => swap(component),
        }
    }
}
