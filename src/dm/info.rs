use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{
    component::{ComponentId, ComponentState},
    dependency::{Cardinality, DependencyId},
    strategy::UpdateStrategy,
};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DependencyInfo {
    pub id: DependencyId,
    pub service_name: String,
    pub filter: String,
    pub required: bool,
    pub cardinality: Cardinality,
    pub strategy: UpdateStrategy,
    /// Whether the dependency currently has a binding.
    pub available: bool,
    pub tracked: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProvidedServiceInfo {
    pub name: String,
    pub properties: String,
    /// Set while the service is registered.
    pub service_id: Option<i64>,
}

/// Diagnostic snapshot of one component.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComponentInfo {
    pub id: ComponentId,
    pub name: String,
    pub bundle_id: i64,
    pub state: ComponentState,
    pub active: bool,
    pub times_started: u64,
    pub times_resumed: u64,
    pub last_transition: DateTime<Utc>,
    pub dependencies: Vec<DependencyInfo>,
    pub provided_services: Vec<ProvidedServiceInfo>,
}

impl ComponentInfo {
    /// Required dependencies without a binding.
    pub fn missing_required(&self) -> Vec<&DependencyInfo> {
        self.dependencies
            .iter()
            .filter(|d| d.required && !d.available)
            .collect()
    }
}
