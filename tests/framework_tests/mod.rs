mod component_test;
mod filter_test;
mod registry_test;
mod tracker_test;

use std::sync::Arc;

use musubi::{
    config::FrameworkConfig,
    framework::Framework,
    properties::{Properties, SERVICE_RANKING},
    registry::{ServiceReference, ServiceRegistry},
};

pub trait Greeter: Send + Sync {
    fn name(&self) -> String;
}

pub struct NamedGreeter(pub String);

impl Greeter for NamedGreeter {
    fn name(&self) -> String {
        self.0.clone()
    }
}

pub fn framework() -> Framework {
    Framework::new(FrameworkConfig::default()).expect("framework")
}

pub fn register_greeter(registry: &ServiceRegistry, name: &str, rank: i64) -> ServiceReference {
    registry
        .register_service::<dyn Greeter>(
            "greeter",
            Arc::new(NamedGreeter(name.to_string())),
            Properties::new().with(SERVICE_RANKING, rank),
        )
        .expect("register greeter")
}
