use std::sync::Arc;

use musubi::{
    dm::{Cardinality, ComponentState, ProvidedService, ServiceDependency, UpdateStrategy},
    event::EventKind,
    filter::Filter,
    properties::Properties,
    registry::{ServiceReference, ServiceRegistrationOptions, ServiceRegistry},
    CallbackResult,
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use proptest::prelude::*;

use super::{framework, register_greeter, Greeter, NamedGreeter};

#[derive(Default)]
struct Recorder {
    log: Vec<String>,
    greeter: Option<Arc<dyn Greeter>>,
    greeters: Vec<String>,
}

impl Recorder {
    fn note(&mut self, entry: &str) -> CallbackResult {
        self.log.push(entry.to_string());
        Ok(())
    }
}

fn lifecycle(component: musubi::dm::Component<Recorder>) -> musubi::dm::Component<Recorder> {
    component
        .on_init(|r| r.note("init"))
        .on_start(|r| r.note("start"))
        .on_stop(|r| r.note("stop"))
        .on_deinit(|r| r.note("deinit"))
}

fn single(required: bool, strategy: UpdateStrategy) -> ServiceDependency<Recorder> {
    ServiceDependency::new("greeter")
        .required(required)
        .strategy(strategy)
        .on_set::<dyn Greeter, _>(|r: &mut Recorder, greeter| {
            let entry = format!("set {}", greeter.as_ref().map_or("-".to_string(), |g| g.name()));
            r.greeter = greeter;
            r.note(&entry)
        })
}

fn name_of(registry: &ServiceRegistry, reference: ServiceReference) -> Option<String> {
    registry.use_service::<dyn Greeter, _, _>(reference, |g| g.name())
}

#[test]
fn test_required_single_dependency_lifecycle() {
    let framework = framework();
    let dm = framework.dependency_manager();
    let mut component = lifecycle(dm.create_component(Recorder::default()));
    component.add_service_dependency(single(true, UpdateStrategy::Suspend));
    let handle = dm.add(component).unwrap();
    framework.start().unwrap();

    assert_eq!(handle.state(), ComponentState::WaitingForRequired);
    assert!(handle.implementation().lock().log.is_empty());

    let reference = register_greeter(framework.registry(), "s1", 0);
    assert_eq!(handle.state(), ComponentState::Started);
    assert_eq!(handle.implementation().lock().log, vec!["set s1", "init", "start"]);

    framework.registry().unregister(reference).unwrap();
    assert_eq!(handle.state(), ComponentState::WaitingForRequired);
    assert_eq!(
        handle.implementation().lock().log,
        vec!["set s1", "init", "start", "stop", "deinit", "set -"]
    );
}

#[test]
fn test_optional_many_locking_dependency_never_restarts() {
    let framework = framework();
    let dm = framework.dependency_manager();
    let mut component = lifecycle(dm.create_component(Recorder::default()));
    component.add_service_dependency(
        ServiceDependency::new("greeter")
            .cardinality(Cardinality::Many)
            .strategy(UpdateStrategy::Locking)
            .on_add::<dyn Greeter, _>(|r: &mut Recorder, greeter, _| {
                r.greeters.push(greeter.name());
                r.note("add")
            })
            .on_remove::<dyn Greeter, _>(|r, greeter, _| {
                r.greeters.retain(|g| *g != greeter.name());
                r.note("remove")
            }),
    );
    let handle = dm.add(component).unwrap();
    framework.start().unwrap();
    assert_eq!(handle.state(), ComponentState::Started);

    let registry = framework.registry();
    let one = register_greeter(registry, "one", 0);
    assert_eq!(handle.state(), ComponentState::Started);
    register_greeter(registry, "two", 0);
    assert_eq!(handle.state(), ComponentState::Started);
    registry.unregister(one).unwrap();
    assert_eq!(handle.state(), ComponentState::Started);

    let implementation = handle.implementation();
    let recorder = implementation.lock();
    assert_eq!(recorder.log, vec!["init", "start", "add", "add", "remove"]);
    assert_eq!(recorder.greeters, vec!["two"]);
    let info = handle.info();
    assert_eq!(info.times_started, 1);
    assert_eq!(info.times_resumed, 0);
}

#[test]
fn test_suspend_swap_stops_before_rebind_and_starts_after() {
    let framework = framework();
    let dm = framework.dependency_manager();
    let mut component = lifecycle(dm.create_component(Recorder::default()));
    component.add_service_dependency(single(true, UpdateStrategy::Suspend));
    let handle = dm.add(component).unwrap();
    framework.start().unwrap();

    let registry = framework.registry();
    register_greeter(registry, "low", 1);
    let high = register_greeter(registry, "high", 5);
    registry.unregister(high).unwrap();

    assert_eq!(
        handle.implementation().lock().log,
        vec![
            "set low", "init", "start",
            "stop", "set high", "start",
            "stop", "set low", "start",
        ]
    );
    assert_eq!(handle.state(), ComponentState::Started);
    assert_eq!(handle.info().times_resumed, 2);
}

#[test]
fn test_update_callback_sees_new_properties() {
    let framework = framework();
    let dm = framework.dependency_manager();
    let mut component = dm.create_component(Recorder::default());
    component.add_service_dependency(
        single(false, UpdateStrategy::Locking).on_update::<dyn Greeter, _>(|r, _, properties| {
            let lang = properties.get_as_string("lang").unwrap_or_default();
            r.note(&format!("update {}", lang))
        }),
    );
    let handle = dm.add(component).unwrap();
    framework.start().unwrap();

    let registry = framework.registry();
    let reference = register_greeter(registry, "g", 0);
    registry
        .update_properties(reference, Properties::new().with("lang", "ja"))
        .unwrap();
    assert_eq!(handle.implementation().lock().log, vec!["set g", "update ja"]);
}

#[test]
fn test_provider_and_consumer_components_chain() {
    let framework = framework();
    let dm = framework.dependency_manager();

    let mut consumer = lifecycle(dm.create_component(Recorder::default()).name("consumer"));
    consumer.add_service_dependency(single(true, UpdateStrategy::Suspend));
    let consumer = dm.add(consumer).unwrap();

    let mut provider = dm.create_component(Recorder::default()).name("provider");
    let greeter: Arc<dyn Greeter> = Arc::new(NamedGreeter("provided".into()));
    provider.add_provided_service(ProvidedService::new("greeter", greeter));
    let provider = dm.add(provider).unwrap();

    let mut events = framework.events().subscribe();
    framework.start().unwrap();
    assert_eq!(provider.state(), ComponentState::Started);
    assert_eq!(consumer.state(), ComponentState::Started);
    assert!(dm.all_components_active());
    assert_eq!(
        events.try_recv().unwrap().kind,
        EventKind::ComponentEnable(consumer.id())
    );

    let provided = consumer.info();
    assert!(provided.missing_required().is_empty());
    assert_eq!(
        framework
            .registry()
            .find_services(&Filter::for_service("greeter"))
            .len(),
        1
    );

    framework.stop().unwrap();
    assert_eq!(provider.state(), ComponentState::Destroyed);
    assert_eq!(consumer.state(), ComponentState::Destroyed);
    assert_eq!(
        consumer.implementation().lock().log,
        vec!["set provided", "init", "start", "stop", "deinit", "set -"]
    );
}

#[test]
fn test_failed_init_keeps_component_waiting_until_dependency_changes() {
    let framework = framework();
    let dm = framework.dependency_manager();
    let mut attempts = 0;
    let mut component = dm
        .create_component(Recorder::default())
        .on_init(move |r| {
            attempts += 1;
            if attempts == 1 {
                return Err("first init fails".into());
            }
            r.note("init")
        })
        .on_start(|r| r.note("start"));
    component.add_service_dependency(single(true, UpdateStrategy::Suspend));
    let handle = dm.add(component).unwrap();
    framework.start().unwrap();

    let registry = framework.registry();
    register_greeter(registry, "a", 0);
    assert_eq!(handle.state(), ComponentState::WaitingForRequired);
    assert!(framework.registry().find_service("greeter").is_some());

    register_greeter(registry, "b", 1);
    assert_eq!(handle.state(), ComponentState::Started);
    assert_eq!(handle.implementation().lock().log, vec!["set a", "set b", "init", "start"]);
}

#[test]
fn test_dependency_unregistered_by_start_is_destroyed_after_unbind() {
    let framework = framework();
    let dm = framework.dependency_manager();
    let log = Arc::new(Mutex::new(Vec::<String>::new()));

    let registry = framework.registry().clone();
    let (start_log, stop_log, deinit_log, set_log) = (log.clone(), log.clone(), log.clone(), log.clone());
    let mut component = dm
        .create_component(Recorder::default())
        .on_start(move |_| {
            start_log.lock().push("start".into());
            if let Some(reference) = registry.find_service("greeter") {
                registry.unregister(reference)?;
                start_log.lock().push("unregister returned".into());
            }
            Ok(())
        })
        .on_stop(move |_| {
            stop_log.lock().push("stop".into());
            Ok(())
        })
        .on_deinit(move |_| {
            deinit_log.lock().push("deinit".into());
            Ok(())
        });
    component.add_service_dependency(
        ServiceDependency::new("greeter")
            .required(true)
            .on_set::<dyn Greeter, _>(move |r: &mut Recorder, greeter| {
                let name = greeter.as_ref().map_or("-".to_string(), |g| g.name());
                set_log.lock().push(format!("set {}", name));
                r.greeter = greeter;
                Ok(())
            }),
    );
    let handle = dm.add(component).unwrap();
    framework.start().unwrap();

    let destroyed_log = log.clone();
    let greeter: Arc<dyn Greeter> = Arc::new(NamedGreeter("a".into()));
    let reference = framework
        .registry()
        .register(
            ServiceRegistrationOptions::new("greeter", greeter)
                .on_unregistered(move |_| destroyed_log.lock().push("destroyed".into())),
        )
        .unwrap();

    assert_eq!(
        *log.lock(),
        vec!["set a", "start", "unregister returned", "stop", "deinit", "set -", "destroyed"]
    );
    assert_eq!(handle.state(), ComponentState::WaitingForRequired);
    assert!(handle.implementation().lock().greeter.is_none());
    assert_eq!(framework.registry().registration_state(reference), None);
}

#[test]
fn test_double_enable_is_rejected_and_harmless() {
    let framework = framework();
    let dm = framework.dependency_manager();
    let handle = dm
        .add(lifecycle(dm.create_component(Recorder::default())))
        .unwrap();
    framework.start().unwrap();
    assert_eq!(handle.state(), ComponentState::Started);

    let err = handle.enable().unwrap_err();
    assert_eq!(err.kind(), musubi::ErrorKind::IllegalState);
    assert_eq!(handle.state(), ComponentState::Started);
    assert_eq!(handle.implementation().lock().log, vec!["init", "start"]);
}

#[derive(Debug, Clone)]
enum Op {
    Register(i64),
    Unregister(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (-2i64..3).prop_map(Op::Register),
        (0usize..8).prop_map(Op::Unregister),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_single_binding_is_never_stale(
        ops in prop::collection::vec(op(), 1..16),
        locking in any::<bool>(),
    ) {
        let framework = framework();
        let dm = framework.dependency_manager();
        let strategy = if locking { UpdateStrategy::Locking } else { UpdateStrategy::Suspend };
        let mut component = dm.create_component(Recorder::default());
        component.add_service_dependency(single(true, strategy));
        let handle = dm.add(component).unwrap();
        framework.start().unwrap();

        let registry = framework.registry();
        let mut live: Vec<ServiceReference> = Vec::new();
        for (step, op) in ops.into_iter().enumerate() {
            match op {
                Op::Register(rank) => live.push(register_greeter(registry, &format!("g{}", step), rank)),
                Op::Unregister(index) if !live.is_empty() => {
                    let reference = live.remove(index % live.len());
                    registry.unregister(reference).unwrap();
                }
                Op::Unregister(_) => {}
            }

            let bound = handle.implementation().lock().greeter.as_ref().map(|g| g.name());
            let expected = registry
                .find_services(&Filter::for_service("greeter"))
                .first()
                .and_then(|r| name_of(registry, *r));
            prop_assert_eq!(bound, expected);
            let started = handle.state() == ComponentState::Started;
            prop_assert_eq!(started, !live.is_empty());
        }
    }
}
