use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Barrier,
};
use std::time::Duration;

use musubi::{
    event::EventKind,
    properties::Properties,
    registry::{RegistrationState, ServiceRegistrationOptions},
    ErrorKind,
};

use super::{framework, register_greeter, Greeter, NamedGreeter};

#[test]
fn test_concurrent_get_and_unregister_destroys_once() {
    for _ in 0..20 {
        let framework = framework();
        let registry = framework.registry().clone();
        let destroyed = Arc::new(AtomicUsize::new(0));
        let counter = destroyed.clone();
        let reference = registry
            .register(
                ServiceRegistrationOptions::new::<dyn Greeter>(
                    "greeter",
                    Arc::new(NamedGreeter("shared".into())),
                )
                .on_unregistered(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        let barrier = Arc::new(Barrier::new(5));
        let users: Vec<_> = (0..4)
            .map(|_| {
                let registry = registry.clone();
                let barrier = barrier.clone();
                let destroyed = destroyed.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..50 {
                        if let Some(greeter) = registry.get_service::<dyn Greeter>(reference) {
                            assert_eq!(greeter.name(), "shared");
                            // destruction waits for this use
                            assert_eq!(destroyed.load(Ordering::SeqCst), 0);
                            registry.unget_service(reference);
                        }
                    }
                })
            })
            .collect();
        barrier.wait();
        registry.unregister(reference).unwrap();
        for user in users {
            user.join().unwrap();
        }

        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
        assert!(registry.get_service::<dyn Greeter>(reference).is_none());
    }
}

#[test]
fn test_update_properties_after_unregister_is_illegal_state() {
    let framework = framework();
    let registry = framework.registry();
    let reference = register_greeter(registry, "a", 0);
    registry
        .update_properties(reference, Properties::new().with("lang", "en"))
        .unwrap();
    assert_eq!(
        registry
            .get_properties(reference)
            .unwrap()
            .get_as_string("lang")
            .as_deref(),
        Some("en")
    );

    registry.unregister(reference).unwrap();
    let err = registry
        .update_properties(reference, Properties::new())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IllegalState);
}

#[test]
fn test_async_mutations_apply_in_submission_order() {
    let framework = framework();
    let registry = framework.registry();
    let mut events = framework.events().subscribe();

    let reference = registry
        .register_async(ServiceRegistrationOptions::new::<dyn Greeter>(
            "greeter",
            Arc::new(NamedGreeter("a".into())),
        ))
        .unwrap();
    registry
        .update_properties_async(reference, Properties::new().with("v", 2))
        .unwrap();
    let handle = registry.unregister_async(reference).unwrap();
    assert!(handle.wait(Some(Duration::from_secs(5))));

    let id = reference.service_id();
    let kinds: Vec<EventKind> = (0..3).map(|_| events.try_recv().unwrap().kind).collect();
    assert_eq!(
        kinds,
        vec![
            EventKind::Registered(id),
            EventKind::Modified(id),
            EventKind::Unregistering(id)
        ]
    );
    assert_eq!(registry.registration_state(reference), None);
}

#[test]
fn test_deferred_destruction_keeps_object_until_unget() {
    let framework = framework();
    let registry = framework.registry();
    let reference = register_greeter(registry, "held", 0);
    let held = registry.get_service::<dyn Greeter>(reference).unwrap();

    registry.unregister(reference).unwrap();
    assert_eq!(
        registry.registration_state(reference),
        Some(RegistrationState::Unregistering)
    );
    assert!(registry.get_service::<dyn Greeter>(reference).is_none());
    assert!(registry.find_service("greeter").is_none());
    assert_eq!(held.name(), "held");

    registry.unget_service(reference);
    assert_eq!(registry.registration_state(reference), None);
}

#[test]
fn test_operations_after_stop_fail_with_shutdown() {
    let framework = framework();
    framework.stop().unwrap();
    let err = framework
        .registry()
        .register_service::<dyn Greeter>(
            "greeter",
            Arc::new(NamedGreeter("late".into())),
            Properties::new(),
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FrameworkShutdown);
}
