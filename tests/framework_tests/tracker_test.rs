use std::sync::{mpsc, Arc};
use std::time::Duration;

use musubi::{filter::Filter, registry::ServiceId, tracker::ServiceTracker};
use proptest::prelude::*;

use super::{framework, register_greeter, Greeter};

#[test]
fn test_highest_follows_rank_then_unregister() {
    let framework = framework();
    let registry = framework.registry();
    let tracker = ServiceTracker::for_service(registry, "greeter").unwrap();

    let s1 = register_greeter(registry, "s1", 5);
    let s2 = register_greeter(registry, "s2", 10);
    assert_eq!(tracker.highest(), Some(s2));
    assert_eq!(tracker.all(), vec![s2, s1]);

    registry.unregister(s2).unwrap();
    assert_eq!(tracker.highest(), Some(s1));
    assert_eq!(tracker.tracked_count(), 1);
}

#[test]
fn test_equal_rank_prefers_older_service() {
    let framework = framework();
    let registry = framework.registry();
    let tracker = ServiceTracker::for_service(registry, "greeter").unwrap();

    let s1 = register_greeter(registry, "s1", 0);
    let s2 = register_greeter(registry, "s2", 0);
    assert!(s1.service_id() < s2.service_id());
    assert_eq!(tracker.highest(), Some(s1));
    assert_eq!(
        tracker.use_highest::<dyn Greeter, _, _>(|g| g.name()),
        Some("s1".to_string())
    );
}

#[test]
fn test_tracker_sees_services_registered_before_open() {
    let framework = framework();
    let registry = framework.registry();
    let early = register_greeter(registry, "early", 1);

    let (tx, rx) = mpsc::channel();
    let tracker = ServiceTracker::builder(registry, Filter::for_service("greeter"))
        .on_add(move |service| tx.send(service.reference).unwrap())
        .open()
        .unwrap();
    assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), early);
    assert_eq!(tracker.highest(), Some(early));
}

#[test]
fn test_registrations_from_many_threads_are_all_tracked() {
    let framework = framework();
    let registry = framework.registry().clone();
    let tracker = ServiceTracker::for_service(&registry, "greeter").unwrap();

    let workers: Vec<_> = (0..8)
        .map(|worker| {
            let registry = registry.clone();
            std::thread::spawn(move || {
                for i in 0..10 {
                    register_greeter(&registry, &format!("w{}-{}", worker, i), i);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert!(tracker.wait_for(80, Some(Duration::from_secs(5))));
    let ids: Vec<ServiceId> = tracker.all().iter().map(|r| r.service_id()).collect();
    assert_eq!(ids.len(), 80);
    let top = tracker.highest_service().unwrap();
    assert_eq!(top.ranking.rank, 9);
}

#[test]
fn test_tracked_service_stays_alive_after_unregister_until_released() {
    let framework = framework();
    let registry = framework.registry();
    let (tx, rx) = mpsc::channel::<Arc<dyn Greeter>>();
    let _tracker = ServiceTracker::builder(registry, Filter::for_service("greeter"))
        .on_remove(move |service| {
            tx.send(service.service::<dyn Greeter>().unwrap()).unwrap();
        })
        .open()
        .unwrap();

    let reference = register_greeter(registry, "gone", 0);
    registry.unregister(reference).unwrap();
    let greeter = rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!(greeter.name(), "gone");
    assert!(!registry.is_registered(reference));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_highest_is_max_rank_then_min_id(ranks in prop::collection::vec(-3i64..3, 1..12)) {
        let framework = framework();
        let registry = framework.registry();
        let tracker = ServiceTracker::for_service(registry, "greeter").unwrap();
        let references: Vec<_> = ranks
            .iter()
            .enumerate()
            .map(|(i, rank)| register_greeter(registry, &format!("g{}", i), *rank))
            .collect();

        let best = ranks.iter().max().unwrap();
        let expected = references[ranks.iter().position(|r| r == best).unwrap()];
        prop_assert_eq!(tracker.highest(), Some(expected));
        prop_assert_eq!(registry.find_services(&Filter::for_service("greeter"))[0], expected);
    }
}
