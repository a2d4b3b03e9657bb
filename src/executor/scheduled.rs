use std::{
    collections::BTreeMap,
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::registry::BundleId;

use super::panic_message;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScheduledEventId(pub u64);

impl fmt::Display for ScheduledEventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub type ScheduledCallback = Box<dyn FnMut() + Send + 'static>;
pub type RemovedCallback = Box<dyn FnOnce() + Send + 'static>;

/// Describes a timed callback run on the event loop thread.
///
/// Without an interval the event fires once and is then removed.
pub struct ScheduledEventOptions {
    pub(crate) name: String,
    pub(crate) bundle: Option<BundleId>,
    pub(crate) initial_delay: Duration,
    pub(crate) interval: Option<Duration>,
    pub(crate) callback: ScheduledCallback,
    pub(crate) on_removed: Option<RemovedCallback>,
}

impl ScheduledEventOptions {
    pub fn new<S, F>(name: S, callback: F) -> Self
    where
        S: Into<String>,
        F: FnMut() + Send + 'static,
    {
        Self {
            name: name.into(),
            bundle: None,
            initial_delay: Duration::ZERO,
            interval: None,
            callback: Box::new(callback),
            on_removed: None,
        }
    }

    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    pub fn bundle(mut self, bundle: BundleId) -> Self {
        self.bundle = Some(bundle);
        self
    }

    pub fn on_removed<F: FnOnce() + Send + 'static>(mut self, callback: F) -> Self {
        self.on_removed = Some(Box::new(callback));
        self
    }
}

impl fmt::Debug for ScheduledEventOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledEventOptions")
            .field("name", &self.name)
            .field("bundle", &self.bundle)
            .field("initial_delay", &self.initial_delay)
            .field("interval", &self.interval)
            .finish()
    }
}

/// State shared between the loop and callers waiting on a scheduled event.
#[derive(Debug)]
pub(crate) struct ScheduledStatus {
    pub(crate) name: String,
    pub(crate) bundle: Option<BundleId>,
    calls: Mutex<u64>,
    cond: Condvar,
    removed: AtomicBool,
}

impl ScheduledStatus {
    pub(crate) fn new(name: String, bundle: Option<BundleId>) -> Self {
        Self {
            name,
            bundle,
            calls: Mutex::new(0),
            cond: Condvar::new(),
            removed: AtomicBool::new(false),
        }
    }

    pub(crate) fn call_count(&self) -> u64 {
        *self.calls.lock()
    }

    pub(crate) fn is_removed(&self) -> bool {
        self.removed.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_removed(&self) {
        self.removed.store(true, Ordering::SeqCst);
        let _calls = self.calls.lock();
        self.cond.notify_all();
    }

    fn record_call(&self) {
        let mut calls = self.calls.lock();
        *calls += 1;
        self.cond.notify_all();
    }

    /// Waits until the callback ran at least `count` times.
    pub(crate) fn wait_for_calls(&self, count: u64, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| std::time::Instant::now() + t);
        let mut calls = self.calls.lock();
        while *calls < count {
            if self.is_removed() {
                return false;
            }
            match deadline {
                None => self.cond.wait(&mut calls),
                Some(deadline) => {
                    if self.cond.wait_until(&mut calls, deadline).timed_out() {
                        return *calls >= count;
                    }
                }
            }
        }
        true
    }
}

pub(crate) struct ScheduledEntry {
    pub(crate) id: ScheduledEventId,
    pub(crate) options: ScheduledEventOptions,
    pub(crate) status: Arc<ScheduledStatus>,
    next_deadline: Instant,
}

impl ScheduledEntry {
    pub(crate) fn new(
        id: ScheduledEventId,
        options: ScheduledEventOptions,
        status: Arc<ScheduledStatus>,
    ) -> Self {
        let next_deadline = Instant::now() + options.initial_delay;
        Self {
            id,
            options,
            status,
            next_deadline,
        }
    }
}

/// Loop-owned table of scheduled events.
pub(crate) struct ScheduledEvents {
    entries: BTreeMap<ScheduledEventId, ScheduledEntry>,
    statuses: Arc<DashMap<ScheduledEventId, Arc<ScheduledStatus>>>,
    warn_threshold: Duration,
}

impl ScheduledEvents {
    pub(crate) fn new(
        statuses: Arc<DashMap<ScheduledEventId, Arc<ScheduledStatus>>>,
        warn_threshold: Duration,
    ) -> Self {
        Self {
            entries: BTreeMap::new(),
            statuses,
            warn_threshold,
        }
    }

    pub(crate) fn insert(&mut self, entry: ScheduledEntry) {
        debug!(id = %entry.id, name = %entry.options.name, "scheduled event added");
        if entry.status.is_removed() {
            // removed before the loop saw it
            self.finish(entry);
            return;
        }
        self.entries.insert(entry.id, entry);
    }

    pub(crate) fn wakeup(&mut self, id: ScheduledEventId) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.next_deadline = Instant::now();
        }
    }

    pub(crate) fn remove(&mut self, id: ScheduledEventId) {
        if let Some(entry) = self.entries.remove(&id) {
            self.finish(entry);
        }
    }

    pub(crate) fn remove_all(&mut self) {
        let entries = std::mem::take(&mut self.entries);
        for (_, entry) in entries {
            self.finish(entry);
        }
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().map(|e| e.next_deadline).min()
    }

    pub(crate) fn process_due(&mut self) {
        let now = Instant::now();
        let due: Vec<ScheduledEventId> = self
            .entries
            .values()
            .filter(|e| e.next_deadline <= now)
            .map(|e| e.id)
            .collect();
        for id in due {
            let Some(entry) = self.entries.get_mut(&id) else {
                continue;
            };
            if entry.status.is_removed() {
                self.remove(id);
                continue;
            }
            let started = std::time::Instant::now();
            let result = catch_unwind(AssertUnwindSafe(|| (entry.options.callback)()));
            let elapsed = started.elapsed();
            if let Err(panic) = result {
                error!(
                    id = %id,
                    name = %entry.options.name,
                    "scheduled event callback panicked: {}",
                    panic_message(&panic)
                );
            }
            if elapsed > self.warn_threshold {
                warn!(
                    id = %id,
                    name = %entry.options.name,
                    "scheduled event callback took {:?}",
                    elapsed
                );
            }
            entry.status.record_call();
            let interval = entry.options.interval;
            match interval {
                Some(interval) => entry.next_deadline = Instant::now() + interval,
                None => self.remove(id),
            }
        }
    }

    fn finish(&mut self, mut entry: ScheduledEntry) {
        self.statuses.remove(&entry.id);
        if let Some(on_removed) = entry.options.on_removed.take() {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(on_removed)) {
                error!(
                    id = %entry.id,
                    "scheduled event removed callback panicked: {}",
                    panic_message(&panic)
                );
            }
        }
        entry.status.mark_removed();
        debug!(id = %entry.id, name = %entry.options.name, "scheduled event removed");
    }
}
