use std::{
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::{executor::panic_message, properties::Properties};

use super::types::{BundleId, ServiceId, ServiceObject};

pub type UnregisteredCallback = Box<dyn FnOnce(ServiceId) + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum RegistrationState {
    Registered,
    Unregistering,
    Unregistered,
}

impl RegistrationState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => RegistrationState::Registered,
            1 => RegistrationState::Unregistering,
            _ => RegistrationState::Unregistered,
        }
    }
}

/// Everything needed to publish one service.
pub struct ServiceRegistrationOptions {
    pub(crate) name: String,
    pub(crate) owner: BundleId,
    pub(crate) properties: Properties,
    pub(crate) object: ServiceObject,
    pub(crate) on_unregistered: Option<UnregisteredCallback>,
}

impl ServiceRegistrationOptions {
    pub fn new<S: ?Sized + Send + Sync + 'static>(name: &str, service: Arc<S>) -> Self {
        Self::from_object(name, ServiceObject::new(service))
    }

    pub fn from_object(name: &str, object: ServiceObject) -> Self {
        Self {
            name: name.to_string(),
            owner: BundleId::FRAMEWORK,
            properties: Properties::new(),
            object,
            on_unregistered: None,
        }
    }

    pub fn owner(mut self, owner: BundleId) -> Self {
        self.owner = owner;
        self
    }

    pub fn properties(mut self, properties: Properties) -> Self {
        self.properties = properties;
        self
    }

    /// Runs once the service is really gone: unregistered and no longer used.
    ///
    /// Runs on the thread releasing the last use, which may be any thread.
    pub fn on_unregistered<F: FnOnce(ServiceId) + Send + 'static>(mut self, callback: F) -> Self {
        self.on_unregistered = Some(Box::new(callback));
        self
    }
}

impl fmt::Debug for ServiceRegistrationOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRegistrationOptions")
            .field("name", &self.name)
            .field("owner", &self.owner)
            .field("properties", &self.properties)
            .finish()
    }
}

/// Reference counted lifecycle of one registered service.
///
/// The usage count is the only state touched from arbitrary threads. The
/// object is released exactly once, after listeners saw the unregistration
/// and the count drained to zero.
pub(crate) struct Registration {
    pub(crate) id: ServiceId,
    pub(crate) name: String,
    pub(crate) owner: BundleId,
    object: Mutex<Option<ServiceObject>>,
    usage: AtomicUsize,
    state: AtomicU8,
    /// Set by the event loop once the unregistration was dispatched.
    destroy_pending: AtomicBool,
    destroyed: AtomicBool,
    on_unregistered: Mutex<Option<UnregisteredCallback>>,
}

impl Registration {
    pub(crate) fn new(
        id: ServiceId,
        name: String,
        owner: BundleId,
        object: ServiceObject,
        on_unregistered: Option<UnregisteredCallback>,
    ) -> Self {
        Self {
            id,
            name,
            owner,
            object: Mutex::new(Some(object)),
            usage: AtomicUsize::new(0),
            state: AtomicU8::new(0),
            destroy_pending: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            on_unregistered: Mutex::new(on_unregistered),
        }
    }

    pub(crate) fn state(&self) -> RegistrationState {
        RegistrationState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn is_registered(&self) -> bool {
        self.state() == RegistrationState::Registered
    }

    pub(crate) fn usage_count(&self) -> usize {
        self.usage.load(Ordering::SeqCst)
    }

    /// Takes one use of the object; `None` once unregistering.
    pub(crate) fn acquire(&self) -> Option<ServiceObject> {
        self.usage.fetch_add(1, Ordering::SeqCst);
        if !self.is_registered() {
            self.release();
            return None;
        }
        let object = self.object.lock().clone();
        if object.is_none() {
            self.release();
        }
        object
    }

    /// Takes one more use on behalf of someone who already holds one, so it
    /// succeeds while unregistering too.
    pub(crate) fn retain(&self) -> bool {
        if self.destroyed.load(Ordering::SeqCst) {
            return false;
        }
        self.usage.fetch_add(1, Ordering::SeqCst);
        true
    }

    /// Gives one use back, destroying the object if it was the last one of
    /// an unregistering service.
    pub(crate) fn release(&self) {
        let previous = self
            .usage
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| count.checked_sub(1));
        match previous {
            Err(_) => warn!(service_id = %self.id, "unget without a matching get"),
            Ok(1) if !self.is_registered() => self.try_destroy(),
            Ok(_) => {}
        }
    }

    /// Moves to `Unregistering`; `false` when it already left `Registered`.
    pub(crate) fn mark_unregistering(&self) -> bool {
        self.state
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Allows destruction from now on and destroys the object right away
    /// when nobody holds a use.
    pub(crate) fn finish_unregister(&self) {
        self.destroy_pending.store(true, Ordering::SeqCst);
        self.try_destroy();
    }

    fn try_destroy(&self) {
        if !self.destroy_pending.load(Ordering::SeqCst) {
            return;
        }
        if self.usage_count() != 0 {
            debug!(
                service_id = %self.id,
                usage = self.usage_count(),
                "destruction deferred until the service is released"
            );
            return;
        }
        if self
            .destroyed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        self.state.store(2, Ordering::SeqCst);
        let object = self.object.lock().take();
        drop(object);
        debug!(service_id = %self.id, name = %self.name, "service destroyed");
        let callback = self.on_unregistered.lock().take();
        if let Some(callback) = callback {
            let id = self.id;
            if let Err(panic) = catch_unwind(AssertUnwindSafe(move || callback(id))) {
                error!(
                    service_id = %self.id,
                    "unregistered callback panicked: {}",
                    panic_message(&panic)
                );
            }
        }
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("owner", &self.owner)
            .field("state", &self.state())
            .field("usage", &self.usage_count())
            .finish()
    }
}
