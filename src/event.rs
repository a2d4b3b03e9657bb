//! # Framework event bus
//!
//! Every registry mutation and component enable/disable applied by the event
//! loop is published here with a causal sequence number. The sequence is
//! assigned on the event loop thread at the moment the event is applied, so
//! it is the global order every tracker observed.
//!
//! The bus is a Tokio broadcast channel: subscribers never slow down the
//! event loop, a lagging subscriber loses the oldest events instead.

use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::trace;

use crate::{dm::ComponentId, registry::ServiceId};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    Registered(ServiceId),
    Modified(ServiceId),
    Unregistering(ServiceId),
    ComponentEnable(ComponentId),
    ComponentDisable(ComponentId),
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Registered(id) => write!(f, "Registered({})", id),
            EventKind::Modified(id) => write!(f, "Modified({})", id),
            EventKind::Unregistering(id) => write!(f, "Unregistering({})", id),
            EventKind::ComponentEnable(id) => write!(f, "ComponentEnable({})", id),
            EventKind::ComponentDisable(id) => write!(f, "ComponentDisable({})", id),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub seq: u64,
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
}

pub type EventReceiver = broadcast::Receiver<Event>;

pub struct EventBus {
    sender: broadcast::Sender<Event>,
    next_seq: AtomicU64,
    capacity: usize,
    /// Keeps the channel open while nobody subscribed.
    _internal_receiver: broadcast::Receiver<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            next_seq: AtomicU64::new(0),
            capacity,
            _internal_receiver: receiver,
        }
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Sequence number of the last published event.
    pub fn last_seq(&self) -> u64 {
        self.next_seq.load(Ordering::SeqCst)
    }

    /// Assigns the next sequence number and broadcasts the event.
    pub(crate) fn publish(&self, kind: EventKind) -> Event {
        let event = Event {
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst) + 1,
            kind,
            timestamp: Utc::now(),
        };
        trace!(seq = event.seq, kind = %event.kind, "publishing event");
        // only the internal receiver may exist, which is fine
        let _ = self.sender.send(event.clone());
        event
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("capacity", &self.capacity)
            .field("last_seq", &self.last_seq())
            .finish()
    }
}
