use std::{
    sync::Arc,
    thread::{self, ThreadId},
    time::Duration,
};

use parking_lot::{Condvar, Mutex};
use tracing::warn;

/// One-shot completion flag a caller can block on.
#[derive(Debug, Default)]
pub(crate) struct Completion {
    done: Mutex<bool>,
    cond: Condvar,
}

impl Completion {
    pub(crate) fn complete(&self) {
        let mut done = self.done.lock();
        *done = true;
        self.cond.notify_all();
    }

    pub(crate) fn is_done(&self) -> bool {
        *self.done.lock()
    }

    /// Returns `false` when `timeout` elapsed first.
    pub(crate) fn wait(&self, timeout: Option<Duration>) -> bool {
        let mut done = self.done.lock();
        match timeout {
            None => {
                while !*done {
                    self.cond.wait(&mut done);
                }
                true
            }
            Some(timeout) => {
                let deadline = std::time::Instant::now() + timeout;
                while !*done {
                    if self.cond.wait_until(&mut done, deadline).timed_out() {
                        return *done;
                    }
                }
                true
            }
        }
    }
}

/// Handle to an event submitted to the [`EventExecutor`](super::EventExecutor).
///
/// Waiting never cancels the event: a wait that times out leaves it queued.
#[derive(Debug, Clone)]
pub struct EventHandle {
    pub(crate) seq: u64,
    pub(crate) completion: Arc<Completion>,
    pub(crate) loop_thread: Option<ThreadId>,
}

impl EventHandle {
    pub(crate) fn completed(seq: u64) -> Self {
        let completion = Arc::new(Completion::default());
        completion.complete();
        Self {
            seq,
            completion,
            loop_thread: None,
        }
    }

    /// Causal sequence number of the event.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn is_done(&self) -> bool {
        self.completion.is_done()
    }

    /// Blocks until the event and its synchronous notifications ran.
    ///
    /// Returns `false` when the timeout elapsed first. Waiting on the event
    /// loop thread for a queued event cannot succeed and returns `false`
    /// immediately.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        if self.completion.is_done() {
            return true;
        }
        if self.loop_thread == Some(thread::current().id()) {
            warn!(
                seq = self.seq,
                "waiting for a queued event on the event loop thread would deadlock"
            );
            return false;
        }
        self.completion.wait(timeout)
    }
}
