//! # Event executor
//!
//! The single serialization point of a framework instance. Any number of
//! producer threads submit events; one dedicated event loop thread applies
//! them in submission order.
//!
//! ```text
//!  producer threads                       event loop thread
//!  ----------------                       ---------------------------------
//!  submit(task) ──┐                       ┌─> task()            (seq 1)
//!  submit(task) ──┼──> FIFO channel ──────┼─> task()            (seq 2)
//!  schedule(..) ──┘                       ├─> scheduled callbacks when due
//!                                         └─> drain + exit on shutdown
//! ```
//!
//! Every registry mutation, tracker update and component transition runs as
//! an event on the loop thread, so user callbacks always execute there.
//! Synchronous calls made *from* the loop thread run inline instead of being
//! queued, which keeps a callback that registers a service from deadlocking
//! on itself.
//!
//! ```rust,no_run
//! use musubi::config::FrameworkConfig;
//! use musubi::executor::EventExecutor;
//!
//! let executor = EventExecutor::new(&FrameworkConfig::default()).unwrap();
//! let handle = executor.submit("hello", || println!("on the event loop")).unwrap();
//! assert!(handle.wait(None));
//! executor.shutdown().unwrap();
//! ```

mod completion;
mod scheduled;

use std::{
    any::Any,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, OnceLock,
    },
    thread::{self, JoinHandle, ThreadId},
    time::Duration,
};

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use crate::{config::FrameworkConfig, registry::BundleId, Error, MusubiResult};

pub use completion::EventHandle;
pub use scheduled::{ScheduledEventId, ScheduledEventOptions};

use completion::Completion;
use scheduled::{ScheduledEntry, ScheduledEvents, ScheduledStatus};

type Task = Box<dyn FnOnce() + Send + 'static>;

enum Job {
    Event {
        seq: u64,
        label: &'static str,
        span: tracing::Span,
        task: Task,
        completion: Arc<Completion>,
    },
    Schedule(ScheduledEntry),
    Wakeup(ScheduledEventId),
    RemoveScheduled {
        id: ScheduledEventId,
        completion: Arc<Completion>,
    },
    Shutdown,
}

/// Counters exposed for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExecutorStats {
    pub submitted: u64,
    pub processed: u64,
    pub scheduled_events: usize,
}

#[derive(Debug, Default)]
struct Progress {
    processed: Mutex<u64>,
    cond: Condvar,
}

impl Progress {
    fn advance(&self) {
        let mut processed = self.processed.lock();
        *processed += 1;
        self.cond.notify_all();
    }

    fn get(&self) -> u64 {
        *self.processed.lock()
    }

    fn wait_for(&self, target: u64, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| std::time::Instant::now() + t);
        let mut processed = self.processed.lock();
        while *processed < target {
            match deadline {
                None => self.cond.wait(&mut processed),
                Some(deadline) => {
                    if self.cond.wait_until(&mut processed, deadline).timed_out() {
                        return *processed >= target;
                    }
                }
            }
        }
        true
    }
}

/// State shared with the event loop thread.
struct Shared {
    progress: Progress,
    stopped: Completion,
    statuses: Arc<DashMap<ScheduledEventId, Arc<ScheduledStatus>>>,
}

struct ExecutorInner {
    name: String,
    sender: mpsc::UnboundedSender<Job>,
    shutdown_requested: AtomicBool,
    /// Held while a queued event takes its sequence number and is sent, so
    /// sequence order is channel order.
    enqueue: Mutex<()>,
    next_seq: AtomicU64,
    next_scheduled_id: AtomicU64,
    loop_thread: OnceLock<ThreadId>,
    join_handle: Mutex<Option<JoinHandle<()>>>,
    shared: Arc<Shared>,
    wait_timeout: Option<Duration>,
    shutdown_timeout: Duration,
}

/// Cloneable handle to a running event loop.
#[derive(Clone)]
pub struct EventExecutor {
    inner: Arc<ExecutorInner>,
}

impl std::fmt::Debug for EventExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventExecutor")
            .field("name", &self.inner.name)
            .field("stats", &self.stats())
            .finish()
    }
}

pub(crate) fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl EventExecutor {
    /// Spawns the event loop thread.
    pub fn new(config: &FrameworkConfig) -> MusubiResult<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .map_err(|e| Error::internal(format!("Failed to build event loop runtime: {}", e)))?;
        let (sender, receiver) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            progress: Progress::default(),
            stopped: Completion::default(),
            statuses: Arc::new(DashMap::new()),
        });

        let loop_shared = shared.clone();
        let warn_threshold = config.scheduled_event_warn_threshold;
        let join_handle = thread::Builder::new()
            .name(config.event_loop_name.clone())
            .spawn(move || {
                runtime.block_on(run_loop(receiver, loop_shared.clone(), warn_threshold));
                loop_shared.stopped.complete();
            })
            .map_err(|e| Error::internal(format!("Failed to spawn event loop thread: {}", e)))?;

        let loop_thread = OnceLock::new();
        let _ = loop_thread.set(join_handle.thread().id());
        info!(name = %config.event_loop_name, "event loop started");

        Ok(Self {
            inner: Arc::new(ExecutorInner {
                name: config.event_loop_name.clone(),
                sender,
                shutdown_requested: AtomicBool::new(false),
                enqueue: Mutex::new(()),
                next_seq: AtomicU64::new(0),
                next_scheduled_id: AtomicU64::new(1),
                loop_thread,
                join_handle: Mutex::new(Some(join_handle)),
                shared,
                wait_timeout: config.wait_timeout,
                shutdown_timeout: config.shutdown_timeout,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Whether the calling thread is the event loop thread.
    pub fn is_executor_thread(&self) -> bool {
        self.inner.loop_thread.get() == Some(&thread::current().id())
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown_requested.load(Ordering::SeqCst)
    }

    /// Default timeout of synchronous waits.
    pub fn wait_timeout(&self) -> Option<Duration> {
        self.inner.wait_timeout
    }

    pub fn stats(&self) -> ExecutorStats {
        ExecutorStats {
            submitted: self.inner.next_seq.load(Ordering::SeqCst),
            processed: self.inner.shared.progress.get(),
            scheduled_events: self.inner.shared.statuses.len(),
        }
    }

    fn next_seq(&self) -> u64 {
        self.inner.next_seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Queues `task` behind every event submitted before it.
    ///
    /// Never blocks. Fails with `FrameworkShutdown` once shutdown has been
    /// requested.
    pub fn submit<F>(&self, label: &'static str, task: F) -> MusubiResult<EventHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_shutdown() {
            return Err(Error::FrameworkShutdown);
        }
        let completion = Arc::new(Completion::default());
        let (seq, sent) = {
            let _enqueue = self.inner.enqueue.lock();
            let seq = self.next_seq();
            let job = Job::Event {
                seq,
                label,
                span: tracing::Span::current(),
                task: Box::new(task),
                completion: completion.clone(),
            };
            (seq, self.inner.sender.send(job))
        };
        if let Err(rejected) = sent {
            // dropped outside the lock, the task may own handles that submit
            drop(rejected);
            // the loop is gone, keep the counters balanced
            self.inner.shared.progress.advance();
            return Err(Error::FrameworkShutdown);
        }
        trace!(seq, label, "event submitted");
        Ok(EventHandle {
            seq,
            completion,
            loop_thread: self.inner.loop_thread.get().copied(),
        })
    }

    /// Submits `task` and blocks until it ran, or `timeout` elapsed.
    ///
    /// Returns `Ok(false)` on timeout; the event still runs later. Called on
    /// the event loop thread the task runs inline.
    pub fn submit_and_wait<F>(
        &self,
        label: &'static str,
        task: F,
        timeout: Option<Duration>,
    ) -> MusubiResult<bool>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_executor_thread() {
            self.run_inline(label, task);
            return Ok(true);
        }
        let handle = self.submit(label, task)?;
        Ok(handle.wait(timeout))
    }

    /// Runs `task` on the event loop and returns its result: inline when
    /// already there, otherwise queued and awaited with the configured wait
    /// timeout.
    pub(crate) fn execute<R, F>(&self, label: &'static str, task: F) -> MusubiResult<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_executor_thread() {
            trace!(label, "running nested event inline");
            let result = catch_unwind(AssertUnwindSafe(task));
            return match result {
                Ok(result) => Ok(result),
                Err(panic) => std::panic::resume_unwind(panic),
            };
        }
        let slot = Arc::new(Mutex::new(None));
        let output = slot.clone();
        let handle = self.submit(label, move || {
            *output.lock() = Some(task());
        })?;
        if !handle.wait(self.inner.wait_timeout) {
            warn!(label, "timed out waiting for event, it completes asynchronously");
            return Err(Error::Timeout {
                operation: label.to_string(),
            });
        }
        let result = slot.lock().take();
        result.ok_or_else(|| Error::internal(format!("event `{}` did not complete", label)))
    }

    // Inline events take no sequence number; they finish inside the queued
    // event that runs them.
    fn run_inline<F: FnOnce()>(&self, label: &'static str, task: F) {
        trace!(label, "running nested event inline");
        run_task(0, label, task);
    }

    /// Blocks until every event submitted before this call was processed.
    pub fn wait_for_events(&self, timeout: Option<Duration>) -> bool {
        let target = {
            let _enqueue = self.inner.enqueue.lock();
            self.inner.next_seq.load(Ordering::SeqCst)
        };
        if self.is_executor_thread() {
            let done = self.inner.shared.progress.get() >= target;
            if !done {
                warn!("wait_for_events called on the event loop thread with pending events");
            }
            return done;
        }
        self.inner.shared.progress.wait_for(target, timeout)
    }

    /// Adds a scheduled event; its callback runs on the event loop thread.
    pub fn schedule(&self, options: ScheduledEventOptions) -> MusubiResult<ScheduledEventId> {
        if self.is_shutdown() {
            return Err(Error::FrameworkShutdown);
        }
        if options.interval == Some(Duration::ZERO) {
            return Err(Error::illegal_argument(format!(
                "scheduled event `{}` has a zero interval",
                options.name
            )));
        }
        let id = ScheduledEventId(self.inner.next_scheduled_id.fetch_add(1, Ordering::SeqCst));
        let status = Arc::new(ScheduledStatus::new(options.name.clone(), options.bundle));
        self.inner.shared.statuses.insert(id, status.clone());
        debug!(id = %id, name = %options.name, "scheduling event");
        if self
            .inner
            .sender
            .send(Job::Schedule(ScheduledEntry::new(id, options, status)))
            .is_err()
        {
            self.inner.shared.statuses.remove(&id);
            return Err(Error::FrameworkShutdown);
        }
        Ok(id)
    }

    /// Makes the scheduled event fire on the next loop iteration.
    pub fn wakeup(&self, id: ScheduledEventId) -> MusubiResult<()> {
        if !self.inner.shared.statuses.contains_key(&id) {
            return Err(Error::illegal_argument(format!(
                "unknown scheduled event {}",
                id
            )));
        }
        self.inner
            .sender
            .send(Job::Wakeup(id))
            .map_err(|_| Error::FrameworkShutdown)
    }

    /// Number of times the callback of `id` ran, `None` once removed.
    pub fn scheduled_call_count(&self, id: ScheduledEventId) -> Option<u64> {
        self.inner
            .shared
            .statuses
            .get(&id)
            .map(|status| status.call_count())
    }

    /// Blocks until the callback of `id` ran at least `count` times.
    pub fn wait_for_scheduled(
        &self,
        id: ScheduledEventId,
        count: u64,
        timeout: Option<Duration>,
    ) -> bool {
        let Some(status) = self.inner.shared.statuses.get(&id).map(|s| s.clone()) else {
            return false;
        };
        if self.is_executor_thread() {
            return status.call_count() >= count;
        }
        status.wait_for_calls(count, timeout)
    }

    /// Removes a scheduled event without waiting for its removed callback.
    pub fn remove_scheduled_async(&self, id: ScheduledEventId) -> MusubiResult<EventHandle> {
        let status = self
            .inner
            .shared
            .statuses
            .get(&id)
            .map(|s| s.clone())
            .ok_or_else(|| Error::illegal_argument(format!("unknown scheduled event {}", id)))?;
        // the callback must not fire again even if the loop is busy
        status.mark_removed();
        let completion = Arc::new(Completion::default());
        if self
            .inner
            .sender
            .send(Job::RemoveScheduled {
                id,
                completion: completion.clone(),
            })
            .is_err()
        {
            return Ok(EventHandle::completed(0));
        }
        Ok(EventHandle {
            seq: 0,
            completion,
            loop_thread: self.inner.loop_thread.get().copied(),
        })
    }

    /// Removes a scheduled event and waits until its removed callback ran.
    ///
    /// On the event loop thread the removal only completes after the current
    /// event; the callback is nevertheless never invoked again.
    pub fn remove_scheduled(&self, id: ScheduledEventId) -> MusubiResult<()> {
        let handle = self.remove_scheduled_async(id)?;
        if !self.is_executor_thread() {
            handle.wait(self.inner.wait_timeout);
        }
        Ok(())
    }

    /// Removes every scheduled event owned by `bundle`.
    pub fn remove_scheduled_for_bundle(&self, bundle: BundleId) -> MusubiResult<usize> {
        let ids: Vec<ScheduledEventId> = self
            .inner
            .shared
            .statuses
            .iter()
            .filter(|entry| entry.value().bundle == Some(bundle))
            .map(|entry| *entry.key())
            .collect();
        for id in &ids {
            self.remove_scheduled(*id)?;
        }
        Ok(ids.len())
    }

    /// Stops accepting events, drains the queue and joins the loop thread.
    ///
    /// Idempotent. When called on the loop thread itself the loop exits after
    /// the current event without being joined.
    #[tracing::instrument(skip(self), level = "debug")]
    pub fn shutdown(&self) -> MusubiResult<()> {
        if self.inner.shutdown_requested.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(name = %self.inner.name, "event loop shutting down");
        let _ = self.inner.sender.send(Job::Shutdown);
        if self.is_executor_thread() {
            return Ok(());
        }
        if !self
            .inner
            .shared
            .stopped
            .wait(Some(self.inner.shutdown_timeout))
        {
            error!(
                name = %self.inner.name,
                "event loop did not stop within {:?}",
                self.inner.shutdown_timeout
            );
            return Err(Error::internal("event loop shutdown timed out"));
        }
        if let Some(handle) = self.inner.join_handle.lock().take() {
            handle
                .join()
                .map_err(|_| Error::internal("event loop thread panicked"))?;
        }
        info!(name = %self.inner.name, "event loop stopped");
        Ok(())
    }
}

fn run_task<F: FnOnce()>(seq: u64, label: &'static str, task: F) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(task)) {
        error!(seq, label, "event panicked: {}", panic_message(&panic));
    }
}

async fn run_loop(
    mut receiver: mpsc::UnboundedReceiver<Job>,
    shared: Arc<Shared>,
    warn_threshold: Duration,
) {
    let mut scheduled = ScheduledEvents::new(shared.statuses.clone(), warn_threshold);
    loop {
        let deadline = scheduled.next_deadline();
        tokio::select! {
            job = receiver.recv() => match job {
                Some(Job::Shutdown) | None => break,
                Some(job) => handle_job(job, &mut scheduled, &shared),
            },
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(tokio::time::Instant::now)), if deadline.is_some() => {
                scheduled.process_due();
            }
        }
    }

    // events queued before shutdown still run
    receiver.close();
    while let Ok(job) = receiver.try_recv() {
        match job {
            Job::Shutdown => {}
            job => handle_job(job, &mut scheduled, &shared),
        }
    }
    scheduled.remove_all();
    debug!("event loop drained");
}

fn handle_job(job: Job, scheduled: &mut ScheduledEvents, shared: &Shared) {
    match job {
        Job::Event {
            seq,
            label,
            span,
            task,
            completion,
        } => {
            let _guard = span.enter();
            trace!(seq, label, "processing event");
            run_task(seq, label, task);
            completion.complete();
            shared.progress.advance();
        }
        Job::Schedule(entry) => scheduled.insert(entry),
        Job::Wakeup(id) => scheduled.wakeup(id),
        Job::RemoveScheduled { id, completion } => {
            scheduled.remove(id);
            completion.complete();
        }
        Job::Shutdown => {}
    }
}
