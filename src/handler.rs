use crate::{
    error::TimerError,
    event::{CheckOutcome, RangDispatch, TimerEvent},
};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::{
    sync::Arc,
    thread::{self, JoinHandle},
    time::Instant,
};
use tracing::{debug, trace, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum LoopState {
    NotStarted,
    Running,
    StopRequested,
    Stopped,
}

struct HandlerInner {
    events: Vec<Arc<TimerEvent>>,
    state: LoopState,
}

struct HandlerShared {
    inner: Mutex<HandlerInner>,
    cond: Condvar,
    thread_per_callback: bool,
}

/// Dispatcher installed on every contained event: rings route back through
/// the handler so it can apply the thread-per-callback policy.
struct HandlerDispatch {
    thread_per_callback: bool,
}

impl RangDispatch for HandlerDispatch {
    fn rang(&self, event: &Arc<TimerEvent>) {
        if self.thread_per_callback {
            let event = Arc::clone(event);
            let for_thread = Arc::clone(&event);
            let spawned = thread::Builder::new()
                .name("timer-event-callback".into())
                .spawn(move || for_thread.invoke_callback());
            match spawned {
                // Detached; the thread cleans up after itself.
                Ok(handle) => drop(handle),
                Err(err) => {
                    warn!(%err, "could not spawn callback thread, running inline");
                    event.invoke_callback();
                }
            }
        } else {
            event.invoke_callback();
        }
    }
}

/// Multiplexes many [`TimerEvent`]s onto one scheduling thread, kept in
/// deadline order. The thread repeatedly checks the earliest-deadline event,
/// reinserts it at its new position when it fires, and sleeps until the next
/// deadline or until an add/remove wakes it.
///
/// With `thread_per_callback` disabled, callbacks run inline on the
/// scheduling thread while the handler lock is held: a slow callback delays
/// every other event, and a callback must not call `add`, `remove` or `stop`
/// on its own handler. Self-removal from a callback is
/// [`TimerEvent::request_removal`]. With `thread_per_callback` enabled, each
/// ring gets its own short-lived detached thread and those restrictions do
/// not apply.
pub struct TimerEventHandler {
    shared: Arc<HandlerShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TimerEventHandler {
    pub fn new(thread_per_callback: bool) -> Self {
        Self {
            shared: Arc::new(HandlerShared {
                inner: Mutex::new(HandlerInner {
                    events: Vec::new(),
                    state: LoopState::NotStarted,
                }),
                cond: Condvar::new(),
                thread_per_callback,
            }),
            thread: Mutex::new(None),
        }
    }

    /// Launches the scheduling thread. A no-op when already running. Every
    /// contained event's timer is rearmed first so deadlines left over from
    /// a previous run do not all fire at once.
    ///
    /// A spawn failure rolls the handler back so a later `start` can retry.
    pub fn start(&self) -> Result<(), TimerError> {
        let mut thread = self.thread.lock();
        let mut inner = self.shared.inner.lock();

        if matches!(inner.state, LoopState::Running) {
            return Ok(());
        }
        // A stopped loop whose thread was never joined is wound down first.
        if let Some(handle) = thread.take() {
            inner.state = LoopState::StopRequested;
            self.shared.cond.notify_all();
            drop(inner);
            let _ = handle.join();
            inner = self.shared.inner.lock();
        }

        for event in inner.events.iter() {
            let _ = event.begin();
        }

        inner.state = LoopState::Running;
        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name("timer-event-handler".into())
            .spawn(move || run_loop(shared));
        match spawned {
            Ok(handle) => {
                *thread = Some(handle);
                debug!(events = inner.events.len(), "timer event handler started");
                Ok(())
            }
            Err(err) => {
                inner.state = LoopState::NotStarted;
                Err(TimerError::Spawn(err))
            }
        }
    }

    /// Stops the scheduling thread and joins it. No callbacks run after this
    /// returns. With `thread_per_callback` disabled this may block until the
    /// currently running callback returns.
    pub fn stop(&self) {
        let mut thread = self.thread.lock();
        {
            let mut inner = self.shared.inner.lock();
            if thread.is_none() && !matches!(inner.state, LoopState::Running) {
                return;
            }
            inner.state = LoopState::StopRequested;
        }
        self.shared.cond.notify_all();
        if let Some(handle) = thread.take() {
            let _ = handle.join();
            self.shared.inner.lock().state = LoopState::Stopped;
        }
        debug!("timer event handler stopped");
    }

    /// Adds an event, taking over its dispatch. Rejected when the event
    /// already belongs to a handler. The event is inserted at its sorted
    /// position: by run length while the handler is idle, by deadline while
    /// it is running.
    pub fn add(&self, event: &Arc<TimerEvent>) -> Result<(), TimerError> {
        let mut inner = self.shared.inner.lock();
        event.attach(Arc::new(HandlerDispatch {
            thread_per_callback: self.shared.thread_per_callback,
        }))?;

        let running = matches!(inner.state, LoopState::Running);
        if running && event.timer().lock().deadline().is_none() {
            let _ = event.begin();
        }
        insert_sorted(&mut inner.events, Arc::clone(event), running);
        debug!(event = %event.id(), count = inner.events.len(), "added timer event");

        self.shared.cond.notify_all();
        Ok(())
    }

    /// Removes an event and releases it for reuse elsewhere. Returns whether
    /// the event was present.
    pub fn remove(&self, event: &Arc<TimerEvent>) -> bool {
        let mut inner = self.shared.inner.lock();
        let found = inner.events.iter().position(|e| Arc::ptr_eq(e, event));
        match found {
            Some(position) => {
                let removed = inner.events.remove(position);
                removed.detach();
                debug!(event = %removed.id(), count = inner.events.len(), "removed timer event");
                self.shared.cond.notify_all();
                true
            }
            None => false,
        }
    }

    pub fn event_count(&self) -> usize {
        self.shared.inner.lock().events.len()
    }

    #[cfg(test)]
    fn event_ids(&self) -> Vec<crate::event::EventId> {
        self.shared
            .inner
            .lock()
            .events
            .iter()
            .map(|event| event.id())
            .collect()
    }

    #[cfg(test)]
    fn is_sorted_by_deadline(&self) -> bool {
        let inner = self.shared.inner.lock();
        inner
            .events
            .windows(2)
            .all(|pair| deadline_of(&pair[0]) <= deadline_of(&pair[1]))
    }
}

impl Drop for TimerEventHandler {
    /// Stops the scheduling thread and releases every contained event.
    fn drop(&mut self) {
        self.stop();
        let mut inner = self.shared.inner.lock();
        for event in inner.events.drain(..) {
            event.detach();
        }
    }
}

fn run_loop(shared: Arc<HandlerShared>) {
    debug!("scheduling loop running");
    let mut inner = shared.inner.lock();
    while matches!(inner.state, LoopState::Running) {
        // Yield briefly so add/remove callers are not starved.
        MutexGuard::bump(&mut inner);

        while inner.events.is_empty() && matches!(inner.state, LoopState::Running) {
            shared.cond.wait(&mut inner);
        }
        if !matches!(inner.state, LoopState::Running) {
            break;
        }

        let head = Arc::clone(&inner.events[0]);
        match head.check() {
            CheckOutcome::Removed => {
                // The event removed itself during its callback; discard it.
                if let Some(position) = inner.events.iter().position(|e| Arc::ptr_eq(e, &head)) {
                    inner.events.remove(position);
                }
                head.detach();
                trace!(event = %head.id(), "discarded removed event");
            }
            CheckOutcome::Fired(_) => {
                // Reinsert at the new deadline position, then go straight
                // back around so overdue events are serviced before sleeping.
                if let Some(position) = inner.events.iter().position(|e| Arc::ptr_eq(e, &head)) {
                    let event = inner.events.remove(position);
                    insert_sorted(&mut inner.events, event, true);
                }
            }
            CheckOutcome::Pending(Some(deadline)) => {
                let _ = shared.cond.wait_until(&mut inner, deadline);
            }
            CheckOutcome::Pending(None) => {
                shared.cond.wait(&mut inner);
            }
        }
    }
    inner.state = LoopState::Stopped;
    debug!("scheduling loop stopped");
}

/// Inserts after any elements with an equal key, so ties keep their
/// first-seen order.
fn insert_sorted(events: &mut Vec<Arc<TimerEvent>>, event: Arc<TimerEvent>, running: bool) {
    let position = if running {
        let key = deadline_of(&event);
        events.partition_point(|e| deadline_of(e) <= key)
    } else {
        let key = event.timer().lock().run_length();
        events.partition_point(|e| e.timer().lock().run_length() <= key)
    };
    events.insert(position, event);
}

fn deadline_of(event: &Arc<TimerEvent>) -> Option<Instant> {
    event.timer().lock().deadline()
}
