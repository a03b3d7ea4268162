use crate::{
    error::TimerError,
    event::{CheckOutcome, TimerEvent},
    handler::LoopState,
    timer::Timer,
};
use parking_lot::{Condvar, Mutex};
use std::{
    sync::Arc,
    thread::{self, JoinHandle, ThreadId},
    time::Duration,
};
use tracing::debug;

struct ThreadedShared {
    state: Mutex<LoopState>,
    cond: Condvar,
    worker: Mutex<Option<ThreadId>>,
}

/// A [`TimerEvent`] with its own dedicated thread, for an event that needs
/// independent servicing rather than a slot in a shared handler.
///
/// The thread checks the event, broadcasts on every ring so
/// [`wait`](ThreadedTimerEvent::wait) callers wake, and sleeps until the
/// timer's deadline. [`stop`](ThreadedTimerEvent::stop) joins the thread;
/// called from inside the event's own callback it degrades to
/// [`stop_async`](ThreadedTimerEvent::stop_async) so the thread does not
/// join itself.
pub struct ThreadedTimerEvent {
    event: Arc<TimerEvent>,
    shared: Arc<ThreadedShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadedTimerEvent {
    pub fn new<F>(run_length: Duration, callback: F) -> Self
    where
        F: Fn(&Arc<TimerEvent>) + Send + Sync + 'static,
    {
        Self::with_event(TimerEvent::new(run_length, callback))
    }

    /// Builds the event around an externally supplied timer; see
    /// [`TimerEvent::with_timer`] for the sharing contract.
    pub fn with_timer<F>(timer: Arc<Mutex<Timer>>, callback: F) -> Self
    where
        F: Fn(&Arc<TimerEvent>) + Send + Sync + 'static,
    {
        Self::with_event(TimerEvent::with_timer(timer, callback))
    }

    fn with_event(event: Arc<TimerEvent>) -> Self {
        Self {
            event,
            shared: Arc::new(ThreadedShared {
                state: Mutex::new(LoopState::NotStarted),
                cond: Condvar::new(),
                worker: Mutex::new(None),
            }),
            thread: Mutex::new(None),
        }
    }

    pub fn event(&self) -> &Arc<TimerEvent> {
        &self.event
    }

    /// Arms the timer and launches the wait loop. A no-op when already
    /// running. A thread left over from an earlier stop is joined first; a
    /// thread detached by [`stop_async`](ThreadedTimerEvent::stop_async) and
    /// still winding down is waited for before relaunching.
    ///
    /// A spawn failure rolls the event back so a later `start` can retry.
    pub fn start(&self) -> Result<(), TimerError> {
        let mut thread = self.thread.lock();
        let mut state = self.shared.state.lock();

        match *state {
            LoopState::Running => return Ok(()),
            LoopState::StopRequested if thread.is_none() => {
                // Detached and still winding down; wait for the loop to exit.
                while matches!(*state, LoopState::StopRequested) {
                    self.shared.cond.wait(&mut state);
                }
            }
            _ => {}
        }
        if let Some(handle) = thread.take() {
            // A stopped thread that was never joined.
            *state = LoopState::StopRequested;
            self.shared.cond.notify_all();
            drop(state);
            let _ = handle.join();
            state = self.shared.state.lock();
        }

        let _ = self.event.begin();
        *state = LoopState::Running;
        let shared = Arc::clone(&self.shared);
        let event = Arc::clone(&self.event);
        let spawned = thread::Builder::new()
            .name("threaded-timer-event".into())
            .spawn(move || run_loop(shared, event));
        match spawned {
            Ok(handle) => {
                *thread = Some(handle);
                debug!(event = %self.event.id(), "threaded timer event started");
                Ok(())
            }
            Err(err) => {
                *state = LoopState::NotStarted;
                Err(TimerError::Spawn(err))
            }
        }
    }

    /// Stops the wait loop and joins the thread: no callback runs after this
    /// returns. When called from inside the event's own callback this
    /// degrades to [`stop_async`](ThreadedTimerEvent::stop_async), since the
    /// thread cannot join itself.
    pub fn stop(&self) {
        // The worker cannot join itself, so a stop issued on the worker
        // thread (from the event's own callback) takes the async form.
        let on_worker = *self.shared.worker.lock() == Some(thread::current().id());
        if on_worker {
            self.stop_async();
            return;
        }

        let mut thread = self.thread.lock();
        {
            let mut state = self.shared.state.lock();
            if matches!(*state, LoopState::NotStarted | LoopState::Stopped) {
                return;
            }
            *state = LoopState::StopRequested;
        }
        self.shared.cond.notify_all();
        if let Some(handle) = thread.take() {
            let _ = handle.join();
        }
        debug!(event = %self.event.id(), "threaded timer event stopped");
    }

    /// Requests a stop without waiting for it: the thread is detached and
    /// cleans up after itself.
    pub fn stop_async(&self) {
        {
            let mut state = self.shared.state.lock();
            if matches!(*state, LoopState::NotStarted | LoopState::Stopped) {
                return;
            }
            *state = LoopState::StopRequested;
        }
        self.shared.cond.notify_all();
        // Drop the handle to detach. Skipped when a concurrent stop() holds
        // it; that caller joins instead.
        if let Some(mut thread) = self.thread.try_lock() {
            drop(thread.take());
        }
        debug!(event = %self.event.id(), "threaded timer event stop requested");
    }

    /// Blocks until the next ring, or until the loop exits. Returns
    /// immediately when the event is not running.
    pub fn wait(&self) {
        let mut state = self.shared.state.lock();
        if !matches!(*state, LoopState::Running | LoopState::StopRequested) {
            return;
        }
        self.shared.cond.wait(&mut state);
    }

    /// True from loop entry until loop exit, including the window where a
    /// stop has been requested but the thread has not wound down yet.
    pub fn is_running(&self) -> bool {
        matches!(
            *self.shared.state.lock(),
            LoopState::Running | LoopState::StopRequested
        )
    }
}

impl Drop for ThreadedTimerEvent {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_loop(shared: Arc<ThreadedShared>, event: Arc<TimerEvent>) {
    *shared.worker.lock() = Some(thread::current().id());
    let mut state = shared.state.lock();
    while matches!(*state, LoopState::Running) {
        // The callback may call stop_async on this same thread, so check
        // with the state lock released.
        drop(state);
        let outcome = event.check();
        state = shared.state.lock();

        match outcome {
            CheckOutcome::Fired(deadline) => {
                // Wake wait() callers.
                shared.cond.notify_all();
                if matches!(*state, LoopState::Running) {
                    let _ = shared.cond.wait_until(&mut state, deadline);
                }
            }
            CheckOutcome::Pending(Some(deadline)) => {
                if matches!(*state, LoopState::Running) {
                    let _ = shared.cond.wait_until(&mut state, deadline);
                }
            }
            CheckOutcome::Pending(None) => {
                if matches!(*state, LoopState::Running) {
                    shared.cond.wait(&mut state);
                }
            }
            CheckOutcome::Removed => break,
        }
    }
    *state = LoopState::Stopped;
    drop(state);
    *shared.worker.lock() = None;
    // Release anyone still blocked in wait().
    shared.cond.notify_all();
}
