use crate::{error::TimerError, timer::Timer};
use parking_lot::Mutex;
use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{debug, error, trace};
use uuid::Uuid;

/// A Universally Unique Identifier (UUID) for TimerEvents.
pub type EventId = Uuid;

/// Outcome of a single [`TimerEvent::check`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckOutcome {
    /// Not yet due. Carries the deadline to sleep until; `None` only when the
    /// timer could not be armed because its clock is failing.
    Pending(Option<Instant>),
    /// The event fired. Carries the next deadline after the rearm.
    Fired(Instant),
    /// The event has been removed and must not be serviced again. Callers
    /// drop their reference when they see this.
    Removed,
}

/// How a ring reaches the user callback. A handler installs its own
/// dispatcher when an event is added so it can interpose thread-per-callback
/// behavior; a standalone event dispatches directly.
pub(crate) trait RangDispatch: Send + Sync {
    fn rang(&self, event: &Arc<TimerEvent>);
}

pub(crate) struct DirectDispatch;

impl RangDispatch for DirectDispatch {
    fn rang(&self, event: &Arc<TimerEvent>) {
        event.invoke_callback();
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Lifecycle {
    Live,
    CallbackRunning,
    RemovePending,
    Removed,
}

struct EventState {
    lifecycle: Lifecycle,
    dispatch: Arc<dyn RangDispatch>,
    attached: bool,
}

type RangCallback = Box<dyn Fn(&Arc<TimerEvent>) + Send + Sync>;
type ExtendedData = Arc<dyn Any + Send + Sync>;

/// A timer bound to a user callback, with a removal-safe lifecycle.
///
/// [`check`](TimerEvent::check) polls the timer and, when due, rearms it and
/// invokes the callback. A callback is always allowed to remove its own event
/// with [`request_removal`](TimerEvent::request_removal): the removal is
/// deferred until the callback returns, and the caller that drove the check
/// is told via [`CheckOutcome::Removed`].
///
/// At most one callback invocation is in flight per event. Driving `check`
/// on one event from two threads concurrently is not supported.
pub struct TimerEvent {
    id: EventId,
    timer: Arc<Mutex<Timer>>,
    callback: RangCallback,
    data: Mutex<Option<ExtendedData>>,
    state: Mutex<EventState>,
}

impl TimerEvent {
    pub fn new<F>(run_length: Duration, callback: F) -> Arc<Self>
    where
        F: Fn(&Arc<TimerEvent>) + Send + Sync + 'static,
    {
        Self::with_timer(Arc::new(Mutex::new(Timer::new(run_length))), callback)
    }

    /// Builds an event around an externally supplied timer. The timer is
    /// shared; it must not be rearmed behind a running event's back.
    pub fn with_timer<F>(timer: Arc<Mutex<Timer>>, callback: F) -> Arc<Self>
    where
        F: Fn(&Arc<TimerEvent>) + Send + Sync + 'static,
    {
        Arc::new(Self {
            id: EventId::new_v4(),
            timer,
            callback: Box::new(callback),
            data: Mutex::new(None),
            state: Mutex::new(EventState {
                lifecycle: Lifecycle::Live,
                dispatch: Arc::new(DirectDispatch),
                attached: false,
            }),
        })
    }

    /// Polls the timer and fires the callback if the deadline has passed.
    ///
    /// A due event is rearmed before its callback runs, early by the overrun
    /// so the schedule does not drift. A clock glitch is absorbed by
    /// rearming and treating the tick as missed, never rung.
    pub fn check(self: &Arc<Self>) -> CheckOutcome {
        if matches!(self.state.lock().lifecycle, Lifecycle::Removed) {
            return CheckOutcome::Removed;
        }

        let deadline = {
            let mut timer = self.timer.lock();
            let status = match timer.time_status() {
                Ok(status) => status,
                Err(err) => {
                    debug!(event = %self.id, %err, "clock read failed, rearming");
                    let _ = timer.begin();
                    return CheckOutcome::Pending(timer.deadline());
                }
            };

            if !status.is_due() {
                return CheckOutcome::Pending(timer.deadline());
            }

            // Due. A glitch on the rearm is treated like a glitch on the
            // read: the tick is missed, not rung.
            if timer.begin_before(status.overrun).is_err() {
                return CheckOutcome::Pending(timer.deadline());
            }
            match timer.deadline() {
                Some(deadline) => deadline,
                None => return CheckOutcome::Pending(None),
            }
        };

        let dispatch = {
            let mut state = self.state.lock();
            if matches!(state.lifecycle, Lifecycle::Removed) {
                return CheckOutcome::Removed;
            }
            state.lifecycle = Lifecycle::CallbackRunning;
            Arc::clone(&state.dispatch)
        };

        trace!(event = %self.id, "timer event rang");
        dispatch.rang(self);

        let mut state = self.state.lock();
        if matches!(state.lifecycle, Lifecycle::RemovePending) {
            state.lifecycle = Lifecycle::Removed;
            debug!(event = %self.id, "event removed from within its own callback");
            return CheckOutcome::Removed;
        }
        state.lifecycle = Lifecycle::Live;
        CheckOutcome::Fired(deadline)
    }

    /// Marks the event for removal. Safe to call from anywhere, including
    /// from inside the event's own callback: the removal then takes effect
    /// the moment the callback returns. Removal is terminal.
    pub fn request_removal(&self) {
        let mut state = self.state.lock();
        state.lifecycle = match state.lifecycle {
            Lifecycle::CallbackRunning => Lifecycle::RemovePending,
            _ => Lifecycle::Removed,
        };
    }

    /// Arms the underlying timer.
    pub fn begin(&self) -> Result<(), TimerError> {
        self.timer.lock().begin()
    }

    pub fn id(&self) -> EventId {
        self.id
    }

    /// The shared timer handle.
    pub fn timer(&self) -> Arc<Mutex<Timer>> {
        Arc::clone(&self.timer)
    }

    /// Installs or clears the extended user data. Replaced data is released
    /// when its last reference drops.
    pub fn set_data(&self, data: Option<ExtendedData>) {
        *self.data.lock() = data;
    }

    pub fn data(&self) -> Option<ExtendedData> {
        self.data.lock().clone()
    }

    pub fn is_attached(&self) -> bool {
        self.state.lock().attached
    }

    /// Routes rings through `dispatch` until [`detach`](TimerEvent::detach).
    /// Fails if another owner already claimed the event.
    pub(crate) fn attach(&self, dispatch: Arc<dyn RangDispatch>) -> Result<(), TimerError> {
        let mut state = self.state.lock();
        if state.attached {
            return Err(TimerError::AlreadyAttached);
        }
        state.attached = true;
        state.dispatch = dispatch;
        Ok(())
    }

    pub(crate) fn detach(&self) {
        let mut state = self.state.lock();
        state.attached = false;
        state.dispatch = Arc::new(DirectDispatch);
    }

    /// Runs the user callback. Panics are contained here so a misbehaving
    /// callback cannot take a scheduling loop down with it.
    pub(crate) fn invoke_callback(self: &Arc<Self>) {
        let invoked = panic::catch_unwind(AssertUnwindSafe(|| (self.callback)(self)));
        if invoked.is_err() {
            error!(event = %self.id, "timer callback panicked");
        }
    }
}
