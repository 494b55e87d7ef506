//! Host runtime seam: timers and the round-completion rendezvous
//!
//! The host environment supplies two timer shapes: a periodic ticker driving
//! the slot scheduler, and a re-armable one-shot deadline (watchdog) used by
//! the clock synchronization service. Both are constructed through
//! [`TimerDriver`], which also exposes a monotonic microsecond clock.
//!
//! [`Rendezvous`] is the crate's only blocking primitive: a binary semaphore
//! combined with a one-shot completion channel. The initiating execution
//! context blocks in [`Rendezvous::wait`] until the event-dispatch path
//! signals the round's terminal state exactly once.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration as StdDuration;

/// Locks a mutex, recovering the data from a poisoned lock.
///
/// A panicked slot handler must not take the whole scheduler down with it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Control handle for a host timer
pub trait TimerHandle: Send {
    /// Arms (or re-arms) the timer to fire after `delay_us` microseconds,
    /// replacing any pending deadline.
    fn arm(&mut self, delay_us: u32);

    /// Cancels any pending deadline.
    fn stop(&mut self);
}

/// Constructor for host timers
///
/// Implementations are cheap handles to the host's timing facility and are
/// cloned into every component that needs one.
pub trait TimerDriver: Clone {
    /// The handle type controlling timers created by this driver.
    type Handle: TimerHandle;

    /// Creates a ticker that invokes `handler` every `period_us`
    /// microseconds, starting immediately.
    fn periodic(&self, period_us: u32, handler: Box<dyn FnMut() + Send>) -> Self::Handle;

    /// Creates an unarmed one-shot deadline timer.
    ///
    /// When the deadline expires `handler` runs once; returning `Some(d)`
    /// re-arms the timer for `d` microseconds, `None` leaves it unarmed.
    fn watchdog(&self, handler: Box<dyn FnMut() -> Option<u32> + Send>) -> Self::Handle;

    /// Monotonic host uptime in microseconds.
    fn now_us(&self) -> u64;
}

struct RendezvousState<T> {
    busy: bool,
    outcome: Option<T>,
}

/// Binary semaphore plus one-shot completion channel
///
/// `begin` serializes rounds (one exchange in flight per radio), `wait`
/// blocks the initiating context, and `finish` signals the terminal event.
/// Signals after the first within a round are ignored, which makes the
/// "released exactly once per round" invariant hold even when several
/// terminal events race.
pub struct Rendezvous<T> {
    state: Mutex<RendezvousState<T>>,
    cond: Condvar,
}

impl<T> Rendezvous<T> {
    /// Creates a rendezvous with no round in flight.
    pub fn new() -> Self {
        Rendezvous {
            state: Mutex::new(RendezvousState { busy: false, outcome: None }),
            cond: Condvar::new(),
        }
    }

    /// Claims the rendezvous for a new round, blocking while another round
    /// is in flight.
    pub fn begin(&self) {
        let mut state = lock(&self.state);
        while state.busy {
            state = match self.cond.wait(state) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
        state.busy = true;
        state.outcome = None;
    }

    /// Whether a round is currently in flight.
    pub fn busy(&self) -> bool {
        lock(&self.state).busy
    }

    /// Signals the round's terminal state.
    ///
    /// Returns `true` if this call completed the round, `false` if the round
    /// was already complete (or never began) and the signal was dropped.
    pub fn finish(&self, outcome: T) -> bool {
        let mut state = lock(&self.state);
        if !state.busy || state.outcome.is_some() {
            return false;
        }
        state.outcome = Some(outcome);
        self.cond.notify_all();
        true
    }

    /// Blocks until the round completes and returns its outcome.
    pub fn wait(&self) -> T {
        let mut state = lock(&self.state);
        loop {
            if let Some(outcome) = state.outcome.take() {
                state.busy = false;
                self.cond.notify_all();
                return outcome;
            }
            state = match self.cond.wait(state) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }

    /// Releases a claimed round without an outcome, e.g. when the opening
    /// transmission never started.
    pub fn cancel(&self) {
        let mut state = lock(&self.state);
        state.busy = false;
        state.outcome = None;
        self.cond.notify_all();
    }

    /// Like [`wait`](Self::wait), but gives up after `timeout`.
    ///
    /// Returns `None` on timeout, leaving the round in flight.
    pub fn wait_timeout(&self, timeout: StdDuration) -> Option<T> {
        let deadline = std::time::Instant::now() + timeout;
        let mut state = lock(&self.state);
        loop {
            if let Some(outcome) = state.outcome.take() {
                state.busy = false;
                self.cond.notify_all();
                return Some(outcome);
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = match self.cond.wait_timeout(state, deadline - now) {
                Ok(result) => result,
                Err(poisoned) => poisoned.into_inner(),
            };
            state = guard;
        }
    }
}

impl<T> Default for Rendezvous<T> {
    fn default() -> Self {
        Rendezvous::new()
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! Scripted timer driver for unit tests.

    use super::{TimerDriver, TimerHandle, lock};
    use std::sync::{Arc, Mutex};

    type PeriodicHandler = Box<dyn FnMut() + Send>;
    type WatchdogHandler = Box<dyn FnMut() -> Option<u32> + Send>;

    enum Handler {
        Periodic(PeriodicHandler),
        Watchdog(WatchdogHandler),
    }

    struct TimerSlot {
        handler: Option<Handler>,
        period_us: Option<u32>,
        armed: Option<u32>,
        stopped: bool,
    }

    #[derive(Default)]
    struct DriverState {
        now_us: u64,
        timers: Vec<TimerSlot>,
    }

    /// Timer driver whose timers only fire when the test says so.
    #[derive(Clone, Default)]
    pub(crate) struct MockDriver {
        state: Arc<Mutex<DriverState>>,
    }

    pub(crate) struct MockHandle {
        index: usize,
        state: Arc<Mutex<DriverState>>,
    }

    impl TimerHandle for MockHandle {
        fn arm(&mut self, delay_us: u32) {
            let mut state = lock(&self.state);
            let slot = &mut state.timers[self.index];
            slot.armed = Some(delay_us);
            slot.stopped = false;
        }

        fn stop(&mut self) {
            let mut state = lock(&self.state);
            let slot = &mut state.timers[self.index];
            slot.armed = None;
            slot.stopped = true;
        }
    }

    impl TimerDriver for MockDriver {
        type Handle = MockHandle;

        fn periodic(&self, period_us: u32, handler: Box<dyn FnMut() + Send>) -> MockHandle {
            let mut state = lock(&self.state);
            state.timers.push(TimerSlot {
                handler: Some(Handler::Periodic(handler)),
                period_us: Some(period_us),
                armed: None,
                stopped: false,
            });
            MockHandle { index: state.timers.len() - 1, state: self.state.clone() }
        }

        fn watchdog(&self, handler: Box<dyn FnMut() -> Option<u32> + Send>) -> MockHandle {
            let mut state = lock(&self.state);
            state.timers.push(TimerSlot {
                handler: Some(Handler::Watchdog(handler)),
                period_us: None,
                armed: None,
                stopped: false,
            });
            MockHandle { index: state.timers.len() - 1, state: self.state.clone() }
        }

        fn now_us(&self) -> u64 {
            lock(&self.state).now_us
        }
    }

    impl MockDriver {
        pub(crate) fn set_now(&self, now_us: u64) {
            lock(&self.state).now_us = now_us;
        }

        pub(crate) fn period_of(&self, index: usize) -> Option<u32> {
            lock(&self.state).timers[index].period_us
        }

        pub(crate) fn armed_delay(&self, index: usize) -> Option<u32> {
            lock(&self.state).timers[index].armed
        }

        pub(crate) fn is_stopped(&self, index: usize) -> bool {
            lock(&self.state).timers[index].stopped
        }

        /// Fires a periodic timer once.
        pub(crate) fn tick(&self, index: usize) {
            // The handler is taken out so it can lock whatever it wants
            // without holding the driver lock.
            let handler = lock(&self.state).timers[index].handler.take();
            let mut handler = match handler {
                Some(Handler::Periodic(h)) => h,
                _ => panic!("timer {} is not periodic", index),
            };
            handler();
            lock(&self.state).timers[index].handler = Some(Handler::Periodic(handler));
        }

        /// Expires a watchdog timer, applying any requested re-arm.
        pub(crate) fn expire(&self, index: usize) {
            let handler = lock(&self.state).timers[index].handler.take();
            let mut handler = match handler {
                Some(Handler::Watchdog(h)) => h,
                _ => panic!("timer {} is not a watchdog", index),
            };
            let rearm = handler();
            let mut state = lock(&self.state);
            let slot = &mut state.timers[index];
            slot.handler = Some(Handler::Watchdog(handler));
            slot.armed = rearm;
        }
    }
}
