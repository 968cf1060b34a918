// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use crate::message_pump::{
    time_until,
    Delegate,
    MessagePump,
    PumpWaker,
    ScopedKeepRunning,
};
use ::std::{
    any::Any,
    cell::Cell,
    sync::{
        Arc,
        Condvar,
        Mutex,
        MutexGuard,
        PoisonError,
    },
    time::{
        Duration,
        Instant,
    },
};

//==============================================================================
// Structures
//==============================================================================

/// Auto-reset event. Signalling it wakes one waiter; a signal with no waiter is remembered until the next wait.
#[derive(Default)]
pub struct WaitableEvent {
    signaled: Mutex<bool>,
    condvar: Condvar,
}

/// Pump without a native event source. Sleeps on a [WaitableEvent] between rounds of work.
pub struct DefaultPump {
    event: Arc<WaitableEvent>,
    keep_running: Cell<bool>,
    delayed_work_time: Cell<Option<Instant>>,
}

//==============================================================================
// Associate Functions
//==============================================================================

impl WaitableEvent {
    pub fn signal(&self) {
        let mut signaled: MutexGuard<'_, bool> = self.lock();
        *signaled = true;
        self.condvar.notify_one();
    }

    /// Blocks until signaled.
    pub fn wait(&self) {
        let mut signaled: MutexGuard<'_, bool> = self.lock();
        while !*signaled {
            signaled = self.condvar.wait(signaled).unwrap_or_else(PoisonError::into_inner);
        }
        *signaled = false;
    }

    /// Blocks until signaled or until `timeout` elapses. Returns true if signaled.
    pub fn timed_wait(&self, timeout: Duration) -> bool {
        let deadline: Instant = Instant::now() + timeout;
        let mut signaled: MutexGuard<'_, bool> = self.lock();
        while !*signaled {
            let remaining: Duration = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            signaled = self
                .condvar
                .wait_timeout(signaled, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        *signaled = false;
        true
    }

    fn lock(&self) -> MutexGuard<'_, bool> {
        self.signaled.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl DefaultPump {
    pub fn new() -> Self {
        Self {
            event: Arc::new(WaitableEvent::default()),
            keep_running: Cell::new(false),
            delayed_work_time: Cell::new(None),
        }
    }

    fn do_delayed_work(&self, delegate: &dyn Delegate) -> bool {
        let mut delayed_work_time: Option<Instant> = self.delayed_work_time.get();
        let did_work: bool = delegate.do_delayed_work(&mut delayed_work_time);
        self.delayed_work_time.set(delayed_work_time);
        did_work
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

impl Default for DefaultPump {
    fn default() -> Self {
        Self::new()
    }
}

impl PumpWaker for WaitableEvent {
    fn schedule_work(&self) {
        self.signal();
    }
}

impl MessagePump for DefaultPump {
    fn run(&self, delegate: &dyn Delegate) {
        let _keep_running: ScopedKeepRunning<'_> = ScopedKeepRunning::new(&self.keep_running);

        loop {
            let mut did_work: bool = delegate.do_work();
            if !self.keep_running.get() {
                break;
            }

            did_work |= self.do_delayed_work(delegate);
            if !self.keep_running.get() {
                break;
            }

            if did_work {
                continue;
            }

            did_work = delegate.do_idle_work();
            if !self.keep_running.get() {
                break;
            }

            if did_work {
                continue;
            }

            match self.delayed_work_time.get() {
                None => self.event.wait(),
                Some(delayed_work_time) => match time_until(delayed_work_time) {
                    Some(delay) => {
                        self.event.timed_wait(delay);
                    },
                    // Already due: go around again without sleeping.
                    None => self.delayed_work_time.set(None),
                },
            }
            // The event is auto-reset, so whatever woke us is now consumed and we go back to asking for work.
        }
    }

    fn quit(&self) {
        debug_assert!(self.keep_running.get(), "quit() called outside of run()");
        self.keep_running.set(false);
    }

    fn schedule_work(&self) {
        // Since this can be called on any thread, we need to ensure that our run loop wakes up.
        self.event.signal();
    }

    fn schedule_delayed_work(&self, delayed_work_time: Instant) {
        // We know that we can't be blocked on wait right now since this method can only be called on the same thread
        // as run, so we only need to update our record of how long to sleep when we do sleep.
        self.delayed_work_time.set(Some(delayed_work_time));
    }

    fn waker(&self) -> Arc<dyn PumpWaker> {
        self.event.clone()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

//==============================================================================
// Unit Tests
//==============================================================================
