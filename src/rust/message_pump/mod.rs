// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Message pumps.
//!
//! A pump is the engine that drives a [crate::MessageLoop]: it blocks until there is something to do (a native
//! event, an explicit wake-up or a due timer) and then calls back into the loop through [Delegate]. Backends only
//! ever see the [Delegate] interface, never the loop itself.

//======================================================================================================================
// Exports
//======================================================================================================================

pub mod default;

#[cfg(target_os = "linux")]
pub mod io;

//======================================================================================================================
// Imports
//======================================================================================================================

use ::std::{
    any::Any,
    cell::Cell,
    sync::Arc,
    time::{
        Duration,
        Instant,
    },
};

//======================================================================================================================
// Traits
//======================================================================================================================

/// Callbacks a pump makes into the loop it drives.
pub trait Delegate {
    /// Runs at most one immediate task. Returns true if a task ran.
    fn do_work(&self) -> bool;

    /// Runs at most one due delayed task. `next_delayed_work_time` is updated with the run time of the earliest
    /// pending delayed task, or cleared if there is none. Returns true if a task ran.
    fn do_delayed_work(&self, next_delayed_work_time: &mut Option<Instant>) -> bool;

    /// Called when the pump has nothing else to do. Returns true if work was done.
    fn do_idle_work(&self) -> bool;
}

/// Cross-thread half of a pump: wakes the pump up from any thread.
pub trait PumpWaker: Send + Sync {
    /// Ensures that a thread blocked inside [MessagePump::run] wakes up and calls [Delegate::do_work].
    fn schedule_work(&self);
}

/// Engine driving a [crate::MessageLoop]. Owned by exactly one loop and only used on that loop's thread, except for
/// the [PumpWaker] returned by [MessagePump::waker].
pub trait MessagePump: Any {
    /// Runs the pump until [MessagePump::quit] is called. Calls may nest; `quit` only stops the innermost one.
    fn run(&self, delegate: &dyn Delegate);

    /// Stops the innermost active [MessagePump::run] as soon as control returns to the pump.
    fn quit(&self);

    /// Schedules a call to [Delegate::do_work].
    fn schedule_work(&self) {
        self.waker().schedule_work()
    }

    /// Ensures that the pump wakes up no later than `delayed_work_time` to call [Delegate::do_delayed_work].
    fn schedule_delayed_work(&self, delayed_work_time: Instant);

    /// Returns the handle other threads use to wake this pump.
    fn waker(&self) -> Arc<dyn PumpWaker>;

    /// Allows the owner to reach backend-specific functionality.
    fn as_any(&self) -> &dyn Any;
}

//======================================================================================================================
// Structures
//======================================================================================================================

/// Sets a run flag for the duration of one [MessagePump::run] and restores the previous value on every exit path.
pub(crate) struct ScopedKeepRunning<'a> {
    flag: &'a Cell<bool>,
    previous: bool,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl<'a> ScopedKeepRunning<'a> {
    pub fn new(flag: &'a Cell<bool>) -> Self {
        let previous: bool = flag.replace(true);
        Self { flag, previous }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl<'a> Drop for ScopedKeepRunning<'a> {
    fn drop(&mut self) {
        self.flag.set(self.previous);
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Time left until `delayed_work_time`, or `None` if it has already passed.
pub(crate) fn time_until(delayed_work_time: Instant) -> Option<Duration> {
    let delay: Duration = delayed_work_time.saturating_duration_since(Instant::now());
    if delay.is_zero() {
        None
    } else {
        Some(delay)
    }
}
