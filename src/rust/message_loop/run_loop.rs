// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::message_loop::MessageLoop;
use ::std::{
    cell::Cell,
    rc::Rc,
    sync::atomic::{
        AtomicU64,
        Ordering,
    },
};

//======================================================================================================================
// Static Variables
//======================================================================================================================

/// Run loop identifiers are unique across all threads, so a quit closure can never address another loop's run.
static NEXT_RUN_LOOP_ID: AtomicU64 = AtomicU64::new(1);

//======================================================================================================================
// Structures
//======================================================================================================================

/// Bookkeeping for one invocation of the loop. Shared between the [RunLoop] and the owning loop's stack of active
/// runs.
pub(crate) struct RunLoopState {
    pub id: u64,
    /// Depth of this run on the loop's stack, 1 for the outermost run. Zero until the run starts.
    pub run_depth: Cell<usize>,
    pub run_called: Cell<bool>,
    pub quit_called: Cell<bool>,
    pub running: Cell<bool>,
    /// Consulted by idle work. Set by `run_until_idle()` or `quit_when_idle()`.
    pub quit_when_idle_received: Cell<bool>,
}

/// One, possibly nested, run of the current thread's [MessageLoop].
///
/// ```ignore
/// let run_loop: RunLoop = RunLoop::new();
/// message_loop.post_delayed_task(run_loop.quit_closure(), Duration::from_millis(10));
/// run_loop.run();
/// ```
pub struct RunLoop {
    message_loop: Rc<MessageLoop>,
    state: Rc<RunLoopState>,
}

/// Keeps a run registered on its loop's stack. Popping happens on drop so that it also happens during unwinding.
struct RunScope<'a> {
    message_loop: &'a MessageLoop,
    state: &'a Rc<RunLoopState>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl RunLoopState {
    fn new() -> Self {
        Self {
            id: NEXT_RUN_LOOP_ID.fetch_add(1, Ordering::Relaxed),
            run_depth: Cell::new(0),
            run_called: Cell::new(false),
            quit_called: Cell::new(false),
            running: Cell::new(false),
            quit_when_idle_received: Cell::new(false),
        }
    }

    /// Quits this run. If it is the innermost active run, the pump stops right away; an outer run stops as soon as
    /// the runs nested in it have returned. A run that has not started yet returns immediately when started.
    pub fn quit(&self, message_loop: &MessageLoop) {
        self.quit_called.set(true);
        if self.running.get() && message_loop.is_innermost_run(self) {
            message_loop.quit_now();
        }
    }
}

impl RunLoop {
    /// Creates a run for the current thread's loop.
    ///
    /// # Panics
    ///
    /// If the current thread has no [MessageLoop].
    pub fn new() -> Self {
        match MessageLoop::current() {
            Some(message_loop) => Self::with_loop(message_loop),
            None => panic!("RunLoop::new() called on a thread without a message loop"),
        }
    }

    pub(crate) fn with_loop(message_loop: Rc<MessageLoop>) -> Self {
        let state: Rc<RunLoopState> = Rc::new(RunLoopState::new());
        message_loop.register_run_loop(&state);
        Self { message_loop, state }
    }

    /// Runs the loop until this run is quit. A run may only be started once.
    pub fn run(&self) {
        if !self.before_run() {
            return;
        }
        let _scope: RunScope<'_> = RunScope {
            message_loop: &self.message_loop,
            state: &self.state,
        };
        self.message_loop.run_handler();
    }

    /// Runs the loop until there is no more work that is due, then returns.
    pub fn run_until_idle(&self) {
        self.state.quit_when_idle_received.set(true);
        self.run();
    }

    /// Quits this run. Calling it before [RunLoop::run] makes `run()` return immediately.
    pub fn quit(&self) {
        self.state.quit(&self.message_loop);
    }

    /// Returns a closure that quits this run when called on the loop's thread. It does nothing once the [RunLoop]
    /// is gone, and can be posted as a task.
    pub fn quit_closure(&self) -> impl Fn() + Send + Sync + 'static {
        let id: u64 = self.state.id;
        move || {
            if let Some(message_loop) = MessageLoop::current() {
                message_loop.quit_run_loop(id);
            }
        }
    }

    pub fn running(&self) -> bool {
        self.state.running.get()
    }

    fn before_run(&self) -> bool {
        assert!(!self.state.run_called.get(), "a RunLoop can only be run once");
        self.state.run_called.set(true);

        // Allow quit() to be called before run().
        if self.state.quit_called.get() {
            return false;
        }

        let run_depth: usize = self.message_loop.push_run_loop(&self.state);
        self.state.run_depth.set(run_depth);
        self.state.running.set(true);
        debug!("run(): entering run loop (depth={:?})", run_depth);
        true
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for RunLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RunLoop {
    fn drop(&mut self) {
        self.message_loop.unregister_run_loop(self.state.id);
    }
}

impl<'a> Drop for RunScope<'a> {
    fn drop(&mut self) {
        self.state.running.set(false);
        debug!("run(): leaving run loop (depth={:?})", self.state.run_depth.get());

        let previous: Option<Rc<RunLoopState>> = self.message_loop.pop_run_loop(self.state);
        // Execute a deferred quit of the enclosing run, if any.
        if let Some(previous) = previous {
            if previous.quit_called.get() {
                self.message_loop.quit_now();
            }
        }
    }
}
