// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! The per-thread message loop.
//!
//! A [MessageLoop] owns four queues:
//!
//! - the incoming queue, the only state shared with other threads, guarded by a mutex;
//! - the work queue, refilled from the incoming queue in one swap whenever it runs dry;
//! - the delayed queue, a min-heap on `(delayed_run_time, sequence_num)`;
//! - the deferred non-nestable queue, holding non-nestable tasks that showed up while a nested run was active.
//!
//! The loop never runs anything on its own. Its [MessagePump] calls back into it through [Delegate], and the loop
//! turns queued tasks into executed work, one task per callback.

//======================================================================================================================
// Exports
//======================================================================================================================

pub mod config;
pub mod incoming_queue;
pub mod observer;
pub mod pending_task;
pub mod proxy;
pub mod run_loop;

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    message_loop::{
        config::{
            Config,
            LoopOptions,
        },
        incoming_queue::IncomingTaskQueue,
        observer::{
            DestructionObserver,
            ObserverList,
            TaskObserver,
        },
        pending_task::{
            DelayedTaskQueue,
            Location,
            PendingTask,
            TaskQueue,
        },
        proxy::MessageLoopProxy,
        run_loop::{
            RunLoop,
            RunLoopState,
        },
    },
    message_pump::{
        default::DefaultPump,
        Delegate,
        MessagePump,
    },
    runtime::{
        fail::Fail,
        logging,
    },
};
use ::std::{
    cell::{
        Cell,
        RefCell,
    },
    collections::HashMap,
    mem,
    ops::Deref,
    rc::{
        Rc,
        Weak,
    },
    sync::{
        Arc,
        OnceLock,
    },
    thread::{
        self,
        ThreadId,
    },
    time::{
        Duration,
        Instant,
    },
};

#[cfg(target_os = "linux")]
use crate::message_pump::io::{
    FileDescriptorWatcher,
    IoPump,
    WatchMode,
    Watcher,
};
#[cfg(target_os = "linux")]
use ::std::os::fd::RawFd;

//======================================================================================================================
// Types
//======================================================================================================================

/// Creates the pump of UI loops.
pub type MessagePumpFactory = fn() -> Result<Box<dyn MessagePump>, Fail>;

//======================================================================================================================
// Static Variables
//======================================================================================================================

/// Process-wide factory for UI pumps. Set at most once.
static UI_PUMP_FACTORY: OnceLock<MessagePumpFactory> = OnceLock::new();

thread_local! {
    /// The loop of the current thread, if any.
    static CURRENT: RefCell<Option<Rc<MessageLoop>>> = const { RefCell::new(None) };
}

//======================================================================================================================
// Structures
//======================================================================================================================

/// Selects the pump a loop is built with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopType {
    /// Only supports tasks and timers.
    Default,
    /// Also processes native UI events. Uses the registered UI pump factory.
    Ui,
    /// Also watches file descriptors.
    Io,
    /// Runs a pump supplied by the caller.
    Custom,
}

/// Single-threaded cooperative task loop. Reached through [ScopedMessageLoop] by its creator and through
/// [MessageLoop::current] by code running on its thread.
pub struct MessageLoop {
    loop_type: LoopType,
    options: LoopOptions,
    thread_id: ThreadId,
    thread_name: RefCell<Option<String>>,
    pump: Box<dyn MessagePump>,
    incoming_queue: Arc<IncomingTaskQueue>,
    work_queue: RefCell<TaskQueue>,
    delayed_work_queue: RefCell<DelayedTaskQueue>,
    deferred_non_nestable_work_queue: RefCell<TaskQueue>,
    /// Cleared while a task runs, unless the task explicitly allows nested task execution.
    nestable_tasks_allowed: Cell<bool>,
    /// Cached clock reading, refreshed only when the earliest delayed task looks due.
    recent_time: Cell<Option<Instant>>,
    /// Active runs, innermost last.
    run_loops: RefCell<Vec<Rc<RunLoopState>>>,
    /// Every live [RunLoop] of this loop, for quit closures.
    live_run_loops: RefCell<HashMap<u64, Weak<RunLoopState>>>,
    task_observers: ObserverList<dyn TaskObserver>,
    destruction_observers: ObserverList<dyn DestructionObserver>,
}

/// Owning handle of a [MessageLoop]. Dropping it destroys the loop: pending tasks are discarded, destruction
/// observers are notified and the thread's current loop is cleared.
pub struct ScopedMessageLoop(Rc<MessageLoop>);

/// Allows nested task execution for its lifetime. Needed by tasks that run a nested loop and expect tasks to run
/// inside it.
pub struct ScopedNestableTaskAllower<'a> {
    message_loop: &'a MessageLoop,
    old_state: bool,
}

/// Restores nested task execution once a task finishes, even if it panics.
struct ScopedTaskExecution<'a> {
    message_loop: &'a MessageLoop,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl MessageLoop {
    /// Creates a loop of type `loop_type` on the current thread with default options.
    pub fn new(loop_type: LoopType) -> Result<ScopedMessageLoop, Fail> {
        Self::with_options(loop_type, LoopOptions::default())
    }

    /// Creates a loop of type `loop_type` on the current thread, with options read from `config`.
    pub fn with_config(loop_type: LoopType, config: &Config) -> Result<ScopedMessageLoop, Fail> {
        Self::with_options(loop_type, LoopOptions::from_config(config)?)
    }

    /// Creates a loop of type `loop_type` on the current thread.
    ///
    /// # Panics
    ///
    /// If the current thread already has a loop.
    pub fn with_options(loop_type: LoopType, options: LoopOptions) -> Result<ScopedMessageLoop, Fail> {
        let pump: Box<dyn MessagePump> = Self::create_pump(loop_type, &options)?;
        Ok(Self::install(loop_type, pump, options))
    }

    /// Creates a loop on the current thread driven by `pump`.
    ///
    /// # Panics
    ///
    /// If the current thread already has a loop.
    pub fn with_pump(pump: Box<dyn MessagePump>, options: LoopOptions) -> ScopedMessageLoop {
        Self::install(LoopType::Custom, pump, options)
    }

    /// Registers the factory used to build pumps of UI loops. Returns false if a factory was already registered.
    pub fn init_message_pump_for_ui_factory(factory: MessagePumpFactory) -> bool {
        UI_PUMP_FACTORY.set(factory).is_ok()
    }

    /// Returns the loop of the current thread, if any.
    pub fn current() -> Option<Rc<MessageLoop>> {
        CURRENT.try_with(|current| current.borrow().clone()).ok().flatten()
    }

    fn create_pump(loop_type: LoopType, options: &LoopOptions) -> Result<Box<dyn MessagePump>, Fail> {
        match loop_type {
            LoopType::Default => Ok(Box::new(DefaultPump::new())),
            LoopType::Ui => match UI_PUMP_FACTORY.get() {
                Some(factory) => factory(),
                None => {
                    debug!("create_pump(): no UI pump factory registered, using the default pump");
                    Ok(Box::new(DefaultPump::new()))
                },
            },
            LoopType::Io => create_io_pump(options),
            LoopType::Custom => {
                let cause: &str = "custom loops are created with MessageLoop::with_pump()";
                error!("create_pump(): {}", cause);
                Err(Fail::new(libc::EINVAL, cause))
            },
        }
    }

    fn install(loop_type: LoopType, pump: Box<dyn MessagePump>, options: LoopOptions) -> ScopedMessageLoop {
        logging::initialize();
        assert!(
            Self::current().is_none(),
            "should only have one message loop per thread"
        );

        let incoming_queue: Arc<IncomingTaskQueue> = Arc::new(IncomingTaskQueue::new(pump.waker()));
        let message_loop: Rc<MessageLoop> = Rc::new(MessageLoop {
            loop_type,
            thread_id: thread::current().id(),
            thread_name: RefCell::new(options.thread_name.clone()),
            options,
            pump,
            incoming_queue,
            work_queue: RefCell::new(TaskQueue::new()),
            delayed_work_queue: RefCell::new(DelayedTaskQueue::default()),
            deferred_non_nestable_work_queue: RefCell::new(TaskQueue::new()),
            nestable_tasks_allowed: Cell::new(true),
            recent_time: Cell::new(None),
            run_loops: RefCell::new(Vec::new()),
            live_run_loops: RefCell::new(HashMap::new()),
            task_observers: ObserverList::new(),
            destruction_observers: ObserverList::new(),
        });
        CURRENT.with(|current| *current.borrow_mut() = Some(message_loop.clone()));
        debug!("install(): created message loop (type={:?})", loop_type);

        ScopedMessageLoop(message_loop)
    }

    //==================================================================================================================
    // Task Posting
    //==================================================================================================================

    /// Posts a task that runs as soon as possible.
    #[track_caller]
    pub fn post_task<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.incoming_queue
            .post(Location::caller(), Box::new(task), Duration::ZERO, true);
    }

    /// Posts a task that runs no earlier than `delay` from now. A zero delay runs the task as soon as possible.
    #[track_caller]
    pub fn post_delayed_task<F>(&self, task: F, delay: Duration)
    where
        F: FnOnce() + Send + 'static,
    {
        self.incoming_queue.post(Location::caller(), Box::new(task), delay, true);
    }

    /// Posts a task that never runs inside a nested run. If it shows up while one is active, it waits until the
    /// loop is back at the outermost run.
    #[track_caller]
    pub fn post_non_nestable_task<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.incoming_queue
            .post(Location::caller(), Box::new(task), Duration::ZERO, false);
    }

    /// Combination of [MessageLoop::post_delayed_task] and [MessageLoop::post_non_nestable_task].
    #[track_caller]
    pub fn post_non_nestable_delayed_task<F>(&self, task: F, delay: Duration)
    where
        F: FnOnce() + Send + 'static,
    {
        self.incoming_queue.post(Location::caller(), Box::new(task), delay, false);
    }

    /// Drops `object` from a non-nestable task. Useful for objects that may still be referenced by the task that is
    /// currently running.
    #[track_caller]
    pub fn delete_soon<T: Send + 'static>(&self, object: Box<T>) {
        self.post_non_nestable_task(move || drop(object));
    }

    /// Releases one reference to `object` from a non-nestable task.
    #[track_caller]
    pub fn release_soon<T: Send + Sync + 'static>(&self, object: Arc<T>) {
        self.post_non_nestable_task(move || drop(object));
    }

    /// Returns a handle for posting tasks to this loop from other threads.
    pub fn message_loop_proxy(&self) -> MessageLoopProxy {
        MessageLoopProxy::new(self.incoming_queue.clone(), self.thread_id)
    }

    //==================================================================================================================
    // Running and Quitting
    //==================================================================================================================

    /// Runs the loop until it is quit.
    pub fn run(&self) {
        self.check_thread();
        RunLoop::new().run();
    }

    /// Runs the loop until there is no more work that is due.
    pub fn run_until_idle(&self) {
        self.check_thread();
        RunLoop::new().run_until_idle();
    }

    /// Makes the innermost run return once it runs out of work.
    pub fn quit_when_idle(&self) {
        self.check_thread();
        let run_loops = self.run_loops.borrow();
        debug_assert!(!run_loops.is_empty(), "must be inside run() to call quit_when_idle()");
        if let Some(state) = run_loops.last() {
            state.quit_when_idle_received.set(true);
        }
    }

    /// Makes the innermost run return as soon as control gets back to the pump. Tasks still queued stay queued.
    pub fn quit_now(&self) {
        self.check_thread();
        let running: bool = !self.run_loops.borrow().is_empty();
        debug_assert!(running, "must be inside run() to call quit_now()");
        if running {
            self.pump.quit();
        }
    }

    /// Returns a task that calls [MessageLoop::quit_when_idle] on the loop it runs on.
    pub fn quit_when_idle_closure() -> impl Fn() + Send + Sync + 'static {
        || {
            if let Some(message_loop) = MessageLoop::current() {
                message_loop.quit_when_idle();
            }
        }
    }

    /// Enables or disables running tasks from inside a task. Enabling it schedules work, so that a nested run
    /// picks up tasks that are already queued.
    pub fn set_nestable_tasks_allowed(&self, allowed: bool) {
        if self.nestable_tasks_allowed.replace(allowed) != allowed && allowed {
            self.pump.schedule_work();
        }
    }

    pub fn nestable_tasks_allowed(&self) -> bool {
        self.nestable_tasks_allowed.get()
    }

    //==================================================================================================================
    // Queries
    //==================================================================================================================

    pub fn loop_type(&self) -> LoopType {
        self.loop_type
    }

    pub fn is_type(&self, loop_type: LoopType) -> bool {
        self.loop_type == loop_type
    }

    pub fn is_running(&self) -> bool {
        self.check_thread();
        !self.run_loops.borrow().is_empty()
    }

    /// Returns true if more than one run is active.
    pub fn is_nested(&self) -> bool {
        self.run_depth() > 1
    }

    /// Number of active runs.
    pub fn run_depth(&self) -> usize {
        self.run_loops
            .borrow()
            .last()
            .map_or(0, |state| state.run_depth.get())
    }

    /// Asserts that no task is waiting in the incoming queue.
    pub fn assert_idle(&self) {
        debug_assert!(self.incoming_queue.is_empty(), "message loop is not idle");
    }

    pub fn options(&self) -> &LoopOptions {
        &self.options
    }

    pub fn thread_name(&self) -> Option<String> {
        self.thread_name.borrow().clone()
    }

    pub fn set_thread_name(&self, thread_name: &str) {
        self.check_thread();
        *self.thread_name.borrow_mut() = Some(thread_name.to_string());
    }

    //==================================================================================================================
    // Observers
    //==================================================================================================================

    pub fn add_task_observer(&self, task_observer: Rc<dyn TaskObserver>) {
        self.check_thread();
        self.task_observers.add_observer(task_observer);
    }

    pub fn remove_task_observer(&self, task_observer: &Rc<dyn TaskObserver>) {
        self.check_thread();
        self.task_observers.remove_observer(task_observer);
    }

    pub fn add_destruction_observer(&self, destruction_observer: Rc<dyn DestructionObserver>) {
        self.check_thread();
        self.destruction_observers.add_observer(destruction_observer);
    }

    pub fn remove_destruction_observer(&self, destruction_observer: &Rc<dyn DestructionObserver>) {
        self.check_thread();
        self.destruction_observers.remove_observer(destruction_observer);
    }

    //==================================================================================================================
    // File Descriptor Watching
    //==================================================================================================================

    /// Watches `fd` for readiness. Only available on [LoopType::Io] loops.
    #[cfg(target_os = "linux")]
    pub fn watch_file_descriptor(
        &self,
        fd: RawFd,
        persistent: bool,
        mode: WatchMode,
        watcher: Rc<dyn Watcher>,
    ) -> Result<FileDescriptorWatcher, Fail> {
        self.check_thread();
        match self.pump.as_any().downcast_ref::<IoPump>() {
            Some(pump) => pump.watch_file_descriptor(fd, persistent, mode, watcher),
            None => {
                let cause: String = format!("not an IO message loop (type={:?})", self.loop_type);
                error!("watch_file_descriptor(): {}", cause);
                Err(Fail::new(libc::ENOTSUP, &cause))
            },
        }
    }

    //==================================================================================================================
    // Run Bookkeeping
    //==================================================================================================================

    fn run_handler(&self) {
        self.check_thread();
        self.pump.run(self);
    }

    fn register_run_loop(&self, state: &Rc<RunLoopState>) {
        self.live_run_loops
            .borrow_mut()
            .insert(state.id, Rc::downgrade(state));
    }

    fn unregister_run_loop(&self, id: u64) {
        self.live_run_loops.borrow_mut().remove(&id);
    }

    /// Pushes `state` on the stack of active runs and returns its depth.
    fn push_run_loop(&self, state: &Rc<RunLoopState>) -> usize {
        let mut run_loops = self.run_loops.borrow_mut();
        run_loops.push(state.clone());
        run_loops.len()
    }

    /// Pops `state` off the stack of active runs and returns the run it was nested in.
    fn pop_run_loop(&self, state: &Rc<RunLoopState>) -> Option<Rc<RunLoopState>> {
        let mut run_loops = self.run_loops.borrow_mut();
        let popped: Option<Rc<RunLoopState>> = run_loops.pop();
        debug_assert!(
            popped.as_ref().is_some_and(|popped| Rc::ptr_eq(popped, state)),
            "runs must exit in reverse order"
        );
        run_loops.last().cloned()
    }

    fn is_innermost_run(&self, state: &RunLoopState) -> bool {
        self.run_loops
            .borrow()
            .last()
            .is_some_and(|innermost| innermost.id == state.id)
    }

    fn quit_run_loop(&self, id: u64) {
        let state: Option<Rc<RunLoopState>> = self.live_run_loops.borrow().get(&id).and_then(Weak::upgrade);
        if let Some(state) = state {
            state.quit(self);
        }
    }

    fn check_thread(&self) {
        debug_assert_eq!(
            self.thread_id,
            thread::current().id(),
            "message loop used off its thread"
        );
    }

    //==================================================================================================================
    // Queue Management
    //==================================================================================================================

    /// Refills the work queue from the incoming queue, but only once it is empty.
    fn reload_work_queue(&self) {
        let mut work_queue = self.work_queue.borrow_mut();
        self.incoming_queue.reload_work_queue(&mut work_queue);
    }

    /// Runs `pending_task` unless it is non-nestable and a nested run is active, in which case it is deferred until
    /// the loop is back at the outermost run. Returns true if the task ran.
    fn defer_or_run_pending_task(&self, pending_task: PendingTask) -> bool {
        if pending_task.nestable || self.run_depth() == 1 {
            self.run_task(pending_task);
            // Show that we ran a task (Note: a new one might arrive as a consequence!).
            return true;
        }

        // We couldn't run the task now because we're in a nested run and the task isn't nestable.
        trace!(
            "defer_or_run_pending_task(): deferring non-nestable task (depth={:?}, posted_from={:?})",
            self.run_depth(),
            pending_task.posted_from
        );
        self.deferred_non_nestable_work_queue
            .borrow_mut()
            .push_back(pending_task);
        false
    }

    fn run_task(&self, mut pending_task: PendingTask) {
        debug_assert!(self.nestable_tasks_allowed.get());
        // Execute the task and assume the worst: it is probably not reentrant.
        let _execution: ScopedTaskExecution<'_> = ScopedTaskExecution::new(self);

        // Skip the observer snapshots on the common path.
        if self.task_observers.is_empty() {
            pending_task.run();
            return;
        }
        self.task_observers
            .for_each(|observer| observer.will_process_task(&pending_task));
        pending_task.run();
        self.task_observers
            .for_each(|observer| observer.did_process_task(&pending_task));
    }

    /// Runs one deferred non-nestable task, if the loop is back at the outermost run.
    fn process_next_delayed_non_nestable_task(&self) -> bool {
        if self.run_depth() != 1 {
            return false;
        }

        let pending_task: PendingTask = match self.deferred_non_nestable_work_queue.borrow_mut().pop_front() {
            Some(pending_task) => pending_task,
            None => return false,
        };
        self.run_task(pending_task);
        true
    }

    /// Discards every queued task. Returns true if there was anything to discard.
    fn delete_pending_tasks(&self) -> bool {
        let work_queue: TaskQueue = mem::take(&mut *self.work_queue.borrow_mut());
        let mut did_work: bool = !work_queue.is_empty();
        for pending_task in work_queue {
            if pending_task.delayed_run_time.is_some() {
                // Delayed tasks are deleted in the order in which they would have run, in case of any dependencies
                // between them.
                self.delayed_work_queue.borrow_mut().push(pending_task);
            } else {
                // Dropped here, with no borrow held, since its destructor may post more tasks.
                drop(pending_task);
            }
        }

        let deferred: TaskQueue = mem::take(&mut *self.deferred_non_nestable_work_queue.borrow_mut());
        did_work |= !deferred.is_empty();
        drop(deferred);

        let delayed: Vec<PendingTask> = self.delayed_work_queue.borrow_mut().drain_in_order();
        did_work |= !delayed.is_empty();
        drop(delayed);

        did_work
    }

    /// Tears the loop down. Called once, by the owning [ScopedMessageLoop].
    fn destroy(&self) {
        if !thread::panicking() {
            debug_assert!(self.run_loops.borrow().is_empty(), "message loop destroyed while running");
        }

        // Clean up any unprocessed tasks, but take care: deleting a task could result in the addition of more tasks
        // (e.g. via delete_soon()). We set a limit on the number of times we will allow a deleted task to generate
        // more tasks.
        let max_passes: usize = self.options.teardown_max_passes.max(1);
        let mut did_work: bool = false;
        for pass in 0..max_passes {
            self.delete_pending_tasks();
            self.reload_work_queue();
            // If we end up with empty queues, then break out of the loop.
            did_work = self.delete_pending_tasks();
            if !did_work {
                trace!("destroy(): queues drained after {:?} pass(es)", pass + 1);
                break;
            }
        }
        if did_work {
            error!(
                "destroy(): tasks keep posting tasks from their destructors, giving up after {:?} passes",
                max_passes
            );
        }

        // Let interested parties have one last shot at accessing this.
        self.destruction_observers
            .for_each(|observer| observer.will_destroy_current_message_loop());

        // Proxies fail from now on. Whatever slipped in is dropped without the lock held.
        let leftovers: TaskQueue = self.incoming_queue.will_destroy_current_message_loop();
        if !leftovers.is_empty() {
            warn!("destroy(): discarding {:?} late task(s)", leftovers.len());
        }
        drop(leftovers);

        // OK, now make it so that no one can find us.
        let _ = CURRENT.try_with(|current| current.borrow_mut().take());
        debug!("destroy(): destroyed message loop (type={:?})", self.loop_type);
    }
}

impl<'a> ScopedNestableTaskAllower<'a> {
    pub fn new(message_loop: &'a MessageLoop) -> Self {
        let old_state: bool = message_loop.nestable_tasks_allowed();
        message_loop.set_nestable_tasks_allowed(true);
        Self {
            message_loop,
            old_state,
        }
    }
}

impl<'a> ScopedTaskExecution<'a> {
    fn new(message_loop: &'a MessageLoop) -> Self {
        message_loop.nestable_tasks_allowed.set(false);
        Self { message_loop }
    }
}

impl ScopedMessageLoop {
    /// Returns a shared reference to the loop.
    pub fn get(&self) -> Rc<MessageLoop> {
        self.0.clone()
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        fn create_io_pump(options: &LoopOptions) -> Result<Box<dyn MessagePump>, Fail> {
            Ok(Box::new(IoPump::new(options.io_max_events)?))
        }
    } else {
        fn create_io_pump(_options: &LoopOptions) -> Result<Box<dyn MessagePump>, Fail> {
            warn!("create_io_pump(): no IO pump on this platform, using the default pump");
            Ok(Box::new(DefaultPump::new()))
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Delegate for MessageLoop {
    fn do_work(&self) -> bool {
        if !self.nestable_tasks_allowed.get() {
            // Task can't be executed right now.
            return false;
        }

        loop {
            self.reload_work_queue();
            if self.work_queue.borrow().is_empty() {
                break;
            }

            // Execute oldest task.
            loop {
                let pending_task: PendingTask = match self.work_queue.borrow_mut().pop_front() {
                    Some(pending_task) => pending_task,
                    None => break,
                };
                match pending_task.delayed_run_time {
                    Some(delayed_run_time) => {
                        let sequence_num: u64 = pending_task.sequence_num;
                        let new_earliest: bool = {
                            let mut delayed_work_queue = self.delayed_work_queue.borrow_mut();
                            delayed_work_queue.push(pending_task);
                            delayed_work_queue
                                .peek()
                                .is_some_and(|top| top.sequence_num == sequence_num)
                        };
                        // If we changed the topmost task, then it is time to reschedule.
                        if new_earliest {
                            self.pump.schedule_delayed_work(delayed_run_time);
                        }
                    },
                    None => {
                        if self.defer_or_run_pending_task(pending_task) {
                            return true;
                        }
                    },
                }
            }
        }

        // Nothing happened.
        false
    }

    fn do_delayed_work(&self, next_delayed_work_time: &mut Option<Instant>) -> bool {
        let next_run_time: Option<Instant> = if self.nestable_tasks_allowed.get() {
            self.delayed_work_queue.borrow().next_run_time()
        } else {
            None
        };
        let next_run_time: Instant = match next_run_time {
            Some(next_run_time) => next_run_time,
            None => {
                self.recent_time.set(None);
                *next_delayed_work_time = None;
                return false;
            },
        };

        // When we "fall behind", there will be a lot of tasks in the delayed work queue that are ready to run. To
        // increase efficiency when we fall behind, we will only read the clock intermittently, and then process all
        // tasks that are ready to run before reading it again.
        let stale: bool = match self.recent_time.get() {
            Some(recent_time) => next_run_time > recent_time,
            None => true,
        };
        if stale {
            let now: Instant = Instant::now();
            self.recent_time.set(Some(now));
            if next_run_time > now {
                *next_delayed_work_time = Some(next_run_time);
                return false;
            }
        }

        let pending_task: PendingTask = match self.delayed_work_queue.borrow_mut().pop() {
            Some(pending_task) => pending_task,
            None => return false,
        };
        *next_delayed_work_time = self.delayed_work_queue.borrow().next_run_time();

        self.defer_or_run_pending_task(pending_task)
    }

    fn do_idle_work(&self) -> bool {
        if self.process_next_delayed_non_nestable_task() {
            return true;
        }

        let quit_when_idle: bool = self
            .run_loops
            .borrow()
            .last()
            .is_some_and(|state| state.quit_when_idle_received.get());
        if quit_when_idle {
            self.pump.quit();
        }

        false
    }
}

impl Deref for ScopedMessageLoop {
    type Target = MessageLoop;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Drop for ScopedMessageLoop {
    fn drop(&mut self) {
        self.0.destroy();
    }
}

impl<'a> Drop for ScopedNestableTaskAllower<'a> {
    fn drop(&mut self) {
        self.message_loop.set_nestable_tasks_allowed(self.old_state);
    }
}

impl<'a> Drop for ScopedTaskExecution<'a> {
    fn drop(&mut self) {
        self.message_loop.nestable_tasks_allowed.set(true);
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
