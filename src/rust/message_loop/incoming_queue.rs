// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    message_loop::pending_task::{
        Closure,
        Location,
        PendingTask,
        TaskQueue,
    },
    message_pump::PumpWaker,
};
use ::std::{
    mem,
    sync::{
        Arc,
        Mutex,
        MutexGuard,
        PoisonError,
    },
    time::{
        Duration,
        Instant,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

struct IncomingState {
    queue: TaskQueue,
    next_sequence_num: u64,
    /// Cleared when the owning loop is destroyed. Posts are rejected from then on.
    accepting: bool,
}

/// The only part of a loop shared between threads. Any thread may push; only the owning loop drains.
pub struct IncomingTaskQueue {
    state: Mutex<IncomingState>,
    waker: Arc<dyn PumpWaker>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl IncomingTaskQueue {
    pub fn new(waker: Arc<dyn PumpWaker>) -> Self {
        Self {
            state: Mutex::new(IncomingState {
                queue: TaskQueue::new(),
                next_sequence_num: 0,
                accepting: true,
            }),
            waker,
        }
    }

    /// Wraps `task` into a [PendingTask] and enqueues it. Returns false, dropping the task, if the owning loop is
    /// gone.
    pub fn post(&self, posted_from: Location, task: Closure, delay: Duration, nestable: bool) -> bool {
        let pending_task: PendingTask =
            PendingTask::new(posted_from, task, Self::calculate_delayed_runtime(delay), nestable);
        self.add_to_incoming_queue(pending_task)
    }

    /// Computes the run time for a task posted with `delay`. A zero delay means run as soon as possible.
    pub fn calculate_delayed_runtime(delay: Duration) -> Option<Instant> {
        if delay.is_zero() {
            None
        } else {
            Some(Instant::now() + delay)
        }
    }

    /// Possibly called on a background thread!
    fn add_to_incoming_queue(&self, mut pending_task: PendingTask) -> bool {
        // Every task goes through this queue, even the ones posted by the owning thread. Short-circuiting those
        // would starve tasks posted by other threads.
        {
            let mut state: MutexGuard<'_, IncomingState> = self.lock();
            if !state.accepting {
                // The task may post from its destructor, so drop it only after releasing the lock.
                drop(state);
                trace!("add_to_incoming_queue(): loop is gone, dropping task from {:?}", pending_task.posted_from);
                drop(pending_task);
                return false;
            }

            // The sequence number is used for delayed tasks (to facilitate FIFO sorting when two tasks have the same
            // run time) and for identifying the task in diagnostics.
            pending_task.sequence_num = state.next_sequence_num;
            state.next_sequence_num += 1;

            let was_empty: bool = state.queue.is_empty();
            state.queue.push_back(pending_task);
            if !was_empty {
                // Someone else already woke the pump.
                return true;
            }
        }

        // Never call into the pump with the lock held: the woken loop may run a task that destroys it.
        self.waker.schedule_work();
        true
    }

    /// Moves everything from the incoming queue into `work_queue` if the latter is empty. Constant time.
    pub fn reload_work_queue(&self, work_queue: &mut TaskQueue) {
        // Waiting until the work queue is empty reduces the number of lock acquisitions per task significantly when
        // the queues get large.
        if !work_queue.is_empty() {
            return;
        }

        let mut state: MutexGuard<'_, IncomingState> = self.lock();
        if state.queue.is_empty() {
            return;
        }
        mem::swap(&mut state.queue, work_queue);
    }

    pub fn is_empty(&self) -> bool {
        self.lock().queue.is_empty()
    }

    pub fn is_accepting(&self) -> bool {
        self.lock().accepting
    }

    /// Stops accepting tasks and hands back whatever is still queued. The caller drops the leftovers without holding
    /// the lock.
    pub fn will_destroy_current_message_loop(&self) -> TaskQueue {
        let mut state: MutexGuard<'_, IncomingState> = self.lock();
        state.accepting = false;
        mem::take(&mut state.queue)
    }

    fn lock(&self) -> MutexGuard<'_, IncomingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
