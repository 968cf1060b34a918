// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use crate::message_loop::{
    incoming_queue::IncomingTaskQueue,
    pending_task::Location,
};
use ::std::{
    fmt,
    sync::Arc,
    thread::{
        self,
        ThreadId,
    },
    time::Duration,
};

//==============================================================================
// Structures
//==============================================================================

/// Thread-safe handle for posting tasks to a [crate::MessageLoop]. Outlives the loop: once the loop is destroyed,
/// posting fails and the task is dropped.
#[derive(Clone)]
pub struct MessageLoopProxy {
    incoming_queue: Arc<IncomingTaskQueue>,
    thread_id: ThreadId,
}

//==============================================================================
// Associate Functions
//==============================================================================

impl MessageLoopProxy {
    pub(crate) fn new(incoming_queue: Arc<IncomingTaskQueue>, thread_id: ThreadId) -> Self {
        Self {
            incoming_queue,
            thread_id,
        }
    }

    #[track_caller]
    pub fn post_task<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.incoming_queue
            .post(Location::caller(), Box::new(task), Duration::ZERO, true)
    }

    #[track_caller]
    pub fn post_delayed_task<F>(&self, task: F, delay: Duration) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.incoming_queue.post(Location::caller(), Box::new(task), delay, true)
    }

    #[track_caller]
    pub fn post_non_nestable_task<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.incoming_queue
            .post(Location::caller(), Box::new(task), Duration::ZERO, false)
    }

    #[track_caller]
    pub fn post_non_nestable_delayed_task<F>(&self, task: F, delay: Duration) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.incoming_queue.post(Location::caller(), Box::new(task), delay, false)
    }

    /// Hands `object` to the loop, which drops it from a non-nestable task.
    #[track_caller]
    pub fn delete_soon<T: Send + 'static>(&self, object: Box<T>) -> bool {
        self.post_non_nestable_task(move || drop(object))
    }

    /// Hands one reference to `object` to the loop, which releases it from a non-nestable task.
    #[track_caller]
    pub fn release_soon<T: Send + Sync + 'static>(&self, object: Arc<T>) -> bool {
        self.post_non_nestable_task(move || drop(object))
    }

    /// Returns true if called on the target loop's thread while the loop is alive.
    pub fn belongs_to_current_thread(&self) -> bool {
        self.thread_id == thread::current().id() && self.incoming_queue.is_accepting()
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

impl fmt::Debug for MessageLoopProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageLoopProxy")
            .field("thread_id", &self.thread_id)
            .field("alive", &self.incoming_queue.is_accepting())
            .finish()
    }
}
