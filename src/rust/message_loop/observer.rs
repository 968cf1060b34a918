// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use crate::message_loop::pending_task::PendingTask;
use ::std::{
    cell::RefCell,
    rc::Rc,
};

//==============================================================================
// Traits
//==============================================================================

/// Notified around every task the loop runs.
pub trait TaskObserver {
    fn will_process_task(&self, pending_task: &PendingTask);
    fn did_process_task(&self, pending_task: &PendingTask);
}

/// Notified once, when the loop is being destroyed and after all pending tasks have been discarded. The loop is
/// still reachable through [crate::MessageLoop::current] during this call.
pub trait DestructionObserver {
    fn will_destroy_current_message_loop(&self);
}

//==============================================================================
// Structures
//==============================================================================

/// List of observers that may be modified while it is being notified. Notification walks a snapshot, so observers
/// added during a notification are first called on the next one, and removed observers may still receive the
/// notification in progress.
pub struct ObserverList<T: ?Sized> {
    observers: RefCell<Vec<Rc<T>>>,
}

//==============================================================================
// Associate Functions
//==============================================================================

impl<T: ?Sized> ObserverList<T> {
    pub fn new() -> Self {
        Self {
            observers: RefCell::new(Vec::new()),
        }
    }

    /// Adds `observer`. Adding an observer twice is a no-op.
    pub fn add_observer(&self, observer: Rc<T>) {
        let mut observers = self.observers.borrow_mut();
        if !observers.iter().any(|o| Rc::ptr_eq(o, &observer)) {
            observers.push(observer);
        }
    }

    pub fn remove_observer(&self, observer: &Rc<T>) {
        self.observers.borrow_mut().retain(|o| !Rc::ptr_eq(o, observer));
    }

    pub fn has_observer(&self, observer: &Rc<T>) -> bool {
        self.observers.borrow().iter().any(|o| Rc::ptr_eq(o, observer))
    }

    pub fn is_empty(&self) -> bool {
        self.observers.borrow().is_empty()
    }

    /// Calls `f` on every observer registered when the call starts.
    pub fn for_each<F: FnMut(&T)>(&self, mut f: F) {
        let snapshot: Vec<Rc<T>> = self.observers.borrow().clone();
        for observer in snapshot.iter() {
            f(observer.as_ref());
        }
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

impl<T: ?Sized> Default for ObserverList<T> {
    fn default() -> Self {
        Self::new()
    }
}

//==============================================================================
// Unit Tests
//==============================================================================
