// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Single-threaded cooperative message loop.
//!
//! Every thread that wants to receive work runs one [MessageLoop]. Work arrives as posted tasks (from any thread,
//! through the loop itself or a [MessageLoopProxy]) and as native events collected by the loop's [MessagePump]. The
//! pump blocks when there is nothing to do and calls back into the loop through the narrow [Delegate] interface.

#![cfg_attr(feature = "strict", deny(warnings))]
#![deny(clippy::all)]

#[macro_use]
extern crate log;

pub mod message_loop;
pub mod message_pump;
pub mod runtime;

pub use self::{
    message_loop::{
        config::{
            Config,
            LoopOptions,
        },
        observer::{
            DestructionObserver,
            TaskObserver,
        },
        pending_task::{
            Location,
            PendingTask,
        },
        proxy::MessageLoopProxy,
        run_loop::RunLoop,
        LoopType,
        MessageLoop,
        ScopedMessageLoop,
        ScopedNestableTaskAllower,
    },
    message_pump::{
        Delegate,
        MessagePump,
        PumpWaker,
    },
    runtime::fail::Fail,
};

#[cfg(target_os = "linux")]
pub use self::message_pump::io::{
    FileDescriptorWatcher,
    WatchMode,
    Watcher,
};

//======================================================================================================================
// Macros
//======================================================================================================================

/// Ensures that two expressions are equivalent or return an Error.
#[macro_export]
macro_rules! ensure_eq {
    ($left:expr, $right:expr) => ({
        match (&$left, &$right) {
            (left_val, right_val) => {
                if !(*left_val == *right_val) {
                    anyhow::bail!(r#"ensure failed: `(left == right)`
    left: `{:?}`,
   right: `{:?}`"#, left_val, right_val)
                }
            }
        }
    });
    ($left:expr, $right:expr,) => ({
        $crate::ensure_eq!($left, $right)
    });
}

/// Ensures that two expressions are not equivalent or return an Error.
#[macro_export]
macro_rules! ensure_neq {
    ($left:expr, $right:expr) => ({
        match (&$left, &$right) {
            (left_val, right_val) => {
                if *left_val == *right_val {
                    anyhow::bail!(r#"ensure failed: `(left != right)`
    left: `{:?}`,
   right: `{:?}`"#, left_val, right_val)
                }
            }
        }
    });
    ($left:expr, $right:expr,) => ({
        $crate::ensure_neq!($left, $right)
    });
}
