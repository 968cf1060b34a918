// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use ::std::{
    cmp::{
        Ordering,
        Reverse,
    },
    collections::{
        BinaryHeap,
        VecDeque,
    },
    fmt,
    panic,
    time::Instant,
};

//==============================================================================
// Types
//==============================================================================

/// Unit of work carried by a [PendingTask]. Tasks may be posted from any thread, hence the `Send` bound.
pub type Closure = Box<dyn FnOnce() + Send + 'static>;

/// FIFO of tasks. Used both for the cross-thread incoming queue and the loop-owned work queues.
pub type TaskQueue = VecDeque<PendingTask>;

//==============================================================================
// Structures
//==============================================================================

/// Source location a task was posted from. Only used for diagnostics.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Location {
    file: &'static str,
    line: u32,
}

/// One unit of deferred work together with its scheduling metadata.
pub struct PendingTask {
    /// The work. Taken exactly once, when the task runs.
    task: Option<Closure>,
    /// Where the task was posted from.
    pub posted_from: Location,
    /// Time at which the task should run. `None` means as soon as possible.
    pub delayed_run_time: Option<Instant>,
    /// Assigned when the task enters the incoming queue. Secondary sort key for delayed tasks.
    pub sequence_num: u64,
    /// Whether the task may run inside a nested loop.
    pub nestable: bool,
}

/// Min-heap of delayed tasks, ordered by `(delayed_run_time, sequence_num)`.
#[derive(Default)]
pub struct DelayedTaskQueue {
    // Use a reverse to get a min heap.
    heap: BinaryHeap<Reverse<PendingTask>>,
}

//==============================================================================
// Associate Functions
//==============================================================================

impl Location {
    /// Captures the location of the caller. Functions that forward their caller's location are `#[track_caller]`.
    #[track_caller]
    pub fn caller() -> Self {
        let location: &'static panic::Location<'static> = panic::Location::caller();
        Self {
            file: location.file(),
            line: location.line(),
        }
    }

    pub fn file(&self) -> &'static str {
        self.file
    }

    pub fn line(&self) -> u32 {
        self.line
    }
}

impl PendingTask {
    pub fn new(posted_from: Location, task: Closure, delayed_run_time: Option<Instant>, nestable: bool) -> Self {
        Self {
            task: Some(task),
            posted_from,
            delayed_run_time,
            sequence_num: 0,
            nestable,
        }
    }

    /// Runs the underlying closure. A task that already ran is left untouched.
    pub fn run(&mut self) {
        match self.task.take() {
            Some(task) => task(),
            None => warn!("run(): task from {:?} already ran", self.posted_from),
        }
    }

    /// Returns true if the task has already been run.
    pub fn has_run(&self) -> bool {
        self.task.is_none()
    }
}

impl DelayedTaskQueue {
    pub fn push(&mut self, task: PendingTask) {
        debug_assert!(task.delayed_run_time.is_some(), "only delayed tasks go into the delayed queue");
        self.heap.push(Reverse(task));
    }

    /// Earliest task, if any.
    pub fn peek(&self) -> Option<&PendingTask> {
        self.heap.peek().map(|Reverse(task)| task)
    }

    pub fn pop(&mut self) -> Option<PendingTask> {
        self.heap.pop().map(|Reverse(task)| task)
    }

    /// Run time of the earliest task, if any.
    pub fn next_run_time(&self) -> Option<Instant> {
        self.peek().and_then(|task| task.delayed_run_time)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Pops every task in run order. Used when discarding tasks so that they are dropped in the order they would
    /// have run.
    pub fn drain_in_order(&mut self) -> Vec<PendingTask> {
        let mut tasks: Vec<PendingTask> = Vec::with_capacity(self.heap.len());
        while let Some(task) = self.pop() {
            tasks.push(task);
        }
        tasks
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

impl fmt::Debug for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

impl fmt::Debug for PendingTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingTask")
            .field("posted_from", &self.posted_from)
            .field("delayed_run_time", &self.delayed_run_time)
            .field("sequence_num", &self.sequence_num)
            .field("nestable", &self.nestable)
            .field("has_run", &self.has_run())
            .finish()
    }
}

impl PartialEq for PendingTask {
    fn eq(&self, other: &PendingTask) -> bool {
        self.delayed_run_time == other.delayed_run_time && self.sequence_num == other.sequence_num
    }
}

impl Eq for PendingTask {}

impl PartialOrd for PendingTask {
    fn partial_cmp(&self, other: &PendingTask) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendingTask {
    fn cmp(&self, other: &PendingTask) -> Ordering {
        // Sequence numbers break ties so that equally-due tasks run in post order.
        self.delayed_run_time
            .cmp(&other.delayed_run_time)
            .then_with(|| self.sequence_num.cmp(&other.sequence_num))
    }
}

//==============================================================================
// Unit Tests
//==============================================================================
