// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Pump for IO loops. Blocks in `epoll_wait` and dispatches readiness of watched file descriptors as native events.
//! Cross-thread wake-ups go through a non-blocking self-pipe whose read end is registered with the same epoll
//! instance.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    message_pump::{
        time_until,
        Delegate,
        MessagePump,
        PumpWaker,
        ScopedKeepRunning,
    },
    runtime::fail::Fail,
};
use ::libc::{
    c_int,
    epoll_create1,
    epoll_ctl,
    epoll_event,
    epoll_wait,
    EPOLLERR,
    EPOLLHUP,
    EPOLLIN,
    EPOLLOUT,
    EPOLL_CLOEXEC,
    EPOLL_CTL_ADD,
    EPOLL_CTL_DEL,
};
use ::slab::Slab;
use ::std::{
    any::Any,
    cell::{
        Cell,
        RefCell,
    },
    io,
    os::fd::RawFd,
    rc::{
        Rc,
        Weak,
    },
    sync::Arc,
    time::{
        Duration,
        Instant,
    },
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Epoll token reserved for the wake-up pipe. Slab keys never reach this value.
const WAKEUP_TOKEN: u64 = u64::MAX;

/// Byte written to the wake-up pipe.
const WAKEUP_MESSAGE: u8 = b'W';

//======================================================================================================================
// Structures
//======================================================================================================================

/// Which readiness a watch is interested in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchMode {
    Read,
    Write,
    ReadWrite,
}

/// Receives readiness notifications for a watched file descriptor. Called on the loop's thread.
pub trait Watcher {
    fn on_file_can_read_without_blocking(&self, fd: RawFd);
    fn on_file_can_write_without_blocking(&self, fd: RawFd);
}

struct Watch {
    fd: RawFd,
    /// Distinguishes this watch from later ones that reuse its slab slot.
    generation: u64,
    mode: WatchMode,
    persistent: bool,
    watcher: Rc<dyn Watcher>,
}

/// Epoll instance plus the watches registered with it.
struct Registry {
    epoll_fd: RawFd,
    watches: Slab<Watch>,
    next_generation: u64,
}

/// Controller returned when starting to watch a file descriptor. Dropping it stops the watch.
pub struct FileDescriptorWatcher {
    registry: Weak<RefCell<Registry>>,
    key: usize,
    generation: u64,
    fd: RawFd,
}

/// Self-pipe used to wake the pump from other threads.
struct WakeupPipe {
    read_fd: RawFd,
    write_fd: RawFd,
}

/// Readiness collected from one `epoll_wait` call.
struct ReadyEvent {
    key: usize,
    generation: u64,
    fd: RawFd,
    readable: bool,
    writable: bool,
}

/// Epoll-backed pump.
pub struct IoPump {
    registry: Rc<RefCell<Registry>>,
    wakeup: Arc<WakeupPipe>,
    /// Reused by every `epoll_wait` call.
    events: RefCell<Vec<epoll_event>>,
    keep_running: Cell<bool>,
    processed_io_events: Cell<bool>,
    delayed_work_time: Cell<Option<Instant>>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl WatchMode {
    fn interest(&self) -> u32 {
        match self {
            WatchMode::Read => EPOLLIN as u32,
            WatchMode::Write => EPOLLOUT as u32,
            WatchMode::ReadWrite => (EPOLLIN | EPOLLOUT) as u32,
        }
    }

    fn wants_read(&self) -> bool {
        *self != WatchMode::Write
    }

    fn wants_write(&self) -> bool {
        *self != WatchMode::Read
    }
}

impl Registry {
    fn add(&mut self, fd: RawFd, token: u64, interest: u32) -> Result<(), Fail> {
        let mut event: epoll_event = epoll_event { events: interest, u64: token };
        match unsafe { epoll_ctl(self.epoll_fd, EPOLL_CTL_ADD, fd, &mut event) } {
            0 => Ok(()),
            _ => {
                let fail: Fail = Fail::last_os_error("failed to add file descriptor to epoll");
                error!("add(): {:?} (fd={:?})", fail, fd);
                Err(fail)
            },
        }
    }

    fn remove(&mut self, key: usize) -> Result<(), Fail> {
        let watch: Watch = match self.watches.try_remove(key) {
            Some(watch) => watch,
            None => return Err(Fail::new(libc::ENOENT, "file descriptor is not being watched")),
        };
        let mut event: epoll_event = epoll_event { events: 0, u64: 0 };
        match unsafe { epoll_ctl(self.epoll_fd, EPOLL_CTL_DEL, watch.fd, &mut event) } {
            0 => Ok(()),
            _ => {
                // The descriptor may already be closed, in which case the kernel dropped it from the set for us.
                let fail: Fail = Fail::last_os_error("failed to remove file descriptor from epoll");
                warn!("remove(): {:?} (fd={:?})", fail, watch.fd);
                Err(fail)
            },
        }
    }
}

impl FileDescriptorWatcher {
    /// Stops watching the file descriptor. Returns an error if the watch was already gone.
    pub fn stop_watching_file_descriptor(&mut self) -> Result<(), Fail> {
        let registry: Rc<RefCell<Registry>> = match self.registry.upgrade() {
            Some(registry) => registry,
            None => return Err(Fail::new(libc::ENOENT, "message loop is gone")),
        };
        self.registry = Weak::new();
        let mut registry = registry.borrow_mut();
        // The slot may have been freed by a non-persistent event and handed to a newer watch since.
        let watched: bool = matches!(
            registry.watches.get(self.key),
            Some(watch) if watch.generation == self.generation
        );
        if !watched {
            return Err(Fail::new(libc::ENOENT, "file descriptor is not being watched"));
        }
        registry.remove(self.key)
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }
}

impl WakeupPipe {
    fn new() -> Result<Self, Fail> {
        let mut fds: [c_int; 2] = [-1; 2];
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) } != 0 {
            let fail: Fail = Fail::last_os_error("could not create the wakeup pipe");
            error!("new(): {:?}", fail);
            return Err(fail);
        }
        Ok(Self {
            read_fd: fds[0],
            write_fd: fds[1],
        })
    }

    /// Empties the pipe. Any number of pending wake-ups collapse into one.
    fn drain(&self) {
        let mut buf: [u8; 64] = [0; 64];
        loop {
            let nread: isize = unsafe { libc::read(self.read_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if nread <= 0 {
                let errno: Option<i32> = io::Error::last_os_error().raw_os_error();
                if nread < 0 && errno == Some(libc::EINTR) {
                    continue;
                }
                break;
            }
        }
    }
}

impl IoPump {
    pub fn new(max_events: usize) -> Result<Self, Fail> {
        let epoll_fd: RawFd = match unsafe { epoll_create1(EPOLL_CLOEXEC) } {
            fd if fd >= 0 => fd,
            _ => {
                let fail: Fail = Fail::last_os_error("could not create epoll instance");
                error!("new(): {:?}", fail);
                return Err(fail);
            },
        };
        let mut registry: Registry = Registry {
            epoll_fd,
            watches: Slab::new(),
            next_generation: 0,
        };
        let wakeup: WakeupPipe = WakeupPipe::new()?;
        registry.add(wakeup.read_fd, WAKEUP_TOKEN, EPOLLIN as u32)?;

        Ok(Self {
            registry: Rc::new(RefCell::new(registry)),
            wakeup: Arc::new(wakeup),
            events: RefCell::new(vec![epoll_event { events: 0, u64: 0 }; max_events.max(1)]),
            keep_running: Cell::new(false),
            processed_io_events: Cell::new(false),
            delayed_work_time: Cell::new(None),
        })
    }

    /// Starts watching `fd`. Non-persistent watches are removed after delivering their first event. A descriptor may
    /// only have one watch at a time.
    pub fn watch_file_descriptor(
        &self,
        fd: RawFd,
        persistent: bool,
        mode: WatchMode,
        watcher: Rc<dyn Watcher>,
    ) -> Result<FileDescriptorWatcher, Fail> {
        let mut registry = self.registry.borrow_mut();
        if registry.watches.iter().any(|(_, watch)| watch.fd == fd) {
            let cause: String = format!("file descriptor is already being watched (fd={:?})", fd);
            error!("watch_file_descriptor(): {}", cause);
            return Err(Fail::new(libc::EEXIST, &cause));
        }

        let generation: u64 = registry.next_generation;
        registry.next_generation += 1;
        let key: usize = registry.watches.insert(Watch {
            fd,
            generation,
            mode,
            persistent,
            watcher,
        });
        if let Err(e) = registry.add(fd, key as u64, mode.interest()) {
            registry.watches.remove(key);
            return Err(e);
        }
        trace!("watch_file_descriptor(): fd={:?} mode={:?} persistent={:?}", fd, mode, persistent);

        Ok(FileDescriptorWatcher {
            registry: Rc::downgrade(&self.registry),
            key,
            generation,
            fd,
        })
    }

    /// Number of file descriptors currently watched.
    pub fn watch_count(&self) -> usize {
        self.registry.borrow().watches.len()
    }

    fn do_delayed_work(&self, delegate: &dyn Delegate) -> bool {
        let mut delayed_work_time: Option<Instant> = self.delayed_work_time.get();
        let did_work: bool = delegate.do_delayed_work(&mut delayed_work_time);
        self.delayed_work_time.set(delayed_work_time);
        did_work
    }

    /// Waits for readiness for at most `timeout` (forever if `None`) and dispatches everything that became ready.
    fn wait_for_events(&self, timeout: Option<Duration>) {
        let timeout_ms: c_int = match timeout {
            None => -1,
            // Round up so that we never wake before the deadline and spin.
            Some(timeout) => timeout
                .as_nanos()
                .div_ceil(1_000_000)
                .min(c_int::MAX as u128) as c_int,
        };

        let mut ready: Vec<ReadyEvent> = Vec::new();
        {
            // Released before dispatching, since watchers may run a nested loop that waits again.
            let mut events = self.events.borrow_mut();
            let epoll_fd: RawFd = self.registry.borrow().epoll_fd;
            let nevents: c_int =
                unsafe { epoll_wait(epoll_fd, events.as_mut_ptr(), events.len() as c_int, timeout_ms) };
            if nevents < 0 {
                let errno: Option<i32> = io::Error::last_os_error().raw_os_error();
                if errno == Some(libc::EINTR) {
                    return;
                }
                // A pump that can neither wait nor make progress would stall the thread forever.
                panic!("epoll_wait failed: {:?}", errno);
            }

            for event in &events[..nevents as usize] {
                let flags: u32 = event.events;
                let token: u64 = event.u64;
                if token == WAKEUP_TOKEN {
                    self.wakeup.drain();
                    self.processed_io_events.set(true);
                    continue;
                }
                let key: usize = token as usize;
                let (generation, fd): (u64, RawFd) = match self.registry.borrow().watches.get(key) {
                    Some(watch) => (watch.generation, watch.fd),
                    None => continue,
                };
                // Hang-ups and errors are reported as readiness so that the watcher observes them on its next call.
                let failed: bool = flags & (EPOLLHUP | EPOLLERR) as u32 != 0;
                ready.push(ReadyEvent {
                    key,
                    generation,
                    fd,
                    readable: failed || flags & EPOLLIN as u32 != 0,
                    writable: failed || flags & EPOLLOUT as u32 != 0,
                });
            }
        }

        for event in ready {
            self.dispatch(event);
        }
    }

    /// Hands one readiness event to its watcher. Watchers may add or remove watches from their callbacks, so no
    /// borrow of the registry is held while they run.
    fn dispatch(&self, event: ReadyEvent) {
        let (watcher, mode): (Rc<dyn Watcher>, WatchMode) = {
            let mut registry = self.registry.borrow_mut();
            let (watcher, mode, persistent): (Rc<dyn Watcher>, WatchMode, bool) = match registry.watches.get(event.key)
            {
                // The watch may have been removed, or its slot reused, by an earlier callback in this batch.
                Some(watch) if watch.generation == event.generation => {
                    (watch.watcher.clone(), watch.mode, watch.persistent)
                },
                _ => return,
            };
            if !persistent {
                let _ = registry.remove(event.key);
            }
            (watcher, mode)
        };

        self.processed_io_events.set(true);
        if event.writable && mode.wants_write() {
            watcher.on_file_can_write_without_blocking(event.fd);
        }
        if event.readable && mode.wants_read() {
            watcher.on_file_can_read_without_blocking(event.fd);
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Drop for FileDescriptorWatcher {
    fn drop(&mut self) {
        if self.registry.upgrade().is_some() {
            let _ = self.stop_watching_file_descriptor();
        }
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        if unsafe { libc::close(self.epoll_fd) } != 0 {
            warn!("drop(): failed to close epoll instance (fd={:?})", self.epoll_fd);
        }
    }
}

impl Drop for WakeupPipe {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}

impl PumpWaker for WakeupPipe {
    fn schedule_work(&self) {
        // This can be called on any thread, so we don't touch any state of the pump. Writing one byte is enough to
        // make a sleeping epoll_wait return.
        loop {
            let nwrite: isize =
                unsafe { libc::write(self.write_fd, &WAKEUP_MESSAGE as *const u8 as *const libc::c_void, 1) };
            if nwrite == 1 {
                return;
            }
            match io::Error::last_os_error().raw_os_error() {
                Some(libc::EINTR) => continue,
                // The pipe is full, so a wake-up is already pending.
                Some(libc::EAGAIN) => return,
                errno => panic!("could not write to the IO message loop wakeup pipe: {:?}", errno),
            }
        }
    }
}

impl MessagePump for IoPump {
    fn run(&self, delegate: &dyn Delegate) {
        let _keep_running: ScopedKeepRunning<'_> = ScopedKeepRunning::new(&self.keep_running);

        loop {
            let mut did_work: bool = delegate.do_work();
            if !self.keep_running.get() {
                break;
            }

            // Dispatch whatever is already ready without blocking.
            self.wait_for_events(Some(Duration::ZERO));
            did_work |= self.processed_io_events.replace(false);
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
                None => self.wait_for_events(None),
                Some(delayed_work_time) => match time_until(delayed_work_time) {
                    Some(delay) => self.wait_for_events(Some(delay)),
                    None => self.delayed_work_time.set(None),
                },
            }
        }
    }

    fn quit(&self) {
        debug_assert!(self.keep_running.get(), "quit() called outside of run()");
        self.keep_running.set(false);
    }

    fn schedule_work(&self) {
        self.wakeup.schedule_work();
    }

    fn schedule_delayed_work(&self, delayed_work_time: Instant) {
        // Only called on the pump's own thread, so the next wait picks up the new timeout.
        self.delayed_work_time.set(Some(delayed_work_time));
    }

    fn waker(&self) -> Arc<dyn PumpWaker> {
        self.wakeup.clone()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
