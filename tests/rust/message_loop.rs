// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use ::anyhow::Result;
use ::crossbeam_channel::{
    Receiver,
    Sender,
};
use ::messageloop::{
    runtime::logging,
    LoopType,
    MessageLoop,
    MessageLoopProxy,
    MessagePump,
    RunLoop,
    ScopedMessageLoop,
    ScopedNestableTaskAllower,
};
use ::std::{
    rc::Rc,
    sync::{
        atomic::{
            AtomicUsize,
            Ordering,
        },
        Arc,
        Mutex,
    },
    thread,
    time::{
        Duration,
        Instant,
    },
};

//==============================================================================
// Helpers
//==============================================================================

type Log = Arc<Mutex<Vec<String>>>;

fn record(log: &Log, entry: &str) -> impl FnOnce() + Send + 'static {
    let log: Log = log.clone();
    let entry: String = entry.to_string();
    move || log.lock().unwrap().push(entry)
}

fn entries(log: &Log) -> Vec<String> {
    log.lock().unwrap().clone()
}

fn quit_current() {
    if let Some(message_loop) = MessageLoop::current() {
        message_loop.quit_now();
    }
}

/// Counts how many times it is dropped.
struct DropCounter(Arc<AtomicUsize>);

impl Drop for DropCounter {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

//==============================================================================
// Task Ordering
//==============================================================================

/// Tasks posted without delay run in the order in which they were posted.
#[test]
fn immediate_tasks_run_in_post_order() -> Result<()> {
    logging::initialize();
    let message_loop: ScopedMessageLoop = MessageLoop::new(LoopType::Default)?;
    let log: Log = Log::default();
    for i in 0..10 {
        message_loop.post_task(record(&log, &i.to_string()));
    }

    message_loop.run_until_idle();
    let expected: Vec<String> = (0..10).map(|i| i.to_string()).collect();
    messageloop::ensure_eq!(entries(&log), expected);
    Ok(())
}

/// A delayed task never runs before an immediate task posted after it.
#[test]
fn delayed_task_yields_to_immediate_tasks() -> Result<()> {
    let message_loop: ScopedMessageLoop = MessageLoop::new(LoopType::Default)?;
    let log: Log = Log::default();
    message_loop.post_task(record(&log, "x"));
    message_loop.post_delayed_task(record(&log, "y"), Duration::from_millis(20));
    message_loop.post_task(record(&log, "z"));
    message_loop.post_delayed_task(quit_current, Duration::from_millis(40));

    let start: Instant = Instant::now();
    message_loop.run();
    messageloop::ensure_eq!(entries(&log), vec!["x", "z", "y"]);
    messageloop::ensure_eq!(start.elapsed() >= Duration::from_millis(40), true);
    Ok(())
}

/// Delayed tasks run by due time and, for equal due times, by post order.
#[test]
fn delayed_tasks_run_by_due_time() -> Result<()> {
    let message_loop: ScopedMessageLoop = MessageLoop::new(LoopType::Default)?;
    let log: Log = Log::default();
    message_loop.post_delayed_task(record(&log, "30"), Duration::from_millis(30));
    message_loop.post_delayed_task(record(&log, "10"), Duration::from_millis(10));
    message_loop.post_delayed_task(record(&log, "20"), Duration::from_millis(20));
    message_loop.post_delayed_task(quit_current, Duration::from_millis(50));

    message_loop.run();
    messageloop::ensure_eq!(entries(&log), vec!["10", "20", "30"]);
    Ok(())
}

/// Every posted task runs at most once.
#[test]
fn tasks_run_at_most_once() -> Result<()> {
    let message_loop: ScopedMessageLoop = MessageLoop::new(LoopType::Default)?;
    let runs: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));
    for _ in 0..100 {
        let runs: Arc<AtomicUsize> = runs.clone();
        message_loop.post_task(move || {
            runs.fetch_add(1, Ordering::SeqCst);
        });
    }

    message_loop.run_until_idle();
    message_loop.run_until_idle();
    messageloop::ensure_eq!(runs.load(Ordering::SeqCst), 100);
    Ok(())
}

//==============================================================================
// Run Control
//==============================================================================

/// run_until_idle() returns once nothing is due, leaving future work queued.
#[test]
fn run_until_idle_leaves_future_work_queued() -> Result<()> {
    let message_loop: ScopedMessageLoop = MessageLoop::new(LoopType::Default)?;
    let log: Log = Log::default();
    message_loop.post_task(record(&log, "now"));
    message_loop.post_delayed_task(record(&log, "later"), Duration::from_secs(3600));

    let start: Instant = Instant::now();
    message_loop.run_until_idle();
    messageloop::ensure_eq!(start.elapsed() < Duration::from_secs(1), true);
    messageloop::ensure_eq!(entries(&log), vec!["now"]);
    messageloop::ensure_eq!(message_loop.is_running(), false);
    Ok(())
}

/// quit_when_idle() lets pending work finish before the run returns.
#[test]
fn quit_when_idle_finishes_pending_work() -> Result<()> {
    let message_loop: ScopedMessageLoop = MessageLoop::new(LoopType::Default)?;
    let log: Log = Log::default();
    message_loop.post_task(MessageLoop::quit_when_idle_closure());
    message_loop.post_task(record(&log, "a"));
    message_loop.post_task(record(&log, "b"));

    message_loop.run();
    messageloop::ensure_eq!(entries(&log), vec!["a", "b"]);
    Ok(())
}

/// Tasks running in a nested run see the nesting, and non-nestable tasks wait for the outermost run.
#[test]
fn nested_run_defers_non_nestable_tasks() -> Result<()> {
    let message_loop: ScopedMessageLoop = MessageLoop::new(LoopType::Default)?;
    let log: Log = Log::default();
    let task_log: Log = log.clone();
    message_loop.post_task(move || {
        let message_loop: Rc<MessageLoop> = MessageLoop::current().unwrap();
        message_loop.post_non_nestable_task(record(&task_log, "non-nestable"));
        let nested_log: Log = task_log.clone();
        message_loop.post_task(move || {
            let nested: bool = MessageLoop::current().unwrap().is_nested();
            nested_log.lock().unwrap().push(format!("nested={}", nested));
        });

        let _allow: ScopedNestableTaskAllower<'_> = ScopedNestableTaskAllower::new(&message_loop);
        RunLoop::new().run_until_idle();
        task_log.lock().unwrap().push("nested run returned".to_string());
    });

    message_loop.run_until_idle();
    messageloop::ensure_eq!(
        entries(&log),
        vec!["nested=true", "nested run returned", "non-nestable"]
    );
    Ok(())
}

/// A non-nestable delayed task that comes due during a nested run waits for the outermost run.
#[test]
fn non_nestable_delayed_task_waits_for_outer_run() -> Result<()> {
    let message_loop: ScopedMessageLoop = MessageLoop::new(LoopType::Default)?;
    let log: Log = Log::default();
    let task_log: Log = log.clone();
    message_loop.post_task(move || {
        let message_loop: Rc<MessageLoop> = MessageLoop::current().unwrap();
        let depth_log: Log = task_log.clone();
        message_loop.post_non_nestable_delayed_task(
            move || {
                let depth: usize = MessageLoop::current().unwrap().run_depth();
                depth_log.lock().unwrap().push(format!("depth={}", depth));
            },
            Duration::from_millis(10),
        );

        let _allow: ScopedNestableTaskAllower<'_> = ScopedNestableTaskAllower::new(&message_loop);
        let nested: RunLoop = RunLoop::new();
        // Stays in the nested run well past the delayed task's due time.
        message_loop.post_delayed_task(nested.quit_closure(), Duration::from_millis(40));
        nested.run();
        task_log.lock().unwrap().push("nested run returned".to_string());
    });

    message_loop.run_until_idle();
    messageloop::ensure_eq!(entries(&log), vec!["nested run returned", "depth=1"]);
    Ok(())
}

/// A quit closure outlives its run loop without harm.
#[test]
fn stale_quit_closure_is_harmless() -> Result<()> {
    let message_loop: ScopedMessageLoop = MessageLoop::new(LoopType::Default)?;
    let quit = {
        let run_loop: RunLoop = RunLoop::new();
        run_loop.quit_closure()
    };
    let log: Log = Log::default();
    message_loop.post_task(quit);
    message_loop.post_task(record(&log, "still runs"));

    message_loop.run_until_idle();
    messageloop::ensure_eq!(entries(&log), vec!["still runs"]);
    Ok(())
}

//==============================================================================
// Cross-Thread Posting
//==============================================================================

/// A task posted from another thread wakes up a blocked loop promptly.
#[test]
fn post_from_other_thread_wakes_blocked_loop() -> Result<()> {
    let message_loop: ScopedMessageLoop = MessageLoop::new(LoopType::Default)?;
    let proxy: MessageLoopProxy = message_loop.message_loop_proxy();
    let (tx, rx): (Sender<Duration>, Receiver<Duration>) = crossbeam_channel::unbounded();

    let poster: thread::JoinHandle<bool> = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        let posted_at: Instant = Instant::now();
        proxy.post_task(move || {
            tx.send(posted_at.elapsed()).unwrap();
            quit_current();
        })
    });

    message_loop.run();
    messageloop::ensure_eq!(poster.join().unwrap(), true);
    let latency: Duration = rx.try_recv()?;
    messageloop::ensure_eq!(latency < Duration::from_millis(100), true);
    Ok(())
}

/// A loop running on its own thread executes the work of many posting threads.
#[test]
fn loop_thread_serves_many_posters() -> Result<()> {
    let (proxy_tx, proxy_rx): (Sender<MessageLoopProxy>, Receiver<MessageLoopProxy>) = crossbeam_channel::bounded(1);
    let (done_tx, done_rx): (Sender<usize>, Receiver<usize>) = crossbeam_channel::unbounded();

    let loop_thread: thread::JoinHandle<Result<(), String>> = thread::spawn(move || {
        let message_loop: ScopedMessageLoop = MessageLoop::new(LoopType::Default).map_err(|e| e.cause)?;
        proxy_tx.send(message_loop.message_loop_proxy()).map_err(|e| e.to_string())?;
        message_loop.run();
        Ok(())
    });
    let proxy: MessageLoopProxy = proxy_rx.recv()?;
    messageloop::ensure_eq!(proxy.belongs_to_current_thread(), false);

    let posters: Vec<thread::JoinHandle<()>> = (0..4)
        .map(|i| {
            let proxy: MessageLoopProxy = proxy.clone();
            let done_tx: Sender<usize> = done_tx.clone();
            thread::spawn(move || {
                for j in 0..25 {
                    let done_tx: Sender<usize> = done_tx.clone();
                    assert!(proxy.post_task(move || done_tx.send(i * 25 + j).unwrap()));
                }
            })
        })
        .collect();
    for poster in posters {
        poster.join().unwrap();
    }

    let mut seen: Vec<usize> = (0..100).map(|_| done_rx.recv_timeout(Duration::from_secs(5))).collect::<Result<_, _>>()?;
    seen.sort_unstable();
    messageloop::ensure_eq!(seen, (0..100).collect::<Vec<usize>>());

    messageloop::ensure_eq!(proxy.post_task(quit_current), true);
    match loop_thread.join() {
        Ok(Ok(())) => (),
        Ok(Err(e)) => anyhow::bail!("loop thread failed: {}", e),
        Err(_) => anyhow::bail!("loop thread panicked"),
    }

    // The loop is gone now.
    let dropped: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));
    let counter: DropCounter = DropCounter(dropped.clone());
    messageloop::ensure_eq!(proxy.post_task(move || drop(counter)), false);
    messageloop::ensure_eq!(dropped.load(Ordering::SeqCst), 1);
    Ok(())
}

//==============================================================================
// Destruction
//==============================================================================

/// Destroying a loop discards queued tasks without running them, including tasks posted by their destructors.
#[test]
fn destruction_discards_pending_tasks() -> Result<()> {
    struct Chain {
        dropped: Arc<AtomicUsize>,
        next: Option<Box<Chain>>,
    }

    impl Drop for Chain {
        fn drop(&mut self) {
            self.dropped.fetch_add(1, Ordering::SeqCst);
            if let (Some(next), Some(message_loop)) = (self.next.take(), MessageLoop::current()) {
                message_loop.delete_soon(next);
            }
        }
    }

    let message_loop: ScopedMessageLoop = MessageLoop::new(LoopType::Default)?;
    let dropped: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));
    let mut chain: Option<Box<Chain>> = None;
    for _ in 0..5 {
        chain = Some(Box::new(Chain {
            dropped: dropped.clone(),
            next: chain.take(),
        }));
    }
    let ran: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));
    let ran_ref: Arc<AtomicUsize> = ran.clone();
    message_loop.post_task(move || {
        ran_ref.fetch_add(1, Ordering::SeqCst);
    });
    if let Some(chain) = chain {
        message_loop.delete_soon(chain);
    }
    let released: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));
    message_loop.release_soon(Arc::new(DropCounter(released.clone())));

    drop(message_loop);
    messageloop::ensure_eq!(ran.load(Ordering::SeqCst), 0);
    messageloop::ensure_eq!(dropped.load(Ordering::SeqCst), 5);
    messageloop::ensure_eq!(released.load(Ordering::SeqCst), 1);
    messageloop::ensure_eq!(MessageLoop::current().is_none(), true);
    Ok(())
}

/// delete_soon() drops the object from the loop once it runs.
#[test]
fn delete_soon_drops_on_the_loop() -> Result<()> {
    let message_loop: ScopedMessageLoop = MessageLoop::new(LoopType::Default)?;
    let dropped: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));
    message_loop.delete_soon(Box::new(DropCounter(dropped.clone())));
    messageloop::ensure_eq!(dropped.load(Ordering::SeqCst), 0);

    message_loop.run_until_idle();
    messageloop::ensure_eq!(dropped.load(Ordering::SeqCst), 1);
    Ok(())
}

//==============================================================================
// Loop Types
//==============================================================================

static UI_PUMPS_CREATED: AtomicUsize = AtomicUsize::new(0);

fn create_ui_pump() -> Result<Box<dyn MessagePump>, messageloop::Fail> {
    UI_PUMPS_CREATED.fetch_add(1, Ordering::SeqCst);
    Ok(Box::new(messageloop::message_pump::default::DefaultPump::new()))
}

/// UI loops get their pump from the registered factory, which can only be registered once.
#[test]
fn ui_loop_uses_registered_factory() -> Result<()> {
    messageloop::ensure_eq!(MessageLoop::init_message_pump_for_ui_factory(create_ui_pump), true);
    messageloop::ensure_eq!(MessageLoop::init_message_pump_for_ui_factory(create_ui_pump), false);

    let message_loop: ScopedMessageLoop = MessageLoop::new(LoopType::Ui)?;
    messageloop::ensure_eq!(message_loop.is_type(LoopType::Ui), true);
    messageloop::ensure_eq!(UI_PUMPS_CREATED.load(Ordering::SeqCst), 1);

    let log: Log = Log::default();
    message_loop.post_task(record(&log, "ui"));
    message_loop.run_until_idle();
    messageloop::ensure_eq!(entries(&log), vec!["ui"]);
    Ok(())
}

#[cfg(target_os = "linux")]
mod io {
    use ::anyhow::Result;
    use ::crossbeam_channel::{
        Receiver,
        Sender,
    };
    use ::messageloop::{
        FileDescriptorWatcher,
        LoopType,
        MessageLoop,
        MessageLoopProxy,
        ScopedMessageLoop,
        WatchMode,
        Watcher,
    };
    use ::std::{
        cell::RefCell,
        io::{
            Read,
            Write,
        },
        os::{
            fd::{
                AsRawFd,
                RawFd,
            },
            unix::net::UnixStream,
        },
        rc::Rc,
        time::{
            Duration,
            Instant,
        },
    };

    /// Reads whatever is available, then quits the loop.
    struct Reader {
        stream: RefCell<UnixStream>,
        received: RefCell<Vec<u8>>,
    }

    impl Watcher for Reader {
        fn on_file_can_read_without_blocking(&self, _fd: RawFd) {
            let mut buf: [u8; 64] = [0; 64];
            if let Ok(n) = self.stream.borrow_mut().read(&mut buf) {
                self.received.borrow_mut().extend_from_slice(&buf[..n]);
            }
            super::quit_current();
        }

        fn on_file_can_write_without_blocking(&self, _fd: RawFd) {}
    }

    /// An IO loop dispatches readiness of watched descriptors alongside posted tasks.
    #[test]
    fn io_loop_dispatches_readable_descriptor() -> Result<()> {
        let message_loop: ScopedMessageLoop = MessageLoop::new(LoopType::Io)?;
        let (mut writer, reader): (UnixStream, UnixStream) = UnixStream::pair()?;
        reader.set_nonblocking(true)?;
        let fd: RawFd = reader.as_raw_fd();
        let watcher: Rc<Reader> = Rc::new(Reader {
            stream: RefCell::new(reader),
            received: RefCell::new(Vec::new()),
        });
        let _controller: FileDescriptorWatcher =
            message_loop.watch_file_descriptor(fd, false, WatchMode::Read, watcher.clone())?;

        let proxy: MessageLoopProxy = message_loop.message_loop_proxy();
        let writer_thread = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            writer.write_all(b"ping").unwrap();
            writer
        });
        // Keep a task in flight as well, to make sure both kinds of work get through.
        messageloop::ensure_eq!(proxy.post_task(|| {}), true);

        message_loop.run();
        let _writer: UnixStream = writer_thread.join().unwrap();
        messageloop::ensure_eq!(watcher.received.borrow().as_slice(), b"ping");
        Ok(())
    }

    /// A task posted from another thread wakes up an IO loop blocked in epoll.
    #[test]
    fn post_from_other_thread_wakes_blocked_io_loop() -> Result<()> {
        let message_loop: ScopedMessageLoop = MessageLoop::new(LoopType::Io)?;
        let proxy: MessageLoopProxy = message_loop.message_loop_proxy();
        let (tx, rx): (Sender<Duration>, Receiver<Duration>) = crossbeam_channel::unbounded();

        let poster: std::thread::JoinHandle<bool> = std::thread::spawn(move || {
            // Long enough for the loop to run out of work and block.
            std::thread::sleep(Duration::from_millis(20));
            let posted_at: Instant = Instant::now();
            proxy.post_task(move || {
                tx.send(posted_at.elapsed()).unwrap();
                super::quit_current();
            })
        });

        message_loop.run();
        messageloop::ensure_eq!(poster.join().unwrap(), true);
        let latency: Duration = rx.try_recv()?;
        messageloop::ensure_eq!(latency < Duration::from_millis(100), true);
        Ok(())
    }

    /// Only IO loops watch file descriptors.
    #[test]
    fn default_loop_rejects_watches() -> Result<()> {
        let message_loop: ScopedMessageLoop = MessageLoop::new(LoopType::Default)?;
        let (_writer, reader): (UnixStream, UnixStream) = UnixStream::pair()?;
        let watcher: Rc<dyn Watcher> = Rc::new(Reader {
            stream: RefCell::new(reader.try_clone()?),
            received: RefCell::new(Vec::new()),
        });
        match message_loop.watch_file_descriptor(reader.as_raw_fd(), true, WatchMode::Read, watcher) {
            Ok(_) => anyhow::bail!("watching should fail on a default loop"),
            Err(e) => messageloop::ensure_eq!(e.errno, libc::ENOTSUP),
        }
        Ok(())
    }
}
