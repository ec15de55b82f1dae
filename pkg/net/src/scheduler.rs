use std::collections::{HashMap, VecDeque};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use common::errors::*;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Readable,
    Writable,
}

/// Single-threaded cooperative I/O scheduler: one-shot readable/writable
/// watches with optional per-watch deadlines, timers, a cross-thread task
/// queue behind an eventfd wakeup, and reference-counted liveness.
///
/// `run_loop` returns once the reference count drops to zero; every live
/// queued task, timer and I/O watch contributes one reference.
pub struct Scheduler {
    shared: Arc<Shared>,
}

struct Shared {
    epoll_fd: RawFd,
    event_fd: RawFd,
    state: Mutex<State>,
    refs: AtomicUsize,
    break_requested: AtomicBool,
}

struct State {
    tasks: VecDeque<Task>,
    /// Sorted by deadline ascending; equal deadlines keep insertion order.
    timers: Vec<Arc<Timer>>,
    watchers: HashMap<RawFd, Arc<Watcher>>,
}

struct Timer {
    when: Instant,
    task: Mutex<Option<Task>>,
}

struct Watcher {
    fd: RawFd,
    deadline: Option<Instant>,
    task: Mutex<Option<Task>>,
    timeout_task: Mutex<Option<Task>>,
}

impl Scheduler {
    pub fn new() -> Result<Self> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(errno_error("epoll_create1"));
        }

        let event_fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if event_fd < 0 {
            unsafe { libc::close(epoll_fd) };
            return Err(errno_error("eventfd"));
        }

        let mut event = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: event_fd as u64,
        };
        let rv = unsafe { libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_ADD, event_fd, &mut event) };
        if rv < 0 {
            unsafe {
                libc::close(event_fd);
                libc::close(epoll_fd);
            }
            return Err(errno_error("epoll_ctl"));
        }

        Ok(Self {
            shared: Arc::new(Shared {
                epoll_fd,
                event_fd,
                state: Mutex::new(State {
                    tasks: VecDeque::new(),
                    timers: vec![],
                    watchers: HashMap::new(),
                }),
                refs: AtomicUsize::new(0),
                break_requested: AtomicBool::new(false),
            }),
        })
    }

    /// Number of live references (queued tasks, timers, watches, pins).
    pub fn reference_count(&self) -> usize {
        self.shared.refs.load(Ordering::Acquire)
    }

    /// Pins the loop alive until the returned guard is dropped.
    pub fn retain(&self) -> LoopRef {
        self.shared.add_ref();
        LoopRef {
            shared: self.shared.clone(),
        }
    }

    /// Enqueues a task; safe from any thread.
    pub fn execute(&self, task: impl FnOnce() + Send + 'static) {
        // The reference is taken before the task becomes visible to the
        // loop thread, which releases it on dispatch.
        self.shared.add_ref();
        {
            let mut state = self.shared.state.lock().unwrap();
            state.tasks.push_back(Box::new(task));
        }
        self.shared.wakeup();
    }

    pub fn execute_after(&self, delay: Duration, task: impl FnOnce() + Send + 'static) -> TimerHandle {
        self.insert_timer(Instant::now() + delay, Box::new(task))
    }

    pub fn execute_at(&self, when: Instant, task: impl FnOnce() + Send + 'static) -> TimerHandle {
        self.insert_timer(when, Box::new(task))
    }

    fn insert_timer(&self, when: Instant, task: Task) -> TimerHandle {
        let timer = Arc::new(Timer {
            when,
            task: Mutex::new(Some(task)),
        });

        self.shared.add_ref();
        {
            let mut state = self.shared.state.lock().unwrap();
            // Insert after all timers with an earlier-or-equal deadline so
            // equal deadlines fire in registration order.
            let at = state
                .timers
                .iter()
                .position(|t| t.when > when)
                .unwrap_or(state.timers.len());
            state.timers.insert(at, timer.clone());
        }
        self.shared.wakeup();

        TimerHandle {
            shared: Arc::downgrade(&self.shared),
            timer: Arc::downgrade(&timer),
        }
    }

    /// Arms a one-shot readable watch on `fd`. When the fd becomes
    /// readable the task runs and the watch is dropped; if the timeout
    /// expires first, only the timeout callback runs.
    pub fn execute_on_readable(
        &self,
        fd: RawFd,
        task: Task,
        timeout: Option<(Duration, Task)>,
    ) -> Result<WatchHandle> {
        self.create_watcher(Mode::Readable, fd, task, timeout)
    }

    /// Writable-side counterpart of `execute_on_readable`.
    pub fn execute_on_writable(
        &self,
        fd: RawFd,
        task: Task,
        timeout: Option<(Duration, Task)>,
    ) -> Result<WatchHandle> {
        self.create_watcher(Mode::Writable, fd, task, timeout)
    }

    fn create_watcher(
        &self,
        mode: Mode,
        fd: RawFd,
        task: Task,
        timeout: Option<(Duration, Task)>,
    ) -> Result<WatchHandle> {
        let (deadline, timeout_task) = match timeout {
            Some((delay, task)) => (Some(Instant::now() + delay), Some(task)),
            None => (None, None),
        };

        let watcher = Arc::new(Watcher {
            fd,
            deadline,
            task: Mutex::new(Some(task)),
            timeout_task: Mutex::new(timeout_task),
        });

        self.shared.add_ref();
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.watchers.contains_key(&fd) {
                drop(state);
                self.shared.release_ref();
                return Err(format_err!("already watching file descriptor {}", fd));
            }

            let events = match mode {
                Mode::Readable => libc::EPOLLIN,
                Mode::Writable => libc::EPOLLOUT,
            } as u32
                | libc::EPOLLONESHOT as u32;

            let mut event = libc::epoll_event {
                events,
                u64: fd as u64,
            };
            let rv = unsafe {
                libc::epoll_ctl(self.shared.epoll_fd, libc::EPOLL_CTL_ADD, fd, &mut event)
            };
            if rv < 0 {
                drop(state);
                self.shared.release_ref();
                return Err(errno_error("epoll_ctl"));
            }

            state.watchers.insert(fd, watcher.clone());
        }
        self.shared.wakeup();

        Ok(WatchHandle {
            shared: Arc::downgrade(&self.shared),
            watcher: Arc::downgrade(&watcher),
        })
    }

    /// Runs `task` on this loop once `wakeup` passes `generation`.
    pub fn execute_on_wakeup(&self, task: Task, wakeup: &Wakeup, generation: u64) {
        let shared = self.shared.clone();
        wakeup.on_wakeup(
            generation,
            Box::new(move || {
                Shared::execute_boxed(&shared, task);
            }),
        );
    }

    /// Runs until the reference count reaches zero or `break_loop` is
    /// called.
    pub fn run_loop(&self) {
        self.shared.break_requested.store(false, Ordering::Release);
        while self.shared.refs.load(Ordering::Acquire) > 0
            && !self.shared.break_requested.load(Ordering::Acquire)
        {
            self.poll_once();
        }
    }

    /// Runs one poll/dispatch cycle.
    pub fn run_loop_once(&self) {
        self.poll_once();
    }

    /// Interrupts `run_loop` from any thread.
    pub fn break_loop(&self) {
        self.shared.break_requested.store(true, Ordering::Release);
        self.shared.wakeup();
    }

    fn poll_once(&self) {
        let timeout_ms = self.poll_timeout_ms();

        let mut events = [libc::epoll_event { events: 0, u64: 0 }; 128];
        let n = loop {
            let rv = unsafe {
                libc::epoll_wait(
                    self.shared.epoll_fd,
                    events.as_mut_ptr(),
                    events.len() as libc::c_int,
                    timeout_ms,
                )
            };
            if rv >= 0 {
                break rv as usize;
            }
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            if errno != libc::EINTR {
                error!("epoll_wait: {}", std::io::Error::last_os_error());
                break 0;
            }
        };

        let mut ready: Vec<Task> = vec![];
        {
            let mut state = self.shared.state.lock().unwrap();

            for event in &events[..n] {
                let fd = event.u64 as RawFd;
                if fd == self.shared.event_fd {
                    let mut counter = [0u8; 8];
                    unsafe {
                        libc::read(
                            self.shared.event_fd,
                            counter.as_mut_ptr() as *mut libc::c_void,
                            counter.len(),
                        )
                    };
                    continue;
                }

                if let Some(watcher) = state.watchers.remove(&fd) {
                    self.unregister_fd(fd);
                    if let Some(task) = watcher.task.lock().unwrap().take() {
                        ready.push(task);
                    }
                    self.shared.release_ref();
                }
            }

            let now = Instant::now();

            // Watch deadlines: the timeout callback runs instead of the
            // I/O callback, exactly once.
            let expired: Vec<RawFd> = state
                .watchers
                .values()
                .filter(|w| matches!(w.deadline, Some(d) if d <= now))
                .map(|w| w.fd)
                .collect();
            for fd in expired {
                let watcher = state.watchers.remove(&fd).unwrap();
                self.unregister_fd(fd);
                if let Some(task) = watcher.timeout_task.lock().unwrap().take() {
                    ready.push(task);
                }
                self.shared.release_ref();
            }

            // Timers, in monotonic order.
            while matches!(state.timers.first(), Some(t) if t.when <= now) {
                let timer = state.timers.remove(0);
                if let Some(task) = timer.task.lock().unwrap().take() {
                    ready.push(task);
                }
                self.shared.release_ref();
            }

            // Plain tasks, in registration order.
            while let Some(task) = state.tasks.pop_front() {
                ready.push(task);
                self.shared.release_ref();
            }
        }

        for task in ready {
            task();
        }
    }

    fn poll_timeout_ms(&self) -> libc::c_int {
        let state = self.shared.state.lock().unwrap();
        if !state.tasks.is_empty() {
            return 0;
        }

        let mut deadline: Option<Instant> = state.timers.first().map(|t| t.when);
        for watcher in state.watchers.values() {
            if let Some(d) = watcher.deadline {
                deadline = Some(match deadline {
                    Some(existing) => existing.min(d),
                    None => d,
                });
            }
        }

        match deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                // Round up so we do not spin ahead of the deadline.
                let ms = (remaining.as_micros() + 999) / 1000;
                ms.min(libc::c_int::MAX as u128) as libc::c_int
            }
            None => -1,
        }
    }

    fn unregister_fd(&self, fd: RawFd) {
        unsafe {
            libc::epoll_ctl(
                self.shared.epoll_fd,
                libc::EPOLL_CTL_DEL,
                fd,
                std::ptr::null_mut(),
            )
        };
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.event_fd);
            libc::close(self.epoll_fd);
        }
    }
}

impl Shared {
    fn add_ref(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    fn release_ref(&self) {
        self.refs.fetch_sub(1, Ordering::AcqRel);
    }

    /// Posts one byte to the eventfd; the kernel coalesces repeats.
    fn wakeup(&self) {
        let value: u64 = 1;
        unsafe {
            libc::write(
                self.event_fd,
                &value as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
    }

    fn execute_boxed(shared: &Arc<Shared>, task: Task) {
        shared.add_ref();
        {
            let mut state = shared.state.lock().unwrap();
            state.tasks.push_back(task);
        }
        shared.wakeup();
    }
}

/// Keeps the loop alive while held.
pub struct LoopRef {
    shared: Arc<Shared>,
}

impl Drop for LoopRef {
    fn drop(&mut self) {
        self.shared.release_ref();
        self.shared.wakeup();
    }
}

/// Cancellation handle for a scheduled timer. Idempotent; a timer that
/// already fired is a no-op.
pub struct TimerHandle {
    shared: Weak<Shared>,
    timer: Weak<Timer>,
}

impl TimerHandle {
    pub fn cancel(&self) {
        let (shared, timer) = match (self.shared.upgrade(), self.timer.upgrade()) {
            (Some(shared), Some(timer)) => (shared, timer),
            _ => return,
        };

        let mut state = shared.state.lock().unwrap();
        if let Some(at) = state.timers.iter().position(|t| Arc::ptr_eq(t, &timer)) {
            state.timers.remove(at);
            drop(state);
            shared.release_ref();
            // Let a blocked loop observe the dropped reference.
            shared.wakeup();
        }
    }
}

/// Cancellation handle for a one-shot I/O watch.
pub struct WatchHandle {
    shared: Weak<Shared>,
    watcher: Weak<Watcher>,
}

impl WatchHandle {
    pub fn cancel(&self) {
        let (shared, watcher) = match (self.shared.upgrade(), self.watcher.upgrade()) {
            (Some(shared), Some(watcher)) => (shared, watcher),
            _ => return,
        };

        let mut state = shared.state.lock().unwrap();
        let registered = matches!(
            state.watchers.get(&watcher.fd),
            Some(current) if Arc::ptr_eq(current, &watcher)
        );
        if registered {
            state.watchers.remove(&watcher.fd);
            unsafe {
                libc::epoll_ctl(
                    shared.epoll_fd,
                    libc::EPOLL_CTL_DEL,
                    watcher.fd,
                    std::ptr::null_mut(),
                )
            };
            drop(state);
            shared.release_ref();
            shared.wakeup();
        }
    }
}

/// Cross-thread wakeup primitive: waiters register against a generation
/// and run when the generation advances past it.
#[derive(Default)]
pub struct Wakeup {
    state: Mutex<WakeupState>,
}

#[derive(Default)]
struct WakeupState {
    generation: u64,
    waiters: Vec<Task>,
}

impl Wakeup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generation(&self) -> u64 {
        self.state.lock().unwrap().generation
    }

    /// Advances the generation and releases all current waiters.
    pub fn wakeup(&self) {
        let waiters = {
            let mut state = self.state.lock().unwrap();
            state.generation += 1;
            std::mem::take(&mut state.waiters)
        };
        for waiter in waiters {
            waiter();
        }
    }

    /// Registers a waiter; runs immediately when `generation` is already
    /// in the past.
    pub fn on_wakeup(&self, generation: u64, task: Task) {
        let run_now = {
            let mut state = self.state.lock().unwrap();
            if state.generation > generation {
                true
            } else {
                state.waiters.push(task);
                return;
            }
        };
        if run_now {
            task();
        }
    }
}

/// A fixed set of worker loops, each on its own thread; endpoints are
/// pinned to one loop for their lifetime.
pub struct SchedulerPool {
    schedulers: Vec<Arc<Scheduler>>,
    keepalive: Mutex<Vec<LoopRef>>,
    threads: Mutex<Vec<std::thread::JoinHandle<()>>>,
    next: AtomicUsize,
}

impl SchedulerPool {
    pub fn new(count: usize) -> Result<Self> {
        let count = count.max(1);
        let mut schedulers = vec![];
        let mut keepalive = vec![];
        for _ in 0..count {
            let scheduler = Arc::new(Scheduler::new()?);
            keepalive.push(scheduler.retain());
            schedulers.push(scheduler);
        }

        let mut threads = vec![];
        for (i, scheduler) in schedulers.iter().enumerate() {
            let scheduler = scheduler.clone();
            threads.push(
                std::thread::Builder::new()
                    .name(format!("worker/{}", i))
                    .spawn(move || scheduler.run_loop())?,
            );
        }

        Ok(Self {
            schedulers,
            keepalive: Mutex::new(keepalive),
            threads: Mutex::new(threads),
            next: AtomicUsize::new(0),
        })
    }

    /// Round-robin selection for newly accepted endpoints.
    pub fn select(&self) -> Arc<Scheduler> {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.schedulers.len();
        self.schedulers[i].clone()
    }

    pub fn schedulers(&self) -> &[Arc<Scheduler>] {
        &self.schedulers
    }

    pub fn size(&self) -> usize {
        self.schedulers.len()
    }

    /// Releases the worker pins and joins the threads.
    pub fn shutdown(&self) {
        self.keepalive.lock().unwrap().clear();
        for scheduler in &self.schedulers {
            scheduler.break_loop();
        }
        for thread in self.threads.lock().unwrap().drain(..) {
            let _ = thread.join();
        }
    }
}

pub(crate) fn errno_error(what: &str) -> Error {
    format_err!("{}: {}", what, std::io::Error::last_os_error())
}
