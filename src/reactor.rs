//! Single-threaded event-driven I/O loop: readiness-based multiplexing plus
//! timers plus a cross-thread task queue.
//!
//! One `Reactor` owns one OS polling descriptor, a table of registered fd
//! interests, one timerfd-backed `Timer` and one eventfd used to wake a
//! blocked poll when another thread queues work. Components hold an explicit
//! `Arc<Reactor>` handle; there is no ambient per-thread lookup.
//!
//! The poll loop clones handler `Arc`s out of the interest table before
//! invoking them, so callbacks are free to re-register descriptors or queue
//! tasks on the same reactor.

use std::collections::HashMap;
use std::io;
use std::os::fd::BorrowedFd;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use polling::{Event, Events, PollMode, Poller};
use tracing::{debug, error, warn};

use crate::error::RpcResult;
use crate::timer::{Timer, TimerEvent};

pub const READABLE: u8 = 0b01;
pub const WRITABLE: u8 = 0b10;

pub type EventHandler = Arc<dyn Fn() + Send + Sync>;
type Task = Box<dyn FnOnce() + Send>;

/// Per-descriptor interest set. Owned by exactly one reactor; re-registering
/// replaces the affected direction atomically from the poller's point of view.
#[derive(Default)]
struct FdInterest {
    read: Option<EventHandler>,
    write: Option<EventHandler>,
}

impl FdInterest {
    fn poll_event(&self, key: usize) -> Event {
        match (self.read.is_some(), self.write.is_some()) {
            (true, true) => Event::all(key),
            (true, false) => Event::readable(key),
            (false, true) => Event::writable(key),
            (false, false) => Event::none(key),
        }
    }
}

pub struct Reactor {
    poller: Poller,
    events: Mutex<Events>,
    interests: Mutex<HashMap<RawFd, FdInterest>>,
    tasks: Mutex<Vec<Task>>,
    timer: Timer,
    wake_fd: RawFd,
    stopped: AtomicBool,
    running: AtomicBool,
}

impl Reactor {
    pub fn new() -> RpcResult<Arc<Self>> {
        let poller = Poller::new()?;
        let timer = Timer::new()?;
        let wake_fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if wake_fd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        unsafe {
            poller.add_with_mode(
                timer.fd(),
                Event::readable(timer.fd() as usize),
                PollMode::Level,
            )?;
            poller.add_with_mode(wake_fd, Event::readable(wake_fd as usize), PollMode::Level)?;
        }
        debug!("reactor created, timer fd={}, wake fd={}", timer.fd(), wake_fd);
        Ok(Arc::new(Self {
            poller,
            events: Mutex::new(Events::new()),
            interests: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
            timer,
            wake_fd,
            stopped: AtomicBool::new(false),
            running: AtomicBool::new(false),
        }))
    }

    /// Register (or extend) interest in `events` for `fd`. The handler is
    /// invoked from the poll loop each time the direction fires; registrations
    /// are level-triggered.
    pub fn add_interest(&self, fd: RawFd, events: u8, handler: EventHandler) -> RpcResult<()> {
        let mut interests = self.interests.lock();
        let is_new = !interests.contains_key(&fd);
        let interest = interests.entry(fd).or_default();
        if events & READABLE != 0 {
            interest.read = Some(Arc::clone(&handler));
        }
        if events & WRITABLE != 0 {
            interest.write = Some(handler.clone());
        }
        let ev = interest.poll_event(fd as usize);
        if is_new {
            unsafe {
                self.poller.add_with_mode(fd, ev, PollMode::Level)?;
            }
        } else {
            let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
            self.poller.modify_with_mode(borrowed, ev, PollMode::Level)?;
        }
        Ok(())
    }

    /// Drop interest in `events` for `fd`; deregisters the descriptor from the
    /// poller entirely once neither direction remains.
    pub fn remove_interest(&self, fd: RawFd, events: u8) -> RpcResult<()> {
        let mut interests = self.interests.lock();
        let Some(interest) = interests.get_mut(&fd) else {
            return Ok(());
        };
        if events & READABLE != 0 {
            interest.read = None;
        }
        if events & WRITABLE != 0 {
            interest.write = None;
        }
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        if interest.read.is_none() && interest.write.is_none() {
            interests.remove(&fd);
            if let Err(err) = self.poller.delete(borrowed) {
                debug!("poller delete fd={} failed (already closed?): {}", fd, err);
            }
        } else {
            let ev = interest.poll_event(fd as usize);
            self.poller.modify_with_mode(borrowed, ev, PollMode::Level)?;
        }
        Ok(())
    }

    /// Remove both directions and deregister the descriptor.
    pub fn deregister(&self, fd: RawFd) -> RpcResult<()> {
        self.remove_interest(fd, READABLE | WRITABLE)
    }

    /// Queue a task to run on the reactor thread after the next poll. Pass
    /// `wake_up = true` when calling from a foreign thread while the reactor
    /// may be blocked in its poll wait.
    pub fn run_later(&self, task: impl FnOnce() + Send + 'static, wake_up: bool) {
        self.tasks.lock().push(Box::new(task));
        if wake_up {
            self.wake();
        }
    }

    /// Add a timer event to this reactor's timer.
    pub fn schedule(&self, event: Arc<TimerEvent>) {
        self.timer.add(event);
    }

    /// Soft-cancel a scheduled timer event.
    pub fn cancel_timer(&self, event: &TimerEvent) {
        self.timer.remove(event);
    }

    /// Block the calling thread driving the loop until `stop` is called.
    /// Poll failures other than EINTR are fatal to this reactor.
    pub fn run(&self) -> RpcResult<()> {
        self.running.store(true, Ordering::Release);
        while !self.stopped.load(Ordering::Acquire) {
            if let Err(err) = self.poll_once(Some(Duration::from_millis(100))) {
                error!("reactor poll failed, terminating loop: {}", err);
                self.running.store(false, Ordering::Release);
                return Err(err);
            }
        }
        self.running.store(false, Ordering::Release);
        debug!("reactor loop exited");
        Ok(())
    }

    /// One loop iteration: poll with a timeout, run fired descriptor
    /// callbacks, fire the timer if its descriptor signaled, drain queued
    /// cross-thread tasks (queue lock held only for the swap).
    ///
    /// Public so callers outside a running reactor can drive the loop
    /// synchronously; must not be called from inside a running callback.
    pub fn poll_once(&self, timeout: Option<Duration>) -> RpcResult<usize> {
        let fired: Vec<(usize, bool, bool)> = {
            let mut events = self.events.lock();
            events.clear();
            match self.poller.wait(&mut events, timeout) {
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {
                    return Ok(0);
                }
                Err(err) => return Err(err.into()),
            }
            events
                .iter()
                .map(|ev| (ev.key, ev.readable, ev.writable))
                .collect()
        };

        let count = fired.len();
        for (key, readable, writable) in fired {
            let fd = key as RawFd;
            if fd == self.wake_fd {
                self.drain_wake();
                continue;
            }
            if fd == self.timer.fd() {
                self.timer.on_fire();
                continue;
            }
            let (read_cb, write_cb) = {
                let interests = self.interests.lock();
                match interests.get(&fd) {
                    Some(i) => (i.read.clone(), i.write.clone()),
                    None => {
                        debug!("event for deregistered fd={}", fd);
                        continue;
                    }
                }
            };
            if readable {
                if let Some(cb) = read_cb {
                    cb();
                }
            }
            if writable {
                if let Some(cb) = write_cb {
                    cb();
                }
            }
        }

        self.drain_tasks();
        Ok(count)
    }

    /// Set the stop flag and wake a blocked poll; the loop observes the flag
    /// on its next iteration.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.wake();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn drain_tasks(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            task();
        }
    }

    fn wake(&self) {
        let one: u64 = 1;
        let rc = unsafe {
            libc::write(
                self.wake_fd,
                &one as *const u64 as *const libc::c_void,
                8,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::WouldBlock {
                warn!("reactor wake write failed: {}", err);
            }
        }
    }

    fn drain_wake(&self) {
        let mut buf = [0u8; 8];
        loop {
            let n = unsafe { libc::read(self.wake_fd, buf.as_mut_ptr() as *mut libc::c_void, 8) };
            if n <= 0 {
                break;
            }
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.wake_fd);
        }
    }
}
