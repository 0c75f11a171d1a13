//! Scheduled work: cancelable, optionally repeating timer events backed by an
//! OS timerfd that the owning reactor polls like any other descriptor.

use std::collections::BTreeMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::utils;

pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

/// Rearm floor when the minimum deadline is already in the past: fire soon but
/// never program a zero interval, so the loop keeps making progress under load.
const REARM_FLOOR_MS: i64 = 10;

/// A scheduled, optionally repeating, cancelable unit of work with an absolute
/// deadline in wall-clock milliseconds.
///
/// Cancellation is soft: `cancel` flags the event and the timer skips it at
/// fire time instead of removing it eagerly.
pub struct TimerEvent {
    deadline_ms: AtomicI64,
    interval_ms: i64,
    repeated: bool,
    canceled: AtomicBool,
    callback: TimerCallback,
}

impl TimerEvent {
    pub fn one_shot(delay_ms: i64, callback: impl Fn() + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            deadline_ms: AtomicI64::new(utils::now_millis() + delay_ms),
            interval_ms: 0,
            repeated: false,
            canceled: AtomicBool::new(false),
            callback: Arc::new(callback),
        })
    }

    pub fn repeating(interval_ms: i64, callback: impl Fn() + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            deadline_ms: AtomicI64::new(utils::now_millis() + interval_ms),
            interval_ms,
            repeated: true,
            canceled: AtomicBool::new(false),
            callback: Arc::new(callback),
        })
    }

    pub fn deadline_ms(&self) -> i64 {
        self.deadline_ms.load(Ordering::Relaxed)
    }

    pub fn is_repeated(&self) -> bool {
        self.repeated
    }

    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::Relaxed);
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Relaxed)
    }

    fn reset_deadline(&self) {
        self.deadline_ms
            .store(utils::now_millis() + self.interval_ms, Ordering::Relaxed);
    }
}

/// Ordered pending set of timer events keyed by deadline (duplicates allowed
/// via a sequence tiebreak), programmed into one timerfd. The owning reactor
/// registers `fd()` for readability and calls `on_fire` when it signals.
pub(crate) struct Timer {
    fd: RawFd,
    pending: Mutex<BTreeMap<(i64, u64), Arc<TimerEvent>>>,
    seq: AtomicU64,
}

impl Timer {
    pub fn new() -> io::Result<Self> {
        let fd = unsafe {
            libc::timerfd_create(
                libc::CLOCK_MONOTONIC,
                libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        debug!("timer fd={}", fd);
        Ok(Self {
            fd,
            pending: Mutex::new(BTreeMap::new()),
            seq: AtomicU64::new(0),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Add an event to the pending set; reprograms the timerfd when the new
    /// event becomes the earliest deadline.
    pub fn add(&self, event: Arc<TimerEvent>) {
        let key = (
            event.deadline_ms(),
            self.seq.fetch_add(1, Ordering::Relaxed),
        );
        let needs_rearm = {
            let mut pending = self.pending.lock();
            let first = pending.keys().next().map(|k| k.0);
            pending.insert(key, event);
            match first {
                None => true,
                Some(min) => key.0 < min,
            }
        };
        if needs_rearm {
            self.rearm();
        }
    }

    /// Soft removal: flags the event canceled; it is skipped at fire time.
    pub fn remove(&self, event: &TimerEvent) {
        event.cancel();
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Invoked by the reactor when the timerfd reports readable: drain the
    /// expiration counter, pop every due event, re-insert repeating ones with
    /// a recomputed deadline, reprogram the timerfd, then run the callbacks
    /// with the set's lock released (a callback may re-add a timer).
    pub fn on_fire(&self) {
        let mut buf = [0u8; 8];
        loop {
            let n = unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, 8) };
            if n <= 0 {
                break;
            }
        }

        let now = utils::now_millis();
        let mut due: Vec<Arc<TimerEvent>> = Vec::new();
        {
            let mut pending = self.pending.lock();
            let later = pending.split_off(&(now + 1, 0));
            for (_, ev) in std::mem::replace(&mut *pending, later) {
                if !ev.is_canceled() {
                    due.push(ev);
                }
            }
        }

        for ev in &due {
            if ev.is_repeated() {
                ev.reset_deadline();
                self.add(Arc::clone(ev));
            }
        }
        self.rearm();

        for ev in due {
            (ev.callback)();
        }
    }

    /// Program the timerfd to the minimum pending deadline; disarm when the
    /// set is empty.
    fn rearm(&self) {
        let first = {
            let pending = self.pending.lock();
            pending.keys().next().map(|k| k.0)
        };
        let interval_ms = match first {
            None => 0, // disarm
            Some(deadline) => {
                let now = utils::now_millis();
                if deadline > now {
                    deadline - now
                } else {
                    REARM_FLOOR_MS
                }
            }
        };

        let value = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: libc::timespec {
                tv_sec: (interval_ms / 1000) as libc::time_t,
                tv_nsec: ((interval_ms % 1000) * 1_000_000) as libc::c_long,
            },
        };
        let rc = unsafe { libc::timerfd_settime(self.fd, 0, &value, std::ptr::null_mut()) };
        if rc != 0 {
            error!(
                "timerfd_settime failed: {}",
                io::Error::last_os_error()
            );
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}
