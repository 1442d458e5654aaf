//! Software timer scheduler
//!
//! A single background thread owns every armed timer in the process. It
//! sleeps on a condition variable until the earliest deadline or until a
//! new timer contracts that deadline, then fires expired timers one by one.
//!
//! Callbacks run synchronously on the scheduler thread and must be short.
//! Cancelling a timer whose callback is already running does not interrupt
//! that invocation.

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::timer::list::{Tick, TimerEntry, TimerList};

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

type Callback = Box<dyn FnMut() + Send>;

struct TimerInner {
    id: u64,
    name: String,
    callback: Mutex<Callback>,
}

/// Caller-owned timer handle.
///
/// Clones refer to the same timer. The scheduler only holds a weak
/// reference, so dropping every clone retires the timer.
#[derive(Clone)]
pub struct Timer {
    inner: Arc<TimerInner>,
}

impl Timer {
    pub fn new(name: impl Into<String>, callback: impl FnMut() + Send + 'static) -> Self {
        Self {
            inner: Arc::new(TimerInner {
                id: NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed),
                name: name.into(),
                callback: Mutex::new(Box::new(callback)),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .finish()
    }
}

struct SchedulerState {
    timers: TimerList<Weak<TimerInner>>,
    shutdown: bool,
}

struct Shared {
    state: Mutex<SchedulerState>,
    wake: Condvar,
    epoch: Instant,
    tick_offset: Tick,
}

impl Shared {
    fn now_tick(&self) -> Tick {
        (self.epoch.elapsed().as_millis() as u64 as Tick).wrapping_add(self.tick_offset)
    }
}

/// Process-wide timer engine, created once and passed to its users.
pub struct TimerScheduler {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TimerScheduler {
    /// Spawn the scheduler thread.
    pub fn start() -> std::io::Result<Self> {
        Self::with_tick_offset(0)
    }

    /// Start with the tick counter shifted by `offset`, e.g. to run close
    /// to the wrap point.
    pub fn with_tick_offset(offset: Tick) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(SchedulerState {
                timers: TimerList::new(),
                shutdown: false,
            }),
            wake: Condvar::new(),
            epoch: Instant::now(),
            tick_offset: offset,
        });

        let thread_shared = shared.clone();
        let handle = thread::Builder::new()
            .name("timer-scheduler".to_string())
            .spawn(move || run(thread_shared))?;

        Ok(Self {
            shared,
            thread: Mutex::new(Some(handle)),
        })
    }

    /// Arm `timer` to fire after `timeout_ms`, replacing any earlier arming.
    ///
    /// Periodic timers are re-armed `timeout_ms` after each deadline.
    pub fn add(&self, timer: &Timer, periodic: bool, timeout_ms: u32) {
        let period_ms = if periodic { timeout_ms.max(1) } else { timeout_ms };

        let mut state = self.shared.state.lock();
        let now = self.shared.now_tick();
        state.timers.remove(timer.id());

        let position = state.timers.insert(
            TimerEntry {
                key: timer.id(),
                payload: Arc::downgrade(&timer.inner),
                periodic,
                period_ms,
                deadline: now.wrapping_add(period_ms),
            },
            now,
        );
        drop(state);

        tracing::trace!("Timer {} armed for {}ms (periodic: {})", timer.name(), period_ms, periodic);

        if position == 0 {
            self.shared.wake.notify_one();
        }
    }

    /// Disarm `timer`. Returns whether it was armed.
    pub fn cancel(&self, timer: &Timer) -> bool {
        self.shared.state.lock().timers.remove(timer.id()).is_some()
    }

    /// True while `timer` has a pending deadline.
    pub fn is_running(&self, timer: &Timer) -> bool {
        self.shared.state.lock().timers.contains(timer.id())
    }

    /// Number of armed timers
    pub fn pending(&self) -> usize {
        self.shared.state.lock().timers.len()
    }

    /// Current scheduler tick
    pub fn now_tick(&self) -> Tick {
        self.shared.now_tick()
    }

    /// Stop the thread. Armed timers never fire afterwards.
    pub fn shutdown(&self) {
        self.shared.state.lock().shutdown = true;
        self.shared.wake.notify_all();

        if let Some(handle) = self.thread.lock().take() {
            // Dropped from inside a callback: the thread exits on its own
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                tracing::error!("Timer scheduler thread panicked");
            }
        }
    }
}

impl Drop for TimerScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(shared: Arc<Shared>) {
    tracing::debug!("Timer scheduler started");
    let mut state = shared.state.lock();

    loop {
        if state.shutdown {
            break;
        }

        let now = shared.now_tick();
        if let Some(entry) = state.timers.pop_expired(now) {
            fire(&mut state, entry, now);
            continue;
        }

        match state.timers.time_until_next(now) {
            Some(ms) => {
                shared.wake.wait_for(&mut state, Duration::from_millis(ms.max(1) as u64));
            }
            None => shared.wake.wait(&mut state),
        }
    }

    tracing::debug!("Timer scheduler stopped");
}

fn fire(
    state: &mut MutexGuard<'_, SchedulerState>,
    entry: TimerEntry<Weak<TimerInner>>,
    now: Tick,
) {
    let Some(timer) = entry.payload.upgrade() else {
        // Every handle was dropped
        return;
    };

    // Re-arm before running so a cancel from inside the callback sticks
    if entry.periodic {
        state.timers.insert(
            TimerEntry {
                deadline: entry.deadline.wrapping_add(entry.period_ms),
                ..entry
            },
            now,
        );
    }

    // The handle is released before relocking: it may own the last
    // reference to the scheduler itself
    MutexGuard::unlocked(state, move || {
        let result = catch_unwind(AssertUnwindSafe(|| {
            let mut callback = timer.callback.lock();
            (*callback)()
        }));
        if result.is_err() {
            tracing::error!("Timer {} callback panicked", timer.name);
        }
        drop(timer);
    });
}
