//! Time sources and delayed callbacks.
//!
//! The engine never reads the wall clock or sleeps directly: it asks a
//! [`Clock`] for the time and a [`Timer`] for wake-ups. Production uses
//! [`SystemClock`] + [`TokioTimer`]; tests and simulations drive a
//! [`ManualClock`], which implements both.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Callback run when a timer fires.
pub type TimerCallback = Box<dyn FnOnce() + Send + 'static>;

pub trait Timer: Send + Sync {
    /// Run `callback` once after `delay`, unless cancelled first.
    fn schedule(&self, delay: Duration, callback: TimerCallback) -> TimerHandle;
}

/// Cancels a pending timer. Dropping the handle leaves the timer armed.
pub struct TimerHandle {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl TimerHandle {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerHandle")
            .field("armed", &self.cancel.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// One spawned sleep per timer. Must be used inside a tokio runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioTimer;

impl Timer for TokioTimer {
    fn schedule(&self, delay: Duration, callback: TimerCallback) -> TimerHandle {
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            callback();
        });
        TimerHandle::new(move || task.abort())
    }
}

struct PendingTimer {
    id: u64,
    due: DateTime<Utc>,
    callback: TimerCallback,
}

struct ManualState {
    now: DateTime<Utc>,
    next_id: u64,
    pending: Vec<PendingTimer>,
}

/// Explicitly advanced clock. Due timers fire synchronously inside
/// [`ManualClock::advance`], in due order.
#[derive(Clone)]
pub struct ManualClock {
    state: Arc<Mutex<ManualState>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            state: Arc::new(Mutex::new(ManualState {
                now: start,
                next_id: 0,
                pending: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ManualState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn advance(&self, by: Duration) {
        let by = chrono::Duration::from_std(by).unwrap_or(chrono::Duration::MAX);
        let target = self.lock().now.checked_add_signed(by).unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.set(target);
    }

    /// Jump to `to` (never backwards) and fire every timer due by then.
    pub fn set(&self, to: DateTime<Utc>) {
        let due = {
            let mut state = self.lock();
            if to > state.now {
                state.now = to;
            }
            let now = state.now;
            let (mut due, pending): (Vec<_>, Vec<_>) =
                state.pending.drain(..).partition(|t| t.due <= now);
            state.pending = pending;
            due.sort_by_key(|t| (t.due, t.id));
            due
        };
        // Callbacks run unlocked so they may schedule further timers.
        for timer in due {
            (timer.callback)();
        }
    }

    pub fn pending_timers(&self) -> usize {
        self.lock().pending.len()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.lock().now
    }
}

impl Timer for ManualClock {
    fn schedule(&self, delay: Duration, callback: TimerCallback) -> TimerHandle {
        let id = {
            let mut state = self.lock();
            let id = state.next_id;
            state.next_id += 1;
            let by = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
            let due = state.now.checked_add_signed(by).unwrap_or(DateTime::<Utc>::MAX_UTC);
            state.pending.push(PendingTimer { id, due, callback });
            id
        };
        let state = Arc::clone(&self.state);
        TimerHandle::new(move || {
            state
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .pending
                .retain(|t| t.id != id);
        })
    }
}

impl std::fmt::Debug for ManualClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("ManualClock")
            .field("now", &state.now)
            .field("pending", &state.pending.len())
            .finish()
    }
}
