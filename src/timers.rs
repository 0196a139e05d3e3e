use crate::clock::Clock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Interval between admin-panel data refreshes.
pub const AUTO_REFRESH_INTERVAL_MS: i64 = 5 * 60 * 1000;

pub type TimerId = u64;

struct TimerEntry {
    id: TimerId,
    deadline: i64,
    period: Option<i64>,
    callback: Box<dyn FnMut() + Send>,
}

/// Deadline-based timer queue driven by an explicit pump.
///
/// There is no background thread; the owner calls `run_due` from its event
/// loop turn. A repeating entry fires at most once per pump regardless of
/// how many periods have elapsed, then reschedules from the current time.
pub struct TimerQueue {
    clock: Arc<dyn Clock>,
    entries: Mutex<Vec<TimerEntry>>,
    next_id: AtomicU64,
}

impl TimerQueue {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        TimerQueue {
            clock,
            entries: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn schedule_once(&self, delay_ms: i64, callback: impl FnOnce() + Send + 'static) -> TimerId {
        let mut callback = Some(callback);
        self.push_entry(
            delay_ms,
            None,
            Box::new(move || {
                if let Some(cb) = callback.take() {
                    cb();
                }
            }),
        )
    }

    pub fn schedule_repeating(
        &self,
        period_ms: i64,
        callback: impl FnMut() + Send + 'static,
    ) -> TimerId {
        self.push_entry(period_ms, Some(period_ms), Box::new(callback))
    }

    fn push_entry(
        &self,
        delay_ms: i64,
        period: Option<i64>,
        callback: Box<dyn FnMut() + Send>,
    ) -> TimerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().unwrap().push(TimerEntry {
            id,
            deadline: self.clock.now_ms() + delay_ms,
            period,
            callback,
        });
        id
    }

    /// Cancel a pending timer. Returns false when the id is unknown or the
    /// timer already fired.
    pub fn cancel(&self, id: TimerId) -> bool {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|entry| entry.id != id);
        entries.len() != before
    }

    /// Fire every due entry, rescheduling repeating ones. Returns the
    /// number of callbacks run. Callbacks may schedule further timers;
    /// the lock is not held while they run.
    pub fn run_due(&self) -> usize {
        let now = self.clock.now_ms();
        let mut due = Vec::new();
        {
            let mut entries = self.entries.lock().unwrap();
            let mut i = 0;
            while i < entries.len() {
                if entries[i].deadline <= now {
                    due.push(entries.remove(i));
                } else {
                    i += 1;
                }
            }
        }

        let fired = due.len();
        for mut entry in due {
            (entry.callback)();
            if let Some(period) = entry.period {
                entry.deadline = now + period;
                self.entries.lock().unwrap().push(entry);
            }
        }
        fired
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
