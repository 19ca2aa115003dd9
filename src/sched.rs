use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// One-shot timer scheduling, the only clock-driven primitive the stack
/// needs. The host owns the event loop and decides when due tasks run;
/// everything is single threaded and cooperative.
pub trait Scheduler {
    fn call_later(&self, delay: Duration, task: Box<dyn FnOnce()>) -> TimerHandle;
}

/// Cancellation handle for a scheduled task. Cancelling is idempotent and
/// cancelling an already fired timer is a no-op.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    cancelled: Rc<Cell<bool>>,
}

impl TimerHandle {
    pub fn cancel(&self) {
        self.cancelled.set(true);
    }
}

struct Entry {
    cancelled: Rc<Cell<bool>>,
    task: Box<dyn FnOnce()>,
}

/// A deadline-ordered one-shot timer queue.
///
/// `call_later` registers, [`next_deadline`] tells the event loop how long
/// it may sleep, and [`fire_due`] runs everything that has come due.
/// Cancelled entries are skipped when their deadline passes.
///
/// [`next_deadline`]: TimerQueue::next_deadline
/// [`fire_due`]: TimerQueue::fire_due
#[derive(Clone, Default)]
pub struct TimerQueue {
    inner: Rc<RefCell<QueueInner>>,
}

#[derive(Default)]
struct QueueInner {
    next_seq: u64,
    entries: BTreeMap<(Instant, u64), Entry>,
}

impl TimerQueue {
    pub fn new() -> Self {
        TimerQueue::default()
    }

    /// Earliest pending deadline, cancelled entries included (they are
    /// cheap to skip at fire time).
    pub fn next_deadline(&self) -> Option<Instant> {
        self.inner
            .borrow()
            .entries
            .keys()
            .next()
            .map(|(deadline, _)| *deadline)
    }

    /// Runs every task whose deadline is at or before `now`, in deadline
    /// order. Each task is removed from the queue before it runs, so tasks
    /// are free to schedule new timers.
    pub fn fire_due(&self, now: Instant) {
        loop {
            let entry = {
                let mut inner = self.inner.borrow_mut();
                let due = inner.entries.keys().next().copied();
                match due {
                    Some(key) if key.0 <= now => inner.entries.remove(&key),
                    _ => None,
                }
            };

            let Some(entry) = entry else { break };

            if !entry.cancelled.get() {
                (entry.task)();
            }
        }
    }
}

impl Scheduler for TimerQueue {
    fn call_later(&self, delay: Duration, task: Box<dyn FnOnce()>) -> TimerHandle {
        let cancelled = Rc::new(Cell::new(false));

        let mut inner = self.inner.borrow_mut();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.entries.insert(
            (Instant::now() + delay, seq),
            Entry {
                cancelled: cancelled.clone(),
                task,
            },
        );

        TimerHandle { cancelled }
    }
}
