//! Per-context deadline scheduling.
//!
//! One service thread owns a min-heap of deadlines with lazy cancellation:
//! cancelled or rescheduled timers bump a generation counter and stale heap
//! entries are skipped when they surface. Expirations are posted into the
//! owning [`Context`]'s pending queue and run there, never on the timer
//! thread.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::context::{Context, Work};

/// Receives timer expirations, inside the timer's owning context.
pub trait TimerSink: Send + Sync {
    fn expired(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Fire once, then disarm.
    Oneshot,
    /// Fire every period until cancelled.
    Periodic,
}

struct TimerState {
    period: Duration,
    kind: TimerKind,
    armed: bool,
    /// Bumped on every arm/modify/cancel; heap entries carry the
    /// generation they were inserted under and are skipped on mismatch.
    generation: u64,
}

pub(crate) struct TimerShared {
    ctx: Arc<Context>,
    sink: Arc<dyn TimerSink>,
    state: Mutex<TimerState>,
    /// Expiry queued on the context but not yet run (coalescing).
    pending: AtomicBool,
    /// Generation captured when the expiry was posted.
    fired_generation: AtomicU64,
}

impl TimerShared {
    fn post_expiry(self: &Arc<Self>, generation: u64) {
        if !self.pending.swap(true, Ordering::SeqCst) {
            self.fired_generation.store(generation, Ordering::SeqCst);
            self.ctx.post(Work::Timer(Arc::clone(self)));
        }
    }

    /// Runs inside the owning context.
    pub(crate) fn fire(self: &Arc<Self>) {
        self.pending.store(false, Ordering::SeqCst);
        let generation = self.fired_generation.load(Ordering::SeqCst);
        if self.state.lock().unwrap().generation != generation {
            // Cancelled or rescheduled after the expiry was captured.
            return;
        }
        self.sink.expired();
    }
}

struct HeapEntry {
    deadline: Instant,
    seq: u64,
    generation: u64,
    timer: Arc<TimerShared>,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed: BinaryHeap is a max-heap, we want the earliest deadline
        // on top. Tie-break by insertion order.
        match other.deadline.cmp(&self.deadline) {
            CmpOrdering::Equal => other.seq.cmp(&self.seq),
            ord => ord,
        }
    }
}

struct SvcInner {
    heap: BinaryHeap<HeapEntry>,
    seq: u64,
    shutdown: bool,
}

struct SvcShared {
    inner: Mutex<SvcInner>,
    cond: Condvar,
}

impl SvcShared {
    fn insert(&self, deadline: Instant, generation: u64, timer: Arc<TimerShared>) {
        let mut inner = self.inner.lock().unwrap();
        inner.seq += 1;
        let seq = inner.seq;
        inner.heap.push(HeapEntry {
            deadline,
            seq,
            generation,
            timer,
        });
        self.cond.notify_one();
    }
}

/// Handle to one timer. Create via [`crate::Reactor::timer`], then arm,
/// modify and cancel as needed. Dropping the handle cancels it.
pub struct Timer {
    shared: Arc<TimerShared>,
    svc: Arc<SvcShared>,
}

impl Timer {
    /// (Re)arm the timer to fire `period` from now.
    pub fn arm(&self, period: Duration, kind: TimerKind) {
        let generation = {
            let mut state = self.shared.state.lock().unwrap();
            state.armed = true;
            state.period = period;
            state.kind = kind;
            state.generation += 1;
            state.generation
        };
        // State lock released before touching the heap (lock order:
        // heap -> state on the service thread).
        self.svc
            .insert(Instant::now() + period, generation, Arc::clone(&self.shared));
    }

    /// Change the period of an armed timer; the next expiration is
    /// rescheduled to `period` from now.
    pub fn modify(&self, period: Duration) {
        let generation = {
            let mut state = self.shared.state.lock().unwrap();
            if !state.armed {
                return;
            }
            state.period = period;
            state.generation += 1;
            state.generation
        };
        self.svc
            .insert(Instant::now() + period, generation, Arc::clone(&self.shared));
    }

    /// Disarm. An expiry already queued on the context observes the
    /// generation bump and does not run. A oneshot timer that has expired
    /// but not yet dispatched is suppressed the same way.
    pub fn cancel(&self) {
        let mut state = self.shared.state.lock().unwrap();
        state.armed = false;
        state.generation += 1;
    }

    pub fn is_armed(&self) -> bool {
        self.shared.state.lock().unwrap().armed
    }

    /// Current period.
    pub fn period(&self) -> Duration {
        self.shared.state.lock().unwrap().period
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// The timer facility. One per [`crate::Reactor`].
pub struct TimerService {
    shared: Arc<SvcShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TimerService {
    pub(crate) fn start() -> TimerService {
        let shared = Arc::new(SvcShared {
            inner: Mutex::new(SvcInner {
                heap: BinaryHeap::new(),
                seq: 0,
                shutdown: false,
            }),
            cond: Condvar::new(),
        });
        let thread_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("nas-timer".into())
            .spawn(move || timer_loop(thread_shared))
            .expect("spawn timer thread");
        TimerService {
            shared,
            thread: Mutex::new(Some(thread)),
        }
    }

    /// Create an unarmed timer owned by `ctx`.
    pub fn create(&self, ctx: &Arc<Context>, sink: Arc<dyn TimerSink>) -> Timer {
        Timer {
            shared: Arc::new(TimerShared {
                ctx: Arc::clone(ctx),
                sink,
                state: Mutex::new(TimerState {
                    period: Duration::ZERO,
                    kind: TimerKind::Oneshot,
                    armed: false,
                    generation: 0,
                }),
                pending: AtomicBool::new(false),
                fired_generation: AtomicU64::new(0),
            }),
            svc: Arc::clone(&self.shared),
        }
    }

    pub(crate) fn shutdown(&self) {
        {
            let mut inner = self.shared.inner.lock().unwrap();
            inner.shutdown = true;
        }
        self.shared.cond.notify_all();
        if let Some(thread) = self.thread.lock().unwrap().take() {
            let _ = thread.join();
        }
    }
}

fn timer_loop(shared: Arc<SvcShared>) {
    loop {
        let mut due = Vec::new();
        let mut inner = shared.inner.lock().unwrap();
        if inner.shutdown {
            return;
        }
        let now = Instant::now();
        while let Some(top) = inner.heap.peek() {
            if top.deadline > now {
                break;
            }
            let entry = match inner.heap.pop() {
                Some(entry) => entry,
                None => break,
            };
            let reinsert = {
                let mut state = entry.timer.state.lock().unwrap();
                if !state.armed || state.generation != entry.generation {
                    continue;
                }
                match state.kind {
                    TimerKind::Periodic => Some(state.period),
                    TimerKind::Oneshot => {
                        state.armed = false;
                        None
                    }
                }
            };
            if let Some(period) = reinsert {
                inner.seq += 1;
                let seq = inner.seq;
                inner.heap.push(HeapEntry {
                    deadline: now + period,
                    seq,
                    generation: entry.generation,
                    timer: Arc::clone(&entry.timer),
                });
            }
            due.push((entry.timer, entry.generation));
        }
        drop(inner);

        for (timer, generation) in due {
            timer.post_expiry(generation);
        }

        let inner = shared.inner.lock().unwrap();
        if inner.shutdown {
            return;
        }
        // Recompute the next deadline after posting: arms that raced with
        // the unlocked window are visible here.
        match inner.heap.peek().map(|entry| entry.deadline) {
            Some(deadline) => {
                let now = Instant::now();
                if deadline > now {
                    let _guard = shared.cond.wait_timeout(inner, deadline - now);
                }
            }
            None => {
                let _guard = shared.cond.wait(inner);
            }
        }
    }
}
