//! Execution contexts and the worker pool.
//!
//! A [`Context`] is the unit of mutual exclusion and scheduling: one logical
//! actor per network session, plus a default context for housekeeping work.
//! Readiness events, timer expirations and plain closures are delivered into
//! a context's pending queue, and at most one worker thread drains a given
//! context at any instant. Within a context, work runs strictly in FIFO
//! order of delivery; across contexts there is no ordering guarantee.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};
use tracing::trace;

use crate::poll::IoEntry;
use crate::timer::TimerShared;

/// A unit of work delivered into a context's pending queue.
///
/// Tagged-variant dispatch: each role (I/O readiness, timer expiry, plain
/// call) carries the trait object it will invoke.
pub(crate) enum Work {
    Call(Box<dyn FnOnce() + Send>),
    Io(Arc<IoEntry>),
    Timer(Arc<TimerShared>),
}

impl Work {
    fn execute(self) {
        match self {
            Work::Call(f) => f(),
            Work::Io(entry) => entry.dispatch(),
            Work::Timer(timer) => timer.fire(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    /// Not queued anywhere; the next work item queues the context.
    Idle,
    /// Sitting in the worker run queue.
    Queued,
    /// A worker (exactly one) is draining the pending list.
    Running,
}

struct ContextInner {
    pending: VecDeque<Work>,
    state: RunState,
    /// Latched wakeup token consumed by [`Context::suspend`].
    woken: bool,
    closed: bool,
}

/// A per-session execution context.
///
/// Created via [`crate::Reactor::context`]. Callbacks for a context are
/// serialized: no two of them ever run concurrently, even with many worker
/// threads. Cooperative blocking ([`Context::suspend`]) keeps draining the
/// context's own pending work while waiting, so readiness and timer
/// callbacks for the session still run.
pub struct Context {
    id: u64,
    inner: Mutex<ContextInner>,
    cond: Condvar,
    sched: Scheduler,
}

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

impl Context {
    pub(crate) fn new(sched: Scheduler) -> Arc<Self> {
        Arc::new(Context {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            inner: Mutex::new(ContextInner {
                pending: VecDeque::new(),
                state: RunState::Idle,
                woken: false,
                closed: false,
            }),
            cond: Condvar::new(),
            sched,
        })
    }

    /// Context identifier, for logging.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn post(self: &Arc<Self>, work: Work) {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return;
        }
        inner.pending.push_back(work);
        if inner.state == RunState::Idle {
            inner.state = RunState::Queued;
            drop(inner);
            self.sched.enqueue(Arc::clone(self));
        } else {
            // A suspended callback drains pending work inline; nudge it.
            self.cond.notify_one();
        }
    }

    /// Queue a closure to run in this context.
    pub fn call<F>(self: &Arc<Self>, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.post(Work::Call(Box::new(f)));
    }

    /// Run a closure in this context and block the calling thread until it
    /// completes, returning its result.
    ///
    /// Must not be called from within the target context itself (it would
    /// wait for its own completion).
    pub fn call_wait<F, T>(self: &Arc<Self>, f: F) -> T
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.call(move || {
            let _ = tx.send(f());
        });
        rx.recv().expect("context dropped the call")
    }

    /// Cooperatively suspend the current callback until [`Context::wakeup`].
    ///
    /// Only valid from within one of this context's own callbacks. While
    /// suspended, other pending work for this context is executed inline on
    /// the same thread, preserving the single-writer invariant. A wakeup
    /// issued before the suspend is latched and consumed immediately.
    pub fn suspend(&self) {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if inner.woken {
                inner.woken = false;
                return;
            }
            if let Some(work) = inner.pending.pop_front() {
                drop(inner);
                work.execute();
                inner = self.inner.lock().unwrap();
                continue;
            }
            inner = self.cond.wait(inner).unwrap();
        }
    }

    /// Resume a context suspended in [`Context::suspend`].
    ///
    /// Safe to call from any thread: the multiplexer thread, a timer
    /// expiry, or another session's context.
    pub fn wakeup(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.woken = true;
        self.cond.notify_one();
    }

    /// Close the context: pending work is dropped and further deliveries
    /// are discarded. Handlers and timers bound to the context should be
    /// unregistered first.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        inner.pending.clear();
    }

    /// Drain the pending queue. Runs on a worker thread; the `Running`
    /// state guarantees no other worker touches this context concurrently.
    fn run(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock().unwrap();
            debug_assert_eq!(inner.state, RunState::Queued);
            inner.state = RunState::Running;
        }
        loop {
            let work = {
                let mut inner = self.inner.lock().unwrap();
                match inner.pending.pop_front() {
                    Some(work) => work,
                    None => {
                        inner.state = RunState::Idle;
                        return;
                    }
                }
            };
            work.execute();
        }
    }
}

enum RunMsg {
    Run(Arc<Context>),
    Stop,
}

/// Handle used by contexts, the poller and the timer service to queue a
/// runnable context onto the worker pool.
#[derive(Clone)]
pub(crate) struct Scheduler {
    tx: Sender<RunMsg>,
}

impl Scheduler {
    fn enqueue(&self, ctx: Arc<Context>) {
        // Fails only after shutdown, when workers are gone anyway.
        let _ = self.tx.send(RunMsg::Run(ctx));
    }
}

/// Fixed-size pool of worker threads executing context dispatch queues.
pub(crate) struct WorkerPool {
    tx: Sender<RunMsg>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    busy: Arc<AtomicUsize>,
}

impl WorkerPool {
    pub(crate) fn start(workers: usize) -> WorkerPool {
        let (tx, rx) = crossbeam_channel::unbounded();
        let busy = Arc::new(AtomicUsize::new(0));
        let mut threads = Vec::with_capacity(workers);
        for i in 0..workers {
            let rx: Receiver<RunMsg> = rx.clone();
            let busy = Arc::clone(&busy);
            let handle = thread::Builder::new()
                .name(format!("nas-worker-{i}"))
                .spawn(move || {
                    while let Ok(msg) = rx.recv() {
                        match msg {
                            RunMsg::Run(ctx) => {
                                busy.fetch_add(1, Ordering::Relaxed);
                                trace!(ctx = ctx.id(), "dispatch");
                                ctx.run();
                                busy.fetch_sub(1, Ordering::Relaxed);
                            }
                            RunMsg::Stop => break,
                        }
                    }
                })
                .expect("spawn worker thread");
            threads.push(handle);
        }
        WorkerPool {
            tx,
            threads: Mutex::new(threads),
            busy,
        }
    }

    pub(crate) fn scheduler(&self) -> Scheduler {
        Scheduler {
            tx: self.tx.clone(),
        }
    }

    /// Number of workers currently inside a context dispatch.
    pub(crate) fn busy(&self) -> usize {
        self.busy.load(Ordering::Relaxed)
    }

    pub(crate) fn shutdown(&self) {
        let mut threads = self.threads.lock().unwrap();
        for _ in threads.iter() {
            let _ = self.tx.send(RunMsg::Stop);
        }
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    fn pool_and_ctx(workers: usize) -> (WorkerPool, Arc<Context>) {
        let pool = WorkerPool::start(workers);
        let ctx = Context::new(pool.scheduler());
        (pool, ctx)
    }

    #[test]
    fn test_call_runs_in_order() {
        let (pool, ctx) = pool_and_ctx(4);
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..100 {
            let log = Arc::clone(&log);
            ctx.call(move || log.lock().unwrap().push(i));
        }
        ctx.call_wait(|| ());
        assert_eq!(*log.lock().unwrap(), (0..100).collect::<Vec<_>>());
        pool.shutdown();
    }

    #[test]
    fn test_at_most_one_dispatch_per_context() {
        // With 4 workers hammering one context, no two callbacks of that
        // context may ever overlap.
        let (pool, ctx) = pool_and_ctx(4);
        let inside = Arc::new(AtomicBool::new(false));
        let overlapped = Arc::new(AtomicBool::new(false));
        for _ in 0..500 {
            let inside = Arc::clone(&inside);
            let overlapped = Arc::clone(&overlapped);
            ctx.call(move || {
                if inside.swap(true, Ordering::SeqCst) {
                    overlapped.store(true, Ordering::SeqCst);
                }
                std::hint::spin_loop();
                inside.store(false, Ordering::SeqCst);
            });
        }
        ctx.call_wait(|| ());
        assert!(!overlapped.load(Ordering::SeqCst));
        pool.shutdown();
    }

    #[test]
    fn test_suspend_wakeup_cross_thread() {
        let (pool, ctx) = pool_and_ctx(2);
        let ctx2 = Arc::clone(&ctx);
        let waker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            ctx2.wakeup();
        });
        let started = std::time::Instant::now();
        let ctx3 = Arc::clone(&ctx);
        let elapsed = ctx.call_wait(move || {
            ctx3.suspend();
            started.elapsed()
        });
        assert!(elapsed >= Duration::from_millis(25));
        waker.join().unwrap();
        pool.shutdown();
    }

    #[test]
    fn test_wakeup_before_suspend_is_latched() {
        let (pool, ctx) = pool_and_ctx(1);
        ctx.wakeup();
        let ctx2 = Arc::clone(&ctx);
        // Must return immediately instead of parking forever.
        ctx.call_wait(move || ctx2.suspend());
        pool.shutdown();
    }

    #[test]
    fn test_suspend_drains_own_pending_work() {
        // Work posted while the context is suspended must run inline on the
        // suspended thread, before the suspend returns.
        let (pool, ctx) = pool_and_ctx(2);
        let seen = Arc::new(AtomicBool::new(false));
        let ctx2 = Arc::clone(&ctx);
        let seen2 = Arc::clone(&seen);
        let observed_during_wait = ctx.call_wait(move || {
            let ctx3 = Arc::clone(&ctx2);
            let seen3 = Arc::clone(&seen2);
            // Deliver work + wakeup from a helper thread while suspended.
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                let seen4 = Arc::clone(&seen3);
                ctx3.call(move || seen4.store(true, Ordering::SeqCst));
                thread::sleep(Duration::from_millis(20));
                ctx3.wakeup();
            });
            ctx2.suspend();
            seen2.load(Ordering::SeqCst)
        });
        assert!(observed_during_wait);
        pool.shutdown();
    }

    #[test]
    fn test_closed_context_discards_work() {
        let (pool, ctx) = pool_and_ctx(1);
        ctx.close();
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = Arc::clone(&ran);
        ctx.call(move || ran2.store(true, Ordering::SeqCst));
        thread::sleep(Duration::from_millis(20));
        assert!(!ran.load(Ordering::SeqCst));
        pool.shutdown();
    }
}
