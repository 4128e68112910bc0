//! Readiness multiplexer.
//!
//! Wraps the kernel event-notification facility (epoll) and owns the single
//! thread that blocks waiting for I/O readiness across all registered
//! descriptors. Ready descriptors are not serviced on the poll thread:
//! readiness bits are recorded on the handler entry and the owning
//! [`Context`] is queued to the worker pool, coalescing multiple ready
//! descriptors per context into one wake.
//!
//! Unregistration detaches a handler immediately but defers releasing its
//! resources through a two-generation quarantine: entries parked during one
//! wake cycle are dropped only after the next cycle completes, so a
//! readiness event already captured for the descriptor can never touch a
//! released handler.

use std::collections::HashMap;
use std::ops::{BitOr, BitOrAssign};
use std::os::fd::{AsFd, BorrowedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::sys::eventfd::{EfdFlags, EventFd};
use tracing::{error, trace};

use crate::context::{Context, Work};
use crate::{Error, Result};

/// Token reserved for the shutdown eventfd.
const WAKE_TOKEN: u64 = 0;

const READY_READ: u8 = 0b01;
const READY_WRITE: u8 = 0b10;

/// Descriptor interest mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest(u8);

impl Interest {
    pub const READ: Interest = Interest(READY_READ);
    pub const WRITE: Interest = Interest(READY_WRITE);

    pub fn contains(self, other: Interest) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

impl BitOrAssign for Interest {
    fn bitor_assign(&mut self, rhs: Interest) {
        self.0 |= rhs.0;
    }
}

/// Trigger mode for a registered descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Notify on readiness transitions; the handler must drain the
    /// descriptor. Default.
    Edge,
    /// Notify while readiness persists.
    Level,
}

/// A descriptor handler dispatched inside its owning context.
///
/// Implementors use interior mutability; callbacks for one context are
/// already serialized by the runtime.
pub trait IoHandler: Send + Sync {
    /// The descriptor this handler watches. Must stay valid until the
    /// handler is unregistered.
    fn fd(&self) -> RawFd;

    fn readable(&self) {}

    fn writable(&self) {}
}

/// Kernel-facing registration state, guarded against concurrent mutation
/// from the owning context.
struct Registration {
    interest: u8,
    trigger: Trigger,
}

pub(crate) struct IoEntry {
    token: u64,
    fd: RawFd,
    ctx: Arc<Context>,
    handler: Arc<dyn IoHandler>,
    registration: Mutex<Registration>,
    /// Set at unregistration; every dispatch path re-checks. The handler
    /// itself is released only when the entry leaves quarantine.
    dead: AtomicBool,
    /// Readiness bits observed by the poll thread, consumed at dispatch.
    ready: AtomicU8,
    /// Whether the entry is already queued on its context (coalescing).
    pending: AtomicBool,
}

impl IoEntry {
    /// Runs inside the owning context.
    pub(crate) fn dispatch(self: &Arc<Self>) {
        self.pending.store(false, Ordering::SeqCst);
        let ready = self.ready.swap(0, Ordering::SeqCst);
        if self.dead.load(Ordering::SeqCst) {
            return;
        }
        if ready & READY_READ != 0 {
            self.handler.readable();
        }
        if ready & READY_WRITE != 0 {
            self.handler.writable();
        }
    }
}

struct PollerShared {
    epoll: Epoll,
    wake: EventFd,
    tokens: Mutex<HashMap<u64, Arc<IoEntry>>>,
    /// Generation-1 quarantine: entries unregistered since the last wake
    /// cycle. The poll thread migrates them to its private generation-2
    /// list and releases that list one cycle later.
    quarantine: Mutex<Vec<Arc<IoEntry>>>,
    next_token: AtomicU64,
    handler_count: AtomicUsize,
    shutdown: AtomicBool,
}

impl PollerShared {
    fn epoll_flags(&self, reg: &Registration) -> EpollFlags {
        let mut flags = EpollFlags::empty();
        if reg.interest & READY_READ != 0 {
            flags |= EpollFlags::EPOLLIN;
        }
        if reg.interest & READY_WRITE != 0 {
            flags |= EpollFlags::EPOLLOUT;
        }
        if reg.trigger == Trigger::Edge {
            flags |= EpollFlags::EPOLLET;
        }
        flags
    }
}

/// Handle to a registered descriptor handler.
///
/// Dropping the handle unregisters it. Enable/disable drive the kernel
/// registration: the first interest bit adds the descriptor, later changes
/// modify it, and removing the last bit deletes it.
pub struct IoHandle {
    shared: Arc<PollerShared>,
    entry: Arc<IoEntry>,
}

impl IoHandle {
    /// Add interest bits for this descriptor.
    pub fn enable(&self, interest: Interest) -> Result<()> {
        if self.entry.dead.load(Ordering::SeqCst) {
            return Ok(());
        }
        let mut reg = self.entry.registration.lock().unwrap();
        let prev = reg.interest;
        reg.interest |= interest.0;
        if reg.interest == prev {
            return Ok(());
        }
        let mut event = EpollEvent::new(self.shared.epoll_flags(&reg), self.entry.token);
        let fd = unsafe { BorrowedFd::borrow_raw(self.entry.fd) };
        let res = if prev != 0 {
            self.shared.epoll.modify(fd, &mut event)
        } else {
            self.shared.epoll.add(fd, event)
        };
        if let Err(err) = res {
            reg.interest = prev;
            return Err(Error::Io(err.into()));
        }
        Ok(())
    }

    /// Remove interest bits; deletes the kernel registration once none
    /// remain.
    pub fn disable(&self, interest: Interest) -> Result<()> {
        let mut reg = self.entry.registration.lock().unwrap();
        let prev = reg.interest;
        if prev == 0 {
            return Ok(());
        }
        reg.interest &= !interest.0;
        if reg.interest == prev {
            return Ok(());
        }
        let fd = unsafe { BorrowedFd::borrow_raw(self.entry.fd) };
        let res = if reg.interest != 0 {
            let mut event = EpollEvent::new(self.shared.epoll_flags(&reg), self.entry.token);
            self.shared.epoll.modify(fd, &mut event)
        } else {
            self.shared.epoll.delete(fd)
        };
        if let Err(err) = res {
            reg.interest = prev;
            return Err(Error::Io(err.into()));
        }
        Ok(())
    }

    /// Switch the trigger mode. Takes effect on the next `enable`.
    pub fn set_trigger(&self, trigger: Trigger) {
        self.entry.registration.lock().unwrap().trigger = trigger;
    }

    /// Detach the handler. Synchronous from the caller's perspective;
    /// the entry's resources are released after the next wake cycle.
    pub fn unregister(self) {
        drop(self);
    }
}

impl Drop for IoHandle {
    fn drop(&mut self) {
        unregister_entry(&self.shared, &self.entry);
    }
}

fn unregister_entry(shared: &Arc<PollerShared>, entry: &Arc<IoEntry>) {
    if entry.dead.swap(true, Ordering::SeqCst) {
        return;
    }
    {
        let mut reg = entry.registration.lock().unwrap();
        if reg.interest != 0 {
            reg.interest = 0;
            let fd = unsafe { BorrowedFd::borrow_raw(entry.fd) };
            // The descriptor may already be closed by its owner.
            let _ = shared.epoll.delete(fd);
        }
    }
    shared.tokens.lock().unwrap().remove(&entry.token);
    shared.quarantine.lock().unwrap().push(Arc::clone(entry));
    shared.handler_count.fetch_sub(1, Ordering::Relaxed);
}

/// The readiness multiplexer. One per [`crate::Reactor`].
pub struct Poller {
    shared: Arc<PollerShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Poller {
    pub(crate) fn start(max_events: usize) -> Result<Poller> {
        let epoll =
            Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).map_err(|e| Error::Io(e.into()))?;
        let wake = EventFd::from_value_and_flags(0, EfdFlags::EFD_NONBLOCK)
            .map_err(|e| Error::Io(e.into()))?;
        epoll
            .add(wake.as_fd(), EpollEvent::new(EpollFlags::EPOLLIN, WAKE_TOKEN))
            .map_err(|e| Error::Io(e.into()))?;

        let shared = Arc::new(PollerShared {
            epoll,
            wake,
            tokens: Mutex::new(HashMap::new()),
            quarantine: Mutex::new(Vec::new()),
            next_token: AtomicU64::new(1),
            handler_count: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
        });

        let thread_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("nas-poll".into())
            .spawn(move || poll_loop(thread_shared, max_events))
            .map_err(Error::Io)?;

        Ok(Poller {
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Bind a handler to a context. The descriptor is not watched until
    /// [`IoHandle::enable`] adds interest.
    pub fn register(&self, ctx: &Arc<Context>, handler: Arc<dyn IoHandler>) -> IoHandle {
        let token = self.shared.next_token.fetch_add(1, Ordering::Relaxed);
        let entry = Arc::new(IoEntry {
            token,
            fd: handler.fd(),
            ctx: Arc::clone(ctx),
            handler,
            registration: Mutex::new(Registration {
                interest: 0,
                trigger: Trigger::Edge,
            }),
            dead: AtomicBool::new(false),
            ready: AtomicU8::new(0),
            pending: AtomicBool::new(false),
        });
        self.shared.tokens.lock().unwrap().insert(token, Arc::clone(&entry));
        self.shared.handler_count.fetch_add(1, Ordering::Relaxed);
        IoHandle {
            shared: Arc::clone(&self.shared),
            entry,
        }
    }

    /// Number of live (registered, not yet unregistered) handlers.
    pub fn handler_count(&self) -> usize {
        self.shared.handler_count.load(Ordering::Relaxed)
    }

    pub(crate) fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        let _ = self.shared.wake.arm();
        if let Some(thread) = self.thread.lock().unwrap().take() {
            let _ = thread.join();
        }
    }
}

fn poll_loop(shared: Arc<PollerShared>, max_events: usize) {
    let mut events = vec![EpollEvent::empty(); max_events.max(1)];
    // Generation-2 quarantine, private to this thread.
    let mut aging: Vec<Arc<IoEntry>> = Vec::new();

    loop {
        let n = match shared.epoll.wait(&mut events, EpollTimeout::NONE) {
            Ok(n) => n,
            Err(Errno::EINTR) => continue,
            Err(err) => {
                // The multiplexing primitive is broken; there is no safe
                // recovery.
                error!(%err, "readiness wait failed, terminating");
                std::process::exit(1);
            }
        };

        if shared.shutdown.load(Ordering::SeqCst) {
            break;
        }

        for event in &events[..n] {
            let token = event.data();
            if token == WAKE_TOKEN {
                continue;
            }
            let entry = match shared.tokens.lock().unwrap().get(&token) {
                Some(entry) => Arc::clone(entry),
                None => continue,
            };
            deliver(&entry, event.events());
        }

        // Two-generation reclamation: entries that have now survived a full
        // wake cycle are safe to release; fresh unregistrations take their
        // place for the next cycle.
        let fresh = std::mem::take(&mut *shared.quarantine.lock().unwrap());
        let retired = std::mem::replace(&mut aging, fresh);
        drop(retired);
    }
}

fn deliver(entry: &Arc<IoEntry>, flags: EpollFlags) {
    if entry.dead.load(Ordering::SeqCst) {
        return;
    }
    let mut bits = 0u8;
    if flags.intersects(EpollFlags::EPOLLIN | EpollFlags::EPOLLERR | EpollFlags::EPOLLHUP) {
        bits |= READY_READ;
    }
    if flags.intersects(EpollFlags::EPOLLOUT) {
        bits |= READY_WRITE;
    }
    if bits == 0 {
        return;
    }
    entry.ready.fetch_or(bits, Ordering::SeqCst);
    if !entry.pending.swap(true, Ordering::SeqCst) {
        trace!(token = entry.token, "readiness queued");
        entry.ctx.post(Work::Io(Arc::clone(entry)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::WorkerPool;
    use std::net::UdpSocket;
    use std::os::fd::AsRawFd;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct CountingHandler {
        fd: RawFd,
        reads: AtomicUsize,
        sock: UdpSocket,
    }

    impl CountingHandler {
        fn new() -> Arc<CountingHandler> {
            let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
            sock.set_nonblocking(true).unwrap();
            Arc::new(CountingHandler {
                fd: sock.as_raw_fd(),
                reads: AtomicUsize::new(0),
                sock,
            })
        }

        fn drain(&self) {
            let mut buf = [0u8; 64];
            while self.sock.recv(&mut buf).is_ok() {}
        }
    }

    impl IoHandler for CountingHandler {
        fn fd(&self) -> RawFd {
            self.fd
        }

        fn readable(&self) {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.drain();
        }
    }

    fn send_to(sock: &UdpSocket) {
        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(b"ping", sock.local_addr().unwrap()).unwrap();
    }

    fn wait_for<F: Fn() -> bool>(cond: F) -> bool {
        for _ in 0..200 {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_readable_dispatched_in_context() {
        let pool = WorkerPool::start(2);
        let ctx = Context::new(pool.scheduler());
        let poller = Poller::start(32).unwrap();

        let handler = CountingHandler::new();
        let handle = poller.register(&ctx, handler.clone() as Arc<dyn IoHandler>);
        handle.enable(Interest::READ).unwrap();

        send_to(&handler.sock);
        assert!(wait_for(|| handler.reads.load(Ordering::SeqCst) == 1));

        send_to(&handler.sock);
        assert!(wait_for(|| handler.reads.load(Ordering::SeqCst) == 2));

        handle.unregister();
        poller.shutdown();
        pool.shutdown();
    }

    #[test]
    fn test_unregister_then_deliver_is_noop() {
        // Simulates the race where an event was captured before
        // unregistration: the queued dispatch must not invoke the handler.
        let pool = WorkerPool::start(1);
        let ctx = Context::new(pool.scheduler());
        let poller = Poller::start(32).unwrap();

        let handler = CountingHandler::new();
        let handle = poller.register(&ctx, handler.clone() as Arc<dyn IoHandler>);
        let entry = Arc::clone(&handle.entry);

        // Capture readiness while the context is busy, so the dispatch is
        // still queued when the handler goes away.
        let gate = Arc::new(std::sync::Barrier::new(2));
        let gate2 = Arc::clone(&gate);
        ctx.call(move || {
            gate2.wait();
        });
        deliver(&entry, EpollFlags::EPOLLIN);
        unregister_entry(&poller.shared, &entry);
        gate.wait();

        ctx.call_wait(|| ());
        assert_eq!(handler.reads.load(Ordering::SeqCst), 0);

        drop(handle);
        poller.shutdown();
        pool.shutdown();
    }

    #[test]
    fn test_quarantine_releases_after_wake_cycles() {
        let pool = WorkerPool::start(1);
        let ctx = Context::new(pool.scheduler());
        let poller = Poller::start(32).unwrap();

        let victim = CountingHandler::new();
        let handle = poller.register(&ctx, victim.clone() as Arc<dyn IoHandler>);
        handle.enable(Interest::READ).unwrap();
        assert_eq!(poller.handler_count(), 1);

        // A second registration keeps the poll thread cycling.
        let pump = CountingHandler::new();
        let pump_handle = poller.register(&ctx, pump.clone() as Arc<dyn IoHandler>);
        pump_handle.enable(Interest::READ).unwrap();

        handle.unregister();
        assert_eq!(poller.handler_count(), 1);

        // The entry holds a clone of the handler; two wake cycles later it
        // must be gone.
        assert!(wait_for(|| {
            send_to(&pump.sock);
            Arc::strong_count(&victim) == 1
        }));

        pump_handle.unregister();
        poller.shutdown();
        pool.shutdown();
    }

    #[test]
    fn test_enable_disable_interest_transitions() {
        let pool = WorkerPool::start(1);
        let ctx = Context::new(pool.scheduler());
        let poller = Poller::start(32).unwrap();

        let handler = CountingHandler::new();
        let handle = poller.register(&ctx, handler.clone() as Arc<dyn IoHandler>);

        // add -> modify -> delete sequence must all succeed
        handle.enable(Interest::READ).unwrap();
        handle.enable(Interest::READ | Interest::WRITE).unwrap();
        handle.disable(Interest::WRITE).unwrap();
        handle.disable(Interest::READ).unwrap();
        // re-adding after full removal starts a fresh registration
        handle.enable(Interest::READ).unwrap();

        handle.unregister();
        poller.shutdown();
        pool.shutdown();
    }
}
