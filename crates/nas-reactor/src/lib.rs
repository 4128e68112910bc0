//! Event-driven I/O runtime for a network-access-server daemon.
//!
//! This crate multiplexes many concurrent sessions onto a small pool of
//! worker threads:
//!
//! - a [`Poller`] thread blocks on the kernel readiness facility and routes
//!   events to handlers,
//! - each session gets an execution [`Context`]; its callbacks run
//!   serialized, in FIFO order, on whichever worker picks the context up,
//! - a [`TimerService`] delivers deadlines into contexts,
//! - cooperative blocking ([`Context::suspend`] / [`Context::wakeup`])
//!   parks an operation without stalling the context's other work.
//!
//! The [`Reactor`] owns all of the above with an explicit lifecycle: no
//! process-wide singletons.
//!
//! # Example
//!
//! ```no_run
//! use nas_reactor::{Config, Reactor};
//!
//! let reactor = Reactor::new(Config::default()).unwrap();
//! let ctx = reactor.context();
//! ctx.call(|| println!("runs on a worker thread, serialized per context"));
//! reactor.shutdown();
//! ```

mod context;
mod poll;
mod timer;

pub use context::Context;
pub use poll::{Interest, IoHandle, IoHandler, Poller, Trigger};
pub use timer::{Timer, TimerKind, TimerService, TimerSink};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use context::WorkerPool;
use thiserror::Error as ThisError;
use tracing::debug;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Runtime sizing knobs.
#[derive(Debug, Clone)]
pub struct Config {
    /// Worker threads executing context dispatch queues.
    pub workers: usize,
    /// Readiness events collected per multiplexer wake.
    pub max_events: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            workers: 2,
            max_events: 128,
        }
    }
}

/// The runtime: readiness multiplexer, worker pool, timer service and the
/// default execution context.
pub struct Reactor {
    workers: WorkerPool,
    poller: Poller,
    timers: TimerService,
    default_ctx: Arc<Context>,
    stopped: AtomicBool,
}

impl Reactor {
    pub fn new(config: Config) -> Result<Arc<Reactor>> {
        let workers = WorkerPool::start(config.workers.max(1));
        let poller = Poller::start(config.max_events)?;
        let timers = TimerService::start();
        let default_ctx = Context::new(workers.scheduler());
        debug!(workers = config.workers, "reactor started");
        Ok(Arc::new(Reactor {
            workers,
            poller,
            timers,
            default_ctx,
            stopped: AtomicBool::new(false),
        }))
    }

    /// Create a new execution context (one per session).
    pub fn context(&self) -> Arc<Context> {
        Context::new(self.workers.scheduler())
    }

    /// The context for work not tied to any session.
    pub fn default_context(&self) -> &Arc<Context> {
        &self.default_ctx
    }

    /// Bind a descriptor handler into `ctx`. Interest is added via
    /// [`IoHandle::enable`].
    pub fn register_io(&self, ctx: &Arc<Context>, handler: Arc<dyn IoHandler>) -> IoHandle {
        self.poller.register(ctx, handler)
    }

    /// Create an unarmed timer delivering into `ctx`.
    pub fn timer(&self, ctx: &Arc<Context>, sink: Arc<dyn TimerSink>) -> Timer {
        self.timers.create(ctx, sink)
    }

    pub fn poller(&self) -> &Poller {
        &self.poller
    }

    /// Number of workers currently executing a context.
    pub fn busy_workers(&self) -> usize {
        self.workers.busy()
    }

    /// Stop the poll thread, the timer thread and the worker pool.
    /// Idempotent.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.poller.shutdown();
        self.timers.shutdown();
        self.workers.shutdown();
        debug!("reactor stopped");
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reactor_lifecycle() {
        let reactor = Reactor::new(Config::default()).unwrap();
        let ctx = reactor.context();
        assert_eq!(ctx.call_wait(|| 7), 7);
        reactor.shutdown();
        // Second shutdown is a no-op.
        reactor.shutdown();
    }

    #[test]
    fn test_contexts_are_independent() {
        let reactor = Reactor::new(Config {
            workers: 4,
            max_events: 32,
        })
        .unwrap();
        let a = reactor.context();
        let b = reactor.context();
        assert_ne!(a.id(), b.id());
        let x = a.call_wait(|| 1);
        let y = b.call_wait(|| 2);
        assert_eq!((x, y), (1, 2));
        reactor.shutdown();
    }
}
