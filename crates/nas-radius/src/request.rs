//! Per-request state machine: compose, admit, transmit, await reply,
//! retry, reassign-on-failure.
//!
//! A [`Request`] owns a connected nonblocking UDP socket whose read handler
//! is registered in the owning session's execution context, plus a response
//! timer slot shared by the blocking wait (one-shot wake) and the
//! asynchronous interim retry (periodic resend). All mutation happens in
//! the owning context; the mutex is uncontended and guards only the
//! cross-thread reads from timer and poller deliveries.

use std::net::{SocketAddr, UdpSocket};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use nas_reactor::{Context, Interest, IoHandle, IoHandler, Reactor, Timer, TimerKind, TimerSink};
use tracing::debug;

use crate::digest::{sign_accounting, verify_response};
use crate::error::RadiusError;
use crate::packet::{Code, Packet};
use crate::server::{Admission, Server, ServerPool, ServiceKind, StatKind};

static NEXT_IDENTIFIER: AtomicU8 = AtomicU8::new(0);

struct ReqState {
    server: Arc<Server>,
    target: SocketAddr,
    packet: Packet,
    reply: Option<Packet>,
    socket: Option<UdpSocket>,
    io: Option<IoHandle>,
    sent_at: Instant,
    /// A blocking waiter is suspended on the context; replies wake it.
    waiting: bool,
    /// Stats slot charged for sent/lost/latency (interim traffic is
    /// tracked apart from start/stop records).
    stat: StatKind,
}

pub(crate) struct ReqShared {
    reactor: Arc<Reactor>,
    ctx: Arc<Context>,
    kind: ServiceKind,
    verbose: bool,
    state: Mutex<ReqState>,
    /// Response timer: one-shot wake during a blocking wait, periodic
    /// resend driver for asynchronous interim updates. Cancelled by the
    /// read handler when a matching reply lands.
    timeout: Mutex<Option<Timer>>,
    /// A timer-driven compose/send is in progress (possibly suspended in
    /// an admission queue); further timer-driven entries are skipped until
    /// it completes.
    async_busy: AtomicBool,
}

impl ReqShared {
    /// Read handler: drain every available datagram, discard mismatches,
    /// accept the first reply that matches identifier, code and response
    /// authenticator.
    fn drain_replies(&self) {
        let mut buf = [0u8; Packet::MAX_PACKET_SIZE];
        let mut accepted = false;
        let mut state = self.state.lock().unwrap();
        loop {
            let n = {
                let Some(socket) = state.socket.as_ref() else {
                    return;
                };
                match socket.recv(&mut buf) {
                    Ok(n) => n,
                    Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(_) => break,
                }
            };
            let reply = match Packet::decode(&buf[..n]) {
                Ok(reply) => reply,
                Err(err) => {
                    debug!(server = state.server.id(), %err, "undecodable reply dropped");
                    continue;
                }
            };
            if reply.identifier != state.packet.identifier
                || !expected_code(self.kind, reply.code)
                || !verify_response(&reply, &state.packet.authenticator, state.server.secret())
            {
                // Spoofed, stale or wrong-code reply; the timeout policy
                // accounts for the loss.
                debug!(
                    server = state.server.id(),
                    identifier = reply.identifier,
                    code = ?reply.code,
                    "mismatched reply discarded"
                );
                continue;
            }
            if state.reply.is_none() {
                let elapsed_ms = state.sent_at.elapsed().as_millis() as u64;
                state.server.stat(state.stat).record_query(elapsed_ms);
                state.server.report_reply();
                if self.verbose {
                    debug!(
                        server = state.server.id(),
                        identifier = reply.identifier,
                        elapsed_ms,
                        "reply accepted"
                    );
                }
                state.reply = Some(reply);
                accepted = true;
            }
        }
        if accepted {
            let waiting = state.waiting;
            drop(state);
            if let Some(timer) = self.timeout.lock().unwrap().take() {
                timer.cancel();
            }
            if waiting {
                self.ctx.wakeup();
            }
        }
    }
}

fn expected_code(kind: ServiceKind, code: Code) -> bool {
    match kind {
        ServiceKind::Acct => code == Code::AccountingResponse,
        ServiceKind::Auth => matches!(code, Code::AccessAccept | Code::AccessReject),
    }
}

struct ReqIo {
    fd: RawFd,
    shared: Arc<ReqShared>,
}

impl IoHandler for ReqIo {
    fn fd(&self) -> RawFd {
        self.fd
    }

    fn readable(&self) {
        self.shared.drain_replies();
    }
}

/// Wakes the blocking waiter when the response timeout expires.
struct WakeSink {
    shared: Arc<ReqShared>,
}

impl TimerSink for WakeSink {
    fn expired(&self) {
        if self.shared.state.lock().unwrap().waiting {
            self.shared.ctx.wakeup();
        }
    }
}

/// An in-flight AAA request bound to one session and one server.
pub(crate) struct Request {
    shared: Arc<ReqShared>,
}

impl Request {
    pub(crate) fn new(
        reactor: Arc<Reactor>,
        ctx: Arc<Context>,
        kind: ServiceKind,
        server: Arc<Server>,
        code: Code,
        verbose: bool,
    ) -> Result<Request, RadiusError> {
        let target = server.endpoint(kind).ok_or(RadiusError::NoServers)?;
        let identifier = NEXT_IDENTIFIER.fetch_add(1, Ordering::Relaxed);
        let stat = match kind {
            ServiceKind::Auth => StatKind::Auth,
            ServiceKind::Acct => StatKind::Acct,
        };
        Ok(Request {
            shared: Arc::new(ReqShared {
                reactor,
                ctx,
                kind,
                verbose,
                state: Mutex::new(ReqState {
                    server,
                    target,
                    packet: Packet::new(code, identifier, [0u8; 16]),
                    reply: None,
                    socket: None,
                    io: None,
                    sent_at: Instant::now(),
                    waiting: false,
                    stat,
                }),
                timeout: Mutex::new(None),
                async_busy: AtomicBool::new(false),
            }),
        })
    }

    pub(crate) fn server(&self) -> Arc<Server> {
        Arc::clone(&self.shared.state.lock().unwrap().server)
    }

    pub(crate) fn identifier(&self) -> u8 {
        self.shared.state.lock().unwrap().packet.identifier
    }

    /// Mutate the outbound packet. The caller re-signs afterwards.
    pub(crate) fn with_packet<T>(&self, f: impl FnOnce(&mut Packet) -> T) -> T {
        f(&mut self.shared.state.lock().unwrap().packet)
    }

    pub(crate) fn bump_identifier(&self) {
        let mut state = self.shared.state.lock().unwrap();
        state.packet.identifier = state.packet.identifier.wrapping_add(1);
    }

    /// Recompute the accounting request authenticator with the current
    /// server's secret.
    pub(crate) fn sign(&self) -> Result<(), RadiusError> {
        let mut state = self.shared.state.lock().unwrap();
        let ReqState { server, packet, .. } = &mut *state;
        sign_accounting(packet, server.secret())?;
        Ok(())
    }

    /// Charge sent/lost/latency to this stats slot from now on.
    pub(crate) fn set_stat(&self, stat: StatKind) {
        self.shared.state.lock().unwrap().stat = stat;
    }

    pub(crate) fn record_lost(&self) {
        let state = self.shared.state.lock().unwrap();
        state.server.stat(state.stat).record_lost();
    }

    /// Acquire an admission slot on the current server (may suspend the
    /// calling context).
    pub(crate) fn admission_enter(&self) -> Option<Admission> {
        let server = self.server();
        server.req_enter(&self.shared.ctx)
    }

    /// Open + connect + register the socket on first use, then transmit
    /// the current packet. A transport failure propagates to the caller.
    pub(crate) fn send(&self) -> Result<(), RadiusError> {
        let mut state = self.shared.state.lock().unwrap();
        if state.socket.is_none() {
            let bind: SocketAddr = if state.target.is_ipv4() {
                "0.0.0.0:0".parse().map_err(|_| RadiusError::NoServers)?
            } else {
                "[::]:0".parse().map_err(|_| RadiusError::NoServers)?
            };
            let socket = UdpSocket::bind(bind)?;
            socket.set_nonblocking(true)?;
            socket.connect(state.target)?;
            let io = self.shared.reactor.register_io(
                &self.shared.ctx,
                Arc::new(ReqIo {
                    fd: socket.as_raw_fd(),
                    shared: Arc::clone(&self.shared),
                }),
            );
            io.enable(Interest::READ)?;
            state.socket = Some(socket);
            state.io = Some(io);
        }
        let data = state.packet.encode()?;
        state.reply = None;
        state.sent_at = Instant::now();
        if let Some(socket) = state.socket.as_ref() {
            socket.send(&data)?;
        }
        if self.shared.verbose {
            debug!(
                server = state.server.id(),
                identifier = state.packet.identifier,
                code = ?state.packet.code,
                len = data.len(),
                "send"
            );
        }
        state.server.stat(state.stat).record_sent();
        Ok(())
    }

    /// Await a matching reply for up to `timeout`, cooperatively
    /// suspending the owning context. Returns `None` on timeout. Must run
    /// inside the owning context.
    pub(crate) fn wait_reply(&self, timeout: Duration) -> Option<Packet> {
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.reply.is_some() {
                return state.reply.take();
            }
            state.waiting = true;
        }
        let timer = self.shared.reactor.timer(
            &self.shared.ctx,
            Arc::new(WakeSink {
                shared: Arc::clone(&self.shared),
            }),
        );
        timer.arm(timeout, TimerKind::Oneshot);
        *self.shared.timeout.lock().unwrap() = Some(timer);
        // Wait until the reply lands or the one-shot timer has fired;
        // wakeups belonging to work that ran nested during the wait are
        // ignored.
        loop {
            self.shared.ctx.suspend();
            let state = self.shared.state.lock().unwrap();
            if state.reply.is_some() {
                break;
            }
            drop(state);
            let expired = self
                .shared
                .timeout
                .lock()
                .unwrap()
                .as_ref()
                .map_or(true, |timer| !timer.is_armed());
            if expired {
                break;
            }
        }
        if let Some(timer) = self.shared.timeout.lock().unwrap().take() {
            timer.cancel();
        }
        let mut state = self.shared.state.lock().unwrap();
        state.waiting = false;
        state.reply.take()
    }

    /// Install the asynchronous retry driver (periodic resend for interim
    /// updates).
    pub(crate) fn arm_response_timer(&self, period: Duration, sink: Arc<dyn TimerSink>) {
        let timer = self.shared.reactor.timer(&self.shared.ctx, sink);
        timer.arm(period, TimerKind::Periodic);
        *self.shared.timeout.lock().unwrap() = Some(timer);
    }

    /// Grow the retry period of the armed response timer.
    pub(crate) fn modify_response_timer(&self, period: Duration) {
        if let Some(timer) = self.shared.timeout.lock().unwrap().as_ref() {
            timer.modify(period);
        }
    }

    pub(crate) fn response_timer_period(&self) -> Option<Duration> {
        self.shared
            .timeout
            .lock()
            .unwrap()
            .as_ref()
            .map(|timer| timer.period())
    }

    /// Whether a response is still outstanding (retry driver armed).
    pub(crate) fn response_timer_armed(&self) -> bool {
        self.shared
            .timeout
            .lock()
            .unwrap()
            .as_ref()
            .map_or(false, |timer| timer.is_armed())
    }

    pub(crate) fn cancel_response_timer(&self) {
        if let Some(timer) = self.shared.timeout.lock().unwrap().take() {
            timer.cancel();
        }
    }

    pub(crate) fn take_reply(&self) -> Option<Packet> {
        self.shared.state.lock().unwrap().reply.take()
    }

    /// Claim the request for one timer-driven operation; false while one
    /// is already in flight.
    pub(crate) fn begin_async_op(&self) -> bool {
        !self.shared.async_busy.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn end_async_op(&self) {
        self.shared.async_busy.store(false, Ordering::SeqCst);
    }

    /// Move the request to a newly selected server, excluding the current
    /// one. On success the socket and read handler are recreated lazily by
    /// the next send; on failure the current assignment is kept.
    pub(crate) fn reassign(&self, pool: &ServerPool) -> Result<(), RadiusError> {
        let mut state = self.shared.state.lock().unwrap();
        let next = pool
            .select(self.shared.kind, Some(&state.server))
            .ok_or(RadiusError::NoServers)?;
        let target = match next.endpoint(self.shared.kind) {
            Some(target) => target,
            None => {
                next.release_client(self.shared.kind);
                return Err(RadiusError::NoServers);
            }
        };
        let previous = std::mem::replace(&mut state.server, next);
        previous.release_client(self.shared.kind);
        state.target = target;
        state.reply = None;
        if let Some(io) = state.io.take() {
            io.unregister();
        }
        state.socket = None;
        debug!(
            from = previous.id(),
            to = state.server.id(),
            "request reassigned"
        );
        Ok(())
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            if let Some(io) = state.io.take() {
                io.unregister();
            }
            state.socket = None;
            state.server.release_client(self.shared.kind);
        }
        if let Some(timer) = self.shared.timeout.lock().unwrap().take() {
            timer.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nas_reactor::Config;

    fn reactor() -> Arc<Reactor> {
        Reactor::new(Config {
            workers: 2,
            max_events: 32,
        })
        .unwrap()
    }

    fn acct_server() -> Arc<Server> {
        Arc::new(Server::from_parts(
            1,
            "127.0.0.1".parse().unwrap(),
            None,
            Some(1813),
            "secret".into(),
            Duration::ZERO,
            0,
        ))
    }

    #[test]
    fn test_new_requires_service_endpoint() {
        let reactor = reactor();
        let ctx = reactor.context();
        let server = acct_server();
        // The server has no auth port.
        let result = Request::new(
            Arc::clone(&reactor),
            ctx,
            ServiceKind::Auth,
            server,
            Code::AccessRequest,
            false,
        );
        assert!(matches!(result, Err(RadiusError::NoServers)));
        reactor.shutdown();
    }

    #[test]
    fn test_identifier_bump_wraps() {
        let reactor = reactor();
        let ctx = reactor.context();
        let request = Request::new(
            Arc::clone(&reactor),
            ctx,
            ServiceKind::Acct,
            acct_server(),
            Code::AccountingRequest,
            false,
        )
        .unwrap();
        request.with_packet(|packet| packet.identifier = 255);
        request.bump_identifier();
        assert_eq!(request.identifier(), 0);
        reactor.shutdown();
    }

    #[test]
    fn test_expected_codes() {
        assert!(expected_code(ServiceKind::Acct, Code::AccountingResponse));
        assert!(!expected_code(ServiceKind::Acct, Code::AccessAccept));
        assert!(expected_code(ServiceKind::Auth, Code::AccessAccept));
        assert!(expected_code(ServiceKind::Auth, Code::AccessReject));
        assert!(!expected_code(ServiceKind::Auth, Code::AccountingResponse));
    }
}
