//! Upstream server pool: health tracking, load-aware selection and
//! bounded concurrent-request admission with queueing.

use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use nas_reactor::Context;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, ServerConfig};
use crate::stats::{RollingStat, ServerStatus, ServiceStatus};

/// Service offered by a server; drives port selection and the per-service
/// active-client counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
    Auth,
    Acct,
}

impl ServiceKind {
    fn index(self) -> usize {
        match self {
            ServiceKind::Auth => 0,
            ServiceKind::Acct => 1,
        }
    }
}

/// Statistics slot. Interim updates share the accounting service but are
/// tracked separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StatKind {
    Auth = 0,
    Acct = 1,
    Interim = 2,
}

pub(crate) struct ServiceStats {
    sent: AtomicU64,
    lost: AtomicU64,
    lost_1m: RollingStat,
    lost_5m: RollingStat,
    query_1m: RollingStat,
    query_5m: RollingStat,
}

impl ServiceStats {
    fn new() -> ServiceStats {
        ServiceStats {
            sent: AtomicU64::new(0),
            lost: AtomicU64::new(0),
            lost_1m: RollingStat::new(60),
            lost_5m: RollingStat::new(5 * 60),
            query_1m: RollingStat::new(60),
            query_5m: RollingStat::new(5 * 60),
        }
    }

    pub(crate) fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_lost(&self) {
        self.lost.fetch_add(1, Ordering::Relaxed);
        self.lost_1m.add(1);
        self.lost_5m.add(1);
    }

    /// Record a query round-trip in milliseconds.
    pub(crate) fn record_query(&self, ms: u64) {
        self.query_1m.add(ms);
        self.query_5m.add(ms);
    }

    fn snapshot(&self) -> ServiceStatus {
        ServiceStatus {
            sent: self.sent.load(Ordering::Relaxed),
            lost: self.lost.load(Ordering::Relaxed),
            lost_5m: self.lost_5m.count(),
            lost_1m: self.lost_1m.count(),
            query_avg_5m_ms: self.query_5m.avg(),
            query_avg_1m_ms: self.query_1m.avg(),
        }
    }
}

struct Policy {
    fail_time: Duration,
    req_limit: usize,
}

/// A request parked in the admission queue. The grant flag distinguishes
/// a freed slot from a failure/retirement drain, and lets the suspended
/// context tell its own wakeup apart from signals meant for work that ran
/// nested while it waited.
struct Waiter {
    ctx: Arc<Context>,
    granted: AtomicBool,
}

struct Admit {
    req_cnt: usize,
    queue: VecDeque<Arc<Waiter>>,
}

/// One configured upstream server.
///
/// Created when first referenced by configuration; removed from the pool at
/// retirement and released once the last in-flight request drops its
/// reference.
pub struct Server {
    id: u32,
    addr: IpAddr,
    auth_port: Option<u16>,
    acct_port: Option<u16>,
    secret: String,
    /// Mutable policy, updated in place on configuration reload.
    policy: Mutex<Policy>,
    /// Back-off deadline; `None` or a past instant means healthy.
    fail_until: Mutex<Option<Instant>>,
    fail_count: AtomicU64,
    client_cnt: [AtomicUsize; 2],
    admit: Mutex<Admit>,
    timeout_cnt: AtomicU32,
    retiring: AtomicBool,
    stats: [ServiceStats; 3],
}

/// Proof of admission. Exactly one release per successful
/// [`Server::req_enter`], on every path: dropping the ticket releases the
/// slot and wakes the next queued request.
pub(crate) struct Admission {
    server: Arc<Server>,
    counted: bool,
    released: bool,
}

impl Admission {
    pub(crate) fn exit(self) {
        // Drop releases.
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if !self.counted {
            return;
        }
        let limit = self.server.policy.lock().unwrap().req_limit;
        let mut admit = self.server.admit.lock().unwrap();
        admit.req_cnt = admit.req_cnt.saturating_sub(1);
        if admit.req_cnt < limit || limit == 0 {
            if let Some(waiter) = admit.queue.pop_front() {
                waiter.granted.store(true, Ordering::SeqCst);
                waiter.ctx.wakeup();
            }
        }
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        self.release();
    }
}

impl Server {
    fn from_config(
        id: u32,
        config: &ServerConfig,
        addr: IpAddr,
        default_fail: Duration,
        default_limit: usize,
    ) -> Server {
        Server::from_parts(
            id,
            addr,
            config.auth_port,
            config.acct_port,
            config.secret.clone(),
            config
                .fail_time_secs
                .map(Duration::from_secs)
                .unwrap_or(default_fail),
            if config.req_limit > 0 {
                config.req_limit
            } else {
                default_limit
            },
        )
    }

    pub(crate) fn from_parts(
        id: u32,
        addr: IpAddr,
        auth_port: Option<u16>,
        acct_port: Option<u16>,
        secret: String,
        fail_time: Duration,
        req_limit: usize,
    ) -> Server {
        Server {
            id,
            addr,
            auth_port,
            acct_port,
            secret,
            policy: Mutex::new(Policy {
                fail_time,
                req_limit,
            }),
            fail_until: Mutex::new(None),
            fail_count: AtomicU64::new(0),
            client_cnt: [AtomicUsize::new(0), AtomicUsize::new(0)],
            admit: Mutex::new(Admit {
                req_cnt: 0,
                queue: VecDeque::new(),
            }),
            timeout_cnt: AtomicU32::new(0),
            retiring: AtomicBool::new(false),
            stats: [ServiceStats::new(), ServiceStats::new(), ServiceStats::new()],
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub(crate) fn secret(&self) -> &[u8] {
        self.secret.as_bytes()
    }

    pub(crate) fn offers(&self, kind: ServiceKind) -> bool {
        match kind {
            ServiceKind::Auth => self.auth_port.is_some(),
            ServiceKind::Acct => self.acct_port.is_some(),
        }
    }

    pub(crate) fn endpoint(&self, kind: ServiceKind) -> Option<SocketAddr> {
        let port = match kind {
            ServiceKind::Auth => self.auth_port?,
            ServiceKind::Acct => self.acct_port?,
        };
        Some(SocketAddr::new(self.addr, port))
    }

    pub(crate) fn in_backoff(&self) -> bool {
        self.fail_until
            .lock()
            .unwrap()
            .map_or(false, |until| Instant::now() < until)
    }

    pub(crate) fn is_retiring(&self) -> bool {
        self.retiring.load(Ordering::SeqCst)
    }

    fn client_count(&self, kind: ServiceKind) -> usize {
        self.client_cnt[kind.index()].load(Ordering::SeqCst)
    }

    fn acquire_client(&self, kind: ServiceKind) {
        self.client_cnt[kind.index()].fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn release_client(&self, kind: ServiceKind) {
        let _ = self.client_cnt[kind.index()]
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                Some(v.saturating_sub(1))
            });
    }

    pub(crate) fn stat(&self, kind: StatKind) -> &ServiceStats {
        &self.stats[kind as usize]
    }

    /// Push the server into back-off (idempotent while a back-off is
    /// already active) and wake queued requests so they can retry against
    /// another server.
    pub(crate) fn mark_failed(&self) {
        let fail_time = self.policy.lock().unwrap().fail_time;
        let mut admit = self.admit.lock().unwrap();
        {
            let mut until = self.fail_until.lock().unwrap();
            let now = Instant::now();
            let active = until.map_or(false, |u| now < u);
            if !active {
                *until = Some(now + fail_time);
                self.fail_count.fetch_add(1, Ordering::Relaxed);
                warn!(server = self.id, address = %self.addr, "server not responding");
            }
        }
        if !fail_time.is_zero() {
            while let Some(waiter) = admit.queue.pop_front() {
                waiter.ctx.wakeup();
            }
        }
    }

    /// Count a consecutive response timeout; hitting `max_try` fails the
    /// server.
    pub(crate) fn report_timeout(&self, max_try: u32) {
        if self.timeout_cnt.fetch_add(1, Ordering::SeqCst) + 1 >= max_try {
            self.mark_failed();
        }
    }

    /// Any successful reply resets the consecutive-timeout counter.
    pub(crate) fn report_reply(&self) {
        self.timeout_cnt.store(0, Ordering::SeqCst);
    }

    /// Acquire an admission slot, suspending the calling session's context
    /// while the server is at its concurrent-request limit.
    ///
    /// Returns `None` when the server is in back-off or being retired,
    /// including when woken from the wait queue for either reason. Must be
    /// called from within `ctx`'s own callback.
    pub(crate) fn req_enter(self: &Arc<Self>, ctx: &Arc<Context>) -> Option<Admission> {
        if self.is_retiring() || self.in_backoff() {
            return None;
        }
        let limit = self.policy.lock().unwrap().req_limit;
        if limit == 0 {
            return Some(Admission {
                server: Arc::clone(self),
                counted: false,
                released: false,
            });
        }
        let mut admit = self.admit.lock().unwrap();
        if self.in_backoff() {
            return None;
        }
        if admit.req_cnt >= limit {
            let waiter = Arc::new(Waiter {
                ctx: Arc::clone(ctx),
                granted: AtomicBool::new(false),
            });
            admit.queue.push_back(Arc::clone(&waiter));
            drop(admit);
            // Cooperative yield: the context keeps processing its other
            // pending work until exit(), mark_failed() or retirement wakes
            // it. The waker removed us from the queue; a wakeup belonging
            // to work that ran nested during the wait is ignored here.
            loop {
                ctx.suspend();
                if waiter.granted.load(Ordering::SeqCst) {
                    break;
                }
                if self.in_backoff() || self.is_retiring() {
                    return None;
                }
            }
            admit = self.admit.lock().unwrap();
            if self.in_backoff() || self.is_retiring() {
                // Failed between the grant and here; the freed slot stays
                // unclaimed.
                return None;
            }
        }
        admit.req_cnt += 1;
        Some(Admission {
            server: Arc::clone(self),
            counted: true,
            released: false,
        })
    }

    fn update_policy(&self, config: &ServerConfig, default_fail: Duration, default_limit: usize) {
        let mut policy = self.policy.lock().unwrap();
        policy.fail_time = config
            .fail_time_secs
            .map(Duration::from_secs)
            .unwrap_or(default_fail);
        policy.req_limit = if config.req_limit > 0 {
            config.req_limit
        } else {
            default_limit
        };
    }

    fn retire(&self) {
        self.retiring.store(true, Ordering::SeqCst);
        let mut admit = self.admit.lock().unwrap();
        while let Some(waiter) = admit.queue.pop_front() {
            waiter.ctx.wakeup();
        }
    }

    /// Read-only status snapshot for diagnostics.
    pub fn status(&self) -> ServerStatus {
        let admit = self.admit.lock().unwrap();
        ServerStatus {
            id: self.id,
            address: self.addr.to_string(),
            state: if self.in_backoff() {
                "failed".into()
            } else {
                "active".into()
            },
            fail_count: self.fail_count.load(Ordering::Relaxed),
            request_count: admit.req_cnt,
            queue_length: admit.queue.len(),
            auth: self
                .auth_port
                .map(|_| self.stats[StatKind::Auth as usize].snapshot()),
            acct: self
                .acct_port
                .map(|_| self.stats[StatKind::Acct as usize].snapshot()),
            interim: self
                .acct_port
                .map(|_| self.stats[StatKind::Interim as usize].snapshot()),
        }
    }
}

/// The set of configured servers. Owned by the client with an explicit
/// lifecycle; no process-wide registry.
pub struct ServerPool {
    servers: Mutex<Vec<Arc<Server>>>,
    next_id: AtomicU32,
}

impl ServerPool {
    pub fn new() -> ServerPool {
        ServerPool {
            servers: Mutex::new(Vec::new()),
            next_id: AtomicU32::new(0),
        }
    }

    /// Among servers offering `kind` whose back-off has elapsed, pick the
    /// one with the fewest active clients for that service (ties broken by
    /// configuration order) and count the caller against it.
    pub(crate) fn select(
        &self,
        kind: ServiceKind,
        exclude: Option<&Arc<Server>>,
    ) -> Option<Arc<Server>> {
        let servers = self.servers.lock().unwrap();
        let mut best: Option<&Arc<Server>> = None;
        for server in servers.iter() {
            if let Some(excluded) = exclude {
                if Arc::ptr_eq(server, excluded) {
                    continue;
                }
            }
            if !server.offers(kind) || server.in_backoff() {
                continue;
            }
            match best {
                Some(current) if server.client_count(kind) >= current.client_count(kind) => {}
                _ => best = Some(server),
            }
        }
        let server = Arc::clone(best?);
        server.acquire_client(kind);
        Some(server)
    }

    /// Whether any configured server offers the service at all.
    pub(crate) fn has_service(&self, kind: ServiceKind) -> bool {
        self.servers
            .lock()
            .unwrap()
            .iter()
            .any(|server| server.offers(kind))
    }

    /// Apply a (re)loaded server list: matching entries update their
    /// mutable policy in place without disrupting in-flight requests, new
    /// entries are added, absent entries are retired and their wait queues
    /// drained.
    pub fn reload(
        &self,
        configs: &[ServerConfig],
        default_fail: Duration,
        default_limit: usize,
    ) -> Result<(), ConfigError> {
        for config in configs {
            config.validate()?;
        }
        let mut servers = self.servers.lock().unwrap();
        for server in servers.iter() {
            server.retiring.store(true, Ordering::SeqCst);
        }
        for config in configs {
            let addr: IpAddr = match config.address.parse() {
                Ok(addr) => addr,
                Err(_) => continue,
            };
            let existing = servers.iter().find(|server| {
                server.addr == addr
                    && server.auth_port == config.auth_port
                    && server.acct_port == config.acct_port
            });
            match existing {
                Some(server) => {
                    server.update_policy(config, default_fail, default_limit);
                    server.retiring.store(false, Ordering::SeqCst);
                }
                None => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
                    debug!(server = id, address = %addr, "server added");
                    servers.push(Arc::new(Server::from_config(
                        id,
                        config,
                        addr,
                        default_fail,
                        default_limit,
                    )));
                }
            }
        }
        servers.retain(|server| {
            if server.is_retiring() {
                server.retire();
                info!(server = server.id, address = %server.addr, "server retired");
                false
            } else {
                true
            }
        });
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn insert(&self, server: Server) -> Arc<Server> {
        let server = Arc::new(server);
        self.servers.lock().unwrap().push(Arc::clone(&server));
        server
    }

    pub fn status(&self) -> Vec<ServerStatus> {
        self.servers
            .lock()
            .unwrap()
            .iter()
            .map(|server| server.status())
            .collect()
    }
}

impl Default for ServerPool {
    fn default() -> Self {
        ServerPool::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nas_reactor::{Config, Reactor};
    use std::thread;

    fn test_server(id: u32, fail_time: Duration, req_limit: usize) -> Server {
        Server::from_parts(
            id,
            format!("192.0.2.{id}").parse().unwrap(),
            Some(1812),
            Some(1813),
            "secret".into(),
            fail_time,
            req_limit,
        )
    }

    fn pool_of(servers: Vec<Server>) -> ServerPool {
        let pool = ServerPool::new();
        for server in servers {
            pool.insert(server);
        }
        pool
    }

    #[test]
    fn test_select_prefers_least_loaded() {
        let pool = pool_of(vec![
            test_server(1, Duration::ZERO, 0),
            test_server(2, Duration::ZERO, 0),
        ]);
        let a = pool.select(ServiceKind::Acct, None).unwrap();
        assert_eq!(a.id(), 1);
        // Server 1 now carries one client; 2 is less loaded.
        let b = pool.select(ServiceKind::Acct, None).unwrap();
        assert_eq!(b.id(), 2);
        // Tie again: configuration order wins.
        let c = pool.select(ServiceKind::Acct, None).unwrap();
        assert_eq!(c.id(), 1);
        a.release_client(ServiceKind::Acct);
        b.release_client(ServiceKind::Acct);
        c.release_client(ServiceKind::Acct);
    }

    #[test]
    fn test_select_excludes_and_filters_service() {
        let auth_only = Server::from_parts(
            1,
            "192.0.2.1".parse().unwrap(),
            Some(1812),
            None,
            "secret".into(),
            Duration::ZERO,
            0,
        );
        let pool = pool_of(vec![]);
        pool.insert(auth_only);
        assert!(pool.select(ServiceKind::Acct, None).is_none());

        let acct = pool.select(ServiceKind::Auth, None).unwrap();
        assert!(pool.select(ServiceKind::Auth, Some(&acct)).is_none());
        acct.release_client(ServiceKind::Auth);
    }

    #[test]
    fn test_failed_server_excluded_until_backoff_expires() {
        let pool = pool_of(vec![test_server(1, Duration::from_millis(300), 0)]);
        let server = pool.select(ServiceKind::Acct, None).unwrap();
        server.release_client(ServiceKind::Acct);

        server.mark_failed();
        assert!(pool.select(ServiceKind::Acct, None).is_none());

        thread::sleep(Duration::from_millis(350));
        assert!(pool.select(ServiceKind::Acct, None).is_some());
    }

    #[test]
    fn test_consecutive_timeouts_fail_server_and_reply_resets() {
        let server = Arc::new(test_server(1, Duration::from_secs(30), 0));
        server.report_timeout(3);
        server.report_timeout(3);
        assert!(!server.in_backoff());
        server.report_timeout(3);
        assert!(server.in_backoff());

        let fresh = Arc::new(test_server(2, Duration::from_secs(30), 0));
        fresh.report_timeout(3);
        fresh.report_reply();
        fresh.report_timeout(3);
        fresh.report_timeout(3);
        assert!(!fresh.in_backoff());
    }

    #[test]
    fn test_mark_failed_is_idempotent_under_races() {
        let server = test_server(1, Duration::from_secs(30), 0);
        server.mark_failed();
        server.mark_failed();
        assert_eq!(server.status().fail_count, 1);
    }

    #[test]
    fn test_admission_bound_never_exceeded() {
        let reactor = Reactor::new(Config {
            workers: 8,
            max_events: 32,
        })
        .unwrap();
        let server = Arc::new(test_server(1, Duration::ZERO, 2));

        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut joins = Vec::new();
        for _ in 0..6 {
            let reactor = Arc::clone(&reactor);
            let server = Arc::clone(&server);
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            joins.push(thread::spawn(move || {
                let ctx = reactor.context();
                let ctx2 = Arc::clone(&ctx);
                ctx.call_wait(move || {
                    let admission = server.req_enter(&ctx2).expect("healthy server admits");
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(30));
                    active.fetch_sub(1, Ordering::SeqCst);
                    admission.exit();
                });
            }));
        }
        for join in joins {
            join.join().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(server.status().request_count, 0);
        assert_eq!(server.status().queue_length, 0);
        reactor.shutdown();
    }

    #[test]
    fn test_admission_queue_is_fifo() {
        let reactor = Reactor::new(Config {
            workers: 8,
            max_events: 32,
        })
        .unwrap();
        let server = Arc::new(test_server(1, Duration::ZERO, 1));

        // Take the only slot.
        let holder_ctx = reactor.context();
        let hc = Arc::clone(&holder_ctx);
        let hs = Arc::clone(&server);
        let holder = holder_ctx.call_wait(move || hs.req_enter(&hc).unwrap());

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut joins = Vec::new();
        for tag in 0..3 {
            let reactor = Arc::clone(&reactor);
            let server = Arc::clone(&server);
            let order = Arc::clone(&order);
            joins.push(thread::spawn(move || {
                let ctx = reactor.context();
                let ctx2 = Arc::clone(&ctx);
                ctx.call_wait(move || {
                    let admission = server.req_enter(&ctx2).unwrap();
                    order.lock().unwrap().push(tag);
                    admission.exit();
                });
            }));
            // Stagger queue arrival so the FIFO order is deterministic.
            thread::sleep(Duration::from_millis(50));
        }

        thread::sleep(Duration::from_millis(50));
        holder.exit();
        for join in joins {
            join.join().unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
        reactor.shutdown();
    }

    #[test]
    fn test_failure_wakes_queued_requests() {
        let reactor = Reactor::new(Config {
            workers: 4,
            max_events: 32,
        })
        .unwrap();
        let server = Arc::new(test_server(1, Duration::from_secs(30), 1));

        let holder_ctx = reactor.context();
        let hc = Arc::clone(&holder_ctx);
        let hs = Arc::clone(&server);
        let holder = holder_ctx.call_wait(move || hs.req_enter(&hc).unwrap());

        let waiter = {
            let reactor = Arc::clone(&reactor);
            let server = Arc::clone(&server);
            thread::spawn(move || {
                let ctx = reactor.context();
                let ctx2 = Arc::clone(&ctx);
                ctx.call_wait(move || server.req_enter(&ctx2).is_none())
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert_eq!(server.status().queue_length, 1);
        server.mark_failed();
        assert!(waiter.join().unwrap(), "queued request must observe failure");
        holder.exit();
        reactor.shutdown();
    }

    #[test]
    fn test_reload_updates_in_place_and_retires() {
        let pool = ServerPool::new();
        let config = ServerConfig {
            address: "192.0.2.1".into(),
            secret: "secret".into(),
            auth_port: Some(1812),
            acct_port: Some(1813),
            req_limit: 0,
            fail_time_secs: None,
        };
        pool.reload(&[config.clone()], Duration::ZERO, 0).unwrap();
        let first = pool.select(ServiceKind::Acct, None).unwrap();

        // Same endpoint with a new limit: policy updated, server kept.
        let mut updated = config.clone();
        updated.req_limit = 5;
        pool.reload(&[updated], Duration::ZERO, 0).unwrap();
        let after = pool.select(ServiceKind::Acct, None).unwrap();
        assert!(Arc::ptr_eq(&first, &after));
        assert_eq!(after.policy.lock().unwrap().req_limit, 5);

        // Absent from the new list: retired.
        pool.reload(&[], Duration::ZERO, 0).unwrap();
        assert!(pool.select(ServiceKind::Acct, None).is_none());
        assert!(first.is_retiring());
        first.release_client(ServiceKind::Acct);
        after.release_client(ServiceKind::Acct);
    }
}
