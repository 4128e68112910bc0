//! Per-session state consumed by the accounting flow.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use nas_reactor::{Context, Timer};

use crate::request::Request;

/// Link traffic counters as exposed by the kernel: 32-bit, wrapping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkCounters {
    pub rx_bytes: u32,
    pub tx_bytes: u32,
    pub rx_packets: u32,
    pub tx_packets: u32,
}

/// External collaborator reading a session's link statistics.
pub trait LinkStats: Send + Sync {
    fn read_stats(&self) -> std::io::Result<LinkCounters>;
}

/// External collaborator tearing a session down on NAS-side failures
/// (e.g. accounting pool exhaustion).
pub trait SessionControl: Send + Sync {
    fn terminate(&self, cause: TerminateCause);
}

/// Why a session ended, mapped onto Acct-Terminate-Cause (RFC 2866
/// Section 5.10) wire values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateCause {
    UserRequest,
    SessionTimeout,
    AdminReset,
    UserError,
    NasError,
    NasRequest,
    NasReboot,
    AuthError,
    LostCarrier,
}

impl TerminateCause {
    pub fn acct_value(self) -> u32 {
        match self {
            TerminateCause::UserRequest => 1,
            TerminateCause::LostCarrier => 2,
            TerminateCause::SessionTimeout => 5,
            TerminateCause::AdminReset => 6,
            TerminateCause::NasError => 9,
            TerminateCause::NasRequest => 10,
            TerminateCause::NasReboot => 11,
            // Authentication failures are reported as user errors.
            TerminateCause::UserError | TerminateCause::AuthError => 17,
        }
    }
}

pub(crate) struct AcctState {
    /// Start record acknowledged; accounting is live.
    pub(crate) started: bool,
    /// Active accounting request; taken exactly once by stop.
    pub(crate) request: Option<Arc<Request>>,
    pub(crate) interim_timer: Option<Timer>,
    /// Last successful exchange marker; Acct-Delay-Time is measured from
    /// here.
    pub(crate) acct_timestamp: Instant,
    pub(crate) input_gigawords: u32,
    pub(crate) output_gigawords: u32,
    last_rx_bytes: u32,
    last_tx_bytes: u32,
    /// Set once at termination; freezes Acct-Session-Time.
    pub(crate) stopped_at: Option<Instant>,
}

/// One PPP session as seen by the AAA client: identity, execution context,
/// traffic counters and accounting state.
pub struct Session {
    ctx: Arc<Context>,
    session_id: String,
    username: String,
    nas_port: u32,
    started_at: Instant,
    link: Arc<dyn LinkStats>,
    control: Arc<dyn SessionControl>,
    /// Absolute session lifetime, when enforced.
    session_timeout: Option<Duration>,
    /// Per-session interim override (e.g. delivered by the auth reply).
    interim_interval: Option<Duration>,
    pub(crate) acct: Mutex<AcctState>,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        ctx: Arc<Context>,
        session_id: String,
        username: String,
        nas_port: u32,
        link: Arc<dyn LinkStats>,
        control: Arc<dyn SessionControl>,
        session_timeout: Option<Duration>,
        interim_interval: Option<Duration>,
    ) -> Arc<Session> {
        Arc::new(Session {
            ctx,
            session_id,
            username,
            nas_port,
            started_at: Instant::now(),
            link,
            control,
            session_timeout,
            interim_interval,
            acct: Mutex::new(AcctState {
                started: false,
                request: None,
                interim_timer: None,
                acct_timestamp: Instant::now(),
                input_gigawords: 0,
                output_gigawords: 0,
                last_rx_bytes: 0,
                last_tx_bytes: 0,
                stopped_at: None,
            }),
        })
    }

    /// The session's execution context. Accounting operations must be
    /// invoked from within it.
    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn nas_port(&self) -> u32 {
        self.nas_port
    }

    pub(crate) fn control(&self) -> &Arc<dyn SessionControl> {
        &self.control
    }

    pub(crate) fn interim_interval(&self) -> Option<Duration> {
        self.interim_interval
    }

    /// Seconds the session has been up, frozen at the recorded stop time.
    pub(crate) fn session_time(&self) -> u64 {
        let acct = self.acct.lock().unwrap();
        match acct.stopped_at {
            Some(stopped) => stopped.duration_since(self.started_at).as_secs(),
            None => self.started_at.elapsed().as_secs(),
        }
    }

    /// Remaining lifetime before the absolute session timeout, if one is
    /// enforced.
    pub(crate) fn remaining_lifetime(&self) -> Option<Duration> {
        self.session_timeout
            .map(|timeout| timeout.saturating_sub(self.started_at.elapsed()))
    }

    /// Read the link counters and fold 32-bit wraparound into the gigaword
    /// accumulators.
    pub(crate) fn traffic_snapshot(&self) -> std::io::Result<TrafficSnapshot> {
        let counters = self.link.read_stats()?;
        let mut acct = self.acct.lock().unwrap();
        if counters.rx_bytes < acct.last_rx_bytes {
            acct.input_gigawords = acct.input_gigawords.wrapping_add(1);
        }
        if counters.tx_bytes < acct.last_tx_bytes {
            acct.output_gigawords = acct.output_gigawords.wrapping_add(1);
        }
        acct.last_rx_bytes = counters.rx_bytes;
        acct.last_tx_bytes = counters.tx_bytes;
        Ok(TrafficSnapshot {
            counters,
            input_gigawords: acct.input_gigawords,
            output_gigawords: acct.output_gigawords,
            session_time: match acct.stopped_at {
                Some(stopped) => stopped.duration_since(self.started_at).as_secs(),
                None => self.started_at.elapsed().as_secs(),
            },
        })
    }
}

/// Traffic counters ready to be written into an accounting packet.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TrafficSnapshot {
    pub(crate) counters: LinkCounters,
    pub(crate) input_gigawords: u32,
    pub(crate) output_gigawords: u32,
    pub(crate) session_time: u64,
}
