//! The AAA client: owns the server pool and the policy knobs, and hands
//! out sessions bound to reactor execution contexts.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use nas_reactor::Reactor;
use tracing::info;

use crate::config::{ClientConfig, ConfigError, ServerConfig};
use crate::server::{ServerPool, ServiceKind};
use crate::session::{LinkStats, Session, SessionControl};
use crate::stats::ServerStatus;

pub(crate) struct Settings {
    pub(crate) timeout: Duration,
    pub(crate) max_try: u32,
    /// Overall accounting deadline; `ZERO` = give up silently.
    pub(crate) acct_timeout: Duration,
    pub(crate) acct_delay_time: bool,
    pub(crate) interim_interval: Option<Duration>,
    pub(crate) interim_safe_margin: Duration,
    pub(crate) fail_time: Duration,
    pub(crate) req_limit: usize,
    pub(crate) nas_identifier: Option<String>,
    pub(crate) nas_ip_address: Option<Ipv4Addr>,
    pub(crate) verbose: bool,
}

impl Settings {
    fn from_config(config: &ClientConfig) -> Settings {
        Settings {
            timeout: Duration::from_secs(config.timeout_secs),
            max_try: config.max_try,
            acct_timeout: Duration::from_secs(config.acct_timeout_secs),
            acct_delay_time: config.acct_delay_time,
            interim_interval: match config.interim_interval_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            interim_safe_margin: Duration::from_secs(config.interim_safe_margin_secs),
            fail_time: Duration::from_secs(config.fail_time_secs),
            req_limit: config.req_limit,
            nas_identifier: config.nas_identifier.clone(),
            nas_ip_address: config.nas_ip_address,
            verbose: config.verbose,
        }
    }
}

/// Identity and policy for a new session.
#[derive(Debug, Clone)]
pub struct SessionSpec {
    pub session_id: String,
    pub username: String,
    pub nas_port: u32,
    /// Absolute session lifetime, when the NAS enforces one.
    pub session_timeout: Option<Duration>,
    /// Overrides the configured interim interval (e.g. from the auth
    /// reply's Acct-Interim-Interval attribute).
    pub interim_interval: Option<Duration>,
}

/// RADIUS AAA client. One per daemon, explicitly owned; create with
/// [`RadiusClient::new`] and share via `Arc`.
pub struct RadiusClient {
    pub(crate) reactor: Arc<Reactor>,
    pub(crate) pool: ServerPool,
    pub(crate) settings: Settings,
}

impl RadiusClient {
    pub fn new(reactor: Arc<Reactor>, config: &ClientConfig) -> Result<Arc<RadiusClient>, ConfigError> {
        config.validate()?;
        let settings = Settings::from_config(config);
        let pool = ServerPool::new();
        pool.reload(&config.servers, settings.fail_time, settings.req_limit)?;
        info!(servers = config.servers.len(), "radius client ready");
        Ok(Arc::new(RadiusClient {
            reactor,
            pool,
            settings,
        }))
    }

    /// Re-parse the server list: matching servers keep their state and get
    /// their policy updated in place, new ones are added, absent ones are
    /// retired without disrupting in-flight requests.
    pub fn reload(&self, servers: &[ServerConfig]) -> Result<(), ConfigError> {
        self.pool
            .reload(servers, self.settings.fail_time, self.settings.req_limit)
    }

    /// Create a session bound to a fresh execution context.
    pub fn open_session(
        &self,
        spec: SessionSpec,
        link: Arc<dyn LinkStats>,
        control: Arc<dyn SessionControl>,
    ) -> Arc<Session> {
        Session::new(
            self.reactor.context(),
            spec.session_id,
            spec.username,
            spec.nas_port,
            link,
            control,
            spec.session_timeout,
            spec.interim_interval,
        )
    }

    /// Whether any configured server accepts accounting at all.
    pub fn accounting_enabled(&self) -> bool {
        self.pool.has_service(ServiceKind::Acct)
    }

    /// Read-only per-server diagnostics.
    pub fn server_status(&self) -> Vec<ServerStatus> {
        self.pool.status()
    }
}
