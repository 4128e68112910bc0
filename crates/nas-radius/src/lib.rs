//! RADIUS AAA client for a network-access-server daemon.
//!
//! Built on the [`nas_reactor`] runtime: every session runs in its own
//! execution context, and the client's blocking operations (authenticate,
//! accounting start/stop) suspend that context cooperatively instead of
//! stalling a thread's other work.
//!
//! # Components
//!
//! - [`RadiusClient`]: owns the server pool and policy; entry point for
//!   authentication and accounting.
//! - Server pool: health tracking (fail/back-off), load-aware selection,
//!   and per-server admission control with a FIFO wait queue.
//! - Request lifecycle: compose, sign, admit, transmit, await reply,
//!   retry with escalating periods, reassign across servers on failure.
//! - Accounting flow: Start / Interim-Update / Stop with delay-time
//!   correction, gigaword counters and termination-cause mapping.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use nas_radius::{ClientConfig, RadiusClient, SessionSpec};
//! use nas_reactor::Reactor;
//!
//! # fn link() -> Arc<dyn nas_radius::LinkStats> { unimplemented!() }
//! # fn control() -> Arc<dyn nas_radius::SessionControl> { unimplemented!() }
//! let reactor = Reactor::new(Default::default()).unwrap();
//! let config = ClientConfig::from_file("radius.json").unwrap();
//! let client = RadiusClient::new(Arc::clone(&reactor), &config).unwrap();
//!
//! let session = client.open_session(
//!     SessionSpec {
//!         session_id: "0123abcd".into(),
//!         username: "alice".into(),
//!         nas_port: 1,
//!         session_timeout: None,
//!         interim_interval: None,
//!     },
//!     link(),
//!     control(),
//! );
//! // From within the session's context:
//! let client2 = Arc::clone(&client);
//! let session2 = Arc::clone(&session);
//! session.context().call(move || {
//!     client2.accounting_start(&session2).unwrap();
//! });
//! ```

mod acct;
mod attribute;
mod auth;
mod client;
mod config;
mod digest;
mod error;
mod packet;
mod request;
mod server;
mod session;
mod stats;

pub use attribute::{AcctStatusType, Attribute, AttributeType};
pub use auth::AuthOutcome;
pub use client::{RadiusClient, SessionSpec};
pub use config::{ClientConfig, ConfigError, ServerConfig};
pub use digest::{
    encrypt_password, request_authenticator, response_authenticator, sign_accounting,
    verify_response,
};
pub use error::RadiusError;
pub use packet::{Code, Packet, PacketError};
pub use server::{Server, ServerPool, ServiceKind};
pub use session::{LinkCounters, LinkStats, Session, SessionControl, TerminateCause};
pub use stats::{RollingStat, ServerStatus, ServiceStatus};
