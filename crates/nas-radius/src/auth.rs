//! PAP authentication against the auth service of the pool, built on the
//! same request lifecycle as accounting.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::attribute::{Attribute, AttributeType};
use crate::client::RadiusClient;
use crate::digest::{encrypt_password, request_authenticator};
use crate::error::RadiusError;
use crate::packet::{Code, PacketError};
use crate::request::Request;
use crate::server::{ServiceKind, StatKind};
use crate::session::Session;

/// Result of a completed authentication exchange. A reject is a protocol
/// outcome, not an error.
#[derive(Debug)]
pub enum AuthOutcome {
    /// Access-Accept, with the reply attributes (Framed-IP-Address,
    /// Session-Timeout, ...) for the session layer to apply.
    Accept(Vec<Attribute>),
    Reject,
}

impl RadiusClient {
    /// Authenticate a session with PAP, blocking the calling context
    /// through retries and server failover. Running out of servers fails
    /// session setup with [`RadiusError::NoServers`].
    ///
    /// Must be called from within the session's execution context.
    pub fn authenticate(
        self: &Arc<Self>,
        session: &Arc<Session>,
        password: &str,
    ) -> Result<AuthOutcome, RadiusError> {
        let server = self
            .pool
            .select(ServiceKind::Auth, None)
            .ok_or(RadiusError::NoServers)?;
        let request = Request::new(
            Arc::clone(&self.reactor),
            Arc::clone(session.context()),
            ServiceKind::Auth,
            server,
            Code::AccessRequest,
            self.settings.verbose,
        )?;
        request.set_stat(StatKind::Auth);
        self.prepare_access_request(session, &request, password)?;

        loop {
            let admission = match request.admission_enter() {
                Some(admission) => admission,
                None => {
                    request.reassign(&self.pool)?;
                    // The secret changed with the server; re-obfuscate.
                    self.prepare_access_request(session, &request, password)?;
                    continue;
                }
            };

            let mut reply = None;
            let mut transport: Result<(), RadiusError> = Ok(());
            for _attempt in 0..self.settings.max_try {
                if let Err(err) = request.send() {
                    transport = Err(err);
                    break;
                }
                match request.wait_reply(self.settings.timeout) {
                    Some(packet) => {
                        reply = Some(packet);
                        break;
                    }
                    None => request.record_lost(),
                }
            }
            admission.exit();
            transport?;

            if let Some(reply) = reply {
                return Ok(match reply.code {
                    Code::AccessAccept => {
                        debug!(user = session.username(), "access accepted");
                        AuthOutcome::Accept(reply.attributes)
                    }
                    _ => {
                        debug!(user = session.username(), "access rejected");
                        AuthOutcome::Reject
                    }
                });
            }
            warn!(
                user = session.username(),
                server = request.server().id(),
                "authentication retries exhausted"
            );
            request.server().mark_failed();
            request.reassign(&self.pool)?;
            self.prepare_access_request(session, &request, password)?;
        }
    }

    /// (Re)build the Access-Request: fresh request authenticator, identity
    /// attributes, password obfuscated with the current server's secret.
    fn prepare_access_request(
        &self,
        session: &Arc<Session>,
        request: &Request,
        password: &str,
    ) -> Result<(), RadiusError> {
        let authenticator = request_authenticator();
        let secret = request.server().secret().to_vec();
        let encrypted = encrypt_password(password, &secret, &authenticator);
        let nas_identifier = self.settings.nas_identifier.clone();
        let nas_ip = self.settings.nas_ip_address;
        let username = session.username().to_string();
        let nas_port = session.nas_port();
        request.with_packet(move |packet| -> Result<(), PacketError> {
            packet.authenticator = authenticator;
            packet.attributes.clear();
            packet.add_attribute(Attribute::string(AttributeType::UserName.as_u8(), username)?);
            packet.add_attribute(Attribute::new(AttributeType::UserPassword.as_u8(), encrypted)?);
            // Service-Type = Framed, Framed-Protocol = PPP
            packet.set_integer(AttributeType::ServiceType, 2);
            packet.set_integer(AttributeType::FramedProtocol, 1);
            packet.set_integer(AttributeType::NasPort, nas_port);
            if let Some(identifier) = nas_identifier {
                packet.add_attribute(Attribute::string(
                    AttributeType::NasIdentifier.as_u8(),
                    identifier,
                )?);
            }
            if let Some(ip) = nas_ip {
                packet.add_attribute(Attribute::ipv4(
                    AttributeType::NasIpAddress.as_u8(),
                    ip.octets(),
                )?);
            }
            Ok(())
        })?;
        Ok(())
    }
}
