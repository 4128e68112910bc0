//! Accounting flow: Start / Interim-Update / Stop orchestration.
//!
//! Start and Stop block the calling session's context (cooperatively) in a
//! send/wait/failover loop. Interim updates are asynchronous: a periodic
//! per-session timer composes the record, and a response timer drives
//! retransmission with escalating periods while the server stays silent.
//! All of it runs inside the session's execution context, which is what
//! makes the "skip interim while one is outstanding / near teardown"
//! checks atomic with respect to stop and timeout handling.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use nas_reactor::{TimerKind, TimerSink};
use tracing::{debug, warn};

use crate::attribute::{AcctStatusType, Attribute, AttributeType};
use crate::client::RadiusClient;
use crate::error::RadiusError;
use crate::packet::{Code, Packet, PacketError};
use crate::request::Request;
use crate::server::{ServiceKind, StatKind};
use crate::session::{Session, TerminateCause};

/// Counter-refresh cadence when no interim interval is configured.
const STAT_UPDATE_INTERVAL: Duration = Duration::from_secs(10 * 60);

struct InterimSink {
    client: Weak<RadiusClient>,
    session: Weak<Session>,
}

impl TimerSink for InterimSink {
    fn expired(&self) {
        if let (Some(client), Some(session)) = (self.client.upgrade(), self.session.upgrade()) {
            client.interim_update(&session);
        }
    }
}

/// Response timeout for an asynchronous accounting send; drives resends.
struct AcctRetrySink {
    client: Weak<RadiusClient>,
    session: Weak<Session>,
}

impl TimerSink for AcctRetrySink {
    fn expired(&self) {
        if let (Some(client), Some(session)) = (self.client.upgrade(), self.session.upgrade()) {
            client.acct_retry(&session);
        }
    }
}

impl RadiusClient {
    /// Send the accounting Start record, blocking the calling context
    /// until a server acknowledges it. Success arms the interim timer; a
    /// pool-wide failure is returned to the caller, which aborts session
    /// establishment. A pool with no accounting service configured is a
    /// successful no-op.
    ///
    /// Must be called from within the session's execution context.
    pub fn accounting_start(self: &Arc<Self>, session: &Arc<Session>) -> Result<(), RadiusError> {
        if !self.pool.has_service(ServiceKind::Acct) {
            return Ok(());
        }
        {
            let acct = session.acct.lock().unwrap();
            if acct.started || acct.request.is_some() {
                return Ok(());
            }
        }

        let server = self
            .pool
            .select(ServiceKind::Acct, None)
            .ok_or(RadiusError::NoServers)?;
        let request = Arc::new(Request::new(
            Arc::clone(&self.reactor),
            Arc::clone(session.context()),
            ServiceKind::Acct,
            server,
            Code::AccountingRequest,
            self.settings.verbose,
        )?);
        self.fill_acct_attributes(session, &request, AcctStatusType::Start)?;
        session.acct.lock().unwrap().acct_timestamp = Instant::now();
        request.sign()?;

        if let Err(err) = self.acct_exchange(session, &request, StatKind::Acct) {
            warn!(session = session.session_id(), %err, "accounting start failed");
            return Err(err);
        }

        let interval = session
            .interim_interval()
            .or(self.settings.interim_interval);
        let timer = self.reactor.timer(
            session.context(),
            Arc::new(InterimSink {
                client: Arc::downgrade(self),
                session: Arc::downgrade(session),
            }),
        );
        timer.arm(interval.unwrap_or(STAT_UPDATE_INTERVAL), TimerKind::Periodic);

        let mut acct = session.acct.lock().unwrap();
        acct.started = true;
        acct.request = Some(request);
        acct.interim_timer = Some(timer);
        debug!(session = session.session_id(), "accounting started");
        Ok(())
    }

    /// Send the accounting Stop record with the final counters and the
    /// mapped termination cause. Best-effort: if no server responds the
    /// record is dropped. Calling stop twice is a no-op the second time.
    ///
    /// Must be called from within the session's execution context.
    pub fn accounting_stop(self: &Arc<Self>, session: &Arc<Session>, cause: TerminateCause) {
        let request = {
            let mut acct = session.acct.lock().unwrap();
            if let Some(timer) = acct.interim_timer.take() {
                timer.cancel();
            }
            let Some(request) = acct.request.take() else {
                return;
            };
            if acct.stopped_at.is_none() {
                acct.stopped_at = Some(Instant::now());
            }
            acct.acct_timestamp = Instant::now();
            request
        };
        request.cancel_response_timer();
        let _ = request.take_reply();

        request.with_packet(|packet| {
            packet.set_integer(AttributeType::AcctStatusType, AcctStatusType::Stop.as_u32());
            packet.set_integer(AttributeType::AcctTerminateCause, cause.acct_value());
        });
        self.refresh_traffic(session, &request);
        if request.sign().is_err() {
            return;
        }

        match self.acct_exchange(session, &request, StatKind::Acct) {
            Ok(_) => debug!(session = session.session_id(), "accounting stop acknowledged"),
            Err(err) => {
                warn!(session = session.session_id(), %err, "accounting stop dropped")
            }
        }
        // The request is released here: read handler unregistered, socket
        // closed, server client count dropped.
    }

    /// Periodic interim tick. Skips when a request is still outstanding or
    /// when the session is about to hit its absolute timeout; otherwise
    /// refreshes the counters and, if an interval is configured, re-sends
    /// asynchronously.
    fn interim_update(self: &Arc<Self>, session: &Arc<Session>) {
        let request = {
            let acct = session.acct.lock().unwrap();
            match acct.request {
                Some(ref request) => Arc::clone(request),
                None => return,
            }
        };
        if !request.begin_async_op() {
            return;
        }
        self.interim_update_inner(session, &request);
        request.end_async_op();
    }

    fn interim_update_inner(self: &Arc<Self>, session: &Arc<Session>, request: &Request) {
        if request.response_timer_armed() {
            // The previous accounting exchange is still in flight.
            return;
        }
        if let Some(remaining) = session.remaining_lifetime() {
            if remaining < self.settings.interim_safe_margin {
                debug!(
                    session = session.session_id(),
                    "interim update skipped near session timeout"
                );
                return;
            }
        }

        self.refresh_traffic(session, &request);
        if session
            .interim_interval()
            .or(self.settings.interim_interval)
            .is_none()
        {
            return;
        }

        session.acct.lock().unwrap().acct_timestamp = Instant::now();
        request.set_stat(StatKind::Interim);
        request.bump_identifier();
        request.with_packet(|packet| {
            packet.set_integer(
                AttributeType::AcctStatusType,
                AcctStatusType::InterimUpdate.as_u32(),
            );
            if self.settings.acct_delay_time {
                packet.set_integer(AttributeType::AcctDelayTime, 0);
            }
        });
        if request.sign().is_err() {
            return;
        }

        if self.acct_send_async(session, &request) {
            request.arm_response_timer(
                self.settings.timeout,
                Arc::new(AcctRetrySink {
                    client: Arc::downgrade(self),
                    session: Arc::downgrade(session),
                }),
            );
        }
    }

    /// Response timeout for an asynchronous accounting record: account the
    /// loss, escalate the retry period under sustained loss, fail over
    /// past the accounting deadline, and resend.
    fn acct_retry(self: &Arc<Self>, session: &Arc<Session>) {
        let request = {
            let acct = session.acct.lock().unwrap();
            match acct.request {
                Some(ref request) => Arc::clone(request),
                None => return,
            }
        };
        if !request.begin_async_op() {
            return;
        }
        self.acct_retry_inner(session, &request);
        request.end_async_op();
    }

    fn acct_retry_inner(self: &Arc<Self>, session: &Arc<Session>, request: &Request) {
        request.record_lost();

        if self.settings.acct_timeout.is_zero() {
            // No deadline configured: count the timeout against server
            // health and give up on this record.
            request.server().report_timeout(self.settings.max_try);
            request.cancel_response_timer();
            return;
        }

        let outstanding = session.acct.lock().unwrap().acct_timestamp.elapsed();
        if outstanding > self.settings.acct_timeout {
            request.server().mark_failed();
            if request.reassign(&self.pool).is_err() {
                warn!(
                    session = session.session_id(),
                    "no servers available, terminating session"
                );
                session.control().terminate(TerminateCause::NasError);
                request.cancel_response_timer();
                return;
            }
            session.acct.lock().unwrap().acct_timestamp = Instant::now();
        }

        if outstanding > self.settings.acct_timeout / 2 {
            if let Some(period) = request.response_timer_period() {
                request.modify_response_timer(period + Duration::from_secs(1));
            }
        } else if outstanding > self.settings.acct_timeout / 3 {
            let doubled = self.settings.timeout * 2;
            if request.response_timer_period() != Some(doubled) {
                request.modify_response_timer(doubled);
            }
        }

        if self.settings.acct_delay_time {
            request.bump_identifier();
            request.with_packet(|packet| {
                packet.set_integer(AttributeType::AcctDelayTime, outstanding.as_secs() as u32)
            });
            if request.sign().is_err() {
                return;
            }
        }

        self.acct_send_async(session, &request);
    }

    /// The blocking send/wait loop shared by Start and Stop: per server,
    /// up to `max_try` sends with delay-time correction; exhaustion fails
    /// the server and reassigns; running out of servers surfaces
    /// [`RadiusError::NoServers`].
    fn acct_exchange(
        &self,
        session: &Arc<Session>,
        request: &Request,
        stat: StatKind,
    ) -> Result<Packet, RadiusError> {
        request.set_stat(stat);
        loop {
            let admission = match request.admission_enter() {
                Some(admission) => admission,
                None => {
                    // Failed or retiring server; move on before sending.
                    request.reassign(&self.pool)?;
                    request.sign()?;
                    continue;
                }
            };

            let mut reply = None;
            let mut transport: Result<(), RadiusError> = Ok(());
            for attempt in 0..self.settings.max_try {
                if self.settings.acct_delay_time {
                    let delay = session.acct.lock().unwrap().acct_timestamp.elapsed();
                    if attempt > 0 {
                        request.bump_identifier();
                    }
                    request.with_packet(|packet| {
                        packet.set_integer(AttributeType::AcctDelayTime, delay.as_secs() as u32)
                    });
                    request.sign()?;
                }
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
                return Ok(reply);
            }
            request.server().mark_failed();
            request.reassign(&self.pool)?;
            request.sign()?;
        }
    }

    /// Nonblocking accounting send with admission: used by the interim
    /// retry path. Returns false when the record was abandoned (pool
    /// exhausted; the session is terminated when a deadline is enforced).
    fn acct_send_async(&self, session: &Arc<Session>, request: &Request) -> bool {
        loop {
            let admission = match request.admission_enter() {
                Some(admission) => admission,
                None => {
                    match request.reassign(&self.pool) {
                        Ok(()) => {
                            if request.sign().is_err() {
                                return false;
                            }
                            continue;
                        }
                        Err(_) => {
                            if !self.settings.acct_timeout.is_zero() {
                                warn!(
                                    session = session.session_id(),
                                    "no servers available, terminating session"
                                );
                                session.control().terminate(TerminateCause::NasError);
                            }
                            return false;
                        }
                    }
                }
            };
            if let Err(err) = request.send() {
                debug!(session = session.session_id(), %err, "accounting send failed");
            }
            admission.exit();
            return true;
        }
    }

    /// Session identity attributes shared by every accounting record.
    fn fill_acct_attributes(
        &self,
        session: &Arc<Session>,
        request: &Request,
        status: AcctStatusType,
    ) -> Result<(), RadiusError> {
        request.with_packet(|packet| -> Result<(), PacketError> {
            packet.add_attribute(Attribute::string(
                AttributeType::UserName.as_u8(),
                session.username(),
            )?);
            packet.set_integer(AttributeType::AcctStatusType, status.as_u32());
            packet.add_attribute(Attribute::string(
                AttributeType::AcctSessionId.as_u8(),
                session.session_id(),
            )?);
            // Acct-Authentic = RADIUS
            packet.set_integer(AttributeType::AcctAuthentic, 1);
            packet.set_integer(AttributeType::NasPort, session.nas_port());
            if let Some(ref identifier) = self.settings.nas_identifier {
                packet.add_attribute(Attribute::string(
                    AttributeType::NasIdentifier.as_u8(),
                    identifier.clone(),
                )?);
            }
            if let Some(ip) = self.settings.nas_ip_address {
                packet.add_attribute(Attribute::ipv4(
                    AttributeType::NasIpAddress.as_u8(),
                    ip.octets(),
                )?);
            }
            if self.settings.acct_delay_time {
                packet.set_integer(AttributeType::AcctDelayTime, 0);
            }
            Ok(())
        })?;
        Ok(())
    }

    /// Refresh the packet's traffic counters from the link. A failed
    /// counter read still updates Acct-Session-Time.
    fn refresh_traffic(&self, session: &Arc<Session>, request: &Request) {
        match session.traffic_snapshot() {
            Ok(snapshot) => request.with_packet(|packet| {
                packet.set_integer(AttributeType::AcctInputOctets, snapshot.counters.rx_bytes);
                packet.set_integer(AttributeType::AcctOutputOctets, snapshot.counters.tx_bytes);
                packet.set_integer(AttributeType::AcctInputPackets, snapshot.counters.rx_packets);
                packet.set_integer(
                    AttributeType::AcctOutputPackets,
                    snapshot.counters.tx_packets,
                );
                packet.set_integer(AttributeType::AcctInputGigawords, snapshot.input_gigawords);
                packet.set_integer(
                    AttributeType::AcctOutputGigawords,
                    snapshot.output_gigawords,
                );
                packet.set_integer(
                    AttributeType::AcctSessionTime,
                    snapshot.session_time as u32,
                );
            }),
            Err(err) => {
                debug!(session = session.session_id(), %err, "link stats unavailable");
                request.with_packet(|packet| {
                    packet.set_integer(
                        AttributeType::AcctSessionTime,
                        session.session_time() as u32,
                    )
                });
            }
        }
    }
}
