use thiserror::Error;

use crate::packet::PacketError;

/// Failures surfaced by AAA operations.
///
/// Protocol mismatches (wrong identifier or response code) are never
/// surfaced: they are silently discarded and counted as loss, and the
/// operation either times out or completes with a later, matching reply.
#[derive(Debug, Error)]
pub enum RadiusError {
    /// Local socket or transmit failure; aborts the current request.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Malformed outbound packet (attribute overflow and the like).
    #[error("packet error: {0}")]
    Packet(#[from] PacketError),

    /// No eligible server: the pool is empty, every server is in back-off,
    /// or all candidates have been excluded by failover.
    #[error("no RADIUS servers available")]
    NoServers,
}

impl From<nas_reactor::Error> for RadiusError {
    fn from(err: nas_reactor::Error) -> RadiusError {
        match err {
            nas_reactor::Error::Io(err) => RadiusError::Transport(err),
        }
    }
}
