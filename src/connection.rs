//! The application-facing handle for one session: a reliable,
//! ordered byte stream riding on top of it.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::error::ConnectionError;
use crate::message::Token;
use crate::session::Session;

/// One LRCP session from the application's point of view: an ordered byte
/// stream, independent of how many underlying datagrams carry it.
///
/// Cloning a `Connection` shares the same underlying session; reads and
/// writes from different clones interleave as if issued from the same
/// task, since both ultimately serialize through the session's worker and
/// its lock.
#[derive(Debug, Clone)]
pub struct Connection {
    session: Arc<Session>,
}

impl Connection {
    pub(crate) fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    /// This session's token.
    pub fn token(&self) -> Token {
        self.session.token
    }

    /// The peer address this session is talking to.
    pub fn peer_addr(&self) -> SocketAddr {
        self.session.peer
    }

    /// Datagrams for this session dropped because its inbound queue was
    /// full, exposed for diagnostics; conforming peers never observe this
    /// directly, since a dropped datagram is simply retransmitted.
    pub fn dropped_datagrams(&self) -> u64 {
        self.session.dropped_datagrams()
    }

    /// Reads already-received, in-order bytes into `buf`, waiting for more
    /// if none are currently available. Returns `Ok(0)` once the session is
    /// closed and every received byte has been delivered — the stream's
    /// EOF.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, ConnectionError> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.session.read(buf).await
    }

    /// Queues `bytes` for delivery, applying backpressure once the amount
    /// of data outstanding (written but not yet acknowledged) would exceed
    /// the session's send buffer cap. Returns once the bytes have been
    /// handed to the session, not once they're acknowledged.
    pub async fn write(&self, bytes: &[u8]) -> Result<usize, ConnectionError> {
        if bytes.is_empty() {
            return Ok(0);
        }
        self.session.queue_write(bytes.to_vec()).await?;
        Ok(bytes.len())
    }

    /// Requests that the session close, sending the peer a final `Close`.
    /// Waits until the session has actually transitioned to closed.
    /// Idempotent.
    pub async fn close(&self) -> Result<(), ConnectionError> {
        if self.session.is_closed() {
            return Ok(());
        }
        self.session.request_close();
        self.session.wait_closed().await;
        Ok(())
    }
}
