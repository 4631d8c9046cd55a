//! Tunable constants governing a [`Listener`](crate::Listener) and the
//! sessions it creates.
//!
//! The distilled LRCP specification leaves several values as implementer's
//! choice (idle timeout, retransmission interval, buffer caps). Rather than
//! scatter them as magic numbers through `session` and `listener`, they are
//! collected here so a conforming deployment can be described by a single
//! value.

use std::time::Duration;

/// The maximum datagram size permitted by the LRCP wire format, in both
/// directions.
pub const MAX_DATAGRAM_SIZE: usize = 1000;

/// The largest value accepted for any numeric wire field (token, pos,
/// length) — fits a signed 32-bit integer per the LRCP grammar.
pub const MAX_NUMERIC_FIELD: u32 = 2_147_483_647;

/// Tunables for a [`Listener`](crate::Listener).
#[derive(Debug, Clone)]
pub struct Config {
    /// Duration of inbound silence after which a session is unilaterally
    /// closed. The canonical LRCP value is 60 seconds; this crate pins that
    /// value rather than the 10-minute value used by the reference
    /// line-reversal program it was distilled from.
    pub idle_timeout: Duration,
    /// How long an unacknowledged segment waits before being retransmitted.
    pub retransmit_interval: Duration,
    /// Maximum size of a datagram this listener will send or accept.
    /// Conforming LRCP peers expect 1000; changing this breaks wire
    /// compatibility and is intended only for testing.
    pub max_datagram_size: usize,
    /// Maximum number of bytes of peer data buffered for the application to
    /// read before the session stops delivering further writes into
    /// `rcv_buffer` (incoming datagrams are still acknowledged up to the
    /// buffered amount; bytes beyond the cap are simply not yet consumed,
    /// so the peer is not acknowledged past what fits).
    pub recv_buffer_cap: usize,
    /// Maximum number of unacknowledged bytes a session will buffer on the
    /// send side before `Connection::write` starts applying backpressure.
    pub send_buffer_cap: usize,
    /// Capacity of the bounded channel between the listener's reader task
    /// and a session's worker task. When full, inbound datagrams for that
    /// session are dropped (and counted) rather than stalling the listener.
    pub session_inbox_capacity: usize,
}

impl Config {
    /// A `Config` with every value at its default.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(60),
            retransmit_interval: Duration::from_secs(3),
            max_datagram_size: MAX_DATAGRAM_SIZE,
            recv_buffer_cap: 1024 * 1024,
            send_buffer_cap: 1024 * 1024,
            session_inbox_capacity: 128,
        }
    }
}
