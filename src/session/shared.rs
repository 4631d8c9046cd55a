//! The mutable state a [`super::Session`] and its [`Connection`](crate::Connection)
//! facade touch under a single lock.

use std::collections::VecDeque;
use tokio_util::time::delay_queue;

use crate::error::CloseReason;

/// An outbound `Data` segment that has been sent but not yet fully
/// acknowledged. `data` is kept **unescaped**; the wire form is rendered
/// fresh at send/retransmit time (see `Session::send_data_segment`) rather
/// than cached twice.
#[derive(Debug)]
pub(super) struct PendingSegment {
    /// Unescaped byte offset of `data[0]` in this session's send stream.
    pub pos: u64,
    pub data: Vec<u8>,
    /// Handle into the session worker's retransmission `DelayQueue`, used to
    /// cancel the timer once this segment is fully acknowledged.
    pub key: delay_queue::Key,
}

impl PendingSegment {
    /// The offset one past the last byte of this segment.
    pub fn end(&self) -> u64 {
        self.pos + self.data.len() as u64
    }
}

/// State shared between the session worker task and every `Connection`
/// handle for this session, guarded by a single `std::sync::Mutex`. No
/// `await` point is ever reached while this lock is held.
#[derive(Debug, Default)]
pub(super) struct SessionShared {
    /// Total contiguous bytes received from the peer and delivered into
    /// `rcv_buffer` so far (I1: monotonic non-decreasing).
    pub rcv_len: u64,
    /// Bytes delivered to the application but not yet consumed by
    /// `Connection::read`.
    pub rcv_buffer: VecDeque<u8>,
    /// Total bytes the application has handed to `Connection::write` so far
    /// (the offset one past the last byte ever written).
    pub snd_len: u64,
    /// Highest byte offset acknowledged by the peer (I2: `snd_acked <=
    /// snd_len`).
    pub snd_acked: u64,
    /// Unacknowledged outbound segments, ordered by ascending `pos`.
    pub pending: VecDeque<PendingSegment>,
    pub closed: bool,
    pub close_reason: Option<CloseReason>,
}

impl SessionShared {
    /// Bytes written but not yet acknowledged — what write-side
    /// backpressure is measured against.
    pub fn outstanding(&self) -> u64 {
        self.snd_len - self.snd_acked
    }
}

/// A request from a [`Connection`](crate::Connection) handle to the session
/// worker task, which alone is allowed to mutate the retransmission timer
/// queue.
#[derive(Debug)]
pub(super) enum Command {
    /// Segment and send `data`, whose first byte is at absolute offset
    /// `pos` in the send stream (already reserved under the shared lock by
    /// the caller).
    Write { pos: u64, data: Vec<u8> },
    /// The application called `Connection::close`.
    Close,
}
