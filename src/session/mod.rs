//! A single LRCP session: the state machine in [`shared`] plus the worker
//! task that owns its retransmission timers and drives it forward.
//!
//! Every mutation of [`SessionShared`] happens either directly under its
//! lock (for bookkeeping that needs no timer access: buffering received
//! bytes, reserving a send offset) or inside [`Session::run`], the single
//! task allowed to touch the [`DelayQueue`] of pending retransmissions.
//! `Connection` handles and the `Listener`'s reader task never see the
//! queue; they talk to the worker through `inbox` (inbound datagrams) and
//! `cmd` (outbound writes and close requests).

mod shared;

use std::future::poll_fn;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Notify};
use tokio_util::time::DelayQueue;

use crate::config::Config;
use crate::error::{CloseReason, SessionError};
use crate::message::{self, Message, Token};
use crate::shutdown::Shutdown;

use shared::{Command, PendingSegment, SessionShared};

/// A live LRCP session: the peer-facing half of a `Connection`.
///
/// Cheaply cloned via `Arc`; the `Listener`'s session table and every
/// `Connection` facade for this session share one instance.
pub struct Session {
    pub(crate) token: Token,
    pub(crate) peer: SocketAddr,
    socket: Arc<UdpSocket>,
    config: Arc<Config>,
    shared: Mutex<SessionShared>,
    pub(crate) notify_read: Notify,
    notify_write: Notify,
    inbox_tx: mpsc::Sender<(Message, SocketAddr)>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    /// Datagrams refused because the session's bounded inbox was full,
    /// exposed without locking `shared` since `Listener::try_dispatch`
    /// increments it from the reader task, off the worker's own lock.
    inbox_drops: AtomicU64,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("token", &self.token)
            .field("peer", &self.peer)
            .field("dropped_datagrams", &self.inbox_drops.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Spawns the worker task for a brand-new session and returns the
    /// shared handle. `remove_tx` is signalled with `token` once the
    /// worker exits, so the listener can drop its table entry.
    pub(crate) fn spawn(
        token: Token,
        peer: SocketAddr,
        socket: Arc<UdpSocket>,
        config: Arc<Config>,
        shutdown: Shutdown,
        remove_tx: mpsc::UnboundedSender<Token>,
    ) -> Arc<Session> {
        let (inbox_tx, inbox_rx) = mpsc::channel(config.session_inbox_capacity);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let session = Arc::new(Session {
            token,
            peer,
            socket,
            config,
            shared: Mutex::new(SessionShared::default()),
            notify_read: Notify::new(),
            notify_write: Notify::new(),
            inbox_tx,
            cmd_tx,
            inbox_drops: AtomicU64::new(0),
        });
        tokio::spawn(Arc::clone(&session).run(inbox_rx, cmd_rx, shutdown, remove_tx));
        session
    }

    /// Hands an inbound datagram already addressed to this session's token
    /// to the worker task. Drops it (and counts the drop) if the source
    /// address doesn't match the recorded peer, or if the inbox is full.
    pub(crate) fn try_dispatch(&self, msg: Message, from: SocketAddr) {
        if from != self.peer {
            tracing::debug!(token = self.token, %from, peer = %self.peer, "dropping datagram from unexpected source");
            return;
        }
        if self.inbox_tx.try_send((msg, from)).is_err() {
            self.inbox_drops.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(token = self.token, "session inbox full, dropping datagram");
        }
    }

    pub(crate) fn dropped_datagrams(&self) -> u64 {
        self.inbox_drops.load(Ordering::Relaxed)
    }

    /// Reserves a send-stream offset for `data` and hands it to the worker,
    /// blocking until the unacknowledged total fits under `send_buffer_cap`.
    ///
    /// Reservation and handoff happen under the same lock acquisition, so
    /// concurrent writers on cloned `Connection`s can never reserve offsets
    /// in one order but enqueue their `Command::Write`s to the worker in
    /// another — `handle_ack` relies on `pending` staying sorted by `pos`.
    pub(crate) async fn queue_write(
        self: &Arc<Self>,
        data: Vec<u8>,
    ) -> Result<(), crate::error::ConnectionError> {
        let len = data.len() as u64;
        loop {
            let notified = self.notify_write.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut s = self.shared.lock().unwrap();
                if s.closed {
                    return Err(crate::error::ConnectionError::Closed);
                }
                // Every byte offset this session will ever use as a wire
                // `pos` must fit in the grammar's signed-32-bit field, so
                // the stream as a whole is capped at MAX_NUMERIC_FIELD + 1
                // bytes (offsets 0..=MAX_NUMERIC_FIELD).
                if s.snd_len + len > crate::config::MAX_NUMERIC_FIELD as u64 + 1 {
                    return Err(crate::error::ConnectionError::StreamOverflow);
                }
                if s.outstanding() + len <= self.config.send_buffer_cap as u64 {
                    let pos = s.snd_len;
                    s.snd_len += len;
                    let _ = self.cmd_tx.send(Command::Write { pos, data });
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    pub(crate) fn request_close(&self) {
        let _ = self.cmd_tx.send(Command::Close);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.shared.lock().unwrap().closed
    }

    /// Waits until the session has transitioned to closed, without
    /// touching `rcv_buffer`.
    pub(crate) async fn wait_closed(&self) {
        loop {
            let notified = self.notify_read.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.shared.lock().unwrap().closed {
                return;
            }
            notified.await;
        }
    }

    /// Drains up to `buf.len()` bytes already delivered to the application,
    /// or `Ok(0)` once the session is closed and nothing remains buffered.
    pub(crate) async fn read(self: &Arc<Self>, buf: &mut [u8]) -> Result<usize, crate::error::ConnectionError> {
        loop {
            let notified = self.notify_read.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut s = self.shared.lock().unwrap();
                if !s.rcv_buffer.is_empty() {
                    let n = buf.len().min(s.rcv_buffer.len());
                    for slot in buf.iter_mut().take(n) {
                        *slot = s.rcv_buffer.pop_front().unwrap();
                    }
                    return Ok(n);
                }
                if s.closed {
                    return Ok(0);
                }
            }
            notified.await;
        }
    }

    async fn send(&self, msg: Message) {
        let wire = msg.encode(self.config.max_datagram_size);
        if let Err(error) = self.socket.send_to(&wire, self.peer).await {
            tracing::debug!(token = self.token, %error, "failed to send datagram");
        }
    }

    async fn send_data_segment(&self, pos: u64, data: &[u8]) {
        self.send(Message::Data {
            token: self.token,
            pos: pos as u32,
            payload: data.to_vec(),
        })
        .await;
    }

    /// The worker task body: the only place this session's retransmission
    /// timers are read or written.
    async fn run(
        self: Arc<Self>,
        mut inbox: mpsc::Receiver<(Message, SocketAddr)>,
        mut cmd: mpsc::UnboundedReceiver<Command>,
        shutdown: Shutdown,
        remove_tx: mpsc::UnboundedSender<Token>,
    ) {
        let mut retransmissions: DelayQueue<u64> = DelayQueue::new();
        let idle_sleep = tokio::time::sleep(self.config.idle_timeout);
        tokio::pin!(idle_sleep);
        let mut cmd_closed = false;

        loop {
            tokio::select! {
                biased;

                _ = shutdown.wait_for_shutdown() => {
                    self.do_close(CloseReason::ListenerShutdown, &mut retransmissions).await;
                    break;
                }

                () = &mut idle_sleep => {
                    self.do_close(CloseReason::IdleTimeout, &mut retransmissions).await;
                    break;
                }

                maybe = inbox.recv() => {
                    match maybe {
                        Some((msg, _from)) => {
                            idle_sleep.as_mut().reset(tokio::time::Instant::now() + self.config.idle_timeout);
                            if self.handle_inbound(msg, &mut retransmissions).await {
                                break;
                            }
                        }
                        None => break,
                    }
                }

                maybe = cmd.recv(), if !cmd_closed => {
                    match maybe {
                        Some(Command::Write { pos, data }) => {
                            self.segment_and_send(pos, data, &mut retransmissions).await;
                        }
                        Some(Command::Close) => {
                            self.do_close(CloseReason::LocalClose, &mut retransmissions).await;
                            break;
                        }
                        None => cmd_closed = true,
                    }
                }

                expired = next_expired(&mut retransmissions) => {
                    if let Some(pos) = expired {
                        self.retransmit(pos, &mut retransmissions).await;
                    }
                }
            }
        }

        let _ = remove_tx.send(self.token);
    }

    async fn handle_inbound(&self, msg: Message, retransmissions: &mut DelayQueue<u64>) -> bool {
        match msg {
            Message::Connect { .. } => {
                // Idempotent: re-acknowledge whatever has been received so
                // far, whether or not this is the first Connect seen.
                let rcv_len = self.shared.lock().unwrap().rcv_len;
                self.send(Message::Ack { token: self.token, length: rcv_len as u32 }).await;
                false
            }
            Message::Data { pos, payload, .. } => {
                self.handle_data(pos as u64, payload).await;
                false
            }
            Message::Ack { length, .. } => self.handle_ack(length as u64, retransmissions).await,
            Message::Close { .. } => {
                self.do_close(CloseReason::PeerClose, retransmissions).await;
                true
            }
        }
    }

    async fn handle_data(&self, pos: u64, payload: Vec<u8>) {
        let mut delivered = false;
        let ack_len = {
            let mut s = self.shared.lock().unwrap();
            if !s.closed {
                let end = pos + payload.len() as u64;
                if pos <= s.rcv_len && end > s.rcv_len {
                    let skip = (s.rcv_len - pos) as usize;
                    let suffix = &payload[skip..];
                    let fits_buffer = s.rcv_buffer.len() + suffix.len() <= self.config.recv_buffer_cap;
                    // The Ack we're about to send carries rcv_len in the
                    // same signed-32-bit wire field Data's pos uses, so the
                    // stream can't advance past that ceiling either, same as
                    // the send side's StreamOverflow check.
                    let fits_wire_field =
                        s.rcv_len + suffix.len() as u64 <= crate::config::MAX_NUMERIC_FIELD as u64 + 1;
                    if fits_buffer && fits_wire_field {
                        s.rcv_buffer.extend(suffix.iter().copied());
                        s.rcv_len += suffix.len() as u64;
                        delivered = true;
                    }
                    // Else: accepting would exceed the buffer cap or the
                    // wire field's range. Don't advance rcv_len, so the
                    // unconsumed suffix is re-offered (and re-acknowledged
                    // as missing) the next time this segment or its
                    // successor is retransmitted.
                }
                // pos > rcv_len: gap, drop. end <= rcv_len: pure duplicate,
                // drop. Either way rcv_len is unchanged and the Ack below
                // tells the peer exactly what's missing.
            }
            s.rcv_len
        };
        self.send(Message::Ack { token: self.token, length: ack_len as u32 }).await;
        if delivered {
            self.notify_read.notify_waiters();
        }
    }

    async fn handle_ack(&self, length: u64, retransmissions: &mut DelayQueue<u64>) -> bool {
        enum Action {
            None,
            Violation,
            Retransmit(Vec<(u64, Vec<u8>)>),
        }

        let action = {
            let mut s = self.shared.lock().unwrap();
            if s.closed {
                return false;
            }
            if length > s.snd_len {
                Action::Violation
            } else if length <= s.snd_acked {
                let segs = s
                    .pending
                    .iter()
                    .filter(|seg| seg.pos >= length)
                    .map(|seg| (seg.pos, seg.data.clone()))
                    .collect();
                Action::Retransmit(segs)
            } else {
                s.snd_acked = length;
                while let Some(front) = s.pending.front() {
                    if front.end() <= s.snd_acked {
                        let seg = s.pending.pop_front().unwrap();
                        retransmissions.try_remove(&seg.key);
                    } else {
                        break;
                    }
                }
                Action::None
            }
        };

        match action {
            Action::Violation => {
                self.do_close(CloseReason::PeerViolation, retransmissions).await;
                true
            }
            Action::Retransmit(segs) => {
                for (pos, data) in segs {
                    self.send_data_segment(pos, &data).await;
                }
                false
            }
            Action::None => {
                self.notify_write.notify_waiters();
                false
            }
        }
    }

    /// Splits freshly written bytes into segments no larger than the wire
    /// limit once escaped, sends each immediately, and arms its
    /// retransmission timer.
    async fn segment_and_send(&self, start: u64, bytes: Vec<u8>, retransmissions: &mut DelayQueue<u64>) {
        let mut offset = 0usize;
        while offset < bytes.len() {
            let pos = start + offset as u64;
            let overhead = message::framing_overhead(self.token, pos as u32);
            let budget = self.config.max_datagram_size.saturating_sub(overhead);
            let chunk_len = fit_chunk(&bytes[offset..], budget);
            let chunk = bytes[offset..offset + chunk_len].to_vec();

            let key = retransmissions.insert(pos, self.config.retransmit_interval);
            {
                let mut s = self.shared.lock().unwrap();
                s.pending.push_back(PendingSegment { pos, data: chunk.clone(), key });
            }
            self.send_data_segment(pos, &chunk).await;
            offset += chunk_len;
        }
    }

    async fn retransmit(&self, pos: u64, retransmissions: &mut DelayQueue<u64>) {
        let data = {
            let s = self.shared.lock().unwrap();
            s.pending.iter().find(|seg| seg.pos == pos).map(|seg| seg.data.clone())
        };
        let Some(data) = data else {
            // Already acknowledged and retired between the timer firing
            // and this task getting scheduled; nothing to resend.
            return;
        };
        self.send_data_segment(pos, &data).await;
        let mut s = self.shared.lock().unwrap();
        if let Some(seg) = s.pending.iter_mut().find(|seg| seg.pos == pos) {
            seg.key = retransmissions.insert(pos, self.config.retransmit_interval);
        }
    }

    async fn do_close(&self, reason: CloseReason, retransmissions: &mut DelayQueue<u64>) {
        {
            let mut s = self.shared.lock().unwrap();
            if s.closed {
                return;
            }
            s.closed = true;
            s.close_reason = Some(reason);
            for seg in s.pending.drain(..) {
                retransmissions.try_remove(&seg.key);
            }
        }
        if let Some(error) = session_error(reason) {
            tracing::debug!(token = self.token, %error, "session closing");
        } else {
            tracing::debug!(token = self.token, %reason, "session closing");
        }
        self.send(Message::Close { token: self.token }).await;
        self.notify_read.notify_waiters();
        self.notify_write.notify_waiters();
    }
}

/// The [`SessionError`] a given [`CloseReason`] represents, if any — the
/// remaining reasons (`LocalClose`, `PeerClose`, `ListenerShutdown`) are
/// ordinary lifecycle transitions, not errors.
fn session_error(reason: CloseReason) -> Option<SessionError> {
    match reason {
        CloseReason::PeerViolation => Some(SessionError::PeerViolation),
        CloseReason::IdleTimeout => Some(SessionError::IdleTimeout),
        CloseReason::LocalClose | CloseReason::PeerClose | CloseReason::ListenerShutdown => None,
    }
}

/// Picks the longest prefix of `data` whose escaped form fits in `budget`
/// bytes. Operates on unescaped bytes, so there is no risk of splitting an
/// escape pair — each chosen chunk is escaped independently once the split
/// point is chosen. Always returns at least 1 while `data` is non-empty, to
/// guarantee forward progress even under a pathologically small budget.
fn fit_chunk(data: &[u8], budget: usize) -> usize {
    let mut used = 0usize;
    let mut n = 0usize;
    for &b in data {
        let cost = if b == b'/' || b == b'\\' { 2 } else { 1 };
        if n > 0 && used + cost > budget {
            break;
        }
        used += cost;
        n += 1;
    }
    n
}

/// Awaits the next expired retransmission, or never resolves while the
/// queue is empty (so the `select!` branch polling it doesn't busy-loop).
async fn next_expired(queue: &mut DelayQueue<u64>) -> Option<u64> {
    if queue.is_empty() {
        std::future::pending::<()>().await;
        unreachable!()
    }
    match poll_fn(|cx| queue.poll_expired(cx)).await {
        Some(Ok(expired)) => Some(expired.into_inner()),
        Some(Err(error)) => {
            tracing::debug!(%error, "retransmission timer error");
            None
        }
        None => None,
    }
}

// `Session`'s fields are private and its worker task is a real `tokio`
// task, so these are written as ordinary `#[tokio::test]`s against a
// loopback socket pair rather than as a top-level `tests/session.rs` —
// an external test binary only sees the public `Listener`/`Connection`
// surface and couldn't reach `Session` at all. Each test plays the role
// of the remote peer directly with a second loopback socket, bypassing
// `Listener`'s demux entirely.
#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use std::time::Duration;

    async fn spawn_test_session() -> (Arc<Session>, UdpSocket, mpsc::UnboundedReceiver<Token>) {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let peer_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer_socket.local_addr().unwrap();
        let config = Arc::new(Config::default());
        let shutdown = Shutdown::new();
        let (remove_tx, remove_rx) = mpsc::unbounded_channel();
        let session = Session::spawn(42, peer_addr, socket, config, shutdown, remove_tx);
        (session, peer_socket, remove_rx)
    }

    async fn send(peer: &UdpSocket, session: &Session, msg: Message) {
        let wire = msg.encode(1000);
        peer.send_to(&wire, session.socket.local_addr().unwrap()).await.unwrap();
    }

    async fn recv(peer: &UdpSocket) -> Message {
        let mut buf = [0u8; 1500];
        let (len, _) = tokio::time::timeout(Duration::from_secs(1), peer.recv_from(&mut buf))
            .await
            .expect("timed out waiting for a reply")
            .unwrap();
        message::parse(&buf[..len], 1000).unwrap()
    }

    // P1 + P8: rcv_len never decreases, and a re-Connect doesn't reset it.
    #[tokio::test]
    async fn rcv_len_is_monotonic_and_connect_is_idempotent() {
        let (session, peer, _remove_rx) = spawn_test_session().await;

        send(&peer, &session, Message::Connect { token: 42 }).await;
        assert_eq!(recv(&peer).await, Message::Ack { token: 42, length: 0 });

        // Gap: pos 5 arrives before pos 0. Dropped, rcv_len stays put.
        send(&peer, &session, Message::Data { token: 42, pos: 5, payload: b"world".to_vec() }).await;
        assert_eq!(recv(&peer).await, Message::Ack { token: 42, length: 0 });

        send(&peer, &session, Message::Data { token: 42, pos: 0, payload: b"hello".to_vec() }).await;
        assert_eq!(recv(&peer).await, Message::Ack { token: 42, length: 5 });
        assert_eq!(session.shared.lock().unwrap().rcv_len, 5);

        // A second Connect re-acknowledges the current rcv_len rather than
        // resetting the session back to 0.
        send(&peer, &session, Message::Connect { token: 42 }).await;
        assert_eq!(recv(&peer).await, Message::Ack { token: 42, length: 5 });
        assert_eq!(session.shared.lock().unwrap().rcv_len, 5);
    }

    // P2: bytes delivered to the application are exactly the contiguous
    // prefix, in order, regardless of how many Data messages carried them.
    #[tokio::test]
    async fn delivers_contiguous_prefix_in_order() {
        let (session, peer, _remove_rx) = spawn_test_session().await;
        let conn = Connection::new(Arc::clone(&session));

        send(&peer, &session, Message::Data { token: 42, pos: 0, payload: b"hel".to_vec() }).await;
        recv(&peer).await;
        send(&peer, &session, Message::Data { token: 42, pos: 3, payload: b"lo".to_vec() }).await;
        recv(&peer).await;

        let mut buf = [0u8; 16];
        let n = conn.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    // P3: a duplicate (or overlapping) Data message is acknowledged but
    // never delivered twice.
    #[tokio::test]
    async fn duplicate_data_is_not_delivered_twice() {
        let (session, peer, _remove_rx) = spawn_test_session().await;
        let conn = Connection::new(Arc::clone(&session));

        send(&peer, &session, Message::Data { token: 42, pos: 0, payload: b"hello".to_vec() }).await;
        assert_eq!(recv(&peer).await, Message::Ack { token: 42, length: 5 });

        // Exact duplicate.
        send(&peer, &session, Message::Data { token: 42, pos: 0, payload: b"hello".to_vec() }).await;
        assert_eq!(recv(&peer).await, Message::Ack { token: 42, length: 5 });

        // Overlapping: starts before rcv_len, ends at it.
        send(&peer, &session, Message::Data { token: 42, pos: 2, payload: b"llo".to_vec() }).await;
        assert_eq!(recv(&peer).await, Message::Ack { token: 42, length: 5 });

        let mut buf = [0u8; 16];
        let n = conn.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(session.shared.lock().unwrap().rcv_buffer.len(), 0);
    }

    // P4: an Ack claiming bytes that were never sent is treated as a
    // protocol violation and terminates the session.
    #[tokio::test]
    async fn ack_beyond_sent_length_closes_the_session() {
        let (session, peer, _remove_rx) = spawn_test_session().await;
        let conn = Connection::new(Arc::clone(&session));

        conn.write(b"hi").await.unwrap();
        let data = recv(&peer).await;
        assert_eq!(data, Message::Data { token: 42, pos: 0, payload: b"hi".to_vec() });

        send(&peer, &session, Message::Ack { token: 42, length: 100 }).await;
        assert_eq!(recv(&peer).await, Message::Close { token: 42 });

        let mut buf = [0u8; 16];
        assert_eq!(conn.read(&mut buf).await.unwrap(), 0);
        assert!(matches!(
            conn.write(b"more").await,
            Err(crate::error::ConnectionError::Closed)
        ));
    }

    // A write that would push a future segment's wire `pos` field past what
    // fits in a signed 32-bit integer is rejected rather than silently
    // wrapping.
    #[tokio::test]
    async fn write_rejected_once_stream_offset_would_overflow_the_wire_field() {
        let (session, _peer, _remove_rx) = spawn_test_session().await;
        session.shared.lock().unwrap().snd_len = crate::config::MAX_NUMERIC_FIELD as u64;

        assert!(matches!(
            session.queue_write(vec![0u8; 2]).await,
            Err(crate::error::ConnectionError::StreamOverflow)
        ));
        // Exactly at the ceiling still fits (offset MAX_NUMERIC_FIELD itself
        // is a valid pos).
        assert!(session.queue_write(vec![0u8; 1]).await.is_ok());
    }

    // Mirrors the send-side overflow check: inbound data that would push
    // rcv_len past what the Ack's length field can carry is left
    // unacknowledged rather than silently wrapped.
    #[tokio::test]
    async fn data_beyond_wire_field_ceiling_is_not_acknowledged() {
        let (session, peer, _remove_rx) = spawn_test_session().await;
        session.shared.lock().unwrap().rcv_len = crate::config::MAX_NUMERIC_FIELD as u64;

        send(&peer, &session, Message::Data { token: 42, pos: crate::config::MAX_NUMERIC_FIELD, payload: b"ab".to_vec() }).await;
        // Accepting either byte would put rcv_len past MAX_NUMERIC_FIELD, so
        // the whole segment is left unacknowledged rather than partially
        // applied.
        assert_eq!(
            recv(&peer).await,
            Message::Ack { token: 42, length: crate::config::MAX_NUMERIC_FIELD }
        );
        assert_eq!(session.shared.lock().unwrap().rcv_len, crate::config::MAX_NUMERIC_FIELD as u64);
    }
}
