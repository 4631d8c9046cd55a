//! The bound UDP socket: demultiplexes inbound datagrams onto per-peer
//! sessions and hands newly connected sessions to the application.

use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use crate::config::Config;
use crate::connection::Connection;
use crate::error::{DemuxError, ListenerError};
use crate::message::{self, Message, Token};
use crate::session::Session;
use crate::shutdown::Shutdown;

/// Newly-accepted sessions queued for `Listener::accept`, bounded so a
/// slow-to-accept application applies backpressure to new Connects rather
/// than growing without limit.
const ACCEPT_QUEUE_CAPACITY: usize = 1024;

/// A bound LRCP endpoint. Accepts inbound sessions and demultiplexes
/// datagrams to the session each belongs to by token.
pub struct Listener {
    socket: Arc<UdpSocket>,
    sessions: Arc<DashMap<Token, Arc<Session>>>,
    accept_rx: AsyncMutex<mpsc::Receiver<Connection>>,
    shutdown: Shutdown,
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("local_addr", &self.socket.local_addr())
            .field("session_count", &self.sessions.len())
            .finish_non_exhaustive()
    }
}

impl Listener {
    /// Binds a UDP socket at `addr` and starts serving LRCP sessions.
    pub async fn bind(addr: SocketAddr) -> std::io::Result<Self> {
        Self::bind_with_config(addr, Config::default()).await
    }

    /// As [`Listener::bind`], with non-default tunables.
    pub async fn bind_with_config(addr: SocketAddr, config: Config) -> std::io::Result<Self> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let config = Arc::new(config);
        let sessions: Arc<DashMap<Token, Arc<Session>>> = Arc::new(DashMap::new());
        let shutdown = Shutdown::new();
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_QUEUE_CAPACITY);
        let (remove_tx, remove_rx) = mpsc::unbounded_channel();

        tokio::spawn(reap_closed_sessions(Arc::clone(&sessions), remove_rx));
        tokio::spawn(read_loop(
            Arc::clone(&socket),
            Arc::clone(&sessions),
            Arc::clone(&config),
            shutdown.clone(),
            accept_tx,
            remove_tx,
        ));

        Ok(Self { socket, sessions, accept_rx: AsyncMutex::new(accept_rx), shutdown })
    }

    /// The address this listener is bound to.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Waits for the next inbound session. Resolves to
    /// `Err(ListenerError::Closed)` once the listener is closed and no
    /// further sessions will ever be connected.
    pub async fn accept(&self) -> Result<Connection, ListenerError> {
        let mut rx = self.accept_rx.lock().await;
        rx.recv().await.ok_or(ListenerError::Closed)
    }

    /// Tears down every live session (each sends its peer a final `Close`)
    /// and stops accepting new ones. Idempotent.
    pub fn close(&self) {
        self.shutdown.shut_down();
    }

    /// Number of sessions currently tracked by this listener.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

async fn reap_closed_sessions(
    sessions: Arc<DashMap<Token, Arc<Session>>>,
    mut remove_rx: mpsc::UnboundedReceiver<Token>,
) {
    while let Some(token) = remove_rx.recv().await {
        sessions.remove(&token);
    }
}

#[allow(clippy::too_many_arguments)]
async fn read_loop(
    socket: Arc<UdpSocket>,
    sessions: Arc<DashMap<Token, Arc<Session>>>,
    config: Arc<Config>,
    shutdown: Shutdown,
    accept_tx: mpsc::Sender<Connection>,
    remove_tx: mpsc::UnboundedSender<Token>,
) {
    let mut buf = vec![0u8; config.max_datagram_size];
    loop {
        let (len, from) = tokio::select! {
            biased;
            _ = shutdown.wait_for_shutdown() => break,
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok(pair) => pair,
                    Err(error) => {
                        tracing::debug!(%error, "udp recv error");
                        continue;
                    }
                }
            }
        };

        let msg = match message::parse(&buf[..len], config.max_datagram_size) {
            Ok(msg) => msg,
            Err(error) => {
                tracing::debug!(%error, %from, "dropping unparseable datagram");
                continue;
            }
        };

        dispatch(
            msg,
            from,
            &socket,
            &sessions,
            &config,
            &shutdown,
            &accept_tx,
            &remove_tx,
        )
        .await;
    }
}

#[allow(clippy::too_many_arguments)]
async fn dispatch(
    msg: Message,
    from: SocketAddr,
    socket: &Arc<UdpSocket>,
    sessions: &Arc<DashMap<Token, Arc<Session>>>,
    config: &Arc<Config>,
    shutdown: &Shutdown,
    accept_tx: &mpsc::Sender<Connection>,
    remove_tx: &mpsc::UnboundedSender<Token>,
) {
    let token = msg.token();

    if let Message::Connect { .. } = msg {
        if sessions.get(&token).is_none() {
            // Only construct a session on the table-miss path; the common
            // case (a session already exists, e.g. a duplicate Connect) is
            // handled by the fallthrough dispatch below.
            let session = Session::spawn(
                token,
                from,
                Arc::clone(socket),
                Arc::clone(config),
                shutdown.clone(),
                remove_tx.clone(),
            );
            // Insert before offering it to `accept`, so a retried Connect
            // for this token (e.g. because the application hasn't called
            // `accept` yet) finds the existing session instead of spawning
            // a duplicate worker task.
            sessions.insert(token, Arc::clone(&session));
            if accept_tx.try_send(Connection::new(Arc::clone(&session))).is_err() {
                tracing::debug!(token, "accept queue full, session will idle out unclaimed");
            }
            session.try_dispatch(msg, from);
            return;
        }
    }

    match sessions.get(&token) {
        Some(session) => session.try_dispatch(msg, from),
        None => {
            // Any non-Connect message for a token this listener has never
            // seen (or has already torn down) gets a Close in reply, so a
            // peer retrying against a session we no longer track gives up
            // instead of retransmitting forever.
            let error = DemuxError::UnknownSession(token);
            tracing::debug!(%error, %from, "demux");
            let wire = Message::Close { token }.encode(config.max_datagram_size);
            if let Err(error) = socket.send_to(&wire, from).await {
                tracing::debug!(%error, token, "failed to send close to unknown session");
            }
        }
    }
}
