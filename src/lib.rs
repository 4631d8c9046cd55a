//! LRCP (Line Reversal Control Protocol): a reliable, ordered,
//! bidirectional byte-stream transport carried over unreliable UDP
//! datagrams.
//!
//! # Organization
//!
//! - [`Listener`] binds a UDP socket, demultiplexes inbound datagrams onto
//!   sessions by token, and accepts newly-connected sessions.
//! - [`Connection`] is the byte-stream handle an application reads from and
//!   writes to; each one is backed by a `session`, the state machine that
//!   tracks what's been sent, received, and acknowledged.
//! - [`message`] is the wire codec: parsing datagrams into [`message::Message`]
//!   and encoding them back, including the `/` and `\` escaping rules.
//! - [`Config`] collects the tunables (idle timeout, retransmission
//!   interval, buffer caps) a conforming deployment needs to pick.
//!
//! # Example
//!
//! ```no_run
//! use lrcp::Listener;
//!
//! # async fn run() -> std::io::Result<()> {
//! let listener = Listener::bind("0.0.0.0:7000".parse().unwrap()).await?;
//! loop {
//!     let conn = match listener.accept().await {
//!         Ok(conn) => conn,
//!         Err(_) => break,
//!     };
//!     tokio::spawn(async move {
//!         let mut buf = [0u8; 4096];
//!         while let Ok(n) = conn.read(&mut buf).await {
//!             if n == 0 {
//!                 break;
//!             }
//!             let _ = conn.write(&buf[..n]).await;
//!         }
//!     });
//! }
//! # Ok(())
//! # }
//! ```

mod config;
mod connection;
mod error;
pub mod message;
mod session;
mod listener;
mod shutdown;

pub use config::Config;
pub use connection::Connection;
pub use error::{CloseReason, ConnectionError, DemuxError, ListenerError, ParseError, SessionError};
pub use listener::Listener;
pub use message::{Message, Token};
