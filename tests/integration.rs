//! End-to-end tests driven over real loopback UDP sockets: a `Listener`
//! under test plays the server, a bare `tokio::net::UdpSocket` plays the
//! remote peer and speaks the wire grammar directly (mirroring the
//! literal C→S / S→C traces in the design notes).

use std::net::SocketAddr;
use std::time::Duration;

use lrcp::message::{parse, Message};
use lrcp::{Config, Listener};
use tokio::net::UdpSocket;
use tokio::time::timeout;

const TOKEN: u32 = 12345;

fn init_tracing() {
    use std::sync::Once;
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

async fn start_listener() -> (Listener, SocketAddr) {
    init_tracing();
    let listener = Listener::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

async fn start_listener_with(config: Config) -> (Listener, SocketAddr) {
    init_tracing();
    let listener = Listener::bind_with_config("127.0.0.1:0".parse().unwrap(), config)
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

async fn peer() -> UdpSocket {
    UdpSocket::bind("127.0.0.1:0").await.unwrap()
}

async fn send(peer: &UdpSocket, server: SocketAddr, msg: Message) {
    peer.send_to(&msg.encode(1000), server).await.unwrap();
}

async fn recv(peer: &UdpSocket) -> Message {
    let mut buf = [0u8; 1500];
    let (len, _) = timeout(Duration::from_secs(2), peer.recv_from(&mut buf))
        .await
        .expect("timed out waiting for a reply")
        .unwrap();
    parse(&buf[..len], 1000).unwrap()
}

#[tokio::test]
async fn scenario_1_handshake_write_close() -> anyhow::Result<()> {
    let (listener, addr) = start_listener().await;
    let client = peer().await;

    send(&client, addr, Message::Connect { token: TOKEN }).await;
    let conn = listener.accept().await?;
    assert_eq!(recv(&client).await, Message::Ack { token: TOKEN, length: 0 });

    send(&client, addr, Message::Data { token: TOKEN, pos: 0, payload: b"hello".to_vec() }).await;
    assert_eq!(recv(&client).await, Message::Ack { token: TOKEN, length: 5 });

    let mut buf = [0u8; 16];
    let n = conn.read(&mut buf).await?;
    assert_eq!(&buf[..n], b"hello");

    send(&client, addr, Message::Close { token: TOKEN }).await;
    assert_eq!(recv(&client).await, Message::Close { token: TOKEN });

    let mut buf = [0u8; 16];
    assert_eq!(conn.read(&mut buf).await?, 0);
    Ok(())
}

#[tokio::test]
async fn scenario_2_out_of_order_data() {
    let (listener, addr) = start_listener().await;
    let client = peer().await;

    send(&client, addr, Message::Connect { token: TOKEN }).await;
    let conn = listener.accept().await.unwrap();
    recv(&client).await;

    send(&client, addr, Message::Data { token: TOKEN, pos: 5, payload: b"world".to_vec() }).await;
    assert_eq!(recv(&client).await, Message::Ack { token: TOKEN, length: 0 });

    send(&client, addr, Message::Data { token: TOKEN, pos: 0, payload: b"hello".to_vec() }).await;
    assert_eq!(recv(&client).await, Message::Ack { token: TOKEN, length: 5 });

    let mut buf = [0u8; 16];
    let n = conn.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"hello");

    send(&client, addr, Message::Data { token: TOKEN, pos: 5, payload: b"world".to_vec() }).await;
    assert_eq!(recv(&client).await, Message::Ack { token: TOKEN, length: 10 });

    let n = conn.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"world");
}

#[tokio::test]
async fn scenario_3_duplicate_data() {
    let (listener, addr) = start_listener().await;
    let client = peer().await;

    send(&client, addr, Message::Connect { token: TOKEN }).await;
    let conn = listener.accept().await.unwrap();
    recv(&client).await;

    send(&client, addr, Message::Data { token: TOKEN, pos: 0, payload: b"hello".to_vec() }).await;
    assert_eq!(recv(&client).await, Message::Ack { token: TOKEN, length: 5 });
    let mut buf = [0u8; 16];
    assert_eq!(conn.read(&mut buf).await.unwrap(), 5);

    send(&client, addr, Message::Data { token: TOKEN, pos: 0, payload: b"hello".to_vec() }).await;
    assert_eq!(recv(&client).await, Message::Ack { token: TOKEN, length: 5 });

    // No second delivery: with no new bytes buffered, a read blocks until
    // the session is torn down rather than returning "hello" again.
    let second_read = timeout(Duration::from_millis(200), conn.read(&mut buf));
    assert!(second_read.await.is_err(), "duplicate Data must not be delivered twice");
}

#[tokio::test]
async fn scenario_4_ack_beyond_sent_aborts_session() {
    let (listener, addr) = start_listener().await;
    let client = peer().await;

    send(&client, addr, Message::Connect { token: TOKEN }).await;
    let conn = listener.accept().await.unwrap();
    recv(&client).await;

    conn.write(b"abc").await.unwrap();
    assert_eq!(
        recv(&client).await,
        Message::Data { token: TOKEN, pos: 0, payload: b"abc".to_vec() }
    );

    send(&client, addr, Message::Ack { token: TOKEN, length: 9 }).await;
    assert_eq!(recv(&client).await, Message::Close { token: TOKEN });

    let mut buf = [0u8; 16];
    assert_eq!(conn.read(&mut buf).await.unwrap(), 0);
    assert!(conn.write(b"more").await.is_err());
}

#[tokio::test]
async fn scenario_5_escape_round_trip_over_the_wire() {
    let (listener, addr) = start_listener().await;
    let client = peer().await;

    send(&client, addr, Message::Connect { token: TOKEN }).await;
    let conn = listener.accept().await.unwrap();
    recv(&client).await;

    conn.write(b"a/b\\c").await.unwrap();
    let data = recv(&client).await;
    assert_eq!(
        data,
        Message::Data { token: TOKEN, pos: 0, payload: b"a/b\\c".to_vec() }
    );

    send(&client, addr, Message::Ack { token: TOKEN, length: 5 }).await;
    // The segment is retired; no further retransmit should arrive.
    let nothing = timeout(Duration::from_millis(200), client.recv_from(&mut [0u8; 64])).await;
    assert!(nothing.is_err(), "segment should have been retired, not retransmitted");
}

#[tokio::test]
async fn scenario_6_retransmission_on_loss() {
    let (listener, addr) = start_listener_with(Config {
        retransmit_interval: Duration::from_millis(100),
        ..Config::default()
    })
    .await;
    let client = peer().await;

    send(&client, addr, Message::Connect { token: TOKEN }).await;
    let conn = listener.accept().await.unwrap();
    recv(&client).await;

    conn.write(b"hi").await.unwrap();
    let first = recv(&client).await;
    assert_eq!(first, Message::Data { token: TOKEN, pos: 0, payload: b"hi".to_vec() });

    // Simulate loss: don't ack. The identical segment should reappear.
    let retransmit = recv(&client).await;
    assert_eq!(retransmit, first);

    send(&client, addr, Message::Ack { token: TOKEN, length: 2 }).await;
    let nothing = timeout(Duration::from_millis(250), client.recv_from(&mut [0u8; 64])).await;
    assert!(nothing.is_err(), "no further retransmit once acknowledged");
}

/// P5: under bounded, eventually-recovering loss, the sender's segments
/// all eventually get acknowledged. Modeled with a peer that drops every
/// other inbound Data before acking.
#[tokio::test]
async fn p5_send_progress_under_bounded_loss() {
    // A small datagram ceiling forces "hello world" to span several
    // segments, so the loss simulation below actually has more than one
    // segment to drop and recover.
    let (listener, addr) = start_listener_with(Config {
        retransmit_interval: Duration::from_millis(50),
        max_datagram_size: 20,
        ..Config::default()
    })
    .await;
    let client = peer().await;

    send(&client, addr, Message::Connect { token: TOKEN }).await;
    let conn = listener.accept().await.unwrap();
    recv(&client).await;

    conn.write(b"hello world").await.unwrap();

    let mut highest_acked = 0u32;
    let mut seen = 0u32;
    while highest_acked < 11 {
        let msg = recv(&client).await;
        if let Message::Data { pos, payload, .. } = msg {
            seen += 1;
            // Drop every other arrival (simulated loss) by simply not
            // acking it; the sender's own retransmit timer will resend.
            if seen % 2 == 0 {
                continue;
            }
            let end = pos + payload.len() as u32;
            if end > highest_acked {
                highest_acked = end;
                send(&client, addr, Message::Ack { token: TOKEN, length: highest_acked }).await;
            }
        }
    }
    assert_eq!(highest_acked, 11);
}
