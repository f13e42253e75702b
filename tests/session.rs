use std::time::Duration;

use local_sync::oneshot;
use monoio::{
    io::{stream::Stream, AsyncReadRent, AsyncWriteRentExt},
    net::{TcpListener, TcpStream},
    task::JoinHandle,
};
use monoio_ws::{Acceptor, ServerConfig};

/// Accepts `connections` sockets and echoes every data message back on each
/// resulting session.
fn spawn_echo_server(
    port: u16,
    config: ServerConfig,
    connections: usize,
    tx: oneshot::Sender<()>,
) -> JoinHandle<()> {
    let _ = env_logger::builder().is_test(true).try_init();
    monoio::spawn(async move {
        let listener = TcpListener::bind(("localhost", port))
            .expect("Can't listen, is this port already in use?");
        tx.send(()).unwrap();

        let acceptor = Acceptor::new(config);
        for _ in 0..connections {
            let (stream, _) = listener
                .accept()
                .await
                .expect("Failed to accept connection");
            match acceptor.serve(stream).await {
                Ok((handle, mut messages)) => {
                    monoio::spawn(async move {
                        while let Some(message) = messages.next().await {
                            if message.is_text() || message.is_binary() {
                                if handle.send(message).await.is_err() {
                                    break;
                                }
                            }
                        }
                    });
                }
                Err(_) => continue,
            }
        }
    })
}

async fn connect_client(port: u16) -> TcpStream {
    let mut stream = TcpStream::connect(("localhost", port)).await.unwrap();
    let request = format!(
        "GET / HTTP/1.1\r\n\
         Host: localhost:{port}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Version: 13\r\n\
         Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n"
    );
    let (res, _) = stream.write_all(request.into_bytes()).await;
    res.unwrap();

    let mut response = Vec::new();
    while !response.windows(4).any(|w| w == b"\r\n\r\n") {
        let (res, buf) = stream.read(vec![0u8; 1024]).await;
        let n = res.unwrap();
        assert_ne!(n, 0, "server closed during handshake");
        response.extend_from_slice(&buf[..n]);
    }
    assert!(response.starts_with(b"HTTP/1.1 101"));
    stream
}

const MASK: [u8; 4] = [0x11, 0x22, 0x33, 0x44];

fn masked_frame(first_byte: u8, payload: &[u8]) -> Vec<u8> {
    assert!(payload.len() < 126);
    let mut frame = vec![first_byte, 0x80 | payload.len() as u8];
    frame.extend_from_slice(&MASK);
    frame.extend(payload.iter().enumerate().map(|(i, b)| b ^ MASK[i & 3]));
    frame
}

async fn send(stream: &mut TcpStream, frame: Vec<u8>) {
    let (res, _) = stream.write_all(frame).await;
    res.unwrap();
}

async fn read_bytes(stream: &mut TcpStream, n: usize) -> Vec<u8> {
    let mut data = Vec::with_capacity(n);
    while data.len() < n {
        let (res, buf) = stream.read(vec![0u8; n - data.len()]).await;
        let got = res.unwrap();
        assert_ne!(got, 0, "unexpected EOF");
        data.extend_from_slice(&buf[..got]);
    }
    data
}

/// Reads one short server frame. Server frames are never masked.
async fn read_frame(stream: &mut TcpStream) -> (u8, Vec<u8>) {
    let header = read_bytes(stream, 2).await;
    let len = (header[1] & 0x7f) as usize;
    assert!(len < 126, "test frames stay below the extended-length range");
    let payload = read_bytes(stream, len).await;
    (header[0], payload)
}

async fn expect_eof(stream: &mut TcpStream) {
    let (res, _) = stream.read(vec![0u8; 16]).await;
    assert_eq!(res.unwrap(), 0);
}

#[monoio::test(timer_enabled = true)]
async fn test_echo_and_close_handshake() {
    let (tx, rx) = oneshot::channel();
    let h = spawn_echo_server(3041, ServerConfig::default(), 1, tx);
    rx.await.expect("Failed to wait for server to be ready");

    let mut client = connect_client(3041).await;

    send(&mut client, masked_frame(0x81, b"hello")).await;
    let (first, payload) = read_frame(&mut client).await;
    assert_eq!(first, 0x81);
    assert_eq!(payload, b"hello");

    // Close with code 1000; the server echoes the code back, then closes
    // the TCP connection first.
    send(&mut client, masked_frame(0x88, &[0x03, 0xe8])).await;
    let (first, payload) = read_frame(&mut client).await;
    assert_eq!(first, 0x88);
    assert_eq!(payload, [0x03, 0xe8]);
    expect_eof(&mut client).await;

    h.await;
}

#[monoio::test(timer_enabled = true)]
async fn test_codeless_close_is_answered_with_normal() {
    let (tx, rx) = oneshot::channel();
    let h = spawn_echo_server(3042, ServerConfig::default(), 1, tx);
    rx.await.expect("Failed to wait for server to be ready");

    let mut client = connect_client(3042).await;

    send(&mut client, masked_frame(0x88, &[])).await;
    let (first, payload) = read_frame(&mut client).await;
    assert_eq!(first, 0x88);
    assert_eq!(payload, [0x03, 0xe8]);
    expect_eof(&mut client).await;

    h.await;
}

#[monoio::test(timer_enabled = true)]
async fn test_fragmented_message_is_reassembled() {
    let (tx, rx) = oneshot::channel();
    let h = spawn_echo_server(3043, ServerConfig::default(), 1, tx);
    rx.await.expect("Failed to wait for server to be ready");

    let mut client = connect_client(3043).await;

    send(&mut client, masked_frame(0x01, b"one")).await;
    send(&mut client, masked_frame(0x00, b"two")).await;
    send(&mut client, masked_frame(0x80, b"three")).await;

    let (first, payload) = read_frame(&mut client).await;
    assert_eq!(first, 0x81);
    assert_eq!(payload, b"onetwothree");

    send(&mut client, masked_frame(0x88, &[0x03, 0xe8])).await;
    let _ = read_frame(&mut client).await;
    h.await;
}

#[monoio::test(timer_enabled = true)]
async fn test_ping_is_answered_with_pong() {
    let (tx, rx) = oneshot::channel();
    let h = spawn_echo_server(3044, ServerConfig::default(), 1, tx);
    rx.await.expect("Failed to wait for server to be ready");

    let mut client = connect_client(3044).await;

    send(&mut client, masked_frame(0x89, b"hi")).await;
    let (first, payload) = read_frame(&mut client).await;
    assert_eq!(first, 0x8a);
    assert_eq!(payload, b"hi");

    send(&mut client, masked_frame(0x88, &[0x03, 0xe8])).await;
    let _ = read_frame(&mut client).await;
    h.await;
}

#[monoio::test(timer_enabled = true)]
async fn test_unmasked_frame_closes_with_protocol_error() {
    let (tx, rx) = oneshot::channel();
    let h = spawn_echo_server(3045, ServerConfig::default(), 1, tx);
    rx.await.expect("Failed to wait for server to be ready");

    let mut client = connect_client(3045).await;

    // Text frame without the mask bit.
    send(&mut client, vec![0x81, 0x02, b'h', b'i']).await;
    let (first, payload) = read_frame(&mut client).await;
    assert_eq!(first, 0x88);
    assert_eq!(&payload[..2], [0x03, 0xea]);

    h.await;
}

#[monoio::test(timer_enabled = true)]
async fn test_oversized_payload_closes_with_too_big() {
    let (tx, rx) = oneshot::channel();
    let config = ServerConfig::default().max_payload_size(8);
    let h = spawn_echo_server(3046, config, 1, tx);
    rx.await.expect("Failed to wait for server to be ready");

    let mut client = connect_client(3046).await;

    send(&mut client, masked_frame(0x81, b"way past the limit")).await;
    let (first, payload) = read_frame(&mut client).await;
    assert_eq!(first, 0x88);
    assert_eq!(&payload[..2], [0x03, 0xf1]);

    h.await;
}

#[monoio::test(timer_enabled = true)]
async fn test_invalid_utf8_text_closes_with_invalid_data() {
    let (tx, rx) = oneshot::channel();
    let h = spawn_echo_server(3047, ServerConfig::default(), 1, tx);
    rx.await.expect("Failed to wait for server to be ready");

    let mut client = connect_client(3047).await;

    send(&mut client, masked_frame(0x81, &[0xff, 0xfe, 0xfd])).await;
    let (first, payload) = read_frame(&mut client).await;
    assert_eq!(first, 0x88);
    assert_eq!(&payload[..2], [0x03, 0xef]);

    h.await;
}

#[monoio::test(timer_enabled = true)]
async fn test_idle_session_is_closed() {
    let (tx, rx) = oneshot::channel();
    let config = ServerConfig::default().idle_timeout(Duration::from_millis(50));
    let h = spawn_echo_server(3048, config, 1, tx);
    rx.await.expect("Failed to wait for server to be ready");

    let mut client = connect_client(3048).await;

    // Send nothing; the server must start the close handshake on its own.
    let (first, payload) = read_frame(&mut client).await;
    assert_eq!(first, 0x88);
    assert_eq!(&payload[..2], [0x03, 0xe9]);

    send(&mut client, masked_frame(0x88, &[0x03, 0xe9])).await;
    expect_eof(&mut client).await;

    h.await;
}

#[monoio::test(timer_enabled = true)]
async fn test_sessions_are_isolated() {
    let (tx, rx) = oneshot::channel();
    let h = spawn_echo_server(3049, ServerConfig::default(), 2, tx);
    rx.await.expect("Failed to wait for server to be ready");

    let mut bad = connect_client(3049).await;
    let mut good = connect_client(3049).await;

    // The first client violates the protocol and gets closed.
    send(&mut bad, vec![0x81, 0x02, b'h', b'i']).await;
    let (first, payload) = read_frame(&mut bad).await;
    assert_eq!(first, 0x88);
    assert_eq!(&payload[..2], [0x03, 0xea]);

    // The second session is unaffected.
    send(&mut good, masked_frame(0x81, b"still here")).await;
    let (first, payload) = read_frame(&mut good).await;
    assert_eq!(first, 0x81);
    assert_eq!(payload, b"still here");

    send(&mut good, masked_frame(0x88, &[0x03, 0xe8])).await;
    let _ = read_frame(&mut good).await;
    h.await;
}
