//! Drives `Connection` by hand over socket pairs, without an event loop.

use etude::http::EMPTY_PAGE;
use etude::syscalls::Epoll;
use etude::{ConnState, Connection, EtudeError, Processed, ServerState, WriteStatus};
use std::fs::{self, Permissions};
use std::io::{ErrorKind, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::IntoRawFd;
use std::os::unix::net::UnixStream;
use std::sync::Arc;

const INDEX: &[u8] = b"hello etude";

struct Fixture {
    _root: tempfile::TempDir,
    state: Arc<ServerState>,
}

fn fixture() -> Fixture {
    let root = tempfile::tempdir().unwrap();
    let p = root.path();
    fs::write(p.join("index.html"), INDEX).unwrap();
    fs::write(p.join("empty.html"), b"").unwrap();
    fs::write(p.join("private.html"), b"keep out").unwrap();
    fs::create_dir(p.join("dir")).unwrap();
    let big: Vec<u8> = (0..1_048_576u32).map(|i| (i % 251) as u8).collect();
    fs::write(p.join("big.bin"), &big).unwrap();
    for name in ["index.html", "empty.html", "big.bin"] {
        fs::set_permissions(p.join(name), Permissions::from_mode(0o644)).unwrap();
    }
    fs::set_permissions(p.join("private.html"), Permissions::from_mode(0o600)).unwrap();

    let state = Arc::new(ServerState::new(Epoll::new().unwrap(), p));
    Fixture { _root: root, state }
}

fn connect(state: &Arc<ServerState>) -> (UnixStream, Connection) {
    let (client, server) = UnixStream::pair().unwrap();
    let conn = Connection::open(server.into_raw_fd(), None, state.clone()).unwrap();
    (client, conn)
}

/// Everything the server side has written so far.
fn drain(client: &mut UnixStream) -> Vec<u8> {
    client.set_nonblocking(true).unwrap();
    let mut out = Vec::new();
    let mut chunk = [0u8; 65536];
    loop {
        match client.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => out.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == ErrorKind::WouldBlock => break,
            Err(e) => panic!("read failed: {e}"),
        }
    }
    out
}

/// One full request/response exchange.
fn exchange(client: &mut UnixStream, conn: &mut Connection, request: &[u8]) -> (WriteStatus, String) {
    client.write_all(request).unwrap();
    conn.read().unwrap();
    assert_eq!(conn.process().unwrap(), Processed::Ready);
    let status = conn.write().unwrap();
    let out = drain(client);
    (status, String::from_utf8(out).unwrap())
}

#[test]
fn test_serves_file_then_closes() {
    let fx = fixture();
    let (mut client, mut conn) = connect(&fx.state);
    assert_eq!(fx.state.live_conns(), 1);

    let (status, out) = exchange(
        &mut client,
        &mut conn,
        b"GET /index.html HTTP/1.1\r\nHost: localhost\r\n\r\n",
    );
    assert_eq!(status, WriteStatus::Close);
    assert_eq!(
        out,
        "HTTP/1.1 200 OK\r\nContent-Length: 11\r\nConnection: close\r\n\r\nhello etude"
    );
    assert!(!conn.has_mapping());

    conn.close(true);
    conn.close(true);
    assert_eq!(fx.state.live_conns(), 0);
    assert_eq!(fx.state.req_count(), 1);
}

#[test]
fn test_keep_alive_resets_for_next_request() {
    let fx = fixture();
    let (mut client, mut conn) = connect(&fx.state);
    let request = b"GET /index.html HTTP/1.1\r\nConnection: keep-alive\r\n\r\n";

    for round in 1..=3 {
        let (status, out) = exchange(&mut client, &mut conn, request);
        assert_eq!(status, WriteStatus::KeepAlive);
        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(out.contains("Connection: keep-alive\r\n"));
        assert!(out.ends_with("hello etude"));
        assert_eq!(conn.conn_state(), ConnState::Reading);
        assert_eq!(conn.requests_served(), round);
        assert_eq!(conn.read_buf().read_idx(), 0);
        assert!(!conn.parser().keep_alive());
    }
}

#[test]
fn test_pipelined_requests_are_answered_in_order() {
    let fx = fixture();
    let (mut client, mut conn) = connect(&fx.state);
    client
        .write_all(
            b"GET /index.html HTTP/1.1\r\nConnection: keep-alive\r\n\r\n\
              GET /missing HTTP/1.1\r\n\r\n",
        )
        .unwrap();

    conn.read().unwrap();
    assert_eq!(conn.process().unwrap(), Processed::Ready);
    assert_eq!(conn.write().unwrap(), WriteStatus::Pipelined);
    assert_eq!(conn.process().unwrap(), Processed::Ready);
    assert_eq!(conn.write().unwrap(), WriteStatus::Close);

    let out = String::from_utf8(drain(&mut client)).unwrap();
    let first = out.find("HTTP/1.1 200 OK").unwrap();
    let second = out.find("HTTP/1.1 404 Not Found").unwrap();
    assert!(first < second);
    assert_eq!(fx.state.req_count(), 2);
}

#[test]
fn test_error_outcomes() {
    let fx = fixture();
    let cases: [(&[u8], &str); 5] = [
        (b"GET /missing HTTP/1.1\r\n\r\n", "HTTP/1.1 404 Not Found\r\n"),
        (b"GET /private.html HTTP/1.1\r\n\r\n", "HTTP/1.1 403 Forbidden\r\n"),
        (b"GET /dir HTTP/1.1\r\n\r\n", "HTTP/1.1 400 Bad Request\r\n"),
        (b"GET /index.html HTTP/1.0\r\n\r\n", "HTTP/1.1 400 Bad Request\r\n"),
        (b"POST /index.html HTTP/1.1\r\n\r\n", "HTTP/1.1 400 Bad Request\r\n"),
    ];
    for (request, head) in cases {
        let (mut client, mut conn) = connect(&fx.state);
        let (status, out) = exchange(&mut client, &mut conn, request);
        assert_eq!(status, WriteStatus::Close);
        assert!(out.starts_with(head), "{out}");
        let (headers, body) = out.split_once("\r\n\r\n").unwrap();
        assert!(headers.contains(&format!("Content-Length: {}\r\n", body.len())));
    }
}

#[test]
fn test_not_found_keeps_connection_alive() {
    let fx = fixture();
    let (mut client, mut conn) = connect(&fx.state);
    let (status, out) = exchange(
        &mut client,
        &mut conn,
        b"GET /nope HTTP/1.1\r\nConnection: keep-alive\r\n\r\n",
    );
    assert_eq!(status, WriteStatus::KeepAlive);
    assert!(out.starts_with("HTTP/1.1 404 Not Found\r\n"));
    assert!(conn.is_open());
}

#[test]
fn test_empty_file_gets_placeholder_page() {
    let fx = fixture();
    let (mut client, mut conn) = connect(&fx.state);
    let (_, out) = exchange(&mut client, &mut conn, b"GET /empty.html HTTP/1.1\r\n\r\n");
    assert_eq!(
        out,
        format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            EMPTY_PAGE.len(),
            EMPTY_PAGE
        )
    );
}

#[test]
fn test_absolute_form_target() {
    let fx = fixture();
    let (mut client, mut conn) = connect(&fx.state);
    let (_, out) = exchange(
        &mut client,
        &mut conn,
        b"GET http://localhost:8080/index.html HTTP/1.1\r\n\r\n",
    );
    assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
}

#[test]
fn test_fragmented_request() {
    let fx = fixture();
    let (mut client, mut conn) = connect(&fx.state);

    client.write_all(b"GET /index.html HT").unwrap();
    conn.read().unwrap();
    assert_eq!(conn.process().unwrap(), Processed::NeedMore);

    client.write_all(b"TP/1.1\r\nHost: a\r").unwrap();
    conn.read().unwrap();
    assert_eq!(conn.process().unwrap(), Processed::NeedMore);

    client.write_all(b"\n\r\n").unwrap();
    conn.read().unwrap();
    assert_eq!(conn.process().unwrap(), Processed::Ready);
    assert_eq!(conn.conn_state(), ConnState::Writing);
    assert_eq!(conn.write().unwrap(), WriteStatus::Close);
    assert!(String::from_utf8(drain(&mut client)).unwrap().ends_with("hello etude"));
}

#[test]
fn test_request_too_large_for_read_buffer() {
    let fx = fixture();
    let (mut client, server) = UnixStream::pair().unwrap();
    let mut conn =
        Connection::with_capacity(server.into_raw_fd(), None, fx.state.clone(), 64, 1024).unwrap();

    let mut request = b"GET /index.html HTTP/1.1\r\nX-Padding: ".to_vec();
    request.extend(std::iter::repeat_n(b'a', 100));
    client.write_all(&request).unwrap();

    conn.read().unwrap();
    assert!(conn.read_buf().is_full());
    assert!(matches!(conn.process(), Err(EtudeError::ReadBufferFull)));
    assert!(!conn.is_open());
    assert_eq!(fx.state.live_conns(), 0);
}

#[test]
fn test_full_buffer_fails_next_read() {
    let fx = fixture();
    let (mut client, server) = UnixStream::pair().unwrap();
    let mut conn =
        Connection::with_capacity(server.into_raw_fd(), None, fx.state.clone(), 16, 1024).unwrap();
    client.write_all(&[b'x'; 32]).unwrap();
    conn.read().unwrap();
    assert!(matches!(conn.read(), Err(EtudeError::ReadBufferFull)));
}

#[test]
fn test_response_too_large_for_write_buffer() {
    let fx = fixture();
    let (mut client, server) = UnixStream::pair().unwrap();
    let mut conn =
        Connection::with_capacity(server.into_raw_fd(), None, fx.state.clone(), 1024, 32).unwrap();
    client.write_all(b"GET /missing HTTP/1.1\r\n\r\n").unwrap();
    conn.read().unwrap();
    assert!(matches!(conn.process(), Err(EtudeError::WriteBufferFull)));
    assert!(!conn.is_open());
}

#[test]
fn test_peer_close_fails_read() {
    let fx = fixture();
    let (client, mut conn) = connect(&fx.state);
    drop(client);
    assert!(matches!(conn.read(), Err(EtudeError::PeerClosed)));
}

#[test]
fn test_large_file_survives_partial_writes() {
    let fx = fixture();
    let (mut client, mut conn) = connect(&fx.state);
    client.write_all(b"GET /big.bin HTTP/1.1\r\n\r\n").unwrap();
    conn.read().unwrap();
    assert_eq!(conn.process().unwrap(), Processed::Ready);
    assert!(conn.has_mapping());
    let total = conn.bytes_to_send();

    let mut received = Vec::new();
    let mut saw_pending = false;
    loop {
        match conn.write().unwrap() {
            WriteStatus::Pending => {
                saw_pending = true;
                received.extend(drain(&mut client));
            }
            WriteStatus::Close => break,
            other => panic!("unexpected {other:?}"),
        }
    }
    received.extend(drain(&mut client));

    assert!(saw_pending);
    assert_eq!(received.len(), total);
    assert_eq!(fx.state.bytes_sent(), total);
    assert!(!conn.has_mapping());

    let split = received.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;
    let head = std::str::from_utf8(&received[..split]).unwrap();
    assert!(head.contains("Content-Length: 1048576\r\n"));
    let expected: Vec<u8> = (0..1_048_576u32).map(|i| (i % 251) as u8).collect();
    assert!(received[split..] == expected[..]);
}

#[test]
fn test_state_is_consistent_after_final_send() {
    let fx = fixture();
    let (mut client, mut conn) = connect(&fx.state);
    let (status, out) = exchange(&mut client, &mut conn, b"GET /index.html HTTP/1.1\r\n\r\n");
    assert_eq!(status, WriteStatus::Close);
    assert!(out.ends_with("hello etude"));

    assert_eq!(conn.bytes_to_send(), 0);
    assert!(format!("{conn:?}").contains("bytes_to_send: 0"));

    // Nothing left to send: a repeated write must not resend or slice past the body.
    assert_eq!(conn.write().unwrap(), WriteStatus::KeepAlive);
    assert!(drain(&mut client).is_empty());
}

#[test]
fn test_write_with_nothing_queued_resets_and_rearms() {
    let fx = fixture();
    let (mut client, mut conn) = connect(&fx.state);
    assert_eq!(conn.bytes_to_send(), 0);

    assert_eq!(conn.write().unwrap(), WriteStatus::KeepAlive);
    assert_eq!(conn.conn_state(), ConnState::Reading);
    assert_eq!(conn.read_buf().read_idx(), 0);
    assert!(conn.is_open());
    assert!(drain(&mut client).is_empty());

    // The connection still serves the next request normally.
    let (status, out) = exchange(&mut client, &mut conn, b"GET /index.html HTTP/1.1\r\n\r\n");
    assert_eq!(status, WriteStatus::Close);
    assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
}

#[test]
fn test_peer_is_recorded() {
    let fx = fixture();
    let (_client, server) = UnixStream::pair().unwrap();
    let peer: std::net::SocketAddr = "192.0.2.7:4000".parse().unwrap();
    let conn = Connection::open(server.into_raw_fd(), Some(peer), fx.state.clone()).unwrap();
    assert_eq!(conn.peer(), Some(peer));
}
