//! Accept loop and echo handler.
//!
//! The default accept loop is strictly serialized: one connection is handled
//! to completion before the next accept. That is a known scaling limitation
//! kept for compatibility; `concurrent` mode hands each connection to its
//! own thread without changing the wire protocol.

use crate::buffer::LineBuffer;
use std::io::{self, Read, Write};
use std::net::TcpListener;
use std::thread;
use tracing::{debug, error, info};

/// Fixed acknowledgment appended to each echoed line.
const ACK_SUFFIX: &[u8] = b":OK\r\n";

/// Server tunables resolved from configuration.
#[derive(Debug, Clone, Copy)]
pub struct ServerOptions {
    pub buffer_size: usize,
    /// Handle each connection on its own thread instead of serially.
    pub concurrent: bool,
}

/// Accept connections forever.
///
/// Accept interrupted by a signal is retried silently; any other accept
/// failure is reported and retried, so a misbehaving accept does not take
/// the server down.
pub fn accept_loop(listener: TcpListener, opts: ServerOptions) {
    info!("ready for accept");

    let mut next_conn: u64 = 0;
    loop {
        match listener.accept() {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!(error = %e, "accept failed");
                continue;
            }
            Ok((mut stream, peer)) => {
                info!(host = %peer.ip(), port = peer.port(), "accepted connection");

                if opts.concurrent {
                    let conn_id = next_conn;
                    next_conn += 1;
                    let buffer_size = opts.buffer_size;
                    let spawned = thread::Builder::new()
                        .name(format!("conn-{conn_id}"))
                        .spawn(move || {
                            echo_loop(&mut stream, buffer_size);
                            // Dropping the stream closes the connection.
                        });
                    if let Err(e) = spawned {
                        error!(error = %e, "failed to spawn connection thread");
                    }
                } else {
                    // Serialized mode: the next accept waits until this
                    // connection's handler returns.
                    echo_loop(&mut stream, opts.buffer_size);
                    drop(stream);
                }
            }
        }
    }
}

/// Per-connection request/response loop.
///
/// Each receive is treated as one message: the content is truncated at the
/// first CR or LF, the acknowledgment suffix is appended with bounded
/// semantics, and the result is sent back. Lines split across receives are
/// not reassembled, and extra lines in one receive are discarded with the
/// tail — a documented limitation of this design, not a framing layer.
///
/// Exits on peer close (not an error) or after reporting an I/O failure.
pub fn echo_loop<S: Read + Write>(conn: &mut S, buffer_size: usize) {
    let mut buf = LineBuffer::new(buffer_size);

    loop {
        match buf.fill_from(conn) {
            Ok(0) => {
                debug!("peer closed the connection");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                error!(error = %e, "receive failed");
                break;
            }
        }

        buf.truncate_at_line_break();
        info!("[client]{}", buf.display());

        buf.append_bounded(ACK_SUFFIX);
        if let Err(e) = conn.write_all(buf.as_bytes()) {
            error!(error = %e, "send failed");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net;
    use std::net::TcpStream;
    use std::time::Duration;

    fn start_server(concurrent: bool) -> String {
        let resolved = net::resolve(Some("127.0.0.1"), "0").unwrap();
        let listener = net::listen(&resolved).unwrap();
        let port = listener.local_addr().unwrap().port().to_string();
        let opts = ServerOptions {
            buffer_size: 512,
            concurrent,
        };
        thread::spawn(move || accept_loop(listener, opts));
        port
    }

    fn connect_to(port: &str) -> TcpStream {
        let resolved = net::resolve(Some("127.0.0.1"), port).unwrap();
        let stream = net::connect(&resolved).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }

    fn read_reply(stream: &mut TcpStream) -> Vec<u8> {
        let mut reply = [0u8; 512];
        let n = stream.read(&mut reply).unwrap();
        reply[..n].to_vec()
    }

    #[test]
    fn test_echo_appends_ack_to_first_line() {
        let port = start_server(false);
        let mut client = connect_to(&port);

        client.write_all(b"hello\n").unwrap();
        assert_eq!(read_reply(&mut client), b"hello:OK\r\n");

        // Only the first line of a receive is acknowledged.
        client.write_all(b"hello\r\nworld").unwrap();
        assert_eq!(read_reply(&mut client), b"hello:OK\r\n");
    }

    #[test]
    fn test_immediate_close_yields_no_response() {
        let port = start_server(false);
        let client = connect_to(&port);
        drop(client);

        // The server must come back for the next connection.
        let mut second = connect_to(&port);
        second.write_all(b"still here\n").unwrap();
        assert_eq!(read_reply(&mut second), b"still here:OK\r\n");
    }

    #[test]
    fn test_serialized_accept_blocks_second_connection() {
        let port = start_server(false);
        let mut first = connect_to(&port);

        // Make sure the first connection is the one being served.
        first.write_all(b"one\n").unwrap();
        assert_eq!(read_reply(&mut first), b"one:OK\r\n");

        let mut second = connect_to(&port);
        second.write_all(b"two\n").unwrap();
        second
            .set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();

        // The second connection sits in the backlog until the first closes.
        let mut probe = [0u8; 16];
        match second.read(&mut probe) {
            Err(e) => assert!(
                e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut
            ),
            Ok(n) => panic!("unexpected reply of {n} bytes before first connection closed"),
        }

        drop(first);

        second
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        assert_eq!(read_reply(&mut second), b"two:OK\r\n");
    }

    #[test]
    fn test_concurrent_mode_serves_overlapping_connections() {
        let port = start_server(true);
        let mut first = connect_to(&port);
        first.write_all(b"one\n").unwrap();
        assert_eq!(read_reply(&mut first), b"one:OK\r\n");

        // First connection stays open; second is served anyway.
        let mut second = connect_to(&port);
        second.write_all(b"two\n").unwrap();
        assert_eq!(read_reply(&mut second), b"two:OK\r\n");

        first.write_all(b"again\n").unwrap();
        assert_eq!(read_reply(&mut first), b"again:OK\r\n");
    }

    #[test]
    fn test_oversized_message_is_handled_in_bounded_chunks() {
        // A fake stream makes the receive boundaries deterministic.
        struct Fake {
            incoming: std::io::Cursor<Vec<u8>>,
            outgoing: Vec<u8>,
        }
        impl Read for Fake {
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                self.incoming.read(buf)
            }
        }
        impl Write for Fake {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                self.outgoing.extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        // No CR/LF anywhere, longer than one receive buffer: the handler
        // acks each receive-sized chunk as its own message.
        let mut fake = Fake {
            incoming: std::io::Cursor::new(vec![b'x'; 600]),
            outgoing: Vec::new(),
        };
        echo_loop(&mut fake, 512);

        // The first chunk fills the buffer to capacity−1 bytes, leaving no
        // room for the suffix; the remainder gets the full acknowledgment.
        let mut expected = vec![b'x'; 511];
        expected.extend_from_slice(&vec![b'x'; 89]);
        expected.extend_from_slice(b":OK\r\n");
        assert_eq!(fake.outgoing, expected);
    }

    #[test]
    fn test_handler_direct_eof() {
        // Exercise the handler against an in-memory stream: immediate EOF
        // produces no response and no error.
        struct Closed;
        impl Read for Closed {
            fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
                Ok(0)
            }
        }
        impl Write for Closed {
            fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
                panic!("no response expected");
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        echo_loop(&mut Closed, 512);
    }
}
