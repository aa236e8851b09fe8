//! Client I/O loop.
//!
//! Multiplexes the connected socket and standard input with a bounded
//! `poll(2)` wait, so the loop stays responsive instead of blocking
//! indefinitely on either source. Socket readability prints received bytes
//! verbatim to stdout; input readability forwards the bytes read to the
//! socket. Diagnostics go to the tracing stream, never to stdout.

use crate::buffer::LineBuffer;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::unix::io::{AsRawFd, RawFd};
use tracing::{debug, error, info};

/// Bounded wait interval. A timeout performs no action; it only keeps the
/// loop re-checking both sources.
const POLL_TIMEOUT_MS: i32 = 1000;

/// Which sources a wait reported as readable.
#[derive(Debug, Clone, Copy)]
struct Readiness {
    socket: bool,
    input: bool,
}

/// Wait up to `timeout_ms` for readability on the socket or input
/// descriptor. Returns `None` on timeout.
fn wait_readable(socket: RawFd, input: RawFd, timeout_ms: i32) -> io::Result<Option<Readiness>> {
    let mut fds = [
        libc::pollfd {
            fd: socket,
            events: libc::POLLIN,
            revents: 0,
        },
        libc::pollfd {
            fd: input,
            events: libc::POLLIN,
            revents: 0,
        },
    ];

    let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    if rc == 0 {
        return Ok(None);
    }

    // HUP/ERR surface as readability so the subsequent read reports the
    // EOF or error itself.
    let readable = libc::POLLIN | libc::POLLHUP | libc::POLLERR;
    Ok(Some(Readiness {
        socket: fds[0].revents & readable != 0,
        input: fds[1].revents & readable != 0,
    }))
}

/// Unbuffered reader over a raw descriptor.
///
/// Standard input must be read straight from the descriptor: bytes parked in
/// a userspace buffer (`StdinLock`) would never show up as readable to
/// `poll`, and the loop would stall on them.
struct FdReader(RawFd);

impl AsRawFd for FdReader {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

impl Read for FdReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe { libc::read(self.0, buf.as_mut_ptr().cast(), buf.len()) };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }
}

/// Run the client loop over an established connection, wiring the process's
/// standard input and output. The caller closes the connection by dropping
/// the stream after this returns.
pub fn run(stream: TcpStream, buffer_size: usize) -> io::Result<()> {
    let mut input = FdReader(io::stdin().as_raw_fd());
    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut conn = stream;
    send_recv_loop(&mut conn, &mut input, &mut out, buffer_size)
}

/// The multiplexed send/receive loop.
///
/// Terminates on peer close, input end-of-file, or an I/O failure on either
/// source. Wait errors (including interruption by a signal) are reported and
/// retried; they never end the loop.
fn send_recv_loop<C, I, W>(
    conn: &mut C,
    input: &mut I,
    out: &mut W,
    buffer_size: usize,
) -> io::Result<()>
where
    C: Read + Write + AsRawFd,
    I: Read + AsRawFd,
    W: Write,
{
    let mut buf = LineBuffer::new(buffer_size);
    let socket_fd = conn.as_raw_fd();
    let input_fd = input.as_raw_fd();

    loop {
        let ready = match wait_readable(socket_fd, input_fd, POLL_TIMEOUT_MS) {
            Ok(Some(ready)) => ready,
            Ok(None) => continue,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                debug!("wait interrupted, retrying");
                continue;
            }
            Err(e) => {
                error!(error = %e, "wait failed");
                continue;
            }
        };

        if ready.socket {
            match buf.fill_from(conn) {
                Ok(0) => {
                    info!("server closed the connection");
                    break;
                }
                Ok(_) => {
                    out.write_all(buf.as_bytes())?;
                    out.flush()?;
                }
                Err(e) => {
                    error!(error = %e, "receive failed");
                    break;
                }
            }
        }

        if ready.input {
            match buf.fill_from(input) {
                Ok(0) => {
                    debug!("end of input");
                    break;
                }
                Ok(_) => {
                    // Forward the bytes exactly as read, trailing newline
                    // included when present.
                    if let Err(e) = conn.write_all(buf.as_bytes()) {
                        error!(error = %e, "send failed");
                        break;
                    }
                }
                Err(e) => {
                    error!(error = %e, "input read failed");
                    break;
                }
            }
        }
    }

    Ok(())
}
