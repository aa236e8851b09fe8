//! Address resolution and stream-socket setup.
//!
//! Resolution is constrained to IPv4 stream sockets and accepts either a
//! numeric port or an `/etc/services` name. Sockets are built explicitly
//! through `socket2` so the listener can enable address reuse before bind;
//! a restart right after a crash must not fail with "address in use".

use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};

/// A concrete address produced by name/service resolution.
///
/// Used once to create a socket; the numeric accessors exist only for
/// operator-facing diagnostics.
#[derive(Debug, Clone, Copy)]
pub struct ResolvedAddr {
    addr: SocketAddr,
}

impl ResolvedAddr {
    pub fn socket_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Numeric host string, for diagnostics.
    pub fn numeric_host(&self) -> String {
        self.addr.ip().to_string()
    }

    /// Numeric port string, for diagnostics.
    pub fn numeric_port(&self) -> String {
        self.addr.port().to_string()
    }
}

/// Resolve a host and service into a single IPv4 stream address.
///
/// A `host` of `None` means "any local address" and is used for listening
/// sockets. `service` may be a numeric port or a service name.
pub fn resolve(host: Option<&str>, service: &str) -> Result<ResolvedAddr, SetupError> {
    let fail = |source: io::Error| SetupError::Resolve {
        host: host.map(str::to_owned),
        service: service.to_owned(),
        source,
    };

    let port = lookup_service(service).map_err(fail)?;

    let addr = match host {
        None => SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)),
        Some(name) => (name, port)
            .to_socket_addrs()
            .map_err(fail)?
            .find(SocketAddr::is_ipv4)
            .ok_or_else(|| {
                fail(io::Error::new(
                    io::ErrorKind::NotFound,
                    "no IPv4 address found",
                ))
            })?,
    };

    Ok(ResolvedAddr { addr })
}

/// Create a stream socket and connect it to `resolved`.
///
/// On failure the partially created socket is closed before returning.
pub fn connect(resolved: &ResolvedAddr) -> Result<TcpStream, SetupError> {
    let socket =
        Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).map_err(SetupError::Socket)?;

    socket
        .connect(&resolved.socket_addr().into())
        .map_err(|source| SetupError::Connect {
            addr: resolved.socket_addr(),
            source,
        })?;

    Ok(socket.into())
}

/// Create a stream socket, enable address reuse, bind it to `resolved`, and
/// begin listening with the platform-maximum backlog.
///
/// On failure at any step the socket is closed before returning.
pub fn listen(resolved: &ResolvedAddr) -> Result<TcpListener, SetupError> {
    let socket =
        Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).map_err(SetupError::Socket)?;

    socket.set_reuse_address(true).map_err(SetupError::Socket)?;

    socket
        .bind(&resolved.socket_addr().into())
        .map_err(|source| SetupError::Bind {
            addr: resolved.socket_addr(),
            source,
        })?;

    socket.listen(libc::SOMAXCONN).map_err(SetupError::Listen)?;

    Ok(socket.into())
}

/// Look up a service string as a numeric port first, then in the system
/// services database for the `tcp` protocol.
fn lookup_service(service: &str) -> Result<u16, io::Error> {
    if let Ok(port) = service.parse::<u16>() {
        return Ok(port);
    }

    let name = std::ffi::CString::new(service)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "service name contains NUL"))?;

    // getservbyname returns a pointer into static storage; the port is
    // copied out before any other libc call can clobber it.
    let entry = unsafe { libc::getservbyname(name.as_ptr(), c"tcp".as_ptr()) };
    if entry.is_null() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("unknown service '{service}'"),
        ));
    }

    let raw_port = unsafe { (*entry).s_port };
    Ok(u16::from_be(raw_port as u16))
}

/// Errors raised while resolving an address or setting up a socket.
#[derive(Debug)]
pub enum SetupError {
    /// Name/service resolution failed.
    Resolve {
        host: Option<String>,
        service: String,
        source: io::Error,
    },
    /// Socket creation or option setting failed.
    Socket(io::Error),
    /// Connection establishment failed.
    Connect { addr: SocketAddr, source: io::Error },
    /// Binding the listener address failed.
    Bind { addr: SocketAddr, source: io::Error },
    /// Entering the listening state failed.
    Listen(io::Error),
}

impl std::fmt::Display for SetupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SetupError::Resolve {
                host,
                service,
                source,
            } => {
                let host = host.as_deref().unwrap_or("*");
                write!(f, "Failed to resolve '{host}:{service}': {source}")
            }
            SetupError::Socket(e) => write!(f, "Failed to create socket: {e}"),
            SetupError::Connect { addr, source } => {
                write!(f, "Failed to connect to {addr}: {source}")
            }
            SetupError::Bind { addr, source } => write!(f, "Failed to bind {addr}: {source}"),
            SetupError::Listen(e) => write!(f, "Failed to listen: {e}"),
        }
    }
}

impl std::error::Error for SetupError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn test_resolve_numeric_port() {
        let resolved = resolve(None, "4242").unwrap();
        assert_eq!(resolved.socket_addr().port(), 4242);
        assert_eq!(resolved.numeric_host(), "0.0.0.0");
        assert_eq!(resolved.numeric_port(), "4242");
    }

    #[test]
    fn test_resolve_loopback_host() {
        let resolved = resolve(Some("127.0.0.1"), "7").unwrap();
        assert_eq!(resolved.numeric_host(), "127.0.0.1");
        assert!(resolved.socket_addr().is_ipv4());
    }

    #[test]
    fn test_resolve_unknown_service() {
        let err = resolve(None, "no-such-service-entry").unwrap_err();
        assert!(matches!(err, SetupError::Resolve { .. }));
    }

    #[test]
    fn test_listen_then_connect() {
        let resolved = resolve(Some("127.0.0.1"), "0").unwrap();
        let listener = listen(&resolved).unwrap();
        let port = listener.local_addr().unwrap().port().to_string();

        let target = resolve(Some("127.0.0.1"), &port).unwrap();
        let mut client = connect(&target).unwrap();

        let (mut accepted, _) = listener.accept().unwrap();
        client.write_all(b"x").unwrap();
        let mut byte = [0u8; 1];
        accepted.read_exact(&mut byte).unwrap();
        assert_eq!(&byte, b"x");
    }

    #[test]
    fn test_connect_without_listener_fails() {
        let resolved = resolve(Some("127.0.0.1"), "0").unwrap();
        let listener = listen(&resolved).unwrap();
        let port = listener.local_addr().unwrap().port().to_string();
        drop(listener);

        let target = resolve(Some("127.0.0.1"), &port).unwrap();
        let err = connect(&target).unwrap_err();
        assert!(matches!(err, SetupError::Connect { .. }));
    }

    #[test]
    fn test_listen_reuses_address_after_drop() {
        let resolved = resolve(Some("127.0.0.1"), "0").unwrap();
        let first = listen(&resolved).unwrap();
        let port = first.local_addr().unwrap().port().to_string();
        drop(first);

        let again = resolve(Some("127.0.0.1"), &port).unwrap();
        listen(&again).unwrap();
    }
}
