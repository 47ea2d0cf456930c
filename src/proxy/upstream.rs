use std::io;
use std::net::SocketAddr;

use thiserror::Error;
use tracing::debug;

use crate::proxy::request::ProxyRequest;
use crate::proxy::resolver;

/// Why an upstream fetch never produced a response stream.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("failed to resolve {host}:{port}")]
    Resolve {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },
    #[error("failed to connect to {target}")]
    Connect {
        target: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to forward request to {origin}")]
    Forward {
        origin: SocketAddr,
        #[source]
        source: io::Error,
    },
}

impl FetchError {
    /// Short label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::Resolve { .. } => "resolve",
            FetchError::Connect { source, .. } if source.kind() == io::ErrorKind::TimedOut => {
                "connect_timeout"
            }
            FetchError::Connect { .. } => "connect",
            FetchError::Forward { .. } => "forward",
        }
    }
}

/// An origin connection whose non-blocking connect is in flight.
///
/// The request is not sent yet; the worker writes `request` once the socket
/// reports writable and falls back to the next address in `fallback` if the
/// attempt fails.
#[derive(Debug)]
pub struct UpstreamStream {
    pub stream: mio::net::TcpStream,
    pub origin: SocketAddr,
    pub fallback: Vec<SocketAddr>,
    pub request: Vec<u8>,
}

/// Begins opening the origin connection for a request.
///
/// Implementations must not wait for the connection to complete. The returned
/// stream yields the raw response once the request has been written and until
/// the origin closes its side.
pub trait UpstreamConnector: Send + Sync {
    fn open(&self, request: &ProxyRequest) -> Result<UpstreamStream, FetchError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl UpstreamConnector for TcpConnector {
    fn open(&self, request: &ProxyRequest) -> Result<UpstreamStream, FetchError> {
        let addrs = resolver::resolve_host(&request.host, request.port).map_err(|source| {
            FetchError::Resolve {
                host: request.host.clone(),
                port: request.port,
                source,
            }
        })?;
        let (stream, origin, fallback) =
            begin_connect(&addrs).map_err(|source| FetchError::Connect {
                target: request.authority_host(),
                source,
            })?;

        Ok(UpstreamStream {
            stream,
            origin,
            fallback,
            request: request.encode_upstream(),
        })
    }
}

/// Start a non-blocking connect to the first address that accepts the attempt.
///
/// Returns the stream, the address it targets and the addresses left untried.
pub fn begin_connect(
    addrs: &[SocketAddr],
) -> io::Result<(mio::net::TcpStream, SocketAddr, Vec<SocketAddr>)> {
    let mut last_err = None;
    for (index, addr) in addrs.iter().enumerate() {
        match mio::net::TcpStream::connect(*addr) {
            Ok(stream) => {
                debug!(host = %addr.ip(), port = addr.port(), "upstream connect started");
                return Ok((stream, *addr, addrs[index + 1..].to_vec()));
            }
            Err(err) => {
                debug!(host = %addr.ip(), port = addr.port(), error = %err, "upstream connect attempt failed");
                last_err = Some(err);
            }
        }
    }

    Err(last_err.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            "no addresses provided for upstream connect",
        )
    }))
}

/// Check a connect started by [`begin_connect`] after the socket became ready.
///
/// `Ok(false)` means the attempt is still in flight.
pub fn poll_connected(stream: &mio::net::TcpStream) -> io::Result<bool> {
    if let Some(err) = stream.take_error()? {
        return Err(err);
    }
    match stream.peer_addr() {
        Ok(_) => {
            if let Err(err) = stream.set_nodelay(true) {
                debug!(error = %err, "failed to set TCP_NODELAY on upstream stream");
            }
            Ok(true)
        }
        Err(err) if err.kind() == io::ErrorKind::NotConnected => Ok(false),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;
    use std::time::Duration;

    use crate::proxy::http::parse_request;

    fn request_for(addr: SocketAddr) -> ProxyRequest {
        let raw = format!("GET http://{addr}/resource HTTP/1.1\r\nAccept: */*\r\n\r\n");
        let head = parse_request(raw.as_bytes(), 4096).unwrap();
        ProxyRequest::from_head(&head).unwrap()
    }

    fn wait_connected(stream: &mio::net::TcpStream) -> io::Result<bool> {
        for _ in 0..100 {
            if poll_connected(stream)? {
                return Ok(true);
            }
            thread::sleep(Duration::from_millis(10));
        }
        Ok(false)
    }

    #[test]
    fn open_returns_before_request_is_sent() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let mut upstream = TcpConnector.open(&request_for(addr)).unwrap();
        assert_eq!(upstream.origin, addr);
        assert!(upstream.fallback.is_empty());
        let text = String::from_utf8(upstream.request.clone()).unwrap();
        assert!(text.starts_with("GET /resource HTTP/1.1\r\n"), "got {text}");
        assert!(text.contains("Connection: close\r\n"));

        assert!(wait_connected(&upstream.stream).unwrap());
        let (mut accepted, _) = listener.accept().unwrap();
        upstream.stream.write_all(&upstream.request).unwrap();
        accepted
            .set_read_timeout(Some(Duration::from_secs(1)))
            .unwrap();
        let mut received = vec![0u8; upstream.request.len()];
        accepted.read_exact(&mut received).unwrap();
        assert_eq!(received, upstream.request);
    }

    #[test]
    fn refused_connection_surfaces_when_polled() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let upstream = match TcpConnector.open(&request_for(addr)) {
            Ok(upstream) => upstream,
            // Some platforms refuse loopback connects synchronously.
            Err(err) => {
                assert!(matches!(err, FetchError::Connect { .. }), "got {err:?}");
                return;
            }
        };
        assert!(wait_connected(&upstream.stream).is_err());
    }

    #[test]
    fn remaining_addresses_are_kept_for_fallback() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let first = listener.local_addr().unwrap();
        let second: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let (_stream, origin, fallback) = begin_connect(&[first, second]).unwrap();
        assert_eq!(origin, first);
        assert_eq!(fallback, vec![second]);
    }

    #[test]
    fn empty_address_list_is_an_error() {
        let err = begin_connect(&[]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn timed_out_connect_has_its_own_label() {
        let err = FetchError::Connect {
            target: "origin.test:80".to_string(),
            source: io::Error::from(io::ErrorKind::TimedOut),
        };
        assert_eq!(err.kind(), "connect_timeout");
    }
}
