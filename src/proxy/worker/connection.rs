use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use http::StatusCode;
use mio::Token;
use mio::net::TcpStream;

use crate::proxy::cache::{CacheEntry, ResourceKey};
use crate::proxy::request::ProxyRequest;
use crate::proxy::upstream::UpstreamStream;

/// Token 0 belongs to each worker's waker, so ids start at 1.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque, process-unique handle for a monitored connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn token(self) -> Token {
        Token(self.0 as usize)
    }

    pub fn from_token(token: Token) -> Self {
        Self(token.0 as u64)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A socket handed to a worker together with what the worker needs to drive it.
pub struct Connection {
    pub id: ConnectionId,
    pub stream: TcpStream,
    pub peer: SocketAddr,
    pub role: Role,
    /// Write interest currently registered with the poller.
    pub(super) writable: bool,
    /// Removal has been requested; ignore further readiness.
    pub(super) closing: bool,
}

pub enum Role {
    Client(ClientState),
    Upstream(UpstreamState),
}

impl Role {
    pub fn label(&self) -> &'static str {
        match self {
            Role::Client(_) => "client",
            Role::Upstream(_) => "upstream",
        }
    }
}

pub struct ClientState {
    /// Request bytes received so far, cleared once the request is resolved.
    pub input: Vec<u8>,
    pub attachment: Option<Attachment>,
    /// The client shut down its sending side. It may still be reading.
    pub input_closed: bool,
    pub accepted_at: Instant,
    pub bytes_out: u64,
    pub rejected: Option<StatusCode>,
    pub error_reason: Option<String>,
}

/// Binding between a client and the cache entry it reads from.
pub struct Attachment {
    pub key: ResourceKey,
    pub entry: Arc<CacheEntry>,
    pub request: ProxyRequest,
    /// `miss`, `coalesced` or `hit`.
    pub lookup: &'static str,
}

pub struct UpstreamState {
    pub key: ResourceKey,
    pub entry: Arc<CacheEntry>,
    pub phase: UpstreamPhase,
}

/// Where an origin connection is on its way to streaming a response.
pub enum UpstreamPhase {
    Connecting {
        fallback: Vec<SocketAddr>,
        request: Vec<u8>,
    },
    Forwarding {
        request: Vec<u8>,
        written: usize,
    },
    Receiving,
}

impl UpstreamPhase {
    pub fn label(&self) -> &'static str {
        match self {
            UpstreamPhase::Connecting { .. } => "connecting",
            UpstreamPhase::Forwarding { .. } => "forwarding",
            UpstreamPhase::Receiving => "receiving",
        }
    }

    /// Move from `Connecting` to `Forwarding`; other phases are left alone.
    pub fn connected(&mut self) {
        if let UpstreamPhase::Connecting { request, .. } = self {
            let request = std::mem::take(request);
            *self = UpstreamPhase::Forwarding {
                request,
                written: 0,
            };
        }
    }
}

impl Connection {
    pub fn client(stream: TcpStream, peer: SocketAddr) -> Self {
        Self::with_role(
            stream,
            peer,
            Role::Client(ClientState {
                input: Vec::new(),
                attachment: None,
                input_closed: false,
                accepted_at: Instant::now(),
                bytes_out: 0,
                rejected: None,
                error_reason: None,
            }),
        )
    }

    pub fn upstream(upstream: UpstreamStream, key: ResourceKey, entry: Arc<CacheEntry>) -> Self {
        let UpstreamStream {
            stream,
            origin,
            fallback,
            request,
        } = upstream;
        Self::with_role(
            stream,
            origin,
            Role::Upstream(UpstreamState {
                key,
                entry,
                phase: UpstreamPhase::Connecting { fallback, request },
            }),
        )
    }

    fn with_role(stream: TcpStream, peer: SocketAddr, role: Role) -> Self {
        Self {
            id: ConnectionId::next(),
            stream,
            peer,
            role,
            writable: false,
            closing: false,
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("role", &self.role.label())
            .field("closing", &self.closing)
            .finish()
    }
}
