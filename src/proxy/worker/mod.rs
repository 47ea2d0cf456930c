//! Event-loop workers.
//!
//! Each worker owns one OS thread, one [`mio::Poll`] and a table of client and
//! upstream connections. Other threads (and the worker itself) only touch that
//! table through the worker's control channel, which is drained between poll
//! cycles.

mod connection;
mod control;

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use http::StatusCode;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use tracing::{debug, info, trace, warn};

use crate::logging::AccessLogBuilder;
use crate::metrics;
use crate::proxy::AppContext;
use crate::proxy::cache::{CacheEntry, ReaderNotifier, ResourceKey};
use crate::proxy::http::{
    ParseError, canned_response, is_request_head_complete, parse_request, parse_status_code,
};
use crate::proxy::request::ProxyRequest;
use crate::proxy::upstream::{FetchError, begin_connect, poll_connected};

pub use connection::{
    Attachment, ClientState, Connection, ConnectionId, Role, UpstreamPhase, UpstreamState,
};
pub use control::{ControlBatch, ControlError, ControlReceiver, ControlSender, control_channel};

const WAKER_TOKEN: Token = Token(0);
const EVENTS_CAPACITY: usize = 1024;

/// Cloneable address of a running worker.
#[derive(Clone)]
pub struct WorkerHandle {
    control: ControlSender,
}

impl WorkerHandle {
    pub fn id(&self) -> usize {
        self.control.worker()
    }

    pub fn enqueue_add(&self, connection: Connection) -> Result<(), ControlError> {
        self.control.enqueue_add(connection)
    }

    pub fn enqueue_remove(&self, id: ConnectionId) -> Result<(), ControlError> {
        self.control.enqueue_remove(id)
    }

    pub fn enqueue_resume(&self, id: ConnectionId) -> Result<(), ControlError> {
        self.control.enqueue_resume(id)
    }
}

impl ReaderNotifier for WorkerHandle {
    fn notify(&self, reader: ConnectionId) {
        if let Err(err) = self.control.enqueue_resume(reader) {
            debug!(worker = self.id(), reader = %reader, error = %err, "dropping reader wake-up");
        }
    }
}

pub struct Worker {
    id: usize,
    poll: Poll,
    control: ControlReceiver,
    handle: Arc<WorkerHandle>,
    connections: HashMap<Token, Connection>,
    /// Origin connections still connecting or forwarding, with their timeout.
    deadlines: HashMap<ConnectionId, Instant>,
    app: AppContext,
    read_buf: Vec<u8>,
}

impl Worker {
    /// Create the poller and mailbox for worker `id`.
    pub fn new(id: usize, app: AppContext) -> Result<(Self, WorkerHandle)> {
        let poll = Poll::new().with_context(|| format!("worker {id}: failed to create poller"))?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)
            .with_context(|| format!("worker {id}: failed to create waker"))?;
        let (sender, control) = control_channel(id, Arc::new(waker));
        let handle = WorkerHandle { control: sender };
        let read_buf = vec![0u8; app.settings.read_chunk_size];
        let worker = Self {
            id,
            poll,
            control,
            handle: Arc::new(handle.clone()),
            connections: HashMap::new(),
            deadlines: HashMap::new(),
            app,
            read_buf,
        };
        Ok((worker, handle))
    }

    /// Run until the poller fails. Never returns `Ok`.
    pub fn run(mut self) -> Result<()> {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        info!(worker = self.id, "worker started");
        loop {
            let timeout = self.next_timeout();
            if let Err(err) = self.poll.poll(&mut events, timeout) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err).with_context(|| format!("worker {}: poll failed", self.id));
            }

            self.drain_control();

            for event in events.iter() {
                let token = event.token();
                if token == WAKER_TOKEN {
                    continue;
                }
                let id = ConnectionId::from_token(token);
                if event.is_readable() || event.is_read_closed() || event.is_error() {
                    self.on_readable(id);
                }
                if event.is_writable() {
                    self.on_writable(id);
                }
            }

            self.expire_deadlines();
        }
    }

    fn next_timeout(&self) -> Option<Duration> {
        let now = Instant::now();
        self.deadlines
            .values()
            .min()
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    fn drain_control(&mut self) {
        let ControlBatch {
            adds,
            removes,
            resumes,
        } = self.control.drain();
        for connection in adds {
            self.add_connection(connection);
        }
        for id in removes {
            self.remove_connection(id);
        }
        for id in resumes {
            self.flush_client(id);
        }
    }

    fn add_connection(&mut self, mut connection: Connection) {
        let token = connection.id.token();
        // Origins start out connecting, which completes as a writable event.
        let connecting = matches!(connection.role, Role::Upstream(_));
        let interest = if connecting {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        if let Err(err) = self
            .poll
            .registry()
            .register(&mut connection.stream, token, interest)
        {
            warn!(worker = self.id, peer = %connection.peer, error = %err, "failed to register connection");
            metrics::connection_opened(connection.role.label());
            self.close(connection);
            return;
        }
        trace!(worker = self.id, conn = %connection.id, role = connection.role.label(), "monitoring connection");
        metrics::connection_opened(connection.role.label());
        if connecting {
            connection.writable = true;
            self.deadlines.insert(
                connection.id,
                Instant::now() + self.app.settings.upstream_connect_timeout(),
            );
        }
        self.connections.insert(token, connection);
    }

    /// Idempotent: unknown ids were already removed.
    fn remove_connection(&mut self, id: ConnectionId) {
        self.deadlines.remove(&id);
        let Some(mut connection) = self.connections.remove(&id.token()) else {
            trace!(worker = self.id, conn = %id, "connection already removed");
            return;
        };
        if let Err(err) = self.poll.registry().deregister(&mut connection.stream) {
            debug!(worker = self.id, conn = %id, error = %err, "failed to deregister connection");
        }
        self.close(connection);
    }

    /// Release everything a connection holds. The socket closes on drop.
    fn close(&self, connection: Connection) {
        let Connection { id, peer, role, .. } = connection;
        metrics::connection_closed(role.label());
        match role {
            Role::Client(client) => self.close_client(id, peer, client),
            Role::Upstream(upstream) => {
                if !upstream.entry.is_finished() {
                    debug!(worker = self.id, key = %upstream.key, "upstream removed before end of stream");
                    upstream.entry.mark_aborted();
                    upstream.entry.mark_finished();
                }
                self.app
                    .registry
                    .evict_if_failed(&upstream.key, &upstream.entry);
            }
        }
    }

    fn close_client(&self, id: ConnectionId, peer: SocketAddr, client: ClientState) {
        let ClientState {
            attachment,
            accepted_at,
            bytes_out,
            rejected,
            error_reason,
            ..
        } = client;
        let builder = match (attachment, rejected) {
            (Some(attachment), _) => {
                let remaining = attachment.entry.detach_reader(id);
                trace!(worker = self.id, conn = %id, key = %attachment.key, remaining, "reader detached");
                self.app
                    .registry
                    .evict_if_failed(&attachment.key, &attachment.entry);
                let mut builder = attachment
                    .request
                    .access_log_builder(peer)
                    .cache_lookup(attachment.lookup);
                if let Some(code) = attachment.entry.status().code() {
                    builder = builder.status(code);
                }
                builder
            }
            (None, Some(status)) => AccessLogBuilder::new(peer).status(status),
            (None, None) => {
                trace!(worker = self.id, conn = %id, "client closed before sending a request");
                return;
            }
        };
        let builder = builder
            .worker(self.id)
            .bytes_out(bytes_out)
            .elapsed(accepted_at.elapsed());
        match error_reason {
            Some(reason) => builder.error_reason(reason).log(),
            None => builder.log(),
        }
    }

    fn schedule_removal(&mut self, id: ConnectionId) {
        let Some(connection) = self.connections.get_mut(&id.token()) else {
            return;
        };
        if connection.closing {
            return;
        }
        connection.closing = true;
        if let Err(err) = self.handle.enqueue_remove(id) {
            warn!(worker = self.id, conn = %id, error = %err, "failed to schedule connection removal");
        }
    }

    fn on_readable(&mut self, id: ConnectionId) {
        let Some(connection) = self.connections.get(&id.token()) else {
            return;
        };
        if connection.closing {
            return;
        }
        let receiving = match &connection.role {
            Role::Client(_) => None,
            Role::Upstream(upstream) => Some(matches!(upstream.phase, UpstreamPhase::Receiving)),
        };
        match receiving {
            None => self.client_readable(id),
            Some(true) => self.upstream_readable(id),
            // Connect failures are reported as readable or error events too.
            Some(false) => self.advance_upstream(id),
        }
    }

    fn on_writable(&mut self, id: ConnectionId) {
        let Some(connection) = self.connections.get(&id.token()) else {
            return;
        };
        match connection.role {
            Role::Client(_) => self.flush_client(id),
            Role::Upstream(_) => self.advance_upstream(id),
        }
    }

    fn client_readable(&mut self, id: ConnectionId) {
        let max_head = self.app.settings.max_request_header_size;
        let Self {
            connections,
            read_buf,
            ..
        } = self;
        let Some(connection) = connections.get_mut(&id.token()) else {
            return;
        };
        let Role::Client(client) = &mut connection.role else {
            return;
        };
        // Nothing more will arrive; the client is only reading now.
        if client.input_closed {
            return;
        }

        let mut eof = false;
        let mut failure = None;
        loop {
            match connection.stream.read(read_buf) {
                Ok(0) => {
                    eof = true;
                    break;
                }
                Ok(n) => {
                    // Bytes past the head limit, or after the head was resolved, are drained and dropped.
                    if client.attachment.is_none()
                        && client.rejected.is_none()
                        && client.input.len() <= max_head
                    {
                        client.input.extend_from_slice(&read_buf[..n]);
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }

        if let Some(err) = failure {
            debug!(worker = self.id, conn = %id, error = %err, "client read failed");
            client.error_reason = Some(format!("client read failed: {err}"));
            self.schedule_removal(id);
            return;
        }
        if eof {
            trace!(worker = self.id, conn = %id, "client finished sending");
            client.input_closed = true;
        }
        // Attached readers stay until their response is delivered or a write fails.
        if client.attachment.is_some() || client.rejected.is_some() {
            return;
        }
        if is_request_head_complete(&client.input) || client.input.len() > max_head {
            self.start_request(id);
        } else if eof {
            self.schedule_removal(id);
        }
    }

    fn start_request(&mut self, id: ConnectionId) {
        let max_head = self.app.settings.max_request_header_size;
        let Some(Role::Client(client)) = self
            .connections
            .get_mut(&id.token())
            .map(|connection| &mut connection.role)
        else {
            return;
        };
        let input = std::mem::take(&mut client.input);
        let parsed = parse_request(&input, max_head)
            .and_then(|head| ProxyRequest::from_head(&head));
        match parsed {
            Ok(request) => self.attach_client(id, request),
            Err(err) => self.reject_client(id, err),
        }
    }

    fn attach_client(&mut self, id: ConnectionId, request: ProxyRequest) {
        let key = request.resource_key();
        let (entry, created) = self.app.registry.get_or_create(&key);
        let lookup = if created {
            "miss"
        } else if entry.is_finished() {
            "hit"
        } else {
            "coalesced"
        };
        metrics::record_cache_lookup(lookup);
        debug!(worker = self.id, conn = %id, key = %key, lookup, "request resolved");

        if created {
            self.start_fetch(&request, &key, &entry);
        }

        let notifier: Arc<dyn ReaderNotifier> = self.handle.clone();
        entry.attach_reader(id, notifier);

        let Some(connection) = self.connections.get_mut(&id.token()) else {
            entry.detach_reader(id);
            return;
        };
        if let Role::Client(client) = &mut connection.role {
            client.attachment = Some(Attachment {
                key,
                entry,
                request,
                lookup,
            });
        }
        self.flush_client(id);
    }

    /// Begin opening the origin connection for a freshly created entry and
    /// hand the upstream to this worker through its own mailbox.
    fn start_fetch(&self, request: &ProxyRequest, key: &ResourceKey, entry: &Arc<CacheEntry>) {
        metrics::record_upstream_fetch();
        let failure = match self.app.connector.open(request) {
            Ok(upstream) => {
                debug!(worker = self.id, key = %key, origin = %upstream.origin, "upstream fetch started");
                let connection = Connection::upstream(upstream, key.clone(), entry.clone());
                match self.handle.enqueue_add(connection) {
                    Ok(()) => return,
                    Err(err) => err.to_string(),
                }
            }
            Err(err) => {
                metrics::record_upstream_error(err.kind());
                warn!(worker = self.id, key = %key, error = %err, "upstream fetch failed");
                err.to_string()
            }
        };
        trace!(worker = self.id, key = %key, reason = %failure, "answering with 502");
        answer_bad_gateway(entry);
    }

    /// Drive an origin connection through connect and request forwarding.
    fn advance_upstream(&mut self, id: ConnectionId) {
        let io_timeout = self.app.settings.upstream_io_timeout();
        let Some(connection) = self.connections.get_mut(&id.token()) else {
            return;
        };
        if connection.closing {
            return;
        }
        let origin = connection.peer;
        let Role::Upstream(upstream) = &mut connection.role else {
            return;
        };

        if let UpstreamPhase::Connecting { .. } = upstream.phase {
            match poll_connected(&connection.stream) {
                Ok(false) => return,
                Ok(true) => {
                    trace!(worker = self.id, key = %upstream.key, origin = %origin, "connected to upstream");
                    upstream.phase.connected();
                    self.deadlines.insert(id, Instant::now() + io_timeout);
                }
                Err(err) => {
                    self.retry_upstream(id, err);
                    return;
                }
            }
        }

        let UpstreamPhase::Forwarding { request, written } = &mut upstream.phase else {
            return;
        };
        let mut failure = None;
        while *written < request.len() {
            match connection.stream.write(&request[*written..]) {
                Ok(0) => {
                    failure = Some(io::Error::from(io::ErrorKind::WriteZero));
                    break;
                }
                Ok(n) => *written += n,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }
        if let Some(source) = failure {
            self.fail_upstream(id, FetchError::Forward { origin, source });
            return;
        }

        trace!(worker = self.id, key = %upstream.key, "request forwarded");
        upstream.phase = UpstreamPhase::Receiving;
        self.deadlines.remove(&id);
        if let Err(err) = set_write_interest(self.poll.registry(), connection, false) {
            self.fail_upstream(id, FetchError::Forward { origin, source: err });
            return;
        }
        // Readiness that arrived while forwarding was not consumed.
        self.upstream_readable(id);
    }

    /// Move a failed connect on to the next resolved address, or give up.
    fn retry_upstream(&mut self, id: ConnectionId, err: io::Error) {
        let connect_timeout = self.app.settings.upstream_connect_timeout();
        let Some(connection) = self.connections.get_mut(&id.token()) else {
            return;
        };
        let failed = connection.peer;
        let Role::Upstream(upstream) = &mut connection.role else {
            return;
        };
        let UpstreamPhase::Connecting { fallback, .. } = &mut upstream.phase else {
            return;
        };
        debug!(worker = self.id, key = %upstream.key, origin = %failed, error = %err, "upstream connect attempt failed");

        let remaining = std::mem::take(fallback);
        let Ok((stream, origin, rest)) = begin_connect(&remaining) else {
            self.fail_upstream(
                id,
                FetchError::Connect {
                    target: failed.to_string(),
                    source: err,
                },
            );
            return;
        };
        *fallback = rest;

        let registry = self.poll.registry();
        if let Err(err) = registry.deregister(&mut connection.stream) {
            debug!(worker = self.id, conn = %id, error = %err, "failed to deregister upstream");
        }
        connection.stream = stream;
        connection.peer = origin;
        connection.writable = true;
        if let Err(source) = registry.register(
            &mut connection.stream,
            id.token(),
            Interest::READABLE | Interest::WRITABLE,
        ) {
            self.fail_upstream(
                id,
                FetchError::Connect {
                    target: origin.to_string(),
                    source,
                },
            );
            return;
        }
        self.deadlines.insert(id, Instant::now() + connect_timeout);
    }

    /// Answer every reader of an origin that never got the request with a 502.
    fn fail_upstream(&mut self, id: ConnectionId, err: FetchError) {
        self.deadlines.remove(&id);
        let Some(Role::Upstream(upstream)) = self
            .connections
            .get(&id.token())
            .map(|connection| &connection.role)
        else {
            return;
        };
        metrics::record_upstream_error(err.kind());
        warn!(worker = self.id, key = %upstream.key, error = %err, "upstream fetch failed");
        let key = upstream.key.clone();
        let entry = upstream.entry.clone();
        answer_bad_gateway(&entry);
        self.app.registry.evict_if_failed(&key, &entry);
        self.schedule_removal(id);
    }

    fn expire_deadlines(&mut self) {
        if self.deadlines.is_empty() {
            return;
        }
        let now = Instant::now();
        let expired: Vec<ConnectionId> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            self.deadlines.remove(&id);
            let Some(connection) = self.connections.get(&id.token()) else {
                continue;
            };
            let Role::Upstream(upstream) = &connection.role else {
                continue;
            };
            let origin = connection.peer;
            let connecting = matches!(upstream.phase, UpstreamPhase::Connecting { .. });
            debug!(worker = self.id, key = %upstream.key, phase = upstream.phase.label(), "upstream timed out");
            let timed_out = io::Error::from(io::ErrorKind::TimedOut);
            if connecting {
                self.retry_upstream(id, timed_out);
            } else {
                self.fail_upstream(
                    id,
                    FetchError::Forward {
                        origin,
                        source: timed_out,
                    },
                );
            }
        }
    }

    fn reject_client(&mut self, id: ConnectionId, err: ParseError) {
        let status = err.status();
        debug!(worker = self.id, conn = %id, status = status.as_u16(), error = %err, "rejecting request");
        let Some(connection) = self.connections.get_mut(&id.token()) else {
            return;
        };
        let Role::Client(client) = &mut connection.role else {
            return;
        };
        let response = canned_response(status);
        // Best effort: a fresh socket accepts a response this small in one write.
        if let Ok(written) = connection.stream.write(&response) {
            client.bytes_out = written as u64;
        }
        client.rejected = Some(status);
        client.error_reason = Some(err.to_string());
        self.schedule_removal(id);
    }

    /// Send whatever is unread for client `id` until the socket would block.
    fn flush_client(&mut self, id: ConnectionId) {
        let chunk_size = self.app.settings.read_chunk_size;
        let Some(connection) = self.connections.get_mut(&id.token()) else {
            return;
        };
        if connection.closing {
            return;
        }
        let Role::Client(client) = &mut connection.role else {
            return;
        };
        let Some(attachment) = client.attachment.as_ref() else {
            return;
        };

        let want_write;
        loop {
            let chunk = attachment.entry.peek_unread(id, chunk_size);
            if chunk.is_empty() {
                if attachment.entry.is_reader_done(id) {
                    trace!(worker = self.id, conn = %id, bytes_out = client.bytes_out, "response delivered");
                    self.schedule_removal(id);
                    return;
                }
                want_write = false;
                break;
            }
            match connection.stream.write(&chunk) {
                Ok(0) => {
                    client.error_reason = Some("client stopped accepting data".to_string());
                    self.schedule_removal(id);
                    return;
                }
                Ok(n) => {
                    attachment.entry.advance(id, n);
                    client.bytes_out += n as u64;
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    want_write = true;
                    break;
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    debug!(worker = self.id, conn = %id, error = %err, "client write failed");
                    client.error_reason = Some(format!("client write failed: {err}"));
                    self.schedule_removal(id);
                    return;
                }
            }
        }

        if let Err(err) = set_write_interest(self.poll.registry(), connection, want_write) {
            warn!(worker = self.id, conn = %id, error = %err, "failed to update client interest");
            self.schedule_removal(id);
        }
    }

    fn upstream_readable(&mut self, id: ConnectionId) {
        let Self {
            connections,
            read_buf,
            ..
        } = self;
        let Some(connection) = connections.get_mut(&id.token()) else {
            return;
        };
        let Role::Upstream(upstream) = &connection.role else {
            return;
        };

        let mut received = false;
        let mut finished = false;
        loop {
            match connection.stream.read(read_buf) {
                Ok(0) => {
                    finished = true;
                    break;
                }
                Ok(n) => {
                    upstream.entry.append(&read_buf[..n]);
                    received = true;
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!(worker = self.id, key = %upstream.key, error = %err, "upstream read failed");
                    metrics::record_upstream_error("read");
                    upstream.entry.mark_aborted();
                    finished = true;
                    break;
                }
            }
        }

        if received {
            upstream.entry.capture_status(parse_status_code);
            upstream.entry.notify_readers();
        }
        if finished {
            let entry = upstream.entry.clone();
            let key = upstream.key.clone();
            entry.mark_finished();
            debug!(
                worker = self.id,
                key = %key,
                bytes = entry.len(),
                status = ?entry.status(),
                readers = entry.reader_count(),
                "upstream finished"
            );
            self.app.registry.evict_if_failed(&key, &entry);
            self.schedule_removal(id);
        }
    }

    #[cfg(test)]
    fn connection_count(&self) -> usize {
        self.connections.len()
    }

    #[cfg(test)]
    fn is_closing(&self, id: ConnectionId) -> bool {
        self.connections
            .get(&id.token())
            .is_none_or(|connection| connection.closing)
    }
}

/// Complete an entry with a synthesized `502 Bad Gateway`.
fn answer_bad_gateway(entry: &CacheEntry) {
    entry.append(&canned_response(StatusCode::BAD_GATEWAY));
    entry.capture_status(parse_status_code);
    entry.mark_finished();
}

fn set_write_interest(
    registry: &Registry,
    connection: &mut Connection,
    writable: bool,
) -> io::Result<()> {
    if connection.writable == writable {
        return Ok(());
    }
    let interest = if writable {
        Interest::READABLE | Interest::WRITABLE
    } else {
        Interest::READABLE
    };
    registry.reregister(&mut connection.stream, connection.id.token(), interest)?;
    connection.writable = writable;
    Ok(())
}
