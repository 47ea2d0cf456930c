use std::net::TcpListener;

use anyhow::{Context, Result, ensure};
use tracing::{debug, error, info};

use super::worker::{Connection, WorkerHandle};

/// Accept clients forever, handing them to workers round-robin.
///
/// Returns only when a worker mailbox is closed, which means that worker died.
pub fn accept_loop(listener: TcpListener, workers: Vec<WorkerHandle>) -> Result<()> {
    ensure!(!workers.is_empty(), "listener needs at least one worker");
    let local_addr = listener.local_addr().context("listener has no local address")?;
    info!(address = %local_addr, workers = workers.len(), "proxy listener started");

    let mut next = 0usize;
    for incoming in listener.incoming() {
        let stream = match incoming {
            Ok(stream) => stream,
            Err(err) => {
                error!(error = %err, "failed to accept incoming connection");
                continue;
            }
        };
        let peer = match stream.peer_addr() {
            Ok(peer) => peer,
            Err(err) => {
                debug!(error = %err, "dropping connection without peer address");
                continue;
            }
        };
        if let Err(err) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = %err, "failed to set TCP_NODELAY on downstream stream");
        }
        if let Err(err) = stream.set_nonblocking(true) {
            debug!(peer = %peer, error = %err, "failed to make downstream stream non-blocking");
            continue;
        }

        let worker = &workers[next % workers.len()];
        next = next.wrapping_add(1);
        debug!(peer = %peer, worker = worker.id(), "accepted connection");
        let connection = Connection::client(mio::net::TcpStream::from_std(stream), peer);
        worker
            .enqueue_add(connection)
            .with_context(|| format!("worker {} stopped accepting connections", worker.id()))?;
    }
    Ok(())
}
