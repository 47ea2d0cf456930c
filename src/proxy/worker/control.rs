use std::io;
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, unbounded};
use mio::Waker;
use thiserror::Error;

use super::connection::{Connection, ConnectionId};

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("worker {worker} is no longer running")]
    Closed { worker: usize },
    #[error("failed to wake worker {worker}")]
    Wake {
        worker: usize,
        #[source]
        source: io::Error,
    },
}

/// Sending half of a worker's mailbox. Safe to use from any thread,
/// including the worker itself while it dispatches events.
#[derive(Clone)]
pub struct ControlSender {
    worker: usize,
    add: Sender<Connection>,
    remove: Sender<ConnectionId>,
    resume: Sender<ConnectionId>,
    waker: Arc<Waker>,
}

/// Receiving half, owned by the worker and drained between poll cycles.
pub struct ControlReceiver {
    add: Receiver<Connection>,
    remove: Receiver<ConnectionId>,
    resume: Receiver<ConnectionId>,
}

/// Everything queued since the previous drain, grouped by kind.
#[derive(Default)]
pub struct ControlBatch {
    pub adds: Vec<Connection>,
    pub removes: Vec<ConnectionId>,
    pub resumes: Vec<ConnectionId>,
}

impl ControlBatch {
    pub fn is_empty(&self) -> bool {
        self.adds.is_empty() && self.removes.is_empty() && self.resumes.is_empty()
    }
}

pub fn control_channel(worker: usize, waker: Arc<Waker>) -> (ControlSender, ControlReceiver) {
    let (add_tx, add_rx) = unbounded();
    let (remove_tx, remove_rx) = unbounded();
    let (resume_tx, resume_rx) = unbounded();
    (
        ControlSender {
            worker,
            add: add_tx,
            remove: remove_tx,
            resume: resume_tx,
            waker,
        },
        ControlReceiver {
            add: add_rx,
            remove: remove_rx,
            resume: resume_rx,
        },
    )
}

impl ControlSender {
    pub fn worker(&self) -> usize {
        self.worker
    }

    /// Start monitoring `connection` (read interest) on the next cycle.
    pub fn enqueue_add(&self, connection: Connection) -> Result<(), ControlError> {
        self.add.send(connection).map_err(|_| self.closed())?;
        self.wake()
    }

    /// Stop monitoring and close `id`. Unknown ids are ignored by the worker.
    pub fn enqueue_remove(&self, id: ConnectionId) -> Result<(), ControlError> {
        self.remove.send(id).map_err(|_| self.closed())?;
        self.wake()
    }

    /// Ask the worker to retry delivering data to reader `id`.
    pub fn enqueue_resume(&self, id: ConnectionId) -> Result<(), ControlError> {
        self.resume.send(id).map_err(|_| self.closed())?;
        self.wake()
    }

    fn closed(&self) -> ControlError {
        ControlError::Closed {
            worker: self.worker,
        }
    }

    fn wake(&self) -> Result<(), ControlError> {
        self.waker.wake().map_err(|source| ControlError::Wake {
            worker: self.worker,
            source,
        })
    }
}

impl ControlReceiver {
    pub fn drain(&self) -> ControlBatch {
        ControlBatch {
            adds: self.add.try_iter().collect(),
            removes: self.remove.try_iter().collect(),
            resumes: self.resume.try_iter().collect(),
        }
    }
}
