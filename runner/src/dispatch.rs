pub mod queue;
pub mod remote;

use crate::{
    acquire::AcquireError,
    job::{Job, JobId, JobResult},
    queue::QueueError,
    transport::TransportError,
};
use thiserror::Error;

pub use queue::QueueDispatcher;
pub use remote::RemoteDispatcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    Submitted,
    /// no capacity right now, offer the same job again later
    Deferred,
}

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Acquire(#[from] AcquireError),
    #[error("failed to prepare payload for job {id}: {source}")]
    Payload {
        id: JobId,
        #[source]
        source: TransportError,
    },
    #[error("failed to ship job {id} to {host}: {source}")]
    Transport {
        id: JobId,
        host: String,
        #[source]
        source: TransportError,
    },
}

impl DispatchError {
    /// Fatal errors end the sweep, everything else is retried with the same job later
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Queue(e) => !e.is_transient(),
            Self::Acquire(AcquireError::NoHostAvailable { .. }) => false,
            Self::Acquire(AcquireError::EmptyRegistry) => true,
            Self::Payload { .. } => true,
            Self::Transport { source, .. } => source.is_fatal(),
        }
    }
}

/// Strategy for getting jobs executed somewhere and their results back
///
/// Both calls must not block for long, the producer interleaves them in a
/// single loop.
pub trait Dispatcher {
    fn submit(&mut self, job: &Job) -> Result<Submission, DispatchError>;

    /// at most one result per call, `Ok(None)` when nothing arrived
    fn poll(&mut self) -> Result<Option<JobResult>, DispatchError>;

    fn shutdown(&mut self) -> Result<(), DispatchError>;
}
