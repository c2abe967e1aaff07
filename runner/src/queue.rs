pub mod broker;
pub mod client;
mod wire;


use crate::job::{JobMessage, JobResult};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::{collections::VecDeque, fmt, sync::Arc};
use thiserror::Error;

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum QueueName {
    Jobs,
    Results,
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Jobs => f.write_str("jobs"),
            Self::Results => f.write_str("results"),
        }
    }
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("queue {0} is full")]
    Full(QueueName),
    #[error("authentication against the broker failed")]
    AuthenticationFailed,
    #[error("broker connection failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed queue record: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("broker closed the connection")]
    Disconnected,
    #[error("broker rejected the request: {0}")]
    Rejected(String),
}

impl QueueError {
    /// a full queue clears up on its own, everything else is a real defect
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Full(_))
    }
}

/// Raw access to a pair of queues, either in-process or over the network
///
/// Items are opaque JSON values, typing happens in [`Queues`].
pub trait QueueTransport {
    fn put_raw(&mut self, queue: QueueName, item: Value) -> Result<(), QueueError>;

    /// never blocks, `Ok(None)` signals an empty queue
    fn get_raw(&mut self, queue: QueueName) -> Result<Option<Value>, QueueError>;

    fn len(&mut self, queue: QueueName) -> Result<usize, QueueError>;
}

#[derive(Debug)]
struct Fifo {
    items: Mutex<VecDeque<Value>>,
    capacity: usize,
}

impl Fifo {
    fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            capacity,
        }
    }
}

#[derive(Debug)]
struct QueuePair {
    jobs: Fifo,
    results: Fifo,
}

/// The two broker queues, each behind its own lock
///
/// Cloning hands out another reference to the same queues.
#[derive(Debug, Clone)]
pub struct LocalQueues {
    inner: Arc<QueuePair>,
}

impl LocalQueues {
    /// `capacity` of 0 means unbounded
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(QueuePair {
                jobs: Fifo::new(capacity),
                results: Fifo::new(capacity),
            }),
        }
    }

    fn fifo(&self, queue: QueueName) -> &Fifo {
        match queue {
            QueueName::Jobs => &self.inner.jobs,
            QueueName::Results => &self.inner.results,
        }
    }

    pub fn put(&self, queue: QueueName, item: Value) -> Result<(), QueueError> {
        let fifo = self.fifo(queue);
        let mut items = fifo.items.lock();

        if fifo.capacity != 0 && items.len() >= fifo.capacity {
            return Err(QueueError::Full(queue));
        }

        items.push_back(item);

        Ok(())
    }

    pub fn get_nowait(&self, queue: QueueName) -> Option<Value> {
        self.fifo(queue).items.lock().pop_front()
    }

    pub fn len(&self, queue: QueueName) -> usize {
        self.fifo(queue).items.lock().len()
    }
}

impl QueueTransport for LocalQueues {
    fn put_raw(&mut self, queue: QueueName, item: Value) -> Result<(), QueueError> {
        self.put(queue, item)
    }

    fn get_raw(&mut self, queue: QueueName) -> Result<Option<Value>, QueueError> {
        Ok(self.get_nowait(queue))
    }

    fn len(&mut self, queue: QueueName) -> Result<usize, QueueError> {
        Ok(LocalQueues::len(self, queue))
    }
}

/// Typed view over a [`QueueTransport`]
#[derive(Debug)]
pub struct Queues<Q> {
    transport: Q,
}

impl<Q: QueueTransport> Queues<Q> {
    pub fn new(transport: Q) -> Self {
        Self { transport }
    }

    pub fn put<T: Serialize>(&mut self, queue: QueueName, item: &T) -> Result<(), QueueError> {
        let value = serde_json::to_value(item)?;

        self.transport.put_raw(queue, value)
    }

    /// Take the head item without blocking
    ///
    /// A record that fails to decode is consumed regardless, there is no requeue.
    pub fn get_nowait<T: DeserializeOwned>(
        &mut self,
        queue: QueueName,
    ) -> Result<Option<T>, QueueError> {
        match self.transport.get_raw(queue)? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub fn len(&mut self, queue: QueueName) -> Result<usize, QueueError> {
        self.transport.len(queue)
    }

    pub fn put_job(&mut self, message: &JobMessage) -> Result<(), QueueError> {
        self.put(QueueName::Jobs, message)
    }

    pub fn get_job(&mut self) -> Result<Option<JobMessage>, QueueError> {
        self.get_nowait(QueueName::Jobs)
    }

    pub fn put_result(&mut self, result: &JobResult) -> Result<(), QueueError> {
        self.put(QueueName::Results, result)
    }

    pub fn get_result(&mut self) -> Result<Option<JobResult>, QueueError> {
        self.get_nowait(QueueName::Results)
    }

    pub fn into_inner(self) -> Q {
        self.transport
    }
}
