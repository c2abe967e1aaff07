pub mod command;
pub mod host;

use crate::{
    config::WorkerConfig,
    job::{JobId, JobMessage},
    queue::{QueueError, QueueTransport, Queues},
    transport::TransportError,
};
use std::{path::PathBuf, thread, time::Duration};
use thiserror::Error;
use tracing::{debug, info, instrument};

pub use command::SimulationCommand;
pub use host::HostWorker;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("failed to write result record: {0}")]
    Record(#[from] serde_yaml::Error),
}

impl WorkerError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Idle,
    Ran(JobId),
    Killed,
}

/// Polls the shared job queue and runs whatever it finds until told to stop
#[derive(Debug)]
pub struct QueueWorker<Q> {
    queues: Queues<Q>,
    command: SimulationCommand,
    poll_interval: Duration,
}

impl<Q: QueueTransport> QueueWorker<Q> {
    pub fn new(transport: Q, command: SimulationCommand, poll_interval: Duration) -> Self {
        Self {
            queues: Queues::new(transport),
            command,
            poll_interval,
        }
    }

    pub fn load(transport: Q, config: &WorkerConfig) -> Self {
        Self::new(
            transport,
            SimulationCommand::load(config),
            Duration::from_millis(config.poll_interval_ms),
        )
    }

    /// Take at most one message off the job queue and handle it
    pub fn step(&mut self) -> Result<Step, WorkerError> {
        let job = match self.queues.get_job()? {
            None => return Ok(Step::Idle),
            Some(JobMessage::Kill) => return Ok(Step::Killed),
            Some(JobMessage::Run(job)) => job,
        };

        let result = self.command.run(&job, None);

        // the result queue filling up only delays us
        loop {
            match self.queues.put_result(&result) {
                Ok(()) => break,
                Err(e) if e.is_transient() => {
                    debug!(job = job.id, "Result queue is full, waiting");
                    thread::sleep(self.poll_interval);
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(Step::Ran(job.id))
    }

    /// Returns the number of jobs run before the kill marker arrived
    #[instrument(skip_all)]
    pub fn run(&mut self) -> Result<usize, WorkerError> {
        let mut ran = 0;

        loop {
            match self.step()? {
                Step::Idle => thread::sleep(self.poll_interval),
                Step::Ran(_) => ran += 1,
                Step::Killed => {
                    info!(ran, "Received kill marker, stopping");
                    return Ok(ran);
                }
            }
        }
    }
}
