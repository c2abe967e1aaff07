use super::{DispatchError, Dispatcher, Submission};
use crate::{
    config::BrokerConfig,
    job::{Job, JobMessage, JobResult},
    queue::{QueueError, QueueTransport, Queues},
};
use std::{
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, info, trace};

const FULL_BACKOFF: Duration = Duration::from_millis(10);

/// Dispatches through the shared job/result queues to whichever workers poll them
#[derive(Debug)]
pub struct QueueDispatcher<Q> {
    queues: Queues<Q>,
    kill_markers: usize,
    grace_period: Duration,
}

impl<Q: QueueTransport> QueueDispatcher<Q> {
    pub fn new(transport: Q, kill_markers: usize, grace_period: Duration) -> Self {
        Self {
            queues: Queues::new(transport),
            kill_markers,
            grace_period,
        }
    }

    pub fn load(transport: Q, config: &BrokerConfig) -> Self {
        Self::new(
            transport,
            config.kill_markers,
            Duration::from_secs(config.grace_period_secs),
        )
    }

    pub fn into_inner(self) -> Q {
        self.queues.into_inner()
    }
}

impl<Q: QueueTransport> Dispatcher for QueueDispatcher<Q> {
    fn submit(&mut self, job: &Job) -> Result<Submission, DispatchError> {
        match self.queues.put_job(&JobMessage::Run(job.clone())) {
            Ok(()) => Ok(Submission::Submitted),
            Err(QueueError::Full(_)) => {
                trace!(job = job.id, "Job queue is full");
                Ok(Submission::Deferred)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn poll(&mut self) -> Result<Option<JobResult>, DispatchError> {
        Ok(self.queues.get_result()?)
    }

    /// Tell workers to stop, then give them time to pick up the markers
    fn shutdown(&mut self) -> Result<(), DispatchError> {
        let deadline = Instant::now() + self.grace_period;

        for sent in 0..self.kill_markers {
            loop {
                match self.queues.put_job(&JobMessage::Kill) {
                    Ok(()) => break,
                    Err(e) if e.is_transient() && Instant::now() < deadline => {
                        thread::sleep(FULL_BACKOFF)
                    }
                    Err(e) => {
                        debug!(sent, "Stopped sending kill markers: {e}");
                        return Err(e.into());
                    }
                }
            }
        }

        info!(
            markers = self.kill_markers,
            "Sent kill markers, waiting {:?} for workers to exit", self.grace_period
        );
        thread::sleep(self.grace_period);

        Ok(())
    }
}
