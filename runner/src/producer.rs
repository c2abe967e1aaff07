use crate::{
    buffer::{Recorded, ResultBuffer, Slot},
    config::CampaignConfig,
    dispatch::{DispatchError, Dispatcher, Submission},
    job::{Job, JobId, JobResult, JobStatus},
    progress::{ProgressEvent, ProgressTracker},
};
use std::{
    collections::VecDeque,
    thread,
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Clone)]
pub struct ProducerConfig {
    pub progress_step: u32,
    pub max_retries: u32,
    pub deadline: Option<Duration>,
    pub idle_backoff: Duration,
}

impl ProducerConfig {
    pub fn load(config: &CampaignConfig) -> Self {
        Self {
            progress_step: config.progress_step,
            max_retries: config.max_retries,
            deadline: config.deadline_secs.map(Duration::from_secs),
            idle_backoff: Duration::from_millis(config.idle_backoff_ms),
        }
    }
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            progress_step: 5,
            max_retries: 0,
            deadline: None,
            idle_backoff: Duration::from_millis(10),
        }
    }
}

#[derive(Error, Debug)]
pub enum ProducerError {
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error("stopped after {:.0}s with {} jobs missing", .outcome.elapsed.as_secs_f64(), .missing.len())]
    Incomplete {
        missing: Vec<JobId>,
        /// everything gathered until the deadline
        outcome: Box<SweepOutcome>,
    },
    #[error("job at position {position} has id {id}, ids must count up from 0")]
    NonContiguousIds { position: usize, id: JobId },
}

/// Everything a finished sweep hands to the analysis side
#[derive(Debug)]
pub struct SweepOutcome {
    pub jobs: Vec<Job>,
    pub buffer: ResultBuffer,
    pub elapsed: Duration,
    pub events: Vec<ProgressEvent>,
}

/// Streams jobs into a dispatcher while collecting results until every job has one
#[derive(Debug)]
pub struct Producer<D> {
    dispatcher: D,
    config: ProducerConfig,
}

struct Tracking {
    buffer: ResultBuffer,
    tracker: ProgressTracker,
    events: Vec<ProgressEvent>,
    pending: VecDeque<usize>,
    retries: Vec<u32>,
    max_retries: u32,
}

impl Tracking {
    fn absorb(&mut self, result: JobResult) {
        let id = result.id;

        if let JobStatus::Failure { ref reason } = result.status {
            let retryable = self
                .retries
                .get(id as usize)
                .is_some_and(|&attempts| attempts < self.max_retries);

            if retryable && self.buffer.slot(id).is_some_and(Slot::is_missing) {
                self.retries[id as usize] += 1;
                warn!(
                    job = id,
                    attempt = self.retries[id as usize],
                    "Job failed ({reason}), submitting it again"
                );
                self.pending.push_front(id as usize);

                return;
            }

            error!(job = id, "Job failed: {reason}");
        }

        match self.buffer.record(result) {
            Ok(Recorded::New) => {
                if let Some(event) = self.tracker.observe(self.buffer.done_count()) {
                    event.log();
                    self.events.push(event);
                }
            }
            Ok(Recorded::Overwritten) => debug!(job = id, "Received duplicate result"),
            Err(e) => warn!(job = id, "Dropping result: {e}"),
        }
    }
}

impl<D: Dispatcher> Producer<D> {
    pub fn new(dispatcher: D, config: ProducerConfig) -> Self {
        Self { dispatcher, config }
    }

    pub fn dispatcher(&self) -> &D {
        &self.dispatcher
    }

    pub fn into_dispatcher(self) -> D {
        self.dispatcher
    }

    #[instrument(skip_all, fields(jobs = jobs.len()))]
    pub fn run(&mut self, jobs: Vec<Job>) -> Result<SweepOutcome, ProducerError> {
        if let Some((position, job)) = jobs
            .iter()
            .enumerate()
            .find(|(position, job)| job.id != *position as JobId)
        {
            return Err(ProducerError::NonContiguousIds {
                position,
                id: job.id,
            });
        }

        let start = Instant::now();
        let mut state = Tracking {
            buffer: ResultBuffer::new(jobs.len()),
            tracker: ProgressTracker::new(jobs.len(), self.config.progress_step),
            events: Vec::new(),
            pending: (0..jobs.len()).collect(),
            retries: vec![0; jobs.len()],
            max_retries: self.config.max_retries,
        };

        info!("Starting sweep over {} jobs", jobs.len());

        while !state.buffer.is_complete() {
            if self
                .config
                .deadline
                .is_some_and(|deadline| start.elapsed() >= deadline)
            {
                return Err(self.give_up(jobs, state, start.elapsed()));
            }

            let mut progressed = false;

            if let Some(&next) = state.pending.front() {
                let job = &jobs[next];

                match self.dispatcher.submit(job) {
                    Ok(Submission::Submitted) => {
                        state.pending.pop_front();
                        progressed = true;
                    }
                    Ok(Submission::Deferred) => {}
                    Err(e) if !e.is_fatal() => warn!(job = job.id, "Dispatch failed, retrying later: {e}"),
                    Err(e) => {
                        error!(job = job.id, "Dispatch failed: {e}");
                        return Err(e.into());
                    }
                }
            }

            match self.dispatcher.poll() {
                Ok(Some(result)) => {
                    state.absorb(result);
                    progressed = true;
                }
                Ok(None) => {}
                Err(e) if !e.is_fatal() => warn!("Polling for results failed: {e}"),
                Err(e) => {
                    error!("Polling for results failed: {e}");
                    return Err(e.into());
                }
            }

            if !progressed {
                thread::sleep(self.config.idle_backoff);
            }
        }

        let elapsed = start.elapsed();
        info!(
            failed = state.buffer.failed().count(),
            "All {} jobs finished after {:.1} mins",
            jobs.len(),
            elapsed.as_secs_f64() / 60.0
        );

        // the results are complete, a failed stop signal must not discard them
        if let Err(e) = self.dispatcher.shutdown() {
            warn!("Failed to shut down dispatcher after a complete sweep: {e}");
        }

        Ok(SweepOutcome {
            jobs,
            buffer: state.buffer,
            elapsed,
            events: state.events,
        })
    }

    /// Deadline passed: stop workers and report what has to be resumed by hand
    fn give_up(&mut self, jobs: Vec<Job>, state: Tracking, elapsed: Duration) -> ProducerError {
        let missing = state.buffer.missing_ids();
        warn!(
            missing = missing.len(),
            "Deadline passed, jobs without results: {missing:?}"
        );

        if let Err(e) = self.dispatcher.shutdown() {
            error!("Failed to shut down dispatcher: {e}");
        }

        ProducerError::Incomplete {
            missing,
            outcome: Box::new(SweepOutcome {
                jobs,
                buffer: state.buffer,
                elapsed,
                events: state.events,
            }),
        }
    }
}

#[cfg(test)]
#[path = "producer_test.rs"]
mod producer_test;
