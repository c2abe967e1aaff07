use super::{DispatchError, Dispatcher, Submission};
use crate::{
    acquire::{AcquireError, Acquirer},
    config::RemoteConfig,
    hosts::{HostRegistry, RunningJobs},
    job::{Job, JobId, JobResult},
    sweep::{InFlight, SweepReport, Sweeper},
    transport::{PayloadBuilder, TransportError, Transporter},
};
use std::{
    collections::VecDeque,
    path::PathBuf,
    time::{Duration, Instant},
};
use tracing::{info, trace, warn};

/// Result sweeps over the hosts, at most once per interval
#[derive(Debug)]
struct Harvest {
    sweeper: Sweeper,
    in_flight: InFlight,
    result_file: String,
    interval: Duration,
    last: Option<Instant>,
    results: VecDeque<JobResult>,
}

impl Harvest {
    fn due(&self) -> bool {
        self.last
            .map_or(true, |last| last.elapsed() >= self.interval)
    }

    fn sweep(&mut self, registry: &mut HostRegistry) -> SweepReport {
        let mut report = self.sweeper.sweep_in_flight(registry, &mut self.in_flight);
        self.last = Some(Instant::now());

        for fetched in report.fetched.drain(..) {
            self.results.push_back(fetched.into_result(&self.result_file));
        }

        report
    }
}

/// Claim attempts while every host is busy, one tour per poll interval
#[derive(Debug, Default)]
struct Waiting {
    since: Option<Instant>,
    last_tour: Option<Instant>,
    tours: usize,
}

impl Waiting {
    fn tour_due(&self, poll_interval: Duration) -> bool {
        self.last_tour
            .map_or(true, |last| last.elapsed() >= poll_interval)
    }

    /// Count a tour without a claim, yields an error once per acquire timeout
    fn missed(&mut self, timeout: Duration) -> Option<AcquireError> {
        let now = Instant::now();
        let since = *self.since.get_or_insert(now);
        self.last_tour = Some(now);
        self.tours += 1;

        let waited = now.duration_since(since);
        if waited < timeout {
            return None;
        }

        let tours = self.tours;
        self.since = Some(now);
        self.tours = 0;

        Some(AcquireError::NoHostAvailable { tours, waited })
    }

    /// a sweep freed hosts, tour again without waiting for the interval
    fn wake(&mut self) {
        self.last_tour = None;
    }
}

/// Dispatches by claiming idle hosts and shipping job archives to them
///
/// `submit` never waits for a host: it makes at most one claim tour per poll
/// interval and defers the job otherwise.
#[derive(Debug)]
pub struct RemoteDispatcher {
    registry: HostRegistry,
    acquirer: Acquirer,
    builder: PayloadBuilder,
    transporter: Transporter,
    harvest: Harvest,
    waiting: Waiting,
    /// payload of a deferred job, reused until it is shipped
    staged: Option<(JobId, PathBuf)>,
}

impl RemoteDispatcher {
    pub fn new(
        registry: HostRegistry,
        acquirer: Acquirer,
        builder: PayloadBuilder,
        transporter: Transporter,
        sweeper: Sweeper,
        sweep_interval: Duration,
    ) -> Self {
        let result_file = sweeper.layout().result_file.clone();

        Self {
            registry,
            acquirer,
            builder,
            transporter,
            harvest: Harvest {
                sweeper,
                in_flight: InFlight::new(),
                result_file,
                interval: sweep_interval,
                last: None,
                results: VecDeque::new(),
            },
            waiting: Waiting::default(),
            staged: None,
        }
    }

    /// `local_results` receives the fetched result directories
    pub fn load(config: &RemoteConfig, local_results: PathBuf) -> Result<Self, TransportError> {
        let running = RunningJobs::new();

        Ok(Self::new(
            HostRegistry::load(config),
            Acquirer::load(config),
            PayloadBuilder::load(&config.staging, &config.payload)?,
            Transporter::new(
                config.staging.clone(),
                &config.layout,
                Duration::from_secs(config.transfer.command_timeout_secs),
            ),
            Sweeper::new(config.layout.clone(), local_results, running),
            Duration::from_secs(config.sweep_interval_secs),
        ))
    }

    pub fn registry(&self) -> &HostRegistry {
        &self.registry
    }

    pub fn running(&self) -> usize {
        self.harvest.sweeper.running().get()
    }

    /// jobs shipped whose results were not fetched yet
    pub fn in_flight(&self) -> &InFlight {
        &self.harvest.in_flight
    }

    fn sweep(&mut self) -> SweepReport {
        let report = self.harvest.sweep(&mut self.registry);
        if !report.released.is_empty() {
            self.waiting.wake();
        }

        report
    }

    fn stage(&mut self, job: &Job) -> Result<PathBuf, DispatchError> {
        if let Some((id, payload)) = &self.staged {
            if *id == job.id && payload.is_dir() {
                return Ok(payload.clone());
            }
        }

        let payload = self
            .builder
            .build(job)
            .map_err(|source| DispatchError::Payload { id: job.id, source })?;
        self.staged = Some((job.id, payload.clone()));

        Ok(payload)
    }
}

impl Dispatcher for RemoteDispatcher {
    fn submit(&mut self, job: &Job) -> Result<Submission, DispatchError> {
        if !self.waiting.tour_due(self.acquirer.poll_interval()) {
            return Ok(Submission::Deferred);
        }

        let payload = self.stage(job)?;

        let Some(index) = self.acquirer.try_acquire(&mut self.registry)? else {
            match self.waiting.missed(self.acquirer.timeout()) {
                Some(e) => warn!(job = job.id, running = self.running(), "{e}, still waiting"),
                None => trace!(job = job.id, "Every host is busy, deferring job"),
            }

            return Ok(Submission::Deferred);
        };
        self.waiting = Waiting::default();

        let Some(entry) = self.registry.get(index) else {
            return Ok(Submission::Deferred);
        };
        let host = entry.descriptor.address.clone();

        match self.transporter.send(entry.host.as_ref(), job.id, &payload) {
            Ok(()) => {
                self.staged = None;
                self.harvest.in_flight.insert(index, job.id);
                let running = self.harvest.sweeper.running().increment();
                info!(job = job.id, host = %host, running, "Dispatched job");

                Ok(Submission::Submitted)
            }
            Err(source) => {
                // the marker is spent, the host only becomes eligible again once it reappears
                self.registry.release(index);

                Err(DispatchError::Transport {
                    id: job.id,
                    host,
                    source,
                })
            }
        }
    }

    fn poll(&mut self) -> Result<Option<JobResult>, DispatchError> {
        if self.harvest.results.is_empty() && self.harvest.due() {
            self.sweep();
        }

        Ok(self.harvest.results.pop_front())
    }

    fn shutdown(&mut self) -> Result<(), DispatchError> {
        let running = self.sweep().running;

        if running > 0 || !self.harvest.results.is_empty() || !self.harvest.in_flight.is_empty() {
            warn!(
                running,
                in_flight = self.harvest.in_flight.len(),
                unclaimed = self.harvest.results.len(),
                "Stopping remote dispatch with work left on hosts"
            );
        } else {
            info!("Remote dispatch finished, all hosts are drained");
        }

        Ok(())
    }
}
