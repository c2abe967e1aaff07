//! Wiring of configuration to the engine, one entry point per command
use crate::{
    config::{Config, ConfigErrors},
    database::StoreError,
    dispatch::{Dispatcher, QueueDispatcher, RemoteDispatcher},
    hosts::{HostRegistry, RunningJobs},
    job::Job,
    producer::{Producer, ProducerConfig, ProducerError, SweepOutcome},
    queue::{broker::Broker, client::RemoteQueues, QueueError},
    report::write_matrix,
    sampling::SamplingError,
    sweep::{SweepReport, Sweeper},
    transport::TransportError,
    worker::{HostWorker, QueueWorker, WorkerError},
};
use std::{
    path::{Path, PathBuf},
    sync::atomic::AtomicBool,
    time::Duration,
};
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Error, Debug)]
pub enum CampaignError {
    #[error(transparent)]
    Config(#[from] ConfigErrors),
    #[error(transparent)]
    Sampling(#[from] SamplingError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Producer(#[from] ProducerError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Worker(#[from] WorkerError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to write results to {path:?}: {source}")]
    Output {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn connect(config: &Config) -> Result<RemoteQueues, QueueError> {
    info!("Connecting to broker at {}", config.broker.address);

    RemoteQueues::connect(
        &config.broker.address,
        &config.broker.secret,
        Duration::from_secs(config.broker.connect_timeout_secs),
    )
}

/// Serve the job and result queues until the process is stopped
pub fn serve_broker(config: &Config) -> Result<(), CampaignError> {
    let handle = Broker::new(&config.broker.secret, config.broker.capacity)
        .bind(config.broker.address.as_str())?;

    handle.join();

    Ok(())
}

pub fn generate_jobs(config: &Config) -> Result<Vec<Job>, CampaignError> {
    let jobs = config.generator.generate()?;
    info!("Generated {} jobs", jobs.len());

    Ok(jobs)
}

/// Sweep through the shared queues, workers are started separately
pub fn produce(config: &Config) -> Result<SweepOutcome, CampaignError> {
    let jobs = generate_jobs(config)?;
    let dispatcher = QueueDispatcher::load(connect(config)?, &config.broker);

    run_sweep(config, dispatcher, jobs)
}

/// Sweep by claiming remote hosts directly
pub fn distribute(config: &Config) -> Result<SweepOutcome, CampaignError> {
    let remote = config.remote()?;
    let jobs = generate_jobs(config)?;
    let dispatcher = RemoteDispatcher::load(remote, config.fetched_dir())?;

    run_sweep(config, dispatcher, jobs)
}

/// Run the producer, persisting whatever was gathered even when stopped early
pub fn run_sweep<D: Dispatcher>(
    config: &Config,
    dispatcher: D,
    jobs: Vec<Job>,
) -> Result<SweepOutcome, CampaignError> {
    let mut producer = Producer::new(dispatcher, ProducerConfig::load(&config.campaign));

    match producer.run(jobs) {
        Ok(outcome) => {
            persist(config, &outcome)?;
            Ok(outcome)
        }
        Err(ProducerError::Incomplete { missing, outcome }) => {
            if let Err(e) = persist(config, &outcome) {
                error!("Failed to persist partial results: {e}");
            }

            Err(ProducerError::Incomplete { missing, outcome }.into())
        }
        Err(e) => Err(e.into()),
    }
}

/// Write the result matrix and, if configured, store the sweep in the database
pub fn persist(config: &Config, outcome: &SweepOutcome) -> Result<PathBuf, CampaignError> {
    let output = &config.campaign.output;
    let path = write_matrix(output, &outcome.jobs, &outcome.buffer, &config.campaign.metrics)
        .map_err(|source| CampaignError::Output {
            path: output.clone(),
            source,
        })?;

    if let Some(ref database) = config.database {
        store(config, database, outcome)?;
    }

    Ok(path)
}

#[cfg(feature = "rusqlite")]
fn store(
    config: &Config,
    database: &crate::config::DatabaseConfig,
    outcome: &SweepOutcome,
) -> Result<(), CampaignError> {
    let mut store = crate::database::ResultStore::load(database)?;
    store.init()?;

    let campaign = store.new_campaign(&config.campaign.name, config.campaign.comment.as_deref())?;
    store.store_outcome(campaign, &outcome.jobs, &outcome.buffer)?;
    store.close()?;

    Ok(())
}

#[cfg(not(feature = "rusqlite"))]
fn store(
    _config: &Config,
    _database: &crate::config::DatabaseConfig,
    _outcome: &SweepOutcome,
) -> Result<(), CampaignError> {
    Err(StoreError::Unsupported.into())
}

/// Run queued jobs until a kill marker arrives, returns how many ran
pub fn run_worker(config: &Config) -> Result<usize, CampaignError> {
    let worker = config.worker()?;
    let mut worker = QueueWorker::load(connect(config)?, worker);

    Ok(worker.run()?)
}

pub fn run_host_worker(config: &Config, home: &Path, stop: &AtomicBool) -> Result<(), CampaignError> {
    let worker = config.worker()?;
    let layout = config
        .remote
        .as_ref()
        .map(|remote| remote.layout.clone())
        .unwrap_or_default();

    HostWorker::load(home.to_path_buf(), layout, worker).run(stop)?;

    Ok(())
}

/// One-off sweep over all hosts, e.g. to collect output after a crashed producer
pub fn sweep_hosts(config: &Config) -> Result<SweepReport, CampaignError> {
    let remote = config.remote()?;
    let mut registry = HostRegistry::load(remote);
    let sweeper = Sweeper::new(remote.layout.clone(), config.fetched_dir(), RunningJobs::new());

    let report = sweeper.sweep(&mut registry);
    if !report.errors.is_empty() {
        warn!(errors = report.errors.len(), "Some hosts could not be swept");
    }

    Ok(report)
}
