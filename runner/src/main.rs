use clap::{Parser, Subcommand};
use fanout_runner::{
    campaign::{self, CampaignError},
    config::{Config, Scope},
    job::job_name,
    producer::SweepOutcome,
};
use std::{
    path::PathBuf,
    process::ExitCode,
    sync::atomic::AtomicBool,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "fanout")]
#[command(version, about = "Distributes parameter sweeps over workers and remote hosts")]
struct Args {
    /// Campaign configuration
    #[arg(long, short = 'c', default_value = "fanout.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve the shared job and result queues
    Broker,

    /// Run the sweep through the broker, workers connect on their own
    Produce,

    /// Run the sweep by claiming idle remote hosts
    Distribute,

    /// Execute jobs from the broker until a kill marker arrives
    Worker,

    /// Execute jobs shipped into a host home directory
    HostWorker {
        #[arg(long)]
        home: PathBuf,
    },

    /// Collect finished results from all hosts once
    Sweep,

    /// Print the generated jobs without running them
    Jobs,
}

impl Commands {
    fn scope(&self) -> Scope {
        match self {
            Commands::Broker => Scope::Broker,
            Commands::Produce => Scope::Produce,
            Commands::Distribute => Scope::Distribute,
            Commands::Worker => Scope::Worker,
            Commands::HostWorker { .. } => Scope::HostWorker,
            Commands::Sweep => Scope::Sweep,
            Commands::Jobs => Scope::Jobs,
        }
    }
}

fn summarize(outcome: &SweepOutcome) {
    let failed = outcome.buffer.failed().map(|(id, _)| id).collect::<Vec<_>>();

    info!(
        jobs = outcome.jobs.len(),
        failed = failed.len(),
        "Sweep finished after {:.1} mins",
        outcome.elapsed.as_secs_f64() / 60.0
    );
    if !failed.is_empty() {
        info!("Failed jobs: {failed:?}");
    }
}

fn run(args: Args, config: Config) -> Result<(), CampaignError> {
    match args.command {
        Commands::Broker => campaign::serve_broker(&config),
        Commands::Produce => campaign::produce(&config).map(|outcome| summarize(&outcome)),
        Commands::Distribute => campaign::distribute(&config).map(|outcome| summarize(&outcome)),
        Commands::Worker => campaign::run_worker(&config).map(|ran| info!("Worker ran {ran} jobs")),
        Commands::HostWorker { home } => {
            // runs until the process is killed
            let stop = AtomicBool::new(false);
            campaign::run_host_worker(&config, &home, &stop)
        }
        Commands::Sweep => {
            let report = campaign::sweep_hosts(&config)?;
            for fetched in report.fetched.iter() {
                println!("{}\t{}\t{}", job_name(fetched.id), fetched.host, fetched.dir.to_string_lossy());
            }
            println!("running: {}", report.running);

            Ok(())
        }
        Commands::Jobs => {
            for job in campaign::generate_jobs(&config)? {
                let parameters = job
                    .parameters
                    .iter()
                    .map(|(name, value)| format!("{name}={value}"))
                    .collect::<Vec<_>>()
                    .join(" ");
                println!("{}\t{parameters}", job.id);
            }

            Ok(())
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    if config.preflight_checks(args.command.scope()) {
        error!("Preflight checks failed, see above");
        return ExitCode::FAILURE;
    }

    match run(args, config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
