use crate::{
    hosts::{Credentials, HostDescriptor},
    sampling::GeneratorConfig,
};
use serde::{Deserialize, Serialize};
use std::{
    env, fs,
    fs::File,
    io::Error,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, error, warn};

/// environment override for `broker.secret`, keeps the secret out of config files
pub const SECRET_ENV: &str = "FANOUT_SECRET";

/// Locate the program a worker runs, the way the spawn will find it
///
/// A path with a directory part has to be an executable file itself, a bare
/// name is looked up in every `PATH` entry.
pub fn resolve_executable(exec: &Path) -> Result<PathBuf, ConfigErrors> {
    if exec.components().count() > 1 {
        return match fs::metadata(exec) {
            Ok(metadata) if metadata.is_file() && metadata.permissions().mode() & 0o111 != 0 => {
                Ok(exec.to_path_buf())
            }
            Ok(_) => Err(ConfigErrors::NotExecutable(exec.to_path_buf())),
            Err(source) => Err(ConfigErrors::Inspect {
                path: exec.to_path_buf(),
                source,
            }),
        };
    }

    env::var_os("PATH")
        .iter()
        .flat_map(env::split_paths)
        .map(|dir| dir.join(exec))
        .find(|candidate| {
            fs::metadata(candidate)
                .is_ok_and(|metadata| metadata.is_file() && metadata.permissions().mode() & 0o111 != 0)
        })
        .ok_or_else(|| ConfigErrors::NotOnPath(exec.to_path_buf()))
}

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Failed to read config {path:?}: {source}")]
    Read { path: PathBuf, source: Error },
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("{} is not an executable file", .0.display())]
    NotExecutable(PathBuf),
    #[error("{} was not found on PATH", .0.display())]
    NotOnPath(PathBuf),
    #[error("Failed to inspect {}: {source}", .path.display())]
    Inspect { path: PathBuf, source: Error },
    #[error("The `{0}` section is required for this command")]
    MissingSection(&'static str),
}

/// Which parts of the config a command relies on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Broker,
    Produce,
    Distribute,
    Worker,
    HostWorker,
    Sweep,
    Jobs,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub campaign: CampaignConfig,
    pub generator: GeneratorConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    pub worker: Option<WorkerConfig>,
    pub remote: Option<RemoteConfig>,
    #[serde(alias = "db")]
    pub database: Option<DatabaseConfig>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct CampaignConfig {
    pub name: String,
    #[serde(default)]
    pub comment: Option<String>,
    // directory receiving the result matrix and fetched remote output
    #[serde(default = "default_output")]
    pub output: PathBuf,
    // metric columns of the result matrix
    pub metrics: Vec<String>,
    // percent between two progress log lines
    #[serde(default = "default_progress_step")]
    pub progress_step: u32,
    #[serde(default)]
    pub max_retries: u32,
    pub deadline_secs: Option<u64>,
    #[serde(default = "default_idle_backoff_ms")]
    pub idle_backoff_ms: u64,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct BrokerConfig {
    #[serde(default = "default_broker_address")]
    pub address: String,
    #[serde(default)]
    pub secret: String,
    // 0 for unbounded queues
    #[serde(default)]
    pub capacity: usize,
    #[serde(default = "default_kill_markers")]
    pub kill_markers: usize,
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            address: default_broker_address(),
            secret: String::new(),
            capacity: 0,
            kill_markers: default_kill_markers(),
            grace_period_secs: default_grace_period_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct WorkerConfig {
    // simulation wrapper, receives the job as YAML on stdin and prints metrics as YAML
    pub exec: PathBuf,
    #[serde(default)]
    pub params: Vec<String>,
    #[serde(default = "default_worker_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Ssh,
    /// addresses are home directories on a shared filesystem
    Local,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct HostConfig {
    pub address: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
    #[serde(default)]
    pub port: Option<u16>,
}

impl HostConfig {
    pub fn descriptor(&self) -> HostDescriptor {
        HostDescriptor::new(
            self.address.clone(),
            Credentials {
                user: self.user.clone(),
                identity_file: self.identity_file.clone(),
                port: self.port,
            },
        )
    }
}

/// Well-known paths inside a host's home directory
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Layout {
    #[serde(default = "default_jobs_dir")]
    pub jobs_dir: String,
    #[serde(default = "default_results_dir")]
    pub results_dir: String,
    // zero-byte file, present while the host is idle
    #[serde(default = "default_marker")]
    pub marker: String,
    // written into a result directory once the simulation finished
    #[serde(default = "default_completion_marker")]
    pub completion_marker: String,
    #[serde(default = "default_result_file")]
    pub result_file: String,
}

impl Default for Layout {
    fn default() -> Self {
        Self {
            jobs_dir: default_jobs_dir(),
            results_dir: default_results_dir(),
            marker: default_marker(),
            completion_marker: default_completion_marker(),
            result_file: default_result_file(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct AcquireConfig {
    #[serde(default = "default_acquire_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_acquire_poll_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_true")]
    pub ping: bool,
    #[serde(default = "default_ping_count")]
    pub ping_count: u32,
}

impl Default for AcquireConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_acquire_timeout_secs(),
            poll_interval_secs: default_acquire_poll_secs(),
            ping: true,
            ping_count: default_ping_count(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct TransferConfig {
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            command_timeout_secs: default_command_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct PayloadConfig {
    // directory whose files are shipped with every job (model, weather data, schedules)
    pub template: Option<PathBuf>,
    #[serde(default = "default_include")]
    pub include: Vec<String>,
}

impl Default for PayloadConfig {
    fn default() -> Self {
        Self {
            template: None,
            include: default_include(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct RemoteConfig {
    pub hosts: Vec<HostConfig>,
    #[serde(default)]
    pub backend: Backend,
    #[serde(default)]
    pub layout: Layout,
    #[serde(default)]
    pub acquire: AcquireConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_staging")]
    pub staging: PathBuf,
    #[serde(default)]
    pub payload: PayloadConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
}

impl Config {
    /// Read a YAML config, `FANOUT_SECRET` overrides the broker secret
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        let file = File::open(path).map_err(|source| ConfigErrors::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Config = serde_yaml::from_reader(file)?;

        if let Ok(secret) = env::var(SECRET_ENV) {
            debug!("Using broker secret from {SECRET_ENV}");
            config.broker.secret = secret;
        }

        Ok(config)
    }

    pub fn worker(&self) -> Result<&WorkerConfig, ConfigErrors> {
        self.worker
            .as_ref()
            .ok_or(ConfigErrors::MissingSection("worker"))
    }

    pub fn remote(&self) -> Result<&RemoteConfig, ConfigErrors> {
        self.remote
            .as_ref()
            .ok_or(ConfigErrors::MissingSection("remote"))
    }

    /// local copies of swept remote result directories
    pub fn fetched_dir(&self) -> PathBuf {
        self.campaign.output.join("fetched")
    }

    /// Validate everything the given command relies on
    ///
    /// Returns `true` if any error was found; every problem is logged instead of
    /// stopping at the first one to make fixing a config less tedious.
    pub fn preflight_checks(&self, scope: Scope) -> bool {
        let mut contains_error = false;

        let needs_campaign = matches!(scope, Scope::Produce | Scope::Distribute | Scope::Jobs);
        let needs_broker = matches!(scope, Scope::Broker | Scope::Produce | Scope::Worker);
        let needs_worker = matches!(scope, Scope::Worker | Scope::HostWorker);
        let needs_remote = matches!(scope, Scope::Distribute | Scope::Sweep);

        if needs_campaign {
            if self.campaign.metrics.is_empty() {
                error!("campaign.metrics is empty, the result matrix would have no columns");
                contains_error = true;
            }

            if self.campaign.progress_step == 0 || self.campaign.progress_step > 100 {
                error!(
                    "campaign.progress_step ({}) must be between 1 and 100",
                    self.campaign.progress_step
                );
                contains_error = true;
            }

            if let Err(e) = self.generator.validate() {
                error!("generator is invalid: {e}");
                contains_error = true;
            }
        }

        if needs_broker {
            if self.broker.secret.is_empty() {
                error!("broker.secret is empty, set it in the config or via {SECRET_ENV}");
                contains_error = true;
            }

            if self.broker.connect_timeout_secs == 0 {
                error!("broker.connect_timeout_secs cannot be 0");
                contains_error = true;
            }
        }

        if needs_worker {
            match self.worker {
                None => {
                    error!("No worker section was defined, unable to run simulations");
                    contains_error = true;
                }
                Some(ref worker) => {
                    if worker.timeout_secs == 0 {
                        error!("worker.timeout_secs cannot be 0");
                        contains_error = true;
                    }

                    match resolve_executable(&worker.exec) {
                        Ok(program) => debug!("worker.exec resolves to {}", program.to_string_lossy()),
                        Err(e) => {
                            error!("worker.exec is unusable: {e}");
                            contains_error = true;
                        }
                    }
                }
            }
        }

        if needs_remote {
            match self.remote {
                None => {
                    error!("No remote section was defined, unable to dispatch to hosts");
                    contains_error = true;
                }
                Some(ref remote) => {
                    if remote.hosts.is_empty() {
                        error!("remote.hosts is empty, there is nothing to acquire");
                        contains_error = true;
                    }

                    if remote.acquire.poll_interval_secs == 0 {
                        error!("remote.acquire.poll_interval_secs cannot be 0");
                        contains_error = true;
                    } else if remote.acquire.timeout_secs < remote.acquire.poll_interval_secs {
                        warn!(
                            "remote.acquire.timeout_secs is shorter than one poll interval, every acquisition is a single tour"
                        );
                    }

                    if remote.transfer.command_timeout_secs == 0 {
                        error!("remote.transfer.command_timeout_secs cannot be 0");
                        contains_error = true;
                    }

                    for (name, value) in [
                        ("jobs_dir", &remote.layout.jobs_dir),
                        ("results_dir", &remote.layout.results_dir),
                        ("marker", &remote.layout.marker),
                        ("completion_marker", &remote.layout.completion_marker),
                        ("result_file", &remote.layout.result_file),
                    ] {
                        if value.is_empty() || value.starts_with('/') || value.contains("..") {
                            error!("remote.layout.{name} ({value}) must be a relative path inside the host home");
                            contains_error = true;
                        }
                    }

                    if let Some(ref template) = remote.payload.template {
                        if !template.is_dir() {
                            error!(
                                "remote.payload.template ({}) is not a directory",
                                template.to_string_lossy()
                            );
                            contains_error = true;
                        }
                    }

                    if remote.backend == Backend::Local {
                        for host in remote.hosts.iter() {
                            if !Path::new(&host.address).is_dir() {
                                warn!(
                                    "Host home {} does not exist yet, it will count as unreachable",
                                    host.address
                                );
                            }
                        }
                    }
                }
            }
        }

        contains_error
    }
}

fn default_output() -> PathBuf {
    PathBuf::from("fanout-output")
}

fn default_progress_step() -> u32 {
    5
}

fn default_idle_backoff_ms() -> u64 {
    10
}

fn default_broker_address() -> String {
    "127.0.0.1:50000".to_owned()
}

fn default_kill_markers() -> usize {
    10
}

fn default_grace_period_secs() -> u64 {
    5
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_worker_timeout_secs() -> u64 {
    3600
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_jobs_dir() -> String {
    "jobs".to_owned()
}

fn default_results_dir() -> String {
    "results".to_owned()
}

fn default_marker() -> String {
    "ready".to_owned()
}

fn default_completion_marker() -> String {
    "done".to_owned()
}

fn default_result_file() -> String {
    "result.yaml".to_owned()
}

fn default_acquire_timeout_secs() -> u64 {
    3600
}

fn default_acquire_poll_secs() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_ping_count() -> u32 {
    4
}

fn default_command_timeout_secs() -> u64 {
    600
}

fn default_sweep_interval_secs() -> u64 {
    30
}

fn default_staging() -> PathBuf {
    env::temp_dir().join("fanout-staging")
}

fn default_include() -> Vec<String> {
    vec!["**/*".to_owned()]
}

fn default_database_path() -> PathBuf {
    PathBuf::from("fanout.db")
}
