use crate::{
    config::WorkerConfig,
    job::{Job, JobResult, Metrics},
    process::{run_with_timeout, ProcessError},
};
use std::{
    path::{Path, PathBuf},
    process::Command,
    time::Duration,
};
use tracing::{debug, info, warn};

/// environment variable carrying the job id into the simulation
pub const JOB_ID_ENV: &str = "FANOUT_JOB_ID";
/// wall time metric added to every successful result
pub const ELAPSED_METRIC: &str = "elapsed_secs";

/// The external simulation wrapper
///
/// It receives the job as YAML on stdin and prints a YAML map of metrics on
/// stdout. Anything going wrong becomes a failed result, never an error.
#[derive(Debug, Clone)]
pub struct SimulationCommand {
    exec: PathBuf,
    params: Vec<String>,
    timeout: Duration,
}

impl SimulationCommand {
    pub fn new(exec: PathBuf, params: Vec<String>, timeout: Duration) -> Self {
        Self {
            exec,
            params,
            timeout,
        }
    }

    pub fn load(config: &WorkerConfig) -> Self {
        Self::new(
            config.exec.clone(),
            config.params.clone(),
            Duration::from_secs(config.timeout_secs),
        )
    }

    pub fn run(&self, job: &Job, cwd: Option<&Path>) -> JobResult {
        let input = match serde_yaml::to_string(job) {
            Ok(input) => input,
            Err(e) => return JobResult::failure(job.id, format!("failed to encode job: {e}")),
        };

        let mut command = Command::new(&self.exec);
        command
            .args(&self.params)
            .env(JOB_ID_ENV, job.id.to_string());
        if let Some(cwd) = cwd {
            command.current_dir(cwd);
        }

        debug!(job = job.id, "Running {}", self.exec.to_string_lossy());

        let output = match run_with_timeout(command, self.timeout, Some(input.into_bytes())) {
            Ok(output) => output,
            Err(ProcessError::Timeout { timeout, .. }) => {
                warn!(job = job.id, "Simulation timed out after {timeout:?}");
                return JobResult::failure(job.id, format!("timed out after {timeout:?}"));
            }
            Err(e) => {
                warn!(job = job.id, error = ?e, "Failed to run simulation");
                return JobResult::failure(job.id, e.to_string());
            }
        };

        if !output.success() {
            let stderr = output.stderr.trim();
            warn!(job = job.id, code = output.code(), "Simulation failed: {stderr}");

            return JobResult::failure(
                job.id,
                format!("exited with {}: {}", output.code(), stderr.lines().last().unwrap_or("")),
            );
        }

        let mut metrics = if output.stdout.trim().is_empty() {
            Metrics::new()
        } else {
            match serde_yaml::from_str::<Metrics>(&output.stdout) {
                Ok(metrics) => metrics,
                Err(e) => {
                    warn!(job = job.id, "Unparsable simulation output: {e}");
                    return JobResult::failure(job.id, format!("unparsable output: {e}"));
                }
            }
        };
        metrics.insert(ELAPSED_METRIC.to_owned(), output.elapsed.as_secs_f64());

        info!(
            job = job.id,
            "Simulation finished in {:.1}s",
            output.elapsed.as_secs_f64()
        );

        JobResult::success(job.id, metrics)
    }
}
