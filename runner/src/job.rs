use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Identity of a job inside one sweep, assigned once by the producer
pub type JobId = u64;
/// ordered parameter vector name -> value
pub type Parameters = BTreeMap<String, f64>;
/// named metrics extracted from a finished simulation
pub type Metrics = BTreeMap<String, f64>;

const JOB_PREFIX: &str = "job-";

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct Job {
    pub id: JobId,
    #[serde(default)]
    pub parameters: Parameters,
}

impl Job {
    pub fn new(id: JobId, parameters: Parameters) -> Self {
        Self { id, parameters }
    }

    /// directory/archive stem used for this job on every host
    pub fn name(&self) -> String {
        job_name(self.id)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum JobStatus {
    Success,
    Failure { reason: String },
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct JobResult {
    pub id: JobId,
    #[serde(default)]
    pub metrics: Metrics,
    pub status: JobStatus,
}

impl JobResult {
    pub fn success(id: JobId, metrics: Metrics) -> Self {
        Self {
            id,
            metrics,
            status: JobStatus::Success,
        }
    }

    pub fn failure(id: JobId, reason: impl Into<String>) -> Self {
        Self {
            id,
            metrics: Metrics::new(),
            status: JobStatus::Failure {
                reason: reason.into(),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, JobStatus::Success)
    }
}

/// Records travelling over the job queue
///
/// `Kill` is the only cancellation primitive: a worker that takes it stops polling.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum JobMessage {
    Run(Job),
    Kill,
}

pub fn job_name(id: JobId) -> String {
    format!("{JOB_PREFIX}{id}")
}

/// Recover the job id from `job-<id>` or `job-<id>.<extension>`
pub fn parse_job_name(name: &str) -> Option<JobId> {
    name.strip_prefix(JOB_PREFIX)?
        .split('.')
        .next()
        .and_then(|id| id.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_names_round_trip() {
        assert_eq!(job_name(7), "job-7");
        assert_eq!(parse_job_name("job-7"), Some(7));
        assert_eq!(parse_job_name("job-12.tar.gz"), Some(12));
        assert_eq!(parse_job_name("job-x"), None);
        assert_eq!(parse_job_name("results"), None);
    }

    #[test]
    fn kill_marker_is_distinguishable_from_jobs() {
        let kill = serde_json::to_value(&JobMessage::Kill).unwrap();
        assert_eq!(kill, serde_json::json!({ "type": "kill" }));

        let run = JobMessage::Run(Job::new(3, Parameters::from([("x".to_owned(), 1.5)])));
        let value = serde_json::to_value(&run).unwrap();
        assert_eq!(value["type"], "run");
        assert_eq!(value["id"], 3);
        assert_eq!(serde_json::from_value::<JobMessage>(value).unwrap(), run);
    }

    #[test]
    fn results_read_from_yaml() {
        let result: JobResult = serde_yaml::from_str(
            "id: 4\nmetrics:\n  elec: 12.5\nstatus:\n  state: success\n",
        )
        .unwrap();
        assert_eq!(result.id, 4);
        assert!(result.is_success());
        assert_eq!(result.metrics["elec"], 12.5);

        let failed: JobResult =
            serde_yaml::from_str("id: 1\nstatus:\n  state: failure\n  reason: crashed\n").unwrap();
        assert_eq!(
            failed.status,
            JobStatus::Failure {
                reason: "crashed".to_owned()
            }
        );
    }
}
