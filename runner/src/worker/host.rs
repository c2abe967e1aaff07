use super::{SimulationCommand, WorkerError};
use crate::{
    config::{Layout, WorkerConfig},
    job::{job_name, parse_job_name, Job, JobId, JobResult},
    transport::{self, ARCHIVE_EXTENSION, JOB_FILE},
};
use std::{
    fs::{self, File},
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
    thread,
    time::{Duration, SystemTime},
};
use tracing::{debug, error, info, instrument, warn};

/// Runs inside a host home, picks up shipped archives one at a time
///
/// The availability marker only exists while nothing is queued, so an
/// acquirer never stacks work onto a busy host.
#[derive(Debug, Clone)]
pub struct HostWorker {
    home: PathBuf,
    layout: Layout,
    command: SimulationCommand,
    poll_interval: Duration,
    unpack_timeout: Duration,
}

fn touch(path: &Path) -> Result<(), WorkerError> {
    File::create(path)
        .map(|_| ())
        .map_err(|source| WorkerError::io(path, source))
}

impl HostWorker {
    pub fn new(home: PathBuf, layout: Layout, command: SimulationCommand, poll_interval: Duration) -> Self {
        Self {
            home,
            layout,
            command,
            poll_interval,
            unpack_timeout: Duration::from_secs(600),
        }
    }

    pub fn load(home: PathBuf, layout: Layout, config: &WorkerConfig) -> Self {
        Self::new(
            home,
            layout,
            SimulationCommand::load(config),
            Duration::from_millis(config.poll_interval_ms),
        )
    }

    fn jobs_dir(&self) -> PathBuf {
        self.home.join(&self.layout.jobs_dir)
    }

    fn results_dir(&self) -> PathBuf {
        self.home.join(&self.layout.results_dir)
    }

    fn marker(&self) -> PathBuf {
        self.home.join(&self.layout.marker)
    }

    /// Create the home layout and announce the host as idle
    pub fn prepare(&self) -> Result<(), WorkerError> {
        for dir in [self.jobs_dir(), self.results_dir()] {
            fs::create_dir_all(&dir).map_err(|source| WorkerError::io(&dir, source))?;
        }

        self.announce()
    }

    /// touch the availability marker unless work is already queued
    fn announce(&self) -> Result<(), WorkerError> {
        if self.next_archive()?.is_none() {
            touch(&self.marker())?;
            debug!(home = %self.home.to_string_lossy(), "Host is idle");
        }

        Ok(())
    }

    /// oldest published archive, partial uploads are dot files and never match
    fn next_archive(&self) -> Result<Option<(JobId, PathBuf)>, WorkerError> {
        let dir = self.jobs_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(WorkerError::io(&dir, source)),
        };

        let mut oldest: Option<(SystemTime, JobId, PathBuf)> = None;
        for entry in entries {
            let entry = entry.map_err(|source| WorkerError::io(&dir, source))?;
            let name = entry.file_name().to_string_lossy().into_owned();

            if name.starts_with('.') || !name.ends_with(ARCHIVE_EXTENSION) {
                continue;
            }
            let Some(id) = parse_job_name(&name) else {
                continue;
            };
            let modified = entry
                .metadata()
                .and_then(|metadata| metadata.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);

            let older = oldest
                .as_ref()
                .map_or(true, |(time, other, _)| (modified, id) < (*time, *other));
            if older {
                oldest = Some((modified, id, entry.path()));
            }
        }

        Ok(oldest.map(|(_, id, path)| (id, path)))
    }

    /// Process at most one queued archive, returns its job id
    #[instrument(skip_all)]
    pub fn run_once(&self) -> Result<Option<JobId>, WorkerError> {
        let Some((id, archive)) = self.next_archive()? else {
            return Ok(None);
        };
        let result_dir = self.results_dir().join(job_name(id));

        if result_dir.exists() {
            warn!(job = id, "Replacing stale result directory");
            fs::remove_dir_all(&result_dir).map_err(|source| WorkerError::io(&result_dir, source))?;
        }

        let unpacked = transport::unpack(&archive, &result_dir, self.unpack_timeout);
        fs::remove_file(&archive).map_err(|source| WorkerError::io(&archive, source))?;

        let result = match unpacked {
            Ok(()) => match read_job(&result_dir) {
                Ok(job) if job.id == id => self.command.run(&job, Some(&result_dir)),
                Ok(job) => JobResult::failure(
                    id,
                    format!("archive of job {id} carries job {}", job.id),
                ),
                Err(reason) => JobResult::failure(id, reason),
            },
            Err(e) => {
                error!(job = id, "Failed to unpack archive: {e}");
                JobResult::failure(id, format!("failed to unpack archive: {e}"))
            }
        };

        self.publish(&result_dir, &result)?;
        info!(job = id, success = result.is_success(), "Finished job");

        self.announce()?;

        Ok(Some(id))
    }

    /// The result record goes first, the completion marker makes it visible to sweeps
    fn publish(&self, result_dir: &Path, result: &JobResult) -> Result<(), WorkerError> {
        fs::create_dir_all(result_dir).map_err(|source| WorkerError::io(result_dir, source))?;

        let record = result_dir.join(&self.layout.result_file);
        let file = File::create(&record).map_err(|source| WorkerError::io(&record, source))?;
        serde_yaml::to_writer(file, result)?;

        touch(&result_dir.join(&self.layout.completion_marker))
    }

    pub fn run(&self, stop: &AtomicBool) -> Result<(), WorkerError> {
        self.prepare()?;
        info!(home = %self.home.to_string_lossy(), "Watching for jobs");

        while !stop.load(Ordering::SeqCst) {
            match self.run_once() {
                Ok(Some(_)) => {}
                Ok(None) => thread::sleep(self.poll_interval),
                Err(e) => {
                    error!("Failed to process job: {e}");
                    thread::sleep(self.poll_interval);
                }
            }
        }

        Ok(())
    }
}

fn read_job(dir: &Path) -> Result<Job, String> {
    let path = dir.join(JOB_FILE);

    File::open(&path)
        .map_err(|e| format!("missing job record: {e}"))
        .and_then(|file| serde_yaml::from_reader(file).map_err(|e| format!("unreadable job record: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        hosts::LocalHost,
        job::{JobStatus, Parameters},
        transport::Transporter,
    };

    fn worker(home: &Path, script: &str) -> HostWorker {
        HostWorker::new(
            home.to_path_buf(),
            Layout::default(),
            SimulationCommand::new(
                PathBuf::from("sh"),
                vec!["-c".to_owned(), script.to_owned()],
                Duration::from_secs(10),
            ),
            Duration::from_millis(5),
        )
    }

    fn ship(home: &Path, job: &Job) {
        let staging = tempfile::tempdir().unwrap();
        let payload = staging.path().join(job.name());
        fs::create_dir_all(&payload).unwrap();
        serde_yaml::to_writer(File::create(payload.join(JOB_FILE)).unwrap(), job).unwrap();

        Transporter::new(staging.path().to_path_buf(), &Layout::default(), Duration::from_secs(30))
            .send(&LocalHost::new(home), job.id, &payload)
            .unwrap();
    }

    fn read_result(home: &Path, id: JobId) -> JobResult {
        let dir = home.join(format!("results/job-{id}"));
        assert!(dir.join("done").is_file());

        serde_yaml::from_reader(File::open(dir.join("result.yaml")).unwrap()).unwrap()
    }

    #[test]
    fn prepares_the_home_layout() {
        let home = tempfile::tempdir().unwrap();
        let worker = worker(home.path(), "true");

        worker.prepare().unwrap();

        assert!(home.path().join("jobs").is_dir());
        assert!(home.path().join("results").is_dir());
        assert!(home.path().join("ready").is_file());
        assert_eq!(worker.run_once().unwrap(), None);
    }

    #[test]
    fn runs_shipped_jobs_in_their_result_directory() {
        let home = tempfile::tempdir().unwrap();
        let worker = worker(home.path(), "cat > input.yaml; echo 'elec: 12.5'");
        worker.prepare().unwrap();
        fs::remove_file(home.path().join("ready")).unwrap();

        let job = Job::new(3, Parameters::from([("glazing".to_owned(), 1.5)]));
        ship(home.path(), &job);

        assert_eq!(worker.run_once().unwrap(), Some(3));

        let result = read_result(home.path(), 3);
        assert_eq!(result.status, JobStatus::Success);
        assert_eq!(result.metrics["elec"], 12.5);
        assert!(home.path().join("results/job-3/input.yaml").is_file());
        assert!(!home.path().join("jobs/job-3.tar.gz").exists());
        // idle again
        assert!(home.path().join("ready").is_file());
    }

    #[test]
    fn queued_work_keeps_the_marker_away() {
        let home = tempfile::tempdir().unwrap();
        let worker = worker(home.path(), "echo 'elec: 1'");
        worker.prepare().unwrap();
        fs::remove_file(home.path().join("ready")).unwrap();

        ship(home.path(), &Job::new(0, Parameters::new()));
        ship(home.path(), &Job::new(1, Parameters::new()));

        let first = worker.run_once().unwrap().unwrap();
        assert!(!home.path().join("ready").exists());

        let second = worker.run_once().unwrap().unwrap();
        assert_ne!(first, second);
        assert!(home.path().join("ready").is_file());
    }

    #[test]
    fn broken_archives_become_failed_results() {
        let home = tempfile::tempdir().unwrap();
        let worker = worker(home.path(), "echo 'elec: 1'");
        worker.prepare().unwrap();
        fs::write(home.path().join("jobs/job-8.tar.gz"), b"not an archive").unwrap();

        assert_eq!(worker.run_once().unwrap(), Some(8));

        let result = read_result(home.path(), 8);
        assert!(!result.is_success());
        assert_eq!(result.id, 8);
    }

    #[test]
    fn stops_when_asked() {
        let home = tempfile::tempdir().unwrap();
        let stop = AtomicBool::new(true);

        worker(home.path(), "true").run(&stop).unwrap();

        assert!(home.path().join("ready").is_file());
    }
}
