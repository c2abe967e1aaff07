use crate::{
    config::Layout,
    hosts::{HostError, HostIndex, HostRegistry, RemoteHost, RunningJobs},
    job::{parse_job_name, JobId, JobResult},
};
use rayon::prelude::*;
use std::{
    collections::{BTreeSet, HashMap},
    fs::File,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

/// reason recorded for fetched directories without a readable result
pub const MISSING_RECORD: &str = "missing result record";

/// prefix of finished result directories this run never shipped, hidden from listings
pub const SET_ASIDE_PREFIX: &str = ".stale-";

#[derive(Error, Debug)]
pub enum SweepError {
    #[error("failed to list {dir} on {host}: {source}")]
    List {
        host: String,
        dir: String,
        #[source]
        source: HostError,
    },
    #[error("failed to fetch {entry} from {host}: {source}")]
    Fetch {
        host: String,
        entry: String,
        #[source]
        source: HostError,
    },
}

/// A finished result directory, copied to the local results dir
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedResult {
    pub host: String,
    pub id: JobId,
    pub dir: PathBuf,
}

impl FetchedResult {
    /// Extract the job result; directories without a parsable record become failures
    pub fn into_result(self, result_file: &str) -> JobResult {
        read_fetched_result(&self.dir, result_file, self.id)
    }
}

pub fn read_fetched_result(dir: &Path, result_file: &str, id: JobId) -> JobResult {
    let path = dir.join(result_file);

    let record = File::open(&path)
        .map_err(|e| e.to_string())
        .and_then(|file| serde_yaml::from_reader::<_, JobResult>(file).map_err(|e| e.to_string()));

    match record {
        Ok(mut result) => {
            if result.id != id {
                warn!(
                    job = id,
                    recorded = result.id,
                    "Result record disagrees with its directory, trusting the directory"
                );
                result.id = id;
            }

            result
        }
        Err(e) => {
            warn!(job = id, "Failed to read {}: {e}", path.to_string_lossy());

            JobResult::failure(id, MISSING_RECORD)
        }
    }
}

/// Jobs shipped to each host whose results have not been fetched yet
#[derive(Debug, Default, Clone)]
pub struct InFlight {
    jobs: HashMap<HostIndex, BTreeSet<JobId>>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, host: HostIndex, id: JobId) {
        self.jobs.entry(host).or_default().insert(id);
    }

    /// `false` if the job wasn't in flight on that host
    pub fn remove(&mut self, host: HostIndex, id: JobId) -> bool {
        let Some(ids) = self.jobs.get_mut(&host) else {
            return false;
        };
        let removed = ids.remove(&id);
        if ids.is_empty() {
            self.jobs.remove(&host);
        }

        removed
    }

    pub fn expects(&self, host: HostIndex, id: JobId) -> bool {
        self.jobs.get(&host).is_some_and(|ids| ids.contains(&id))
    }

    pub fn len(&self) -> usize {
        self.jobs.values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct SweepReport {
    /// jobs still queued or executing, summed over all hosts
    pub running: usize,
    pub fetched: Vec<FetchedResult>,
    pub errors: Vec<SweepError>,
    /// hosts that became eligible for claiming again
    pub released: Vec<HostIndex>,
    /// finished directories of jobs that were never shipped by this sweeper's owner
    pub set_aside: usize,
}

#[derive(Debug)]
struct HostSweep {
    index: HostIndex,
    running: usize,
    fetched: Vec<FetchedResult>,
    errors: Vec<SweepError>,
    set_aside: usize,
}

/// Collects finished output from every host and tracks what is still running
#[derive(Debug, Clone)]
pub struct Sweeper {
    layout: Layout,
    local_results: PathBuf,
    running: RunningJobs,
}

impl Sweeper {
    pub fn new(layout: Layout, local_results: PathBuf, running: RunningJobs) -> Self {
        Self {
            layout,
            local_results,
            running,
        }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn running(&self) -> &RunningJobs {
        &self.running
    }

    /// Fetch every finished result directory, whoever shipped the job
    pub fn sweep(&self, registry: &mut HostRegistry) -> SweepReport {
        self.sweep_hosts(registry, None)
    }

    /// Fetch only the jobs in `in_flight` and credit them to the running counter
    ///
    /// Finished directories of other jobs are renamed out of the way, unfinished
    /// ones are left alone. Neither counts as running.
    pub fn sweep_in_flight(&self, registry: &mut HostRegistry, in_flight: &mut InFlight) -> SweepReport {
        self.sweep_hosts(registry, Some(in_flight))
    }

    #[instrument(skip_all, fields(tracked = in_flight.is_some()))]
    fn sweep_hosts(&self, registry: &mut HostRegistry, mut in_flight: Option<&mut InFlight>) -> SweepReport {
        let expected = in_flight.as_deref();
        let sweeps = registry
            .entries()
            .par_iter()
            .enumerate()
            .map(|(index, entry)| self.sweep_host(index, entry.host.as_ref(), expected))
            .collect::<Vec<_>>();

        let mut report = SweepReport::default();
        for sweep in sweeps {
            report.running += sweep.running;
            report.set_aside += sweep.set_aside;

            if let Some(in_flight) = in_flight.as_deref_mut() {
                for fetched in sweep.fetched.iter() {
                    if in_flight.remove(sweep.index, fetched.id) {
                        self.running.decrement();
                    }
                }
            }

            // a host we couldn't fully inspect might still be busy
            let idle = sweep.running == 0 && sweep.errors.is_empty();
            if idle && registry.get(sweep.index).is_some_and(|entry| entry.descriptor.claimed) {
                registry.release(sweep.index);
                report.released.push(sweep.index);
            }

            report.fetched.extend(sweep.fetched);
            report.errors.extend(sweep.errors);
        }

        for e in report.errors.iter() {
            error!("Sweep error: {e}");
        }

        info!(
            running = report.running,
            fetched = report.fetched.len(),
            released = report.released.len(),
            set_aside = report.set_aside,
            counter = self.running.get(),
            "Swept hosts"
        );

        report
    }

    fn sweep_host(&self, index: HostIndex, host: &dyn RemoteHost, expected: Option<&InFlight>) -> HostSweep {
        let mut sweep = HostSweep {
            index,
            running: 0,
            fetched: Vec::new(),
            errors: Vec::new(),
            set_aside: 0,
        };
        let list_error = |dir: &str, source| SweepError::List {
            host: host.address().to_owned(),
            dir: dir.to_owned(),
            source,
        };

        match host.list_dir(&self.layout.jobs_dir) {
            Ok(queued) => sweep.running += queued.len(),
            Err(source) => sweep.errors.push(list_error(&self.layout.jobs_dir, source)),
        }

        let entries = match host.list_dir(&self.layout.results_dir) {
            Ok(entries) => entries,
            Err(source) => {
                sweep.errors.push(list_error(&self.layout.results_dir, source));
                return sweep;
            }
        };

        for entry in entries {
            let Some(id) = parse_job_name(&entry) else {
                warn!(host = %host.address(), "Ignoring foreign result entry {entry}");
                continue;
            };

            if expected.is_some_and(|in_flight| !in_flight.expects(index, id)) {
                match self.set_aside(host, &entry) {
                    Ok(true) => sweep.set_aside += 1,
                    Ok(false) => debug!(host = %host.address(), job = id, "Skipping unfinished result of a job we never shipped"),
                    Err(e) => warn!(host = %host.address(), job = id, error = ?e, "Failed to set aside a stale result"),
                }
                continue;
            }

            match self.fetch(host, &entry, id) {
                Ok(Some(fetched)) => sweep.fetched.push(fetched),
                Ok(None) => sweep.running += 1,
                Err(source) => {
                    sweep.running += 1;
                    sweep.errors.push(SweepError::Fetch {
                        host: host.address().to_owned(),
                        entry,
                        source,
                    });
                }
            }
        }

        debug!(host = %host.address(), running = sweep.running, fetched = sweep.fetched.len(), "Swept host");

        sweep
    }

    /// `None` while the result directory has no completion marker
    fn fetch(
        &self,
        host: &dyn RemoteHost,
        entry: &str,
        id: JobId,
    ) -> Result<Option<FetchedResult>, HostError> {
        let remote = format!("{}/{entry}", self.layout.results_dir);

        if !host.exists(&format!("{remote}/{}", self.layout.completion_marker))? {
            return Ok(None);
        }

        let local = self.local_results.join(entry);
        host.download_dir(&remote, &local)?;
        host.remove_all(&remote)?;

        debug!(host = %host.address(), job = id, "Fetched result");

        Ok(Some(FetchedResult {
            host: host.address().to_owned(),
            id,
            dir: local,
        }))
    }

    /// Hide a finished directory nobody here is waiting for, `false` if it isn't finished
    fn set_aside(&self, host: &dyn RemoteHost, entry: &str) -> Result<bool, HostError> {
        let remote = format!("{}/{entry}", self.layout.results_dir);

        if !host.exists(&format!("{remote}/{}", self.layout.completion_marker))? {
            return Ok(false);
        }

        let aside = format!("{}/{SET_ASIDE_PREFIX}{entry}", self.layout.results_dir);
        host.remove_all(&aside)?;
        host.rename(&remote, &aside)?;

        warn!(host = %host.address(), "Set aside {remote}, it was not shipped by this run");

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hosts::{Credentials, HostDescriptor, LocalHost};
    use crate::job::{JobStatus, Metrics};
    use std::fs;

    fn register(registry: &mut HostRegistry, home: &Path) -> HostIndex {
        registry.register(
            HostDescriptor::new(home.to_string_lossy(), Credentials::default()),
            Box::new(LocalHost::new(home)),
        )
    }

    fn finished(home: &Path, id: JobId, elec: f64) {
        let dir = home.join(format!("results/job-{id}"));
        fs::create_dir_all(&dir).unwrap();
        let result = JobResult::success(id, Metrics::from([("elec".to_owned(), elec)]));
        fs::write(dir.join("result.yaml"), serde_yaml::to_string(&result).unwrap()).unwrap();
        fs::write(dir.join("done"), b"").unwrap();
    }

    #[test]
    fn fetches_only_completed_directories() {
        let busy = tempfile::tempdir().unwrap();
        let idle = tempfile::tempdir().unwrap();
        let local = tempfile::tempdir().unwrap();

        finished(busy.path(), 0, 42.0);
        fs::create_dir_all(busy.path().join("results/job-1")).unwrap();

        let mut registry = HostRegistry::new();
        let busy_index = register(&mut registry, busy.path());
        let idle_index = register(&mut registry, idle.path());
        registry.mark_claimed(busy_index);
        registry.mark_claimed(idle_index);

        let running = RunningJobs::new();
        let mut in_flight = InFlight::new();
        for id in [0, 1] {
            running.increment();
            in_flight.insert(busy_index, id);
        }

        let sweeper = Sweeper::new(Layout::default(), local.path().to_path_buf(), running.clone());
        let report = sweeper.sweep_in_flight(&mut registry, &mut in_flight);

        assert_eq!(report.running, 1);
        assert_eq!(running.get(), 1);
        assert!(!in_flight.expects(busy_index, 0));
        assert!(in_flight.expects(busy_index, 1));
        assert!(report.errors.is_empty());
        assert_eq!(
            report.fetched,
            vec![FetchedResult {
                host: busy.path().to_string_lossy().into_owned(),
                id: 0,
                dir: local.path().join("job-0"),
            }]
        );
        assert!(!busy.path().join("results/job-0").exists());
        assert!(busy.path().join("results/job-1").exists());

        // only the host without running work is released
        assert_eq!(report.released, vec![idle_index]);
        assert!(registry.get(busy_index).unwrap().descriptor.claimed);

        let result = report.fetched[0].clone().into_result("result.yaml");
        assert_eq!(result.status, JobStatus::Success);
        assert_eq!(result.metrics["elec"], 42.0);
    }

    #[test]
    fn queued_archives_count_as_running() {
        let home = tempfile::tempdir().unwrap();
        let local = tempfile::tempdir().unwrap();
        fs::create_dir_all(home.path().join("jobs")).unwrap();
        fs::write(home.path().join("jobs/job-5.tar.gz"), b"").unwrap();
        fs::write(home.path().join("jobs/.job-6.tar.gz.part"), b"").unwrap();

        let mut registry = HostRegistry::new();
        let index = register(&mut registry, home.path());
        registry.mark_claimed(index);

        let report = Sweeper::new(Layout::default(), local.path().to_path_buf(), RunningJobs::new())
            .sweep(&mut registry);

        assert_eq!(report.running, 1);
        assert!(report.released.is_empty());
    }

    #[test]
    fn results_of_jobs_never_shipped_are_set_aside() {
        let home = tempfile::tempdir().unwrap();
        let local = tempfile::tempdir().unwrap();
        finished(home.path(), 0, 999.0);
        finished(home.path(), 1, 11.0);
        // left over and unfinished, e.g. from a crashed earlier run
        fs::create_dir_all(home.path().join("results/job-2")).unwrap();

        let mut registry = HostRegistry::new();
        let index = register(&mut registry, home.path());
        registry.mark_claimed(index);

        let running = RunningJobs::new();
        running.increment();
        let mut in_flight = InFlight::new();
        in_flight.insert(index, 1);

        let sweeper = Sweeper::new(Layout::default(), local.path().to_path_buf(), running.clone());
        let report = sweeper.sweep_in_flight(&mut registry, &mut in_flight);

        assert_eq!(report.fetched.iter().map(|f| f.id).collect::<Vec<_>>(), vec![1]);
        assert_eq!(report.set_aside, 1);
        assert_eq!(report.running, 0);
        assert_eq!(report.released, vec![index]);
        assert_eq!(running.get(), 0);
        assert!(in_flight.is_empty());

        assert!(!home.path().join("results/job-0").exists());
        assert!(home.path().join("results/.stale-job-0/done").is_file());
        assert!(home.path().join("results/job-2").is_dir());
        assert!(!local.path().join("job-0").exists());

        // a second sweep no longer sees the stale directory
        let again = sweeper.sweep_in_flight(&mut registry, &mut in_flight);
        assert_eq!(again.set_aside, 0);
        assert!(again.fetched.is_empty());
    }

    #[test]
    fn untracked_sweeps_fetch_everything() {
        let home = tempfile::tempdir().unwrap();
        let local = tempfile::tempdir().unwrap();
        finished(home.path(), 3, 5.0);

        let mut registry = HostRegistry::new();
        register(&mut registry, home.path());

        let running = RunningJobs::new();
        let report = Sweeper::new(Layout::default(), local.path().to_path_buf(), running.clone())
            .sweep(&mut registry);

        assert_eq!(report.fetched.len(), 1);
        assert_eq!(report.set_aside, 0);
        assert_eq!(running.get(), 0);
    }

    #[test]
    fn unreadable_records_become_failures() {
        let dir = tempfile::tempdir().unwrap();
        let result = read_fetched_result(dir.path(), "result.yaml", 9);

        assert_eq!(result, JobResult::failure(9, MISSING_RECORD));
    }
}
