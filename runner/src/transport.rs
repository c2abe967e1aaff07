pub mod payload;

use crate::{
    config::Layout,
    hosts::{HostError, RemoteHost},
    job::{job_name, JobId},
    process::{run_with_timeout, ProcessError},
};
use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    process::Command,
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, error, info, instrument};

pub use payload::{PayloadBuilder, JOB_FILE};

pub const ARCHIVE_EXTENSION: &str = ".tar.gz";

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid include pattern: {0}")]
    Glob(#[from] globset::Error),
    #[error("failed to write job record: {0}")]
    Record(#[from] serde_yaml::Error),
    #[error("failed to run tar: {0}")]
    Process(#[from] ProcessError),
    #[error("tar failed for {archive:?} with {status}: {stderr}")]
    Archive {
        archive: PathBuf,
        status: i32,
        stderr: String,
    },
    #[error("failed to upload job {id}: {source}")]
    Upload {
        id: JobId,
        #[source]
        source: HostError,
    },
}

impl TransportError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Local problems won't go away by picking another host
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Upload { .. })
    }
}

pub fn archive_name(id: JobId) -> String {
    format!("{}{ARCHIVE_EXTENSION}", job_name(id))
}

fn run_tar(command: Command, archive: &Path, timeout: Duration) -> Result<(), TransportError> {
    let output = run_with_timeout(command, timeout, None)?;

    if output.success() {
        Ok(())
    } else {
        Err(TransportError::Archive {
            archive: archive.to_path_buf(),
            status: output.code(),
            stderr: output.stderr.trim().to_owned(),
        })
    }
}

/// Unpack an archive produced by [`Transporter::pack`] into `destination`
pub fn unpack(archive: &Path, destination: &Path, timeout: Duration) -> Result<(), TransportError> {
    fs::create_dir_all(destination).map_err(|source| TransportError::io(destination, source))?;

    let mut command = Command::new("tar");
    command.arg("-xzf").arg(archive).arg("-C").arg(destination);

    run_tar(command, archive, timeout)
}

/// Ships payload directories to claimed hosts
#[derive(Debug, Clone)]
pub struct Transporter {
    staging: PathBuf,
    jobs_dir: String,
    results_dir: String,
    timeout: Duration,
}

impl Transporter {
    pub fn new(staging: PathBuf, layout: &Layout, timeout: Duration) -> Self {
        Self {
            staging,
            jobs_dir: layout.jobs_dir.clone(),
            results_dir: layout.results_dir.clone(),
            timeout,
        }
    }

    /// final location of a job archive, relative to the host home
    pub fn remote_path(&self, id: JobId) -> String {
        format!("{}/{}", self.jobs_dir, archive_name(id))
    }

    /// where the host worker leaves the output of a job
    pub fn result_path(&self, id: JobId) -> String {
        format!("{}/{}", self.results_dir, job_name(id))
    }

    /// Dot-prefixed upload target, invisible to host workers until renamed
    fn partial_path(&self, id: JobId) -> String {
        format!("{}/.{}.part", self.jobs_dir, archive_name(id))
    }

    pub fn pack(&self, id: JobId, payload: &Path) -> Result<PathBuf, TransportError> {
        fs::create_dir_all(&self.staging)
            .map_err(|source| TransportError::io(&self.staging, source))?;
        let archive = self.staging.join(archive_name(id));

        let mut command = Command::new("tar");
        command.arg("-czf").arg(&archive).arg("-C").arg(payload).arg(".");

        run_tar(command, &archive, self.timeout)?;

        Ok(archive)
    }

    /// Pack, upload and publish a payload on a claimed host
    ///
    /// Local files are only removed after the archive was published; a failed
    /// upload keeps the archive around for inspection.
    #[instrument(skip_all, fields(job = id, host = %host.address()))]
    pub fn send(&self, host: &dyn RemoteHost, id: JobId, payload: &Path) -> Result<(), TransportError> {
        let archive = self.pack(id, payload)?;
        let partial = self.partial_path(id);
        let upload = |source| TransportError::Upload { id, source };

        // an old directory under the same name would pass for this job's output
        host.remove_all(&self.result_path(id)).map_err(upload)?;

        debug!("Uploading {}", archive.to_string_lossy());
        host.upload(&archive, &partial).map_err(upload)?;
        if let Err(source) = host.rename(&partial, &self.remote_path(id)) {
            // don't leave dead partial uploads behind on a host we no longer own
            if let Err(e) = host.remove_all(&partial) {
                error!(error = ?e, "Failed to remove partial upload");
            }

            return Err(upload(source));
        }

        info!("Published job archive");

        for (path, result) in [
            (payload, fs::remove_dir_all(payload)),
            (archive.as_path(), fs::remove_file(&archive)),
        ] {
            match result {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => error!(error = ?e, "Failed to clean up {}", path.to_string_lossy()),
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hosts::LocalHost;

    fn transporter(staging: &Path) -> Transporter {
        Transporter::new(
            staging.to_path_buf(),
            &Layout::default(),
            Duration::from_secs(30),
        )
    }

    #[test]
    fn archives_are_published_under_their_final_name() {
        let staging = tempfile::tempdir().unwrap();
        let home = tempfile::tempdir().unwrap();
        let payload = staging.path().join("job-4");
        fs::create_dir_all(payload.join("inputs")).unwrap();
        fs::write(payload.join("job.yaml"), b"id: 4\n").unwrap();
        fs::write(payload.join("inputs/model.idf"), b"building").unwrap();

        let transporter = transporter(staging.path());
        let host = LocalHost::new(home.path());
        transporter.send(&host, 4, &payload).unwrap();

        assert_eq!(transporter.remote_path(4), "jobs/job-4.tar.gz");
        assert_eq!(host.list_dir("jobs").unwrap(), vec!["job-4.tar.gz".to_owned()]);
        assert!(!home.path().join("jobs/.job-4.tar.gz.part").exists());
        // local copies are gone once published
        assert!(!payload.exists());
        assert!(!staging.path().join("job-4.tar.gz").exists());

        let unpacked = tempfile::tempdir().unwrap();
        unpack(
            &home.path().join("jobs/job-4.tar.gz"),
            unpacked.path(),
            Duration::from_secs(30),
        )
        .unwrap();
        assert_eq!(fs::read(unpacked.path().join("inputs/model.idf")).unwrap(), b"building");
        assert_eq!(fs::read(unpacked.path().join("job.yaml")).unwrap(), b"id: 4\n");
    }

    #[test]
    fn old_results_under_the_same_name_are_cleared() {
        let staging = tempfile::tempdir().unwrap();
        let home = tempfile::tempdir().unwrap();
        let payload = staging.path().join("job-0");
        fs::create_dir_all(&payload).unwrap();
        fs::write(payload.join("job.yaml"), b"id: 0\n").unwrap();
        fs::create_dir_all(home.path().join("results/job-0")).unwrap();
        fs::write(home.path().join("results/job-0/done"), b"").unwrap();

        let transporter = transporter(staging.path());
        transporter.send(&LocalHost::new(home.path()), 0, &payload).unwrap();

        assert_eq!(transporter.result_path(0), "results/job-0");
        assert!(!home.path().join("results/job-0").exists());
        assert!(home.path().join("jobs/job-0.tar.gz").is_file());
    }

    #[test]
    fn failed_uploads_are_bounded_and_keep_the_archive() {
        let staging = tempfile::tempdir().unwrap();
        let payload = staging.path().join("job-1");
        fs::create_dir_all(&payload).unwrap();
        fs::write(payload.join("job.yaml"), b"id: 1\n").unwrap();

        // a home below a regular file can never be created
        let blocker = tempfile::NamedTempFile::new().unwrap();
        let host = LocalHost::new(blocker.path().join("home"));

        let error = transporter(staging.path()).send(&host, 1, &payload).unwrap_err();

        assert!(matches!(error, TransportError::Upload { id: 1, .. }));
        assert!(!error.is_fatal());
        assert!(staging.path().join("job-1.tar.gz").is_file());
    }

    #[test]
    fn missing_payloads_are_fatal() {
        let staging = tempfile::tempdir().unwrap();
        let home = tempfile::tempdir().unwrap();

        let error = transporter(staging.path())
            .send(&LocalHost::new(home.path()), 2, &staging.path().join("job-2"))
            .unwrap_err();

        assert!(error.is_fatal());
        assert!(LocalHost::new(home.path()).list_dir("jobs").unwrap().is_empty());
    }
}
