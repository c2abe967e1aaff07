use super::{claimed_marker_name, is_visible, HostError, RemoteHost};
use std::{
    fs,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use tracing::{debug, error};

/// A host whose home directory is reachable through the local filesystem
///
/// Covers nodes sharing a mounted filesystem with the producer.
#[derive(Debug, Clone)]
pub struct LocalHost {
    address: String,
    home: PathBuf,
}

impl LocalHost {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        let home = home.into();

        Self {
            address: home.to_string_lossy().into_owned(),
            home,
        }
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.home.join(path)
    }

    fn error(&self, path: &str, source: io::Error) -> HostError {
        HostError::Io {
            host: self.address.clone(),
            path: path.to_owned(),
            source,
        }
    }
}

/// recursive copy of `from` into `to`
pub(crate) fn copy_dir(from: &Path, to: &Path) -> io::Result<()> {
    fs::create_dir_all(to)?;

    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());

        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }

    Ok(())
}

fn remove_path(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(metadata) if metadata.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
        Err(error) => Err(error),
    }
}

impl RemoteHost for LocalHost {
    fn address(&self) -> &str {
        &self.address
    }

    fn is_alive(&self) -> bool {
        self.home.is_dir()
    }

    fn exists(&self, path: &str) -> Result<bool, HostError> {
        match fs::symlink_metadata(self.resolve(path)) {
            Ok(_) => Ok(true),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(false),
            Err(error) => Err(self.error(path, error)),
        }
    }

    fn list_dir(&self, path: &str) -> Result<Vec<String>, HostError> {
        let entries = match fs::read_dir(self.resolve(path)) {
            Ok(entries) => entries,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => return Err(self.error(path, error)),
        };

        let mut names = Vec::new();
        for entry in entries {
            let name = entry
                .map_err(|error| self.error(path, error))?
                .file_name()
                .to_string_lossy()
                .into_owned();

            if is_visible(&name) {
                names.push(name);
            }
        }
        names.sort();

        Ok(names)
    }

    fn claim_marker(&self, marker: &str, token: &str) -> Result<bool, HostError> {
        let claimed = claimed_marker_name(marker, token);

        match fs::rename(self.resolve(marker), self.resolve(&claimed)) {
            Ok(()) => {
                if let Err(error) = fs::remove_file(self.resolve(&claimed)) {
                    // the claim itself already succeeded
                    error!(host = %self.address, error = ?error, "Failed to cleanup claimed marker");
                }

                Ok(true)
            }
            Err(error) if error.kind() == ErrorKind::NotFound => {
                debug!(host = %self.address, "Marker vanished between check and claim");

                Ok(false)
            }
            Err(error) => Err(self.error(marker, error)),
        }
    }

    fn upload(&self, local: &Path, remote: &str) -> Result<(), HostError> {
        let target = self.resolve(remote);

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|error| self.error(remote, error))?;
        }

        fs::copy(local, &target)
            .map(|_| ())
            .map_err(|error| self.error(remote, error))
    }

    fn rename(&self, from: &str, to: &str) -> Result<(), HostError> {
        fs::rename(self.resolve(from), self.resolve(to)).map_err(|error| self.error(from, error))
    }

    fn download_dir(&self, remote: &str, local: &Path) -> Result<(), HostError> {
        remove_path(local)
            .and_then(|()| copy_dir(&self.resolve(remote), local))
            .map_err(|error| self.error(remote, error))
    }

    fn remove_all(&self, path: &str) -> Result<(), HostError> {
        remove_path(&self.resolve(path)).map_err(|error| self.error(path, error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::{Arc, Barrier},
        thread,
    };

    #[test]
    fn listing_skips_hidden_entries_and_missing_directories() {
        let home = tempfile::tempdir().unwrap();
        let host = LocalHost::new(home.path());
        fs::create_dir(home.path().join("jobs")).unwrap();
        fs::write(home.path().join("jobs/job-2.tar.gz"), b"").unwrap();
        fs::write(home.path().join("jobs/job-1.tar.gz"), b"").unwrap();
        fs::write(home.path().join("jobs/.job-3.tar.gz.part"), b"").unwrap();

        assert_eq!(
            host.list_dir("jobs").unwrap(),
            vec!["job-1.tar.gz".to_owned(), "job-2.tar.gz".to_owned()]
        );
        assert!(host.list_dir("results").unwrap().is_empty());
    }

    #[test]
    fn marker_can_only_be_claimed_once() {
        let home = tempfile::tempdir().unwrap();
        let host = LocalHost::new(home.path());
        fs::write(home.path().join("ready"), b"").unwrap();

        assert!(host.claim_marker("ready", "first").unwrap());
        assert!(!host.claim_marker("ready", "second").unwrap());
        assert!(!host.exists("ready").unwrap());
        assert!(host.list_dir("").unwrap().is_empty());
    }

    #[test]
    fn concurrent_claimants_get_one_winner() {
        let home = tempfile::tempdir().unwrap();
        fs::write(home.path().join("ready"), b"").unwrap();

        let barrier = Arc::new(Barrier::new(8));
        let winners = (0..8)
            .map(|claimant| {
                let host = LocalHost::new(home.path());
                let barrier = barrier.clone();

                thread::spawn(move || {
                    barrier.wait();
                    host.claim_marker("ready", &format!("claimant{claimant}"))
                        .unwrap()
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|won| *won)
            .count();

        assert_eq!(winners, 1);
    }

    #[test]
    fn directories_download_and_remove() {
        let home = tempfile::tempdir().unwrap();
        let local = tempfile::tempdir().unwrap();
        let host = LocalHost::new(home.path());
        fs::create_dir_all(home.path().join("results/job-0/out")).unwrap();
        fs::write(home.path().join("results/job-0/done"), b"").unwrap();
        fs::write(home.path().join("results/job-0/out/table.csv"), b"1,2").unwrap();

        let target = local.path().join("job-0");
        host.download_dir("results/job-0", &target).unwrap();
        host.remove_all("results/job-0").unwrap();

        assert!(target.join("done").is_file());
        assert_eq!(fs::read(target.join("out/table.csv")).unwrap(), b"1,2");
        assert!(!host.exists("results/job-0").unwrap());
        // removing twice is fine
        host.remove_all("results/job-0").unwrap();
    }
}
