pub mod local;
pub mod ssh;

use crate::{
    config::{Backend, RemoteConfig},
    process::ProcessError,
};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::{
    fmt::Debug,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};
use thiserror::Error;
use tracing::{debug, warn};

pub use local::LocalHost;
pub use ssh::{SshHost, SshOptions};

/// position of a host inside its [`HostRegistry`]
pub type HostIndex = usize;

#[derive(Error, Debug)]
pub enum HostError {
    #[error("`{command}` on {host} exited with {status}: {stderr}")]
    CommandFailed {
        host: String,
        command: String,
        status: i32,
        stderr: String,
    },
    #[error("{host}: {source}")]
    Process {
        host: String,
        #[source]
        source: ProcessError,
    },
    #[error("{host}: {path}: {source}")]
    Io {
        host: String,
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Credentials {
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
    #[serde(default)]
    pub port: Option<u16>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostDescriptor {
    pub address: String,
    pub credentials: Credentials,
    pub claimed: bool,
}

impl HostDescriptor {
    pub fn new(address: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            address: address.into(),
            credentials,
            claimed: false,
        }
    }
}

/// Filesystem-level operations on a compute host
///
/// Paths are relative to the host's home directory. Implementations must be
/// shareable across threads, sweeps run over all hosts in parallel.
pub trait RemoteHost: Debug + Send + Sync {
    fn address(&self) -> &str;

    /// reachability probe, failures only exclude the host from the current tour
    fn is_alive(&self) -> bool;

    fn exists(&self, path: &str) -> Result<bool, HostError>;

    /// Visible (non-dot) entries of a directory, sorted, empty when it doesn't exist
    fn list_dir(&self, path: &str) -> Result<Vec<String>, HostError>;

    /// Take the availability marker by renaming it to a claimant-unique name
    ///
    /// Returns `false` when the marker was already gone. Rename is atomic, so
    /// of several concurrent claimants at most one sees `true`.
    fn claim_marker(&self, marker: &str, token: &str) -> Result<bool, HostError>;

    fn upload(&self, local: &Path, remote: &str) -> Result<(), HostError>;

    fn rename(&self, from: &str, to: &str) -> Result<(), HostError>;

    /// Copy a whole remote directory to `local`, replacing whatever is there
    fn download_dir(&self, remote: &str, local: &Path) -> Result<(), HostError>;

    fn remove_all(&self, path: &str) -> Result<(), HostError>;
}

/// identifies this acquirer process in claimed marker names
static CLAIMANT: Lazy<String> = Lazy::new(|| {
    let hostname = nix::unistd::gethostname()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|error| {
            warn!(error = ?error, "Failed to retrieve hostname for claim tokens");
            "unknown".to_owned()
        });

    format!("{hostname}.{}", std::process::id())
});

pub fn claimant_token() -> String {
    CLAIMANT.clone()
}

pub(crate) fn claimed_marker_name(marker: &str, token: &str) -> String {
    format!("{marker}.claimed.{token}")
}

pub(crate) fn is_visible(name: &str) -> bool {
    !name.starts_with('.')
}

#[derive(Debug)]
pub struct HostEntry {
    pub descriptor: HostDescriptor,
    pub host: Box<dyn RemoteHost>,
}

/// Static set of candidate hosts plus their claim state
///
/// Mutated by the acquirer and the sweeper; both take it by `&mut`, which is
/// how single-acquirer discipline is kept within a process.
#[derive(Debug, Default)]
pub struct HostRegistry {
    entries: Vec<HostEntry>,
}

impl HostRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(config: &RemoteConfig) -> Self {
        let mut registry = Self::new();
        let options = SshOptions::load(config);

        for host in config.hosts.iter() {
            let descriptor = host.descriptor();
            let backend: Box<dyn RemoteHost> = match config.backend {
                Backend::Ssh => Box::new(SshHost::new(
                    descriptor.address.clone(),
                    descriptor.credentials.clone(),
                    options.clone(),
                )),
                Backend::Local => Box::new(LocalHost::new(&descriptor.address)),
            };

            registry.register(descriptor, backend);
        }

        debug!(hosts = registry.len(), "Loaded host registry");

        registry
    }

    pub fn register(&mut self, descriptor: HostDescriptor, host: Box<dyn RemoteHost>) -> HostIndex {
        self.entries.push(HostEntry { descriptor, host });

        self.entries.len() - 1
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[HostEntry] {
        &self.entries
    }

    pub fn get(&self, index: HostIndex) -> Option<&HostEntry> {
        self.entries.get(index)
    }

    /// hosts that are not currently claimed by us
    pub fn candidates(&self) -> Vec<HostIndex> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| !entry.descriptor.claimed)
            .map(|(index, _)| index)
            .collect()
    }

    pub fn claimed_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.descriptor.claimed)
            .count()
    }

    pub fn mark_claimed(&mut self, index: HostIndex) {
        if let Some(entry) = self.entries.get_mut(index) {
            entry.descriptor.claimed = true;
        }
    }

    pub fn release(&mut self, index: HostIndex) {
        if let Some(entry) = self.entries.get_mut(index) {
            entry.descriptor.claimed = false;
        }
    }
}

/// Number of jobs shipped to hosts whose output has not been swept yet
#[derive(Debug, Clone, Default)]
pub struct RunningJobs(Arc<AtomicUsize>);

impl RunningJobs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    /// returns the new count
    pub fn increment(&self) -> usize {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Saturates at zero, returns the new count
    pub fn decrement(&self) -> usize {
        let previous = self
            .0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                Some(count.saturating_sub(1))
            })
            .unwrap_or(0);

        previous.saturating_sub(1)
    }
}
