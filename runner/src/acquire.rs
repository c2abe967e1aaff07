use crate::{
    config::RemoteConfig,
    hosts::{claimant_token, HostIndex, HostRegistry},
};
use std::{
    thread,
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

#[derive(Error, Debug)]
pub enum AcquireError {
    #[error("no idle host found after {tours} tours ({waited:?})")]
    NoHostAvailable { tours: usize, waited: Duration },
    #[error("the host registry is empty")]
    EmptyRegistry,
}

#[derive(Debug)]
enum State {
    Discovering,
    Probing(Vec<HostIndex>),
    Claimed(HostIndex),
    TimedOut,
}

/// Finds an idle host and claims it through its availability marker
#[derive(Debug, Clone)]
pub struct Acquirer {
    timeout: Duration,
    poll_interval: Duration,
    marker: String,
    token: String,
}

impl Acquirer {
    pub fn new(timeout: Duration, poll_interval: Duration, marker: impl Into<String>) -> Self {
        Self {
            timeout,
            poll_interval,
            marker: marker.into(),
            token: claimant_token(),
        }
    }

    pub fn load(config: &RemoteConfig) -> Self {
        Self::new(
            Duration::from_secs(config.acquire.timeout_secs),
            Duration::from_secs(config.acquire.poll_interval_secs),
            config.layout.marker.clone(),
        )
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn max_tours(&self) -> usize {
        if self.poll_interval.is_zero() {
            return 1;
        }

        ((self.timeout.as_millis() / self.poll_interval.as_millis().max(1)) as usize).max(1)
    }

    pub fn acquire(&self, registry: &mut HostRegistry) -> Result<HostIndex, AcquireError> {
        self.acquire_with(registry, |_| {})
    }

    /// Like [`Acquirer::acquire`], calling `between_tours` after every unsuccessful tour
    /// that is followed by another one
    #[instrument(skip_all, fields(marker = %self.marker))]
    pub fn acquire_with<F>(
        &self,
        registry: &mut HostRegistry,
        mut between_tours: F,
    ) -> Result<HostIndex, AcquireError>
    where
        F: FnMut(&mut HostRegistry),
    {
        if registry.is_empty() {
            return Err(AcquireError::EmptyRegistry);
        }

        let max_tours = self.max_tours();
        let start = Instant::now();
        let mut tours = 0;
        let mut state = State::Discovering;

        debug!(
            hosts = registry.len(),
            claimed = registry.claimed_count(),
            max_tours,
            "Acquiring a host"
        );

        loop {
            state = match state {
                State::Discovering => {
                    tours += 1;
                    State::Probing(registry.candidates())
                }
                State::Probing(candidates) => match self.probe(registry, &candidates) {
                    Some(index) => State::Claimed(index),
                    None if tours >= max_tours => {
                        thread::sleep(self.poll_interval);
                        State::TimedOut
                    }
                    None => {
                        thread::sleep(self.poll_interval);
                        between_tours(&mut *registry);
                        State::Discovering
                    }
                },
                State::Claimed(index) => {
                    self.mark(registry, index, tours);

                    return Ok(index);
                }
                State::TimedOut => {
                    let waited = start.elapsed();
                    warn!(tours, "No idle host after {:.1}s", waited.as_secs_f64());

                    return Err(AcquireError::NoHostAvailable { tours, waited });
                }
            }
        }
    }

    /// A single tour that never sleeps, `Ok(None)` when every host is busy
    pub fn try_acquire(&self, registry: &mut HostRegistry) -> Result<Option<HostIndex>, AcquireError> {
        if registry.is_empty() {
            return Err(AcquireError::EmptyRegistry);
        }

        let candidates = registry.candidates();
        let claimed = self.probe(registry, &candidates);
        if let Some(index) = claimed {
            self.mark(registry, index, 1);
        }

        Ok(claimed)
    }

    fn mark(&self, registry: &mut HostRegistry, index: HostIndex, tours: usize) {
        registry.mark_claimed(index);

        if let Some(entry) = registry.get(index) {
            info!(host = %entry.descriptor.address, tours, "Acquired host");
        }
    }

    /// One tour over the candidates, stops at the first successful claim
    fn probe(&self, registry: &HostRegistry, candidates: &[HostIndex]) -> Option<HostIndex> {
        let mut alive = 0;

        for &index in candidates {
            let Some(entry) = registry.get(index) else {
                continue;
            };
            let host = &entry.host;

            if !host.is_alive() {
                debug!(host = %host.address(), "Host is not reachable, skipping it this tour");
                continue;
            }
            alive += 1;

            match host.exists(&self.marker) {
                Ok(true) => {}
                Ok(false) => {
                    debug!(host = %host.address(), "Host is busy");
                    continue;
                }
                Err(error) => {
                    warn!(host = %host.address(), error = ?error, "Failed to check availability marker");
                    continue;
                }
            }

            match host.claim_marker(&self.marker, &self.token) {
                Ok(true) => return Some(index),
                Ok(false) => debug!(host = %host.address(), "Lost the race for the marker"),
                Err(error) => {
                    warn!(host = %host.address(), error = ?error, "Failed to claim availability marker")
                }
            }
        }

        debug!(candidates = candidates.len(), alive, "Finished tour without an idle host");

        None
    }
}
