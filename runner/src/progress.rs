use std::time::{Duration, Instant};
use tracing::info;

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub done: usize,
    pub total: usize,
    pub fraction: f64,
    pub elapsed: Duration,
    pub eta: Option<Duration>,
}

impl ProgressEvent {
    pub fn percent(&self) -> f64 {
        self.fraction * 100.0
    }

    pub fn log(&self) {
        match self.eta {
            Some(eta) => info!(
                done = self.done,
                total = self.total,
                "{:.2}% done, approx {:.1} mins remaining",
                self.percent(),
                eta.as_secs_f64() / 60.0
            ),
            None => info!(done = self.done, total = self.total, "{:.2}% done", self.percent()),
        }
    }
}

/// Reports completion in bands of `step` percent
///
/// Bands are computed in integers so every band, including 100%, fires at most
/// once, even when a single result skips over several bands.
#[derive(Debug)]
pub struct ProgressTracker {
    step: u64,
    total: u64,
    last_band: u64,
    started: Instant,
}

impl ProgressTracker {
    pub fn new(total: usize, step_percent: u32) -> Self {
        Self {
            step: u64::from(step_percent.max(1)),
            total: total as u64,
            last_band: 0,
            started: Instant::now(),
        }
    }

    pub fn observe(&mut self, done: usize) -> Option<ProgressEvent> {
        let elapsed = self.started.elapsed();

        self.observe_at(done, elapsed)
    }

    pub fn observe_at(&mut self, done: usize, elapsed: Duration) -> Option<ProgressEvent> {
        if self.total == 0 || done == 0 {
            return None;
        }

        let band = (done as u64 * 100) / (self.total * self.step);
        if band <= self.last_band {
            return None;
        }
        self.last_band = band;

        let fraction = done as f64 / self.total as f64;

        Some(ProgressEvent {
            done,
            total: self.total as usize,
            fraction,
            elapsed,
            eta: estimate_remaining(elapsed, fraction),
        })
    }
}

/// `elapsed / fraction * (1 - fraction)`, nothing before the first result
pub fn estimate_remaining(elapsed: Duration, fraction: f64) -> Option<Duration> {
    if !fraction.is_finite() || fraction <= 0.0 {
        return None;
    }

    let remaining = elapsed.as_secs_f64() / fraction * (1.0 - fraction).max(0.0);

    Some(Duration::from_secs_f64(remaining))
}
