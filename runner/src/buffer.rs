use crate::job::{JobId, JobResult, JobStatus, Metrics};
use thiserror::Error;

/// One entry of the result buffer, `Missing` is the "not yet present" sentinel
#[derive(Debug, Clone, PartialEq)]
pub enum Slot {
    Missing,
    Done(Metrics),
    Failed(String),
}

impl Slot {
    pub fn is_missing(&self) -> bool {
        matches!(self, Self::Missing)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recorded {
    New,
    Overwritten,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum BufferError {
    #[error("result for unknown job {id}, the sweep only has {total} jobs")]
    UnknownJob { id: JobId, total: usize },
}

/// Fixed-length result matrix indexed by job id
///
/// Owned by the producer's completion tracking loop, nothing else writes to it.
#[derive(Debug, Clone)]
pub struct ResultBuffer {
    slots: Vec<Slot>,
    done: usize,
}

impl ResultBuffer {
    pub fn new(total: usize) -> Self {
        Self {
            slots: vec![Slot::Missing; total],
            done: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Write a result into its slot, a repeated id overwrites the previous value
    pub fn record(&mut self, result: JobResult) -> Result<Recorded, BufferError> {
        let total = self.slots.len();
        let slot = usize::try_from(result.id)
            .ok()
            .and_then(|index| self.slots.get_mut(index))
            .ok_or(BufferError::UnknownJob {
                id: result.id,
                total,
            })?;

        let recorded = if slot.is_missing() {
            self.done += 1;
            Recorded::New
        } else {
            Recorded::Overwritten
        };

        *slot = match result.status {
            JobStatus::Success => Slot::Done(result.metrics),
            JobStatus::Failure { reason } => Slot::Failed(reason),
        };

        Ok(recorded)
    }

    pub fn slot(&self, id: JobId) -> Option<&Slot> {
        usize::try_from(id).ok().and_then(|index| self.slots.get(index))
    }

    pub fn iter(&self) -> impl Iterator<Item = (JobId, &Slot)> {
        self.slots
            .iter()
            .enumerate()
            .map(|(index, slot)| (index as JobId, slot))
    }

    pub fn done_count(&self) -> usize {
        self.done
    }

    pub fn missing_count(&self) -> usize {
        self.slots.len() - self.done
    }

    pub fn is_complete(&self) -> bool {
        self.missing_count() == 0
    }

    /// an empty sweep counts as complete
    pub fn done_fraction(&self) -> f64 {
        if self.slots.is_empty() {
            1.0
        } else {
            self.done as f64 / self.slots.len() as f64
        }
    }

    pub fn missing_ids(&self) -> Vec<JobId> {
        self.iter()
            .filter(|(_, slot)| slot.is_missing())
            .map(|(id, _)| id)
            .collect()
    }

    pub fn failed(&self) -> impl Iterator<Item = (JobId, &str)> {
        self.iter().filter_map(|(id, slot)| match slot {
            Slot::Failed(reason) => Some((id, reason.as_str())),
            _ => None,
        })
    }

    /// One metric across all jobs, NaN wherever no value exists
    pub fn column(&self, metric: &str) -> Vec<f64> {
        self.slots
            .iter()
            .map(|slot| match slot {
                Slot::Done(metrics) => metrics.get(metric).copied().unwrap_or(f64::NAN),
                Slot::Missing | Slot::Failed(_) => f64::NAN,
            })
            .collect()
    }
}
