//! Least-loaded batch scheduling
//!
//! Pure bookkeeping for the dispatcher: which batches still need a worker,
//! which are in flight on which worker and attempt, and what to do when a
//! worker reports back. All decisions read and update the shared
//! [`WorkerState`] table passed in by the caller.

use super::batch::BatchPlan;
use super::worker::WorkerState;
use std::collections::{HashMap, VecDeque};
use tracing::debug;

/// Worker with the fewest pending records among those accepting work
///
/// Ties go to the lowest worker id.
pub fn least_loaded(states: &[WorkerState]) -> Option<usize> {
    states
        .iter()
        .filter(|state| state.status.accepts_work())
        .min_by_key(|state| (state.pending_records, state.worker_id))
        .map(|state| state.worker_id)
}

/// A batch attempt bound to a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assignment {
    pub batch_id: u64,
    pub worker_id: usize,
    pub attempt: u32,
    pub records: usize,
}

/// What to do with a batch whose worker died
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashDecision {
    /// The report was for an attempt that is no longer current
    Stale,
    /// Requeued as attempt `next_attempt`
    Retry { next_attempt: u32 },
    /// Out of retries after `attempts` attempts
    Exhausted { attempts: u32 },
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    worker_id: usize,
    attempt: u32,
}

/// Tracks every batch of one `process_batches` call
#[derive(Debug)]
pub struct BatchScheduler {
    pending: VecDeque<u64>,
    records: HashMap<u64, usize>,
    attempts: HashMap<u64, u32>,
    in_flight: HashMap<u64, InFlight>,
    max_retries: u32,
}

impl BatchScheduler {
    pub fn new(plans: &[BatchPlan], max_retries: u32) -> Self {
        Self {
            pending: plans.iter().map(|plan| plan.batch_id).collect(),
            records: plans
                .iter()
                .map(|plan| (plan.batch_id, plan.records()))
                .collect(),
            attempts: plans.iter().map(|plan| (plan.batch_id, 1)).collect(),
            in_flight: HashMap::new(),
            max_retries,
        }
    }

    /// Bind the next pending batch to the least-loaded worker
    pub fn next_assignment(&mut self, workers: &mut [WorkerState]) -> Option<Assignment> {
        let batch_id = *self.pending.front()?;
        let worker_id = least_loaded(workers)?;
        self.pending.pop_front();

        let records = self.records.get(&batch_id).copied().unwrap_or(0);
        let attempt = self.attempts.get(&batch_id).copied().unwrap_or(1);
        if let Some(state) = workers.get_mut(worker_id) {
            state.pending_records += records;
        }
        self.in_flight.insert(batch_id, InFlight { worker_id, attempt });
        debug!(batch_id, worker_id, attempt, records, "Batch assigned");

        Some(Assignment {
            batch_id,
            worker_id,
            attempt,
            records,
        })
    }

    /// Record a finished attempt; false when the report is stale
    pub fn complete(&mut self, batch_id: u64, attempt: u32, workers: &mut [WorkerState]) -> bool {
        let Some(flight) = self.settle(batch_id, attempt, workers) else {
            return false;
        };
        if let Some(state) = workers.get_mut(flight.worker_id) {
            state.completed_batches += 1;
        }
        true
    }

    /// Put back a batch that never started; its attempt count is unchanged
    pub fn returned(&mut self, batch_id: u64, attempt: u32, workers: &mut [WorkerState]) -> bool {
        if self.settle(batch_id, attempt, workers).is_none() {
            return false;
        }
        self.pending.push_front(batch_id);
        true
    }

    /// Decide between retry and permanent failure after a worker death
    pub fn crashed(
        &mut self,
        batch_id: u64,
        attempt: u32,
        workers: &mut [WorkerState],
    ) -> CrashDecision {
        if self.settle(batch_id, attempt, workers).is_none() {
            return CrashDecision::Stale;
        }
        if attempt > self.max_retries {
            return CrashDecision::Exhausted { attempts: attempt };
        }
        let next_attempt = attempt + 1;
        self.attempts.insert(batch_id, next_attempt);
        self.pending.push_back(batch_id);
        CrashDecision::Retry { next_attempt }
    }

    /// Batches never assigned, removed from the queue
    pub fn drain_pending(&mut self) -> Vec<u64> {
        self.pending.drain(..).collect()
    }

    /// Batches still running, removed from tracking
    pub fn drain_in_flight(&mut self, workers: &mut [WorkerState]) -> Vec<(u64, u32)> {
        let flights: Vec<(u64, InFlight)> = self.in_flight.drain().collect();
        flights
            .into_iter()
            .map(|(batch_id, flight)| {
                self.release_records(batch_id, flight.worker_id, workers);
                (batch_id, flight.attempt)
            })
            .collect()
    }

    pub fn attempts(&self, batch_id: u64) -> u32 {
        self.attempts.get(&batch_id).copied().unwrap_or(0)
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_done(&self) -> bool {
        self.pending.is_empty() && self.in_flight.is_empty()
    }

    fn settle(
        &mut self,
        batch_id: u64,
        attempt: u32,
        workers: &mut [WorkerState],
    ) -> Option<InFlight> {
        match self.in_flight.get(&batch_id) {
            Some(flight) if flight.attempt == attempt => {}
            _ => return None,
        }
        let flight = self.in_flight.remove(&batch_id)?;
        self.release_records(batch_id, flight.worker_id, workers);
        Some(flight)
    }

    fn release_records(&self, batch_id: u64, worker_id: usize, workers: &mut [WorkerState]) {
        let records = self.records.get(&batch_id).copied().unwrap_or(0);
        if let Some(state) = workers.get_mut(worker_id) {
            state.pending_records = state.pending_records.saturating_sub(records);
        }
    }
}
