//! Bounded in-memory history of completed runs.
//!
//! The newest N runs are retained; older ones fall off the back. History is
//! process-local by design: restarts start with an empty window, and the
//! durable record of reconciliation lives in the stores themselves.

use crate::types::{RunStatus, SyncRun, SyncStats};
use parking_lot::RwLock;
use std::collections::VecDeque;

pub struct RunHistory {
    capacity: usize,
    runs: RwLock<VecDeque<SyncRun>>,
}

impl RunHistory {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            runs: RwLock::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Append a completed run, evicting the oldest once at capacity.
    pub fn record(&self, run: SyncRun) {
        let mut runs = self.runs.write();
        if runs.len() == self.capacity {
            runs.pop_front();
        }
        runs.push_back(run);
    }

    /// The most recently recorded run.
    #[must_use]
    pub fn last(&self) -> Option<SyncRun> {
        self.runs.read().back().cloned()
    }

    /// All retained runs, newest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<SyncRun> {
        self.runs.read().iter().rev().cloned().collect()
    }

    /// The newest `n` runs, newest first.
    #[must_use]
    pub fn recent(&self, n: usize) -> Vec<SyncRun> {
        self.runs.read().iter().rev().take(n).cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.runs.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.runs.read().is_empty()
    }

    /// Drop every retained run.
    pub fn clear(&self) {
        self.runs.write().clear();
    }

    /// Aggregate the retained window under a single read lock.
    #[must_use]
    pub fn stats(&self) -> SyncStats {
        let runs = self.runs.read();
        let mut stats = SyncStats {
            runs_recorded: runs.len() as u64,
            last_run: runs.back().cloned(),
            ..SyncStats::default()
        };

        for run in runs.iter() {
            match run.status {
                RunStatus::Success => stats.runs_succeeded += 1,
                RunStatus::Partial => stats.runs_partial += 1,
                RunStatus::Failed => stats.runs_failed += 1,
            }
            stats.total_processed += run.processed_count;
            stats.total_updated += run.updated_count;
            stats.total_errors += run.error_count;
            stats.average_duration_ms += run.duration_ms;
        }

        if stats.runs_recorded > 0 {
            stats.average_duration_ms /= stats.runs_recorded;
        }
        stats
    }
}

impl Default for RunHistory {
    fn default() -> Self {
        Self::new(crate::config::SyncConfig::default().history_capacity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RunTrigger;

    fn finished_run(status: RunStatus, processed: u64, updated: u64, errors: u64) -> SyncRun {
        let mut run = SyncRun::begin(RunTrigger::Scheduled, false);
        run.processed_count = processed;
        run.updated_count = updated;
        run.error_count = errors;
        run.finish(status);
        run
    }

    #[test]
    fn record_and_last() {
        let history = RunHistory::new(10);
        assert!(history.is_empty());
        assert!(history.last().is_none());

        let run = finished_run(RunStatus::Success, 3, 1, 0);
        let id = run.id;
        history.record(run);

        assert_eq!(history.len(), 1);
        assert_eq!(history.last().unwrap().id, id);
    }

    #[test]
    fn capacity_evicts_oldest() {
        let history = RunHistory::new(3);
        let mut ids = Vec::new();
        for _ in 0..5 {
            let run = finished_run(RunStatus::Success, 1, 0, 0);
            ids.push(run.id);
            history.record(run);
        }

        assert_eq!(history.len(), 3);
        let snapshot = history.snapshot();
        // Newest first; the two oldest fell off.
        assert_eq!(snapshot[0].id, ids[4]);
        assert_eq!(snapshot[2].id, ids[2]);
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let history = RunHistory::new(0);
        history.record(finished_run(RunStatus::Success, 1, 0, 0));
        history.record(finished_run(RunStatus::Failed, 0, 0, 0));
        assert_eq!(history.len(), 1);
        assert_eq!(history.last().unwrap().status, RunStatus::Failed);
    }

    #[test]
    fn recent_takes_newest_first() {
        let history = RunHistory::new(10);
        for i in 0..4 {
            history.record(finished_run(RunStatus::Success, i, 0, 0));
        }
        let recent = history.recent(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].processed_count, 3);
        assert_eq!(recent[1].processed_count, 2);
    }

    #[test]
    fn stats_aggregate_retained_window() {
        let history = RunHistory::new(10);
        history.record(finished_run(RunStatus::Success, 10, 2, 0));
        history.record(finished_run(RunStatus::Partial, 10, 1, 1));
        history.record(finished_run(RunStatus::Failed, 0, 0, 0));

        let stats = history.stats();
        assert_eq!(stats.runs_recorded, 3);
        assert_eq!(stats.runs_succeeded, 1);
        assert_eq!(stats.runs_partial, 1);
        assert_eq!(stats.runs_failed, 1);
        assert_eq!(stats.total_processed, 20);
        assert_eq!(stats.total_updated, 3);
        assert_eq!(stats.total_errors, 1);
        assert_eq!(stats.last_run.unwrap().status, RunStatus::Failed);
    }

    #[test]
    fn stats_on_empty_history_are_zero() {
        let history = RunHistory::new(5);
        let stats = history.stats();
        assert_eq!(stats.runs_recorded, 0);
        assert_eq!(stats.average_duration_ms, 0);
        assert!(stats.last_run.is_none());
    }

    #[test]
    fn clear_empties_the_window() {
        let history = RunHistory::new(5);
        history.record(finished_run(RunStatus::Success, 1, 0, 0));
        history.clear();
        assert!(history.is_empty());
        assert!(history.last().is_none());
    }
}
