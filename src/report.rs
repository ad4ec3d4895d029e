//! Outcome of a run.
//!
//! Each worker produces a [`WorkerResult`] when it stops, for
//! whatever reason. The executor gathers them into a [`RunReport`]
//! once every worker has joined.

use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use crate::batch::chunk;
use crate::batch::BatchDescriptor;
use crate::batch::RecordId;
use crate::batch::WorkerCount;
use crate::batch::WorkerIndex;

/// Unique-ish name for a run, used to key the journal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    pub(crate) fn new(started_at: &DateTime<Utc>) -> Self {
        Self(format!(
            "{}-{:08x}",
            started_at.format("%Y%m%dT%H%M%S%.3fZ"),
            fastrand::u32(..)
        ))
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

/// A record the fixer rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFailure {
    pub id: RecordId,
    pub reason: String,
}

/// How a worker stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason")]
pub enum WorkerStatus {
    /// Every record of the batch was attempted.
    Completed,
    /// The worker lost its store or panicked outside the fixer. The
    /// rest of the batch was not attempted.
    CrashedEarly(String),
    /// The run was interrupted before the batch was finished.
    Interrupted,
}

impl WorkerStatus {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

/// What one worker did with its batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerResult {
    pub worker: WorkerIndex,
    pub batch: BatchDescriptor,
    /// Records the fixer accepted.
    pub processed: u64,
    pub failed: Vec<RecordFailure>,
    /// Key of the last record attempted, successful or not.
    pub last_key: Option<RecordId>,
    pub status: WorkerStatus,
    pub elapsed: Duration,
}

impl WorkerResult {
    pub(crate) fn new(worker: WorkerIndex, batch: BatchDescriptor) -> Self {
        Self {
            worker,
            batch,
            processed: 0,
            failed: Vec::new(),
            last_key: None,
            status: WorkerStatus::Completed,
            elapsed: Duration::ZERO,
        }
    }

    pub(crate) fn crashed(mut self, reason: String) -> Self {
        self.status = WorkerStatus::CrashedEarly(reason);
        self
    }
}

/// Overall judgement of a run.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    /// No failed records and every worker completed.
    Clean,
    /// Some work got done, but not all of it.
    Partial,
    /// Nothing was fixed and something went wrong.
    Failed,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Clean => "clean",
            Self::Partial => "partial",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// In worker index order.
    pub workers: Vec<WorkerResult>,
}

impl RunReport {
    pub fn processed(&self) -> u64 {
        self.workers.iter().map(|w| w.processed).sum()
    }

    pub fn failed(&self) -> usize {
        self.workers.iter().map(|w| w.failed.len()).sum()
    }

    /// Workers that stopped before finishing their batch.
    pub fn unfinished(&self) -> impl Iterator<Item = &WorkerResult> {
        self.workers.iter().filter(|w| !w.status.is_completed())
    }

    pub fn failures(&self) -> impl Iterator<Item = &RecordFailure> {
        self.workers.iter().flat_map(|w| w.failed.iter())
    }

    pub fn verdict(&self) -> Verdict {
        let trouble = self.failed() > 0 || self.unfinished().next().is_some();
        if !trouble {
            Verdict::Clean
        } else if self.processed() == 0 {
            Verdict::Failed
        } else {
            Verdict::Partial
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// What an operator should re-run to finish the job.
    ///
    /// Unfinished batches are re-run whole; fixers are idempotent so
    /// the records they already fixed are safe to fix again. Failed
    /// records of finished batches are listed individually.
    pub fn retry_plan(&self) -> RetryPlan {
        let batches = self.unfinished().map(|w| w.batch.clone()).collect();
        let failed_ids = self
            .workers
            .iter()
            .filter(|w| w.status.is_completed())
            .flat_map(|w| w.failed.iter().map(|f| f.id))
            .collect();
        RetryPlan {
            batches,
            failed_ids,
        }
    }
}

/// Work left over from a non-clean run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPlan {
    pub batches: Vec<BatchDescriptor>,
    pub failed_ids: Vec<RecordId>,
}

impl RetryPlan {
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty() && self.failed_ids.is_empty()
    }

    /// Descriptors ready for [`crate::executor::Executor::execute`].
    ///
    /// Failed ids are chunked over `workers`, then the unfinished
    /// batches are appended as they were.
    pub fn into_descriptors(self, workers: WorkerCount) -> Vec<BatchDescriptor> {
        chunk(self.failed_ids, workers)
            .into_iter()
            .map(BatchDescriptor::from)
            .chain(self.batches)
            .collect()
    }
}

#[cfg(test)]
pub(crate) fn result(
    worker: usize,
    processed: u64,
    failed: &[i64],
    status: WorkerStatus,
) -> WorkerResult {
    use crate::batch::RangeBatch;

    let base = worker as i64 * 100;
    WorkerResult {
        worker: WorkerIndex(worker),
        batch: BatchDescriptor::Range(RangeBatch {
            start: RecordId(base + 1),
            stop: RecordId(base + 100),
        }),
        processed,
        failed: failed
            .iter()
            .map(|id| RecordFailure {
                id: RecordId(*id),
                reason: "bad".to_string(),
            })
            .collect(),
        last_key: None,
        status,
        elapsed: Duration::ZERO,
    }
}

#[cfg(test)]
fn report(workers: Vec<WorkerResult>) -> RunReport {
    let now = Utc::now();
    RunReport {
        run_id: RunId::new(&now),
        started_at: now,
        finished_at: now,
        workers,
    }
}

#[test]
fn verdict_clean() {
    let found = report(vec![
        result(0, 100, &[], WorkerStatus::Completed),
        result(1, 100, &[], WorkerStatus::Completed),
    ]);
    assert_eq!(found.verdict(), Verdict::Clean);
    assert_eq!(found.processed(), 200);
    assert!(found.retry_plan().is_empty());
}

#[test]
fn verdict_empty_run_is_clean() {
    assert_eq!(report(Vec::new()).verdict(), Verdict::Clean);
}

#[test]
fn verdict_partial_on_record_failures() {
    let found = report(vec![
        result(0, 97, &[3, 50, 77], WorkerStatus::Completed),
        result(1, 100, &[], WorkerStatus::Completed),
    ]);
    assert_eq!(found.verdict(), Verdict::Partial);
    assert_eq!(found.failed(), 3);
    assert_eq!(found.workers[0].status, WorkerStatus::Completed);
}

#[test]
fn verdict_failed_when_nothing_processed() {
    let found = report(vec![
        result(0, 0, &[], WorkerStatus::CrashedEarly("gone".to_string())),
        result(1, 0, &[150], WorkerStatus::Completed),
    ]);
    assert_eq!(found.verdict(), Verdict::Failed);
}

#[test]
fn retry_plan_collects_unfinished_and_failed() {
    let found = report(vec![
        result(0, 97, &[3, 50, 77], WorkerStatus::Completed),
        result(1, 12, &[105], WorkerStatus::CrashedEarly("gone".to_string())),
        result(2, 40, &[], WorkerStatus::Interrupted),
    ])
    .retry_plan();

    assert_eq!(
        found.failed_ids,
        vec![RecordId(3), RecordId(50), RecordId(77)]
    );
    assert_eq!(found.batches.len(), 2);

    let descriptors = found.into_descriptors(WorkerCount::new(2).unwrap());
    // Two id chunks of the three failed ids, then the two unfinished ranges.
    assert_eq!(descriptors.len(), 4);
    assert!(matches!(descriptors[0], BatchDescriptor::IdSet(_)));
    assert!(matches!(descriptors[3], BatchDescriptor::Range(_)));
}

#[test]
fn report_serializes_to_json() {
    let found = report(vec![result(
        0,
        1,
        &[],
        WorkerStatus::CrashedEarly("lost connection".to_string()),
    )]);
    let json = found.to_json().unwrap();
    assert!(json.contains(r#""status":"CrashedEarly","reason":"lost connection""#));
    let back: RunReport = serde_json::from_str(&json).unwrap();
    assert_eq!(back, found);
}
