//! Fan a list of batches out to one worker thread each.
//!
//! Workers share nothing but read-only references to the fixer, the
//! resource factory and the [`Interrupt`] flag. The only
//! synchronization point is joining them all at the end.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::Utc;
use tracing::instrument;

use crate::batch::BatchDescriptor;
use crate::batch::WorkerIndex;
use crate::config::FixConfig;
use crate::errors::panic_message;
use crate::fix::Fixer;
use crate::fix::RetryPolicy;
use crate::report::RunId;
use crate::report::RunReport;
use crate::report::WorkerResult;
use crate::store::Store;
use crate::store::StoreError;
use crate::worker::Worker;

/// Asks running workers to stop after their current record.
///
/// Clone it and trigger it from anywhere, e.g. a signal handler.
#[derive(Debug, Clone, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    pub fn trigger(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Fixed-size worker pool; one thread per batch descriptor.
pub struct Executor {
    page_size: usize,
    retry: RetryPolicy,
    interrupt: Interrupt,
}

impl Executor {
    pub fn new(config: &FixConfig) -> Self {
        Self {
            page_size: config.page_size,
            retry: config.retry,
            interrupt: Interrupt::default(),
        }
    }

    /// Handle to stop this executor's workers early.
    pub fn interrupt_handle(&self) -> Interrupt {
        self.interrupt.clone()
    }

    /// Run every descriptor on its own worker thread and block until
    /// they have all stopped.
    ///
    /// `factory` is called once per worker, on that worker's thread,
    /// so store handles never cross threads. Worker results are in
    /// descriptor order.
    #[instrument(name = "execute", skip_all, fields(batches = descriptors.len()))]
    pub fn execute<S, X, R>(
        &self,
        descriptors: Vec<BatchDescriptor>,
        fixer: &X,
        factory: &R,
    ) -> RunReport
    where
        S: Store,
        X: Fixer<S>,
        R: Fn() -> Result<S, StoreError> + Sync,
    {
        let started_at = Utc::now();
        let run_id = RunId::new(&started_at);
        tracing::info!("Run {run_id} start with {} workers", descriptors.len());

        let parent = tracing::Span::current();
        let workers = std::thread::scope(|scope| {
            let handles: Vec<_> = descriptors
                .into_iter()
                .enumerate()
                .map(|(i, batch)| {
                    let index = WorkerIndex(i);
                    let worker = Worker::new(
                        index,
                        batch.clone(),
                        fixer,
                        factory,
                        self.page_size,
                        self.retry,
                        &self.interrupt,
                    );
                    let parent = parent.clone();
                    let handle = std::thread::Builder::new()
                        .name(format!("sackfix-worker-{i}"))
                        .spawn_scoped(scope, move || parent.in_scope(|| worker.run::<S>()));
                    (index, batch, handle)
                })
                .collect();

            handles
                .into_iter()
                .map(|(index, batch, handle)| match handle {
                    Ok(handle) => handle.join().unwrap_or_else(|payload| {
                        // Workers catch their own panics, so this is
                        // only reachable if logging itself panicked.
                        WorkerResult::new(index, batch).crashed(panic_message(payload.as_ref()))
                    }),
                    Err(err) => {
                        tracing::error!("Unable to spawn worker {index}: {err}");
                        WorkerResult::new(index, batch)
                            .crashed(format!("unable to spawn worker thread: {err}"))
                    }
                })
                .collect::<Vec<_>>()
        });

        let report = RunReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            workers,
        };
        tracing::info!(
            "Run {} stop; {} processed, {} failed, {} unfinished workers; {}",
            report.run_id,
            report.processed(),
            report.failed(),
            report.unfinished().count(),
            report.verdict().as_str()
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use super::*;
    use crate::batch::partition;
    use crate::batch::KeySpace;
    use crate::batch::RecordId;
    use crate::batch::WorkerCount;
    use crate::fix::FixFailure;
    use crate::report::Verdict;
    use crate::report::WorkerStatus;
    use crate::store::testing::MemRecord;
    use crate::store::testing::MemStore;

    fn descriptors(min: i64, max: i64, workers: usize) -> Vec<BatchDescriptor> {
        partition(
            Some(KeySpace::new(RecordId(min), RecordId(max)).unwrap()),
            WorkerCount::new(workers).unwrap(),
        )
        .into_iter()
        .map(BatchDescriptor::from)
        .collect()
    }

    #[test]
    fn every_record_fixed_exactly_once() {
        let source = MemStore::new((1..=1000).filter(|id| id % 7 != 0));
        let factory = || Ok::<_, StoreError>(source.handle());
        let fixed = Mutex::new(BTreeMap::<i64, (u32, String)>::new());
        let fixer = |_: &mut MemStore, record: &MemRecord| -> Result<(), FixFailure> {
            let thread = std::thread::current().name().unwrap_or_default().to_string();
            let mut fixed = fixed.lock().unwrap();
            let entry = fixed.entry(record.id.0).or_insert((0, thread));
            entry.0 += 1;
            Ok(())
        };

        let executor = Executor::new(&FixConfig::default());
        let report = executor.execute(descriptors(1, 1000, 4), &fixer, &factory);

        assert_eq!(report.verdict(), Verdict::Clean);
        assert_eq!(report.workers.len(), 4);
        let fixed = fixed.into_inner().unwrap();
        assert_eq!(fixed.len(), source.rows.len());
        assert!(fixed.values().all(|(count, _)| *count == 1));
        // Record 1 lands in the first batch, record 999 in the last.
        assert_eq!(fixed[&1].1, "sackfix-worker-0");
        assert_eq!(fixed[&999].1, "sackfix-worker-3");
        assert_eq!(report.processed(), source.rows.len() as u64);
    }

    #[test]
    fn factory_called_once_on_each_worker_thread() {
        let source = MemStore::new(1..=100);
        let opened_on = Mutex::new(Vec::new());
        let factory = || {
            let thread = std::thread::current().name().unwrap_or_default().to_string();
            opened_on.lock().unwrap().push(thread);
            Ok::<_, StoreError>(source.handle())
        };
        let fixer = |_: &mut MemStore, _: &MemRecord| -> Result<(), FixFailure> { Ok(()) };

        let report =
            Executor::new(&FixConfig::default()).execute(descriptors(1, 100, 4), &fixer, &factory);

        assert_eq!(report.verdict(), Verdict::Clean);
        let mut found = opened_on.into_inner().unwrap();
        found.sort();
        assert_eq!(
            found,
            vec![
                "sackfix-worker-0",
                "sackfix-worker-1",
                "sackfix-worker-2",
                "sackfix-worker-3",
            ]
        );
    }

    #[test]
    fn one_worker_with_failures_still_completes() {
        let source = MemStore::new(1..=400);
        let factory = || Ok::<_, StoreError>(source.handle());
        let fixer = |_: &mut MemStore, record: &MemRecord| -> Result<(), FixFailure> {
            match record.id.0 {
                110 | 150 | 190 => Err(FixFailure::permanent(format!("bad fee on {}", record.id))),
                _ => Ok(()),
            }
        };

        let report = Executor::new(&FixConfig::default()).execute(
            descriptors(1, 400, 4),
            &fixer,
            &factory,
        );

        let second = &report.workers[1];
        assert_eq!(second.status, WorkerStatus::Completed);
        assert_eq!(second.processed, 97);
        let failed: Vec<_> = second.failed.iter().map(|f| (f.id.0, f.reason.clone())).collect();
        assert_eq!(
            failed,
            vec![
                (110, "bad fee on 110".to_string()),
                (150, "bad fee on 150".to_string()),
                (190, "bad fee on 190".to_string()),
            ]
        );
        for other in [0, 2, 3] {
            assert_eq!(report.workers[other].processed, 100);
            assert!(report.workers[other].failed.is_empty());
        }
        assert_eq!(report.verdict(), Verdict::Partial);
    }

    #[test]
    fn crashed_worker_does_not_affect_others() {
        let source = MemStore::new(1..=40);
        let opened = std::sync::atomic::AtomicUsize::new(0);
        // The third handle handed out is broken.
        let factory = || -> Result<MemStore, StoreError> {
            if opened.fetch_add(1, Ordering::SeqCst) == 2 {
                Err(StoreError::Connect("broken pipe".to_string()))
            } else {
                Ok(source.handle())
            }
        };
        let fixer = |_: &mut MemStore, _: &MemRecord| -> Result<(), FixFailure> { Ok(()) };

        let report =
            Executor::new(&FixConfig::default()).execute(descriptors(1, 40, 4), &fixer, &factory);

        assert_eq!(report.unfinished().count(), 1);
        assert_eq!(report.processed(), 30);
        assert_eq!(report.verdict(), Verdict::Partial);
        let plan = report.retry_plan();
        assert_eq!(plan.batches.len(), 1);
        assert!(plan.failed_ids.is_empty());
    }

    #[test]
    fn interrupted_before_start() {
        let source = MemStore::new(1..=40);
        let factory = || Ok::<_, StoreError>(source.handle());
        let fixer = |_: &mut MemStore, _: &MemRecord| -> Result<(), FixFailure> { Ok(()) };

        let executor = Executor::new(&FixConfig::default());
        executor.interrupt_handle().trigger();
        let report = executor.execute(descriptors(1, 40, 2), &fixer, &factory);

        assert!(report
            .workers
            .iter()
            .all(|w| w.status == WorkerStatus::Interrupted));
        assert_eq!(report.processed(), 0);
        assert_eq!(report.verdict(), Verdict::Failed);
    }

    #[test]
    fn no_descriptors_is_an_empty_clean_run() {
        let factory = || Ok::<_, StoreError>(MemStore::new([]));
        let fixer = |_: &mut MemStore, _: &MemRecord| -> Result<(), FixFailure> { Ok(()) };

        let report = Executor::new(&FixConfig::default()).execute(Vec::new(), &fixer, &factory);

        assert!(report.workers.is_empty());
        assert_eq!(report.verdict(), Verdict::Clean);
    }
}
