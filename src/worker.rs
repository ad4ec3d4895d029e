//! Definition of a sackfix worker.
//!
//! A worker owns exactly one [`BatchDescriptor`]. It opens its own
//! store handle, streams its batch through the fixer, and reports
//! back a [`WorkerResult`] no matter how it stops.

use std::panic::catch_unwind;
use std::panic::AssertUnwindSafe;
use std::time::Instant;

use tracing::instrument;

use crate::batch::BatchDescriptor;
use crate::batch::IdSetBatch;
use crate::batch::RangeBatch;
use crate::batch::WorkerIndex;
use crate::errors::panic_message;
use crate::errors::prepend_tname;
use crate::errors::tracked_msg;
use crate::executor::Interrupt;
use crate::fix::FixFailure;
use crate::fix::Fixer;
use crate::fix::RetryPolicy;
use crate::report::RecordFailure;
use crate::report::WorkerResult;
use crate::report::WorkerStatus;
use crate::store::Keyed;
use crate::store::PageLoader;
use crate::store::Store;
use crate::store::StoreError;

/// Why a worker stopped before the end of its batch.
enum Stop {
    Interrupted,
    Crashed(String),
}

pub(crate) struct Worker<'a, X, R> {
    index: WorkerIndex,
    batch: BatchDescriptor,
    fixer: &'a X,
    /// Called once, on the worker's own thread.
    factory: &'a R,
    page_size: usize,
    retry: RetryPolicy,
    interrupt: &'a Interrupt,
}

impl<'a, X, R> Worker<'a, X, R> {
    pub(crate) fn new(
        index: WorkerIndex,
        batch: BatchDescriptor,
        fixer: &'a X,
        factory: &'a R,
        page_size: usize,
        retry: RetryPolicy,
        interrupt: &'a Interrupt,
    ) -> Self {
        Self {
            index,
            batch,
            fixer,
            factory,
            page_size,
            retry,
            interrupt,
        }
    }

    /// Main entry point for a worker thread.
    ///
    /// Never panics: a panic outside the fixer is caught and reported
    /// as [`WorkerStatus::CrashedEarly`] along with whatever progress
    /// was made before it.
    #[instrument(name = "worker_main", skip_all, fields(worker = self.index.0))]
    pub(crate) fn run<S>(self) -> WorkerResult
    where
        S: Store,
        X: Fixer<S>,
        R: Fn() -> Result<S, StoreError>,
    {
        let started = Instant::now();
        let mut result = WorkerResult::new(self.index, self.batch.clone());
        tracing::info!("Worker start on {}", self.batch);

        let outcome = catch_unwind(AssertUnwindSafe(|| self.process::<S>(&mut result)));
        result.status = match outcome {
            Ok(Ok(())) => WorkerStatus::Completed,
            Ok(Err(Stop::Interrupted)) => WorkerStatus::Interrupted,
            Ok(Err(Stop::Crashed(reason))) => WorkerStatus::CrashedEarly(reason),
            Err(payload) => {
                let msg = prepend_tname(panic_message(payload.as_ref()));
                WorkerStatus::CrashedEarly(msg.trim_end().to_string())
            }
        };
        result.elapsed = started.elapsed();

        match &result.status {
            WorkerStatus::Completed => tracing::info!(
                "Worker stop; {} processed, {} failed in {:?}",
                result.processed,
                result.failed.len(),
                result.elapsed
            ),
            WorkerStatus::Interrupted => tracing::warn!(
                "Worker interrupted after {} processed; last key {:?}",
                result.processed,
                result.last_key
            ),
            WorkerStatus::CrashedEarly(reason) => tracing::error!(
                "Worker crashed after {} processed; last key {:?}: {reason}",
                result.processed,
                result.last_key
            ),
        }
        result
    }

    fn process<S>(&self, result: &mut WorkerResult) -> Result<(), Stop>
    where
        S: Store,
        X: Fixer<S>,
        R: Fn() -> Result<S, StoreError>,
    {
        // Never reuse a handle from outside this thread.
        let mut store = (self.factory)()
            .map_err(|err| Stop::Crashed(tracked_msg(&format!("unable to open store: {err}"))))?;

        match &self.batch {
            BatchDescriptor::Range(range) => self.process_range(&mut store, range, result),
            BatchDescriptor::IdSet(batch) => self.process_ids(&mut store, batch, result),
        }
    }

    fn process_range<S>(
        &self,
        store: &mut S,
        range: &RangeBatch,
        result: &mut WorkerResult,
    ) -> Result<(), Stop>
    where
        S: Store,
        X: Fixer<S>,
    {
        let mut loader = PageLoader::new(*range, self.page_size);
        // The interrupt is checked per record only, so a batch whose
        // records were all attempted still completes.
        loop {
            let page = loader.next_batch(store).map_err(|err| {
                Stop::Crashed(tracked_msg(&format!(
                    "unable to fetch page after {:?}: {err}",
                    result.last_key
                )))
            })?;
            let Some(page) = page else {
                return Ok(());
            };
            tracing::trace!("Processing page of {} records", page.len());
            for record in &page {
                self.check_interrupt()?;
                self.fix_one(store, record, result);
            }
        }
    }

    fn process_ids<S>(
        &self,
        store: &mut S,
        batch: &IdSetBatch,
        result: &mut WorkerResult,
    ) -> Result<(), Stop>
    where
        S: Store,
        X: Fixer<S>,
    {
        for id in &batch.ids {
            self.check_interrupt()?;
            let record = store.fetch_by_id(*id).map_err(|err| {
                Stop::Crashed(tracked_msg(&format!("unable to fetch record {id}: {err}")))
            })?;
            match record {
                Some(record) => self.fix_one(store, &record, result),
                None => {
                    tracing::warn!("Record {id} no longer exists");
                    result.last_key = Some(*id);
                    result.failed.push(RecordFailure {
                        id: *id,
                        reason: "record not found".to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Run the fixer on one record, retrying transient failures.
    ///
    /// Failures, including panics inside the fixer, are recorded and
    /// do not stop the batch.
    fn fix_one<S>(&self, store: &mut S, record: &S::Record, result: &mut WorkerResult)
    where
        S: Store,
        X: Fixer<S>,
    {
        let id = record.id();
        result.last_key = Some(id);

        let res = self.retry.run(|| {
            catch_unwind(AssertUnwindSafe(|| self.fixer.fix(store, record))).unwrap_or_else(
                |payload| {
                    Err(FixFailure::permanent(format!(
                        "fixer panicked: {}",
                        panic_message(payload.as_ref())
                    )))
                },
            )
        });

        match res {
            Ok(()) => result.processed += 1,
            Err(failure) => {
                tracing::warn!("Unable to fix record {id}: {failure}");
                result.failed.push(RecordFailure {
                    id,
                    reason: failure.reason().to_string(),
                });
            }
        }
    }

    fn check_interrupt(&self) -> Result<(), Stop> {
        if self.interrupt.is_triggered() {
            Err(Stop::Interrupted)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use super::*;
    use crate::batch::RecordId;
    use crate::store::testing::MemRecord;
    use crate::store::testing::MemStore;

    fn range(start: i64, stop: i64) -> BatchDescriptor {
        BatchDescriptor::Range(RangeBatch {
            start: RecordId(start),
            stop: RecordId(stop),
        })
    }

    fn no_retry() -> RetryPolicy {
        RetryPolicy::none()
    }

    #[test]
    fn range_batch_visits_in_ascending_order() {
        let source = MemStore::new([5, 1, 9, 3, 7, 11]);
        let factory = || Ok::<_, StoreError>(source.handle());
        let seen = Mutex::new(Vec::new());
        let fixer = |_: &mut MemStore, record: &MemRecord| -> Result<(), FixFailure> {
            seen.lock().unwrap().push(record.id.0);
            Ok(())
        };
        let interrupt = Interrupt::default();

        let found = Worker::new(
            WorkerIndex(0),
            range(2, 9),
            &fixer,
            &factory,
            2,
            no_retry(),
            &interrupt,
        )
        .run();

        assert_eq!(found.status, WorkerStatus::Completed);
        assert_eq!(found.processed, 4);
        assert_eq!(found.last_key, Some(RecordId(9)));
        assert_eq!(*seen.lock().unwrap(), vec![3, 5, 7, 9]);
    }

    #[test]
    fn record_failures_do_not_stop_the_batch() {
        let source = MemStore::new(1..=100);
        let factory = || Ok::<_, StoreError>(source.handle());
        let fixer = |_: &mut MemStore, record: &MemRecord| -> Result<(), FixFailure> {
            match record.id.0 {
                13 | 42 => Err(FixFailure::permanent("amount mismatch")),
                77 => panic!("fixer blew up"),
                _ => Ok(()),
            }
        };
        let interrupt = Interrupt::default();

        let found = Worker::new(
            WorkerIndex(1),
            range(1, 100),
            &fixer,
            &factory,
            10,
            no_retry(),
            &interrupt,
        )
        .run();

        assert_eq!(found.status, WorkerStatus::Completed);
        assert_eq!(found.processed, 97);
        let failed: BTreeMap<_, _> = found
            .failed
            .iter()
            .map(|f| (f.id.0, f.reason.as_str()))
            .collect();
        assert_eq!(failed.len(), 3);
        assert_eq!(failed[&13], "amount mismatch");
        assert_eq!(failed[&42], "amount mismatch");
        assert_eq!(failed[&77], "fixer panicked: fixer blew up");
    }

    #[test]
    fn lost_store_crashes_with_partial_progress() {
        let mut source = MemStore::new(1..=50);
        source.fail_after_pages = Some(2);
        let factory = || Ok::<_, StoreError>(source.handle());
        let fixer = |_: &mut MemStore, _: &MemRecord| -> Result<(), FixFailure> { Ok(()) };
        let interrupt = Interrupt::default();

        let found = Worker::new(
            WorkerIndex(0),
            range(1, 50),
            &fixer,
            &factory,
            10,
            no_retry(),
            &interrupt,
        )
        .run();

        assert_eq!(found.processed, 20);
        assert_eq!(found.last_key, Some(RecordId(20)));
        match found.status {
            WorkerStatus::CrashedEarly(reason) => assert!(reason.contains("connection reset")),
            status => panic!("expected crash, got {status:?}"),
        }
    }

    #[test]
    fn factory_failure_is_a_crash() {
        let factory = || -> Result<MemStore, StoreError> {
            Err(StoreError::Connect("too many connections".to_string()))
        };
        let fixer = |_: &mut MemStore, _: &MemRecord| -> Result<(), FixFailure> { Ok(()) };
        let interrupt = Interrupt::default();

        let found = Worker::new(
            WorkerIndex(2),
            range(1, 10),
            &fixer,
            &factory,
            10,
            no_retry(),
            &interrupt,
        )
        .run();

        assert_eq!(found.processed, 0);
        assert!(matches!(found.status, WorkerStatus::CrashedEarly(ref r) if r.contains("too many connections")));
    }

    #[test]
    fn id_set_visits_in_given_order_and_flags_missing() {
        let source = MemStore::new([1, 2, 3, 4]);
        let factory = || Ok::<_, StoreError>(source.handle());
        let seen = Mutex::new(Vec::new());
        let fixer = |_: &mut MemStore, record: &MemRecord| -> Result<(), FixFailure> {
            seen.lock().unwrap().push(record.id.0);
            Ok(())
        };
        let interrupt = Interrupt::default();
        let batch = BatchDescriptor::IdSet(IdSetBatch {
            ids: vec![RecordId(4), RecordId(8), RecordId(2)],
        });

        let found = Worker::new(
            WorkerIndex(0),
            batch,
            &fixer,
            &factory,
            10,
            no_retry(),
            &interrupt,
        )
        .run();

        assert_eq!(found.status, WorkerStatus::Completed);
        assert_eq!(*seen.lock().unwrap(), vec![4, 2]);
        assert_eq!(
            found.failed,
            vec![RecordFailure {
                id: RecordId(8),
                reason: "record not found".to_string()
            }]
        );
    }

    #[test]
    fn transient_failures_are_retried() {
        let source = MemStore::new([1, 2]);
        let factory = || Ok::<_, StoreError>(source.handle());
        let attempts = Mutex::new(BTreeMap::<i64, u32>::new());
        let fixer = |_: &mut MemStore, record: &MemRecord| -> Result<(), FixFailure> {
            let mut attempts = attempts.lock().unwrap();
            let n = attempts.entry(record.id.0).or_default();
            *n += 1;
            if *n < 2 {
                Err(FixFailure::transient("database is locked"))
            } else {
                Ok(())
            }
        };
        let interrupt = Interrupt::default();
        let retry = RetryPolicy {
            max_attempts: 3,
            backoff: std::time::Duration::ZERO,
        };

        let found = Worker::new(
            WorkerIndex(0),
            range(1, 2),
            &fixer,
            &factory,
            10,
            retry,
            &interrupt,
        )
        .run();

        assert_eq!(found.processed, 2);
        assert!(found.failed.is_empty());
        assert_eq!(attempts.lock().unwrap()[&1], 2);
    }

    #[test]
    fn interrupt_on_last_record_still_completes() {
        let source = MemStore::new([1, 2, 3]);
        let factory = || Ok::<_, StoreError>(source.handle());
        let id_set = BatchDescriptor::IdSet(IdSetBatch {
            ids: vec![RecordId(1), RecordId(2), RecordId(3)],
        });

        // A short page, a full page with an empty one after it, and an
        // id list.
        for (batch, page_size) in [(range(1, 3), 10), (range(1, 10), 3), (id_set, 10)] {
            let interrupt = Interrupt::default();
            let fixer = |_: &mut MemStore, record: &MemRecord| -> Result<(), FixFailure> {
                if record.id.0 == 3 {
                    interrupt.trigger();
                }
                Ok(())
            };

            let found = Worker::new(
                WorkerIndex(0),
                batch,
                &fixer,
                &factory,
                page_size,
                no_retry(),
                &interrupt,
            )
            .run();

            assert_eq!(found.status, WorkerStatus::Completed);
            assert_eq!(found.processed, 3);
        }
    }

    #[test]
    fn interrupted_worker_stops() {
        let source = MemStore::new(1..=10);
        let factory = || Ok::<_, StoreError>(source.handle());
        let interrupt = Interrupt::default();
        let fixer = |_: &mut MemStore, record: &MemRecord| -> Result<(), FixFailure> {
            if record.id.0 == 3 {
                interrupt.trigger();
            }
            Ok(())
        };

        let found = Worker::new(
            WorkerIndex(0),
            range(1, 10),
            &fixer,
            &factory,
            4,
            no_retry(),
            &interrupt,
        )
        .run();

        assert_eq!(found.status, WorkerStatus::Interrupted);
        assert_eq!(found.processed, 3);
        assert_eq!(found.last_key, Some(RecordId(3)));
    }
}
