//! Chunking an explicit list of ids.
//!
//! Use this when the population can't be expressed as a key range
//! (e.g. it's filtered on a non-key column and the matching rows are
//! sparse). It requires the whole id list in memory, so it is guarded
//! by an [`IdBudget`]. Populations over budget must be processed with
//! [`super::range::partition`] instead.

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use super::IdSetBatch;
use super::RecordId;
use super::WorkerCount;

/// Maximum number of ids the id-set strategy may materialize.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdBudget(pub usize);

impl Default for IdBudget {
    fn default() -> Self {
        Self(1_000_000)
    }
}

impl std::fmt::Display for IdBudget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl IdBudget {
    pub fn check(&self, len: usize) -> Result<(), ChunkError> {
        if len > self.0 {
            Err(ChunkError::OverBudget { len, budget: *self })
        } else {
            Ok(())
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChunkError {
    #[error(
        "id list has {len} ids (or more) which exceeds the budget of {budget}; \
         use a key range population instead"
    )]
    OverBudget { len: usize, budget: IdBudget },
}

/// Slice `ids` into at most `workers` batches, in order.
///
/// The batch size is `len / workers + 1`. The `+ 1` keeps integer
/// truncation from producing a small extra batch (401 ids over 4
/// workers is 4 batches of up to 101, not 5 batches of 100). The last
/// batch may be shorter.
///
/// Batches are split off the back of `ids` and its buffer is shrunk
/// after each split, so at most one batch is held twice at a time.
/// The first batch reuses the original buffer.
pub fn chunk(ids: Vec<RecordId>, workers: WorkerCount) -> Vec<IdSetBatch> {
    let batch_size = ids.len() / workers.get() + 1;
    let count = ids.len().div_ceil(batch_size);

    let mut rest = ids;
    let mut batches = Vec::with_capacity(count);
    for i in (1..count).rev() {
        let tail = rest.split_off(i * batch_size);
        rest.shrink_to_fit();
        batches.push(IdSetBatch { ids: tail });
    }
    if !rest.is_empty() {
        rest.shrink_to_fit();
        batches.push(IdSetBatch { ids: rest });
    }
    batches.reverse();
    batches
}

#[cfg(test)]
fn ids(range: std::ops::Range<i64>) -> Vec<RecordId> {
    range.map(RecordId).collect()
}

#[cfg(test)]
fn workers(count: usize) -> WorkerCount {
    WorkerCount::new(count).unwrap()
}

#[test]
fn no_remainder_batch() {
    let found = chunk(ids(0..401), workers(4));
    let sizes: Vec<_> = found.iter().map(|b| b.ids.len()).collect();
    assert_eq!(sizes, vec![101, 101, 101, 98]);
}

#[test]
fn concatenation_preserves_order() {
    let input: Vec<_> = [9, 3, 27, 1, 4, 8, 2].into_iter().map(RecordId).collect();
    let found = chunk(input.clone(), workers(3));
    let joined: Vec<_> = found.into_iter().flat_map(|b| b.ids).collect();
    assert_eq!(joined, input);
}

#[test]
fn never_more_batches_than_workers() {
    for len in 1..200 {
        for count in 1..=12 {
            let found = chunk(ids(0..len), workers(count));
            assert!(found.len() <= count, "{len} ids over {count} workers");
            assert!(found.iter().all(|b| !b.ids.is_empty()));
            assert_eq!(found.iter().map(|b| b.ids.len()).sum::<usize>(), len as usize);
        }
    }
}

#[test]
fn batches_hold_no_spare_capacity() {
    let found = chunk(ids(0..1000), workers(3));
    let sizes: Vec<_> = found.iter().map(|b| b.ids.len()).collect();
    assert_eq!(sizes, vec![334, 334, 332]);
    assert!(found.iter().all(|b| b.ids.capacity() == b.ids.len()));
    assert_eq!(found[1].ids.first(), Some(&RecordId(334)));
}

#[test]
fn empty_ids_has_no_batches() {
    assert!(chunk(Vec::new(), workers(4)).is_empty());
}

#[test]
fn budget_check() {
    let budget = IdBudget(10);
    assert_eq!(budget.check(10), Ok(()));
    assert_eq!(
        budget.check(11),
        Err(ChunkError::OverBudget { len: 11, budget })
    );
}
