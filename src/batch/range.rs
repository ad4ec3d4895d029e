//! Contiguous key range partitioning.

use super::KeySpace;
use super::RangeBatch;
use super::RecordId;
use super::WorkerCount;

/// Cut a key space into at most `workers` contiguous, disjoint
/// ranges that cover it exactly.
///
/// All ranges have the same width except the last one, which absorbs
/// the remainder. If there are fewer keys than workers, fewer ranges
/// are returned (one key each) rather than emitting empty ones.
///
/// `None` means the population is empty and produces no batches.
pub fn partition(space: Option<KeySpace>, workers: WorkerCount) -> Vec<RangeBatch> {
    let Some(space) = space else {
        return Vec::new();
    };

    // Widen so `i64::MIN..=i64::MAX` doesn't overflow.
    let min = i128::from(space.min().0);
    let max = i128::from(space.max().0);
    let span = max - min + 1;
    let effective = span.min(workers.get() as i128);
    let stride = span / effective;

    (0..effective)
        .map(|i| {
            let start = min + i * stride;
            let stop = if i == effective - 1 {
                max
            } else {
                start + stride - 1
            };
            // Both bounds lie within `[min, max]`, so they fit.
            RangeBatch {
                start: RecordId(start as i64),
                stop: RecordId(stop as i64),
            }
        })
        .collect()
}

#[cfg(test)]
fn space(min: i64, max: i64) -> Option<KeySpace> {
    Some(KeySpace::new(RecordId(min), RecordId(max)).unwrap())
}

#[cfg(test)]
fn workers(count: usize) -> WorkerCount {
    WorkerCount::new(count).unwrap()
}

#[cfg(test)]
fn bounds(batches: &[RangeBatch]) -> Vec<(i64, i64)> {
    batches.iter().map(|b| (b.start.0, b.stop.0)).collect()
}

#[cfg(test)]
fn assert_exact_cover(batches: &[RangeBatch], min: i64, max: i64) {
    assert_eq!(batches.first().map(|b| b.start.0), Some(min));
    assert_eq!(batches.last().map(|b| b.stop.0), Some(max));
    for batch in batches {
        assert!(batch.start <= batch.stop, "empty batch {batch:?}");
    }
    for pair in batches.windows(2) {
        assert_eq!(pair[0].stop.0 + 1, pair[1].start.0, "gap or overlap in {pair:?}");
    }
}

#[test]
fn even_split() {
    let found = partition(space(1, 400), workers(4));
    assert_eq!(
        bounds(&found),
        vec![(1, 100), (101, 200), (201, 300), (301, 400)]
    );
}

#[test]
fn last_batch_absorbs_remainder() {
    let found = partition(space(1, 401), workers(4));
    assert_eq!(
        bounds(&found),
        vec![(1, 100), (101, 200), (201, 300), (301, 401)]
    );
}

#[test]
fn single_key_is_single_batch() {
    let found = partition(space(5, 5), workers(4));
    assert_eq!(bounds(&found), vec![(5, 5)]);
}

#[test]
fn fewer_keys_than_workers_reduces_workers() {
    let found = partition(space(10, 12), workers(8));
    assert_eq!(bounds(&found), vec![(10, 10), (11, 11), (12, 12)]);
}

#[test]
fn empty_population_has_no_batches() {
    assert!(partition(None, workers(4)).is_empty());
}

#[test]
fn one_worker_gets_everything() {
    let found = partition(space(-50, 73), workers(1));
    assert_eq!(bounds(&found), vec![(-50, 73)]);
}

#[test]
fn extremes_do_not_overflow() {
    let found = partition(space(i64::MIN, i64::MAX), workers(3));
    assert_eq!(found.len(), 3);
    assert_exact_cover(&found, i64::MIN, i64::MAX);
}

#[test]
fn covers_exactly_for_many_shapes() {
    for min in [-7_i64, 0, 1, 1_000] {
        for width in [0_i64, 1, 2, 3, 9, 10, 99, 1_001] {
            for count in 1..=9 {
                let max = min + width;
                let found = partition(space(min, max), workers(count));
                assert_eq!(found.len() as i64, (width + 1).min(count as i64));
                assert_exact_cover(&found, min, max);
            }
        }
    }
}
