//! Access to the table being fixed.
//!
//! A [`Store`] is one handle to the backing database, bound to one
//! population (table plus filter). Every worker builds its own store
//! through the resource factory; stores are never shared between
//! workers and don't need to be [`Send`].

use thiserror::Error;

use crate::batch::KeySpace;
use crate::batch::RangeBatch;
use crate::batch::RecordId;

pub mod sqlite;

pub use sqlite::SqliteRecord;
pub use sqlite::SqliteStore;
pub use sqlite::TableSpec;

/// Anything with a primary key.
pub trait Keyed {
    fn id(&self) -> RecordId;
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("unable to migrate schema: {0}")]
    Migration(#[from] rusqlite_migration::Error),
    #[error("bad row: {0}")]
    BadRow(String),
    #[error("unable to connect: {0}")]
    Connect(String),
}

/// One connection to the population being fixed.
pub trait Store {
    type Record: Keyed;

    /// Current min and max key of the population, or [`None`] if it
    /// has no rows.
    fn key_space(&mut self) -> Result<Option<KeySpace>, StoreError>;

    /// Ids of the population in key order, at most `limit` of them.
    ///
    /// Callers enforcing a budget should ask for one more than the
    /// budget to detect overflow.
    fn select_ids(&mut self, limit: usize) -> Result<Vec<RecordId>, StoreError>;

    /// Up to `limit` records of the population within `range` whose
    /// key is strictly greater than `after`, in ascending key order.
    fn fetch_page(
        &mut self,
        range: &RangeBatch,
        after: Option<RecordId>,
        limit: usize,
    ) -> Result<Vec<Self::Record>, StoreError>;

    /// A single record by key, regardless of the population filter.
    ///
    /// Returns [`None`] if the row no longer exists.
    fn fetch_by_id(&mut self, id: RecordId) -> Result<Option<Self::Record>, StoreError>;
}

enum Cursor<T> {
    /// We haven't started reading the range.
    Uninit,
    /// We should read after position T next.
    InProgress(T),
    /// We're done reading the range.
    Done,
}

/// Iterates a [`RangeBatch`] in pages so the whole range is never
/// loaded at once.
///
/// Each page is a fresh keyset query starting after the last key of
/// the previous page, so no transaction or statement is held open
/// between pages.
pub(crate) struct PageLoader {
    range: RangeBatch,
    page_size: usize,
    cursor: Cursor<RecordId>,
}

impl PageLoader {
    pub(crate) fn new(range: RangeBatch, page_size: usize) -> Self {
        Self {
            range,
            page_size: page_size.max(1),
            cursor: Cursor::Uninit,
        }
    }

    /// Fetch the next page, or [`None`] once the range is exhausted.
    pub(crate) fn next_batch<S>(&mut self, store: &mut S) -> Result<Option<Vec<S::Record>>, StoreError>
    where
        S: Store,
    {
        let after = match self.cursor {
            Cursor::Uninit => None,
            Cursor::InProgress(key) => Some(key),
            Cursor::Done => return Ok(None),
        };

        let page = store.fetch_page(&self.range, after, self.page_size)?;
        self.cursor = match page.last() {
            // A short page or reaching the end of the range means
            // there's nothing more to read. Checking `stop` also
            // keeps us from computing `stop + 1`.
            Some(last) if page.len() == self.page_size && last.id() < self.range.stop => {
                Cursor::InProgress(last.id())
            }
            Some(_) | None => Cursor::Done,
        };
        if page.is_empty() {
            Ok(None)
        } else {
            Ok(Some(page))
        }
    }
}

/// In-memory [`Store`] used by tests across the crate.
#[cfg(test)]
pub(crate) mod testing {
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    pub(crate) struct MemRecord {
        pub(crate) id: RecordId,
        pub(crate) value: i64,
    }

    impl Keyed for MemRecord {
        fn id(&self) -> RecordId {
            self.id
        }
    }

    /// Read-only view over a shared map; counts page fetches.
    pub(crate) struct MemStore {
        pub(crate) rows: Arc<BTreeMap<i64, i64>>,
        pub(crate) pages: Arc<AtomicUsize>,
        /// Fail page fetches once this many pages have been served.
        pub(crate) fail_after_pages: Option<usize>,
    }

    impl MemStore {
        pub(crate) fn new(rows: impl IntoIterator<Item = i64>) -> Self {
            Self {
                rows: Arc::new(rows.into_iter().map(|id| (id, 0)).collect()),
                pages: Arc::new(AtomicUsize::new(0)),
                fail_after_pages: None,
            }
        }

        pub(crate) fn handle(&self) -> Self {
            Self {
                rows: self.rows.clone(),
                pages: self.pages.clone(),
                fail_after_pages: self.fail_after_pages,
            }
        }
    }

    impl Store for MemStore {
        type Record = MemRecord;

        fn key_space(&mut self) -> Result<Option<KeySpace>, StoreError> {
            let min = self.rows.keys().next().copied();
            let max = self.rows.keys().next_back().copied();
            Ok(min
                .zip(max)
                .map(|(min, max)| KeySpace::new(RecordId(min), RecordId(max)).unwrap()))
        }

        fn select_ids(&mut self, limit: usize) -> Result<Vec<RecordId>, StoreError> {
            Ok(self.rows.keys().take(limit).copied().map(RecordId).collect())
        }

        fn fetch_page(
            &mut self,
            range: &RangeBatch,
            after: Option<RecordId>,
            limit: usize,
        ) -> Result<Vec<MemRecord>, StoreError> {
            let served = self.pages.fetch_add(1, Ordering::SeqCst);
            if self.fail_after_pages.is_some_and(|n| served >= n) {
                return Err(StoreError::Connect("connection reset".to_string()));
            }
            let lower = after.map_or(range.start.0, |after| after.0 + 1);
            Ok(self
                .rows
                .range(lower..=range.stop.0)
                .take(limit)
                .map(|(id, value)| MemRecord {
                    id: RecordId(*id),
                    value: *value,
                })
                .collect())
        }

        fn fetch_by_id(&mut self, id: RecordId) -> Result<Option<MemRecord>, StoreError> {
            Ok(self.rows.get(&id.0).map(|value| MemRecord { id, value: *value }))
        }
    }
}

#[cfg(test)]
fn drain(loader: &mut PageLoader, store: &mut testing::MemStore) -> Vec<Vec<i64>> {
    let mut pages = Vec::new();
    while let Some(page) = loader.next_batch(store).unwrap() {
        pages.push(page.iter().map(|r| r.id.0).collect());
    }
    pages
}

#[test]
fn page_loader_pages_in_key_order() {
    let mut store = testing::MemStore::new([1, 2, 3, 5, 8, 13, 21, 34]);
    let range = RangeBatch {
        start: RecordId(2),
        stop: RecordId(21),
    };
    let mut loader = PageLoader::new(range, 2);
    let found = drain(&mut loader, &mut store);
    assert_eq!(found, vec![vec![2, 3], vec![5, 8], vec![13, 21]]);
}

#[test]
fn page_loader_stops_on_short_page() {
    let mut store = testing::MemStore::new([1, 2, 3, 4, 5]);
    let range = RangeBatch {
        start: RecordId(1),
        stop: RecordId(100),
    };
    let mut loader = PageLoader::new(range, 3);
    assert_eq!(drain(&mut loader, &mut store), vec![vec![1, 2, 3], vec![4, 5]]);
    // One fetch per page, no trailing empty fetch after the short page.
    assert_eq!(store.pages.load(std::sync::atomic::Ordering::SeqCst), 2);
}

#[test]
fn page_loader_handles_range_ending_at_max_key() {
    let mut store = testing::MemStore::new([i64::MAX - 1, i64::MAX]);
    let range = RangeBatch {
        start: RecordId(i64::MAX - 1),
        stop: RecordId(i64::MAX),
    };
    let mut loader = PageLoader::new(range, 2);
    assert_eq!(
        drain(&mut loader, &mut store),
        vec![vec![i64::MAX - 1, i64::MAX]]
    );
}

#[test]
fn page_loader_empty_range() {
    let mut store = testing::MemStore::new([1, 50]);
    let range = RangeBatch {
        start: RecordId(10),
        stop: RecordId(20),
    };
    let mut loader = PageLoader::new(range, 10);
    assert!(drain(&mut loader, &mut store).is_empty());
}
