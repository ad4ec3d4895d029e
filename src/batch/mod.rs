//! Splitting a population into per-worker batches.
//!
//! There are two strategies, picked by whether the population can be
//! described as a contiguous key range:
//!
//! - [`range::partition`] cuts a [`KeySpace`] into [`RangeBatch`]es.
//!   Nothing is materialized; each worker pages through its range.
//!
//! - [`id_set::chunk`] slices an already materialized list of ids
//!   into [`IdSetBatch`]es. Only use this when the list fits an
//!   [`IdBudget`].
//!
//! Either way the result is a [`Vec<BatchDescriptor>`] with one entry
//! per worker. Descriptors are disjoint and together cover the
//! population exactly once.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

pub mod id_set;
pub mod range;

pub use id_set::chunk;
pub use id_set::ChunkError;
pub use id_set::IdBudget;
pub use range::partition;

/// Primary key of a record.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct RecordId(pub i64);

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Total number of workers in a run.
///
/// Always at least 1.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct WorkerCount(usize);

impl WorkerCount {
    pub fn new(count: usize) -> Result<Self, PartitionError> {
        if count == 0 {
            Err(PartitionError::ZeroWorkers)
        } else {
            Ok(Self(count))
        }
    }

    pub fn get(&self) -> usize {
        self.0
    }
}

/// Four workers.
impl Default for WorkerCount {
    fn default() -> Self {
        Self(4)
    }
}

impl<'de> Deserialize<'de> for WorkerCount {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let count = usize::deserialize(deserializer)?;
        Self::new(count).map_err(serde::de::Error::custom)
    }
}

/// IDs a specific worker within a run.
///
/// The inner value will be below the run's [`WorkerCount`] and is the
/// position of the worker's descriptor.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerIndex(pub usize);

impl fmt::Display for WorkerIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Bounds of the key column at the time the run is planned.
///
/// `max` is the high-water mark of the key, not a row count. Gaps
/// from deleted rows are expected.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub struct KeySpace {
    min: RecordId,
    max: RecordId,
}

impl KeySpace {
    pub fn new(min: RecordId, max: RecordId) -> Result<Self, PartitionError> {
        if min > max {
            Err(PartitionError::InvertedRange { min, max })
        } else {
            Ok(Self { min, max })
        }
    }

    pub fn min(&self) -> RecordId {
        self.min
    }

    pub fn max(&self) -> RecordId {
        self.max
    }
}

impl<'de> Deserialize<'de> for KeySpace {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(rename = "KeySpace")]
        struct Bounds {
            min: RecordId,
            max: RecordId,
        }

        let Bounds { min, max } = Bounds::deserialize(deserializer)?;
        Self::new(min, max).map_err(serde::de::Error::custom)
    }
}

/// Inclusive range of keys one worker is responsible for.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeBatch {
    pub start: RecordId,
    pub stop: RecordId,
}

impl RangeBatch {
    pub fn contains(&self, id: RecordId) -> bool {
        self.start <= id && id <= self.stop
    }
}

/// Explicit list of ids one worker is responsible for.
///
/// Ids are visited in the order given.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdSetBatch {
    pub ids: Vec<RecordId>,
}

/// One worker's share of a population.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchDescriptor {
    Range(RangeBatch),
    IdSet(IdSetBatch),
}

impl From<RangeBatch> for BatchDescriptor {
    fn from(batch: RangeBatch) -> Self {
        Self::Range(batch)
    }
}

impl From<IdSetBatch> for BatchDescriptor {
    fn from(batch: IdSetBatch) -> Self {
        Self::IdSet(batch)
    }
}

impl fmt::Display for BatchDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Range(RangeBatch { start, stop }) => write!(f, "keys [{start}, {stop}]"),
            Self::IdSet(IdSetBatch { ids }) => write!(f, "{} ids", ids.len()),
        }
    }
}

/// Bad partitioning inputs.
///
/// These are programming errors and are reported before any worker
/// is started.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PartitionError {
    #[error("worker count must be at least 1")]
    ZeroWorkers,
    #[error("key space is inverted: min {min} > max {max}")]
    InvertedRange { min: RecordId, max: RecordId },
}

#[test]
fn worker_count_rejects_zero() {
    assert_eq!(WorkerCount::new(0), Err(PartitionError::ZeroWorkers));
    assert_eq!(WorkerCount::new(4).map(|c| c.get()), Ok(4));
}

#[test]
fn worker_count_deserialize_rejects_zero() {
    assert!(serde_json::from_str::<WorkerCount>("0").is_err());
    assert_eq!(
        serde_json::from_str::<WorkerCount>("3").unwrap(),
        WorkerCount::new(3).unwrap()
    );
}

#[test]
fn key_space_deserialize_rejects_inverted() {
    let found = serde_json::from_str::<KeySpace>(r#"{"min":10,"max":9}"#);
    assert!(found.unwrap_err().to_string().contains("inverted"));
    assert_eq!(
        serde_json::from_str::<KeySpace>(r#"{"min":9,"max":10}"#).unwrap(),
        KeySpace::new(RecordId(9), RecordId(10)).unwrap()
    );
}

#[test]
fn key_space_rejects_inverted() {
    let found = KeySpace::new(RecordId(10), RecordId(9));
    assert_eq!(
        found,
        Err(PartitionError::InvertedRange {
            min: RecordId(10),
            max: RecordId(9)
        })
    );
    assert!(KeySpace::new(RecordId(5), RecordId(5)).is_ok());
}

#[test]
fn descriptor_serde_tokens() {
    use serde_test::assert_tokens;
    use serde_test::Token;

    let batch = BatchDescriptor::Range(RangeBatch {
        start: RecordId(1),
        stop: RecordId(100),
    });
    assert_tokens(
        &batch,
        &[
            Token::NewtypeVariant {
                name: "BatchDescriptor",
                variant: "Range",
            },
            Token::Struct {
                name: "RangeBatch",
                len: 2,
            },
            Token::Str("start"),
            Token::I64(1),
            Token::Str("stop"),
            Token::I64(100),
            Token::StructEnd,
        ],
    );
}
