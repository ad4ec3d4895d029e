//! The per-record transformation.
//!
//! Fixers must be idempotent: running one twice on the same record
//! leaves it as running it once would. Re-running a whole batch after
//! a crash relies on this.

use std::fmt;
use std::time::Duration;

use rusqlite::ErrorCode;
use serde::Deserialize;
use serde::Serialize;

use crate::store::Store;

/// Why a record could not be fixed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixFailure {
    reason: String,
    transient: bool,
}

impl FixFailure {
    /// A failure that will happen again no matter how often we retry.
    pub fn permanent(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            transient: false,
        }
    }

    /// A failure worth retrying (lock contention, timeouts).
    pub fn transient(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            transient: true,
        }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn is_transient(&self) -> bool {
        self.transient
    }
}

impl fmt::Display for FixFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reason)
    }
}

impl std::error::Error for FixFailure {}

/// Busy and locked databases clear up on their own; everything else
/// is permanent.
impl From<rusqlite::Error> for FixFailure {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => {
                Self::transient(err.to_string())
            }
            _ => Self::permanent(err.to_string()),
        }
    }
}

/// Fixes one record, writing through the worker's own store handle.
pub trait Fixer<S: Store>: Sync {
    fn fix(&self, store: &mut S, record: &S::Record) -> Result<(), FixFailure>;
}

impl<S, F> Fixer<S> for F
where
    S: Store,
    F: Fn(&mut S, &S::Record) -> Result<(), FixFailure> + Sync,
{
    fn fix(&self, store: &mut S, record: &S::Record) -> Result<(), FixFailure> {
        self(store, record)
    }
}

/// How often to retry transient [`FixFailure`]s on one record.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first. `1` disables retries.
    pub max_attempts: u32,
    /// Base delay; doubles every attempt and gets up to 50% jitter.
    #[serde(with = "millis")]
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(50),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            backoff: Duration::ZERO,
        }
    }

    /// Delay before attempt number `attempt` (1-based, so the first
    /// retry is attempt 2).
    pub(crate) fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(2).min(16);
        let base = self.backoff.saturating_mul(1 << exp);
        let jitter = base.mul_f64(fastrand::f64() * 0.5);
        base.saturating_add(jitter)
    }

    /// Run `attempt` until it succeeds, fails permanently, or we run
    /// out of attempts. Returns the last failure.
    pub(crate) fn run<T>(
        &self,
        mut attempt: impl FnMut() -> Result<T, FixFailure>,
    ) -> Result<T, FixFailure> {
        let max_attempts = self.max_attempts.max(1);
        let mut tries = 1;
        loop {
            match attempt() {
                Err(err) if err.is_transient() && tries < max_attempts => {
                    tries += 1;
                    let delay = self.delay(tries);
                    tracing::debug!("Transient failure ({err}); retry {tries} in {delay:?}");
                    std::thread::sleep(delay);
                }
                res => return res,
            }
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::Deserialize;
    use serde::Deserializer;
    use serde::Serializer;

    pub(super) fn serialize<S>(dur: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(dur.as_millis().try_into().unwrap_or(u64::MAX))
    }

    pub(super) fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[test]
fn retries_transient_until_success() {
    let policy = RetryPolicy {
        max_attempts: 3,
        backoff: Duration::ZERO,
    };
    let mut calls = 0;
    let found = policy.run(|| {
        calls += 1;
        if calls < 3 {
            Err(FixFailure::transient("database is locked"))
        } else {
            Ok(calls)
        }
    });
    assert_eq!(found, Ok(3));
}

#[test]
fn gives_up_after_max_attempts() {
    let policy = RetryPolicy {
        max_attempts: 2,
        backoff: Duration::ZERO,
    };
    let mut calls = 0;
    let found: Result<(), _> = policy.run(|| {
        calls += 1;
        Err(FixFailure::transient("busy"))
    });
    assert_eq!(found, Err(FixFailure::transient("busy")));
    assert_eq!(calls, 2);
}

#[test]
fn permanent_failures_are_not_retried() {
    let mut calls = 0;
    let found: Result<(), _> = RetryPolicy::default().run(|| {
        calls += 1;
        Err(FixFailure::permanent("negative amount"))
    });
    assert_eq!(found, Err(FixFailure::permanent("negative amount")));
    assert_eq!(calls, 1);
}

#[test]
fn delay_grows_with_attempts() {
    let policy = RetryPolicy {
        max_attempts: 5,
        backoff: Duration::from_millis(10),
    };
    let second = policy.delay(2);
    assert!(second >= Duration::from_millis(10) && second <= Duration::from_millis(15));
    let fourth = policy.delay(4);
    assert!(fourth >= Duration::from_millis(40) && fourth <= Duration::from_millis(60));
}

#[test]
fn delay_saturates_on_huge_backoff() {
    let policy = RetryPolicy {
        max_attempts: 20,
        backoff: Duration::from_millis(u64::MAX),
    };
    assert_eq!(policy.delay(18), Duration::MAX);
}

#[test]
fn sqlite_busy_is_transient() {
    let busy = rusqlite::Error::SqliteFailure(
        rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
        None,
    );
    assert!(FixFailure::from(busy).is_transient());
    assert!(!FixFailure::from(rusqlite::Error::QueryReturnedNoRows).is_transient());
}

#[test]
fn retry_policy_deserializes_with_defaults() {
    let found: RetryPolicy = serde_json::from_str(r#"{"backoff": 250}"#).unwrap();
    assert_eq!(
        found,
        RetryPolicy {
            max_attempts: 3,
            backoff: Duration::from_millis(250)
        }
    );
}
