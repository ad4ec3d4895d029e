//! Run configuration.
//!
//! Settings can come from code ([`FixConfig::default`] plus field
//! updates), from any serde format, or from `SACKFIX_*` environment
//! variables via [`FixConfig::from_env`].

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::batch::IdBudget;
use crate::batch::WorkerCount;
use crate::fix::RetryPolicy;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var} must be a positive integer, got {value:?}")]
    BadNumber { var: &'static str, value: String },
    #[error("page size must be at least 1")]
    ZeroPageSize,
    #[error("unknown log level {0:?}; use trace, debug, info, warn or error")]
    BadLogLevel(String),
    #[error("invalid log filter {0}")]
    BadLogFilter(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FixConfig {
    /// Number of batches, and so of parallel workers.
    pub workers: WorkerCount,
    /// Records per page when streaming a key range.
    pub page_size: usize,
    /// Largest id list the id-set strategy may load.
    pub id_budget: IdBudget,
    pub retry: RetryPolicy,
}

impl Default for FixConfig {
    fn default() -> Self {
        Self {
            workers: WorkerCount::default(),
            page_size: 1000,
            id_budget: IdBudget::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl FixConfig {
    /// Defaults, overridden by any of `SACKFIX_WORKERS`,
    /// `SACKFIX_PAGE_SIZE`, `SACKFIX_ID_BUDGET` and
    /// `SACKFIX_RETRY_ATTEMPTS` that are set.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let number = |var: &'static str| -> Result<Option<usize>, ConfigError> {
            lookup(var)
                .map(|value| match value.trim().parse::<usize>() {
                    Ok(n) if n > 0 => Ok(n),
                    _ => Err(ConfigError::BadNumber { var, value }),
                })
                .transpose()
        };

        let mut config = Self::default();
        if let Some(workers) = number("SACKFIX_WORKERS")? {
            config.workers = WorkerCount::new(workers).map_err(|_| ConfigError::BadNumber {
                var: "SACKFIX_WORKERS",
                value: workers.to_string(),
            })?;
        }
        if let Some(page_size) = number("SACKFIX_PAGE_SIZE")? {
            config.page_size = page_size;
        }
        if let Some(budget) = number("SACKFIX_ID_BUDGET")? {
            config.id_budget = IdBudget(budget);
        }
        if let Some(attempts) = number("SACKFIX_RETRY_ATTEMPTS")? {
            config.retry.max_attempts = u32::try_from(attempts).unwrap_or(u32::MAX);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn with_workers(mut self, workers: WorkerCount) -> Self {
        self.workers = workers;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.page_size == 0 {
            return Err(ConfigError::ZeroPageSize);
        }
        Ok(())
    }
}

#[cfg(test)]
fn lookup<'a>(vars: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
    move |var| {
        vars.iter()
            .find(|(name, _)| *name == var)
            .map(|(_, value)| value.to_string())
    }
}

#[test]
fn env_overrides_defaults() {
    let found = FixConfig::from_lookup(lookup(&[
        ("SACKFIX_WORKERS", "8"),
        ("SACKFIX_PAGE_SIZE", " 250 "),
        ("SACKFIX_RETRY_ATTEMPTS", "1"),
    ]))
    .unwrap();
    assert_eq!(found.workers.get(), 8);
    assert_eq!(found.page_size, 250);
    assert_eq!(found.id_budget, IdBudget::default());
    assert_eq!(found.retry.max_attempts, 1);
}

#[test]
fn env_rejects_zero_and_garbage() {
    assert_eq!(
        FixConfig::from_lookup(lookup(&[("SACKFIX_WORKERS", "0")])),
        Err(ConfigError::BadNumber {
            var: "SACKFIX_WORKERS",
            value: "0".to_string()
        })
    );
    assert!(FixConfig::from_lookup(lookup(&[("SACKFIX_ID_BUDGET", "lots")])).is_err());
}

#[test]
fn deserialize_partial_config() {
    let found: FixConfig = serde_json::from_str(r#"{"workers": 2, "page_size": 10}"#).unwrap();
    assert_eq!(found.workers.get(), 2);
    assert_eq!(found.page_size, 10);
    assert_eq!(found.retry, RetryPolicy::default());
}

#[test]
fn zero_page_size_is_invalid() {
    let config = FixConfig {
        page_size: 0,
        ..FixConfig::default()
    };
    assert_eq!(config.validate(), Err(ConfigError::ZeroPageSize));
}
