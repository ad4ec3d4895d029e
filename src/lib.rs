//! Run a one-off correction over every record of a large population,
//! in parallel.
//!
//! A run is planned, executed, then reported:
//!
//! 1. The population is cut into one disjoint batch per worker, either
//!    by key range ([`batch::partition`]) or from an explicit id list
//!    ([`batch::chunk`]).
//!
//! 2. [`executor::Executor`] starts one thread per batch. Each worker
//!    opens its own [`store::Store`] through the caller's factory,
//!    streams its batch in key order, and applies the [`fix::Fixer`]
//!    to every record. A failing record is noted and skipped; a lost
//!    store ends only that worker.
//!
//! 3. The per-worker outcomes are gathered into a
//!    [`report::RunReport`], which can be journaled
//!    ([`journal::SqliteJournal`]) and turned into a
//!    [`report::RetryPlan`] for an operator to re-run.
//!
//! [`run_fix`] does all three for the common case.
//!
//! Fixers must be idempotent: re-running a batch after a crash will
//! apply them again to records that were already fixed.

pub mod batch;
pub mod config;
pub mod errors;
pub mod executor;
pub mod fix;
pub mod journal;
pub mod logging;
pub mod report;
pub mod run;
pub mod store;
mod worker;

pub use config::FixConfig;
pub use errors::FixError;
pub use executor::Executor;
pub use executor::Interrupt;
pub use fix::FixFailure;
pub use fix::Fixer;
pub use report::RunReport;
pub use report::Verdict;
pub use run::run_fix;
pub use run::Population;
