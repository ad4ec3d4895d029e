//! Entry point for a whole fix run.
//!
//! [`run_fix`] plans batches for a [`Population`] using a short-lived
//! planning handle, drops that handle, then hands the batches to an
//! [`Executor`]. Use [`plan`] and [`Executor::execute`] directly to
//! keep an [`crate::executor::Interrupt`] handle or to inspect the
//! batches before running them.

use tracing::instrument;

use crate::batch::chunk;
use crate::batch::partition;
use crate::batch::BatchDescriptor;
use crate::batch::RecordId;
use crate::config::FixConfig;
use crate::errors::FixError;
use crate::executor::Executor;
use crate::fix::Fixer;
use crate::report::RunReport;
use crate::store::Store;
use crate::store::StoreError;

/// Which records of the store a run targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Population {
    /// Every record matching the store's filter, split on key range.
    Range,
    /// Every record matching the store's filter, materialized as an
    /// id list under the configured budget.
    Selected,
    /// These ids exactly, e.g. from a [`crate::report::RetryPlan`].
    Ids(Vec<RecordId>),
}

/// Cut `population` into one descriptor per worker.
///
/// Opens a single planning handle from `factory` when the population
/// has to be read from the store; the handle is dropped before this
/// returns.
#[instrument(name = "plan", skip_all)]
pub fn plan<S, R>(
    population: Population,
    factory: &R,
    config: &FixConfig,
) -> Result<Vec<BatchDescriptor>, FixError>
where
    S: Store,
    R: Fn() -> Result<S, StoreError>,
{
    config.validate()?;

    let descriptors: Vec<BatchDescriptor> = match population {
        Population::Range => {
            let space = factory()?.key_space()?;
            tracing::debug!("Planning key space {space:?}");
            partition(space, config.workers)
                .into_iter()
                .map(BatchDescriptor::from)
                .collect()
        }
        Population::Selected => {
            // One past the budget so overflow is detectable.
            let limit = config.id_budget.0.saturating_add(1);
            let ids = factory()?.select_ids(limit)?;
            config.id_budget.check(ids.len())?;
            chunk(ids, config.workers)
                .into_iter()
                .map(BatchDescriptor::from)
                .collect()
        }
        Population::Ids(ids) => {
            config.id_budget.check(ids.len())?;
            chunk(ids, config.workers)
                .into_iter()
                .map(BatchDescriptor::from)
                .collect()
        }
    };

    tracing::info!("Planned {} batches", descriptors.len());
    Ok(descriptors)
}

/// Apply `fixer` once to every record of `population`.
///
/// Returns [`Err`] only if the run could not be planned; in that case
/// no worker was started. Otherwise every worker's outcome is in the
/// returned [`RunReport`], whatever its verdict.
#[instrument(name = "run_fix", skip_all, fields(workers = config.workers.get()))]
pub fn run_fix<S, X, R>(
    population: Population,
    fixer: &X,
    factory: &R,
    config: &FixConfig,
) -> Result<RunReport, FixError>
where
    S: Store,
    X: Fixer<S>,
    R: Fn() -> Result<S, StoreError> + Sync,
{
    let descriptors = plan(population, factory, config)?;
    Ok(Executor::new(config).execute(descriptors, fixer, factory))
}
