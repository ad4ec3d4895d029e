//! SQLite journal of finished runs.
//!
//! A journal is optional. It keeps every [`RunReport`] an operator
//! records so the [`RetryPlan`] of any past run can be reloaded after
//! the process that ran it is gone.
//!
//! Schema:
//!
//! - `runs`: one row per run with its verdict and totals.
//! - `workers`: one row per worker; the batch is stored as JSON so an
//!   unfinished batch can be re-run exactly.
//! - `failures`: one row per record the fixer rejected.

use std::path::Path;

use rusqlite::Connection;
use rusqlite::OptionalExtension;
use rusqlite_migration::Migrations;
use rusqlite_migration::M;
use thiserror::Error;

use crate::batch::BatchDescriptor;
use crate::batch::RecordId;
use crate::report::RetryPlan;
use crate::report::RunId;
use crate::report::RunReport;
use crate::report::WorkerStatus;
use crate::store::sqlite::setup_conn;

#[derive(Error, Debug)]
pub enum JournalError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("unable to migrate journal: {0}")]
    Migration(#[from] rusqlite_migration::Error),
    #[error("unable to (de)serialize batch: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("no run {0} in journal")]
    UnknownRun(RunId),
}

fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        M::up(
            "CREATE TABLE runs ( \
             created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP, \
             run_id TEXT NOT NULL PRIMARY KEY, \
             started_at TEXT NOT NULL, \
             finished_at TEXT NOT NULL, \
             verdict TEXT NOT NULL, \
             processed INTEGER NOT NULL CHECK (processed >= 0), \
             failed INTEGER NOT NULL CHECK (failed >= 0) \
             ) STRICT",
        ),
        M::up(
            "CREATE TABLE workers ( \
             created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP, \
             run_id TEXT NOT NULL REFERENCES runs (run_id), \
             worker_index INTEGER NOT NULL CHECK (worker_index >= 0), \
             batch TEXT NOT NULL, \
             processed INTEGER NOT NULL CHECK (processed >= 0), \
             last_key INTEGER, \
             status TEXT NOT NULL, \
             reason TEXT, \
             elapsed_ms INTEGER NOT NULL, \
             PRIMARY KEY (run_id, worker_index) \
             ) STRICT",
        ),
        // Ids may repeat if the caller handed in duplicate ids, so
        // there's no natural key here.
        M::up(
            "CREATE TABLE failures ( \
             created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP, \
             run_id TEXT NOT NULL, \
             worker_index INTEGER NOT NULL, \
             record_id INTEGER NOT NULL, \
             reason TEXT NOT NULL, \
             FOREIGN KEY (run_id, worker_index) REFERENCES workers (run_id, worker_index) \
             ) STRICT",
        ),
    ])
}

#[test]
fn migrations_valid() -> rusqlite_migration::Result<()> {
    migrations().validate()
}

fn status_parts(status: &WorkerStatus) -> (&'static str, Option<&str>) {
    match status {
        WorkerStatus::Completed => ("completed", None),
        WorkerStatus::CrashedEarly(reason) => ("crashed_early", Some(reason)),
        WorkerStatus::Interrupted => ("interrupted", None),
    }
}

fn to_i64(n: impl TryInto<i64>) -> i64 {
    n.try_into().unwrap_or(i64::MAX)
}

pub struct SqliteJournal {
    conn: Connection,
}

impl SqliteJournal {
    /// Open or create a journal file and bring its schema up to date.
    pub fn open(file: &Path) -> Result<Self, JournalError> {
        tracing::debug!("Opening journal at {file:?}");
        let mut conn = Connection::open(file)?;
        setup_conn(&conn)?;
        migrations().to_latest(&mut conn)?;
        Ok(Self { conn })
    }

    /// Persist a finished run. A run can only be recorded once.
    pub fn record(&mut self, report: &RunReport) -> Result<(), JournalError> {
        let txn = self.conn.transaction()?;
        txn.execute(
            "INSERT INTO runs (run_id, started_at, finished_at, verdict, processed, failed) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            (
                &report.run_id.0,
                report.started_at.to_rfc3339(),
                report.finished_at.to_rfc3339(),
                report.verdict().as_str(),
                to_i64(report.processed()),
                to_i64(report.failed()),
            ),
        )?;
        for worker in &report.workers {
            tracing::trace!("Journaling worker {}", worker.worker);
            let (status, reason) = status_parts(&worker.status);
            txn.execute(
                "INSERT INTO workers \
                 (run_id, worker_index, batch, processed, last_key, status, reason, elapsed_ms) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                (
                    &report.run_id.0,
                    to_i64(worker.worker.0),
                    serde_json::to_string(&worker.batch)?,
                    to_i64(worker.processed),
                    worker.last_key.map(|id| id.0),
                    status,
                    reason,
                    to_i64(worker.elapsed.as_millis()),
                ),
            )?;
            for failure in &worker.failed {
                txn.execute(
                    "INSERT INTO failures (run_id, worker_index, record_id, reason) \
                     VALUES (?1, ?2, ?3, ?4)",
                    (
                        &report.run_id.0,
                        to_i64(worker.worker.0),
                        failure.id.0,
                        &failure.reason,
                    ),
                )?;
            }
        }
        txn.commit()?;
        tracing::info!("Journaled run {}", report.run_id);
        Ok(())
    }

    /// Ids of journaled runs, oldest first.
    pub fn run_ids(&self) -> Result<Vec<RunId>, JournalError> {
        let ids = self
            .conn
            .prepare("SELECT run_id FROM runs ORDER BY started_at, run_id")?
            .query_map((), |row| row.get(0).map(RunId))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }

    /// Rebuild [`RunReport::retry_plan`] for a journaled run.
    pub fn retry_plan(&self, run_id: &RunId) -> Result<RetryPlan, JournalError> {
        let known = self
            .conn
            .query_row(
                "SELECT 1 FROM runs WHERE run_id = ?1",
                (&run_id.0,),
                |_| Ok(()),
            )
            .optional()?;
        if known.is_none() {
            return Err(JournalError::UnknownRun(run_id.clone()));
        }

        let batches = self
            .conn
            .prepare(
                "SELECT batch FROM workers \
                 WHERE run_id = ?1 AND status != 'completed' \
                 ORDER BY worker_index",
            )?
            .query_map((&run_id.0,), |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?
            .iter()
            .map(|json| serde_json::from_str::<BatchDescriptor>(json))
            .collect::<Result<Vec<_>, _>>()?;

        let failed_ids = self
            .conn
            .prepare(
                "SELECT f.record_id FROM failures f \
                 JOIN workers w ON w.run_id = f.run_id AND w.worker_index = f.worker_index \
                 WHERE f.run_id = ?1 AND w.status = 'completed' \
                 ORDER BY f.worker_index, f.rowid",
            )?
            .query_map((&run_id.0,), |row| row.get(0).map(RecordId))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(RetryPlan {
            batches,
            failed_ids,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::report::result;
    use crate::store::sqlite::testing::TempDb;

    fn report() -> RunReport {
        let now = Utc::now();
        RunReport {
            run_id: RunId::new(&now),
            started_at: now,
            finished_at: now,
            workers: vec![
                result(0, 97, &[3, 50, 77], WorkerStatus::Completed),
                result(1, 12, &[105], WorkerStatus::CrashedEarly("lost".to_string())),
                result(2, 100, &[], WorkerStatus::Completed),
                result(3, 40, &[], WorkerStatus::Interrupted),
                result(4, 99, &[410], WorkerStatus::Completed),
            ],
        }
    }

    #[test]
    fn round_trip_reproduces_retry_plan() {
        let db = TempDb::new("journal");
        let report = report();

        let mut journal = SqliteJournal::open(&db.path).unwrap();
        journal.record(&report).unwrap();
        drop(journal);

        let journal = SqliteJournal::open(&db.path).unwrap();
        assert_eq!(journal.run_ids().unwrap(), vec![report.run_id.clone()]);
        let found = journal.retry_plan(&report.run_id).unwrap();
        assert_eq!(found, report.retry_plan());
        assert_eq!(
            found.failed_ids,
            vec![RecordId(3), RecordId(50), RecordId(77), RecordId(410)]
        );
    }

    #[test]
    fn run_recorded_once() {
        let db = TempDb::new("journal-twice");
        let report = report();
        let mut journal = SqliteJournal::open(&db.path).unwrap();
        journal.record(&report).unwrap();
        assert!(journal.record(&report).is_err());
        // The failed second attempt left nothing half written.
        assert_eq!(journal.retry_plan(&report.run_id).unwrap(), report.retry_plan());
    }

    #[test]
    fn unknown_run() {
        let db = TempDb::new("journal-unknown");
        let journal = SqliteJournal::open(&db.path).unwrap();
        let run_id = RunId("nope".to_string());
        assert!(matches!(
            journal.retry_plan(&run_id),
            Err(JournalError::UnknownRun(found)) if found == run_id
        ));
    }
}
