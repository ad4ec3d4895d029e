//! SQLite implementation of [`Store`].

use std::path::Path;
use std::path::PathBuf;

use rusqlite::types::ValueRef;
use rusqlite::Connection;
use rusqlite::OpenFlags;
use rusqlite::Row;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;

use super::Keyed;
use super::Store;
use super::StoreError;
use crate::batch::KeySpace;
use crate::batch::RangeBatch;
use crate::batch::RecordId;

/// Which rows of which table make up a population.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSpec {
    pub table: String,
    /// Integer primary key column. Ranges and pages are cut on it.
    pub key_column: String,
    /// SQL boolean expression selecting the population, e.g.
    /// `service_fee = 1`. Spliced into queries as is, so it must come
    /// from the operator, never from record data.
    pub filter: Option<String>,
}

impl TableSpec {
    pub fn new(table: impl Into<String>, key_column: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            key_column: key_column.into(),
            filter: None,
        }
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    fn table_ident(&self) -> String {
        quote_ident(&self.table)
    }

    fn key_ident(&self) -> String {
        quote_ident(&self.key_column)
    }

    fn where_filter(&self) -> String {
        match &self.filter {
            Some(filter) => format!("({filter})"),
            None => "1 = 1".to_string(),
        }
    }
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// A row read from the population.
///
/// Columns are converted to JSON values so fixers can work with any
/// table shape. Blobs are skipped.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SqliteRecord {
    pub id: RecordId,
    pub columns: Map<String, Value>,
}

impl Keyed for SqliteRecord {
    fn id(&self) -> RecordId {
        self.id
    }
}

impl SqliteRecord {
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns.get(column)
    }

    fn from_row(row: &Row, names: &[String], key_index: usize) -> rusqlite::Result<Self> {
        let id = RecordId(row.get(key_index)?);
        let mut columns = Map::new();
        for (i, name) in names.iter().enumerate() {
            let value = match row.get_ref(i)? {
                ValueRef::Null => Value::Null,
                ValueRef::Integer(int) => Value::from(int),
                ValueRef::Real(real) => Value::from(real),
                ValueRef::Text(text) => Value::from(String::from_utf8_lossy(text).into_owned()),
                ValueRef::Blob(_) => continue,
            };
            columns.insert(name.clone(), value);
        }
        Ok(Self { id, columns })
    }
}

/// Wrapper around an SQLite DB connection bound to one [`TableSpec`].
pub struct SqliteStore {
    conn: Connection,
    spec: TableSpec,
    path: PathBuf,
}

/// Setup our connection-level pragmas. Run this on each connection.
pub(crate) fn setup_conn(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "busy_timeout", "5000")?;
    Ok(())
}

impl SqliteStore {
    /// Open a new connection to an existing database.
    ///
    /// Call this inside the worker that will use it. Connections
    /// opened before workers start must not be handed to them.
    pub fn open(file: &Path, spec: TableSpec) -> Result<Self, StoreError> {
        tracing::debug!("Opening SQLite connection to {file:?} for {:?}", spec.table);
        let conn = Connection::open_with_flags(
            file,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        setup_conn(&conn)?;

        Ok(Self {
            conn,
            spec,
            path: file.to_path_buf(),
        })
    }

    /// Build a factory that opens a fresh connection per call.
    pub fn factory(
        file: impl Into<PathBuf>,
        spec: TableSpec,
    ) -> impl Fn() -> Result<SqliteStore, StoreError> + Sync {
        let file = file.into();
        move || SqliteStore::open(&file, spec.clone())
    }

    /// The connection, for fixers to write through.
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn spec(&self) -> &TableSpec {
        &self.spec
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn select_records(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<SqliteRecord>, StoreError> {
        let mut stmt = self.conn.prepare(sql)?;
        let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let key_index = names
            .iter()
            .position(|name| *name == self.spec.key_column)
            .ok_or_else(|| {
                StoreError::BadRow(format!(
                    "key column {:?} missing from {:?}",
                    self.spec.key_column, self.spec.table
                ))
            })?;

        let records = stmt
            .query_map(params, |row| SqliteRecord::from_row(row, &names, key_index))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }
}

impl Store for SqliteStore {
    type Record = SqliteRecord;

    fn key_space(&mut self) -> Result<Option<KeySpace>, StoreError> {
        let sql = format!(
            "SELECT MIN({key}), MAX({key}) FROM {table} WHERE {filter}",
            key = self.spec.key_ident(),
            table = self.spec.table_ident(),
            filter = self.spec.where_filter(),
        );
        // `MIN`/`MAX` always return a single row with possible NULLs,
        // so empty tables show up as `None`s within the row.
        let (min, max) = self.conn.query_row(&sql, (), |row| {
            Ok((row.get::<_, Option<i64>>(0)?, row.get::<_, Option<i64>>(1)?))
        })?;

        match min.zip(max) {
            Some((min, max)) => KeySpace::new(RecordId(min), RecordId(max))
                .map(Some)
                .map_err(|err| StoreError::BadRow(err.to_string())),
            None => Ok(None),
        }
    }

    fn select_ids(&mut self, limit: usize) -> Result<Vec<RecordId>, StoreError> {
        let sql = format!(
            "SELECT {key} FROM {table} WHERE {filter} ORDER BY {key} ASC LIMIT ?1",
            key = self.spec.key_ident(),
            table = self.spec.table_ident(),
            filter = self.spec.where_filter(),
        );
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let ids = self
            .conn
            .prepare(&sql)?
            .query_map((limit,), |row| row.get(0).map(RecordId))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }

    fn fetch_page(
        &mut self,
        range: &RangeBatch,
        after: Option<RecordId>,
        limit: usize,
    ) -> Result<Vec<SqliteRecord>, StoreError> {
        let sql = format!(
            "SELECT * FROM {table} \
             WHERE {filter} \
             AND {key} >= ?1 AND {key} <= ?2 \
             AND (?3 IS NULL OR {key} > ?3) \
             ORDER BY {key} ASC \
             LIMIT ?4",
            key = self.spec.key_ident(),
            table = self.spec.table_ident(),
            filter = self.spec.where_filter(),
        );
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let page = self.select_records(
            &sql,
            (range.start.0, range.stop.0, after.map(|id| id.0), limit),
        )?;
        tracing::trace!("Read page of {} records after {after:?}", page.len());
        Ok(page)
    }

    fn fetch_by_id(&mut self, id: RecordId) -> Result<Option<SqliteRecord>, StoreError> {
        let sql = format!(
            "SELECT * FROM {table} WHERE {key} = ?1",
            key = self.spec.key_ident(),
            table = self.spec.table_ident(),
        );
        let mut found = self.select_records(&sql, (id.0,))?;
        Ok(found.pop())
    }
}


#[cfg(test)]
use crate::store::PageLoader;

#[test]
fn key_space_respects_filter() {
    let db = testing::TempDb::invoices("key-space", 95);
    let mut store = SqliteStore::open(
        &db.path,
        TableSpec::new("invoices", "id").with_filter("service_fee = 1"),
    )
    .unwrap();
    let found = store.key_space().unwrap();
    let expected = Some(KeySpace::new(RecordId(10), RecordId(90)).unwrap());
    assert_eq!(found, expected);
}

#[test]
fn key_space_empty_population() {
    let db = testing::TempDb::invoices("key-space-empty", 20);
    let mut store = SqliteStore::open(
        &db.path,
        TableSpec::new("invoices", "id").with_filter("amount < 0"),
    )
    .unwrap();
    assert_eq!(store.key_space().unwrap(), None);
}

#[test]
fn select_ids_is_limited_and_ordered() {
    let db = testing::TempDb::invoices("select-ids", 100);
    let mut store = SqliteStore::open(
        &db.path,
        TableSpec::new("invoices", "id").with_filter("service_fee = 1"),
    )
    .unwrap();
    let found = store.select_ids(3).unwrap();
    assert_eq!(found, vec![RecordId(10), RecordId(20), RecordId(30)]);
}

#[test]
fn pages_skip_rows_outside_filter_and_gaps() {
    let db = testing::TempDb::invoices("pages", 40);
    db.conn()
        .execute("DELETE FROM invoices WHERE id IN (3, 4, 5)", ())
        .unwrap();
    let mut store = SqliteStore::open(
        &db.path,
        TableSpec::new("invoices", "id").with_filter("service_fee = 0"),
    )
    .unwrap();
    let range = RangeBatch {
        start: RecordId(1),
        stop: RecordId(12),
    };
    let mut loader = PageLoader::new(range, 4);
    let mut seen = Vec::new();
    while let Some(page) = loader.next_batch(&mut store).unwrap() {
        assert!(page.len() <= 4);
        seen.extend(page.into_iter().map(|r| r.id.0));
    }
    assert_eq!(seen, vec![1, 2, 6, 7, 8, 9, 11, 12]);
}

#[test]
fn fetch_by_id_reads_columns() {
    let db = testing::TempDb::invoices("by-id", 10);
    let mut store = SqliteStore::open(&db.path, TableSpec::new("invoices", "id")).unwrap();
    let record = store.fetch_by_id(RecordId(7)).unwrap().unwrap();
    assert_eq!(record.id, RecordId(7));
    assert_eq!(record.get("amount"), Some(&Value::from(21)));
    assert_eq!(record.get("service_fee"), Some(&Value::from(0)));
    assert_eq!(store.fetch_by_id(RecordId(11)).unwrap(), None);
}

#[test]
fn missing_key_column_is_an_error() {
    let db = testing::TempDb::invoices("bad-key", 10);
    let mut store = SqliteStore::open(&db.path, TableSpec::new("invoices", "nope")).unwrap();
    assert!(store.fetch_by_id(RecordId(1)).is_err());
}

#[test]
fn identifiers_are_quoted() {
    assert_eq!(quote_ident("in\"voices"), "\"in\"\"voices\"");
}
