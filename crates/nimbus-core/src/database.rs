//! SQLite persistence with reentrant locking and nested transactions.
//!
//! [`Database`] owns one connection behind a reentrant lock so that an
//! operation already holding the database may call helpers that lock it
//! again. [`Transaction`]s are SQLite savepoints and therefore nest; a
//! transaction that is dropped without [`Transaction::commit`] rolls back.
//!
//! Queries go through [`ScopedQuery`], which binds named parameters, runs
//! the statement, and buffers its rows for typed field access.
//!
//! # Example
//!
//! ```
//! use nimbus_core::Database;
//!
//! let db = Database::in_memory().unwrap();
//! let tx = db.transaction().unwrap();
//! tx.execute_batch("CREATE TABLE t (k TEXT PRIMARY KEY, v INTEGER)").unwrap();
//! tx.query("INSERT INTO t (k, v) VALUES (:k, :v)")
//!     .param(":k", "answer")
//!     .param(":v", 42_i64)
//!     .execute()
//!     .unwrap();
//! tx.commit().unwrap();
//!
//! let mut query = db.query("SELECT v FROM t WHERE k = :k");
//! query.param(":k", "answer");
//! query.execute().unwrap();
//! assert_eq!(query.first().unwrap().field::<i64>("v").unwrap(), 42);
//! ```

use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use rusqlite::types::{FromSql, ToSqlOutput, Value, ValueRef};
use rusqlite::{Connection, ToSql};
use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{Span, debug, info, info_span, trace};

use crate::error::{DatabaseError, DatabaseResult};

type ConnectionCell = RefCell<Connection>;

/// A SQLite database shared by every nimbus component.
pub struct Database {
    connection: ReentrantMutex<ConnectionCell>,
    path: Option<PathBuf>,
    savepoints: AtomicU64,
    span: Span,
}

impl Database {
    /// Opens (or creates) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> DatabaseResult<Self> {
        let path = path.as_ref().to_path_buf();
        let connection = Connection::open(&path)?;
        connection.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")?;
        let db = Self::with_connection(connection, Some(path));
        db.span.in_scope(|| info!(path = ?db.path, "Database opened"));
        Ok(db)
    }

    /// Opens a private in-memory database.
    pub fn in_memory() -> DatabaseResult<Self> {
        let connection = Connection::open_in_memory()?;
        connection.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self::with_connection(connection, None))
    }

    fn with_connection(connection: Connection, path: Option<PathBuf>) -> Self {
        Self {
            connection: ReentrantMutex::new(RefCell::new(connection)),
            path,
            savepoints: AtomicU64::new(0),
            span: info_span!("database"),
        }
    }

    /// Location on disk, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Acquires the database for the current thread.
    ///
    /// The lock is reentrant: the same thread may lock again while holding it.
    pub fn lock(&self) -> DatabaseLock<'_> {
        DatabaseLock {
            guard: self.connection.lock(),
        }
    }

    /// Begins a transaction. The database stays locked until it ends.
    pub fn transaction(&self) -> DatabaseResult<Transaction<'_>> {
        let guard = self.connection.lock();
        let name = format!(
            "nimbus_sp_{}",
            self.savepoints.fetch_add(1, Ordering::Relaxed)
        );
        guard.borrow().execute_batch(&format!("SAVEPOINT {name}"))?;
        trace!(parent: &self.span, savepoint = %name, "Transaction started");
        Ok(Transaction {
            lock: DatabaseLock { guard },
            name,
            finished: false,
        })
    }

    /// Prepares an autocommit query.
    pub fn query(&self, sql: &str) -> ScopedQuery<Owned<'_>> {
        ScopedQuery::new(Owned(self.lock()), sql)
    }

    /// Applies every migration of `component` newer than its recorded version.
    pub fn migrate(&self, component: &str, migrations: &[Migration]) -> DatabaseResult<()> {
        let tx = self.transaction()?;
        tx.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_versions (
                component TEXT PRIMARY KEY NOT NULL,
                version INTEGER NOT NULL
            )",
        )?;

        let current = {
            let mut query =
                tx.query("SELECT version FROM schema_versions WHERE component = :component");
            query.param(":component", component);
            query.execute()?;
            match query.first() {
                Some(row) => row.field::<u32>("version")?,
                None => 0,
            }
        };

        let mut applied = current;
        for migration in migrations.iter().filter(|m| m.version > current) {
            debug!(
                parent: &self.span,
                component,
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            tx.execute_batch(migration.sql)?;
            applied = applied.max(migration.version);
        }

        if applied != current {
            tx.query(
                "INSERT INTO schema_versions (component, version) VALUES (:component, :version)
                 ON CONFLICT(component) DO UPDATE SET version = excluded.version",
            )
            .param(":component", component)
            .param(":version", applied)
            .execute()?;
            info!(parent: &self.span, component, from = current, to = applied, "Schema migrated");
        }

        tx.commit()
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").field("path", &self.path).finish_non_exhaustive()
    }
}

/// One versioned schema change.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    /// Monotonic version within a component.
    pub version: u32,
    /// Short description for logs.
    pub name: &'static str,
    /// SQL executed as a batch.
    pub sql: &'static str,
}

/// Exclusive, reentrant access to the database.
pub struct DatabaseLock<'db> {
    guard: ReentrantMutexGuard<'db, ConnectionCell>,
}

impl DatabaseLock<'_> {
    /// Runs `sql` (possibly several statements) without parameters.
    pub fn execute_batch(&self, sql: &str) -> DatabaseResult<()> {
        self.guard.borrow().execute_batch(sql)?;
        Ok(())
    }

    /// Prepares a query against the locked connection.
    pub fn query(&self, sql: &str) -> ScopedQuery<Borrowed<'_>> {
        ScopedQuery::new(Borrowed(&*self.guard), sql)
    }
}

/// A savepoint. Rolls back when dropped uncommitted.
pub struct Transaction<'db> {
    lock: DatabaseLock<'db>,
    name: String,
    finished: bool,
}

impl Transaction<'_> {
    /// Runs `sql` without parameters.
    pub fn execute_batch(&self, sql: &str) -> DatabaseResult<()> {
        self.lock.execute_batch(sql)
    }

    /// Prepares a query within this transaction.
    pub fn query(&self, sql: &str) -> ScopedQuery<Borrowed<'_>> {
        self.lock.query(sql)
    }

    /// Makes the transaction's changes permanent (or part of the enclosing transaction).
    pub fn commit(mut self) -> DatabaseResult<()> {
        self.finished = true;
        self.lock
            .execute_batch(&format!("RELEASE SAVEPOINT {}", self.name))
    }

    /// Discards the transaction's changes.
    pub fn rollback(mut self) -> DatabaseResult<()> {
        self.finished = true;
        self.rollback_inner()
    }

    fn rollback_inner(&self) -> DatabaseResult<()> {
        self.lock.execute_batch(&format!(
            "ROLLBACK TO SAVEPOINT {0}; RELEASE SAVEPOINT {0}",
            self.name
        ))
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.finished
            && let Err(e) = self.rollback_inner()
        {
            tracing::warn!(error = %e, savepoint = %self.name, "Rollback failed");
        }
    }
}

/// Where a query finds its connection.
pub trait QueryTarget {
    /// The locked connection.
    fn cell(&self) -> &ConnectionCell;
}

/// A query that holds its own lock.
pub struct Owned<'db>(DatabaseLock<'db>);

impl QueryTarget for Owned<'_> {
    fn cell(&self) -> &ConnectionCell {
        &self.0.guard
    }
}

/// A query borrowing a lock held elsewhere.
pub struct Borrowed<'l>(&'l ConnectionCell);

impl QueryTarget for Borrowed<'_> {
    fn cell(&self) -> &ConnectionCell {
        self.0
    }
}

/// A parameterized statement and, once executed, its buffered rows.
pub struct ScopedQuery<T: QueryTarget> {
    target: T,
    sql: String,
    params: Vec<(String, Value)>,
    bind_error: Option<DatabaseError>,
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl<T: QueryTarget> ScopedQuery<T> {
    fn new(target: T, sql: &str) -> Self {
        Self {
            target,
            sql: sql.to_string(),
            params: Vec::new(),
            bind_error: None,
            columns: Vec::new(),
            rows: Vec::new(),
        }
    }

    /// Binds `value` to the named parameter `name` (including its prefix, e.g. `:id`).
    pub fn param(&mut self, name: &str, value: impl ToSql) -> &mut Self {
        match value.to_sql() {
            Ok(ToSqlOutput::Owned(value)) => self.params.push((name.to_string(), value)),
            Ok(ToSqlOutput::Borrowed(value)) => {
                self.params.push((name.to_string(), Value::from(value)));
            }
            Ok(_) => {
                self.bind_error
                    .get_or_insert(DatabaseError::UnknownParameter(name.to_string()));
            }
            Err(e) => {
                self.bind_error.get_or_insert(DatabaseError::Sqlite(e));
            }
        }
        self
    }

    /// Runs the statement.
    ///
    /// Returns the number of rows changed for statements without a result
    /// set, otherwise the number of rows fetched.
    pub fn execute(&mut self) -> DatabaseResult<usize> {
        if let Some(e) = self.bind_error.take() {
            return Err(e);
        }

        let connection = self.target.cell().borrow();
        let mut statement = connection.prepare_cached(&self.sql)?;
        for (name, value) in &self.params {
            let index = statement
                .parameter_index(name)?
                .ok_or_else(|| DatabaseError::UnknownParameter(name.clone()))?;
            statement.raw_bind_parameter(index, value)?;
        }

        self.rows.clear();
        if statement.column_count() == 0 {
            return Ok(statement.raw_execute()?);
        }

        self.columns = statement
            .column_names()
            .into_iter()
            .map(str::to_string)
            .collect();
        let width = self.columns.len();
        let mut rows = statement.raw_query();
        while let Some(row) = rows.next()? {
            let values = (0..width)
                .map(|i| row.get::<_, Value>(i))
                .collect::<Result<Vec<_>, _>>()?;
            self.rows.push(values);
        }
        Ok(self.rows.len())
    }

    /// Rows fetched by the last [`execute`](Self::execute).
    pub fn rows(&self) -> impl Iterator<Item = QueryRow<'_>> {
        self.rows.iter().map(|values| QueryRow {
            columns: &self.columns,
            values,
        })
    }

    /// The first fetched row.
    pub fn first(&self) -> Option<QueryRow<'_>> {
        self.rows().next()
    }
}

/// One buffered row.
#[derive(Debug, Clone, Copy)]
pub struct QueryRow<'q> {
    columns: &'q [String],
    values: &'q [Value],
}

impl QueryRow<'_> {
    /// Reads the column called `name`.
    pub fn field<F: FromSql>(&self, name: &str) -> DatabaseResult<F> {
        let index = self
            .columns
            .iter()
            .position(|column| column == name)
            .ok_or_else(|| DatabaseError::UnknownField(name.to_string()))?;
        let value = &self.values[index];
        F::column_result(ValueRef::from(value)).map_err(|e| {
            DatabaseError::Sqlite(rusqlite::Error::FromSqlConversionFailure(
                index,
                value.data_type(),
                Box::new(e),
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup(db: &Database) {
        db.migrate(
            "test",
            &[Migration {
                version: 1,
                name: "kv",
                sql: "CREATE TABLE kv (k TEXT PRIMARY KEY, v INTEGER NOT NULL)",
            }],
        )
        .unwrap();
    }

    fn count(db: &Database) -> i64 {
        let mut query = db.query("SELECT COUNT(*) AS n FROM kv");
        query.execute().unwrap();
        query.first().unwrap().field("n").unwrap()
    }

    #[test]
    fn test_uncommitted_transaction_rolls_back() {
        let db = Database::in_memory().unwrap();
        setup(&db);
        {
            let tx = db.transaction().unwrap();
            tx.query("INSERT INTO kv (k, v) VALUES (:k, :v)")
                .param(":k", "a")
                .param(":v", 1_i64)
                .execute()
                .unwrap();
        }
        assert_eq!(count(&db), 0);
    }

    #[test]
    fn test_nested_transactions() {
        let db = Database::in_memory().unwrap();
        setup(&db);
        let outer = db.transaction().unwrap();
        outer
            .query("INSERT INTO kv (k, v) VALUES ('a', 1)")
            .execute()
            .unwrap();
        {
            let inner = db.transaction().unwrap();
            inner
                .query("INSERT INTO kv (k, v) VALUES ('b', 2)")
                .execute()
                .unwrap();
            inner.rollback().unwrap();
        }
        outer.commit().unwrap();

        let mut query = db.query("SELECT k FROM kv ORDER BY k");
        query.execute().unwrap();
        let keys: Vec<String> = query.rows().map(|r| r.field("k").unwrap()).collect();
        assert_eq!(keys, vec!["a".to_string()]);
    }

    #[test]
    fn test_unknown_parameter_is_reported() {
        let db = Database::in_memory().unwrap();
        setup(&db);
        let mut query = db.query("SELECT v FROM kv WHERE k = :k");
        query.param(":missing", 1_i64);
        assert!(matches!(
            query.execute(),
            Err(DatabaseError::UnknownParameter(name)) if name == ":missing"
        ));
    }

    #[test]
    fn test_migrations_apply_once() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nimbus.db");
        {
            let db = Database::open(&path).unwrap();
            setup(&db);
            db.query("INSERT INTO kv (k, v) VALUES ('x', 9)")
                .execute()
                .unwrap();
        }
        let db = Database::open(&path).unwrap();
        setup(&db);
        assert_eq!(count(&db), 1);
        assert_eq!(db.path(), Some(path.as_path()));
    }
}
