//! PostgreSQL ledger adapter
//!
//! Provisional rows rely on the primary key of the ledger table: a concurrent
//! `INSERT ... ON CONFLICT DO NOTHING` waits for the first inserter and then
//! affects no rows. Reverts lock the row with `FOR UPDATE NOWAIT`.

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use sqlx::{Postgres, Row, Transaction};
use std::time::Duration;
use tracing::{debug, info};

use super::{Acquire, Executor, Ledger, LedgerSession, LedgerTransaction};
use crate::definitions::{now_timestamp, AppliedSet, MigrationRecord, BASE_VERSION};
use crate::error::{EngineError, EngineResult};

/// SQLSTATE raised by `NOWAIT` when the row is locked
const LOCK_NOT_AVAILABLE: &str = "55P03";

/// Statement templates for the ledger table
#[derive(Debug, Clone)]
pub struct PostgresDialect {
    table: String,
}

impl PostgresDialect {
    pub fn new(table: &str) -> Self {
        Self {
            table: quote_identifier(table),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn table_exists_sql(&self) -> &'static str {
        "SELECT to_regclass($1)::text"
    }

    /// Transaction-scoped advisory lock serialising ledger creation, keyed by table
    pub fn creation_lock_sql(&self) -> &'static str {
        "SELECT pg_advisory_xact_lock(hashtext($1))"
    }

    pub fn create_table_sql(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (version VARCHAR(180) PRIMARY KEY, apply_time BIGINT)",
            self.table
        )
    }

    pub fn insert_base_sql(&self) -> String {
        format!(
            "INSERT INTO {} (version, apply_time) VALUES ($1, $2) ON CONFLICT (version) DO NOTHING",
            self.table
        )
    }

    pub fn insert_version_sql(&self) -> String {
        format!("INSERT INTO {} (version, apply_time) VALUES ($1, $2)", self.table)
    }

    pub fn insert_provisional_sql(&self) -> String {
        format!(
            "INSERT INTO {} (version, apply_time) VALUES ($1, NULL) ON CONFLICT (version) DO NOTHING",
            self.table
        )
    }

    pub fn update_apply_time_sql(&self) -> String {
        format!("UPDATE {} SET apply_time = $1 WHERE version = $2", self.table)
    }

    pub fn delete_version_sql(&self) -> String {
        format!("DELETE FROM {} WHERE version = $1", self.table)
    }

    pub fn lock_version_sql(&self) -> String {
        format!(
            "SELECT version FROM {} WHERE version = $1 FOR UPDATE NOWAIT",
            self.table
        )
    }

    pub fn history_sql(&self, limited: bool) -> String {
        let mut sql = format!(
            "SELECT version, apply_time FROM {} WHERE version <> $1 AND apply_time IS NOT NULL \
             ORDER BY apply_time DESC, version DESC",
            self.table
        );
        if limited {
            sql.push_str(" LIMIT $2");
        }
        sql
    }

    pub fn applied_set_sql(&self) -> String {
        format!(
            "SELECT version, apply_time FROM {} WHERE version <> $1",
            self.table
        )
    }
}

/// Quote each dot-separated part of a table name
fn quote_identifier(name: &str) -> String {
    name.split('.')
        .map(|part| format!("\"{}\"", part.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(".")
}

/// Ledger stored in a PostgreSQL table
#[derive(Debug, Clone)]
pub struct PostgresLedger {
    pool: PgPool,
    dialect: PostgresDialect,
}

impl PostgresLedger {
    pub fn new(pool: PgPool, table: &str) -> Self {
        Self {
            pool,
            dialect: PostgresDialect::new(table),
        }
    }

    /// Connect a small pool; migrations run one at a time.
    pub async fn connect(database_url: &str, table: &str) -> EngineResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(30))
            .connect(database_url)
            .await?;

        Ok(Self::new(pool, table))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn dialect(&self) -> &PostgresDialect {
        &self.dialect
    }
}

#[async_trait]
impl Ledger for PostgresLedger {
    async fn ensure_ledger(&self) -> EngineResult<()> {
        let existing: Option<String> = sqlx::query(self.dialect.table_exists_sql())
            .bind(self.dialect.table())
            .fetch_one(&self.pool)
            .await?
            .try_get(0)?;
        if existing.is_some() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        sqlx::query(self.dialect.creation_lock_sql())
            .bind(self.dialect.table())
            .execute(&mut *tx)
            .await?;

        // Another process may have created the table while we waited for the lock.
        let existing: Option<String> = sqlx::query(self.dialect.table_exists_sql())
            .bind(self.dialect.table())
            .fetch_one(&mut *tx)
            .await?
            .try_get(0)?;
        if existing.is_some() {
            tx.commit().await?;
            return Ok(());
        }

        info!("Creating migration history table {}", self.dialect.table());
        sqlx::query(&self.dialect.create_table_sql())
            .execute(&mut *tx)
            .await?;
        sqlx::query(&self.dialect.insert_base_sql())
            .bind(BASE_VERSION)
            .bind(now_timestamp())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn history(&self, limit: Option<usize>) -> EngineResult<Vec<MigrationRecord>> {
        let sql = self.dialect.history_sql(limit.is_some());
        let mut query = sqlx::query(&sql).bind(BASE_VERSION);
        if let Some(limit) = limit {
            query = query.bind(i64::try_from(limit).unwrap_or(i64::MAX));
        }

        let rows = query.fetch_all(&self.pool).await?;
        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            records.push(MigrationRecord {
                version: row.try_get("version")?,
                apply_time: row.try_get("apply_time")?,
            });
        }
        Ok(records)
    }

    async fn applied_set(&self) -> EngineResult<AppliedSet> {
        let rows = sqlx::query(&self.dialect.applied_set_sql())
            .bind(BASE_VERSION)
            .fetch_all(&self.pool)
            .await?;

        let mut applied = AppliedSet::with_capacity(rows.len());
        for row in rows {
            applied.insert(row.try_get("version")?, row.try_get("apply_time")?);
        }
        Ok(applied)
    }

    async fn connection(&self) -> EngineResult<Box<dyn LedgerSession>> {
        let conn = self.pool.acquire().await?;
        Ok(Box::new(PostgresSession {
            conn,
            dialect: self.dialect.clone(),
        }))
    }

    async fn begin(&self) -> EngineResult<Box<dyn LedgerTransaction>> {
        debug!("Beginning ledger transaction");
        let tx = self.pool.begin().await?;
        Ok(Box::new(PostgresTransaction {
            tx,
            dialect: self.dialect.clone(),
        }))
    }
}

/// Autocommit session on a pooled connection
pub struct PostgresSession {
    conn: PoolConnection<Postgres>,
    dialect: PostgresDialect,
}

/// Session inside an open transaction
pub struct PostgresTransaction {
    tx: Transaction<'static, Postgres>,
    dialect: PostgresDialect,
}

async fn execute_raw(conn: &mut PgConnection, sql: &str) -> EngineResult<u64> {
    // Unprepared so that multi-statement blocks are accepted.
    let result = sqlx::Executor::execute(conn, sql).await?;
    Ok(result.rows_affected())
}

async fn insert_final_record(
    conn: &mut PgConnection,
    dialect: &PostgresDialect,
    version: &str,
) -> EngineResult<()> {
    sqlx::query(&dialect.insert_version_sql())
        .bind(version)
        .bind(now_timestamp())
        .execute(conn)
        .await?;
    Ok(())
}

async fn try_insert_provisional_record(
    conn: &mut PgConnection,
    dialect: &PostgresDialect,
    version: &str,
) -> EngineResult<Acquire> {
    let result = sqlx::query(&dialect.insert_provisional_sql())
        .bind(version)
        .execute(conn)
        .await?;

    Ok(if result.rows_affected() == 0 {
        Acquire::Contended
    } else {
        Acquire::Acquired
    })
}

async fn update_apply_time(
    conn: &mut PgConnection,
    dialect: &PostgresDialect,
    version: &str,
) -> EngineResult<()> {
    let result = sqlx::query(&dialect.update_apply_time_sql())
        .bind(now_timestamp())
        .bind(version)
        .execute(conn)
        .await?;

    if result.rows_affected() == 0 {
        return Err(EngineError::custom(format!(
            "no ledger row to stamp for {}",
            version
        )));
    }
    Ok(())
}

async fn delete_record(
    conn: &mut PgConnection,
    dialect: &PostgresDialect,
    version: &str,
) -> EngineResult<()> {
    sqlx::query(&dialect.delete_version_sql())
        .bind(version)
        .execute(conn)
        .await?;
    Ok(())
}

async fn try_lock_record(
    conn: &mut PgConnection,
    dialect: &PostgresDialect,
    version: &str,
) -> EngineResult<Acquire> {
    let result = sqlx::query(&dialect.lock_version_sql())
        .bind(version)
        .fetch_optional(conn)
        .await;

    match result {
        Ok(Some(_)) => Ok(Acquire::Acquired),
        // Already deleted by the process that held the lock.
        Ok(None) => Ok(Acquire::Contended),
        Err(err) if is_lock_not_available(&err) => Ok(Acquire::Contended),
        Err(err) => Err(err.into()),
    }
}

fn is_lock_not_available(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db| db.code())
        .map_or(false, |code| code == LOCK_NOT_AVAILABLE)
}

#[async_trait]
impl Executor for PostgresSession {
    async fn execute(&mut self, sql: &str) -> EngineResult<u64> {
        execute_raw(&mut self.conn, sql).await
    }
}

#[async_trait]
impl LedgerSession for PostgresSession {
    async fn insert_final_record(&mut self, version: &str) -> EngineResult<()> {
        insert_final_record(&mut self.conn, &self.dialect, version).await
    }

    async fn try_insert_provisional_record(&mut self, version: &str) -> EngineResult<Acquire> {
        try_insert_provisional_record(&mut self.conn, &self.dialect, version).await
    }

    async fn update_apply_time(&mut self, version: &str) -> EngineResult<()> {
        update_apply_time(&mut self.conn, &self.dialect, version).await
    }

    async fn delete_record(&mut self, version: &str) -> EngineResult<()> {
        delete_record(&mut self.conn, &self.dialect, version).await
    }

    async fn try_lock_record(&mut self, version: &str) -> EngineResult<Acquire> {
        try_lock_record(&mut self.conn, &self.dialect, version).await
    }

    fn executor(&mut self) -> &mut dyn Executor {
        self
    }
}

#[async_trait]
impl Executor for PostgresTransaction {
    async fn execute(&mut self, sql: &str) -> EngineResult<u64> {
        execute_raw(&mut self.tx, sql).await
    }
}

#[async_trait]
impl LedgerSession for PostgresTransaction {
    async fn insert_final_record(&mut self, version: &str) -> EngineResult<()> {
        insert_final_record(&mut self.tx, &self.dialect, version).await
    }

    async fn try_insert_provisional_record(&mut self, version: &str) -> EngineResult<Acquire> {
        try_insert_provisional_record(&mut self.tx, &self.dialect, version).await
    }

    async fn update_apply_time(&mut self, version: &str) -> EngineResult<()> {
        update_apply_time(&mut self.tx, &self.dialect, version).await
    }

    async fn delete_record(&mut self, version: &str) -> EngineResult<()> {
        delete_record(&mut self.tx, &self.dialect, version).await
    }

    async fn try_lock_record(&mut self, version: &str) -> EngineResult<Acquire> {
        try_lock_record(&mut self.tx, &self.dialect, version).await
    }

    fn executor(&mut self) -> &mut dyn Executor {
        self
    }
}

#[async_trait]
impl LedgerTransaction for PostgresTransaction {
    async fn commit(self: Box<Self>) -> EngineResult<()> {
        debug!("Committing ledger transaction");
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> EngineResult<()> {
        debug!("Rolling back ledger transaction");
        self.tx.rollback().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dialect_quotes_table() {
        let dialect = PostgresDialect::new("migration");
        assert_eq!(dialect.table(), "\"migration\"");
        assert_eq!(
            dialect.delete_version_sql(),
            "DELETE FROM \"migration\" WHERE version = $1"
        );

        let dialect = PostgresDialect::new("ops.schema_history");
        assert_eq!(dialect.table(), "\"ops\".\"schema_history\"");
    }

    #[test]
    fn test_creation_lock_is_transaction_scoped() {
        let dialect = PostgresDialect::new("migration");
        assert!(dialect.creation_lock_sql().contains("pg_advisory_xact_lock"));
        assert!(dialect.creation_lock_sql().contains("$1"));
    }

    #[test]
    fn test_history_sql_limit() {
        let dialect = PostgresDialect::new("migration");
        assert!(!dialect.history_sql(false).contains("LIMIT"));
        assert!(dialect.history_sql(true).ends_with("LIMIT $2"));
        assert!(dialect
            .history_sql(true)
            .contains("ORDER BY apply_time DESC, version DESC"));
    }

    #[test]
    fn test_provisional_insert_does_not_raise_on_conflict() {
        let sql = PostgresDialect::new("migration").insert_provisional_sql();
        assert!(sql.contains("NULL"));
        assert!(sql.ends_with("ON CONFLICT (version) DO NOTHING"));
        assert!(PostgresDialect::new("migration")
            .lock_version_sql()
            .ends_with("FOR UPDATE NOWAIT"));
    }
}
