//! Unified database connection pool supporting SQLite and PostgreSQL.
//!
//! The backend is determined at runtime from the database URL. Every
//! operation checks out its own connection, so handles can be shared
//! across concurrent workers without sharing a connection.

use std::path::Path;

use diesel::sqlite::SqliteConnection;
use diesel_async::sync_connection_wrapper::SyncConnectionWrapper;
use diesel_async::AsyncConnection;
use sea_query::{QueryStatementWriter, SchemaStatementBuilder, SqliteQueryBuilder};
use thiserror::Error;

#[cfg(feature = "postgres")]
use diesel_async::pooled_connection::deadpool::Pool as DeadPool;
#[cfg(feature = "postgres")]
use diesel_async::pooled_connection::{AsyncDieselConnectionManager, ManagerConfig};
#[cfg(feature = "postgres")]
use diesel_async::AsyncPgConnection;
#[cfg(feature = "postgres")]
use sea_query::PostgresQueryBuilder;

use super::util::{is_postgres_url, redact_url_password};

/// Errors raised by the configuration store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Connectivity loss; callers may retry.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),
    #[error("invalid record: {0}")]
    InvalidRecord(String),
    #[error("database error: {0}")]
    Database(diesel::result::Error),
}

impl From<diesel::result::Error> for StoreError {
    fn from(e: diesel::result::Error) -> Self {
        use diesel::result::{DatabaseErrorKind, Error};

        match e {
            Error::DatabaseError(DatabaseErrorKind::ClosedConnection, info) => {
                StoreError::Unavailable(info.message().to_string())
            }
            Error::DatabaseError(DatabaseErrorKind::UnableToSendCommand, info) => {
                StoreError::Unavailable(info.message().to_string())
            }
            Error::BrokenTransactionManager => {
                StoreError::Unavailable("broken transaction manager".to_string())
            }
            other => StoreError::Database(other),
        }
    }
}

/// Async SQLite connection type.
pub type SqliteConn = SyncConnectionWrapper<SqliteConnection>;

/// Async PostgreSQL connection type.
#[cfg(feature = "postgres")]
pub type PgConn = deadpool::managed::Object<AsyncDieselConnectionManager<AsyncPgConnection>>;

/// SQLite connection pool (lightweight - creates connections on demand).
#[derive(Clone)]
pub struct SqlitePool {
    database_url: String,
}

impl SqlitePool {
    pub fn new(database_url: &str) -> Self {
        let url = database_url.strip_prefix("sqlite:").unwrap_or(database_url);
        Self {
            database_url: url.to_string(),
        }
    }

    pub fn from_path(path: &Path) -> Self {
        Self::new(&path.display().to_string())
    }

    pub async fn get(&self) -> Result<SqliteConn, StoreError> {
        SqliteConn::establish(&self.database_url)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }
}

/// PostgreSQL connection pool.
#[cfg(feature = "postgres")]
#[derive(Clone)]
pub struct PgPool {
    pool: DeadPool<AsyncPgConnection>,
}

#[cfg(feature = "postgres")]
impl PgPool {
    pub fn new(database_url: &str, max_size: usize, no_tls: bool) -> Result<Self, StoreError> {
        let manager = if no_tls {
            AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url)
        } else {
            let mut config = ManagerConfig::default();
            config.custom_setup = Box::new(super::pg_tls::establish_tls_connection);
            AsyncDieselConnectionManager::<AsyncPgConnection>::new_with_config(
                database_url,
                config,
            )
        };
        let pool = DeadPool::builder(manager)
            .max_size(max_size)
            .build()
            .map_err(|e| {
                StoreError::Unavailable(format!(
                    "cannot build pool for {}: {}",
                    redact_url_password(database_url),
                    e
                ))
            })?;
        Ok(Self { pool })
    }

    pub async fn get(&self) -> Result<PgConn, StoreError> {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }
}

/// Unified database pool that supports both SQLite and PostgreSQL.
#[derive(Clone)]
pub enum DbPool {
    Sqlite(SqlitePool),
    #[cfg(feature = "postgres")]
    Postgres(PgPool),
}

impl DbPool {
    /// Create a pool from a database URL.
    ///
    /// - `postgres://` or `postgresql://` → PostgreSQL
    /// - Everything else → SQLite
    pub fn from_url(url: &str, max_size: usize, no_tls: bool) -> Result<Self, StoreError> {
        if is_postgres_url(url) {
            #[cfg(feature = "postgres")]
            return Ok(DbPool::Postgres(PgPool::new(url, max_size, no_tls)?));

            #[cfg(not(feature = "postgres"))]
            {
                let _ = (max_size, no_tls);
                return Err(StoreError::Unavailable(format!(
                    "{} requires the `postgres` feature",
                    redact_url_password(url)
                )));
            }
        }

        Ok(DbPool::Sqlite(SqlitePool::new(url)))
    }

    pub fn sqlite_from_path(path: &Path) -> Self {
        DbPool::Sqlite(SqlitePool::from_path(path))
    }

    pub fn is_sqlite(&self) -> bool {
        matches!(self, DbPool::Sqlite(_))
    }

    #[cfg(feature = "postgres")]
    pub fn is_postgres(&self) -> bool {
        matches!(self, DbPool::Postgres(_))
    }
}

/// Render a DML statement with the placeholder syntax of the pool's backend.
pub fn build_sql<S: QueryStatementWriter>(pool: &DbPool, stmt: &S) -> String {
    match pool {
        DbPool::Sqlite(_) => stmt.build(SqliteQueryBuilder).0,
        #[cfg(feature = "postgres")]
        DbPool::Postgres(_) => stmt.build(PostgresQueryBuilder).0,
    }
}

/// Render a DDL statement for the pool's backend.
pub fn build_ddl<S: SchemaStatementBuilder>(pool: &DbPool, stmt: &S) -> String {
    match pool {
        DbPool::Sqlite(_) => stmt.build(SqliteQueryBuilder),
        #[cfg(feature = "postgres")]
        DbPool::Postgres(_) => stmt.build(PostgresQueryBuilder),
    }
}

/// Run a database operation on either backend with the same Diesel code.
///
/// # Example
/// ```ignore
/// with_conn!(self.pool, conn, {
///     diesel::sql_query(sql).execute(&mut conn).await
/// })
/// ```
#[macro_export]
macro_rules! with_conn {
    ($pool:expr, $conn:ident, $body:expr) => {{
        match &$pool {
            $crate::repository::pool::DbPool::Sqlite(pool) => {
                #[allow(unused_mut)]
                let mut $conn = pool.get().await?;
                $body
            }
            #[cfg(feature = "postgres")]
            $crate::repository::pool::DbPool::Postgres(pool) => {
                #[allow(unused_mut)]
                let mut $conn = pool.get().await?;
                $body
            }
        }
    }};
}

pub use with_conn;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_detection() {
        assert!(DbPool::from_url("/path/to/db.sqlite", 4, true)
            .unwrap()
            .is_sqlite());
        assert!(DbPool::from_url("sqlite:/path/to/db", 4, true)
            .unwrap()
            .is_sqlite());

        #[cfg(feature = "postgres")]
        {
            assert!(DbPool::from_url("postgres://localhost/test", 4, true)
                .unwrap()
                .is_postgres());
            assert!(DbPool::from_url("postgresql://localhost/test", 4, true)
                .unwrap()
                .is_postgres());
        }
    }
}
