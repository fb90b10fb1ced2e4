//! `PostgreSQL` backend over `sqlx`.
//!
//! Statements go through the simple query protocol so that the compound
//! activation statement runs in one round trip and every value comes back in
//! text form.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgRow};
use sqlx::{Column, Connection, Row as _};
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::DatabaseConfig;
use crate::connection::{Row, SessionConnection};
use crate::error::{RlsError, StatementError};
use crate::pool::Connector;

/// `in_failed_sql_transaction`
const IN_FAILED_SQL_TRANSACTION: &str = "25P02";

/// One physical `PostgreSQL` connection.
pub struct PgSessionConnection {
    conn: Mutex<PgConnection>,
    rls_enabled: bool,
    transaction_open: AtomicBool,
}

impl std::fmt::Debug for PgSessionConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgSessionConnection")
            .field("rls_enabled", &self.rls_enabled)
            .field("transaction_open", &self.transaction_open.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl PgSessionConnection {
    #[must_use]
    pub fn new(conn: PgConnection, rls_enabled: bool) -> Self {
        Self {
            conn: Mutex::new(conn),
            rls_enabled,
            transaction_open: AtomicBool::new(false),
        }
    }

    /// # Errors
    /// Returns the backend error when the server cannot be reached.
    pub async fn connect(options: &PgConnectOptions, rls_enabled: bool) -> Result<Self, StatementError> {
        let conn = PgConnection::connect_with(options).await.map_err(classify)?;
        Ok(Self::new(conn, rls_enabled))
    }

    /// Close the connection gracefully.
    ///
    /// # Errors
    /// Returns the backend error raised while terminating the session.
    pub async fn close(self) -> Result<(), StatementError> {
        self.conn.into_inner().close().await.map_err(classify)
    }

    fn track_transaction(&self, sql: &str) {
        for statement in sql.split(';') {
            if let Some(open) = transaction_effect(statement) {
                self.transaction_open.store(open, Ordering::Release);
            }
        }
    }
}

#[async_trait]
impl SessionConnection for PgSessionConnection {
    async fn execute_statement(&self, sql: &str) -> Result<Vec<Row>, StatementError> {
        let rows = {
            let mut conn = self.conn.lock().await;
            sqlx::raw_sql(sql).fetch_all(&mut *conn).await
        };
        let rows = rows.map_err(classify)?;
        self.track_transaction(sql);
        rows.iter().map(to_row).collect()
    }

    fn is_enforcement_applicable(&self) -> bool {
        self.rls_enabled
    }

    fn is_transaction_open(&self) -> bool {
        self.transaction_open.load(Ordering::Acquire)
    }
}

/// Opens [`PgSessionConnection`]s for a [`LeasePool`](crate::LeasePool).
#[derive(Clone, Debug)]
pub struct PgConnector {
    options: PgConnectOptions,
    rls_enabled: bool,
}

impl PgConnector {
    #[must_use]
    pub fn new(options: PgConnectOptions, rls_enabled: bool) -> Self {
        Self {
            options,
            rls_enabled,
        }
    }

    /// # Errors
    /// Returns [`RlsError::InvalidConfig`] when the DSN cannot be parsed.
    pub fn from_config(config: &DatabaseConfig) -> Result<Self, RlsError> {
        let options = config
            .dsn
            .parse::<PgConnectOptions>()
            .map_err(|err| RlsError::InvalidConfig(format!("invalid dsn: {err}")))?;
        Ok(Self::new(options, config.rls_enabled))
    }
}

#[async_trait]
impl Connector for PgConnector {
    type Conn = PgSessionConnection;

    async fn connect(&self) -> Result<PgSessionConnection, StatementError> {
        debug!(
            host = self.options.get_host(),
            database = self.options.get_database(),
            "opening postgres connection"
        );
        PgSessionConnection::connect(&self.options, self.rls_enabled).await
    }
}

fn classify(err: sqlx::Error) -> StatementError {
    if let sqlx::Error::Database(db) = &err
        && db.code().as_deref() == Some(IN_FAILED_SQL_TRANSACTION)
    {
        return StatementError::TransactionAborted(db.message().to_owned());
    }
    StatementError::Backend(err.into())
}

fn to_row(row: &PgRow) -> Result<Row, StatementError> {
    row.columns()
        .iter()
        .map(|column| {
            let value: Option<String> = row
                .try_get_unchecked(column.ordinal())
                .map_err(|err| StatementError::Backend(err.into()))?;
            Ok((column.name().to_owned(), value))
        })
        .collect::<Result<Vec<_>, StatementError>>()
        .map(Row::new)
}

/// `Some(true)` for statements opening a transaction block, `Some(false)` for
/// statements ending one, `None` for everything else.
fn transaction_effect(statement: &str) -> Option<bool> {
    let words: Vec<String> = statement
        .split_whitespace()
        .take(2)
        .map(str::to_ascii_uppercase)
        .collect();
    match words.first().map(String::as_str)? {
        "BEGIN" => Some(true),
        "START" => (words.get(1).map(String::as_str) == Some("TRANSACTION")).then_some(true),
        "COMMIT" | "END" | "ABORT" => Some(false),
        "ROLLBACK" => match words.get(1).map(String::as_str) {
            Some("TO") => None,
            _ => Some(false),
        },
        _ => None,
    }
}
