//! Connection capability traits.
//!
//! [`SessionConnection`] is the seam to the storage backend: anything that can
//! run a statement and report whether it is inside a transaction. The
//! [`pg`](crate::pg) module provides the `PostgreSQL` implementation; tests use
//! in-memory fakes.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;

use crate::error::{RlsError, StatementError};
use crate::state::SecurityState;

/// Process-unique identity of a guarded physical connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

impl ConnectionId {
    pub(crate) fn next() -> Self {
        ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "connection #{}", self.0)
    }
}

/// One result row, columns in select order, values in text form.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Row {
    columns: Vec<(String, Option<String>)>,
}

impl Row {
    #[must_use]
    pub fn new(columns: Vec<(String, Option<String>)>) -> Self {
        Self { columns }
    }

    /// Value of the named column. `None` for a missing column or SQL `NULL`.
    #[must_use]
    pub fn get(&self, column: &str) -> Option<&str> {
        self.columns
            .iter()
            .find(|(name, _)| name == column)
            .and_then(|(_, value)| value.as_deref())
    }

    #[must_use]
    pub fn columns(&self) -> &[(String, Option<String>)] {
        &self.columns
    }
}

impl<K, V> FromIterator<(K, Option<V>)> for Row
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, Option<V>)>>(iter: I) -> Self {
        Self {
            columns: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.map(Into::into)))
                .collect(),
        }
    }
}

/// `PostgreSQL` reserved key words; these cannot be used as bare table,
/// column or policy names. Kept sorted for binary search.
const RESERVED_KEYWORDS: &[&str] = &[
    "all",
    "analyse",
    "analyze",
    "and",
    "any",
    "array",
    "as",
    "asc",
    "asymmetric",
    "authorization",
    "binary",
    "both",
    "case",
    "cast",
    "check",
    "collate",
    "collation",
    "column",
    "concurrently",
    "constraint",
    "create",
    "cross",
    "current_catalog",
    "current_date",
    "current_role",
    "current_schema",
    "current_time",
    "current_timestamp",
    "current_user",
    "default",
    "deferrable",
    "desc",
    "distinct",
    "do",
    "else",
    "end",
    "except",
    "false",
    "fetch",
    "for",
    "foreign",
    "freeze",
    "from",
    "full",
    "grant",
    "group",
    "having",
    "ilike",
    "in",
    "initially",
    "inner",
    "intersect",
    "into",
    "is",
    "isnull",
    "join",
    "lateral",
    "leading",
    "left",
    "like",
    "limit",
    "localtime",
    "localtimestamp",
    "natural",
    "not",
    "notnull",
    "null",
    "offset",
    "on",
    "only",
    "or",
    "order",
    "outer",
    "overlaps",
    "placing",
    "primary",
    "references",
    "returning",
    "right",
    "select",
    "session_user",
    "similar",
    "some",
    "symmetric",
    "system_user",
    "table",
    "tablesample",
    "then",
    "to",
    "trailing",
    "true",
    "union",
    "unique",
    "user",
    "using",
    "variadic",
    "verbose",
    "when",
    "where",
    "window",
    "with",
];

/// Whether `name` can appear in SQL without quotes: lowercase letters,
/// digits and underscores, not starting with a digit, and not a reserved
/// key word.
pub(crate) fn is_plain_identifier(name: &str) -> bool {
    name.chars()
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_')
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        && RESERVED_KEYWORDS.binary_search(&name).is_err()
}

/// A backend connection able to carry row-level security settings.
#[async_trait]
pub trait SessionConnection: Send + Sync {
    /// Run `sql` (possibly several `;`-separated statements) and return the
    /// rows of the last result set.
    ///
    /// # Errors
    /// Returns [`StatementError::TransactionAborted`] when the enclosing
    /// transaction already failed, [`StatementError::Backend`] otherwise.
    async fn execute_statement(&self, sql: &str) -> Result<Vec<Row>, StatementError>;

    /// Whether RLS variables should be maintained on this connection.
    fn is_enforcement_applicable(&self) -> bool;

    fn is_transaction_open(&self) -> bool;

    fn quote_literal(&self, value: &str) -> String {
        format!("'{}'", value.replace('\'', "''"))
    }

    fn quote_identifier(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }
}

/// A pooled connection the security context can be broadcast to.
#[async_trait]
pub trait ManagedConnection: Send + Sync {
    fn connection_id(&self) -> ConnectionId;

    /// Apply `state` to the physical connection and record the calling context
    /// as its owner.
    ///
    /// # Errors
    /// Returns [`RlsError::Activation`] for any failure other than an already
    /// aborted transaction.
    async fn activate(&self, state: &SecurityState) -> Result<(), RlsError>;
}
