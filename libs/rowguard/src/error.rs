use crate::connection::ConnectionId;
use crate::context::ContextId;

/// Failure reported by a connection while executing a statement.
///
/// Backends classify their native errors into these two kinds so the
/// activation protocol can tell an already-aborted transaction apart from a
/// genuine failure.
#[derive(Debug, thiserror::Error)]
pub enum StatementError {
    /// The enclosing transaction has already failed; every statement is
    /// rejected until it is rolled back or a savepoint is restored.
    #[error("current transaction is aborted: {0}")]
    TransactionAborted(String),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl StatementError {
    #[must_use]
    pub fn is_transaction_aborted(&self) -> bool {
        matches!(self, StatementError::TransactionAborted(_))
    }
}

/// Typed error for security-context propagation and the schema helpers.
#[derive(Debug, thiserror::Error)]
pub enum RlsError {
    /// Pop on an empty per-context stack. Indicates unbalanced nesting.
    #[error("security state stack is empty for {0}")]
    StackUnderflow(ContextId),

    #[error("failed to activate security state on {connection}: {source}")]
    Activation {
        connection: ConnectionId,
        #[source]
        source: StatementError,
    },

    #[error(transparent)]
    Statement(#[from] StatementError),

    #[error("irreversible migration: {0}")]
    IrreversibleMigration(String),

    #[error("policy file for table '{table}' version {version} not found at {path}")]
    PolicyNotFound {
        table: String,
        version: u32,
        path: String,
    },

    #[error("invalid policy definition: {0}")]
    InvalidPolicy(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for RlsError {
    fn from(err: figment::Error) -> Self {
        RlsError::InvalidConfig(err.to_string())
    }
}
