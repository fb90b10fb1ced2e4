//! Activation protocol: writing a [`SecurityState`] into a connection's session.

use tracing::debug;

use crate::connection::{ConnectionId, SessionConnection};
use crate::context::ContextId;
use crate::error::StatementError;
use crate::registry::ConnectionRegistry;
use crate::state::{RlsId, SecurityState, SettingScope};

/// Configure `conn` for `state` on behalf of the calling context.
///
/// Does nothing when enforcement does not apply to the connection. The
/// variables are set with `SET LOCAL` inside a transaction and `SET SESSION`
/// outside of one.
///
/// A failure caused by an already aborted transaction is swallowed: the
/// pending settings would be discarded by the rollback or savepoint restore
/// anyway, which brings back whatever configuration preceded them.
///
/// # Errors
/// Returns any other [`StatementError`] raised by the connection.
pub async fn activate<C>(
    registry: &ConnectionRegistry,
    id: ConnectionId,
    conn: &C,
    state: &SecurityState,
) -> Result<(), StatementError>
where
    C: SessionConnection + ?Sized,
{
    if !conn.is_enforcement_applicable() {
        return Ok(());
    }

    let ctx = ContextId::current();
    registry.record(id, ctx);

    let scope = SettingScope::for_transaction(conn.is_transaction_open());
    let sql = state.to_sql(conn, scope);
    debug!(
        connection = %id,
        context = %ctx,
        scope = scope.as_sql(),
        user = state.user().map(RlsId::as_str),
        tenant = state.tenant().map(RlsId::as_str),
        disabled = state.is_disabled(),
        "activating security state"
    );

    match conn.execute_statement(&sql).await {
        Ok(_) => Ok(()),
        Err(StatementError::TransactionAborted(reason)) => {
            debug!(
                connection = %id,
                %reason,
                "transaction is aborted, skipping security state activation"
            );
            Ok(())
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::connection::Row;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tracing_test::traced_test;

    enum Outcome {
        Ok,
        Aborted,
        Broken,
    }

    struct Recording {
        applicable: bool,
        in_tx: bool,
        outcome: Outcome,
        executed: Mutex<Vec<String>>,
    }

    impl Recording {
        fn new(outcome: Outcome) -> Self {
            Self {
                applicable: true,
                in_tx: false,
                outcome,
                executed: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl SessionConnection for Recording {
        async fn execute_statement(&self, sql: &str) -> Result<Vec<Row>, StatementError> {
            self.executed.lock().push(sql.to_owned());
            match self.outcome {
                Outcome::Ok => Ok(Vec::new()),
                Outcome::Aborted => Err(StatementError::TransactionAborted(
                    "commands ignored until end of transaction block".to_owned(),
                )),
                Outcome::Broken => Err(anyhow::anyhow!("connection reset").into()),
            }
        }

        fn is_enforcement_applicable(&self) -> bool {
            self.applicable
        }

        fn is_transaction_open(&self) -> bool {
            self.in_tx
        }
    }

    #[tokio::test]
    async fn records_owner_and_sets_session_scope() {
        let registry = ConnectionRegistry::new();
        let conn = Recording::new(Outcome::Ok);
        let id = ConnectionId::next();

        activate(&registry, id, &conn, &SecurityState::for_user(5_i64))
            .await
            .unwrap();

        assert_eq!(registry.owner(id), Some(ContextId::current()));
        let executed = conn.executed.lock();
        assert_eq!(executed.len(), 1);
        assert!(executed[0].starts_with("SET SESSION rls.disable = 'FALSE';"));
        assert!(executed[0].contains("SET SESSION rls.user_id = '5'"));
    }

    #[tokio::test]
    async fn uses_local_scope_inside_transaction() {
        let registry = ConnectionRegistry::new();
        let conn = Recording {
            in_tx: true,
            ..Recording::new(Outcome::Ok)
        };

        activate(&registry, ConnectionId::next(), &conn, &SecurityState::disabled())
            .await
            .unwrap();

        assert!(conn.executed.lock()[0].starts_with("SET LOCAL rls.disable = 'TRUE';"));
    }

    #[tokio::test]
    async fn skips_connections_without_enforcement() {
        let registry = ConnectionRegistry::new();
        let conn = Recording {
            applicable: false,
            ..Recording::new(Outcome::Ok)
        };
        let id = ConnectionId::next();

        activate(&registry, id, &conn, &SecurityState::for_user(1_i64))
            .await
            .unwrap();

        assert!(conn.executed.lock().is_empty());
        assert_eq!(registry.owner(id), None);
    }

    #[tokio::test]
    #[traced_test]
    async fn aborted_transaction_is_swallowed() {
        let registry = ConnectionRegistry::new();
        let conn = Recording::new(Outcome::Aborted);

        let res = activate(
            &registry,
            ConnectionId::next(),
            &conn,
            &SecurityState::for_user(1_i64),
        )
        .await;

        assert!(res.is_ok());
        assert!(logs_contain("transaction is aborted"));
    }

    #[tokio::test]
    async fn other_failures_propagate() {
        let registry = ConnectionRegistry::new();
        let conn = Recording::new(Outcome::Broken);

        let err = activate(
            &registry,
            ConnectionId::next(),
            &conn,
            &SecurityState::for_user(1_i64),
        )
        .await
        .unwrap_err();

        assert!(!err.is_transaction_aborted());
        assert!(err.to_string().contains("connection reset"));
    }
}
