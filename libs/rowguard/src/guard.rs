//! Ownership repair in front of every statement.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::activation::activate;
use crate::connection::{ConnectionId, ManagedConnection, Row, SessionConnection};
use crate::context::ContextId;
use crate::error::{RlsError, StatementError};
use crate::manager::SessionTracker;
use crate::state::SecurityState;

/// Decorator that keeps a shared connection configured for whoever uses it.
///
/// Before delegating a statement to the inner connection the guard checks
/// which context activated the connection last. If that is not the caller,
/// the caller's innermost [`SecurityState`] (or the default state when it has
/// no open scope) is activated first. The check-and-repair step is serialized
/// per connection; the statement itself is not.
pub struct GuardedConnection<C> {
    id: ConnectionId,
    inner: C,
    tracker: Arc<SessionTracker>,
    repair_lock: tokio::sync::Mutex<()>,
    repairing: Mutex<Option<ContextId>>,
}

impl<C> std::fmt::Debug for GuardedConnection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardedConnection")
            .field("id", &self.id)
            .field("owner", &self.tracker.registry().owner(self.id))
            .finish_non_exhaustive()
    }
}

impl<C> GuardedConnection<C> {
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl<C: SessionConnection> GuardedConnection<C> {
    #[must_use]
    pub fn new(inner: C, tracker: Arc<SessionTracker>) -> Self {
        Self {
            id: ConnectionId::next(),
            inner,
            tracker,
            repair_lock: tokio::sync::Mutex::new(()),
            repairing: Mutex::new(None),
        }
    }

    /// The wrapped connection.
    ///
    /// Statements issued directly on it skip ownership repair.
    #[must_use]
    pub fn get_ref(&self) -> &C {
        &self.inner
    }

    /// Re-activate the caller's state if another context owns the connection.
    ///
    /// # Errors
    /// Returns the activation failure, if any.
    pub async fn repair_ownership(&self) -> Result<(), StatementError> {
        if !self.inner.is_enforcement_applicable() {
            return Ok(());
        }

        let ctx = ContextId::current();
        if self.repairing.lock().is_some_and(|holder| holder == ctx) {
            trace!(connection = %self.id, context = %ctx, "reentrant ownership repair ignored");
            return Ok(());
        }

        let _permit = self.repair_lock.lock().await;
        let owner = self.tracker.registry().owner(self.id);
        if owner == Some(ctx) {
            return Ok(());
        }

        *self.repairing.lock() = Some(ctx);
        let _marker = RepairMarker(&self.repairing);

        let state = self.tracker.stack().peek(ctx).unwrap_or_default();
        debug!(
            connection = %self.id,
            context = %ctx,
            previous_owner = owner.map(tracing::field::display),
            "connection last configured by another context, reactivating"
        );
        activate(self.tracker.registry(), self.id, &self.inner, &state).await
    }
}

/// Clears the in-repair marker however the repair ends.
struct RepairMarker<'a>(&'a Mutex<Option<ContextId>>);

impl Drop for RepairMarker<'_> {
    fn drop(&mut self) {
        *self.0.lock() = None;
    }
}

#[async_trait]
impl<C: SessionConnection> SessionConnection for GuardedConnection<C> {
    async fn execute_statement(&self, sql: &str) -> Result<Vec<Row>, StatementError> {
        self.repair_ownership().await?;
        self.inner.execute_statement(sql).await
    }

    fn is_enforcement_applicable(&self) -> bool {
        self.inner.is_enforcement_applicable()
    }

    fn is_transaction_open(&self) -> bool {
        self.inner.is_transaction_open()
    }

    fn quote_literal(&self, value: &str) -> String {
        self.inner.quote_literal(value)
    }

    fn quote_identifier(&self, name: &str) -> String {
        self.inner.quote_identifier(name)
    }
}

#[async_trait]
impl<C: SessionConnection> ManagedConnection for GuardedConnection<C> {
    fn connection_id(&self) -> ConnectionId {
        self.id
    }

    async fn activate(&self, state: &SecurityState) -> Result<(), RlsError> {
        activate(self.tracker.registry(), self.id, &self.inner, state)
            .await
            .map_err(|source| RlsError::Activation {
                connection: self.id,
                source,
            })
    }
}

impl<C> Drop for GuardedConnection<C> {
    fn drop(&mut self) {
        self.tracker.registry().forget(self.id);
    }
}
