//! Process-wide entry point for scoped security sessions.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::RwLock;
use tracing::{debug, error, warn};

use crate::config::PoolConfig;
use crate::connection::ManagedConnection;
use crate::context::ContextId;
use crate::error::RlsError;
use crate::pool::{ConnectionSource, Connector, LeasePool};
use crate::registry::ConnectionRegistry;
use crate::stack::ContextStack;
use crate::state::SecurityState;

/// The state shared between the manager, pools and guarded connections: the
/// per-context stacks and the connection ownership hints.
#[derive(Debug, Default)]
pub struct SessionTracker {
    stack: ContextStack,
    registry: ConnectionRegistry,
}

impl SessionTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn stack(&self) -> &ContextStack {
        &self.stack
    }

    #[must_use]
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Innermost state of the calling context, or the default state.
    #[must_use]
    pub fn current_state(&self) -> SecurityState {
        self.stack.peek(ContextId::current()).unwrap_or_default()
    }
}

/// Owns the session tracker and every connection source of the process.
///
/// Build one at start-up and share it (`Arc<RlsManager>`) with request
/// handlers and jobs.
///
/// ```rust,ignore
/// let manager = RlsManager::new();
/// let pool = manager.create_pool("main", connector, PoolConfig::default());
///
/// manager
///     .with(SecurityState::for_tenant(tenant_id), || async {
///         let conn = pool.connection().await?;
///         conn.execute_statement("SELECT * FROM invoices").await?;
///         Ok::<_, RlsError>(())
///     })
///     .await?;
/// ```
pub struct RlsManager {
    tracker: Arc<SessionTracker>,
    sources: RwLock<Vec<Arc<dyn ConnectionSource>>>,
}

impl std::fmt::Debug for RlsManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RlsManager")
            .field("tracker", &self.tracker)
            .field("sources", &self.sources.read().len())
            .finish()
    }
}

impl Default for RlsManager {
    fn default() -> Self {
        Self::new()
    }
}

impl RlsManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            tracker: Arc::new(SessionTracker::new()),
            sources: RwLock::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn tracker(&self) -> &Arc<SessionTracker> {
        &self.tracker
    }

    /// Include `source` in every broadcast.
    pub fn register_source(&self, source: Arc<dyn ConnectionSource>) {
        self.sources.write().push(source);
    }

    /// Create a [`LeasePool`] wired to this manager's tracker and register it.
    pub fn create_pool<K: Connector>(
        &self,
        name: impl Into<String>,
        connector: K,
        config: PoolConfig,
    ) -> Arc<LeasePool<K>> {
        let pool = Arc::new(LeasePool::new(
            name,
            connector,
            Arc::clone(&self.tracker),
            config,
        ));
        self.register_source(Arc::clone(&pool) as Arc<dyn ConnectionSource>);
        pool
    }

    #[must_use]
    pub fn current_state(&self) -> SecurityState {
        self.tracker.current_state()
    }

    /// Activate `state` on every connection the calling context holds, across
    /// all registered sources. Any other connection the context configured
    /// earlier is repaired on its next statement.
    ///
    /// # Errors
    /// Stops at the first connection that fails with anything other than an
    /// aborted transaction; connections visited before it keep the new state.
    pub async fn broadcast_activate(&self, state: &SecurityState) -> Result<(), RlsError> {
        let ctx = ContextId::current();
        let connections: Vec<Arc<dyn ManagedConnection>> = self
            .sources
            .read()
            .iter()
            .flat_map(|source| source.active_connections(ctx))
            .collect();

        // Every claim of this context is stale now, including claims on
        // connections it only borrowed from another context's lease.
        self.tracker.registry.forget_context(ctx);
        for conn in connections {
            conn.activate(state).await?;
        }
        Ok(())
    }

    /// Run `body` under `state`.
    ///
    /// The state is pushed onto the calling context's stack and activated on
    /// every connection it holds. However `body` ends (success, error, panic)
    /// the state is popped and the enclosing state, or the default one, is
    /// activated again before control returns. Errors from `body` are returned
    /// unchanged; a panic resumes after the restore.
    ///
    /// If the returned future is dropped before completion the state is still
    /// popped and the context's connections are marked for repair on next use.
    ///
    /// # Errors
    /// Returns the body's error, or the activation error raised on entry or
    /// on exit.
    pub async fn with<T, E, F, Fut>(&self, state: SecurityState, body: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<RlsError>,
    {
        let ctx = ContextId::current();
        let entered = state.clone();
        self.tracker.stack.push(ctx, state);
        let mut guard = ScopeGuard::new(&self.tracker, ctx);

        let outcome = AssertUnwindSafe(async {
            self.broadcast_activate(&entered).await.map_err(E::from)?;
            body().await
        })
        .catch_unwind()
        .await;

        guard.disarm();
        let restored = self.exit(ctx).await;

        match outcome {
            Ok(Ok(value)) => {
                restored.map_err(E::from)?;
                Ok(value)
            }
            Ok(Err(err)) => {
                if let Err(restore_err) = restored {
                    error!(context = %ctx, error = %restore_err, "failed to restore security state after error");
                }
                Err(err)
            }
            Err(panic) => {
                if let Err(restore_err) = restored {
                    error!(context = %ctx, error = %restore_err, "failed to restore security state after panic");
                }
                std::panic::resume_unwind(panic)
            }
        }
    }

    /// Run `body` with row-level security disabled.
    ///
    /// # Errors
    /// Same as [`RlsManager::with`].
    pub async fn disabled<T, E, F, Fut>(&self, body: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<RlsError>,
    {
        self.with(SecurityState::disabled(), body).await
    }

    /// Disable row-level security for the calling context for good.
    ///
    /// The disabled state is pushed and never popped. Meant for maintenance
    /// tasks and consoles; scoped [`RlsManager::with`] calls made afterwards on
    /// the same context stack on top of it and fall back to it on exit.
    ///
    /// # Errors
    /// Returns the activation error, if any.
    pub async fn unsafe_disable(&self) -> Result<(), RlsError> {
        let ctx = ContextId::current();
        warn!(context = %ctx, "row-level security disabled until the context ends");
        let state = SecurityState::disabled();
        self.tracker.stack.push(ctx, state.clone());
        self.broadcast_activate(&state).await
    }

    async fn exit(&self, ctx: ContextId) -> Result<(), RlsError> {
        self.tracker.stack.pop(ctx)?;
        let restored = self.tracker.stack.peek(ctx).unwrap_or_default();
        debug!(context = %ctx, depth = self.tracker.stack.depth(ctx), "restoring security state");
        self.broadcast_activate(&restored).await
    }
}

/// Pops the scope if the `with` future is dropped mid-flight.
///
/// No statement can be awaited from `Drop`, so instead of re-broadcasting it
/// drops the context's ownership claims and lets the connection guard repair
/// each connection on its next statement.
struct ScopeGuard<'a> {
    tracker: &'a SessionTracker,
    ctx: ContextId,
    armed: bool,
}

impl<'a> ScopeGuard<'a> {
    fn new(tracker: &'a SessionTracker, ctx: ContextId) -> Self {
        Self {
            tracker,
            ctx,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        warn!(context = %self.ctx, "security scope cancelled, connections will be repaired lazily");
        if let Err(err) = self.tracker.stack.pop(self.ctx) {
            error!(context = %self.ctx, error = %err, "cancelled security scope had nothing to pop");
        }
        self.tracker.registry.forget_context(self.ctx);
    }
}
