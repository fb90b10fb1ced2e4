//! Lease pool handing out guarded connections per execution context.
//!
//! A context holds at most one lease per pool. Dropped leases go back to an
//! idle list and may be leased by any other context afterwards, which is
//! exactly the reuse the [`GuardedConnection`] protects against.

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::config::PoolConfig;
use crate::connection::{ManagedConnection, SessionConnection};
use crate::context::ContextId;
use crate::error::{RlsError, StatementError};
use crate::guard::GuardedConnection;
use crate::manager::SessionTracker;

/// Opens physical connections for a [`LeasePool`].
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Conn: SessionConnection + 'static;

    /// # Errors
    /// Returns the backend failure when the connection cannot be opened.
    async fn connect(&self) -> Result<Self::Conn, StatementError>;
}

/// Anything that can enumerate the connections a context currently holds.
pub trait ConnectionSource: Send + Sync {
    fn active_connections(&self, ctx: ContextId) -> Vec<Arc<dyn ManagedConnection>>;
}

/// Called by a pool after a connection is leased from the idle list or freshly
/// opened.
#[async_trait]
pub trait CheckoutHook: Send + Sync {
    /// # Errors
    /// Returns the activation failure; the pool then abandons the lease.
    async fn on_checkout(&self, conn: &dyn ManagedConnection) -> Result<(), RlsError>;
}

#[async_trait]
impl CheckoutHook for SessionTracker {
    async fn on_checkout(&self, conn: &dyn ManagedConnection) -> Result<(), RlsError> {
        let Some(state) = self.stack().peek(ContextId::current()) else {
            return Ok(());
        };
        conn.activate(&state).await
    }
}

type Shared<C> = Arc<GuardedConnection<C>>;

/// Bookkeeping shared by a pool and the leases it hands out.
struct Slots<C> {
    pool: String,
    max_idle: usize,
    leases: DashMap<ContextId, LeaseEntry<C>>,
    idle: Mutex<Vec<Shared<C>>>,
    pinned: Mutex<Option<Shared<C>>>,
}

struct LeaseEntry<C> {
    checkout: Weak<Checkout<C>>,
    conn: Shared<C>,
}

impl<C> Slots<C> {
    fn is_pinned(&self, conn: &Shared<C>) -> bool {
        self.pinned
            .lock()
            .as_ref()
            .is_some_and(|pinned| Arc::ptr_eq(pinned, conn))
    }

    fn is_leased(&self, conn: &Shared<C>) -> bool {
        self.leases
            .iter()
            .any(|entry| Arc::ptr_eq(&entry.conn, conn))
    }

    /// Return `conn` once the last handle of `ctx` is gone.
    ///
    /// The connection only goes back to the idle list when no other context
    /// holds it and it is not the pinned one.
    fn check_in(&self, ctx: ContextId, conn: &Shared<C>) {
        self.leases
            .remove_if(&ctx, |_, entry| entry.checkout.strong_count() == 0);
        debug!(pool = %self.pool, connection = %conn.id(), context = %ctx, "connection released");

        if self.is_pinned(conn) || self.is_leased(conn) {
            return;
        }
        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle && !idle.iter().any(|c| Arc::ptr_eq(c, conn)) {
            idle.push(Arc::clone(conn));
        }
    }
}

struct Checkout<C> {
    ctx: ContextId,
    conn: Shared<C>,
    slots: Arc<Slots<C>>,
}

impl<C> Drop for Checkout<C> {
    fn drop(&mut self) {
        self.slots.check_in(self.ctx, &self.conn);
    }
}

/// A context's lease on a pooled connection.
///
/// Handles are cheap to clone; every [`LeasePool::connection`] call made by
/// the same context returns a handle to the same lease. The connection goes
/// back to the pool when the last handle is dropped, including when the task
/// holding it ends or panics.
pub struct PooledConnection<C>(Arc<Checkout<C>>);

impl<C> PooledConnection<C> {
    /// The guarded connection shared by every handle of this lease.
    #[must_use]
    pub fn shared(&self) -> &Arc<GuardedConnection<C>> {
        &self.0.conn
    }
}

impl<C> Clone for PooledConnection<C> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<C> Deref for PooledConnection<C> {
    type Target = GuardedConnection<C>;

    fn deref(&self) -> &Self::Target {
        &self.0.conn
    }
}

impl<C> AsRef<GuardedConnection<C>> for PooledConnection<C> {
    fn as_ref(&self) -> &GuardedConnection<C> {
        &self.0.conn
    }
}

impl<C> std::fmt::Debug for PooledConnection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("pool", &self.0.slots.pool)
            .field("context", &self.0.ctx)
            .field("connection", &self.0.conn.id())
            .finish()
    }
}

/// Per-context connection leases over a [`Connector`].
pub struct LeasePool<K: Connector> {
    name: String,
    connector: K,
    tracker: Arc<SessionTracker>,
    config: PoolConfig,
    pin: AtomicBool,
    slots: Arc<Slots<K::Conn>>,
}

impl<K: Connector> std::fmt::Debug for LeasePool<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeasePool")
            .field("name", &self.name)
            .field("config", &self.config())
            .field("leases", &self.leased())
            .field("idle", &self.idle())
            .finish_non_exhaustive()
    }
}

impl<K: Connector> LeasePool<K> {
    /// Prefer [`RlsManager::create_pool`](crate::RlsManager::create_pool),
    /// which also registers the pool for broadcasts.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        connector: K,
        tracker: Arc<SessionTracker>,
        config: PoolConfig,
    ) -> Self {
        let name = name.into();
        if config.pin_connection {
            debug!(pool = %name, "pool created with connection pinning");
        }
        Self {
            slots: Arc::new(Slots {
                pool: name.clone(),
                max_idle: config.max_idle,
                leases: DashMap::new(),
                idle: Mutex::new(Vec::new()),
                pinned: Mutex::new(None),
            }),
            name,
            connector,
            tracker,
            config,
            pin: AtomicBool::new(config.pin_connection),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn config(&self) -> PoolConfig {
        PoolConfig {
            pin_connection: self.is_pinning(),
            ..self.config
        }
    }

    #[must_use]
    pub fn is_pinning(&self) -> bool {
        self.pin.load(Ordering::Acquire)
    }

    /// Lease for the calling context.
    ///
    /// Returns the context's current lease when it has one. Otherwise leases
    /// the pinned connection (shared, no checkout hook), an idle connection or
    /// a freshly opened one, and runs the checkout hook on the latter two.
    ///
    /// # Errors
    /// Returns [`RlsError::Statement`] when a connection cannot be opened and
    /// the checkout hook's error when activation fails.
    pub async fn connection(&self) -> Result<PooledConnection<K::Conn>, RlsError> {
        let ctx = ContextId::current();
        let existing = self
            .slots
            .leases
            .get(&ctx)
            .and_then(|entry| entry.checkout.upgrade());
        if let Some(checkout) = existing {
            return Ok(PooledConnection(checkout));
        }

        let pinning = self.is_pinning();
        if pinning {
            let pinned = self.slots.pinned.lock().clone();
            if let Some(conn) = pinned {
                return Ok(self.lease(ctx, conn));
            }
        }

        let recycled = self.slots.idle.lock().pop();
        let conn = match recycled {
            Some(conn) => conn,
            None => {
                let raw = self.connector.connect().await?;
                let conn = Arc::new(GuardedConnection::new(raw, Arc::clone(&self.tracker)));
                debug!(pool = %self.name, connection = %conn.id(), "opened connection");
                conn
            }
        };

        self.tracker.on_checkout(conn.as_ref()).await?;

        if pinning {
            *self.slots.pinned.lock() = Some(Arc::clone(&conn));
        }
        debug!(pool = %self.name, connection = %conn.id(), context = %ctx, "connection checked out");
        Ok(self.lease(ctx, conn))
    }

    fn lease(&self, ctx: ContextId, conn: Shared<K::Conn>) -> PooledConnection<K::Conn> {
        let checkout = Arc::new(Checkout {
            ctx,
            conn: Arc::clone(&conn),
            slots: Arc::clone(&self.slots),
        });
        self.slots.leases.insert(
            ctx,
            LeaseEntry {
                checkout: Arc::downgrade(&checkout),
                conn,
            },
        );
        PooledConnection(checkout)
    }

    /// Share the next leased connection with every context.
    pub fn pin_connection(&self) {
        self.pin.store(true, Ordering::Release);
    }

    /// Stop sharing; the pinned connection stays with contexts that hold it
    /// and returns to the idle list after the last of them lets go.
    pub fn unpin_connection(&self) {
        self.pin.store(false, Ordering::Release);
        self.slots.pinned.lock().take();
    }

    /// Number of contexts currently holding a lease.
    #[must_use]
    pub fn leased(&self) -> usize {
        self.slots.leases.len()
    }

    #[must_use]
    pub fn idle(&self) -> usize {
        self.slots.idle.lock().len()
    }
}

impl<K: Connector> ConnectionSource for LeasePool<K> {
    fn active_connections(&self, ctx: ContextId) -> Vec<Arc<dyn ManagedConnection>> {
        self.slots
            .leases
            .get(&ctx)
            .map(|entry| vec![Arc::clone(&entry.conn) as Arc<dyn ManagedConnection>])
            .unwrap_or_default()
    }
}
