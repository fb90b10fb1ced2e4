//! Connection ownership hints.

use dashmap::DashMap;

use crate::connection::ConnectionId;
use crate::context::ContextId;

/// Records which execution context last activated each connection.
///
/// This is a cache hint, not a lock: a stale entry only costs one redundant
/// activation the next time the connection is used.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    owners: DashMap<ConnectionId, ContextId>,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, conn: ConnectionId, ctx: ContextId) {
        self.owners.insert(conn, ctx);
    }

    #[must_use]
    pub fn owner(&self, conn: ConnectionId) -> Option<ContextId> {
        self.owners.get(&conn).map(|owner| *owner)
    }

    pub fn forget(&self, conn: ConnectionId) {
        self.owners.remove(&conn);
    }

    /// Drop every ownership claim held by `ctx`, forcing the next statement on
    /// those connections through a repair.
    pub fn forget_context(&self, ctx: ContextId) {
        self.owners.retain(|_, owner| *owner != ctx);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.owners.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }
}
