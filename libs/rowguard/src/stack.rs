//! Per-context stack of security states.

use dashmap::DashMap;

use crate::context::ContextId;
use crate::error::RlsError;
use crate::state::SecurityState;

/// Nested security states keyed by execution context.
///
/// Each context only ever touches its own entry, so the map is the only point
/// of contention between concurrent contexts. An entry is removed as soon as
/// its stack becomes empty, which keeps the map bounded by the number of
/// contexts currently inside a scope.
#[derive(Debug, Default)]
pub struct ContextStack {
    stacks: DashMap<ContextId, Vec<SecurityState>>,
}

impl ContextStack {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, ctx: ContextId, state: SecurityState) {
        self.stacks.entry(ctx).or_default().push(state);
    }

    /// Remove and return the innermost state of `ctx`.
    ///
    /// # Errors
    /// Returns [`RlsError::StackUnderflow`] when `ctx` has no open scope.
    pub fn pop(&self, ctx: ContextId) -> Result<SecurityState, RlsError> {
        let popped = {
            let Some(mut stack) = self.stacks.get_mut(&ctx) else {
                return Err(RlsError::StackUnderflow(ctx));
            };
            stack.pop()
        };
        self.stacks.remove_if(&ctx, |_, stack| stack.is_empty());
        popped.ok_or(RlsError::StackUnderflow(ctx))
    }

    #[must_use]
    pub fn peek(&self, ctx: ContextId) -> Option<SecurityState> {
        self.stacks.get(&ctx).and_then(|stack| stack.last().cloned())
    }

    #[must_use]
    pub fn depth(&self, ctx: ContextId) -> usize {
        self.stacks.get(&ctx).map_or(0, |stack| stack.len())
    }

    #[must_use]
    pub fn is_active(&self, ctx: ContextId) -> bool {
        self.stacks.contains_key(&ctx)
    }

    /// Number of contexts with at least one open scope.
    #[must_use]
    pub fn contexts(&self) -> usize {
        self.stacks.len()
    }
}
