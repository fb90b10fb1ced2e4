//! Execution-context identity.
//!
//! Security state is isolated per execution context. Inside a tokio task the
//! task id is used, so state follows the task across worker threads and
//! `.await` points. Outside of any task (plain threads, `block_on`) the OS
//! thread id is used instead.

use std::fmt;
use std::thread::ThreadId;

/// Identity of the execution context issuing a statement.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ContextId {
    Task(tokio::task::Id),
    Thread(ThreadId),
}

impl ContextId {
    /// Identity of the caller: the current tokio task, or the current thread.
    #[must_use]
    pub fn current() -> Self {
        tokio::task::try_id().map_or_else(
            || ContextId::Thread(std::thread::current().id()),
            ContextId::Task,
        )
    }
}

impl fmt::Display for ContextId {
    #[allow(clippy::use_debug)] // ThreadId has no stable numeric accessor
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextId::Task(id) => write!(f, "task {id}"),
            ContextId::Thread(id) => write!(f, "thread {id:?}"),
        }
    }
}
