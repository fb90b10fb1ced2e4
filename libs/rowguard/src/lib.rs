#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
//! Row-level security context propagation for pooled `PostgreSQL` connections.
//!
//! Physical connections are recycled across unrelated requests and jobs, but
//! row-level security policies read the acting user and tenant from
//! session-scoped variables. This crate keeps those variables correct:
//!
//! - [`RlsManager::with`] establishes a [`SecurityState`] for the duration of an
//!   async block and restores the enclosing state on every exit path.
//! - Every connection handed out by a [`LeasePool`] is a [`GuardedConnection`]
//!   that re-activates the caller's state before a statement runs if another
//!   execution context configured it last.
//! - The [`statements`] module carries the migration glue for enabling RLS on
//!   tables and managing policies.
//!
//! # Example
//!
//! ```rust,ignore
//! use rowguard::{RlsManager, SecurityState, PoolConfig};
//! use rowguard::pg::PgConnector;
//!
//! let manager = RlsManager::new();
//! let pool = manager.create_pool("main", PgConnector::from_config(&db_cfg)?, PoolConfig::default());
//!
//! let state = SecurityState::builder().user(user_id).tenant(tenant_id).build();
//! manager
//!     .with(state, || async {
//!         let conn = pool.connection().await?;
//!         conn.execute_statement("SELECT * FROM documents").await?;
//!         Ok::<_, rowguard::RlsError>(())
//!     })
//!     .await?;
//! ```

pub mod activation;
pub mod config;
pub mod connection;
pub mod context;
pub mod dump;
mod error;
pub mod guard;
pub mod manager;
#[cfg(feature = "pg")]
pub mod pg;
pub mod pool;
pub mod registry;
pub mod settings;
pub mod stack;
pub mod state;
pub mod statements;

pub use config::{DatabaseConfig, PoolConfig, RlsConfig};
pub use connection::{ConnectionId, ManagedConnection, Row, SessionConnection};
pub use context::ContextId;
pub use error::{RlsError, StatementError};
pub use guard::GuardedConnection;
pub use manager::{RlsManager, SessionTracker};
pub use pool::{CheckoutHook, ConnectionSource, Connector, LeasePool, PooledConnection};
pub use settings::SessionSettings;
pub use state::{RlsId, SecurityState, SettingScope};

/// Library-local result type.
pub type Result<T> = std::result::Result<T, RlsError>;
