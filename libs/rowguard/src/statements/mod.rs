//! Reversible schema statements for row-level security.
//!
//! Each operation knows its own inverse, so a migration written once can be
//! run [`Direction::Up`] to apply it or [`Direction::Down`] to revert it:
//!
//! ```rust,ignore
//! let rls = RlsStatements::new(&conn, &config, Direction::Up);
//! rls.enable_rls("users", true).await?;
//! rls.create_policy("users", PolicySource::Version(1)).await?;
//! ```

mod policy;

pub use policy::{PolicyCatalog, PolicyRef, PolicySource, parse_policies};

use tracing::{debug, info};

use crate::config::RlsConfig;
use crate::connection::{SessionConnection, is_plain_identifier};
use crate::error::RlsError;

/// Which way a migration runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    #[must_use]
    pub fn reversed(self) -> Self {
        match self {
            Direction::Up => Direction::Down,
            Direction::Down => Direction::Up,
        }
    }
}

/// Lists the policies currently attached to a table.
const LIST_TABLE_POLICIES_SQL: &str = "SELECT policyname FROM pg_policies WHERE tablename = ";

/// Migration-time helpers bound to one connection and direction.
pub struct RlsStatements<'c, C: SessionConnection + ?Sized> {
    conn: &'c C,
    catalog: PolicyCatalog,
    direction: Direction,
    verbose: bool,
}

impl<'c, C: SessionConnection + ?Sized> RlsStatements<'c, C> {
    #[must_use]
    pub fn new(conn: &'c C, config: &RlsConfig, direction: Direction) -> Self {
        Self {
            conn,
            catalog: PolicyCatalog::new(config.policy_dir.clone()),
            direction,
            verbose: config.verbose,
        }
    }

    #[must_use]
    pub fn with_catalog(conn: &'c C, catalog: PolicyCatalog, direction: Direction) -> Self {
        Self {
            conn,
            catalog,
            direction,
            verbose: false,
        }
    }

    #[must_use]
    pub fn direction(&self) -> Direction {
        self.direction
    }

    #[must_use]
    pub fn catalog(&self) -> &PolicyCatalog {
        &self.catalog
    }

    /// Same helpers, opposite direction.
    #[must_use]
    pub fn reverted(&self) -> Self {
        Self {
            conn: self.conn,
            catalog: self.catalog.clone(),
            direction: self.direction.reversed(),
            verbose: self.verbose,
        }
    }

    /// Up: `ENABLE ROW LEVEL SECURITY` with the force sub-flag.
    /// Down: `DISABLE ROW LEVEL SECURITY, NO FORCE ROW LEVEL SECURITY`.
    ///
    /// # Errors
    /// Returns the statement failure.
    pub async fn enable_rls(&self, table: &str, force: bool) -> Result<(), RlsError> {
        match self.direction {
            Direction::Up => self.alter_table(table, Some(true), Some(force)).await,
            Direction::Down => self.alter_table(table, Some(false), Some(false)).await,
        }
    }

    /// Up: `DISABLE ROW LEVEL SECURITY` with the force sub-flag.
    /// Down: enables again with the same force sub-flag.
    ///
    /// # Errors
    /// Returns the statement failure.
    pub async fn disable_rls(&self, table: &str, force: bool) -> Result<(), RlsError> {
        let enabled = self.direction == Direction::Down;
        self.alter_table(table, Some(enabled), Some(force)).await
    }

    /// Up: run the policy definition. Down: drop every policy it creates.
    ///
    /// # Errors
    /// Returns [`RlsError::PolicyNotFound`] for a missing file,
    /// [`RlsError::InvalidPolicy`] when the inverse cannot be derived, or the
    /// statement failure.
    pub async fn create_policy(&self, table: &str, source: PolicySource) -> Result<(), RlsError> {
        let definition = match source {
            PolicySource::Version(version) => self.catalog.load(table, version)?,
            PolicySource::Definition(sql) => sql,
        };
        match self.direction {
            Direction::Up => self.perform(&definition).await,
            Direction::Down => self.drop_defined(&definition).await,
        }
    }

    /// Up: drop the policies of `version` (latest on disk when `None`).
    /// Down: re-create them from the same file.
    ///
    /// # Errors
    /// Same as [`RlsStatements::create_policy`].
    pub async fn drop_policy(&self, table: &str, version: Option<u32>) -> Result<(), RlsError> {
        let version = self.version_or_last(table, version)?;
        let definition = self.catalog.load(table, version)?;
        match self.direction {
            Direction::Up => self.drop_defined(&definition).await,
            Direction::Down => self.perform(&definition).await,
        }
    }

    /// Replace the policies of `table`.
    ///
    /// Up: drops every policy currently on the table and creates `version`,
    /// or the latest version on disk. The definition is loaded and parsed
    /// before anything is dropped, so a missing or malformed file leaves the
    /// table's policies untouched.
    ///
    /// Down: drops `version` (latest when `None`) and re-creates
    /// `revert_to_version`. Without `revert_to_version` it can only revert the
    /// very first version, which leaves the table without policies.
    ///
    /// # Errors
    /// Returns [`RlsError::IrreversibleMigration`] when reverting needs a
    /// `revert_to_version` that was not given, or the file and statement
    /// failures of the other operations.
    pub async fn update_policy(
        &self,
        table: &str,
        version: Option<u32>,
        revert_to_version: Option<u32>,
    ) -> Result<(), RlsError> {
        match self.direction {
            Direction::Up => {
                let version = self.version_or_last(table, version)?.max(1);
                let definition = self.catalog.load(table, version)?;
                parse_policies(&definition)?;

                self.drop_policies_for(table).await?;
                self.perform(&definition).await
            }
            Direction::Down => {
                let target = match revert_to_version {
                    Some(target) => target,
                    None => {
                        let previous = self.catalog.last_version(table)?.saturating_sub(1);
                        if previous > 0 {
                            return Err(RlsError::IrreversibleMigration(format!(
                                "update_policy on '{table}': revert_to_version missing"
                            )));
                        }
                        previous
                    }
                };

                let current = self.version_or_last(table, version)?;
                self.drop_defined(&self.catalog.load(table, current)?).await?;
                if target > 0 {
                    self.perform(&self.catalog.load(table, target)?).await?;
                }
                Ok(())
            }
        }
    }

    /// Up: set the force sub-flag to `force`. Down: set it to `!force`.
    ///
    /// # Errors
    /// Returns the statement failure.
    pub async fn change_policy_force(&self, table: &str, force: bool) -> Result<(), RlsError> {
        let force = match self.direction {
            Direction::Up => force,
            Direction::Down => !force,
        };
        self.alter_table(table, None, Some(force)).await
    }

    async fn alter_table(
        &self,
        table: &str,
        enabled: Option<bool>,
        force: Option<bool>,
    ) -> Result<(), RlsError> {
        let clauses: Vec<&str> = [
            enabled.map(|on| {
                if on {
                    "ENABLE ROW LEVEL SECURITY"
                } else {
                    "DISABLE ROW LEVEL SECURITY"
                }
            }),
            force.map(|on| {
                if on {
                    "FORCE ROW LEVEL SECURITY"
                } else {
                    "NO FORCE ROW LEVEL SECURITY"
                }
            }),
        ]
        .into_iter()
        .flatten()
        .collect();
        if clauses.is_empty() {
            return Ok(());
        }

        let sql = format!(
            "ALTER TABLE {} {}",
            self.table_name(table),
            clauses.join(", ")
        );
        self.perform(&sql).await
    }

    async fn drop_policies_for(&self, table: &str) -> Result<(), RlsError> {
        let sql = match table.split_once('.') {
            Some((schema, bare)) => format!(
                "{LIST_TABLE_POLICIES_SQL}{} AND schemaname = {}",
                self.conn.quote_literal(bare),
                self.conn.quote_literal(schema)
            ),
            None => format!("{LIST_TABLE_POLICIES_SQL}{}", self.conn.quote_literal(table)),
        };
        let rows = self.conn.execute_statement(&sql).await?;
        let table_name = self.table_name(table);
        for name in rows.iter().filter_map(|row| row.get("policyname")) {
            let drop = format!("DROP POLICY {} ON {table_name}", self.identifier(name));
            self.perform(&drop).await?;
        }
        Ok(())
    }

    async fn drop_defined(&self, definition: &str) -> Result<(), RlsError> {
        for policy in parse_policies(definition)? {
            self.perform(&policy.drop_sql()).await?;
        }
        Ok(())
    }

    fn version_or_last(&self, table: &str, version: Option<u32>) -> Result<u32, RlsError> {
        match version {
            Some(version) => Ok(version),
            None => self.catalog.last_version(table),
        }
    }

    async fn perform(&self, sql: &str) -> Result<(), RlsError> {
        if self.verbose {
            info!(direction = ?self.direction, "{sql}");
        } else {
            debug!(direction = ?self.direction, "{sql}");
        }
        self.conn.execute_statement(sql).await?;
        Ok(())
    }

    /// `schema.table` with each part quoted only when it needs to be.
    fn table_name(&self, table: &str) -> String {
        table
            .split('.')
            .map(|part| self.identifier(part))
            .collect::<Vec<_>>()
            .join(".")
    }

    fn identifier(&self, name: &str) -> String {
        if is_plain_identifier(name) {
            name.to_owned()
        } else {
            self.conn.quote_identifier(name)
        }
    }
}
