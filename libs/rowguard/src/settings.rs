//! Readback of the RLS session variables.

use crate::connection::SessionConnection;
use crate::error::StatementError;

/// Reads all three variables in one round trip. `current_setting(_, TRUE)`
/// yields `NULL` instead of failing when a variable was never set.
pub const READBACK_SQL: &str = "SELECT current_setting('rls.tenant_id', TRUE) AS tenant_id, current_setting('rls.user_id', TRUE) AS user_id, current_setting('rls.disable', TRUE) AS disable";

/// Values of the RLS variables as the server currently sees them.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionSettings {
    pub tenant_id: Option<String>,
    pub user_id: Option<String>,
    pub disable: Option<String>,
}

impl SessionSettings {
    /// # Errors
    /// Returns the connection's failure.
    pub async fn read<C>(conn: &C) -> Result<Self, StatementError>
    where
        C: SessionConnection + ?Sized,
    {
        let rows = conn.execute_statement(READBACK_SQL).await?;
        let Some(row) = rows.first() else {
            return Ok(Self::default());
        };
        Ok(Self {
            tenant_id: row.get("tenant_id").map(str::to_owned),
            user_id: row.get("user_id").map(str::to_owned),
            disable: row.get("disable").map(str::to_owned),
        })
    }

    /// Whether the session currently bypasses the policies.
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.disable
            .as_deref()
            .is_some_and(|flag| flag.eq_ignore_ascii_case("true"))
    }

    /// `(tenant_id, user_id, disable)` with unset values as empty strings.
    #[must_use]
    pub fn as_tuple(&self) -> (&str, &str, &str) {
        (
            self.tenant_id.as_deref().unwrap_or_default(),
            self.user_id.as_deref().unwrap_or_default(),
            self.disable.as_deref().unwrap_or_default(),
        )
    }
}
