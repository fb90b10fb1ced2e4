//! Security state values and their wire encoding.

use std::fmt;

use uuid::Uuid;

use crate::connection::SessionConnection;

/// Session variable holding the disable flag (`'TRUE'` / `'FALSE'`).
pub const DISABLE_SETTING: &str = "rls.disable";
/// Session variable holding the acting user id, empty when absent.
pub const USER_ID_SETTING: &str = "rls.user_id";
/// Session variable holding the tenant id, empty when absent.
pub const TENANT_ID_SETTING: &str = "rls.tenant_id";

/// Textual identifier of a user or tenant as written into the session.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RlsId(String);

impl RlsId {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RlsId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RlsId {
    fn from(value: &str) -> Self {
        RlsId(value.to_owned())
    }
}

impl From<String> for RlsId {
    fn from(value: String) -> Self {
        RlsId(value)
    }
}

impl From<Uuid> for RlsId {
    fn from(value: Uuid) -> Self {
        RlsId(value.to_string())
    }
}

impl From<i64> for RlsId {
    fn from(value: i64) -> Self {
        RlsId(value.to_string())
    }
}

impl From<i32> for RlsId {
    fn from(value: i32) -> Self {
        RlsId(value.to_string())
    }
}

impl From<u64> for RlsId {
    fn from(value: u64) -> Self {
        RlsId(value.to_string())
    }
}

/// Scope at which session variables are set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SettingScope {
    /// `SET LOCAL`: reverted when the enclosing transaction ends.
    Local,
    /// `SET SESSION`: lasts for the lifetime of the connection.
    Session,
}

impl SettingScope {
    /// `LOCAL` while a transaction is open, `SESSION` otherwise.
    #[must_use]
    pub fn for_transaction(transaction_open: bool) -> Self {
        if transaction_open {
            SettingScope::Local
        } else {
            SettingScope::Session
        }
    }

    #[must_use]
    pub fn as_sql(self) -> &'static str {
        match self {
            SettingScope::Local => "LOCAL",
            SettingScope::Session => "SESSION",
        }
    }
}

/// Immutable security attributes for one scoped session.
///
/// The default value carries no user, no tenant and enforcement enabled, and
/// is what a context without an open scope runs under.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SecurityState {
    user: Option<RlsId>,
    tenant: Option<RlsId>,
    disabled: Option<bool>,
}

impl SecurityState {
    #[must_use]
    pub fn new(user: Option<RlsId>, tenant: Option<RlsId>, disabled: Option<bool>) -> Self {
        Self {
            user,
            tenant,
            disabled,
        }
    }

    #[must_use]
    pub fn builder() -> SecurityStateBuilder {
        SecurityStateBuilder::default()
    }

    /// State with enforcement switched off and no identity attached.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            disabled: Some(true),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn for_user(user: impl Into<RlsId>) -> Self {
        Self::builder().user(user).build()
    }

    #[must_use]
    pub fn for_tenant(tenant: impl Into<RlsId>) -> Self {
        Self::builder().tenant(tenant).build()
    }

    #[must_use]
    pub fn user(&self) -> Option<&RlsId> {
        self.user.as_ref()
    }

    #[must_use]
    pub fn tenant(&self) -> Option<&RlsId> {
        self.tenant.as_ref()
    }

    /// The flag as given; `None` when the scope did not set it.
    #[must_use]
    pub fn disabled_flag(&self) -> Option<bool> {
        self.disabled
    }

    /// Whether enforcement is off. An unset flag counts as `false`.
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.disabled.unwrap_or(false)
    }

    /// Build the compound statement that applies this state to `conn`.
    ///
    /// All three variables are set together so a statement can never observe a
    /// mix of two states.
    #[must_use]
    pub fn to_sql<C>(&self, conn: &C, scope: SettingScope) -> String
    where
        C: SessionConnection + ?Sized,
    {
        let scope = scope.as_sql();
        let disable = if self.is_disabled() { "TRUE" } else { "FALSE" };
        let user = self.user.as_ref().map_or("", RlsId::as_str);
        let tenant = self.tenant.as_ref().map_or("", RlsId::as_str);
        [
            format!("SET {scope} {DISABLE_SETTING} = {}", conn.quote_literal(disable)),
            format!("SET {scope} {USER_ID_SETTING} = {}", conn.quote_literal(user)),
            format!("SET {scope} {TENANT_ID_SETTING} = {}", conn.quote_literal(tenant)),
        ]
        .join(";")
    }
}

#[derive(Default)]
pub struct SecurityStateBuilder {
    user: Option<RlsId>,
    tenant: Option<RlsId>,
    disabled: Option<bool>,
}

impl SecurityStateBuilder {
    #[must_use]
    pub fn user(mut self, user: impl Into<RlsId>) -> Self {
        self.user = Some(user.into());
        self
    }

    #[must_use]
    pub fn tenant(mut self, tenant: impl Into<RlsId>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }

    #[must_use]
    pub fn disabled(mut self, disabled: bool) -> Self {
        self.disabled = Some(disabled);
        self
    }

    #[must_use]
    pub fn build(self) -> SecurityState {
        SecurityState {
            user: self.user,
            tenant: self.tenant,
            disabled: self.disabled,
        }
    }
}
