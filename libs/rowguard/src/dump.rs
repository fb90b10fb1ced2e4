//! SQL dump of the row-level security setup of a database.
//!
//! Complements a plain schema dump, which does not carry `ENABLE ROW LEVEL
//! SECURITY` flags or policies in a form that can be replayed on its own.

use crate::connection::{Row, SessionConnection, is_plain_identifier};
use crate::error::RlsError;

pub const CURRENT_SCHEMA_SQL: &str = "SELECT current_schema() AS schemaname";

pub const LIST_RLS_ENABLED_TABLES_SQL: &str = "SELECT nspname AS schemaname, relname AS tablename, relforcerowsecurity AS force \
FROM pg_class \
INNER JOIN pg_namespace nsp ON nsp.oid = relnamespace \
WHERE relrowsecurity \
ORDER BY nspname, relname";

pub const LIST_POLICIES_SQL: &str = "SELECT schemaname, tablename, policyname, permissive, roles, cmd, qual, with_check \
FROM pg_policies \
ORDER BY schemaname, tablename, policyname";

/// A table with row-level security enabled.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RlsTable {
    pub schema: String,
    pub table: String,
    pub force: bool,
}

/// One row of `pg_policies`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PolicyDefinition {
    pub schema: String,
    pub table: String,
    pub name: String,
    pub permissive: String,
    pub roles: Vec<String>,
    pub cmd: String,
    pub qual: Option<String>,
    pub with_check: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SchemaDump {
    pub current_schema: String,
    pub tables: Vec<RlsTable>,
    pub policies: Vec<PolicyDefinition>,
}

impl SchemaDump {
    /// Read the RLS-enabled tables and all policies visible to `conn`.
    ///
    /// # Errors
    /// Returns the statement failure, or [`RlsError::InvalidPolicy`] when a
    /// catalog row is missing a required column.
    pub async fn collect<C>(conn: &C) -> Result<Self, RlsError>
    where
        C: SessionConnection + ?Sized,
    {
        let current_schema = conn
            .execute_statement(CURRENT_SCHEMA_SQL)
            .await?
            .first()
            .and_then(|row| row.get("schemaname"))
            .unwrap_or("public")
            .to_owned();

        let tables = conn
            .execute_statement(LIST_RLS_ENABLED_TABLES_SQL)
            .await?
            .iter()
            .map(|row| {
                Ok(RlsTable {
                    schema: required(row, "schemaname")?,
                    table: required(row, "tablename")?,
                    force: row.get("force").is_some_and(parse_bool),
                })
            })
            .collect::<Result<Vec<_>, RlsError>>()?;

        let policies = conn
            .execute_statement(LIST_POLICIES_SQL)
            .await?
            .iter()
            .map(|row| {
                Ok(PolicyDefinition {
                    schema: required(row, "schemaname")?,
                    table: required(row, "tablename")?,
                    name: required(row, "policyname")?,
                    permissive: required(row, "permissive")?,
                    roles: parse_text_array(row.get("roles").unwrap_or("{}")),
                    cmd: required(row, "cmd")?,
                    qual: row.get("qual").filter(|q| !q.is_empty()).map(str::to_owned),
                    with_check: row
                        .get("with_check")
                        .filter(|q| !q.is_empty())
                        .map(str::to_owned),
                })
            })
            .collect::<Result<Vec<_>, RlsError>>()?;

        Ok(Self {
            current_schema,
            tables,
            policies,
        })
    }

    /// SQL script re-creating the collected setup.
    #[must_use]
    pub fn render(&self) -> String {
        let alters: Vec<String> = self
            .tables
            .iter()
            .map(|table| {
                let force = if table.force { "FORCE" } else { "NO FORCE" };
                format!(
                    "ALTER TABLE {} ENABLE ROW LEVEL SECURITY, {force} ROW LEVEL SECURITY;\n",
                    self.table_name(&table.schema, &table.table)
                )
            })
            .collect();
        let definitions: Vec<String> = self
            .policies
            .iter()
            .map(|policy| self.render_policy(policy))
            .collect();

        let mut sections = Vec::new();
        if !alters.is_empty() {
            sections.push(alters.concat());
        }
        if !definitions.is_empty() {
            sections.push(format!("{}\n", definitions.join("\n\n")));
        }
        sections.join("\n")
    }

    fn render_policy(&self, policy: &PolicyDefinition) -> String {
        let roles = if policy.roles.is_empty() {
            "public".to_owned()
        } else {
            policy
                .roles
                .iter()
                .map(|role| {
                    if role == "public" {
                        role.clone()
                    } else {
                        quote_identifier(role)
                    }
                })
                .collect::<Vec<_>>()
                .join(", ")
        };

        let mut lines = vec![
            format!(
                "CREATE POLICY {} ON {}",
                quote_identifier(&policy.name),
                self.table_name(&policy.schema, &policy.table)
            ),
            format!("AS {}", policy.permissive),
            format!("FOR {}", policy.cmd),
            format!("TO {roles}"),
        ];
        if let Some(qual) = &policy.qual {
            lines.push(format!("USING ({qual})"));
        }
        if let Some(check) = &policy.with_check {
            lines.push(format!("WITH CHECK ({check})"));
        }
        format!("{};", lines.join("\n"))
    }

    fn table_name(&self, schema: &str, table: &str) -> String {
        if schema == self.current_schema {
            identifier(table)
        } else {
            format!("{}.{}", identifier(schema), identifier(table))
        }
    }
}

fn required(row: &Row, column: &str) -> Result<String, RlsError> {
    row.get(column)
        .map(str::to_owned)
        .ok_or_else(|| RlsError::InvalidPolicy(format!("catalog row without {column}")))
}

fn parse_bool(value: &str) -> bool {
    matches!(value, "t" | "true" | "TRUE" | "1")
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn identifier(name: &str) -> String {
    if is_plain_identifier(name) {
        name.to_owned()
    } else {
        quote_identifier(name)
    }
}

/// Decode a text-form `PostgreSQL` array such as `{admin,"read only"}`.
fn parse_text_array(value: &str) -> Vec<String> {
    let inner = value
        .trim()
        .strip_prefix('{')
        .and_then(|v| v.strip_suffix('}'))
        .unwrap_or_default();

    let mut items = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut was_quoted = false;
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        match c {
            '"' => {
                quoted = !quoted;
                was_quoted = true;
            }
            '\\' if quoted => {
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            ',' if !quoted => {
                items.push(std::mem::take(&mut current));
                was_quoted = false;
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() || was_quoted {
        items.push(current);
    }
    items
}
