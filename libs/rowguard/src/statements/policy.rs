//! Versioned policy files and the `DROP` statements derived from them.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

use crate::error::RlsError;

#[allow(clippy::expect_used)] // good regex, it doesn't panic
static CREATE_POLICY_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\bCREATE\s+POLICY\s+("(?:[^"]|"")+"|[^\s"]+)\s+ON\s+((?:"(?:[^"]|"")+"|[^\s".(]+)(?:\.(?:"(?:[^"]|"")+"|[^\s".(]+))?)"#)
        .expect("static regex should not panic")
});

/// Where a policy definition comes from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PolicySource {
    /// `<policy_dir>/<table>_v<NN>.sql`
    Version(u32),
    /// Literal SQL with one or more `CREATE POLICY` statements.
    Definition(String),
}

impl Default for PolicySource {
    fn default() -> Self {
        PolicySource::Version(1)
    }
}

/// One policy created by a definition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PolicyRef {
    pub name: String,
    pub table: String,
}

impl PolicyRef {
    #[must_use]
    pub fn drop_sql(&self) -> String {
        format!("DROP POLICY IF EXISTS {} ON {}", self.name, self.table)
    }
}

/// Policies created by `definition`, in order.
///
/// # Errors
/// Returns [`RlsError::InvalidPolicy`] when no `CREATE POLICY` is found.
pub fn parse_policies(definition: &str) -> Result<Vec<PolicyRef>, RlsError> {
    let policies: Vec<PolicyRef> = CREATE_POLICY_REGEX
        .captures_iter(definition)
        .map(|caps| PolicyRef {
            name: caps[1].to_owned(),
            table: caps[2].to_owned(),
        })
        .collect();
    if policies.is_empty() {
        return Err(RlsError::InvalidPolicy(
            "definition contains no CREATE POLICY statement".to_owned(),
        ));
    }
    Ok(policies)
}

/// Directory of versioned policy files.
#[derive(Clone, Debug)]
pub struct PolicyCatalog {
    dir: PathBuf,
}

impl PolicyCatalog {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn path(&self, table: &str, version: u32) -> PathBuf {
        self.dir.join(format!("{table}_v{version:02}.sql"))
    }

    /// # Errors
    /// Returns [`RlsError::PolicyNotFound`] when the file does not exist and
    /// [`RlsError::Io`] when it cannot be read.
    pub fn load(&self, table: &str, version: u32) -> Result<String, RlsError> {
        let path = self.path(table, version);
        std::fs::read_to_string(&path).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                RlsError::PolicyNotFound {
                    table: table.to_owned(),
                    version,
                    path: path.display().to_string(),
                }
            } else {
                RlsError::Io(err)
            }
        })
    }

    /// Highest version on disk for `table`, 0 when there is none.
    ///
    /// # Errors
    /// Returns [`RlsError::Io`] when the directory exists but cannot be read.
    pub fn last_version(&self, table: &str) -> Result<u32, RlsError> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err.into()),
        };

        let prefix = format!("{table}_v");
        let mut last = 0;
        for entry in entries {
            let name = entry?.file_name();
            let Some(version) = name
                .to_str()
                .and_then(|name| name.strip_prefix(&prefix))
                .and_then(|rest| rest.strip_suffix(".sql"))
                .and_then(|digits| digits.parse::<u32>().ok())
            else {
                continue;
            };
            last = last.max(version);
        }
        Ok(last)
    }
}
