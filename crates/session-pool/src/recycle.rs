//! Session recycle policy.
//!
//! Decides whether a released session may re-enter the pool, based on how
//! its server-confirmed context (database, schema, role, warehouse) drifted
//! while it was checked out.

use std::str::FromStr;

use crate::error::PoolError;

/// Server-confirmed context of a session.
///
/// Each value is an identifier as the server reported it. Values wrapped in
/// double quotes are quoted identifiers and compare case-sensitively; all
/// others compare case-insensitively.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionProperties {
    /// Current database.
    pub database: Option<String>,
    /// Current schema.
    pub schema: Option<String>,
    /// Current role.
    pub role: Option<String>,
    /// Current warehouse.
    pub warehouse: Option<String>,
}

impl SessionProperties {
    /// Create an empty property set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the database.
    #[must_use]
    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Set the schema.
    #[must_use]
    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    /// Set the role.
    #[must_use]
    pub fn role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    /// Set the warehouse.
    #[must_use]
    pub fn warehouse(mut self, warehouse: impl Into<String>) -> Self {
        self.warehouse = Some(warehouse.into());
        self
    }

    /// Names of the properties that differ from `other`.
    #[must_use]
    pub fn changed_from(&self, other: &Self) -> Vec<&'static str> {
        let pairs = [
            ("database", &self.database, &other.database),
            ("schema", &self.schema, &other.schema),
            ("role", &self.role, &other.role),
            ("warehouse", &self.warehouse, &other.warehouse),
        ];
        pairs
            .into_iter()
            .filter(|(_, a, b)| !same_identifier(a.as_deref(), b.as_deref()))
            .map(|(name, _, _)| name)
            .collect()
    }
}

fn is_quoted(value: &str) -> bool {
    value.len() >= 2 && value.starts_with('"') && value.ends_with('"')
}

fn same_identifier(a: Option<&str>, b: Option<&str>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) if is_quoted(a) || is_quoted(b) => a == b,
        (Some(a), Some(b)) => a == b || a.to_uppercase() == b.to_uppercase(),
        _ => false,
    }
}

/// What the pool does with a session whose context changed while in use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ChangedSessionBehavior {
    /// Close the session instead of returning it to the pool.
    #[default]
    Destroy,
    /// Return the session to the pool it came from regardless of drift.
    OriginalPool,
}

impl FromStr for ChangedSessionBehavior {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "destroy" => Ok(Self::Destroy),
            "originalpool" | "original_pool" => Ok(Self::OriginalPool),
            other => Err(PoolError::Configuration(format!(
                "invalid changedSession value: {other}. Supported values: Destroy, OriginalPool"
            ))),
        }
    }
}

/// Outcome of the recycle decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recycle {
    /// The session goes back to the pool.
    Reuse,
    /// The session is closed.
    Destroy,
}

/// Decide whether a released session is reused or destroyed.
#[must_use]
pub fn decide(
    before: &SessionProperties,
    after: &SessionProperties,
    mode: ChangedSessionBehavior,
) -> Recycle {
    let changed = before.changed_from(after);
    if changed.is_empty() {
        return Recycle::Reuse;
    }

    match mode {
        ChangedSessionBehavior::Destroy => {
            tracing::debug!(?changed, "session context changed, destroying");
            Recycle::Destroy
        }
        ChangedSessionBehavior::OriginalPool => {
            tracing::debug!(?changed, "session context changed, keeping in original pool");
            Recycle::Reuse
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn props() -> SessionProperties {
        SessionProperties::new()
            .database("MYDB")
            .schema("PUBLIC")
            .role("ANALYST")
            .warehouse("COMPUTE_WH")
    }

    #[test]
    fn test_unchanged_is_reused() {
        assert_eq!(
            decide(&props(), &props(), ChangedSessionBehavior::Destroy),
            Recycle::Reuse
        );
    }

    #[test]
    fn test_unquoted_compare_ignores_case() {
        let after = SessionProperties::new()
            .database("mydb")
            .schema("public")
            .role("analyst")
            .warehouse("compute_wh");
        assert!(props().changed_from(&after).is_empty());
        assert_eq!(
            decide(&props(), &after, ChangedSessionBehavior::Destroy),
            Recycle::Reuse
        );
    }

    #[test]
    fn test_quoted_compare_is_case_sensitive() {
        let before = props().schema("\"Value\"");
        let after = props().schema("\"value\"");
        assert_eq!(before.changed_from(&after), vec!["schema"]);
        assert_eq!(
            decide(&before, &after, ChangedSessionBehavior::Destroy),
            Recycle::Destroy
        );

        let same = props().schema("\"Value\"");
        assert!(before.changed_from(&same).is_empty());
    }

    #[test]
    fn test_quoted_and_unquoted_differ() {
        let before = props().database("MYDB");
        let after = props().database("\"MYDB\"");
        assert_eq!(before.changed_from(&after), vec!["database"]);
    }

    #[test]
    fn test_each_property_is_compared() {
        let base = props();
        assert_eq!(base.changed_from(&props().database("OTHER")), vec!["database"]);
        assert_eq!(base.changed_from(&props().schema("OTHER")), vec!["schema"]);
        assert_eq!(base.changed_from(&props().role("OTHER")), vec!["role"]);
        assert_eq!(
            base.changed_from(&props().warehouse("OTHER")),
            vec!["warehouse"]
        );
    }

    #[test]
    fn test_unset_versus_set_is_a_change() {
        let before = SessionProperties::new();
        let after = SessionProperties::new().role("SYSADMIN");
        assert_eq!(before.changed_from(&after), vec!["role"]);
    }

    #[test]
    fn test_original_pool_keeps_changed_session() {
        let after = props().warehouse("OTHER_WH");
        assert_eq!(
            decide(&props(), &after, ChangedSessionBehavior::OriginalPool),
            Recycle::Reuse
        );
        assert_eq!(
            decide(&props(), &after, ChangedSessionBehavior::Destroy),
            Recycle::Destroy
        );
    }

    #[test]
    fn test_default_mode_is_destroy() {
        assert_eq!(
            ChangedSessionBehavior::default(),
            ChangedSessionBehavior::Destroy
        );
    }

    #[test]
    fn test_parse_mode() {
        assert_eq!(
            "OriginalPool".parse::<ChangedSessionBehavior>().unwrap(),
            ChangedSessionBehavior::OriginalPool
        );
        assert_eq!(
            " destroy ".parse::<ChangedSessionBehavior>().unwrap(),
            ChangedSessionBehavior::Destroy
        );
        assert!("keep".parse::<ChangedSessionBehavior>().is_err());
    }
}
