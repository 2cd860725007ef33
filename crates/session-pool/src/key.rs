//! Pool keys.
//!
//! A [`PoolKey`] is the normalized form of a connection string. Two
//! connection strings that differ only in key case, whitespace, ordering or
//! empty segments produce equal keys and therefore share a pool.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{PoolError, Result};

/// Connection-string keys whose values never appear in logs.
const SECRET_KEYS: &[&str] = &[
    "password",
    "pwd",
    "passcode",
    "token",
    "private_key",
    "private_key_file",
    "private_key_pwd",
];

/// Normalized, order-independent identity of a connection string.
///
/// Keys are compared case-insensitively; values are trimmed but otherwise
/// kept verbatim. When a key is repeated, the last occurrence wins.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct PoolKey {
    params: Arc<BTreeMap<String, String>>,
}

impl PoolKey {
    /// Parse a `key=value;key=value` connection string.
    pub fn parse(conn_str: &str) -> Result<Self> {
        let mut params = BTreeMap::new();

        for part in conn_str.split(';') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }

            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| PoolError::Configuration(format!("invalid key-value: {part}")))?;

            let key = key.trim().to_lowercase();
            if key.is_empty() {
                return Err(PoolError::Configuration(format!(
                    "empty key in segment: {part}"
                )));
            }
            params.insert(key, value.trim().to_string());
        }

        Ok(Self {
            params: Arc::new(params),
        })
    }

    /// Look up a parameter by (case-insensitive) name.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params
            .get(&key.to_lowercase())
            .map(String::as_str)
    }

    /// Iterate over the normalized parameters in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.params.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Whether the key carries no parameters.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Canonical connection string, secrets included.
    ///
    /// This is what a session factory should connect with. Use the
    /// `Display` implementation for anything that may be logged.
    #[must_use]
    pub fn connection_string(&self) -> String {
        self.render(false)
    }

    fn render(&self, redact: bool) -> String {
        let mut out = String::new();
        for (key, value) in self.params.iter() {
            if !out.is_empty() {
                out.push(';');
            }
            out.push_str(key);
            out.push('=');
            if redact && SECRET_KEYS.contains(&key.as_str()) {
                out.push_str("****");
            } else {
                out.push_str(value);
            }
        }
        out
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render(true))
    }
}

impl fmt::Debug for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PoolKey").field(&self.render(true)).finish()
    }
}

impl std::str::FromStr for PoolKey {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
