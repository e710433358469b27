//! Session environment variables

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Variables copied from the gateway's own environment when a session
/// does not set them
pub const PASSTHROUGH_VARS: &[&str] = &["TERM", "DOCKER_HOST", "DOCKER_CERT_PATH", "DOCKER_TLS_VERIFY"];

/// Environment handed to hooks and spawned processes
///
/// Keys are unique. Entries whose value is empty are kept (so a default is
/// not re-applied over them) but left out of [`Environment::list`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Environment(BTreeMap<String, String>);

impl Environment {
    /// Create an empty environment
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a variable, replacing any previous value
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    /// Look up a variable
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    /// Whether a variable is present, even with an empty value
    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    /// Merge entries key by key, overwriting existing ones
    pub fn merge<I, K, V>(&mut self, entries: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (name, value) in entries {
            self.set(name, value);
        }
    }

    /// Fill the passthrough variables from the process environment
    pub fn apply_defaults(&mut self) {
        self.apply_defaults_from(|name| std::env::var(name).ok());
    }

    /// Fill the passthrough variables from `lookup`, only where absent
    pub fn apply_defaults_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        for name in PASSTHROUGH_VARS {
            if !self.contains(name) {
                self.set(*name, lookup(name).unwrap_or_default());
            }
        }
    }

    /// Non-empty variables as `(name, value)` pairs
    pub fn vars(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0
            .iter()
            .filter(|(_, value)| !value.is_empty())
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    /// Non-empty variables rendered as `NAME=value`
    pub fn list(&self) -> Vec<String> {
        self.vars()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect()
    }

    /// Number of entries, including empty ones
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no entries at all
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Environment {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut env = Environment::new();
        env.merge(iter);
        env
    }
}
