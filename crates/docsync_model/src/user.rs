//! The identity mutation queues are partitioned by.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A signed-in or anonymous user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct User {
    uid: Option<String>,
}

impl User {
    /// The unauthenticated user.
    #[must_use]
    pub fn unauthenticated() -> Self {
        Self::default()
    }

    /// A signed-in user.
    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: Some(uid.into()),
        }
    }

    /// The user id, if signed in.
    #[must_use]
    pub fn uid(&self) -> Option<&str> {
        self.uid.as_deref()
    }

    /// Returns true if signed in.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.uid.is_some()
    }

    /// Key used to partition persisted per-user state.
    #[must_use]
    pub fn storage_key(&self) -> &str {
        self.uid.as_deref().unwrap_or("")
    }
}

impl fmt::Display for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.uid {
            Some(uid) => f.write_str(uid),
            None => f.write_str("<anonymous>"),
        }
    }
}
