//! Typed identifiers shared across client and worker components.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one shuffle within one application.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShuffleKey {
    /// Application id assigned by the compute framework.
    pub app_id: String,
    /// Shuffle id within the application.
    pub shuffle_id: u32,
}

impl ShuffleKey {
    /// Build a shuffle key.
    pub fn new(app_id: impl Into<String>, shuffle_id: u32) -> Self {
        Self {
            app_id: app_id.into(),
            shuffle_id,
        }
    }

    /// Key for one map attempt within this shuffle, used to scope push state.
    pub fn map_key(&self, map_id: u32, attempt_id: u32) -> String {
        format!("{}-{}-{}-{}", self.app_id, self.shuffle_id, map_id, attempt_id)
    }
}

impl fmt::Display for ShuffleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.app_id, self.shuffle_id)
    }
}

/// Scoping key for quotas and congestion tracking.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserIdentifier {
    /// Tenant the user belongs to.
    pub tenant: String,
    /// User name within the tenant.
    pub name: String,
}

impl UserIdentifier {
    /// Build a user identifier.
    pub fn new(tenant: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for UserIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tenant, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shuffle_key_renders_app_and_id() {
        let key = ShuffleKey::new("app-1", 3);
        assert_eq!(key.to_string(), "app-1-3");
        assert_eq!(key.map_key(7, 1), "app-1-3-7-1");
    }
}
