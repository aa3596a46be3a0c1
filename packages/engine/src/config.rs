use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{QueryError, SqlDialect};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// The one store this engine serves; joins into any other store are rejected.
    pub store: String,
    /// Overrides the backend's own dialect when rendering.
    pub dialect: Option<SqlDialect>,
    pub permission_cache_ttl_ms: u64,
    /// Upper bound on sibling nested-many sub-queries in flight at once.
    pub max_concurrent_subqueries: usize,
    /// Child limit for nested-many relations that set none themselves.
    pub default_nested_limit: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            store: "main".to_string(),
            dialect: None,
            permission_cache_ttl_ms: 5_000,
            max_concurrent_subqueries: 8,
            default_nested_limit: None,
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self, QueryError> {
        let config: EngineConfig = serde_json::from_str(json)
            .map_err(|error| QueryError::Configuration(format!("invalid engine config: {error}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), QueryError> {
        if self.store.is_empty() {
            return Err(QueryError::Configuration(
                "engine config needs a store name".to_string(),
            ));
        }
        if self.max_concurrent_subqueries == 0 {
            return Err(QueryError::Configuration(
                "max_concurrent_subqueries must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn permission_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.permission_cache_ttl_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::EngineConfig;
    use crate::SqlDialect;

    #[test]
    fn missing_keys_fall_back_to_defaults() {
        let config = EngineConfig::from_json_str(r#"{"dialect": "postgres"}"#).unwrap();
        assert_eq!(config.dialect, Some(SqlDialect::Postgres));
        assert_eq!(config.store, "main");
        assert_eq!(config.max_concurrent_subqueries, 8);
    }

    #[test]
    fn rejects_zero_concurrency() {
        assert!(EngineConfig::from_json_str(r#"{"max_concurrent_subqueries": 0}"#).is_err());
    }
}
