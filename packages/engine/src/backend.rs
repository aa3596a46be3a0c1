use async_trait::async_trait;

use crate::{QueryError, QueryResult, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SqlDialect {
    Sqlite,
    Postgres,
}

/// A store driver. Timeouts and cancellation belong to the implementation; dropping the
/// returned future is the only cancellation signal the engine sends.
#[async_trait(?Send)]
pub trait QueryBackend: Send + Sync {
    fn dialect(&self) -> SqlDialect;

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<QueryResult, QueryError>;
}
