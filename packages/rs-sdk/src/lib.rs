mod backend;
mod request;

use std::sync::Arc;

use quarry_engine::permissions::{MemoryCache, MemoryPolicySource, PermissionCache, PolicySource};
use quarry_engine::schema::{IntrospectingSchemaProvider, SchemaProvider};
use serde_json::Value as JsonValue;

pub use backend::SqliteBackend;
pub use quarry_engine::{permissions, schema};
pub use quarry_engine::sql::ParameterizedStatement;
pub use quarry_engine::{
    Accountability, Engine, EngineConfig, ErrorCode, ErrorStatus, QueryBackend, QueryError,
    QueryResult, RequestContext, SchemaOverview, SqlDialect, Value,
};
pub use request::QueryRequest;

pub struct OpenEngineConfig {
    pub backend: Arc<dyn QueryBackend>,
    pub engine: EngineConfig,
    /// Introspected from the backend when absent.
    pub schema: Option<SchemaOverview>,
    /// Without a source no policy applies, so only admin requests see rows.
    pub policies: Option<Arc<dyn PolicySource>>,
}

impl OpenEngineConfig {
    pub fn new(backend: Arc<dyn QueryBackend>) -> Self {
        Self {
            backend,
            engine: EngineConfig::default(),
            schema: None,
            policies: None,
        }
    }
}

/// An engine bound to one store together with the schema snapshot requests run against.
pub struct Quarry {
    engine: Engine,
    schema: Arc<SchemaOverview>,
}

pub async fn open_engine(config: OpenEngineConfig) -> Result<Quarry, QueryError> {
    let schema = match config.schema {
        Some(schema) => schema.normalized()?,
        None => {
            IntrospectingSchemaProvider::new(config.backend.as_ref())
                .load_schema()
                .await?
        }
    };
    tracing::debug!(
        collections = schema.collections.len(),
        relations = schema.relations.len(),
        "opened schema"
    );

    let policies = config
        .policies
        .unwrap_or_else(|| Arc::new(MemoryPolicySource::default()));
    let cache: Arc<PermissionCache> = Arc::new(MemoryCache::new());
    let engine = Engine::new(config.engine, config.backend, policies, cache)?;
    Ok(Quarry {
        engine,
        schema: Arc::new(schema),
    })
}

impl Quarry {
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn schema(&self) -> &SchemaOverview {
        &self.schema
    }

    pub fn context(&self, accountability: Accountability) -> RequestContext {
        RequestContext::new(accountability, self.schema.clone())
    }

    pub async fn query(
        &self,
        request: &QueryRequest,
        accountability: Accountability,
    ) -> Result<Vec<JsonValue>, QueryError> {
        let ctx = self.context(accountability);
        let query = request.to_abstract_query(&self.schema, &self.engine.config().store)?;
        let result = self.engine.compile_and_run(&query, &ctx).await;
        self.engine.release(&ctx);
        result
    }

    pub async fn explain(
        &self,
        request: &QueryRequest,
        accountability: Accountability,
    ) -> Result<ParameterizedStatement, QueryError> {
        let ctx = self.context(accountability);
        let query = request.to_abstract_query(&self.schema, &self.engine.config().store)?;
        let result = self.engine.explain(&query, &ctx).await;
        self.engine.release(&ctx);
        result
    }
}
