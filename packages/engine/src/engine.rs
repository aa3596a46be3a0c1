use std::sync::Arc;

use serde_json::Value as JsonValue;

use crate::config::EngineConfig;
use crate::context::RequestContext;
use crate::permissions::{apply_permissions, PermissionCache, PermissionEvaluator, PolicySource};
use crate::query::AbstractQuery;
use crate::sql::{assemble, convert, render, AbstractSqlQuery, ParameterizedStatement};
use crate::{QueryBackend, QueryError, SqlDialect};

/// Compiles abstract queries for one store and runs them through its backend.
///
/// Every stage takes the [`RequestContext`] explicitly. Permission lookups are cached per
/// request scope; call [`Engine::release`] once a request is done with the engine.
pub struct Engine {
    config: EngineConfig,
    backend: Arc<dyn QueryBackend>,
    evaluator: PermissionEvaluator,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        backend: Arc<dyn QueryBackend>,
        policies: Arc<dyn PolicySource>,
        cache: Arc<PermissionCache>,
    ) -> Result<Self, QueryError> {
        config.validate()?;
        let evaluator = PermissionEvaluator::new(policies, cache, config.permission_cache_ttl());
        Ok(Self {
            config,
            backend,
            evaluator,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn evaluator(&self) -> &PermissionEvaluator {
        &self.evaluator
    }

    pub fn backend(&self) -> &dyn QueryBackend {
        self.backend.as_ref()
    }

    pub fn dialect(&self) -> SqlDialect {
        self.config.dialect.unwrap_or_else(|| self.backend.dialect())
    }

    /// Applies the request's permissions to `query` and lowers the result to abstract SQL.
    pub async fn compile(
        &self,
        query: &AbstractQuery,
        ctx: &RequestContext,
    ) -> Result<AbstractSqlQuery, QueryError> {
        let restricted = apply_permissions(ctx, &self.evaluator, query).await?;
        let sql = convert(&restricted, ctx, &self.config)?;
        tracing::debug!(
            scope = ctx.scope.id(),
            collection = %query.collection,
            admin = ctx.accountability.admin,
            columns = sql.select.len(),
            parameters = sql.parameters.len(),
            nested_manys = sql.nested_manys.len(),
            "compiled query"
        );
        Ok(sql)
    }

    /// The root statement `compile_and_run` would execute. Nested-many relations run as separate
    /// statements and are not part of it.
    pub async fn explain(
        &self,
        query: &AbstractQuery,
        ctx: &RequestContext,
    ) -> Result<ParameterizedStatement, QueryError> {
        let sql = self.compile(query, ctx).await?;
        render(&sql, self.dialect())
    }

    pub async fn compile_and_run(
        &self,
        query: &AbstractQuery,
        ctx: &RequestContext,
    ) -> Result<Vec<JsonValue>, QueryError> {
        let sql = self.compile(query, ctx).await?;
        assemble(self.backend.as_ref(), self.dialect(), &sql, &self.config).await
    }

    pub fn release(&self, ctx: &RequestContext) {
        self.evaluator.release(ctx.scope);
    }
}
