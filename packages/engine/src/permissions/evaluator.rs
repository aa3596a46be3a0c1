use std::sync::Arc;
use std::time::Duration;

use crate::context::{Accountability, RequestContext, RequestScope};
use crate::permissions::cache::Cache;
use crate::permissions::policy::{Action, Permission, Policy};
use crate::permissions::source::PolicySource;
use crate::query::{FilterNode, FilterVariables};
use crate::QueryError;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PermissionCacheKey {
    pub scope: RequestScope,
    pub schema: u64,
    pub accountability: Accountability,
    pub lookup: CacheLookup,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheLookup {
    Policies,
    Permissions { collection: String, action: Action },
}

#[derive(Debug, Clone)]
pub enum CachedPermissions {
    Policies(Arc<Vec<Policy>>),
    Resolved(Arc<ResolvedPermissions>),
}

pub type PermissionCache = dyn Cache<PermissionCacheKey, CachedPermissions>;

/// What one accountability may do with one collection.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedPermissions {
    pub admin: bool,
    /// Union of the granted fields in policy order, duplicates removed.
    pub fields: Vec<String>,
    /// Row filter; `None` is unrestricted, `Some(Constant false)` is deny-all.
    pub filter: Option<FilterNode>,
    /// One row filter per contributing permission, in policy order.
    pub cases: Vec<FilterNode>,
    case_fields: Vec<Vec<String>>,
}

impl ResolvedPermissions {
    pub fn unrestricted() -> Self {
        Self {
            admin: true,
            fields: vec!["*".to_string()],
            filter: None,
            cases: Vec::new(),
            case_fields: Vec::new(),
        }
    }

    fn from_permissions(
        permissions: &[Permission],
        variables: &FilterVariables,
    ) -> Result<Self, QueryError> {
        let mut fields: Vec<String> = Vec::new();
        let mut cases = Vec::with_capacity(permissions.len());
        let mut case_fields = Vec::with_capacity(permissions.len());
        for permission in permissions {
            for field in &permission.fields {
                if !fields.contains(field) {
                    fields.push(field.clone());
                }
            }
            let filter = match &permission.permissions {
                Some(json) if permission.has_row_filter() => {
                    FilterNode::from_json_with(json, variables).map_err(|error| {
                        QueryError::Configuration(format!(
                            "row filter of policy '{}' on '{}': {error}",
                            permission.policy, permission.collection
                        ))
                    })?
                }
                _ => FilterNode::always_true(),
            };
            cases.push(filter);
            case_fields.push(permission.fields.clone());
        }

        let combined = FilterNode::or(cases.iter().cloned());
        Ok(Self {
            admin: false,
            fields,
            filter: (!combined.is_constant(true)).then_some(combined),
            cases,
            case_fields,
        })
    }

    pub fn is_deny_all(&self) -> bool {
        self.filter
            .as_ref()
            .is_some_and(|filter| filter.is_constant(false))
    }

    pub fn allows_field(&self, field: &str) -> bool {
        self.admin || self.fields.iter().any(|granted| granted == "*" || granted == field)
    }

    /// Indices into `cases` a field's value must be guarded by. Empty when every row the
    /// combined filter lets through may show the field.
    pub fn field_cases(&self, field: &str) -> Vec<usize> {
        self.shared_cases(&[field.to_string()]).unwrap_or_default()
    }

    /// Cases under which all of `fields` are readable together. `None` when no single
    /// permission grants all of them.
    pub fn shared_cases(&self, fields: &[String]) -> Option<Vec<usize>> {
        if self.admin {
            return Some(Vec::new());
        }
        let granting = self
            .case_fields
            .iter()
            .enumerate()
            .filter(|(_, granted)| {
                fields.iter().all(|field| {
                    granted
                        .iter()
                        .any(|granted| granted == "*" || granted == field)
                })
            })
            .map(|(index, _)| index)
            .collect::<Vec<_>>();
        if granting.is_empty() {
            return None;
        }
        let unconditional = granting.len() == self.cases.len()
            || granting
                .iter()
                .any(|index| self.cases[*index].is_constant(true));
        Some(if unconditional { Vec::new() } else { granting })
    }
}

/// Resolves accountabilities to policies and permissions, caching per request.
pub struct PermissionEvaluator {
    source: Arc<dyn PolicySource>,
    cache: Arc<PermissionCache>,
    ttl: Duration,
}

impl PermissionEvaluator {
    pub fn new(source: Arc<dyn PolicySource>, cache: Arc<PermissionCache>, ttl: Duration) -> Self {
        Self { source, cache, ttl }
    }

    fn cache_key(&self, ctx: &RequestContext, lookup: CacheLookup) -> PermissionCacheKey {
        PermissionCacheKey {
            scope: ctx.scope,
            schema: ctx.schema.fingerprint(),
            accountability: ctx.accountability.clone(),
            lookup,
        }
    }

    /// Policies visible to the request: user-attached first, then by sort, then filtered by ip.
    pub async fn fetch_policies(&self, ctx: &RequestContext) -> Result<Arc<Vec<Policy>>, QueryError> {
        let key = self.cache_key(ctx, CacheLookup::Policies);
        if let Some(CachedPermissions::Policies(policies)) = self.cache.get(&key) {
            tracing::trace!(scope = ctx.scope.id(), "policy cache hit");
            return Ok(policies);
        }
        tracing::trace!(scope = ctx.scope.id(), "policy cache miss");

        let accountability = &ctx.accountability;
        let mut rows = self
            .source
            .access_rows(&accountability.roles, accountability.user.as_deref())
            .await?;
        rows.sort_by_key(|row| (row.user.is_none(), row.sort.is_none(), row.sort));

        let mut ids: Vec<String> = Vec::new();
        for row in rows {
            if !ids.contains(&row.policy) {
                ids.push(row.policy);
            }
        }

        let loaded = self.source.policies(&ids).await?;
        let policies = ids
            .iter()
            .filter_map(|id| loaded.iter().find(|policy| &policy.id == id))
            .filter(|policy| policy.allows_ip(accountability.ip.as_ref()))
            .cloned()
            .collect::<Vec<_>>();

        let policies = Arc::new(policies);
        self.cache
            .put(key, CachedPermissions::Policies(policies.clone()), self.ttl);
        Ok(policies)
    }

    pub async fn resolve_permissions(
        &self,
        ctx: &RequestContext,
        collection: &str,
        action: Action,
    ) -> Result<Arc<ResolvedPermissions>, QueryError> {
        if ctx.accountability.admin {
            return Ok(Arc::new(ResolvedPermissions::unrestricted()));
        }
        let key = self.cache_key(
            ctx,
            CacheLookup::Permissions {
                collection: collection.to_string(),
                action,
            },
        );
        if let Some(CachedPermissions::Resolved(resolved)) = self.cache.get(&key) {
            tracing::trace!(scope = ctx.scope.id(), collection, "permission cache hit");
            return Ok(resolved);
        }
        tracing::trace!(scope = ctx.scope.id(), collection, "permission cache miss");

        let policies = self.fetch_policies(ctx).await?;
        let resolved = if policies.iter().any(|policy| policy.admin_access) {
            ResolvedPermissions::unrestricted()
        } else {
            let ids = policies
                .iter()
                .map(|policy| policy.id.clone())
                .collect::<Vec<_>>();
            let mut permissions = self.source.permissions(&ids, collection, action).await?;
            permissions.sort_by_key(|permission| {
                ids.iter()
                    .position(|id| *id == permission.policy)
                    .unwrap_or(usize::MAX)
            });
            ResolvedPermissions::from_permissions(&permissions, &filter_variables(ctx))?
        };

        let resolved = Arc::new(resolved);
        self.cache
            .put(key, CachedPermissions::Resolved(resolved.clone()), self.ttl);
        Ok(resolved)
    }

    /// `None` when the request may see every row of `collection`.
    pub async fn resolve_permission_filter(
        &self,
        ctx: &RequestContext,
        collection: &str,
        action: Action,
    ) -> Result<Option<FilterNode>, QueryError> {
        Ok(self
            .resolve_permissions(ctx, collection, action)
            .await?
            .filter
            .clone())
    }

    /// Drops every entry a finished request populated.
    pub fn release(&self, scope: RequestScope) {
        self.cache.retain(&|key: &PermissionCacheKey| key.scope != scope);
    }

    pub fn invalidate_all(&self) {
        self.cache.retain(&|_: &PermissionCacheKey| false);
    }
}

fn filter_variables(ctx: &RequestContext) -> FilterVariables {
    FilterVariables {
        user: ctx.accountability.user.clone(),
        roles: ctx.accountability.roles.clone(),
        now: Some(chrono::Utc::now().to_rfc3339()),
    }
}
