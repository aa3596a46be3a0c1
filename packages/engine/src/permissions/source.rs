use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::permissions::ip::parse_ip_list;
use crate::permissions::policy::{AccessRow, Action, Permission, Policy};
use crate::{QueryBackend, QueryError, SqlDialect, Value};

/// Where policies, their attachments and their permissions are stored.
#[async_trait(?Send)]
pub trait PolicySource: Send + Sync {
    /// Rows attaching policies to `roles` (or to the public role when `roles` is empty),
    /// plus every row attached to `user`.
    async fn access_rows(
        &self,
        roles: &[String],
        user: Option<&str>,
    ) -> Result<Vec<AccessRow>, QueryError>;

    async fn policies(&self, ids: &[String]) -> Result<Vec<Policy>, QueryError>;

    async fn permissions(
        &self,
        policy_ids: &[String],
        collection: &str,
        action: Action,
    ) -> Result<Vec<Permission>, QueryError>;
}

/// Policies held in memory, usually loaded from a JSON document:
/// `{"policies": [..], "access": [..], "permissions": [..]}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryPolicySource {
    #[serde(default)]
    pub policies: Vec<Policy>,
    #[serde(default)]
    pub access: Vec<AccessRow>,
    #[serde(default)]
    pub permissions: Vec<Permission>,
}

impl MemoryPolicySource {
    pub fn from_json_str(json: &str) -> Result<Self, QueryError> {
        serde_json::from_str(json)
            .map_err(|error| QueryError::Configuration(format!("invalid policy document: {error}")))
    }
}

pub(crate) fn access_row_applies(row: &AccessRow, roles: &[String], user: Option<&str>) -> bool {
    let by_role = if roles.is_empty() {
        row.role.is_none() && row.user.is_none()
    } else {
        row.role.as_ref().is_some_and(|role| roles.contains(role))
    };
    let by_user = user.is_some() && row.user.as_deref() == user;
    by_role || by_user
}

#[async_trait(?Send)]
impl PolicySource for MemoryPolicySource {
    async fn access_rows(
        &self,
        roles: &[String],
        user: Option<&str>,
    ) -> Result<Vec<AccessRow>, QueryError> {
        Ok(self
            .access
            .iter()
            .filter(|row| access_row_applies(row, roles, user))
            .cloned()
            .collect())
    }

    async fn policies(&self, ids: &[String]) -> Result<Vec<Policy>, QueryError> {
        Ok(self
            .policies
            .iter()
            .filter(|policy| ids.contains(&policy.id))
            .cloned()
            .collect())
    }

    async fn permissions(
        &self,
        policy_ids: &[String],
        collection: &str,
        action: Action,
    ) -> Result<Vec<Permission>, QueryError> {
        Ok(self
            .permissions
            .iter()
            .filter(|permission| {
                permission.collection == collection
                    && permission.action == action
                    && policy_ids.contains(&permission.policy)
            })
            .cloned()
            .collect())
    }
}

/// Reads policies from the `quarry_access`, `quarry_policies` and `quarry_permissions` tables
/// of the store itself.
pub struct SqlPolicySource {
    backend: Arc<dyn QueryBackend>,
}

impl SqlPolicySource {
    pub fn new(backend: Arc<dyn QueryBackend>) -> Self {
        Self { backend }
    }

    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Vec<Value>>, QueryError> {
        tracing::trace!(parameters = params.len(), "loading policy rows");
        Ok(self.backend.execute(sql, params).await?.rows)
    }
}

#[async_trait(?Send)]
impl PolicySource for SqlPolicySource {
    async fn access_rows(
        &self,
        roles: &[String],
        user: Option<&str>,
    ) -> Result<Vec<AccessRow>, QueryError> {
        let dialect = self.backend.dialect();
        let mut params = Vec::new();
        let mut clauses = Vec::new();
        if roles.is_empty() {
            clauses.push("(\"role\" IS NULL AND \"user\" IS NULL)".to_string());
        } else {
            let list = push_list(dialect, &mut params, roles);
            clauses.push(format!("\"role\" IN ({list})"));
        }
        if let Some(user) = user {
            params.push(Value::Text(user.to_string()));
            clauses.push(format!("\"user\" = {}", placeholder(dialect, params.len())));
        }
        let sql = format!(
            "SELECT \"policy\", \"role\", \"user\", \"sort\" FROM \"quarry_access\" WHERE {}",
            clauses.join(" OR ")
        );

        let mut rows = Vec::new();
        for row in self.query(&sql, &params).await? {
            rows.push(AccessRow {
                policy: required_text(&row, 0, "quarry_access.policy")?,
                role: optional_text(&row, 1),
                user: optional_text(&row, 2),
                sort: optional_integer(&row, 3),
            });
        }
        Ok(rows)
    }

    async fn policies(&self, ids: &[String]) -> Result<Vec<Policy>, QueryError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut params = Vec::new();
        let list = push_list(self.backend.dialect(), &mut params, ids);
        let sql = format!(
            "SELECT \"id\", \"name\", \"admin_access\", \"ip_access\" FROM \"quarry_policies\" \
             WHERE \"id\" IN ({list})"
        );

        let mut policies = Vec::new();
        for row in self.query(&sql, &params).await? {
            policies.push(Policy {
                id: required_text(&row, 0, "quarry_policies.id")?,
                name: optional_text(&row, 1).unwrap_or_default(),
                admin_access: optional_integer(&row, 2).is_some_and(|flag| flag != 0)
                    || matches!(row.get(2), Some(Value::Boolean(true))),
                ip_access: parse_ip_list(&optional_text(&row, 3).unwrap_or_default())?,
            });
        }
        Ok(policies)
    }

    async fn permissions(
        &self,
        policy_ids: &[String],
        collection: &str,
        action: Action,
    ) -> Result<Vec<Permission>, QueryError> {
        if policy_ids.is_empty() {
            return Ok(Vec::new());
        }
        let dialect = self.backend.dialect();
        let mut params = vec![
            Value::Text(collection.to_string()),
            Value::Text(action.as_str().to_string()),
        ];
        let list = push_list(dialect, &mut params, policy_ids);
        let sql = format!(
            "SELECT \"policy\", \"fields\", \"permissions\", \"presets\" FROM \"quarry_permissions\" \
             WHERE \"collection\" = {} AND \"action\" = {} AND \"policy\" IN ({list})",
            placeholder(dialect, 1),
            placeholder(dialect, 2)
        );

        let mut permissions = Vec::new();
        for row in self.query(&sql, &params).await? {
            permissions.push(Permission {
                policy: required_text(&row, 0, "quarry_permissions.policy")?,
                collection: collection.to_string(),
                action,
                fields: optional_text(&row, 1)
                    .map(|fields| {
                        fields
                            .split(',')
                            .map(str::trim)
                            .filter(|field| !field.is_empty())
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default(),
                permissions: optional_json(&row, 2, "quarry_permissions.permissions")?,
                presets: optional_json(&row, 3, "quarry_permissions.presets")?,
            });
        }
        Ok(permissions)
    }
}

fn placeholder(dialect: SqlDialect, index_1_based: usize) -> String {
    match dialect {
        SqlDialect::Sqlite => format!("?{index_1_based}"),
        SqlDialect::Postgres => format!("${index_1_based}"),
    }
}

fn push_list(dialect: SqlDialect, params: &mut Vec<Value>, values: &[String]) -> String {
    values
        .iter()
        .map(|value| {
            params.push(Value::Text(value.clone()));
            placeholder(dialect, params.len())
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn required_text(row: &[Value], index: usize, column: &str) -> Result<String, QueryError> {
    optional_text(row, index)
        .ok_or_else(|| QueryError::Configuration(format!("{column} must be non-null text")))
}

fn optional_text(row: &[Value], index: usize) -> Option<String> {
    match row.get(index) {
        Some(Value::Text(value)) => Some(value.clone()),
        Some(Value::Integer(value)) => Some(value.to_string()),
        _ => None,
    }
}

fn optional_integer(row: &[Value], index: usize) -> Option<i64> {
    match row.get(index) {
        Some(Value::Integer(value)) => Some(*value),
        _ => None,
    }
}

fn optional_json(row: &[Value], index: usize, column: &str) -> Result<Option<JsonValue>, QueryError> {
    match optional_text(row, index) {
        None => Ok(None),
        Some(text) if text.trim().is_empty() => Ok(None),
        Some(text) => serde_json::from_str(&text)
            .map(Some)
            .map_err(|error| QueryError::Configuration(format!("{column} is not JSON: {error}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::{access_row_applies, MemoryPolicySource, PolicySource};
    use crate::permissions::policy::{AccessRow, Action};

    fn row(policy: &str, role: Option<&str>, user: Option<&str>) -> AccessRow {
        AccessRow {
            policy: policy.to_string(),
            role: role.map(str::to_string),
            user: user.map(str::to_string),
            sort: None,
        }
    }

    #[test]
    fn public_requests_only_see_unattached_rows() {
        let roles: Vec<String> = Vec::new();
        assert!(access_row_applies(&row("p", None, None), &roles, None));
        assert!(!access_row_applies(&row("p", Some("editor"), None), &roles, None));
        assert!(!access_row_applies(&row("p", None, Some("u-1")), &roles, None));
    }

    #[test]
    fn role_and_user_rows_union() {
        let roles = vec!["editor".to_string()];
        assert!(access_row_applies(&row("p", Some("editor"), None), &roles, Some("u-1")));
        assert!(access_row_applies(&row("p", None, Some("u-1")), &roles, Some("u-1")));
        assert!(!access_row_applies(&row("p", None, None), &roles, Some("u-1")));
        assert!(!access_row_applies(&row("p", Some("admin"), None), &roles, Some("u-1")));
    }

    #[tokio::test]
    async fn memory_source_filters_permissions_by_collection_and_action() {
        let source = MemoryPolicySource::from_json_str(
            r#"{
                "policies": [{"id": "p1"}],
                "access": [{"policy": "p1", "role": "editor"}],
                "permissions": [
                    {"policy": "p1", "collection": "articles", "action": "read", "fields": ["*"]},
                    {"policy": "p1", "collection": "articles", "action": "update", "fields": ["*"]},
                    {"policy": "p2", "collection": "articles", "action": "read", "fields": ["id"]}
                ]
            }"#,
        )
        .unwrap();
        let permissions = source
            .permissions(&["p1".to_string()], "articles", Action::Read)
            .await
            .unwrap();
        assert_eq!(permissions.len(), 1);
        assert_eq!(permissions[0].fields, vec!["*".to_string()]);
    }

    #[test]
    fn rejects_malformed_documents() {
        let error = MemoryPolicySource::from_json_str(
            r#"{"policies": [{"id": "p1", "ip_access": ["not-an-ip"]}]}"#,
        )
        .unwrap_err();
        assert_eq!(error.code(), crate::error::ErrorCode::Configuration);
    }
}
