use std::net::IpAddr;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;

use crate::permissions::ip::{parse_ip_list, IpRule};
use crate::QueryError;

/// A named bundle of permissions, attached to roles and users through access rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub admin_access: bool,
    /// Empty means any ip. Accepts a list or the comma separated column form.
    #[serde(default, deserialize_with = "deserialize_ip_access")]
    pub ip_access: Vec<IpRule>,
}

impl Policy {
    pub fn allows_ip(&self, ip: Option<&IpAddr>) -> bool {
        if self.ip_access.is_empty() {
            return true;
        }
        ip.is_some_and(|ip| self.ip_access.iter().any(|rule| rule.matches(ip)))
    }
}

fn deserialize_ip_access<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<IpRule>, D::Error> {
    let rules = match Option::<JsonValue>::deserialize(deserializer)? {
        None | Some(JsonValue::Null) => Ok(Vec::new()),
        Some(JsonValue::String(joined)) => parse_ip_list(&joined),
        Some(JsonValue::Array(entries)) => entries
            .iter()
            .map(|entry| match entry {
                JsonValue::String(entry) => IpRule::parse(entry),
                other => Err(QueryError::Configuration(format!(
                    "invalid ip_access entry {other}"
                ))),
            })
            .collect(),
        Some(other) => Err(QueryError::Configuration(format!(
            "ip_access must be a list or a comma separated string, got {other}"
        ))),
    };
    rules.map_err(serde::de::Error::custom)
}

/// Attaches a policy to a role, to a user, or to neither (the public role).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRow {
    pub policy: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub sort: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Create,
    Read,
    Update,
    Delete,
    Share,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Read => "read",
            Action::Update => "update",
            Action::Delete => "delete",
            Action::Share => "share",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Permission {
    pub policy: String,
    pub collection: String,
    pub action: Action,
    /// Readable fields; `*` grants all of them.
    #[serde(default)]
    pub fields: Vec<String>,
    /// Row filter in the JSON filter language; absent means every row.
    #[serde(default)]
    pub permissions: Option<JsonValue>,
    #[serde(default)]
    pub presets: Option<JsonValue>,
}

impl Permission {
    pub fn grants_field(&self, field: &str) -> bool {
        self.fields.iter().any(|granted| granted == "*" || granted == field)
    }

    /// Whether the row filter restricts anything; `{}` counts as unrestricted.
    pub fn has_row_filter(&self) -> bool {
        match &self.permissions {
            None | Some(JsonValue::Null) => false,
            Some(JsonValue::Object(object)) => !object.is_empty(),
            Some(_) => true,
        }
    }
}
