use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::SchemaOverview;

/// Who a request is evaluated as. Immutable for the lifetime of the request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Accountability {
    #[serde(default)]
    pub user: Option<String>,
    /// Ordered; the first role backs `$CURRENT_ROLE`.
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub ip: Option<IpAddr>,
    /// Bypasses every permission check.
    #[serde(default)]
    pub admin: bool,
}

impl Accountability {
    pub fn public() -> Self {
        Self::default()
    }

    pub fn admin() -> Self {
        Self {
            admin: true,
            ..Self::default()
        }
    }

    pub fn user(user: impl Into<String>, roles: Vec<String>) -> Self {
        Self {
            user: Some(user.into()),
            roles,
            ..Self::default()
        }
    }

    pub fn with_ip(mut self, ip: IpAddr) -> Self {
        self.ip = Some(ip);
        self
    }
}

/// Identifies one request; the permission cache keys every entry by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestScope(u64);

static NEXT_SCOPE: AtomicU64 = AtomicU64::new(1);

impl RequestScope {
    pub fn next() -> Self {
        Self(NEXT_SCOPE.fetch_add(1, Ordering::Relaxed))
    }

    pub fn id(self) -> u64 {
        self.0
    }
}

/// Everything a compilation needs about the caller, passed explicitly through every stage.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub accountability: Accountability,
    pub schema: Arc<SchemaOverview>,
    pub scope: RequestScope,
    /// Turn deny-all row filters into `PermissionDenied` instead of an empty result.
    pub require_access: bool,
}

impl RequestContext {
    pub fn new(accountability: Accountability, schema: Arc<SchemaOverview>) -> Self {
        Self {
            accountability,
            schema,
            scope: RequestScope::next(),
            require_access: false,
        }
    }

    pub fn with_require_access(mut self, require_access: bool) -> Self {
        self.require_access = require_access;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::{Accountability, RequestContext};
    use crate::SchemaOverview;
    use std::sync::Arc;

    #[test]
    fn scopes_are_never_reused() {
        let schema = Arc::new(SchemaOverview::default());
        let first = RequestContext::new(Accountability::public(), schema.clone());
        let second = RequestContext::new(Accountability::public(), schema);
        assert_ne!(first.scope, second.scope);
        assert!(second.scope.id() > first.scope.id());
    }

    #[test]
    fn deserializes_accountability() {
        let accountability: Accountability = serde_json::from_str(
            r#"{"user": "u-1", "roles": ["editor"], "ip": "10.0.0.7"}"#,
        )
        .unwrap();
        assert_eq!(accountability.user.as_deref(), Some("u-1"));
        assert_eq!(accountability.ip, Some("10.0.0.7".parse().unwrap()));
        assert!(!accountability.admin);
    }
}
