//! Policy resolution and the permission overlay applied to queries before lowering.

mod apply;
mod cache;
mod evaluator;
mod ip;
mod policy;
mod source;

pub use apply::apply_permissions;
pub use cache::{Cache, MemoryCache};
pub use evaluator::{
    CacheLookup, CachedPermissions, PermissionCache, PermissionCacheKey, PermissionEvaluator,
    ResolvedPermissions,
};
pub use ip::{parse_ip_list, IpRule};
pub use policy::{AccessRow, Action, Permission, Policy};
pub use source::{MemoryPolicySource, PolicySource, SqlPolicySource};
