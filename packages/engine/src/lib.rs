mod backend;
mod config;
mod context;
mod engine;
mod error;
pub mod permissions;
pub mod query;
pub mod schema;
pub mod sql;
mod types;

pub use backend::{QueryBackend, SqlDialect};
pub use config::EngineConfig;
pub use context::{Accountability, RequestContext, RequestScope};
pub use engine::Engine;
pub use error::{ErrorCode, ErrorStatus, QueryError};
pub use schema::SchemaOverview;
pub use types::{QueryResult, Value};
