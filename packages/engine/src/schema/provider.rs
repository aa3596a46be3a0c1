use async_trait::async_trait;

use crate::{QueryError, SchemaOverview};

#[async_trait(?Send)]
pub trait SchemaProvider {
    async fn load_schema(&self) -> Result<SchemaOverview, QueryError>;
}

/// Serves a snapshot that was handed over up front, typically parsed from JSON.
pub struct StaticSchemaProvider {
    schema: SchemaOverview,
}

impl StaticSchemaProvider {
    pub fn new(schema: SchemaOverview) -> Self {
        Self { schema }
    }

    pub fn from_json_str(json: &str) -> Result<Self, QueryError> {
        Ok(Self::new(SchemaOverview::from_json_str(json)?))
    }
}

#[async_trait(?Send)]
impl SchemaProvider for StaticSchemaProvider {
    async fn load_schema(&self) -> Result<SchemaOverview, QueryError> {
        Ok(self.schema.clone())
    }
}
