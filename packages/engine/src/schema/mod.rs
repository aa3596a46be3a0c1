mod introspect;
mod overview;
mod provider;

pub use introspect::IntrospectingSchemaProvider;
pub use overview::{
    CollectionMeta, FieldMeta, FieldType, RelationLink, RelationMeta, SchemaOverview,
};
pub use provider::{SchemaProvider, StaticSchemaProvider};
