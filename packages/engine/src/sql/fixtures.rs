use std::sync::Arc;

use crate::config::EngineConfig;
use crate::context::{Accountability, RequestContext};
use crate::query::{build_field_nodes, AbstractQuery, FilterNode, Modifiers};
use crate::SchemaOverview;

pub(crate) const BLOG_SCHEMA: &str = r#"{
    "collections": {
        "articles": {"primary": "id", "fields": [
            {"field": "id", "type": "integer", "nullable": false},
            {"field": "title", "type": "string"},
            {"field": "status", "type": "string"},
            {"field": "author", "type": "integer"},
            {"field": "published", "type": "dateTime"},
            {"field": "area", "type": "geometry"},
            {"field": "item", "type": "string"},
            {"field": "item_collection", "type": "string"},
            {"field": "comments", "type": "alias"},
            {"field": "notes", "type": "alias"}
        ]},
        "authors": {"primary": "id", "fields": [
            {"field": "id", "type": "integer", "nullable": false},
            {"field": "name", "type": "string"},
            {"field": "address", "type": "integer"}
        ]},
        "addresses": {"primary": "id", "fields": [
            {"field": "id", "type": "integer", "nullable": false},
            {"field": "street", "type": "string"},
            {"field": "city", "type": "string"}
        ]},
        "comments": {"primary": "id", "fields": [
            {"field": "id", "type": "integer", "nullable": false},
            {"field": "article", "type": "integer"},
            {"field": "body", "type": "text"}
        ]},
        "pages": {"primary": "id", "fields": [
            {"field": "id", "type": "integer", "nullable": false},
            {"field": "title", "type": "string"}
        ]},
        "videos": {"primary": "id", "fields": [
            {"field": "id", "type": "integer", "nullable": false},
            {"field": "url", "type": "string"}
        ]},
        "notes": {"primary": "id", "fields": [
            {"field": "id", "type": "integer", "nullable": false},
            {"field": "body", "type": "text"},
            {"field": "target", "type": "string"},
            {"field": "target_collection", "type": "string"}
        ]}
    },
    "relations": [
        {"many_collection": "articles", "many_field": "author", "one_collection": "authors"},
        {"many_collection": "authors", "many_field": "address", "one_collection": "addresses"},
        {"many_collection": "comments", "many_field": "article",
         "one_collection": "articles", "one_field": "comments"},
        {"many_collection": "articles", "many_field": "item",
         "one_collection_field": "item_collection", "one_allowed_collections": ["pages", "videos"]},
        {"many_collection": "notes", "many_field": "target", "one_field": "notes",
         "one_collection_field": "target_collection", "one_allowed_collections": ["articles"]}
    ]
}"#;

pub(crate) fn blog_schema() -> Arc<SchemaOverview> {
    Arc::new(SchemaOverview::from_json_str(BLOG_SCHEMA).expect("blog schema"))
}

pub(crate) fn admin_context() -> RequestContext {
    RequestContext::new(Accountability::admin(), blog_schema())
}

pub(crate) fn articles_query(fields: &[&str], filter: Option<FilterNode>) -> AbstractQuery {
    let schema = blog_schema();
    AbstractQuery {
        store: EngineConfig::default().store,
        collection: "articles".to_string(),
        fields: build_field_nodes(&schema, "main", "articles", fields).expect("field tree"),
        modifiers: Modifiers {
            filter,
            ..Modifiers::default()
        },
        cases: Vec::new(),
        related_filters: Default::default(),
    }
}
