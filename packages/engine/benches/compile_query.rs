use std::hint::black_box;
use std::sync::Arc;

use async_trait::async_trait;
use criterion::{criterion_group, criterion_main, Criterion};
use quarry_engine::permissions::{MemoryCache, MemoryPolicySource, PermissionCache};
use quarry_engine::query::{build_field_nodes, AbstractQuery, FilterNode, Modifiers, SortNode};
use quarry_engine::sql::render;
use quarry_engine::{
    Accountability, Engine, EngineConfig, QueryBackend, QueryError, QueryResult, RequestContext,
    SchemaOverview, SqlDialect, Value,
};
use serde_json::json;
use tokio::runtime::{Builder, Runtime};

const SCHEMA: &str = r#"{
    "collections": {
        "articles": {"primary": "id", "fields": [
            {"field": "id", "type": "integer"},
            {"field": "title", "type": "string"},
            {"field": "status", "type": "string"},
            {"field": "author", "type": "integer"},
            {"field": "published", "type": "dateTime"},
            {"field": "comments", "type": "alias"}
        ]},
        "authors": {"primary": "id", "fields": [
            {"field": "id", "type": "integer"},
            {"field": "name", "type": "string"},
            {"field": "address", "type": "integer"}
        ]},
        "addresses": {"primary": "id", "fields": [
            {"field": "id", "type": "integer"},
            {"field": "city", "type": "string"}
        ]},
        "comments": {"primary": "id", "fields": [
            {"field": "id", "type": "integer"},
            {"field": "article", "type": "integer"},
            {"field": "body", "type": "text"}
        ]}
    },
    "relations": [
        {"many_collection": "articles", "many_field": "author", "one_collection": "authors"},
        {"many_collection": "authors", "many_field": "address", "one_collection": "addresses"},
        {"many_collection": "comments", "many_field": "article",
         "one_collection": "articles", "one_field": "comments"}
    ]
}"#;

const POLICIES: &str = r#"{
    "policies": [{"id": "published"}, {"id": "drafts"}],
    "access": [
        {"policy": "published", "role": "reader", "sort": 1},
        {"policy": "drafts", "role": "reader", "sort": 2}
    ],
    "permissions": [
        {"policy": "published", "collection": "articles", "action": "read",
         "fields": ["id", "title", "author", "published", "comments"],
         "permissions": {"status": {"_eq": "published"}}},
        {"policy": "drafts", "collection": "articles", "action": "read",
         "fields": ["id", "title", "status"],
         "permissions": {"status": {"_eq": "draft"}}},
        {"policy": "published", "collection": "authors", "action": "read", "fields": ["*"]},
        {"policy": "published", "collection": "addresses", "action": "read", "fields": ["*"]},
        {"policy": "published", "collection": "comments", "action": "read", "fields": ["*"]}
    ]
}"#;

struct NullBackend;

#[async_trait(?Send)]
impl QueryBackend for NullBackend {
    fn dialect(&self) -> SqlDialect {
        SqlDialect::Postgres
    }

    async fn execute(&self, _sql: &str, _params: &[Value]) -> Result<QueryResult, QueryError> {
        Ok(QueryResult::default())
    }
}

fn runtime() -> Runtime {
    Builder::new_current_thread()
        .build()
        .expect("failed to build tokio runtime")
}

fn engine() -> Engine {
    let cache: Arc<PermissionCache> = Arc::new(MemoryCache::new());
    Engine::new(
        EngineConfig::default(),
        Arc::new(NullBackend),
        Arc::new(MemoryPolicySource::from_json_str(POLICIES).expect("policies should parse")),
        cache,
    )
    .expect("engine should build")
}

fn wide_query(schema: &SchemaOverview) -> AbstractQuery {
    let fields = [
        "id",
        "title",
        "year(published)",
        "author.name",
        "author.address.city",
        "comments.body",
    ];
    let filter = json!({
        "_or": [
            {"title": {"_icontains": "rust"}},
            {"author": {"address": {"city": {"_in": ["Oslo", "Bergen"]}}}}
        ]
    });
    AbstractQuery {
        store: "main".to_string(),
        collection: "articles".to_string(),
        fields: build_field_nodes(schema, "main", "articles", &fields)
            .expect("bench fields should resolve"),
        modifiers: Modifiers {
            filter: Some(FilterNode::from_json(&filter).expect("bench filter should parse")),
            sort: vec![SortNode::parse("-published"), SortNode::parse("id")],
            limit: Some(25),
            offset: Some(50),
        },
        cases: Vec::new(),
        related_filters: Default::default(),
    }
}

fn bench_compile_as_admin(c: &mut Criterion) {
    let runtime = runtime();
    let engine = engine();
    let schema = Arc::new(SchemaOverview::from_json_str(SCHEMA).expect("schema should parse"));
    let query = wide_query(&schema);
    let ctx = RequestContext::new(Accountability::admin(), schema);

    c.bench_function("compile_and_render_admin", |b| {
        b.iter(|| {
            let sql = runtime
                .block_on(engine.compile(black_box(&query), &ctx))
                .expect("compile should succeed");
            let statement = render(&sql, SqlDialect::Postgres).expect("render should succeed");
            black_box(statement);
        });
    });
}

fn bench_compile_with_policies(c: &mut Criterion) {
    let runtime = runtime();
    let engine = engine();
    let schema = Arc::new(SchemaOverview::from_json_str(SCHEMA).expect("schema should parse"));
    let fields = ["id", "title", "status", "author.name", "comments.body"];
    let mut query = AbstractQuery {
        fields: build_field_nodes(&schema, "main", "articles", &fields)
            .expect("bench fields should resolve"),
        ..wide_query(&schema)
    };
    // `published` is only readable on some rows, so it cannot order the result
    query.modifiers.sort = vec![SortNode::parse("id")];

    c.bench_function("compile_with_two_policies", |b| {
        b.iter(|| {
            // a fresh scope per iteration so the permission cache stays cold
            let ctx = RequestContext::new(
                Accountability::user("bench", vec!["reader".to_string()]),
                schema.clone(),
            );
            let sql = runtime
                .block_on(engine.compile(black_box(&query), &ctx))
                .expect("compile should succeed");
            engine.release(&ctx);
            black_box(sql);
        });
    });
}

criterion_group!(benches, bench_compile_as_admin, bench_compile_with_policies);
criterion_main!(benches);
