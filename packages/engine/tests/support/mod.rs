#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use quarry_engine::permissions::{MemoryCache, MemoryPolicySource, PermissionCache, PolicySource};
use quarry_engine::query::{build_field_nodes, AbstractQuery, FilterNode, Modifiers};
use quarry_engine::{
    Accountability, Engine, EngineConfig, QueryBackend, QueryError, QueryResult, RequestContext,
    SchemaOverview, SqlDialect, Value,
};
use rusqlite::{params_from_iter, Connection};

/// In-memory SQLite store driven through the engine's backend trait.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn in_memory() -> Self {
        let conn = Connection::open_in_memory().expect("sqlite should open in memory");
        Self {
            conn: Mutex::new(conn),
        }
    }

    pub fn seeded() -> Self {
        let store = Self::in_memory();
        store.batch(BLOG_TABLES);
        store.batch(BLOG_ROWS);
        store
    }

    pub fn batch(&self, sql: &str) {
        self.conn
            .lock()
            .expect("sqlite mutex")
            .execute_batch(sql)
            .expect("batch should apply");
    }
}

#[async_trait(?Send)]
impl QueryBackend for SqliteStore {
    fn dialect(&self) -> SqlDialect {
        SqlDialect::Sqlite
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<QueryResult, QueryError> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| QueryError::store(params.len(), "sqlite mutex poisoned"))?;
        let mut stmt = conn
            .prepare(sql)
            .map_err(|error| QueryError::store(params.len(), error))?;
        let columns = stmt
            .column_names()
            .into_iter()
            .map(str::to_string)
            .collect::<Vec<_>>();
        let bound = params.iter().map(|value| match value {
            Value::Null => rusqlite::types::Value::Null,
            Value::Boolean(value) => rusqlite::types::Value::Integer(i64::from(*value)),
            Value::Integer(value) => rusqlite::types::Value::Integer(*value),
            Value::Real(value) => rusqlite::types::Value::Real(*value),
            Value::Text(value) => rusqlite::types::Value::Text(value.clone()),
            Value::Blob(value) => rusqlite::types::Value::Blob(value.clone()),
        });
        let mut rows = stmt
            .query(params_from_iter(bound))
            .map_err(|error| QueryError::store(params.len(), error))?;
        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .map_err(|error| QueryError::store(params.len(), error))?
        {
            let mut values = Vec::with_capacity(columns.len());
            for index in 0..columns.len() {
                let value = row
                    .get_ref(index)
                    .map_err(|error| QueryError::store(params.len(), error))?;
                values.push(match value {
                    rusqlite::types::ValueRef::Null => Value::Null,
                    rusqlite::types::ValueRef::Integer(value) => Value::Integer(value),
                    rusqlite::types::ValueRef::Real(value) => Value::Real(value),
                    rusqlite::types::ValueRef::Text(value) => {
                        Value::Text(String::from_utf8_lossy(value).to_string())
                    }
                    rusqlite::types::ValueRef::Blob(value) => Value::Blob(value.to_vec()),
                });
            }
            out.push(values);
        }
        Ok(QueryResult { columns, rows: out })
    }
}

pub const BLOG_TABLES: &str = "
CREATE TABLE addresses (id INTEGER PRIMARY KEY, street TEXT, city TEXT);
CREATE TABLE authors (id INTEGER PRIMARY KEY, name TEXT, address INTEGER REFERENCES addresses(id));
CREATE TABLE articles (
    id INTEGER PRIMARY KEY,
    title TEXT,
    status TEXT,
    author INTEGER REFERENCES authors(id),
    published DATETIME,
    item TEXT,
    item_collection TEXT
);
CREATE TABLE comments (id INTEGER PRIMARY KEY, article INTEGER REFERENCES articles(id), body TEXT);
CREATE TABLE pages (id INTEGER PRIMARY KEY, title TEXT);
CREATE TABLE videos (id INTEGER PRIMARY KEY, url TEXT);
CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT, target TEXT, target_collection TEXT);
";

pub const BLOG_ROWS: &str = "
INSERT INTO addresses VALUES (1, 'Main St', 'Oslo'), (2, 'High St', 'Bergen');
INSERT INTO authors VALUES (1, 'Ada', 1), (2, 'Brian', 2), (3, 'Cleo', NULL);
INSERT INTO articles VALUES
    (1, 'Slab of text', 'published', 1, '2024-03-05 10:00:00', '1', 'pages'),
    (2, 'Gamma', 'draft', 2, '2023-11-20 08:30:00', '1', 'videos'),
    (3, 'Abba rocks', 'published', NULL, '2024-07-01 12:00:00', NULL, NULL),
    (4, 'Delta', 'archived', 3, '2022-01-15 00:00:00', '9', 'pages');
INSERT INTO comments VALUES (1, 1, 'first'), (2, 1, 'second'), (3, 3, 'third');
INSERT INTO pages VALUES (1, 'About');
INSERT INTO videos VALUES (1, 'https://v/1');
INSERT INTO notes VALUES
    (1, 'note on 1', '1', 'articles'),
    (2, 'note on page', '1', 'pages'),
    (3, 'another', '2', 'articles');
";

pub const BLOG_SCHEMA: &str = r#"{
    "collections": {
        "articles": {"primary": "id", "fields": [
            {"field": "id", "type": "integer", "nullable": false},
            {"field": "title", "type": "string"},
            {"field": "status", "type": "string"},
            {"field": "author", "type": "integer"},
            {"field": "published", "type": "dateTime"},
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
        ]},
        "ghosts": {"primary": "id", "fields": [
            {"field": "id", "type": "integer", "nullable": false}
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

pub fn blog_schema() -> Arc<SchemaOverview> {
    Arc::new(SchemaOverview::from_json_str(BLOG_SCHEMA).expect("blog schema should parse"))
}

pub fn engine_with(store: Arc<SqliteStore>, policies: Arc<dyn PolicySource>) -> Engine {
    let cache: Arc<PermissionCache> = Arc::new(MemoryCache::new());
    Engine::new(EngineConfig::default(), store, policies, cache).expect("engine should build")
}

pub fn blog_engine() -> Engine {
    engine_with(
        Arc::new(SqliteStore::seeded()),
        Arc::new(MemoryPolicySource::default()),
    )
}

pub fn admin() -> RequestContext {
    RequestContext::new(Accountability::admin(), blog_schema())
}

pub fn query(collection: &str, fields: &[&str], filter: Option<serde_json::Value>) -> AbstractQuery {
    let schema = blog_schema();
    AbstractQuery {
        store: "main".to_string(),
        collection: collection.to_string(),
        fields: build_field_nodes(&schema, "main", collection, fields)
            .expect("field paths should resolve"),
        modifiers: Modifiers {
            filter: filter.map(|filter| FilterNode::from_json(&filter).expect("filter should parse")),
            ..Modifiers::default()
        },
        cases: Vec::new(),
        related_filters: Default::default(),
    }
}

pub fn run<F: std::future::Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("tokio runtime should build")
        .block_on(future)
}
