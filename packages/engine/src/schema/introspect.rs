use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::schema::{CollectionMeta, FieldMeta, FieldType, RelationMeta, SchemaProvider};
use crate::{QueryBackend, QueryError, SchemaOverview, SqlDialect, Value};

const SQLITE_TABLES_SQL: &str = "SELECT name FROM sqlite_master \
     WHERE type = 'table' AND name NOT LIKE 'sqlite_%' \
     ORDER BY name";
const SQLITE_COLUMNS_SQL: &str =
    "SELECT name, type, \"notnull\", pk FROM pragma_table_info(?1) ORDER BY cid";
const SQLITE_FOREIGN_KEYS_SQL: &str =
    "SELECT \"from\", \"table\", \"to\" FROM pragma_foreign_key_list(?1) ORDER BY id, seq";

const POSTGRES_COLUMNS_SQL: &str = "SELECT table_name, column_name, data_type, udt_name, is_nullable \
     FROM information_schema.columns \
     WHERE table_schema = $1 \
     ORDER BY table_name, ordinal_position";
const POSTGRES_PRIMARY_KEYS_SQL: &str = "SELECT tc.table_name, kcu.column_name \
     FROM information_schema.table_constraints tc \
     JOIN information_schema.key_column_usage kcu \
       ON tc.constraint_name = kcu.constraint_name AND tc.table_schema = kcu.table_schema \
     WHERE tc.constraint_type = 'PRIMARY KEY' AND tc.table_schema = $1 \
     ORDER BY tc.table_name, kcu.ordinal_position";
const POSTGRES_FOREIGN_KEYS_SQL: &str = "SELECT kcu.table_name, kcu.column_name, ccu.table_name, ccu.column_name \
     FROM information_schema.table_constraints tc \
     JOIN information_schema.key_column_usage kcu \
       ON tc.constraint_name = kcu.constraint_name AND tc.table_schema = kcu.table_schema \
     JOIN information_schema.constraint_column_usage ccu \
       ON ccu.constraint_name = tc.constraint_name AND ccu.table_schema = tc.table_schema \
     WHERE tc.constraint_type = 'FOREIGN KEY' AND tc.table_schema = $1 \
     ORDER BY kcu.table_name, kcu.column_name";

/// Reads collections and many-to-one relations from the database catalog. Tables without a
/// primary key are skipped; o2m alias fields only exist in explicit schema snapshots.
pub struct IntrospectingSchemaProvider<'a> {
    backend: &'a dyn QueryBackend,
    postgres_schema: String,
}

impl<'a> IntrospectingSchemaProvider<'a> {
    pub fn new(backend: &'a dyn QueryBackend) -> Self {
        Self {
            backend,
            postgres_schema: "public".to_string(),
        }
    }

    pub fn with_postgres_schema(mut self, schema: impl Into<String>) -> Self {
        self.postgres_schema = schema.into();
        self
    }

    async fn load_sqlite(&self) -> Result<SchemaOverview, QueryError> {
        let tables = self.backend.execute(SQLITE_TABLES_SQL, &[]).await?;
        let mut collections = BTreeMap::new();
        let mut relations = Vec::new();

        for row in &tables.rows {
            let table = text_at(row, 0, "name")?;
            let params = [Value::Text(table.clone())];
            let columns = self.backend.execute(SQLITE_COLUMNS_SQL, &params).await?;

            let mut fields = Vec::new();
            let mut primary = None;
            for column in &columns.rows {
                let name = text_at(column, 0, "name")?;
                let declared = optional_text_at(column, 1).unwrap_or_default();
                let not_null = integer_at(column, 2) != 0;
                if integer_at(column, 3) == 1 {
                    primary = Some(name.clone());
                }
                fields.push(FieldMeta {
                    field: name,
                    field_type: classify_sqlite_type(&declared),
                    nullable: !not_null,
                });
            }

            let Some(primary) = primary else {
                tracing::warn!(table = %table, "skipping table without a primary key");
                continue;
            };

            let foreign_keys = self
                .backend
                .execute(SQLITE_FOREIGN_KEYS_SQL, &params)
                .await?;
            for key in &foreign_keys.rows {
                relations.push(RelationMeta {
                    many_collection: table.clone(),
                    many_field: text_at(key, 0, "from")?,
                    one_collection: Some(text_at(key, 1, "table")?),
                    one_field: None,
                    one_collection_field: None,
                    one_allowed_collections: Vec::new(),
                });
            }

            collections.insert(
                table.clone(),
                CollectionMeta {
                    collection: table,
                    primary,
                    fields,
                },
            );
        }

        finish(collections, relations)
    }

    async fn load_postgres(&self) -> Result<SchemaOverview, QueryError> {
        let params = [Value::Text(self.postgres_schema.clone())];
        let columns = self.backend.execute(POSTGRES_COLUMNS_SQL, &params).await?;
        let primary_keys = self
            .backend
            .execute(POSTGRES_PRIMARY_KEYS_SQL, &params)
            .await?;
        let foreign_keys = self
            .backend
            .execute(POSTGRES_FOREIGN_KEYS_SQL, &params)
            .await?;

        let mut fields_by_table: BTreeMap<String, Vec<FieldMeta>> = BTreeMap::new();
        for row in &columns.rows {
            let table = text_at(row, 0, "table_name")?;
            let data_type = optional_text_at(row, 2).unwrap_or_default();
            let udt_name = optional_text_at(row, 3).unwrap_or_default();
            fields_by_table.entry(table).or_default().push(FieldMeta {
                field: text_at(row, 1, "column_name")?,
                field_type: classify_postgres_type(&data_type, &udt_name),
                nullable: optional_text_at(row, 4).as_deref() != Some("NO"),
            });
        }

        let mut primaries: BTreeMap<String, String> = BTreeMap::new();
        for row in &primary_keys.rows {
            let table = text_at(row, 0, "table_name")?;
            let column = text_at(row, 1, "column_name")?;
            primaries.entry(table).or_insert(column);
        }

        let mut collections = BTreeMap::new();
        for (table, fields) in fields_by_table {
            let Some(primary) = primaries.remove(&table) else {
                tracing::warn!(table = %table, "skipping table without a primary key");
                continue;
            };
            collections.insert(
                table.clone(),
                CollectionMeta {
                    collection: table,
                    primary,
                    fields,
                },
            );
        }

        let mut relations = Vec::new();
        for row in &foreign_keys.rows {
            relations.push(RelationMeta {
                many_collection: text_at(row, 0, "table_name")?,
                many_field: text_at(row, 1, "column_name")?,
                one_collection: Some(text_at(row, 2, "foreign_table_name")?),
                one_field: None,
                one_collection_field: None,
                one_allowed_collections: Vec::new(),
            });
        }

        finish(collections, relations)
    }
}

#[async_trait(?Send)]
impl SchemaProvider for IntrospectingSchemaProvider<'_> {
    async fn load_schema(&self) -> Result<SchemaOverview, QueryError> {
        match self.backend.dialect() {
            SqlDialect::Sqlite => self.load_sqlite().await,
            SqlDialect::Postgres => self.load_postgres().await,
        }
    }
}

fn finish(
    collections: BTreeMap<String, CollectionMeta>,
    relations: Vec<RelationMeta>,
) -> Result<SchemaOverview, QueryError> {
    // foreign keys into skipped tables would fail normalization
    let relations = relations
        .into_iter()
        .filter(|relation| {
            collections.contains_key(&relation.many_collection)
                && relation
                    .one_collection
                    .as_ref()
                    .is_some_and(|one| collections.contains_key(one))
        })
        .collect();
    SchemaOverview {
        collections,
        relations,
    }
    .normalized()
}

pub(crate) fn classify_sqlite_type(declared: &str) -> FieldType {
    let upper = declared.to_ascii_uppercase();
    if upper.contains("BIGINT") {
        FieldType::BigInteger
    } else if upper.contains("INT") {
        FieldType::Integer
    } else if upper.contains("BOOL") {
        FieldType::Boolean
    } else if upper.contains("UUID") {
        FieldType::Uuid
    } else if upper.contains("CHAR") {
        FieldType::String
    } else if upper.contains("TEXT") || upper.contains("CLOB") {
        FieldType::Text
    } else if upper.contains("REAL") || upper.contains("FLOA") || upper.contains("DOUB") {
        FieldType::Float
    } else if upper.contains("DEC") || upper.contains("NUMERIC") {
        FieldType::Decimal
    } else if upper.contains("DATETIME") {
        FieldType::DateTime
    } else if upper.contains("TIMESTAMP") {
        FieldType::Timestamp
    } else if upper.contains("DATE") {
        FieldType::Date
    } else if upper.contains("TIME") {
        FieldType::Time
    } else if upper.contains("JSON") {
        FieldType::Json
    } else if upper.contains("BLOB") {
        FieldType::Binary
    } else if upper.contains("GEOMETRY") || upper.contains("POINT") || upper.contains("POLYGON")
    {
        FieldType::Geometry
    } else {
        FieldType::Unknown
    }
}

pub(crate) fn classify_postgres_type(data_type: &str, udt_name: &str) -> FieldType {
    match data_type {
        "smallint" | "integer" => FieldType::Integer,
        "bigint" => FieldType::BigInteger,
        "character varying" | "character" => FieldType::String,
        "text" => FieldType::Text,
        "boolean" => FieldType::Boolean,
        "numeric" => FieldType::Decimal,
        "real" | "double precision" => FieldType::Float,
        "date" => FieldType::Date,
        "timestamp without time zone" => FieldType::DateTime,
        "timestamp with time zone" => FieldType::Timestamp,
        "time without time zone" | "time with time zone" => FieldType::Time,
        "json" | "jsonb" => FieldType::Json,
        "uuid" => FieldType::Uuid,
        "bytea" => FieldType::Binary,
        "USER-DEFINED" if udt_name == "geometry" => FieldType::Geometry,
        _ => FieldType::Unknown,
    }
}

fn text_at(row: &[Value], index: usize, column: &str) -> Result<String, QueryError> {
    optional_text_at(row, index).ok_or_else(|| {
        QueryError::Configuration(format!("catalog column '{column}' is not text"))
    })
}

fn optional_text_at(row: &[Value], index: usize) -> Option<String> {
    match row.get(index) {
        Some(Value::Text(value)) => Some(value.clone()),
        _ => None,
    }
}

fn integer_at(row: &[Value], index: usize) -> i64 {
    match row.get(index) {
        Some(Value::Integer(value)) => *value,
        Some(Value::Boolean(value)) => i64::from(*value),
        _ => 0,
    }
}
