use crate::error::{unknown_field_error, unsupported_error};
use crate::query::ast::Function;
use crate::query::filter::Operator;
use crate::schema::{FieldMeta, FieldType, RelationLink, RelationMeta, SchemaOverview};
use crate::QueryError;

/// One many-to-one hop of a dotted path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationStep {
    /// Field on `from` holding the foreign key.
    pub field: String,
    pub from: String,
    pub to: String,
    /// Identifier of `to` the foreign key points at.
    pub foreign: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedPath {
    pub steps: Vec<RelationStep>,
    /// Collection owning `column`.
    pub table: String,
    pub column: FieldMeta,
}

/// Resolves `author.address.city` against `collection`. Every segment before the last must be
/// a many-to-one relation, because anything else would multiply the rows of the outer query.
pub fn resolve_field_path(
    schema: &SchemaOverview,
    collection: &str,
    path: &str,
) -> Result<ResolvedPath, QueryError> {
    let segments = path.split('.').collect::<Vec<_>>();
    let Some((last, hops)) = segments.split_last() else {
        return Err(QueryError::InvalidQuery("empty field path".to_string()));
    };

    let mut steps = Vec::with_capacity(hops.len());
    let mut table = collection.to_string();
    for hop in hops {
        schema.field(&table, hop)?;
        let relation = match schema.relation_for_field(&table, hop) {
            Some(RelationLink::ManyToOne(relation)) => relation,
            Some(RelationLink::OneToMany(_)) | Some(RelationLink::OneToAny(_)) => {
                return Err(unsupported_error(format!(
                    "traversing to-many relation '{hop}' in '{path}'"
                )))
            }
            Some(RelationLink::AnyToOne(_)) => {
                return Err(unsupported_error(format!(
                    "traversing a2o relation '{hop}' in '{path}'"
                )))
            }
            None => {
                return Err(QueryError::SchemaResolution(format!(
                    "field '{hop}' of collection '{table}' is not relational"
                )))
            }
        };
        let step = many_to_one_step(schema, relation)?;
        table = step.to.clone();
        steps.push(step);
    }

    let column = schema.field(&table, last)?;
    if column.field_type == FieldType::Alias {
        return Err(unsupported_error(format!(
            "comparing alias field '{last}' of collection '{table}'"
        )));
    }
    Ok(ResolvedPath {
        steps,
        table,
        column: column.clone(),
    })
}

fn many_to_one_step(
    schema: &SchemaOverview,
    relation: &RelationMeta,
) -> Result<RelationStep, QueryError> {
    let to = relation.one_collection.clone().ok_or_else(|| {
        QueryError::Configuration(format!(
            "relation '{}.{}' has no related collection",
            relation.many_collection, relation.many_field
        ))
    })?;
    Ok(RelationStep {
        field: relation.many_field.clone(),
        from: relation.many_collection.clone(),
        foreign: schema.primary_key(&to)?.to_string(),
        to,
    })
}

/// Pattern operators only apply to string columns and `intersects` only to geometries.
pub fn check_operator(
    collection: &str,
    field: &FieldMeta,
    operator: Operator,
) -> Result<(), QueryError> {
    let compatible = if operator.is_pattern() {
        field.field_type.is_string_like()
    } else if operator == Operator::Intersects {
        field.field_type.is_geometry()
    } else {
        true
    };
    if compatible {
        return Ok(());
    }
    Err(unsupported_error(format!(
        "operator '{}' on field '{}' of collection '{collection}' with type {:?}",
        operator.as_str(),
        field.field,
        field.field_type
    )))
}

/// Checks a function field or target. `count` returns the relation it aggregates over.
pub fn check_function<'a>(
    schema: &'a SchemaOverview,
    collection: &str,
    field: &str,
    function: Function,
) -> Result<Option<&'a RelationMeta>, QueryError> {
    let meta = schema
        .collection(collection)?
        .field(field)
        .ok_or_else(|| unknown_field_error(collection, field))?;

    if function == Function::Count {
        return match schema.relation_for_field(collection, field) {
            Some(RelationLink::OneToMany(relation)) => Ok(Some(relation)),
            _ => Err(unsupported_error(format!(
                "count() on field '{field}' of collection '{collection}', which is not an o2m relation"
            ))),
        };
    }

    let supported = match meta.field_type {
        FieldType::DateTime | FieldType::Timestamp => true,
        FieldType::Date => !function.needs_time(),
        FieldType::Time => !function.needs_date(),
        _ => false,
    };
    if !supported {
        return Err(unsupported_error(format!(
            "{}() on field '{field}' of collection '{collection}' with type {:?}",
            function.as_str(),
            meta.field_type
        )));
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::{check_function, check_operator, resolve_field_path};
    use crate::error::ErrorCode;
    use crate::query::ast::Function;
    use crate::query::filter::Operator;
    use crate::schema::FieldType;
    use crate::SchemaOverview;

    fn schema() -> SchemaOverview {
        SchemaOverview::from_json_str(
            r#"{
            "collections": {
                "articles": {"primary": "id", "fields": [
                    {"field": "id", "type": "integer"},
                    {"field": "title", "type": "string"},
                    {"field": "author", "type": "integer"},
                    {"field": "published", "type": "date"},
                    {"field": "area", "type": "geometry"},
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
                    {"field": "article", "type": "integer"}
                ]}
            },
            "relations": [
                {"many_collection": "articles", "many_field": "author", "one_collection": "authors"},
                {"many_collection": "authors", "many_field": "address", "one_collection": "addresses"},
                {"many_collection": "comments", "many_field": "article",
                 "one_collection": "articles", "one_field": "comments"}
            ]
        }"#,
        )
        .unwrap()
    }

    #[test]
    fn resolves_many_to_one_chains() {
        let resolved = resolve_field_path(&schema(), "articles", "author.address.city").unwrap();
        assert_eq!(resolved.table, "addresses");
        assert_eq!(resolved.column.field, "city");
        let hops = resolved
            .steps
            .iter()
            .map(|step| (step.from.as_str(), step.field.as_str(), step.to.as_str()))
            .collect::<Vec<_>>();
        assert_eq!(
            hops,
            vec![("articles", "author", "authors"), ("authors", "address", "addresses")]
        );
    }

    #[test]
    fn plain_columns_resolve_without_steps() {
        let resolved = resolve_field_path(&schema(), "articles", "title").unwrap();
        assert!(resolved.steps.is_empty());
        assert_eq!(resolved.table, "articles");
    }

    #[test]
    fn to_many_hops_are_unsupported() {
        let error = resolve_field_path(&schema(), "articles", "comments.id").unwrap_err();
        assert_eq!(error.code(), ErrorCode::UnsupportedQueryConstruct);
    }

    #[test]
    fn unknown_segments_fail_resolution() {
        let error = resolve_field_path(&schema(), "articles", "author.nope").unwrap_err();
        assert_eq!(error.code(), ErrorCode::SchemaResolution);
        let error = resolve_field_path(&schema(), "articles", "title.length").unwrap_err();
        assert_eq!(error.code(), ErrorCode::SchemaResolution);
    }

    #[test]
    fn pattern_operators_need_string_fields() {
        let schema = schema();
        let title = schema.field("articles", "title").unwrap();
        let id = schema.field("articles", "id").unwrap();
        let area = schema.field("articles", "area").unwrap();
        assert!(check_operator("articles", title, Operator::Contains).is_ok());
        assert_eq!(
            check_operator("articles", id, Operator::StartsWith)
                .unwrap_err()
                .code(),
            ErrorCode::UnsupportedQueryConstruct
        );
        assert!(check_operator("articles", area, Operator::Intersects).is_ok());
        assert!(check_operator("articles", title, Operator::Intersects).is_err());
        assert!(check_operator("articles", area, Operator::Null).is_ok());
        assert_eq!(area.field_type, FieldType::Geometry);
    }

    #[test]
    fn functions_check_field_kinds() {
        let schema = schema();
        assert!(check_function(&schema, "articles", "published", Function::Year).is_ok());
        assert!(check_function(&schema, "articles", "published", Function::Hour).is_err());
        assert!(check_function(&schema, "articles", "title", Function::Month).is_err());
        let relation = check_function(&schema, "articles", "comments", Function::Count)
            .unwrap()
            .unwrap();
        assert_eq!(relation.many_collection, "comments");
        assert!(check_function(&schema, "articles", "author", Function::Count).is_err());
    }
}
