use std::collections::{HashMap, HashSet};

use futures_util::future::LocalBoxFuture;
use futures_util::{stream, FutureExt, StreamExt, TryStreamExt};
use serde_json::{Map as JsonMap, Value as JsonValue};

use crate::backend::QueryBackend;
use crate::config::EngineConfig;
use crate::sql::emitter::render;
use crate::sql::types::{AbstractSqlQuery, NestedMany};
use crate::{QueryError, SqlDialect, Value};

/// Runs a compiled query and nests the flat rows back into the shape of its field tree.
///
/// Every nested-many relation costs one child query per distinct parent key. Siblings at one
/// level run concurrently, at most `max_concurrent_subqueries` at a time. Any failing child
/// query fails the whole call.
pub async fn assemble(
    backend: &dyn QueryBackend,
    dialect: SqlDialect,
    query: &AbstractSqlQuery,
    config: &EngineConfig,
) -> Result<Vec<JsonValue>, QueryError> {
    let assembler = Assembler {
        backend,
        dialect,
        concurrency: config.max_concurrent_subqueries.max(1),
    };
    let rows = assembler.fetch(query, 0).await?;
    tracing::debug!(
        collection = %query.from.table,
        rows = rows.len(),
        "assembled result"
    );
    Ok(rows)
}

/// Shapes one flat row without running nested-many relations; their arrays are left empty.
pub fn unflatten_row(query: &AbstractSqlQuery, row: &[Value]) -> Result<JsonValue, QueryError> {
    shape_row(query, row, |_, _| JsonValue::Array(Vec::new()))
}

struct Assembler<'a> {
    backend: &'a dyn QueryBackend,
    dialect: SqlDialect,
    concurrency: usize,
}

/// Nested-many descriptor index and encoded parent key.
type ChildKey = (usize, String);

impl Assembler<'_> {
    fn fetch<'f>(
        &'f self,
        query: &'f AbstractSqlQuery,
        depth: usize,
    ) -> LocalBoxFuture<'f, Result<Vec<JsonValue>, QueryError>> {
        async move {
            let statement = render(query, self.dialect)?;
            tracing::debug!(
                collection = %query.from.table,
                parameters = statement.parameters.len(),
                depth,
                "executing statement"
            );
            let result = match self.backend.execute(&statement.sql, &statement.parameters).await
            {
                Ok(result) => result,
                Err(error) => {
                    tracing::warn!(
                        collection = %query.from.table,
                        parameters = statement.parameters.len(),
                        depth,
                        error = %error,
                        "store execution failed"
                    );
                    return Err(error);
                }
            };
            if let Some(row) = result.rows.iter().find(|row| row.len() < query.select.len()) {
                return Err(QueryError::store(
                    statement.parameters.len(),
                    format!(
                        "driver returned {} columns, expected {}",
                        row.len(),
                        query.select.len()
                    ),
                ));
            }

            let children = self.fetch_children(query, &result.rows, depth).await?;
            result
                .rows
                .iter()
                .map(|row| {
                    shape_row(query, row, |descriptor, keys| {
                        let rows = keys.and_then(|keys| {
                            children.get(&(descriptor, encode_keys(&keys)))
                        });
                        JsonValue::Array(rows.cloned().unwrap_or_default())
                    })
                })
                .collect::<Result<Vec<_>, QueryError>>()
        }
        .boxed_local()
    }

    async fn fetch_children(
        &self,
        query: &AbstractSqlQuery,
        rows: &[Vec<Value>],
        depth: usize,
    ) -> Result<HashMap<ChildKey, Vec<JsonValue>>, QueryError> {
        let mut seen: HashSet<ChildKey> = HashSet::new();
        let mut jobs: Vec<(ChildKey, Vec<Value>)> = Vec::new();
        for (index, descriptor) in query.nested_manys.iter().enumerate() {
            for row in rows {
                let Some(keys) = parent_keys(query, descriptor, row)? else {
                    continue;
                };
                let key = (index, encode_keys(&keys));
                if seen.insert(key.clone()) {
                    jobs.push((key, keys));
                }
            }
        }
        if jobs.is_empty() {
            return Ok(HashMap::new());
        }
        tracing::trace!(
            collection = %query.from.table,
            sub_queries = jobs.len(),
            depth,
            "running nested-many sub-queries"
        );

        stream::iter(jobs)
            .map(|(key, keys)| async move {
                let child = query.nested_manys[key.0].generate(&keys);
                let rows = self.fetch(&child, depth + 1).await?;
                Ok::<_, QueryError>((key, rows))
            })
            .buffered(self.concurrency)
            .try_collect()
            .await
    }
}

/// Hashable form of a parent key. `Value` holds floats, so it is keyed by its JSON text, which
/// keeps `1` and `"1"` apart.
fn encode_keys(keys: &[Value]) -> String {
    JsonValue::Array(keys.iter().map(Value::to_json).collect()).to_string()
}

/// The parent key a descriptor correlates on, `None` when any part of it is null.
fn parent_keys(
    query: &AbstractSqlQuery,
    descriptor: &NestedMany,
    row: &[Value],
) -> Result<Option<Vec<Value>>, QueryError> {
    let mut keys = Vec::with_capacity(descriptor.local_aliases.len());
    for alias in &descriptor.local_aliases {
        let value = column_value(query, row, alias)?;
        if value.is_null() {
            return Ok(None);
        }
        keys.push(value.clone());
    }
    Ok(Some(keys))
}

fn column_value<'r>(
    query: &AbstractSqlQuery,
    row: &'r [Value],
    alias: &str,
) -> Result<&'r Value, QueryError> {
    query
        .column_position(alias)
        .and_then(|position| row.get(position))
        .ok_or_else(|| {
            QueryError::InvalidQuery(format!("column '{alias}' is missing from the statement"))
        })
}

fn shape_row(
    query: &AbstractSqlQuery,
    row: &[Value],
    mut nested: impl FnMut(usize, Option<Vec<Value>>) -> JsonValue,
) -> Result<JsonValue, QueryError> {
    let mut object = JsonMap::new();
    for position in 0..=query.select.len() {
        for (index, descriptor) in query.nested_manys.iter().enumerate() {
            if descriptor.position == position {
                let keys = parent_keys(query, descriptor, row)?;
                let value = if keys.is_none() && descriptor.guarded {
                    JsonValue::Null
                } else {
                    nested(index, keys)
                };
                set_path(&mut object, &descriptor.path, value);
            }
        }
        let Some(column) = query.select.get(position) else {
            break;
        };
        if let Some(path) = query.paths.get(&column.alias) {
            let value = row.get(position).map(Value::to_json).unwrap_or(JsonValue::Null);
            set_path(&mut object, path, value);
        }
    }

    // deepest first, so a nulled parent never hides a child path still to be visited
    let mut nullable = query.nullable_objects.iter().collect::<Vec<_>>();
    nullable.sort_by_key(|object| std::cmp::Reverse(depth(&object.path)));
    for target in nullable {
        let mut missing = true;
        for alias in &target.key_aliases {
            if !column_value(query, row, alias)?.is_null() {
                missing = false;
            }
        }
        if missing {
            set_path(&mut object, &target.path, JsonValue::Null);
        } else {
            ensure_object(&mut object, &target.path);
        }
    }

    let mut branches = query.any_to_ones.iter().collect::<Vec<_>>();
    branches.sort_by_key(|branch| std::cmp::Reverse(depth(&branch.path)));
    for branch in branches {
        let chosen = match column_value(query, row, &branch.discriminator)? {
            Value::Text(collection) => Some(collection.clone()),
            Value::Integer(value) => Some(value.to_string()),
            _ => None,
        }
        .filter(|collection| branch.candidates.contains(collection));
        let (parent, field) = match branch.path.rsplit_once('.') {
            Some((parent, field)) => (Some(parent), field),
            None => (None, branch.path.as_str()),
        };
        let container = match parent {
            Some(parent) => match get_path_mut(&mut object, parent) {
                Some(JsonValue::Object(container)) => container,
                _ => continue,
            },
            None => &mut object,
        };
        resolve_branches(container, field, chosen.as_deref());
    }

    Ok(JsonValue::Object(object))
}

/// Folds the `field:collection` keys of one object into `field`, keeping the position of the
/// first branch.
fn resolve_branches(container: &mut JsonMap<String, JsonValue>, field: &str, chosen: Option<&str>) {
    let prefix = format!("{field}:");
    let mut rebuilt = JsonMap::with_capacity(container.len());
    let mut value = JsonValue::Null;
    for (key, entry) in std::mem::take(container) {
        match key.strip_prefix(&prefix) {
            Some(collection) => {
                if Some(collection) == chosen {
                    value = entry;
                }
                if !rebuilt.contains_key(field) {
                    rebuilt.insert(field.to_string(), JsonValue::Null);
                }
            }
            None => {
                rebuilt.insert(key, entry);
            }
        }
    }
    rebuilt.insert(field.to_string(), value);
    *container = rebuilt;
}

fn depth(path: &str) -> usize {
    path.matches('.').count()
}

/// Writes `value` at a dotted path, creating intermediate objects. A path running through a
/// non-object (a nulled relation) is dropped.
fn set_path(object: &mut JsonMap<String, JsonValue>, path: &str, value: JsonValue) {
    let mut current = object;
    let mut segments = path.split('.').peekable();
    while let Some(segment) = segments.next() {
        if segments.peek().is_none() {
            current.insert(segment.to_string(), value);
            return;
        }
        let next = current
            .entry(segment.to_string())
            .or_insert_with(|| JsonValue::Object(JsonMap::new()));
        match next {
            JsonValue::Object(inner) => current = inner,
            _ => return,
        }
    }
}

fn ensure_object(object: &mut JsonMap<String, JsonValue>, path: &str) {
    if get_path_mut(object, path).is_none() {
        set_path(object, path, JsonValue::Object(JsonMap::new()));
    }
}

fn get_path_mut<'o>(
    object: &'o mut JsonMap<String, JsonValue>,
    path: &str,
) -> Option<&'o mut JsonValue> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut current = object.get_mut(first)?;
    for segment in segments {
        current = current.as_object_mut()?.get_mut(segment)?;
    }
    Some(current)
}
