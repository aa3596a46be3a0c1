use async_trait::async_trait;
use quarry_engine::{QueryBackend, QueryError, QueryResult, SqlDialect, Value};
use rusqlite::{params_from_iter, Connection, Row};
use std::path::Path;
use std::sync::Mutex;

pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

impl SqliteBackend {
    pub fn in_memory() -> Result<Self, QueryError> {
        let conn = Connection::open_in_memory().map_err(|err| QueryError::store(0, err))?;
        Ok(Self::from_connection(conn))
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, QueryError> {
        let conn = Connection::open(path).map_err(|err| QueryError::store(0, err))?;
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    /// Runs a `;` separated script without parameters, e.g. schema setup.
    pub fn execute_batch(&self, sql: &str) -> Result<(), QueryError> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| QueryError::store(0, "sqlite mutex poisoned"))?;
        conn.execute_batch(sql).map_err(|err| QueryError::store(0, err))
    }
}

#[async_trait(?Send)]
impl QueryBackend for SqliteBackend {
    fn dialect(&self) -> SqlDialect {
        SqlDialect::Sqlite
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<QueryResult, QueryError> {
        let parameter_count = params.len();
        let conn = self
            .conn
            .lock()
            .map_err(|_| QueryError::store(parameter_count, "sqlite mutex poisoned"))?;

        let mut stmt = conn
            .prepare(sql)
            .map_err(|err| QueryError::store(parameter_count, err))?;
        let columns = stmt
            .column_names()
            .into_iter()
            .map(|name| name.to_string())
            .collect::<Vec<_>>();
        let bound_params = params.iter().cloned().map(to_sql_value);
        let mut rows = stmt
            .query(params_from_iter(bound_params))
            .map_err(|err| QueryError::store(parameter_count, err))?;
        let mut result_rows = Vec::new();
        while let Some(row) = rows
            .next()
            .map_err(|err| QueryError::store(parameter_count, err))?
        {
            result_rows.push(map_row(row, parameter_count)?);
        }
        Ok(QueryResult {
            columns,
            rows: result_rows,
        })
    }
}

fn map_row(row: &Row<'_>, parameter_count: usize) -> Result<Vec<Value>, QueryError> {
    let mut values = Vec::new();
    for idx in 0..row.as_ref().column_count() {
        let value = row
            .get_ref(idx)
            .map_err(|err| QueryError::store(parameter_count, err))?;
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
    Ok(values)
}

// sqlite has no boolean storage class
fn to_sql_value(value: Value) -> rusqlite::types::Value {
    match value {
        Value::Null => rusqlite::types::Value::Null,
        Value::Boolean(value) => rusqlite::types::Value::Integer(i64::from(value)),
        Value::Integer(value) => rusqlite::types::Value::Integer(value),
        Value::Real(value) => rusqlite::types::Value::Real(value),
        Value::Text(value) => rusqlite::types::Value::Text(value),
        Value::Blob(value) => rusqlite::types::Value::Blob(value),
    }
}
