use sqlparser::ast::Ident;

use crate::error::unsupported_error;
use crate::query::{Function, LogicalOperator, Operator, SortDirection};
use crate::sql::types::{
    AbstractSqlQuery, ColumnExpr, ColumnRef, CountQuery, ParameterIndex, SqlCondition, SqlJoin,
    SqlOperand, SqlWhere,
};
use crate::{QueryError, SqlDialect, Value};

/// Dialect SQL text plus the values its numbered placeholders bind, in placeholder order.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterizedStatement {
    pub sql: String,
    pub parameters: Vec<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OperatorForm {
    Binary(&'static str),
    In,
    IsNull,
    /// `{keyword}` against a rewritten pattern, optionally lower-casing both sides.
    Pattern {
        keyword: &'static str,
        syntax: PatternSyntax,
        anchor: Anchor,
        lower: bool,
    },
    Intersects,
    Unsupported,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PatternSyntax {
    /// `%`/`_` wildcards, `\` escapes.
    Like,
    /// `*`/`?` wildcards, bracket escapes. Case-sensitive on SQLite.
    Glob,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Anchor {
    Anywhere,
    Start,
    End,
}

struct OperatorSql {
    operator: Operator,
    form: OperatorForm,
}

const fn entry(operator: Operator, form: OperatorForm) -> OperatorSql {
    OperatorSql { operator, form }
}

const fn like(keyword: &'static str, anchor: Anchor, lower: bool) -> OperatorForm {
    OperatorForm::Pattern {
        keyword,
        syntax: PatternSyntax::Like,
        anchor,
        lower,
    }
}

const fn glob(anchor: Anchor) -> OperatorForm {
    OperatorForm::Pattern {
        keyword: "GLOB",
        syntax: PatternSyntax::Glob,
        anchor,
        lower: false,
    }
}

static SQLITE_OPERATORS: [OperatorSql; 12] = [
    entry(Operator::Eq, OperatorForm::Binary("=")),
    entry(Operator::Lt, OperatorForm::Binary("<")),
    entry(Operator::Lte, OperatorForm::Binary("<=")),
    entry(Operator::Gt, OperatorForm::Binary(">")),
    entry(Operator::Gte, OperatorForm::Binary(">=")),
    entry(Operator::In, OperatorForm::In),
    entry(Operator::Contains, glob(Anchor::Anywhere)),
    entry(Operator::Icontains, like("LIKE", Anchor::Anywhere, true)),
    entry(Operator::StartsWith, glob(Anchor::Start)),
    entry(Operator::EndsWith, glob(Anchor::End)),
    entry(Operator::Intersects, OperatorForm::Unsupported),
    entry(Operator::Null, OperatorForm::IsNull),
];

static POSTGRES_OPERATORS: [OperatorSql; 12] = [
    entry(Operator::Eq, OperatorForm::Binary("=")),
    entry(Operator::Lt, OperatorForm::Binary("<")),
    entry(Operator::Lte, OperatorForm::Binary("<=")),
    entry(Operator::Gt, OperatorForm::Binary(">")),
    entry(Operator::Gte, OperatorForm::Binary(">=")),
    entry(Operator::In, OperatorForm::In),
    entry(Operator::Contains, like("LIKE", Anchor::Anywhere, false)),
    entry(Operator::Icontains, like("ILIKE", Anchor::Anywhere, false)),
    entry(Operator::StartsWith, like("LIKE", Anchor::Start, false)),
    entry(Operator::EndsWith, like("LIKE", Anchor::End, false)),
    entry(Operator::Intersects, OperatorForm::Intersects),
    entry(Operator::Null, OperatorForm::IsNull),
];

fn operator_form(dialect: SqlDialect, operator: Operator) -> OperatorForm {
    let table = match dialect {
        SqlDialect::Sqlite => &SQLITE_OPERATORS,
        SqlDialect::Postgres => &POSTGRES_OPERATORS,
    };
    table
        .iter()
        .find(|entry| entry.operator == operator)
        .map(|entry| entry.form)
        .unwrap_or(OperatorForm::Unsupported)
}

fn placeholder_for_dialect(dialect: SqlDialect, index: ParameterIndex) -> String {
    match dialect {
        SqlDialect::Sqlite => format!("?{}", index.0 + 1),
        SqlDialect::Postgres => format!("${}", index.0 + 1),
    }
}

fn quote_ident(value: &str) -> String {
    Ident::with_quote('"', value).to_string()
}

/// Renders abstract SQL as one parameterized statement. Placeholders are numbered by parameter
/// index, and every parameter is referenced exactly once.
pub fn render(
    query: &AbstractSqlQuery,
    dialect: SqlDialect,
) -> Result<ParameterizedStatement, QueryError> {
    let mut emitter = Emitter {
        dialect,
        parameters: query.parameters.clone(),
    };
    let sql = emitter.statement(query)?;
    Ok(ParameterizedStatement {
        sql,
        parameters: emitter.parameters,
    })
}

struct Emitter {
    dialect: SqlDialect,
    parameters: Vec<Value>,
}

impl Emitter {
    fn statement(&mut self, query: &AbstractSqlQuery) -> Result<String, QueryError> {
        let columns = query
            .select
            .iter()
            .map(|column| {
                Ok(format!(
                    "{} AS {}",
                    self.expr(&column.expr, true)?,
                    quote_ident(&column.alias)
                ))
            })
            .collect::<Result<Vec<_>, QueryError>>()?;
        let columns = if columns.is_empty() {
            // a level that only feeds nested relations still needs a projection
            "1".to_string()
        } else {
            columns.join(", ")
        };

        let mut sql = format!(
            "SELECT {columns} FROM {} AS {}",
            quote_ident(&query.from.table),
            quote_ident(&query.from.alias)
        );
        for join in &query.joins {
            sql.push_str(&self.join(join)?);
        }
        if let Some(where_clause) = &query.where_clause {
            sql.push_str(" WHERE ");
            sql.push_str(&self.predicate(where_clause)?);
        }
        if !query.order.is_empty() {
            let order = query
                .order
                .iter()
                .map(|order| {
                    let direction = match order.direction {
                        SortDirection::Ascending => "ASC",
                        SortDirection::Descending => "DESC",
                    };
                    Ok(format!("{} {direction}", self.expr(&order.expr, false)?))
                })
                .collect::<Result<Vec<_>, QueryError>>()?;
            sql.push_str(" ORDER BY ");
            sql.push_str(&order.join(", "));
        }
        match (query.limit, query.offset) {
            (Some(limit), offset) => {
                sql.push_str(&format!(" LIMIT {}", self.placeholder(limit)));
                if let Some(offset) = offset {
                    sql.push_str(&format!(" OFFSET {}", self.placeholder(offset)));
                }
            }
            (None, Some(offset)) => {
                let unbounded = match self.dialect {
                    SqlDialect::Sqlite => " LIMIT -1",
                    SqlDialect::Postgres => "",
                };
                sql.push_str(&format!("{unbounded} OFFSET {}", self.placeholder(offset)));
            }
            (None, None) => {}
        }
        Ok(sql)
    }

    fn join(&mut self, join: &SqlJoin) -> Result<String, QueryError> {
        Ok(format!(
            " LEFT JOIN {} AS {} ON {}",
            quote_ident(&join.table.table),
            quote_ident(&join.table.alias),
            self.predicate(&join.on)?
        ))
    }

    fn placeholder(&self, index: ParameterIndex) -> String {
        placeholder_for_dialect(self.dialect, index)
    }

    /// `projected` expressions are the ones a driver hands back, so geometry becomes text there.
    fn expr(&mut self, expr: &ColumnExpr, projected: bool) -> Result<String, QueryError> {
        match expr {
            ColumnExpr::Column(column) => Ok(column_sql(column)),
            ColumnExpr::Geometry(column) => Ok(match (self.dialect, projected) {
                (SqlDialect::Postgres, true) => format!("ST_AsText({})", column_sql(column)),
                _ => column_sql(column),
            }),
            ColumnExpr::Function { function, column } => {
                date_part_sql(self.dialect, *function, &column_sql(column))
            }
            ColumnExpr::Count(count) => self.count(count),
            ColumnExpr::CaseWhen { cases, then } => {
                let cases = cases
                    .iter()
                    .map(|case| Ok(format!("({})", self.predicate(case)?)))
                    .collect::<Result<Vec<_>, QueryError>>()?;
                Ok(format!(
                    "CASE WHEN {} THEN {} END",
                    cases.join(" OR "),
                    self.expr(then, projected)?
                ))
            }
        }
    }

    fn count(&mut self, count: &CountQuery) -> Result<String, QueryError> {
        let mut conditions = count
            .correlation
            .iter()
            .map(|(field, parent)| {
                format!(
                    "{} = {}",
                    column_sql(&ColumnRef::new(count.from.alias.clone(), field.clone())),
                    column_sql(parent)
                )
            })
            .collect::<Vec<_>>();
        if let Some(filter) = &count.where_clause {
            conditions.push(format!("({})", self.predicate(filter)?));
        }
        let mut sql = format!(
            "(SELECT COUNT(*) FROM {} AS {}",
            quote_ident(&count.from.table),
            quote_ident(&count.from.alias)
        );
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }
        sql.push(')');
        Ok(sql)
    }

    fn predicate(&mut self, node: &SqlWhere) -> Result<String, QueryError> {
        match node {
            SqlWhere::Constant(true) => Ok("1 = 1".to_string()),
            SqlWhere::Constant(false) => Ok("1 = 0".to_string()),
            SqlWhere::Condition(condition) => self.condition(condition),
            SqlWhere::Logical {
                operator,
                negate,
                children,
            } => {
                let separator = match operator {
                    LogicalOperator::And => " AND ",
                    LogicalOperator::Or => " OR ",
                };
                let children = children
                    .iter()
                    .map(|child| Ok(format!("({})", self.predicate(child)?)))
                    .collect::<Result<Vec<_>, QueryError>>()?;
                let joined = children.join(separator);
                Ok(if *negate {
                    format!("NOT ({joined})")
                } else {
                    joined
                })
            }
        }
    }

    fn condition(&mut self, condition: &SqlCondition) -> Result<String, QueryError> {
        let target = self.expr(&condition.target, false)?;
        let rendered = match operator_form(self.dialect, condition.operator) {
            OperatorForm::Binary(symbol) => {
                format!("{target} {symbol} {}", self.single_operand(condition)?)
            }
            OperatorForm::In => {
                let SqlOperand::Parameters(indices) = &condition.compare_to else {
                    return Err(unsupported_error("'in' against a column"));
                };
                let placeholders = indices
                    .iter()
                    .map(|index| self.placeholder(*index))
                    .collect::<Vec<_>>();
                format!("{target} IN ({})", placeholders.join(", "))
            }
            OperatorForm::IsNull => format!("{target} IS NULL"),
            OperatorForm::Pattern {
                keyword,
                syntax,
                anchor,
                lower,
            } => {
                let index = self.pattern_parameter(condition, syntax, anchor)?;
                let placeholder = self.placeholder(index);
                let escape = match syntax {
                    PatternSyntax::Like => " ESCAPE '\\'",
                    PatternSyntax::Glob => "",
                };
                if lower {
                    format!("LOWER({target}) {keyword} LOWER({placeholder}){escape}")
                } else {
                    format!("{target} {keyword} {placeholder}{escape}")
                }
            }
            OperatorForm::Intersects => format!(
                "ST_Intersects({target}, ST_GeomFromText({}))",
                self.single_operand(condition)?
            ),
            OperatorForm::Unsupported => {
                return Err(unsupported_error(format!(
                    "operator '{}' on {:?}",
                    condition.operator.as_str(),
                    self.dialect
                )))
            }
        };
        Ok(if condition.negate {
            format!("NOT ({rendered})")
        } else {
            rendered
        })
    }

    fn single_operand(&self, condition: &SqlCondition) -> Result<String, QueryError> {
        match &condition.compare_to {
            SqlOperand::Parameters(indices) => match indices.as_slice() {
                [index] => Ok(self.placeholder(*index)),
                _ => Err(QueryError::InvalidQuery(format!(
                    "operator '{}' compares against exactly one value",
                    condition.operator.as_str()
                ))),
            },
            SqlOperand::Column { column, cast_text } => Ok(if *cast_text {
                format!("CAST({} AS TEXT)", column_sql(column))
            } else {
                column_sql(column)
            }),
            SqlOperand::Nothing => Err(QueryError::InvalidQuery(format!(
                "operator '{}' needs a value",
                condition.operator.as_str()
            ))),
        }
    }

    /// Rewrites the bound value into the dialect's pattern form; the user text is escaped so it
    /// only ever matches literally.
    fn pattern_parameter(
        &mut self,
        condition: &SqlCondition,
        syntax: PatternSyntax,
        anchor: Anchor,
    ) -> Result<ParameterIndex, QueryError> {
        let SqlOperand::Parameters(indices) = &condition.compare_to else {
            return Err(unsupported_error(format!(
                "operator '{}' against a column",
                condition.operator.as_str()
            )));
        };
        let [index] = indices.as_slice() else {
            return Err(QueryError::InvalidQuery(format!(
                "operator '{}' compares against exactly one value",
                condition.operator.as_str()
            )));
        };
        let slot = self.parameters.get_mut(index.0).ok_or_else(|| {
            QueryError::InvalidQuery(format!("parameter {} is out of range", index.0 + 1))
        })?;
        let text = match slot {
            Value::Text(text) => text.clone(),
            Value::Integer(value) => value.to_string(),
            Value::Real(value) => value.to_string(),
            _ => {
                return Err(QueryError::InvalidQuery(format!(
                    "operator '{}' compares against text",
                    condition.operator.as_str()
                )))
            }
        };
        let (escaped, wildcard) = match syntax {
            PatternSyntax::Like => (escape_like(&text), '%'),
            PatternSyntax::Glob => (escape_glob(&text), '*'),
        };
        *slot = Value::Text(match anchor {
            Anchor::Anywhere => format!("{wildcard}{escaped}{wildcard}"),
            Anchor::Start => format!("{escaped}{wildcard}"),
            Anchor::End => format!("{wildcard}{escaped}"),
        });
        Ok(*index)
    }
}

fn column_sql(column: &ColumnRef) -> String {
    format!("{}.{}", quote_ident(&column.table), quote_ident(&column.column))
}

fn date_part_sql(dialect: SqlDialect, function: Function, column: &str) -> Result<String, QueryError> {
    match dialect {
        SqlDialect::Postgres => {
            let part = match function {
                Function::Year => "YEAR",
                Function::Month => "MONTH",
                Function::Week => "WEEK",
                Function::Day => "DAY",
                Function::Weekday => "DOW",
                Function::Hour => "HOUR",
                Function::Minute => "MINUTE",
                Function::Second => "SECOND",
                Function::Count => return Err(unsupported_error("count() outside a projection")),
            };
            Ok(format!("CAST(EXTRACT({part} FROM {column}) AS INTEGER)"))
        }
        SqlDialect::Sqlite => {
            let format = match function {
                Function::Year => "%Y",
                Function::Month => "%m",
                Function::Week => "%W",
                Function::Day => "%d",
                Function::Weekday => "%w",
                Function::Hour => "%H",
                Function::Minute => "%M",
                Function::Second => "%S",
                Function::Count => return Err(unsupported_error("count() outside a projection")),
            };
            Ok(format!("CAST(strftime('{format}', {column}) AS INTEGER)"))
        }
    }
}

fn escape_like(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

// GLOB has no escape character; metacharacters are matched through one-character classes.
fn escape_glob(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '*' | '?' | '[' => {
                escaped.push('[');
                escaped.push(c);
                escaped.push(']');
            }
            other => escaped.push(other),
        }
    }
    escaped
}
