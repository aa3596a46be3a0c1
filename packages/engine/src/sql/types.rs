use std::collections::BTreeMap;

use crate::query::{Function, LogicalOperator, Operator, SortDirection};
use crate::Value;

/// Zero-based position in [`AbstractSqlQuery::parameters`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParameterIndex(pub usize);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub table: String,
    pub alias: String,
}

/// A column of a table alias in scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnRef {
    pub table: String,
    pub column: String,
}

impl ColumnRef {
    pub fn new(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            column: column.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ColumnExpr {
    Column(ColumnRef),
    /// Rendered as text so every driver can return it.
    Geometry(ColumnRef),
    Function {
        function: Function,
        column: ColumnRef,
    },
    Count(Box<CountQuery>),
    /// `CASE WHEN <any case> THEN <then> END`. The select column owns the alias, `then` never
    /// carries one.
    CaseWhen {
        cases: Vec<SqlWhere>,
        then: Box<ColumnExpr>,
    },
}

/// Correlated `SELECT COUNT(*)` over the many side of an o2m relation.
#[derive(Debug, Clone, PartialEq)]
pub struct CountQuery {
    pub from: TableRef,
    /// Child column paired with the parent column it must equal.
    pub correlation: Vec<(String, ColumnRef)>,
    pub where_clause: Option<SqlWhere>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectColumn {
    pub expr: ColumnExpr,
    pub alias: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SqlWhere {
    Condition(SqlCondition),
    Logical {
        operator: LogicalOperator,
        negate: bool,
        children: Vec<SqlWhere>,
    },
    Constant(bool),
}

impl SqlWhere {
    /// `self AND other`, without nesting a group inside another AND group.
    pub fn and(self, other: SqlWhere) -> SqlWhere {
        match self {
            SqlWhere::Constant(true) => other,
            SqlWhere::Logical {
                operator: LogicalOperator::And,
                negate: false,
                mut children,
            } => {
                children.push(other);
                SqlWhere::Logical {
                    operator: LogicalOperator::And,
                    negate: false,
                    children,
                }
            }
            current => SqlWhere::Logical {
                operator: LogicalOperator::And,
                negate: false,
                children: vec![current, other],
            },
        }
    }

    /// Single condition for one pair, an AND group for composite keys.
    pub fn all(mut conditions: Vec<SqlWhere>) -> SqlWhere {
        match conditions.len() {
            0 => SqlWhere::Constant(true),
            1 => conditions.remove(0),
            _ => SqlWhere::Logical {
                operator: LogicalOperator::And,
                negate: false,
                children: conditions,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SqlCondition {
    pub target: ColumnExpr,
    pub operator: Operator,
    pub negate: bool,
    pub compare_to: SqlOperand,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SqlOperand {
    /// `null` compares against nothing.
    Nothing,
    Parameters(Vec<ParameterIndex>),
    Column { column: ColumnRef, cast_text: bool },
}

/// Always rendered as a LEFT JOIN.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlJoin {
    pub table: TableRef,
    pub on: SqlWhere,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SqlOrder {
    pub expr: ColumnExpr,
    pub direction: SortDirection,
}

/// An m2o object (or a2o branch) that is `null` when all of its key columns are.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NullableObject {
    pub path: String,
    pub key_aliases: Vec<String>,
}

/// The `field:collection` branches of one a2o field; the discriminator column picks one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnyToOneBranches {
    pub path: String,
    pub discriminator: String,
    pub candidates: Vec<String>,
}

/// A to-many relation resolved by a second query once the parent keys are known.
#[derive(Debug, Clone, PartialEq)]
pub struct NestedMany {
    /// Dotted location of the child array inside each parent object.
    pub path: String,
    pub collection: String,
    /// Hidden parent columns holding the identifier the children point at.
    pub local_aliases: Vec<String>,
    /// Child columns paired with `local_aliases`.
    pub foreign_fields: Vec<String>,
    /// Index of the parent select column the child array is placed before.
    pub position: usize,
    /// Polymorphic children store parent keys as text.
    pub keys_as_text: bool,
    /// Local keys are selected under `CASE WHEN`; a NULL key means the relation is concealed
    /// on that parent, not that it has no children.
    pub guarded: bool,
    pub template: AbstractSqlQuery,
}

impl NestedMany {
    /// Child query for one parent key, `keys` paired with `foreign_fields`.
    pub fn generate(&self, keys: &[Value]) -> AbstractSqlQuery {
        let mut query = self.template.clone();
        let table = query.from.alias.clone();
        let mut conditions = Vec::with_capacity(self.foreign_fields.len());
        for (field, key) in self.foreign_fields.iter().zip(keys) {
            let key = match key {
                Value::Integer(value) if self.keys_as_text => Value::Text(value.to_string()),
                other => other.clone(),
            };
            let index = query.push_parameter(key);
            conditions.push(SqlWhere::Condition(SqlCondition {
                target: ColumnExpr::Column(ColumnRef::new(table.clone(), field.clone())),
                operator: Operator::Eq,
                negate: false,
                compare_to: SqlOperand::Parameters(vec![index]),
            }));
        }
        let correlation = SqlWhere::all(conditions);
        query.where_clause = Some(match query.where_clause.take() {
            Some(existing) => existing.and(correlation),
            None => correlation,
        });
        query
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AbstractSqlQuery {
    pub select: Vec<SelectColumn>,
    pub from: TableRef,
    pub joins: Vec<SqlJoin>,
    pub where_clause: Option<SqlWhere>,
    pub order: Vec<SqlOrder>,
    pub limit: Option<ParameterIndex>,
    pub offset: Option<ParameterIndex>,
    pub parameters: Vec<Value>,
    /// Select alias to the field or call it was generated for, hidden columns included.
    pub aliases: BTreeMap<String, String>,
    /// Select alias to its dotted location in the result object. Hidden columns have none.
    pub paths: BTreeMap<String, String>,
    pub nested_manys: Vec<NestedMany>,
    pub any_to_ones: Vec<AnyToOneBranches>,
    pub nullable_objects: Vec<NullableObject>,
}

impl AbstractSqlQuery {
    pub fn new(from: TableRef) -> Self {
        Self {
            select: Vec::new(),
            from,
            joins: Vec::new(),
            where_clause: None,
            order: Vec::new(),
            limit: None,
            offset: None,
            parameters: Vec::new(),
            aliases: BTreeMap::new(),
            paths: BTreeMap::new(),
            nested_manys: Vec::new(),
            any_to_ones: Vec::new(),
            nullable_objects: Vec::new(),
        }
    }

    pub fn push_parameter(&mut self, value: Value) -> ParameterIndex {
        self.parameters.push(value);
        ParameterIndex(self.parameters.len() - 1)
    }

    pub fn column_position(&self, alias: &str) -> Option<usize> {
        self.select.iter().position(|column| column.alias == alias)
    }
}

#[cfg(test)]
mod tests {
    use super::{AbstractSqlQuery, NestedMany, SqlOperand, SqlWhere, TableRef};
    use crate::query::LogicalOperator;
    use crate::Value;

    fn nested(foreign_fields: &[&str]) -> NestedMany {
        NestedMany {
            path: "comments".to_string(),
            collection: "comments".to_string(),
            local_aliases: vec!["id_1".to_string()],
            foreign_fields: foreign_fields.iter().map(|f| f.to_string()).collect(),
            position: 0,
            keys_as_text: false,
            guarded: false,
            template: AbstractSqlQuery::new(TableRef {
                table: "comments".to_string(),
                alias: "comments_2".to_string(),
            }),
        }
    }

    #[test]
    fn single_key_generates_a_single_condition() {
        let query = nested(&["article"]).generate(&[Value::Integer(7)]);
        assert_eq!(query.parameters, vec![Value::Integer(7)]);
        let Some(SqlWhere::Condition(condition)) = query.where_clause else {
            panic!("expected a single condition");
        };
        assert_eq!(condition.target, super::ColumnExpr::Column(super::ColumnRef::new("comments_2", "article")));
        assert!(matches!(condition.compare_to, SqlOperand::Parameters(ref indices) if indices.len() == 1));
    }

    #[test]
    fn composite_keys_generate_an_and_group() {
        let query = nested(&["a", "b"]).generate(&[Value::Integer(1), Value::Integer(2)]);
        let Some(SqlWhere::Logical {
            operator,
            children,
            ..
        }) = query.where_clause
        else {
            panic!("expected a logical group");
        };
        assert_eq!(operator, LogicalOperator::And);
        assert_eq!(children.len(), 2);
    }

    #[test]
    fn generation_leaves_the_template_untouched() {
        let descriptor = nested(&["article"]);
        let first = descriptor.generate(&[Value::Integer(1)]);
        let second = descriptor.generate(&[Value::Integer(2)]);
        assert_eq!(first.parameters, vec![Value::Integer(1)]);
        assert_eq!(second.parameters, vec![Value::Integer(2)]);
        assert!(descriptor.template.parameters.is_empty());
    }

    #[test]
    fn polymorphic_keys_are_compared_as_text() {
        let mut descriptor = nested(&["item"]);
        descriptor.keys_as_text = true;
        let query = descriptor.generate(&[Value::Integer(4)]);
        assert_eq!(query.parameters, vec![Value::Text("4".to_string())]);
    }
}
