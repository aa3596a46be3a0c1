use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};

use crate::error::unsupported_error;
use crate::query::ast::Function;
use crate::{QueryError, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Eq,
    Lt,
    Lte,
    Gt,
    Gte,
    In,
    Contains,
    Icontains,
    StartsWith,
    EndsWith,
    Intersects,
    /// `target IS NULL`; the only operator that is true on NULL input.
    Null,
}

impl Operator {
    pub const ALL: [Operator; 12] = [
        Operator::Eq,
        Operator::Lt,
        Operator::Lte,
        Operator::Gt,
        Operator::Gte,
        Operator::In,
        Operator::Contains,
        Operator::Icontains,
        Operator::StartsWith,
        Operator::EndsWith,
        Operator::Intersects,
        Operator::Null,
    ];

    pub fn is_pattern(self) -> bool {
        matches!(
            self,
            Operator::Contains | Operator::Icontains | Operator::StartsWith | Operator::EndsWith
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Operator::Eq => "eq",
            Operator::Lt => "lt",
            Operator::Lte => "lte",
            Operator::Gt => "gt",
            Operator::Gte => "gte",
            Operator::In => "in",
            Operator::Contains => "contains",
            Operator::Icontains => "icontains",
            Operator::StartsWith => "starts_with",
            Operator::EndsWith => "ends_with",
            Operator::Intersects => "intersects",
            Operator::Null => "null",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogicalOperator {
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FilterTarget {
    Field { path: String },
    Function { function: Function, field: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CompareTo {
    Values { values: Vec<Value> },
    Field { path: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionNode {
    pub target: FilterTarget,
    pub operator: Operator,
    #[serde(default)]
    pub negate: bool,
    pub compare_to: CompareTo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogicalNode {
    pub operator: LogicalOperator,
    #[serde(default)]
    pub negate: bool,
    pub children: Vec<FilterNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FilterNode {
    Condition(ConditionNode),
    Logical(LogicalNode),
    /// `false` is the deny-all filter an empty permission set resolves to.
    Constant { value: bool },
}

impl FilterNode {
    pub fn always_false() -> Self {
        FilterNode::Constant { value: false }
    }

    pub fn always_true() -> Self {
        FilterNode::Constant { value: true }
    }

    pub fn is_constant(&self, expected: bool) -> bool {
        matches!(self, FilterNode::Constant { value } if *value == expected)
    }

    pub fn condition(
        path: impl Into<String>,
        operator: Operator,
        values: Vec<Value>,
    ) -> FilterNode {
        FilterNode::Condition(ConditionNode {
            target: FilterTarget::Field { path: path.into() },
            operator,
            negate: false,
            compare_to: CompareTo::Values { values },
        })
    }

    pub fn negated(self) -> FilterNode {
        match self {
            FilterNode::Condition(mut condition) => {
                condition.negate = !condition.negate;
                FilterNode::Condition(condition)
            }
            FilterNode::Logical(mut logical) => {
                logical.negate = !logical.negate;
                FilterNode::Logical(logical)
            }
            FilterNode::Constant { value } => FilterNode::Constant { value: !value },
        }
    }

    /// Conjunction that drops `true` members and collapses to `false` as soon as one is present.
    pub fn and(nodes: impl IntoIterator<Item = FilterNode>) -> FilterNode {
        Self::combine(LogicalOperator::And, nodes)
    }

    /// Disjunction that drops `false` members and collapses to `true` as soon as one is present.
    pub fn or(nodes: impl IntoIterator<Item = FilterNode>) -> FilterNode {
        Self::combine(LogicalOperator::Or, nodes)
    }

    fn combine(operator: LogicalOperator, nodes: impl IntoIterator<Item = FilterNode>) -> FilterNode {
        let absorbing = operator == LogicalOperator::Or;
        let mut children = Vec::new();
        for node in nodes {
            match node {
                FilterNode::Constant { value } if value == absorbing => {
                    return FilterNode::Constant { value: absorbing };
                }
                FilterNode::Constant { .. } => {}
                other => children.push(other),
            }
        }
        match children.len() {
            0 => FilterNode::Constant { value: !absorbing },
            1 => children.remove(0),
            _ => FilterNode::Logical(LogicalNode {
                operator,
                negate: false,
                children,
            }),
        }
    }

    pub fn validate(&self) -> Result<(), QueryError> {
        match self {
            FilterNode::Condition(condition) => {
                if let CompareTo::Values { values } = &condition.compare_to {
                    let expected_many = condition.operator == Operator::In;
                    if !expected_many && condition.operator != Operator::Null && values.len() != 1 {
                        return Err(QueryError::InvalidQuery(format!(
                            "operator '{}' compares against exactly one value",
                            condition.operator.as_str()
                        )));
                    }
                }
                Ok(())
            }
            FilterNode::Logical(logical) => {
                if logical.children.is_empty() {
                    return Err(QueryError::InvalidQuery(
                        "logical filter groups need at least one child".to_string(),
                    ));
                }
                logical.children.iter().try_for_each(FilterNode::validate)
            }
            FilterNode::Constant { .. } => Ok(()),
        }
    }

    pub fn from_json(value: &JsonValue) -> Result<FilterNode, QueryError> {
        Self::from_json_with(value, &FilterVariables::default())
    }

    /// Parses the JSON filter language (`{"title": {"_icontains": "ab"}}`, `_and`, `_or`, nested
    /// relational keys), substituting `$CURRENT_USER`, `$CURRENT_ROLE`, `$CURRENT_ROLES`, `$NOW`.
    pub fn from_json_with(
        value: &JsonValue,
        variables: &FilterVariables,
    ) -> Result<FilterNode, QueryError> {
        let parser = FilterParser { variables };
        parser.parse_group(value, None)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterVariables {
    pub user: Option<String>,
    pub roles: Vec<String>,
    pub now: Option<String>,
}

struct FilterParser<'a> {
    variables: &'a FilterVariables,
}

impl FilterParser<'_> {
    fn parse_group(&self, value: &JsonValue, prefix: Option<&str>) -> Result<FilterNode, QueryError> {
        let object = expect_object(value)?;
        let mut nodes = Vec::with_capacity(object.len());
        for (key, inner) in object {
            nodes.push(match key.as_str() {
                "_and" | "_or" => {
                    let JsonValue::Array(items) = inner else {
                        return Err(invalid_filter(format!("'{key}' expects an array")));
                    };
                    if items.is_empty() {
                        return Err(invalid_filter(format!("'{key}' needs at least one member")));
                    }
                    let children = items
                        .iter()
                        .map(|item| self.parse_group(item, prefix))
                        .collect::<Result<Vec<_>, _>>()?;
                    let operator = if key == "_and" {
                        LogicalOperator::And
                    } else {
                        LogicalOperator::Or
                    };
                    if children.len() == 1 {
                        children.into_iter().next().unwrap_or_else(FilterNode::always_true)
                    } else {
                        FilterNode::Logical(LogicalNode {
                            operator,
                            negate: false,
                            children,
                        })
                    }
                }
                "_some" | "_none" => return Err(unsupported_error(format!("filter operator '{key}'"))),
                field if field.starts_with('_') => {
                    return Err(invalid_filter(format!("unexpected operator '{field}' at group level")))
                }
                field => {
                    let path = match prefix {
                        Some(prefix) => format!("{prefix}.{field}"),
                        None => field.to_string(),
                    };
                    self.parse_field(&path, inner)?
                }
            });
        }
        Ok(FilterNode::and(nodes))
    }

    fn parse_field(&self, path: &str, value: &JsonValue) -> Result<FilterNode, QueryError> {
        let object = expect_object(value)?;
        let is_operator_object = object
            .keys()
            .all(|key| key.starts_with('_') && key != "_and" && key != "_or");
        if !is_operator_object {
            // relational key: `{"author": {"name": {"_eq": ..}}}`
            return self.parse_group(value, Some(path));
        }

        let target = parse_target(path)?;
        let mut conditions = Vec::with_capacity(object.len());
        for (operator, operand) in object {
            conditions.push(self.parse_operator(target.clone(), operator, operand)?);
        }
        Ok(FilterNode::and(conditions))
    }

    fn parse_operator(
        &self,
        target: FilterTarget,
        operator: &str,
        operand: &JsonValue,
    ) -> Result<FilterNode, QueryError> {
        let (operator, negate) = match operator {
            "_eq" => (Operator::Eq, false),
            "_neq" => (Operator::Eq, true),
            "_lt" => (Operator::Lt, false),
            "_lte" => (Operator::Lte, false),
            "_gt" => (Operator::Gt, false),
            "_gte" => (Operator::Gte, false),
            "_in" => (Operator::In, false),
            "_nin" => (Operator::In, true),
            "_contains" => (Operator::Contains, false),
            "_ncontains" => (Operator::Contains, true),
            "_icontains" => (Operator::Icontains, false),
            "_nicontains" => (Operator::Icontains, true),
            "_starts_with" => (Operator::StartsWith, false),
            "_nstarts_with" => (Operator::StartsWith, true),
            "_ends_with" => (Operator::EndsWith, false),
            "_nends_with" => (Operator::EndsWith, true),
            "_intersects" => (Operator::Intersects, false),
            "_nintersects" => (Operator::Intersects, true),
            "_null" => (Operator::Null, !json_truthy(operand)),
            "_nnull" => (Operator::Null, json_truthy(operand)),
            other => return Err(unsupported_error(format!("filter operator '{other}'"))),
        };

        let values = match operator {
            Operator::Null => Vec::new(),
            Operator::In => self.list_values(operand)?,
            _ => vec![self.scalar_value(operand)?],
        };

        if operator == Operator::In && values.is_empty() {
            // `$CURRENT_ROLES` of a public request
            return Ok(FilterNode::Constant { value: negate });
        }

        let node = FilterNode::Condition(ConditionNode {
            target,
            operator,
            negate,
            compare_to: CompareTo::Values { values },
        });
        node.validate()?;
        Ok(node)
    }

    fn list_values(&self, operand: &JsonValue) -> Result<Vec<Value>, QueryError> {
        match operand {
            JsonValue::Array(items) => items.iter().map(|item| self.scalar_value(item)).collect(),
            JsonValue::String(text) if text == "$CURRENT_ROLES" => Ok(self
                .variables
                .roles
                .iter()
                .map(|role| Value::Text(role.clone()))
                .collect()),
            // comma separated list, the query-string form
            JsonValue::String(text) => Ok(text
                .split(',')
                .map(|part| Value::Text(part.trim().to_string()))
                .collect()),
            other => Ok(vec![self.scalar_value(other)?]),
        }
    }

    fn scalar_value(&self, operand: &JsonValue) -> Result<Value, QueryError> {
        match operand {
            JsonValue::String(text) => Ok(match text.as_str() {
                "$CURRENT_USER" => self
                    .variables
                    .user
                    .clone()
                    .map(Value::Text)
                    .unwrap_or(Value::Null),
                "$CURRENT_ROLE" => self
                    .variables
                    .roles
                    .first()
                    .cloned()
                    .map(Value::Text)
                    .unwrap_or(Value::Null),
                "$NOW" => Value::Text(
                    self.variables
                        .now
                        .clone()
                        .unwrap_or_else(|| chrono::Utc::now().to_rfc3339()),
                ),
                _ => Value::Text(text.clone()),
            }),
            JsonValue::Array(_) | JsonValue::Object(_) => Err(invalid_filter(
                "expected a scalar comparison value".to_string(),
            )),
            other => Ok(Value::from_json(other)),
        }
    }
}

fn parse_target(path: &str) -> Result<FilterTarget, QueryError> {
    let last = path.rsplit('.').next().unwrap_or(path);
    match Function::parse_call(last)? {
        Some((function, field)) => {
            if last.len() != path.len() {
                return Err(unsupported_error("function filter targets on related fields"));
            }
            Ok(FilterTarget::Function { function, field })
        }
        None => Ok(FilterTarget::Field {
            path: path.to_string(),
        }),
    }
}

fn expect_object(value: &JsonValue) -> Result<&JsonMap<String, JsonValue>, QueryError> {
    value
        .as_object()
        .ok_or_else(|| invalid_filter("expected a filter object".to_string()))
}

fn json_truthy(value: &JsonValue) -> bool {
    match value {
        JsonValue::Bool(value) => *value,
        JsonValue::String(text) => text != "false" && text != "0",
        JsonValue::Number(number) => number.as_f64().is_some_and(|n| n != 0.0),
        JsonValue::Null => false,
        _ => true,
    }
}

fn invalid_filter(message: String) -> QueryError {
    QueryError::InvalidQuery(format!("invalid filter: {message}"))
}

#[cfg(test)]
mod tests {
    use super::{
        CompareTo, FilterNode, FilterTarget, FilterVariables, LogicalNode, LogicalOperator,
        Operator,
    };
    use crate::error::ErrorCode;
    use crate::query::ast::Function;
    use crate::Value;
    use serde_json::json;

    #[test]
    fn parses_a_single_operator() {
        let filter = FilterNode::from_json(&json!({"title": {"_icontains": "ab"}})).unwrap();
        assert_eq!(
            filter,
            FilterNode::condition("title", Operator::Icontains, vec![Value::from("ab")])
        );
    }

    #[test]
    fn negated_operators_set_the_negation_flag() {
        let filter = FilterNode::from_json(&json!({"status": {"_neq": "draft"}})).unwrap();
        let FilterNode::Condition(condition) = filter else {
            panic!("expected condition");
        };
        assert!(condition.negate);
        assert_eq!(condition.operator, Operator::Eq);
    }

    #[test]
    fn nested_relational_keys_become_dotted_paths() {
        let filter =
            FilterNode::from_json(&json!({"author": {"address": {"city": {"_eq": "Oslo"}}}}))
                .unwrap();
        assert_eq!(
            filter,
            FilterNode::condition("author.address.city", Operator::Eq, vec![Value::from("Oslo")])
        );
    }

    #[test]
    fn logical_groups_keep_member_order() {
        let filter = FilterNode::from_json(&json!({
            "_or": [
                {"a": {"_eq": 1}},
                {"b": {"_in": [1, 2]}}
            ]
        }))
        .unwrap();
        assert_eq!(
            filter,
            FilterNode::Logical(LogicalNode {
                operator: LogicalOperator::Or,
                negate: false,
                children: vec![
                    FilterNode::condition("a", Operator::Eq, vec![Value::Integer(1)]),
                    FilterNode::condition(
                        "b",
                        Operator::In,
                        vec![Value::Integer(1), Value::Integer(2)]
                    ),
                ],
            })
        );
    }

    #[test]
    fn null_operators_map_onto_negation() {
        let FilterNode::Condition(null) =
            FilterNode::from_json(&json!({"a": {"_null": true}})).unwrap()
        else {
            panic!("expected condition");
        };
        let FilterNode::Condition(nnull) =
            FilterNode::from_json(&json!({"a": {"_nnull": true}})).unwrap()
        else {
            panic!("expected condition");
        };
        assert!(!null.negate);
        assert!(nnull.negate);
        assert_eq!(null.compare_to, CompareTo::Values { values: vec![] });
    }

    #[test]
    fn substitutes_dynamic_variables() {
        let variables = FilterVariables {
            user: Some("u-1".to_string()),
            roles: vec!["r-1".to_string(), "r-2".to_string()],
            now: Some("2026-01-01T00:00:00+00:00".to_string()),
        };
        let filter = FilterNode::from_json_with(
            &json!({"owner": {"_eq": "$CURRENT_USER"}, "role": {"_in": "$CURRENT_ROLES"}}),
            &variables,
        )
        .unwrap();
        assert_eq!(
            filter,
            FilterNode::and([
                FilterNode::condition("owner", Operator::Eq, vec![Value::from("u-1")]),
                FilterNode::condition(
                    "role",
                    Operator::In,
                    vec![Value::from("r-1"), Value::from("r-2")]
                ),
            ])
        );
    }

    #[test]
    fn anonymous_current_user_compares_against_null() {
        let filter =
            FilterNode::from_json(&json!({"owner": {"_eq": "$CURRENT_USER"}})).unwrap();
        assert_eq!(
            filter,
            FilterNode::condition("owner", Operator::Eq, vec![Value::Null])
        );
    }

    #[test]
    fn function_keys_become_function_targets() {
        let FilterNode::Condition(condition) =
            FilterNode::from_json(&json!({"year(published)": {"_eq": 2024}})).unwrap()
        else {
            panic!("expected condition");
        };
        assert_eq!(
            condition.target,
            FilterTarget::Function {
                function: Function::Year,
                field: "published".to_string()
            }
        );
    }

    #[test]
    fn empty_object_is_unrestricted() {
        assert_eq!(FilterNode::from_json(&json!({})).unwrap(), FilterNode::always_true());
    }

    #[test]
    fn rejects_unknown_operators_and_relational_quantifiers() {
        let unknown = FilterNode::from_json(&json!({"a": {"_regex": "x"}})).unwrap_err();
        assert_eq!(unknown.code(), ErrorCode::UnsupportedQueryConstruct);
        let some = FilterNode::from_json(&json!({"articles": {"_some": {}}})).unwrap_err();
        assert_eq!(some.code(), ErrorCode::UnsupportedQueryConstruct);
    }

    #[test]
    fn combinators_fold_constants() {
        let condition = FilterNode::condition("a", Operator::Eq, vec![Value::Integer(1)]);
        assert_eq!(
            FilterNode::and([FilterNode::always_true(), condition.clone()]),
            condition
        );
        assert_eq!(
            FilterNode::and([FilterNode::always_false(), condition.clone()]),
            FilterNode::always_false()
        );
        assert_eq!(
            FilterNode::or([FilterNode::always_false(), condition.clone()]),
            condition
        );
        assert_eq!(FilterNode::or(Vec::new()), FilterNode::always_false());
    }

    #[test]
    fn empty_role_lists_fold_to_constants() {
        let variables = FilterVariables::default();
        let in_roles =
            FilterNode::from_json_with(&json!({"status": {"_in": "$CURRENT_ROLES"}}), &variables)
                .unwrap();
        assert_eq!(in_roles, FilterNode::always_false());
        let not_in_roles =
            FilterNode::from_json_with(&json!({"status": {"_nin": []}}), &variables).unwrap();
        assert_eq!(not_in_roles, FilterNode::always_true());
        assert!(FilterNode::condition("status", Operator::In, vec![]).validate().is_ok());
    }

    #[test]
    fn validate_rejects_empty_groups() {
        let empty = FilterNode::Logical(LogicalNode {
            operator: LogicalOperator::And,
            negate: false,
            children: vec![],
        });
        assert!(empty.validate().is_err());
    }
}
