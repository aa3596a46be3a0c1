use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::unsupported_error;
use crate::query::filter::FilterNode;
use crate::QueryError;

/// A store-agnostic read request against one collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbstractQuery {
    pub store: String,
    pub collection: String,
    pub fields: Vec<FieldNode>,
    #[serde(default)]
    pub modifiers: Modifiers,
    /// Row conditions referenced by `when_case` indices of this level's fields.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cases: Vec<FilterNode>,
    /// Row filters of collections a filter or sort path joins through, keyed by collection.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub related_filters: BTreeMap<String, FilterNode>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Modifiers {
    #[serde(default)]
    pub filter: Option<FilterNode>,
    #[serde(default)]
    pub sort: Vec<SortNode>,
    #[serde(default)]
    pub limit: Option<u64>,
    #[serde(default)]
    pub offset: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortNode {
    pub field: String,
    #[serde(default)]
    pub direction: SortDirection,
}

impl SortNode {
    /// `-title` sorts descending, `title` ascending.
    pub fn parse(value: &str) -> SortNode {
        match value.strip_prefix('-') {
            Some(field) => SortNode {
                field: field.to_string(),
                direction: SortDirection::Descending,
            },
            None => SortNode {
                field: value.to_string(),
                direction: SortDirection::Ascending,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldNode {
    Primitive {
        field: String,
        alias: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        when_case: Vec<usize>,
    },
    Function {
        function: Function,
        field: String,
        alias: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        when_case: Vec<usize>,
        /// Row filter on the related rows counted by `count`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filter: Option<FilterNode>,
    },
    Relational(RelationalNode),
}

impl FieldNode {
    pub fn primitive(field: impl Into<String>) -> FieldNode {
        let field = field.into();
        FieldNode::Primitive {
            alias: field.clone(),
            field,
            when_case: Vec::new(),
        }
    }

    pub fn function(function: Function, field: impl Into<String>) -> FieldNode {
        let field = field.into();
        FieldNode::Function {
            alias: function.call_name(&field),
            function,
            field,
            when_case: Vec::new(),
            filter: None,
        }
    }

    pub fn alias(&self) -> &str {
        match self {
            FieldNode::Primitive { alias, .. } | FieldNode::Function { alias, .. } => alias,
            FieldNode::Relational(node) => &node.alias,
        }
    }

    pub fn when_case(&self) -> &[usize] {
        match self {
            FieldNode::Primitive { when_case, .. } | FieldNode::Function { when_case, .. } => {
                when_case
            }
            FieldNode::Relational(node) => &node.when_case,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationalNode {
    pub alias: String,
    pub join: RelationalJoin,
    /// Fields of the related collection; a2o nodes keep theirs per candidate instead.
    #[serde(default)]
    pub nodes: Vec<FieldNode>,
    #[serde(default)]
    pub modifiers: Modifiers,
    /// Cases of the parent level the relation is only visible under.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub when_case: Vec<usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cases: Vec<FilterNode>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationKind {
    M2o,
    O2m,
    A2o,
    O2a,
}

impl RelationKind {
    /// o2m and o2a expand one parent into many rows and are resolved as nested-many sub-queries.
    pub fn is_many(self) -> bool {
        matches!(self, RelationKind::O2m | RelationKind::O2a)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum RelationalJoin {
    #[serde(rename = "m2o")]
    ManyToOne(DirectJoin),
    #[serde(rename = "o2m")]
    OneToMany(DirectJoin),
    #[serde(rename = "a2o")]
    AnyToOne(AnyToOneJoin),
    #[serde(rename = "o2a")]
    OneToAny(OneToAnyJoin),
}

impl RelationalJoin {
    pub fn kind(&self) -> RelationKind {
        match self {
            RelationalJoin::ManyToOne(_) => RelationKind::M2o,
            RelationalJoin::OneToMany(_) => RelationKind::O2m,
            RelationalJoin::AnyToOne(_) => RelationKind::A2o,
            RelationalJoin::OneToAny(_) => RelationKind::O2a,
        }
    }

    pub fn local_fields(&self) -> &[String] {
        match self {
            RelationalJoin::ManyToOne(join) | RelationalJoin::OneToMany(join) => &join.local,
            RelationalJoin::AnyToOne(join) => &join.local,
            RelationalJoin::OneToAny(join) => &join.local,
        }
    }

    /// Every key list must be non-empty and local/foreign lists must pair up.
    pub fn validate(&self, alias: &str) -> Result<(), QueryError> {
        let mut sides: Vec<(&[String], &[String])> = Vec::new();
        match self {
            RelationalJoin::ManyToOne(join) | RelationalJoin::OneToMany(join) => {
                sides.push((&join.local, &join.foreign.fields));
            }
            RelationalJoin::AnyToOne(join) => {
                if join.candidates.is_empty() {
                    return Err(QueryError::InvalidQuery(format!(
                        "a2o relation '{alias}' has no candidate collections"
                    )));
                }
                for candidate in &join.candidates {
                    sides.push((&join.local, &candidate.foreign.fields));
                }
            }
            RelationalJoin::OneToAny(join) => sides.push((&join.local, &join.foreign.fields)),
        }
        for (local, foreign) in sides {
            if local.is_empty() || foreign.is_empty() {
                return Err(QueryError::InvalidQuery(format!(
                    "relation '{alias}' needs at least one local and one foreign key field"
                )));
            }
            if local.len() != foreign.len() {
                return Err(QueryError::InvalidQuery(format!(
                    "relation '{alias}' pairs {} local with {} foreign key fields",
                    local.len(),
                    foreign.len()
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignTarget {
    pub store: String,
    pub collection: String,
    pub fields: Vec<String>,
}

/// m2o: `local` holds the foreign key, `foreign.fields` the related identifier.
/// o2m: `local` holds this collection's identifier, `foreign.fields` the related foreign key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectJoin {
    pub local: Vec<String>,
    pub foreign: ForeignTarget,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnyToOneJoin {
    /// Local column naming the related collection of each row.
    pub collection_field: String,
    pub local: Vec<String>,
    pub candidates: Vec<AnyCandidate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnyCandidate {
    pub foreign: ForeignTarget,
    pub nodes: Vec<FieldNode>,
    /// Rows of this candidate failing the filter resolve to `null`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<FilterNode>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cases: Vec<FilterNode>,
}

/// The reverse of an a2o: rows of `foreign.collection` whose `collection_field` names this
/// collection and whose `foreign.fields` hold this row's `local` identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneToAnyJoin {
    pub local: Vec<String>,
    pub foreign: ForeignTarget,
    pub collection_field: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Function {
    Year,
    Month,
    Week,
    Day,
    Weekday,
    Hour,
    Minute,
    Second,
    /// Number of related rows of an o2m field.
    Count,
}

impl Function {
    pub fn as_str(self) -> &'static str {
        match self {
            Function::Year => "year",
            Function::Month => "month",
            Function::Week => "week",
            Function::Day => "day",
            Function::Weekday => "weekday",
            Function::Hour => "hour",
            Function::Minute => "minute",
            Function::Second => "second",
            Function::Count => "count",
        }
    }

    pub fn parse(name: &str) -> Option<Function> {
        Some(match name {
            "year" => Function::Year,
            "month" => Function::Month,
            "week" => Function::Week,
            "day" => Function::Day,
            "weekday" => Function::Weekday,
            "hour" => Function::Hour,
            "minute" => Function::Minute,
            "second" => Function::Second,
            "count" => Function::Count,
            _ => return None,
        })
    }

    /// Date-part extraction, as opposed to the `count` aggregate.
    pub fn is_date_part(self) -> bool {
        self != Function::Count
    }

    /// Parts that only exist on values carrying a time of day.
    pub fn needs_time(self) -> bool {
        matches!(self, Function::Hour | Function::Minute | Function::Second)
    }

    /// Parts that only exist on values carrying a calendar date.
    pub fn needs_date(self) -> bool {
        matches!(
            self,
            Function::Year | Function::Month | Function::Week | Function::Day | Function::Weekday
        )
    }

    pub fn call_name(self, field: &str) -> String {
        format!("{}({field})", self.as_str())
    }

    /// Splits `year(published)` into its function and argument; plain names yield `None`.
    pub fn parse_call(segment: &str) -> Result<Option<(Function, String)>, QueryError> {
        let Some(open) = segment.find('(') else {
            return Ok(None);
        };
        let Some(argument) = segment[open + 1..].strip_suffix(')') else {
            return Err(QueryError::InvalidQuery(format!(
                "malformed function call '{segment}'"
            )));
        };
        let name = &segment[..open];
        let function =
            Function::parse(name).ok_or_else(|| unsupported_error(format!("function '{name}'")))?;
        if argument.is_empty() || argument.contains(['(', ')', '.']) {
            return Err(QueryError::InvalidQuery(format!(
                "malformed function call '{segment}'"
            )));
        }
        Ok(Some((function, argument.to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::{
        AbstractQuery, DirectJoin, FieldNode, ForeignTarget, Function, RelationKind,
        RelationalJoin, SortDirection, SortNode,
    };
    use crate::error::ErrorCode;
    use serde_json::json;

    #[test]
    fn parses_function_calls() {
        assert_eq!(
            Function::parse_call("year(published)").unwrap(),
            Some((Function::Year, "published".to_string()))
        );
        assert_eq!(Function::parse_call("title").unwrap(), None);
        assert_eq!(
            Function::parse_call("median(x)").unwrap_err().code(),
            ErrorCode::UnsupportedQueryConstruct
        );
        assert_eq!(
            Function::parse_call("year(x").unwrap_err().code(),
            ErrorCode::InvalidQuery
        );
    }

    #[test]
    fn sort_prefix_selects_direction() {
        assert_eq!(SortNode::parse("-title").direction, SortDirection::Descending);
        assert_eq!(SortNode::parse("title").direction, SortDirection::Ascending);
    }

    #[test]
    fn join_validation_requires_non_empty_key_lists() {
        let join = RelationalJoin::ManyToOne(DirectJoin {
            local: vec![],
            foreign: ForeignTarget {
                store: "main".to_string(),
                collection: "authors".to_string(),
                fields: vec!["id".to_string()],
            },
        });
        assert_eq!(join.kind(), RelationKind::M2o);
        assert_eq!(
            join.validate("author").unwrap_err().code(),
            ErrorCode::InvalidQuery
        );
    }

    #[test]
    fn deserializes_tagged_nodes() {
        let query: AbstractQuery = serde_json::from_value(json!({
            "store": "main",
            "collection": "articles",
            "fields": [
                {"type": "primitive", "field": "id", "alias": "id"},
                {"type": "relational", "alias": "author", "join": {
                    "kind": "m2o",
                    "local": ["author"],
                    "foreign": {"store": "main", "collection": "authors", "fields": ["id"]}
                }, "nodes": [{"type": "primitive", "field": "name", "alias": "name"}]}
            ]
        }))
        .unwrap();
        assert_eq!(query.fields[0], FieldNode::primitive("id"));
        let FieldNode::Relational(author) = &query.fields[1] else {
            panic!("expected relational node");
        };
        assert_eq!(author.join.kind(), RelationKind::M2o);
        assert!(query.modifiers.filter.is_none());
    }
}
