use quarry_engine::query::{build_field_nodes, AbstractQuery, FilterNode, Modifiers, SortNode};
use quarry_engine::{QueryError, SchemaOverview};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// A read request in the shape clients send it: dotted field paths, a JSON filter and `-field`
/// sort keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub collection: String,
    /// Empty selects `*`.
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(default)]
    pub filter: Option<JsonValue>,
    #[serde(default)]
    pub sort: Vec<String>,
    #[serde(default)]
    pub limit: Option<u64>,
    #[serde(default)]
    pub offset: Option<u64>,
}

impl QueryRequest {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            ..Self::default()
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, QueryError> {
        serde_json::from_str(json)
            .map_err(|err| QueryError::InvalidQuery(format!("invalid query request: {err}")))
    }

    pub fn to_abstract_query(
        &self,
        schema: &SchemaOverview,
        store: &str,
    ) -> Result<AbstractQuery, QueryError> {
        let fields = if self.fields.is_empty() {
            vec!["*"]
        } else {
            self.fields.iter().map(String::as_str).collect()
        };
        let filter = self.filter.as_ref().map(FilterNode::from_json).transpose()?;
        if let Some(filter) = &filter {
            filter.validate()?;
        }

        Ok(AbstractQuery {
            store: store.to_string(),
            collection: self.collection.clone(),
            fields: build_field_nodes(schema, store, &self.collection, &fields)?,
            modifiers: Modifiers {
                filter,
                sort: self.sort.iter().map(|key| SortNode::parse(key)).collect(),
                limit: self.limit,
                offset: self.offset,
            },
            cases: Vec::new(),
            related_filters: Default::default(),
        })
    }
}
