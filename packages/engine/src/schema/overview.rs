use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64;

use crate::error::{unknown_collection_error, unknown_field_error};
use crate::QueryError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FieldType {
    String,
    Text,
    Uuid,
    Hash,
    Csv,
    Integer,
    BigInteger,
    Float,
    Decimal,
    Boolean,
    Date,
    DateTime,
    Time,
    Timestamp,
    Json,
    Binary,
    #[serde(
        alias = "geometry.Point",
        alias = "geometry.LineString",
        alias = "geometry.Polygon",
        alias = "geometry.MultiPoint",
        alias = "geometry.MultiLineString",
        alias = "geometry.MultiPolygon"
    )]
    Geometry,
    /// Virtual field without a backing column (o2m / o2a aliases).
    Alias,
    Unknown,
}

impl FieldType {
    pub fn is_string_like(self) -> bool {
        matches!(
            self,
            FieldType::String | FieldType::Text | FieldType::Uuid | FieldType::Hash | FieldType::Csv
        )
    }

    pub fn is_temporal(self) -> bool {
        matches!(
            self,
            FieldType::Date | FieldType::DateTime | FieldType::Time | FieldType::Timestamp
        )
    }

    pub fn is_geometry(self) -> bool {
        self == FieldType::Geometry
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMeta {
    pub field: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
}

fn default_nullable() -> bool {
    true
}

impl FieldMeta {
    pub fn new(field: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            field: field.into(),
            field_type,
            nullable: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionMeta {
    #[serde(default)]
    pub collection: String,
    pub primary: String,
    /// Declaration order is the order `*` expands to.
    pub fields: Vec<FieldMeta>,
}

impl CollectionMeta {
    pub fn field(&self, name: &str) -> Option<&FieldMeta> {
        self.fields.iter().find(|field| field.field == name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationMeta {
    pub many_collection: String,
    pub many_field: String,
    #[serde(default)]
    pub one_collection: Option<String>,
    /// Alias field on the "one" side listing the related many rows.
    #[serde(default)]
    pub one_field: Option<String>,
    /// Set on polymorphic relations: the many-side column storing the related collection name.
    #[serde(default)]
    pub one_collection_field: Option<String>,
    #[serde(default)]
    pub one_allowed_collections: Vec<String>,
}

/// How a field relates its collection to another one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RelationLink<'a> {
    ManyToOne(&'a RelationMeta),
    OneToMany(&'a RelationMeta),
    AnyToOne(&'a RelationMeta),
    OneToAny(&'a RelationMeta),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaOverview {
    #[serde(default)]
    pub collections: BTreeMap<String, CollectionMeta>,
    #[serde(default)]
    pub relations: Vec<RelationMeta>,
}

impl SchemaOverview {
    pub fn from_json_str(json: &str) -> Result<Self, QueryError> {
        let schema: SchemaOverview = serde_json::from_str(json)
            .map_err(|error| QueryError::Configuration(format!("invalid schema: {error}")))?;
        schema.normalized()
    }

    /// Fills collection names from their map keys and checks relations point at known fields.
    pub fn normalized(mut self) -> Result<Self, QueryError> {
        for (name, collection) in &mut self.collections {
            collection.collection = name.clone();
            if collection.field(&collection.primary).is_none() {
                return Err(QueryError::Configuration(format!(
                    "primary key '{}' of collection '{name}' is not a field",
                    collection.primary
                )));
            }
        }
        for relation in &self.relations {
            self.field(&relation.many_collection, &relation.many_field)
                .map_err(|error| QueryError::Configuration(format!("invalid relation: {error}")))?;
            if let Some(one_collection) = &relation.one_collection {
                self.collection(one_collection).map_err(|error| {
                    QueryError::Configuration(format!("invalid relation: {error}"))
                })?;
            }
        }
        Ok(self)
    }

    pub fn collection(&self, name: &str) -> Result<&CollectionMeta, QueryError> {
        self.collections
            .get(name)
            .ok_or_else(|| unknown_collection_error(name))
    }

    pub fn field(&self, collection: &str, field: &str) -> Result<&FieldMeta, QueryError> {
        self.collection(collection)?
            .field(field)
            .ok_or_else(|| unknown_field_error(collection, field))
    }

    pub fn primary_key(&self, collection: &str) -> Result<&str, QueryError> {
        Ok(self.collection(collection)?.primary.as_str())
    }

    pub fn relation_for_field(&self, collection: &str, field: &str) -> Option<RelationLink<'_>> {
        for relation in &self.relations {
            if relation.many_collection == collection && relation.many_field == field {
                return Some(if relation.one_collection_field.is_some() {
                    RelationLink::AnyToOne(relation)
                } else {
                    RelationLink::ManyToOne(relation)
                });
            }
        }
        for relation in &self.relations {
            if relation.one_field.as_deref() != Some(field) {
                continue;
            }
            if relation.one_collection_field.is_some() {
                if relation
                    .one_allowed_collections
                    .iter()
                    .any(|allowed| allowed == collection)
                {
                    return Some(RelationLink::OneToAny(relation));
                }
            } else if relation.one_collection.as_deref() == Some(collection) {
                return Some(RelationLink::OneToMany(relation));
            }
        }
        None
    }

    /// Stable hash of the snapshot; permission cache keys carry it so a schema change never
    /// observes entries computed against an older snapshot.
    pub fn fingerprint(&self) -> u64 {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        xxh3_64(&bytes)
    }
}
