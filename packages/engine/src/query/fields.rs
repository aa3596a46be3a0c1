use crate::error::unknown_field_error;
use crate::query::ast::{
    AnyCandidate, AnyToOneJoin, DirectJoin, FieldNode, ForeignTarget, Function, Modifiers,
    OneToAnyJoin, RelationalJoin, RelationalNode,
};
use crate::schema::{FieldType, RelationLink, SchemaOverview};
use crate::QueryError;

/// Dotted names of every leaf in the tree, depth first with parents before children. The order
/// is the positional column order some dialect drivers rely on.
pub fn get_all_field_names(nodes: &[FieldNode]) -> Vec<String> {
    let mut names = Vec::new();
    collect_field_names(nodes, None, &mut names);
    names
}

fn collect_field_names(nodes: &[FieldNode], prefix: Option<&str>, names: &mut Vec<String>) {
    let qualify = |name: &str| match prefix {
        Some(prefix) => format!("{prefix}.{name}"),
        None => name.to_string(),
    };
    for node in nodes {
        match node {
            FieldNode::Primitive { alias, .. } | FieldNode::Function { alias, .. } => {
                names.push(qualify(alias));
            }
            FieldNode::Relational(relational) => {
                if let RelationalJoin::AnyToOne(join) = &relational.join {
                    for candidate in &join.candidates {
                        let branch = qualify(&format!(
                            "{}:{}",
                            relational.alias, candidate.foreign.collection
                        ));
                        collect_field_names(&candidate.nodes, Some(&branch), names);
                    }
                } else {
                    let nested = qualify(&relational.alias);
                    collect_field_names(&relational.nodes, Some(&nested), names);
                }
            }
        }
    }
}

/// Expands a flat field list (`*`, `title`, `author.name`, `author.*`, `item:pages.title`,
/// `year(published)`, `count(comments)`) into a field tree, first-seen order preserved.
pub fn build_field_nodes(
    schema: &SchemaOverview,
    store: &str,
    collection: &str,
    paths: &[&str],
) -> Result<Vec<FieldNode>, QueryError> {
    let owned = paths.iter().map(|path| path.to_string()).collect::<Vec<_>>();
    FieldTreeBuilder { schema, store }.build(collection, &owned)
}

struct FieldTreeBuilder<'a> {
    schema: &'a SchemaOverview,
    store: &'a str,
}

struct PathGroup {
    head: String,
    rest: Vec<String>,
}

impl FieldTreeBuilder<'_> {
    fn build(&self, collection: &str, paths: &[String]) -> Result<Vec<FieldNode>, QueryError> {
        let meta = self.schema.collection(collection)?;
        let mut groups: Vec<PathGroup> = Vec::new();
        for path in expand_wildcards(meta.fields.iter().map(|f| f.field.as_str()), paths) {
            let (head, rest) = match path.split_once('.') {
                Some((head, rest)) => (head.to_string(), Some(rest.to_string())),
                None => (path.clone(), None),
            };
            let index = groups.iter().position(|group| group.head == head);
            let index = match index {
                Some(index) => index,
                None => {
                    groups.push(PathGroup {
                        head,
                        rest: Vec::new(),
                    });
                    groups.len() - 1
                }
            };
            if let Some(rest) = rest {
                groups[index].rest.push(rest);
            }
        }

        // a2o branches (`item:pages`) of one field fold into a single relational node
        let mut nodes: Vec<FieldNode> = Vec::new();
        for group in groups {
            if let Some((field, target)) = group.head.split_once(':') {
                let candidate = self.any_candidate(collection, field, target, &group.rest)?;
                self.push_any_candidate(collection, field, candidate, &mut nodes)?;
                continue;
            }
            if let Some((function, argument)) = Function::parse_call(&group.head)? {
                self.schema.field(collection, &argument)?;
                nodes.push(FieldNode::function(function, argument));
                continue;
            }
            nodes.push(self.field_node(collection, &group)?);
        }
        Ok(nodes)
    }

    fn field_node(&self, collection: &str, group: &PathGroup) -> Result<FieldNode, QueryError> {
        let field = self.schema.field(collection, &group.head)?;
        let relation = self.schema.relation_for_field(collection, &group.head);

        if group.rest.is_empty() {
            return match relation {
                Some(RelationLink::OneToMany(_)) | Some(RelationLink::OneToAny(_)) => {
                    let primary = self.related_primary(collection, &group.head)?;
                    self.relational(collection, &group.head, &[primary])
                }
                _ if field.field_type == FieldType::Alias => {
                    Err(unknown_field_error(collection, &group.head))
                }
                _ => Ok(FieldNode::primitive(group.head.clone())),
            };
        }

        // `*,author.name`: the related selection wins over the raw key
        let rest = group.rest.iter().map(String::as_str).collect::<Vec<_>>();
        self.relational(collection, &group.head, &rest)
    }

    fn relational(
        &self,
        collection: &str,
        field: &str,
        rest: &[&str],
    ) -> Result<FieldNode, QueryError> {
        let rest = rest.iter().map(|path| path.to_string()).collect::<Vec<_>>();
        let (join, related) = match self.schema.relation_for_field(collection, field) {
            Some(RelationLink::ManyToOne(relation)) => {
                let related = relation.one_collection.clone().unwrap_or_default();
                let join = RelationalJoin::ManyToOne(DirectJoin {
                    local: vec![relation.many_field.clone()],
                    foreign: self.target(&related, self.schema.primary_key(&related)?),
                });
                (join, related)
            }
            Some(RelationLink::OneToMany(relation)) => {
                let join = RelationalJoin::OneToMany(DirectJoin {
                    local: vec![self.schema.primary_key(collection)?.to_string()],
                    foreign: self.target(&relation.many_collection, &relation.many_field),
                });
                (join, relation.many_collection.clone())
            }
            Some(RelationLink::OneToAny(relation)) => {
                let join = RelationalJoin::OneToAny(OneToAnyJoin {
                    local: vec![self.schema.primary_key(collection)?.to_string()],
                    foreign: self.target(&relation.many_collection, &relation.many_field),
                    collection_field: relation.one_collection_field.clone().unwrap_or_default(),
                });
                (join, relation.many_collection.clone())
            }
            Some(RelationLink::AnyToOne(_)) => {
                return Err(QueryError::InvalidQuery(format!(
                    "a2o field '{field}' needs a collection scope, e.g. '{field}:<collection>.<field>'"
                )))
            }
            None => {
                return Err(QueryError::SchemaResolution(format!(
                    "field '{field}' of collection '{collection}' is not relational"
                )))
            }
        };
        Ok(FieldNode::Relational(RelationalNode {
            alias: field.to_string(),
            join,
            nodes: self.build(&related, &rest)?,
            modifiers: Modifiers::default(),
            when_case: Vec::new(),
            cases: Vec::new(),
        }))
    }

    fn any_candidate(
        &self,
        collection: &str,
        field: &str,
        target: &str,
        rest: &[String],
    ) -> Result<AnyCandidate, QueryError> {
        let Some(RelationLink::AnyToOne(relation)) = self.schema.relation_for_field(collection, field)
        else {
            return Err(QueryError::SchemaResolution(format!(
                "field '{field}' of collection '{collection}' is not an a2o relation"
            )));
        };
        if !relation.one_allowed_collections.iter().any(|allowed| allowed == target) {
            return Err(QueryError::SchemaResolution(format!(
                "collection '{target}' is not allowed in a2o field '{field}'"
            )));
        }
        let rest = if rest.is_empty() {
            vec![self.schema.primary_key(target)?.to_string()]
        } else {
            rest.to_vec()
        };
        Ok(AnyCandidate {
            foreign: self.target(target, self.schema.primary_key(target)?),
            nodes: self.build(target, &rest)?,
            filter: None,
            cases: Vec::new(),
        })
    }

    fn push_any_candidate(
        &self,
        collection: &str,
        field: &str,
        candidate: AnyCandidate,
        nodes: &mut Vec<FieldNode>,
    ) -> Result<(), QueryError> {
        for node in nodes.iter_mut() {
            if let FieldNode::Relational(RelationalNode {
                alias,
                join: RelationalJoin::AnyToOne(join),
                ..
            }) = node
            {
                if alias == field {
                    join.candidates.push(candidate);
                    return Ok(());
                }
            }
        }
        let Some(RelationLink::AnyToOne(relation)) = self.schema.relation_for_field(collection, field)
        else {
            return Err(unknown_field_error(collection, field));
        };
        nodes.push(FieldNode::Relational(RelationalNode {
            alias: field.to_string(),
            join: RelationalJoin::AnyToOne(AnyToOneJoin {
                collection_field: relation.one_collection_field.clone().unwrap_or_default(),
                local: vec![relation.many_field.clone()],
                candidates: vec![candidate],
            }),
            nodes: Vec::new(),
            modifiers: Modifiers::default(),
            when_case: Vec::new(),
            cases: Vec::new(),
        }));
        Ok(())
    }

    fn related_primary(&self, collection: &str, field: &str) -> Result<&str, QueryError> {
        let related = match self.schema.relation_for_field(collection, field) {
            Some(RelationLink::OneToMany(relation)) | Some(RelationLink::OneToAny(relation)) => {
                relation.many_collection.as_str()
            }
            _ => return Err(unknown_field_error(collection, field)),
        };
        self.schema.primary_key(related)
    }

    fn target(&self, collection: &str, field: &str) -> ForeignTarget {
        ForeignTarget {
            store: self.store.to_string(),
            collection: collection.to_string(),
            fields: vec![field.to_string()],
        }
    }
}

/// `*` expands to every field of the level it appears on, `author.*` to every field of the
/// related level; explicit entries keep their position.
fn expand_wildcards<'a>(
    fields: impl Iterator<Item = &'a str> + Clone,
    paths: &[String],
) -> Vec<String> {
    let mut expanded = Vec::new();
    for path in paths {
        if path == "*" {
            for field in fields.clone() {
                if !expanded.iter().any(|existing| existing == field) {
                    expanded.push(field.to_string());
                }
            }
        } else if !expanded.contains(path) {
            expanded.push(path.clone());
        }
    }
    expanded
}
