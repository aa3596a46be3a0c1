use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::context::RequestContext;
use crate::error::{forbidden_collection_error, forbidden_field_error, unsupported_error};
use crate::permissions::evaluator::{PermissionEvaluator, ResolvedPermissions};
use crate::permissions::policy::Action;
use crate::query::{
    check_function, resolve_field_path, AbstractQuery, CompareTo, FieldNode, FilterNode,
    FilterTarget, Function, LogicalNode, RelationalJoin, SortNode,
};
use crate::{QueryError, SchemaOverview};

type Resolved = BTreeMap<String, Arc<ResolvedPermissions>>;

/// Returns a copy of `query` restricted to what the request may read: forbidden fields are
/// rejected, row filters are ANDed into every level and partially granted fields get cases.
///
/// Filter and sort paths are held to the same field permissions as selected fields. A path
/// through a concealed field only matches where that field is visible.
pub async fn apply_permissions(
    ctx: &RequestContext,
    evaluator: &PermissionEvaluator,
    query: &AbstractQuery,
) -> Result<AbstractQuery, QueryError> {
    if ctx.accountability.admin {
        return Ok(query.clone());
    }

    let mut collections = BTreeSet::new();
    collections.insert(query.collection.clone());
    collect_collections(
        &ctx.schema,
        &query.collection,
        &query.fields,
        query.modifiers.filter.as_ref(),
        &query.modifiers.sort,
        &mut collections,
    )?;

    let mut resolved = Resolved::new();
    for collection in collections {
        let permissions = evaluator
            .resolve_permissions(ctx, &collection, Action::Read)
            .await?;
        resolved.insert(collection, permissions);
    }

    let mut restricted = query.clone();
    let mut applier = Applier {
        ctx,
        resolved: &resolved,
        related_filters: BTreeMap::new(),
    };
    applier.apply_level(
        &query.collection,
        &mut restricted.fields,
        &mut restricted.modifiers.filter,
        &query.modifiers.sort,
        &mut restricted.cases,
    )?;
    restricted.related_filters = applier.related_filters;
    Ok(restricted)
}

/// Every collection the query reads from, joined-through collections of paths included.
fn collect_collections(
    schema: &SchemaOverview,
    collection: &str,
    nodes: &[FieldNode],
    filter: Option<&FilterNode>,
    sort: &[SortNode],
    collections: &mut BTreeSet<String>,
) -> Result<(), QueryError> {
    let mut paths = Vec::new();
    if let Some(filter) = filter {
        filter_paths(filter, &mut paths);
    }
    for order in sort {
        paths.push(sort_path(order)?);
    }
    for path in &paths {
        let resolved = resolve_field_path(schema, collection, path)?;
        collections.extend(resolved.steps.into_iter().map(|step| step.to));
    }

    for node in nodes {
        match node {
            FieldNode::Primitive { .. } => {}
            FieldNode::Function {
                function: Function::Count,
                field,
                filter,
                ..
            } => {
                if let Some(relation) = check_function(schema, collection, field, Function::Count)? {
                    let related = &relation.many_collection;
                    collections.insert(related.clone());
                    collect_collections(schema, related, &[], filter.as_ref(), &[], collections)?;
                }
            }
            FieldNode::Function { .. } => {}
            FieldNode::Relational(relational) => match &relational.join {
                RelationalJoin::AnyToOne(join) => {
                    for candidate in &join.candidates {
                        let related = &candidate.foreign.collection;
                        collections.insert(related.clone());
                        collect_collections(
                            schema,
                            related,
                            &candidate.nodes,
                            candidate.filter.as_ref(),
                            &[],
                            collections,
                        )?;
                    }
                }
                RelationalJoin::ManyToOne(join) | RelationalJoin::OneToMany(join) => {
                    let related = &join.foreign.collection;
                    collections.insert(related.clone());
                    collect_collections(
                        schema,
                        related,
                        &relational.nodes,
                        relational.modifiers.filter.as_ref(),
                        &relational.modifiers.sort,
                        collections,
                    )?;
                }
                RelationalJoin::OneToAny(join) => {
                    let related = &join.foreign.collection;
                    collections.insert(related.clone());
                    collect_collections(
                        schema,
                        related,
                        &relational.nodes,
                        relational.modifiers.filter.as_ref(),
                        &relational.modifiers.sort,
                        collections,
                    )?;
                }
            },
        }
    }
    Ok(())
}

struct Applier<'a> {
    ctx: &'a RequestContext,
    resolved: &'a Resolved,
    related_filters: BTreeMap<String, FilterNode>,
}

impl<'a> Applier<'a> {
    fn permissions(&self, collection: &str) -> Result<&'a ResolvedPermissions, QueryError> {
        let resolved: &'a Resolved = self.resolved;
        resolved
            .get(collection)
            .map(Arc::as_ref)
            .ok_or_else(|| forbidden_collection_error(collection, Action::Read.as_str()))
    }

    fn apply_level(
        &mut self,
        collection: &str,
        nodes: &mut [FieldNode],
        filter: &mut Option<FilterNode>,
        sort: &[SortNode],
        cases: &mut Vec<FilterNode>,
    ) -> Result<(), QueryError> {
        let permissions = self.permissions(collection)?;
        if permissions.admin {
            return Ok(());
        }
        if permissions.is_deny_all() {
            if self.ctx.require_access {
                return Err(forbidden_collection_error(collection, Action::Read.as_str()));
            }
            // nothing is readable, so nothing below needs checking
            *filter = Some(FilterNode::always_false());
            return Ok(());
        }

        if let Some(requested) = filter.take() {
            *filter = Some(self.secure_filter(collection, requested)?);
        }
        for order in sort {
            let path = sort_path(order)?;
            if !self.check_path(collection, &path)?.is_empty() {
                return Err(QueryError::PermissionDenied(format!(
                    "sorting '{collection}' by '{path}', which is only readable on some rows"
                )));
            }
        }

        let base = cases.len();
        // index of the always-false case, pushed after the permission cases
        let never = base + permissions.cases.len();
        let mut uses_cases = false;
        let mut uses_never = false;
        for node in nodes.iter_mut() {
            let fields = guarded_fields(node);
            for field in &fields {
                if !permissions.allows_field(field) {
                    return Err(forbidden_field_error(collection, field));
                }
            }
            let indices = match permissions.shared_cases(&fields) {
                Some(indices) => indices.into_iter().map(|index| base + index).collect(),
                None => {
                    uses_never = true;
                    vec![never]
                }
            };
            uses_cases |= !indices.is_empty();

            match node {
                FieldNode::Primitive { when_case, .. } => when_case.extend(indices),
                FieldNode::Function {
                    function,
                    field,
                    when_case,
                    filter: count_filter,
                    ..
                } => {
                    when_case.extend(indices);
                    if *function == Function::Count {
                        let counted =
                            check_function(&self.ctx.schema, collection, field, Function::Count)?
                                .map(|relation| relation.many_collection.clone());
                        if let Some(counted) = counted {
                            if let Some(requested) = count_filter.take() {
                                *count_filter = Some(self.secure_filter(&counted, requested)?);
                            }
                            restrict(count_filter, self.permissions(&counted)?);
                        }
                    }
                }
                FieldNode::Relational(relational) => {
                    relational.when_case.extend(indices);
                    match &mut relational.join {
                        RelationalJoin::AnyToOne(join) => {
                            for candidate in &mut join.candidates {
                                self.apply_level(
                                    &candidate.foreign.collection,
                                    &mut candidate.nodes,
                                    &mut candidate.filter,
                                    &[],
                                    &mut candidate.cases,
                                )?;
                            }
                        }
                        RelationalJoin::ManyToOne(join) | RelationalJoin::OneToMany(join) => {
                            let related = join.foreign.collection.clone();
                            self.apply_level(
                                &related,
                                &mut relational.nodes,
                                &mut relational.modifiers.filter,
                                &relational.modifiers.sort,
                                &mut relational.cases,
                            )?;
                        }
                        RelationalJoin::OneToAny(join) => {
                            let related = join.foreign.collection.clone();
                            self.apply_level(
                                &related,
                                &mut relational.nodes,
                                &mut relational.modifiers.filter,
                                &relational.modifiers.sort,
                                &mut relational.cases,
                            )?;
                        }
                    }
                }
            }
        }

        if uses_cases {
            cases.extend(permissions.cases.iter().cloned());
        }
        if uses_never {
            cases.push(FilterNode::always_false());
        }
        restrict(filter, permissions);
        Ok(())
    }

    /// Checks every field `filter` reads and ANDs each condition with the cases its fields are
    /// visible under.
    fn secure_filter(
        &mut self,
        collection: &str,
        filter: FilterNode,
    ) -> Result<FilterNode, QueryError> {
        match filter {
            FilterNode::Constant { .. } => Ok(filter),
            FilterNode::Logical(logical) => {
                let children = logical
                    .children
                    .into_iter()
                    .map(|child| self.secure_filter(collection, child))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(FilterNode::Logical(LogicalNode {
                    operator: logical.operator,
                    negate: logical.negate,
                    children,
                }))
            }
            FilterNode::Condition(condition) => {
                let mut guards = match &condition.target {
                    FilterTarget::Field { path } => self.check_path(collection, path)?,
                    FilterTarget::Function { field, .. } => self.check_path(collection, field)?,
                };
                if let CompareTo::Field { path } = &condition.compare_to {
                    guards.extend(self.check_path(collection, path)?);
                }
                let condition = FilterNode::Condition(condition);
                if guards.is_empty() {
                    return Ok(condition);
                }
                Ok(FilterNode::and(std::iter::once(condition).chain(guards)))
            }
        }
    }

    /// Checks each field a dotted path reads, records the row filters of the collections it
    /// joins through, and returns the conditions (relative to `collection`) under which every
    /// field on the path is visible.
    fn check_path(
        &mut self,
        collection: &str,
        path: &str,
    ) -> Result<Vec<FilterNode>, QueryError> {
        let resolved = resolve_field_path(&self.ctx.schema, collection, path)?;
        let mut guards = Vec::new();
        let mut prefix: Option<String> = None;
        for step in &resolved.steps {
            self.guard_read(&step.from, &step.field, prefix.as_deref(), &mut guards)?;
            if let Some(row_filter) = &self.permissions(&step.to)?.filter {
                self.related_filters
                    .entry(step.to.clone())
                    .or_insert_with(|| row_filter.clone());
            }
            prefix = Some(match prefix {
                Some(prefix) => format!("{prefix}.{}", step.field),
                None => step.field.clone(),
            });
        }
        self.guard_read(
            &resolved.table,
            &resolved.column.field,
            prefix.as_deref(),
            &mut guards,
        )?;
        Ok(guards)
    }

    fn guard_read(
        &self,
        collection: &str,
        field: &str,
        prefix: Option<&str>,
        guards: &mut Vec<FilterNode>,
    ) -> Result<(), QueryError> {
        let permissions = self.permissions(collection)?;
        if !permissions.allows_field(field) {
            return Err(forbidden_field_error(collection, field));
        }
        let indices = permissions.field_cases(field);
        if indices.is_empty() {
            return Ok(());
        }
        let visible = FilterNode::or(indices.iter().map(|index| permissions.cases[*index].clone()));
        guards.push(match prefix {
            Some(prefix) => prefixed(visible, prefix)?,
            None => visible,
        });
        Ok(())
    }
}

/// Fields of the current level a node exposes.
fn guarded_fields(node: &FieldNode) -> Vec<String> {
    match node {
        FieldNode::Primitive { field, .. } | FieldNode::Function { field, .. } => {
            vec![field.clone()]
        }
        FieldNode::Relational(relational) => match &relational.join {
            RelationalJoin::ManyToOne(join) => join.local.clone(),
            RelationalJoin::AnyToOne(join) => {
                let mut fields = join.local.clone();
                fields.push(join.collection_field.clone());
                fields
            }
            RelationalJoin::OneToMany(_) | RelationalJoin::OneToAny(_) => {
                vec![relational.alias.clone()]
            }
        },
    }
}

/// Field paths a filter reads, relative to the level it applies to.
fn filter_paths(filter: &FilterNode, paths: &mut Vec<String>) {
    match filter {
        FilterNode::Constant { .. } => {}
        FilterNode::Logical(logical) => {
            for child in &logical.children {
                filter_paths(child, paths);
            }
        }
        FilterNode::Condition(condition) => {
            match &condition.target {
                FilterTarget::Field { path } => paths.push(path.clone()),
                FilterTarget::Function { field, .. } => paths.push(field.clone()),
            }
            if let CompareTo::Field { path } = &condition.compare_to {
                paths.push(path.clone());
            }
        }
    }
}

fn sort_path(order: &SortNode) -> Result<String, QueryError> {
    Ok(match Function::parse_call(&order.field)? {
        Some((_, field)) => field,
        None => order.field.clone(),
    })
}

/// Rebases a filter written against a related collection onto the path that reaches it.
fn prefixed(filter: FilterNode, prefix: &str) -> Result<FilterNode, QueryError> {
    match filter {
        FilterNode::Constant { .. } => Ok(filter),
        FilterNode::Logical(logical) => Ok(FilterNode::Logical(LogicalNode {
            operator: logical.operator,
            negate: logical.negate,
            children: logical
                .children
                .into_iter()
                .map(|child| prefixed(child, prefix))
                .collect::<Result<Vec<_>, _>>()?,
        })),
        FilterNode::Condition(mut condition) => {
            match &mut condition.target {
                FilterTarget::Field { path } => *path = format!("{prefix}.{path}"),
                // functions only target fields of their own level
                FilterTarget::Function { function, .. } => {
                    return Err(unsupported_error(format!(
                        "{}() in the row filter of a collection reached through '{prefix}'",
                        function.as_str()
                    )))
                }
            }
            if let CompareTo::Field { path } = &mut condition.compare_to {
                *path = format!("{prefix}.{path}");
            }
            Ok(FilterNode::Condition(condition))
        }
    }
}

fn restrict(filter: &mut Option<FilterNode>, permissions: &ResolvedPermissions) {
    let Some(row_filter) = &permissions.filter else {
        return;
    };
    *filter = Some(match filter.take() {
        Some(existing) => FilterNode::and([existing, row_filter.clone()]),
        None => row_filter.clone(),
    });
}
