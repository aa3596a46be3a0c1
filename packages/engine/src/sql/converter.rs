use std::collections::{BTreeMap, HashMap};

use crate::config::EngineConfig;
use crate::context::RequestContext;
use crate::error::{unknown_field_error, unsupported_error};
use crate::query::{
    check_function, check_operator, resolve_field_path, AbstractQuery, CompareTo, FieldNode,
    FilterNode, FilterTarget, ForeignTarget, Function, LogicalOperator, Modifiers, Operator,
    RelationStep,
    RelationalJoin, RelationalNode, SortDirection, SortNode,
};
use crate::schema::{FieldMeta, FieldType, SchemaOverview};
use crate::sql::alias::AliasGenerator;
use crate::sql::types::{
    AbstractSqlQuery, AnyToOneBranches, ColumnExpr, ColumnRef, CountQuery, NestedMany,
    NullableObject, SelectColumn, SqlCondition, SqlJoin, SqlOperand, SqlOrder, SqlWhere,
    TableRef,
};
use crate::{QueryError, Value};

/// Lowers a (permission-restricted) abstract query into abstract SQL. To-one relations become
/// LEFT JOINs, to-many relations become nested-many descriptors.
pub fn convert(
    query: &AbstractQuery,
    ctx: &RequestContext,
    config: &EngineConfig,
) -> Result<AbstractSqlQuery, QueryError> {
    if query.store != config.store {
        return Err(unsupported_error(format!(
            "querying store '{}' through the engine of store '{}'",
            query.store, config.store
        )));
    }
    let mut converter = Converter {
        schema: &ctx.schema,
        config,
        related_filters: &query.related_filters,
        aliases: AliasGenerator::default(),
    };
    let sql = converter.level(
        &query.collection,
        &query.fields,
        &query.modifiers,
        &query.cases,
        query.modifiers.limit,
    )?;
    tracing::debug!(
        collection = %query.collection,
        columns = sql.select.len(),
        parameters = sql.parameters.len(),
        nested_manys = sql.nested_manys.len(),
        "converted query"
    );
    Ok(sql)
}

struct Converter<'a> {
    schema: &'a SchemaOverview,
    config: &'a EngineConfig,
    /// ANDed into the ON clause of every join a filter or sort path adds to that collection.
    related_filters: &'a BTreeMap<String, FilterNode>,
    aliases: AliasGenerator,
}

/// One SQL statement under construction.
struct Level {
    query: AbstractSqlQuery,
    /// `(table alias, foreign key field)` to the alias of the join already following it.
    joins: HashMap<(String, String), String>,
}

struct ResolvedColumn {
    column: ColumnRef,
    collection: String,
    meta: FieldMeta,
}

/// Where a filter's field paths resolve from.
#[derive(Clone, Copy)]
struct Scope<'s> {
    table: &'s str,
    collection: &'s str,
    /// Joins cannot be added inside a JOIN's own ON clause or a correlated sub-query.
    joins: bool,
}

impl Converter<'_> {
    fn level(
        &mut self,
        collection: &str,
        nodes: &[FieldNode],
        modifiers: &Modifiers,
        cases: &[FilterNode],
        limit: Option<u64>,
    ) -> Result<AbstractSqlQuery, QueryError> {
        let primary = self.schema.primary_key(collection)?.to_string();
        let from = TableRef {
            table: collection.to_string(),
            alias: self.aliases.next(collection),
        };
        let table = from.alias.clone();
        let mut level = Level {
            query: AbstractSqlQuery::new(from),
            joins: HashMap::new(),
        };
        let scope = Scope {
            table: &table,
            collection,
            joins: true,
        };

        self.select_nodes(&mut level, scope, None, nodes, cases)?;

        if let Some(filter) = &modifiers.filter {
            filter.validate()?;
            let lowered = self.lower_filter(&mut level, scope, filter)?;
            level.query.where_clause = Some(lowered);
        }

        for sort in &modifiers.sort {
            let order = self.lower_sort(&mut level, scope, sort)?;
            level.query.order.push(order);
        }
        if level.query.order.is_empty() && (limit.is_some() || modifiers.offset.is_some()) {
            // pages need a stable order
            level.query.order.push(SqlOrder {
                expr: ColumnExpr::Column(ColumnRef::new(table.clone(), primary)),
                direction: SortDirection::Ascending,
            });
        }

        if let Some(limit) = limit {
            level.query.limit = Some(level.query.push_parameter(count_value(limit, "limit")?));
        }
        if let Some(offset) = modifiers.offset {
            level.query.offset = Some(level.query.push_parameter(count_value(offset, "offset")?));
        }
        Ok(level.query)
    }

    fn select_nodes(
        &mut self,
        level: &mut Level,
        scope: Scope<'_>,
        prefix: Option<&str>,
        nodes: &[FieldNode],
        cases: &[FilterNode],
    ) -> Result<(), QueryError> {
        for node in nodes {
            match node {
                FieldNode::Primitive {
                    field,
                    alias,
                    when_case,
                } => {
                    let meta = self.schema.field(scope.collection, field)?;
                    if meta.field_type == FieldType::Alias {
                        return Err(unknown_field_error(scope.collection, field));
                    }
                    let column = ColumnRef::new(scope.table, field.clone());
                    let expr = if meta.field_type.is_geometry() {
                        ColumnExpr::Geometry(column)
                    } else {
                        ColumnExpr::Column(column)
                    };
                    let expr = self.guard(level, scope, when_case, cases, expr)?;
                    self.push_visible(level, field, expr, &qualify(prefix, alias), alias);
                }
                FieldNode::Function {
                    function,
                    field,
                    alias,
                    when_case,
                    filter,
                } => {
                    let expr =
                        self.function_column(level, scope, *function, field, filter.as_ref())?;
                    let expr = self.guard(level, scope, when_case, cases, expr)?;
                    self.push_visible(level, alias, expr, &qualify(prefix, alias), alias);
                }
                FieldNode::Relational(relational) => {
                    relational.join.validate(&relational.alias)?;
                    self.select_relational(level, scope, prefix, relational, cases)?;
                }
            }
        }
        Ok(())
    }

    fn select_relational(
        &mut self,
        level: &mut Level,
        scope: Scope<'_>,
        prefix: Option<&str>,
        node: &RelationalNode,
        cases: &[FilterNode],
    ) -> Result<(), QueryError> {
        let path = qualify(prefix, &node.alias);
        match &node.join {
            RelationalJoin::ManyToOne(join) => {
                self.check_store(&join.foreign)?;
                let related = join.foreign.collection.as_str();
                let joined = self.aliases.next(related);
                let pairs = join
                    .foreign
                    .fields
                    .iter()
                    .zip(&join.local)
                    .map(|(foreign, local)| {
                        column_equals(
                            ColumnRef::new(joined.clone(), foreign.clone()),
                            ColumnRef::new(scope.table, local.clone()),
                            false,
                        )
                    })
                    .collect::<Vec<_>>();
                let mut on = SqlWhere::all(pairs);
                if let Some(filter) = &node.modifiers.filter {
                    filter.validate()?;
                    let related_scope = Scope {
                        table: &joined,
                        collection: related,
                        joins: false,
                    };
                    on = on.and(self.lower_filter(level, related_scope, filter)?);
                }
                // the related object only joins on rows its foreign key is visible on
                if let Some(visible) = self.visibility(level, scope, &node.when_case, cases)? {
                    on = on.and(visible);
                }
                level.query.joins.push(SqlJoin {
                    table: TableRef {
                        table: related.to_string(),
                        alias: joined.clone(),
                    },
                    on,
                });
                if let [local] = join.local.as_slice() {
                    level
                        .joins
                        .entry((scope.table.to_string(), local.clone()))
                        .or_insert_with(|| joined.clone());
                }

                let key_aliases = join
                    .foreign
                    .fields
                    .iter()
                    .map(|field| self.push_hidden(level, &joined, field))
                    .collect();
                level.query.nullable_objects.push(NullableObject {
                    path: path.clone(),
                    key_aliases,
                });

                let related_scope = Scope {
                    table: &joined,
                    collection: related,
                    joins: true,
                };
                self.select_nodes(level, related_scope, Some(&path), &node.nodes, &node.cases)
            }
            RelationalJoin::AnyToOne(join) => {
                let discriminator = self.push_hidden(level, scope.table, &join.collection_field);
                let mut candidates = Vec::with_capacity(join.candidates.len());
                for candidate in &join.candidates {
                    self.check_store(&candidate.foreign)?;
                    let related = candidate.foreign.collection.as_str();
                    let joined = self.aliases.next(related);
                    let index = level.query.push_parameter(Value::Text(related.to_string()));
                    let mut conditions = vec![SqlWhere::Condition(SqlCondition {
                        target: ColumnExpr::Column(ColumnRef::new(
                            scope.table,
                            join.collection_field.clone(),
                        )),
                        operator: Operator::Eq,
                        negate: false,
                        compare_to: SqlOperand::Parameters(vec![index]),
                    })];
                    // the local key column holds every candidate's key as text
                    conditions.extend(join.local.iter().zip(&candidate.foreign.fields).map(
                        |(local, foreign)| {
                            column_equals(
                                ColumnRef::new(scope.table, local.clone()),
                                ColumnRef::new(joined.clone(), foreign.clone()),
                                true,
                            )
                        },
                    ));
                    let mut on = SqlWhere::all(conditions);
                    if let Some(filter) = &candidate.filter {
                        filter.validate()?;
                        let related_scope = Scope {
                            table: &joined,
                            collection: related,
                            joins: false,
                        };
                        on = on.and(self.lower_filter(level, related_scope, filter)?);
                    }
                    if let Some(visible) = self.visibility(level, scope, &node.when_case, cases)? {
                        on = on.and(visible);
                    }
                    level.query.joins.push(SqlJoin {
                        table: TableRef {
                            table: related.to_string(),
                            alias: joined.clone(),
                        },
                        on,
                    });

                    let branch = qualify(prefix, &format!("{}:{related}", node.alias));
                    let key_aliases = candidate
                        .foreign
                        .fields
                        .iter()
                        .map(|field| self.push_hidden(level, &joined, field))
                        .collect();
                    level.query.nullable_objects.push(NullableObject {
                        path: branch.clone(),
                        key_aliases,
                    });
                    let related_scope = Scope {
                        table: &joined,
                        collection: related,
                        joins: true,
                    };
                    self.select_nodes(
                        level,
                        related_scope,
                        Some(&branch),
                        &candidate.nodes,
                        &candidate.cases,
                    )?;
                    candidates.push(related.to_string());
                }
                level.query.any_to_ones.push(AnyToOneBranches {
                    path,
                    discriminator,
                    candidates,
                });
                Ok(())
            }
            RelationalJoin::OneToMany(join) => {
                self.check_store(&join.foreign)?;
                let template = self.nested_template(node, &join.foreign.collection)?;
                let target = NestedTarget {
                    local: &join.local,
                    foreign: &join.foreign,
                    keys_as_text: false,
                };
                self.push_nested(level, scope, path, target, template, &node.when_case, cases)
            }
            RelationalJoin::OneToAny(join) => {
                self.check_store(&join.foreign)?;
                let mut template = self.nested_template(node, &join.foreign.collection)?;
                let index = template.push_parameter(Value::Text(scope.collection.to_string()));
                let discriminator = SqlWhere::Condition(SqlCondition {
                    target: ColumnExpr::Column(ColumnRef::new(
                        template.from.alias.clone(),
                        join.collection_field.clone(),
                    )),
                    operator: Operator::Eq,
                    negate: false,
                    compare_to: SqlOperand::Parameters(vec![index]),
                });
                template.where_clause = Some(match template.where_clause.take() {
                    Some(existing) => existing.and(discriminator),
                    None => discriminator,
                });
                let target = NestedTarget {
                    local: &join.local,
                    foreign: &join.foreign,
                    keys_as_text: true,
                };
                self.push_nested(level, scope, path, target, template, &node.when_case, cases)
            }
        }
    }

    fn nested_template(
        &mut self,
        node: &RelationalNode,
        collection: &str,
    ) -> Result<AbstractSqlQuery, QueryError> {
        let limit = node.modifiers.limit.or(self.config.default_nested_limit);
        self.level(collection, &node.nodes, &node.modifiers, &node.cases, limit)
    }

    /// Parents outside `when_case` select NULL keys, so their children are never fetched.
    #[allow(clippy::too_many_arguments)]
    fn push_nested(
        &mut self,
        level: &mut Level,
        scope: Scope<'_>,
        path: String,
        target: NestedTarget<'_>,
        template: AbstractSqlQuery,
        when_case: &[usize],
        cases: &[FilterNode],
    ) -> Result<(), QueryError> {
        let position = level.query.select.len();
        let mut local_aliases = Vec::with_capacity(target.local.len());
        for field in target.local {
            let key = ColumnExpr::Column(ColumnRef::new(scope.table, field.clone()));
            let expr = self.guard(level, scope, when_case, cases, key)?;
            local_aliases.push(self.push_hidden_expr(level, field, expr));
        }
        level.query.nested_manys.push(NestedMany {
            path,
            collection: target.foreign.collection.clone(),
            local_aliases,
            foreign_fields: target.foreign.fields.clone(),
            position,
            keys_as_text: target.keys_as_text,
            guarded: !when_case.is_empty(),
            template,
        });
        Ok(())
    }

    fn function_column(
        &mut self,
        level: &mut Level,
        scope: Scope<'_>,
        function: Function,
        field: &str,
        filter: Option<&FilterNode>,
    ) -> Result<ColumnExpr, QueryError> {
        let relation = check_function(self.schema, scope.collection, field, function)?;
        let Some(relation) = relation else {
            return Ok(ColumnExpr::Function {
                function,
                column: ColumnRef::new(scope.table, field),
            });
        };

        let related = relation.many_collection.clone();
        let from = TableRef {
            table: related.clone(),
            alias: self.aliases.next(&related),
        };
        let primary = self.schema.primary_key(scope.collection)?;
        let correlation = vec![(
            relation.many_field.clone(),
            ColumnRef::new(scope.table, primary),
        )];
        let where_clause = match filter {
            Some(filter) => {
                filter.validate()?;
                let counted = Scope {
                    table: &from.alias,
                    collection: &related,
                    joins: false,
                };
                Some(self.lower_filter(level, counted, filter)?)
            }
            None => None,
        };
        Ok(ColumnExpr::Count(Box::new(CountQuery {
            from,
            correlation,
            where_clause,
        })))
    }

    fn lower_cases(
        &mut self,
        level: &mut Level,
        scope: Scope<'_>,
        when_case: &[usize],
        cases: &[FilterNode],
    ) -> Result<Vec<SqlWhere>, QueryError> {
        let mut lowered = Vec::with_capacity(when_case.len());
        for index in when_case {
            let case = cases.get(*index).ok_or_else(|| {
                QueryError::InvalidQuery(format!("case index {index} is out of range"))
            })?;
            case.validate()?;
            lowered.push(self.lower_filter(level, scope, case)?);
        }
        Ok(lowered)
    }

    /// Wraps `expr` in `CASE WHEN` when the field is only visible on rows matching some cases.
    fn guard(
        &mut self,
        level: &mut Level,
        scope: Scope<'_>,
        when_case: &[usize],
        cases: &[FilterNode],
        expr: ColumnExpr,
    ) -> Result<ColumnExpr, QueryError> {
        if when_case.is_empty() {
            return Ok(expr);
        }
        Ok(ColumnExpr::CaseWhen {
            cases: self.lower_cases(level, scope, when_case, cases)?,
            then: Box::new(expr),
        })
    }

    /// The rows a partially granted relation is visible on, `None` when it is visible on all.
    fn visibility(
        &mut self,
        level: &mut Level,
        scope: Scope<'_>,
        when_case: &[usize],
        cases: &[FilterNode],
    ) -> Result<Option<SqlWhere>, QueryError> {
        if when_case.is_empty() {
            return Ok(None);
        }
        let mut lowered = self.lower_cases(level, scope, when_case, cases)?;
        Ok(Some(if lowered.len() == 1 {
            lowered.remove(0)
        } else {
            SqlWhere::Logical {
                operator: LogicalOperator::Or,
                negate: false,
                children: lowered,
            }
        }))
    }

    fn push_visible(
        &mut self,
        level: &mut Level,
        name: &str,
        expr: ColumnExpr,
        path: &str,
        original: &str,
    ) {
        let alias = self.aliases.next(name);
        level.query.aliases.insert(alias.clone(), original.to_string());
        level.query.paths.insert(alias.clone(), path.to_string());
        level.query.select.push(SelectColumn { expr, alias });
    }

    /// Selects a key column the assembler needs but the caller never sees.
    fn push_hidden(&mut self, level: &mut Level, table: &str, field: &str) -> String {
        self.push_hidden_expr(level, field, ColumnExpr::Column(ColumnRef::new(table, field)))
    }

    fn push_hidden_expr(&mut self, level: &mut Level, field: &str, expr: ColumnExpr) -> String {
        let alias = self.aliases.next(field);
        level.query.aliases.insert(alias.clone(), field.to_string());
        level.query.select.push(SelectColumn {
            expr,
            alias: alias.clone(),
        });
        alias
    }

    fn lower_filter(
        &mut self,
        level: &mut Level,
        scope: Scope<'_>,
        filter: &FilterNode,
    ) -> Result<SqlWhere, QueryError> {
        match filter {
            FilterNode::Constant { value } => Ok(SqlWhere::Constant(*value)),
            FilterNode::Logical(logical) => {
                let children = logical
                    .children
                    .iter()
                    .map(|child| self.lower_filter(level, scope, child))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(SqlWhere::Logical {
                    operator: logical.operator,
                    negate: logical.negate,
                    children,
                })
            }
            FilterNode::Condition(condition) => {
                let operator = condition.operator;
                let target = match &condition.target {
                    FilterTarget::Field { path } => {
                        let resolved = self.resolve_column(level, scope, path)?;
                        check_operator(&resolved.collection, &resolved.meta, operator)?;
                        ColumnExpr::Column(resolved.column)
                    }
                    FilterTarget::Function { function, field } => {
                        if *function == Function::Count {
                            return Err(unsupported_error("count() as a filter target"));
                        }
                        if operator.is_pattern() || operator == Operator::Intersects {
                            return Err(unsupported_error(format!(
                                "operator '{}' on {}()",
                                operator.as_str(),
                                function.as_str()
                            )));
                        }
                        check_function(self.schema, scope.collection, field, *function)?;
                        ColumnExpr::Function {
                            function: *function,
                            column: ColumnRef::new(scope.table, field.clone()),
                        }
                    }
                };

                let compare_to = match &condition.compare_to {
                    CompareTo::Values { .. } if operator == Operator::Null => SqlOperand::Nothing,
                    CompareTo::Values { values } if operator == Operator::In && values.is_empty() => {
                        return Ok(SqlWhere::Constant(condition.negate));
                    }
                    CompareTo::Values { values } => SqlOperand::Parameters(
                        values
                            .iter()
                            .map(|value| level.query.push_parameter(value.clone()))
                            .collect(),
                    ),
                    CompareTo::Field { path } => {
                        if operator.is_pattern() || operator == Operator::In {
                            return Err(unsupported_error(format!(
                                "operator '{}' against another field",
                                operator.as_str()
                            )));
                        }
                        SqlOperand::Column {
                            column: self.resolve_column(level, scope, path)?.column,
                            cast_text: false,
                        }
                    }
                };

                Ok(SqlWhere::Condition(SqlCondition {
                    target,
                    operator,
                    negate: condition.negate,
                    compare_to,
                }))
            }
        }
    }

    fn lower_sort(
        &mut self,
        level: &mut Level,
        scope: Scope<'_>,
        sort: &SortNode,
    ) -> Result<SqlOrder, QueryError> {
        let expr = match Function::parse_call(&sort.field)? {
            Some((Function::Count, _)) => return Err(unsupported_error("sorting by count()")),
            Some((function, field)) => {
                check_function(self.schema, scope.collection, &field, function)?;
                ColumnExpr::Function {
                    function,
                    column: ColumnRef::new(scope.table, field),
                }
            }
            None => {
                let resolved = self.resolve_column(level, scope, &sort.field)?;
                if resolved.meta.field_type.is_geometry() {
                    return Err(unsupported_error(format!(
                        "sorting by geometry field '{}'",
                        sort.field
                    )));
                }
                ColumnExpr::Column(resolved.column)
            }
        };
        Ok(SqlOrder {
            expr,
            direction: sort.direction,
        })
    }

    /// Resolves a dotted path to a column reference, joining every many-to-one hop once.
    fn resolve_column(
        &mut self,
        level: &mut Level,
        scope: Scope<'_>,
        path: &str,
    ) -> Result<ResolvedColumn, QueryError> {
        let resolved = resolve_field_path(self.schema, scope.collection, path)?;
        if !resolved.steps.is_empty() && !scope.joins {
            return Err(unsupported_error(format!(
                "relational path '{path}' inside a joined relation's or count()'s filter"
            )));
        }
        let table = self.join_chain(level, scope.table, &resolved.steps)?;
        Ok(ResolvedColumn {
            column: ColumnRef::new(table, resolved.column.field.clone()),
            collection: resolved.table,
            meta: resolved.column,
        })
    }

    fn join_chain(
        &mut self,
        level: &mut Level,
        table: &str,
        steps: &[RelationStep],
    ) -> Result<String, QueryError> {
        let related_filters = self.related_filters;
        let mut current = table.to_string();
        for step in steps {
            let key = (current.clone(), step.field.clone());
            if let Some(existing) = level.joins.get(&key) {
                current = existing.clone();
                continue;
            }
            let joined = self.aliases.next(&step.to);
            let mut on = column_equals(
                ColumnRef::new(joined.clone(), step.foreign.clone()),
                ColumnRef::new(current.clone(), step.field.clone()),
                false,
            );
            if let Some(filter) = related_filters.get(&step.to) {
                filter.validate()?;
                let related_scope = Scope {
                    table: &joined,
                    collection: &step.to,
                    joins: false,
                };
                on = on.and(self.lower_filter(level, related_scope, filter)?);
            }
            level.query.joins.push(SqlJoin {
                table: TableRef {
                    table: step.to.clone(),
                    alias: joined.clone(),
                },
                on,
            });
            level.joins.insert(key, joined.clone());
            current = joined;
        }
        Ok(current)
    }

    fn check_store(&self, target: &ForeignTarget) -> Result<(), QueryError> {
        if target.store == self.config.store {
            return Ok(());
        }
        Err(unsupported_error(format!(
            "joining collection '{}' of store '{}' into store '{}'",
            target.collection, target.store, self.config.store
        )))
    }
}

/// Key columns of a to-many relation and the child fields they pair with.
struct NestedTarget<'t> {
    local: &'t [String],
    foreign: &'t ForeignTarget,
    keys_as_text: bool,
}

fn qualify(prefix: Option<&str>, name: &str) -> String {
    match prefix {
        Some(prefix) => format!("{prefix}.{name}"),
        None => name.to_string(),
    }
}

fn column_equals(left: ColumnRef, right: ColumnRef, cast_text: bool) -> SqlWhere {
    SqlWhere::Condition(SqlCondition {
        target: ColumnExpr::Column(left),
        operator: Operator::Eq,
        negate: false,
        compare_to: SqlOperand::Column {
            column: right,
            cast_text,
        },
    })
}

fn count_value(value: u64, modifier: &str) -> Result<Value, QueryError> {
    i64::try_from(value)
        .map(Value::Integer)
        .map_err(|_| QueryError::InvalidQuery(format!("{modifier} {value} is out of range")))
}
